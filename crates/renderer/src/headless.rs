//! Deterministic software backend.
//!
//! `HeadlessBackend` implements the full [`Backend`] contract without a
//! GPU. Every draw fills its target with a colour derived from the program
//! and the uniform values (including the pixels of bound textures), so two
//! draws look the same exactly when their inputs are the same. Each draw is
//! recorded for inspection and live objects are counted so tests can check
//! that nothing leaks.
//!
//! A `#error message` line in any fragment fails compilation with a marker
//! at that line.

use std::collections::{BTreeMap, HashMap};

use crate::backend::{
    Backend, BackendError, LinkedProgram, ProgramId, ShaderId, TargetId, TextureDesc, TextureId,
    TextureStore, UniformValues,
};
use crate::compile::{CompileError, LinkError};
use crate::glsl::UniformTable;
use crate::types::{RasterImage, Stage};

/// One recorded draw call.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawRecord {
    pub program: ProgramId,
    pub target: TargetId,
    pub uniforms: UniformValues,
    /// First texel of every texture bound to a sampler, by sampler name.
    pub samples: BTreeMap<String, [u8; 4]>,
    /// Colour the target was filled with.
    pub fill: [u8; 4],
}

#[derive(Clone, Debug)]
struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Surface {
    fn new(width: u32, height: u32) -> Result<Self, BackendError> {
        if width == 0 || height == 0 {
            return Err(BackendError::InvalidSize { width, height });
        }
        Ok(Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        })
    }
}

#[derive(Debug)]
struct CompiledStage {
    stage: Stage,
    sources: Vec<String>,
}

#[derive(Debug)]
struct HeadlessProgram {
    table: UniformTable,
    fingerprint: u64,
}

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    next_id: u64,
    targets: HashMap<TargetId, Surface>,
    textures: HashMap<TextureId, Surface>,
    shaders: HashMap<ShaderId, CompiledStage>,
    programs: HashMap<ProgramId, HeadlessProgram>,
    pending: HashMap<TargetId, Surface>,
    draws: Vec<DrawRecord>,
    fail_draws: bool,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn clear_draws(&mut self) {
        self.draws.clear();
    }

    pub fn live_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_shaders(&self) -> usize {
        self.shaders.len()
    }

    pub fn texture_pixels(&self, texture: TextureId) -> Option<&[u8]> {
        self.textures
            .get(&texture)
            .map(|surface| surface.pixels.as_slice())
    }

    /// Makes every following draw fail, as a lost device would.
    pub fn fail_draws(&mut self, fail: bool) {
        self.fail_draws = fail;
    }
}

fn fnv1a(hash: &mut u64, bytes: &[u8]) {
    for byte in bytes {
        *hash ^= u64::from(*byte);
        *hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

impl TextureStore for HeadlessBackend {
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: &[u8],
    ) -> Result<TextureId, BackendError> {
        let mut surface = Surface::new(desc.width, desc.height)?;
        if pixels.len() != desc.byte_len() {
            return Err(BackendError::PixelSize {
                width: desc.width,
                height: desc.height,
                expected: desc.byte_len(),
                actual: pixels.len(),
            });
        }
        surface.pixels.copy_from_slice(pixels);
        let id = TextureId::from_raw(self.next_id());
        self.textures.insert(id, surface);
        Ok(id)
    }

    fn release_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_none() {
            tracing::warn!(%texture, "released unknown texture");
        }
    }
}

impl Backend for HeadlessBackend {
    fn create_target(&mut self, width: u32, height: u32) -> Result<TargetId, BackendError> {
        let surface = Surface::new(width, height)?;
        let id = TargetId::from_raw(self.next_id());
        self.targets.insert(id, surface);
        Ok(id)
    }

    fn destroy_target(&mut self, target: TargetId) {
        self.pending.remove(&target);
        self.targets.remove(&target);
    }

    fn compile_stage(
        &mut self,
        stage: Stage,
        fragments: &[String],
    ) -> Result<ShaderId, CompileError> {
        let mut log = String::new();
        for (index, fragment) in fragments.iter().enumerate() {
            for (line, text) in fragment.lines().enumerate() {
                if let Some(message) = text.trim_start().strip_prefix("#error") {
                    log.push_str(&format!(
                        "{index}:{}(1): error: {}\n",
                        line + 1,
                        message.trim()
                    ));
                }
            }
        }
        if !log.is_empty() {
            return Err(CompileError::from_log(stage, fragments, log));
        }

        let id = ShaderId::from_raw(self.next_id());
        self.shaders.insert(
            id,
            CompiledStage {
                stage,
                sources: fragments.to_vec(),
            },
        );
        Ok(id)
    }

    fn delete_shader(&mut self, shader: ShaderId) {
        self.shaders.remove(&shader);
    }

    fn link_program(&mut self, shaders: &[ShaderId]) -> Result<LinkedProgram, LinkError> {
        let mut stages: BTreeMap<Stage, &CompiledStage> = BTreeMap::new();
        for shader in shaders {
            let compiled = self
                .shaders
                .get(shader)
                .ok_or_else(|| LinkError::new(format!("unknown {shader}")))?;
            if stages.insert(compiled.stage, compiled).is_some() {
                return Err(LinkError::new(format!(
                    "more than one {} stage",
                    compiled.stage
                )));
            }
        }

        let mut fingerprint = FNV_OFFSET;
        let mut sources: Vec<&[String]> = Vec::new();
        for stage in [Stage::Vertex, Stage::Fragment] {
            let compiled = stages
                .get(&stage)
                .ok_or_else(|| LinkError::new(format!("program has no {stage} stage")))?;
            if !compiled.sources.iter().any(|source| source.contains("main")) {
                return Err(LinkError::new(format!(
                    "{stage} stage does not define main"
                )));
            }
            for source in &compiled.sources {
                fnv1a(&mut fingerprint, source.as_bytes());
            }
            sources.push(&compiled.sources);
        }
        let table = UniformTable::from_stages(&sources).map_err(LinkError::new)?;

        let id = ProgramId::from_raw(self.next_id());
        self.programs.insert(
            id,
            HeadlessProgram {
                table: table.clone(),
                fingerprint,
            },
        );
        Ok(LinkedProgram {
            id,
            uniforms: table,
        })
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn draw(
        &mut self,
        program: ProgramId,
        target: TargetId,
        uniforms: &UniformValues,
    ) -> Result<(), BackendError> {
        if self.fail_draws {
            return Err(BackendError::Device("device lost".to_string()));
        }
        let linked = self
            .programs
            .get(&program)
            .ok_or_else(|| BackendError::unknown(program))?;
        if !self.targets.contains_key(&target) {
            return Err(BackendError::unknown(target));
        }

        let encoded = linked.table.encode(uniforms);
        let mut hash = linked.fingerprint;
        fnv1a(&mut hash, &encoded.block);
        let mut samples = BTreeMap::new();
        for (name, texture) in linked.table.samplers().iter().zip(&encoded.textures) {
            match texture {
                Some(texture) => {
                    let surface = self
                        .textures
                        .get(texture)
                        .ok_or_else(|| BackendError::unknown(texture))?;
                    fnv1a(&mut hash, &surface.pixels);
                    let mut first = [0; 4];
                    first.copy_from_slice(&surface.pixels[..4]);
                    samples.insert(name.clone(), first);
                }
                None => fnv1a(&mut hash, &[0]),
            }
        }

        let bytes = hash.to_le_bytes();
        let fill = [bytes[0], bytes[1], bytes[2], 255];
        if let Some(surface) = self.targets.get_mut(&target) {
            for pixel in surface.pixels.chunks_exact_mut(4) {
                pixel.copy_from_slice(&fill);
            }
        }
        self.draws.push(DrawRecord {
            program,
            target,
            uniforms: uniforms.clone(),
            samples,
            fill,
        });
        Ok(())
    }

    fn begin_readback(&mut self, target: TargetId) -> Result<(), BackendError> {
        let surface = self
            .targets
            .get(&target)
            .ok_or_else(|| BackendError::unknown(target))?
            .clone();
        self.pending.insert(target, surface);
        Ok(())
    }

    fn finish_readback(&mut self, target: TargetId) -> Result<RasterImage, BackendError> {
        let surface = self
            .pending
            .remove(&target)
            .ok_or(BackendError::NoPendingReadback(target))?;
        RasterImage::from_raw(surface.width, surface.height, surface.pixels)
            .ok_or_else(|| BackendError::Readback(format!("malformed pixels for {target}")))
    }

    fn snapshot_target(&mut self, target: TargetId) -> Result<TextureId, BackendError> {
        let surface = self
            .targets
            .get(&target)
            .ok_or_else(|| BackendError::unknown(target))?
            .clone();
        let id = TextureId::from_raw(self.next_id());
        self.textures.insert(id, surface);
        Ok(id)
    }
}
