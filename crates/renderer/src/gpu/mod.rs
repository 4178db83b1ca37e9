//! `wgpu` implementation of [`Backend`].
//!
//! - `context` opens a surfaceless instance, adapter and device.
//! - `pipeline` turns translated GLSL into a render pipeline with a std140
//!   uniform block in group 0 and texture/sampler pairs in group 1.
//! - `readback` owns the padded staging buffer behind each target.
//!
//! Stages are parsed by naga's GLSL frontend when they are compiled so
//! syntax errors surface early with fragment/line markers. Linking merges
//! the uniform declarations of both stages, rewrites them against the
//! merged table and validates the result before creating the pipeline.

mod context;
mod pipeline;
mod readback;

use std::collections::{BTreeMap, HashMap};

use wgpu::naga::front::glsl::{Frontend, Options, ParseErrors};
use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};
use wgpu::naga::ShaderStage;
use wgpu::util::{DeviceExt, TextureDataOrder};

use crate::backend::{
    Backend, BackendError, Filter, LinkedProgram, ProgramId, ShaderId, TargetId, TextureDesc,
    TextureId, TextureStore, UniformValues, Wrap,
};
use crate::compile::{CompileError, ErrorMarker, LinkError};
use crate::glsl::{translate_stage, varying_locations, vertex_inputs, TranslatedStage, UniformTable};
use crate::types::{RasterImage, Stage};

pub use context::GpuPowerPreference;

use context::GpuContext;
use pipeline::{ProgramPipeline, TextureBinding, TARGET_FORMAT};
use readback::Staging;

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

impl GpuTexture {
    fn binding(&self) -> TextureBinding<'_> {
        TextureBinding {
            view: &self.view,
            sampler: &self.sampler,
        }
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        self.texture.destroy();
    }
}

struct GpuTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    staging: Option<Staging>,
}

impl Drop for GpuTarget {
    fn drop(&mut self) {
        self.texture.destroy();
    }
}

struct CompiledStage {
    stage: Stage,
    fragments: Vec<String>,
}

/// Renders on the default GPU adapter without a window.
pub struct WgpuBackend {
    context: GpuContext,
    quad: wgpu::Buffer,
    placeholder: GpuTexture,
    next_id: u64,
    targets: HashMap<TargetId, GpuTarget>,
    textures: HashMap<TextureId, GpuTexture>,
    shaders: HashMap<ShaderId, CompiledStage>,
    programs: HashMap<ProgramId, ProgramPipeline>,
}

impl WgpuBackend {
    pub fn new() -> Result<Self, BackendError> {
        Self::with_power_preference(GpuPowerPreference::default())
    }

    pub fn with_power_preference(power: GpuPowerPreference) -> Result<Self, BackendError> {
        let context = GpuContext::headless(power)?;
        let quad = pipeline::quad_buffer(&context.device);
        let placeholder = upload(
            &context,
            "placeholder texture",
            &TextureDesc::new(1, 1),
            &[0, 0, 0, 255],
        );
        Ok(Self {
            context,
            quad,
            placeholder,
            next_id: 0,
            targets: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            programs: HashMap::new(),
        })
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_size(&self, width: u32, height: u32) -> Result<(), BackendError> {
        let max = self.context.max_dimension;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(BackendError::InvalidSize { width, height });
        }
        Ok(())
    }

    fn target(&self, target: TargetId) -> Result<&GpuTarget, BackendError> {
        self.targets
            .get(&target)
            .ok_or_else(|| BackendError::unknown(target))
    }
}

fn upload(context: &GpuContext, label: &str, desc: &TextureDesc, pixels: &[u8]) -> GpuTexture {
    let texture = context.device.create_texture_with_data(
        &context.queue,
        &wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(desc.width, desc.height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        },
        TextureDataOrder::LayerMajor,
        pixels,
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let sampler = sampler(&context.device, desc);
    GpuTexture {
        texture,
        view,
        sampler,
    }
}

fn sampler(device: &wgpu::Device, desc: &TextureDesc) -> wgpu::Sampler {
    let address_mode = match desc.wrap {
        Wrap::Repeat => wgpu::AddressMode::Repeat,
        Wrap::Clamp => wgpu::AddressMode::ClampToEdge,
    };
    let filter = match desc.filter {
        Filter::Nearest => wgpu::FilterMode::Nearest,
        Filter::Linear => wgpu::FilterMode::Linear,
    };
    device.create_sampler(&wgpu::SamplerDescriptor {
        address_mode_u: address_mode,
        address_mode_v: address_mode,
        address_mode_w: address_mode,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

fn naga_stage(stage: Stage) -> ShaderStage {
    match stage {
        Stage::Vertex => ShaderStage::Vertex,
        Stage::Fragment => ShaderStage::Fragment,
    }
}

/// Maps naga's byte spans back onto the caller's fragments.
fn compile_error(
    stage: Stage,
    fragments: &[String],
    translated: &TranslatedStage,
    errors: &ParseErrors,
) -> CompileError {
    let mut log = String::new();
    let mut markers = Vec::new();
    for error in &errors.errors {
        let message = error.kind.to_string();
        let location = error
            .meta
            .to_range()
            .and_then(|range| translated.locate_offset(range.start));
        match location {
            Some((fragment, line, column)) => {
                log.push_str(&format!("{fragment}:{line}({column}): error: {message}\n"));
                markers.push(ErrorMarker {
                    fragment,
                    line,
                    column: Some(column),
                    message,
                });
            }
            None => log.push_str(&format!("error: {message}\n")),
        }
    }
    CompileError::with_markers(stage, fragments, log, markers)
}

/// Parses and validates a translated stage the way pipeline creation will.
fn validate_stage(stage: Stage, translated: &TranslatedStage) -> Result<(), LinkError> {
    let module = Frontend::default()
        .parse(&Options::from(naga_stage(stage)), &translated.source)
        .map_err(|errors| {
            let messages: Vec<_> =
                errors.errors.iter().map(|error| error.kind.to_string()).collect();
            LinkError::new(format!("{stage} stage: {}", messages.join("; ")))
        })?;
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|err| LinkError::new(format!("{stage} stage: {}", err.as_inner())))?;
    Ok(())
}

impl TextureStore for WgpuBackend {
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: &[u8],
    ) -> Result<TextureId, BackendError> {
        self.check_size(desc.width, desc.height)?;
        if pixels.len() != desc.byte_len() {
            return Err(BackendError::PixelSize {
                width: desc.width,
                height: desc.height,
                expected: desc.byte_len(),
                actual: pixels.len(),
            });
        }
        let texture = upload(&self.context, "environment texture", desc, pixels);
        let id = TextureId::from_raw(self.next_id());
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn release_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_none() {
            tracing::warn!(%texture, "released unknown texture");
        }
    }
}

impl Backend for WgpuBackend {
    fn create_target(&mut self, width: u32, height: u32) -> Result<TargetId, BackendError> {
        self.check_size(width, height)?;
        let texture = self.context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("render target"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = TargetId::from_raw(self.next_id());
        self.targets.insert(
            id,
            GpuTarget {
                texture,
                view,
                width,
                height,
                staging: None,
            },
        );
        Ok(id)
    }

    fn destroy_target(&mut self, target: TargetId) {
        if let Some(mut gpu) = self.targets.remove(&target) {
            if let Some(staging) = gpu.staging.as_mut() {
                staging.discard(&self.context.device);
            }
        }
    }

    fn compile_stage(
        &mut self,
        stage: Stage,
        fragments: &[String],
    ) -> Result<ShaderId, CompileError> {
        let table = UniformTable::from_stages(&[fragments])
            .map_err(|message| CompileError::from_log(stage, fragments, message))?;
        let translated = translate_stage(stage, fragments, &table, &BTreeMap::new());
        if let Err(errors) =
            Frontend::default().parse(&Options::from(naga_stage(stage)), &translated.source)
        {
            return Err(compile_error(stage, fragments, &translated, &errors));
        }

        let id = ShaderId::from_raw(self.next_id());
        self.shaders.insert(
            id,
            CompiledStage {
                stage,
                fragments: fragments.to_vec(),
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
                return Err(LinkError::new(format!("more than one {} stage", compiled.stage)));
            }
        }
        let (Some(vertex), Some(fragment)) =
            (stages.get(&Stage::Vertex), stages.get(&Stage::Fragment))
        else {
            return Err(LinkError::new("a program needs one vertex and one fragment stage"));
        };

        let uniforms = UniformTable::from_stages(&[
            vertex.fragments.as_slice(),
            fragment.fragments.as_slice(),
        ])
        .map_err(LinkError::new)?;
        let position = match vertex_inputs(&vertex.fragments).as_slice() {
            [] => None,
            [(_, ty)] if matches!(ty.as_str(), "vec2" | "vec3" | "vec4") => {
                Some(wgpu::VertexFormat::Float32x3)
            }
            [(name, ty)] => {
                return Err(LinkError::new(format!(
                    "vertex input `{name}` has unsupported type {ty}"
                )))
            }
            _ => {
                return Err(LinkError::new(
                    "the vertex stage may declare at most one input",
                ))
            }
        };
        let varyings = varying_locations(&vertex.fragments, &fragment.fragments);
        let vertex_stage = translate_stage(Stage::Vertex, &vertex.fragments, &uniforms, &varyings);
        let fragment_stage =
            translate_stage(Stage::Fragment, &fragment.fragments, &uniforms, &varyings);
        validate_stage(Stage::Vertex, &vertex_stage)?;
        validate_stage(Stage::Fragment, &fragment_stage)?;

        let table = uniforms.clone();
        let program = self
            .context
            .validated(|device| {
                ProgramPipeline::new(
                    device,
                    vertex_stage.source,
                    fragment_stage.source,
                    table,
                    position,
                )
            })
            .map_err(LinkError::new)?;

        let id = ProgramId::from_raw(self.next_id());
        self.programs.insert(id, program);
        tracing::debug!(program = %id, uniforms = uniforms.names().count(), "linked program");
        Ok(LinkedProgram { id, uniforms })
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
        let pipeline = self
            .programs
            .get(&program)
            .ok_or_else(|| BackendError::unknown(program))?;
        let gpu_target = self.target(target)?;
        let encoded = pipeline.uniforms.encode(uniforms);

        let mut bindings = Vec::with_capacity(encoded.textures.len());
        for texture in &encoded.textures {
            let binding = match texture {
                Some(id) => self
                    .textures
                    .get(id)
                    .ok_or_else(|| BackendError::unknown(id))?
                    .binding(),
                None => self.placeholder.binding(),
            };
            bindings.push(binding);
        }

        let context = &self.context;
        let quad = &self.quad;
        context
            .validated(|device| {
                if !encoded.block.is_empty() {
                    context
                        .queue
                        .write_buffer(&pipeline.uniform_buffer, 0, &encoded.block);
                }
                let texture_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("texture bind group"),
                    layout: &pipeline.texture_layout,
                    entries: &pipeline::texture_entries(&bindings),
                });
                let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("draw encoder"),
                });
                {
                    let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("render pass"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &gpu_target.view,
                            depth_slice: None,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        occlusion_query_set: None,
                        timestamp_writes: None,
                    });
                    render_pass.set_pipeline(&pipeline.pipeline);
                    render_pass.set_bind_group(0, &pipeline.uniform_bind_group, &[]);
                    render_pass.set_bind_group(1, &texture_bind_group, &[]);
                    if pipeline.uses_vertices {
                        render_pass.set_vertex_buffer(0, quad.slice(..));
                    }
                    render_pass.draw(0..4, 0..1);
                }
                context.queue.submit(Some(encoder.finish()));
            })
            .map_err(BackendError::Device)
    }

    fn begin_readback(&mut self, target: TargetId) -> Result<(), BackendError> {
        let context = &self.context;
        let gpu = self
            .targets
            .get_mut(&target)
            .ok_or_else(|| BackendError::unknown(target))?;
        let (width, height) = (gpu.width, gpu.height);
        let staging = gpu
            .staging
            .get_or_insert_with(|| Staging::new(&context.device, width, height));
        staging.discard(&context.device);
        staging.begin(&context.device, &context.queue, &gpu.texture);
        Ok(())
    }

    fn finish_readback(&mut self, target: TargetId) -> Result<RasterImage, BackendError> {
        let context = &self.context;
        let gpu = self
            .targets
            .get_mut(&target)
            .ok_or_else(|| BackendError::unknown(target))?;
        match gpu.staging.as_mut() {
            Some(staging) if staging.is_pending() => staging.finish(&context.device),
            _ => Err(BackendError::NoPendingReadback(target)),
        }
    }

    fn snapshot_target(&mut self, target: TargetId) -> Result<TextureId, BackendError> {
        let gpu = self.target(target)?;
        let desc = TextureDesc::new(gpu.width, gpu.height);
        let device = &self.context.device;
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame snapshot"),
            size: extent(gpu.width, gpu.height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("snapshot encoder"),
        });
        encoder.copy_texture_to_texture(
            gpu.texture.as_image_copy(),
            texture.as_image_copy(),
            extent(gpu.width, gpu.height),
        );
        self.context.queue.submit(Some(encoder.finish()));

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = sampler(device, &desc);
        let id = TextureId::from_raw(self.next_id());
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                sampler,
            },
        );
        Ok(id)
    }
}
