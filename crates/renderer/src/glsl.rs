//! GLSL reflection and translation.
//!
//! Environments write sources in the loose desktop/ES GL dialect: plain
//! `uniform` declarations, `attribute`/`varying`, `gl_FragColor`,
//! `texture2D`. This module reflects those declarations into a
//! [`UniformTable`] with std140 offsets and, for APIs that need it, rewrites
//! a stage into Vulkan-flavoured GLSL 450:
//!
//! - plain uniforms move into one std140 block at `set = 0, binding = 0`
//!   and are aliased back to their original names with `#define`,
//! - each `sampler2D` becomes a texture/sampler pair at `set = 1`
//!   (bindings `2n` and `2n + 1`) wrapped in a `sampler2D(...)` macro,
//! - interface variables receive explicit locations,
//! - `#version` and `#pragma` lines are dropped,
//! - the vertex stage negates `gl_Position.y` so the memory layout of the
//!   target matches GL (bottom row first).
//!
//! Rewrites happen in place, one line for one line, so diagnostics on the
//! translated text map straight back to the fragment and line the user
//! wrote.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;

use crate::backend::{TextureId, UniformValue, UniformValues};
use crate::types::Stage;

fn uniform_regex() -> &'static Regex {
    static UNIFORM_REGEX: OnceLock<Regex> = OnceLock::new();
    UNIFORM_REGEX.get_or_init(|| {
        Regex::new(
            r"^\s*uniform\s+(?:(?:lowp|mediump|highp)\s+)?(\w+)\s+(\w+)\s*(?:\[\s*(\d+)\s*\])?\s*;\s*(?://.*)?$",
        )
        .expect("invalid uniform regex")
    })
}

fn interface_regex() -> &'static Regex {
    static INTERFACE_REGEX: OnceLock<Regex> = OnceLock::new();
    INTERFACE_REGEX.get_or_init(|| {
        Regex::new(
            r"^\s*(attribute|varying|in|out)\s+(?:(?:flat|smooth|noperspective)\s+)?(?:(?:lowp|mediump|highp)\s+)?(\w+)\s+(\w+)\s*;\s*(?://.*)?$",
        )
        .expect("invalid interface regex")
    })
}

/// Uniform block member prefix; keeps the aliased names out of user scope.
const MEMBER_PREFIX: &str = "shady_";
const BLOCK_INSTANCE: &str = "shady_uniforms";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GlslType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Int,
    UInt,
    Bool,
    Mat2,
    Mat3,
    Mat4,
    Sampler2D,
}

impl GlslType {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "float" => GlslType::Float,
            "vec2" => GlslType::Vec2,
            "vec3" => GlslType::Vec3,
            "vec4" => GlslType::Vec4,
            "int" => GlslType::Int,
            "uint" => GlslType::UInt,
            "bool" => GlslType::Bool,
            "mat2" => GlslType::Mat2,
            "mat3" => GlslType::Mat3,
            "mat4" => GlslType::Mat4,
            "sampler2D" => GlslType::Sampler2D,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            GlslType::Float => "float",
            GlslType::Vec2 => "vec2",
            GlslType::Vec3 => "vec3",
            GlslType::Vec4 => "vec4",
            GlslType::Int => "int",
            GlslType::UInt => "uint",
            GlslType::Bool => "bool",
            GlslType::Mat2 => "mat2",
            GlslType::Mat3 => "mat3",
            GlslType::Mat4 => "mat4",
            GlslType::Sampler2D => "sampler2D",
        }
    }

    /// `(alignment, size)` in bytes under std140.
    fn std140(self) -> (u32, u32) {
        match self {
            GlslType::Float | GlslType::Int | GlslType::UInt | GlslType::Bool => (4, 4),
            GlslType::Vec2 => (8, 8),
            GlslType::Vec3 => (16, 12),
            GlslType::Vec4 => (16, 16),
            GlslType::Mat2 => (16, 32),
            GlslType::Mat3 => (16, 48),
            GlslType::Mat4 => (16, 64),
            GlslType::Sampler2D => (0, 0),
        }
    }

    pub fn accepts(self, value: &UniformValue) -> bool {
        matches!(
            (self, value),
            (GlslType::Float, UniformValue::Float(_))
                | (GlslType::Vec2, UniformValue::Vec2(_))
                | (GlslType::Vec3, UniformValue::Vec3(_))
                | (GlslType::Vec4, UniformValue::Vec4(_))
                | (GlslType::Int, UniformValue::Int(_))
                | (GlslType::UInt, UniformValue::UInt(_))
                | (GlslType::Bool, UniformValue::Bool(_))
                | (GlslType::Mat2, UniformValue::Mat2(_))
                | (GlslType::Mat3, UniformValue::Mat3(_))
                | (GlslType::Mat4, UniformValue::Mat4(_))
                | (GlslType::Sampler2D, UniformValue::Sampler(_))
        )
    }
}

/// A `uniform` declaration found in a source fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformDecl {
    pub name: String,
    pub ty: GlslType,
    pub array_len: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Qualifier {
    Attribute,
    Varying,
    In,
    Out,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct InterfaceDecl {
    qualifier: Qualifier,
    ty: String,
    name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Line {
    Directive,
    Precision,
    Uniform(UniformDecl),
    Interface(InterfaceDecl),
    Other,
}

fn classify(line: &str) -> Line {
    let trimmed = line.trim_start();
    if let Some(directive) = trimmed.strip_prefix('#') {
        let directive = directive.trim_start();
        if directive.starts_with("version") || directive.starts_with("pragma") {
            return Line::Directive;
        }
        return Line::Other;
    }
    if trimmed.starts_with("precision ") {
        return Line::Precision;
    }
    if let Some(caps) = uniform_regex().captures(line) {
        let Some(ty) = GlslType::parse(&caps[1]) else {
            return Line::Other;
        };
        return Line::Uniform(UniformDecl {
            name: caps[2].to_string(),
            ty,
            array_len: caps.get(3).and_then(|len| len.as_str().parse().ok()),
        });
    }
    if let Some(caps) = interface_regex().captures(line) {
        let qualifier = match &caps[1] {
            "attribute" => Qualifier::Attribute,
            "varying" => Qualifier::Varying,
            "in" => Qualifier::In,
            _ => Qualifier::Out,
        };
        return Line::Interface(InterfaceDecl {
            qualifier,
            ty: caps[2].to_string(),
            name: caps[3].to_string(),
        });
    }
    Line::Other
}

fn lines_of(fragments: &[String]) -> impl Iterator<Item = &str> {
    fragments.iter().flat_map(|fragment| fragment.lines())
}

/// Every recognised uniform declaration across `fragments`, in order.
pub fn parse_uniforms(fragments: &[String]) -> Vec<UniformDecl> {
    lines_of(fragments)
        .filter_map(|line| match classify(line) {
            Line::Uniform(decl) => Some(decl),
            _ => None,
        })
        .collect()
}

/// Vertex inputs (`attribute` or `in` in the vertex stage) in declaration
/// order; their index is their location.
pub fn vertex_inputs(fragments: &[String]) -> Vec<(String, String)> {
    lines_of(fragments)
        .filter_map(|line| match classify(line) {
            Line::Interface(decl)
                if matches!(decl.qualifier, Qualifier::Attribute | Qualifier::In) =>
            {
                Some((decl.name, decl.ty))
            }
            _ => None,
        })
        .collect()
}

/// Assigns a location to every varying either stage mentions. Locations
/// follow the sorted union of names so both stages agree without seeing
/// each other.
pub fn varying_locations(vertex: &[String], fragment: &[String]) -> BTreeMap<String, u32> {
    let mut names: Vec<String> = Vec::new();
    for (stage, fragments) in [(Stage::Vertex, vertex), (Stage::Fragment, fragment)] {
        for line in lines_of(fragments) {
            if let Line::Interface(decl) = classify(line) {
                if is_varying(stage, decl.qualifier) {
                    names.push(decl.name);
                }
            }
        }
    }
    names.sort();
    names.dedup();
    names
        .into_iter()
        .enumerate()
        .map(|(index, name)| (name, index as u32))
        .collect()
}

fn is_varying(stage: Stage, qualifier: Qualifier) -> bool {
    match (stage, qualifier) {
        (_, Qualifier::Varying) => true,
        (Stage::Vertex, Qualifier::Out) => true,
        (Stage::Fragment, Qualifier::In) => true,
        _ => false,
    }
}

/// Where a uniform lives once linked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniformSlot {
    /// Byte offset into the std140 block.
    Block { offset: u32 },
    /// Texture unit; bindings `2 * unit` and `2 * unit + 1` in set 1.
    Texture { unit: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformEntry {
    pub ty: GlslType,
    pub slot: UniformSlot,
}

/// Reflected uniforms of a program.
///
/// Arrays are expanded: `name[i]` addresses each element and `name` alone
/// addresses element 0.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UniformTable {
    entries: BTreeMap<String, UniformEntry>,
    members: Vec<UniformDecl>,
    samplers: Vec<String>,
    block_size: u32,
}

impl UniformTable {
    pub const EMPTY: UniformTable = UniformTable {
        entries: BTreeMap::new(),
        members: Vec::new(),
        samplers: Vec::new(),
        block_size: 0,
    };

    /// Lays out the uniforms declared by every stage's fragments.
    pub fn from_stages(stages: &[&[String]]) -> Result<Self, String> {
        let decls: Vec<UniformDecl> = stages
            .iter()
            .flat_map(|fragments| parse_uniforms(fragments))
            .collect();
        Self::build(&decls)
    }

    pub fn build(decls: &[UniformDecl]) -> Result<Self, String> {
        let mut table = UniformTable::default();
        let mut seen: BTreeMap<&str, &UniformDecl> = BTreeMap::new();
        let mut offset = 0u32;

        for decl in decls {
            if let Some(previous) = seen.get(decl.name.as_str()) {
                if *previous != decl {
                    return Err(format!(
                        "uniform `{}` declared with conflicting types",
                        decl.name
                    ));
                }
                continue;
            }
            seen.insert(&decl.name, decl);

            if decl.ty == GlslType::Sampler2D {
                if decl.array_len.is_some() {
                    return Err(format!(
                        "sampler array `{}` is not supported",
                        decl.name
                    ));
                }
                let unit = table.samplers.len() as u32;
                table.samplers.push(decl.name.clone());
                table.entries.insert(
                    decl.name.clone(),
                    UniformEntry {
                        ty: decl.ty,
                        slot: UniformSlot::Texture { unit },
                    },
                );
                continue;
            }

            let (align, size) = decl.ty.std140();
            match decl.array_len {
                None => {
                    offset = round_up(offset, align);
                    table.insert_block(decl.name.clone(), decl.ty, offset);
                    offset += size;
                }
                Some(len) => {
                    let stride = round_up(round_up(size, align), 16);
                    offset = round_up(offset, 16);
                    table.insert_block(decl.name.clone(), decl.ty, offset);
                    for index in 0..len {
                        table.insert_block(
                            format!("{}[{index}]", decl.name),
                            decl.ty,
                            offset + index * stride,
                        );
                    }
                    offset += stride * len;
                }
            }
            table.members.push(decl.clone());
        }

        table.block_size = round_up(offset, 16);
        Ok(table)
    }

    fn insert_block(&mut self, name: String, ty: GlslType, offset: u32) {
        self.entries.insert(
            name,
            UniformEntry {
                ty,
                slot: UniformSlot::Block { offset },
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&UniformEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Size of the std140 block in bytes, a multiple of 16.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Sampler names indexed by texture unit.
    pub fn samplers(&self) -> &[String] {
        &self.samplers
    }

    /// Packs `values` into block bytes and per-unit textures. Values for
    /// unknown names or of the wrong type are skipped.
    pub fn encode(&self, values: &UniformValues) -> EncodedUniforms {
        let mut encoded = EncodedUniforms {
            block: vec![0; self.block_size as usize],
            textures: vec![None; self.samplers.len()],
        };
        for (name, value) in values.iter() {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            if !entry.ty.accepts(value) {
                tracing::debug!(
                    uniform = name,
                    expected = entry.ty.name(),
                    actual = value.type_name(),
                    "ignoring uniform value of mismatched type"
                );
                continue;
            }
            match (entry.slot, value) {
                (UniformSlot::Texture { unit }, UniformValue::Sampler(texture)) => {
                    encoded.textures[unit as usize] = Some(*texture);
                }
                (UniformSlot::Block { offset }, value) => {
                    write_value(&mut encoded.block, offset as usize, value);
                }
                _ => {}
            }
        }
        encoded
    }
}

/// Output of [`UniformTable::encode`].
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedUniforms {
    pub block: Vec<u8>,
    pub textures: Vec<Option<TextureId>>,
}

fn round_up(value: u32, align: u32) -> u32 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

fn put(block: &mut [u8], offset: usize, floats: &[f32]) {
    let bytes: &[u8] = bytemuck::cast_slice(floats);
    block[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn write_value(block: &mut [u8], offset: usize, value: &UniformValue) {
    match value {
        UniformValue::Float(v) => put(block, offset, &[*v]),
        UniformValue::Vec2(v) => put(block, offset, v),
        UniformValue::Vec3(v) => put(block, offset, v),
        UniformValue::Vec4(v) => put(block, offset, v),
        UniformValue::Int(v) => block[offset..offset + 4].copy_from_slice(&v.to_ne_bytes()),
        UniformValue::UInt(v) => block[offset..offset + 4].copy_from_slice(&v.to_ne_bytes()),
        UniformValue::Bool(v) => {
            block[offset..offset + 4].copy_from_slice(&u32::from(*v).to_ne_bytes())
        }
        UniformValue::Mat2(m) => {
            for column in 0..2 {
                put(block, offset + column * 16, &m[column * 2..column * 2 + 2]);
            }
        }
        UniformValue::Mat3(m) => {
            for column in 0..3 {
                put(block, offset + column * 16, &m[column * 3..column * 3 + 3]);
            }
        }
        UniformValue::Mat4(m) => put(block, offset, m),
        UniformValue::Sampler(_) => {}
    }
}

/// A stage rewritten to GLSL 450 plus what is needed to map diagnostics
/// back onto the original fragments.
#[derive(Clone, Debug)]
pub struct TranslatedStage {
    pub source: String,
    prelude_lines: usize,
    fragment_lines: Vec<usize>,
}

impl TranslatedStage {
    /// Maps a 1-based line of [`TranslatedStage::source`] to
    /// `(fragment, line)`. Lines in the generated prelude or epilogue map
    /// to nothing.
    pub fn locate(&self, line: usize) -> Option<(usize, usize)> {
        let mut remaining = line.checked_sub(self.prelude_lines + 1)?;
        for (fragment, count) in self.fragment_lines.iter().enumerate() {
            if remaining < *count {
                return Some((fragment, remaining + 1));
            }
            remaining -= count;
        }
        None
    }

    /// Maps a byte offset of [`TranslatedStage::source`] to
    /// `(fragment, line, column)`.
    pub fn locate_offset(&self, offset: usize) -> Option<(usize, usize, usize)> {
        let offset = offset.min(self.source.len());
        let before = self.source.get(..offset)?;
        let line = before.matches('\n').count() + 1;
        let column = offset - before.rfind('\n').map_or(0, |newline| newline + 1) + 1;
        let (fragment, line) = self.locate(line)?;
        Some((fragment, line, column))
    }
}

/// Rewrites one stage as Vulkan GLSL 450 against a program-wide uniform
/// table and varying layout.
pub fn translate_stage(
    stage: Stage,
    fragments: &[String],
    table: &UniformTable,
    varyings: &BTreeMap<String, u32>,
) -> TranslatedStage {
    let mut body = String::new();
    let mut fragment_lines = Vec::with_capacity(fragments.len());
    let mut next_input = 0u32;
    let mut next_output = 0u32;
    let mut declares_output = false;

    for fragment in fragments {
        let mut count = 0;
        for line in fragment.lines() {
            count += 1;
            match classify(line) {
                Line::Directive | Line::Precision | Line::Uniform(_) => body.push('\n'),
                Line::Interface(decl) => {
                    let rewritten = match (stage, decl.qualifier) {
                        (Stage::Vertex, Qualifier::Attribute | Qualifier::In) => {
                            let location = next_input;
                            next_input += 1;
                            format!("layout(location = {location}) in {} {};", decl.ty, decl.name)
                        }
                        (Stage::Fragment, Qualifier::Out) => {
                            declares_output = true;
                            let location = next_output;
                            next_output += 1;
                            format!("layout(location = {location}) out {} {};", decl.ty, decl.name)
                        }
                        (_, Qualifier::Attribute) => line.to_string(),
                        (stage, _) => {
                            let direction = match stage {
                                Stage::Vertex => "out",
                                Stage::Fragment => "in",
                            };
                            let location = varyings.get(&decl.name).copied().unwrap_or(0);
                            format!(
                                "layout(location = {location}) {direction} {} {};",
                                decl.ty, decl.name
                            )
                        }
                    };
                    body.push_str(&rewritten);
                    body.push('\n');
                }
                Line::Other => {
                    body.push_str(line);
                    body.push('\n');
                }
            }
        }
        fragment_lines.push(count);
    }

    let mut prelude = String::from("#version 450\n");
    if !table.members.is_empty() {
        prelude.push_str("layout(std140, set = 0, binding = 0) uniform ShadyUniforms {\n");
        for member in &table.members {
            let array = member.array_len.map(|len| format!("[{len}]")).unwrap_or_default();
            let _ = writeln!(
                prelude,
                "    {} {MEMBER_PREFIX}{}{array};",
                member.ty.name(),
                member.name
            );
        }
        let _ = writeln!(prelude, "}} {BLOCK_INSTANCE};");
        for member in &table.members {
            let _ = writeln!(
                prelude,
                "#define {name} {BLOCK_INSTANCE}.{MEMBER_PREFIX}{name}",
                name = member.name
            );
        }
    }
    for (unit, name) in table.samplers.iter().enumerate() {
        let _ = writeln!(
            prelude,
            "layout(set = 1, binding = {}) uniform texture2D shady_tex_{name};",
            unit * 2
        );
        let _ = writeln!(
            prelude,
            "layout(set = 1, binding = {}) uniform sampler shady_smp_{name};",
            unit * 2 + 1
        );
        let _ = writeln!(
            prelude,
            "#define {name} sampler2D(shady_tex_{name}, shady_smp_{name})"
        );
    }
    prelude.push_str("#define texture2D texture\n");
    match stage {
        Stage::Vertex => prelude.push_str("#define main shady_main\n"),
        Stage::Fragment if !declares_output => {
            prelude.push_str("layout(location = 0) out vec4 shady_FragColor;\n");
            prelude.push_str("#define gl_FragColor shady_FragColor\n");
        }
        Stage::Fragment => {}
    }

    let prelude_lines = prelude.lines().count();
    let mut source = prelude;
    source.push_str(&body);
    if stage == Stage::Vertex {
        source.push_str(VERTEX_EPILOGUE);
    }

    TranslatedStage {
        source,
        prelude_lines,
        fragment_lines,
    }
}

/// Calls the user's entry point and flips y so row 0 of the target is the
/// bottom of the picture, as it is in GL.
const VERTEX_EPILOGUE: &str = "#undef main
void main() {
    shady_main();
    gl_Position.y = -gl_Position.y;
}
";
