use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, TryLockError};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use regex::Regex;
use renderer::{RenderState, Resource, TextureStore, UniformValue, UniformValues};

use super::ResourceContext;
use crate::mapping::Mapping;
use crate::path::resolve_path;

const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

fn value_regex() -> &'static Regex {
    static VALUE_REGEX: OnceLock<Regex> = OnceLock::new();
    VALUE_REGEX
        .get_or_init(|| Regex::new(r"^([^;?]+)(\??)$").expect("invalid peripheral value regex"))
}

/// Parses `mat4 f0 f1 ... f15`, values in column-major order.
fn parse_line(line: &str) -> Option<[f32; 16]> {
    let mut words = line.split_whitespace();
    if words.next()? != "mat4" {
        return None;
    }
    let mut matrix = [0.0f32; 16];
    for slot in matrix.iter_mut() {
        *slot = words.next()?.parse().ok()?;
    }
    words.next().is_none().then_some(matrix)
}

/// A `mat4` uniform fed by lines read from a file or pipe on a background
/// thread.
///
/// The uniform holds the identity matrix until the first well-formed line
/// arrives; malformed lines are skipped.
pub struct PeripheralMat4 {
    name: String,
    current: Arc<Mutex<[f32; 16]>>,
    last: [f32; 16],
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl PeripheralMat4 {
    /// A peripheral that never updates.
    pub fn constant(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: Arc::new(Mutex::new(IDENTITY)),
            last: IDENTITY,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    pub fn spawn<R>(name: impl Into<String>, input: R) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let mut peripheral = Self::constant(name);
        let current = Arc::clone(&peripheral.current);
        let stop = Arc::clone(&peripheral.stop);
        let uniform = peripheral.name.clone();

        let handle = std::thread::Builder::new()
            .name(format!("perip-{uniform}"))
            .spawn(move || {
                for line in BufReader::new(input).lines() {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let line = match line {
                        Ok(line) => line,
                        Err(err) => {
                            tracing::debug!(
                                uniform = %uniform,
                                error = %err,
                                "peripheral read failed"
                            );
                            break;
                        }
                    };
                    let Some(matrix) = parse_line(&line) else {
                        continue;
                    };
                    match current.lock() {
                        Ok(mut value) => *value = matrix,
                        Err(poisoned) => *poisoned.into_inner() = matrix,
                    }
                }
                tracing::debug!(uniform = %uniform, "peripheral input ended");
            })
            .context("failed to start peripheral reader")?;
        peripheral.reader = Some(handle);
        Ok(peripheral)
    }

    pub fn value(&self) -> [f32; 16] {
        match self.current.lock() {
            Ok(value) => *value,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Resource for PeripheralMat4 {
    fn uniform_source(&self) -> String {
        format!("uniform mat4 {};\n", self.name)
    }

    fn pre_render(&mut self, _: &RenderState<'_>, uniforms: &mut UniformValues) {
        // Never wait on the reader; a contended lock reuses the last value.
        match self.current.try_lock() {
            Ok(value) => self.last = *value,
            Err(TryLockError::Poisoned(poisoned)) => self.last = *poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {}
        }
        uniforms.set(self.name.clone(), UniformValue::Mat4(self.last));
    }

    fn close(&mut self, _: &mut dyn TextureStore) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };
        // A reader blocked on a pipe that never writes again cannot be
        // interrupted; it is left to exit with the process.
        if reader.is_finished() {
            if reader.join().is_err() {
                tracing::warn!(uniform = %self.name, "peripheral reader panicked");
            }
        } else {
            tracing::debug!(uniform = %self.name, "detached blocked peripheral reader");
        }
        Ok(())
    }
}

impl Drop for PeripheralMat4 {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub(super) fn build(mapping: &Mapping, _: &mut ResourceContext<'_>) -> Result<Box<dyn Resource>> {
    if mapping.value.contains(';') {
        anyhow::bail!(
            "mapping `{}`: serial peripherals are not supported, use a file or pipe",
            mapping.name
        );
    }
    let captures = value_regex()
        .captures(mapping.value.trim())
        .ok_or_else(|| mapping.invalid("<path> or <path>?"))?;
    let fail_silent = !captures[2].is_empty();
    let path = resolve_path(&mapping.dir, &captures[1])?;

    match File::open(&path) {
        Ok(file) => Ok(Box::new(PeripheralMat4::spawn(&mapping.name, file)?)),
        Err(err) if fail_silent => {
            tracing::debug!(
                uniform = %mapping.name,
                path = %path.display(),
                error = %err,
                "optional peripheral unavailable, using identity"
            );
            Ok(Box::new(PeripheralMat4::constant(&mapping.name)))
        }
        Err(err) => Err(err).with_context(|| {
            format!("failed to open peripheral {}", path.display())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceKinds;
    use renderer::HeadlessBackend;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    fn wait_for(peripheral: &PeripheralMat4, expected: [f32; 16]) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if peripheral.value() == expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn parses_well_formed_lines_only() {
        let mut expected = [0.0f32; 16];
        for (index, value) in expected.iter_mut().enumerate() {
            *value = index as f32;
        }
        let line = format!(
            "mat4 {}",
            expected.iter().map(f32::to_string).collect::<Vec<_>>().join(" ")
        );
        assert_eq!(parse_line(&line), Some(expected));
        assert_eq!(parse_line("mat3 1 0 0 0 1 0 0 0 1"), None);
        assert_eq!(parse_line("mat4 1 2 3"), None);
        assert_eq!(parse_line(&format!("{line} 16")), None);
        assert_eq!(parse_line("mat4 a 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0"), None);
    }

    #[test]
    fn starts_at_identity_and_follows_input() {
        let input = "garbage\nmat4 2 0 0 0 0 2 0 0 0 0 2 0 0 0 0 1\nmat4 broken\n";
        let mut peripheral = PeripheralMat4::spawn("view", Cursor::new(input)).unwrap();
        let mut scaled = IDENTITY;
        scaled[0] = 2.0;
        scaled[5] = 2.0;
        scaled[10] = 2.0;
        assert!(wait_for(&peripheral, scaled));

        let mut uniforms = UniformValues::new();
        peripheral.pre_render(&RenderState::new(Duration::ZERO, 0, 1, 1), &mut uniforms);
        assert_eq!(uniforms.get("view"), Some(&UniformValue::Mat4(scaled)));
        peripheral.close(&mut HeadlessBackend::new()).unwrap();
    }

    #[test]
    fn optional_missing_file_falls_back_to_identity() {
        let dir = tempfile::tempdir().unwrap();
        let kinds = std::sync::Arc::new(ResourceKinds::default());
        let mut backend = HeadlessBackend::new();
        let mut context = ResourceContext {
            textures: &mut backend,
            kinds: &kinds,
            glsl_version: "330",
        };

        let optional = Mapping::new("m", "perip_mat4", "absent?", dir.path()).unwrap();
        let mut resource = kinds.build(&optional, &mut context).unwrap();
        let mut uniforms = UniformValues::new();
        resource.pre_render(&RenderState::new(Duration::ZERO, 0, 1, 1), &mut uniforms);
        assert_eq!(uniforms.get("m"), Some(&UniformValue::Mat4(IDENTITY)));

        let required = Mapping::new("m", "perip_mat4", "absent", dir.path()).unwrap();
        assert!(kinds.build(&required, &mut context).is_err());
    }

    #[test]
    fn serial_devices_are_rejected() {
        let kinds = std::sync::Arc::new(ResourceKinds::default());
        let mut backend = HeadlessBackend::new();
        let mut context = ResourceContext {
            textures: &mut backend,
            kinds: &kinds,
            glsl_version: "330",
        };
        let serial = Mapping::new("m", "perip_mat4", "/dev/ttyUSB0;9600", "/").unwrap();
        let err = kinds.build(&serial, &mut context).err().unwrap();
        assert!(err.to_string().contains("serial"));
    }
}
