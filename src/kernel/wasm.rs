//! WASM host surface
//!
//! Program images are validated WASM command modules. Each process owns a
//! `WasmInstance`: the image it runs plus its linear memory. Syscall
//! arguments that are pointers are marshalled through `LinearMemory`,
//! which bounds-checks every access.
//!
//! Linear memory is copy-on-write: fork clones the `Arc`, and the first
//! write on either side copies the buffer.

use super::errno::Errno;
use super::memory::MemoryError;
use bytemuck::Pod;
use std::sync::Arc;
use thiserror::Error;

/// WASM magic number: \0asm
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// WASM version 1
const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Export section id
const EXPORT_SECTION: u8 = 7;

/// Export kinds
const EXPORT_FUNC: u8 = 0;
const EXPORT_MEMORY: u8 = 2;

/// Exports a command module must provide
pub mod exports {
    pub const MEMORY: &str = "memory";
    pub const START: &str = "_start";
}

/// Errors raised while loading a program image
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("invalid module: {reason}")]
    InvalidModule { reason: String },

    #[error("missing required export `{name}`")]
    MissingExport { name: &'static str },
}

impl From<LoadError> for Errno {
    fn from(_: LoadError) -> Self {
        Errno::ENOEXEC
    }
}

/// Validates WASM command modules
pub struct ModuleValidator;

impl ModuleValidator {
    /// Validate a module binary and return its export names
    ///
    /// Checks the magic number and version, then walks the sections and
    /// requires a memory export and a `_start` function export.
    pub fn validate(bytes: &[u8]) -> Result<Vec<String>, LoadError> {
        if bytes.len() < 8 {
            return Err(invalid("module too small"));
        }
        if bytes[0..4] != WASM_MAGIC {
            return Err(invalid("invalid magic number"));
        }
        if bytes[4..8] != WASM_VERSION {
            return Err(invalid("unsupported WASM version"));
        }

        let mut names = Vec::new();
        let mut has_memory = false;
        let mut has_start = false;

        let mut offset = 8;
        while offset < bytes.len() {
            let section_id = bytes[offset];
            offset += 1;

            let (size, size_bytes) = read_leb128(&bytes[offset..])?;
            offset += size_bytes;

            let section_end = offset
                .checked_add(size as usize)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| invalid("section extends past end of module"))?;

            if section_id == EXPORT_SECTION {
                for (name, kind) in parse_export_section(&bytes[offset..section_end])? {
                    has_memory |= name == exports::MEMORY && kind == EXPORT_MEMORY;
                    has_start |= name == exports::START && kind == EXPORT_FUNC;
                    names.push(name);
                }
            }

            offset = section_end;
        }

        if !has_memory {
            return Err(LoadError::MissingExport {
                name: exports::MEMORY,
            });
        }
        if !has_start {
            return Err(LoadError::MissingExport {
                name: exports::START,
            });
        }
        Ok(names)
    }
}

fn invalid(reason: &str) -> LoadError {
    LoadError::InvalidModule {
        reason: reason.to_string(),
    }
}

/// Read an unsigned LEB128 value
fn read_leb128(bytes: &[u8]) -> Result<(u32, usize), LoadError> {
    let mut result = 0u32;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().take(5).enumerate() {
        result |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }

    Err(invalid("invalid LEB128"))
}

/// Parse an export section into (name, kind) pairs
fn parse_export_section(data: &[u8]) -> Result<Vec<(String, u8)>, LoadError> {
    let mut found = Vec::new();
    if data.is_empty() {
        return Ok(found);
    }

    let (count, mut offset) = read_leb128(data)?;
    for _ in 0..count {
        let (name_len, len_bytes) = read_leb128(data.get(offset..).unwrap_or_default())?;
        offset += len_bytes;

        let name_end = offset + name_len as usize;
        let name = data
            .get(offset..name_end)
            .ok_or_else(|| invalid("export name extends past section"))?;
        let name = String::from_utf8_lossy(name).into_owned();
        offset = name_end;

        let kind = *data
            .get(offset)
            .ok_or_else(|| invalid("unexpected end of export section"))?;
        offset += 1;

        let (_index, index_bytes) = read_leb128(data.get(offset..).unwrap_or_default())?;
        offset += index_bytes;

        found.push((name, kind));
    }
    Ok(found)
}

/// Smallest module the validator accepts: exports `memory` and `_start`
pub fn minimal_command_module() -> Vec<u8> {
    let mut section = vec![2u8];
    for (name, kind) in [(exports::MEMORY, EXPORT_MEMORY), (exports::START, EXPORT_FUNC)] {
        section.push(name.len() as u8);
        section.extend_from_slice(name.as_bytes());
        section.push(kind);
        section.push(0);
    }

    let mut module = Vec::with_capacity(8 + 2 + section.len());
    module.extend_from_slice(&WASM_MAGIC);
    module.extend_from_slice(&WASM_VERSION);
    module.push(EXPORT_SECTION);
    module.push(section.len() as u8);
    module.extend_from_slice(&section);
    module
}

/// A loaded, validated program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    /// Path the image was loaded from
    pub path: String,
    pub bytes: Arc<[u8]>,
    pub exports: Vec<String>,
}

/// Turns executable file contents into a program image
///
/// The kernel reads the file and checks permissions; the loader only judges
/// whether the bytes are a runnable program.
pub trait ProgramLoader: Send + Sync {
    fn load(&self, path: &str, bytes: &[u8]) -> Result<ProgramImage, LoadError>;
}

/// Default loader: accepts any module that passes `ModuleValidator`
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidatingLoader;

impl ProgramLoader for ValidatingLoader {
    fn load(&self, path: &str, bytes: &[u8]) -> Result<ProgramImage, LoadError> {
        let exports = ModuleValidator::validate(bytes)?;
        Ok(ProgramImage {
            path: path.to_string(),
            bytes: Arc::from(bytes),
            exports,
        })
    }
}

/// Bounds-checked, copy-on-write guest linear memory
#[derive(Debug, Clone)]
pub struct LinearMemory {
    data: Arc<Vec<u8>>,
}

impl LinearMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(vec![0; size]),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// True while the buffer is still shared with a forked relative
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let fault = MemoryError::OutOfBounds { addr, len };
        let start = usize::try_from(addr).map_err(|_| fault)?;
        let end = start.checked_add(len).ok_or(fault)?;
        if end > self.data.len() {
            return Err(fault);
        }
        Ok(start..end)
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<&[u8], MemoryError> {
        let range = self.range(addr, len)?;
        Ok(&self.data[range])
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, bytes.len())?;
        Arc::make_mut(&mut self.data)[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes
    pub fn read_cstring(&self, addr: u64, max_len: usize) -> Result<String, MemoryError> {
        let start = self.range(addr, 0)?.start;
        let end = self.data.len().min(start.saturating_add(max_len));
        let window = &self.data[start..end];
        let len = window
            .iter()
            .position(|&b| b == 0)
            .ok_or(MemoryError::OutOfBounds { addr, len: max_len })?;
        Ok(String::from_utf8_lossy(&window[..len]).into_owned())
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        self.read_pod(addr)
    }

    pub fn read_pod<T: Pod>(&self, addr: u64) -> Result<T, MemoryError> {
        let bytes = self.read(addr, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn write_pod<T: Pod>(&mut self, addr: u64, value: &T) -> Result<(), MemoryError> {
        self.write(addr, bytemuck::bytes_of(value))
    }
}

/// A process's program image and linear memory
#[derive(Debug, Clone)]
pub struct WasmInstance {
    pub image: Option<ProgramImage>,
    pub memory: LinearMemory,
}

impl WasmInstance {
    /// An instance with no program, as used before the first exec
    pub fn empty(memory_size: usize) -> Self {
        Self {
            image: None,
            memory: LinearMemory::new(memory_size),
        }
    }

    pub fn from_image(image: ProgramImage, memory_size: usize) -> Self {
        Self {
            image: Some(image),
            memory: LinearMemory::new(memory_size),
        }
    }

    /// Copy-on-write clone for fork
    pub fn fork(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_module_validates() {
        let names = ModuleValidator::validate(&minimal_command_module()).unwrap();
        assert_eq!(names, vec!["memory".to_string(), "_start".to_string()]);
    }

    #[test]
    fn test_rejects_bad_magic_and_short_input() {
        assert!(matches!(
            ModuleValidator::validate(b"\x7fELF\x01\x00\x00\x00"),
            Err(LoadError::InvalidModule { .. })
        ));
        assert!(ModuleValidator::validate(b"\0asm").is_err());
    }

    #[test]
    fn test_missing_start_export() {
        let module = [WASM_MAGIC, WASM_VERSION].concat();
        assert_eq!(
            ModuleValidator::validate(&module),
            Err(LoadError::MissingExport { name: "memory" })
        );
    }

    #[test]
    fn test_linear_memory_bounds() {
        let mut mem = LinearMemory::new(16);
        mem.write(12, b"abcd").unwrap();
        assert_eq!(mem.read(12, 4).unwrap(), b"abcd");
        assert!(mem.write(13, b"abcd").is_err());
        assert!(mem.read(u64::MAX, 1).is_err());
        assert_eq!(Errno::from(mem.read(17, 0).unwrap_err()), Errno::EFAULT);
    }

    #[test]
    fn test_read_cstring() {
        let mut mem = LinearMemory::new(32);
        mem.write(4, b"/bin/sh\0").unwrap();
        assert_eq!(mem.read_cstring(4, 64).unwrap(), "/bin/sh");
        // No terminator within the window
        assert!(mem.read_cstring(4, 3).is_err());
    }

    #[test]
    fn test_fork_is_copy_on_write() {
        let mut parent = WasmInstance::empty(8);
        parent.memory.write(0, &[1]).unwrap();
        let mut child = parent.fork();
        assert!(parent.memory.is_shared());

        child.memory.write(0, &[2]).unwrap();
        assert!(!parent.memory.is_shared());
        assert_eq!(parent.memory.read(0, 1).unwrap(), &[1]);
        assert_eq!(child.memory.read(0, 1).unwrap(), &[2]);
    }
}
