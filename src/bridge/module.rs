//! The engine module seam
//!
//! A host wraps its loaded engine binary (a wasm instance, a dlopen'd library,
//! or the bundled reference module) in an [`EngineModule`]. Everything above
//! this trait talks to the engine exclusively through exported functions and
//! the module's linear memory.

use std::fmt;

/// Opaque handle to a resolved export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExportId(pub u32);

/// Identity token of the module's current linear memory region.
///
/// Changes whenever the engine grows (and therefore relocates) its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Argument or return value crossing the export boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    I32(i32),
    F64(f64),
}

impl Val {
    /// Pointer argument. Linear memory offsets travel as i32 on the wire.
    pub fn ptr(offset: u32) -> Self {
        Val::I32(offset as i32)
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Val::I32(v) => v,
            Val::F64(v) if v.is_finite() => v as i32,
            Val::F64(_) => 0,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Val::I32(v) => v as f64,
            Val::F64(v) => v,
        }
    }

    /// Reads the value as an unsigned linear memory offset.
    ///
    /// Engines return pointers as signed 32-bit integers; reinterpreting
    /// keeps offsets above 2 GiB intact.
    pub fn as_offset(self) -> i64 {
        match self {
            Val::I32(v) => v as u32 as i64,
            Val::F64(v) if v.is_finite() => v as i64,
            Val::F64(_) => 0,
        }
    }
}

impl From<i32> for Val {
    fn from(value: i32) -> Self {
        Val::I32(value)
    }
}

impl From<f64> for Val {
    fn from(value: f64) -> Self {
        Val::F64(value)
    }
}

/// A trap raised by the engine while executing an export
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("engine trap in `{export}`: {message}")]
pub struct EngineTrap {
    pub export: String,
    pub message: String,
}

impl EngineTrap {
    pub fn new(export: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            export: export.into(),
            message: message.into(),
        }
    }
}

/// A loaded engine binary.
///
/// Exports returning `void` report `Val::I32(0)`. Scratch primitives are
/// optional; the bridge falls back from the stack pair to the heap pair and
/// fails the operation if neither is available.
pub trait EngineModule: Send {
    /// Short label for log lines
    fn label(&self) -> &str {
        "engine"
    }

    /// Resolve an exported function by name
    fn lookup(&self, name: &str) -> Option<ExportId>;

    /// Invoke a previously resolved export
    fn call(&mut self, export: ExportId, args: &[Val]) -> Result<Val, EngineTrap>;

    /// Identity of the current linear memory region
    fn region_id(&self) -> RegionId;

    /// Current linear memory
    fn memory(&self) -> &[u8];

    /// Current linear memory, writable
    fn memory_mut(&mut self) -> &mut [u8];

    fn stack_save(&mut self) -> Option<u32> {
        None
    }

    /// Reserve `bytes` on the engine stack, returning the new stack pointer
    fn stack_alloc(&mut self, _bytes: u32) -> Option<u32> {
        None
    }

    fn stack_restore(&mut self, _saved: u32) {}

    fn malloc(&mut self, _bytes: u32) -> Option<u32> {
        None
    }

    fn free(&mut self, _ptr: u32) {}
}
