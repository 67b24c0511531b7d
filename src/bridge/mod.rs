//! # Heap Bridge
//!
//! Safe access to a natively-compiled engine's exports and linear memory.
//!
//! - [`module`]: the [`EngineModule`] seam a host implements for its binary
//! - [`heap`]: bounds-checked, relocation-aware typed views
//! - [`symbols`]: ABI variant detection and per-handle export tables
//! - [`scratch`]: scoped stack/heap scratch blocks

pub mod heap;
pub mod module;
pub mod scratch;
pub mod symbols;

pub use heap::{ElementKind, HeapBridge, HeapElement, HeapView, HeapViewMut};
pub use module::{EngineModule, EngineTrap, ExportId, RegionId, Val};
pub use scratch::{Scratch, ScratchKind};
pub use symbols::{AbiVariant, Accessor, AccessorFamily, ResolutionTable, SymbolResolver};

/// Failures at the bridge layer
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("module exports neither the current nor the legacy engine ABI")]
    UnknownAbi,
    #[error("mandatory accessor {accessor:?} is missing from the {variant} ABI")]
    MissingAccessor { accessor: Accessor, variant: AbiVariant },
    #[error("accessor {0:?} is not exported by this engine build")]
    Unavailable(Accessor),
    #[error("could not reserve {0} bytes of scratch memory")]
    ScratchUnavailable(usize),
    #[error("memory access out of bounds at offset {ptr} ({len} bytes)")]
    OutOfBounds { ptr: i64, len: usize },
    #[error(transparent)]
    Trap(#[from] EngineTrap),
}
