//! Typed views into the engine's linear memory
//!
//! Every view construction re-resolves the module's current memory region,
//! so a view can never alias a buffer the engine has since replaced. Views
//! borrow the bridge, which means no engine call can run (and relocate
//! memory) while one is alive.

use std::fmt;
use std::ops::{Deref, DerefMut, Range};

use bytemuck::Pod;
use log::debug;

use super::module::{EngineModule, ExportId, RegionId, Val};
use super::BridgeError;

/// Element types a view can project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    F64,
    F32,
    I32,
    U8,
}

impl ElementKind {
    pub const fn size(self) -> usize {
        match self {
            ElementKind::F64 => 8,
            ElementKind::F32 | ElementKind::I32 => 4,
            ElementKind::U8 => 1,
        }
    }
}

/// A plain-old-data element that can live in engine memory
pub trait HeapElement: Pod + Default + fmt::Debug {
    const KIND: ElementKind;
}

impl HeapElement for f64 {
    const KIND: ElementKind = ElementKind::F64;
}

impl HeapElement for f32 {
    const KIND: ElementKind = ElementKind::F32;
}

impl HeapElement for i32 {
    const KIND: ElementKind = ElementKind::I32;
}

impl HeapElement for u8 {
    const KIND: ElementKind = ElementKind::U8;
}

/// Byte range of `count` elements at `ptr`, or `None` if any part of it
/// falls outside a region of `region_len` bytes.
pub fn byte_range(region_len: usize, ptr: i64, count: i64, kind: ElementKind) -> Option<Range<usize>> {
    if ptr <= 0 || count <= 0 {
        return None;
    }
    let start = usize::try_from(ptr).ok()?;
    let len = usize::try_from(count).ok()?.checked_mul(kind.size())?;
    let end = start.checked_add(len)?;
    (end <= region_len).then_some(start..end)
}

/// Read-only projection of engine memory
#[derive(Debug)]
pub enum HeapView<'a, T: HeapElement> {
    /// Bad pointer, bad count or out of bounds
    Empty,
    /// Zero-copy projection
    Borrowed(&'a [T]),
    /// Defensive copy for offsets the element type cannot be aligned to
    Copied(Vec<T>),
}

impl<T: HeapElement> HeapView<'_, T> {
    pub fn is_copied(&self) -> bool {
        matches!(self, HeapView::Copied(_))
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            HeapView::Empty => &[],
            HeapView::Borrowed(slice) => slice,
            HeapView::Copied(values) => values,
        }
    }
}

impl<T: HeapElement> Deref for HeapView<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

enum ViewMutInner<'a, T: HeapElement> {
    Empty,
    Borrowed(&'a mut [T]),
    Staged { target: &'a mut [u8], values: Vec<T> },
}

/// Writable projection of engine memory.
///
/// Misaligned projections are staged in a local copy and written back when
/// the view is dropped.
pub struct HeapViewMut<'a, T: HeapElement> {
    inner: ViewMutInner<'a, T>,
}

impl<T: HeapElement> HeapViewMut<'_, T> {
    pub fn is_staged(&self) -> bool {
        matches!(self.inner, ViewMutInner::Staged { .. })
    }
}

impl<T: HeapElement> Deref for HeapViewMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match &self.inner {
            ViewMutInner::Empty => &[],
            ViewMutInner::Borrowed(slice) => slice,
            ViewMutInner::Staged { values, .. } => values,
        }
    }
}

impl<T: HeapElement> DerefMut for HeapViewMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        match &mut self.inner {
            ViewMutInner::Empty => &mut [],
            ViewMutInner::Borrowed(slice) => slice,
            ViewMutInner::Staged { values, .. } => values,
        }
    }
}

impl<T: HeapElement> Drop for HeapViewMut<'_, T> {
    fn drop(&mut self) {
        if let ViewMutInner::Staged { target, values } = &mut self.inner {
            target.copy_from_slice(bytemuck::cast_slice(values.as_slice()));
        }
    }
}

impl<T: HeapElement> fmt::Debug for HeapViewMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapViewMut")
            .field("staged", &self.is_staged())
            .field("values", &self.deref())
            .finish()
    }
}

/// Owns the engine module and mediates every access to its memory
pub struct HeapBridge {
    module: Box<dyn EngineModule>,
    region: RegionId,
    relocations: u64,
    initialized: bool,
}

impl HeapBridge {
    pub fn new(module: Box<dyn EngineModule>) -> Self {
        let region = module.region_id();
        debug!("heap bridge attached to {} ({region})", module.label());
        Self {
            module,
            region,
            relocations: 0,
            initialized: false,
        }
    }

    pub fn module(&self) -> &dyn EngineModule {
        self.module.as_ref()
    }

    pub(crate) fn module_mut(&mut self) -> &mut dyn EngineModule {
        self.module.as_mut()
    }

    /// Identity of the region observed by the last access
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Number of memory relocations observed so far
    pub fn relocations(&self) -> u64 {
        self.relocations
    }

    pub fn lookup(&self, name: &str) -> Option<ExportId> {
        self.module.lookup(name)
    }

    /// Invoke an export. The region is re-checked afterwards since any call
    /// may grow memory.
    pub fn call(&mut self, export: ExportId, args: &[Val]) -> Result<Val, BridgeError> {
        let result = self.module.call(export, args);
        self.sync_region();
        Ok(result?)
    }

    /// Re-resolve the current region, returning its length in bytes
    pub fn sync_region(&mut self) -> usize {
        let current = self.module.region_id();
        if current != self.region {
            self.relocations += 1;
            debug!(
                "engine memory relocated: {} -> {current} ({} bytes)",
                self.region,
                self.module.memory().len()
            );
            self.region = current;
        }
        self.module.memory().len()
    }

    /// Marks the module's one-time init as done, returning whether this
    /// call was the first.
    pub(crate) fn mark_initialized(&mut self) -> bool {
        !std::mem::replace(&mut self.initialized, true)
    }

    /// Project `count` elements at `ptr`.
    ///
    /// Never fails: a null or negative pointer, a non-positive count or an
    /// out-of-bounds range all produce an empty view.
    pub fn view<T: HeapElement>(&mut self, ptr: i64, count: i64) -> HeapView<'_, T> {
        let region_len = self.sync_region();
        let Some(range) = byte_range(region_len, ptr, count, T::KIND) else {
            return HeapView::Empty;
        };
        let bytes = &self.module.memory()[range];
        if bytes.as_ptr().align_offset(std::mem::align_of::<T>()) == 0 {
            match bytemuck::try_cast_slice(bytes) {
                Ok(slice) => HeapView::Borrowed(slice),
                Err(_) => HeapView::Copied(bytemuck::pod_collect_to_vec(bytes)),
            }
        } else {
            HeapView::Copied(bytemuck::pod_collect_to_vec(bytes))
        }
    }

    /// Writable projection with the same failure rules as [`HeapBridge::view`]
    pub fn view_mut<T: HeapElement>(&mut self, ptr: i64, count: i64) -> HeapViewMut<'_, T> {
        let region_len = self.sync_region();
        let Some(range) = byte_range(region_len, ptr, count, T::KIND) else {
            return HeapViewMut {
                inner: ViewMutInner::Empty,
            };
        };
        let bytes = &mut self.module.memory_mut()[range];
        let inner = if bytes.as_ptr().align_offset(std::mem::align_of::<T>()) == 0 {
            match bytemuck::try_cast_slice_mut(bytes) {
                Ok(slice) => ViewMutInner::Borrowed(slice),
                Err(_) => ViewMutInner::Empty,
            }
        } else {
            let values = bytemuck::pod_collect_to_vec(bytes);
            ViewMutInner::Staged {
                target: bytes,
                values,
            }
        };
        HeapViewMut { inner }
    }

    /// Copy of `count` elements at `ptr`; empty on any validity failure
    pub fn read_vec<T: HeapElement>(&mut self, ptr: i64, count: i64) -> Vec<T> {
        self.view::<T>(ptr, count).to_vec()
    }

    pub fn read<T: HeapElement>(&mut self, ptr: i64) -> Option<T> {
        self.view::<T>(ptr, 1).first().copied()
    }

    pub fn write<T: HeapElement>(&mut self, ptr: i64, value: T) -> bool {
        self.write_slice(ptr, std::slice::from_ref(&value))
    }

    /// Write `values` at `ptr`, or nothing at all if the range is invalid
    pub fn write_slice<T: HeapElement>(&mut self, ptr: i64, values: &[T]) -> bool {
        let region_len = self.sync_region();
        let count = values.len() as i64;
        let Some(range) = byte_range(region_len, ptr, count, T::KIND) else {
            return false;
        };
        self.module.memory_mut()[range].copy_from_slice(bytemuck::cast_slice(values));
        true
    }

    /// Read a NUL-terminated string, bounded by the region length
    pub fn read_cstr(&mut self, ptr: i64) -> String {
        let region_len = self.sync_region();
        let Some(start) = usize::try_from(ptr).ok().filter(|&p| p > 0 && p < region_len) else {
            return String::new();
        };
        let tail = &self.module.memory()[start..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..end]).into_owned()
    }

    /// Write `text` followed by a NUL terminator
    pub fn write_cstr(&mut self, ptr: i64, text: &str) -> Result<(), BridgeError> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        if self.write_slice(ptr, &bytes) {
            Ok(())
        } else {
            Err(BridgeError::OutOfBounds {
                ptr,
                len: bytes.len(),
            })
        }
    }
}

impl fmt::Debug for HeapBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBridge")
            .field("module", &self.module.label())
            .field("region", &self.region)
            .field("relocations", &self.relocations)
            .finish()
    }
}
