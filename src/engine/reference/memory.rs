//! Growable linear memory for the reference engine
//!
//! Layout: a null guard, the error message buffer, a downward-growing stack,
//! then a bump heap. Growing replaces the backing buffer and bumps the
//! region identity, just like a wasm `memory.grow`.

use std::collections::BTreeMap;

pub const PAGE_SIZE: usize = 64 * 1024;
pub const ERRMSG_PTR: u32 = 64;
pub const ERRMSG_CAP: usize = 256;
pub const STACK_FLOOR: u32 = 1024;
pub const STACK_TOP: u32 = 16 * 1024;
const HEAP_BASE: u32 = STACK_TOP;

pub(crate) fn align8(value: u32) -> u32 {
    (value + 7) & !7
}

#[derive(Debug)]
pub(crate) struct LinearMemory {
    words: Vec<u64>,
    region: u64,
    heap_top: u32,
    stack_ptr: u32,
    live: BTreeMap<u32, u32>,
}

impl LinearMemory {
    pub fn new(pages: usize) -> Self {
        Self {
            words: vec![0; pages.max(1) * PAGE_SIZE / 8],
            region: 1,
            heap_top: HEAP_BASE,
            stack_ptr: STACK_TOP,
            live: BTreeMap::new(),
        }
    }

    pub fn region(&self) -> u64 {
        self.region
    }

    pub fn len(&self) -> usize {
        self.words.len() * 8
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    /// Replace the backing buffer with one `pages` pages larger
    pub fn grow(&mut self, pages: usize) {
        let mut words = vec![0u64; self.words.len() + pages.max(1) * PAGE_SIZE / 8];
        words[..self.words.len()].copy_from_slice(&self.words);
        self.words = words;
        self.region += 1;
    }

    /// Bump-allocate `bytes`, growing memory when the heap is exhausted
    pub fn alloc(&mut self, bytes: u32) -> u32 {
        let size = align8(bytes.max(1));
        let ptr = self.heap_top;
        let end = ptr as usize + size as usize;
        if end > self.len() {
            self.grow((end - self.len()).div_ceil(PAGE_SIZE));
        }
        self.heap_top += size;
        self.live.insert(ptr, size);
        ptr
    }

    /// Release an allocation. Only the topmost block is actually reclaimed.
    pub fn release(&mut self, ptr: u32) {
        if let Some(size) = self.live.remove(&ptr) {
            if ptr + size == self.heap_top {
                self.heap_top = ptr;
                self.fill_zero(ptr, size as usize);
            }
        }
    }

    pub fn stack_ptr(&self) -> u32 {
        self.stack_ptr
    }

    pub fn stack_alloc(&mut self, bytes: u32) -> Option<u32> {
        let size = (bytes.max(1) + 15) & !15;
        let next = self.stack_ptr.checked_sub(size)?;
        if next < STACK_FLOOR {
            return None;
        }
        self.stack_ptr = next;
        Some(next)
    }

    pub fn stack_restore(&mut self, saved: u32) {
        self.stack_ptr = saved.clamp(STACK_FLOOR, STACK_TOP);
    }

    pub fn in_bounds(&self, ptr: u32, bytes: usize) -> bool {
        ptr != 0 && (ptr as usize).checked_add(bytes).is_some_and(|end| end <= self.len())
    }

    pub fn read_f64(&self, ptr: u32) -> f64 {
        let start = ptr as usize;
        bytemuck::pod_read_unaligned(&self.bytes()[start..start + 8])
    }

    pub fn write_f64(&mut self, ptr: u32, value: f64) {
        let start = ptr as usize;
        self.bytes_mut()[start..start + 8].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn read_i32(&self, ptr: u32) -> i32 {
        let start = ptr as usize;
        bytemuck::pod_read_unaligned(&self.bytes()[start..start + 4])
    }

    pub fn write_i32(&mut self, ptr: u32, value: i32) {
        let start = ptr as usize;
        self.bytes_mut()[start..start + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn read_f64s(&self, ptr: u32, count: usize) -> Vec<f64> {
        let start = ptr as usize;
        bytemuck::pod_collect_to_vec(&self.bytes()[start..start + count * 8])
    }

    pub fn write_f64s(&mut self, ptr: u32, values: &[f64]) {
        let start = ptr as usize;
        self.bytes_mut()[start..start + values.len() * 8].copy_from_slice(bytemuck::cast_slice(values));
    }

    pub fn write_i32s(&mut self, ptr: u32, values: &[i32]) {
        let start = ptr as usize;
        self.bytes_mut()[start..start + values.len() * 4].copy_from_slice(bytemuck::cast_slice(values));
    }

    pub fn fill_zero(&mut self, ptr: u32, bytes: usize) {
        let start = ptr as usize;
        self.bytes_mut()[start..start + bytes].fill(0);
    }

    pub fn read_cstr(&self, ptr: u32) -> Option<String> {
        let tail = self.bytes().get(ptr as usize..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    /// Write a NUL-terminated string, truncated to `cap` bytes
    pub fn write_cstr(&mut self, ptr: u32, text: &str, cap: usize) {
        let bytes = text.as_bytes();
        let len = bytes.len().min(cap.saturating_sub(1));
        let start = ptr as usize;
        let memory = self.bytes_mut();
        memory[start..start + len].copy_from_slice(&bytes[..len]);
        memory[start + len] = 0;
    }
}
