//! Scoped scratch allocations in engine memory
//!
//! Transfers into the engine (state buffers, model source text) go through
//! a scratch block that lives for exactly one operation. The engine stack is
//! preferred; the heap pair is the fallback. The guard releases the block on
//! every exit path.

use std::ops::{Deref, DerefMut};

use log::debug;

use super::heap::HeapBridge;
use super::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchKind {
    Stack,
    Heap,
}

#[derive(Debug)]
enum Release {
    Stack(u32),
    Heap(u32),
}

/// RAII guard over a scratch block. Derefs to the bridge so callers can
/// invoke exports and build views while the block is held.
pub struct Scratch<'a> {
    bridge: &'a mut HeapBridge,
    ptr: u32,
    len: u32,
    release: Release,
}

impl Scratch<'_> {
    /// Offset of the block in linear memory
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    pub fn offset(&self) -> i64 {
        self.ptr as i64
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> ScratchKind {
        match self.release {
            Release::Stack(_) => ScratchKind::Stack,
            Release::Heap(_) => ScratchKind::Heap,
        }
    }
}

impl Deref for Scratch<'_> {
    type Target = HeapBridge;

    fn deref(&self) -> &HeapBridge {
        self.bridge
    }
}

impl DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut HeapBridge {
        self.bridge
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        match self.release {
            Release::Stack(saved) => self.bridge.module_mut().stack_restore(saved),
            Release::Heap(ptr) => self.bridge.module_mut().free(ptr),
        }
    }
}

impl HeapBridge {
    /// Reserve `bytes` of scratch memory for the lifetime of the guard
    pub fn scratch(&mut self, bytes: usize) -> Result<Scratch<'_>, BridgeError> {
        let len = u32::try_from(bytes.max(1)).map_err(|_| BridgeError::ScratchUnavailable(bytes))?;

        let module = self.module_mut();
        if let Some(saved) = module.stack_save() {
            match module.stack_alloc(len) {
                Some(ptr) if ptr != 0 => {
                    self.sync_region();
                    return Ok(Scratch {
                        bridge: self,
                        ptr,
                        len,
                        release: Release::Stack(saved),
                    });
                }
                _ => {
                    module.stack_restore(saved);
                    debug!("stack scratch of {len} bytes unavailable, falling back to heap");
                }
            }
        }

        match self.module_mut().malloc(len) {
            Some(ptr) if ptr != 0 => {
                self.sync_region();
                Ok(Scratch {
                    bridge: self,
                    ptr,
                    len,
                    release: Release::Heap(ptr),
                })
            }
            _ => Err(BridgeError::ScratchUnavailable(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::heap::tests::WordModule;
    use crate::bridge::module::{EngineModule, EngineTrap, ExportId, RegionId, Val};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Ledger {
        stack_ptr: u32,
        restores: Vec<u32>,
        frees: Vec<u32>,
        next_heap: u32,
    }

    struct ScratchModule {
        mem: WordModule,
        stack: bool,
        heap: bool,
        ledger: Arc<Mutex<Ledger>>,
    }

    impl ScratchModule {
        fn new(stack: bool, heap: bool) -> (Self, Arc<Mutex<Ledger>>) {
            let ledger = Arc::new(Mutex::new(Ledger {
                stack_ptr: 512,
                next_heap: 64,
                ..Ledger::default()
            }));
            let module = Self {
                mem: WordModule::new(1024),
                stack,
                heap,
                ledger: ledger.clone(),
            };
            (module, ledger)
        }
    }

    impl EngineModule for ScratchModule {
        fn lookup(&self, _name: &str) -> Option<ExportId> {
            None
        }

        fn call(&mut self, _export: ExportId, _args: &[Val]) -> Result<Val, EngineTrap> {
            Ok(Val::I32(0))
        }

        fn region_id(&self) -> RegionId {
            self.mem.region_id()
        }

        fn memory(&self) -> &[u8] {
            self.mem.memory()
        }

        fn memory_mut(&mut self) -> &mut [u8] {
            self.mem.memory_mut()
        }

        fn stack_save(&mut self) -> Option<u32> {
            self.stack.then(|| self.ledger.lock().unwrap().stack_ptr)
        }

        fn stack_alloc(&mut self, bytes: u32) -> Option<u32> {
            let mut ledger = self.ledger.lock().unwrap();
            if bytes > 256 {
                return None;
            }
            ledger.stack_ptr -= (bytes + 15) & !15;
            Some(ledger.stack_ptr)
        }

        fn stack_restore(&mut self, saved: u32) {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.stack_ptr = saved;
            ledger.restores.push(saved);
        }

        fn malloc(&mut self, bytes: u32) -> Option<u32> {
            if !self.heap {
                return None;
            }
            let mut ledger = self.ledger.lock().unwrap();
            let ptr = ledger.next_heap;
            ledger.next_heap += (bytes + 7) & !7;
            Some(ptr)
        }

        fn free(&mut self, ptr: u32) {
            self.ledger.lock().unwrap().frees.push(ptr);
        }
    }

    #[test]
    fn test_stack_scratch_is_restored() {
        let (module, ledger) = ScratchModule::new(true, true);
        let mut bridge = HeapBridge::new(Box::new(module));
        {
            let mut scratch = bridge.scratch(24).unwrap();
            assert_eq!(scratch.kind(), ScratchKind::Stack);
            assert_eq!(scratch.ptr(), 512 - 32);
            let ptr = scratch.offset();
            assert!(scratch.write_slice(ptr, &[1.0f64, 2.0, 3.0]));
        }
        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.stack_ptr, 512);
        assert_eq!(ledger.restores, vec![512]);
        assert!(ledger.frees.is_empty());
    }

    #[test]
    fn test_falls_back_to_heap_when_stack_too_small() {
        let (module, ledger) = ScratchModule::new(true, true);
        let mut bridge = HeapBridge::new(Box::new(module));
        {
            let scratch = bridge.scratch(400).unwrap();
            assert_eq!(scratch.kind(), ScratchKind::Heap);
            assert_eq!(scratch.ptr(), 64);
        }
        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.frees, vec![64]);
        assert_eq!(ledger.stack_ptr, 512);
    }

    #[test]
    fn test_released_on_early_return() {
        fn failing(bridge: &mut HeapBridge) -> Result<(), BridgeError> {
            let scratch = bridge.scratch(16)?;
            let _ = scratch.ptr();
            Err(BridgeError::ScratchUnavailable(0))
        }

        let (module, ledger) = ScratchModule::new(false, true);
        let mut bridge = HeapBridge::new(Box::new(module));
        assert!(failing(&mut bridge).is_err());
        assert_eq!(ledger.lock().unwrap().frees, vec![64]);
    }

    #[test]
    fn test_no_scratch_primitives() {
        let (module, _ledger) = ScratchModule::new(false, false);
        let mut bridge = HeapBridge::new(Box::new(module));
        assert!(matches!(bridge.scratch(8), Err(BridgeError::ScratchUnavailable(8))));
    }
}
