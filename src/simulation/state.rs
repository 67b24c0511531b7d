//! Serialized simulation state
//!
//! The engine negotiates the size of a state vector for a component bitmask
//! ("signature"); capture and apply move that vector through a scoped scratch
//! block. Signatures are opaque here: the runtime only ever asks the engine
//! how large one is.

use serde::{Deserialize, Serialize};

use super::handle::{ModelStamp, SimulationHandle};
use super::SimError;
use crate::bridge::{Accessor, HeapBridge, Val};

/// Engine state-component bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateSignature(pub u32);

impl StateSignature {
    /// Everything needed to resume integration bit-for-bit
    pub const INTEGRATION: Self = Self(0x1fff);
    /// Positions, velocities and actuator activations
    pub const PHYSICS: Self = Self(0x000e);

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Default for StateSignature {
    fn default() -> Self {
        Self::INTEGRATION
    }
}

/// A captured state vector, bound to the signature and model it came from
#[derive(Debug, Clone, PartialEq)]
pub struct StateBuffer {
    signature: StateSignature,
    stamp: ModelStamp,
    values: Vec<f64>,
}

impl StateBuffer {
    /// Zeroed buffer of `size` elements
    pub fn zeroed(signature: StateSignature, stamp: ModelStamp, size: usize) -> Self {
        Self {
            signature,
            stamp,
            values: vec![0.0; size],
        }
    }

    pub fn signature(&self) -> StateSignature {
        self.signature
    }

    pub fn stamp(&self) -> ModelStamp {
        self.stamp
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn byte_len(&self) -> usize {
        self.values.len() * std::mem::size_of::<f64>()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

impl SimulationHandle {
    /// Number of f64 elements in a state vector of `signature`; 0 when the
    /// build cannot serialize state
    pub fn state_size(&mut self, bridge: &mut HeapBridge, signature: StateSignature) -> usize {
        let Some(size_fn) = self.table().get(Accessor::StateSize) else {
            return 0;
        };
        let Ok(mut args) = self.model_args(bridge) else {
            return 0;
        };
        args.push(Val::I32(signature.bits() as i32));
        bridge
            .call(size_fn, &args)
            .map_or(0, |v| v.as_i32().max(0) as usize)
    }

    /// Capture a fresh buffer
    pub fn capture_state(&mut self, bridge: &mut HeapBridge, signature: StateSignature) -> Result<StateBuffer, SimError> {
        let size = self.state_size(bridge, signature);
        let mut buffer = StateBuffer::zeroed(signature, self.stamp(), size);
        self.capture_into(bridge, &mut buffer)?;
        Ok(buffer)
    }

    /// Capture into an existing buffer, reusing its allocation
    pub fn capture_into(&mut self, bridge: &mut HeapBridge, buffer: &mut StateBuffer) -> Result<(), SimError> {
        if buffer.stamp != self.stamp() {
            return Err(SimError::StateMismatch("buffer belongs to another model".into()));
        }
        let size = buffer.size();
        if size == 0 {
            return Err(SimError::StateMismatch("empty state buffer".into()));
        }
        let get = self.table().require(Accessor::GetState)?;
        let mut args = self.data_args(bridge)?;

        let mut scratch = bridge.scratch(buffer.byte_len())?;
        args.push(Val::ptr(scratch.ptr()));
        args.push(Val::I32(buffer.signature.bits() as i32));
        if let Err(err) = scratch.call(get, &args) {
            return Err(self.engine_error(&mut scratch, "getState", err));
        }
        let ptr = scratch.offset();
        let view = scratch.view::<f64>(ptr, size as i64);
        if view.len() != size {
            return Err(SimError::StateMismatch(format!(
                "engine produced {} of {size} state elements",
                view.len()
            )));
        }
        buffer.values.copy_from_slice(&view);
        Ok(())
    }

    /// Write `buffer` back into the engine and run a forward pass.
    ///
    /// Returns `Ok(false)` without touching the engine when the buffer was
    /// captured from another model or its size no longer matches.
    pub fn apply_state(&mut self, bridge: &mut HeapBridge, buffer: &StateBuffer) -> Result<bool, SimError> {
        if buffer.stamp != self.stamp() || buffer.values.is_empty() {
            return Ok(false);
        }
        if self.state_size(bridge, buffer.signature) != buffer.size() {
            return Ok(false);
        }
        let set = self.table().require(Accessor::SetState)?;
        let mut args = self.data_args(bridge)?;
        {
            let mut scratch = bridge.scratch(buffer.byte_len())?;
            let ptr = scratch.offset();
            if !scratch.write_slice(ptr, &buffer.values) {
                return Ok(false);
            }
            args.push(Val::ptr(scratch.ptr()));
            args.push(Val::I32(buffer.signature.bits() as i32));
            if let Err(err) = scratch.call(set, &args) {
                return Err(self.engine_error(&mut scratch, "setState", err));
            }
        }
        self.forward(bridge)?;
        Ok(true)
    }
}
