//! Keyframe slots: the model's own keyframes followed by user slots

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::handle::SimulationHandle;
use super::state::{StateBuffer, StateSignature};
use super::SimError;
use crate::bridge::HeapBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Native,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotMeta {
    pub index: usize,
    pub label: String,
    pub kind: SlotKind,
    pub available: bool,
}

/// Wire form of the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyframeMeta {
    pub capacity: usize,
    pub count: usize,
    pub slots: Vec<SlotMeta>,
    pub last_saved: Option<usize>,
    pub last_loaded: Option<usize>,
    pub selected: Option<usize>,
}

#[derive(Debug)]
struct Slot {
    label: String,
    kind: SlotKind,
    state: Option<StateBuffer>,
}

#[derive(Debug)]
pub struct KeyframeStore {
    user_slots: usize,
    signature: StateSignature,
    slots: Vec<Slot>,
    selected: usize,
    last_saved: Option<usize>,
    last_loaded: Option<usize>,
}

impl KeyframeStore {
    pub fn new(user_slots: usize, signature: StateSignature) -> Self {
        Self {
            user_slots,
            signature,
            slots: Vec::new(),
            selected: 0,
            last_saved: None,
            last_loaded: None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn is_available(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|s| s.state.is_some())
    }

    fn clamp(&self, index: usize) -> usize {
        index.min(self.slots.len().saturating_sub(1))
    }

    /// Rebuild the slots for a freshly loaded model.
    ///
    /// Each native keyframe is probed by resetting to it and capturing; the
    /// state from before the probe is restored afterwards. A model without
    /// native keyframes gets its initial state in the first user slot.
    pub fn populate(&mut self, handle: &mut SimulationHandle, bridge: &mut HeapBridge) -> Result<(), SimError> {
        let native = handle.dims().nkey;
        self.slots = (0..native + self.user_slots)
            .map(|i| Slot {
                label: if i < native {
                    format!("Model Key {i}")
                } else {
                    format!("User Slot {}", i - native + 1)
                },
                kind: if i < native { SlotKind::Native } else { SlotKind::User },
                state: None,
            })
            .collect();
        self.selected = self.clamp(self.selected);
        self.last_saved = None;
        self.last_loaded = None;

        if !handle.capabilities().state || handle.state_size(bridge, self.signature) == 0 {
            warn!("engine cannot serialize state; keyframes disabled");
            return Ok(());
        }
        let restore = handle.capture_state(bridge, self.signature)?;
        if native == 0 {
            if let Some(first) = self.slots.first_mut() {
                first.state = Some(restore);
            }
            return Ok(());
        }
        if !handle.capabilities().keyframes {
            return Ok(());
        }
        let read = self.read_native_keys(handle, bridge, native);
        // the live state comes back even when a key could not be read
        handle.apply_state(bridge, &restore)?;
        read?;
        debug!("keyframes populated: {native} native, {} user", self.user_slots);
        Ok(())
    }

    fn read_native_keys(
        &mut self,
        handle: &mut SimulationHandle,
        bridge: &mut HeapBridge,
        native: usize,
    ) -> Result<(), SimError> {
        for key in 0..native {
            match handle.reset_keyframe(bridge, key) {
                Ok(()) => self.slots[key].state = Some(handle.capture_state(bridge, self.signature)?),
                Err(err) => warn!("native keyframe {key} unavailable: {err}"),
            }
        }
        Ok(())
    }

    /// Capture into `index` (clamped), or the selected slot when absent.
    /// Returns the slot used.
    pub fn save(
        &mut self,
        handle: &mut SimulationHandle,
        bridge: &mut HeapBridge,
        index: Option<usize>,
    ) -> Result<Option<usize>, SimError> {
        if self.slots.is_empty() || handle.state_size(bridge, self.signature) == 0 {
            return Ok(None);
        }
        let target = self.clamp(index.unwrap_or(self.selected));
        let state = handle.capture_state(bridge, self.signature)?;
        self.slots[target].state = Some(state);
        self.last_saved = Some(target);
        self.selected = target;
        Ok(Some(target))
    }

    /// Apply slot `index` (clamped) if it holds a state
    pub fn load(&mut self, handle: &mut SimulationHandle, bridge: &mut HeapBridge, index: usize) -> Result<bool, SimError> {
        if self.slots.is_empty() {
            return Ok(false);
        }
        let target = self.clamp(index);
        let Some(state) = self.slots[target].state.as_ref() else {
            return Ok(false);
        };
        if !handle.apply_state(bridge, state)? {
            return Ok(false);
        }
        self.last_loaded = Some(target);
        self.selected = target;
        Ok(true)
    }

    pub fn select(&mut self, index: usize) -> usize {
        self.selected = self.clamp(index);
        self.selected
    }

    pub fn meta(&self) -> KeyframeMeta {
        let slots: Vec<SlotMeta> = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotMeta {
                index,
                label: slot.label.clone(),
                kind: slot.kind,
                available: slot.state.is_some(),
            })
            .collect();
        KeyframeMeta {
            capacity: slots.len(),
            count: slots.iter().filter(|s| s.available).count(),
            slots,
            last_saved: self.last_saved,
            last_loaded: self.last_loaded,
            selected: (!self.slots.is_empty()).then_some(self.selected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{AbiVariant, Accessor};
    use crate::engine::reference::{models, FaultPlan, ReferenceEngine};
    use crate::simulation::handle::tests::loaded;
    use crate::simulation::handle::ModelStamp;

    #[test]
    fn test_native_slots_are_probed_and_state_restored() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::PENDULUM);
        handle.step(&mut bridge, 20).unwrap();
        let before = handle.capture_state(&mut bridge, StateSignature::INTEGRATION).unwrap();

        let mut store = KeyframeStore::new(5, StateSignature::INTEGRATION);
        store.populate(&mut handle, &mut bridge).unwrap();
        let meta = store.meta();
        assert_eq!(meta.capacity, 2 + 5);
        assert_eq!(meta.count, 2);
        assert_eq!(meta.slots[1].label, "Model Key 1");
        assert_eq!(meta.slots[2].label, "User Slot 1");
        assert_eq!(meta.slots[2].kind, SlotKind::User);

        let after = handle.capture_state(&mut bridge, StateSignature::INTEGRATION).unwrap();
        assert_eq!(before, after);

        assert!(store.load(&mut handle, &mut bridge, 1).unwrap());
        let qpos = handle.read_array::<f64>(&mut bridge, Accessor::Qpos, 1);
        assert_eq!(qpos, vec![1.2]);
    }

    #[test]
    fn test_failed_native_read_restores_live_state() {
        let faults = FaultPlan::new();
        let engine = ReferenceEngine::new(AbiVariant::Current).with_faults(faults.clone());
        let mut bridge = HeapBridge::new(Box::new(engine));
        let mut handle = SimulationHandle::load(&mut bridge, models::PENDULUM, ModelStamp(1)).unwrap();
        handle.step(&mut bridge, 20).unwrap();
        let live = handle.read_array::<f64>(&mut bridge, Accessor::Qpos, 1);

        // the restore point is read, then the first native key read fails
        faults.fail_get_state_after(1);
        let mut store = KeyframeStore::new(5, StateSignature::INTEGRATION);
        assert!(store.populate(&mut handle, &mut bridge).is_err());
        assert_eq!(handle.read_array::<f64>(&mut bridge, Accessor::Qpos, 1), live);
        assert!(!store.is_available(0));
    }

    #[test]
    fn test_save_load_round_trip() {
        for variant in [AbiVariant::Current, AbiVariant::Legacy] {
            let (mut bridge, mut handle) = loaded(variant, models::CART_POLE);
            let mut store = KeyframeStore::new(5, StateSignature::INTEGRATION);
            store.populate(&mut handle, &mut bridge).unwrap();
            handle.step(&mut bridge, 30).unwrap();
            let saved = handle.capture_state(&mut bridge, StateSignature::INTEGRATION).unwrap();

            assert_eq!(store.save(&mut handle, &mut bridge, Some(3)).unwrap(), Some(3));
            handle.step(&mut bridge, 30).unwrap();
            assert!(store.load(&mut handle, &mut bridge, 3).unwrap());
            let restored = handle.capture_state(&mut bridge, StateSignature::INTEGRATION).unwrap();
            assert_eq!(saved, restored);
            assert_eq!(store.meta().last_loaded, Some(3));
        }
    }

    #[test]
    fn test_indices_clamp_and_default_to_selected() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::FALLING_BALL);
        let mut store = KeyframeStore::new(5, StateSignature::PHYSICS);
        store.populate(&mut handle, &mut bridge).unwrap();
        // no native keys: the initial state seeds the first slot
        assert!(store.is_available(0));
        assert_eq!(store.select(99), 4);
        assert_eq!(store.save(&mut handle, &mut bridge, None).unwrap(), Some(4));
        assert!(!store.load(&mut handle, &mut bridge, 2).unwrap());
        assert_eq!(store.meta().last_saved, Some(4));
    }
}
