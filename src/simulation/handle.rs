//! Loaded model handles
//!
//! A [`SimulationHandle`] is one model/data instance inside the engine. It
//! owns the handle's resolution table and lazily-resolved model/data
//! pointers, and translates every operation into the calling convention of
//! the handle's ABI variant.

use std::collections::HashMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::SimError;
use crate::bridge::{
    AbiVariant, Accessor, BridgeError, ExportId, HeapBridge, HeapElement, HeapView, HeapViewMut, ResolutionTable,
    SymbolResolver, Val,
};

/// Per-load model identity. State captured under one stamp is never applied
/// to a handle carrying another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelStamp(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub nq: usize,
    pub nv: usize,
    pub nu: usize,
    pub nbody: usize,
    pub ngeom: usize,
    pub njnt: usize,
    pub nkey: usize,
    pub nsensordata: usize,
}

/// Last error reported by the engine's diagnostic exports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineErrorInfo {
    pub errno: i32,
    pub errmsg: String,
}

/// Optional features the loaded engine build supports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub state: bool,
    pub keyframes: bool,
    pub option_struct: bool,
    pub xfrc: bool,
    pub apply_xfrc: bool,
    pub qfrc: bool,
    pub contacts: bool,
    pub sensors: bool,
    pub body_poses: bool,
    pub errors: bool,
    pub actuator_names: bool,
    pub missing: Vec<Accessor>,
}

impl Capabilities {
    fn of(table: &ResolutionTable) -> Self {
        let state = [Accessor::StateSize, Accessor::GetState, Accessor::SetState]
            .iter()
            .all(|&a| table.has(a));
        Self {
            state,
            keyframes: state && table.has(Accessor::ResetKeyframe),
            option_struct: table.has(Accessor::OptionStruct),
            xfrc: table.has(Accessor::XfrcApplied),
            apply_xfrc: table.has(Accessor::ApplyXfrc),
            qfrc: table.has(Accessor::QfrcApplied),
            contacts: table.has(Accessor::Ncon) && table.has(Accessor::ContactPos),
            sensors: table.has(Accessor::Sensordata),
            body_poses: table.has(Accessor::BodyXpos) && table.has(Accessor::BodyXmat),
            errors: table.has(Accessor::ErrnoLast),
            actuator_names: (table.has(Accessor::Names) && table.has(Accessor::ActuatorNameAdr))
                || table.has(Accessor::ActuatorNameOf),
            missing: table.missing(),
        }
    }
}

/// Read the engine's last errno/errmsg through whichever spelling exists
pub fn last_error(bridge: &mut HeapBridge, table: &ResolutionTable) -> EngineErrorInfo {
    let errno = table
        .get(Accessor::ErrnoLast)
        .and_then(|id| bridge.call(id, &[]).ok())
        .map_or(0, Val::as_i32);
    let errmsg = table
        .get(Accessor::ErrmsgLast)
        .and_then(|id| bridge.call(id, &[]).ok())
        .map(|ptr| bridge.read_cstr(ptr.as_offset()))
        .unwrap_or_default();
    EngineErrorInfo { errno, errmsg }
}

/// One loaded model instance
#[derive(Debug)]
pub struct SimulationHandle {
    id: i32,
    table: ResolutionTable,
    stamp: ModelStamp,
    model_ptr: Option<i64>,
    data_ptr: Option<i64>,
    dims: Dimensions,
    field_exports: HashMap<String, Option<ExportId>>,
    freed: bool,
}

impl SimulationHandle {
    /// Compile `source` into a new engine instance.
    ///
    /// Runs the module's one-time init if it has one, transfers the source
    /// through scratch memory, validates the new handle and runs a forward
    /// pass. A handle that fails validation is freed before returning.
    pub fn load(bridge: &mut HeapBridge, source: &str, stamp: ModelStamp) -> Result<Self, SimError> {
        let table = SymbolResolver::resolve_auto(bridge.module())?;
        if bridge.mark_initialized() {
            if let Some(init) = table.get(Accessor::Init) {
                bridge.call(init, &[])?;
            }
        }

        let make = table.require(Accessor::Make)?;
        let id = {
            let mut scratch = bridge.scratch(source.len() + 1)?;
            let ptr = scratch.offset();
            scratch.write_cstr(ptr, source)?;
            let ptr = scratch.ptr();
            scratch.call(make, &[Val::ptr(ptr)])
        };
        let id = match id {
            Ok(val) => val.as_i32(),
            Err(err) => return Err(load_failure(bridge, &table, err.to_string())),
        };
        if id <= 0 {
            return Err(load_failure(bridge, &table, "model constructor returned no handle".into()));
        }

        let mut handle = Self {
            id,
            stamp,
            model_ptr: None,
            data_ptr: None,
            dims: Dimensions::default(),
            field_exports: HashMap::new(),
            freed: false,
            table,
        };

        if let Err(err) = handle.validate(bridge) {
            handle.free(bridge);
            return Err(err);
        }
        handle.dims = handle.read_dims(bridge);
        if let Err(err) = handle.forward(bridge) {
            warn!("initial forward pass failed: {err}");
        }
        info!(
            "loaded model as handle {} ({} ABI, nq={}, nv={}, nu={}, nbody={})",
            handle.id,
            handle.variant(),
            handle.dims.nq,
            handle.dims.nv,
            handle.dims.nu,
            handle.dims.nbody
        );
        Ok(handle)
    }

    fn validate(&mut self, bridge: &mut HeapBridge) -> Result<(), SimError> {
        if let Some(valid) = self.table.get(Accessor::Valid) {
            if bridge.call(valid, &[self.handle_arg()])?.as_i32() == 0 {
                return Err(load_failure(bridge, &self.table, "engine rejected the new handle".into()));
            }
        }
        if self.variant() == AbiVariant::Current {
            self.pointers(bridge)?;
        }
        Ok(())
    }

    fn read_dims(&self, bridge: &mut HeapBridge) -> Dimensions {
        Dimensions {
            nq: self.count(bridge, Accessor::Nq),
            nv: self.count(bridge, Accessor::Nv),
            nu: self.count(bridge, Accessor::Nu),
            nbody: self.count(bridge, Accessor::Nbody),
            ngeom: self.count(bridge, Accessor::Ngeom),
            njnt: self.count(bridge, Accessor::Njnt),
            nkey: self.count(bridge, Accessor::Nkey),
            nsensordata: self.count(bridge, Accessor::Nsensordata),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn variant(&self) -> AbiVariant {
        self.table.variant()
    }

    pub fn stamp(&self) -> ModelStamp {
        self.stamp
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    pub fn table(&self) -> &ResolutionTable {
        &self.table
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::of(&self.table)
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }

    pub(crate) fn handle_arg(&self) -> Val {
        Val::I32(self.id)
    }

    /// Model and data pointers, resolved on first use and cached
    pub fn pointers(&mut self, bridge: &mut HeapBridge) -> Result<(i64, i64), SimError> {
        if let (Some(model), Some(data)) = (self.model_ptr, self.data_ptr) {
            return Ok((model, data));
        }
        if self.freed {
            return Err(SimError::NoModel);
        }
        let model_id = self.table.get(Accessor::ModelPtr);
        let data_id = self.table.get(Accessor::DataPtr);
        let (Some(model_id), Some(data_id)) = (model_id, data_id) else {
            return Err(SimError::PointersUnavailable);
        };
        let model = bridge.call(model_id, &[self.handle_arg()])?.as_offset();
        let data = bridge.call(data_id, &[self.handle_arg()])?.as_offset();
        if model <= 0 || data <= 0 {
            return Err(SimError::PointersUnavailable);
        }
        debug!("handle {}: model@{model} data@{data}", self.id);
        self.model_ptr = Some(model);
        self.data_ptr = Some(data);
        Ok((model, data))
    }

    /// Leading arguments of model-level calls: `(model)` or `(handle)`
    pub(crate) fn model_args(&mut self, bridge: &mut HeapBridge) -> Result<Vec<Val>, SimError> {
        match self.variant() {
            AbiVariant::Current => {
                let (model, _) = self.pointers(bridge)?;
                Ok(vec![Val::I32(model as i32)])
            }
            AbiVariant::Legacy => Ok(vec![self.handle_arg()]),
        }
    }

    /// Leading arguments of data-level calls: `(model, data)` or `(handle)`
    pub(crate) fn data_args(&mut self, bridge: &mut HeapBridge) -> Result<Vec<Val>, SimError> {
        match self.variant() {
            AbiVariant::Current => {
                let (model, data) = self.pointers(bridge)?;
                Ok(vec![Val::I32(model as i32), Val::I32(data as i32)])
            }
            AbiVariant::Legacy => Ok(vec![self.handle_arg()]),
        }
    }

    /// Convert a failed engine call into an error carrying errno/errmsg
    pub(crate) fn engine_error(&self, bridge: &mut HeapBridge, operation: &'static str, err: BridgeError) -> SimError {
        match err {
            BridgeError::Trap(trap) => {
                let info = last_error(bridge, &self.table);
                SimError::Engine {
                    operation,
                    message: trap.message,
                    errno: info.errno,
                    errmsg: info.errmsg,
                }
            }
            other => SimError::Bridge(other),
        }
    }

    pub fn last_error(&self, bridge: &mut HeapBridge) -> EngineErrorInfo {
        last_error(bridge, &self.table)
    }

    pub fn abi_version(&self, bridge: &mut HeapBridge) -> i32 {
        self.table
            .get(Accessor::AbiVersion)
            .and_then(|id| bridge.call(id, &[]).ok())
            .map_or(0, Val::as_i32)
    }

    /// Value of a count accessor, 0 when unavailable
    pub fn count(&self, bridge: &mut HeapBridge, accessor: Accessor) -> usize {
        if self.freed {
            return 0;
        }
        self.table
            .get(accessor)
            .and_then(|id| bridge.call(id, &[self.handle_arg()]).ok())
            .map_or(0, |v| v.as_i32().max(0) as usize)
    }

    /// Offset of an array accessor, 0 when unavailable
    pub fn array_ptr(&self, bridge: &mut HeapBridge, accessor: Accessor) -> i64 {
        if self.freed {
            return 0;
        }
        self.table
            .get(accessor)
            .and_then(|id| bridge.call(id, &[self.handle_arg()]).ok())
            .map_or(0, Val::as_offset)
    }

    pub fn view<'b, T: HeapElement>(&self, bridge: &'b mut HeapBridge, accessor: Accessor, len: usize) -> HeapView<'b, T> {
        let ptr = self.array_ptr(bridge, accessor);
        bridge.view(ptr, len as i64)
    }

    pub fn view_mut<'b, T: HeapElement>(
        &self,
        bridge: &'b mut HeapBridge,
        accessor: Accessor,
        len: usize,
    ) -> HeapViewMut<'b, T> {
        let ptr = self.array_ptr(bridge, accessor);
        bridge.view_mut(ptr, len as i64)
    }

    /// Copy of an array; empty on any validity failure
    pub fn read_array<T: HeapElement>(&self, bridge: &mut HeapBridge, accessor: Accessor, len: usize) -> Vec<T> {
        self.view::<T>(bridge, accessor, len).to_vec()
    }

    /// Number of active contacts
    pub fn ncon(&self, bridge: &mut HeapBridge) -> usize {
        self.count(bridge, Accessor::Ncon)
    }

    /// Advance `n` steps. Stops at the first failure.
    pub fn step(&mut self, bridge: &mut HeapBridge, n: u32) -> Result<(), SimError> {
        let step = self.table.require(Accessor::Step)?;
        match self.variant() {
            AbiVariant::Current => {
                let args = self.data_args(bridge)?;
                for _ in 0..n {
                    if let Err(err) = bridge.call(step, &args) {
                        return Err(self.engine_error(bridge, "step", err));
                    }
                }
                Ok(())
            }
            AbiVariant::Legacy => {
                let args = [self.handle_arg(), Val::I32(n.min(i32::MAX as u32) as i32)];
                match bridge.call(step, &args) {
                    Ok(v) if v.as_i32() == 1 => Ok(()),
                    Ok(_) => {
                        let info = self.last_error(bridge);
                        Err(SimError::Engine {
                            operation: "step",
                            message: "engine reported step failure".into(),
                            errno: info.errno,
                            errmsg: info.errmsg,
                        })
                    }
                    Err(err) => Err(self.engine_error(bridge, "step", err)),
                }
            }
        }
    }

    /// Reset to the model's initial state and recompute derived quantities
    pub fn reset(&mut self, bridge: &mut HeapBridge) -> Result<(), SimError> {
        let reset = self.table.require(Accessor::Reset)?;
        let args = self.data_args(bridge)?;
        match bridge.call(reset, &args) {
            Ok(v) if self.variant() == AbiVariant::Legacy && v.as_i32() != 1 => {
                let info = self.last_error(bridge);
                return Err(SimError::Engine {
                    operation: "reset",
                    message: "engine reported reset failure".into(),
                    errno: info.errno,
                    errmsg: info.errmsg,
                });
            }
            Ok(_) => {}
            Err(err) => return Err(self.engine_error(bridge, "reset", err)),
        }
        self.forward(bridge)
    }

    /// Recompute derived quantities without advancing time. A no-op on
    /// builds without a forward export.
    pub fn forward(&mut self, bridge: &mut HeapBridge) -> Result<(), SimError> {
        let Some(forward) = self.table.get(Accessor::Forward) else {
            return Ok(());
        };
        let args = self.data_args(bridge)?;
        bridge
            .call(forward, &args)
            .map(|_| ())
            .map_err(|err| self.engine_error(bridge, "forward", err))
    }

    /// Reset to native keyframe `key`
    pub fn reset_keyframe(&mut self, bridge: &mut HeapBridge, key: usize) -> Result<(), SimError> {
        let reset = self.table.require(Accessor::ResetKeyframe)?;
        let mut args = self.data_args(bridge)?;
        args.push(Val::I32(key as i32));
        bridge
            .call(reset, &args)
            .map(|_| ())
            .map_err(|err| self.engine_error(bridge, "resetKeyframe", err))?;
        self.forward(bridge)
    }

    /// Simulation time, read through a pointer (current) or by value (legacy)
    pub fn time(&self, bridge: &mut HeapBridge) -> f64 {
        self.scalar_accessor(bridge, Accessor::Time).unwrap_or(0.0)
    }

    /// Engine timestep, `None` when the build does not expose it
    pub fn timestep(&self, bridge: &mut HeapBridge) -> Option<f64> {
        self.scalar_accessor(bridge, Accessor::Timestep)
            .filter(|dt| dt.is_finite() && *dt > 0.0)
    }

    fn scalar_accessor(&self, bridge: &mut HeapBridge, accessor: Accessor) -> Option<f64> {
        if self.freed {
            return None;
        }
        let id = self.table.get(accessor)?;
        let value = bridge.call(id, &[self.handle_arg()]).ok()?;
        match self.variant() {
            AbiVariant::Current => bridge.read::<f64>(value.as_offset()),
            AbiVariant::Legacy => Some(value.as_f64()),
        }
    }

    /// Control ranges, `None` for unlimited actuators
    pub fn ctrl_ranges(&self, bridge: &mut HeapBridge) -> Vec<Option<(f64, f64)>> {
        let nu = self.dims.nu;
        let raw = self.read_array::<f64>(bridge, Accessor::CtrlRange, 2 * nu);
        (0..nu)
            .map(|i| {
                let (lo, hi) = (raw.get(2 * i).copied()?, raw.get(2 * i + 1).copied()?);
                (lo.is_finite() && hi.is_finite() && hi - lo > 1e-12).then_some((lo, hi))
            })
            .collect()
    }

    /// Actuator names; empty strings where the build provides none
    pub fn actuator_names(&self, bridge: &mut HeapBridge) -> Vec<String> {
        let nu = self.dims.nu;
        if let Some(name_of) = self.table.get(Accessor::ActuatorNameOf) {
            return (0..nu)
                .map(|i| {
                    bridge
                        .call(name_of, &[self.handle_arg(), Val::I32(i as i32)])
                        .map(|ptr| bridge.read_cstr(ptr.as_offset()))
                        .unwrap_or_default()
                })
                .collect();
        }
        let names = self.array_ptr(bridge, Accessor::Names);
        let adr = self.read_array::<i32>(bridge, Accessor::ActuatorNameAdr, nu);
        if names <= 0 || adr.len() != nu {
            return vec![String::new(); nu];
        }
        adr.iter()
            .map(|&offset| if offset >= 0 { bridge.read_cstr(names + offset as i64) } else { String::new() })
            .collect()
    }

    /// Pointer returned by a named struct-field export, cached per handle
    pub fn field_ptr(&mut self, bridge: &mut HeapBridge, export: &str) -> i64 {
        let id = *self
            .field_exports
            .entry(export.to_string())
            .or_insert_with(|| bridge.lookup(export));
        id.and_then(|id| bridge.call(id, &[self.handle_arg()]).ok())
            .map_or(0, Val::as_offset)
    }

    /// Release the engine instance. Idempotent.
    pub fn free(&mut self, bridge: &mut HeapBridge) {
        if self.freed {
            return;
        }
        if let Some(free) = self.table.get(Accessor::Free) {
            if let Err(err) = bridge.call(free, &[self.handle_arg()]) {
                warn!("freeing handle {} failed: {err}", self.id);
            }
        }
        debug!("freed handle {}", self.id);
        self.freed = true;
        self.model_ptr = None;
        self.data_ptr = None;
        self.field_exports.clear();
    }
}

fn load_failure(bridge: &mut HeapBridge, table: &ResolutionTable, message: String) -> SimError {
    let info = last_error(bridge, table);
    SimError::LoadFailed {
        message,
        errno: info.errno,
        errmsg: info.errmsg,
    }
}
