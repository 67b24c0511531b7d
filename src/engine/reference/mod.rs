//! # Reference Engine Module
//!
//! A self-contained [`EngineModule`] that speaks either ABI variant over its
//! own growable linear memory. It stands in for a natively-compiled physics
//! binary so the bridge, scheduler, history and protocol can run anywhere.
//!
//! ```
//! use forgebridge::engine::reference::{models, ReferenceEngine};
//! use forgebridge::bridge::AbiVariant;
//!
//! let engine = ReferenceEngine::new(AbiVariant::Current);
//! assert!(models::FALLING_BALL.contains("free"));
//! # drop(engine);
//! ```

mod dynamics;
mod exports;
mod layout;
mod memory;
pub mod model;
pub mod models;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace};

use crate::bridge::{AbiVariant, EngineModule, EngineTrap, ExportId, RegionId, Val};

use exports::{Array, Count, Export};
use layout::Instance;
use memory::{LinearMemory, ERRMSG_CAP, ERRMSG_PTR};
use model::ModelSpec;

pub use dynamics::{STATE_ALL, STATE_CTRL, STATE_QPOS, STATE_QVEL, STATE_TIME, STATE_XFRC_APPLIED};

const ABI_VERSION_CURRENT: i32 = 3;
const ABI_VERSION_LEGACY: i32 = 1;

const ERR_PARSE: i32 = 1;
const ERR_HANDLE: i32 = 2;
const ERR_STEP: i32 = 3;
const ERR_STATE: i32 = 4;
const ERR_INJECTED: i32 = 5;

#[derive(Debug, Default)]
struct FaultState {
    fail_after_steps: Option<u64>,
    grow_on_step: bool,
    reject_make: bool,
    get_state_budget: Option<u64>,
}

/// Shared fault-injection switches.
///
/// Clones share state, so a test can keep one clone and flip switches after
/// the engine has been handed to a session.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    inner: Arc<Mutex<FaultState>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut FaultState) -> R) -> R {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Every step fails once the instance has taken `steps` steps
    pub fn fail_after_steps(&self, steps: u64) {
        self.with(|s| s.fail_after_steps = Some(steps));
    }

    /// Grow (and so relocate) linear memory on every step call
    pub fn grow_on_step(&self, enabled: bool) {
        self.with(|s| s.grow_on_step = enabled);
    }

    /// Make every model constructor call fail
    pub fn reject_make(&self, enabled: bool) {
        self.with(|s| s.reject_make = enabled);
    }

    /// State reads succeed `calls` more times, then every one fails
    pub fn fail_get_state_after(&self, calls: u64) {
        self.with(|s| s.get_state_budget = Some(calls));
    }

    pub fn clear(&self) {
        self.with(|s| *s = FaultState::default());
    }
}

/// Reference engine built as one ABI variant
pub struct ReferenceEngine {
    variant: AbiVariant,
    memory: LinearMemory,
    instances: Vec<Option<Instance>>,
    exports: Vec<(String, Export)>,
    by_name: HashMap<String, ExportId>,
    errno: i32,
    faults: FaultPlan,
    stack_enabled: bool,
}

impl ReferenceEngine {
    pub fn new(variant: AbiVariant) -> Self {
        let exports = exports::table(variant);
        let by_name = exports
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), ExportId(i as u32)))
            .collect();
        Self {
            variant,
            memory: LinearMemory::new(4),
            instances: Vec::new(),
            exports,
            by_name,
            errno: 0,
            faults: FaultPlan::new(),
            stack_enabled: true,
        }
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Disable the stack scratch primitives so callers fall back to malloc
    pub fn without_stack(mut self) -> Self {
        self.stack_enabled = false;
        self
    }

    pub fn variant(&self) -> AbiVariant {
        self.variant
    }

    pub fn faults(&self) -> FaultPlan {
        self.faults.clone()
    }

    pub fn live_instances(&self) -> usize {
        self.instances.iter().filter(|i| i.is_some()).count()
    }

    fn fail(&mut self, code: i32, message: &str) {
        self.errno = code;
        self.memory.write_cstr(ERRMSG_PTR, message, ERRMSG_CAP);
    }

    fn trap(&mut self, export: &str, code: i32, message: String) -> EngineTrap {
        self.fail(code, &message);
        EngineTrap::new(export, message)
    }

    fn by_handle(&self, handle: i32) -> Option<usize> {
        let index = usize::try_from(handle).ok()?.checked_sub(1)?;
        self.instances.get(index)?.as_ref().map(|_| index)
    }

    fn by_model(&self, model: i64) -> Option<usize> {
        self.instances
            .iter()
            .position(|i| i.as_ref().is_some_and(|i| i64::from(i.layout.model) == model))
    }

    /// Instance addressed by the first argument under this variant's
    /// convention: a model pointer for current builds, a handle for legacy
    fn target(&self, args: &[Val]) -> Option<usize> {
        match self.variant {
            AbiVariant::Current => self.by_model(arg(args, 0).as_offset()),
            AbiVariant::Legacy => self.by_handle(arg(args, 0).as_i32()),
        }
    }

    fn make(&mut self, ptr: i64) -> Val {
        if self.faults.with(|s| s.reject_make) {
            self.fail(ERR_INJECTED, "model compilation rejected");
            return Val::I32(0);
        }
        let text = u32::try_from(ptr).ok().and_then(|p| self.memory.read_cstr(p));
        let Some(text) = text else {
            self.fail(ERR_PARSE, "model source pointer invalid");
            return Val::I32(0);
        };
        match ModelSpec::parse(&text) {
            Ok(spec) => {
                let instance = Instance::create(&mut self.memory, spec);
                let slot = match self.instances.iter().position(Option::is_none) {
                    Some(free) => free,
                    None => {
                        self.instances.push(None);
                        self.instances.len() - 1
                    }
                };
                debug!(
                    "reference engine: compiled model (nq={}, nv={}, nu={}) as handle {}",
                    instance.dims.nq,
                    instance.dims.nv,
                    instance.dims.nu,
                    slot + 1
                );
                self.instances[slot] = Some(instance);
                self.errno = 0;
                Val::I32(slot as i32 + 1)
            }
            Err(message) => {
                self.fail(ERR_PARSE, &message);
                Val::I32(0)
            }
        }
    }

    fn step(&mut self, name: &str, index: usize, count: i64) -> Result<(), EngineTrap> {
        for _ in 0..count.max(1) {
            if self.faults.with(|s| s.grow_on_step) {
                self.memory.grow(1);
            }
            let Some(instance) = self.instances[index].as_mut() else {
                return Err(self.trap(name, ERR_HANDLE, "instance freed".into()));
            };
            if let Some(limit) = self.faults.with(|s| s.fail_after_steps) {
                if instance.steps >= limit {
                    return Err(self.trap(name, ERR_INJECTED, format!("injected failure at step {limit}")));
                }
            }
            if let Err(message) = dynamics::step(&mut self.memory, instance) {
                return Err(self.trap(name, ERR_STEP, message));
            }
        }
        Ok(())
    }

    fn count(instance: &Instance, count: Count) -> i32 {
        let dims = instance.dims;
        let value = match count {
            Count::Nq => dims.nq,
            Count::Nv => dims.nv,
            Count::Nu => dims.nu,
            Count::Nbody => dims.nbody,
            Count::Ngeom => dims.ngeom,
            Count::Njnt => dims.njnt,
            Count::Nkey => dims.nkey,
            Count::Nsensordata => dims.nsensordata,
            Count::Ncon => instance.ncon,
        };
        value as i32
    }

    fn array(instance: &Instance, array: Array) -> u32 {
        let l = &instance.layout;
        match array {
            Array::Qpos => l.qpos,
            Array::Qvel => l.qvel,
            Array::Ctrl => l.ctrl,
            Array::XfrcApplied => l.xfrc_applied,
            Array::QfrcApplied => l.qfrc_applied,
            Array::GeomXpos => l.geom_xpos,
            Array::GeomXmat => l.geom_xmat,
            Array::Xpos => l.xpos,
            Array::Xmat => l.xmat,
            Array::Xipos => l.xipos,
            Array::Sensordata => l.sensordata,
            Array::ContactPos => l.contact_pos,
            Array::ContactFrame => l.contact_frame,
            Array::ContactGeom1 => l.contact_geom1,
            Array::ContactGeom2 => l.contact_geom2,
            Array::CtrlRange => l.ctrlrange,
            Array::GeomBodyId => l.geom_bodyid,
            Array::Names => l.names,
            Array::NameAdr => l.name_actuatoradr,
        }
    }

    fn dispatch(&mut self, name: &str, export: Export, args: &[Val]) -> Result<Val, EngineTrap> {
        let current = self.variant == AbiVariant::Current;
        let handle = self.by_handle(arg(args, 0).as_i32());
        let ok = Ok(Val::I32(0));
        match export {
            Export::Init => ok,
            Export::AbiVersion => Ok(Val::I32(if current {
                ABI_VERSION_CURRENT
            } else {
                ABI_VERSION_LEGACY
            })),
            Export::Errno => Ok(Val::I32(self.errno)),
            Export::Errmsg => Ok(Val::ptr(ERRMSG_PTR)),
            Export::Make => Ok(self.make(arg(args, 0).as_offset())),
            Export::Free => {
                if let Some(index) = handle {
                    if let Some(instance) = self.instances[index].take() {
                        self.memory.release(instance.layout.model);
                    }
                }
                ok
            }
            Export::Valid => Ok(Val::I32(i32::from(handle.is_some()))),
            Export::ModelPtr | Export::DataPtr => {
                let pointers = handle
                    .and_then(|i| self.instances[i].as_ref())
                    .map(|instance| (instance.layout.model, instance.layout.data));
                match pointers {
                    Some((model, _)) if export == Export::ModelPtr => Ok(Val::ptr(model)),
                    Some((_, data)) => Ok(Val::ptr(data)),
                    None => {
                        self.fail(ERR_HANDLE, "invalid handle");
                        ok
                    }
                }
            }
            Export::Step => {
                let Some(index) = self.target(args) else {
                    return Err(self.trap(name, ERR_HANDLE, "invalid model or data".into()));
                };
                let count = if current { 1 } else { arg(args, 1).as_i32().into() };
                self.step(name, index, count)?;
                Ok(Val::I32(i32::from(!current)))
            }
            Export::Reset | Export::Forward => {
                let Some(index) = self.target(args) else {
                    return Err(self.trap(name, ERR_HANDLE, "invalid model or data".into()));
                };
                if let Some(instance) = self.instances[index].as_mut() {
                    if export == Export::Reset {
                        dynamics::reset(&mut self.memory, instance);
                    } else {
                        dynamics::forward(&mut self.memory, instance);
                    }
                }
                Ok(Val::I32(i32::from(!current)))
            }
            Export::Count(count) => Ok(Val::I32(
                handle
                    .and_then(|i| self.instances[i].as_ref())
                    .map_or(0, |instance| Self::count(instance, count)),
            )),
            Export::Array(array) => Ok(Val::ptr(
                handle
                    .and_then(|i| self.instances[i].as_ref())
                    .map_or(0, |instance| Self::array(instance, array)),
            )),
            Export::Time | Export::Timestep => {
                let Some(instance) = handle.and_then(|i| self.instances[i].as_ref()) else {
                    return Ok(if current { Val::I32(0) } else { Val::F64(0.0) });
                };
                let ptr = if export == Export::Time {
                    instance.layout.time
                } else {
                    instance.layout.opt
                };
                Ok(if current {
                    Val::ptr(ptr)
                } else {
                    Val::F64(self.memory.read_f64(ptr))
                })
            }
            Export::OptionPtr => Ok(Val::ptr(
                handle
                    .and_then(|i| self.instances[i].as_ref())
                    .map_or(0, |instance| instance.layout.opt),
            )),
            Export::Field(kind, offset) => Ok(Val::ptr(
                handle
                    .and_then(|i| self.instances[i].as_ref())
                    .map_or(0, |instance| instance.layout.struct_base(kind) + offset),
            )),
            Export::ActuatorNameOf => {
                let index = usize::try_from(arg(args, 1).as_i32()).ok();
                let ptr = handle
                    .and_then(|i| self.instances[i].as_ref())
                    .zip(index)
                    .filter(|(instance, index)| *index < instance.dims.nu)
                    .map_or(0, |(instance, index)| {
                        let adr = self.memory.read_i32(instance.layout.name_actuatoradr + 4 * index as u32);
                        instance.layout.names + adr as u32
                    });
                Ok(Val::ptr(ptr))
            }
            Export::StateSize => {
                let Some(instance) = self.target(args).and_then(|i| self.instances[i].as_ref()) else {
                    return Ok(Val::I32(0));
                };
                match dynamics::state_size(instance, arg(args, 1).as_i32() as u32) {
                    Ok(size) => Ok(Val::I32(size as i32)),
                    Err(message) => Err(self.trap(name, ERR_STATE, message)),
                }
            }
            Export::GetState | Export::SetState => {
                let base = if current { 2 } else { 1 };
                let Some(index) = self.target(args) else {
                    return Err(self.trap(name, ERR_HANDLE, "invalid model or data".into()));
                };
                if export == Export::GetState {
                    let exhausted = self.faults.with(|s| match s.get_state_budget.as_mut() {
                        Some(0) => true,
                        Some(left) => {
                            *left -= 1;
                            false
                        }
                        None => false,
                    });
                    if exhausted {
                        return Err(self.trap(name, ERR_INJECTED, "injected state read failure".into()));
                    }
                }
                let ptr = u32::try_from(arg(args, base).as_offset()).unwrap_or(0);
                let signature = arg(args, base + 1).as_i32() as u32;
                let result = match self.instances[index].as_ref() {
                    Some(instance) if export == Export::GetState => {
                        dynamics::get_state(&mut self.memory, instance, ptr, signature)
                    }
                    Some(instance) => dynamics::set_state(&mut self.memory, instance, ptr, signature),
                    None => Err("instance freed".to_string()),
                };
                result.map_err(|message| self.trap(name, ERR_STATE, message))?;
                ok
            }
            Export::ResetKeyframe => {
                let key_arg = if current { 2 } else { 1 };
                let Some(index) = self.target(args) else {
                    return Err(self.trap(name, ERR_HANDLE, "invalid model or data".into()));
                };
                let key = usize::try_from(arg(args, key_arg).as_i32()).unwrap_or(usize::MAX);
                let result = match self.instances[index].as_mut() {
                    Some(instance) => dynamics::reset_keyframe(&mut self.memory, instance, key),
                    None => Err("instance freed".to_string()),
                };
                result.map_err(|message| self.trap(name, ERR_STATE, message))?;
                ok
            }
            Export::ApplyXfrc => {
                let Some(instance) = handle.and_then(|i| self.instances[i].as_ref()) else {
                    return Ok(Val::I32(0));
                };
                let f = |i: usize| arg(args, i).as_f64();
                let geom = usize::try_from(arg(args, 1).as_i32()).unwrap_or(usize::MAX);
                let applied = dynamics::apply_xfrc(
                    &mut self.memory,
                    instance,
                    geom,
                    [f(2), f(3), f(4)],
                    [f(5), f(6), f(7)],
                    [f(8), f(9), f(10)],
                );
                Ok(Val::I32(i32::from(applied)))
            }
        }
    }
}

fn arg(args: &[Val], index: usize) -> Val {
    args.get(index).copied().unwrap_or(Val::I32(0))
}

impl EngineModule for ReferenceEngine {
    fn label(&self) -> &str {
        match self.variant {
            AbiVariant::Current => "reference engine (current ABI)",
            AbiVariant::Legacy => "reference engine (legacy ABI)",
        }
    }

    fn lookup(&self, name: &str) -> Option<ExportId> {
        self.by_name.get(name).copied()
    }

    fn call(&mut self, export: ExportId, args: &[Val]) -> Result<Val, EngineTrap> {
        let Some((name, op)) = self.exports.get(export.0 as usize).map(|(n, op)| (n.clone(), *op)) else {
            return Err(EngineTrap::new(format!("#{}", export.0), "unknown export"));
        };
        trace!("reference engine: {name}({args:?})");
        self.dispatch(&name, op, args)
    }

    fn region_id(&self) -> RegionId {
        RegionId(self.memory.region())
    }

    fn memory(&self) -> &[u8] {
        self.memory.bytes()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.bytes_mut()
    }

    fn stack_save(&mut self) -> Option<u32> {
        self.stack_enabled.then(|| self.memory.stack_ptr())
    }

    fn stack_alloc(&mut self, bytes: u32) -> Option<u32> {
        if !self.stack_enabled {
            return None;
        }
        self.memory.stack_alloc(bytes)
    }

    fn stack_restore(&mut self, saved: u32) {
        self.memory.stack_restore(saved);
    }

    fn malloc(&mut self, bytes: u32) -> Option<u32> {
        Some(self.memory.alloc(bytes))
    }

    fn free(&mut self, ptr: u32) {
        self.memory.release(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{HeapBridge, SymbolResolver};

    fn make(bridge: &mut HeapBridge, doc: &str, export: &str) -> i32 {
        let id = bridge.lookup(export).unwrap();
        let mut scratch = bridge.scratch(doc.len() + 1).unwrap();
        let ptr = scratch.offset();
        scratch.write_cstr(ptr, doc).unwrap();
        scratch.call(id, &[Val::I32(ptr as i32)]).unwrap().as_i32()
    }

    #[test]
    fn test_current_build_resolves_completely() {
        let engine = ReferenceEngine::new(AbiVariant::Current);
        let table = SymbolResolver::resolve_auto(&engine).unwrap();
        assert_eq!(table.variant(), AbiVariant::Current);
        assert!(!table.has(crate::bridge::Accessor::ActuatorNameOf));
        assert!(table.has(crate::bridge::Accessor::OptionStruct));
    }

    #[test]
    fn test_legacy_build_is_detected() {
        let engine = ReferenceEngine::new(AbiVariant::Legacy);
        assert_eq!(SymbolResolver::detect_variant(&engine), Some(AbiVariant::Legacy));
        assert!(engine.lookup("mjwf_helper_make_from_xml").is_none());
    }

    #[test]
    fn test_make_reports_parse_errors() {
        let mut bridge = HeapBridge::new(Box::new(ReferenceEngine::new(AbiVariant::Current)));
        assert_eq!(make(&mut bridge, "<mujoco>", "mjwf_helper_make_from_xml"), 0);
        let errno = bridge.lookup("mjwf_helper_errno_last_global").unwrap();
        assert_eq!(bridge.call(errno, &[]).unwrap().as_i32(), ERR_PARSE);
        let errmsg = bridge.lookup("mjwf_helper_errmsg_last_global").unwrap();
        let ptr = bridge.call(errmsg, &[]).unwrap().as_offset();
        assert!(bridge.read_cstr(ptr).contains("parse"));

        let handle = make(&mut bridge, models::FALLING_BALL, "mjwf_helper_make_from_xml");
        assert_eq!(handle, 1);
    }

    #[test]
    fn test_injected_step_failure_traps() {
        let faults = FaultPlan::new();
        let engine = ReferenceEngine::new(AbiVariant::Legacy).with_faults(faults.clone());
        let mut bridge = HeapBridge::new(Box::new(engine));
        let handle = make(&mut bridge, models::FALLING_BALL, "mjwf_make_from_xml");
        let step = bridge.lookup("mjwf_step").unwrap();
        assert_eq!(bridge.call(step, &[Val::I32(handle), Val::I32(3)]).unwrap(), Val::I32(1));
        faults.fail_after_steps(3);
        assert!(bridge.call(step, &[Val::I32(handle), Val::I32(1)]).is_err());
        faults.clear();
        assert!(bridge.call(step, &[Val::I32(handle), Val::I32(1)]).is_ok());
    }
}
