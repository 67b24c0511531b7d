//! Multi-convention export resolution
//!
//! Engine builds differ in how they name their exported accessors. The
//! current ABI exposes raw model/data pointers (`mjwf_helper_*`,
//! `mjwf_model_*`, `mjwf_data_*`, `mjwf_mj_*`), while the legacy ABI wraps
//! everything behind a handle (`mjwf_*`). A handle picks one variant at load
//! and resolves every pointer accessor within it, so conventions are never
//! mixed. Diagnostics are shared and probe both.

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::module::{EngineModule, ExportId};
use super::BridgeError;

/// Naming convention of a loaded engine build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbiVariant {
    Current,
    Legacy,
}

impl fmt::Display for AbiVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbiVariant::Current => f.write_str("current"),
            AbiVariant::Legacy => f.write_str("legacy"),
        }
    }
}

/// Resolution policy of an accessor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorFamily {
    /// Resolved only within the handle's variant
    Locked,
    /// Probed in the current convention first, then legacy
    Shared,
}

/// Every export the runtime knows how to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Accessor {
    Init,
    Make,
    Free,
    Valid,
    Step,
    Reset,
    Forward,
    ModelPtr,
    DataPtr,
    Nq,
    Nv,
    Nu,
    Nbody,
    Ngeom,
    Njnt,
    Nkey,
    Nsensordata,
    Ncon,
    Qpos,
    Qvel,
    Ctrl,
    XfrcApplied,
    QfrcApplied,
    GeomXpos,
    GeomXmat,
    BodyXpos,
    BodyXmat,
    BodyXipos,
    Sensordata,
    ContactPos,
    ContactFrame,
    ContactGeom1,
    ContactGeom2,
    Time,
    CtrlRange,
    GeomBodyId,
    Timestep,
    OptionStruct,
    Names,
    ActuatorNameAdr,
    ActuatorNameOf,
    StateSize,
    GetState,
    SetState,
    ResetKeyframe,
    ApplyXfrc,
    AbiVersion,
    ErrnoLast,
    ErrmsgLast,
}

impl Accessor {
    pub const ALL: [Accessor; 49] = [
        Accessor::Init,
        Accessor::Make,
        Accessor::Free,
        Accessor::Valid,
        Accessor::Step,
        Accessor::Reset,
        Accessor::Forward,
        Accessor::ModelPtr,
        Accessor::DataPtr,
        Accessor::Nq,
        Accessor::Nv,
        Accessor::Nu,
        Accessor::Nbody,
        Accessor::Ngeom,
        Accessor::Njnt,
        Accessor::Nkey,
        Accessor::Nsensordata,
        Accessor::Ncon,
        Accessor::Qpos,
        Accessor::Qvel,
        Accessor::Ctrl,
        Accessor::XfrcApplied,
        Accessor::QfrcApplied,
        Accessor::GeomXpos,
        Accessor::GeomXmat,
        Accessor::BodyXpos,
        Accessor::BodyXmat,
        Accessor::BodyXipos,
        Accessor::Sensordata,
        Accessor::ContactPos,
        Accessor::ContactFrame,
        Accessor::ContactGeom1,
        Accessor::ContactGeom2,
        Accessor::Time,
        Accessor::CtrlRange,
        Accessor::GeomBodyId,
        Accessor::Timestep,
        Accessor::OptionStruct,
        Accessor::Names,
        Accessor::ActuatorNameAdr,
        Accessor::ActuatorNameOf,
        Accessor::StateSize,
        Accessor::GetState,
        Accessor::SetState,
        Accessor::ResetKeyframe,
        Accessor::ApplyXfrc,
        Accessor::AbiVersion,
        Accessor::ErrnoLast,
        Accessor::ErrmsgLast,
    ];

    pub fn family(self) -> AccessorFamily {
        match self {
            Accessor::Init | Accessor::AbiVersion | Accessor::ErrnoLast | Accessor::ErrmsgLast => {
                AccessorFamily::Shared
            }
            _ => AccessorFamily::Locked,
        }
    }

    /// Whether a handle of `variant` cannot function without this export
    pub fn is_mandatory(self, variant: AbiVariant) -> bool {
        match self {
            Accessor::Make | Accessor::Free | Accessor::Step | Accessor::Reset => true,
            Accessor::ModelPtr | Accessor::DataPtr => variant == AbiVariant::Current,
            _ => false,
        }
    }

    /// Candidate export names in probe order.
    ///
    /// Calling conventions differ by variant. Current-ABI stepping and state
    /// exports take `(model, data, ..)` pointers and `Time`/`Timestep` return
    /// pointers; legacy exports take the handle and `Time`/`Timestep` return
    /// the value itself.
    pub fn symbols(self, variant: AbiVariant) -> &'static [&'static str] {
        use AbiVariant::{Current, Legacy};
        match (self, variant) {
            (Accessor::Init, _) => &["mjwf_init"],
            (Accessor::AbiVersion, _) => &["mjwf_abi_version"],
            (Accessor::ErrnoLast, _) => &[
                "mjwf_helper_errno_last_global",
                "mjwf_errno_last_global",
                "mjwf_errno_last",
            ],
            (Accessor::ErrmsgLast, _) => &[
                "mjwf_helper_errmsg_last_global",
                "mjwf_errmsg_last_global",
                "mjwf_errmsg_last",
            ],

            (Accessor::Make, Current) => &["mjwf_helper_make_from_xml"],
            (Accessor::Make, Legacy) => &["mjwf_make_from_xml"],
            (Accessor::Free, Current) => &["mjwf_helper_free"],
            (Accessor::Free, Legacy) => &["mjwf_free"],
            (Accessor::Valid, Current) => &["mjwf_helper_valid"],
            (Accessor::Valid, Legacy) => &["mjwf_valid"],
            (Accessor::Step, Current) => &["mjwf_mj_step"],
            (Accessor::Step, Legacy) => &["mjwf_step"],
            (Accessor::Reset, Current) => &["mjwf_mj_resetData"],
            (Accessor::Reset, Legacy) => &["mjwf_reset"],
            (Accessor::Forward, Current) => &["mjwf_mj_forward"],
            (Accessor::Forward, Legacy) => &["mjwf_forward"],
            (Accessor::ModelPtr, Current) => &["mjwf_helper_model_ptr"],
            (Accessor::DataPtr, Current) => &["mjwf_helper_data_ptr"],
            (Accessor::ModelPtr | Accessor::DataPtr, Legacy) => &[],

            (Accessor::Nq, Current) => &["mjwf_model_nq"],
            (Accessor::Nq, Legacy) => &["mjwf_nq"],
            (Accessor::Nv, Current) => &["mjwf_model_nv"],
            (Accessor::Nv, Legacy) => &["mjwf_nv"],
            (Accessor::Nu, Current) => &["mjwf_model_nu"],
            (Accessor::Nu, Legacy) => &["mjwf_nu"],
            (Accessor::Nbody, Current) => &["mjwf_model_nbody"],
            (Accessor::Nbody, Legacy) => &["mjwf_nbody"],
            (Accessor::Ngeom, Current) => &["mjwf_model_ngeom"],
            (Accessor::Ngeom, Legacy) => &["mjwf_ngeom"],
            (Accessor::Njnt, Current) => &["mjwf_model_njnt"],
            (Accessor::Njnt, Legacy) => &["mjwf_njnt"],
            (Accessor::Nkey, Current) => &["mjwf_model_nkey"],
            (Accessor::Nkey, Legacy) => &["mjwf_nkey"],
            (Accessor::Nsensordata, Current) => &["mjwf_model_nsensordata"],
            (Accessor::Nsensordata, Legacy) => &["mjwf_nsensordata"],
            (Accessor::Ncon, Current) => &["mjwf_data_ncon"],
            (Accessor::Ncon, Legacy) => &["mjwf_ncon"],

            (Accessor::Qpos, Current) => &["mjwf_data_qpos_ptr"],
            (Accessor::Qpos, Legacy) => &["mjwf_qpos_ptr"],
            (Accessor::Qvel, Current) => &["mjwf_data_qvel_ptr"],
            (Accessor::Qvel, Legacy) => &["mjwf_qvel_ptr"],
            (Accessor::Ctrl, Current) => &["mjwf_data_ctrl_ptr"],
            (Accessor::Ctrl, Legacy) => &["mjwf_ctrl_ptr"],
            (Accessor::XfrcApplied, Current) => &["mjwf_data_xfrc_applied_ptr"],
            (Accessor::XfrcApplied, Legacy) => &["mjwf_xfrc_applied_ptr"],
            (Accessor::QfrcApplied, Current) => &["mjwf_data_qfrc_applied_ptr"],
            (Accessor::QfrcApplied, Legacy) => &["mjwf_qfrc_applied_ptr"],
            (Accessor::GeomXpos, Current) => &["mjwf_data_geom_xpos_ptr"],
            (Accessor::GeomXpos, Legacy) => &["mjwf_geom_xpos_ptr"],
            (Accessor::GeomXmat, Current) => &["mjwf_data_geom_xmat_ptr"],
            (Accessor::GeomXmat, Legacy) => &["mjwf_geom_xmat_ptr"],
            (Accessor::BodyXpos, Current) => &["mjwf_data_xpos_ptr"],
            (Accessor::BodyXpos, Legacy) => &["mjwf_xpos_ptr"],
            (Accessor::BodyXmat, Current) => &["mjwf_data_xmat_ptr"],
            (Accessor::BodyXmat, Legacy) => &["mjwf_xmat_ptr"],
            (Accessor::BodyXipos, Current) => &["mjwf_data_xipos_ptr"],
            (Accessor::BodyXipos, Legacy) => &["mjwf_xipos_ptr"],
            (Accessor::Sensordata, Current) => &["mjwf_data_sensordata_ptr"],
            (Accessor::Sensordata, Legacy) => &["mjwf_sensordata_ptr"],
            (Accessor::ContactPos, Current) => &["mjwf_data_contact_pos_ptr"],
            (Accessor::ContactPos, Legacy) => &["mjwf_contact_pos_ptr"],
            (Accessor::ContactFrame, Current) => &["mjwf_data_contact_frame_ptr"],
            (Accessor::ContactFrame, Legacy) => &["mjwf_contact_frame_ptr"],
            (Accessor::ContactGeom1, Current) => &["mjwf_data_contact_geom1_ptr"],
            (Accessor::ContactGeom1, Legacy) => &["mjwf_contact_geom1_ptr"],
            (Accessor::ContactGeom2, Current) => &["mjwf_data_contact_geom2_ptr"],
            (Accessor::ContactGeom2, Legacy) => &["mjwf_contact_geom2_ptr"],
            (Accessor::Time, Current) => &["mjwf_data_time_ptr"],
            (Accessor::Time, Legacy) => &["mjwf_time"],

            (Accessor::CtrlRange, Current) => &["mjwf_model_actuator_ctrlrange_ptr"],
            (Accessor::CtrlRange, Legacy) => &["mjwf_actuator_ctrlrange_ptr"],
            (Accessor::GeomBodyId, Current) => &["mjwf_model_geom_bodyid_ptr"],
            (Accessor::GeomBodyId, Legacy) => &["mjwf_geom_bodyid_ptr"],
            (Accessor::Timestep, Current) => &["mjwf_model_opt_timestep_ptr"],
            (Accessor::Timestep, Legacy) => &["mjwf_timestep"],
            (Accessor::OptionStruct, Current) => &["mjwf_model_opt_ptr"],
            (Accessor::OptionStruct, Legacy) => &[],
            (Accessor::Names, Current) => &["mjwf_model_names_ptr"],
            (Accessor::Names, Legacy) => &[],
            (Accessor::ActuatorNameAdr, Current) => &["mjwf_model_name_actuatoradr_ptr"],
            (Accessor::ActuatorNameAdr, Legacy) => &[],
            (Accessor::ActuatorNameOf, Current) => &[],
            (Accessor::ActuatorNameOf, Legacy) => &["mjwf_actuator_name_of"],

            (Accessor::StateSize, Current) => &["mjwf_mj_stateSize"],
            (Accessor::StateSize, Legacy) => &["mjwf_state_size"],
            (Accessor::GetState, Current) => &["mjwf_mj_getState"],
            (Accessor::GetState, Legacy) => &["mjwf_get_state"],
            (Accessor::SetState, Current) => &["mjwf_mj_setState"],
            (Accessor::SetState, Legacy) => &["mjwf_set_state"],
            (Accessor::ResetKeyframe, Current) => &["mjwf_mj_resetDataKeyframe"],
            (Accessor::ResetKeyframe, Legacy) => &["mjwf_reset_keyframe"],
            (Accessor::ApplyXfrc, _) => &["mjwf_apply_xfrc"],
        }
    }
}

/// Per-handle `(variant, accessor) -> export` table, immutable after load
#[derive(Debug, Clone)]
pub struct ResolutionTable {
    variant: AbiVariant,
    exports: BTreeMap<Accessor, ExportId>,
}

impl ResolutionTable {
    pub fn variant(&self) -> AbiVariant {
        self.variant
    }

    pub fn get(&self, accessor: Accessor) -> Option<ExportId> {
        self.exports.get(&accessor).copied()
    }

    pub fn has(&self, accessor: Accessor) -> bool {
        self.exports.contains_key(&accessor)
    }

    pub fn require(&self, accessor: Accessor) -> Result<ExportId, BridgeError> {
        self.get(accessor).ok_or(BridgeError::Unavailable(accessor))
    }

    /// Accessors with no export in this module
    pub fn missing(&self) -> Vec<Accessor> {
        Accessor::ALL
            .iter()
            .copied()
            .filter(|a| !self.exports.contains_key(a))
            .collect()
    }
}

/// Builds resolution tables against a module
pub struct SymbolResolver;

impl SymbolResolver {
    /// Pick the variant from the presence of its model constructor
    pub fn detect_variant(module: &dyn EngineModule) -> Option<AbiVariant> {
        [AbiVariant::Current, AbiVariant::Legacy]
            .into_iter()
            .find(|&variant| {
                Accessor::Make
                    .symbols(variant)
                    .iter()
                    .any(|name| module.lookup(name).is_some())
            })
    }

    /// First present export among `names`
    pub fn probe(module: &dyn EngineModule, names: &[&str]) -> Option<ExportId> {
        names.iter().find_map(|name| module.lookup(name))
    }

    fn resolve_one(module: &dyn EngineModule, accessor: Accessor, variant: AbiVariant) -> Option<ExportId> {
        match accessor.family() {
            AccessorFamily::Locked => Self::probe(module, accessor.symbols(variant)),
            AccessorFamily::Shared => Self::probe(module, accessor.symbols(AbiVariant::Current))
                .or_else(|| Self::probe(module, accessor.symbols(AbiVariant::Legacy))),
        }
    }

    /// Resolve every accessor for `variant`.
    ///
    /// Fails if any mandatory accessor is missing; optional gaps are logged
    /// and surface later as capability flags.
    pub fn resolve(module: &dyn EngineModule, variant: AbiVariant) -> Result<ResolutionTable, BridgeError> {
        let mut exports = BTreeMap::new();
        for accessor in Accessor::ALL {
            match Self::resolve_one(module, accessor, variant) {
                Some(id) => {
                    exports.insert(accessor, id);
                }
                None if accessor.is_mandatory(variant) => {
                    return Err(BridgeError::MissingAccessor { accessor, variant });
                }
                None => {}
            }
        }
        let table = ResolutionTable { variant, exports };
        let missing = table.missing();
        if !missing.is_empty() {
            warn!("{variant} ABI: {} optional accessors unavailable: {missing:?}", missing.len());
        }
        debug!("{variant} ABI: resolved {} accessors", table.exports.len());
        Ok(table)
    }

    /// Detect the variant and resolve against it
    pub fn resolve_auto(module: &dyn EngineModule) -> Result<ResolutionTable, BridgeError> {
        let variant = Self::detect_variant(module).ok_or(BridgeError::UnknownAbi)?;
        Self::resolve(module, variant)
    }
}

/// Export name of a struct-field pointer accessor, e.g.
/// `field_export_name("model_vis", &["headlight", "ambient"])` gives
/// `mjwf_model_vis_headlight_ambient_ptr`.
pub fn field_export_name(prefix: &str, path: &[String]) -> String {
    let joined = path
        .iter()
        .map(|segment| {
            segment
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("_");
    format!("mjwf_{prefix}_{joined}_ptr")
}
