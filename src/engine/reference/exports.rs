//! Export table of the reference engine
//!
//! The reference engine publishes exactly one spelling per accessor for the
//! ABI variant it was built as, plus per-field struct pointers.

use crate::bridge::{AbiVariant, Accessor};

use super::layout::{field_exports, StructKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Count {
    Nq,
    Nv,
    Nu,
    Nbody,
    Ngeom,
    Njnt,
    Nkey,
    Nsensordata,
    Ncon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Array {
    Qpos,
    Qvel,
    Ctrl,
    XfrcApplied,
    QfrcApplied,
    GeomXpos,
    GeomXmat,
    Xpos,
    Xmat,
    Xipos,
    Sensordata,
    ContactPos,
    ContactFrame,
    ContactGeom1,
    ContactGeom2,
    CtrlRange,
    GeomBodyId,
    Names,
    NameAdr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Export {
    Init,
    Make,
    Free,
    Valid,
    Step,
    Reset,
    Forward,
    ModelPtr,
    DataPtr,
    Count(Count),
    Array(Array),
    Time,
    Timestep,
    OptionPtr,
    Field(StructKind, u32),
    ActuatorNameOf,
    StateSize,
    GetState,
    SetState,
    ResetKeyframe,
    ApplyXfrc,
    AbiVersion,
    Errno,
    Errmsg,
}

impl Export {
    fn for_accessor(accessor: Accessor) -> Export {
        match accessor {
            Accessor::Init => Export::Init,
            Accessor::Make => Export::Make,
            Accessor::Free => Export::Free,
            Accessor::Valid => Export::Valid,
            Accessor::Step => Export::Step,
            Accessor::Reset => Export::Reset,
            Accessor::Forward => Export::Forward,
            Accessor::ModelPtr => Export::ModelPtr,
            Accessor::DataPtr => Export::DataPtr,
            Accessor::Nq => Export::Count(Count::Nq),
            Accessor::Nv => Export::Count(Count::Nv),
            Accessor::Nu => Export::Count(Count::Nu),
            Accessor::Nbody => Export::Count(Count::Nbody),
            Accessor::Ngeom => Export::Count(Count::Ngeom),
            Accessor::Njnt => Export::Count(Count::Njnt),
            Accessor::Nkey => Export::Count(Count::Nkey),
            Accessor::Nsensordata => Export::Count(Count::Nsensordata),
            Accessor::Ncon => Export::Count(Count::Ncon),
            Accessor::Qpos => Export::Array(Array::Qpos),
            Accessor::Qvel => Export::Array(Array::Qvel),
            Accessor::Ctrl => Export::Array(Array::Ctrl),
            Accessor::XfrcApplied => Export::Array(Array::XfrcApplied),
            Accessor::QfrcApplied => Export::Array(Array::QfrcApplied),
            Accessor::GeomXpos => Export::Array(Array::GeomXpos),
            Accessor::GeomXmat => Export::Array(Array::GeomXmat),
            Accessor::BodyXpos => Export::Array(Array::Xpos),
            Accessor::BodyXmat => Export::Array(Array::Xmat),
            Accessor::BodyXipos => Export::Array(Array::Xipos),
            Accessor::Sensordata => Export::Array(Array::Sensordata),
            Accessor::ContactPos => Export::Array(Array::ContactPos),
            Accessor::ContactFrame => Export::Array(Array::ContactFrame),
            Accessor::ContactGeom1 => Export::Array(Array::ContactGeom1),
            Accessor::ContactGeom2 => Export::Array(Array::ContactGeom2),
            Accessor::Time => Export::Time,
            Accessor::CtrlRange => Export::Array(Array::CtrlRange),
            Accessor::GeomBodyId => Export::Array(Array::GeomBodyId),
            Accessor::Timestep => Export::Timestep,
            Accessor::OptionStruct => Export::OptionPtr,
            Accessor::Names => Export::Array(Array::Names),
            Accessor::ActuatorNameAdr => Export::Array(Array::NameAdr),
            Accessor::ActuatorNameOf => Export::ActuatorNameOf,
            Accessor::StateSize => Export::StateSize,
            Accessor::GetState => Export::GetState,
            Accessor::SetState => Export::SetState,
            Accessor::ResetKeyframe => Export::ResetKeyframe,
            Accessor::ApplyXfrc => Export::ApplyXfrc,
            Accessor::AbiVersion => Export::AbiVersion,
            Accessor::ErrnoLast => Export::Errno,
            Accessor::ErrmsgLast => Export::Errmsg,
        }
    }
}

/// Every `(name, export)` pair published by a build of `variant`
pub(crate) fn table(variant: AbiVariant) -> Vec<(String, Export)> {
    let mut out: Vec<(String, Export)> = Vec::new();
    for accessor in Accessor::ALL {
        let names = accessor.symbols(variant);
        let name = match variant {
            AbiVariant::Current => names.first(),
            AbiVariant::Legacy => names.last(),
        };
        if let Some(name) = name {
            out.push((name.to_string(), Export::for_accessor(accessor)));
        }
    }
    for (name, kind, offset) in field_exports() {
        if !out.iter().any(|(existing, _)| *existing == name) {
            out.push((name, Export::Field(kind, offset)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variants_do_not_share_locked_names() {
        let current = table(AbiVariant::Current);
        let legacy = table(AbiVariant::Legacy);
        for (name, export) in &legacy {
            if matches!(export, Export::Field(..) | Export::Init | Export::AbiVersion | Export::ApplyXfrc) {
                continue;
            }
            assert!(
                !current.iter().any(|(n, _)| n == name),
                "{name} published by both variants"
            );
        }
    }

    #[test]
    fn test_current_timestep_pointer_is_the_accessor() {
        let current = table(AbiVariant::Current);
        let hits: Vec<_> = current
            .iter()
            .filter(|(n, _)| n == "mjwf_model_opt_timestep_ptr")
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, Export::Timestep);
    }
}
