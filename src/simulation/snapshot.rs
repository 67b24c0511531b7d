//! Copied-out views of engine state for consumers
//!
//! Nothing here borrows engine memory past the call that read it; every
//! payload owns its arrays.

use cgmath::{Array, Vector3};
use serde::{Deserialize, Serialize};

use super::forces::ForceSummary;
use super::handle::{Dimensions, SimulationHandle};
use crate::bridge::{Accessor, HeapBridge};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCounts {
    pub nq: usize,
    pub nv: usize,
    pub nu: usize,
    pub nbody: usize,
    pub ngeom: usize,
    pub nsensordata: usize,
    pub ncon: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contacts {
    pub n: usize,
    pub pos: Vec<f64>,
    pub frame: Vec<f64>,
    pub geom1: Vec<i32>,
    pub geom2: Vec<i32>,
}

/// Why stepping is not live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseSource {
    User,
    History,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub time: f64,
    pub ncon: usize,
    pub avg_tick_ms: f64,
    pub max_tick_ms: f64,
}

/// One broadcast frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub seq: u64,
    pub time: f64,
    pub counts: SnapshotCounts,
    pub geom_xpos: Vec<f64>,
    pub geom_xmat: Vec<f64>,
    pub body_xpos: Vec<f64>,
    pub body_xmat: Vec<f64>,
    /// Omitted for models too large to ship every frame
    pub qpos: Option<Vec<f64>>,
    pub qvel: Vec<f64>,
    pub ctrl: Vec<f64>,
    pub sensordata: Vec<f64>,
    pub xfrc_applied: Vec<f64>,
    pub forces: Option<ForceSummary>,
    pub contacts: Option<Contacts>,
    pub paused: bool,
    pub pause_source: Option<PauseSource>,
    pub rate: f64,
    pub measured_slowdown: f64,
    pub info: SnapshotInfo,
}

impl Snapshot {
    /// Read engine-side fields. Session-side fields (sequence, pause state,
    /// rate, timing) are left at neutral values for the caller to fill.
    pub fn read(handle: &SimulationHandle, bridge: &mut HeapBridge, qpos_limit: usize) -> Self {
        let dims = handle.dims();
        let ncon = handle.ncon(bridge);
        let counts = SnapshotCounts {
            nq: dims.nq,
            nv: dims.nv,
            nu: dims.nu,
            nbody: dims.nbody,
            ngeom: dims.ngeom,
            nsensordata: dims.nsensordata,
            ncon,
        };
        let time = handle.time(bridge);
        let contacts = handle.capabilities().contacts.then(|| Contacts {
            n: ncon,
            pos: handle.read_array(bridge, Accessor::ContactPos, 3 * ncon),
            frame: handle.read_array(bridge, Accessor::ContactFrame, 9 * ncon),
            geom1: handle.read_array(bridge, Accessor::ContactGeom1, ncon),
            geom2: handle.read_array(bridge, Accessor::ContactGeom2, ncon),
        });
        Self {
            seq: 0,
            time,
            counts,
            geom_xpos: handle.read_array(bridge, Accessor::GeomXpos, 3 * dims.ngeom),
            geom_xmat: handle.read_array(bridge, Accessor::GeomXmat, 9 * dims.ngeom),
            body_xpos: handle.read_array(bridge, Accessor::BodyXpos, 3 * dims.nbody),
            body_xmat: handle.read_array(bridge, Accessor::BodyXmat, 9 * dims.nbody),
            qpos: (dims.nq <= qpos_limit).then(|| handle.read_array(bridge, Accessor::Qpos, dims.nq)),
            qvel: handle.read_array(bridge, Accessor::Qvel, dims.nv),
            ctrl: handle.read_array(bridge, Accessor::Ctrl, dims.nu),
            sensordata: handle.read_array(bridge, Accessor::Sensordata, dims.nsensordata),
            xfrc_applied: handle.read_array(bridge, Accessor::XfrcApplied, 6 * dims.nbody),
            forces: handle.force_summary(bridge),
            contacts,
            paused: true,
            pause_source: None,
            rate: 1.0,
            measured_slowdown: 1.0,
            info: SnapshotInfo {
                time,
                ncon,
                ..SnapshotInfo::default()
            },
        }
    }
}

/// Arrays a watch can follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchField {
    #[default]
    Qpos,
    Qvel,
    Ctrl,
    Sensordata,
    Xpos,
    Xmat,
    #[serde(alias = "xipos", alias = "body_xipos")]
    BodyXpos,
    BodyXmat,
}

impl WatchField {
    fn accessor(self) -> Accessor {
        match self {
            WatchField::Qpos => Accessor::Qpos,
            WatchField::Qvel => Accessor::Qvel,
            WatchField::Ctrl => Accessor::Ctrl,
            WatchField::Sensordata => Accessor::Sensordata,
            WatchField::Xpos => Accessor::GeomXpos,
            WatchField::Xmat => Accessor::GeomXmat,
            WatchField::BodyXpos => Accessor::BodyXpos,
            WatchField::BodyXmat => Accessor::BodyXmat,
        }
    }

    fn len(self, dims: &Dimensions) -> usize {
        match self {
            WatchField::Qpos => dims.nq,
            WatchField::Qvel => dims.nv,
            WatchField::Ctrl => dims.nu,
            WatchField::Sensordata => dims.nsensordata,
            WatchField::Xpos => 3 * dims.ngeom,
            WatchField::Xmat => 9 * dims.ngeom,
            WatchField::BodyXpos => 3 * dims.nbody,
            WatchField::BodyXmat => 9 * dims.nbody,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    #[default]
    Idle,
    Pending,
    Ok,
    Invalid,
}

/// One tracked scalar with running extrema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchState {
    pub field: WatchField,
    pub index: usize,
    pub value: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub samples: u64,
    pub status: WatchStatus,
}

impl WatchState {
    /// Retarget, discarding accumulated statistics
    pub fn retarget(&mut self, field: WatchField, index: usize) {
        *self = Self {
            field,
            index,
            status: WatchStatus::Pending,
            ..Self::default()
        };
    }

    pub fn sample(&mut self, handle: &SimulationHandle, bridge: &mut HeapBridge) {
        let len = self.field.len(&handle.dims());
        let value = (self.index < len)
            .then(|| handle.view::<f64>(bridge, self.field.accessor(), len).get(self.index).copied())
            .flatten();
        match value {
            Some(v) => {
                self.value = Some(v);
                self.min = Some(self.min.map_or(v, |m| m.min(v)));
                self.max = Some(self.max.map_or(v, |m| m.max(v)));
                self.samples += 1;
                self.status = WatchStatus::Ok;
            }
            None => {
                self.value = None;
                self.status = WatchStatus::Invalid;
            }
        }
    }
}

/// Bounding sphere of a set of points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub center: [f64; 3],
    pub radius: f64,
}

impl Bounds {
    /// Sphere around the axis-aligned box of `xyz` triples. Degenerate sets
    /// get a radius from the centre's distance to the origin, at least 0.1.
    pub fn of_points(xyz: &[f64]) -> Self {
        let points: Vec<Vector3<f64>> = xyz
            .chunks_exact(3)
            .map(|p| Vector3::new(p[0], p[1], p[2]))
            .filter(|p| p.is_finite())
            .collect();
        let Some(first) = points.first().copied() else {
            return Self {
                center: [0.0; 3],
                radius: 0.0,
            };
        };
        let (lo, hi) = points.iter().fold((first, first), |(lo, hi), p| {
            (
                Vector3::new(lo.x.min(p.x), lo.y.min(p.y), lo.z.min(p.z)),
                Vector3::new(hi.x.max(p.x), hi.y.max(p.y), hi.z.max(p.z)),
            )
        });
        let center = (lo + hi) / 2.0;
        let extent = hi - lo;
        let mut radius = extent.x.max(extent.y).max(extent.z) / 2.0;
        if !(radius.is_finite() && radius > 0.0) {
            let offset = center.map(f64::abs);
            radius = offset.x.max(offset.y).max(offset.z).max(0.1);
        }
        Self {
            center: center.into(),
            radius,
        }
    }
}

/// Full copy of generalized state with short previews
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyState {
    pub seq: u64,
    pub precision: CopyPrecision,
    pub time: f64,
    pub nq: usize,
    pub nv: usize,
    pub nu: usize,
    pub qpos: Vec<f64>,
    pub qvel: Vec<f64>,
    pub ctrl: Vec<f64>,
    pub qpos_preview: Vec<f64>,
    pub qvel_preview: Vec<f64>,
    pub ctrl_preview: Vec<f64>,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyPrecision {
    #[default]
    Standard,
    Full,
}

const PREVIEW_LEN: usize = 8;

impl CopyState {
    pub fn read(handle: &SimulationHandle, bridge: &mut HeapBridge, seq: u64, precision: CopyPrecision) -> Self {
        let dims = handle.dims();
        let qpos: Vec<f64> = handle.read_array(bridge, Accessor::Qpos, dims.nq);
        let qvel: Vec<f64> = handle.read_array(bridge, Accessor::Qvel, dims.nv);
        let ctrl: Vec<f64> = handle.read_array(bridge, Accessor::Ctrl, dims.nu);
        let preview = |v: &[f64]| v.iter().take(PREVIEW_LEN).copied().collect::<Vec<_>>();
        Self {
            seq,
            precision,
            time: handle.time(bridge),
            nq: dims.nq,
            nv: dims.nv,
            nu: dims.nu,
            qpos_preview: preview(&qpos),
            qvel_preview: preview(&qvel),
            ctrl_preview: preview(&ctrl),
            complete: qpos.len() == dims.nq && qvel.len() == dims.nv,
            qpos,
            qvel,
            ctrl,
        }
    }
}
