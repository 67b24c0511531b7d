//! External forces through `xfrc_applied`
//!
//! Each body owns a 6-wide row: force then torque, both in world frame and
//! acting at the body's centre of mass.

use cgmath::{InnerSpace, Vector3};
use serde::{Deserialize, Serialize};

use super::handle::SimulationHandle;
use super::SimError;
use crate::bridge::{Accessor, BridgeError, HeapBridge, Val};

/// Squared wrench magnitude below which a body counts as unloaded
const ACTIVE_FORCE_SQ: f64 = 1e-9;

/// Which bodies currently carry an external force
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceSummary {
    pub active: Vec<usize>,
    pub max_magnitude: f64,
}

fn vec3(v: [f64; 3]) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

fn finite(vs: &[[f64; 3]]) -> bool {
    vs.iter().flatten().all(|x| x.is_finite())
}

impl SimulationHandle {
    /// Push `force`/`torque` applied at world `point` onto the body owning
    /// `geom`. Returns whether anything was written.
    pub fn apply_force(
        &mut self,
        bridge: &mut HeapBridge,
        geom: usize,
        force: [f64; 3],
        torque: [f64; 3],
        point: [f64; 3],
    ) -> Result<bool, SimError> {
        if !finite(&[force, torque, point]) || geom >= self.dims().ngeom {
            return Ok(false);
        }
        if let Some(apply) = self.table().get(Accessor::ApplyXfrc) {
            let mut args = vec![self.handle_arg(), Val::I32(geom as i32)];
            args.extend(force.iter().chain(&torque).chain(&point).map(|&x| Val::F64(x)));
            return match bridge.call(apply, &args) {
                Ok(v) => Ok(v.as_i32() != 0),
                Err(err) => Err(self.engine_error(bridge, "applyForce", err)),
            };
        }

        let bodies = self.read_array::<i32>(bridge, Accessor::GeomBodyId, self.dims().ngeom);
        let Some(&body) = bodies.get(geom) else {
            return Ok(false);
        };
        if body < 0 {
            return Ok(false);
        }
        let body = body as usize;
        let com = self.body_com(bridge, body);
        let f = vec3(force);
        let t = vec3(torque) + (vec3(point) - com).cross(f);
        self.apply_body_force(bridge, body, force, t.into())
    }

    fn body_com(&self, bridge: &mut HeapBridge, body: usize) -> Vector3<f64> {
        let nbody = self.dims().nbody;
        let mut rows = self.read_array::<f64>(bridge, Accessor::BodyXipos, 3 * nbody);
        if rows.len() != 3 * nbody {
            rows = self.read_array::<f64>(bridge, Accessor::BodyXpos, 3 * nbody);
        }
        match rows.get(3 * body..3 * body + 3) {
            Some(p) => Vector3::new(p[0], p[1], p[2]),
            None => Vector3::new(0.0, 0.0, 0.0),
        }
    }

    /// Overwrite body `body`'s row with `force` and `torque`
    pub fn apply_body_force(
        &mut self,
        bridge: &mut HeapBridge,
        body: usize,
        force: [f64; 3],
        torque: [f64; 3],
    ) -> Result<bool, SimError> {
        let nbody = self.dims().nbody;
        if body >= nbody || !finite(&[force, torque]) {
            return Ok(false);
        }
        let mut rows = self.view_mut::<f64>(bridge, Accessor::XfrcApplied, 6 * nbody);
        if rows.is_empty() {
            return Err(BridgeError::Unavailable(Accessor::XfrcApplied).into());
        }
        let row = &mut rows[6 * body..6 * body + 6];
        row[..3].copy_from_slice(&force);
        row[3..].copy_from_slice(&torque);
        Ok(true)
    }

    /// Zero every body's row
    pub fn clear_forces(&mut self, bridge: &mut HeapBridge) -> Result<(), SimError> {
        let nbody = self.dims().nbody;
        let mut rows = self.view_mut::<f64>(bridge, Accessor::XfrcApplied, 6 * nbody);
        if rows.is_empty() && nbody > 0 {
            return Err(BridgeError::Unavailable(Accessor::XfrcApplied).into());
        }
        rows.fill(0.0);
        Ok(())
    }

    pub fn force_summary(&self, bridge: &mut HeapBridge) -> Option<ForceSummary> {
        let nbody = self.dims().nbody;
        let rows = self.read_array::<f64>(bridge, Accessor::XfrcApplied, 6 * nbody);
        if rows.len() != 6 * nbody {
            return None;
        }
        let mut summary = ForceSummary::default();
        for (body, row) in rows.chunks_exact(6).enumerate() {
            let sq = vec3([row[0], row[1], row[2]]).magnitude2() + vec3([row[3], row[4], row[5]]).magnitude2();
            if sq > ACTIVE_FORCE_SQ {
                summary.active.push(body);
                summary.max_magnitude = summary.max_magnitude.max(sq.sqrt());
            }
        }
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AbiVariant;
    use crate::engine::reference::models;
    use crate::simulation::handle::tests::loaded;

    #[test]
    fn test_apply_force_to_geom_owner() {
        for variant in [AbiVariant::Current, AbiVariant::Legacy] {
            let (mut bridge, mut handle) = loaded(variant, models::FALLING_BALL);
            // geom 0 is the ground plane, geom 1 the ball on body 1
            assert!(handle
                .apply_force(&mut bridge, 1, [0.0, 0.0, 5.0], [0.0; 3], [0.0, 0.0, 1.0])
                .unwrap());
            let summary = handle.force_summary(&mut bridge).unwrap();
            assert_eq!(summary.active, vec![1]);
            assert!((summary.max_magnitude - 5.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_off_centre_point_adds_torque() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::FALLING_BALL);
        handle
            .apply_force(&mut bridge, 1, [0.0, 0.0, 1.0], [0.0; 3], [1.0, 0.0, 1.0])
            .unwrap();
        let rows = handle.read_array::<f64>(&mut bridge, Accessor::XfrcApplied, 12);
        // (1, 0, 0) x (0, 0, 1) = (0, -1, 0)
        assert_eq!(&rows[6..12], &[0.0, 0.0, 1.0, 0.0, -1.0, 0.0]);
    }

    #[test]
    fn test_body_force_and_clear() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::CART_POLE);
        assert!(handle.apply_body_force(&mut bridge, 2, [1.0, 0.0, 0.0], [0.0; 3]).unwrap());
        assert!(!handle.apply_body_force(&mut bridge, 9, [1.0, 0.0, 0.0], [0.0; 3]).unwrap());
        assert!(!handle.apply_body_force(&mut bridge, 1, [f64::NAN, 0.0, 0.0], [0.0; 3]).unwrap());
        assert_eq!(handle.force_summary(&mut bridge).unwrap().active, vec![2]);
        handle.clear_forces(&mut bridge).unwrap();
        assert!(handle.force_summary(&mut bridge).unwrap().active.is_empty());
    }

    #[test]
    fn test_tiny_forces_are_inactive() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::FALLING_BALL);
        handle.apply_body_force(&mut bridge, 1, [1e-6, 0.0, 0.0], [0.0; 3]).unwrap();
        assert!(handle.force_summary(&mut bridge).unwrap().active.is_empty());
    }
}
