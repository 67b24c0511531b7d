//! Integration, kinematics and state serialization for the reference engine
//!
//! Semi-implicit Euler over independent bodies. Free bodies collide with the
//! ground plane; slide and hinge joints honour their range. This is enough
//! physics to exercise the runtime, nothing more.

use cgmath::{InnerSpace, Matrix3, Quaternion, Rad, Vector3, Zero};

use super::layout::Instance;
use super::memory::LinearMemory;
use super::model::JointKind;

/// State component bits, in serialization order
pub const STATE_TIME: u32 = 1 << 0;
pub const STATE_QPOS: u32 = 1 << 1;
pub const STATE_QVEL: u32 = 1 << 2;
pub const STATE_ACT: u32 = 1 << 3;
pub const STATE_WARMSTART: u32 = 1 << 4;
pub const STATE_CTRL: u32 = 1 << 5;
pub const STATE_QFRC_APPLIED: u32 = 1 << 6;
pub const STATE_XFRC_APPLIED: u32 = 1 << 7;
pub const STATE_EQ_ACTIVE: u32 = 1 << 8;
pub const STATE_MOCAP_POS: u32 = 1 << 9;
pub const STATE_MOCAP_QUAT: u32 = 1 << 10;
pub const STATE_USERDATA: u32 = 1 << 11;
pub const STATE_PLUGIN: u32 = 1 << 12;
pub const STATE_ALL: u32 = (1 << 13) - 1;

const GROUND_FRICTION: f64 = 0.98;

fn vec3(values: &[f64]) -> Vector3<f64> {
    Vector3::new(values[0], values[1], values[2])
}

fn row_major(m: &Matrix3<f64>) -> [f64; 9] {
    [
        m.x.x, m.y.x, m.z.x, //
        m.x.y, m.y.y, m.z.y, //
        m.x.z, m.y.z, m.z.z,
    ]
}

fn unit(axis: [f64; 3]) -> Vector3<f64> {
    let v = Vector3::from(axis);
    if v.magnitude2() > 0.0 {
        v.normalize()
    } else {
        Vector3::unit_z()
    }
}

/// Zero the data block, restore the initial configuration and recompute
/// derived quantities
pub(crate) fn reset(memory: &mut LinearMemory, instance: &mut Instance) {
    let layout = instance.layout;
    memory.fill_zero(layout.data, layout.data_bytes());
    memory.write_f64s(layout.qpos, &instance.qpos0);
    forward(memory, instance);
}

/// Kinematics, sensors and contacts from the current qpos
pub(crate) fn forward(memory: &mut LinearMemory, instance: &mut Instance) {
    let layout = instance.layout;
    let dims = instance.dims;
    let qpos = memory.read_f64s(layout.qpos, dims.nq);

    let mut xpos = vec![0.0; 3 * dims.nbody];
    let mut xmat = vec![0.0; 9 * dims.nbody];
    let mut xipos = vec![0.0; 3 * dims.nbody];
    let mut geom_xpos = vec![0.0; 3 * dims.ngeom];
    let mut geom_xmat = vec![0.0; 9 * dims.ngeom];
    let identity = row_major(&Matrix3::from_scale(1.0));
    xmat[..9].copy_from_slice(&identity);
    if instance.spec.ground {
        geom_xmat[..9].copy_from_slice(&identity);
    }

    let mut contacts = Vec::new();
    for (i, (body, joint)) in instance.spec.bodies.iter().zip(&instance.joints).enumerate() {
        let b = i + 1;
        let q = &qpos[joint.qposadr..joint.qposadr + joint.kind.nq()];
        let (pos, rot) = match joint.kind {
            JointKind::Free => {
                let quat = Quaternion::new(q[3], q[4], q[5], q[6]);
                let quat = if quat.magnitude2() > 0.0 {
                    quat.normalize()
                } else {
                    Quaternion::new(1.0, 0.0, 0.0, 0.0)
                };
                (vec3(&q[..3]), Matrix3::from(quat))
            }
            JointKind::Slide => (Vector3::from(body.pos) + unit(body.axis) * q[0], Matrix3::from_scale(1.0)),
            JointKind::Hinge => (Vector3::from(body.pos), Matrix3::from_axis_angle(unit(body.axis), Rad(q[0]))),
            JointKind::Fixed => (Vector3::from(body.pos), Matrix3::from_scale(1.0)),
        };
        let com = pos + rot * Vector3::from(body.arm);
        let mat = row_major(&rot);

        xpos[3 * b..3 * b + 3].copy_from_slice(&[pos.x, pos.y, pos.z]);
        xmat[9 * b..9 * b + 9].copy_from_slice(&mat);
        xipos[3 * b..3 * b + 3].copy_from_slice(&[com.x, com.y, com.z]);
        let g = dims.geom_of_body(&instance.spec, i);
        geom_xpos[3 * g..3 * g + 3].copy_from_slice(&[com.x, com.y, com.z]);
        geom_xmat[9 * g..9 * g + 9].copy_from_slice(&mat);

        if instance.spec.ground && joint.kind == JointKind::Free && com.z <= body.radius + 1e-6 {
            contacts.push((com, g));
        }
    }

    let sensordata: Vec<f64> = instance
        .spec
        .sensors
        .iter()
        .map(|s| qpos[instance.joints[s.joint].qposadr])
        .collect();

    memory.write_f64s(layout.xpos, &xpos);
    memory.write_f64s(layout.xmat, &xmat);
    memory.write_f64s(layout.xipos, &xipos);
    memory.write_f64s(layout.geom_xpos, &geom_xpos);
    memory.write_f64s(layout.geom_xmat, &geom_xmat);
    memory.write_f64s(layout.sensordata, &sensordata);

    instance.ncon = contacts.len();
    for (c, (com, geom)) in contacts.into_iter().enumerate() {
        let c32 = c as u32;
        memory.write_f64s(layout.contact_pos + 24 * c32, &[com.x, com.y, 0.0]);
        memory.write_f64s(
            layout.contact_frame + 72 * c32,
            &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        );
        memory.write_i32(layout.contact_geom1 + 4 * c32, 0);
        memory.write_i32(layout.contact_geom2 + 4 * c32, geom as i32);
    }
}

/// Advance one timestep
pub(crate) fn step(memory: &mut LinearMemory, instance: &mut Instance) -> Result<(), String> {
    let layout = instance.layout;
    let dims = instance.dims;
    let dt = instance.timestep(memory);
    if !(dt.is_finite() && dt > 0.0) {
        return Err(format!("invalid timestep {dt}"));
    }
    let gravity = Vector3::from(instance.gravity(memory));

    let mut qpos = memory.read_f64s(layout.qpos, dims.nq);
    let mut qvel = memory.read_f64s(layout.qvel, dims.nv);
    let ctrl = memory.read_f64s(layout.ctrl, dims.nu);
    let qfrc = memory.read_f64s(layout.qfrc_applied, dims.nv);
    let xfrc = memory.read_f64s(layout.xfrc_applied, 6 * dims.nbody);

    // Actuator forces accumulate into the first dof of the driven joint.
    let mut generalized = qfrc.clone();
    for (a, actuator) in instance.spec.actuators.iter().enumerate() {
        let mut u = ctrl[a];
        if let Some((lo, hi)) = instance.ctrlrange(memory, a) {
            u = u.clamp(lo, hi);
        }
        generalized[instance.joints[actuator.joint].dofadr] += actuator.gear * u;
    }

    for (i, (body, joint)) in instance.spec.bodies.iter().zip(&instance.joints).enumerate() {
        let b = i + 1;
        let force = vec3(&xfrc[6 * b..6 * b + 3]);
        let torque = vec3(&xfrc[6 * b + 3..6 * b + 6]);
        let (qa, va) = (joint.qposadr, joint.dofadr);
        let m = body.mass;
        match joint.kind {
            JointKind::Free => {
                let f = gravity * m + force + vec3(&generalized[va..va + 3]);
                let t = torque + vec3(&generalized[va + 3..va + 6]);
                let inertia = 0.4 * m * body.radius * body.radius;
                let mut v = vec3(&qvel[va..va + 3]) + f * (dt / m);
                let mut w = vec3(&qvel[va + 3..va + 6]) + t * (dt / inertia);
                let damping = (1.0 - body.damping * dt).max(0.0);
                v *= damping;
                w *= damping;

                let mut p = vec3(&qpos[qa..qa + 3]) + v * dt;
                let q = Quaternion::new(qpos[qa + 3], qpos[qa + 4], qpos[qa + 5], qpos[qa + 6]);
                let q = (q + Quaternion::from_sv(0.0, w) * q * (0.5 * dt)).normalize();

                if instance.spec.ground && p.z < body.radius {
                    p.z = body.radius;
                    v.z = v.z.max(0.0);
                    v.x *= GROUND_FRICTION;
                    v.y *= GROUND_FRICTION;
                    w *= GROUND_FRICTION;
                }
                qpos[qa..qa + 3].copy_from_slice(&[p.x, p.y, p.z]);
                qpos[qa + 3..qa + 7].copy_from_slice(&[q.s, q.v.x, q.v.y, q.v.z]);
                qvel[va..va + 3].copy_from_slice(&[v.x, v.y, v.z]);
                qvel[va + 3..va + 6].copy_from_slice(&[w.x, w.y, w.z]);
            }
            JointKind::Slide => {
                let n = unit(body.axis);
                let f = m * gravity.dot(n) + force.dot(n) + generalized[va];
                qvel[va] += dt * (f / m - body.damping * qvel[va]);
                qpos[qa] += dt * qvel[va];
                limit(body.range, &mut qpos[qa], &mut qvel[va]);
            }
            JointKind::Hinge => {
                let n = unit(body.axis);
                let rot = Matrix3::from_axis_angle(n, Rad(qpos[qa]));
                let arm = rot * Vector3::from(body.arm);
                let inertia = m * arm.magnitude2() + 0.4 * m * body.radius * body.radius;
                let tau = arm.cross(gravity * m + force).dot(n) + torque.dot(n) + generalized[va];
                qvel[va] += dt * (tau / inertia - body.damping * qvel[va]);
                qpos[qa] += dt * qvel[va];
                limit(body.range, &mut qpos[qa], &mut qvel[va]);
            }
            JointKind::Fixed => {}
        }
    }

    if qpos.iter().chain(&qvel).any(|v| !v.is_finite()) {
        return Err("simulation unstable: non-finite state".to_string());
    }

    let time = memory.read_f64(layout.time) + dt;
    memory.write_f64(layout.time, time);
    memory.write_f64s(layout.qpos, &qpos);
    memory.write_f64s(layout.qvel, &qvel);
    instance.steps += 1;
    forward(memory, instance);
    Ok(())
}

fn limit(range: Option<[f64; 2]>, q: &mut f64, v: &mut f64) {
    if let Some([lo, hi]) = range {
        if lo < hi && (*q < lo || *q > hi) {
            *q = q.clamp(lo, hi);
            *v = 0.0;
        }
    }
}

/// Reset to keyframe `key`; missing keyframe fields keep their reset value
pub(crate) fn reset_keyframe(memory: &mut LinearMemory, instance: &mut Instance, key: usize) -> Result<(), String> {
    let Some(keyframe) = instance.spec.keyframes.get(key).cloned() else {
        return Err(format!("keyframe {key} out of range"));
    };
    reset(memory, instance);
    let layout = instance.layout;
    let dims = instance.dims;
    memory.write_f64(layout.time, keyframe.time);
    for (values, ptr, len) in [
        (&keyframe.qpos, layout.qpos, dims.nq),
        (&keyframe.qvel, layout.qvel, dims.nv),
        (&keyframe.ctrl, layout.ctrl, dims.nu),
    ] {
        if let Some(values) = values {
            if values.len() == len {
                memory.write_f64s(ptr, values);
            }
        }
    }
    forward(memory, instance);
    Ok(())
}

/// `(offset, element count)` of each state component present in `signature`
fn components(instance: &Instance, signature: u32) -> Result<Vec<(Option<u32>, usize)>, String> {
    if signature & !STATE_ALL != 0 {
        return Err(format!("invalid state signature {signature:#x}"));
    }
    let layout = instance.layout;
    let dims = instance.dims;
    let table = [
        (STATE_TIME, Some(layout.time), 1),
        (STATE_QPOS, Some(layout.qpos), dims.nq),
        (STATE_QVEL, Some(layout.qvel), dims.nv),
        (STATE_ACT, None, 0),
        (STATE_WARMSTART, Some(layout.qacc_warmstart), dims.nv),
        (STATE_CTRL, Some(layout.ctrl), dims.nu),
        (STATE_QFRC_APPLIED, Some(layout.qfrc_applied), dims.nv),
        (STATE_XFRC_APPLIED, Some(layout.xfrc_applied), 6 * dims.nbody),
        (STATE_EQ_ACTIVE, None, 0),
        (STATE_MOCAP_POS, None, 0),
        (STATE_MOCAP_QUAT, None, 0),
        (STATE_USERDATA, None, 0),
        (STATE_PLUGIN, None, 0),
    ];
    Ok(table
        .into_iter()
        .filter(|(bit, _, _)| signature & bit != 0)
        .map(|(_, ptr, len)| (ptr, len))
        .collect())
}

pub(crate) fn state_size(instance: &Instance, signature: u32) -> Result<usize, String> {
    Ok(components(instance, signature)?.iter().map(|(_, len)| len).sum())
}

pub(crate) fn get_state(memory: &mut LinearMemory, instance: &Instance, dst: u32, signature: u32) -> Result<(), String> {
    let size = state_size(instance, signature)?;
    if !memory.in_bounds(dst, size * 8) {
        return Err(format!("state destination {dst} out of bounds"));
    }
    let mut cursor = dst;
    for (ptr, len) in components(instance, signature)? {
        if let Some(ptr) = ptr {
            let values = memory.read_f64s(ptr, len);
            memory.write_f64s(cursor, &values);
        }
        cursor += 8 * len as u32;
    }
    Ok(())
}

pub(crate) fn set_state(memory: &mut LinearMemory, instance: &Instance, src: u32, signature: u32) -> Result<(), String> {
    let size = state_size(instance, signature)?;
    if !memory.in_bounds(src, size * 8) {
        return Err(format!("state source {src} out of bounds"));
    }
    let mut cursor = src;
    for (ptr, len) in components(instance, signature)? {
        if let Some(ptr) = ptr {
            let values = memory.read_f64s(cursor, len);
            memory.write_f64s(ptr, &values);
        }
        cursor += 8 * len as u32;
    }
    Ok(())
}

/// Set the external wrench on the body owning `geom`, with the force
/// applied at world point `point`
pub(crate) fn apply_xfrc(
    memory: &mut LinearMemory,
    instance: &Instance,
    geom: usize,
    force: [f64; 3],
    torque: [f64; 3],
    point: [f64; 3],
) -> bool {
    if geom >= instance.dims.ngeom {
        return false;
    }
    let body = memory.read_i32(instance.layout.geom_bodyid + 4 * geom as u32);
    if body <= 0 {
        return false;
    }
    let b = body as u32;
    let com = vec3(&memory.read_f64s(instance.layout.xipos + 24 * b, 3));
    let f = Vector3::from(force);
    let t = Vector3::from(torque) + (Vector3::from(point) - com).cross(f);
    let t = if t.x.is_finite() && t.y.is_finite() && t.z.is_finite() {
        t
    } else {
        Vector3::zero()
    };
    memory.write_f64s(instance.layout.xfrc_applied + 48 * b, &[f.x, f.y, f.z, t.x, t.y, t.z]);
    true
}
