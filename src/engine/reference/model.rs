//! Model description accepted by the reference engine
//!
//! The reference engine reads a compact JSON document in place of MJCF:
//!
//! ```json
//! {
//!   "timestep": 0.002,
//!   "bodies": [{ "name": "ball", "joint": "free", "pos": [0, 0, 1] }],
//!   "actuators": [{ "joint": 0, "gear": 1.0, "ctrlrange": [-1, 1] }],
//!   "keyframes": [{ "qpos": [0, 0, 2, 1, 0, 0, 0] }]
//! }
//! ```

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JointKind {
    #[default]
    Free,
    Slide,
    Hinge,
    Fixed,
}

impl JointKind {
    pub fn nq(self) -> usize {
        match self {
            JointKind::Free => 7,
            JointKind::Slide | JointKind::Hinge => 1,
            JointKind::Fixed => 0,
        }
    }

    pub fn nv(self) -> usize {
        match self {
            JointKind::Free => 6,
            JointKind::Slide | JointKind::Hinge => 1,
            JointKind::Fixed => 0,
        }
    }
}

fn default_timestep() -> f64 {
    0.002
}

fn default_gravity() -> [f64; 3] {
    [0.0, 0.0, -9.81]
}

fn default_true() -> bool {
    true
}

fn default_mass() -> f64 {
    1.0
}

fn default_radius() -> f64 {
    0.1
}

fn default_axis() -> [f64; 3] {
    [0.0, 0.0, 1.0]
}

fn default_gear() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct BodySpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub joint: JointKind,
    #[serde(default)]
    pub pos: [f64; 3],
    #[serde(default = "default_mass")]
    pub mass: f64,
    #[serde(default = "default_radius")]
    pub radius: f64,
    /// Slide direction or hinge axis
    #[serde(default = "default_axis")]
    pub axis: [f64; 3],
    /// Centre of mass offset from the hinge pivot
    #[serde(default)]
    pub arm: [f64; 3],
    #[serde(default)]
    pub damping: f64,
    #[serde(default)]
    pub range: Option<[f64; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorSpec {
    #[serde(default)]
    pub name: String,
    /// Index into `bodies` of the driven joint
    pub joint: usize,
    #[serde(default = "default_gear")]
    pub gear: f64,
    #[serde(default)]
    pub ctrlrange: Option<[f64; 2]>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyframeSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub qpos: Option<Vec<f64>>,
    #[serde(default)]
    pub qvel: Option<Vec<f64>>,
    #[serde(default)]
    pub ctrl: Option<Vec<f64>>,
}

/// Joint position sensor
#[derive(Debug, Clone, Deserialize)]
pub struct SensorSpec {
    pub joint: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    #[serde(default = "default_timestep")]
    pub timestep: f64,
    #[serde(default = "default_gravity")]
    pub gravity: [f64; 3],
    #[serde(default = "default_true")]
    pub ground: bool,
    #[serde(default)]
    pub bodies: Vec<BodySpec>,
    #[serde(default)]
    pub actuators: Vec<ActuatorSpec>,
    #[serde(default)]
    pub keyframes: Vec<KeyframeSpec>,
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
}

impl ModelSpec {
    /// Parse and validate a model document
    pub fn parse(text: &str) -> Result<Self, String> {
        let spec: ModelSpec = serde_json::from_str(text).map_err(|e| format!("model parse error: {e}"))?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), String> {
        if !(self.timestep.is_finite() && self.timestep > 0.0) {
            return Err(format!("invalid timestep {}", self.timestep));
        }
        for (i, body) in self.bodies.iter().enumerate() {
            if !(body.mass.is_finite() && body.mass > 0.0) {
                return Err(format!("body {i}: mass must be positive"));
            }
            if !(body.radius.is_finite() && body.radius > 0.0) {
                return Err(format!("body {i}: radius must be positive"));
            }
        }
        for (i, actuator) in self.actuators.iter().enumerate() {
            match self.bodies.get(actuator.joint) {
                Some(body) if body.joint != JointKind::Fixed => {}
                _ => return Err(format!("actuator {i}: joint {} is not a movable body", actuator.joint)),
            }
        }
        for (i, sensor) in self.sensors.iter().enumerate() {
            match self.bodies.get(sensor.joint) {
                Some(body) if body.joint != JointKind::Fixed => {}
                _ => return Err(format!("sensor {i}: joint {} is not a movable body", sensor.joint)),
            }
        }
        Ok(())
    }
}

/// Per-joint addressing, indexed like `bodies`
#[derive(Debug, Clone, Copy)]
pub struct JointInfo {
    pub kind: JointKind,
    pub qposadr: usize,
    pub dofadr: usize,
}

/// Model dimensions as the engine reports them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dims {
    pub nq: usize,
    pub nv: usize,
    pub nu: usize,
    pub nbody: usize,
    pub ngeom: usize,
    pub njnt: usize,
    pub nkey: usize,
    pub nsensordata: usize,
    pub nconmax: usize,
}

impl Dims {
    pub fn of(spec: &ModelSpec) -> (Self, Vec<JointInfo>) {
        let mut joints = Vec::with_capacity(spec.bodies.len());
        let (mut nq, mut nv) = (0, 0);
        for body in &spec.bodies {
            joints.push(JointInfo {
                kind: body.joint,
                qposadr: nq,
                dofadr: nv,
            });
            nq += body.joint.nq();
            nv += body.joint.nv();
        }
        let dims = Dims {
            nq,
            nv,
            nu: spec.actuators.len(),
            nbody: spec.bodies.len() + 1,
            ngeom: spec.bodies.len() + usize::from(spec.ground),
            njnt: spec.bodies.iter().filter(|b| b.joint != JointKind::Fixed).count(),
            nkey: spec.keyframes.len(),
            nsensordata: spec.sensors.len(),
            nconmax: spec.bodies.len(),
        };
        (dims, joints)
    }

    /// Geom index of body `b` (0-based into `bodies`)
    pub fn geom_of_body(&self, spec: &ModelSpec, b: usize) -> usize {
        b + usize::from(spec.ground)
    }
}

/// Initial configuration: free joints at their body position with identity
/// orientation, scalar joints at zero.
pub fn qpos0(spec: &ModelSpec, dims: &Dims) -> Vec<f64> {
    let mut qpos = Vec::with_capacity(dims.nq);
    for body in &spec.bodies {
        if body.joint == JointKind::Free {
            qpos.extend_from_slice(&body.pos);
            qpos.extend_from_slice(&[1.0, 0.0, 0.0, 0.0]);
        } else if body.joint != JointKind::Fixed {
            qpos.push(0.0);
        }
    }
    qpos
}
