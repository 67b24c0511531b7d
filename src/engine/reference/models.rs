//! Ready-made model documents for the reference engine

/// One free-floating sphere dropped from 1 m: `nq = 7`, `nv = 6`
pub const FALLING_BALL: &str = r#"{
  "timestep": 0.002,
  "bodies": [
    { "name": "ball", "joint": "free", "pos": [0, 0, 1], "radius": 0.1, "mass": 1.0 }
  ]
}"#;

/// Damped, torque-driven pendulum with two native keyframes and a joint
/// position sensor
pub const PENDULUM: &str = r#"{
  "timestep": 0.002,
  "bodies": [
    { "name": "pole", "joint": "hinge", "pos": [0, 0, 1.2], "axis": [0, 1, 0],
      "arm": [0, 0, -0.5], "radius": 0.05, "mass": 0.5, "damping": 0.05 }
  ],
  "actuators": [
    { "name": "torque", "joint": 0, "gear": 1.0, "ctrlrange": [-2, 2] }
  ],
  "keyframes": [
    { "name": "rest", "qpos": [0] },
    { "name": "raised", "qpos": [1.2], "qvel": [0.5] }
  ],
  "sensors": [ { "joint": 0 } ]
}"#;

/// Cart with a free-swinging pole. The second actuator has no control range
/// and is therefore never clamped.
pub const CART_POLE: &str = r#"{
  "timestep": 0.004,
  "ground": false,
  "bodies": [
    { "name": "cart", "joint": "slide", "pos": [0, 0, 0.5], "axis": [1, 0, 0],
      "range": [-2, 2], "mass": 2.0, "radius": 0.15 },
    { "name": "pole", "joint": "hinge", "pos": [0, 0, 0.5], "axis": [0, 1, 0],
      "arm": [0, 0, 0.6], "mass": 0.3, "radius": 0.04, "damping": 0.01 }
  ],
  "actuators": [
    { "name": "slide", "joint": 0, "gear": 10.0, "ctrlrange": [-1, 1] },
    { "name": "hinge", "joint": 1, "gear": 1.0 }
  ],
  "keyframes": [ { "name": "tilted", "qpos": [0.5, 0.3] } ],
  "sensors": [ { "joint": 0 }, { "joint": 1 } ]
}"#;
