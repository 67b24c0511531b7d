//! Model/data placement in linear memory

use super::memory::{align8, LinearMemory};
use super::model::{Dims, JointInfo, ModelSpec};
use crate::simulation::fields::{Scalar, StructField, OPTION_LAYOUT, OPTION_SIZE};

/// Visual struct storage exposed through `mjwf_model_vis_*_ptr`
pub const VISUAL_LAYOUT: &[StructField] = &[
    StructField::new("global.fovy", 0, Scalar::F64, 1),
    StructField::new("global.azimuth", 8, Scalar::F64, 1),
    StructField::new("global.elevation", 16, Scalar::F64, 1),
    StructField::new("headlight.active", 24, Scalar::I32, 1),
    StructField::new("headlight.ambient", 32, Scalar::F64, 3),
    StructField::new("headlight.diffuse", 56, Scalar::F64, 3),
    StructField::new("headlight.specular", 80, Scalar::F64, 3),
    StructField::new("map.znear", 104, Scalar::F64, 1),
    StructField::new("map.zfar", 112, Scalar::F64, 1),
    StructField::new("scale.forcewidth", 120, Scalar::F64, 1),
    StructField::new("scale.contactwidth", 128, Scalar::F64, 1),
    StructField::new("rgba.contactpoint", 136, Scalar::F64, 4),
];
const VISUAL_SIZE: u32 = 168;

/// Statistic struct storage exposed through `mjwf_model_stat_*_ptr`
pub const STATISTIC_LAYOUT: &[StructField] = &[
    StructField::new("meaninertia", 0, Scalar::F64, 1),
    StructField::new("meanmass", 8, Scalar::F64, 1),
    StructField::new("meansize", 16, Scalar::F64, 1),
    StructField::new("extent", 24, Scalar::F64, 1),
    StructField::new("center", 32, Scalar::F64, 3),
];
const STATISTIC_SIZE: u32 = 56;

fn option_default(name: &str) -> &'static [f64] {
    match name {
        "impratio" => &[1.0],
        "tolerance" => &[1e-8],
        "ls_tolerance" => &[0.01],
        "noslip_tolerance" | "ccd_tolerance" => &[1e-6],
        "magnetic" => &[0.0, -0.5, 0.0],
        "o_solref" => &[0.02, 1.0],
        "o_solimp" => &[0.9, 0.95, 0.001, 0.5, 2.0],
        "o_friction" => &[1.0, 1.0, 0.005, 0.0001, 0.0001],
        "jacobian" | "solver" => &[2.0],
        "iterations" => &[100.0],
        "ls_iterations" | "ccd_iterations" => &[50.0],
        "sdf_initpoints" => &[40.0],
        "sdf_iterations" => &[10.0],
        _ => &[],
    }
}

fn visual_default(name: &str) -> &'static [f64] {
    match name {
        "global.fovy" => &[45.0],
        "global.azimuth" => &[90.0],
        "global.elevation" => &[-45.0],
        "headlight.active" => &[1.0],
        "headlight.ambient" => &[0.1, 0.1, 0.1],
        "headlight.diffuse" => &[0.4, 0.4, 0.4],
        "headlight.specular" => &[0.5, 0.5, 0.5],
        "map.znear" => &[0.01],
        "map.zfar" => &[50.0],
        "scale.forcewidth" => &[0.1],
        "scale.contactwidth" => &[0.3],
        "rgba.contactpoint" => &[0.9, 0.6, 0.2, 1.0],
        _ => &[],
    }
}

/// Absolute offsets of every model and data array
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Layout {
    pub model: u32,
    pub opt: u32,
    pub vis: u32,
    pub stat: u32,
    pub ctrlrange: u32,
    pub geom_bodyid: u32,
    pub name_actuatoradr: u32,
    pub names: u32,

    pub data: u32,
    pub time: u32,
    pub qpos: u32,
    pub qvel: u32,
    pub ctrl: u32,
    pub qfrc_applied: u32,
    pub xfrc_applied: u32,
    pub qacc_warmstart: u32,
    pub geom_xpos: u32,
    pub geom_xmat: u32,
    pub xpos: u32,
    pub xmat: u32,
    pub xipos: u32,
    pub sensordata: u32,
    pub contact_pos: u32,
    pub contact_frame: u32,
    pub contact_geom1: u32,
    pub contact_geom2: u32,
    pub end: u32,
}

impl Layout {
    fn plan(base: u32, dims: &Dims, names_len: usize) -> Self {
        let mut cursor = base;
        let mut take = |bytes: usize| {
            let ptr = cursor;
            cursor = align8(cursor + bytes as u32);
            ptr
        };
        let f64s = |n: usize| n * 8;
        let i32s = |n: usize| n * 4;

        let mut layout = Layout {
            model: base,
            ..Layout::default()
        };
        layout.opt = take(OPTION_SIZE as usize);
        layout.vis = take(VISUAL_SIZE as usize);
        layout.stat = take(STATISTIC_SIZE as usize);
        layout.ctrlrange = take(f64s(2 * dims.nu));
        layout.geom_bodyid = take(i32s(dims.ngeom));
        layout.name_actuatoradr = take(i32s(dims.nu));
        layout.names = take(names_len.max(1));

        layout.data = take(0);
        layout.time = take(f64s(1));
        layout.qpos = take(f64s(dims.nq));
        layout.qvel = take(f64s(dims.nv));
        layout.ctrl = take(f64s(dims.nu));
        layout.qfrc_applied = take(f64s(dims.nv));
        layout.xfrc_applied = take(f64s(6 * dims.nbody));
        layout.qacc_warmstart = take(f64s(dims.nv));
        layout.geom_xpos = take(f64s(3 * dims.ngeom));
        layout.geom_xmat = take(f64s(9 * dims.ngeom));
        layout.xpos = take(f64s(3 * dims.nbody));
        layout.xmat = take(f64s(9 * dims.nbody));
        layout.xipos = take(f64s(3 * dims.nbody));
        layout.sensordata = take(f64s(dims.nsensordata));
        layout.contact_pos = take(f64s(3 * dims.nconmax));
        layout.contact_frame = take(f64s(9 * dims.nconmax));
        layout.contact_geom1 = take(i32s(dims.nconmax));
        layout.contact_geom2 = take(i32s(dims.nconmax));
        layout.end = take(0);
        layout
    }

    pub fn data_bytes(&self) -> usize {
        (self.end - self.data) as usize
    }
}

/// One loaded model and its data
#[derive(Debug)]
pub(crate) struct Instance {
    pub spec: ModelSpec,
    pub dims: Dims,
    pub joints: Vec<JointInfo>,
    pub layout: Layout,
    pub qpos0: Vec<f64>,
    pub ncon: usize,
    pub steps: u64,
}

impl Instance {
    /// Allocate and initialise model and data blocks
    pub fn create(memory: &mut LinearMemory, spec: ModelSpec) -> Self {
        let (dims, joints) = Dims::of(&spec);
        let mut names = Vec::new();
        let mut name_adr = Vec::with_capacity(dims.nu);
        for actuator in &spec.actuators {
            name_adr.push(names.len() as i32);
            names.extend_from_slice(actuator.name.as_bytes());
            names.push(0);
        }

        let probe = Layout::plan(0, &dims, names.len());
        let base = memory.alloc(probe.end);
        let layout = Layout::plan(base, &dims, names.len());
        let qpos0 = super::model::qpos0(&spec, &dims);

        for field in OPTION_LAYOUT {
            let values: &[f64] = match field.name {
                "timestep" => std::slice::from_ref(&spec.timestep),
                "gravity" => &spec.gravity,
                other => option_default(other),
            };
            write_field(memory, layout.opt, field, values);
        }
        for field in VISUAL_LAYOUT {
            write_field(memory, layout.vis, field, visual_default(field.name));
        }

        let ctrlrange: Vec<f64> = spec
            .actuators
            .iter()
            .flat_map(|a| a.ctrlrange.unwrap_or([0.0, 0.0]))
            .collect();
        memory.write_f64s(layout.ctrlrange, &ctrlrange);
        let mut geom_bodyid = Vec::with_capacity(dims.ngeom);
        if spec.ground {
            geom_bodyid.push(0);
        }
        geom_bodyid.extend((1..dims.nbody).map(|b| b as i32));
        memory.write_i32s(layout.geom_bodyid, &geom_bodyid);
        memory.write_i32s(layout.name_actuatoradr, &name_adr);
        let start = layout.names as usize;
        memory.bytes_mut()[start..start + names.len()].copy_from_slice(&names);

        let mut instance = Instance {
            spec,
            dims,
            joints,
            layout,
            qpos0,
            ncon: 0,
            steps: 0,
        };
        super::dynamics::reset(memory, &mut instance);
        instance.write_statistics(memory);
        instance
    }

    fn write_statistics(&self, memory: &mut LinearMemory) {
        let bodies = &self.spec.bodies;
        let n = bodies.len().max(1) as f64;
        let geoms = memory.read_f64s(self.layout.xipos, 3 * self.dims.nbody);
        let mut center = [0.0; 3];
        for b in 1..self.dims.nbody {
            for k in 0..3 {
                center[k] += geoms[3 * b + k] / n;
            }
        }
        let mut extent: f64 = 0.0;
        for (i, body) in bodies.iter().enumerate() {
            let b = i + 1;
            let d: f64 = (0..3).map(|k| (geoms[3 * b + k] - center[k]).powi(2)).sum::<f64>().sqrt();
            extent = extent.max(d + body.radius);
        }
        let meanmass = bodies.iter().map(|b| b.mass).sum::<f64>() / n;
        let meansize = bodies.iter().map(|b| b.radius).sum::<f64>() / n;
        let meaninertia = bodies.iter().map(|b| 0.4 * b.mass * b.radius * b.radius).sum::<f64>() / n;

        let stat = self.layout.stat;
        memory.write_f64(stat, meaninertia);
        memory.write_f64(stat + 8, meanmass);
        memory.write_f64(stat + 16, meansize);
        memory.write_f64(stat + 24, (2.0 * extent).max(1.0));
        memory.write_f64s(stat + 32, &center);
    }

    pub fn timestep(&self, memory: &LinearMemory) -> f64 {
        memory.read_f64(self.layout.opt)
    }

    pub fn gravity(&self, memory: &LinearMemory) -> [f64; 3] {
        let g = memory.read_f64s(self.layout.opt + 48, 3);
        [g[0], g[1], g[2]]
    }

    pub fn ctrlrange(&self, memory: &LinearMemory, actuator: usize) -> Option<(f64, f64)> {
        let lo = memory.read_f64(self.layout.ctrlrange + 16 * actuator as u32);
        let hi = memory.read_f64(self.layout.ctrlrange + 16 * actuator as u32 + 8);
        (hi - lo > 1e-12).then_some((lo, hi))
    }
}

fn write_field(memory: &mut LinearMemory, base: u32, field: &StructField, values: &[f64]) {
    for (i, &value) in values.iter().take(field.count).enumerate() {
        match field.scalar {
            Scalar::F64 => memory.write_f64(base + field.offset + 8 * i as u32, value),
            Scalar::I32 => memory.write_i32(base + field.offset + 4 * i as u32, value as i32),
        }
    }
}

/// Export names for every struct field pointer, paired with the absolute
/// offset resolver key: `(name, struct, offset)`.
pub(crate) fn field_exports() -> Vec<(String, StructKind, u32)> {
    let mut out = Vec::new();
    for field in OPTION_LAYOUT {
        out.push((format!("mjwf_model_opt_{}_ptr", field.name), StructKind::Option, field.offset));
    }
    for field in VISUAL_LAYOUT {
        out.push((
            format!("mjwf_model_vis_{}_ptr", field.name.replace('.', "_")),
            StructKind::Visual,
            field.offset,
        ));
    }
    for field in STATISTIC_LAYOUT {
        out.push((
            format!("mjwf_model_stat_{}_ptr", field.name.replace('.', "_")),
            StructKind::Statistic,
            field.offset,
        ));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StructKind {
    Option,
    Visual,
    Statistic,
}

impl Layout {
    pub fn struct_base(&self, kind: StructKind) -> u32 {
        match kind {
            StructKind::Option => self.opt,
            StructKind::Visual => self.vis,
            StructKind::Statistic => self.stat,
        }
    }
}
