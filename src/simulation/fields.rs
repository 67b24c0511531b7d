//! Writes into the engine's option, visual and statistic structs
//!
//! The option struct has a fixed layout and is addressed through its base
//! pointer when the build exports one; every other field goes through a
//! per-field pointer export named after its path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::handle::SimulationHandle;
use super::SimError;
use crate::bridge::symbols::field_export_name;
use crate::bridge::{Accessor, HeapBridge};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    F64,
    I32,
}

impl Scalar {
    pub const fn size(self) -> u32 {
        match self {
            Scalar::F64 => 8,
            Scalar::I32 => 4,
        }
    }
}

/// One field of a fixed-layout engine struct
#[derive(Debug, Clone, Copy)]
pub struct StructField {
    pub name: &'static str,
    pub offset: u32,
    pub scalar: Scalar,
    pub count: usize,
}

impl StructField {
    pub const fn new(name: &'static str, offset: u32, scalar: Scalar, count: usize) -> Self {
        Self {
            name,
            offset,
            scalar,
            count,
        }
    }
}

pub const OPTION_SIZE: u32 = 296;

/// Layout of the engine's option struct
pub const OPTION_LAYOUT: &[StructField] = &[
    StructField::new("timestep", 0, Scalar::F64, 1),
    StructField::new("impratio", 8, Scalar::F64, 1),
    StructField::new("tolerance", 16, Scalar::F64, 1),
    StructField::new("ls_tolerance", 24, Scalar::F64, 1),
    StructField::new("noslip_tolerance", 32, Scalar::F64, 1),
    StructField::new("ccd_tolerance", 40, Scalar::F64, 1),
    StructField::new("gravity", 48, Scalar::F64, 3),
    StructField::new("wind", 72, Scalar::F64, 3),
    StructField::new("magnetic", 96, Scalar::F64, 3),
    StructField::new("density", 120, Scalar::F64, 1),
    StructField::new("viscosity", 128, Scalar::F64, 1),
    StructField::new("o_margin", 136, Scalar::F64, 1),
    StructField::new("o_solref", 144, Scalar::F64, 2),
    StructField::new("o_solimp", 160, Scalar::F64, 5),
    StructField::new("o_friction", 200, Scalar::F64, 5),
    StructField::new("integrator", 240, Scalar::I32, 1),
    StructField::new("cone", 244, Scalar::I32, 1),
    StructField::new("jacobian", 248, Scalar::I32, 1),
    StructField::new("solver", 252, Scalar::I32, 1),
    StructField::new("iterations", 256, Scalar::I32, 1),
    StructField::new("ls_iterations", 260, Scalar::I32, 1),
    StructField::new("noslip_iterations", 264, Scalar::I32, 1),
    StructField::new("ccd_iterations", 268, Scalar::I32, 1),
    StructField::new("disableflags", 272, Scalar::I32, 1),
    StructField::new("enableflags", 276, Scalar::I32, 1),
    StructField::new("disableactuator", 280, Scalar::I32, 1),
    StructField::new("sdf_initpoints", 284, Scalar::I32, 1),
    StructField::new("sdf_iterations", 288, Scalar::I32, 1),
];

pub fn option_field(name: &str) -> Option<&'static StructField> {
    OPTION_LAYOUT.iter().find(|f| f.name == name)
}

/// Engine struct addressed by a field write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructTarget {
    #[serde(alias = "mjOption", alias = "opt")]
    Option,
    #[serde(alias = "mjVisual", alias = "vis")]
    Visual,
    #[serde(alias = "mjStatistic", alias = "stat")]
    Statistic,
}

impl StructTarget {
    fn export_prefix(self) -> &'static str {
        match self {
            StructTarget::Option => "model_opt",
            StructTarget::Visual => "model_vis",
            StructTarget::Statistic => "model_stat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Float,
    FloatVec,
    Int,
    Enum,
    Bool,
}

impl FieldKind {
    fn scalar(self) -> Scalar {
        match self {
            FieldKind::Float | FieldKind::FloatVec => Scalar::F64,
            FieldKind::Int | FieldKind::Enum | FieldKind::Bool => Scalar::I32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Vector(Vec<f64>),
}

impl FieldValue {
    pub fn to_f64s(&self) -> Vec<f64> {
        match self {
            FieldValue::Bool(b) => vec![if *b { 1.0 } else { 0.0 }],
            FieldValue::Number(x) => vec![*x],
            FieldValue::Vector(values) => values.clone(),
        }
    }
}

/// Split `name[3]` into `("name", Some(3))`
pub fn parse_segment(segment: &str) -> (&str, Option<usize>) {
    if let Some(open) = segment.find('[') {
        if let Some(inner) = segment[open + 1..].strip_suffix(']') {
            if let Ok(index) = inner.trim().parse() {
                return (&segment[..open], Some(index));
            }
        }
    }
    (segment, None)
}

/// Set `value` at `path` inside a JSON mirror, creating objects and arrays
/// along the way
pub fn set_mirror_path(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut node = root;
    for segment in parents {
        let (name, index) = parse_segment(segment);
        node = child(node, name);
        if let Some(index) = index {
            node = element(node, index);
        }
    }
    let (name, index) = parse_segment(last);
    match index {
        Some(index) => *element(child(node, name), index) = value,
        None => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                map.insert(name.to_string(), value);
            }
        }
    }
}

fn child<'a>(node: &'a mut Value, name: &str) -> &'a mut Value {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map.entry(name.to_string()).or_insert(Value::Null),
        _ => unreachable!("node was just made an object"),
    }
}

fn element(node: &mut Value, index: usize) -> &mut Value {
    if !node.is_array() {
        *node = Value::Array(Vec::new());
    }
    match node {
        Value::Array(items) => {
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            &mut items[index]
        }
        _ => unreachable!("node was just made an array"),
    }
}

/// JSON form of written values as the mirror stores them
pub fn mirror_value(kind: FieldKind, values: &[f64]) -> Value {
    let one = |v: f64| match kind {
        FieldKind::Bool => Value::Bool(v != 0.0),
        FieldKind::Int | FieldKind::Enum => Value::from(v.round() as i64),
        FieldKind::Float | FieldKind::FloatVec => Value::from(v),
    };
    if kind == FieldKind::FloatVec || values.len() > 1 {
        Value::Array(values.iter().copied().map(one).collect())
    } else {
        values.first().copied().map_or(Value::Null, one)
    }
}

/// A field write request
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub target: StructTarget,
    pub path: Vec<String>,
    pub kind: FieldKind,
    pub value: FieldValue,
    pub size: Option<usize>,
}

impl FieldWrite {
    fn path_str(&self) -> String {
        self.path.join(".")
    }

    fn reject(&self, reason: impl Into<String>) -> SimError {
        SimError::Field {
            path: self.path_str(),
            reason: reason.into(),
        }
    }

    /// Whether this write changes the engine timestep
    pub fn is_timestep(&self) -> bool {
        self.target == StructTarget::Option && self.path.first().map(|s| parse_segment(s).0) == Some("timestep")
    }
}

impl SimulationHandle {
    /// Write one struct field, returning the values written
    pub fn write_field(&mut self, bridge: &mut HeapBridge, write: &FieldWrite) -> Result<Vec<f64>, SimError> {
        let values = write.value.to_f64s();
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return Err(write.reject("values must be finite"));
        }
        let Some(first) = write.path.first() else {
            return Err(write.reject("empty path"));
        };

        let (ptr, scalar, capacity) = match write.target {
            StructTarget::Option => {
                let (name, index) = parse_segment(first);
                match option_field(name) {
                    Some(field) => {
                        let index = index.unwrap_or(0);
                        if index >= field.count {
                            return Err(write.reject(format!("index {index} out of range")));
                        }
                        let base = self.option_field_base(bridge, field);
                        let ptr = if base > 0 {
                            base + (index as u32 * field.scalar.size()) as i64
                        } else {
                            0
                        };
                        (ptr, field.scalar, field.count - index)
                    }
                    None => {
                        let export = field_export_name(write.target.export_prefix(), &write.path);
                        (self.field_ptr(bridge, &export), write.kind.scalar(), usize::MAX)
                    }
                }
            }
            StructTarget::Visual | StructTarget::Statistic => {
                let export = field_export_name(write.target.export_prefix(), &write.path);
                (self.field_ptr(bridge, &export), write.kind.scalar(), usize::MAX)
            }
        };
        if ptr <= 0 {
            return Err(write.reject("field is not exported by this engine build"));
        }

        let expected = write.size.unwrap_or(match write.kind {
            FieldKind::FloatVec => capacity.min(values.len()),
            _ => 1,
        });
        if expected == 0 || values.len() < expected {
            return Err(write.reject(format!("expected {expected} values, got {}", values.len())));
        }
        if expected > capacity {
            return Err(write.reject(format!("field holds {capacity} values, got {expected}")));
        }
        let written = &values[..expected];
        let ok = match scalar {
            Scalar::F64 => bridge.write_slice(ptr, written),
            Scalar::I32 => {
                let ints: Vec<i32> = written.iter().map(|v| v.round() as i32).collect();
                bridge.write_slice(ptr, &ints)
            }
        };
        if !ok {
            return Err(write.reject("write out of bounds"));
        }
        Ok(written.to_vec())
    }

    fn option_field_base(&mut self, bridge: &mut HeapBridge, field: &StructField) -> i64 {
        let base = self.array_ptr(bridge, Accessor::OptionStruct);
        if base > 0 {
            return base + field.offset as i64;
        }
        let export = format!("mjwf_model_opt_{}_ptr", field.name);
        self.field_ptr(bridge, &export)
    }

    /// JSON mirror of the whole option struct; fields the build does not
    /// expose are omitted
    pub fn read_options(&mut self, bridge: &mut HeapBridge) -> Value {
        let mut map = Map::new();
        for field in OPTION_LAYOUT {
            let ptr = self.option_field_base(bridge, field);
            if ptr <= 0 {
                continue;
            }
            let values: Vec<f64> = match field.scalar {
                Scalar::F64 => bridge.read_vec::<f64>(ptr, field.count as i64),
                Scalar::I32 => bridge
                    .read_vec::<i32>(ptr, field.count as i64)
                    .into_iter()
                    .map(f64::from)
                    .collect(),
            };
            if values.len() != field.count {
                continue;
            }
            let kind = match (field.scalar, field.count) {
                (Scalar::I32, _) => FieldKind::Int,
                (Scalar::F64, 1) => FieldKind::Float,
                (Scalar::F64, _) => FieldKind::FloatVec,
            };
            map.insert(field.name.to_string(), mirror_value(kind, &values));
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AbiVariant;
    use crate::engine::reference::models;
    use crate::simulation::handle::tests::loaded;
    use serde_json::json;

    fn write(target: StructTarget, path: &[&str], kind: FieldKind, value: FieldValue) -> FieldWrite {
        FieldWrite {
            target,
            path: path.iter().map(|s| s.to_string()).collect(),
            kind,
            value,
            size: None,
        }
    }

    #[test]
    fn test_layout_is_contiguous() {
        let mut end = 0;
        for field in OPTION_LAYOUT {
            assert!(field.offset >= end, "{} overlaps", field.name);
            end = field.offset + field.scalar.size() * field.count as u32;
        }
        assert!(end <= OPTION_SIZE);
    }

    #[test]
    fn test_timestep_write_both_variants() {
        for variant in [AbiVariant::Current, AbiVariant::Legacy] {
            let (mut bridge, mut handle) = loaded(variant, models::PENDULUM);
            let request = write(StructTarget::Option, &["timestep"], FieldKind::Float, FieldValue::Number(0.001));
            assert!(request.is_timestep());
            handle.write_field(&mut bridge, &request).unwrap();
            assert_eq!(handle.timestep(&mut bridge), Some(0.001));
        }
    }

    #[test]
    fn test_vector_and_indexed_writes() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::FALLING_BALL);
        let gravity = write(
            StructTarget::Option,
            &["gravity"],
            FieldKind::FloatVec,
            FieldValue::Vector(vec![0.0, 0.0, -1.62]),
        );
        handle.write_field(&mut bridge, &gravity).unwrap();
        let z = write(StructTarget::Option, &["gravity[0]"], FieldKind::Float, FieldValue::Number(0.5));
        handle.write_field(&mut bridge, &z).unwrap();
        let options = handle.read_options(&mut bridge);
        assert_eq!(options["gravity"], json!([0.5, 0.0, -1.62]));
        assert_eq!(options["iterations"], json!(100));
    }

    #[test]
    fn test_rejects_bad_values() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::FALLING_BALL);
        let nan = write(StructTarget::Option, &["timestep"], FieldKind::Float, FieldValue::Number(f64::NAN));
        assert!(handle.write_field(&mut bridge, &nan).is_err());
        let mut short = write(StructTarget::Option, &["gravity"], FieldKind::FloatVec, FieldValue::Vector(vec![1.0]));
        short.size = Some(3);
        assert!(handle.write_field(&mut bridge, &short).is_err());
        let unknown = write(StructTarget::Visual, &["nope"], FieldKind::Float, FieldValue::Number(1.0));
        assert!(handle.write_field(&mut bridge, &unknown).is_err());
    }

    #[test]
    fn test_visual_field_through_pointer_export() {
        let (mut bridge, mut handle) = loaded(AbiVariant::Current, models::FALLING_BALL);
        let ambient = write(
            StructTarget::Visual,
            &["headlight", "ambient"],
            FieldKind::FloatVec,
            FieldValue::Vector(vec![0.2, 0.3, 0.4]),
        );
        assert_eq!(handle.write_field(&mut bridge, &ambient).unwrap(), vec![0.2, 0.3, 0.4]);
        let active = write(StructTarget::Visual, &["headlight", "active"], FieldKind::Bool, FieldValue::Bool(false));
        assert_eq!(handle.write_field(&mut bridge, &active).unwrap(), vec![0.0]);
    }

    #[test]
    fn test_mirror_paths() {
        let mut mirror = Value::Null;
        set_mirror_path(&mut mirror, &["headlight".into(), "ambient".into()], json!([0.1, 0.2, 0.3]));
        set_mirror_path(&mut mirror, &["rgba".into(), "contactpoint[3]".into()], json!(0.5));
        assert_eq!(mirror["headlight"]["ambient"], json!([0.1, 0.2, 0.3]));
        assert_eq!(mirror["rgba"]["contactpoint"], json!([null, null, null, 0.5]));
        assert_eq!(parse_segment("a[12]"), ("a", Some(12)));
        assert_eq!(parse_segment("a[x]"), ("a[x]", None));
    }

    #[test]
    fn test_mirror_value_shapes() {
        assert_eq!(mirror_value(FieldKind::Int, &[2.6]), json!(3));
        assert_eq!(mirror_value(FieldKind::Bool, &[0.0]), json!(false));
        assert_eq!(mirror_value(FieldKind::FloatVec, &[1.0]), json!([1.0]));
    }
}
