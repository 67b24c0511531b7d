//! Commands accepted by a session

use serde::{Deserialize, Serialize};

use super::ProtocolError;
use crate::simulation::fields::{FieldKind, FieldValue, FieldWrite, StructTarget};
use crate::simulation::snapshot::{CopyPrecision, WatchField};

/// A model document plus a label for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    #[serde(default)]
    pub label: String,
    pub text: String,
}

impl ModelSource {
    pub fn new(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            text: text.into(),
        }
    }
}

impl From<&str> for ModelSource {
    fn from(text: &str) -> Self {
        Self::new("inline", text)
    }
}

fn one() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    /// Replace the current model, trying `fallbacks` in order if `source`
    /// fails to compile
    Load {
        source: ModelSource,
        #[serde(default)]
        fallbacks: Vec<ModelSource>,
        #[serde(default)]
        rate: Option<f64>,
    },
    Reset,
    Step {
        #[serde(default = "one")]
        n: i64,
    },
    SetCtrl {
        index: usize,
        value: f64,
    },
    SetPaused {
        paused: bool,
    },
    SetRate {
        rate: f64,
    },
    HistoryScrub {
        offset: i64,
    },
    #[serde(rename_all = "camelCase")]
    HistoryConfig {
        #[serde(default)]
        capture_hz: Option<f64>,
        #[serde(default)]
        capacity: Option<usize>,
    },
    KeyframeSave {
        #[serde(default)]
        index: Option<usize>,
    },
    KeyframeLoad {
        index: usize,
    },
    KeyframeSelect {
        index: usize,
    },
    SetField {
        target: StructTarget,
        path: Vec<String>,
        kind: FieldKind,
        value: FieldValue,
        #[serde(default)]
        size: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    ApplyForce {
        geom_index: usize,
        force: [f64; 3],
        #[serde(default)]
        torque: [f64; 3],
        point: [f64; 3],
    },
    #[serde(rename_all = "camelCase")]
    ApplyBodyForce {
        body_id: usize,
        force: [f64; 3],
        #[serde(default)]
        torque: [f64; 3],
    },
    ClearForces,
    SetQpos {
        index: usize,
        value: f64,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    SetWatch {
        field: WatchField,
        #[serde(default)]
        index: usize,
    },
    CopyState {
        #[serde(default)]
        precision: CopyPrecision,
    },
    Align,
    Snapshot,
}

impl Command {
    /// Decode one wire command
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn load(source: impl Into<ModelSource>) -> Self {
        Command::Load {
            source: source.into(),
            fallbacks: Vec::new(),
            rate: None,
        }
    }

    /// The field write carried by a `setField`
    pub fn field_write(&self) -> Option<FieldWrite> {
        match self {
            Command::SetField {
                target,
                path,
                kind,
                value,
                size,
            } => Some(FieldWrite {
                target: *target,
                path: path.clone(),
                kind: *kind,
                value: value.clone(),
                size: *size,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let cmd = Command::from_json(r#"{"cmd":"historyConfig","captureHz":60}"#).unwrap();
        assert_eq!(
            cmd,
            Command::HistoryConfig {
                capture_hz: Some(60.0),
                capacity: None
            }
        );
        let cmd = Command::from_json(r#"{"cmd":"step"}"#).unwrap();
        assert_eq!(cmd, Command::Step { n: 1 });
        let cmd = Command::from_json(r#"{"cmd":"applyForce","geomIndex":1,"force":[0,0,1],"point":[0,0,0]}"#).unwrap();
        assert!(matches!(cmd, Command::ApplyForce { geom_index: 1, torque, .. } if torque == [0.0; 3]));
    }

    #[test]
    fn test_set_field_decodes_values() {
        let cmd = Command::from_json(
            r#"{"cmd":"setField","target":"mjVisual","path":["headlight","active"],"kind":"bool","value":true}"#,
        )
        .unwrap();
        let write = cmd.field_write().unwrap();
        assert_eq!(write.target, StructTarget::Visual);
        assert_eq!(write.value, FieldValue::Bool(true));

        let cmd = Command::from_json(
            r#"{"cmd":"setField","target":"option","path":["gravity"],"kind":"float_vec","value":[0,0,-1],"size":3}"#,
        )
        .unwrap();
        assert_eq!(cmd.field_write().unwrap().value, FieldValue::Vector(vec![0.0, 0.0, -1.0]));
    }

    #[test]
    fn test_malformed_commands_are_errors() {
        for text in ["", "{}", r#"{"cmd":"warp"}"#, r#"{"cmd":"setCtrl","index":"a"}"#, "[1,2]"] {
            assert!(matches!(Command::from_json(text), Err(ProtocolError::Malformed(_))), "{text}");
        }
    }

    #[test]
    fn test_json_round_trip_of_load() {
        let cmd = Command::load("{}");
        assert_eq!(Command::from_json(&cmd.to_json()).unwrap(), cmd);
    }
}
