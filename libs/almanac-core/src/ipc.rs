//! IPC message types for the Almanac daemon
//!
//! JSON lines over a Unix socket. Requests are adjacently tagged
//! (`{"type": "get_value", "data": {"path": "/Settings/System/Units"}}`),
//! responses are tagged by `status`.

use crate::error::AddError;
use crate::event::ChangeEvent;
use crate::node::SettingAttributes;
use crate::tree::{AddOptions, SettingDefinition};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Generic failure status for value operations
pub const STATUS_FAILED: i32 = -1;

/// Request types for Almanac IPC
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SettingsRequest {
    // ========== Value Operations ==========

    /// Value of a setting, or every value under a group keyed by relative path
    GetValue { path: String },

    /// Like `GetValue`, in string form
    GetText { path: String },

    SetValue { path: String, value: Value },

    GetMin { path: String },

    GetMax { path: String },

    GetDefault { path: String },

    /// Reset a setting, or every setting under a group
    SetDefault { path: String },

    GetSilent { path: String },

    GetAttributes { path: String },

    // ========== Definition Operations ==========

    /// Create or redefine `<group>/<name>`
    AddSetting {
        group: String,
        name: String,
        default: JsonValue,
        item_type: String,
        #[serde(default)]
        min: Option<JsonValue>,
        #[serde(default)]
        max: Option<JsonValue>,
    },

    /// Like `AddSetting`, for a setting whose changes are not logged
    AddSilentSetting {
        group: String,
        name: String,
        default: JsonValue,
        item_type: String,
        #[serde(default)]
        min: Option<JsonValue>,
        #[serde(default)]
        max: Option<JsonValue>,
    },

    /// Batch add; each item is decoded as a [`SettingRequest`]
    AddSettings { group: String, items: Vec<JsonValue> },

    /// Batch remove, paths relative to `group`
    RemoveSettings { group: String, paths: Vec<String> },

    // ========== Subscription Operations ==========

    /// Stream change events for paths under `prefix` (everything if absent)
    Subscribe {
        #[serde(default)]
        prefix: Option<String>,
    },

    // ========== System Operations ==========

    /// Run a pending save now
    Flush,

    GetStatus,

    Ping,
}

/// Response types for Almanac IPC
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettingsResponse {
    Success { data: ResponseData },

    Error { code: i32, message: String },

    /// Pushed to subscribers
    Event { event: ChangeEvent },
}

impl SettingsResponse {
    pub fn success(data: ResponseData) -> Self {
        Self::Success { data }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Response payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResponseData {
    Empty,

    Value(Value),

    Text(String),

    /// Group query result keyed by path relative to the group
    Values(BTreeMap<String, Value>),

    Texts(BTreeMap<String, String>),

    /// Min, max or default; absent attributes are `null`
    Attribute(Option<Value>),

    Silent(bool),

    Attributes(SettingAttributes),

    /// Completion status of a value write (0 success, -1 failure)
    WriteStatus(i32),

    /// Number of settings a group-level reset applied to
    Count(usize),

    AddOutcomes(Vec<AddOutcome>),

    /// Per-path removal status (0 removed, -1 not found)
    RemoveStatuses(Vec<i32>),

    Subscribed { prefix: String },

    Flushed { saved: bool },

    Status(DaemonStatus),

    Pong { version: String },
}

/// Daemon status information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub schema_version: u32,
    pub setting_count: usize,
    pub data_file: String,
    pub save_pending: bool,
}

/// One item of an `AddSettings` batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingRequest {
    /// Path relative to the batch group
    pub path: String,
    pub default: JsonValue,
    /// Type code; inferred from `default` when absent
    #[serde(rename = "type", default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub min: Option<JsonValue>,
    #[serde(default)]
    pub max: Option<JsonValue>,
    #[serde(default)]
    pub silent: bool,
    /// Legacy paths whose value the new setting adopts
    #[serde(default)]
    pub replaces: Vec<String>,
    #[serde(default)]
    pub force_value: bool,
}

impl SettingRequest {
    pub fn from_json(item: &JsonValue) -> Result<Self, AddError> {
        serde_json::from_value(item.clone()).map_err(|e| AddError::Malformed(e.to_string()))
    }

    pub fn definition(&self) -> Result<SettingDefinition, AddError> {
        let type_code = match &self.item_type {
            Some(code) => code.clone(),
            None => infer_type(&self.default)
                .ok_or_else(|| AddError::Malformed(format!("Cannot infer type of {}", self.default)))?
                .to_string(),
        };
        definition_from_json(&self.default, &type_code, &self.min, &self.max, self.silent)
    }

    pub fn options(&self) -> AddOptions {
        AddOptions {
            replaces: self.replaces.clone(),
            force_value: self.force_value,
        }
    }
}

/// Type code matching the JSON kind of a default value
pub fn infer_type(default: &JsonValue) -> Option<&'static str> {
    match default {
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => Some("i"),
        JsonValue::Number(_) => Some("f"),
        JsonValue::String(_) => Some("s"),
        _ => None,
    }
}

/// Build a definition from wire values. JSON `null` bounds are absent.
pub fn definition_from_json(
    default: &JsonValue,
    type_code: &str,
    min: &Option<JsonValue>,
    max: &Option<JsonValue>,
    silent: bool,
) -> Result<SettingDefinition, AddError> {
    let default = Value::from_json(default)
        .ok_or_else(|| AddError::Malformed(format!("Invalid default {}", default)))?;
    let bound = |json: &Option<JsonValue>| match json {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => Value::from_json(v)
            .map(Some)
            .ok_or_else(|| AddError::Malformed(format!("Invalid bound {}", v))),
    };
    Ok(SettingDefinition {
        default,
        type_code: type_code.to_string(),
        min: bound(min)?,
        max: bound(max)?,
        silent,
    })
}

/// Result of one batch item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOutcome {
    pub path: String,
    /// 0 on success, otherwise the add error code
    pub error: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl AddOutcome {
    pub fn added(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            error: 0,
            value: Some(value),
        }
    }

    pub fn failed(path: impl Into<String>, error: &AddError) -> Self {
        Self {
            path: path.into(),
            error: error.code(),
            value: None,
        }
    }
}
