//! Change notifications emitted by tree mutations

use crate::node::SettingAttributes;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Attribute part of a change notification, sent only when attributes changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub default: Option<Value>,
}

impl From<&SettingAttributes> for AttributeChange {
    fn from(attributes: &SettingAttributes) -> Self {
        Self {
            min: attributes.min.clone(),
            max: attributes.max.clone(),
            default: attributes.default.clone(),
        }
    }
}

/// Events relayed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A value or the attribute set of a setting changed
    ValueChanged {
        path: String,
        value: Value,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<AttributeChange>,
    },

    /// A setting was deleted; its value is now absent
    Removed { path: String },

    /// A save cycle persisted newly created settings
    PathsAdded { paths: Vec<String> },
}

impl ChangeEvent {
    /// Path the event concerns, if it concerns a single setting
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::ValueChanged { path, .. } | Self::Removed { path } => Some(path),
            Self::PathsAdded { .. } => None,
        }
    }

    /// Whether a subscriber watching `prefix` should see this event.
    ///
    /// Matching is segment-wise: `/Settings/Gui` covers `/Settings/Gui/X`
    /// but not `/Settings/GuiExtra`.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        match self {
            Self::PathsAdded { paths } => paths.iter().any(|p| under_prefix(p, prefix)),
            _ => self.path().is_some_and(|p| under_prefix(p, prefix)),
        }
    }
}

fn under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
