//! Tree nodes: groups own children by name, settings hold a typed value

use crate::error::SetError;
use crate::value::{Value, ValueType};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Index of a node inside the tree arena.
///
/// Handles are non-owning; they are only valid until the node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Declared attributes of a setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingAttributes {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub default: Option<Value>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub silent: bool,
}

impl SettingAttributes {
    /// Check `value` against min and max; absent bounds never reject
    pub fn check_bounds(&self, value: &Value) -> Result<(), SetError> {
        if let Some(min) = &self.min {
            if value.compare(min) == Some(Ordering::Less) {
                return Err(SetError::BelowMin {
                    value: value.clone(),
                    min: min.clone(),
                });
            }
        }
        if let Some(max) = &self.max {
            if value.compare(max) == Some(Ordering::Greater) {
                return Err(SetError::AboveMax {
                    value: value.clone(),
                    max: max.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A leaf entry
#[derive(Debug, Clone)]
pub struct SettingNode {
    pub(crate) path: String,
    pub(crate) value: Value,
    pub(crate) attributes: SettingAttributes,
    pub(crate) group: NodeId,
}

impl SettingNode {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        last_segment(&self.path)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// String form of the value
    pub fn text(&self) -> String {
        self.value.to_string()
    }

    pub fn value_type(&self) -> ValueType {
        self.attributes.value_type
    }

    pub fn min(&self) -> Option<&Value> {
        self.attributes.min.as_ref()
    }

    pub fn max(&self) -> Option<&Value> {
        self.attributes.max.as_ref()
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.attributes.default.as_ref()
    }

    pub fn silent(&self) -> bool {
        self.attributes.silent
    }

    pub fn attributes(&self) -> &SettingAttributes {
        &self.attributes
    }

    /// Owning group
    pub fn group(&self) -> NodeId {
        self.group
    }
}

/// An interior namespace node
#[derive(Debug, Clone)]
pub struct GroupNode {
    pub(crate) path: String,
    pub(crate) children: BTreeMap<String, NodeId>,
    pub(crate) removable: bool,
    pub(crate) parent: Option<NodeId>,
}

impl GroupNode {
    pub(crate) fn new(path: String, parent: Option<NodeId>, removable: bool) -> Self {
        Self {
            path,
            children: BTreeMap::new(),
            removable,
            parent,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        last_segment(&self.path)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether pruning may delete this group once it is empty
    pub fn removable(&self) -> bool {
        self.removable
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
}

/// A tree node
#[derive(Debug, Clone)]
pub enum Node {
    Group(GroupNode),
    Setting(SettingNode),
}

impl Node {
    pub fn path(&self) -> &str {
        match self {
            Self::Group(g) => g.path(),
            Self::Setting(s) => s.path(),
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        match self {
            Self::Group(g) => g.parent,
            Self::Setting(s) => Some(s.group),
        }
    }

    pub fn as_group(&self) -> Option<&GroupNode> {
        match self {
            Self::Group(g) => Some(g),
            Self::Setting(_) => None,
        }
    }

    pub fn as_setting(&self) -> Option<&SettingNode> {
        match self {
            Self::Setting(s) => Some(s),
            Self::Group(_) => None,
        }
    }
}

pub(crate) fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
