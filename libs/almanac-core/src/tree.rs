//! The settings tree
//!
//! Nodes live in an arena owned by [`Tree`]. Groups own their children
//! through a name map; every node keeps a non-owning [`NodeId`] back to its
//! parent, used only to prune groups that become empty.
//!
//! ```text
//! /                      (root, protected)
//! └── Settings           (protected)
//!     ├── System
//!     │   └── Units      i  default=0 min=0 max=2
//!     └── Devices
//!         └── battery_1
//!             └── ClassAndVrmInstance  s  "battery:1"
//! ```

use crate::allocator::InstanceAllocator;
use crate::error::{AddError, SetError};
use crate::event::{AttributeChange, ChangeEvent};
use crate::node::{GroupNode, Node, NodeId, SettingAttributes, SettingNode};
use crate::value::{Value, ValueType};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Path of the tree root
pub const ROOT_PATH: &str = "/";

/// Path of the persisted subtree
pub const SETTINGS_PATH: &str = "/Settings";

/// Split a slash-separated path into its non-empty segments
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Canonical absolute form of a segment list
pub fn join_path(segments: &[&str]) -> String {
    format!("/{}", segments.join("/"))
}

/// Resolve `relative` against the group at `base`
pub fn resolve_relative(base: &str, relative: &str) -> String {
    let mut segments = split_path(base);
    segments.extend(split_path(relative));
    join_path(&segments)
}

/// Path segments double as XML tag names in the settings file
fn is_valid_segment(segment: &str) -> bool {
    segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == ROOT_PATH {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Requested definition of a setting, before conversion
#[derive(Debug, Clone, PartialEq)]
pub struct SettingDefinition {
    pub default: Value,
    pub type_code: String,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub silent: bool,
}

impl SettingDefinition {
    pub fn new(default: impl Into<Value>, type_code: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            type_code: type_code.into(),
            min: None,
            max: None,
            silent: false,
        }
    }

    pub fn with_bounds(mut self, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.min = Some(min.into());
        self.max = Some(max.into());
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Convert the raw definition into typed attributes and a default value.
    ///
    /// A `(0, 0)` bounds pair means unbounded, for floats as well as integers.
    fn resolve(&self, path: &str) -> Result<(SettingAttributes, Value), AddError> {
        let value_type = ValueType::from_code(&self.type_code)
            .ok_or_else(|| AddError::UnknownType(self.type_code.clone()))?;

        let default = self
            .default
            .convert(value_type)
            .ok_or_else(|| AddError::InvalidDefault(self.default.to_string()))?;

        let (min, max) = if value_type.is_numeric() {
            let convert = |bound: &Option<Value>| {
                bound
                    .as_ref()
                    .map(|b| {
                        b.convert(value_type)
                            .ok_or_else(|| AddError::InvalidBounds(path.to_string()))
                    })
                    .transpose()
            };
            match (convert(&self.min)?, convert(&self.max)?) {
                (Some(min), Some(max)) if min.is_zero() && max.is_zero() => (None, None),
                bounds => bounds,
            }
        } else {
            (None, None)
        };

        let attributes = SettingAttributes {
            value_type,
            default: Some(default.clone()),
            min,
            max,
            silent: self.silent,
        };

        if attributes.check_bounds(&default).is_err() {
            return Err(AddError::DefaultOutOfRange(default));
        }

        Ok((attributes, default))
    }
}

/// Policy knobs for `add_setting`
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Legacy setting paths whose value is adopted by a newly created setting
    pub replaces: Vec<String>,
    /// On redefinition, overwrite the current value with the default
    pub force_value: bool,
}

/// Hierarchical settings namespace
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    root: NodeId,
    settings: NodeId,
    allocator: InstanceAllocator,
    events: Vec<ChangeEvent>,
    added: Vec<String>,
    dirty: bool,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Empty tree holding only the protected `/` and `/Settings` groups
    pub fn new() -> Self {
        Self::with_allocator(InstanceAllocator::default())
    }

    pub fn with_allocator(allocator: InstanceAllocator) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NodeId(0),
            settings: NodeId(0),
            allocator,
            events: Vec::new(),
            added: Vec::new(),
            dirty: false,
        };
        tree.root = tree.insert(Node::Group(GroupNode::new(ROOT_PATH.to_string(), None, false)));
        tree.settings = tree.insert(Node::Group(GroupNode::new(
            SETTINGS_PATH.to_string(),
            Some(tree.root),
            false,
        )));
        let (root, settings) = (tree.root, tree.settings);
        if let Some(root) = tree.group_mut(root) {
            root.children.insert("Settings".to_string(), settings);
        }
        tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn settings_root(&self) -> NodeId {
        self.settings
    }

    pub fn allocator(&self) -> &InstanceAllocator {
        &self.allocator
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn group(&self, id: NodeId) -> Option<&GroupNode> {
        self.node(id).and_then(Node::as_group)
    }

    fn group_mut(&mut self, id: NodeId) -> Option<&mut GroupNode> {
        match self.node_mut(id)? {
            Node::Group(g) => Some(g),
            Node::Setting(_) => None,
        }
    }

    pub fn setting(&self, id: NodeId) -> Option<&SettingNode> {
        self.node(id).and_then(Node::as_setting)
    }

    fn setting_mut(&mut self, id: NodeId) -> Option<&mut SettingNode> {
        match self.node_mut(id)? {
            Node::Setting(s) => Some(s),
            Node::Group(_) => None,
        }
    }

    fn insert(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get_mut(id.0)?.take();
        if node.is_some() {
            self.free.push(id.0);
        }
        node
    }

    // ========== Lookup ==========

    /// Pure lookup of the node at `path`
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for segment in split_path(path) {
            current = self.group(current)?.child(segment)?;
        }
        Some(current)
    }

    /// Setting at `path`, if `path` names a setting
    pub fn get(&self, path: &str) -> Option<&SettingNode> {
        self.resolve(path).and_then(|id| self.setting(id))
    }

    /// Group at `path`, if `path` names a group
    pub fn get_group(&self, path: &str) -> Option<&GroupNode> {
        self.resolve(path).and_then(|id| self.group(id))
    }

    /// Every setting beneath a node, depth first in name order
    pub fn settings_under(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            match self.node(current) {
                Some(Node::Setting(_)) => result.push(current),
                Some(Node::Group(g)) => stack.extend(g.children.values().rev().copied()),
                None => {}
            }
        }
        result
    }

    /// Number of settings in the tree
    pub fn setting_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Some(Node::Setting(_))))
            .count()
    }

    /// Apply `f` to every setting under the group at `prefix`, keyed by the
    /// setting path relative to that group. `None` results are skipped.
    pub fn for_all_settings<T>(
        &self,
        prefix: &str,
        mut f: impl FnMut(&SettingNode) -> Option<T>,
    ) -> BTreeMap<String, T> {
        let mut result = BTreeMap::new();
        let Some(group) = self.get_group(prefix) else {
            return result;
        };
        let strip = if group.path == ROOT_PATH {
            1
        } else {
            group.path.len() + 1
        };
        let Some(id) = self.resolve(prefix) else {
            return result;
        };
        for sid in self.settings_under(id) {
            if let Some(setting) = self.setting(sid) {
                if let Some(value) = f(setting) {
                    result.insert(setting.path[strip..].to_string(), value);
                }
            }
        }
        result
    }

    // ========== Structure ==========

    /// Create every missing group along `path` and return the deepest one.
    ///
    /// Returns `None` if a segment already names a setting.
    pub fn create_path(&mut self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for segment in split_path(path) {
            let group = self.group(current)?;
            current = match group.child(segment) {
                Some(id) => {
                    self.group(id)?;
                    id
                }
                None => {
                    let path = child_path(&group.path, segment);
                    let id = self.insert(Node::Group(GroupNode::new(path, Some(current), true)));
                    self.group_mut(current)?.children.insert(segment.to_string(), id);
                    id
                }
            };
        }
        Some(current)
    }

    /// Whether `create_path` would succeed for these segments, i.e. no
    /// existing setting sits anywhere along them
    fn can_hold_groups(&self, segments: &[&str]) -> bool {
        let mut current = self.root;
        for segment in segments {
            let Some(group) = self.group(current) else {
                return false;
            };
            match group.child(segment) {
                Some(id) => current = id,
                None => return true,
            }
        }
        self.group(current).is_some()
    }

    /// Remove the group at `id` and its now-empty removable ancestors
    fn prune(&mut self, mut id: NodeId) {
        loop {
            let Some(group) = self.group(id) else { return };
            if !group.is_empty() || !group.removable {
                return;
            }
            let Some(parent) = group.parent else { return };
            let name = group.name().to_string();
            debug!("Pruning empty group {}", group.path);
            if let Some(parent_group) = self.group_mut(parent) {
                parent_group.children.remove(&name);
            }
            self.release(id);
            id = parent;
        }
    }

    /// Attach a setting read from the settings document. No notification.
    pub(crate) fn attach_loaded(
        &mut self,
        group: NodeId,
        name: &str,
        value: Value,
        attributes: SettingAttributes,
    ) -> Option<NodeId> {
        let parent = self.group(group)?;
        if parent.child(name).is_some() {
            warn!("Duplicate entry {} in {}, ignored", name, parent.path);
            return None;
        }
        let path = child_path(&parent.path, name);
        let id = self.insert(Node::Setting(SettingNode {
            path,
            value,
            attributes,
            group,
        }));
        self.group_mut(group)?.children.insert(name.to_string(), id);
        Some(id)
    }

    /// Group child of `group` named `name`, created when missing.
    pub(crate) fn child_group(&mut self, group: NodeId, name: &str) -> Option<NodeId> {
        let path = child_path(&self.group(group)?.path, name);
        self.create_path(&path)
    }

    // ========== Mutation ==========

    /// Create or redefine the setting at the absolute `path`.
    pub fn add_setting(
        &mut self,
        path: &str,
        definition: &SettingDefinition,
        options: &AddOptions,
    ) -> Result<NodeId, AddError> {
        let segments = split_path(path);
        if segments.iter().any(|s| s.starts_with('_')) {
            return Err(AddError::UnderscorePrefix(path.to_string()));
        }
        if !segments.iter().all(|s| is_valid_segment(s)) {
            return Err(AddError::InvalidPath(path.to_string()));
        }
        let path = join_path(&segments);

        let (attributes, default) = definition.resolve(&path)?;

        if segments.len() < 2 || segments[0] != "Settings" {
            return Err(AddError::InvalidPath(path));
        }

        match self.resolve(&path) {
            Some(id) if self.group(id).is_some() => Err(AddError::IsGroup(path)),
            Some(id) => self.redefine(id, attributes, default, options),
            None => self.create(&path, attributes, default, options),
        }
    }

    fn create(
        &mut self,
        path: &str,
        attributes: SettingAttributes,
        default: Value,
        options: &AddOptions,
    ) -> Result<NodeId, AddError> {
        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return Err(AddError::InvalidPath(path.to_string()));
        };
        // Legacy settings are only consumed once the add is known to succeed
        if !self.can_hold_groups(parents) {
            return Err(AddError::InvalidPath(path.to_string()));
        }

        let mut value = default;

        for legacy in &options.replaces {
            let legacy = join_path(&split_path(legacy));
            let Some(old) = self.get(&legacy) else { continue };
            let old_value = old.value.clone();
            if old_value.value_type() == attributes.value_type
                && attributes.check_bounds(&old_value).is_ok()
            {
                info!("Setting {} takes over value {} from {}", path, old_value, legacy);
                value = old_value;
            }
            self.remove_setting(&legacy);
        }

        if self.allocator.governs(path) {
            match self.allocator.allocate(self, None, &value) {
                Ok(allocated) => value = allocated,
                Err(e) => warn!("{}: {}", path, e),
            }
        }

        let group = self
            .create_path(&join_path(parents))
            .ok_or_else(|| AddError::InvalidPath(path.to_string()))?;

        info!(
            "Added new setting {}. default:{}, type:{}, min:{}, max:{}, silent:{}",
            path,
            display_opt(&attributes.default),
            attributes.value_type,
            display_opt(&attributes.min),
            display_opt(&attributes.max),
            attributes.silent
        );

        let id = self.insert(Node::Setting(SettingNode {
            path: path.to_string(),
            value,
            attributes,
            group,
        }));
        if let Some(g) = self.group_mut(group) {
            g.children.insert(name.to_string(), id);
        }
        self.added.push(path.to_string());
        self.emit_value(id, true);
        Ok(id)
    }

    /// Update the attributes of an existing setting.
    ///
    /// The current value survives a redefinition unless `force_value` asks
    /// for the new default. The one exception is a current value outside the
    /// new bounds: it is replaced by the new default, trading the
    /// keep-the-value rule for the bounds invariant on stored values.
    fn redefine(
        &mut self,
        id: NodeId,
        attributes: SettingAttributes,
        default: Value,
        options: &AddOptions,
    ) -> Result<NodeId, AddError> {
        let Some(setting) = self.setting(id) else {
            return Err(AddError::InvalidPath(String::new()));
        };

        if setting.attributes.value_type != attributes.value_type {
            return Err(AddError::TypeDiffer {
                stored: setting.attributes.value_type,
                requested: attributes.value_type,
            });
        }

        let changed = setting.attributes != attributes;
        let mut value = setting.value.clone();
        if options.force_value {
            value = default;
        } else if attributes.check_bounds(&value).is_err() {
            warn!(
                "Value {} of {} violates the new bounds, reset to default {}",
                value, setting.path, default
            );
            value = default;
        }

        if value != setting.value && self.allocator.governs(&setting.path) {
            if let Ok(allocated) = self.allocator.allocate(self, Some(id), &value) {
                value = allocated;
            }
        }

        let value_changed = value != setting.value;
        if !changed && !value_changed {
            return Ok(id);
        }

        if let Some(setting) = self.setting_mut(id) {
            info!("Updated setting {}", setting.path);
            setting.attributes = attributes;
            setting.value = value;
        }
        self.emit_value(id, changed);
        Ok(id)
    }

    /// Write a new value; returns the value actually stored, which may
    /// differ from the request when the instance allocator remaps it.
    pub fn set_value(&mut self, path: &str, raw: &Value) -> Result<Value, SetError> {
        let id = self.setting_id(path)?;
        let Some(setting) = self.setting(id) else {
            return Err(SetError::NotFound(path.to_string()));
        };

        let value_type = setting.attributes.value_type;
        let mut value = raw.convert(value_type).ok_or_else(|| SetError::Conversion {
            value: raw.to_string(),
            value_type,
        })?;
        setting.attributes.check_bounds(&value)?;

        if self.allocator.governs(&setting.path) {
            value = self.allocator.allocate(self, Some(id), &value)?;
        }

        let Some(setting) = self.setting_mut(id) else {
            return Err(SetError::NotFound(path.to_string()));
        };
        if value == setting.value {
            return Ok(value);
        }

        let old = std::mem::replace(&mut setting.value, value.clone());
        if !setting.attributes.silent {
            info!("Setting {} changed. Old: {}, New: {}", setting.path, old, value);
        }
        self.emit_value(id, false);
        Ok(value)
    }

    /// Reset a setting to its default value
    pub fn set_default(&mut self, path: &str) -> Result<Value, SetError> {
        let id = self.setting_id(path)?;
        let Some(setting) = self.setting(id) else {
            return Err(SetError::NotFound(path.to_string()));
        };
        if self.allocator.governs(&setting.path) {
            return Err(SetError::DefaultForbidden(setting.path.clone()));
        }
        let default = setting
            .attributes
            .default
            .clone()
            .ok_or_else(|| SetError::NoDefault(path.to_string()))?;
        self.set_value(path, &default)
    }

    /// Reset every setting under the group at `prefix`. Individual failures
    /// are skipped; returns how many settings accepted their default.
    pub fn set_default_all(&mut self, prefix: &str) -> usize {
        let Some(id) = self.resolve(prefix) else {
            return 0;
        };
        let paths: Vec<String> = self
            .settings_under(id)
            .into_iter()
            .filter_map(|sid| self.setting(sid).map(|s| s.path.clone()))
            .collect();

        paths
            .iter()
            .filter(|path| match self.set_default(path) {
                Ok(_) => true,
                Err(e) => {
                    debug!("SetDefault skipped: {}", e);
                    false
                }
            })
            .count()
    }

    /// Delete the setting at `path` and prune emptied groups.
    /// Returns false if no setting existed there.
    pub fn remove_setting(&mut self, path: &str) -> bool {
        let Some(id) = self.resolve(path) else {
            return false;
        };
        let Some(setting) = self.setting(id) else {
            return false;
        };
        let group = setting.group;
        let name = setting.name().to_string();
        let path = setting.path.clone();

        if let Some(g) = self.group_mut(group) {
            g.children.remove(&name);
        }
        self.release(id);
        info!("Removed setting {}", path);

        self.events.push(ChangeEvent::Removed { path });
        self.dirty = true;
        self.prune(group);
        true
    }

    fn setting_id(&self, path: &str) -> Result<NodeId, SetError> {
        let id = self
            .resolve(path)
            .ok_or_else(|| SetError::NotFound(path.to_string()))?;
        match self.node(id) {
            Some(Node::Setting(_)) => Ok(id),
            Some(Node::Group(_)) => Err(SetError::IsGroup(path.to_string())),
            None => Err(SetError::NotFound(path.to_string())),
        }
    }

    fn emit_value(&mut self, id: NodeId, with_attributes: bool) {
        let Some(setting) = self.setting(id) else { return };
        let event = ChangeEvent::ValueChanged {
            path: setting.path.clone(),
            value: setting.value.clone(),
            text: setting.text(),
            attributes: with_attributes.then(|| AttributeChange::from(&setting.attributes)),
        };
        self.events.push(event);
        self.dirty = true;
    }

    // ========== Bookkeeping ==========

    /// Drain pending change notifications
    pub fn take_events(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether anything changed since the last call
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Paths created since the last call
    pub fn take_added(&mut self) -> Vec<String> {
        std::mem::take(&mut self.added)
    }
}

fn display_opt(value: &Option<Value>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "None".to_string())
}
