//! Unique `class:instance` identities for devices
//!
//! Settings named `ClassAndVrmInstance` beneath the devices subtree hold an
//! identity of the form `<class>:<instance>`. Instances must be unique per
//! class; a colliding request is moved to the first free instance at or
//! above the one requested.

use crate::error::SetError;
use crate::node::NodeId;
use crate::tree::{split_path, Tree};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Parsed identity value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassInstance {
    pub class: String,
    pub instance: u64,
}

impl FromStr for ClassInstance {
    type Err = SetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SetError::InvalidInstance(s.to_string());
        let (class, instance) = s.split_once(':').ok_or_else(invalid)?;
        let instance = instance.trim().parse().map_err(|_| invalid())?;
        Ok(Self {
            class: class.trim().to_string(),
            instance,
        })
    }
}

impl fmt::Display for ClassInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.instance)
    }
}

/// Uniqueness policy for identity settings
#[derive(Debug, Clone)]
pub struct InstanceAllocator {
    root: String,
    setting_name: String,
}

impl Default for InstanceAllocator {
    fn default() -> Self {
        Self {
            root: "/Settings/Devices".to_string(),
            setting_name: "ClassAndVrmInstance".to_string(),
        }
    }
}

impl InstanceAllocator {
    pub fn new(root: impl Into<String>, setting_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            setting_name: setting_name.into(),
        }
    }

    /// Whether the setting at `path` is an identity setting
    pub fn governs(&self, path: &str) -> bool {
        let segments = split_path(path);
        let root = split_path(&self.root);
        segments.len() > root.len()
            && segments.starts_with(&root)
            && segments.last() == Some(&self.setting_name.as_str())
    }

    /// Instances taken per class, ignoring the setting `exclude`
    pub fn taken(&self, tree: &Tree, exclude: Option<NodeId>) -> BTreeMap<String, BTreeSet<u64>> {
        let mut taken: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
        let Some(root) = tree.resolve(&self.root) else {
            return taken;
        };
        for id in tree.settings_under(root) {
            if Some(id) == exclude {
                continue;
            }
            let Some(setting) = tree.setting(id) else { continue };
            if !self.governs(setting.path()) {
                continue;
            }
            if let Ok(ci) = setting.text().parse::<ClassInstance>() {
                taken.entry(ci.class).or_default().insert(ci.instance);
            }
        }
        taken
    }

    /// Value to store for a write of `requested` to the identity setting
    /// `exclude` (or to a setting about to be created when `None`).
    pub fn allocate(
        &self,
        tree: &Tree,
        exclude: Option<NodeId>,
        requested: &Value,
    ) -> Result<Value, SetError> {
        let mut wanted: ClassInstance = requested.to_string().parse()?;
        let taken = self.taken(tree, exclude);

        if let Some(instances) = taken.get(&wanted.class) {
            let first = wanted.instance;
            while instances.contains(&wanted.instance) {
                wanted.instance += 1;
            }
            if wanted.instance != first {
                info!(
                    "Instance {}:{} is taken, using {}",
                    wanted.class, first, wanted
                );
            }
        }

        Ok(Value::String(wanted.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{AddOptions, SettingDefinition};

    fn add_device(tree: &mut Tree, device: &str, identity: &str) -> Value {
        let path = format!("/Settings/Devices/{}/ClassAndVrmInstance", device);
        tree.add_setting(&path, &SettingDefinition::new(identity, "s"), &AddOptions::default())
            .unwrap();
        tree.get(&path).unwrap().value().clone()
    }

    #[test]
    fn test_parse_normalizes() {
        let ci: ClassInstance = "battery:00002".parse().unwrap();
        assert_eq!(ci.class, "battery");
        assert_eq!(ci.instance, 2);
        assert_eq!(ci.to_string(), "battery:2");

        assert!("battery".parse::<ClassInstance>().is_err());
        assert!("battery:x".parse::<ClassInstance>().is_err());
        assert!("battery:-1".parse::<ClassInstance>().is_err());
    }

    #[test]
    fn test_governs() {
        let allocator = InstanceAllocator::default();
        assert!(allocator.governs("/Settings/Devices/bat0/ClassAndVrmInstance"));
        assert!(!allocator.governs("/Settings/Devices/bat0/CustomName"));
        assert!(!allocator.governs("/Settings/Other/bat0/ClassAndVrmInstance"));
        assert!(!allocator.governs("/Settings/Devices"));
    }

    #[test]
    fn test_collision_moves_upward() {
        let mut tree = Tree::new();
        assert_eq!(add_device(&mut tree, "a", "battery:1"), Value::from("battery:1"));
        assert_eq!(add_device(&mut tree, "b", "battery:1"), Value::from("battery:2"));
        assert_eq!(add_device(&mut tree, "c", "battery:00002"), Value::from("battery:3"));
        // Different class does not collide
        assert_eq!(add_device(&mut tree, "d", "pvinverter:1"), Value::from("pvinverter:1"));
    }

    #[test]
    fn test_freed_lower_slot_not_preferred() {
        let mut tree = Tree::new();
        add_device(&mut tree, "a", "battery:1");
        add_device(&mut tree, "b", "battery:2");
        add_device(&mut tree, "c", "battery:3");
        tree.remove_setting("/Settings/Devices/a/ClassAndVrmInstance");

        let stored = tree
            .set_value("/Settings/Devices/c/ClassAndVrmInstance", &Value::from("battery:2"))
            .unwrap();
        assert_eq!(stored, Value::from("battery:3"));
    }

    #[test]
    fn test_rewrite_own_value_is_noop() {
        let mut tree = Tree::new();
        add_device(&mut tree, "a", "battery:1");
        tree.take_events();
        let stored = tree
            .set_value("/Settings/Devices/a/ClassAndVrmInstance", &Value::from("battery:1"))
            .unwrap();
        assert_eq!(stored, Value::from("battery:1"));
        assert!(tree.take_events().is_empty());
    }

    #[test]
    fn test_unparsable_write_rejected() {
        let mut tree = Tree::new();
        add_device(&mut tree, "a", "battery:1");
        let result =
            tree.set_value("/Settings/Devices/a/ClassAndVrmInstance", &Value::from("garbage"));
        assert!(matches!(result, Err(SetError::InvalidInstance(_))));
        assert_eq!(
            tree.get("/Settings/Devices/a/ClassAndVrmInstance").unwrap().value(),
            &Value::from("battery:1")
        );
    }
}
