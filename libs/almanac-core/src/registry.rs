//! The settings registry
//!
//! Owns the tree and its persistence engine. Opening a registry runs the
//! boot sequence: load (with recovery), migrate, build the tree, apply the
//! default overlays. Every mutation afterwards marks the tree dirty and arms
//! the debounced save.

use crate::defaults;
use crate::error::{AddError, PersistError, RegistryError, Result, SetError};
use crate::event::ChangeEvent;
use crate::ipc::{AddOutcome, DaemonStatus, SettingRequest};
use crate::migration::{MigrationPipeline, MigrationReport, SCHEMA_VERSION};
use crate::node::SettingNode;
use crate::persist::PersistenceEngine;
use crate::tree::{resolve_relative, AddOptions, SettingDefinition, Tree};
use crate::value::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Where and how the registry persists
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub data_dir: PathBuf,
    pub file_name: String,
    /// Debounce window; zero saves synchronously after every mutation
    pub save_delay: Duration,
    pub defaults_dirs: Vec<PathBuf>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data/conf"),
            file_name: "settings.xml".to_string(),
            save_delay: Duration::from_secs(2),
            defaults_dirs: vec![PathBuf::from("/etc/almanac/settings.d")],
        }
    }
}

impl RegistryOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            defaults_dirs: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = delay;
        self
    }

    pub fn with_defaults_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.defaults_dirs.push(dir.into());
        self
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }
}

/// Persistent settings registry
#[derive(Debug)]
pub struct Registry {
    tree: Tree,
    engine: PersistenceEngine,
    migration: MigrationReport,
    events: Vec<ChangeEvent>,
}

impl Registry {
    /// Open with the standard migration pipeline
    pub fn open(options: RegistryOptions) -> Result<Self> {
        Self::open_with(options, &MigrationPipeline::standard())
    }

    pub fn open_with(options: RegistryOptions, pipeline: &MigrationPipeline) -> Result<Self> {
        if !options.data_dir.is_dir() {
            return Err(RegistryError::MissingDataDir(options.data_dir));
        }

        let engine = PersistenceEngine::new(options.settings_file(), options.save_delay);
        let mut document = engine.load()?;

        let migration = pipeline.migrate(&mut document);
        if migration.version_changed {
            // Not debounced; must survive an exit right after boot
            engine.write_document(&document)?;
        }

        let mut tree = document.build_tree();
        for dir in &options.defaults_dirs {
            defaults::load_dir(&mut tree, dir);
        }
        tree.take_events();

        info!(
            "Loaded {} settings from {}",
            tree.setting_count(),
            engine.path().display()
        );

        let mut registry = Self {
            tree,
            engine,
            migration,
            events: Vec::new(),
        };
        registry.after_mutation();
        Ok(registry)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn get(&self, path: &str) -> Option<&SettingNode> {
        self.tree.get(path)
    }

    pub fn data_file(&self) -> &Path {
        self.engine.path()
    }

    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            schema_version: SCHEMA_VERSION,
            setting_count: self.tree.setting_count(),
            data_file: self.engine.path().display().to_string(),
            save_pending: self.engine.scheduler().is_armed(),
        }
    }

    // ========== Mutation ==========

    /// Create or redefine a setting; returns its current value
    pub fn add_setting(
        &mut self,
        path: &str,
        definition: &SettingDefinition,
        options: &AddOptions,
    ) -> std::result::Result<Value, AddError> {
        let result = self.tree.add_setting(path, definition, options);
        self.after_mutation();
        let id = result?;
        self.tree
            .setting(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| AddError::InvalidPath(path.to_string()))
    }

    /// Batch add relative to `group`; one outcome per item, in order
    pub fn add_settings(&mut self, group: &str, items: &[serde_json::Value]) -> Vec<AddOutcome> {
        items
            .iter()
            .map(|item| {
                let request = match SettingRequest::from_json(item) {
                    Ok(request) => request,
                    Err(e) => return AddOutcome::failed(item_path(item), &e),
                };
                let path = resolve_relative(group, &request.path);
                let result = request
                    .definition()
                    .and_then(|def| self.add_setting(&path, &def, &request.options()));
                match result {
                    Ok(value) => AddOutcome::added(path, value),
                    Err(e) => AddOutcome::failed(path, &e),
                }
            })
            .collect()
    }

    pub fn set_value(&mut self, path: &str, value: &Value) -> std::result::Result<Value, SetError> {
        let result = self.tree.set_value(path, value);
        self.after_mutation();
        result
    }

    pub fn set_default(&mut self, path: &str) -> std::result::Result<Value, SetError> {
        let result = self.tree.set_default(path);
        self.after_mutation();
        result
    }

    /// Reset every setting under a group
    pub fn set_default_all(&mut self, prefix: &str) -> usize {
        let count = self.tree.set_default_all(prefix);
        self.after_mutation();
        count
    }

    pub fn remove_setting(&mut self, path: &str) -> bool {
        let removed = self.tree.remove_setting(path);
        self.after_mutation();
        removed
    }

    fn after_mutation(&mut self) {
        if !self.tree.take_dirty() {
            return;
        }
        if self.engine.scheduler().is_immediate() {
            if let Err(e) = self.save_now() {
                error!("Failed to save settings: {}", e);
            }
        } else {
            self.engine.scheduler_mut().schedule(Instant::now());
        }
    }

    // ========== Persistence ==========

    /// Deadline of the pending debounced save
    pub fn next_save_deadline(&self) -> Option<Instant> {
        self.engine.scheduler().deadline()
    }

    /// Run the debounced save if it is due. Returns whether it ran.
    pub fn poll(&mut self, now: Instant) -> std::result::Result<bool, PersistError> {
        if !self.engine.scheduler_mut().fire_if_due(now) {
            return Ok(false);
        }
        self.save_now()?;
        Ok(true)
    }

    /// Run a pending save now. Returns whether one was pending.
    pub fn flush(&mut self) -> std::result::Result<bool, PersistError> {
        if !self.engine.scheduler().is_armed() {
            return Ok(false);
        }
        self.save_now()?;
        Ok(true)
    }

    /// Write the tree unconditionally
    pub fn save_now(&mut self) -> std::result::Result<(), PersistError> {
        self.engine.save(&self.tree)?;
        self.events.extend(self.tree.take_events());
        let paths = self.tree.take_added();
        if !paths.is_empty() {
            self.events.push(ChangeEvent::PathsAdded { paths });
        }
        Ok(())
    }

    /// Drain pending notifications
    pub fn take_events(&mut self) -> Vec<ChangeEvent> {
        self.events.extend(self.tree.take_events());
        std::mem::take(&mut self.events)
    }
}

fn item_path(item: &serde_json::Value) -> String {
    item.get("path")
        .and_then(|p| p.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn open(dir: &Path) -> Registry {
        Registry::open(RegistryOptions::new(dir).with_save_delay(Duration::ZERO)).unwrap()
    }

    fn on_disk(dir: &Path) -> Document {
        Document::parse(&fs::read_to_string(dir.join("settings.xml")).unwrap()).unwrap()
    }

    #[test]
    fn test_missing_data_dir() {
        let dir = tempdir().unwrap();
        let result = Registry::open(RegistryOptions::new(dir.path().join("absent")));
        assert!(matches!(result, Err(RegistryError::MissingDataDir(_))));
    }

    #[test]
    fn test_fresh_boot_writes_current_version() {
        let dir = tempdir().unwrap();
        let registry = open(dir.path());
        assert_eq!(registry.tree().setting_count(), 0);
        assert_eq!(on_disk(dir.path()).version(), SCHEMA_VERSION);
    }

    #[test]
    fn test_old_document_is_migrated_and_persisted() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("settings.xml"),
            r#"<Settings version="1.0"><System><RemoteSupport type="i">1</RemoteSupport></System></Settings>"#,
        )
        .unwrap();

        let registry = Registry::open(
            RegistryOptions::new(dir.path()).with_save_delay(Duration::from_secs(60)),
        )
        .unwrap();
        assert!(registry.migration_report().version_changed);
        assert_eq!(
            registry.get("/Settings/System/SSHLocal").unwrap().value(),
            &Value::Integer(1)
        );

        // Written synchronously despite the debounce window
        let document = on_disk(dir.path());
        assert_eq!(document.version_text(), Some("9"));
        assert_eq!(document.root.find_text("System/SSHLocal"), Some("1"));
    }

    #[test]
    fn test_mutations_persist_without_delay() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        registry
            .add_setting(
                "/Settings/Gui/Brightness",
                &SettingDefinition::new(80, "i").with_bounds(0, 100),
                &AddOptions::default(),
            )
            .unwrap();
        registry
            .set_value("/Settings/Gui/Brightness", &Value::Integer(42))
            .unwrap();

        assert_eq!(
            on_disk(dir.path()).root.find_text("Gui/Brightness"),
            Some("42")
        );

        let events = registry.take_events();
        assert!(matches!(events.last(), Some(ChangeEvent::ValueChanged { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ChangeEvent::PathsAdded { paths } if paths == &["/Settings/Gui/Brightness".to_string()])));

        drop(registry);
        let reopened = open(dir.path());
        assert_eq!(
            reopened.get("/Settings/Gui/Brightness").unwrap().value(),
            &Value::Integer(42)
        );
    }

    #[test]
    fn test_debounced_save() {
        let dir = tempdir().unwrap();
        let mut registry = Registry::open(
            RegistryOptions::new(dir.path()).with_save_delay(Duration::from_secs(2)),
        )
        .unwrap();

        registry
            .add_setting(
                "/Settings/System/Units",
                &SettingDefinition::new(0, "i"),
                &AddOptions::default(),
            )
            .unwrap();
        let deadline = registry.next_save_deadline().unwrap();
        assert!(on_disk(dir.path()).root.find("System").is_none());

        assert!(!registry.poll(deadline - Duration::from_millis(1)).unwrap());
        assert!(registry.poll(deadline).unwrap());
        assert!(registry.next_save_deadline().is_none());
        assert_eq!(on_disk(dir.path()).root.find_text("System/Units"), Some("0"));
        assert!(!registry.poll(deadline + Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_failed_set_does_not_schedule_save() {
        let dir = tempdir().unwrap();
        let mut registry = Registry::open(
            RegistryOptions::new(dir.path()).with_save_delay(Duration::from_secs(2)),
        )
        .unwrap();
        assert!(registry
            .set_value("/Settings/Missing", &Value::Integer(1))
            .is_err());
        assert!(registry.next_save_deadline().is_none());
        assert!(!registry.flush().unwrap());
    }

    #[test]
    fn test_flush_runs_pending_save() {
        let dir = tempdir().unwrap();
        let mut registry = Registry::open(
            RegistryOptions::new(dir.path()).with_save_delay(Duration::from_secs(60)),
        )
        .unwrap();
        registry
            .add_setting(
                "/Settings/System/Units",
                &SettingDefinition::new(0, "i"),
                &AddOptions::default(),
            )
            .unwrap();
        assert!(registry.flush().unwrap());
        assert!(!registry.status().save_pending);
        assert_eq!(on_disk(dir.path()).root.find_text("System/Units"), Some("0"));
    }

    #[test]
    fn test_defaults_overlay_applied_at_boot() {
        let dir = tempdir().unwrap();
        let overlay = tempdir().unwrap();
        fs::write(overlay.path().join("gui"), "Gui/Brightness 80 i 0 100\n").unwrap();

        let options = RegistryOptions::new(dir.path())
            .with_save_delay(Duration::ZERO)
            .with_defaults_dir(overlay.path());
        let registry = Registry::open(options).unwrap();
        assert_eq!(
            registry.get("/Settings/Gui/Brightness").unwrap().value(),
            &Value::Integer(80)
        );
        assert_eq!(on_disk(dir.path()).root.find_text("Gui/Brightness"), Some("80"));
    }

    #[test]
    fn test_batch_add() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        let items = vec![
            json!({"path": "Gui/Brightness", "default": 80, "min": 0, "max": 100}),
            json!({"path": "Gui/Ratio", "default": 0.5}),
            json!({"path": "Gui/Name", "default": "panel", "type": "s"}),
            json!({"path": "Gui/_Hidden", "default": 1}),
            json!({"path": "Gui/Flag", "default": [1, 2]}),
            json!({"default": 1}),
        ];
        let outcomes = registry.add_settings("/Settings", &items);

        assert_eq!(outcomes.len(), 6);
        assert_eq!(outcomes[0].error, 0);
        assert_eq!(outcomes[0].value, Some(Value::Integer(80)));
        assert_eq!(outcomes[1].value, Some(Value::Float(0.5)));
        assert_eq!(outcomes[2].path, "/Settings/Gui/Name");
        assert_eq!(outcomes[3].error, -2);
        assert_eq!(outcomes[4].error, -1);
        assert_eq!(outcomes[5].error, -1);
        assert_eq!(
            registry.get("/Settings/Gui/Ratio").unwrap().value_type(),
            crate::value::ValueType::Float
        );
    }

    #[test]
    fn test_remove_persists() {
        let dir = tempdir().unwrap();
        let mut registry = open(dir.path());
        registry
            .add_setting(
                "/Settings/A/B",
                &SettingDefinition::new(1, "i"),
                &AddOptions::default(),
            )
            .unwrap();
        assert!(registry.remove_setting("/Settings/A/B"));
        assert!(registry.get("/Settings/A/B").is_none());
        assert!(on_disk(dir.path()).root.find("A").is_none());
    }
}
