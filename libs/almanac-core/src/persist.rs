//! Crash-safe persistence of the settings document
//!
//! Saves go through `<file>.new`: the temporary file is written, flushed and
//! synced, renamed over the settings file, and finally the directory is
//! synced so the rename itself is durable. A leftover temporary file found
//! at startup is promoted if it parses and deleted otherwise.

use crate::document::Document;
use crate::error::PersistError;
use crate::migration::SCHEMA_VERSION;
use crate::tree::Tree;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Extension appended to the settings file name for in-flight writes
pub const TEMP_EXTENSION: &str = "new";

/// Single debounce timer for deferred saves.
///
/// Scheduling while armed postpones the deadline; firing disarms it.
#[derive(Debug, Clone)]
pub struct SaveScheduler {
    delay: Duration,
    deadline: Option<Instant>,
}

impl SaveScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Zero-delay schedulers save synchronously
    pub fn is_immediate(&self) -> bool {
        self.delay.is_zero()
    }

    /// Arm or re-arm the timer relative to `now`
    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// True exactly once when the armed deadline has passed
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }
}

/// Owner of the settings file
#[derive(Debug)]
pub struct PersistenceEngine {
    path: PathBuf,
    temp_path: PathBuf,
    scheduler: SaveScheduler,
}

impl PersistenceEngine {
    pub fn new(path: impl Into<PathBuf>, delay: Duration) -> Self {
        let path = path.into();
        let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        temp_name.push(".");
        temp_name.push(TEMP_EXTENSION);
        let temp_path = path.with_file_name(temp_name);
        Self {
            path,
            temp_path,
            scheduler: SaveScheduler::new(delay),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn scheduler(&self) -> &SaveScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut SaveScheduler {
        &mut self.scheduler
    }

    /// Load the settings document.
    ///
    /// A missing file is created empty. A file that does not parse is
    /// deleted and replaced by an empty document.
    pub fn load(&self) -> Result<Document, PersistError> {
        self.recover_temp()?;

        if !self.path.exists() {
            warn!("Settings file {} not found", self.path.display());
            return self.reset();
        }

        match read_document(&self.path) {
            Ok(document) => {
                info!("Settings file {} validated", self.path.display());
                Ok(document)
            }
            Err(e) => {
                error!("Settings file {} invalid: {}", self.path.display(), e);
                fs::remove_file(&self.path).map_err(|e| PersistError::io(&self.path, e))?;
                error!("{} removed", self.path.display());
                self.reset()
            }
        }
    }

    fn reset(&self) -> Result<Document, PersistError> {
        let document = Document::empty(SCHEMA_VERSION);
        self.write_document(&document)?;
        warn!("Created settings file {}", self.path.display());
        Ok(document)
    }

    fn recover_temp(&self) -> Result<(), PersistError> {
        if !self.temp_path.exists() {
            return Ok(());
        }
        match read_document(&self.temp_path) {
            Ok(_) => {
                info!("New settings file {} validated", self.temp_path.display());
                fs::rename(&self.temp_path, &self.path)
                    .map_err(|e| PersistError::io(&self.temp_path, e))?;
                info!("Renamed new settings file to {}", self.path.display());
            }
            Err(e) => {
                error!("New settings file {} invalid: {}", self.temp_path.display(), e);
                fs::remove_file(&self.temp_path)
                    .map_err(|e| PersistError::io(&self.temp_path, e))?;
                error!("{} removed", self.temp_path.display());
            }
        }
        Ok(())
    }

    /// Serialize `tree` at the current schema version and write it out
    pub fn save(&mut self, tree: &Tree) -> Result<(), PersistError> {
        self.scheduler.disarm();
        self.write_document(&Document::from_tree(tree, SCHEMA_VERSION))
    }

    /// Atomically replace the settings file with `document`
    pub fn write_document(&self, document: &Document) -> Result<(), PersistError> {
        let xml = document.to_xml()?;
        let temp = &self.temp_path;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp)
            .map_err(|e| PersistError::io(temp, e))?;
        file.write_all(xml.as_bytes())
            .map_err(|e| PersistError::io(temp, e))?;
        file.flush().map_err(|e| PersistError::io(temp, e))?;
        file.sync_all().map_err(|e| PersistError::io(temp, e))?;
        drop(file);

        if let Err(e) = fs::rename(temp, &self.path) {
            let _ = fs::remove_file(temp);
            return Err(PersistError::io(&self.path, e));
        }

        #[cfg(unix)]
        {
            let parent = match self.path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let dir = fs::File::open(parent).map_err(|e| PersistError::io(parent, e))?;
            dir.sync_all().map_err(|e| PersistError::io(parent, e))?;
        }

        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<Document, PersistError> {
    let bytes = fs::read(path).map_err(|e| PersistError::io(path, e))?;
    let text = String::from_utf8(bytes).map_err(|e| PersistError::Xml(e.to_string()))?;
    Document::parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{AddOptions, SettingDefinition};
    use crate::value::Value;
    use tempfile::tempdir;

    const VALID: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Settings version="9"><System><Units type="i" default="0">1</Units></System></Settings>
"#;

    #[test]
    fn test_scheduler_debounces() {
        let start = Instant::now();
        let mut scheduler = SaveScheduler::new(Duration::from_secs(2));
        assert!(!scheduler.is_armed());

        scheduler.schedule(start);
        assert!(!scheduler.fire_if_due(start + Duration::from_secs(1)));

        // Rescheduling postpones the deadline
        scheduler.schedule(start + Duration::from_secs(1));
        assert!(!scheduler.fire_if_due(start + Duration::from_millis(2500)));
        assert!(scheduler.fire_if_due(start + Duration::from_secs(3)));

        // Fires once, then disarmed
        assert!(!scheduler.fire_if_due(start + Duration::from_secs(10)));
        assert!(!scheduler.is_armed());
    }

    #[test]
    fn test_zero_delay_is_immediate() {
        assert!(SaveScheduler::new(Duration::ZERO).is_immediate());
        assert!(!SaveScheduler::new(Duration::from_millis(1)).is_immediate());
    }

    #[test]
    fn test_temp_path_sits_next_to_file() {
        let engine = PersistenceEngine::new("/data/conf/settings.xml", Duration::ZERO);
        assert_eq!(engine.temp_path(), Path::new("/data/conf/settings.xml.new"));
    }

    #[test]
    fn test_missing_file_is_created_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.xml");
        let engine = PersistenceEngine::new(&path, Duration::ZERO);

        let document = engine.load().unwrap();
        assert!(document.root.children.is_empty());
        assert_eq!(document.version(), SCHEMA_VERSION);
        assert!(path.exists());
        assert!(!engine.temp_path().exists());
    }

    #[test]
    fn test_corrupt_file_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.xml");
        fs::write(&path, "<Settings><System>").unwrap();

        let engine = PersistenceEngine::new(&path, Duration::ZERO);
        let document = engine.load().unwrap();
        assert!(document.root.children.is_empty());

        let on_disk = Document::parse(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(on_disk.root.children.is_empty());
    }

    #[test]
    fn test_partial_temp_write_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.xml");
        fs::write(&path, VALID).unwrap();

        let engine = PersistenceEngine::new(&path, Duration::ZERO);
        // Crash during the temp-write phase
        fs::write(engine.temp_path(), &VALID[..VALID.len() / 2]).unwrap();

        let document = engine.load().unwrap();
        assert_eq!(document.root.find_text("System/Units"), Some("1"));
        assert!(!engine.temp_path().exists());
    }

    #[test]
    fn test_complete_temp_write_is_promoted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.xml");
        fs::write(&path, VALID).unwrap();

        let engine = PersistenceEngine::new(&path, Duration::ZERO);
        // Crash after the temp file was synced but before the rename
        fs::write(engine.temp_path(), VALID.replace(">1</Units>", ">2</Units>")).unwrap();

        let document = engine.load().unwrap();
        assert_eq!(document.root.find_text("System/Units"), Some("2"));
        assert!(!engine.temp_path().exists());
    }

    #[test]
    fn test_save_writes_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.xml");
        let mut engine = PersistenceEngine::new(&path, Duration::from_secs(2));

        let mut tree = Tree::new();
        tree.add_setting(
            "/Settings/Gui/Brightness",
            &SettingDefinition::new(80, "i").with_bounds(0, 100),
            &AddOptions::default(),
        )
        .unwrap();
        engine.scheduler_mut().schedule(Instant::now());

        engine.save(&tree).unwrap();
        assert!(!engine.scheduler().is_armed());
        assert!(!engine.temp_path().exists());

        let reloaded = engine.load().unwrap().build_tree();
        let setting = reloaded.get("/Settings/Gui/Brightness").unwrap();
        assert_eq!(setting.value(), &Value::Integer(80));
        assert_eq!(setting.max(), Some(&Value::Integer(100)));
    }
}
