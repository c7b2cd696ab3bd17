//! Factory default overlays
//!
//! Each overlay directory holds plain-text files with one setting per line:
//!
//! ```text
//! # path                  default  type  min  max  silent
//! System/Units            0        i     0    2
//! Gui/Brightness          80       i     0    100  1
//! System/Name             gateway  s
//! ```
//!
//! Paths are relative to `/Settings`. Lines go through the regular
//! `add_setting` contract, so existing values are never overwritten.

use crate::document::parse_bool;
use crate::error::DefaultsError;
use crate::tree::{resolve_relative, AddOptions, SettingDefinition, Tree, SETTINGS_PATH};
use crate::value::{Value, ValueType};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// A parsed overlay line
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultEntry {
    /// Absolute setting path
    pub path: String,
    pub definition: SettingDefinition,
}

/// Parse one overlay line. Blank and comment-only lines yield `None`.
pub fn parse_line(line: &str, number: usize) -> Result<Option<DefaultEntry>, DefaultsError> {
    let content = line.split('#').next().unwrap_or("");
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.is_empty() {
        return Ok(None);
    }
    if fields.len() < 3 {
        return Err(DefaultsError::Syntax {
            line: number,
            text: line.trim().to_string(),
        });
    }

    let kind = fields[2];
    if ValueType::from_code(kind).is_none() {
        return Err(DefaultsError::InvalidType {
            line: number,
            kind: kind.to_string(),
        });
    }

    let definition = SettingDefinition {
        default: Value::from(fields[1]),
        type_code: kind.to_string(),
        min: fields.get(3).map(|v| Value::from(*v)),
        max: fields.get(4).map(|v| Value::from(*v)),
        silent: fields.get(5).map(|v| parse_bool(v)).unwrap_or(false),
    };

    Ok(Some(DefaultEntry {
        path: resolve_relative(SETTINGS_PATH, fields[0]),
        definition,
    }))
}

/// Apply one overlay file. A syntax error stops the rest of the file;
/// lines already applied stay applied. Returns the number of lines applied.
pub fn load_file(tree: &mut Tree, path: &Path) -> Result<usize, DefaultsError> {
    let content = fs::read_to_string(path)?;
    let options = AddOptions::default();
    let mut applied = 0;

    for (index, line) in content.lines().enumerate() {
        let Some(entry) = parse_line(line, index + 1)? else {
            continue;
        };
        match tree.add_setting(&entry.path, &entry.definition, &options) {
            Ok(_) => applied += 1,
            Err(e) => warn!("{}:{}: {}", path.display(), index + 1, e),
        }
    }
    Ok(applied)
}

/// Apply every file in `dir`, in file name order. A missing directory is
/// skipped; a broken file is logged and the remaining files still load.
pub fn load_dir(tree: &mut Tree, dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Skipping defaults directory {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let mut applied = 0;
    for file in files {
        match load_file(tree, &file) {
            Ok(count) => {
                debug!("Loaded {} defaults from {}", count, file.display());
                applied += count;
            }
            Err(e) => error!("Error loading {}: {}", file.display(), e),
        }
    }
    if applied > 0 {
        info!("Applied {} default settings from {}", applied, dir.display());
    }
    applied
}
