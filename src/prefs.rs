//! Local, single-machine operator preferences.
//!
//! A JSON file of `section -> key -> value`. Section `main` carries the
//! default bootstrap address (`remote_address`) and active project
//! (`project_id`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const MAIN_SECTION: &str = "main";
pub const REMOTE_ADDRESS: &str = "remote_address";
pub const PROJECT_ID: &str = "project_id";

#[derive(Debug, Clone, Default)]
pub struct Preferences {
    path: PathBuf,
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Preferences {
    /// Read preferences from `path`; a missing file yields none.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sections = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| {
                Error::Preferences(format!("failed to read {}: {}", path.display(), e))
            })?;
            serde_json::from_str(&raw).map_err(|e| {
                Error::Preferences(format!("failed to parse {}: {}", path.display(), e))
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, sections })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    /// Set a value and persist the whole file.
    pub fn set(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        let raw = serde_json::to_string_pretty(&self.sections)?;
        fs::write(&self.path, raw).map_err(|e| {
            Error::Preferences(format!("failed to write {}: {}", self.path.display(), e))
        })
    }

    /// `explicit` if given, otherwise the stored value.
    pub fn or_default(&self, explicit: Option<String>, key: &str) -> Result<String> {
        explicit
            .or_else(|| self.get(MAIN_SECTION, key).map(str::to_string))
            .ok_or_else(|| {
                Error::Preferences(format!(
                    "no {key} given and none set (config set {MAIN_SECTION} {key} VALUE)"
                ))
            })
    }
}
