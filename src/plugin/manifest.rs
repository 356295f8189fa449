//! Plugin manifest files.
//!
//! A manifest is a TOML file declaring one or more plugin classes:
//!
//! ```toml
//! [[plugin]]
//! name = "dark_subtract"
//! kind = "processing"
//! implementation = "scale"
//! description = "Remove the dark level"
//!
//! [plugin.parameters]
//! offset = -100.0
//! ```
//!
//! Every member except `description` is required. Entries are parsed with
//! optional fields so that an incomplete class can be rejected on its own
//! without failing the rest of the file.

use super::params::ParameterSet;
use super::traits::PluginKind;
use crate::error::Result;
use serde::Deserialize;
use std::path::Path;

/// Extension of manifest files.
pub const MANIFEST_EXTENSION: &str = "toml";

/// A parsed manifest file.
#[derive(Debug, Default, Deserialize)]
pub struct ManifestFile {
    /// Declared classes, in file order.
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<ManifestEntry>,
}

/// One `[[plugin]]` entry as written.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    /// Class name used for lookups.
    pub name: Option<String>,
    /// Declared role.
    pub kind: Option<PluginKind>,
    /// Name of the registered implementation that executes this class.
    pub implementation: Option<String>,
    /// Default parameters copied into each instance.
    pub parameters: Option<ParameterSet>,
    /// Free-form summary.
    pub description: Option<String>,
}

impl ManifestFile {
    /// Parse manifest text.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }
}

impl ManifestEntry {
    /// Names of the required members this entry lacks.
    pub fn missing_members(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.is_none() {
            missing.push("name");
        }
        if self.kind.is_none() {
            missing.push("kind");
        }
        if self.parameters.is_none() {
            missing.push("parameters");
        }
        if self.implementation.is_none() {
            missing.push("implementation");
        }
        missing
    }
}
