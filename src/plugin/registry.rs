//! Plugin registry: named plugin classes bound to registered implementations.

use super::manifest::{MANIFEST_EXTENSION, ManifestEntry, ManifestFile};
use super::params::ParameterSet;
use super::traits::{Plugin, PluginFactory, PluginKind};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Entry names starting with one of these are never discovered.
const RESERVED_PREFIXES: [char; 2] = ['.', '_'];

/// A named plugin class.
///
/// Classes are what pipelines refer to. Each one binds a set of default
/// parameters to an implementation registered with
/// [`PluginRegistry::register_implementation`].
#[derive(Debug, Clone, PartialEq)]
pub struct PluginClass {
    /// Lookup name.
    pub name: String,
    /// Declared role; must match the implementation's kind.
    pub kind: PluginKind,
    /// One-line summary.
    pub description: String,
    /// Parameters copied into every new instance.
    pub defaults: ParameterSet,
    /// Name of the registered implementation.
    pub implementation: String,
    /// Manifest the class was discovered in, if any.
    pub origin: Option<PathBuf>,
}

impl PluginClass {
    /// Create a class with empty defaults.
    pub fn new(
        name: impl Into<String>,
        kind: PluginKind,
        implementation: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            defaults: ParameterSet::new(),
            implementation: implementation.into(),
            origin: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the default parameters.
    pub fn with_defaults(mut self, defaults: ParameterSet) -> Self {
        self.defaults = defaults;
        self
    }

    fn from_manifest(entry: ManifestEntry, origin: &Path) -> std::result::Result<Self, String> {
        let missing = entry.missing_members();
        if !missing.is_empty() {
            return Err(format!("missing {}", missing.join(", ")));
        }
        // All four are present after the check above.
        let (Some(name), Some(kind), Some(implementation), Some(defaults)) =
            (entry.name, entry.kind, entry.implementation, entry.parameters)
        else {
            return Err("incomplete class".into());
        };
        Ok(Self {
            name,
            kind,
            description: entry.description.unwrap_or_default(),
            defaults,
            implementation,
            origin: Some(origin.to_path_buf()),
        })
    }
}

#[derive(Clone, Copy)]
struct Implementation {
    kind: PluginKind,
    factory: PluginFactory,
}

/// Outcome of one [`PluginRegistry::discover`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    /// Classes newly bound (or rebound on reload).
    pub registered: Vec<String>,
    /// Classes skipped because the name was already bound.
    pub kept_existing: Vec<String>,
    /// Rejected classes or unreadable manifests, with the reason.
    pub rejected: Vec<(PathBuf, String)>,
}

/// Registry of plugin implementations and the classes bound to them.
///
/// The registry is an ordinary value; share it with `Arc<PluginRegistry>`.
/// All methods take `&self`.
pub struct PluginRegistry {
    implementations: RwLock<HashMap<String, Implementation>>,
    classes: RwLock<HashMap<String, PluginClass>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            implementations: RwLock::new(HashMap::new()),
            classes: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry holding the built-in plugins.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        super::builtin::register_builtin_plugins(&registry);
        registry
    }

    /// Register an implementation under `name`, replacing any previous one.
    pub fn register_implementation(
        &self,
        name: impl Into<String>,
        kind: PluginKind,
        factory: PluginFactory,
    ) {
        let name = name.into();
        debug!(implementation = %name, %kind, "Registered plugin implementation");
        self.implementations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Implementation { kind, factory });
    }

    /// Bind a class by name.
    ///
    /// With `reload` false an existing binding is left untouched. Returns
    /// whether the class was stored.
    pub fn register_class(&self, class: PluginClass, reload: bool) -> bool {
        let mut classes = self.classes.write().unwrap_or_else(PoisonError::into_inner);
        if !reload && classes.contains_key(&class.name) {
            return false;
        }
        classes.insert(class.name.clone(), class);
        true
    }

    /// Walk `root` for plugin manifests and register the classes they declare.
    ///
    /// Entries whose names start with `.` or `_` are skipped along with
    /// everything below them, as are files that are not manifests. A class is
    /// rejected if it lacks a required member or names an implementation that
    /// is unregistered or of a different kind. Rejections are logged and
    /// collected in the report; they do not fail the pass.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] if `root` is not a directory.
    pub fn discover(&self, root: impl AsRef<Path>, reload: bool) -> Result<DiscoveryReport> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::NotFound(format!(
                "plugin directory {} does not exist",
                root.display()
            )));
        }

        let mut report = DiscoveryReport::default();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_reserved(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry during plugin discovery");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_manifest(entry.path()) {
                continue;
            }
            self.register_manifest(entry.path(), reload, &mut report);
        }

        info!(
            root = %root.display(),
            registered = report.registered.len(),
            kept = report.kept_existing.len(),
            rejected = report.rejected.len(),
            "Plugin discovery finished"
        );
        Ok(report)
    }

    fn register_manifest(&self, path: &Path, reload: bool, report: &mut DiscoveryReport) {
        let manifest = match ManifestFile::load(path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring malformed plugin manifest");
                report.rejected.push((path.to_path_buf(), e.to_string()));
                return;
            }
        };

        for entry in manifest.plugins {
            let label = entry.name.clone().unwrap_or_else(|| "<unnamed>".into());
            let class = PluginClass::from_manifest(entry, path).and_then(|class| {
                self.check_implementation(&class)?;
                Ok(class)
            });
            match class {
                Ok(class) => {
                    let name = class.name.clone();
                    if self.register_class(class, reload) {
                        debug!(plugin = %name, path = %path.display(), "Discovered plugin");
                        report.registered.push(name);
                    } else {
                        report.kept_existing.push(name);
                    }
                }
                Err(reason) => {
                    warn!(
                        plugin = %label,
                        path = %path.display(),
                        %reason,
                        "Rejected plugin class"
                    );
                    report.rejected.push((path.to_path_buf(), format!("{label}: {reason}")));
                }
            }
        }
    }

    fn check_implementation(&self, class: &PluginClass) -> std::result::Result<(), String> {
        let implementations = self.implementations.read().unwrap_or_else(PoisonError::into_inner);
        match implementations.get(&class.implementation) {
            None => Err(format!("unknown implementation '{}'", class.implementation)),
            Some(imp) if imp.kind != class.kind => Err(format!(
                "declared kind {} but implementation '{}' is {}",
                class.kind, class.implementation, imp.kind
            )),
            Some(_) => Ok(()),
        }
    }

    /// Create a fresh instance of the named class.
    ///
    /// The instance's parameters are a copy of the class defaults.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] if no class or implementation is
    /// registered under the name.
    pub fn get_by_name(&self, name: &str) -> Result<Box<dyn Plugin>> {
        let class = self
            .class(name)
            .ok_or_else(|| Error::NotFound(format!("plugin '{name}' is not registered")))?;
        let factory = {
            let implementations = self
                .implementations
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            implementations
                .get(&class.implementation)
                .map(|imp| imp.factory)
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "implementation '{}' of plugin '{name}' is not registered",
                        class.implementation
                    ))
                })?
        };
        factory(class.defaults)
    }

    /// Look up a class by name.
    pub fn class(&self, name: &str) -> Option<PluginClass> {
        let classes = self.classes.read().unwrap_or_else(PoisonError::into_inner);
        classes.get(name).cloned()
    }

    /// Check whether a class is bound to `name`.
    pub fn has_plugin(&self, name: &str) -> bool {
        let classes = self.classes.read().unwrap_or_else(PoisonError::into_inner);
        classes.contains_key(name)
    }

    /// All class names, sorted.
    pub fn list_plugins(&self) -> Vec<String> {
        let classes = self.classes.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = classes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Class names of one kind, sorted.
    pub fn plugins_of_kind(&self, kind: PluginKind) -> Vec<String> {
        let classes = self.classes.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = classes
            .values()
            .filter(|c| c.kind == kind)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Remove a class binding. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut classes = self.classes.write().unwrap_or_else(PoisonError::into_inner);
        classes.remove(name).is_some()
    }

    /// Snapshot of every class binding.
    pub fn classes(&self) -> BTreeMap<String, PluginClass> {
        let classes = self.classes.read().unwrap_or_else(PoisonError::into_inner);
        classes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.list_plugins())
            .finish()
    }
}

fn is_reserved(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with(RESERVED_PREFIXES))
}

fn is_manifest(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(MANIFEST_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::params::SideChannel;
    use crate::plugin::traits::Payload;

    #[test]
    fn test_registry_creation() {
        let registry = PluginRegistry::new();
        assert!(registry.list_plugins().is_empty());
        assert!(!registry.has_plugin("scale"));
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        let registry = PluginRegistry::with_builtins();
        let err = registry.get_by_name("nonexistent").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_instances_do_not_share_parameters() {
        let registry = PluginRegistry::with_builtins();
        let mut a = registry.get_by_name("scale").unwrap();
        let b = registry.get_by_name("scale").unwrap();
        a.parameters_mut().set("factor", 10.0);
        assert_eq!(b.parameters().f64_or("factor", 0.0), 1.0);
        assert_eq!(
            registry.class("scale").unwrap().defaults.f64_or("factor", 0.0),
            1.0
        );
    }

    #[test]
    fn test_register_class_respects_reload() {
        let registry = PluginRegistry::with_builtins();
        let custom = PluginClass::new("scale", PluginKind::Processing, "scale")
            .with_defaults(ParameterSet::new().with("factor", 3.0));
        assert!(!registry.register_class(custom.clone(), false));
        assert_eq!(registry.class("scale").unwrap().defaults.f64_or("factor", 0.0), 1.0);
        assert!(registry.register_class(custom, true));
        assert_eq!(registry.class("scale").unwrap().defaults.f64_or("factor", 0.0), 3.0);
    }

    #[test]
    fn test_class_executes_through_implementation() {
        let registry = PluginRegistry::with_builtins();
        registry.register_class(
            PluginClass::new("double", PluginKind::Processing, "scale")
                .with_defaults(ParameterSet::new().with("factor", 2.0)),
            false,
        );
        let mut plugin = registry.get_by_name("double").unwrap();
        let frame = crate::frame::Frame::filled(crate::frame::Shape::new(1, 1), 4.0);
        let (out, _) = plugin
            .execute(Payload::Frame(frame), SideChannel::new())
            .unwrap();
        assert_eq!(out.as_frame().unwrap().as_slice(), &[8.0]);
    }

    #[test]
    fn test_plugins_of_kind() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(
            registry.plugins_of_kind(PluginKind::Input),
            vec!["constant_source".to_string(), "file_source".to_string()]
        );
        assert_eq!(
            registry.plugins_of_kind(PluginKind::Output),
            vec!["frame_statistics".to_string()]
        );
    }

    #[test]
    fn test_unregister() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.unregister("crop"));
        assert!(!registry.unregister("crop"));
        assert!(registry.get_by_name("crop").is_err());
    }

    #[test]
    fn test_discover_missing_root() {
        let registry = PluginRegistry::new();
        let err = registry.discover("/nonexistent/plugin/dir", false).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
