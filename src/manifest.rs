//! Rename manifests: logical asset path → hashed asset path, one per asset
//! class.
//!
//! A manifest is written next to the files it describes by the hashing step,
//! read back by the matching rewrite pass in the same build, and removed
//! before the build counts as complete. A copy is also retained in memory by
//! [`ManifestStore`] so incremental builds can rewrite documents without
//! re-hashing branches that did not change.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::sync::RwLock;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::RewriteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManifestClass {
    Css,
    Js,
    Assets,
}

impl ManifestClass {
    /// The order in which manifests are applied to documents.
    pub const ORDER: [ManifestClass; 3] = [ManifestClass::Css, ManifestClass::Js, ManifestClass::Assets];

    pub fn name(self) -> &'static str {
        match self {
            ManifestClass::Css => "css",
            ManifestClass::Js => "js",
            ManifestClass::Assets => "assets",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ManifestClass::Css => "css-manifest.json",
            ManifestClass::Js => "js-manifest.json",
            ManifestClass::Assets => "assets-manifest.json",
        }
    }

    /// Directory the hashed files of this class live in; the manifest is
    /// written there too.
    pub fn target_dir(self, config: &Config) -> Utf8PathBuf {
        match self {
            ManifestClass::Css => config.css_output_dir(),
            ManifestClass::Js => config.js_output_dir(),
            ManifestClass::Assets => config.output_dir.clone(),
        }
    }

    pub fn manifest_path(self, config: &Config) -> Utf8PathBuf {
        self.target_dir(config).join(self.file_name())
    }
}

impl fmt::Display for ManifestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mapping from logical path (relative to the class directory, `/`
/// separated) to hashed path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenameManifest {
    entries: BTreeMap<String, String>,
}

impl RenameManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a mapping, returning the previous target when the key was
    /// already present.
    pub fn insert(&mut self, logical: impl Into<String>, hashed: impl Into<String>) -> Option<String> {
        self.entries.insert(logical.into(), hashed.into())
    }

    pub fn get(&self, logical: &str) -> Option<&str> {
        self.entries.get(logical).map(String::as_str)
    }

    /// Like [`RenameManifest::get`], also borrowing the stored key.
    pub fn get_entry(&self, logical: &str) -> Option<(&str, &str)> {
        self.entries
            .get_key_value(logical)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), RewriteError> {
        let json = serde_json::to_string_pretty(self)?;
        crate::io::write(path, json)?;
        Ok(())
    }

    pub fn read(path: &Utf8Path) -> Result<Self, RewriteError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl FromIterator<(String, String)> for RenameManifest {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Last manifest produced by each hashing step, kept across builds of one
/// engine.
#[derive(Debug, Default)]
pub struct ManifestStore {
    retained: RwLock<HashMap<ManifestClass, RenameManifest>>,
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&self, class: ManifestClass, manifest: RenameManifest) {
        self.retained
            .write()
            .expect("manifest store poisoned")
            .insert(class, manifest);
    }

    pub fn get(&self, class: ManifestClass) -> Option<RenameManifest> {
        self.retained
            .read()
            .expect("manifest store poisoned")
            .get(&class)
            .cloned()
    }

    /// Loads the manifest for `class`: the file written by this build's
    /// hashing step if present, otherwise the retained copy.
    pub fn load(&self, class: ManifestClass, config: &Config) -> Result<RenameManifest, RewriteError> {
        let path = class.manifest_path(config);

        if path.is_file() {
            return RenameManifest::read(&path);
        }

        self.get(class).ok_or(RewriteError::MissingManifest(class))
    }
}

/// Removes every manifest file from the output tree, returning how many
/// were found.
pub fn remove_manifests(config: &Config) -> std::io::Result<usize> {
    let mut removed = 0;

    for class in ManifestClass::ORDER {
        let path = class.manifest_path(config);
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(root: &Utf8Path) -> Config {
        Config {
            source_dir: root.join("src"),
            output_dir: root.join("dest"),
            ..Config::default()
        }
    }

    #[test]
    fn manifests_live_next_to_their_assets() {
        let config = Config::default();
        assert_eq!(ManifestClass::Css.manifest_path(&config), "dest/css/css-manifest.json");
        assert_eq!(ManifestClass::Js.manifest_path(&config), "dest/js/js-manifest.json");
        assert_eq!(ManifestClass::Assets.manifest_path(&config), "dest/assets-manifest.json");
    }

    #[test]
    fn serializes_as_a_flat_object() {
        let mut manifest = RenameManifest::new();
        manifest.insert("a.css", "a-9f2c.css");

        let json = serde_json::to_string(&manifest).unwrap();
        assert_eq!(json, r#"{"a.css":"a-9f2c.css"}"#);
    }

    #[test]
    fn store_prefers_the_file_written_in_this_build() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let config = config_in(&root);
        let store = ManifestStore::new();

        assert!(matches!(
            store.load(ManifestClass::Js, &config),
            Err(RewriteError::MissingManifest(ManifestClass::Js))
        ));

        let mut old = RenameManifest::new();
        old.insert("app.js", "app-old.js");
        store.retain(ManifestClass::Js, old.clone());
        assert_eq!(store.load(ManifestClass::Js, &config).unwrap(), old);

        let mut new = RenameManifest::new();
        new.insert("app.js", "app-new.js");
        new.write(&ManifestClass::Js.manifest_path(&config)).unwrap();
        assert_eq!(store.load(ManifestClass::Js, &config).unwrap(), new);
    }

    #[test]
    fn remove_manifests_counts_and_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let config = config_in(&root);

        RenameManifest::new()
            .write(&ManifestClass::Css.manifest_path(&config))
            .unwrap();

        assert_eq!(remove_manifests(&config).unwrap(), 1);
        assert_eq!(remove_manifests(&config).unwrap(), 0);
    }
}
