//! Content hashing for cache busting.
//!
//! Every file of an asset class is renamed in place to
//! `<stem>-<digest><.ext>`, where the digest is the truncated BLAKE3 hash of
//! its final bytes. Identical bytes always produce the identical name, so
//! rebuilding unchanged sources never invalidates browser caches.

use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefMutIterator, ParallelIterator};

use crate::core::Hash32;
use crate::manifest::{ManifestClass, RenameManifest};

/// A produced asset waiting to be hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFile {
    /// Path relative to the class directory.
    pub path: Utf8PathBuf,
    /// Populated by [`hash`].
    pub digest: Option<Hash32>,
    pub class: ManifestClass,
}

impl AssetFile {
    pub fn new(path: impl Into<Utf8PathBuf>, class: ManifestClass) -> Self {
        Self {
            path: path.into(),
            digest: None,
            class,
        }
    }

    /// Manifest key: the relative path with `/` separators.
    pub fn key(&self) -> String {
        to_key(&self.path)
    }
}

pub(crate) fn to_key(path: &Utf8Path) -> String {
    path.components()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

/// Inserts the digest between the stem and the extension:
/// `js/app.min.js` → `js/app.min-<digest>.js`.
pub fn hashed_name(path: &Utf8Path, digest: &str) -> Utf8PathBuf {
    let name = match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => format!("{stem}-{digest}.{ext}"),
        _ => format!("{}-{digest}", path.file_name().unwrap_or_default()),
    };

    path.with_file_name(name)
}

/// Reverses [`hashed_name`] for a single file name, if it carries a digest
/// of the expected shape.
pub fn unhashed_name(file_name: &str) -> Option<String> {
    let (base, ext) = match file_name.rfind('.') {
        Some(dot) if dot > 0 => (&file_name[..dot], &file_name[dot..]),
        _ => (file_name, ""),
    };

    let dash = base.len().checked_sub(Hash32::SHORT + 1)?;
    if !base.is_char_boundary(dash) {
        return None;
    }

    let (stem, rest) = base.split_at(dash);
    let digest = rest.strip_prefix('-')?;

    if stem.is_empty() || !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }

    Some(format!("{stem}{ext}"))
}

/// Hashes every file in `files` (relative to `root`), renames it on disk and
/// writes the class manifest into `root`.
///
/// `previous` is the manifest of the last run of the same step; hashed files
/// it names that are now obsolete (changed content or a deleted source) are
/// removed.
pub fn hash(
    files: &mut [AssetFile],
    root: &Utf8Path,
    class: ManifestClass,
    previous: Option<&RenameManifest>,
) -> anyhow::Result<RenameManifest> {
    let seen: Mutex<HashMap<String, Hash32>> = Mutex::new(HashMap::new());

    let entries = files
        .par_iter_mut()
        .map(|file| -> anyhow::Result<(String, String)> {
            let source = root.join(&file.path);
            let bytes = fs::read(&source)?;
            let digest = Hash32::hash(&bytes);
            let short = digest.short();

            {
                let mut seen = seen.lock().unwrap();
                if let Some(other) = seen.insert(short.clone(), digest)
                    && other != digest
                {
                    tracing::warn!(digest = %short, path = %file.path, "hash collision between different contents");
                }
            }

            let hashed = hashed_name(&file.path, &short);
            let target = root.join(&hashed);

            if target.exists() && fs::read(&target)? != bytes {
                tracing::warn!(%target, "hashed name already taken by different content, overwriting");
            }

            fs::rename(&source, &target)?;
            file.digest = Some(digest);

            let key = file.key();
            let value = to_key(&hashed);

            if let Some(old) = previous.and_then(|previous| previous.get(&key))
                && old != value
            {
                match fs::remove_file(root.join(old)) {
                    Ok(()) => tracing::debug!(%old, "removed stale hashed file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }

            Ok((key, value))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let manifest: RenameManifest = entries.into_iter().collect();

    for (key, old) in previous.iter().flat_map(|previous| previous.iter()) {
        if manifest.get(key).is_none() {
            match fs::remove_file(root.join(old)) {
                Ok(()) => tracing::debug!(%old, "removed hashed file of a deleted source"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    manifest.write(&root.join(class.file_name()))?;

    tracing::debug!(class = %class, files = manifest.len(), "wrote manifest");

    Ok(manifest)
}
