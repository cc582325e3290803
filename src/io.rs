use std::fmt::Display;
use std::fs;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;

use crate::error::CleanError;

const ANSI_BLUE: Style = Style::new().blue();

/// Marker left in the output root when a build was interrupted.
pub const INCOMPLETE_MARKER: &str = ".tessen-incomplete";

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Delete the entire output directory if it exists and recreate it empty.
pub fn clear_output(dir: &Utf8Path) -> Result<(), CleanError> {
    let s = Instant::now();

    if fs::symlink_metadata(dir).is_ok() {
        fs::remove_dir_all(dir).map_err(|source| CleanError {
            path: dir.to_owned(),
            source,
        })?;
    }

    fs::create_dir_all(dir).map_err(|source| CleanError {
        path: dir.to_owned(),
        source,
    })?;

    tracing::info!("cleaned {} {}", dir, as_overhead(s));

    Ok(())
}

/// Writes `data` to `path`, creating missing parent directories.
pub fn write(path: &Utf8Path, data: impl AsRef<[u8]>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, data)
}

/// Lists the files matched by `pattern`, sorted so every consumer sees the
/// same order regardless of the file system.
pub fn glob_files(pattern: &str) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();

    for entry in glob::glob(pattern)? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Escapes glob metacharacters in a literal directory so it can prefix a pattern.
pub fn glob_root(dir: &Utf8Path) -> String {
    glob::Pattern::escape(dir.as_str())
}

pub fn mark_incomplete(output_dir: &Utf8Path) -> std::io::Result<()> {
    write(
        &output_dir.join(INCOMPLETE_MARKER),
        "build interrupted, output is partial\n",
    )
}
