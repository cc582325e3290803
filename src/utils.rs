use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

/// Installs the global `tracing` subscriber. Calling it more than once is
/// harmless, later calls keep the first subscriber.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init();
}

#[cfg(not(feature = "logging"))]
pub fn init_logging() {}

pub(crate) fn get_style_batch() -> Result<ProgressStyle, TemplateError> {
    Ok(
        ProgressStyle::with_template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    )
}

pub(crate) fn get_style_task() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]),
/// it only works on the textual form of the path.
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Renders a short, stable list of names for progress messages.
pub(crate) fn format_active<'a>(active: impl IntoIterator<Item = &'a str>) -> String {
    const MAX: usize = 5;
    let mut names: Vec<_> = active.into_iter().collect();
    names.sort_unstable();

    if names.len() <= MAX {
        names.join(", ")
    } else {
        format!("{}… ({} total)", names[..MAX].join(", "), names.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_dots() {
        assert_eq!(normalize_path(Utf8Path::new("a/./b/../c")), "a/c");
        assert_eq!(normalize_path(Utf8Path::new("../a")), "../a");
        assert_eq!(normalize_path(Utf8Path::new("/a/b/..")), "/a");
    }

    #[test]
    fn format_active_truncates() {
        let names = ["f", "e", "d", "c", "b", "a"];
        assert_eq!(format_active(names), "a, b, c, d, e… (6 total)");
        assert_eq!(format_active(["js", "css"]), "css, js");
    }
}
