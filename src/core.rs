use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Config;

/// A 32-byte BLAKE3 hash used for content addressing.
///
/// The hex form, truncated to [`Hash32::SHORT`] characters, is what ends up
/// in cache-busting file names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Number of hex characters kept in hashed file names.
    pub const SHORT: usize = 10;

    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// The truncated digest used in file names.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(Self::SHORT);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// The mode in which the pipeline is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A one-time build.
    Build,
    /// A continuous watch mode for development.
    Watch,
}

/// Immutable state shared by every task of a build.
#[derive(Debug, Clone)]
pub struct Environment {
    pub config: Arc<Config>,
    pub mode: Mode,
    /// Port of the live-reload websocket (watch mode only).
    pub reload_port: Option<u16>,
}

impl Environment {
    pub fn build(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            mode: Mode::Build,
            reload_port: None,
        }
    }

    pub fn watch(config: Config, reload_port: u16) -> Self {
        Self {
            config: Arc::new(config),
            mode: Mode::Watch,
            reload_port: Some(reload_port),
        }
    }

    /// Returns a JavaScript snippet to enable live-reloading.
    ///
    /// If the pipeline runs in `Watch` mode, this returns a script that
    /// connects to the websocket server and reloads the page on any message.
    pub fn get_refresh_script(&self) -> Option<String> {
        match self.mode {
            Mode::Build => None,
            Mode::Watch => self.reload_port.map(|port| {
                format!(
                    r#"<script>new WebSocket("ws://localhost:{port}").addEventListener("message",()=>window.location.reload());</script>"#
                )
            }),
        }
    }
}

/// Build-wide cancellation flag. Cheap to clone, every clone observes the
/// same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The context passed to every task action.
pub struct TaskContext {
    /// Access to the frozen configuration and mode.
    pub env: Arc<Environment>,
    /// Name of the running task.
    pub name: String,
    /// Tracing span assigned to this task.
    pub span: tracing::Span,
}

impl TaskContext {
    pub fn config(&self) -> &Config {
        &self.env.config
    }
}
