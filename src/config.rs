//! Centralized configuration for the snapshot engine.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - The caller loads a VaultConfig once and passes it into Vault::open;
//!   there is no ambient global.
//! - from_env() is a convenience for callers that configure via ENV.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::manifest::Compression;

/// Top-level configuration for one engine instance.
#[derive(Clone, Debug)]
pub struct VaultConfig {
    /// Compression applied to archive members on backup.
    /// Env: SNAPVAULT_COMPRESSION = none|gzip (default none)
    pub compression: Compression,

    /// Gzip level (0-9) when compression=gzip.
    /// Env: SNAPVAULT_GZIP_LEVEL (default 6)
    pub gzip_level: u32,

    /// Directory of media files to include when a backup asks for media.
    /// Env: SNAPVAULT_MEDIA_DIR (default None: no media)
    pub media_dir: Option<PathBuf>,

    /// Run the referential-integrity spot check during restore verification.
    /// Env: SNAPVAULT_SPOT_CHECK = 0|1 (default true)
    pub spot_check_orphans: bool,

    /// Default per-operation timeout; None means no deadline.
    /// Env: SNAPVAULT_OP_TIMEOUT_SECS (default None)
    pub op_timeout: Option<Duration>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            gzip_level: 6,
            media_dir: None,
            spot_check_orphans: true,
            op_timeout: None,
        }
    }
}

impl VaultConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SNAPVAULT_COMPRESSION") {
            match v.trim().to_ascii_lowercase().as_str() {
                "gzip" => cfg.compression = Compression::Gzip,
                "none" | "" => cfg.compression = Compression::None,
                _ => {}
            }
        }

        if let Ok(v) = std::env::var("SNAPVAULT_GZIP_LEVEL") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.gzip_level = n.min(9);
            }
        }

        if let Ok(v) = std::env::var("SNAPVAULT_MEDIA_DIR") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.media_dir = Some(PathBuf::from(s));
            }
        }

        if let Ok(v) = std::env::var("SNAPVAULT_SPOT_CHECK") {
            let s = v.trim().to_ascii_lowercase();
            cfg.spot_check_orphans = !(s == "0" || s == "false" || s == "off" || s == "no");
        }

        if let Ok(v) = std::env::var("SNAPVAULT_OP_TIMEOUT_SECS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                if n > 0 {
                    cfg.op_timeout = Some(Duration::from_secs(n));
                }
            }
        }

        cfg
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_compression(mut self, c: Compression) -> Self {
        self.compression = c;
        self
    }

    pub fn with_gzip_level(mut self, level: u32) -> Self {
        self.gzip_level = level.min(9);
        self
    }

    pub fn with_media_dir<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.media_dir = dir.map(Into::into);
        self
    }

    pub fn with_spot_check_orphans(mut self, on: bool) -> Self {
        self.spot_check_orphans = on;
        self
    }

    pub fn with_op_timeout(mut self, t: Option<Duration>) -> Self {
        self.op_timeout = t;
        self
    }
}

impl fmt::Display for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VaultConfig {{ compression: {:?}, gzip_level: {}, media_dir: {}, spot_check_orphans: {}, op_timeout: {} }}",
            self.compression,
            self.gzip_level,
            self.media_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string()),
            self.spot_check_orphans,
            self.op_timeout
                .map(|t| format!("{}s", t.as_secs()))
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}
