// Saved session settings for Reverse Tunnel
// A flat record persisted as JSON in the per-user temporary directory

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// File name of the saved settings inside the temp directory
pub const SAVED_CONFIG_FILE: &str = "reverse_tunnel_config.json";

/// Interface the remote listener binds when only a port was saved
pub const DEFAULT_REMOTE_BIND_HOST: &str = "0.0.0.0";

/// Last-used tunnel settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedConfig {
    /// SSH server address (e.g., "relay.example:22")
    #[serde(default)]
    pub remote_address: String,
    /// SSH username
    #[serde(default, rename = "username")]
    pub user: String,
    /// Only present when the user asked for it to be remembered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Remote port ("3000") or full bind spec ("127.0.0.1:3000")
    #[serde(default)]
    pub remote_port: String,
    /// Local service address (e.g., "localhost:8080")
    #[serde(default)]
    pub local_address: String,
    /// Path to SSH private key (for key auth)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl SavedConfig {
    /// Get the path to the saved settings file
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(SAVED_CONFIG_FILE)
    }

    /// Load saved settings from the default location.
    /// A missing or unreadable file means "nothing saved".
    pub fn load() -> Option<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load saved settings from a specific path
    pub fn load_from(path: &Path) -> Option<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("No saved settings at {}: {}", path.display(), e);
                return None;
            }
        };

        if contents.trim().is_empty() {
            return None;
        }

        match serde_json::from_str(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring unparseable saved settings {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::default_path();
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        // The record may hold a password; keep it private to the user
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Remote bind spec for the saved port: a bare port binds on 0.0.0.0,
    /// anything containing ':' is used as-is
    pub fn remote_bind(&self) -> Option<String> {
        let port = self.remote_port.trim();
        if port.is_empty() {
            None
        } else if port.contains(':') {
            Some(port.to_string())
        } else {
            Some(format!("{}:{}", DEFAULT_REMOTE_BIND_HOST, port))
        }
    }
}
