// Reverse Tunnel - CLI Settings
// Merges saved settings, command-line flags and interactive prompts into a TunnelRequest

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;
use dialoguer::{Input, Password};
use reverse_tunnel_common::{KeyMaterial, SavedConfig, TunnelRequest};
use reverse_tunnel_core::key_requires_passphrase;
use tracing::debug;
use zeroize::Zeroizing;

/// Request-related command-line flags
#[derive(Debug, Clone, Default)]
pub struct Flags {
    pub remote: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub key: Option<PathBuf>,
    pub remote_port: Option<String>,
    pub local: Option<String>,
}

/// Effective settings for one run, before key files are read
#[derive(Clone, Default)]
pub struct Settings {
    pub remote_address: String,
    pub user: String,
    pub password: Option<Zeroizing<String>>,
    pub key_path: Option<PathBuf>,
    /// Port ("3000") or bind spec ("127.0.0.1:3000")
    pub remote_port: String,
    pub local_address: String,
}

impl Settings {
    /// Flags win over saved values.
    ///
    /// A credential given on the command line replaces both saved
    /// credentials so a stale saved password never rides along with a key.
    pub fn merge(saved: Option<SavedConfig>, flags: Flags) -> Self {
        let saved = saved.unwrap_or_default();

        let (password, key_path) = if flags.password.is_some() || flags.key.is_some() {
            (flags.password.map(Zeroizing::new), flags.key)
        } else if saved.key_path.is_some() {
            if saved.password.is_some() {
                debug!("Saved settings hold both a key and a password; using the key");
            }
            (None, saved.key_path)
        } else {
            (saved.password.map(Zeroizing::new), None)
        };

        Self {
            remote_address: flags.remote.unwrap_or(saved.remote_address),
            user: flags.user.unwrap_or(saved.user),
            password,
            key_path,
            remote_port: flags.remote_port.unwrap_or(saved.remote_port),
            local_address: flags.local.unwrap_or(saved.local_address),
        }
    }

    /// Ask for every value that is still empty
    pub fn prompt_missing(&mut self) -> Result<()> {
        if self.remote_address.trim().is_empty() {
            self.remote_address = Input::new()
                .with_prompt("SSH server address (host[:port])")
                .interact_text()
                .context("Failed to read SSH server address")?;
        }

        if self.user.trim().is_empty() {
            self.user = Input::new()
                .with_prompt("SSH username")
                .interact_text()
                .context("Failed to read username")?;
        }

        if self.password.is_none() && self.key_path.is_none() {
            let key_path_input: String = Input::new()
                .with_prompt("Path to SSH private key (or press Enter for password authentication)")
                .allow_empty(true)
                .interact_text()
                .context("Failed to read key path")?;

            if key_path_input.trim().is_empty() {
                let password = Password::new()
                    .with_prompt("SSH password")
                    .interact()
                    .context("Failed to read password input")?;
                self.password = Some(Zeroizing::new(password));
            } else {
                self.key_path = Some(expand_path(Path::new(key_path_input.trim())));
            }
        }

        if self.remote_port.trim().is_empty() {
            self.remote_port = Input::new()
                .with_prompt("Remote port to listen on (port or host:port)")
                .interact_text()
                .context("Failed to read remote port")?;
        }

        if self.local_address.trim().is_empty() {
            self.local_address = Input::new()
                .with_prompt("Local service address (host:port)")
                .default("localhost:8080".to_string())
                .interact_text()
                .context("Failed to read local address")?;
        }

        Ok(())
    }

    /// The record written on start; the password only when asked to remember it
    pub fn to_saved(&self, remember_password: bool) -> SavedConfig {
        SavedConfig {
            remote_address: self.remote_address.clone(),
            user: self.user.clone(),
            password: if remember_password {
                self.password.as_ref().map(|p| p.as_str().to_string())
            } else {
                None
            },
            remote_port: self.remote_port.clone(),
            local_address: self.local_address.clone(),
            key_path: self.key_path.clone(),
        }
    }

    /// Build the request, reading the key file (and its passphrase) if any
    pub fn into_request(self, interactive: bool) -> Result<TunnelRequest> {
        let remote_bind = self.to_saved(false).remote_bind().unwrap_or_default();
        let private_key = match &self.key_path {
            Some(path) => Some(load_key(path, interactive)?),
            None => None,
        };

        Ok(TunnelRequest {
            remote_address: self.remote_address,
            user: self.user,
            password: self.password,
            private_key,
            remote_bind,
            local_address: self.local_address,
        })
    }
}

/// Read a private key file, prompting for the passphrase of encrypted keys
fn load_key(path: &Path, interactive: bool) -> Result<KeyMaterial> {
    let path = expand_path(path);
    let contents = fs::read_to_string(&path)
        .context(format!("Failed to read SSH key file {}", path.display()))?;

    let encrypted = key_requires_passphrase(&contents);
    let key = KeyMaterial::new(contents).with_source(&path);
    if !encrypted || !interactive {
        return Ok(key);
    }

    println!("{}", "SSH key is encrypted and requires a passphrase.".yellow());
    let passphrase = Password::new()
        .with_prompt(format!("Passphrase for key '{}'", path.display()))
        .interact()
        .context("Failed to read passphrase")?;
    Ok(key.with_passphrase(passphrase))
}

/// Expand a leading `~` like the shell would
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string())
}
