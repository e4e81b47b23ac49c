// Reverse Tunnel - Known Hosts
// Host key verification policy and the known_hosts file backing it

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

/// Result of looking a host key up in known_hosts
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResult {
    /// Host key is in known_hosts and matches
    Trusted,
    /// No entry for this host yet
    Unknown,
    /// An entry exists for this host with a different key
    Mismatch {
        actual_fingerprint: String,
        line_number: usize,
    },
}

#[derive(Debug, Clone)]
struct KnownHostEntry {
    /// "host" or "[host]:port"
    host_pattern: String,
    key_type: String,
    key_data: String,
    comment: Option<String>,
    line_number: usize,
}

impl KnownHostEntry {
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        // host_pattern key_type key_data [comment]
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            warn!("Invalid known_hosts entry at line {}: too few fields", line_number);
            return None;
        }

        Some(KnownHostEntry {
            host_pattern: parts[0].to_string(),
            key_type: parts[1].to_string(),
            key_data: parts[2].to_string(),
            comment: parts.get(3).map(|s| s.to_string()),
            line_number,
        })
    }

    fn format(&self) -> String {
        match &self.comment {
            Some(comment) => format!(
                "{} {} {} {}",
                self.host_pattern, self.key_type, self.key_data, comment
            ),
            None => format!("{} {} {}", self.host_pattern, self.key_type, self.key_data),
        }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        // Comma-separated host lists as written by OpenSSH
        self.host_pattern
            .split(',')
            .any(|pattern| pattern == format_host_pattern(host, port) || (port == 22 && pattern == host))
    }

    fn verify_key(&self, key: &PublicKey) -> bool {
        self.key_type == key.algorithm().as_str() && self.key_data == key.public_key_base64()
    }
}

/// Lines `save` writes before the first entry
const HEADER: [&str; 2] = ["# Reverse Tunnel - Known Hosts", ""];

/// known_hosts file contents
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    /// Load from `path`; a missing file is an empty set
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut entries = Vec::new();

        if path.exists() {
            let file = fs::File::open(path)
                .context(format!("Failed to open known_hosts file: {}", path.display()))?;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line.context("Failed to read line from known_hosts")?;
                if let Some(entry) = KnownHostEntry::parse(&line, idx + 1) {
                    entries.push(entry);
                }
            }
            debug!("Loaded {} entries from known_hosts: {}", entries.len(), path.display());
        } else {
            debug!("Known_hosts file does not exist yet: {}", path.display());
        }

        Ok(KnownHosts {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// `<config_dir>/reverse-tunnel/known_hosts`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("reverse-tunnel").join("known_hosts"))
    }

    /// The user's OpenSSH known_hosts: ~/.ssh/known_hosts
    pub fn ssh_known_hosts_path() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home_dir.join(".ssh").join("known_hosts"))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> VerifyResult {
        let matching: Vec<&KnownHostEntry> = self
            .entries
            .iter()
            .filter(|e| e.matches(host, port))
            .collect();

        let Some(first) = matching.first() else {
            return VerifyResult::Unknown;
        };

        if matching.iter().any(|e| e.verify_key(key)) {
            return VerifyResult::Trusted;
        }

        VerifyResult::Mismatch {
            actual_fingerprint: calculate_fingerprint(key),
            line_number: first.line_number,
        }
    }

    pub fn add(&mut self, host: &str, port: u16, key: &PublicKey) {
        self.entries.push(KnownHostEntry {
            host_pattern: format_host_pattern(host, port),
            key_type: key.algorithm().as_str().to_string(),
            key_data: key.public_key_base64(),
            comment: None,
            // The line `save` will write it on
            line_number: HEADER.len() + self.entries.len() + 1,
        });
        info!("Added host key for {} to known_hosts", format_host_pattern(host, port));
    }

    /// Rewrite the file; entry line numbers follow the new layout
    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create known_hosts directory")?;
        }

        let mut file = fs::File::create(&self.path)
            .context(format!("Failed to create known_hosts file: {}", self.path.display()))?;

        for line in HEADER {
            writeln!(file, "{}", line)?;
        }
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            writeln!(file, "{}", entry.format())?;
            entry.line_number = HEADER.len() + idx + 1;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .context("Failed to set known_hosts file permissions")?;
        }

        debug!("Saved {} entries to known_hosts: {}", self.entries.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// How the server's host key is checked during the handshake.
///
/// `known_hosts` is the file this tool records keys in. `ssh_known_hosts`
/// (usually ~/.ssh/known_hosts) is only read, and only for hosts the first
/// file has no entry for. Hashed OpenSSH entries never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// The key must already be in known_hosts
    Strict {
        known_hosts: PathBuf,
        ssh_known_hosts: Option<PathBuf>,
    },
    /// Trust on first use: unknown keys are recorded, changed keys rejected
    AcceptNew {
        known_hosts: PathBuf,
        ssh_known_hosts: Option<PathBuf>,
    },
    /// The key's `SHA256:` fingerprint must match
    Pinned { fingerprint: String },
    /// Accept any key
    Insecure,
}

/// Outcome of `HostKeyPolicy::check`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyDecision {
    Accept,
    Reject(String),
}

impl HostKeyPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyPolicy::Strict { .. } => "strict",
            HostKeyPolicy::AcceptNew { .. } => "accept-new",
            HostKeyPolicy::Pinned { .. } => "pinned",
            HostKeyPolicy::Insecure => "insecure",
        }
    }

    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyDecision {
        let target = format_host_pattern(host, port);
        let fingerprint = calculate_fingerprint(key);

        match self {
            HostKeyPolicy::Insecure => {
                warn!(
                    "Host key verification is disabled; accepting {} key {} for {}",
                    key.algorithm().as_str(),
                    fingerprint,
                    target
                );
                HostKeyDecision::Accept
            }
            HostKeyPolicy::Pinned { fingerprint: pinned } => {
                if fingerprints_match(pinned, &fingerprint) {
                    debug!("Host key for {} matches pinned fingerprint", target);
                    HostKeyDecision::Accept
                } else {
                    HostKeyDecision::Reject(format!(
                        "host key {} for {} does not match pinned fingerprint {}",
                        fingerprint, target, pinned
                    ))
                }
            }
            HostKeyPolicy::Strict {
                known_hosts,
                ssh_known_hosts,
            }
            | HostKeyPolicy::AcceptNew {
                known_hosts,
                ssh_known_hosts,
            } => {
                let mut hosts = match KnownHosts::load_from(known_hosts) {
                    Ok(hosts) => hosts,
                    Err(e) => return HostKeyDecision::Reject(format!("{:#}", e)),
                };

                let (result, source) = match hosts.verify(host, port, key) {
                    VerifyResult::Unknown => match ssh_known_hosts.as_deref().and_then(load_read_only) {
                        Some(system) => (system.verify(host, port, key), system.path),
                        None => (VerifyResult::Unknown, hosts.path.clone()),
                    },
                    found => (found, hosts.path.clone()),
                };

                match result {
                    VerifyResult::Trusted => {
                        info!("Host key verified for {} ({})", target, source.display());
                        HostKeyDecision::Accept
                    }
                    VerifyResult::Unknown if matches!(self, HostKeyPolicy::AcceptNew { .. }) => {
                        hosts.add(host, port, key);
                        match hosts.save() {
                            Ok(()) => {
                                warn!(
                                    "Permanently added {} ({} {}) to {}",
                                    target,
                                    key.algorithm().as_str(),
                                    fingerprint,
                                    hosts.path().display()
                                );
                                HostKeyDecision::Accept
                            }
                            Err(e) => HostKeyDecision::Reject(format!("{:#}", e)),
                        }
                    }
                    VerifyResult::Unknown => HostKeyDecision::Reject(format!(
                        "host key for {} is not in {} ({} key fingerprint is {})",
                        target,
                        hosts.path().display(),
                        key.algorithm().as_str(),
                        fingerprint
                    )),
                    VerifyResult::Mismatch {
                        actual_fingerprint,
                        line_number,
                    } => {
                        error!("WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED for {}!", target);
                        error!("Someone could be eavesdropping on you right now (man-in-the-middle attack)!");
                        HostKeyDecision::Reject(format!(
                            "host key for {} changed (now {}); offending entry at {}:{}",
                            target,
                            actual_fingerprint,
                            source.display(),
                            line_number
                        ))
                    }
                }
            }
        }
    }
}

/// A second known_hosts that may be missing or unreadable
fn load_read_only(path: &Path) -> Option<KnownHosts> {
    match KnownHosts::load_from(path) {
        Ok(hosts) => Some(hosts),
        Err(e) => {
            debug!("Ignoring {}: {:#}", path.display(), e);
            None
        }
    }
}

/// "host" for port 22, "[host]:port" otherwise
fn format_host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// SHA256 fingerprint of a public key, unpadded as `ssh-keygen -l` prints it
pub fn calculate_fingerprint(key: &PublicKey) -> String {
    use base64::engine::general_purpose::STANDARD_NO_PAD;

    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    format!("SHA256:{}", STANDARD_NO_PAD.encode(hasher.finalize()))
}

/// Compare fingerprints ignoring base64 padding and the "SHA256:" prefix
fn fingerprints_match(expected: &str, actual: &str) -> bool {
    let normalize = |fp: &str| {
        fp.trim()
            .trim_start_matches("SHA256:")
            .trim_end_matches('=')
            .to_string()
    };
    normalize(expected) == normalize(actual)
}
