// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Reverse Tunnel - CLI
// Exposes a local service on a port of a remote SSH server

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use reverse_tunnel_common::{is_loopback_address, ChannelReporter, HostPort, ReportLine, Reporter, SavedConfig};
use reverse_tunnel_core::{
    HostKeyPolicy, KnownHosts, SessionOptions, SshConnector, SshOptions, TcpDialer,
    TunnelSessionManager,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use config::{expand_path, Flags, Settings};

/// How long to keep printing report lines after the run ends
const DRAIN_OUTPUT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "reverse-tunnel")]
#[command(about = "Expose a local service through an SSH server (reverse TCP tunnel)", long_about = None)]
#[command(version)]
struct Cli {
    /// SSH server address (host[:port], port defaults to 22)
    #[arg(short = 'r', long)]
    remote: Option<String>,

    /// SSH username
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// SSH password (prefer the interactive prompt)
    #[arg(long)]
    password: Option<String>,

    /// Path to SSH private key
    #[arg(short = 'k', long)]
    key: Option<PathBuf>,

    /// Port the SSH server listens on ("3000" binds 0.0.0.0:3000, or host:port)
    #[arg(short = 'p', long = "remote-port", visible_alias = "bind")]
    remote_port: Option<String>,

    /// Local service to forward connections to (host:port)
    #[arg(short = 'l', long)]
    local: Option<String>,

    /// How to verify the SSH server's host key
    #[arg(long, value_enum, default_value_t = HostKeyMode::Strict)]
    host_key_policy: HostKeyMode,

    /// Expected SHA256 host key fingerprint (with --host-key-policy pinned)
    #[arg(long)]
    fingerprint: Option<String>,

    /// known_hosts file (default: <config dir>/reverse-tunnel/known_hosts, plus ~/.ssh/known_hosts read-only)
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Seconds allowed for connecting and authenticating
    #[arg(long, default_value_t = 15)]
    connect_timeout: u64,

    /// Maximum concurrently forwarded connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Don't save these settings for next time
    #[arg(long)]
    no_save: bool,

    /// Also save the password (stored in plain text)
    #[arg(long)]
    remember_password: bool,

    /// Skip interactive prompts (use provided args and saved settings only)
    #[arg(short = 'y', long)]
    non_interactive: bool,

    /// Enable debug logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HostKeyMode {
    /// Host key must already be in known_hosts
    Strict,
    /// Record unknown host keys, reject changed ones
    AcceptNew,
    /// Host key must match --fingerprint
    Pinned,
    /// Accept any host key
    Insecure,
}

impl Cli {
    fn flags(&self) -> Flags {
        Flags {
            remote: self.remote.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            key: self.key.clone(),
            remote_port: self.remote_port.clone(),
            local: self.local.clone(),
        }
    }

    /// An explicit --known-hosts file is the only one consulted; otherwise
    /// ~/.ssh/known_hosts is read as well
    fn host_key_policy(&self) -> Result<HostKeyPolicy> {
        let known_hosts = || -> Result<(PathBuf, Option<PathBuf>)> {
            match &self.known_hosts {
                Some(path) => Ok((expand_path(path), None)),
                None => Ok((
                    KnownHosts::default_path()?,
                    KnownHosts::ssh_known_hosts_path().ok(),
                )),
            }
        };

        Ok(match self.host_key_policy {
            HostKeyMode::Strict => {
                let (known_hosts, ssh_known_hosts) = known_hosts()?;
                HostKeyPolicy::Strict {
                    known_hosts,
                    ssh_known_hosts,
                }
            }
            HostKeyMode::AcceptNew => {
                let (known_hosts, ssh_known_hosts) = known_hosts()?;
                HostKeyPolicy::AcceptNew {
                    known_hosts,
                    ssh_known_hosts,
                }
            }
            HostKeyMode::Pinned => HostKeyPolicy::Pinned {
                fingerprint: self
                    .fingerprint
                    .clone()
                    .context("--fingerprint is required with --host-key-policy pinned")?,
            },
            HostKeyMode::Insecure => HostKeyPolicy::Insecure,
        })
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            max_connections: self.max_connections,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let interactive = !cli.non_interactive;
    let mut settings = Settings::merge(SavedConfig::load(), cli.flags());
    if interactive {
        settings.prompt_missing()?;
    }

    let host_keys = cli.host_key_policy()?;
    if host_keys == HostKeyPolicy::Insecure {
        println!(
            "{}",
            "⚠️  Host key verification is disabled; the SSH server's identity is not checked.".yellow()
        );
    }

    let (reporter, lines) = ChannelReporter::new();
    let printer = tokio::spawn(print_lines(lines));

    if !cli.no_save {
        match settings.to_saved(cli.remember_password).save() {
            Ok(path) => debug!("Saved settings to {}", path.display()),
            Err(e) => reporter.report(&format!("failed to save settings: {}", e)),
        }
    }

    let request = match settings.into_request(interactive) {
        Ok(request) => request,
        Err(e) => {
            // Show anything already queued before the error
            drain(reporter, printer).await;
            return Err(e);
        }
    };
    announce_exposure(&request.remote_bind, &request.local_address);

    let connector = SshConnector::new(SshOptions::default(), host_keys);
    let manager = TunnelSessionManager::new(Arc::new(connector), Arc::new(TcpDialer), Arc::new(reporter))
        .with_options(cli.session_options());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, stopping tunnel");
                shutdown.cancel();
            }
        }
    });

    let result = manager.run(&request, shutdown).await;

    // The manager owns the last reporter handle
    drop(manager);
    if tokio::time::timeout(DRAIN_OUTPUT, printer).await.is_err() {
        debug!("Report output still busy at exit");
    }

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            debug!("Tunnel ended with fatal error: {:?}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Diagnostics go to stderr so they never interleave with report lines
fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "reverse_tunnel=debug,reverse_tunnel_core=debug,reverse_tunnel_common=debug"
    } else {
        "reverse_tunnel=info,reverse_tunnel_core=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Close the reporter and let the printer finish the lines already sent
async fn drain(reporter: ChannelReporter, printer: JoinHandle<()>) {
    drop(reporter);
    if tokio::time::timeout(DRAIN_OUTPUT, printer).await.is_err() {
        debug!("Report output still busy at exit");
    }
}

async fn print_lines(mut lines: mpsc::UnboundedReceiver<ReportLine>) {
    while let Some(line) = lines.recv().await {
        println!("{}", line);
    }
}

/// Tell the user who will be able to reach the forwarded service
fn announce_exposure(remote_bind: &str, local_address: &str) {
    let Ok(bind) = remote_bind.parse::<HostPort>() else {
        // Validation reports the problem when the run starts
        return;
    };

    println!(
        "{}",
        format!("Forwarding {} on the SSH server → {}", bind, local_address)
            .green()
            .bold()
    );
    if is_loopback_address(bind.host()) {
        println!("{}", "The port is only reachable from the SSH server itself.".dimmed());
    } else {
        println!(
            "{}",
            "The port may be reachable by anyone who can reach the SSH server (subject to its GatewayPorts setting).".dimmed()
        );
    }
    println!("{}", "Press Ctrl+C to stop".dimmed());
}
