// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Reverse Tunnel - Common Library
// Shared types, reporting and saved configuration

pub mod config;
pub mod error;
pub mod network;
pub mod reporter;
pub mod types;

pub use config::SavedConfig;
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address, HostPort};
pub use reporter::{ChannelReporter, MemoryReporter, ReportLine, Reporter};
pub use types::{CredentialKind, KeyMaterial, TunnelRequest, TunnelState, TunnelTarget};
