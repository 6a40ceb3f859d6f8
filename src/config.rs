//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::relay::DEFAULT_RELAY_TIMEOUT;
use crate::session::SessionConfig;
use crate::signer::{SignerDescriptor, SignerOptions};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Signer descriptor, e.g. `key:<64hex>` or `bunker://...`.
    pub signer: String,
    /// Relays events are published to and queried from.
    pub relays: Vec<String>,
    /// Content-addressed blob server for artifact uploads.
    pub blossom_server: Option<String>,
    /// Per-relay operation deadline in seconds.
    pub relay_timeout_secs: u64,
    /// Human-approval deadline for bunker and extension signers, seconds.
    pub approval_timeout_secs: u64,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Where the bunker client keypair is persisted for low-entropy pairings.
    pub client_key_file: PathBuf,
    /// Open a browser tab automatically for the extension signer.
    pub open_browser: bool,
    /// Progress output on stderr.
    pub verbose: bool,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let signer = env::var("SIGNER").context("SIGNER is required")?;
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let blossom_server = env::var("BLOSSOM_SERVER").ok().filter(|s| !s.is_empty());
        let relay_timeout_secs = env::var("RELAY_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RELAY_TIMEOUT.as_secs());
        let approval_timeout_secs = env::var("APPROVAL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(120);
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let client_key_file = env::var("CLIENT_KEY_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("shipstr-client.key"));
        let open_browser = env::var("OPEN_BROWSER").unwrap_or_else(|_| "1".into()) == "1";
        let verbose = env::var("VERBOSE").unwrap_or_else(|_| "0".into()) == "1";
        Ok(Self {
            signer,
            relays,
            blossom_server,
            relay_timeout_secs,
            approval_timeout_secs,
            tor_socks,
            client_key_file,
            open_browser,
            verbose,
        })
    }

    /// Signer options derived from these settings.
    pub fn signer_options(&self) -> SignerOptions {
        SignerOptions {
            approval_timeout: Duration::from_secs(self.approval_timeout_secs),
            tor_socks: self.tor_socks.clone(),
            client_key_file: self.client_key_file.clone(),
            open_browser: self.open_browser,
        }
    }

    /// Full session configuration; fails on a malformed signer descriptor.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let descriptor = SignerDescriptor::parse(&self.signer).context("SIGNER descriptor")?;
        Ok(SessionConfig {
            signer: descriptor,
            signer_opts: self.signer_options(),
            relays: self.relays.clone(),
            blossom_server: self.blossom_server.clone(),
            relay_timeout: Duration::from_secs(self.relay_timeout_secs),
            verbose: self.verbose,
        })
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
