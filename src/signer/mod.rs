//! Polymorphic signing backends.
//!
//! Four trust models are supported, represented as an exhaustive tagged enum
//! rather than trait objects so capability questions ("can this signer batch
//! sign?") are answered by match, not downcasting.

mod bunker;
mod extension;
mod external;
mod local;

use std::path::PathBuf;
use std::time::Duration;

pub use bunker::RemoteBunkerSigner;
pub use extension::BrowserExtensionSigner;
pub use external::ExternalKeySigner;
pub use local::LocalKeySigner;

use url::Url;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::session::Cancel;

/// Parsed signer descriptor, validated before any network I/O.
///
/// Syntax:
/// - `key:<64-hex>` – local private key
/// - `pubkey:<64-hex>` – external/offline signing handoff
/// - `bunker://<remote-pubkey-hex>?relay=<ws-url>&secret=<s>` – remote signer
/// - `extension` – browser extension bridge
#[derive(Debug, Clone, PartialEq)]
pub enum SignerDescriptor {
    Local { secret_key: String },
    External { public_key: String },
    Bunker {
        remote_pubkey: String,
        relay_url: String,
        secret: String,
    },
    Extension,
}

impl SignerDescriptor {
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(hex_key) = s.strip_prefix("key:") {
            require_hex32(hex_key, "private key")?;
            return Ok(SignerDescriptor::Local {
                secret_key: hex_key.to_string(),
            });
        }
        if let Some(hex_key) = s.strip_prefix("pubkey:") {
            require_hex32(hex_key, "public key")?;
            return Ok(SignerDescriptor::External {
                public_key: hex_key.to_string(),
            });
        }
        if s.starts_with("bunker://") {
            let url = Url::parse(s)
                .map_err(|e| Error::Validation(format!("bunker descriptor: {e}")))?;
            let remote_pubkey = url
                .host_str()
                .ok_or_else(|| Error::Validation("bunker descriptor missing pubkey".into()))?
                .to_string();
            require_hex32(&remote_pubkey, "bunker pubkey")?;
            let mut relay_url = None;
            let mut secret = None;
            for (k, v) in url.query_pairs() {
                match k.as_ref() {
                    "relay" => relay_url = Some(v.into_owned()),
                    "secret" => secret = Some(v.into_owned()),
                    _ => {}
                }
            }
            let relay_url = relay_url
                .ok_or_else(|| Error::Validation("bunker descriptor missing relay".into()))?;
            let secret = secret
                .ok_or_else(|| Error::Validation("bunker descriptor missing secret".into()))?;
            return Ok(SignerDescriptor::Bunker {
                remote_pubkey,
                relay_url,
                secret,
            });
        }
        if s == "extension" {
            return Ok(SignerDescriptor::Extension);
        }
        Err(Error::Validation(format!("unknown signer descriptor: {s}")))
    }
}

fn require_hex32(s: &str, what: &str) -> Result<()> {
    let bytes = hex::decode(s).map_err(|e| Error::Validation(format!("{what}: {e}")))?;
    if bytes.len() != 32 {
        return Err(Error::Validation(format!(
            "{what}: expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Connection-time options shared by the network-backed signers.
#[derive(Debug, Clone)]
pub struct SignerOptions {
    /// Deadline for operations waiting on external (human) approval.
    pub approval_timeout: Duration,
    /// Optional SOCKS5 proxy for the bunker relay connection.
    pub tor_socks: Option<String>,
    /// Where the bunker client keypair is persisted when the pairing secret
    /// is a short human-typed code.
    pub client_key_file: PathBuf,
    /// Open a browser tab automatically for the extension bridge.
    pub open_browser: bool,
}

impl Default for SignerOptions {
    fn default() -> Self {
        SignerOptions {
            approval_timeout: Duration::from_secs(120),
            tor_socks: None,
            client_key_file: PathBuf::from("shipstr-client.key"),
            open_browser: true,
        }
    }
}

/// A signing backend bound to one publish session.
pub enum SignerBackend {
    Local(LocalKeySigner),
    External(ExternalKeySigner),
    Bunker(RemoteBunkerSigner),
    Extension(BrowserExtensionSigner),
}

impl SignerBackend {
    /// Open the backend described by `desc`. Network-backed variants connect
    /// (and handshake) here; failures before I/O are validation errors.
    pub async fn open(
        desc: &SignerDescriptor,
        opts: &SignerOptions,
        cancel: &Cancel,
    ) -> Result<Self> {
        match desc {
            SignerDescriptor::Local { secret_key } => {
                Ok(SignerBackend::Local(LocalKeySigner::from_hex(secret_key)?))
            }
            SignerDescriptor::External { public_key } => Ok(SignerBackend::External(
                ExternalKeySigner::from_hex(public_key)?,
            )),
            SignerDescriptor::Bunker {
                remote_pubkey,
                relay_url,
                secret,
            } => {
                let signer =
                    RemoteBunkerSigner::connect(remote_pubkey, relay_url, secret, opts, cancel)
                        .await?;
                Ok(SignerBackend::Bunker(signer))
            }
            SignerDescriptor::Extension => {
                let signer = BrowserExtensionSigner::start(opts).await?;
                Ok(SignerBackend::Extension(signer))
            }
        }
    }

    /// The hex public key events will be attributed to. May block on a
    /// network round trip or human approval for the remote variants.
    pub async fn public_key(&mut self, cancel: &Cancel) -> Result<String> {
        match self {
            SignerBackend::Local(s) => Ok(s.public_key()),
            SignerBackend::External(s) => Ok(s.public_key()),
            SignerBackend::Bunker(s) => s.public_key(cancel).await,
            SignerBackend::Extension(s) => s.public_key(cancel).await,
        }
    }

    /// Sign one event in place: sets `pubkey`, `id`, and (except for the
    /// external variant) `sig`.
    pub async fn sign(&mut self, ev: &mut Event, cancel: &Cancel) -> Result<()> {
        match self {
            SignerBackend::Local(s) => s.sign(ev),
            SignerBackend::External(s) => s.sign(ev),
            SignerBackend::Bunker(s) => s.sign(ev, cancel).await,
            SignerBackend::Extension(s) => s.sign(ev, cancel).await,
        }
    }

    /// Whether this backend can sign an arbitrary event list in one approval.
    pub fn supports_batch(&self) -> bool {
        match self {
            SignerBackend::Local(_) | SignerBackend::External(_) | SignerBackend::Bunker(_) => {
                false
            }
            SignerBackend::Extension(_) => true,
        }
    }

    /// Sign a list of events under a single approval. Only valid for
    /// batch-capable backends.
    pub async fn sign_batch(&mut self, events: &mut [Event], cancel: &Cancel) -> Result<()> {
        match self {
            SignerBackend::Extension(s) => s.sign_batch(events, cancel).await,
            _ => Err(Error::Validation(
                "signer backend does not support batch signing".into(),
            )),
        }
    }

    /// Release held resources: close relay connections, tear down the
    /// loopback listener.
    pub async fn close(&mut self) {
        match self {
            SignerBackend::Local(_) | SignerBackend::External(_) => {}
            SignerBackend::Bunker(s) => s.close().await,
            SignerBackend::Extension(s) => s.close().await,
        }
    }
}
