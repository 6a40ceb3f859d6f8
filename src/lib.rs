//! Signed software-release attestations over Nostr: deterministic event
//! construction for app, release, and file-asset metadata, a polymorphic
//! signer (local key, external key, remote bunker, browser extension),
//! content-addressed artifact upload, and per-relay publish reporting.

pub mod blossom;
pub mod builder;
pub mod config;
pub mod error;
pub mod event;
pub mod eventset;
pub mod meta;
pub mod relay;
pub mod session;
pub mod signer;

pub use error::{Error, Result};
pub use event::Event;
pub use eventset::EventSet;
pub use meta::{AppMetadata, AssetMetadata, Channel, ReleaseMetadata, WireFormat};
pub use relay::{EventSetReport, PublishResult};
pub use session::{Cancel, PublishOutcome, PublishRequest, Session, SessionConfig};
pub use signer::{SignerBackend, SignerDescriptor, SignerOptions};
