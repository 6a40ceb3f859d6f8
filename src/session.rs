//! Publish-run orchestration: one `Session` owns the signer, the relay
//! publisher, and the blob uploader for an explicit open/close lifecycle.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

use crate::blossom::{BlossomClient, UploadOutcome};
use crate::builder::{build_app_metadata, build_asset, ReleaseBuilder};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::eventset::sign_event_set;
use crate::meta::{AppMetadata, AssetMetadata, ReleaseMetadata, WireFormat};
use crate::relay::{EventSetReport, RelayPublisher, DEFAULT_RELAY_TIMEOUT};
use crate::signer::{SignerBackend, SignerDescriptor, SignerOptions};

/// Cooperative cancellation token handed to every long-running operation.
///
/// Cancelling aborts in-flight awaits and tears down local listeners; it is
/// level-triggered, so operations started after the fact fail immediately.
#[derive(Debug, Clone)]
pub struct Cancel {
    rx: watch::Receiver<bool>,
    // keeps never() tokens alive; channel() tokens borrow the caller's sender
    _held: Option<Arc<watch::Sender<bool>>>,
}

impl Cancel {
    /// A token that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Cancel {
            rx,
            _held: Some(Arc::new(tx)),
        }
    }

    /// A token paired with its trigger. Send `true` to cancel.
    pub fn channel() -> (watch::Sender<bool>, Cancel) {
        let (tx, rx) = watch::channel(false);
        (tx, Cancel { rx, _held: None })
    }

    /// Resolve once cancellation is requested. Pends forever when the
    /// trigger is dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Hooks into a caller-maintained metadata cache. `commit` runs only after
/// a fully successful publish; `clear` runs on any failure so a re-run
/// starts from scratch. Both default to no-ops.
pub trait CacheHooks {
    fn commit(&mut self) {}
    fn clear(&mut self) {}
}

/// The default hook set for callers without a cache.
pub struct NoCache;

impl CacheHooks for NoCache {}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub signer: SignerDescriptor,
    pub signer_opts: SignerOptions,
    pub relays: Vec<String>,
    /// Content-addressed blob server; uploads are skipped when unset.
    pub blossom_server: Option<String>,
    pub relay_timeout: Duration,
    pub verbose: bool,
}

impl SessionConfig {
    pub fn new(signer: SignerDescriptor, relays: Vec<String>) -> Self {
        SessionConfig {
            signer,
            signer_opts: SignerOptions::default(),
            relays,
            blossom_server: None,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            verbose: false,
        }
    }
}

/// Input for one publish run: the three metadata layers plus the raw bytes
/// of each artifact (empty when the caller hosts the files elsewhere).
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub app: AppMetadata,
    pub release: ReleaseMetadata,
    pub assets: Vec<(AssetMetadata, Vec<u8>)>,
    /// Publish even when the asset already exists on a relay.
    pub force: bool,
}

/// What a publish run produced.
#[derive(Debug)]
pub enum PublishOutcome {
    /// A relay already carries this (identifier, version); nothing was
    /// built, signed, or published.
    AlreadyPublished { event: Event, relay_url: String },
    Published {
        uploads: Vec<UploadOutcome>,
        report: EventSetReport,
    },
}

pub struct Session {
    signer: SignerBackend,
    publisher: RelayPublisher,
    uploader: Option<BlossomClient>,
    cancel: Cancel,
    verbose: bool,
}

impl Session {
    /// Connect the signer backend and set up the publisher and uploader.
    pub async fn open(config: SessionConfig, cancel: Cancel) -> Result<Self> {
        if config.relays.is_empty() {
            return Err(Error::Validation("no relays configured".into()));
        }
        let signer = SignerBackend::open(&config.signer, &config.signer_opts, &cancel).await?;
        let publisher = RelayPublisher::new(
            config.relays,
            config.signer_opts.tor_socks.clone(),
            config.relay_timeout,
        )
        .verbose(config.verbose);
        let uploader = match &config.blossom_server {
            Some(server) => Some(BlossomClient::new(server)?),
            None => None,
        };
        Ok(Session {
            signer,
            publisher,
            uploader,
            cancel,
            verbose: config.verbose,
        })
    }

    /// The public key events will be attributed to.
    pub async fn public_key(&mut self) -> Result<String> {
        let cancel = self.cancel.clone();
        self.signer.public_key(&cancel).await
    }

    /// Query configured relays for an already-published asset.
    pub async fn check_existing_asset(
        &self,
        identifier: &str,
        version: &str,
    ) -> Result<Option<(Event, String)>> {
        self.publisher
            .check_existing_asset(identifier, version, &self.cancel)
            .await
    }

    /// Run one full publish: idempotency check, uploads, event construction,
    /// signing, relay publish. Cache hooks fire on the way out: `commit`
    /// only when every relay accepted every event, `clear` otherwise.
    pub async fn publish(
        &mut self,
        request: PublishRequest,
        hooks: &mut dyn CacheHooks,
    ) -> Result<PublishOutcome> {
        match self.publish_inner(request).await {
            Ok(outcome) => {
                let committed = match &outcome {
                    PublishOutcome::AlreadyPublished { .. } => true,
                    PublishOutcome::Published { report, .. } => report.all_succeeded(),
                };
                if committed {
                    hooks.commit();
                } else {
                    hooks.clear();
                }
                Ok(outcome)
            }
            Err(e) => {
                hooks.clear();
                Err(e)
            }
        }
    }

    async fn publish_inner(&mut self, request: PublishRequest) -> Result<PublishOutcome> {
        let PublishRequest {
            app,
            release,
            assets,
            force,
        } = request;

        let probe_id = assets
            .first()
            .map(|(meta, _)| {
                if meta.identifier.is_empty() {
                    app.identifier.as_str()
                } else {
                    meta.identifier.as_str()
                }
            })
            .unwrap_or(app.identifier.as_str())
            .to_string();
        if !force {
            if let Some((event, relay_url)) = self
                .publisher
                .check_existing_asset(&probe_id, &release.version, &self.cancel)
                .await?
            {
                if self.verbose {
                    eprintln!(
                        "[session] {probe_id} {} already on {relay_url}, skipping",
                        release.version
                    );
                }
                return Ok(PublishOutcome::AlreadyPublished { event, relay_url });
            }
        }

        let format = if app.legacy_format {
            WireFormat::Legacy
        } else {
            WireFormat::Current
        };
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Validation(format!("clock: {e}")))?
            .as_secs();

        let mut uploads = Vec::new();
        let mut asset_events = Vec::with_capacity(assets.len());
        for (mut meta, bytes) in assets {
            if !bytes.is_empty() {
                let uploader = self.uploader.as_ref().ok_or_else(|| {
                    Error::Validation("asset bytes given but no blob server configured".into())
                })?;
                let outcome = uploader
                    .upload_with_signer(bytes, &meta.sha256, &mut self.signer, &self.cancel)
                    .await?;
                if self.verbose {
                    let how = if outcome.existed { "present" } else { "uploaded" };
                    eprintln!("[session] {}: {how} at {}", meta.filename, outcome.url);
                }
                if !meta.download_urls.contains(&outcome.url) {
                    meta.download_urls.insert(0, outcome.url.clone());
                }
                uploads.push(outcome);
            }
            asset_events.push(build_asset(&meta, &app.identifier, format, created_at));
        }

        let app_event = build_app_metadata(&app, format, created_at);
        let release_builder = ReleaseBuilder::new(release, format, created_at);
        let relay_hint = self.publisher.relays().first().cloned();
        let set = sign_event_set(
            &mut self.signer,
            app_event,
            release_builder,
            asset_events,
            relay_hint,
            &self.cancel,
        )
        .await?;
        let report = self.publisher.publish_event_set(&set, &self.cancel).await?;
        Ok(PublishOutcome::Published { uploads, report })
    }

    /// Release signer resources. Safe to call once; dropping without
    /// closing leaks nothing but may leave a bunker pairing dangling.
    pub async fn close(mut self) {
        self.signer.close().await;
    }
}
