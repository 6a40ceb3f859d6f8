//! Content-addressed upload client.
//!
//! Uploads are idempotent: every transfer is preceded by an existence probe
//! against `HEAD {server}/{sha256}`, and a blob the server already holds is
//! never re-sent. Authorization is a signed kind 24242 event carried
//! base64-encoded in the `Authorization` header.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::sync::{Mutex, Semaphore};
use url::Url;

use crate::builder::{build_upload_auth, UPLOAD_AUTH_TTL};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::session::Cancel;
use crate::signer::SignerBackend;

/// Default bound on concurrent existence probes.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 4;

/// Result of one upload attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    /// Canonical URL of the blob on the server.
    pub url: String,
    pub size: u64,
    /// The server already held the blob; zero bytes were transferred.
    pub existed: bool,
}

/// Client for one content-addressed blob server.
#[derive(Clone)]
pub struct BlossomClient {
    server: Url,
    http: reqwest::Client,
    probe_concurrency: usize,
}

impl BlossomClient {
    pub fn new(server: &str) -> Result<Self> {
        let server =
            Url::parse(server).map_err(|e| Error::Validation(format!("blossom url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(Error::transport)?;
        Ok(BlossomClient {
            server,
            http,
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
        })
    }

    pub fn probe_concurrency(mut self, n: usize) -> Self {
        self.probe_concurrency = n.max(1);
        self
    }

    fn blob_url(&self, sha256: &str) -> String {
        format!("{}/{sha256}", self.server.as_str().trim_end_matches('/'))
    }

    fn upload_url(&self) -> String {
        format!("{}/upload", self.server.as_str().trim_end_matches('/'))
    }

    /// Probe whether the server already holds the blob. A failed probe is
    /// conservatively reported as absent, forcing a re-upload rather than
    /// risking silent data loss.
    pub async fn exists(&self, sha256: &str) -> bool {
        match self.http.head(self.blob_url(sha256)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Probe a batch of hashes with bounded concurrency.
    pub async fn exists_batch(
        &self,
        hashes: &[String],
        cancel: &Cancel,
    ) -> Result<HashMap<String, bool>> {
        let semaphore = Arc::new(Semaphore::new(self.probe_concurrency));
        let results = Arc::new(Mutex::new(HashMap::with_capacity(hashes.len())));
        let mut handles = vec![];
        for hash in hashes.iter().cloned() {
            let client = self.clone();
            let semaphore = semaphore.clone();
            let results = results.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                let present = client.exists(&hash).await;
                results.lock().await.insert(hash, present);
            }));
        }
        for handle in handles {
            tokio::select! {
                r = handle => r.map_err(Error::transport)?,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
        let map = Arc::try_unwrap(results)
            .map_err(|_| Error::Transport("probe workers still running".into()))?
            .into_inner();
        Ok(map)
    }

    /// Upload bytes under a pre-signed authorization event. Probes first and
    /// short-circuits with `existed=true` when the blob is already present.
    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        sha256: &str,
        auth: &Event,
        cancel: &Cancel,
    ) -> Result<UploadOutcome> {
        let size = bytes.len() as u64;
        if self.exists(sha256).await {
            return Ok(UploadOutcome {
                url: self.blob_url(sha256),
                size,
                existed: true,
            });
        }
        let auth_json = serde_json::to_vec(auth)
            .map_err(|e| Error::Validation(format!("auth event: {e}")))?;
        let header = format!("Nostr {}", BASE64.encode(auth_json));
        let request = self
            .http
            .put(self.upload_url())
            .header("Authorization", header)
            .body(bytes)
            .send();
        let resp = tokio::select! {
            r = request => r.map_err(Error::transport)?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        if !resp.status().is_success() {
            return Err(Error::Transport(format!(
                "upload rejected: HTTP {}",
                resp.status()
            )));
        }
        // Blossom servers answer with a blob descriptor; fall back to the
        // canonical blob URL when the body is not one.
        let url = match resp.json::<serde_json::Value>().await {
            Ok(desc) => desc
                .get("url")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| self.blob_url(sha256)),
            Err(_) => self.blob_url(sha256),
        };
        Ok(UploadOutcome {
            url,
            size,
            existed: false,
        })
    }

    /// Upload with a freshly built and signed authorization event scoped to
    /// this hash.
    pub async fn upload_with_signer(
        &self,
        bytes: Vec<u8>,
        sha256: &str,
        signer: &mut SignerBackend,
        cancel: &Cancel,
    ) -> Result<UploadOutcome> {
        // skip the signer round trip entirely when the blob already exists
        if self.exists(sha256).await {
            return Ok(UploadOutcome {
                url: self.blob_url(sha256),
                size: bytes.len() as u64,
                existed: true,
            });
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Validation(format!("clock: {e}")))?
            .as_secs();
        let mut auth = build_upload_auth(sha256, now, UPLOAD_AUTH_TTL);
        signer.sign(&mut auth, cancel).await?;
        self.upload(bytes, sha256, &auth, cancel).await
    }
}
