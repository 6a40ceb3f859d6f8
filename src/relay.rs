//! Relay publish and query client.
//!
//! Each relay attempt is independently time-bounded and failures are folded
//! into per-relay results so one unreachable endpoint never blocks or
//! poisons its siblings. Nothing here retries within a single invocation;
//! idempotence comes from duplicate classification and the existing-asset
//! probe.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use url::Url;

use crate::error::{Error, Result};
use crate::event::{Event, KIND_ASSET};
use crate::eventset::EventSet;
use crate::session::Cancel;

/// Default per-relay operation deadline.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of publishing one event to one relay.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishResult {
    pub relay_url: String,
    pub success: bool,
    pub error: Option<String>,
    /// The relay reported it already held an identical event. Classified as
    /// success so idempotent re-runs stay quiet.
    pub is_duplicate: bool,
}

impl PublishResult {
    fn ok(relay_url: &str, is_duplicate: bool) -> Self {
        PublishResult {
            relay_url: relay_url.to_string(),
            success: true,
            error: None,
            is_duplicate,
        }
    }

    fn fail(relay_url: &str, error: String) -> Self {
        PublishResult {
            relay_url: relay_url.to_string(),
            success: false,
            error: Some(error),
            is_duplicate: false,
        }
    }
}

/// Per-relay results for one event set, grouped by logical event type.
#[derive(Debug, Clone, Default)]
pub struct EventSetReport {
    pub app: Vec<PublishResult>,
    pub release: Vec<PublishResult>,
    /// One result vector per asset, in asset order.
    pub assets: Vec<Vec<PublishResult>>,
}

impl EventSetReport {
    /// True when every (event, relay) pair succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.app.iter().all(|r| r.success)
            && self.release.iter().all(|r| r.success)
            && self.assets.iter().flatten().all(|r| r.success)
    }

    /// Relay URLs that failed for at least one event.
    pub fn failed_relays(&self) -> Vec<String> {
        let mut failed: Vec<String> = self
            .app
            .iter()
            .chain(self.release.iter())
            .chain(self.assets.iter().flatten())
            .filter(|r| !r.success)
            .map(|r| r.relay_url.clone())
            .collect();
        failed.sort();
        failed.dedup();
        failed
    }
}

/// Publishes and queries against a fixed list of relay endpoints.
pub struct RelayPublisher {
    relays: Vec<String>,
    tor_socks: Option<String>,
    timeout: Duration,
    verbose: bool,
}

impl RelayPublisher {
    pub fn new(relays: Vec<String>, tor_socks: Option<String>, timeout: Duration) -> Self {
        RelayPublisher {
            relays,
            tor_socks,
            timeout,
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Publish one event to every configured relay. Only cancellation turns
    /// into an `Err`; per-relay failures are reported in the results.
    pub async fn publish(&self, ev: &Event, cancel: &Cancel) -> Result<Vec<PublishResult>> {
        let mut results = vec![];
        for relay in &self.relays {
            let attempt = timeout(
                self.timeout,
                publish_once(relay, ev, self.tor_socks.as_deref()),
            );
            let result = tokio::select! {
                r = attempt => match r {
                    Ok(Ok(is_duplicate)) => PublishResult::ok(relay, is_duplicate),
                    Ok(Err(e)) => PublishResult::fail(relay, e.to_string()),
                    Err(_) => PublishResult::fail(
                        relay,
                        format!("timed out after {:?}", self.timeout),
                    ),
                },
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            if self.verbose {
                match (&result.success, &result.error) {
                    (true, _) if result.is_duplicate => {
                        eprintln!("[relay] {relay}: duplicate of {}", ev.id)
                    }
                    (true, _) => eprintln!("[relay] {relay}: accepted {}", ev.id),
                    (false, Some(e)) => eprintln!("[relay] {relay}: {e}"),
                    _ => {}
                }
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Publish the three logical groups of an event set. Each underlying
    /// publish is an independent, non-transactional relay operation.
    pub async fn publish_event_set(
        &self,
        set: &EventSet,
        cancel: &Cancel,
    ) -> Result<EventSetReport> {
        let mut report = EventSetReport {
            app: self.publish(&set.app, cancel).await?,
            ..Default::default()
        };
        report.release = self.publish(&set.release, cancel).await?;
        for asset in &set.assets {
            report.assets.push(self.publish(asset, cancel).await?);
        }
        Ok(report)
    }

    /// Query relays in order for an asset event matching both identifier and
    /// version, returning the first hit with its originating relay URL.
    ///
    /// The relay-side filter only uses the `#i` tag; the version (and the
    /// legacy `appid` identifier tag) are matched client-side since
    /// multi-letter tag filters are not portable across relays.
    pub async fn check_existing_asset(
        &self,
        identifier: &str,
        version: &str,
        cancel: &Cancel,
    ) -> Result<Option<(Event, String)>> {
        for relay in &self.relays {
            let attempt = timeout(
                self.timeout,
                query_asset(relay, identifier, version, self.tor_socks.as_deref()),
            );
            let found = tokio::select! {
                r = attempt => match r {
                    Ok(Ok(found)) => found,
                    Ok(Err(e)) => {
                        if self.verbose {
                            eprintln!("[relay] {relay}: query error: {e}");
                        }
                        None
                    }
                    Err(_) => None,
                },
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            if let Some(ev) = found {
                return Ok(Some((ev, relay.clone())));
            }
        }
        Ok(None)
    }
}

/// Send one EVENT and wait for the matching OK. Returns whether the relay
/// classified it as a duplicate.
async fn publish_once(relay: &str, ev: &Event, tor_socks: Option<&str>) -> Result<bool> {
    let mut ws = connect_ws(relay, tor_socks).await?;
    let msg = serde_json::json!(["EVENT", ev]);
    ws.send(Message::Text(msg.to_string()))
        .await
        .map_err(Error::transport)?;
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(Error::transport)?;
        match msg {
            Message::Text(txt) => {
                if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                    if let Some(arr) = val.as_array() {
                        if arr.first().and_then(|v| v.as_str()) == Some("OK")
                            && arr.get(1).and_then(|v| v.as_str()) == Some(ev.id.as_str())
                        {
                            let accepted =
                                arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
                            let reason = arr
                                .get(3)
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            let _ = ws.send(Message::Close(None)).await;
                            if accepted {
                                return Ok(reason.starts_with("duplicate:"));
                            }
                            return Err(Error::Transport(format!("relay rejected: {reason}")));
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(Error::Transport("connection closed before OK".into()))
}

/// Subscribe for kind 1063 events tagged with the identifier and scan until
/// EOSE for one whose version matches.
async fn query_asset(
    relay: &str,
    identifier: &str,
    version: &str,
    tor_socks: Option<&str>,
) -> Result<Option<Event>> {
    let mut ws = connect_ws(relay, tor_socks).await?;
    let sub_id = "shipstr-asset-check";
    let req = serde_json::json!([
        "REQ",
        sub_id,
        { "kinds": [KIND_ASSET], "#i": [identifier] }
    ]);
    ws.send(Message::Text(req.to_string()))
        .await
        .map_err(Error::transport)?;
    let mut found = None;
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(Error::transport)?;
        match msg {
            Message::Text(txt) => {
                if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                    if let Some(arr) = val.as_array() {
                        match arr.first().and_then(|v| v.as_str()) {
                            Some("EVENT") if arr.len() >= 3 => {
                                if let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) {
                                    if asset_matches(&ev, identifier, version)
                                        && found.is_none()
                                    {
                                        found = Some(ev);
                                    }
                                }
                            }
                            Some("EOSE") => break,
                            _ => {}
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    let _ = ws
        .send(Message::Text(
            serde_json::json!(["CLOSE", sub_id]).to_string(),
        ))
        .await;
    let _ = ws.send(Message::Close(None)).await;
    Ok(found)
}

/// Match an asset event against the identifier (current `i` or legacy
/// `appid` tag) and version.
fn asset_matches(ev: &Event, identifier: &str, version: &str) -> bool {
    let id_match = ev.tag_value("i") == Some(identifier)
        || ev.tag_value("appid") == Some(identifier);
    id_match && ev.tag_value("version") == Some(version)
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
pub(crate) async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay).map_err(|e| Error::Validation(format!("relay url: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Validation("relay url missing host".into()))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Validation("relay url missing port".into()))?;
    let req = relay.into_client_request().map_err(Error::transport)?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host.as_str(), port))
                .await
                .map_err(Error::transport)?,
        )
    } else {
        Box::new(
            TcpStream::connect((host.as_str(), port))
                .await
                .map_err(Error::transport)?,
        )
    };
    let (ws, _) = client_async(req, stream).await.map_err(Error::transport)?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
