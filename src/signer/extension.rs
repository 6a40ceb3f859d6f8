//! Browser-extension bridge signer.
//!
//! Runs a loopback-only HTTP server and opens a browser tab whose page
//! delegates to an in-browser key-management extension (`window.nostr`).
//! The page polls `GET /api/state` and posts results back; every
//! state-mutating request must carry the per-session nonce and a matching
//! `Origin` header, and returned signatures are independently re-verified
//! before they unblock the waiting caller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::RngCore;
use secp256k1::XOnlyPublicKey;
use serde::Deserialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::event::{event_hash, verify_event, Event};
use crate::session::Cancel;
use crate::signer::SignerOptions;

/// Bridge request state; at most one request is outstanding at a time.
enum Mode {
    Idle,
    RequestingPublicKey,
    Signing(Vec<Event>),
    Failed(String),
}

impl Mode {
    fn label(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::RequestingPublicKey => "requesting-public-key",
            Mode::Signing(_) => "signing",
            Mode::Failed(_) => "failed",
        }
    }
}

enum Reply {
    PublicKey(String),
    Signed(Vec<Event>),
}

struct Bridge {
    mode: Mode,
    established_pubkey: Option<String>,
    reply: Option<oneshot::Sender<Reply>>,
}

#[derive(Clone)]
struct BridgeState {
    bridge: Arc<Mutex<Bridge>>,
    nonce: String,
    origin: String,
    shutdown: watch::Sender<bool>,
}

/// Signer delegating to a browser extension through a loopback HTTP bridge.
///
/// This is the only backend with batch capability: an arbitrary list of
/// events is signed under one user approval.
pub struct BrowserExtensionSigner {
    addr: SocketAddr,
    state: BridgeState,
    server: Option<tokio::task::JoinHandle<()>>,
    approval_timeout: Duration,
}

impl BrowserExtensionSigner {
    /// Bind the loopback server and (unless disabled) open a browser tab
    /// pointing at it.
    pub async fn start(opts: &SignerOptions) -> Result<Self> {
        // loopback only; the bridge must never be reachable off-host
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(Error::transport)?;
        let addr = listener.local_addr().map_err(Error::transport)?;

        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = BridgeState {
            bridge: Arc::new(Mutex::new(Bridge {
                mode: Mode::Idle,
                established_pubkey: None,
                reply: None,
            })),
            nonce: hex::encode(nonce_bytes),
            origin: format!("http://{addr}"),
            shutdown,
        };

        let app = Router::new()
            .route("/", get(bootstrap))
            .route("/api/state", get(api_state))
            .route("/api/shutdown", get(api_shutdown))
            .route("/public-key", post(post_public_key))
            .route("/signed-events", post(post_signed_events))
            .with_state(state.clone());
        let mut rx = shutdown_rx;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await;
        });

        let signer = BrowserExtensionSigner {
            addr,
            state,
            server: Some(server),
            approval_timeout: opts.approval_timeout,
        };
        if opts.open_browser {
            signer.open_tab();
        }
        Ok(signer)
    }

    /// The bridge's loopback address, for tests and manual opening.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Best-effort launch of the default browser at the bridge page.
    fn open_tab(&self) {
        let url = format!("http://{}/", self.addr);
        #[cfg(target_os = "macos")]
        let opener = "open";
        #[cfg(not(target_os = "macos"))]
        let opener = "xdg-open";
        if std::process::Command::new(opener).arg(&url).spawn().is_err() {
            eprintln!("[bridge] open {url} in a browser with a Nostr extension");
        }
    }

    /// Request the extension's public key. Blocks until the browser posts it
    /// back, the approval timeout elapses, or the caller cancels.
    pub async fn public_key(&mut self, cancel: &Cancel) -> Result<String> {
        {
            let bridge = self.state.bridge.lock().await;
            if let Some(pk) = &bridge.established_pubkey {
                return Ok(pk.clone());
            }
        }
        let rx = self.begin(Mode::RequestingPublicKey).await?;
        match self.wait(rx, cancel).await? {
            Reply::PublicKey(pk) => Ok(pk),
            Reply::Signed(_) => Err(Error::SignatureRejected(
                "bridge answered the wrong request".into(),
            )),
        }
    }

    pub async fn sign(&mut self, ev: &mut Event, cancel: &Cancel) -> Result<()> {
        let mut batch = vec![std::mem::replace(
            ev,
            Event::unsigned(0, 0, vec![], String::new()),
        )];
        let result = self.sign_batch(&mut batch, cancel).await;
        *ev = batch.pop().expect("batch of one");
        result
    }

    /// Sign an arbitrary list of events under one approval.
    pub async fn sign_batch(&mut self, events: &mut [Event], cancel: &Cancel) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        // the pubkey must be established first so returned events can be
        // checked against it
        let pubkey = self.public_key(cancel).await?;
        let mut outgoing = events.to_vec();
        for ev in outgoing.iter_mut() {
            ev.pubkey = pubkey.clone();
            ev.finalize_id()?;
        }
        let rx = self.begin(Mode::Signing(outgoing)).await?;
        match self.wait(rx, cancel).await? {
            Reply::Signed(signed) => {
                for (slot, ev) in events.iter_mut().zip(signed.into_iter()) {
                    *slot = ev;
                }
                Ok(())
            }
            Reply::PublicKey(_) => Err(Error::SignatureRejected(
                "bridge answered the wrong request".into(),
            )),
        }
    }

    /// Move Idle → `mode` and register the reply channel.
    async fn begin(&self, mode: Mode) -> Result<oneshot::Receiver<Reply>> {
        let mut bridge = self.state.bridge.lock().await;
        match bridge.mode {
            Mode::Idle | Mode::Failed(_) => {}
            _ => {
                return Err(Error::Validation(
                    "a bridge request is already outstanding".into(),
                ))
            }
        }
        let (tx, rx) = oneshot::channel();
        bridge.mode = mode;
        bridge.reply = Some(tx);
        Ok(rx)
    }

    async fn wait(&mut self, rx: oneshot::Receiver<Reply>, cancel: &Cancel) -> Result<Reply> {
        let outcome = tokio::select! {
            r = timeout(self.approval_timeout, rx) => match r {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(Error::Transport("bridge closed".into())),
                Err(_) => Err(Error::Timeout(format!(
                    "no browser approval within {:?}",
                    self.approval_timeout
                ))),
            },
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        match &outcome {
            Err(Error::Cancelled) => {
                // cancellation must not leave a dangling socket
                self.close().await;
            }
            Err(e) => {
                let mut bridge = self.state.bridge.lock().await;
                bridge.mode = Mode::Failed(e.to_string());
                bridge.reply = None;
            }
            Ok(_) => {}
        }
        outcome
    }

    /// Tear down the loopback listener.
    pub async fn close(&mut self) {
        let _ = self.state.shutdown.send(true);
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
    }
}

async fn bootstrap() -> Html<&'static str> {
    Html(BOOTSTRAP_HTML)
}

#[derive(serde::Serialize)]
struct StateBody {
    mode: &'static str,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    events: Option<Vec<Event>>,
}

async fn api_state(State(state): State<BridgeState>) -> Json<StateBody> {
    let bridge = state.bridge.lock().await;
    let events = match &bridge.mode {
        Mode::Signing(events) => Some(events.clone()),
        _ => None,
    };
    Json(StateBody {
        mode: bridge.mode.label(),
        nonce: state.nonce.clone(),
        events,
    })
}

async fn api_shutdown(State(state): State<BridgeState>) -> &'static str {
    let _ = state.shutdown.send(true);
    "ok"
}

/// Nonce and Origin gate for state-mutating requests.
fn authorize(state: &BridgeState, headers: &HeaderMap, nonce: &str) -> std::result::Result<(), (StatusCode, String)> {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if origin != state.origin {
        return Err((StatusCode::FORBIDDEN, "origin mismatch".into()));
    }
    if nonce != state.nonce {
        return Err((StatusCode::FORBIDDEN, "bad nonce".into()));
    }
    Ok(())
}

#[derive(Deserialize)]
struct PublicKeyBody {
    nonce: String,
    pubkey: String,
}

async fn post_public_key(
    State(state): State<BridgeState>,
    headers: HeaderMap,
    Json(body): Json<PublicKeyBody>,
) -> (StatusCode, String) {
    if let Err((code, msg)) = authorize(&state, &headers, &body.nonce) {
        return (code, msg);
    }
    let valid = hex::decode(&body.pubkey)
        .ok()
        .and_then(|b| XOnlyPublicKey::from_slice(&b).ok())
        .is_some();
    if !valid {
        return (StatusCode::BAD_REQUEST, "invalid pubkey".into());
    }
    let mut bridge = state.bridge.lock().await;
    if !matches!(bridge.mode, Mode::RequestingPublicKey) {
        return (StatusCode::CONFLICT, "no public key request pending".into());
    }
    bridge.established_pubkey = Some(body.pubkey.clone());
    bridge.mode = Mode::Idle;
    if let Some(tx) = bridge.reply.take() {
        let _ = tx.send(Reply::PublicKey(body.pubkey));
    }
    (StatusCode::OK, "ok".into())
}

#[derive(Deserialize)]
struct SignedEventsBody {
    nonce: String,
    events: Vec<Event>,
}

async fn post_signed_events(
    State(state): State<BridgeState>,
    headers: HeaderMap,
    Json(body): Json<SignedEventsBody>,
) -> (StatusCode, String) {
    if let Err((code, msg)) = authorize(&state, &headers, &body.nonce) {
        return (code, msg);
    }
    let mut bridge = state.bridge.lock().await;
    let expected = match &bridge.mode {
        Mode::Signing(expected) => expected,
        _ => return (StatusCode::CONFLICT, "no signing request pending".into()),
    };
    // The whole batch is rejected on any mismatch, and a rejection leaves
    // the pending wait blocked so a correct retry can still succeed.
    if let Err(reason) = check_batch(expected, &body.events, bridge.established_pubkey.as_deref())
    {
        return (StatusCode::BAD_REQUEST, reason);
    }
    bridge.mode = Mode::Idle;
    if let Some(tx) = bridge.reply.take() {
        let _ = tx.send(Reply::Signed(body.events));
    }
    (StatusCode::OK, "ok".into())
}

/// Independently re-verify a returned batch: count, unsigned-field
/// equality, pubkey continuity, re-derived id, and Schnorr signature.
fn check_batch(
    expected: &[Event],
    returned: &[Event],
    established: Option<&str>,
) -> std::result::Result<(), String> {
    if returned.len() != expected.len() {
        return Err(format!(
            "expected {} signed events, got {}",
            expected.len(),
            returned.len()
        ));
    }
    for (i, (want, got)) in expected.iter().zip(returned.iter()).enumerate() {
        if let Some(pk) = established {
            if got.pubkey != pk {
                return Err(format!("event #{i}: pubkey differs from established key"));
            }
        }
        if got.kind != want.kind
            || got.created_at != want.created_at
            || got.tags != want.tags
            || got.content != want.content
        {
            return Err(format!("event #{i}: unsigned fields were altered"));
        }
        let derived = match event_hash(got) {
            Ok(h) => hex::encode(h),
            Err(e) => return Err(format!("event #{i}: {e}")),
        };
        if derived != got.id {
            return Err(format!("event #{i}: id does not match its fields"));
        }
        if let Err(e) = verify_event(got) {
            return Err(format!("event #{i}: {e}"));
        }
    }
    Ok(())
}

const BOOTSTRAP_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>shipstr signing bridge</title></head>
<body>
<h1>shipstr signing bridge</h1>
<p id="status">Waiting for a request…</p>
<script>
async function post(path, body) {
  return fetch(path, {
    method: "POST",
    headers: {"Content-Type": "application/json"},
    body: JSON.stringify(body),
  });
}
async function tick() {
  const st = await (await fetch("/api/state")).json();
  const el = document.getElementById("status");
  if (!window.nostr) { el.textContent = "No Nostr extension found."; return; }
  if (st.mode === "requesting-public-key") {
    el.textContent = "Approving public key request…";
    const pubkey = await window.nostr.getPublicKey();
    await post("/public-key", {nonce: st.nonce, pubkey});
  } else if (st.mode === "signing") {
    el.textContent = "Signing " + st.events.length + " event(s)…";
    const events = [];
    for (const ev of st.events) {
      events.push(await window.nostr.signEvent(ev));
    }
    await post("/signed-events", {nonce: st.nonce, events});
  } else {
    el.textContent = "Idle. Leave this tab open while publishing.";
  }
}
setInterval(tick, 1000);
</script>
</body>
</html>
"#;
