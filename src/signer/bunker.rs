//! Remote "bunker" signer reached over a relay-mediated RPC channel.
//!
//! Requests are kind 24133 events whose content is an encrypted JSON-RPC
//! payload `{id, method, params}`. The payload key is derived by secp256k1
//! ECDH between the local client key and the bunker's key, and sealed with
//! ChaCha20-Poly1305, framed as `base64(nonce || ciphertext)`.

use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{All, Keypair, Message, Parity, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use serde_json::Value;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};
use crate::event::{event_hash, verify_event, Event, Tag, KIND_BUNKER_RPC};
use crate::relay::{connect_ws, AsyncReadWrite};
use crate::session::Cancel;
use crate::signer::SignerOptions;

/// Pairing secrets shorter than this are treated as human-typed one-time
/// codes; the pairing binds to the client keypair, so it must be persisted.
const LOW_ENTROPY_SECRET_LEN: usize = 16;

const SUB_ID: &str = "bunker";

/// Signer that forwards every operation to an out-of-process bunker via a
/// relay. Operations may block pending human approval on the bunker side.
pub struct RemoteBunkerSigner {
    secp: Secp256k1<All>,
    client: Keypair,
    client_pubkey: String,
    remote_pubkey: String,
    shared_key: [u8; 32],
    ws: WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>,
    approval_timeout: Duration,
    next_id: u64,
    user_pubkey: Option<String>,
}

impl RemoteBunkerSigner {
    /// Connect to the bunker's relay, subscribe for responses, and perform
    /// the `connect` handshake (shared secret + requested permission scope).
    pub async fn connect(
        remote_pubkey: &str,
        relay_url: &str,
        secret: &str,
        opts: &SignerOptions,
        cancel: &Cancel,
    ) -> Result<Self> {
        let secp = Secp256k1::new();
        let client = client_keypair(&secp, secret, &opts.client_key_file)?;
        let client_pubkey = hex::encode(client.x_only_public_key().0.serialize());
        let shared_key = derive_shared_key(&client, remote_pubkey)?;

        let mut ws = connect_ws(relay_url, opts.tor_socks.as_deref()).await?;
        let req = serde_json::json!([
            "REQ",
            SUB_ID,
            { "kinds": [KIND_BUNKER_RPC], "#p": [client_pubkey] }
        ]);
        ws.send(WsMessage::Text(req.to_string()))
            .await
            .map_err(Error::transport)?;

        let mut signer = RemoteBunkerSigner {
            secp,
            client,
            client_pubkey,
            remote_pubkey: remote_pubkey.to_string(),
            shared_key,
            ws,
            approval_timeout: opts.approval_timeout,
            next_id: 0,
            user_pubkey: None,
        };
        let params = serde_json::json!([remote_pubkey, secret, "get_public_key,sign_event"]);
        match signer.rpc("connect", params, cancel).await {
            Ok(_) => Ok(signer),
            // reconnecting with an existing pairing is idempotent
            Err(Error::Transport(msg)) if msg.contains("already connected") => Ok(signer),
            Err(e) => Err(e),
        }
    }

    /// Ask the bunker for the user's public key (cached after the first
    /// round trip).
    pub async fn public_key(&mut self, cancel: &Cancel) -> Result<String> {
        if let Some(pk) = &self.user_pubkey {
            return Ok(pk.clone());
        }
        let result = self
            .rpc("get_public_key", serde_json::json!([]), cancel)
            .await?;
        let pk = result
            .as_str()
            .ok_or_else(|| Error::Transport("bunker returned a non-string pubkey".into()))?
            .to_string();
        hex::decode(&pk)
            .ok()
            .and_then(|b| XOnlyPublicKey::from_slice(&b).ok())
            .ok_or_else(|| Error::SignatureRejected("bunker returned an invalid pubkey".into()))?;
        self.user_pubkey = Some(pk.clone());
        Ok(pk)
    }

    /// Sign one event through the bunker. The returned event is re-verified
    /// locally before it replaces the input.
    pub async fn sign(&mut self, ev: &mut Event, cancel: &Cancel) -> Result<()> {
        let pubkey = self.public_key(cancel).await?;
        ev.pubkey = pubkey.clone();
        ev.finalize_id()?;
        let param = serde_json::to_string(ev)
            .map_err(|e| Error::Validation(format!("event serialization: {e}")))?;
        let result = self
            .rpc("sign_event", serde_json::json!([param]), cancel)
            .await?;
        let signed: Event = match &result {
            Value::String(json) => serde_json::from_str(json)
                .map_err(|e| Error::SignatureRejected(format!("bunker response: {e}")))?,
            other => serde_json::from_value(other.clone())
                .map_err(|e| Error::SignatureRejected(format!("bunker response: {e}")))?,
        };
        if signed.pubkey != pubkey {
            return Err(Error::SignatureRejected(
                "bunker signed with an unexpected key".into(),
            ));
        }
        verify_event(&signed)?;
        *ev = signed;
        Ok(())
    }

    /// Close the relay connection.
    pub async fn close(&mut self) {
        let _ = self
            .ws
            .send(WsMessage::Text(
                serde_json::json!(["CLOSE", SUB_ID]).to_string(),
            ))
            .await;
        let _ = self.ws.send(WsMessage::Close(None)).await;
    }

    /// One encrypted request/response round trip.
    async fn rpc(&mut self, method: &str, params: Value, cancel: &Cancel) -> Result<Value> {
        self.next_id += 1;
        let rpc_id = format!("shipstr-{}", self.next_id);
        let payload = serde_json::json!({ "id": rpc_id, "method": method, "params": params });
        let content = seal(&self.shared_key, payload.to_string().as_bytes())?;
        let mut request = Event::unsigned(
            KIND_BUNKER_RPC,
            now(),
            vec![Tag::new(["p", self.remote_pubkey.as_str()])],
            content,
        );
        self.sign_with_client_key(&mut request)?;
        self.ws
            .send(WsMessage::Text(
                serde_json::json!(["EVENT", request]).to_string(),
            ))
            .await
            .map_err(Error::transport)?;

        let deadline = tokio::time::sleep(self.approval_timeout);
        tokio::pin!(deadline);
        loop {
            let msg = tokio::select! {
                m = self.ws.next() => m,
                _ = &mut deadline => {
                    return Err(Error::Timeout(format!(
                        "bunker did not answer {method} within {:?}",
                        self.approval_timeout
                    )))
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            let msg = match msg {
                Some(m) => m.map_err(Error::transport)?,
                None => return Err(Error::Transport("relay connection closed".into())),
            };
            let txt = match msg {
                WsMessage::Text(txt) => txt,
                WsMessage::Close(_) => {
                    return Err(Error::Transport("relay connection closed".into()))
                }
                _ => continue,
            };
            let Ok(val) = serde_json::from_str::<Value>(&txt) else {
                continue;
            };
            let Some(arr) = val.as_array() else { continue };
            if arr.first().and_then(|v| v.as_str()) != Some("EVENT") || arr.len() < 3 {
                continue;
            }
            let Ok(response) = serde_json::from_value::<Event>(arr[2].clone()) else {
                continue;
            };
            if response.kind != KIND_BUNKER_RPC || response.pubkey != self.remote_pubkey {
                continue;
            }
            verify_event(&response)?;
            let plain = open_sealed(&self.shared_key, &response.content)?;
            let Ok(body) = serde_json::from_slice::<Value>(&plain) else {
                continue;
            };
            if body.get("id").and_then(|v| v.as_str()) != Some(rpc_id.as_str()) {
                continue;
            }
            if let Some(err) = body.get("error").and_then(|v| v.as_str()) {
                if !err.is_empty() {
                    return Err(Error::Transport(format!("bunker error: {err}")));
                }
            }
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    fn sign_with_client_key(&self, ev: &mut Event) -> Result<()> {
        ev.pubkey = self.client_pubkey.clone();
        let hash = event_hash(ev)?;
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash)
            .map_err(|e| Error::Validation(format!("digest: {e}")))?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.client);
        ev.sig = hex::encode(sig.as_ref());
        Ok(())
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Load or create the client keypair according to the pairing-secret
/// entropy policy: a short human-typed code binds the pairing to one client
/// key (persist and reuse); a long bearer-style secret gets a fresh
/// ephemeral key per run for unlinkability.
fn client_keypair(secp: &Secp256k1<All>, secret: &str, key_file: &Path) -> Result<Keypair> {
    if secret.len() < LOW_ENTROPY_SECRET_LEN {
        if key_file.exists() {
            let hex_key = std::fs::read_to_string(key_file)
                .map_err(|e| Error::Validation(format!("client key file: {e}")))?;
            let bytes = hex::decode(hex_key.trim())
                .map_err(|e| Error::Validation(format!("client key file: {e}")))?;
            let sk = SecretKey::from_slice(&bytes)
                .map_err(|e| Error::Validation(format!("client key file: {e}")))?;
            return Ok(normalized_keypair(secp, sk));
        }
        let kp = normalized_keypair(secp, SecretKey::new(&mut rand::thread_rng()));
        std::fs::write(key_file, hex::encode(kp.secret_key().secret_bytes()))
            .map_err(|e| Error::Validation(format!("client key file: {e}")))?;
        return Ok(kp);
    }
    Ok(normalized_keypair(secp, SecretKey::new(&mut rand::thread_rng())))
}

/// Force the keypair's public key to even parity so x-only ECDH agrees with
/// a peer reconstructing the point from the 32-byte serialization.
fn normalized_keypair(secp: &Secp256k1<All>, sk: SecretKey) -> Keypair {
    let kp = Keypair::from_secret_key(secp, &sk);
    if kp.x_only_public_key().1 == Parity::Odd {
        Keypair::from_secret_key(secp, &sk.negate())
    } else {
        kp
    }
}

fn derive_shared_key(client: &Keypair, remote_pubkey: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(remote_pubkey)
        .map_err(|e| Error::Validation(format!("bunker pubkey: {e}")))?;
    let xonly = XOnlyPublicKey::from_slice(&bytes)
        .map_err(|e| Error::Validation(format!("bunker pubkey: {e}")))?;
    let remote = PublicKey::from_x_only_public_key(xonly, Parity::Even);
    let shared = SharedSecret::new(&remote, &client.secret_key());
    Ok(shared.secret_bytes())
}

/// Encrypt to `base64(nonce || ciphertext)`.
fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<String> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Validation(format!("encryption: {e}")))?;
    let mut framed = Vec::with_capacity(12 + ciphertext.len());
    framed.extend_from_slice(&nonce_bytes);
    framed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(framed))
}

/// Inverse of [`seal`].
fn open_sealed(key: &[u8; 32], framed: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(framed)
        .map_err(|e| Error::SignatureRejected(format!("rpc payload: {e}")))?;
    if bytes.len() < 12 {
        return Err(Error::SignatureRejected("rpc payload too short".into()));
    }
    let (nonce_bytes, ciphertext) = bytes.split_at(12);
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::SignatureRejected("rpc payload failed authentication".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_ASSET;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_tungstenite::accept_async;

    /// A mock relay and bunker rolled into one WebSocket endpoint.
    struct MockBunker {
        remote: Keypair,
        user: Keypair,
        secp: Secp256k1<All>,
        /// Answer the first connect with "already connected".
        claim_already_connected: bool,
        saw_connect: Arc<AtomicBool>,
    }

    impl MockBunker {
        fn new(claim_already_connected: bool) -> Self {
            let secp = Secp256k1::new();
            MockBunker {
                remote: normalized_keypair(&secp, SecretKey::from_slice(&[9u8; 32]).unwrap()),
                user: normalized_keypair(&secp, SecretKey::from_slice(&[7u8; 32]).unwrap()),
                secp,
                claim_already_connected,
                saw_connect: Arc::new(AtomicBool::new(false)),
            }
        }

        fn remote_pubkey(&self) -> String {
            hex::encode(self.remote.x_only_public_key().0.serialize())
        }

        fn user_pubkey(&self) -> String {
            hex::encode(self.user.x_only_public_key().0.serialize())
        }

        fn sign(&self, kp: &Keypair, ev: &mut Event) {
            ev.pubkey = hex::encode(kp.x_only_public_key().0.serialize());
            let hash = event_hash(ev).unwrap();
            ev.id = hex::encode(hash);
            let msg = Message::from_digest_slice(&hash).unwrap();
            let sig = self.secp.sign_schnorr_no_aux_rand(&msg, kp);
            ev.sig = hex::encode(sig.as_ref());
        }

        async fn serve(self: Arc<Self>) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let mut ws = accept_async(stream).await.unwrap();
                        while let Some(Ok(msg)) = ws.next().await {
                            let WsMessage::Text(txt) = msg else { continue };
                            let val: Value = match serde_json::from_str(&txt) {
                                Ok(v) => v,
                                Err(_) => continue,
                            };
                            if val[0] == "REQ" {
                                continue;
                            }
                            if val[0] != "EVENT" {
                                continue;
                            }
                            let request: Event =
                                serde_json::from_value(val[1].clone()).unwrap();
                            // key agreement from the bunker's side
                            let client_xonly = XOnlyPublicKey::from_slice(
                                &hex::decode(&request.pubkey).unwrap(),
                            )
                            .unwrap();
                            let client_pk = PublicKey::from_x_only_public_key(
                                client_xonly,
                                Parity::Even,
                            );
                            let key =
                                SharedSecret::new(&client_pk, &this.remote.secret_key())
                                    .secret_bytes();
                            let plain = open_sealed(&key, &request.content).unwrap();
                            let body: Value = serde_json::from_slice(&plain).unwrap();
                            let rpc_id = body["id"].as_str().unwrap().to_string();
                            let method = body["method"].as_str().unwrap();
                            let response_body = match method {
                                "connect" => {
                                    this.saw_connect.store(true, Ordering::SeqCst);
                                    if this.claim_already_connected {
                                        serde_json::json!({
                                            "id": rpc_id,
                                            "error": "already connected"
                                        })
                                    } else {
                                        serde_json::json!({ "id": rpc_id, "result": "ack" })
                                    }
                                }
                                "get_public_key" => serde_json::json!({
                                    "id": rpc_id,
                                    "result": this.user_pubkey()
                                }),
                                "sign_event" => {
                                    let param = body["params"][0].as_str().unwrap();
                                    let mut ev: Event = serde_json::from_str(param).unwrap();
                                    this.sign(&this.user, &mut ev);
                                    serde_json::json!({
                                        "id": rpc_id,
                                        "result": serde_json::to_string(&ev).unwrap()
                                    })
                                }
                                other => serde_json::json!({
                                    "id": rpc_id,
                                    "error": format!("unknown method {other}")
                                }),
                            };
                            let content =
                                seal(&key, response_body.to_string().as_bytes()).unwrap();
                            let mut response = Event::unsigned(
                                KIND_BUNKER_RPC,
                                1,
                                vec![Tag::new(["p", request.pubkey.as_str()])],
                                content,
                            );
                            this.sign(&this.remote, &mut response);
                            let out = serde_json::json!(["EVENT", SUB_ID, response]);
                            let _ = ws.send(WsMessage::Text(out.to_string())).await;
                        }
                    });
                }
            });
            format!("ws://{addr}")
        }
    }

    fn opts(dir: &TempDir) -> SignerOptions {
        SignerOptions {
            approval_timeout: Duration::from_secs(5),
            client_key_file: dir.path().join("client.key"),
            open_browser: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_and_sign_round_trip() {
        let dir = TempDir::new().unwrap();
        let bunker = Arc::new(MockBunker::new(false));
        let relay = bunker.clone().serve().await;
        let mut signer = RemoteBunkerSigner::connect(
            &bunker.remote_pubkey(),
            &relay,
            "a-long-random-bearer-secret",
            &opts(&dir),
            &Cancel::never(),
        )
        .await
        .unwrap();

        let pk = signer.public_key(&Cancel::never()).await.unwrap();
        assert_eq!(pk, bunker.user_pubkey());

        let mut ev = Event::unsigned(KIND_ASSET, 1, vec![], "app.apk".into());
        signer.sign(&mut ev, &Cancel::never()).await.unwrap();
        assert_eq!(ev.pubkey, bunker.user_pubkey());
        verify_event(&ev).unwrap();
        signer.close().await;
    }

    #[tokio::test]
    async fn already_connected_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let bunker = Arc::new(MockBunker::new(true));
        let relay = bunker.clone().serve().await;
        let signer = RemoteBunkerSigner::connect(
            &bunker.remote_pubkey(),
            &relay,
            "a-long-random-bearer-secret",
            &opts(&dir),
            &Cancel::never(),
        )
        .await;
        assert!(signer.is_ok());
        assert!(bunker.saw_connect.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn low_entropy_secret_persists_client_key() {
        let dir = TempDir::new().unwrap();
        let bunker = Arc::new(MockBunker::new(false));
        let relay = bunker.clone().serve().await;
        let o = opts(&dir);
        let s1 = RemoteBunkerSigner::connect(
            &bunker.remote_pubkey(),
            &relay,
            "1234-5678",
            &o,
            &Cancel::never(),
        )
        .await
        .unwrap();
        assert!(o.client_key_file.exists());
        let first = s1.client_pubkey.clone();
        let s2 = RemoteBunkerSigner::connect(
            &bunker.remote_pubkey(),
            &relay,
            "1234-5678",
            &o,
            &Cancel::never(),
        )
        .await
        .unwrap();
        assert_eq!(s2.client_pubkey, first);
    }

    #[tokio::test]
    async fn high_entropy_secret_uses_ephemeral_keys() {
        let dir = TempDir::new().unwrap();
        let bunker = Arc::new(MockBunker::new(false));
        let relay = bunker.clone().serve().await;
        let o = opts(&dir);
        let s1 = RemoteBunkerSigner::connect(
            &bunker.remote_pubkey(),
            &relay,
            "a-long-random-bearer-secret",
            &o,
            &Cancel::never(),
        )
        .await
        .unwrap();
        let s2 = RemoteBunkerSigner::connect(
            &bunker.remote_pubkey(),
            &relay,
            "a-long-random-bearer-secret",
            &o,
            &Cancel::never(),
        )
        .await
        .unwrap();
        assert!(!o.client_key_file.exists());
        assert_ne!(s1.client_pubkey, s2.client_pubkey);
    }

    #[test]
    fn seal_and_open_round_trip() {
        let key = [42u8; 32];
        let framed = seal(&key, b"hello bunker").unwrap();
        assert_eq!(open_sealed(&key, &framed).unwrap(), b"hello bunker");
        assert!(open_sealed(&[0u8; 32], &framed).is_err());
    }

    #[test]
    fn ecdh_is_symmetric_after_normalization() {
        let secp = Secp256k1::new();
        let a = normalized_keypair(&secp, SecretKey::from_slice(&[3u8; 32]).unwrap());
        let b = normalized_keypair(&secp, SecretKey::from_slice(&[4u8; 32]).unwrap());
        let a_pub = hex::encode(a.x_only_public_key().0.serialize());
        let b_pub = hex::encode(b.x_only_public_key().0.serialize());
        let k1 = derive_shared_key(&a, &b_pub).unwrap();
        let k2 = derive_shared_key(&b, &a_pub).unwrap();
        assert_eq!(k1, k2);
    }
}
