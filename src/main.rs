//! Command line interface for publishing signed release attestations.
//! Supports initialization, signer identity lookup, existing-asset checks,
//! and full publish runs driven by a JSON manifest.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use shipstr::config::Settings;
use shipstr::meta::{AppMetadata, AssetMetadata, ReleaseMetadata};
use shipstr::session::NoCache;
use shipstr::{Cancel, PublishOutcome, PublishRequest, Session};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "shipstr",
    author,
    version,
    about = "Publish signed release attestations to Nostr relays",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` configuration file.
    Init,
    /// Print the public key the configured signer attributes events to.
    Whoami,
    /// Query configured relays for an already-published asset.
    Check {
        /// App or asset identifier, e.g. `com.example.app`.
        identifier: String,
        /// Version string to match.
        version: String,
    },
    /// Build, sign, upload, and publish a release described by a manifest.
    Publish {
        /// Path to the JSON manifest.
        manifest: String,
        /// Publish even when the asset already exists on a relay.
        #[arg(long)]
        force: bool,
    },
}

/// JSON manifest naming the three metadata layers. Asset entries may point
/// at a local file, in which case hash, size, and filename are filled in.
#[derive(Deserialize)]
struct Manifest {
    app: AppMetadata,
    release: ReleaseMetadata,
    #[serde(default)]
    assets: Vec<ManifestAsset>,
}

#[derive(Deserialize)]
struct ManifestAsset {
    /// Local artifact to upload; omit when the file is hosted elsewhere.
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(flatten)]
    meta: AssetMetadata,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    if matches!(cli.command, Commands::Init) {
        ensure_env_file(&cli.env)?;
        println!("wrote {}", cli.env);
        return Ok(());
    }
    let cfg = Settings::from_env(&cli.env)?;
    let session_config = cfg.session_config()?;
    let (trigger, cancel) = Cancel::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = trigger.send(true);
        }
    });
    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Whoami => {
            let mut session = Session::open(session_config, cancel).await?;
            let pk = session.public_key().await?;
            println!("{pk}");
            session.close().await;
        }
        Commands::Check {
            identifier,
            version,
        } => {
            let session = Session::open(session_config, cancel).await?;
            match session.check_existing_asset(&identifier, &version).await? {
                Some((ev, relay)) => {
                    println!("{identifier} {version} found on {relay} (event {})", ev.id);
                }
                None => println!("{identifier} {version} not found on any configured relay"),
            }
            session.close().await;
        }
        Commands::Publish { manifest, force } => {
            let request = load_manifest(&manifest, force)?;
            let mut session = Session::open(session_config, cancel).await?;
            let outcome = session.publish(request, &mut NoCache).await;
            session.close().await;
            report(outcome?)?;
        }
    }
    Ok(())
}

/// Read the manifest and resolve local artifact files into bytes.
fn load_manifest(path: &str, force: bool) -> anyhow::Result<PublishRequest> {
    let data = fs::read_to_string(path).with_context(|| format!("reading manifest {path}"))?;
    let manifest: Manifest =
        serde_json::from_str(&data).with_context(|| format!("parsing manifest {path}"))?;
    let base = Path::new(path).parent().unwrap_or(Path::new("."));
    let mut assets = Vec::with_capacity(manifest.assets.len());
    for entry in manifest.assets {
        let mut meta = entry.meta;
        let bytes = match entry.file {
            Some(file) => {
                let full = if file.is_absolute() {
                    file
                } else {
                    base.join(file)
                };
                let bytes =
                    fs::read(&full).with_context(|| format!("reading {}", full.display()))?;
                meta.sha256 = hex::encode(Sha256::digest(&bytes));
                meta.size = bytes.len() as u64;
                if meta.filename.is_empty() {
                    if let Some(name) = full.file_name() {
                        meta.filename = name.to_string_lossy().into_owned();
                    }
                }
                bytes
            }
            None => Vec::new(),
        };
        if meta.version.is_empty() {
            meta.version = manifest.release.version.clone();
        }
        assets.push((meta, bytes));
    }
    Ok(PublishRequest {
        app: manifest.app,
        release: manifest.release,
        assets,
        force,
    })
}

/// Print the outcome per relay and fail on any rejection.
fn report(outcome: PublishOutcome) -> anyhow::Result<()> {
    match outcome {
        PublishOutcome::AlreadyPublished { event, relay_url } => {
            println!("already published on {relay_url} (event {})", event.id);
        }
        PublishOutcome::Published { uploads, report } => {
            for upload in &uploads {
                let how = if upload.existed { "present" } else { "uploaded" };
                println!("{how}: {} ({} bytes)", upload.url, upload.size);
            }
            let groups = [("app", &report.app), ("release", &report.release)]
                .into_iter()
                .map(|(name, results)| (name.to_string(), results))
                .chain(
                    report
                        .assets
                        .iter()
                        .enumerate()
                        .map(|(i, results)| (format!("asset #{i}"), results)),
                );
            for (name, results) in groups {
                for r in results {
                    let status = if r.is_duplicate {
                        "duplicate"
                    } else if r.success {
                        "ok"
                    } else {
                        "rejected"
                    };
                    match &r.error {
                        Some(e) => println!("{name} -> {}: {status} ({e})", r.relay_url),
                        None => println!("{name} -> {}: {status}", r.relay_url),
                    }
                }
            }
            if !report.all_succeeded() {
                bail!(
                    "publish incomplete, failures on: {}",
                    report.failed_relays().join(", ")
                );
            }
        }
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("SIGNER=\n");
    content.push_str("RELAYS=\n");
    content.push_str("BLOSSOM_SERVER=\n");
    content.push_str("RELAY_TIMEOUT_SECS=30\n");
    content.push_str("APPROVAL_TIMEOUT_SECS=120\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("CLIENT_KEY_FILE=shipstr-client.key\n");
    content.push_str("OPEN_BROWSER=1\n");
    content.push_str("VERBOSE=0\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_vars() {
        for v in [
            "SIGNER",
            "RELAYS",
            "BLOSSOM_SERVER",
            "RELAY_TIMEOUT_SECS",
            "APPROVAL_TIMEOUT_SECS",
            "TOR_SOCKS",
            "CLIENT_KEY_FILE",
            "OPEN_BROWSER",
            "VERBOSE",
        ] {
            std::env::remove_var(v);
        }
    }

    /// Relay that accepts every EVENT and answers REQ with a bare EOSE.
    async fn spawn_relay() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        if let TMsg::Text(txt) = msg {
                            let val: Value = serde_json::from_str(&txt).unwrap();
                            if val[0] == "EVENT" {
                                let id = val[1]["id"].as_str().unwrap();
                                let ok = serde_json::json!(["OK", id, true, ""]).to_string();
                                let _ = ws.send(TMsg::Text(ok)).await;
                            } else if val[0] == "REQ" {
                                let sub = val[1].as_str().unwrap();
                                let eose = serde_json::json!(["EOSE", sub]).to_string();
                                let _ = ws.send(TMsg::Text(eose)).await;
                            }
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    fn write_env(dir: &TempDir, relay: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "SIGNER=key:{}\nRELAYS={relay}\nOPEN_BROWSER=0\nVERBOSE=0\n",
            "11".repeat(32)
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    #[tokio::test]
    async fn init_creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Init,
        })
        .await
        .unwrap();
        let data = fs::read_to_string(&env_path).unwrap();
        assert!(data.contains("SIGNER="));
        assert!(data.contains("RELAYS="));
        assert!(data.contains("APPROVAL_TIMEOUT_SECS=120"));
    }

    #[tokio::test]
    async fn whoami_prints_local_key() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let relay = spawn_relay().await;
        let env_file = write_env(&dir, &relay);
        run(Cli {
            env: env_file,
            command: Commands::Whoami,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn check_reports_absent_asset() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let relay = spawn_relay().await;
        let env_file = write_env(&dir, &relay);
        run(Cli {
            env: env_file,
            command: Commands::Check {
                identifier: "com.example.app".into(),
                version: "1.0.0".into(),
            },
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn publish_manifest_end_to_end() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let relay = spawn_relay().await;
        let env_file = write_env(&dir, &relay);
        let manifest_path = dir.path().join("release.json");
        let manifest = serde_json::json!({
            "app": { "identifier": "com.example.app", "name": "Example" },
            "release": { "identifier": "com.example.app", "version": "1.0.0" },
            "assets": [{
                "version": "1.0.0",
                "sha256": "ab".repeat(32),
                "size": 4,
                "filename": "app.apk",
                "download_urls": ["https://cdn.example.com/app.apk"]
            }]
        });
        fs::write(&manifest_path, manifest.to_string()).unwrap();
        run(Cli {
            env: env_file,
            command: Commands::Publish {
                manifest: manifest_path.to_string_lossy().into_owned(),
                force: true,
            },
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn manifest_resolves_local_files() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("app.apk");
        fs::write(&artifact, b"artifact-bytes").unwrap();
        let manifest_path = dir.path().join("release.json");
        let manifest = serde_json::json!({
            "app": { "identifier": "com.example.app", "name": "Example" },
            "release": { "identifier": "com.example.app", "version": "2.0.0" },
            "assets": [{ "file": "app.apk" }]
        });
        fs::write(&manifest_path, manifest.to_string()).unwrap();
        let request = load_manifest(manifest_path.to_str().unwrap(), false).unwrap();
        assert_eq!(request.assets.len(), 1);
        let (meta, bytes) = &request.assets[0];
        assert_eq!(bytes, b"artifact-bytes");
        assert_eq!(
            meta.sha256,
            hex::encode(Sha256::digest(b"artifact-bytes".as_slice()))
        );
        assert_eq!(meta.size, 14);
        assert_eq!(meta.filename, "app.apk");
        // version falls back to the release version
        assert_eq!(meta.version, "2.0.0");
    }
}
