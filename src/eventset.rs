//! Event-set signing: resolves the release → asset id dependency.
//!
//! A release must carry the final ids of all its asset events before it is
//! itself signed. The sequential path fixes each asset id by signing it; the
//! batch path exploits the fact that an event id is a pure hash of the
//! unsigned fields (pubkey included) and pre-computes ids so one batch
//! approval covers the whole set.

use crate::builder::ReleaseBuilder;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::session::Cancel;
use crate::signer::SignerBackend;

/// The unit that is signed and published together: one app metadata event,
/// one release, and its asset events in order. Transient; discarded after a
/// publish run.
#[derive(Debug, Clone)]
pub struct EventSet {
    pub app: Event,
    pub release: Event,
    pub assets: Vec<Event>,
}

/// Sign a full event set, choosing the sequential or batch algorithm from
/// the signer's capabilities.
///
/// Any single failure aborts the whole set, so no partial publish input is
/// ever produced. The error names the event (and asset index) that failed.
pub async fn sign_event_set(
    signer: &mut SignerBackend,
    app: Event,
    release: ReleaseBuilder,
    assets: Vec<Event>,
    relay_hint: Option<String>,
    cancel: &Cancel,
) -> Result<EventSet> {
    if signer.supports_batch() {
        sign_batch_path(signer, app, release, assets, relay_hint, cancel).await
    } else {
        sign_sequential(signer, app, release, assets, relay_hint, cancel).await
    }
}

/// Sign assets first (fixing their ids), attach the reference tags, then
/// sign release and finally app metadata. The order is mandatory: signing
/// the release earlier would omit the required references.
async fn sign_sequential(
    signer: &mut SignerBackend,
    mut app: Event,
    mut release: ReleaseBuilder,
    mut assets: Vec<Event>,
    relay_hint: Option<String>,
    cancel: &Cancel,
) -> Result<EventSet> {
    let mut refs = Vec::with_capacity(assets.len());
    for (i, asset) in assets.iter_mut().enumerate() {
        signer
            .sign(asset, cancel)
            .await
            .map_err(|e| label(e, &format!("asset #{i}")))?;
        refs.push((asset.id.clone(), relay_hint.clone()));
    }
    release.attach_asset_refs(refs);
    let mut release_ev = release.build()?;
    signer
        .sign(&mut release_ev, cancel)
        .await
        .map_err(|e| label(e, "release"))?;
    signer
        .sign(&mut app, cancel)
        .await
        .map_err(|e| label(e, "app metadata"))?;
    Ok(EventSet {
        app,
        release: release_ev,
        assets,
    })
}

/// Pre-compute asset ids under the signer's pubkey, attach references, and
/// submit everything in one batch-sign call.
async fn sign_batch_path(
    signer: &mut SignerBackend,
    app: Event,
    mut release: ReleaseBuilder,
    mut assets: Vec<Event>,
    relay_hint: Option<String>,
    cancel: &Cancel,
) -> Result<EventSet> {
    let pubkey = signer.public_key(cancel).await?;
    let mut refs = Vec::with_capacity(assets.len());
    for asset in assets.iter_mut() {
        let id = precompute_id(&pubkey, asset)?;
        refs.push((id, relay_hint.clone()));
    }
    release.attach_asset_refs(refs.clone());
    let release_ev = release.build()?;

    let mut batch = Vec::with_capacity(assets.len() + 2);
    batch.push(app);
    batch.push(release_ev);
    batch.extend(assets);
    signer.sign_batch(&mut batch, cancel).await?;

    let mut iter = batch.into_iter();
    let app = iter.next().expect("batch preserved");
    let release_ev = iter.next().expect("batch preserved");
    let assets: Vec<Event> = iter.collect();
    for (i, (asset, (expected_id, _))) in assets.iter().zip(refs.iter()).enumerate() {
        if &asset.id != expected_id {
            return Err(Error::SignatureRejected(format!(
                "asset #{i}: signed id {} differs from pre-computed {expected_id}",
                asset.id
            )));
        }
    }
    Ok(EventSet {
        app,
        release: release_ev,
        assets,
    })
}

/// Assign the final pubkey and derive the id by hashing. Assigning the
/// pubkey first is what makes the pre-computation correct: the pubkey is
/// part of the id input.
pub fn precompute_id(pubkey: &str, ev: &mut Event) -> Result<String> {
    ev.pubkey = pubkey.to_string();
    ev.finalize_id()?;
    Ok(ev.id.clone())
}

fn label(e: Error, what: &str) -> Error {
    match e {
        Error::Validation(m) => Error::Validation(format!("{what}: {m}")),
        Error::Transport(m) => Error::Transport(format!("{what}: {m}")),
        Error::SignatureRejected(m) => Error::SignatureRejected(format!("{what}: {m}")),
        Error::Timeout(m) => Error::Timeout(format!("{what}: {m}")),
        Error::Cancelled => Error::Cancelled,
    }
}
