//! Pure construction of the four event kinds from domain metadata.
//!
//! Builders are side-effect free: given the same metadata and clock value
//! they produce byte-identical unsigned events. Optional fields that are
//! absent or zero emit no tag at all, never an empty-value tag.

use crate::error::{Error, Result};
use crate::event::{
    Event, Tag, KIND_APP_METADATA, KIND_ASSET, KIND_RELEASE, KIND_UPLOAD_AUTH,
};
use crate::meta::{AppMetadata, AssetMetadata, Channel, ReleaseMetadata, WireFormat, GENERIC_PLATFORMS};

/// Maximum validity of an upload authorization, in seconds.
pub const UPLOAD_AUTH_TTL: u64 = 300;

/// Push `[key, value]` unless the value is empty.
fn push_opt(tags: &mut Vec<Tag>, key: &str, value: &str) {
    if !value.is_empty() {
        tags.push(Tag::new([key, value]));
    }
}

/// Build the application metadata event (kind 32267).
pub fn build_app_metadata(app: &AppMetadata, format: WireFormat, created_at: u64) -> Event {
    let mut tags = vec![Tag::new(["d", app.identifier.as_str()])];
    push_opt(&mut tags, "name", &app.name);
    match format {
        WireFormat::Current => {
            push_opt(&mut tags, "summary", &app.summary);
            push_opt(&mut tags, "icon", &app.icon_url);
            for image in &app.image_urls {
                push_opt(&mut tags, "image", image);
            }
            for t in &app.tags {
                push_opt(&mut tags, "t", t);
            }
            push_opt(&mut tags, "url", &app.website);
            push_opt(&mut tags, "repository", &app.repository);
            push_opt(&mut tags, "license", &app.license);
            for platform in &app.platforms {
                push_opt(&mut tags, "f", platform);
            }
        }
        WireFormat::Legacy => {
            push_opt(&mut tags, "picture", &app.icon_url);
            for t in &app.tags {
                push_opt(&mut tags, "t", t);
            }
            push_opt(&mut tags, "github", &app.repository);
            push_opt(&mut tags, "license", &app.license);
        }
    }
    Event::unsigned(KIND_APP_METADATA, created_at, tags, app.description.clone())
}

/// Build an asset (file metadata) event, kind 1063.
///
/// The asset identifier falls back to `app_identifier` when not overridden.
/// An artifact with no architecture-specific native components is treated as
/// architecture independent and gets the full generic platform set.
pub fn build_asset(
    asset: &AssetMetadata,
    app_identifier: &str,
    format: WireFormat,
    created_at: u64,
) -> Event {
    let identifier = if asset.identifier.is_empty() {
        app_identifier
    } else {
        &asset.identifier
    };
    let platforms: Vec<String> = if asset.platforms.is_empty() {
        GENERIC_PLATFORMS.iter().map(|s| s.to_string()).collect()
    } else {
        asset.platforms.clone()
    };

    let mut tags = vec![];
    for url in &asset.download_urls {
        push_opt(&mut tags, "url", url);
    }
    push_opt(&mut tags, "x", &asset.sha256);
    if asset.size > 0 {
        tags.push(Tag::new(["size".to_string(), asset.size.to_string()]));
    }
    match format {
        WireFormat::Current => {
            tags.push(Tag::new(["i", identifier]));
            push_opt(&mut tags, "version", &asset.version);
            push_opt(&mut tags, "min_sdk_version", &asset.min_platform_version);
            push_opt(
                &mut tags,
                "target_sdk_version",
                &asset.target_platform_version,
            );
            push_opt(&mut tags, "apk_signature_hash", &asset.cert_fingerprint);
            for platform in &platforms {
                push_opt(&mut tags, "f", platform);
            }
            push_opt(&mut tags, "filename", &asset.filename);
            push_opt(&mut tags, "variant", &asset.variant);
            push_opt(&mut tags, "commit", &asset.commit);
            for permission in &asset.permissions {
                push_opt(&mut tags, "permission", permission);
            }
            for ext in &asset.protocol_extensions {
                push_opt(&mut tags, "protocol", ext);
            }
            push_opt(&mut tags, "min_allowed_version", &asset.min_allowed_version);
        }
        WireFormat::Legacy => {
            tags.push(Tag::new(["appid", identifier]));
            push_opt(&mut tags, "version", &asset.version);
            push_opt(&mut tags, "apk_signature_hash", &asset.cert_fingerprint);
            if !asset.permissions.is_empty() {
                tags.push(Tag::new([
                    "permissions".to_string(),
                    asset.permissions.join(","),
                ]));
            }
        }
    }
    Event::unsigned(KIND_ASSET, created_at, tags, asset.filename.clone())
}

/// Build an ephemeral upload authorization event (kind 24242) scoped to a
/// single file hash. `expires_in` is clamped to [`UPLOAD_AUTH_TTL`].
pub fn build_upload_auth(sha256: &str, now: u64, expires_in: u64) -> Event {
    let ttl = expires_in.min(UPLOAD_AUTH_TTL);
    let tags = vec![
        Tag::new(["t", "upload"]),
        Tag::new(["x", sha256]),
        Tag::new(["expiration".to_string(), (now + ttl).to_string()]),
    ];
    Event::unsigned(KIND_UPLOAD_AUTH, now, tags, format!("Upload {sha256}"))
}

/// Two-phase builder for the release event (kind 30063).
///
/// A release must reference the final ids of its asset events, which only
/// exist once the assets have a pubkey (and, on the sequential signing path,
/// a signature). The builder therefore starts in a pending state and cannot
/// produce an [`Event`] until [`ReleaseBuilder::attach_asset_refs`] has run.
#[derive(Debug, Clone)]
pub struct ReleaseBuilder {
    release: ReleaseMetadata,
    format: WireFormat,
    created_at: u64,
    asset_refs: Option<Vec<(String, Option<String>)>>,
}

impl ReleaseBuilder {
    pub fn new(release: ReleaseMetadata, format: WireFormat, created_at: u64) -> Self {
        ReleaseBuilder {
            release,
            format,
            created_at,
            asset_refs: None,
        }
    }

    /// Attach the `(asset event id, optional relay hint)` references.
    pub fn attach_asset_refs(&mut self, refs: Vec<(String, Option<String>)>) {
        self.asset_refs = Some(refs);
    }

    /// Finish the release event. Fails while asset references are missing.
    pub fn build(&self) -> Result<Event> {
        let refs = self
            .asset_refs
            .as_ref()
            .ok_or_else(|| Error::Validation("release built before asset refs attached".into()))?;
        let d = format!("{}@{}", self.release.identifier, self.release.version);
        let mut tags = vec![Tag::new(["d", d.as_str()])];
        for (id, relay) in refs {
            match relay {
                Some(r) => tags.push(Tag::new(["e", id.as_str(), r.as_str()])),
                None => tags.push(Tag::new(["e", id.as_str()])),
            }
        }
        push_opt(&mut tags, "version", &self.release.version);
        match self.format {
            WireFormat::Current => {
                if self.release.channel != Channel::Main {
                    tags.push(Tag::new([
                        "channel".to_string(),
                        self.release.channel.to_string(),
                    ]));
                }
            }
            WireFormat::Legacy => {
                push_opt(&mut tags, "url", &self.release.release_url);
                push_opt(&mut tags, "commit", &self.release.commit);
            }
        }
        Ok(Event::unsigned(
            KIND_RELEASE,
            self.created_at,
            tags,
            self.release.changelog.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_app() -> AppMetadata {
        AppMetadata {
            identifier: "com.example.app".into(),
            name: "Example".into(),
            description: "An example app".into(),
            summary: "Example summary".into(),
            website: "https://example.com".into(),
            license: "MIT".into(),
            repository: "https://github.com/example/app".into(),
            tags: vec!["tools".into()],
            icon_url: "https://example.com/icon.png".into(),
            image_urls: vec!["https://example.com/shot.png".into()],
            platforms: vec!["android-arm64-v8a".into()],
            legacy_format: false,
        }
    }

    fn sample_asset() -> AssetMetadata {
        AssetMetadata {
            identifier: String::new(),
            version: "2.0.0".into(),
            sha256: "ab".repeat(32),
            size: 1024,
            download_urls: vec!["https://cdn.example.com/app.apk".into()],
            cert_fingerprint: "cd".repeat(32),
            min_platform_version: "24".into(),
            target_platform_version: "34".into(),
            platforms: vec!["android-arm64-v8a".into()],
            filename: "app.apk".into(),
            variant: String::new(),
            commit: String::new(),
            permissions: vec!["INTERNET".into(), "CAMERA".into()],
            protocol_extensions: vec![],
            min_allowed_version: String::new(),
        }
    }

    #[test]
    fn app_builder_is_deterministic() {
        let app = sample_app();
        let a = build_app_metadata(&app, WireFormat::Current, 1700000000);
        let b = build_app_metadata(&app, WireFormat::Current, 1700000000);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn app_current_tag_order() {
        let ev = build_app_metadata(&sample_app(), WireFormat::Current, 1);
        let keys: Vec<&str> = ev.tags.iter().filter_map(|t| t.key()).collect();
        assert_eq!(
            keys,
            [
                "d", "name", "summary", "icon", "image", "t", "url", "repository", "license", "f"
            ]
        );
        assert_eq!(ev.content, "An example app");
    }

    #[test]
    fn app_legacy_uses_old_vocabulary() {
        let ev = build_app_metadata(&sample_app(), WireFormat::Legacy, 1);
        let keys: Vec<&str> = ev.tags.iter().filter_map(|t| t.key()).collect();
        assert_eq!(keys, ["d", "name", "picture", "t", "github", "license"]);
        assert_eq!(ev.tag_value("picture"), Some("https://example.com/icon.png"));
    }

    #[test]
    fn empty_optionals_emit_no_tags() {
        let mut app = sample_app();
        app.summary.clear();
        app.icon_url.clear();
        app.website.clear();
        let ev = build_app_metadata(&app, WireFormat::Current, 1);
        assert!(ev.tags.iter().all(|t| t.key() != Some("summary")));
        assert!(ev.tags.iter().all(|t| t.key() != Some("icon")));
        assert!(ev.tags.iter().all(|t| t.key() != Some("url")));
        assert!(ev.tags.iter().all(|t| t.value() != Some("")));
    }

    #[test]
    fn asset_identifier_defaults_to_app() {
        let ev = build_asset(&sample_asset(), "com.example.app", WireFormat::Current, 1);
        assert_eq!(ev.tag_value("i"), Some("com.example.app"));

        let mut variant = sample_asset();
        variant.identifier = "com.example.app.fdroid".into();
        let ev = build_asset(&variant, "com.example.app", WireFormat::Current, 1);
        assert_eq!(ev.tag_value("i"), Some("com.example.app.fdroid"));
    }

    #[test]
    fn asset_without_native_code_gets_generic_platforms() {
        let mut asset = sample_asset();
        asset.platforms.clear();
        let ev = build_asset(&asset, "com.example.app", WireFormat::Current, 1);
        let fs: Vec<&str> = ev
            .tags
            .iter()
            .filter(|t| t.key() == Some("f"))
            .filter_map(|t| t.value())
            .collect();
        assert_eq!(fs, GENERIC_PLATFORMS);
    }

    #[test]
    fn asset_legacy_joins_permissions() {
        let ev = build_asset(&sample_asset(), "com.example.app", WireFormat::Legacy, 1);
        assert_eq!(ev.tag_value("appid"), Some("com.example.app"));
        assert_eq!(ev.tag_value("permissions"), Some("INTERNET,CAMERA"));
        assert!(ev.tags.iter().all(|t| t.key() != Some("i")));
        assert!(ev.tags.iter().all(|t| t.key() != Some("filename")));
    }

    #[test]
    fn upload_auth_clamps_expiration() {
        let hash = "ab".repeat(32);
        let ev = build_upload_auth(&hash, 1000, 9999);
        assert_eq!(ev.kind, KIND_UPLOAD_AUTH);
        assert_eq!(ev.tag_value("t"), Some("upload"));
        assert_eq!(ev.tag_value("x"), Some(hash.as_str()));
        assert_eq!(ev.tag_value("expiration"), Some("1300"));
        assert_eq!(ev.content, format!("Upload {hash}"));
    }

    #[test]
    fn release_requires_asset_refs() {
        let rel = ReleaseMetadata {
            identifier: "com.example.app".into(),
            version: "2.0.0".into(),
            ..Default::default()
        };
        let mut builder = ReleaseBuilder::new(rel, WireFormat::Current, 1);
        assert!(builder.build().is_err());
        builder.attach_asset_refs(vec![
            ("aa11".into(), Some("wss://relay.example.com".into())),
            ("bb22".into(), None),
        ]);
        let ev = builder.build().unwrap();
        assert_eq!(ev.tag_value("d"), Some("com.example.app@2.0.0"));
        let refs: Vec<&Tag> = ev.tags.iter().filter(|t| t.key() == Some("e")).collect();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].0, vec!["e", "aa11", "wss://relay.example.com"]);
        assert_eq!(refs[1].0, vec!["e", "bb22"]);
    }

    #[test]
    fn release_channel_tag_only_when_not_main() {
        let mut rel = ReleaseMetadata {
            identifier: "a".into(),
            version: "1".into(),
            ..Default::default()
        };
        let mut builder = ReleaseBuilder::new(rel.clone(), WireFormat::Current, 1);
        builder.attach_asset_refs(vec![]);
        assert!(builder
            .build()
            .unwrap()
            .tags
            .iter()
            .all(|t| t.key() != Some("channel")));

        rel.channel = Channel::Beta;
        let mut builder = ReleaseBuilder::new(rel, WireFormat::Current, 1);
        builder.attach_asset_refs(vec![]);
        assert_eq!(builder.build().unwrap().tag_value("channel"), Some("beta"));
    }

    #[test]
    fn release_legacy_emits_url_and_commit() {
        let rel = ReleaseMetadata {
            identifier: "a".into(),
            version: "1".into(),
            release_url: "https://example.com/r/1".into(),
            commit: "deadbeef".into(),
            channel: Channel::Beta,
            ..Default::default()
        };
        let mut builder = ReleaseBuilder::new(rel, WireFormat::Legacy, 1);
        builder.attach_asset_refs(vec![]);
        let ev = builder.build().unwrap();
        assert_eq!(ev.tag_value("url"), Some("https://example.com/r/1"));
        assert_eq!(ev.tag_value("commit"), Some("deadbeef"));
        // legacy never carries a channel tag
        assert!(ev.tags.iter().all(|t| t.key() != Some("channel")));
    }
}
