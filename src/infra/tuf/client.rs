//! TUF client: bootstraps trust from an embedded root and refreshes the
//! top-level roles from a [`MetadataTransport`].
//!
//! Signature, threshold, rollback and expiry checks are done by a
//! `tuf::database::Database`; this module decides which files to fetch,
//! feeds their raw bytes to the database and keeps accepted metadata in
//! local storage so later runs detect rollbacks against it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use tuf::crypto::HashAlgorithm;
use tuf::database::Database;
use tuf::metadata::{
    Metadata as _, RawSignedMetadata, RawSignedMetadataSet, RawSignedMetadataSetBuilder,
    TargetDescription, TargetPath,
};
use tuf::interchange::Json as Pouf1;

use crate::infra::tuf::transport::MetadataTransport;
use crate::infra::{ProviderError, Result};

const META_ROOT: &str = "root.json";
const META_TIMESTAMP: &str = "timestamp.json";
const META_SNAPSHOT: &str = "snapshot.json";
const META_TARGETS: &str = "targets.json";

/// Upper bound on root versions walked in one refresh
const MAX_ROOT_ROTATIONS: u32 = 32;

/// Options for [`TufClient::bootstrap`]
#[derive(Debug, Clone)]
pub struct TufClientOptions {
    pub initial_root: Vec<u8>,
    pub local_storage_dir: PathBuf,
    /// Channel prefix applied to target paths; empty for the default channel
    pub path_prefix: String,
}

impl TufClientOptions {
    pub fn new(initial_root: &[u8], local_storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            initial_root: initial_root.to_vec(),
            local_storage_dir: local_storage_dir.into(),
            path_prefix: String::new(),
        }
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into().trim_matches('/').to_string();
        self
    }
}

/// A refreshed view of a TUF repository
pub struct TufClient {
    transport: Arc<dyn MetadataTransport>,
    options: TufClientOptions,
    database: Database<Pouf1>,
}

impl std::fmt::Debug for TufClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TufClient")
            .field("storage", &self.options.local_storage_dir)
            .field("root_version", &self.root_version())
            .finish()
    }
}

impl TufClient {
    /// Establish trust and refresh all top-level metadata
    pub async fn bootstrap(
        options: TufClientOptions,
        transport: Arc<dyn MetadataTransport>,
    ) -> Result<Self> {
        let database = trusted_database(&options).await?;
        let mut client = Self {
            transport,
            options,
            database,
        };
        client.refresh().await?;
        Ok(client)
    }

    /// Pull the latest metadata for every top-level role
    pub async fn refresh(&mut self) -> Result<()> {
        self.update_root().await?;

        let timestamp = self.fetch_required(META_TIMESTAMP.to_string()).await?;
        let snapshot_name = self.versioned_name(META_SNAPSHOT, meta_version(&timestamp, META_SNAPSHOT));
        let snapshot = self.fetch_required(snapshot_name).await?;
        let targets_name = self.versioned_name(META_TARGETS, meta_version(&snapshot, META_TARGETS));
        let targets = self.fetch_required(targets_name).await?;

        let set = RawSignedMetadataSetBuilder::<Pouf1>::new()
            .timestamp(RawSignedMetadata::new(timestamp.clone()))
            .snapshot(RawSignedMetadata::new(snapshot.clone()))
            .targets(RawSignedMetadata::new(targets.clone()))
            .build();
        self.database.update_metadata_with_start_time(&set, &Utc::now())?;

        let targets_version = metadata_version(&targets);
        self.persist(META_TIMESTAMP, timestamp).await?;
        self.persist(META_SNAPSHOT, snapshot).await?;
        self.persist(META_TARGETS, targets).await?;

        info!(
            root = self.root_version(),
            targets = targets_version,
            "TUF metadata refreshed"
        );
        Ok(())
    }

    async fn update_root(&mut self) -> Result<()> {
        for _ in 0..MAX_ROOT_ROTATIONS {
            let next = self.root_version() + 1;
            let name = format!("{next}.{META_ROOT}");
            let Some(bytes) = self.transport.fetch_metadata(&name).await? else {
                break;
            };
            self.database.update_root(&RawSignedMetadata::new(bytes.clone()))?;
            debug!(version = next, "Rotated TUF root");
            self.persist(META_ROOT, bytes).await?;
        }
        Ok(())
    }

    async fn fetch_required(&self, name: String) -> Result<Vec<u8>> {
        self.transport
            .fetch_metadata(&name)
            .await?
            .ok_or_else(|| ProviderError::Tuf(format!("{name} not found")))
    }

    /// `<version>.<file>` under consistent snapshots, `<file>` otherwise
    fn versioned_name(&self, file: &str, version: Option<u32>) -> String {
        match version {
            Some(version) if self.database.trusted_root().consistent_snapshot() => {
                format!("{version}.{file}")
            }
            _ => file.to_string(),
        }
    }

    async fn persist(&self, file: &str, bytes: Vec<u8>) -> Result<()> {
        write_atomic(self.options.local_storage_dir.join(file), bytes).await
    }

    pub fn root_version(&self) -> u32 {
        self.database.trusted_root().version()
    }

    fn target_path(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.options.path_prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.options.path_prefix, path)
        }
    }

    /// Look up a target in the current channel
    pub fn target(&self, path: &str) -> Option<TargetDescription> {
        let target_path = TargetPath::new(self.target_path(path)).ok()?;
        self.database.target_description(&target_path).ok()
    }

    /// Download a target, checking its length and hash
    pub async fn fetch_target(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.target_path(path);
        let target = self
            .target(path)
            .ok_or_else(|| ProviderError::Tuf(format!("target {full_path} not found")))?;
        let sha256 = target_sha256(&target)
            .ok_or_else(|| ProviderError::Tuf(format!("target {full_path}: no sha256 hash")))?;

        let remote = if self.database.trusted_root().consistent_snapshot() {
            consistent_target_name(&full_path, &sha256)
        } else {
            full_path.clone()
        };

        let bytes = self.transport.fetch_target(&remote, &sha256).await?;
        verify_target(&full_path, &target, &bytes)?;
        Ok(bytes)
    }

    /// Fetch a target into `dest_dir`, reusing a cached copy that still matches
    pub async fn download_target(&self, path: &str, dest_dir: &Path) -> Result<Vec<u8>> {
        let dest = dest_dir.join(path.trim_start_matches('/'));
        if let Some(target) = self.target(path) {
            if let Ok(cached) = tokio::fs::read(&dest).await {
                if verify_target(path, &target, &cached).is_ok() {
                    debug!(path, "Using cached target");
                    return Ok(cached);
                }
            }
        }
        let bytes = self.fetch_target(path).await?;
        write_atomic(dest, bytes.clone()).await?;
        Ok(bytes)
    }
}

/// Unix epoch; seeding from local storage skips expiry checks, fresh
/// metadata is checked against the current time.
fn seed_start_time() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

/// Database seeded from the cached root (when at least as new as the
/// embedded one) and whatever top-level metadata was cached with it.
async fn trusted_database(options: &TufClientOptions) -> Result<Database<Pouf1>> {
    let dir = &options.local_storage_dir;
    let embedded_version = metadata_version(&options.initial_root);

    if let Some(cached_root) = read_cached(dir, META_ROOT).await {
        if metadata_version(&cached_root) >= embedded_version {
            let set = cached_set(dir, cached_root).await;
            match Database::from_trusted_metadata_with_start_time(&set, &seed_start_time()) {
                Ok(database) => {
                    debug!(version = database.trusted_root().version(), "Using cached TUF root");
                    return Ok(database);
                }
                Err(e) => warn!(error = %e, "Ignoring unusable cached TUF metadata"),
            }
        }
    }

    let set = RawSignedMetadataSetBuilder::<Pouf1>::new()
        .root(RawSignedMetadata::new(options.initial_root.clone()))
        .build();
    let database = Database::from_trusted_metadata_with_start_time(&set, &seed_start_time())?;
    write_atomic(dir.join(META_ROOT), options.initial_root.clone()).await?;
    Ok(database)
}

async fn cached_set(dir: &Path, root: Vec<u8>) -> RawSignedMetadataSet<Pouf1> {
    let mut builder = RawSignedMetadataSetBuilder::<Pouf1>::new().root(RawSignedMetadata::new(root));
    if let Some(bytes) = read_cached(dir, META_TIMESTAMP).await {
        builder = builder.timestamp(RawSignedMetadata::new(bytes));
    }
    if let Some(bytes) = read_cached(dir, META_SNAPSHOT).await {
        builder = builder.snapshot(RawSignedMetadata::new(bytes));
    }
    if let Some(bytes) = read_cached(dir, META_TARGETS).await {
        builder = builder.targets(RawSignedMetadata::new(bytes));
    }
    builder.build()
}

async fn read_cached(dir: &Path, file: &str) -> Option<Vec<u8>> {
    tokio::fs::read(dir.join(file)).await.ok()
}

#[derive(Deserialize)]
struct MetadataHeader {
    signed: SignedHeader,
}

#[derive(Deserialize)]
struct SignedHeader {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    meta: HashMap<String, MetaVersion>,
}

#[derive(Deserialize)]
struct MetaVersion {
    version: u32,
}

fn header(bytes: &[u8]) -> Option<SignedHeader> {
    serde_json::from_slice::<MetadataHeader>(bytes)
        .ok()
        .map(|m| m.signed)
}

/// `signed.version` of a metadata file, 0 when unreadable
pub(crate) fn metadata_version(bytes: &[u8]) -> u32 {
    header(bytes).map(|h| h.version).unwrap_or(0)
}

/// Version a timestamp or snapshot records for `file`
fn meta_version(bytes: &[u8], file: &str) -> Option<u32> {
    let header = header(bytes)?;
    let role = file.trim_end_matches(".json");
    header
        .meta
        .get(file)
        .or_else(|| header.meta.get(role))
        .map(|m| m.version)
}

fn target_sha256(target: &TargetDescription) -> Option<String> {
    target
        .hashes()
        .get(&HashAlgorithm::Sha256)
        .map(|hash| hex::encode(hash.value()))
}

fn verify_target(path: &str, target: &TargetDescription, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 != target.length() {
        return Err(ProviderError::Tuf(format!(
            "target {path}: expected {} bytes, got {}",
            target.length(),
            bytes.len()
        )));
    }
    let expected = target_sha256(target)
        .ok_or_else(|| ProviderError::Tuf(format!("target {path}: no sha256 hash")))?;
    let actual = hex::encode(Sha256::digest(bytes));
    if actual != expected {
        return Err(ProviderError::Tuf(format!(
            "target {path}: sha256 mismatch, expected {expected}, got {actual}"
        )));
    }
    Ok(())
}

/// `dir/<hash>.<name>` form used by consistent-snapshot repositories
fn consistent_target_name(path: &str, sha256: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/{sha256}.{name}"),
        None => format!("{sha256}.{path}"),
    }
}

/// Write a file by persisting a temporary file in the same directory
pub async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        use std::io::Write;

        let dir = path
            .parent()
            .ok_or_else(|| ProviderError::Internal(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.persist(&path).map_err(|e| ProviderError::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| ProviderError::Internal(format!("write task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tuf::crypto::{Ed25519PrivateKey, PrivateKey};
    use tuf::metadata::{
        RootMetadataBuilder, SnapshotMetadataBuilder, TargetsMetadataBuilder,
        TimestampMetadataBuilder,
    };

    /// In-memory TUF repository
    #[derive(Default)]
    struct FakeRepository {
        metadata: HashMap<String, Vec<u8>>,
        targets: HashMap<String, Vec<u8>>,
        target_requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MetadataTransport for FakeRepository {
        async fn fetch_metadata(&self, name: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.metadata.get(name).cloned())
        }

        async fn fetch_target(&self, path: &str, _sha256: &str) -> Result<Vec<u8>> {
            self.target_requests.lock().unwrap().push(path.to_string());
            self.targets
                .get(path)
                .cloned()
                .ok_or_else(|| ProviderError::Tuf(format!("missing {path}")))
        }
    }

    fn signing_key() -> Ed25519PrivateKey {
        Ed25519PrivateKey::from_pkcs8(&Ed25519PrivateKey::pkcs8().unwrap()).unwrap()
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn root(key: &Ed25519PrivateKey, version: u32) -> Vec<u8> {
        let public = key.public().clone();
        RootMetadataBuilder::new()
            .version(version)
            .consistent_snapshot(true)
            .root_key(public.clone())
            .snapshot_key(public.clone())
            .targets_key(public.clone())
            .timestamp_key(public)
            .signed::<Pouf1>(key)
            .unwrap()
            .to_raw()
            .unwrap()
            .as_bytes()
            .to_vec()
    }

    /// Repository with one target at `path`, snapshot v3, targets v7
    fn repository(
        key: &Ed25519PrivateKey,
        path: &str,
        content: &[u8],
        timestamp_version: u32,
        timestamp_expires: Option<DateTime<Utc>>,
    ) -> FakeRepository {
        let targets = TargetsMetadataBuilder::new()
            .version(7)
            .insert_target_description(
                TargetPath::new(path.to_string()).unwrap(),
                TargetDescription::from_slice(content, &[HashAlgorithm::Sha256]).unwrap(),
            )
            .signed::<Pouf1>(key)
            .unwrap();
        let snapshot = SnapshotMetadataBuilder::new()
            .version(3)
            .insert_metadata(&targets, &[HashAlgorithm::Sha256])
            .unwrap()
            .signed::<Pouf1>(key)
            .unwrap();
        let mut timestamp =
            TimestampMetadataBuilder::from_snapshot(&snapshot, &[HashAlgorithm::Sha256])
                .unwrap()
                .version(timestamp_version);
        if let Some(expires) = timestamp_expires {
            timestamp = timestamp.expires(expires);
        }
        let timestamp = timestamp.signed::<Pouf1>(key).unwrap();

        let raw = |bytes: &[u8]| bytes.to_vec();
        let mut repo = FakeRepository::default();
        repo.metadata.insert(
            META_TIMESTAMP.into(),
            raw(timestamp.to_raw().unwrap().as_bytes()),
        );
        repo.metadata.insert(
            format!("3.{META_SNAPSHOT}"),
            raw(snapshot.to_raw().unwrap().as_bytes()),
        );
        repo.metadata.insert(
            format!("7.{META_TARGETS}"),
            raw(targets.to_raw().unwrap().as_bytes()),
        );
        repo.targets.insert(
            consistent_target_name(path, &sha256_hex(content)),
            content.to_vec(),
        );
        repo
    }

    #[tokio::test]
    async fn test_bootstrap_rotates_root_and_fetches_target() {
        let key = signing_key();
        let dir = tempfile::tempdir().unwrap();
        let mut repo = repository(&key, "policy/mapping.yaml", b"version: v1\n", 1, None);
        repo.metadata.insert("2.root.json".into(), root(&key, 2));
        let repo = Arc::new(repo);

        let client = TufClient::bootstrap(
            TufClientOptions::new(&root(&key, 1), dir.path()),
            repo.clone(),
        )
        .await
        .unwrap();

        assert_eq!(client.root_version(), 2);
        let cached = read_cached(dir.path(), META_ROOT).await.unwrap();
        assert_eq!(metadata_version(&cached), 2);
        assert!(dir.path().join(META_TARGETS).exists());

        let bytes = client.fetch_target("policy/mapping.yaml").await.unwrap();
        assert_eq!(bytes, b"version: v1\n");
        let requested = repo.target_requests.lock().unwrap().clone();
        assert_eq!(
            requested,
            vec![format!("policy/{}.mapping.yaml", sha256_hex(b"version: v1\n"))]
        );
    }

    #[tokio::test]
    async fn test_cached_root_preferred_over_older_embedded_root() {
        let key = signing_key();
        let dir = tempfile::tempdir().unwrap();
        write_atomic(dir.path().join(META_ROOT), root(&key, 4))
            .await
            .unwrap();
        let repo = Arc::new(repository(&key, "mapping.yaml", b"x", 1, None));

        let client = TufClient::bootstrap(TufClientOptions::new(&root(&key, 1), dir.path()), repo)
            .await
            .unwrap();
        assert_eq!(client.root_version(), 4);
    }

    #[tokio::test]
    async fn test_root_signed_by_unknown_key_rejected() {
        let key = signing_key();
        let dir = tempfile::tempdir().unwrap();
        let mut repo = repository(&key, "mapping.yaml", b"x", 1, None);
        repo.metadata
            .insert("2.root.json".into(), root(&signing_key(), 2));

        let result =
            TufClient::bootstrap(TufClientOptions::new(&root(&key, 1), dir.path()), Arc::new(repo))
                .await;
        assert!(result.is_err());
        let cached = read_cached(dir.path(), META_ROOT).await.unwrap();
        assert_eq!(metadata_version(&cached), 1);
    }

    #[tokio::test]
    async fn test_timestamp_rollback_rejected() {
        let key = signing_key();
        let dir = tempfile::tempdir().unwrap();
        let newer = repository(&key, "mapping.yaml", b"x", 5, None);
        write_atomic(dir.path().join(META_ROOT), root(&key, 1))
            .await
            .unwrap();
        write_atomic(
            dir.path().join(META_TIMESTAMP),
            newer.metadata[META_TIMESTAMP].clone(),
        )
        .await
        .unwrap();

        let older = Arc::new(repository(&key, "mapping.yaml", b"x", 4, None));
        let result =
            TufClient::bootstrap(TufClientOptions::new(&root(&key, 1), dir.path()), older).await;

        assert!(result.is_err());
        let cached = read_cached(dir.path(), META_TIMESTAMP).await.unwrap();
        assert_eq!(metadata_version(&cached), 5);
    }

    #[tokio::test]
    async fn test_expired_timestamp_rejected() {
        let key = signing_key();
        let dir = tempfile::tempdir().unwrap();
        let expired = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        let repo = repository(&key, "mapping.yaml", b"x", 1, Some(expired));

        let result =
            TufClient::bootstrap(TufClientOptions::new(&root(&key, 1), dir.path()), Arc::new(repo))
                .await;
        assert!(result.is_err());
        assert!(!dir.path().join(META_TIMESTAMP).exists());
    }

    #[tokio::test]
    async fn test_unsigned_root_is_not_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let unsigned = serde_json::to_vec(&serde_json::json!({
            "signed": {
                "_type": "root",
                "spec_version": "1.0",
                "version": 1,
                "expires": "2099-01-01T00:00:00Z",
                "consistent_snapshot": true,
                "keys": {},
                "roles": {}
            },
            "signatures": []
        }))
        .unwrap();

        let result = TufClient::bootstrap(
            TufClientOptions::new(&unsigned, dir.path()),
            Arc::new(FakeRepository::default()),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tampered_target_rejected() {
        let key = signing_key();
        let dir = tempfile::tempdir().unwrap();
        let mut repo = repository(&key, "mapping.yaml", b"original", 1, None);
        let name = consistent_target_name("mapping.yaml", &sha256_hex(b"original"));
        repo.targets.insert(name, b"tampered".to_vec());

        let client =
            TufClient::bootstrap(TufClientOptions::new(&root(&key, 1), dir.path()), Arc::new(repo))
                .await
                .unwrap();
        assert!(client.fetch_target("mapping.yaml").await.is_err());
        assert!(client.fetch_target("missing.yaml").await.is_err());
    }

    #[tokio::test]
    async fn test_channel_prefix_and_download_cache() {
        let key = signing_key();
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let repo = Arc::new(repository(&key, "testing/mapping.yaml", b"channel", 1, None));

        let client = TufClient::bootstrap(
            TufClientOptions::new(&root(&key, 1), dir.path()).with_path_prefix("testing"),
            repo.clone(),
        )
        .await
        .unwrap();

        assert!(client.target("mapping.yaml").is_some());
        let first = client.download_target("mapping.yaml", cache.path()).await.unwrap();
        let second = client.download_target("mapping.yaml", cache.path()).await.unwrap();
        assert_eq!(first, b"channel");
        assert_eq!(second, b"channel");
        assert_eq!(repo.target_requests.lock().unwrap().len(), 1);
        assert!(cache.path().join("mapping.yaml").exists());
    }

    #[test]
    fn test_consistent_target_name() {
        assert_eq!(consistent_target_name("a/b/c.yaml", "ff"), "a/b/ff.c.yaml");
        assert_eq!(consistent_target_name("c.yaml", "ff"), "ff.c.yaml");
    }

    #[test]
    fn test_meta_version_accepts_both_key_forms() {
        let with_suffix = br#"{"signed":{"version":2,"meta":{"snapshot.json":{"version":9}}}}"#;
        let bare = br#"{"signed":{"version":2,"meta":{"snapshot":{"version":9}}}}"#;
        assert_eq!(meta_version(with_suffix, META_SNAPSHOT), Some(9));
        assert_eq!(meta_version(bare, META_SNAPSHOT), Some(9));
        assert_eq!(meta_version(bare, META_TARGETS), None);
        assert_eq!(metadata_version(b"not json"), 0);
    }
}
