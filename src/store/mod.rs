//! Content-addressed layer store.
//!
//! Layout under the store root:
//! - `blobs/sha256/<2>/<64>`: layer blobs, image configs and manifests
//! - `index/layer/<cache key>.json`: cache key → layer blob
//! - `index/image/<encoded name:tag>.json`: tag → manifest blob
//! - `locks/`, `tmp/`: per-key locks and staging for atomic renames
//! - `builds/`: per-build run directories
//!
//! Blobs are verified against their digest whenever they are read back.

pub mod layer;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::image::ImageManifest;
use crate::reference::ImageReference;

pub use layer::{DirReplace, LayerWriter, WrittenLayer};

/// Index kind for cached layers.
pub const LAYER_KIND: &str = "layer";
/// Index kind for image tags.
pub const IMAGE_KIND: &str = "image";

const STALE_TMP_SECS: u64 = 60 * 60;

/// Blob encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobFormat {
    /// A tar archive compressed with zstd.
    TarZst,
    /// A JSON document.
    Json,
}

/// Index entry mapping a key to a content-addressed blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub kind: String,
    pub key: String,
    pub blob_sha256: String,
    pub format: BlobFormat,
    pub size_bytes: u64,
    /// sha256 of the uncompressed layer tar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<String>,
    pub stored_at_unix: u64,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// An index entry resolved to its blob path.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub entry: IndexEntry,
    pub blob_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and create if needed) the store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        store
            .ensure_layout()
            .with_context(|| format!("preparing store at '{}'", root.display()))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.blobs_dir().join("sha256"))?;
        fs::create_dir_all(self.index_dir())?;
        fs::create_dir_all(self.tmp_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.builds_dir())?;
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Root of per-build run directories.
    pub fn builds_dir(&self) -> PathBuf {
        self.root.join("builds")
    }

    fn kind_dir(&self, kind: &str) -> Result<PathBuf> {
        validate_kind(kind)?;
        Ok(self.index_dir().join(kind))
    }

    fn index_path(&self, kind: &str, key: &str) -> Result<PathBuf> {
        validate_kind(kind)?;
        validate_key(key)?;
        Ok(self.index_dir().join(kind).join(format!("{key}.json")))
    }

    fn lock_path(&self, kind: &str, key: &str) -> Result<PathBuf> {
        validate_kind(kind)?;
        validate_key(key)?;
        Ok(self.locks_dir().join(kind).join(format!("{key}.lock")))
    }

    /// Path of a blob by its hex digest.
    pub fn blob_path(&self, sha256: &str) -> Result<PathBuf> {
        validate_sha256(sha256)?;
        let prefix = &sha256[0..2];
        Ok(self.blobs_dir().join("sha256").join(prefix).join(sha256))
    }

    /// Look up an index entry.
    pub fn get(&self, kind: &str, key: &str) -> Result<Option<StoredBlob>> {
        let index_path = self.index_path(kind, key)?;
        if !index_path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&index_path)
            .with_context(|| format!("reading index '{}'", index_path.display()))?;
        let entry: IndexEntry = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing index '{}'", index_path.display()))?;

        let blob_path = self.blob_path(&entry.blob_sha256)?;
        if !blob_path.exists() {
            tracing::warn!(kind, key, blob = %entry.blob_sha256, "index entry points at a missing blob");
            return Ok(None);
        }
        Ok(Some(StoredBlob { entry, blob_path }))
    }

    /// Cached layer for a cache key.
    pub fn get_layer(&self, cache_key: &str) -> Result<Option<StoredBlob>> {
        self.get(LAYER_KIND, cache_key)
    }

    /// Move a written layer into the blob store and index it under `cache_key`.
    pub fn put_layer(
        &self,
        cache_key: &str,
        layer: WrittenLayer,
        meta: BTreeMap<String, serde_json::Value>,
    ) -> Result<IndexEntry> {
        let _lock = self.acquire_lock(LAYER_KIND, cache_key)?;

        let blob_path = self.blob_path(&layer.digest)?;
        if !blob_path.exists() {
            atomic_rename(&layer.path, &blob_path)?;
        } else {
            let _ = fs::remove_file(&layer.path);
        }

        let entry = IndexEntry {
            kind: LAYER_KIND.to_string(),
            key: cache_key.to_string(),
            blob_sha256: layer.digest,
            format: BlobFormat::TarZst,
            size_bytes: layer.size,
            diff_id: Some(layer.diff_id),
            stored_at_unix: now_unix(),
            meta,
        };
        self.write_index(LAYER_KIND, cache_key, &entry)?;
        Ok(entry)
    }

    /// Write a JSON document as a blob. Returns `(hex digest, size)`.
    /// Compact serialization keeps the digest stable.
    pub fn put_json_blob<T: Serialize>(&self, value: &T) -> Result<(String, u64)> {
        let bytes = serde_json::to_vec(value).context("serializing JSON blob")?;
        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        let blob_path = self.blob_path(&sha256)?;
        if !blob_path.exists() {
            let tmp = self.tmp_dir().join(tmp_name(&format!("blob-{}", &sha256[..16])));
            fs::write(&tmp, &bytes).with_context(|| format!("writing '{}'", tmp.display()))?;
            atomic_rename(&tmp, &blob_path)?;
        }
        Ok((sha256, bytes.len() as u64))
    }

    /// Read a JSON blob, verifying its digest.
    pub fn read_json_blob<T: DeserializeOwned>(&self, sha256: &str) -> Result<T> {
        let path = self.blob_path(sha256)?;
        let bytes = fs::read(&path).with_context(|| format!("reading blob '{}'", path.display()))?;
        let actual = format!("{:x}", Sha256::digest(&bytes));
        if actual != sha256 {
            bail!(
                "Blob hash mismatch for '{}'\n  expected: {}\n  actual:   {}",
                path.display(),
                sha256,
                actual
            );
        }
        serde_json::from_slice(&bytes).with_context(|| format!("parsing blob '{}'", path.display()))
    }

    /// Point `reference` at a manifest blob.
    pub fn tag(&self, reference: &ImageReference, manifest_sha256: &str, size: u64) -> Result<()> {
        let key = encode_tag(reference);
        let _lock = self.acquire_lock(IMAGE_KIND, &key)?;
        let manifest_path = self.blob_path(manifest_sha256)?;
        if !manifest_path.exists() {
            bail!("cannot tag {reference}: manifest blob {manifest_sha256} is missing");
        }

        let mut meta = BTreeMap::new();
        meta.insert(
            "reference".to_string(),
            serde_json::Value::String(reference.name_and_tag()),
        );
        let entry = IndexEntry {
            kind: IMAGE_KIND.to_string(),
            key: key.clone(),
            blob_sha256: manifest_sha256.to_string(),
            format: BlobFormat::Json,
            size_bytes: size,
            diff_id: None,
            stored_at_unix: now_unix(),
            meta,
        };
        self.write_index(IMAGE_KIND, &key, &entry)
    }

    /// Manifest entry for a tag.
    pub fn resolve_tag(&self, reference: &ImageReference) -> Result<Option<StoredBlob>> {
        self.get(IMAGE_KIND, &encode_tag(reference))
    }

    /// Verify a layer blob and unpack it over `root`.
    pub fn apply_layer(&self, sha256: &str, root: &Path, dirs: DirReplace) -> Result<usize> {
        let blob_path = self.blob_path(sha256)?;
        if !blob_path.exists() {
            bail!("layer blob missing: {}", blob_path.display());
        }
        // Verify blob hash on read (corruption detection).
        let (actual_sha, _sz) = sha256_file(&blob_path)?;
        if actual_sha != sha256 {
            bail!(
                "Blob hash mismatch for layer\n  expected: {}\n  actual:   {}",
                sha256,
                actual_sha
            );
        }
        layer::apply(&blob_path, root, dirs)
            .with_context(|| format!("applying layer sha256:{sha256}"))
    }

    /// List index entries for a kind, newest first.
    pub fn list_kind(&self, kind: &str) -> Result<Vec<IndexEntry>> {
        let dir = self.kind_dir(kind)?;
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut out = vec![];
        for ent in fs::read_dir(&dir).with_context(|| format!("reading '{}'", dir.display()))? {
            let ent = ent?;
            let path = ent.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            let entry: IndexEntry = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing index '{}'", path.display()))?;
            out.push(entry);
        }

        out.sort_by(|a, b| {
            b.stored_at_unix
                .cmp(&a.stored_at_unix)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(out)
    }

    /// Remove blobs no index entry reaches, following image manifests to
    /// their config and layers. Also clears stale leftovers in `tmp/`.
    pub fn gc(&self) -> Result<usize> {
        let referenced = self.collect_referenced_blobs()?;

        let blobs_root = self.blobs_dir().join("sha256");
        let mut removed = 0usize;
        for ent in WalkDir::new(&blobs_root).into_iter().filter_map(Result::ok) {
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if !is_hex_64(&name) || referenced.contains(&name) {
                continue;
            }
            fs::remove_file(ent.path()).with_context(|| {
                format!("removing unreferenced blob '{}'", ent.path().display())
            })?;
            removed += 1;
        }

        // Fresh staging files may belong to a running build.
        for ent in fs::read_dir(self.tmp_dir())? {
            let ent = ent?;
            let stale = ent
                .metadata()
                .and_then(|md| md.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age.as_secs() >= STALE_TMP_SECS);
            if !stale {
                continue;
            }
            let path = ent.path();
            if path.is_dir() {
                let _ = fs::remove_dir_all(&path);
            } else {
                let _ = fs::remove_file(&path);
            }
        }

        tracing::info!(removed, kept = referenced.len(), "store gc finished");
        Ok(removed)
    }

    /// Keep the newest `keep_last` cached layers; tags are never pruned.
    /// Returns the number of index entries removed.
    pub fn prune_keep_last(&self, keep_last: usize) -> Result<usize> {
        if keep_last == 0 {
            bail!("keep_last must be >= 1");
        }

        let mut removed = 0usize;
        for entry in self.list_kind(LAYER_KIND)?.into_iter().skip(keep_last) {
            let path = self.index_path(LAYER_KIND, &entry.key)?;
            if path.exists() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let referenced = self.collect_referenced_blobs()?;
        let mut blob_bytes = 0u64;
        let mut blob_files = 0u64;
        for sha in &referenced {
            let p = self.blob_path(sha)?;
            if let Ok(md) = fs::metadata(&p) {
                blob_files += 1;
                blob_bytes += md.len();
            }
        }

        Ok(StoreStatus {
            root: self.root.clone(),
            layers: self.list_kind(LAYER_KIND)?.len() as u64,
            images: self.list_kind(IMAGE_KIND)?.len() as u64,
            referenced_blobs: blob_files,
            referenced_bytes: blob_bytes,
        })
    }

    fn write_index(&self, kind: &str, key: &str, entry: &IndexEntry) -> Result<()> {
        let dir = self.kind_dir(kind)?;
        fs::create_dir_all(&dir)?;
        let path = self.index_path(kind, key)?;

        let bytes = serde_json::to_vec_pretty(entry)?;
        let tmp = self.tmp_dir().join(tmp_name("index.json"));
        fs::write(&tmp, bytes)?;
        atomic_rename(&tmp, &path)?;
        Ok(())
    }

    fn collect_referenced_blobs(&self) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for kind in [LAYER_KIND, IMAGE_KIND] {
            for entry in self.list_kind(kind)? {
                if !is_hex_64(&entry.blob_sha256) {
                    continue;
                }
                if kind == IMAGE_KIND {
                    match self.read_json_blob::<ImageManifest>(&entry.blob_sha256) {
                        Ok(manifest) => {
                            for descriptor in std::iter::once(&manifest.config).chain(&manifest.layers) {
                                if let Some(hex) = descriptor.digest.strip_prefix("sha256:") {
                                    out.insert(hex.to_string());
                                }
                            }
                        }
                        Err(err) => {
                            tracing::warn!(tag = %entry.key, error = %err, "unreadable image manifest");
                        }
                    }
                }
                out.insert(entry.blob_sha256);
            }
        }
        Ok(out)
    }

    fn acquire_lock(&self, kind: &str, key: &str) -> Result<StoreLock> {
        let lock_path = self.lock_path(kind, key)?;
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Never unlink a lock file that may still be held: a second process
        // could then lock a fresh file at the same path.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("creating lock file '{}'", lock_path.display()))?;

        if lock_file.try_lock_exclusive().is_err() {
            drop(lock_file);
            bail!(
                "store key is locked by another process: {}",
                lock_path.display()
            );
        }

        Ok(StoreLock { _file: lock_file })
    }
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub root: PathBuf,
    pub layers: u64,
    pub images: u64,
    pub referenced_blobs: u64,
    pub referenced_bytes: u64,
}

/// Held while writing under one key; the lock is released when the file
/// is closed.
#[derive(Debug)]
struct StoreLock {
    _file: File,
}

/// Index key for a tag. `/` cannot appear in a file name.
pub fn encode_tag(reference: &ImageReference) -> String {
    reference
        .name_and_tag()
        .replace('%', "%25")
        .replace('/', "%2F")
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Unique name for a staging file or directory under `tmp/`.
pub fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_e) => {
            // Fall back to copy+remove (e.g. EXDEV).
            fs::copy(src, dst)
                .with_context(|| format!("copying '{}' to '{}'", src.display(), dst.display()))?;
            fs::remove_file(src).with_context(|| format!("removing tmp '{}'", src.display()))?;
            Ok(())
        }
    }
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let sha = format!("{:x}", hasher.finalize());
    Ok((sha, size))
}

fn validate_kind(kind: &str) -> Result<()> {
    if kind.is_empty() {
        bail!("index kind must not be empty");
    }
    if kind.contains('/') || kind.contains('\\') || kind.contains("..") {
        bail!("index kind must be a safe filename segment: {kind}");
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key == "." || key == ".." {
        bail!("index key must not be empty or a relative path component");
    }
    if key.contains('/') || key.contains('\\') {
        bail!("index key must be a safe filename segment: {key}");
    }
    Ok(())
}

fn validate_sha256(sha256: &str) -> Result<()> {
    if !is_hex_64(sha256) {
        bail!("invalid sha256: {sha256}");
    }
    Ok(())
}

fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
