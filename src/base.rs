//! Base image sources.
//!
//! A base image is a root filesystem plus a little runtime config. The
//! [`LocalBaseSource`] reads them from a directory laid out as
//! `<bases_dir>/<name>/<tag>/` containing one of `rootfs/`, `rootfs.tar` or
//! `rootfs.tar.zst`, and optionally `config.json`:
//!
//! ```json
//! { "env": { "PATH": "/usr/local/bin:/usr/bin:/bin" }, "workdir": "/", "cmd": ["python3"] }
//! ```
//!
//! Registry pulls would be another [`BaseImageSource`] implementation.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::reference::ImageReference;

pub const ROOTFS_DIR: &str = "rootfs";
pub const ROOTFS_TAR: &str = "rootfs.tar";
pub const ROOTFS_TAR_ZST: &str = "rootfs.tar.zst";
pub const BASE_CONFIG_FILE: &str = "config.json";

/// Where a base image's filesystem comes from.
pub trait BaseImageSource {
    /// Locate the base and compute its digest. Does not unpack anything.
    fn fetch(&self, reference: &ImageReference) -> Result<FetchedBase>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRootfs {
    Dir(PathBuf),
    Tar(PathBuf),
    TarZst(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseConfig {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct FetchedBase {
    pub reference: ImageReference,
    /// `sha256:<hex>` of the root filesystem.
    pub digest: String,
    /// `sha256:<hex>` of `config.json`, when present.
    pub config_digest: Option<String>,
    pub rootfs: BaseRootfs,
    pub config: BaseConfig,
}

impl FetchedBase {
    /// Unpack the root filesystem into `dest` (created if needed).
    pub fn unpack_into(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).with_context(|| format!("creating '{}'", dest.display()))?;
        match &self.rootfs {
            BaseRootfs::Dir(src) => copy_tree(src, dest),
            BaseRootfs::Tar(path) => {
                let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
                unpack_tar(tar::Archive::new(f), path, dest)
            }
            BaseRootfs::TarZst(path) => {
                let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
                let decoder = zstd::stream::Decoder::new(f)?;
                unpack_tar(tar::Archive::new(decoder), path, dest)
            }
        }
    }

    /// Absolute image paths of every directory in the root filesystem, read
    /// without unpacking.
    pub fn directories(&self) -> Result<Vec<String>> {
        let mut dirs = Vec::new();
        match &self.rootfs {
            BaseRootfs::Dir(src) => {
                for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
                    let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
                    if entry.file_type().is_dir() {
                        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
                        dirs.push(format!("/{}", rel.display()));
                    }
                }
            }
            BaseRootfs::Tar(path) => {
                let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
                tar_directories(tar::Archive::new(f), path, &mut dirs)?;
            }
            BaseRootfs::TarZst(path) => {
                let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
                let decoder = zstd::stream::Decoder::new(f)?;
                tar_directories(tar::Archive::new(decoder), path, &mut dirs)?;
            }
        }
        Ok(dirs)
    }
}

fn tar_directories<R: Read>(mut archive: tar::Archive<R>, source: &Path, out: &mut Vec<String>) -> Result<()> {
    let entries = archive
        .entries()
        .with_context(|| format!("reading base rootfs '{}'", source.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading base rootfs '{}'", source.display()))?;
        if !entry.header().entry_type().is_dir() {
            continue;
        }
        let path = entry.path()?;
        let rel = path.to_string_lossy();
        let rel = rel.trim_start_matches("./").trim_matches('/');
        if !rel.is_empty() {
            out.push(format!("/{rel}"));
        }
    }
    Ok(())
}

/// Base images stored under a local directory.
#[derive(Debug, Clone)]
pub struct LocalBaseSource {
    root: PathBuf,
}

impl LocalBaseSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BaseImageSource for LocalBaseSource {
    fn fetch(&self, reference: &ImageReference) -> Result<FetchedBase> {
        let dir = self.root.join(reference.relative_dir());
        if !dir.is_dir() {
            bail!(
                "base image '{}' not found (expected directory '{}')",
                reference,
                dir.display()
            );
        }

        let rootfs = if dir.join(ROOTFS_DIR).is_dir() {
            BaseRootfs::Dir(dir.join(ROOTFS_DIR))
        } else if dir.join(ROOTFS_TAR_ZST).is_file() {
            BaseRootfs::TarZst(dir.join(ROOTFS_TAR_ZST))
        } else if dir.join(ROOTFS_TAR).is_file() {
            BaseRootfs::Tar(dir.join(ROOTFS_TAR))
        } else {
            bail!(
                "base image '{}' has no root filesystem in '{}' (expected {}, {} or {})",
                reference,
                dir.display(),
                ROOTFS_DIR,
                ROOTFS_TAR_ZST,
                ROOTFS_TAR
            );
        };

        let digest = match &rootfs {
            BaseRootfs::Dir(path) => tree_digest(path)?,
            BaseRootfs::Tar(path) | BaseRootfs::TarZst(path) => file_digest(path)?,
        };
        let digest = format!("sha256:{digest}");

        if let Some(pinned) = &reference.digest {
            if *pinned != digest {
                bail!(
                    "base image '{}' digest mismatch\n  expected: {}\n  actual:   {}",
                    reference.name_and_tag(),
                    pinned,
                    digest
                );
            }
        }

        let config_path = dir.join(BASE_CONFIG_FILE);
        let (config, config_digest) = if config_path.is_file() {
            let bytes = fs::read(&config_path)
                .with_context(|| format!("reading base config '{}'", config_path.display()))?;
            let config: BaseConfig = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing base config '{}'", config_path.display()))?;
            let digest = format!("sha256:{:x}", Sha256::digest(&bytes));
            (config, Some(digest))
        } else {
            (BaseConfig::default(), None)
        };

        tracing::debug!(base = %reference, %digest, "resolved base image");
        Ok(FetchedBase {
            reference: reference.clone(),
            digest,
            config_digest,
            rootfs,
            config,
        })
    }
}

/// Deterministic digest of a directory tree: paths, types, permission bits,
/// file contents and link targets. Hex, no prefix.
pub fn tree_digest(root: &Path) -> Result<String> {
    use std::os::unix::fs::PermissionsExt;

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name().min_depth(1) {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let meta = entry
            .metadata()
            .with_context(|| format!("reading metadata '{}'", entry.path().display()))?;

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(format!("{:o}", meta.permissions().mode() & 0o7777).as_bytes());
        hasher.update([0]);
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            hasher.update(b"symlink:");
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"dir");
        } else if file_type.is_file() {
            hasher.update(format!("file:{}:", meta.len()).as_bytes());
            let mut reader = BufReader::new(File::open(entry.path())?);
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        } else {
            hasher.update(b"special");
        }
        hasher.update([0]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn file_digest(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(f);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("hashing '{}'", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn unpack_tar<R: Read>(mut archive: tar::Archive<R>, source: &Path, dest: &Path) -> Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .with_context(|| format!("unpacking base rootfs '{}'", source.display()))
}

/// Copy a directory tree preserving symlinks and permission bits.
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    use std::os::unix::fs::{symlink, PermissionsExt};

    // Directory modes are applied last so read-only directories can still
    // be filled.
    let mut dir_modes = Vec::new();
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name().min_depth(1) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(&link, &target)
                .with_context(|| format!("creating symlink '{}'", target.display()))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating '{}'", target.display()))?;
            dir_modes.push((target, entry.metadata()?.permissions().mode()));
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copying '{}' to '{}'", entry.path().display(), target.display())
            })?;
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping special file in base rootfs");
        }
    }
    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting mode on '{}'", dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_base(root: &Path, name: &str, tag: &str) -> PathBuf {
        let dir = root.join(name).join(tag);
        fs::create_dir_all(dir.join("rootfs/etc")).unwrap();
        fs::write(dir.join("rootfs/etc/os-release"), "ID=debian\n").unwrap();
        dir
    }

    #[test]
    fn fetches_directory_base_with_config() {
        let tmp = TempDir::new().unwrap();
        let dir = make_base(tmp.path(), "python", "3.11-slim");
        fs::write(
            dir.join(BASE_CONFIG_FILE),
            r#"{"env": {"PATH": "/usr/local/bin:/usr/bin:/bin", "LANG": "C.UTF-8"}, "cmd": ["python3"]}"#,
        )
        .unwrap();

        let source = LocalBaseSource::new(tmp.path());
        let reference: ImageReference = "python:3.11-slim".parse().unwrap();
        let base = source.fetch(&reference).unwrap();

        assert!(base.digest.starts_with("sha256:"));
        assert!(base.config_digest.is_some());
        assert_eq!(base.config.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(base.config.cmd.as_deref(), Some(&["python3".to_string()][..]));

        let out = tmp.path().join("unpacked");
        base.unpack_into(&out).unwrap();
        assert_eq!(fs::read_to_string(out.join("etc/os-release")).unwrap(), "ID=debian\n");
        assert_eq!(base.directories().unwrap(), ["/etc"]);
    }

    #[test]
    fn lists_directories_of_tar_bases() {
        let tmp = TempDir::new().unwrap();
        let dir = make_base(tmp.path(), "python", "3.11-slim");
        fs::create_dir_all(dir.join("rootfs/usr/local/bin")).unwrap();
        let mut builder = tar::Builder::new(File::create(dir.join(ROOTFS_TAR)).unwrap());
        for rel in ["etc", "usr", "usr/local", "usr/local/bin"] {
            builder.append_dir(rel, dir.join("rootfs").join(rel)).unwrap();
        }
        builder
            .append_path_with_name(dir.join("rootfs/etc/os-release"), "etc/os-release")
            .unwrap();
        builder.into_inner().unwrap();
        fs::remove_dir_all(dir.join("rootfs")).unwrap();

        let source = LocalBaseSource::new(tmp.path());
        let reference: ImageReference = "python:3.11-slim".parse().unwrap();
        let base = source.fetch(&reference).unwrap();
        assert!(matches!(base.rootfs, BaseRootfs::Tar(_)));
        let mut dirs = base.directories().unwrap();
        dirs.sort();
        assert_eq!(dirs, ["/etc", "/usr", "/usr/local", "/usr/local/bin"]);
    }

    #[test]
    fn pinned_digest_is_verified() {
        let tmp = TempDir::new().unwrap();
        make_base(tmp.path(), "python", "3.11-slim");
        let source = LocalBaseSource::new(tmp.path());

        let plain: ImageReference = "python:3.11-slim".parse().unwrap();
        let digest = source.fetch(&plain).unwrap().digest;

        let pinned: ImageReference = format!("python:3.11-slim@{digest}").parse().unwrap();
        source.fetch(&pinned).unwrap();

        let wrong: ImageReference = format!("python:3.11-slim@sha256:{}", "0".repeat(64)).parse().unwrap();
        let err = source.fetch(&wrong).unwrap_err().to_string();
        assert!(err.contains("digest mismatch"), "{err}");
    }

    #[test]
    fn missing_base_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let source = LocalBaseSource::new(tmp.path());
        let reference: ImageReference = "python:3.12".parse().unwrap();
        assert!(source.fetch(&reference).is_err());

        fs::create_dir_all(tmp.path().join("python/3.12")).unwrap();
        let err = source.fetch(&reference).unwrap_err().to_string();
        assert!(err.contains("no root filesystem"), "{err}");
    }

    #[test]
    fn tree_digest_changes_with_content() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), "1").unwrap();
        let before = tree_digest(tmp.path()).unwrap();
        assert_eq!(tree_digest(tmp.path()).unwrap(), before);
        fs::write(tmp.path().join("a"), "2").unwrap();
        assert_ne!(tree_digest(tmp.path()).unwrap(), before);
    }
}
