//! Layer blobs: deterministic `tar` streams compressed with zstd.
//!
//! Every header has mtime 0 and uid/gid 0, and callers append entries in
//! sorted path order, so the same filesystem delta always produces the same
//! bytes. The diff id (sha256 of the uncompressed tar) is computed while
//! writing.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

/// Prefix marking a deleted path.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Marks a directory whose lower-layer contents are hidden.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const ZSTD_LEVEL: i32 = 3;

/// A finished layer waiting to be moved into the blob store.
#[derive(Debug, Clone)]
pub struct WrittenLayer {
    pub path: PathBuf,
    /// sha256 of the compressed blob, hex.
    pub digest: String,
    /// sha256 of the uncompressed tar, hex.
    pub diff_id: String,
    pub size: u64,
    pub entries: usize,
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type Encoder = zstd::stream::Encoder<'static, BufWriter<File>>;

pub struct LayerWriter {
    path: PathBuf,
    builder: tar::Builder<HashingWriter<Encoder>>,
    entries: usize,
}

impl LayerWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("creating layer '{}'", path.display()))?;
        let encoder = zstd::stream::Encoder::new(BufWriter::new(file), ZSTD_LEVEL)?;
        let mut builder = tar::Builder::new(HashingWriter {
            inner: encoder,
            hasher: Sha256::new(),
        });
        builder.mode(tar::HeaderMode::Deterministic);
        Ok(Self {
            path: path.to_path_buf(),
            builder,
            entries: 0,
        })
    }

    pub fn append_dir(&mut self, rel: &Path, mode: u32) -> Result<()> {
        let mut header = base_header(tar::EntryType::Directory, mode);
        header.set_size(0);
        self.append(&mut header, rel, io::empty())
    }

    pub fn append_file(&mut self, rel: &Path, mode: u32, source: &Path) -> Result<()> {
        let file =
            File::open(source).with_context(|| format!("opening '{}'", source.display()))?;
        let len = file.metadata()?.len();
        let mut header = base_header(tar::EntryType::Regular, mode);
        header.set_size(len);
        self.append(&mut header, rel, file)
    }

    pub fn append_symlink(&mut self, rel: &Path, target: &Path) -> Result<()> {
        let mut header = base_header(tar::EntryType::Symlink, 0o777);
        header.set_size(0);
        self.builder
            .append_link(&mut header, rel, target)
            .with_context(|| format!("appending symlink '{}'", rel.display()))?;
        self.entries += 1;
        Ok(())
    }

    /// Record that `rel` was deleted.
    pub fn append_whiteout(&mut self, rel: &Path) -> Result<()> {
        let name = rel
            .file_name()
            .with_context(|| format!("whiteout for '{}' has no file name", rel.display()))?;
        let marker = rel.with_file_name(format!("{WHITEOUT_PREFIX}{}", name.to_string_lossy()));
        let mut header = base_header(tar::EntryType::Regular, 0o644);
        header.set_size(0);
        self.append(&mut header, &marker, io::empty())
    }

    /// Append whatever lives at `source` (file, dir or symlink) as `rel`.
    /// Special files are skipped.
    pub fn append_path(&mut self, rel: &Path, source: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(source)
            .with_context(|| format!("reading metadata '{}'", source.display()))?;
        let mode = meta.permissions().mode() & 0o7777;
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(source)?;
            self.append_symlink(rel, &target)
        } else if file_type.is_dir() {
            self.append_dir(rel, mode)
        } else if file_type.is_file() {
            self.append_file(rel, mode, source)
        } else {
            tracing::debug!(path = %source.display(), "skipping special file");
            Ok(())
        }
    }

    /// Append everything below `root`, in file-name order.
    pub fn append_tree(&mut self, root: &Path) -> Result<()> {
        for entry in walkdir::WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
        {
            let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
            let rel = entry.path().strip_prefix(root)?;
            self.append_path(rel, entry.path())?;
        }
        Ok(())
    }

    fn append<R: Read>(&mut self, header: &mut tar::Header, rel: &Path, data: R) -> Result<()> {
        self.builder
            .append_data(header, rel, data)
            .with_context(|| format!("appending '{}' to layer", rel.display()))?;
        self.entries += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<WrittenLayer> {
        let hashing = self
            .builder
            .into_inner()
            .context("finalizing layer tar stream")?;
        let diff_id = format!("{:x}", hashing.hasher.finalize());
        let mut writer = hashing.inner.finish().context("finalizing zstd stream")?;
        writer.flush()?;
        drop(writer);

        let (digest, size) = super::sha256_file(&self.path)?;
        Ok(WrittenLayer {
            path: self.path,
            digest,
            diff_id,
            size,
            entries: self.entries,
        })
    }
}

fn base_header(kind: tar::EntryType, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header
}

/// What [`apply`] does when a non-directory entry lands on an existing
/// directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirReplace {
    /// Remove the directory first. Command layers may turn a directory into
    /// a file.
    #[default]
    Allow,
    /// Fail. Used for COPY layers, which only ever add to a directory.
    Refuse,
}

/// Apply a layer blob on top of `root`, honouring whiteouts.
pub fn apply(blob: &Path, root: &Path, dirs: DirReplace) -> Result<usize> {
    let file = File::open(blob).with_context(|| format!("opening layer '{}'", blob.display()))?;
    let decoder = zstd::stream::Decoder::new(file)?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut applied = 0usize;
    for entry in archive
        .entries()
        .with_context(|| format!("reading layer '{}'", blob.display()))?
    {
        let mut entry = entry.with_context(|| format!("reading layer '{}'", blob.display()))?;
        let rel = entry.path()?.into_owned();
        let rel = safe_relative(&rel)?;

        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name == OPAQUE_WHITEOUT {
            let dir = root.join(rel.parent().unwrap_or(Path::new("")));
            clear_dir(&dir)?;
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_any(&root.join(rel.with_file_name(hidden)))?;
            continue;
        }

        let target = root.join(&rel);
        let is_dir = entry.header().entry_type().is_dir();
        if let Ok(existing) = fs::symlink_metadata(&target) {
            if existing.is_dir() && !is_dir {
                if dirs == DirReplace::Refuse {
                    bail!(
                        "refusing to replace directory '/{}' with a non-directory",
                        rel.display()
                    );
                }
                fs::remove_dir_all(&target)
                    .with_context(|| format!("replacing directory '{}'", target.display()))?;
            } else if !existing.is_dir() {
                fs::remove_file(&target)
                    .with_context(|| format!("replacing '{}'", target.display()))?;
            }
        }
        entry
            .unpack_in(root)
            .with_context(|| format!("unpacking '{}'", rel.display()))?;
        applied += 1;
    }
    Ok(applied)
}

fn safe_relative(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => bail!("layer entry '{}' escapes the rootfs", path.display()),
        }
    }
    Ok(out)
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .with_context(|| format!("removing '{}'", path.display())),
        Ok(_) => fs::remove_file(path).with_context(|| format!("removing '{}'", path.display())),
        Err(_) => Ok(()),
    }
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        remove_any(&entry?.path())?;
    }
    Ok(())
}
