//! Build context: the file tree COPY reads from.
//!
//! The context is never modified. COPY sources are resolved relative to the
//! context root, filtered through `.containerignore` (or `.dockerignore`), and
//! turned into a [`CopyPlan`] whose digest feeds the layer cache key.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Ignore files looked up in the context root, in order.
pub const IGNORE_FILES: &[&str] = &[".containerignore", ".dockerignore"];

#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    ignore: IgnoreRules,
}

/// One filesystem entry to place into a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    /// Absolute path inside the context.
    pub source: PathBuf,
    /// Destination relative to the image root (no leading `/`).
    pub dest: PathBuf,
    pub kind: EntryKind,
    /// Permission bits.
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File { size: u64 },
    Symlink { target: PathBuf },
}

/// Everything a single COPY directive writes, sorted by destination.
#[derive(Debug, Clone, Default)]
pub struct CopyPlan {
    pub entries: Vec<PlannedEntry>,
}

impl BuildContext {
    /// Open a context directory and load its ignore rules.
    pub fn open(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolving build context '{}'", root.display()))?;
        if !root.is_dir() {
            bail!("build context '{}' is not a directory", root.display());
        }

        let mut ignore = IgnoreRules::default();
        for name in IGNORE_FILES {
            let path = root.join(name);
            if path.is_file() {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("reading ignore file '{}'", path.display()))?;
                ignore = IgnoreRules::parse(&text);
                tracing::debug!(file = %path.display(), patterns = ignore.len(), "loaded ignore rules");
                break;
            }
        }

        Ok(Self { root, ignore })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Plan a COPY of `sources` to `dest_abs` (an absolute image path).
    pub fn plan_copy(&self, sources: &[String], dest_abs: &str) -> Result<CopyPlan> {
        let dest_rel = image_relative(dest_abs)?;
        let dest_is_dir = sources.len() > 1
            || dest_abs.ends_with('/')
            || dest_abs.ends_with("/.")
            || dest_rel.as_os_str().is_empty();

        let mut entries = Vec::new();
        for raw in sources {
            let rel = parse_relative_path(raw)?;
            let source = self.root.join(&rel);
            let meta = fs::symlink_metadata(&source).with_context(|| {
                format!("COPY source '{raw}' not found in build context")
            })?;
            if !rel.as_os_str().is_empty() && self.ignore.is_ignored(&rel) {
                bail!("COPY source '{raw}' is excluded by the context ignore file");
            }

            if meta.is_dir() {
                self.plan_dir(&source, &dest_rel, &mut entries)?;
                continue;
            }

            let dest = if dest_is_dir {
                let name = source
                    .file_name()
                    .ok_or_else(|| anyhow::anyhow!("COPY source '{raw}' has no file name"))?;
                dest_rel.join(name)
            } else {
                dest_rel.clone()
            };
            entries.push(planned_entry(source, dest, &meta)?);
        }

        entries.sort_by(|a, b| a.dest.cmp(&b.dest));
        entries.dedup_by(|a, b| a.dest == b.dest);
        Ok(CopyPlan { entries })
    }

    fn plan_dir(&self, dir: &Path, dest_rel: &Path, out: &mut Vec<PlannedEntry>) -> Result<()> {
        let mut walker = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.with_context(|| format!("walking '{}'", dir.display()))?;
            let path = entry.path();
            let context_rel = path.strip_prefix(&self.root).unwrap_or(path);

            if self.ignore.is_ignored(context_rel) {
                // Without negations nothing below an ignored directory can
                // come back, so skip the subtree.
                if entry.file_type().is_dir() && !self.ignore.has_negations() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let within = path.strip_prefix(dir).unwrap_or(path);
            let meta = entry
                .metadata()
                .with_context(|| format!("reading metadata '{}'", path.display()))?;
            out.push(planned_entry(path.to_path_buf(), dest_rel.join(within), &meta)?);
        }
        Ok(())
    }
}

impl CopyPlan {
    /// Content digest of the plan: destinations, kinds, modes and bytes.
    pub fn digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for entry in &self.entries {
            hasher.update(entry.dest.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(format!("{:o}", entry.mode).as_bytes());
            hasher.update([0]);
            match &entry.kind {
                EntryKind::Dir => hasher.update(b"dir"),
                EntryKind::Symlink { target } => {
                    hasher.update(b"symlink:");
                    hasher.update(target.to_string_lossy().as_bytes());
                }
                EntryKind::File { size } => {
                    hasher.update(format!("file:{size}:").as_bytes());
                    hash_file_into(&entry.source, &mut hasher)?;
                }
            }
            hasher.update([0]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn planned_entry(source: PathBuf, dest: PathBuf, meta: &fs::Metadata) -> Result<PlannedEntry> {
    use std::os::unix::fs::PermissionsExt;

    let mode = meta.permissions().mode() & 0o7777;
    let kind = if meta.file_type().is_symlink() {
        let target = fs::read_link(&source)
            .with_context(|| format!("reading link target '{}'", source.display()))?;
        EntryKind::Symlink { target }
    } else if meta.is_dir() {
        EntryKind::Dir
    } else if meta.is_file() {
        EntryKind::File { size: meta.len() }
    } else {
        bail!("unsupported file type in build context: '{}'", source.display());
    };
    Ok(PlannedEntry {
        source,
        dest,
        kind,
        mode,
    })
}

fn hash_file_into(path: &Path, hasher: &mut Sha256) -> Result<()> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(f);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

/// Relative context path; rejects absolute paths and `..` traversal.
pub fn parse_relative_path(raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        bail!("COPY source must be relative to the build context, got '{raw}'");
    }
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("COPY source '{raw}' escapes the build context")
            }
        }
    }
    Ok(out)
}

/// Absolute image path → path relative to the image root, normalising `.`
/// and `..` lexically.
pub fn image_relative(abs: &str) -> Result<PathBuf> {
    if !abs.starts_with('/') {
        bail!("image path '{abs}' must be absolute");
    }
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(abs).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(parts.iter().collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Ignore rules
// ─────────────────────────────────────────────────────────────────────────────

/// Patterns from an ignore file. The last matching pattern wins; `!`
/// re-includes. A pattern matching a directory excludes everything under it.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<IgnorePattern>,
}

#[derive(Debug, Clone)]
struct IgnorePattern {
    segments: Vec<String>,
    negated: bool,
}

impl IgnoreRules {
    pub fn parse(text: &str) -> Self {
        let patterns = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let (negated, body) = match line.strip_prefix('!') {
                    Some(body) => (true, body.trim()),
                    None => (false, line),
                };
                let segments: Vec<String> = body
                    .trim_matches('/')
                    .split('/')
                    .filter(|s| !s.is_empty() && *s != ".")
                    .map(str::to_string)
                    .collect();
                (!segments.is_empty()).then_some(IgnorePattern { segments, negated })
            })
            .collect();
        Self { patterns }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn has_negations(&self) -> bool {
        self.patterns.iter().any(|p| p.negated)
    }

    /// Whether a context-relative path is excluded.
    pub fn is_ignored(&self, rel: &Path) -> bool {
        let segments: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if segments.is_empty() {
            return false;
        }

        let mut ignored = false;
        for pattern in &self.patterns {
            // The path itself or any ancestor directory may match.
            let hit = (1..=segments.len())
                .any(|n| match_segments(&pattern.segments, &segments[..n]));
            if hit {
                ignored = !pattern.negated;
            }
        }
        ignored
    }
}

fn match_segments(pattern: &[String], path: &[String]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((first, rest)) if first == "**" => {
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..]))
        }
        Some((first, rest)) => match path.split_first() {
            Some((head, tail)) => glob_segment(first, head) && match_segments(rest, tail),
            None => false,
        },
    }
}

/// `*` and `?` wildcard match within one path segment.
fn glob_segment(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_p, star_t)) = star {
            pi = star_p + 1;
            ti = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context_with(files: &[(&str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (path, content) in files {
            let full = tmp.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        tmp
    }

    #[test]
    fn single_file_into_directory_dest() {
        let tmp = context_with(&[("requirements.txt", "fastapi==0.110\n")]);
        let ctx = BuildContext::open(tmp.path()).unwrap();

        let plan = ctx.plan_copy(&["requirements.txt".into()], "/app/.").unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].dest, PathBuf::from("app/requirements.txt"));

        let renamed = ctx.plan_copy(&["requirements.txt".into()], "/app/reqs.txt").unwrap();
        assert_eq!(renamed.entries[0].dest, PathBuf::from("app/reqs.txt"));
    }

    #[test]
    fn directory_copy_honours_ignore_file() {
        let tmp = context_with(&[
            ("app.py", "print('hi')\n"),
            ("pkg/mod.py", "x = 1\n"),
            ("__pycache__/app.cpython-311.pyc", "junk"),
            (".git/HEAD", "ref"),
            ("notes.log", "log"),
            ("keep.log", "keep"),
            (".containerignore", "__pycache__\n.git/\n*.log\n!keep.log\n"),
        ]);
        let ctx = BuildContext::open(tmp.path()).unwrap();
        let plan = ctx.plan_copy(&[".".into()], "/app").unwrap();
        let dests: Vec<String> = plan
            .entries
            .iter()
            .map(|e| e.dest.to_string_lossy().into_owned())
            .collect();

        assert!(dests.contains(&"app/app.py".to_string()));
        assert!(dests.contains(&"app/pkg".to_string()));
        assert!(dests.contains(&"app/pkg/mod.py".to_string()));
        assert!(dests.contains(&"app/keep.log".to_string()));
        assert!(!dests.iter().any(|d| d.contains("__pycache__")));
        assert!(!dests.iter().any(|d| d.contains(".git/")));
        assert!(!dests.contains(&"app/notes.log".to_string()));
    }

    #[test]
    fn digest_tracks_content_only() {
        let tmp = context_with(&[("requirements.txt", "fastapi\n"), ("app.py", "v1")]);
        let ctx = BuildContext::open(tmp.path()).unwrap();
        let manifest = || ctx.plan_copy(&["requirements.txt".into()], "/app/").unwrap();
        let before = manifest().digest().unwrap();

        fs::write(tmp.path().join("app.py"), "v2").unwrap();
        assert_eq!(manifest().digest().unwrap(), before);

        fs::write(tmp.path().join("requirements.txt"), "fastapi\nhttpx\n").unwrap();
        assert_ne!(manifest().digest().unwrap(), before);
    }

    #[test]
    fn rejects_escaping_and_missing_sources() {
        let tmp = context_with(&[("a.txt", "a")]);
        let ctx = BuildContext::open(tmp.path()).unwrap();
        assert!(ctx.plan_copy(&["../etc/passwd".into()], "/app/").is_err());
        assert!(ctx.plan_copy(&["/etc/passwd".into()], "/app/").is_err());
        assert!(ctx.plan_copy(&["missing.txt".into()], "/app/").is_err());
    }

    #[test]
    fn image_relative_normalises() {
        assert_eq!(image_relative("/app/./x/../y").unwrap(), PathBuf::from("app/y"));
        assert_eq!(image_relative("/").unwrap(), PathBuf::new());
        assert!(image_relative("app").is_err());
    }

    #[test]
    fn glob_segments() {
        assert!(glob_segment("*.py", "app.py"));
        assert!(glob_segment("a?c", "abc"));
        assert!(!glob_segment("*.py", "app.pyc"));
        assert!(glob_segment("*", ""));

        let rules = IgnoreRules::parse("**/*.pyc\n# comment\n/build/\n");
        assert_eq!(rules.len(), 2);
        assert!(rules.is_ignored(Path::new("pkg/deep/x.pyc")));
        assert!(rules.is_ignored(Path::new("x.pyc")));
        assert!(rules.is_ignored(Path::new("build/out.bin")));
        assert!(!rules.is_ignored(Path::new("src/build.rs")));
    }
}
