//! Application dependency manifest (`requirements.txt`).
//!
//! Supports the subset of the pip requirements format that service images
//! actually use: requirement lines with extras, version specifiers and
//! environment markers, direct URL references, nested `-r` includes,
//! `-c` constraint files and the index/binary options. Anything else is an
//! error so that a malformed manifest fails the build instead of being
//! silently ignored by the installer.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("reading manifest {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: {message}", .path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{}: include cycle through {}", .path.display(), .include.display())]
    IncludeCycle { path: PathBuf, include: PathBuf },

    #[error("conflicting requirements for '{name}': `{first}` ({first_at}) vs `{second}` ({second_at})")]
    Conflict {
        name: String,
        first: String,
        first_at: String,
        second: String,
        second_at: String,
    },
}

/// A fully parsed manifest, includes resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub requirements: Vec<Requirement>,
    pub constraints: Vec<Requirement>,
    pub options: ManifestOptions,
    /// Every file read, in the order first visited.
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestOptions {
    pub index_url: Option<String>,
    pub extra_index_urls: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub find_links: Vec<String>,
    pub pre: bool,
    pub no_binary: Vec<String>,
    pub only_binary: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Name as written.
    pub name: String,
    pub extras: Vec<String>,
    pub specifiers: Vec<Specifier>,
    pub url: Option<String>,
    pub marker: Option<String>,
    pub hashes: Vec<String>,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub file: PathBuf,
    pub line: usize,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operator {
    Arbitrary,
    Compatible,
    Equal,
    NotEqual,
    LessEqual,
    GreaterEqual,
    Less,
    Greater,
}

impl Operator {
    // Longest first so "===" wins over "==".
    const ALL: [(&'static str, Operator); 8] = [
        ("===", Operator::Arbitrary),
        ("~=", Operator::Compatible),
        ("==", Operator::Equal),
        ("!=", Operator::NotEqual),
        ("<=", Operator::LessEqual),
        (">=", Operator::GreaterEqual),
        ("<", Operator::Less),
        (">", Operator::Greater),
    ];

    pub fn as_str(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(s, _)| *s)
            .unwrap_or("==")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specifier {
    pub op: Operator,
    pub version: String,
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

impl Requirement {
    /// PEP 503 normalized name.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Requirement without its origin, for conflict comparison.
    fn constraint_text(&self) -> String {
        let mut specs = self.specifiers.clone();
        specs.sort();
        let mut extras: Vec<String> = self.extras.iter().map(|e| normalize_name(e)).collect();
        extras.sort();
        let mut out = normalize_name(&self.name);
        if !extras.is_empty() {
            out.push_str(&format!("[{}]", extras.join(",")));
        }
        if let Some(url) = &self.url {
            out.push_str(&format!(" @ {url}"));
        }
        out.push_str(
            &specs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );
        out
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if let Some(url) = &self.url {
            write!(f, " @ {url}")?;
        }
        let specs: Vec<String> = self.specifiers.iter().map(ToString::to_string).collect();
        write!(f, "{}", specs.join(","))?;
        if let Some(marker) = &self.marker {
            write!(f, "; {marker}")?;
        }
        Ok(())
    }
}

/// Lowercase, runs of `-`, `_` and `.` collapsed to `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_sep {
                out.push('-');
            }
            in_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            in_sep = false;
        }
    }
    out
}

/// Parse a manifest file. Includes must stay under `root`.
pub fn parse_manifest(path: &Path, root: &Path) -> Result<Manifest, ManifestError> {
    let mut parser = Parser {
        root: root.to_path_buf(),
        stack: Vec::new(),
        manifest: Manifest::default(),
    };
    parser.parse_file(path, FileRole::Requirements)?;

    let manifest = parser.manifest;
    check_conflicts(&manifest.requirements)?;
    check_conflicts(&manifest.constraints)?;
    Ok(manifest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileRole {
    Requirements,
    Constraints,
}

struct Parser {
    root: PathBuf,
    stack: Vec<PathBuf>,
    manifest: Manifest,
}

impl Parser {
    fn parse_file(&mut self, path: &Path, role: FileRole) -> Result<(), ManifestError> {
        if self.stack.iter().any(|p| p == path) {
            return Err(ManifestError::IncludeCycle {
                path: self.stack.last().cloned().unwrap_or_default(),
                include: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !self.manifest.files.iter().any(|p| p == path) {
            self.manifest.files.push(path.to_path_buf());
        }

        self.stack.push(path.to_path_buf());
        for (line, content) in logical_lines(&text) {
            self.parse_line(path, line, &content, role)?;
        }
        self.stack.pop();
        Ok(())
    }

    fn parse_line(
        &mut self,
        path: &Path,
        line: usize,
        content: &str,
        role: FileRole,
    ) -> Result<(), ManifestError> {
        let syntax = |message: String| ManifestError::Syntax {
            path: path.to_path_buf(),
            line,
            message,
        };

        if content.starts_with('-') {
            let words: Vec<&str> = content.split_whitespace().collect();
            let (option, value) = split_option(&words).map_err(syntax)?;
            return self.apply_option(path, line, option, value, role);
        }

        let origin = Origin {
            file: path.to_path_buf(),
            line,
        };
        let requirement = parse_requirement(content, origin).map_err(syntax)?;
        match role {
            FileRole::Requirements => self.manifest.requirements.push(requirement),
            FileRole::Constraints => self.manifest.constraints.push(requirement),
        }
        Ok(())
    }

    fn apply_option(
        &mut self,
        path: &Path,
        line: usize,
        option: &str,
        value: Option<String>,
        role: FileRole,
    ) -> Result<(), ManifestError> {
        let syntax = |message: String| ManifestError::Syntax {
            path: path.to_path_buf(),
            line,
            message,
        };
        let needs_value = |value: Option<String>| {
            value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| syntax(format!("option '{option}' requires a value")))
        };

        let options = &mut self.manifest.options;
        match option {
            "-r" | "--requirement" | "-c" | "--constraint" => {
                let target = needs_value(value)?;
                let include = self.resolve_include(path, &target).map_err(syntax)?;
                let child_role = if option == "-c" || option == "--constraint" {
                    FileRole::Constraints
                } else {
                    role
                };
                self.parse_file(&include, child_role)?;
            }
            "-i" | "--index-url" => options.index_url = Some(needs_value(value)?),
            "--extra-index-url" => options.extra_index_urls.push(needs_value(value)?),
            "--trusted-host" => options.trusted_hosts.push(needs_value(value)?),
            "-f" | "--find-links" => options.find_links.push(needs_value(value)?),
            "--no-binary" => options.no_binary.push(needs_value(value)?),
            "--only-binary" => options.only_binary.push(needs_value(value)?),
            "--pre" => {
                if value.is_some() {
                    return Err(syntax("option '--pre' takes no value".to_string()));
                }
                options.pre = true;
            }
            other => return Err(syntax(format!("unsupported option '{other}'"))),
        }
        Ok(())
    }

    /// Include paths are relative to the including file and may not leave
    /// the manifest root.
    fn resolve_include(&self, from: &Path, target: &str) -> Result<PathBuf, String> {
        if Path::new(target).is_absolute() {
            return Err(format!("include '{target}' must be a relative path"));
        }
        let base = from.parent().unwrap_or(Path::new(""));
        let mut resolved = PathBuf::new();
        for component in base.join(target).components() {
            match component {
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir => {}
                other => resolved.push(other.as_os_str()),
            }
        }
        if !resolved.starts_with(&self.root) {
            return Err(format!("include '{target}' escapes the manifest root"));
        }
        Ok(resolved)
    }
}

/// Join `\` continuations, strip comments, drop blank lines.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let (start, mut buf) = pending.take().unwrap_or((line_no, String::new()));
        if let Some(stripped) = raw.strip_suffix('\\') {
            buf.push_str(stripped);
            buf.push(' ');
            pending = Some((start, buf));
            continue;
        }
        buf.push_str(raw);
        let content = strip_comment(&buf).trim().to_string();
        if !content.is_empty() {
            out.push((start, content));
        }
    }
    if let Some((start, buf)) = pending {
        let content = strip_comment(&buf).trim().to_string();
        if !content.is_empty() {
            out.push((start, content));
        }
    }
    out
}

/// A `#` starts a comment at line start or after whitespace, so URL
/// fragments like `#egg=` survive.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn split_option(words: &[&str]) -> Result<(&'static str, Option<String>), String> {
    const KNOWN: &[&str] = &[
        "--requirement",
        "--constraint",
        "--index-url",
        "--extra-index-url",
        "--trusted-host",
        "--find-links",
        "--no-binary",
        "--only-binary",
        "--pre",
        "-r",
        "-c",
        "-i",
        "-f",
    ];

    let Some((first, rest)) = words.split_first() else {
        return Err("empty option line".to_string());
    };
    let trailing = || (!rest.is_empty()).then(|| rest.join(" "));

    if let Some((name, value)) = first.split_once('=') {
        let Some(known) = KNOWN.iter().find(|k| **k == name && k.starts_with("--")) else {
            return Err(format!("unsupported option '{name}'"));
        };
        if !rest.is_empty() {
            return Err(format!("unexpected text after option '{name}'"));
        }
        return Ok((*known, Some(value.to_string())));
    }

    if let Some(known) = KNOWN.iter().find(|k| *k == first) {
        if rest.len() > 1 {
            return Err(format!("unexpected text after option '{first}'"));
        }
        return Ok((*known, trailing()));
    }

    // Short options may carry their value attached: `-rbase.txt`.
    for short in ["-r", "-c", "-i", "-f"] {
        if let Some(value) = first.strip_prefix(short) {
            if !first.starts_with("--") && !value.is_empty() && rest.is_empty() {
                return Ok((short, Some(value.to_string())));
            }
        }
    }

    Err(format!("unsupported option '{first}'"))
}

fn parse_requirement(content: &str, origin: Origin) -> Result<Requirement, String> {
    // Per-requirement options come after the requirement itself.
    let mut hashes = Vec::new();
    let mut body = content;
    if let Some(idx) = content.find(" --") {
        body = &content[..idx];
        for option in content[idx..].split_whitespace() {
            match option.strip_prefix("--hash=") {
                Some(hash) if valid_hash(hash) => hashes.push(hash.to_string()),
                Some(hash) => return Err(format!("invalid hash '{hash}'")),
                None => return Err(format!("unsupported per-requirement option '{option}'")),
            }
        }
    }

    let name_end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(body.len());
    let name = &body[..name_end];
    validate_name(name).map_err(|e| format!("invalid requirement '{body}': {e}"))?;
    let mut rest = body[name_end..].trim_start();

    let mut extras = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let close = after
            .find(']')
            .ok_or_else(|| format!("unterminated extras in '{body}'"))?;
        for extra in after[..close].split(',').map(str::trim).filter(|e| !e.is_empty()) {
            validate_name(extra).map_err(|e| format!("invalid extra '{extra}': {e}"))?;
            extras.push(extra.to_string());
        }
        rest = after[close + 1..].trim_start();
    }

    if let Some(after) = rest.strip_prefix('@') {
        // `name @ url ; marker`; the marker separator needs whitespace
        // before it since ';' may appear inside URLs.
        let (url, marker) = match after.find(" ;") {
            Some(i) => (after[..i].trim(), Some(after[i + 2..].trim())),
            None => (after.trim(), None),
        };
        if url.is_empty() || !(url.contains("://") || url.starts_with("file:")) {
            return Err(format!("invalid URL in '{body}'"));
        }
        return Ok(Requirement {
            name: name.to_string(),
            extras,
            specifiers: Vec::new(),
            url: Some(url.to_string()),
            marker: parse_marker(marker, body)?,
            hashes,
            origin,
        });
    }

    let (spec_text, marker) = match rest.split_once(';') {
        Some((specs, marker)) => (specs.trim(), Some(marker.trim())),
        None => (rest.trim(), None),
    };
    let spec_text = spec_text
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(spec_text);

    let mut specifiers = Vec::new();
    if !spec_text.trim().is_empty() {
        for part in spec_text.split(',') {
            specifiers.push(parse_specifier(part.trim()).map_err(|e| format!("{e} in '{body}'"))?);
        }
    }

    Ok(Requirement {
        name: name.to_string(),
        extras,
        specifiers,
        url: None,
        marker: parse_marker(marker, body)?,
        hashes,
        origin,
    })
}

fn parse_marker(marker: Option<&str>, body: &str) -> Result<Option<String>, String> {
    match marker {
        Some("") => Err(format!("empty environment marker in '{body}'")),
        Some(m) => Ok(Some(m.to_string())),
        None => Ok(None),
    }
}

fn parse_specifier(part: &str) -> Result<Specifier, String> {
    let (op, version) = Operator::ALL
        .iter()
        .find_map(|(text, op)| part.strip_prefix(text).map(|v| (*op, v.trim())))
        .ok_or_else(|| format!("invalid version specifier '{part}'"))?;

    if version.is_empty() {
        return Err(format!("missing version in specifier '{part}'"));
    }
    if op == Operator::Arbitrary {
        if version.contains(char::is_whitespace) {
            return Err(format!("invalid version in specifier '{part}'"));
        }
        return Ok(Specifier {
            op,
            version: version.to_string(),
        });
    }

    let (base, wildcard) = match version.strip_suffix(".*") {
        Some(base) => (base, true),
        None => (version, false),
    };
    if wildcard && !matches!(op, Operator::Equal | Operator::NotEqual) {
        return Err(format!("wildcard only allowed with == or != in '{part}'"));
    }
    let valid = !base.is_empty()
        && base.starts_with(|c: char| c.is_ascii_digit() || c == 'v' || c == 'V')
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '!' | '-' | '_'));
    if !valid {
        return Err(format!("invalid version '{version}'"));
    }
    Ok(Specifier {
        op,
        version: version.to_string(),
    })
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("missing package name".to_string());
    }
    let first = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let last = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first || !last {
        return Err(format!("'{name}' must start and end with a letter or digit"));
    }
    Ok(())
}

fn valid_hash(hash: &str) -> bool {
    match hash.split_once(':') {
        Some(("sha256", hex)) => hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        Some(("sha384", hex)) => hex.len() == 96 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        Some(("sha512", hex)) => hex.len() == 128 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        _ => false,
    }
}

/// Same package twice under the same marker must agree.
fn check_conflicts(requirements: &[Requirement]) -> Result<(), ManifestError> {
    let mut seen: BTreeMap<(String, Option<String>), &Requirement> = BTreeMap::new();
    for req in requirements {
        let key = (req.normalized_name(), req.marker.clone());
        match seen.get(&key) {
            Some(first) if first.constraint_text() != req.constraint_text() => {
                return Err(ManifestError::Conflict {
                    name: key.0,
                    first: first.to_string(),
                    first_at: first.origin.to_string(),
                    second: req.to_string(),
                    second_at: req.origin.to_string(),
                });
            }
            Some(_) => {}
            None => {
                seen.insert(key, req);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, text).unwrap();
        path
    }

    fn parse(text: &str) -> Result<Manifest, ManifestError> {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "requirements.txt", text);
        parse_manifest(&path, tmp.path())
    }

    #[test]
    fn parses_service_requirements() {
        let manifest = parse(
            "# web stack\n\
             fastapi==0.110.0\n\
             uvicorn[standard] >=0.29, <0.30\n\
             pydantic~=2.6  # pinned minor\n\
             httpx ; python_version < \"3.12\"\n\
             \n\
             Jinja2\n",
        )
        .unwrap();

        let names: Vec<String> = manifest.requirements.iter().map(|r| r.normalized_name()).collect();
        assert_eq!(names, ["fastapi", "uvicorn", "pydantic", "httpx", "jinja2"]);

        let uvicorn = &manifest.requirements[1];
        assert_eq!(uvicorn.extras, ["standard"]);
        assert_eq!(uvicorn.to_string(), "uvicorn[standard]>=0.29,<0.30");
        assert_eq!(manifest.requirements[3].marker.as_deref(), Some("python_version < \"3.12\""));
        assert_eq!(manifest.requirements[2].origin.line, 4);
    }

    #[test]
    fn options_and_continuations() {
        let manifest = parse(
            "--index-url https://pypi.example/simple\n\
             --extra-index-url=https://mirror.example/simple\n\
             --pre\n\
             -f ./wheels\n\
             requests==2.31.0 \\\n    --hash=sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n\
             pkg @ https://example.com/pkg-1.0.tar.gz#egg=pkg\n",
        )
        .unwrap();

        assert_eq!(manifest.options.index_url.as_deref(), Some("https://pypi.example/simple"));
        assert_eq!(manifest.options.extra_index_urls, ["https://mirror.example/simple"]);
        assert!(manifest.options.pre);
        assert_eq!(manifest.options.find_links, ["./wheels"]);
        assert_eq!(manifest.requirements[0].hashes.len(), 1);
        assert_eq!(
            manifest.requirements[1].url.as_deref(),
            Some("https://example.com/pkg-1.0.tar.gz#egg=pkg")
        );
    }

    #[test]
    fn includes_and_constraints() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "base.txt", "fastapi==0.110.0\n");
        write(tmp.path(), "constraints.txt", "starlette<0.37\n");
        let main = write(
            tmp.path(),
            "requirements.txt",
            "-r base.txt\n-c constraints.txt\nuvicorn\n",
        );

        let manifest = parse_manifest(&main, tmp.path()).unwrap();
        assert_eq!(manifest.requirements.len(), 2);
        assert_eq!(manifest.constraints.len(), 1);
        assert_eq!(manifest.files.len(), 3);
    }

    #[test]
    fn include_cycle_is_rejected() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "-r b.txt\n");
        write(tmp.path(), "b.txt", "-r a.txt\n");
        let err = parse_manifest(&tmp.path().join("a.txt"), tmp.path()).unwrap_err();
        assert!(matches!(err, ManifestError::IncludeCycle { .. }));
    }

    #[test]
    fn include_cannot_escape_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("app");
        let main = write(&root, "requirements.txt", "-r ../secrets.txt\n");
        write(tmp.path(), "secrets.txt", "x\n");
        assert!(parse_manifest(&main, &root).is_err());
    }

    #[test]
    fn conflicting_pins_are_rejected() {
        let err = parse("fastapi==0.110.0\nFastAPI==0.109.0\n").unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, ManifestError::Conflict { .. }));
        assert!(msg.contains("fastapi"), "{msg}");

        // Identical duplicates and marker-split entries are fine.
        parse("fastapi==0.110.0\nfastapi == 0.110.0\n").unwrap();
        parse("numpy<2 ; python_version < \"3.9\"\nnumpy>=2 ; python_version >= \"3.9\"\n").unwrap();
    }

    #[test]
    fn malformed_lines_report_location() {
        for bad in [
            "fastapi=1.0\n",
            "fastapi==\n",
            "-e .\n",
            "--no-such-option\n",
            "uvicorn[standard\n",
            "pkg>=1.*\n",
            "./local/path\n",
        ] {
            let err = parse(bad).unwrap_err();
            assert!(
                matches!(err, ManifestError::Syntax { line: 1, .. }),
                "{bad:?} gave {err}"
            );
        }
    }

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_name("Foo_Bar.baz"), "foo-bar-baz");
        assert_eq!(normalize_name("a--_b"), "a-b");
    }
}
