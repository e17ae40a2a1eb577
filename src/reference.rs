//! Image references: `name[:tag][@sha256:<hex>]`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};

pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
    /// Pinned content digest (`sha256:<64 hex>`), if any.
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference used to tag build output. Digests are rejected.
    pub fn parse_tag(raw: &str) -> Result<Self> {
        let reference: ImageReference = raw.parse()?;
        if reference.digest.is_some() {
            bail!("image tag '{raw}' must not carry a digest");
        }
        Ok(reference)
    }

    /// `name:tag` without the digest.
    pub fn name_and_tag(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// Relative directory for this reference inside a base-image source:
    /// `<name components>/<tag>`.
    pub fn relative_dir(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for part in self.name.split('/') {
            path.push(part);
        }
        path.push(&self.tag);
        path
    }

    /// The 64-hex part of the pinned digest.
    pub fn digest_hex(&self) -> Option<&str> {
        self.digest
            .as_deref()
            .and_then(|d| d.strip_prefix("sha256:"))
    }
}

impl FromStr for ImageReference {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("image reference must not be empty");
        }

        let (rest, digest) = match raw.split_once('@') {
            Some((rest, digest)) => {
                validate_digest(digest)?;
                (rest, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a
        // registry host:port.
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], &rest[split + 1..])
            }
            None => (rest, DEFAULT_TAG),
        };

        validate_name(name).map_err(|e| anyhow::anyhow!("invalid image reference '{raw}': {e}"))?;
        validate_tag(tag).map_err(|e| anyhow::anyhow!("invalid image reference '{raw}': {e}"))?;

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn validate_digest(digest: &str) -> Result<()> {
    let Some(hex) = digest.strip_prefix("sha256:") else {
        bail!("unsupported digest algorithm in '{digest}' (expected sha256)");
    };
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
        bail!("digest '{digest}' must be 64 lowercase hex characters");
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("empty repository name");
    }
    for (i, component) in name.split('/').enumerate() {
        if component.is_empty() {
            bail!("empty path component");
        }
        if component == "." || component == ".." {
            bail!("path component '{component}' is not allowed");
        }
        // The first component may be a registry host with a port.
        let host_like = i == 0 && name.contains('/');
        let ok = component.chars().all(|c| {
            c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || matches!(c, '.' | '_' | '-')
                || (host_like && c == ':')
        });
        if !ok {
            bail!("component '{component}' must be lowercase alphanumerics or '._-'");
        }
        if !component.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            bail!("component '{component}' must start with an alphanumeric character");
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > 128 {
        bail!("tag must be 1 to 128 characters");
    }
    if tag.starts_with(['.', '-']) {
        bail!("tag '{tag}' must not start with '.' or '-'");
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        bail!("tag '{tag}' contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_tag() {
        let r: ImageReference = "python:3.11-slim".parse().unwrap();
        assert_eq!(r.name, "python");
        assert_eq!(r.tag, "3.11-slim");
        assert!(r.digest.is_none());
        assert_eq!(r.to_string(), "python:3.11-slim");
    }

    #[test]
    fn tag_defaults_to_latest() {
        let r: ImageReference = "library/python".parse().unwrap();
        assert_eq!(r.tag, "latest");
        assert_eq!(r.relative_dir(), PathBuf::from("library/python/latest"));
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let r: ImageReference = "registry.local:5000/team/app".parse().unwrap();
        assert_eq!(r.name, "registry.local:5000/team/app");
        assert_eq!(r.tag, "latest");

        let r: ImageReference = "registry.local:5000/team/app:v2".parse().unwrap();
        assert_eq!(r.tag, "v2");
    }

    #[test]
    fn parses_pinned_digest() {
        let hex = "a".repeat(64);
        let r: ImageReference = format!("python:3.11-slim@sha256:{hex}").parse().unwrap();
        assert_eq!(r.digest_hex(), Some(hex.as_str()));
        assert!(ImageReference::parse_tag(&format!("app@sha256:{hex}")).is_err());
    }

    #[test]
    fn rejects_bad_references() {
        assert!("".parse::<ImageReference>().is_err());
        assert!("Python:3.11".parse::<ImageReference>().is_err());
        assert!("python:".parse::<ImageReference>().is_err());
        assert!("python@md5:abc".parse::<ImageReference>().is_err());
        assert!("../etc:1".parse::<ImageReference>().is_err());
        assert!("python@sha256:1234".parse::<ImageReference>().is_err());
    }
}
