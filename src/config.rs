use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::packages::PackageBackends;

/// Config file name looked up in the build context.
pub const CONFIG_FILE: &str = "image-builder.toml";

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "IMAGE_BUILDER_CONFIG";

pub const DEFAULT_KEEP_BUILDS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunnerKind {
    /// Run steps on the host with the rootfs as working directory. Package
    /// backends must address the rootfs through `$IMAGE_ROOT`.
    Host,
    /// Run steps inside `chroot <rootfs>`. Needs root.
    #[default]
    Chroot,
}

/// Resolved builder configuration.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub store_dir: PathBuf,
    pub bases_dir: PathBuf,
    pub runner: RunnerKind,
    pub keep_builds: usize,
    pub packages: PackageBackends,
    /// File the config was read from, if any.
    pub source: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuilderToml {
    store_dir: Option<String>,
    bases_dir: Option<String>,
    runner: Option<String>,
    keep_builds: Option<usize>,
    packages: Option<PackageBackends>,
}

impl BuilderConfig {
    /// Defaults with no config file.
    pub fn defaults() -> Result<Self> {
        Self::from_toml(BuilderToml::default(), None)
    }

    /// Resolve the config for a build: an explicit path wins, then
    /// `<context>/image-builder.toml`, then `$IMAGE_BUILDER_CONFIG`.
    pub fn discover(explicit: Option<&Path>, context_dir: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(dir) = context_dir {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.is_file() {
                return Self::load(&candidate);
            }
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        Self::defaults()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading builder config '{}'", path.display()))?;
        let parsed: BuilderToml = toml::from_str(&text)
            .with_context(|| format!("parsing builder config '{}'", path.display()))?;
        Self::from_toml(parsed, Some(path))
    }

    fn from_toml(parsed: BuilderToml, source: Option<&Path>) -> Result<Self> {
        let origin = source
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<defaults>".to_string());
        let base_dir = source.and_then(Path::parent).unwrap_or(Path::new("."));

        let store_dir = match parsed.store_dir {
            Some(raw) => resolve_path(base_dir, &raw),
            None => default_store_dir()?,
        };
        let bases_dir = match parsed.bases_dir {
            Some(raw) => resolve_path(base_dir, &raw),
            None => store_dir.join("bases"),
        };

        let runner = match parsed.runner.as_deref().map(|r| r.trim().to_ascii_lowercase()) {
            None => RunnerKind::default(),
            Some(r) if r == "host" => RunnerKind::Host,
            Some(r) if r == "chroot" => RunnerKind::Chroot,
            Some(other) => bail!(
                "invalid builder config '{}': unsupported runner '{}' (expected 'host' or 'chroot')",
                origin,
                other
            ),
        };

        let keep_builds = parsed.keep_builds.unwrap_or(DEFAULT_KEEP_BUILDS);
        if keep_builds == 0 {
            bail!("invalid builder config '{}': keep_builds must be >= 1", origin);
        }

        let packages = parsed
            .packages
            .unwrap_or_else(|| PackageBackends::for_runner(runner));
        packages
            .validate_for(runner)
            .with_context(|| format!("invalid builder config '{}'", origin))?;

        Ok(Self {
            store_dir,
            bases_dir,
            runner,
            keep_builds,
            packages,
            source: source.map(Path::to_path_buf),
        })
    }
}

/// `dirs::cache_dir()/image-builder`.
pub fn default_store_dir() -> Result<PathBuf> {
    let cache = dirs::cache_dir().context("no cache directory for this user; set store_dir")?;
    Ok(cache.join("image-builder"))
}

/// `~/` expands to the home directory; relative paths are relative to the
/// config file.
fn resolve_path(base_dir: &Path, raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn relative_paths_follow_config_file() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            "store_dir = \"store\"\nrunner = \"chroot\"\nkeep_builds = 3\n",
        );
        let config = BuilderConfig::load(&path).unwrap();
        assert_eq!(config.store_dir, tmp.path().join("store"));
        assert_eq!(config.bases_dir, tmp.path().join("store/bases"));
        assert_eq!(config.runner, RunnerKind::Chroot);
        assert_eq!(config.keep_builds, 3);
    }

    #[test]
    fn package_backends_override_partially() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            "store_dir = \"/var/cache/ib\"\n\
             [packages.os]\n\
             prepare = \"apk update\"\n\
             resolve = \"apk info -e {package}\"\n\
             install = \"apk add --no-cache {packages}\"\n",
        );
        let config = BuilderConfig::load(&path).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/var/cache/ib"));
        assert_eq!(config.packages.os.install, "apk add --no-cache {packages}");
        assert!(config.packages.os.cleanup.is_none());
        assert_eq!(config.packages.pip, crate::packages::PipBackend::default());
    }

    #[test]
    fn rejects_unknown_fields_and_values() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(tmp.path(), "store_dir = \"s\"\nstore = \"typo\"\n");
        assert!(BuilderConfig::load(&path).is_err());

        let path = write_config(tmp.path(), "store_dir = \"s\"\nrunner = \"docker\"\n");
        let err = BuilderConfig::load(&path).unwrap_err().to_string();
        assert!(err.contains("unsupported runner"), "{err}");

        let path = write_config(tmp.path(), "store_dir = \"s\"\nkeep_builds = 0\n");
        assert!(BuilderConfig::load(&path).is_err());

        let path = write_config(
            tmp.path(),
            "store_dir = \"s\"\n[packages.pip]\ninstall = \"pip install {requirements}\"\n",
        );
        assert!(BuilderConfig::load(&path).is_err());
    }

    #[test]
    fn defaults_never_run_package_backends_on_the_host() {
        let config = BuilderConfig::defaults().unwrap();
        assert_eq!(config.runner, RunnerKind::Chroot);
        assert_eq!(config.packages, PackageBackends::default());

        let tmp = TempDir::new().unwrap();
        let path = write_config(tmp.path(), "store_dir = \"s\"\nrunner = \"host\"\n");
        let config = BuilderConfig::load(&path).unwrap();
        assert_eq!(config.runner, RunnerKind::Host);
        assert_ne!(config.packages, PackageBackends::default());
        assert!(config.packages.os.install.contains("$IMAGE_ROOT"));
        assert!(config.packages.pip.install.contains("$IMAGE_ROOT"));

        let path = write_config(
            tmp.path(),
            "store_dir = \"s\"\nrunner = \"host\"\n\
             [packages.os]\n\
             install = \"apt-get install -y {packages}\"\n",
        );
        let err = format!("{:#}", BuilderConfig::load(&path).unwrap_err());
        assert!(err.contains("host runner"), "{err}");
    }

    #[test]
    fn context_config_is_discovered() {
        let tmp = TempDir::new().unwrap();
        write_config(tmp.path(), "store_dir = \"from-context\"\n");
        let config = BuilderConfig::discover(None, Some(tmp.path())).unwrap();
        assert_eq!(config.store_dir, tmp.path().join("from-context"));
        assert_eq!(config.source.as_deref(), Some(tmp.path().join(CONFIG_FILE).as_path()));
    }
}
