//! Preflight checks for builds.
//!
//! Validates that the host can run the configured step runner before any
//! layer work starts, so a missing tool shows up as one clear message rather
//! than as a failure halfway through a build.
//!
//! # Example
//!
//! ```rust
//! use image_builder::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("chroot") {
//!     println!("coreutils not installed");
//! }
//!
//! let tools = &[("sh", "dash"), ("chroot", "coreutils")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::fs;

use crate::config::{BuilderConfig, RunnerKind};
use crate::runner::runner_for;

/// Check if a command exists on the host system's PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Whether the process runs with effective uid 0.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Everything a build with `config` needs from the host.
pub fn check_build_host(config: &BuilderConfig) -> Result<()> {
    let runner = runner_for(config.runner);
    let mut problems = Vec::new();

    if let Err(e) = check_required_tools(runner.required_tools()) {
        problems.push(e.to_string());
    }
    if let Err(e) = config.packages.validate_for(config.runner) {
        problems.push(e.to_string());
    }
    if config.runner == RunnerKind::Chroot && !running_as_root() {
        problems.push("the chroot runner needs root privileges (effective uid 0)".to_string());
    }
    if let Err(e) = fs::create_dir_all(&config.store_dir) {
        problems.push(format!(
            "store directory '{}' is not writable: {}",
            config.store_dir.display(),
            e
        ));
    }
    if !config.bases_dir.is_dir() {
        problems.push(format!(
            "base image directory '{}' does not exist",
            config.bases_dir.display()
        ));
    }

    if !problems.is_empty() {
        bail!(
            "Preflight failed for the {} runner:\n{}",
            runner.name(),
            problems.join("\n")
        );
    }
    tracing::debug!(runner = runner.name(), "preflight passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageBackends;
    use tempfile::TempDir;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err().to_string();
        assert!(err.contains("nonexistent_command_xyz (install: fake-package)"));
    }

    #[test]
    fn host_runner_preflight() {
        let tmp = TempDir::new().unwrap();
        let mut config = BuilderConfig {
            store_dir: tmp.path().join("store"),
            bases_dir: tmp.path().join("bases"),
            runner: RunnerKind::Host,
            keep_builds: 10,
            packages: PackageBackends::for_runner(RunnerKind::Host),
            source: None,
        };
        let err = check_build_host(&config).unwrap_err().to_string();
        assert!(err.contains("does not exist"), "{err}");

        fs::create_dir_all(&config.bases_dir).unwrap();
        check_build_host(&config).unwrap();

        config.packages = PackageBackends::default();
        let err = check_build_host(&config).unwrap_err().to_string();
        assert!(err.contains("with the host runner"), "{err}");
        config.packages = PackageBackends::for_runner(RunnerKind::Chroot);

        config.runner = RunnerKind::Chroot;
        if !running_as_root() {
            assert!(check_build_host(&config).is_err());
        }
    }
}
