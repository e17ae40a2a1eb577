//! Package backends: how `INSTALL os` and `INSTALL pip` turn into shell.
//!
//! A backend is a set of command templates. `{package}`, `{packages}` and
//! `{manifest}` are substituted with shell-quoted values. The rendered
//! commands are part of the step's cache key, so changing a template
//! invalidates every layer built with it.

use std::borrow::Cow;

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::config::RunnerKind;
use crate::runner::IMAGE_ROOT_ENV;

/// OS package backend. Defaults target apt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OsBackend {
    /// Refresh package indexes. Runs once before resolution.
    pub prepare: Option<String>,
    /// Check that one package exists. Runs per package; `{package}`.
    pub resolve: Option<String>,
    /// Install every package; `{packages}`.
    pub install: String,
    /// Remove index metadata in the same layer.
    pub cleanup: Option<String>,
}

impl Default for OsBackend {
    fn default() -> Self {
        Self {
            prepare: Some("apt-get update".to_string()),
            resolve: Some("apt-cache show --no-all-versions {package} >/dev/null 2>&1".to_string()),
            install: "DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {packages}"
                .to_string(),
            cleanup: Some("apt-get clean && rm -rf /var/lib/apt/lists/*".to_string()),
        }
    }
}

/// Application package backend. Defaults target pip.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipBackend {
    /// Install from the manifest; `{manifest}` is its image path.
    pub install: String,
}

impl Default for PipBackend {
    fn default() -> Self {
        Self {
            install: "pip install --no-cache-dir -r {manifest}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PackageBackends {
    pub os: OsBackend,
    pub pip: PipBackend,
}

impl PackageBackends {
    /// Defaults suited to `runner`. Chroot steps see the image as `/`; host
    /// steps reach it through `$IMAGE_ROOT`.
    pub fn for_runner(runner: RunnerKind) -> Self {
        match runner {
            RunnerKind::Chroot => Self::default(),
            RunnerKind::Host => Self::host_defaults(),
        }
    }

    /// apt and pip pointed at `$IMAGE_ROOT` instead of the host's `/`.
    pub fn host_defaults() -> Self {
        const APT: &str = r#"-o Dir="$IMAGE_ROOT" -o DPkg::Options::=--root="$IMAGE_ROOT""#;
        Self {
            os: OsBackend {
                prepare: Some(format!("apt-get {APT} update")),
                resolve: Some(format!(
                    "apt-cache {APT} show --no-all-versions {{package}} >/dev/null 2>&1"
                )),
                install: format!(
                    "DEBIAN_FRONTEND=noninteractive apt-get {APT} install -y --no-install-recommends {{packages}}"
                ),
                cleanup: Some(format!(
                    r#"apt-get {APT} clean && rm -rf "$IMAGE_ROOT"/var/lib/apt/lists/*"#
                )),
            },
            pip: PipBackend {
                install: r#"pip install --no-cache-dir --root "$IMAGE_ROOT" -r "$IMAGE_ROOT"{manifest}"#
                    .to_string(),
            },
        }
    }

    /// [`validate`](Self::validate), and with the host runner also require
    /// every template that writes to address the rootfs through
    /// `$IMAGE_ROOT`. `resolve` only queries and is exempt.
    pub fn validate_for(&self, runner: RunnerKind) -> Result<()> {
        self.validate()?;
        if runner != RunnerKind::Host {
            return Ok(());
        }
        let writers = [
            ("packages.os.prepare", self.os.prepare.as_deref()),
            ("packages.os.install", Some(self.os.install.as_str())),
            ("packages.os.cleanup", self.os.cleanup.as_deref()),
            ("packages.pip.install", Some(self.pip.install.as_str())),
        ];
        for (field, template) in writers {
            if let Some(template) = template {
                if !template.contains(IMAGE_ROOT_ENV) {
                    bail!(
                        "{field} must address the image through ${IMAGE_ROOT_ENV} with the host runner: {template}"
                    );
                }
            }
        }
        Ok(())
    }

    /// Reject templates with unknown or missing placeholders.
    pub fn validate(&self) -> Result<()> {
        if let Some(prepare) = &self.os.prepare {
            check_template("packages.os.prepare", prepare, &[], &[])?;
        }
        if let Some(resolve) = &self.os.resolve {
            check_template("packages.os.resolve", resolve, &["package"], &["package"])?;
        }
        check_template("packages.os.install", &self.os.install, &["packages"], &["packages"])?;
        if let Some(cleanup) = &self.os.cleanup {
            check_template("packages.os.cleanup", cleanup, &[], &[])?;
        }
        check_template("packages.pip.install", &self.pip.install, &["manifest"], &["manifest"])?;
        Ok(())
    }
}

/// Commands for one `INSTALL os` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInstallPlan {
    pub packages: Vec<String>,
    pub prepare: Option<String>,
    /// `(package, command)` pairs.
    pub resolve: Vec<(String, String)>,
    pub install: String,
    pub cleanup: Option<String>,
}

impl OsInstallPlan {
    pub fn new(backend: &OsBackend, packages: &[String]) -> Result<Self> {
        let packages = validate_os_packages(packages)?;
        let joined = packages
            .iter()
            .map(|p| quote(p).into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        let resolve = match &backend.resolve {
            Some(template) => packages
                .iter()
                .map(|p| {
                    let quoted = quote(p);
                    (p.clone(), render(template, &[("package", quoted.as_ref())]))
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(Self {
            prepare: backend.prepare.clone(),
            resolve,
            install: render(&backend.install, &[("packages", joined.as_str())]),
            cleanup: backend.cleanup.clone(),
            packages,
        })
    }

    /// Stable text of every command, fed into the cache key.
    pub fn fingerprint(&self) -> String {
        let mut lines = Vec::new();
        if let Some(prepare) = &self.prepare {
            lines.push(format!("prepare: {prepare}"));
        }
        for (_, cmd) in &self.resolve {
            lines.push(format!("resolve: {cmd}"));
        }
        lines.push(format!("install: {}", self.install));
        if let Some(cleanup) = &self.cleanup {
            lines.push(format!("cleanup: {cleanup}"));
        }
        lines.join("\n")
    }
}

/// Commands for one `INSTALL pip` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipInstallPlan {
    /// Absolute image path of the manifest.
    pub manifest: String,
    pub install: String,
}

impl PipInstallPlan {
    pub fn new(backend: &PipBackend, manifest: &str) -> Self {
        let quoted = quote(manifest);
        Self {
            manifest: manifest.to_string(),
            install: render(&backend.install, &[("manifest", quoted.as_ref())]),
        }
    }

    pub fn fingerprint(&self) -> String {
        format!("install: {}", self.install)
    }
}

/// Validate Debian-style package names and drop duplicates, keeping the
/// first occurrence.
pub fn validate_os_packages(packages: &[String]) -> Result<Vec<String>> {
    if packages.is_empty() {
        bail!("INSTALL os needs at least one package");
    }
    let mut out: Vec<String> = Vec::with_capacity(packages.len());
    for name in packages {
        if !is_valid_os_package(name) {
            bail!("invalid OS package name '{name}' (expected [a-z0-9][a-z0-9+.-]+)");
        }
        if !out.contains(name) {
            out.push(name.clone());
        }
    }
    Ok(out)
}

fn is_valid_os_package(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    first_ok
        && name.len() >= 2
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '-'))
}

fn quote(value: &str) -> Cow<'_, str> {
    shell_escape::escape(Cow::Borrowed(value))
}

/// Substitute `{name}` placeholders. `${VAR}` shell syntax is left alone.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let (before, after) = rest.split_at(open);
        out.push_str(before);
        let is_shell_var = before.ends_with('$');
        let name_end = after[1..].find('}').map(|i| i + 1);
        match name_end {
            Some(end) if !is_shell_var => {
                let name = &after[1..end];
                match vars.iter().find(|(k, _)| *k == name) {
                    Some((_, value)) => out.push_str(value),
                    None => out.push_str(&after[..=end]),
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn placeholders(template: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(open) = template[offset..].find('{').map(|i| offset + i) {
        let after = &template[open + 1..];
        let Some(close) = after.find('}') else { break };
        let name = &after[..close];
        let shell_var = template[..open].ends_with('$');
        if !shell_var && !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
            found.push(name);
        }
        offset = open + 1 + close + 1;
    }
    found
}

fn check_template(field: &str, template: &str, allowed: &[&str], required: &[&str]) -> Result<()> {
    if template.trim().is_empty() {
        bail!("{field} must not be empty");
    }
    let used = placeholders(template);
    if let Some(unknown) = used.iter().find(|p| !allowed.contains(*p)) {
        bail!("{field}: unknown placeholder '{{{unknown}}}'");
    }
    for needed in required {
        if !used.contains(needed) {
            bail!("{field}: missing placeholder '{{{needed}}}'");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn validates_and_dedupes_os_packages() {
        let out = validate_os_packages(&names(&["curl", "ca-certificates", "curl", "libc6.1"])).unwrap();
        assert_eq!(out, ["curl", "ca-certificates", "libc6.1"]);

        assert!(validate_os_packages(&[]).is_err());
        assert!(validate_os_packages(&names(&["Curl"])).is_err());
        assert!(validate_os_packages(&names(&["c"])).is_err());
        assert!(validate_os_packages(&names(&["-rf"])).is_err());
        assert!(validate_os_packages(&names(&["curl;reboot"])).is_err());
    }

    #[test]
    fn renders_default_apt_plan() {
        let plan = OsInstallPlan::new(&OsBackend::default(), &names(&["curl", "netcat-traditional"])).unwrap();
        assert_eq!(plan.resolve.len(), 2);
        assert_eq!(plan.resolve[0].1, "apt-cache show --no-all-versions curl >/dev/null 2>&1");
        assert!(plan.install.ends_with("--no-install-recommends curl netcat-traditional"));
        assert!(plan.fingerprint().contains("cleanup: apt-get clean"));
    }

    #[test]
    fn quotes_manifest_paths() {
        let plan = PipInstallPlan::new(&PipBackend::default(), "/app/my reqs.txt");
        assert_eq!(plan.install, "pip install --no-cache-dir -r '/app/my reqs.txt'");
    }

    #[test]
    fn render_leaves_shell_syntax_alone() {
        let out = render("echo ${HOME} {package} {a,b} {other}", &[("package", "curl")]);
        assert_eq!(out, "echo ${HOME} curl {a,b} {other}");
    }

    #[test]
    fn template_validation() {
        PackageBackends::default().validate().unwrap();

        let mut backends = PackageBackends::default();
        backends.os.install = "apk add {pkgs}".to_string();
        assert!(backends.validate().is_err());

        let mut backends = PackageBackends::default();
        backends.pip.install = "uv pip install -r requirements.txt".to_string();
        assert!(backends.validate().is_err());

        let mut backends = PackageBackends::default();
        backends.os.cleanup = Some("rm -rf ${CACHE_DIR}/*".to_string());
        backends.validate().unwrap();
    }

    #[test]
    fn host_runner_templates_target_image_root() {
        PackageBackends::default().validate_for(RunnerKind::Chroot).unwrap();
        let err = PackageBackends::default()
            .validate_for(RunnerKind::Host)
            .unwrap_err()
            .to_string();
        assert!(err.contains("packages.os.prepare"), "{err}");

        let host = PackageBackends::for_runner(RunnerKind::Host);
        host.validate_for(RunnerKind::Host).unwrap();

        let pip = PipInstallPlan::new(&host.pip, "/app/requirements.txt");
        assert_eq!(
            pip.install,
            r#"pip install --no-cache-dir --root "$IMAGE_ROOT" -r "$IMAGE_ROOT"/app/requirements.txt"#
        );
        let os = OsInstallPlan::new(&host.os, &names(&["curl"])).unwrap();
        assert!(os.install.contains(r#"--root="$IMAGE_ROOT""#), "{}", os.install);
        assert!(os.cleanup.unwrap().contains(r#"rm -rf "$IMAGE_ROOT"/var/lib/apt/lists/*"#));
    }
}
