//! Step runners execute shell work against the working rootfs.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::config::RunnerKind;

/// PATH used when neither the recipe nor the base config sets one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Environment variable pointing host-run steps at the rootfs.
pub const IMAGE_ROOT_ENV: &str = "IMAGE_ROOT";

/// One command to run.
#[derive(Debug, Clone)]
pub struct StepCommand<'a> {
    pub argv: &'a [String],
    pub env: &'a [(String, String)],
    /// Absolute image path.
    pub workdir: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// Exit code; `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Trimmed stderr, or stdout when stderr is empty.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

pub trait StepRunner {
    fn name(&self) -> &'static str;

    /// Run a command. A non-zero exit is returned in [`StepOutput`], not as
    /// an error; errors mean the command could not be started at all.
    fn run(&self, rootfs: &Path, command: &StepCommand<'_>) -> Result<StepOutput>;

    /// Host tools this runner needs, as `(command, package)`.
    fn required_tools(&self) -> &'static [(&'static str, &'static str)];
}

pub fn runner_for(kind: RunnerKind) -> Box<dyn StepRunner> {
    match kind {
        RunnerKind::Host => Box::new(HostRunner),
        RunnerKind::Chroot => Box::new(ChrootRunner),
    }
}

/// Runs on the host with the working directory inside the rootfs and
/// `IMAGE_ROOT` set to the rootfs path. No isolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl StepRunner for HostRunner {
    fn name(&self) -> &'static str {
        "host"
    }

    fn run(&self, rootfs: &Path, command: &StepCommand<'_>) -> Result<StepOutput> {
        let Some((program, args)) = command.argv.split_first() else {
            bail!("empty command");
        };
        let cwd = host_workdir(rootfs, command.workdir);
        std::fs::create_dir_all(&cwd)
            .with_context(|| format!("creating working directory '{}'", cwd.display()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&cwd)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()))
            .env("HOME", rootfs.join("root"));
        for (key, value) in command.env {
            if key != "PATH" {
                cmd.env(key, value);
            }
        }
        cmd.env(IMAGE_ROOT_ENV, rootfs);
        execute(cmd, program)
    }

    fn required_tools(&self) -> &'static [(&'static str, &'static str)] {
        &[("sh", "dash or bash")]
    }
}

/// Runs inside `chroot <rootfs>`. Needs root privileges.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChrootRunner;

impl StepRunner for ChrootRunner {
    fn name(&self) -> &'static str {
        "chroot"
    }

    fn run(&self, rootfs: &Path, command: &StepCommand<'_>) -> Result<StepOutput> {
        if command.argv.is_empty() {
            bail!("empty command");
        }
        std::fs::create_dir_all(host_workdir(rootfs, command.workdir))
            .with_context(|| format!("creating working directory '{}'", command.workdir))?;

        // chroot always starts in '/', so change directory from inside.
        let mut cmd = Command::new("chroot");
        cmd.arg(rootfs)
            .arg("/bin/sh")
            .arg("-c")
            .arg("cd \"$0\" && exec \"$@\"")
            .arg(command.workdir)
            .args(command.argv)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", "/root");
        for (key, value) in command.env {
            cmd.env(key, value);
        }
        execute(cmd, "chroot")
    }

    fn required_tools(&self) -> &'static [(&'static str, &'static str)] {
        &[("chroot", "coreutils")]
    }
}

fn host_workdir(rootfs: &Path, workdir: &str) -> PathBuf {
    rootfs.join(workdir.trim_start_matches('/'))
}

fn execute(mut cmd: Command, program: &str) -> Result<StepOutput> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("starting '{program}'"))?;
    let out = StepOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    tracing::debug!(
        program,
        status = ?out.status,
        stdout_bytes = output.stdout.len(),
        stderr_bytes = output.stderr.len(),
        "step command finished"
    );
    Ok(out)
}
