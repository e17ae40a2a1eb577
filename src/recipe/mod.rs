//! Build recipes: an ordered list of directives.
//!
//! A recipe is written in a Containerfile-style text format (see
//! [`Recipe::parse`]). Directives describe what each step contributes to the
//! image; [`crate::builder`] executes them and produces one layer per
//! filesystem directive.
//!
//! # Example
//!
//! ```rust
//! use image_builder::recipe::{Directive, Recipe};
//!
//! let recipe = Recipe::parse("FROM python:3.11-slim\nWORKDIR /app\nEXPOSE 8000\n").unwrap();
//! assert_eq!(recipe.instructions.len(), 3);
//! assert!(matches!(recipe.instructions[1].directive, Directive::Workdir(_)));
//! ```

mod parse;
pub mod template;

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};

use crate::reference::ImageReference;

pub use parse::{expand_vars, RecipeError};

/// Default recipe file names looked up in a build context, in order.
pub const DEFAULT_RECIPE_FILES: &[&str] = &["Containerfile", "Dockerfile"];

/// A parsed recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub instructions: Vec<Instruction>,
}

/// One directive plus the line it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub line: usize,
    pub directive: Directive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    // ─────────────────────────────────────────────────────────────────────
    // Filesystem-producing directives
    // ─────────────────────────────────────────────────────────────────────
    /// Select the base image. Always the first directive.
    From(ImageReference),

    /// Set (and create) the working directory.
    Workdir(String),

    /// Copy paths from the build context into the image.
    Copy { sources: Vec<String>, dest: String },

    /// Run a command in the working rootfs.
    Run(CommandForm),

    /// Install one of the two package lists.
    Install(PackageList),

    // ─────────────────────────────────────────────────────────────────────
    // Metadata-only directives (empty layers)
    // ─────────────────────────────────────────────────────────────────────
    /// Set environment variables, in order.
    Env(Vec<(String, String)>),

    /// Attach labels to the image config.
    Label(Vec<(String, String)>),

    /// Document listening ports.
    Expose(Vec<Port>),

    /// Default process of the image.
    Cmd(CommandForm),
}

impl Directive {
    /// Upper-case keyword, for logging.
    pub fn keyword(&self) -> &'static str {
        match self {
            Directive::From(_) => "FROM",
            Directive::Workdir(_) => "WORKDIR",
            Directive::Copy { .. } => "COPY",
            Directive::Run(_) => "RUN",
            Directive::Install(_) => "INSTALL",
            Directive::Env(_) => "ENV",
            Directive::Label(_) => "LABEL",
            Directive::Expose(_) => "EXPOSE",
            Directive::Cmd(_) => "CMD",
        }
    }

    /// True when the directive only changes image metadata.
    pub fn is_metadata_only(&self) -> bool {
        matches!(
            self,
            Directive::Env(_) | Directive::Label(_) | Directive::Expose(_) | Directive::Cmd(_)
        )
    }
}

/// Shell form (`RUN echo hi`) or exec form (`RUN ["echo", "hi"]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandForm {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandForm {
    /// argv to execute. Shell form goes through `/bin/sh -c`.
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandForm::Shell(cmd) => vec!["/bin/sh".into(), "-c".into(), cmd.clone()],
            CommandForm::Exec(argv) => argv.clone(),
        }
    }
}

/// The two package lists a recipe can install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageList {
    /// System packages through the OS package backend.
    Os(Vec<String>),
    /// Application dependencies from a manifest file inside the image.
    Pip { manifest: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.number, proto)
    }
}

impl fmt::Display for CommandForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandForm::Shell(cmd) => write!(f, "{cmd}"),
            CommandForm::Exec(argv) => {
                let json = serde_json::to_string(argv).map_err(|_| fmt::Error)?;
                write!(f, "{json}")
            }
        }
    }
}

/// Canonical single-line rendering. Cache keys are derived from it, so two
/// directives with the same rendering must mean the same thing.
impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::From(reference) => write!(f, "FROM {reference}"),
            Directive::Workdir(path) => write!(f, "WORKDIR {path:?}"),
            Directive::Copy { sources, dest } => {
                write!(f, "COPY")?;
                for src in sources {
                    write!(f, " {src:?}")?;
                }
                write!(f, " {dest:?}")
            }
            Directive::Run(cmd) => write!(f, "RUN {cmd}"),
            Directive::Install(PackageList::Os(packages)) => {
                write!(f, "INSTALL os {}", packages.join(" "))
            }
            Directive::Install(PackageList::Pip { manifest }) => {
                write!(f, "INSTALL pip {manifest:?}")
            }
            Directive::Env(pairs) => write_pairs(f, "ENV", pairs),
            Directive::Label(pairs) => write_pairs(f, "LABEL", pairs),
            Directive::Expose(ports) => {
                write!(f, "EXPOSE")?;
                for port in ports {
                    write!(f, " {port}")?;
                }
                Ok(())
            }
            Directive::Cmd(cmd) => write!(f, "CMD {cmd}"),
        }
    }
}

fn write_pairs(f: &mut fmt::Formatter<'_>, keyword: &str, pairs: &[(String, String)]) -> fmt::Result {
    write!(f, "{keyword}")?;
    for (key, value) in pairs {
        write!(f, " {key}={value:?}")?;
    }
    Ok(())
}

impl Recipe {
    /// Parse recipe text.
    pub fn parse(text: &str) -> std::result::Result<Self, RecipeError> {
        parse::parse_recipe(text)
    }

    /// Read and parse a recipe file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading recipe '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing recipe '{}'", path.display()))
    }

    /// The base image reference (first directive, guaranteed by the parser).
    pub fn base(&self) -> &ImageReference {
        match &self.instructions[0].directive {
            Directive::From(reference) => reference,
            _ => unreachable!("parser guarantees FROM comes first"),
        }
    }

    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.instructions.iter().map(|i| &i.directive)
    }
}

/// Locate the recipe file in a build context.
pub fn find_recipe_file(context_dir: &Path) -> Result<std::path::PathBuf> {
    for name in DEFAULT_RECIPE_FILES {
        let candidate = context_dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    anyhow::bail!(
        "no recipe found in '{}'; expected one of: {}",
        context_dir.display(),
        DEFAULT_RECIPE_FILES.join(", ")
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for building recipes in code
// ─────────────────────────────────────────────────────────────────────────────

/// Set one environment variable.
pub fn env(key: impl Into<String>, value: impl Into<String>) -> Directive {
    Directive::Env(vec![(key.into(), value.into())])
}

/// Run a shell command.
pub fn run(cmd: impl Into<String>) -> Directive {
    Directive::Run(CommandForm::Shell(cmd.into()))
}

/// Copy context paths to `dest`.
pub fn copy(sources: impl IntoIterator<Item = impl Into<String>>, dest: impl Into<String>) -> Directive {
    Directive::Copy {
        sources: sources.into_iter().map(Into::into).collect(),
        dest: dest.into(),
    }
}

/// Install OS packages.
pub fn install_os(packages: impl IntoIterator<Item = impl Into<String>>) -> Directive {
    Directive::Install(PackageList::Os(packages.into_iter().map(Into::into).collect()))
}
