//! Deterministic, layered container image builder.
//!
//! A recipe (`Containerfile`) is a list of directives. Each directive that
//! touches the filesystem produces one layer; layers are cached under a key
//! chained through every earlier step, so editing one directive rebuilds only
//! that step and the ones after it.
//!
//! - **Recipe** - directive parsing and the canonical Python service template
//! - **Builder** - the step pipeline, cache keys, lazy rootfs materialization
//! - **Store** - content-addressed blobs, cache index, tags, garbage collection
//! - **Packages** - OS package backends and the pip requirements parser
//! - **Preflight** - host tool validation before builds
//!
//! # Architecture
//!
//! ```text
//! Containerfile ──► recipe::Recipe
//!                        │
//!                        ▼
//!   base::BaseImageSource ──► builder::Builder ◄── runner::StepRunner
//!                        │          │
//!                        │          ├── context (COPY plans, ignore rules)
//!                        │          ├── snapshot (RUN / INSTALL deltas)
//!                        │          └── packages + manifest
//!                        ▼
//!                  store::Store ──► image (config, manifest, OCI export)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use image_builder::{build_with_config, BuildOptions, BuilderConfig, ImageReference};
//!
//! let config = BuilderConfig::discover(None, Some(Path::new(".")))?;
//! let outcome = build_with_config(
//!     &config,
//!     Path::new("."),
//!     None,
//!     &BuildOptions {
//!         tag: Some(ImageReference::parse_tag("hello:dev")?),
//!         ..Default::default()
//!     },
//! )?;
//! println!("{}", outcome.manifest_digest);
//! ```

pub mod base;
pub mod build_runs;
pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod image;
pub mod manifest;
pub mod packages;
pub mod preflight;
pub mod recipe;
pub mod reference;
pub mod runner;
pub mod snapshot;
pub mod store;

pub use builder::{build_with_config, BuildOptions, BuildOutcome, Builder};
pub use config::{BuilderConfig, RunnerKind};
pub use error::{BuildError, FailureKind, StepStatus};
pub use recipe::{Directive, Recipe};
pub use reference::ImageReference;
pub use store::Store;
