//! image-builder - deterministic layered container image builder.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use image_builder::build_runs::{self, RunStatus, StepOutcome};
use image_builder::recipe::template::{python_service_recipe, RECIPE_FILE};
use image_builder::{
    build_with_config, image, preflight, BuildError, BuildOptions, BuilderConfig, ImageReference,
    Store,
};

#[derive(Parser)]
#[command(name = "image-builder")]
#[command(about = "Deterministic layered container image builder")]
#[command(
    after_help = "QUICK START:\n  image-builder init               Write a Python service Containerfile\n  image-builder preflight          Check host tools\n  image-builder build -t app:dev   Build the current directory\n  image-builder inspect app:dev    Show the image config"
)]
struct Cli {
    /// Builder config file (default: <context>/image-builder.toml, then $IMAGE_BUILDER_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a context directory
    Build {
        /// Build context (default: current directory)
        #[arg(default_value = ".")]
        context: PathBuf,

        /// Recipe file (default: Containerfile, then Dockerfile in the context)
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Tag the result as NAME:TAG
        #[arg(short = 't', long = "tag")]
        tag: Option<String>,

        /// Execute every step even when a cached layer exists
        #[arg(long)]
        no_cache: bool,
    },

    /// Write the Python service recipe into a context directory
    Init {
        #[arg(default_value = ".")]
        context: PathBuf,

        /// Overwrite an existing recipe
        #[arg(long)]
        force: bool,
    },

    /// Show a tagged image's config and layers
    Inspect { reference: String },

    /// Write a tagged image as an OCI image layout directory
    Export { reference: String, dir: PathBuf },

    /// Layer store maintenance
    Store {
        #[command(subcommand)]
        what: StoreCommand,
    },

    /// Build records
    Builds {
        #[command(subcommand)]
        what: BuildsCommand,
    },

    /// Check that the host can run builds
    Preflight,
}

#[derive(Subcommand)]
enum StoreCommand {
    /// Show store location and usage
    Status,
    /// Remove blobs no tag or cached layer refers to
    Gc,
    /// Keep only the newest cached layers
    Prune {
        #[arg(long)]
        keep: usize,
    },
}

#[derive(Subcommand)]
enum BuildsCommand {
    /// List build records, newest first
    List,
    /// Keep only the newest finished build records
    Prune {
        #[arg(long)]
        keep: usize,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            let code = err
                .downcast_ref::<BuildError>()
                .map(BuildError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let explicit = cli.config.as_deref();
    match cli.command {
        Commands::Build {
            context,
            file,
            tag,
            no_cache,
        } => {
            let config = BuilderConfig::discover(explicit, Some(&context))?;
            build(&config, &context, file.as_deref(), tag.as_deref(), no_cache)
        }
        Commands::Init { context, force } => init(&context, force),
        Commands::Inspect { reference } => {
            let config = BuilderConfig::discover(explicit, Some(Path::new(".")))?;
            let store = Store::open(&config.store_dir)?;
            let stored = image::inspect(&store, &ImageReference::parse_tag(&reference)?)?;
            print!("{stored}");
            Ok(())
        }
        Commands::Export { reference, dir } => {
            let config = BuilderConfig::discover(explicit, Some(Path::new(".")))?;
            let store = Store::open(&config.store_dir)?;
            image::export_oci_layout(&store, &ImageReference::parse_tag(&reference)?, &dir)?;
            println!("Exported {} to {}", reference, dir.display());
            Ok(())
        }
        Commands::Store { what } => {
            let config = BuilderConfig::discover(explicit, Some(Path::new(".")))?;
            store_command(&config, what)
        }
        Commands::Builds { what } => {
            let config = BuilderConfig::discover(explicit, Some(Path::new(".")))?;
            builds_command(&config, what)
        }
        Commands::Preflight => {
            let config = BuilderConfig::discover(explicit, Some(Path::new(".")))?;
            preflight::check_build_host(&config)?;
            println!("Preflight passed ({:?} runner)", config.runner);
            println!("  Store: {}", config.store_dir.display());
            println!("  Bases: {}", config.bases_dir.display());
            Ok(())
        }
    }
}

fn build(
    config: &BuilderConfig,
    context: &Path,
    file: Option<&Path>,
    tag: Option<&str>,
    no_cache: bool,
) -> Result<()> {
    let options = BuildOptions {
        tag: tag.map(ImageReference::parse_tag).transpose()?,
        no_cache,
        keep_builds: Some(config.keep_builds),
        recipe_name: String::new(),
    };
    let outcome = build_with_config(config, context, file, &options)?;

    let total = outcome.steps.len();
    for step in &outcome.steps {
        println!(
            "  [{}/{}] {:<6} {}",
            step.index, total, step.outcome, step.directive
        );
    }
    println!(
        "Built {} ({} cached, {} built)",
        outcome.manifest_digest,
        outcome.count(StepOutcome::Cached),
        outcome.count(StepOutcome::Built)
    );
    if let Some(tag) = &outcome.tag {
        println!("Tagged {}", tag.name_and_tag());
    }
    Ok(())
}

fn init(context: &Path, force: bool) -> Result<()> {
    fs::create_dir_all(context)
        .with_context(|| format!("creating context directory '{}'", context.display()))?;
    let path = context.join(RECIPE_FILE);
    if path.exists() && !force {
        bail!("'{}' already exists (use --force to overwrite)", path.display());
    }
    fs::write(&path, python_service_recipe())
        .with_context(|| format!("writing '{}'", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn store_command(config: &BuilderConfig, what: StoreCommand) -> Result<()> {
    let store = Store::open(&config.store_dir)?;
    match what {
        StoreCommand::Status => {
            let status = store.status()?;
            println!("Store:   {}", status.root.display());
            println!("Layers:  {}", status.layers);
            println!("Images:  {}", status.images);
            println!(
                "Blobs:   {} ({})",
                status.referenced_blobs,
                human_size(status.referenced_bytes)
            );
        }
        StoreCommand::Gc => {
            let removed = store.gc()?;
            println!("Removed {removed} unreferenced blob(s)");
        }
        StoreCommand::Prune { keep } => {
            let removed = store.prune_keep_last(keep)?;
            println!(
                "Removed {removed} cached layer entries; run `image-builder store gc` to free space"
            );
        }
    }
    Ok(())
}

fn builds_command(config: &BuilderConfig, what: BuildsCommand) -> Result<()> {
    let builds_dir = Store::open(&config.store_dir)?.builds_dir();
    match what {
        BuildsCommand::List => {
            let records = build_runs::load_records(&builds_dir)?;
            if records.is_empty() {
                println!("No builds recorded in {}", builds_dir.display());
            }
            for record in records {
                let detail = match (&record.status, &record.failure, &record.manifest_digest) {
                    (RunStatus::Failed, Some(failure), _) => format!(
                        "{} at step {}",
                        failure.kind,
                        failure
                            .step
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    ),
                    (_, _, Some(digest)) => digest.clone(),
                    _ => String::new(),
                };
                println!(
                    "{:<24} {:<8} {:<25} {:<20} {}",
                    record.run_id,
                    format!("{:?}", record.status).to_lowercase(),
                    record.created_at_utc,
                    record.tag.as_deref().unwrap_or("-"),
                    detail
                );
            }
        }
        BuildsCommand::Prune { keep } => {
            let removed = build_runs::prune_old_runs(&builds_dir, keep)?;
            println!("Removed {removed} build record(s)");
        }
    }
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
