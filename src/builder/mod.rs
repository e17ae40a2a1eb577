//! The build pipeline.
//!
//! Directives run in recipe order. Each filesystem directive gets a chained
//! cache key (see [`cache_key`]); on a hit the stored layer is reused and on
//! a miss the directive executes and its layer is stored under the key.
//!
//! The working rootfs is materialized lazily: while every step hits the
//! cache nothing is unpacked at all. The first miss that needs the rootfs
//! unpacks the base and applies the layers collected so far, in order.
//!
//! A tag is only written once the whole recipe succeeded, so a failed build
//! never replaces a previously tagged image.

pub mod cache_key;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::base::{BaseImageSource, LocalBaseSource};
use crate::build_runs::{self, BuildRecord, BuildRun, FailureRecord, StepOutcome, StepRecord};
use crate::config::BuilderConfig;
use crate::context::{self, BuildContext, EntryKind};
use crate::error::{BuildError, StepStatus};
use crate::image::{
    Descriptor, Empty, History, ImageConfig, ImageManifest, RuntimeConfig, ANNOTATION_BASE_DIGEST,
    ANNOTATION_BASE_NAME, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER_ZSTD,
};
use crate::manifest::parse_manifest;
use crate::packages::{OsInstallPlan, PackageBackends, PipInstallPlan};
use crate::recipe::{expand_vars, Directive, PackageList, Recipe};
use crate::reference::ImageReference;
use crate::runner::{runner_for, StepCommand, StepOutput, StepRunner};
use crate::snapshot::Snapshot;
use crate::store::{DirReplace, LayerWriter, Store, WrittenLayer};

type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Tag written after a successful build.
    pub tag: Option<ImageReference>,
    /// Skip cache lookups. Produced layers are still stored.
    pub no_cache: bool,
    /// Finished build records to keep; `None` keeps all.
    pub keep_builds: Option<usize>,
    /// Shown in the build record, usually the recipe path.
    pub recipe_name: String,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub run_id: String,
    /// `sha256:<hex>` of the image manifest.
    pub manifest_digest: String,
    /// `sha256:<hex>` of the image config.
    pub config_digest: String,
    pub tag: Option<ImageReference>,
    pub steps: Vec<StepRecord>,
    /// False when every step came from the cache.
    pub rootfs_materialized: bool,
}

impl BuildOutcome {
    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

/// Runs recipes against a store.
pub struct Builder<'a> {
    store: &'a Store,
    bases: &'a dyn BaseImageSource,
    runner: &'a dyn StepRunner,
    backends: &'a PackageBackends,
}

struct LayerRef {
    digest: String,
    diff_id: String,
    size: u64,
    dirs: DirReplace,
}

struct BuildState {
    key: String,
    env: Vec<(String, String)>,
    workdir: String,
    labels: BTreeMap<String, String>,
    ports: BTreeMap<String, Empty>,
    cmd: Option<Vec<String>>,
    base: Option<(String, String)>,
    /// Image paths known to be directories from the recipe alone, without
    /// looking at the rootfs. `/` is implied.
    dirs: BTreeSet<String>,
    layers: Vec<LayerRef>,
    history: Vec<History>,
    scratch: PathBuf,
    rootfs: PathBuf,
    materialized: bool,
    /// Number of `layers` already present in `rootfs`.
    applied: usize,
}

impl BuildState {
    fn new(scratch: PathBuf) -> Self {
        Self {
            key: String::new(),
            env: Vec::new(),
            workdir: "/".to_string(),
            labels: BTreeMap::new(),
            ports: BTreeMap::new(),
            cmd: None,
            base: None,
            dirs: BTreeSet::new(),
            layers: Vec::new(),
            history: Vec::new(),
            rootfs: scratch.join("rootfs"),
            scratch,
            materialized: false,
            applied: 0,
        }
    }

    fn set_env(&mut self, key: &str, value: String) {
        match self.env.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.env.push((key.to_string(), value)),
        }
    }

    /// Record `abs` (normalized, absolute) and its ancestors as directories.
    fn note_dir(&mut self, abs: &str) {
        let mut path = abs.trim_end_matches('/').to_string();
        while !path.is_empty() && self.dirs.insert(path.clone()) {
            match path.rfind('/') {
                Some(i) => path.truncate(i),
                None => break,
            }
        }
    }

    fn is_known_dir(&self, abs: &str) -> bool {
        let path = abs.trim_end_matches('/');
        path.is_empty() || self.dirs.contains(path)
    }

    fn expand(&self, raw: &str) -> String {
        expand_vars(raw, &self.env)
    }

    fn push_layer(&mut self, layer: LayerRef, in_rootfs: bool) {
        self.layers.push(layer);
        if in_rootfs {
            self.applied = self.layers.len();
        }
    }
}

/// The directive being executed.
struct Step<'r> {
    index: usize,
    text: String,
    directive: &'r Directive,
}

impl Step<'_> {
    fn failed(&self, status: StepStatus, output: impl Into<String>) -> BuildError {
        BuildError::StepExecution {
            step: self.index,
            directive: self.text.clone(),
            status,
            output: output.into(),
        }
    }

    fn unresolved(&self, packages: Vec<String>, reason: impl Into<String>) -> BuildError {
        BuildError::PackageResolution {
            step: self.index,
            directive: self.text.clone(),
            packages,
            reason: reason.into(),
        }
    }

    fn record(&self, cache_key: &str, outcome: StepOutcome, layer: Option<&str>) -> StepRecord {
        StepRecord {
            index: self.index,
            directive: self.text.clone(),
            cache_key: cache_key.to_string(),
            outcome,
            layer_digest: layer.map(|d| format!("sha256:{d}")),
        }
    }
}

/// A freshly written layer and whether the working rootfs already holds it.
struct Produced {
    layer: WrittenLayer,
    in_rootfs: bool,
}

impl<'a> Builder<'a> {
    pub fn new(
        store: &'a Store,
        bases: &'a dyn BaseImageSource,
        runner: &'a dyn StepRunner,
        backends: &'a PackageBackends,
    ) -> Self {
        Self {
            store,
            bases,
            runner,
            backends,
        }
    }

    /// Build `recipe` with `context_dir` as the COPY source.
    pub fn build(
        &self,
        recipe: &Recipe,
        context_dir: &Path,
        options: &BuildOptions,
    ) -> Result<BuildOutcome> {
        let builds_dir = self.store.builds_dir();
        let run = BuildRun::allocate(&builds_dir)?;
        let mut record = BuildRecord::started(
            &run.run_id,
            &options.recipe_name,
            options.tag.as_ref().map(ImageReference::name_and_tag),
        )?;
        run.write_record(&record)?;
        tracing::info!(
            run_id = %run.run_id,
            recipe = %options.recipe_name,
            runner = self.runner.name(),
            no_cache = options.no_cache,
            "build started"
        );

        let result = self.execute(recipe, context_dir, options, &run, &mut record);

        match &result {
            Ok(outcome) => {
                record.finish_success(&outcome.manifest_digest)?;
                tracing::info!(
                    run_id = %run.run_id,
                    digest = %outcome.manifest_digest,
                    cached = outcome.count(StepOutcome::Cached),
                    built = outcome.count(StepOutcome::Built),
                    "build finished"
                );
            }
            Err(err) => {
                record.finish_failed(FailureRecord {
                    step: err.step(),
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                })?;
                tracing::error!(run_id = %run.run_id, step = ?err.step(), kind = %err.kind(), "build failed");
            }
        }

        if let Err(e) = run.write_record(&record) {
            tracing::warn!("failed to write build record: {e:#}");
        }
        if let Err(e) = run.cleanup_work() {
            tracing::warn!("failed to remove build work directory: {e:#}");
        }
        if let Some(keep) = options.keep_builds {
            match build_runs::prune_old_runs(&builds_dir, keep) {
                Ok(0) => {}
                Ok(n) => tracing::debug!(removed = n, "pruned old build records"),
                Err(e) => tracing::warn!("failed to prune build records: {e:#}"),
            }
        }
        result
    }

    fn execute(
        &self,
        recipe: &Recipe,
        context_dir: &Path,
        options: &BuildOptions,
        run: &BuildRun,
        record: &mut BuildRecord,
    ) -> Result<BuildOutcome> {
        let context = BuildContext::open(context_dir)?;
        let scratch = run.work_dir();
        fs::create_dir_all(&scratch)
            .with_context(|| format!("creating work directory '{}'", scratch.display()))?;
        let mut state = BuildState::new(scratch);

        for (i, instruction) in recipe.instructions.iter().enumerate() {
            let step = Step {
                index: i + 1,
                text: instruction.directive.to_string(),
                directive: &instruction.directive,
            };
            let step_record = self.run_step(&step, &context, options.no_cache, &mut state)?;
            state.history.push(History {
                created_by: step.text.clone(),
                empty_layer: step.directive.is_metadata_only(),
            });
            if record.base_digest.is_none() {
                record.base_digest = state.base.as_ref().map(|(_, digest)| digest.clone());
            }
            record.steps.push(step_record);
            run.write_record(record)?;
        }

        let (manifest_digest, config_digest) = self.assemble(&mut state, options.tag.as_ref())?;
        Ok(BuildOutcome {
            run_id: run.run_id.clone(),
            manifest_digest,
            config_digest,
            tag: options.tag.clone(),
            steps: record.steps.clone(),
            rootfs_materialized: state.materialized,
        })
    }

    fn run_step(
        &self,
        step: &Step<'_>,
        context: &BuildContext,
        no_cache: bool,
        state: &mut BuildState,
    ) -> Result<StepRecord> {
        match step.directive {
            Directive::From(reference) => self.from_step(step, reference, no_cache, state),
            Directive::Workdir(raw) => {
                let path = resolve_image_path(&state.workdir, &state.expand(raw))?;
                let key = cache_key::step_key(&state.key, &step.text, &path);
                let record = self.layer_step(step, key, no_cache, state, |state, out| {
                    self.make_workdir(step, state, &path, out)
                })?;
                state.note_dir(&path);
                state.workdir = path;
                Ok(record)
            }
            Directive::Copy { sources, dest } => {
                let sources: Vec<String> = sources.iter().map(|s| state.expand(s)).collect();
                let mut dest = copy_destination(&state.workdir, &state.expand(dest));
                if !dest.ends_with('/') && state.is_known_dir(&resolve_image_path("/", &dest)?) {
                    dest.push('/');
                }
                let plan = context
                    .plan_copy(&sources, &dest)
                    .map_err(|e| step.failed(StepStatus::Rejected, format!("{e:#}")))?;
                for entry in &plan.entries {
                    let created = match entry.kind {
                        EntryKind::Dir => Some(entry.dest.as_path()),
                        _ => entry.dest.parent(),
                    };
                    if let Some(dir) = created {
                        state.note_dir(&format!("/{}", dir.display()));
                    }
                }
                let key = cache_key::step_key(&state.key, &step.text, &format!("copy:{}", plan.digest()?));
                self.layer_step(step, key, no_cache, state, |state, out| {
                    if state.materialized {
                        self.ensure_rootfs(state)?;
                        if let Some(entry) = plan.entries.iter().find(|e| {
                            !matches!(e.kind, EntryKind::Dir)
                                && fs::symlink_metadata(state.rootfs.join(&e.dest))
                                    .is_ok_and(|m| m.is_dir())
                        }) {
                            return Err(step.failed(
                                StepStatus::Rejected,
                                format!(
                                    "'/{}' is a directory; end the destination with '/' to copy into it",
                                    entry.dest.display()
                                ),
                            ));
                        }
                    }
                    let mut writer = LayerWriter::create(out)?;
                    for entry in &plan.entries {
                        match &entry.kind {
                            EntryKind::Dir => writer.append_dir(&entry.dest, entry.mode)?,
                            EntryKind::File { .. } => {
                                writer.append_file(&entry.dest, entry.mode, &entry.source)?
                            }
                            EntryKind::Symlink { target } => writer.append_symlink(&entry.dest, target)?,
                        }
                    }
                    Ok(Produced {
                        layer: writer.finish()?,
                        in_rootfs: false,
                    })
                })
            }
            Directive::Run(form) => {
                let argv = form.argv();
                let key = cache_key::step_key(&state.key, &step.text, "");
                self.layer_step(step, key, no_cache, state, |state, out| {
                    self.capture(state, out, |state| {
                        let output = self.exec(step, state, &argv)?;
                        if !output.success() {
                            return Err(step.failed(
                                StepStatus::from_exit(output.status),
                                output.diagnostics(),
                            ));
                        }
                        Ok(())
                    })
                })
            }
            Directive::Install(PackageList::Os(packages)) => {
                let plan = OsInstallPlan::new(&self.backends.os, packages)
                    .map_err(|e| step.unresolved(packages.clone(), format!("{e:#}")))?;
                let key = cache_key::step_key(&state.key, &step.text, &plan.fingerprint());
                self.layer_step(step, key, no_cache, state, |state, out| {
                    self.capture(state, out, |state| self.install_os(step, state, &plan))
                })
            }
            Directive::Install(PackageList::Pip { manifest }) => {
                let manifest = resolve_image_path(&state.workdir, &state.expand(manifest))?;
                let plan = PipInstallPlan::new(&self.backends.pip, &manifest);
                let key = cache_key::step_key(&state.key, &step.text, &plan.fingerprint());
                self.layer_step(step, key, no_cache, state, |state, out| {
                    self.capture(state, out, |state| self.install_pip(step, state, &plan))
                })
            }
            Directive::Env(pairs) => {
                for (key, value) in pairs {
                    let value = state.expand(value);
                    state.set_env(key, value);
                }
                Ok(metadata_step(step, state))
            }
            Directive::Label(pairs) => {
                for (key, value) in pairs {
                    let value = state.expand(value);
                    state.labels.insert(key.clone(), value);
                }
                Ok(metadata_step(step, state))
            }
            Directive::Expose(ports) => {
                for port in ports {
                    state.ports.insert(port.to_string(), Empty {});
                }
                Ok(metadata_step(step, state))
            }
            Directive::Cmd(form) => {
                state.cmd = Some(form.argv());
                Ok(metadata_step(step, state))
            }
        }
    }

    fn from_step(
        &self,
        step: &Step<'_>,
        reference: &ImageReference,
        no_cache: bool,
        state: &mut BuildState,
    ) -> Result<StepRecord> {
        let base = self.bases.fetch(reference).map_err(|e| BuildError::Fetch {
            step: step.index,
            directive: step.text.clone(),
            reference: reference.to_string(),
            reason: format!("{e:#}"),
        })?;
        let key = cache_key::base_key(reference, &base.digest, base.config_digest.as_deref());

        for dir in base.directories()? {
            state.note_dir(&dir);
        }

        for (name, value) in &base.config.env {
            state.set_env(name, value.clone());
        }
        if let Some(workdir) = &base.config.workdir {
            let workdir = resolve_image_path("/", workdir)?;
            state.note_dir(&workdir);
            state.workdir = workdir;
        }
        state.cmd = base.config.cmd.clone();
        state.base = Some((reference.to_string(), base.digest.clone()));

        self.layer_step(step, key, no_cache, state, |state, out| {
            base.unpack_into(&state.rootfs)?;
            state.materialized = true;
            let mut writer = LayerWriter::create(out)?;
            writer.append_tree(&state.rootfs)?;
            Ok(Produced {
                layer: writer.finish()?,
                in_rootfs: true,
            })
        })
    }

    /// Reuse the layer cached under `key`, or run `produce` and store its
    /// output under `key`.
    fn layer_step<F>(
        &self,
        step: &Step<'_>,
        key: String,
        no_cache: bool,
        state: &mut BuildState,
        produce: F,
    ) -> Result<StepRecord>
    where
        F: FnOnce(&mut BuildState, &Path) -> Result<Produced>,
    {
        if !no_cache {
            if let Some(hit) = self.store.get_layer(&key)? {
                let diff_id = hit
                    .entry
                    .diff_id
                    .clone()
                    .ok_or_else(|| anyhow!("cached layer {key} has no diff id"))?;
                tracing::info!(
                    step = step.index,
                    cache_key = short(&key),
                    directive = %step.text,
                    "cache hit"
                );
                let digest = hit.entry.blob_sha256.clone();
                state.push_layer(
                    LayerRef {
                        digest: digest.clone(),
                        diff_id,
                        size: hit.entry.size_bytes,
                        dirs: dir_replace(step.directive),
                    },
                    false,
                );
                state.key = key;
                return Ok(step.record(&state.key, StepOutcome::Cached, Some(&digest)));
            }
        }

        tracing::info!(
            step = step.index,
            cache_key = short(&key),
            directive = %step.text,
            "executing"
        );
        let out = state.scratch.join(format!("layer-{}.tar.zst", step.index));
        let produced = produce(state, &out)?;
        let mut meta = BTreeMap::new();
        meta.insert("directive".to_string(), serde_json::json!(step.text));
        meta.insert("entries".to_string(), serde_json::json!(produced.layer.entries));
        let entry = self.store.put_layer(&key, produced.layer, meta)?;
        let diff_id = entry
            .diff_id
            .clone()
            .ok_or_else(|| anyhow!("stored layer {key} has no diff id"))?;
        tracing::debug!(step = step.index, layer = %entry.blob_sha256, size = entry.size_bytes, "stored layer");

        state.push_layer(
            LayerRef {
                digest: entry.blob_sha256.clone(),
                diff_id,
                size: entry.size_bytes,
                dirs: dir_replace(step.directive),
            },
            produced.in_rootfs,
        );
        state.key = key;
        Ok(step.record(&state.key, StepOutcome::Built, Some(&entry.blob_sha256)))
    }

    /// Bring the working rootfs up to date with every layer so far.
    fn ensure_rootfs(&self, state: &mut BuildState) -> anyhow::Result<()> {
        if !state.materialized {
            fs::create_dir_all(&state.rootfs)
                .with_context(|| format!("creating rootfs '{}'", state.rootfs.display()))?;
            state.materialized = true;
            tracing::debug!(layers = state.layers.len(), "materializing rootfs");
        }
        for layer in &state.layers[state.applied..] {
            self.store.apply_layer(&layer.digest, &state.rootfs, layer.dirs)?;
        }
        state.applied = state.layers.len();
        Ok(())
    }

    /// Run `action` against the rootfs and turn whatever it changed into a
    /// layer.
    fn capture<F>(&self, state: &mut BuildState, out: &Path, action: F) -> Result<Produced>
    where
        F: FnOnce(&BuildState) -> Result<()>,
    {
        self.ensure_rootfs(state)?;
        let before = Snapshot::take(&state.rootfs)?;
        action(&*state)?;
        let changes = before.diff(&Snapshot::take(&state.rootfs)?);
        tracing::debug!(
            changed = changes.changed.len(),
            deleted = changes.deleted.len(),
            "captured rootfs changes"
        );

        let mut writer = LayerWriter::create(out)?;
        for rel in &changes.changed {
            writer.append_path(rel, &state.rootfs.join(rel))?;
        }
        for rel in &changes.deleted {
            writer.append_whiteout(rel)?;
        }
        Ok(Produced {
            layer: writer.finish()?,
            in_rootfs: true,
        })
    }

    fn make_workdir(
        &self,
        step: &Step<'_>,
        state: &mut BuildState,
        path: &str,
        out: &Path,
    ) -> Result<Produced> {
        self.ensure_rootfs(state)?;
        let mut writer = LayerWriter::create(out)?;
        let mut current = PathBuf::new();
        for component in context::image_relative(path)?.components() {
            current.push(component);
            let host = state.rootfs.join(&current);
            match fs::symlink_metadata(&host) {
                Ok(meta) if meta.is_dir() || meta.file_type().is_symlink() => {}
                Ok(_) => {
                    return Err(step.failed(
                        StepStatus::Rejected,
                        format!("'/{}' exists and is not a directory", current.display()),
                    ))
                }
                Err(_) => {
                    fs::create_dir(&host)
                        .with_context(|| format!("creating '{}'", host.display()))?;
                    fs::set_permissions(&host, fs::Permissions::from_mode(0o755))
                        .with_context(|| format!("setting mode on '{}'", host.display()))?;
                    writer.append_dir(&current, 0o755)?;
                }
            }
        }
        Ok(Produced {
            layer: writer.finish()?,
            in_rootfs: true,
        })
    }

    fn install_os(&self, step: &Step<'_>, state: &BuildState, plan: &OsInstallPlan) -> Result<()> {
        if let Some(prepare) = &plan.prepare {
            let output = self.sh(step, state, prepare)?;
            if !output.success() {
                return Err(BuildError::Fetch {
                    step: step.index,
                    directive: step.text.clone(),
                    reference: "package index".to_string(),
                    reason: output.diagnostics(),
                });
            }
        }

        let mut missing = Vec::new();
        for (package, cmd) in &plan.resolve {
            let output = self.sh(step, state, cmd)?;
            if !output.success() {
                tracing::debug!(package = %package, output = %output.diagnostics(), "package did not resolve");
                missing.push(package.clone());
            }
        }
        if !missing.is_empty() {
            let reason = format!("unable to locate package(s): {}", missing.join(", "));
            return Err(step.unresolved(missing, reason));
        }

        let output = self.sh(step, state, &plan.install)?;
        if !output.success() {
            return Err(step.failed(StepStatus::from_exit(output.status), output.diagnostics()));
        }
        if let Some(cleanup) = &plan.cleanup {
            let output = self.sh(step, state, cleanup)?;
            if !output.success() {
                return Err(step.failed(StepStatus::from_exit(output.status), output.diagnostics()));
            }
        }
        tracing::info!(step = step.index, packages = ?plan.packages, "installed OS packages");
        Ok(())
    }

    fn install_pip(&self, step: &Step<'_>, state: &BuildState, plan: &PipInstallPlan) -> Result<()> {
        let host_manifest = state.rootfs.join(context::image_relative(&plan.manifest)?);
        let manifest = parse_manifest(&host_manifest, &state.rootfs)
            .map_err(|e| step.unresolved(Vec::new(), e.to_string()))?;
        let names: Vec<String> = manifest.requirements.iter().map(|r| r.name.clone()).collect();
        if names.is_empty() {
            tracing::warn!(step = step.index, manifest = %plan.manifest, "manifest lists no requirements");
        }

        let output = self.sh(step, state, &plan.install)?;
        if !output.success() {
            return Err(step.unresolved(names, output.diagnostics()));
        }
        tracing::info!(step = step.index, requirements = names.len(), "installed application dependencies");
        Ok(())
    }

    fn sh(&self, step: &Step<'_>, state: &BuildState, script: &str) -> Result<StepOutput> {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
        self.exec(step, state, &argv)
    }

    fn exec(&self, step: &Step<'_>, state: &BuildState, argv: &[String]) -> Result<StepOutput> {
        let command = StepCommand {
            argv,
            env: &state.env,
            workdir: &state.workdir,
        };
        let output = self
            .runner
            .run(&state.rootfs, &command)
            .map_err(|e| step.failed(StepStatus::NotStarted, format!("{e:#}")))?;
        tracing::debug!(step = step.index, status = ?output.status, "command finished");
        Ok(output)
    }

    /// Write config and manifest, then tag. Returns the manifest and config
    /// digests.
    fn assemble(
        &self,
        state: &mut BuildState,
        tag: Option<&ImageReference>,
    ) -> Result<(String, String)> {
        let runtime = RuntimeConfig {
            env: state.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            working_dir: Some(state.workdir.clone()),
            exposed_ports: state.ports.clone(),
            cmd: state.cmd.clone(),
            labels: state.labels.clone(),
        };
        let mut config = ImageConfig::new(runtime);
        config.rootfs.diff_ids = state
            .layers
            .iter()
            .map(|l| format!("sha256:{}", l.diff_id))
            .collect();
        config.history = std::mem::take(&mut state.history);
        let (config_sha, config_size) = self.store.put_json_blob(&config)?;

        let layers = state
            .layers
            .iter()
            .map(|l| Descriptor::new(MEDIA_TYPE_LAYER_ZSTD, &l.digest, l.size))
            .collect();
        let mut manifest = ImageManifest::new(
            Descriptor::new(MEDIA_TYPE_CONFIG, &config_sha, config_size),
            layers,
        );
        if let Some((name, digest)) = &state.base {
            manifest
                .annotations
                .insert(ANNOTATION_BASE_NAME.to_string(), name.clone());
            manifest
                .annotations
                .insert(ANNOTATION_BASE_DIGEST.to_string(), digest.clone());
        }
        let (manifest_sha, manifest_size) = self.store.put_json_blob(&manifest)?;

        if let Some(tag) = tag {
            self.store.tag(tag, &manifest_sha, manifest_size)?;
            tracing::info!(image = %tag, digest = %manifest_sha, "tagged image");
        }
        Ok((format!("sha256:{manifest_sha}"), format!("sha256:{config_sha}")))
    }
}

fn metadata_step(step: &Step<'_>, state: &mut BuildState) -> StepRecord {
    state.key = cache_key::step_key(&state.key, &step.text, "");
    tracing::debug!(step = step.index, directive = %step.text, "metadata");
    step.record(&state.key, StepOutcome::Metadata, None)
}

/// COPY layers never replace a directory; command layers may.
fn dir_replace(directive: &Directive) -> DirReplace {
    match directive {
        Directive::Copy { .. } => DirReplace::Refuse,
        _ => DirReplace::Allow,
    }
}

fn short(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

/// Resolve `raw` against `workdir` into a normalized absolute image path.
fn resolve_image_path(workdir: &str, raw: &str) -> anyhow::Result<String> {
    let joined = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), raw)
    };
    let rel = context::image_relative(&joined)?;
    Ok(format!("/{}", rel.display()))
}

/// Like [`resolve_image_path`] but keeps the "this is a directory" hint of a
/// trailing `/` or `.`.
fn copy_destination(workdir: &str, raw: &str) -> String {
    let joined = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), raw)
    };
    let dir_hint = raw.ends_with('/') || raw == "." || raw.ends_with("/.");
    if dir_hint && !joined.ends_with('/') {
        format!("{}/", joined.trim_end_matches('.').trim_end_matches('/'))
    } else {
        joined
    }
}

/// Build the recipe in `context_dir` with everything taken from `config`.
pub fn build_with_config(
    config: &BuilderConfig,
    context_dir: &Path,
    recipe_path: Option<&Path>,
    options: &BuildOptions,
) -> Result<BuildOutcome> {
    let recipe_path = match recipe_path {
        Some(path) => path.to_path_buf(),
        None => crate::recipe::find_recipe_file(context_dir)?,
    };
    let text = fs::read_to_string(&recipe_path)
        .with_context(|| format!("reading recipe '{}'", recipe_path.display()))?;
    let recipe = Recipe::parse(&text)?;
    config.packages.validate_for(config.runner)?;

    let store = Store::open(&config.store_dir)?;
    let bases = LocalBaseSource::new(&config.bases_dir);
    let runner = runner_for(config.runner);
    let mut options = options.clone();
    if options.recipe_name.is_empty() {
        options.recipe_name = recipe_path.display().to_string();
    }
    if options.keep_builds.is_none() {
        options.keep_builds = Some(config.keep_builds);
    }
    Builder::new(&store, &bases, runner.as_ref(), &config.packages).build(&recipe, context_dir, &options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_runs::{load_records, RunStatus};
    use crate::error::FailureKind;
    use crate::image;
    use crate::packages::{OsBackend, PipBackend};
    use crate::recipe::template::python_service_recipe;
    use crate::recipe::{Port, Protocol};
    use crate::runner::HostRunner;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        store: Store,
        bases: LocalBaseSource,
        backends: PackageBackends,
        context: PathBuf,
        pip_runs: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();

        let base = root.join("bases/python/3.11-slim");
        fs::create_dir_all(base.join("rootfs/etc")).unwrap();
        fs::create_dir_all(base.join("rootfs/usr/local/bin")).unwrap();
        fs::write(base.join("rootfs/etc/os-release"), "ID=debian\n").unwrap();
        fs::write(base.join("rootfs/usr/local/bin/python3"), "#!/bin/sh\n").unwrap();
        fs::write(
            base.join("config.json"),
            r#"{"env": {"LANG": "C.UTF-8"}, "cmd": ["python3"]}"#,
        )
        .unwrap();

        let catalog = root.join("catalog.txt");
        fs::write(&catalog, "curl\nnetcat-traditional\nca-certificates\n").unwrap();
        let pip_runs = root.join("pip-runs.log");
        let backends = PackageBackends {
            os: OsBackend {
                prepare: Some(
                    r#"mkdir -p "$IMAGE_ROOT/var/lib/fakepkg/lists" && : > "$IMAGE_ROOT/var/lib/fakepkg/lists/main""#
                        .into(),
                ),
                resolve: Some(format!("grep -qx {{package}} {}", catalog.display())),
                install: r#"mkdir -p "$IMAGE_ROOT/usr/bin" && for p in {packages}; do echo "$p" > "$IMAGE_ROOT/usr/bin/$p"; done"#
                    .into(),
                cleanup: Some(r#"rm -rf "$IMAGE_ROOT/var/lib/fakepkg/lists""#.into()),
            },
            pip: PipBackend {
                install: format!(
                    r#"echo run >> {} && mkdir -p "$IMAGE_ROOT/usr/local/lib/site-packages" && cp "$IMAGE_ROOT"{{manifest}} "$IMAGE_ROOT/usr/local/lib/site-packages/installed.txt""#,
                    pip_runs.display()
                ),
            },
        };
        backends.validate().unwrap();

        let context = root.join("service");
        fs::create_dir_all(&context).unwrap();
        fs::write(context.join("Containerfile"), python_service_recipe()).unwrap();
        fs::write(
            context.join("requirements.txt"),
            "fastapi==0.110.0\nuvicorn[standard]>=0.29\n",
        )
        .unwrap();
        fs::write(context.join("app.py"), "print('hello')\n").unwrap();
        fs::write(context.join(".containerignore"), "__pycache__\n*.pyc\n").unwrap();

        Fixture {
            store: Store::open(&root.join("store")).unwrap(),
            bases: LocalBaseSource::new(root.join("bases")),
            _tmp: tmp,
            root,
            backends,
            context,
            pip_runs,
        }
    }

    fn tag() -> ImageReference {
        ImageReference::parse_tag("hello:dev").unwrap()
    }

    fn build(fx: &Fixture, no_cache: bool) -> Result<BuildOutcome> {
        let text = fs::read_to_string(fx.context.join("Containerfile")).unwrap();
        let recipe = Recipe::parse(&text).unwrap();
        let builder = Builder::new(&fx.store, &fx.bases, &HostRunner, &fx.backends);
        builder.build(
            &recipe,
            &fx.context,
            &BuildOptions {
                tag: Some(tag()),
                no_cache,
                keep_builds: None,
                recipe_name: "Containerfile".into(),
            },
        )
    }

    fn pip_runs(fx: &Fixture) -> usize {
        fs::read_to_string(&fx.pip_runs)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn outcome_of<'o>(outcome: &'o BuildOutcome, prefix: &str) -> &'o StepRecord {
        outcome
            .steps
            .iter()
            .find(|s| s.directive.starts_with(prefix))
            .unwrap_or_else(|| panic!("no step starting with {prefix}"))
    }

    #[test]
    fn rebuild_is_reproducible_and_lazy() {
        let fx = fixture();
        let first = build(&fx, false).unwrap();
        assert_eq!(first.count(StepOutcome::Cached), 0);
        assert!(first.rootfs_materialized);
        assert_eq!(pip_runs(&fx), 1);

        let second = build(&fx, false).unwrap();
        assert_eq!(second.manifest_digest, first.manifest_digest);
        assert_eq!(second.count(StepOutcome::Built), 0);
        assert!(!second.rootfs_materialized);
        assert_eq!(pip_runs(&fx), 1);

        let third = build(&fx, true).unwrap();
        assert_eq!(third.manifest_digest, first.manifest_digest);
        assert_eq!(third.count(StepOutcome::Cached), 0);
        assert_eq!(pip_runs(&fx), 2);

        let tagged = fx.store.resolve_tag(&tag()).unwrap().unwrap();
        assert_eq!(format!("sha256:{}", tagged.entry.blob_sha256), first.manifest_digest);
    }

    #[test]
    fn source_change_reuses_dependency_layer() {
        let fx = fixture();
        let first = build(&fx, false).unwrap();

        fs::write(fx.context.join("app.py"), "print('changed')\n").unwrap();
        let second = build(&fx, false).unwrap();
        assert_ne!(second.manifest_digest, first.manifest_digest);
        assert_eq!(outcome_of(&second, "INSTALL os").outcome, StepOutcome::Cached);
        assert_eq!(outcome_of(&second, "INSTALL pip").outcome, StepOutcome::Cached);
        assert_eq!(outcome_of(&second, r#"COPY "." ".""#).outcome, StepOutcome::Built);
        assert_eq!(pip_runs(&fx), 1);
    }

    #[test]
    fn manifest_change_reinstalls_dependencies() {
        let fx = fixture();
        build(&fx, false).unwrap();

        fs::write(fx.context.join("requirements.txt"), "fastapi==0.111.0\n").unwrap();
        let second = build(&fx, false).unwrap();
        assert_eq!(outcome_of(&second, "INSTALL os").outcome, StepOutcome::Cached);
        assert_eq!(outcome_of(&second, "INSTALL pip").outcome, StepOutcome::Built);
        assert_eq!(pip_runs(&fx), 2);
    }

    #[test]
    fn built_image_is_inspectable() {
        let fx = fixture();
        let outcome = build(&fx, false).unwrap();
        let stored = image::inspect(&fx.store, &tag()).unwrap();

        assert_eq!(stored.manifest_digest, outcome.manifest_digest);
        let runtime = &stored.config.config;
        assert!(runtime.exposes(&Port {
            number: 8000,
            protocol: Protocol::Tcp
        }));
        assert_eq!(runtime.env_value("PYTHONUNBUFFERED"), Some("1"));
        assert_eq!(runtime.env_value("LANG"), Some("C.UTF-8"));
        assert_eq!(runtime.working_dir.as_deref(), Some("/app"));
        assert_eq!(runtime.cmd.as_deref(), Some(&["python3".to_string()][..]));
        assert_eq!(stored.manifest.layers.len(), stored.config.rootfs.diff_ids.len());
        assert_eq!(stored.config.history.len(), outcome.steps.len());
        assert_eq!(
            stored.manifest.annotations.get(ANNOTATION_BASE_NAME).map(String::as_str),
            Some("python:3.11-slim")
        );

        let records = load_records(&fx.store.builds_dir()).unwrap();
        assert_eq!(records[0].status, RunStatus::Success);
        assert_eq!(records[0].manifest_digest.as_deref(), Some(outcome.manifest_digest.as_str()));
        assert!(!fx.store.builds_dir().join(&outcome.run_id).join("work").exists());
    }

    #[test]
    fn layers_reproduce_the_filesystem() {
        let fx = fixture();
        fs::write(
            fx.context.join("Containerfile"),
            "FROM python:3.11-slim\nWORKDIR /app\nCOPY app.py .\nRUN rm ../etc/os-release && echo ok > built.txt\n",
        )
        .unwrap();
        build(&fx, false).unwrap();

        let stored = image::inspect(&fx.store, &tag()).unwrap();
        let dest = fx.root.join("unpacked");
        fs::create_dir_all(&dest).unwrap();
        for layer in &stored.manifest.layers {
            fx.store
                .apply_layer(layer.hex().unwrap(), &dest, DirReplace::Allow)
                .unwrap();
        }
        assert!(dest.join("etc").is_dir());
        assert!(!dest.join("etc/os-release").exists());
        assert_eq!(fs::read_to_string(dest.join("app/app.py")).unwrap(), "print('hello')\n");
        assert_eq!(fs::read_to_string(dest.join("app/built.txt")).unwrap(), "ok\n");
        assert!(dest.join("usr/local/bin/python3").is_file());
    }

    #[test]
    fn unknown_os_package_fails_without_tagging() {
        let fx = fixture();
        fs::write(
            fx.context.join("Containerfile"),
            "FROM python:3.11-slim\nINSTALL os curl no-such-package\n",
        )
        .unwrap();
        let err = build(&fx, false).unwrap_err();
        match &err {
            BuildError::PackageResolution { step, packages, .. } => {
                assert_eq!(*step, 2);
                assert_eq!(packages, &vec!["no-such-package".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.exit_code(), 3);
        assert!(fx.store.resolve_tag(&tag()).unwrap().is_none());

        let records = load_records(&fx.store.builds_dir()).unwrap();
        assert_eq!(records[0].status, RunStatus::Failed);
        let failure = records[0].failure.as_ref().unwrap();
        assert_eq!(failure.step, Some(2));
        assert_eq!(failure.kind, FailureKind::PackageResolution.to_string());
    }

    #[test]
    fn failed_build_keeps_previous_tag() {
        let fx = fixture();
        let good = build(&fx, false).unwrap();

        let mut recipe = python_service_recipe();
        recipe.push_str("RUN echo boom >&2; exit 3\n");
        fs::write(fx.context.join("Containerfile"), recipe).unwrap();
        let err = build(&fx, false).unwrap_err();
        match &err {
            BuildError::StepExecution { status, output, .. } => {
                assert_eq!(*status, StepStatus::Exited(3));
                assert!(output.contains("boom"), "{output}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.kind(), FailureKind::StepExecution);

        let tagged = fx.store.resolve_tag(&tag()).unwrap().unwrap();
        assert_eq!(format!("sha256:{}", tagged.entry.blob_sha256), good.manifest_digest);
    }

    #[test]
    fn malformed_manifest_is_a_resolution_failure() {
        let fx = fixture();
        fs::write(fx.context.join("requirements.txt"), "fastapi=1.0\n").unwrap();
        let err = build(&fx, false).unwrap_err();
        assert_eq!(err.kind(), FailureKind::PackageResolution);
        assert!(err.to_string().contains("requirements.txt"), "{err}");
        assert_eq!(pip_runs(&fx), 0);
    }

    #[test]
    fn missing_base_is_a_fetch_failure() {
        let fx = fixture();
        fs::write(fx.context.join("Containerfile"), "FROM ghost:1.0\nRUN true\n").unwrap();
        let err = build(&fx, false).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Fetch);
        assert_eq!(err.step(), Some(1));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn missing_copy_source_fails_the_step() {
        let fx = fixture();
        fs::write(
            fx.context.join("Containerfile"),
            "FROM python:3.11-slim\nCOPY missing.txt /app/\n",
        )
        .unwrap();
        let err = build(&fx, false).unwrap_err();
        assert_eq!(err.kind(), FailureKind::StepExecution);
        assert_eq!(err.step(), Some(2));
    }

    #[test]
    fn copy_onto_workdir_adds_to_the_directory() {
        let fx = fixture();
        fs::write(
            fx.context.join("Containerfile"),
            "FROM python:3.11-slim\nWORKDIR /app\nRUN echo keep > keep.txt\nCOPY app.py /app\n\
             COPY app.py /usr/local/bin\nRUN test -f keep.txt && test -f app.py\n",
        )
        .unwrap();
        let outcome = build(&fx, false).unwrap();
        assert_eq!(outcome.steps.len(), 6);

        let stored = image::inspect(&fx.store, &tag()).unwrap();
        let dest = fx.root.join("unpacked");
        fs::create_dir_all(&dest).unwrap();
        for layer in &stored.manifest.layers {
            fx.store
                .apply_layer(layer.hex().unwrap(), &dest, DirReplace::Allow)
                .unwrap();
        }
        assert!(dest.join("app").is_dir());
        assert_eq!(fs::read_to_string(dest.join("app/keep.txt")).unwrap(), "keep\n");
        assert_eq!(
            fs::read_to_string(dest.join("app/app.py")).unwrap(),
            "print('hello')\n"
        );
        assert!(dest.join("usr/local/bin").is_dir());
        assert!(dest.join("usr/local/bin/app.py").is_file());
    }

    #[test]
    fn copy_file_over_command_created_directory_fails() {
        let fx = fixture();
        fs::write(
            fx.context.join("Containerfile"),
            "FROM python:3.11-slim\nRUN mkdir -p \"$IMAGE_ROOT/data\"\nCOPY app.py /data\n",
        )
        .unwrap();
        let err = build(&fx, false).unwrap_err();
        assert_eq!(err.step(), Some(3));
        match &err {
            BuildError::StepExecution { status, output, .. } => {
                assert_eq!(*status, StepStatus::Rejected);
                assert!(output.contains("'/data' is a directory"), "{output}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.store.resolve_tag(&tag()).unwrap().is_none());
    }

    #[test]
    fn unstartable_command_is_reported_as_such() {
        let fx = fixture();
        fs::write(
            fx.context.join("Containerfile"),
            "FROM python:3.11-slim\nRUN [\"definitely-not-a-real-program-ib\"]\n",
        )
        .unwrap();
        let err = build(&fx, false).unwrap_err();
        match &err {
            BuildError::StepExecution { status, .. } => assert_eq!(*status, StepStatus::NotStarted),
            other => panic!("unexpected error: {other}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("could not start its command"), "{msg}");
        assert!(!msg.contains("signal"), "{msg}");
    }

    #[test]
    fn image_paths_resolve_against_workdir() {
        assert_eq!(resolve_image_path("/app", "sub/../x").unwrap(), "/app/x");
        assert_eq!(resolve_image_path("/app", "/srv").unwrap(), "/srv");
        assert_eq!(resolve_image_path("/", ".").unwrap(), "/");
        assert_eq!(copy_destination("/app", "."), "/app/");
        assert_eq!(copy_destination("/app", "lib/"), "/app/lib/");
        assert_eq!(copy_destination("/app", "main.py"), "/app/main.py");
        assert_eq!(copy_destination("/", "."), "/");
    }
}
