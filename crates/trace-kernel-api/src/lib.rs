use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use trace_kernel_core::{
    enforce_link_consistency, ChangeLog, CheckpointStore, ConsistencyOptions, DocumentTraces,
    ExternalDependency, ItemKind, RawTraceConfig, RecordAggregator, RecordView, RefreshSummary,
    SourceBatch, TraceAnalyzer, TraceConfig, TraceMatrix, CHECKPOINT_FORMAT_VERSION,
};
use ulid::Ulid;

mod source;

pub use source::{
    IngestionSource, JsonFileSource, SourceFactory, SourceRegistry, StaticSource, WithdrawnRecord,
};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildOptions {
    /// Registered ingestion sources to use, merged in this order.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub ignored_link_targets: BTreeSet<String>,
    #[serde(default)]
    pub parallel_refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildReport {
    pub build_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub snapshot_digest: String,
    pub live_records: usize,
    pub eliminated_records: usize,
    pub change_log: ChangeLog,
    pub matrices: Vec<TraceMatrix>,
    #[serde(default)]
    pub external_dependencies: Vec<ExternalDependency>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointBuildReport {
    pub build_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub checkpoint_created_at: OffsetDateTime,
    pub snapshot_digest: String,
    pub refresh: RefreshSummary,
    pub change_log: ChangeLog,
    pub matrices: Vec<TraceMatrix>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointManifest {
    pub format_version: u32,
    pub exported_at: String,
    pub file: String,
    pub sha256: String,
    pub records: usize,
}

/// Read a trace configuration file. `.json` files are parsed as JSON, anything else as YAML.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed, or fails validation.
pub fn load_trace_config(path: &Path) -> Result<TraceConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read trace configuration {}", path.display()))?;
    let raw: RawTraceConfig = if path.extension().and_then(OsStr::to_str) == Some("json") {
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse trace configuration {}", path.display()))?
    } else {
        serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse trace configuration {}", path.display()))?
    };
    TraceConfig::from_raw(&raw)
        .with_context(|| format!("invalid trace configuration {}", path.display()))
}

/// Stable digest over every record identity, link and external dependency in `view`.
pub fn compute_snapshot_digest<V: RecordView + ?Sized>(view: &V) -> String {
    let mut entries = Vec::new();
    for kind in ItemKind::ALL {
        for item in view.get_all(kind) {
            entries.push(format!("live:{kind}:{}", item.id()));
            for link in &item.links {
                entries.push(format!(
                    "link:{kind}:{}:{}:{}",
                    item.id(),
                    link.target_id,
                    link.link_type
                ));
            }
        }
        for item in view.get_all_eliminated(kind) {
            entries.push(format!("eliminated:{kind}:{}:{}", item.id(), item.elimination_kind()));
        }
    }
    for dependency in view.external_dependencies() {
        entries.push(format!(
            "dependency:{}:{}:{}",
            dependency.name, dependency.version, dependency.conflict
        ));
    }
    entries.sort_unstable();

    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    let digest_hex = format!("{:x}", hasher.finalize());
    format!("snap_{}", &digest_hex[..16])
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Write `store` as `checkpoint.json` plus a digest manifest.
///
/// # Errors
/// Returns an error when the directory or files cannot be written.
pub fn write_checkpoint(store: &CheckpointStore, out_dir: &Path) -> Result<CheckpointManifest> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create checkpoint directory {}", out_dir.display()))?;

    let json = store.to_json()?;
    let checkpoint_path = out_dir.join(CHECKPOINT_FILE);
    fs::write(&checkpoint_path, json.as_bytes())
        .with_context(|| format!("failed to write checkpoint {}", checkpoint_path.display()))?;

    let manifest = CheckpointManifest {
        format_version: store.document().format_version,
        exported_at: now_rfc3339()?,
        file: CHECKPOINT_FILE.to_string(),
        sha256: sha256_hex(json.as_bytes()),
        records: store.live_count() + store.eliminated_count(),
    };

    let manifest_path = out_dir.join(MANIFEST_FILE);
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).context("failed to serialize checkpoint manifest")?;
    fs::write(&manifest_path, manifest_json).with_context(|| {
        format!("failed to write checkpoint manifest {}", manifest_path.display())
    })?;

    Ok(manifest)
}

/// Read a checkpoint directory written by [`write_checkpoint`], verifying its manifest.
///
/// # Errors
/// Returns an error when the manifest is missing or unsupported, when the digest or record
/// count does not match, or when the checkpoint itself is invalid.
pub fn import_checkpoint(in_dir: &Path) -> Result<CheckpointStore> {
    let manifest_path = in_dir.join(MANIFEST_FILE);
    let manifest_bytes = fs::read(&manifest_path)
        .with_context(|| format!("failed to read manifest file {}", manifest_path.display()))?;
    let manifest: CheckpointManifest = serde_json::from_slice(&manifest_bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", manifest_path.display()))?;

    if manifest.format_version == 0 || manifest.format_version > CHECKPOINT_FORMAT_VERSION {
        return Err(anyhow!(
            "unsupported checkpoint format version {}; supported range is \
             1..={CHECKPOINT_FORMAT_VERSION}",
            manifest.format_version
        ));
    }
    if Path::new(&manifest.file).file_name() != Some(OsStr::new(&manifest.file)) {
        return Err(anyhow!(
            "manifest references a file outside the checkpoint directory: {}",
            manifest.file
        ));
    }

    let checkpoint_path = in_dir.join(&manifest.file);
    let bytes = fs::read(&checkpoint_path)
        .with_context(|| format!("failed to read checkpoint {}", checkpoint_path.display()))?;
    let actual_sha256 = sha256_hex(&bytes);
    if actual_sha256 != manifest.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for {}: expected {}, got {}",
            manifest.file,
            manifest.sha256,
            actual_sha256
        ));
    }

    let text = std::str::from_utf8(&bytes)
        .with_context(|| format!("checkpoint {} is not valid UTF-8", checkpoint_path.display()))?;
    let store = CheckpointStore::load(text)
        .with_context(|| format!("invalid checkpoint {}", checkpoint_path.display()))?;
    let actual_records = store.live_count() + store.eliminated_count();
    if actual_records != manifest.records {
        return Err(anyhow!(
            "manifest record count mismatch for {}: expected {}, got {}",
            manifest.file,
            manifest.records,
            actual_records
        ));
    }

    Ok(store)
}

fn log_issues(matrices: &[TraceMatrix]) {
    for issue in matrices.iter().flat_map(|matrix| matrix.issues()) {
        tracing::debug!(
            "trace {} -> {}: {} `{}`",
            issue.source,
            issue.target,
            issue.issue_type,
            issue.record_id
        );
    }
}

/// Runs builds: refresh sources, merge, enforce link consistency, analyze traces.
pub struct TraceKernelApi {
    config: TraceConfig,
    options: BuildOptions,
    sources: Vec<Box<dyn IngestionSource>>,
    last_build: Option<RecordAggregator>,
}

impl TraceKernelApi {
    /// Instantiate the configured ingestion sources.
    ///
    /// # Errors
    /// Returns an error when a configured source is not registered or fails to start.
    pub fn new(
        config: TraceConfig,
        options: BuildOptions,
        registry: &SourceRegistry,
    ) -> Result<Self> {
        let sources = registry.instantiate(&options.sources)?;
        Ok(Self { config, options, sources, last_build: None })
    }

    #[must_use]
    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Records of the most recent successful build.
    #[must_use]
    pub fn records(&self) -> Option<&RecordAggregator> {
        self.last_build.as_ref()
    }

    fn collect_batches(&mut self) -> Result<Vec<(String, SourceBatch)>> {
        fn refresh_one(source: &mut dyn IngestionSource) -> Result<(String, SourceBatch)> {
            let name = source.name().to_string();
            let batch = source
                .refresh()
                .with_context(|| format!("ingestion source `{name}` failed to refresh"))?;
            Ok((name, batch))
        }

        if !self.options.parallel_refresh {
            return self.sources.iter_mut().map(|source| refresh_one(&mut **source)).collect();
        }

        std::thread::scope(|scope| {
            let handles = self
                .sources
                .iter_mut()
                .map(|source| scope.spawn(move || refresh_one(&mut **source)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("ingestion source refresh thread panicked")),
                })
                .collect()
        })
    }

    /// Refresh and merge every source, then enforce link consistency and tell sources
    /// about records the cascade removed.
    fn settle(&mut self) -> Result<(RecordAggregator, ChangeLog)> {
        let batches = self.collect_batches()?;
        let mut aggregator = RecordAggregator::new();
        for (name, batch) in batches {
            tracing::debug!(
                "merging {} record(s) and {} external dependency(ies) from `{}`",
                batch.record_count(),
                batch.dependencies.len(),
                name
            );
            aggregator
                .merge_source(&name, batch)
                .with_context(|| format!("failed to merge records from `{name}`"))?;
        }

        let options =
            ConsistencyOptions { ignored_targets: self.options.ignored_link_targets.clone() };
        let change_log = enforce_link_consistency(&mut aggregator, &options)
            .context("link consistency enforcement failed")?;
        self.notify_withdrawals(&aggregator, &change_log);
        for dependency in aggregator.external_dependencies().iter().filter(|dep| dep.conflict) {
            tracing::warn!(
                "external dependency `{}` {} was requested with conflicting versions",
                dependency.name,
                dependency.version
            );
        }

        Ok((aggregator, change_log))
    }

    fn notify_withdrawals(&mut self, aggregator: &RecordAggregator, change_log: &ChangeLog) {
        for elimination in &change_log.eliminations {
            let Some(origin) = aggregator.origin_of(elimination.kind, &elimination.item_id) else {
                continue;
            };
            let Some(source) = self.sources.iter_mut().find(|source| source.name() == origin)
            else {
                continue;
            };
            let record = WithdrawnRecord {
                kind: elimination.kind,
                id: elimination.item_id.clone(),
                reason: elimination.reason.clone(),
                elimination_kind: elimination.elimination_kind,
            };
            if let Err(err) = source.withdraw(record) {
                tracing::warn!(
                    "source `{}` rejected withdrawal of {} `{}`: {:#}",
                    origin,
                    elimination.kind,
                    elimination.item_id,
                    err
                );
            }
        }
    }

    /// Run one complete build against live data.
    ///
    /// # Errors
    /// Returns an error when any source, merge, consistency or analysis step fails. No
    /// partial report is produced.
    pub fn run_build(&mut self, documents: &DocumentTraces) -> Result<BuildReport> {
        let generated_at = OffsetDateTime::now_utc();
        tracing::info!(
            "starting trace build with {} ingestion source(s) and {} document trace tag(s)",
            self.sources.len(),
            documents.tag_count()
        );

        let (aggregator, change_log) = self.settle()?;
        let matrices = TraceAnalyzer::new(&self.config, &aggregator, documents)
            .analyze_all()
            .context("trace analysis failed")?;

        let report = BuildReport {
            build_id: Ulid::new(),
            generated_at,
            snapshot_digest: compute_snapshot_digest(&aggregator),
            live_records: aggregator.live_count(),
            eliminated_records: aggregator.eliminated_count(),
            change_log,
            matrices,
            external_dependencies: aggregator.external_dependencies().to_vec(),
        };
        log_issues(&report.matrices);
        tracing::info!(
            "trace build {} finished: {} live, {} eliminated, {} issue(s)",
            report.build_id,
            report.live_records,
            report.eliminated_records,
            report.matrices.iter().map(|matrix| matrix.issues().count()).sum::<usize>()
        );

        self.last_build = Some(aggregator);
        Ok(report)
    }

    /// Run a build against a frozen checkpoint, refreshing only the listed IDs from live data.
    ///
    /// # Errors
    /// Returns an error when the checkpoint cannot be imported or the live build fails.
    pub fn run_checkpoint_build(
        &mut self,
        checkpoint_dir: &Path,
        refresh: &BTreeMap<ItemKind, Vec<String>>,
        documents: &DocumentTraces,
    ) -> Result<CheckpointBuildReport> {
        let generated_at = OffsetDateTime::now_utc();
        let mut store = import_checkpoint(checkpoint_dir)?;
        tracing::info!(
            "starting checkpoint build from {} ({} record(s) frozen)",
            checkpoint_dir.display(),
            store.live_count()
        );

        let (aggregator, change_log) = self.settle()?;
        let refresh_summary = store.apply_selective_refresh(refresh, &aggregator);
        let matrices = TraceAnalyzer::new(&self.config, &store, documents)
            .analyze_all()
            .context("trace analysis failed")?;

        let report = CheckpointBuildReport {
            build_id: Ulid::new(),
            generated_at,
            checkpoint_created_at: store.created_at(),
            snapshot_digest: compute_snapshot_digest(&store),
            refresh: refresh_summary,
            change_log,
            matrices,
        };
        log_issues(&report.matrices);
        self.last_build = Some(aggregator);
        Ok(report)
    }

    /// Freeze the most recent build as a checkpoint directory.
    ///
    /// # Errors
    /// Returns an error when no build has completed or the files cannot be written.
    pub fn export_checkpoint(&self, out_dir: &Path) -> Result<CheckpointManifest> {
        let Some(aggregator) = &self.last_build else {
            return Err(anyhow!("no completed build to checkpoint; run a build first"));
        };
        let store = CheckpointStore::capture(aggregator, OffsetDateTime::now_utc());
        write_checkpoint(&store, out_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use trace_kernel_core::{Item, LinkType, LinkedItem};

    fn unique_temp_dir(prefix: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()))
    }

    fn fixture_aggregator(extra_link: bool) -> RecordAggregator {
        let stamp = OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000);
        let mut requirement =
            LinkedItem::new(Item::new("SWR-1", ItemKind::SoftwareRequirement, stamp));
        if extra_link {
            requirement = requirement.with_link("TC-1", LinkType::TestedBy);
        }
        let mut batch = SourceBatch::new();
        batch.push_live(requirement);
        batch.push_live(LinkedItem::new(Item::new("TC-1", ItemKind::SoftwareSystemTest, stamp)));
        let mut aggregator = RecordAggregator::new();
        if let Err(err) = aggregator.merge_source("fixture", batch) {
            panic!("fixture merge failed: {err}");
        }
        aggregator
    }

    // Test IDs: TAPI-001
    #[test]
    fn snapshot_digest_is_stable_and_tracks_links() {
        let plain = compute_snapshot_digest(&fixture_aggregator(false));
        assert_eq!(plain, compute_snapshot_digest(&fixture_aggregator(false)));
        assert!(plain.starts_with("snap_"));
        assert_eq!(plain.len(), "snap_".len() + 16);
        assert_ne!(plain, compute_snapshot_digest(&fixture_aggregator(true)));
    }

    // Test IDs: TAPI-005
    #[test]
    fn snapshot_digest_tracks_external_dependencies() {
        let plain = compute_snapshot_digest(&fixture_aggregator(false));
        let mut with_dependency = fixture_aggregator(false);
        let mut batch = SourceBatch::new();
        batch.push_dependency(ExternalDependency::new("libpng", "1.6.43"));
        if let Err(err) = with_dependency.merge_source("sbom", batch) {
            panic!("dependency merge failed: {err}");
        }

        let digest = compute_snapshot_digest(&with_dependency);
        assert_ne!(plain, digest);
        let frozen = CheckpointStore::capture(&with_dependency, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(compute_snapshot_digest(&frozen), digest);
    }

    // Test IDs: TAPI-002
    #[test]
    fn checkpoint_files_round_trip_through_manifest() -> Result<()> {
        let store =
            CheckpointStore::capture(&fixture_aggregator(true), OffsetDateTime::UNIX_EPOCH);
        let dir = unique_temp_dir("tracekernel-checkpoint");

        let manifest = write_checkpoint(&store, &dir)?;
        assert_eq!(manifest.records, 2);
        assert_eq!(manifest.file, CHECKPOINT_FILE);

        let imported = import_checkpoint(&dir)?;
        assert_eq!(imported, store);

        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to cleanup temp checkpoint dir {}", dir.display()))?;
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn import_rejects_tampered_checkpoint() -> Result<()> {
        let store =
            CheckpointStore::capture(&fixture_aggregator(false), OffsetDateTime::UNIX_EPOCH);
        let dir = unique_temp_dir("tracekernel-checkpoint");
        write_checkpoint(&store, &dir)?;

        let checkpoint_path = dir.join(CHECKPOINT_FILE);
        let original = fs::read_to_string(&checkpoint_path)?;
        fs::write(&checkpoint_path, original.replace("TC-1", "TC-2"))?;

        let Err(err) = import_checkpoint(&dir) else {
            return Err(anyhow!("expected import failure for tampered checkpoint"));
        };
        assert!(err.to_string().contains("manifest digest mismatch for checkpoint.json"));

        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to cleanup temp checkpoint dir {}", dir.display()))?;
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn import_rejects_manifest_paths_outside_the_directory() -> Result<()> {
        let store =
            CheckpointStore::capture(&fixture_aggregator(false), OffsetDateTime::UNIX_EPOCH);
        let dir = unique_temp_dir("tracekernel-checkpoint");
        let mut manifest = write_checkpoint(&store, &dir)?;
        manifest.file = "../checkpoint.json".to_string();
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;

        let Err(err) = import_checkpoint(&dir) else {
            return Err(anyhow!("expected import failure for escaping manifest path"));
        };
        assert!(err.to_string().contains("outside the checkpoint directory"));

        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to cleanup temp checkpoint dir {}", dir.display()))?;
        Ok(())
    }
}
