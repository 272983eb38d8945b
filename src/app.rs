use std::fs;
use std::io::Write;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::Serialize;

use crate::cache::EntityCache;
use crate::config::{ProfileConfig, ResolvedConfig};
use crate::domain::EntityKind;
use crate::error::HarvestError;
use crate::fields::{FieldResolver, TableOptions};
use crate::manifest::{Manifest, build_manifest};
use crate::portal::PortalClient;
use crate::transfer::{
    AwsCredentials, JobHandle, ManifestStore, TransferClient, TransferJobSpec, job_name,
    wait_for_job,
};
use crate::walker::{GraphWalker, HarvestCounts, HarvestResult};
use crate::workspace::{SettleDelays, WorkspaceClient, upload_tables};

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub output_dir: Utf8PathBuf,
    pub skip_transfer: bool,
    pub skip_upload: bool,
    /// Forces table deletion before upload even if the profile does not ask for it.
    pub overwrite_tables: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectResult {
    pub profile: String,
    pub counts: HarvestCounts,
    pub harvest: HarvestResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub profile: String,
    pub counts: HarvestCounts,
    pub buckets: Vec<BucketSummary>,
    pub transfers: Vec<TransferSummary>,
    pub tables: Vec<TableSummary>,
    pub uploaded_tables: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSummary {
    pub bucket: String,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub job: String,
    pub source_bucket: String,
    pub manifest: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub table: String,
    pub rows: usize,
    pub path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// One harvest-transfer-export run for a single profile.
pub struct App<P, T, M, W>
where
    P: PortalClient,
    T: TransferClient,
    M: ManifestStore,
    W: WorkspaceClient,
{
    cache: EntityCache<P>,
    transfer: T,
    manifests: M,
    workspace: W,
    config: ResolvedConfig,
    profile: ProfileConfig,
    aws_credentials: Option<AwsCredentials>,
    settle_delays: SettleDelays,
}

impl<P, T, M, W> App<P, T, M, W>
where
    P: PortalClient,
    T: TransferClient,
    M: ManifestStore,
    W: WorkspaceClient,
{
    pub fn new(
        portal: P,
        transfer: T,
        manifests: M,
        workspace: W,
        config: ResolvedConfig,
        profile: &str,
    ) -> Result<Self, HarvestError> {
        let profile = config.profile(profile)?.clone();
        let cache = EntityCache::new(portal, config.max_concurrent_fetches)?;
        Ok(Self {
            cache,
            transfer,
            manifests,
            workspace,
            config,
            profile,
            aws_credentials: None,
            settle_delays: SettleDelays::default(),
        })
    }

    /// Source bucket credentials; read from the environment when not set.
    pub fn with_aws_credentials(mut self, credentials: AwsCredentials) -> Self {
        self.aws_credentials = Some(credentials);
        self
    }

    pub fn with_settle_delays(mut self, delays: SettleDelays) -> Self {
        self.settle_delays = delays;
        self
    }

    pub fn profile(&self) -> &ProfileConfig {
        &self.profile
    }

    pub fn cache(&self) -> &EntityCache<P> {
        &self.cache
    }

    pub fn transfer_client(&self) -> &T {
        &self.transfer
    }

    pub fn manifest_store(&self) -> &M {
        &self.manifests
    }

    pub fn workspace(&self) -> &W {
        &self.workspace
    }

    pub fn collect(&mut self, sink: &dyn ProgressSink) -> Result<HarvestResult, HarvestError> {
        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Preload; {} search(es) for {}",
                self.profile.preload_searches.len(),
                self.profile.name
            ),
            elapsed: None,
        });
        let preloaded = self.cache.preload(&self.profile.preload_searches)?;
        sink.event(ProgressEvent {
            message: format!("phase=Preload; {preloaded} entities cached"),
            elapsed: Some(start.elapsed()),
        });

        sink.event(ProgressEvent {
            message: "phase=Walk; following file graph".to_string(),
            elapsed: None,
        });
        let harvest = GraphWalker::new(&mut self.cache).collect(&self.profile.initial_files_query)?;
        let counts = harvest.counts();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Walk; files={} file_sets={} samples={} donors={} remote_fetches={}",
                counts.files,
                counts.file_sets,
                counts.samples,
                counts.donors,
                self.cache.remote_fetches()
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(harvest)
    }

    pub fn collect_summary(&mut self, sink: &dyn ProgressSink) -> Result<CollectResult, HarvestError> {
        let harvest = self.collect(sink)?;
        Ok(CollectResult {
            profile: self.profile.name.clone(),
            counts: harvest.counts(),
            harvest,
        })
    }

    pub fn export(
        &mut self,
        sink: &dyn ProgressSink,
        options: ExportOptions,
    ) -> Result<RunResult, HarvestError> {
        let harvest = self.collect(sink)?;
        let manifest = build_manifest(&harvest, &self.cache)?;
        let buckets = manifest
            .buckets()
            .map(|(bucket, paths)| BucketSummary {
                bucket: bucket.to_string(),
                files: paths.len(),
            })
            .collect();

        let transfers = if options.skip_transfer {
            sink.event(ProgressEvent {
                message: "phase=Transfer; skipped".to_string(),
                elapsed: None,
            });
            Vec::new()
        } else if manifest.is_empty() {
            sink.event(ProgressEvent {
                message: "phase=Transfer; no files to transfer".to_string(),
                elapsed: None,
            });
            Vec::new()
        } else {
            self.transfer_files(&manifest, options.dry_run, sink)?
        };

        sink.event(ProgressEvent {
            message: "phase=Tables; resolving fields".to_string(),
            elapsed: None,
        });
        let table_options = TableOptions {
            destination_bucket: self.profile.destination_bucket()?.to_string(),
            portal_ui_url: self.config.portal_ui_url.clone(),
        };
        let tables = FieldResolver::new(&mut self.cache).build_tables(&harvest, &table_options)?;

        let prefix = self.profile.table_prefix();
        let mut summaries = Vec::with_capacity(tables.len());
        for (kind, tsv) in &tables {
            let path = table_path(&options.output_dir, &prefix, *kind);
            if !options.dry_run {
                write_text_atomic(&path, tsv)?;
            }
            summaries.push(TableSummary {
                table: kind.table_name().to_string(),
                rows: harvest.ids(*kind).len(),
                path: (!options.dry_run).then(|| path.to_string()),
            });
        }

        let uploaded_tables = if options.skip_upload || options.dry_run {
            0
        } else {
            let namespace = self.profile.workspace_namespace.as_str();
            let workspace = self.profile.workspace_name()?;
            sink.event(ProgressEvent {
                message: format!("phase=Upload; {} tables to {namespace}/{workspace}", tables.len()),
                elapsed: None,
            });
            upload_tables(
                &self.workspace,
                namespace,
                workspace,
                tables.values(),
                options.overwrite_tables || self.profile.overwrite_tables,
                self.settle_delays,
            )?
        };

        Ok(RunResult {
            profile: self.profile.name.clone(),
            counts: harvest.counts(),
            buckets,
            transfers,
            tables: summaries,
            uploaded_tables,
            dry_run: options.dry_run,
        })
    }

    /// One transfer job per source bucket. Every job is submitted before any
    /// is waited on.
    fn transfer_files(
        &self,
        manifest: &Manifest,
        dry_run: bool,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<TransferSummary>, HarvestError> {
        let project_id = self
            .config
            .project_id
            .clone()
            .ok_or_else(|| HarvestError::IncompleteConfig("project_id".to_string()))?;
        let manifest_bucket = self
            .config
            .manifest_bucket
            .clone()
            .ok_or_else(|| HarvestError::IncompleteConfig("manifest_bucket".to_string()))?;
        let destination_bucket = self.profile.destination_bucket()?.to_string();
        let now = Local::now();

        let specs: Vec<TransferJobSpec> = manifest
            .buckets()
            .map(|(bucket, _)| TransferJobSpec {
                name: job_name(&self.profile.job_name, bucket, now),
                project_id: project_id.clone(),
                source_bucket: bucket.to_string(),
                destination_bucket: destination_bucket.clone(),
                manifest_bucket: manifest_bucket.clone(),
                created_at: now,
            })
            .collect();

        if dry_run {
            return Ok(specs
                .into_iter()
                .map(|spec| TransferSummary {
                    manifest: spec.manifest_location(),
                    job: spec.name,
                    source_bucket: spec.source_bucket,
                    status: "planned".to_string(),
                })
                .collect());
        }

        let credentials = match &self.aws_credentials {
            Some(credentials) => credentials.clone(),
            None => AwsCredentials::from_env()?,
        };

        let mut submitted: Vec<(TransferJobSpec, JobHandle)> = Vec::with_capacity(specs.len());
        for spec in specs {
            let tsv = manifest.to_tsv(&spec.source_bucket).unwrap_or_default();
            sink.event(ProgressEvent {
                message: format!("phase=Transfer; uploading {}", spec.manifest_location()),
                elapsed: None,
            });
            self.manifests
                .upload(&spec.manifest_bucket, &spec.manifest_object(), &tsv)?;
            let handle = self.transfer.submit(&spec, &credentials)?;
            sink.event(ProgressEvent {
                message: format!("phase=Transfer; submitted {}", handle.name),
                elapsed: None,
            });
            submitted.push((spec, handle));
        }

        let mut summaries = Vec::with_capacity(submitted.len());
        for (spec, handle) in submitted {
            let start = Instant::now();
            let status = wait_for_job(&self.transfer, &spec, &handle, self.config.poll_interval)?;
            sink.event(ProgressEvent {
                message: format!("phase=Transfer; {} finished with {}", spec.name, status.status),
                elapsed: Some(start.elapsed()),
            });
            summaries.push(TransferSummary {
                manifest: spec.manifest_location(),
                job: spec.name,
                source_bucket: spec.source_bucket,
                status: status.status,
            });
        }
        Ok(summaries)
    }
}

/// `<dir>/<prefix>_<table>.tsv`
pub fn table_path(output_dir: &Utf8Path, prefix: &str, kind: EntityKind) -> Utf8PathBuf {
    output_dir.join(format!("{prefix}_{}.tsv", kind.table_name()))
}

fn write_text_atomic(path: &Utf8Path, content: &str) -> Result<(), HarvestError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("portal-harvest-table")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.write_all(content.as_bytes())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}
