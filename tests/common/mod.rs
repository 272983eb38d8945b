#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use portal_harvester::config::{
    Config, ConfigLoader, ProfileEntry, ProfileEntryObject, ResolvedConfig,
};
use portal_harvester::domain::{Entity, EntityId};
use portal_harvester::error::HarvestError;
use portal_harvester::portal::PortalClient;
use portal_harvester::transfer::{
    AwsCredentials, JobHandle, ManifestStore, TransferClient, TransferJobSpec, TransferState,
    TransferStatus,
};
use portal_harvester::workspace::WorkspaceClient;

pub const FILES_QUERY: &str = "/search/?type=File&file_set.data_use_limitation_summaries=GRU&status=released&frame=object&limit=all";
pub const F1: &str = "/sequence-files/IGVFFI0001AAAA/";
pub const F2: &str = "/alignment-files/IGVFFI0002BBBB/";
pub const FS1: &str = "/measurement-sets/IGVFDS0001AAAA/";
pub const FS2: &str = "/analysis-sets/IGVFDS0002BBBB/";
pub const S1: &str = "/in-vitro-systems/IGVFSM0001AAAA/";

pub fn id(value: &str) -> EntityId {
    EntityId::new(value)
}

/// Portal answering from a recorded snapshot: search results keyed by query
/// and objects keyed by `@id`.
#[derive(Default)]
pub struct SnapshotPortal {
    searches: HashMap<String, Vec<Value>>,
    objects: HashMap<String, Value>,
    /// Search answered with a 503 instead of its snapshot results.
    failing_search: Option<String>,
    pub fetched: Mutex<Vec<String>>,
    pub searched: Mutex<Vec<String>>,
}

impl SnapshotPortal {
    pub fn load() -> Self {
        let snapshot: Value =
            serde_json::from_str(include_str!("../fixtures/portal_snapshot.json")).unwrap();
        Self::from_snapshot(snapshot)
    }

    pub fn from_snapshot(snapshot: Value) -> Self {
        let searches = serde_json::from_value(snapshot["searches"].clone()).unwrap_or_default();
        let objects = serde_json::from_value(snapshot["objects"].clone()).unwrap_or_default();
        Self {
            searches,
            objects,
            ..Default::default()
        }
    }

    pub fn without_object(mut self, id: &str) -> Self {
        self.objects.remove(id);
        self
    }

    pub fn with_failing_search(mut self, query: &str) -> Self {
        self.failing_search = Some(query.to_string());
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }
}

impl PortalClient for SnapshotPortal {
    fn search(&self, query: &str) -> Result<Vec<Entity>, HarvestError> {
        self.searched.lock().unwrap().push(query.to_string());
        if self.failing_search.as_deref() == Some(query) {
            return Err(HarvestError::PortalStatus {
                status: 503,
                message: "Service Unavailable".to_string(),
            });
        }
        self.searches
            .get(query)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(Entity::from_value)
            .collect()
    }

    fn fetch_by_id(&self, id: &EntityId) -> Result<Option<Entity>, HarvestError> {
        self.fetched.lock().unwrap().push(id.to_string());
        self.objects
            .get(id.as_str())
            .cloned()
            .map(Entity::from_value)
            .transpose()
    }
}

#[derive(Default)]
pub struct MockTransfer {
    pub submitted: Mutex<Vec<String>>,
    pub polls: Mutex<usize>,
    /// Status every job finishes with; SUCCESS when unset.
    pub final_status: Option<&'static str>,
}

impl TransferClient for MockTransfer {
    fn submit(
        &self,
        spec: &TransferJobSpec,
        _credentials: &AwsCredentials,
    ) -> Result<JobHandle, HarvestError> {
        self.submitted.lock().unwrap().push(spec.source_bucket.clone());
        Ok(JobHandle {
            name: format!("transferJobs/{}", spec.name),
            project_id: spec.project_id.clone(),
        })
    }

    fn poll(&self, _handle: &JobHandle) -> Result<TransferStatus, HarvestError> {
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;
        // Every job reports one running poll before finishing.
        if *polls % 2 == 1 {
            return Ok(TransferStatus {
                done: false,
                state: TransferState::Running,
                status: "IN_PROGRESS".to_string(),
            });
        }
        let status = self.final_status.unwrap_or("SUCCESS");
        Ok(TransferStatus {
            done: true,
            state: TransferState::from_operation_status(status),
            status: status.to_string(),
        })
    }
}

#[derive(Default)]
pub struct MockManifestStore {
    pub uploads: Mutex<Vec<(String, String, String)>>,
}

impl ManifestStore for MockManifestStore {
    fn upload(&self, bucket: &str, object: &str, body: &str) -> Result<(), HarvestError> {
        self.uploads
            .lock()
            .unwrap()
            .push((bucket.to_string(), object.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockWorkspace {
    pub calls: Mutex<Vec<String>>,
}

impl WorkspaceClient for MockWorkspace {
    fn delete_table(&self, _namespace: &str, _name: &str, table: &str) -> Result<(), HarvestError> {
        self.calls.lock().unwrap().push(format!("delete {table}"));
        Ok(())
    }

    fn upload_table(&self, _namespace: &str, _name: &str, tsv: &str) -> Result<(), HarvestError> {
        let header = tsv.split('\t').next().unwrap_or_default();
        self.calls.lock().unwrap().push(format!("upload {header}"));
        Ok(())
    }
}

pub fn credentials() -> AwsCredentials {
    AwsCredentials {
        access_key_id: "AKIAEXAMPLE".to_string(),
        secret_access_key: "secret".to_string(),
    }
}

/// A fully populated GRU profile with no polling delay.
pub fn gru_config() -> ResolvedConfig {
    let config = Config {
        schema_version: Some(1),
        portal_api_url: None,
        portal_ui_url: None,
        project_id: Some("igvf-anvil".to_string()),
        manifest_bucket: Some("igvf-manifests".to_string()),
        max_concurrent_fetches: Some(4),
        poll_interval_seconds: Some(0),
        profiles: vec![ProfileEntry::Detailed(ProfileEntryObject {
            name: "GRU".to_string(),
            initial_files_query: None,
            job_name: None,
            destination_bucket: Some("fc-secure-gru".to_string()),
            workspace_namespace: None,
            workspace_name: Some("IGVF_GRU".to_string()),
            overwrite_tables: None,
            preload_searches: None,
        })],
    };
    ConfigLoader::resolve_config(config).unwrap()
}
