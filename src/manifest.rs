use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::cache::EntityCache;
use crate::domain::{EntityId, StorageUri};
use crate::error::HarvestError;
use crate::portal::PortalClient;
use crate::walker::HarvestResult;

/// Object paths to transfer, grouped by source bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    buckets: BTreeMap<String, Vec<String>>,
}

impl Manifest {
    pub fn from_uris<I: IntoIterator<Item = StorageUri>>(uris: I) -> Self {
        let mut grouped: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for uri in uris {
            grouped.entry(uri.bucket).or_default().insert(uri.path);
        }
        Self {
            buckets: grouped
                .into_iter()
                .map(|(bucket, paths)| (bucket, paths.into_iter().collect()))
                .collect(),
        }
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.buckets
            .iter()
            .map(|(bucket, paths)| (bucket.as_str(), paths.as_slice()))
    }

    pub fn paths(&self, bucket: &str) -> Option<&[String]> {
        self.buckets.get(bucket).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Transfer manifest body for one bucket: one path per line, no header.
    pub fn to_tsv(&self, bucket: &str) -> Option<String> {
        self.buckets.get(bucket).map(|paths| paths.join("\n"))
    }
}

pub fn file_storage_uri<P: PortalClient>(
    cache: &EntityCache<P>,
    file: &EntityId,
) -> Result<StorageUri, HarvestError> {
    let entity = cache.require(file)?;
    let raw = entity
        .get_str("s3_uri")
        .ok_or_else(|| HarvestError::MissingStorageUri(file.to_string()))?;
    raw.parse()
}

/// Groups the storage location of every harvested file by bucket.
pub fn build_manifest<P: PortalClient>(
    harvest: &HarvestResult,
    cache: &EntityCache<P>,
) -> Result<Manifest, HarvestError> {
    let uris = harvest
        .files
        .iter()
        .map(|file| file_storage_uri(cache, file))
        .collect::<Result<Vec<_>, HarvestError>>()?;
    let manifest = Manifest::from_uris(uris);
    for (bucket, paths) in manifest.buckets() {
        tracing::info!(bucket, files = paths.len(), "manifest bucket");
    }
    Ok(manifest)
}

/// Location of a transferred object in the destination bucket.
pub fn destination_path(destination_bucket: &str, uri: &StorageUri) -> String {
    format!("gs://{destination_bucket}/{}", uri.path)
}
