use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::EntityCache;
use crate::domain::{EntityId, EntityKind};
use crate::error::HarvestError;
use crate::portal::PortalClient;

/// Identifiers reached from the initial file query, sorted per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarvestResult {
    pub files: Vec<EntityId>,
    pub file_sets: Vec<EntityId>,
    pub samples: Vec<EntityId>,
    pub donors: Vec<EntityId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HarvestCounts {
    pub files: usize,
    pub file_sets: usize,
    pub samples: usize,
    pub donors: usize,
}

impl HarvestResult {
    pub fn ids(&self, kind: EntityKind) -> &[EntityId] {
        match kind {
            EntityKind::File => &self.files,
            EntityKind::FileSet => &self.file_sets,
            EntityKind::Sample => &self.samples,
            EntityKind::Donor => &self.donors,
        }
    }

    pub fn counts(&self) -> HarvestCounts {
        HarvestCounts {
            files: self.files.len(),
            file_sets: self.file_sets.len(),
            samples: self.samples.len(),
            donors: self.donors.len(),
        }
    }
}

#[derive(Debug, Default)]
struct SeenSets {
    files: BTreeSet<EntityId>,
    file_sets: BTreeSet<EntityId>,
    samples: BTreeSet<EntityId>,
    donors: BTreeSet<EntityId>,
}

impl SeenSets {
    fn into_result(self) -> HarvestResult {
        HarvestResult {
            files: self.files.into_iter().collect(),
            file_sets: self.file_sets.into_iter().collect(),
            samples: self.samples.into_iter().collect(),
            donors: self.donors.into_iter().collect(),
        }
    }
}

pub fn sample_search_query(file_set: &EntityId) -> String {
    format!("/search/?type=Sample&file_sets.@id={file_set}&frame=object&limit=all")
}

/// Work-set traversal from an initial file query through file sets to their
/// files, nested input file sets, samples and donors.
///
/// A file set id is expanded at most once: it is marked seen before its
/// children are discovered, and `input_file_sets` are only enqueued when not
/// yet seen, so cyclic references terminate.
pub struct GraphWalker<'a, P: PortalClient> {
    cache: &'a mut EntityCache<P>,
    seen: SeenSets,
    frontier: BTreeSet<EntityId>,
}

impl<'a, P: PortalClient> GraphWalker<'a, P> {
    pub fn new(cache: &'a mut EntityCache<P>) -> Self {
        Self {
            cache,
            seen: SeenSets::default(),
            frontier: BTreeSet::new(),
        }
    }

    pub fn collect(mut self, initial_query: &str) -> Result<HarvestResult, HarvestError> {
        let files = self.cache.client().search(initial_query)?;
        for file in &files {
            self.frontier.extend(file.references("file_set"));
            self.seen.files.insert(file.id().clone());
        }
        info!(
            files = files.len(),
            file_sets = self.frontier.len(),
            "found initial files"
        );
        self.cache.extend(files);

        info!("loading file sets into cache");
        let initial = self.frontier.clone();
        self.cache.batch_get(&initial)?;

        while let Some(file_set) = self.frontier.pop_first() {
            if self.seen.file_sets.contains(&file_set) {
                continue;
            }
            self.seen.file_sets.insert(file_set.clone());
            self.expand(&file_set)?;
        }

        let result = self.seen.into_result();
        let counts = result.counts();
        info!(
            files = counts.files,
            file_sets = counts.file_sets,
            samples = counts.samples,
            donors = counts.donors,
            "harvest complete"
        );
        Ok(result)
    }

    fn expand(&mut self, file_set: &EntityId) -> Result<(), HarvestError> {
        let single = BTreeSet::from([file_set.clone()]);
        let mut fetched = self.cache.batch_get(&single)?;
        let full = fetched
            .remove(file_set)
            .ok_or_else(|| HarvestError::NotCached(file_set.to_string()))?;
        debug!(file_set = %file_set, "expanding file set");

        if full.has("input_file_sets") {
            for input in full.references("input_file_sets") {
                if !self.seen.file_sets.contains(&input) {
                    self.frontier.insert(input);
                }
            }
        }

        if full.has("files") {
            let files: BTreeSet<EntityId> = full.references("files").into_iter().collect();
            debug!(count = files.len(), "getting files");
            self.cache.batch_get(&files)?;
            self.seen.files.extend(files);
        }

        if full.has("samples") {
            let samples = self.cache.client().search(&sample_search_query(file_set))?;
            debug!(count = samples.len(), "getting samples");
            for sample in samples {
                self.seen.samples.insert(sample.id().clone());
                self.cache.insert(sample);
            }
        }

        if full.has("donors") {
            let donors: BTreeSet<EntityId> = full.references("donors").into_iter().collect();
            debug!(count = donors.len(), "getting donors");
            self.cache.batch_get(&donors)?;
            self.seen.donors.extend(donors);
        }

        Ok(())
    }
}
