use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::domain::{Entity, EntityId};
use crate::error::HarvestError;
use crate::portal::PortalClient;

pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Merge remotely fetched entities into the cache.
    pub load_cache: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { load_cache: true }
    }
}

/// Run-scoped store of every entity seen so far, keyed by `@id`.
///
/// Remote reads go through [`EntityCache::batch_get`], which fetches only the
/// misses of a batch on a bounded worker pool and joins on all of them before
/// touching the map. The map itself is only mutated from the calling thread.
pub struct EntityCache<P: PortalClient> {
    client: P,
    local: HashMap<EntityId, Entity>,
    pool: ThreadPool,
    remote_fetches: usize,
}

impl<P: PortalClient> EntityCache<P> {
    pub fn new(client: P, max_concurrent_fetches: usize) -> Result<Self, HarvestError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(max_concurrent_fetches.max(1))
            .thread_name(|index| format!("portal-fetch-{index}"))
            .build()
            .map_err(|err| HarvestError::WorkerPool(err.to_string()))?;
        Ok(Self {
            client,
            local: HashMap::new(),
            pool,
            remote_fetches: 0,
        })
    }

    pub fn client(&self) -> &P {
        &self.client
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.local.contains_key(id)
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.local.get(id)
    }

    pub fn require(&self, id: &EntityId) -> Result<&Entity, HarvestError> {
        self.local
            .get(id)
            .ok_or_else(|| HarvestError::NotCached(id.to_string()))
    }

    /// Number of `fetch_by_id` calls issued since creation.
    pub fn remote_fetches(&self) -> usize {
        self.remote_fetches
    }

    /// Stores `entity`, replacing whatever version was known before.
    pub fn insert(&mut self, entity: Entity) {
        self.local.insert(entity.id().clone(), entity);
    }

    pub fn extend<I: IntoIterator<Item = Entity>>(&mut self, entities: I) {
        for entity in entities {
            self.insert(entity);
        }
    }

    /// Seeds the cache from search queries. Any failed search aborts.
    pub fn preload(&mut self, queries: &[String]) -> Result<usize, HarvestError> {
        let mut inserted = 0;
        for query in queries {
            let results = self.client.search(query)?;
            info!(results = results.len(), query = query.as_str(), "preloaded search");
            inserted += results.len();
            self.extend(results);
        }
        Ok(inserted)
    }

    pub fn batch_get(
        &mut self,
        ids: &BTreeSet<EntityId>,
    ) -> Result<HashMap<EntityId, Entity>, HarvestError> {
        self.batch_get_with(ids, BatchOptions::default())
    }

    /// Resolves every id in `ids` to a fully-known entity.
    ///
    /// Misses are fetched concurrently and the whole batch succeeds or fails as
    /// one unit. A batch that resolves fewer entities than requested fails with
    /// [`HarvestError::MissingEntities`] and leaves the cache untouched.
    pub fn batch_get_with(
        &mut self,
        ids: &BTreeSet<EntityId>,
        options: BatchOptions,
    ) -> Result<HashMap<EntityId, Entity>, HarvestError> {
        let (cached, to_fetch): (Vec<&EntityId>, Vec<&EntityId>) =
            ids.iter().partition(|id| self.local.contains_key(*id));
        info!(
            cached = cached.len(),
            requested = ids.len(),
            "found cached ids"
        );

        let fetched = if to_fetch.is_empty() {
            Vec::new()
        } else {
            let client = &self.client;
            self.remote_fetches += to_fetch.len();
            self.pool.install(|| {
                to_fetch
                    .par_iter()
                    .map(|id| {
                        client
                            .fetch_by_id(id)
                            .map(|entity| ((*id).clone(), entity))
                    })
                    .collect::<Result<Vec<_>, HarvestError>>()
            })?
        };

        let mut results = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for (id, entity) in fetched {
            match entity {
                Some(entity) => {
                    results.insert(id, entity);
                }
                None => missing.push(id.to_string()),
            }
        }
        info!(remote = results.len(), "fetched remote entities");

        for id in cached {
            if let Some(entity) = self.local.get(id) {
                results.insert(id.clone(), entity.clone());
            }
        }

        if results.len() != ids.len() {
            missing.sort();
            return Err(HarvestError::MissingEntities {
                requested: ids.len(),
                resolved: results.len(),
                missing,
            });
        }

        if options.load_cache {
            debug!("updating cache");
            for (id, entity) in &results {
                self.local.insert(id.clone(), entity.clone());
            }
        }

        Ok(results)
    }
}
