mod common;

use assert_matches::assert_matches;
use serde_json::json;

use portal_harvester::cache::EntityCache;
use portal_harvester::error::HarvestError;
use portal_harvester::walker::{GraphWalker, HarvestCounts, sample_search_query};

use common::{F1, F2, FILES_QUERY, FS1, FS2, S1, SnapshotPortal, id};

#[test]
fn walks_files_file_sets_and_samples() {
    let mut cache = EntityCache::new(SnapshotPortal::load(), 4).unwrap();
    let harvest = GraphWalker::new(&mut cache).collect(FILES_QUERY).unwrap();

    assert_eq!(harvest.files, vec![id(F2), id(F1)]);
    assert_eq!(harvest.file_sets, vec![id(FS2), id(FS1)]);
    assert_eq!(harvest.samples, vec![id(S1)]);
    assert!(harvest.donors.is_empty());
    assert_eq!(
        harvest.counts(),
        HarvestCounts {
            files: 2,
            file_sets: 2,
            samples: 1,
            donors: 0,
        }
    );
}

#[test]
fn rediscovered_file_set_is_fetched_once() {
    let portal = SnapshotPortal::load();
    let mut cache = EntityCache::new(portal, 4).unwrap();
    GraphWalker::new(&mut cache).collect(FILES_QUERY).unwrap();

    let fetched = cache.client().fetched.lock().unwrap().clone();
    assert_eq!(fetched.iter().filter(|id| id.as_str() == FS1).count(), 1);
    assert_eq!(fetched.iter().filter(|id| id.as_str() == FS2).count(), 1);
    let searched = cache.client().searched.lock().unwrap().clone();
    assert_eq!(searched, vec![FILES_QUERY.to_string(), sample_search_query(&id(FS2))]);
}

#[test]
fn harvest_is_deterministic() {
    let first = {
        let mut cache = EntityCache::new(SnapshotPortal::load(), 1).unwrap();
        GraphWalker::new(&mut cache).collect(FILES_QUERY).unwrap()
    };
    let second = {
        let mut cache = EntityCache::new(SnapshotPortal::load(), 8).unwrap();
        GraphWalker::new(&mut cache).collect(FILES_QUERY).unwrap()
    };
    assert_eq!(first, second);
}

#[test]
fn cyclic_input_file_sets_terminate() {
    let portal = SnapshotPortal::from_snapshot(json!({
        "searches": {
            "/search/?type=File": [
                {"@id": "/sequence-files/IGVFFI0100AAAA/", "@type": ["SequenceFile"], "file_set": "/analysis-sets/IGVFDS0100AAAA/"}
            ]
        },
        "objects": {
            "/analysis-sets/IGVFDS0100AAAA/": {
                "@id": "/analysis-sets/IGVFDS0100AAAA/",
                "input_file_sets": ["/analysis-sets/IGVFDS0200BBBB/"]
            },
            "/analysis-sets/IGVFDS0200BBBB/": {
                "@id": "/analysis-sets/IGVFDS0200BBBB/",
                "input_file_sets": ["/analysis-sets/IGVFDS0100AAAA/", "/analysis-sets/IGVFDS0200BBBB/"],
                "donors": ["/human-donors/IGVFDO0100AAAA/"]
            },
            "/human-donors/IGVFDO0100AAAA/": {
                "@id": "/human-donors/IGVFDO0100AAAA/",
                "@type": ["HumanDonor", "Donor", "Item"]
            }
        }
    }));
    let mut cache = EntityCache::new(portal, 2).unwrap();
    let harvest = GraphWalker::new(&mut cache).collect("/search/?type=File").unwrap();

    assert_eq!(
        harvest.file_sets,
        vec![id("/analysis-sets/IGVFDS0100AAAA/"), id("/analysis-sets/IGVFDS0200BBBB/")]
    );
    assert_eq!(harvest.donors, vec![id("/human-donors/IGVFDO0100AAAA/")]);
    assert_eq!(cache.client().fetch_count(), 3);
}

#[test]
fn missing_file_set_aborts_harvest() {
    let portal = SnapshotPortal::load().without_object(FS2);
    let mut cache = EntityCache::new(portal, 4).unwrap();
    let result = GraphWalker::new(&mut cache).collect(FILES_QUERY);
    assert_matches!(
        result,
        Err(HarvestError::MissingEntities { requested: 2, resolved: 1, ref missing }) if missing == &vec![FS2.to_string()]
    );
}

#[test]
fn failing_initial_search_aborts_before_traversal() {
    let portal = SnapshotPortal::load().with_failing_search(FILES_QUERY);
    let mut cache = EntityCache::new(portal, 4).unwrap();

    let result = GraphWalker::new(&mut cache).collect(FILES_QUERY);

    assert_matches!(result, Err(HarvestError::PortalStatus { status: 503, .. }));
    assert!(cache.is_empty());
    assert_eq!(cache.client().fetch_count(), 0);
    assert_eq!(*cache.client().searched.lock().unwrap(), vec![FILES_QUERY.to_string()]);
}
