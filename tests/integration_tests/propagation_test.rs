//! Score propagation through candidates, sources and tags

use chrono::Duration;

use linksite::config::WeightKey;
use linksite::director::{trust_from_average, TickAction};
use linksite::models::{NewCandidate, Vote};
use linksite::storage::SharedStore;

use super::fixtures::{director, set_weight, sqlite_store, t0};

fn source_trust(store: &SharedStore, id: i64) -> f64 {
    store.get_source(id).unwrap().unwrap().trust_score
}

#[test]
fn test_source_without_candidates_keeps_neutral_trust() {
    let (store, _dir) = sqlite_store();
    let empty = store.insert_source("quiet feed", "rss").unwrap();
    store.update_source_scores(empty, 1.37, 0.8).unwrap();

    let report = director(store.clone(), 1).propagate_now().unwrap();
    assert_eq!(report.sources, 1);

    let source = store.get_source(empty).unwrap().unwrap();
    assert_eq!(source.trust_score, 1.0);
    assert_eq!(source.avg_link_score, 0.0);
}

#[test]
fn test_votes_flow_into_sources_and_tags() {
    let (store, _dir) = sqlite_store();
    set_weight(&store, WeightKey::VoteToTag, 0.5);

    let blog = store.insert_source("blog", "rss").unwrap();
    let channel = store.insert_source("channel", "youtube").unwrap();
    let tag = store.insert_tag("systems").unwrap();
    store.link_tag_source(tag, blog).unwrap();
    store.link_tag_source(tag, channel).unwrap();

    let a = store
        .insert_candidate(&NewCandidate::new("a", "https://a.example/").from_source(blog))
        .unwrap();
    let b = store
        .insert_candidate(&NewCandidate::new("b", "https://b.example/").from_source(blog))
        .unwrap();
    let c = store
        .insert_candidate(&NewCandidate::new("c", "https://c.example/").from_source(channel))
        .unwrap();

    let at = t0();
    for user in ["u1", "u2", "u3"] {
        store.record_vote(&Vote::up(user, a, at)).unwrap();
    }
    store.record_vote(&Vote::down("u1", b, at)).unwrap();
    store.record_vote(&Vote::down("u2", c, at)).unwrap();

    let report = director(store.clone(), 1).propagate_now().unwrap();
    assert_eq!(report.candidates, 3);
    assert_eq!(report.tags, 1);

    assert_eq!(store.get_candidate(a).unwrap().unwrap().direct_score, 3.0);
    assert_eq!(store.get_candidate(b).unwrap().unwrap().direct_score, -1.0);
    assert_eq!(store.get_candidate(c).unwrap().unwrap().direct_score, -1.0);

    // blog averages 1.0, channel -1.0
    assert!((source_trust(&store, blog) - trust_from_average(1.0)).abs() < 1e-9);
    assert!((source_trust(&store, channel) - trust_from_average(-1.0)).abs() < 1e-9);
    assert!(source_trust(&store, blog) > 1.0);
    assert!(source_trust(&store, channel) < 1.0);

    let tag_score = store
        .list_tags()
        .unwrap()
        .into_iter()
        .find(|t| t.id == tag)
        .unwrap()
        .score;
    // (3 - 1 - 1) * 0.5
    assert!((tag_score - 0.5).abs() < 1e-9);
}

#[test]
fn test_second_run_rewrites_no_candidates() {
    let (store, _dir) = sqlite_store();
    let id = store
        .insert_candidate(&NewCandidate::new("a", "https://a.example/"))
        .unwrap();
    store.record_vote(&Vote::up("u1", id, t0())).unwrap();

    let director = director(store.clone(), 1);
    assert_eq!(director.propagate_now().unwrap().candidates, 1);
    assert_eq!(director.propagate_now().unwrap().candidates, 0);
}

#[test]
fn test_tenth_rotation_propagates() {
    let (store, _dir) = sqlite_store();
    let id = store
        .insert_candidate(&NewCandidate::new("a", "https://a.example/"))
        .unwrap();
    store
        .record_vote(&Vote::up("u1", id, t0() - Duration::hours(1)))
        .unwrap();

    let mut director = director(store.clone(), 1);
    for i in 0..9 {
        match director.rotate_at(t0() + Duration::seconds(i)).unwrap() {
            TickAction::Rotated(summary) => assert!(!summary.propagated),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(store.get_candidate(id).unwrap().unwrap().direct_score, 0.0);

    match director.rotate_at(t0() + Duration::seconds(9)).unwrap() {
        TickAction::Rotated(summary) => assert!(summary.propagated),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(store.get_candidate(id).unwrap().unwrap().direct_score, 1.0);
}
