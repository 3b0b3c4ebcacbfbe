//! Rotation lifecycle tests
//!
//! Each test drives the director with explicit timestamps so timer math is
//! exact. Most run against SQLite to exercise the production backend.

use chrono::Duration;
use std::collections::HashSet;

use linksite::config::WeightKey;
use linksite::director::{RotationTrigger, TickAction};
use linksite::models::{NewCandidate, Nomination, SelectionReason, Vote};
use linksite::storage::create_memory_store;

use super::fixtures::{add_candidate, add_candidates, director, set_weight, sqlite_store, t0};

fn fresh_only(store: &linksite::storage::SharedStore) {
    set_weight(store, WeightKey::PoolFresh, 1.0);
    set_weight(store, WeightKey::PoolRerun, 0.0);
    set_weight(store, WeightKey::PoolWildcard, 0.0);
}

// ============================================================================
// Selection
// ============================================================================

#[test]
fn test_fresh_only_weights_always_pick_the_single_zero_score_candidate() {
    let (store, _dir) = sqlite_store();
    fresh_only(&store);
    let id = add_candidate(&store, "solo");

    for seed in 0..5 {
        let mut director = director(store.clone(), seed);
        for i in 0..4 {
            let action = director.rotate_at(t0() + Duration::seconds(i)).unwrap();
            match action {
                TickAction::Rotated(summary) => {
                    assert_eq!(summary.candidate_id, id);
                    assert_eq!(summary.reason, SelectionReason::Fresh);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    let state = store.load_rotation().unwrap();
    assert_eq!(state.selection_reason, Some(SelectionReason::Fresh));
}

#[test]
fn test_fatigue_spreads_consecutive_rotations() {
    let (store, _dir) = sqlite_store();
    fresh_only(&store);
    let ids: HashSet<i64> = add_candidates(&store, 3).into_iter().collect();
    let mut director = director(store.clone(), 7);

    let mut shown = HashSet::new();
    for i in 0..3 {
        let action = director.rotate_at(t0() + Duration::seconds(i)).unwrap();
        if let TickAction::Rotated(summary) = action {
            shown.insert(summary.candidate_id);
        }
    }
    assert_eq!(shown, ids);
}

#[test]
fn test_rerun_pool_prefers_scored_candidates() {
    let store = create_memory_store();
    set_weight(&store, WeightKey::PoolFresh, 0.0);
    set_weight(&store, WeightKey::PoolRerun, 1.0);
    set_weight(&store, WeightKey::PoolWildcard, 0.0);
    add_candidate(&store, "unscored");
    let scored = store
        .insert_candidate(&NewCandidate::new("scored", "https://scored.example/").with_score(4.0))
        .unwrap();

    let mut director = director(store.clone(), 3);
    match director.rotate_at(t0()).unwrap() {
        TickAction::Rotated(summary) => {
            assert_eq!(summary.candidate_id, scored);
            assert_eq!(summary.reason, SelectionReason::Rerun);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_empty_rerun_pool_falls_back_to_fresh() {
    let store = create_memory_store();
    set_weight(&store, WeightKey::PoolFresh, 0.0);
    set_weight(&store, WeightKey::PoolRerun, 1.0);
    set_weight(&store, WeightKey::PoolWildcard, 0.0);
    add_candidates(&store, 2);

    let mut director = director(store.clone(), 3);
    match director.rotate_at(t0()).unwrap() {
        TickAction::Rotated(summary) => assert_eq!(summary.reason, SelectionReason::Fresh),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_decision_log_records_every_rotation() {
    let (store, _dir) = sqlite_store();
    add_candidates(&store, 4);
    let mut director = director(store.clone(), 11);

    director.tick_at(t0());
    director.tick_at(t0() + Duration::seconds(120));

    let decisions = store.recent_decisions(10).unwrap();
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions[0].selected_at, t0() + Duration::seconds(120));
    assert_eq!(decisions[0].duration_seconds, 120);
    assert_eq!(
        Some(decisions[0].candidate_id),
        store.load_rotation().unwrap().current_candidate_id
    );
}

// ============================================================================
// Satellites and nominations
// ============================================================================

#[test]
fn test_satellites_are_revealed_progressively() {
    let (store, _dir) = sqlite_store();
    add_candidates(&store, 12);
    let mut director = director(store.clone(), 5);
    director.tick_at(t0());

    let state = store.load_rotation().unwrap();
    let current = state.current_candidate_id.unwrap();
    assert_eq!(state.satellites.len(), 5);
    for (i, satellite) in state.satellites.iter().enumerate() {
        assert_ne!(satellite.candidate_id, current);
        assert!(!satellite.revealed);
        assert_eq!(
            satellite.reveal_at,
            t0() + Duration::seconds(20 * (i as i64 + 1))
        );
    }
    assert_eq!(state.reveal_ends_at, Some(t0() + Duration::seconds(100)));
}

#[test]
fn test_only_satellite_nominations_count() {
    let (store, _dir) = sqlite_store();
    add_candidates(&store, 10);
    let mut director = director(store.clone(), 9);
    director.tick_at(t0());

    let state = store.load_rotation().unwrap();
    let epoch = state.epoch().unwrap();
    let x = state.satellites[0].candidate_id;
    let y = (1..=10)
        .find(|id| Some(*id) != state.current_candidate_id && !state.is_satellite(*id))
        .unwrap();

    let nominate = |candidate_id| {
        store
            .add_nomination(&Nomination {
                rotation_id: epoch.clone(),
                candidate_id,
            })
            .unwrap();
    };
    for _ in 0..2 {
        nominate(x);
    }
    for _ in 0..5 {
        nominate(y);
    }

    let outcome = director.tick_at(t0() + Duration::seconds(120));
    let summary = outcome.rotated().unwrap();
    assert_eq!(summary.candidate_id, x);
    assert_eq!(summary.reason, SelectionReason::Nominated);
    assert!(store.nominations_for(&epoch).unwrap().is_empty());
}

#[test]
fn test_nominations_from_other_epochs_are_ignored() {
    let store = create_memory_store();
    add_candidates(&store, 10);
    let mut director = director(store.clone(), 9);
    director.tick_at(t0());

    let state = store.load_rotation().unwrap();
    store
        .add_nomination(&Nomination {
            rotation_id: "2001-01-01T00:00:00.000000Z".into(),
            candidate_id: state.satellites[0].candidate_id,
        })
        .unwrap();

    let outcome = director.tick_at(t0() + Duration::seconds(120));
    assert_ne!(outcome.rotated().unwrap().reason, SelectionReason::Nominated);
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_single_user_downvote_veto_rotates_immediately() {
    let (store, _dir) = sqlite_store();
    add_candidates(&store, 3);
    let mut director = director(store.clone(), 1);
    director.tick_at(t0());
    let current = store.load_rotation().unwrap().current_candidate_id.unwrap();

    for s in [2, 4, 6] {
        store
            .record_vote(&Vote::down("troll", current, t0() + Duration::seconds(s)))
            .unwrap();
    }

    let outcome = director.tick_at(t0() + Duration::seconds(10));
    let summary = outcome.rotated().unwrap();
    assert_eq!(summary.trigger, RotationTrigger::DownvoteVeto);
    assert_eq!(
        store.load_rotation().unwrap().started_at,
        Some(t0() + Duration::seconds(10))
    );
}

#[test]
fn test_spread_downvotes_shorten_without_veto() {
    let store = create_memory_store();
    add_candidates(&store, 3);
    let mut director = director(store.clone(), 1);
    director.tick_at(t0());
    let current = store.load_rotation().unwrap().current_candidate_id.unwrap();

    for user in ["a", "b", "c"] {
        store
            .record_vote(&Vote::down(user, current, t0() + Duration::seconds(3)))
            .unwrap();
    }

    match director.tick_at(t0() + Duration::seconds(10)).result.unwrap() {
        TickAction::TimerAdjusted { rotation_ends_at } => {
            assert_eq!(rotation_ends_at, t0() + Duration::seconds(60));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_constant_votes_converge_to_a_stable_end() {
    let (store, _dir) = sqlite_store();
    add_candidates(&store, 2);
    let mut director = director(store.clone(), 2);
    director.tick_at(t0());
    let current = store.load_rotation().unwrap().current_candidate_id.unwrap();

    store.record_vote(&Vote::up("u1", current, t0() + Duration::seconds(1))).unwrap();
    store.record_vote(&Vote::up("u2", current, t0() + Duration::seconds(1))).unwrap();
    store.record_vote(&Vote::down("u3", current, t0() + Duration::seconds(1))).unwrap();

    let first = director.tick_at(t0() + Duration::seconds(2));
    assert!(matches!(first.result, Ok(TickAction::TimerAdjusted { .. })));

    let expected = t0() + Duration::seconds(120 + 30 - 20);
    for s in (4..60).step_by(2) {
        let outcome = director.tick_at(t0() + Duration::seconds(s));
        assert!(matches!(outcome.result, Ok(TickAction::Steady)), "tick at +{s}s");
        assert_eq!(store.load_rotation().unwrap().rotation_ends_at, Some(expected));
    }
}

#[test]
fn test_votes_before_rotation_start_do_not_count() {
    let store = create_memory_store();
    let id = add_candidate(&store, "only");
    store.record_vote(&Vote::up("early", id, t0() - Duration::seconds(30))).unwrap();

    let mut director = director(store.clone(), 4);
    director.tick_at(t0());
    let outcome = director.tick_at(t0() + Duration::seconds(5));
    assert!(matches!(outcome.result, Ok(TickAction::Steady)));
}

#[test]
fn test_heavy_penalty_is_clamped_to_start_and_then_expires() {
    let store = create_memory_store();
    add_candidates(&store, 2);
    let mut director = director(store.clone(), 6);
    director.tick_at(t0());
    let current = store.load_rotation().unwrap().current_candidate_id.unwrap();

    for i in 0..10 {
        store
            .record_vote(&Vote::down(format!("user{i}"), current, t0() + Duration::seconds(1)))
            .unwrap();
    }

    match director.tick_at(t0() + Duration::seconds(4)).result.unwrap() {
        TickAction::TimerAdjusted { rotation_ends_at } => assert_eq!(rotation_ends_at, t0()),
        other => panic!("unexpected {other:?}"),
    }

    let outcome = director.tick_at(t0() + Duration::seconds(6));
    assert_eq!(outcome.rotated().unwrap().trigger, RotationTrigger::Expired);
}

// ============================================================================
// State invariants
// ============================================================================

#[test]
fn test_out_of_range_weight_fails_the_tick_without_panicking() {
    let (store, _dir) = sqlite_store();
    add_candidates(&store, 3);
    set_weight(&store, WeightKey::RotationDefaultSec, 1e13);
    let mut director = director(store.clone(), 1);

    let outcome = director.tick_at(t0());
    let err = outcome.result.unwrap_err();
    assert!(err.to_string().contains("rotation_default_sec"), "{err}");
    assert_eq!(store.load_rotation().unwrap().current_candidate_id, None);

    // A sane value lets the next tick rotate
    set_weight(&store, WeightKey::RotationDefaultSec, 120.0);
    assert!(matches!(
        director.tick_at(t0()).result.unwrap(),
        TickAction::Rotated(_)
    ));
}

#[test]
fn test_rotation_state_stays_a_single_row() {
    let (store, _dir) = sqlite_store();
    add_candidates(&store, 6);
    let mut director = director(store.clone(), 13);

    for round in 0..15 {
        let now = t0() + Duration::seconds(round * 130);
        director.tick_at(now);
        director.tick_at(now + Duration::seconds(2));
        assert_eq!(store.rotation_row_count().unwrap(), 1);
    }
    assert_eq!(director.rotation_count(), 15);
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("reopen.db");

    let first = linksite::storage::create_sqlite_store(&path).unwrap();
    add_candidates(&first, 3);
    let mut d = director(first.clone(), 8);
    d.tick_at(t0());
    let before = first.load_rotation().unwrap();
    drop(d);
    drop(first);

    let reopened = linksite::storage::create_sqlite_store(&path).unwrap();
    assert_eq!(reopened.load_rotation().unwrap(), before);

    // A fresh director continues mid-rotation instead of rotating again
    let mut d = director(reopened, 8);
    let outcome = d.tick_at(t0() + Duration::seconds(30));
    assert!(matches!(outcome.result, Ok(TickAction::Steady)));
}
