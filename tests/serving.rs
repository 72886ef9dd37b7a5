use std::sync::Arc;

use chrono::{TimeZone, Utc};

use rl_coach::CoachError;
use rl_coach::config::CoachConfig;
use rl_coach::kv::InMemoryKv;
use rl_coach::ratelimit::UserTier;
use rl_coach::registry::{ModelRegistry, ModelStatus};
use rl_coach::service::CoachService;
use rl_coach::store::SqliteStore;
use rl_coach::{MatchId, MatchRecord, MatchResult, SkillCategory, UserId};

fn stub_match(id: &str, user: &str, hour: i64) -> MatchRecord {
    MatchRecord {
        id: MatchId(id.to_string()),
        user_id: UserId(user.to_string()),
        playlist: "Ranked Doubles".to_string(),
        duration_seconds: 300,
        match_date: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
            + chrono::Duration::hours(hour),
        score_team_0: 3,
        score_team_1: 2,
        result: MatchResult::Win,
        goals: 2,
        assists: 1,
        saves: 3,
        shots: 4,
        score: 420,
        boost_usage: Some(0.5),
        average_speed: Some(1000.0),
        time_on_ground: Some(0.6),
        time_low_air: Some(0.3),
        time_high_air: Some(20.0),
        processed: true,
    }
}

fn shooting_weak(id: &str, user: &str, hour: i64) -> MatchRecord {
    let mut m = stub_match(id, user, hour);
    m.goals = 0;
    m.shots = 10;
    m
}

/// Seed a mixed training population plus a shooting-weak subject user.
fn seeded_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    store.init_schema().unwrap();

    for i in 0..10 {
        store.insert_match(&shooting_weak(&format!("s{i}"), "pop", i)).unwrap();

        let mut defending = stub_match(&format!("d{i}"), "pop", 100 + i);
        defending.saves = 0;
        store.insert_match(&defending).unwrap();

        let mut boost = stub_match(&format!("b{i}"), "pop", 200 + i);
        boost.boost_usage = Some(0.95);
        store.insert_match(&boost).unwrap();

        let mut mechanical = stub_match(&format!("k{i}"), "pop", 300 + i);
        mechanical.score = 120;
        store.insert_match(&mechanical).unwrap();

        store.insert_match(&stub_match(&format!("p{i}"), "pop", 400 + i)).unwrap();
    }

    // The subject: exactly three processed matches, all with shot accuracy
    // below 0.3.
    for i in 0..3 {
        store.insert_match(&shooting_weak(&format!("subject{i}"), "subject", 500 + i)).unwrap();
    }
    store
}

fn service_over(store: SqliteStore) -> CoachService {
    let mut config = CoachConfig::default();
    config.feature_window = 3;
    config.forest.n_trees = 30;

    let store = Arc::new(store);
    let registry = Arc::new(ModelRegistry::new(config.clone(), store.clone()));
    CoachService::new(
        config,
        registry,
        Arc::new(InMemoryKv::new()),
        store.clone(),
        store.clone(),
        store,
    )
}

#[test]
fn three_low_accuracy_matches_flag_shooting() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    let result = service.analyze_weaknesses(&user, UserTier::Free, None).unwrap();
    assert_eq!(result.primary_weakness, Some(SkillCategory::Shooting));
    assert!(result.confidence >= 0.7, "confidence {}", result.confidence);
    assert_eq!(result.matches_analyzed, 3);
    assert!(!result.cache_hit);
    assert!(result.summary.contains("shooting"));
}

#[test]
fn cache_miss_then_hit_returns_stored_result() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    let first = service.analyze_weaknesses(&user, UserTier::Free, None).unwrap();
    assert!(!first.cache_hit);

    let second = service.analyze_weaknesses(&user, UserTier::Free, None).unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.analysis_date, first.analysis_date);
    assert_eq!(second.primary_weakness, first.primary_weakness);
    assert_eq!(
        serde_json::to_string(&second.weakness).unwrap(),
        serde_json::to_string(&first.weakness).unwrap()
    );
}

#[test]
fn explicit_match_ids_produce_a_distinct_cache_entry() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    let recent = service.analyze_weaknesses(&user, UserTier::Free, None).unwrap();
    let ids: Vec<MatchId> = (0..3).map(|i| MatchId(format!("subject{i}"))).collect();
    let explicit = service.analyze_weaknesses(&user, UserTier::Free, Some(&ids)).unwrap();
    // Same underlying matches, but a different operation key: no cache hit.
    assert!(!explicit.cache_hit);
    assert_eq!(explicit.primary_weakness, recent.primary_weakness);
}

#[test]
fn too_little_history_is_user_actionable() {
    let store = seeded_store();
    store.insert_match(&stub_match("only", "sparse", 0)).unwrap();
    let service = service_over(store);

    let err = service
        .analyze_weaknesses(&UserId("sparse".to_string()), UserTier::Free, None)
        .unwrap_err();
    match err {
        CoachError::InsufficientData { required, available } => {
            assert_eq!(required, 3);
            assert_eq!(available, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_user_actionable());
}

#[test]
fn free_tier_analyze_denies_the_eleventh_request() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    for i in 0..10 {
        let result = service.analyze_weaknesses(&user, UserTier::Free, None);
        assert!(result.is_ok(), "request {} should pass", i + 1);
    }
    let err = service.analyze_weaknesses(&user, UserTier::Free, None).unwrap_err();
    match err {
        CoachError::RateLimited(info) => {
            assert_eq!(info.limit, 10);
            assert_eq!(info.remaining, 0);
            assert!(info.retry_after.unwrap() >= 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn status_reports_models_cache_and_limiter() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    // Load the detector so status has something to report.
    service.analyze_weaknesses(&user, UserTier::Free, None).unwrap();

    let status = service.get_status(&user, UserTier::Free).unwrap();
    assert!(!status.cache_hit);
    let detector = status
        .models
        .iter()
        .find(|m| m.model == rl_coach::registry::ModelKind::WeaknessDetector)
        .unwrap();
    assert_eq!(detector.status, ModelStatus::Loaded);
    assert!(status.cache_store_healthy);
    assert!(status.limiter_store_healthy);
    assert!(status.cache.writes >= 1);

    let cached = service.get_status(&user, UserTier::Free).unwrap();
    assert!(cached.cache_hit);
}
