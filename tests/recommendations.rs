use std::sync::Arc;

use chrono::{TimeZone, Utc};

use rl_coach::config::CoachConfig;
use rl_coach::kv::InMemoryKv;
use rl_coach::ratelimit::UserTier;
use rl_coach::recommend::{TrainingPackRecord, TrainingSessionRecord};
use rl_coach::registry::ModelRegistry;
use rl_coach::service::CoachService;
use rl_coach::store::SqliteStore;
use rl_coach::{MatchId, MatchRecord, MatchResult, PackId, SkillTier, UserId};

fn stub_match(id: &str, user: &str, hour: i64, goals: u32, shots: u32) -> MatchRecord {
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
        goals,
        assists: 1,
        saves: 3,
        shots,
        score: 420,
        boost_usage: Some(0.5),
        average_speed: Some(1000.0),
        time_on_ground: Some(0.6),
        time_low_air: Some(0.3),
        time_high_air: Some(20.0),
        processed: true,
    }
}

fn pack(id: &str, category: &str, tier: SkillTier, rating: f64) -> TrainingPackRecord {
    TrainingPackRecord {
        id: PackId(id.to_string()),
        name: format!("Pack {id}"),
        code: format!("CODE-{id}"),
        category: category.to_string(),
        subcategory: None,
        difficulty: 3,
        skill_tier: tier,
        rating,
        rating_count: 400,
        usage_count: 1500,
        tags: Vec::new(),
        is_official: false,
        is_featured: false,
        is_active: true,
    }
}

fn seeded_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    store.init_schema().unwrap();

    // Training population with varied weaknesses.
    for i in 0..10 {
        store.insert_match(&stub_match(&format!("s{i}"), "pop", i, 0, 10)).unwrap();
        store.insert_match(&stub_match(&format!("g{i}"), "pop", 100 + i, 2, 4)).unwrap();
        let mut boost = stub_match(&format!("b{i}"), "pop", 200 + i, 2, 4);
        boost.boost_usage = Some(0.95);
        store.insert_match(&boost).unwrap();
    }
    // Subject: poor shooting, average score 420 (gold tier ladder bracket).
    for i in 0..3 {
        store.insert_match(&stub_match(&format!("u{i}"), "subject", 500 + i, 0, 10)).unwrap();
    }

    let categories = ["shooting", "saves", "aerials", "positioning", "dribbling"];
    for (i, category) in categories.iter().enumerate() {
        for j in 0..3 {
            store
                .insert_pack(&pack(
                    &format!("{category}-{j}"),
                    category,
                    SkillTier::ALL[(i + j) % 7],
                    3.5 + 0.3 * j as f64,
                ))
                .unwrap();
        }
    }

    store
        .insert_session(&TrainingSessionRecord {
            user_id: UserId("subject".to_string()),
            pack_id: PackId("shooting-0".to_string()),
            category: "shooting".to_string(),
            started_at: Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0).unwrap(),
        })
        .unwrap();
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
fn identical_calls_return_byte_identical_recommendations() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    let first = service
        .recommend_training(&user, UserTier::Free, Some(SkillTier::Gold), None, 5)
        .unwrap();
    let second = service
        .recommend_training(&user, UserTier::Free, Some(SkillTier::Gold), None, 5)
        .unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(
        serde_json::to_vec(&first.recommendations).unwrap(),
        serde_json::to_vec(&second.recommendations).unwrap()
    );
    assert_eq!(first.recommendations.len(), 5);
}

#[test]
fn diversity_filter_spreads_categories() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    // Five distinct catalog categories and five requested slots.
    let result = service
        .recommend_training(&user, UserTier::Free, Some(SkillTier::Gold), None, 5)
        .unwrap();
    let mut categories: Vec<&str> =
        result.recommendations.iter().map(|r| r.category.as_str()).collect();
    categories.sort_unstable();
    categories.dedup();
    assert_eq!(categories.len(), result.recommendations.len());
}

#[test]
fn shooting_weakness_ranks_shooting_packs_first() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    let result = service
        .recommend_training(&user, UserTier::Free, Some(SkillTier::Gold), None, 5)
        .unwrap();
    let top = &result.recommendations[0];
    // The detector flags shooting; shooting and dribbling packs carry the
    // relevance weight.
    assert!(
        top.category == "shooting" || top.category == "dribbling",
        "top category {}",
        top.category
    );
    assert!(top.relevance > 0.0);
    assert!(!top.reasoning.is_empty());
}

#[test]
fn skill_tier_is_estimated_from_match_scores_when_absent() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    let result = service.recommend_training(&user, UserTier::Free, None, None, 3).unwrap();
    // Subject averages 420 points per match.
    assert_eq!(result.skill_tier, SkillTier::Gold);
}

#[test]
fn unknown_user_gets_neutral_defaults_not_an_error() {
    let service = service_over(seeded_store());
    let user = UserId("nobody".to_string());

    let result = service.recommend_training(&user, UserTier::Free, None, None, 3).unwrap();
    assert_eq!(result.skill_tier, SkillTier::Platinum);
    assert!(!result.recommendations.is_empty());
}

#[test]
fn category_filter_restricts_candidates() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    let filter = vec!["saves".to_string()];
    let result = service
        .recommend_training(&user, UserTier::Free, Some(SkillTier::Gold), Some(&filter), 5)
        .unwrap();
    assert!(!result.recommendations.is_empty());
    assert!(result.recommendations.iter().all(|r| r.category == "saves"));
    assert_eq!(result.total_packs_evaluated, 3);
}

#[test]
fn tier_and_filter_are_part_of_the_cache_key() {
    let service = service_over(seeded_store());
    let user = UserId("subject".to_string());

    let gold = service
        .recommend_training(&user, UserTier::Free, Some(SkillTier::Gold), None, 5)
        .unwrap();
    let diamond = service
        .recommend_training(&user, UserTier::Free, Some(SkillTier::Diamond), None, 5)
        .unwrap();
    // A different tier parameter must not reuse the gold cache entry.
    assert!(!gold.cache_hit);
    assert!(!diamond.cache_hit);
    assert_eq!(diamond.skill_tier, SkillTier::Diamond);
}
