use crate::{MatchRecord, SkillCategory};

/// Version tag recorded alongside any model trained on these labels.
pub const LABEL_VERSION: u32 = 1;

/// Bootstrap weakness label for a single match.
///
/// This is a noisy-label heuristic, not ground truth: four unrelated
/// thresholds checked in fixed priority order, chosen to seed the classifier
/// before feedback-derived labels exist. Swap it out by bumping
/// [`LABEL_VERSION`] and retraining; nothing in the classifier depends on how
/// labels were produced.
pub fn bootstrap_label_v1(m: &MatchRecord) -> SkillCategory {
    let shot_accuracy = m.goals as f64 / (m.shots.max(1)) as f64;
    let save_rate = m.saves as f64 / m.rate_minutes();
    let score_efficiency = m.score as f64 / m.rate_minutes();

    if shot_accuracy < 0.3 {
        SkillCategory::Shooting
    } else if save_rate < 0.5 {
        SkillCategory::Defending
    } else if m.boost_usage.is_some_and(|b| b > 0.8) {
        SkillCategory::BoostManagement
    } else if score_efficiency < 50.0 {
        SkillCategory::Mechanical
    } else {
        SkillCategory::Positioning
    }
}

/// Class indices for a batch, aligned with [`SkillCategory::ALL`].
pub fn label_batch_v1(matches: &[MatchRecord]) -> Vec<usize> {
    matches.iter().map(|m| bootstrap_label_v1(m).index()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MatchResult, UserId};
    use chrono::Utc;

    fn base() -> MatchRecord {
        MatchRecord {
            id: "m1".into(),
            user_id: UserId("u1".to_string()),
            playlist: "Ranked Doubles".to_string(),
            duration_seconds: 300,
            match_date: Utc::now(),
            score_team_0: 3,
            score_team_1: 2,
            result: MatchResult::Win,
            goals: 2,
            assists: 1,
            saves: 3,
            shots: 4,
            score: 400,
            boost_usage: Some(0.5),
            average_speed: None,
            time_on_ground: None,
            time_low_air: None,
            time_high_air: None,
            processed: true,
        }
    }

    #[test]
    fn poor_shot_accuracy_wins_priority() {
        let mut m = base();
        m.goals = 0;
        m.shots = 10;
        m.saves = 0; // also a defending trigger, but shooting is checked first
        assert_eq!(bootstrap_label_v1(&m), SkillCategory::Shooting);
    }

    #[test]
    fn low_save_rate_labels_defending() {
        let mut m = base();
        m.saves = 1; // 0.2 saves per minute over 5 minutes
        assert_eq!(bootstrap_label_v1(&m), SkillCategory::Defending);
    }

    #[test]
    fn heavy_boost_usage_labels_boost_management() {
        let mut m = base();
        m.boost_usage = Some(0.9);
        assert_eq!(bootstrap_label_v1(&m), SkillCategory::BoostManagement);
    }

    #[test]
    fn low_score_efficiency_labels_mechanical() {
        let mut m = base();
        m.score = 100; // 20 per minute
        assert_eq!(bootstrap_label_v1(&m), SkillCategory::Mechanical);
    }

    #[test]
    fn default_label_is_positioning() {
        assert_eq!(bootstrap_label_v1(&base()), SkillCategory::Positioning);
    }

    #[test]
    fn missing_boost_skips_the_boost_rule() {
        let mut m = base();
        m.boost_usage = None;
        assert_eq!(bootstrap_label_v1(&m), SkillCategory::Positioning);
    }

    #[test]
    fn zero_shots_does_not_divide_by_zero() {
        let mut m = base();
        m.shots = 0;
        m.goals = 0;
        assert_eq!(bootstrap_label_v1(&m), SkillCategory::Shooting);
    }
}
