//! Offline detector training: load the processed match corpus from SQLite,
//! train the weakness classifier, and print the training metrics.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use rl_coach::config::CoachConfig;
use rl_coach::detector::WeaknessDetector;
use rl_coach::store::{MatchStore, SqliteStore};

const DEFAULT_DB: &str = "coach.db";
const CORPUS_LIMIT: usize = 10_000;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let db_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
    if !db_path.exists() {
        bail!("database {} does not exist", db_path.display());
    }

    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("open database {}", db_path.display()))?;
    let corpus = store.all_processed(CORPUS_LIMIT).context("load processed matches")?;
    log::info!("loaded {} processed matches from {}", corpus.len(), db_path.display());

    let config = CoachConfig::from_env();
    let mut detector = WeaknessDetector::new(&config);
    let summary = detector.train(&corpus).context("train weakness detector")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.meets_accuracy_threshold {
        log::warn!(
            "holdout accuracy below the {:.2} floor; detector will serve degraded",
            config.min_accuracy
        );
    }
    Ok(())
}
