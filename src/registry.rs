use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CoachConfig;
use crate::detector::WeaknessDetector;
use crate::recommend::RecommendationEngine;
use crate::skills::SkillAnalyzer;
use crate::store::MatchStore;
use crate::{CoachError, Result};

/// How many processed matches feed detector training on first load.
const TRAINING_CORPUS_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    WeaknessDetector,
    SkillAnalyzer,
    RecommendationEngine,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::WeaknessDetector,
        ModelKind::SkillAnalyzer,
        ModelKind::RecommendationEngine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::WeaknessDetector => "weakness_detector",
            ModelKind::SkillAnalyzer => "skill_analyzer",
            ModelKind::RecommendationEngine => "recommendation_engine",
        }
    }
}

/// A loaded model instance.
#[derive(Debug)]
pub enum Model {
    Detector(WeaknessDetector),
    Analyzer(SkillAnalyzer),
    Recommender(RecommendationEngine),
}

impl Model {
    pub fn detector(&self) -> Option<&WeaknessDetector> {
        match self {
            Model::Detector(d) => Some(d),
            _ => None,
        }
    }

    pub fn analyzer(&self) -> Option<&SkillAnalyzer> {
        match self {
            Model::Analyzer(a) => Some(a),
            _ => None,
        }
    }

    pub fn recommender(&self) -> Option<&RecommendationEngine> {
        match self {
            Model::Recommender(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Loaded,
    NotLoaded,
    Error(String),
}

/// Per-model health entry for the status operation. Construction success is
/// the health signal; no inference is run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHealth {
    pub model: ModelKind,
    pub status: ModelStatus,
    pub loaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone)]
struct ModelMeta {
    loaded_at: DateTime<Utc>,
    status: ModelStatus,
}

/// Lazily-constructed, memoized model handles.
///
/// A plain struct handed to the service by the embedder — no process-global
/// state. The memo map sits behind a `RwLock` so inference reads never
/// contend; construction serializes on a separate mutex with a re-check
/// after acquisition (double-checked locking). A failed construction is
/// recorded but never memoized, so the next `get` retries.
pub struct ModelRegistry {
    config: CoachConfig,
    matches: Arc<dyn MatchStore>,
    models: RwLock<HashMap<ModelKind, Arc<Model>>>,
    build_lock: Mutex<()>,
    meta: Mutex<HashMap<ModelKind, ModelMeta>>,
}

impl ModelRegistry {
    pub fn new(config: CoachConfig, matches: Arc<dyn MatchStore>) -> Self {
        Self {
            config,
            matches,
            models: RwLock::new(HashMap::new()),
            build_lock: Mutex::new(()),
            meta: Mutex::new(HashMap::new()),
        }
    }

    /// Memoized handle for `kind`, constructing on first access.
    pub fn get(&self, kind: ModelKind) -> Result<Arc<Model>> {
        if let Some(model) = self.models.read().expect("registry lock poisoned").get(&kind) {
            return Ok(model.clone());
        }

        let _guard = self.build_lock.lock().expect("registry build lock poisoned");
        // Another request may have built it while we waited.
        if let Some(model) = self.models.read().expect("registry lock poisoned").get(&kind) {
            return Ok(model.clone());
        }

        let model = Arc::new(self.build(kind)?);
        self.models
            .write()
            .expect("registry lock poisoned")
            .insert(kind, model.clone());
        Ok(model)
    }

    /// Construct a model, recording load metadata either way. Holding only
    /// the build lock here keeps inference on already-loaded models running.
    fn build(&self, kind: ModelKind) -> Result<Model> {
        let result = match kind {
            ModelKind::WeaknessDetector => self.build_detector(),
            ModelKind::SkillAnalyzer => Ok(Model::Analyzer(SkillAnalyzer::new(&self.config))),
            ModelKind::RecommendationEngine => {
                Ok(Model::Recommender(RecommendationEngine::new()))
            }
        };

        let mut meta = self.meta.lock().expect("registry meta lock poisoned");
        match &result {
            Ok(_) => {
                log::info!("model {} loaded", kind.as_str());
                meta.insert(
                    kind,
                    ModelMeta { loaded_at: Utc::now(), status: ModelStatus::Loaded },
                );
            }
            Err(err) => {
                log::error!("model {} failed to load: {err}", kind.as_str());
                meta.insert(
                    kind,
                    ModelMeta {
                        loaded_at: Utc::now(),
                        status: ModelStatus::Error(err.to_string()),
                    },
                );
            }
        }
        result.map_err(|err| CoachError::ModelLoad {
            model: kind.as_str().to_string(),
            message: err.to_string(),
        })
    }

    fn build_detector(&self) -> Result<Model> {
        let corpus = self.matches.all_processed(TRAINING_CORPUS_LIMIT)?;
        let mut detector = WeaknessDetector::new(&self.config);
        detector.train(&corpus)?;
        Ok(Model::Detector(detector))
    }

    pub fn weakness_detector(&self) -> Result<Arc<Model>> {
        self.get(ModelKind::WeaknessDetector)
    }

    pub fn skill_analyzer(&self) -> Result<Arc<Model>> {
        self.get(ModelKind::SkillAnalyzer)
    }

    pub fn recommendation_engine(&self) -> Result<Arc<Model>> {
        self.get(ModelKind::RecommendationEngine)
    }

    /// Drop and rebuild one model (after a retraining event).
    pub fn reload(&self, kind: ModelKind) -> Result<Arc<Model>> {
        let _guard = self.build_lock.lock().expect("registry build lock poisoned");
        self.models.write().expect("registry lock poisoned").remove(&kind);
        self.meta.lock().expect("registry meta lock poisoned").remove(&kind);

        let model = Arc::new(self.build(kind)?);
        self.models
            .write()
            .expect("registry lock poisoned")
            .insert(kind, model.clone());
        log::info!("model {} reloaded", kind.as_str());
        Ok(model)
    }

    /// Rebuild every previously-loaded model; failures are logged and left
    /// unloaded for the next `get` to retry.
    pub fn reload_all(&self) {
        let loaded: Vec<ModelKind> = {
            let _guard = self.build_lock.lock().expect("registry build lock poisoned");
            let mut models = self.models.write().expect("registry lock poisoned");
            let kinds = models.keys().copied().collect();
            models.clear();
            self.meta.lock().expect("registry meta lock poisoned").clear();
            kinds
        };
        for kind in loaded {
            if let Err(err) = self.reload(kind) {
                log::error!("bulk reload of {} failed: {err}", kind.as_str());
            }
        }
    }

    /// Per-model status without invoking inference.
    pub fn health_check(&self) -> Vec<ModelHealth> {
        let models = self.models.read().expect("registry lock poisoned");
        let meta = self.meta.lock().expect("registry meta lock poisoned");
        ModelKind::ALL
            .iter()
            .map(|&kind| {
                let recorded = meta.get(&kind);
                let status = if models.contains_key(&kind) {
                    ModelStatus::Loaded
                } else {
                    match recorded.map(|m| &m.status) {
                        Some(ModelStatus::Error(msg)) => ModelStatus::Error(msg.clone()),
                        _ => ModelStatus::NotLoaded,
                    }
                };
                ModelHealth {
                    model: kind,
                    status,
                    loaded_at: recorded.map(|m| m.loaded_at),
                }
            })
            .collect()
    }

    pub fn system_status(healths: &[ModelHealth]) -> SystemStatus {
        let errors =
            healths.iter().filter(|h| matches!(h.status, ModelStatus::Error(_))).count();
        if errors == 0 {
            SystemStatus::Healthy
        } else if errors == healths.len() {
            SystemStatus::Critical
        } else {
            SystemStatus::Degraded
        }
    }
}
