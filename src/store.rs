use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::recommend::{TrainingPackRecord, TrainingSessionRecord};
use crate::{CoachError, MatchId, MatchRecord, MatchResult, PackId, Result, SkillTier, UserId};

/// Read access to the match corpus owned by the ingestion collaborator.
pub trait MatchStore: Send + Sync {
    /// Most recent matches for a user, newest first.
    fn matches_for_user(&self, user: &UserId, limit: usize) -> Result<Vec<MatchRecord>>;
    /// The user's matches with the given ids; missing ids are skipped.
    fn matches_by_ids(&self, user: &UserId, ids: &[MatchId]) -> Result<Vec<MatchRecord>>;
    /// Most recent processed matches for a user, newest first.
    fn processed_matches(&self, user: &UserId, limit: usize) -> Result<Vec<MatchRecord>>;
    /// The user's matches within a date range, newest first.
    fn matches_in_range(
        &self,
        user: &UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MatchRecord>>;
    /// Processed matches across all users, for detector training.
    fn all_processed(&self, limit: usize) -> Result<Vec<MatchRecord>>;
}

/// Read access to the training-pack catalog.
pub trait CatalogStore: Send + Sync {
    fn active_packs(&self) -> Result<Vec<TrainingPackRecord>>;
}

/// Read access to a user's practice-session history.
pub trait SessionStore: Send + Sync {
    fn sessions_for_user(&self, user: &UserId) -> Result<Vec<TrainingSessionRecord>>;
}

/// SQLite-backed implementation of the collaborator stores.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS matches (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                playlist TEXT NOT NULL,
                duration_seconds INTEGER NOT NULL,
                match_date TEXT NOT NULL,
                score_team_0 INTEGER NOT NULL,
                score_team_1 INTEGER NOT NULL,
                result TEXT NOT NULL,
                goals INTEGER NOT NULL,
                assists INTEGER NOT NULL,
                saves INTEGER NOT NULL,
                shots INTEGER NOT NULL,
                score INTEGER NOT NULL,
                boost_usage REAL,
                average_speed REAL,
                time_on_ground REAL,
                time_low_air REAL,
                time_high_air REAL,
                processed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_matches_user_date
                ON matches(user_id, match_date DESC);
            CREATE TABLE IF NOT EXISTS training_packs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                code TEXT NOT NULL,
                category TEXT NOT NULL,
                subcategory TEXT,
                difficulty INTEGER NOT NULL,
                skill_tier TEXT NOT NULL,
                rating REAL NOT NULL DEFAULT 0,
                rating_count INTEGER NOT NULL DEFAULT 0,
                usage_count INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',
                is_official INTEGER NOT NULL DEFAULT 0,
                is_featured INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS training_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                pack_id TEXT NOT NULL,
                category TEXT NOT NULL,
                started_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user
                ON training_sessions(user_id);",
        )?;
        Ok(())
    }

    pub fn insert_match(&self, m: &MatchRecord) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO matches (
                id, user_id, playlist, duration_seconds, match_date,
                score_team_0, score_team_1, result, goals, assists, saves,
                shots, score, boost_usage, average_speed, time_on_ground,
                time_low_air, time_high_air, processed
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                m.id.0,
                m.user_id.0,
                m.playlist,
                m.duration_seconds,
                m.match_date.to_rfc3339(),
                m.score_team_0,
                m.score_team_1,
                result_str(m.result),
                m.goals,
                m.assists,
                m.saves,
                m.shots,
                m.score,
                m.boost_usage,
                m.average_speed,
                m.time_on_ground,
                m.time_low_air,
                m.time_high_air,
                m.processed,
            ],
        )?;
        Ok(())
    }

    pub fn insert_pack(&self, p: &TrainingPackRecord) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO training_packs (
                id, name, code, category, subcategory, difficulty, skill_tier,
                rating, rating_count, usage_count, tags, is_official,
                is_featured, is_active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                p.id.0,
                p.name,
                p.code,
                p.category,
                p.subcategory,
                p.difficulty,
                p.skill_tier.as_str(),
                p.rating,
                p.rating_count,
                p.usage_count,
                serde_json::to_string(&p.tags)?,
                p.is_official,
                p.is_featured,
                p.is_active,
            ],
        )?;
        Ok(())
    }

    pub fn insert_session(&self, s: &TrainingSessionRecord) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT INTO training_sessions (user_id, pack_id, category, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![s.user_id.0, s.pack_id.0, s.category, s.started_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn query_matches(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<MatchRecord>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok(RawMatch {
                id: row.get(0)?,
                user_id: row.get(1)?,
                playlist: row.get(2)?,
                duration_seconds: row.get(3)?,
                match_date: row.get(4)?,
                score_team_0: row.get(5)?,
                score_team_1: row.get(6)?,
                result: row.get(7)?,
                goals: row.get(8)?,
                assists: row.get(9)?,
                saves: row.get(10)?,
                shots: row.get(11)?,
                score: row.get(12)?,
                boost_usage: row.get(13)?,
                average_speed: row.get(14)?,
                time_on_ground: row.get(15)?,
                time_low_air: row.get(16)?,
                time_high_air: row.get(17)?,
                processed: row.get(18)?,
            })
        })?;

        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_record()?);
        }
        Ok(out)
    }
}

const MATCH_COLUMNS: &str = "id, user_id, playlist, duration_seconds, match_date, \
     score_team_0, score_team_1, result, goals, assists, saves, shots, score, \
     boost_usage, average_speed, time_on_ground, time_low_air, time_high_air, processed";

struct RawMatch {
    id: String,
    user_id: String,
    playlist: String,
    duration_seconds: u32,
    match_date: String,
    score_team_0: i32,
    score_team_1: i32,
    result: String,
    goals: u32,
    assists: u32,
    saves: u32,
    shots: u32,
    score: u32,
    boost_usage: Option<f64>,
    average_speed: Option<f64>,
    time_on_ground: Option<f64>,
    time_low_air: Option<f64>,
    time_high_air: Option<f64>,
    processed: bool,
}

impl RawMatch {
    fn into_record(self) -> Result<MatchRecord> {
        let match_date = DateTime::parse_from_rfc3339(&self.match_date)
            .map_err(|err| CoachError::internal("parse match_date", err))?
            .with_timezone(&Utc);
        Ok(MatchRecord {
            id: MatchId(self.id),
            user_id: UserId(self.user_id),
            playlist: self.playlist,
            duration_seconds: self.duration_seconds,
            match_date,
            score_team_0: self.score_team_0,
            score_team_1: self.score_team_1,
            result: parse_result(&self.result)?,
            goals: self.goals,
            assists: self.assists,
            saves: self.saves,
            shots: self.shots,
            score: self.score,
            boost_usage: self.boost_usage,
            average_speed: self.average_speed,
            time_on_ground: self.time_on_ground,
            time_low_air: self.time_low_air,
            time_high_air: self.time_high_air,
            processed: self.processed,
        })
    }
}

fn result_str(result: MatchResult) -> &'static str {
    match result {
        MatchResult::Win => "win",
        MatchResult::Loss => "loss",
        MatchResult::Draw => "draw",
    }
}

fn parse_result(raw: &str) -> Result<MatchResult> {
    match raw {
        "win" => Ok(MatchResult::Win),
        "loss" => Ok(MatchResult::Loss),
        "draw" => Ok(MatchResult::Draw),
        other => Err(CoachError::internal("parse match result", other)),
    }
}

impl MatchStore for SqliteStore {
    fn matches_for_user(&self, user: &UserId, limit: usize) -> Result<Vec<MatchRecord>> {
        self.query_matches(
            &format!(
                "SELECT {MATCH_COLUMNS} FROM matches WHERE user_id = ?1 \
                 ORDER BY match_date DESC LIMIT ?2"
            ),
            &[&user.0, &(limit as i64)],
        )
    }

    fn matches_by_ids(&self, user: &UserId, ids: &[MatchId]) -> Result<Vec<MatchRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> =
            (0..ids.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE user_id = ?1 AND id IN ({}) \
             ORDER BY match_date DESC",
            placeholders.join(", ")
        );
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&user.0];
        for id in ids {
            args.push(&id.0);
        }
        self.query_matches(&sql, &args)
    }

    fn processed_matches(&self, user: &UserId, limit: usize) -> Result<Vec<MatchRecord>> {
        self.query_matches(
            &format!(
                "SELECT {MATCH_COLUMNS} FROM matches WHERE user_id = ?1 AND processed = 1 \
                 ORDER BY match_date DESC LIMIT ?2"
            ),
            &[&user.0, &(limit as i64)],
        )
    }

    fn matches_in_range(
        &self,
        user: &UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MatchRecord>> {
        self.query_matches(
            &format!(
                "SELECT {MATCH_COLUMNS} FROM matches WHERE user_id = ?1 \
                 AND match_date >= ?2 AND match_date <= ?3 ORDER BY match_date DESC"
            ),
            &[&user.0, &start.to_rfc3339(), &end.to_rfc3339()],
        )
    }

    fn all_processed(&self, limit: usize) -> Result<Vec<MatchRecord>> {
        self.query_matches(
            &format!(
                "SELECT {MATCH_COLUMNS} FROM matches WHERE processed = 1 \
                 ORDER BY match_date DESC LIMIT ?1"
            ),
            &[&(limit as i64)],
        )
    }
}

impl CatalogStore for SqliteStore {
    fn active_packs(&self) -> Result<Vec<TrainingPackRecord>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, code, category, subcategory, difficulty, skill_tier, \
                    rating, rating_count, usage_count, tags, is_official, is_featured, \
                    is_active \
             FROM training_packs WHERE is_active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, u8>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, u32>(8)?,
                row.get::<_, u32>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, bool>(11)?,
                row.get::<_, bool>(12)?,
                row.get::<_, bool>(13)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (
                id,
                name,
                code,
                category,
                subcategory,
                difficulty,
                tier,
                rating,
                rating_count,
                usage_count,
                tags,
                is_official,
                is_featured,
                is_active,
            ) = row?;
            out.push(TrainingPackRecord {
                id: PackId(id),
                name,
                code,
                category,
                subcategory,
                difficulty,
                skill_tier: SkillTier::parse(&tier).unwrap_or(SkillTier::Platinum),
                rating,
                rating_count,
                usage_count,
                tags: serde_json::from_str(&tags).unwrap_or_default(),
                is_official,
                is_featured,
                is_active,
            });
        }
        Ok(out)
    }
}

impl SessionStore for SqliteStore {
    fn sessions_for_user(&self, user: &UserId) -> Result<Vec<TrainingSessionRecord>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT user_id, pack_id, category, started_at FROM training_sessions \
             WHERE user_id = ?1 ORDER BY started_at",
        )?;
        let rows = stmt.query_map(params![user.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (user_id, pack_id, category, started_at) = row?;
            let started_at = DateTime::parse_from_rfc3339(&started_at)
                .map_err(|err| CoachError::internal("parse started_at", err))?
                .with_timezone(&Utc);
            out.push(TrainingSessionRecord {
                user_id: UserId(user_id),
                pack_id: PackId(pack_id),
                category,
                started_at,
            });
        }
        Ok(out)
    }
}
