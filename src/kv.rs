use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Errors surfaced by the external key-value store.
///
/// Callers in this crate treat every variant the same way their failure
/// policy dictates; the split exists for log quality.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of an atomic trim-and-count over a sliding-window set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowProbe {
    /// Entries remaining after the trim.
    pub count: u64,
    /// Oldest surviving timestamp, unix milliseconds.
    pub oldest: Option<i64>,
}

/// Minimal client surface of the external low-latency key-value store.
///
/// Single-key operations plus the pipelined sorted-set calls the rate
/// limiter needs. Each method is atomic on the store side; callers never
/// add their own locking around it. Implementations are expected to bound
/// every call with a short timeout so a slow store degrades one request,
/// not the process.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Atomically drop window entries older than `cutoff_ms` and report what
    /// remains.
    fn window_count(&self, key: &str, cutoff_ms: i64) -> Result<WindowProbe, KvError>;
    /// Atomically append a timestamp to the window and refresh the key TTL.
    fn window_append(&self, key: &str, timestamp_ms: i64, ttl_secs: u64) -> Result<(), KvError>;

    /// Round-trip health probe.
    fn ping(&self) -> Result<(), KvError> {
        let key = "health:ping";
        self.set_ex(key, "ok", 10)?;
        match self.get(key)? {
            Some(v) if v == "ok" => Ok(()),
            other => Err(KvError::Unavailable(format!("ping read back {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    /// Sorted ascending.
    Window(Vec<i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store backend with lazy expiry. The default backend for tests
/// and single-node deployments; a networked store slots in behind the same
/// trait.
#[derive(Debug, Default)]
pub struct InMemoryKv {
    inner: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, for stats and tests.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.lock().expect("kv lock poisoned");
        map.retain(|_, e| !e.expired(now));
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for InMemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        let mut map = self.inner.lock().expect("kv lock poisoned");
        if matches!(map.get(key), Some(entry) if entry.expired(now)) {
            map.remove(key);
            return Ok(None);
        }
        match map.get(key) {
            Some(Entry { value: Value::Text(text), .. }) => Ok(Some(text.clone())),
            _ => Ok(None),
        }
    }

    fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut map = self.inner.lock().expect("kv lock poisoned");
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut map = self.inner.lock().expect("kv lock poisoned");
        Ok(map.remove(key).is_some())
    }

    fn window_count(&self, key: &str, cutoff_ms: i64) -> Result<WindowProbe, KvError> {
        let now = Instant::now();
        let empty = WindowProbe { count: 0, oldest: None };
        let mut map = self.inner.lock().expect("kv lock poisoned");
        if matches!(map.get(key), Some(entry) if entry.expired(now)) {
            map.remove(key);
            return Ok(empty);
        }
        let Some(Entry { value: Value::Window(stamps), .. }) = map.get_mut(key) else {
            return Ok(empty);
        };
        stamps.retain(|&ts| ts > cutoff_ms);
        Ok(WindowProbe {
            count: stamps.len() as u64,
            oldest: stamps.first().copied(),
        })
    }

    fn window_append(&self, key: &str, timestamp_ms: i64, ttl_secs: u64) -> Result<(), KvError> {
        let now = Instant::now();
        let mut map = self.inner.lock().expect("kv lock poisoned");
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Window(Vec::new()),
            expires_at: None,
        });
        if entry.expired(now) {
            entry.value = Value::Window(Vec::new());
        }
        if let Value::Window(stamps) = &mut entry.value {
            let pos = stamps.partition_point(|&ts| ts <= timestamp_ms);
            stamps.insert(pos, timestamp_ms);
        } else {
            entry.value = Value::Window(vec![timestamp_ms]);
        }
        entry.expires_at = Some(now + Duration::from_secs(ttl_secs));
        Ok(())
    }
}
