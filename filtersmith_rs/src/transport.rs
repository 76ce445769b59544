use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Shared queue and key/value contract between coordinator, producer and
/// workers. `pop_front` must be atomic: an item is handed to exactly one
/// caller.
pub trait Transport: Send + Sync {
    /// Append items to the tail of the list at `key`.
    fn push_batch(&self, key: &str, items: &[String]) -> Result<()>;
    /// Remove and return the head of the list at `key`.
    fn pop_front(&self, key: &str) -> Result<Option<String>>;
    fn queue_len(&self, key: &str) -> Result<usize>;
    /// Set the retention of an existing key. Returns false when the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Set only when the key is absent. Returns whether the value was written.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Key names for one job.
pub mod keys {
    pub fn queue(job_id: &str) -> String {
        format!("combinations-for-job:{job_id}")
    }

    pub fn stop_flag(job_id: &str) -> String {
        format!("stop-job:{job_id}")
    }

    pub fn progress(job_id: &str) -> String {
        format!("progress-for-job:{job_id}")
    }

    pub fn total(job_id: &str) -> String {
        format!("total-jobs-for-job:{job_id}")
    }

    pub fn lease(job_id: &str) -> String {
        format!("lease-for-job:{job_id}")
    }

    pub fn pid(job_id: &str) -> String {
        format!("pid-for-job:{job_id}")
    }
}

#[derive(Debug)]
enum Value {
    List(VecDeque<String>),
    Text(String),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// In-process transport with lazy TTL expiry. Clones share one store.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory transport lock poisoned"))
    }

    /// Drop `key` if its TTL has passed and return the live entry.
    fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if map.get(key).is_some_and(|entry| !entry.is_live(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    /// Keys currently holding a live value.
    pub fn live_keys(&self) -> Result<Vec<String>> {
        let now = Instant::now();
        let guard = self.lock()?;
        let mut keys: Vec<String> = guard
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

impl Transport for MemoryTransport {
    fn push_batch(&self, key: &str, items: &[String]) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(entry) = Self::live(&mut guard, key) {
            return match &mut entry.value {
                Value::List(list) => {
                    list.extend(items.iter().cloned());
                    Ok(())
                }
                Value::Text(_) => Err(anyhow!("key '{key}' does not hold a list")),
            };
        }
        guard.insert(
            key.to_string(),
            Entry {
                value: Value::List(items.iter().cloned().collect()),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.lock()?;
        let Some(entry) = Self::live(&mut guard, key) else {
            return Ok(None);
        };
        let popped = match &mut entry.value {
            Value::List(list) => list.pop_front(),
            Value::Text(_) => return Err(anyhow!("key '{key}' does not hold a list")),
        };
        if matches!(&entry.value, Value::List(list) if list.is_empty()) {
            guard.remove(key);
        }
        Ok(popped)
    }

    fn queue_len(&self, key: &str) -> Result<usize> {
        let mut guard = self.lock()?;
        match Self::live(&mut guard, key).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(Value::Text(_)) => Err(anyhow!("key '{key}' does not hold a list")),
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut guard = self.lock()?;
        match Self::live(&mut guard, key) {
            Some(entry) => {
                entry.expires_at = deadline(Some(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut guard = self.lock()?;
        guard.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.lock()?;
        match Self::live(&mut guard, key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(Value::List(_)) => Err(anyhow!("key '{key}' holds a list")),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut guard = self.lock()?;
        if Self::live(&mut guard, key).is_some() {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: deadline(ttl),
            },
        );
        Ok(true)
    }
}
