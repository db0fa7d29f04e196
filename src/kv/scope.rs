use crate::error::LiquidError;
use crate::frame::{column_keys, Frame};
use crate::kv::{KVStore, Key, KeyKind, Value};
use log::debug;
use std::collections::HashSet;

/// Tracks the keys created during a unit of work so that they can be
/// removed together once it is done, apart from the ones explicitly kept.
///
/// Frame and column keys stand for everything they own: exiting a scope that
/// tracks a frame removes the frame, its columns and their chunks, unless the
/// frame, or a kept frame sharing a column, is kept.
#[derive(Debug, Default)]
pub struct Scope {
    tracked: Vec<Key>,
    kept: HashSet<Key>,
}

impl Scope {
    pub fn new() -> Self {
        Scope::default()
    }

    pub fn track(&mut self, key: Key) {
        self.tracked.push(key);
    }

    /// Tracks a frame and everything it owns
    pub fn track_frame(&mut self, frame: &Frame) {
        self.track(frame.key.clone());
    }

    /// Excludes `key`, and everything it owns, from removal
    pub fn keep(&mut self, key: Key) {
        self.kept.insert(key);
    }

    /// Removes every tracked key that is not kept. Returns the number of keys
    /// removal was requested for; keys that no longer exist are skipped.
    pub async fn exit(self, kv: &KVStore) -> Result<usize, LiquidError> {
        let mut kept = HashSet::new();
        for key in &self.kept {
            kept.extend(expand(kv, key).await?);
        }
        let mut doomed = HashSet::new();
        for key in &self.tracked {
            doomed.extend(expand(kv, key).await?);
        }
        let doomed: Vec<Key> = doomed.difference(&kept).cloned().collect();
        for key in &doomed {
            kv.remove(key).await?;
        }
        debug!("Scope removed {} keys, kept {}", doomed.len(), kept.len());
        Ok(doomed.len())
    }
}

/// `key` along with every key it owns
async fn expand(kv: &KVStore, key: &Key) -> Result<Vec<Key>, LiquidError> {
    let found = match key.kind {
        KeyKind::Frame | KeyKind::Column => kv.get(key).await,
        _ => return Ok(vec![key.clone()]),
    };
    match found {
        Ok(Value::Frame(frame)) => Ok(frame.keys()),
        Ok(Value::Column(column)) => Ok(column_keys(&column)),
        Ok(_) | Err(LiquidError::NotFound(_)) => Ok(vec![key.clone()]),
        Err(e) => Err(e),
    }
}
