//! Channel cache: the in-memory read path for routing.
//!
//! A background syncher (spawned from `main`) rebuilds the snapshot from
//! the Ability Store every `SYNC_FREQUENCY` seconds and swaps it in behind
//! a single `Arc`, so readers never block a writer mid-update and the
//! swap itself is a pointer store rather than a field-by-field mutation.
//! Generalised from a `RwLock<HashMap<String, f64>>` health-score table to
//! a `RwLock<Arc<HashMap<...>>>` so the whole table is replaced atomically.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::db::AbilityRepository;
use crate::error::Result;
use crate::types::Ability;

/// One eligible channel for a `(group, model)` pair, sorted within the
/// snapshot by priority descending then channel id ascending.
#[derive(Debug, Clone)]
pub struct CachedChannel {
    pub channel_id: i64,
    pub priority: i64,
    pub weight: u32,
}

type Snapshot = HashMap<(String, String), Vec<CachedChannel>>;

fn build_snapshot(abilities: Vec<Ability>) -> Snapshot {
    let mut grouped: Snapshot = HashMap::new();
    for a in abilities {
        if !a.enabled {
            continue;
        }
        grouped
            .entry((a.group, a.model))
            .or_default()
            .push(CachedChannel {
                channel_id: a.channel_id,
                priority: a.priority,
                weight: a.weight,
            });
    }
    for list in grouped.values_mut() {
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.channel_id.cmp(&b.channel_id)));
    }
    grouped
}

#[derive(Clone)]
pub struct ChannelCache {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl Default for ChannelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelCache {
    pub fn new() -> Self {
        ChannelCache {
            inner: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
        }
    }

    /// Returns the eligible channel list for `(group, model)`, or an empty
    /// slice if the pair has no enabled ability rows in the current
    /// snapshot. Staleness window equals the last sync interval.
    pub async fn lookup(&self, group: &str, model: &str) -> Vec<CachedChannel> {
        let snapshot = self.inner.read().await.clone();
        snapshot
            .get(&(group.to_string(), model.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn sync(&self, abilities: &AbilityRepository) -> Result<()> {
        let all = abilities.list_all_enabled().await?;
        let count = all.len();
        let snapshot = Arc::new(build_snapshot(all));
        *self.inner.write().await = snapshot;
        debug!(ability_rows = count, "channel cache resynced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ability(group: &str, model: &str, channel_id: i64, priority: i64, weight: u32, enabled: bool) -> Ability {
        Ability {
            group: group.to_string(),
            model: model.to_string(),
            channel_id,
            enabled,
            priority,
            weight,
        }
    }

    #[test]
    fn disabled_abilities_are_excluded() {
        let snapshot = build_snapshot(vec![
            ability("default", "gpt-4o-mini", 1, 10, 1, true),
            ability("default", "gpt-4o-mini", 2, 10, 1, false),
        ]);
        let entries = &snapshot[&("default".to_string(), "gpt-4o-mini".to_string())];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].channel_id, 1);
    }

    #[test]
    fn sorted_by_priority_desc_then_id_asc() {
        let snapshot = build_snapshot(vec![
            ability("default", "gpt-4o-mini", 3, 5, 1, true),
            ability("default", "gpt-4o-mini", 1, 10, 1, true),
            ability("default", "gpt-4o-mini", 2, 10, 1, true),
        ]);
        let entries = &snapshot[&("default".to_string(), "gpt-4o-mini".to_string())];
        let ids: Vec<i64> = entries.iter().map(|c| c.channel_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn lookup_on_empty_cache_returns_empty() {
        let cache = ChannelCache::new();
        assert!(cache.lookup("default", "gpt-4o-mini").await.is_empty());
    }
}
