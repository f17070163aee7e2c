use hashbrown::HashMap;

use crate::types::CompetitorId;

/// Key to the competitors filed under it, in insertion order.
pub type IdIndex<K> = HashMap<K, Vec<CompetitorId>>;

/// Files `id` under `key`.
pub fn link<K: std::hash::Hash + Eq>(index: &mut IdIndex<K>, key: K, id: CompetitorId) {
    index.entry(key).or_default().push(id);
}

/// Removes `id` from `key`, dropping the key once empty.
pub fn unlink<K: std::hash::Hash + Eq>(index: &mut IdIndex<K>, key: &K, id: CompetitorId) {
    if let Some(ids) = index.get_mut(key) {
        if let Some(pos) = ids.iter().position(|x| *x == id) {
            ids.remove(pos);
        }
        if ids.is_empty() {
            index.remove(key);
        }
    }
}
