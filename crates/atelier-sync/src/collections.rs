//! Ordered-insert primitives backing every per-session collection.
//!
//! Collections stay small (a single session's message count, low hundreds),
//! so O(log n) locate + O(n) splice on a plain `Vec` beats tree structures
//! here. Both primitives only guarantee correct placement for a direct
//! insert; de-duplication policy belongs to the caller.

/// Insert-or-replace keyed by id. Replaces in place on an id hit, splices at
/// the computed index on a miss. Ascending id order is an invariant after
/// every call.
pub fn upsert_by_id<T>(items: &mut Vec<T>, item: T, id_of: impl Fn(&T) -> &str) {
    let key = id_of(&item).to_owned();
    match items.binary_search_by(|probe| id_of(probe).cmp(key.as_str())) {
        Ok(index) => items[index] = item,
        Err(index) => items.insert(index, item),
    }
}

/// Insert at the first index whose timestamp is >= the new item's. Arrival
/// order is not creation order on this stream (reconnect bursts deliver out
/// of order), so position is always computed, never assumed.
pub fn insert_by_timestamp<T>(items: &mut Vec<T>, item: T, time_of: impl Fn(&T) -> i64) {
    let stamp = time_of(&item);
    let index = items.partition_point(|probe| time_of(probe) < stamp);
    items.insert(index, item);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Entry {
        id: String,
        stamp: i64,
    }

    fn entry(id: &str, stamp: i64) -> Entry {
        Entry {
            id: id.to_owned(),
            stamp,
        }
    }

    #[test]
    fn upsert_inserts_in_id_order() {
        let mut items = Vec::new();
        for id in ["c", "a", "b"] {
            upsert_by_id(&mut items, entry(id, 0), |e| e.id.as_str());
        }
        let ids: Vec<&str> = items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn upsert_replaces_on_id_hit() {
        let mut items = vec![entry("a", 1), entry("b", 2)];
        upsert_by_id(&mut items, entry("a", 99), |e| e.id.as_str());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].stamp, 99);
    }

    #[test]
    fn timestamp_insert_places_between_existing() {
        let mut items = vec![entry("m1", 100), entry("m2", 300)];
        insert_by_timestamp(&mut items, entry("m3", 200), |e| e.stamp);
        let stamps: Vec<i64> = items.iter().map(|e| e.stamp).collect();
        assert_eq!(stamps, [100, 200, 300]);
    }

    #[test]
    fn timestamp_insert_is_deterministic_for_equal_stamps() {
        let mut items = vec![entry("m1", 100), entry("m2", 100)];
        insert_by_timestamp(&mut items, entry("m3", 100), |e| e.stamp);
        let ids: Vec<&str> = items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["m3", "m1", "m2"]);
    }
}
