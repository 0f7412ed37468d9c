#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Deduplicator limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
	/// Entries older than this are evicted first when the set is full.
	pub max_age: Duration,

	/// Hard cap on tracked ids.
	pub max_size: usize,
}

impl Default for DedupConfig {
	fn default() -> Self {
		Self {
			max_age: Duration::from_secs(10 * 60),
			max_size: 10_000,
		}
	}
}

/// Bounded set of recently seen message ids.
///
/// A lookup is also an insert, so the whole check runs under one lock.
#[derive(Debug)]
pub struct Deduplicator {
	max_age: Duration,
	max_size: usize,
	seen: Mutex<HashMap<String, Instant>>,
}

impl Deduplicator {
	pub fn new(cfg: DedupConfig) -> Self {
		Self {
			max_age: cfg.max_age,
			max_size: cfg.max_size.max(1),
			seen: Mutex::new(HashMap::new()),
		}
	}

	/// `true` if `id` is already tracked; otherwise records it and returns `false`.
	pub fn is_duplicate(&self, id: &str) -> bool {
		self.is_duplicate_at(id, Instant::now())
	}

	pub(crate) fn is_duplicate_at(&self, id: &str, now: Instant) -> bool {
		let mut seen = self.seen.lock();
		if seen.contains_key(id) {
			return true;
		}

		if seen.len() >= self.max_size {
			seen.retain(|_, seen_at| now.saturating_duration_since(*seen_at) <= self.max_age);
		}
		while seen.len() >= self.max_size {
			let Some(oldest) = seen.iter().min_by_key(|(_, seen_at)| **seen_at).map(|(k, _)| k.clone()) else {
				break;
			};
			seen.remove(&oldest);
		}

		seen.insert(id.to_string(), now);
		false
	}

	pub fn clear(&self) {
		self.seen.lock().clear();
	}

	pub fn len(&self) -> usize {
		self.seen.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.seen.lock().is_empty()
	}
}

impl Default for Deduplicator {
	fn default() -> Self {
		Self::new(DedupConfig::default())
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use proptest::prelude::*;

	use super::*;

	fn dedup(max_age_secs: u64, max_size: usize) -> Deduplicator {
		Deduplicator::new(DedupConfig {
			max_age: Duration::from_secs(max_age_secs),
			max_size,
		})
	}

	#[test]
	fn second_sighting_is_duplicate() {
		let d = Deduplicator::default();
		assert!(!d.is_duplicate("a"));
		assert!(d.is_duplicate("a"));
		assert!(d.is_duplicate("a"));
		assert!(!d.is_duplicate("b"));
		assert_eq!(d.len(), 2);
	}

	#[test]
	fn clear_forgets_everything() {
		let d = Deduplicator::default();
		assert!(!d.is_duplicate("a"));
		d.clear();
		assert!(d.is_empty());
		assert!(!d.is_duplicate("a"));
	}

	#[test]
	fn old_entries_still_count_until_evicted() {
		let d = dedup(1, 10);
		let t0 = Instant::now();
		assert!(!d.is_duplicate_at("a", t0));
		assert!(d.is_duplicate_at("a", t0 + Duration::from_secs(60)));
	}

	#[test]
	fn full_set_drops_expired_entries_first() {
		let d = dedup(10, 3);
		let t0 = Instant::now();
		assert!(!d.is_duplicate_at("old-1", t0));
		assert!(!d.is_duplicate_at("old-2", t0 + Duration::from_secs(1)));
		assert!(!d.is_duplicate_at("fresh", t0 + Duration::from_secs(15)));

		assert!(!d.is_duplicate_at("new", t0 + Duration::from_secs(16)));
		assert_eq!(d.len(), 2);
		assert!(d.is_duplicate_at("fresh", t0 + Duration::from_secs(16)));
		assert!(!d.is_duplicate_at("old-1", t0 + Duration::from_secs(16)));
	}

	#[test]
	fn full_set_evicts_oldest_by_timestamp() {
		let d = dedup(600, 2);
		let t0 = Instant::now();
		// Insertion order differs from timestamp order.
		assert!(!d.is_duplicate_at("later", t0 + Duration::from_secs(5)));
		assert!(!d.is_duplicate_at("earlier", t0));

		assert!(!d.is_duplicate_at("third", t0 + Duration::from_secs(6)));
		assert_eq!(d.len(), 2);
		assert!(d.is_duplicate_at("later", t0 + Duration::from_secs(7)));
		assert!(d.is_duplicate_at("third", t0 + Duration::from_secs(7)));
	}

	#[test]
	fn zero_max_size_still_tracks_one() {
		let d = dedup(600, 0);
		assert!(!d.is_duplicate("a"));
		assert!(d.is_duplicate("a"));
		assert!(!d.is_duplicate("b"));
		assert_eq!(d.len(), 1);
	}

	#[test]
	fn concurrent_callers_see_one_first_sighting() {
		let d = Arc::new(Deduplicator::default());
		let handles: Vec<_> = (0..8)
			.map(|_| {
				let d = d.clone();
				std::thread::spawn(move || (0..100).filter(|i| !d.is_duplicate(&format!("id-{i}"))).count())
			})
			.collect();
		let firsts: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
		assert_eq!(firsts, 100);
	}

	#[test]
	fn distinct_message_ids_pass_until_full() {
		let d = dedup(600, 64);
		let ids: Vec<String> = (0..64).map(|_| uuid::Uuid::new_v4().to_string()).collect();
		assert!(ids.iter().all(|id| !d.is_duplicate(id)));
		assert_eq!(d.len(), 64);
		assert!(ids.iter().all(|id| d.is_duplicate(id)));
	}

	proptest! {
		#[test]
		fn never_exceeds_max_size(ids in proptest::collection::vec("[a-z]{1,4}", 0..200), max_size in 1usize..16) {
			let d = dedup(600, max_size);
			for id in &ids {
				d.is_duplicate(id);
				prop_assert!(d.len() <= max_size);
			}
		}

		#[test]
		fn first_call_false_then_true(id in "\\PC{1,32}") {
			let d = Deduplicator::default();
			prop_assert!(!d.is_duplicate(&id));
			prop_assert!(d.is_duplicate(&id));
		}
	}
}
