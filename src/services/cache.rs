use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;
use xxhash_rust::xxh3::Xxh3;

use crate::core::config::ProcessingOptions;
use crate::core::errors::{ConfigError, ConfigResult};
use crate::core::types::{DetectionSet, PixelBuffer};
use crate::utils::Metrics;

/// In-memory LRU cache of finished detection results.
///
/// Cloning yields another handle to the same cache. A single mutex guards
/// both lookups and inserts, so an entry is either fully visible or absent.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: Mutex<LruCache<u64, DetectionSet>>,
    metrics: Option<Metrics>,
}

impl ResultCache {
    pub fn new(capacity: usize, metrics: Option<Metrics>) -> ConfigResult<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or(ConfigError::InvalidCacheCapacity(capacity))?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(LruCache::new(capacity)),
                metrics,
            }),
        })
    }

    /// xxHash3 over dimensions, pixel bytes and the serialized options
    pub fn key(buffer: &PixelBuffer, options: &ProcessingOptions) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(&buffer.width().to_le_bytes());
        hasher.update(&buffer.height().to_le_bytes());
        hasher.update(buffer.data());
        hasher.update(&options.fingerprint());
        hasher.digest()
    }

    pub fn get(&self, key: u64) -> Option<DetectionSet> {
        let hit = self.inner.entries.lock().get(&key).cloned();

        if let Some(ref m) = self.inner.metrics {
            match hit {
                Some(_) => m.record_cache_hit(),
                None => m.record_cache_miss(),
            }
        }
        trace!("Result cache {} for {:016x}", if hit.is_some() { "hit" } else { "miss" }, key);
        hit
    }

    pub fn put(&self, key: u64, result: DetectionSet) {
        let mut entries = self.inner.entries.lock();
        entries.put(key, result);

        if let Some(ref m) = self.inner.metrics {
            m.update_cache_size(entries.len());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
        if let Some(ref m) = self.inner.metrics {
            m.update_cache_size(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ReadingDirection;
    use crate::core::types::{BoundingBox, Detection, DetectionSource, RegionClass};

    fn result(tag: f32) -> DetectionSet {
        DetectionSet {
            detections: vec![Detection::new(
                BoundingBox::new(tag, tag, 10.0, 10.0),
                0.9,
                RegionClass::SpeechBubble,
                DetectionSource::Heuristic,
            )],
            ..DetectionSet::default()
        }
    }

    #[test]
    fn test_key_depends_on_pixels_and_options() {
        let a = PixelBuffer::filled(4, 4, [255, 255, 255, 255]).unwrap();
        let b = PixelBuffer::filled(4, 4, [254, 255, 255, 255]).unwrap();
        let c = PixelBuffer::filled(2, 8, [255, 255, 255, 255]).unwrap();
        let options = ProcessingOptions::default();
        let rtl = ProcessingOptions {
            reading_direction: ReadingDirection::Rtl,
            ..ProcessingOptions::default()
        };

        let key = ResultCache::key(&a, &options);
        assert_eq!(key, ResultCache::key(&a.clone(), &ProcessingOptions::default()));
        assert_ne!(key, ResultCache::key(&b, &options));
        assert_ne!(key, ResultCache::key(&c, &options));
        assert_ne!(key, ResultCache::key(&a, &rtl));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResultCache::new(2, None).unwrap();
        cache.put(1, result(1.0));
        cache.put(2, result(2.0));
        // Touch 1 so 2 becomes least recently used
        assert!(cache.get(1).is_some());
        cache.put(3, result(3.0));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(2).is_none());
        assert_eq!(cache.get(1), Some(result(1.0)));
        assert_eq!(cache.get(3), Some(result(3.0)));
    }

    #[test]
    fn test_hits_and_misses_reach_metrics() {
        let metrics = Metrics::new();
        let cache = ResultCache::new(4, Some(metrics.clone())).unwrap();
        cache.put(7, result(7.0));
        cache.get(7);
        cache.get(8);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.cache_size, 1);

        cache.clear();
        assert!(cache.is_empty());
        assert!(ResultCache::new(0, None).is_err());
    }
}
