//! Segment Cache (C4): a content-addressed byte cache keyed by
//! `(url, segStart)`, fixed-size aligned segments, LRU eviction under a
//! byte budget, and coalesced lookups for serving a Range entirely from
//! cache (spec §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SegmentKey {
    url: String,
    seg_start: u64,
}

/// An immutable cached byte slice, aligned to `seg_size` boundaries.
#[derive(Clone)]
pub struct Segment {
    pub start: u64,
    pub bytes: Bytes,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64 - 1
    }
}

struct SegmentEntry {
    bytes: Bytes,
    /// Monotonically increasing logical clock: doubles as the LRU
    /// recency marker and, because it only ever grows, as an
    /// insertion-order tiebreaker for segments that are never re-accessed.
    last_access: AtomicU64,
}

struct Inner {
    map: HashMap<SegmentKey, std::sync::Arc<SegmentEntry>>,
    size_bytes: u64,
    clock: u64,
}

pub struct SegmentCache {
    seg_size: u64,
    cap_bytes: u64,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Half-open-looking, inclusive byte interval used to query the cache.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl SegmentCache {
    pub fn new(seg_size: u64, cap_bytes: u64) -> Self {
        Self {
            seg_size,
            cap_bytes,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                size_bytes: 0,
                clock: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn seg_size(&self) -> u64 {
        self.seg_size
    }

    pub fn align_down(&self, offset: u64) -> u64 {
        (offset / self.seg_size) * self.seg_size
    }

    /// True iff a single cached segment fully contains `range`.
    pub fn has(&self, url: &str, range: ByteRange) -> bool {
        let seg_start = self.align_down(range.start);
        let inner = self.inner.lock();
        match inner.map.get(&SegmentKey {
            url: url.to_string(),
            seg_start,
        }) {
            Some(entry) => seg_start + entry.bytes.len() as u64 > range.end,
            None => false,
        }
    }

    /// Exact aligned segment lookup. Bumps LRU recency on hit.
    pub fn get_aligned(&self, url: &str, seg_start: u64) -> Option<Segment> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let key = SegmentKey {
            url: url.to_string(),
            seg_start,
        };
        match inner.map.get(&key) {
            Some(entry) => {
                entry.last_access.store(clock, Ordering::Relaxed);
                let bytes = entry.bytes.clone();
                drop(inner);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Segment {
                    start: seg_start,
                    bytes,
                })
            }
            None => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a new aligned segment. First-writer-wins: if the key is
    /// already present, the existing entry is left unchanged and `false`
    /// is returned. Otherwise evicts in LRU order (ties broken by
    /// insertion order) until `size <= 0.7 * cap`, then inserts.
    pub fn put(&self, url: &str, seg_start: u64, bytes: Bytes) -> bool {
        debug_assert!(seg_start % self.seg_size == 0);
        debug_assert!(bytes.len() as u64 <= self.seg_size);

        let mut inner = self.inner.lock();
        let key = SegmentKey {
            url: url.to_string(),
            seg_start,
        };
        if inner.map.contains_key(&key) {
            return false;
        }

        let incoming_len = bytes.len() as u64;
        if inner.size_bytes + incoming_len > self.cap_bytes {
            let target = (self.cap_bytes as f64 * 0.7) as u64;
            evict_until(&mut inner, target);
        }

        inner.clock += 1;
        let clock = inner.clock;
        inner.size_bytes += incoming_len;
        inner.map.insert(
            key,
            std::sync::Arc::new(SegmentEntry {
                bytes,
                last_access: AtomicU64::new(clock),
            }),
        );
        true
    }

    /// Returns every cached segment for `url` overlapping or contiguous
    /// with `[range.start - seg_size, range.end + seg_size]`, sorted by
    /// start offset.
    pub fn coalesce(&self, url: &str, range: ByteRange) -> Vec<Segment> {
        let lo = range.start.saturating_sub(self.seg_size);
        let hi = range.end.saturating_add(self.seg_size);

        let inner = self.inner.lock();
        let mut out: Vec<Segment> = inner
            .map
            .iter()
            .filter(|(k, _)| k.url == url)
            .filter_map(|(k, v)| {
                let seg_end = k.seg_start + v.bytes.len() as u64 - 1;
                if seg_end >= lo && k.seg_start <= hi {
                    Some(Segment {
                        start: k.seg_start,
                        bytes: v.bytes.clone(),
                    })
                } else {
                    None
                }
            })
            .collect();
        out.sort_by_key(|s| s.start);
        out
    }

    /// Concatenates a prefix of `segments` into a byte slice exactly
    /// covering `range`. Returns `None` if a gap exists anywhere in the
    /// covered interval.
    pub fn assemble(&self, segments: &[Segment], range: ByteRange) -> Option<Bytes> {
        let mut iter = segments.iter().filter(|s| s.end() >= range.start);
        let first = iter.next()?;
        if first.start > range.start {
            return None;
        }

        let mut out = Vec::with_capacity((range.end - range.start + 1) as usize);
        let mut cursor = range.start;
        let mut current = first;
        loop {
            let seg_lo = current.start.max(cursor);
            let seg_hi = current.end().min(range.end);
            if seg_lo > seg_hi {
                return None;
            }
            let offset_in_seg = (seg_lo - current.start) as usize;
            let take = (seg_hi - seg_lo + 1) as usize;
            out.extend_from_slice(&current.bytes[offset_in_seg..offset_in_seg + take]);
            cursor = seg_hi + 1;
            if cursor > range.end {
                break;
            }
            match iter.next() {
                Some(next) if next.start <= cursor => current = next,
                _ => return None,
            }
        }
        Some(Bytes::from(out))
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let misses = self.misses() as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().size_bytes
    }
}

/// Evicts entries in ascending recency order (oldest first; ties broken
/// by insertion order, which the monotonic clock already encodes) until
/// `size_bytes <= target`.
fn evict_until(inner: &mut Inner, target: u64) {
    let mut candidates: Vec<(SegmentKey, u64, u64)> = inner
        .map
        .iter()
        .map(|(k, v)| (k.clone(), v.last_access.load(Ordering::Relaxed), v.bytes.len() as u64))
        .collect();
    candidates.sort_by_key(|(_, recency, _)| *recency);

    for (key, _, len) in candidates {
        if inner.size_bytes <= target {
            break;
        }
        if inner.map.remove(&key).is_some() {
            inner.size_bytes -= len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: u64 = 2 * 1024 * 1024;

    fn seg_bytes(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    #[test]
    fn aligned_segment_roundtrips() {
        let cache = SegmentCache::new(SEG, 500 * 1024 * 1024);
        assert!(cache.put("u", 0, seg_bytes(SEG as usize)));
        let seg = cache.get_aligned("u", 0).unwrap();
        assert_eq!(seg.start, 0);
        assert_eq!(seg.bytes.len() as u64, SEG);
    }

    #[test]
    fn first_writer_wins_on_same_key() {
        let cache = SegmentCache::new(SEG, 500 * 1024 * 1024);
        assert!(cache.put("u", 0, Bytes::from_static(b"first")));
        assert!(!cache.put("u", 0, Bytes::from_static(b"second")));
        let seg = cache.get_aligned("u", 0).unwrap();
        assert_eq!(&seg.bytes[..], b"first");
    }

    #[test]
    fn distinct_urls_share_no_state() {
        let cache = SegmentCache::new(SEG, 500 * 1024 * 1024);
        cache.put("a", 0, Bytes::from_static(b"AAAA"));
        cache.put("b", 0, Bytes::from_static(b"BBBB"));
        assert_eq!(&cache.get_aligned("a", 0).unwrap().bytes[..], b"AAAA");
        assert_eq!(&cache.get_aligned("b", 0).unwrap().bytes[..], b"BBBB");
    }

    #[test]
    fn coalesce_and_assemble_exact_range() {
        let cache = SegmentCache::new(SEG, 500 * 1024 * 1024);
        cache.put("u", 0, seg_bytes(SEG as usize));
        cache.put("u", SEG, seg_bytes(SEG as usize));

        let range = ByteRange {
            start: SEG - 100,
            end: SEG + 100,
        };
        let segs = cache.coalesce("u", range);
        assert_eq!(segs.len(), 2);
        let assembled = cache.assemble(&segs, range).unwrap();
        assert_eq!(assembled.len() as u64, range.end - range.start + 1);
    }

    #[test]
    fn assemble_returns_none_on_gap() {
        let cache = SegmentCache::new(SEG, 500 * 1024 * 1024);
        cache.put("u", 0, seg_bytes(SEG as usize));
        // No segment at SEG*2, so a range spanning into it cannot assemble.
        cache.put("u", SEG * 3, seg_bytes(SEG as usize));

        let range = ByteRange {
            start: 0,
            end: SEG * 3 + 10,
        };
        let segs = cache.coalesce("u", range);
        assert!(cache.assemble(&segs, range).is_none());
    }

    #[test]
    fn lru_eviction_keeps_size_under_budget() {
        // 300 segments of 2 MiB = 600 MiB, cap at 500 MiB so 0.7*cap = 350 MiB.
        let cap = 500 * 1024 * 1024;
        let cache = SegmentCache::new(SEG, cap);
        for i in 0..300u64 {
            cache.put("u", i * SEG, seg_bytes(SEG as usize));
            assert!(cache.size_bytes() <= cap);
        }
        assert!(cache.size_bytes() <= (cap as f64 * 0.7) as u64 + SEG);
        // The first-inserted segment should have been evicted long ago.
        assert!(cache.get_aligned("u", 0).is_none());
    }

    #[test]
    fn eviction_never_starves_recently_touched_segment() {
        let cap = 6 * SEG; // room for 3 segments before eviction kicks in
        let cache = SegmentCache::new(SEG, cap);
        cache.put("u", 0, seg_bytes(SEG as usize));
        cache.put("u", SEG, seg_bytes(SEG as usize));
        cache.put("u", 2 * SEG, seg_bytes(SEG as usize));
        // touch segment 0 so it's most recently used
        cache.get_aligned("u", 0);

        for i in 3..10u64 {
            cache.put("u", i * SEG, seg_bytes(SEG as usize));
        }

        assert!(cache.get_aligned("u", 0).is_some());
    }
}
