//! Caches: the generic TTL map backing Metadata/Redirect/Preload (C2, C3,
//! preload), and the segmented byte cache (C4).

pub mod segment;
pub mod ttl;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use segment::{ByteRange, Segment, SegmentCache};
pub use ttl::TtlCache;

/// `{contentLength, contentType, lastModified, etag}` for an origin URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub content_length: u64,
    pub content_type: String,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// The resolved CDN URL an origin URL 30x-redirected to.
#[derive(Debug, Clone)]
pub struct RedirectEntry {
    pub cdn_url: String,
}

/// The three TTL-indexed caches plus the segment cache, bundled for
/// sharing across handlers (spec §5 shared-resources table).
pub struct Caches {
    pub metadata: TtlCache<String, MetadataEntry>,
    pub redirect: TtlCache<String, RedirectEntry>,
    pub preload: TtlCache<String, ()>,
    pub segments: SegmentCache,
}

impl Caches {
    pub fn new(
        metadata_ttl: Duration,
        redirect_ttl: Duration,
        preload_ttl: Duration,
        seg_size: u64,
        cap_bytes: u64,
    ) -> Self {
        Self {
            metadata: TtlCache::new(metadata_ttl),
            redirect: TtlCache::new(redirect_ttl),
            preload: TtlCache::new(preload_ttl),
            segments: SegmentCache::new(seg_size, cap_bytes),
        }
    }

    /// Runs the once-a-minute sweep across every TTL-indexed cache (spec
    /// §3 Lifecycle). The segment cache has no sweep: it's bounded by
    /// LRU eviction, not time.
    pub fn sweep(&self) {
        self.metadata.sweep();
        self.redirect.sweep();
        self.preload.sweep();
    }
}
