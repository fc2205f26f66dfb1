//! Active-request table: per-inbound-request observability record,
//! created at router entry and removed in a guaranteed-release manner.
//! The table also hands out the sequential ids used crate-wide as
//! `X-Request-Id` (see `router::request_id_layer`), so an id a client
//! sees is always the same one that shows up in `/api/stats` and in the
//! logs for the request that produced it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub id: u64,
    pub method: String,
    pub url: String,
    pub start_at: Instant,
    pub client_range: Option<String>,
}

pub struct ActiveRequests {
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, ActiveRequest>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Hands out the next id in the shared sequence. Every inbound
    /// request gets one, whether or not it ends up tracked in this table.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `id` (already allocated via `next_id`) as an in-flight
    /// request and returns a guard that removes it on drop. Takes `table`
    /// as an `Arc` rather than `&self` so the guard can be moved into a
    /// streaming response body and outlive the handler call that created
    /// it — it must stay alive until the body is actually exhausted, not
    /// just until the response headers are built.
    pub fn begin(table: &Arc<ActiveRequests>, id: u64, method: &str, url: &str, client_range: Option<String>) -> ActiveRequestGuard {
        table.table.lock().insert(
            id,
            ActiveRequest {
                id,
                method: method.to_string(),
                url: url.to_string(),
                start_at: Instant::now(),
                client_range,
            },
        );
        ActiveRequestGuard { table: table.clone(), id }
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActiveRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Dropping this removes the entry, regardless of how the holder goes
/// away (normal return, early error, cancellation, or the client
/// disconnecting mid-stream) — the guaranteed-release discipline this
/// table depends on.
pub struct ActiveRequestGuard {
    table: Arc<ActiveRequests>,
    id: u64,
}

impl ActiveRequestGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.table.table.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_entry_on_drop() {
        let table = Arc::new(ActiveRequests::new());
        {
            let id = table.next_id();
            let _guard = ActiveRequests::begin(&table, id, "GET", "http://x/video.mp4", Some("bytes=0-1".to_string()));
            assert_eq!(table.len(), 1);
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn concurrent_requests_get_distinct_ids() {
        let table = Arc::new(ActiveRequests::new());
        let id_a = table.next_id();
        let id_b = table.next_id();
        let a = ActiveRequests::begin(&table, id_a, "GET", "http://x/a", None);
        let b = ActiveRequests::begin(&table, id_b, "GET", "http://x/b", None);
        assert_ne!(a.id(), b.id());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn guard_outlives_the_call_that_created_it() {
        let table = Arc::new(ActiveRequests::new());
        fn begin_and_return(table: &Arc<ActiveRequests>) -> ActiveRequestGuard {
            let id = table.next_id();
            ActiveRequests::begin(table, id, "GET", "http://x/video.mp4", None)
        }
        let guard = begin_and_return(&table);
        assert_eq!(table.len(), 1);
        drop(guard);
        assert_eq!(table.len(), 0);
    }
}
