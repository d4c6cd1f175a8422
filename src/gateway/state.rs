use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::auth::JwtVerifier;
use crate::db::Database;
use crate::kv::Kv;
use crate::spike::SpikeService;

/// Gateway application state (shared)
pub struct AppState {
    pub service: Arc<SpikeService>,
    pub db: Arc<Database>,
    pub kv: Kv,
    pub verifier: Arc<JwtVerifier>,
    /// Per-process request counter for request ids.
    request_seq: AtomicU64,
}

impl AppState {
    pub fn new(
        service: Arc<SpikeService>,
        db: Arc<Database>,
        kv: Kv,
        verifier: Arc<JwtVerifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            db,
            kv,
            verifier,
            request_seq: AtomicU64::new(1),
        })
    }

    /// Next request id, unique within this process.
    pub fn next_request_id(&self) -> String {
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed);
        format!("req-{}-{}", std::process::id(), seq)
    }
}
