//! Concurrency wrapper around [`AddressManagerCore`].
//!
//! A single `tokio::sync::Mutex` guards the whole structure (spec §5: "a
//! single mutable store guarded by one exclusive lock"). Every method
//! here acquires it for its entire duration, except `serialize`/
//! `unserialize`, which release it before touching the filesystem —
//! file I/O is the only suspension point the core itself never sees.

use std::io::Write as _;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::core::AddressManagerCore;
use crate::endpoint::Endpoint;
use crate::entry::ExtendedEntry;
use crate::error::{AddrManError, AddrManResult};
use crate::hashing::SecretKey;
use crate::serializer;

/// The address manager: a locked [`AddressManagerCore`] plus an
/// injected clock. Cheap to share behind an `Arc` across tasks.
pub struct AddressManager {
    core: Mutex<AddressManagerCore>,
    clock: Box<dyn Clock>,
}

impl Default for AddressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressManager {
    /// A fresh, empty manager with a randomly drawn secret key and the
    /// system wall clock.
    pub fn new() -> Self {
        let rng = Box::new(StdRng::from_entropy());
        AddressManager {
            core: Mutex::new(AddressManagerCore::new(rng)),
            clock: Box::new(SystemClock),
        }
    }

    /// Build a manager with an explicit secret key, RNG and clock —
    /// for tests that need reproducible bucket placement or scripted
    /// time.
    pub fn with_parts(
        key: SecretKey,
        rng: Box<dyn RngCore + Send>,
        clock: Box<dyn Clock>,
    ) -> Self {
        AddressManager {
            core: Mutex::new(AddressManagerCore::with_key(key, rng)),
            clock,
        }
    }

    /// Total number of live entries (NEW + TRIED).
    pub async fn size(&self) -> usize {
        self.core.lock().await.size()
    }

    /// Add learned endpoints to NEW. Returns `true` iff at least one
    /// brand-new entry was created.
    pub async fn add_to_new_table(
        &self,
        endpoints: Vec<Endpoint>,
        source: Option<Endpoint>,
        penalty: i64,
    ) -> bool {
        let now = self.clock.now();
        let mut core = self.core.lock().await;
        let mut any_created = false;
        for endpoint in endpoints {
            if core.add_to_new(endpoint, source, penalty, now) {
                any_created = true;
            }
        }
        any_created
    }

    /// Mark an endpoint as reachable, evaluating "now" at call time.
    pub async fn mark_good(&self, endpoint: Endpoint, test_before_evict: bool) {
        let now = self.clock.now();
        self.mark_good_at(endpoint, test_before_evict, now).await
    }

    /// Same as [`Self::mark_good`] with an explicit `now`, for tests and
    /// for collision resolution replaying a specific timestamp.
    pub async fn mark_good_at(&self, endpoint: Endpoint, test_before_evict: bool, now: i64) {
        self.core.lock().await.mark_good(endpoint, test_before_evict, now);
    }

    /// Record a connection attempt, evaluating "now" at call time.
    pub async fn attempt(&self, endpoint: Endpoint, count_failures: bool) {
        let now = self.clock.now();
        self.attempt_at(endpoint, count_failures, now).await
    }

    /// Same as [`Self::attempt`] with an explicit `now`.
    pub async fn attempt_at(&self, endpoint: Endpoint, count_failures: bool, now: i64) {
        self.core.lock().await.attempt(endpoint, count_failures, now);
    }

    /// Refresh an endpoint's liveness timestamp, evaluating "now" at
    /// call time.
    pub async fn connect(&self, endpoint: Endpoint) {
        let now = self.clock.now();
        self.connect_at(endpoint, now).await
    }

    /// Same as [`Self::connect`] with an explicit `now`.
    pub async fn connect_at(&self, endpoint: Endpoint, now: i64) {
        self.core.lock().await.connect(endpoint, now);
    }

    /// Choose a candidate endpoint to connect to.
    pub async fn select_peer(&self, new_only: bool) -> Option<Endpoint> {
        let now = self.clock.now();
        self.core.lock().await.select_peer(new_only, now)
    }

    /// Pick a queued tried-table collision and return the entry it
    /// would evict, for the caller to probe against.
    pub async fn select_tried_collision(&self) -> Option<ExtendedEntry> {
        self.core.lock().await.select_tried_collision()
    }

    /// Resolve every queued tried-table collision.
    pub async fn resolve_tried_collisions(&self) {
        let now = self.clock.now();
        self.core.lock().await.resolve_tried_collisions(now);
    }

    /// A reservoir sample of non-terrible endpoints, suitable for
    /// answering a peer's GET_PEERS-style request.
    pub async fn get_peers(&self) -> Vec<Endpoint> {
        let now = self.clock.now();
        self.core.lock().await.get_peers(now)
    }

    /// Write the manager's state to `path`, via a temp file + rename so
    /// a crash mid-write cannot corrupt the previously committed file.
    pub async fn serialize(&self, path: impl AsRef<Path>) -> AddrManResult<()> {
        let text = {
            let core = self.core.lock().await;
            serializer::dump(&core)
        };
        match write_atomic(path.as_ref(), &text) {
            Ok(()) => {
                log::debug!("Address manager successfully persisted to {:?}", path.as_ref());
                Ok(())
            }
            Err(e) => {
                log::error!("Address manager failed to persist to {:?}: {}", path.as_ref(), e);
                Err(e)
            }
        }
    }

    /// Replace the manager's state with what's stored at `path`. On any
    /// parse failure the manager is left untouched.
    pub async fn unserialize(&self, path: impl AsRef<Path>) -> AddrManResult<()> {
        let text = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            log::error!("Address manager failed to read {:?}: {}", path.as_ref(), e);
            e
        })?;

        let rng: Box<dyn RngCore + Send> = Box::new(StdRng::from_entropy());
        let loaded = serializer::load(&text, rng).map_err(|e| {
            log::error!("Address manager state at {:?} is corrupt: {}", path.as_ref(), e);
            e
        })?;

        let mut core = self.core.lock().await;
        *core = loaded;
        log::debug!("Address manager successfully restored from {:?}", path.as_ref());
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &str) -> AddrManResult<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new()?,
    };
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| AddrManError::Io(e.error))?;
    Ok(())
}
