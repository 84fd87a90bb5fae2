use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::session::{ServerBeaconConfig, SessionState};

/// Lifecycle buckets of every tracked session.
///
/// Each bucket preserves insertion order so the sending worker iterates
/// sessions deterministically.
#[derive(Default)]
struct Buckets {
    new_sessions: Vec<Arc<SessionState>>,
    open_configured: Vec<Arc<SessionState>>,
    finished_configured: Vec<Arc<SessionState>>,
}

impl Buckets {
    fn contains(&self, session: &Arc<SessionState>) -> bool {
        self.new_sessions
            .iter()
            .chain(self.open_configured.iter())
            .chain(self.finished_configured.iter())
            .any(|existing| Arc::ptr_eq(existing, session))
    }
}

/// Tracks sessions across their lifecycle.
///
/// A session progresses new -> openConfigured -> finishedConfigured and is
/// in exactly one bucket at any observable moment; all moves happen under
/// one mutex.
pub struct SessionRegistry {
    buckets: Mutex<Buckets>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// Places a session into the `new` bucket. A session that is already
    /// registered is left untouched.
    pub fn start_session(&self, session: &Arc<SessionState>) {
        let mut buckets = self.buckets.lock();
        if buckets.contains(session) {
            warn!(
                session = session.session_id(),
                "session already registered, ignoring start",
            );
            return;
        }
        buckets.new_sessions.push(Arc::clone(session));
    }

    /// Attaches a beacon configuration and moves the session from `new` to
    /// the tail of `openConfigured`.
    ///
    /// A session that is already open only has its configuration updated;
    /// a finished session is left untouched.
    pub fn attach_configuration(&self, session: &Arc<SessionState>, config: ServerBeaconConfig) {
        let mut buckets = self.buckets.lock();

        if let Some(pos) = buckets
            .new_sessions
            .iter()
            .position(|existing| Arc::ptr_eq(existing, session))
        {
            let moved = buckets.new_sessions.remove(pos);
            moved.set_beacon_config(config);
            buckets.open_configured.push(moved);
            return;
        }

        if buckets
            .open_configured
            .iter()
            .any(|existing| Arc::ptr_eq(existing, session))
        {
            session.set_beacon_config(config);
        }
    }

    /// Moves a session from `openConfigured` to the tail of
    /// `finishedConfigured`. No-op when the session is already finished or
    /// not yet configured.
    pub fn finish_session(&self, session: &Arc<SessionState>) {
        let mut buckets = self.buckets.lock();

        if let Some(pos) = buckets
            .open_configured
            .iter()
            .position(|existing| Arc::ptr_eq(existing, session))
        {
            let moved = buckets.open_configured.remove(pos);
            buckets.finished_configured.push(moved);
        }
    }

    /// Drops a session from whichever bucket holds it.
    pub fn remove_session(&self, session: &Arc<SessionState>) {
        let mut buckets = self.buckets.lock();
        buckets
            .new_sessions
            .retain(|existing| !Arc::ptr_eq(existing, session));
        buckets
            .open_configured
            .retain(|existing| !Arc::ptr_eq(existing, session));
        buckets
            .finished_configured
            .retain(|existing| !Arc::ptr_eq(existing, session));
    }

    /// Atomic copy of the `new` bucket.
    pub fn snapshot_new(&self) -> Vec<Arc<SessionState>> {
        self.buckets.lock().new_sessions.clone()
    }

    /// Atomic copy of the `openConfigured` bucket.
    pub fn snapshot_open_configured(&self) -> Vec<Arc<SessionState>> {
        self.buckets.lock().open_configured.clone()
    }

    /// Atomic copy of the `finishedConfigured` bucket.
    pub fn snapshot_finished_configured(&self) -> Vec<Arc<SessionState>> {
        self.buckets.lock().finished_configured.clone()
    }

    /// Atomic copy of every tracked session, across all buckets.
    pub fn snapshot_all(&self) -> Vec<Arc<SessionState>> {
        let buckets = self.buckets.lock();
        buckets
            .new_sessions
            .iter()
            .chain(buckets.open_configured.iter())
            .chain(buckets.finished_configured.iter())
            .cloned()
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
