pub mod states;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::BeaconCache;
use crate::clock::TimingProvider;
use crate::config::SettingsStore;
use crate::protocol::http::BeaconTransport;
use crate::protocol::StatusResponse;
use crate::registry::SessionRegistry;

pub use states::SendingState;

/// Shared state of the beacon sending worker.
///
/// Owned by the single worker task; states receive it by mutable reference
/// during `execute` and transition by setting the next state. Reporter-side
/// components only hold the cancellation token and the init watch.
pub struct SendingContext<C> {
    pub(crate) transport: C,
    pub(crate) cache: Arc<BeaconCache>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) settings: Arc<SettingsStore>,
    pub(crate) clock: Arc<dyn TimingProvider>,
    pub(crate) cancel: CancellationToken,
    pub(crate) init_tx: watch::Sender<Option<bool>>,
    pub(crate) current_state: SendingState,
    pub(crate) next_state: Option<SendingState>,
    pub(crate) last_open_beacon_send_time: i64,
    pub(crate) last_status_check_time: i64,
    pub(crate) retry_after: Option<Duration>,
}

impl<C: BeaconTransport> SendingContext<C> {
    pub fn new(
        transport: C,
        cache: Arc<BeaconCache>,
        registry: Arc<SessionRegistry>,
        settings: Arc<SettingsStore>,
        clock: Arc<dyn TimingProvider>,
        cancel: CancellationToken,
    ) -> Self {
        let (init_tx, _) = watch::channel(None);

        Self {
            transport,
            cache,
            registry,
            settings,
            clock,
            cancel,
            init_tx,
            current_state: SendingState::Init,
            next_state: None,
            last_open_beacon_send_time: 0,
            last_status_check_time: 0,
            retry_after: None,
        }
    }

    /// Watch resolving to the init outcome; `None` while initialization is
    /// still in progress.
    pub fn init_watch(&self) -> watch::Receiver<Option<bool>> {
        self.init_tx.subscribe()
    }

    pub fn transport(&self) -> &C {
        &self.transport
    }

    /// Signals the init outcome. Only the first call takes effect.
    pub fn mark_init_completed(&self, success: bool) {
        self.init_tx.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(success);
                true
            } else {
                false
            }
        });
    }

    /// Sleeps for `duration`, waking early on shutdown.
    pub async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn current_state(&self) -> SendingState {
        self.current_state
    }

    pub fn next_state(&self) -> Option<SendingState> {
        self.next_state
    }

    pub fn set_next_state(&mut self, state: SendingState) {
        self.next_state = Some(state);
    }

    /// Minimum delay imposed by the last throttled response, consumed by
    /// the next sleeping state.
    pub(crate) fn take_retry_after(&mut self) -> Option<Duration> {
        self.retry_after.take()
    }

    pub(crate) fn set_retry_after(&mut self, delay: Duration) {
        self.retry_after = Some(delay);
    }

    /// Turns capture off and drops every session's captured data.
    pub fn disable_capture_and_clear(&self) {
        self.settings.disable_capture();
        self.clear_all_session_data();
    }

    /// Applies a status response to the settings store; if the response
    /// forbids capture, additionally drops every session's captured data.
    pub fn handle_status_response(&mut self, response: &StatusResponse) {
        self.settings.update_settings(Some(response));

        if !self.settings.is_capture() {
            self.clear_all_session_data();
        }
    }

    fn clear_all_session_data(&self) {
        for session in self.registry.snapshot_all() {
            session.clear_captured_data();
        }
        // Partitions without a live session are dropped as well.
        for session_id in self.cache.session_ids() {
            self.cache.delete_cache_entry(session_id);
        }
    }

    /// Drives the state machine until a terminal state is reached.
    pub async fn run(mut self) {
        info!("beacon sender started");

        while !self.current_state.is_terminal() {
            let state = self.current_state;
            state.execute(&mut self).await;

            if let Some(next) = self.next_state.take() {
                if next != state {
                    debug!(from = state.name(), to = next.name(), "state transition");
                }
                self.current_state = next;
            }
        }

        // A shutdown before Init finished still resolves waiters.
        self.mark_init_completed(false);

        info!("beacon sender stopped");
    }
}
