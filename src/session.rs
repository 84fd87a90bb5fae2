use std::sync::Arc;

use parking_lot::Mutex;

use crate::beacon::Beacon;
use crate::cache::BeaconCache;
use crate::clock::TimingProvider;
use crate::config::{AgentConfig, SettingsStore};
use crate::protocol::http::BeaconTransport;
use crate::protocol::StatusResponse;

/// How much captured data a session may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCollectionLevel {
    Off,
    Performance,
    UserBehavior,
}

/// Whether crashes may be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashReportingLevel {
    Off,
    OptOut,
    OptIn,
}

/// Server-assigned per-session beacon configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerBeaconConfig {
    /// How often the session's beacon is actually transmitted; 0 drops it.
    pub multiplicity: i32,
    pub data_level: DataCollectionLevel,
    pub crash_level: CrashReportingLevel,
}

impl Default for ServerBeaconConfig {
    fn default() -> Self {
        Self {
            multiplicity: 1,
            data_level: DataCollectionLevel::UserBehavior,
            crash_level: CrashReportingLevel::OptIn,
        }
    }
}

impl ServerBeaconConfig {
    /// Configuration attached during shutdown flush so the session is ended
    /// without transmitting.
    pub fn no_send() -> Self {
        Self {
            multiplicity: 0,
            ..Self::default()
        }
    }

    /// Whether a beacon for this configuration may be transmitted at all.
    pub fn allows_sending(&self) -> bool {
        self.multiplicity > 0 && self.data_level != DataCollectionLevel::Off
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    end_time: Option<i64>,
    beacon_config: Option<ServerBeaconConfig>,
    last_beacon_send_time: i64,
}

/// Internal state of one logical session.
///
/// Owned by the registry; reporting handles and the sending worker share it
/// by `Arc`. Lifecycle position (new / open / finished) is tracked by the
/// registry buckets, the end timestamp and beacon configuration here.
pub struct SessionState {
    beacon: Beacon,
    clock: Arc<dyn TimingProvider>,
    inner: Mutex<SessionInner>,
}

impl SessionState {
    pub fn new(
        session_id: i32,
        client_ip: Option<String>,
        cfg: &AgentConfig,
        cache: Arc<BeaconCache>,
        settings: Arc<SettingsStore>,
        clock: Arc<dyn TimingProvider>,
    ) -> Self {
        let beacon = Beacon::new(
            session_id,
            client_ip,
            cfg,
            cache,
            settings,
            Arc::clone(&clock),
        );

        Self {
            beacon,
            clock,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    pub fn session_id(&self) -> i32 {
        self.beacon.session_id()
    }

    pub fn start_time(&self) -> i64 {
        self.beacon.start_time()
    }

    /// Serializer for this session's records.
    pub fn beacon(&self) -> &Beacon {
        &self.beacon
    }

    pub fn end_time(&self) -> Option<i64> {
        self.inner.lock().end_time
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().end_time.is_some()
    }

    pub fn beacon_config(&self) -> Option<ServerBeaconConfig> {
        self.inner.lock().beacon_config
    }

    pub fn set_beacon_config(&self, config: ServerBeaconConfig) {
        self.inner.lock().beacon_config = Some(config);
    }

    /// Whether the attached configuration permits transmitting this
    /// session's beacon. Unconfigured sessions never send.
    pub fn is_data_sending_allowed(&self) -> bool {
        self.inner
            .lock()
            .beacon_config
            .is_some_and(|config| config.allows_sending())
    }

    pub fn last_beacon_send_time(&self) -> i64 {
        self.inner.lock().last_beacon_send_time
    }

    /// Ends the session: records the end timestamp and serializes the
    /// session-end event. Returns false without side effects when the
    /// session already ended.
    pub fn end(&self) -> bool {
        let end_time = self.clock.now_millis();
        {
            let mut inner = self.inner.lock();
            if inner.end_time.is_some() {
                return false;
            }
            inner.end_time = Some(end_time);
        }

        self.beacon.add_session_end(end_time);
        true
    }

    /// Transmits this session's cached records, chunk by chunk.
    ///
    /// Stops on the first retryable response (429/5xx) or transport error
    /// with the in-flight chunk restored for a later retry; non-retryable
    /// rejections drop the chunk and sending continues. Returns the last
    /// response observed.
    pub async fn send_beacon<C: BeaconTransport>(&self, transport: &C) -> Option<StatusResponse> {
        let response = self.beacon.send(transport).await;

        if response.as_ref().is_some_and(StatusResponse::is_success) {
            self.inner.lock().last_beacon_send_time = self.clock.now_millis();
        }

        response
    }

    /// Whether no pending records remain in the cache for this session.
    pub fn is_empty(&self) -> bool {
        self.beacon.is_empty()
    }

    /// Drops all captured data for this session, pending and in-transit.
    pub fn clear_captured_data(&self) {
        self.beacon.clear_data();
    }
}
