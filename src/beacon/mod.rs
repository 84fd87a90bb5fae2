use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::cache::BeaconCache;
use crate::clock::TimingProvider;
use crate::config::{AgentConfig, SettingsStore};
use crate::protocol::http::BeaconTransport;
use crate::protocol::{
    append_int_pair, append_pair, truncate_name, EventKind, StatusResponse, AGENT_TECHNOLOGY,
    AGENT_VERSION, KEY_ACTION_ID, KEY_AGENT_TECHNOLOGY, KEY_AGENT_VERSION, KEY_APPLICATION_ID,
    KEY_APPLICATION_NAME, KEY_APPLICATION_VERSION, KEY_BYTES_RECEIVED, KEY_BYTES_SENT,
    KEY_CLIENT_IP, KEY_DEVICE_ID, KEY_DEVICE_MANUFACTURER, KEY_DEVICE_MODEL, KEY_DEVICE_OS,
    KEY_END_SEQUENCE, KEY_ERROR_CODE, KEY_ERROR_REASON, KEY_ERROR_STACKTRACE, KEY_EVENT_TYPE,
    KEY_NAME, KEY_PARENT_ACTION_ID, KEY_PLATFORM_TYPE, KEY_PROTOCOL_VERSION, KEY_RESPONSE_CODE,
    KEY_SESSION_NUMBER, KEY_SESSION_START_TIME, KEY_START_SEQUENCE, KEY_TIME_0, KEY_TIME_1,
    KEY_TRANSMISSION_TIME, KEY_VALUE, PLATFORM_TYPE, PROTOCOL_VERSION,
};

/// Reserved for the chunk prefix when budgeting one beacon request.
const PREFIX_RESERVE: usize = 1024;

/// Serializes one session's reports into cache records and transmits them.
///
/// Every record is a `&`-delimited `key=value` string; writes honor the
/// master capture switch and the error/crash capture switches from the
/// current server settings.
pub struct Beacon {
    session_id: i32,
    session_start_time: i64,
    client_ip: Option<String>,
    basic_data: String,
    cache: Arc<BeaconCache>,
    settings: Arc<SettingsStore>,
    clock: Arc<dyn TimingProvider>,
    sequence: AtomicI32,
    next_action_id: AtomicI32,
}

impl Beacon {
    pub fn new(
        session_id: i32,
        client_ip: Option<String>,
        cfg: &AgentConfig,
        cache: Arc<BeaconCache>,
        settings: Arc<SettingsStore>,
        clock: Arc<dyn TimingProvider>,
    ) -> Self {
        let client_ip = client_ip.filter(|ip| {
            let valid = ip.parse::<IpAddr>().is_ok();
            if !valid {
                warn!(session = session_id, ip, "invalid client ip, dropping");
            }
            valid
        });

        let session_start_time = clock.now_millis();
        let basic_data = Self::build_basic_data(session_id, client_ip.as_deref(), cfg);

        Self {
            session_id,
            session_start_time,
            client_ip,
            basic_data,
            cache,
            settings,
            clock,
            sequence: AtomicI32::new(0),
            next_action_id: AtomicI32::new(0),
        }
    }

    fn build_basic_data(session_id: i32, client_ip: Option<&str>, cfg: &AgentConfig) -> String {
        let mut data = String::with_capacity(256);

        append_int_pair(&mut data, KEY_PROTOCOL_VERSION, i64::from(PROTOCOL_VERSION));
        append_pair(&mut data, KEY_AGENT_VERSION, AGENT_VERSION);
        append_pair(&mut data, KEY_APPLICATION_ID, &cfg.application_id);
        append_pair(&mut data, KEY_APPLICATION_NAME, &cfg.application_name);
        if !cfg.application_version.is_empty() {
            append_pair(&mut data, KEY_APPLICATION_VERSION, &cfg.application_version);
        }
        append_int_pair(&mut data, KEY_PLATFORM_TYPE, i64::from(PLATFORM_TYPE));
        append_pair(&mut data, KEY_AGENT_TECHNOLOGY, AGENT_TECHNOLOGY);

        append_int_pair(&mut data, KEY_DEVICE_ID, cfg.device_id);
        append_int_pair(&mut data, KEY_SESSION_NUMBER, i64::from(session_id));
        append_pair(&mut data, KEY_CLIENT_IP, client_ip.unwrap_or(""));

        if !cfg.operating_system.is_empty() {
            append_pair(&mut data, KEY_DEVICE_OS, &cfg.operating_system);
        }
        if !cfg.manufacturer.is_empty() {
            append_pair(&mut data, KEY_DEVICE_MANUFACTURER, &cfg.manufacturer);
        }
        if !cfg.model_id.is_empty() {
            append_pair(&mut data, KEY_DEVICE_MODEL, &cfg.model_id);
        }

        data
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn start_time(&self) -> i64 {
        self.session_start_time
    }

    pub fn current_timestamp(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Next record sequence number, starting at 1.
    pub fn create_sequence_number(&self) -> i32 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Next action identifier, starting at 1.
    pub fn create_action_id(&self) -> i32 {
        self.next_action_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn time_since_session_start(&self, timestamp: i64) -> i64 {
        timestamp - self.session_start_time
    }

    /// Chunk prefix: session identity plus fresh transmission timestamps.
    fn build_prefix(&self) -> String {
        let mut prefix = self.basic_data.clone();
        append_int_pair(&mut prefix, KEY_SESSION_START_TIME, self.session_start_time);
        append_int_pair(&mut prefix, KEY_TRANSMISSION_TIME, self.clock.now_millis());
        prefix
    }

    fn basic_event_data(&self, kind: EventKind, name: Option<&str>) -> String {
        let mut data = String::with_capacity(128);
        append_int_pair(&mut data, KEY_EVENT_TYPE, kind as i64);
        if let Some(name) = name {
            if !name.is_empty() {
                append_pair(&mut data, KEY_NAME, truncate_name(name));
            }
        }
        data
    }

    fn add_event_record(&self, timestamp: i64, data: &str) {
        if self.settings.is_capture() {
            self.cache.add_event_data(self.session_id, timestamp, data);
        }
    }

    fn add_action_record(&self, timestamp: i64, data: &str) {
        if self.settings.is_capture() {
            self.cache.add_action_data(self.session_id, timestamp, data);
        }
    }

    /// Serializes a completed action into the action lane.
    #[allow(clippy::too_many_arguments)]
    pub fn add_action(
        &self,
        name: &str,
        action_id: i32,
        parent_action_id: i32,
        start_sequence: i32,
        start_time: i64,
        end_time: i64,
    ) {
        let mut data = self.basic_event_data(EventKind::Action, Some(name));

        append_int_pair(&mut data, KEY_ACTION_ID, i64::from(action_id));
        append_int_pair(&mut data, KEY_PARENT_ACTION_ID, i64::from(parent_action_id));
        append_int_pair(&mut data, KEY_START_SEQUENCE, i64::from(start_sequence));
        append_int_pair(&mut data, KEY_TIME_0, self.time_since_session_start(start_time));
        append_int_pair(
            &mut data,
            KEY_END_SEQUENCE,
            i64::from(self.create_sequence_number()),
        );
        append_int_pair(&mut data, KEY_TIME_1, end_time - start_time);

        self.add_action_record(start_time, &data);
    }

    /// Serializes the session-end event.
    pub fn add_session_end(&self, end_time: i64) {
        let mut data = self.basic_event_data(EventKind::SessionEnd, None);

        append_int_pair(&mut data, KEY_PARENT_ACTION_ID, 0);
        append_int_pair(
            &mut data,
            KEY_START_SEQUENCE,
            i64::from(self.create_sequence_number()),
        );
        append_int_pair(&mut data, KEY_TIME_0, self.time_since_session_start(end_time));

        self.add_event_record(end_time, &data);
    }

    fn build_event(&self, kind: EventKind, name: &str, parent_action_id: i32) -> (String, i64) {
        let timestamp = self.clock.now_millis();
        let mut data = self.basic_event_data(kind, Some(name));

        append_int_pair(&mut data, KEY_PARENT_ACTION_ID, i64::from(parent_action_id));
        append_int_pair(
            &mut data,
            KEY_START_SEQUENCE,
            i64::from(self.create_sequence_number()),
        );
        append_int_pair(&mut data, KEY_TIME_0, self.time_since_session_start(timestamp));

        (data, timestamp)
    }

    /// Serializes a named event.
    pub fn report_event(&self, parent_action_id: i32, name: &str) {
        let (data, timestamp) = self.build_event(EventKind::NamedEvent, name, parent_action_id);
        self.add_event_record(timestamp, &data);
    }

    /// Serializes an integer value report.
    pub fn report_value_int(&self, parent_action_id: i32, name: &str, value: i32) {
        let (mut data, timestamp) = self.build_event(EventKind::ValueInt, name, parent_action_id);
        append_int_pair(&mut data, KEY_VALUE, i64::from(value));
        self.add_event_record(timestamp, &data);
    }

    /// Serializes a floating point value report.
    pub fn report_value_double(&self, parent_action_id: i32, name: &str, value: f64) {
        let (mut data, timestamp) =
            self.build_event(EventKind::ValueDouble, name, parent_action_id);
        crate::protocol::append_double_pair(&mut data, KEY_VALUE, value);
        self.add_event_record(timestamp, &data);
    }

    /// Serializes a string value report.
    pub fn report_value_string(&self, parent_action_id: i32, name: &str, value: &str) {
        let (mut data, timestamp) =
            self.build_event(EventKind::ValueString, name, parent_action_id);
        append_pair(&mut data, KEY_VALUE, value);
        self.add_event_record(timestamp, &data);
    }

    /// Serializes an error report. Dropped when error capturing is off.
    pub fn report_error(&self, parent_action_id: i32, name: &str, code: i32, reason: &str) {
        if !self.settings.snapshot().capture_errors {
            return;
        }

        let (mut data, timestamp) = self.build_event(EventKind::Error, name, parent_action_id);
        append_int_pair(&mut data, KEY_ERROR_CODE, i64::from(code));
        if !reason.is_empty() {
            append_pair(&mut data, KEY_ERROR_REASON, reason);
        }
        self.add_event_record(timestamp, &data);
    }

    /// Serializes a crash report. Dropped when crash capturing is off.
    pub fn report_crash(&self, name: &str, reason: &str, stacktrace: &str) {
        if !self.settings.snapshot().capture_crashes {
            return;
        }

        let (mut data, timestamp) = self.build_event(EventKind::Crash, name, 0);
        append_pair(&mut data, KEY_ERROR_REASON, reason);
        append_pair(&mut data, KEY_ERROR_STACKTRACE, stacktrace);
        self.add_event_record(timestamp, &data);
    }

    /// Serializes a user identification event.
    pub fn identify_user(&self, user_tag: &str) {
        let (data, timestamp) = self.build_event(EventKind::IdentifyUser, user_tag, 0);
        self.add_event_record(timestamp, &data);
    }

    /// Serializes a completed web-request trace.
    #[allow(clippy::too_many_arguments)]
    pub fn add_web_request(
        &self,
        parent_action_id: i32,
        url: &str,
        start_sequence: i32,
        start_time: i64,
        end_time: i64,
        bytes_sent: i64,
        bytes_received: i64,
        response_code: i32,
    ) {
        let mut data = self.basic_event_data(EventKind::WebRequest, Some(url));

        append_int_pair(&mut data, KEY_PARENT_ACTION_ID, i64::from(parent_action_id));
        append_int_pair(&mut data, KEY_START_SEQUENCE, i64::from(start_sequence));
        append_int_pair(&mut data, KEY_TIME_0, self.time_since_session_start(start_time));
        append_int_pair(
            &mut data,
            KEY_END_SEQUENCE,
            i64::from(self.create_sequence_number()),
        );
        append_int_pair(&mut data, KEY_TIME_1, end_time - start_time);
        if bytes_sent >= 0 {
            append_int_pair(&mut data, KEY_BYTES_SENT, bytes_sent);
        }
        if bytes_received >= 0 {
            append_int_pair(&mut data, KEY_BYTES_RECEIVED, bytes_received);
        }
        if response_code >= 0 {
            append_int_pair(&mut data, KEY_RESPONSE_CODE, i64::from(response_code));
        }

        self.add_event_record(start_time, &data);
    }

    /// Transmits all pending records, one bounded chunk per request.
    ///
    /// 2xx acknowledges the in-flight chunk; 429/5xx and transport errors
    /// restore it and stop; other rejections drop it and continue. Returns
    /// the last response observed, if any.
    pub async fn send<C: BeaconTransport>(&self, transport: &C) -> Option<StatusResponse> {
        let max_beacon_size = self.settings.snapshot().max_beacon_size.max(0) as usize;
        let max_chunk_size = max_beacon_size.saturating_sub(PREFIX_RESERVE).max(1);
        let mut last_response = None;

        loop {
            // The prefix is rebuilt per chunk for fresh transmission timestamps.
            let prefix = self.build_prefix();
            let chunk =
                self.cache
                    .get_next_beacon_chunk(self.session_id, &prefix, max_chunk_size, '&');
            if chunk.is_empty() {
                return last_response;
            }

            match transport
                .send_beacon_request(self.client_ip.as_deref(), &chunk)
                .await
            {
                Ok(response) if response.is_success() => {
                    self.cache.remove_chunked_data(self.session_id);
                    last_response = Some(response);
                }
                Ok(response) if response.is_retryable() => {
                    warn!(
                        session = self.session_id,
                        code = response.response_code,
                        "beacon rejected, keeping chunk for retry",
                    );
                    self.cache.reset_chunked_data(self.session_id);
                    return Some(response);
                }
                Ok(response) => {
                    warn!(
                        session = self.session_id,
                        code = response.response_code,
                        "beacon rejected, dropping chunk",
                    );
                    self.cache.remove_chunked_data(self.session_id);
                    last_response = Some(response);
                }
                Err(e) => {
                    warn!(session = self.session_id, error = %e, "beacon request failed");
                    self.cache.reset_chunked_data(self.session_id);
                    return last_response;
                }
            }
        }
    }

    /// Whether no pending records remain for this session.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty(self.session_id)
    }

    /// Drops all cached data for this session.
    pub fn clear_data(&self) {
        self.cache.delete_cache_entry(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};

    use crate::protocol::StatusResponse;

    use super::*;

    struct TestClock(AtomicI64);

    impl TimingProvider for TestClock {
        fn now_millis(&self) -> i64 {
            self.0.fetch_add(1, Ordering::Relaxed)
        }
    }

    struct Fixture {
        cache: Arc<BeaconCache>,
        settings: Arc<SettingsStore>,
        beacon: Beacon,
    }

    fn fixture_with_ip(client_ip: Option<&str>) -> Fixture {
        let cfg = AgentConfig {
            endpoint_url: "https://ingest.example.com/collect".to_string(),
            application_id: "app/1".to_string(),
            application_name: "demo app".to_string(),
            application_version: "2.1".to_string(),
            device_id: 77,
            operating_system: "linux".to_string(),
            ..Default::default()
        };
        let clock: Arc<dyn TimingProvider> = Arc::new(TestClock(AtomicI64::new(10_000)));
        let cache = Arc::new(BeaconCache::new(Arc::clone(&clock)));
        let settings = Arc::new(SettingsStore::new(&cfg));
        let beacon = Beacon::new(
            17,
            client_ip.map(str::to_string),
            &cfg,
            Arc::clone(&cache),
            Arc::clone(&settings),
            clock,
        );

        Fixture {
            cache,
            settings,
            beacon,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_ip(None)
    }

    fn pending_chunk(fixture: &Fixture) -> String {
        fixture.cache.get_next_beacon_chunk(17, "", 64 * 1024, '&')
    }

    #[test]
    fn test_prefix_carries_session_identity() {
        let fixture = fixture_with_ip(Some("10.0.0.1"));
        let prefix = fixture.beacon.build_prefix();

        assert!(prefix.starts_with("vv=3&va="));
        assert!(prefix.contains("&ap=app%2F1&"));
        assert!(prefix.contains("&an=demo%20app&"));
        assert!(prefix.contains("&vn=2.1&"));
        assert!(prefix.contains("&tt=rust&"));
        assert!(prefix.contains("&vi=77&"));
        assert!(prefix.contains("&sn=17&"));
        assert!(prefix.contains("&ip=10.0.0.1&"));
        assert!(prefix.contains("&os=linux&"));
        assert!(prefix.contains(&format!("&tv={}&", fixture.beacon.start_time())));
        assert!(prefix.contains("&tx="));
    }

    #[test]
    fn test_invalid_client_ip_is_dropped() {
        let fixture = fixture_with_ip(Some("not-an-ip"));
        assert!(fixture.beacon.build_prefix().contains("&ip=&"));
    }

    #[test]
    fn test_report_event_record_layout() {
        let fixture = fixture();
        fixture.beacon.report_event(3, "click");

        let chunk = pending_chunk(&fixture);
        assert!(chunk.contains("et=10&na=click&pa=3&s0=1&t0="));
    }

    #[test]
    fn test_report_values() {
        let fixture = fixture();
        fixture.beacon.report_value_int(1, "count", 42);
        fixture.beacon.report_value_double(1, "ratio", 0.5);
        fixture.beacon.report_value_string(1, "label", "a b");

        let chunk = pending_chunk(&fixture);
        assert!(chunk.contains("et=12&na=count&"));
        assert!(chunk.contains("vl=42"));
        assert!(chunk.contains("et=13&na=ratio&"));
        assert!(chunk.contains("vl=0.5"));
        assert!(chunk.contains("et=11&na=label&"));
        assert!(chunk.contains("vl=a%20b"));
    }

    #[test]
    fn test_sequence_numbers_increment() {
        let fixture = fixture();
        fixture.beacon.report_event(0, "one");
        fixture.beacon.report_event(0, "two");

        let chunk = pending_chunk(&fixture);
        assert!(chunk.contains("na=one&pa=0&s0=1&"));
        assert!(chunk.contains("na=two&pa=0&s0=2&"));
    }

    #[test]
    fn test_add_action_uses_action_lane_and_end_sequence() {
        let fixture = fixture();
        let start = fixture.beacon.current_timestamp();
        let start_seq = fixture.beacon.create_sequence_number();
        fixture.beacon.add_action("load", 1, 0, start_seq, start, start + 5);

        let chunk = pending_chunk(&fixture);
        assert!(chunk.contains("et=1&na=load&ca=1&pa=0&s0=1&"));
        assert!(chunk.contains("&s1=2&t1=5"));
    }

    #[test]
    fn test_session_end_record() {
        let fixture = fixture();
        let end = fixture.beacon.current_timestamp();
        fixture.beacon.add_session_end(end);

        let chunk = pending_chunk(&fixture);
        assert!(chunk.contains("et=19&pa=0&s0=1&t0="));
    }

    #[test]
    fn test_capture_off_drops_all_records() {
        let fixture = fixture();
        fixture.settings.disable_capture();

        fixture.beacon.report_event(0, "click");
        fixture.beacon.add_session_end(1);

        assert!(fixture.beacon.is_empty());
    }

    #[test]
    fn test_error_capture_switch() {
        let fixture = fixture();
        fixture
            .settings
            .update_settings(Some(&StatusResponse::new(200, "cp=1&er=0", HashMap::new())));

        fixture.beacon.report_error(1, "boom", 500, "broken");
        assert!(fixture.beacon.is_empty());

        fixture
            .settings
            .update_settings(Some(&StatusResponse::new(200, "cp=1&er=1", HashMap::new())));
        fixture.beacon.report_error(1, "boom", 500, "broken");

        let chunk = pending_chunk(&fixture);
        assert!(chunk.contains("et=40&na=boom&"));
        assert!(chunk.contains("ev=500&rs=broken"));
    }

    #[test]
    fn test_crash_capture_switch() {
        let fixture = fixture();
        fixture
            .settings
            .update_settings(Some(&StatusResponse::new(200, "cp=1&cr=0", HashMap::new())));

        fixture.beacon.report_crash("crash", "reason", "trace");
        assert!(fixture.beacon.is_empty());

        fixture
            .settings
            .update_settings(Some(&StatusResponse::new(200, "cp=1&cr=1", HashMap::new())));
        fixture.beacon.report_crash("crash", "reason", "trace");

        let chunk = pending_chunk(&fixture);
        assert!(chunk.contains("et=50&na=crash&"));
        assert!(chunk.contains("rs=reason&st=trace"));
    }

    #[test]
    fn test_web_request_record() {
        let fixture = fixture();
        let start = fixture.beacon.current_timestamp();
        let start_seq = fixture.beacon.create_sequence_number();
        fixture
            .beacon
            .add_web_request(2, "https://api.example.com/v1?q=x", start_seq, start, start + 30, 120, 4096, 200);

        let chunk = pending_chunk(&fixture);
        assert!(chunk.contains("et=30&na=https%3A%2F%2Fapi.example.com%2Fv1%3Fq%3Dx&pa=2&"));
        assert!(chunk.contains("&t1=30&bs=120&br=4096&rc=200"));
    }

    #[test]
    fn test_identify_user_record() {
        let fixture = fixture();
        fixture.beacon.identify_user("user-1");

        let chunk = pending_chunk(&fixture);
        assert!(chunk.contains("et=60&na=user-1&pa=0&"));
    }
}
