use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::protocol::http::HttpEndpoint;
use crate::protocol::StatusResponse;

/// Send interval applied until a status response overrides it.
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(120);

/// Maximum beacon size in bytes until a status response overrides it.
pub const DEFAULT_MAX_BEACON_SIZE: i32 = 30 * 1024;

/// Static configuration for one agent instance.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Ingest endpoint URL beacons are shipped to.
    #[serde(default)]
    pub endpoint_url: String,

    /// Application identifier assigned by the ingest backend.
    #[serde(default)]
    pub application_id: String,

    /// Human-readable application name reported in beacons.
    #[serde(default)]
    pub application_name: String,

    /// Application version reported in beacons. Optional.
    #[serde(default)]
    pub application_version: String,

    /// Stable device/visitor identifier.
    #[serde(default)]
    pub device_id: i64,

    /// Operating system reported in beacons. Optional.
    #[serde(default)]
    pub operating_system: String,

    /// Device manufacturer reported in beacons. Optional.
    #[serde(default)]
    pub manufacturer: String,

    /// Device model reported in beacons. Optional.
    #[serde(default)]
    pub model_id: String,

    /// Server id used before the first status response assigns one. Default: 1.
    #[serde(default = "default_server_id")]
    pub default_server_id: i32,

    /// Per-request HTTP timeout. Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Beacon cache bounds.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Bounds for the in-memory beacon cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Records older than this are evicted regardless of cache size.
    /// Default: 105m.
    #[serde(default = "default_max_record_age", with = "humantime_serde")]
    pub max_record_age: Duration,

    /// Size-based eviction stops once the cache is at or below this bound.
    /// Default: 80 MiB.
    #[serde(default = "default_low_water_bytes")]
    pub low_water_bytes: u64,

    /// Size-based eviction starts once the cache exceeds this bound.
    /// Default: 100 MiB.
    #[serde(default = "default_high_water_bytes")]
    pub high_water_bytes: u64,
}

// --- Default value functions ---

fn default_server_id() -> i32 {
    1
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_record_age() -> Duration {
    Duration::from_secs(105 * 60)
}

fn default_low_water_bytes() -> u64 {
    80 * 1024 * 1024
}

fn default_high_water_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            application_id: String::new(),
            application_name: String::new(),
            application_version: String::new(),
            device_id: 0,
            operating_system: String::new(),
            manufacturer: String::new(),
            model_id: String::new(),
            default_server_id: default_server_id(),
            request_timeout: default_request_timeout(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_record_age: default_max_record_age(),
            low_water_bytes: default_low_water_bytes(),
            high_water_bytes: default_high_water_bytes(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: AgentConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_url.is_empty() {
            bail!("endpoint_url is required");
        }

        if self.application_id.is_empty() {
            bail!("application_id is required");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be positive");
        }

        if self.cache.high_water_bytes == 0 || self.cache.low_water_bytes == 0 {
            bail!("cache watermarks must be positive");
        }

        if self.cache.low_water_bytes >= self.cache.high_water_bytes {
            bail!("cache low_water_bytes must be below high_water_bytes");
        }

        Ok(())
    }
}

// --- Runtime server settings ---

/// Mutable runtime settings controlled by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub capture: bool,
    pub send_interval: Duration,
    pub max_beacon_size: i32,
    pub capture_errors: bool,
    pub capture_crashes: bool,
    pub server_id: i32,
}

/// Holds the current [`ServerSettings`] snapshot.
///
/// Reads are lock-free snapshot loads; writes go through `update_settings`
/// (or `disable_capture`) and are serialized by a mutex, so a reader sees
/// either the pre- or post-update snapshot, never a torn one.
pub struct SettingsStore {
    current: ArcSwap<ServerSettings>,
    endpoint: Arc<ArcSwap<HttpEndpoint>>,
    write_lock: parking_lot::Mutex<()>,
    endpoint_url: String,
    application_id: String,
    default_server_id: i32,
}

impl SettingsStore {
    pub fn new(cfg: &AgentConfig) -> Self {
        let settings = ServerSettings {
            capture: true,
            send_interval: DEFAULT_SEND_INTERVAL,
            max_beacon_size: DEFAULT_MAX_BEACON_SIZE,
            capture_errors: true,
            capture_crashes: true,
            server_id: cfg.default_server_id,
        };

        let endpoint = HttpEndpoint::new(
            &cfg.endpoint_url,
            cfg.default_server_id,
            &cfg.application_id,
        );

        Self {
            current: ArcSwap::from_pointee(settings),
            endpoint: Arc::new(ArcSwap::from_pointee(endpoint)),
            write_lock: parking_lot::Mutex::new(()),
            endpoint_url: cfg.endpoint_url.clone(),
            application_id: cfg.application_id.clone(),
            default_server_id: cfg.default_server_id,
        }
    }

    /// Current settings snapshot.
    pub fn snapshot(&self) -> Arc<ServerSettings> {
        self.current.load_full()
    }

    /// Whether capturing is currently enabled.
    pub fn is_capture(&self) -> bool {
        self.current.load().capture
    }

    /// Request-target cell shared with the HTTP transport.
    pub fn endpoint_cell(&self) -> Arc<ArcSwap<HttpEndpoint>> {
        Arc::clone(&self.endpoint)
    }

    /// Current request target.
    pub fn endpoint(&self) -> Arc<HttpEndpoint> {
        self.endpoint.load_full()
    }

    /// Turns the master capture switch off, leaving all other settings as
    /// they are.
    pub fn disable_capture(&self) {
        let _guard = self.write_lock.lock();
        let mut settings = (**self.current.load()).clone();
        settings.capture = false;
        self.current.store(Arc::new(settings));
    }

    /// Applies a status response.
    ///
    /// A missing response or a non-200 code only disables capture. A 200
    /// with capture off leaves every other field at its current value. A 200
    /// with capture on applies the transmitted fields, substituting defaults
    /// for unset (`-1`) values; a server-id change rebuilds the request
    /// target, since the monitor URL derives from it.
    pub fn update_settings(&self, response: Option<&StatusResponse>) {
        let _guard = self.write_lock.lock();

        let Some(response) = response.filter(|r| r.response_code == 200) else {
            let mut settings = (**self.current.load()).clone();
            settings.capture = false;
            self.current.store(Arc::new(settings));
            return;
        };

        let mut settings = (**self.current.load()).clone();
        settings.capture = response.capture;

        if !response.capture {
            self.current.store(Arc::new(settings));
            return;
        }

        let server_id = if response.server_id == -1 {
            self.default_server_id
        } else {
            response.server_id
        };
        if server_id != settings.server_id {
            settings.server_id = server_id;
            self.endpoint.store(Arc::new(HttpEndpoint::new(
                &self.endpoint_url,
                server_id,
                &self.application_id,
            )));
        }

        settings.send_interval = if response.send_interval_ms < 0 {
            DEFAULT_SEND_INTERVAL
        } else {
            Duration::from_millis(response.send_interval_ms as u64)
        };

        settings.max_beacon_size = if response.max_beacon_size < 0 {
            DEFAULT_MAX_BEACON_SIZE
        } else {
            response.max_beacon_size
        };

        settings.capture_errors = response.capture_errors;
        settings.capture_crashes = response.capture_crashes;

        self.current.store(Arc::new(settings));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn test_config() -> AgentConfig {
        AgentConfig {
            endpoint_url: "https://ingest.example.com/collect".to_string(),
            application_id: "app-1".to_string(),
            device_id: 42,
            ..Default::default()
        }
    }

    fn response(code: i32, body: &str) -> StatusResponse {
        StatusResponse::new(code, body, HashMap::new())
    }

    #[test]
    fn test_default_config_values() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.default_server_id, 1);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.cache.max_record_age, Duration::from_secs(105 * 60));
        assert_eq!(cfg.cache.low_water_bytes, 80 * 1024 * 1024);
        assert_eq!(cfg.cache.high_water_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn test_validation_missing_endpoint() {
        let cfg = AgentConfig {
            application_id: "app".to_string(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("endpoint_url"));
    }

    #[test]
    fn test_validation_missing_application_id() {
        let cfg = AgentConfig {
            endpoint_url: "https://ingest.example.com".to_string(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("application_id"));
    }

    #[test]
    fn test_validation_inverted_watermarks() {
        let mut cfg = test_config();
        cfg.cache.low_water_bytes = 1000;
        cfg.cache.high_water_bytes = 800;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("low_water_bytes"));

        cfg.cache.high_water_bytes = 2000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_update_settings_non_200_only_disables_capture() {
        let store = SettingsStore::new(&test_config());
        store.update_settings(Some(&response(200, "cp=1&si=120&id=1")));
        assert!(store.is_capture());

        store.update_settings(Some(&response(404, "")));

        let settings = store.snapshot();
        assert!(!settings.capture);
        assert_eq!(settings.server_id, 1);
        assert_eq!(settings.send_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_update_settings_missing_response_disables_capture() {
        let store = SettingsStore::new(&test_config());
        assert!(store.is_capture());

        store.update_settings(None);
        assert!(!store.snapshot().capture);
    }

    #[test]
    fn test_update_settings_capture_off_leaves_fields() {
        let store = SettingsStore::new(&test_config());
        store.update_settings(Some(&response(200, "cp=1&si=60&bm=10&id=3")));

        let before = store.snapshot();
        assert_eq!(before.send_interval, Duration::from_secs(60));
        assert_eq!(before.server_id, 3);

        store.update_settings(Some(&response(200, "cp=0&si=999&bm=99&id=9")));

        let after = store.snapshot();
        assert!(!after.capture);
        assert_eq!(after.send_interval, Duration::from_secs(60));
        assert_eq!(after.max_beacon_size, 10 * 1024);
        assert_eq!(after.server_id, 3);
    }

    #[test]
    fn test_update_settings_applies_defaults_for_unset_fields() {
        let store = SettingsStore::new(&test_config());

        store.update_settings(Some(&response(200, "cp=1&er=0&cr=1")));

        let settings = store.snapshot();
        assert!(settings.capture);
        assert_eq!(settings.server_id, 1);
        assert_eq!(settings.send_interval, DEFAULT_SEND_INTERVAL);
        assert_eq!(settings.max_beacon_size, DEFAULT_MAX_BEACON_SIZE);
        assert!(!settings.capture_errors);
        assert!(settings.capture_crashes);
    }

    #[test]
    fn test_server_id_change_rebuilds_endpoint() {
        let store = SettingsStore::new(&test_config());
        assert!(store.endpoint().monitor_url().contains("srvid=1"));

        store.update_settings(Some(&response(200, "cp=1&id=7")));

        let endpoint = store.endpoint();
        assert_eq!(endpoint.server_id(), 7);
        assert!(endpoint.monitor_url().contains("srvid=7"));
    }

    #[test]
    fn test_disable_capture_keeps_other_fields() {
        let store = SettingsStore::new(&test_config());
        store.update_settings(Some(&response(200, "cp=1&si=60")));

        store.disable_capture();

        let settings = store.snapshot();
        assert!(!settings.capture);
        assert_eq!(settings.send_interval, Duration::from_secs(60));
    }
}
