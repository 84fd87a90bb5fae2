pub mod http;

use std::collections::HashMap;
use std::time::Duration;

/// Version of the beacon wire protocol.
pub const PROTOCOL_VERSION: i32 = 3;

/// Agent version reported in beacons and monitor URLs (set at build time).
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Platform type tag sent with every beacon.
pub const PLATFORM_TYPE: i32 = 1;

/// Agent technology tag sent with every beacon.
pub const AGENT_TECHNOLOGY: &str = "rust";

/// Names longer than this are truncated before serialization.
pub const MAX_NAME_LEN: usize = 250;

/// Fallback `Retry-After` when a 429 response carries no usable header.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(600);

/// Record type discriminator serialized into every event/action record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EventKind {
    Action = 1,
    NamedEvent = 10,
    ValueString = 11,
    ValueInt = 12,
    ValueDouble = 13,
    SessionEnd = 19,
    WebRequest = 30,
    Error = 40,
    Crash = 50,
    IdentifyUser = 60,
}

// --- Beacon keys ---

pub const KEY_PROTOCOL_VERSION: &str = "vv";
pub const KEY_AGENT_VERSION: &str = "va";
pub const KEY_APPLICATION_ID: &str = "ap";
pub const KEY_APPLICATION_NAME: &str = "an";
pub const KEY_APPLICATION_VERSION: &str = "vn";
pub const KEY_PLATFORM_TYPE: &str = "pt";
pub const KEY_AGENT_TECHNOLOGY: &str = "tt";
pub const KEY_DEVICE_ID: &str = "vi";
pub const KEY_SESSION_NUMBER: &str = "sn";
pub const KEY_CLIENT_IP: &str = "ip";
pub const KEY_DEVICE_OS: &str = "os";
pub const KEY_DEVICE_MANUFACTURER: &str = "mf";
pub const KEY_DEVICE_MODEL: &str = "md";
pub const KEY_SESSION_START_TIME: &str = "tv";
pub const KEY_TRANSMISSION_TIME: &str = "tx";
pub const KEY_EVENT_TYPE: &str = "et";
pub const KEY_NAME: &str = "na";
pub const KEY_ACTION_ID: &str = "ca";
pub const KEY_PARENT_ACTION_ID: &str = "pa";
pub const KEY_START_SEQUENCE: &str = "s0";
pub const KEY_TIME_0: &str = "t0";
pub const KEY_END_SEQUENCE: &str = "s1";
pub const KEY_TIME_1: &str = "t1";
pub const KEY_VALUE: &str = "vl";
pub const KEY_ERROR_CODE: &str = "ev";
pub const KEY_ERROR_REASON: &str = "rs";
pub const KEY_ERROR_STACKTRACE: &str = "st";
pub const KEY_BYTES_SENT: &str = "bs";
pub const KEY_BYTES_RECEIVED: &str = "br";
pub const KEY_RESPONSE_CODE: &str = "rc";

// --- Percent encoding ---

/// Percent-encodes a value for inclusion in a beacon body or monitor URL.
///
/// Unreserved characters (RFC 3986 plus `_`) pass through; everything else,
/// including multi-byte UTF-8 sequences, is encoded byte-wise.
pub fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(hex_digit(byte >> 4));
            out.push(hex_digit(byte & 0x0f));
        }
    }
    out
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

fn hex_digit(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        _ => (b'A' + nibble - 10) as char,
    }
}

// --- Key=value pair building ---

fn append_key(out: &mut String, key: &str) {
    if !out.is_empty() {
        out.push('&');
    }
    out.push_str(key);
    out.push('=');
}

/// Appends `key=value` with a percent-encoded string value.
pub fn append_pair(out: &mut String, key: &str, value: &str) {
    append_key(out, key);
    out.push_str(&percent_encode(value));
}

/// Appends `key=value` with an integer value.
pub fn append_int_pair(out: &mut String, key: &str, value: i64) {
    append_key(out, key);
    out.push_str(&value.to_string());
}

/// Appends `key=value` with a floating point value.
pub fn append_double_pair(out: &mut String, key: &str, value: f64) {
    append_key(out, key);
    out.push_str(&value.to_string());
}

/// Truncates a reported name to the maximum serialized length.
///
/// Cuts on a char boundary at or below [`MAX_NAME_LEN`] bytes.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// --- Status responses ---

/// Parsed response to a status, new-session, or beacon request.
///
/// The body is a `&`-separated `key=value` list; `si` is the send interval
/// in seconds and `bm` the maximum beacon size in kilobytes, both normalized
/// here. Unset numeric fields stay `-1`.
#[derive(Debug, Clone)]
pub struct StatusResponse {
    pub response_code: i32,
    pub capture: bool,
    pub server_id: i32,
    pub send_interval_ms: i64,
    pub max_beacon_size: i32,
    pub capture_errors: bool,
    pub capture_crashes: bool,
    pub multiplicity: i32,
    /// Response headers, names lowercased by the transport.
    pub headers: HashMap<String, Vec<String>>,
}

impl StatusResponse {
    /// Parses a response from an HTTP status code, body, and headers.
    pub fn new(response_code: i32, body: &str, headers: HashMap<String, Vec<String>>) -> Self {
        let mut response = Self {
            response_code,
            capture: true,
            server_id: -1,
            send_interval_ms: -1,
            max_beacon_size: -1,
            capture_errors: true,
            capture_crashes: true,
            multiplicity: 1,
            headers,
        };

        for pair in body.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "cp" => response.capture = value == "1",
                "si" => {
                    if let Ok(seconds) = value.parse::<i64>() {
                        response.send_interval_ms = seconds.saturating_mul(1000);
                    }
                }
                "bm" => {
                    if let Ok(kilobytes) = value.parse::<i32>() {
                        response.max_beacon_size = kilobytes.saturating_mul(1024);
                    }
                }
                "id" => {
                    if let Ok(id) = value.parse::<i32>() {
                        response.server_id = id;
                    }
                }
                "er" => response.capture_errors = value == "1",
                "cr" => response.capture_crashes = value == "1",
                "mp" => {
                    if let Ok(multiplicity) = value.parse::<i32>() {
                        response.multiplicity = multiplicity;
                    }
                }
                _ => {}
            }
        }

        response
    }

    /// Whether the response code is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.response_code)
    }

    /// Whether the server throttled the request (HTTP 429).
    pub fn is_too_many_requests(&self) -> bool {
        self.response_code == 429
    }

    /// Whether a retry may succeed without changing the request (429 or 5xx).
    pub fn is_retryable(&self) -> bool {
        self.is_too_many_requests() || self.response_code >= 500
    }

    /// Server-requested minimum delay before the next request.
    ///
    /// Parsed from the `retry-after` header in seconds; falls back to
    /// [`DEFAULT_RETRY_AFTER`] when the header is absent or malformed.
    pub fn retry_after(&self) -> Duration {
        self.headers
            .get("retry-after")
            .and_then(|values| values.first())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encode_passes_unreserved() {
        assert_eq!(percent_encode("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
    }

    #[test]
    fn test_percent_encode_reserved_characters() {
        assert_eq!(percent_encode("a b&c=d"), "a%20b%26c%3Dd");
        assert_eq!(percent_encode("100%"), "100%25");
    }

    #[test]
    fn test_percent_encode_multibyte_utf8() {
        assert_eq!(percent_encode("ö"), "%C3%B6");
    }

    #[test]
    fn test_append_pair_delimits_with_ampersand() {
        let mut out = String::new();
        append_pair(&mut out, "na", "click me");
        append_int_pair(&mut out, "t0", 42);
        assert_eq!(out, "na=click%20me&t0=42");
    }

    #[test]
    fn test_truncate_name_respects_char_boundary() {
        let short = "event";
        assert_eq!(truncate_name(short), short);

        let long = "ä".repeat(200);
        let truncated = truncate_name(&long);
        assert!(truncated.len() <= MAX_NAME_LEN);
        assert!(truncated.chars().all(|c| c == 'ä'));
    }

    #[test]
    fn test_status_response_parses_full_body() {
        let response = StatusResponse::new(
            200,
            "type=m&cp=1&si=120&bm=30&id=5&er=0&cr=1&mp=3",
            HashMap::new(),
        );
        assert_eq!(response.response_code, 200);
        assert!(response.capture);
        assert_eq!(response.send_interval_ms, 120_000);
        assert_eq!(response.max_beacon_size, 30 * 1024);
        assert_eq!(response.server_id, 5);
        assert!(!response.capture_errors);
        assert!(response.capture_crashes);
        assert_eq!(response.multiplicity, 3);
    }

    #[test]
    fn test_status_response_defaults_on_empty_body() {
        let response = StatusResponse::new(200, "", HashMap::new());
        assert!(response.capture);
        assert_eq!(response.server_id, -1);
        assert_eq!(response.send_interval_ms, -1);
        assert_eq!(response.max_beacon_size, -1);
        assert_eq!(response.multiplicity, 1);
    }

    #[test]
    fn test_status_response_ignores_malformed_pairs() {
        let response = StatusResponse::new(200, "cp&si=abc&id=2", HashMap::new());
        assert!(response.capture);
        assert_eq!(response.send_interval_ms, -1);
        assert_eq!(response.server_id, 2);
    }

    #[test]
    fn test_retry_after_from_header() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), vec!["123".to_string()]);
        let response = StatusResponse::new(429, "", headers);
        assert_eq!(response.retry_after(), Duration::from_secs(123));
    }

    #[test]
    fn test_retry_after_defaults_when_absent() {
        let response = StatusResponse::new(429, "", HashMap::new());
        assert_eq!(response.retry_after(), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn test_retry_after_defaults_when_malformed() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), vec!["soon".to_string()]);
        let response = StatusResponse::new(429, "", headers);
        assert_eq!(response.retry_after(), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn test_response_classification() {
        assert!(StatusResponse::new(200, "", HashMap::new()).is_success());
        assert!(StatusResponse::new(204, "", HashMap::new()).is_success());
        assert!(!StatusResponse::new(404, "", HashMap::new()).is_success());
        assert!(StatusResponse::new(429, "", HashMap::new()).is_too_many_requests());
        assert!(StatusResponse::new(429, "", HashMap::new()).is_retryable());
        assert!(StatusResponse::new(503, "", HashMap::new()).is_retryable());
        assert!(!StatusResponse::new(400, "", HashMap::new()).is_retryable());
    }
}
