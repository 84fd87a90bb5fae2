use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tracing::debug;

use super::{percent_encode, StatusResponse, AGENT_TECHNOLOGY, AGENT_VERSION, PLATFORM_TYPE};

/// Header carrying the reporting client's IP address on beacon requests.
const CLIENT_IP_HEADER: &str = "x-client-ip";

/// Transport used by the sending worker.
///
/// Implementations must expose the response code, body, and headers with
/// lowercased names through [`StatusResponse`]. Tests substitute stubs.
pub trait BeaconTransport: Send + Sync {
    /// Requests the current server-side capture settings.
    fn send_status_request(&self) -> impl Future<Output = Result<StatusResponse>> + Send;

    /// Announces a new session and requests its beacon configuration.
    fn send_new_session_request(&self) -> impl Future<Output = Result<StatusResponse>> + Send;

    /// Posts one beacon chunk.
    fn send_beacon_request(
        &self,
        client_ip: Option<&str>,
        body: &str,
    ) -> impl Future<Output = Result<StatusResponse>> + Send;
}

/// Request target derived from the endpoint URL and the current server id.
///
/// Rebuilt by the settings store whenever a status response changes the
/// server id; readers always see a complete snapshot.
#[derive(Debug)]
pub struct HttpEndpoint {
    server_id: i32,
    monitor_url: String,
    new_session_url: String,
}

impl HttpEndpoint {
    pub fn new(base_url: &str, server_id: i32, application_id: &str) -> Self {
        let monitor_url = format!(
            "{}?type=m&srvid={}&app={}&va={}&pt={}&tt={}",
            base_url,
            server_id,
            percent_encode(application_id),
            percent_encode(AGENT_VERSION),
            PLATFORM_TYPE,
            AGENT_TECHNOLOGY,
        );
        let new_session_url = format!("{monitor_url}&ns=1");

        Self {
            server_id,
            monitor_url,
            new_session_url,
        }
    }

    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    pub fn monitor_url(&self) -> &str {
        &self.monitor_url
    }

    pub fn new_session_url(&self) -> &str {
        &self.new_session_url
    }
}

/// HTTP transport backed by `reqwest`.
pub struct HttpClient {
    http: reqwest::Client,
    endpoint: Arc<ArcSwap<HttpEndpoint>>,
}

impl HttpClient {
    /// Creates a transport with a per-request timeout.
    ///
    /// The endpoint cell is shared with the settings store so server-id
    /// changes take effect on the next request.
    pub fn new(request_timeout: Duration, endpoint: Arc<ArcSwap<HttpEndpoint>>) -> Result<Self> {
        let timeout = if request_timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            request_timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self { http, endpoint })
    }

    async fn execute(&self, request: reqwest::RequestBuilder, kind: &str) -> Result<StatusResponse> {
        let response = request
            .send()
            .await
            .with_context(|| format!("sending {kind} request"))?;

        let code = i32::from(response.status().as_u16());

        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_ascii_lowercase())
                    .or_default()
                    .push(value.to_string());
            }
        }

        let body = response.text().await.unwrap_or_default();

        debug!(kind, code, "request completed");

        Ok(StatusResponse::new(code, &body, headers))
    }
}

impl BeaconTransport for HttpClient {
    async fn send_status_request(&self) -> Result<StatusResponse> {
        let endpoint = self.endpoint.load_full();
        self.execute(self.http.get(endpoint.monitor_url()), "status")
            .await
    }

    async fn send_new_session_request(&self) -> Result<StatusResponse> {
        let endpoint = self.endpoint.load_full();
        self.execute(self.http.get(endpoint.new_session_url()), "new session")
            .await
    }

    async fn send_beacon_request(
        &self,
        client_ip: Option<&str>,
        body: &str,
    ) -> Result<StatusResponse> {
        let endpoint = self.endpoint.load_full();
        let mut request = self
            .http
            .post(endpoint.monitor_url())
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.to_string());

        if let Some(ip) = client_ip {
            request = request.header(CLIENT_IP_HEADER, ip);
        }

        self.execute(request, "beacon").await
    }
}
