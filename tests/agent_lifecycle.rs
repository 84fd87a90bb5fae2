use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use beaconkit::protocol::http::BeaconTransport;
use beaconkit::protocol::StatusResponse;
use beaconkit::{Agent, AgentConfig, Session};

/// Transport with a scripted status body, recording every beacon body.
#[derive(Clone)]
struct RecordingTransport {
    status_body: &'static str,
    fail_status: bool,
    beacon_bodies: Arc<Mutex<Vec<String>>>,
}

impl RecordingTransport {
    fn with_status(status_body: &'static str) -> Self {
        Self {
            status_body,
            fail_status: false,
            beacon_bodies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn unreachable() -> Self {
        Self {
            status_body: "",
            fail_status: true,
            beacon_bodies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn bodies(&self) -> Vec<String> {
        self.beacon_bodies.lock().expect("bodies lock").clone()
    }
}

impl BeaconTransport for RecordingTransport {
    async fn send_status_request(&self) -> Result<StatusResponse> {
        if self.fail_status {
            bail!("connection refused");
        }
        Ok(StatusResponse::new(200, self.status_body, HashMap::new()))
    }

    async fn send_new_session_request(&self) -> Result<StatusResponse> {
        Ok(StatusResponse::new(200, "cp=1&mp=1", HashMap::new()))
    }

    async fn send_beacon_request(
        &self,
        _client_ip: Option<&str>,
        body: &str,
    ) -> Result<StatusResponse> {
        self.beacon_bodies
            .lock()
            .expect("bodies lock")
            .push(body.to_string());
        Ok(StatusResponse::new(200, "", HashMap::new()))
    }
}

fn test_config() -> AgentConfig {
    AgentConfig {
        endpoint_url: "https://ingest.example.com/collect".to_string(),
        application_id: "demo-app".to_string(),
        application_name: "demo".to_string(),
        device_id: 4242,
        ..Default::default()
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[tokio::test(start_paused = true)]
async fn reported_data_is_flushed_on_shutdown() {
    init_logging();

    let transport = RecordingTransport::with_status("cp=1&si=120&id=2");
    let recorder = transport.clone();
    let agent = Agent::with_transport(test_config(), transport).expect("agent starts");

    assert!(agent.wait_for_init().await);

    let session = agent.create_session(Some("192.168.0.10"));

    // Let the worker pick the session up and attach its beacon
    // configuration before anything is reported.
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    let action = session.enter_action("checkout");
    action
        .report_event("cart_opened")
        .report_value_int("items", 3)
        .report_error("validation", 17, "missing field");
    let mut tracer = action.trace_web_request("https://api.example.com/cart");
    tracer.set_bytes_sent(512).set_bytes_received(2048);
    tracer.set_response_code(200);
    tracer.stop();
    action.leave();
    session.identify_user("user-77");
    session.end();

    agent.shutdown().await;

    let bodies = recorder.bodies();
    assert!(!bodies.is_empty(), "expected at least one beacon");

    let all = bodies.join("&");
    // Session identity travels in the prefix.
    assert!(all.contains("ap=demo-app"));
    assert!(all.contains("vi=4242"));
    // Action, event, value, error, web request, user tag, session end.
    assert!(all.contains("et=1&na=checkout"));
    assert!(all.contains("et=10&na=cart_opened"));
    assert!(all.contains("et=12&na=items"));
    assert!(all.contains("et=40&na=validation"));
    assert!(all.contains("et=30&na=https%3A%2F%2Fapi.example.com%2Fcart"));
    assert!(all.contains("et=60&na=user-77"));
    assert!(all.contains("et=19"));
}

#[tokio::test(start_paused = true)]
async fn failed_init_disables_reporting_but_agent_survives() {
    init_logging();

    let transport = RecordingTransport::unreachable();
    let recorder = transport.clone();
    let agent = Agent::with_transport(test_config(), transport).expect("agent starts");

    assert!(!agent.wait_for_init().await);

    // Reporting still works API-wise, nothing is transmitted.
    let session = agent.create_session(None);
    let action = session.enter_action("ignored");
    action.report_event("event");
    action.leave();
    session.end();

    agent.shutdown().await;
    assert!(recorder.bodies().is_empty());
}

#[tokio::test(start_paused = true)]
async fn server_side_capture_off_drops_all_data() {
    init_logging();

    let transport = RecordingTransport::with_status("cp=0");
    let recorder = transport.clone();
    let agent = Agent::with_transport(test_config(), transport).expect("agent starts");

    assert!(agent.wait_for_init().await);

    let session = agent.create_session(None);
    let action = session.enter_action("hidden");
    action.report_event("event");
    action.leave();
    session.end();

    agent.shutdown().await;
    assert!(recorder.bodies().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sessions_created_after_shutdown_are_inert() {
    init_logging();

    let transport = RecordingTransport::with_status("cp=1");
    let recorder = transport.clone();
    let agent = Agent::with_transport(test_config(), transport).expect("agent starts");
    agent.wait_for_init().await;
    agent.shutdown().await;

    let sent_before = recorder.bodies().len();

    let session = agent.create_session(None);
    assert!(matches!(session, Session::NoOp));
    let action = session.enter_action("late");
    action.report_event("event");
    action.leave();
    session.end();

    assert_eq!(recorder.bodies().len(), sent_before);
}
