use std::time::Duration;

use tracing::{debug, info, warn};

use crate::protocol::http::BeaconTransport;
use crate::protocol::StatusResponse;
use crate::session::ServerBeaconConfig;

use super::SendingContext;

/// Pace of one CaptureOn cycle.
const CAPTURE_ON_CYCLE: Duration = Duration::from_secs(1);

/// Sleeps between initial status request retries.
const INIT_RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

/// States of the beacon sending worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendingState {
    Init,
    CaptureOn,
    CaptureOff,
    FlushSessions,
    Terminal,
}

impl SendingState {
    pub fn name(&self) -> &'static str {
        match self {
            SendingState::Init => "Init",
            SendingState::CaptureOn => "CaptureOn",
            SendingState::CaptureOff => "CaptureOff",
            SendingState::FlushSessions => "FlushSessions",
            SendingState::Terminal => "Terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SendingState::Terminal)
    }

    /// State entered when shutdown is requested while this state runs.
    pub fn shutdown_state(&self) -> SendingState {
        match self {
            SendingState::Init => SendingState::Terminal,
            SendingState::CaptureOn | SendingState::CaptureOff => SendingState::FlushSessions,
            SendingState::FlushSessions | SendingState::Terminal => SendingState::Terminal,
        }
    }

    /// Runs one cycle of this state; transitions via
    /// [`SendingContext::set_next_state`].
    pub async fn execute<C: BeaconTransport>(&self, ctx: &mut SendingContext<C>) {
        match self {
            SendingState::Init => execute_init(ctx).await,
            SendingState::CaptureOn => execute_capture_on(ctx).await,
            SendingState::CaptureOff => execute_capture_off(ctx).await,
            SendingState::FlushSessions => execute_flush_sessions(ctx).await,
            SendingState::Terminal => {}
        }
    }
}

/// Initial status request with a bounded retry ladder.
///
/// Signals the init outcome exactly once on exit. Failure is not fatal: the
/// worker moves to CaptureOff and the host application keeps running with
/// reporting disabled. Shutdown during Init skips the flush.
async fn execute_init<C: BeaconTransport>(ctx: &mut SendingContext<C>) {
    let mut success = false;
    let mut retries = INIT_RETRY_DELAYS.iter();

    loop {
        if ctx.is_shutdown_requested() {
            break;
        }

        let result = ctx.transport.send_status_request().await;
        match result {
            Ok(response) if response.response_code == 200 => {
                ctx.handle_status_response(&response);
                ctx.last_status_check_time = ctx.clock.now_millis();
                success = true;
                break;
            }
            Ok(response) => {
                warn!(
                    code = response.response_code,
                    "initial status request rejected",
                );
            }
            Err(e) => {
                warn!(error = %e, "initial status request failed");
            }
        }

        let Some(delay) = retries.next() else {
            break;
        };
        ctx.sleep(*delay).await;
    }

    if ctx.is_shutdown_requested() {
        ctx.mark_init_completed(false);
        ctx.set_next_state(SendingState::Terminal);
        return;
    }

    ctx.mark_init_completed(success);

    if success && ctx.settings.is_capture() {
        ctx.set_next_state(SendingState::CaptureOn);
    } else {
        if !success {
            warn!("initialization failed, reporting stays disabled");
        }
        ctx.set_next_state(SendingState::CaptureOff);
    }
}

/// One capturing cycle: configure new sessions, send finished-session
/// beacons, send open-session beacons on the send interval, and check the
/// server settings at most one send interval apart.
async fn execute_capture_on<C: BeaconTransport>(ctx: &mut SendingContext<C>) {
    ctx.sleep(CAPTURE_ON_CYCLE).await;
    if ctx.is_shutdown_requested() {
        ctx.set_next_state(SendingState::FlushSessions);
        return;
    }

    let mut throttled: Option<StatusResponse> = None;

    // Request a beacon configuration for every session still in `new`.
    for session in ctx.registry.snapshot_new() {
        if ctx.is_shutdown_requested() {
            break;
        }

        let result = ctx.transport.send_new_session_request().await;
        match result {
            Ok(response) if response.is_success() => {
                let config = ServerBeaconConfig {
                    multiplicity: response.multiplicity,
                    ..Default::default()
                };
                ctx.registry.attach_configuration(&session, config);
            }
            Ok(response) if response.is_too_many_requests() => {
                throttled = Some(response);
                break;
            }
            Ok(response) => {
                // The session stays in `new` and is retried next cycle.
                debug!(
                    session = session.session_id(),
                    code = response.response_code,
                    "new session request rejected",
                );
            }
            Err(e) => {
                warn!(error = %e, "new session request failed");
                break;
            }
        }
    }

    // Finished sessions are drained completely, in finish order.
    if throttled.is_none() {
        for session in ctx.registry.snapshot_finished_configured() {
            if ctx.is_shutdown_requested() {
                break;
            }

            if !session.is_data_sending_allowed() {
                session.clear_captured_data();
                ctx.registry.remove_session(&session);
                continue;
            }

            let response = session.send_beacon(&ctx.transport).await;
            if response
                .as_ref()
                .is_some_and(StatusResponse::is_too_many_requests)
            {
                throttled = response;
                break;
            }

            if session.is_empty() {
                session.clear_captured_data();
                ctx.registry.remove_session(&session);
            } else {
                // The send did not go through; retry next cycle.
                break;
            }
        }
    }

    let now = ctx.clock.now_millis();
    let send_interval_ms = ctx.settings.snapshot().send_interval.as_millis() as i64;

    // Open sessions send whenever their last send is older than the interval.
    if throttled.is_none() && now - ctx.last_open_beacon_send_time >= send_interval_ms {
        for session in ctx.registry.snapshot_open_configured() {
            if ctx.is_shutdown_requested() {
                break;
            }
            if !session.is_data_sending_allowed() {
                continue;
            }

            let response = session.send_beacon(&ctx.transport).await;
            if response
                .as_ref()
                .is_some_and(StatusResponse::is_too_many_requests)
            {
                throttled = response;
                break;
            }
        }
        ctx.last_open_beacon_send_time = now;
    }

    if throttled.is_none() && now - ctx.last_status_check_time >= send_interval_ms {
        let result = ctx.transport.send_status_request().await;
        match result {
            Ok(response) if response.is_too_many_requests() => throttled = Some(response),
            Ok(response) => ctx.handle_status_response(&response),
            Err(e) => warn!(error = %e, "status check failed"),
        }
        ctx.last_status_check_time = now;
    }

    if let Some(response) = throttled {
        let retry_after = response.retry_after();
        info!(?retry_after, "server throttled requests, pausing capture");
        ctx.set_retry_after(retry_after);
        ctx.set_next_state(SendingState::CaptureOff);
        return;
    }

    if !ctx.settings.is_capture() {
        ctx.set_next_state(SendingState::CaptureOff);
        return;
    }

    if ctx.is_shutdown_requested() {
        ctx.set_next_state(SendingState::FlushSessions);
    } else {
        ctx.set_next_state(SendingState::CaptureOn);
    }
}

/// Capture is off: drop captured data, sleep at least one send interval
/// (or the pending retry-after, if larger), then poll the server settings
/// once.
async fn execute_capture_off<C: BeaconTransport>(ctx: &mut SendingContext<C>) {
    ctx.disable_capture_and_clear();

    let send_interval = ctx.settings.snapshot().send_interval;
    let sleep_for = match ctx.take_retry_after() {
        Some(retry_after) => retry_after.max(send_interval),
        None => send_interval,
    };
    ctx.sleep(sleep_for).await;

    if ctx.is_shutdown_requested() {
        ctx.set_next_state(SendingState::FlushSessions);
        return;
    }

    let result = ctx.transport.send_status_request().await;
    match result {
        Ok(response) if response.is_too_many_requests() => {
            ctx.set_retry_after(response.retry_after());
            ctx.set_next_state(SendingState::CaptureOff);
        }
        Ok(response) if response.response_code == 200 => {
            ctx.handle_status_response(&response);
            ctx.last_status_check_time = ctx.clock.now_millis();

            if ctx.settings.is_capture() {
                info!("capture re-enabled by server");
                ctx.set_next_state(SendingState::CaptureOn);
            } else {
                ctx.set_next_state(SendingState::CaptureOff);
            }
        }
        Ok(response) => {
            debug!(code = response.response_code, "status request rejected");
            ctx.set_next_state(SendingState::CaptureOff);
        }
        Err(e) => {
            warn!(error = %e, "status request failed");
            ctx.set_next_state(SendingState::CaptureOff);
        }
    }

    if ctx.is_shutdown_requested() {
        ctx.set_next_state(SendingState::FlushSessions);
    }
}

/// Final flush before termination.
///
/// New sessions get a non-sending configuration, open sessions are ended,
/// and every finished session whose configuration allows it sends its
/// beacon once. A 429 aborts the remaining sends. Afterwards every
/// session's captured data is dropped, so no in-transit bytes survive into
/// Terminal.
async fn execute_flush_sessions<C: BeaconTransport>(ctx: &mut SendingContext<C>) {
    info!("flushing sessions");

    for session in ctx.registry.snapshot_new() {
        ctx.registry
            .attach_configuration(&session, ServerBeaconConfig::no_send());
    }

    for session in ctx.registry.snapshot_open_configured() {
        session.end();
        ctx.registry.finish_session(&session);
    }

    let finished = ctx.registry.snapshot_finished_configured();

    let mut throttled = false;
    for session in &finished {
        if throttled || !session.is_data_sending_allowed() {
            continue;
        }

        let response = session.send_beacon(&ctx.transport).await;
        if response
            .as_ref()
            .is_some_and(StatusResponse::is_too_many_requests)
        {
            warn!("server throttled flush, aborting remaining sends");
            throttled = true;
        }
    }

    for session in &finished {
        session.clear_captured_data();
        ctx.registry.remove_session(session);
    }

    ctx.set_next_state(SendingState::Terminal);
}
