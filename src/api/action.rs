use std::sync::Arc;

use tracing::warn;

use crate::session::SessionState;

/// Shared backing of a live action handle.
struct ActionContext {
    session: Arc<SessionState>,
    id: i32,
    parent_id: i32,
    name: String,
    start_time: i64,
    start_sequence: i32,
}

impl ActionContext {
    fn open(session: Arc<SessionState>, name: &str, parent_id: i32) -> Self {
        let beacon = session.beacon();
        let id = beacon.create_action_id();
        let start_sequence = beacon.create_sequence_number();
        let start_time = beacon.current_timestamp();

        Self {
            session,
            id,
            parent_id,
            name: name.to_string(),
            start_time,
            start_sequence,
        }
    }

    fn report_event(&self, name: &str) {
        if name.is_empty() {
            warn!("report_event: empty event name, ignoring");
            return;
        }
        self.session.beacon().report_event(self.id, name);
    }

    fn report_value_int(&self, name: &str, value: i32) {
        if name.is_empty() {
            warn!("report_value: empty value name, ignoring");
            return;
        }
        self.session.beacon().report_value_int(self.id, name, value);
    }

    fn report_value_double(&self, name: &str, value: f64) {
        if name.is_empty() {
            warn!("report_value: empty value name, ignoring");
            return;
        }
        self.session
            .beacon()
            .report_value_double(self.id, name, value);
    }

    fn report_value_string(&self, name: &str, value: &str) {
        if name.is_empty() {
            warn!("report_value: empty value name, ignoring");
            return;
        }
        self.session
            .beacon()
            .report_value_string(self.id, name, value);
    }

    fn report_error(&self, name: &str, code: i32, reason: &str) {
        if name.is_empty() {
            warn!("report_error: empty error name, ignoring");
            return;
        }
        self.session.beacon().report_error(self.id, name, code, reason);
    }

    fn leave(&self) {
        let beacon = self.session.beacon();
        let end_time = beacon.current_timestamp();
        beacon.add_action(
            &self.name,
            self.id,
            self.parent_id,
            self.start_sequence,
            self.start_time,
            end_time,
        );
    }
}

/// Top-level action of a session.
///
/// Reporting methods return `&Self` for chaining; a handle obtained from a
/// no-op session or with an invalid name silently drops every call.
pub struct RootAction {
    ctx: Option<ActionContext>,
}

impl RootAction {
    pub(crate) fn open(session: Arc<SessionState>, name: &str) -> Self {
        Self {
            ctx: Some(ActionContext::open(session, name, 0)),
        }
    }

    pub(crate) fn no_op() -> Self {
        Self { ctx: None }
    }

    /// Reports a named event on this action.
    pub fn report_event(&self, name: &str) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_event(name);
        }
        self
    }

    /// Reports an integer value on this action.
    pub fn report_value_int(&self, name: &str, value: i32) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_value_int(name, value);
        }
        self
    }

    /// Reports a floating point value on this action.
    pub fn report_value_double(&self, name: &str, value: f64) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_value_double(name, value);
        }
        self
    }

    /// Reports a string value on this action.
    pub fn report_value_string(&self, name: &str, value: &str) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_value_string(name, value);
        }
        self
    }

    /// Reports an error on this action.
    pub fn report_error(&self, name: &str, code: i32, reason: &str) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_error(name, code, reason);
        }
        self
    }

    /// Opens a child action.
    pub fn enter_action(&self, name: &str) -> Action {
        let Some(ctx) = &self.ctx else {
            return Action { ctx: None };
        };
        if name.is_empty() {
            warn!("enter_action: empty action name, ignoring");
            return Action { ctx: None };
        }

        Action {
            ctx: Some(ActionContext::open(
                Arc::clone(&ctx.session),
                name,
                ctx.id,
            )),
        }
    }

    /// Starts tracing a web request issued while this action is open.
    pub fn trace_web_request(&self, url: &str) -> WebRequestTracer {
        match &self.ctx {
            Some(ctx) => WebRequestTracer::start(Arc::clone(&ctx.session), ctx.id, url),
            None => WebRequestTracer { ctx: None },
        }
    }

    /// Closes the action and serializes it.
    pub fn leave(self) {
        if let Some(ctx) = &self.ctx {
            ctx.leave();
        }
    }
}

/// Child action opened from a [`RootAction`].
pub struct Action {
    ctx: Option<ActionContext>,
}

impl Action {
    /// Reports a named event on this action.
    pub fn report_event(&self, name: &str) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_event(name);
        }
        self
    }

    /// Reports an integer value on this action.
    pub fn report_value_int(&self, name: &str, value: i32) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_value_int(name, value);
        }
        self
    }

    /// Reports a floating point value on this action.
    pub fn report_value_double(&self, name: &str, value: f64) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_value_double(name, value);
        }
        self
    }

    /// Reports a string value on this action.
    pub fn report_value_string(&self, name: &str, value: &str) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_value_string(name, value);
        }
        self
    }

    /// Reports an error on this action.
    pub fn report_error(&self, name: &str, code: i32, reason: &str) -> &Self {
        if let Some(ctx) = &self.ctx {
            ctx.report_error(name, code, reason);
        }
        self
    }

    /// Starts tracing a web request issued while this action is open.
    pub fn trace_web_request(&self, url: &str) -> WebRequestTracer {
        match &self.ctx {
            Some(ctx) => WebRequestTracer::start(Arc::clone(&ctx.session), ctx.id, url),
            None => WebRequestTracer { ctx: None },
        }
    }

    /// Closes the action and serializes it.
    pub fn leave(self) {
        if let Some(ctx) = &self.ctx {
            ctx.leave();
        }
    }
}

struct WebRequestContext {
    session: Arc<SessionState>,
    parent_id: i32,
    url: String,
    start_time: i64,
    start_sequence: i32,
    bytes_sent: i64,
    bytes_received: i64,
    response_code: i32,
}

/// Records timing, traffic, and outcome of one web request.
pub struct WebRequestTracer {
    ctx: Option<WebRequestContext>,
}

impl WebRequestTracer {
    fn start(session: Arc<SessionState>, parent_id: i32, url: &str) -> Self {
        if url.is_empty() {
            warn!("trace_web_request: empty url, ignoring");
            return Self { ctx: None };
        }

        let beacon = session.beacon();
        let start_sequence = beacon.create_sequence_number();
        let start_time = beacon.current_timestamp();

        Self {
            ctx: Some(WebRequestContext {
                session,
                parent_id,
                url: url.to_string(),
                start_time,
                start_sequence,
                bytes_sent: -1,
                bytes_received: -1,
                response_code: -1,
            }),
        }
    }

    pub fn set_bytes_sent(&mut self, bytes: i64) -> &mut Self {
        if let Some(ctx) = &mut self.ctx {
            ctx.bytes_sent = bytes;
        }
        self
    }

    pub fn set_bytes_received(&mut self, bytes: i64) -> &mut Self {
        if let Some(ctx) = &mut self.ctx {
            ctx.bytes_received = bytes;
        }
        self
    }

    pub fn set_response_code(&mut self, code: i32) -> &mut Self {
        if let Some(ctx) = &mut self.ctx {
            ctx.response_code = code;
        }
        self
    }

    /// Stops the trace and serializes it.
    pub fn stop(self) {
        let Some(ctx) = self.ctx else {
            return;
        };

        let beacon = ctx.session.beacon();
        let end_time = beacon.current_timestamp();
        beacon.add_web_request(
            ctx.parent_id,
            &ctx.url,
            ctx.start_sequence,
            ctx.start_time,
            end_time,
            ctx.bytes_sent,
            ctx.bytes_received,
            ctx.response_code,
        );
    }
}
