mod action;

pub use action::{Action, RootAction, WebRequestTracer};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::eviction::CacheEvictor;
use crate::cache::BeaconCache;
use crate::clock::{SequentialSessionIdProvider, SessionIdProvider, SystemClock, TimingProvider};
use crate::config::{AgentConfig, SettingsStore};
use crate::protocol::http::{BeaconTransport, HttpClient};
use crate::registry::SessionRegistry;
use crate::sender::SendingContext;
use crate::session::SessionState;

/// Telemetry agent entry point.
///
/// Owns the beacon cache, session registry, and settings store, and runs
/// the sending and eviction workers as background tasks. Must be created
/// inside a tokio runtime.
pub struct Agent {
    config: AgentConfig,
    cache: Arc<BeaconCache>,
    registry: Arc<SessionRegistry>,
    settings: Arc<SettingsStore>,
    clock: Arc<dyn TimingProvider>,
    session_ids: Arc<dyn SessionIdProvider>,
    cancel: CancellationToken,
    init_rx: watch::Receiver<Option<bool>>,
    sender_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    evictor_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Agent {
    /// Creates an agent and starts its workers with the default HTTP
    /// transport.
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;

        let settings = SettingsStore::new(&config);
        let transport = HttpClient::new(config.request_timeout, settings.endpoint_cell())
            .context("creating beacon transport")?;

        Self::start(config, settings, transport)
    }

    /// Creates an agent with a custom transport.
    ///
    /// Useful for tests and for embedding behind a proxy-aware client; the
    /// transport receives every status, new-session, and beacon request.
    pub fn with_transport<C>(config: AgentConfig, transport: C) -> Result<Self>
    where
        C: BeaconTransport + 'static,
    {
        config.validate()?;

        let settings = SettingsStore::new(&config);
        Self::start(config, settings, transport)
    }

    fn start<C>(config: AgentConfig, settings: SettingsStore, transport: C) -> Result<Self>
    where
        C: BeaconTransport + 'static,
    {
        let clock: Arc<dyn TimingProvider> = Arc::new(SystemClock);
        let cache = Arc::new(BeaconCache::new(Arc::clone(&clock)));
        let registry = Arc::new(SessionRegistry::new());
        let settings = Arc::new(settings);
        let cancel = CancellationToken::new();

        let context = SendingContext::new(
            transport,
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&settings),
            Arc::clone(&clock),
            cancel.child_token(),
        );
        let init_rx = context.init_watch();
        let sender_task = tokio::spawn(context.run());

        let evictor = CacheEvictor::new(Arc::clone(&cache), config.cache.clone());
        let evictor_task = evictor.spawn(cancel.child_token());

        info!(
            endpoint = %config.endpoint_url,
            application = %config.application_id,
            "agent started",
        );

        Ok(Self {
            config,
            cache,
            registry,
            settings,
            clock,
            session_ids: Arc::new(SequentialSessionIdProvider::new()),
            cancel,
            init_rx,
            sender_task: tokio::sync::Mutex::new(Some(sender_task)),
            evictor_task: tokio::sync::Mutex::new(Some(evictor_task)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Waits until initialization finished; returns whether the initial
    /// status request succeeded.
    pub async fn wait_for_init(&self) -> bool {
        let mut init = self.init_rx.clone();
        loop {
            if let Some(outcome) = *init.borrow_and_update() {
                return outcome;
            }
            if init.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Whether initialization finished successfully.
    pub fn is_initialized(&self) -> bool {
        *self.init_rx.borrow() == Some(true)
    }

    /// Opens a new session.
    ///
    /// `client_ip` attributes reported data to a client address; invalid
    /// addresses are dropped. After shutdown a no-op session is returned
    /// and every call on it is silently ignored.
    pub fn create_session(&self, client_ip: Option<&str>) -> Session {
        if self.shut_down.load(Ordering::Relaxed) {
            debug!("agent is shut down, handing out no-op session");
            return Session::NoOp;
        }

        let session = Arc::new(SessionState::new(
            self.session_ids.next_session_id(),
            client_ip.map(str::to_string),
            &self.config,
            Arc::clone(&self.cache),
            Arc::clone(&self.settings),
            Arc::clone(&self.clock),
        ));
        self.registry.start_session(&session);

        debug!(session = session.session_id(), "session created");

        Session::Real(RealSession {
            state: session,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Shuts the agent down: ends capture, flushes finished sessions once,
    /// and waits for both workers to exit.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("agent shutting down");
        self.cancel.cancel();

        if let Some(task) = self.sender_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "sender task join failed");
            }
        }

        if let Some(task) = self.evictor_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "eviction task join failed");
            }
        }

        info!("agent stopped");
    }
}

/// Backing of a live reporting session.
pub struct RealSession {
    state: Arc<SessionState>,
    registry: Arc<SessionRegistry>,
}

/// Reporting handle for one session.
///
/// The `NoOp` variant is handed out once the agent is shut down; every
/// call on it is silently dropped, so callers never branch on liveness.
pub enum Session {
    Real(RealSession),
    NoOp,
}

impl Session {
    /// Opens a top-level action.
    pub fn enter_action(&self, name: &str) -> RootAction {
        let Session::Real(session) = self else {
            return RootAction::no_op();
        };
        if name.is_empty() {
            warn!("enter_action: empty action name, ignoring");
            return RootAction::no_op();
        }

        RootAction::open(Arc::clone(&session.state), name)
    }

    /// Tags the session with a user identifier.
    pub fn identify_user(&self, user_tag: &str) {
        let Session::Real(session) = self else {
            return;
        };
        if user_tag.is_empty() {
            warn!("identify_user: empty user tag, ignoring");
            return;
        }

        session.state.beacon().identify_user(user_tag);
    }

    /// Reports a crash.
    pub fn report_crash(&self, name: &str, reason: &str, stacktrace: &str) {
        let Session::Real(session) = self else {
            return;
        };
        if name.is_empty() {
            warn!("report_crash: empty crash name, ignoring");
            return;
        }

        session.state.beacon().report_crash(name, reason, stacktrace);
    }

    /// Ends the session. Subsequent reports on this handle are dropped by
    /// the capture pipeline; ending twice is a no-op.
    pub fn end(&self) {
        let Session::Real(session) = self else {
            return;
        };

        session.state.end();
        session.registry.finish_session(&session.state);
    }
}
