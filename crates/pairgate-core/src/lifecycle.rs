//! Connection lifecycle for one pairing session.
//!
//! A session is a single task that owns its directory, its connection
//! handle, its response slot and its timers. Engine events and timer
//! expiries are consumed from one `select!` loop, so every transition runs
//! to completion before the next input is looked at. Timers are cancelled
//! on the transitions that make them meaningless, and each handler still
//! checks the current phase before acting.
//!
//! ```text
//! Connecting --code--> Connecting(code issued) --connected--> Paired
//! Paired --identity--> Delivering --> Closing --grace--> Closed
//! Connecting --init error / logout / deadline / stream end--> Failed
//! ```

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use crate::engine::{
    Connection, ConnectionEngine, ConnectionEvent, DisconnectReason, EventStream, Jid,
    OpenedConnection,
};
use crate::errors::PairingError;
use crate::fault::FaultFilter;
use crate::onboarding::{DeliveryReport, OnboardingPipeline};
use crate::outcome::{FailureKind, PairingOutcome, ResponseSlot};
use crate::render::{CodeRenderer, QrRenderer};
use crate::store::{CredentialFiles, SessionId, SessionStore};

/// Timer lengths for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Backstop from session start until pairing must have succeeded.
    pub pairing_timeout: Duration,
    /// Delay before reconnecting after a transient close.
    pub reconnect_delay: Duration,
    /// Delay before resolving the paired identity a second time.
    pub identity_retry: Duration,
    /// Delay between onboarding and teardown.
    pub cleanup_grace: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(3),
            identity_retry: Duration::from_secs(5),
            cleanup_grace: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the remote side; `code_issued` once a code went out.
    Connecting { code_issued: bool },
    /// Pairing approved, identity not yet known.
    Paired,
    Delivering,
    /// Onboarding finished, waiting out the grace period.
    Closing,
    Closed,
    Failed(FailureKind),
}

impl SessionPhase {
    /// Record the first pairing code. Returns `false` for every later one.
    fn issue_code(&mut self) -> bool {
        match self {
            SessionPhase::Connecting { code_issued } if !*code_issued => {
                *code_issued = true;
                true
            }
            _ => false,
        }
    }

    /// Move to `Paired`. Returns `false` if pairing was already recorded
    /// or the session has ended.
    fn mark_paired(&mut self) -> bool {
        match self {
            SessionPhase::Connecting { .. } => {
                *self = SessionPhase::Paired;
                true
            }
            _ => false,
        }
    }

    pub fn code_issued(&self) -> bool {
        !matches!(self, SessionPhase::Connecting { code_issued: false })
    }

    pub fn is_paired(&self) -> bool {
        matches!(
            self,
            SessionPhase::Paired | SessionPhase::Delivering | SessionPhase::Closing | SessionPhase::Closed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Closed | SessionPhase::Failed(_))
    }
}

/// Summary of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub id: SessionId,
    pub phase: SessionPhase,
    pub codes_seen: u32,
    pub reconnects: u32,
    /// Set once the remote party approved pairing, even if the session failed later.
    pub paired: bool,
    /// Time from session start until a caller received the first code.
    pub time_to_code: Option<Duration>,
    pub delivery: Option<DeliveryReport>,
}

/// A started session: the caller awaits `outcome`, a supervisor may await `task`.
pub struct PendingSession {
    pub id: SessionId,
    pub outcome: oneshot::Receiver<PairingOutcome>,
    pub task: JoinHandle<SessionReport>,
}

/// Starts pairing sessions against a connection engine.
#[derive(Clone)]
pub struct PairingController {
    engine: Arc<dyn ConnectionEngine>,
    renderer: Arc<dyn CodeRenderer>,
    store: SessionStore,
    onboarding: Arc<OnboardingPipeline>,
    faults: Arc<FaultFilter>,
    timings: SessionTimings,
}

impl PairingController {
    pub fn new(engine: Arc<dyn ConnectionEngine>, store: SessionStore) -> Self {
        Self {
            engine,
            renderer: Arc::new(QrRenderer::default()),
            store,
            onboarding: Arc::new(OnboardingPipeline::default()),
            faults: Arc::new(FaultFilter::default()),
            timings: SessionTimings::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn CodeRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_onboarding(mut self, onboarding: OnboardingPipeline) -> Self {
        self.onboarding = Arc::new(onboarding);
        self
    }

    pub fn with_faults(mut self, faults: Arc<FaultFilter>) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn faults(&self) -> &Arc<FaultFilter> {
        &self.faults
    }

    /// Spawn a new session. Must be called within a tokio runtime.
    pub fn start(&self) -> PendingSession {
        let id = SessionId::generate();
        let (slot, outcome) = ResponseSlot::new();
        let task = tokio::spawn(self.clone().run(id.clone(), slot));
        PendingSession { id, outcome, task }
    }

    async fn run(self, id: SessionId, mut slot: ResponseSlot) -> SessionReport {
        let started = Instant::now();
        let deadline = started + self.timings.pairing_timeout;
        info!(session_id = %id, "starting pairing session");

        let mut report = SessionReport {
            id: id.clone(),
            phase: SessionPhase::Connecting { code_issued: false },
            codes_seen: 0,
            reconnects: 0,
            paired: false,
            time_to_code: None,
            delivery: None,
        };

        let dir = match self.store.create(&id).await {
            Ok(dir) => dir,
            Err(e) => {
                self.faults.report(Some(&id), "create session directory", &e);
                slot.fulfill(PairingOutcome::Failed {
                    session_id: id,
                    kind: FailureKind::InitFailed,
                });
                report.phase = SessionPhase::Failed(FailureKind::InitFailed);
                return report;
            }
        };
        let credentials = CredentialFiles::new(&dir);

        let opened = match tokio::time::timeout_at(deadline, self.open(&credentials)).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                self.faults.report(Some(&id), "open connection", &e);
                return self.abort_init(report, slot, &dir, FailureKind::InitFailed).await;
            }
            Err(_) => {
                warn!(session_id = %id, "connection did not open before the pairing deadline");
                return self.abort_init(report, slot, &dir, FailureKind::TimedOut).await;
            }
        };

        let mut timers = Timers::default();
        timers.pairing.arm_at(deadline);

        let session = Session {
            id,
            dir,
            credentials,
            connection: opened.handle,
            slot,
            started,
            report,
            ctx: self,
        };
        session.drive(opened.events, timers).await
    }

    /// Read persisted credentials (surfacing a corrupt file) and open the engine.
    async fn open(&self, credentials: &CredentialFiles) -> Result<OpenedConnection, PairingError> {
        credentials.load_creds().await?;
        Ok(self.engine.open(credentials.clone()).await?)
    }

    async fn abort_init(
        &self,
        mut report: SessionReport,
        mut slot: ResponseSlot,
        dir: &Path,
        kind: FailureKind,
    ) -> SessionReport {
        if let Err(e) = self.store.remove(dir).await {
            self.faults.report(Some(&report.id), "remove session directory", &e);
        }
        slot.fulfill(PairingOutcome::Failed {
            session_id: report.id.clone(),
            kind,
        });
        report.phase = SessionPhase::Failed(kind);
        report
    }
}

/// A one-shot timer that can be re-armed or cancelled.
#[derive(Default)]
struct Timer(Option<Pin<Box<Sleep>>>);

impl Timer {
    fn arm(&mut self, after: Duration) {
        self.0 = Some(Box::pin(tokio::time::sleep(after)));
    }

    fn arm_at(&mut self, deadline: Instant) {
        self.0 = Some(Box::pin(tokio::time::sleep_until(deadline)));
    }

    fn cancel(&mut self) {
        self.0 = None;
    }

    /// Completes when the armed deadline passes; pends forever while idle.
    async fn fired(&mut self) {
        match self.0.as_mut() {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending::<()>().await,
        }
        self.0 = None;
    }
}

#[derive(Default)]
struct Timers {
    pairing: Timer,
    reconnect: Timer,
    identity_retry: Timer,
    cleanup: Timer,
}

impl Timers {
    fn cancel_all(&mut self) {
        self.pairing.cancel();
        self.reconnect.cancel();
        self.identity_retry.cancel();
        self.cleanup.cancel();
    }
}

struct Session {
    id: SessionId,
    dir: PathBuf,
    credentials: CredentialFiles,
    connection: Box<dyn Connection>,
    slot: ResponseSlot,
    started: Instant,
    report: SessionReport,
    ctx: PairingController,
}

impl Session {
    async fn drive(mut self, mut events: EventStream, mut timers: Timers) -> SessionReport {
        while !self.report.phase.is_terminal() {
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(event) => self.on_event(event, &mut timers).await,
                    None => self.on_stream_end().await,
                },
                _ = timers.pairing.fired() => self.on_pairing_deadline().await,
                _ = timers.reconnect.fired() => self.on_reconnect_due().await,
                _ = timers.identity_retry.fired() => self.on_identity_retry(&mut timers).await,
                _ = timers.cleanup.fired() => self.on_cleanup_due().await,
            }

            if self.report.phase.is_terminal() {
                timers.cancel_all();
            }
        }

        info!(session_id = %self.id, phase = ?self.report.phase, "pairing session finished");
        self.report
    }

    async fn on_event(&mut self, event: ConnectionEvent, timers: &mut Timers) {
        match event {
            ConnectionEvent::PairingCode(code) => self.on_pairing_code(&code),
            ConnectionEvent::Connected { identity } => self.on_connected(identity, timers).await,
            ConnectionEvent::Closed { reason } => self.on_closed(reason, timers).await,
            ConnectionEvent::CredentialsUpdated(creds) => {
                if let Err(e) = self.credentials.save_creds(&creds).await {
                    self.ctx.faults.report(Some(&self.id), "save credentials", &e);
                }
            }
        }
    }

    fn on_pairing_code(&mut self, code: &str) {
        self.report.codes_seen += 1;

        match self.ctx.renderer.render_terminal(code) {
            Ok(art) => info!(session_id = %self.id, "scan this code to link the account:\n{art}"),
            Err(e) => {
                self.ctx.faults.report(Some(&self.id), "render terminal code", &e);
            }
        }

        if !self.report.phase.issue_code() {
            debug!(
                session_id = %self.id,
                codes_seen = self.report.codes_seen,
                "refreshed pairing code not sent to caller"
            );
            return;
        }

        let kind = match self.ctx.renderer.render_data_url(code) {
            Ok(qr_data_url) => {
                let delivered = self.slot.fulfill(PairingOutcome::CodeReady {
                    session_id: self.id.clone(),
                    qr_data_url,
                });
                if delivered {
                    self.report.time_to_code = Some(self.started.elapsed());
                } else {
                    debug!(session_id = %self.id, "pairing code ready but no caller is waiting");
                }
                return;
            }
            Err(e) => {
                self.ctx.faults.report(Some(&self.id), "render pairing code", &e);
                FailureKind::RenderFailed
            }
        };

        self.slot.fulfill(PairingOutcome::Failed {
            session_id: self.id.clone(),
            kind,
        });
    }

    async fn on_connected(&mut self, identity: Option<Jid>, timers: &mut Timers) {
        let code_issued = self.report.phase.code_issued();
        if !self.report.phase.mark_paired() {
            debug!(session_id = %self.id, "connection re-established after pairing");
            return;
        }
        timers.pairing.cancel();
        self.report.paired = true;
        info!(session_id = %self.id, "pairing approved");

        if !code_issued {
            self.slot.fulfill(PairingOutcome::Failed {
                session_id: self.id.clone(),
                kind: FailureKind::PairedWithoutCode,
            });
        }

        match identity.or_else(|| self.connection.identity()) {
            Some(jid) => self.deliver(jid, timers).await,
            None => {
                debug!(session_id = %self.id, "paired identity unknown, retrying shortly");
                timers.identity_retry.arm(self.ctx.timings.identity_retry);
            }
        }
    }

    async fn on_closed(&mut self, reason: DisconnectReason, timers: &mut Timers) {
        if reason.is_logged_out() {
            info!(session_id = %self.id, "pairing revoked by account holder");
            self.fail(FailureKind::LoggedOut);
            self.teardown().await;
            return;
        }

        debug!(session_id = %self.id, ?reason, "connection closed, scheduling reconnect");
        timers.reconnect.arm(self.ctx.timings.reconnect_delay);

        if !self.report.phase.is_paired() {
            self.slot.fulfill(PairingOutcome::Failed {
                session_id: self.id.clone(),
                kind: FailureKind::ClosedBeforePairing,
            });
        }
    }

    async fn on_stream_end(&mut self) {
        warn!(session_id = %self.id, "connection event stream ended");
        if self.report.phase.is_paired() {
            self.report.phase = SessionPhase::Closed;
        } else {
            self.fail(FailureKind::StreamEnded);
        }
        self.teardown().await;
    }

    async fn on_pairing_deadline(&mut self) {
        if self.report.phase.is_paired() || self.report.phase.is_terminal() {
            return;
        }
        warn!(
            session_id = %self.id,
            code_issued = self.report.phase.code_issued(),
            "pairing deadline passed"
        );
        self.fail(FailureKind::TimedOut);
        self.teardown().await;
    }

    async fn on_reconnect_due(&mut self) {
        if self.report.phase.is_terminal() {
            return;
        }
        self.report.reconnects += 1;
        if let Err(e) = self.connection.reconnect().await {
            self.ctx.faults.report(Some(&self.id), "reconnect", &e);
        }
    }

    async fn on_identity_retry(&mut self, timers: &mut Timers) {
        if self.report.phase != SessionPhase::Paired {
            return;
        }

        let identity = match self.connection.identity() {
            Some(jid) => Some(jid),
            None => self.credentials.identity().await.unwrap_or_else(|e| {
                self.ctx.faults.report(Some(&self.id), "read identity", &e);
                None
            }),
        };

        match identity {
            Some(jid) => self.deliver(jid, timers).await,
            None => {
                warn!(session_id = %self.id, "paired identity still unknown, skipping onboarding");
                self.report.phase = SessionPhase::Closing;
                timers.cleanup.arm(self.ctx.timings.cleanup_grace);
            }
        }
    }

    async fn deliver(&mut self, to: Jid, timers: &mut Timers) {
        self.report.phase = SessionPhase::Delivering;

        let delivery = self
            .ctx
            .onboarding
            .deliver(&self.id, self.connection.as_ref(), &to, &self.credentials)
            .await;
        if let Some(failure) = &delivery.failure {
            self.ctx
                .faults
                .report(Some(&self.id), failure.step, &failure.error);
        }
        self.report.delivery = Some(delivery);

        self.report.phase = SessionPhase::Closing;
        timers.cleanup.arm(self.ctx.timings.cleanup_grace);
    }

    async fn on_cleanup_due(&mut self) {
        if self.report.phase != SessionPhase::Closing {
            return;
        }
        self.report.phase = SessionPhase::Closed;
        self.teardown().await;
    }

    /// Enter `Failed(kind)` and answer the caller if nobody has yet.
    fn fail(&mut self, kind: FailureKind) {
        self.report.phase = SessionPhase::Failed(kind);
        self.slot.fulfill(PairingOutcome::Failed {
            session_id: self.id.clone(),
            kind,
        });
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.connection.end().await {
            self.ctx.faults.report(Some(&self.id), "end connection", &e);
        }
        if let Err(e) = self.ctx.store.remove(&self.dir).await {
            self.ctx.faults.report(Some(&self.id), "remove session directory", &e);
        }
    }
}
