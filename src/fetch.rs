//! Activity fetch session.
//!
//! Negotiation escalates through three request variants until the watch
//! answers:
//!
//! ```text
//! Idle -> Phase1 (direct fetch) -> Phase2 (secondary) -> Phase3 (emergency authorize) -> Failed
//!            \___________________________|_______________________/
//!                                        v
//!            10 01 01 -> Transferring -> (10 02 01 | inactivity) -> Finalizing -> Complete
//! ```
//!
//! [`FetchMachine`] holds the transition rules and never touches a clock or a
//! transport; [`ActivityFetchSession`] executes its actions against a
//! [`CommandWriter`] and owns the timers.

use chrono::Utc;
use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    decoder::TelemetryDecoder,
    error::{BipError, Result},
    protocol::{ControlFrame, FetchCommand, RESPONSE_MARKER},
    reassembly::FrameReassembler,
    stats::StatsAggregator,
    transport::{CommandWriter, EventSink, Notification},
    types::{
        ActivitySummary, Endpoint, FetchConfig, FetchOutcome, FetchSessionState, RawChunk,
        SyncEvent,
    },
};

const LOG_EVERY_BYTES: usize = 4_096;

/// Inputs to the fetch state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchEvent {
    /// Begin negotiating
    Start,
    /// Status frame on the control endpoint
    Control(ControlFrame),
    /// Telemetry frame of `len` raw bytes
    Data {
        /// Frame length including the sequence byte
        len: usize,
    },
    /// The current phase deadline expired
    PhaseDeadline,
    /// The rejection cooldown elapsed
    RetryDue,
    /// The settling gap before start-transfer elapsed
    StartTransferDue,
    /// The data stream stayed silent too long
    InactivityTimeout,
    /// The caller aborted the session
    Cancelled,
    /// The notification stream closed
    LinkLost,
}

/// Outputs of the fetch state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAction {
    /// Write a command to the control endpoint
    Send(FetchCommand),
    /// (Re)arm the phase deadline
    ArmPhaseDeadline(Duration),
    /// Cancel the phase deadline
    DisarmPhaseDeadline,
    /// Fire [`FetchEvent::RetryDue`] after the delay
    ScheduleRetry(Duration),
    /// Fire [`FetchEvent::StartTransferDue`] after the delay
    ScheduleStartTransfer(Duration),
    /// (Re)arm the inactivity timer
    ArmInactivity(Duration),
    /// Cancel the inactivity timer
    DisarmInactivity,
    /// Stop, clear every timer and build the summary
    Finalize(FetchOutcome),
}

/// Transition rules of one fetch session
#[derive(Debug, Clone)]
pub struct FetchMachine {
    config: FetchConfig,
    state: FetchSessionState,
    bytes_received: usize,
    rejections: u32,
    retry_pending: bool,
    next_keepalive_at: usize,
}

impl FetchMachine {
    /// Create an idle machine
    #[must_use]
    pub fn new(config: FetchConfig) -> Self {
        let next_keepalive_at = config.keepalive_interval_bytes;
        Self {
            config,
            state: FetchSessionState::Idle,
            bytes_received: 0,
            rejections: 0,
            retry_pending: false,
            next_keepalive_at,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> FetchSessionState {
        self.state
    }

    /// Raw data bytes counted so far
    #[must_use]
    pub const fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    const fn is_active(&self) -> bool {
        !self.state.is_terminal()
            && !matches!(
                self.state,
                FetchSessionState::Idle | FetchSessionState::Finalizing
            )
    }

    fn reset(&mut self) {
        self.bytes_received = 0;
        self.rejections = 0;
        self.retry_pending = false;
        self.next_keepalive_at = self.config.keepalive_interval_bytes;
    }

    fn command_for(&self, phase: FetchSessionState) -> FetchCommand {
        match phase {
            FetchSessionState::Phase1 => FetchCommand::DirectFetch {
                class: self.config.activity_class,
                since: self.config.since,
            },
            FetchSessionState::Phase2 => FetchCommand::Secondary {
                class: self.config.activity_class,
                since: self.config.secondary_since,
            },
            _ => FetchCommand::EmergencyAuthorize,
        }
    }

    fn phase_timeout(&self, phase: FetchSessionState) -> Duration {
        let timeouts = &self.config.timeouts;
        Duration::from_millis(match phase {
            FetchSessionState::Phase1 => timeouts.phase1_timeout_ms,
            FetchSessionState::Phase2 => timeouts.phase2_timeout_ms,
            _ => timeouts.phase3_timeout_ms,
        })
    }

    fn enter_phase(&mut self, phase: FetchSessionState) -> Vec<FetchAction> {
        debug!("Fetch: {} -> {}", self.state, phase);
        self.state = phase;
        vec![
            FetchAction::Send(self.command_for(phase)),
            FetchAction::ArmPhaseDeadline(self.phase_timeout(phase)),
        ]
    }

    const fn next_phase(&self) -> FetchSessionState {
        match self.state {
            FetchSessionState::Phase1 => FetchSessionState::Phase2,
            _ => FetchSessionState::Phase3,
        }
    }

    fn finalize(&mut self, outcome: FetchOutcome) -> Vec<FetchAction> {
        debug!("Fetch: {} -> Finalizing ({})", self.state, outcome);
        self.state = FetchSessionState::Finalizing;
        vec![FetchAction::Finalize(outcome)]
    }

    /// Record the terminal state once the summary is built
    pub fn settle(&mut self, outcome: FetchOutcome) -> FetchSessionState {
        self.state = if outcome.is_success(self.bytes_received) {
            FetchSessionState::Complete
        } else {
            FetchSessionState::Failed
        };
        self.state
    }

    /// Apply one event
    pub fn handle(&mut self, event: FetchEvent) -> Vec<FetchAction> {
        match event {
            FetchEvent::Start if self.state == FetchSessionState::Idle => {
                self.reset();
                self.enter_phase(FetchSessionState::Phase1)
            }
            _ if !self.is_active() => Vec::new(),

            FetchEvent::PhaseDeadline => self.on_phase_deadline(),
            FetchEvent::RetryDue => self.on_retry_due(),
            FetchEvent::StartTransferDue => {
                if self.state == FetchSessionState::Transferring {
                    vec![FetchAction::Send(FetchCommand::StartTransfer)]
                } else {
                    Vec::new()
                }
            }
            FetchEvent::Control(frame) => self.on_control(frame),
            FetchEvent::Data { len } => self.on_data(len),
            FetchEvent::InactivityTimeout => self.finalize(FetchOutcome::Drained),
            FetchEvent::Cancelled => self.finalize(FetchOutcome::Cancelled),
            FetchEvent::LinkLost => self.finalize(FetchOutcome::LinkLost),
            FetchEvent::Start => Vec::new(),
        }
    }

    fn on_phase_deadline(&mut self) -> Vec<FetchAction> {
        if !self.state.is_negotiating() || self.bytes_received > 0 {
            return Vec::new();
        }
        if self.state == FetchSessionState::Phase3 {
            warn!("No response after all fetch phases");
            return self.finalize(FetchOutcome::NoResponse);
        }
        let next = self.next_phase();
        info!("No answer in {}, escalating", self.state);
        self.enter_phase(next)
    }

    fn on_retry_due(&mut self) -> Vec<FetchAction> {
        if !self.state.is_negotiating() || !self.retry_pending {
            return Vec::new();
        }
        self.retry_pending = false;
        let next = self.next_phase();
        self.enter_phase(next)
    }

    fn on_control(&mut self, frame: ControlFrame) -> Vec<FetchAction> {
        match frame {
            ControlFrame::FetchAccepted { expected } => {
                if self.state == FetchSessionState::Transferring {
                    return Vec::new();
                }
                if expected == Some(0) {
                    info!("Watch reports no pending activities");
                    return self.finalize(FetchOutcome::NothingToFetch);
                }
                info!(
                    "Fetch accepted in {} ({} records pending)",
                    self.state,
                    expected.map_or_else(|| "?".to_string(), |n| n.to_string())
                );
                self.state = FetchSessionState::Transferring;
                self.retry_pending = false;
                let timeouts = &self.config.timeouts;
                vec![
                    FetchAction::DisarmPhaseDeadline,
                    FetchAction::ScheduleStartTransfer(Duration::from_millis(
                        timeouts.start_transfer_delay_ms,
                    )),
                    FetchAction::ArmInactivity(Duration::from_millis(
                        timeouts.inactivity_timeout_ms,
                    )),
                ]
            }
            ControlFrame::FetchRejected => {
                if !self.state.is_negotiating() || self.retry_pending {
                    return Vec::new();
                }
                if self.rejections >= self.config.max_rejection_retries {
                    warn!("Fetch rejected again, waiting for the phase deadline");
                    return Vec::new();
                }
                self.rejections += 1;
                self.retry_pending = true;
                info!(
                    "Fetch rejected in {}, retry {}/{}",
                    self.state, self.rejections, self.config.max_rejection_retries
                );
                vec![
                    FetchAction::DisarmPhaseDeadline,
                    FetchAction::ScheduleRetry(Duration::from_millis(
                        self.config.timeouts.rejection_cooldown_ms,
                    )),
                ]
            }
            ControlFrame::TransferEnded => {
                info!("Watch signalled end of transfer");
                let mut actions = vec![
                    FetchAction::Send(FetchCommand::TransferAck(self.config.retain)),
                    FetchAction::DisarmInactivity,
                ];
                actions.extend(self.finalize(FetchOutcome::Completed));
                actions
            }
            ControlFrame::TransferFailed { status } => {
                warn!("Watch aborted the transfer with status {:02X}", status);
                self.finalize(FetchOutcome::TransferFailed { status })
            }
            ControlFrame::Other { opcode, status } => {
                debug!("Ignoring control frame {:02X} {:02X}", opcode, status);
                Vec::new()
            }
        }
    }

    fn on_data(&mut self, len: usize) -> Vec<FetchAction> {
        let mut actions = Vec::new();
        self.bytes_received += len;

        if self.state.is_negotiating() {
            debug!("Data arrived during {}, streaming", self.state);
            self.state = FetchSessionState::Transferring;
            self.retry_pending = false;
            actions.push(FetchAction::DisarmPhaseDeadline);
        }
        actions.push(FetchAction::ArmInactivity(Duration::from_millis(
            self.config.timeouts.inactivity_timeout_ms,
        )));

        let interval = self.config.keepalive_interval_bytes;
        if interval > 0 && self.bytes_received >= self.next_keepalive_at {
            self.next_keepalive_at = (self.bytes_received / interval + 1) * interval;
            actions.push(FetchAction::Send(FetchCommand::KeepAlive));
        }
        actions
    }
}

/// Aborts a running [`ActivityFetchSession`]
#[derive(Debug, Clone)]
pub struct FetchAbortHandle(Arc<Notify>);

impl FetchAbortHandle {
    /// Ask the session to finalize with what it has
    pub fn abort(&self) {
        self.0.notify_one();
    }
}

#[derive(Debug, Default)]
struct Timers {
    phase: Option<Instant>,
    retry: Option<Instant>,
    start_transfer: Option<Instant>,
    inactivity: Option<Instant>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One bulk transfer of historical activity data
pub struct ActivityFetchSession {
    writer: Arc<CommandWriter>,
    config: FetchConfig,
    events: EventSink,
    abort: Arc<Notify>,
    decoder: TelemetryDecoder,
}

impl ActivityFetchSession {
    /// Create a session
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the control endpoint is missing or
    /// does not accept writes.
    pub fn new(writer: Arc<CommandWriter>, config: FetchConfig) -> Result<Self> {
        let control = writer.transport().endpoints().require(Endpoint::Control)?;
        if !control.is_writable() {
            return Err(BipError::Configuration(
                "control endpoint does not accept writes".to_string(),
            ));
        }

        Ok(Self {
            writer,
            config,
            events: EventSink::disabled(),
            abort: Arc::new(Notify::new()),
            decoder: TelemetryDecoder::new(),
        })
    }

    /// Deliver progress and completion events
    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Handle for cancelling the session from another task
    #[must_use]
    pub fn abort_handle(&self) -> FetchAbortHandle {
        FetchAbortHandle(self.abort.clone())
    }

    /// Error reported when no phase got an answer
    fn negotiation_timeout(&self) -> BipError {
        let timeouts = &self.config.timeouts;
        BipError::Timeout {
            operation: "fetch negotiation",
            timeout_ms: timeouts.phase1_timeout_ms
                + timeouts.phase2_timeout_ms
                + timeouts.phase3_timeout_ms,
        }
    }

    fn settle_gap(&self) -> Duration {
        Duration::from_millis(self.config.timeouts.channel_settle_ms)
    }

    async fn prepare_channels(&self) -> Result<()> {
        let transport = self.writer.transport();
        let endpoints = transport.endpoints();

        if endpoints.contains(Endpoint::Auth) {
            if let Err(e) = transport.unsubscribe(Endpoint::Auth).await {
                debug!("Could not release auth notifications: {}", e);
            }
        }
        if endpoints.contains(Endpoint::Data) {
            transport.subscribe(Endpoint::Data).await?;
            tokio::time::sleep(self.settle_gap()).await;
        }
        transport.subscribe(Endpoint::Control).await?;
        tokio::time::sleep(self.settle_gap()).await;
        Ok(())
    }

    async fn release_channels(&self) {
        let transport = self.writer.transport();
        for endpoint in [Endpoint::Data, Endpoint::Control] {
            if transport.endpoints().contains(endpoint) {
                if let Err(e) = transport.unsubscribe(endpoint).await {
                    debug!("Could not release {} notifications: {}", endpoint, e);
                }
            }
        }
    }

    async fn send(&self, command: FetchCommand) {
        let label = command.label();
        if let Err(e) = self
            .writer
            .send(Endpoint::Control, &command.to_bytes(), label)
            .await
        {
            error!("{} not delivered: {}", label, e);
        }
    }

    /// Turn a notification into a stored chunk and a machine event
    fn accept(
        notification: Notification,
        reassembler: &mut FrameReassembler,
    ) -> Option<FetchEvent> {
        if notification.value.is_empty() {
            debug!("Ignoring empty {} notification", notification.endpoint);
            return None;
        }
        match notification.endpoint {
            Endpoint::Control if notification.value.first() == Some(&RESPONSE_MARKER) => {
                debug!("Control <- {:02X?}", notification.value.as_ref());
                let frame = ControlFrame::parse(&notification.value);
                reassembler.push(RawChunk::control(notification.value));
                frame.map(FetchEvent::Control)
            }
            Endpoint::Control | Endpoint::Data => {
                let len = notification.value.len();
                reassembler.push(RawChunk::data(notification.value));
                Some(FetchEvent::Data { len })
            }
            _ => None,
        }
    }

    async fn apply(&self, actions: Vec<FetchAction>, timers: &mut Timers) -> Option<FetchOutcome> {
        for action in actions {
            // deadlines count from after any preceding write was delivered
            match action {
                FetchAction::Send(command) => self.send(command).await,
                FetchAction::ArmPhaseDeadline(after) => {
                    timers.phase = Some(Instant::now() + after);
                }
                FetchAction::DisarmPhaseDeadline => timers.phase = None,
                FetchAction::ScheduleRetry(after) => timers.retry = Some(Instant::now() + after),
                FetchAction::ScheduleStartTransfer(after) => {
                    timers.start_transfer = Some(Instant::now() + after);
                }
                FetchAction::ArmInactivity(after) => {
                    timers.inactivity = Some(Instant::now() + after);
                }
                FetchAction::DisarmInactivity => timers.inactivity = None,
                FetchAction::Finalize(outcome) => {
                    *timers = Timers::default();
                    return Some(outcome);
                }
            }
        }
        None
    }

    /// Run the session to completion
    ///
    /// Once negotiation has started the session always ends with a summary:
    /// empty when nothing arrived, partial when the transfer was cut short.
    ///
    /// # Errors
    ///
    /// Returns an error only if the notification channels cannot be set up.
    pub async fn run(self) -> Result<ActivitySummary> {
        let transport = self.writer.transport().clone();
        if let Err(e) = self.prepare_channels().await {
            self.release_channels().await;
            self.events.emit(SyncEvent::Failed {
                reason: e.to_string(),
            });
            return Err(e);
        }
        let mut notifications = match transport.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                self.release_channels().await;
                self.events.emit(SyncEvent::Failed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let mut machine = FetchMachine::new(self.config.clone());
        let mut reassembler = FrameReassembler::new();
        let mut timers = Timers::default();
        let progress_interval = Duration::from_millis(self.config.progress_interval_ms);
        let mut last_progress: Option<Instant> = None;
        let mut next_log_at = LOG_EVERY_BYTES;

        info!("Starting activity fetch");
        let mut outcome = self.apply(machine.handle(FetchEvent::Start), &mut timers).await;

        while outcome.is_none() {
            let event = tokio::select! {
                biased;
                () = self.abort.notified() => Some(FetchEvent::Cancelled),
                next = notifications.next() => match next {
                    Some(notification) => Self::accept(notification, &mut reassembler),
                    None => Some(FetchEvent::LinkLost),
                },
                () = sleep_until(timers.inactivity) => {
                    timers.inactivity = None;
                    Some(FetchEvent::InactivityTimeout)
                }
                () = sleep_until(timers.start_transfer) => {
                    timers.start_transfer = None;
                    Some(FetchEvent::StartTransferDue)
                }
                () = sleep_until(timers.retry) => {
                    timers.retry = None;
                    Some(FetchEvent::RetryDue)
                }
                () = sleep_until(timers.phase) => {
                    timers.phase = None;
                    Some(FetchEvent::PhaseDeadline)
                }
            };
            let Some(event) = event else {
                continue;
            };

            outcome = self.apply(machine.handle(event), &mut timers).await;

            if let FetchEvent::Data { .. } = event {
                let bytes_received = machine.bytes_received();
                if bytes_received >= next_log_at {
                    debug!("Received {} bytes", bytes_received);
                    next_log_at = (bytes_received / LOG_EVERY_BYTES + 1) * LOG_EVERY_BYTES;
                }
                let due = last_progress.is_none_or(|at| at.elapsed() >= progress_interval);
                if due {
                    last_progress = Some(Instant::now());
                    self.events.emit(SyncEvent::Progress { bytes_received });
                }
            }
        }

        let outcome = outcome.unwrap_or(FetchOutcome::Cancelled);
        drop(notifications);
        Ok(self.finish(&mut machine, &reassembler, outcome).await)
    }

    async fn finish(
        &self,
        machine: &mut FetchMachine,
        reassembler: &FrameReassembler,
        outcome: FetchOutcome,
    ) -> ActivitySummary {
        let sync_timestamp = Utc::now();
        let bytes_received = machine.bytes_received();

        let summary = if bytes_received == 0 {
            ActivitySummary::empty(sync_timestamp, outcome)
        } else {
            let buffer = reassembler.finish();
            let decoded = self.decoder.decode_with_origin(&buffer, sync_timestamp);
            StatsAggregator::new().summarize(decoded, sync_timestamp, bytes_received, outcome)
        };

        let state = machine.settle(outcome);
        info!(
            "Fetch {} ({}): {} bytes, {} points, {:.2} km",
            state,
            outcome,
            bytes_received,
            summary.points.len(),
            summary.distance_km
        );

        self.release_channels().await;
        if outcome == FetchOutcome::NoResponse {
            self.events.emit(SyncEvent::Failed {
                reason: self.negotiation_timeout().to_string(),
            });
        }
        self.events.emit(SyncEvent::Completed(Box::new(summary.clone())));
        summary
    }
}
