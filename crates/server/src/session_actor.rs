//! Session actor: owns a ProcessSession and its state machine.
//!
//! Each session runs as an independent tokio task that serializes process
//! output, operator commands and presence updates. External callers go
//! through `SessionActorHandle`; snapshot reads are lock-free via `ArcSwap`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use armdock_connectors::{DisconnectSignals, ProcessEvent, PromptExtractor, RoleHints};
use armdock_protocol::{Robot, ServerMessage, SessionDetail, SessionKind, SessionSnapshot};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::calibration::{self, CalibrationRun};
use crate::config::TERMINATE_GRACE;
use crate::effect::Effect;
use crate::error::SessionError;
use crate::fanout::{LiveFanout, Topic};
use crate::fleet::PresenceSnapshot;
use crate::session::ProcessSession;
use crate::session_command::{CalibrationAction, Reply, SessionCommand, TeleopAction};
use crate::teleop::{self, TeleopRun};

const COMMAND_CAPACITY: usize = 64;

/// Shared services every actor uses
#[derive(Clone)]
pub struct ActorContext {
    pub extractor: Arc<PromptExtractor>,
    pub fanout: Arc<LiveFanout>,
}

pub struct TeleopMachine {
    run: TeleopRun,
    leader_port: String,
    follower_port: String,
    hints: RoleHints,
    /// Absolute log index up to which disconnect errors were counted
    scanned: u64,
}

impl TeleopMachine {
    pub fn new(leader: &Robot, follower: &Robot, grace: Duration) -> Self {
        Self {
            run: TeleopRun::new(leader.id.clone(), follower.id.clone(), grace),
            leader_port: leader.com_port.clone(),
            follower_port: follower.com_port.clone(),
            hints: RoleHints {
                leader: vec![leader.com_port.clone()],
                follower: vec![follower.com_port.clone()],
            },
            scanned: 0,
        }
    }
}

pub enum Machine {
    Calibration(CalibrationRun),
    Teleop(TeleopMachine),
}

impl Machine {
    fn detail(&self) -> SessionDetail {
        match self {
            Machine::Calibration(run) => SessionDetail::Calibration(run.detail()),
            Machine::Teleop(m) => SessionDetail::Teleop(m.run.detail()),
        }
    }
}

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl SessionActorHandle {
    /// Start the actor for an already-spawned session.
    ///
    /// The first snapshot is published before this returns.
    pub fn spawn(
        session: ProcessSession,
        machine: Machine,
        events: Option<mpsc::Receiver<ProcessEvent>>,
        ctx: ActorContext,
    ) -> SessionActorHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let id = session.id().to_string();
        let actor = SessionActor::start(session, machine, ctx);
        let snapshot = actor.snapshot.clone();

        tokio::spawn(actor.run(events, command_rx));

        SessionActorHandle {
            id,
            command_tx,
            snapshot,
        }
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    /// Send a command and wait for its reply.
    pub async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::NotFound(self.id.clone()))?;
        rx.await
            .map_err(|_| SessionError::NotFound(self.id.clone()))?
    }

    /// Try to send a command without awaiting.
    pub fn try_send(&self, cmd: SessionCommand) {
        if self.command_tx.try_send(cmd).is_err() {
            debug!(
                component = "session_actor",
                session_id = %self.id,
                "Actor channel full or closed"
            );
        }
    }

    /// Stop the process and end the actor. Returns once the process is gone.
    pub async fn cancel(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(SessionCommand::Cancel { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct SessionActor {
    session: ProcessSession,
    machine: Machine,
    ctx: ActorContext,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    exit_fed: bool,
    /// Exit observed while terminating, applied once the current step ends
    pending_exit: Option<i32>,
}

impl SessionActor {
    fn start(session: ProcessSession, mut machine: Machine, ctx: ActorContext) -> Self {
        let dry_run = session.dry_run();
        match &mut machine {
            Machine::Calibration(run) => {
                match calibration::transition(run, calibration::Input::Spawned { dry_run }) {
                    Ok((next, _)) => *run = next,
                    Err(e) => warn!(
                        component = "session_actor",
                        session_id = %session.id(),
                        error = %e,
                        "Calibration did not accept spawn"
                    ),
                }
            }
            Machine::Teleop(m) => {
                let (next, _) = teleop::transition(
                    &m.run,
                    teleop::Input::Spawned {
                        dry_run,
                        at: Instant::now(),
                    },
                );
                m.run = next;
            }
        }

        let first = session.snapshot(machine.detail());
        ctx.fanout.publish(
            Topic::Session(first.id.clone()),
            ServerMessage::SessionSnapshot {
                session: first.clone(),
            },
        );
        info!(
            component = "session_actor",
            event = "session.started",
            session_id = %first.id,
            kind = ?first.kind(),
            dry_run,
            "Session actor started"
        );

        Self {
            session,
            machine,
            ctx,
            snapshot: Arc::new(ArcSwap::from_pointee(first)),
            exit_fed: false,
            pending_exit: None,
        }
    }

    async fn run(
        mut self,
        mut events: Option<mpsc::Receiver<ProcessEvent>>,
        mut command_rx: mpsc::Receiver<SessionCommand>,
    ) {
        loop {
            tokio::select! {
                event = next_event(&mut events) => match event {
                    Some(event) => self.on_event(event, &mut events).await,
                    None => {
                        events = None;
                        if !self.exit_fed {
                            let code = self
                                .session
                                .connector()
                                .and_then(|c| c.exit_code())
                                .unwrap_or(-1);
                            self.pending_exit = Some(code);
                        }
                    }
                },
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd, &mut events).await {
                            break;
                        }
                    }
                    None => {
                        // Every handle is gone; nothing can stop the process later.
                        self.session.terminate(TERMINATE_GRACE).await;
                        break;
                    }
                },
            }

            if let Some(code) = self.pending_exit.take() {
                let effects = self.advance(Some(code));
                if let Err(e) = self.apply_effects(effects, &mut events).await {
                    debug!(
                        component = "session_actor",
                        session_id = %self.session.id(),
                        error = %e,
                        "Effect after exit failed"
                    );
                }
                self.publish();
            }
        }

        info!(
            component = "session_actor",
            event = "session.actor_stopped",
            session_id = %self.session.id(),
            return_code = ?self.session.return_code(),
            "Session actor stopped"
        );
    }

    /// Returns false once the actor should stop.
    async fn handle_command(
        &mut self,
        cmd: SessionCommand,
        events: &mut Option<mpsc::Receiver<ProcessEvent>>,
    ) -> bool {
        match cmd {
            SessionCommand::Calibration { action, reply } => {
                let input = match action {
                    CalibrationAction::Override(choice) => calibration::Input::Override(choice),
                    CalibrationAction::BeginSweep => calibration::Input::BeginSweep,
                    CalibrationAction::FinishSweep => calibration::Input::FinishSweep,
                    CalibrationAction::RawInput(text) => calibration::Input::RawInput(text),
                };
                let result = match self.require_calibration_process() {
                    Ok(()) => self.step_calibration(input, events).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Teleop { action, reply } => {
                let result = self.teleop_action(action, events).await;
                let _ = reply.send(result);
            }
            SessionCommand::TakeCapture { reply } => {
                let result = match &self.machine {
                    Machine::Calibration(run) => run.captured_joints(),
                    Machine::Teleop(_) => Err(wrong_kind(self.session.id(), SessionKind::Calibration)),
                };
                let _ = reply.send(result);
            }
            SessionCommand::MarkSaved { reply } => {
                let result = self.step_calibration(calibration::Input::Saved, events).await;
                let _ = reply.send(result);
            }
            SessionCommand::Presence { presence, at } => {
                let effects = self.on_presence(&presence, at);
                if let Err(e) = self.apply_effects(effects, events).await {
                    debug!(
                        component = "session_actor",
                        session_id = %self.session.id(),
                        error = %e,
                        "Effect after presence update failed"
                    );
                }
            }
            SessionCommand::Cancel { reply } => {
                self.cancel(events).await;
                let _ = reply.send(());
                return false;
            }
        }
        self.publish();
        true
    }

    async fn on_event(
        &mut self,
        first: ProcessEvent,
        events: &mut Option<mpsc::Receiver<ProcessEvent>>,
    ) {
        // Batch whatever is already queued so a burst of output costs one
        // extraction pass and one snapshot.
        let mut exit = self.ingest(first);
        if let Some(rx) = events.as_mut() {
            while exit.is_none() {
                match rx.try_recv() {
                    Ok(event) => exit = self.ingest(event),
                    Err(_) => break,
                }
            }
        }
        if exit.is_some() {
            *events = None;
        }

        let effects = self.advance(exit);
        if let Err(e) = self.apply_effects(effects, events).await {
            debug!(
                component = "session_actor",
                session_id = %self.session.id(),
                error = %e,
                "Effect after output failed"
            );
        }
        self.publish();
    }

    fn ingest(&mut self, event: ProcessEvent) -> Option<i32> {
        match event {
            ProcessEvent::Output { line, .. } => {
                self.session.append_output(line);
                None
            }
            ProcessEvent::Exited { code } => Some(code),
        }
    }

    /// Re-derive signals from the log buffer and feed the machine.
    fn advance(&mut self, exit: Option<i32>) -> Vec<Effect> {
        let exit = exit.filter(|_| !self.exit_fed);
        if let Some(code) = exit {
            self.session.on_exit(code);
            self.exit_fed = true;
        }
        let signals = self.ctx.extractor.extract(self.session.logs());

        match &mut self.machine {
            Machine::Calibration(run) => {
                let input = match exit {
                    Some(code) => calibration::Input::Exited { code, signals },
                    None => calibration::Input::Output(signals),
                };
                match calibration::transition(run, input) {
                    Ok((next, effects)) => {
                        *run = next;
                        effects
                    }
                    Err(e) => {
                        warn!(
                            component = "session_actor",
                            session_id = %self.session.id(),
                            error = %e,
                            "Calibration rejected process output"
                        );
                        Vec::new()
                    }
                }
            }
            Machine::Teleop(m) => {
                let disconnects = scan_disconnects(&self.ctx.extractor, &self.session, m);
                let (next, mut effects) = teleop::transition(
                    &m.run,
                    teleop::Input::Output {
                        signals,
                        disconnects,
                    },
                );
                m.run = next;
                if let Some(code) = exit {
                    let (next, more) = teleop::transition(&m.run, teleop::Input::Exited { code });
                    m.run = next;
                    effects.extend(more);
                }
                effects
            }
        }
    }

    fn on_presence(&mut self, presence: &PresenceSnapshot, at: Instant) -> Vec<Effect> {
        let Machine::Teleop(m) = &mut self.machine else {
            return Vec::new();
        };
        let (next, effects) = teleop::transition(
            &m.run,
            teleop::Input::Presence {
                leader_online: presence.contains_key(&m.leader_port),
                follower_online: presence.contains_key(&m.follower_port),
                at,
            },
        );
        m.run = next;
        effects
    }

    async fn step_calibration(
        &mut self,
        input: calibration::Input,
        events: &mut Option<mpsc::Receiver<ProcessEvent>>,
    ) -> Result<(), SessionError> {
        let Machine::Calibration(run) = &mut self.machine else {
            return Err(wrong_kind(self.session.id(), SessionKind::Calibration));
        };
        let (next, effects) = calibration::transition(run, input)?;
        *run = next;
        self.apply_effects(effects, events).await
    }

    /// Operator actions that write to stdin need a live calibration process.
    /// A dry-run or exited session has none.
    fn require_calibration_process(&self) -> Result<(), SessionError> {
        if !matches!(self.machine, Machine::Calibration(_)) {
            return Err(wrong_kind(self.session.id(), SessionKind::Calibration));
        }
        if !self.session.running() {
            return Err(SessionError::NotRunning(self.session.id().to_string()));
        }
        Ok(())
    }

    async fn teleop_action(
        &mut self,
        action: TeleopAction,
        events: &mut Option<mpsc::Receiver<ProcessEvent>>,
    ) -> Result<(), SessionError> {
        let total = self.session.total_lines();
        let exited = !self.session.running() && !self.session.dry_run();
        let Machine::Teleop(m) = &mut self.machine else {
            return Err(wrong_kind(self.session.id(), SessionKind::Teleop));
        };
        let input = match action {
            TeleopAction::Stop if exited || !m.run.is_active() => {
                return Err(SessionError::NotRunning(self.session.id().to_string()));
            }
            TeleopAction::Stop => teleop::Input::Stop,
            TeleopAction::ClearDisconnects => {
                m.scanned = total;
                teleop::Input::ClearDisconnects { log_mark: total }
            }
        };
        let (next, effects) = teleop::transition(&m.run, input);
        m.run = next;
        self.apply_effects(effects, events).await
    }

    async fn cancel(&mut self, events: &mut Option<mpsc::Receiver<ProcessEvent>>) {
        let effects = match &mut self.machine {
            Machine::Calibration(run) => match calibration::transition(run, calibration::Input::Cancel) {
                Ok((next, effects)) => {
                    *run = next;
                    effects
                }
                Err(_) => vec![Effect::Terminate],
            },
            Machine::Teleop(m) => {
                let (next, effects) = teleop::transition(&m.run, teleop::Input::Stop);
                m.run = next;
                effects
            }
        };
        if let Err(e) = self.apply_effects(effects, events).await {
            debug!(
                component = "session_actor",
                session_id = %self.session.id(),
                error = %e,
                "Effect during cancel failed"
            );
        }
        // No process outlives a cancelled session.
        self.terminate(events).await;
        if let Some(code) = self.pending_exit.take() {
            self.advance(Some(code));
        }
        self.publish();
        info!(
            component = "session_actor",
            event = "session.cancelled",
            session_id = %self.session.id(),
            return_code = ?self.session.return_code(),
            "Session cancelled"
        );
    }

    /// Run effects in order. Every effect is attempted; the first error is returned.
    async fn apply_effects(
        &mut self,
        effects: Vec<Effect>,
        events: &mut Option<mpsc::Receiver<ProcessEvent>>,
    ) -> Result<(), SessionError> {
        let mut result = Ok(());
        for effect in effects {
            match effect {
                Effect::Write(cmd) => {
                    if let Err(e) = self.session.write_input(&cmd.bytes()).await {
                        warn!(
                            component = "session_actor",
                            event = "session.stdin.failed",
                            session_id = %self.session.id(),
                            error = %e,
                            "Failed to write to process stdin"
                        );
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
                Effect::Terminate => self.terminate(events).await,
            }
        }
        result
    }

    /// Interrupt then kill, still collecting output while the process winds down.
    async fn terminate(&mut self, events: &mut Option<mpsc::Receiver<ProcessEvent>>) {
        let Some(connector) = self.session.connector() else {
            return;
        };
        if connector.has_exited() {
            return;
        }

        let stop = connector.terminate(TERMINATE_GRACE);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = next_event(events) => match event {
                    Some(event) => {
                        if let Some(code) = self.ingest(event) {
                            self.pending_exit = Some(code);
                            *events = None;
                        }
                    }
                    None => *events = None,
                },
            }
        }

        if self.pending_exit.is_none() && !self.exit_fed {
            self.pending_exit = connector.exit_code();
        }
    }

    fn publish(&mut self) {
        let detail = self.machine.detail();
        let current = self.snapshot.load_full();
        if current.detail != detail {
            self.session.touch();
        }
        let next = self.session.snapshot(detail);
        if *current == next {
            return;
        }
        self.snapshot.store(Arc::new(next.clone()));
        self.ctx.fanout.publish(
            Topic::Session(next.id.clone()),
            ServerMessage::SessionSnapshot { session: next },
        );
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ProcessEvent>>) -> Option<ProcessEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Disconnect errors that arrived since the last scan and the last clear.
fn scan_disconnects(
    extractor: &PromptExtractor,
    session: &ProcessSession,
    machine: &mut TeleopMachine,
) -> DisconnectSignals {
    let first = session.first_line_index();
    let from = machine.scanned.max(machine.run.log_mark).max(first);
    let context = extractor.markers().disconnect_context as u64;
    let start = from.saturating_sub(context).max(first);
    machine.scanned = session.total_lines();
    extractor.detect_disconnects(session.logs_since(start), (from - start) as usize, &machine.hints)
}

fn wrong_kind(session_id: &str, expected: SessionKind) -> SessionError {
    let kind = match expected {
        SessionKind::Calibration => "calibration",
        SessionKind::Teleop => "teleop",
    };
    SessionError::PreconditionFailed(format!("Session {session_id} is not a {kind} session"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use armdock_connectors::CommandSpec;
    use armdock_protocol::{CalibrationPhase, RobotRole, SessionSubject, TeleopPhase};

    use crate::calibration::OverrideChoice;
    use crate::config::{LOG_CAPACITY, NEAR_ZERO_SPAN, TELEOP_PRESENCE_GRACE};

    fn ctx() -> ActorContext {
        ActorContext {
            extractor: Arc::new(PromptExtractor::default()),
            fanout: Arc::new(LiveFanout::new()),
        }
    }

    fn calibration_session() -> ProcessSession {
        ProcessSession::new(
            SessionKind::Calibration,
            SessionSubject::Robot {
                robot_id: "r1".into(),
            },
            LOG_CAPACITY,
        )
    }

    fn robot(id: &str, role: RobotRole, port: &str) -> Robot {
        Robot {
            id: id.into(),
            name: id.into(),
            model: "so101".into(),
            role,
            com_port: port.into(),
            has_calibration: true,
            calibration: None,
            last_seen: None,
        }
    }

    fn calibration_phase(snapshot: &SessionSnapshot) -> Option<CalibrationPhase> {
        match &snapshot.detail {
            SessionDetail::Calibration(detail) => Some(detail.phase),
            SessionDetail::Teleop(_) => None,
        }
    }

    async fn wait_for(
        handle: &SessionActorHandle,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> Arc<SessionSnapshot> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = handle.snapshot();
            if pred(&snapshot) {
                return snapshot;
            }
            assert!(Instant::now() < deadline, "timed out waiting for snapshot");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn dry_run_calibration_is_captured_then_saved() {
        let ctx = ctx();
        let mut session = calibration_session();
        let events = session
            .spawn(&CommandSpec::new("python").arg("-m").arg("tool"), true)
            .expect("dry-run");
        let handle = SessionActorHandle::spawn(
            session,
            Machine::Calibration(CalibrationRun::new(NEAR_ZERO_SPAN)),
            events,
            ctx.clone(),
        );

        let snapshot = handle.snapshot();
        assert_eq!(calibration_phase(&snapshot), Some(CalibrationPhase::Captured));
        assert!(snapshot.logs[0].starts_with("[dry-run]"));
        assert!(ctx.fanout.last(&Topic::Session(handle.id.clone())).is_some());

        let joints = handle
            .request(|reply| SessionCommand::TakeCapture { reply })
            .await
            .expect("capture");
        assert!(joints.is_empty());
        handle
            .request(|reply| SessionCommand::MarkSaved { reply })
            .await
            .expect("saved");
        assert_eq!(
            calibration_phase(&handle.snapshot()),
            Some(CalibrationPhase::Saved)
        );
    }

    async fn calibration_request(
        handle: &SessionActorHandle,
        action: CalibrationAction,
    ) -> Result<(), SessionError> {
        handle
            .request(|reply| SessionCommand::Calibration { action, reply })
            .await
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn override_then_sweep_captures_streamed_ranges() {
        let script = r#"
echo "Press ENTER to use provided calibration file associated with the id arm, or type 'c' and press ENTER to run calibration"
read answer
echo "answer=$answer"
read start
echo "base | 100 | 2000 | 3900"
echo "elbow | 800 | 1500 | 3000"
echo "wrist | 10 | 500 | 1000"
"#;
        let mut session = calibration_session();
        let events = session
            .spawn(&CommandSpec::new("sh").arg("-c").arg(script), false)
            .expect("spawn");
        let handle = SessionActorHandle::spawn(
            session,
            Machine::Calibration(CalibrationRun::new(NEAR_ZERO_SPAN)),
            events,
            ctx(),
        );
        assert_eq!(
            calibration_phase(&handle.snapshot()),
            Some(CalibrationPhase::AwaitingOutput)
        );

        wait_for(&handle, |s| {
            calibration_phase(s) == Some(CalibrationPhase::AwaitingOverrideDecision)
        })
        .await;

        calibration_request(&handle, CalibrationAction::Override(OverrideChoice::Recalibrate))
            .await
            .expect("override");
        wait_for(&handle, |s| {
            calibration_phase(s) == Some(CalibrationPhase::AwaitingOutput)
                && s.logs.iter().any(|l| l == "answer=c")
        })
        .await;

        calibration_request(&handle, CalibrationAction::BeginSweep)
            .await
            .expect("begin sweep");

        let snapshot = wait_for(&handle, |s| {
            calibration_phase(s) == Some(CalibrationPhase::Captured)
        })
        .await;
        assert_eq!(snapshot.return_code, Some(0));
        assert!(!snapshot.running);

        let joints = handle
            .request(|reply| SessionCommand::TakeCapture { reply })
            .await
            .expect("capture");
        let names: Vec<_> = joints.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["base", "elbow", "wrist"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sweep_blocks_until_begin_is_sent() {
        let script = r#"
read start
echo "base | 100 | 2000 | 3900"
read finish
"#;
        let mut session = calibration_session();
        let events = session
            .spawn(&CommandSpec::new("sh").arg("-c").arg(script), false)
            .expect("spawn");
        let handle = SessionActorHandle::spawn(
            session,
            Machine::Calibration(CalibrationRun::new(NEAR_ZERO_SPAN)),
            events,
            ctx(),
        );

        calibration_request(&handle, CalibrationAction::BeginSweep)
            .await
            .expect("begin sweep");
        wait_for(&handle, |s| {
            calibration_phase(s) == Some(CalibrationPhase::Sweeping)
                && s.logs.iter().any(|l| l.starts_with("base"))
        })
        .await;

        calibration_request(&handle, CalibrationAction::FinishSweep)
            .await
            .expect("finish sweep");
        wait_for(&handle, |s| {
            calibration_phase(s) == Some(CalibrationPhase::Captured)
        })
        .await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn input_after_exit_is_not_running() {
        let mut session = calibration_session();
        let events = session
            .spawn(&CommandSpec::new("sh").arg("-c").arg("exit 0"), false)
            .expect("spawn");
        let handle = SessionActorHandle::spawn(
            session,
            Machine::Calibration(CalibrationRun::new(NEAR_ZERO_SPAN)),
            events,
            ctx(),
        );
        wait_for(&handle, |s| !s.running && s.return_code.is_some()).await;

        for action in [
            CalibrationAction::RawInput("x".into()),
            CalibrationAction::BeginSweep,
            CalibrationAction::FinishSweep,
            CalibrationAction::Override(OverrideChoice::KeepExisting),
        ] {
            assert!(matches!(
                calibration_request(&handle, action).await,
                Err(SessionError::NotRunning(_))
            ));
        }
    }

    #[tokio::test]
    async fn dry_run_calibration_rejects_input() {
        let mut session = calibration_session();
        let events = session
            .spawn(&CommandSpec::new("python"), true)
            .expect("dry-run");
        let handle = SessionActorHandle::spawn(
            session,
            Machine::Calibration(CalibrationRun::new(NEAR_ZERO_SPAN)),
            events,
            ctx(),
        );
        assert!(matches!(
            calibration_request(&handle, CalibrationAction::RawInput("c".into())).await,
            Err(SessionError::NotRunning(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_after_teleop_exit_is_not_running() {
        let leader = robot("l", RobotRole::Leader, "/dev/ttyACM0");
        let follower = robot("f", RobotRole::Follower, "/dev/ttyACM1");
        let mut session = ProcessSession::new(
            SessionKind::Teleop,
            SessionSubject::Pair {
                leader_id: "l".into(),
                follower_id: "f".into(),
            },
            LOG_CAPACITY,
        );
        let events = session
            .spawn(&CommandSpec::new("sh").arg("-c").arg("exit 1"), false)
            .expect("spawn");
        let handle = SessionActorHandle::spawn(
            session,
            Machine::Teleop(TeleopMachine::new(&leader, &follower, TELEOP_PRESENCE_GRACE)),
            events,
            ctx(),
        );
        let snapshot = wait_for(&handle, |s| !s.running && s.return_code.is_some()).await;
        let SessionDetail::Teleop(detail) = &snapshot.detail else {
            panic!("expected teleop detail");
        };
        assert_eq!(detail.phase, TeleopPhase::Stopped);

        let stop = handle
            .request(|reply| SessionCommand::Teleop {
                action: TeleopAction::Stop,
                reply,
            })
            .await;
        assert!(matches!(stop, Err(SessionError::NotRunning(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_stops_process_and_ends_actor() {
        let mut session = calibration_session();
        let events = session
            .spawn(&CommandSpec::new("sh").arg("-c").arg("sleep 30"), false)
            .expect("spawn");
        let handle = SessionActorHandle::spawn(
            session,
            Machine::Calibration(CalibrationRun::new(NEAR_ZERO_SPAN)),
            events,
            ctx(),
        );

        handle.cancel().await;
        let snapshot = handle.snapshot();
        assert_eq!(calibration_phase(&snapshot), Some(CalibrationPhase::Cancelled));
        assert!(!snapshot.running);
        assert!(snapshot.return_code.is_some());

        let after = handle
            .request(|reply| SessionCommand::TakeCapture { reply })
            .await;
        assert!(matches!(after, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn teleop_presence_marks_missing_arm_disconnected() {
        let leader = robot("l", RobotRole::Leader, "/dev/ttyACM0");
        let follower = robot("f", RobotRole::Follower, "/dev/ttyACM1");
        let mut session = ProcessSession::new(
            SessionKind::Teleop,
            SessionSubject::Pair {
                leader_id: "l".into(),
                follower_id: "f".into(),
            },
            LOG_CAPACITY,
        );
        let events = session
            .spawn(&CommandSpec::new("python"), true)
            .expect("dry-run");
        let handle = SessionActorHandle::spawn(
            session,
            Machine::Teleop(TeleopMachine::new(&leader, &follower, TELEOP_PRESENCE_GRACE)),
            events,
            ctx(),
        );

        let presence: PresenceSnapshot = [("/dev/ttyACM0".to_string(), String::new())]
            .into_iter()
            .collect();
        handle.try_send(SessionCommand::Presence {
            presence: Arc::new(presence),
            at: Instant::now() + Duration::from_secs(5),
        });

        let snapshot = wait_for(&handle, |s| match &s.detail {
            SessionDetail::Teleop(d) => !d.disconnected_roles.is_empty(),
            SessionDetail::Calibration(_) => false,
        })
        .await;
        let SessionDetail::Teleop(detail) = &snapshot.detail else {
            panic!("expected teleop detail");
        };
        assert_eq!(detail.disconnected_roles, vec![RobotRole::Follower]);
        assert_eq!(detail.phase, TeleopPhase::Running);

        handle
            .request(|reply| SessionCommand::Teleop {
                action: TeleopAction::ClearDisconnects,
                reply,
            })
            .await
            .expect("clear");
        let SessionDetail::Teleop(detail) = &handle.snapshot().detail else {
            panic!("expected teleop detail");
        };
        assert!(detail.disconnected_roles.is_empty());

        let wrong = handle
            .request(|reply| SessionCommand::Calibration {
                action: CalibrationAction::BeginSweep,
                reply,
            })
            .await;
        assert!(matches!(wrong, Err(SessionError::PreconditionFailed(_))));
    }
}
