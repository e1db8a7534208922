//! ProcessSession: one supervised external process plus its output

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use armdock_connectors::{CommandSpec, ProcessConnector, ProcessEvent};
use armdock_protocol::{new_id, SessionDetail, SessionKind, SessionSnapshot, SessionSubject};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::SessionError;

pub struct ProcessSession {
    id: String,
    kind: SessionKind,
    subject: SessionSubject,
    logs: VecDeque<String>,
    capacity: usize,
    /// Lines ever appended, including evicted ones
    total_lines: u64,
    running: bool,
    return_code: Option<i32>,
    exited: bool,
    dry_run: bool,
    command: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    connector: Option<Arc<ProcessConnector>>,
}

impl ProcessSession {
    pub fn new(kind: SessionKind, subject: SessionSubject, capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            kind,
            subject,
            logs: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            total_lines: 0,
            running: false,
            return_code: None,
            exited: false,
            dry_run: false,
            command: None,
            created_at: now,
            updated_at: now,
            connector: None,
        }
    }

    /// Launch `spec`, or under dry-run only record it and finish successfully.
    ///
    /// Returns the process event stream when a real process was started.
    pub fn spawn(
        &mut self,
        spec: &CommandSpec,
        dry_run: bool,
    ) -> Result<Option<mpsc::Receiver<ProcessEvent>>, SessionError> {
        let command_line = spec.display();
        self.command = Some(command_line.clone());

        if dry_run {
            self.dry_run = true;
            self.append_output(format!("[dry-run] {command_line}"));
            self.running = false;
            self.return_code = Some(0);
            self.exited = true;
            info!(
                component = "session",
                event = "session.dry_run",
                session_id = %self.id,
                command = %command_line,
                "Dry-run session, no process started"
            );
            return Ok(None);
        }

        let mut connector =
            ProcessConnector::spawn(spec).map_err(|e| SessionError::Spawn(e.to_string()))?;
        let events = connector.take_event_rx();
        self.connector = Some(Arc::new(connector));
        self.running = true;
        self.touch();
        Ok(events)
    }

    /// Append one line of output, evicting the oldest past capacity.
    pub fn append_output(&mut self, line: String) {
        if self.logs.len() == self.capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
        self.total_lines += 1;
        self.touch();
    }

    /// Record process exit. Only the first call has any effect.
    pub fn on_exit(&mut self, code: i32) -> bool {
        if self.exited {
            return false;
        }
        self.exited = true;
        self.running = false;
        self.return_code = Some(code);
        self.touch();
        true
    }

    pub async fn write_input(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let connector = match &self.connector {
            Some(connector) if self.running => connector,
            _ => return Err(SessionError::NotRunning(self.id.clone())),
        };
        connector
            .write_input(bytes)
            .await
            .map_err(|e| SessionError::from_connector(&self.id, e))
    }

    /// Handle for terminating the process without borrowing the session.
    pub fn connector(&self) -> Option<Arc<ProcessConnector>> {
        self.connector.clone()
    }

    /// Interrupt, then kill after `grace`. A no-op once exited.
    pub async fn terminate(&mut self, grace: Duration) {
        let Some(connector) = self.connector.clone() else {
            return;
        };
        connector.terminate(grace).await;
        match connector.exit_code() {
            Some(code) => {
                self.on_exit(code);
            }
            None => warn!(
                component = "session",
                event = "session.terminate.unconfirmed",
                session_id = %self.id,
                "Process exit not confirmed after termination"
            ),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn subject(&self) -> &SessionSubject {
        &self.subject
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    pub fn logs(&self) -> impl Iterator<Item = &str> + '_ {
        self.logs.iter().map(String::as_str)
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    /// Absolute index of the oldest buffered line.
    pub fn first_line_index(&self) -> u64 {
        self.total_lines - self.logs.len() as u64
    }

    /// Buffered lines whose absolute index is at least `from`.
    pub fn logs_since(&self, from: u64) -> impl Iterator<Item = &str> + '_ {
        let skip = from.saturating_sub(self.first_line_index()) as usize;
        self.logs.iter().skip(skip).map(String::as_str)
    }

    pub fn snapshot(&self, detail: SessionDetail) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            subject: self.subject.clone(),
            logs: self.logs.iter().cloned().collect(),
            running: self.running,
            return_code: self.return_code,
            dry_run: self.dry_run,
            command: self.command.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            detail,
        }
    }

    /// Mark derived state as changed.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
