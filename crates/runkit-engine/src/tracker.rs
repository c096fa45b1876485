use std::collections::BTreeMap;

use log::{debug, warn};
use runkit_backend::{ActiveOperation, MajorVersion, OperationKind, RuntimeError, RuntimeKind};
use tokio::sync::{mpsc, oneshot, watch};

/// Observable state of one kind's operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationSnapshot {
    pub in_flight: Option<ActiveOperation>,
    /// Progress in `[0.0, 1.0]` of majors with a running operation.
    pub progress: BTreeMap<MajorVersion, f64>,
    /// Last error message per major, cleared when an operation on that
    /// major starts again.
    pub errors: BTreeMap<MajorVersion, String>,
}

enum Command {
    Begin {
        operation: ActiveOperation,
        reply: oneshot::Sender<Result<u64, ActiveOperation>>,
    },
    Progress {
        ticket: u64,
        fraction: f64,
    },
    Finish {
        ticket: u64,
        error: Option<String>,
    },
}

struct TrackerState {
    kind: RuntimeKind,
    next_ticket: u64,
    active: Option<(u64, ActiveOperation)>,
    progress: BTreeMap<MajorVersion, f64>,
    errors: BTreeMap<MajorVersion, String>,
}

impl TrackerState {
    fn new(kind: RuntimeKind) -> Self {
        Self {
            kind,
            next_ticket: 0,
            active: None,
            progress: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    fn begin(&mut self, operation: ActiveOperation) -> Result<u64, ActiveOperation> {
        if let Some((_, active)) = &self.active {
            return Err(active.clone());
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        if let Some(major) = &operation.major {
            self.errors.remove(major);
            self.progress.insert(major.clone(), 0.0);
        }
        debug!("{} {operation} started", self.kind);
        self.active = Some((ticket, operation));
        Ok(ticket)
    }

    fn active_major(&self, ticket: u64) -> Option<Option<&MajorVersion>> {
        match &self.active {
            Some((active, operation)) if *active == ticket => Some(operation.major.as_ref()),
            _ => None,
        }
    }

    fn progress(&mut self, ticket: u64, fraction: f64) {
        let Some(Some(major)) = self.active_major(ticket) else {
            return;
        };
        let major = major.clone();
        let fraction = fraction.clamp(0.0, 1.0);
        let entry = self.progress.entry(major).or_insert(0.0);
        if fraction > *entry {
            *entry = fraction;
        }
    }

    fn finish(&mut self, ticket: u64, error: Option<String>) {
        if self.active_major(ticket).is_none() {
            return;
        }
        let Some((_, operation)) = self.active.take() else {
            return;
        };

        if let Some(major) = &operation.major {
            self.progress.remove(major);
            if let Some(message) = &error {
                self.errors.insert(major.clone(), message.clone());
            }
        }
        match &error {
            Some(message) => warn!("{} {operation} failed: {message}", self.kind),
            None => debug!("{} {operation} finished", self.kind),
        }
    }

    fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            in_flight: self.active.as_ref().map(|(_, operation)| operation.clone()),
            progress: self.progress.clone(),
            errors: self.errors.clone(),
        }
    }
}

async fn run(
    mut state: TrackerState,
    mut commands: mpsc::UnboundedReceiver<Command>,
    published: watch::Sender<OperationSnapshot>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Begin { operation, reply } => {
                let result = state.begin(operation);
                let ticket = result.as_ref().ok().copied();
                published.send_replace(state.snapshot());
                if reply.send(result).is_err() {
                    // Caller went away before learning it held the guard.
                    if let Some(ticket) = ticket {
                        state.finish(ticket, None);
                    }
                }
            }
            Command::Progress { ticket, fraction } => state.progress(ticket, fraction),
            Command::Finish { ticket, error } => state.finish(ticket, error),
        }
        published.send_replace(state.snapshot());
    }
    debug!("{} operation tracker stopped", state.kind);
}

/// Mailbox of the task that owns a kind's single-flight guard and its
/// progress and error maps.
#[derive(Debug, Clone)]
pub struct OperationTracker {
    kind: RuntimeKind,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<OperationSnapshot>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin { operation, .. } => f.debug_struct("Begin").field("operation", operation).finish(),
            Self::Progress { ticket, fraction } => f
                .debug_struct("Progress")
                .field("ticket", ticket)
                .field("fraction", fraction)
                .finish(),
            Self::Finish { ticket, error } => f
                .debug_struct("Finish")
                .field("ticket", ticket)
                .field("error", error)
                .finish(),
        }
    }
}

impl OperationTracker {
    /// Spawn the owning task. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn(kind: RuntimeKind) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (published, snapshots) = watch::channel(OperationSnapshot::default());
        tokio::spawn(run(TrackerState::new(kind), receiver, published));
        Self {
            kind,
            commands,
            snapshots,
        }
    }

    /// Take the guard, or fail immediately if another operation holds it.
    ///
    /// # Errors
    /// Returns [`RuntimeError::AnotherOperationInProgress`] when the guard is
    /// held, or [`RuntimeError::ManagerClosed`] when the task is gone.
    pub async fn begin(
        &self,
        operation: OperationKind,
        major: Option<MajorVersion>,
    ) -> Result<OperationGuard, RuntimeError> {
        let closed = || RuntimeError::ManagerClosed { kind: self.kind };
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Begin {
                operation: ActiveOperation { operation, major },
                reply,
            })
            .map_err(|_| closed())?;

        match response.await.map_err(|_| closed())? {
            Ok(ticket) => Ok(OperationGuard {
                commands: self.commands.clone(),
                ticket,
                finished: false,
            }),
            Err(active) => Err(RuntimeError::AnotherOperationInProgress {
                kind: self.kind,
                active,
            }),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> OperationSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OperationSnapshot> {
        self.snapshots.clone()
    }
}

/// Holder of the single-flight guard. Dropping it without calling
/// [`OperationGuard::succeed`] or [`OperationGuard::fail`] releases the guard
/// and records the operation as interrupted.
#[derive(Debug)]
pub struct OperationGuard {
    commands: mpsc::UnboundedSender<Command>,
    ticket: u64,
    finished: bool,
}

impl OperationGuard {
    pub fn progress(&self, fraction: f64) {
        let _ = self.commands.send(Command::Progress {
            ticket: self.ticket,
            fraction,
        });
    }

    pub fn succeed(mut self) {
        self.finish(None);
    }

    pub fn fail(mut self, error: &RuntimeError) {
        self.finish(Some(error.to_string()));
    }

    fn finish(&mut self, error: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let _ = self.commands.send(Command::Finish {
            ticket: self.ticket,
            error,
        });
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.finish(Some("operation interrupted".to_string()));
    }
}
