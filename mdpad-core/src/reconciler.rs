//! Client-side reconciliation of local edits against the server's history.
//!
//! The server orders every operation into a single linear history. The
//! client keeps at most one operation in flight and buffers later edits
//! until the server acknowledges it:
//!
//! ```text
//!                 local edit                     local edit
//!  Synchronized ─────────────▶ AwaitingAck ──────────────────▶ AwaitingWithBuffer
//!       ▲                          │    ▲                          │      │
//!       │           ack            │    │          ack             │      │ local edit
//!       └──────────────────────────┘    └──────────────────────────┘      └─▶ (compose)
//!
//!  any protocol violation ─────────▶ Desynchronized (terminal)
//! ```
//!
//! Remote operations are transformed against the in-flight and buffered
//! operations before they reach the local buffer, so both sides converge.
//!
//! The reconciler performs no I/O. Callers feed it events and forward the
//! [`OutgoingOperation`]s and buffer operations it returns.

use std::mem;

use log::{debug, error, warn};
use thiserror::Error;

use crate::model::DocumentSnapshot;
use crate::operation::{char_len, Operation, OtError};

/// Errors that move the reconciler into [`SyncStatus::Desynchronized`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("acknowledgement received with no operation in flight")]
    UnexpectedAck,

    #[error("expected revision {expected}, server sent {actual}")]
    RevisionMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Operation(#[from] OtError),

    #[error("session is desynchronized")]
    Desynchronized,
}

/// Observable reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synchronized,
    AwaitingAck,
    AwaitingWithBuffer,
    Desynchronized,
}

#[derive(Debug, Clone, PartialEq)]
enum SyncState {
    Synchronized,
    AwaitingAck(Operation),
    AwaitingWithBuffer {
        inflight: Operation,
        pending: Operation,
    },
    Desynchronized,
}

/// An operation to send, tagged with the revision it is based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingOperation {
    pub revision: u64,
    pub operation: Operation,
}

/// Outcome of rebasing onto a fresh snapshot after a reconnect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resync {
    /// Local work to resend as the new in-flight operation.
    pub replay: Option<OutgoingOperation>,
    /// Operation moving the local buffer onto the new state.
    pub buffer_update: Option<Operation>,
    /// Unacknowledged local edits could not be rebased and were dropped.
    pub discarded: bool,
}

/// The client sync state machine.
#[derive(Debug, Clone)]
pub struct Reconciler {
    revision: u64,
    confirmed: String,
    state: SyncState,
}

impl Reconciler {
    /// Start synchronized with `snapshot`, whose text the local buffer holds.
    pub fn new(snapshot: &DocumentSnapshot) -> Self {
        Self {
            revision: snapshot.revision,
            confirmed: snapshot.text.clone(),
            state: SyncState::Synchronized,
        }
    }

    pub fn status(&self) -> SyncStatus {
        match self.state {
            SyncState::Synchronized => SyncStatus::Synchronized,
            SyncState::AwaitingAck(_) => SyncStatus::AwaitingAck,
            SyncState::AwaitingWithBuffer { .. } => SyncStatus::AwaitingWithBuffer,
            SyncState::Desynchronized => SyncStatus::Desynchronized,
        }
    }

    /// Number of server operations applied locally.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Document text at [`revision`](Self::revision), excluding local work.
    pub fn confirmed_text(&self) -> &str {
        &self.confirmed
    }

    pub fn inflight(&self) -> Option<&Operation> {
        match &self.state {
            SyncState::AwaitingAck(inflight)
            | SyncState::AwaitingWithBuffer { inflight, .. } => Some(inflight),
            _ => None,
        }
    }

    pub fn pending(&self) -> Option<&Operation> {
        match &self.state {
            SyncState::AwaitingWithBuffer { pending, .. } => Some(pending),
            _ => None,
        }
    }

    pub fn is_desynchronized(&self) -> bool {
        self.state == SyncState::Desynchronized
    }

    /// Enter the terminal state.
    pub fn desynchronize(&mut self) {
        if !self.is_desynchronized() {
            warn!("reconciler desynchronized at revision {}", self.revision);
            self.state = SyncState::Desynchronized;
        }
    }

    /// Length the local buffer must have for the next local edit.
    pub fn expected_len(&self) -> usize {
        match &self.state {
            SyncState::Synchronized | SyncState::Desynchronized => char_len(&self.confirmed),
            SyncState::AwaitingAck(inflight) => inflight.target_len(),
            SyncState::AwaitingWithBuffer { pending, .. } => pending.target_len(),
        }
    }

    /// Record a local edit. Returns the operation to send, if any.
    pub fn apply_client(
        &mut self,
        op: Operation,
    ) -> Result<Option<OutgoingOperation>, ReconcileError> {
        self.guard(|this| {
            let expected = this.expected_len();
            if op.base_len() != expected {
                return Err(OtError::LengthMismatch {
                    expected,
                    actual: op.base_len(),
                }
                .into());
            }
            if op.is_noop() {
                return Ok(None);
            }

            match mem::replace(&mut this.state, SyncState::Desynchronized) {
                SyncState::Synchronized => {
                    this.state = SyncState::AwaitingAck(op.clone());
                    debug!("sending operation at revision {}", this.revision);
                    Ok(Some(OutgoingOperation {
                        revision: this.revision,
                        operation: op,
                    }))
                }
                SyncState::AwaitingAck(inflight) => {
                    this.state = SyncState::AwaitingWithBuffer {
                        inflight,
                        pending: op,
                    };
                    Ok(None)
                }
                SyncState::AwaitingWithBuffer { inflight, pending } => {
                    let pending = pending.compose(&op)?;
                    this.state = SyncState::AwaitingWithBuffer { inflight, pending };
                    Ok(None)
                }
                SyncState::Desynchronized => Err(ReconcileError::Desynchronized),
            }
        })
    }

    /// Handle the server's acknowledgement of the in-flight operation.
    /// Returns the buffered operation, which is now in flight.
    pub fn server_ack(
        &mut self,
        revision: u64,
    ) -> Result<Option<OutgoingOperation>, ReconcileError> {
        self.guard(|this| {
            let inflight = match this.inflight() {
                Some(inflight) => inflight,
                None => return Err(ReconcileError::UnexpectedAck),
            };
            this.check_next_revision(revision)?;
            let confirmed = inflight.apply(&this.confirmed)?;

            let next = match mem::replace(&mut this.state, SyncState::Desynchronized) {
                SyncState::AwaitingWithBuffer { pending, .. } => {
                    this.state = SyncState::AwaitingAck(pending.clone());
                    Some(pending)
                }
                _ => {
                    this.state = SyncState::Synchronized;
                    None
                }
            };
            this.confirmed = confirmed;
            this.revision = revision;
            debug!("ack for revision {revision}");

            Ok(next.map(|operation| OutgoingOperation {
                revision,
                operation,
            }))
        })
    }

    /// Handle another client's operation. Returns the operation to apply to
    /// the local buffer.
    pub fn apply_server(
        &mut self,
        revision: u64,
        op: Operation,
    ) -> Result<Operation, ReconcileError> {
        self.guard(|this| {
            this.check_next_revision(revision)?;
            let confirmed = op.apply(&this.confirmed)?;

            let local = match mem::replace(&mut this.state, SyncState::Desynchronized) {
                SyncState::Synchronized => {
                    this.state = SyncState::Synchronized;
                    op
                }
                SyncState::AwaitingAck(inflight) => {
                    let (inflight, op) = inflight.transform(&op)?;
                    this.state = SyncState::AwaitingAck(inflight);
                    op
                }
                SyncState::AwaitingWithBuffer { inflight, pending } => {
                    let (inflight, op) = inflight.transform(&op)?;
                    let (pending, op) = pending.transform(&op)?;
                    this.state = SyncState::AwaitingWithBuffer { inflight, pending };
                    op
                }
                SyncState::Desynchronized => return Err(ReconcileError::Desynchronized),
            };
            this.confirmed = confirmed;
            this.revision = revision;
            Ok(local)
        })
    }

    /// Rebase onto a fresh snapshot received after (re)connecting.
    ///
    /// Unacknowledged work is replayed when the snapshot is the state it was
    /// based on, or that state plus the in-flight operation (an
    /// acknowledgement lost with the connection). Otherwise the local work
    /// is dropped and the buffer follows the snapshot.
    pub fn resync(&mut self, snapshot: &DocumentSnapshot) -> Result<Resync, ReconcileError> {
        self.guard(|this| {
            let outstanding = match (this.inflight(), this.pending()) {
                (Some(inflight), Some(pending)) => Some(inflight.compose(pending)?),
                (Some(inflight), None) => Some(inflight.clone()),
                _ => None,
            };
            let local_text = match &outstanding {
                Some(op) => op.apply(&this.confirmed)?,
                None => this.confirmed.clone(),
            };
            let acked_text = this
                .inflight()
                .map(|inflight| inflight.apply(&this.confirmed))
                .transpose()?;

            let mut resync = Resync::default();
            let replay = if outstanding.is_none() {
                None
            } else if snapshot.text == this.confirmed {
                outstanding
            } else if acked_text.as_deref() == Some(snapshot.text.as_str()) {
                this.pending().cloned()
            } else {
                resync.discarded = true;
                None
            };

            let target = match &replay {
                Some(op) => op.apply(&snapshot.text)?,
                None => snapshot.text.clone(),
            };
            if target != local_text {
                resync.buffer_update = Some(Operation::diff(&local_text, &target));
            }

            this.revision = snapshot.revision;
            this.confirmed = snapshot.text.clone();
            this.state = SyncState::Synchronized;
            if let Some(operation) = replay.filter(|op| !op.is_noop()) {
                this.state = SyncState::AwaitingAck(operation.clone());
                resync.replay = Some(OutgoingOperation {
                    revision: snapshot.revision,
                    operation,
                });
            }

            if resync.discarded {
                warn!(
                    "discarded unacknowledged local edits while resyncing to revision {}",
                    snapshot.revision
                );
            } else {
                debug!("resynced to revision {}", snapshot.revision);
            }
            Ok(resync)
        })
    }

    fn check_next_revision(&self, revision: u64) -> Result<(), ReconcileError> {
        let expected = self.revision + 1;
        if revision != expected {
            return Err(ReconcileError::RevisionMismatch {
                expected,
                actual: revision,
            });
        }
        Ok(())
    }

    fn guard<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ReconcileError>,
    ) -> Result<T, ReconcileError> {
        if self.is_desynchronized() {
            return Err(ReconcileError::Desynchronized);
        }
        let result = f(self);
        if let Err(e) = &result {
            error!("desynchronized at revision {}: {e}", self.revision);
            self.state = SyncState::Desynchronized;
        }
        result
    }
}
