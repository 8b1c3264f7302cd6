//! The document session: one editor buffer kept in sync with one document.
//!
//! Provides:
//! - Connection lifecycle with capped, jittered reconnect
//! - Reconciliation of local edits against the server history
//! - Presence (participants and selections) and document language
//! - Host callbacks for every observable change
//!
//! ## Architecture
//!
//! ```text
//!   host edits ──▶ DocumentSession::edit ─┐
//!                                          ▼
//!                          ┌────────── Core (one lock) ──────────┐
//!                          │ Reconciler · PresenceTracker · B    │
//!                          └─────────────────────────────────────┘
//!                                          ▲           │ outgoing frames
//!   driver task ── incoming frames ────────┘           ▼
//!        │                                         Connection
//!        └── connect / backoff / reconnect ─────▶ Connector
//! ```
//!
//! Every state change happens under the core lock, so a remote operation
//! can never interleave with a local edit half-way through. Host callbacks
//! run after the lock is released and may call back into the session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use mdpad_core::{
    DocumentSnapshot, Operation, OtError, Reconciler, SelectionRange, SyncStatus, UserInfo,
    UserProfile,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::buffer::{BufferAdapter, LocalChange};
use crate::presence::{PresenceTracker, SelectionsSnapshot, UsersSnapshot};
use crate::protocol::{ClientMessage, MessageKind, ProtocolError, ServerMessage};
use crate::transport::{Backoff, Connection, ConnectionState, Connector, WebSocketConnector};

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// First reconnect delay.
    pub reconnect_base: Duration,
    /// Upper bound on reconnect delays.
    pub reconnect_max: Duration,
    /// Fraction of each delay removed at random, in `[0, 1]`.
    pub reconnect_jitter: f64,
    /// Give up on a connection attempt after this long.
    pub connect_timeout: Duration,
    /// Desynchronize after this many dropped connections within
    /// `failure_window`. Zero disables the check.
    pub max_recent_failures: usize,
    pub failure_window: Duration,
    /// Minimum spacing of outgoing selection updates. Zero sends every one.
    pub selection_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            reconnect_jitter: 0.5,
            connect_timeout: Duration::from_secs(10),
            max_recent_failures: 5,
            failure_window: Duration::from_secs(15),
            selection_interval: Duration::ZERO,
        }
    }
}

type Handler = Box<dyn Fn() + Send + Sync>;
type ValueHandler<T> = Box<dyn Fn(T) + Send + Sync>;

/// Host callbacks. Every callback is optional.
#[derive(Default)]
pub struct SessionCallbacks {
    on_connected: Option<Handler>,
    on_disconnected: Option<Handler>,
    on_desynchronized: Option<Handler>,
    on_change_language: Option<ValueHandler<String>>,
    on_change_users: Option<ValueHandler<UsersSnapshot>>,
    on_change_selections: Option<ValueHandler<SelectionsSnapshot>>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Box::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Box::new(f));
        self
    }

    /// Fired once when the session can no longer stay consistent with the
    /// server. The session stops syncing afterwards.
    pub fn on_desynchronized(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_desynchronized = Some(Box::new(f));
        self
    }

    pub fn on_change_language(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_change_language = Some(Box::new(f));
        self
    }

    pub fn on_change_users(mut self, f: impl Fn(UsersSnapshot) + Send + Sync + 'static) -> Self {
        self.on_change_users = Some(Box::new(f));
        self
    }

    pub fn on_change_selections(
        mut self,
        f: impl Fn(SelectionsSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.on_change_selections = Some(Box::new(f));
        self
    }
}

/// Something the host must hear about, queued under the lock and delivered
/// after it is released.
#[derive(Debug)]
enum Notification {
    Connected,
    Disconnected,
    Desynchronized,
    Language(String),
    Users(UsersSnapshot),
    Selections(SelectionsSnapshot),
}

// ───────────────────────────────────────────────────────────────────
// Core state
// ───────────────────────────────────────────────────────────────────

struct Core<B> {
    reconciler: Reconciler,
    presence: PresenceTracker,
    buffer: B,
    /// Filled by the buffer's change listener, drained under the same lock.
    local_changes: Arc<Mutex<Vec<LocalChange>>>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    connection: ConnectionState,
    /// Last connectivity reported to the host, to avoid repeats.
    reported_online: Option<bool>,
    awaiting_snapshot: bool,
    language: Option<String>,
    profile: Option<UserProfile>,
    recent_failures: VecDeque<Instant>,
    desynchronized: bool,
    disposed: bool,
}

impl<B: BufferAdapter> Core<B> {
    fn is_finished(&self) -> bool {
        self.desynchronized || self.disposed
    }

    fn send(&self, message: &ClientMessage) {
        let Some(tx) = &self.outgoing else {
            return;
        };
        match message.encode() {
            Ok(text) => {
                trace!("-> {text}");
                // A closed channel means the connection is going away; the
                // driver notices and reconnects.
                let _ = tx.send(text);
            }
            Err(e) => error!("Failed to encode {message:?}: {e}"),
        }
    }

    fn desynchronize(&mut self, reason: &str, notes: &mut Vec<Notification>) {
        if self.desynchronized {
            return;
        }
        error!("Session desynchronized: {reason}");
        self.desynchronized = true;
        self.reconciler.desynchronize();
        self.outgoing = None;
        self.connection = ConnectionState::Disconnected;
        notes.push(Notification::Desynchronized);
    }

    // ── local side ─────────────────────────────────────────────────

    /// Reconcile every change the buffer reported since the last drain.
    fn drain_local_changes(&mut self, notes: &mut Vec<Notification>) {
        let changes = std::mem::take(&mut *self.local_changes.lock());
        if changes.is_empty() {
            return;
        }
        for change in changes {
            match change.into_operation() {
                Ok(op) => self.submit_local(op, notes),
                Err(e) => {
                    self.desynchronize(&format!("unreadable local change: {e}"), notes);
                    return;
                }
            }
        }
        let selections = self.buffer.selections();
        self.update_selection(selections);
    }

    fn submit_local(&mut self, op: Operation, notes: &mut Vec<Notification>) {
        if self.is_finished() {
            return;
        }
        match self.reconciler.apply_client(op.clone()) {
            Ok(outgoing) => {
                if self.presence.transform_selections(&op) {
                    notes.push(Notification::Selections(self.presence.selections()));
                }
                // Before the snapshot the in-flight op stays unsent; the
                // snapshot's resync replays it.
                if let Some(out) = outgoing.filter(|_| !self.awaiting_snapshot) {
                    self.send(&ClientMessage::Operation {
                        revision: out.revision,
                        ops: out.operation,
                    });
                }
            }
            Err(e) => self.desynchronize(&format!("local edit rejected: {e}"), notes),
        }
    }

    /// Apply an operation to the buffer without treating it as a user edit.
    fn apply_to_buffer(&mut self, op: &Operation) -> Result<(), OtError> {
        self.buffer.apply_operation(op)?;
        let echoed = std::mem::take(&mut *self.local_changes.lock());
        if !echoed.is_empty() {
            debug!("Dropped {} change(s) echoed by the buffer", echoed.len());
        }
        Ok(())
    }

    fn update_selection(&mut self, ranges: Vec<SelectionRange>) {
        if let Some(ranges) = self.presence.update_local_selection(ranges) {
            if self.connection == ConnectionState::Connected {
                self.send(&ClientMessage::SelectionUpdate { ranges });
            }
        }
    }

    fn flush_selection(&mut self) {
        if self.connection != ConnectionState::Connected {
            return;
        }
        if let Some(ranges) = self.presence.flush_local_selection() {
            self.send(&ClientMessage::SelectionUpdate { ranges });
        }
    }

    // ── connection lifecycle ───────────────────────────────────────

    fn connected(&mut self, outgoing: mpsc::UnboundedSender<String>, notes: &mut Vec<Notification>) {
        self.outgoing = Some(outgoing);
        self.connection = ConnectionState::Connected;
        self.awaiting_snapshot = true;
        if self.presence.clear() {
            notes.push(Notification::Users(self.presence.snapshot()));
        }
        if let Some(profile) = &self.profile {
            self.send(&ClientMessage::identity(profile));
        }
        if self.reported_online != Some(true) {
            self.reported_online = Some(true);
            notes.push(Notification::Connected);
        }
    }

    fn disconnected(&mut self, config: &SessionConfig, notes: &mut Vec<Notification>) {
        self.outgoing = None;
        self.connection = ConnectionState::Reconnecting;
        if self.presence.clear() {
            notes.push(Notification::Users(self.presence.snapshot()));
        }
        if self.reported_online != Some(false) {
            self.reported_online = Some(false);
            notes.push(Notification::Disconnected);
        }

        if config.max_recent_failures == 0 {
            return;
        }
        let now = Instant::now();
        self.recent_failures.push_back(now);
        while let Some(first) = self.recent_failures.front() {
            if now.duration_since(*first) > config.failure_window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
        if self.recent_failures.len() >= config.max_recent_failures {
            let reason = format!(
                "{} dropped connections within {:?}",
                self.recent_failures.len(),
                config.failure_window
            );
            self.desynchronize(&reason, notes);
        }
    }

    fn connect_failed(&mut self, notes: &mut Vec<Notification>) {
        self.connection = ConnectionState::Reconnecting;
        if self.reported_online != Some(false) {
            self.reported_online = Some(false);
            notes.push(Notification::Disconnected);
        }
    }

    // ── remote side ────────────────────────────────────────────────

    /// Handle one frame. Returns `false` once the session must stop.
    fn handle_frame(&mut self, text: &str, notes: &mut Vec<Notification>) -> bool {
        if self.is_finished() {
            return false;
        }
        trace!("<- {text}");
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) if e.is_fatal() => {
                self.desynchronize(&e.to_string(), notes);
                return false;
            }
            Err(e) => {
                debug!("Ignoring frame: {e}");
                return true;
            }
        };

        let kind = message.kind();
        if self.awaiting_snapshot && kind.is_document() && kind != MessageKind::Snapshot {
            self.desynchronize(&format!("{kind:?} before snapshot"), notes);
            return false;
        }

        match message {
            ServerMessage::Identity { user_id } => {
                debug!("Assigned user id {user_id}");
                if self.presence.set_local_user(user_id) {
                    notes.push(Notification::Users(self.presence.snapshot()));
                }
            }
            ServerMessage::Snapshot {
                text,
                revision,
                language,
                users,
            } => self.apply_snapshot(
                DocumentSnapshot {
                    text,
                    revision,
                    language,
                },
                users,
                notes,
            ),
            ServerMessage::Ack { revision } => match self.reconciler.server_ack(revision) {
                Ok(Some(next)) => self.send(&ClientMessage::Operation {
                    revision: next.revision,
                    ops: next.operation,
                }),
                Ok(None) => {}
                Err(e) => self.desynchronize(&e.to_string(), notes),
            },
            ServerMessage::Operation {
                revision,
                ops,
                user_id,
            } => match self.reconciler.apply_server(revision, ops) {
                Ok(op) => {
                    if let Err(e) = self.apply_to_buffer(&op) {
                        self.desynchronize(&format!("buffer rejected operation: {e}"), notes);
                    } else {
                        trace!("Applied revision {revision} from user {user_id}");
                        self.presence.transform_local_selection(&op);
                        if self.presence.transform_selections(&op) {
                            notes.push(Notification::Selections(self.presence.selections()));
                        }
                    }
                }
                Err(e) => self.desynchronize(&e.to_string(), notes),
            },
            ServerMessage::SelectionUpdate { user_id, ranges } => {
                if self.presence.set_selection(user_id, ranges) {
                    notes.push(Notification::Selections(self.presence.selections()));
                }
            }
            ServerMessage::UserJoined { user_id, info } => {
                if self.presence.upsert(user_id, info) {
                    notes.push(Notification::Users(self.presence.snapshot()));
                }
            }
            ServerMessage::UserLeft { user_id } => {
                if self.presence.remove(user_id) {
                    notes.push(Notification::Users(self.presence.snapshot()));
                    notes.push(Notification::Selections(self.presence.selections()));
                }
            }
            ServerMessage::LanguageChange { language } => self.change_language(language, notes),
        }

        !self.is_finished()
    }

    fn apply_snapshot(
        &mut self,
        snapshot: DocumentSnapshot,
        users: Vec<UserInfo>,
        notes: &mut Vec<Notification>,
    ) {
        self.awaiting_snapshot = false;
        match self.reconciler.resync(&snapshot) {
            Ok(resync) => {
                if let Some(op) = &resync.buffer_update {
                    if let Err(e) = self.apply_to_buffer(op) {
                        self.desynchronize(&format!("buffer rejected snapshot: {e}"), notes);
                        return;
                    }
                    self.presence.transform_local_selection(op);
                }
                if let Some(replay) = resync.replay {
                    self.send(&ClientMessage::Operation {
                        revision: replay.revision,
                        ops: replay.operation,
                    });
                }
                info!("Synchronized at revision {}", snapshot.revision);
            }
            Err(e) => {
                self.desynchronize(&e.to_string(), notes);
                return;
            }
        }

        self.presence.replace_all(users);
        notes.push(Notification::Users(self.presence.snapshot()));

        let selection = self.presence.local_selection().to_vec();
        if !selection.is_empty() {
            self.send(&ClientMessage::SelectionUpdate { ranges: selection });
        }
        if let Some(language) = snapshot.language {
            self.change_language(language, notes);
        }
    }

    fn change_language(&mut self, language: String, notes: &mut Vec<Notification>) {
        if self.language.as_deref() == Some(language.as_str()) {
            return;
        }
        self.buffer.set_language_hint(&language);
        self.language = Some(language.clone());
        notes.push(Notification::Language(language));
    }
}

// ───────────────────────────────────────────────────────────────────
// Shared between the facade and the driver task
// ───────────────────────────────────────────────────────────────────

struct Shared<B> {
    uri: String,
    config: SessionConfig,
    callbacks: SessionCallbacks,
    core: Mutex<Core<B>>,
    disposed: AtomicBool,
}

impl<B: BufferAdapter> Shared<B> {
    /// Run `f` under the core lock, then deliver whatever it queued.
    fn with_core<R>(&self, f: impl FnOnce(&mut Core<B>, &mut Vec<Notification>) -> R) -> R {
        let mut notes = Vec::new();
        let result = {
            let mut core = self.core.lock();
            f(&mut core, &mut notes)
        };
        self.dispatch(notes);
        result
    }

    fn dispatch(&self, notes: Vec<Notification>) {
        let callbacks = &self.callbacks;
        for note in notes {
            if self.disposed.load(Ordering::SeqCst) {
                return;
            }
            match note {
                Notification::Connected => {
                    if let Some(f) = &callbacks.on_connected {
                        f();
                    }
                }
                Notification::Disconnected => {
                    if let Some(f) = &callbacks.on_disconnected {
                        f();
                    }
                }
                Notification::Desynchronized => {
                    if let Some(f) = &callbacks.on_desynchronized {
                        f();
                    }
                }
                Notification::Language(language) => {
                    if let Some(f) = &callbacks.on_change_language {
                        f(language);
                    }
                }
                Notification::Users(users) => {
                    if let Some(f) = &callbacks.on_change_users {
                        f(users);
                    }
                }
                Notification::Selections(selections) => {
                    if let Some(f) = &callbacks.on_change_selections {
                        f(selections);
                    }
                }
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.core.lock().is_finished()
    }
}

/// Connect, pump frames, back off, reconnect; until disposed or
/// desynchronized.
async fn drive<B: BufferAdapter>(
    shared: Arc<Shared<B>>,
    connector: Arc<dyn Connector>,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = shared.config.clone();
    let mut backoff = Backoff::new(
        config.reconnect_base,
        config.reconnect_max,
        config.reconnect_jitter,
    );

    loop {
        if *shutdown.borrow() || shared.is_finished() {
            break;
        }
        shared.with_core(|core, _| {
            core.connection = if backoff.attempts() == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
        });

        let attempt = tokio::time::timeout(config.connect_timeout, connector.connect(&shared.uri));
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = attempt => result.unwrap_or(Err(ProtocolError::Timeout)),
        };

        match result {
            Ok(connection) => {
                backoff.reset();
                let stop = pump(&shared, connection, &mut shutdown).await;
                if stop {
                    break;
                }
                shared.with_core(|core, notes| core.disconnected(&config, notes));
                warn!("Lost connection to {}", shared.uri);
            }
            Err(e) => {
                warn!("Failed to connect to {}: {e}", shared.uri);
                shared.with_core(|core, notes| core.connect_failed(notes));
            }
        }

        if shared.is_finished() {
            break;
        }
        let delay = backoff.next_delay();
        debug!("Reconnecting in {delay:?}");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("Session driver for {} stopped", shared.uri);
}

/// Serve one connection. Returns `true` when the session must stop, `false`
/// when the connection was lost.
async fn pump<B: BufferAdapter>(
    shared: &Arc<Shared<B>>,
    connection: Connection,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let Connection {
        outgoing,
        mut incoming,
    } = connection;
    shared.with_core(|core, notes| core.connected(outgoing, notes));

    let throttled = !shared.config.selection_interval.is_zero();
    let mut ticker = tokio::time::interval(shared.config.selection_interval.max(Duration::from_millis(1)));

    loop {
        tokio::select! {
            _ = shutdown.changed() => return true,
            frame = incoming.recv() => match frame {
                Some(text) => {
                    if !shared.with_core(|core, notes| core.handle_frame(&text, notes)) {
                        return true;
                    }
                }
                None => return false,
            },
            _ = ticker.tick(), if throttled => {
                shared.with_core(|core, _| core.flush_selection());
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Facade
// ───────────────────────────────────────────────────────────────────

/// A live collaborative editing session over one buffer.
///
/// Dropping the session disposes it.
pub struct DocumentSession<B: BufferAdapter> {
    shared: Arc<Shared<B>>,
    connector: Arc<dyn Connector>,
    driver: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl<B: BufferAdapter> DocumentSession<B> {
    /// Session over WebSocket with default tuning.
    pub fn new(uri: impl Into<String>, buffer: B, callbacks: SessionCallbacks) -> Self {
        Self::with_options(
            uri,
            buffer,
            callbacks,
            SessionConfig::default(),
            Arc::new(WebSocketConnector),
        )
    }

    pub fn with_options(
        uri: impl Into<String>,
        mut buffer: B,
        callbacks: SessionCallbacks,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let local_changes: Arc<Mutex<Vec<LocalChange>>> = Arc::default();
        let sink = local_changes.clone();
        buffer.on_local_change(Arc::new(move |change| sink.lock().push(change)));

        let initial = DocumentSnapshot::new(buffer.value(), 0);
        let core = Core {
            reconciler: Reconciler::new(&initial),
            presence: PresenceTracker::with_interval(config.selection_interval),
            buffer,
            local_changes,
            outgoing: None,
            connection: ConnectionState::Disconnected,
            reported_online: None,
            awaiting_snapshot: true,
            language: None,
            profile: None,
            recent_failures: VecDeque::new(),
            desynchronized: false,
            disposed: false,
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                uri: uri.into(),
                config,
                callbacks,
                core: Mutex::new(core),
                disposed: AtomicBool::new(false),
            }),
            connector,
            driver: Mutex::new(None),
            shutdown,
        }
    }

    /// Start connecting in the background. Must be called inside a Tokio
    /// runtime. Does nothing if already started or disposed.
    pub fn connect(&self) {
        if self.is_disposed() {
            return;
        }
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return;
        }
        info!("Connecting to {}", self.shared.uri);
        *driver = Some(tokio::spawn(drive(
            self.shared.clone(),
            self.connector.clone(),
            self.shutdown.subscribe(),
        )));
    }

    /// Edit the buffer. Changes the buffer reports during `f` are sent to
    /// the server before the lock is released.
    ///
    /// `f` runs with the session locked. It must not call back into this
    /// session (`text`, `set_language`, another `edit`, ...): doing so
    /// deadlocks.
    pub fn edit<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.shared.with_core(|core, notes| {
            let result = f(&mut core.buffer);
            if !core.disposed {
                core.drain_local_changes(notes);
            }
            result
        })
    }

    /// Apply `op` to the buffer as a local edit.
    ///
    /// Failures are reported through `on_desynchronized`, never returned.
    pub fn set_local_operation(&self, op: Operation) {
        self.shared.with_core(|core, notes| {
            if core.is_finished() {
                return;
            }
            if let Err(e) = core.apply_to_buffer(&op) {
                core.desynchronize(&format!("local operation does not fit buffer: {e}"), notes);
                return;
            }
            core.submit_local(op, notes);
        });
    }

    /// Announce our name and hue. Remembered and re-sent on every connect.
    pub fn set_info(&self, profile: UserProfile) {
        self.shared.with_core(|core, _| {
            if core.connection == ConnectionState::Connected {
                core.send(&ClientMessage::identity(&profile));
            }
            core.profile = Some(profile);
        });
    }

    /// Change the document language. Returns whether a change was sent:
    /// `false` when offline, while the snapshot of a fresh connection is
    /// still outstanding, or when `language` is already current.
    pub fn set_language(&self, language: &str) -> bool {
        self.shared.with_core(|core, _| {
            if core.is_finished()
                || core.connection != ConnectionState::Connected
                || core.awaiting_snapshot
                || core.language.as_deref() == Some(language)
            {
                return false;
            }
            core.send(&ClientMessage::LanguageChange {
                language: language.to_owned(),
            });
            core.language = Some(language.to_owned());
            core.buffer.set_language_hint(language);
            true
        })
    }

    /// Report our selection to the other participants.
    pub fn set_selection(&self, ranges: Vec<SelectionRange>) {
        self.shared
            .with_core(|core, _| core.update_selection(ranges));
    }

    /// Stop syncing and release the buffer's listener. Idempotent.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut core = self.shared.core.lock();
            core.disposed = true;
            core.outgoing = None;
            core.connection = ConnectionState::Disconnected;
            core.buffer.detach();
        }
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        info!("Disposed session for {}", self.shared.uri);
    }

    // ── introspection ──────────────────────────────────────────────

    pub fn uri(&self) -> &str {
        &self.shared.uri
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.core.lock().reconciler.status()
    }

    pub fn revision(&self) -> u64 {
        self.shared.core.lock().reconciler.revision()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.core.lock().connection
    }

    /// Connected and working from the server's snapshot.
    pub fn is_online(&self) -> bool {
        let core = self.shared.core.lock();
        core.connection == ConnectionState::Connected && !core.awaiting_snapshot
    }

    pub fn text(&self) -> String {
        self.shared.core.lock().buffer.value()
    }

    pub fn language(&self) -> Option<String> {
        self.shared.core.lock().language.clone()
    }

    pub fn user_id(&self) -> Option<u64> {
        self.shared.core.lock().presence.local_user_id()
    }

    pub fn users(&self) -> UsersSnapshot {
        self.shared.core.lock().presence.snapshot()
    }

    pub fn selections(&self) -> SelectionsSnapshot {
        self.shared.core.lock().presence.selections()
    }

    /// Read the buffer without editing it.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.shared.core.lock().buffer)
    }
}

impl<B: BufferAdapter> Drop for DocumentSession<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TextBuffer;
    use crate::transport::ConnectionPeer;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    /// Hands out connections queued by the test, one per attempt.
    struct QueuedConnector {
        queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>>,
        attempts: Arc<AtomicUsize>,
    }

    impl Connector for QueuedConnector {
        fn connect(&self, _uri: &str) -> BoxFuture<'static, Result<Connection, ProtocolError>> {
            let queue = self.queue.clone();
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                queue
                    .lock()
                    .await
                    .recv()
                    .await
                    .ok_or(ProtocolError::ConnectionClosed)
            })
        }
    }

    /// Never completes a connection attempt.
    #[derive(Default)]
    struct StalledConnector {
        attempts: Arc<AtomicUsize>,
    }

    impl Connector for StalledConnector {
        fn connect(&self, _uri: &str) -> BoxFuture<'static, Result<Connection, ProtocolError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(futures_util::future::pending::<Result<Connection, ProtocolError>>())
        }
    }

    #[derive(Default)]
    struct Counters {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        desynchronized: AtomicUsize,
        users: AtomicUsize,
        languages: Mutex<Vec<String>>,
    }

    struct Harness {
        session: DocumentSession<TextBuffer>,
        connections: mpsc::UnboundedSender<Connection>,
        counters: Arc<Counters>,
        attempts: Arc<AtomicUsize>,
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            reconnect_base: Duration::from_millis(5),
            reconnect_max: Duration::from_millis(20),
            reconnect_jitter: 0.0,
            connect_timeout: Duration::from_secs(1),
            max_recent_failures: 0,
            failure_window: Duration::from_secs(1),
            selection_interval: Duration::ZERO,
        }
    }

    fn harness(text: &str, config: SessionConfig) -> Harness {
        let (connections, queue) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counters = Arc::new(Counters::default());

        let c = counters.clone();
        let callbacks = SessionCallbacks::new()
            .on_connected({
                let c = c.clone();
                move || {
                    c.connected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_disconnected({
                let c = c.clone();
                move || {
                    c.disconnected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_desynchronized({
                let c = c.clone();
                move || {
                    c.desynchronized.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_change_users({
                let c = c.clone();
                move |_| {
                    c.users.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_change_language(move |language| c.languages.lock().push(language));

        let connector = QueuedConnector {
            queue: Arc::new(tokio::sync::Mutex::new(queue)),
            attempts: attempts.clone(),
        };
        let session = DocumentSession::with_options(
            "ws://test/api/socket/doc",
            TextBuffer::new(text),
            callbacks,
            config,
            Arc::new(connector),
        );
        Harness {
            session,
            connections,
            counters,
            attempts,
        }
    }

    impl Harness {
        fn open(&self) -> ConnectionPeer {
            let (conn, peer) = Connection::in_memory();
            self.connections.send(conn).unwrap();
            peer
        }
    }

    fn send(peer: &ConnectionPeer, message: ServerMessage) {
        peer.to_client.send(message.encode().unwrap()).unwrap();
    }

    async fn next_message(peer: &mut ConnectionPeer) -> ClientMessage {
        let text = timeout(Duration::from_secs(2), peer.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client closed connection");
        ClientMessage::decode(&text).unwrap()
    }

    async fn next_operation(peer: &mut ConnectionPeer) -> (u64, Operation) {
        loop {
            if let ClientMessage::Operation { revision, ops } = next_message(peer).await {
                return (revision, ops);
            }
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn snapshot(text: &str, revision: u64) -> ServerMessage {
        ServerMessage::Snapshot {
            text: text.into(),
            revision,
            language: None,
            users: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_connect_and_snapshot() {
        let h = harness("", fast_config());
        let peer = h.open();
        h.session.connect();

        send(&peer, ServerMessage::Identity { user_id: 4 });
        send(&peer, snapshot("hello", 3));

        eventually(|| h.session.text() == "hello").await;
        assert_eq!(h.session.revision(), 3);
        assert_eq!(h.session.user_id(), Some(4));
        assert_eq!(h.session.status(), SyncStatus::Synchronized);
        assert_eq!(h.session.connection_state(), ConnectionState::Connected);
        assert_eq!(h.counters.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_operation_in_flight() {
        let h = harness("", fast_config());
        let mut peer = h.open();
        h.session.connect();
        send(&peer, snapshot("abc", 0));
        eventually(|| h.session.text() == "abc").await;

        h.session.set_local_operation(Operation::new().insert("X").retain(3));
        h.session.set_local_operation(Operation::new().retain(4).insert("Y"));
        h.session.edit(|buffer| buffer.append("Z").unwrap());

        let (revision, ops) = next_operation(&mut peer).await;
        assert_eq!(revision, 0);
        assert_eq!(ops.apply("abc").unwrap(), "Xabc");
        assert_eq!(h.session.status(), SyncStatus::AwaitingWithBuffer);
        assert_eq!(h.session.text(), "XabcYZ");

        tokio::time::sleep(Duration::from_millis(30)).await;
        while let Ok(text) = peer.from_client.try_recv() {
            assert!(!matches!(
                ClientMessage::decode(&text).unwrap(),
                ClientMessage::Operation { .. }
            ));
        }

        send(&peer, ServerMessage::Ack { revision: 1 });
        let (revision, ops) = next_operation(&mut peer).await;
        assert_eq!(revision, 1);
        assert_eq!(ops.apply("Xabc").unwrap(), "XabcYZ");

        send(&peer, ServerMessage::Ack { revision: 2 });
        eventually(|| h.session.status() == SyncStatus::Synchronized).await;
        assert_eq!(h.session.revision(), 2);
    }

    #[tokio::test]
    async fn test_edit_before_snapshot_is_sent_once() {
        let h = harness("", fast_config());
        let mut peer = h.open();
        h.session.connect();
        eventually(|| h.session.connection_state() == ConnectionState::Connected).await;

        h.session.edit(|buffer| buffer.append("hi").unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(text) = peer.from_client.try_recv() {
            assert!(!matches!(
                ClientMessage::decode(&text).unwrap(),
                ClientMessage::Operation { .. }
            ));
        }

        send(&peer, snapshot("", 0));
        let (revision, ops) = next_operation(&mut peer).await;
        assert_eq!(revision, 0);
        assert_eq!(ops.apply("").unwrap(), "hi");

        send(&peer, ServerMessage::Ack { revision: 1 });
        eventually(|| h.session.status() == SyncStatus::Synchronized).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(text) = peer.from_client.try_recv() {
            assert!(matches!(
                ClientMessage::decode(&text).unwrap(),
                ClientMessage::SelectionUpdate { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_remote_operation_reaches_buffer() {
        let h = harness("", fast_config());
        let peer = h.open();
        h.session.connect();
        send(&peer, snapshot("0123456789", 0));
        eventually(|| h.session.text() == "0123456789").await;
        h.session
            .edit(|buffer| buffer.set_selection(SelectionRange::caret(5)));

        send(
            &peer,
            ServerMessage::Operation {
                revision: 1,
                ops: Operation::new().retain(2).insert("xx").retain(8),
                user_id: 9,
            },
        );
        eventually(|| h.session.revision() == 1).await;
        assert_eq!(h.session.text(), "01xx23456789");
        assert_eq!(
            h.session.with_buffer(|buffer| buffer.selection()),
            SelectionRange::caret(7)
        );
    }

    #[tokio::test]
    async fn test_bad_ack_desynchronizes_once() {
        let h = harness("", fast_config());
        let mut peer = h.open();
        h.session.connect();
        send(&peer, snapshot("abc", 0));
        eventually(|| h.session.text() == "abc").await;

        h.session.set_local_operation(Operation::new().insert("X").retain(3));
        next_operation(&mut peer).await;

        send(&peer, ServerMessage::Ack { revision: 7 });
        send(&peer, ServerMessage::Ack { revision: 8 });
        eventually(|| h.counters.desynchronized.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.session.status(), SyncStatus::Desynchronized);

        h.session.set_local_operation(Operation::new().retain(4).insert("!"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.counters.desynchronized.load(Ordering::SeqCst), 1);
        assert!(peer.from_client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_operation_desynchronizes() {
        let h = harness("", fast_config());
        let peer = h.open();
        h.session.connect();
        send(&peer, snapshot("abc", 0));
        peer.to_client
            .send(r#"{"type":"operation","revision":1,"ops":[1.5],"userId":2}"#.into())
            .unwrap();
        eventually(|| h.counters.desynchronized.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_malformed_presence_is_ignored() {
        let h = harness("", fast_config());
        let peer = h.open();
        h.session.connect();
        send(&peer, snapshot("abc", 0));
        peer.to_client
            .send(r#"{"type":"userJoined","userId":"who"}"#.into())
            .unwrap();
        send(
            &peer,
            ServerMessage::UserJoined {
                user_id: 2,
                info: UserProfile::new("Grace", 10),
            },
        );
        eventually(|| h.session.users().contains_key(&2)).await;
        assert_eq!(h.session.status(), SyncStatus::Synchronized);
        assert_eq!(h.counters.desynchronized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_operation_before_snapshot_desynchronizes() {
        let h = harness("", fast_config());
        let peer = h.open();
        h.session.connect();
        send(&peer, ServerMessage::Ack { revision: 1 });
        eventually(|| h.counters.desynchronized.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_reconnect_resyncs_to_fresh_snapshot() {
        let h = harness("", fast_config());
        let mut first = h.open();
        h.session.connect();
        send(&first, snapshot("abc", 0));
        eventually(|| h.session.text() == "abc").await;

        h.session.set_local_operation(Operation::new().insert("X").retain(3));
        next_operation(&mut first).await;
        assert_eq!(h.session.status(), SyncStatus::AwaitingAck);

        drop(first);
        eventually(|| h.counters.disconnected.load(Ordering::SeqCst) == 1).await;

        let second = h.open();
        send(&second, snapshot("abc, edited elsewhere", 10));
        eventually(|| h.session.revision() == 10).await;
        assert_eq!(h.session.status(), SyncStatus::Synchronized);
        assert_eq!(h.session.text(), "abc, edited elsewhere");
        assert_eq!(h.counters.connected.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reconnect_replays_unacknowledged_edit() {
        let h = harness("", fast_config());
        let mut first = h.open();
        h.session.connect();
        send(&first, snapshot("abc", 5));
        eventually(|| h.session.text() == "abc").await;

        h.session.set_local_operation(Operation::new().retain(3).insert("!"));
        next_operation(&mut first).await;
        drop(first);

        let mut second = h.open();
        send(&second, snapshot("abc", 5));
        let (revision, ops) = next_operation(&mut second).await;
        assert_eq!(revision, 5);
        assert_eq!(ops.apply("abc").unwrap(), "abc!");
        assert_eq!(h.session.text(), "abc!");
    }

    #[tokio::test]
    async fn test_set_language() {
        let h = harness("", fast_config());
        assert!(!h.session.set_language("rust"));

        let mut peer = h.open();
        h.session.connect();
        send(&peer, snapshot("", 0));
        eventually(|| h.session.is_online()).await;

        assert!(h.session.set_language("rust"));
        assert!(!h.session.set_language("rust"));
        assert_eq!(
            next_message(&mut peer).await,
            ClientMessage::LanguageChange {
                language: "rust".into()
            }
        );

        send(
            &peer,
            ServerMessage::LanguageChange {
                language: "python".into(),
            },
        );
        eventually(|| h.session.language().as_deref() == Some("python")).await;
        assert_eq!(*h.counters.languages.lock(), vec!["python".to_string()]);
        assert_eq!(h.session.with_buffer(|b| b.language_hint().map(str::to_owned)), Some("python".into()));
    }

    #[tokio::test]
    async fn test_set_language_waits_for_snapshot() {
        let h = harness("", fast_config());
        let mut peer = h.open();
        h.session.connect();
        eventually(|| h.session.connection_state() == ConnectionState::Connected).await;
        assert!(!h.session.is_online());
        assert!(!h.session.set_language("rust"));

        send(
            &peer,
            ServerMessage::Snapshot {
                text: "fn main() {}".into(),
                revision: 2,
                language: Some("python".into()),
                users: Vec::new(),
            },
        );
        eventually(|| h.session.is_online()).await;
        assert_eq!(h.session.language().as_deref(), Some("python"));

        assert!(h.session.set_language("rust"));
        assert_eq!(
            next_message(&mut peer).await,
            ClientMessage::LanguageChange {
                language: "rust".into()
            }
        );
        assert_eq!(h.session.language().as_deref(), Some("rust"));
    }

    #[tokio::test]
    async fn test_identity_sent_on_connect() {
        let h = harness("", fast_config());
        h.session.set_info(UserProfile::new("Ada", 200));
        let mut peer = h.open();
        h.session.connect();
        assert_eq!(
            next_message(&mut peer).await,
            ClientMessage::Identity {
                name: "Ada".into(),
                hue: 200
            }
        );
    }

    #[tokio::test]
    async fn test_presence_updates() {
        let h = harness("", fast_config());
        let peer = h.open();
        h.session.connect();
        send(&peer, ServerMessage::Identity { user_id: 1 });
        send(
            &peer,
            ServerMessage::Snapshot {
                text: String::new(),
                revision: 0,
                language: None,
                users: vec![
                    UserProfile::new("Me", 1).with_id(1),
                    UserProfile::new("Grace", 2).with_id(2),
                ],
            },
        );
        eventually(|| h.session.users().len() == 1).await;
        let held = h.session.users();

        send(&peer, ServerMessage::UserLeft { user_id: 2 });
        eventually(|| h.session.users().is_empty()).await;
        assert_eq!(held.len(), 1);
        assert!(h.counters.users.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_dispose_before_connect() {
        let h = harness("", fast_config());
        h.session.dispose();
        h.session.dispose();
        assert!(h.session.is_disposed());
        h.session.connect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispose_silences_callbacks() {
        let h = harness("", fast_config());
        let peer = h.open();
        h.session.connect();
        send(&peer, snapshot("abc", 0));
        eventually(|| h.session.text() == "abc").await;

        h.session.dispose();
        send(&peer, ServerMessage::Ack { revision: 9 });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.counters.desynchronized.load(Ordering::SeqCst), 0);
        assert_eq!(h.counters.disconnected.load(Ordering::SeqCst), 0);

        h.session.edit(|buffer| buffer.append("x").unwrap());
        assert_eq!(h.session.text(), "abcx");
    }

    #[tokio::test]
    async fn test_failed_attempts_retry_with_backoff() {
        let Harness {
            session,
            connections,
            counters,
            attempts,
        } = harness("", fast_config());
        drop(connections);
        session.connect();

        eventually(|| attempts.load(Ordering::SeqCst) >= 3).await;
        assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(counters.connected.load(Ordering::SeqCst), 0);
        assert_eq!(session.status(), SyncStatus::Synchronized);
        assert_ne!(session.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_dispose_cancels_pending_reconnect() {
        let config = SessionConfig {
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(100),
            ..fast_config()
        };
        let Harness {
            session,
            connections,
            counters,
            attempts,
        } = harness("", config);
        drop(connections);
        session.connect();

        eventually(|| attempts.load(Ordering::SeqCst) >= 2).await;
        session.dispose();
        let made = attempts.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), made);
        assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
        assert!(session.is_disposed());
    }

    #[tokio::test]
    async fn test_connect_timeout_counts_as_failure() {
        let disconnected = Arc::new(AtomicUsize::new(0));
        let connector = StalledConnector::default();
        let attempts = connector.attempts.clone();
        let config = SessionConfig {
            connect_timeout: Duration::from_millis(20),
            ..fast_config()
        };
        let callbacks = SessionCallbacks::new().on_disconnected({
            let disconnected = disconnected.clone();
            move || {
                disconnected.fetch_add(1, Ordering::SeqCst);
            }
        });
        let session = DocumentSession::with_options(
            "ws://test/api/socket/doc",
            TextBuffer::new(""),
            callbacks,
            config,
            Arc::new(connector),
        );
        session.connect();

        eventually(|| attempts.load(Ordering::SeqCst) >= 3).await;
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(session.connection_state(), ConnectionState::Reconnecting);
        assert!(!session.is_online());
    }

    #[tokio::test]
    async fn test_repeated_drops_desynchronize() {
        let config = SessionConfig {
            max_recent_failures: 3,
            failure_window: Duration::from_secs(10),
            ..fast_config()
        };
        let h = harness("", config);
        h.session.connect();
        for _ in 0..3 {
            let peer = h.open();
            send(&peer, snapshot("", 0));
            drop(peer);
        }
        eventually(|| h.counters.desynchronized.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.session.status(), SyncStatus::Desynchronized);
    }
}
