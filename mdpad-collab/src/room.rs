//! Document rooms: the authoritative history plus fan-out to connections.
//!
//! Each room owns the document text, its operation history and presence.
//! Every change is applied and published on the room's broadcast channel
//! under one lock, so all connections observe events in the same order the
//! history records them. A connection turns its own operation events into
//! acknowledgements and forwards everything else.
//!
//! ```text
//!   conn A ─ operation(rev r) ─▶ DocumentRoom::apply_operation
//!                                   │ transform against history[r..]
//!                                   │ apply · push · revision += 1
//!                                   ▼
//!                          broadcast::Sender<Arc<RoomEvent>>
//!                        ┌──────────┴──────────┐
//!                        ▼                     ▼
//!                conn A: ack(rev)      conn B: operation(rev)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mdpad_core::{Operation, OtError, SelectionRange, UserProfile};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::ServerMessage;
use crate::share;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RoomError {
    #[error("operation based on revision {revision}, but the document is at {latest}")]
    FutureRevision { revision: u64, latest: u64 },

    #[error(transparent)]
    Operation(#[from] OtError),
}

/// Something that happened in a room, tagged with who caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEvent {
    pub origin: u64,
    pub message: ServerMessage,
}

impl RoomEvent {
    /// What the connection of `user_id` should send for this event.
    pub fn for_user(&self, user_id: u64) -> Option<ServerMessage> {
        if self.origin != user_id {
            return Some(self.message.clone());
        }
        match self.message {
            ServerMessage::Operation { revision, .. } => Some(ServerMessage::Ack { revision }),
            _ => None,
        }
    }
}

/// Statistics for monitoring a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub events_sent: u64,
    pub connections: usize,
    pub revision: u64,
}

#[derive(Default)]
struct RoomState {
    text: String,
    language: Option<String>,
    history: Vec<Operation>,
    profiles: BTreeMap<u64, UserProfile>,
    selections: BTreeMap<u64, Vec<SelectionRange>>,
    connections: usize,
}

impl RoomState {
    fn revision(&self) -> u64 {
        self.history.len() as u64
    }
}

/// A newly joined connection's id, event feed and opening messages.
pub struct Joined {
    pub user_id: u64,
    pub events: broadcast::Receiver<Arc<RoomEvent>>,
    /// `identity`, `snapshot` and current selections, in send order.
    pub greeting: Vec<ServerMessage>,
}

/// One shared document.
pub struct DocumentRoom {
    state: Mutex<RoomState>,
    sender: broadcast::Sender<Arc<RoomEvent>>,
    next_user_id: AtomicU64,
    events_sent: AtomicU64,
}

impl DocumentRoom {
    /// `capacity` bounds how far a connection may lag before it is dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(RoomState::default()),
            sender,
            next_user_id: AtomicU64::new(1),
            events_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection. The event feed starts right after the
    /// snapshot in `greeting`.
    pub fn join(&self) -> Joined {
        let user_id = self.next_user_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.connections += 1;
        let events = self.sender.subscribe();

        let mut greeting = vec![
            ServerMessage::Identity { user_id },
            ServerMessage::Snapshot {
                text: state.text.clone(),
                revision: state.revision(),
                language: state.language.clone(),
                users: state
                    .profiles
                    .iter()
                    .map(|(id, profile)| profile.clone().with_id(*id))
                    .collect(),
            },
        ];
        greeting.extend(state.selections.iter().map(|(id, ranges)| {
            ServerMessage::SelectionUpdate {
                user_id: *id,
                ranges: ranges.clone(),
            }
        }));

        Joined {
            user_id,
            events,
            greeting,
        }
    }

    /// Unregister a connection and tell everyone else.
    pub fn leave(&self, user_id: u64) {
        let mut state = self.state.lock();
        state.connections = state.connections.saturating_sub(1);
        state.profiles.remove(&user_id);
        state.selections.remove(&user_id);
        self.publish(user_id, ServerMessage::UserLeft { user_id });
    }

    /// Transform a client operation past everything it has not seen, apply
    /// it and publish it. Returns the new revision.
    pub fn apply_operation(
        &self,
        user_id: u64,
        revision: u64,
        op: Operation,
    ) -> Result<u64, RoomError> {
        let mut state = self.state.lock();
        let latest = state.revision();
        if revision > latest {
            return Err(RoomError::FutureRevision { revision, latest });
        }

        let mut op = op;
        for seen in &state.history[revision as usize..] {
            op = op.transform(seen)?.0;
        }
        state.text = op.apply(&state.text)?;

        for ranges in state.selections.values_mut() {
            for range in ranges.iter_mut() {
                *range = range.transform(&op);
            }
        }

        state.history.push(op.clone());
        let revision = state.revision();
        self.publish(
            user_id,
            ServerMessage::Operation {
                revision,
                ops: op,
                user_id,
            },
        );
        Ok(revision)
    }

    pub fn set_identity(&self, user_id: u64, profile: UserProfile) {
        let mut state = self.state.lock();
        state.profiles.insert(user_id, profile.clone());
        self.publish(
            user_id,
            ServerMessage::UserJoined {
                user_id,
                info: profile,
            },
        );
    }

    pub fn set_selection(&self, user_id: u64, ranges: Vec<SelectionRange>) {
        let mut state = self.state.lock();
        state.selections.insert(user_id, ranges.clone());
        self.publish(user_id, ServerMessage::SelectionUpdate { user_id, ranges });
    }

    pub fn set_language(&self, user_id: u64, language: String) {
        let mut state = self.state.lock();
        state.language = Some(language.clone());
        self.publish(user_id, ServerMessage::LanguageChange { language });
    }

    pub fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision()
    }

    pub fn language(&self) -> Option<String> {
        self.state.lock().language.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    pub fn stats(&self) -> RoomStats {
        let state = self.state.lock();
        RoomStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            connections: state.connections,
            revision: state.revision(),
        }
    }

    /// Callers hold the state lock, which fixes the event order.
    fn publish(&self, origin: u64, message: ServerMessage) {
        // No receivers just means nobody else is connected.
        let _ = self.sender.send(Arc::new(RoomEvent { origin, message }));
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// All rooms of a server, keyed by document id.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
    capacity: usize,
}

impl RoomManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn get_or_create(&self, document_id: &str) -> Arc<DocumentRoom> {
        if let Some(room) = self.rooms.read().await.get(document_id) {
            return room.clone();
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(document_id.to_owned())
            .or_insert_with(|| {
                log::info!("Created room {document_id}");
                Arc::new(DocumentRoom::new(self.capacity))
            })
            .clone()
    }

    /// Open or create a room and register a connection in it. The room
    /// cannot be swept between lookup and registration.
    pub async fn join(&self, document_id: &str) -> (Arc<DocumentRoom>, Joined) {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(document_id.to_owned())
            .or_insert_with(|| {
                log::info!("Created room {document_id}");
                Arc::new(DocumentRoom::new(self.capacity))
            })
            .clone();
        let joined = room.join();
        (room, joined)
    }

    pub async fn get(&self, document_id: &str) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Drop rooms nobody is connected to whose id says they expired before
    /// `now` (unix seconds). Ids without an expiry are kept. Returns how
    /// many were dropped.
    pub async fn sweep_expired(&self, now: u64) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|id, room| {
            let expired = share::expires_at(id).is_some_and(|at| at < now);
            !(expired && room.connections() == 0)
        });
        let swept = before - rooms.len();
        if swept > 0 {
            log::info!("Swept {swept} expired room(s)");
        }
        swept
    }
}
