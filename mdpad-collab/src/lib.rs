//! # mdpad-collab: collaborative editing over WebSocket
//!
//! Connects a local text buffer to a shared document on a sequencing
//! server and keeps both consistent while everyone edits at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  local changes  ┌─────────────────┐    JSON text    ┌────────────┐
//! │ BufferAdapter│ ───────────────►│ DocumentSession │ ◄─────────────► │ SyncServer │
//! │ (host view)  │ ◄───────────────│  Reconciler     │   /api/socket/  │ (rooms)    │
//! └──────────────┘ remote ops,     │  Presence       │      {id}       └────────────┘
//!                  caret remap     │  Backoff        │
//!                                  └────────┬────────┘
//!                                           ▼
//!                                   SessionCallbacks
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`transport`]: connections, connectors and reconnect backoff
//! - [`buffer`]: the editor buffer seam and an in-memory buffer
//! - [`presence`]: other participants and their selections
//! - [`session`]: the document session facade
//! - [`share`]: document ids and socket addresses
//! - [`preferences`]: persisted name and colour
//! - [`room`], [`server`]: the reference sequencing server

pub mod buffer;
pub mod preferences;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod share;
pub mod transport;

pub use buffer::{BufferAdapter, LocalChange, LocalChangeListener, TextBuffer};
pub use preferences::{
    FilePreferences, MemoryPreferences, PreferencesError, PreferencesStore, UserPreferences,
};
pub use presence::{PresenceTracker, SelectionsSnapshot, UsersSnapshot};
pub use protocol::{ClientMessage, MessageKind, ProtocolError, ServerMessage};
pub use room::{DocumentRoom, RoomError, RoomEvent, RoomManager, RoomStats};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{DocumentSession, SessionCallbacks, SessionConfig};
pub use share::{expire_from_query, expires_at, generate_document_id, socket_uri};
pub use transport::{Backoff, Connection, ConnectionPeer, ConnectionState, Connector, WebSocketConnector};
