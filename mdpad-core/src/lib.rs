//! # mdpad-core
//!
//! Transport-free building blocks of the collaborative text editor:
//!
//! - [`operation`]: retain/insert/delete operations with compose, transform
//!   and apply
//! - [`reconciler`]: the client state machine that keeps one operation in
//!   flight and rebases remote work onto local edits
//! - [`model`]: snapshots, participants and selections
//!
//! Everything here is synchronous and deterministic; networking lives in
//! `mdpad-collab`.

pub mod model;
pub mod operation;
pub mod reconciler;

pub use model::{DocumentSnapshot, SelectionRange, UserInfo, UserProfile, HUE_RANGE};
pub use operation::{apply, char_len, compose, transform, Component, Operation, OtError};
pub use reconciler::{OutgoingOperation, ReconcileError, Reconciler, Resync, SyncStatus};
