//! Presence: who else is in the document and where their selections are.
//!
//! ## Architecture
//!
//! ```text
//! userJoined / userLeft / snapshot.users          selectionUpdate
//!            │                                          │
//!            ▼                                          ▼
//!   PresenceTracker::upsert / remove          PresenceTracker::set_selection
//!            │                                          │
//!            ▼                                          ▼
//!    UsersSnapshot (Arc, copy-on-write)      SelectionsSnapshot (Arc)
//!            │                                          ▲
//!            ▼                                          │ transform_selections
//!      onChangeUsers                          every applied operation
//! ```
//!
//! Snapshots handed to the host are immutable: later updates copy the map
//! rather than mutate a snapshot someone still holds. The local participant
//! is never tracked, so the host only sees other people.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use mdpad_core::{Operation, SelectionRange, UserInfo, UserProfile};

/// Immutable view of the other participants, keyed by user id.
pub type UsersSnapshot = Arc<BTreeMap<u64, UserInfo>>;

/// Immutable view of the other participants' selections.
pub type SelectionsSnapshot = Arc<BTreeMap<u64, Vec<SelectionRange>>>;

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Per-session presence state.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    /// Id the server assigned to us, once known.
    local_user_id: Option<u64>,
    users: UsersSnapshot,
    selections: SelectionsSnapshot,
    /// Our own selection, last value set by the host.
    local_selection: Vec<SelectionRange>,
    /// Rate limiter for outgoing selection updates.
    last_selection_broadcast: Option<Instant>,
    selection_interval: Duration,
    selection_dirty: bool,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::with_interval(Duration::ZERO)
    }

    /// Outgoing selection updates are sent at most once per `interval`.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            local_user_id: None,
            users: Arc::default(),
            selections: Arc::default(),
            local_selection: Vec::new(),
            last_selection_broadcast: None,
            selection_interval: interval,
            selection_dirty: false,
        }
    }

    pub fn local_user_id(&self) -> Option<u64> {
        self.local_user_id
    }

    /// Record our own id and forget anything tracked under it.
    pub fn set_local_user(&mut self, user_id: u64) -> bool {
        self.local_user_id = Some(user_id);
        self.remove(user_id)
    }

    /// Add or replace a participant. Returns whether anything changed.
    pub fn upsert(&mut self, user_id: u64, profile: UserProfile) -> bool {
        if Some(user_id) == self.local_user_id {
            return false;
        }
        if !profile.is_valid() {
            debug!("ignoring user {user_id} with hue {}", profile.hue);
            return false;
        }
        let info = profile.with_id(user_id);
        if self.users.get(&user_id) == Some(&info) {
            return false;
        }
        Arc::make_mut(&mut self.users).insert(user_id, info);
        true
    }

    /// Forget a participant and their selection. Returns whether they were
    /// known.
    pub fn remove(&mut self, user_id: u64) -> bool {
        let had_user = self.users.contains_key(&user_id);
        if had_user {
            Arc::make_mut(&mut self.users).remove(&user_id);
        }
        if self.selections.contains_key(&user_id) {
            Arc::make_mut(&mut self.selections).remove(&user_id);
        }
        had_user
    }

    /// Replace everyone with the participants listed in a snapshot.
    pub fn replace_all(&mut self, users: impl IntoIterator<Item = UserInfo>) {
        let local = self.local_user_id;
        let users: BTreeMap<u64, UserInfo> = users
            .into_iter()
            .filter(|user| Some(user.id) != local && user.profile().is_valid())
            .map(|user| (user.id, user))
            .collect();
        self.users = Arc::new(users);
        self.selections = Arc::default();
    }

    /// Forget all participants. Returns whether any were known.
    pub fn clear(&mut self) -> bool {
        let had_users = !self.users.is_empty();
        self.users = Arc::default();
        self.selections = Arc::default();
        had_users
    }

    pub fn snapshot(&self) -> UsersSnapshot {
        self.users.clone()
    }

    pub fn selections(&self) -> SelectionsSnapshot {
        self.selections.clone()
    }

    pub fn user(&self, user_id: u64) -> Option<&UserInfo> {
        self.users.get(&user_id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    // ── selections ─────────────────────────────────────────────────

    /// Record a remote participant's selection. Returns whether it was
    /// accepted.
    pub fn set_selection(&mut self, user_id: u64, ranges: Vec<SelectionRange>) -> bool {
        if Some(user_id) == self.local_user_id {
            return false;
        }
        Arc::make_mut(&mut self.selections).insert(user_id, ranges);
        true
    }

    /// Remap every remote selection through an operation applied to the
    /// local buffer. Returns whether there were any to remap.
    pub fn transform_selections(&mut self, op: &Operation) -> bool {
        if self.selections.is_empty() {
            return false;
        }
        let remapped = self
            .selections
            .iter()
            .map(|(id, ranges)| {
                let ranges = ranges.iter().map(|range| range.transform(op)).collect();
                (*id, ranges)
            })
            .collect();
        self.selections = Arc::new(remapped);
        true
    }

    // ── local selection ────────────────────────────────────────────

    pub fn local_selection(&self) -> &[SelectionRange] {
        &self.local_selection
    }

    /// Store our selection. Returns it when it should be broadcast now;
    /// otherwise it stays pending until [`flush_local_selection`](Self::flush_local_selection).
    pub fn update_local_selection(
        &mut self,
        ranges: Vec<SelectionRange>,
    ) -> Option<Vec<SelectionRange>> {
        if ranges == self.local_selection && !self.selection_dirty {
            return None;
        }
        self.local_selection = ranges;
        self.selection_dirty = true;
        self.flush_local_selection()
    }

    /// Release a throttled selection once the interval has passed.
    pub fn flush_local_selection(&mut self) -> Option<Vec<SelectionRange>> {
        if !self.selection_dirty {
            return None;
        }
        if let Some(last) = self.last_selection_broadcast {
            if last.elapsed() < self.selection_interval {
                return None;
            }
        }
        self.selection_dirty = false;
        self.last_selection_broadcast = Some(Instant::now());
        Some(self.local_selection.clone())
    }

    /// Shift our stored selection through a remote operation.
    pub fn transform_local_selection(&mut self, op: &Operation) {
        for range in &mut self.local_selection {
            *range = range.transform(op);
        }
    }
}
