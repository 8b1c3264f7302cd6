//! Plain data shared between the reconciler, presence and the wire.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// Number of distinct hues a participant may pick from.
pub const HUE_RANGE: u16 = 360;

/// Display identity a participant announces about themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub hue: u16,
}

impl UserProfile {
    pub fn new(name: impl Into<String>, hue: u16) -> Self {
        Self {
            name: name.into(),
            hue,
        }
    }

    /// Hue must fall inside `[0, HUE_RANGE)`.
    pub fn is_valid(&self) -> bool {
        self.hue < HUE_RANGE
    }

    pub fn with_id(self, id: u64) -> UserInfo {
        UserInfo {
            id,
            name: self.name,
            hue: self.hue,
        }
    }
}

/// A participant as tracked by presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: u64,
    pub name: String,
    pub hue: u16,
}

impl UserInfo {
    pub fn profile(&self) -> UserProfile {
        UserProfile::new(self.name.clone(), self.hue)
    }
}

/// Full document state at a given server revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub text: String,
    pub revision: u64,
    pub language: Option<String>,
}

impl DocumentSnapshot {
    pub fn new(text: impl Into<String>, revision: u64) -> Self {
        Self {
            text: text.into(),
            revision,
            language: None,
        }
    }
}

/// A caret (`start == end`) or a selected span, in char offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

impl SelectionRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn caret(at: usize) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_caret(&self) -> bool {
        self.start == self.end
    }

    /// Remap both ends through `op`.
    pub fn transform(&self, op: &Operation) -> Self {
        Self {
            start: op.transform_index(self.start),
            end: op.transform_index(self.end),
        }
    }

    /// Clamp both ends into a document of `len` chars.
    pub fn clamp(&self, len: usize) -> Self {
        Self {
            start: self.start.min(len),
            end: self.end.min(len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_transform() {
        let op = Operation::new().retain(2).insert("xx").retain(8);
        assert_eq!(
            SelectionRange::new(1, 5).transform(&op),
            SelectionRange::new(1, 7)
        );
    }

    #[test]
    fn test_selection_collapses_into_delete() {
        let op = Operation::new().retain(4).delete(3).retain(3);
        let range = SelectionRange::new(5, 6).transform(&op);
        assert!(range.is_caret());
        assert_eq!(range.start, 4);
    }

    #[test]
    fn test_profile_hue_validation() {
        assert!(UserProfile::new("Ada", 359).is_valid());
        assert!(!UserProfile::new("Ada", 360).is_valid());
    }

    #[test]
    fn test_profile_with_id() {
        let info = UserProfile::new("Ada", 12).with_id(7);
        assert_eq!(info.id, 7);
        assert_eq!(info.profile(), UserProfile::new("Ada", 12));
    }
}
