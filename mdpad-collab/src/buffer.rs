//! The seam between a session and whatever holds the editable text.
//!
//! A host editor implements [`BufferAdapter`]. The session registers a
//! listener for user edits and pushes remote operations back through
//! [`BufferAdapter::apply_operation`]. Edits applied that way must not be
//! reported to the listener, or they would echo back to the server.
//!
//! [`TextBuffer`] is a complete in-memory adapter with a single selection.

use std::sync::Arc;

use log::trace;
use mdpad_core::{char_len, Operation, OtError, SelectionRange};

/// A user edit reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    /// `removed` chars at `offset` were replaced with `inserted`, in a
    /// document that had `base_len` chars before the edit.
    Splice {
        base_len: usize,
        offset: usize,
        removed: usize,
        inserted: String,
    },
    /// The whole text changed from `old` to `new`.
    Replace { old: String, new: String },
    /// The adapter already expressed the change as an operation.
    Operation(Operation),
}

impl LocalChange {
    pub fn into_operation(self) -> Result<Operation, OtError> {
        match self {
            LocalChange::Splice {
                base_len,
                offset,
                removed,
                inserted,
            } => Operation::from_edit(base_len, offset, removed, &inserted),
            LocalChange::Replace { old, new } => Ok(Operation::diff(&old, &new)),
            LocalChange::Operation(op) => Ok(op),
        }
    }
}

pub type LocalChangeListener = Arc<dyn Fn(LocalChange) + Send + Sync>;

/// Editable text surface driven by a session.
pub trait BufferAdapter: Send + 'static {
    /// Current full text.
    fn value(&self) -> String;

    /// Replace the whole text without reporting a local change.
    fn set_value(&mut self, text: &str);

    /// Register the listener that receives user edits. Replaces any
    /// previous listener.
    fn on_local_change(&mut self, listener: LocalChangeListener);

    /// Drop the registered listener.
    fn detach(&mut self);

    /// Apply a remote operation, remapping selections, without reporting it
    /// as a local change.
    fn apply_operation(&mut self, op: &Operation) -> Result<(), OtError>;

    /// Local selections, used for presence.
    fn selections(&self) -> Vec<SelectionRange> {
        Vec::new()
    }

    /// The document language changed; adapters may switch highlighting.
    fn set_language_hint(&mut self, _language: &str) {}
}

/// In-memory [`BufferAdapter`] with one selection.
#[derive(Default)]
pub struct TextBuffer {
    text: String,
    selection: SelectionRange,
    language: Option<String>,
    listener: Option<LocalChangeListener>,
    suppress: bool,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        char_len(&self.text)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn selection(&self) -> SelectionRange {
        self.selection
    }

    pub fn set_selection(&mut self, range: SelectionRange) {
        self.selection = range.clamp(self.len());
    }

    pub fn language_hint(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Replace `start..end` with `inserted`, as if typed. The caret ends up
    /// after the inserted text.
    pub fn replace(&mut self, start: usize, end: usize, inserted: &str) -> Result<(), OtError> {
        let base_len = self.len();
        if start > end {
            return Err(OtError::LengthMismatch {
                expected: start,
                actual: end,
            });
        }
        let op = Operation::from_edit(base_len, start, end - start, inserted)?;
        self.text = op.apply(&self.text)?;
        self.selection = SelectionRange::caret(start + char_len(inserted));
        self.emit(LocalChange::Splice {
            base_len,
            offset: start,
            removed: end - start,
            inserted: inserted.to_owned(),
        });
        Ok(())
    }

    pub fn insert(&mut self, at: usize, text: &str) -> Result<(), OtError> {
        self.replace(at, at, text)
    }

    pub fn delete(&mut self, start: usize, end: usize) -> Result<(), OtError> {
        self.replace(start, end, "")
    }

    /// Type `text` at the end of the buffer.
    pub fn append(&mut self, text: &str) -> Result<(), OtError> {
        let end = self.len();
        self.replace(end, end, text)
    }

    /// Replace the whole text as a user edit.
    pub fn rewrite(&mut self, text: &str) {
        let old = std::mem::replace(&mut self.text, text.to_owned());
        self.selection = self.selection.clamp(self.len());
        self.emit(LocalChange::Replace {
            old,
            new: text.to_owned(),
        });
    }

    fn emit(&self, change: LocalChange) {
        if self.suppress {
            trace!("suppressed local change during remote apply");
            return;
        }
        if let Some(listener) = &self.listener {
            listener(change);
        }
    }
}

impl BufferAdapter for TextBuffer {
    fn value(&self) -> String {
        self.text.clone()
    }

    fn set_value(&mut self, text: &str) {
        self.text = text.to_owned();
        self.selection = self.selection.clamp(self.len());
    }

    fn on_local_change(&mut self, listener: LocalChangeListener) {
        self.listener = Some(listener);
    }

    fn detach(&mut self) {
        self.listener = None;
    }

    fn apply_operation(&mut self, op: &Operation) -> Result<(), OtError> {
        let text = op.apply(&self.text)?;
        let selection = self.selection.transform(op);
        self.suppress = true;
        self.rewrite(&text);
        self.suppress = false;
        self.selection = selection.clamp(self.len());
        Ok(())
    }

    fn selections(&self) -> Vec<SelectionRange> {
        vec![self.selection]
    }

    fn set_language_hint(&mut self, language: &str) {
        self.language = Some(language.to_owned());
    }
}
