//! Retain / insert / delete operations over a linear text buffer.
//!
//! An [`Operation`] walks its base document from left to right. Every
//! component either keeps characters (`Retain`), adds new ones (`Insert`)
//! or drops them (`Delete`). Lengths are measured in Unicode scalar values
//! (`char`s) so that offsets agree across peers regardless of how a host
//! stores its text.
//!
//! ## Algebra
//!
//! ```text
//!           a            b
//!   S ─────────▶ S·a ─────────▶ S·a·b      compose(a, b) = a∘b
//!
//!           a
//!   S ─────────▶ S·a
//!   │             │
//! b │             │ b'                     transform(a, b) = (a', b')
//!   ▼      a'     ▼                        S·a·b' == S·b·a'
//!  S·b ────────▶ S·a·b'
//! ```
//!
//! When both sides insert at the same offset, the left-hand operation of
//! `transform` keeps its text first.
//!
//! ## Wire encoding
//!
//! Operations serialize to a compact JSON array: a positive integer is a
//! retain, a negative integer is a delete and a string is an insert, e.g.
//! `[2, "xx", -1, 4]`.

use std::cmp::Ordering;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors raised by the operation algebra.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// Two operations cannot be combined because their lengths disagree.
    #[error("incompatible operation lengths: {left} vs {right}")]
    IncompatibleLength { left: usize, right: usize },

    /// An operation was applied to a text of the wrong length.
    #[error("operation expects {expected} chars, found {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// A single step of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

impl Component {
    /// Number of base characters this component consumes.
    pub fn base_len(&self) -> usize {
        match self {
            Component::Retain(n) | Component::Delete(n) => *n,
            Component::Insert(_) => 0,
        }
    }

    /// Number of characters this component contributes to the result.
    pub fn target_len(&self) -> usize {
        match self {
            Component::Retain(n) => *n,
            Component::Insert(text) => char_len(text),
            Component::Delete(_) => 0,
        }
    }
}

/// An edit that turns a document of `base_len` chars into one of
/// `target_len` chars.
///
/// Operations are built with the consuming [`retain`](Self::retain),
/// [`insert`](Self::insert) and [`delete`](Self::delete) methods and are
/// not mutated afterwards. The component list is kept canonical: adjacent
/// components of the same kind are merged and an insert always precedes an
/// adjacent delete, so two operations with the same effect compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Operation {
    components: Vec<Component>,
    base_len: usize,
    target_len: usize,
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the next `n` characters.
    pub fn retain(mut self, n: usize) -> Self {
        self.push_retain(n);
        self
    }

    /// Insert `text` at the current position.
    pub fn insert(mut self, text: impl AsRef<str>) -> Self {
        self.push_insert(text.as_ref());
        self
    }

    /// Drop the next `n` characters.
    pub fn delete(mut self, n: usize) -> Self {
        self.push_delete(n);
        self
    }

    /// Build the operation for a single splice: `removed` chars at `offset`
    /// are replaced with `inserted`.
    pub fn from_edit(
        base_len: usize,
        offset: usize,
        removed: usize,
        inserted: &str,
    ) -> Result<Self, OtError> {
        let end = offset + removed;
        if end > base_len {
            return Err(OtError::LengthMismatch {
                expected: end,
                actual: base_len,
            });
        }
        Ok(Operation::new()
            .retain(offset)
            .delete(removed)
            .insert(inserted)
            .retain(base_len - end))
    }

    /// Smallest single-splice operation turning `old` into `new`.
    pub fn diff(old: &str, new: &str) -> Self {
        let old: Vec<char> = old.chars().collect();
        let new: Vec<char> = new.chars().collect();

        let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let inserted: String = new[prefix..new.len() - suffix].iter().collect();
        Operation::new()
            .retain(prefix)
            .delete(old.len() - prefix - suffix)
            .insert(inserted)
            .retain(suffix)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Length of the document this operation applies to.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the document this operation produces.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// True when applying the operation leaves every document unchanged.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Apply the operation to `text`.
    pub fn apply(&self, text: &str) -> Result<String, OtError> {
        let actual = char_len(text);
        if actual != self.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual,
            });
        }

        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars();
        for component in &self.components {
            match component {
                Component::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Component::Insert(inserted) => out.push_str(inserted),
                Component::Delete(n) => {
                    for _ in 0..*n {
                        chars.next();
                    }
                }
            }
        }
        Ok(out)
    }

    /// Merge `self` followed by `next` into one operation.
    pub fn compose(&self, next: &Operation) -> Result<Operation, OtError> {
        if self.target_len != next.base_len {
            return Err(OtError::IncompatibleLength {
                left: self.target_len,
                right: next.base_len,
            });
        }

        let mut out = Operation::new();
        let mut first = self.components.iter().cloned();
        let mut second = next.components.iter().cloned();
        let mut a = first.next();
        let mut b = second.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Component::Delete(n)), rest) => {
                    out.push_delete(n);
                    a = first.next();
                    b = rest;
                }
                (rest, Some(Component::Insert(text))) => {
                    out.push_insert(&text);
                    a = rest;
                    b = second.next();
                }
                (None, _) | (_, None) => {
                    return Err(OtError::IncompatibleLength {
                        left: self.target_len,
                        right: next.base_len,
                    });
                }
                (Some(Component::Retain(i)), Some(Component::Retain(j))) => match i.cmp(&j) {
                    Ordering::Less => {
                        out.push_retain(i);
                        a = first.next();
                        b = Some(Component::Retain(j - i));
                    }
                    Ordering::Equal => {
                        out.push_retain(i);
                        a = first.next();
                        b = second.next();
                    }
                    Ordering::Greater => {
                        out.push_retain(j);
                        a = Some(Component::Retain(i - j));
                        b = second.next();
                    }
                },
                (Some(Component::Insert(text)), Some(Component::Delete(j))) => {
                    let len = char_len(&text);
                    match len.cmp(&j) {
                        Ordering::Less => {
                            a = first.next();
                            b = Some(Component::Delete(j - len));
                        }
                        Ordering::Equal => {
                            a = first.next();
                            b = second.next();
                        }
                        Ordering::Greater => {
                            let (_, tail) = split_at_char(&text, j);
                            a = Some(Component::Insert(tail.to_owned()));
                            b = second.next();
                        }
                    }
                }
                (Some(Component::Insert(text)), Some(Component::Retain(j))) => {
                    let len = char_len(&text);
                    match len.cmp(&j) {
                        Ordering::Less => {
                            out.push_insert(&text);
                            a = first.next();
                            b = Some(Component::Retain(j - len));
                        }
                        Ordering::Equal => {
                            out.push_insert(&text);
                            a = first.next();
                            b = second.next();
                        }
                        Ordering::Greater => {
                            let (head, tail) = split_at_char(&text, j);
                            out.push_insert(head);
                            a = Some(Component::Insert(tail.to_owned()));
                            b = second.next();
                        }
                    }
                }
                (Some(Component::Retain(i)), Some(Component::Delete(j))) => match i.cmp(&j) {
                    Ordering::Less => {
                        out.push_delete(i);
                        a = first.next();
                        b = Some(Component::Delete(j - i));
                    }
                    Ordering::Equal => {
                        out.push_delete(j);
                        a = first.next();
                        b = second.next();
                    }
                    Ordering::Greater => {
                        out.push_delete(j);
                        a = Some(Component::Retain(i - j));
                        b = second.next();
                    }
                },
            }
        }

        Ok(out)
    }

    /// Transform two concurrent operations on the same base.
    ///
    /// Returns `(a', b')` with `apply(apply(S, a), b') == apply(apply(S, b), a')`.
    /// Inserts of `self` at the same offset as inserts of `other` come first.
    pub fn transform(&self, other: &Operation) -> Result<(Operation, Operation), OtError> {
        if self.base_len != other.base_len {
            return Err(OtError::IncompatibleLength {
                left: self.base_len,
                right: other.base_len,
            });
        }

        let mut a_prime = Operation::new();
        let mut b_prime = Operation::new();
        let mut first = self.components.iter().cloned();
        let mut second = other.components.iter().cloned();
        let mut a = first.next();
        let mut b = second.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Component::Insert(text)), rest) => {
                    b_prime.push_retain(char_len(&text));
                    a_prime.push_insert(&text);
                    a = first.next();
                    b = rest;
                }
                (rest, Some(Component::Insert(text))) => {
                    a_prime.push_retain(char_len(&text));
                    b_prime.push_insert(&text);
                    a = rest;
                    b = second.next();
                }
                (None, _) | (_, None) => {
                    return Err(OtError::IncompatibleLength {
                        left: self.base_len,
                        right: other.base_len,
                    });
                }
                (Some(Component::Retain(i)), Some(Component::Retain(j))) => {
                    let n = i.min(j);
                    a_prime.push_retain(n);
                    b_prime.push_retain(n);
                    a = remainder(i, n, Component::Retain, &mut first);
                    b = remainder(j, n, Component::Retain, &mut second);
                }
                (Some(Component::Delete(i)), Some(Component::Delete(j))) => {
                    let n = i.min(j);
                    a = remainder(i, n, Component::Delete, &mut first);
                    b = remainder(j, n, Component::Delete, &mut second);
                }
                (Some(Component::Delete(i)), Some(Component::Retain(j))) => {
                    let n = i.min(j);
                    a_prime.push_delete(n);
                    a = remainder(i, n, Component::Delete, &mut first);
                    b = remainder(j, n, Component::Retain, &mut second);
                }
                (Some(Component::Retain(i)), Some(Component::Delete(j))) => {
                    let n = i.min(j);
                    b_prime.push_delete(n);
                    a = remainder(i, n, Component::Retain, &mut first);
                    b = remainder(j, n, Component::Delete, &mut second);
                }
            }
        }

        Ok((a_prime, b_prime))
    }

    /// Map a caret offset in the base document to the result document.
    ///
    /// Inserts landing exactly on the caret push it forward; a caret inside
    /// a deleted range collapses to the start of that range.
    pub fn transform_index(&self, index: usize) -> usize {
        let mut remaining = index;
        let mut new_index = index;
        for component in &self.components {
            match component {
                Component::Retain(n) => {
                    if *n > remaining {
                        break;
                    }
                    remaining -= n;
                }
                Component::Insert(text) => new_index += char_len(text),
                Component::Delete(n) => {
                    new_index -= remaining.min(*n);
                    if *n > remaining {
                        break;
                    }
                    remaining -= n;
                }
            }
        }
        new_index
    }

    // ── canonical builders ────────────────────────────────────────

    fn push_retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Retain(n));
        }
    }

    fn push_insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.target_len += char_len(text);

        if let Some(Component::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
            return;
        }
        if let Some(Component::Delete(_)) = self.components.last() {
            let at = self.components.len() - 1;
            if at > 0 {
                if let Component::Insert(prev) = &mut self.components[at - 1] {
                    prev.push_str(text);
                    return;
                }
            }
            self.components.insert(at, Component::Insert(text.to_owned()));
            return;
        }
        self.components.push(Component::Insert(text.to_owned()));
    }

    fn push_delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Delete(n));
        }
    }
}

/// Free-function form of [`Operation::compose`].
pub fn compose(a: &Operation, b: &Operation) -> Result<Operation, OtError> {
    a.compose(b)
}

/// Free-function form of [`Operation::transform`].
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    a.transform(b)
}

/// Free-function form of [`Operation::apply`].
pub fn apply(op: &Operation, text: &str) -> Result<String, OtError> {
    op.apply(text)
}

/// Length of `text` in the unit operations count in.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn split_at_char(text: &str, n: usize) -> (&str, &str) {
    match text.char_indices().nth(n) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, ""),
    }
}

fn remainder(
    len: usize,
    consumed: usize,
    make: fn(usize) -> Component,
    rest: &mut impl Iterator<Item = Component>,
) -> Option<Component> {
    if len > consumed {
        Some(make(len - consumed))
    } else {
        rest.next()
    }
}

// ───────────────────────────────────────────────────────────────────
// Serde
// ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(untagged)]
enum WireRef<'a> {
    Count(i64),
    Text(&'a str),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireComponent {
    Count(i64),
    Text(String),
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.components.iter().map(|c| match c {
            Component::Retain(n) => WireRef::Count(*n as i64),
            Component::Delete(n) => WireRef::Count(-(*n as i64)),
            Component::Insert(text) => WireRef::Text(text),
        }))
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let parts = Vec::<WireComponent>::deserialize(deserializer)?;
        let overflow = || D::Error::custom("operation length overflows");
        let mut op = Operation::new();
        for part in parts {
            match part {
                WireComponent::Count(n) => {
                    let len = usize::try_from(n.unsigned_abs()).map_err(|_| overflow())?;
                    op.base_len.checked_add(len).ok_or_else(overflow)?;
                    if n >= 0 {
                        op.target_len.checked_add(len).ok_or_else(overflow)?;
                        op.push_retain(len);
                    } else {
                        op.push_delete(len);
                    }
                }
                WireComponent::Text(text) => {
                    op.target_len.checked_add(char_len(&text)).ok_or_else(overflow)?;
                    op.push_insert(&text);
                }
            }
        }
        Ok(op)
    }
}
