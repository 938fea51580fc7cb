//! Edit operations over a document of addressable units.
//!
//! A document is a sequence of Unicode scalar values (`char`). An operation
//! is a left-to-right scan over that sequence:
//!
//! ```text
//!  base:    h e l l o
//!           │ │ │ │ │
//!  op:      Retain(5) ─────────── Insert("!")
//!           │ │ │ │ │              │
//!  target:  h e l l o              !
//! ```
//!
//! The sum of Retain + Delete lengths is the length of the document the
//! operation is defined against (`base_len`); Retain + Insert lengths give the
//! length of the document it produces (`target_len`).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OtError;
use crate::hash::ContentHash;

/// A single step of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    /// Keep the next `n` units.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove the next `n` units.
    Delete(usize),
}

impl Component {
    /// Length in units (chars for inserts).
    pub fn len(&self) -> usize {
        match self {
            Component::Retain(n) | Component::Delete(n) => *n,
            Component::Insert(s) => s.chars().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split off the first `n` units. Returns the head and, if anything is
    /// left, the tail.
    pub(crate) fn split_at(self, n: usize) -> (Component, Option<Component>) {
        let len = self.len();
        if n >= len {
            return (self, None);
        }
        match self {
            Component::Retain(k) => (Component::Retain(n), Some(Component::Retain(k - n))),
            Component::Delete(k) => (Component::Delete(n), Some(Component::Delete(k - n))),
            Component::Insert(s) => {
                let byte_idx = s
                    .char_indices()
                    .nth(n)
                    .map(|(i, _)| i)
                    .unwrap_or(s.len());
                let (head, tail) = s.split_at(byte_idx);
                (
                    Component::Insert(head.to_string()),
                    Some(Component::Insert(tail.to_string())),
                )
            }
        }
    }
}

/// The component sequence of an edit, without metadata.
///
/// Built through [`retain`](Self::retain), [`insert`](Self::insert) and
/// [`delete`](Self::delete), which keep the sequence canonical: adjacent
/// components of one kind are merged, zero-length components are dropped and
/// an insert directly after a delete is moved in front of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Component>", into = "Vec<Component>")]
pub struct TextOp {
    components: Vec<Component>,
    base_len: usize,
    target_len: usize,
    /// A length sum did not fit in `usize`; the lengths above are saturated.
    overflowed: bool,
}

impl TextOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap raw components without normalizing them.
    ///
    /// Used by the decoder; call [`validate`] before trusting the result.
    pub fn from_components(components: Vec<Component>) -> Self {
        let mut op = Self::default();
        for c in &components {
            match c {
                Component::Retain(n) => op.grow(*n, *n),
                Component::Insert(s) => op.grow(0, s.chars().count()),
                Component::Delete(n) => op.grow(*n, 0),
            }
        }
        op.components = components;
        op
    }

    fn grow(&mut self, base: usize, target: usize) {
        match (
            self.base_len.checked_add(base),
            self.target_len.checked_add(target),
        ) {
            (Some(b), Some(t)) => {
                self.base_len = b;
                self.target_len = t;
            }
            _ => {
                self.overflowed = true;
                self.base_len = self.base_len.saturating_add(base);
                self.target_len = self.target_len.saturating_add(target);
            }
        }
    }

    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.grow(n, n);
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last = last.saturating_add(n);
        } else {
            self.components.push(Component::Retain(n));
        }
        self
    }

    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        self.grow(0, text.chars().count());
        let len = self.components.len();
        match self.components.last_mut() {
            Some(Component::Insert(last)) => {
                last.push_str(text);
                return self;
            }
            Some(Component::Delete(_)) => {}
            _ => {
                self.components.push(Component::Insert(text.to_string()));
                return self;
            }
        }

        // Canonical order is insert-before-delete at one position.
        if len >= 2 {
            if let Component::Insert(prev) = &mut self.components[len - 2] {
                prev.push_str(text);
                return self;
            }
        }
        self.components.insert(len - 1, Component::Insert(text.to_string()));
        self
    }

    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.grow(n, 0);
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            *last = last.saturating_add(n);
        } else {
            self.components.push(Component::Delete(n));
        }
        self
    }

    /// Append a component through the normalizing builders.
    pub fn push(&mut self, component: Component) -> &mut Self {
        match component {
            Component::Retain(n) => self.retain(n),
            Component::Insert(s) => self.insert(&s),
            Component::Delete(n) => self.delete(n),
        }
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

    /// True if the component lengths do not sum within `usize`. Such an
    /// operation never validates.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// True if applying the operation leaves any document unchanged.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Apply to `doc`, producing the new content.
    pub fn apply(&self, doc: &str) -> Result<String, OtError> {
        let doc_len = doc.chars().count();
        if doc_len != self.base_len {
            return Err(OtError::MalformedOperation {
                expected: doc_len,
                actual: self.base_len,
            });
        }

        let mut out = String::with_capacity(doc.len());
        let mut chars = doc.chars();
        for c in &self.components {
            match c {
                Component::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Component::Insert(s) => out.push_str(s),
                Component::Delete(n) => {
                    if *n > 0 {
                        chars.nth(n - 1);
                    }
                }
            }
        }
        Ok(out)
    }

    /// The operation that undoes `self` when applied to `self.apply(doc)`.
    pub fn invert(&self, doc: &str) -> Result<TextOp, OtError> {
        let doc_len = doc.chars().count();
        if doc_len != self.base_len {
            return Err(OtError::MalformedOperation {
                expected: doc_len,
                actual: self.base_len,
            });
        }

        let mut inverse = TextOp::new();
        let mut chars = doc.chars();
        for c in &self.components {
            match c {
                Component::Retain(n) => {
                    inverse.retain(*n);
                    chars.by_ref().take(*n).for_each(drop);
                }
                Component::Insert(s) => {
                    inverse.delete(s.chars().count());
                }
                Component::Delete(n) => {
                    let removed: String = chars.by_ref().take(*n).collect();
                    inverse.insert(&removed);
                }
            }
        }
        Ok(inverse)
    }
}

impl From<Vec<Component>> for TextOp {
    fn from(components: Vec<Component>) -> Self {
        TextOp::from_components(components)
    }
}

impl From<TextOp> for Vec<Component> {
    fn from(op: TextOp) -> Self {
        op.components
    }
}

/// Check that `op` is well-formed for a document of `document_length` units.
pub fn validate(op: &TextOp, document_length: usize) -> Result<(), OtError> {
    if op.components.is_empty() {
        return Err(OtError::EmptyOperation);
    }
    if op.overflowed
        || op.components.iter().any(Component::is_empty)
        || op.base_len != document_length
    {
        return Err(OtError::MalformedOperation {
            expected: document_length,
            actual: op.base_len,
        });
    }
    Ok(())
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// An edit submitted by one author against a known document version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Version the edit was authored against.
    pub base_version: u64,
    /// Opaque author identity; also the transform tie-break key.
    pub author_id: String,
    /// Idempotency key, unique per author.
    pub client_op_id: Uuid,
    /// Authoring time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub ops: TextOp,
}

impl Operation {
    pub fn new(base_version: u64, author_id: impl Into<String>, ops: TextOp) -> Self {
        Self {
            base_version,
            author_id: author_id.into(),
            client_op_id: Uuid::new_v4(),
            timestamp: now_millis(),
            ops,
        }
    }

    /// Replace the generated idempotency key (resubmission, tests).
    pub fn with_client_op_id(mut self, client_op_id: Uuid) -> Self {
        self.client_op_id = client_op_id;
        self
    }

    /// Convenience: insert `text` at `pos` in a document of `doc_len` units.
    pub fn insert_at(
        base_version: u64,
        author_id: impl Into<String>,
        doc_len: usize,
        pos: usize,
        text: &str,
    ) -> Self {
        let mut ops = TextOp::new();
        ops.retain(pos).insert(text).retain(doc_len.saturating_sub(pos));
        Self::new(base_version, author_id, ops)
    }

    /// Convenience: delete `len` units at `pos` in a document of `doc_len` units.
    pub fn delete_at(
        base_version: u64,
        author_id: impl Into<String>,
        doc_len: usize,
        pos: usize,
        len: usize,
    ) -> Self {
        let mut ops = TextOp::new();
        ops.retain(pos)
            .delete(len)
            .retain(doc_len.saturating_sub(pos + len));
        Self::new(base_version, author_id, ops)
    }

    /// Deterministic total order used to break insert ties: smaller author
    /// first, then smaller client op id.
    pub fn orders_before(&self, other: &Operation) -> bool {
        (&self.author_id, self.client_op_id) < (&other.author_id, other.client_op_id)
    }

    pub fn validate(&self, document_length: usize) -> Result<(), OtError> {
        validate(&self.ops, document_length)
    }

    /// Apply to `doc` and hash the result.
    pub fn apply(&self, doc: &str) -> Result<(String, ContentHash), OtError> {
        let content = self.ops.apply(doc)?;
        let hash = ContentHash::of(&content);
        Ok((content, hash))
    }

    /// Serialize to the canonical wire form.
    pub fn encode(&self) -> Result<Vec<u8>, OtError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| OtError::Codec(e.to_string()))
    }

    /// Deserialize from the canonical wire form. Structure is not validated.
    pub fn decode(bytes: &[u8]) -> Result<Self, OtError> {
        let (op, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| OtError::Codec(e.to_string()))?;
        Ok(op)
    }
}
