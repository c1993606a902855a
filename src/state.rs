//! Mutable per-attempt match state: the buffer view, offset, declared/max length, decoded
//! fields so far, and the final decision. Cloneable so `Choice` nodes can backtrack.

use crate::pattern::ast::DecodedField;

/// The single verdict the evaluator returns for a given buffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Emit,
    Continue,
    Drop,
}

/// Per-attempt record. The buffer is owned by the framer in production use, but `State` keeps its
/// own copy so a cloned state (for choice backtracking) is fully independent; cloning a growing
/// `Vec<u8>` byte buffer once per choice branch is the price of the backtracking model described
/// in `SPEC_FULL.md` §9.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    buffer: Vec<u8>,
    offset: usize,
    declared_length: usize,
    max_length: usize,
    fields: Vec<DecodedField>,
    decision: Option<Decision>,
}

impl State {
    pub fn new(max_length: usize) -> Self {
        State {
            buffer: Vec::new(),
            offset: 0,
            declared_length: 0,
            max_length,
            fields: Vec::new(),
            decision: None,
        }
    }

    pub fn from_buffer(buffer: Vec<u8>, max_length: usize) -> Self {
        State {
            buffer,
            offset: 0,
            declared_length: 0,
            max_length,
            fields: Vec::new(),
            decision: None,
        }
    }

    pub fn append(&mut self, byte: u8) {
        self.buffer.push(byte);
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, n: usize) {
        debug_assert!(n <= self.buffer.len(), "offset must not exceed buffer length");
        self.offset = n;
    }

    pub fn declared_length(&self) -> usize {
        self.declared_length
    }

    /// Set the declared length, clamped to the effective maximum (when one is set).
    pub fn set_declared_length(&mut self, n: usize) {
        self.declared_length = if self.max_length > 0 {
            n.min(self.max_length)
        } else {
            n
        };
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn set_max_length(&mut self, n: usize) {
        self.max_length = n;
        if self.max_length > 0 && self.declared_length > self.max_length {
            self.declared_length = self.max_length;
        }
    }

    pub fn add_field(&mut self, field: DecodedField) {
        self.fields.push(field);
    }

    /// Clear the decoded-fields list and declared length before a fresh evaluation pass. The
    /// evaluator always re-walks the whole buffer from position zero, so anything it decoded on
    /// a previous call must not survive into the next one.
    pub fn reset_for_attempt(&mut self) {
        self.fields.clear();
        self.declared_length = 0;
    }

    pub fn fields(&self) -> &[DecodedField] {
        &self.fields
    }

    /// Copy `other`'s offset and append its fields onto `self`. Used when a `Choice` branch
    /// succeeds and its cloned state must be folded back into the parent.
    pub fn merge(&mut self, other: &State) {
        self.offset = other.offset;
        self.fields.extend(other.fields.iter().cloned());
        self.declared_length = other.declared_length;
        self.max_length = other.max_length;
    }

    pub fn set_decision(&mut self, decision: Decision) {
        self.decision = Some(decision);
    }

    pub fn decision(&self) -> Option<Decision> {
        self.decision
    }

    /// Drop the front `n` bytes, sliding the offset down to match. Used by the framer to
    /// resynchronize after a `Drop` and to maintain the buffer-size ceiling.
    pub fn discard_front(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        self.buffer.drain(..n);
        self.offset = self.offset.saturating_sub(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldKind, Value};

    fn field(name: &str, offset: usize) -> DecodedField {
        DecodedField {
            name: name.to_string(),
            offset,
            kind: FieldKind::U8,
            value: Value::UInt(1),
        }
    }

    #[test]
    fn declared_length_clamps_to_max() {
        let mut s = State::new(4);
        s.set_declared_length(10);
        assert_eq!(s.declared_length(), 4);
    }

    #[test]
    fn declared_length_unclamped_when_no_max() {
        let mut s = State::new(0);
        s.set_declared_length(10);
        assert_eq!(s.declared_length(), 10);
    }

    #[test]
    fn merge_copies_offset_and_appends_fields() {
        let mut parent = State::new(0);
        parent.add_field(field("a", 0));
        let mut branch = State::new(0);
        branch.set_offset(0);
        branch.add_field(field("b", 1));
        branch.set_offset(2);

        parent.merge(&branch);
        assert_eq!(parent.offset(), 2);
        assert_eq!(parent.fields().len(), 2);
        assert_eq!(parent.fields()[1].name, "b");
    }

    #[test]
    fn discard_front_slides_offset() {
        let mut s = State::from_buffer(vec![1, 2, 3, 4], 0);
        s.set_offset(3);
        s.discard_front(2);
        assert_eq!(s.buffer(), &[3, 4]);
        assert_eq!(s.offset(), 1);
    }

    #[test]
    fn clone_is_fully_independent() {
        let mut a = State::new(0);
        a.add_field(field("a", 0));
        let mut b = a.clone();
        b.add_field(field("b", 1));
        assert_eq!(a.fields().len(), 1);
        assert_eq!(b.fields().len(), 2);
    }
}
