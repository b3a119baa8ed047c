//! Operational-transformation algebra over insert/delete/replace operations.
//!
//! Pure functions only: no I/O, no async, no document/session awareness.
//! This module is the "hard part" the rest of the crate builds on — the
//! [`Op`] algebra guarantees that two concurrent edits transformed past
//! each other and applied in either order converge on the same text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of edit an [`Op`] carries out.
///
/// `Retain` is a no-op carrier used as the transform identity — it is
/// never produced by admission, only used internally and in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
    Replace,
    Retain,
}

/// An atomic edit intent.
///
/// `content` is required (and non-empty) for `insert`/`replace`;
/// `length` is required for `delete`/`replace`. `retain` carries neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub position: usize,
    pub content: Option<String>,
    pub length: Option<usize>,
    pub user_id: String,
    pub client_id: String,
    pub timestamp: i64,
    pub id: String,
    pub version: Option<u64>,
    pub applied: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("insert operation must carry non-empty content")]
    EmptyInsertContent,
    #[error("{0} operation requires a length")]
    MissingLength(&'static str),
    #[error("{0} operation requires content")]
    MissingContent(&'static str),
    #[error("position {position} out of bounds for content of length {content_len}")]
    OutOfBounds { position: usize, content_len: usize },
    #[error("position {0} does not fall on a UTF-8 character boundary")]
    NotACharBoundary(usize),
    #[error("retain is not an admissible operation kind")]
    RetainNotAdmissible,
}

impl Op {
    fn insert_len(&self) -> usize {
        self.content.as_deref().map_or(0, str::len)
    }

    fn span(&self) -> usize {
        self.length.unwrap_or(0)
    }

    fn end(&self) -> usize {
        self.position + self.span()
    }

    /// Validate shape invariants and bounds against `content_len`.
    ///
    /// Does not check UTF-8 char-boundary alignment — callers applying
    /// against real text should also call [`Op::check_char_boundaries`].
    pub fn validate(&self, content_len: usize) -> Result<(), OtError> {
        match self.kind {
            OpKind::Insert => {
                if self.content.as_deref().map_or(true, str::is_empty) {
                    return Err(OtError::EmptyInsertContent);
                }
                if self.position > content_len {
                    return Err(OtError::OutOfBounds { position: self.position, content_len });
                }
            }
            OpKind::Delete => {
                let length = self.length.ok_or(OtError::MissingLength("delete"))?;
                if self.position + length > content_len {
                    return Err(OtError::OutOfBounds { position: self.position + length, content_len });
                }
            }
            OpKind::Replace => {
                let length = self.length.ok_or(OtError::MissingLength("replace"))?;
                if self.content.is_none() {
                    return Err(OtError::MissingContent("replace"));
                }
                if self.position + length > content_len {
                    return Err(OtError::OutOfBounds { position: self.position + length, content_len });
                }
            }
            OpKind::Retain => return Err(OtError::RetainNotAdmissible),
        }
        Ok(())
    }

    /// Reject operations whose position/length land mid-codepoint in `text`.
    pub fn check_char_boundaries(&self, text: &str) -> Result<(), OtError> {
        if !text.is_char_boundary(self.position.min(text.len())) {
            return Err(OtError::NotACharBoundary(self.position));
        }
        if matches!(self.kind, OpKind::Delete | OpKind::Replace) {
            let end = self.end().min(text.len());
            if !text.is_char_boundary(end) {
                return Err(OtError::NotACharBoundary(end));
            }
        }
        Ok(())
    }
}

/// Apply `op` to `text`, returning the new content.
///
/// `retain` and any future unknown kind are defined as the identity.
pub fn apply(text: &str, op: &Op) -> String {
    match op.kind {
        OpKind::Insert => {
            let content = op.content.as_deref().unwrap_or("");
            let mut result = String::with_capacity(text.len() + content.len());
            result.push_str(&text[..op.position]);
            result.push_str(content);
            result.push_str(&text[op.position..]);
            result
        }
        OpKind::Delete => {
            let mut result = String::with_capacity(text.len());
            result.push_str(&text[..op.position]);
            result.push_str(&text[op.end().min(text.len())..]);
            result
        }
        OpKind::Replace => {
            let content = op.content.as_deref().unwrap_or("");
            let mut result = String::with_capacity(text.len() + content.len());
            result.push_str(&text[..op.position]);
            result.push_str(content);
            result.push_str(&text[op.end().min(text.len())..]);
            result
        }
        OpKind::Retain => text.to_string(),
    }
}

/// Rebase `a` past `b`, returning `(a', b')`.
///
/// `a_has_priority` breaks position ties (used for insert-insert and
/// overlapping replace-replace). Either side of the result may be
/// `None` if the transform absorbs it (made entirely redundant).
pub fn transform(a: &Op, b: &Op, a_has_priority: bool) -> (Option<Op>, Option<Op>) {
    if a.id == b.id {
        return (Some(a.clone()), None);
    }
    if a.kind == OpKind::Retain {
        return (Some(a.clone()), Some(b.clone()));
    }
    if b.kind == OpKind::Retain {
        return (Some(a.clone()), Some(b.clone()));
    }

    match (a.kind, b.kind) {
        (OpKind::Insert, OpKind::Insert) => transform_insert_insert(a, b, a_has_priority),
        (OpKind::Insert, OpKind::Delete) => {
            let (a2, b2) = transform_delete_insert(b, a, !a_has_priority);
            (b2, a2)
        }
        (OpKind::Insert, OpKind::Replace) => {
            let (a2, b2) = transform_replace_insert(b, a, !a_has_priority);
            (b2, a2)
        }
        (OpKind::Delete, OpKind::Insert) => transform_delete_insert(a, b, a_has_priority),
        (OpKind::Replace, OpKind::Insert) => transform_replace_insert(a, b, a_has_priority),
        (OpKind::Delete, OpKind::Delete) => transform_delete_delete(a, b),
        (OpKind::Delete, OpKind::Replace) => transform_delete_replace(a, b, a_has_priority),
        (OpKind::Replace, OpKind::Delete) => {
            let (b2, a2) = transform_delete_replace(b, a, !a_has_priority);
            (a2, b2)
        }
        (OpKind::Replace, OpKind::Replace) => transform_replace_replace(a, b, a_has_priority),
        _ => (Some(a.clone()), Some(b.clone())),
    }
}

fn shifted(op: &Op, delta: isize) -> Op {
    let mut op = op.clone();
    op.position = (op.position as isize + delta).max(0) as usize;
    op
}

fn absorb_if_empty(op: Op) -> Option<Op> {
    match op.kind {
        OpKind::Delete | OpKind::Replace if op.length == Some(0) => None,
        _ => Some(op),
    }
}

fn transform_insert_insert(a: &Op, b: &Op, a_has_priority: bool) -> (Option<Op>, Option<Op>) {
    let a_wins = a.position < b.position || (a.position == b.position && a_has_priority);
    if a_wins {
        (Some(a.clone()), Some(shifted(b, a.insert_len() as isize)))
    } else {
        (Some(shifted(a, b.insert_len() as isize)), Some(b.clone()))
    }
}

/// `a` is the delete, `b` is the insert. Returns `(a', b')`.
fn transform_delete_insert(a: &Op, b: &Op, _a_has_priority: bool) -> (Option<Op>, Option<Op>) {
    let (del_pos, del_len) = (a.position, a.span());
    let del_end = del_pos + del_len;

    // b.position <= a.position: insert happened before the delete, unaffected.
    // b.position >= a.position + len: insert happened after the deleted span, shifts left.
    // else: b falls inside the deleted range, clamp b to a.position.
    let b_out = if b.position <= del_pos {
        shifted(b, 0)
    } else if b.position >= del_end {
        shifted(b, -(del_len as isize))
    } else {
        let mut clamped = b.clone();
        clamped.position = del_pos;
        clamped
    };

    let a_out = if a.position >= b.position {
        shifted(a, b.insert_len() as isize)
    } else {
        a.clone()
    };

    (absorb_if_empty(a_out), Some(b_out))
}

/// `a` is the replace, `b` is the insert. Returns `(a', b')`.
fn transform_replace_insert(a: &Op, b: &Op, _a_has_priority: bool) -> (Option<Op>, Option<Op>) {
    let (rep_pos, rep_len) = (a.position, a.span());
    let rep_end = rep_pos + rep_len;
    let net_delta = a.insert_len() as isize - rep_len as isize;

    let b_out = if b.position <= rep_pos {
        shifted(b, 0)
    } else if b.position >= rep_end {
        shifted(b, net_delta)
    } else {
        let mut clamped = b.clone();
        clamped.position = rep_pos + a.insert_len();
        clamped
    };

    let a_out = if a.position >= b.position {
        shifted(a, b.insert_len() as isize)
    } else {
        a.clone()
    };

    (absorb_if_empty(a_out), Some(b_out))
}

fn transform_delete_delete(a: &Op, b: &Op) -> (Option<Op>, Option<Op>) {
    let (a_pos, a_len) = (a.position, a.span());
    let (b_pos, b_len) = (b.position, b.span());
    let a_end = a_pos + a_len;
    let b_end = b_pos + b_len;

    if a_end <= b_pos {
        // a entirely before b: a unchanged, b shifts left by a's span.
        return (Some(a.clone()), Some(shifted(b, -(a_len as isize))));
    }
    if b_end <= a_pos {
        return (Some(shifted(a, -(b_len as isize))), Some(b.clone()));
    }

    let overlap_start = a_pos.max(b_pos);
    let overlap_end = a_end.min(b_end);
    let overlap = overlap_end.saturating_sub(overlap_start);

    let mut a_out = a.clone();
    a_out.position = a_pos.min(b_pos);
    a_out.length = Some(a_len.saturating_sub(overlap));

    let mut b_out = b.clone();
    b_out.position = b_pos.min(a_pos);
    b_out.length = Some(b_len.saturating_sub(overlap));

    (absorb_if_empty(a_out), absorb_if_empty(b_out))
}

/// `a` is the delete, `b` is the replace. Returns `(a', b')`.
fn transform_delete_replace(a: &Op, b: &Op, a_has_priority: bool) -> (Option<Op>, Option<Op>) {
    let (a_pos, a_len) = (a.position, a.span());
    let (b_pos, b_len) = (b.position, b.span());
    let a_end = a_pos + a_len;
    let b_end = b_pos + b_len;

    if a_end <= b_pos {
        let delta = a.insert_len() as isize - a_len as isize; // insert_len is 0 for delete
        return (Some(a.clone()), Some(shifted(b, delta)));
    }
    if b_end <= a_pos {
        let delta = b.insert_len() as isize - b_len as isize;
        return (Some(shifted(a, delta)), Some(b.clone()));
    }

    // Overlapping: priority side survives unchanged, the other is absorbed,
    // mirroring replace-replace's overlap rule (a delete and an overlapping
    // replace cannot both commit without re-deriving the overlap span).
    if a_has_priority {
        (Some(a.clone()), None)
    } else {
        (None, Some(b.clone()))
    }
}

fn transform_replace_replace(a: &Op, b: &Op, a_has_priority: bool) -> (Option<Op>, Option<Op>) {
    let (a_pos, a_len) = (a.position, a.span());
    let (b_pos, b_len) = (b.position, b.span());
    let a_end = a_pos + a_len;
    let b_end = b_pos + b_len;

    if a_end <= b_pos {
        let a_delta = a.insert_len() as isize - a_len as isize;
        return (Some(a.clone()), Some(shifted(b, a_delta)));
    }
    if b_end <= a_pos {
        let b_delta = b.insert_len() as isize - b_len as isize;
        return (Some(shifted(a, b_delta)), Some(b.clone()));
    }

    if a_has_priority {
        (Some(a.clone()), None)
    } else {
        (None, Some(b.clone()))
    }
}

/// Transform `op` against an ordered sequence, skipping operations that are
/// not strictly earlier by `(timestamp, userId)`.
///
/// Returns `None` if `op` is absorbed by any earlier operation in the
/// sequence.
pub fn transform_against_sequence(op: &Op, sequence: &[Op]) -> Option<Op> {
    let mut current = op.clone();
    for other in sequence {
        if other.id == current.id {
            return None;
        }
        let earlier = (other.timestamp, &other.user_id) < (current.timestamp, &current.user_id);
        if !earlier {
            continue;
        }
        match transform(&current, other, false) {
            (Some(transformed), _) => current = transformed,
            (None, _) => return None,
        }
    }
    Some(current)
}

/// Sort then fold same-user contiguous ops: consecutive inserts that abut
/// concatenate; consecutive same-position deletes (a backspace run) sum
/// their lengths. Replace is never merged. Returns a (possibly
/// length-1) sequence in `(position, timestamp)` order.
pub fn merge(ops: &[Op]) -> Vec<Op> {
    let mut sorted = ops.to_vec();
    sorted.sort_by(|a, b| (a.position, a.timestamp).cmp(&(b.position, b.timestamp)));

    let mut merged: Vec<Op> = Vec::with_capacity(sorted.len());
    for op in sorted {
        if let Some(last) = merged.last_mut() {
            if last.user_id == op.user_id {
                if let Some(combined) = try_merge_pair(last, &op) {
                    *last = combined;
                    continue;
                }
            }
        }
        merged.push(op);
    }
    merged
}

fn try_merge_pair(first: &Op, second: &Op) -> Option<Op> {
    match (first.kind, second.kind) {
        (OpKind::Insert, OpKind::Insert) => {
            if first.position + first.insert_len() == second.position {
                let mut combined = second.clone();
                combined.position = first.position;
                let mut content = first.content.clone().unwrap_or_default();
                content.push_str(second.content.as_deref().unwrap_or(""));
                combined.content = Some(content);
                combined.id = second.id.clone();
                Some(combined)
            } else {
                None
            }
        }
        (OpKind::Delete, OpKind::Delete) => {
            if first.position == second.position {
                let mut combined = second.clone();
                combined.length = Some(first.span() + second.span());
                combined.id = second.id.clone();
                Some(combined)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn op(kind: OpKind, position: usize, content: Option<&str>, length: Option<usize>, user: &str, ts: i64) -> Op {
        Op {
            kind,
            position,
            content: content.map(String::from),
            length,
            user_id: user.to_string(),
            client_id: format!("{user}-client"),
            timestamp: ts,
            id: format!("{user}-{ts}-{position}"),
            version: None,
            applied: false,
        }
    }

    fn insert(position: usize, content: &str, user: &str, ts: i64) -> Op {
        op(OpKind::Insert, position, Some(content), None, user, ts)
    }

    fn delete(position: usize, length: usize, user: &str, ts: i64) -> Op {
        op(OpKind::Delete, position, None, Some(length), user, ts)
    }

    #[test]
    fn identity_with_retain() {
        let a = insert(2, "x", "u1", 1);
        let retain = op(OpKind::Retain, 0, None, None, "u2", 1);
        let (a2, r2) = transform(&a, &retain, true);
        assert_eq!(a2.unwrap(), a);
        assert_eq!(r2.unwrap().kind, OpKind::Retain);
    }

    #[test]
    fn idempotent_on_equal_id() {
        let mut a = insert(2, "x", "u1", 1);
        a.id = "shared".to_string();
        let mut b = insert(5, "y", "u2", 2);
        b.id = "shared".to_string();
        let (a2, b2) = transform(&a, &b, true);
        assert_eq!(a2.unwrap(), a);
        assert!(b2.is_none());
    }

    #[test]
    fn insert_insert_priority_breaks_tie() {
        let a = insert(5, "X", "u1", 100);
        let b = insert(5, "Y", "u2", 101);
        let (a2, b2) = transform(&a, &b, true);
        assert_eq!(a2.unwrap().position, 5);
        assert_eq!(b2.unwrap().position, 6);
    }

    #[test]
    fn scenario_a_concurrent_inserts_same_position() {
        // HELLO, U1 inserts X @5 ts100, U2 inserts Y @5 ts101.
        let u1 = insert(5, "X", "u1", 100);
        let u2 = insert(5, "Y", "u2", 101);
        // U1 sorts first (earlier ts): U2 transforms against U1 (U1 has priority as earlier op).
        let u2_prime = transform_against_sequence(&u2, std::slice::from_ref(&u1)).unwrap();
        let text = apply("HELLO", &u1);
        let text = apply(&text, &u2_prime);
        assert_eq!(text, "HELLOXY");
    }

    #[test]
    fn scenario_b_insert_inside_delete_range() {
        // ABCDEFGH, U1 delete(2,4) ts200 removes CDEF, U2 insert(4,"*") ts201.
        let u1 = delete(2, 4, "u1", 200);
        let u2 = insert(4, "*", "u2", 201);
        let u2_prime = transform_against_sequence(&u2, std::slice::from_ref(&u1)).unwrap();
        let text = apply("ABCDEFGH", &u1);
        let text = apply(&text, &u2_prime);
        assert_eq!(text, "AB*GH");
    }

    #[test]
    fn scenario_c_overlapping_deletes() {
        // 0123456789, U1 delete(2,4) removes 2345, U2 delete(4,4) removes 4567. Overlap=2.
        let u1 = delete(2, 4, "u1", 300);
        let u2 = delete(4, 4, "u2", 301);
        let (u1p, u2p) = transform(&u1, &u2, true);
        let u1p = u1p.unwrap();
        let u2p = u2p.unwrap();
        assert_eq!(u1p.length, Some(2));
        assert_eq!(u2p.length, Some(2));
        let text = apply("0123456789", &u1);
        let text = apply(&text, &u2p);
        assert_eq!(text, "0189");
    }

    #[test]
    fn tp1_convergence_random_sample() {
        let starting = "The quick brown fox";
        let a = insert(4, "very ", "u1", 10);
        let b = delete(10, 5, "u2", 11);
        let (ap, bp) = transform(&a, &b, true);
        let ap = ap.unwrap();
        let bp = bp.unwrap();
        let via_a_first = apply(&apply(starting, &a), &bp);
        let via_b_first = apply(&apply(starting, &b), &ap);
        assert_eq!(via_a_first, via_b_first);
    }

    #[test]
    fn apply_preserves_length_relation() {
        let text = "hello world";
        let i = insert(5, ",", "u1", 1);
        assert_eq!(apply(text, &i).len(), text.len() + 1);
        let d = delete(0, 6, "u1", 2);
        assert_eq!(apply(text, &d).len(), text.len() - 6);
    }

    #[test]
    fn merge_inserts_that_abut() {
        let a = insert(0, "a", "u1", 1);
        let b = insert(1, "b", "u1", 2);
        let c = insert(2, "c", "u1", 3);
        let merged = merge(&[a, b, c]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content.as_deref(), Some("abc"));
    }

    #[test]
    fn merge_respects_different_users() {
        let a = insert(0, "a", "u1", 1);
        let b = insert(1, "b", "u2", 2);
        let merged = merge(&[a, b]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_deletes_same_position_backspace_run() {
        let a = delete(5, 1, "u1", 1);
        let b = delete(5, 1, "u1", 2);
        let merged = merge(&[a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].length, Some(2));
    }

    #[test]
    fn validate_rejects_empty_insert() {
        let mut i = insert(0, "", "u1", 1);
        i.content = Some(String::new());
        assert_eq!(i.validate(10), Err(OtError::EmptyInsertContent));
    }

    #[test]
    fn validate_rejects_out_of_bounds() {
        let d = delete(8, 5, "u1", 1);
        assert!(matches!(d.validate(10), Err(OtError::OutOfBounds { .. })));
    }

    #[test]
    fn validate_rejects_retain() {
        let r = op(OpKind::Retain, 0, None, None, "u1", 1);
        assert_eq!(r.validate(10), Err(OtError::RetainNotAdmissible));
    }

    #[test]
    fn duplicate_id_is_absorbed_even_when_not_strictly_earlier() {
        let original = insert(5, "X", "u1", 100);
        let mut resubmitted = original.clone();
        resubmitted.timestamp = original.timestamp;
        assert_eq!(transform_against_sequence(&resubmitted, std::slice::from_ref(&original)), None);
    }

    #[test]
    fn char_boundary_rejected() {
        let text = "héllo"; // 'é' is 2 bytes, so byte offset 2 is mid-character
        let i = insert(2, "x", "u1", 1);
        assert_eq!(i.check_char_boundaries(text), Err(OtError::NotACharBoundary(2)));
    }
}
