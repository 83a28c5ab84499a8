//! Text operations and the inclusion transformation.
//!
//! An [`Operation`] describes an edit to a plain-text document. Positions and
//! lengths count `char`s (Unicode scalar values), never bytes, so that every
//! replica agrees on offsets regardless of encoding.
//!
//! ```text
//!        S ──── a ────► S·a
//!        │               │
//!        b               b'      transform(a, b) = (a', b')
//!        ▼               ▼
//!       S·b ─── a' ──► S·a·b' == S·b·a'
//! ```
//!
//! Reference: Ellis & Gibbs: Concurrency Control in Groupware Systems (1989)

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised when an operation does not fit the document it is applied to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("position {position} is beyond the end of the document ({len} chars)")]
    OutOfBounds { position: usize, len: usize },
    #[error("deleted text mismatch at {position}: expected {expected:?}, found {found:?}")]
    TextMismatch {
        position: usize,
        expected: String,
        found: String,
    },
}

/// Placement of an insert relative to a concurrent insert at the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tie {
    /// Our text ends up before theirs.
    Before,
    /// Our text ends up after theirs.
    After,
}

/// An immutable text edit.
///
/// Equality is structural. Constructors normalise empty edits to
/// [`Operation::NoOp`], so `Operation::insert(3, "")` equals `NoOp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    NoOp,
    Insert { position: usize, text: String },
    /// Carries the deleted text so that the deletion can be verified and
    /// split when a concurrent insert lands inside it.
    Delete { position: usize, text: String },
    /// Two edits applied atomically: `second` is relative to the document
    /// after `first`.
    Split(Box<Operation>, Box<Operation>),
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            Operation::NoOp
        } else {
            Operation::Insert { position, text }
        }
    }

    pub fn delete(position: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            Operation::NoOp
        } else {
            Operation::Delete { position, text }
        }
    }

    /// Sequence two operations, dropping no-op halves.
    pub fn split(first: Operation, second: Operation) -> Self {
        match (first, second) {
            (Operation::NoOp, second) => second,
            (first, Operation::NoOp) => first,
            (first, second) => Operation::Split(Box::new(first), Box::new(second)),
        }
    }

    /// Replace `old` at `position` with `new`: a delete followed by an insert.
    pub fn replace(position: usize, old: impl Into<String>, new: impl Into<String>) -> Self {
        Operation::split(
            Operation::delete(position, old),
            Operation::insert(position, new),
        )
    }

    pub fn is_noop(&self) -> bool {
        match self {
            Operation::NoOp => true,
            Operation::Insert { text, .. } | Operation::Delete { text, .. } => text.is_empty(),
            Operation::Split(first, second) => first.is_noop() && second.is_noop(),
        }
    }

    /// Net change in document length, in chars.
    pub fn len_change(&self) -> isize {
        match self {
            Operation::NoOp => 0,
            Operation::Insert { text, .. } => char_len(text) as isize,
            Operation::Delete { text, .. } => -(char_len(text) as isize),
            Operation::Split(first, second) => first.len_change() + second.len_change(),
        }
    }

    /// Flatten into editor-level edits, merging a delete immediately followed
    /// by an insert at the same position into a single replacement.
    pub fn text_edits(&self) -> Vec<TextEdit> {
        let mut edits: Vec<TextEdit> = Vec::new();
        self.collect_edits(&mut edits);
        edits
    }

    fn collect_edits(&self, edits: &mut Vec<TextEdit>) {
        match self {
            Operation::NoOp => {}
            Operation::Insert { position, text } => {
                if let Some(last) = edits.last_mut() {
                    if last.position == *position && last.text.is_empty() && !last.replaced_text.is_empty() {
                        last.text.push_str(text);
                        return;
                    }
                }
                edits.push(TextEdit::new(*position, "", text.clone()));
            }
            Operation::Delete { position, text } => {
                edits.push(TextEdit::new(*position, text.clone(), ""));
            }
            Operation::Split(first, second) => {
                first.collect_edits(edits);
                second.collect_edits(edits);
            }
        }
    }

    /// Apply to `doc`, returning the edited text.
    ///
    /// Fails without touching anything if a position is out of range or a
    /// deletion's recorded text differs from the document.
    pub fn apply(&self, doc: &str) -> Result<String, OperationError> {
        let mut out = doc.to_owned();
        self.apply_in_place(&mut out)?;
        Ok(out)
    }

    fn apply_in_place(&self, doc: &mut String) -> Result<(), OperationError> {
        match self {
            Operation::NoOp => Ok(()),
            Operation::Insert { position, text } => {
                let at = byte_offset(doc, *position).ok_or_else(|| OperationError::OutOfBounds {
                    position: *position,
                    len: char_len(doc),
                })?;
                doc.insert_str(at, text);
                Ok(())
            }
            Operation::Delete { position, text } => {
                let start = byte_offset(doc, *position).ok_or_else(|| OperationError::OutOfBounds {
                    position: *position,
                    len: char_len(doc),
                })?;
                let end_chars = position + char_len(text);
                let end = byte_offset(doc, end_chars).ok_or_else(|| OperationError::OutOfBounds {
                    position: end_chars,
                    len: char_len(doc),
                })?;
                if &doc[start..end] != text.as_str() {
                    return Err(OperationError::TextMismatch {
                        position: *position,
                        expected: text.clone(),
                        found: doc[start..end].to_owned(),
                    });
                }
                doc.replace_range(start..end, "");
                Ok(())
            }
            Operation::Split(first, second) => {
                first.apply_in_place(doc)?;
                second.apply_in_place(doc)
            }
        }
    }

    /// Inclusion transformation of two concurrent operations.
    ///
    /// Returns `(self', other')` where `self'` applies after `other` and
    /// `other'` applies after `self`; both orders produce the same text.
    /// `tie` places `self`'s text when both insert at the same position.
    pub fn transform(&self, other: &Operation, tie: Tie) -> (Operation, Operation) {
        match (self, other) {
            (Operation::NoOp, _) => (Operation::NoOp, other.clone()),
            (_, Operation::NoOp) => (self.clone(), Operation::NoOp),

            (Operation::Split(first, second), _) => {
                let (first, other) = first.transform(other, tie);
                let (second, other) = second.transform(&other, tie);
                (Operation::split(first, second), other)
            }
            (_, Operation::Split(first, second)) => {
                let (this, first) = self.transform(first, tie);
                let (this, second) = this.transform(second, tie);
                (this, Operation::split(first, second))
            }

            (
                Operation::Insert { position: a, text: a_text },
                Operation::Insert { position: b, text: b_text },
            ) => {
                if a < b || (a == b && tie == Tie::Before) {
                    (
                        self.clone(),
                        Operation::insert(b + char_len(a_text), b_text.clone()),
                    )
                } else {
                    (
                        Operation::insert(a + char_len(b_text), a_text.clone()),
                        other.clone(),
                    )
                }
            }

            (
                Operation::Insert { position, text },
                Operation::Delete { position: del_position, text: del_text },
            ) => transform_insert_delete(*position, text, *del_position, del_text),

            (
                Operation::Delete { position: del_position, text: del_text },
                Operation::Insert { position, text },
            ) => {
                let (insert, delete) =
                    transform_insert_delete(*position, text, *del_position, del_text);
                (delete, insert)
            }

            (
                Operation::Delete { position: a, text: a_text },
                Operation::Delete { position: b, text: b_text },
            ) => (
                subtract_delete(*a, a_text, *b, char_len(b_text)),
                subtract_delete(*b, b_text, *a, char_len(a_text)),
            ),
        }
    }
}

/// Insert against a concurrent delete. Returns `(insert', delete')`.
fn transform_insert_delete(
    position: usize,
    text: &str,
    del_position: usize,
    del_text: &str,
) -> (Operation, Operation) {
    let ins_len = char_len(text);
    let del_len = char_len(del_text);
    let del_end = del_position + del_len;

    if position <= del_position {
        (
            Operation::insert(position, text),
            Operation::delete(del_position + ins_len, del_text),
        )
    } else if position >= del_end {
        (
            Operation::insert(position - del_len, text),
            Operation::delete(del_position, del_text),
        )
    } else {
        // Insert lands inside the deleted range: it survives at the start of
        // the deletion and the deletion is cut around it.
        let (head, tail) = split_at_char(del_text, position - del_position);
        (
            Operation::insert(del_position, text),
            Operation::split(
                Operation::delete(del_position, head),
                Operation::delete(del_position + ins_len, tail),
            ),
        )
    }
}

/// What is left of delete `a` once the range `[b, b + b_len)` is already gone.
fn subtract_delete(a: usize, a_text: &str, b: usize, b_len: usize) -> Operation {
    let a_len = char_len(a_text);
    let a_end = a + a_len;
    let b_end = b + b_len;

    let before_end = a_end.min(b).max(a);
    let after_start = a.max(b_end).min(a_end);

    let (head, _) = split_at_char(a_text, before_end - a);
    let (_, tail) = split_at_char(a_text, after_start - a);

    let position = if a <= b {
        a
    } else if a >= b_end {
        a - b_len
    } else {
        b
    };

    let mut kept = String::with_capacity(head.len() + tail.len());
    kept.push_str(head);
    kept.push_str(tail);
    Operation::delete(position, kept)
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::NoOp => write!(f, "NoOp"),
            Operation::Insert { position, text } => write!(f, "Insert({position},{text:?})"),
            Operation::Delete { position, text } => write!(f, "Delete({position},{text:?})"),
            Operation::Split(first, second) => write!(f, "Split({first}, {second})"),
        }
    }
}

/// An edit as reported by a local editor: `replaced_text` at `position` was
/// replaced with `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub position: usize,
    pub replaced_text: String,
    pub text: String,
}

impl TextEdit {
    pub fn new(position: usize, replaced_text: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            position,
            replaced_text: replaced_text.into(),
            text: text.into(),
        }
    }

    pub fn to_operation(&self) -> Operation {
        Operation::replace(self.position, self.replaced_text.clone(), self.text.clone())
    }
}

impl From<TextEdit> for Operation {
    fn from(edit: TextEdit) -> Self {
        Operation::replace(edit.position, edit.replaced_text, edit.text)
    }
}

/// Length in chars.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of char index `chars`, `None` past the end.
fn byte_offset(s: &str, chars: usize) -> Option<usize> {
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(chars)
}

fn split_at_char(s: &str, chars: usize) -> (&str, &str) {
    let at = byte_offset(s, chars).unwrap_or(s.len());
    s.split_at(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn converge(doc: &str, a: &Operation, b: &Operation, tie: Tie) -> (String, String) {
        let (a2, b2) = a.transform(b, tie);
        let left = b2.apply(&a.apply(doc).unwrap()).unwrap();
        let right = a2.apply(&b.apply(doc).unwrap()).unwrap();
        (left, right)
    }

    #[test]
    fn test_constructors_normalise_empty() {
        assert_eq!(Operation::insert(3, ""), Operation::NoOp);
        assert_eq!(Operation::delete(0, ""), Operation::NoOp);
        assert_eq!(Operation::replace(2, "", "x"), Operation::insert(2, "x"));
        assert_eq!(Operation::replace(2, "y", ""), Operation::delete(2, "y"));
        assert!(Operation::split(Operation::NoOp, Operation::NoOp).is_noop());
    }

    #[test]
    fn test_apply_insert_delete() {
        assert_eq!(Operation::insert(1, "X").apply("ab").unwrap(), "aXb");
        assert_eq!(Operation::delete(0, "a").apply("ab").unwrap(), "b");
        assert_eq!(Operation::replace(0, "ab", "cd").apply("ab").unwrap(), "cd");
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let doc = "héllo";
        assert_eq!(Operation::insert(2, "✓").apply(doc).unwrap(), "hé✓llo");
        assert_eq!(Operation::delete(1, "é").apply(doc).unwrap(), "hllo");
    }

    #[test]
    fn test_apply_out_of_bounds() {
        let err = Operation::insert(5, "x").apply("abc").unwrap_err();
        assert_eq!(err, OperationError::OutOfBounds { position: 5, len: 3 });

        let err = Operation::delete(2, "cd").apply("abc").unwrap_err();
        assert_eq!(err, OperationError::OutOfBounds { position: 4, len: 3 });
    }

    #[test]
    fn test_apply_text_mismatch() {
        let err = Operation::delete(0, "x").apply("abc").unwrap_err();
        assert!(matches!(err, OperationError::TextMismatch { position: 0, .. }));
    }

    #[test]
    fn test_split_apply_is_atomic() {
        let op = Operation::split(Operation::insert(0, "x"), Operation::delete(9, "z"));
        assert!(op.apply("abc").is_err());
    }

    #[test]
    fn test_insert_insert_tie() {
        let a = Operation::insert(1, "A");
        let b = Operation::insert(1, "B");

        let (l, r) = converge("xy", &a, &b, Tie::Before);
        assert_eq!(l, "xABy");
        assert_eq!(l, r);

        let (l, r) = converge("xy", &a, &b, Tie::After);
        assert_eq!(l, "xBAy");
        assert_eq!(l, r);
    }

    #[test]
    fn test_insert_before_delete() {
        let a = Operation::insert(1, "X");
        let b = Operation::delete(2, "cd");
        let (a2, b2) = a.transform(&b, Tie::Before);
        assert_eq!(a2, a);
        assert_eq!(b2, Operation::delete(3, "cd"));
    }

    #[test]
    fn test_insert_after_delete() {
        let a = Operation::insert(4, "X");
        let b = Operation::delete(0, "ab");
        let (a2, b2) = a.transform(&b, Tie::Before);
        assert_eq!(a2, Operation::insert(2, "X"));
        assert_eq!(b2, b);
    }

    #[test]
    fn test_insert_inside_delete_survives() {
        let doc = "abcdef";
        let a = Operation::insert(3, "XY");
        let b = Operation::delete(1, "bcde");
        let (a2, b2) = a.transform(&b, Tie::Before);

        assert_eq!(a2, Operation::insert(1, "XY"));
        assert_eq!(
            b2,
            Operation::split(Operation::delete(1, "bc"), Operation::delete(3, "de"))
        );

        let (l, r) = converge(doc, &a, &b, Tie::Before);
        assert_eq!(l, "aXYf");
        assert_eq!(r, "aXYf");
    }

    #[test]
    fn test_delete_delete_overlap_deleted_once() {
        let doc = "abcdefg";
        let a = Operation::delete(1, "bcd");
        let b = Operation::delete(2, "cdef");
        let (a2, b2) = a.transform(&b, Tie::Before);
        assert_eq!(a2, Operation::delete(1, "b"));
        assert_eq!(b2, Operation::delete(1, "ef"));

        let (l, r) = converge(doc, &a, &b, Tie::Before);
        assert_eq!(l, "ag");
        assert_eq!(r, "ag");
    }

    #[test]
    fn test_delete_delete_identical() {
        let a = Operation::delete(1, "bc");
        let (a2, b2) = a.transform(&a, Tie::Before);
        assert_eq!(a2, Operation::NoOp);
        assert_eq!(b2, Operation::NoOp);
    }

    #[test]
    fn test_delete_contains_delete() {
        let a = Operation::delete(0, "abcde");
        let b = Operation::delete(1, "bc");
        let (a2, b2) = a.transform(&b, Tie::Before);
        assert_eq!(a2, Operation::delete(0, "ade"));
        assert_eq!(b2, Operation::NoOp);
    }

    #[test]
    fn test_split_against_insert() {
        let doc = "hello world";
        let a = Operation::replace(0, "hello", "howdy");
        let b = Operation::insert(11, "!");
        let (l, r) = converge(doc, &a, &b, Tie::Before);
        assert_eq!(l, "howdy world!");
        assert_eq!(l, r);
    }

    #[test]
    fn test_noop_transform() {
        let a = Operation::insert(0, "x");
        assert_eq!(a.transform(&Operation::NoOp, Tie::Before), (a.clone(), Operation::NoOp));
        assert_eq!(Operation::NoOp.transform(&a, Tie::Before), (Operation::NoOp, a.clone()));
    }

    #[test]
    fn test_text_edits_merge_replace() {
        let op = Operation::replace(4, "old", "new");
        assert_eq!(op.text_edits(), vec![TextEdit::new(4, "old", "new")]);

        let op = Operation::split(Operation::insert(0, "a"), Operation::delete(5, "b"));
        assert_eq!(
            op.text_edits(),
            vec![TextEdit::new(0, "", "a"), TextEdit::new(5, "b", "")]
        );
    }

    #[test]
    fn test_text_edit_to_operation() {
        let edit = TextEdit::new(2, "cd", "XYZ");
        assert_eq!(edit.to_operation().apply("abcdef").unwrap(), "abXYZef");
        assert_eq!(edit.to_operation().len_change(), 1);
        assert_eq!(Operation::from(edit.clone()), edit.to_operation());
    }

    #[test]
    fn test_display() {
        let op = Operation::replace(1, "a", "b");
        assert_eq!(op.to_string(), "Split(Delete(1,\"a\"), Insert(1,\"b\"))");
    }

    /// Builds an operation valid on `doc` from raw proptest inputs.
    fn make_op(doc: &str, kind: u8, pos: usize, span: usize, text: &str) -> Operation {
        let len = char_len(doc);
        let pos = pos % (len + 1);
        let span = span.min(len - pos);
        let (_, rest) = split_at_char(doc, pos);
        let (removed, _) = split_at_char(rest, span);
        match kind % 3 {
            0 => Operation::insert(pos, text),
            1 => Operation::delete(pos, removed),
            _ => Operation::replace(pos, removed, text),
        }
    }

    proptest! {
        /// Convergence: S·a·b' == S·b·a' for any tie resolution.
        #[test]
        fn prop_transform_converges(
            doc in "[a-dé]{0,12}",
            ka in 0u8..3, pa in 0usize..16, sa in 0usize..6, ta in "[XYZ]{0,3}",
            kb in 0u8..3, pb in 0usize..16, sb in 0usize..6, tb in "[uvw]{0,3}",
            before in any::<bool>(),
        ) {
            let a = make_op(&doc, ka, pa, sa, &ta);
            let b = make_op(&doc, kb, pb, sb, &tb);
            let tie = if before { Tie::Before } else { Tie::After };

            let (a2, b2) = a.transform(&b, tie);
            let left = b2.apply(&a.apply(&doc).unwrap());
            let right = a2.apply(&b.apply(&doc).unwrap());
            prop_assert!(left.is_ok(), "b' does not fit S·a: {:?}", left);
            prop_assert!(right.is_ok(), "a' does not fit S·b: {:?}", right);
            prop_assert_eq!(left.unwrap(), right.unwrap());
        }

        /// Transforming in the opposite direction with the opposite tie
        /// lands on the same text.
        #[test]
        fn prop_transform_symmetric(
            doc in "[a-d]{0,10}",
            ka in 0u8..3, pa in 0usize..12, sa in 0usize..5, ta in "[XY]{0,2}",
            kb in 0u8..3, pb in 0usize..12, sb in 0usize..5, tb in "[uv]{0,2}",
        ) {
            let a = make_op(&doc, ka, pa, sa, &ta);
            let b = make_op(&doc, kb, pb, sb, &tb);
            let after_a = a.apply(&doc).unwrap();
            let after_b = b.apply(&doc).unwrap();

            let (a2, b2) = a.transform(&b, Tie::Before);
            let (b3, a3) = b.transform(&a, Tie::After);
            prop_assert_eq!(b2.apply(&after_a).unwrap(), b3.apply(&after_a).unwrap());
            prop_assert_eq!(a2.apply(&after_b).unwrap(), a3.apply(&after_b).unwrap());
        }
    }
}
