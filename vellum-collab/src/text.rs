//! Plain-text document implementing the [`SyncDoc`] contract.
//!
//! Positions are character offsets, not byte offsets, so multibyte content
//! behaves. Deletes carry the removed text, which makes inversion closed-form
//! and lets `apply` detect a stale delete (the range no longer holds what the
//! step claims) instead of silently removing the wrong characters.

use serde::{Deserialize, Serialize};

use crate::doc::{ApplyError, PersistError, Step, SyncDoc};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDoc {
    text: String,
}

impl TextDoc {
    pub fn new(text: impl Into<String>) -> Self {
        TextDoc { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextStep {
    Insert { at: usize, text: String },
    Delete { from: usize, to: usize, removed: String },
}

impl TextStep {
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        TextStep::Insert {
            at,
            text: text.into(),
        }
    }

    /// Build a delete of `[from, to)` against `doc`, capturing the removed
    /// text from the document itself.
    pub fn delete(doc: &TextDoc, from: usize, to: usize) -> Result<Self, ApplyError> {
        let (start, end) = byte_range(doc.text(), from, to)?;
        Ok(TextStep::Delete {
            from,
            to,
            removed: doc.text()[start..end].to_string(),
        })
    }
}

/// Byte offset of character position `at`, accepting the one-past-the-end
/// position.
fn byte_offset(text: &str, at: usize) -> Option<usize> {
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == at {
            return Some(idx);
        }
        count += 1;
    }
    (count == at).then_some(text.len())
}

fn byte_range(text: &str, from: usize, to: usize) -> Result<(usize, usize), ApplyError> {
    if from > to {
        return Err(ApplyError::new(format!("inverted range {from}..{to}")));
    }
    let start = byte_offset(text, from)
        .ok_or_else(|| ApplyError::new(format!("position {from} out of bounds")))?;
    let end = byte_offset(text, to)
        .ok_or_else(|| ApplyError::new(format!("position {to} out of bounds")))?;
    Ok((start, end))
}

impl Step<TextDoc> for TextStep {
    fn invert(&self, _before: &TextDoc) -> Self {
        match self {
            TextStep::Insert { at, text } => TextStep::Delete {
                from: *at,
                to: at + text.chars().count(),
                removed: text.clone(),
            },
            TextStep::Delete { from, removed, .. } => TextStep::Insert {
                at: *from,
                text: removed.clone(),
            },
        }
    }

    fn merge(&self, next: &Self) -> Option<Self> {
        match (self, next) {
            // Typing forward: the second insert starts where the first ends.
            (TextStep::Insert { at, text }, TextStep::Insert { at: next_at, text: next_text })
                if *next_at == at + text.chars().count() =>
            {
                Some(TextStep::Insert {
                    at: *at,
                    text: format!("{text}{next_text}"),
                })
            }
            // Repeated delete-forward at the same position.
            (
                TextStep::Delete { from, to, removed },
                TextStep::Delete {
                    from: next_from,
                    to: next_to,
                    removed: next_removed,
                },
            ) if next_from == from => Some(TextStep::Delete {
                from: *from,
                to: to + (next_to - next_from),
                removed: format!("{removed}{next_removed}"),
            }),
            // Backspacing: the second delete ends where the first began.
            (
                TextStep::Delete { from, to, removed },
                TextStep::Delete {
                    from: next_from,
                    to: next_to,
                    removed: next_removed,
                },
            ) if *next_to == *from => Some(TextStep::Delete {
                from: *next_from,
                to: *to,
                removed: format!("{next_removed}{removed}"),
            }),
            _ => None,
        }
    }
}

impl SyncDoc for TextDoc {
    type Step = TextStep;

    fn apply(&self, step: &TextStep) -> Result<Self, ApplyError> {
        match step {
            TextStep::Insert { at, text } => {
                let idx = byte_offset(&self.text, *at)
                    .ok_or_else(|| ApplyError::new(format!("position {at} out of bounds")))?;
                let mut next = self.text.clone();
                next.insert_str(idx, text);
                Ok(TextDoc { text: next })
            }
            TextStep::Delete { from, to, removed } => {
                let (start, end) = byte_range(&self.text, *from, *to)?;
                if &self.text[start..end] != removed {
                    return Err(ApplyError::new(format!(
                        "range {from}..{to} no longer holds the deleted text"
                    )));
                }
                let mut next = self.text.clone();
                next.replace_range(start..end, "");
                Ok(TextDoc { text: next })
            }
        }
    }

    fn size(&self) -> usize {
        self.char_len()
    }

    fn to_persistable(&self) -> Vec<u8> {
        self.text.clone().into_bytes()
    }

    fn from_persistable(bytes: &[u8]) -> Result<Self, PersistError> {
        String::from_utf8(bytes.to_vec())
            .map(TextDoc::new)
            .map_err(|e| PersistError::new(e.to_string()))
    }

    fn initial() -> Self {
        TextDoc::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_delete() {
        let doc = TextDoc::new("hello world");
        let doc = doc.apply(&TextStep::insert(5, ",")).unwrap();
        assert_eq!(doc.text(), "hello, world");

        let delete = TextStep::delete(&doc, 0, 7).unwrap();
        let doc = doc.apply(&delete).unwrap();
        assert_eq!(doc.text(), "world");
    }

    #[test]
    fn test_insert_out_of_bounds_rejected() {
        let doc = TextDoc::new("ab");
        assert!(doc.apply(&TextStep::insert(3, "x")).is_err());
        assert!(doc.apply(&TextStep::insert(2, "x")).is_ok());
    }

    #[test]
    fn test_stale_delete_rejected() {
        let doc = TextDoc::new("abcdef");
        let step = TextStep::Delete {
            from: 0,
            to: 3,
            removed: "xyz".to_string(),
        };
        let err = doc.apply(&step).unwrap_err();
        assert!(err.to_string().contains("no longer holds"));
    }

    #[test]
    fn test_invert_insert_restores() {
        let before = TextDoc::new("ac");
        let step = TextStep::insert(1, "b");
        let after = before.apply(&step).unwrap();
        assert_eq!(after.text(), "abc");
        let restored = after.apply(&step.invert(&before)).unwrap();
        assert_eq!(restored, before);
    }

    #[test]
    fn test_invert_delete_restores() {
        let before = TextDoc::new("abcdef");
        let step = TextStep::delete(&before, 2, 4).unwrap();
        let after = before.apply(&step).unwrap();
        assert_eq!(after.text(), "abef");
        let restored = after.apply(&step.invert(&before)).unwrap();
        assert_eq!(restored, before);
    }

    #[test]
    fn test_merge_adjacent_inserts() {
        let first = TextStep::insert(3, "ab");
        let second = TextStep::insert(5, "cd");
        let merged = first.merge(&second).unwrap();
        assert_eq!(merged, TextStep::insert(3, "abcd"));

        let doc = TextDoc::new("xyz");
        let via_pair = doc.apply(&first).unwrap().apply(&second).unwrap();
        let via_merged = doc.apply(&merged).unwrap();
        assert_eq!(via_pair, via_merged);
    }

    #[test]
    fn test_non_adjacent_inserts_do_not_merge() {
        let first = TextStep::insert(0, "a");
        let second = TextStep::insert(5, "b");
        assert!(first.merge(&second).is_none());
    }

    #[test]
    fn test_merge_backspace_deletes() {
        let doc = TextDoc::new("abcd");
        // Delete "c", then backspace "b".
        let first = TextStep::delete(&doc, 2, 3).unwrap();
        let after_first = doc.apply(&first).unwrap();
        let second = TextStep::delete(&after_first, 1, 2).unwrap();

        let merged = first.merge(&second).unwrap();
        let via_pair = after_first.apply(&second).unwrap();
        let via_merged = doc.apply(&merged).unwrap();
        assert_eq!(via_pair, via_merged);
        assert_eq!(via_merged.text(), "ad");
    }

    #[test]
    fn test_merge_forward_deletes() {
        let doc = TextDoc::new("abcd");
        let first = TextStep::delete(&doc, 1, 2).unwrap();
        let after_first = doc.apply(&first).unwrap();
        let second = TextStep::delete(&after_first, 1, 2).unwrap();

        let merged = first.merge(&second).unwrap();
        let via_merged = doc.apply(&merged).unwrap();
        assert_eq!(via_merged.text(), "ad");
    }

    #[test]
    fn test_multibyte_positions() {
        let doc = TextDoc::new("héllo");
        let doc = doc.apply(&TextStep::insert(2, "ü")).unwrap();
        assert_eq!(doc.text(), "héüllo");
        assert_eq!(doc.size(), 6);

        let delete = TextStep::delete(&doc, 1, 3).unwrap();
        let doc = doc.apply(&delete).unwrap();
        assert_eq!(doc.text(), "hllo");
    }

    #[test]
    fn test_persist_roundtrip() {
        let doc = TextDoc::new("snapshot ünïcode");
        let restored = TextDoc::from_persistable(&doc.to_persistable()).unwrap();
        assert_eq!(restored, doc);
    }

    #[test]
    fn test_initial_is_empty() {
        assert_eq!(TextDoc::initial().text(), "");
        assert_eq!(TextDoc::initial().size(), 0);
    }
}
