//! Two-level recursive text chunker.
//!
//! Splits raw document text into large parent chunks and, from each parent,
//! smaller child chunks. Splitting recurses over an ordered list of
//! separators (paragraph, line, sentence boundary) so that every span fits
//! the configured window, with a configurable overlap carried between
//! consecutive spans.
//!
//! The splitter never drops characters: concatenating the non-overlapping
//! regions of the output reconstructs the input text exactly.
//!
//! Windows and overlaps are measured in bytes of UTF-8, with every split
//! landing on a char boundary. Multibyte text therefore packs fewer
//! characters per span than the nominal window size.

use crate::models::{ChildChunk, ParentChunk};

/// Separator priority: paragraph, then line, then sentence boundary.
pub const SEPARATORS: [&str; 3] = ["\n\n", "\n", "."];

/// Splits documents into parent and child chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    parent_window: usize,
    parent_overlap: usize,
    child_window: usize,
    child_overlap: usize,
}

impl Chunker {
    pub fn new(
        parent_window: usize,
        parent_overlap: usize,
        child_window: usize,
        child_overlap: usize,
    ) -> Self {
        Self {
            parent_window,
            parent_overlap,
            child_window,
            child_overlap,
        }
    }

    /// Split one document into parent chunks and their children.
    ///
    /// Parent `seq` values are 0,1,2,… in split order. `next_child_id` is
    /// advanced for every child produced, so a multi-document batch shares
    /// one monotonic counter.
    ///
    /// A document shorter than the parent window yields exactly one parent
    /// with `seq = 0`; a parent shorter than the child window yields
    /// exactly one child.
    pub fn split_document(
        &self,
        source: &str,
        text: &str,
        next_child_id: &mut i64,
    ) -> (Vec<ParentChunk>, Vec<ChildChunk>) {
        let mut parent_texts =
            recursive_split(text, self.parent_window, self.parent_overlap, &SEPARATORS);
        if parent_texts.is_empty() {
            parent_texts.push(text.to_string());
        }

        let parents: Vec<ParentChunk> = parent_texts
            .into_iter()
            .enumerate()
            .map(|(seq, text)| ParentChunk {
                source: source.to_string(),
                seq: seq as i64,
                text,
            })
            .collect();

        let mut children = Vec::new();
        for parent in &parents {
            let mut child_texts = recursive_split(
                &parent.text,
                self.child_window,
                self.child_overlap,
                &SEPARATORS,
            );
            if child_texts.is_empty() {
                child_texts.push(parent.text.clone());
            }
            for text in child_texts {
                children.push(ChildChunk {
                    source: source.to_string(),
                    parent_seq: parent.seq,
                    child_id: *next_child_id,
                    text,
                });
                *next_child_id += 1;
            }
        }

        (parents, children)
    }

    /// Split a batch of `(source, text)` documents, sharing one child-id
    /// counter across the whole batch.
    pub fn split_documents(
        &self,
        docs: &[(String, String)],
    ) -> (Vec<ParentChunk>, Vec<ChildChunk>) {
        let mut parents = Vec::new();
        let mut children = Vec::new();
        let mut next_child_id = 0i64;
        for (source, text) in docs {
            let (p, c) = self.split_document(source, text, &mut next_child_id);
            parents.extend(p);
            children.extend(c);
        }
        (parents, children)
    }
}

/// Recursively split `text` into spans of at most `window` bytes, carrying
/// up to `overlap` bytes of repeated context between consecutive spans.
///
/// Splits on the first separator in `separators` and recurses into
/// oversized pieces with the remaining separators; when no separator
/// applies, falls back to a hard split at char boundaries.
pub fn recursive_split(
    text: &str,
    window: usize,
    overlap: usize,
    separators: &[&str],
) -> Vec<String> {
    let mut fragments = Vec::new();
    collect_fragments(text, window, separators, &mut fragments);
    merge_fragments(fragments, window, overlap)
}

fn collect_fragments(text: &str, window: usize, separators: &[&str], out: &mut Vec<String>) {
    if text.is_empty() {
        return;
    }
    if text.len() <= window {
        out.push(text.to_string());
        return;
    }

    match separators.first() {
        Some(sep) => {
            let rest = &separators[1..];
            for piece in split_keep_sep(text, sep) {
                if piece.len() <= window {
                    out.push(piece.to_string());
                } else {
                    collect_fragments(piece, window, rest, out);
                }
            }
        }
        None => {
            // Hard split at char boundaries, window bytes at a time.
            let mut start = 0;
            while start < text.len() {
                let mut end = floor_char_boundary(text, (start + window).min(text.len()));
                if end <= start {
                    end = next_char_boundary(text, start);
                }
                out.push(text[start..end].to_string());
                start = end;
            }
        }
    }
}

/// Split on `sep`, keeping each separator attached to the piece before it
/// so that no characters are lost.
fn split_keep_sep<'a>(text: &'a str, sep: &str) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    while let Some(pos) = text[start..].find(sep) {
        let end = start + pos + sep.len();
        pieces.push(&text[start..end]);
        start = end;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Greedily merge fragments into spans of at most `window` bytes. When a
/// span is flushed, the next span starts with up to `overlap` trailing
/// bytes of the flushed span, provided the result still fits the window.
fn merge_fragments(fragments: Vec<String>, window: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf = String::new();

    for frag in fragments {
        if !buf.is_empty() && buf.len() + frag.len() > window {
            let tail = overlap_tail(&buf, overlap).to_string();
            chunks.push(std::mem::take(&mut buf));
            if !tail.is_empty() && tail.len() + frag.len() <= window {
                buf.push_str(&tail);
            }
        }
        buf.push_str(&frag);
    }

    if !buf.is_empty() {
        chunks.push(buf);
    }
    chunks
}

/// Trailing slice of at most `overlap` bytes, aligned to a char boundary.
fn overlap_tail(s: &str, overlap: usize) -> &str {
    if overlap == 0 {
        return "";
    }
    if s.len() <= overlap {
        return s;
    }
    let mut start = s.len() - overlap;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, start: usize) -> usize {
    s[start..]
        .chars()
        .next()
        .map(|c| start + c.len_utf8())
        .unwrap_or(s.len())
}
