//! Content-addressed reconciliation of a file's chunks against its index records.
//!
//! Chunks are paired with existing records by digest first, then by exact
//! content. Whatever new chunk finds no partner is added; whatever record is
//! left over is deleted.
//!
//! Duplicate bodies inside one file pair first-match-wins in extraction order.
//! Two identical blocks that are really distinct may therefore swap identities;
//! this is accepted behaviour.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::chunk::Chunk;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationResult {
    pub to_add: Vec<Chunk>,
    /// `(existing id, refreshed chunk)`; the chunk carries the existing id.
    pub to_update: Vec<(String, Chunk)>,
    pub to_delete: Vec<String>,
    pub unchanged_count: usize,
}

impl ReconciliationResult {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Plan the mutations that bring `existing` in line with `new_chunks`.
///
/// `existing` holds the stored records of one file, with digests already
/// filled in (see [`Chunk::from_record`]).
#[must_use]
pub fn reconcile(new_chunks: &[Chunk], existing: &[Chunk]) -> ReconciliationResult {
    let mut by_hash: HashMap<&str, VecDeque<usize>> = HashMap::new();
    for (idx, record) in existing.iter().enumerate() {
        by_hash
            .entry(record.content_hash.as_str())
            .or_default()
            .push_back(idx);
    }
    let mut matched = vec![false; existing.len()];
    let mut result = ReconciliationResult::default();
    let mut pending_add: Vec<&Chunk> = Vec::new();

    for chunk in new_chunks {
        if let Some(idx) = take_unmatched(&mut by_hash, &matched, &chunk.content_hash) {
            matched[idx] = true;
            result.unchanged_count += 1;
            continue;
        }

        if let Some(idx) = existing
            .iter()
            .enumerate()
            .position(|(i, r)| !matched[i] && r.content == chunk.content)
        {
            matched[idx] = true;
            let existing_id = existing[idx].id.clone();
            let mut refreshed = chunk.clone();
            refreshed.id.clone_from(&existing_id);
            result.to_update.push((existing_id, refreshed));
            continue;
        }

        pending_add.push(chunk);
    }

    let retained: HashSet<&str> = existing
        .iter()
        .zip(&matched)
        .filter(|(_, m)| **m)
        .map(|(r, _)| r.id.as_str())
        .collect();

    result.to_add = pending_add
        .into_iter()
        .map(|chunk| {
            let mut chunk = chunk.clone();
            if retained.contains(chunk.id.as_str()) {
                chunk.id = disambiguate(&chunk);
            }
            chunk
        })
        .collect();

    result.to_delete = existing
        .iter()
        .zip(&matched)
        .filter(|(_, m)| !**m)
        .map(|(r, _)| r.id.clone())
        .collect();

    result
}

fn take_unmatched(
    by_hash: &mut HashMap<&str, VecDeque<usize>>,
    matched: &[bool],
    hash: &str,
) -> Option<usize> {
    let queue = by_hash.get_mut(hash)?;
    while let Some(idx) = queue.pop_front() {
        if !matched[idx] {
            return Some(idx);
        }
    }
    None
}

fn disambiguate(chunk: &Chunk) -> String {
    let suffix: String = chunk.content_hash.chars().take(8).collect();
    format!("{}#{suffix}", chunk.id)
}
