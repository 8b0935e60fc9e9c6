//! Sequence diffs.
//!
//! - [`string_edits`]: one remove + one insert around the common prefix/suffix
//! - [`array_edits`]: LCS-based insert/remove script for arbitrary values
//! - [`diff_ids`]: insert/move/remove script for lists of unique ids, used to
//!   broadcast query result changes

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Edit against a string, indexed in chars.
#[derive(Debug, Clone, PartialEq)]
pub enum StringEdit {
    Remove { index: usize, how_many: usize },
    Insert { index: usize, text: String },
}

/// Edit against an array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayEdit<T> {
    Remove { index: usize, how_many: usize },
    Insert { index: usize, values: Vec<T> },
}

/// Edit against an ordered id list. Applied in order; each index refers to
/// the list as left by the previous edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IdDiff {
    Insert {
        index: usize,
        ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Remove { index: usize, how_many: usize },
    /// Take the element at `from`, then insert it at `to` in the shortened list
    Move { from: usize, to: usize },
}

/// Minimal-ish edit turning `old` into `new`.
pub fn string_edits(old: &str, new: &str) -> Vec<StringEdit> {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();
    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();

    let mut edits = Vec::new();
    let removed = a.len() - prefix - suffix;
    if removed > 0 {
        edits.push(StringEdit::Remove {
            index: prefix,
            how_many: removed,
        });
    }
    if b.len() - prefix - suffix > 0 {
        edits.push(StringEdit::Insert {
            index: prefix,
            text: b[prefix..b.len() - suffix].iter().collect(),
        });
    }
    edits
}

/// Longest common subsequence as matched index pairs.
///
/// The common prefix and suffix are matched directly; only the middle
/// goes through the quadratic table.
fn lcs_pairs<T: PartialEq>(a: &[T], b: &[T]) -> Vec<(usize, usize)> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (mid_a, mid_b) = (&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix]);

    let mut pairs: Vec<(usize, usize)> = (0..prefix).map(|i| (i, i)).collect();
    let (n, m) = (mid_a.len(), mid_b.len());
    if n > 0 && m > 0 {
        let mut table = vec![vec![0u32; m + 1]; n + 1];
        for i in (0..n).rev() {
            for j in (0..m).rev() {
                table[i][j] = if mid_a[i] == mid_b[j] {
                    table[i + 1][j + 1] + 1
                } else {
                    table[i + 1][j].max(table[i][j + 1])
                };
            }
        }
        let (mut i, mut j) = (0, 0);
        while i < n && j < m {
            if mid_a[i] == mid_b[j] {
                pairs.push((prefix + i, prefix + j));
                i += 1;
                j += 1;
            } else if table[i + 1][j] >= table[i][j + 1] {
                i += 1;
            } else {
                j += 1;
            }
        }
    }
    pairs.extend((0..suffix).map(|k| (a.len() - suffix + k, b.len() - suffix + k)));
    pairs
}

/// Indexes of one longest strictly increasing subsequence of `seq`.
fn longest_increasing(seq: &[usize]) -> Vec<usize> {
    // tails[k]: index of the smallest tail of an increasing run of length k + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (i, &v) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t] < v);
        if k > 0 {
            prev[i] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(i);
        } else {
            tails[k] = i;
        }
    }
    let mut out = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        out.push(i);
        cursor = prev[i];
    }
    out.reverse();
    out
}

/// Insert/remove script turning `old` into `new`.
pub fn array_edits<T: PartialEq + Clone>(old: &[T], new: &[T]) -> Vec<ArrayEdit<T>> {
    let mut edits = Vec::new();
    let (mut ai, mut bi, mut pos) = (0, 0, 0);
    let pairs = lcs_pairs(old, new);
    for (pa, pb) in pairs.into_iter().chain(std::iter::once((old.len(), new.len()))) {
        if pa > ai {
            edits.push(ArrayEdit::Remove {
                index: pos,
                how_many: pa - ai,
            });
        }
        if pb > bi {
            edits.push(ArrayEdit::Insert {
                index: pos,
                values: new[bi..pb].to_vec(),
            });
            pos += pb - bi;
        }
        pos += 1;
        ai = pa + 1;
        bi = pb + 1;
    }
    edits
}

/// Insert/move/remove script turning `old` into `new`. Ids must be unique.
///
/// Elements on the longest common subsequence stay put; every other element
/// is moved (or inserted) right after its predecessor in `new`. With unique
/// ids the common subsequence is the longest increasing run of `new`
/// positions, found in `O(n log n)`.
pub fn diff_ids(old: &[String], new: &[String]) -> Vec<IdDiff> {
    let mut diffs = Vec::new();
    let mut current: Vec<String> = Vec::with_capacity(old.len());
    let new_pos: HashMap<&str, usize> = new.iter().enumerate().map(|(j, id)| (id.as_str(), j)).collect();

    // Removals first, coalescing runs.
    let mut index = 0;
    let mut run = 0;
    for id in old {
        if new_pos.contains_key(id.as_str()) {
            if run > 0 {
                diffs.push(IdDiff::Remove { index, how_many: run });
                run = 0;
            }
            current.push(id.clone());
            index += 1;
        } else {
            run += 1;
        }
    }
    if run > 0 {
        diffs.push(IdDiff::Remove { index, how_many: run });
    }

    let mut fixed = vec![false; new.len()];
    let positions: Vec<usize> = current.iter().filter_map(|id| new_pos.get(id.as_str()).copied()).collect();
    for i in longest_increasing(&positions) {
        fixed[positions[i]] = true;
    }

    for j in 0..new.len() {
        if fixed[j] {
            continue;
        }
        let to = if j == 0 {
            0
        } else {
            // The predecessor in `new` is fixed by now.
            match current.iter().position(|id| *id == new[j - 1]) {
                Some(p) => p + 1,
                None => 0,
            }
        };
        match current.iter().position(|id| *id == new[j]) {
            Some(from) => {
                current.remove(from);
                let to = if from < to { to - 1 } else { to };
                current.insert(to, new[j].clone());
                if from != to {
                    diffs.push(IdDiff::Move { from, to });
                }
            }
            None => {
                current.insert(to, new[j].clone());
                match diffs.last_mut() {
                    Some(IdDiff::Insert { index, ids }) if *index + ids.len() == to => {
                        ids.push(new[j].clone());
                    }
                    _ => diffs.push(IdDiff::Insert {
                        index: to,
                        ids: vec![new[j].clone()],
                    }),
                }
            }
        }
        fixed[j] = true;
    }
    diffs
}

/// Apply an id diff script positionally. Out-of-range indexes are clamped.
pub fn apply_id_diffs(list: &mut Vec<String>, diffs: &[IdDiff]) {
    for diff in diffs {
        match diff {
            IdDiff::Insert { index, ids } => {
                let at = (*index).min(list.len());
                list.splice(at..at, ids.iter().cloned());
            }
            IdDiff::Remove { index, how_many } => {
                let start = (*index).min(list.len());
                let end = start.saturating_add(*how_many).min(list.len());
                list.drain(start..end);
            }
            IdDiff::Move { from, to } => {
                if *from < list.len() {
                    let id = list.remove(*from);
                    let to = (*to).min(list.len());
                    list.insert(to, id);
                }
            }
        }
    }
}
