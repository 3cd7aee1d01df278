//! Dedup-table helpers shared by [`crate::tracks`] and [`crate::programs`].
//!
//! Grounded on `original_source/backend-server/app/model/serialutil.py`
//! (`build_map`) and `model/tracks.py` (`_count_prefix`, `_prefix_encode`).
//! Both take their input already in final table order — callers are
//! expected to hand in a `BTreeSet`-derived `Vec` rather than a bare
//! hash-set iteration, which is what made the original's `set()`-keyed
//! tables order-unstable across runs (see `crate::immute`'s doc comment
//! and the `tag`/`Y`-tag fix in `browser-dataalg`).

use std::collections::HashMap;
use std::hash::Hash;

/// Assigns each item in `items` its position as an index, returning the
/// table itself alongside a reverse lookup. Mirrors `build_map`.
pub fn build_map<T: Clone + Eq + Hash>(items: Vec<T>) -> (Vec<T>, HashMap<T, usize>) {
    let mapping = items.iter().cloned().enumerate().map(|(i, v)| (v, i)).collect();
    (items, mapping)
}

fn count_prefix(a: &[String], b: &[String]) -> usize {
    let minlen = a.len().min(b.len());
    for i in 0..minlen {
        if a[i] != b[i] {
            return i;
        }
    }
    minlen
}

/// A prefix tree over already-sorted switch/channel paths: each entry is
/// `(prefix_len_delta, suffix)` relative to the previous path. Mirrors
/// `_prefix_encode`.
pub fn prefix_encode(paths: &[Vec<String>]) -> (Vec<(i64, Vec<String>)>, HashMap<Vec<String>, usize>) {
    let mut tree = Vec::with_capacity(paths.len());
    let mut mapping = HashMap::with_capacity(paths.len());
    let mut prev_prefix_len = 0usize;
    let mut prev_path: Vec<String> = Vec::new();
    for (i, path) in paths.iter().enumerate() {
        let prefix_len = count_prefix(&prev_path, path);
        tree.push((prefix_len as i64 - prev_prefix_len as i64, path[prefix_len..].to_vec()));
        mapping.insert(path.clone(), i);
        prev_prefix_len = prefix_len;
        prev_path = path.clone();
    }
    (tree, mapping)
}
