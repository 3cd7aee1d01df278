//! The DataAlg tag grammar: parses a tag string such as `"NDZRL"` or
//! `"SYRLZ"` and applies the matching encoding pipeline to a [`Column`].
//!
//! Ported from
//! `original_source/backend-server/app/data/v16/dataalgorithm.py`
//! (`DataAlgorithm`, `NumberAlgorithm`, `NumberSourceAlgorithm`,
//! `StringAlgorithm`, `BooleanAlgorithm`). The original walks the tag
//! string back-to-front by reversing it once and repeatedly popping the
//! list's tail; that is equivalent to consuming the original string
//! front-to-back, which is how the parser below reads it.
//!
//! One behavioural fix over the original: `BooleanAlgorithm`'s `"B"` arm
//! computes a packed one-byte-per-value buffer but then appends the
//! un-packed `value` instead of that buffer (a no-op bug in the source).
//! This port appends the packed buffer, matching what spec.md §4.2
//! actually documents ("B ... encoded one-byte-per-value or raw").

use std::collections::VecDeque;

use thiserror::Error;

use crate::column::{Column, Fragment, TaggedExpression};
use crate::lesqlite2;
use crate::transforms::{delta, zigzag};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataAlgError {
    #[error("empty tag")]
    EmptyTag,
    #[error("unknown tag code '{0}'")]
    BadCode(char),
    #[error("tag '{0}' does not match column type")]
    TypeMismatch(char),
    #[error("trailing characters in tag after a complete expression")]
    TrailingCode,
    #[error("string dictionary-classify ('Y') needs a following string algorithm")]
    IncompleteDictionary,
    #[error("lesqlite2 cannot encode a negative value; apply zigzag ('Z') first")]
    NegativeForLesqlite2,
    #[error("'C' (single string) requires exactly one value, got {0}")]
    NotASingleString(usize),
}

/// Parse `tag` and encode `column` into the tagged fragment array.
pub fn encode(tag: &str, column: Column) -> Result<TaggedExpression, DataAlgError> {
    let mut code: VecDeque<char> = tag.chars().collect();
    let head = code.pop_front().ok_or(DataAlgError::EmptyTag)?;
    let mut fragments = Vec::new();
    match (head, column) {
        ('N', Column::Numbers(values)) => encode_number(&mut code, values, &mut fragments)?,
        ('S', Column::Strings(values)) => encode_string(&mut code, values, &mut fragments)?,
        ('B', Column::Booleans(values)) => encode_boolean(&mut code, values, &mut fragments)?,
        (other, _) => return Err(DataAlgError::TypeMismatch(other)),
    }
    if !code.is_empty() {
        return Err(DataAlgError::TrailingCode);
    }
    Ok(TaggedExpression { tag: tag.to_string(), fragments })
}

fn next_code(code: &mut VecDeque<char>) -> Result<char, DataAlgError> {
    code.pop_front().ok_or(DataAlgError::EmptyTag)
}

fn encode_number(
    code: &mut VecDeque<char>,
    values: Vec<i64>,
    fragments: &mut Vec<Fragment>,
) -> Result<(), DataAlgError> {
    match next_code(code)? {
        'D' => encode_number(code, delta(&values), fragments),
        'Z' => {
            let zigzagged: Vec<i64> = zigzag(&values).into_iter().map(|z| z as i64).collect();
            encode_number(code, zigzagged, fragments)
        }
        'R' => encode_number_source(code, values, fragments),
        other => Err(DataAlgError::BadCode(other)),
    }
}

fn encode_number_source(
    code: &mut VecDeque<char>,
    values: Vec<i64>,
    fragments: &mut Vec<Fragment>,
) -> Result<(), DataAlgError> {
    match next_code(code)? {
        'A' => {
            fragments.push(Fragment::Numbers(values));
            Ok(())
        }
        'L' => {
            let mut unsigned = Vec::with_capacity(values.len());
            for v in values {
                if v < 0 {
                    return Err(DataAlgError::NegativeForLesqlite2);
                }
                unsigned.push(v as u64);
            }
            fragments.push(Fragment::Bytes(lesqlite2::encode_sequence(&unsigned)));
            Ok(())
        }
        other => Err(DataAlgError::BadCode(other)),
    }
}

fn encode_string(
    code: &mut VecDeque<char>,
    values: Vec<String>,
    fragments: &mut Vec<Fragment>,
) -> Result<(), DataAlgError> {
    match next_code(code)? {
        'A' => {
            fragments.push(Fragment::Strings(values));
            Ok(())
        }
        'C' => {
            if values.len() != 1 {
                return Err(DataAlgError::NotASingleString(values.len()));
            }
            fragments.push(Fragment::Bytes(values.into_iter().next().unwrap().into_bytes()));
            Ok(())
        }
        'Z' => {
            let mut data = Vec::new();
            for s in &values {
                data.extend_from_slice(s.as_bytes());
                data.push(0);
            }
            fragments.push(Fragment::Bytes(data));
            Ok(())
        }
        'Y' => {
            if code.is_empty() {
                return Err(DataAlgError::IncompleteDictionary);
            }
            let (keys, indexes) = classify(&values);
            let indexes_as_numbers: Vec<i64> = indexes.into_iter().map(|i| i as i64).collect();
            encode_number(code, indexes_as_numbers, fragments)?;
            encode_string(code, keys, fragments)
        }
        other => Err(DataAlgError::BadCode(other)),
    }
}

fn encode_boolean(
    code: &mut VecDeque<char>,
    values: Vec<bool>,
    fragments: &mut Vec<Fragment>,
) -> Result<(), DataAlgError> {
    match next_code(code)? {
        'A' => {
            fragments.push(Fragment::Booleans(values));
            Ok(())
        }
        'B' => {
            let packed: Vec<u8> = values.iter().map(|&b| u8::from(b)).collect();
            fragments.push(Fragment::Bytes(packed));
            Ok(())
        }
        other => Err(DataAlgError::BadCode(other)),
    }
}

/// Dictionary-classify a string column in first-occurrence order:
/// `(distinct values in order of first appearance, index per input row)`.
///
/// Grounded on `numbers.py::classify`, not the inline `list(set(value))`
/// used by `dataalgorithm.py`'s own `"Y"` arm in the original — the
/// latter's iteration order over a Python `set` is not a function of
/// input order and would make the cache/fingerprint byte-stability
/// invariant (spec.md §8, property 3) impossible to hold.
pub fn classify(values: &[String]) -> (Vec<String>, Vec<usize>) {
    use std::collections::HashMap;
    let mut mapping: HashMap<&str, usize> = HashMap::new();
    let mut keys: Vec<String> = Vec::new();
    let mut indexes = Vec::with_capacity(values.len());
    for item in values {
        let idx = match mapping.get(item.as_str()) {
            Some(&idx) => idx,
            None => {
                let idx = keys.len();
                keys.push(item.clone());
                mapping.insert(item.as_str(), idx);
                idx
            }
        };
        indexes.push(idx);
    }
    // SAFETY note: mapping borrows from `values`, dropped before return.
    drop(mapping);
    (keys, indexes)
}
