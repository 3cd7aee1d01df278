//! A hashable, totally ordered mirror of TOML scalar/collection values,
//! used as the dedup key for the Tracks/Programs value table.
//!
//! Grounded on `original_source/backend-server/app/model/serialutil.py`'s
//! `immute`/`remute` pair: the original wraps lists and dicts in tagged
//! tuples so they can live as Python dict/set keys (plain lists and
//! dicts aren't hashable there). Rust's `enum` derives `Eq`/`Ord`/`Hash`
//! once its variants do, so `Immute` plays both roles at once — no
//! separate "wrap for hashing, unwrap for the wire" step is needed for
//! dedup itself; [`Immute::to_wire`] is the `remute` counterpart, used
//! only when a value leaves the dedup table for the wire.

use ciborium::value::Value as CborValue;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Immute {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<Immute>),
    /// Keys are kept sorted ascending so two structurally equal tables
    /// compare equal regardless of declaration order.
    Map(Vec<(String, Immute)>),
}

impl Immute {
    pub fn from_toml(value: &toml::Value) -> Self {
        match value {
            toml::Value::Boolean(b) => Immute::Bool(*b),
            toml::Value::Integer(i) => Immute::Int(*i),
            // Floats carry no natural total order under `Ord`; TOML
            // track/setting defaults in practice are bool/int/string, so
            // they're folded into Text via their canonical rendering.
            toml::Value::Float(f) => Immute::Text(f.to_string()),
            toml::Value::String(s) => Immute::Text(s.clone()),
            toml::Value::Datetime(dt) => Immute::Text(dt.to_string()),
            toml::Value::Array(items) => Immute::List(items.iter().map(Immute::from_toml).collect()),
            toml::Value::Table(table) => {
                let mut entries: Vec<(String, Immute)> =
                    table.iter().map(|(k, v)| (k.clone(), Immute::from_toml(v))).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Immute::Map(entries)
            }
        }
    }

    /// The plain (un-tagged) wire value a client decodes; mirrors `remute`.
    pub fn to_wire(&self) -> CborValue {
        match self {
            Immute::Bool(b) => CborValue::Bool(*b),
            Immute::Int(i) => CborValue::Integer((*i).into()),
            Immute::Text(s) => CborValue::Text(s.clone()),
            Immute::List(items) => CborValue::Array(items.iter().map(Immute::to_wire).collect()),
            Immute::Map(entries) => {
                CborValue::Map(entries.iter().map(|(k, v)| (CborValue::Text(k.clone()), v.to_wire())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_with_different_key_order_are_equal() {
        let a = toml::Value::Table(toml::map::Map::from_iter([
            ("b".to_string(), toml::Value::Integer(2)),
            ("a".to_string(), toml::Value::Integer(1)),
        ]));
        let b = toml::Value::Table(toml::map::Map::from_iter([
            ("a".to_string(), toml::Value::Integer(1)),
            ("b".to_string(), toml::Value::Integer(2)),
        ]));
        assert_eq!(Immute::from_toml(&a), Immute::from_toml(&b));
    }

    #[test]
    fn to_wire_strips_the_tag_and_recurses() {
        let value = Immute::List(vec![Immute::Int(1), Immute::Bool(true)]);
        let CborValue::Array(items) = value.to_wire() else { panic!("expected array") };
        assert_eq!(items, vec![CborValue::Integer(1.into()), CborValue::Bool(true)]);
    }

    #[test]
    fn ordering_is_total_so_it_can_back_a_btreeset() {
        let mut set = std::collections::BTreeSet::new();
        set.insert(Immute::Bool(false));
        set.insert(Immute::Int(3));
        set.insert(Immute::Text("z".into()));
        set.insert(Immute::Int(1));
        assert_eq!(set.len(), 4);
    }
}
