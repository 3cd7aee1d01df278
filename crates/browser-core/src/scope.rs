//! The `scope` request parameter: a tagged variant over the recognised
//! keys, per spec.md §9 design note. Grounded on
//! `original_source/backend-server/app/command/coremodel.py::DataHandler.get_scope`,
//! which already treats scope as a `Dict[str, List[str]]`.
//!
//! Unknown keys round-trip as opaque `(String, Vec<String>)` pairs so a
//! newer client's scope keys don't break an older backend binary.

use ciborium::value::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    pub datafile: Option<String>,
    pub id: Option<String>,
    pub genome: Option<String>,
    pub expanded: Vec<String>,
    pub start: Option<u64>,
    pub tab_selected: Option<String>,
    pub opaque: Vec<(String, Vec<String>)>,
}

impl Scope {
    pub fn from_value(value: &Value) -> Self {
        let mut scope = Scope::default();
        let Some(map) = value.as_map() else { return scope };
        for (k, v) in map {
            let Some(key) = k.as_text() else { continue };
            let values = string_list(v);
            match key {
                "datafile" => scope.datafile = values.into_iter().next(),
                "id" => scope.id = values.into_iter().next(),
                "genome" => scope.genome = values.into_iter().next(),
                "expanded" => scope.expanded = values,
                "tab-selected" => scope.tab_selected = values.into_iter().next(),
                "start" => {
                    scope.start = values
                        .into_iter()
                        .next()
                        .and_then(|s| s.parse::<u64>().ok())
                        .or_else(|| v.as_integer().and_then(|i| u64::try_from(i).ok()));
                }
                other => scope.opaque.push((other.to_string(), values)),
            }
        }
        scope
    }

    /// Canonical `{key: [values...]}` map, used by the fingerprint
    /// (map key order is the caller's responsibility to canonicalise).
    pub fn to_value(&self) -> Value {
        let mut map = Vec::new();
        if let Some(v) = &self.datafile {
            map.push(("datafile".to_string(), vec![v.clone()]));
        }
        if let Some(v) = &self.id {
            map.push(("id".to_string(), vec![v.clone()]));
        }
        if let Some(v) = &self.genome {
            map.push(("genome".to_string(), vec![v.clone()]));
        }
        if !self.expanded.is_empty() {
            map.push(("expanded".to_string(), self.expanded.clone()));
        }
        if let Some(v) = self.start {
            map.push(("start".to_string(), vec![v.to_string()]));
        }
        if let Some(v) = &self.tab_selected {
            map.push(("tab-selected".to_string(), vec![v.clone()]));
        }
        for (k, v) in &self.opaque {
            map.push((k.clone(), v.clone()));
        }
        map.sort_by(|a, b| a.0.cmp(&b.0));
        Value::Map(
            map.into_iter()
                .map(|(k, v)| {
                    (
                        Value::Text(k),
                        Value::Array(v.into_iter().map(Value::Text).collect()),
                    )
                })
                .collect(),
        )
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_text().map(str::to_string))
            .collect(),
        Value::Text(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognised_keys() {
        let mut map = Vec::new();
        map.push((
            Value::Text("datafile".into()),
            Value::Array(vec![Value::Text("foo.bw".into())]),
        ));
        map.push((
            Value::Text("expanded".into()),
            Value::Array(vec![Value::Text("a".into()), Value::Text("b".into())]),
        ));
        let scope = Scope::from_value(&Value::Map(map));
        assert_eq!(scope.datafile.as_deref(), Some("foo.bw"));
        assert_eq!(scope.expanded, vec!["a", "b"]);
    }

    #[test]
    fn unknown_keys_round_trip_as_opaque() {
        let map = vec![(
            Value::Text("future-key".into()),
            Value::Array(vec![Value::Text("x".into())]),
        )];
        let scope = Scope::from_value(&Value::Map(map));
        assert_eq!(scope.opaque, vec![("future-key".to_string(), vec!["x".to_string()])]);
        let back = scope.to_value();
        let roundtripped = Scope::from_value(&back);
        assert_eq!(roundtripped.opaque, scope.opaque);
    }

    #[test]
    fn to_value_orders_keys_ascending_for_canonicalisation() {
        let mut scope = Scope::default();
        scope.genome = Some("hsap".into());
        scope.datafile = Some("a.bw".into());
        let Value::Map(entries) = scope.to_value() else { panic!() };
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_text().unwrap()).collect();
        let mut sorted_keys = keys.clone();
        sorted_keys.sort();
        assert_eq!(keys, sorted_keys);
    }
}
