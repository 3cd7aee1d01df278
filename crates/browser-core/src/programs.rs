//! The Programs registry: a second declaration table recording each
//! program's settings and their defaults, dumped alongside the Tracks
//! dump (see SPEC_FULL's Program/Setting supplement).
//!
//! Grounded on `original_source/backend-server/app/model/programs.py`
//! (`ProgramSetting`, `ProgramSpec`, `AllProgramSpecs`, `ProgramsDump`),
//! sharing the `build_map`/delta-encoding discipline with
//! [`crate::tracks`]. As in `tracks.rs`, every table the original builds
//! from a bare `set()` (here: `names`, `keys`, `values`, all deduped via
//! unordered Python sets before `sorted()`/`immute_key()`) is built from
//! a `BTreeSet<Immute>`/`BTreeSet<String>` here instead, so the dump is
//! byte-stable across runs without depending on hash-seed-driven
//! iteration order.

use std::collections::BTreeSet;

use ciborium::value::Value as CborValue;
use browser_dataalg::delta;

use crate::dictionary::build_map;
use crate::immute::Immute;

#[derive(Debug, Clone)]
pub struct ProgramSetting {
    pub name: String,
    pub default: Immute,
}

impl ProgramSetting {
    pub fn from_toml(name: impl Into<String>, data: &toml::Value) -> Self {
        let default = data
            .get("default")
            .map(Immute::from_toml)
            .unwrap_or(Immute::Bool(false));
        Self {
            name: name.into(),
            default,
        }
    }
}

/// One bundle's declared program identity plus its settings. Mirrors
/// `ProgramSpec`.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub in_bundle_name: String,
    pub set: String,
    pub name: String,
    pub version: u32,
    pub settings: Vec<ProgramSetting>,
}

impl ProgramSpec {
    pub fn from_toml(in_bundle_name: impl Into<String>, doc: &toml::Value) -> Option<Self> {
        let name = doc.get("name")?.as_str()?.to_string();
        let set = doc.get("set").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let version = doc
            .get("version")
            .and_then(|v| match v {
                toml::Value::Integer(i) => Some(*i as u32),
                toml::Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .unwrap_or(0);
        let settings = doc
            .get("setting")
            .and_then(|v| v.as_table())
            .map(|table| {
                table
                    .iter()
                    .map(|(name, data)| ProgramSetting::from_toml(name.clone(), data))
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            in_bundle_name: in_bundle_name.into(),
            set,
            name,
            version,
            settings,
        })
    }

    pub fn full_name(&self) -> (String, String, u32) {
        (self.set.clone(), self.name.clone(), self.version)
    }

    fn collect(&self) -> (BTreeSet<String>, BTreeSet<String>, BTreeSet<Immute>) {
        let names = BTreeSet::from([self.in_bundle_name.clone(), self.name.clone(), self.set.clone()]);
        let mut keys = BTreeSet::new();
        let mut values = BTreeSet::new();
        for setting in &self.settings {
            keys.insert(setting.name.clone());
            values.insert(setting.default.clone());
        }
        (names, keys, values)
    }

    fn dump_for_wire(&self, dumper: &ProgramsDumper) -> ProgramSpecRow {
        let mut settings = self.settings.clone();
        settings.sort_by(|a, b| a.name.cmp(&b.name));
        let keys: Vec<usize> = settings.iter().map(|s| dumper.key_mapping[&s.name]).collect();
        let defaults: Vec<usize> = settings.iter().map(|s| dumper.value_mapping[&s.default]).collect();
        ProgramSpecRow {
            in_bundle_name: dumper.name_mapping[&self.in_bundle_name],
            set: dumper.name_mapping[&self.set],
            name: dumper.name_mapping[&self.name],
            version: self.version as i64,
            keys: delta(&keys.iter().map(|&i| i as i64).collect::<Vec<_>>()),
            defaults,
        }
    }
}

struct ProgramsDumper {
    name_mapping: std::collections::HashMap<String, usize>,
    key_mapping: std::collections::HashMap<String, usize>,
    value_mapping: std::collections::HashMap<Immute, usize>,
}

struct ProgramSpecRow {
    in_bundle_name: usize,
    set: usize,
    name: usize,
    version: i64,
    keys: Vec<i64>,
    defaults: Vec<usize>,
}

/// All program specs known to the running process, serialised once at
/// boot (and whenever a bundle reload adds a new spec). Mirrors
/// `AllProgramSpecs`.
#[derive(Default)]
pub struct AllProgramSpecs {
    specs: Vec<ProgramSpec>,
}

impl AllProgramSpecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: ProgramSpec) {
        self.specs.push(spec);
    }

    /// The flattened columnar dump, or `None` when no specs are
    /// registered. Mirrors `ProgramsDump`.
    pub fn dump_for_wire(&self) -> Option<CborValue> {
        if self.specs.is_empty() {
            return None;
        }
        let mut names = BTreeSet::new();
        let mut keys = BTreeSet::new();
        let mut values = BTreeSet::new();
        for spec in &self.specs {
            let (more_names, more_keys, more_values) = spec.collect();
            names.extend(more_names);
            keys.extend(more_keys);
            values.extend(more_values);
        }

        let (name_list, name_mapping) = build_map(names.into_iter().collect());
        let (key_list, key_mapping) = build_map(keys.into_iter().collect());
        let (value_list, value_mapping) = build_map(values.into_iter().collect());
        let dumper = ProgramsDumper {
            name_mapping,
            key_mapping,
            value_mapping,
        };

        let mut rows: Vec<ProgramSpecRow> = self.specs.iter().map(|spec| spec.dump_for_wire(&dumper)).collect();
        rows.sort_by_key(|r| r.name);

        let name_col = delta(&rows.iter().map(|r| r.name as i64).collect::<Vec<_>>());
        let in_bundle_col = delta(&rows.iter().map(|r| r.in_bundle_name as i64).collect::<Vec<_>>());
        let set_col = delta(&rows.iter().map(|r| r.set as i64).collect::<Vec<_>>());
        let version_col = delta(&rows.iter().map(|r| r.version).collect::<Vec<_>>());

        let text = |s: &str| CborValue::Text(s.to_string());
        let int_list = |xs: &[i64]| CborValue::Array(xs.iter().map(|&x| CborValue::Integer(x.into())).collect());
        let usize_list = |xs: &[usize]| CborValue::Array(xs.iter().map(|&x| CborValue::Integer(x.into())).collect());

        let map: Vec<(CborValue, CborValue)> = vec![
            (text("name"), int_list(&name_col)),
            (text("in_bundle_name"), int_list(&in_bundle_col)),
            (text("set"), int_list(&set_col)),
            (text("version"), int_list(&version_col)),
            (
                text("keys"),
                CborValue::Array(rows.iter().map(|r| int_list(&r.keys)).collect()),
            ),
            (
                text("defaults"),
                CborValue::Array(rows.iter().map(|r| usize_list(&r.defaults)).collect()),
            ),
            (text("name_idx"), CborValue::Array(name_list.into_iter().map(CborValue::Text).collect())),
            (text("key_idx"), CborValue::Array(key_list.into_iter().map(CborValue::Text).collect())),
            (text("value_idx"), CborValue::Array(value_list.iter().map(Immute::to_wire).collect())),
        ];
        Some(CborValue::Map(map))
    }
}
