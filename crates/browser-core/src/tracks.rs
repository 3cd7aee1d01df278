//! Track/Expansion declarations and their flattened columnar wire dump.
//!
//! Grounded in full on `original_source/backend-server/app/model/tracks.py`
//! (`Track`, `Expansion`, `Tracks`, `TracksDump`, `_prefix_encode`,
//! `rotate`, `split_scale`). Kept: the include mechanism, last-writer-wins
//! merge, the five dedup tables, and the scale-bucketed columnar dump.
//!
//! **Deliberate deviations from the original, both for determinism:**
//!
//! 1. Every table the original builds from a bare Python `set()`
//!    (`values`, in particular — `build_map(values)` with no `sorted()`
//!    call) is built here from a `BTreeSet` instead, so iteration order
//!    is a function of content, not of the hash seed. This is the same
//!    fix already applied to the `Y` dictionary-classify tag in
//!    `browser-dataalg::tag`.
//! 2. `tags` is modelled as a per-track *list* of tag name strings deduped
//!    through the same kind of sorted-index table as `triggers`/settings
//!    keys, rather than the original's single opaque `tag_mapping[tags]`
//!    lookup (which requires the whole tag collection to be one hashable
//!    unit, in tension with spec's literal "sorted list of tag names"
//!    table). This keeps the five dedup tables uniformly string-level.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use browser_dataalg::delta;
use ciborium::value::Value as CborValue;
use indexmap::IndexMap;
use thiserror::Error;

use crate::dictionary::{build_map, prefix_encode};
use crate::immute::Immute;

#[derive(Debug, Error)]
pub enum TracksError {
    #[error("failed to read include file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("loop in include_files at {0}")]
    IncludeLoop(PathBuf),
}

fn toml_as_i64(value: &toml::Value) -> Option<i64> {
    match value {
        toml::Value::Integer(i) => Some(*i),
        toml::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn string_path(value: &toml::Value) -> Vec<String> {
    match value {
        toml::Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        toml::Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Track {
    pub name: String,
    pub program_name: String,
    pub program_set: String,
    pub program_version: i64,
    /// `(min, max, step)`.
    pub scales: [i64; 3],
    pub triggers: BTreeSet<Vec<String>>,
    pub tags: BTreeSet<String>,
    pub values: Vec<(String, Immute)>,
    pub settings: Vec<(String, Vec<String>)>,
}

impl Track {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            program_name: name.clone(),
            name,
            ..Default::default()
        }
    }

    /// Expand `include`/`general` snippets and overlay the declared
    /// fields. Mirrors `Track.ingest_toml`.
    pub fn ingest_toml(&mut self, data: &toml::Value, includes: &HashMap<String, toml::Value>) {
        if let Some(names) = data.get("include").and_then(|v| v.as_array()) {
            for inc in names {
                if let Some(name) = inc.as_str() {
                    if let Some(snippet) = includes.get(name) {
                        self.ingest_toml(&snippet.clone(), includes);
                    }
                }
            }
        }
        if let Some(general) = data.get("general") {
            self.ingest_toml(&general.clone(), includes);
        }
        if let Some(v) = data.get("program_name").and_then(|v| v.as_str()) {
            self.program_name = v.to_string();
        }
        if let Some(v) = data.get("program_set").and_then(|v| v.as_str()) {
            self.program_set = v.to_string();
        }
        if let Some(v) = data.get("program_version").and_then(toml_as_i64) {
            self.program_version = v;
        }
        if let Some(scales) = data.get("scales").and_then(|v| v.as_array()) {
            for (i, s) in scales.iter().take(3).enumerate() {
                if let Some(n) = toml_as_i64(s) {
                    self.scales[i] = n;
                }
            }
        }
        if let Some(triggers) = data.get("triggers").and_then(|v| v.as_array()) {
            for t in triggers {
                self.triggers.insert(string_path(t));
            }
        }
        if let Some(tags) = data.get("tags").and_then(|v| v.as_array()) {
            self.tags = tags.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        }
        if let Some(values) = data.get("values").and_then(|v| v.as_table()) {
            for (name, value) in values {
                self.values.push((name.clone(), Immute::from_toml(value)));
            }
        }
        if let Some(settings) = data.get("settings").and_then(|v| v.as_table()) {
            for (name, setting) in settings {
                self.settings.push((name.clone(), string_path(setting)));
            }
        }
    }

    fn collect(&self) -> Collected {
        let mut switches = self.triggers.clone();
        for (_, setting) in &self.settings {
            switches.insert(setting.clone());
        }
        let mut keys = BTreeSet::new();
        for (k, _) in &self.settings {
            keys.insert(k.clone());
        }
        for (k, _) in &self.values {
            keys.insert(k.clone());
        }
        Collected {
            switches,
            programs: BTreeSet::from([self.program_name.clone(), self.program_set.clone()]),
            tags: self.tags.clone(),
            channels: BTreeSet::new(),
            values: self.values.iter().map(|(_, v)| v.clone()).collect(),
            keys,
        }
    }

    fn dump_for_wire(&self, dumper: &Dumper) -> TrackRow {
        let mut settings = self.settings.clone();
        settings.sort_by(|a, b| a.0.cmp(&b.0));
        let mut values = self.values.clone();
        values.sort_by(|a, b| a.0.cmp(&b.0));

        let mut trigger_idx: Vec<usize> = self.triggers.iter().map(|t| dumper.switch_mapping[t]).collect();
        trigger_idx.sort_unstable();
        let mut tag_idx: Vec<usize> = self.tags.iter().map(|t| dumper.tag_mapping[t]).collect();
        tag_idx.sort_unstable();

        let values_keys: Vec<usize> = values.iter().map(|(k, _)| dumper.key_mapping[k]).collect();
        let values_values: Vec<usize> = values.iter().map(|(_, v)| dumper.value_mapping[v]).collect();
        let settings_keys: Vec<usize> = settings.iter().map(|(k, _)| dumper.key_mapping[k]).collect();
        let settings_values: Vec<usize> = settings.iter().map(|(_, s)| dumper.switch_mapping[s]).collect();

        TrackRow {
            program_name: dumper.program_mapping[&self.program_name],
            program_set: dumper.program_mapping[&self.program_set],
            program_version: self.program_version,
            scale_start: self.scales[0],
            scale_end: self.scales[1],
            scale_step: self.scales[2],
            tags: delta(&tag_idx.iter().map(|&i| i as i64).collect::<Vec<_>>()),
            triggers: delta(&trigger_idx.iter().map(|&i| i as i64).collect::<Vec<_>>()),
            values_keys: delta(&values_keys.iter().map(|&i| i as i64).collect::<Vec<_>>()),
            values_values,
            settings_keys: delta(&settings_keys.iter().map(|&i| i as i64).collect::<Vec<_>>()),
            settings_values,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub name: String,
    pub channel: Vec<String>,
    pub triggers: BTreeSet<Vec<String>>,
    pub run: Option<String>,
}

impl Expansion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn ingest_toml(&mut self, data: &toml::Value) {
        if let Some(v) = data.get("name").and_then(|v| v.as_str()) {
            self.name = v.to_string();
        }
        if let Some(v) = data.get("channel") {
            self.channel = string_path(v);
        }
        if let Some(triggers) = data.get("triggers").and_then(|v| v.as_array()) {
            for t in triggers {
                self.triggers.insert(string_path(t));
            }
        }
        if let Some(v) = data.get("run").and_then(|v| v.as_str()) {
            self.run = Some(v.to_string());
        }
    }

    pub fn callback(&self) -> Option<&str> {
        self.run.as_deref()
    }

    fn collect(&self) -> (BTreeSet<Vec<String>>, BTreeSet<Vec<String>>) {
        (self.triggers.clone(), BTreeSet::from([self.channel.clone()]))
    }

    fn dump_for_wire(&self, dumper: &Dumper) -> ExpansionRow {
        let mut trigger_idx: Vec<usize> = self.triggers.iter().map(|t| dumper.switch_mapping[t]).collect();
        trigger_idx.sort_unstable();
        ExpansionRow {
            e_name: self.name.clone(),
            e_channel: dumper.channel_mapping[&self.channel],
            e_triggers: delta(&trigger_idx.iter().map(|&i| i as i64).collect::<Vec<_>>()),
        }
    }
}

#[derive(Default)]
struct Collected {
    switches: BTreeSet<Vec<String>>,
    programs: BTreeSet<String>,
    tags: BTreeSet<String>,
    channels: BTreeSet<Vec<String>>,
    values: BTreeSet<Immute>,
    keys: BTreeSet<String>,
}

impl Collected {
    fn extend(&mut self, other: Collected) {
        self.switches.extend(other.switches);
        self.programs.extend(other.programs);
        self.tags.extend(other.tags);
        self.channels.extend(other.channels);
        self.values.extend(other.values);
        self.keys.extend(other.keys);
    }
}

struct Dumper {
    program_mapping: HashMap<String, usize>,
    key_mapping: HashMap<String, usize>,
    tag_mapping: HashMap<String, usize>,
    value_mapping: HashMap<Immute, usize>,
    switch_mapping: HashMap<Vec<String>, usize>,
    channel_mapping: HashMap<Vec<String>, usize>,
}

struct TrackRow {
    program_name: usize,
    program_set: usize,
    program_version: i64,
    scale_start: i64,
    scale_end: i64,
    scale_step: i64,
    tags: Vec<i64>,
    triggers: Vec<i64>,
    values_keys: Vec<i64>,
    values_values: Vec<usize>,
    settings_keys: Vec<i64>,
    settings_values: Vec<usize>,
}

struct ExpansionRow {
    e_name: String,
    e_channel: usize,
    e_triggers: Vec<i64>,
}

/// A declaratively-loaded collection of tracks and expansions, with
/// include-file resolution and last-writer-wins merge. Mirrors `Tracks`.
#[derive(Default)]
pub struct Tracks {
    tracks: IndexMap<String, Track>,
    expansions: IndexMap<String, Expansion>,
    includes: HashMap<String, toml::Value>,
    /// Pre-serialised expansion-synthesised dumps attached at request
    /// time (`add_cookeds`), emitted alongside the static dump.
    cooked: Vec<CborValue>,
}

impl Tracks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` as the root TOML file, resolving its `include_files`
    /// relative to the file's own directory. Mirrors `Tracks(path=...)`.
    pub fn load(path: &Path) -> Result<Self, TracksError> {
        let mut tracks = Self::new();
        let contents = std::fs::read_to_string(path).map_err(|source| TracksError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let data: toml::Value = toml::from_str(&contents).map_err(|source| TracksError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        tracks.ingest_toml_relative_to(&data, path.parent().unwrap_or_else(|| Path::new(".")), &mut BTreeSet::new())?;
        Ok(tracks)
    }

    pub fn add_track(&mut self, track: Track) {
        self.tracks.insert(track.name.clone(), track);
    }

    pub fn add_cookeds(&mut self, cooked: impl IntoIterator<Item = CborValue>) {
        self.cooked.extend(cooked);
    }

    /// Ingest one already-parsed TOML document with no include-file
    /// resolution (used for expansion-synthesised tracks, which have no
    /// file of their own). For root-file loading with `include_files`
    /// support, use [`Tracks::load`].
    pub fn ingest_toml(&mut self, data: &toml::Value) {
        let mut seen = BTreeSet::new();
        self.ingest_toml_relative_to(data, Path::new("."), &mut seen)
            .expect("include-file-free ingestion cannot fail");
    }

    fn ingest_toml_relative_to(
        &mut self,
        data: &toml::Value,
        base_dir: &Path,
        seen: &mut BTreeSet<PathBuf>,
    ) -> Result<(), TracksError> {
        if let Some(files) = data.get("include_files").and_then(|v| v.as_array()) {
            for file in files {
                if let Some(name) = file.as_str() {
                    let file_path = base_dir.join(name);
                    if !seen.insert(file_path.clone()) {
                        return Err(TracksError::IncludeLoop(file_path));
                    }
                    let contents = std::fs::read_to_string(&file_path).map_err(|source| TracksError::Io {
                        path: file_path.clone(),
                        source,
                    })?;
                    let nested: toml::Value = toml::from_str(&contents).map_err(|source| TracksError::Toml {
                        path: file_path.clone(),
                        source,
                    })?;
                    self.ingest_toml_relative_to(&nested, base_dir, seen)?;
                }
            }
        }
        if let Some(includes) = data.get("include").and_then(|v| v.as_table()) {
            for (name, value) in includes {
                self.includes.insert(name.clone(), value.clone());
            }
        }
        if let Some(track_table) = data.get("track").and_then(|v| v.as_table()) {
            for (name, track_data) in track_table {
                let mut track = Track::new(name.clone());
                track.ingest_toml(track_data, &self.includes);
                self.tracks.insert(name.clone(), track);
            }
        }
        if let Some(expansion_table) = data.get("expansion").and_then(|v| v.as_table()) {
            for (name, expansion_data) in expansion_table {
                let mut expansion = Expansion::new(name.clone());
                expansion.ingest_toml(expansion_data);
                self.expansions.insert(name.clone(), expansion);
            }
        }
        Ok(())
    }

    /// Later additions override earlier ones by name; mirrors the
    /// literal semantics of `Tracks.merge` (`self._tracks.update(other._tracks)`):
    /// entries in `other` win over `self`'s for shared names, new names
    /// from `other` are appended at their first-seen position.
    pub fn merge(&mut self, other: Tracks) {
        for (name, track) in other.tracks {
            self.tracks.insert(name, track);
        }
        for (name, expansion) in other.expansions {
            self.expansions.insert(name, expansion);
        }
    }

    pub fn get_expansion(&self, name: &str) -> Option<&Expansion> {
        self.expansions.get(name)
    }

    fn collect(&self) -> Collected {
        let mut collected = Collected::default();
        for track in self.tracks.values() {
            collected.extend(track.collect());
        }
        for expansion in self.expansions.values() {
            let (switches, channels) = expansion.collect();
            collected.switches.extend(switches);
            collected.channels.extend(channels);
        }
        collected
    }

    /// The flattened columnar wire dump: the static dump (if any tracks
    /// are declared) followed by any cooked/synthesised dumps. Mirrors
    /// `Tracks.dump_for_wire`.
    pub fn dump_for_wire(&self) -> Vec<CborValue> {
        let mut out = Vec::new();
        if let Some(dump) = self.build_dump() {
            out.push(dump);
        }
        out.extend(self.cooked.iter().cloned());
        out
    }

    fn build_dump(&self) -> Option<CborValue> {
        if self.tracks.is_empty() {
            return None;
        }
        let collected = self.collect();

        let channels: Vec<Vec<String>> = collected.channels.into_iter().collect();
        let (channel_idx, channel_mapping) = prefix_encode(&channels);
        let switches: Vec<Vec<String>> = collected.switches.into_iter().collect();
        let (switch_tree, switch_mapping) = prefix_encode(&switches);
        let (program_list, program_mapping) = build_map(collected.programs.into_iter().collect());
        let (key_list, key_mapping) = build_map(collected.keys.into_iter().collect());
        let (tag_list, tag_mapping) = build_map(collected.tags.into_iter().collect());
        let (value_list, value_mapping) = build_map(collected.values.into_iter().collect());

        let dumper = Dumper {
            program_mapping,
            key_mapping,
            tag_mapping,
            value_mapping,
            switch_mapping,
            channel_mapping,
        };

        let mut rows: Vec<(&String, TrackRow)> =
            self.tracks.iter().map(|(name, track)| (name, track.dump_for_wire(&dumper))).collect();
        rows.sort_by_key(|(_, row)| row.scale_start);

        let mut expansion_rows: Vec<(&String, ExpansionRow)> = self
            .expansions
            .iter()
            .map(|(name, expansion)| (name, expansion.dump_for_wire(&dumper)))
            .collect();
        expansion_rows.sort_by_key(|(_, row)| row.e_channel);

        let program_version: Vec<i64> = delta(&rows.iter().map(|(_, r)| r.program_version).collect::<Vec<_>>());

        let mut map: Vec<(CborValue, CborValue)> = Vec::new();
        let text = |s: &str| CborValue::Text(s.to_string());
        let int_list = |xs: &[i64]| CborValue::Array(xs.iter().map(|&x| CborValue::Integer(x.into())).collect());
        let usize_list = |xs: &[usize]| CborValue::Array(xs.iter().map(|&x| CborValue::Integer(x.into())).collect());

        map.push((
            text("program_name"),
            usize_list(&rows.iter().map(|(_, r)| r.program_name).collect::<Vec<_>>()),
        ));
        map.push((
            text("program_set"),
            usize_list(&rows.iter().map(|(_, r)| r.program_set).collect::<Vec<_>>()),
        ));
        map.push((text("program_version"), int_list(&program_version)));
        map.push((
            text("scale_start"),
            int_list(&rows.iter().map(|(_, r)| r.scale_start).collect::<Vec<_>>()),
        ));
        map.push((
            text("scale_end"),
            int_list(&rows.iter().map(|(_, r)| r.scale_end).collect::<Vec<_>>()),
        ));
        map.push((
            text("scale_step"),
            int_list(&rows.iter().map(|(_, r)| r.scale_step).collect::<Vec<_>>()),
        ));
        map.push((
            text("tags"),
            CborValue::Array(rows.iter().map(|(_, r)| int_list(&r.tags)).collect()),
        ));
        map.push((
            text("triggers"),
            CborValue::Array(rows.iter().map(|(_, r)| int_list(&r.triggers)).collect()),
        ));
        map.push((
            text("values-keys"),
            CborValue::Array(rows.iter().map(|(_, r)| int_list(&r.values_keys)).collect()),
        ));
        map.push((
            text("values-values"),
            CborValue::Array(rows.iter().map(|(_, r)| usize_list(&r.values_values)).collect()),
        ));
        map.push((
            text("settings-keys"),
            CborValue::Array(rows.iter().map(|(_, r)| int_list(&r.settings_keys)).collect()),
        ));
        map.push((
            text("settings-values"),
            CborValue::Array(rows.iter().map(|(_, r)| usize_list(&r.settings_values)).collect()),
        ));

        map.push((
            text("e-name"),
            CborValue::Array(expansion_rows.iter().map(|(_, r)| text(&r.e_name)).collect()),
        ));
        map.push((
            text("e-channel"),
            usize_list(&expansion_rows.iter().map(|(_, r)| r.e_channel).collect::<Vec<_>>()),
        ));
        map.push((
            text("e-triggers"),
            CborValue::Array(expansion_rows.iter().map(|(_, r)| int_list(&r.e_triggers)).collect()),
        ));

        map.push((
            text("switch_idx"),
            CborValue::Array(
                switch_tree
                    .iter()
                    .map(|(delta, suffix)| {
                        CborValue::Array(vec![
                            CborValue::Integer((*delta).into()),
                            CborValue::Array(suffix.iter().cloned().map(CborValue::Text).collect()),
                        ])
                    })
                    .collect(),
            ),
        ));
        map.push((
            text("channel_idx"),
            CborValue::Array(
                channel_idx
                    .iter()
                    .map(|(delta, suffix)| {
                        CborValue::Array(vec![
                            CborValue::Integer((*delta).into()),
                            CborValue::Array(suffix.iter().cloned().map(CborValue::Text).collect()),
                        ])
                    })
                    .collect(),
            ),
        ));
        map.push((text("program_idx"), CborValue::Array(program_list.into_iter().map(CborValue::Text).collect())));
        map.push((text("tag_idx"), CborValue::Array(tag_list.into_iter().map(CborValue::Text).collect())));
        map.push((text("key_idx"), CborValue::Array(key_list.into_iter().map(CborValue::Text).collect())));
        map.push((text("value_idx"), CborValue::Array(value_list.iter().map(Immute::to_wire).collect())));

        Some(CborValue::Map(map))
    }
}
