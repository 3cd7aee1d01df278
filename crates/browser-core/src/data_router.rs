//! `kind=4` data requests: fingerprint, cache probe, endpoint dispatch,
//! columnar encode, cache store.
//!
//! Grounded on `original_source/backend-server/app/command/datacmd.py`
//! (`DataHandler.process`: payload `(channel, name, panel[, scope])`,
//! memcached get/store around the handler call, per-endpoint runtime
//! metric) and the illustrative endpoint set in
//! `original_source/backend-server/app/data/gc.py` (wiggle coverage),
//! `sequence.py` (zoomed sequence letters) and `contig.py` (contig
//! banding) — not the full historical endpoint catalogue, which spec.md
//! §9 leaves as an open question answered in DESIGN.md.
//!
//! `DataEndpoint` generalises the original's ad hoc per-module
//! `process_data(data_accessor, panel, scope, accept)` functions into one
//! trait, the same seam [`crate::handler::Handler`] provides for
//! sub-command kinds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use ciborium::value::Value;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::io::Write;

use browser_dataalg::{Column, encode as dataalg_encode};

use crate::accessor::DataAccessor;
use crate::cache::Bump;
use crate::error::DataError;
use crate::fingerprint::{self, FingerprintInput};
use crate::metrics::ResponseMetrics;
use crate::panel::Panel;
use crate::scope::Scope;

/// One data endpoint's result: a set of named, tagged columns plus the
/// `__invariant` flag the client uses to decide whether a response may
/// be reused across nearby panels (spec.md §4.7).
#[derive(Debug, Default)]
pub struct DataOutput {
    columns: Vec<(String, String, Column)>,
    invariant: bool,
}

impl DataOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, encoded with `tag` unless the request's `accept`
    /// mode calls for the raw passthrough form (`accept: "dump"`).
    pub fn with_column(mut self, name: impl Into<String>, tag: impl Into<String>, column: Column) -> Self {
        self.columns.push((name.into(), tag.into(), column));
        self
    }

    pub fn with_invariant(mut self, invariant: bool) -> Self {
        self.invariant = invariant;
        self
    }
}

/// Implemented by each named data endpoint (`"gc"`, `"zoomed-seq"`,
/// `"contig"`, ...). Mirrors the original's per-module
/// `process_data(data_accessor, panel, scope, accept)` functions.
#[async_trait]
pub trait DataEndpoint: Send + Sync {
    async fn process_data(
        &self,
        accessor: &DataAccessor,
        panel: &Panel,
        scope: &Scope,
        accept: &str,
    ) -> Result<DataOutput, DataError>;
}

struct Registration {
    endpoint: Arc<dyn DataEndpoint>,
    min_version: u32,
}

/// `(name, version) -> DataEndpoint`, precomputed at boot the way
/// [`crate::handler::HandlerRegistry`] precomputes `(version, kind) ->
/// Handler`: for each configured version, the endpoint registered under
/// that name with the greatest `min_version <= version`.
#[derive(Default)]
pub struct DataRouterBuilder {
    by_name: HashMap<String, Vec<Registration>>,
}

impl DataRouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, min_version: u32, endpoint: Arc<dyn DataEndpoint>) -> &mut Self {
        self.by_name.entry(name.into()).or_default().push(Registration { endpoint, min_version });
        self
    }

    /// Build the dense per-version index. `known_versions` should list
    /// every `egs` version the deployment otherwise supports (the same
    /// set registered in [`crate::handler::HandlerRegistry`]); a version
    /// not covered here falls back to whichever row the greatest
    /// registered `min_version` resolves to.
    pub fn build(mut self, known_versions: &[u32]) -> DataRouter {
        for registrations in self.by_name.values_mut() {
            registrations.sort_by_key(|r| r.min_version);
        }
        let mut versions: Vec<u32> = known_versions.to_vec();
        versions.extend(self.by_name.values().flat_map(|rs| rs.iter().map(|r| r.min_version)));
        versions.sort_unstable();
        versions.dedup();
        let max_version = versions.last().copied().unwrap_or(0);

        let mut resolved: Vec<HashMap<String, Arc<dyn DataEndpoint>>> = Vec::with_capacity(max_version as usize + 1);
        for v in 0..=max_version {
            let mut row = HashMap::new();
            for (name, registrations) in &self.by_name {
                if let Some(best) = registrations.iter().filter(|r| r.min_version <= v).last() {
                    row.insert(name.clone(), best.endpoint.clone());
                }
            }
            resolved.push(row);
        }
        DataRouter { resolved }
    }
}

pub struct DataRouter {
    resolved: Vec<HashMap<String, Arc<dyn DataEndpoint>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accept {
    Default,
    Uncompressed,
    Dump,
}

impl Accept {
    fn parse(accept: &str) -> Self {
        match accept {
            "uncompressed" => Accept::Uncompressed,
            "dump" => Accept::Dump,
            _ => Accept::Default,
        }
    }
}

impl DataRouter {
    pub fn resolve(&self, egs_version: u32, name: &str) -> Option<Arc<dyn DataEndpoint>> {
        let row = self.resolved.get(egs_version as usize).or_else(|| self.resolved.last())?;
        row.get(name).cloned()
    }

    /// Run one data request end to end: fingerprint, cache probe,
    /// endpoint dispatch on miss, columnar encode, cache store. Returns
    /// the already-wrapped `[kind, payload]` response bytes, matching
    /// `DataHandler.process`'s cache-hit/miss shapes (spec.md §4.7).
    #[allow(clippy::too_many_arguments)]
    pub async fn process(
        &self,
        accessor: &DataAccessor,
        bump: &Bump,
        channel_scheme: u32,
        channel_value: &str,
        egs_version: u32,
        endpoint: &str,
        panel: &Panel,
        scope: &Scope,
        accept: &str,
        metrics: &ResponseMetrics,
        kind: u8,
    ) -> Vec<u8> {
        let panel_bytes = panel.dumps();
        let input = FingerprintInput {
            channel_scheme,
            channel_value,
            endpoint,
            panel_bytes: &panel_bytes,
            scope: scope.to_value(),
            accept,
        };
        let bump_value = bump.current(&accessor.cache).await;
        let key = fingerprint::compute(bump.prefix(), &bump_value, egs_version, &input);

        if let Some(cached) = accessor.cache.get_data(&key).await {
            metrics.record_cache_hit(cached.len() as u64);
            return wrap_kind(kind, cached);
        }

        let Some(handler) = self.resolve(egs_version, endpoint) else {
            return wrap_kind(kind, encode_error(&format!("unknown data endpoint: {endpoint}")));
        };

        let start = Instant::now();
        let result = handler.process_data(accessor, panel, scope, accept).await;
        let elapsed = start.elapsed().as_secs_f64();
        metrics.record_runtime(endpoint, panel.scale, elapsed);

        let payload = match result {
            Ok(output) => encode_output(output, Accept::parse(accept)),
            Err(err) => encode_error(&err.to_string()),
        };
        metrics.record_cache_miss(payload.len() as u64);
        accessor.cache.store_data(&key, payload.clone()).await;
        wrap_kind(kind, payload)
    }
}

/// `accept: "dump"` skips the tag's byte-encoding arm entirely (a raw
/// passthrough of typed columns, for debugging) and skips the outer
/// zlib compression; `accept: "uncompressed"` keeps normal encoding but
/// skips zlib; the default compresses (spec.md §4.7).
fn encode_output(output: DataOutput, accept: Accept) -> Vec<u8> {
    let mut map = Vec::with_capacity(output.columns.len());
    for (name, tag, column) in output.columns {
        let tag = if accept == Accept::Dump { raw_tag_for(&column) } else { tag };
        match dataalg_encode(&tag, column) {
            Ok(expr) => map.push((Value::Text(name), to_cbor_value(&expr))),
            Err(err) => map.push((Value::Text(name), Value::Text(format!("encode error: {err}")))),
        }
    }
    let data = Value::Map(map);
    let mut cbor_bytes = Vec::new();
    ciborium::ser::into_writer(&data, &mut cbor_bytes).expect("data map always encodes");

    let body = if accept == Accept::Default {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&cbor_bytes).expect("zlib write never fails on a Vec sink");
        encoder.finish().expect("zlib finish never fails on a Vec sink")
    } else {
        cbor_bytes
    };

    let envelope = Value::Map(vec![
        (Value::Text("data".into()), Value::Bytes(body)),
        (Value::Text("__invariant".into()), Value::Bool(output.invariant)),
    ]);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&envelope, &mut out).expect("envelope always encodes");
    out
}

fn raw_tag_for(column: &Column) -> String {
    match column {
        Column::Numbers(_) => "NA".to_string(),
        Column::Strings(_) => "SA".to_string(),
        Column::Booleans(_) => "BA".to_string(),
    }
}

fn encode_error(message: &str) -> Vec<u8> {
    let envelope = Value::Map(vec![(Value::Text("error".into()), Value::Text(message.to_string()))]);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&envelope, &mut out).expect("error envelope always encodes");
    out
}

fn wrap_kind(kind: u8, body: Vec<u8>) -> Vec<u8> {
    use browser_protocol::Writer;
    let mut w = Writer::new();
    w.write_array_header(2);
    w.write_uint(kind as u64);
    w.write_raw(&body);
    w.into_bytes()
}

/// Round-trip a `Serialize` value through CBOR bytes into a dynamic
/// [`Value`]; `browser-dataalg` deliberately doesn't depend on
/// `ciborium`, so this is the conversion seam between its typed
/// `TaggedExpression` and the rest of the packet's `Value` tree.
fn to_cbor_value<T: serde::Serialize>(value: &T) -> Value {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).expect("value always encodes");
    ciborium::de::from_reader(buf.as_slice()).expect("just-encoded bytes always decode")
}

/// Illustrative endpoints grounded one-for-one in
/// `original_source/backend-server/app/data/*.py`. They prove the
/// `DataEndpoint` seam end to end rather than reimplementing the full
/// historical v14-v16 catalogue (spec.md §9's open question; see
/// DESIGN.md).
pub mod endpoints {
    use super::*;
    use browser_dataalg::{delta, zigzag};

    /// Dense per-base coverage, grounded on `gc.py::WiggleDataHandler`:
    /// fetch wiggle values for the panel's region, delta+zigzag encode.
    pub struct WiggleCoverageEndpoint;

    #[async_trait]
    impl DataEndpoint for WiggleCoverageEndpoint {
        async fn process_data(
            &self,
            accessor: &DataAccessor,
            panel: &Panel,
            scope: &Scope,
            _accept: &str,
        ) -> Result<DataOutput, DataError> {
            let datafile = scope.datafile.as_deref().ok_or(DataError::MissingDatafile)?;
            let values = accessor.resolver.wiggle_values(datafile, &panel.stick, panel.start, panel.end).await?;
            let scaled: Vec<i64> = values.iter().map(|v| v.round() as i64).collect();
            let deltas = delta(&scaled);
            let zigzagged: Vec<i64> = zigzag(&deltas).into_iter().map(|z| z as i64).collect();
            let range = vec![panel.start as i64, panel.end as i64];
            Ok(DataOutput::new()
                .with_column("values", "NRL", Column::Numbers(zigzagged))
                .with_column("range", "NRL", Column::Numbers(range))
                .with_invariant(false))
        }
    }

    /// Per-base sequence letters in the panel's region, grounded on
    /// `sequence.py::sequence_blocks`: classify letters into a
    /// dictionary-encoded string column, and positions into a
    /// delta+zigzag numeric column.
    pub struct ZoomedSequenceEndpoint;

    #[async_trait]
    impl DataEndpoint for ZoomedSequenceEndpoint {
        async fn process_data(
            &self,
            accessor: &DataAccessor,
            panel: &Panel,
            scope: &Scope,
            _accept: &str,
        ) -> Result<DataOutput, DataError> {
            let datafile = scope.datafile.as_deref().ok_or(DataError::MissingDatafile)?;
            let bytes = accessor.resolver.sequence(datafile, &panel.stick, panel.start, panel.end).await?;
            let mut positions = Vec::new();
            let mut letters = Vec::new();
            for (offset, byte) in bytes.iter().enumerate() {
                let letter = (*byte as char).to_ascii_uppercase();
                if matches!(letter, 'C' | 'G' | 'A' | 'T') {
                    positions.push(panel.start as i64 + offset as i64);
                    letters.push(letter.to_string());
                }
            }
            Ok(DataOutput::new()
                .with_column("seq_starts", "NDZRL", Column::Numbers(positions))
                .with_column("letters", "SYRLZ", Column::Strings(letters))
                .with_invariant(true))
        }
    }

    /// Contig banding, grounded on `contig.py::ContigDataHandler`: record
    /// sense/strand per contig feature in the panel's region.
    pub struct ContigEndpoint;

    #[async_trait]
    impl DataEndpoint for ContigEndpoint {
        async fn process_data(
            &self,
            accessor: &DataAccessor,
            panel: &Panel,
            scope: &Scope,
            _accept: &str,
        ) -> Result<DataOutput, DataError> {
            let datafile = scope.datafile.as_deref().ok_or(DataError::MissingDatafile)?;
            let records = accessor.resolver.records(datafile, &panel.stick, panel.start, panel.end).await?;
            let senses: Vec<bool> = records.iter().map(|r| r.strand.unwrap_or(true)).collect();
            let mut starts = Vec::with_capacity(records.len());
            let mut ends = Vec::with_capacity(records.len());
            for record in &records {
                starts.push(record.start as i64);
                ends.push(record.end as i64);
            }
            Ok(DataOutput::new()
                .with_column("sense", "B", Column::Booleans(senses))
                .with_column("starts", "NDZRL", Column::Numbers(starts))
                .with_column("ends", "NDZRL", Column::Numbers(ends))
                .with_invariant(false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::endpoints::*;
    use super::*;
    use crate::accessor::{EmptyFileResolver, FileRecord, FileResolver};
    use crate::bundle::BundleSet;
    use crate::cache::{Cache, NullCacheDriver};
    use crate::expansion::ExpansionRegistry;
    use crate::programs::AllProgramSpecs;
    use crate::species::EmptySpeciesRegistry;
    use crate::tracks::Tracks;

    struct StaticResolver;

    #[async_trait]
    impl FileResolver for StaticResolver {
        async fn wiggle_values(&self, _datafile: &str, _stick: &str, start: u64, end: u64) -> Result<Vec<f32>, DataError> {
            Ok(vec![1.0; (end - start) as usize])
        }
        async fn records(&self, _datafile: &str, _stick: &str, _start: u64, _end: u64) -> Result<Vec<FileRecord>, DataError> {
            Ok(vec![FileRecord { start: 10, end: 20, name: "contig-1".into(), score: 0.0, strand: Some(true) }])
        }
        async fn sequence(&self, _datafile: &str, _stick: &str, start: u64, end: u64) -> Result<Vec<u8>, DataError> {
            Ok(vec![b'A'; (end - start) as usize])
        }
    }

    fn accessor(resolver: Arc<dyn crate::accessor::FileResolver>) -> DataAccessor {
        DataAccessor {
            species: Arc::new(EmptySpeciesRegistry),
            resolver,
            cache: Arc::new(Cache::new(Arc::new(NullCacheDriver))),
            bundles: Arc::new(crate::accessor::BundleCatalog::new()),
            tracks: Arc::new(Tracks::new()),
            programs: Arc::new(AllProgramSpecs::new()),
            expansions: Arc::new(ExpansionRegistry::new()),
        }
    }

    fn scope_with_datafile() -> Scope {
        let mut scope = Scope::default();
        scope.datafile = Some("demo.bw".into());
        scope
    }

    fn router() -> DataRouter {
        let mut builder = DataRouterBuilder::new();
        builder.register("gc", 14, Arc::new(WiggleCoverageEndpoint));
        builder.register("zoomed-seq", 14, Arc::new(ZoomedSequenceEndpoint));
        builder.register("contig", 14, Arc::new(ContigEndpoint));
        builder.build(&[14, 15])
    }

    #[test]
    fn resolves_registered_endpoints_by_name_and_version() {
        let router = router();
        assert!(router.resolve(14, "gc").is_some());
        assert!(router.resolve(15, "gc").is_some());
        assert!(router.resolve(14, "missing").is_none());
    }

    #[test]
    fn unversioned_lookup_past_the_max_falls_back_to_the_last_row() {
        let router = router();
        assert!(router.resolve(99, "gc").is_some());
    }

    #[tokio::test]
    async fn wiggle_endpoint_requires_a_datafile() {
        let acc = accessor(Arc::new(EmptyFileResolver));
        let panel = Panel::new("chr1".into(), 2, 0);
        let err = WiggleCoverageEndpoint.process_data(&acc, &panel, &Scope::default(), "").await.unwrap_err();
        assert!(matches!(err, DataError::MissingDatafile));
    }

    #[tokio::test]
    async fn wiggle_endpoint_encodes_deltas_and_range() {
        let acc = accessor(Arc::new(StaticResolver));
        let panel = Panel::new("chr1".into(), 2, 1);
        let output = WiggleCoverageEndpoint.process_data(&acc, &panel, &scope_with_datafile(), "").await.unwrap();
        assert_eq!(output.columns.len(), 2);
        assert!(!output.invariant);
    }

    #[tokio::test]
    async fn sequence_endpoint_keeps_only_cgat_letters() {
        let acc = accessor(Arc::new(StaticResolver));
        let panel = Panel::new("chr1".into(), 2, 0);
        let output = ZoomedSequenceEndpoint.process_data(&acc, &panel, &scope_with_datafile(), "").await.unwrap();
        let (_, _, letters) = &output.columns[1];
        let Column::Strings(values) = letters else { panic!() };
        assert!(values.iter().all(|s| s == "A"));
    }

    #[tokio::test]
    async fn data_router_wraps_unknown_endpoint_as_an_error_payload() {
        let acc = accessor(Arc::new(EmptyFileResolver));
        let router = router();
        let bump = Bump::new("gb", false, "");
        let metrics = ResponseMetrics::new("low");
        let panel = Panel::new("chr1".into(), 2, 0);
        let bytes = router
            .process(&acc, &bump, 0, "u", 14, "nonexistent", &panel, &Scope::default(), "", &metrics, 4)
            .await;
        assert!(!bytes.is_empty());
    }

    #[tokio::test]
    async fn data_router_caches_the_second_identical_request() {
        let acc = DataAccessor {
            species: Arc::new(EmptySpeciesRegistry),
            resolver: Arc::new(StaticResolver),
            cache: Arc::new(Cache::new(Arc::new(crate::cache::tests_support::AvailableDriver::default()))),
            bundles: Arc::new(crate::accessor::BundleCatalog::new()),
            tracks: Arc::new(Tracks::new()),
            programs: Arc::new(AllProgramSpecs::new()),
            expansions: Arc::new(ExpansionRegistry::new()),
        };
        acc.cache.mark_available_for_test();
        let router = router();
        let bump = Bump::new("gb", false, "");
        let metrics = ResponseMetrics::new("low");
        let panel = Panel::new("chr1".into(), 2, 0);
        let first = router
            .process(&acc, &bump, 0, "u", 14, "gc", &panel, &scope_with_datafile(), "", &metrics, 4)
            .await;
        let second = router
            .process(&acc, &bump, 0, "u", 14, "gc", &panel, &scope_with_datafile(), "", &metrics, 4)
            .await;
        assert_eq!(first, second);
    }

    // Unused with `BundleSet` left only to document that `Response::add_bundle`
    // is how a data endpoint would attach an accompanying bundle, not through
    // `DataOutput` itself (no illustrative endpoint here needs one).
    #[allow(dead_code)]
    fn _bundle_seam_is_on_response_not_data_output(_: BundleSet) {}
}
