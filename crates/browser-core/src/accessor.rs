//! `DataAccessor`: the façade handlers use to reach the registries and
//! external collaborators built once at boot.
//!
//! Grounded on `original_source/backend-server/app/command/datasources.py`'s
//! `DataAccessor` (granting `resolver`, `data_model`, `cache`) and
//! `command/begs.py`'s `BegsFiles` (the boot/program bundle catalog),
//! generalised across protocol versions the way `controlcmds.py`'s
//! `BootstrapHandler`/`StickAuthorityHandler` call it
//! (`begs_files.boot_program(version)`, `.all_bundles(version)`,
//! `.versions()`, `.authority_startup_program(version)`) — `begs.py`
//! itself is single-version; SPEC_FULL's `BundleCatalog` adds the
//! per-`egs`-version dimension those call sites require.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bundle::Bundle;
use crate::cache::Cache;
use crate::error::DataError;
use crate::expansion::ExpansionRegistry;
use crate::programs::AllProgramSpecs;
use crate::species::SpeciesRegistry;
use crate::tracks::Tracks;

/// A scientific-file record returned by a region query (BED-like
/// feature); wiggle/coverage queries instead return a dense value
/// vector. Mirrors the shape `original_source/.../app/model/bigbed.py`
/// extracts per feature.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub start: u64,
    pub end: u64,
    pub name: String,
    pub score: f32,
    pub strand: Option<bool>,
}

/// The bigbed/bigwig/indexed-sequence file reader seam (spec.md §1's
/// "Out of scope... given a stick, start, end, return records/wiggle
/// values").
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn wiggle_values(&self, datafile: &str, stick: &str, start: u64, end: u64) -> Result<Vec<f32>, DataError>;
    async fn records(&self, datafile: &str, stick: &str, start: u64, end: u64) -> Result<Vec<FileRecord>, DataError>;
    async fn sequence(&self, datafile: &str, stick: &str, start: u64, end: u64) -> Result<Vec<u8>, DataError>;
}

/// A resolver with no configured files; useful for tests and as the
/// zero-configuration default.
pub struct EmptyFileResolver;

#[async_trait]
impl FileResolver for EmptyFileResolver {
    async fn wiggle_values(&self, datafile: &str, _stick: &str, _start: u64, _end: u64) -> Result<Vec<f32>, DataError> {
        Err(DataError::message(format!("no such datafile: {datafile}")))
    }
    async fn records(&self, datafile: &str, _stick: &str, _start: u64, _end: u64) -> Result<Vec<FileRecord>, DataError> {
        Err(DataError::message(format!("no such datafile: {datafile}")))
    }
    async fn sequence(&self, datafile: &str, _stick: &str, _start: u64, _end: u64) -> Result<Vec<u8>, DataError> {
        Err(DataError::message(format!("no such datafile: {datafile}")))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unsupported egs version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Default)]
struct VersionCatalog {
    boot_bundles: Vec<Arc<Bundle>>,
    all_bundles: Vec<Arc<Bundle>>,
    by_channel_name: HashMap<String, Arc<Bundle>>,
    authority_startup: Option<String>,
    authority_lookup: Option<String>,
    authority_jump: Option<String>,
}

/// The boot/program bundle catalog, one entry per supported `egs`
/// version. Mirrors `BegsFiles` generalised across versions.
#[derive(Default)]
pub struct BundleCatalog {
    by_version: HashMap<u32, VersionCatalog>,
}

impl BundleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_version(&mut self, egs_version: u32) {
        self.by_version.entry(egs_version).or_default();
    }

    pub fn add_boot_bundle(&mut self, egs_version: u32, bundle: Arc<Bundle>) {
        self.by_version.entry(egs_version).or_default().boot_bundles.push(bundle);
    }

    pub fn add_bundle(&mut self, egs_version: u32, channel_name: &str, bundle: Arc<Bundle>) {
        let entry = self.by_version.entry(egs_version).or_default();
        entry.by_channel_name.insert(channel_name.to_string(), bundle.clone());
        if !entry.all_bundles.iter().any(|b| Arc::ptr_eq(b, &bundle)) {
            entry.all_bundles.push(bundle);
        }
    }

    pub fn set_stick_authority(&mut self, egs_version: u32, startup: &str, lookup: &str, jump: &str) {
        let entry = self.by_version.entry(egs_version).or_default();
        entry.authority_startup = Some(startup.to_string());
        entry.authority_lookup = Some(lookup.to_string());
        entry.authority_jump = Some(jump.to_string());
    }

    pub fn versions(&self) -> Vec<u32> {
        let mut versions: Vec<u32> = self.by_version.keys().copied().collect();
        versions.sort_unstable();
        versions
    }

    pub fn boot_bundles(&self, egs_version: u32) -> Result<Vec<Arc<Bundle>>, CatalogError> {
        self.by_version
            .get(&egs_version)
            .map(|v| v.boot_bundles.clone())
            .ok_or(CatalogError::UnsupportedVersion(egs_version))
    }

    pub fn all_bundles(&self, egs_version: u32) -> Result<Vec<Arc<Bundle>>, CatalogError> {
        self.by_version
            .get(&egs_version)
            .map(|v| v.all_bundles.clone())
            .ok_or(CatalogError::UnsupportedVersion(egs_version))
    }

    pub fn find_bundle(&self, egs_version: u32, channel_name: &str) -> Result<Option<Arc<Bundle>>, CatalogError> {
        self.by_version
            .get(&egs_version)
            .map(|v| v.by_channel_name.get(channel_name).cloned())
            .ok_or(CatalogError::UnsupportedVersion(egs_version))
    }

    pub fn stick_authority_programs(
        &self,
        egs_version: u32,
    ) -> Result<(Option<String>, Option<String>, Option<String>), CatalogError> {
        self.by_version
            .get(&egs_version)
            .map(|v| (v.authority_startup.clone(), v.authority_lookup.clone(), v.authority_jump.clone()))
            .ok_or(CatalogError::UnsupportedVersion(egs_version))
    }
}

/// The façade every `Handler` impl receives via [`crate::handler::HandlerContext`].
/// Built once at boot; all fields are immutable shared references for the
/// life of the process, per spec.md §3's ownership note.
pub struct DataAccessor {
    pub species: Arc<dyn SpeciesRegistry>,
    pub resolver: Arc<dyn FileResolver>,
    pub cache: Arc<Cache>,
    pub bundles: Arc<BundleCatalog>,
    pub tracks: Arc<Tracks>,
    pub programs: Arc<AllProgramSpecs>,
    pub expansions: Arc<ExpansionRegistry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_version_is_reported_as_unsupported() {
        let catalog = BundleCatalog::new();
        assert!(matches!(catalog.versions().is_empty(), true));
        assert!(matches!(catalog.all_bundles(14), Err(CatalogError::UnsupportedVersion(14))));
    }

    #[test]
    fn find_bundle_resolves_by_channel_name() {
        let mut catalog = BundleCatalog::new();
        let bundle = Arc::new(Bundle::new("transcripts", "transcripts.begs".into(), 14));
        catalog.add_bundle(14, "transcripts", bundle.clone());
        let found = catalog.find_bundle(14, "transcripts").unwrap();
        assert!(found.is_some());
        assert!(catalog.find_bundle(14, "missing").unwrap().is_none());
    }

    #[test]
    fn versions_are_reported_sorted() {
        let mut catalog = BundleCatalog::new();
        catalog.register_version(15);
        catalog.register_version(14);
        assert_eq!(catalog.versions(), vec![14, 15]);
    }
}
