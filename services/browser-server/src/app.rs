//! Boot-time wiring: turns a loaded [`crate::config::Settings`] into a
//! running [`browser_core::engine::PacketEngine`].
//!
//! No concrete species database, file resolver, KV client, metrics
//! transport, or jump index ships in this workspace (spec.md §1 scopes
//! them as external collaborators); this module wires the `Empty*`/
//! `Null*` stand-ins browser-core provides for each trait seam, the same
//! way its own unit tests do. A real deployment swaps these for concrete
//! impls behind the same traits without touching anything downstream.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use browser_core::accessor::{BundleCatalog, DataAccessor, EmptyFileResolver};
use browser_core::bundle_router::{
    BootstrapHandler, EmptyJumpResolver, ExpansionHandler, JumpHandler, MetricHandler, ProgramHandler, StickAuthorityHandler,
    StickHandler,
};
use browser_core::cache::{Bump, Cache, NullCacheDriver};
use browser_core::data_router::DataRouterBuilder;
use browser_core::engine::PacketEngineBuilder;
use browser_core::expansion::ExpansionRegistry;
use browser_core::metrics::NullMetricsSink;
use browser_core::programs::AllProgramSpecs;
use browser_core::remote::{OverrideTable, RemoteDelegator};
use browser_core::species::EmptySpeciesRegistry;
use browser_core::tracks::Tracks;
use browser_protocol::{Channel, RequestKind};

use crate::config::Settings;

/// Builds the shared [`DataAccessor`] plus a wired [`PacketEngine`] from
/// `settings`. Called once at process start by `main`.
pub fn build_engine(settings: &Settings) -> browser_core::engine::PacketEngine {
    let accessor = DataAccessor {
        species: Arc::new(EmptySpeciesRegistry),
        resolver: Arc::new(EmptyFileResolver),
        cache: Arc::new(Cache::new(Arc::new(NullCacheDriver))),
        bundles: Arc::new(BundleCatalog::new()),
        tracks: Arc::new(Tracks::new()),
        programs: Arc::new(AllProgramSpecs::new()),
        expansions: Arc::new(ExpansionRegistry::new()),
    };

    let mut override_table = OverrideTable::new();
    for rule in &settings.remote_overrides {
        override_table.add_rule(rule.prefix.clone(), rule.peer_base_url.clone());
    }
    let remote = RemoteDelegator::new(override_table);

    let restart_token = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string());
    let bump = Bump::new(settings.cache_prefix.clone(), settings.bump_on_restart, &restart_token);

    let mut builder = PacketEngineBuilder::new(settings.supported_versions.clone());
    builder
        .register_for_all_versions(
            RequestKind::Boot.to_u8(),
            Arc::new(BootstrapHandler { supported_versions: settings.supported_versions.clone() }),
        )
        .register_for_all_versions(RequestKind::Program.to_u8(), Arc::new(ProgramHandler))
        .register_for_all_versions(RequestKind::Stick.to_u8(), Arc::new(StickHandler))
        .register_for_all_versions(RequestKind::StickAuthority.to_u8(), Arc::new(StickAuthorityHandler))
        .register_for_all_versions(RequestKind::Jump.to_u8(), Arc::new(JumpHandler { resolver: Arc::new(EmptyJumpResolver) }))
        .register_for_all_versions(RequestKind::Metric.to_u8(), Arc::new(MetricHandler { sink: Arc::new(NullMetricsSink) }))
        .register_for_all_versions(RequestKind::Expansion.to_u8(), Arc::new(ExpansionHandler));

    let data_router = DataRouterBuilder::new().build(&settings.supported_versions);
    builder.register_data_router(data_router, bump, RequestKind::Data.to_u8());

    let default_channel = Channel { scheme: settings.default_channel_scheme, value: settings.default_channel_value.clone() };

    builder.build(accessor, remote, Arc::new(NullMetricsSink), default_channel)
}
