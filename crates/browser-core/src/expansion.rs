//! Runtime track synthesis: invoking an [`crate::tracks::Expansion`]'s
//! declared callback with a client-supplied `step` string.
//!
//! Grounded on `original_source/backend-server/app/model/tracks.py::Expansion`
//! (the `run` field names a Python-style callback) and the `kind=7`
//! `ExpansionHandler` contract from spec.md §4.8. The original resolves
//! `run` by name through Python's module/function namespace; here that
//! becomes an explicit registry of `ExpansionCallback` trait objects a
//! deployment registers at boot, the same seam `DataEndpoint` uses for
//! data commands (see `crate::data_router`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DataError;
use crate::tracks::Tracks;

#[async_trait]
pub trait ExpansionCallback: Send + Sync {
    async fn run(&self, step: &str) -> Result<Tracks, DataError>;
}

#[derive(Default)]
pub struct ExpansionRegistry {
    callbacks: HashMap<String, Arc<dyn ExpansionCallback>>,
}

impl ExpansionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callback_name: impl Into<String>, callback: Arc<dyn ExpansionCallback>) {
        self.callbacks.insert(callback_name.into(), callback);
    }

    /// Invoke the callback named `callback_name` (an `Expansion::run`
    /// value) with `step`, synthesising a `Tracks` at request time.
    pub async fn invoke(&self, callback_name: &str, step: &str) -> Result<Tracks, DataError> {
        let callback = self
            .callbacks
            .get(callback_name)
            .ok_or_else(|| DataError::message(format!("unknown expansion callback: {callback_name}")))?;
        callback.run(step).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::Track;

    struct Doubler;

    #[async_trait]
    impl ExpansionCallback for Doubler {
        async fn run(&self, step: &str) -> Result<Tracks, DataError> {
            let mut tracks = Tracks::new();
            let mut track = Track::new(format!("synth-{step}"));
            track.scales = [0, 1, 1];
            tracks.add_track(track);
            Ok(tracks)
        }
    }

    #[tokio::test]
    async fn invoke_runs_the_registered_callback() {
        let mut registry = ExpansionRegistry::new();
        registry.register("double", Arc::new(Doubler));
        let tracks = registry.invoke("double", "chr1").await.unwrap();
        assert!(!tracks.dump_for_wire().is_empty());
    }

    #[tokio::test]
    async fn invoke_reports_unknown_callbacks_as_data_error() {
        let registry = ExpansionRegistry::new();
        assert!(registry.invoke("missing", "chr1").await.is_err());
    }
}
