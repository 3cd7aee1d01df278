//! Chromosome ("stick") metadata lookup.
//!
//! Grounded on `original_source/backend-server/app/command/controlcmds.py::StickHandler`
//! and the `data_accessor.data_model.stick(...)` call it makes. The
//! concrete species/assembly database is an external collaborator (per
//! spec.md §1); this module only defines the trait seam and the wire
//! shape `StickHandler` serialises.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Linear,
    Circular,
}

impl Topology {
    pub fn to_wire(self) -> u8 {
        match self {
            Topology::Linear => 0,
            Topology::Circular => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chromosome {
    pub id: String,
    pub size: u64,
    pub topology: Topology,
    pub tags: Vec<String>,
}

/// Resolves stick names to chromosome metadata. Implemented by whatever
/// genome-assembly database a deployment configures; `browser-core`
/// depends only on this trait.
#[async_trait]
pub trait SpeciesRegistry: Send + Sync {
    async fn stick(&self, name: &str) -> Option<Chromosome>;
}

/// A registry with no sticks, useful for tests and for deployments that
/// haven't wired one in yet.
pub struct EmptySpeciesRegistry;

#[async_trait]
impl SpeciesRegistry for EmptySpeciesRegistry {
    async fn stick(&self, _name: &str) -> Option<Chromosome> {
        None
    }
}

/// An in-memory registry, useful for tests and small fixed deployments.
#[derive(Default)]
pub struct StaticSpeciesRegistry {
    sticks: std::collections::HashMap<String, Chromosome>,
}

impl StaticSpeciesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chromosome: Chromosome) {
        self.sticks.insert(chromosome.id.clone(), chromosome);
    }
}

#[async_trait]
impl SpeciesRegistry for StaticSpeciesRegistry {
    async fn stick(&self, name: &str) -> Option<Chromosome> {
        self.sticks.get(name).cloned()
    }
}
