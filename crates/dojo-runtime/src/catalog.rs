//! Workshop catalog.
//!
//! The engine does not own workshop content; it asks a [`WorkshopCatalog`]
//! for the step definitions and environment template of a workshop id.
//! [`StaticCatalog`] holds a fixed set, built in memory or read from a JSON
//! array on disk.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dojo_core::ids::WorkshopId;
use dojo_core::workshop::Workshop;
use thiserror::Error;
use tracing::debug;

use crate::errors::RuntimeError;

/// Errors loading a catalog file.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The file could not be read.
    #[error("failed to read catalog {path}: {source}")]
    Io {
        /// Catalog path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a JSON array of workshops.
    #[error("failed to parse catalog {path}: {source}")]
    Parse {
        /// Catalog path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// A workshop definition is unusable.
    #[error("invalid workshop {workshop_id}: {message}")]
    Invalid {
        /// Offending workshop.
        workshop_id: WorkshopId,
        /// What is wrong with it.
        message: String,
    },
}

/// Source of workshop definitions.
pub trait WorkshopCatalog: Send + Sync {
    /// Look up a workshop by id.
    fn workshop(&self, id: &WorkshopId) -> Result<Arc<Workshop>, RuntimeError>;

    /// All workshops, ordered by id.
    fn list(&self) -> Vec<Arc<Workshop>>;
}

/// Fixed, in-memory catalog.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    workshops: BTreeMap<WorkshopId, Arc<Workshop>>,
}

impl StaticCatalog {
    /// Build a catalog, rejecting unusable workshops.
    ///
    /// A later workshop with the same id replaces an earlier one.
    pub fn new(workshops: Vec<Workshop>) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for workshop in workshops {
            check(&workshop)?;
            let _ = map.insert(workshop.id.clone(), Arc::new(workshop));
        }
        Ok(Self { workshops: map })
    }

    /// Read a JSON array of workshops from `path`.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let workshops: Vec<Workshop> =
            serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let catalog = Self::new(workshops)?;
        debug!(path = %path.display(), count = catalog.len(), "workshop catalog loaded");
        Ok(catalog)
    }

    /// Number of workshops.
    pub fn len(&self) -> usize {
        self.workshops.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.workshops.is_empty()
    }
}

impl WorkshopCatalog for StaticCatalog {
    fn workshop(&self, id: &WorkshopId) -> Result<Arc<Workshop>, RuntimeError> {
        self.workshops
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::WorkshopNotFound(id.clone()))
    }

    fn list(&self) -> Vec<Arc<Workshop>> {
        self.workshops.values().cloned().collect()
    }
}

fn check(workshop: &Workshop) -> Result<(), CatalogError> {
    let invalid = |message: String| CatalogError::Invalid {
        workshop_id: workshop.id.clone(),
        message,
    };
    if workshop.steps.is_empty() {
        return Err(invalid("no steps".into()));
    }
    let mut seen = HashSet::new();
    for step in &workshop.steps {
        if !seen.insert(&step.id) {
            return Err(invalid(format!("duplicate step id {}", step.id)));
        }
    }
    if workshop.ttl_secs == Some(0) {
        return Err(invalid("ttlSecs must be positive".into()));
    }
    Ok(())
}
