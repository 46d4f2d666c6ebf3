//! Workloads and their routines.
//!
//! A [`WorkloadRegistry`] maps workload names to loaders. Inside a worker
//! process the loader runs once and yields a [`Workload`]: the table of
//! named routines that jobs are dispatched to.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::LoadError;
use crate::job::Params;

/// A routine: keyword parameters in, JSON value or error out.
pub type RoutineFn = dyn Fn(Params) -> anyhow::Result<serde_json::Value> + Send + Sync;

/// Builds a workload inside its worker process (e.g. loads model weights).
pub type LoaderFn = dyn Fn() -> anyhow::Result<Workload> + Send + Sync;

/// A loaded workload exposing named routines.
pub struct Workload {
    name: String,
    routines: HashMap<String, Arc<RoutineFn>>,
}

impl Workload {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routines: HashMap::new(),
        }
    }

    /// Register a routine. A later registration under the same name wins.
    pub fn with_routine<F>(mut self, name: impl Into<String>, routine: F) -> Self
    where
        F: Fn(Params) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.routines.insert(name.into(), Arc::new(routine));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routine(&self, name: &str) -> Option<Arc<RoutineFn>> {
        self.routines.get(name).cloned()
    }

    pub fn routine_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workload")
            .field("name", &self.name)
            .field("routines", &self.routine_names())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("workload {0} is already registered")]
    AlreadyRegistered(String),
}

/// Name → loader table shared by the host binary and its worker processes.
#[derive(Default, Clone)]
pub struct WorkloadRegistry {
    loaders: BTreeMap<String, Arc<LoaderFn>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, loader: F) -> Result<(), RegistryError>
    where
        F: Fn() -> anyhow::Result<Workload> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.loaders.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.loaders.insert(name, Arc::new(loader));
        Ok(())
    }

    /// Registered workload names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.loaders.keys().map(String::as_str).collect()
    }

    /// Run the loader for `name`.
    pub fn load(&self, name: &str) -> Result<Workload, LoadError> {
        let loader = self
            .loaders
            .get(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        loader().map_err(|e| LoadError::Failed(format!("{e:#}")))
    }
}
