//! Function definitions and the in-memory registry

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

fn default_instance_timeout_secs() -> u64 {
    60
}

fn default_concurrency_limit() -> i32 {
    -1
}

fn default_max_instances() -> u32 {
    1
}

/// A function as submitted by a client or seeded from configuration,
/// before the registry has assigned an id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Unique routing name
    pub name: String,
    /// Container image coordinates
    pub image: String,
    /// Arguments passed to the launched process
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Port the function listens on inside its container
    pub container_port: u16,
    /// Idle duration before a released instance may be stopped
    /// (reserved for timer-based eviction; not enforced)
    #[serde(default = "default_instance_timeout_secs")]
    pub instance_timeout_secs: u64,
    /// Max simultaneous requests per instance, <= 0 for unlimited (reserved)
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: i32,
    /// Pool lower bound (reserved)
    #[serde(default)]
    pub min_instances: u32,
    /// Pool upper bound (reserved; only the single-instance case is enforced)
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
}

/// A registered function. The id is assigned once by the registry and
/// never changes; the name is unique across all definitions.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    pub id: Uuid,
    pub name: String,
    pub image: String,
    pub arguments: Vec<String>,
    pub container_port: u16,
    pub instance_timeout_secs: u64,
    pub concurrency_limit: i32,
    pub min_instances: u32,
    pub max_instances: u32,
}

impl FunctionDefinition {
    fn from_spec(id: Uuid, spec: FunctionSpec) -> Self {
        Self {
            id,
            name: spec.name,
            image: spec.image,
            arguments: spec.arguments,
            container_port: spec.container_port,
            instance_timeout_secs: spec.instance_timeout_secs,
            concurrency_limit: spec.concurrency_limit,
            min_instances: spec.min_instances,
            max_instances: spec.max_instances,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("function already exists: {0}")]
    NameTaken(String),
    #[error("no such function")]
    NotFound,
}

struct Inner {
    by_id: HashMap<Uuid, Arc<FunctionDefinition>>,
    names: HashMap<String, Uuid>,
}

/// In-memory function registry.
///
/// Owns name uniqueness and id assignment; the invocation core only reads
/// definitions from here and never writes.
pub struct FunctionRegistry {
    inner: RwLock<Inner>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                names: HashMap::new(),
            }),
        }
    }

    /// Register a new function, assigning it a fresh id
    pub fn create(&self, spec: FunctionSpec) -> Result<Arc<FunctionDefinition>, RegistryError> {
        let mut inner = self.inner.write();
        if inner.names.contains_key(&spec.name) {
            return Err(RegistryError::NameTaken(spec.name));
        }

        let id = Uuid::new_v4();
        let function = Arc::new(FunctionDefinition::from_spec(id, spec));
        inner.names.insert(function.name.clone(), id);
        inner.by_id.insert(id, Arc::clone(&function));
        Ok(function)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<FunctionDefinition>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<FunctionDefinition>> {
        let inner = self.inner.read();
        inner
            .names
            .get(name)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Replace the definition stored under `id`, keeping the id
    pub fn update(
        &self,
        id: Uuid,
        spec: FunctionSpec,
    ) -> Result<Arc<FunctionDefinition>, RegistryError> {
        let mut inner = self.inner.write();
        let old = inner.by_id.get(&id).cloned().ok_or(RegistryError::NotFound)?;

        // The new name must not belong to a different function
        if let Some(&owner) = inner.names.get(&spec.name) {
            if owner != id {
                return Err(RegistryError::NameTaken(spec.name));
            }
        }

        let function = Arc::new(FunctionDefinition::from_spec(id, spec));
        inner.names.remove(&old.name);
        inner.names.insert(function.name.clone(), id);
        inner.by_id.insert(id, Arc::clone(&function));
        Ok(function)
    }

    pub fn delete(&self, id: Uuid) -> Result<Arc<FunctionDefinition>, RegistryError> {
        let mut inner = self.inner.write();
        let old = inner.by_id.remove(&id).ok_or(RegistryError::NotFound)?;
        inner.names.remove(&old.name);
        Ok(old)
    }

    pub fn list(&self) -> Vec<Arc<FunctionDefinition>> {
        self.inner.read().by_id.values().cloned().collect()
    }
}
