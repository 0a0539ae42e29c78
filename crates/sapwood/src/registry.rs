//! Registry of task adapters, and dispatch from task kinds to adapters.

use crate::adapter::{Adapter, AdapterDecl};
use crate::spec::{AssertTarget, InvokeTarget, Kind, MaterializeTarget};
use indexmap::IndexMap;
use std::sync::Arc;

pub const REPLACE_OR_UPSERT: &str = "materialize.replace-or-upsert";
pub const RECREATE_VIEW: &str = "materialize.recreate-view";
pub const RECREATE_UDF: &str = "materialize.recreate-udf";
pub const RECREATE_STORED_PROCEDURE: &str = "materialize.recreate-stored-procedure";
pub const CREATE_SCHEMA: &str = "materialize.create-schema";
pub const CALL_STORED_PROCEDURE: &str = "invoke.call-stored-procedure";
pub const RUN_ASSERTION: &str = "assert.run-assertion";
pub const ASSERTION_SENSOR: &str = "assert.assertion-sensor";
pub const EXTERNAL_LOCAL_PROCESS: &str = "external.local-process";
pub const EXTERNAL_REMOTE_POD: &str = "external.remote-pod";

/// Where external-transform tasks execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExternalMode {
    /// A child process on this host.
    LocalProcess,
    /// A pod in the cluster.
    #[default]
    RemotePod,
}

impl ExternalMode {
    /// Mode selected by a sandbox-environment flag: any non-empty value
    /// selects [`ExternalMode::LocalProcess`].
    pub fn from_sandbox_flag(flag: Option<&str>) -> Self {
        match flag {
            Some(value) if !value.trim().is_empty() => ExternalMode::LocalProcess,
            _ => ExternalMode::RemotePod,
        }
    }

    pub fn adapter_id(&self) -> &'static str {
        match self {
            ExternalMode::LocalProcess => EXTERNAL_LOCAL_PROCESS,
            ExternalMode::RemotePod => EXTERNAL_REMOTE_POD,
        }
    }
}

/// Builtin adapter for a task kind. `None` for named adapters.
pub fn builtin_adapter_id(kind: &Kind, mode: ExternalMode) -> Option<&'static str> {
    Some(match kind {
        Kind::Materialize(MaterializeTarget::Table) => REPLACE_OR_UPSERT,
        Kind::Materialize(MaterializeTarget::View) => RECREATE_VIEW,
        Kind::Materialize(MaterializeTarget::Udf) => RECREATE_UDF,
        Kind::Materialize(MaterializeTarget::StoredProcedure) => RECREATE_STORED_PROCEDURE,
        Kind::Materialize(MaterializeTarget::Schema) => CREATE_SCHEMA,
        Kind::Invoke(InvokeTarget::StoredProcedure) => CALL_STORED_PROCEDURE,
        Kind::Assert(AssertTarget::Assertion) => RUN_ASSERTION,
        Kind::Assert(AssertTarget::AssertionSensor) => ASSERTION_SENSOR,
        Kind::ExternalTransform(_) => mode.adapter_id(),
        Kind::NamedAdapter(_) => return None,
    })
}

/// Failures resolving a task kind to an adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no adapter is registered under the name `{0}`")]
    NotFound(String),

    #[error("`{name}` resolves to `{id}`, which is declared but has no implementation")]
    NotCallable { name: String, id: String },

    #[error("`{name}` resolves to `{id}`, which cannot execute tasks")]
    NotAnAdapter { name: String, id: String },

    #[error("builtin adapter `{0}` is not registered")]
    Unregistered(String),
}

/// Registry of available adapters.
///
/// The registry holds adapter declarations and (optionally) their
/// implementations, plus a namespace of names under which adapters can be
/// referenced by `named-adapter` tasks.
#[derive(Clone)]
pub struct Registry {
    /// Adapter declarations indexed by ID.
    declarations: IndexMap<String, AdapterDecl>,
    /// Adapter implementations indexed by ID.
    implementations: IndexMap<String, Arc<dyn Adapter>>,
    /// Names → adapter IDs.
    names: IndexMap<String, String>,
    external_mode: ExternalMode,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            declarations: IndexMap::new(),
            implementations: IndexMap::new(),
            names: IndexMap::new(),
            external_mode: ExternalMode::default(),
        }
    }

    pub fn external_mode(&self) -> ExternalMode {
        self.external_mode
    }

    pub fn set_external_mode(&mut self, mode: ExternalMode) {
        self.external_mode = mode;
    }

    /// Register an adapter declaration (without implementation).
    pub fn register_decl(&mut self, decl: AdapterDecl) {
        self.declarations.insert(decl.id.clone(), decl);
    }

    /// Register an adapter with its implementation.
    pub fn register(&mut self, adapter: impl Adapter + 'static) {
        let decl = adapter.decl().clone();
        let id = decl.id.clone();
        self.declarations.insert(id.clone(), decl);
        self.implementations.insert(id, Arc::new(adapter));
    }

    /// Register an adapter and make it reachable under `name`.
    pub fn register_named(&mut self, name: impl Into<String>, adapter: impl Adapter + 'static) {
        let id = adapter.decl().id.clone();
        self.register(adapter);
        self.names.insert(name.into(), id);
    }

    /// Make the adapter registered as `id` reachable under `name`.
    pub fn alias(&mut self, name: impl Into<String>, id: impl Into<String>) {
        self.names.insert(name.into(), id.into());
    }

    /// Get an adapter declaration by ID.
    pub fn get_decl(&self, id: &str) -> Option<&AdapterDecl> {
        self.declarations.get(id)
    }

    /// Get an adapter implementation by ID.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Adapter>> {
        self.implementations.get(id).cloned()
    }

    /// Iterate over all declarations.
    pub fn declarations(&self) -> impl Iterator<Item = &AdapterDecl> {
        self.declarations.values()
    }

    /// Iterate over registered names and the adapter IDs they resolve to.
    pub fn names(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names.iter().map(|(n, id)| (n.as_str(), id.as_str()))
    }

    /// The adapter ID a kind dispatches to, without checking it exists.
    pub fn adapter_id(&self, kind: &Kind) -> Option<String> {
        match kind {
            Kind::NamedAdapter(name) => self.names.get(name).cloned(),
            other => builtin_adapter_id(other, self.external_mode).map(str::to_string),
        }
    }

    /// Resolve the adapter that runs tasks of `kind`.
    pub fn resolve(&self, kind: &Kind) -> Result<Arc<dyn Adapter>, DispatchError> {
        let Kind::NamedAdapter(name) = kind else {
            let Some(id) = builtin_adapter_id(kind, self.external_mode) else {
                return Err(DispatchError::Unregistered(kind.to_string()));
            };
            return self
                .get(id)
                .ok_or_else(|| DispatchError::Unregistered(id.to_string()));
        };

        let id = self
            .names
            .get(name)
            .ok_or_else(|| DispatchError::NotFound(name.clone()))?;
        let decl = self
            .declarations
            .get(id)
            .ok_or_else(|| DispatchError::NotFound(name.clone()))?;
        let adapter = self.get(id).ok_or_else(|| DispatchError::NotCallable {
            name: name.clone(),
            id: id.clone(),
        })?;
        if !decl.runs_tasks() {
            return Err(DispatchError::NotAnAdapter {
                name: name.clone(),
                id: id.clone(),
            });
        }
        Ok(adapter)
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}
