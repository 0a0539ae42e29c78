//! Task adapters for Sapwood.
//!
//! This crate provides the adapters behind the builtin task kinds:
//!
//! ## Warehouse
//! - `materialize/table` - create, or stage and merge ([`ReplaceOrUpsert`])
//! - `materialize/view` - drop and recreate ([`RecreateView`])
//! - `materialize/udf`, `materialize/stored_procedure` - create or replace
//! - `materialize/schema` - create if missing ([`CreateSchema`])
//! - `invoke/stored_procedure` - call in a block ([`CallStoredProcedure`])
//! - `assert/assertion` - run once ([`RunAssertion`])
//! - `assert/assertion_sensor` - poll until passing ([`AssertionSensor`])
//!
//! ## External transform
//! - `external.local-process` - child process on this host
//! - `external.remote-pod` - pod launched through `kubectl`

mod external;
mod sensor;
mod warehouse;

pub use external::{
    ExternalError, ExternalInvocation, ExternalRunner, ExternalTransformAdapter, FULL_REFRESH_FLAG,
    KubectlLauncher, LocalProcessRunner, PodLauncher, PodSpec, RemotePodRunner, VERSION_ENV,
    VERSION_PLACEHOLDER,
};
pub use sensor::AssertionSensor;
pub use warehouse::{
    CallStoredProcedure, CreateSchema, RecreateStoredProcedure, RecreateUdf, RecreateView,
    ReplaceOrUpsert, RunAssertion, table_options,
};

use indexmap::IndexMap;
use sapwood::{ExternalMode, Registry};
use std::path::PathBuf;
use std::sync::Arc;

/// How external-transform tasks are run.
#[derive(Debug, Clone)]
pub struct ExternalSettings {
    pub mode: ExternalMode,
    /// Tool executable; `{version}` is replaced by the task's version.
    pub tool: String,
    /// Directory holding one sub-directory per project, on this host.
    pub projects_path: PathBuf,
    /// Image for remote pods; `{version}` is replaced by the task's version.
    pub image: String,
    pub namespace: String,
    /// Program used to launch pods.
    pub launcher: String,
    /// Environment of remote pods.
    pub env: IndexMap<String, String>,
}

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            mode: ExternalMode::default(),
            tool: "dbt".into(),
            projects_path: PathBuf::from("projects"),
            image: "sapwood-transform:{version}".into(),
            namespace: "default".into(),
            launcher: "kubectl".into(),
            env: IndexMap::new(),
        }
    }
}

impl ExternalSettings {
    pub fn mode(mut self, mode: ExternalMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Register every builtin adapter with the registry.
pub fn register_all(registry: &mut Registry, mode: ExternalMode) {
    register_all_with(registry, &ExternalSettings::default().mode(mode));
}

/// Register every builtin adapter, running external transforms as
/// `settings` describes.
pub fn register_all_with(registry: &mut Registry, settings: &ExternalSettings) {
    registry.register(ReplaceOrUpsert);
    registry.register(RecreateView);
    registry.register(RecreateUdf);
    registry.register(RecreateStoredProcedure);
    registry.register(CreateSchema);
    registry.register(CallStoredProcedure);
    registry.register(RunAssertion);
    registry.register(AssertionSensor);

    // Both external adapters are registered; the mode picks the one
    // external-transform tasks dispatch to.
    registry.set_external_mode(settings.mode);
    registry.register(ExternalTransformAdapter::local_process(LocalProcessRunner::new(
        settings.tool.clone(),
        settings.projects_path.clone(),
    )));

    let mut pod_runner = RemotePodRunner::new(
        Arc::new(KubectlLauncher::new(settings.launcher.clone())),
        settings.image.clone(),
    )
    .tool(settings.tool.clone())
    .namespace(settings.namespace.clone());
    for (key, value) in &settings.env {
        pod_runner = pod_runner.env(key.clone(), value.clone());
    }
    registry.register(ExternalTransformAdapter::remote_pod(pod_runner));
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapwood::{
        AssertTarget, EXTERNAL_LOCAL_PROCESS, ExternalTarget, InvokeTarget, Kind, MaterializeTarget,
    };

    #[test]
    fn test_register_all() {
        let mut registry = Registry::new();
        register_all(&mut registry, ExternalMode::LocalProcess);

        assert_eq!(registry.len(), 10);
        assert!(
            registry
                .resolve(&Kind::Materialize(MaterializeTarget::Table))
                .is_ok()
        );

        let external = registry
            .resolve(&Kind::ExternalTransform(ExternalTarget::Run))
            .unwrap();
        assert_eq!(external.decl().id, EXTERNAL_LOCAL_PROCESS);
    }

    #[test]
    fn test_every_builtin_kind_resolves() {
        let mut registry = Registry::new();
        register_all(&mut registry, ExternalMode::RemotePod);

        for kind in [
            Kind::Materialize(MaterializeTarget::Table),
            Kind::Materialize(MaterializeTarget::View),
            Kind::Materialize(MaterializeTarget::Udf),
            Kind::Materialize(MaterializeTarget::StoredProcedure),
            Kind::Materialize(MaterializeTarget::Schema),
            Kind::Invoke(InvokeTarget::StoredProcedure),
            Kind::Assert(AssertTarget::Assertion),
            Kind::Assert(AssertTarget::AssertionSensor),
            Kind::ExternalTransform(ExternalTarget::Run),
            Kind::ExternalTransform(ExternalTarget::Test),
        ] {
            assert!(registry.resolve(&kind).is_ok(), "{} did not resolve", kind);
        }
    }
}
