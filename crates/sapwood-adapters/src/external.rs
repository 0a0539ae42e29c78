//! External-transform adapters.
//!
//! An external-transform task runs a third-party transformation tool
//! against a named project. The command line is the same wherever it runs;
//! [`LocalProcessRunner`] spawns it on this host and [`RemotePodRunner`]
//! wraps it in a shell inside a pod.
//!
//! The task's tool version reaches both runners: `{version}` in the tool
//! path or pod image is replaced by it, and it is exported as
//! [`VERSION_ENV`].

use indexmap::IndexMap;
use sapwood::{
    Adapter, AdapterDecl, AdapterError, AdapterOutput, EXTERNAL_LOCAL_PROCESS, EXTERNAL_REMOTE_POD,
    ExternalArgument, ExternalTarget, Kind, Options, TaskContext, Value,
};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

pub const FULL_REFRESH_FLAG: &str = "--full-refresh";

/// Environment variable carrying the requested tool version.
pub const VERSION_ENV: &str = "SAPWOOD_EXTERNAL_VERSION";

/// Replaced by the requested version in tool paths and pod images.
pub const VERSION_PLACEHOLDER: &str = "{version}";

/// Errors from running an external command.
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("command exited with {}:\n{output}", exit_status(.status))]
    Failed { status: Option<i32>, output: String },

    #[error("task `{0}` is not an external-transform task")]
    NotExternal(String),

    #[error("task `{0}` has no external project")]
    MissingProject(String),
}

fn exit_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

impl From<ExternalError> for AdapterError {
    fn from(e: ExternalError) -> Self {
        AdapterError::External(e.to_string())
    }
}

/// One run of the external tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalInvocation {
    pub project: String,
    pub target: ExternalTarget,
    pub version: Option<String>,
    pub arguments: Vec<ExternalArgument>,
    pub full_refresh: bool,
    /// Variables passed to the tool as a JSON object.
    pub vars: Options,
}

impl ExternalInvocation {
    /// Read the invocation from a task and its run.
    ///
    /// Pipeline params are passed as vars, with trigger vars layered on top.
    pub fn from_context(ctx: &TaskContext<'_>) -> Result<Self, ExternalError> {
        let task = ctx.task;
        let Kind::ExternalTransform(target) = &task.kind else {
            return Err(ExternalError::NotExternal(task.identifier.clone()));
        };
        let project = task
            .external_project()
            .ok_or_else(|| ExternalError::MissingProject(task.identifier.clone()))?;

        let mut vars = ctx.pipeline_params.clone();
        vars.extend(ctx.params.vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(Self {
            project: project.to_string(),
            target: *target,
            version: task
                .options
                .get("version")
                .filter(|v| !v.is_null())
                .map(Value::to_string),
            arguments: ExternalArgument::from_options(&task.options),
            full_refresh: ctx.params.full_refresh,
            vars,
        })
    }

    /// Whether `--full-refresh` is appended. Only `run` honours a full
    /// refresh, and never twice.
    pub fn appends_full_refresh(&self) -> bool {
        self.full_refresh
            && self.target == ExternalTarget::Run
            && !self.arguments.iter().any(|a| a.option == FULL_REFRESH_FLAG)
    }

    /// Arguments after the tool name.
    pub fn args(&self, projects_path: &Path) -> Vec<String> {
        let mut args = vec![
            "--no-use-colors".to_string(),
            self.target.as_str().to_string(),
            "--project-dir".to_string(),
            projects_path.join(&self.project).display().to_string(),
            "--vars".to_string(),
            Value::Object(self.vars.clone()).to_json().to_string(),
        ];
        for argument in &self.arguments {
            args.push(argument.option.clone());
            if let Some(value) = &argument.value {
                args.push(value.clone());
            }
        }
        if self.appends_full_refresh() {
            args.push(FULL_REFRESH_FLAG.to_string());
        }
        args
    }

    /// `template` with [`VERSION_PLACEHOLDER`] replaced by the version.
    pub fn versioned(&self, template: &str) -> String {
        match &self.version {
            Some(version) => template.replace(VERSION_PLACEHOLDER, version),
            None => template.to_string(),
        }
    }

    /// The full command as one shell line.
    pub fn command_line(&self, tool: &str, projects_path: &Path) -> String {
        std::iter::once(tool.to_string())
            .chain(self.args(projects_path))
            .map(|arg| shell_quote(&arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Something that can run an external invocation.
pub trait ExternalRunner: Send + Sync {
    /// Run to completion, returning the combined output.
    fn run(&self, task_id: &str, invocation: &ExternalInvocation) -> Result<String, ExternalError>;
}

/// Runs the tool as a child process.
///
/// A tool such as `/opt/dbt/{version}/bin/dbt` selects one install per
/// version.
#[derive(Debug, Clone)]
pub struct LocalProcessRunner {
    tool: String,
    projects_path: PathBuf,
}

impl LocalProcessRunner {
    pub fn new(tool: impl Into<String>, projects_path: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            projects_path: projects_path.into(),
        }
    }

    pub fn program(&self, invocation: &ExternalInvocation) -> String {
        invocation.versioned(&self.tool)
    }

    pub fn command(&self, invocation: &ExternalInvocation) -> Command {
        let mut command = Command::new(self.program(invocation));
        command.args(invocation.args(&self.projects_path));
        if let Some(version) = &invocation.version {
            command.env(VERSION_ENV, version);
        }
        command
    }
}

impl ExternalRunner for LocalProcessRunner {
    fn run(&self, task_id: &str, invocation: &ExternalInvocation) -> Result<String, ExternalError> {
        let program = self.program(invocation);
        info!(
            task = task_id,
            version = ?invocation.version,
            command = %invocation.command_line(&program, &self.projects_path),
            "running external command"
        );
        let output = self
            .command(invocation)
            .output()
            .map_err(|source| ExternalError::Spawn { program, source })?;

        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(task = task_id, "{}", captured);

        if !output.status.success() {
            return Err(ExternalError::Failed {
                status: output.status.code(),
                output: captured,
            });
        }
        Ok(captured)
    }
}

/// A pod to run one command in.
#[derive(Debug, Clone, PartialEq)]
pub struct PodSpec {
    pub name: String,
    pub image: String,
    pub namespace: String,
    pub env: IndexMap<String, String>,
    pub command: Vec<String>,
}

/// Launches pods and waits for them.
pub trait PodLauncher: Send + Sync {
    /// Run the pod to completion, returning its logs.
    fn launch(&self, spec: &PodSpec) -> Result<String, ExternalError>;
}

/// Runs pods with `kubectl run --rm -i --restart=Never`.
#[derive(Debug, Clone)]
pub struct KubectlLauncher {
    program: String,
}

impl Default for KubectlLauncher {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl KubectlLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(spec: &PodSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            spec.name.clone(),
            "--rm".to_string(),
            "-i".to_string(),
            "--restart=Never".to_string(),
            format!("--namespace={}", spec.namespace),
            format!("--image={}", spec.image),
        ];
        for (key, value) in &spec.env {
            args.push(format!("--env={}={}", key, value));
        }
        args.push("--command".to_string());
        args.push("--".to_string());
        args.extend(spec.command.iter().cloned());
        args
    }
}

impl PodLauncher for KubectlLauncher {
    fn launch(&self, spec: &PodSpec) -> Result<String, ExternalError> {
        let output = Command::new(&self.program)
            .args(Self::args(spec))
            .output()
            .map_err(|source| ExternalError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ExternalError::Failed {
                status: output.status.code(),
                output: logs,
            });
        }
        Ok(logs)
    }
}

/// Runs the tool inside a pod through `/bin/bash -c`.
#[derive(Clone)]
pub struct RemotePodRunner {
    launcher: Arc<dyn PodLauncher>,
    tool: String,
    image: String,
    namespace: String,
    projects_path: PathBuf,
    env: IndexMap<String, String>,
}

impl RemotePodRunner {
    pub fn new(launcher: Arc<dyn PodLauncher>, image: impl Into<String>) -> Self {
        Self {
            launcher,
            tool: "dbt".into(),
            image: image.into(),
            namespace: "default".into(),
            projects_path: PathBuf::from("."),
            env: IndexMap::new(),
        }
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Where projects live inside the image.
    pub fn projects_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.projects_path = path.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// An image such as `registry/transform:{version}` is tagged per version.
    pub fn pod_spec(&self, task_id: &str, invocation: &ExternalInvocation) -> PodSpec {
        let mut env = self.env.clone();
        if let Some(version) = &invocation.version {
            env.insert(VERSION_ENV.to_string(), version.clone());
        }
        PodSpec {
            name: pod_name(task_id),
            image: invocation.versioned(&self.image),
            namespace: self.namespace.clone(),
            env,
            command: vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                invocation.command_line(&invocation.versioned(&self.tool), &self.projects_path),
            ],
        }
    }
}

/// Pod names are lowercase DNS labels.
fn pod_name(task_id: &str) -> String {
    let name: String = task_id
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    let name = name.trim_matches('-');
    let name = if name.is_empty() { "task" } else { name };
    name.chars().take(63).collect::<String>().trim_end_matches('-').to_string()
}

impl ExternalRunner for RemotePodRunner {
    fn run(&self, task_id: &str, invocation: &ExternalInvocation) -> Result<String, ExternalError> {
        let spec = self.pod_spec(task_id, invocation);
        info!(
            task = task_id,
            pod = %spec.name,
            image = %spec.image,
            namespace = %spec.namespace,
            "launching pod"
        );
        self.launcher.launch(&spec)
    }
}

/// Adapter for external-transform tasks, backed by a runner.
pub struct ExternalTransformAdapter {
    decl: AdapterDecl,
    runner: Arc<dyn ExternalRunner>,
}

impl ExternalTransformAdapter {
    pub fn new(id: &str, runner: Arc<dyn ExternalRunner>) -> Self {
        Self {
            decl: AdapterDecl::new(id).description(format!("Run an external transformation ({})", id)),
            runner,
        }
    }

    pub fn local_process(runner: LocalProcessRunner) -> Self {
        Self::new(EXTERNAL_LOCAL_PROCESS, Arc::new(runner))
    }

    pub fn remote_pod(runner: RemotePodRunner) -> Self {
        Self::new(EXTERNAL_REMOTE_POD, Arc::new(runner))
    }
}

impl Adapter for ExternalTransformAdapter {
    fn decl(&self) -> &AdapterDecl {
        &self.decl
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError> {
        let invocation = ExternalInvocation::from_context(ctx)?;
        info!(
            task = %ctx.task.identifier,
            project = %invocation.project,
            full_refresh = invocation.appends_full_refresh(),
            "running external transform"
        );
        if ctx.services.dry_run {
            info!(task = %ctx.task.identifier, "dry run, external transform not started");
            return Ok(AdapterOutput::Completed);
        }
        let output = self.runner.run(&ctx.task.identifier, &invocation)?;
        Ok(AdapterOutput::Captured(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapwood::OptionsExt;
    use std::ffi::OsStr;

    fn invocation(target: ExternalTarget, arguments: Vec<ExternalArgument>) -> ExternalInvocation {
        ExternalInvocation {
            project: "analytics".into(),
            target,
            version: Some("0.19.0".into()),
            arguments,
            full_refresh: true,
            vars: Options::new().with("run_date", "2024-01-01"),
        }
    }

    fn arg(option: &str, value: Option<&str>) -> ExternalArgument {
        ExternalArgument {
            option: option.into(),
            value: value.map(str::to_string),
        }
    }

    #[test]
    fn test_args_run_with_full_refresh() {
        let args = invocation(ExternalTarget::Run, vec![arg("-m", Some("orders"))])
            .args(Path::new("/projects"));

        assert_eq!(
            args,
            vec![
                "--no-use-colors",
                "run",
                "--project-dir",
                "/projects/analytics",
                "--vars",
                r#"{"run_date":"2024-01-01"}"#,
                "-m",
                "orders",
                "--full-refresh",
            ]
        );
    }

    #[test]
    fn test_full_refresh_not_duplicated() {
        let invocation = invocation(ExternalTarget::Run, vec![arg("--full-refresh", None)]);
        let args = invocation.args(Path::new("."));
        assert_eq!(args.iter().filter(|a| *a == FULL_REFRESH_FLAG).count(), 1);
    }

    #[test]
    fn test_full_refresh_only_for_run() {
        let args = invocation(ExternalTarget::Test, vec![]).args(Path::new("."));
        assert!(!args.iter().any(|a| a == FULL_REFRESH_FLAG));
        assert_eq!(args[1], "test");
    }

    #[test]
    fn test_command_line_quotes_vars() {
        let line = invocation(ExternalTarget::Test, vec![]).command_line("dbt", Path::new("."));
        assert_eq!(
            line,
            r#"dbt --no-use-colors test --project-dir ./analytics --vars '{"run_date":"2024-01-01"}'"#
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_pod_spec() {
        struct NoLauncher;
        impl PodLauncher for NoLauncher {
            fn launch(&self, _spec: &PodSpec) -> Result<String, ExternalError> {
                Ok(String::new())
            }
        }

        let runner = RemotePodRunner::new(Arc::new(NoLauncher), "registry/transform:abc")
            .env("SAPWOOD_LOCATION", "EU");
        let spec = runner.pod_spec("Dbt_Run", &invocation(ExternalTarget::Test, vec![]));

        assert_eq!(spec.name, "dbt-run");
        assert_eq!(spec.namespace, "default");
        assert_eq!(&spec.command[..2], &["/bin/bash".to_string(), "-c".to_string()]);
        assert!(spec.command[2].starts_with("dbt --no-use-colors test --project-dir ./analytics"));

        let args = KubectlLauncher::args(&spec);
        assert_eq!(&args[..5], &["run", "dbt-run", "--rm", "-i", "--restart=Never"]);
        assert!(args.contains(&"--env=SAPWOOD_LOCATION=EU".to_string()));
        assert_eq!(args[args.len() - 4], "--");
    }

    #[test]
    fn test_local_command_selects_version() {
        let runner = LocalProcessRunner::new("/opt/dbt/{version}/bin/dbt", "/projects");
        let command = runner.command(&invocation(ExternalTarget::Run, vec![]));

        assert_eq!(command.get_program(), "/opt/dbt/0.19.0/bin/dbt");
        let env: Vec<_> = command.get_envs().collect();
        assert!(env.contains(&(OsStr::new(VERSION_ENV), Some(OsStr::new("0.19.0")))));
    }

    #[test]
    fn test_pod_spec_carries_version() {
        struct NoLauncher;
        impl PodLauncher for NoLauncher {
            fn launch(&self, _spec: &PodSpec) -> Result<String, ExternalError> {
                Ok(String::new())
            }
        }

        let runner = RemotePodRunner::new(Arc::new(NoLauncher), "registry/transform:{version}");
        let spec = runner.pod_spec("dbt_run", &invocation(ExternalTarget::Run, vec![]));

        assert_eq!(spec.image, "registry/transform:0.19.0");
        assert_eq!(spec.env.get(VERSION_ENV).map(String::as_str), Some("0.19.0"));
        assert!(KubectlLauncher::args(&spec).contains(&format!("--env={}=0.19.0", VERSION_ENV)));
    }

    #[test]
    fn test_pod_name() {
        assert_eq!(pod_name("__x__"), "x");
        assert_eq!(pod_name("___"), "task");
    }
}
