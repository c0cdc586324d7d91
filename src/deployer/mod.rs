//! Deployment strategies for the service under test.
//!
//! [`factory`] picks a [`ServiceDeployer`] from the package's `_dev/deploy`
//! directory. The deployer prepares a [`DeployedService`] that drives one
//! service through set up, tests and tear down.

pub mod compose;
pub mod custom_agent;
pub mod factory;
pub mod info;
pub mod kubernetes;
pub mod logs;
pub mod terraform;

pub use factory::{factory, find_dev_deploy_path, FactoryOptions};
pub use info::ServiceInfo;

use super::Result;
use crate::config::Config;
use crate::docker::Docker;
use crate::kubectl::Kubectl;
use crate::runner::DynCommandRunner;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeployerError {
    #[error("no suitable service deployer found in {}", .path.display())]
    NoSuitableDeployer { path: PathBuf },
    #[error("\"_dev/deploy\" directory doesn't exist")]
    DevDeployNotFound,
    #[error("expected service deployer \"{name}\" is not defined")]
    ExpectedDeployerMissing { name: String },
    #[error("unsupported service deployer (name: {name})")]
    UnsupportedDeployer { name: String },
    #[error("the {name} service deployer does not support running individual steps")]
    StepsNotSupported { name: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{operation} is not supported by the {deployer} service deployer")]
pub struct NotSupported {
    pub deployer: &'static str,
    pub operation: &'static str,
}

/// Teardown steps that failed, in the order they ran.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("tearing down service failed: {}", .failures.join("; "))]
pub struct TeardownError {
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    SettingUp,
    Running,
    SignalSent,
    Failed,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::SettingUp => "setting up",
            LifecycleState::Running => "running",
            LifecycleState::SignalSent => "signal sent",
            LifecycleState::Failed => "failed",
            LifecycleState::TornDown => "torn down",
        };
        f.write_str(name)
    }
}

/// Which part of the lifecycle this invocation runs. All unset means the
/// whole lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub run_setup: bool,
    pub run_tests_only: bool,
    pub run_tear_down: bool,
}

impl RunFlags {
    /// Services are already running and are only attached to.
    pub fn skips_bring_up(&self) -> bool {
        self.run_tests_only || self.run_tear_down
    }

    pub fn is_step(&self) -> bool {
        self.run_setup || self.run_tests_only || self.run_tear_down
    }
}

/// Shared handles every deployer runs with.
#[derive(Clone)]
pub struct Runtime {
    pub runner: DynCommandRunner,
    pub config: Arc<Config>,
}

impl Runtime {
    pub fn new(runner: DynCommandRunner, config: Config) -> Self {
        Self {
            runner,
            config: Arc::new(config),
        }
    }

    pub fn docker(&self) -> Docker {
        Docker::new(self.runner.clone(), self.config.docker_binary.as_str())
    }

    pub fn kubectl(&self) -> Kubectl {
        Kubectl::new(self.runner.clone(), self.config.kubectl_binary.as_str())
    }
}

/// A deployment strategy selected for a package.
pub trait ServiceDeployer: Send + Sync {
    /// Short name of the strategy, matching its `_dev/deploy` directory
    fn name(&self) -> &'static str;

    /// Creates the service in [`LifecycleState::Created`] without touching
    /// any external resource.
    fn prepare(&self, info: ServiceInfo) -> Box<dyn DeployedService>;
}

/// One deployed service and its lifecycle.
#[async_trait]
pub trait DeployedService: Send + Sync {
    /// Brings the service up and fills in its [`ServiceInfo`].
    async fn set_up(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Sends an OS signal such as `SIGHUP` to the service.
    async fn signal(&mut self, signal: &str, cancel: &CancellationToken) -> Result<()>;

    /// Exit code of `service` if it has exited.
    async fn exit_code(&self, service: &str, cancel: &CancellationToken) -> Result<Option<i32>>;

    /// Removes everything the service created. Safe to call from any state,
    /// and a no-op once the service is torn down.
    async fn tear_down(&mut self, cancel: &CancellationToken) -> Result<()>;

    fn info(&self) -> &ServiceInfo;

    fn set_info(&mut self, info: ServiceInfo);

    fn state(&self) -> LifecycleState;
}


#[cfg(test)]
pub(crate) mod testing {
    use super::Runtime;
    use crate::compose::ComposeSettings;
    use crate::config::{Config, Locations};
    use crate::runner::fake::stdout;
    use crate::runner::{Invocation, Output};
    use crate::stack::StackSettings;
    use crate::Result;
    use std::path::Path;
    use std::sync::Arc;

    pub(crate) fn runtime(runner: Arc<crate::runner::fake::ScriptedRunner>, data_home: &Path) -> Runtime {
        let config = Config {
            compose: ComposeSettings {
                use_pty: false,
                ..Default::default()
            },
            stack: StackSettings {
                version: Some("8.15.0".to_string()),
                ..Default::default()
            },
            locations: Locations::new(data_home.to_path_buf()),
            ..Default::default()
        };
        Runtime::new(runner, config)
    }

    /// Compose verb of an invocation, e.g. `up` in `compose -f x -p name up`.
    pub(crate) fn compose_verb(invocation: &Invocation) -> Option<String> {
        if invocation.args.first().map(String::as_str) != Some("compose") {
            return None;
        }
        let project_flag = invocation.args.iter().position(|a| a == "-p")?;
        invocation.args.get(project_flag + 2).cloned()
    }

    /// Canned docker CLI answers for a single healthy compose service.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeDocker {
        config: String,
        exit_code: Option<i32>,
    }

    impl FakeDocker {
        pub(crate) fn config(mut self, yaml: &str) -> Self {
            self.config = yaml.to_string();
            self
        }

        pub(crate) fn container_exit_code(mut self, code: i32) -> Self {
            self.exit_code = Some(code);
            self
        }
    }

    pub(crate) fn docker_responder(fake: FakeDocker) -> impl Fn(&Invocation) -> Result<Output> + Send + Sync + 'static {
        move |invocation| {
            let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
            if let Some(verb) = compose_verb(invocation) {
                return match verb.as_str() {
                    "ps" => stdout("0123456789abcdef\n"),
                    "config" => stdout(&fake.config),
                    "logs" => stdout("service | started\n"),
                    _ => stdout(""),
                };
            }
            match args.as_slice() {
                ["compose", "version", ..] => stdout("2.24.0\n"),
                ["inspect", ..] => {
                    let state = match fake.exit_code {
                        Some(code) => format!(r#"{{"Status": "exited", "ExitCode": {code}}}"#),
                        None => r#"{"Status": "running", "ExitCode": 0}"#.to_string(),
                    };
                    stdout(&format!(
                        r#"[{{"Id": "0123456789abcdef", "Name": "/svc", "Config": {{"Image": "svc", "Labels": {{"com.docker.compose.service": "svc"}}}}, "State": {state}}}]"#
                    ))
                }
                ["network", "inspect", network] => stdout(&format!(r#"[{{"Name": "{network}", "Containers": {{}}}}]"#)),
                ["ps", ..] => stdout("a1b2c3d4e5f6\n"),
                _ => stdout(""),
            }
        }
    }
}
