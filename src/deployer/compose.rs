//! Compose based deployments.
//!
//! The plain compose strategy, the custom agent and the Terraform deployer
//! all run a compose project and share [`ComposeDeployedService`]. They only
//! differ in how set up prepares the project.

use super::info::{ServiceInfo, SERVICE_LOGS_DIR_ENV, TEST_RUN_ID_ENV};
use super::{custom_agent, logs, terraform};
use super::{DeployedService, LifecycleState, RunFlags, Runtime, ServiceDeployer, TeardownError};
use crate::compose::{CommandOptions, DownFlags, Project, UpFlags};
use crate::environment::Environment;
use crate::files;
use crate::stack;
use crate::variants::ServiceVariant;
use crate::Result;
use async_trait::async_trait;
use eyre::WrapErr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub(crate) const FLEET_AGENT_PREFIX: &str = "docker-fleet-agent";

/// Deploys the service described by the package's `docker-compose.yml`.
pub struct ComposeDeployer {
    runtime: Runtime,
    paths: Vec<PathBuf>,
    variant: ServiceVariant,
    independent_agent: bool,
    flags: RunFlags,
}

impl ComposeDeployer {
    pub fn new(
        runtime: Runtime,
        paths: Vec<PathBuf>,
        variant: ServiceVariant,
        independent_agent: bool,
        flags: RunFlags,
    ) -> Self {
        Self {
            runtime,
            paths,
            variant,
            independent_agent,
            flags,
        }
    }
}

impl ServiceDeployer for ComposeDeployer {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn prepare(&self, info: ServiceInfo) -> Box<dyn DeployedService> {
        let env = Environment::new()
            .with(SERVICE_LOGS_DIR_ENV, info.logs.local.display().to_string())
            .with(TEST_RUN_ID_ENV, info.test.run_id.clone());
        Box::new(ComposeDeployedService {
            project_name: info.project_name(),
            runtime: self.runtime.clone(),
            flags: self.flags,
            paths: self.paths.clone(),
            env,
            variant: self.variant.clone(),
            shutdown_timeout: None,
            flavor: Flavor::Service {
                independent_agent: self.independent_agent,
            },
            info,
            state: LifecycleState::Created,
            project: None,
        })
    }
}

/// How the compose project of a service is prepared.
#[derive(Debug, Clone)]
pub(crate) enum Flavor {
    Service { independent_agent: bool },
    CustomAgent { hostname: String },
    Terraform { config_dir: PathBuf },
}

pub struct ComposeDeployedService {
    pub(crate) runtime: Runtime,
    pub(crate) flags: RunFlags,
    pub(crate) info: ServiceInfo,
    pub(crate) project_name: String,
    pub(crate) paths: Vec<PathBuf>,
    /// Variables every command runs with
    pub(crate) env: Environment,
    pub(crate) variant: ServiceVariant,
    /// Grace period for `stop`, the tool's default when unset
    pub(crate) shutdown_timeout: Option<Duration>,
    pub(crate) flavor: Flavor,
    pub(crate) state: LifecycleState,
    pub(crate) project: Option<Project>,
}

impl ComposeDeployedService {
    /// Base variables layered with the variant.
    pub(crate) fn command_env(&self) -> Environment {
        let mut env = self.env.clone();
        env.extend(self.variant.env.clone());
        env
    }

    pub(crate) fn command_options(&self) -> CommandOptions {
        CommandOptions::new(self.command_env())
    }

    /// The compose project, created on first use.
    pub(crate) async fn project(&mut self, cancel: &CancellationToken) -> Result<Project> {
        if let Some(project) = &self.project {
            return Ok(project.clone());
        }
        let project = Project::new(
            self.project_name.clone(),
            self.paths.clone(),
            self.runtime.config.compose.clone(),
            self.runtime.docker(),
            cancel,
        )
        .await
        .wrap_err("could not create Docker Compose project for service")?;
        self.project = Some(project.clone());
        Ok(project)
    }

    pub(crate) fn clean_service_logs(&self) -> Result<()> {
        let folder = &self.info.logs.local;
        if self.flags.run_tests_only {
            // Running services keep writing to these files
            debug!("Skipping removing service logs folder {}", folder.display());
            return Ok(());
        }
        files::remove_content(folder).wrap_err("removing service logs failed")
    }

    pub(crate) async fn bring_up(&self, project: &Project, cancel: &CancellationToken) -> Result<()> {
        if self.flags.skips_bring_up() {
            debug!("Skipping bringing up Docker Compose project {}", project.name());
            return Ok(());
        }
        if self.variant.is_active() {
            info!("Using service variant: {}", self.variant);
        }
        info!("Bringing up service {}", self.info.name);
        project
            .up(
                &self.command_options(),
                UpFlags {
                    build: true,
                    detach: true,
                },
                cancel,
            )
            .await
            .wrap_err("could not boot up service using Docker Compose")
    }

    /// Waits for health, saving the logs before returning a failure.
    pub(crate) async fn wait_for_healthy(
        &self,
        project: &Project,
        unhealthy: &'static str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let opts = self.command_options();
        match project.wait_for_healthy(&opts, cancel).await {
            Ok(()) => {
                info!("Service {} is healthy", self.info.name);
                Ok(())
            }
            Err(err) => {
                // The caller's token may be what ended the wait
                self.save_logs(project, &opts, &CancellationToken::new()).await.ok();
                Err(err.wrap_err(unhealthy))
            }
        }
    }

    async fn save_logs(&self, project: &Project, opts: &CommandOptions, cancel: &CancellationToken) -> Result<()> {
        let build_dir = self.runtime.config.locations.build_dir();
        logs::capture(project, opts, &self.info.name, &build_dir, cancel)
            .await
            .map(|_| ())
            .map_err(|err| {
                warn!("Can't save service container logs: {:#}", err);
                err
            })
    }

    /// Internal ports of `service` as rendered by compose.
    pub(crate) async fn discover_ports(
        &mut self,
        project: &Project,
        service: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!("Adding service container {} internal ports to context", project.container_name(service));
        let config = project
            .config(&CommandOptions::new(self.env.clone()), cancel)
            .await
            .wrap_err("could not get Docker Compose configuration for service")?;
        let ports = config
            .services
            .get(service)
            .map(|s| s.ports.iter().map(|p| p.internal_port).collect())
            .unwrap_or_default();
        self.info.set_ports(ports);
        Ok(())
    }

    async fn set_up_service(&mut self, independent_agent: bool, cancel: &CancellationToken) -> Result<()> {
        debug!("Setting up service using Docker Compose service deployer");
        let project = self.project(cancel).await?;
        let docker = self.runtime.docker();
        stack::ensure_network_up(&docker, &self.runtime.config.stack, cancel).await?;

        self.clean_service_logs()?;
        self.bring_up(&project, cancel).await?;
        self.wait_for_healthy(&project, "service is unhealthy", cancel).await?;

        // Stack services may already own the plain service name
        let service = self.info.name.clone();
        let alias = format!("svc-{service}");
        if self.flags.skips_bring_up() {
            debug!("Skipping connect container to network (non setup steps)");
        } else {
            let network = if independent_agent {
                self.info.agent_network_name.clone()
            } else {
                self.runtime.config.stack.network.clone()
            };
            info!("Attaching service {} to network {}", service, network);
            docker
                .connect_to_network(&network, &project.container_name(&service), &[alias.clone()], cancel)
                .await
                .wrap_err_with(|| format!("can't attach service container to the network {network}"))?;
        }

        self.info.hostname = alias;
        self.discover_ports(&project, &service, cancel).await?;
        self.info.agent.host_name_prefix = FLEET_AGENT_PREFIX.to_string();
        Ok(())
    }

    fn cleanup_local(&self) {
        if let Err(err) = files::remove_content(&self.info.logs.local) {
            warn!("Could not remove the service logs: {:#}", err);
        }
        if let Some(output_dir) = &self.info.output_dir {
            if let Err(err) = files::remove_all(output_dir) {
                warn!("Could not remove the temporary output files: {:#}", err);
            }
        }
        if let Flavor::Terraform { config_dir } = &self.flavor {
            if let Err(err) = files::remove_all(config_dir) {
                warn!("Could not remove the generated configuration: {:#}", err);
            }
        }
    }
}

#[async_trait]
impl DeployedService for ComposeDeployedService {
    async fn set_up(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.state = LifecycleState::SettingUp;
        let result = match self.flavor.clone() {
            Flavor::Service { independent_agent } => self.set_up_service(independent_agent, cancel).await,
            Flavor::CustomAgent { hostname } => custom_agent::set_up(self, &hostname, cancel).await,
            Flavor::Terraform { config_dir } => terraform::set_up(self, &config_dir, cancel).await,
        };
        self.state = match result {
            Ok(()) => LifecycleState::Running,
            Err(_) => LifecycleState::Failed,
        };
        result
    }

    async fn signal(&mut self, signal: &str, cancel: &CancellationToken) -> Result<()> {
        let project = self.project(cancel).await?;
        let mut opts = self.command_options();
        if !self.info.name.is_empty() {
            opts = opts.with_services([self.info.name.clone()]);
        }
        project
            .kill(&opts, Some(signal), cancel)
            .await
            .wrap_err_with(|| format!("could not send {signal:?} signal"))?;
        self.state = LifecycleState::SignalSent;
        Ok(())
    }

    async fn exit_code(&self, service: &str, cancel: &CancellationToken) -> Result<Option<i32>> {
        let project = match &self.project {
            Some(project) => project.clone(),
            None => Project::new(
                self.project_name.clone(),
                self.paths.clone(),
                self.runtime.config.compose.clone(),
                self.runtime.docker(),
                cancel,
            )
            .await
            .wrap_err("could not create Docker Compose project for service")?,
        };
        project.service_exit_code(service, &self.command_options(), cancel).await
    }

    async fn tear_down(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state == LifecycleState::TornDown {
            debug!("Service {} is already torn down", self.info.name);
            return Ok(());
        }
        info!("Tearing down service {}", self.info.name);

        let mut failures = Vec::new();
        match self.project(cancel).await {
            Ok(project) => {
                let opts = self.command_options();
                if let Err(err) = project.stop(&opts, self.shutdown_timeout, cancel).await {
                    failures.push(format!("could not stop service using Docker Compose: {err:#}"));
                }
                if let Err(err) = self.save_logs(&project, &opts, cancel).await {
                    failures.push(format!("{err:#}"));
                }
                if let Err(err) = project.down(&opts, DownFlags { volumes: true }, cancel).await {
                    failures.push(format!("could not shut down service using Docker Compose: {err:#}"));
                }
            }
            Err(err) => failures.push(format!("{err:#}")),
        }

        self.cleanup_local();
        self.state = LifecycleState::TornDown;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures }.into())
        }
    }

    fn info(&self) -> &ServiceInfo {
        &self.info
    }

    fn set_info(&mut self, info: ServiceInfo) {
        self.info = info;
    }

    fn state(&self) -> LifecycleState {
        self.state
    }
}
