//! Docker Compose projects: one named instance of a set of compose files.

pub mod config;
pub mod health;

pub use config::{Config, PortMapping, ServiceConfig};

use crate::docker::Docker;
use crate::environment::Environment;
use crate::runner::{CommandError, DynCommandRunner, Invocation, Output};
use crate::wait::WaitOptions;
use crate::Result;
use eyre::{bail, eyre, WrapErr};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STANDALONE_BINARY: &str = "docker-compose";

/// Compose behaviour toggles
#[derive(Debug, Clone)]
pub struct ComposeSettings {
    /// Use the standalone `docker-compose` binary instead of the plugin
    pub standalone: bool,
    /// Suppress colors and progress bars
    pub disable_ansi: bool,
    /// Suppress image pull progress
    pub disable_pull_progress: bool,
    /// Attach compose stderr to a pseudo terminal
    pub use_pty: bool,
    /// Timing of [`Project::wait_for_healthy`]
    pub health: WaitOptions,
}

impl Default for ComposeSettings {
    fn default() -> Self {
        Self {
            standalone: false,
            disable_ansi: false,
            disable_pull_progress: false,
            use_pty: true,
            health: WaitOptions::default(),
        }
    }
}

/// Version reported by `docker compose version --short`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComposeVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ComposeVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Releases before 2.0 name containers `project_service_1`.
    pub fn uses_legacy_container_names(&self) -> bool {
        self.major < 2
    }

    /// `--progress` replaced `--ansi` in 2.19.
    fn supports_progress_flag(&self) -> bool {
        *self >= ComposeVersion::new(2, 19, 0)
    }
}

impl FromStr for ComposeVersion {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim().trim_start_matches('v');
        let core: String = text
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut numbers = core.split('.').filter(|p| !p.is_empty()).map(str::parse::<u64>);
        let mut next = || numbers.next().transpose();
        let major = next()
            .wrap_err_with(|| format!("invalid compose version {s:?}"))?
            .ok_or_else(|| eyre!("invalid compose version {s:?}"))?;
        let minor = next().wrap_err_with(|| format!("invalid compose version {s:?}"))?.unwrap_or(0);
        let patch = next().wrap_err_with(|| format!("invalid compose version {s:?}"))?.unwrap_or(0);
        Ok(ComposeVersion::new(major, minor, patch))
    }
}

impl fmt::Display for ComposeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Per-call options shared by all verbs.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub env: Environment,
    pub extra_args: Vec<String>,
    pub services: Vec<String>,
}

impl CommandOptions {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            ..Default::default()
        }
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.extend(services.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpFlags {
    /// Build images before starting
    pub build: bool,
    /// Run in the background
    pub detach: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownFlags {
    /// Remove named and anonymous volumes
    pub volumes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolForm {
    Plugin,
    Standalone,
}

/// A compose project identified by its name and files.
///
/// The tool form and version are detected once when the project is created.
#[derive(Clone)]
pub struct Project {
    name: String,
    paths: Vec<PathBuf>,
    runner: DynCommandRunner,
    docker: Docker,
    form: ToolForm,
    version: ComposeVersion,
    settings: ComposeSettings,
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name)
            .field("paths", &self.paths)
            .field("form", &self.form)
            .field("version", &self.version)
            .finish()
    }
}

impl Project {
    /// Creates a project after checking its files and probing the tool.
    ///
    /// # Arguments
    /// * `name` - Project name passed as `-p`
    /// * `paths` - Compose files passed as `-f`, in order
    /// * `settings` - Compose behaviour toggles
    /// * `docker` - Docker CLI wrapper the project runs through
    /// * `cancel` - Caller's cancellation token
    pub async fn new(
        name: impl Into<String>,
        paths: Vec<PathBuf>,
        settings: ComposeSettings,
        docker: Docker,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        for path in &paths {
            if !path.is_file() {
                bail!("could not find Docker Compose configuration file: {}", path.display());
            }
        }

        let runner = docker.runner();
        let (form, version) = detect_tool(&docker, &runner, settings.standalone, cancel).await?;
        debug!("Using Docker Compose {} ({:?})", version, form);
        Ok(Self {
            name: name.into(),
            paths,
            runner,
            docker,
            form,
            version,
            settings,
        })
    }

    /// Creates a project for an already known tool version.
    #[cfg(test)]
    pub(crate) fn with_version(
        name: impl Into<String>,
        paths: Vec<PathBuf>,
        settings: ComposeSettings,
        docker: Docker,
        version: ComposeVersion,
    ) -> Self {
        let form = if settings.standalone {
            ToolForm::Standalone
        } else {
            ToolForm::Plugin
        };
        Self {
            name: name.into(),
            paths,
            runner: docker.runner(),
            docker,
            form,
            version,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> ComposeVersion {
        self.version
    }

    /// Name of the first container of `service`.
    pub fn container_name(&self, service: &str) -> String {
        if self.version.uses_legacy_container_names() {
            format!("{}_{}_1", self.name, service)
        } else {
            format!("{}-{}-1", self.name, service)
        }
    }

    fn program(&self) -> (String, Vec<String>) {
        match self.form {
            ToolForm::Plugin => (self.docker.binary().to_string(), vec!["compose".to_string()]),
            ToolForm::Standalone => (STANDALONE_BINARY.to_string(), Vec::new()),
        }
    }

    pub(crate) fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for path in &self.paths {
            args.push("-f".to_string());
            args.push(path.display().to_string());
        }
        if self.settings.disable_ansi {
            if self.version.supports_progress_flag() {
                args.extend(["--progress".to_string(), "plain".to_string()]);
            } else {
                args.extend(["--ansi".to_string(), "never".to_string()]);
            }
        }
        args.push("-p".to_string());
        args.push(self.name.clone());
        args
    }

    pub(crate) fn up_args(&self, opts: &CommandOptions, flags: UpFlags) -> Vec<String> {
        let mut args = vec!["up".to_string()];
        if self.settings.disable_pull_progress {
            args.push("--quiet-pull".to_string());
        }
        if flags.build {
            args.push("--build".to_string());
        }
        if flags.detach {
            args.push("-d".to_string());
        }
        args.extend(opts.extra_args.iter().cloned());
        args.extend(opts.services.iter().cloned());
        args
    }

    pub(crate) fn down_args(&self, opts: &CommandOptions, flags: DownFlags) -> Vec<String> {
        let mut args = vec!["down".to_string()];
        if flags.volumes {
            args.push("--volumes".to_string());
        }
        args.extend(opts.extra_args.iter().cloned());
        args
    }

    pub(crate) fn stop_args(&self, opts: &CommandOptions, timeout: Option<Duration>) -> Vec<String> {
        let mut args = vec!["stop".to_string()];
        if let Some(timeout) = timeout {
            args.push("-t".to_string());
            args.push(timeout.as_secs().to_string());
        }
        args.extend(opts.extra_args.iter().cloned());
        args
    }

    pub(crate) fn kill_args(&self, opts: &CommandOptions, signal: Option<&str>) -> Vec<String> {
        let mut args = vec!["kill".to_string()];
        if let Some(signal) = signal {
            args.push("-s".to_string());
            args.push(signal.to_string());
        }
        args.extend(opts.extra_args.iter().cloned());
        args.extend(opts.services.iter().cloned());
        args
    }

    pub(crate) fn pull_args(&self, opts: &CommandOptions) -> Vec<String> {
        let mut args = vec!["pull".to_string()];
        if self.settings.disable_pull_progress {
            args.push("--quiet".to_string());
        }
        args.extend(opts.extra_args.iter().cloned());
        args.extend(opts.services.iter().cloned());
        args
    }

    fn verb_args(verb: &str, opts: &CommandOptions) -> Vec<String> {
        let mut args = vec![verb.to_string()];
        args.extend(opts.extra_args.iter().cloned());
        args.extend(opts.services.iter().cloned());
        args
    }

    async fn run(
        &self,
        verb_args: Vec<String>,
        env: &Environment,
        capture_stdout: bool,
        cancel: &CancellationToken,
    ) -> Result<Output> {
        let (program, prefix) = self.program();
        let mut invocation = Invocation::new(program)
            .args(prefix)
            .args(self.base_args())
            .args(verb_args)
            .env(env.clone())
            .pty(self.settings.use_pty);
        if capture_stdout {
            invocation = invocation.capture_stdout();
        }
        self.runner.run(invocation, cancel).await
    }

    pub async fn up(&self, opts: &CommandOptions, flags: UpFlags, cancel: &CancellationToken) -> Result<()> {
        self.run(self.up_args(opts, flags), &opts.env, false, cancel)
            .await
            .wrap_err("running Docker Compose up command failed")?;
        Ok(())
    }

    pub async fn down(&self, opts: &CommandOptions, flags: DownFlags, cancel: &CancellationToken) -> Result<()> {
        self.run(self.down_args(opts, flags), &opts.env, false, cancel)
            .await
            .wrap_err("running Docker Compose down command failed")?;
        Ok(())
    }

    /// Stops the services, waiting `timeout` before killing them. `None` keeps
    /// the tool's own default.
    pub async fn stop(
        &self,
        opts: &CommandOptions,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(self.stop_args(opts, timeout), &opts.env, false, cancel)
            .await
            .wrap_err("running Docker Compose stop command failed")?;
        Ok(())
    }

    pub async fn kill(&self, opts: &CommandOptions, signal: Option<&str>, cancel: &CancellationToken) -> Result<()> {
        self.run(self.kill_args(opts, signal), &opts.env, false, cancel)
            .await
            .wrap_err("running Docker Compose kill command failed")?;
        Ok(())
    }

    pub async fn pull(&self, opts: &CommandOptions, cancel: &CancellationToken) -> Result<()> {
        self.run(self.pull_args(opts), &opts.env, false, cancel)
            .await
            .wrap_err("running Docker Compose pull command failed")?;
        Ok(())
    }

    /// Renders the merged configuration.
    pub async fn config(&self, opts: &CommandOptions, cancel: &CancellationToken) -> Result<Config> {
        let output = self
            .run(Self::verb_args("config", opts), &opts.env, true, cancel)
            .await
            .wrap_err("running Docker Compose config command failed")?;
        Config::parse(&output.stdout)
    }

    pub async fn logs(&self, opts: &CommandOptions, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let output = self
            .run(Self::verb_args("logs", opts), &opts.env, true, cancel)
            .await
            .wrap_err("running Docker Compose logs command failed")?;
        Ok(output.stdout)
    }

    /// IDs of every container of the project, or of `services` when given.
    pub async fn container_ids(&self, opts: &CommandOptions, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut args = vec!["ps".to_string(), "-a".to_string(), "-q".to_string()];
        args.extend(opts.services.iter().cloned());
        let output = self
            .run(args, &opts.env, true, cancel)
            .await
            .wrap_err("running Docker Compose ps command failed")?;
        Ok(output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Exit code of the single container of `service`, if it has exited.
    pub async fn service_exit_code(
        &self,
        service: &str,
        opts: &CommandOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<i32>> {
        let scoped = CommandOptions {
            services: vec![service.to_string()],
            ..opts.clone()
        };
        let ids = self.container_ids(&scoped, cancel).await?;
        let [id] = ids.as_slice() else {
            bail!("expected exactly one container for service {service}, found {}", ids.len());
        };
        let containers = self.docker.inspect_containers(std::slice::from_ref(id), cancel).await?;
        let container = containers
            .first()
            .ok_or_else(|| eyre!("container {id} of service {service} not found"))?;
        Ok((container.state.status == "exited").then_some(container.state.exit_code))
    }

    /// Waits until every container of the project is healthy.
    ///
    /// Containers are listed once up front and then inspected on every poll.
    pub async fn wait_for_healthy(&self, opts: &CommandOptions, cancel: &CancellationToken) -> Result<()> {
        let ids = self.container_ids(opts, cancel).await?;
        health::wait_for_healthy(&ids, &self.settings.health, cancel, |ids| {
            let docker = self.docker.clone();
            let cancel = cancel.clone();
            async move { docker.inspect_containers(&ids, &cancel).await }
        })
        .await
    }
}

async fn detect_tool(
    docker: &Docker,
    runner: &DynCommandRunner,
    standalone: bool,
    cancel: &CancellationToken,
) -> Result<(ToolForm, ComposeVersion)> {
    if !standalone {
        let probe = Invocation::new(docker.binary())
            .args(["compose", "version", "--short"])
            .capture_stdout();
        match runner.run(probe, cancel).await {
            Ok(output) => return Ok((ToolForm::Plugin, output.stdout_lossy().parse()?)),
            Err(err) if matches!(err.downcast_ref::<CommandError>(), Some(CommandError::Cancelled { .. })) => {
                return Err(err)
            }
            Err(err) => debug!("Docker Compose plugin not available, trying {}: {:#}", STANDALONE_BINARY, err),
        }
    }

    let probe = Invocation::new(STANDALONE_BINARY)
        .args(["version", "--short"])
        .capture_stdout();
    let output = runner
        .run(probe, cancel)
        .await
        .wrap_err("Docker Compose is not available")?;
    Ok((ToolForm::Standalone, output.stdout_lossy().parse()?))
}
