use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use eyre::{eyre, WrapErr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compose::ComposeSettings;
use crate::config::{passthrough_from_process, Config, Locations, SettingsFile};
use crate::deployer::info::new_run_id;
use crate::deployer::{factory, find_dev_deploy_path, DeployedService, FactoryOptions, RunFlags, Runtime, ServiceInfo};
use crate::imagesgc::ImagesGc;
use crate::runner::ProcessRunner;
use crate::stack::{StackSettings, DEFAULT_FLEET_URL, DEFAULT_KIBANA_URL, DEFAULT_NETWORK};
use crate::variants::{VariantsFile, VARIANTS_FILE};

type Result<T> = color_eyre::eyre::Result<T>;

/// Ephemeral service environments for integration package tests
#[derive(Debug, Parser)]
#[command(name = "testbed")]
#[command(about = "Ephemeral service environments for integration package tests")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Mirror the output of external commands and log at debug level
    #[arg(long, global = true, env = "TESTBED_DEBUG", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub debug: bool,

    /// YAML settings file
    #[arg(long, global = true, env = "TESTBED_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Directory for caches, generated files and logs (default: ~/.testbed)
    #[arg(long, global = true, env = "TESTBED_DATA_HOME")]
    pub data_home: Option<PathBuf>,

    /// Folder shared with the service for its log files
    #[arg(long, global = true, env = "TESTBED_SERVICE_LOGS_DIR")]
    pub service_logs_dir: Option<PathBuf>,

    /// Use the standalone docker-compose binary
    #[arg(long, global = true, env = "TESTBED_COMPOSE_ENABLE_STANDALONE", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub compose_standalone: bool,

    /// Disable colors and progress output of compose
    #[arg(long, global = true, env = "TESTBED_COMPOSE_DISABLE_ANSI", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub compose_disable_ansi: bool,

    /// Disable image pull progress of compose
    #[arg(long, global = true, env = "TESTBED_COMPOSE_DISABLE_PULL_PROGRESS", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub compose_disable_pull_progress: bool,

    /// Run compose without a pseudo terminal
    #[arg(long, global = true)]
    pub no_pty: bool,

    /// Network of the running stack
    #[arg(long, global = true, env = "TESTBED_STACK_NETWORK", default_value = DEFAULT_NETWORK)]
    pub stack_network: String,

    /// Version of the running stack
    #[arg(long, global = true, env = "TESTBED_STACK_VERSION")]
    pub stack_version: Option<String>,

    /// CA certificate of the stack
    #[arg(long, global = true, env = "TESTBED_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    #[arg(long, global = true, env = "TESTBED_ELASTIC_AGENT_IMAGE_REF")]
    pub elastic_agent_image: Option<String>,

    #[arg(long, global = true, env = "TESTBED_ELASTICSEARCH_IMAGE_REF")]
    pub elasticsearch_image: Option<String>,

    #[arg(long, global = true, env = "TESTBED_KIBANA_IMAGE_REF")]
    pub kibana_image: Option<String>,

    #[arg(long, global = true, default_value = DEFAULT_FLEET_URL)]
    pub fleet_url: String,

    #[arg(long, global = true, default_value = DEFAULT_KIBANA_URL)]
    pub kibana_url: String,

    /// Fleet policy agents enroll with
    #[arg(long, global = true)]
    pub policy_name: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the service under test
    #[command(subcommand)]
    Service(ServiceCommand),
    /// Manage the Docker images used by services
    #[command(subcommand)]
    Images(ImagesCommand),
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommand {
    /// Deploy the service, wait for interruption and tear it down
    Up(ServiceUpArgs),
    /// List the variants of the service
    Variants(PackageArgs),
}

#[derive(Debug, Subcommand)]
pub enum ImagesCommand {
    /// Pull images, tracking them for garbage collection
    Pull {
        #[arg(required = true)]
        images: Vec<String>,
    },
    /// Remove tracked images according to the GC settings
    Gc,
}

#[derive(Debug, Clone, Args)]
pub struct PackageArgs {
    /// Root directory of the package
    #[arg(long, default_value = ".")]
    pub package_root: PathBuf,

    /// Root directory of the data stream under test
    #[arg(long)]
    pub data_stream_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct ServiceUpArgs {
    #[command(flatten)]
    pub package: PackageArgs,

    /// Service name (default: data stream or package directory name)
    #[arg(long)]
    pub service: Option<String>,

    /// Deployer to use instead of picking one by priority
    #[arg(long)]
    pub deployer: Option<String>,

    #[arg(long)]
    pub variant: Option<String>,

    /// Identifier shared by the steps of one run
    #[arg(long)]
    pub run_id: Option<String>,

    /// Deploy the agent separately from the stack
    #[arg(long)]
    pub independent_agent: bool,

    /// Network of the independent agent
    #[arg(long)]
    pub agent_network: Option<String>,

    /// Comma-separated agent tags
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Only set up the service
    #[arg(long, conflicts_with_all = ["tests_only", "tear_down"])]
    pub setup: bool,

    /// Attach to a service set up by a previous run
    #[arg(long, conflicts_with = "tear_down")]
    pub tests_only: bool,

    /// Only tear down a service set up by a previous run
    #[arg(long)]
    pub tear_down: bool,
}

impl ServiceUpArgs {
    pub fn flags(&self) -> RunFlags {
        RunFlags {
            run_setup: self.setup,
            run_tests_only: self.tests_only,
            run_tear_down: self.tear_down,
        }
    }
}

impl Config {
    /// Builds the configuration from parsed arguments and the optional
    /// settings file.
    pub fn from_cli(args: &GlobalArgs) -> Result<Self> {
        let settings = match &args.settings {
            Some(path) => SettingsFile::load(path)?,
            None => SettingsFile::default(),
        };
        let data_home = args.data_home.clone().unwrap_or_else(Locations::default_data_home);

        Ok(Config {
            debug: args.debug,
            compose: ComposeSettings {
                standalone: args.compose_standalone,
                disable_ansi: args.compose_disable_ansi,
                disable_pull_progress: args.compose_disable_pull_progress,
                use_pty: !args.no_pty,
                ..Default::default()
            },
            stack: StackSettings {
                network: args.stack_network.clone(),
                version: args.stack_version.clone(),
                ca_cert_path: args.ca_cert.clone(),
                elastic_agent_image: args.elastic_agent_image.clone(),
                elasticsearch_image: args.elasticsearch_image.clone(),
                kibana_image: args.kibana_image.clone(),
                fleet_url: args.fleet_url.clone(),
                kibana_url: args.kibana_url.clone(),
                policy_name: args.policy_name.clone(),
            },
            locations: Locations::new(data_home).with_service_logs(args.service_logs_dir.clone()),
            images_gc: settings.images_gc.unwrap_or_default(),
            passthrough_env: passthrough_from_process(),
            ..Default::default()
        })
    }
}

fn dir_name(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).wrap_err_with(|| format!("can't resolve {}", path.display()))?;
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| eyre!("can't derive a name from {}", path.display()))
}

pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let config = Config::from_cli(&cli.global)?;
    let runner = Arc::new(ProcessRunner::new(config.runner_config()));
    let runtime = Runtime::new(runner, config);

    match cli.command {
        Command::Service(ServiceCommand::Up(args)) => service_up(runtime, args, &cancel).await,
        Command::Service(ServiceCommand::Variants(args)) => list_variants(&args),
        Command::Images(ImagesCommand::Pull { images }) => pull_images(&runtime, images, &cancel).await,
        Command::Images(ImagesCommand::Gc) => collect_images(&runtime, &cancel).await,
    }
}

async fn service_up(runtime: Runtime, args: ServiceUpArgs, cancel: &CancellationToken) -> Result<()> {
    let package_name = dir_name(&args.package.package_root)?;
    let data_stream = args.package.data_stream_root.as_deref().map(dir_name).transpose()?;
    let name = args
        .service
        .clone()
        .or_else(|| data_stream.clone())
        .unwrap_or_else(|| package_name.clone());
    let flags = args.flags();

    let deployer = factory(
        runtime.clone(),
        FactoryOptions {
            package_root: args.package.package_root.clone(),
            data_stream_root: args.package.data_stream_root.clone(),
            package_name,
            data_stream,
            deployer: args.deployer.clone(),
            variant: args.variant.clone(),
            independent_agent: args.independent_agent,
            flags,
        },
    )
    .wrap_err("can't create service deployer")?;

    let run_id = args.run_id.clone().unwrap_or_else(new_run_id);
    let mut info = ServiceInfo::new(name, run_id, runtime.config.locations.service_logs_dir());
    info.agent_network_name = args
        .agent_network
        .clone()
        .unwrap_or_else(|| runtime.config.stack.network.clone());
    info.tags = args.tags.clone();

    info!("Deploying service {} with the {} deployer", info.name, deployer.name());
    let mut service = deployer.prepare(info);

    if let Err(err) = service.set_up(cancel).await {
        if !flags.is_step() {
            tear_down(service.as_mut()).await;
        }
        return Err(err.wrap_err("could not set up service"));
    }

    if flags.run_tear_down {
        return service
            .tear_down(&CancellationToken::new())
            .await
            .wrap_err("could not tear down service");
    }

    let json = serde_json::to_string_pretty(service.info()).wrap_err("can't encode service info")?;
    println!("{json}");
    if flags.is_step() {
        return Ok(());
    }

    info!("Service is running, press Ctrl-C to tear it down");
    cancel.cancelled().await;
    service
        .tear_down(&CancellationToken::new())
        .await
        .wrap_err("could not tear down service")
}

async fn tear_down(service: &mut dyn DeployedService) {
    // The run's token may be what stopped set up
    if let Err(err) = service.tear_down(&CancellationToken::new()).await {
        warn!("Tearing down service after a failed set up: {:#}", err);
    }
}

fn list_variants(args: &PackageArgs) -> Result<()> {
    let dev_deploy = find_dev_deploy_path(args.data_stream_root.as_deref(), &args.package_root)?;
    let Some(file) = VariantsFile::load(&dev_deploy)? else {
        println!("No {VARIANTS_FILE} found in {}", dev_deploy.display());
        return Ok(());
    };
    for name in file.variants.keys() {
        let marker = if *name == file.default { " (default)" } else { "" };
        println!("{name}{marker}");
    }
    Ok(())
}

fn images_gc(runtime: &Runtime) -> Result<ImagesGc> {
    ImagesGc::from_cache_dir(
        &runtime.config.locations.cache_dir(),
        runtime.config.images_gc.clone(),
        Arc::new(runtime.docker()),
    )
}

async fn pull_images(runtime: &Runtime, images: Vec<String>, cancel: &CancellationToken) -> Result<()> {
    let mut gc = images_gc(runtime)?;
    gc.track(&images, cancel).await?;
    gc.persist()?;

    let docker = runtime.docker();
    for image in &images {
        info!("Pulling image {}", image);
        docker.pull(image, cancel).await?;
    }
    Ok(())
}

async fn collect_images(runtime: &Runtime, cancel: &CancellationToken) -> Result<()> {
    let mut gc = images_gc(runtime)?;
    let result = gc.run(cancel).await;
    gc.persist()?;
    result
}
