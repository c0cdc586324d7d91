use super::compose::{ComposeDeployer, COMPOSE_FILE};
use super::custom_agent::{CustomAgentDeployer, CUSTOM_AGENT_FILE};
use super::kubernetes::KubernetesDeployer;
use super::terraform::TerraformDeployer;
use super::{DeployerError, RunFlags, Runtime, ServiceDeployer};
use crate::variants::{self, ServiceVariant};
use crate::Result;
use eyre::WrapErr;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEV_DEPLOY_DIR: &str = "_dev/deploy";

/// Deployment strategies in selection priority.
const KINDS: [Kind; 4] = [Kind::Docker, Kind::Agent, Kind::Kubernetes, Kind::Terraform];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Docker,
    Agent,
    Kubernetes,
    Terraform,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::Docker => "docker",
            Kind::Agent => "agent",
            Kind::Kubernetes => "k8s",
            Kind::Terraform => "tf",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        KINDS.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether the definitions of this strategy exist under `dev_deploy`.
    fn is_defined(self, dev_deploy: &Path) -> bool {
        let dir = dev_deploy.join(self.name());
        match self {
            Kind::Docker => dir.join(COMPOSE_FILE).is_file(),
            Kind::Agent => dir.join(CUSTOM_AGENT_FILE).is_file(),
            Kind::Kubernetes | Kind::Terraform => dir.is_dir(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FactoryOptions {
    pub package_root: PathBuf,
    pub data_stream_root: Option<PathBuf>,
    pub package_name: String,
    pub data_stream: Option<String>,
    /// Strategy requested by name instead of by priority
    pub deployer: Option<String>,
    pub variant: Option<String>,
    pub independent_agent: bool,
    pub flags: RunFlags,
}

/// The `_dev/deploy` directory of a data stream, falling back to the
/// package's own.
pub fn find_dev_deploy_path(data_stream_root: Option<&Path>, package_root: &Path) -> Result<PathBuf> {
    let candidates = data_stream_root.into_iter().chain(std::iter::once(package_root));
    for root in candidates {
        let path = root.join(DEV_DEPLOY_DIR);
        if path.is_dir() {
            return Ok(path);
        }
    }
    Err(DeployerError::DevDeployNotFound.into())
}

fn select_kind(dev_deploy: &Path, requested: Option<&str>) -> Result<Kind> {
    match requested {
        Some(name) => {
            let kind = Kind::from_name(name).ok_or_else(|| DeployerError::UnsupportedDeployer { name: name.to_string() })?;
            if !kind.is_defined(dev_deploy) {
                return Err(DeployerError::ExpectedDeployerMissing { name: name.to_string() }.into());
            }
            Ok(kind)
        }
        None => KINDS.into_iter().find(|kind| kind.is_defined(dev_deploy)).ok_or_else(|| {
            DeployerError::NoSuitableDeployer {
                path: dev_deploy.to_path_buf(),
            }
            .into()
        }),
    }
}

fn resolve_variant(dir: &Path, selected: Option<&str>) -> Result<ServiceVariant> {
    variants::resolve(dir, selected).wrap_err("can't use service variant")
}

/// Picks the deployment strategy for a package.
pub fn factory(runtime: Runtime, options: FactoryOptions) -> Result<Box<dyn ServiceDeployer>> {
    let dev_deploy = find_dev_deploy_path(options.data_stream_root.as_deref(), &options.package_root)
        .wrap_err("can't find \"_dev/deploy\" directory")?;
    let kind = select_kind(&dev_deploy, options.deployer.as_deref())?;
    let dir = dev_deploy.join(kind.name());
    debug!("Using {} service deployer from {}", kind.name(), dir.display());

    // Variants are shared by every strategy of the package

    let deployer: Box<dyn ServiceDeployer> = match kind {
        Kind::Docker => Box::new(ComposeDeployer::new(
            runtime,
            vec![dir.join(COMPOSE_FILE)],
            resolve_variant(&dev_deploy, options.variant.as_deref())?,
            options.independent_agent,
            options.flags,
        )),
        Kind::Agent => Box::new(CustomAgentDeployer::new(
            runtime,
            dir.join(CUSTOM_AGENT_FILE),
            resolve_variant(&dev_deploy, options.variant.as_deref())?,
            options.package_name,
            options.data_stream,
            options.flags,
        )),
        Kind::Kubernetes => Box::new(KubernetesDeployer::new(
            runtime,
            dir,
            options.independent_agent,
            options.flags,
        )),
        Kind::Terraform => {
            if options.flags.is_step() {
                return Err(DeployerError::StepsNotSupported {
                    name: kind.name().to_string(),
                }
                .into());
            }
            Box::new(TerraformDeployer::new(runtime, dir))
        }
    };
    Ok(deployer)
}
