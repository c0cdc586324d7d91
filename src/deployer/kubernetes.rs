use super::info::ServiceInfo;
use super::{DeployedService, LifecycleState, NotSupported, RunFlags, Runtime, ServiceDeployer, TeardownError};
use crate::kind;
use crate::stack::StackSettings;
use crate::Result;
use async_trait::async_trait;
use eyre::WrapErr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const AGENT_MANIFEST: &str = include_str!("_static/elastic-agent-managed.yaml");

/// Deploys custom definitions into the kind cluster, optionally together
/// with an Elastic Agent DaemonSet enrolled into Fleet.
pub struct KubernetesDeployer {
    runtime: Runtime,
    definitions_dir: PathBuf,
    independent_agent: bool,
    flags: RunFlags,
}

impl KubernetesDeployer {
    pub fn new(runtime: Runtime, definitions_dir: PathBuf, independent_agent: bool, flags: RunFlags) -> Self {
        Self {
            runtime,
            definitions_dir,
            independent_agent,
            flags,
        }
    }
}

impl ServiceDeployer for KubernetesDeployer {
    fn name(&self) -> &'static str {
        "k8s"
    }

    fn prepare(&self, info: ServiceInfo) -> Box<dyn DeployedService> {
        Box::new(KubernetesDeployedService {
            runtime: self.runtime.clone(),
            definitions_dir: self.definitions_dir.clone(),
            independent_agent: self.independent_agent,
            flags: self.flags,
            info,
            state: LifecycleState::Created,
        })
    }
}

pub struct KubernetesDeployedService {
    runtime: Runtime,
    definitions_dir: PathBuf,
    independent_agent: bool,
    flags: RunFlags,
    info: ServiceInfo,
    state: LifecycleState,
}

/// The agent manifest with the stack's settings filled in.
pub fn render_agent_manifest(stack: &StackSettings) -> Result<String> {
    let ca_cert = stack.ca_cert_base64().wrap_err("can't read certificate authority file")?;
    Ok(AGENT_MANIFEST
        .replace("{{ca_cert_pem}}", &ca_cert)
        .replace("{{elastic_agent_image}}", &stack.image_refs().elastic_agent)
        .replace("{{fleet_url}}", &stack.fleet_url)
        .replace("{{kibana_url}}", &stack.kibana_url)
        .replace("{{token_policy_name}}", &stack.token_policy_name()))
}

/// `*.yaml` files directly inside `dir`, sorted by name.
pub fn find_definitions(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).wrap_err_with(|| format!("can't read definitions directory {}", dir.display())),
    };
    let mut definitions = Vec::new();
    for entry in entries {
        let path = entry
            .wrap_err_with(|| format!("can't read definitions directory {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "yaml") {
            definitions.push(path);
        }
    }
    definitions.sort();
    Ok(definitions)
}

impl KubernetesDeployedService {
    async fn install_agent(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Install Elastic Agent in the Kubernetes cluster");
        let manifest = render_agent_manifest(&self.runtime.config.stack)?;
        self.runtime
            .kubectl()
            .apply_stdin(manifest.as_bytes(), cancel)
            .await
            .wrap_err("can't install Elastic-Agent in Kubernetes cluster")
    }

    async fn apply_definitions(&self, cancel: &CancellationToken) -> Result<()> {
        let definitions = find_definitions(&self.definitions_dir)?;
        if definitions.is_empty() {
            debug!("No custom definitions found in {}", self.definitions_dir.display());
            return Ok(());
        }
        self.runtime
            .kubectl()
            .apply(&definitions, cancel)
            .await
            .wrap_err("can't install custom definitions")
    }

    async fn run_set_up(&mut self, cancel: &CancellationToken) -> Result<()> {
        kind::verify_context(&self.runtime.kubectl(), cancel).await?;

        if self.flags.skips_bring_up() {
            debug!("Skipping connect kind to the stack network (non setup steps)");
        } else {
            kind::connect_to_stack_network(&self.runtime.docker(), &self.runtime.config.stack.network, cancel)
                .await
                .wrap_err("can't connect control plane to Elastic stack network")?;
        }

        if self.flags.skips_bring_up() || self.independent_agent {
            debug!("Skipping installation of Elastic Agent in the cluster");
        } else {
            self.install_agent(cancel).await?;
        }

        if self.flags.run_tear_down {
            debug!("Skipping applying custom definitions (tear down step)");
        } else {
            self.apply_definitions(cancel).await?;
        }

        self.info.name = kind::CONTROL_PLANE_CONTAINER.to_string();
        self.info.hostname = kind::CONTROL_PLANE_CONTAINER.to_string();
        self.info.agent.host_name_prefix = kind::CONTROL_PLANE_CONTAINER.to_string();
        self.info.agent.independent = true;
        Ok(())
    }
}

#[async_trait]
impl DeployedService for KubernetesDeployedService {
    async fn set_up(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.state = LifecycleState::SettingUp;
        let result = self.run_set_up(cancel).await;
        self.state = match result {
            Ok(()) => LifecycleState::Running,
            Err(_) => LifecycleState::Failed,
        };
        result
    }

    async fn signal(&mut self, _signal: &str, _cancel: &CancellationToken) -> Result<()> {
        Err(NotSupported {
            deployer: "kubernetes",
            operation: "signal",
        }
        .into())
    }

    async fn exit_code(&self, _service: &str, _cancel: &CancellationToken) -> Result<Option<i32>> {
        Err(NotSupported {
            deployer: "kubernetes",
            operation: "exit code",
        }
        .into())
    }

    async fn tear_down(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state == LifecycleState::TornDown {
            return Ok(());
        }
        self.state = LifecycleState::TornDown;

        let definitions = match find_definitions(&self.definitions_dir) {
            Ok(definitions) => definitions,
            Err(err) => {
                return Err(TeardownError {
                    failures: vec![format!("{err:#}")],
                }
                .into())
            }
        };
        if definitions.is_empty() {
            debug!("No custom definitions to delete");
            return Ok(());
        }
        info!("Uninstall custom Kubernetes definitions");
        self.runtime.kubectl().delete(&definitions, cancel).await.map_err(|err| {
            TeardownError {
                failures: vec![format!("can't uninstall Kubernetes resources: {err:#}")],
            }
            .into()
        })
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
