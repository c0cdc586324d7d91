use super::compose::{ComposeDeployedService, Flavor};
use super::info::{ServiceInfo, ELASTIC_AGENT_TAGS_ENV, FLEET_POLICY_ENV, LOCAL_CA_CERT_ENV, SERVICE_LOGS_DIR_ENV};
use super::{DeployedService, LifecycleState, RunFlags, Runtime, ServiceDeployer};
use crate::environment::Environment;
use crate::stack;
use crate::variants::ServiceVariant;
use crate::Result;
use eyre::WrapErr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const CUSTOM_AGENT_FILE: &str = "custom-agent.yml";
pub const SERVICE_NAME: &str = "docker-custom-agent";

const AGENT_HOSTNAME_ENV: &str = "AGENT_HOSTNAME";
const FLEET_URL_ENV: &str = "FLEET_URL";
const KIBANA_HOST_ENV: &str = "KIBANA_HOST";

const BASE_DIR: &str = "docker_custom_agent";
const BASE_FILE: &str = "docker-custom-agent-base.yml";
const BASE_CONTENT: &str = include_str!("_static/docker-custom-agent-base.yml");

/// Runs a dedicated Elastic Agent container defined by the package's
/// `custom-agent.yml` on top of a generated base service.
pub struct CustomAgentDeployer {
    runtime: Runtime,
    compose_file: PathBuf,
    variant: ServiceVariant,
    package_name: String,
    data_stream: Option<String>,
    flags: RunFlags,
}

impl CustomAgentDeployer {
    pub fn new(
        runtime: Runtime,
        compose_file: PathBuf,
        variant: ServiceVariant,
        package_name: impl Into<String>,
        data_stream: Option<String>,
        flags: RunFlags,
    ) -> Self {
        Self {
            runtime,
            compose_file,
            variant,
            package_name: package_name.into(),
            data_stream,
            flags,
        }
    }

    fn agent_name(&self) -> String {
        let mut name = self.package_name.clone();
        if self.variant.is_active() {
            name = format!("{name}-{}", self.variant.name);
        }
        match self.data_stream.as_deref() {
            Some(data_stream) if !data_stream.is_empty() && data_stream != "." => format!("{name}-{data_stream}"),
            _ => name,
        }
    }

    fn agent_hostname(&self, run_id: &str) -> String {
        format!("{SERVICE_NAME}-{}-{run_id}", self.agent_name())
    }
}

impl ServiceDeployer for CustomAgentDeployer {
    fn name(&self) -> &'static str {
        "agent"
    }

    fn prepare(&self, info: ServiceInfo) -> Box<dyn DeployedService> {
        let base_file = self.runtime.config.locations.deployer_dir().join(BASE_DIR).join(BASE_FILE);
        Box::new(ComposeDeployedService {
            project_name: info.project_name(),
            runtime: self.runtime.clone(),
            flags: self.flags,
            paths: vec![self.compose_file.clone(), base_file],
            env: Environment::new(),
            variant: self.variant.clone(),
            shutdown_timeout: None,
            flavor: Flavor::CustomAgent {
                hostname: self.agent_hostname(&info.test.run_id),
            },
            info,
            state: LifecycleState::Created,
            project: None,
        })
    }
}

fn install_base_file(deployer_dir: &Path) -> Result<()> {
    let dir = deployer_dir.join(BASE_DIR);
    std::fs::create_dir_all(&dir).wrap_err("failed to create directory for custom agent files")?;
    std::fs::write(dir.join(BASE_FILE), BASE_CONTENT).wrap_err("failed to create docker compose file for custom agent")
}

fn agent_env(service: &ComposeDeployedService, hostname: &str) -> Result<Environment> {
    let stack = &service.runtime.config.stack;
    let ca_cert = stack.ca_cert().wrap_err("can't locate CA certificate")?;

    let mut env = stack.image_refs().as_env();
    env.set(SERVICE_LOGS_DIR_ENV, service.info.logs.local.display().to_string());
    env.set(LOCAL_CA_CERT_ENV, ca_cert.display().to_string());
    env.set(AGENT_HOSTNAME_ENV, hostname);
    env.set(ELASTIC_AGENT_TAGS_ENV, service.info.tags.join(","));
    env.set(FLEET_POLICY_ENV, stack.token_policy_name());
    env.set(FLEET_URL_ENV, stack.fleet_url.as_str());
    env.set(KIBANA_HOST_ENV, stack.kibana_url.as_str());
    Ok(env)
}

pub(crate) async fn set_up(service: &mut ComposeDeployedService, hostname: &str, cancel: &CancellationToken) -> Result<()> {
    debug!("Setting up service using the custom agent deployer");
    service.env = agent_env(service, hostname)?;
    install_base_file(&service.runtime.config.locations.deployer_dir())
        .wrap_err("could not create resources for custom agent")?;

    let project = service.project(cancel).await?;
    let docker = service.runtime.docker();
    stack::ensure_network_up(&docker, &service.runtime.config.stack, cancel).await?;
    service.clean_service_logs()?;

    service.info.name = SERVICE_NAME.to_string();
    service.bring_up(&project, cancel).await?;
    if service.flags.skips_bring_up() {
        debug!("Skipping connect container to network (non setup steps)");
    } else {
        // The agent has to reach Fleet while it starts
        let network = &service.runtime.config.stack.network;
        docker
            .connect_to_network(network, &project.container_name(SERVICE_NAME), &[], cancel)
            .await
            .wrap_err("can't attach service container to the stack network")?;
    }
    service.wait_for_healthy(&project, "service is unhealthy", cancel).await?;

    service.info.hostname = hostname.to_string();
    service.discover_ports(&project, SERVICE_NAME, cancel).await?;
    service.info.agent.host_name_prefix = SERVICE_NAME.to_string();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::testing::{compose_verb, docker_responder, FakeDocker};
    use crate::compose::ComposeSettings;
    use crate::config::{Config, Locations};
    use crate::runner::fake::ScriptedRunner;
    use crate::stack::StackSettings;
    use std::sync::Arc;
    use tempfile::TempDir;

    const CONFIG: &str = "services:\n  docker-custom-agent:\n    image: agent\n    ports:\n      - \"5066\"\n";

    fn runtime(runner: Arc<ScriptedRunner>, dir: &TempDir) -> Runtime {
        let ca_cert = dir.path().join("ca-cert.pem");
        std::fs::write(&ca_cert, "pem").unwrap();
        let config = Config {
            compose: ComposeSettings {
                use_pty: false,
                ..Default::default()
            },
            stack: StackSettings {
                version: Some("8.15.0".to_string()),
                ca_cert_path: Some(ca_cert),
                ..Default::default()
            },
            locations: Locations::new(dir.path().to_path_buf()),
            ..Default::default()
        };
        Runtime::new(runner, config)
    }

    fn deployer(runtime: Runtime, dir: &TempDir, variant: ServiceVariant, data_stream: Option<&str>) -> CustomAgentDeployer {
        let compose_file = dir.path().join(CUSTOM_AGENT_FILE);
        std::fs::write(&compose_file, "services: {}\n").unwrap();
        CustomAgentDeployer::new(
            runtime,
            compose_file,
            variant,
            "auditd_manager",
            data_stream.map(str::to_string),
            RunFlags::default(),
        )
    }

    #[test]
    fn test_agent_hostname() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(docker_responder(FakeDocker::default()));
        let variant = ServiceVariant {
            name: "v2".to_string(),
            env: Environment::new(),
        };

        let plain = deployer(runtime(runner.clone(), &dir), &dir, ServiceVariant::default(), Some("."));
        assert_eq!(plain.agent_hostname("abc"), "docker-custom-agent-auditd_manager-abc");

        let full = deployer(runtime(runner, &dir), &dir, variant, Some("auditd"));
        assert_eq!(full.agent_hostname("abc"), "docker-custom-agent-auditd_manager-v2-auditd-abc");
    }

    #[tokio::test]
    async fn test_set_up_attaches_before_health_wait() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(docker_responder(FakeDocker::default().config(CONFIG)));
        let deployer = deployer(runtime(runner.clone(), &dir), &dir, ServiceVariant::default(), None);
        let mut info = ServiceInfo::new("auditd", "0123456789ab", dir.path().join("logs"));
        info.tags = vec!["a".to_string(), "b".to_string()];
        let mut service = deployer.prepare(info);

        service.set_up(&CancellationToken::new()).await.unwrap();

        let info = service.info();
        assert_eq!(info.name, SERVICE_NAME);
        assert_eq!(info.hostname, "docker-custom-agent-auditd_manager-0123456789ab");
        assert_eq!(info.agent.host_name_prefix, SERVICE_NAME);
        assert_eq!(info.ports, vec![5066]);
        assert!(dir.path().join("deployer/docker_custom_agent").join(BASE_FILE).is_file());

        let argv = runner.argv();
        let connect = argv
            .iter()
            .position(|a| a == "network connect testbed-stack_default testbed-service-0123456789ab-docker-custom-agent-1")
            .unwrap();
        let health = runner
            .calls()
            .iter()
            .position(|c| compose_verb(c).as_deref() == Some("ps"))
            .unwrap();
        assert!(connect < health);

        let up = runner.calls().into_iter().find(|c| compose_verb(c).as_deref() == Some("up")).unwrap();
        assert_eq!(up.env.get("ELASTIC_AGENT_TAGS"), Some(&"a,b".to_string()));
        assert_eq!(up.env.get("FLEET_TOKEN_POLICY_NAME"), Some(&"Elastic-Agent (testbed)".to_string()));
        assert_eq!(up.env.get("FLEET_URL"), Some(&"https://fleet-server:8220".to_string()));
        assert_eq!(
            up.env.get("ELASTIC_AGENT_IMAGE_REF"),
            Some(&"docker.elastic.co/elastic-agent/elastic-agent:8.15.0".to_string())
        );
        assert!(up.env.get("LOCAL_CA_CERT").unwrap().ends_with("ca-cert.pem"));
    }

    #[tokio::test]
    async fn test_missing_ca_cert_fails_before_running_anything() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(docker_responder(FakeDocker::default()));
        let runtime = crate::deployer::testing::runtime(runner.clone(), dir.path());
        let deployer = deployer(runtime, &dir, ServiceVariant::default(), None);
        let mut service = deployer.prepare(ServiceInfo::new("auditd", "abc", dir.path().join("logs")));

        let err = service.set_up(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "can't locate CA certificate");
        assert!(runner.calls().is_empty());
        assert_eq!(service.state(), LifecycleState::Failed);
    }
}
