use super::compose::{ComposeDeployedService, Flavor, FLEET_AGENT_PREFIX};
use super::info::{ServiceInfo, SERVICE_LOGS_DIR_ENV};
use super::{DeployedService, LifecycleState, RunFlags, Runtime, ServiceDeployer};
use crate::compose::CommandOptions;
use crate::environment::Environment;
use crate::variants::ServiceVariant;
use crate::Result;
use eyre::WrapErr;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const ENV_FILE: &str = "env.yml";
pub const OUTPUT_PREFIX: &str = "TF_OUTPUT_";
pub const OUTPUT_FILE: &str = "tfOutputValues.json";

const SERVICE_NAME: &str = "terraform";
const DEPLOYER_DIR: &str = "terraform";
const DEPLOYER_FILE: &str = "terraform-deployer.yml";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);

const STATIC_FILES: [(&str, &str, u32); 3] = [
    (DEPLOYER_FILE, include_str!("_static/terraform-deployer.yml"), 0o644),
    ("run.sh", include_str!("_static/terraform-run.sh"), 0o755),
    ("Dockerfile", include_str!("_static/Dockerfile.terraform"), 0o644),
];

/// Provisions infrastructure from the package's Terraform definitions through
/// a compose service that runs `terraform apply`.
pub struct TerraformDeployer {
    runtime: Runtime,
    definitions_dir: PathBuf,
}

impl TerraformDeployer {
    pub fn new(runtime: Runtime, definitions_dir: PathBuf) -> Self {
        Self {
            runtime,
            definitions_dir,
        }
    }
}

impl ServiceDeployer for TerraformDeployer {
    fn name(&self) -> &'static str {
        "tf"
    }

    fn prepare(&self, mut info: ServiceInfo) -> Box<dyn DeployedService> {
        let locations = &self.runtime.config.locations;
        let config_dir = locations
            .deployer_dir()
            .join(DEPLOYER_DIR)
            .join(format!("{}-{}", info.name, info.test.run_id));
        let output_dir = locations.service_output_dir().join(&info.test.run_id);

        let mut paths = vec![config_dir.join(DEPLOYER_FILE)];
        let env_file = self.definitions_dir.join(ENV_FILE);
        if env_file.is_file() {
            paths.push(env_file);
        }

        let mut env = Environment::new()
            .with(SERVICE_LOGS_DIR_ENV, info.logs.local.display().to_string())
            .with("TF_VAR_TEST_RUN_ID", info.test.run_id.clone())
            .with("TF_DIR", self.definitions_dir.display().to_string())
            .with("TF_OUTPUT_DIR", output_dir.display().to_string());
        env.extend(self.runtime.config.passthrough_env.clone());

        info.output_dir = Some(output_dir);
        Box::new(ComposeDeployedService {
            project_name: info.project_name(),
            runtime: self.runtime.clone(),
            flags: RunFlags::default(),
            paths,
            env,
            variant: ServiceVariant::default(),
            shutdown_timeout: Some(SHUTDOWN_TIMEOUT),
            flavor: Flavor::Terraform { config_dir },
            info,
            state: LifecycleState::Created,
            project: None,
        })
    }
}

fn install_files(config_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(config_dir)
        .wrap_err_with(|| format!("can't create directory {}", config_dir.display()))?;
    for (name, content, mode) in STATIC_FILES {
        let path = config_dir.join(name);
        std::fs::write(&path, content).wrap_err_with(|| format!("can't write {}", path.display()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .wrap_err_with(|| format!("can't set permissions of {}", path.display()))?;
    }
    Ok(())
}

pub(crate) async fn set_up(
    service: &mut ComposeDeployedService,
    config_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    debug!("Setting up service using Terraform deployer");
    install_files(config_dir).wrap_err("can't install Docker Compose definitions")?;
    if let Some(output_dir) = &service.info.output_dir {
        std::fs::create_dir_all(output_dir).wrap_err("failed to create output directory")?;
    }

    let project = service.project(cancel).await?;
    service.clean_service_logs()?;

    // The runner's environment is exposed to templates as custom properties
    let config = project
        .config(&CommandOptions::new(service.env.clone()), cancel)
        .await
        .wrap_err("could not get Docker Compose configuration for service")?;
    if let Some(terraform) = config.services.get(SERVICE_NAME) {
        for (key, value) in terraform.environment.iter() {
            service
                .info
                .custom_properties
                .insert(key.clone(), Value::String(value.clone()));
        }
    }

    service.bring_up(&project, cancel).await?;
    service
        .wait_for_healthy(&project, "Terraform deployer is unhealthy", cancel)
        .await?;

    service.info.agent.host_name_prefix = FLEET_AGENT_PREFIX.to_string();
    add_outputs(&mut service.info).wrap_err("could not handle terraform output")
}

#[derive(Deserialize)]
struct OutputMeta {
    #[serde(default)]
    value: Value,
}

/// Reads `terraform output -json` results into the custom properties.
///
/// Outputs are prefixed with [`OUTPUT_PREFIX`]; object outputs are flattened
/// into dotted keys such as `TF_OUTPUT_queue.url`.
pub fn add_outputs(info: &mut ServiceInfo) -> Result<()> {
    let Some(output_dir) = &info.output_dir else {
        return Ok(());
    };
    let path = output_dir.join(OUTPUT_FILE);
    let content = std::fs::read(&path).wrap_err("failed to read terraform output file")?;
    let outputs: BTreeMap<String, OutputMeta> =
        serde_json::from_slice(&content).wrap_err("error during JSON unmarshal")?;

    for (name, output) in outputs {
        flatten_into(&mut info.custom_properties, format!("{OUTPUT_PREFIX}{name}"), output.value);
    }
    Ok(())
}

fn flatten_into(props: &mut BTreeMap<String, Value>, key: String, value: Value) {
    match value {
        Value::Object(fields) => {
            for (field, nested) in fields {
                flatten_into(props, format!("{key}.{field}"), nested);
            }
        }
        other => {
            props.insert(key, other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::testing::{compose_verb, docker_responder, runtime, FakeDocker};
    use crate::runner::fake::ScriptedRunner;
    use serde_json::json;
    use tempfile::TempDir;

    fn info_with_outputs(dir: &TempDir, outputs: &str) -> ServiceInfo {
        let mut info = ServiceInfo::new("sqs", "abc", dir.path().join("logs"));
        std::fs::write(dir.path().join(OUTPUT_FILE), outputs).unwrap();
        info.output_dir = Some(dir.path().to_path_buf());
        info
    }

    #[test]
    fn test_scalar_outputs() {
        let dir = TempDir::new().unwrap();
        let mut info = info_with_outputs(
            &dir,
            r#"{
              "queue_url": {"sensitive": false, "type": "string", "value": "https://sqs.us-east-1.amazonaws.com/1234654/queue"},
              "instance_id": {"sensitive": false, "type": "string", "value": "some-random-id"}
            }"#,
        );
        add_outputs(&mut info).unwrap();

        assert_eq!(info.custom_properties.len(), 2);
        assert_eq!(
            info.custom_properties["TF_OUTPUT_queue_url"],
            json!("https://sqs.us-east-1.amazonaws.com/1234654/queue")
        );
        assert_eq!(info.custom_properties["TF_OUTPUT_instance_id"], json!("some-random-id"));
    }

    #[test]
    fn test_object_outputs_are_flattened() {
        let dir = TempDir::new().unwrap();
        let mut info = info_with_outputs(
            &dir,
            r#"{
              "triangle_output": {
                "sensitive": false,
                "type": ["object", {"description": "string", "s_one": "number"}],
                "value": {"description": "this is a triangle", "s_one": 1, "s_two": 2.5, "s_three": 2.5}
              }
            }"#,
        );
        add_outputs(&mut info).unwrap();

        let props = &info.custom_properties;
        assert_eq!(props["TF_OUTPUT_triangle_output.description"], json!("this is a triangle"));
        assert_eq!(props["TF_OUTPUT_triangle_output.s_one"], json!(1));
        assert_eq!(props["TF_OUTPUT_triangle_output.s_two"], json!(2.5));
        assert_eq!(props.len(), 4);
    }

    #[test]
    fn test_invalid_output_json() {
        let dir = TempDir::new().unwrap();
        let mut info = info_with_outputs(&dir, "{not json");
        assert!(add_outputs(&mut info).is_err());
    }

    #[tokio::test]
    async fn test_set_up_and_tear_down() {
        let dir = TempDir::new().unwrap();
        let definitions = dir.path().join("tf");
        std::fs::create_dir_all(&definitions).unwrap();
        std::fs::write(definitions.join(ENV_FILE), "services: {}\n").unwrap();

        let config = "services:\n  terraform:\n    environment:\n      TF_VAR_TEST_RUN_ID: abc\n      AWS_REGION: eu-west-1\n";
        let runner = ScriptedRunner::new(docker_responder(FakeDocker::default().config(config)));
        let deployer = TerraformDeployer::new(runtime(runner.clone(), dir.path()), definitions.clone());
        let mut service = deployer.prepare(ServiceInfo::new("sqs", "abc", dir.path().join("logs")));

        // terraform apply writes its outputs while the service starts
        let output_dir = dir.path().join("tmp/output/abc");
        std::fs::create_dir_all(&output_dir).unwrap();
        std::fs::write(output_dir.join(OUTPUT_FILE), r#"{"queue_url": {"value": "https://q"}}"#).unwrap();

        service.set_up(&CancellationToken::new()).await.unwrap();

        let config_dir = dir.path().join("deployer/terraform/sqs-abc");
        assert!(config_dir.join("terraform-deployer.yml").is_file());
        let mode = std::fs::metadata(config_dir.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let info = service.info();
        assert_eq!(info.custom_properties["AWS_REGION"], json!("eu-west-1"));
        assert_eq!(info.custom_properties["TF_OUTPUT_queue_url"], json!("https://q"));
        assert_eq!(info.agent.host_name_prefix, "docker-fleet-agent");

        let up = runner.calls().into_iter().find(|c| compose_verb(c).as_deref() == Some("up")).unwrap();
        assert!(up.args.contains(&definitions.join(ENV_FILE).display().to_string()));
        assert_eq!(up.env.get("TF_DIR"), Some(&definitions.display().to_string()));

        service.tear_down(&CancellationToken::new()).await.unwrap();
        let stop = runner.calls().into_iter().find(|c| compose_verb(c).as_deref() == Some("stop")).unwrap();
        assert!(stop.args.ends_with(&["stop".to_string(), "-t".to_string(), "300".to_string()]));
        assert!(!config_dir.exists());
        assert!(!output_dir.exists());
    }
}
