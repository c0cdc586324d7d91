use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

pub const SERVICE_LOGS_DIR_ENV: &str = "SERVICE_LOGS_DIR";
pub const TEST_RUN_ID_ENV: &str = "TEST_RUN_ID";
pub const LOCAL_CA_CERT_ENV: &str = "LOCAL_CA_CERT";
pub const ELASTIC_AGENT_TAGS_ENV: &str = "ELASTIC_AGENT_TAGS";
pub const FLEET_POLICY_ENV: &str = "FLEET_TOKEN_POLICY_NAME";

/// Service log folder as mounted into agent containers.
pub const AGENT_LOGS_FOLDER: &str = "/tmp/service_logs/";

/// Describes the service under test.
///
/// Created by the caller before set up and enriched by the deployer with the
/// hostname, ports and agent details the tests need.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    /// Host name of the service as seen from the agent
    pub hostname: String,
    /// Network the agent runs in when it is deployed independently
    pub agent_network_name: String,
    pub ports: Vec<u16>,
    /// First entry of `ports`
    pub port: Option<u16>,
    pub logs: ServiceLogs,
    pub test: TestRun,
    pub agent: AgentInfo,
    pub tags: Vec<String>,
    /// Extra values for templates, e.g. Terraform outputs
    pub custom_properties: BTreeMap<String, Value>,
    /// Directory for outputs produced by the service
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceLogs {
    /// Folder on the local filesystem
    pub local: PathBuf,
    /// Same folder inside the agent container
    pub agent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRun {
    pub run_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentInfo {
    pub host_name_prefix: String,
    /// Whether the agent is deployed separately from the stack's own agent
    pub independent: bool,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, run_id: impl Into<String>, logs_local: PathBuf) -> Self {
        Self {
            name: name.into(),
            hostname: String::new(),
            agent_network_name: String::new(),
            ports: Vec::new(),
            port: None,
            logs: ServiceLogs {
                local: logs_local,
                agent: AGENT_LOGS_FOLDER.to_string(),
            },
            test: TestRun { run_id: run_id.into() },
            agent: AgentInfo::default(),
            tags: Vec::new(),
            custom_properties: BTreeMap::new(),
            output_dir: None,
        }
    }

    /// Compose project name, unique per run.
    pub fn project_name(&self) -> String {
        format!("testbed-service-{}", self.test.run_id)
    }

    pub fn set_ports(&mut self, ports: Vec<u16>) {
        self.port = ports.first().copied();
        self.ports = ports;
    }
}

/// Identifier of one test run: 12 lowercase hex characters.
pub fn new_run_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}
