use crate::infrastructure::{fake_runtime, FakeDockerHarness, PackageFixture};
use anyhow::{anyhow, Result};
use testbed::deployer::{factory, FactoryOptions, LifecycleState, RunFlags, ServiceInfo};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CONFIG: &str = "services:\n  nginx:\n    image: nginx:1.25\n    ports:\n      - \"8080:80\"\n      - target: 443\n";

fn options(fixture: &PackageFixture, flags: RunFlags) -> Result<FactoryOptions> {
    Ok(FactoryOptions {
        package_root: fixture.package_root()?,
        package_name: "nginx".to_string(),
        flags,
        ..Default::default()
    })
}

fn service_info(fixture: &PackageFixture, run_id: &str) -> ServiceInfo {
    ServiceInfo::new("nginx", run_id, fixture.data_home().join("tmp/service_logs"))
}

/// Set up, run and tear down a compose service against the fake docker CLI
#[tokio::test]
async fn test_full_compose_lifecycle() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let docker = FakeDockerHarness::new()?;
    docker.set_config(CONFIG)?;
    let fixture = PackageFixture::new("nginx")?.with_compose_service()?;
    let runtime = fake_runtime(&docker, &fixture.data_home());

    let deployer = factory(runtime, options(&fixture, RunFlags::default())?).map_err(|e| anyhow!("{e:#}"))?;
    assert_eq!(deployer.name(), "docker");

    let mut service = deployer.prepare(service_info(&fixture, "0123456789ab"));
    let cancel = CancellationToken::new();
    service.set_up(&cancel).await.map_err(|e| anyhow!("{e:#}"))?;

    assert_eq!(service.state(), LifecycleState::Running);
    let info = service.info().clone();
    debug!("Service info: {:?}", info);
    assert_eq!(info.hostname, "svc-nginx");
    assert_eq!(info.ports, vec![80, 443]);
    assert_eq!(info.port, Some(80));
    assert_eq!(info.agent.host_name_prefix, "docker-fleet-agent");

    assert_eq!(docker.compose_verbs()?, vec!["up", "ps", "config"]);
    let up_env = docker.up_env()?;
    assert_eq!(up_env.len(), 1);
    assert!(up_env[0].starts_with("TEST_RUN_ID=0123456789ab SERVICE_LOGS_DIR="));
    assert!(docker
        .calls()?
        .contains(&"network connect --alias svc-nginx testbed-stack_default testbed-service-0123456789ab-nginx-1".to_string()));

    service.signal("SIGHUP", &cancel).await.map_err(|e| anyhow!("{e:#}"))?;
    assert_eq!(service.state(), LifecycleState::SignalSent);

    service
        .tear_down(&CancellationToken::new())
        .await
        .map_err(|e| anyhow!("{e:#}"))?;
    assert_eq!(service.state(), LifecycleState::TornDown);

    let verbs = docker.compose_verbs()?;
    assert_eq!(verbs[verbs.len() - 4..], ["kill", "stop", "logs", "down"]);
    let logs = std::fs::read_dir(fixture.data_home().join("build/container-logs"))?.count();
    assert_eq!(logs, 1);
    Ok(())
}

/// A container that exits before becoming healthy fails set up quickly
#[tokio::test]
async fn test_exited_container_fails_set_up() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let docker = FakeDockerHarness::new()?;
    docker.set_config(CONFIG)?;
    docker.set_exited(3)?;
    let fixture = PackageFixture::new("nginx")?.with_compose_service()?;
    let runtime = fake_runtime(&docker, &fixture.data_home());

    let deployer = factory(runtime, options(&fixture, RunFlags::default())?).map_err(|e| anyhow!("{e:#}"))?;
    let mut service = deployer.prepare(service_info(&fixture, "abcdef012345"));

    let err = service
        .set_up(&CancellationToken::new())
        .await
        .expect_err("set up should fail");
    assert_eq!(service.state(), LifecycleState::Failed);
    assert!(format!("{err:#}").contains("exited with code 3"), "unexpected error: {err:#}");

    // Teardown still runs every step from the failed state
    service
        .tear_down(&CancellationToken::new())
        .await
        .map_err(|e| anyhow!("{e:#}"))?;
    let verbs = docker.compose_verbs()?;
    assert!(verbs.ends_with(&["stop".to_string(), "logs".to_string(), "down".to_string()]));
    Ok(())
}

/// Without the stack network nothing is brought up
#[tokio::test]
async fn test_missing_stack_network() -> Result<()> {
    let docker = FakeDockerHarness::new()?;
    docker.remove_network()?;
    let fixture = PackageFixture::new("nginx")?.with_compose_service()?;
    let runtime = fake_runtime(&docker, &fixture.data_home());

    let deployer = factory(runtime, options(&fixture, RunFlags::default())?).map_err(|e| anyhow!("{e:#}"))?;
    let mut service = deployer.prepare(service_info(&fixture, "abcdef012345"));

    let err = service
        .set_up(&CancellationToken::new())
        .await
        .expect_err("set up should fail");
    assert_eq!(err.to_string(), "stack network is not ready");
    assert!(format!("{err:#}").contains("network testbed-stack_default not found"));
    assert!(!docker.compose_verbs()?.contains(&"up".to_string()));
    Ok(())
}

/// The variant environment reaches compose commands
#[tokio::test]
async fn test_variant_env_is_applied() -> Result<()> {
    let docker = FakeDockerHarness::new()?;
    docker.set_config(CONFIG)?;
    let fixture = PackageFixture::new("nginx")?
        .with_compose_service()?
        .with_variants("variants:\n  v1:\n    NGINX_VERSION: \"1.27\"\ndefault: v1\n")?;
    let runtime = fake_runtime(&docker, &fixture.data_home());

    let deployer = factory(runtime, options(&fixture, RunFlags::default())?).map_err(|e| anyhow!("{e:#}"))?;
    let mut service = deployer.prepare(service_info(&fixture, "abcdef012345"));
    service
        .set_up(&CancellationToken::new())
        .await
        .map_err(|e| anyhow!("{e:#}"))?;

    let up_env = docker.up_env()?;
    assert!(up_env[0].contains("TEST_RUN_ID=abcdef012345"));
    assert!(up_env[0].ends_with("NGINX_VERSION=1.27"));
    service
        .tear_down(&CancellationToken::new())
        .await
        .map_err(|e| anyhow!("{e:#}"))?;
    Ok(())
}

/// Tests-only runs attach to the running service and keep its logs
#[tokio::test]
async fn test_tests_only_step_attaches() -> Result<()> {
    let docker = FakeDockerHarness::new()?;
    docker.set_config(CONFIG)?;
    let fixture = PackageFixture::new("nginx")?.with_compose_service()?;
    let logs = fixture.data_home().join("tmp/service_logs");
    std::fs::create_dir_all(&logs)?;
    std::fs::write(logs.join("access.log"), "GET /\n")?;
    let runtime = fake_runtime(&docker, &fixture.data_home());

    let flags = RunFlags {
        run_tests_only: true,
        ..Default::default()
    };
    let deployer = factory(runtime, options(&fixture, flags)?).map_err(|e| anyhow!("{e:#}"))?;
    let mut service = deployer.prepare(service_info(&fixture, "abcdef012345"));
    service
        .set_up(&CancellationToken::new())
        .await
        .map_err(|e| anyhow!("{e:#}"))?;

    assert_eq!(docker.compose_verbs()?, vec!["ps", "config"]);
    assert!(logs.join("access.log").exists());
    assert!(!docker.calls()?.iter().any(|c| c.starts_with("network connect")));

    service
        .tear_down(&CancellationToken::new())
        .await
        .map_err(|e| anyhow!("{e:#}"))?;
    assert!(!logs.join("access.log").exists());
    Ok(())
}
