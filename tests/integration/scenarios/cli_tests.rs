use crate::infrastructure::PackageFixture;
use anyhow::{Context, Result};
use std::process::Output;
use tokio::process::Command;

async fn testbed(args: &[&str]) -> Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_testbed"))
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .await
        .context("Failed to run testbed")
}

/// Declared variants are listed with the default marked
#[tokio::test]
async fn test_service_variants() -> Result<()> {
    let fixture = PackageFixture::new("mysql")?
        .with_compose_service()?
        .with_variants("variants:\n  v8: {MYSQL_VERSION: \"8.0\"}\n  v5: {MYSQL_VERSION: \"5.7\"}\ndefault: v8\n")?;
    let package_root = fixture.package_root()?;

    let output = testbed(&["service", "variants", "--package-root", package_root.to_str().context("path")?]).await?;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8(output.stdout)?, "v5\nv8 (default)\n");
    Ok(())
}

/// A package without `_dev/deploy` is reported as an error
#[tokio::test]
async fn test_service_up_without_dev_deploy() -> Result<()> {
    let fixture = PackageFixture::new("empty")?;
    let package_root = fixture.package_root()?;
    let data_home = fixture.data_home();

    let output = testbed(&[
        "service",
        "up",
        "--package-root",
        package_root.to_str().context("path")?,
        "--data-home",
        data_home.to_str().context("path")?,
    ])
    .await?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("_dev/deploy"), "stderr: {stderr}");
    Ok(())
}

/// Conflicting step flags are rejected by argument parsing
#[tokio::test]
async fn test_conflicting_steps() -> Result<()> {
    let output = testbed(&["service", "up", "--setup", "--tests-only"]).await?;
    assert_eq!(output.status.code(), Some(2));
    Ok(())
}

/// Selecting a variant the package does not declare fails before deploying
#[tokio::test]
async fn test_service_up_with_undeclared_variant() -> Result<()> {
    let fixture = PackageFixture::new("mysql")?
        .with_compose_service()?
        .with_variants("variants:\n  v8: {MYSQL_VERSION: \"8.0\"}\ndefault: v8\n")?;
    let package_root = fixture.package_root()?;
    let data_home = fixture.data_home();

    let output = testbed(&[
        "service",
        "up",
        "--package-root",
        package_root.to_str().context("path")?,
        "--data-home",
        data_home.to_str().context("path")?,
        "--variant",
        "v5",
    ])
    .await?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("can't use service variant"), "stderr: {stderr}");
    assert!(stderr.contains("\"v5\""), "stderr: {stderr}");
    Ok(())
}
