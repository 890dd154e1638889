#![allow(dead_code)]

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

pub const FAKE_CA_BUNDLE: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIUY2VydA==\n-----END CERTIFICATE-----\n";

/// Result of running the service binary to completion.
pub struct Finished {
    pub status: ExitStatus,
    pub output: String,
}

/// Endpoint settings that pass config validation.
pub fn base_env() -> Vec<(&'static str, String)> {
    vec![
        ("RDS_HOSTNAME", "127.0.0.1".to_string()),
        ("RDS_IAM_USER", "todo_app".to_string()),
        ("RDS_DB_NAME", "todos".to_string()),
        ("AWS_REGION", "us-east-1".to_string()),
        ("RUST_LOG", "info".to_string()),
        ("NO_COLOR", "1".to_string()),
        ("AWS_EC2_METADATA_DISABLED", "true".to_string()),
    ]
}

/// Static keys so token signing never touches the network.
pub fn static_aws_keys() -> Vec<(&'static str, String)> {
    vec![
        ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE".to_string()),
        ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string()),
    ]
}

pub fn write_ca_bundle(dir: &Path) -> Result<String> {
    let path = dir.join("rds-ca-bundle.pem");
    std::fs::write(&path, FAKE_CA_BUNDLE).context("failed to write CA bundle")?;
    Ok(path.display().to_string())
}

/// Run the built binary with exactly `env` and wait for it to exit.
///
/// The working directory is a scratch dir so a developer's `.env` is not
/// picked up.
pub fn run_service(env: &[(&str, String)], workdir: &Path, timeout: Duration) -> Result<Finished> {
    let child = spawn_service(env, workdir)?;
    wait_for_exit(child, timeout)
}

pub fn spawn_service(env: &[(&str, String)], workdir: &Path) -> Result<Child> {
    Command::new(env!("CARGO_BIN_EXE_iam-todo"))
        .env_clear()
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn service binary")
}

/// Send SIGTERM the way an orchestrator would.
#[cfg(unix)]
pub fn terminate(child: &Child) -> Result<()> {
    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .context("failed to run kill")?;
    if !status.success() {
        bail!("kill -TERM {} failed with {}", child.id(), status);
    }
    Ok(())
}

pub fn wait_for_exit(mut child: Child, timeout: Duration) -> Result<Finished> {
    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            bail!("service did not exit within {:?}", timeout);
        }
        thread::sleep(Duration::from_millis(50));
    };

    let mut output = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_string(&mut output)?;
    }
    if let Some(mut stderr) = child.stderr.take() {
        stderr.read_to_string(&mut output)?;
    }

    Ok(Finished { status, output })
}
