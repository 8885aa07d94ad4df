use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::constraints::Constraints;
use crate::error::{Result, SandboxError};
use crate::{BoxId, IsolateConfig};

/// Builds and runs `isolate` invocations as discrete argument vectors.
#[derive(Debug, Clone)]
pub struct IsolateLauncher {
    config: IsolateConfig,
}

impl IsolateLauncher {
    pub fn new(config: IsolateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IsolateConfig {
        &self.config
    }

    pub async fn version(&self) -> Result<String> {
        let output = self.output("--version", vec!["--version".to_owned()]).await?;
        let version = output.trim().to_owned();
        info!(version = %version, "probed isolate");
        Ok(version)
    }

    pub async fn cleanup(&self, box_id: BoxId) -> Result<()> {
        let mut args = self.box_args(box_id);
        args.push("--cleanup".to_owned());
        self.output("--cleanup", args).await.map(|_| ())
    }

    /// Initializes the box and returns the root directory `isolate` reports.
    pub async fn init(&self, box_id: BoxId) -> Result<PathBuf> {
        let mut args = self.box_args(box_id);
        args.push("--init".to_owned());
        let output = self.output("--init", args).await?;
        let root = output.trim_end_matches(['\n', '\r']);
        if root.is_empty() || root.contains('\n') || !Path::new(root).is_absolute() {
            return Err(SandboxError::InvalidRoot(output));
        }
        Ok(PathBuf::from(root))
    }

    /// The `--run` invocation for `argv`, with all three standard streams piped.
    pub fn run_command(
        &self,
        box_id: BoxId,
        meta_path: &Path,
        constraints: &Constraints,
        argv: &[String],
    ) -> Command {
        let mut command = Command::new(&self.config.executable);
        command
            .args(self.box_args(box_id))
            .arg(format!("--meta={}", meta_path.display()))
            .args(constraints.isolate_args());
        apply_env_args(&mut command, &self.config);
        command
            .arg("--run")
            .arg("--")
            .args(argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn box_args(&self, box_id: BoxId) -> Vec<String> {
        let mut args = vec![format!("--box-id={box_id}")];
        if self.config.use_cgroups {
            args.push("--cg".to_owned());
        }
        args
    }

    async fn output(&self, action: &'static str, args: Vec<String>) -> Result<String> {
        let program = self.config.executable.display().to_string();
        debug!(cmd = %program, args = ?args, "running isolate");
        let output = Command::new(&self.config.executable)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SandboxError::Tool { program, source })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::ToolFailed {
                action,
                status: output.status,
                output: format!("{}{}", stdout, stderr).trim().to_owned(),
            });
        }
        debug!(action, output = %stdout.trim(), "isolate finished");
        Ok(stdout)
    }
}

fn apply_env_args(command: &mut Command, config: &IsolateConfig) {
    for (key, value) in &config.env {
        command.arg(format!("--env={key}={value}"));
    }
}
