use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::BoxId;
use crate::error::{Result, SandboxError};
use crate::metrics::Metrics;

/// A command running under `isolate --run`.
///
/// Both output pipes must be drained concurrently: the process blocks once the
/// unread pipe's buffer fills. [`BoxProcess::wait`] consumes the handle and yields
/// the metrics report exactly once.
#[derive(Debug)]
pub struct BoxProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdin_feed: Option<JoinHandle<io::Result<u64>>>,
    meta_path: PathBuf,
    box_id: BoxId,
}

impl BoxProcess {
    pub(crate) fn spawn<R>(
        mut command: Command,
        mut stdin: R,
        meta_path: PathBuf,
        box_id: BoxId,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let mut child = command
            .spawn()
            .map_err(|source| SandboxError::Tool { program, source })?;
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or(SandboxError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SandboxError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SandboxError::MissingPipe("stderr"))?;

        let stdin_feed = tokio::spawn(async move {
            let copied = tokio::io::copy(&mut stdin, &mut child_stdin).await?;
            child_stdin.shutdown().await?;
            Ok(copied)
        });

        Ok(Self {
            child,
            stdout: Some(stdout),
            stderr: Some(stderr),
            stdin_feed: Some(stdin_feed),
            meta_path,
            box_id,
        })
    }

    pub fn box_id(&self) -> BoxId {
        self.box_id
    }

    /// OS pid of the `isolate` process, while it has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Takes the live stdout pipe. Returns `None` after the first call.
    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Takes the live stderr pipe. Returns `None` after the first call.
    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Sends SIGKILL to the `isolate` process ahead of its limits.
    pub fn kill(&mut self) -> Result<()> {
        warn!(box_id = self.box_id, "killing box process");
        self.child.start_kill()?;
        Ok(())
    }

    /// Waits for the process to exit by any means, then parses its metrics report.
    /// A non-zero exit of the wrapped command is a successful report.
    pub async fn wait(mut self) -> Result<Metrics> {
        let status = self.child.wait().await?;
        debug!(box_id = self.box_id, %status, "isolate exited");
        if let Some(feed) = self.stdin_feed.take() {
            // The process is gone; a source that never reaches EOF must not hold us here.
            feed.abort();
            match feed.await {
                Ok(Ok(bytes)) => debug!(box_id = self.box_id, bytes, "fed stdin"),
                Ok(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(box_id = self.box_id, "process closed stdin early")
                }
                Ok(Err(err)) => warn!(box_id = self.box_id, error = %err, "stdin feed failed"),
                Err(err) if err.is_cancelled() => {
                    debug!(box_id = self.box_id, "stdin source still open at exit")
                }
                Err(err) => warn!(box_id = self.box_id, error = %err, "stdin feed task failed"),
            }
        }
        let metrics = Metrics::read(&self.meta_path).await?;
        info!(
            box_id = self.box_id,
            time = metrics.cpu_time_sec,
            time_wall = metrics.wall_time_sec,
            max_rss = metrics.max_rss_kb,
            cg_mem = metrics.cg_mem_kb,
            exitcode = metrics.exit_code,
            status = ?metrics.status,
            "metrics"
        );
        Ok(metrics)
    }
}

impl Drop for BoxProcess {
    fn drop(&mut self) {
        if let Some(feed) = self.stdin_feed.take() {
            feed.abort();
        }
        let _ = std::fs::remove_file(&self.meta_path);
    }
}
