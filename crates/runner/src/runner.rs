//! Compile-then-execute orchestration for one submission.
//!
//! Stages: `Placed -> (Compiling -> Compiled | CompileFailed) -> Running ->
//! (Finished | RunFailed)`. Every stage after allocation runs inside one box,
//! which is handed back to the pool on every exit path.

use std::fmt;
use std::io::{self, Cursor};
use std::sync::Arc;

use sandbox::{BoxPool, BoxProcess, Constraints, IsolateBox, Metrics, SandboxError};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::language::{CommandLine, CompileStep, Language};
use crate::observer::{Observer, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Placed,
    Compiling,
    Compiled,
    CompileFailed,
    Running,
    Finished,
    RunFailed,
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Placed => "placed",
            Self::Compiling => "compiling",
            Self::Compiled => "compiled",
            Self::CompileFailed => "compile_failed",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::RunFailed => "run_failed",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a submission. The `Display` text is the reason handed
/// to [`Observer::failed`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to create box: {0}")]
    Allocate(#[source] SandboxError),
    #[error("failed to add code file to box: {0}")]
    Place(#[source] SandboxError),
    #[error("failed to compile code: {0}")]
    CompileStart(#[source] SandboxError),
    #[error("failed to read compilation output: {0}")]
    CompileDrain(#[source] io::Error),
    #[error("failed to compile code: {0}")]
    CompileWait(#[source] SandboxError),
    #[error("failed to run code: {0}")]
    ExecuteStart(#[source] SandboxError),
    #[error("failed to read execution output: {0}")]
    ExecuteDrain(#[source] io::Error),
    #[error("failed to run code: {0}")]
    ExecuteWait(#[source] SandboxError),
}

impl RunError {
    /// The stage that was active when the submission failed.
    pub fn stage(&self) -> SubmissionState {
        match self {
            Self::Allocate(_) | Self::Place(_) => SubmissionState::Placed,
            Self::CompileStart(_) | Self::CompileDrain(_) | Self::CompileWait(_) => {
                SubmissionState::Compiling
            }
            Self::ExecuteStart(_) | Self::ExecuteDrain(_) | Self::ExecuteWait(_) => {
                SubmissionState::Running
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The execute phase ran to completion; its exit code may still be non-zero.
    Finished {
        compilation: Option<Metrics>,
        execution: Metrics,
    },
    /// The compiler exited non-zero or was stopped by the sandbox.
    CompileFailed { compilation: Metrics },
}

impl Outcome {
    pub fn state(&self) -> SubmissionState {
        match self {
            Self::Finished { .. } => SubmissionState::Finished,
            Self::CompileFailed { .. } => SubmissionState::CompileFailed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub code: String,
    pub language: Language,
    pub stdin: Vec<u8>,
}

/// What the compile step reads on stdin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompileStdin {
    /// The submission's own stdin, like the execute step.
    #[default]
    Submission,
    Empty,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub compile_constraints: Constraints,
    pub execute_constraints: Constraints,
    pub compile_stdin: CompileStdin,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            compile_constraints: Constraints::compilation(),
            execute_constraints: Constraints::default(),
            compile_stdin: CompileStdin::default(),
        }
    }
}

pub struct Runner {
    pool: BoxPool,
    observer: Arc<dyn Observer>,
    options: RunnerOptions,
}

impl Runner {
    pub fn new(pool: BoxPool, observer: Arc<dyn Observer>) -> Self {
        Self {
            pool,
            observer,
            options: RunnerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Runs one submission start to finish. Every failure is reported to the
    /// observer exactly once and returned; no step is retried.
    pub async fn run(&self, submission: &Submission) -> Result<Outcome, RunError> {
        let span = info_span!("submission", language = %submission.language.id);
        async {
            let sandbox = match self.pool.allocate().await {
                Ok(sandbox) => sandbox,
                Err(err) => return Err(self.fail(RunError::Allocate(err))),
            };
            let result = self
                .drive(&sandbox, submission)
                .instrument(info_span!("box", box_id = sandbox.id()))
                .await;
            let result = result.map_err(|err| self.fail(err));
            if let Err(err) = sandbox.close().await {
                warn!(error = %err, "failed to release box");
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Execute limits for `language`: the configured ones, with the language's
    /// own process limit when it sets one.
    pub fn execute_constraints(&self, language: &Language) -> Constraints {
        let constraints = self.options.execute_constraints;
        match language.max_processes {
            Some(limit) => constraints.with_max_processes(limit),
            None => constraints,
        }
    }

    fn fail(&self, err: RunError) -> RunError {
        let reason = err.to_string();
        warn!(
            state = %SubmissionState::RunFailed,
            stage = %err.stage(),
            error = %reason,
            "submission failed"
        );
        self.observer.failed(&reason);
        err
    }

    async fn drive(
        &self,
        sandbox: &IsolateBox,
        submission: &Submission,
    ) -> Result<Outcome, RunError> {
        let language = &submission.language;
        sandbox
            .add_file(&language.code_filename, submission.code.as_bytes())
            .await
            .map_err(RunError::Place)?;
        info!(state = %SubmissionState::Placed, file = %language.code_filename, "added code file to box");

        let compilation = match &language.compile {
            CompileStep::None => None,
            CompileStep::Command(command) => {
                info!(state = %SubmissionState::Compiling, "compiling code");
                let metrics = self.compile(sandbox, command, submission).await?;
                if !metrics.is_success() {
                    info!(
                        state = %SubmissionState::CompileFailed,
                        exit_code = metrics.exit_code,
                        "compilation failed"
                    );
                    return Ok(Outcome::CompileFailed {
                        compilation: metrics,
                    });
                }
                debug!(state = %SubmissionState::Compiled, "compiled");
                Some(metrics)
            }
        };

        info!(state = %SubmissionState::Running, "running code");
        let execution = self
            .execute(sandbox, &language.execute, submission)
            .await?;
        info!(state = %SubmissionState::Finished, exit_code = execution.exit_code, "finished");
        Ok(Outcome::Finished {
            compilation,
            execution,
        })
    }

    async fn compile(
        &self,
        sandbox: &IsolateBox,
        command: &CommandLine,
        submission: &Submission,
    ) -> Result<Metrics, RunError> {
        let stdin = match self.options.compile_stdin {
            CompileStdin::Submission => submission.stdin.clone(),
            CompileStdin::Empty => Vec::new(),
        };
        let mut process = sandbox
            .run(
                command.args(),
                Cursor::new(stdin),
                Some(&self.options.compile_constraints),
            )
            .map_err(RunError::CompileStart)?;
        let (stdout, stderr) = take_pipes(&mut process).map_err(RunError::CompileStart)?;

        let drained = tokio::try_join!(read_all(stdout), read_all(stderr));
        let (stdout, stderr) = match drained {
            Ok(output) => output,
            Err(err) => {
                abandon(process).await;
                return Err(RunError::CompileDrain(err));
            }
        };
        self.observer.compilation_output(&stdout, &stderr);

        let metrics = process.wait().await.map_err(RunError::CompileWait)?;
        self.observer.compilation_metrics(&metrics);
        Ok(metrics)
    }

    async fn execute(
        &self,
        sandbox: &IsolateBox,
        command: &CommandLine,
        submission: &Submission,
    ) -> Result<Metrics, RunError> {
        let constraints = self.execute_constraints(&submission.language);
        let mut process = sandbox
            .run(
                command.args(),
                Cursor::new(submission.stdin.clone()),
                Some(&constraints),
            )
            .map_err(RunError::ExecuteStart)?;
        let (stdout, stderr) = take_pipes(&mut process).map_err(RunError::ExecuteStart)?;

        // Both readers must finish before wait so no trailing output is lost.
        match drain_lines(stdout, stderr, &self.observer).await {
            Ok((stdout_lines, stderr_lines)) => {
                debug!(stdout_lines, stderr_lines, "drained execution output");
            }
            Err(err) => {
                abandon(process).await;
                return Err(RunError::ExecuteDrain(err));
            }
        }

        let metrics = process.wait().await.map_err(RunError::ExecuteWait)?;
        self.observer.execution_metrics(&metrics);
        Ok(metrics)
    }
}

fn take_pipes(process: &mut BoxProcess) -> Result<(ChildStdout, ChildStderr), SandboxError> {
    let stdout = process.stdout().ok_or(SandboxError::MissingPipe("stdout"))?;
    let stderr = process.stderr().ok_or(SandboxError::MissingPipe("stderr"))?;
    Ok((stdout, stderr))
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<String> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Forwards both streams line by line from two tasks and waits for both to hit EOF.
/// Returns the line counts, or the first read error.
async fn drain_lines<O, E>(
    stdout: O,
    stderr: E,
    observer: &Arc<dyn Observer>,
) -> io::Result<(usize, usize)>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let stdout_task = tokio::spawn(forward_lines(stdout, Stream::Stdout, observer.clone()));
    let stderr_task = tokio::spawn(forward_lines(stderr, Stream::Stderr, observer.clone()));
    let (stdout_lines, stderr_lines) = tokio::join!(stdout_task, stderr_task);
    Ok((flatten(stdout_lines)?, flatten(stderr_lines)?))
}

/// Reports each line of `reader` as soon as it is complete. Returns the line count.
async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream: Stream,
    observer: Arc<dyn Observer>,
) -> io::Result<usize> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut count = 0;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(count);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        observer.execution_output(stream, &String::from_utf8_lossy(&line));
        count += 1;
    }
}

fn flatten(joined: Result<io::Result<usize>, tokio::task::JoinError>) -> io::Result<usize> {
    joined.map_err(io::Error::other)?
}

/// Stops a process whose output could not be drained so the box can be cleaned up.
async fn abandon(mut process: BoxProcess) {
    if let Err(err) = process.kill() {
        warn!(error = %err, "failed to kill process");
    }
    let _ = process.wait().await;
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use sandbox::IsolateConfig;
    use tokio::io::ReadBuf;

    use super::*;
    use crate::language::LanguageRegistry;
    use crate::observer::Collector;

    /// A pipe whose every read fails.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("pipe broke")))
        }
    }

    #[tokio::test]
    async fn test_drain_lines_surfaces_read_error() {
        let collector = Arc::new(Collector::new());
        let observer: Arc<dyn Observer> = collector.clone();
        let stdout = Cursor::new(b"a\nb\n".to_vec());
        let stderr = Cursor::new(b"partial\n".to_vec()).chain(BrokenPipe);

        let err = drain_lines(stdout, stderr, &observer).await.unwrap_err();
        assert_eq!(err.to_string(), "pipe broke");
        // Lines read before the failure were still delivered.
        let execution = collector.report().execution.unwrap();
        assert_eq!(execution.stdout, ["a", "b"]);
        assert_eq!(execution.stderr, ["partial"]);
        assert_eq!(
            RunError::ExecuteDrain(err).to_string(),
            "failed to read execution output: pipe broke"
        );
    }

    #[tokio::test]
    async fn test_read_all_surfaces_read_error() {
        let err = read_all(Cursor::new(b"warning\n".to_vec()).chain(BrokenPipe))
            .await
            .unwrap_err();
        assert_eq!(
            RunError::CompileDrain(err).to_string(),
            "failed to read compilation output: pipe broke"
        );
    }

    #[tokio::test]
    async fn test_language_process_limit_overrides_default() {
        let registry = LanguageRegistry::from_json(
            r#"[
                {"id": "java", "code_filename": "Main.java", "execute_cmd": "java Main",
                 "max_processes": 64},
                {"id": "c", "code_filename": "main.c", "execute_cmd": "./main"}
            ]"#,
        )
        .unwrap();
        let runner = Runner::new(
            BoxPool::unprobed(IsolateConfig::default()),
            Arc::new(Collector::new()),
        );

        let java = runner.execute_constraints(registry.get("java").unwrap());
        assert_eq!(java.max_processes(), NonZeroU32::new(64).unwrap());
        assert_eq!(java.wall_time(), Constraints::default().wall_time());
        let c = runner.execute_constraints(registry.get("c").unwrap());
        assert_eq!(c, Constraints::default());
    }

    #[test]
    fn test_error_stage_and_reason() {
        let err = RunError::Place(SandboxError::BoxNotInUse(0));
        assert_eq!(err.stage(), SubmissionState::Placed);
        assert!(err.to_string().starts_with("failed to add code file to box"));

        let err = RunError::ExecuteDrain(io::Error::other("pipe closed"));
        assert_eq!(err.stage(), SubmissionState::Running);
        assert_eq!(
            err.to_string(),
            "failed to read execution output: pipe closed"
        );
    }

    #[tokio::test]
    async fn test_forward_lines_strips_terminators() {
        let collector = Arc::new(crate::observer::Collector::new());
        let input = Cursor::new(b"one\r\ntwo\n\nlast-without-newline".to_vec());
        let count = forward_lines(input, Stream::Stderr, collector.clone())
            .await
            .unwrap();
        assert_eq!(count, 4);
        let execution = collector.report().execution.unwrap();
        assert_eq!(
            execution.stderr,
            ["one", "two", "", "last-without-newline"]
        );
        assert!(execution.stdout.is_empty());
    }

    #[test]
    fn test_default_options_keep_submission_stdin_for_compile() {
        let options = RunnerOptions::default();
        assert_eq!(options.compile_stdin, CompileStdin::Submission);
        assert_eq!(options.execute_constraints, Constraints::default());
    }
}
