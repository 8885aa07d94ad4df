use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sandbox::Metrics;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Receives the progress of one submission.
///
/// Execution lines arrive from two concurrently running readers, so
/// implementations must tolerate calls from different threads.
pub trait Observer: Send + Sync {
    fn compilation_output(&self, stdout: &str, stderr: &str);
    fn compilation_metrics(&self, metrics: &Metrics);
    fn execution_output(&self, stream: Stream, line: &str);
    fn execution_metrics(&self, metrics: &Metrics);
    fn failed(&self, reason: &str);
}

impl<T: Observer + ?Sized> Observer for Arc<T> {
    fn compilation_output(&self, stdout: &str, stderr: &str) {
        (**self).compilation_output(stdout, stderr);
    }

    fn compilation_metrics(&self, metrics: &Metrics) {
        (**self).compilation_metrics(metrics);
    }

    fn execution_output(&self, stream: Stream, line: &str) {
        (**self).execution_output(stream, line);
    }

    fn execution_metrics(&self, metrics: &Metrics) {
        (**self).execution_metrics(metrics);
    }

    fn failed(&self, reason: &str) {
        (**self).failed(reason);
    }
}

/// Logs every notification as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn compilation_output(&self, stdout: &str, stderr: &str) {
        info!(stdout, stderr, "compilation output");
    }

    fn compilation_metrics(&self, metrics: &Metrics) {
        info!(
            cpu_time_sec = metrics.cpu_time_sec,
            wall_time_sec = metrics.wall_time_sec,
            memory_kb = metrics.cg_mem_kb,
            exit_code = metrics.exit_code,
            status = ?metrics.status,
            "compilation metrics"
        );
    }

    fn execution_output(&self, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => info!(stdout = line, "execution output"),
            Stream::Stderr => info!(stderr = line, "execution output"),
        }
    }

    fn execution_metrics(&self, metrics: &Metrics) {
        info!(
            cpu_time_sec = metrics.cpu_time_sec,
            wall_time_sec = metrics.wall_time_sec,
            memory_kb = metrics.cg_mem_kb,
            exit_code = metrics.exit_code,
            status = ?metrics.status,
            "execution metrics"
        );
    }

    fn failed(&self, reason: &str) {
        error!(error = reason, "finished with error");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilationReport {
    pub stdout: String,
    pub stderr: String,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub compilation: Option<CompilationReport>,
    pub execution: Option<ExecutionReport>,
    pub error: Option<String>,
}

/// Aggregates notifications into a [`SubmissionReport`].
#[derive(Debug, Default)]
pub struct Collector {
    report: Mutex<SubmissionReport>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> SubmissionReport {
        self.lock().clone()
    }

    pub fn into_report(self) -> SubmissionReport {
        self.report
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, SubmissionReport> {
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Observer for Collector {
    fn compilation_output(&self, stdout: &str, stderr: &str) {
        let mut report = self.lock();
        let compilation = report.compilation.get_or_insert_with(Default::default);
        compilation.stdout = stdout.to_owned();
        compilation.stderr = stderr.to_owned();
    }

    fn compilation_metrics(&self, metrics: &Metrics) {
        let mut report = self.lock();
        report
            .compilation
            .get_or_insert_with(Default::default)
            .metrics = Some(metrics.clone());
    }

    fn execution_output(&self, stream: Stream, line: &str) {
        let mut report = self.lock();
        let execution = report.execution.get_or_insert_with(Default::default);
        match stream {
            Stream::Stdout => execution.stdout.push(line.to_owned()),
            Stream::Stderr => execution.stderr.push(line.to_owned()),
        }
    }

    fn execution_metrics(&self, metrics: &Metrics) {
        let mut report = self.lock();
        report
            .execution
            .get_or_insert_with(Default::default)
            .metrics = Some(metrics.clone());
    }

    fn failed(&self, reason: &str) {
        self.lock().error = Some(reason.to_owned());
    }
}

/// Forwards every notification to both observers, first `A` then `B`.
#[derive(Debug, Clone, Default)]
pub struct Tee<A, B>(pub A, pub B);

impl<A: Observer, B: Observer> Observer for Tee<A, B> {
    fn compilation_output(&self, stdout: &str, stderr: &str) {
        self.0.compilation_output(stdout, stderr);
        self.1.compilation_output(stdout, stderr);
    }

    fn compilation_metrics(&self, metrics: &Metrics) {
        self.0.compilation_metrics(metrics);
        self.1.compilation_metrics(metrics);
    }

    fn execution_output(&self, stream: Stream, line: &str) {
        self.0.execution_output(stream, line);
        self.1.execution_output(stream, line);
    }

    fn execution_metrics(&self, metrics: &Metrics) {
        self.0.execution_metrics(metrics);
        self.1.execution_metrics(metrics);
    }

    fn failed(&self, reason: &str) {
        self.0.failed(reason);
        self.1.failed(reason);
    }
}
