//! Runs source code submissions inside `isolate` boxes: an optional compile step
//! followed by an execute step, with progress reported to an [`Observer`].

pub mod config;
pub mod language;
pub mod observer;
pub mod runner;

pub use config::{ConfigError, RunnerConfig};
pub use language::{CommandLine, CompileStep, Language, LanguageError, LanguageRegistry};
pub use observer::{
    Collector, CompilationReport, ExecutionReport, Observer, Stream, SubmissionReport, Tee,
    TracingObserver,
};
pub use runner::{
    CompileStdin, Outcome, RunError, Runner, RunnerOptions, Submission, SubmissionState,
};
