//! Box lifecycle and constrained execution on top of the `isolate` sandbox tool.
//!
//! A [`BoxPool`] hands out [`IsolateBox`]es, each backed by one `isolate` box id.
//! Commands started in a box return a [`BoxProcess`] whose stdout/stderr are live
//! pipes; [`BoxProcess::wait`] yields the parsed [`Metrics`] report.

pub mod constraints;
pub mod error;
pub mod launcher;
pub mod metrics;
pub mod pool;
pub mod process;
pub mod sandbox;

use std::env;
use std::path::PathBuf;

pub use constraints::Constraints;
pub use error::{Result, SandboxError};
pub use metrics::{Metrics, MetricsError, Status};
pub use pool::BoxPool;
pub use process::BoxProcess;
pub use sandbox::IsolateBox;

pub type BoxId = u32;

#[derive(Debug, Clone)]
pub struct IsolateConfig {
    /// Path or name of the `isolate` executable.
    pub executable: PathBuf,
    /// Pass `--cg` to every invocation (required for `cg-mem` accounting).
    pub use_cgroups: bool,
    /// Host directory receiving the per-run metrics report files.
    pub meta_dir: PathBuf,
    /// `KEY=VALUE` overrides forwarded to the run invocation with `--env`.
    pub env: Vec<(String, String)>,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("isolate"),
            use_cgroups: false,
            meta_dir: env::temp_dir(),
            env: vec![
                ("HOME".to_owned(), "/box".to_owned()),
                ("PATH".to_owned(), "/usr/local/bin:/usr/bin:/bin".to_owned()),
            ],
        }
    }
}
