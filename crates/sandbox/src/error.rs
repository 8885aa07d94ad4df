use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::BoxId;
use crate::metrics::MetricsError;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn {program}: {source}")]
    Tool {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("isolate {action} failed ({status}): {output}")]
    ToolFailed {
        action: &'static str,
        status: ExitStatus,
        output: String,
    },
    #[error("isolate --init reported an unusable box root: {0:?}")]
    InvalidRoot(String),
    #[error("box {0} is not in use")]
    BoxNotInUse(BoxId),
    #[error("path {} escapes the box root", .0.display())]
    PathOutsideBox(PathBuf),
    #[error("spawned process is missing its {0} pipe")]
    MissingPipe(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
