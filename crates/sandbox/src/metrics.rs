//! Parsing of the `key:value` report `isolate --meta` writes after a run.
//!
//! ```text
//! time:0.002
//! time-wall:0.045
//! max-rss:2624
//! csw-voluntary:6
//! csw-forced:2
//! cg-mem:38248
//! exitcode:2
//! status:RE
//! message:Exited with error status 2
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid meta file line: {0:?}")]
    MalformedLine(String),
    #[error("invalid value {value:?} for meta key {key:?}")]
    InvalidValue { key: String, value: String },
    #[error("failed to read meta file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Termination class reported by the sandbox. A report without a `status`
/// line is [`Status::Ok`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Ok,
    RuntimeError,
    TimeLimitExceeded,
    /// Any other code, kept verbatim: `SG` for a fatal signal, `XX` for an
    /// internal sandbox error.
    Other(String),
}

impl Status {
    fn from_code(code: &str) -> Self {
        match code {
            "RE" => Self::RuntimeError,
            "TO" => Self::TimeLimitExceeded,
            other => Self::Other(other.to_owned()),
        }
    }

    fn code(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::RuntimeError => Some("RE"),
            Self::TimeLimitExceeded => Some("TO"),
            Self::Other(code) => Some(code),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub cpu_time_sec: f64,
    pub wall_time_sec: f64,
    pub max_rss_kb: i64,
    pub cg_mem_kb: i64,
    pub csw_voluntary: i64,
    pub csw_forced: i64,
    pub exit_code: i32,
    pub status: Status,
    pub message: Option<String>,
}

impl Metrics {
    pub async fn read(path: &Path) -> Result<Self, MetricsError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| MetricsError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), content = %content, "read meta file");
        content.parse()
    }

    /// Clean exit with status OK and exit code 0.
    pub fn is_success(&self) -> bool {
        self.status == Status::Ok && self.exit_code == 0
    }
}

impl FromStr for Metrics {
    type Err = MetricsError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let mut metrics = Metrics::default();
        for line in content.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split(':');
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(MetricsError::MalformedLine(line.to_owned()));
            };
            match key {
                "time" => metrics.cpu_time_sec = parse_value(key, value)?,
                "time-wall" => metrics.wall_time_sec = parse_value(key, value)?,
                "max-rss" => metrics.max_rss_kb = parse_value(key, value)?,
                "csw-voluntary" => metrics.csw_voluntary = parse_value(key, value)?,
                "csw-forced" => metrics.csw_forced = parse_value(key, value)?,
                "cg-mem" => metrics.cg_mem_kb = parse_value(key, value)?,
                "exitcode" => metrics.exit_code = parse_value(key, value)?,
                "status" => metrics.status = Status::from_code(value),
                "message" => metrics.message = Some(value.to_owned()),
                _ => debug!(line, "ignoring unknown meta key"),
            }
        }
        Ok(metrics)
    }
}

/// Writes the report in the sandbox's own line format.
impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "time:{}", self.cpu_time_sec)?;
        writeln!(f, "time-wall:{}", self.wall_time_sec)?;
        writeln!(f, "max-rss:{}", self.max_rss_kb)?;
        writeln!(f, "csw-voluntary:{}", self.csw_voluntary)?;
        writeln!(f, "csw-forced:{}", self.csw_forced)?;
        writeln!(f, "cg-mem:{}", self.cg_mem_kb)?;
        writeln!(f, "exitcode:{}", self.exit_code)?;
        if let Some(code) = self.status.code() {
            writeln!(f, "status:{code}")?;
        }
        if let Some(message) = &self.message {
            writeln!(f, "message:{message}")?;
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, MetricsError> {
    value.trim().parse().map_err(|_| MetricsError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN: &str = "time:0.112\ntime-wall:0.103\nmax-rss:18984\ncsw-voluntary:1513\n\
                         csw-forced:23\ncg-mem:38248\nexitcode:0\n";

    const TIMED_OUT: &str = "time:0.115\ntime-wall:0.125\nmax-rss:18444\ncsw-voluntary:1597\n\
                             csw-forced:28\ncg-mem:38248\nstatus:TO\nmessage:Time limit exceeded\n";

    #[test]
    fn test_clean_exit_without_status_is_ok() {
        let metrics: Metrics = CLEAN.parse().unwrap();
        assert_eq!(metrics.cpu_time_sec, 0.112);
        assert_eq!(metrics.wall_time_sec, 0.103);
        assert_eq!(metrics.max_rss_kb, 18984);
        assert_eq!(metrics.csw_voluntary, 1513);
        assert_eq!(metrics.csw_forced, 23);
        assert_eq!(metrics.cg_mem_kb, 38248);
        assert_eq!(metrics.exit_code, 0);
        assert_eq!(metrics.status, Status::Ok);
        assert_eq!(metrics.message, None);
        assert!(metrics.is_success());
    }

    #[test]
    fn test_runtime_error_report() {
        let report = "time:0.002\ntime-wall:0.045\nexitcode:2\nstatus:RE\n\
                      message:Exited with error status 2\n";
        let metrics: Metrics = report.parse().unwrap();
        assert_eq!(metrics.exit_code, 2);
        assert_eq!(metrics.status, Status::RuntimeError);
        assert_eq!(metrics.message.as_deref(), Some("Exited with error status 2"));
        assert!(!metrics.is_success());
    }

    #[test]
    fn test_timeout_report_has_no_exit_code() {
        let metrics: Metrics = TIMED_OUT.parse().unwrap();
        assert_eq!(metrics.status, Status::TimeLimitExceeded);
        assert_eq!(metrics.exit_code, 0);
        assert!(!metrics.is_success());
    }

    #[test]
    fn test_signal_and_internal_error_codes() {
        let signalled: Metrics = "exitsig:11\nstatus:SG\n".parse().unwrap();
        assert_eq!(signalled.status, Status::Other("SG".to_owned()));
        assert!(!signalled.is_success());
        assert!(signalled.to_string().contains("status:SG\n"));
        assert_eq!(signalled.to_string().parse::<Metrics>().unwrap(), signalled);
        let internal: Metrics = "status:XX\nmessage:cannot fork\n".parse().unwrap();
        assert_eq!(internal.status, Status::Other("XX".to_owned()));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let report = format!("{CLEAN}killed:1\ncg-oom-killed:1\nfuture-key:whatever\n");
        let metrics: Metrics = report.parse().unwrap();
        assert_eq!(metrics, CLEAN.parse::<Metrics>().unwrap());
    }

    #[test]
    fn test_line_without_separator_fails_whole_parse() {
        let err = "time:0.1\ngarbage\nexitcode:0\n".parse::<Metrics>().unwrap_err();
        assert!(matches!(err, MetricsError::MalformedLine(line) if line == "garbage"));
    }

    #[test]
    fn test_line_with_two_separators_is_malformed() {
        let err = "message:a:b\n".parse::<Metrics>().unwrap_err();
        assert!(matches!(err, MetricsError::MalformedLine(_)));
    }

    #[test]
    fn test_invalid_numeric_value() {
        let err = "max-rss:lots\n".parse::<Metrics>().unwrap_err();
        assert!(matches!(err, MetricsError::InvalidValue { key, .. } if key == "max-rss"));
    }

    #[test]
    fn test_display_reproduces_report() {
        let metrics = Metrics {
            cpu_time_sec: 1.25,
            wall_time_sec: 2.5,
            max_rss_kb: 4096,
            cg_mem_kb: 8192,
            csw_voluntary: 7,
            csw_forced: 3,
            exit_code: 1,
            status: Status::RuntimeError,
            message: Some("Exited with error status 1".to_owned()),
        };
        assert_eq!(metrics.to_string().parse::<Metrics>().unwrap(), metrics);
        assert!(!Metrics::default().to_string().contains("status:"));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Metrics::read(&dir.path().join("absent.meta"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::Read { .. }));
    }
}
