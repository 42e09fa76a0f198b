//! Shared types for the catalog and the execution engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default SSH port for new hosts.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default remote shell for new hosts.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// How a template's body reaches the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    /// Fed to the host's configured shell over stdin.
    #[default]
    Shell,
    /// Fed to the fixed interpreter over stdin.
    Interpreted,
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptType::Shell => write!(f, "shell"),
            ScriptType::Interpreted => write!(f, "interpreted"),
        }
    }
}

impl std::str::FromStr for ScriptType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(ScriptType::Shell),
            "interpreted" => Ok(ScriptType::Interpreted),
            other => Err(format!("unknown script type: {other}")),
        }
    }
}

/// Job-level status of an ad-hoc run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Fan-out still in flight.
    Running,
    /// Every host log ended in `success`.
    Completed,
    /// At least one host log ended in `error` or `connection_failed`.
    Failed,
    /// The dispatch itself broke down before or during fan-out.
    Error,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Outcome of one script invocation on one host.
///
/// `Running` is observable only while the invocation is in flight; every
/// terminal value is one of the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostLogStatus {
    Running,
    /// Remote exit status 0.
    Success,
    /// Remote non-zero exit status, or an internal dispatch failure.
    Error,
    /// No session: unparseable key, auth rejection, transport error, timeout.
    ConnectionFailed,
}

impl HostLogStatus {
    /// True for any state a finished invocation may rest in.
    pub fn is_terminal(self) -> bool {
        !matches!(self, HostLogStatus::Running)
    }
}

impl fmt::Display for HostLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostLogStatus::Running => write!(f, "running"),
            HostLogStatus::Success => write!(f, "success"),
            HostLogStatus::Error => write!(f, "error"),
            HostLogStatus::ConnectionFailed => write!(f, "connection_failed"),
        }
    }
}

impl std::str::FromStr for HostLogStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(HostLogStatus::Running),
            "success" => Ok(HostLogStatus::Success),
            "error" => Ok(HostLogStatus::Error),
            "connection_failed" => Ok(HostLogStatus::ConnectionFailed),
            other => Err(format!("unknown host log status: {other}")),
        }
    }
}

/// Which job a host log row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOwner {
    /// An on-demand run.
    AdHoc(i64),
    /// A cron-scheduled run.
    Scheduled(i64),
}

impl LogOwner {
    pub fn job_id(self) -> i64 {
        match self {
            LogOwner::AdHoc(id) | LogOwner::Scheduled(id) => id,
        }
    }
}

/// A reusable script body plus its interpreter category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub content: String,
    pub script_type: ScriptType,
    /// Opaque description of expected parameters, if any.
    pub arguments: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A reachable SSH endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub hostname: String,
    pub username: String,
    pub port: u16,
    pub shell: String,
}

/// A named set of hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostGroup {
    pub id: i64,
    pub name: String,
}

/// A named private key, decrypted on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub name: String,
    /// Plaintext key material; only materialized in memory for the duration
    /// of a connection attempt.
    pub private_key: String,
}

/// Credential listing entry; the key itself stays sealed in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub id: i64,
    pub name: String,
}

/// A recurring execution bound to a cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    /// 5-field cron expression, validated at save time.
    pub schedule: String,
    pub template_id: i64,
    pub credential_id: i64,
    /// Target host ids, frozen at save time. Group membership changes after
    /// save do not re-resolve; deleted hosts become no-op targets.
    pub host_set: Vec<i64>,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    /// Advisory next firing instant.
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One user-initiated execution of a template over a target set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocJob {
    pub id: i64,
    /// Snapshot of the template name; survives template deletion or rename.
    pub template_name: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

/// Terminal record of one script invocation on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostLog {
    pub id: i64,
    pub job_id: i64,
    pub hostname: String,
    pub stdout: String,
    pub stderr: String,
    pub status: HostLogStatus,
    pub created_at: DateTime<Utc>,
}

/// Singleton operational settings (catalog row id 1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum retained cron host log rows; 0 keeps everything.
    pub cron_history_limit: u32,
    /// External inventory provider endpoint, if configured.
    pub provider_url: Option<String>,
    /// API token for the inventory provider (sealed at rest).
    pub provider_token: Option<String>,
    /// Git remote for template sync, if configured.
    pub git_remote: Option<String>,
}

/// A local operator account; only the Argon2 hash is ever stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_type_roundtrip() {
        for script_type in [ScriptType::Shell, ScriptType::Interpreted] {
            let s = script_type.to_string();
            assert_eq!(s.parse::<ScriptType>().unwrap(), script_type);
        }
        assert!("python".parse::<ScriptType>().is_err());
    }

    #[test]
    fn job_status_roundtrip() {
        for status in [
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Error,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn host_log_status_roundtrip() {
        for status in [
            HostLogStatus::Running,
            HostLogStatus::Success,
            HostLogStatus::Error,
            HostLogStatus::ConnectionFailed,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<HostLogStatus>().unwrap(), status);
        }
        assert!("ok".parse::<HostLogStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!HostLogStatus::Running.is_terminal());
        assert!(HostLogStatus::Success.is_terminal());
        assert!(HostLogStatus::Error.is_terminal());
        assert!(HostLogStatus::ConnectionFailed.is_terminal());
    }

    #[test]
    fn log_owner_job_id() {
        assert_eq!(LogOwner::AdHoc(7).job_id(), 7);
        assert_eq!(LogOwner::Scheduled(9).job_id(), 9);
    }
}
