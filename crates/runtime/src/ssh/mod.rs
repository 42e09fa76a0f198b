//! SSH execution of script templates on remote hosts.
//!
//! One invocation opens its own TCP connection and SSH session, streams the
//! script body to the interpreter's stdin, and records the outcome as a host
//! log row. Host keys are accepted automatically — a documented trade-off:
//! the executor targets fleets where inventory churn makes pinning
//! impractical, so transport integrity rests on the private key alone.
//!
//! libssh2 is a blocking library; each invocation runs on a dedicated
//! blocking thread via `spawn_blocking`, one per host, never sharing
//! sessions.

pub mod keys;

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::catalog::{Catalog, CatalogError};
use crate::types::{Credential, Host, HostLogStatus, LogOwner, ScriptType};

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout covering the protocol banner exchange and handshake.
pub const BANNER_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for channel operations while the script runs.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Fixed interpreter command for `interpreted` templates; reads the script
/// from stdin on every host.
pub const INTERPRETER_COMMAND: &str = "python3 -";

/// Internal executor failures (never per-host outcomes, which are always
/// expressed as host log rows).
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("executor task failed: {0}")]
    Task(String),
}

/// The dispatch seam between the engine and the transport.
///
/// The job runner and the cron scheduler fan out through this trait; tests
/// substitute a stub that records calls instead of opening connections.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run one script on one host, recording a host log row under `owner`.
    /// Returns the terminal status of that row.
    async fn execute(
        &self,
        host: &Host,
        credential: &Credential,
        script: &str,
        script_type: ScriptType,
        owner: LogOwner,
    ) -> Result<HostLogStatus, ExecutorError>;
}

/// Production executor speaking SSH v2 with publickey authentication.
pub struct SshExecutor {
    catalog: Arc<Catalog>,
}

impl SshExecutor {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl ScriptExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &Host,
        credential: &Credential,
        script: &str,
        script_type: ScriptType,
        owner: LogOwner,
    ) -> Result<HostLogStatus, ExecutorError> {
        let log_id = self.catalog.create_host_log(owner, &host.hostname).await?;

        let outcome = match keys::probe_private_key(&credential.private_key) {
            Err(e) => {
                tracing::warn!(host = %host.hostname, credential = %credential.name, "{e}");
                Outcome::connection_failed(e.to_string())
            }
            Ok(algorithm) => {
                tracing::debug!(host = %host.hostname, %algorithm, "private key parsed");
                let command = interpreter_command(host, script_type);
                let target = host.clone();
                let key = credential.private_key.clone();
                let script = script.to_string();
                match tokio::task::spawn_blocking(move || {
                    run_remote(&target, &key, &command, &script)
                })
                .await
                {
                    Ok(Ok(run)) => Outcome::from_exit(run),
                    Ok(Err(failure)) => {
                        tracing::warn!(host = %host.hostname, "{}", failure.to_stderr());
                        Outcome::connection_failed(failure.to_stderr())
                    }
                    Err(join_err) => Outcome::connection_failed(join_err.to_string()),
                }
            }
        };

        self.catalog
            .finalize_host_log(owner, log_id, outcome.status, &outcome.stdout, &outcome.stderr)
            .await?;
        Ok(outcome.status)
    }
}

/// The remote command: the host's shell for `shell` templates, the fixed
/// interpreter otherwise. Either way the script body arrives over stdin.
fn interpreter_command(host: &Host, script_type: ScriptType) -> String {
    match script_type {
        ScriptType::Shell => host.shell.clone(),
        ScriptType::Interpreted => INTERPRETER_COMMAND.to_string(),
    }
}

struct Outcome {
    status: HostLogStatus,
    stdout: String,
    stderr: String,
}

impl Outcome {
    fn from_exit(run: RemoteRun) -> Self {
        let status = if run.exit_code == 0 {
            HostLogStatus::Success
        } else {
            HostLogStatus::Error
        };
        Self {
            status,
            stdout: run.stdout,
            stderr: run.stderr,
        }
    }

    fn connection_failed(stderr: String) -> Self {
        Self {
            status: HostLogStatus::ConnectionFailed,
            stdout: String::new(),
            stderr,
        }
    }
}

#[derive(Debug)]
struct RemoteRun {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Classified transport-level failure; each variant carries the message that
/// lands in the host log's stderr.
#[derive(Debug)]
enum SshFailure {
    Timeout(String),
    Auth(String),
    Transport(String),
    Other(String),
}

impl SshFailure {
    fn to_stderr(&self) -> String {
        match self {
            SshFailure::Timeout(msg) => format!("Connection Timeout: {msg}"),
            SshFailure::Auth(msg) => format!("Authentication Error: {msg}"),
            SshFailure::Transport(msg) => format!("SSH Error: {msg}"),
            SshFailure::Other(msg) => msg.clone(),
        }
    }
}

const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

fn is_timeout(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT))
}

fn classify_io(err: std::io::Error) -> SshFailure {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            SshFailure::Timeout(err.to_string())
        }
        _ => SshFailure::Transport(err.to_string()),
    }
}

fn classify_ssh(err: ssh2::Error) -> SshFailure {
    if is_timeout(&err) {
        SshFailure::Timeout(err.to_string())
    } else {
        SshFailure::Transport(err.to_string())
    }
}

/// Connect, authenticate, and run the command with the script on stdin.
/// The session is torn down on every path before this returns.
fn run_remote(
    host: &Host,
    key_material: &str,
    command: &str,
    script: &str,
) -> Result<RemoteRun, SshFailure> {
    let addr = format!("{}:{}", host.hostname, host.port);
    let sockaddr = addr
        .to_socket_addrs()
        .map_err(|e| SshFailure::Transport(e.to_string()))?
        .next()
        .ok_or_else(|| SshFailure::Transport(format!("no address found for {addr}")))?;

    let tcp = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT).map_err(classify_io)?;

    let mut session = ssh2::Session::new().map_err(|e| SshFailure::Other(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(BANNER_TIMEOUT.as_millis() as u32);
    session.handshake().map_err(classify_ssh)?;

    session
        .userauth_pubkey_memory(&host.username, None, key_material, None)
        .map_err(|e| {
            if is_timeout(&e) {
                SshFailure::Timeout(e.to_string())
            } else {
                SshFailure::Auth(e.to_string())
            }
        })?;
    if !session.authenticated() {
        return Err(SshFailure::Auth("server rejected public key".to_string()));
    }

    session.set_timeout(EXEC_TIMEOUT.as_millis() as u32);
    let result = exec_script(&session, command, script);
    let _ = session.disconnect(None, "done", None);
    result
}

fn exec_script(
    session: &ssh2::Session,
    command: &str,
    script: &str,
) -> Result<RemoteRun, SshFailure> {
    let mut channel = session.channel_session().map_err(classify_ssh)?;
    channel.exec(command).map_err(classify_ssh)?;

    channel.write_all(script.as_bytes()).map_err(classify_io)?;
    channel.send_eof().map_err(classify_ssh)?;

    let mut stdout_raw = Vec::new();
    channel.read_to_end(&mut stdout_raw).map_err(classify_io)?;
    let mut stderr_raw = Vec::new();
    channel
        .stderr()
        .read_to_end(&mut stderr_raw)
        .map_err(classify_io)?;

    channel.wait_close().map_err(classify_ssh)?;
    let exit_code = channel.exit_status().map_err(classify_ssh)?;

    Ok(RemoteRun {
        exit_code,
        // Remote output is whatever the script emitted; binary garbage is
        // replaced, not treated as a failure.
        stdout: String::from_utf8_lossy(&stdout_raw).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_raw).into_owned(),
    })
}
