//! SSH session management and command execution.
//!
//! Sessions are cheap descriptors (host + credentials); a fresh transport is
//! opened per operation with a small fixed retry budget for connection-level
//! failures. Business-logic retries belong in the callers' polling loops,
//! never here.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::Session;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::RemoteCommand;
use crate::poll::{poll_until, PollTimeout};

/// SSH port used throughout the lab.
pub const SSH_PORT: u16 = 22;

/// Transport-level attempts per operation.
const CONNECT_ATTEMPTS: u32 = 3;

/// Delay between transport attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// TCP connect timeout for a single reachability probe.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from remote operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Could not reach or handshake with the host.
    #[error("cannot connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// SSH-level failure (handshake, auth, channel, transfer).
    #[error("ssh failure on {host}: {source}")]
    Ssh {
        host: String,
        #[source]
        source: ssh2::Error,
    },

    /// Authentication was rejected.
    #[error("authentication failed for {user}@{host}")]
    Auth { user: String, host: String },

    /// A command ran but exited non-zero where success was required.
    #[error("`{command}` on {host} exited {exit_code}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Local file I/O while copying.
    #[error("cannot read {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Host never became reachable.
    #[error(transparent)]
    Unreachable(#[from] PollTimeout),
}

/// Credentials for a remote host.
#[derive(Clone)]
pub enum SshAuth {
    /// Public key authentication (the default for lab nodes).
    Key { user: String, key_path: PathBuf },
    /// Password authentication, kept for appliances that only offer it.
    Password { user: String, password: String },
}

// Passwords stay out of debug output.
impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key { user, key_path } => f
                .debug_struct("Key")
                .field("user", user)
                .field("key_path", key_path)
                .finish(),
            Self::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .field("password", &"[redacted]")
                .finish(),
        }
    }
}

impl SshAuth {
    /// Key-based credentials.
    #[must_use]
    pub fn key(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self::Key {
            user: user.into(),
            key_path: key_path.into(),
        }
    }

    /// Password credentials.
    #[must_use]
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            user: user.into(),
            password: password.into(),
        }
    }

    /// The login user.
    #[must_use]
    pub fn user(&self) -> &str {
        match self {
            Self::Key { user, .. } | Self::Password { user, .. } => user,
        }
    }
}

/// Captured output of a remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command and file execution against one remote host.
///
/// The trait is the seam the driver (and its tests) program against;
/// [`SshSession`] is the production implementation.
pub trait Executor: Send + Sync {
    /// The target host address.
    fn host(&self) -> &str;

    /// Run a command, returning its output regardless of exit code.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport problems, never for non-zero exits.
    fn execute(&self, cmd: &RemoteCommand) -> Result<ExecOutput, RemoteError>;

    /// Copy a local file to the remote path with the given mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or transferred.
    fn copy(&self, local: &Path, remote_path: &str, mode: i32) -> Result<(), RemoteError>;

    /// Run a command that must succeed.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailed`] on a non-zero exit.
    fn execute_ok(&self, cmd: &RemoteCommand) -> Result<ExecOutput, RemoteError> {
        let out = self.execute(cmd)?;
        if out.success() {
            Ok(out)
        } else {
            Err(RemoteError::CommandFailed {
                host: self.host().to_string(),
                command: cmd.display(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

/// SSH-backed executor.
#[derive(Clone)]
pub struct SshSession {
    host: String,
    auth: SshAuth,
    timeout: Duration,
}

impl SshSession {
    /// Create a session descriptor for `host`.
    #[must_use]
    pub fn new(host: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            auth,
            timeout: Duration::from_secs(120),
        }
    }

    /// Override the per-operation SSH timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open an authenticated transport.
    fn open(&self) -> Result<Session, RemoteError> {
        let addr = format!("{}:{SSH_PORT}", self.host);
        let sockaddr = addr
            .to_socket_addrs()
            .map_err(|e| RemoteError::Connect {
                host: self.host.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| RemoteError::Connect {
                host: self.host.clone(),
                source: std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address"),
            })?;

        let tcp = TcpStream::connect_timeout(&sockaddr, PROBE_CONNECT_TIMEOUT).map_err(|e| {
            RemoteError::Connect {
                host: self.host.clone(),
                source: e,
            }
        })?;

        let mut session = Session::new().map_err(|e| RemoteError::Ssh {
            host: self.host.clone(),
            source: e,
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(|e| RemoteError::Ssh {
            host: self.host.clone(),
            source: e,
        })?;

        match &self.auth {
            SshAuth::Key { user, key_path } => {
                session
                    .userauth_pubkey_file(user, None, key_path, None)
                    .map_err(|e| RemoteError::Ssh {
                        host: self.host.clone(),
                        source: e,
                    })?;
            }
            SshAuth::Password { user, password } => {
                session
                    .userauth_password(user, password)
                    .map_err(|e| RemoteError::Ssh {
                        host: self.host.clone(),
                        source: e,
                    })?;
            }
        }

        if !session.authenticated() {
            return Err(RemoteError::Auth {
                user: self.auth.user().to_string(),
                host: self.host.clone(),
            });
        }

        Ok(session)
    }

    /// Open a transport with the fixed attempt budget.
    fn open_with_retry(&self) -> Result<Session, RemoteError> {
        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.open() {
                Ok(session) => return Ok(session),
                Err(e @ (RemoteError::Connect { .. } | RemoteError::Ssh { .. })) => {
                    warn!(
                        host = %self.host,
                        attempt,
                        error = %e,
                        "transport attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        std::thread::sleep(CONNECT_RETRY_DELAY);
                    }
                }
                // Auth rejection will not improve with retries.
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("at least one attempt"))
    }
}

impl Executor for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn execute(&self, cmd: &RemoteCommand) -> Result<ExecOutput, RemoteError> {
        let session = self.open_with_retry()?;
        let wrap = |e: ssh2::Error| RemoteError::Ssh {
            host: self.host.clone(),
            source: e,
        };

        debug!(host = %self.host, command = %cmd.display(), "exec");

        let mut channel = session.channel_session().map_err(wrap)?;
        channel.exec(&cmd.render()).map_err(wrap)?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| RemoteError::Connect {
                host: self.host.clone(),
                source: e,
            })?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| RemoteError::Connect {
                host: self.host.clone(),
                source: e,
            })?;

        channel.wait_close().map_err(wrap)?;
        let exit_code = channel.exit_status().map_err(wrap)?;

        debug!(host = %self.host, exit_code, "exec done");
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn copy(&self, local: &Path, remote_path: &str, mode: i32) -> Result<(), RemoteError> {
        let data = std::fs::read(local).map_err(|e| RemoteError::LocalIo {
            path: local.to_path_buf(),
            source: e,
        })?;

        let session = self.open_with_retry()?;
        let wrap = |e: ssh2::Error| RemoteError::Ssh {
            host: self.host.clone(),
            source: e,
        };

        info!(
            host = %self.host,
            remote_path,
            bytes = data.len(),
            "copying file"
        );

        let mut channel = session
            .scp_send(Path::new(remote_path), mode, data.len() as u64, None)
            .map_err(wrap)?;
        channel.write_all(&data).map_err(|e| RemoteError::Connect {
            host: self.host.clone(),
            source: e,
        })?;
        channel.send_eof().map_err(wrap)?;
        channel.wait_eof().map_err(wrap)?;
        channel.wait_close().map_err(wrap)?;

        Ok(())
    }
}

/// Wait for the host's SSH port to accept TCP connections.
///
/// Must be called, and succeed, before any `execute`/`copy` against a freshly
/// provisioned host. Returns no earlier than `timeout` and no later than
/// `timeout + interval` on an unreachable host.
///
/// # Errors
///
/// Returns [`RemoteError::Unreachable`] if the port never opens in the window.
pub fn wait_for_reachable(
    host: &str,
    port: u16,
    timeout: Duration,
    interval: Duration,
) -> Result<(), RemoteError> {
    let addr = format!("{host}:{port}");
    info!(%addr, timeout_secs = timeout.as_secs(), "waiting for ssh");

    let sockaddrs: Vec<_> = addr
        .to_socket_addrs()
        .map_err(|e| RemoteError::Connect {
            host: host.to_string(),
            source: e,
        })?
        .collect();

    poll_until(&format!("ssh on {addr}"), timeout, interval, || {
        sockaddrs
            .iter()
            .any(|sa| TcpStream::connect_timeout(sa, PROBE_CONNECT_TIMEOUT).is_ok())
            .then_some(())
    })?;

    info!(%addr, "ssh is reachable");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_wait_for_reachable_succeeds_on_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        wait_for_reachable(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            Duration::from_millis(50),
        )
        .unwrap();
    }

    #[test]
    fn test_wait_for_reachable_timeout_precision() {
        // Bind then drop to get a port that refuses connections instantly.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let timeout = Duration::from_millis(300);
        let interval = Duration::from_millis(100);

        let start = Instant::now();
        let err = wait_for_reachable("127.0.0.1", port, timeout, interval).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, RemoteError::Unreachable(_)));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + interval + Duration::from_millis(200));
    }

    #[test]
    fn test_exec_output_success() {
        let out = ExecOutput {
            stdout: "ok".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(out.success());

        let failed = ExecOutput {
            stdout: String::new(),
            stderr: "boom".into(),
            exit_code: 1,
        };
        assert!(!failed.success());
    }

    #[test]
    fn test_auth_user() {
        assert_eq!(SshAuth::key("ops", "/tmp/key").user(), "ops");
        assert_eq!(SshAuth::password("root", "hunter2").user(), "root");
    }
}
