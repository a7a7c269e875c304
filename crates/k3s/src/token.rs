//! Join token retrieval.
//!
//! The join secret authorizes agents into the cluster. It is fetched from a
//! bootstrapped server, held only in memory for the duration of the run, and
//! never written to logs or disk.

use std::time::Duration;

use remote::{Executor, RemoteCommand, RemoteError};
use thiserror::Error;
use tracing::{info, warn};

use crate::node::{Node, NodeState};

/// Where k3s writes the cluster join token.
const TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/node-token";

/// The token file can lag service start by a few seconds.
const TOKEN_ATTEMPTS: u32 = 5;
const TOKEN_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Errors retrieving the join token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The issuing node has not reached `Bootstrapped`; the token must not
    /// be used before then.
    #[error("node {node} is {state}, not bootstrapped; refusing to read join token")]
    NotBootstrapped { node: String, state: NodeState },

    /// The token file never appeared.
    #[error("join token missing on {node} after {attempts} attempts")]
    Missing { node: String, attempts: u32 },

    /// Transport failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// A cluster join secret, scoped to a single cluster and a single run.
#[derive(Clone)]
pub struct JoinToken {
    value: String,
}

impl JoinToken {
    /// The secret value, for handing to the agent installer.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

// The token is a credential; keep it out of debug output.
impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinToken").field("value", &"[redacted]").finish()
    }
}

/// Fetch the join token from a bootstrapped server node.
///
/// Fails fast if the node's state is below `Bootstrapped`; retries a few
/// times with a short delay because the token file may lag service start.
///
/// # Errors
///
/// Returns [`TokenError::NotBootstrapped`] before the gate,
/// [`TokenError::Missing`] if the file never appears, or a transport error.
pub fn join_token(exec: &dyn Executor, server: &Node) -> Result<JoinToken, TokenError> {
    if !server.has_reached(NodeState::Bootstrapped) {
        return Err(TokenError::NotBootstrapped {
            node: server.name.clone(),
            state: server.state,
        });
    }

    let cmd = RemoteCommand::new("cat").arg(TOKEN_PATH).sudo();

    for attempt in 1..=TOKEN_ATTEMPTS {
        let out = exec.execute(&cmd)?;
        if out.success() {
            let value = out.stdout.trim().to_string();
            if !value.is_empty() {
                info!(node = %server.name, "join token retrieved");
                return Ok(JoinToken { value });
            }
        }

        warn!(
            node = %server.name,
            attempt,
            "join token not available yet"
        );
        if attempt < TOKEN_ATTEMPTS {
            std::thread::sleep(TOKEN_RETRY_DELAY);
        }
    }

    Err(TokenError::Missing {
        node: server.name.clone(),
        attempts: TOKEN_ATTEMPTS,
    })
}
