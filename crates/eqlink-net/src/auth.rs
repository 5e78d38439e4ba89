//! Token login over the reliable channel.

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionManager;
use crate::correlator::RequestError;
use crate::framing::Opcode;
use crate::transport::Connector;

/// Login message carrying the session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Opaque bearer token.
    pub token: String,
}

/// Server verdict. A positive status means the token was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Status code reported by the server.
    pub status: i32,
}

impl LoginResponse {
    /// Whether the server accepted the login.
    pub fn accepted(&self) -> bool {
        self.status > 0
    }
}

/// Opcodes of the login exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOpcodes {
    /// Request carrying the token.
    pub login: Opcode,
    /// Server verdict.
    pub response: Opcode,
}

impl Default for AuthOpcodes {
    fn default() -> Self {
        Self {
            login: 1,
            response: 2,
        }
    }
}

/// Login failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The exchange itself failed.
    #[error("login request failed: {0}")]
    Request(#[from] RequestError),

    /// The server answered with a non-positive status.
    #[error("login rejected with status {status}")]
    Rejected {
        /// Status code reported by the server.
        status: i32,
    },
}

/// Send `token` and wait for the server's verdict.
pub async fn authenticate<C: Connector>(
    manager: &ConnectionManager<C>,
    opcodes: AuthOpcodes,
    token: &str,
) -> Result<LoginResponse, AuthError> {
    let request = LoginRequest {
        token: token.to_string(),
    };
    let response: LoginResponse = manager
        .request(opcodes.login, opcodes.response, &request)
        .await?;

    if !response.accepted() {
        tracing::warn!(status = response.status, "login rejected");
        return Err(AuthError::Rejected {
            status: response.status,
        });
    }
    tracing::info!(status = response.status, "authenticated");
    Ok(response)
}
