//! Connection Authentication
//!
//! Checks the `{id, jwt}` handshake a client sends when it connects.
//! The JWT is an opaque credential issued and checked elsewhere; the relay
//! only keeps it with the session.

use thiserror::Error;

use crate::network::protocol::{AuthRequest, PlayerId};

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Handshake carried an empty player id.
    #[error("empty player id")]
    EmptyPlayerId,
}

/// Resolve the handshake to the player id the connection will act as.
pub fn authenticate(request: &AuthRequest) -> Result<PlayerId, AuthError> {
    if request.id.as_str().is_empty() {
        return Err(AuthError::EmptyPlayerId);
    }
    Ok(request.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, jwt: &str) -> AuthRequest {
        AuthRequest { id: id.into(), jwt: jwt.into() }
    }

    #[test]
    fn test_credential_is_opaque() {
        let id = authenticate(&request("alice", "not-a-jwt")).unwrap();
        assert_eq!(id, PlayerId::from("alice"));

        let id = authenticate(&request("bob", "")).unwrap();
        assert_eq!(id.as_str(), "bob");
    }

    #[test]
    fn test_empty_player_id_rejected() {
        assert_eq!(authenticate(&request("", "jwt")), Err(AuthError::EmptyPlayerId));
    }
}
