// Authentication sub-protocol
//
// When STARTUP is answered with AUTHENTICATE, the connection drives a
// challenge/response exchange through a pluggable provider. The provider
// builds one `Authenticator` per connection attempt; a failed exchange
// surfaces as AuthenticationError and is never retried on the same host.

use std::net::SocketAddr;

use crate::error::{DriverError, Result};

/// Per-connection authentication state machine.
pub trait Authenticator: Send {
    /// Token sent in the first AUTH_RESPONSE.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;

    /// Token sent in reply to an AUTH_CHALLENGE.
    fn evaluate_challenge(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>>;

    /// Called with the final token carried by AUTH_SUCCESS.
    fn on_authentication_success(&mut self, token: Option<&[u8]>);
}

/// Factory for authenticators, one per connection.
pub trait AuthProvider: Send + Sync {
    /// `authenticator_name` is the server-announced class name; providers
    /// may use it to pick a mechanism or reject the server.
    fn new_authenticator(
        &self,
        endpoint: SocketAddr,
        authenticator_name: &str,
    ) -> Result<Box<dyn Authenticator>>;
}

/// SASL PLAIN credentials, the mechanism spoken by the stock password
/// authenticator.
pub struct PlainTextAuthProvider {
    username: String,
    password: String,
}

impl PlainTextAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthProvider {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl AuthProvider for PlainTextAuthProvider {
    fn new_authenticator(
        &self,
        _endpoint: SocketAddr,
        _authenticator_name: &str,
    ) -> Result<Box<dyn Authenticator>> {
        Ok(Box::new(PlainTextAuthenticator {
            username: self.username.clone(),
            password: self.password.clone(),
        }))
    }
}

struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        Ok(Some(token))
    }

    fn evaluate_challenge(&mut self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        Err(DriverError::Authentication(
            "plain-text authenticator received an unexpected challenge".to_string(),
        ))
    }

    fn on_authentication_success(&mut self, _token: Option<&[u8]>) {}
}
