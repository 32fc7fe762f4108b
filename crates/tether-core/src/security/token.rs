use std::any::Any;
use std::fmt;

use super::{Principal, Secret, SecurityHandler, clear_principal, current_principal, set_principal};
use crate::error::BoxError;

const KEY_CONTEXT: &str = "tether signed token 2026-10 principal signature key";

/// Authenticates calls with tokens of the form `name;role1,role2;signature`.
///
/// The signature is a hex blake3 keyed hash of `name;roles` under a key
/// derived from a secret shared by client and server. The client sends the
/// token of the principal installed on the calling thread, if any. The server
/// verifies it and installs the principal on the thread running the call. A
/// call without a token runs unauthenticated.
pub struct SignedTokenHandler {
    key: [u8; 32],
}

impl SignedTokenHandler {
    pub fn new(shared_secret: &str) -> Self {
        SignedTokenHandler {
            key: blake3::derive_key(KEY_CONTEXT, shared_secret.as_bytes()),
        }
    }

    /// Issue a signed token, returning the principal it stands for.
    pub fn issue(&self, name: &str, roles: &[&str]) -> Result<Principal, TokenError> {
        if name.is_empty() || name.contains([';', ',']) {
            return Err(TokenError::InvalidName(name.to_owned()));
        }
        if let Some(bad) = roles.iter().find(|r| r.is_empty() || r.contains([';', ','])) {
            return Err(TokenError::InvalidName((*bad).to_owned()));
        }

        let claims = format!("{name};{}", roles.join(","));
        let signature = blake3::keyed_hash(&self.key, claims.as_bytes());
        Ok(Principal {
            name: name.to_owned(),
            roles: roles.iter().map(|r| (*r).to_owned()).collect(),
            token: format!("{claims};{}", signature.to_hex()),
        })
    }

    pub fn verify(&self, token: &str) -> Result<Principal, TokenError> {
        let (claims, signature) = token.rsplit_once(';').ok_or(TokenError::Malformed)?;
        let (name, roles) = claims.split_once(';').ok_or(TokenError::Malformed)?;
        if name.is_empty() {
            return Err(TokenError::Malformed);
        }

        let presented = blake3::Hash::from_hex(signature).map_err(|_| TokenError::Malformed)?;
        // Hash equality is constant time.
        if presented != blake3::keyed_hash(&self.key, claims.as_bytes()) {
            return Err(TokenError::BadSignature);
        }

        Ok(Principal {
            name: name.to_owned(),
            roles: roles
                .split(',')
                .filter(|r| !r.is_empty())
                .map(str::to_owned)
                .collect(),
            token: token.to_owned(),
        })
    }
}

impl fmt::Debug for SignedTokenHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedTokenHandler").finish_non_exhaustive()
    }
}

impl SecurityHandler for SignedTokenHandler {
    fn secret(&self) -> Option<Secret> {
        current_principal().map(|p| Box::new(p.token) as Secret)
    }

    fn encode_secret(&self, secret: Option<&(dyn Any + Send + Sync)>) -> Option<Vec<u8>> {
        let secret = secret?;
        if let Some(token) = secret.downcast_ref::<String>() {
            return Some(token.as_bytes().to_vec());
        }
        secret
            .downcast_ref::<&'static str>()
            .map(|token| token.as_bytes().to_vec())
    }

    fn decode_secret(&self, bytes: Option<&[u8]>) -> Option<Secret> {
        bytes.map(|b| Box::new(b.to_vec()) as Secret)
    }

    fn take_security_measures(
        &self,
        secret: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), BoxError> {
        let Some(secret) = secret else {
            clear_principal();
            return Ok(());
        };
        let bytes = secret
            .downcast_ref::<Vec<u8>>()
            .ok_or(TokenError::Malformed)?;
        let token = std::str::from_utf8(bytes).map_err(|_| TokenError::Malformed)?;
        let principal = self.verify(token)?;
        set_principal(principal);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    InvalidName(String),
    BadSignature,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Malformed => write!(f, "malformed token"),
            TokenError::InvalidName(name) => {
                write!(f, "{name:?} cannot appear in a token (empty, or contains ';' or ',')")
            }
            TokenError::BadSignature => write!(f, "token signature does not match"),
        }
    }
}

impl std::error::Error for TokenError {}
