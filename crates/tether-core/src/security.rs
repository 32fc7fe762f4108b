//! Per-call authentication hook.
//!
//! On the client, [`SecurityHandler::secret`] is asked for a secret on the
//! calling thread and [`SecurityHandler::encode_secret`] turns it into the
//! opaque bytes carried in the call header. On the server the bytes are
//! decoded again and [`SecurityHandler::take_security_measures`] decides
//! whether the call may run. It runs on the thread that executes the call, so
//! a handler may install a [`Principal`] for the method to inspect.

use std::any::Any;
use std::cell::RefCell;

use crate::error::BoxError;

mod token;

pub use token::{SignedTokenHandler, TokenError};

/// A secret in its in-memory form.
pub type Secret = Box<dyn Any + Send + Sync>;

pub trait SecurityHandler: Send + Sync + 'static {
    /// Secret for the call about to be made from the current thread.
    fn secret(&self) -> Option<Secret>;

    fn encode_secret(&self, secret: Option<&(dyn Any + Send + Sync)>) -> Option<Vec<u8>>;

    fn decode_secret(&self, bytes: Option<&[u8]>) -> Option<Secret>;

    /// Accept or refuse a call carrying `secret`.
    fn take_security_measures(
        &self,
        secret: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), BoxError>;
}

/// Sends no secret and accepts every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSecurityHandler;

impl SecurityHandler for NullSecurityHandler {
    fn secret(&self) -> Option<Secret> {
        None
    }

    fn encode_secret(&self, _secret: Option<&(dyn Any + Send + Sync)>) -> Option<Vec<u8>> {
        None
    }

    fn decode_secret(&self, _bytes: Option<&[u8]>) -> Option<Secret> {
        None
    }

    fn take_security_measures(
        &self,
        _secret: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub roles: Vec<String>,
    /// The credential this principal was established from.
    pub token: String,
}

impl Principal {
    pub fn is_in_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

thread_local! {
    static PRINCIPAL: RefCell<Option<Principal>> = const { RefCell::new(None) };
}

/// Install `principal` on the current thread, returning the previous one.
pub fn set_principal(principal: Principal) -> Option<Principal> {
    PRINCIPAL.with(|p| p.borrow_mut().replace(principal))
}

pub fn current_principal() -> Option<Principal> {
    PRINCIPAL.with(|p| p.borrow().clone())
}

pub fn clear_principal() -> Option<Principal> {
    PRINCIPAL.with(|p| p.borrow_mut().take())
}

/// Run `f` with `principal` installed, restoring the previous principal after.
pub fn with_principal<R>(principal: Principal, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Principal>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            PRINCIPAL.with(|p| *p.borrow_mut() = previous);
        }
    }

    let _restore = Restore(set_principal(principal));
    f()
}
