use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tether_core::{BoxError, Codec, ErrorCode, RpcError, security};

use super::call::Call;
use super::marshaller::ServerMarshaller;

/// Granularity at which a waiting executor notices cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Runs one call to completion, cancellation or deadline and produces the
/// reply payload.
pub(crate) struct CallExecutor<C: Codec> {
    marshaller: Arc<ServerMarshaller<C>>,
}

impl<C: Codec> CallExecutor<C> {
    pub fn new(marshaller: Arc<ServerMarshaller<C>>) -> Self {
        CallExecutor { marshaller }
    }

    /// Execute `call` on a dedicated thread, bounded by its timeout.
    ///
    /// A method still running when the deadline passes or the call is
    /// cancelled is left to finish on its own; its result is discarded.
    pub fn execute(&self, call: &Call) -> Bytes {
        if call.is_aborted() {
            return self.marshaller.marshal_error(&aborted());
        }
        let Some(payload) = call.payload().cloned() else {
            return self
                .marshaller
                .marshal_error(&RpcError::internal("call carries no payload"));
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let marshaller = self.marshaller.clone();
        let spawned = thread::Builder::new()
            .name("tether-call".to_owned())
            .spawn(move || {
                let reply = run(&marshaller, &payload);
                // The receiver is gone when the call timed out.
                let _ = tx.send(reply);
            });
        if let Err(err) = spawned {
            tracing::error!(%err, "failed to spawn call thread");
            return self.marshaller.marshal_error(&RpcError::new(
                ErrorCode::Unavailable,
                "Server could not start the call.",
            ));
        }

        let deadline = Instant::now() + call.timeout();
        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(timeout = ?call.timeout(), "call exceeded its deadline");
                return self.marshaller.marshal_error(&RpcError::new(
                    ErrorCode::DeadlineExceeded,
                    "Call has timed out.",
                ));
            }
            match rx.recv_timeout(CANCEL_POLL.min(deadline - now)) {
                Ok(reply) => return reply,
                Err(RecvTimeoutError::Timeout) => {
                    if call.is_aborted() {
                        tracing::debug!("call cancelled while running");
                        return self.marshaller.marshal_error(&aborted());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return self
                        .marshaller
                        .marshal_error(&RpcError::internal("call thread exited without a reply"));
                }
            }
        }
    }
}

fn aborted() -> RpcError {
    RpcError::new(ErrorCode::Aborted, "Call has been cancelled.")
}

/// Authenticate, decode and invoke; every failure becomes an error reply.
fn run<C: Codec>(marshaller: &ServerMarshaller<C>, payload: &[u8]) -> Bytes {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let dispatch = marshaller.unmarshal_call(payload)?;
        dispatch.invoke().map_err(|err| handler_error(dispatch.method(), err))
    }));
    security::clear_principal();

    match result {
        Ok(Ok(outcome)) => marshaller.marshal_outcome(outcome),
        Ok(Err(err)) => marshaller.marshal_error(&err),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_owned());
            tracing::error!(%message, "method panicked");
            marshaller.marshal_error(&RpcError::new(
                ErrorCode::Unknown,
                format!("Exception was thrown by handler. {message}"),
            ))
        }
    }
}

/// An [`RpcError`] keeps its code; anything else is reported as `Unknown`.
fn handler_error(method: &str, err: BoxError) -> RpcError {
    match err.downcast::<RpcError>() {
        Ok(rpc) => *rpc,
        Err(other) => {
            tracing::error!(method, err = %other, "method failed");
            RpcError::new(
                ErrorCode::Unknown,
                format!("Exception was thrown by handler. {other}"),
            )
        }
    }
}
