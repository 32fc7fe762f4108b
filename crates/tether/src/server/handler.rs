use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{Codec, Frame, RpcError};
use tether_primitives::{AccessTimeout, CancellationToken, QueueError, poll_until};

use super::call::{Call, Reply};
use super::executor::CallExecutor;
use super::queues::{CallQueue, ReplyQueue};
use crate::endpoint::{Lifecycle, Worker};
use crate::options::ServerOptions;

/// How long an idle handler blocks on its queue before rechecking for stop.
const NEW_ITEM_WAIT: Duration = Duration::from_millis(100);

/// Pause before retrying a reply into a full reply queue.
const REPLY_RETRY: Duration = Duration::from_millis(1);

struct HandlerShared {
    calls: CallQueue,
    replies: ReplyQueue,
    stop: CancellationToken,
    /// Token of the call being executed. Locked before the call queue.
    current: Mutex<Option<CancellationToken>>,
}

impl HandlerShared {
    /// No queued call and none in hand.
    fn is_idle(&self) -> Result<bool, AccessTimeout> {
        let current = self.current.lock();
        Ok(current.is_none() && self.calls.is_empty()?)
    }
}

/// A worker executing calls from its own call queue into its own reply queue.
pub(crate) struct CallHandler {
    index: usize,
    shared: Arc<HandlerShared>,
    worker: Mutex<Option<Worker>>,
}

impl CallHandler {
    pub fn spawn<C: Codec>(
        index: usize,
        executor: Arc<CallExecutor<C>>,
        lifecycle: Arc<Lifecycle>,
        options: &ServerOptions,
    ) -> Result<Self, RpcError> {
        let shared = Arc::new(HandlerShared {
            calls: CallQueue::new(options.queue_capacity, options.lock_timeout),
            replies: ReplyQueue::new(options.queue_capacity, options.lock_timeout),
            stop: CancellationToken::new(),
            current: Mutex::new(None),
        });
        let worker = {
            let shared = shared.clone();
            Worker::spawn(
                format!("tether-handler {} #{index}", lifecycle.address()),
                move || handler_loop(index, &shared, &executor, &lifecycle),
            )?
        };
        Ok(CallHandler {
            index,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn enqueue_call(&self, frames: &[Frame], timeout: Duration) -> Result<(), QueueError> {
        self.shared.calls.enqueue(frames, timeout)
    }

    pub fn try_dequeue_reply(&self, out: &mut Reply) -> Result<bool, AccessTimeout> {
        self.shared.replies.try_dequeue(out)
    }

    /// Drain, then abort whatever is left, then join the worker.
    ///
    /// The dispatch loop must keep draining reply queues while this runs.
    pub fn stop(&self, options: &ServerOptions) {
        let shared = &self.shared;
        let index = self.index;

        match poll_until(options.handler_drain_timeout, || shared.is_idle()) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    handler = index,
                    timeout = ?options.handler_drain_timeout,
                    "handler did not drain, aborting its calls"
                );
                self.abort();
                match poll_until(options.handler_abort_grace, || shared.is_idle()) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!(handler = index, "handler still busy after abort")
                    }
                    Err(err) => tracing::error!(handler = index, %err, "could not drain handler"),
                }
            }
            Err(err) => {
                tracing::error!(handler = index, %err, "could not drain handler");
                self.abort();
            }
        }

        match shared.replies.wait_until_empty(options.handler_abort_grace) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(handler = index, "replies left unsent"),
            Err(err) => tracing::error!(handler = index, %err, "could not drain replies"),
        }

        shared.stop.cancel();
        if let Some(token) = shared.current.lock().as_ref() {
            token.cancel();
        }
        shared.calls.wake();
        if let Some(worker) = self.worker.lock().take() {
            worker.join(options.handler_join_timeout);
        }
    }

    /// Abort queued calls. The call in hand keeps running until stop.
    fn abort(&self) {
        match self.shared.calls.abort_all() {
            Ok(aborted) => tracing::debug!(handler = self.index, aborted, "aborted queued calls"),
            Err(err) => tracing::error!(handler = self.index, %err, "could not abort queued calls"),
        }
    }
}

fn handler_loop<C: Codec>(
    index: usize,
    shared: &HandlerShared,
    executor: &CallExecutor<C>,
    lifecycle: &Lifecycle,
) {
    let span = tracing::info_span!("call_handler", endpoint = %lifecycle.address(), handler = index);
    let _enter = span.enter();

    let mut call = Call::default();
    while !shared.stop.is_cancelled() {
        let taken = {
            let mut current = shared.current.lock();
            let taken = shared.calls.try_dequeue(&mut call);
            if let Ok(true) = taken {
                *current = Some(call.cancellation().clone());
            }
            taken
        };
        match taken {
            Ok(true) => {}
            Ok(false) => {
                shared.calls.wait_for_new_item(NEW_ITEM_WAIT);
                continue;
            }
            Err(err) => {
                lifecycle.fail(err);
                break;
            }
        }

        let reply = executor.execute(&call);
        let delivered = deliver(shared, call.envelope(), reply);
        *shared.current.lock() = None;
        if let Err(err) = delivered {
            lifecycle.fail(err);
            break;
        }
    }
    tracing::debug!("handler stopped");
}

fn deliver(shared: &HandlerShared, envelope: &[Frame], reply: Bytes) -> Result<(), AccessTimeout> {
    loop {
        match shared.replies.enqueue(envelope, reply.clone()) {
            Ok(()) => return Ok(()),
            Err(QueueError::Full { .. }) if shared.stop.is_cancelled() => {
                tracing::warn!("reply queue full while stopping, reply dropped");
                return Ok(());
            }
            Err(QueueError::Full { .. }) => thread::sleep(REPLY_RETRY),
            Err(QueueError::Timeout(err)) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServiceBinding;
    use crate::server::marshaller::ServerMarshaller;
    use std::time::Instant;
    use tether_core::wire::{self, ReplyHeader};
    use tether_core::{Args, ErrorCode, Interface, NullSecurityHandler, Params, Returns};

    fn handler(options: &ServerOptions) -> CallHandler {
        let marshaller = ServerMarshaller::new(Arc::new(NullSecurityHandler));
        marshaller
            .register(
                ServiceBinding::new(Interface::new("demo.Slow").method("nap", 1, Returns::Void))
                    .bind_void("nap", |p: &Params| {
                        thread::sleep(Duration::from_millis(p.get(0)?));
                        Ok(())
                    }),
            )
            .unwrap();
        let lifecycle = Arc::new(Lifecycle::new("inproc://handler-test"));
        lifecycle.mark_started();
        CallHandler::spawn(
            0,
            Arc::new(CallExecutor::new(Arc::new(marshaller))),
            lifecycle,
            options,
        )
        .unwrap()
    }

    fn nap(millis: u64) -> Vec<Frame> {
        let args = Args::<tether_core::PostcardCodec>::new().arg(&millis).unwrap();
        let payload = wire::encode_call("demo.Slow", "nap", None, &args.into_values()).unwrap();
        vec![Bytes::from_static(b"peer"), Bytes::from(payload)]
    }

    fn next_reply(handler: &CallHandler, within: Duration) -> Option<ReplyHeader> {
        let started = Instant::now();
        let mut reply = Reply::default();
        while started.elapsed() < within {
            if handler.try_dequeue_reply(&mut reply).unwrap() {
                assert_eq!(&reply.frames()[0][..], b"peer");
                let payload = reply.frames()[1].clone();
                return Some(wire::decode_reply(&payload).unwrap().0);
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn executes_in_queue_order() {
        let options = ServerOptions::default();
        let handler = handler(&options);
        handler.enqueue_call(&nap(1), Duration::from_secs(1)).unwrap();
        handler.enqueue_call(&nap(1), Duration::from_secs(1)).unwrap();

        for _ in 0..2 {
            let header = next_reply(&handler, Duration::from_secs(2)).unwrap();
            assert_eq!(header.error_code, ErrorCode::Ok);
        }
        handler.stop(&options);
    }

    #[test]
    fn stop_aborts_queued_calls_and_lets_the_running_one_finish() {
        let options = ServerOptions::default()
            .with_handler_drain_timeout(Duration::from_millis(50))
            .with_handler_abort_grace(Duration::from_millis(500));
        let handler = Arc::new(handler(&options));
        handler.enqueue_call(&nap(300), Duration::from_secs(5)).unwrap();
        handler.enqueue_call(&nap(300), Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(20));

        let collector = {
            let handler = handler.clone();
            thread::spawn(move || {
                let mut codes = Vec::new();
                while let Some(header) = next_reply(&handler, Duration::from_secs(2)) {
                    codes.push(header.error_code);
                    if codes.len() == 2 {
                        break;
                    }
                }
                codes
            })
        };
        handler.stop(&options);
        assert_eq!(
            collector.join().unwrap(),
            vec![ErrorCode::Ok, ErrorCode::Aborted]
        );
    }
}
