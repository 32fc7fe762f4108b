use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{
    Codec, EndpointMetrics, ErrorCode, Frame, RpcError, Socket, SocketFactory, TransportError,
};
use tether_primitives::{CancellationToken, QueueError};

use super::call::Reply;
use super::executor::CallExecutor;
use super::handler::CallHandler;
use super::marshaller::error_reply;
use crate::endpoint::{Fatal, Lifecycle, Worker};
use crate::options::ServerOptions;

/// Frames in a call as the router delivers it: peer identity, slot index,
/// sequence number, payload.
const CALL_FRAMES: usize = 4;

struct Dispatch {
    lifecycle: Arc<Lifecycle>,
    metrics: Arc<EndpointMetrics>,
    handlers: Vec<CallHandler>,
    stop: CancellationToken,
    options: ServerOptions,
}

/// The bound socket, its dispatch worker and the handler pool.
pub(crate) struct ServerEndpoint {
    dispatch: Arc<Dispatch>,
    worker: Mutex<Option<Worker>>,
}

impl ServerEndpoint {
    /// Spawn the handlers, then bind and start dispatching.
    pub fn start<C: Codec>(
        factory: Arc<dyn SocketFactory>,
        executor: Arc<CallExecutor<C>>,
        lifecycle: Arc<Lifecycle>,
        metrics: Arc<EndpointMetrics>,
        options: ServerOptions,
    ) -> Result<Self, RpcError> {
        if options.handler_count == 0 || options.queue_capacity == 0 {
            return Err(RpcError::invalid_argument(
                "handler count and queue capacity must be > 0",
            ));
        }

        let mut handlers = Vec::with_capacity(options.handler_count);
        for index in 0..options.handler_count {
            match CallHandler::spawn(index, executor.clone(), lifecycle.clone(), &options) {
                Ok(handler) => handlers.push(handler),
                Err(err) => {
                    for handler in &handlers {
                        handler.stop(&options);
                    }
                    return Err(err);
                }
            }
        }

        let dispatch = Arc::new(Dispatch {
            lifecycle,
            metrics,
            handlers,
            stop: CancellationToken::new(),
            options,
        });
        let spawned = {
            let dispatch = dispatch.clone();
            Worker::spawn(
                format!("tether-server {}", dispatch.lifecycle.address()),
                move || server_loop(&dispatch, factory.as_ref()),
            )
        };
        let worker = match spawned {
            Ok(worker) => Some(worker),
            Err(err) => {
                ServerEndpoint {
                    dispatch,
                    worker: Mutex::new(None),
                }
                .shutdown();
                return Err(err);
            }
        };
        let endpoint = ServerEndpoint {
            dispatch,
            worker: Mutex::new(worker),
        };

        let start_timeout = endpoint.dispatch.options.start_timeout;
        if let Err(err) = endpoint.dispatch.lifecycle.wait_started(start_timeout) {
            endpoint.shutdown();
            return Err(err);
        }
        Ok(endpoint)
    }

    /// Stop the handlers in parallel, then the dispatch worker. Idempotent.
    pub fn shutdown(&self) {
        let dispatch = &self.dispatch;
        if !dispatch.lifecycle.begin_dispose() {
            return;
        }

        thread::scope(|scope| {
            for handler in &dispatch.handlers {
                scope.spawn(|| handler.stop(&dispatch.options));
            }
        });

        dispatch.stop.cancel();
        if let Some(worker) = self.worker.lock().take() {
            worker.join(dispatch.options.join_timeout);
        }
        dispatch.lifecycle.finish_dispose();
    }
}

/// Round-robin positions, carried across loop iterations.
struct Cursor {
    next_handler: usize,
    last_drained: usize,
}

fn server_loop(dispatch: &Dispatch, factory: &dyn SocketFactory) {
    let address = dispatch.lifecycle.address();
    let span = tracing::info_span!("server_loop", endpoint = %address);
    let _enter = span.enter();

    let mut socket = match factory.bind(address) {
        Ok(socket) => socket,
        Err(err) => {
            dispatch.lifecycle.fail(format!("bind failed: {err}"));
            return;
        }
    };
    dispatch.lifecycle.mark_started();

    let handlers = dispatch.handlers.len();
    let mut cursor = Cursor {
        next_handler: 0,
        last_drained: handlers - 1,
    };
    let mut reply = Reply::default();
    let mut idle = 0u32;

    while !dispatch.stop.is_cancelled() {
        match pump(dispatch, socket.as_mut(), &mut cursor, &mut reply) {
            Ok(true) => idle = 0,
            Ok(false) => {
                idle = idle.saturating_add(1);
                if idle > dispatch.options.idle_spin_limit {
                    thread::sleep(dispatch.options.idle_sleep);
                } else {
                    thread::yield_now();
                }
            }
            Err(err) => {
                dispatch.lifecycle.fail(err);
                return;
            }
        }
    }

    if let Err(err) = flush(dispatch, socket.as_mut(), &mut reply) {
        tracing::warn!(%err, "could not flush replies on stop");
    }
    tracing::debug!("server loop stopped");
}

/// Receive every available call, then drain one reply queue. Returns whether
/// there was anything to do.
fn pump(
    dispatch: &Dispatch,
    socket: &mut dyn Socket,
    cursor: &mut Cursor,
    reply: &mut Reply,
) -> Result<bool, Fatal> {
    let mut busy = false;

    while let Some(frames) = socket.recv_message()? {
        busy = true;
        receive(dispatch, socket, cursor, &frames)?;
    }

    let handlers = dispatch.handlers.len();
    for step in 1..=handlers {
        let index = (cursor.last_drained + step) % handlers;
        let mut drained = false;
        while dispatch.handlers[index].try_dequeue_reply(reply)? {
            drained = true;
            send(socket, reply.frames())?;
            dispatch.metrics.record_sent();
        }
        if drained {
            cursor.last_drained = index;
            busy = true;
            break;
        }
    }

    Ok(busy)
}

fn receive(
    dispatch: &Dispatch,
    socket: &mut dyn Socket,
    cursor: &mut Cursor,
    frames: &[Frame],
) -> Result<(), Fatal> {
    if frames.len() < CALL_FRAMES {
        tracing::error!(
            frames = frames.len(),
            expected = CALL_FRAMES,
            "call has too few frames, discarding"
        );
        dispatch.metrics.record_protocol_error();
        return Ok(());
    }
    if !dispatch.lifecycle.is_started() {
        tracing::warn!(state = %dispatch.lifecycle.state(), "endpoint not started, call dropped");
        dispatch.metrics.record_rejected();
        return Ok(());
    }

    let handler = &dispatch.handlers[cursor.next_handler];
    cursor.next_handler = (cursor.next_handler + 1) % dispatch.handlers.len();

    match handler.enqueue_call(frames, dispatch.options.call_timeout) {
        Ok(()) => {
            dispatch.metrics.record_received();
            Ok(())
        }
        Err(QueueError::Full { capacity }) => {
            tracing::warn!(capacity, "call queue full, rejecting call");
            dispatch.metrics.record_rejected();
            let payload = error_reply(&RpcError::new(
                ErrorCode::Unavailable,
                "Server is overloaded.",
            ));
            let mut message = frames[..frames.len() - 1].to_vec();
            message.push(payload);
            send(socket, &message)
        }
        Err(QueueError::Timeout(err)) => Err(err.into()),
    }
}

fn send(socket: &mut dyn Socket, frames: &[Bytes]) -> Result<(), Fatal> {
    match socket.send_message(frames) {
        Ok(()) => Ok(()),
        Err(TransportError::Full) => {
            tracing::warn!("transport is full, reply dropped");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Send whatever replies are still queued.
fn flush(dispatch: &Dispatch, socket: &mut dyn Socket, reply: &mut Reply) -> Result<(), Fatal> {
    for handler in &dispatch.handlers {
        while handler.try_dequeue_reply(reply)? {
            send(socket, reply.frames())?;
            dispatch.metrics.record_sent();
        }
    }
    Ok(())
}
