use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::wire;
use tether_core::{EndpointMetrics, ErrorCode, Frame, RpcError, Socket, SocketFactory, TransportError};
use tether_primitives::{ArenaError, CallArena, CallId, CancellationToken, WaitOutcome};

use crate::endpoint::{EndpointState, Fatal, Lifecycle, Worker};
use crate::options::ChannelOptions;

/// Frames in a reply: slot index, sequence number, payload.
const REPLY_FRAMES: usize = 3;

struct Shared {
    lifecycle: Lifecycle,
    arena: CallArena,
    metrics: EndpointMetrics,
    stop: CancellationToken,
}

/// One connection: the call arena plus the worker that moves calls out and
/// replies in.
pub(crate) struct ClientEndpoint {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    options: ChannelOptions,
}

impl std::fmt::Debug for ClientEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEndpoint").finish_non_exhaustive()
    }
}

impl ClientEndpoint {
    pub fn start(
        address: &str,
        factory: Arc<dyn SocketFactory>,
        options: ChannelOptions,
    ) -> Result<Self, RpcError> {
        if options.arena_capacity == 0 {
            return Err(RpcError::invalid_argument("arena capacity must be > 0"));
        }
        let shared = Arc::new(Shared {
            lifecycle: Lifecycle::new(address),
            arena: CallArena::new(options.arena_capacity, options.lock_timeout),
            metrics: EndpointMetrics::new(),
            stop: CancellationToken::new(),
        });

        let worker = {
            let shared = shared.clone();
            let address = address.to_owned();
            let idle_sleep = options.idle_sleep;
            Worker::spawn(format!("tether-client {address}"), move || {
                client_loop(&shared, factory.as_ref(), &address, idle_sleep)
            })?
        };

        let endpoint = ClientEndpoint {
            shared,
            worker: Mutex::new(Some(worker)),
            options,
        };
        if let Err(err) = endpoint
            .shared
            .lifecycle
            .wait_started(endpoint.options.start_timeout)
        {
            endpoint.shutdown();
            return Err(err);
        }
        Ok(endpoint)
    }

    pub fn address(&self) -> &str {
        self.shared.lifecycle.address()
    }

    pub fn state(&self) -> EndpointState {
        self.shared.lifecycle.state()
    }

    pub fn metrics(&self) -> &EndpointMetrics {
        &self.shared.metrics
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.shared.lifecycle
    }

    /// Submit a call payload and block for its reply payload.
    pub fn call(&self, payload: Bytes, timeout: Duration) -> Result<Bytes, RpcError> {
        let shared = &self.shared;
        if let Err(err) = shared.lifecycle.ensure_started() {
            shared.metrics.record_rejected();
            return Err(err);
        }

        let slot = self.submit(payload, timeout)?;
        let id = slot.id;

        let outcome = shared
            .arena
            .wait(id, timeout + self.options.wait_overhead)
            .inspect_err(|err| {
                if let ArenaError::Timeout(timeout) = err {
                    shared.lifecycle.fail(timeout);
                }
            })?;
        match outcome {
            WaitOutcome::Replied(reply) => Ok(reply),
            WaitOutcome::TimedOut => {
                tracing::debug!(endpoint = %self.address(), call = %id, ?timeout, "call timed out");
                Err(RpcError::new(
                    ErrorCode::DeadlineExceeded,
                    "Call has timed out.",
                ))
            }
            WaitOutcome::Aborted => Err(aborted()),
        }
    }

    /// Claim a slot for `payload`.
    ///
    /// Shutdown can begin between the caller's state check and the claim, after
    /// `abort_all` has already run, so a slot claimed on an endpoint that is no
    /// longer started is released and the call reported aborted.
    fn submit(&self, payload: Bytes, timeout: Duration) -> Result<SlotGuard<'_>, RpcError> {
        let shared = &self.shared;
        let id = shared.arena.add_pending(payload, timeout).map_err(|err| {
            match &err {
                ArenaError::ResourceExhausted { .. } => shared.metrics.record_rejected(),
                ArenaError::Timeout(timeout) => shared.lifecycle.fail(timeout),
                ArenaError::InvalidState { .. } => {}
            }
            RpcError::from(err)
        })?;
        let slot = SlotGuard {
            arena: &shared.arena,
            id,
        };
        if !shared.lifecycle.is_started() {
            tracing::debug!(endpoint = %self.address(), call = %id, "endpoint stopped while submitting");
            return Err(aborted());
        }
        Ok(slot)
    }

    /// Drain in-flight calls, abort what is left and stop the worker.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let was_running = shared.lifecycle.state() == EndpointState::Started;
        if !shared.lifecycle.begin_dispose() {
            return;
        }

        if was_running {
            match shared.arena.wait_for_drain(self.options.drain_timeout) {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    endpoint = %self.address(),
                    timeout = ?self.options.drain_timeout,
                    "calls still in flight, aborting them"
                ),
                Err(err) => tracing::error!(endpoint = %self.address(), %err, "could not drain calls"),
            }
        }
        match shared.arena.abort_all() {
            Ok(0) => {}
            Ok(aborted) => {
                tracing::debug!(endpoint = %self.address(), aborted, "aborted calls");
                thread::sleep(self.options.abort_grace);
            }
            Err(err) => tracing::error!(endpoint = %self.address(), %err, "could not abort calls"),
        }

        shared.stop.cancel();
        if let Some(worker) = self.worker.lock().take() {
            worker.join(self.options.join_timeout);
        }
        shared.lifecycle.finish_dispose();
    }
}

fn aborted() -> RpcError {
    RpcError::new(ErrorCode::Aborted, "Call has been aborted.")
}

/// Returns a call's slot to the arena however the call ends.
struct SlotGuard<'a> {
    arena: &'a CallArena,
    id: CallId,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.arena.remove(self.id) {
            tracing::error!(call = %self.id, %err, "failed to release call slot");
        }
    }
}

fn client_loop(shared: &Shared, factory: &dyn SocketFactory, address: &str, idle_sleep: Duration) {
    let span = tracing::info_span!("client_loop", endpoint = %address);
    let _enter = span.enter();

    let mut socket = match factory.connect(address) {
        Ok(socket) => socket,
        Err(err) => {
            shared.lifecycle.fail(format!("connect failed: {err}"));
            return;
        }
    };
    shared.lifecycle.mark_started();

    while !shared.stop.is_cancelled() {
        match pump(shared, socket.as_mut()) {
            Ok(true) => {}
            Ok(false) => thread::sleep(idle_sleep),
            Err(err) => {
                shared.lifecycle.fail(err);
                break;
            }
        }
    }
    tracing::debug!("client loop stopped");
}

/// One loop iteration: send at most one pending call, then bind every
/// available reply. Returns whether there was anything to do.
fn pump(shared: &Shared, socket: &mut dyn Socket) -> Result<bool, Fatal> {
    let mut busy = false;

    if socket.has_outgoing_capacity() {
        if let Some(call) = shared.arena.take_pending_for_sending()? {
            busy = true;
            let [index, sequence] = wire::encode_call_id(call.id);
            match socket.send_message(&[index, sequence, call.payload]) {
                Ok(()) => {
                    shared.metrics.record_sent();
                    tracing::trace!(call = %call.id, "call sent");
                }
                // The caller will see its wait time out.
                Err(TransportError::Full) => {
                    tracing::warn!(call = %call.id, "transport is full, call dropped")
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    while let Some(frames) = socket.recv_message()? {
        busy = true;
        bind_reply(shared, &frames)?;
    }

    Ok(busy)
}

fn bind_reply(shared: &Shared, frames: &[Frame]) -> Result<(), Fatal> {
    if frames.len() != REPLY_FRAMES {
        tracing::error!(
            frames = frames.len(),
            expected = REPLY_FRAMES,
            "reply has the wrong number of frames, discarding"
        );
        shared.metrics.record_protocol_error();
        return Ok(());
    }

    let id = match wire::decode_call_id(&frames[0], &frames[1]) {
        Ok(id) => id,
        Err(err) => {
            tracing::error!(%err, "malformed reply id, discarding");
            shared.metrics.record_protocol_error();
            return Ok(());
        }
    };

    if shared.arena.set_reply(id, frames[2].clone())? {
        shared.metrics.record_received();
        tracing::trace!(call = %id, "reply bound");
    } else {
        tracing::warn!(call = %id, "reply matches no executing call, discarding");
        shared.metrics.record_stale_reply();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::transport::MemHub;
    use tether_core::wire::ReplyHeader;

    fn options() -> ChannelOptions {
        ChannelOptions::default()
            .with_drain_timeout(Duration::from_millis(50))
            .with_abort_grace(Duration::from_millis(5))
    }

    #[test]
    fn connect_failure_fails_start() {
        let hub = MemHub::new();
        let err = ClientEndpoint::start("inproc://nobody", Arc::new(hub), options()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unavailable);
    }

    #[test]
    fn replies_bind_by_call_id() {
        let hub = MemHub::new();
        let mut router = hub.bind("inproc://echo").unwrap();
        let endpoint = Arc::new(
            ClientEndpoint::start("inproc://echo", Arc::new(hub.clone()), options()).unwrap(),
        );

        let caller = {
            let endpoint = endpoint.clone();
            thread::spawn(move || endpoint.call(Bytes::from_static(b"ping"), Duration::from_secs(5)))
        };

        let request = loop {
            if let Some(frames) = router.recv_message().unwrap() {
                break frames;
            }
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(request.len(), 4);
        assert_eq!(&request[3][..], b"ping");

        // Wrong frame count, stale sequence, then the real reply.
        let reply = Bytes::from(wire::encode_reply(&ReplyHeader::ok(true), None).unwrap());
        router
            .send_message(&[request[0].clone(), request[1].clone(), reply.clone()])
            .unwrap();
        let id = wire::decode_call_id(&request[1], &request[2]).unwrap();
        let [index, stale] = wire::encode_call_id(CallId::new(id.index, id.sequence.wrapping_add(9)));
        router
            .send_message(&[request[0].clone(), index, stale, reply.clone()])
            .unwrap();
        router
            .send_message(&[
                request[0].clone(),
                request[1].clone(),
                request[2].clone(),
                reply.clone(),
            ])
            .unwrap();

        assert_eq!(caller.join().unwrap().unwrap(), reply);
        let metrics = endpoint.metrics().snapshot();
        assert_eq!(metrics.messages_sent, 1);
        assert_eq!(metrics.messages_received, 1);
        assert_eq!(metrics.stale_replies, 1);
        assert_eq!(metrics.protocol_errors, 1);

        endpoint.shutdown();
        assert_eq!(endpoint.state(), EndpointState::Disposed);
    }

    #[test]
    fn unanswered_call_times_out_and_frees_its_slot() {
        let hub = MemHub::new();
        let _router = hub.bind("inproc://silent").unwrap();
        let endpoint = ClientEndpoint::start(
            "inproc://silent",
            Arc::new(hub.clone()),
            options()
                .with_arena_capacity(1)
                .with_wait_overhead(Duration::from_millis(1)),
        )
        .unwrap();

        let err = endpoint
            .call(Bytes::from_static(b"x"), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DeadlineExceeded);

        // The only slot is free again.
        let err = endpoint
            .call(Bytes::from_static(b"y"), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DeadlineExceeded);
        endpoint.shutdown();
    }

    #[test]
    fn call_submitted_during_shutdown_is_aborted() {
        let hub = MemHub::new();
        let _router = hub.bind("inproc://closing").unwrap();
        let endpoint = ClientEndpoint::start(
            "inproc://closing",
            Arc::new(hub.clone()),
            options().with_arena_capacity(1),
        )
        .unwrap();
        endpoint.shutdown();

        // A caller that passed the state check before shutdown aborted the arena.
        let started = std::time::Instant::now();
        let err = endpoint
            .submit(Bytes::from_static(b"late"), Duration::from_secs(5))
            .map(|slot| slot.id)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Aborted);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(endpoint.shared.arena.counts().unwrap().free, 1);
    }

    #[test]
    fn calls_after_shutdown_are_unavailable() {
        let hub = MemHub::new();
        let _router = hub.bind("inproc://gone").unwrap();
        let endpoint =
            ClientEndpoint::start("inproc://gone", Arc::new(hub.clone()), options()).unwrap();
        endpoint.shutdown();
        endpoint.shutdown();

        let err = endpoint
            .call(Bytes::new(), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unavailable);
        assert_eq!(endpoint.metrics().snapshot().calls_rejected, 1);
    }
}
