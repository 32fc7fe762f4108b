//! In-process router/dealer transport.
//!
//! A [`MemHub`] is an explicitly constructed address space. Routers bind
//! `inproc://` addresses on it; dealers connect to them and get a fresh 4-byte
//! identity. Every socket owns an inbox of whole messages bounded by a
//! high-water mark.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{FaultAction, FaultInjector, Frame, Socket, SocketFactory, TransportError};

/// Messages an inbox holds before senders see [`TransportError::Full`].
pub const DEFAULT_HIGH_WATER_MARK: usize = 1000;

const SCHEME: &str = "inproc://";

type Message = Vec<Frame>;

struct Inbox {
    messages: Mutex<VecDeque<Message>>,
    high_water_mark: usize,
    closed: AtomicBool,
}

impl Inbox {
    fn new(high_water_mark: usize) -> Arc<Self> {
        Arc::new(Inbox {
            messages: Mutex::new(VecDeque::new()),
            high_water_mark,
            closed: AtomicBool::new(false),
        })
    }

    fn push(&self, message: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut messages = self.messages.lock();
        if messages.len() >= self.high_water_mark {
            return Err(TransportError::Full);
        }
        messages.push_back(message);
        Ok(())
    }

    fn pop(&self) -> Option<Message> {
        self.messages.lock().pop_front()
    }

    fn has_messages(&self) -> bool {
        !self.messages.lock().is_empty()
    }

    fn has_room(&self) -> bool {
        !self.is_closed() && self.messages.lock().len() < self.high_water_mark
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.messages.lock().clear();
    }
}

/// Frames of the message currently being read.
#[derive(Default)]
struct Reader {
    current: VecDeque<Frame>,
}

impl Reader {
    fn next(&mut self, inbox: &Inbox) -> Option<(Frame, bool)> {
        if self.current.is_empty() {
            self.current = inbox.pop()?.into();
        }
        let frame = self.current.pop_front()?;
        Some((frame, !self.current.is_empty()))
    }

    fn has_pending(&self) -> bool {
        !self.current.is_empty()
    }
}

struct Router {
    address: String,
    inbox: Arc<Inbox>,
    peers: Mutex<HashMap<u32, Arc<Inbox>>>,
}

#[derive(Default)]
struct Registry {
    routers: HashMap<String, Arc<Router>>,
    next_identity: u32,
}

/// In-process [`SocketFactory`].
///
/// Clones share one address space; separate hubs never see each other.
#[derive(Clone)]
pub struct MemHub {
    registry: Arc<Mutex<Registry>>,
    high_water_mark: usize,
    faults: Option<Arc<FaultInjector>>,
}

impl MemHub {
    pub fn new() -> Self {
        MemHub {
            registry: Arc::new(Mutex::new(Registry::default())),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            faults: None,
        }
    }

    /// Applies to sockets created afterwards.
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark.max(1);
        self
    }

    /// Subject router-to-dealer messages to `faults`.
    pub fn with_fault_injector(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Addresses currently bound.
    pub fn bound_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.registry.lock().routers.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

impl Default for MemHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemHub")
            .field("bound", &self.bound_addresses())
            .field("high_water_mark", &self.high_water_mark)
            .field("faults", &self.faults)
            .finish()
    }
}

fn validate(address: &str) -> Result<(), TransportError> {
    match address.strip_prefix(SCHEME) {
        Some(name) if !name.is_empty() => Ok(()),
        _ => Err(TransportError::InvalidAddress(address.to_owned())),
    }
}

impl SocketFactory for MemHub {
    fn connect(&self, address: &str) -> Result<Box<dyn Socket>, TransportError> {
        validate(address)?;
        let mut registry = self.registry.lock();
        let router = registry
            .routers
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionRefused(address.to_owned()))?;

        let identity = registry.next_identity;
        registry.next_identity = identity.wrapping_add(1);

        let inbox = Inbox::new(self.high_water_mark);
        router.peers.lock().insert(identity, inbox.clone());
        tracing::trace!(address, identity, "dealer connected");

        Ok(Box::new(DealerSocket {
            identity,
            router,
            inbox,
            outgoing: Vec::new(),
            reader: Reader::default(),
        }))
    }

    fn bind(&self, address: &str) -> Result<Box<dyn Socket>, TransportError> {
        validate(address)?;
        let mut registry = self.registry.lock();
        if registry.routers.contains_key(address) {
            return Err(TransportError::AddressInUse(address.to_owned()));
        }

        let router = Arc::new(Router {
            address: address.to_owned(),
            inbox: Inbox::new(self.high_water_mark),
            peers: Mutex::new(HashMap::new()),
        });
        registry.routers.insert(address.to_owned(), router.clone());
        tracing::trace!(address, "router bound");

        Ok(Box::new(RouterSocket {
            router,
            registry: self.registry.clone(),
            faults: self.faults.clone(),
            outgoing: Vec::new(),
            reader: Reader::default(),
        }))
    }
}

struct DealerSocket {
    identity: u32,
    router: Arc<Router>,
    inbox: Arc<Inbox>,
    outgoing: Vec<Frame>,
    reader: Reader,
}

impl Socket for DealerSocket {
    fn send(&mut self, frame: Frame, more: bool) -> Result<(), TransportError> {
        self.outgoing.push(frame);
        if more {
            return Ok(());
        }
        let mut message = Vec::with_capacity(self.outgoing.len() + 1);
        message.push(Bytes::copy_from_slice(&self.identity.to_be_bytes()));
        message.append(&mut self.outgoing);
        self.router.inbox.push(message)
    }

    fn try_recv(&mut self) -> Result<Option<(Frame, bool)>, TransportError> {
        Ok(self.reader.next(&self.inbox))
    }

    fn has_incoming(&self) -> bool {
        self.reader.has_pending() || self.inbox.has_messages()
    }

    /// A closed router counts as capacity so the next send reports it.
    fn has_outgoing_capacity(&self) -> bool {
        self.router.inbox.is_closed() || self.router.inbox.has_room()
    }
}

impl Drop for DealerSocket {
    fn drop(&mut self) {
        self.router.peers.lock().remove(&self.identity);
        self.inbox.close();
    }
}

struct RouterSocket {
    router: Arc<Router>,
    registry: Arc<Mutex<Registry>>,
    faults: Option<Arc<FaultInjector>>,
    outgoing: Vec<Frame>,
    reader: Reader,
}

impl RouterSocket {
    fn deliver(&self, identity: u32, peer: &Inbox, message: Message) {
        match peer.push(message) {
            Ok(()) | Err(TransportError::Closed) => {}
            Err(err) => tracing::warn!(
                address = %self.router.address,
                identity,
                %err,
                "dropping message for peer"
            ),
        }
    }
}

impl Socket for RouterSocket {
    /// The first frame of each message names the destination peer. Messages
    /// for unknown peers are dropped, as are messages to a full peer.
    fn send(&mut self, frame: Frame, more: bool) -> Result<(), TransportError> {
        self.outgoing.push(frame);
        if more {
            return Ok(());
        }
        let mut message = std::mem::take(&mut self.outgoing);

        let identity = match <[u8; 4]>::try_from(&message[0][..]) {
            Ok(bytes) => u32::from_be_bytes(bytes),
            Err(_) => {
                tracing::debug!(address = %self.router.address, "dropping message without a peer identity");
                return Ok(());
            }
        };
        let Some(peer) = self.router.peers.lock().get(&identity).cloned() else {
            tracing::debug!(address = %self.router.address, identity, "dropping message for unknown peer");
            return Ok(());
        };
        message.remove(0);

        let action = self
            .faults
            .as_ref()
            .map_or(FaultAction::Pass, |faults| faults.check());
        match action {
            FaultAction::Pass => self.deliver(identity, &peer, message),
            FaultAction::Drop => {
                tracing::trace!(identity, "fault injector dropped a message");
            }
            FaultAction::Duplicate => {
                self.deliver(identity, &peer, message.clone());
                self.deliver(identity, &peer, message);
            }
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<(Frame, bool)>, TransportError> {
        Ok(self.reader.next(&self.router.inbox))
    }

    fn has_incoming(&self) -> bool {
        self.reader.has_pending() || self.router.inbox.has_messages()
    }

    fn has_outgoing_capacity(&self) -> bool {
        true
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.router.inbox.close();
        let mut registry = self.registry.lock();
        let ours = registry
            .routers
            .get(&self.router.address)
            .is_some_and(|bound| Arc::ptr_eq(bound, &self.router));
        if ours {
            registry.routers.remove(&self.router.address);
        }
        tracing::trace!(address = %self.router.address, "router closed");
    }
}
