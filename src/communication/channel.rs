use dashmap::DashMap;
use log::{debug, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::communication::messages::{Destination, Envelope};
use crate::error::ProtocolError;
use crate::global_variables::{ADDR_PREFIX_CONTROLLER, ADDR_PREFIX_VEHICLE, TOPIC_PREFIX_PHASE};
use crate::models::intersection::IntersectionId;
use crate::models::vehicle::VehicleId;

/// Addressable identity of an agent on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Address(name.into())
    }

    pub fn controller(id: &IntersectionId) -> Self {
        Address(format!("{ADDR_PREFIX_CONTROLLER}{id}"))
    }

    pub fn vehicle(id: VehicleId) -> Self {
        Address(format!("{ADDR_PREFIX_VEHICLE}{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Topic carrying an intersection's phase broadcasts.
pub fn phase_topic(id: &IntersectionId) -> String {
    format!("{TOPIC_PREFIX_PHASE}{id}")
}

#[derive(Default)]
struct Router {
    mailboxes: DashMap<Address, UnboundedSender<Envelope>>,
    topics: DashMap<String, Vec<Address>>,
    closed: AtomicBool,
}

/// In-process message channel with point-to-point and topic delivery.
///
/// Every receiver owns one unbounded FIFO queue, so messages from one sender
/// to one receiver arrive in send order. Nothing is dropped while the
/// receiver is registered.
///
/// Routing tables are sharded maps. A send clones the receiver's sender
/// handle out of its shard and delivers without holding any map lock, so
/// agents on different addresses never wait on each other.
#[derive(Clone, Default)]
pub struct MessageBus {
    router: Arc<Router>,
}

/// Receiving end of a registered address.
pub struct Mailbox {
    address: Address,
    receiver: UnboundedReceiver<Envelope>,
}

impl Mailbox {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Waits for the next envelope. `None` once the address is deregistered.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Takes everything queued right now without waiting.
    /// Returns `None` if the address was deregistered and the queue is empty.
    pub fn drain(&mut self) -> Option<Vec<Envelope>> {
        let mut out = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => out.push(envelope),
                Err(TryRecvError::Empty) => return Some(out),
                Err(TryRecvError::Disconnected) => {
                    return if out.is_empty() { None } else { Some(out) };
                }
            }
        }
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, address: &Address) -> Option<UnboundedSender<Envelope>> {
        self.router.mailboxes.get(address).map(|tx| tx.value().clone())
    }

    /// Binds `address` to a fresh mailbox, replacing any previous binding.
    pub fn register(&self, address: Address) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.router.mailboxes.insert(address.clone(), tx);
        debug!("Registered {}", address);
        Mailbox {
            address,
            receiver: rx,
        }
    }

    /// Removes the binding and all its subscriptions. The mailbox sees end of stream.
    pub fn deregister(&self, address: &Address) {
        self.router.mailboxes.remove(address);
        for mut subscribers in self.router.topics.iter_mut() {
            subscribers.retain(|a| a != address);
        }
    }

    /// Drops every binding; all mailboxes drain and then see end of stream.
    pub fn close(&self) {
        self.router.closed.store(true, Ordering::SeqCst);
        self.router.mailboxes.clear();
        self.router.topics.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.router.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, address: &Address, topic: &str) {
        let mut subscribers = self.router.topics.entry(topic.to_string()).or_default();
        if !subscribers.contains(address) {
            subscribers.push(address.clone());
        }
    }

    pub fn unsubscribe(&self, address: &Address, topic: &str) {
        if let Some(mut subscribers) = self.router.topics.get_mut(topic) {
            subscribers.retain(|a| a != address);
        }
    }

    pub fn is_registered(&self, address: &Address) -> bool {
        self.router.mailboxes.contains_key(address)
    }

    /// Forgets a mailbox whose receiver is gone. A binding registered again
    /// in the meantime is left alone.
    fn forget_dead(&self, address: &Address) {
        self.router
            .mailboxes
            .remove_if(address, |_, tx| tx.is_closed());
    }

    /// Delivers an envelope. Returns how many mailboxes received it.
    pub fn send(&self, envelope: Envelope) -> Result<usize, ProtocolError> {
        match envelope.to.clone() {
            Destination::Direct(to) => {
                let Some(tx) = self.sender(&to) else {
                    return Err(ProtocolError::UnknownRecipient(to.to_string()));
                };
                if tx.send(envelope).is_ok() {
                    Ok(1)
                } else {
                    self.forget_dead(&to);
                    Err(ProtocolError::UnknownRecipient(to.to_string()))
                }
            }
            Destination::Topic(topic) => {
                let subscribers = self
                    .router
                    .topics
                    .get(&topic)
                    .map(|s| s.value().clone())
                    .unwrap_or_default();
                let mut delivered = 0;
                for address in subscribers {
                    let ok = self
                        .sender(&address)
                        .map(|tx| tx.send(envelope.clone()).is_ok())
                        .unwrap_or(false);
                    if ok {
                        delivered += 1;
                    } else {
                        warn!("Dropping dead subscriber {} from topic {}", address, topic);
                        self.forget_dead(&address);
                        if let Some(mut list) = self.router.topics.get_mut(&topic) {
                            list.retain(|a| a != &address);
                        }
                    }
                }
                Ok(delivered)
            }
        }
    }

    /// Decodes raw bytes at the boundary and delivers them.
    pub fn deliver_wire(&self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        let envelope = Envelope::decode(bytes)?;
        self.send(envelope)
    }
}
