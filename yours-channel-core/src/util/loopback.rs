#![allow(missing_docs)]

//! In-process counterparties, for tests and demos.

use crate::prelude::*;

use async_trait::async_trait;
use log::debug;

use crate::channel::Channel;
use crate::recipient::Recipient;
use crate::util::status::{invalid_proposal, Status};
use crate::wire::{Counterparty, RevocationMessage, WireMessage};
use crate::Arc;

/// A peer [`Channel`] in the same process.
///
/// Messages are JSON round-tripped, so the peer sees exactly what a remote party would.
#[derive(Clone)]
pub struct LoopbackChannel {
    pub peer: Arc<Mutex<Channel>>,
}

impl LoopbackChannel {
    pub fn new(peer: Arc<Mutex<Channel>>) -> Self {
        LoopbackChannel { peer }
    }

    fn peer(&self) -> Result<MutexGuard<'_, Channel>, Status> {
        self.peer.lock().map_err(|_| invalid_proposal("loopback peer lock poisoned"))
    }
}

#[async_trait]
impl Counterparty for LoopbackChannel {
    async fn countersign(&self, message: WireMessage) -> Result<WireMessage, Status> {
        let message = WireMessage::from_json(&message.to_json()?)?;
        debug!("loopback countersign {:?} {}", message.kind, message.sequence);
        let reply = self.peer()?.accept_and_countersign(message)?;
        WireMessage::from_json(&reply.to_json()?)
    }

    async fn revoke(&self, message: RevocationMessage) -> Result<(), Status> {
        let message = RevocationMessage::from_json(&message.to_json()?)?;
        debug!("loopback revoke {}", message.sequence);
        self.peer()?.receive_revocation(message)
    }
}

/// A peer [`Recipient`] in the same process
#[derive(Clone)]
pub struct LoopbackRecipient {
    pub peer: Arc<Mutex<Recipient>>,
}

impl LoopbackRecipient {
    pub fn new(peer: Arc<Mutex<Recipient>>) -> Self {
        LoopbackRecipient { peer }
    }
}

#[async_trait]
impl Counterparty for LoopbackRecipient {
    async fn countersign(&self, message: WireMessage) -> Result<WireMessage, Status> {
        let message = WireMessage::from_json(&message.to_json()?)?;
        debug!("loopback recipient countersign {:?} {}", message.kind, message.sequence);
        let reply = self
            .peer
            .lock()
            .map_err(|_| invalid_proposal("loopback peer lock poisoned"))?
            .countersign(message)?;
        WireMessage::from_json(&reply.to_json()?)
    }
}
