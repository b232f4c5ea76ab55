//! Transport of [Message]s between peers.

pub mod encoding;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{messages::Message, protocols::ObjectiveId, types::Address};

pub use encoding::ConversionError;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("decode: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("encode: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("frame of {0} bytes is too large")]
    FrameTooLarge(usize),
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },
    #[error("unexpected payload type for objective {0}")]
    UnexpectedPayload(ObjectiveId),
    #[error("no route to peer {0}")]
    UnknownPeer(Address),
    #[error("inbound stream already taken")]
    InboundTaken,
    #[error("message service closed")]
    Closed,
}

/// Peer to peer messaging.
#[async_trait]
pub trait MessageService: Send + Sync {
    /// Take the stream of inbound messages. Can only be taken once.
    fn inbound(&self) -> Result<mpsc::Receiver<Message>, WireError>;

    async fn send(&self, msg: Message) -> Result<(), WireError>;

    async fn close(&self) -> Result<(), WireError>;
}

/// Routes messages between in-process nodes.
#[derive(Default)]
pub struct Broker {
    peers: Mutex<HashMap<Address, mpsc::Sender<Message>>>,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn route(&self, to: &Address) -> Option<mpsc::Sender<Message>> {
        self.peers.lock().get(to).cloned()
    }
}

/// A node's connection to a [Broker].
///
/// Outgoing messages are framed and decoded again on the way, so peers only
/// ever see what survives the wire format.
pub struct MemMessageService {
    me: Address,
    broker: Arc<Broker>,
    inbound: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl MemMessageService {
    pub fn new(broker: Arc<Broker>, me: Address, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        broker.peers.lock().insert(me, tx);
        Self {
            me,
            broker,
            inbound: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl MessageService for MemMessageService {
    fn inbound(&self) -> Result<mpsc::Receiver<Message>, WireError> {
        self.inbound.lock().take().ok_or(WireError::InboundTaken)
    }

    async fn send(&self, msg: Message) -> Result<(), WireError> {
        let to = msg.to;
        let frame = encoding::encode_frame(&msg)?;
        let delivered = encoding::decode_frame(&frame)?;

        let peer = self.broker.route(&to).ok_or(WireError::UnknownPeer(to))?;
        peer.send(delivered).await.map_err(|_| WireError::Closed)
    }

    async fn close(&self) -> Result<(), WireError> {
        self.broker.peers.lock().remove(&self.me);
        Ok(())
    }
}
