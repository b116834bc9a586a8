use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::peer::transport::DataChannel;
use crate::peer::types::{
    ConnectionState, IceConnectionState, IceGatheringState, MediaKind, MediaRequest,
    PeerConnectionState,
};
use crate::transfer::{Direction, ReceivedFile};

/// Fan-out event stream. Every subscriber sees every event published after
/// it subscribed; dropping a [`Subscription`] unregisters it.
pub struct EventBus<T> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Subscription { rx }
    }

    pub fn publish(&self, event: T) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    /// Control or chat text.
    Text(String),
    /// File chunk bytes.
    Binary(Bytes),
}

impl ChannelPayload {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Signals raised by the transport collaborator.
#[derive(Clone)]
pub enum TransportEvent {
    IceGatheringState(IceGatheringState),
    IceConnectionState(IceConnectionState),
    ConnectionState(PeerConnectionState),
    TrackAdded { kind: MediaKind },
    /// A channel created by the remote peer.
    IncomingChannel(Arc<dyn DataChannel>),
    ChannelOpen { label: String },
    ChannelClosed { label: String },
    ChannelError { label: String, reason: String },
    ChannelMessage { label: String, payload: ChannelPayload },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceGatheringState(s) => write!(f, "IceGatheringState({s:?})"),
            Self::IceConnectionState(s) => write!(f, "IceConnectionState({s:?})"),
            Self::ConnectionState(s) => write!(f, "ConnectionState({s:?})"),
            Self::TrackAdded { kind } => write!(f, "TrackAdded({kind:?})"),
            Self::IncomingChannel(ch) => write!(f, "IncomingChannel({})", ch.label()),
            Self::ChannelOpen { label } => write!(f, "ChannelOpen({label})"),
            Self::ChannelClosed { label } => write!(f, "ChannelClosed({label})"),
            Self::ChannelError { label, reason } => write!(f, "ChannelError({label}: {reason})"),
            Self::ChannelMessage { label, payload } => {
                write!(f, "ChannelMessage({label}, {} bytes)", payload.len())
            }
        }
    }
}

/// Notifications for whoever renders the call.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(ConnectionState),
    MediaDegraded {
        requested: MediaRequest,
        granted: MediaRequest,
        reason: String,
    },
    ChannelOpened(String),
    ChannelClosed(String),
    ChatMessage(String),
    TransferProgress {
        direction: Direction,
        bytes: u64,
        total: u64,
    },
    FileSent {
        name: String,
        size: u64,
    },
    FileReceived(ReceivedFile),
    TransferFailed {
        direction: Direction,
        reason: String,
    },
    ReconnectStarted,
    /// A restart offer was produced locally. The peer has not been reached yet.
    RestartIssued,
    ReconnectFailed(String),
    Notice(String),
}

pub type EventSink = EventBus<SessionEvent>;

impl EventBus<SessionEvent> {
    pub fn emit(&self, event: SessionEvent) {
        trace!(?event, "session event");
        self.publish(event);
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Notice(message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_published_events() {
        let bus = EventBus::<u32>::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(7);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = EventBus::<u32>::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(1);
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::<u32>::new();
        bus.publish(1);
        let mut late = bus.subscribe();
        assert_eq!(late.try_recv(), None);
    }
}
