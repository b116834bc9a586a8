pub mod codec;
pub mod connection;
pub mod data_channel;
pub mod events;
pub mod ice;
pub mod loopback;
pub mod state;
pub mod transport;
pub mod types;

pub use codec::{BlobCodec, EncodedBlob};
pub use connection::WebRtcTransport;
pub use events::{ChannelPayload, EventBus, EventSink, SessionEvent, Subscription, TransportEvent};
pub use loopback::{LoopbackNetwork, LoopbackOptions, LoopbackTransport};
pub use state::ReconnectGuard;
pub use transport::{DataChannel, Transport, CHAT_LABEL, FILE_LABEL};
pub use types::{
    ConnectionState, LocalMedia, MediaKind, MediaRequest, Role, ServerConfig, SessionDescription,
    SignalingPhase,
};
