use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::peer::events::{Subscription, TransportEvent};
use crate::peer::types::{
    IceGatheringState, LocalMedia, MediaRequest, OfferOptions, SessionDescription,
};

/// Channel labels both peers agree on.
pub const CHAT_LABEL: &str = "chat";
pub const FILE_LABEL: &str = "file";

/// Peer-connection capabilities the signaling layer drives.
///
/// Implementations publish every state change and channel message on the
/// stream returned by [`Transport::subscribe`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Current local description including any candidates gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;

    fn ice_gathering_state(&self) -> IceGatheringState;

    /// Ordered, reliable channel. Must be called before the offer is created.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    async fn acquire_media(&self, request: MediaRequest) -> Result<LocalMedia>;

    fn subscribe(&self) -> Subscription<TransportEvent>;

    /// Stops local tracks and closes the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

impl fmt::Debug for dyn DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label())
            .finish()
    }
}
