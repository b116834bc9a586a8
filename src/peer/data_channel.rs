use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::error::{Error, Result};
use crate::peer::events::{ChannelPayload, EventBus, TransportEvent};
use crate::peer::transport::DataChannel;

/// [`DataChannel`] over a webrtc-rs channel.
pub struct RtcChannel {
    label: String,
    inner: Arc<RTCDataChannel>,
}

impl RtcChannel {
    pub fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self {
            label: inner.label().to_string(),
            inner,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.ready_state() == RTCDataChannelState::Open {
            Ok(())
        } else {
            Err(Error::ChannelNotOpen(self.label.clone()))
        }
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.ensure_open()?;
        self.inner.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.inner.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}

/// Wires a channel's callbacks into the transport event stream.
pub fn attach_channel(dc: &Arc<RTCDataChannel>, bus: &EventBus<TransportEvent>) {
    let label = dc.label().to_string();
    debug!(%label, "attaching data channel handlers");

    dc.on_open(Box::new({
        let bus = bus.clone();
        let label = label.clone();
        move || {
            info!(%label, "data channel opened");
            bus.publish(TransportEvent::ChannelOpen { label });
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let bus = bus.clone();
        let label = label.clone();
        move |msg: DataChannelMessage| {
            let payload = if msg.is_string {
                ChannelPayload::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelPayload::Binary(msg.data)
            };
            bus.publish(TransportEvent::ChannelMessage {
                label: label.clone(),
                payload,
            });
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let bus = bus.clone();
        let label = label.clone();
        move || {
            info!(%label, "data channel closed");
            bus.publish(TransportEvent::ChannelClosed {
                label: label.clone(),
            });
            Box::pin(async {})
        }
    }));

    dc.on_error(Box::new({
        let bus = bus.clone();
        move |err: webrtc::Error| {
            warn!(%label, "data channel error: {err}");
            bus.publish(TransportEvent::ChannelError {
                label: label.clone(),
                reason: err.to_string(),
            });
            Box::pin(async {})
        }
    }));
}
