use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::peer::events::ChannelPayload;
use crate::peer::transport::DataChannel;

/// Channel that records every frame instead of sending it.
pub struct RecordingChannel {
    label: String,
    frames: Mutex<Vec<ChannelPayload>>,
    fail_after: Mutex<Option<usize>>,
}

impl RecordingChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            frames: Mutex::new(Vec::new()),
            fail_after: Mutex::new(None),
        }
    }

    /// Accept `n` frames, then fail every send.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock() = Some(n);
    }

    pub fn frames(&self) -> Vec<ChannelPayload> {
        self.frames.lock().clone()
    }

    fn record(&self, payload: ChannelPayload) -> Result<()> {
        let mut frames = self.frames.lock();
        if let Some(limit) = *self.fail_after.lock() {
            if frames.len() >= limit {
                return Err(Error::ChannelNotOpen(self.label.clone()));
            }
        }
        frames.push(payload);
        Ok(())
    }
}

#[async_trait]
impl DataChannel for RecordingChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.record(ChannelPayload::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.record(ChannelPayload::Binary(data))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
