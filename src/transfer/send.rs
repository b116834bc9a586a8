use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::peer::transport::DataChannel;
use crate::transfer::messages::ControlMessage;
use crate::transfer::Progress;
use crate::utils::guess_mime_type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending,
    Completed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        Ok(Self::new(name, guess_mime_type(path), data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    pub name: String,
    pub size: u64,
    pub chunks: usize,
    pub sha256: String,
}

/// Outgoing side: `start`, paced fixed-size chunks, `complete`.
#[derive(Debug)]
pub struct FileSender {
    state: SendState,
    chunk_size: usize,
    pacing: Duration,
}

impl FileSender {
    pub fn new(chunk_size: usize, pacing: Duration) -> Self {
        Self {
            state: SendState::Idle,
            chunk_size: chunk_size.max(1),
            pacing,
        }
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub async fn send_file<F>(
        &mut self,
        channel: &dyn DataChannel,
        file: &OutgoingFile,
        mut on_progress: F,
    ) -> std::result::Result<SentFile, TransferError>
    where
        F: FnMut(Progress),
    {
        if self.state == SendState::Sending {
            return Err(TransferError::JobActive("send"));
        }
        self.state = SendState::Sending;

        match self.stream(channel, file, &mut on_progress).await {
            Ok(sent) => {
                self.state = SendState::Completed;
                info!(name = %sent.name, size = sent.size, chunks = sent.chunks, "file sent");
                Ok(sent)
            }
            Err(e) => {
                self.state = SendState::Aborted;
                warn!(name = %file.name, "file send aborted: {e}");
                Err(e)
            }
        }
    }

    async fn stream<F>(
        &self,
        channel: &dyn DataChannel,
        file: &OutgoingFile,
        on_progress: &mut F,
    ) -> std::result::Result<SentFile, TransferError>
    where
        F: FnMut(Progress),
    {
        let total = file.size();
        let start = ControlMessage::Start {
            name: file.name.clone(),
            size: total,
            mime_type: file.mime_type.clone(),
        };
        send_control(channel, &start).await?;

        let mut hasher = Sha256::new();
        let mut sent = 0u64;
        let mut chunks = 0usize;
        let mut offset = 0usize;
        while offset < file.data.len() {
            let end = (offset + self.chunk_size).min(file.data.len());
            let chunk = file.data.slice(offset..end);
            hasher.update(&chunk);
            channel
                .send_binary(chunk)
                .await
                .map_err(|e| TransferError::Channel(e.to_string()))?;

            sent += (end - offset) as u64;
            chunks += 1;
            offset = end;
            on_progress(Progress { bytes: sent, total });
            debug!(sent, total, "chunk sent");

            if offset < file.data.len() && !self.pacing.is_zero() {
                sleep(self.pacing).await;
            }
        }

        let sha256 = hex::encode(hasher.finalize());
        send_control(
            channel,
            &ControlMessage::Complete {
                sha256: Some(sha256.clone()),
            },
        )
        .await?;

        Ok(SentFile {
            name: file.name.clone(),
            size: total,
            chunks,
            sha256,
        })
    }
}

async fn send_control(
    channel: &dyn DataChannel,
    msg: &ControlMessage,
) -> std::result::Result<(), TransferError> {
    let text = msg
        .to_json()
        .map_err(|e| TransferError::Channel(e.to_string()))?;
    channel
        .send_text(text)
        .await
        .map_err(|e| TransferError::Channel(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::events::ChannelPayload;
    use crate::test_support::RecordingChannel;

    #[tokio::test(start_paused = true)]
    async fn fifty_thousand_bytes_make_four_chunks() {
        let channel = RecordingChannel::new("file");
        let file = OutgoingFile::new("blob.bin", "application/octet-stream", vec![7u8; 50_000]);
        let mut sender = FileSender::new(16_384, Duration::from_millis(10));
        let mut progress = Vec::new();

        let sent = sender
            .send_file(&channel, &file, |p| progress.push(p.bytes))
            .await
            .unwrap();

        let frames = channel.frames();
        assert_eq!(frames.len(), 6);
        match &frames[0] {
            ChannelPayload::Text(t) => assert_eq!(
                ControlMessage::parse(t).unwrap(),
                ControlMessage::Start {
                    name: "blob.bin".into(),
                    size: 50_000,
                    mime_type: "application/octet-stream".into(),
                }
            ),
            other => panic!("expected start, got {other:?}"),
        }
        let sizes: Vec<usize> = frames[1..5]
            .iter()
            .map(|f| match f {
                ChannelPayload::Binary(b) => b.len(),
                other => panic!("expected chunk, got {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![16_384, 16_384, 16_384, 568]);
        match &frames[5] {
            ChannelPayload::Text(t) => assert!(matches!(
                ControlMessage::parse(t).unwrap(),
                ControlMessage::Complete { sha256: Some(_) }
            )),
            other => panic!("expected complete, got {other:?}"),
        }

        assert_eq!(progress, vec![16_384, 32_768, 49_152, 50_000]);
        assert_eq!(sent.chunks, 4);
        assert_eq!(sender.state(), SendState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_are_paced() {
        let channel = RecordingChannel::new("file");
        let file = OutgoingFile::new("x", "", vec![0u8; 40]);
        let mut sender = FileSender::new(10, Duration::from_millis(25));
        let started = tokio::time::Instant::now();
        sender.send_file(&channel, &file, |_| {}).await.unwrap();
        // Four chunks, three pauses between them.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(75) && elapsed < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn empty_file_is_start_then_complete() {
        let channel = RecordingChannel::new("file");
        let file = OutgoingFile::new("empty", "text/plain", Vec::new());
        let mut sender = FileSender::new(16_384, Duration::ZERO);
        let sent = sender.send_file(&channel, &file, |_| {}).await.unwrap();
        assert_eq!(sent.chunks, 0);
        assert_eq!(channel.frames().len(), 2);
    }

    #[tokio::test]
    async fn channel_failure_aborts_the_job() {
        let channel = RecordingChannel::new("file");
        channel.fail_after(2);
        let file = OutgoingFile::new("x", "", vec![0u8; 100]);
        let mut sender = FileSender::new(10, Duration::ZERO);
        let err = sender.send_file(&channel, &file, |_| {}).await.unwrap_err();
        assert!(matches!(err, TransferError::Channel(_)));
        assert_eq!(sender.state(), SendState::Aborted);
    }
}
