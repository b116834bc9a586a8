use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_MAX_FILE_BYTES;
use crate::error::TransferError;
use crate::peer::events::ChannelPayload;
use crate::transfer::messages::ControlMessage;
use crate::transfer::{Progress, ReceivedFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Idle,
    Receiving,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    Started { name: String, size: u64 },
    Progress(Progress),
    Completed(ReceivedFile),
    /// The active job was dropped.
    Failed(TransferError),
    /// A frame was refused; the active job (if any) is untouched.
    Rejected(TransferError),
}

#[derive(Debug)]
struct ReceiveJob {
    name: String,
    size: u64,
    mime_type: String,
    received: u64,
    chunks: Vec<Bytes>,
}

/// Incoming side of the file channel.
#[derive(Debug)]
pub struct FileReceiver {
    job: Option<ReceiveJob>,
    max_file_bytes: u64,
}

impl Default for FileReceiver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_BYTES)
    }
}

impl FileReceiver {
    /// `max_file_bytes` bounds the size a `start` may announce.
    pub fn new(max_file_bytes: u64) -> Self {
        Self {
            job: None,
            max_file_bytes,
        }
    }

    pub fn state(&self) -> ReceiveState {
        if self.job.is_some() {
            ReceiveState::Receiving
        } else {
            ReceiveState::Idle
        }
    }

    pub fn progress(&self) -> Option<Progress> {
        self.job.as_ref().map(|job| Progress {
            bytes: job.received,
            total: job.size,
        })
    }

    /// Drops the active job, e.g. when the channel closes mid-transfer.
    /// Returns the abandoned file's name.
    pub fn abort(&mut self) -> Option<String> {
        let job = self.job.take()?;
        warn!(name = %job.name, received = job.received, size = job.size, "receive job abandoned");
        Some(job.name)
    }

    /// Feeds one frame from the file channel.
    pub fn handle(&mut self, payload: ChannelPayload) -> Option<ReceiveEvent> {
        match payload {
            ChannelPayload::Text(text) => match ControlMessage::parse(&text) {
                Ok(msg) => self.on_control(msg),
                Err(e) => {
                    warn!("ignoring malformed control message: {e}");
                    None
                }
            },
            ChannelPayload::Binary(chunk) => self.on_chunk(chunk),
        }
    }

    fn on_control(&mut self, msg: ControlMessage) -> Option<ReceiveEvent> {
        match msg {
            ControlMessage::Start {
                name,
                size,
                mime_type,
            } => {
                if let Some(active) = &self.job {
                    warn!(active = %active.name, incoming = %name, "rejecting start while a job is active");
                    return Some(ReceiveEvent::Rejected(TransferError::JobActive("receive")));
                }
                if size > self.max_file_bytes {
                    warn!(%name, size, limit = self.max_file_bytes, "rejecting oversized file");
                    return Some(ReceiveEvent::Rejected(TransferError::TooLarge {
                        declared: size,
                        limit: self.max_file_bytes,
                    }));
                }
                info!(%name, size, %mime_type, "incoming file");
                self.job = Some(ReceiveJob {
                    name: name.clone(),
                    size,
                    mime_type,
                    received: 0,
                    chunks: Vec::new(),
                });
                Some(ReceiveEvent::Started { name, size })
            }
            ControlMessage::Complete { sha256 } => {
                let Some(job) = self.job.take() else {
                    warn!("complete received with no active job");
                    return None;
                };
                Some(finish(job, sha256.as_deref()))
            }
        }
    }

    fn on_chunk(&mut self, chunk: Bytes) -> Option<ReceiveEvent> {
        let Some(job) = self.job.as_mut() else {
            debug!(len = chunk.len(), "ignoring chunk with no active job");
            return None;
        };
        let received = job.received + chunk.len() as u64;
        if received > job.size {
            let declared = job.size;
            warn!(name = %job.name, declared, received, "chunk overruns declared size, dropping job");
            self.job = None;
            return Some(ReceiveEvent::Failed(TransferError::Oversize {
                declared,
                received,
            }));
        }
        job.received = received;
        job.chunks.push(chunk);
        Some(ReceiveEvent::Progress(Progress {
            bytes: job.received,
            total: job.size,
        }))
    }
}

fn finish(job: ReceiveJob, expected_sha256: Option<&str>) -> ReceiveEvent {
    if job.received != job.size {
        warn!(name = %job.name, declared = job.size, received = job.received, "size mismatch");
        return ReceiveEvent::Failed(TransferError::SizeMismatch {
            declared: job.size,
            received: job.received,
        });
    }

    // Arrival order is the file order.
    let mut data = BytesMut::with_capacity(job.received as usize);
    for chunk in &job.chunks {
        data.extend_from_slice(chunk);
    }
    let data = data.freeze();

    if let Some(expected) = expected_sha256 {
        let actual = hex::encode(Sha256::digest(&data));
        if !actual.eq_ignore_ascii_case(expected) {
            warn!(name = %job.name, "digest mismatch");
            return ReceiveEvent::Failed(TransferError::DigestMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }

    info!(name = %job.name, size = job.size, "file received");
    let mime_type = if job.mime_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        job.mime_type
    };
    ReceiveEvent::Completed(ReceivedFile {
        name: job.name,
        mime_type,
        data,
    })
}
