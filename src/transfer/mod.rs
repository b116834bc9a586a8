//! Chunked file transfer over the ordered "file" channel.
//!
//! Each direction runs its own state machine and carries at most one job.
//! Text frames are control messages, binary frames are chunk data; the
//! protocol relies on the channel's ordering for `start`, chunks, `complete`.

pub mod messages;
pub mod receive;
pub mod send;

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;

pub use messages::ControlMessage;
pub use receive::{FileReceiver, ReceiveEvent, ReceiveState};
pub use send::{FileSender, OutgoingFile, SendState, SentFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes: u64,
    pub total: u64,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.bytes as f64 / self.total as f64
        }
    }
}

/// A completed incoming file, ready to be offered for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl ReceivedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Writes into `dir` under the sender's file name, stripped of any path.
    pub async fn save_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let file_name = Path::new(&self.name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "download".into());
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}
