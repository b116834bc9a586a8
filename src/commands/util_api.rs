use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufRead, Lines};
use tracing::warn;

use crate::error::{Error, Result};
use crate::peer::codec::BlobCodec;
use crate::peer::events::SessionEvent;
use crate::peer::types::ConnectionState;
use crate::session::CallStatus;
use crate::transfer::Direction;

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Chat(String),
    File(PathBuf),
    Status,
    Recheck,
    Quit,
    Help,
    Empty,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Chat(line.to_string());
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match name {
        "file" if !arg.is_empty() => Input::File(PathBuf::from(arg)),
        "status" => Input::Status,
        "recheck" => Input::Recheck,
        "quit" | "exit" => Input::Quit,
        "help" => Input::Help,
        // "//text" sends a line starting with a slash
        _ if command.starts_with('/') => Input::Chat(command.to_string()),
        _ => Input::Unknown(name.to_string()),
    }
}

pub const HELP: &str = "\
/file PATH   send a file
/status      show connection health
/recheck     re-evaluate connection health
/quit        hang up
anything else is sent as a chat message";

/// Reads one pasted blob. Chat clients and terminals wrap long blobs, so
/// lines are joined until the text decodes or a blank line ends the paste.
/// Leading blank lines are skipped.
pub async fn read_blob<R>(lines: &mut Lines<R>, codec: &BlobCodec) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut pasted = String::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            if pasted.is_empty() {
                continue;
            }
            return Ok(pasted);
        }
        if !pasted.is_empty() {
            pasted.push('\n');
        }
        pasted.push_str(line);
        if codec.decode(&pasted).is_ok() {
            return Ok(pasted);
        }
    }
    if pasted.is_empty() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "input closed before a blob was pasted",
        )));
    }
    Ok(pasted)
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Idle => "idle",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::DegradedNoMedia => "connected (no media yet)",
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Failed => "failed",
    }
}

/// Terminal line for an event; `None` for events not worth printing.
pub fn describe(event: &SessionEvent) -> Option<String> {
    let text = match event {
        SessionEvent::Status(state) => format!("* status: {}", state_label(*state)),
        SessionEvent::MediaDegraded {
            granted, reason, ..
        } => {
            let now = match (granted.audio, granted.video) {
                (true, true) => "audio and video",
                (true, false) => "audio only",
                (false, true) => "video only",
                (false, false) => "no media",
            };
            format!("! media unavailable ({reason}), continuing with {now}")
        }
        SessionEvent::ChannelOpened(label) => format!("* {label} channel open"),
        SessionEvent::ChannelClosed(label) => format!("* {label} channel closed"),
        SessionEvent::ChatMessage(text) => format!("[{}] peer: {text}", timestamp()),
        SessionEvent::TransferProgress {
            direction,
            bytes,
            total,
        } => {
            // Only the edges; per-chunk lines would flood the terminal.
            if *bytes != 0 && bytes != total {
                return None;
            }
            let verb = match direction {
                Direction::Send => "sending",
                Direction::Receive => "receiving",
            };
            format!("* {verb}: {bytes}/{total} bytes")
        }
        SessionEvent::FileSent { name, size } => format!("* sent {name} ({size} bytes)"),
        SessionEvent::FileReceived(file) => {
            format!("* received {} ({} bytes, {})", file.name, file.size(), file.mime_type)
        }
        SessionEvent::TransferFailed { direction, reason } => {
            format!("! {direction} failed: {reason}")
        }
        SessionEvent::ReconnectStarted => "* connection lost, restarting ICE".to_string(),
        SessionEvent::RestartIssued => "* ICE restart issued".to_string(),
        SessionEvent::ReconnectFailed(reason) => format!("! reconnection failed: {reason}"),
        SessionEvent::Notice(text) => format!("! {text}"),
    };
    Some(text)
}

pub fn describe_status(status: &CallStatus) -> String {
    format!(
        "role={:?} phase={:?} state={} tracks={}/{} chat={} file={} sending={:?} receiving={} reconnecting={}",
        status.role,
        status.phase,
        state_label(status.state),
        status.local_tracks,
        status.remote_tracks,
        if status.chat_open { "open" } else { "closed" },
        if status.file_open { "open" } else { "closed" },
        status.sending,
        status
            .receiving
            .map(|p| format!("{:.0}%", p.fraction() * 100.0))
            .unwrap_or_else(|| "-".into()),
        status.reconnecting,
    )
}

/// Stores a received file, reporting where it went.
pub async fn store_download(dir: &Path, event: &SessionEvent) -> Option<PathBuf> {
    let SessionEvent::FileReceived(file) = event else {
        return None;
    };
    match file.save_to(dir).await {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(name = %file.name, "could not save download: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{SdpType, SessionDescription};
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn slash_commands_are_recognised() {
        assert_eq!(parse_input("/file ./a b.txt"), Input::File("./a b.txt".into()));
        assert_eq!(parse_input("/status"), Input::Status);
        assert_eq!(parse_input("/quit\n"), Input::Quit);
        assert_eq!(parse_input("/file"), Input::Unknown("file".into()));
        assert_eq!(parse_input("/nope x"), Input::Unknown("nope".into()));
    }

    #[test]
    fn plain_lines_are_chat() {
        assert_eq!(parse_input("hello there"), Input::Chat("hello there".into()));
        assert_eq!(parse_input("//not a command"), Input::Chat("/not a command".into()));
        assert_eq!(parse_input("   "), Input::Empty);
    }

    fn sample_blob() -> String {
        let desc = SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\na=candidate:1 1 udp 1 10.0.0.1 5000 typ host\r\n"
                .repeat(8),
        };
        BlobCodec::default().encode(&desc).unwrap().into_string()
    }

    fn wrap(text: &str, width: usize) -> String {
        text.as_bytes()
            .chunks(width)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn blob_reader_skips_leading_blank_lines() {
        let blob = sample_blob();
        let input = format!("\n  \n{blob}  \nnext\n");
        let mut lines = BufReader::new(input.as_bytes()).lines();
        assert_eq!(read_blob(&mut lines, &BlobCodec::default()).await.unwrap(), blob);
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn blob_reader_joins_wrapped_lines() {
        let blob = sample_blob();
        let input = format!("{}\nhello\n", wrap(&blob, 76));
        let mut lines = BufReader::new(input.as_bytes()).lines();
        let pasted = read_blob(&mut lines, &BlobCodec::default()).await.unwrap();
        assert!(pasted.lines().count() > 1);
        assert!(BlobCodec::default().decode(&pasted).is_ok());
        // The paste stops where the blob does.
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn blank_line_ends_an_undecodable_paste() {
        let input: &[u8] = b"H4sIgarbage\nmore\n\nafter\n";
        let mut lines = BufReader::new(input).lines();
        let pasted = read_blob(&mut lines, &BlobCodec::default()).await.unwrap();
        assert_eq!(pasted, "H4sIgarbage\nmore");
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn blob_reader_reports_eof() {
        let input: &[u8] = b"\n";
        let mut lines = BufReader::new(input).lines();
        assert!(matches!(
            read_blob(&mut lines, &BlobCodec::default()).await,
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn progress_is_printed_only_at_the_edges() {
        let mid = SessionEvent::TransferProgress {
            direction: Direction::Send,
            bytes: 10,
            total: 20,
        };
        let end = SessionEvent::TransferProgress {
            direction: Direction::Send,
            bytes: 20,
            total: 20,
        };
        assert_eq!(describe(&mid), None);
        assert!(describe(&end).unwrap().contains("20/20"));
    }
}
