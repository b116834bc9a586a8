//! Chat rides its own channel: one text message per line the user sends.

use tracing::debug;

use crate::error::Result;
use crate::peer::events::ChannelPayload;
use crate::peer::transport::DataChannel;

/// Sends one line. Trailing line breaks are dropped; blank lines are not sent.
pub async fn send_line(channel: &dyn DataChannel, line: &str) -> Result<bool> {
    let text = line.trim_end_matches(['\r', '\n']);
    if text.trim().is_empty() {
        return Ok(false);
    }
    channel.send_text(text.to_string()).await?;
    Ok(true)
}

/// Text frames are messages; anything else on the chat channel is dropped.
pub fn incoming(payload: ChannelPayload) -> Option<String> {
    match payload {
        ChannelPayload::Text(text) => Some(text),
        ChannelPayload::Binary(data) => {
            debug!(len = data.len(), "ignoring binary frame on chat channel");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingChannel;
    use bytes::Bytes;

    #[tokio::test]
    async fn line_breaks_are_stripped_and_blank_lines_skipped() {
        let channel = RecordingChannel::new("chat");
        assert!(send_line(&channel, "hello\r\n").await.unwrap());
        assert!(!send_line(&channel, "   \n").await.unwrap());
        assert_eq!(
            channel.frames(),
            vec![ChannelPayload::Text("hello".into())]
        );
    }

    #[test]
    fn binary_frames_are_not_chat() {
        assert_eq!(incoming(ChannelPayload::Binary(Bytes::from_static(b"x"))), None);
        assert_eq!(
            incoming(ChannelPayload::Text("hi".into())),
            Some("hi".to_string())
        );
    }
}
