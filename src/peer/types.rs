use serde::{Deserialize, Serialize};

/// Session description as exchanged between peers: `{"type": "offer", "sdp": "..."}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// `a=candidate:` lines carried in the description.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        self.sdp
            .lines()
            .map(str::trim)
            .filter_map(|line| line.strip_prefix("a="))
            .filter(|line| line.starts_with("candidate:"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    Idle,
    RoleChosen,
    AwaitingLocalDescription,
    AwaitingIceGathering,
    BlobReady,
    AwaitingRemoteAnswer,
    Done,
    Established,
}

/// Health classification derived from transport signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    DegradedNoMedia,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_up(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaRequest {
    fn default() -> Self {
        Self::audio_video()
    }
}

impl MediaRequest {
    pub const fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    pub const fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub const fn none() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    /// Next capability level to try when this one cannot be acquired:
    /// video+audio, then audio-only, then nothing.
    pub fn degrade(&self) -> Option<Self> {
        if self.audio && self.video {
            Some(Self::audio_only())
        } else if !self.is_empty() {
            Some(Self::none())
        } else {
            None
        }
    }
}

/// Tracks the transport handed out for a media request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMedia {
    pub tracks: Vec<MediaKind>,
}

impl LocalMedia {
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    pub ice_restart: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_serializes_like_browsers_do() {
        let json = serde_json::to_string(&SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }

    #[test]
    fn media_degrades_video_then_audio() {
        let step = MediaRequest::audio_video().degrade().unwrap();
        assert_eq!(step, MediaRequest::audio_only());
        assert_eq!(step.degrade(), Some(MediaRequest::none()));
        assert_eq!(MediaRequest::none().degrade(), None);
    }

    #[test]
    fn candidates_are_read_from_sdp_lines() {
        let desc = SessionDescription::answer(
            "v=0\r\na=candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host\r\na=end-of-candidates\r\n",
        );
        assert_eq!(desc.candidates().count(), 1);
    }
}
