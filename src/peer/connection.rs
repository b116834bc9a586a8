use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{SessionConfig, DEFAULT_STUN_URLS};
use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::{attach_channel, RtcChannel};
use crate::peer::events::{EventBus, Subscription, TransportEvent};
use crate::peer::transport::{DataChannel, Transport};
use crate::peer::types::{
    IceConnectionState, IceGatheringState, LocalMedia, MediaKind, MediaRequest, OfferOptions,
    PeerConnectionState, SdpType, ServerConfig, SessionDescription,
};
use crate::utils::add_ice_url_scheme;

const STREAM_ID: &str = "pastecall";

/// Opus frame encoding 20 ms of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
/// Stand-in VP8 payload; the peer only needs RTP to arrive to surface the track.
const VP8_PLACEHOLDER: [u8; 10] = [0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

/// [`Transport`] backed by a webrtc-rs peer connection.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    bus: EventBus<TransportEvent>,
    /// Capture devices this host may hand out.
    capabilities: MediaRequest,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    feeders: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    pub async fn new(config: &SessionConfig) -> Result<Arc<Self>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&config.ice_servers)).await?);
        let bus = EventBus::new();
        install_handlers(&pc, &bus);

        Ok(Arc::new(Self {
            pc,
            bus,
            capabilities: config.capabilities,
            senders: Mutex::new(Vec::new()),
            feeders: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn add_local_track(&self, kind: MediaKind) -> Result<()> {
        let (mime_type, id) = match kind {
            MediaKind::Audio => (MIME_TYPE_OPUS, "audio"),
            MediaKind::Video => (MIME_TYPE_VP8, "video"),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaAcquisition(format!("{id} track: {e}")))?;

        // RTCP has to be drained for interceptors to work.
        let rtcp = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });
        self.senders.lock().push(sender);
        self.feeders
            .lock()
            .push(tokio::spawn(feed_placeholder(track, kind)));
        Ok(())
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        for feeder in self.feeders.get_mut().drain(..) {
            feeder.abort();
        }
    }
}

/// Keeps RTP flowing on a local track. webrtc-rs only reports a remote track
/// once its first packet arrives, so a silent track would never be seen.
async fn feed_placeholder(track: Arc<TrackLocalStaticSample>, kind: MediaKind) {
    let (frame, duration) = match kind {
        MediaKind::Audio => (Bytes::from_static(&OPUS_SILENCE), Duration::from_millis(20)),
        MediaKind::Video => (Bytes::from_static(&VP8_PLACEHOLDER), Duration::from_millis(100)),
    };
    let mut ticker = tokio::time::interval(duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reported = false;
    loop {
        ticker.tick().await;
        let sample = Sample {
            data: frame.clone(),
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            if !reported {
                debug!(?kind, "placeholder sample not sent: {e}");
                reported = true;
            }
        }
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, bus: &EventBus<TransportEvent>) {
    pc.on_ice_candidate(Box::new(|cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => dump_candidate("LOCAL", &c),
            None => debug!("ICE candidate gathering completed (null candidate received)"),
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new({
        let bus = bus.clone();
        move |state: RTCIceGathererState| {
            debug!("ICE gathering state changed to: {state:?}");
            let mapped = match state {
                RTCIceGathererState::New => Some(IceGatheringState::New),
                RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
                RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
                _ => None,
            };
            if let Some(state) = mapped {
                bus.publish(TransportEvent::IceGatheringState(state));
            }
            Box::pin(async {})
        }
    }));

    pc.on_ice_connection_state_change(Box::new({
        let bus = bus.clone();
        move |state: RTCIceConnectionState| {
            info!("ICE connection state changed to: {state:?}");
            if let Some(state) = map_ice_state(state) {
                bus.publish(TransportEvent::IceConnectionState(state));
            }
            Box::pin(async {})
        }
    }));

    let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new({
        let bus = bus.clone();
        move |state: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {state:?}");
            if matches!(
                state,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = weak_pc.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            if let Some(state) = map_peer_state(state) {
                bus.publish(TransportEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }
    }));

    pc.on_track(Box::new({
        let bus = bus.clone();
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                _ => None,
            };
            info!(?kind, id = %track.id(), "remote track added");
            if let Some(kind) = kind {
                bus.publish(TransportEvent::TrackAdded { kind });
            }
            // Nothing renders remote media; drain it so receive buffers stay empty.
            tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
            Box::pin(async {})
        }
    }));

    pc.on_data_channel(Box::new({
        let bus = bus.clone();
        move |dc: Arc<RTCDataChannel>| {
            info!(label = dc.label(), "remote data channel announced");
            attach_channel(&dc, &bus);
            bus.publish(TransportEvent::IncomingChannel(Arc::new(RtcChannel::new(dc))));
            Box::pin(async {})
        }
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => return None,
    })
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => return Err(Error::Negotiation(format!("unsupported sdp type {other}"))),
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Rollback => {
            return Err(Error::Negotiation("rollback is not supported".into()));
        }
    };
    parsed.map_err(|e| Error::Negotiation(e.to_string()))
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                voice_activity_detection: false,
            }))
            .await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc(desc).ok()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        match self.pc.ice_gathering_state() {
            RTCIceGatheringState::Gathering => IceGatheringState::Gathering,
            RTCIceGatheringState::Complete => IceGatheringState::Complete,
            _ => IceGatheringState::New,
        }
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        attach_channel(&dc, &self.bus);
        Ok(Arc::new(RtcChannel::new(dc)))
    }

    async fn acquire_media(&self, request: MediaRequest) -> Result<LocalMedia> {
        if request.video && !self.capabilities.video {
            return Err(Error::MediaAcquisition("no camera available".into()));
        }
        if request.audio && !self.capabilities.audio {
            return Err(Error::MediaAcquisition("no microphone available".into()));
        }

        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(MediaKind::Audio);
        }
        if request.video {
            tracks.push(MediaKind::Video);
        }
        for kind in &tracks {
            self.add_local_track(*kind).await?;
        }
        info!(?tracks, "local tracks added");
        Ok(LocalMedia { tracks })
    }

    fn subscribe(&self) -> Subscription<TransportEvent> {
        self.bus.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for feeder in self.feeders.lock().drain(..) {
            feeder.abort();
        }
        let senders: Vec<_> = self.senders.lock().drain(..).collect();
        for sender in senders {
            if let Err(e) = sender.stop().await {
                warn!("failed to stop local track: {e}");
            }
        }
        self.pc.close().await?;
        info!("peer connection closed");
        Ok(())
    }
}

/// Builds the peer-connection configuration.
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = if servers.is_empty() {
        vec![RTCIceServer {
            urls: DEFAULT_STUN_URLS.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        }]
    } else {
        user_ice_servers(servers)
    };

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
