//! In-process transport: two endpoints on a [`LoopbackNetwork`] link once
//! each holds the other's description, then behave like a connected pair
//! with ordered channels. Used for demos and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::peer::events::{ChannelPayload, EventBus, Subscription, TransportEvent};
use crate::peer::transport::{DataChannel, Transport};
use crate::peer::types::{
    IceConnectionState, IceGatheringState, LocalMedia, MediaKind, MediaRequest, OfferOptions,
    PeerConnectionState, SdpType, SessionDescription,
};
use crate::utils::random_id;

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Capture devices this endpoint pretends to have.
    pub available_media: MediaRequest,
    /// Delay before gathering reports complete; zero completes inline.
    pub gathering_delay: Duration,
    /// Never report gathering complete.
    pub stall_gathering: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            available_media: MediaRequest::audio_video(),
            gathering_delay: Duration::ZERO,
            stall_gathering: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<HashMap<String, Weak<Shared>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, options: LoopbackOptions) -> Arc<LoopbackTransport> {
        let id = random_id();
        let shared = Arc::new(Shared {
            id: id.clone(),
            options,
            network: self.clone(),
            bus: EventBus::new(),
            state: Mutex::new(EndpointState::default()),
            offers: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        });
        self.endpoints.lock().insert(id, Arc::downgrade(&shared));
        Arc::new(LoopbackTransport { shared })
    }

    fn lookup(&self, id: &str) -> Option<Arc<Shared>> {
        self.endpoints.lock().get(id).and_then(Weak::upgrade)
    }
}

struct Shared {
    id: String,
    options: LoopbackOptions,
    network: LoopbackNetwork,
    bus: EventBus<TransportEvent>,
    state: Mutex<EndpointState>,
    offers: AtomicUsize,
    restarts: AtomicUsize,
}

#[derive(Default)]
struct EndpointState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    ufrag: String,
    gathering: Option<IceGatheringState>,
    channels: Vec<String>,
    remote_channels: Vec<String>,
    tracks: Vec<MediaKind>,
    peer: Option<Weak<Shared>>,
    link_down: bool,
    closed: bool,
}

pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn offers_created(&self) -> usize {
        self.shared.offers.load(Ordering::SeqCst)
    }

    pub fn ice_restarts(&self) -> usize {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    pub fn is_linked(&self) -> bool {
        self.shared.state.lock().peer.is_some()
    }

    /// Publishes an ICE state as if the network had changed underneath.
    pub fn inject_ice_state(&self, state: IceConnectionState) {
        self.shared
            .bus
            .publish(TransportEvent::IceConnectionState(state));
    }

    /// Cuts the link: both sides see `disconnected` and sends fail.
    pub fn drop_link(&self) {
        self.set_link(false);
    }

    pub fn restore_link(&self) {
        self.set_link(true);
    }

    fn set_link(&self, up: bool) {
        let Some(peer) = self.shared.peer() else {
            return;
        };
        let state = if up {
            IceConnectionState::Connected
        } else {
            IceConnectionState::Disconnected
        };
        for side in [&self.shared, &peer] {
            side.state.lock().link_down = !up;
            side.bus.publish(TransportEvent::IceConnectionState(state));
        }
    }
}

impl Shared {
    fn peer(&self) -> Option<Arc<Shared>> {
        self.state.lock().peer.as_ref().and_then(Weak::upgrade)
    }

    fn render_sdp(&self, sdp_type: SdpType) -> String {
        let st = self.state.lock();
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\na=loopback:{}\r\na=ice-ufrag:{}\r\n",
            self.id, self.id, st.ufrag
        );
        sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        for label in &st.channels {
            sdp.push_str(&format!("a=loopback-channel:{label}\r\n"));
        }
        for kind in &st.tracks {
            sdp.push_str(&format!("a=loopback-track:{kind:?}\r\n"));
        }
        if sdp_type == SdpType::Answer {
            sdp.push_str("a=setup:active\r\n");
        } else {
            sdp.push_str("a=setup:actpass\r\n");
        }
        sdp
    }

    fn complete_gathering(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.gathering = Some(IceGatheringState::Complete);
            if let Some(local) = st.local.as_mut() {
                if local.candidates().next().is_none() {
                    local.sdp.push_str(
                        "a=candidate:1 1 udp 2130706431 127.0.0.1 9 typ host\r\na=end-of-candidates\r\n",
                    );
                }
            }
        }
        self.bus
            .publish(TransportEvent::IceGatheringState(IceGatheringState::Complete));
    }

    /// Links the two endpoints once descriptions have crossed both ways.
    fn try_link(self: &Arc<Self>) {
        let remote_id = {
            let st = self.state.lock();
            if st.peer.is_some() || st.local.is_none() {
                return;
            }
            match st.remote.as_ref().and_then(|d| endpoint_id(&d.sdp)) {
                Some(id) => id.to_string(),
                None => return,
            }
        };
        let Some(peer) = self.network.lookup(&remote_id) else {
            return;
        };
        let peer_ready = {
            let st = peer.state.lock();
            st.local.is_some()
                && st.peer.is_none()
                && st.remote.as_ref().and_then(|d| endpoint_id(&d.sdp)) == Some(self.id.as_str())
        };
        if !peer_ready {
            return;
        }

        info!(local = %self.id, remote = %peer.id, "loopback pair linked");
        self.state.lock().peer = Some(Arc::downgrade(&peer));
        peer.state.lock().peer = Some(Arc::downgrade(self));

        for side in [self, &peer] {
            side.bus
                .publish(TransportEvent::ConnectionState(PeerConnectionState::Connecting));
            side.bus
                .publish(TransportEvent::IceConnectionState(IceConnectionState::Checking));
        }
        for side in [self, &peer] {
            side.bus
                .publish(TransportEvent::IceConnectionState(IceConnectionState::Connected));
            side.bus
                .publish(TransportEvent::ConnectionState(PeerConnectionState::Connected));
        }

        for (from, to) in [(self, &peer), (&peer, self)] {
            let (channels, tracks) = {
                let st = from.state.lock();
                (st.channels.clone(), st.tracks.clone())
            };
            for label in channels {
                let mirror: Arc<dyn DataChannel> = Arc::new(LoopbackChannel {
                    label: label.clone(),
                    owner: Arc::downgrade(to),
                });
                to.state.lock().remote_channels.push(label.clone());
                to.bus.publish(TransportEvent::IncomingChannel(mirror));
                to.bus.publish(TransportEvent::ChannelOpen {
                    label: label.clone(),
                });
                from.bus.publish(TransportEvent::ChannelOpen { label });
            }
            for kind in tracks {
                to.bus.publish(TransportEvent::TrackAdded { kind });
            }
        }
    }
}

fn endpoint_id(sdp: &str) -> Option<&str> {
    sdp.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("a=loopback:"))
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return Err(Error::Transport("transport closed".into()));
            }
            if st.ufrag.is_empty() || options.ice_restart {
                st.ufrag = random_id();
            }
        }
        self.shared.offers.fetch_add(1, Ordering::SeqCst);
        if options.ice_restart {
            self.shared.restarts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(
            self.shared.render_sdp(SdpType::Offer),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        {
            let mut st = self.shared.state.lock();
            match st.remote.as_ref() {
                Some(remote) if remote.sdp_type == SdpType::Offer => {}
                _ => {
                    return Err(Error::Negotiation(
                        "cannot answer without a remote offer".into(),
                    ))
                }
            }
            if st.ufrag.is_empty() {
                st.ufrag = random_id();
            }
        }
        Ok(SessionDescription::answer(
            self.shared.render_sdp(SdpType::Answer),
        ))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let restart = {
            let mut st = self.shared.state.lock();
            if st.closed {
                return Err(Error::Transport("transport closed".into()));
            }
            let restart = st.local.is_some() && st.peer.is_some();
            st.local = Some(desc);
            st.gathering = Some(IceGatheringState::Gathering);
            restart
        };
        self.shared
            .bus
            .publish(TransportEvent::IceGatheringState(IceGatheringState::Gathering));

        let opts = &self.shared.options;
        if !opts.stall_gathering {
            if opts.gathering_delay.is_zero() {
                self.shared.complete_gathering();
            } else {
                let shared = Arc::clone(&self.shared);
                let delay = opts.gathering_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.complete_gathering();
                });
            }
        }

        if restart {
            let link_down = self.shared.state.lock().link_down;
            debug!(link_down, "loopback ICE restart");
            if !link_down {
                self.shared
                    .bus
                    .publish(TransportEvent::IceConnectionState(IceConnectionState::Checking));
                self.shared
                    .bus
                    .publish(TransportEvent::IceConnectionState(IceConnectionState::Connected));
            }
        } else {
            self.shared.try_link();
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if endpoint_id(&desc.sdp).is_none() {
            return Err(Error::Negotiation(
                "remote description is not a loopback description".into(),
            ));
        }
        {
            let mut st = self.shared.state.lock();
            let expecting_answer = matches!(&st.local, Some(l) if l.sdp_type == SdpType::Offer);
            if expecting_answer && desc.sdp_type != SdpType::Answer {
                return Err(Error::Negotiation(format!(
                    "expected an answer, got {:?}",
                    desc.sdp_type
                )));
            }
            st.remote = Some(desc);
        }
        self.shared.try_link();
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.shared.state.lock().local.clone()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.shared
            .state
            .lock()
            .gathering
            .unwrap_or(IceGatheringState::New)
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.shared.state.lock().channels.push(label.to_string());
        Ok(Arc::new(LoopbackChannel {
            label: label.to_string(),
            owner: Arc::downgrade(&self.shared),
        }))
    }

    async fn acquire_media(&self, request: MediaRequest) -> Result<LocalMedia> {
        let available = self.shared.options.available_media;
        if request.video && !available.video {
            return Err(Error::MediaAcquisition("no camera available".into()));
        }
        if request.audio && !available.audio {
            return Err(Error::MediaAcquisition("no microphone available".into()));
        }
        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(MediaKind::Audio);
        }
        if request.video {
            tracks.push(MediaKind::Video);
        }
        self.shared.state.lock().tracks = tracks.clone();
        Ok(LocalMedia { tracks })
    }

    fn subscribe(&self) -> Subscription<TransportEvent> {
        self.shared.bus.subscribe()
    }

    async fn close(&self) -> Result<()> {
        let (peer, channels) = {
            let mut st = self.shared.state.lock();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            st.tracks.clear();
            let peer = st.peer.take().and_then(|w| w.upgrade());
            let mut channels = st.channels.clone();
            channels.extend(st.remote_channels.iter().cloned());
            (peer, channels)
        };
        self.shared
            .bus
            .publish(TransportEvent::IceConnectionState(IceConnectionState::Closed));
        self.shared
            .bus
            .publish(TransportEvent::ConnectionState(PeerConnectionState::Closed));

        if let Some(peer) = peer {
            peer.state.lock().peer = None;
            for label in channels {
                peer.bus.publish(TransportEvent::ChannelClosed { label });
            }
            peer.bus
                .publish(TransportEvent::IceConnectionState(IceConnectionState::Disconnected));
        }
        Ok(())
    }
}

pub struct LoopbackChannel {
    label: String,
    owner: Weak<Shared>,
}

impl LoopbackChannel {
    fn deliver(&self, payload: ChannelPayload) -> Result<()> {
        let owner = self
            .owner
            .upgrade()
            .ok_or_else(|| Error::ChannelNotOpen(self.label.clone()))?;
        let usable = {
            let st = owner.state.lock();
            !st.closed && !st.link_down
        };
        match owner.peer() {
            Some(peer) if usable => {
                peer.bus.publish(TransportEvent::ChannelMessage {
                    label: self.label.clone(),
                    payload,
                });
                Ok(())
            }
            _ => Err(Error::ChannelNotOpen(self.label.clone())),
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.deliver(ChannelPayload::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.deliver(ChannelPayload::Binary(data))
    }

    async fn close(&self) -> Result<()> {
        if let Some(peer) = self.owner.upgrade().and_then(|o| o.peer()) {
            peer.bus.publish(TransportEvent::ChannelClosed {
                label: self.label.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn negotiate(host: &LoopbackTransport, guest: &LoopbackTransport) {
        let offer = host.create_offer(OfferOptions::default()).await.unwrap();
        host.set_local_description(offer.clone()).await.unwrap();
        guest.set_remote_description(offer).await.unwrap();
        let answer = guest.create_answer().await.unwrap();
        guest.set_local_description(answer.clone()).await.unwrap();
        host.set_remote_description(answer).await.unwrap();
    }

    #[tokio::test]
    async fn pair_links_after_full_exchange() {
        let net = LoopbackNetwork::new();
        let host = net.endpoint(LoopbackOptions::default());
        let guest = net.endpoint(LoopbackOptions::default());
        host.create_data_channel("chat").await.unwrap();
        let mut guest_events = guest.subscribe();

        negotiate(&host, &guest).await;
        assert!(host.is_linked() && guest.is_linked());

        let mut saw_incoming = false;
        while let Some(event) = guest_events.try_recv() {
            if let TransportEvent::IncomingChannel(ch) = event {
                assert_eq!(ch.label(), "chat");
                saw_incoming = true;
            }
        }
        assert!(saw_incoming);
    }

    #[tokio::test]
    async fn channel_messages_arrive_in_order() {
        let net = LoopbackNetwork::new();
        let host = net.endpoint(LoopbackOptions::default());
        let guest = net.endpoint(LoopbackOptions::default());
        let chat = host.create_data_channel("chat").await.unwrap();
        negotiate(&host, &guest).await;
        let mut guest_events = guest.subscribe();

        chat.send_text("one".into()).await.unwrap();
        chat.send_binary(Bytes::from_static(b"two")).await.unwrap();

        let mut got = Vec::new();
        while let Some(event) = guest_events.try_recv() {
            if let TransportEvent::ChannelMessage { payload, .. } = event {
                got.push(payload);
            }
        }
        assert_eq!(
            got,
            vec![
                ChannelPayload::Text("one".into()),
                ChannelPayload::Binary(Bytes::from_static(b"two")),
            ]
        );
    }

    #[tokio::test]
    async fn sends_fail_before_link() {
        let net = LoopbackNetwork::new();
        let host = net.endpoint(LoopbackOptions::default());
        let chat = host.create_data_channel("chat").await.unwrap();
        assert!(matches!(
            chat.send_text("hi".into()).await,
            Err(Error::ChannelNotOpen(_))
        ));
    }

    #[tokio::test]
    async fn missing_camera_is_a_media_error() {
        let net = LoopbackNetwork::new();
        let peer = net.endpoint(LoopbackOptions {
            available_media: MediaRequest::audio_only(),
            ..Default::default()
        });
        let err = peer
            .acquire_media(MediaRequest::audio_video())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaAcquisition(_)));
        let media = peer.acquire_media(MediaRequest::audio_only()).await.unwrap();
        assert_eq!(media.tracks, vec![MediaKind::Audio]);
    }

    #[tokio::test]
    async fn offer_where_answer_expected_is_rejected() {
        let net = LoopbackNetwork::new();
        let a = net.endpoint(LoopbackOptions::default());
        let b = net.endpoint(LoopbackOptions::default());
        let offer_a = a.create_offer(OfferOptions::default()).await.unwrap();
        a.set_local_description(offer_a).await.unwrap();
        let offer_b = b.create_offer(OfferOptions::default()).await.unwrap();
        assert!(a.set_remote_description(offer_b).await.is_err());
    }
}
