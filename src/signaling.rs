//! Manual offer/answer exchange.
//!
//! Host: `create_call` -> share blob -> `accept_answer`.
//! Guest: `join_call(blob)` -> share the returned blob.
//! Either side then turns the session into a running [`Call`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::peer::codec::{BlobCodec, EncodedBlob};
use crate::peer::events::{EventSink, SessionEvent, Subscription, TransportEvent};
use crate::peer::ice::{analyze_candidates, wait_for_ice_gathering};
use crate::peer::transport::{Transport, CHAT_LABEL, FILE_LABEL};
use crate::peer::types::{
    LocalMedia, OfferOptions, Role, SdpType, SessionDescription, SignalingPhase,
};
use crate::session::{Call, CallHandle, SessionContext};

pub struct SignalingSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    codec: BlobCodec,
    sink: EventSink,
    ctx: SessionContext,
    // Taken up front so channel and state events raised during
    // negotiation reach the call.
    transport_events: Subscription<TransportEvent>,
}

impl SignalingSession {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig, sink: EventSink) -> Self {
        let transport_events = transport.subscribe();
        Self {
            codec: BlobCodec::from_config(&config),
            transport,
            config,
            sink,
            ctx: SessionContext::default(),
            transport_events,
        }
    }

    pub fn phase(&self) -> SignalingPhase {
        self.ctx.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.ctx.role
    }

    pub fn local_media(&self) -> &LocalMedia {
        &self.ctx.media
    }

    /// Host side: channels, media, offer, gathering, blob.
    pub async fn create_call(&mut self) -> Result<EncodedBlob> {
        self.require_phase(SignalingPhase::Idle, "idle")?;
        self.choose_role(Role::Host);

        for label in [CHAT_LABEL, FILE_LABEL] {
            let channel = self.transport.create_data_channel(label).await?;
            self.ctx.channels.bind(channel);
        }
        self.ctx.media = self.acquire_media().await;

        self.set_phase(SignalingPhase::AwaitingLocalDescription);
        let offer = self
            .transport
            .create_offer(OfferOptions::default())
            .await
            .map_err(|e| Error::Negotiation(format!("create offer: {e}")))?;
        let blob = self.publish_local(offer).await?;

        self.set_phase(SignalingPhase::AwaitingRemoteAnswer);
        Ok(blob)
    }

    /// Guest side: apply the host's offer and produce the answer blob.
    pub async fn join_call(&mut self, encoded_offer: &str) -> Result<EncodedBlob> {
        self.require_phase(SignalingPhase::Idle, "idle")?;
        let offer = self.codec.decode(encoded_offer)?;
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::Negotiation(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }
        self.choose_role(Role::Guest);

        // Tracks must exist before the answer is created.
        self.ctx.media = self.acquire_media().await;

        self.transport
            .set_remote_description(offer)
            .await
            .map_err(negotiation)?;

        self.set_phase(SignalingPhase::AwaitingLocalDescription);
        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(|e| Error::Negotiation(format!("create answer: {e}")))?;
        let blob = self.publish_local(answer).await?;

        self.set_phase(SignalingPhase::Done);
        Ok(blob)
    }

    /// Host side: completes negotiation with the guest's answer. A blob that
    /// does not decode, or is not an answer, leaves the session waiting.
    pub async fn accept_answer(&mut self, encoded_answer: &str) -> Result<()> {
        if self.ctx.role != Some(Role::Host) {
            return Err(Error::RoleMismatch {
                required: Role::Host,
                actual: self.ctx.role,
            });
        }
        self.require_phase(SignalingPhase::AwaitingRemoteAnswer, "awaiting remote answer")?;

        let answer = self
            .codec
            .decode(encoded_answer)
            .map_err(|e| Error::InvalidAnswer(e.to_string()))?;
        if answer.sdp_type != SdpType::Answer {
            return Err(Error::InvalidAnswer(format!(
                "expected an answer, got {:?}",
                answer.sdp_type
            )));
        }

        self.transport
            .set_remote_description(answer)
            .await
            .map_err(negotiation)?;
        info!("remote answer applied");
        self.set_phase(SignalingPhase::Done);
        Ok(())
    }

    /// Hands the session over to a running call once signaling is done.
    pub fn into_call(self) -> Result<CallHandle> {
        self.require_phase(SignalingPhase::Done, "done")?;
        Ok(Call::spawn(
            self.ctx,
            self.transport,
            self.transport_events,
            &self.config,
            self.sink,
        ))
    }

    /// Sets `desc` locally, waits for gathering and encodes the result.
    async fn publish_local(&mut self, desc: SessionDescription) -> Result<EncodedBlob> {
        let mut gathering = self.transport.subscribe();
        self.transport
            .set_local_description(desc)
            .await
            .map_err(negotiation)?;

        self.set_phase(SignalingPhase::AwaitingIceGathering);
        let outcome = wait_for_ice_gathering(
            self.transport.as_ref(),
            &mut gathering,
            self.config.ice_gathering_timeout(),
        )
        .await;
        debug!(?outcome, "gathering wait finished");

        let local = self
            .transport
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("no local description after gathering".into()))?;
        analyze_candidates(&local);

        let blob = self.codec.encode(&local)?;
        self.set_phase(SignalingPhase::BlobReady);
        Ok(blob)
    }

    /// Steps down video+audio -> audio-only -> nothing. Never fails; each
    /// step down is reported as a warning.
    async fn acquire_media(&self) -> LocalMedia {
        let requested = self.config.media;
        let mut attempt = requested;
        loop {
            if attempt.is_empty() {
                info!("joining without local media");
                return LocalMedia::default();
            }
            match self.transport.acquire_media(attempt).await {
                Ok(media) => {
                    info!(tracks = media.track_count(), "local media acquired");
                    return media;
                }
                Err(e) => {
                    let Some(next) = attempt.degrade() else {
                        return LocalMedia::default();
                    };
                    warn!(?attempt, ?next, "media acquisition failed: {e}");
                    self.sink.emit(SessionEvent::MediaDegraded {
                        requested,
                        granted: next,
                        reason: e.to_string(),
                    });
                    attempt = next;
                }
            }
        }
    }

    fn choose_role(&mut self, role: Role) {
        info!(?role, "role chosen");
        self.ctx.role = Some(role);
        self.set_phase(SignalingPhase::RoleChosen);
    }

    fn set_phase(&mut self, phase: SignalingPhase) {
        debug!(from = ?self.ctx.phase, to = ?phase, "signaling phase");
        self.ctx.phase = phase;
    }

    fn require_phase(&self, expected: SignalingPhase, name: &'static str) -> Result<()> {
        if self.ctx.phase == expected {
            Ok(())
        } else {
            Err(Error::InvalidPhase {
                expected: name,
                actual: self.ctx.phase,
            })
        }
    }
}

fn negotiation(e: Error) -> Error {
    match e {
        Error::Negotiation(_) => e,
        other => Error::Negotiation(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::loopback::{LoopbackNetwork, LoopbackOptions, LoopbackTransport};
    use crate::peer::types::MediaRequest;

    fn session(net: &LoopbackNetwork, options: LoopbackOptions) -> (Arc<LoopbackTransport>, SignalingSession) {
        let peer = net.endpoint(options);
        let transport: Arc<dyn Transport> = peer.clone();
        let session = SignalingSession::new(transport, SessionConfig::default(), EventSink::new());
        (peer, session)
    }

    #[tokio::test]
    async fn host_walks_to_awaiting_answer() {
        let net = LoopbackNetwork::new();
        let (_peer, mut host) = session(&net, LoopbackOptions::default());
        let blob = host.create_call().await.unwrap();
        assert_eq!(host.role(), Some(Role::Host));
        assert_eq!(host.phase(), SignalingPhase::AwaitingRemoteAnswer);

        let offer = BlobCodec::default().decode(blob.as_str()).unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("loopback-channel:chat"));
        assert!(offer.sdp.contains("loopback-channel:file"));
    }

    #[tokio::test]
    async fn create_call_twice_is_a_phase_error() {
        let net = LoopbackNetwork::new();
        let (_peer, mut host) = session(&net, LoopbackOptions::default());
        host.create_call().await.unwrap();
        assert!(matches!(
            host.create_call().await,
            Err(Error::InvalidPhase { .. })
        ));
    }

    #[tokio::test]
    async fn missing_camera_degrades_to_audio_with_warning() {
        let net = LoopbackNetwork::new();
        let (_peer, mut host) = session(
            &net,
            LoopbackOptions {
                available_media: MediaRequest::audio_only(),
                ..Default::default()
            },
        );
        let mut events = host.sink.subscribe();
        host.create_call().await.unwrap();
        assert_eq!(host.local_media().track_count(), 1);
        match events.try_recv() {
            Some(SessionEvent::MediaDegraded { granted, .. }) => {
                assert_eq!(granted, MediaRequest::audio_only())
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_devices_still_produces_an_offer() {
        let net = LoopbackNetwork::new();
        let (_peer, mut host) = session(
            &net,
            LoopbackOptions {
                available_media: MediaRequest::none(),
                ..Default::default()
            },
        );
        let mut events = host.sink.subscribe();
        host.create_call().await.unwrap();
        assert_eq!(host.local_media().track_count(), 0);
        let degraded = std::iter::from_fn(|| events.try_recv())
            .filter(|e| matches!(e, SessionEvent::MediaDegraded { .. }))
            .count();
        assert_eq!(degraded, 2);
    }

    #[tokio::test]
    async fn guest_cannot_accept_an_answer() {
        let net = LoopbackNetwork::new();
        let (_h, mut host) = session(&net, LoopbackOptions::default());
        let (_g, mut guest) = session(&net, LoopbackOptions::default());
        let offer = host.create_call().await.unwrap();
        let answer = guest.join_call(offer.as_str()).await.unwrap();
        assert_eq!(guest.phase(), SignalingPhase::Done);
        assert!(matches!(
            guest.accept_answer(answer.as_str()).await,
            Err(Error::RoleMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn offer_blob_is_not_an_answer() {
        let net = LoopbackNetwork::new();
        let (_h, mut host) = session(&net, LoopbackOptions::default());
        let offer = host.create_call().await.unwrap();
        assert!(matches!(
            host.accept_answer(offer.as_str()).await,
            Err(Error::InvalidAnswer(_))
        ));
        assert_eq!(host.phase(), SignalingPhase::AwaitingRemoteAnswer);
    }

    #[tokio::test]
    async fn garbage_answer_leaves_host_waiting() {
        let net = LoopbackNetwork::new();
        let (_h, mut host) = session(&net, LoopbackOptions::default());
        host.create_call().await.unwrap();
        assert!(matches!(
            host.accept_answer("not a blob at all").await,
            Err(Error::InvalidAnswer(_))
        ));
        assert_eq!(host.phase(), SignalingPhase::AwaitingRemoteAnswer);
    }

    #[tokio::test]
    async fn guest_rejects_malformed_offer() {
        let net = LoopbackNetwork::new();
        let (_g, mut guest) = session(&net, LoopbackOptions::default());
        assert!(matches!(
            guest.join_call("%%%").await,
            Err(Error::MalformedBlob(_))
        ));
        assert_eq!(guest.phase(), SignalingPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_gathering_still_yields_a_blob() {
        let net = LoopbackNetwork::new();
        let (_h, mut host) = session(
            &net,
            LoopbackOptions {
                stall_gathering: true,
                ..Default::default()
            },
        );
        let started = tokio::time::Instant::now();
        host.create_call().await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_secs(3));
    }

    #[tokio::test]
    async fn into_call_requires_completed_signaling() {
        let net = LoopbackNetwork::new();
        let (_h, host) = session(&net, LoopbackOptions::default());
        assert!(matches!(host.into_call(), Err(Error::InvalidPhase { .. })));
    }
}
