use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::peer::events::{Subscription, TransportEvent};
use crate::peer::transport::Transport;
use crate::peer::types::{IceGatheringState, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringOutcome {
    Complete,
    /// Proceeding with whatever candidates were gathered so far.
    TimedOut,
}

/// Suspends until gathering completes or `limit` elapses.
///
/// `events` must have been subscribed before the local description was set,
/// otherwise the completion signal can be missed.
pub async fn wait_for_ice_gathering(
    transport: &dyn Transport,
    events: &mut Subscription<TransportEvent>,
    limit: Duration,
) -> GatheringOutcome {
    if transport.ice_gathering_state() == IceGatheringState::Complete {
        debug!("ICE gathering already complete");
        return GatheringOutcome::Complete;
    }

    let complete = async {
        while let Some(event) = events.recv().await {
            if let TransportEvent::IceGatheringState(state) = event {
                debug!(?state, "ICE gathering state");
                if state == IceGatheringState::Complete {
                    return true;
                }
            }
        }
        false
    };

    match timeout(limit, complete).await {
        Ok(true) => {
            info!("ICE gathering completed");
            GatheringOutcome::Complete
        }
        Ok(false) => {
            warn!("transport event stream ended during ICE gathering");
            GatheringOutcome::TimedOut
        }
        Err(_) => {
            info!(
                "ICE gathering not complete after {} ms, continuing with partial candidates",
                limit.as_millis()
            );
            GatheringOutcome::TimedOut
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl CandidateSummary {
    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay
    }
}

pub fn analyze_candidates(desc: &SessionDescription) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in desc.candidates() {
        if candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if summary.relay == 0 {
        warn!("No TURN relay candidates found, connection through symmetric NAT may fail");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::loopback::{LoopbackNetwork, LoopbackOptions};
    use crate::peer::types::OfferOptions;

    #[test]
    fn candidates_are_counted_by_type() {
        let desc = SessionDescription::offer(
            "a=candidate:1 1 udp 1 10.0.0.1 1 typ host\r\n\
             a=candidate:2 1 udp 1 203.0.113.9 2 typ srflx raddr 10.0.0.1 rport 1\r\n\
             a=candidate:3 1 udp 1 198.51.100.2 3 typ relay raddr 0.0.0.0 rport 0\r\n\
             a=candidate:4 1 tcp 1 10.0.0.1 9 typ host tcptype active\r\n",
        );
        let summary = analyze_candidates(&desc);
        assert_eq!(summary, CandidateSummary { host: 2, srflx: 1, relay: 1 });
        assert_eq!(summary.total(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gathering_wait_returns_on_completion() {
        let net = LoopbackNetwork::new();
        let peer = net.endpoint(LoopbackOptions::default());
        let mut events = peer.subscribe();
        let offer = peer.create_offer(OfferOptions::default()).await.unwrap();
        peer.set_local_description(offer).await.unwrap();

        let outcome =
            wait_for_ice_gathering(peer.as_ref(), &mut events, Duration::from_secs(3)).await;
        assert_eq!(outcome, GatheringOutcome::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn gathering_wait_is_bounded() {
        let net = LoopbackNetwork::new();
        let peer = net.endpoint(LoopbackOptions {
            stall_gathering: true,
            ..Default::default()
        });
        let mut events = peer.subscribe();
        let offer = peer.create_offer(OfferOptions::default()).await.unwrap();
        peer.set_local_description(offer).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome =
            wait_for_ice_gathering(peer.as_ref(), &mut events, Duration::from_secs(3)).await;
        assert_eq!(outcome, GatheringOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
