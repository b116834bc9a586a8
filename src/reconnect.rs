use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::peer::codec::{BlobCodec, EncodedBlob};
use crate::peer::events::{EventSink, SessionEvent};
use crate::peer::ice::{wait_for_ice_gathering, GatheringOutcome};
use crate::peer::state::ReconnectGuard;
use crate::peer::transport::Transport;
use crate::peer::types::OfferOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Another attempt was already running.
    Skipped,
    /// Local ICE credentials were renewed. The blob is the restart offer;
    /// nothing delivers it to the remote peer automatically.
    Restarted {
        gathering: GatheringOutcome,
        blob: EncodedBlob,
    },
}

/// Drives ICE restarts for an established call.
#[derive(Clone)]
pub struct ReconnectionController {
    transport: Arc<dyn Transport>,
    guard: ReconnectGuard,
    codec: BlobCodec,
    gathering_timeout: Duration,
    events: EventSink,
}

impl ReconnectionController {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: BlobCodec,
        gathering_timeout: Duration,
        events: EventSink,
    ) -> Self {
        Self {
            transport,
            guard: ReconnectGuard::new(),
            codec,
            gathering_timeout,
            events,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.guard.is_set()
    }

    /// At most one attempt runs at a time; a concurrent call returns
    /// [`ReconnectOutcome::Skipped`] without touching the transport.
    pub async fn attempt_reconnection(&self) -> Result<ReconnectOutcome> {
        let Some(_token) = self.guard.try_acquire() else {
            info!("reconnection already in progress, skipping");
            return Ok(ReconnectOutcome::Skipped);
        };

        info!("starting ICE restart");
        self.events.emit(SessionEvent::ReconnectStarted);

        match self.restart().await {
            Ok(outcome) => {
                self.events.emit(SessionEvent::RestartIssued);
                Ok(outcome)
            }
            Err(e) => {
                warn!("ICE restart failed: {e}");
                self.events.emit(SessionEvent::ReconnectFailed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn restart(&self) -> Result<ReconnectOutcome> {
        let mut gathering_events = self.transport.subscribe();
        let offer = self
            .transport
            .create_offer(OfferOptions { ice_restart: true })
            .await
            .map_err(|e| Error::Reconnection(format!("restart offer: {e}")))?;
        self.transport
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Reconnection(format!("apply restart offer: {e}")))?;

        let gathering = wait_for_ice_gathering(
            self.transport.as_ref(),
            &mut gathering_events,
            self.gathering_timeout,
        )
        .await;

        let local = self
            .transport
            .local_description()
            .await
            .ok_or_else(|| Error::Reconnection("no local description after restart".into()))?;
        let blob = self
            .codec
            .encode(&local)
            .map_err(|e| Error::Reconnection(e.to_string()))?;
        info!(?gathering, "ICE restart offer ready");
        Ok(ReconnectOutcome::Restarted { gathering, blob })
    }
}
