#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pastecall::peer::{
    EventSink, LoopbackNetwork, LoopbackOptions, LoopbackTransport, SessionEvent, Subscription,
    Transport,
};
use pastecall::{CallHandle, SessionConfig, SignalingSession};
use tokio::time::timeout;

pub struct Peer {
    pub call: CallHandle,
    pub transport: Arc<LoopbackTransport>,
    pub events: Subscription<SessionEvent>,
}

pub struct Pair {
    pub host: Peer,
    pub guest: Peer,
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        chunk_pacing_ms: 1,
        ..Default::default()
    }
}

/// Runs the full copy/paste exchange between two loopback endpoints.
pub async fn connect(host_config: SessionConfig, guest_config: SessionConfig) -> Pair {
    connect_with(
        host_config,
        LoopbackOptions::default(),
        guest_config,
        LoopbackOptions::default(),
    )
    .await
}

pub async fn connect_with(
    host_config: SessionConfig,
    host_options: LoopbackOptions,
    guest_config: SessionConfig,
    guest_options: LoopbackOptions,
) -> Pair {
    let net = LoopbackNetwork::new();
    let host_transport = net.endpoint(host_options);
    let guest_transport = net.endpoint(guest_options);

    let host_sink = EventSink::new();
    let guest_sink = EventSink::new();
    let host_events = host_sink.subscribe();
    let guest_events = guest_sink.subscribe();

    let host_dyn: Arc<dyn Transport> = host_transport.clone();
    let guest_dyn: Arc<dyn Transport> = guest_transport.clone();
    let mut host = SignalingSession::new(host_dyn, host_config, host_sink);
    let mut guest = SignalingSession::new(guest_dyn, guest_config, guest_sink);

    let offer = host.create_call().await.unwrap();
    let answer = guest.join_call(offer.as_str()).await.unwrap();
    host.accept_answer(answer.as_str()).await.unwrap();

    Pair {
        host: Peer {
            call: host.into_call().unwrap(),
            transport: host_transport,
            events: host_events,
        },
        guest: Peer {
            call: guest.into_call().unwrap(),
            transport: guest_transport,
            events: guest_events,
        },
    }
}

/// Next event matching `pred`, skipping everything else.
pub async fn wait_for<F>(events: &mut Subscription<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("session event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

pub async fn wait_until_open(peer: &mut Peer) {
    for _ in 0..2 {
        wait_for(&mut peer.events, |e| matches!(e, SessionEvent::ChannelOpened(_))).await;
    }
}
