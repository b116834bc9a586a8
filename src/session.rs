//! Owned session state and the running call.
//!
//! A [`Call`] is an actor: one task owns the context, the monitor and the
//! receive side of the file protocol, and reacts to transport events,
//! the grace timer and commands from the [`CallHandle`].

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chat;
use crate::config::SessionConfig;
use crate::error::{Error, Result, TransferError};
use crate::monitor::{ConnectionMonitor, Verdict};
use crate::peer::codec::BlobCodec;
use crate::peer::events::{ChannelPayload, EventSink, SessionEvent, Subscription, TransportEvent};
use crate::peer::transport::{DataChannel, Transport, CHAT_LABEL, FILE_LABEL};
use crate::peer::types::{ConnectionState, LocalMedia, Role, SignalingPhase};
use crate::reconnect::{ReconnectOutcome, ReconnectionController};
use crate::transfer::{
    Direction, FileReceiver, FileSender, OutgoingFile, Progress, ReceiveEvent, SendState,
};

/// The two channels of a call, bound by label.
#[derive(Debug, Default)]
pub struct ChannelSet {
    chat: Option<Arc<dyn DataChannel>>,
    file: Option<Arc<dyn DataChannel>>,
    open: HashSet<String>,
}

impl ChannelSet {
    /// Binds a channel to its handler slot. Unknown labels are refused.
    pub fn bind(&mut self, channel: Arc<dyn DataChannel>) -> bool {
        let slot = match channel.label() {
            CHAT_LABEL => &mut self.chat,
            FILE_LABEL => &mut self.file,
            other => {
                warn!(label = other, "ignoring channel with unknown label");
                return false;
            }
        };
        debug!(label = channel.label(), "channel bound");
        *slot = Some(channel);
        true
    }

    pub fn get(&self, label: &str) -> Option<&Arc<dyn DataChannel>> {
        match label {
            CHAT_LABEL => self.chat.as_ref(),
            FILE_LABEL => self.file.as_ref(),
            _ => None,
        }
    }

    /// The channel, if bound and open.
    pub fn usable(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        match self.get(label) {
            Some(channel) if self.open.contains(label) => Ok(Arc::clone(channel)),
            _ => Err(Error::ChannelNotOpen(label.to_string())),
        }
    }

    pub fn mark_open(&mut self, label: &str) {
        self.open.insert(label.to_string());
    }

    pub fn mark_closed(&mut self, label: &str) -> bool {
        self.open.remove(label)
    }

    pub fn is_open(&self, label: &str) -> bool {
        self.open.contains(label)
    }
}

/// Everything one session owns, handed from signaling to the call.
#[derive(Debug)]
pub struct SessionContext {
    pub role: Option<Role>,
    pub phase: SignalingPhase,
    pub media: LocalMedia,
    pub channels: ChannelSet,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            role: None,
            phase: SignalingPhase::Idle,
            media: LocalMedia::default(),
            channels: ChannelSet::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub role: Option<Role>,
    pub phase: SignalingPhase,
    pub state: ConnectionState,
    pub local_tracks: usize,
    pub remote_tracks: usize,
    pub chat_open: bool,
    pub file_open: bool,
    pub sending: SendState,
    pub receiving: Option<Progress>,
    pub reconnecting: bool,
}

enum CallCommand {
    Chat(String, oneshot::Sender<Result<()>>),
    SendFile(OutgoingFile, oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<CallStatus>),
    Recheck,
    Close(oneshot::Sender<()>),
}

pub struct Call {
    ctx: SessionContext,
    transport: Arc<dyn Transport>,
    transport_events: Subscription<TransportEvent>,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    sink: EventSink,
    monitor: ConnectionMonitor,
    reconnect: ReconnectionController,
    sender: Arc<Mutex<FileSender>>,
    receiver: FileReceiver,
}

impl Call {
    /// Starts the call task. `transport_events` must have been subscribed
    /// before negotiation so no channel or state event is missed.
    pub fn spawn(
        ctx: SessionContext,
        transport: Arc<dyn Transport>,
        transport_events: Subscription<TransportEvent>,
        config: &SessionConfig,
        sink: EventSink,
    ) -> CallHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut monitor = ConnectionMonitor::new(config.disconnect_grace());
        monitor.set_local_tracks(ctx.media.track_count());
        let reconnect = ReconnectionController::new(
            Arc::clone(&transport),
            BlobCodec::from_config(config),
            config.ice_gathering_timeout(),
            sink.clone(),
        );
        let call = Call {
            ctx,
            transport,
            transport_events,
            commands: rx,
            sink,
            monitor,
            reconnect,
            sender: Arc::new(Mutex::new(FileSender::new(
                config.chunk_size,
                config.chunk_pacing(),
            ))),
            receiver: FileReceiver::new(config.max_file_bytes),
        };
        let task = tokio::spawn(call.run());
        CallHandle { commands: tx, task }
    }

    async fn run(mut self) {
        info!(role = ?self.ctx.role, "call running");
        loop {
            tokio::select! {
                event = self.transport_events.recv() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        warn!("transport event stream ended");
                        break;
                    }
                },
                verdict = self.monitor.grace_expired() => self.apply(verdict),
                command = self.commands.recv() => match command {
                    Some(CallCommand::Close(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("call handle dropped");
                        break;
                    }
                },
            }
        }
        self.shutdown().await;
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        if let Some(verdict) = self.monitor.observe(&event) {
            self.apply(verdict);
            return;
        }
        match event {
            TransportEvent::IncomingChannel(channel) => {
                self.ctx.channels.bind(channel);
            }
            TransportEvent::ChannelOpen { label } => {
                info!(%label, "channel open");
                self.ctx.channels.mark_open(&label);
                self.sink.emit(SessionEvent::ChannelOpened(label));
            }
            TransportEvent::ChannelClosed { label } => {
                if !self.ctx.channels.mark_closed(&label) {
                    return;
                }
                info!(%label, "channel closed");
                if label == FILE_LABEL {
                    if let Some(name) = self.receiver.abort() {
                        self.sink.emit(SessionEvent::TransferFailed {
                            direction: Direction::Receive,
                            reason: format!("channel closed while receiving {name}"),
                        });
                    }
                }
                self.sink.emit(SessionEvent::ChannelClosed(label));
            }
            TransportEvent::ChannelError { label, reason } => {
                warn!(%label, %reason, "channel error");
                self.sink.notice(format!("channel {label} error: {reason}"));
            }
            TransportEvent::ChannelMessage { label, payload } => self.on_message(&label, payload),
            TransportEvent::IceGatheringState(state) => debug!(?state, "ICE gathering"),
            _ => {}
        }
    }

    fn on_message(&mut self, label: &str, payload: ChannelPayload) {
        match label {
            CHAT_LABEL => {
                if let Some(text) = chat::incoming(payload) {
                    self.sink.emit(SessionEvent::ChatMessage(text));
                }
            }
            FILE_LABEL => match self.receiver.handle(payload) {
                Some(ReceiveEvent::Started { size, .. }) => {
                    self.sink.emit(SessionEvent::TransferProgress {
                        direction: Direction::Receive,
                        bytes: 0,
                        total: size,
                    });
                }
                Some(ReceiveEvent::Progress(p)) => {
                    self.sink.emit(SessionEvent::TransferProgress {
                        direction: Direction::Receive,
                        bytes: p.bytes,
                        total: p.total,
                    });
                }
                Some(ReceiveEvent::Completed(file)) => {
                    self.sink.emit(SessionEvent::FileReceived(file));
                }
                Some(ReceiveEvent::Failed(e)) | Some(ReceiveEvent::Rejected(e)) => {
                    self.sink.emit(SessionEvent::TransferFailed {
                        direction: Direction::Receive,
                        reason: e.to_string(),
                    });
                }
                None => {}
            },
            other => debug!(label = other, "message on unbound channel"),
        }
    }

    fn apply(&mut self, verdict: Verdict) {
        if verdict.changed {
            self.sink.emit(SessionEvent::Status(verdict.state));
            match verdict.state {
                ConnectionState::Connected | ConnectionState::DegradedNoMedia
                    if self.ctx.phase == SignalingPhase::Done =>
                {
                    info!("call established");
                    self.ctx.phase = SignalingPhase::Established;
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    let degraded = Error::TransportDegraded(format!("{:?}", verdict.state));
                    self.sink.notice(degraded.to_string());
                }
                _ => {}
            }
        }
        if verdict.escalate {
            self.spawn_reconnection();
        }
    }

    fn spawn_reconnection(&self) {
        let controller = self.reconnect.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            match controller.attempt_reconnection().await {
                Ok(ReconnectOutcome::Restarted { blob, .. }) => {
                    sink.notice(format!(
                        "ICE restarted; if the peer stays unreachable share this offer: {blob}"
                    ));
                }
                Ok(ReconnectOutcome::Skipped) => {}
                Err(e) => debug!("reconnection attempt ended: {e}"),
            }
        });
    }

    async fn on_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Chat(text, reply) => {
                let result = match self.ctx.channels.usable(CHAT_LABEL) {
                    Ok(channel) => chat::send_line(channel.as_ref(), &text).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            CallCommand::SendFile(file, reply) => {
                let _ = reply.send(self.start_send(file));
            }
            CallCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            CallCommand::Recheck => {
                let verdict = self.monitor.recheck();
                self.apply(verdict);
            }
            CallCommand::Close(_) => {}
        }
    }

    fn start_send(&self, file: OutgoingFile) -> Result<()> {
        let channel = self.ctx.channels.usable(FILE_LABEL)?;
        let mut sender = Arc::clone(&self.sender)
            .try_lock_owned()
            .map_err(|_| TransferError::JobActive("send"))?;
        let sink = self.sink.clone();

        tokio::spawn(async move {
            let progress_sink = sink.clone();
            let result = sender
                .send_file(channel.as_ref(), &file, |p| {
                    progress_sink.emit(SessionEvent::TransferProgress {
                        direction: Direction::Send,
                        bytes: p.bytes,
                        total: p.total,
                    })
                })
                .await;
            match result {
                Ok(sent) => sink.emit(SessionEvent::FileSent {
                    name: sent.name,
                    size: sent.size,
                }),
                Err(e) => sink.emit(SessionEvent::TransferFailed {
                    direction: Direction::Send,
                    reason: e.to_string(),
                }),
            }
        });
        Ok(())
    }

    fn status(&self) -> CallStatus {
        let facts = self.monitor.facts();
        CallStatus {
            role: self.ctx.role,
            phase: self.ctx.phase,
            state: self.monitor.state(),
            local_tracks: facts.local_tracks,
            remote_tracks: facts.remote_tracks,
            chat_open: self.ctx.channels.is_open(CHAT_LABEL),
            file_open: self.ctx.channels.is_open(FILE_LABEL),
            sending: self
                .sender
                .try_lock()
                .map(|s| s.state())
                .unwrap_or(SendState::Sending),
            receiving: self.receiver.progress(),
            reconnecting: self.reconnect.in_progress(),
        }
    }

    /// Runs on every exit path of the call task.
    async fn shutdown(&mut self) {
        info!("closing call");
        self.receiver.abort();
        if let Err(e) = self.transport.close().await {
            warn!("transport close failed: {e}");
        }
        self.ctx.media = LocalMedia::default();
        if self.monitor.state() != ConnectionState::Disconnected {
            self.sink
                .emit(SessionEvent::Status(ConnectionState::Disconnected));
        }
    }
}

/// Front-end side of a running call. Dropping it ends the call.
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| CallCommand::Chat(text, reply)).await?
    }

    /// Starts sending in the background; progress and completion arrive as
    /// [`SessionEvent`]s.
    pub async fn send_file(&self, file: OutgoingFile) -> Result<()> {
        self.request(|reply| CallCommand::SendFile(file, reply))
            .await?
    }

    pub async fn status(&self) -> Result<CallStatus> {
        self.request(CallCommand::Status).await
    }

    /// Re-evaluates health, e.g. after the front end regains focus.
    pub fn recheck(&self) {
        let _ = self.commands.send(CallCommand::Recheck);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops media, closes the transport and waits for the call task.
    pub async fn close(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(CallCommand::Close(tx)).is_ok() {
            let _ = rx.await;
        }
        self.task
            .await
            .map_err(|e| Error::Transport(format!("call task failed: {e}")))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CallCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| Error::Transport("call has ended".into()))?;
        rx.await
            .map_err(|_| Error::Transport("call has ended".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingChannel;

    #[test]
    fn channels_bind_by_label() {
        let mut set = ChannelSet::default();
        assert!(set.bind(Arc::new(RecordingChannel::new(CHAT_LABEL))));
        assert!(set.bind(Arc::new(RecordingChannel::new(FILE_LABEL))));
        assert!(!set.bind(Arc::new(RecordingChannel::new("video"))));
        assert_eq!(set.get(CHAT_LABEL).map(|c| c.label()), Some(CHAT_LABEL));
        assert_eq!(set.get(FILE_LABEL).map(|c| c.label()), Some(FILE_LABEL));
        assert!(set.get("video").is_none());
    }

    #[test]
    fn bound_channel_is_unusable_until_open() {
        let mut set = ChannelSet::default();
        set.bind(Arc::new(RecordingChannel::new(FILE_LABEL)));
        assert!(matches!(set.usable(FILE_LABEL), Err(Error::ChannelNotOpen(_))));

        set.mark_open(FILE_LABEL);
        assert!(set.usable(FILE_LABEL).is_ok());

        assert!(set.mark_closed(FILE_LABEL));
        assert!(!set.mark_closed(FILE_LABEL));
        assert!(matches!(set.usable(FILE_LABEL), Err(Error::ChannelNotOpen(_))));
    }

    #[test]
    fn open_without_binding_is_still_unusable() {
        let mut set = ChannelSet::default();
        set.mark_open(CHAT_LABEL);
        assert!(set.is_open(CHAT_LABEL));
        assert!(set.usable(CHAT_LABEL).is_err());
    }
}
