use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, Lines};
use tracing::{debug, info, warn};

use crate::commands::util_api::{
    describe, describe_status, parse_input, read_blob, store_download, Input, HELP,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::peer::codec::BlobCodec;
use crate::peer::events::{EventSink, SessionEvent, Subscription};
use crate::peer::loopback::{LoopbackNetwork, LoopbackOptions};
use crate::peer::transport::Transport;
use crate::session::CallHandle;
use crate::signaling::SignalingSession;
use crate::transfer::OutgoingFile;

/// Host side of the copy/paste exchange.
pub async fn host<R>(
    transport: Arc<dyn Transport>,
    config: &SessionConfig,
    sink: EventSink,
    lines: &mut Lines<R>,
) -> Result<CallHandle>
where
    R: AsyncBufRead + Unpin,
{
    let codec = BlobCodec::from_config(config);
    let mut session = SignalingSession::new(transport, config.clone(), sink);
    let offer = session.create_call().await?;
    println!("Share this offer with your peer:\n\n{offer}\n");

    loop {
        println!("Paste the peer's answer:");
        let answer = read_blob(lines, &codec).await?;
        match session.accept_answer(&answer).await {
            Ok(()) => break,
            Err(e @ Error::InvalidAnswer(_)) => eprintln!("{e}; try again"),
            Err(e) => return Err(e),
        }
    }
    session.into_call()
}

/// Guest side: read the offer, print the answer.
pub async fn join<R>(
    transport: Arc<dyn Transport>,
    config: &SessionConfig,
    sink: EventSink,
    lines: &mut Lines<R>,
) -> Result<CallHandle>
where
    R: AsyncBufRead + Unpin,
{
    let codec = BlobCodec::from_config(config);
    let mut session = SignalingSession::new(transport, config.clone(), sink);
    let answer = loop {
        println!("Paste the host's offer:");
        let offer = read_blob(lines, &codec).await?;
        match session.join_call(&offer).await {
            Ok(answer) => break answer,
            Err(e @ Error::MalformedBlob(_)) => eprintln!("{e}; try again"),
            Err(e) => return Err(e),
        }
    };
    println!("Send this answer back to the host:\n\n{answer}\n");
    session.into_call()
}

/// In-process counterpart for `--loopback`: negotiates with the local user's
/// session automatically, echoes chat and acknowledges files.
pub struct LoopbackPeer {
    call: Arc<CallHandle>,
    echo: tokio::task::JoinHandle<()>,
}

impl LoopbackPeer {
    pub async fn close(self) {
        self.echo.abort();
        match Arc::try_unwrap(self.call) {
            Ok(call) => {
                if let Err(e) = call.close().await {
                    warn!("loopback peer close failed: {e}");
                }
            }
            Err(_) => debug!("loopback peer still shared, dropping"),
        }
    }
}

/// Runs a whole call against an in-process peer. `local_hosts` picks the
/// local user's role.
pub async fn loopback_pair(
    config: &SessionConfig,
    sink: EventSink,
    local_hosts: bool,
) -> Result<(CallHandle, LoopbackPeer)> {
    let net = LoopbackNetwork::new();
    let local_transport: Arc<dyn Transport> = net.endpoint(LoopbackOptions::default());
    let peer_transport: Arc<dyn Transport> = net.endpoint(LoopbackOptions::default());
    let peer_sink = EventSink::new();
    let peer_events = peer_sink.subscribe();

    let mut local = SignalingSession::new(local_transport, config.clone(), sink);
    let mut peer = SignalingSession::new(peer_transport, config.clone(), peer_sink);

    if local_hosts {
        let offer = local.create_call().await?;
        println!("offer ({} chars) handed to the loopback guest", offer.as_str().len());
        let answer = peer.join_call(offer.as_str()).await?;
        println!("answer ({} chars) received", answer.as_str().len());
        local.accept_answer(answer.as_str()).await?;
    } else {
        let offer = peer.create_call().await?;
        println!("offer ({} chars) received from the loopback host", offer.as_str().len());
        let answer = local.join_call(offer.as_str()).await?;
        println!("answer ({} chars) handed back", answer.as_str().len());
        peer.accept_answer(answer.as_str()).await?;
    }

    let peer_call = Arc::new(peer.into_call()?);
    let echo = tokio::spawn(echo_loop(Arc::clone(&peer_call), peer_events));
    Ok((
        local.into_call()?,
        LoopbackPeer {
            call: peer_call,
            echo,
        },
    ))
}

async fn echo_loop(call: Arc<CallHandle>, mut events: Subscription<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let reply = match event {
            SessionEvent::ChatMessage(text) => format!("echo: {text}"),
            SessionEvent::FileReceived(file) => {
                format!("got {} ({} bytes)", file.name, file.size())
            }
            _ => continue,
        };
        if let Err(e) = call.send_chat(reply).await {
            debug!("loopback peer could not reply: {e}");
        }
    }
}

/// Prints session events and stores downloads until the stream ends.
pub async fn print_events(mut events: Subscription<SessionEvent>, download_dir: PathBuf) {
    while let Some(event) = events.recv().await {
        if let Some(line) = describe(&event) {
            println!("{line}");
        }
        if let Some(path) = store_download(&download_dir, &event).await {
            println!("* saved to {}", path.display());
        }
    }
}

/// Chat prompt: runs until `/quit` or end of input, then hangs up.
pub async fn interact<R>(call: CallHandle, lines: &mut Lines<R>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    println!("{HELP}");
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Chat(text) => {
                if let Err(e) = call.send_chat(text).await {
                    eprintln!("! {e}");
                }
            }
            Input::File(path) => match OutgoingFile::from_path(&path).await {
                Ok(file) => {
                    info!(path = %path.display(), size = file.size(), "sending file");
                    if let Err(e) = call.send_file(file).await {
                        eprintln!("! {e}");
                    }
                }
                Err(e) => eprintln!("! cannot read {}: {e}", path.display()),
            },
            Input::Status => match call.status().await {
                Ok(status) => println!("{}", describe_status(&status)),
                Err(e) => eprintln!("! {e}"),
            },
            Input::Recheck => call.recheck(),
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
            Input::Empty => {}
            Input::Unknown(name) => eprintln!("! unknown command /{name}, try /help"),
        }
        if !call.is_running() {
            println!("* call ended");
            break;
        }
    }
    call.close().await
}
