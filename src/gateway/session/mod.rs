//! The voice gateway: the signaling websocket of a voice session.
//!
//! [`VoiceGateway::start`] spawns a run loop that connects, identifies (or
//! resumes), keeps the heartbeat going and publishes [`VoiceEvent`]s. When a
//! connection ends, [`on_close`] turns the [`Close`] reason into a resume, a
//! fresh identify, or the end of the run.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::{
    sync::{Mutex, broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    common::types::{AnyResult, GuildId, map_boxed_err},
    gateway::constants::{
        RECONNECT_DELAY_FRESH_MS, VOICE_EVENT_CAPACITY, VOICE_GATEWAY_VERSION,
        WRITE_TASK_SHUTDOWN_MS,
    },
    protocol::{
        models::{Identify, Resume, VoiceCommand, VoiceGatewayMessage},
        opcodes,
    },
};

mod backoff;
mod handler;
mod heartbeat;
pub mod types;

pub use self::types::{
    Close, GatewayStatus, Restart, SessionDescription, VoiceEvent, VoiceGatewayConfiguration,
    on_close,
};
use self::{backoff::Backoff, handler::SessionState, heartbeat::HeartbeatState};

/// Close code that asks the server to keep our session for a resume.
const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// State shared between the public handle and the run loop.
pub(crate) struct GatewayShared {
    guild_id: GuildId,
    events: broadcast::Sender<VoiceEvent>,
    session: RwLock<Option<Arc<SessionDescription>>>,
    status: watch::Sender<GatewayStatus>,
    ping: AtomicI64,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    control: RwLock<Option<mpsc::UnboundedSender<Close>>>,
}

impl GatewayShared {
    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: GatewayStatus) {
        self.status.send_replace(status);
    }

    fn clear_session(&self) {
        self.session.write().take();
    }
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct VoiceGateway {
    shared: Arc<GatewayShared>,
    run: Mutex<Option<RunHandle>>,
}

impl Drop for VoiceGateway {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.cancel.cancel();
        }
    }
}

impl VoiceGateway {
    pub fn new(guild_id: GuildId) -> Self {
        let (events, _) = broadcast::channel(VOICE_EVENT_CAPACITY);
        let (status, _) = watch::channel(GatewayStatus::Disconnected);
        Self {
            shared: Arc::new(GatewayShared {
                guild_id,
                events,
                session: RwLock::new(None),
                status,
                ping: AtomicI64::new(-1),
                outbound: RwLock::new(None),
                control: RwLock::new(None),
            }),
            run: Mutex::new(None),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.shared.guild_id
    }

    pub fn events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.shared.events.subscribe()
    }

    /// The current session description, if the last identify completed and
    /// the session has not been invalidated since.
    pub fn session_description(&self) -> Option<Arc<SessionDescription>> {
        self.shared.session.read().clone()
    }

    pub fn status(&self) -> GatewayStatus {
        *self.shared.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<GatewayStatus> {
        self.shared.status.subscribe()
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn ping(&self) -> Option<Duration> {
        let ms = self.shared.ping.load(Ordering::Relaxed);
        (ms >= 0).then(|| Duration::from_millis(ms as u64))
    }

    /// Starts a run with `configuration`, replacing any run in progress.
    ///
    /// Fails without touching the network when the configuration is unusable.
    pub async fn start(&self, configuration: Arc<VoiceGatewayConfiguration>) -> AnyResult<()> {
        configuration.validate()?;

        let mut run = self.run.lock().await;
        if let Some(previous) = run.take() {
            self.halt(previous).await;
        }

        self.shared.set_status(GatewayStatus::Connecting);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_gateway(
            self.shared.clone(),
            configuration,
            cancel.clone(),
        ));
        *run = Some(RunHandle { cancel, task });
        Ok(())
    }

    /// Closes the websocket and waits for the run loop to finish.
    pub async fn stop(&self) {
        let previous = self.run.lock().await.take();
        if let Some(previous) = previous {
            self.halt(previous).await;
        }
    }

    async fn halt(&self, mut run: RunHandle) {
        let was_running = !run.task.is_finished();
        run.cancel.cancel();

        let grace = Duration::from_millis(WRITE_TASK_SHUTDOWN_MS * 2);
        if tokio::time::timeout(grace, &mut run.task).await.is_err() {
            warn!(
                "[{}] Voice gateway did not stop in time, aborting",
                self.shared.guild_id
            );
            run.task.abort();
        }

        self.shared.clear_session();
        self.shared.set_status(GatewayStatus::Closed);
        if was_running {
            self.shared.emit(VoiceEvent::Close(Close::UserClose));
        }
    }

    /// Sends a command over the current connection.
    pub fn send(&self, command: VoiceCommand) -> AnyResult<()> {
        let json = serde_json::to_string(&command.into_message()?)?;
        let tx = self
            .shared
            .outbound
            .read()
            .clone()
            .ok_or_else(|| map_boxed_err("voice gateway is not connected"))?;
        tx.send(Message::Text(json.into())).map_err(map_boxed_err)
    }

    /// Ends the current connection with `close`; the run loop then restarts
    /// (or stops) exactly as if the server had closed for that reason.
    pub fn request_restart(&self, close: Close) -> AnyResult<()> {
        let control = self
            .shared
            .control
            .read()
            .clone()
            .ok_or_else(|| map_boxed_err("voice gateway is not connected"))?;
        control.send(close).map_err(map_boxed_err)
    }
}

async fn run_gateway(
    shared: Arc<GatewayShared>,
    config: Arc<VoiceGatewayConfiguration>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::default();
    let heartbeat = Arc::new(HeartbeatState::default());
    heartbeat.seq_ack.store(-1, Ordering::Relaxed);
    let mut resume = false;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        shared.set_status(GatewayStatus::Connecting);

        let close = match connect(&shared, &config, resume, &heartbeat, &cancel).await {
            Ok((close, established)) => {
                if established {
                    backoff.reset();
                }
                close
            }
            Err(e) => {
                warn!("[{}] Voice gateway connection error: {}", shared.guild_id, e);
                Close::Reconnecting
            }
        };

        if cancel.is_cancelled() {
            return;
        }

        debug!("[{}] Voice gateway closed: {:?}", shared.guild_id, close);
        shared.emit(VoiceEvent::Close(close.clone()));

        let mut next = None;
        on_close(&close, |restart| next = Some(restart));

        let Some(next) = next else {
            info!(
                "[{}] Voice gateway shutting down after {:?}",
                shared.guild_id, close
            );
            shared.clear_session();
            shared.set_status(GatewayStatus::Closed);
            return;
        };

        if backoff.is_exhausted() {
            warn!(
                "[{}] Giving up after {} reconnect attempts",
                shared.guild_id,
                backoff.attempts()
            );
            shared.clear_session();
            shared.set_status(GatewayStatus::Closed);
            shared.emit(VoiceEvent::Close(Close::RetryLimitReached));
            return;
        }

        let can_resume = shared.session.read().is_some();
        let delay = if next == Restart::Resume && can_resume {
            resume = true;
            backoff.next()
        } else {
            resume = false;
            shared.clear_session();
            heartbeat.seq_ack.store(-1, Ordering::Relaxed);
            backoff.next();
            Duration::from_millis(RECONNECT_DELAY_FRESH_MS)
        };

        shared.set_status(GatewayStatus::Reconnecting);
        debug!(
            "[{}] Reconnecting in {:?} (resume={})",
            shared.guild_id, delay, resume
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Runs one websocket connection to completion.
///
/// Returns why it ended and whether it reached Ready along the way.
async fn connect(
    shared: &GatewayShared,
    config: &VoiceGatewayConfiguration,
    resume: bool,
    heartbeat: &Arc<HeartbeatState>,
    cancel: &CancellationToken,
) -> AnyResult<(Close, bool)> {
    let url = config.url(VOICE_GATEWAY_VERSION);
    debug!("[{}] Connecting to voice gateway: {}", shared.guild_id, url);

    let (ws_stream, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok((Close::UserClose, false)),
        res = tokio_tungstenite::connect_async(&url) => res.map_err(map_boxed_err)?,
    };
    let (mut write, mut read) = ws_stream.split();

    let first = if resume {
        shared.set_status(GatewayStatus::Resuming);
        VoiceGatewayMessage::new(
            opcodes::RESUME,
            &Resume {
                server_id: config.server_id,
                session_id: config.session_id.to_string(),
                token: config.token.clone(),
                seq_ack: heartbeat.seq_ack.load(Ordering::Relaxed),
            },
        )?
    } else {
        shared.set_status(GatewayStatus::Identifying);
        VoiceGatewayMessage::new(
            opcodes::IDENTIFY,
            &Identify {
                server_id: config.server_id,
                user_id: config.self_id,
                session_id: config.session_id.to_string(),
                token: config.token.clone(),
            },
        )?
    };
    write
        .send(Message::Text(serde_json::to_string(&first)?.into()))
        .await
        .map_err(map_boxed_err)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Close>();
    *shared.outbound.write() = Some(tx.clone());
    *shared.control.write() = Some(control_tx.clone());

    let guild_id = shared.guild_id;
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                warn!("[{}] WS write error: {}", guild_id, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    });

    let mut state = SessionState::new(shared, tx.clone(), control_tx, heartbeat.clone());
    let mut closed_locally = true;

    let close = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Close::UserClose,
            Some(close) = control_rx.recv() => break close,
            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("[{}] WS read error: {}", shared.guild_id, e);
                        closed_locally = false;
                        break Close::Reconnecting;
                    }
                    None => {
                        debug!("[{}] WS stream ended", shared.guild_id);
                        closed_locally = false;
                        break Close::Reconnecting;
                    }
                };

                match msg {
                    Message::Text(text) => {
                        if let Some(close) = state.handle_text(text.as_str()) {
                            break close;
                        }
                    }
                    Message::Binary(bin) => {
                        debug!(
                            "[{}] Ignoring {}-byte binary voice frame",
                            shared.guild_id,
                            bin.len()
                        );
                    }
                    Message::Close(frame) => {
                        let (code, reason) = frame
                            .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                            .unwrap_or((1000u16, "No reason".into()));

                        info!(
                            "[{}] WS closed: code={}, reason='{}'",
                            shared.guild_id, code, reason
                        );
                        closed_locally = false;
                        break Close::from_close_frame(code, reason);
                    }
                    _ => {}
                }
            }
        }
    };

    let established = state.established();
    drop(state);
    shared.outbound.write().take();
    shared.control.write().take();

    if closed_locally {
        let code = if close.keeps_session() {
            CloseCode::from(RESUMABLE_CLOSE_CODE)
        } else {
            CloseCode::Normal
        };
        let _ = tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })));
    }
    drop(tx);

    let grace = Duration::from_millis(WRITE_TASK_SHUTDOWN_MS);
    if tokio::time::timeout(grace, &mut write_task).await.is_err() {
        write_task.abort();
    }

    Ok((close, established))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{WebSocketStream, accept_async};

    use super::*;
    use crate::{
        common::types::UserId,
        protocol::models::{SPEAKING_MICROPHONE, Speaking},
    };

    type ServerSocket = WebSocketStream<TcpStream>;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    fn configuration(endpoint: &str) -> Arc<VoiceGatewayConfiguration> {
        Arc::new(VoiceGatewayConfiguration {
            token: "my_token".into(),
            endpoint: endpoint.into(),
            session_id: "my_session_id".into(),
            server_id: GuildId(41771983423143937),
            self_id: UserId(104694319306248192),
        })
    }

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .unwrap()
            .unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_json(ws: &mut ServerSocket) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn push(ws: &mut ServerSocket, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<VoiceEvent>,
        mut pred: impl FnMut(&VoiceEvent) -> bool,
    ) -> VoiceEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn handshake(ws: &mut ServerSocket) {
        push(ws, json!({"op": 8, "d": {"heartbeat_interval": 60000.0}})).await;
        push(
            ws,
            json!({"op": 2, "seq": 1, "d": {
                "ssrc": 42, "ip": "127.0.0.1", "port": 50000,
                "modes": ["xsalsa20_poly1305"]
            }}),
        )
        .await;
        push(
            ws,
            json!({"op": 4, "seq": 2, "d": {
                "mode": "xsalsa20_poly1305",
                "secret_key": vec![1u8; 32]
            }}),
        )
        .await;
    }

    #[tokio::test]
    async fn test_start_rejects_incomplete_configuration() {
        let gateway = VoiceGateway::new(GuildId(1));
        let mut config = (*configuration("ws://127.0.0.1:1")).clone();
        config.token.clear();
        assert!(gateway.start(Arc::new(config)).await.is_err());
        assert_eq!(gateway.status(), GatewayStatus::Disconnected);
        assert!(gateway.send(VoiceCommand::Speaking(Speaking {
            speaking: 0,
            delay: 0,
            ssrc: 0
        }))
        .is_err());
    }

    #[tokio::test]
    async fn test_identify_to_session_description_and_stop() {
        let (listener, url) = listener().await;
        let gateway = VoiceGateway::new(GuildId(41771983423143937));
        let mut events = gateway.events();
        gateway.start(configuration(&url)).await.unwrap();

        let mut ws = accept(&listener).await;
        let identify = next_json(&mut ws).await;
        assert_eq!(identify["op"], 0);
        assert_eq!(identify["d"]["token"], "my_token");
        assert_eq!(identify["d"]["session_id"], "my_session_id");
        assert_eq!(identify["d"]["user_id"], "104694319306248192");

        handshake(&mut ws).await;

        let VoiceEvent::Ready(ready) =
            next_event(&mut events, |e| matches!(e, VoiceEvent::Ready(_))).await
        else {
            unreachable!()
        };
        assert_eq!(ready.ssrc, 42);

        let VoiceEvent::SessionDescription(desc) =
            next_event(&mut events, |e| matches!(e, VoiceEvent::SessionDescription(_))).await
        else {
            unreachable!()
        };
        assert_eq!(desc.ssrc, 42);
        assert_eq!(desc.secret_key, [1u8; 32]);
        assert_eq!(gateway.status(), GatewayStatus::Ready);
        assert_eq!(gateway.session_description().as_deref(), Some(&*desc));

        gateway
            .send(VoiceCommand::Speaking(Speaking {
                speaking: SPEAKING_MICROPHONE,
                delay: 0,
                ssrc: 42,
            }))
            .unwrap();
        let speaking = next_json(&mut ws).await;
        assert_eq!(speaking["op"], 5);
        assert_eq!(speaking["d"]["speaking"], 1);

        gateway.stop().await;
        next_event(&mut events, |e| matches!(e, VoiceEvent::Close(Close::UserClose))).await;
        assert_eq!(gateway.status(), GatewayStatus::Closed);
        assert!(gateway.session_description().is_none());
    }

    #[tokio::test]
    async fn test_resumable_close_resumes_session() {
        let (listener, url) = listener().await;
        let gateway = VoiceGateway::new(GuildId(41771983423143937));
        let mut events = gateway.events();
        gateway.start(configuration(&url)).await.unwrap();

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await["op"], 0);
        handshake(&mut ws).await;
        next_event(&mut events, |e| matches!(e, VoiceEvent::SessionDescription(_))).await;

        ws.close(Some(CloseFrame {
            code: CloseCode::from(4015),
            reason: "Voice server crashed".into(),
        }))
        .await
        .unwrap();

        let close = next_event(&mut events, |e| matches!(e, VoiceEvent::Close(_))).await;
        assert!(matches!(
            close,
            VoiceEvent::Close(Close::InvalidSession { resumable: true })
        ));
        // A resumable close keeps the negotiated key around.
        assert!(gateway.session_description().is_some());

        let mut ws = accept(&listener).await;
        let resume = next_json(&mut ws).await;
        assert_eq!(resume["op"], 7);
        assert_eq!(resume["d"]["session_id"], "my_session_id");
        assert_eq!(resume["d"]["seq_ack"], 2);

        push(&mut ws, json!({"op": 9, "d": null})).await;
        next_event(&mut events, |e| matches!(e, VoiceEvent::Resumed)).await;
        assert_eq!(gateway.status(), GatewayStatus::Ready);

        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_session_invalidating_close_reidentifies() {
        let (listener, url) = listener().await;
        let gateway = VoiceGateway::new(GuildId(41771983423143937));
        let mut events = gateway.events();
        gateway.start(configuration(&url)).await.unwrap();

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await["op"], 0);
        handshake(&mut ws).await;
        next_event(&mut events, |e| matches!(e, VoiceEvent::SessionDescription(_))).await;

        ws.close(Some(CloseFrame {
            code: CloseCode::from(4006),
            reason: "Session no longer valid".into(),
        }))
        .await
        .unwrap();

        next_event(&mut events, |e| {
            matches!(e, VoiceEvent::Close(Close::InvalidSession { resumable: false }))
        })
        .await;

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await["op"], 0);
        assert!(gateway.session_description().is_none());

        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_requested_session_reset_stops_the_run() {
        let (listener, url) = listener().await;
        let gateway = VoiceGateway::new(GuildId(1));
        let mut events = gateway.events();
        gateway.start(configuration(&url)).await.unwrap();

        let mut ws = accept(&listener).await;
        assert_eq!(next_json(&mut ws).await["op"], 0);
        handshake(&mut ws).await;
        next_event(&mut events, |e| matches!(e, VoiceEvent::SessionDescription(_))).await;

        gateway.request_restart(Close::SessionReset).unwrap();
        next_event(&mut events, |e| matches!(e, VoiceEvent::Close(Close::SessionReset))).await;

        let mut status = gateway.watch_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == GatewayStatus::Closed),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(gateway.session_description().is_none());
    }
}
