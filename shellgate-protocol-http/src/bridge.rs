use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocketStream};
use serde::Deserialize;
use shellgate_common::protocols::{SessionHandle, TerminalSize};
use shellgate_common::SessionId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::*;

const OUTBOUND_CHANNEL_CAPACITY: usize = 32;
const UNWIND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct BridgeParams {
    pub read_limit: usize,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for BridgeParams {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        BridgeParams {
            read_limit: 256 * 1024,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStream {
    Stdout,
    Stderr,
}

/// Bridge-to-host callbacks: liveness, stream taps (recorder and realtime
/// broadcast) and terminal errors.
#[async_trait]
pub trait BridgeEvents: Send + Sync {
    async fn on_heartbeat(&self);
    async fn on_event(&self, stream: BridgeStream, chunk: &[u8]);
}

#[derive(Debug)]
pub struct BridgeOutcome {
    pub failed: bool,
    pub reason: String,
}

#[derive(Debug)]
enum BridgeEnd {
    ClientClosed,
    StreamEnded,
    Failed(String),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ControlFrame {
    Resize(TerminalSize),
    Heartbeat,
}

#[derive(Deserialize)]
struct RawControlFrame {
    #[serde(rename = "type")]
    kind: String,
    cols: Option<u32>,
    rows: Option<u32>,
}

/// Text frames are control JSON first; anything unparseable falls through
/// as raw input, untrimmed.
pub(crate) fn parse_control_frame(text: &str) -> Option<ControlFrame> {
    let raw: RawControlFrame = serde_json::from_str(text).ok()?;
    match raw.kind.as_str() {
        "resize" => Some(ControlFrame::Resize(TerminalSize {
            cols: raw.cols?,
            rows: raw.rows?,
        })),
        "heartbeat" => Some(ControlFrame::Heartbeat),
        _ => None,
    }
}

/// Bidirectional pump between one WebSocket and one session handle:
/// read pump (WS to stdin, control frames applied in order), stdout and
/// stderr pumps (stdio to WS plus event tap), write pump (serialised
/// outbound frames plus periodic ping) and an independent heartbeat
/// ticker. The first pump to end tears the rest down through a shared
/// stop channel.
pub struct TerminalBridge {
    params: BridgeParams,
}

impl TerminalBridge {
    pub fn new(params: BridgeParams) -> Self {
        TerminalBridge { params }
    }

    pub async fn run(
        &self,
        socket: WebSocketStream,
        handle: Arc<dyn SessionHandle>,
        events: Arc<dyn BridgeEvents>,
        session_id: SessionId,
    ) -> BridgeOutcome {
        let params = self.params;
        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (end_tx, mut end_rx) = mpsc::channel::<BridgeEnd>(8);

        let mut tasks = JoinSet::new();

        tasks.spawn(read_pump(
            stream,
            handle.clone(),
            events.clone(),
            params,
            stop_rx.clone(),
            end_tx.clone(),
        ));
        tasks.spawn(write_pump(sink, outbound_rx, params, end_tx.clone()));
        tasks.spawn(heartbeat_ticker(
            events.clone(),
            params.heartbeat_interval,
            stop_rx.clone(),
        ));

        if let Some(stdout) = handle.take_stdout().await {
            tasks.spawn(stdio_pump(
                stdout,
                BridgeStream::Stdout,
                events.clone(),
                outbound_tx.clone(),
                stop_rx.clone(),
                end_tx.clone(),
            ));
        } else {
            let _ = end_tx
                .send(BridgeEnd::Failed("stdout stream unavailable".into()))
                .await;
        }
        if let Some(stderr) = handle.take_stderr().await {
            tasks.spawn(stdio_pump(
                stderr,
                BridgeStream::Stderr,
                events.clone(),
                outbound_tx.clone(),
                stop_rx.clone(),
                end_tx.clone(),
            ));
        }
        drop(end_tx);

        let end = end_rx.recv().await.unwrap_or(BridgeEnd::StreamEnded);
        let _ = stop_tx.send(true);

        let outcome = match end {
            BridgeEnd::ClientClosed | BridgeEnd::StreamEnded => BridgeOutcome {
                failed: false,
                reason: "completed".to_owned(),
            },
            BridgeEnd::Failed(message) => BridgeOutcome {
                failed: true,
                reason: message,
            },
        };

        if outcome.failed {
            // Best-effort error frame; the peer may already be gone.
            let frame = serde_json::json!({
                "type": "error",
                "message": outcome.reason,
                "session_id": session_id,
            });
            let _ = outbound_tx.try_send(Message::Text(frame.to_string()));
        }
        drop(outbound_tx);

        let unwind = async {
            while end_rx.recv().await.is_some() {}
            while tasks.join_next().await.is_some() {}
        };
        if timeout(UNWIND_TIMEOUT, unwind).await.is_err() {
            warn!(session=%session_id, "Bridge tasks did not unwind in time, aborting");
            tasks.abort_all();
        }

        debug!(session=%session_id, failed=outcome.failed, reason=%outcome.reason, "Bridge finished");
        outcome
    }
}

async fn read_pump(
    mut stream: SplitStream<WebSocketStream>,
    handle: Arc<dyn SessionHandle>,
    events: Arc<dyn BridgeEvents>,
    params: BridgeParams,
    mut stop_rx: watch::Receiver<bool>,
    end_tx: mpsc::Sender<BridgeEnd>,
) {
    loop {
        let message = tokio::select! {
            _ = stop_rx.changed() => return,
            result = timeout(params.pong_wait, stream.next()) => match result {
                Err(_) => {
                    let _ = end_tx.send(BridgeEnd::Failed("client read timeout".into())).await;
                    return;
                }
                Ok(None) => {
                    let _ = end_tx.send(BridgeEnd::ClientClosed).await;
                    return;
                }
                Ok(Some(Err(error))) => {
                    let _ = end_tx.send(BridgeEnd::Failed(error.to_string())).await;
                    return;
                }
                Ok(Some(Ok(message))) => message,
            },
        };

        // Any inbound frame counts as liveness.
        events.on_heartbeat().await;

        let write_result = match message {
            Message::Text(text) => {
                if text.len() > params.read_limit {
                    let _ = end_tx.send(BridgeEnd::Failed("frame too large".into())).await;
                    return;
                }
                match parse_control_frame(&text) {
                    Some(ControlFrame::Resize(size)) => handle.resize(size).await,
                    Some(ControlFrame::Heartbeat) => Ok(()),
                    None => handle.write_stdin(Bytes::from(text.into_bytes())).await,
                }
            }
            Message::Binary(data) => {
                if data.len() > params.read_limit {
                    let _ = end_tx.send(BridgeEnd::Failed("frame too large".into())).await;
                    return;
                }
                handle.write_stdin(Bytes::from(data)).await
            }
            Message::Close(_) => {
                let _ = end_tx.send(BridgeEnd::ClientClosed).await;
                return;
            }
            Message::Ping(_) | Message::Pong(_) => Ok(()),
        };

        if let Err(error) = write_result {
            let _ = end_tx.send(BridgeEnd::Failed(error.to_string())).await;
            return;
        }
    }
}

async fn stdio_pump(
    mut rx: mpsc::Receiver<Bytes>,
    stream: BridgeStream,
    events: Arc<dyn BridgeEvents>,
    outbound_tx: mpsc::Sender<Message>,
    mut stop_rx: watch::Receiver<bool>,
    end_tx: mpsc::Sender<BridgeEnd>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            chunk = rx.recv() => match chunk {
                None => {
                    // Driver reads only end once the channel is closed.
                    if stream == BridgeStream::Stdout {
                        let _ = end_tx.send(BridgeEnd::StreamEnded).await;
                    }
                    return;
                }
                Some(chunk) => {
                    events.on_event(stream, &chunk).await;
                    if outbound_tx.send(Message::Binary(chunk.to_vec())).await.is_err() {
                        return;
                    }
                }
            },
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocketStream, Message>,
    mut outbound_rx: mpsc::Receiver<Message>,
    params: BridgeParams,
    end_tx: mpsc::Sender<BridgeEnd>,
) {
    let mut ping = tokio::time::interval(params.ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                match timeout(params.write_wait, sink.send(Message::Ping(vec![]))).await {
                    Ok(Ok(())) => (),
                    _ => {
                        let _ = end_tx.send(BridgeEnd::Failed("ping write failed".into())).await;
                        return;
                    }
                }
            }
            message = outbound_rx.recv() => match message {
                Some(message) => {
                    match timeout(params.write_wait, sink.send(message)).await {
                        Ok(Ok(())) => (),
                        _ => {
                            let _ = end_tx.send(BridgeEnd::Failed("client write failed".into())).await;
                            return;
                        }
                    }
                }
                None => {
                    let _ = timeout(params.write_wait, sink.send(Message::Close(None))).await;
                    return;
                }
            },
        }
    }
}

async fn heartbeat_ticker(
    events: Arc<dyn BridgeEvents>,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => events.on_heartbeat().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_match_contract() {
        let params = BridgeParams::default();
        assert_eq!(params.read_limit, 256 * 1024);
        assert_eq!(params.pong_wait, Duration::from_secs(60));
        assert_eq!(params.ping_period, Duration::from_secs(54));
        assert_eq!(params.write_wait, Duration::from_secs(10));
        assert_eq!(params.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn resize_control_frame_parses() {
        let frame = parse_control_frame(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        match frame {
            ControlFrame::Resize(size) => {
                assert_eq!(size.cols, 120);
                assert_eq!(size.rows, 40);
            }
            _ => panic!("expected resize"),
        }
    }

    #[test]
    fn heartbeat_control_frame_parses() {
        assert_eq!(
            parse_control_frame(r#"{"type":"heartbeat"}"#),
            Some(ControlFrame::Heartbeat)
        );
    }

    #[test]
    fn unknown_type_falls_through_as_input() {
        assert_eq!(parse_control_frame(r#"{"type":"paste","data":"x"}"#), None);
    }

    #[test]
    fn plain_text_falls_through_as_input() {
        assert_eq!(parse_control_frame("ls -la\n"), None);
        assert_eq!(parse_control_frame("{not json"), None);
    }

    #[test]
    fn resize_without_dimensions_is_not_control() {
        assert_eq!(parse_control_frame(r#"{"type":"resize"}"#), None);
    }
}
