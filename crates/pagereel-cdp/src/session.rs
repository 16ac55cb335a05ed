//! CDP browser session: one WebSocket to the browser endpoint, flat-mode
//! sessions multiplexed over it.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::error::BrowserError;
use crate::page::CdpPage;
use crate::protocol::{CdpEvent, Inbound, command_message, parse_inbound};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pending CDP command waiting for response.
type PendingTx = oneshot::Sender<Result<Value, String>>;

/// Event subscribers; closed receivers are pruned on the next event.
type EventSubscribers = Arc<parking_lot::Mutex<Vec<mpsc::UnboundedSender<CdpEvent>>>>;

/// Per-command response timeout.
const CDP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a freshly launched Chrome to expose its endpoint.
const STARTUP_POLLS: u32 = 100;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Chrome launch parameters.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    /// Run without a visible window.
    pub headless: bool,
    /// Initial window width.
    pub window_width: u32,
    /// Initial window height.
    pub window_height: u32,
    /// Extra command-line switches.
    pub extra_args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            window_width: 1280,
            window_height: 800,
            extra_args: Vec::new(),
        }
    }
}

impl LaunchOptions {
    fn args(&self, port: u16) -> Vec<String> {
        let mut args = Vec::new();
        if self.headless {
            args.push("--headless=new".to_string());
        }
        args.extend(
            [
                "--disable-gpu",
                "--no-sandbox",
                "--disable-dev-shm-usage",
                "--no-first-run",
                "--no-default-browser-check",
            ]
            .map(String::from),
        );
        args.push(format!("--remote-debugging-port={port}"));
        args.push(format!(
            "--window-size={},{}",
            self.window_width, self.window_height
        ));
        args.extend(self.extra_args.iter().cloned());
        args.push("about:blank".to_string());
        args
    }
}

/// Internal CDP command message.
struct CdpCommand {
    method: String,
    params: Value,
    session_id: Option<String>,
    response_tx: PendingTx,
}

/// A connection to one browser.
pub struct BrowserSession {
    cmd_tx: mpsc::Sender<CdpCommand>,
    subscribers: EventSubscribers,
    chrome_process: Mutex<Option<Child>>,
    _handler: JoinHandle<()>,
}

impl BrowserSession {
    /// Launch Chrome and connect to its browser endpoint.
    pub async fn launch(chrome_path: &Path, opts: &LaunchOptions) -> Result<Self, BrowserError> {
        // Find a free port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| {
            BrowserError::LaunchFailed {
                context: format!("bind port: {e}"),
            }
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| BrowserError::LaunchFailed {
                context: format!("local_addr: {e}"),
            })?
            .port();
        drop(listener);

        let mut child = Command::new(chrome_path)
            .args(opts.args(port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::LaunchFailed {
                context: format!("{}: {e}", chrome_path.display()),
            })?;

        let ws_url = wait_for_ws_url(port, &mut child).await?;
        debug!(%ws_url, "Chrome started");

        let session = Self::connect(&ws_url).await?;
        *session.chrome_process.lock().await = Some(child);
        Ok(session)
    }

    /// Connect to an already running browser's WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self, BrowserError> {
        let (ws, _) = connect_async(ws_url)
            .await
            .map_err(|e| BrowserError::LaunchFailed {
                context: format!("WebSocket connect: {e}"),
            })?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<CdpCommand>(64);
        let subscribers: EventSubscribers = Arc::default();
        let handler = tokio::spawn(cdp_handler_loop(ws, cmd_rx, Arc::clone(&subscribers)));

        let session = Self {
            cmd_tx,
            subscribers,
            chrome_process: Mutex::new(None),
            _handler: handler,
        };
        let _ = session
            .send_cdp("Target.setDiscoverTargets", json!({ "discover": true }), None)
            .await?;
        Ok(session)
    }

    /// Receive every CDP event from now on.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<CdpEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send a command and wait for its result.
    ///
    /// `session_id` routes the command to a flat-mode target session;
    /// `None` addresses the browser.
    pub async fn send_cdp(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, BrowserError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CdpCommand {
                method: method.into(),
                params,
                session_id: session_id.map(String::from),
                response_tx: tx,
            })
            .await
            .map_err(|_| BrowserError::Cdp("handler closed".into()))?;

        #[allow(clippy::cast_possible_truncation)]
        let result = tokio::time::timeout(CDP_TIMEOUT, rx)
            .await
            .map_err(|_| BrowserError::Timeout {
                timeout_ms: CDP_TIMEOUT.as_millis() as u64,
                context: format!("CDP {method}"),
            })?
            .map_err(|_| BrowserError::Cdp("response dropped".into()))?;

        result.map_err(BrowserError::Cdp)
    }

    /// Attach to a target in flat mode and enable its `Page` domain.
    ///
    /// Returns the new session id.
    pub async fn attach(&self, target_id: &str) -> Result<String, BrowserError> {
        let result = self
            .send_cdp(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = result["sessionId"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| BrowserError::Cdp("attachToTarget returned no sessionId".into()))?;
        let _ = self
            .send_cdp("Page.enable", json!({}), Some(&session_id))
            .await?;
        Ok(session_id)
    }

    /// Open a new page and navigate it to `url`.
    pub async fn new_page(self: &Arc<Self>, url: &str) -> Result<CdpPage, BrowserError> {
        let result = self
            .send_cdp("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = result["targetId"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| BrowserError::Cdp("createTarget returned no targetId".into()))?;
        let session_id = self.attach(&target_id).await?;

        let page = CdpPage::new(Arc::clone(self), target_id.into(), session_id);
        if url != "about:blank" {
            page.navigate(url).await?;
        }
        Ok(page)
    }

    /// Kill the Chrome process, if this session launched one.
    pub async fn close(&self) -> Result<(), BrowserError> {
        if let Some(mut child) = self.chrome_process.lock().await.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

/// Poll Chrome's `/json/version` endpoint for the browser WebSocket URL.
async fn wait_for_ws_url(port: u16, child: &mut Child) -> Result<String, BrowserError> {
    let url = format!("http://127.0.0.1:{port}/json/version");

    for _ in 0..STARTUP_POLLS {
        tokio::time::sleep(STARTUP_POLL_INTERVAL).await;

        // Check Chrome hasn't crashed
        if let Some(status) = child.try_wait().map_err(|e| BrowserError::LaunchFailed {
            context: format!("wait: {e}"),
        })? {
            return Err(BrowserError::LaunchFailed {
                context: format!("Chrome exited early with {status}"),
            });
        }

        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(version): Result<Value, _> = resp.json().await else {
            continue;
        };
        if let Some(ws_url) = version["webSocketDebuggerUrl"].as_str() {
            return Ok(ws_url.to_string());
        }
    }

    Err(BrowserError::LaunchFailed {
        context: format!("Chrome did not expose a DevTools endpoint on port {port}"),
    })
}

/// CDP WebSocket handler loop.
///
/// Sends commands from [`BrowserSession`] over the socket, routes responses
/// back by id and fans events out to subscribers.
async fn cdp_handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<CdpCommand>,
    subscribers: EventSubscribers,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let id = next_id;
                next_id += 1;
                let msg = command_message(id, &cmd.method, &cmd.params, cmd.session_id.as_deref());
                let _ = pending.insert(id, cmd.response_tx);
                if ws_tx.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                match parse_inbound(&text) {
                    Some(Inbound::Response { id, result }) => {
                        if let Some(tx) = pending.remove(&id) {
                            let _ = tx.send(result);
                        }
                    }
                    Some(Inbound::Event(event)) => {
                        subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
                    }
                    None => {}
                }
            }
        }
    }

    if !pending.is_empty() {
        warn!(pending = pending.len(), "CDP connection closed with commands in flight");
    }
    subscribers.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    /// Minimal DevTools endpoint: answers every command and pushes one event
    /// after `Target.setDiscoverTargets`.
    async fn fake_browser() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut tx, mut rx) = ws.split();
            while let Some(Ok(Message::Text(text))) = rx.next().await {
                let cmd: Value = serde_json::from_str(&text).unwrap();
                let id = cmd["id"].as_u64().unwrap();
                let reply = match cmd["method"].as_str().unwrap() {
                    "Broken.method" => json!({"id": id, "error": {"message": "method not found"}}),
                    "Echo.session" => json!({"id": id, "result": {"sessionId": cmd["sessionId"]}}),
                    _ => json!({"id": id, "result": {}}),
                };
                tx.send(Message::Text(reply.to_string().into())).await.unwrap();
                if cmd["method"] == "Target.setDiscoverTargets" {
                    let event = json!({
                        "method": "Target.targetCreated",
                        "params": {"targetInfo": {"targetId": "T9", "type": "page"}}
                    });
                    tx.send(Message::Text(event.to_string().into())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    #[test]
    fn launch_args_include_port_and_size() {
        let args = LaunchOptions::default().args(9222);
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--remote-debugging-port=9222".to_string()));
        assert!(args.contains(&"--window-size=1280,800".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn headful_launch_omits_headless_flag() {
        let opts = LaunchOptions {
            headless: false,
            extra_args: vec!["--mute-audio".into()],
            ..Default::default()
        };
        let args = opts.args(1);
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert!(args.contains(&"--mute-audio".to_string()));
    }

    #[tokio::test]
    async fn responses_routed_by_id() {
        let url = fake_browser().await;
        let session = BrowserSession::connect(&url).await.unwrap();
        let result = session
            .send_cdp("Echo.session", json!({}), Some("S7"))
            .await
            .unwrap();
        assert_eq!(result["sessionId"], "S7");
    }

    #[tokio::test]
    async fn error_responses_become_cdp_errors() {
        let url = fake_browser().await;
        let session = BrowserSession::connect(&url).await.unwrap();
        let err = session
            .send_cdp("Broken.method", json!({}), None)
            .await
            .unwrap_err();
        assert_matches!(err, BrowserError::Cdp(msg) if msg == "method not found");
    }

    #[tokio::test]
    async fn events_fanned_out_to_subscribers() {
        let url = fake_browser().await;
        let (ws, _) = connect_async(&url).await.unwrap();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let subscribers: EventSubscribers = Arc::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        subscribers.lock().extend([tx_a, tx_b]);
        let _handler = tokio::spawn(cdp_handler_loop(ws, cmd_rx, Arc::clone(&subscribers)));

        let (resp_tx, resp_rx) = oneshot::channel();
        cmd_tx
            .send(CdpCommand {
                method: "Target.setDiscoverTargets".into(),
                params: json!({"discover": true}),
                session_id: None,
                response_tx: resp_tx,
            })
            .await
            .unwrap();
        assert!(resp_rx.await.unwrap().is_ok());

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert_eq!(a.method, "Target.targetCreated");
        assert_eq!(b.params["targetInfo"]["targetId"], "T9");
    }

    #[tokio::test]
    async fn closed_connection_fails_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
        });
        let result = BrowserSession::connect(&format!("ws://{addr}")).await;
        assert!(result.is_err());
    }
}
