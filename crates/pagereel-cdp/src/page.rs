//! [`CdpPage`]: a browser tab (plus the tabs it opens) behind the
//! [`ScreencastPage`] seam.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use pagereel_core::{
    PageEvent, PageId, RecorderError, ScreencastOptions, ScreencastPage, TargetId, Viewport,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BrowserError;
use crate::protocol::{CdpEvent, TargetTable, Translation, screencast_params};
use crate::session::BrowserSession;

type PageSubscribers = parking_lot::Mutex<Vec<mpsc::UnboundedSender<PageEvent>>>;

/// State shared between the page handle and its event pump.
struct PageState {
    targets: parking_lot::Mutex<TargetTable>,
    subscribers: PageSubscribers,
}

impl PageState {
    fn emit(&self, event: &PageEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// A page opened through [`BrowserSession::new_page`].
pub struct CdpPage {
    id: PageId,
    main_target: TargetId,
    browser: Arc<BrowserSession>,
    state: Arc<PageState>,
    pump: JoinHandle<()>,
}

impl CdpPage {
    pub(crate) fn new(browser: Arc<BrowserSession>, main_target: TargetId, session_id: String) -> Self {
        let state = Arc::new(PageState {
            targets: parking_lot::Mutex::new(TargetTable::new(main_target.clone(), session_id)),
            subscribers: parking_lot::Mutex::new(Vec::new()),
        });
        let events = browser.subscribe_events();
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(&browser),
            Arc::clone(&state),
            events,
        ));
        Self {
            id: PageId::new(),
            main_target,
            browser,
            state,
            pump,
        }
    }

    /// Navigate the main target to `url`.
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let session = self.session_for(&self.main_target)?;
        let result = self
            .browser
            .send_cdp("Page.navigate", json!({ "url": url }), Some(&session))
            .await
            .map_err(|e| BrowserError::NavigationFailed {
                url: url.into(),
                reason: e.to_string(),
            })?;
        if let Some(reason) = result["errorText"].as_str() {
            return Err(BrowserError::NavigationFailed {
                url: url.into(),
                reason: reason.into(),
            });
        }
        Ok(())
    }

    /// Evaluate a script in the main target and return its value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let session = self.session_for(&self.main_target)?;
        let mut result = self
            .browser
            .send_cdp(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
                Some(&session),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let msg = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("evaluation error");
            return Err(BrowserError::Cdp(msg.into()));
        }
        Ok(result["result"]["value"].take())
    }

    fn session_for(&self, target: &TargetId) -> Result<String, BrowserError> {
        self.state
            .targets
            .lock()
            .session_for(target)
            .map(String::from)
            .ok_or_else(|| BrowserError::TargetNotFound {
                target_id: target.to_string(),
            })
    }

    /// Session for `target`, re-attaching if the previous one was detached.
    async fn ensure_session(&self, target: &TargetId) -> Result<String, BrowserError> {
        let live = {
            let targets = self.state.targets.lock();
            if let Some(sid) = targets.session_for(target) {
                return Ok(sid.to_string());
            }
            targets.is_live(target)
        };
        if !live {
            return Err(BrowserError::TargetNotFound {
                target_id: target.to_string(),
            });
        }
        debug!(target_id = %target, "re-attaching to target");
        let sid = self.browser.attach(target.as_str()).await?;
        self.state.targets.lock().bind(target.clone(), sid.clone());
        Ok(sid)
    }
}

/// Viewport from a `Page.getLayoutMetrics` result.
///
/// `cssVisualViewport` is in CSS pixels and `visualViewport` in device
/// pixels; their width ratio is the device scale factor. Older browsers only
/// send `visualViewport`, which is then taken at scale 1.
fn viewport_from_metrics(metrics: &Value) -> Viewport {
    let css = &metrics["cssVisualViewport"];
    let device = &metrics["visualViewport"];
    let width_of = |vp: &Value| vp["clientWidth"].as_f64().filter(|w| *w > 0.0);
    let height_of = |vp: &Value| vp["clientHeight"].as_f64().filter(|h| *h > 0.0);

    let (width, height, device_scale_factor) = match (width_of(css), height_of(css)) {
        (Some(w), Some(h)) => {
            let dpr = width_of(device).map_or(1.0, |dw| dw / w);
            (w, h, dpr)
        }
        _ => (
            width_of(device).unwrap_or(0.0),
            height_of(device).unwrap_or(0.0),
            1.0,
        ),
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let px = |v: f64| v.round() as u32;
    Viewport {
        width: px(width),
        height: px(height),
        device_scale_factor,
    }
}

impl Drop for CdpPage {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl ScreencastPage for CdpPage {
    fn page_id(&self) -> PageId {
        self.id.clone()
    }

    fn main_target(&self) -> TargetId {
        self.main_target.clone()
    }

    async fn viewport(&self) -> pagereel_core::Result<Viewport> {
        let session = self.session_for(&self.main_target)?;
        let metrics = self
            .browser
            .send_cdp("Page.getLayoutMetrics", json!({}), Some(&session))
            .await?;
        let viewport = viewport_from_metrics(&metrics);
        if viewport.width == 0 || viewport.height == 0 {
            return Err(RecorderError::Browser("page reported an empty viewport".into()));
        }
        Ok(viewport)
    }

    async fn start_screencast(
        &self,
        target: &TargetId,
        opts: &ScreencastOptions,
    ) -> pagereel_core::Result<()> {
        let session = self.ensure_session(target).await?;
        let _ = self
            .browser
            .send_cdp("Page.startScreencast", screencast_params(opts), Some(&session))
            .await
            .map_err(|e| BrowserError::ScreencastFailed(e.to_string()))?;
        debug!(target_id = %target, "screencast started");
        Ok(())
    }

    async fn stop_screencast(&self, target: &TargetId) -> pagereel_core::Result<()> {
        // A detached or closed target has no screencast left to stop.
        let Ok(session) = self.session_for(target) else {
            return Ok(());
        };
        let _ = self
            .browser
            .send_cdp("Page.stopScreencast", json!({}), Some(&session))
            .await?;
        debug!(target_id = %target, "screencast stopped");
        Ok(())
    }

    async fn ack_frame(&self, target: &TargetId, ack_id: i64) -> pagereel_core::Result<()> {
        let session = self.session_for(target)?;
        let _ = self
            .browser
            .send_cdp(
                "Page.screencastFrameAck",
                json!({ "sessionId": ack_id }),
                Some(&session),
            )
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.subscribers.lock().push(tx);
        rx
    }
}

/// Translate raw CDP events into page events for one page.
async fn pump_events(
    browser: Weak<BrowserSession>,
    state: Arc<PageState>,
    mut events: mpsc::UnboundedReceiver<CdpEvent>,
) {
    while let Some(event) = events.recv().await {
        let translation = state.targets.lock().translate(&event);
        match translation {
            Translation::Emit(page_event) => state.emit(&page_event),
            Translation::Adopt {
                target_id,
                opener_id,
            } => {
                let Some(browser) = browser.upgrade() else { break };
                match browser.attach(target_id.as_str()).await {
                    Ok(sid) => {
                        state.targets.lock().bind(target_id.clone(), sid);
                        debug!(target_id = %target_id, opener_id = %opener_id, "attached to new tab");
                        state.emit(&PageEvent::TargetCreated {
                            target_id,
                            opener_id: Some(opener_id),
                        });
                    }
                    Err(e) => {
                        warn!(target_id = %target_id, error = %e, "failed to attach to new tab");
                    }
                }
            }
            Translation::Ignore => {}
        }
    }
    state.subscribers.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// DevTools stand-in that plays out one page, one screencast frame and
    /// a popup that opens and closes.
    async fn scripted_browser() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut tx, mut rx) = ws.split();
            while let Some(Ok(Message::Text(text))) = rx.next().await {
                let cmd: Value = serde_json::from_str(&text).unwrap();
                let id = cmd["id"].as_u64().unwrap();
                let method = cmd["method"].as_str().unwrap().to_string();
                let result = match method.as_str() {
                    "Target.createTarget" => json!({"targetId": "T1"}),
                    "Target.attachToTarget" => {
                        let sid = format!("S-{}", cmd["params"]["targetId"].as_str().unwrap());
                        json!({"sessionId": sid})
                    }
                    "Page.getLayoutMetrics" => {
                        json!({"cssVisualViewport": {"clientWidth": 800.0, "clientHeight": 600.0}})
                    }
                    "Page.navigate" if cmd["params"]["url"] == "bad://" => {
                        json!({"frameId": "F1", "errorText": "net::ERR_ABORTED"})
                    }
                    _ => json!({}),
                };
                let reply = json!({"id": id, "result": result});
                tx.send(Message::Text(reply.to_string().into())).await.unwrap();

                let events: Vec<Value> = match method.as_str() {
                    "Page.startScreencast" if cmd["sessionId"] == "S-T1" => vec![
                        json!({
                            "method": "Page.screencastFrame",
                            "sessionId": "S-T1",
                            "params": {"data": "aGVsbG8=", "sessionId": 1,
                                       "metadata": {"deviceWidth": 800, "deviceHeight": 600, "timestamp": 2.0}}
                        }),
                        json!({
                            "method": "Target.targetCreated",
                            "params": {"targetInfo": {"targetId": "T2", "type": "page", "openerId": "T1"}}
                        }),
                    ],
                    "Page.enable" if cmd["sessionId"] == "S-T2" => vec![json!({
                        "method": "Target.targetDestroyed",
                        "params": {"targetId": "T2"}
                    })],
                    _ => vec![],
                };
                for event in events {
                    tx.send(Message::Text(event.to_string().into())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    async fn open_page() -> CdpPage {
        let url = scripted_browser().await;
        let browser = Arc::new(BrowserSession::connect(&url).await.unwrap());
        browser.new_page("about:blank").await.unwrap()
    }

    #[tokio::test]
    async fn viewport_reads_layout_metrics() {
        let page = open_page().await;
        assert_eq!(page.main_target(), TargetId::from("T1"));
        let vp = page.viewport().await.unwrap();
        assert_eq!(vp, Viewport::new(800, 600));
    }

    #[test]
    fn high_dpi_metrics_carry_scale_factor() {
        let vp = viewport_from_metrics(&json!({
            "cssVisualViewport": {"clientWidth": 640.0, "clientHeight": 360.0},
            "visualViewport": {"clientWidth": 1280.0, "clientHeight": 720.0},
        }));
        assert_eq!(vp.width, 640);
        assert_eq!(vp.height, 360);
        assert!((vp.device_scale_factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn legacy_metrics_fall_back_to_visual_viewport() {
        let vp = viewport_from_metrics(&json!({
            "visualViewport": {"clientWidth": 1024.0, "clientHeight": 768.0},
        }));
        assert_eq!(vp, Viewport::new(1024, 768));

        let empty = viewport_from_metrics(&json!({}));
        assert_eq!((empty.width, empty.height), (0, 0));
    }

    #[tokio::test]
    async fn navigation_error_text_is_an_error() {
        let page = open_page().await;
        let err = page.navigate("bad://").await.unwrap_err();
        assert!(matches!(err, BrowserError::NavigationFailed { .. }));
        page.navigate("https://example.com").await.unwrap();
    }

    #[tokio::test]
    async fn screencast_events_flow_to_subscribers() {
        let page = open_page().await;
        let mut events = page.subscribe();
        page.start_screencast(&page.main_target(), &ScreencastOptions::default())
            .await
            .unwrap();

        let PageEvent::Frame(frame) = events.recv().await.unwrap() else {
            panic!("expected a frame first");
        };
        assert_eq!(frame.target_id, TargetId::from("T1"));
        assert_eq!(frame.ack_id, 1);
        assert_eq!(frame.metadata.timestamp_ms(), Some(2000));
        page.ack_frame(&frame.target_id, frame.ack_id).await.unwrap();

        let created = events.recv().await.unwrap();
        assert!(matches!(
            created,
            PageEvent::TargetCreated { ref target_id, opener_id: Some(ref opener) }
                if *target_id == TargetId::from("T2") && *opener == TargetId::from("T1")
        ));
        let destroyed = events.recv().await.unwrap();
        assert!(matches!(
            destroyed,
            PageEvent::TargetDestroyed { ref target_id } if *target_id == TargetId::from("T2")
        ));
    }

    #[tokio::test]
    async fn unknown_target_operations() {
        let page = open_page().await;
        let ghost = TargetId::from("T-gone");
        assert!(page.stop_screencast(&ghost).await.is_ok());
        assert!(page.ack_frame(&ghost, 1).await.is_err());
        assert!(
            page.start_screencast(&ghost, &ScreencastOptions::default())
                .await
                .is_err()
        );
    }
}
