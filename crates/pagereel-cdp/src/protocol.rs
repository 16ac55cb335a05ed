//! Wire-level CDP messages and their translation into [`PageEvent`]s.
//!
//! Everything here is synchronous and free of I/O so the routing rules can
//! be tested without a browser.

use std::collections::{HashMap, HashSet};

use pagereel_core::{FrameMetadata, PageEvent, ScreencastFrame, ScreencastOptions, TargetId};
use serde_json::{Value, json};

/// A CDP event (a message with `method` and no `id`).
#[derive(Clone, Debug)]
pub struct CdpEvent {
    /// Event name, e.g. `Page.screencastFrame`.
    pub method: String,
    /// Event parameters.
    pub params: Value,
    /// Flat-mode session the event belongs to; `None` for browser-level events.
    pub session_id: Option<String>,
}

/// A decoded inbound message.
#[derive(Debug)]
pub enum Inbound {
    /// Response to the command with the given id.
    Response {
        /// Command id.
        id: u64,
        /// `result` on success, the error message otherwise.
        result: Result<Value, String>,
    },
    /// An unsolicited event.
    Event(CdpEvent),
}

/// Decode one text frame from the DevTools socket.
///
/// Returns `None` for anything that is neither a response nor an event.
pub fn parse_inbound(text: &str) -> Option<Inbound> {
    let mut val: Value = serde_json::from_str(text).ok()?;
    if let Some(id) = val.get("id").and_then(Value::as_u64) {
        let result = match val.get("error") {
            Some(err) => Err(err["message"].as_str().unwrap_or("CDP error").to_string()),
            None => Ok(val["result"].take()),
        };
        return Some(Inbound::Response { id, result });
    }
    let method = val.get("method")?.as_str()?.to_string();
    let session_id = val
        .get("sessionId")
        .and_then(Value::as_str)
        .map(String::from);
    Some(Inbound::Event(CdpEvent {
        method,
        params: val["params"].take(),
        session_id,
    }))
}

/// Build an outbound command message.
pub fn command_message(id: u64, method: &str, params: &Value, session_id: Option<&str>) -> Value {
    let mut msg = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(sid) = session_id {
        msg["sessionId"] = Value::String(sid.to_string());
    }
    msg
}

/// Parameters for `Page.startScreencast`.
pub fn screencast_params(opts: &ScreencastOptions) -> Value {
    json!({
        "format": opts.format.as_str(),
        "quality": opts.quality,
        "maxWidth": opts.max_width,
        "maxHeight": opts.max_height,
        "everyNthFrame": opts.every_nth_frame,
    })
}

/// What the page should do with a CDP event.
#[derive(Debug)]
pub enum Translation {
    /// Deliver this event to subscribers.
    Emit(PageEvent),
    /// A page opened by one of ours appeared: attach to it, then announce it.
    Adopt {
        /// The new target.
        target_id: TargetId,
        /// The page that opened it.
        opener_id: TargetId,
    },
    /// Not relevant to this page.
    Ignore,
}

/// Targets that belong to one page handle and their flat-mode sessions.
#[derive(Debug, Default)]
pub struct TargetTable {
    live: HashSet<TargetId>,
    sessions: HashMap<TargetId, String>,
    by_session: HashMap<String, TargetId>,
}

impl TargetTable {
    /// Table seeded with the page's own target.
    pub fn new(main: TargetId, session_id: String) -> Self {
        let mut table = Self::default();
        let _ = table.live.insert(main.clone());
        table.bind(main, session_id);
        table
    }

    /// Record a flat-mode session for `target`.
    pub fn bind(&mut self, target: TargetId, session_id: String) {
        if let Some(old) = self.sessions.insert(target.clone(), session_id.clone()) {
            let _ = self.by_session.remove(&old);
        }
        let _ = self.by_session.insert(session_id, target.clone());
        let _ = self.live.insert(target);
    }

    /// Session attached to `target`, if any.
    pub fn session_for(&self, target: &TargetId) -> Option<&str> {
        self.sessions.get(target).map(String::as_str)
    }

    /// Whether `target` belongs to this page and has not been destroyed.
    pub fn is_live(&self, target: &TargetId) -> bool {
        self.live.contains(target)
    }

    fn unbind_session(&mut self, session_id: &str) -> Option<TargetId> {
        let target = self.by_session.remove(session_id)?;
        let _ = self.sessions.remove(&target);
        Some(target)
    }

    /// Route one CDP event.
    pub fn translate(&mut self, event: &CdpEvent) -> Translation {
        let params = &event.params;
        match event.method.as_str() {
            "Target.targetCreated" => {
                let info = &params["targetInfo"];
                if info["type"].as_str() != Some("page") {
                    return Translation::Ignore;
                }
                let (Some(target), Some(opener)) =
                    (info["targetId"].as_str(), info["openerId"].as_str())
                else {
                    return Translation::Ignore;
                };
                let opener_id = TargetId::from(opener);
                if !self.live.contains(&opener_id) {
                    return Translation::Ignore;
                }
                let target_id = TargetId::from(target);
                let _ = self.live.insert(target_id.clone());
                Translation::Adopt {
                    target_id,
                    opener_id,
                }
            }
            "Target.targetDestroyed" => {
                let Some(target) = params["targetId"].as_str() else {
                    return Translation::Ignore;
                };
                let target_id = TargetId::from(target);
                if !self.live.remove(&target_id) {
                    return Translation::Ignore;
                }
                if let Some(sid) = self.sessions.remove(&target_id) {
                    let _ = self.by_session.remove(&sid);
                }
                Translation::Emit(PageEvent::TargetDestroyed { target_id })
            }
            "Target.detachedFromTarget" => {
                let Some(sid) = params["sessionId"].as_str() else {
                    return Translation::Ignore;
                };
                match self.unbind_session(sid) {
                    Some(target_id) if self.live.contains(&target_id) => {
                        Translation::Emit(PageEvent::Navigated {
                            target_id,
                            url: None,
                            screencast_ended: true,
                        })
                    }
                    _ => Translation::Ignore,
                }
            }
            "Page.screencastFrame" => {
                let Some(target_id) = self.event_target(event) else {
                    return Translation::Ignore;
                };
                let (Some(data), Some(ack_id)) =
                    (params["data"].as_str(), params["sessionId"].as_i64())
                else {
                    return Translation::Ignore;
                };
                let metadata: FrameMetadata =
                    serde_json::from_value(params["metadata"].clone()).unwrap_or_default();
                Translation::Emit(PageEvent::Frame(ScreencastFrame {
                    target_id,
                    ack_id,
                    data: data.to_string(),
                    metadata,
                }))
            }
            "Page.frameNavigated" => {
                let frame = &params["frame"];
                if frame.get("parentId").is_some_and(|p| !p.is_null()) {
                    return Translation::Ignore;
                }
                let Some(target_id) = self.event_target(event) else {
                    return Translation::Ignore;
                };
                Translation::Emit(PageEvent::Navigated {
                    target_id,
                    url: frame["url"].as_str().map(String::from),
                    screencast_ended: false,
                })
            }
            _ => Translation::Ignore,
        }
    }

    fn event_target(&self, event: &CdpEvent) -> Option<TargetId> {
        let sid = event.session_id.as_deref()?;
        self.by_session.get(sid).cloned()
    }
}
