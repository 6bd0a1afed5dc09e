//! The paired message-posting channel: the table through which a POST
//! handler hands a translated response frame to the SSE writer task
//! streaming that session.

use dashmap::DashMap;
use mcpbridge_core::translator::RemoteFrame;
use tokio::sync::mpsc;

const FRAME_CHANNEL_DEPTH: usize = 64;

/// Registers one outbound channel per active SSE connection, keyed by
/// session id. The stream handler registers on connect and deregisters
/// on disconnect; POST handlers only ever look a sender up by id.
#[derive(Default)]
pub struct Outbox {
    senders: DashMap<String, mpsc::Sender<RemoteFrame>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for `session_id`, returning the receiver half for
    /// the SSE writer to drain. Replaces any prior channel for the same
    /// id (a reconnect supersedes the old stream).
    pub fn register(&self, session_id: &str) -> mpsc::Receiver<RemoteFrame> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);
        self.senders.insert(session_id.to_string(), tx);
        rx
    }

    pub fn remove(&self, session_id: &str) {
        self.senders.remove(session_id);
    }

    /// Deliver `frame` to the session's stream. Returns `false` when no
    /// connection is open for this session (the caller has disconnected
    /// or never connected), which the handler treats as the request
    /// having nowhere to be answered.
    pub async fn send(&self, session_id: &str, frame: RemoteFrame) -> bool {
        let Some(tx) = self.senders.get(session_id).map(|e| e.clone()) else {
            return false;
        };
        tx.send(frame).await.is_ok()
    }

    pub fn has_connection(&self, session_id: &str) -> bool {
        self.senders.contains_key(session_id)
    }
}
