//! Viewer message dispatch.
//!
//! Parses an inbound text frame as a [`ClientMessage`] and applies it to the
//! scheduler on behalf of one connection. Failures are answered with an
//! `error` frame on the same connection; nothing here closes the socket.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, instrument, warn};

use conduit_core::{ClientMessage, SessionId};
use conduit_runtime::{AttachedSink, RuntimeError, SubmitRequest, TurnScheduler};

use super::connection::ClientConnection;

/// Handle one inbound text frame.
#[instrument(skip_all, fields(conn_id = %connection.id, kind))]
pub async fn handle_message(
    text: &str,
    connection: &Arc<ClientConnection>,
    scheduler: &Arc<TurnScheduler>,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "invalid viewer message");
            reply_error(connection, None, &format!("invalid message: {error}"));
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { session_id } => {
            let _ = tracing::Span::current().record("kind", "subscribe");
            rebind(connection, scheduler, session_id);
            let status = scheduler.subscribe(session_id, &connection.id, viewer(connection).sink);
            debug!(%session_id, ?status, "viewer subscribed");
        }
        ClientMessage::Stop { session_id } => {
            let _ = tracing::Span::current().record("kind", "stop");
            let Some(session_id) = session_id.or_else(|| connection.session_id()) else {
                reply_error(connection, None, "no session to stop");
                return;
            };
            if !scheduler.stop(session_id) {
                debug!(%session_id, "stop requested with no turn in flight");
            }
        }
        ClientMessage::Compress { session_id } => {
            let _ = tracing::Span::current().record("kind", "compress");
            let Some(session_id) = session_id.or_else(|| connection.session_id()) else {
                reply_error(connection, None, "no session to compress");
                return;
            };
            compress(connection, scheduler, session_id).await;
        }
        ClientMessage::Chat {
            session_id,
            content,
            work_dir,
        } => {
            let _ = tracing::Span::current().record("kind", "chat");
            chat(connection, scheduler, session_id, content, work_dir).await;
        }
        ClientMessage::Ping => {
            let _ = tracing::Span::current().record("kind", "ping");
            let _ = connection.send_json(&json!({
                "type": "pong",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }));
        }
    }
}

async fn chat(
    connection: &Arc<ClientConnection>,
    scheduler: &Arc<TurnScheduler>,
    session_id: Option<SessionId>,
    content: String,
    work_dir: Option<String>,
) {
    if content.trim().is_empty() {
        reply_error(connection, session_id, "message is empty");
        return;
    }

    let result = match session_id {
        Some(session_id) => {
            rebind(connection, scheduler, session_id);
            scheduler
                .submit_with_viewer(
                    SubmitRequest {
                        session_id,
                        query: content,
                        work_dir,
                        is_new_session: false,
                    },
                    Some(viewer(connection)),
                )
                .await
                .map(|outcome| (session_id, outcome))
        }
        None => {
            let created = scheduler
                .create_and_submit(&content, work_dir.as_deref(), Some(viewer(connection)))
                .await;
            if let Ok((session_id, _)) = &created {
                rebind(connection, scheduler, *session_id);
            }
            created
        }
    };

    match result {
        Ok((session_id, outcome)) => {
            debug!(%session_id, ?outcome, "chat accepted");
        }
        Err(RuntimeError::SessionNotFound(session_id)) => {
            reply_error(connection, Some(session_id), "session not found");
        }
        Err(error) => {
            warn!(%error, category = error.category(), "chat failed");
            reply_error(connection, session_id, &error.to_string());
        }
    }
}

async fn compress(
    connection: &Arc<ClientConnection>,
    scheduler: &Arc<TurnScheduler>,
    session_id: SessionId,
) {
    rebind(connection, scheduler, session_id);
    match scheduler.compress(session_id).await {
        Ok(_) => {
            let _ = scheduler.subscribe(session_id, &connection.id, viewer(connection).sink);
            debug!(%session_id, "session compressed");
        }
        Err(RuntimeError::SessionNotFound(session_id)) => {
            reply_error(connection, Some(session_id), "session not found");
        }
        Err(RuntimeError::SessionStreaming(session_id)) => {
            reply_error(connection, Some(session_id), "session is streaming");
        }
        Err(error) => {
            warn!(%error, category = error.category(), "compress failed");
            reply_error(connection, Some(session_id), &error.to_string());
        }
    }
}

fn viewer(connection: &Arc<ClientConnection>) -> AttachedSink {
    AttachedSink {
        id: connection.id.clone(),
        sink: Arc::clone(connection) as _,
    }
}

/// Bind the connection to `session_id`, detaching it from the stream of the
/// session it watched before.
fn rebind(connection: &ClientConnection, scheduler: &TurnScheduler, session_id: SessionId) {
    let Some(previous) = connection.bind_session(session_id) else {
        return;
    };
    if previous == session_id {
        return;
    }
    if let Some(stream) = scheduler.streams().get(previous) {
        if stream.detach(&connection.id) {
            debug!(%previous, %session_id, "viewer moved to another session");
        }
    }
}

fn reply_error(connection: &ClientConnection, session_id: Option<SessionId>, message: &str) {
    let _ = connection.send_json(&json!({
        "type": "error",
        "session_id": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "message": message,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use conduit_core::Role;
    use conduit_runtime::SessionStore;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use crate::testing::{FakeScript, scheduler};

    fn connection() -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        (Arc::new(ClientConnection::new("viewer_1".into(), tx)), rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no frame")
            .expect("channel closed");
        serde_json::from_str(&raw).unwrap()
    }

    async fn until_done(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let frame = next(rx).await;
            let done = frame["type"] == "done";
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn invalid_json_gets_error_frame() {
        let (sched, _) = scheduler(FakeScript::replying(&[]));
        let (conn, mut rx) = connection();
        handle_message("{not json", &conn, &sched).await;
        let frame = next(&mut rx).await;
        assert_eq!(frame["type"], "error");
        assert!(frame["message"].as_str().unwrap().starts_with("invalid message"));
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let (sched, _) = scheduler(FakeScript::replying(&[]));
        let (conn, mut rx) = connection();
        handle_message(r#"{"type":"ping"}"#, &conn, &sched).await;
        assert_eq!(next(&mut rx).await["type"], "pong");
    }

    #[tokio::test]
    async fn subscribe_to_idle_session_acknowledges_idle() {
        let (sched, _) = scheduler(FakeScript::replying(&[]));
        let (conn, mut rx) = connection();
        handle_message(r#"{"type":"subscribe","session_id":9}"#, &conn, &sched).await;
        let frame = next(&mut rx).await;
        assert_eq!(frame["type"], "streaming_status");
        assert_eq!(frame["status"], "idle");
        assert_eq!(frame["session_id"], 9);
        assert_eq!(conn.session_id(), Some(SessionId::new(9)));
    }

    #[tokio::test]
    async fn chat_without_session_creates_one_and_streams() {
        let (sched, store) = scheduler(FakeScript::replying(&["Hel", "lo"]));
        let (conn, mut rx) = connection();
        handle_message(r#"{"type":"chat","content":"hello there"}"#, &conn, &sched).await;

        let frames = until_done(&mut rx).await;
        let kinds: Vec<_> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["chunk", "chunk", "done"]);
        let session_id = conn.session_id().expect("bound to new session");
        assert_eq!(frames[0]["session_id"], session_id.get());

        tokio::time::timeout(Duration::from_secs(5), async {
            while sched.has_running_turns() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let messages = store.messages(session_id);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello there");
        assert_eq!(messages[1].content, "Hello");
    }

    #[tokio::test]
    async fn chat_to_missing_session_is_an_error() {
        let (sched, _) = scheduler(FakeScript::replying(&[]));
        let (conn, mut rx) = connection();
        handle_message(r#"{"type":"chat","session_id":42,"content":"hi"}"#, &conn, &sched).await;
        let frame = next(&mut rx).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["session_id"], 42);
        assert_eq!(frame["message"], "session not found");
    }

    #[tokio::test]
    async fn empty_chat_is_rejected() {
        let (sched, store) = scheduler(FakeScript::replying(&[]));
        let (conn, mut rx) = connection();
        handle_message(r#"{"type":"chat","content":"   "}"#, &conn, &sched).await;
        assert_eq!(next(&mut rx).await["message"], "message is empty");
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn stop_defaults_to_bound_session() {
        let (sched, store) = scheduler(FakeScript::holding());
        let session = store.create_session("s", None).await.unwrap();
        let (conn, mut rx) = connection();

        let chat = format!(r#"{{"type":"chat","session_id":{},"content":"work"}}"#, session.id);
        handle_message(&chat, &conn, &sched).await;
        assert!(sched.streams().is_streaming(session.id));

        handle_message(r#"{"type":"stop"}"#, &conn, &sched).await;
        let frames = until_done(&mut rx).await;
        assert!(frames.iter().all(|f| f["type"] != "error"));
    }

    #[tokio::test]
    async fn stop_without_any_session_is_an_error() {
        let (sched, _) = scheduler(FakeScript::replying(&[]));
        let (conn, mut rx) = connection();
        handle_message(r#"{"type":"stop"}"#, &conn, &sched).await;
        assert_eq!(next(&mut rx).await["message"], "no session to stop");
    }

    #[tokio::test]
    async fn compress_streams_recap_turn_to_bound_viewer() {
        let (sched, store) = scheduler(FakeScript::replying(&["resumed"]));
        let session = store.create_session("s", None).await.unwrap();
        let _ = store
            .append_message(session.id, Role::User, "earlier question", None)
            .await
            .unwrap();
        let (conn, mut rx) = connection();

        let compress = format!(r#"{{"type":"compress","session_id":{}}}"#, session.id);
        handle_message(&compress, &conn, &sched).await;
        let frames = until_done(&mut rx).await;
        assert!(frames.iter().all(|f| f["type"] != "error"));
        assert_eq!(conn.session_id(), Some(session.id));

        tokio::time::timeout(Duration::from_secs(5), async {
            while sched.has_running_turns() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let contents: Vec<_> = store
            .messages(session.id)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents.len(), 3);
        assert!(contents[1].contains("compressed"));
        assert_eq!(contents[2], "resumed");
    }

    #[tokio::test]
    async fn compress_while_streaming_is_an_error() {
        let (sched, store) = scheduler(FakeScript::holding());
        let session = store.create_session("s", None).await.unwrap();
        let (conn, mut rx) = connection();

        let chat = format!(r#"{{"type":"chat","session_id":{},"content":"work"}}"#, session.id);
        handle_message(&chat, &conn, &sched).await;
        handle_message(r#"{"type":"compress"}"#, &conn, &sched).await;

        let frame = next(&mut rx).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "session is streaming");
        assert!(sched.stop(session.id));
    }

    #[tokio::test]
    async fn switching_sessions_detaches_from_previous_stream() {
        let (sched, store) = scheduler(FakeScript::holding());
        let busy = store.create_session("busy", None).await.unwrap();
        let (conn, mut rx) = connection();

        let chat = format!(r#"{{"type":"chat","session_id":{},"content":"work"}}"#, busy.id);
        handle_message(&chat, &conn, &sched).await;
        let stream = sched.streams().get(busy.id).unwrap();
        assert_eq!(stream.attached().map(|a| a.id), Some("viewer_1".to_string()));

        handle_message(r#"{"type":"subscribe","session_id":77}"#, &conn, &sched).await;
        assert!(stream.attached().is_none());
        assert_eq!(next(&mut rx).await["status"], "idle");

        assert!(sched.stop(busy.id));
    }
}
