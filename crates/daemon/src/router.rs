//! Message router for dispatching incoming messages to the session manager.
//!
//! This module provides the `MessageRouter` struct that receives protocol
//! messages and maps them onto session manager operations, turning results
//! into reply messages and failures into `ErrorMessage`s.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use protocol::messages::{
    Ack, ErrorCode, ErrorMessage, Message, Ping, Pong, SessionKill, SessionKilled, SessionList,
    SessionListing, SessionOutput, SessionRead, SessionResize, SessionSendKeys, SessionSpawn,
    SessionSpawned,
};
use tracing::{debug, info, warn};

use crate::session::{SessionError, SessionManager, SpawnOptions};

/// Longest wait a single read may request.
pub const MAX_READ_WAIT_MS: u64 = 60_000;

/// Result type for router operations.
pub type RouterResult = Result<Option<Message>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Convert the error to a protocol ErrorMessage.
    pub fn to_error_message(&self, context: Option<String>) -> ErrorMessage {
        let (code, recoverable) = match self {
            RouterError::Session(e) => match e {
                SessionError::NotFound(_) => (ErrorCode::NotFound, false),
                SessionError::SpawnFailed(_) => (ErrorCode::SpawnFailed, false),
                SessionError::LimitReached(_) => (ErrorCode::LimitReached, true),
                SessionError::WriteFailed(_) => (ErrorCode::InternalError, true),
                SessionError::SignalFailed(_) => (ErrorCode::InternalError, true),
                SessionError::ResizeFailed(_) => (ErrorCode::InternalError, true),
                SessionError::Io(_) => (ErrorCode::InternalError, true),
            },
            RouterError::InvalidRequest(_) => (ErrorCode::InvalidRequest, false),
        };

        ErrorMessage {
            code,
            message: self.to_string(),
            context,
            recoverable,
        }
    }
}

/// Session id a request targets, used as error context.
fn request_context(message: &Message) -> Option<String> {
    match message {
        Message::SessionSendKeys(req) => Some(req.session_id.clone()),
        Message::SessionRead(req) => Some(req.session_id.clone()),
        Message::SessionKill(req) => Some(req.session_id.clone()),
        Message::SessionResize(req) => Some(req.session_id.clone()),
        _ => None,
    }
}

/// Message router that dispatches messages to the session manager.
pub struct MessageRouter<S: SessionManager> {
    /// Session manager backing every session operation.
    session_manager: Arc<S>,
}

impl<S: SessionManager> MessageRouter<S> {
    /// Create a new message router over `session_manager`.
    pub fn new(session_manager: Arc<S>) -> Self {
        Self { session_manager }
    }

    /// The session manager behind this router.
    pub fn session_manager(&self) -> &Arc<S> {
        &self.session_manager
    }

    /// Route a request and always produce a reply.
    ///
    /// Errors become `Message::Error` carrying the targeted session id as
    /// context; requests without a reply become an `InvalidRequest` error.
    pub async fn handle(&self, message: Message) -> Message {
        let context = request_context(&message);
        match self.route(message).await {
            Ok(Some(reply)) => reply,
            Ok(None) => Message::Error(
                RouterError::InvalidRequest("message does not expect a reply".to_string())
                    .to_error_message(context),
            ),
            Err(e) => {
                debug!(error = %e, "Request failed");
                Message::Error(e.to_error_message(context))
            }
        }
    }

    /// Route a message to its handler.
    pub async fn route(&self, message: Message) -> RouterResult {
        debug!(?message, "Routing message");

        match message {
            // Session requests
            Message::SessionSpawn(req) => self.handle_session_spawn(req).await,
            Message::SessionSendKeys(req) => self.handle_session_send_keys(req).await,
            Message::SessionRead(req) => self.handle_session_read(req).await,
            Message::SessionKill(req) => self.handle_session_kill(req).await,
            Message::SessionResize(req) => self.handle_session_resize(req).await,
            Message::SessionList(req) => self.handle_session_list(req),

            // Control messages
            Message::Ping(ping) => self.handle_ping(ping),
            Message::Status | Message::Shutdown => Err(RouterError::InvalidRequest(
                "daemon control messages are not routed to sessions".to_string(),
            )),

            Message::SessionSpawned(_)
            | Message::SessionOutput(_)
            | Message::SessionKilled(_)
            | Message::SessionListing(_)
            | Message::Ack(_)
            | Message::StatusReport(_)
            | Message::ShuttingDown => Err(RouterError::InvalidRequest(
                "response message received as request".to_string(),
            )),
            Message::Pong(_) => {
                debug!("Received pong");
                Ok(None)
            }
            Message::Error(err) => {
                warn!(?err, "Received error from peer");
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Session Handlers
    // =========================================================================

    async fn handle_session_spawn(&self, req: SessionSpawn) -> RouterResult {
        let settings = self.session_manager.settings();
        let options = SpawnOptions {
            command: req.command,
            cwd: req.cwd.map(PathBuf::from),
            env: req.env,
            cols: req.cols.unwrap_or(settings.default_cols),
            rows: req.rows.unwrap_or(settings.default_rows),
            terminal: req.terminal.unwrap_or(settings.default_terminal),
        };

        if options.cols == 0 || options.rows == 0 {
            return Err(RouterError::InvalidRequest(format!(
                "terminal size must be non-zero, got {}x{}",
                options.cols, options.rows
            )));
        }

        debug!(
            command = %options.command,
            cwd = ?options.cwd,
            terminal = %options.terminal,
            "Spawning session"
        );

        let (session_id, pid) = self.session_manager.spawn(options).await?;

        Ok(Some(Message::SessionSpawned(SessionSpawned { session_id, pid })))
    }

    async fn handle_session_send_keys(&self, req: SessionSendKeys) -> RouterResult {
        self.session_manager
            .send_keys(&req.session_id, &req.keys)
            .await?;

        Ok(Some(Message::Ack(Ack::ok(req.session_id))))
    }

    async fn handle_session_read(&self, req: SessionRead) -> RouterResult {
        if let Some(wait_ms) = req.wait_ms {
            if wait_ms > MAX_READ_WAIT_MS {
                return Err(RouterError::InvalidRequest(format!(
                    "wait_ms must be at most {MAX_READ_WAIT_MS}, got {wait_ms}"
                )));
            }
        }

        let snapshot = self
            .session_manager
            .read(&req.session_id, req.wait_ms.map(Duration::from_millis), req.clear)
            .await?;

        Ok(Some(Message::SessionOutput(SessionOutput {
            session_id: req.session_id,
            content: snapshot.content,
            lines: snapshot.lines,
            has_more: snapshot.has_more,
            dropped: snapshot.dropped,
        })))
    }

    async fn handle_session_kill(&self, req: SessionKill) -> RouterResult {
        info!(
            session_id = %req.session_id,
            signal = %req.signal,
            "Killing session"
        );

        let outcome = self
            .session_manager
            .kill(&req.session_id, req.signal)
            .await?;

        Ok(Some(Message::SessionKilled(SessionKilled {
            session_id: req.session_id,
            success: true,
            exit_code: outcome.exit.and_then(|e| e.code),
            signal: outcome.exit.and_then(|e| e.signal),
        })))
    }

    async fn handle_session_resize(&self, req: SessionResize) -> RouterResult {
        if req.cols == 0 || req.rows == 0 {
            return Err(RouterError::InvalidRequest(format!(
                "terminal size must be non-zero, got {}x{}",
                req.cols, req.rows
            )));
        }

        self.session_manager
            .resize(&req.session_id, req.cols, req.rows)
            .await?;

        Ok(Some(Message::Ack(Ack::ok(req.session_id))))
    }

    fn handle_session_list(&self, req: SessionList) -> RouterResult {
        let sessions = self.session_manager.list(req.verbose);
        debug!(count = sessions.len(), verbose = req.verbose, "Listing sessions");

        Ok(Some(Message::SessionListing(SessionListing { sessions })))
    }

    // =========================================================================
    // Control Handlers
    // =========================================================================

    fn handle_ping(&self, ping: Ping) -> RouterResult {
        debug!(timestamp = ping.timestamp, "Received ping");

        Ok(Some(Message::Pong(Pong {
            timestamp: ping.timestamp,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BufferSnapshot, ExitInfo, KillOutcome, SessionId, SessionSettings};
    use protocol::messages::SessionSummary;
    use protocol::{KillSignal, TerminalMode};
    use std::sync::Mutex;

    /// Mock session manager for testing.
    #[derive(Default)]
    struct MockSessionManager {
        should_fail: bool,
        settings: SessionSettings,
        last_spawn: Mutex<Option<SpawnOptions>>,
        last_read: Mutex<Option<(Option<Duration>, bool)>>,
    }

    impl MockSessionManager {
        fn new() -> Self {
            Self::default()
        }

        fn failing() -> Self {
            Self {
                should_fail: true,
                ..Self::default()
            }
        }
    }

    impl SessionManager for MockSessionManager {
        async fn spawn(&self, options: SpawnOptions) -> Result<(SessionId, u32), SessionError> {
            if self.should_fail {
                return Err(SessionError::SpawnFailed("Mock failure".to_string()));
            }
            *self.last_spawn.lock().unwrap() = Some(options);
            Ok(("test-session-123".to_string(), 12345))
        }

        async fn send_keys(&self, session_id: &str, keys: &str) -> Result<usize, SessionError> {
            if self.should_fail {
                Err(SessionError::NotFound(session_id.to_string()))
            } else {
                Ok(keys.len())
            }
        }

        async fn read(
            &self,
            session_id: &str,
            wait: Option<Duration>,
            clear: bool,
        ) -> Result<BufferSnapshot, SessionError> {
            if self.should_fail {
                return Err(SessionError::NotFound(session_id.to_string()));
            }
            *self.last_read.lock().unwrap() = Some((wait, clear));
            Ok(BufferSnapshot {
                content: "hi\n".to_string(),
                lines: 1,
                has_more: true,
                dropped: 0,
            })
        }

        async fn kill(
            &self,
            session_id: &str,
            _signal: KillSignal,
        ) -> Result<KillOutcome, SessionError> {
            if self.should_fail {
                Err(SessionError::NotFound(session_id.to_string()))
            } else {
                Ok(KillOutcome {
                    exit: Some(ExitInfo {
                        code: None,
                        signal: Some(15),
                    }),
                })
            }
        }

        async fn resize(&self, session_id: &str, _cols: u16, _rows: u16) -> Result<(), SessionError> {
            if self.should_fail {
                Err(SessionError::NotFound(session_id.to_string()))
            } else {
                Ok(())
            }
        }

        fn list(&self, verbose: bool) -> Vec<SessionSummary> {
            vec![SessionSummary {
                id: "test-session-123".to_string(),
                pid: 12345,
                command: "sh".to_string(),
                cwd: "/".to_string(),
                created_at: 1,
                last_activity: 2,
                details: verbose.then(|| protocol::messages::SessionDetails {
                    cols: 80,
                    rows: 24,
                    terminal: TerminalMode::Pipe,
                    state: protocol::SessionState::Running,
                    buffered_lines: 0,
                }),
            }]
        }

        fn exists(&self, _session_id: &str) -> bool {
            !self.should_fail
        }

        fn count(&self) -> usize {
            1
        }

        fn settings(&self) -> &SessionSettings {
            &self.settings
        }
    }

    fn create_test_router() -> MessageRouter<MockSessionManager> {
        MessageRouter::new(Arc::new(MockSessionManager::new()))
    }

    // =========================================================================
    // Session Message Tests
    // =========================================================================

    #[tokio::test]
    async fn test_route_session_spawn() {
        let router = create_test_router();

        let msg = Message::SessionSpawn(SessionSpawn::command("python3 -i"));
        let response = router.route(msg).await.unwrap();

        match response {
            Some(Message::SessionSpawned(spawned)) => {
                assert_eq!(spawned.session_id, "test-session-123");
                assert_eq!(spawned.pid, 12345);
            }
            other => panic!("Expected SessionSpawned response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_session_spawn_applies_defaults() {
        let router = create_test_router();

        let mut req = SessionSpawn::command("sh");
        req.cwd = Some("/tmp".to_string());
        req.cols = Some(100);
        router.route(Message::SessionSpawn(req)).await.unwrap();

        let options = router
            .session_manager()
            .last_spawn
            .lock()
            .unwrap()
            .clone()
            .unwrap();
        assert_eq!(options.command, "sh");
        assert_eq!(options.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(options.cols, 100);
        assert_eq!(options.rows, 24);
        assert_eq!(options.terminal, TerminalMode::Pipe);
    }

    #[tokio::test]
    async fn test_route_session_spawn_zero_size_rejected() {
        let router = create_test_router();

        let mut req = SessionSpawn::command("sh");
        req.rows = Some(0);
        let result = router.route(Message::SessionSpawn(req)).await;
        assert!(matches!(result, Err(RouterError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_route_session_spawn_failure() {
        let router = MessageRouter::new(Arc::new(MockSessionManager::failing()));

        let reply = router
            .handle(Message::SessionSpawn(SessionSpawn::command("sh")))
            .await;

        match reply {
            Message::Error(err) => {
                assert_eq!(err.code, ErrorCode::SpawnFailed);
                assert!(err.message.contains("Mock failure"));
                assert!(err.context.is_none());
            }
            other => panic!("Expected Error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_session_send_keys() {
        let router = create_test_router();

        let msg = Message::SessionSendKeys(SessionSendKeys {
            session_id: "test-session-123".to_string(),
            keys: "echo hi Enter".to_string(),
        });
        let response = router.route(msg).await.unwrap();
        assert_eq!(response, Some(Message::Ack(Ack::ok("test-session-123"))));
    }

    #[tokio::test]
    async fn test_route_session_read() {
        let router = create_test_router();

        let response = router
            .route(Message::SessionRead(SessionRead::new("test-session-123")))
            .await
            .unwrap();

        match response {
            Some(Message::SessionOutput(output)) => {
                assert_eq!(output.content, "hi\n");
                assert_eq!(output.lines, 1);
                assert!(output.has_more);
            }
            other => panic!("Expected SessionOutput response, got {other:?}"),
        }

        let recorded = *router.session_manager().last_read.lock().unwrap();
        assert_eq!(recorded, Some((None, true)));
    }

    #[tokio::test]
    async fn test_route_session_read_wait_is_bounded() {
        let router = create_test_router();

        let req = SessionRead {
            session_id: "test-session-123".to_string(),
            wait_ms: Some(MAX_READ_WAIT_MS + 1),
            clear: false,
        };
        let result = router.route(Message::SessionRead(req)).await;
        assert!(matches!(result, Err(RouterError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_route_session_kill() {
        let router = create_test_router();

        let msg = Message::SessionKill(SessionKill {
            session_id: "test-session-123".to_string(),
            signal: KillSignal::Term,
        });
        let response = router.route(msg).await.unwrap();

        match response {
            Some(Message::SessionKilled(killed)) => {
                assert!(killed.success);
                assert_eq!(killed.exit_code, None);
                assert_eq!(killed.signal, Some(15));
            }
            other => panic!("Expected SessionKilled response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_session_kill_unknown_reports_not_found() {
        let router = MessageRouter::new(Arc::new(MockSessionManager::failing()));

        let reply = router
            .handle(Message::SessionKill(SessionKill {
                session_id: "gone".to_string(),
                signal: KillSignal::Kill,
            }))
            .await;

        match reply {
            Message::Error(err) => {
                assert_eq!(err.code, ErrorCode::NotFound);
                assert_eq!(err.context.as_deref(), Some("gone"));
                assert!(!err.recoverable);
            }
            other => panic!("Expected Error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_session_resize() {
        let router = create_test_router();

        let msg = Message::SessionResize(SessionResize {
            session_id: "test-session-123".to_string(),
            cols: 120,
            rows: 40,
        });
        let response = router.route(msg).await.unwrap();
        assert_eq!(response, Some(Message::Ack(Ack::ok("test-session-123"))));
    }

    #[tokio::test]
    async fn test_route_session_resize_zero_rejected() {
        let router = create_test_router();

        let msg = Message::SessionResize(SessionResize {
            session_id: "test-session-123".to_string(),
            cols: 0,
            rows: 40,
        });
        assert!(matches!(
            router.route(msg).await,
            Err(RouterError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_route_session_list() {
        let router = create_test_router();

        let response = router
            .route(Message::SessionList(SessionList { verbose: false }))
            .await
            .unwrap();
        match response {
            Some(Message::SessionListing(listing)) => {
                assert_eq!(listing.sessions.len(), 1);
                assert!(listing.sessions[0].details.is_none());
            }
            other => panic!("Expected SessionListing response, got {other:?}"),
        }

        let response = router
            .route(Message::SessionList(SessionList { verbose: true }))
            .await
            .unwrap();
        match response {
            Some(Message::SessionListing(listing)) => {
                assert!(listing.sessions[0].details.is_some());
            }
            other => panic!("Expected SessionListing response, got {other:?}"),
        }
    }

    // =========================================================================
    // Control Message Tests
    // =========================================================================

    #[tokio::test]
    async fn test_route_ping() {
        let router = create_test_router();

        let response = router
            .route(Message::Ping(Ping { timestamp: 12345 }))
            .await
            .unwrap();
        assert_eq!(response, Some(Message::Pong(Pong { timestamp: 12345 })));
    }

    #[tokio::test]
    async fn test_route_pong_ignored() {
        let router = create_test_router();

        let response = router
            .route(Message::Pong(Pong { timestamp: 1 }))
            .await
            .unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_handle_reply_less_message_is_invalid() {
        let router = create_test_router();

        let reply = router.handle(Message::Pong(Pong { timestamp: 1 })).await;
        assert!(matches!(
            reply,
            Message::Error(ErrorMessage {
                code: ErrorCode::InvalidRequest,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_route_response_messages_rejected() {
        let router = create_test_router();

        let responses = vec![
            Message::SessionSpawned(SessionSpawned {
                session_id: "s".to_string(),
                pid: 1,
            }),
            Message::Ack(Ack::ok("s")),
            Message::ShuttingDown,
        ];

        for msg in responses {
            assert!(matches!(
                router.route(msg).await,
                Err(RouterError::InvalidRequest(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_route_control_messages_not_routed() {
        let router = create_test_router();
        assert!(router.route(Message::Status).await.is_err());
        assert!(router.route(Message::Shutdown).await.is_err());
    }

    #[test]
    fn test_router_error_to_message() {
        let err = RouterError::Session(SessionError::LimitReached(64));
        let msg = err.to_error_message(None);
        assert_eq!(msg.code, ErrorCode::LimitReached);
        assert_eq!(msg.message, "session limit reached (64)");
        assert!(msg.recoverable);

        let err = RouterError::Session(SessionError::NotFound("abc".to_string()));
        let msg = err.to_error_message(Some("abc".to_string()));
        assert_eq!(msg.code, ErrorCode::NotFound);
        assert_eq!(msg.message, "session not found: abc");
        assert_eq!(msg.context.as_deref(), Some("abc"));
    }
}
