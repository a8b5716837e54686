//! Chat coordinator
//!
//! Folds connection events into a [`ChatState`] and bridges typed lines to
//! the engine. Failures show up in the transcript as system messages.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use bluechat_core::{ConnectionEngine, ConnectionEvent, EventStream, Message, MessageSender};

use crate::config::CliConfig;
use crate::error::Result;

/// Line that ends the chat
pub const QUIT_COMMAND: &str = "/quit";

// ----------------------------------------------------------------------------
// Chat State
// ----------------------------------------------------------------------------

/// What the user sees
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatState {
    pub messages: Vec<Message>,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub error: Option<String>,
}

impl ChatState {
    /// State at the start of a listen or dial
    pub fn connecting() -> Self {
        Self {
            is_connecting: true,
            ..Self::default()
        }
    }

    pub fn apply(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Established => {
                self.is_connected = true;
                self.is_connecting = false;
                self.error = None;
            }
            ConnectionEvent::TransferSucceeded(message) => {
                self.messages.push(message);
            }
            ConnectionEvent::Failed(reason) => {
                self.is_connected = false;
                self.is_connecting = false;
                self.messages.push(Message::system(reason.clone()));
                self.error = Some(reason);
            }
        }
    }

    /// A message the engine confirmed as written
    pub fn record_sent(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// The event sequence is over
    pub fn finish(&mut self) {
        self.is_connected = false;
        self.is_connecting = false;
    }
}

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

/// Drives one chat session against an engine
pub struct ChatCoordinator {
    engine: ConnectionEngine,
    labels: CliConfig,
    state: ChatState,
}

impl ChatCoordinator {
    pub fn new(engine: ConnectionEngine, labels: CliConfig) -> Self {
        Self {
            engine,
            labels,
            state: ChatState::connecting(),
        }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    fn render(&self, message: &Message) -> String {
        match message.sender {
            MessageSender::Local => format!("{}: {}", self.labels.local_label, message.text),
            MessageSender::Remote => format!("{}: {}", self.labels.remote_label, message.text),
            MessageSender::System => format!("* {}", message.text),
        }
    }

    async fn print<W: AsyncWrite + Unpin>(&self, out: &mut W, line: &str) -> Result<()> {
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }

    async fn handle_event<W: AsyncWrite + Unpin>(
        &mut self,
        event: ConnectionEvent,
        out: &mut W,
    ) -> Result<()> {
        let line = match &event {
            ConnectionEvent::Established => "* connected".to_string(),
            ConnectionEvent::TransferSucceeded(message) => self.render(message),
            ConnectionEvent::Failed(reason) => self.render(&Message::system(reason.clone())),
        };
        self.state.apply(event);
        self.print(out, &line).await
    }

    async fn handle_line<W: AsyncWrite + Unpin>(&mut self, line: &str, out: &mut W) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        match self.engine.send(line).await {
            Some(message) => {
                let rendered = self.render(&message);
                self.state.record_sent(message);
                self.print(out, &rendered).await
            }
            None => self.print(out, "* not sent: no connection").await,
        }
    }

    /// Run until the sequence ends, the input closes or `/quit` is typed.
    ///
    /// The engine is released on the way out.
    pub async fn run<R, W>(mut self, mut events: EventStream, input: R, out: &mut W) -> Result<ChatState>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut input_open = true;

        loop {
            tokio::select! {
                event = events.next_event() => match event {
                    Some(event) => self.handle_event(event, out).await?,
                    None => {
                        debug!("Event sequence ended");
                        break;
                    }
                },
                line = lines.next_line(), if input_open => match line? {
                    Some(line) if line.trim() == QUIT_COMMAND => break,
                    Some(line) => self.handle_line(line.trim_end_matches('\r'), out).await?,
                    None => input_open = false,
                },
            }
        }

        self.engine.release();
        self.state.finish();
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluechat_core::memory::MemoryAir;
    use bluechat_core::{DeviceRegistry, DiscoveryController, EngineConfig, EnginePhase};
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::time::timeout;

    fn engine_for(radio: std::sync::Arc<bluechat_core::memory::MemoryRadio>) -> ConnectionEngine {
        let config = EngineConfig::default();
        let discovery = DiscoveryController::new(radio.clone(), DeviceRegistry::new(), config.clone());
        ConnectionEngine::new(radio, discovery, config).unwrap()
    }

    #[test]
    fn test_failure_becomes_system_message() {
        let mut state = ChatState::connecting();
        state.apply(ConnectionEvent::failed("Connection failed"));

        assert!(!state.is_connecting);
        assert!(!state.is_connected);
        assert_eq!(state.error.as_deref(), Some("Connection failed"));
        assert_eq!(state.messages, vec![Message::system("Connection failed")]);
    }

    #[test]
    fn test_established_clears_error() {
        let mut state = ChatState::connecting();
        state.apply(ConnectionEvent::failed("Connection lost"));
        state.apply(ConnectionEvent::Established);
        state.apply(ConnectionEvent::TransferSucceeded(Message::remote("hi")));

        assert!(state.is_connected);
        assert!(state.error.is_none());
        assert_eq!(state.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_chat_session_sends_typed_lines() {
        let air = MemoryAir::new();
        let server_radio = air.radio("AA:AA:AA:AA:AA:AA", "server");
        let client_radio = air.radio("BB:BB:BB:BB:BB:BB", "client");
        let server = engine_for(server_radio.clone());
        let client = engine_for(client_radio);

        let mut server_events = server.listen();
        while !server_radio
            .activity()
            .contains(&bluechat_core::memory::RadioActivity::Listen)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (mut typing, keyboard) = tokio::io::duplex(1024);
        let client_events = client.dial(server_radio.as_peer());
        let coordinator = ChatCoordinator::new(client.clone(), CliConfig::default());
        let session = tokio::spawn(async move {
            let mut screen = Vec::new();
            let state = coordinator
                .run(client_events, BufReader::new(keyboard), &mut screen)
                .await
                .unwrap();
            (state, String::from_utf8(screen).unwrap())
        });

        let wait = Duration::from_secs(2);
        assert_eq!(
            timeout(wait, server_events.next_event()).await.unwrap(),
            Some(ConnectionEvent::Established)
        );
        timeout(wait, async {
            while client.phase() != EnginePhase::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        typing.write_all(b"hello\n").await.unwrap();
        assert_eq!(
            timeout(wait, server_events.next_event()).await.unwrap(),
            Some(ConnectionEvent::TransferSucceeded(Message::remote("hello")))
        );

        typing.write_all(b"/quit\n").await.unwrap();
        let (state, screen) = timeout(wait, session).await.unwrap().unwrap();

        assert!(!state.is_connected);
        assert_eq!(state.messages.first(), Some(&Message::local("hello")));
        assert!(screen.contains("* connected"));
        assert!(screen.contains("you: hello"));
        assert_eq!(client.phase(), EnginePhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_dial_ends_session() {
        let air = MemoryAir::new();
        let client = engine_for(air.radio("BB:BB:BB:BB:BB:BB", "client"));
        let events = client.dial(bluechat_core::PeerDevice::new(None, "CC:CC:CC:CC:CC:CC"));

        let mut screen = Vec::new();
        let state = ChatCoordinator::new(client, CliConfig::default())
            .run(events, BufReader::new(tokio::io::empty()), &mut screen)
            .await
            .unwrap();

        assert_eq!(state.error.as_deref(), Some("Connection failed"));
        assert_eq!(String::from_utf8(screen).unwrap(), "* Connection failed\n");
    }
}
