//! Persistent gateway session
//!
//! A supervisor task owns the transport sink, handles keep-alive and
//! reconnects. One reader task per connection decodes inbound frames into a
//! single-consumer queue that `receive` pulls from.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::protocol::{self, InboundMessage, MessageId, OutboundMessage};
use super::retry::{Backoff, RetryPolicy};
use super::transport::{Connector, FrameSink, FrameStream};
use crate::robot::ActionResult;
use crate::{Error, Result};

/// Connection lifecycle, published through a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Event pulled from the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Decoded inbound frame
    Message(InboundMessage),
    /// Transport lost, reconnecting
    Interrupted,
    /// Transport re-established
    Resumed,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub retry: RetryPolicy,
    pub ping_interval: Duration,
}

enum Command {
    Write {
        frame: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

type Link = (Box<dyn FrameSink>, Box<dyn FrameStream>);

/// Client side of the gateway protocol
pub struct GatewaySession {
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    state: watch::Receiver<ConnectionState>,
    pending: HashSet<String>,
    supervisor: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl GatewaySession {
    /// Connect to the gateway, retrying with backoff
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` once the retry policy is exhausted or the
    /// token is cancelled
    pub async fn connect(
        connector: Arc<dyn Connector>,
        options: SessionOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let cancel = cancel.child_token();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let link = match establish(connector.as_ref(), &options.retry, &cancel).await {
            Ok(link) => link,
            Err(e) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        state_tx.send_replace(ConnectionState::Connected);
        tracing::info!("gateway connected");

        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let backoff = Backoff::new(options.retry.clone());
        let supervisor = Supervisor {
            connector,
            options,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            backoff,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run(link));

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            state: state_rx,
            pending: HashSet::new(),
            supervisor: Some(handle),
            cancel,
        })
    }

    /// Send user text with a fresh id
    ///
    /// # Errors
    ///
    /// Returns `Error::Send` if the session is not connected or the write fails
    pub async fn send(&mut self, text: &str) -> Result<MessageId> {
        self.send_as(uuid::Uuid::new_v4(), text).await
    }

    /// Send user text under a caller-chosen id
    ///
    /// Returns once the frame is written; does not wait for a reply.
    ///
    /// # Errors
    ///
    /// Returns `Error::Send` if the session is not connected or the write fails
    pub async fn send_as(&mut self, id: MessageId, text: &str) -> Result<MessageId> {
        let frame = OutboundMessage::Send {
            id,
            text: text.to_string(),
        }
        .encode()?;
        self.write(frame).await?;
        tracing::debug!(message = %id, "message sent");
        Ok(id)
    }

    /// Pull the next inbound event
    ///
    /// Cancel safe.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` once the session has closed for good
    pub async fn receive(&mut self) -> Result<SessionEvent> {
        let event = self
            .events
            .recv()
            .await
            .ok_or_else(|| Error::Connect("gateway session closed".into()))?;

        match &event {
            SessionEvent::Message(InboundMessage::ToolRequest(req)) => {
                if !self.pending.insert(req.id.clone()) {
                    tracing::warn!(request = %req.id, "duplicate tool.request id");
                }
            }
            SessionEvent::Interrupted => {
                if !self.pending.is_empty() {
                    tracing::warn!(
                        count = self.pending.len(),
                        "discarding unanswered tool requests from lost connection"
                    );
                }
                self.pending.clear();
            }
            _ => {}
        }
        Ok(event)
    }

    /// Answer a tool request
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolDesync` (nothing sent) if the id is unknown or
    /// already answered, or `Error::Send` if the write fails
    pub async fn respond(&mut self, request_id: &str, result: ActionResult) -> Result<()> {
        if !self.pending.remove(request_id) {
            let err = Error::ProtocolDesync(format!(
                "tool.response for unknown or already answered request {request_id}"
            ));
            tracing::warn!(request = request_id, "{err}");
            return Err(err);
        }

        let frame = OutboundMessage::ToolResponse {
            id: request_id.to_string(),
            result,
        }
        .encode()?;
        self.write(frame).await
    }

    /// Log and forget tool requests left unanswered at the end of a turn
    pub fn end_turn(&mut self) {
        for id in self.pending.drain() {
            tracing::warn!(request = %id, "protocol desync: tool.request never answered");
        }
    }

    /// Number of tool requests awaiting a response
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close the transport and stop background tasks
    pub async fn shutdown(&mut self) {
        let _ = self.commands.try_send(Command::Shutdown);
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "gateway supervisor ended abnormally");
            }
        }
        tracing::info!("gateway session closed");
    }

    async fn write(&mut self, frame: String) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(Error::Send(format!("gateway not connected ({state:?})")));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Write { frame, ack: ack_tx })
            .await
            .map_err(|_| Error::Send("gateway session closed".into()))?;
        ack_rx
            .await
            .map_err(|_| Error::Send("gateway session closed".into()))?
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn establish(
    connector: &dyn Connector,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Link> {
    let mut backoff = Backoff::new(policy.clone());
    loop {
        let attempt = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Connect("cancelled".into())),
            attempt = connector.connect() => attempt,
        };

        match attempt {
            Ok(link) => return Ok(link),
            Err(e) => {
                let Some(delay) = backoff.next_delay() else {
                    return Err(Error::Connect(format!(
                        "giving up after {} attempts: {e}",
                        backoff.failures()
                    )));
                };
                tracing::warn!(
                    attempt = backoff.failures(),
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "gateway connect failed, retrying"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Connect("cancelled".into())),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn spawn_reader(
    mut stream: Box<dyn FrameStream>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = stream.next_text().await {
            let text = match frame {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "gateway read failed");
                    break;
                }
            };
            tracing::debug!(len = text.len(), "frame received");

            match protocol::decode(&text) {
                Ok(message) => {
                    if events.send(SessionEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "ignoring inbound frame"),
            }
        }
    })
}

enum Exit {
    Shutdown,
    Lost(String),
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    /// Reconnect budget, renewed after every successful reconnect
    backoff: Backoff,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self, link: Link) {
        let (mut sink, stream) = link;
        let mut reader = spawn_reader(stream, self.events.clone());

        loop {
            let exit = self.serve(sink.as_mut(), &mut reader).await;
            reader.abort();

            match exit {
                Exit::Shutdown => {
                    if let Err(e) = sink.close().await {
                        tracing::debug!(error = %e, "close failed");
                    }
                    self.state.send_replace(ConnectionState::Disconnected);
                    return;
                }
                Exit::Lost(reason) => {
                    tracing::warn!(%reason, "gateway connection lost, reconnecting");
                    self.state.send_replace(ConnectionState::Reconnecting);
                    let _ = self.events.send(SessionEvent::Interrupted);

                    let Some((new_sink, new_stream)) = self.reconnect().await else {
                        self.state.send_replace(ConnectionState::Disconnected);
                        return;
                    };
                    sink = new_sink;
                    reader = spawn_reader(new_stream, self.events.clone());
                    self.state.send_replace(ConnectionState::Connected);
                    let _ = self.events.send(SessionEvent::Resumed);
                    tracing::info!("gateway connection resumed");
                }
            }
        }
    }

    async fn serve(&mut self, sink: &mut dyn FrameSink, reader: &mut JoinHandle<()>) -> Exit {
        let period = self.options.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Exit::Shutdown,
                command = self.commands.recv() => match command {
                    Some(Command::Write { frame, ack }) => {
                        if let Err(e) = sink.send_text(frame).await {
                            let reason = e.to_string();
                            let _ = ack.send(Err(e));
                            return Exit::Lost(reason);
                        }
                        let _ = ack.send(Ok(()));
                    }
                    Some(Command::Shutdown) | None => return Exit::Shutdown,
                },
                _ = ping.tick() => {
                    if let Err(e) = sink.ping().await {
                        return Exit::Lost(format!("keep-alive failed: {e}"));
                    }
                    tracing::trace!("ping sent");
                }
                _ = &mut *reader => return Exit::Lost("connection closed by gateway".into()),
            }
        }
    }

    async fn reconnect(&mut self) -> Option<Link> {
        loop {
            let attempt = tokio::select! {
                () = self.cancel.cancelled() => return None,
                attempt = self.connector.connect() => attempt,
            };

            match attempt {
                Ok(link) => {
                    self.backoff.reset();
                    return Some(link);
                }
                Err(e) => {
                    let Some(delay) = self.backoff.next_delay() else {
                        tracing::error!(
                            attempts = self.backoff.failures(),
                            error = %e,
                            "gateway reconnect exhausted"
                        );
                        return None;
                    };
                    tracing::warn!(
                        attempt = self.backoff.failures(),
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "gateway reconnect failed, retrying"
                    );
                    if !self.wait_rejecting_writes(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep for `delay`, failing writes that arrive meanwhile.
    /// Returns false on shutdown.
    async fn wait_rejecting_writes(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                () = self.cancel.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Write { ack, .. }) => {
                        let _ = ack.send(Err(Error::Send("gateway reconnecting".into())));
                    }
                    Some(Command::Shutdown) | None => return false,
                },
            }
        }
    }
}
