//! Conversation loop
//!
//! Drives one turn at a time: listen, transcribe, send, await the reply,
//! respond, then listen again. The microphone is released before
//! transcription and reopened for the next turn, so capture and playback
//! never hold audio devices at the same time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{BehaviorConfig, Config};
use crate::error::TranscriptionError;
use crate::gateway::{
    Backoff, GatewaySession, InboundMessage, RetryPolicy, SessionEvent, ToolRequest,
};
use crate::robot::ActionExecutor;
use crate::voice::{AudioCapture, Speaker, Transcriber, Utterance};
use crate::{Error, Result};

/// Where the loop is in the current turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Between turns
    Idle,
    /// Microphone open
    Listening,
    Transcribing,
    /// Message sent, waiting on the gateway
    Awaiting,
    /// Speaking and/or acting
    Responding,
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    TranscriptionFailed,
    SendFailed,
    TimedOut,
    /// Reply spoken, but at least one action failed
    ActionFailed,
}

/// One action performed during a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    pub request_id: String,
    pub name: String,
    pub succeeded: bool,
}

/// What the gateway gave back for a turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnResponse {
    pub text: Option<String>,
    pub actions: Vec<ActionRecord>,
}

/// One listen-to-respond cycle
#[derive(Debug, Clone)]
pub struct Turn {
    /// Also the `message.send` id
    pub id: Uuid,
    pub text: Option<String>,
    pub response: Option<TurnResponse>,
    pub status: TurnStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Turn {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: None,
            response: None,
            status: TurnStatus::Completed,
            started_at,
            finished_at: started_at,
        }
    }
}

/// Loop tuning taken from the configuration
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub behavior: BehaviorConfig,
    pub reply_timeout: Duration,
    /// Used to reopen a failed microphone
    pub device_retry: RetryPolicy,
}

impl LoopOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            behavior: config.behavior.clone(),
            reply_timeout: config.gateway.reply_timeout,
            device_retry: config.gateway.retry.clone(),
        }
    }
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            behavior: BehaviorConfig::default(),
            reply_timeout: Duration::from_secs(120),
            device_retry: RetryPolicy::default(),
        }
    }
}

enum Heard {
    Text(String),
    Failed,
    Cancelled,
}

enum Awaited {
    Reply(String),
    Failed(TurnStatus),
    Cancelled,
}

/// Why listening stopped short of an utterance
enum Interrupt {
    Tool(ToolRequest),
    Failed(Error),
}

/// Orchestrates capture, transcription, the gateway and output
pub struct ConversationLoop {
    capture: AudioCapture,
    transcriber: Arc<dyn Transcriber>,
    speaker: Arc<Speaker>,
    executor: ActionExecutor,
    options: LoopOptions,
    state: watch::Sender<LoopState>,
    turns: Option<mpsc::UnboundedSender<Turn>>,
    cancel: CancellationToken,
}

impl ConversationLoop {
    #[must_use]
    pub fn new(
        capture: AudioCapture,
        transcriber: Arc<dyn Transcriber>,
        speaker: Arc<Speaker>,
        executor: ActionExecutor,
        options: LoopOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            capture,
            transcriber,
            speaker,
            executor,
            options,
            state,
            turns: None,
            cancel,
        }
    }

    /// Receive every finished turn, in order
    pub fn turn_events(&mut self) -> mpsc::UnboundedReceiver<Turn> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.turns = Some(tx);
        rx
    }

    /// Watch loop state changes
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// True while the microphone hears speech
    #[must_use]
    pub fn speech_activity(&self) -> watch::Receiver<bool> {
        self.capture.speech_activity()
    }

    /// Run turns through the gateway until cancelled
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` if the gateway session closes for good, or
    /// `Error::Device` if the microphone cannot be reopened
    pub async fn run(&mut self, session: &mut GatewaySession) -> Result<()> {
        self.executor.set_connection(session.watch_state());
        self.startup().await;

        while !self.cancel.is_cancelled() {
            let Some(utterance) = self.listen(Some(&mut *session)).await? else {
                break;
            };
            let Some(turn) = self.gateway_turn(session, &utterance).await? else {
                break;
            };
            self.finish(turn);
        }

        tracing::info!("conversation loop stopped");
        Ok(())
    }

    /// Run turns that echo the transcript back, without a gateway
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the microphone cannot be reopened
    pub async fn run_standalone(&mut self) -> Result<()> {
        self.startup().await;

        while !self.cancel.is_cancelled() {
            let Some(utterance) = self.listen(None).await? else {
                break;
            };
            let Some(turn) = self.echo_turn(&utterance).await else {
                break;
            };
            self.finish(turn);
        }

        tracing::info!("conversation loop stopped");
        Ok(())
    }

    async fn startup(&self) {
        self.speaker.wake_cue().await;
        match &self.options.behavior.wake_word {
            Some(phrase) if self.capture.has_wake_gate() => {
                tracing::info!("ready, say \"{phrase}\" to activate");
            }
            _ => tracing::info!("ready, always listening"),
        }
    }

    fn set_state(&self, state: LoopState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "loop state");
        }
    }

    /// Open the microphone and wait for one utterance
    ///
    /// Returns `None` when cancelled. Unsolicited tool requests run with the
    /// microphone closed.
    async fn listen(
        &mut self,
        mut session: Option<&mut GatewaySession>,
    ) -> Result<Option<Utterance>> {
        let mut backoff = Backoff::new(self.options.device_retry.clone());

        loop {
            let mut mic = match self.capture.open() {
                Ok(mic) => mic,
                Err(e @ Error::Device(_)) => {
                    wait_for_device(&mut backoff, e, &self.cancel).await?;
                    if self.cancel.is_cancelled() {
                        return Ok(None);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            // `mic` holds `self.capture`, so publish through the field directly
            let previous = self.state.send_replace(LoopState::Listening);
            tracing::debug!(from = ?previous, to = ?LoopState::Listening, "loop state");

            let interrupt = loop {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Ok(None),
                    utterance = mic.next_utterance() => match utterance {
                        Ok(utterance) => return Ok(Some(utterance)),
                        Err(e) => break Interrupt::Failed(e),
                    },
                    event = next_event(&mut session) => {
                        match event? {
                            SessionEvent::Message(InboundMessage::ToolRequest(request)) => {
                                break Interrupt::Tool(request);
                            }
                            SessionEvent::Message(InboundMessage::Reply { id, text }) => {
                                tracing::warn!(message = ?id, text = %text, "reply with no turn in flight, ignoring");
                            }
                            SessionEvent::Message(InboundMessage::Error { id, code, message }) => {
                                tracing::warn!(message = ?id, code = %code, "gateway error while idle: {message}");
                            }
                            SessionEvent::Interrupted => tracing::warn!("gateway connection lost, reconnecting"),
                            SessionEvent::Resumed => tracing::info!("gateway connection restored"),
                        }
                    }
                }
            };

            // The partial segment goes with the microphone
            drop(mic);
            match interrupt {
                Interrupt::Tool(request) => {
                    self.set_state(LoopState::Responding);
                    let result = self.executor.execute(&request).await;
                    if let Some(session) = session.as_deref_mut() {
                        if let Err(e) = session.respond(&request.id, result).await {
                            tracing::warn!(request = %request.id, error = %e, "tool.response failed");
                        }
                    }
                }
                Interrupt::Failed(e @ Error::Device(_)) => {
                    wait_for_device(&mut backoff, e, &self.cancel).await?;
                    if self.cancel.is_cancelled() {
                        return Ok(None);
                    }
                }
                Interrupt::Failed(e) => return Err(e),
            }
        }
    }

    async fn transcribe(&self, utterance: &Utterance) -> Heard {
        self.set_state(LoopState::Transcribing);

        let result = tokio::select! {
            () = self.cancel.cancelled() => return Heard::Cancelled,
            result = self.transcriber.transcribe(utterance) => result,
        };

        match result {
            Ok(transcript) => {
                tracing::info!(text = %transcript.text, "heard");
                Heard::Text(transcript.text)
            }
            Err(TranscriptionError::NoSpeech) => {
                tracing::debug!("no speech in utterance");
                Heard::Failed
            }
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
                self.set_state(LoopState::Responding);
                self.apologize().await;
                Heard::Failed
            }
        }
    }

    async fn gateway_turn(
        &self,
        session: &mut GatewaySession,
        utterance: &Utterance,
    ) -> Result<Option<Turn>> {
        let mut turn = Turn::new(utterance.started_at);

        let text = match self.transcribe(utterance).await {
            Heard::Text(text) => text,
            Heard::Failed => {
                turn.status = TurnStatus::TranscriptionFailed;
                return Ok(Some(turn));
            }
            Heard::Cancelled => return Ok(None),
        };
        turn.text = Some(text.clone());

        self.set_state(LoopState::Awaiting);
        let thinking = self.speaker.thinking();

        if let Err(e) = session.send_as(turn.id, &text).await {
            tracing::warn!(turn = %turn.id, error = %e, "send failed");
            thinking.stop().await;
            self.set_state(LoopState::Responding);
            self.apologize().await;
            turn.status = TurnStatus::SendFailed;
            return Ok(Some(turn));
        }

        let mut actions = Vec::new();
        let awaited = self.await_reply(session, turn.id, &mut actions).await;
        thinking.stop().await;
        let awaited = awaited?;

        self.set_state(LoopState::Responding);
        let reply = match awaited {
            Awaited::Reply(reply) => Some(reply),
            Awaited::Failed(status) => {
                turn.status = status;
                None
            }
            Awaited::Cancelled => {
                session.end_turn();
                return Ok(None);
            }
        };

        if let Some(reply) = &reply {
            self.speaker.speak(reply).await;
            if actions.iter().any(|a| !a.succeeded) {
                turn.status = TurnStatus::ActionFailed;
            }
        } else {
            self.apologize().await;
        }
        session.end_turn();

        turn.response = (reply.is_some() || !actions.is_empty()).then(|| TurnResponse {
            text: reply,
            actions,
        });
        Ok(Some(turn))
    }

    /// Pull events until the reply for `turn_id` arrives
    ///
    /// Tool requests are executed and answered inline, so at most one is
    /// outstanding at a time.
    async fn await_reply(
        &self,
        session: &mut GatewaySession,
        turn_id: Uuid,
        actions: &mut Vec<ActionRecord>,
    ) -> Result<Awaited> {
        let expected = turn_id.to_string();
        let deadline = tokio::time::Instant::now() + self.options.reply_timeout;

        loop {
            // Cancellation also closes the session, so check it first
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(Awaited::Cancelled),
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(turn = %turn_id, "no reply from gateway in time");
                    return Ok(Awaited::Failed(TurnStatus::TimedOut));
                }
                event = session.receive() => event?,
            };

            match event {
                SessionEvent::Message(InboundMessage::Reply { id, text }) => {
                    if let Some(id) = id.filter(|id| *id != expected) {
                        tracing::warn!(turn = %turn_id, reply = %id, "protocol desync: stale reply ignored");
                        continue;
                    }
                    if session.pending_requests() > 0 {
                        tracing::warn!(turn = %turn_id, "protocol desync: reply before tool.response");
                    }
                    return Ok(Awaited::Reply(text));
                }
                SessionEvent::Message(InboundMessage::ToolRequest(request)) => {
                    let result = self.executor.execute(&request).await;
                    actions.push(ActionRecord {
                        request_id: request.id.clone(),
                        name: request.name.clone(),
                        succeeded: result.is_ok(),
                    });
                    if let Err(e) = session.respond(&request.id, result).await {
                        tracing::warn!(request = %request.id, error = %e, "tool.response failed");
                    }
                }
                SessionEvent::Message(InboundMessage::Error { id, code, message }) => {
                    if let Some(id) = id.filter(|id| *id != expected) {
                        tracing::warn!(turn = %turn_id, error_for = %id, code = %code, "stale gateway error ignored: {message}");
                        continue;
                    }
                    tracing::warn!(turn = %turn_id, code = %code, "gateway error: {message}");
                    return Ok(Awaited::Failed(TurnStatus::SendFailed));
                }
                SessionEvent::Interrupted => {
                    tracing::warn!(turn = %turn_id, "gateway connection lost mid-turn");
                    return Ok(Awaited::Failed(TurnStatus::TimedOut));
                }
                SessionEvent::Resumed => {
                    tracing::debug!("gateway connection restored");
                }
            }
        }
    }

    async fn echo_turn(&self, utterance: &Utterance) -> Option<Turn> {
        let mut turn = Turn::new(utterance.started_at);

        match self.transcribe(utterance).await {
            Heard::Text(text) => {
                self.set_state(LoopState::Responding);
                let reply = format!("I heard you say: {text}");
                self.speaker.speak(&reply).await;
                turn.text = Some(text);
                turn.response = Some(TurnResponse {
                    text: Some(reply),
                    actions: Vec::new(),
                });
            }
            Heard::Failed => turn.status = TurnStatus::TranscriptionFailed,
            Heard::Cancelled => return None,
        }
        Some(turn)
    }

    async fn apologize(&self) {
        if let Some(apology) = &self.options.behavior.apology {
            self.speaker.speak(apology).await;
        }
        self.speaker.emote("sad").await;
    }

    fn finish(&self, mut turn: Turn) {
        turn.finished_at = Utc::now();
        tracing::info!(
            turn = %turn.id,
            status = ?turn.status,
            text = turn.text.as_deref().unwrap_or(""),
            "turn finished"
        );
        self.set_state(LoopState::Idle);
        if let Some(turns) = &self.turns {
            let _ = turns.send(turn);
        }
    }
}

async fn next_event(session: &mut Option<&mut GatewaySession>) -> Result<SessionEvent> {
    match session {
        Some(session) => session.receive().await,
        None => std::future::pending().await,
    }
}

/// Back off before reopening the microphone
///
/// Returns early, without error, when cancelled.
async fn wait_for_device(
    backoff: &mut Backoff,
    error: Error,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(delay) = backoff.next_delay() else {
        return Err(Error::Device(format!(
            "giving up after {} attempts: {error}",
            backoff.failures()
        )));
    };
    tracing::warn!(error = %error, retry_in_ms = delay.as_millis(), "microphone failed, reopening");
    tokio::select! {
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(delay) => {}
    }
    Ok(())
}
