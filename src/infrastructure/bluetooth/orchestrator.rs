//! Command Orchestrator
//!
//! Turns one logical command into a paced byte stream over the transport
//! link, retries failed bytes, waits for the lock's answer and schedules
//! the disconnect afterwards. One command at a time.

use crate::domain::models::{AppEvent, CommandEvent, MessageSeverity, StatusMessage};
use crate::domain::settings::TimingSettings;
use crate::infrastructure::bluetooth::{
    error::CommandError,
    protocol::{
        self, CommandCode, CommandDescriptor, CommandParams, EncodeContext, ResponseFrame,
        ResponseKind,
    },
    service::BluetoothService,
};
use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pacing, retry and timeout parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTimings {
    /// Gap after every successfully written byte
    pub byte_delay: Duration,
    /// Gap before retrying a failed byte
    pub retry_delay: Duration,
    /// Total writes allowed per byte, the first one included
    pub max_attempts: u32,
    pub response_timeout: Duration,
    pub post_response_disconnect: Duration,
}

impl Default for CommandTimings {
    fn default() -> Self {
        Self::from_settings(&TimingSettings::default())
    }
}

impl CommandTimings {
    pub fn from_settings(t: &TimingSettings) -> Self {
        Self {
            byte_delay: Duration::from_millis(t.byte_delay_ms),
            retry_delay: Duration::from_millis(t.retry_delay_ms),
            max_attempts: t.max_send_attempts.max(1),
            response_timeout: Duration::from_millis(t.response_timeout_ms),
            post_response_disconnect: Duration::from_millis(t.post_response_disconnect_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandPhase {
    #[default]
    Idle,
    Sending,
    AwaitingResponse,
}

/// One pending byte of the command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendQueueItem {
    pub byte: u8,
    pub retry_count: u32,
}

/// How a command that made it onto the air ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Lock answered 0x81
    Accepted(ResponseFrame),
    /// Lock answered 0x80
    Rejected(ResponseFrame),
    /// Lock answered with some other code; counted as a failure
    Unrecognized(ResponseFrame),
    /// Nothing decodable arrived in time
    TimedOut,
    /// Sent without waiting, the entrance lock never answers
    Dispatched,
}

impl CommandOutcome {
    pub fn from_frame(frame: ResponseFrame) -> Self {
        match frame.kind() {
            ResponseKind::Success => Self::Accepted(frame),
            ResponseKind::Failure => Self::Rejected(frame),
            ResponseKind::Unrecognized(_) => Self::Unrecognized(frame),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Accepted(_) | Self::Dispatched)
    }

    pub fn response(&self) -> Option<&ResponseFrame> {
        match self {
            Self::Accepted(f) | Self::Rejected(f) | Self::Unrecognized(f) => Some(f),
            Self::TimedOut | Self::Dispatched => None,
        }
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted(frame) => write!(f, "accepted ({})", frame),
            Self::Rejected(frame) => write!(f, "rejected ({})", frame),
            Self::Unrecognized(frame) => write!(
                f,
                "unrecognized response 0x{:02X} ({})",
                frame.response_code, frame
            ),
            Self::TimedOut => f.write_str("no response"),
            Self::Dispatched => f.write_str("dispatched"),
        }
    }
}

#[derive(Default)]
struct CommandState {
    phase: CommandPhase,
    queue: VecDeque<SendQueueItem>,
    /// Bumped per command and on cancel; a stale invocation never touches state
    generation: u64,
    cancel: Option<CancellationToken>,
}

type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Single-flight command sender on top of a [`BluetoothService`]
#[derive(Clone)]
pub struct CommandOrchestrator {
    link: BluetoothService,
    timings: CommandTimings,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    state: Arc<Mutex<CommandState>>,
    device_name: Arc<Mutex<Option<String>>>,
    clock: Clock,
}

impl CommandOrchestrator {
    pub fn new(
        link: BluetoothService,
        timings: CommandTimings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            link,
            timings,
            event_sender,
            state: Arc::new(Mutex::new(CommandState::default())),
            device_name: Arc::new(Mutex::new(None)),
            clock: Arc::new(|| chrono::Local::now().naive_local()),
        }
    }

    /// Replace the wall clock used for time payloads and the open block date
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveDateTime + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Name the room-open identity is taken from
    ///
    /// The connected device's own name wins when this was never set or
    /// names some other lock.
    pub fn set_connected_device_name(&self, name: impl Into<String>) {
        let name = name.into();
        debug!("Command target name set to {}", name);
        *lock(&self.device_name) = Some(name);
    }

    pub fn phase(&self) -> CommandPhase {
        self.lock_state().phase
    }

    pub fn is_sending(&self) -> bool {
        self.phase() != CommandPhase::Idle
    }

    pub fn pending_bytes(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Drop the queue and return to idle without waiting for the radio
    ///
    /// A byte already handed to the radio still goes out.
    pub fn cancel_sending(&self) {
        let mut state = self.lock_state();
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        let dropped = state.queue.len();
        state.queue.clear();
        state.phase = CommandPhase::Idle;
        state.generation += 1;
        info!("Sending cancelled, {} byte(s) dropped", dropped);
    }

    pub async fn open_door(&self) -> Result<CommandOutcome, CommandError> {
        self.send_command(CommandCode::Open, None).await
    }

    pub async fn close_door(&self) -> Result<CommandOutcome, CommandError> {
        self.send_command(CommandCode::Close, None).await
    }

    pub async fn check_status(&self) -> Result<CommandOutcome, CommandError> {
        self.send_command(CommandCode::StatusQuery, None).await
    }

    pub async fn check_battery(&self) -> Result<CommandOutcome, CommandError> {
        self.send_command(CommandCode::BatteryQuery, None).await
    }

    pub async fn set_time(&self) -> Result<CommandOutcome, CommandError> {
        self.send_command(CommandCode::SetTime, None).await
    }

    /// Register a student card; all three fields are required
    pub async fn register_card(
        &self,
        order: &str,
        number: &str,
        cycle: &str,
    ) -> Result<CommandOutcome, CommandError> {
        require("order", order)?;
        require("number", number)?;
        require("cycle", cycle)?;
        let params = CommandParams {
            order: order.to_string(),
            number_sequence: number.to_string(),
            cycle: cycle.to_string(),
        };
        self.send_command(CommandCode::RegisterCard, Some(params))
            .await
    }

    pub async fn delete_card(&self, order: &str) -> Result<CommandOutcome, CommandError> {
        require("order", order)?;
        let params = CommandParams {
            order: order.to_string(),
            ..Default::default()
        };
        self.send_command(CommandCode::DeleteCard, Some(params))
            .await
    }

    pub async fn delete_all_cards(&self) -> Result<CommandOutcome, CommandError> {
        self.send_command(CommandCode::DeleteAllCards, None).await
    }

    /// Entrance lock; resolves as soon as the bytes are out
    pub async fn open_entrance(&self) -> Result<CommandOutcome, CommandError> {
        self.send_command(CommandCode::EntranceOpen, None).await
    }

    /// Encode, transmit and await the answer to one command
    pub async fn send_command(
        &self,
        code: impl Into<u8>,
        parameters: Option<CommandParams>,
    ) -> Result<CommandOutcome, CommandError> {
        let descriptor = CommandDescriptor::new(code, parameters);
        let name = protocol::command_name(descriptor.code);

        let (generation, cancel) = match self.begin(&descriptor) {
            Ok(started) => started,
            Err(e) => {
                warn!("{} not sent: {}", name, e);
                self.emit(CommandEvent::Failed(e.clone()));
                return Err(e);
            }
        };

        let result = self.run(&descriptor, generation, &cancel).await;
        match &result {
            Ok(outcome) => {
                info!("{} {}", name, outcome);
                let severity = if outcome.is_success() {
                    MessageSeverity::Success
                } else {
                    MessageSeverity::Warning
                };
                self.send_log(&format!("{} {}", name, outcome), severity);
                self.emit(CommandEvent::Resolved(*outcome));
            }
            Err(e) => {
                self.abort(generation);
                // A failed or cancelled command must not leave the lock connected
                if self.link.is_connected() {
                    self.link
                        .schedule_disconnect(self.timings.post_response_disconnect);
                }
                error!("{} failed: {}", name, e);
                self.send_log(&format!("{} failed: {}", name, e), MessageSeverity::Error);
                self.emit(CommandEvent::Failed(e.clone()));
            }
        }
        result
    }

    /// Claim the single flight slot and load the queue
    fn begin(&self, descriptor: &CommandDescriptor) -> Result<(u64, CancellationToken), CommandError> {
        let mut state = self.lock_state();
        if state.phase != CommandPhase::Idle {
            return Err(CommandError::Busy);
        }
        if !self.link.is_connected() {
            return Err(CommandError::NotConnected);
        }

        let ctx = EncodeContext::new((self.clock)(), self.target_name());
        let bytes = protocol::encode_command(descriptor, &ctx);
        info!(
            "Sending {} ({} bytes): {}",
            protocol::command_name(descriptor.code),
            bytes.len(),
            protocol::bytes_to_hex(&bytes)
        );

        let token = CancellationToken::new();
        state.generation += 1;
        state.queue = bytes
            .iter()
            .map(|&byte| SendQueueItem {
                byte,
                retry_count: 0,
            })
            .collect();
        state.phase = CommandPhase::Sending;
        state.cancel = Some(token.clone());
        let generation = state.generation;
        drop(state);

        self.emit(CommandEvent::Encoded {
            code: descriptor.code,
            bytes,
        });
        Ok((generation, token))
    }

    async fn run(
        &self,
        descriptor: &CommandDescriptor,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, CommandError> {
        self.transmit(generation, cancel).await?;
        self.emit(CommandEvent::TransmissionComplete);

        if !descriptor.expects_response() {
            self.finish(generation)?;
            return Ok(CommandOutcome::Dispatched);
        }

        // Subscribing only now means anything that arrived earlier is ignored
        let mut responses = self.link.subscribe_notifications();
        self.update(generation, |state| state.phase = CommandPhase::AwaitingResponse)?;
        self.emit(CommandEvent::AwaitingResponse);
        debug!("Awaiting response ({:?})", self.timings.response_timeout);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CommandError::Cancelled),
            response = tokio::time::timeout(self.timings.response_timeout, next_response(&mut responses)) => {
                match response {
                    Ok(frame) => CommandOutcome::from_frame(frame),
                    Err(_) => {
                        warn!("No response within {:?}", self.timings.response_timeout);
                        CommandOutcome::TimedOut
                    }
                }
            }
        };

        self.finish(generation)?;
        self.link
            .schedule_disconnect(self.timings.post_response_disconnect);
        Ok(outcome)
    }

    /// Drain the queue strictly in order, one byte per write
    async fn transmit(&self, generation: u64, cancel: &CancellationToken) -> Result<(), CommandError> {
        loop {
            let front = self.read(generation, |state| state.queue.front().copied())?;
            let Some(item) = front else {
                return Ok(());
            };

            match self.link.send_byte(item.byte).await {
                Ok(()) => {
                    let remaining = self.update(generation, |state| {
                        state.queue.pop_front();
                        state.queue.len()
                    })?;
                    debug!("Sent 0x{:02X}, {} remaining", item.byte, remaining);
                    self.emit(CommandEvent::Progress {
                        byte: item.byte,
                        remaining,
                    });
                    pause(cancel, self.timings.byte_delay).await?;
                }
                Err(e) => {
                    let attempts = item.retry_count + 1;
                    if attempts >= self.timings.max_attempts {
                        error!(
                            "Byte 0x{:02X} failed {} times, giving up: {}",
                            item.byte, attempts, e
                        );
                        return Err(CommandError::Transmission {
                            byte: item.byte,
                            attempts,
                        });
                    }
                    warn!(
                        "Byte 0x{:02X} failed (attempt {}/{}): {}",
                        item.byte, attempts, self.timings.max_attempts, e
                    );
                    self.update(generation, |state| {
                        if let Some(front) = state.queue.front_mut() {
                            front.retry_count = attempts;
                        }
                    })?;
                    pause(cancel, self.timings.retry_delay).await?;
                }
            }
        }
    }

    /// Name the open block identity comes from
    ///
    /// An assigned name only counts while it names the connected lock.
    fn target_name(&self) -> Option<String> {
        let assigned = lock(&self.device_name).clone();
        match (assigned, self.link.connected_device_name()) {
            (Some(assigned), Some(connected)) if assigned != connected => {
                warn!(
                    "Ignoring stale target name {}, connected to {}",
                    assigned, connected
                );
                Some(connected)
            }
            (assigned, connected) => assigned.or(connected),
        }
    }

    fn read<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&CommandState) -> T,
    ) -> Result<T, CommandError> {
        let state = self.lock_state();
        if state.generation != generation {
            return Err(CommandError::Cancelled);
        }
        Ok(f(&state))
    }

    fn update<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut CommandState) -> T,
    ) -> Result<T, CommandError> {
        let mut state = self.lock_state();
        if state.generation != generation {
            return Err(CommandError::Cancelled);
        }
        Ok(f(&mut state))
    }

    /// Back to idle if this invocation still owns the state
    fn finish(&self, generation: u64) -> Result<(), CommandError> {
        self.update(generation, |state| {
            state.phase = CommandPhase::Idle;
            state.queue.clear();
            state.cancel = None;
        })
    }

    fn abort(&self, generation: u64) {
        if self.finish(generation).is_ok() {
            debug!("Command state reset");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CommandState> {
        lock(&self.state)
    }

    fn emit(&self, event: CommandEvent) {
        let _ = self.event_sender.send(AppEvent::Command(event));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn require(field: &'static str, value: &str) -> Result<(), CommandError> {
    if value.trim().is_empty() {
        return Err(CommandError::MissingParameter(field));
    }
    Ok(())
}

async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<(), CommandError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CommandError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// First notification that decodes as a response frame
async fn next_response(rx: &mut broadcast::Receiver<Vec<u8>>) -> ResponseFrame {
    loop {
        match rx.recv().await {
            Ok(bytes) => match protocol::decode_response(&bytes) {
                Some(frame) => return frame,
                None => debug!(
                    "Ignoring short notification: {}",
                    protocol::bytes_to_hex(&bytes)
                ),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} notifications", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return std::future::pending().await;
            }
        }
    }
}
