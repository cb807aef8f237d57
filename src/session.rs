//! State machine and completion signal for a single capture attempt.
//!
//! A [`CaptureSession`] is fed from two sides at once: the transport's
//! notification context delivers status and acceleration events, while the
//! coordinating task sits in [`CaptureSession::wait`] and may force a timeout.
//! Both sides mutate the same state, so it lives behind one mutex. Completion is
//! published through a `watch` channel carrying the session state; the terminal
//! state is entered at most once, and every later event is ignored.
//!
//! ```text
//! Idle ──begin──▶ AwaitingCountdown ──Capturing──▶ Capturing ──Complete──▶ Complete
//!                   │  ▲ Countdown3/2/1                │ chunk
//!                   └──┘ (chunks dropped)              └──▶ (record)
//! any non-terminal ──Error──▶ DeviceError
//! any non-terminal ──deadline──▶ TimedOut
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::protocol::{
    decode_accel_chunk, decode_command, decode_status, Chunk, Command, Sample, Status,
    EXPECTED_CHUNKS,
};
use crate::reassembler::ChunkReassembler;

/// Callback invoked with every status that moves a session forward.
///
/// Runs on the notification context: it must return quickly and must not wait
/// on the session.
pub type StatusObserver = Arc<dyn Fn(Status) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingCountdown,
    Capturing,
    Complete,
    TimedOut,
    DeviceError,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::TimedOut | SessionState::DeviceError
        )
    }
}

/// Terminal result stored by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Samples in sequence order. Empty if the device completed without
    /// sending data while capturing.
    Complete(Vec<Sample>),
    TimedOut,
    DeviceError,
}

/// Effect an event had on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No change: the session is closed, not started, or the event is irrelevant.
    Ignored,
    /// A chunk was stored.
    Recorded,
    /// Non-terminal step (including the countdown self-loop).
    Progress(SessionState),
    /// The session entered a terminal state and signalled completion.
    Terminal(SessionState),
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    chunks: ChunkReassembler,
    outcome: Option<SessionOutcome>,
    started_at: Instant,
    finished_at: Option<Instant>,
    device_command: Option<Command>,
}

impl SessionInner {
    fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.started_at)
    }
}

pub struct CaptureSession {
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    expected_chunks: usize,
    observer: Option<StatusObserver>,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                chunks: ChunkReassembler::new(),
                outcome: None,
                started_at: Instant::now(),
                finished_at: None,
                device_command: None,
            }),
            state_tx,
            expected_chunks: EXPECTED_CHUNKS,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: StatusObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Number of chunks the device is expected to send; only used for gap reporting.
    pub fn with_expected_chunks(mut self, expected: usize) -> Self {
        self.expected_chunks = expected;
        self
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.lock().outcome.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().chunks.chunk_count()
    }

    /// Time since [`begin`](Self::begin), frozen once the session closes.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed()
    }

    /// True while the sketch reports `Busy` on the command characteristic.
    pub fn device_busy(&self) -> bool {
        self.lock().device_command == Some(Command::Busy)
    }

    /// Watch the session state. The receiver sees the terminal state once it is set.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Mark the start command as issued.
    pub fn begin(&self) -> Transition {
        let mut inner = self.lock();
        if inner.state != SessionState::Idle {
            return Transition::Ignored;
        }
        inner.chunks.clear();
        inner.started_at = Instant::now();
        self.set_state(&mut inner, SessionState::AwaitingCountdown);
        Transition::Progress(SessionState::AwaitingCountdown)
    }

    pub fn handle_status(&self, status: Status) -> Transition {
        let transition = {
            let mut inner = self.lock();
            self.apply_status(&mut inner, status)
        };
        if transition != Transition::Ignored {
            if let Some(observer) = &self.observer {
                observer(status);
            }
        }
        transition
    }

    pub fn handle_chunk(&self, chunk: Chunk) -> Transition {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Capturing => {
                let seq = chunk.seq;
                inner.chunks.record(chunk);
                if (seq as usize + 1) % 10 == 0 {
                    debug!(
                        "receiving data: seq={}, chunks={}/{}",
                        seq,
                        inner.chunks.chunk_count(),
                        self.expected_chunks
                    );
                }
                Transition::Recorded
            }
            state => {
                debug!("dropping chunk: seq={}, state={:?}", chunk.seq, state);
                Transition::Ignored
            }
        }
    }

    /// Status notification entry point for the transport. Never fails.
    pub fn on_status_notification(&self, data: &[u8]) -> Transition {
        match decode_status(data) {
            Ok(status) => self.handle_status(status),
            Err(e) => {
                warn!("ignoring malformed status notification: {}", e);
                Transition::Ignored
            }
        }
    }

    /// Acceleration notification entry point for the transport. Never fails.
    pub fn on_accel_notification(&self, data: &[u8]) -> Transition {
        match decode_accel_chunk(data) {
            Ok(chunk) => self.handle_chunk(chunk),
            Err(e) => {
                warn!("ignoring malformed acceleration notification: {}", e);
                Transition::Ignored
            }
        }
    }

    /// Command notification entry point for the transport. Never fails.
    ///
    /// Tracks the sketch's `Busy`/`Idle` report; does not drive the state machine.
    pub fn on_command_notification(&self, data: &[u8]) -> Option<Command> {
        match decode_command(data) {
            Ok(command) => {
                let mut inner = self.lock();
                if inner.device_command != Some(command) {
                    debug!(
                        "device command state: {:?} (session {:?})",
                        command, inner.state
                    );
                }
                inner.device_command = Some(command);
                Some(command)
            }
            Err(e) => {
                warn!("ignoring malformed command notification: {}", e);
                None
            }
        }
    }

    /// Force the timeout transition. No effect on a closed session.
    pub fn expire(&self) -> Transition {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return Transition::Ignored;
        }
        let discarded = inner.chunks.chunk_count();
        inner.chunks.clear();
        warn!(
            "capture timed out: state={:?}, elapsed={:?}, discarded_chunks={}",
            inner.state,
            inner.elapsed(),
            discarded
        );
        self.finish(&mut inner, SessionState::TimedOut, SessionOutcome::TimedOut)
    }

    /// Wait for the session to close, forcing a timeout after `timeout`.
    ///
    /// If a terminal event lands while the deadline fires, whichever reached
    /// the session first decides the outcome.
    pub async fn wait(&self, timeout: Duration) -> SessionOutcome {
        let mut rx = self.state_tx.subscribe();
        let closed = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal()))
            .await
            .is_ok();
        if !closed {
            self.expire();
        }
        self.outcome().unwrap_or(SessionOutcome::TimedOut)
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_status(&self, inner: &mut SessionInner, status: Status) -> Transition {
        if inner.state.is_terminal() {
            debug!(
                "late status after close: status={:?}, state={:?}",
                status, inner.state
            );
            return Transition::Ignored;
        }

        match (inner.state, status) {
            (_, Status::Error) => {
                warn!(
                    "device reported capture error: state={:?}, chunks={}",
                    inner.state,
                    inner.chunks.chunk_count()
                );
                inner.chunks.clear();
                self.finish(inner, SessionState::DeviceError, SessionOutcome::DeviceError)
            }
            (SessionState::Idle, _) => Transition::Ignored,
            (SessionState::AwaitingCountdown, s) if s.countdown().is_some() => {
                debug!("countdown: {:?}", s);
                Transition::Progress(SessionState::AwaitingCountdown)
            }
            (SessionState::AwaitingCountdown, Status::Capturing) => {
                inner.chunks.clear();
                self.set_state(inner, SessionState::Capturing);
                info!("device capturing");
                Transition::Progress(SessionState::Capturing)
            }
            (SessionState::AwaitingCountdown | SessionState::Capturing, Status::Complete) => {
                let missing = inner.chunks.missing(self.expected_chunks);
                if !missing.is_empty() && !inner.chunks.is_empty() {
                    warn!(
                        "sequence gaps in capture: missing={} of {}",
                        missing.len(),
                        self.expected_chunks
                    );
                }
                let samples = inner.chunks.flatten();
                info!(
                    "capture complete: chunks={}, samples={}, elapsed={:?}",
                    inner.chunks.chunk_count(),
                    samples.len(),
                    inner.elapsed()
                );
                inner.chunks.clear();
                self.finish(inner, SessionState::Complete, SessionOutcome::Complete(samples))
            }
            (state, status) => {
                debug!("ignoring status: status={:?}, state={:?}", status, state);
                Transition::Ignored
            }
        }
    }

    fn finish(
        &self,
        inner: &mut SessionInner,
        state: SessionState,
        outcome: SessionOutcome,
    ) -> Transition {
        debug_assert!(state.is_terminal());
        debug_assert!(inner.outcome.is_none());
        inner.outcome = Some(outcome);
        inner.finished_at = Some(Instant::now());
        self.set_state(inner, state);
        Transition::Terminal(state)
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }
}
