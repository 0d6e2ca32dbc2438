//! Command queue
//!
//! Every handle owns one queue worker task. The worker is the only code that
//! touches the engine's stdin and stdout, and it takes requests from an
//! unbounded channel one at a time, so commands reach the engine in
//! submission order and a reply can only ever resolve the request that
//! produced it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pvsbridge_process::ManagedChild;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::command::EngineCommand;
use crate::error::{EngineError, Result};
use crate::framing::ReplyFraming;
use crate::handle::HandleStatus;
use crate::parser::{has_error_marker, ReplyParser};
use crate::reader::{Frame, ReplyReader};
use crate::transport::{BoxedReader, BoxedWriter, EngineIo};
use crate::types::EngineResponse;

/// A submitted command awaiting its reply
pub struct PendingRequest {
    pub id: u64,
    pub command: EngineCommand,
    pub submitted_at: Instant,
    pub timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    claim: Arc<DispatchClaim>,
    response_tx: oneshot::Sender<Result<EngineResponse>>,
}

const WAITING: u8 = 0;
const DISPATCHED: u8 = 1;
const WITHDRAWN: u8 = 2;

/// Settles once whether a request reaches the engine or is withdrawn.
///
/// The worker and a cancelling caller race for it; whichever side claims
/// first decides, so a withdrawn request is never written and a written one
/// is never reported as withdrawn.
#[derive(Debug, Default)]
pub(crate) struct DispatchClaim(AtomicU8);

impl DispatchClaim {
    /// Worker side: true when the request may be written to the engine
    fn dispatch(&self) -> bool {
        self.0
            .compare_exchange(WAITING, DISPATCHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Caller side: true when the request will never be written
    fn withdraw(&self) -> bool {
        self.0
            .compare_exchange(WAITING, WITHDRAWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl PendingRequest {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Claim the request for the engine unless its caller already gave up
    fn claim_for_dispatch(&self) -> bool {
        !self.response_tx.is_closed() && self.claim.dispatch() && !self.is_cancelled()
    }

    fn respond(self, status: &HandleStatus, result: Result<EngineResponse>) {
        status.release();
        // The caller may have gone away
        let _ = self.response_tx.send(result);
    }
}

/// Submission side of a handle's queue
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<PendingRequest>,
    status: Arc<HandleStatus>,
    next_id: AtomicU64,
    default_timeout: Option<Duration>,
}

impl CommandQueue {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<PendingRequest>,
        status: Arc<HandleStatus>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            tx,
            status,
            next_id: AtomicU64::new(1),
            default_timeout,
        }
    }

    /// Chain `command` behind every request already submitted
    pub async fn execute(&self, command: EngineCommand) -> Result<EngineResponse> {
        self.run(command, false, None, self.default_timeout).await
    }

    /// Fail with `Busy` unless the engine is idle with nothing queued
    pub async fn execute_immediate(&self, command: EngineCommand) -> Result<EngineResponse> {
        self.run(command, true, None, self.default_timeout).await
    }

    pub async fn execute_with_cancel(
        &self,
        command: EngineCommand,
        cancel: CancellationToken,
    ) -> Result<EngineResponse> {
        self.run(command, false, Some(cancel), self.default_timeout)
            .await
    }

    /// Requests submitted and not yet answered
    pub fn len(&self) -> usize {
        self.status.outstanding()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn run(
        &self,
        command: EngineCommand,
        exclusive: bool,
        cancel: Option<CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<EngineResponse> {
        let (mut rx, claim) = self.submit(command, exclusive, cancel.clone(), timeout)?;
        let Some(token) = cancel else {
            return rx.await.unwrap_or_else(|_| Err(self.status.unavailable()));
        };

        tokio::select! {
            result = &mut rx => result.unwrap_or_else(|_| Err(self.status.unavailable())),
            _ = token.cancelled() => {
                if claim.withdraw() {
                    Err(EngineError::Cancelled(
                        "command withdrawn before dispatch".to_string(),
                    ))
                } else {
                    // The worker owns it now and answers either way
                    rx.await.unwrap_or_else(|_| Err(self.status.unavailable()))
                }
            }
        }
    }

    fn submit(
        &self,
        command: EngineCommand,
        exclusive: bool,
        cancel: Option<CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<(oneshot::Receiver<Result<EngineResponse>>, Arc<DispatchClaim>)> {
        if self.status.terminal_state().is_some() {
            return Err(self.status.unavailable());
        }
        if !self.status.reserve(exclusive) {
            return Err(EngineError::Busy {
                command: command.text().to_string(),
            });
        }

        let (response_tx, response_rx) = oneshot::channel();
        let claim = Arc::new(DispatchClaim::default());
        let request = PendingRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            command,
            submitted_at: Instant::now(),
            timeout,
            cancel,
            claim: claim.clone(),
            response_tx,
        };
        trace!(
            handle = self.status.id(),
            request = request.id,
            family = %request.command.family(),
            "Command queued"
        );

        if let Err(mpsc::error::SendError(request)) = self.tx.send(request) {
            request.respond(&self.status, Err(self.status.unavailable()));
            return Err(self.status.unavailable());
        }
        Ok((response_rx, claim))
    }
}

enum Outcome {
    Done(Result<String>),
    TimedOut(Duration),
    Cancelled,
    Killed,
}

/// Owns the engine streams; runs as one task per handle
pub(crate) struct QueueWorker {
    reader: ReplyReader<BoxedReader>,
    writer: Option<BoxedWriter>,
    child: Option<ManagedChild>,
    parser: ReplyParser,
    rx: mpsc::UnboundedReceiver<PendingRequest>,
    status: Arc<HandleStatus>,
    shutdown: CancellationToken,
    startup_timeout: Duration,
    ready: Option<oneshot::Sender<Result<()>>>,
}

impl QueueWorker {
    pub(crate) fn new(
        io: EngineIo,
        framing: Arc<dyn ReplyFraming>,
        rx: mpsc::UnboundedReceiver<PendingRequest>,
        status: Arc<HandleStatus>,
        shutdown: CancellationToken,
        startup_timeout: Duration,
        ready: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self {
            reader: ReplyReader::new(io.reader, framing),
            writer: Some(io.writer),
            child: io.child,
            parser: ReplyParser::new(),
            rx,
            status,
            shutdown,
            startup_timeout,
            ready: Some(ready),
        }
    }

    pub(crate) async fn run(mut self) {
        let startup = self.await_first_prompt().await;
        let started = startup.is_ok();
        if let Err(err) = &startup {
            debug!(handle = self.status.id(), error = %err, "No prompt from engine");
            self.status.mark_crashed();
        }
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(startup);
        }
        if started {
            self.serve().await;
        }
        self.finish().await;
    }

    async fn await_first_prompt(&mut self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let limit = self.startup_timeout;
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                Err(EngineError::Cancelled("engine stopped during startup".to_string()))
            }
            frame = tokio::time::timeout(limit, self.reader.next_frame()) => match frame {
                Err(_) => Err(EngineError::Timeout {
                    command: "startup".to_string(),
                    seconds: limit.as_secs(),
                }),
                Ok(Ok(Frame::Reply(banner))) => {
                    trace!(handle = self.status.id(), banner = %banner, "Engine banner");
                    Ok(())
                }
                Ok(Ok(Frame::Nested { level, .. })) => Err(EngineError::Crashed(format!(
                    "engine started in debugger level {level}"
                ))),
                Ok(Err(err)) => Err(err),
            },
        }
    }

    async fn serve(&mut self) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };

            if !request.claim_for_dispatch() {
                debug!(handle = self.status.id(), request = request.id, "Skipping abandoned command");
                request.respond(
                    &self.status,
                    Err(EngineError::Cancelled(
                        "command withdrawn before dispatch".to_string(),
                    )),
                );
                continue;
            }

            if !self.dispatch(request).await {
                break;
            }
        }
    }

    /// Run one request to completion; false means the engine is unusable
    async fn dispatch(&mut self, request: PendingRequest) -> bool {
        let Some(writer) = self.writer.as_mut() else {
            request.respond(&self.status, Err(self.status.unavailable()));
            return false;
        };

        self.status.begin_command();
        debug!(
            handle = self.status.id(),
            request = request.id,
            family = %request.command.family(),
            queued_ms = request.submitted_at.elapsed().as_millis() as u64,
            "Dispatching command"
        );

        let shutdown = self.shutdown.clone();
        let cancel = request.cancel.clone().unwrap_or_else(CancellationToken::new);
        let limit = request.timeout;
        let deadline = async move {
            match limit {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Outcome::Killed,
            _ = cancel.cancelled() => Outcome::Cancelled,
            limit = deadline => Outcome::TimedOut(limit),
            result = exchange(&mut self.reader, writer, request.command.text()) => Outcome::Done(result),
        };

        match outcome {
            Outcome::Done(Ok(raw)) => {
                let response = self.parser.parse(request.command.family(), &raw);
                debug!(
                    handle = self.status.id(),
                    request = request.id,
                    error = response.is_error(),
                    "Reply complete"
                );
                self.status.end_command();
                request.respond(&self.status, Ok(response));
                true
            }
            Outcome::Done(Err(err)) => {
                warn!(handle = self.status.id(), command = %request.command, error = %err, "Engine fault");
                self.status.mark_crashed();
                request.respond(&self.status, Err(err));
                false
            }
            Outcome::TimedOut(limit) => {
                warn!(
                    handle = self.status.id(),
                    command = %request.command,
                    seconds = limit.as_secs(),
                    "Command timed out"
                );
                self.status.mark_crashed();
                let err = EngineError::Timeout {
                    command: request.command.text().to_string(),
                    seconds: limit.as_secs(),
                };
                request.respond(&self.status, Err(err));
                false
            }
            Outcome::Cancelled => {
                warn!(handle = self.status.id(), command = %request.command, "Command cancelled in flight");
                self.status.mark_crashed();
                request.respond(
                    &self.status,
                    Err(EngineError::Cancelled(
                        "command cancelled in flight; engine stopped".to_string(),
                    )),
                );
                false
            }
            Outcome::Killed => {
                request.respond(&self.status, Err(self.status.unavailable()));
                false
            }
        }
    }

    async fn finish(&mut self) {
        if self.status.terminal_state().is_none() {
            self.status.mark_killed();
        }

        self.rx.close();
        while let Ok(request) = self.rx.try_recv() {
            request.respond(&self.status, Err(self.status.unavailable()));
        }

        // Closing stdin first lets a well-behaved engine exit on its own
        self.writer = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(handle = self.status.id(), error = %e, "Failed to kill engine process");
            }
        }
        debug!(handle = self.status.id(), state = %self.status.state(), "Queue worker stopped");
    }
}

/// Write one command and read its reply.
///
/// Output left over from the previous command is dropped before writing. A
/// nested prompt directly after an engine error is answered once with the
/// framing's acknowledgement; any other nested prompt is a crash.
async fn exchange(
    reader: &mut ReplyReader<BoxedReader>,
    writer: &mut BoxedWriter,
    text: &str,
) -> Result<String> {
    reader.discard_pending()?;
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut collected = String::new();
    let mut acknowledged = false;
    loop {
        match reader.next_frame().await? {
            Frame::Reply(body) => {
                collected.push_str(&body);
                trace!(raw = %collected, "Engine reply");
                return Ok(collected);
            }
            Frame::Nested { text, level } if !acknowledged && has_error_marker(&text) => {
                acknowledged = true;
                debug!(level, "Acknowledging nested error prompt");
                collected.push_str(&text);
                collected.push('\n');
                let ack = reader.framing().acknowledgement().to_string();
                writer.write_all(ack.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Frame::Nested { text, level } => {
                let tail: String = text.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
                return Err(EngineError::Crashed(format!(
                    "engine entered debugger level {level}: {tail}"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_claim_has_one_winner() {
        let withdrawn = DispatchClaim::default();
        assert!(withdrawn.withdraw());
        assert!(!withdrawn.dispatch());

        let dispatched = DispatchClaim::default();
        assert!(dispatched.dispatch());
        assert!(!dispatched.withdraw());
        assert!(!dispatched.dispatch());
    }
}
