/*
 * Adapted from Stalwart Mail Server, which is available on
 * https://github.com/stalwartlabs/mail-server/
 *
 * and carries the following license notice:
 *
 * Copyright (c) 2023 Stalwart Labs Ltd.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@stalw.art
 * for more details.
*/

use std::sync::Arc;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};

use crate::{
    error::Error,
    executor::worker::WorkerPool,
    smtp::{
        command::{AuthOutcome, CommitOutcome, Event},
        fsm::{Action, DeferredOp, SessionContext, SessionState, StateMachine},
        Configuration, Reply,
    },
    store::Backend,
};

/// Line-framing buffer size for command mode; commands never legitimately
/// approach this.
const COMMAND_LINE_LIMIT: usize = 4096;

/// One SMTP conversation over an established TLS stream.
///
/// The session is the serialisation domain: a single task owns it and runs
/// the read, dispatch, write chain linearly, so no other task ever observes
/// or mutates the context.
pub struct Session<T, B> {
    pub stream: T,
    pub ctx: SessionContext,
    pub fsm: Arc<StateMachine>,
    pub backend: Arc<B>,
    pub workers: Arc<WorkerPool>,
    pub config: Arc<Configuration>,
    pub span: tracing::Span,
    reader: LineReader,
    cancel_rx: watch::Receiver<bool>,
}

impl<T, B> Session<T, B>
where
    T: AsyncRead + AsyncWrite + Unpin,
    B: Backend,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: T,
        fsm: Arc<StateMachine>,
        backend: Arc<B>,
        workers: Arc<WorkerPool>,
        config: Arc<Configuration>,
        span: tracing::Span,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            ctx: SessionContext::new(),
            fsm,
            backend,
            workers,
            config,
            span,
            reader: LineReader::new(),
            cancel_rx,
        }
    }

    /// Run the conversation to completion: greeting, command loop,
    /// teardown.
    pub async fn run(mut self) {
        if self.send_greeting().await {
            self.read_loop().await;
        }
        self.teardown().await;
    }

    async fn send_greeting(&mut self) -> bool {
        let action = self.fsm.dispatch(&mut self.ctx, Event::Connected);
        if !self.apply(action).await {
            return false;
        }
        self.ctx.greeting_sent();
        true
    }

    async fn read_loop(&mut self) {
        loop {
            if matches!(
                self.ctx.state,
                SessionState::AwaitingQuit | SessionState::Closed
            ) {
                break;
            }

            let in_data = self.ctx.state == SessionState::InData;
            let limit = if in_data {
                // The size cap fires before the framing limit in practice.
                self.config.max_message_size.saturating_add(1024)
            } else {
                COMMAND_LINE_LIMIT
            };

            tokio::select! {
                _ = self.cancel_rx.changed() => {
                    tracing::debug!(
                        parent: &self.span,
                        event = "disconnect",
                        reason = "shutdown",
                        "Server shutting down."
                    );
                    self.write_reply(&Reply::new(421, "Closing transmission channel"))
                        .await;
                    break;
                }
                read = tokio::time::timeout(
                    self.config.read_timeout,
                    self.reader.next_line(&mut self.stream, limit),
                ) => {
                    match read {
                        Err(_) => {
                            tracing::debug!(
                                parent: &self.span,
                                event = "disconnect",
                                reason = "timeout",
                                "Connection timed out."
                            );
                            let action = self.fsm.dispatch(&mut self.ctx, Event::Timeout);
                            self.apply(action).await;
                            break;
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(
                                parent: &self.span,
                                event = "error",
                                "Failed to read from stream: {:?}", err
                            );
                            break;
                        }
                        Ok(Ok(ReadOutcome::Closed)) => {
                            tracing::debug!(
                                parent: &self.span,
                                event = "disconnect",
                                reason = "peer",
                                "Connection closed by peer."
                            );
                            break;
                        }
                        Ok(Ok(ReadOutcome::LineTooLong)) => {
                            let event = Event::Error("Line too long".to_string());
                            if !self.handle_event(event).await {
                                break;
                            }
                        }
                        Ok(Ok(ReadOutcome::Line(line))) => {
                            let event = self.decode_line(&line);
                            if !self.handle_event(event).await {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Map a raw line onto an event according to the current state: DATA
    /// payload, AUTH continuation, or a command.
    fn decode_line(&self, line: &[u8]) -> Event {
        match self.ctx.state {
            SessionState::InData => Event::parse_data_line(line),
            SessionState::AwaitingAuthUser | SessionState::AwaitingAuthPass => {
                Event::Auth(String::from_utf8_lossy(line).trim().to_string())
            }
            _ => {
                tracing::trace!(
                    parent: &self.span,
                    event = "read",
                    data = std::str::from_utf8(line).unwrap_or("[invalid UTF8]"),
                    size = line.len()
                );
                Event::parse_command(line)
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> bool {
        let action = self.fsm.dispatch(&mut self.ctx, event);
        self.apply(action).await
    }

    /// Carry out one state machine action. Returns false when the session
    /// must terminate.
    async fn apply(&mut self, action: Action) -> bool {
        match action {
            Action::Silent => true,
            Action::Reply(reply) => self.write_reply(&reply).await,
            Action::Hangup(reply) => {
                self.write_reply(&reply).await;
                false
            }
            Action::Defer(op) => {
                let event = self.run_deferred(op).await;
                match self.fsm.dispatch(&mut self.ctx, event) {
                    Action::Reply(reply) => self.write_reply(&reply).await,
                    Action::Hangup(reply) => {
                        self.write_reply(&reply).await;
                        false
                    }
                    _ => true,
                }
            }
        }
    }

    /// Trampoline a blocking operation onto the worker pool and await its
    /// completion event. No further line is read until this resolves.
    async fn run_deferred(&mut self, op: DeferredOp) -> Event {
        match op {
            DeferredOp::VerifyCredentials { username, secret } => {
                let backend = self.backend.clone();
                let submitted = self
                    .workers
                    .submit(move || backend.verify_credentials(&username, &secret));

                let outcome = match submitted {
                    Ok(handle) => match handle.await {
                        Ok(Ok(true)) => AuthOutcome::Accepted,
                        Ok(Ok(false)) => AuthOutcome::Rejected,
                        Ok(Err(err)) => {
                            tracing::warn!(
                                parent: &self.span,
                                context = "auth",
                                event = "error",
                                error = ?err,
                                "Credential verification failed."
                            );
                            AuthOutcome::Unavailable
                        }
                        Err(_) => AuthOutcome::Unavailable,
                    },
                    Err(_) => AuthOutcome::Unavailable,
                };

                let label = match &outcome {
                    AuthOutcome::Accepted => "accepted",
                    AuthOutcome::Rejected => "rejected",
                    AuthOutcome::Unavailable => "failed",
                };
                metrics::counter!("smtp_auth_total", 1, "outcome" => label);

                Event::AuthDone(outcome)
            }
            DeferredOp::Commit(message) => {
                let size = message.body.len();
                let backend = self.backend.clone();
                let submitted = self.workers.submit(move || backend.store_message(message));

                let outcome = match submitted {
                    Ok(handle) => match handle.await {
                        Ok(Ok(envelope_id)) => {
                            metrics::counter!("smtp_messages_total", 1, "outcome" => "processed");
                            tracing::info!(
                                parent: &self.span,
                                context = "data",
                                event = "message",
                                envelope_id = envelope_id,
                                size = size,
                                "Message committed."
                            );
                            CommitOutcome::Stored(envelope_id)
                        }
                        Ok(Err(err @ (Error::PoolExhausted | Error::PoolClosed))) => {
                            metrics::counter!("smtp_messages_total", 1, "outcome" => "failed");
                            tracing::warn!(
                                parent: &self.span,
                                context = "data",
                                event = "error",
                                error = ?err,
                                "No database connection available."
                            );
                            CommitOutcome::Unavailable
                        }
                        Ok(Err(err)) => {
                            metrics::counter!("smtp_messages_total", 1, "outcome" => "failed");
                            tracing::warn!(
                                parent: &self.span,
                                context = "data",
                                event = "error",
                                error = ?err,
                                "Failed to commit message."
                            );
                            CommitOutcome::Failed
                        }
                        Err(_) => CommitOutcome::Failed,
                    },
                    Err(_) => CommitOutcome::Unavailable,
                };

                Event::CommitDone(outcome)
            }
        }
    }

    async fn write_reply(&mut self, reply: &Reply) -> bool {
        let bytes = reply.to_wire();
        let write = async {
            self.stream.write_all(bytes.as_bytes()).await?;
            self.stream.flush().await
        };

        match tokio::time::timeout(self.config.write_timeout, write).await {
            Ok(Ok(())) => {
                tracing::trace!(
                    parent: &self.span,
                    event = "write",
                    data = bytes.as_str(),
                    size = bytes.len()
                );
                true
            }
            Ok(Err(err)) => {
                tracing::debug!(
                    parent: &self.span,
                    event = "error",
                    "Failed to write to stream: {:?}", err
                );
                false
            }
            Err(_) => {
                tracing::debug!(
                    parent: &self.span,
                    event = "disconnect",
                    reason = "timeout",
                    "Write timed out."
                );
                false
            }
        }
    }

    async fn teardown(&mut self) {
        let _ = self.stream.shutdown().await;
        self.ctx.closed();
    }
}

enum ReadOutcome {
    Line(Vec<u8>),
    LineTooLong,
    Closed,
}

/// CRLF line framing over a raw byte stream. Carries partial input between
/// reads; a line that outgrows the limit is discarded up to its CRLF.
struct LineReader {
    buffer: Vec<u8>,
    discarding: bool,
}

impl LineReader {
    fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(COMMAND_LINE_LIMIT),
            discarding: false,
        }
    }

    async fn next_line<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        limit: usize,
    ) -> std::io::Result<ReadOutcome> {
        let mut chunk = [0u8; 4096];

        loop {
            if self.discarding {
                if let Some(pos) = find_crlf(&self.buffer) {
                    self.buffer.drain(..pos + 2);
                    self.discarding = false;
                } else {
                    self.buffer.clear();
                }
            }

            if !self.discarding {
                if let Some(pos) = find_crlf(&self.buffer) {
                    let mut line: Vec<u8> = self.buffer.drain(..pos + 2).collect();
                    line.truncate(pos);
                    return Ok(ReadOutcome::Line(line));
                }
                if self.buffer.len() > limit {
                    self.discarding = true;
                    return Ok(ReadOutcome::LineTooLong);
                }
            }

            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                return Ok(ReadOutcome::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}
