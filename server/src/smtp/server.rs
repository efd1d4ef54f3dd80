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

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::Span;

use crate::{
    executor::worker::WorkerPool,
    listener::Listener,
    smtp::{fsm::StateMachine, session::Session, Configuration},
    store::Backend,
    tls::TlsProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running,
    /// Not accepting; existing sessions are draining.
    Pausing,
    /// Not accepting and no session is left.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Close the acceptor and let sessions run to natural termination.
    Pausing,
    /// Close the acceptor and cancel in-flight sessions.
    Paused,
}

pub struct SessionData<T: AsyncRead + AsyncWrite + Unpin + 'static> {
    pub stream: T,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub span: tracing::Span,
    pub instance: Arc<ServerInstance>,
}

#[derive(Debug)]
pub struct SmtpServer {
    pub id: String,
    pub listener: Listener,
    pub tls: Arc<TlsProvider>,
    pub configuration: Arc<Configuration>,
    pub max_connections: usize,
}

impl SmtpServer {
    /// Bind the acceptor and start the accept loop. The server transitions
    /// from `Stopped` to `Running`; the returned handle controls the rest
    /// of its lifecycle.
    pub fn spawn(self, manager: impl SessionManager) -> std::io::Result<ServerHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let active_sessions = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(Mutex::new(ServerState::Running));

        let instance = Arc::new(ServerInstance {
            id: self.id,
            tls: self.tls,
            configuration: self.configuration,
            cancel_rx,
            active_sessions: active_sessions.clone(),
        });

        tracing::info!(
            id = instance.id,
            bind.ip = self.listener.addr.ip().to_string(),
            bind.port = self.listener.addr.port(),
            "Starting listener"
        );
        let local_ip = self.listener.addr.ip();
        let max_connections = self.max_connections;

        let tcp_listener = self.listener.bind()?;
        // Retained for the per-connection TCP options.
        let listener = self.listener;

        let handle = ServerHandle {
            shutdown_tx,
            cancel_tx,
            active_sessions,
            state: state.clone(),
        };

        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    stream = tcp_listener.accept() => {
                        match stream {
                            Ok((stream, remote_addr)) => {
                                // Convert mapped IPv6 addresses to IPv4
                                let remote_ip = match remote_addr.ip() {
                                    IpAddr::V6(ip) => {
                                        ip.to_ipv4_mapped()
                                        .map(IpAddr::V4)
                                        .unwrap_or(IpAddr::V6(ip))
                                    }
                                    remote_ip => remote_ip,
                                };
                                let remote_port = remote_addr.port();

                                let span = tracing::info_span!(
                                    "session",
                                    instance = instance.id,
                                    remote.ip = remote_ip.to_string(),
                                    remote.port = remote_port,
                                );

                                listener.configure(&stream);

                                if instance.active_sessions.load(Ordering::Relaxed) >= max_connections {
                                    instance.clone().reject_over_capacity(stream, span);
                                    continue;
                                }

                                metrics::increment_gauge!("smtp_sessions_active", 1.0);

                                // Spawn connection
                                manager.spawn(SessionData {
                                    stream,
                                    local_ip,
                                    remote_ip,
                                    remote_port,
                                    span,
                                    instance: instance.clone(),
                                });
                            }
                            Err(err) => {
                                tracing::debug!(context = "io",
                                                event = "error",
                                                instance = instance.id,
                                                "Failed to accept TCP connection: {}", err);
                            }
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        tracing::debug!(
                            event = "shutdown",
                            instance = instance.id,
                            "Listener shutting down.");
                        let mut state = state.lock().unwrap();
                        if *state == ServerState::Running {
                            *state = ServerState::Pausing;
                        }
                        manager.shutdown();
                        break;
                    }
                };
            }
        });

        Ok(handle)
    }
}

/// Controls a spawned server: lifecycle state, drain and cancellation.
pub struct ServerHandle {
    shutdown_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    active_sessions: Arc<AtomicUsize>,
    state: Arc<Mutex<ServerState>>,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        let state = *self.state.lock().unwrap();
        match state {
            ServerState::Pausing if self.active_sessions.load(Ordering::Acquire) == 0 => {
                ServerState::Paused
            }
            state => state,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Close the acceptor. `StopMode::Paused` additionally cancels
    /// in-flight sessions, which abort their reads and tear down.
    pub fn stop(&self, mode: StopMode) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ServerState::Running {
                *state = ServerState::Pausing;
            }
        }
        self.shutdown_tx.send(true).ok();
        if mode == StopMode::Paused {
            self.cancel_tx.send(true).ok();
        }
    }
}

pub struct ServerInstance {
    pub id: String,
    pub tls: Arc<TlsProvider>,
    pub configuration: Arc<Configuration>,
    pub cancel_rx: watch::Receiver<bool>,
    pub active_sessions: Arc<AtomicUsize>,
}

impl ServerInstance {
    pub async fn tls_accept<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: S,
        span: &Span,
    ) -> Result<TlsStream<S>, ()> {
        let acceptor = TlsAcceptor::from(self.tls.server_config());

        match acceptor.accept(stream).await {
            Ok(stream) => {
                let (_, connection) = stream.get_ref();
                tracing::info!(
                    parent: span,
                    context = "tls",
                    event = "handshake",
                    version = ?connection.protocol_version(),
                    cipher = ?connection.negotiated_cipher_suite(),
                );
                Ok(stream)
            }
            Err(err) => {
                tracing::debug!(
                    parent: span,
                    context = "tls",
                    event = "error",
                    "Failed to accept TLS connection: {}",
                    err
                );
                Err(())
            }
        }
    }

    /// Over the connection cap: finish the handshake, send 421 and close.
    fn reject_over_capacity(self: Arc<Self>, stream: TcpStream, span: tracing::Span) {
        metrics::counter!("smtp_sessions_total", 1, "outcome" => "over-capacity");
        tokio::spawn(async move {
            let handshake = tokio::time::timeout(
                self.configuration.connection_timeout,
                self.tls_accept(stream, &span),
            );
            if let Ok(Ok(mut stream)) = handshake.await {
                let _ = stream.write_all(b"421 Too many connections\r\n").await;
                let _ = stream.shutdown().await;
            }
            tracing::debug!(
                parent: &span,
                event = "disconnect",
                reason = "over-capacity",
                "Connection limit reached."
            );
        });
    }
}

pub trait SessionManager: Sync + Send + 'static + Clone {
    fn spawn(&self, session: SessionData<TcpStream>);
    fn shutdown(&self);
}

/// Builds a [`Session`] for every accepted connection: implicit TLS
/// handshake first, then the SMTP conversation.
pub struct SmtpSessionManager<B> {
    pub fsm: Arc<StateMachine>,
    pub backend: Arc<B>,
    pub workers: Arc<WorkerPool>,
    pub configuration: Arc<Configuration>,
}

impl<B> Clone for SmtpSessionManager<B> {
    fn clone(&self) -> Self {
        Self {
            fsm: self.fsm.clone(),
            backend: self.backend.clone(),
            workers: self.workers.clone(),
            configuration: self.configuration.clone(),
        }
    }
}

impl<B: Backend> SessionManager for SmtpSessionManager<B> {
    fn spawn(&self, session: SessionData<TcpStream>) {
        metrics::counter!("smtp_sessions_total", 1);

        let fsm = self.fsm.clone();
        let backend = self.backend.clone();
        let workers = self.workers.clone();
        let configuration = self.configuration.clone();

        tokio::spawn(async move {
            let instance = session.instance;
            let _live = LiveSession::enter(instance.active_sessions.clone());

            let span = session.span.clone();
            let handshake = tokio::time::timeout(
                configuration.connection_timeout,
                instance.tls_accept(session.stream, &session.span),
            );
            let stream = match handshake.await {
                Ok(Ok(stream)) => stream,
                Ok(Err(())) => return,
                Err(_) => {
                    tracing::debug!(
                        parent: &span,
                        event = "disconnect",
                        reason = "timeout",
                        "TLS handshake timed out."
                    );
                    return;
                }
            };

            Session::new(
                stream,
                fsm,
                backend,
                workers,
                configuration,
                session.span,
                instance.cancel_rx.clone(),
            )
            .run()
            .await;
        });
    }

    fn shutdown(&self) {}
}

/// Scoped live-session accounting: counts toward `max_connections` and the
/// active gauge until dropped.
struct LiveSession {
    counter: Arc<AtomicUsize>,
}

impl LiveSession {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        metrics::increment_gauge!("smtp_sessions_active", -1.0);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn handle(active: usize) -> ServerHandle {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        ServerHandle {
            shutdown_tx,
            cancel_tx,
            active_sessions: Arc::new(AtomicUsize::new(active)),
            state: Arc::new(Mutex::new(ServerState::Running)),
        }
    }

    #[test]
    fn pausing_promotes_to_paused_once_drained() {
        let handle = handle(2);
        assert_eq!(handle.state(), ServerState::Running);

        handle.stop(StopMode::Pausing);
        assert_eq!(handle.state(), ServerState::Pausing);

        handle.active_sessions.store(0, Ordering::Release);
        assert_eq!(handle.state(), ServerState::Paused);
    }

    #[test]
    fn paused_mode_cancels_sessions() {
        let handle = handle(1);
        let mut cancel_rx = handle.cancel_tx.subscribe();
        assert!(!*cancel_rx.borrow());

        handle.stop(StopMode::Paused);
        assert!(cancel_rx.has_changed().unwrap());

        handle.active_sessions.store(0, Ordering::Release);
        assert_eq!(handle.state(), ServerState::Paused);
    }

    #[test]
    fn live_session_guard_tracks_the_counter() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _live = LiveSession::enter(counter.clone());
            assert_eq!(counter.load(Ordering::Acquire), 1);
        }
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }
}
