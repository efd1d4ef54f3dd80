/*
 * Loam Mail Server
 *
 * Copyright (c) 2023 Tibor Djurica Potpara
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
*/

use std::{net::SocketAddr, time::Duration};

use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Listening endpoint for the submission service.
///
/// The accept backlog is sized from the session cap instead of a fixed
/// constant: past `max_connections` the server answers 421 anyway, so a
/// deeper backlog only delays the rejection.
#[derive(Debug)]
pub struct Listener {
    pub addr: SocketAddr,
    pub backlog: u32,

    // Per-connection TCP options
    pub nodelay: bool,
    pub ttl: Option<u32>,
    pub linger: Option<Duration>,
}

impl Listener {
    pub fn new(addr: SocketAddr, max_connections: usize) -> Self {
        Self {
            addr,
            backlog: max_connections.clamp(16, 1024) as u32,
            nodelay: true,
            ttl: None,
            linger: None,
        }
    }

    /// Create the socket, bind it and start listening.
    pub fn bind(&self) -> std::io::Result<TcpListener> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }?;

        socket.set_reuseaddr(true)?;
        socket.set_reuseport(true)?;
        socket.bind(self.addr)?;
        socket.listen(self.backlog)
    }

    /// Apply the per-connection TCP options to an accepted stream. Option
    /// failures are logged, never fatal.
    pub fn configure(&self, stream: &TcpStream) {
        if let Err(err) = stream.set_nodelay(self.nodelay) {
            tracing::warn!(
                context = "tcp",
                event = "error",
                "Failed to set no-delay: {}",
                err
            );
        }
        if let Some(ttl) = self.ttl {
            if let Err(err) = stream.set_ttl(ttl) {
                tracing::warn!(
                    context = "tcp",
                    event = "error",
                    "Failed to set TTL: {}",
                    err
                );
            }
        }
        if self.linger.is_some() {
            if let Err(err) = stream.set_linger(self.linger) {
                tracing::warn!(
                    context = "tcp",
                    event = "error",
                    "Failed to set linger: {}",
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backlog_follows_the_connection_cap() {
        let addr: SocketAddr = "127.0.0.1:2525".parse().unwrap();
        assert_eq!(Listener::new(addr, 200).backlog, 200);
        assert_eq!(Listener::new(addr, 1).backlog, 16);
        assert_eq!(Listener::new(addr, 100_000).backlog, 1024);
    }
}
