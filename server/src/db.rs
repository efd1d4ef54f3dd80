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
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use mysql::prelude::Queryable;

use crate::error::{Error, Result};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub initial_pool_size: usize,
    pub max_pool_size: usize,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            host: "localhost".to_string(),
            port: 3306,
            user: "loam".to_string(),
            password: String::new(),
            database: "loam".to_string(),
            initial_pool_size: 5,
            max_pool_size: 10,
            connection_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Builds and probes the connections held by [`DbPool`].
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> Result<Self::Connection>;

    /// Liveness probe run on a free connection before it is handed out.
    fn is_valid(&self, conn: &mut Self::Connection) -> bool;
}

pub struct MySqlConnectionManager {
    opts: mysql::Opts,
}

impl MySqlConnectionManager {
    pub fn new(config: &DbConfig) -> Self {
        let opts = mysql::OptsBuilder::new()
            .ip_or_hostname(Some(config.host.clone()))
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.database.clone()));

        Self { opts: opts.into() }
    }
}

impl ConnectionManager for MySqlConnectionManager {
    type Connection = mysql::Conn;

    fn connect(&self) -> Result<mysql::Conn> {
        Ok(mysql::Conn::new(self.opts.clone())?)
    }

    fn is_valid(&self, conn: &mut mysql::Conn) -> bool {
        conn.query_first::<u8, _>("SELECT 1").is_ok()
    }
}

struct Idle<C> {
    conn: C,
    last_used: Instant,
}

struct Shared<C> {
    free: VecDeque<Idle<C>>,
    /// Free plus leased connections.
    size: usize,
    closing: bool,
}

/// Database connection pool.
///
/// Connections are created lazily up to `max_pool_size` and handed out as
/// RAII [`PooledConn`] leases. `acquire` blocks the calling thread, so it
/// must only be used from the worker executor.
pub struct DbPool<M: ConnectionManager> {
    manager: M,
    initial_size: usize,
    max_size: usize,
    acquire_timeout: Duration,
    idle_timeout: Duration,
    shared: Mutex<Shared<M::Connection>>,
    available: Condvar,
    reaper: Mutex<Option<std::thread::JoinHandle<()>>>,
    reaper_stop: Arc<(Mutex<bool>, Condvar)>,
}

impl<M: ConnectionManager> DbPool<M> {
    pub fn start(
        manager: M,
        initial_size: usize,
        max_size: usize,
        acquire_timeout: Duration,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let mut free = VecDeque::with_capacity(initial_size);
        for _ in 0..initial_size {
            match manager.connect() {
                Ok(conn) => free.push_back(Idle {
                    conn,
                    last_used: Instant::now(),
                }),
                Err(e) => {
                    tracing::warn!(
                        context = "db",
                        event = "error",
                        "Failed to pre-create pooled connection: {}",
                        e
                    );
                }
            }
        }
        let size = free.len();

        let pool = Arc::new(Self {
            manager,
            initial_size,
            max_size,
            acquire_timeout,
            idle_timeout,
            shared: Mutex::new(Shared {
                free,
                size,
                closing: false,
            }),
            available: Condvar::new(),
            reaper: Mutex::new(None),
            reaper_stop: Arc::new((Mutex::new(false), Condvar::new())),
        });

        let reaper = {
            let pool = pool.clone();
            std::thread::Builder::new()
                .name("loam-db-reaper".to_string())
                .spawn(move || pool.reaper_loop())
                .expect("failed to spawn pool maintenance thread")
        };
        *pool.reaper.lock().unwrap() = Some(reaper);

        pool
    }

    /// Lease a validated connection, waiting up to the configured acquire
    /// timeout when the pool is saturated.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledConn<M>> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut shared = self.shared.lock().unwrap();

        loop {
            if shared.closing {
                return Err(Error::PoolClosed);
            }

            if let Some(mut idle) = shared.free.pop_front() {
                drop(shared);
                if self.manager.is_valid(&mut idle.conn) {
                    return Ok(PooledConn::new(self.clone(), idle.conn));
                }

                // Probe failed; rebuild the connection behind the lease.
                tracing::debug!(
                    context = "db",
                    event = "revalidate",
                    "Replacing dead pooled connection"
                );
                match self.manager.connect() {
                    Ok(conn) => return Ok(PooledConn::new(self.clone(), conn)),
                    Err(e) => {
                        tracing::warn!(
                            context = "db",
                            event = "error",
                            "Failed to replace dead connection: {}",
                            e
                        );
                        shared = self.shared.lock().unwrap();
                        shared.size -= 1;
                        continue;
                    }
                }
            }

            if shared.size < self.max_size {
                shared.size += 1;
                drop(shared);
                match self.manager.connect() {
                    Ok(conn) => return Ok(PooledConn::new(self.clone(), conn)),
                    Err(e) => {
                        let mut shared = self.shared.lock().unwrap();
                        shared.size -= 1;
                        drop(shared);
                        self.available.notify_one();
                        return Err(e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::PoolExhausted);
            }
            let (guard, _) = self
                .available
                .wait_timeout(shared, deadline - now)
                .unwrap();
            shared = guard;
        }
    }

    fn release(&self, conn: M::Connection, broken: bool) {
        let mut shared = self.shared.lock().unwrap();
        if broken || shared.closing {
            shared.size -= 1;
        } else {
            shared.free.push_back(Idle {
                conn,
                last_used: Instant::now(),
            });
        }
        drop(shared);
        self.available.notify_one();
    }

    /// `(pool_size, free, in_use)`.
    pub fn stats(&self) -> (usize, usize, usize) {
        let shared = self.shared.lock().unwrap();
        (
            shared.size,
            shared.free.len(),
            shared.size - shared.free.len(),
        )
    }

    /// Close the pool: wake all waiters with an error, disconnect idle
    /// connections and stop the maintenance thread. Leased connections are
    /// discarded as they are returned.
    pub fn close(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.closing {
                return;
            }
            shared.closing = true;
            let drained = shared.free.len();
            shared.free.clear();
            shared.size -= drained;
        }
        self.available.notify_all();

        let (stop, stop_cv) = &*self.reaper_stop;
        *stop.lock().unwrap() = true;
        stop_cv.notify_all();

        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.join().ok();
        }
    }

    fn reaper_loop(&self) {
        let (stop, stop_cv) = &*self.reaper_stop;
        let mut stopped = stop.lock().unwrap();
        loop {
            let (guard, timeout) = stop_cv
                .wait_timeout_while(stopped, MAINTENANCE_INTERVAL, |stopped| !*stopped)
                .unwrap();
            stopped = guard;
            if !timeout.timed_out() || *stopped {
                return;
            }
            drop(stopped);
            self.evict_idle();
            stopped = stop.lock().unwrap();
        }
    }

    /// Drop free connections that sat idle longer than `idle_timeout`,
    /// never shrinking below `initial_pool_size`. The free queue is rebuilt
    /// rather than mutated in place.
    fn evict_idle(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.closing || shared.size <= self.initial_size {
            return;
        }

        let mut kept = VecDeque::with_capacity(shared.free.len());
        let mut evicted = 0;
        while let Some(idle) = shared.free.pop_front() {
            if shared.size > self.initial_size && idle.last_used.elapsed() >= self.idle_timeout {
                shared.size -= 1;
                evicted += 1;
            } else {
                kept.push_back(idle);
            }
        }
        shared.free = kept;

        if evicted > 0 {
            tracing::debug!(
                context = "db",
                event = "evict",
                count = evicted,
                pool_size = shared.size,
                "Evicted idle connections"
            );
        }
    }
}

/// RAII lease over a pooled connection. Returned to the free queue on drop
/// unless marked broken, in which case it is discarded and the pool may
/// build a replacement on demand.
pub struct PooledConn<M: ConnectionManager> {
    pool: Arc<DbPool<M>>,
    conn: Option<M::Connection>,
    broken: bool,
}

impl<M: ConnectionManager> PooledConn<M> {
    fn new(pool: Arc<DbPool<M>>, conn: M::Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    /// Mark the connection as unusable; it will not re-enter the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: ConnectionManager> Deref for PooledConn<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already released")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConn<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already released")
    }
}

impl<M: ConnectionManager> Drop for PooledConn<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.broken);
        }
    }
}
