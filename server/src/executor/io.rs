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

use std::{future::Future, time::Duration};

use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};

use crate::error::Result;

/// Cooperative executor for network I/O.
///
/// Wraps a multi-threaded reactor sized by `io_thread_count`. The accept
/// loop and every session task are spawned here; tasks suspend at socket
/// and TLS readiness and must not perform blocking calls.
pub struct IoExecutor {
    runtime: Option<Runtime>,
    thread_count: usize,
}

impl IoExecutor {
    pub fn start(thread_count: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(thread_count)
            .thread_name("loam-io")
            .enable_all()
            .build()?;

        Ok(Self {
            runtime: Some(runtime),
            thread_count,
        })
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle().spawn(future)
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle().block_on(future)
    }

    /// Handle for spawning from outside the reactor threads.
    pub fn handle(&self) -> Handle {
        self.runtime
            .as_ref()
            .expect("executor is stopped")
            .handle()
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Shut the reactor down. With `wait_for_tasks` the executor gives
    /// spawned tasks a grace period to finish; without it, pending tasks
    /// are abandoned at their next suspension point.
    pub fn stop(&mut self, wait_for_tasks: bool) {
        if let Some(runtime) = self.runtime.take() {
            if wait_for_tasks {
                runtime.shutdown_timeout(Duration::from_secs(30));
            } else {
                runtime.shutdown_background();
            }
        }
    }
}

impl Drop for IoExecutor {
    fn drop(&mut self) {
        self.stop(false);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spawn_and_block_on() {
        let executor = IoExecutor::start(2).unwrap();
        assert!(executor.is_running());
        assert_eq!(executor.thread_count(), 2);

        let handle = executor.spawn(async { 6 * 7 });
        assert_eq!(executor.block_on(handle).unwrap(), 42);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut executor = IoExecutor::start(1).unwrap();
        executor.stop(false);
        assert!(!executor.is_running());
        executor.stop(true);
    }
}
