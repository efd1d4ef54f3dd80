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

use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    task::{Context, Poll},
    thread::JoinHandle,
};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Preemptive thread pool for blocking and CPU-bound work.
///
/// Jobs are pulled from a single FIFO queue. Database acquire, queries and
/// the final message commit all run here so that the I/O executor threads
/// are never blocked.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    abandon: Arc<AtomicBool>,
    thread_count: usize,
}

struct PoolState {
    sender: Option<mpsc::Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(thread_count: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let abandon = Arc::new(AtomicBool::new(false));

        let threads = (0..thread_count)
            .map(|index| {
                let receiver = receiver.clone();
                let abandon = abandon.clone();
                std::thread::Builder::new()
                    .name(format!("loam-worker-{index}"))
                    .spawn(move || worker_loop(&receiver, &abandon))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            state: Mutex::new(PoolState {
                sender: Some(sender),
                threads,
            }),
            abandon,
            thread_count,
        }
    }

    /// Run a job on the pool and return a handle that resolves with its
    /// result. The handle can be awaited from the I/O executor.
    pub fn submit<F, T>(&self, job: F) -> Result<WorkerHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::new(move || {
            // The receiver may be gone if the session was cancelled; the
            // result is discarded in that case.
            let _ = tx.send(job());
        }))?;

        Ok(WorkerHandle { receiver: rx })
    }

    /// Run a job on the pool, discarding its result.
    pub fn post<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(job))
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let state = self.state.lock().unwrap();
        let sender = state.sender.as_ref().ok_or(Error::WorkerPoolStopped)?;
        sender.send(job).map_err(|_| Error::WorkerPoolStopped)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().sender.is_some()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Stop the pool. With `wait_for_tasks` the queue is drained before the
    /// threads exit; without it, queued jobs are abandoned once the running
    /// ones finish.
    pub fn stop(&self, wait_for_tasks: bool) {
        let threads = {
            let mut state = self.state.lock().unwrap();
            if state.sender.take().is_none() {
                return;
            }
            if !wait_for_tasks {
                self.abandon.store(true, Ordering::Release);
            }
            std::mem::take(&mut state.threads)
        };

        for thread in threads {
            if thread.join().is_err() {
                tracing::error!(context = "worker", event = "error", "Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn worker_loop(receiver: &Mutex<mpsc::Receiver<Job>>, abandon: &AtomicBool) {
    loop {
        let job = receiver.lock().unwrap().recv();
        if abandon.load(Ordering::Acquire) {
            break;
        }
        match job {
            Ok(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(
                        context = "worker",
                        event = "panic",
                        "Worker task panicked; thread continues"
                    );
                }
            }
            // Channel closed and drained
            Err(_) => break,
        }
    }
}

/// Completion handle returned by [`WorkerPool::submit`].
pub struct WorkerHandle<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> Future for WorkerHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| Error::WorkerGone))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn submit_round_trip() {
        let pool = WorkerPool::start(2);
        let handle = pool.submit(|| 2 + 2).unwrap();
        assert_eq!(handle.await.unwrap(), 4);
        pool.stop(true);
    }

    #[tokio::test]
    async fn post_runs_job() {
        let pool = WorkerPool::start(1);
        let (tx, rx) = oneshot::channel();
        pool.post(move || {
            tx.send(7u32).ok();
        })
        .unwrap();
        assert_eq!(rx.await.unwrap(), 7);
        pool.stop(true);
    }

    #[test]
    fn stop_with_wait_drains_queue() {
        let pool = WorkerPool::start(1);
        let counter = Arc::new(AtomicBool::new(false));

        let slow = counter.clone();
        pool.post(move || {
            std::thread::sleep(Duration::from_millis(50));
            slow.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.stop(true);
        assert!(counter.load(Ordering::SeqCst));
    }

    #[test]
    fn submit_after_stop_fails() {
        let pool = WorkerPool::start(1);
        pool.stop(true);
        assert!(!pool.is_running());
        assert!(matches!(
            pool.submit(|| ()),
            Err(Error::WorkerPoolStopped)
        ));
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_pool() {
        let pool = WorkerPool::start(1);

        let handle = pool.submit(|| panic!("boom")).unwrap();
        assert!(matches!(handle.await, Err(Error::WorkerGone)));

        // The same thread must still pick up new work.
        let handle = pool.submit(|| 1u8).unwrap();
        assert_eq!(handle.await.unwrap(), 1);
        pool.stop(true);
    }
}
