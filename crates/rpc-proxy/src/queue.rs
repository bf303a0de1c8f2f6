// Neurai RPC Proxy
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Bounded-concurrency FIFO queue for upstream calls
//!
//! Jobs go through an unbounded channel to a single dispatcher task, which
//! takes a semaphore permit before spawning each one. Start order is therefore
//! submission order; completion order is not.

use crate::errors::ProxyError;
use futures::{future::BoxFuture, FutureExt};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{trace, warn};

type Job = BoxFuture<'static, ()>;

#[derive(Default)]
struct QueueCounters {
    pending: AtomicUsize,
    running: AtomicUsize,
}

/// Holds a worker slot for the lifetime of one job
///
/// Dropped on completion and on unwind, so a panicking job still frees its slot.
struct RunningGuard {
    _permit: OwnedSemaphorePermit,
    counters: Arc<QueueCounters>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.counters.running.fetch_sub(1, Ordering::SeqCst);
        trace!("dispatch slot released");
    }
}

/// FIFO queue executing at most `concurrency` jobs at a time
pub struct DispatchQueue {
    sender: mpsc::UnboundedSender<Job>,
    counters: Arc<QueueCounters>,
    concurrency: usize,
}

impl DispatchQueue {
    /// Create the queue and spawn its dispatcher; must run inside a tokio runtime
    ///
    /// A concurrency of 0 is treated as 1.
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(QueueCounters::default());
        let semaphore = Arc::new(Semaphore::new(concurrency));

        tokio::spawn(Self::dispatch(receiver, semaphore, counters.clone()));

        Self { sender, counters, concurrency }
    }

    async fn dispatch(
        mut receiver: mpsc::UnboundedReceiver<Job>,
        semaphore: Arc<Semaphore>,
        counters: Arc<QueueCounters>,
    ) {
        while let Some(job) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            counters.pending.fetch_sub(1, Ordering::SeqCst);
            counters.running.fetch_add(1, Ordering::SeqCst);
            let guard = RunningGuard { _permit: permit, counters: counters.clone() };

            tokio::spawn(async move {
                let _guard = guard;
                job.await;
            });
        }
    }

    /// Queue `task` and return a handle resolving to its output
    ///
    /// The task starts once every earlier submission has started and a slot is
    /// free. Its failure, or a panic, only resolves its own handle.
    pub fn submit<T, F>(&self, task: F) -> DispatchHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ProxyError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            // The receiver may be gone if the caller stopped waiting
            let _ = tx.send(task.await);
        }
        .boxed();

        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            warn!("Dispatcher has stopped, rejecting job");
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        }

        DispatchHandle { receiver: rx }
    }

    /// Jobs waiting for a slot
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::SeqCst)
    }

    /// Jobs currently executing
    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    /// Maximum number of jobs executing at once
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Completion handle of a submitted job
pub struct DispatchHandle<T> {
    receiver: oneshot::Receiver<Result<T, ProxyError>>,
}

impl<T> Future for DispatchHandle<T> {
    type Output = Result<T, ProxyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(ProxyError::TaskFailed("job was dropped before completing".to_string()))
            })
        })
    }
}
