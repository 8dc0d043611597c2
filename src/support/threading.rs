//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailcol.
//
// Mailcol is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcol is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcol. If not, see <http://www.gnu.org/licenses/>.

//! Utilities for working with threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, select, Receiver, Sender, TrySendError};
use log::error;

use super::error::Error;

/// A fixed-size group of worker threads fed through a bounded queue.
///
/// Producers hand work to the group with `offer`, which never blocks: if the
/// queue is full, the item is handed back to the caller. Items are processed
/// in no particular order.
///
/// The group is shut down explicitly with `shutdown`, or implicitly when it
/// is dropped. Shutdown does not drain the queue: each worker finishes the
/// item it is currently processing, and anything still queued is discarded.
/// Both forms wait for every worker thread to exit.
///
/// A group with no workers still accepts items up to its capacity; they are
/// discarded when the group shuts down.
pub struct WorkerGroup<T: Send + 'static> {
    name: String,
    sender: Sender<T>,
    receiver: Receiver<T>,
    shutdown: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl<T: Send + 'static> WorkerGroup<T> {
    /// Spawns `count` workers serving a queue of at most `capacity` items.
    ///
    /// `make_worker` is called once per worker, on the calling thread, with
    /// the index of the worker. The function it returns is then moved into
    /// the worker thread and invoked for each item that worker receives.
    pub fn spawn<W>(
        name: &str,
        count: usize,
        capacity: usize,
        mut make_worker: impl FnMut(usize) -> Result<W, Error>,
    ) -> Result<Self, Error>
    where
        W: FnMut(T) + Send + 'static,
    {
        let (sender, receiver) = channel::bounded::<T>(capacity);
        let (shutdown_send, shutdown_recv) = channel::bounded::<()>(0);
        let pending = Arc::new(AtomicUsize::new(0));

        let mut group = Self {
            name: name.to_owned(),
            sender,
            receiver,
            shutdown: Some(shutdown_send),
            workers: Vec::with_capacity(count),
            pending: Arc::clone(&pending),
        };

        for ix in 0..count {
            let work = make_worker(ix)?;
            let receiver = group.receiver.clone();
            let shutdown_recv = shutdown_recv.clone();
            let pending = Arc::clone(&pending);

            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, ix))
                .spawn(move || {
                    run_worker(work, receiver, shutdown_recv, pending)
                })?;
            group.workers.push(handle);
        }

        Ok(group)
    }

    /// Offers `item` to the queue without blocking.
    ///
    /// If the queue is full or the group has shut down, returns the item
    /// back.
    pub fn offer(&self, item: T) -> Result<(), T> {
        // Count the item before it becomes visible to workers so that
        // `is_idle()` can never observe it as neither pending nor queued.
        self.pending.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item))
            | Err(TrySendError::Disconnected(item)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Err(item)
            },
        }
    }

    /// Returns whether every item offered so far has finished processing.
    pub fn is_idle(&self) -> bool {
        0 == self.pending.load(Ordering::SeqCst)
    }

    /// The number of items that have been accepted but have not finished
    /// processing.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stops all workers and waits for them to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        // Disconnecting the shutdown channel wakes every worker blocked in
        // `select!`.
        self.shutdown.take();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("{} worker thread panicked", self.name);
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerGroup<T> {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run_worker<T>(
    mut work: impl FnMut(T),
    receiver: Receiver<T>,
    shutdown: Receiver<()>,
    pending: Arc<AtomicUsize>,
) {
    loop {
        select! {
            recv(shutdown) -> _ => return,
            recv(receiver) -> item => {
                let Ok(item) = item else {
                    return;
                };

                work(item);
                pending.fetch_sub(1, Ordering::SeqCst);
            },
        }
    }
}
