//! Single-resolver lookup workers.
//!
//! Each worker owns one resolver and drains a bounded queue of lookup
//! jobs, writing each result into the job's one-shot sink. The pool exists
//! to parallelize the many `TXT` fetches that reassemble one inbound
//! envelope; shutdown is a dropped queue followed by a join.

use crate::error::TunnelError;
use crate::resolver::SharedResolver;
use std::sync::mpsc::{self, SyncSender};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Capacity of each worker's job queue.
const QUEUE_BUF_SIZE: usize = 512;

pub(crate) enum QueryKind {
    A,
    Txt,
}

/// One lookup job. The sink receives exactly one result, if present.
pub(crate) struct Work {
    pub kind: QueryKind,
    pub domain: String,
    pub sink: Option<SyncSender<Result<Vec<u8>, TunnelError>>>,
}

pub(crate) struct Worker {
    queue: SyncSender<Work>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub fn spawn(id: usize, resolver: SharedResolver) -> Worker {
        let (queue, jobs) = mpsc::sync_channel::<Work>(QUEUE_BUF_SIZE);
        let handle = thread::spawn(move || {
            debug!(worker = id, resolver = resolver.address(), "worker started");
            while let Ok(work) = jobs.recv() {
                let result = match work.kind {
                    QueryKind::A => resolver.a(&work.domain),
                    QueryKind::Txt => resolver.txt(&work.domain),
                }
                .map(|(data, _rtt)| data);
                if let Some(sink) = work.sink {
                    // The reader may have given up; a closed sink is fine.
                    let _ = sink.send(result);
                }
            }
            debug!(worker = id, "worker stopped");
        });
        Worker { queue, handle }
    }

    pub fn queue(&self) -> SyncSender<Work> {
        self.queue.clone()
    }

    /// Stops draining the queue and waits for the thread to exit. Queued
    /// jobs that were never picked up are dropped; their sinks close.
    pub fn shutdown(self) {
        drop(self.queue);
        let _ = self.handle.join();
    }
}
