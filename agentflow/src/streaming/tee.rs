//! Splitting one chunk stream into several independent readers.
//!
//! A tee of N is built from N-1 binary splits. Each split is a pump task that
//! reads from its source and hands a clone of every chunk to two branches.
//! A branch is a bounded channel of `buffer` chunks plus a backlog holding
//! what its reader has not caught up on. The pump is paced by the fastest
//! reader, so no reader ever waits on another one. A dropped branch is
//! ignored; the pump stops once both branches are gone or drained.

use super::{ChunkStream, StreamFault};
use futures::future::{select_all, FutureExt};
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

type Chunk = Result<Value, StreamFault>;

struct Branch {
    tx: mpsc::Sender<Chunk>,
    backlog: VecDeque<Chunk>,
}

impl Branch {
    /// Moves backlog into the channel while it has room. Returns false once
    /// the reader is gone.
    fn flush(&mut self) -> bool {
        while let Some(chunk) = self.backlog.pop_front() {
            match self.tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(chunk)) => {
                    self.backlog.push_front(chunk);
                    return true;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        !self.tx.is_closed()
    }

    fn push(&mut self, chunk: Chunk) {
        self.backlog.push_back(chunk);
    }

    fn can_take_more(&self) -> bool {
        self.backlog.is_empty() && self.tx.capacity() > 0
    }
}

async fn pump(mut source: ChunkStream, mut branches: Vec<Option<Branch>>) {
    let mut exhausted = false;
    loop {
        for slot in &mut branches {
            let keep = slot
                .as_mut()
                .is_some_and(|branch| branch.flush() && !(exhausted && branch.backlog.is_empty()));
            if !keep {
                *slot = None;
            }
        }
        if branches.iter().all(Option::is_none) {
            if !exhausted {
                tracing::debug!("tee branches dropped, stopping pump");
            }
            return;
        }

        if !exhausted && branches.iter().flatten().any(Branch::can_take_more) {
            match source.next().await {
                Some(chunk) => {
                    for branch in branches.iter_mut().flatten() {
                        branch.push(chunk.clone());
                    }
                }
                None => exhausted = true,
            }
            continue;
        }

        // Every live branch is full: wait until any reader makes room.
        let waits: Vec<_> = branches
            .iter()
            .flatten()
            .map(|branch| branch.tx.reserve().map(|_| ()).boxed())
            .collect();
        select_all(waits).await;
    }
}

/// Splits `source` into two independent readers with `buffer` chunks of
/// channel headroom per branch.
///
/// Must be called within a tokio runtime.
#[must_use]
pub fn tee2(source: ChunkStream, buffer: usize) -> (ChunkStream, ChunkStream) {
    let buffer = buffer.max(1);
    let (left_tx, left_rx) = mpsc::channel(buffer);
    let (right_tx, right_rx) = mpsc::channel(buffer);

    let branches = [left_tx, right_tx]
        .into_iter()
        .map(|tx| {
            Some(Branch {
                tx,
                backlog: VecDeque::new(),
            })
        })
        .collect();
    tokio::spawn(pump(source, branches));

    (
        ReceiverStream::new(left_rx).boxed(),
        ReceiverStream::new(right_rx).boxed(),
    )
}

/// Splits `source` into `n` independent readers.
///
/// `n == 0` drops the source; `n == 1` returns it unchanged.
#[must_use]
pub fn tee_n(source: ChunkStream, n: usize, buffer: usize) -> Vec<ChunkStream> {
    match n {
        0 => Vec::new(),
        1 => vec![source],
        _ => {
            let mut branches = Vec::with_capacity(n);
            let mut rest = source;
            for _ in 0..n - 1 {
                let (branch, remainder) = tee2(rest, buffer);
                branches.push(branch);
                rest = remainder;
            }
            branches.push(rest);
            branches
        }
    }
}
