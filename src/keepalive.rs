// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Keeps a streaming connection's write half from going idle.
//!
//! The underlying transport closes bidi streams idle for too long; this
//! task periodically writes an empty frame into the stream's request
//! channel. Callers must arm it *before* opening the stream: a bidi call's
//! underlying future may not yield until the first response arrives, and by
//! then the idle window may already have elapsed.

use crate::transport::StreamRequest;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval_at};
use tokio_util::sync::CancellationToken;

pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Spawns a task that writes [`StreamRequest::RequestOne`] into
/// `request_tx` every [`KEEPALIVE_PERIOD`], until `shutdown` is cancelled.
pub(crate) fn spawn(request_tx: Sender<StreamRequest>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut keepalive = interval_at(Instant::now() + KEEPALIVE_PERIOD, KEEPALIVE_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = keepalive.tick() => {
                    let _ = request_tx.send(StreamRequest::RequestOne).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::channel;

    #[tokio::test(start_paused = true)]
    async fn keepalive_interval() {
        let start = Instant::now();
        let (request_tx, mut request_rx) = channel(1);
        let shutdown = CancellationToken::new();
        let _handle = spawn(request_tx, shutdown);

        let r = request_rx.recv().await.unwrap();
        assert_eq!(r, StreamRequest::RequestOne);
        assert_eq!(start.elapsed(), KEEPALIVE_PERIOD);

        let r = request_rx.recv().await.unwrap();
        assert_eq!(r, StreamRequest::RequestOne);
        assert_eq!(start.elapsed(), KEEPALIVE_PERIOD * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_does_not_wait_for_next_tick() -> anyhow::Result<()> {
        let start = Instant::now();
        let (request_tx, mut request_rx) = channel(1);
        let shutdown = CancellationToken::new();
        let handle = spawn(request_tx, shutdown.clone());

        let _ = request_rx.recv().await.unwrap();
        assert_eq!(start.elapsed(), KEEPALIVE_PERIOD);

        const DELTA: Duration = Duration::from_secs(10);
        tokio::time::advance(DELTA).await;

        shutdown.cancel();
        handle.await?;

        assert_eq!(start.elapsed(), KEEPALIVE_PERIOD + DELTA);
        Ok(())
    }
}
