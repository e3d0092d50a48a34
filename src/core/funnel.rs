use bytes::Bytes;
use futures::future::try_join_all;
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, Instrument, Span};

use crate::core::assembler::{BlockBuffer, PieceWindow};
use crate::core::events::{BlockEvent, FunnelEvent};
use crate::core::model::{ByteRange, RequestId, ResourceDescriptor};
use crate::core::planner::split;
use crate::core::retry::{FetchError, RetryPolicy};
use crate::plugins::registry::{Upstream, UpstreamContext};

/// Finished blocks allowed to wait for the consumer. Lets production run one
/// block ahead without unbounded buffering.
pub const BLOCK_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunnelConfig {
    pub block_size: u64,
    pub piece_size: u64,
}

/// Largest block the funnel agrees to hold in memory.
pub const MAX_BLOCK_SIZE: u64 = 1024 * 1024 * 1024;

impl Default for FunnelConfig {
    fn default() -> Self {
        Self { block_size: 4 * 1024 * 1024, piece_size: 1024 * 1024 }
    }
}

impl FunnelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size == 0 || self.piece_size == 0 {
            return Err("block and piece size must be at least one byte".to_string());
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(format!("block size {} exceeds the maximum of {}", self.block_size, MAX_BLOCK_SIZE));
        }
        Ok(())
    }
}

/// Everything the producer needs to reach the resource.
#[derive(Clone)]
pub struct FunnelSource {
    pub request_id: RequestId,
    pub upstream: Arc<dyn Upstream>,
    pub ctx: UpstreamContext,
    pub resource: Arc<ResourceDescriptor>,
    pub retry: RetryPolicy,
    pub events: Option<broadcast::Sender<FunnelEvent>>,
}

/// Consumer handle of a running funnel.
///
/// Blocks come out in offset order. Dropping the handle cancels the producer;
/// [`Funnel::close`] additionally waits until it has stopped.
pub struct Funnel {
    rx: mpsc::Receiver<BlockEvent>,
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    finished: bool,
}

impl Funnel {
    /// Starts producing `range` in the background. Must be called inside a
    /// tokio runtime.
    pub fn open(source: FunnelSource, range: ByteRange, config: FunnelConfig) -> Self {
        let (tx, rx) = mpsc::channel(BLOCK_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let producer = Producer {
            source,
            config: FunnelConfig {
                block_size: config.block_size.max(1),
                piece_size: config.piece_size.max(1),
            },
            tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(producer.run(range).instrument(Span::current()));

        Self { rx, cancel, producer: Some(handle), finished: false }
    }

    /// Next block, `Ok(None)` at end of stream. An error ends the stream.
    pub async fn next(&mut self) -> Result<Option<Bytes>, FetchError> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(BlockEvent::Data(data)) => Ok(Some(data)),
            Some(BlockEvent::EndOfStream) => {
                self.finished = true;
                Ok(None)
            }
            Some(BlockEvent::Failure(e)) => {
                self.finished = true;
                Err(e)
            }
            None => {
                self.finished = true;
                Err(FetchError::Transport("funnel producer stopped unexpectedly".to_string()))
            }
        }
    }

    /// Cancels production, discards queued blocks and waits for every piece
    /// fetch to stop. Fine to call after the stream ended or failed.
    pub async fn close(mut self) {
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}

        if let Some(handle) = self.producer.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "funnel producer panicked");
                }
            }
        }
        self.finished = true;
    }

    /// Adapts the handle into a body stream. The funnel is closed when the
    /// stream ends or fails, and cancelled when the stream is dropped early.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, FetchError>> + Send + 'static {
        stream::unfold(Some(self), |state| async move {
            let mut funnel = state?;
            match funnel.next().await {
                Ok(Some(data)) => Some((Ok(data), Some(funnel))),
                Ok(None) => {
                    funnel.close().await;
                    None
                }
                Err(e) => {
                    funnel.close().await;
                    Some((Err(e), None))
                }
            }
        })
    }
}

impl Drop for Funnel {
    /// Only signals the token: the producer still runs its cancelled branch,
    /// which drops every piece fetch and reports `Finished`.
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.producer.take().is_some() && !self.finished {
            info!("consumer went away, cancelling funnel");
        }
    }
}

enum Stop {
    Cancelled,
    Failed(FetchError),
}

struct Producer {
    source: FunnelSource,
    config: FunnelConfig,
    tx: mpsc::Sender<BlockEvent>,
    cancel: CancellationToken,
}

impl Producer {
    async fn run(self, range: ByteRange) {
        let last = match self.produce(range).await {
            Ok(()) => {
                debug!(range = %range, "all blocks done");
                self.emit(FunnelEvent::Finished { request_id: self.source.request_id, ok: true });
                BlockEvent::EndOfStream
            }
            Err(Stop::Cancelled) => {
                info!(range = %range, "funnel cancelled");
                self.emit(FunnelEvent::Finished { request_id: self.source.request_id, ok: false });
                return;
            }
            Err(Stop::Failed(e)) => {
                error!(range = %range, error = %e, "funnel failed");
                self.emit(FunnelEvent::Finished { request_id: self.source.request_id, ok: false });
                BlockEvent::Failure(e)
            }
        };

        // The terminal value wakes a consumer waiting on the channel.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.tx.send(last) => {}
        }
    }

    async fn produce(&self, range: ByteRange) -> Result<(), Stop> {
        if !self.source.resource.supports_ranges {
            return Err(Stop::Failed(FetchError::RangeNotSupported));
        }
        for (index, block) in split(range, self.config.block_size).enumerate() {
            let index = index as u64;
            let data = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                r = self.fetch_block(index, block) => r.map_err(Stop::Failed)?,
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                r = self.tx.send(BlockEvent::Data(data)) => {
                    if r.is_err() {
                        return Err(Stop::Cancelled);
                    }
                }
            }
            self.emit(FunnelEvent::BlockDone { request_id: self.source.request_id, index });
        }
        Ok(())
    }

    /// Fetches all pieces of one block concurrently. The first piece to fail
    /// drops its siblings.
    async fn fetch_block(&self, index: u64, block: ByteRange) -> Result<Bytes, FetchError> {
        debug!(block = %block, "start to download {} bytes", block.size());
        self.emit(FunnelEvent::BlockStarted { request_id: self.source.request_id, index, range: block });

        let mut buffer = BlockBuffer::new(block);
        try_join_all(
            buffer
                .windows(split(block, self.config.piece_size))
                .into_iter()
                .map(|window| self.fetch_piece(index, window)),
        )
        .await?;
        Ok(buffer.freeze())
    }

    async fn fetch_piece(&self, index: u64, mut window: PieceWindow<'_>) -> Result<(), FetchError> {
        let span = debug_span!("piece", range = %window.range());
        async move {
            let mut retry = self.source.retry.start("fetch_piece");
            loop {
                match self.fetch_piece_once(index, &mut window).await {
                    Ok(()) => {
                        debug!(retries = retry.attempt(), "piece done");
                        return Ok(());
                    }
                    Err(e) => retry.backoff(e).await?,
                }
            }
        }
        .instrument(span)
        .await
    }

    /// One upstream request for whatever the window is still missing.
    async fn fetch_piece_once(&self, index: u64, window: &mut PieceWindow<'_>) -> Result<(), FetchError> {
        let Some(missing) = window.remaining() else {
            return Ok(());
        };

        let mut body = self
            .source
            .upstream
            .open_range(&self.source.resource, &self.source.ctx, missing)
            .await?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            window.write(&chunk)?;
            self.emit(FunnelEvent::PieceProgress {
                request_id: self.source.request_id,
                index,
                bytes: chunk.len() as u64,
            });
        }

        if window.is_full() {
            Ok(())
        } else {
            Err(FetchError::ShortBody {
                range: window.range(),
                received: window.written(),
                expected: window.range().size(),
            })
        }
    }

    fn emit(&self, event: FunnelEvent) {
        if let Some(tx) = &self.source.events {
            let _ = tx.send(event);
        }
    }
}
