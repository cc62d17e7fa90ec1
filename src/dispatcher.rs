use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::Result;
use crate::config::{CredentialKeyConfig, ProviderRuntimeConfig};
use crate::error::GatewayError;
use crate::providers::Provider;
use crate::types::{ChatRequest, ChatResponse, StreamChunk, StreamEvent};

/// Capacity of the per-request chunk channel. Small on purpose: the worker
/// blocks on send when the consumer stalls instead of buffering the stream.
pub const STREAM_CHANNEL_CAPACITY: usize = 16;

enum Job {
    Unary {
        request: ChatRequest,
        model: String,
        reply: oneshot::Sender<Result<ChatResponse>>,
    },
    Stream {
        request: ChatRequest,
        model: String,
        opened: oneshot::Sender<Result<()>>,
        chunks: mpsc::Sender<Result<StreamChunk>>,
    },
}

impl Job {
    /// A job whose caller has already gone away is dropped without upstream
    /// contact.
    fn is_abandoned(&self) -> bool {
        match self {
            Job::Unary { reply, .. } => reply.is_closed(),
            Job::Stream { opened, .. } => opened.is_closed(),
        }
    }
}

/// Bounded queue plus a fixed worker set for one (provider, key) pair. A
/// saturated key never starves its siblings: each pool owns its own queue.
struct WorkerPool {
    tx: mpsc::Sender<Job>,
    provider: String,
    drop_excess: bool,
}

impl WorkerPool {
    fn spawn(
        provider: &str,
        adapter: Arc<dyn Provider>,
        key: CredentialKeyConfig,
        runtime: &ProviderRuntimeConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(runtime.buffer_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let timeout = Duration::from_secs(runtime.default_request_timeout_in_seconds);

        for _ in 0..runtime.concurrency.max(1) {
            let rx = rx.clone();
            let adapter = adapter.clone();
            let key = key.clone();
            let provider = provider.to_string();
            tokio::spawn(async move {
                worker_loop(rx, adapter, key, provider, timeout).await;
            });
        }

        Self {
            tx,
            provider: provider.to_string(),
            drop_excess: runtime.drop_excess_requests,
        }
    }

    async fn submit(&self, job: Job) -> Result<()> {
        if self.drop_excess {
            self.tx.try_send(job).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => GatewayError::Dropped {
                    provider: self.provider.clone(),
                },
                mpsc::error::TrySendError::Closed(_) => {
                    GatewayError::Internal("dispatcher pool stopped".to_string())
                }
            })
        } else {
            self.tx
                .send(job)
                .await
                .map_err(|_| GatewayError::Internal("dispatcher pool stopped".to_string()))
        }
    }
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    adapter: Arc<dyn Provider>,
    key: CredentialKeyConfig,
    provider: String,
    timeout: Duration,
) {
    loop {
        // Hold the receiver lock only while waiting for a job so sibling
        // workers can pick up the next one during execution.
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };
        if job.is_abandoned() {
            continue;
        }

        match job {
            Job::Unary {
                request,
                model,
                reply,
            } => {
                let mut reply = reply;
                let call = adapter.chat(&request, &model, &key);
                tokio::pin!(call);
                let outcome = tokio::select! {
                    // Caller cancelled mid-flight: dropping the future aborts
                    // the upstream call.
                    _ = reply.closed() => None,
                    result = tokio::time::timeout(timeout, &mut call) => Some(match result {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::Timeout {
                            seconds: timeout.as_secs(),
                        }),
                    }),
                };
                if let Some(result) = outcome {
                    let _ = reply.send(result);
                }
            }
            Job::Stream {
                request,
                model,
                opened,
                chunks,
            } => {
                let open = tokio::time::timeout(timeout, adapter.chat_stream(&request, &model, &key))
                    .await
                    .unwrap_or(Err(GatewayError::Timeout {
                        seconds: timeout.as_secs(),
                    }));
                match open {
                    Err(err) => {
                        let _ = opened.send(Err(err));
                    }
                    Ok(events) => {
                        if opened.send(Ok(())).is_err() {
                            // Caller gone between enqueue and open.
                            continue;
                        }
                        forward_stream(events, chunks, &provider, &model).await;
                    }
                }
            }
        }
    }
}

/// Drains the upstream event stream into the per-request channel, numbering
/// chunks from 0 and stamping inter-chunk latency. Blocks on send under
/// consumer backpressure; never drops chunks. A closed consumer aborts the
/// upstream by dropping the stream.
async fn forward_stream(
    mut events: crate::providers::EventStream,
    chunks: mpsc::Sender<Result<StreamChunk>>,
    provider: &str,
    model: &str,
) {
    let mut chunk_index: u64 = 0;
    let mut last_chunk_at = Instant::now();

    let mut send_chunk = |event: StreamEvent| {
        let latency_ms = last_chunk_at.elapsed().as_millis() as u64;
        last_chunk_at = Instant::now();
        let chunk = StreamChunk {
            chunk_index,
            provider: provider.to_string(),
            model: model.to_string(),
            latency_ms,
            event,
        };
        chunk_index += 1;
        chunk
    };

    loop {
        match events.next().await {
            Some(Ok(event)) => {
                let terminal = event.is_terminal();
                if chunks.send(Ok(send_chunk(event))).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }
            Some(Err(err)) => {
                // Mid-stream parse or transport failure: one terminal error
                // event, then the channel closes.
                let event = StreamEvent::TerminalError {
                    message: err.to_string(),
                };
                let _ = chunks.send(Ok(send_chunk(event))).await;
                break;
            }
            None => {
                let _ = chunks.send(Ok(send_chunk(StreamEvent::Done))).await;
                break;
            }
        }
    }
}

/// Owns every worker pool, keyed by (provider, credential key). Pools are
/// created lazily on first dispatch and live for the process.
#[derive(Default)]
pub struct Dispatcher {
    pools: RwLock<HashMap<(String, String), Arc<WorkerPool>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(
        &self,
        provider: &str,
        adapter: &Arc<dyn Provider>,
        key: &CredentialKeyConfig,
        runtime: &ProviderRuntimeConfig,
    ) -> Arc<WorkerPool> {
        let pool_key = (provider.to_string(), key.id.clone());
        if let Some(pool) = self.pools.read().expect("dispatcher pools poisoned").get(&pool_key) {
            return pool.clone();
        }
        let mut pools = self.pools.write().expect("dispatcher pools poisoned");
        pools
            .entry(pool_key)
            .or_insert_with(|| {
                Arc::new(WorkerPool::spawn(provider, adapter.clone(), key.clone(), runtime))
            })
            .clone()
    }

    pub async fn dispatch_unary(
        &self,
        provider: &str,
        adapter: &Arc<dyn Provider>,
        key: &CredentialKeyConfig,
        runtime: &ProviderRuntimeConfig,
        request: ChatRequest,
        model: String,
    ) -> Result<ChatResponse> {
        let pool = self.pool(provider, adapter, key, runtime);
        let (reply_tx, reply_rx) = oneshot::channel();
        pool.submit(Job::Unary {
            request,
            model,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| GatewayError::Internal("dispatcher worker dropped request".to_string()))?
    }

    /// Opens a stream; resolves once the upstream connection is established
    /// so the caller can still fall back on open failure. Chunks then flow
    /// through the returned bounded receiver.
    pub async fn dispatch_stream(
        &self,
        provider: &str,
        adapter: &Arc<dyn Provider>,
        key: &CredentialKeyConfig,
        runtime: &ProviderRuntimeConfig,
        request: ChatRequest,
        model: String,
    ) -> Result<mpsc::Receiver<Result<StreamChunk>>> {
        let pool = self.pool(provider, adapter, key, runtime);
        let (opened_tx, opened_rx) = oneshot::channel();
        let (chunks_tx, chunks_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        pool.submit(Job::Stream {
            request,
            model,
            opened: opened_tx,
            chunks: chunks_tx,
        })
        .await?;
        opened_rx
            .await
            .map_err(|_| GatewayError::Internal("dispatcher worker dropped request".to_string()))??;
        Ok(chunks_rx)
    }
}
