//! Hand-off from the receive loop to the SIP processing pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::socket::Origin;

/// The SIP message-processing pipeline.
///
/// Lives outside this crate and runs asynchronously, off the transport's
/// critical path. The transport hands over raw payload bytes together with
/// their [`Origin`] and never looks at the outcome.
#[async_trait]
pub trait SipPipeline: Send + Sync {
    /// Consume one accepted SIP datagram.
    async fn dispatch(&self, payload: Bytes, origin: Origin);
}

/// Fire-and-forget dispatcher with a shed-on-overload bound.
pub(crate) struct Dispatcher {
    pipeline: Arc<dyn SipPipeline>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub(crate) fn new(pipeline: Arc<dyn SipPipeline>, max_inflight: usize) -> Self {
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(max_inflight)),
        }
    }

    /// Spawn the pipeline call without blocking the caller.
    ///
    /// When every permit is taken the datagram is shed: UDP already allows
    /// loss, and a stuck pipeline must not stall the receive loop.
    pub(crate) fn dispatch(&self, payload: Bytes, origin: Origin) {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                let pipeline = Arc::clone(&self.pipeline);
                tokio::spawn(async move {
                    pipeline.dispatch(payload, origin).await;
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(
                    source = %origin.source,
                    "pipeline dispatch limit reached, shedding datagram"
                );
            }
        }
    }
}
