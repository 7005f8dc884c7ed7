use faceprint_core::extractor::{EngineSlot, EngineStatus, FaceExtractor};
use faceprint_core::verify::{verify_user, VerificationResult, VerifyError, VerifyRequest};
use faceprint_store::ObjectStore;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Verify {
        request: VerifyRequest,
        reply: oneshot::Sender<Result<VerificationResult, VerifyError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Score a probe image against the user's stored baseline.
    pub async fn verify(&self, request: VerifyRequest) -> Result<VerificationResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The models are loaded on the thread before it starts serving. A load
/// failure does not stop the thread: it keeps answering, and every
/// verification reports the engine as unavailable.
pub fn spawn_engine<E>(
    mut slot: EngineSlot<E>,
    store: Arc<dyn ObjectStore>,
) -> std::io::Result<EngineHandle>
where
    E: FaceExtractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("faceprint-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            if slot.get().is_ok() {
                tracing::info!("face models loaded");
            }

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Verify { request, reply } => {
                        let result = verify_user(&request, &mut slot, store.as_ref());
                        if let Err(e) = &result {
                            tracing::info!(user_id = request.user_id.as_str(), error = %e, "verify: rejected");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(slot.status());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
