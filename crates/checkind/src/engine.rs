use checkin_core::pipeline::{DatasetVerification, PipelineStatus};
use checkin_core::{
    CheckinPipeline, Identification, PersonMatch, PipelineError, TrainingReport, VerificationResult,
};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, PipelineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Identify {
        path: PathBuf,
        reply: Reply<Identification>,
    },
    ProcessPhoto {
        path: PathBuf,
        reply: Reply<Vec<PersonMatch>>,
    },
    Verify {
        a: PathBuf,
        b: PathBuf,
        reply: Reply<VerificationResult>,
    },
    VerifyPerson {
        path: PathBuf,
        person: String,
        reply: Reply<VerificationResult>,
    },
    VerifyDataset {
        reply: Reply<DatasetVerification>,
    },
    Enroll {
        path: PathBuf,
        person: String,
        reply: Reply<PathBuf>,
    },
    Train {
        overrides: HashMap<String, String>,
        continue_training: bool,
        reply: Reply<TrainingReport>,
    },
    Labels {
        reply: oneshot::Sender<Vec<String>>,
    },
    Status {
        reply: oneshot::Sender<PipelineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// Every request is queued to the one thread that owns the pipeline, so
/// training and inference never overlap.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn identify(&self, path: PathBuf) -> Result<Identification, EngineError> {
        self.call(|reply| EngineRequest::Identify { path, reply }).await
    }

    pub async fn process_photo(&self, path: PathBuf) -> Result<Vec<PersonMatch>, EngineError> {
        self.call(|reply| EngineRequest::ProcessPhoto { path, reply }).await
    }

    pub async fn verify(&self, a: PathBuf, b: PathBuf) -> Result<VerificationResult, EngineError> {
        self.call(|reply| EngineRequest::Verify { a, b, reply }).await
    }

    pub async fn verify_person(
        &self,
        path: PathBuf,
        person: String,
    ) -> Result<VerificationResult, EngineError> {
        self.call(|reply| EngineRequest::VerifyPerson { path, person, reply })
            .await
    }

    pub async fn verify_dataset(&self) -> Result<DatasetVerification, EngineError> {
        self.call(|reply| EngineRequest::VerifyDataset { reply }).await
    }

    pub async fn enroll(&self, path: PathBuf, person: String) -> Result<PathBuf, EngineError> {
        self.call(|reply| EngineRequest::Enroll { path, person, reply })
            .await
    }

    pub async fn train(
        &self,
        overrides: HashMap<String, String>,
        continue_training: bool,
    ) -> Result<TrainingReport, EngineError> {
        self.call(|reply| EngineRequest::Train {
            overrides,
            continue_training,
            reply,
        })
        .await
    }

    pub async fn labels(&self) -> Result<Vec<String>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Labels { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<PipelineStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Move `pipeline` onto a dedicated OS thread and serve requests from a
/// bounded queue until every handle is dropped.
pub fn spawn_engine(
    mut pipeline: CheckinPipeline,
    queue_depth: usize,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("checkin-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&mut pipeline, req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn handle(pipeline: &mut CheckinPipeline, req: EngineRequest) {
    match req {
        EngineRequest::Identify { path, reply } => {
            let _ = reply.send(pipeline.identify(&path));
        }
        EngineRequest::ProcessPhoto { path, reply } => {
            let _ = reply.send(pipeline.process_photo(&path));
        }
        EngineRequest::Verify { a, b, reply } => {
            let _ = reply.send(pipeline.verify(&a, &b));
        }
        EngineRequest::VerifyPerson { path, person, reply } => {
            let _ = reply.send(pipeline.verify_person(&path, &person));
        }
        EngineRequest::VerifyDataset { reply } => {
            let result = pipeline.verify_dataset().and_then(|summary| {
                let log = pipeline.save_verification_log()?;
                tracing::info!(path = %log.display(), "verification log written");
                Ok(summary)
            });
            let _ = reply.send(result);
        }
        EngineRequest::Enroll { path, person, reply } => {
            let _ = reply.send(pipeline.enroll_file(&path, &person));
        }
        EngineRequest::Train {
            overrides,
            continue_training,
            reply,
        } => {
            let result = pipeline.train_from_dataset(&overrides, continue_training);
            if let Err(e) = &result {
                tracing::error!(error = %e, kind = ?e.kind(), "training failed");
            }
            let _ = reply.send(result);
        }
        EngineRequest::Labels { reply } => {
            let names = pipeline
                .labels()
                .map(|l| l.names().to_vec())
                .unwrap_or_default();
            let _ = reply.send(names);
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(pipeline.status());
        }
    }
}
