use portaria_core::orchestrator::{
    Enrollment, FaceObservation, GatehouseStatus, PlateObservation, ResidentUpdate,
};
use portaria_core::{
    AccessOrchestrator, AccessRecord, AccessStore, DetectionSample, Direction, FeatureVector,
    GateKind, GateTransition, Identity, OcrResult, OrchestratorError, RecordFilter, RecordPage,
};
use portaria_hw::{Frame, StreamError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] StreamError),
    #[error(transparent)]
    Access(#[from] OrchestratorError),
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("{0} camera is already active")]
    AlreadyActive(&'static str),
    #[error("failed to build engine runtime: {0}")]
    Runtime(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Face detector plus descriptor and landmark extraction for one frame.
pub trait FeatureExtractor: Send {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<DetectionSample>, ExtractError>;
}

/// OCR over one frame of the plate camera.
pub trait TextExtractor: Send {
    fn recognize(&mut self, frame: &Frame) -> Result<OcrResult, ExtractError>;
}

/// Source of inference backends for the capture loops.
pub trait ModelProvider: Send + Sync {
    fn feature_extractor(&self) -> Result<Box<dyn FeatureExtractor>, ExtractError>;
    fn text_extractor(&self) -> Result<Box<dyn TextExtractor>, ExtractError>;
}

/// Messages sent from D-Bus handlers and capture loops to the engine thread.
enum EngineRequest {
    FaceSamples {
        samples: Vec<DetectionSample>,
        reply: oneshot::Sender<Vec<FaceObservation>>,
    },
    PlateText {
        ocr: OcrResult,
        reply: oneshot::Sender<PlateObservation>,
    },
    RegisterManual {
        identity_id: Uuid,
        direction: Option<Direction>,
        note: String,
        reply: oneshot::Sender<Result<AccessRecord, OrchestratorError>>,
    },
    Enroll {
        enrollment: Enrollment,
        reply: oneshot::Sender<Result<Identity, OrchestratorError>>,
    },
    SetDescriptor {
        identity_id: Uuid,
        descriptor: FeatureVector,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    UpdateIdentity {
        identity_id: Uuid,
        update: ResidentUpdate,
        reply: oneshot::Sender<Result<Identity, OrchestratorError>>,
    },
    OpenGate {
        kind: GateKind,
        reply: oneshot::Sender<Option<GateTransition>>,
    },
    CloseGate {
        kind: GateKind,
        reply: oneshot::Sender<Option<GateTransition>>,
    },
    Residents {
        term: String,
        block: Option<String>,
        reply: oneshot::Sender<Vec<Identity>>,
    },
    Blocks {
        reply: oneshot::Sender<Vec<String>>,
    },
    Records {
        filter: RecordFilter,
        page: usize,
        page_size: usize,
        reply: oneshot::Sender<Result<RecordPage, OrchestratorError>>,
    },
    CooldownRemaining {
        identity_id: Uuid,
        reply: oneshot::Sender<Option<Duration>>,
    },
    Status {
        reply: oneshot::Sender<GatehouseStatus>,
    },
    ReloadRegistry {
        reply: oneshot::Sender<Result<usize, OrchestratorError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Run one face detection tick.
    pub async fn face_samples(&self, samples: Vec<DetectionSample>) -> Result<Vec<FaceObservation>, EngineError> {
        self.call(|reply| EngineRequest::FaceSamples { samples, reply }).await
    }

    /// Run one OCR tick.
    pub async fn plate_text(&self, ocr: OcrResult) -> Result<PlateObservation, EngineError> {
        self.call(|reply| EngineRequest::PlateText { ocr, reply }).await
    }

    pub async fn register_manual(
        &self,
        identity_id: Uuid,
        direction: Option<Direction>,
        note: String,
    ) -> Result<AccessRecord, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::RegisterManual {
                identity_id,
                direction,
                note,
                reply,
            })
            .await??)
    }

    pub async fn enroll(&self, enrollment: Enrollment) -> Result<Identity, EngineError> {
        Ok(self.call(|reply| EngineRequest::Enroll { enrollment, reply }).await??)
    }

    pub async fn set_descriptor(&self, identity_id: Uuid, descriptor: FeatureVector) -> Result<(), EngineError> {
        Ok(self
            .call(|reply| EngineRequest::SetDescriptor {
                identity_id,
                descriptor,
                reply,
            })
            .await??)
    }

    pub async fn update_identity(&self, identity_id: Uuid, update: ResidentUpdate) -> Result<Identity, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::UpdateIdentity {
                identity_id,
                update,
                reply,
            })
            .await??)
    }

    pub async fn open_gate(&self, kind: GateKind) -> Result<Option<GateTransition>, EngineError> {
        self.call(|reply| EngineRequest::OpenGate { kind, reply }).await
    }

    pub async fn close_gate(&self, kind: GateKind) -> Result<Option<GateTransition>, EngineError> {
        self.call(|reply| EngineRequest::CloseGate { kind, reply }).await
    }

    pub async fn residents(&self, term: String, block: Option<String>) -> Result<Vec<Identity>, EngineError> {
        self.call(|reply| EngineRequest::Residents { term, block, reply }).await
    }

    pub async fn blocks(&self) -> Result<Vec<String>, EngineError> {
        self.call(|reply| EngineRequest::Blocks { reply }).await
    }

    pub async fn records(&self, filter: RecordFilter, page: usize, page_size: usize) -> Result<RecordPage, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Records {
                filter,
                page,
                page_size,
                reply,
            })
            .await??)
    }

    pub async fn cooldown_remaining(&self, identity_id: Uuid) -> Result<Option<Duration>, EngineError> {
        self.call(|reply| EngineRequest::CooldownRemaining { identity_id, reply }).await
    }

    pub async fn status(&self) -> Result<GatehouseStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn reload_registry(&self) -> Result<usize, EngineError> {
        Ok(self.call(|reply| EngineRequest::ReloadRegistry { reply }).await??)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the orchestrator and runs a current-thread runtime so it
/// can sleep until the next gate deadline while waiting for requests.
pub fn spawn_engine<S>(orchestrator: AccessOrchestrator<S>) -> Result<EngineHandle, EngineError>
where
    S: AccessStore + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(EngineError::Runtime)?;

    let (tx, rx) = mpsc::channel::<EngineRequest>(32);

    std::thread::Builder::new()
        .name("portaria-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            runtime.block_on(run(orchestrator, rx));
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

async fn run<S: AccessStore>(mut orch: AccessOrchestrator<S>, mut rx: mpsc::Receiver<EngineRequest>) {
    loop {
        orch.advance_gates();

        // A deadline too far out to represent as an instant is never reached.
        let wake = orch.next_gate_deadline().and_then(|at| {
            let wait = Duration::from_millis(at.saturating_sub(orch.now_ms()));
            tokio::time::Instant::now().checked_add(wait)
        });
        let request = match wake {
            Some(at) => tokio::select! {
                request = rx.recv() => request,
                _ = tokio::time::sleep_until(at) => continue,
            },
            None => rx.recv().await,
        };
        let Some(request) = request else {
            break;
        };
        handle(&mut orch, request);
    }
}

fn handle<S: AccessStore>(orch: &mut AccessOrchestrator<S>, request: EngineRequest) {
    // Gate timers that came due while the request was queued fire first.
    orch.advance_gates();

    match request {
        EngineRequest::FaceSamples { samples, reply } => {
            let _ = reply.send(orch.face_tick(&samples));
        }
        EngineRequest::PlateText { ocr, reply } => {
            let _ = reply.send(orch.plate_tick(&ocr));
        }
        EngineRequest::RegisterManual {
            identity_id,
            direction,
            note,
            reply,
        } => {
            let _ = reply.send(orch.register_manual(identity_id, direction, &note));
        }
        EngineRequest::Enroll { enrollment, reply } => {
            let _ = reply.send(orch.enroll(enrollment));
        }
        EngineRequest::SetDescriptor {
            identity_id,
            descriptor,
            reply,
        } => {
            let _ = reply.send(orch.set_descriptor(identity_id, descriptor));
        }
        EngineRequest::UpdateIdentity {
            identity_id,
            update,
            reply,
        } => {
            let _ = reply.send(orch.update_identity(identity_id, update));
        }
        EngineRequest::OpenGate { kind, reply } => {
            let _ = reply.send(orch.open_gate(kind));
        }
        EngineRequest::CloseGate { kind, reply } => {
            let _ = reply.send(orch.close_gate(kind));
        }
        EngineRequest::Residents { term, block, reply } => {
            let _ = reply.send(orch.residents(&term, block.as_deref()));
        }
        EngineRequest::Blocks { reply } => {
            let _ = reply.send(orch.blocks());
        }
        EngineRequest::Records {
            filter,
            page,
            page_size,
            reply,
        } => {
            let _ = reply.send(orch.records(&filter, page, page_size));
        }
        EngineRequest::CooldownRemaining { identity_id, reply } => {
            let _ = reply.send(orch.cooldown_remaining(identity_id));
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(orch.status());
        }
        EngineRequest::ReloadRegistry { reply } => {
            let _ = reply.send(orch.reload_registry());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portaria_core::orchestrator::NewVehicle;
    use portaria_core::{
        AccessOutcome, GateState, ManualClock, MemoryStore, OcrLine, OrchestratorConfig,
    };
    use std::sync::Arc;

    const T0: u64 = 1_700_000_000_000;

    fn engine(clock: &ManualClock) -> EngineHandle {
        let orch = AccessOrchestrator::new(
            MemoryStore::new(),
            Arc::new(clock.clone()),
            OrchestratorConfig {
                descriptor_dim: 2,
                ..Default::default()
            },
        );
        spawn_engine(orch).unwrap()
    }

    fn plate_reading(text: &str) -> OcrResult {
        OcrResult {
            text: text.into(),
            lines: vec![OcrLine { text: text.into(), bbox: None }],
            confidence: None,
        }
    }

    async fn enroll_driver(handle: &EngineHandle) -> Identity {
        handle
            .enroll(Enrollment {
                name: "Rui".into(),
                apartment: "31".into(),
                block: "C".into(),
                vehicles: vec![NewVehicle {
                    plate: "BRA2E19".into(),
                    model: "Kwid".into(),
                    color: None,
                    parking_spot: Some("12".into()),
                }],
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_plate_tick_through_engine_opens_vehicle_gate() {
        let clock = ManualClock::new(T0);
        let handle = engine(&clock);
        let rui = enroll_driver(&handle).await;

        let observation = handle.plate_text(plate_reading("BRA 2E19")).await.unwrap();
        let PlateObservation::Recognized { identity_id, access, .. } = observation else {
            panic!("plate not recognized: {observation:?}");
        };
        assert_eq!(identity_id, rui.id);
        assert!(matches!(access, Ok(AccessOutcome::Registered { gate: Some(GateKind::Vehicle), .. })));
        assert_eq!(handle.status().await.unwrap().vehicle_gate, GateState::Opening);

        // Gate timers are evaluated against the engine clock on every request.
        clock.advance(Duration::from_secs(4));
        assert_eq!(handle.status().await.unwrap().vehicle_gate, GateState::Open);
        clock.advance(Duration::from_secs(20));
        assert_eq!(handle.status().await.unwrap().vehicle_gate, GateState::Closing);
    }

    #[tokio::test]
    async fn test_manual_registration_and_records() {
        let clock = ManualClock::new(T0);
        let handle = engine(&clock);
        let rui = enroll_driver(&handle).await;

        let record = handle
            .register_manual(rui.id, None, "delivery".into())
            .await
            .unwrap();
        assert_eq!(record.direction, Direction::Entry);
        assert_eq!(handle.cooldown_remaining(rui.id).await.unwrap(), None);

        let page = handle.records(RecordFilter::default(), 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].method, "manual (delivery)");
        let exits = RecordFilter { direction: Some(Direction::Exit), since: None };
        assert_eq!(handle.records(exits, 1, 10).await.unwrap().total, 0);

        let err = handle
            .register_manual(Uuid::nil(), None, String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Access(OrchestratorError::UnknownIdentity(_))));
    }

    #[tokio::test]
    async fn test_residents_blocks_and_gate_commands() {
        let clock = ManualClock::new(T0);
        let handle = engine(&clock);
        enroll_driver(&handle).await;

        assert_eq!(handle.residents("rui".into(), None).await.unwrap().len(), 1);
        assert!(handle.residents("rui".into(), Some("A".into())).await.unwrap().is_empty());
        assert_eq!(handle.blocks().await.unwrap(), vec!["C".to_string()]);

        assert!(handle.open_gate(GateKind::Pedestrian).await.unwrap().is_some());
        assert!(handle.open_gate(GateKind::Pedestrian).await.unwrap().is_none());
        assert!(handle.close_gate(GateKind::Vehicle).await.unwrap().is_none());
        assert_eq!(handle.reload_registry().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_descriptor_validates_dimension() {
        let clock = ManualClock::new(T0);
        let handle = engine(&clock);
        let rui = enroll_driver(&handle).await;
        handle
            .set_descriptor(rui.id, FeatureVector::new(vec![0.1, 0.2]))
            .await
            .unwrap();
        assert!(handle
            .set_descriptor(rui.id, FeatureVector::new(vec![0.1]))
            .await
            .is_err());
        assert_eq!(handle.status().await.unwrap().enrolled_faces, 1);
    }

    #[tokio::test]
    async fn test_update_identity_through_engine() {
        let clock = ManualClock::new(T0);
        let handle = engine(&clock);
        let rui = enroll_driver(&handle).await;

        let updated = handle
            .update_identity(
                rui.id,
                ResidentUpdate {
                    apartment: Some("32".into()),
                    email: Some(Some("rui@example.com".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.apartment, "32");
        assert_eq!(updated.vehicles.len(), 1);
        assert_eq!(handle.residents("32".into(), None).await.unwrap().len(), 1);

        let err = handle
            .update_identity(Uuid::nil(), ResidentUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Access(OrchestratorError::UnknownIdentity(_))));
    }
}
