//! Access decisions.
//!
//! [`AccessOrchestrator`] owns every stateful component of the gatehouse and
//! is driven from a single thread: detection ticks, operator commands and
//! gate timers all go through `&mut self`. A registration passes, in order,
//! the liveness gate (facial path only), the cooldown guard, the direction
//! lookup and the ledger write; only a written `entry` opens a gate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::cooldown::{Acquire, CooldownGuard};
use crate::gate::{GateKind, GateState, GateTiming, GateTransition, Gates};
use crate::liveness::{LivenessConfig, LivenessEvaluator, LivenessVerdict, SubjectKey};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_DISTANCE_THRESHOLD};
use crate::plate::{self, PlateCode};
use crate::registry::{DescriptorRegistry, RegistryError, DEFAULT_DESCRIPTOR_DIM};
use crate::store::{AccessStore, RecordFilter, RecordPage, StoreError};
use crate::types::{
    AccessRecord, DetectionSample, Direction, FeatureVector, Identity, OcrResult,
    RecognitionMethod, Vehicle,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("ledger write failed: {0}")]
    StoreWriteFailed(StoreError),
    #[error("store read failed: {0}")]
    StoreReadFailed(StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("unknown identity: {0}")]
    UnknownIdentity(Uuid),
    #[error("invalid plate: {0:?}")]
    InvalidPlate(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub cooldown: Duration,
    /// When false, facial recognitions register without a liveness approval.
    pub liveness_required: bool,
    pub match_threshold: f32,
    pub descriptor_dim: usize,
    pub liveness: LivenessConfig,
    pub pedestrian_gate: GateTiming,
    pub vehicle_gate: GateTiming,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            liveness_required: true,
            match_threshold: DEFAULT_DISTANCE_THRESHOLD,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
            liveness: LivenessConfig::default(),
            pedestrian_gate: GateTiming::pedestrian(),
            vehicle_gate: GateTiming::vehicle(),
        }
    }
}

/// A resolved identity presented for registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub identity_id: Uuid,
    pub vehicle_id: Option<Uuid>,
    pub method: RecognitionMethod,
}

impl Recognition {
    pub fn facial(identity_id: Uuid) -> Self {
        Self {
            identity_id,
            vehicle_id: None,
            method: RecognitionMethod::Facial,
        }
    }

    pub fn plate(identity_id: Uuid, vehicle_id: Uuid, plate: PlateCode) -> Self {
        Self {
            identity_id,
            vehicle_id: Some(vehicle_id),
            method: RecognitionMethod::Plate(plate),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccessOutcome {
    /// Facial recognition held back until the subject is approved as live.
    AwaitingLiveness,
    /// Identity registered too recently.
    CoolingDown { remaining: Duration },
    Registered {
        record: AccessRecord,
        /// Gate commanded to open, if any.
        gate: Option<GateKind>,
    },
}

impl AccessOutcome {
    pub fn record(&self) -> Option<&AccessRecord> {
        match self {
            AccessOutcome::Registered { record, .. } => Some(record),
            _ => None,
        }
    }
}

/// Result of one face in one detection tick.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceObservation {
    Recognized {
        identity_id: Uuid,
        name: String,
        distance: f32,
        liveness: LivenessVerdict,
        access: Result<AccessOutcome, OrchestratorError>,
    },
    Unrecognized {
        /// Face seen without a match and without live behaviour.
        spoofing_suspected: bool,
    },
}

/// Result of one OCR tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PlateObservation {
    NoPlate,
    /// A well-formed plate that belongs to no registered vehicle.
    Unauthorized(PlateCode),
    Recognized {
        plate: PlateCode,
        identity_id: Uuid,
        name: String,
        access: Result<AccessOutcome, OrchestratorError>,
    },
}

/// Vehicle data supplied at enrollment.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVehicle {
    pub plate: String,
    pub model: String,
    pub color: Option<String>,
    pub parking_spot: Option<String>,
}

/// Resident data supplied at enrollment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Enrollment {
    pub name: String,
    pub apartment: String,
    pub block: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub descriptor: Option<FeatureVector>,
    pub vehicles: Vec<NewVehicle>,
}

/// Edit of a resident's personal data. `None` leaves a field unchanged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResidentUpdate {
    pub name: Option<String>,
    pub apartment: Option<String>,
    pub block: Option<String>,
    /// `Some(None)` clears the phone.
    pub phone: Option<Option<String>>,
    /// `Some(None)` clears the email.
    pub email: Option<Option<String>>,
    pub descriptor: Option<FeatureVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatehouseStatus {
    pub pedestrian_gate: GateState,
    pub vehicle_gate: GateState,
    pub residents: usize,
    pub enrolled_faces: usize,
    pub liveness_sessions: usize,
    pub liveness_required: bool,
    pub cooldown_secs: u64,
}

pub struct AccessOrchestrator<S> {
    store: S,
    clock: Arc<dyn Clock>,
    registry: DescriptorRegistry,
    matcher: Box<dyn Matcher + Send>,
    liveness: LivenessEvaluator,
    cooldown: CooldownGuard,
    gates: Gates,
    liveness_required: bool,
}

impl<S: AccessStore> AccessOrchestrator<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            clock,
            registry: DescriptorRegistry::new(config.descriptor_dim),
            matcher: Box::new(EuclideanMatcher {
                threshold: config.match_threshold,
            }),
            liveness: LivenessEvaluator::new(config.liveness),
            cooldown: CooldownGuard::new(config.cooldown),
            gates: Gates::new(config.pedestrian_gate, config.vehicle_gate),
            liveness_required: config.liveness_required,
        }
    }

    /// Replace the nearest-neighbour matcher.
    pub fn with_matcher(mut self, matcher: Box<dyn Matcher + Send>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Load every identity from the store into the registry.
    pub fn reload_registry(&mut self) -> Result<usize, OrchestratorError> {
        let identities = self
            .store
            .find_identities()
            .map_err(OrchestratorError::StoreReadFailed)?;
        self.registry.replace_all(identities);
        tracing::info!(
            residents = self.registry.len(),
            faces = self.registry.enrolled_faces(),
            "registry loaded"
        );
        Ok(self.registry.len())
    }

    /// Process every face detected in one frame.
    ///
    /// Each subject is observed once per frame: the closest face for every
    /// matched identity and the first unmatched face. Other faces of the same
    /// subject are dropped so that two still pictures cannot pass for motion.
    /// Liveness sessions of subjects absent from this frame are discarded.
    pub fn face_tick(&mut self, samples: &[DetectionSample]) -> Vec<FaceObservation> {
        let now = self.clock.now_ms();
        let mut subjects: Vec<(SubjectKey, &DetectionSample, Option<(String, f32)>)> = Vec::new();

        for sample in samples {
            let (key, matched) = match self.matcher.best_match(&sample.descriptor, self.registry.identities()) {
                Some(m) => (SubjectKey::Identity(m.identity.id), Some((m.identity.name.clone(), m.distance))),
                None => (SubjectKey::Unknown, None),
            };
            match subjects.iter_mut().find(|(k, ..)| *k == key) {
                Some(slot) => {
                    let closer = match (&slot.2, &matched) {
                        (Some((_, best)), Some((_, distance))) => distance < best,
                        _ => false,
                    };
                    if closer {
                        *slot = (key, sample, matched);
                    }
                }
                None => subjects.push((key, sample, matched)),
            }
        }
        if subjects.len() < samples.len() {
            tracing::debug!(
                faces = samples.len(),
                subjects = subjects.len(),
                "duplicate faces of one subject ignored"
            );
        }

        let present: Vec<SubjectKey> = subjects.iter().map(|(key, ..)| *key).collect();
        let mut observations = Vec::with_capacity(subjects.len());

        for (key, sample, matched) in subjects {
            match (key, matched) {
                (SubjectKey::Identity(identity_id), Some((name, distance))) => {
                    let liveness = self.liveness.observe(key, sample, now);
                    tracing::debug!(identity = %identity_id, distance, ?liveness, "face matched");
                    let access = self.register_access(Recognition::facial(identity_id));
                    observations.push(FaceObservation::Recognized {
                        identity_id,
                        name,
                        distance,
                        liveness,
                        access,
                    });
                }
                _ => {
                    let verdict = self.liveness.observe(SubjectKey::Unknown, sample, now);
                    let spoofing_suspected = !verdict.is_approved();
                    if spoofing_suspected {
                        tracing::warn!("unrecognized face without natural movement; possible spoofing");
                    }
                    observations.push(FaceObservation::Unrecognized { spoofing_suspected });
                }
            }
        }

        self.liveness.retain_present(&present);
        observations
    }

    /// Process one OCR reading from the plate camera.
    pub fn plate_tick(&mut self, ocr: &OcrResult) -> PlateObservation {
        let Some(plate) = plate::normalize_ocr(ocr) else {
            return PlateObservation::NoPlate;
        };
        let Some((identity_id, name, vehicle_id)) = self
            .registry
            .find_vehicle(&plate)
            .map(|(owner, vehicle)| (owner.id, owner.name.clone(), vehicle.id))
        else {
            tracing::warn!(plate = %plate, "unauthorized vehicle");
            return PlateObservation::Unauthorized(plate);
        };

        tracing::debug!(plate = %plate, identity = %identity_id, "plate matched");
        let access = self.register_access(Recognition::plate(identity_id, vehicle_id, plate.clone()));
        PlateObservation::Recognized {
            plate,
            identity_id,
            name,
            access,
        }
    }

    /// Register a recognition in the ledger and open the matching gate on entry.
    pub fn register_access(&mut self, recognition: Recognition) -> Result<AccessOutcome, OrchestratorError> {
        let id = recognition.identity_id;
        if self.registry.get(id).is_none() {
            return Err(OrchestratorError::UnknownIdentity(id));
        }

        if recognition.method == RecognitionMethod::Facial
            && self.liveness_required
            && !self.liveness.verdict(SubjectKey::Identity(id)).is_approved()
        {
            return Ok(AccessOutcome::AwaitingLiveness);
        }

        let now = self.clock.now_ms();
        let prior = match self.cooldown.try_acquire(id, now) {
            Acquire::Accepted { prior } => prior,
            Acquire::Rejected { remaining } => {
                tracing::debug!(identity = %id, remaining_ms = remaining.as_millis() as u64, "cooling down");
                return Ok(AccessOutcome::CoolingDown { remaining });
            }
        };

        let last = match self.store.find_last_record(id) {
            Ok(last) => last,
            Err(e) => {
                self.cooldown.release(id, prior);
                tracing::warn!(identity = %id, error = %e, "could not read last access");
                return Err(OrchestratorError::StoreReadFailed(e));
            }
        };
        let direction = Direction::following(last.map(|r| r.direction));
        let record = AccessRecord::new(
            id,
            recognition.vehicle_id,
            direction,
            &recognition.method,
            timestamp(now),
        );

        if let Err(e) = self.store.insert_record(&record) {
            self.cooldown.release(id, prior);
            tracing::warn!(identity = %id, error = %e, "ledger write failed; cooldown rolled back");
            return Err(OrchestratorError::StoreWriteFailed(e));
        }

        let gate = match direction {
            Direction::Entry => recognition.method.gate(),
            Direction::Exit => None,
        };
        if let Some(kind) = gate {
            self.gates.get_mut(kind).open(now);
        }

        tracing::info!(
            identity = %id,
            direction = %direction,
            method = %record.method,
            gate = ?gate,
            "access registered"
        );
        Ok(AccessOutcome::Registered { record, gate })
    }

    /// Operator registration. Skips liveness and the cooldown and moves no gate.
    ///
    /// Without an explicit direction the usual entry/exit alternation applies.
    pub fn register_manual(
        &mut self,
        identity_id: Uuid,
        direction: Option<Direction>,
        note: &str,
    ) -> Result<AccessRecord, OrchestratorError> {
        if self.registry.get(identity_id).is_none() {
            return Err(OrchestratorError::UnknownIdentity(identity_id));
        }
        let direction = match direction {
            Some(d) => d,
            None => {
                let last = self
                    .store
                    .find_last_record(identity_id)
                    .map_err(OrchestratorError::StoreReadFailed)?;
                Direction::following(last.map(|r| r.direction))
            }
        };
        let method = RecognitionMethod::Manual {
            note: note.trim().to_string(),
        };
        let record = AccessRecord::new(identity_id, None, direction, &method, timestamp(self.clock.now_ms()));
        self.store
            .insert_record(&record)
            .map_err(OrchestratorError::StoreWriteFailed)?;
        tracing::info!(identity = %identity_id, direction = %direction, method = %record.method, "manual access registered");
        Ok(record)
    }

    /// Enroll a new resident. Plates are normalized; any invalid plate rejects
    /// the whole enrollment.
    pub fn enroll(&mut self, enrollment: Enrollment) -> Result<Identity, OrchestratorError> {
        let id = Uuid::new_v4();
        let vehicles = enrollment
            .vehicles
            .into_iter()
            .map(|v| {
                let plate = plate::normalize(&v.plate).ok_or(OrchestratorError::InvalidPlate(v.plate))?;
                Ok(Vehicle {
                    id: Uuid::new_v4(),
                    owner_id: id,
                    plate,
                    model: v.model,
                    color: v.color,
                    parking_spot: v.parking_spot,
                })
            })
            .collect::<Result<Vec<_>, OrchestratorError>>()?;

        let identity = Identity {
            id,
            name: enrollment.name.trim().to_string(),
            apartment: enrollment.apartment.trim().to_string(),
            block: enrollment.block.trim().to_string(),
            phone: enrollment.phone,
            email: enrollment.email,
            vehicles,
            descriptor: enrollment.descriptor,
            created_at: timestamp(self.clock.now_ms()),
        };

        self.registry.validate(&identity)?;
        self.store
            .save_identity(&identity)
            .map_err(OrchestratorError::StoreWriteFailed)?;
        self.registry.insert(identity.clone())?;
        tracing::info!(identity = %id, unit = %identity.unit_label(), "resident enrolled");
        Ok(identity)
    }

    /// Re-enrollment: replace a resident's descriptor.
    pub fn set_descriptor(&mut self, identity_id: Uuid, descriptor: FeatureVector) -> Result<(), OrchestratorError> {
        self.registry.check_dimension(&descriptor)?;
        if self.registry.get(identity_id).is_none() {
            return Err(OrchestratorError::UnknownIdentity(identity_id));
        }
        self.store
            .set_descriptor(identity_id, &descriptor)
            .map_err(OrchestratorError::StoreWriteFailed)?;
        self.registry.set_descriptor(identity_id, descriptor)?;
        self.liveness.discard(SubjectKey::Identity(identity_id));
        tracing::info!(identity = %identity_id, "descriptor replaced");
        Ok(())
    }

    /// Edit a resident's personal data and, optionally, the descriptor.
    pub fn update_identity(&mut self, identity_id: Uuid, update: ResidentUpdate) -> Result<Identity, OrchestratorError> {
        let current = self
            .registry
            .get(identity_id)
            .ok_or(OrchestratorError::UnknownIdentity(identity_id))?;
        if let Some(descriptor) = &update.descriptor {
            self.registry.check_dimension(descriptor)?;
        }
        let descriptor_replaced = update.descriptor.is_some();
        let trimmed = |v: String| v.trim().to_string();
        let edited = Identity {
            name: update.name.map(trimmed).unwrap_or_else(|| current.name.clone()),
            apartment: update.apartment.map(trimmed).unwrap_or_else(|| current.apartment.clone()),
            block: update.block.map(trimmed).unwrap_or_else(|| current.block.clone()),
            phone: update.phone.unwrap_or_else(|| current.phone.clone()),
            email: update.email.unwrap_or_else(|| current.email.clone()),
            descriptor: update.descriptor.or_else(|| current.descriptor.clone()),
            ..current.clone()
        };

        self.store
            .update_identity(&edited)
            .map_err(OrchestratorError::StoreWriteFailed)?;
        self.registry.update_details(edited.clone())?;
        if descriptor_replaced {
            self.liveness.discard(SubjectKey::Identity(identity_id));
        }
        tracing::info!(identity = %identity_id, unit = %edited.unit_label(), descriptor_replaced, "resident updated");
        Ok(edited)
    }

    pub fn residents(&self, term: &str, block: Option<&str>) -> Vec<Identity> {
        self.registry.search(term, block).into_iter().cloned().collect()
    }

    pub fn blocks(&self) -> Vec<String> {
        self.registry.blocks().into_iter().map(str::to_string).collect()
    }

    pub fn records(&self, filter: &RecordFilter, page: usize, page_size: usize) -> Result<RecordPage, OrchestratorError> {
        self.store
            .list_records(filter, page, page_size)
            .map_err(OrchestratorError::StoreReadFailed)
    }

    pub fn cooldown_remaining(&self, identity_id: Uuid) -> Option<Duration> {
        self.cooldown.remaining(identity_id, self.clock.now_ms())
    }

    pub fn open_gate(&mut self, kind: GateKind) -> Option<GateTransition> {
        let now = self.clock.now_ms();
        self.gates.get_mut(kind).open(now)
    }

    pub fn close_gate(&mut self, kind: GateKind) -> Option<GateTransition> {
        let now = self.clock.now_ms();
        self.gates.get_mut(kind).close(now)
    }

    /// Fire every gate timer that has come due.
    pub fn advance_gates(&mut self) -> Vec<GateTransition> {
        let fired = self.gates.advance(self.clock.now_ms());
        for t in &fired {
            tracing::info!(gate = %t.gate, from = t.from.as_str(), to = t.to.as_str(), "gate moved");
        }
        fired
    }

    /// Earliest pending gate deadline, in clock milliseconds.
    pub fn next_gate_deadline(&self) -> Option<u64> {
        self.gates.next_deadline()
    }

    pub fn gate_state(&self, kind: GateKind) -> GateState {
        self.gates.get(kind).state()
    }

    pub fn status(&self) -> GatehouseStatus {
        GatehouseStatus {
            pedestrian_gate: self.gate_state(GateKind::Pedestrian),
            vehicle_gate: self.gate_state(GateKind::Vehicle),
            residents: self.registry.len(),
            enrolled_faces: self.registry.enrolled_faces(),
            liveness_sessions: self.liveness.session_count(),
            liveness_required: self.liveness_required,
            cooldown_secs: self.cooldown.window().as_secs(),
        }
    }
}

fn timestamp(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::{BoundingBox, OcrLine, Point};

    const T0: u64 = 1_700_000_000_000;

    /// Memory store whose reads and writes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: bool,
        fail_writes: bool,
    }

    impl AccessStore for FlakyStore {
        fn find_identities(&self) -> Result<Vec<Identity>, StoreError> {
            self.inner.find_identities()
        }

        fn find_last_record(&self, id: Uuid) -> Result<Option<AccessRecord>, StoreError> {
            if self.fail_reads {
                return Err(StoreError::Backend("read timeout".into()));
            }
            self.inner.find_last_record(id)
        }

        fn insert_record(&mut self, record: &AccessRecord) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.insert_record(record)
        }

        fn list_records(&self, filter: &RecordFilter, page: usize, size: usize) -> Result<RecordPage, StoreError> {
            self.inner.list_records(filter, page, size)
        }

        fn save_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
            self.inner.save_identity(identity)
        }

        fn set_descriptor(&mut self, id: Uuid, d: &FeatureVector) -> Result<(), StoreError> {
            self.inner.set_descriptor(id, d)
        }

        fn update_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.update_identity(identity)
        }
    }

    fn descriptor(seed: f32) -> FeatureVector {
        FeatureVector::new(vec![seed, 0.0, 0.0, 0.0])
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            descriptor_dim: 4,
            ..Default::default()
        }
    }

    fn setup() -> (AccessOrchestrator<FlakyStore>, ManualClock, Uuid) {
        let clock = ManualClock::new(T0);
        let mut orch = AccessOrchestrator::new(FlakyStore::default(), Arc::new(clock.clone()), config());
        let ana = orch
            .enroll(Enrollment {
                name: "Ana".into(),
                apartment: "101".into(),
                block: "A".into(),
                descriptor: Some(descriptor(0.0)),
                vehicles: vec![NewVehicle {
                    plate: "abc-1d23".into(),
                    model: "Onix".into(),
                    color: Some("prata".into()),
                    parking_spot: None,
                }],
                ..Default::default()
            })
            .unwrap();
        (orch, clock, ana.id)
    }

    fn face(seed: f32, offset: f32) -> DetectionSample {
        DetectionSample {
            descriptor: descriptor(seed),
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 100.0, height: 120.0, confidence: 0.9 },
            landmarks: (0..5).map(|i| Point { x: i as f32 * 10.0 + offset, y: 50.0 }).collect(),
            expressions: None,
        }
    }

    fn ocr(text: &str) -> OcrResult {
        OcrResult {
            text: text.into(),
            lines: vec![OcrLine { text: text.into(), bbox: None }],
            confidence: Some(0.8),
        }
    }

    /// Drive a moving face until liveness approves it.
    fn approve_face(orch: &mut AccessOrchestrator<FlakyStore>, clock: &ManualClock) -> Vec<FaceObservation> {
        for step in 0..10 {
            let observations = orch.face_tick(&[face(0.0, step as f32 * 3.0)]);
            clock.advance(Duration::from_millis(300));
            if matches!(
                &observations[0],
                FaceObservation::Recognized { liveness: LivenessVerdict::Approved, .. }
            ) {
                return observations;
            }
        }
        panic!("liveness never approved");
    }

    fn registered(outcome: &Result<AccessOutcome, OrchestratorError>) -> &AccessRecord {
        match outcome {
            Ok(AccessOutcome::Registered { record, .. }) => record,
            other => panic!("expected registration, got {other:?}"),
        }
    }

    #[test]
    fn test_entry_then_exit_alternates() {
        let (mut orch, clock, ana) = setup();
        let vehicle = orch.registry().get(ana).unwrap().vehicles[0].id;

        let first = orch.register_access(Recognition::plate(ana, vehicle, PlateCode::parse("ABC1D23").unwrap()));
        assert_eq!(registered(&first).direction, Direction::Entry);

        clock.advance(Duration::from_secs(31));
        let second = orch.plate_tick(&ocr("ABC1D23"));
        let PlateObservation::Recognized { access, .. } = second else {
            panic!("plate not recognized");
        };
        assert_eq!(registered(&access).direction, Direction::Exit);

        clock.advance(Duration::from_secs(31));
        let PlateObservation::Recognized { access, .. } = orch.plate_tick(&ocr("ABC1D23")) else {
            panic!("plate not recognized");
        };
        assert_eq!(registered(&access).direction, Direction::Entry);
    }

    #[test]
    fn test_facial_entry_requires_liveness_and_opens_pedestrian_gate() {
        let (mut orch, clock, ana) = setup();

        let first = orch.face_tick(&[face(0.0, 0.0)]);
        assert!(matches!(
            &first[0],
            FaceObservation::Recognized { access: Ok(AccessOutcome::AwaitingLiveness), .. }
        ));
        assert!(orch.store().inner.records().is_empty());

        clock.advance(Duration::from_millis(300));
        let observations = approve_face(&mut orch, &clock);
        let FaceObservation::Recognized { identity_id, liveness, access, .. } = &observations[0] else {
            panic!("face not recognized");
        };
        assert_eq!(*identity_id, ana);
        assert!(liveness.is_approved());
        assert!(matches!(
            access,
            Ok(AccessOutcome::Registered { gate: Some(GateKind::Pedestrian), .. })
        ));
        assert_eq!(registered(access).method, "facial recognition");
        assert_eq!(orch.gate_state(GateKind::Pedestrian), GateState::Opening);
        assert_eq!(orch.gate_state(GateKind::Vehicle), GateState::Closed);
        assert_eq!(orch.store().inner.records().len(), 1);
    }

    #[test]
    fn test_second_recognition_within_cooldown_rejected() {
        let (mut orch, clock, ana) = setup();
        let vehicle = orch.registry().get(ana).unwrap().vehicles[0].id;
        let plate = PlateCode::parse("ABC1D23").unwrap();

        registered(&orch.register_access(Recognition::plate(ana, vehicle, plate.clone())));
        orch.advance_gates();
        let gate_before = orch.gate_state(GateKind::Vehicle);

        clock.advance(Duration::from_secs(5));
        let outcome = orch.register_access(Recognition::plate(ana, vehicle, plate)).unwrap();
        assert_eq!(outcome, AccessOutcome::CoolingDown { remaining: Duration::from_secs(25) });
        assert_eq!(orch.store().inner.records().len(), 1);
        assert_eq!(orch.gate_state(GateKind::Vehicle), gate_before);
        assert_eq!(orch.cooldown_remaining(ana), Some(Duration::from_secs(25)));
    }

    #[test]
    fn test_write_failure_rolls_back_cooldown_and_keeps_gate_closed() {
        let (mut orch, _clock, ana) = setup();
        orch.store.fail_writes = true;

        let PlateObservation::Recognized { access, .. } = orch.plate_tick(&ocr("ABC1D23")) else {
            panic!("plate not recognized");
        };
        assert!(matches!(access, Err(OrchestratorError::StoreWriteFailed(_))));
        assert_eq!(orch.gate_state(GateKind::Vehicle), GateState::Closed);
        assert_eq!(orch.cooldown_remaining(ana), None);

        // Next tick retries immediately.
        orch.store.fail_writes = false;
        let PlateObservation::Recognized { access, .. } = orch.plate_tick(&ocr("ABC1D23")) else {
            panic!("plate not recognized");
        };
        assert_eq!(registered(&access).direction, Direction::Entry);
    }

    #[test]
    fn test_read_failure_rolls_back_cooldown() {
        let (mut orch, _clock, ana) = setup();
        orch.store.fail_reads = true;
        let PlateObservation::Recognized { access, .. } = orch.plate_tick(&ocr("ABC1D23")) else {
            panic!("plate not recognized");
        };
        assert!(matches!(access, Err(OrchestratorError::StoreReadFailed(_))));
        assert_eq!(orch.cooldown_remaining(ana), None);
        assert!(orch.store().inner.records().is_empty());
    }

    #[test]
    fn test_plate_entry_opens_vehicle_gate_only() {
        let (mut orch, clock, _ana) = setup();
        let PlateObservation::Recognized { plate, access, .. } = orch.plate_tick(&ocr("abc 1d23")) else {
            panic!("plate not recognized");
        };
        assert_eq!(plate.as_str(), "ABC1D23");
        assert_eq!(registered(&access).method, "plate recognition (ABC1D23)");
        assert!(registered(&access).vehicle_id.is_some());
        assert_eq!(orch.gate_state(GateKind::Vehicle), GateState::Opening);
        assert_eq!(orch.gate_state(GateKind::Pedestrian), GateState::Closed);

        clock.advance(Duration::from_secs(4));
        orch.advance_gates();
        assert_eq!(orch.gate_state(GateKind::Vehicle), GateState::Open);
        assert_eq!(orch.next_gate_deadline(), Some(T0 + 24_000));
    }

    #[test]
    fn test_exit_does_not_open_gate() {
        let (mut orch, clock, _ana) = setup();
        orch.plate_tick(&ocr("ABC1D23"));
        clock.advance(Duration::from_secs(60));
        orch.advance_gates();
        assert_eq!(orch.gate_state(GateKind::Vehicle), GateState::Closed);

        let PlateObservation::Recognized { access, .. } = orch.plate_tick(&ocr("ABC1D23")) else {
            panic!("plate not recognized");
        };
        assert!(matches!(access, Ok(AccessOutcome::Registered { gate: None, .. })));
        assert_eq!(orch.gate_state(GateKind::Vehicle), GateState::Closed);
    }

    #[test]
    fn test_unknown_and_invalid_plates() {
        let (mut orch, _clock, _ana) = setup();
        assert_eq!(orch.plate_tick(&ocr("no plate here")), PlateObservation::NoPlate);
        assert_eq!(
            orch.plate_tick(&ocr("XYZ9876")),
            PlateObservation::Unauthorized(PlateCode::parse("XYZ9876").unwrap())
        );
        assert!(orch.store().inner.records().is_empty());
    }

    #[test]
    fn test_unmatched_static_face_flags_spoofing() {
        let (mut orch, clock, _ana) = setup();
        for _ in 0..5 {
            let obs = orch.face_tick(&[face(5.0, 0.0)]);
            assert_eq!(obs, vec![FaceObservation::Unrecognized { spoofing_suspected: true }]);
            clock.advance(Duration::from_millis(300));
        }
        assert!(orch.store().inner.records().is_empty());
    }

    #[test]
    fn test_two_still_photos_of_resident_never_approved() {
        let (mut orch, clock, _ana) = setup();
        for _ in 0..8 {
            let obs = orch.face_tick(&[face(0.0, 0.0), face(0.0, 200.0)]);
            assert_eq!(obs.len(), 1);
            assert!(matches!(
                &obs[0],
                FaceObservation::Recognized {
                    liveness: LivenessVerdict::Pending,
                    access: Ok(AccessOutcome::AwaitingLiveness),
                    ..
                }
            ));
            clock.advance(Duration::from_millis(300));
        }
        assert!(orch.store().inner.records().is_empty());
        assert_eq!(orch.status().liveness_sessions, 1);
    }

    #[test]
    fn test_two_still_unknown_faces_stay_suspect() {
        let (mut orch, clock, _ana) = setup();
        for _ in 0..8 {
            let obs = orch.face_tick(&[face(5.0, 0.0), face(5.0, 200.0)]);
            assert_eq!(obs, vec![FaceObservation::Unrecognized { spoofing_suspected: true }]);
            clock.advance(Duration::from_millis(300));
        }
    }

    #[test]
    fn test_closest_face_of_identity_is_observed() {
        let (mut orch, _clock, ana) = setup();
        let obs = orch.face_tick(&[face(0.3, 0.0), face(0.1, 0.0), face(5.0, 0.0)]);
        assert_eq!(obs.len(), 2);
        let FaceObservation::Recognized { identity_id, distance, .. } = &obs[0] else {
            panic!("face not recognized");
        };
        assert_eq!(*identity_id, ana);
        assert!((distance - 0.1).abs() < 1e-6);
        assert!(matches!(obs[1], FaceObservation::Unrecognized { .. }));
    }

    #[test]
    fn test_losing_subject_resets_liveness() {
        let (mut orch, clock, _ana) = setup();
        approve_face(&mut orch, &clock);
        assert_eq!(orch.status().liveness_sessions, 1);
        orch.face_tick(&[]);
        assert_eq!(orch.status().liveness_sessions, 0);

        let obs = orch.face_tick(&[face(0.0, 0.0)]);
        assert!(matches!(&obs[0], FaceObservation::Recognized { liveness: LivenessVerdict::Pending, .. }));
    }

    #[test]
    fn test_liveness_not_required_registers_first_tick() {
        let clock = ManualClock::new(T0);
        let mut orch = AccessOrchestrator::new(
            FlakyStore::default(),
            Arc::new(clock.clone()),
            OrchestratorConfig {
                liveness_required: false,
                ..config()
            },
        );
        orch.enroll(Enrollment {
            name: "Bia".into(),
            descriptor: Some(descriptor(0.0)),
            ..Default::default()
        })
        .unwrap();
        let obs = orch.face_tick(&[face(0.0, 0.0)]);
        let FaceObservation::Recognized { access, .. } = &obs[0] else {
            panic!("face not recognized");
        };
        assert_eq!(registered(access).direction, Direction::Entry);
    }

    #[test]
    fn test_manual_registration_skips_cooldown_and_gate() {
        let (mut orch, _clock, ana) = setup();
        orch.plate_tick(&ocr("ABC1D23"));
        assert!(orch.cooldown_remaining(ana).is_some());

        let record = orch.register_manual(ana, None, " visitor escort ").unwrap();
        assert_eq!(record.direction, Direction::Exit);
        assert_eq!(record.method, "manual (visitor escort)");
        assert_eq!(record.vehicle_id, None);

        let record = orch.register_manual(ana, Some(Direction::Exit), "").unwrap();
        assert_eq!(record.method, "manual");
        assert_eq!(orch.store().inner.records().len(), 3);
        assert_eq!(orch.gate_state(GateKind::Pedestrian), GateState::Closed);

        assert_eq!(
            orch.register_manual(Uuid::nil(), None, ""),
            Err(OrchestratorError::UnknownIdentity(Uuid::nil()))
        );
    }

    #[test]
    fn test_enroll_validates_plates_and_dimensions() {
        let (mut orch, _clock, _ana) = setup();
        let bad_plate = orch.enroll(Enrollment {
            name: "Caio".into(),
            vehicles: vec![NewVehicle {
                plate: "12".into(),
                model: "Gol".into(),
                color: None,
                parking_spot: None,
            }],
            ..Default::default()
        });
        assert_eq!(bad_plate, Err(OrchestratorError::InvalidPlate("12".into())));

        let duplicate = orch.enroll(Enrollment {
            name: "Caio".into(),
            vehicles: vec![NewVehicle {
                plate: "ABC1D23".into(),
                model: "Gol".into(),
                color: None,
                parking_spot: None,
            }],
            ..Default::default()
        });
        assert!(matches!(duplicate, Err(OrchestratorError::Registry(RegistryError::DuplicatePlate(_)))));

        let wrong_dim = orch.enroll(Enrollment {
            name: "Caio".into(),
            descriptor: Some(FeatureVector::new(vec![0.0; 128])),
            ..Default::default()
        });
        assert!(matches!(
            wrong_dim,
            Err(OrchestratorError::Registry(RegistryError::DimensionMismatch { expected: 4, actual: 128 }))
        ));
        assert_eq!(orch.registry().len(), 1);
        assert_eq!(orch.store().inner.find_identities().unwrap().len(), 1);
    }

    #[test]
    fn test_set_descriptor_reenrolls() {
        let (mut orch, clock, ana) = setup();
        orch.set_descriptor(ana, descriptor(2.0)).unwrap();

        clock.advance(Duration::from_secs(1));
        let obs = orch.face_tick(&[face(0.0, 0.0)]);
        assert!(matches!(obs[0], FaceObservation::Unrecognized { .. }));
        let obs = orch.face_tick(&[face(2.0, 0.0)]);
        assert!(matches!(&obs[0], FaceObservation::Recognized { identity_id, .. } if *identity_id == ana));

        let stored = orch.store().inner.find_identities().unwrap();
        assert_eq!(stored[0].descriptor, Some(descriptor(2.0)));
    }

    #[test]
    fn test_update_identity_edits_details_and_keeps_vehicles() {
        let (mut orch, _clock, ana) = setup();
        let updated = orch
            .update_identity(
                ana,
                ResidentUpdate {
                    name: Some(" Ana Souza ".into()),
                    apartment: Some("202".into()),
                    phone: Some(Some("5511999990000".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Ana Souza");
        assert_eq!(updated.apartment, "202");
        assert_eq!(updated.block, "A");
        assert_eq!(updated.phone.as_deref(), Some("5511999990000"));
        assert_eq!(updated.descriptor, Some(descriptor(0.0)));
        assert_eq!(updated.vehicles.len(), 1);

        let stored = orch.store().inner.find_identities().unwrap();
        assert_eq!(stored[0].name, "Ana Souza");
        assert_eq!(stored[0].vehicles.len(), 1);
        assert_eq!(orch.residents("souza", None).len(), 1);

        match orch.plate_tick(&ocr("ABC1D23")) {
            PlateObservation::Recognized { identity_id, name, .. } => {
                assert_eq!(identity_id, ana);
                assert_eq!(name, "Ana Souza");
            }
            other => panic!("expected plate recognition, got {other:?}"),
        }

        let cleared = orch
            .update_identity(ana, ResidentUpdate { phone: Some(None), ..Default::default() })
            .unwrap();
        assert_eq!(cleared.phone, None);
    }

    #[test]
    fn test_update_identity_replaces_descriptor() {
        let (mut orch, clock, ana) = setup();
        orch.update_identity(ana, ResidentUpdate { descriptor: Some(descriptor(2.0)), ..Default::default() })
            .unwrap();

        clock.advance(Duration::from_secs(1));
        let obs = orch.face_tick(&[face(2.0, 0.0)]);
        assert!(matches!(&obs[0], FaceObservation::Recognized { identity_id, .. } if *identity_id == ana));
    }

    #[test]
    fn test_update_identity_rejections_leave_state_untouched() {
        let (mut orch, _clock, ana) = setup();

        let unknown = orch.update_identity(Uuid::new_v4(), ResidentUpdate::default());
        assert!(matches!(unknown, Err(OrchestratorError::UnknownIdentity(_))));

        let wrong_dim = orch.update_identity(
            ana,
            ResidentUpdate { descriptor: Some(FeatureVector::new(vec![0.0; 128])), ..Default::default() },
        );
        assert!(matches!(
            wrong_dim,
            Err(OrchestratorError::Registry(RegistryError::DimensionMismatch { expected: 4, actual: 128 }))
        ));

        orch.store.fail_writes = true;
        let failed = orch.update_identity(ana, ResidentUpdate { name: Some("Bia".into()), ..Default::default() });
        assert!(matches!(failed, Err(OrchestratorError::StoreWriteFailed(_))));
        assert_eq!(orch.registry().get(ana).unwrap().name, "Ana");
        assert_eq!(orch.store().inner.find_identities().unwrap()[0].name, "Ana");
    }

    #[test]
    fn test_reload_registry_and_status() {
        let clock = ManualClock::new(T0);
        let (orch, _, _) = setup();
        let identities = orch.store().inner.find_identities().unwrap();

        let mut fresh = AccessOrchestrator::new(
            FlakyStore {
                inner: MemoryStore::with_identities(identities),
                ..Default::default()
            },
            Arc::new(clock),
            config(),
        );
        assert_eq!(fresh.status().residents, 0);
        assert_eq!(fresh.reload_registry().unwrap(), 1);

        let status = fresh.status();
        assert_eq!(status.residents, 1);
        assert_eq!(status.enrolled_faces, 1);
        assert_eq!(status.cooldown_secs, 30);
        assert_eq!(status.pedestrian_gate, GateState::Closed);
        assert_eq!(fresh.residents("an", None).len(), 1);
        assert_eq!(fresh.blocks(), vec!["A".to_string()]);
    }

    #[test]
    fn test_custom_matcher_threshold() {
        let (orch, clock, _ana) = setup();
        let mut orch = orch.with_matcher(Box::new(EuclideanMatcher { threshold: 0.05 }));
        let obs = orch.face_tick(&[face(0.1, 0.0)]);
        assert!(matches!(obs[0], FaceObservation::Unrecognized { .. }));
        clock.advance(Duration::from_millis(300));
        let obs = orch.face_tick(&[face(0.01, 0.0)]);
        assert!(matches!(obs[0], FaceObservation::Recognized { .. }));
    }

    #[test]
    fn test_manual_gate_control() {
        let (mut orch, clock, _ana) = setup();
        assert!(orch.close_gate(GateKind::Pedestrian).is_none());
        assert!(orch.open_gate(GateKind::Pedestrian).is_some());
        clock.advance(Duration::from_millis(2_500));
        orch.advance_gates();
        let closing = orch.close_gate(GateKind::Pedestrian).unwrap();
        assert_eq!(closing.to, GateState::Closing);
        clock.advance(Duration::from_millis(2_500));
        orch.advance_gates();
        assert_eq!(orch.gate_state(GateKind::Pedestrian), GateState::Closed);
        assert_eq!(orch.next_gate_deadline(), None);
    }

    #[test]
    fn test_records_paged_newest_first() {
        let (mut orch, clock, ana) = setup();
        for _ in 0..12 {
            orch.register_manual(ana, None, "").unwrap();
            clock.advance(Duration::from_secs(1));
        }
        let page = orch.records(&RecordFilter::default(), 1, 10).unwrap();
        assert_eq!(page.records.len(), 10);
        assert_eq!(page.total_pages(), 2);
        assert!(page.records[0].created_at > page.records[9].created_at);
    }

    #[test]
    fn test_records_filtered_by_direction() {
        let (mut orch, clock, ana) = setup();
        for _ in 0..5 {
            orch.register_manual(ana, None, "").unwrap();
            clock.advance(Duration::from_secs(1));
        }
        let filter = RecordFilter { direction: Some(Direction::Exit), since: None };
        let page = orch.records(&filter, 1, 10).unwrap();
        assert_eq!(page.total, 2);
        assert!(page.records.iter().all(|r| r.direction == Direction::Exit));
    }
}
