//! portaria-core — Access decision core for a building gatehouse.
//!
//! Resolves detected faces against enrolled descriptors, gates trust behind a
//! liveness heuristic, parses license plates out of noisy OCR text, and turns
//! accepted recognitions into ledger entries and gate commands.

pub mod clock;
pub mod cooldown;
pub mod gate;
pub mod liveness;
pub mod matcher;
pub mod orchestrator;
pub mod plate;
pub mod registry;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::{Acquire, CooldownGuard};
pub use gate::{Gate, GateKind, GateState, GateTiming, GateTransition, Gates};
pub use liveness::{LivenessConfig, LivenessEvaluator, LivenessVerdict, SessionStats, SubjectKey};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use orchestrator::{
    AccessOrchestrator, AccessOutcome, Enrollment, FaceObservation, GatehouseStatus, NewVehicle,
    OrchestratorConfig, OrchestratorError, PlateObservation, Recognition, ResidentUpdate,
};
pub use plate::PlateCode;
pub use registry::{DescriptorRegistry, RegistryError};
pub use store::{AccessStore, MemoryStore, RecordFilter, RecordPage, RecordWindow, StoreError};
pub use types::{
    AccessRecord, BoundingBox, DetectionSample, Direction, FeatureVector, Identity, OcrLine,
    OcrResult, Point, RecognitionMethod, Vehicle,
};
