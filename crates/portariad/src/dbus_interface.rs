use crate::capture::{Cameras, StreamRole};
use crate::engine::{EngineError, EngineHandle};
use portaria_core::cooldown::wait_seconds;
use chrono::{DateTime, TimeZone, Utc};
use portaria_core::orchestrator::{Enrollment, FaceObservation, NewVehicle, PlateObservation, ResidentUpdate};
use portaria_core::{
    AccessOutcome, DetectionSample, Direction, FeatureVector, GateKind, GateTransition, Identity,
    OcrResult, OrchestratorError, RecordFilter, RecordWindow,
};
use portaria_hw::StreamError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use zbus::interface;

/// D-Bus interface for the gatehouse daemon.
///
/// Bus name: org.portaria.Gatehouse1
/// Object path: /org/portaria/Gatehouse1
///
/// Structured payloads travel as JSON strings.
pub struct GatehouseService {
    engine: EngineHandle,
    cameras: Arc<Cameras>,
    records_page_size: usize,
}

impl GatehouseService {
    pub fn new(engine: EngineHandle, cameras: Arc<Cameras>, records_page_size: usize) -> Self {
        Self {
            engine,
            cameras,
            records_page_size,
        }
    }
}

#[interface(name = "org.portaria.Gatehouse1")]
impl GatehouseService {
    /// Gate states, registry counters and camera activity.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        let cameras: Vec<&str> = self
            .cameras
            .active_roles()
            .await
            .into_iter()
            .map(|r| r.as_str())
            .collect();
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "gatehouse": status,
            "cameras": cameras,
            "models_available": self.cameras.models_available(),
        })
        .to_string())
    }

    async fn open_gate(&self, gate: &str) -> zbus::fdo::Result<String> {
        let kind = parse_gate(gate)?;
        tracing::info!(gate = %kind, "manual open requested");
        let transition = self.engine.open_gate(kind).await.map_err(to_fdo)?;
        Ok(transition_json(kind, transition).to_string())
    }

    async fn close_gate(&self, gate: &str) -> zbus::fdo::Result<String> {
        let kind = parse_gate(gate)?;
        tracing::info!(gate = %kind, "manual close requested");
        let transition = self.engine.close_gate(kind).await.map_err(to_fdo)?;
        Ok(transition_json(kind, transition).to_string())
    }

    /// Push one detection tick computed outside the daemon.
    async fn submit_face_samples(&self, samples_json: &str) -> zbus::fdo::Result<String> {
        let samples: Vec<DetectionSample> = serde_json::from_str(samples_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid detection samples: {e}")))?;
        let observations = self.engine.face_samples(samples).await.map_err(to_fdo)?;
        Ok(Value::Array(observations.iter().map(face_json).collect()).to_string())
    }

    /// Push one OCR reading computed outside the daemon.
    async fn submit_plate_text(&self, text: &str) -> zbus::fdo::Result<String> {
        let ocr = OcrResult {
            text: text.to_string(),
            ..Default::default()
        };
        let observation = self.engine.plate_text(ocr).await.map_err(to_fdo)?;
        Ok(plate_json(&observation).to_string())
    }

    /// Manual ledger entry. An empty direction alternates from the last record.
    async fn register_access(&self, identity_id: &str, direction: &str, note: &str) -> zbus::fdo::Result<String> {
        let id = parse_id(identity_id)?;
        let direction = parse_direction(direction)?;
        let record = self
            .engine
            .register_manual(id, direction, note.to_string())
            .await
            .map_err(to_fdo)?;
        to_json(&record)
    }

    async fn enroll(&self, enrollment_json: &str) -> zbus::fdo::Result<String> {
        let request: EnrollRequest = serde_json::from_str(enrollment_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid enrollment: {e}")))?;
        let enrollment = request.into_enrollment()?;
        let identity = self.engine.enroll(enrollment).await.map_err(to_fdo)?;
        Ok(resident_json(&identity).to_string())
    }

    /// Edit a resident. Absent fields stay as they are; an empty phone or
    /// email clears it.
    async fn update_resident(&self, identity_id: &str, update_json: &str) -> zbus::fdo::Result<String> {
        let id = parse_id(identity_id)?;
        let request: UpdateRequest = serde_json::from_str(update_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid resident update: {e}")))?;
        let update = request.into_update()?;
        let identity = self.engine.update_identity(id, update).await.map_err(to_fdo)?;
        Ok(resident_json(&identity).to_string())
    }

    async fn set_descriptor(&self, identity_id: &str, descriptor_json: &str) -> zbus::fdo::Result<()> {
        let id = parse_id(identity_id)?;
        let descriptor: FeatureVector = serde_json::from_str(descriptor_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid descriptor: {e}")))?;
        self.engine.set_descriptor(id, descriptor).await.map_err(to_fdo)
    }

    /// Residents matching `term` by name or unit, optionally within one block.
    async fn residents(&self, term: &str, block: &str) -> zbus::fdo::Result<String> {
        let block = Some(block.trim()).filter(|b| !b.is_empty()).map(str::to_string);
        let residents = self
            .engine
            .residents(term.to_string(), block)
            .await
            .map_err(to_fdo)?;
        Ok(Value::Array(residents.iter().map(resident_json).collect()).to_string())
    }

    async fn blocks(&self) -> zbus::fdo::Result<Vec<String>> {
        self.engine.blocks().await.map_err(to_fdo)
    }

    /// One page of the access log, newest first. Page size 0 means the default.
    ///
    /// `direction` is `entry`, `exit` or empty for both. `since` is `today`,
    /// `week`, `month`, an RFC 3339 timestamp or empty for the whole log.
    async fn records(&self, page: u32, page_size: u32, direction: &str, since: &str) -> zbus::fdo::Result<String> {
        let filter = parse_record_filter(direction, since, chrono::Local::now())?;
        let page_size = match page_size {
            0 => self.records_page_size,
            n => n as usize,
        };
        let records = self
            .engine
            .records(filter, page as usize, page_size)
            .await
            .map_err(to_fdo)?;
        let mut value = serde_json::to_value(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        value["total_pages"] = json!(records.total_pages());
        Ok(value.to_string())
    }

    /// Seconds until the resident may be registered again; 0 when free.
    async fn cooldown_remaining(&self, identity_id: &str) -> zbus::fdo::Result<u64> {
        let id = parse_id(identity_id)?;
        let remaining = self.engine.cooldown_remaining(id).await.map_err(to_fdo)?;
        Ok(remaining.map(wait_seconds).unwrap_or(0))
    }

    async fn activate_camera(&self, camera: &str) -> zbus::fdo::Result<()> {
        let role = parse_role(camera)?;
        self.cameras.activate(role).await.map_err(to_fdo)
    }

    async fn deactivate_camera(&self, camera: &str) -> zbus::fdo::Result<bool> {
        let role = parse_role(camera)?;
        Ok(self.cameras.deactivate(role).await)
    }

    /// Rebuild the in-memory registry from the database.
    async fn reload_registry(&self) -> zbus::fdo::Result<u32> {
        let count = self.engine.reload_registry().await.map_err(to_fdo)?;
        Ok(count as u32)
    }
}

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    name: String,
    #[serde(default)]
    apartment: String,
    #[serde(default)]
    block: String,
    phone: Option<String>,
    email: Option<String>,
    descriptor: Option<FeatureVector>,
    #[serde(default)]
    vehicles: Vec<VehicleRequest>,
}

#[derive(Debug, Deserialize)]
struct VehicleRequest {
    plate: String,
    #[serde(default)]
    model: String,
    color: Option<String>,
    parking_spot: Option<String>,
}

impl EnrollRequest {
    fn into_enrollment(self) -> zbus::fdo::Result<Enrollment> {
        if self.name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("resident name is required".into()));
        }
        Ok(Enrollment {
            name: self.name,
            apartment: self.apartment,
            block: self.block,
            phone: self.phone.filter(|p| !p.trim().is_empty()),
            email: self.email.filter(|e| !e.trim().is_empty()),
            descriptor: self.descriptor,
            vehicles: self
                .vehicles
                .into_iter()
                .map(|v| NewVehicle {
                    plate: v.plate,
                    model: v.model,
                    color: v.color,
                    parking_spot: v.parking_spot,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct UpdateRequest {
    name: Option<String>,
    apartment: Option<String>,
    block: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    descriptor: Option<FeatureVector>,
}

impl UpdateRequest {
    fn into_update(self) -> zbus::fdo::Result<ResidentUpdate> {
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(zbus::fdo::Error::InvalidArgs("resident name cannot be empty".into()));
        }
        let clearable = |v: Option<String>| v.map(|v| Some(v).filter(|v| !v.trim().is_empty()));
        Ok(ResidentUpdate {
            name: self.name,
            apartment: self.apartment,
            block: self.block,
            phone: clearable(self.phone),
            email: clearable(self.email),
            descriptor: self.descriptor,
        })
    }
}

fn parse_record_filter<Tz: TimeZone>(
    direction: &str,
    since: &str,
    now: DateTime<Tz>,
) -> zbus::fdo::Result<RecordFilter> {
    let direction = parse_direction(direction)?;
    let since = match since.trim() {
        "" => None,
        other => match RecordWindow::parse(other) {
            Some(window) => Some(window.since(now)),
            None => Some(
                DateTime::parse_from_rfc3339(other)
                    .map_err(|e| {
                        zbus::fdo::Error::InvalidArgs(format!(
                            "invalid since '{other}' (today, week, month or RFC 3339): {e}"
                        ))
                    })?
                    .with_timezone(&Utc),
            ),
        },
    };
    Ok(RecordFilter { direction, since })
}

/// Empty means either direction.
fn parse_direction(s: &str) -> zbus::fdo::Result<Option<Direction>> {
    match s.trim() {
        "" => Ok(None),
        other => Direction::parse(other)
            .map(Some)
            .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("unknown direction '{other}' (entry, exit)"))),
    }
}

fn parse_gate(s: &str) -> zbus::fdo::Result<GateKind> {
    GateKind::parse(s)
        .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("unknown gate '{s}' (pedestrian, vehicle)")))
}

fn parse_role(s: &str) -> zbus::fdo::Result<StreamRole> {
    StreamRole::parse(s).ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("unknown camera '{s}' (face, plate)")))
}

fn parse_id(s: &str) -> zbus::fdo::Result<Uuid> {
    Uuid::parse_str(s.trim()).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid identity id '{s}': {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match &err {
        EngineError::Access(
            OrchestratorError::UnknownIdentity(_) | OrchestratorError::InvalidPlate(_) | OrchestratorError::Registry(_),
        ) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        EngineError::Camera(StreamError::PermissionDenied(_)) => zbus::fdo::Error::AccessDenied(err.to_string()),
        EngineError::ModelUnavailable(_) => zbus::fdo::Error::NotSupported(err.to_string()),
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}

fn transition_json(kind: GateKind, transition: Option<GateTransition>) -> Value {
    match transition {
        Some(t) => json!({ "gate": kind, "changed": true, "from": t.from, "to": t.to }),
        None => json!({ "gate": kind, "changed": false }),
    }
}

fn resident_json(identity: &Identity) -> Value {
    json!({
        "id": identity.id,
        "name": identity.name,
        "apartment": identity.apartment,
        "block": identity.block,
        "phone": identity.phone,
        "email": identity.email,
        "vehicles": identity.vehicles,
        "has_face": identity.descriptor.is_some(),
        "created_at": identity.created_at,
    })
}

fn access_json(access: &Result<AccessOutcome, OrchestratorError>) -> Value {
    match access {
        Ok(AccessOutcome::AwaitingLiveness) => json!({ "status": "awaiting_liveness" }),
        Ok(AccessOutcome::CoolingDown { remaining }) => {
            json!({ "status": "cooling_down", "wait_secs": wait_seconds(*remaining) })
        }
        Ok(AccessOutcome::Registered { record, gate }) => {
            json!({ "status": "registered", "record": record, "gate": gate })
        }
        Err(e) => json!({ "status": "error", "error": e.to_string() }),
    }
}

fn face_json(observation: &FaceObservation) -> Value {
    match observation {
        FaceObservation::Recognized {
            identity_id,
            name,
            distance,
            liveness,
            access,
        } => json!({
            "recognized": true,
            "identity_id": identity_id,
            "name": name,
            "distance": distance,
            "liveness": liveness,
            "access": access_json(access),
        }),
        FaceObservation::Unrecognized { spoofing_suspected } => json!({
            "recognized": false,
            "spoofing_suspected": spoofing_suspected,
        }),
    }
}

fn plate_json(observation: &PlateObservation) -> Value {
    match observation {
        PlateObservation::NoPlate => json!({ "plate": null }),
        PlateObservation::Unauthorized(plate) => json!({
            "plate": plate.as_str(),
            "authorized": false,
        }),
        PlateObservation::Recognized {
            plate,
            identity_id,
            name,
            access,
        } => json!({
            "plate": plate.as_str(),
            "authorized": true,
            "identity_id": identity_id,
            "name": name,
            "access": access_json(access),
        }),
    }
}
