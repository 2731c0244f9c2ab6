//! Persistence contract consumed by the orchestrator.

use chrono::{DateTime, Duration, Months, TimeZone, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{AccessRecord, Direction, FeatureVector, Identity};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// One page of the ledger, newest first.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RecordPage {
    pub records: Vec<AccessRecord>,
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl RecordPage {
    pub fn total_pages(&self) -> usize {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size)
    }
}

/// Ledger query restrictions. The default filter matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub direction: Option<Direction>,
    /// Only entries created at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn matches(&self, record: &AccessRecord) -> bool {
        self.direction.map_or(true, |d| record.direction == d)
            && self.since.map_or(true, |since| record.created_at >= since)
    }
}

/// Relative date windows offered by the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordWindow {
    /// Since local midnight.
    Today,
    /// The last 7 days.
    Week,
    /// The last calendar month.
    Month,
}

impl RecordWindow {
    pub fn parse(s: &str) -> Option<RecordWindow> {
        match s.trim().to_ascii_lowercase().as_str() {
            "today" => Some(RecordWindow::Today),
            "week" => Some(RecordWindow::Week),
            "month" => Some(RecordWindow::Month),
            _ => None,
        }
    }

    /// Start of the window ending at `now`, in `now`'s time zone.
    pub fn since<Tz: TimeZone>(&self, now: DateTime<Tz>) -> DateTime<Utc> {
        let start = match self {
            RecordWindow::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .and_then(|midnight| midnight.and_local_timezone(now.timezone()).earliest()),
            RecordWindow::Week => now.clone().checked_sub_signed(Duration::days(7)),
            RecordWindow::Month => now.clone().checked_sub_months(Months::new(1)),
        };
        start.map_or_else(|| now.with_timezone(&Utc), |s| s.with_timezone(&Utc))
    }
}

/// Storage of residents and the access ledger.
///
/// Any call may fail transiently; callers treat failures as retryable on the
/// next detection tick.
pub trait AccessStore {
    fn find_identities(&self) -> Result<Vec<Identity>, StoreError>;

    /// Most recent ledger entry for `identity_id`.
    fn find_last_record(&self, identity_id: Uuid) -> Result<Option<AccessRecord>, StoreError>;

    /// Append a ledger entry.
    fn insert_record(&mut self, record: &AccessRecord) -> Result<(), StoreError>;

    /// 1-based page of the ledger entries matching `filter`, newest first.
    /// `total` counts the matching entries.
    fn list_records(&self, filter: &RecordFilter, page: usize, page_size: usize) -> Result<RecordPage, StoreError>;

    /// Persist a newly enrolled identity with its vehicles.
    fn save_identity(&mut self, identity: &Identity) -> Result<(), StoreError>;

    /// Replace an identity's descriptor.
    fn set_descriptor(&mut self, identity_id: Uuid, descriptor: &FeatureVector) -> Result<(), StoreError>;

    /// Overwrite an identity's personal data and descriptor. Vehicles are
    /// left as they are.
    fn update_identity(&mut self, identity: &Identity) -> Result<(), StoreError>;
}

/// Clamp a requested page to `>= 1` and return its starting offset.
/// The offset saturates instead of wrapping.
pub fn page_offset(page: usize, page_size: usize) -> (usize, usize) {
    let page = page.max(1);
    (page, (page - 1).saturating_mul(page_size))
}

/// Volatile store backed by vectors.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    identities: Vec<Identity>,
    records: Vec<AccessRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: Vec<Identity>) -> Self {
        Self {
            identities,
            records: Vec::new(),
        }
    }

    /// Ledger in insertion order.
    pub fn records(&self) -> &[AccessRecord] {
        &self.records
    }
}

impl AccessStore for MemoryStore {
    fn find_identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.identities.clone())
    }

    fn find_last_record(&self, identity_id: Uuid) -> Result<Option<AccessRecord>, StoreError> {
        // Later inserts win ties on timestamp.
        Ok(self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.identity_id == identity_id)
            .max_by_key(|(idx, r)| (r.created_at, *idx))
            .map(|(_, r)| r.clone()))
    }

    fn insert_record(&mut self, record: &AccessRecord) -> Result<(), StoreError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn list_records(&self, filter: &RecordFilter, page: usize, page_size: usize) -> Result<RecordPage, StoreError> {
        let (page, offset) = page_offset(page, page_size);
        let mut ordered: Vec<(usize, &AccessRecord)> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| filter.matches(r))
            .collect();
        ordered.sort_by(|(ia, a), (ib, b)| (b.created_at, ib).cmp(&(a.created_at, ia)));
        let total = ordered.len();
        Ok(RecordPage {
            records: ordered
                .into_iter()
                .skip(offset)
                .take(page_size)
                .map(|(_, r)| r.clone())
                .collect(),
            page,
            page_size,
            total,
        })
    }

    fn save_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
        self.identities.push(identity.clone());
        Ok(())
    }

    fn set_descriptor(&mut self, identity_id: Uuid, descriptor: &FeatureVector) -> Result<(), StoreError> {
        let identity = self
            .identities
            .iter_mut()
            .find(|i| i.id == identity_id)
            .ok_or_else(|| StoreError::NotFound(identity_id.to_string()))?;
        identity.descriptor = Some(descriptor.clone());
        Ok(())
    }

    fn update_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
        let stored = self
            .identities
            .iter_mut()
            .find(|i| i.id == identity.id)
            .ok_or_else(|| StoreError::NotFound(identity.id.to_string()))?;
        let vehicles = std::mem::take(&mut stored.vehicles);
        *stored = Identity {
            vehicles,
            ..identity.clone()
        };
        Ok(())
    }
}
