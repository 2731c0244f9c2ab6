use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use uuid::Uuid;

use crate::plate::PlateCode;
use crate::types::{FeatureVector, Identity, Vehicle};

/// Descriptor dimensionality of the 68-landmark ResNet recognition net.
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("descriptor has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("plate {0} is already registered")]
    DuplicatePlate(PlateCode),
    #[error("identity {0} is already enrolled")]
    DuplicateIdentity(Uuid),
    #[error("unknown identity: {0}")]
    UnknownIdentity(Uuid),
}

/// Enrolled residents, indexed by id and by plate.
#[derive(Debug, Clone)]
pub struct DescriptorRegistry {
    dimension: usize,
    identities: Vec<Identity>,
    by_id: HashMap<Uuid, usize>,
    by_plate: HashMap<PlateCode, (usize, usize)>,
}

impl DescriptorRegistry {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            identities: Vec::new(),
            by_id: HashMap::new(),
            by_plate: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Replace the whole registry with a fresh load from the store.
    ///
    /// Stored descriptors of the wrong size are dropped with a warning rather
    /// than rejecting the identity, so the resident can still pass by plate.
    pub fn replace_all(&mut self, identities: Vec<Identity>) {
        self.identities.clear();
        self.by_id.clear();
        self.by_plate.clear();

        for mut identity in identities {
            if let Some(actual) = identity.descriptor.as_ref().map(FeatureVector::len) {
                if actual != self.dimension {
                    tracing::warn!(
                        identity = %identity.id,
                        expected = self.dimension,
                        actual,
                        "dropping stored descriptor with wrong dimensionality"
                    );
                    identity.descriptor = None;
                }
            }
            if self.by_id.contains_key(&identity.id) {
                tracing::warn!(identity = %identity.id, "duplicate identity in store; keeping first");
                continue;
            }
            self.push(identity);
        }
    }

    /// Enroll a new identity after validating it.
    pub fn insert(&mut self, identity: Identity) -> Result<(), RegistryError> {
        self.validate(&identity)?;
        self.push(identity);
        Ok(())
    }

    /// Check an identity for enrollment without inserting it.
    pub fn validate(&self, identity: &Identity) -> Result<(), RegistryError> {
        if self.by_id.contains_key(&identity.id) {
            return Err(RegistryError::DuplicateIdentity(identity.id));
        }
        if let Some(descriptor) = &identity.descriptor {
            self.check_dimension(descriptor)?;
        }
        let mut seen = BTreeSet::new();
        for vehicle in &identity.vehicles {
            if self.by_plate.contains_key(&vehicle.plate) || !seen.insert(&vehicle.plate) {
                return Err(RegistryError::DuplicatePlate(vehicle.plate.clone()));
            }
        }
        Ok(())
    }

    pub fn check_dimension(&self, descriptor: &FeatureVector) -> Result<(), RegistryError> {
        if descriptor.len() != self.dimension {
            return Err(RegistryError::DimensionMismatch {
                expected: self.dimension,
                actual: descriptor.len(),
            });
        }
        Ok(())
    }

    /// Re-enrollment: replace an identity's descriptor whole.
    pub fn set_descriptor(&mut self, id: Uuid, descriptor: FeatureVector) -> Result<(), RegistryError> {
        self.check_dimension(&descriptor)?;
        let idx = *self.by_id.get(&id).ok_or(RegistryError::UnknownIdentity(id))?;
        self.identities[idx].descriptor = Some(descriptor);
        Ok(())
    }

    /// Replace an identity's personal data and descriptor in place. Id,
    /// vehicles and enrollment time are kept, so both indexes stay valid.
    pub fn update_details(&mut self, edited: Identity) -> Result<(), RegistryError> {
        if let Some(descriptor) = &edited.descriptor {
            self.check_dimension(descriptor)?;
        }
        let idx = *self
            .by_id
            .get(&edited.id)
            .ok_or(RegistryError::UnknownIdentity(edited.id))?;
        let stored = &mut self.identities[idx];
        stored.name = edited.name;
        stored.apartment = edited.apartment;
        stored.block = edited.block;
        stored.phone = edited.phone;
        stored.email = edited.email;
        stored.descriptor = edited.descriptor;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<&Identity> {
        self.by_id.get(&id).map(|&idx| &self.identities[idx])
    }

    /// All identities, in load order (the order the matcher scans).
    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn find_vehicle(&self, plate: &PlateCode) -> Option<(&Identity, &Vehicle)> {
        self.by_plate.get(plate).map(|&(owner, vehicle)| {
            let identity = &self.identities[owner];
            (identity, &identity.vehicles[vehicle])
        })
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Number of identities with a usable descriptor.
    pub fn enrolled_faces(&self) -> usize {
        self.identities.iter().filter(|i| i.descriptor.is_some()).count()
    }

    /// Case-insensitive substring search over name, apartment and email,
    /// optionally restricted to one block. Results are sorted by name.
    pub fn search(&self, term: &str, block: Option<&str>) -> Vec<&Identity> {
        let needle = term.trim().to_lowercase();
        let mut hits: Vec<&Identity> = self
            .identities
            .iter()
            .filter(|i| block.map_or(true, |b| i.block == b))
            .filter(|i| {
                needle.is_empty()
                    || i.name.to_lowercase().contains(&needle)
                    || i.apartment.to_lowercase().contains(&needle)
                    || i.email.as_deref().is_some_and(|e| e.to_lowercase().contains(&needle))
            })
            .collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name));
        hits
    }

    /// Distinct block labels, sorted.
    pub fn blocks(&self) -> Vec<&str> {
        let set: BTreeSet<&str> = self.identities.iter().map(|i| i.block.as_str()).collect();
        set.into_iter().collect()
    }

    fn push(&mut self, identity: Identity) {
        let idx = self.identities.len();
        self.by_id.insert(identity.id, idx);
        for (v_idx, vehicle) in identity.vehicles.iter().enumerate() {
            self.by_plate.entry(vehicle.plate.clone()).or_insert((idx, v_idx));
        }
        self.identities.push(identity);
    }
}

impl Default for DescriptorRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DESCRIPTOR_DIM)
    }
}
