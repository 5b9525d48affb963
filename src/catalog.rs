use std::io;
use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::FacilityId;

/// What the ledger needs to know about facilities, and nothing more.
pub trait FacilityCatalog: Send + Sync {
    fn exists(&self, id: &FacilityId) -> bool;
    fn is_active(&self, id: &FacilityId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacilityKind {
    Lab,
    Hall,
    Sports,
}

impl FacilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FacilityKind::Lab => "lab",
            FacilityKind::Hall => "hall",
            FacilityKind::Sports => "sports",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityInfo {
    pub id: FacilityId,
    pub name: String,
    pub kind: FacilityKind,
    pub capacity: u32,
    /// Inactive facilities keep their history but take no new requests.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// In-memory catalog, seeded from a JSON array of [`FacilityInfo`].
#[derive(Default)]
pub struct FacilityRegistry {
    facilities: DashMap<FacilityId, FacilityInfo>,
}

impl FacilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_facilities(list: Vec<FacilityInfo>) -> io::Result<Self> {
        if list.len() > MAX_FACILITIES_PER_CAMPUS {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "too many facilities"));
        }
        let registry = Self::new();
        for info in list {
            if info.name.len() > MAX_FACILITY_NAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("facility {}: name too long", info.id),
                ));
            }
            if registry.facilities.insert(info.id, info.clone()).is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("duplicate facility id {}", info.id),
                ));
            }
        }
        Ok(registry)
    }

    /// Load from `path`. A missing file is an empty catalog.
    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        let list: Vec<FacilityInfo> = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Self::from_facilities(list)
    }

    pub fn get(&self, id: &FacilityId) -> Option<FacilityInfo> {
        self.facilities.get(id).map(|e| e.value().clone())
    }

    /// Sorted by name, like the catalog pages list them.
    pub fn list(&self) -> Vec<FacilityInfo> {
        let mut all: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.facilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facilities.is_empty()
    }
}

impl FacilityCatalog for FacilityRegistry {
    fn exists(&self, id: &Ulid) -> bool {
        self.facilities.contains_key(id)
    }

    fn is_active(&self, id: &Ulid) -> bool {
        self.facilities.get(id).is_some_and(|f| f.active)
    }
}
