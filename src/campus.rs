use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::audit::AuditHub;
use crate::catalog::FacilityRegistry;
use crate::engine::Ledger;
use crate::limits::*;
use crate::maintenance;

/// Everything one campus owns: its ledger, facility catalog and audit stream.
pub struct Campus {
    pub name: String,
    pub ledger: Arc<Ledger>,
    pub facilities: Arc<FacilityRegistry>,
    pub audit: Arc<AuditHub>,
}

/// Manages per-campus ledgers. Campus = database name from the pgwire
/// connection. Each campus gets its own WAL, catalog file and maintenance tasks.
pub struct CampusManager {
    campuses: DashMap<String, Arc<Campus>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl CampusManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            campuses: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the campus. Must be called inside a tokio runtime.
    /// Names that sanitize to the same file name are the same campus.
    pub fn get_or_create(&self, campus: &str) -> io::Result<Arc<Campus>> {
        if campus.len() > MAX_CAMPUS_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "campus name too long"));
        }
        // Names become file names.
        let safe_name: String = campus
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty campus name"));
        }
        if let Some(existing) = self.campuses.get(&safe_name) {
            return Ok(existing.value().clone());
        }
        if self.campuses.len() >= MAX_CAMPUSES {
            return Err(io::Error::other("too many campuses"));
        }

        // Two connections may race here; the entry API keeps exactly one.
        let slot = match self.campuses.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => slot,
        };

        let facilities = Arc::new(FacilityRegistry::load(
            &self.data_dir.join(format!("{safe_name}.facilities.json")),
        )?);
        let audit = Arc::new(AuditHub::new());
        let ledger = Arc::new(Ledger::new(
            self.data_dir.join(format!("{safe_name}.wal")),
            facilities.clone(),
            audit.clone(),
        )?);
        tracing::info!(
            campus = safe_name.as_str(),
            facilities = facilities.len(),
            "campus opened"
        );

        tokio::spawn(maintenance::run_reaper(ledger.clone()));
        tokio::spawn(maintenance::run_compactor(ledger.clone(), self.compact_threshold));

        let opened = Arc::new(Campus {
            name: safe_name,
            ledger,
            facilities,
            audit,
        });
        slot.insert(opened.clone());
        metrics::gauge!(crate::observability::CAMPUSES_ACTIVE).set(self.campuses.len() as f64);
        Ok(opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FacilityInfo, FacilityKind};
    use crate::identity::Principal;
    use chrono::{Duration, NaiveTime};
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("campusd_test_campus").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_catalog(dir: &std::path::Path, campus: &str, ids: &[Ulid]) {
        let list: Vec<FacilityInfo> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| FacilityInfo {
                id: *id,
                name: format!("Room {i}"),
                kind: FacilityKind::Hall,
                capacity: 40,
                active: true,
            })
            .collect();
        fs::write(
            dir.join(format!("{campus}.facilities.json")),
            serde_json::to_string(&list).unwrap(),
        )
        .unwrap();
    }

    fn next_week() -> crate::model::Slot {
        let date = chrono::Local::now().date_naive() + Duration::days(7);
        crate::model::Slot::new(
            date,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn campus_isolation() {
        let dir = test_data_dir("isolation");
        let room = Ulid::new();
        write_catalog(&dir, "north", &[room]);
        write_catalog(&dir, "south", &[room]);
        let cm = CampusManager::new(dir, 1000);

        let north = cm.get_or_create("north").unwrap();
        let south = cm.get_or_create("south").unwrap();
        let who = Principal::student("ines");

        let first = north.ledger.request_booking(&who, Ulid::new(), room, next_week()).await.unwrap();
        assert!(first.is_confirmed());
        // Same room id, same slot, other campus: no conflict.
        let other = south.ledger.request_booking(&who, Ulid::new(), room, next_week()).await.unwrap();
        assert!(other.is_confirmed());
    }

    #[tokio::test]
    async fn campus_catalog_loaded_from_data_dir() {
        let dir = test_data_dir("catalog");
        let rooms = [Ulid::new(), Ulid::new()];
        write_catalog(&dir, "main", &rooms);
        let cm = CampusManager::new(dir, 1000);

        let campus = cm.get_or_create("main").unwrap();
        assert_eq!(campus.facilities.len(), 2);

        // No catalog file: empty catalog, every facility unknown.
        let bare = cm.get_or_create("bare").unwrap();
        assert!(bare.facilities.is_empty());
        let r = bare
            .ledger
            .request_booking(&Principal::student("ines"), Ulid::new(), rooms[0], next_week())
            .await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn campus_broken_catalog_is_an_error() {
        let dir = test_data_dir("broken_catalog");
        fs::write(dir.join("main.facilities.json"), "{ not json").unwrap();
        let cm = CampusManager::new(dir, 1000);
        assert!(cm.get_or_create("main").is_err());
    }

    #[tokio::test]
    async fn campus_lazy_creation() {
        let dir = test_data_dir("lazy");
        let cm = CampusManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _campus = cm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn campus_same_instance_returned() {
        let dir = test_data_dir("same");
        let cm = CampusManager::new(dir, 1000);

        let a = cm.get_or_create("foo").unwrap();
        let b = cm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn campus_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let cm = CampusManager::new(dir.clone(), 1000);

        let campus = cm.get_or_create("../evil").unwrap();
        assert_eq!(campus.name, "evil");
        assert!(dir.join("evil.wal").exists());

        assert!(cm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn campus_names_sharing_a_file_share_a_ledger() {
        let dir = test_data_dir("shared_file");
        let room = Ulid::new();
        write_catalog(&dir, "north", &[room]);
        let cm = CampusManager::new(dir, 1000);

        let plain = cm.get_or_create("north").unwrap();
        let dotted = cm.get_or_create("no.rth").unwrap();
        let escaped = cm.get_or_create("../north").unwrap();
        assert!(Arc::ptr_eq(&plain, &dotted));
        assert!(Arc::ptr_eq(&plain, &escaped));

        let (ana, ben) = (Principal::student("ana"), Principal::student("ben"));
        let first = plain.ledger.request_booking(&ana, Ulid::new(), room, next_week()).await.unwrap();
        let second = dotted.ledger.request_booking(&ben, Ulid::new(), room, next_week()).await.unwrap();
        assert!(first.is_confirmed());
        assert!(!second.is_confirmed());
    }

    #[tokio::test]
    async fn campus_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let cm = CampusManager::new(dir, 1000);

        let err = cm
            .get_or_create(&"x".repeat(MAX_CAMPUS_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("campus name too long"));
    }

    #[tokio::test]
    async fn campus_count_limit() {
        let dir = test_data_dir("count_limit");
        let cm = CampusManager::new(dir, 1000);

        for i in 0..MAX_CAMPUSES {
            cm.get_or_create(&format!("c{i}")).unwrap();
        }
        let err = cm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many campuses"));
    }
}
