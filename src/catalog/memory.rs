use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use super::{Catalog, CatalogEntry, CatalogField, CeStatus, MediaType, UpdateReason, VolumeInfo};
use crate::error::{Result, RobotError};

type Key = (u16, u32, u8);

/// One `update` call as seen by the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEvent {
    pub reason: UpdateReason,
    pub slot: u32,
    pub partition: u8,
    pub vsn: String,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Key, CatalogEntry>,
    pending_labels: HashMap<Key, String>,
    history: Vec<CatalogEvent>,
    exports: Vec<(u16, u32)>,
}

/// In-process catalog used by the simulator and the tests
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: CatalogEntry) {
        let key = (entry.eq, entry.slot, entry.partition);
        self.inner.lock().entries.insert(key, entry);
    }

    /// Every `update` in call order
    pub fn history(&self) -> Vec<CatalogEvent> {
        self.inner.lock().history.clone()
    }

    pub fn exports(&self) -> Vec<(u16, u32)> {
        self.inner.lock().exports.clone()
    }

    pub fn pending_label(&self, eq: u16, slot: u32, partition: u8) -> Option<String> {
        self.inner
            .lock()
            .pending_labels
            .get(&(eq, slot, partition))
            .cloned()
    }

    fn with_entry<F>(&self, key: Key, f: F) -> Result<()>
    where
        F: FnOnce(&mut CatalogEntry),
    {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&key) {
            Some(entry) => {
                f(entry);
                Ok(())
            }
            None => Err(RobotError::catalog(format!(
                "no entry for eq {} slot {} partition {}",
                key.0, key.1, key.2
            ))),
        }
    }
}

impl Catalog for MemoryCatalog {
    fn get_by_loc(&self, eq: u16, slot: u32, partition: u8) -> Option<CatalogEntry> {
        self.inner.lock().entries.get(&(eq, slot, partition)).cloned()
    }

    fn get_by_media(&self, media: MediaType, vsn: &str) -> Option<CatalogEntry> {
        self.inner
            .lock()
            .entries
            .values()
            .find(|ce| ce.media == media && ce.vsn == vsn && ce.has(CeStatus::INUSE))
            .cloned()
    }

    fn set_status(
        &self,
        eq: u16,
        slot: u32,
        partition: u8,
        bits: CeStatus,
        on: bool,
    ) -> Result<()> {
        debug!(
            "catalog: eq {} slot {}:{} {} {:?}",
            eq,
            slot,
            partition,
            if on { "set" } else { "clear" },
            bits
        );
        self.with_entry((eq, slot, partition), |ce| ce.status.set(bits, on))
    }

    fn set_field(&self, eq: u16, slot: u32, partition: u8, field: CatalogField) -> Result<()> {
        self.with_entry((eq, slot, partition), |ce| match field {
            CatalogField::Access(v) => ce.access = v,
            CatalogField::MountTime(v) => ce.mount_time = v,
            CatalogField::Vsn(v) => ce.vsn = v,
            CatalogField::Space(v) => ce.space = v,
            CatalogField::Capacity(v) => ce.capacity = v,
            CatalogField::LabelTime(v) => ce.label_time = v,
            CatalogField::Media(v) => ce.media = v,
            CatalogField::LastPos(v) => ce.last_pos = v,
        })
    }

    fn label_volume(
        &self,
        eq: u16,
        slot: u32,
        partition: u8,
        media: MediaType,
        vsn: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (eq, slot, partition);
        let taken = inner
            .entries
            .iter()
            .any(|(k, ce)| *k != key && ce.media == media && ce.vsn == vsn && ce.has(CeStatus::INUSE));
        let reserved = inner
            .pending_labels
            .iter()
            .any(|(k, v)| *k != key && v == vsn);
        if taken || reserved {
            return Err(RobotError::catalog(format!(
                "VSN {} already in catalog",
                vsn
            )));
        }
        if !inner.entries.contains_key(&key) {
            return Err(RobotError::catalog(format!(
                "no entry for eq {} slot {} partition {}",
                eq, slot, partition
            )));
        }
        inner.pending_labels.insert(key, vsn.to_string());
        Ok(())
    }

    fn label_failed(&self, eq: u16, slot: u32, partition: u8, vsn: &str) {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.pending_labels.remove(&(eq, slot, partition)) {
            debug!("catalog: dropped label placeholder {} (requested {})", pending, vsn);
        }
    }

    fn update(&self, info: &VolumeInfo, reason: UpdateReason) -> Result<()> {
        let key = (info.eq, info.slot, info.partition);
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&key).ok_or_else(|| {
            RobotError::catalog(format!(
                "no entry for eq {} slot {} partition {}",
                info.eq, info.slot, info.partition
            ))
        })?;

        match reason {
            UpdateReason::VolumeLoaded | UpdateReason::Audit => {
                if info.labeled {
                    entry.vsn = info.vsn.clone();
                    entry.status |= CeStatus::LABELED;
                    entry.label_time = info.label_time;
                } else {
                    entry.status.remove(CeStatus::LABELED);
                }
                if let Some(media) = info.media {
                    entry.media = media;
                }
                entry.space = info.space;
                entry.capacity = info.capacity;
                entry.status.set(CeStatus::READ_ONLY, info.read_only);
                entry.status.set(CeStatus::WRITE_PROTECT, info.write_protect);
                if info.bad_media {
                    entry.status |= CeStatus::BAD_MEDIA;
                }
                if reason == UpdateReason::Audit {
                    entry.status.remove(CeStatus::NEEDS_AUDIT);
                } else {
                    entry.mount_time = Utc::now().timestamp();
                }
            }
            UpdateReason::LabelComplete => {
                entry.vsn = info.vsn.clone();
                entry.status |= CeStatus::LABELED | CeStatus::INUSE;
                entry.status.remove(CeStatus::BAD_MEDIA);
                entry.label_time = info.label_time;
                entry.space = info.space;
                entry.capacity = info.capacity;
            }
            UpdateReason::VolumeUnloaded => {
                entry.space = info.space;
                entry.last_pos = info.position;
            }
        }

        inner.pending_labels.remove(&key);
        inner.history.push(CatalogEvent {
            reason,
            slot: info.slot,
            partition: info.partition,
            vsn: info.vsn.clone(),
        });
        Ok(())
    }

    fn get_cleaning_volume(&self, eq: u16) -> Option<CatalogEntry> {
        self.inner
            .lock()
            .entries
            .values()
            .find(|ce| {
                ce.eq == eq
                    && ce.has(CeStatus::CLEANING)
                    && ce.has(CeStatus::OCCUPIED)
                    && !ce.has(CeStatus::BAD_MEDIA | CeStatus::EXPORT)
                    && ce.access > 0
            })
            .cloned()
    }

    fn schedule_export(&self, eq: u16, slot: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut found = false;
        for (key, ce) in inner.entries.iter_mut() {
            if key.0 == eq && key.1 == slot {
                ce.status |= CeStatus::EXPORT;
                found = true;
            }
        }
        if !found {
            return Err(RobotError::catalog(format!("no slot {} in eq {}", slot, eq)));
        }
        inner.exports.push((eq, slot));
        Ok(())
    }

    fn entries(&self, eq: u16) -> Vec<CatalogEntry> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|ce| ce.eq == eq)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(slot: u32, vsn: &str) -> CatalogEntry {
        CatalogEntry {
            eq: 50,
            slot,
            vsn: vsn.to_string(),
            status: CeStatus::INUSE | CeStatus::OCCUPIED | CeStatus::LABELED,
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_by_loc_and_media() {
        let cat = MemoryCatalog::new();
        cat.insert(entry(5, "VSN001"));
        assert_eq!(cat.get_by_loc(50, 5, 0).unwrap().vsn, "VSN001");
        assert_eq!(cat.get_by_media(MediaType::Lto, "VSN001").unwrap().slot, 5);
        assert!(cat.get_by_media(MediaType::Dlt, "VSN001").is_none());
        assert!(cat.get_by_loc(50, 6, 0).is_none());
    }

    #[test]
    fn test_label_volume_rejects_duplicate() {
        let cat = MemoryCatalog::new();
        cat.insert(entry(1, "TAKEN"));
        cat.insert(entry(2, ""));
        assert!(cat.label_volume(50, 2, 0, MediaType::Lto, "TAKEN").is_err());
        cat.label_volume(50, 2, 0, MediaType::Lto, "NEW001").unwrap();
        assert_eq!(cat.pending_label(50, 2, 0).as_deref(), Some("NEW001"));
        cat.label_failed(50, 2, 0, "NEW001");
        assert!(cat.pending_label(50, 2, 0).is_none());
    }

    #[test]
    fn test_cleaning_volume_needs_uses_left() {
        let cat = MemoryCatalog::new();
        let mut cln = entry(9, "CLN001");
        cln.status |= CeStatus::CLEANING;
        cln.access = 0;
        cat.insert(cln.clone());
        assert!(cat.get_cleaning_volume(50).is_none());
        cln.access = 3;
        cat.insert(cln);
        assert_eq!(cat.get_cleaning_volume(50).unwrap().slot, 9);
    }

    #[test]
    fn test_audit_update_clears_needs_audit() {
        let cat = MemoryCatalog::new();
        let mut ce = entry(3, "");
        ce.status |= CeStatus::NEEDS_AUDIT;
        cat.insert(ce);
        let info = VolumeInfo {
            eq: 50,
            slot: 3,
            vsn: "AUD003".into(),
            labeled: true,
            capacity: 1000,
            space: 900,
            ..Default::default()
        };
        cat.update(&info, UpdateReason::Audit).unwrap();
        let ce = cat.get_by_loc(50, 3, 0).unwrap();
        assert_eq!(ce.vsn, "AUD003");
        assert!(!ce.has(CeStatus::NEEDS_AUDIT));
        assert_eq!(cat.history().len(), 1);
    }

    #[test]
    fn test_schedule_export_marks_slot() {
        let cat = MemoryCatalog::new();
        cat.insert(entry(4, "CLN004"));
        cat.schedule_export(50, 4).unwrap();
        assert!(cat.get_by_loc(50, 4, 0).unwrap().has(CeStatus::EXPORT));
        assert_eq!(cat.exports(), vec![(50, 4)]);
        assert!(cat.schedule_export(50, 99).is_err());
    }
}
