//! Pending mount requests ("previews")
//!
//! A requester that needs a volume adds a [`PreviewEntry`] and waits on its
//! notice channel. The library claims entries with `try_claim` (the busy
//! bit) and hands them to a drive together with the entry's sequence
//! number; a drive that finds the sequence changed treats its work as stale.

use crossbeam::channel::Sender;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::catalog::MediaType;
use crate::error::Errno;

/// What a waiter receives when its entry is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewNotice {
    pub id: u64,
    pub errno: Errno,
    /// Drive holding the volume on success
    pub eq: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct PreviewState {
    /// Some drive is working on this entry
    pub busy: bool,
    pub sequence: u64,
    /// Requester cancelled
    pub p_error: bool,
    pub robot_equ: Option<u16>,
    pub slot: Option<u32>,
    pub vsn: String,
    pub media: Option<MediaType>,
    pub write: bool,
    pub removed: bool,
}

pub struct PreviewEntry {
    pub id: u64,
    state: Mutex<PreviewState>,
    notify: Sender<PreviewNotice>,
}

impl PreviewEntry {
    pub fn lock(&self) -> MutexGuard<'_, PreviewState> {
        self.state.lock()
    }

    pub fn snapshot(&self) -> PreviewState {
        self.state.lock().clone()
    }

    pub fn wants(&self, vsn: &str) -> bool {
        let st = self.state.lock();
        st.vsn.is_empty() || st.vsn == vsn
    }
}

impl std::fmt::Debug for PreviewEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("PreviewEntry")
            .field("id", &self.id)
            .field("vsn", &st.vsn)
            .field("busy", &st.busy)
            .field("sequence", &st.sequence)
            .finish()
    }
}

#[derive(Default)]
pub struct PreviewTable {
    entries: Mutex<Vec<Arc<PreviewEntry>>>,
    next_id: AtomicU64,
    next_sequence: AtomicU64,
    recheck: AtomicBool,
}

impl PreviewTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(
        &self,
        vsn: &str,
        media: Option<MediaType>,
        write: bool,
        notify: Sender<PreviewNotice>,
    ) -> Arc<PreviewEntry> {
        let entry = Arc::new(PreviewEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            state: Mutex::new(PreviewState {
                sequence: self.sequence(),
                vsn: vsn.to_string(),
                media,
                write,
                ..Default::default()
            }),
            notify,
        });
        debug!("preview {} added for {:?} (write {})", entry.id, vsn, write);
        self.entries.lock().push(entry.clone());
        self.recheck.store(true, Ordering::Release);
        entry
    }

    /// Change what an entry asks for. Work in flight for the old request
    /// sees a new sequence number and backs off; the entry itself is
    /// pending again.
    pub fn replace(&self, id: u64, vsn: &str, media: Option<MediaType>, write: bool) -> Option<u64> {
        let entry = self.get(id)?;
        let mut st = entry.lock();
        if st.removed {
            return None;
        }
        st.vsn = vsn.to_string();
        st.media = media;
        st.write = write;
        st.sequence = self.sequence();
        st.busy = false;
        st.robot_equ = None;
        st.slot = None;
        debug!("preview {} replaced, sequence {}", id, st.sequence);
        self.recheck.store(true, Ordering::Release);
        Some(st.sequence)
    }

    pub fn get(&self, id: u64) -> Option<Arc<PreviewEntry>> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    pub fn find_by_vsn(&self, vsn: &str) -> Option<Arc<PreviewEntry>> {
        self.entries
            .lock()
            .iter()
            .find(|e| {
                let st = e.lock();
                !st.removed && st.vsn == vsn
            })
            .cloned()
    }

    /// Entries nobody is working on and nobody cancelled
    pub fn pending(&self) -> Vec<Arc<PreviewEntry>> {
        let entries: Vec<_> = self.entries.lock().clone();
        entries
            .into_iter()
            .filter(|e| {
                let st = e.lock();
                !st.busy && !st.p_error && !st.removed
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Set the busy bit. Returns the sequence number to hand to the drive,
    /// or `None` if another thread got there first.
    pub fn try_claim(&self, entry: &PreviewEntry) -> Option<u64> {
        let mut st = entry.lock();
        if st.busy || st.removed || st.p_error {
            return None;
        }
        st.busy = true;
        Some(st.sequence)
    }

    pub fn clear_busy(&self, entry: &PreviewEntry) {
        entry.lock().busy = false;
    }

    /// Mark an entry cancelled; a drive working on it notifies `ECANCELED`
    pub fn cancel(&self, id: u64) -> bool {
        match self.get(id) {
            Some(entry) => {
                entry.lock().p_error = true;
                info!("preview {} cancelled", id);
                true
            }
            None => false,
        }
    }

    /// Resolve an entry: notify its waiter and drop it from the table.
    /// Only the first call for an entry notifies.
    pub fn remove_preview_ent(&self, entry: &PreviewEntry, eq: Option<u16>, errno: Errno) -> bool {
        {
            let mut st = entry.lock();
            if st.removed {
                debug!("preview {} already removed", entry.id);
                return false;
            }
            st.removed = true;
            st.busy = false;
        }
        let _ = entry.notify.send(PreviewNotice {
            id: entry.id,
            errno,
            eq,
        });
        self.entries.lock().retain(|e| e.id != entry.id);
        debug!("preview {} removed: {}", entry.id, errno);
        true
    }

    /// Ask the library to look at the table again if anyone wants `vsn`
    pub fn check_preview(&self, vsn: &str) -> bool {
        let wanted = self.pending().iter().any(|e| e.wants(vsn));
        if wanted {
            self.recheck.store(true, Ordering::Release);
        }
        wanted
    }

    pub fn request_recheck(&self) {
        self.recheck.store(true, Ordering::Release);
    }

    pub fn take_recheck(&self) -> bool {
        self.recheck.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::thread;

    #[test]
    fn test_claim_is_exclusive() {
        let table = Arc::new(PreviewTable::new());
        let (tx, _rx) = unbounded();
        let entry = table.add("VSN001", None, false, tx);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let entry = entry.clone();
                thread::spawn(move || table.try_claim(&entry).is_some())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(table.pending().is_empty());

        table.clear_busy(&entry);
        assert_eq!(table.pending().len(), 1);
    }

    #[test]
    fn test_remove_notifies_once() {
        let table = PreviewTable::new();
        let (tx, rx) = unbounded();
        let entry = table.add("VSN001", None, true, tx);
        assert!(table.remove_preview_ent(&entry, Some(10), Errno::Ok));
        assert!(!table.remove_preview_ent(&entry, Some(10), Errno::EIO));
        assert_eq!(
            rx.try_recv().unwrap(),
            PreviewNotice { id: entry.id, errno: Errno::Ok, eq: Some(10) }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_replace_bumps_sequence() {
        let table = PreviewTable::new();
        let (tx, _rx) = unbounded();
        let entry = table.add("VSN001", None, false, tx);
        let seq = table.try_claim(&entry).unwrap();
        let new_seq = table.replace(entry.id, "VSN002", None, false).unwrap();
        assert!(new_seq > seq);
        let snap = entry.snapshot();
        assert_eq!(snap.vsn, "VSN002");
        assert!(!snap.busy);
        assert_eq!(table.pending().len(), 1);
        assert!(table.take_recheck());
    }

    #[test]
    fn test_cancel_blocks_claim() {
        let table = PreviewTable::new();
        let (tx, _rx) = unbounded();
        let entry = table.add("VSN001", None, false, tx);
        assert!(table.cancel(entry.id));
        assert!(table.try_claim(&entry).is_none());
        assert!(!table.cancel(9999));
    }

    #[test]
    fn test_check_preview_sets_recheck() {
        let table = PreviewTable::new();
        let (tx, _rx) = unbounded();
        table.add("VSN001", None, false, tx);
        table.take_recheck();
        assert!(!table.check_preview("OTHER"));
        assert!(!table.take_recheck());
        assert!(table.check_preview("VSN001"));
        assert!(table.take_recheck());
    }
}
