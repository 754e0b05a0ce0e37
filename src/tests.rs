//! Scenario tests: real library and drive threads over the simulated robot

#[cfg(test)]
mod scenarios {
    use crate::catalog::{Catalog, CeStatus, MemoryCatalog, UpdateReason};
    use crate::config::{RobotConfig, Timing};
    use crate::device::{DeviceState, UnitStatus};
    use crate::error::Errno;
    use crate::event::{
        completion_channel, AuditRequest, CleanRequest, Command, Completion, Event,
        LabelRequest, MountRequest, StateChange, UnloadRequest,
    };
    use crate::labels::LabelFlags;
    use crate::library::{Library, LibraryHandle};
    use crate::sim::SimWorld;
    use crossbeam::channel::{unbounded, Receiver};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(20);

    fn fast() -> RobotConfig {
        RobotConfig {
            timing: Timing::fast(),
            ..Default::default()
        }
    }

    fn start(config: RobotConfig) -> (LibraryHandle, Arc<MemoryCatalog>, Arc<SimWorld>) {
        let world = SimWorld::from_config(&config);
        let (lib, catalog) = Library::with_world(config, &world).unwrap();
        let handle = lib.start().unwrap();
        (handle, catalog, world)
    }

    fn submit(lib: &Library, command: Command) -> Receiver<Completion> {
        let (tx, rx) = completion_channel();
        lib.submit(Event::message(command).with_reply(tx));
        rx
    }

    fn finish(rx: &Receiver<Completion>) -> Completion {
        rx.recv_timeout(WAIT).expect("request did not finish")
    }

    fn eventually(what: &str, check: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_mount_slot5_end_to_end() {
        let mut config = fast();
        for item in &mut config.inventory {
            match item.slot {
                1 => item.vsn = "VSN011".into(),
                5 => item.vsn = "VSN001".into(),
                _ => {}
            }
        }
        let (handle, catalog, world) = start(config);
        let lib = handle.library.clone();

        let (tx, rx) = unbounded();
        let entry = lib.add_preview("VSN001", None, false, tx);
        let notice = rx.recv_timeout(WAIT).expect("no preview notice");
        assert_eq!(notice.id, entry.id);
        assert_eq!(notice.errno, Errno::Ok);
        let eq = notice.eq.expect("notice without drive");

        let drive = lib.drive_by_eq(eq).unwrap().clone();
        assert!(world.is_full(drive.element));
        eventually("REQUESTED to clear", || {
            !drive.unit.status().contains(UnitStatus::REQUESTED)
        });
        assert_eq!(drive.unit.lock().vsn, "VSN001");
        let loaded = catalog.history().into_iter().any(|ev| {
            ev.reason == UpdateReason::VolumeLoaded && ev.slot == 5 && ev.vsn == "VSN001"
        });
        assert!(loaded);
        assert_eq!(lib.ctx.previews.count(), 0);
        handle.shutdown();
    }

    #[test]
    fn test_every_request_completes_once() {
        let (handle, _, _) = start(fast());
        let lib = handle.library.clone();
        let (tx, rx) = completion_channel();
        let commands = vec![
            Command::Mount(MountRequest {
                eq: lib.eq,
                vsn: "VSN000".into(),
                ..Default::default()
            }),
            Command::Mount(MountRequest {
                eq: lib.eq,
                vsn: "NOSUCH".into(),
                ..Default::default()
            }),
            Command::Label(LabelRequest {
                eq: lib.eq,
                slot: 4,
                vsn: "NEW004".into(),
                ..Default::default()
            }),
            Command::Label(LabelRequest {
                eq: lib.eq,
                slot: 5,
                flags: LabelFlags::RELABEL,
                ..Default::default()
            }),
            Command::Clean(CleanRequest { eq: 999 }),
            Command::Audit(AuditRequest {
                eq: lib.eq,
                slot: Some(3),
                eod: false,
            }),
            Command::Unload(UnloadRequest { eq: 52 }),
            Command::State(StateChange {
                eq: 52,
                old_state: DeviceState::Off,
                new_state: DeviceState::On,
            }),
        ];
        let mut ids = Vec::new();
        for command in commands {
            let event = Event::message(command).with_reply(tx.clone());
            ids.push(event.id);
            lib.submit(event);
        }

        let mut seen: HashMap<u64, Completion> = HashMap::new();
        while seen.len() < ids.len() {
            let c = rx.recv_timeout(WAIT).expect("missing completion");
            assert!(!c.leaked, "event {} leaked", c.id);
            assert!(seen.insert(c.id, c).is_none(), "event {} completed twice", c.id);
        }
        let errno = |i: usize| seen[&ids[i]].errno;
        assert_eq!(errno(0), Errno::Ok);
        assert_eq!(errno(1), Errno::ENOENT);
        assert_eq!(errno(2), Errno::Ok);
        assert_eq!(errno(3), Errno::EINVAL);
        assert_eq!(errno(4), Errno::ENOENT);
        assert_eq!(errno(5), Errno::Ok);
        assert_eq!(errno(7), Errno::EINVAL);

        handle.shutdown();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_library_audit_claims_each_slot_once() {
        let (handle, catalog, _) = start(fast());
        let lib = handle.library.clone();
        let rx = submit(
            &lib,
            Command::Audit(AuditRequest {
                eq: lib.eq,
                slot: None,
                eod: false,
            }),
        );
        assert_eq!(finish(&rx).errno, Errno::Ok);

        let (countdown, index, auditing) = lib.audit_progress();
        assert_eq!((countdown, index, auditing), (0, lib.storage_count, 0));
        assert!(!lib.flags().audit);
        assert!(lib.flags().mounted);

        let mut per_slot: HashMap<u32, usize> = HashMap::new();
        for ev in catalog.history() {
            if ev.reason == UpdateReason::Audit {
                *per_slot.entry(ev.slot).or_default() += 1;
            }
        }
        for slot in 0..6 {
            assert_eq!(per_slot.get(&slot), Some(&1), "slot {}", slot);
        }
        assert!(!per_slot.contains_key(&9));
        for drive in &lib.drives {
            assert!(!drive.unit.status().contains(UnitStatus::AUDIT));
        }
        handle.shutdown();
    }

    #[test]
    fn test_clean_through_library() {
        let (handle, catalog, _) = start(fast());
        let lib = handle.library.clone();
        let rx = submit(&lib, Command::Clean(CleanRequest { eq: 51 }));
        assert_eq!(finish(&rx).errno, Errno::Ok);
        let cln = catalog.get_by_loc(lib.eq, 9, 0).unwrap();
        assert_eq!(cln.access, 19);
        assert!(cln.has(CeStatus::OCCUPIED));
        assert!(!lib.drive_by_eq(51).unwrap().cleaning_in_progress());
        handle.shutdown();
    }

    #[test]
    fn test_invalid_transition_through_library() {
        let (handle, _, _) = start(fast());
        let lib = handle.library.clone();
        let drive = lib.drive_by_eq(52).unwrap().clone();
        let rx = submit(
            &lib,
            Command::State(StateChange {
                eq: 52,
                old_state: DeviceState::Idle,
                new_state: DeviceState::Off,
            }),
        );
        assert_eq!(finish(&rx).errno, Errno::EINVAL);
        assert_eq!(drive.unit.state(), DeviceState::On);
        assert!(!drive.unit.status().contains(UnitStatus::REQUESTED));
        handle.shutdown();
    }

    #[test]
    fn test_second_request_for_mounted_volume() {
        let (handle, _, _) = start(fast());
        let lib = handle.library.clone();
        let mount = || {
            Command::Mount(MountRequest {
                eq: lib.eq,
                vsn: "VSN002".into(),
                ..Default::default()
            })
        };
        assert_eq!(finish(&submit(&lib, mount())).errno, Errno::Ok);
        let holder = lib.drive_holding(2, 0).expect("nobody holds slot 2");

        let (tx, rx) = unbounded();
        lib.add_preview("VSN002", None, false, tx);
        let notice = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(notice.errno, Errno::Ok);
        assert_eq!(notice.eq, Some(holder.unit.eq));
        handle.shutdown();
    }
}
