//! Deferred work handed to a drive by a filesystem client

use tracing::{debug, info, warn};

use super::{media, Drive};
use crate::device::UnitStatus;
use crate::error::Errno;
use crate::event::{Event, TodoCallback, TodoCommand, TodoRequest};
use crate::library::Library;
use crate::preview::PreviewNotice;

fn notify(event_id: u64, drive: &Drive, req: &TodoRequest, errno: Errno) {
    let Some(waiter) = &req.waiter else {
        debug!("eq {}: todo without a waiter", drive.unit.eq);
        return;
    };
    let notice = PreviewNotice {
        id: event_id,
        errno,
        eq: errno.is_ok().then_some(drive.unit.eq),
    };
    if waiter.send(notice).is_err() {
        debug!("eq {}: todo waiter went away", drive.unit.eq);
    }
}

/// Position the loaded tape for the requester
fn position_media(drive: &Drive, position: u64) -> Errno {
    let _io = drive.unit.io_mutex.lock();
    match drive.io.locate(position) {
        Ok(()) => {
            drive.unit.lock().position = position;
            Errno::Ok
        }
        Err(e) => {
            warn!("eq {}: locate to {} failed: {}", drive.unit.eq, position, e);
            Errno::EIO
        }
    }
}

pub fn todo(lib: &Library, drive: &Drive, event: Event, req: &TodoRequest) {
    let eq = drive.unit.eq;
    match req.sub_cmd {
        TodoCommand::Add => {
            let errno = match req.callback {
                TodoCallback::PositionMedia { position } => position_media(drive, position),
                TodoCallback::NotifyFsLoad | TodoCallback::NotifyTpLoad => {
                    if drive.unit.status().contains(UnitStatus::READY) {
                        Errno::Ok
                    } else {
                        Errno::EIO
                    }
                }
                TodoCallback::None => {
                    warn!("eq {}: todo with no callback", eq);
                    Errno::ENXIO
                }
            };
            notify(event.id, drive, req, errno);
            // 请求者在提交前已增加了 active 计数
            let mut st = drive.unit.lock();
            drive.unit.release(&mut st);
        }
        TodoCommand::Cancel => {
            info!("eq {}: todo cancelled ({:?})", eq, req.callback);
        }
        TodoCommand::Unload => {
            if let Err(e) = media::clear_drive(lib, drive) {
                warn!("eq {}: todo unload failed: {}", eq, e);
            }
        }
    }
    event.dispose(Errno::Ok);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RobotConfig, Timing};
    use crate::drive::release_unit;
    use crate::event::Command;
    use crate::sim::SimWorld;
    use crossbeam::channel::unbounded;
    use std::sync::Arc;

    fn loaded() -> (Arc<Library>, Arc<SimWorld>) {
        let config = RobotConfig {
            timing: Timing::fast(),
            ..Default::default()
        };
        let world = SimWorld::from_config(&config);
        let (lib, _) = Library::with_world(config, &world).unwrap();
        let drive = lib.drives[0].clone();
        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 0, 0).unwrap();
        {
            let mut d = drive.lock();
            media::get_media(&lib, &drive, &mut d, &ce).unwrap();
        }
        crate::drive::scan::scan_a_device(&drive.unit, drive.io.as_ref());
        release_unit(&drive);
        (lib, world)
    }

    fn run(lib: &Library, drive: &Drive, sub_cmd: TodoCommand, callback: TodoCallback) -> Option<PreviewNotice> {
        let (tx, rx) = unbounded();
        let req = TodoRequest {
            eq: drive.unit.eq,
            sub_cmd,
            callback,
            waiter: Some(tx),
        };
        if sub_cmd == TodoCommand::Add {
            drive.unit.lock().inc_active();
        }
        todo(lib, drive, Event::message(Command::Todo(req.clone())), &req);
        rx.try_recv().ok()
    }

    #[test]
    fn test_position_media() {
        let (lib, _) = loaded();
        let drive = lib.drives[0].clone();
        let notice = run(&lib, &drive, TodoCommand::Add, TodoCallback::PositionMedia { position: 2 })
            .unwrap();
        assert_eq!(notice.errno, Errno::Ok);
        assert_eq!(notice.eq, Some(drive.unit.eq));
        let st = drive.unit.lock();
        assert_eq!(st.position, 2);
        assert_eq!(st.active, 0);
    }

    #[test]
    fn test_notify_and_unknown_callback() {
        let (lib, _) = loaded();
        let drive = lib.drives[0].clone();
        let notice = run(&lib, &drive, TodoCommand::Add, TodoCallback::NotifyFsLoad).unwrap();
        assert_eq!(notice.errno, Errno::Ok);
        let notice = run(&lib, &drive, TodoCommand::Add, TodoCallback::None).unwrap();
        assert_eq!(notice.errno, Errno::ENXIO);
        assert!(run(&lib, &drive, TodoCommand::Cancel, TodoCallback::None).is_none());
        assert_eq!(drive.unit.lock().active, 0);
    }

    #[test]
    fn test_unload() {
        let (lib, world) = loaded();
        let drive = lib.drives[0].clone();
        run(&lib, &drive, TodoCommand::Unload, TodoCallback::None);
        assert!(!world.is_full(drive.element));
    }
}
