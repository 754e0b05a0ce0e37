//! Run Command Handler
//!
//! Starts the library over the simulated robot described by the
//! configuration, submits a JSON request script and reports how each
//! request finished.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::catalog::MediaType;
use crate::config::RobotConfig;
use crate::device::DeviceState;
use crate::error::{Errno, Result, RobotError};
use crate::event::{
    completion_channel, AuditRequest, CleanRequest, Command, Completion, Event, LabelRequest,
    MountFlags, MountRequest, StateChange, UnloadRequest,
};
use crate::labels::LabelFlags;
use crate::library::Library;
use crate::preview::PreviewNotice;
use crate::sim::SimWorld;

/// One line of a request script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    Mount {
        #[serde(default)]
        vsn: String,
        #[serde(default)]
        slot: Option<u32>,
        #[serde(default)]
        media: Option<MediaType>,
        #[serde(default)]
        write: bool,
    },
    /// Filesystem-style request: wait for the volume through the preview table
    Request {
        vsn: String,
        #[serde(default)]
        write: bool,
    },
    Label {
        slot: u32,
        #[serde(default)]
        vsn: String,
        #[serde(default)]
        media: MediaType,
        #[serde(default)]
        relabel: bool,
        #[serde(default)]
        barcode: bool,
        #[serde(default)]
        erase: bool,
    },
    Clean {
        eq: u16,
    },
    Audit {
        #[serde(default)]
        slot: Option<u32>,
        #[serde(default)]
        eod: bool,
    },
    Unload {
        eq: u16,
    },
    State {
        eq: u16,
        old: DeviceState,
        new: DeviceState,
    },
}

impl ScriptOp {
    fn name(&self) -> &'static str {
        match self {
            ScriptOp::Mount { .. } => "mount",
            ScriptOp::Request { .. } => "request",
            ScriptOp::Label { .. } => "label",
            ScriptOp::Clean { .. } => "clean",
            ScriptOp::Audit { .. } => "audit",
            ScriptOp::Unload { .. } => "unload",
            ScriptOp::State { .. } => "state",
        }
    }

    fn command(&self, robot: u16) -> Option<Command> {
        let command = match self.clone() {
            ScriptOp::Mount {
                vsn,
                slot,
                media,
                write,
            } => Command::Mount(MountRequest {
                eq: robot,
                slot,
                media,
                vsn,
                flags: if write { MountFlags::WRITE } else { MountFlags::empty() },
                ..Default::default()
            }),
            ScriptOp::Request { .. } => return None,
            ScriptOp::Label {
                slot,
                vsn,
                media,
                relabel,
                barcode,
                erase,
            } => {
                let mut flags = LabelFlags::empty();
                flags.set(LabelFlags::RELABEL, relabel);
                flags.set(LabelFlags::BARCODE, barcode);
                flags.set(LabelFlags::ERASE, erase);
                Command::Label(LabelRequest {
                    eq: robot,
                    slot,
                    media,
                    vsn,
                    flags,
                    ..Default::default()
                })
            }
            ScriptOp::Clean { eq } => Command::Clean(CleanRequest { eq }),
            ScriptOp::Audit { slot, eod } => Command::Audit(AuditRequest {
                eq: robot,
                slot,
                eod,
            }),
            ScriptOp::Unload { eq } => Command::Unload(UnloadRequest { eq }),
            ScriptOp::State { eq, old, new } => Command::State(StateChange {
                eq,
                old_state: old,
                new_state: new,
            }),
        };
        Some(command)
    }
}

/// How one script line finished
#[derive(Debug, Clone, Serialize)]
pub struct OpResult {
    pub index: usize,
    pub op: &'static str,
    pub errno: Errno,
    pub code: i32,
    /// Drive that ended up holding the volume, for `request`
    pub eq: Option<u16>,
    pub leaked: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub library: u16,
    pub results: Vec<OpResult>,
    pub elapsed_ms: u128,
}

enum Waiter {
    Completion(Receiver<Completion>),
    Preview(Receiver<PreviewNotice>),
}

pub fn load_script(path: &Path) -> Result<Vec<ScriptOp>> {
    let text = fs::read_to_string(path)
        .map_err(|e| RobotError::parse(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&text)?)
}

/// Play `ops` against a freshly started simulated library. Each request
/// is submitted once the previous one has finished.
pub fn play(config: RobotConfig, ops: &[ScriptOp], timeout: Duration) -> Result<RunSummary> {
    let started = Instant::now();
    let world = SimWorld::from_config(&config);
    let (library, _catalog) = Library::with_world(config, &world)?;
    let handle = library.start()?;

    let mut results = Vec::with_capacity(ops.len());
    for (index, op) in ops.iter().enumerate() {
        let waiter = match (op.command(library.eq), op) {
            (Some(command), _) => {
                let (tx, rx) = completion_channel();
                library.submit(Event::message(command).with_reply(tx));
                Waiter::Completion(rx)
            }
            (None, ScriptOp::Request { vsn, write }) => {
                let (tx, rx) = unbounded();
                library.add_preview(vsn, None, *write, tx);
                Waiter::Preview(rx)
            }
            (None, _) => continue,
        };
        let left = timeout.saturating_sub(started.elapsed());
        let result = wait(index, op, waiter, left);
        if result.timed_out {
            warn!("{} #{} timed out", op.name(), index);
        } else {
            info!("{} #{}: {}", op.name(), index, result.errno);
        }
        results.push(result);
    }
    handle.shutdown();

    Ok(RunSummary {
        library: library.eq,
        results,
        elapsed_ms: started.elapsed().as_millis(),
    })
}

fn wait(index: usize, op: &ScriptOp, waiter: Waiter, left: Duration) -> OpResult {
    let ready = match waiter {
        Waiter::Completion(rx) => rx.recv_timeout(left).map(|c| (c.errno, None, c.leaked)),
        Waiter::Preview(rx) => rx.recv_timeout(left).map(|n| (n.errno, n.eq, false)),
    };
    let (errno, eq, leaked, timed_out) = match ready {
        Ok((errno, eq, leaked)) => (errno, eq, leaked, false),
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
            (Errno::EAGAIN, None, false, true)
        }
    };
    OpResult {
        index,
        op: op.name(),
        errno,
        code: errno.code(),
        eq,
        leaked,
        timed_out,
    }
}

pub async fn execute(config: Option<PathBuf>, script: PathBuf, timeout: u64) -> Result<()> {
    info!("Running request script {}", script.display());
    let config = RobotConfig::load(config.as_deref())?;
    let ops = load_script(&script)?;
    info!("{} requests loaded", ops.len());

    let summary = tokio::task::spawn_blocking(move || {
        play(config, &ops, Duration::from_secs(timeout))
    })
    .await
    .map_err(|e| RobotError::invalid_state(format!("run task failed: {}", e)))??;

    let failed = summary
        .results
        .iter()
        .filter(|r| !r.errno.is_ok() || r.leaked)
        .count();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if failed > 0 {
        warn!("{} of {} requests did not succeed", failed, summary.results.len());
    }
    Ok(())
}
