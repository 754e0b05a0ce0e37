//! Work items passed between the library and drive queues
//!
//! An [`Event`] is owned by exactly one queue at a time and is finished by
//! [`Event::dispose`], which consumes it. Dropping an event that was never
//! disposed is reported as a leak on its reply channel.

use bitflags::bitflags;
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::catalog::MediaType;
use crate::device::DeviceState;
use crate::error::Errno;
use crate::labels::LabelFlags;
use crate::preview::{PreviewEntry, PreviewNotice};

/// Stamped on every inbound message, checked at dispatch
pub const MESSAGE_MAGIC: u32 = 0x5341_4d52;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Sent on the reply channel when an event finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub id: u64,
    pub errno: Errno,
    /// Event was dropped without being disposed
    pub leaked: bool,
}

pub fn completion_channel() -> (Sender<Completion>, Receiver<Completion>) {
    unbounded()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags {
    /// Not to be run before `Event::timeout`
    pub delayed: bool,
    /// Dispose instead of requeueing when the target drive goes away
    pub dont_reque: bool,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MountFlags: u32 {
        const WRITE = 1 << 0;
        /// Migration toolkit mount: keep the unit active and open afterwards
        const MIGKIT = 1 << 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountRequest {
    /// Robot equipment id
    pub eq: u16,
    pub slot: Option<u32>,
    pub partition: u8,
    pub media: Option<MediaType>,
    pub vsn: String,
    pub flags: MountFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelRequest {
    pub eq: u16,
    pub slot: u32,
    pub partition: u8,
    pub media: MediaType,
    pub vsn: String,
    /// Must match the current label when given
    pub old_vsn: Option<String>,
    pub info: Option<String>,
    pub block_size: u32,
    pub flags: LabelFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadRequest {
    /// Drive equipment id
    pub eq: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanRequest {
    pub eq: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditRequest {
    pub eq: u16,
    /// Whole library when `None`
    pub slot: Option<u32>,
    /// Position at end of data to learn remaining space
    pub eod: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub eq: u16,
    pub old_state: DeviceState,
    pub new_state: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRequest {
    pub eq: u16,
    pub slot: u32,
    pub partition: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TodoCommand {
    Add,
    Cancel,
    Unload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TodoCallback {
    PositionMedia { position: u64 },
    NotifyFsLoad,
    NotifyTpLoad,
    None,
}

#[derive(Debug, Clone)]
pub struct TodoRequest {
    /// Drive equipment id
    pub eq: u16,
    pub sub_cmd: TodoCommand,
    pub callback: TodoCallback,
    pub waiter: Option<Sender<PreviewNotice>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleRequest {
    pub eq: u16,
    pub enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SefRequest {
    pub eq: u16,
    pub enable: bool,
    /// Seconds between sense collections
    pub interval: u32,
}

/// Inbound commands
#[derive(Debug, Clone)]
pub enum Command {
    Mount(MountRequest),
    Label(LabelRequest),
    Unload(UnloadRequest),
    Clean(CleanRequest),
    Audit(AuditRequest),
    State(StateChange),
    LoadUnavail(LoadRequest),
    Todo(TodoRequest),
    TapeAlert(ToggleRequest),
    Sef(SefRequest),
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Mount(_) => "mount",
            Command::Label(_) => "label",
            Command::Unload(_) => "unload",
            Command::Clean(_) => "clean",
            Command::Audit(_) => "audit",
            Command::State(_) => "state",
            Command::LoadUnavail(_) => "load_unavail",
            Command::Todo(_) => "todo",
            Command::TapeAlert(_) => "tapealert",
            Command::Sef(_) => "sef",
            Command::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub magic: u32,
    pub command: Command,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self {
            magic: MESSAGE_MAGIC,
            command,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MESSAGE_MAGIC
    }
}

/// Work the library or a drive generates for itself
#[derive(Debug, Clone)]
pub enum InternalCommand {
    StartAudit { eod: bool },
    AuditSlot { slot: u32, eod: bool },
    Init,
    Mount {
        slot: u32,
        partition: u8,
        /// Preview entry and the sequence number seen when it was claimed
        preview: Option<(Arc<PreviewEntry>, u64)>,
    },
    Shutdown,
    Query,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    Internal(InternalCommand),
    Message(Message),
}

pub struct Event {
    pub id: u64,
    pub kind: EventKind,
    pub flags: EventFlags,
    pub timeout: Option<Instant>,
    reply: Option<Sender<Completion>>,
    disposed: bool,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            flags: EventFlags::default(),
            timeout: None,
            reply: None,
            disposed: false,
        }
    }

    pub fn message(command: Command) -> Self {
        Self::new(EventKind::Message(Message::new(command)))
    }

    pub fn internal(command: InternalCommand) -> Self {
        Self::new(EventKind::Internal(command))
    }

    pub fn with_reply(mut self, reply: Sender<Completion>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Hold the event back for `after`
    pub fn delay(mut self, after: Duration) -> Self {
        self.flags.delayed = true;
        self.timeout = Some(Instant::now() + after);
        self
    }

    /// Ready to run: not delayed, or its timeout has passed
    pub fn is_due(&self, now: Instant) -> bool {
        !self.flags.delayed || self.timeout.map_or(true, |t| t <= now)
    }

    pub fn describe(&self) -> &'static str {
        match &self.kind {
            EventKind::Message(msg) => msg.command.name(),
            EventKind::Internal(cmd) => match cmd {
                InternalCommand::StartAudit { .. } => "start_audit",
                InternalCommand::AuditSlot { .. } => "audit_slot",
                InternalCommand::Init => "init",
                InternalCommand::Mount { .. } => "internal_mount",
                InternalCommand::Shutdown => "internal_shutdown",
                InternalCommand::Query => "query",
            },
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self.kind, EventKind::Message(_))
    }

    /// Finish the event and report `errno` to whoever is waiting on it
    pub fn dispose(mut self, errno: Errno) {
        self.disposed = true;
        debug!("event {} ({}) disposed: {}", self.id, self.describe(), errno);
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Completion {
                id: self.id,
                errno,
                leaked: false,
            });
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        error!("event {} ({}) dropped without disposal", self.id, self.describe());
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Completion {
                id: self.id,
                errno: Errno::EIO,
                leaked: true,
            });
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("kind", &self.describe())
            .field("flags", &self.flags)
            .finish()
    }
}
