//! Session state: the data a transfer engine owns and observers may read
//!
//! A [`Session`] is a cheap, cloneable handle around state guarded by a
//! single [`parking_lot::Mutex`]. The owning engine is the only writer;
//! everything else -- progress bars, logs, a GUI -- takes a [`ProgressSnapshot`]
//! through [`Session::snapshot`] or watches [`Session::subscribe`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Which protocol a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// Plain Xmodem, in one of its five flavors.
    Xmodem,
    /// Ymodem (Xmodem plus a filename/metadata block 0).
    Ymodem,
    /// Kermit.
    Kermit,
}

/// Overall session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Not yet started.
    Init,
    /// Negotiating / announcing the next file's metadata.
    FileInfo,
    /// Transferring file data.
    Transfer,
    /// The current file finished (success or per-file error); more may follow.
    FileDone,
    /// All files processed; the session ended normally.
    End,
    /// The session terminated abnormally.
    Abort,
}

/// What the user asked for when cancelling an in-progress transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelMode {
    /// No cancellation requested.
    None,
    /// Stop, but keep whatever has been written to the local file so far.
    KeepPartial,
    /// Stop and delete the partially written local file.
    DiscardPartial,
}

/// One file within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Name as announced on the wire (Ymodem/Kermit) or assigned locally (Xmodem).
    pub remote_name: String,
    /// Size in bytes, if known ahead of the transfer.
    pub size: Option<u64>,
    /// Source modification time, if carried by the protocol.
    pub modified: Option<DateTime<Utc>>,
    /// Bytes moved so far for this file.
    pub bytes_transferred: u64,
    /// Total bytes expected, if known.
    pub bytes_total: Option<u64>,
    /// Blocks/packets moved so far for this file.
    pub blocks_transferred: u32,
    /// Total blocks/packets expected, if known.
    pub blocks_total: Option<u32>,
    /// Active block/packet size in bytes.
    pub block_size: usize,
    /// Count of retransmits/NAKs/checksum failures for this file.
    pub error_count: u32,
    /// When the per-file transfer started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the per-file transfer ended (success or failure).
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the file transferred successfully end to end.
    pub complete: bool,
}

impl FileInfo {
    /// Create a new, empty in-progress `FileInfo`.
    pub fn new(remote_name: impl Into<String>, block_size: usize) -> Self {
        Self {
            remote_name: remote_name.into(),
            size: None,
            modified: None,
            bytes_transferred: 0,
            bytes_total: None,
            blocks_transferred: 0,
            blocks_total: None,
            block_size,
            error_count: 0,
            started_at: Some(Utc::now()),
            finished_at: None,
            complete: false,
        }
    }
}

/// A read-only, serializable copy of a session's progress, safe to hand to
/// an observer without exposing the session lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Monotonically increasing; bumped on every state or counter change.
    pub revision: u64,
    /// Which protocol is running.
    pub protocol: ProtocolKind,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Current cancellation request, if any.
    pub cancel: CancelMode,
    /// All files seen so far, oldest first.
    pub files: Vec<FileInfo>,
    /// Index into `files` of the file currently being transferred, if any.
    pub current_file: Option<usize>,
    /// Short human-readable status line (e.g. "sending block 12").
    pub status: String,
    /// Append-only log of uppercase-tagged error/status messages.
    pub messages: Vec<String>,
}

struct SessionInner {
    protocol: ProtocolKind,
    batchable: bool,
    state: SessionState,
    cancel: CancelMode,
    files: Vec<FileInfo>,
    current_file: Option<usize>,
    status: String,
    messages: Vec<String>,
    revision: u64,
}

impl SessionInner {
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            revision: self.revision,
            protocol: self.protocol,
            state: self.state,
            cancel: self.cancel,
            files: self.files.clone(),
            current_file: self.current_file,
            status: self.status.clone(),
            messages: self.messages.clone(),
        }
    }
}

/// A transfer session: progress counters, the files list, state, the
/// cancellation flag, and the message log.
///
/// Cheaply cloneable; every clone refers to the same underlying state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
    progress_tx: Arc<watch::Sender<ProgressSnapshot>>,
}

impl Session {
    /// Create a new session for the given protocol.
    pub fn new(protocol: ProtocolKind, batchable: bool) -> Self {
        let inner = SessionInner {
            protocol,
            batchable,
            state: SessionState::Init,
            cancel: CancelMode::None,
            files: Vec::new(),
            current_file: None,
            status: String::new(),
            messages: Vec::new(),
            revision: 0,
        };
        let snapshot = inner.snapshot();
        let (progress_tx, _rx) = watch::channel(snapshot);
        Self {
            inner: Arc::new(Mutex::new(inner)),
            progress_tx: Arc::new(progress_tx),
        }
    }

    /// Whether this session may carry more than one file (Ymodem, Kermit).
    pub fn batchable(&self) -> bool {
        self.inner.lock().batchable
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Transition to a new lifecycle state and publish the change.
    pub fn set_state(&self, state: SessionState) {
        self.mutate(|inner| inner.state = state);
    }

    /// Current cancellation request, if any.
    pub fn cancel_mode(&self) -> CancelMode {
        self.inner.lock().cancel
    }

    /// Ask the running engine to cancel at its next opportunity.
    pub fn request_cancel(&self, mode: CancelMode) {
        self.mutate(|inner| inner.cancel = mode);
    }

    /// Set the short human-readable status line.
    pub fn set_status(&self, status: impl Into<String>) {
        self.mutate(|inner| inner.status = status.into());
    }

    /// Append an uppercase-tagged message to the session log. Preserved
    /// even after the session ends.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%message, "session message");
        self.mutate(|inner| inner.messages.push(message));
    }

    /// Register the next file and make it current. Returns its index.
    pub fn begin_file(&self, info: FileInfo) -> usize {
        self.mutate(|inner| {
            inner.files.push(info);
            let idx = inner.files.len() - 1;
            inner.current_file = Some(idx);
            idx
        })
    }

    /// Update the current byte/block counters for file `idx`.
    pub fn record_progress(&self, idx: usize, bytes_transferred: u64, blocks_transferred: u32) {
        self.mutate(|inner| {
            if let Some(file) = inner.files.get_mut(idx) {
                file.bytes_transferred = bytes_transferred;
                file.blocks_transferred = blocks_transferred;
            }
        });
    }

    /// Record a retransmit/NAK/checksum failure against file `idx`.
    pub fn record_error(&self, idx: usize) {
        self.mutate(|inner| {
            if let Some(file) = inner.files.get_mut(idx) {
                file.error_count += 1;
            }
        });
    }

    /// Mark file `idx` as finished (successfully or not) and clear
    /// `current_file` if it was the active one.
    pub fn finish_file(&self, idx: usize, complete: bool) {
        self.mutate(|inner| {
            if let Some(file) = inner.files.get_mut(idx) {
                file.complete = complete;
                file.finished_at = Some(Utc::now());
            }
            if inner.current_file == Some(idx) {
                inner.current_file = None;
            }
        });
    }

    /// Take a read-only snapshot of the current progress.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.lock().snapshot()
    }

    /// Subscribe to progress updates. The receiver always has the latest
    /// snapshot, even if it misses intermediate ones.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_tx.subscribe()
    }

    /// How many files completed successfully.
    pub fn completed_count(&self) -> usize {
        self.inner.lock().files.iter().filter(|f| f.complete).count()
    }

    /// Total number of files seen.
    pub fn total_count(&self) -> usize {
        self.inner.lock().files.len()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut SessionInner) -> R) -> R {
        let mut guard = self.inner.lock();
        let result = f(&mut guard);
        guard.revision += 1;
        let snapshot = guard.snapshot();
        drop(guard);
        let _ = self.progress_tx.send(snapshot);
        result
    }
}

/// How a session run concluded, surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCondition {
    /// Every file completed.
    AllFilesComplete,
    /// At least one file completed, at least one did not.
    SomeFilesComplete,
    /// No file completed.
    NoFilesComplete,
    /// The remote end aborted the session.
    AbortedByRemote,
    /// The local user cancelled the session.
    AbortedByUser,
}

impl Session {
    /// Compute the final [`ExitCondition`] for a session that has reached
    /// [`SessionState::End`] or [`SessionState::Abort`].
    pub fn exit_condition(&self) -> ExitCondition {
        let inner = self.inner.lock();
        if inner.state == SessionState::Abort {
            return match inner.cancel {
                CancelMode::None => ExitCondition::AbortedByRemote,
                _ => ExitCondition::AbortedByUser,
            };
        }
        let total = inner.files.len();
        let complete = inner.files.iter().filter(|f| f.complete).count();
        if total == 0 || complete == 0 {
            ExitCondition::NoFilesComplete
        } else if complete == total {
            ExitCondition::AllFilesComplete
        } else {
            ExitCondition::SomeFilesComplete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_file_sets_current_and_appends() {
        let session = Session::new(ProtocolKind::Xmodem, false);
        let idx = session.begin_file(FileInfo::new("a.bin", 128));
        assert_eq!(idx, 0);
        assert_eq!(session.snapshot().current_file, Some(0));
    }

    #[test]
    fn finish_file_clears_current() {
        let session = Session::new(ProtocolKind::Xmodem, false);
        let idx = session.begin_file(FileInfo::new("a.bin", 128));
        session.finish_file(idx, true);
        let snap = session.snapshot();
        assert_eq!(snap.current_file, None);
        assert!(snap.files[0].complete);
    }

    #[test]
    fn exit_condition_all_complete() {
        let session = Session::new(ProtocolKind::Ymodem, true);
        let idx = session.begin_file(FileInfo::new("a.bin", 128));
        session.finish_file(idx, true);
        session.set_state(SessionState::End);
        assert_eq!(session.exit_condition(), ExitCondition::AllFilesComplete);
    }

    #[test]
    fn exit_condition_aborted_by_user() {
        let session = Session::new(ProtocolKind::Kermit, true);
        session.request_cancel(CancelMode::DiscardPartial);
        session.set_state(SessionState::Abort);
        assert_eq!(session.exit_condition(), ExitCondition::AbortedByUser);
    }

    #[test]
    fn revision_increases_on_every_mutation() {
        let session = Session::new(ProtocolKind::Xmodem, false);
        let before = session.snapshot().revision;
        session.log("TIMEOUT");
        let after = session.snapshot().revision;
        assert!(after > before);
    }
}
