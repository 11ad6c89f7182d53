//! Transfer sessions and the dispatcher that owns them.
//!
//! Every inbound record goes through [`SessionManager::handle_command`],
//! which routes it to one session's state machine:
//!
//! ```text
//! AwaitingAuthorization --granted--> Active --finish--> Finishing --> Closed
//!          |                           |
//!          +--denied--> Closed         +--cancel (any state)--> Cancelled
//! ```
//!
//! Sessions are removed from the manager as soon as they reach a terminal
//! state, so later commands for the same id fail with
//! [`DispatchError::UnknownSession`] and the id may be reused.

pub mod auth;
pub mod file;
pub mod receive;
pub mod reply;
pub mod send;

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

pub use auth::{AuthorizationGate, Consent, ConsentProvider, GateDecision, SessionSummary, StaticConsent};
pub use file::FileStatus;
pub use reply::{Replies, ReplyKind};

use crate::fs::local::Filesystem;
use crate::protocol::{Action, Command, QuietLevel, Record, SessionRequest, STATUS_CANCELED, STATUS_OK};
use crate::transfer::chunks::MAX_CHUNK_SIZE;
use crate::transfer::progress::TransferStats;
use crate::transfer::quota::StorageQuota;
use crate::utils::errors::{ErrorClass, FileError};
use receive::ReceiveSession;
use send::SendSession;

/// Default shared staging quota: 1 GiB
pub const DEFAULT_QUOTA_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to controller
    Send,
    /// Controller to client
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAuthorization,
    Active,
    Finishing,
    Closed,
    Cancelled,
}

/// A failure that ends the whole session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionFault {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("session {0} already exists")]
    DuplicateSession(String),

    #[error("session {id} dropped: {reason}")]
    ProtocolViolation { id: String, reason: String },

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("session {0} is not awaiting consent")]
    UnexpectedConsent(String),
}

/// Knobs of the engine, usually derived from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Base for `~` and relative names
    pub home: PathBuf,
    /// Bound on outbound payload bytes per record
    pub chunk_size: usize,
    /// Commands parked per session while awaiting consent; 0 drops the
    /// session on the first one
    pub max_pending_commands: usize,
    pub quota_bytes: u64,
    /// 0 derives a block size from each basis file
    pub default_block_size: u32,
    pub bypass_secret: Option<String>,
}

impl EngineSettings {
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            chunk_size: MAX_CHUNK_SIZE,
            max_pending_commands: 0,
            quota_bytes: DEFAULT_QUOTA_BYTES,
            default_block_size: 0,
            bypass_secret: None,
        }
    }
}

/// What a session may touch while handling one command.
pub struct EngineContext<'a> {
    pub fs: &'a dyn Filesystem,
    pub quota: &'a mut StorageQuota,
    pub settings: &'a EngineSettings,
}

enum Transfer {
    Send(SendSession),
    Receive(ReceiveSession),
}

struct Session {
    id: String,
    direction: Direction,
    state: SessionState,
    quiet: QuietLevel,
    transfer: Transfer,
    queued: Vec<Command>,
    stats: TransferStats,
}

impl Session {
    fn new(id: String, direction: Direction, request: &SessionRequest) -> Self {
        let transfer = match direction {
            Direction::Send => Transfer::Send(SendSession::new()),
            Direction::Receive => Transfer::Receive(ReceiveSession::new(request.expected_files)),
        };
        Self {
            id,
            direction,
            state: SessionState::AwaitingAuthorization,
            quiet: request.quiet,
            transfer,
            queued: Vec::new(),
            stats: TransferStats::new(),
        }
    }

    fn replies(&self) -> Replies {
        Replies::new(&self.id, self.quiet)
    }

    fn apply(
        &mut self,
        command: Command,
        ctx: &mut EngineContext<'_>,
        replies: &mut Replies,
    ) -> Result<Flow, SessionFault> {
        match &mut self.transfer {
            Transfer::Send(send) => {
                if matches!(command, Command::Finish | Command::Finished) {
                    self.state = SessionState::Finishing;
                }
                send.handle(command, ctx, replies, &mut self.stats)
            }
            Transfer::Receive(receive) => receive.handle(command, ctx, replies),
        }
    }

    fn has_pending_output(&self) -> bool {
        match &self.transfer {
            Transfer::Receive(receive) => receive.has_pending_output(),
            Transfer::Send(_) => false,
        }
    }

    fn discard(&mut self, quota: &mut StorageQuota) {
        self.queued.clear();
        if let Transfer::Send(send) = &mut self.transfer {
            send.discard(quota);
        }
    }
}

/// Owns every session of one connection and the quota they share.
pub struct SessionManager {
    fs: Box<dyn Filesystem>,
    consent: Box<dyn ConsentProvider>,
    gate: AuthorizationGate,
    settings: EngineSettings,
    quota: StorageQuota,
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    pub fn new(fs: Box<dyn Filesystem>, consent: Box<dyn ConsentProvider>, settings: EngineSettings) -> Self {
        Self {
            fs,
            consent,
            gate: AuthorizationGate::new(settings.bypass_secret.clone()),
            quota: StorageQuota::new(settings.quota_bytes),
            settings,
            sessions: HashMap::new(),
        }
    }

    /// Handle one inbound record, stamped with the current time.
    pub fn handle_command(&mut self, record: &Record) -> Result<Vec<Record>, DispatchError> {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.handle_command_at(record, now)
    }

    /// Handle one inbound record received at `received_at` (nanoseconds since
    /// the epoch).
    pub fn handle_command_at(&mut self, record: &Record, received_at: i64) -> Result<Vec<Record>, DispatchError> {
        let command = match Command::parse(record) {
            Ok(command) => command,
            Err(err) => {
                let reason = err.to_string();
                if !matches!(record.action, Action::Send | Action::Receive) {
                    if let Some(dropped) = self.drop_if_parked(&record.id, &reason) {
                        return Err(dropped);
                    }
                }
                warn!("Dropping malformed {:?} record: {}", record.action, err);
                return Err(DispatchError::Malformed(reason));
            }
        };
        let id = record.id.clone();

        match command {
            Command::Send(request) => self.open(id, Direction::Send, request, received_at),
            Command::Receive(request) => self.open(id, Direction::Receive, request, received_at),
            Command::Cancel => self.cancel(&id),
            command => self.dispatch(&id, command),
        }
    }

    /// Resume a session parked waiting for consent.
    pub fn deliver_consent(&mut self, id: &str, consent: Consent) -> Result<Vec<Record>, DispatchError> {
        match self.sessions.get(id).map(|session| session.state) {
            None => Err(DispatchError::UnknownSession(id.to_string())),
            Some(SessionState::AwaitingAuthorization) => self.resolve(id, consent),
            Some(_) => Err(DispatchError::UnexpectedConsent(id.to_string())),
        }
    }

    /// Produce queued outbound content, roughly `budget` payload bytes.
    pub fn pump(&mut self, budget: usize) -> Vec<Record> {
        let mut ids: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.has_pending_output())
            .map(|session| session.id.clone())
            .collect();
        ids.sort();

        let mut records = Vec::new();
        let mut remaining = budget;
        for id in ids {
            if remaining == 0 {
                break;
            }
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            let mut replies = Replies::new(&session.id, session.quiet);
            if let Transfer::Receive(receive) = &mut session.transfer {
                let used = receive.pump(remaining, &mut replies, &mut session.stats);
                remaining = remaining.saturating_sub(used);
            }
            records.extend(replies.into_records());
        }
        records
    }

    pub fn has_pending_output(&self) -> bool {
        self.sessions.values().any(Session::has_pending_output)
    }

    /// Cancel every session, discarding uncommitted data.
    pub fn cancel_all(&mut self) -> Vec<Record> {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        let mut records = Vec::new();
        for id in ids {
            if let Ok(replies) = self.cancel(&id) {
                records.extend(replies);
            }
        }
        records
    }

    pub fn session_state(&self, id: &str) -> Option<SessionState> {
        self.sessions.get(id).map(|session| session.state)
    }

    pub fn file_status(&self, id: &str, file_id: &str) -> Option<FileStatus> {
        match &self.sessions.get(id)?.transfer {
            Transfer::Send(send) => send.file_status(file_id),
            Transfer::Receive(_) => None,
        }
    }

    pub fn quota(&self) -> &StorageQuota {
        &self.quota
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn open(
        &mut self,
        id: String,
        direction: Direction,
        request: SessionRequest,
        received_at: i64,
    ) -> Result<Vec<Record>, DispatchError> {
        if self.sessions.contains_key(&id) {
            warn!("Duplicate session {}", id);
            return Err(DispatchError::DuplicateSession(id));
        }
        if direction == Direction::Receive && request.expected_files == 0 {
            return Err(DispatchError::Malformed(format!(
                "receive {} does not say how many files follow",
                id
            )));
        }

        let summary = SessionSummary {
            id: id.clone(),
            direction,
            expected_files: request.expected_files,
        };
        let decision = self
            .gate
            .authorize(&summary, &request, received_at, self.consent.as_mut());
        self.sessions
            .insert(id.clone(), Session::new(id.clone(), direction, &request));

        match decision {
            GateDecision::Decided(consent) => self.resolve(&id, consent),
            GateDecision::Pending => {
                info!("Session {} ({:?}) awaiting consent", id, direction);
                Ok(Vec::new())
            }
        }
    }

    fn resolve(&mut self, id: &str, consent: Consent) -> Result<Vec<Record>, DispatchError> {
        let mut session = self
            .sessions
            .remove(id)
            .ok_or_else(|| DispatchError::UnknownSession(id.to_string()))?;
        let mut replies = session.replies();

        match consent {
            Consent::Granted => {
                info!("Session {} ({:?}) authorized", id, session.direction);
                session.state = SessionState::Active;
                replies.session_ack(STATUS_OK);
                let queued = std::mem::take(&mut session.queued);
                self.run(session, queued, replies)
            }
            Consent::Denied(reason) => {
                info!("Session {} denied: {}", id, reason);
                session.state = SessionState::Closed;
                replies.session_ack(FileError::new(ErrorClass::Eperm, reason).to_status());
                Ok(replies.into_records())
            }
        }
    }

    /// Abort a session in any state. Nothing it staged is committed.
    fn cancel(&mut self, id: &str) -> Result<Vec<Record>, DispatchError> {
        let Some(mut session) = self.sessions.remove(id) else {
            debug!("Ignoring cancel for unknown session {}", id);
            return Err(DispatchError::UnknownSession(id.to_string()));
        };
        session.discard(&mut self.quota);
        session.state = SessionState::Cancelled;
        info!("Session {} cancelled: {}", id, session.stats.summary());

        let mut replies = session.replies();
        replies.session_ack(STATUS_CANCELED);
        Ok(replies.into_records())
    }

    /// A record for a parked session that does not parse is still a command
    /// before authorization.
    fn drop_if_parked(&mut self, id: &str, reason: &str) -> Option<DispatchError> {
        let parked = self
            .sessions
            .get(id)
            .is_some_and(|session| session.state == SessionState::AwaitingAuthorization);
        if !parked {
            return None;
        }
        let mut session = self.sessions.remove(id)?;
        session.discard(&mut self.quota);
        warn!("Malformed record before authorization, dropping session {}", id);
        Some(DispatchError::ProtocolViolation {
            id: id.to_string(),
            reason: reason.to_string(),
        })
    }

    fn dispatch(&mut self, id: &str, command: Command) -> Result<Vec<Record>, DispatchError> {
        let Some(session) = self.sessions.get_mut(id) else {
            debug!("Ignoring {:?} for unknown session {}", command.action(), id);
            return Err(DispatchError::UnknownSession(id.to_string()));
        };

        if session.state == SessionState::AwaitingAuthorization {
            let limit = self.settings.max_pending_commands;
            if session.queued.len() < limit {
                session.queued.push(command);
                return Ok(Vec::new());
            }

            let Some(mut session) = self.sessions.remove(id) else {
                return Err(DispatchError::UnknownSession(id.to_string()));
            };
            session.discard(&mut self.quota);
            if limit == 0 {
                warn!("{:?} before authorization, dropping session {}", command.action(), id);
                return Err(DispatchError::ProtocolViolation {
                    id: id.to_string(),
                    reason: format!("{:?} before authorization", command.action()),
                });
            }
            warn!("Session {} queued more than {} commands before authorization", id, limit);
            let mut replies = session.replies();
            replies.fatal(FileError::new(ErrorClass::Enospc, "Too many commands before authorization").to_status());
            return Ok(replies.into_records());
        }

        let Some(session) = self.sessions.remove(id) else {
            return Err(DispatchError::UnknownSession(id.to_string()));
        };
        let replies = session.replies();
        self.run(session, vec![command], replies)
    }

    /// Apply commands in order to a session taken out of the map, putting it
    /// back if it is still open afterwards.
    fn run(
        &mut self,
        mut session: Session,
        commands: Vec<Command>,
        mut replies: Replies,
    ) -> Result<Vec<Record>, DispatchError> {
        for command in commands {
            let mut ctx = EngineContext {
                fs: self.fs.as_ref(),
                quota: &mut self.quota,
                settings: &self.settings,
            };
            match session.apply(command, &mut ctx, &mut replies) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => {
                    session.state = SessionState::Closed;
                    info!("Session {} closed: {}", session.id, session.stats.summary());
                    return Ok(replies.into_records());
                }
                Err(SessionFault::ProtocolViolation(reason)) => {
                    warn!("Dropping session {}: {}", session.id, reason);
                    session.discard(&mut self.quota);
                    return Err(DispatchError::ProtocolViolation { id: session.id, reason });
                }
                Err(SessionFault::ResourceExhausted(reason)) => {
                    warn!("Dropping session {}: {}", session.id, reason);
                    session.discard(&mut self.quota);
                    replies.fatal(FileError::new(ErrorClass::Enospc, reason).to_status());
                    return Ok(replies.into_records());
                }
            }
        }

        self.sessions.insert(session.id.clone(), session);
        Ok(replies.into_records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsentPolicy;
    use crate::fs::local::LocalFs;
    use crate::protocol::{Action, FileType};
    use tempfile::TempDir;

    fn manager(policy: ConsentPolicy, pending: usize) -> (TempDir, SessionManager) {
        let dir = TempDir::new().unwrap();
        let mut settings = EngineSettings::new(dir.path().to_path_buf());
        settings.max_pending_commands = pending;
        let manager = SessionManager::new(Box::new(LocalFs::new()), Box::new(StaticConsent::new(policy)), settings);
        (dir, manager)
    }

    fn file(id: &str, file_id: &str, name: &str) -> Record {
        Record::new(Action::File, id).with_file_id(file_id).with_name(name)
    }

    #[test]
    fn test_unknown_and_duplicate_sessions() {
        let (_dir, mut manager) = manager(ConsentPolicy::Allow, 0);

        assert_eq!(
            manager.handle_command(&Record::new(Action::Finish, "nope")),
            Err(DispatchError::UnknownSession("nope".to_string()))
        );
        manager.handle_command(&Record::new(Action::Send, "s")).unwrap();
        assert_eq!(
            manager.handle_command(&Record::new(Action::Receive, "s").with_size(1)),
            Err(DispatchError::DuplicateSession("s".to_string()))
        );
    }

    #[test]
    fn test_denied_session_is_closed() {
        let (_dir, mut manager) = manager(ConsentPolicy::Deny, 0);

        let replies = manager.handle_command(&Record::new(Action::Send, "s")).unwrap();
        assert!(replies[0].status.starts_with("EPERM:"));
        assert_eq!(manager.session_state("s"), None);
    }

    #[test]
    fn test_queued_commands_replayed_on_grant() {
        let (dir, mut manager) = manager(ConsentPolicy::Ask, 4);

        assert!(manager.handle_command(&Record::new(Action::Send, "s")).unwrap().is_empty());
        assert!(manager.handle_command(&file("s", "d", "made")).unwrap().is_empty());
        assert!(!dir.path().join("made").exists());
        assert_eq!(manager.session_state("s"), Some(SessionState::AwaitingAuthorization));

        let replies = manager.deliver_consent("s", Consent::Granted).unwrap();
        let statuses: Vec<&str> = replies.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, vec!["OK", "STARTED"]);
        assert_eq!(manager.file_status("s", "d"), Some(FileStatus::Started));
        assert_eq!(
            manager.deliver_consent("s", Consent::Granted),
            Err(DispatchError::UnexpectedConsent("s".to_string()))
        );
    }

    #[test]
    fn test_queue_overflow_drops_session() {
        let (_dir, mut manager) = manager(ConsentPolicy::Ask, 1);

        manager.handle_command(&Record::new(Action::Send, "s")).unwrap();
        manager.handle_command(&file("s", "a", "a")).unwrap();
        let replies = manager.handle_command(&file("s", "b", "b")).unwrap();
        assert!(replies[0].status.starts_with("ENOSPC:"));
        assert_eq!(manager.session_state("s"), None);
    }

    #[test]
    fn test_receive_requires_count() {
        let (_dir, mut manager) = manager(ConsentPolicy::Allow, 0);
        assert!(matches!(
            manager.handle_command(&Record::new(Action::Receive, "r")),
            Err(DispatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_directory_announce_completes() {
        let (dir, mut manager) = manager(ConsentPolicy::Allow, 0);
        manager.handle_command(&Record::new(Action::Send, "s")).unwrap();

        let replies = manager
            .handle_command(&file("s", "d", "sub").with_ftype(FileType::Directory))
            .unwrap();
        assert_eq!(replies[0].status, "OK");
        assert!(dir.path().join("sub").is_dir());
        assert_eq!(manager.file_status("s", "d"), Some(FileStatus::Complete));
    }

    #[test]
    fn test_cancel_discards_staged_data() {
        let (dir, mut manager) = manager(ConsentPolicy::Allow, 0);
        manager.handle_command(&Record::new(Action::Send, "s")).unwrap();
        manager.handle_command(&file("s", "f", "f.txt")).unwrap();
        manager
            .handle_command(&Record::new(Action::Data, "s").with_file_id("f").with_data(b"abc".to_vec()))
            .unwrap();
        assert_eq!(manager.quota().used(), 3);

        let replies = manager.handle_command(&Record::new(Action::Cancel, "s")).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status, STATUS_CANCELED);
        assert_eq!(manager.session_state("s"), None);
        assert_eq!(manager.quota().used(), 0);
        assert!(!dir.path().join("f.txt").exists());
        assert_eq!(
            manager.handle_command(&Record::new(Action::Cancel, "s")),
            Err(DispatchError::UnknownSession("s".to_string()))
        );
    }

    #[test]
    fn test_cancel_while_awaiting_authorization() {
        let (_dir, mut manager) = manager(ConsentPolicy::Ask, 4);
        manager.handle_command(&Record::new(Action::Send, "s")).unwrap();
        manager.handle_command(&file("s", "f", "f.txt")).unwrap();

        let replies = manager.handle_command(&Record::new(Action::Cancel, "s")).unwrap();
        assert_eq!(replies[0].status, STATUS_CANCELED);
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn test_malformed_record_drops_parked_session() {
        let (_dir, mut manager) = manager(ConsentPolicy::Ask, 4);
        manager.handle_command(&Record::new(Action::Send, "s")).unwrap();

        let result = manager.handle_command(&Record::new(Action::Data, "s"));
        assert!(matches!(result, Err(DispatchError::ProtocolViolation { .. })));
        assert_eq!(manager.session_state("s"), None);
    }

    #[test]
    fn test_malformed_record_leaves_active_session() {
        let (_dir, mut manager) = manager(ConsentPolicy::Allow, 0);
        manager.handle_command(&Record::new(Action::Send, "s")).unwrap();

        let result = manager.handle_command(&Record::new(Action::Data, "s"));
        assert!(matches!(result, Err(DispatchError::Malformed(_))));
        assert_eq!(manager.session_state("s"), Some(SessionState::Active));
    }

    #[test]
    fn test_unsafe_id_is_malformed() {
        let (_dir, mut manager) = manager(ConsentPolicy::Allow, 0);
        assert!(matches!(
            manager.handle_command(&Record::new(Action::Send, "../evil")),
            Err(DispatchError::Malformed(_))
        ));
        assert_eq!(manager.session_count(), 0);
    }
}
