//! End-to-end behaviour of the session manager against a temp directory.

use std::cell::Cell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use ttyxfer::config::ConsentPolicy;
use ttyxfer::fs::LocalFs;
use ttyxfer::protocol::{Action, Compression, FileType, Record, TransmissionType};
use ttyxfer::session::auth::bypass_digest;
use ttyxfer::session::{
    Consent, ConsentProvider, DispatchError, EngineSettings, FileStatus, SessionManager, SessionState,
    SessionSummary, StaticConsent,
};
use ttyxfer::sync::delta::{compute_delta, encode_delta, DeltaOp};
use ttyxfer::sync::signature::SignatureDecoder;
use ttyxfer::transfer::OutboundStream;
use tempfile::TempDir;

fn settings(dir: &Path) -> EngineSettings {
    EngineSettings::new(dir.to_path_buf())
}

fn manager_with(settings: EngineSettings, consent: impl ConsentProvider + 'static) -> SessionManager {
    SessionManager::new(Box::new(LocalFs::new()), Box::new(consent), settings)
}

fn manager(dir: &Path) -> SessionManager {
    manager_with(settings(dir), StaticConsent::new(ConsentPolicy::Allow))
}

fn send(id: &str) -> Record {
    Record::new(Action::Send, id)
}

fn file(id: &str, file_id: &str, name: &str) -> Record {
    Record::new(Action::File, id).with_file_id(file_id).with_name(name)
}

fn data(id: &str, file_id: &str, payload: &[u8]) -> Record {
    Record::new(Action::Data, id).with_file_id(file_id).with_data(payload.to_vec())
}

fn end_data(id: &str, file_id: &str, payload: &[u8]) -> Record {
    Record::new(Action::EndData, id).with_file_id(file_id).with_data(payload.to_vec())
}

fn statuses(records: &[Record]) -> Vec<String> {
    records.iter().map(|r| r.status.clone()).collect()
}

fn staged_leftovers(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
        .count()
}

struct Recording {
    calls: Rc<Cell<usize>>,
    answer: Option<Consent>,
}

impl ConsentProvider for Recording {
    fn request_consent(&mut self, _summary: &SessionSummary) -> Option<Consent> {
        self.calls.set(self.calls.get() + 1);
        self.answer.clone()
    }
}

#[test]
fn simple_send() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(dir.path());
    let dest = dir.path().join("x.txt");

    assert_eq!(statuses(&manager.handle_command(&send("s1")).unwrap()), vec!["OK"]);

    let replies = manager
        .handle_command(&file("s1", "f1", dest.to_str().unwrap()))
        .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!((replies[0].file_id.as_str(), replies[0].status.as_str()), ("f1", "STARTED"));

    let replies = manager.handle_command(&data("s1", "f1", b"hello world!")).unwrap();
    assert_eq!(statuses(&replies), vec!["PROGRESS"]);
    assert_eq!(replies[0].size, Some(12));

    let replies = manager.handle_command(&end_data("s1", "f1", b" goodbye")).unwrap();
    assert_eq!(statuses(&replies), vec!["OK"]);
    assert_eq!(replies[0].size, Some(20));
    assert!(!dest.exists());

    let replies = manager.handle_command(&Record::new(Action::Finish, "s1")).unwrap();
    assert_eq!(statuses(&replies), vec!["OK"]);
    assert!(replies[0].file_id.is_empty());
    assert_eq!(fs::read(&dest).unwrap(), b"hello world! goodbye");
    assert_eq!(manager.session_state("s1"), None);
    assert_eq!(manager.quota().used(), 0);
}

#[test]
fn metadata_applied_on_commit() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(dir.path());
    let mtime = 1_600_000_000_000_000_000i64;

    manager.handle_command(&send("s")).unwrap();
    manager
        .handle_command(&file("s", "f", "meta.txt").with_mtime(mtime).with_permissions(0o600))
        .unwrap();
    manager.handle_command(&end_data("s", "f", b"x")).unwrap();
    manager.handle_command(&Record::new(Action::Finish, "s")).unwrap();

    let metadata = fs::metadata(dir.path().join("meta.txt")).unwrap();
    let modified = metadata.modified().unwrap().duration_since(std::time::UNIX_EPOCH).unwrap();
    assert_eq!(modified.as_secs(), 1_600_000_000);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(metadata.permissions().mode() & 0o7777, 0o600);
    }
}

#[test]
fn zlib_compressed_send() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(dir.path());
    let content = b"compress me please ".repeat(400);

    manager.handle_command(&send("s")).unwrap();
    manager
        .handle_command(&file("s", "f", "z.txt").with_compression(Compression::Zlib))
        .unwrap();
    for (payload, last) in OutboundStream::split_all(&content, Compression::Zlib, 100).unwrap() {
        let record = if last { end_data("s", "f", &payload) } else { data("s", "f", &payload) };
        manager.handle_command(&record).unwrap();
    }
    manager.handle_command(&Record::new(Action::Finish, "s")).unwrap();

    assert_eq!(fs::read(dir.path().join("z.txt")).unwrap(), content);
}

#[test]
fn bypass_authorization() {
    let dir = TempDir::new().unwrap();
    let calls = Rc::new(Cell::new(0));
    let mut settings = settings(dir.path());
    settings.bypass_secret = Some("secret".to_string());
    let mut manager = manager_with(
        settings,
        Recording {
            calls: calls.clone(),
            answer: Some(Consent::Granted),
        },
    );

    let good = send("s2").with_bypass(format!("sha256:{}", bypass_digest("s2", "secret")));
    assert_eq!(statuses(&manager.handle_command(&good).unwrap()), vec!["OK"]);
    assert_eq!(manager.session_state("s2"), Some(SessionState::Active));

    let bad = send("s3").with_bypass(format!("sha256:{}", bypass_digest("s3", "wrong")));
    let replies = manager.handle_command(&bad).unwrap();
    assert!(replies[0].status.starts_with("EPERM:"));
    assert_eq!(manager.session_state("s3"), None);

    assert_eq!(calls.get(), 0);
}

#[test]
fn silent_bypass_is_still_authorized() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path());
    settings.bypass_secret = Some("secret".to_string());
    let mut manager = manager_with(settings, StaticConsent::new(ConsentPolicy::Deny));

    let record = send("q")
        .with_quiet(2)
        .with_bypass(format!("sha256:{}", bypass_digest("q", "secret")));
    assert!(manager.handle_command(&record).unwrap().is_empty());
    assert_eq!(manager.session_state("q"), Some(SessionState::Active));
}

#[test]
fn commands_before_authorization_drop_the_session() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with(settings(dir.path()), StaticConsent::new(ConsentPolicy::Ask));

    assert!(manager.handle_command(&send("s")).unwrap().is_empty());
    assert_eq!(manager.session_state("s"), Some(SessionState::AwaitingAuthorization));

    let result = manager.handle_command(&file("s", "f", "early.txt"));
    assert!(matches!(result, Err(DispatchError::ProtocolViolation { .. })));
    assert_eq!(manager.session_state("s"), None);
    assert!(!dir.path().join("early.txt").exists());
    assert_eq!(staged_leftovers(dir.path()), 0);

    assert_eq!(
        manager.deliver_consent("s", Consent::Granted),
        Err(DispatchError::UnknownSession("s".to_string()))
    );
}

#[test]
fn malformed_record_before_authorization_drops_the_session() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path());
    settings.max_pending_commands = 8;
    let mut manager = manager_with(settings, StaticConsent::new(ConsentPolicy::Ask));

    manager.handle_command(&send("s")).unwrap();
    assert!(manager.handle_command(&file("s", "f", "early.txt")).unwrap().is_empty());

    let nameless = Record::new(Action::Data, "s").with_data(b"x".to_vec());
    let result = manager.handle_command(&nameless);
    assert!(matches!(result, Err(DispatchError::ProtocolViolation { .. })));
    assert_eq!(manager.session_state("s"), None);
    assert_eq!(
        manager.deliver_consent("s", Consent::Granted),
        Err(DispatchError::UnknownSession("s".to_string()))
    );
    assert!(!dir.path().join("early.txt").exists());
}

#[test]
fn parked_session_does_not_block_others() {
    let dir = TempDir::new().unwrap();
    let calls = Rc::new(Cell::new(0));
    let mut manager = manager_with(
        settings(dir.path()),
        Recording {
            calls: calls.clone(),
            answer: None,
        },
    );

    manager.handle_command(&send("slow")).unwrap();
    manager.handle_command(&send("other")).unwrap();
    assert_eq!(statuses(&manager.deliver_consent("other", Consent::Granted).unwrap()), vec!["OK"]);
    assert_eq!(manager.file_status("other", "f"), None);
    manager.handle_command(&file("other", "f", "o.txt")).unwrap();
    assert_eq!(manager.file_status("other", "f"), Some(FileStatus::Started));

    assert_eq!(statuses(&manager.handle_command(&Record::new(Action::Cancel, "slow")).unwrap()), vec!["CANCELED"]);
    assert_eq!(manager.session_state("other"), Some(SessionState::Active));
    assert_eq!(calls.get(), 2);
}

#[test]
fn cancel_at_every_point_commits_nothing() {
    let content: Vec<u8> = (0..5000u32).map(|i| (i % 199) as u8).collect();
    let chunks: Vec<&[u8]> = content.chunks(1000).collect();

    for cut in 0..=chunks.len() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(dir.path());

        manager.handle_command(&send("s")).unwrap();
        manager.handle_command(&file("s", "f", "big.bin")).unwrap();
        for (i, chunk) in chunks.iter().take(cut).enumerate() {
            let record = if i + 1 == chunks.len() {
                end_data("s", "f", chunk)
            } else {
                data("s", "f", chunk)
            };
            manager.handle_command(&record).unwrap();
        }

        let replies = manager.handle_command(&Record::new(Action::Cancel, "s")).unwrap();
        assert_eq!(statuses(&replies), vec!["CANCELED"], "cut at {}", cut);
        assert!(!dir.path().join("big.bin").exists(), "cut at {}", cut);
        assert_eq!(staged_leftovers(dir.path()), 0, "cut at {}", cut);
        assert_eq!(manager.quota().used(), 0);

        assert_eq!(
            manager.handle_command(&data("s", "f", b"late")),
            Err(DispatchError::UnknownSession("s".to_string()))
        );
        assert_eq!(
            manager.handle_command(&Record::new(Action::Finish, "s")),
            Err(DispatchError::UnknownSession("s".to_string()))
        );
    }
}

/// Announce an rsync transfer and collect the signature the engine sends back.
fn rsync_signature(manager: &mut SessionManager, name: &str) -> ttyxfer::sync::signature::Signature {
    let replies = manager
        .handle_command(&file("s", "f", name).with_transmission(TransmissionType::RsyncDelta))
        .unwrap();
    assert_eq!(replies[0].status, "STARTED");

    let mut decoder = SignatureDecoder::new();
    for record in &replies[1..] {
        assert!(matches!(record.action, Action::Data | Action::EndData));
        decoder.feed(&record.data).unwrap();
    }
    assert_eq!(replies.last().unwrap().action, Action::EndData);
    decoder.finish().unwrap()
}

#[test]
fn rsync_send_updates_existing_file() {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("doc.txt");
    let old = b"line of text that repeats\n".repeat(300);
    let mut new = old.clone();
    new.splice(2000..2010, b"CHANGED!!!".iter().copied());
    fs::write(&dest, &old).unwrap();

    let mut manager = manager(dir.path());
    manager.handle_command(&send("s")).unwrap();
    let signature = rsync_signature(&mut manager, "doc.txt");

    let delta = encode_delta(&compute_delta(&new[..], &signature).unwrap());
    assert!(delta.len() < new.len() / 2);
    let replies = manager.handle_command(&end_data("s", "f", &delta)).unwrap();
    assert_eq!(statuses(&replies), vec!["OK"]);
    assert_eq!(replies[0].size, Some(new.len() as u64));

    manager.handle_command(&Record::new(Action::Finish, "s")).unwrap();
    assert_eq!(fs::read(&dest).unwrap(), new);
}

#[test]
fn corrupted_delta_leaves_destination_untouched() {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("doc.txt");
    let old = b"0123456789abcdef".repeat(200);
    let mut new = old.clone();
    new.extend_from_slice(b"appended literal tail");
    fs::write(&dest, &old).unwrap();

    let mut manager = manager(dir.path());
    manager.handle_command(&send("s")).unwrap();
    let signature = rsync_signature(&mut manager, "doc.txt");

    let mut ops = compute_delta(&new[..], &signature).unwrap();
    let literal = ops
        .iter_mut()
        .find_map(|op| match op {
            DeltaOp::Literal { bytes } => Some(bytes),
            _ => None,
        })
        .unwrap();
    let mut corrupted = literal.to_vec();
    corrupted[0] ^= 0xff;
    *literal = corrupted.into();

    let replies = manager.handle_command(&end_data("s", "f", &encode_delta(&ops))).unwrap();
    assert!(replies[0].status.starts_with("EIO:"), "{:?}", replies);
    assert_eq!(manager.file_status("s", "f"), Some(FileStatus::Error));

    assert_eq!(statuses(&manager.handle_command(&Record::new(Action::Finish, "s")).unwrap()), vec!["OK"]);
    assert_eq!(fs::read(&dest).unwrap(), old);
    assert_eq!(staged_leftovers(dir.path()), 0);
}

#[test]
fn interleaved_sessions_match_isolated_runs() {
    fn script(id: &str) -> Vec<Record> {
        vec![
            send(id),
            file(id, "d", &format!("{}-dir", id)).with_ftype(FileType::Directory),
            file(id, "f", &format!("{}-dir/file.txt", id)),
            data(id, "f", id.as_bytes()),
            data(id, "f", b"-middle-"),
            end_data(id, "f", b"end"),
            file(id, "l", &format!("{}-dir/link", id)).with_ftype(FileType::Symlink),
            end_data(id, "l", b"fid:f"),
            Record::new(Action::Finish, id),
        ]
    }

    let alone = |id: &str| -> Vec<Record> {
        let dir = TempDir::new().unwrap();
        let mut manager = manager(dir.path());
        script(id)
            .iter()
            .flat_map(|record| manager.handle_command(record).unwrap())
            .collect()
    };
    let expected_a = alone("a");
    let expected_b = alone("b");

    let dir = TempDir::new().unwrap();
    let mut manager = manager(dir.path());
    let (a, b) = (script("a"), script("b"));
    let mut observed = Vec::new();
    for i in 0..a.len() {
        // b runs one step behind a
        observed.extend(manager.handle_command(&a[i]).unwrap());
        if i > 0 {
            observed.extend(manager.handle_command(&b[i - 1]).unwrap());
        }
    }
    observed.extend(manager.handle_command(b.last().unwrap()).unwrap());

    let only = |id: &str| -> Vec<Record> { observed.iter().filter(|r| r.id == id).cloned().collect() };
    assert_eq!(only("a"), expected_a);
    assert_eq!(only("b"), expected_b);
    assert_eq!(fs::read(dir.path().join("b-dir/file.txt")).unwrap(), b"b-middle-end");
    assert_eq!(
        fs::read_link(dir.path().join("a-dir/link")).unwrap(),
        Path::new("file.txt")
    );
}

#[test]
fn errors_only_keeps_session_replies() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(dir.path());

    assert_eq!(statuses(&manager.handle_command(&send("s").with_quiet(1)).unwrap()), vec!["OK"]);
    assert!(manager.handle_command(&file("s", "f", "q.txt")).unwrap().is_empty());
    assert!(manager.handle_command(&data("s", "f", b"abc")).unwrap().is_empty());
    assert!(manager.handle_command(&end_data("s", "f", b"def")).unwrap().is_empty());

    let replies = manager.handle_command(&end_data("s", "nope", b"x")).unwrap();
    assert!(replies[0].status.starts_with("EINVAL:"));

    assert_eq!(statuses(&manager.handle_command(&Record::new(Action::Finish, "s")).unwrap()), vec!["OK"]);
    assert_eq!(fs::read(dir.path().join("q.txt")).unwrap(), b"abcdef");
}

#[test]
fn silent_session_still_reports_fatal_errors() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path());
    settings.quota_bytes = 8;
    let mut manager = manager_with(settings, StaticConsent::new(ConsentPolicy::Allow));

    assert!(manager.handle_command(&send("s").with_quiet(2)).unwrap().is_empty());
    assert!(manager.handle_command(&file("s", "f", "big.txt")).unwrap().is_empty());
    assert!(manager.handle_command(&data("s", "f", b"12345")).unwrap().is_empty());

    let replies = manager.handle_command(&data("s", "f", b"67890")).unwrap();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].status.starts_with("ENOSPC:"));
    assert_eq!(manager.session_state("s"), None);
    assert_eq!(manager.quota().used(), 0);
    assert!(!dir.path().join("big.txt").exists());
}

#[test]
fn receive_lists_and_streams_content() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("pics")).unwrap();
    let content: Vec<u8> = (0..9000u32).map(|i| (i * 7 % 256) as u8).collect();
    fs::write(dir.path().join("pics/cat.jpg"), &content).unwrap();
    let mut manager = manager(dir.path());

    let replies = manager
        .handle_command(&Record::new(Action::Receive, "r").with_size(1))
        .unwrap();
    assert_eq!(statuses(&replies), vec!["OK"]);

    let listing = manager.handle_command(&file("r", "q", "~/pics")).unwrap();
    let entries: Vec<&Record> = listing.iter().filter(|r| r.action == Action::File).collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].ftype, Some(FileType::Directory));
    assert_eq!(entries[1].parent, entries[0].status);
    assert_eq!(entries[1].size, Some(content.len() as u64));
    let done = listing.last().unwrap();
    assert_eq!((done.status.as_str(), done.size), ("OK", Some(2)));

    let cat_id = entries[1].status.clone();
    assert!(manager
        .handle_command(&file("r", &cat_id, "").with_compression(Compression::Zlib))
        .unwrap()
        .is_empty());
    assert!(manager.has_pending_output());

    let mut inflated = ttyxfer::transfer::ChunkAssembler::new();
    inflated.open(&cat_id, Compression::Zlib);
    let mut received = Vec::new();
    while manager.has_pending_output() {
        for record in manager.pump(2048) {
            assert_eq!(record.file_id, cat_id);
            let last = record.action == Action::EndData;
            received.extend_from_slice(&inflated.feed(&cat_id, &record.data, last).unwrap());
        }
    }
    assert_eq!(received, content);

    assert!(manager.handle_command(&Record::new(Action::Finished, "r")).unwrap().is_empty());
    assert_eq!(manager.session_state("r"), None);
}
