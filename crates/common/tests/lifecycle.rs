use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use wgledger_common::{
    ConnectionStatus, Error, ExpiryState, KeyGenerator, LedgerConfig, LifecycleCoordinator,
    LifecycleStep, ListFilter, NewUser, PeerKeys, PeerSnapshot, RuntimeControl, UserStatus,
};

const SERVER_CONF: &str = "[Interface]\n\
Address = 10.66.66.1/24\n\
ListenPort = 51820\n\
PrivateKey = c2VydmVycHJpdmF0ZQ==\n\
\n";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Add(String, Ipv4Addr),
    Remove(String),
    Reload,
}

#[derive(Default)]
struct FakeRuntime {
    calls: Mutex<Vec<Call>>,
    peers: Mutex<Vec<PeerSnapshot>>,
    fail_add: Mutex<bool>,
    fail_remove: Mutex<bool>,
}

impl FakeRuntime {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn failure(command: &str) -> Error {
        Error::RuntimeCommand {
            command: command.to_string(),
            message: "exit 1: Unable to access interface".to_string(),
        }
    }
}

impl RuntimeControl for FakeRuntime {
    fn snapshot(&self) -> wgledger_common::Result<Vec<PeerSnapshot>> {
        Ok(self.peers.lock().clone())
    }

    fn add_peer(&self, public_key: &str, _psk: &str, address: Ipv4Addr) -> wgledger_common::Result<()> {
        if *self.fail_add.lock() {
            return Err(Self::failure("wg set wg0 peer"));
        }
        self.calls.lock().push(Call::Add(public_key.to_string(), address));
        Ok(())
    }

    fn remove_peer(&self, public_key: &str) -> wgledger_common::Result<()> {
        if *self.fail_remove.lock() {
            return Err(Self::failure("wg set wg0 peer remove"));
        }
        self.calls.lock().push(Call::Remove(public_key.to_string()));
        Ok(())
    }

    fn reload(&self) -> wgledger_common::Result<()> {
        self.calls.lock().push(Call::Reload);
        Ok(())
    }
}

/// Deterministic keys: pub-1, pub-2, ...
#[derive(Default)]
struct SequentialKeys {
    next: AtomicU32,
}

impl KeyGenerator for SequentialKeys {
    fn generate(&self) -> wgledger_common::Result<PeerKeys> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PeerKeys {
            private_key: format!("priv-{}", n),
            public_key: format!("pub-{}", n),
            preshared_key: format!("psk-{}", n),
        })
    }
}

struct Harness {
    _dir: TempDir,
    conf_path: PathBuf,
    runtime: Arc<FakeRuntime>,
    coordinator: LifecycleCoordinator,
}

/// Sequential keys that also put a directory where the ledger file goes,
/// so the duplicate check passes and the later ledger write fails
struct BlockLedgerOnGenerate {
    keys: SequentialKeys,
    records_path: Mutex<Option<PathBuf>>,
}

impl KeyGenerator for BlockLedgerOnGenerate {
    fn generate(&self) -> wgledger_common::Result<PeerKeys> {
        if let Some(path) = self.records_path.lock().as_ref() {
            std::fs::create_dir_all(path).unwrap();
        }
        self.keys.generate()
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(SequentialKeys::default()), None)
}

fn harness_with(keygen: Arc<dyn KeyGenerator>, server_config: Option<PathBuf>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let conf_path = server_config.unwrap_or_else(|| {
        let path = dir.path().join("wg0.conf");
        std::fs::write(&path, SERVER_CONF).unwrap();
        path
    });

    let config = LedgerConfig {
        server_config: conf_path.clone(),
        params_file: dir.path().join("params"),
        data_dir: dir.path().join("data"),
        ..LedgerConfig::default()
    };
    let runtime = Arc::new(FakeRuntime::default());
    let coordinator = LifecycleCoordinator::new(config, runtime.clone(), keygen).unwrap();

    Harness {
        _dir: dir,
        conf_path,
        runtime,
        coordinator,
    }
}

fn conf_text(h: &Harness) -> String {
    std::fs::read_to_string(&h.conf_path).unwrap()
}

#[test]
fn test_create_provisions_everything() {
    let h = harness();
    let provisioned = h
        .coordinator
        .create(
            "alice",
            NewUser {
                email: Some("alice@example.org".to_string()),
                contact_id: None,
            },
        )
        .unwrap();

    let record = &provisioned.record;
    assert_eq!(record.address, Ipv4Addr::new(10, 66, 66, 2));
    assert_eq!(record.status, UserStatus::Active);
    assert_eq!(record.peer_public_key, "pub-1");
    assert_eq!(record.expires_at - record.created_at, Duration::days(30));
    assert_eq!(provisioned.keys.private_key, "priv-1");

    let text = conf_text(&h);
    assert!(text.starts_with(SERVER_CONF));
    assert!(text.ends_with(
        "### Client alice\n[Peer]\nPublicKey = pub-1\nPresharedKey = psk-1\nAllowedIPs = 10.66.66.2/32\n"
    ));

    assert_eq!(h.coordinator.get("alice").unwrap(), *record);
    assert_eq!(
        h.runtime.calls(),
        vec![Call::Add("pub-1".to_string(), Ipv4Addr::new(10, 66, 66, 2))]
    );
}

#[test]
fn test_create_then_delete_archives() {
    let h = harness();
    h.coordinator.create("alice", NewUser::default()).unwrap();
    h.coordinator.expire("alice").unwrap();

    let archived = h.coordinator.delete("alice").unwrap();
    assert_eq!(archived.record.username, "alice");
    assert_eq!(archived.record.status, UserStatus::Expired);

    assert!(matches!(
        h.coordinator.get("alice"),
        Err(Error::NotFound { .. })
    ));
    let history = h.coordinator.archived(Some("alice")).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].removed_at, archived.removed_at);

    assert_eq!(conf_text(&h), SERVER_CONF);
    assert_eq!(
        h.runtime.calls().last(),
        Some(&Call::Remove("pub-1".to_string()))
    );
}

#[test]
fn test_duplicate_create() {
    let h = harness();
    h.coordinator.create("alice", NewUser::default()).unwrap();
    let err = h.coordinator.create("alice", NewUser::default()).unwrap_err();
    assert!(matches!(err, Error::DuplicateUser { ref username } if username == "alice"));

    assert_eq!(conf_text(&h).matches("### Client alice\n").count(), 1);
    let records = h
        .coordinator
        .list(ListFilter {
            include_inactive: true,
        })
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[test]
fn test_duplicate_of_config_only_marker() {
    let h = harness();
    let mut text = conf_text(&h);
    text.push_str("### Client bob\n[Peer]\nPublicKey = bobpub\nPresharedKey = bobpsk\nAllowedIPs = 10.66.66.2/32\n");
    std::fs::write(&h.conf_path, &text).unwrap();

    assert!(matches!(
        h.coordinator.create("bob", NewUser::default()),
        Err(Error::DuplicateUser { .. })
    ));
    assert_eq!(conf_text(&h), text);
}

#[test]
fn test_allocation_skips_config_and_ledger_leases() {
    let h = harness();
    let mut text = conf_text(&h);
    text.push_str("### Client legacy\n[Peer]\nPublicKey = legacypub\nPresharedKey = legacypsk\nAllowedIPs = 10.66.66.2/32\n");
    std::fs::write(&h.conf_path, text).unwrap();

    let a = h.coordinator.create("alice", NewUser::default()).unwrap();
    let b = h.coordinator.create("bob", NewUser::default()).unwrap();
    assert_eq!(a.record.address, Ipv4Addr::new(10, 66, 66, 3));
    assert_eq!(b.record.address, Ipv4Addr::new(10, 66, 66, 4));
}

#[test]
fn test_address_reused_after_delete() {
    let h = harness();
    h.coordinator.create("alice", NewUser::default()).unwrap();
    h.coordinator.create("bob", NewUser::default()).unwrap();
    h.coordinator.delete("alice").unwrap();

    let carol = h.coordinator.create("carol", NewUser::default()).unwrap();
    assert_eq!(carol.record.address, Ipv4Addr::new(10, 66, 66, 2));
}

#[test]
fn test_invalid_username_touches_nothing() {
    let h = harness();
    for name in ["", "Client", "bad name", "a/b"] {
        assert!(matches!(
            h.coordinator.create(name, NewUser::default()),
            Err(Error::InvalidUsername { .. })
        ));
    }
    assert_eq!(conf_text(&h), SERVER_CONF);
    assert!(h.runtime.calls().is_empty());
}

#[test]
fn test_create_reports_runtime_failure_as_incomplete() {
    let h = harness();
    *h.runtime.fail_add.lock() = true;

    let err = h.coordinator.create("alice", NewUser::default()).unwrap_err();
    match &err {
        Error::Incomplete {
            operation,
            failed,
            completed,
            ..
        } => {
            assert_eq!(*operation, "create");
            assert_eq!(*failed, LifecycleStep::RuntimeAdd);
            assert_eq!(
                completed,
                &vec![
                    LifecycleStep::AllocateAddress,
                    LifecycleStep::GenerateKeys,
                    LifecycleStep::InsertBlock,
                    LifecycleStep::CreateRecord,
                ]
            );
        }
        other => panic!("expected Incomplete, got {:?}", other),
    }
    assert!(err.is_partial());
    assert!(matches!(err.root(), Error::RuntimeCommand { .. }));

    // Config block and record stay for manual reconciliation
    assert!(h.coordinator.get("alice").is_ok());
    assert!(conf_text(&h).contains("### Client alice\n"));
}

#[test]
fn test_create_ledger_failure_leaves_orphan_block() {
    let keygen = Arc::new(BlockLedgerOnGenerate {
        keys: SequentialKeys::default(),
        records_path: Mutex::new(None),
    });
    let h = harness_with(keygen.clone(), None);
    let records_path = h.coordinator.config().records_path();
    *keygen.records_path.lock() = Some(records_path.clone());

    let err = h.coordinator.create("alice", NewUser::default()).unwrap_err();
    match &err {
        Error::Incomplete {
            operation,
            failed,
            completed,
            ..
        } => {
            assert_eq!(*operation, "create");
            assert_eq!(*failed, LifecycleStep::CreateRecord);
            assert_eq!(
                completed,
                &vec![
                    LifecycleStep::AllocateAddress,
                    LifecycleStep::GenerateKeys,
                    LifecycleStep::InsertBlock,
                ]
            );
        }
        other => panic!("expected Incomplete, got {:?}", other),
    }
    assert!(matches!(err.root(), Error::Persistence { .. }));
    assert!(h.runtime.calls().is_empty());

    // The block stays behind and shows up once the ledger is readable again
    assert!(conf_text(&h).contains("### Client alice\n"));
    std::fs::remove_dir(&records_path).unwrap();
    assert_eq!(
        h.coordinator.audit().unwrap(),
        vec![wgledger_common::Inconsistency::OrphanBlock {
            username: "alice".to_string()
        }]
    );
}

#[test]
fn test_create_config_write_failure_touches_nothing() {
    // Readable, but no file can be created next to it
    let server_config = PathBuf::from("/proc/version");
    if !server_config.is_file() {
        return;
    }
    let h = harness_with(Arc::new(SequentialKeys::default()), Some(server_config));

    let err = h.coordinator.create("alice", NewUser::default()).unwrap_err();
    assert!(matches!(err, Error::ConfigWrite { .. }), "got {:?}", err);
    assert!(!err.is_partial());
    assert!(!h.coordinator.config().records_path().exists());
    assert!(h
        .coordinator
        .list(ListFilter {
            include_inactive: true
        })
        .unwrap()
        .is_empty());
    assert!(h.runtime.calls().is_empty());
}

#[test]
fn test_delete_missing_user_is_not_found() {
    let h = harness();
    let err = h.coordinator.delete("ghost").unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert!(!err.is_partial());
    assert!(h.runtime.calls().is_empty());
    assert_eq!(conf_text(&h), SERVER_CONF);
}

#[test]
fn test_delete_runtime_failure_changes_nothing() {
    let h = harness();
    h.coordinator.create("alice", NewUser::default()).unwrap();
    let before = conf_text(&h);
    *h.runtime.fail_remove.lock() = true;

    let err = h.coordinator.delete("alice").unwrap_err();
    assert!(matches!(err, Error::RuntimeCommand { .. }));
    assert_eq!(conf_text(&h), before);
    assert!(h.coordinator.get("alice").is_ok());
}

#[test]
fn test_delete_without_ledger_record_is_incomplete() {
    let h = harness();
    let mut text = conf_text(&h);
    text.push_str("### Client orphan\n[Peer]\nPublicKey = orphanpub\nPresharedKey = orphanpsk\nAllowedIPs = 10.66.66.9/32\n");
    std::fs::write(&h.conf_path, text).unwrap();

    let err = h.coordinator.delete("orphan").unwrap_err();
    match err {
        Error::Incomplete {
            failed, completed, ..
        } => {
            assert_eq!(failed, LifecycleStep::ArchiveRecord);
            assert_eq!(
                completed,
                vec![
                    LifecycleStep::FindPublicKey,
                    LifecycleStep::RuntimeRemove,
                    LifecycleStep::RemoveBlock,
                ]
            );
        }
        other => panic!("expected Incomplete, got {:?}", other),
    }
    assert_eq!(conf_text(&h), SERVER_CONF);
}

#[test]
fn test_extend_and_reset() {
    let h = harness();
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    h.coordinator
        .create_at("alice", NewUser::default(), now)
        .unwrap();

    // Still valid: extension stacks on the current expiry
    let record = h.coordinator.extend_at("alice", 10, now).unwrap();
    assert_eq!(record.expires_at, now + Duration::days(40));

    // Lapsed: extension counts from now and reactivates
    let later = now + Duration::days(100);
    assert_eq!(h.coordinator.mark_expired(later).unwrap(), vec!["alice".to_string()]);
    assert_eq!(
        h.coordinator.check_expiry("alice", later).unwrap(),
        ExpiryState::Expired
    );
    let record = h.coordinator.extend_at("alice", 7, later).unwrap();
    assert_eq!(record.expires_at, later + Duration::days(7));
    assert_eq!(record.status, UserStatus::Active);

    let record = h.coordinator.reset_expiry_at("alice", later).unwrap();
    assert_eq!(record.expires_at, later + Duration::days(30));

    assert!(h.coordinator.extend_at("alice", 0, later).is_err());
    assert!(matches!(
        h.coordinator.extend_at("ghost", 5, later),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn test_extend_out_of_range_is_rejected() {
    let h = harness();
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let before = h
        .coordinator
        .create_at("alice", NewUser::default(), now)
        .unwrap()
        .record;

    for days in [10_000_000_000, i64::MAX] {
        let err = h.coordinator.extend_at("alice", days, now).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "got {:?}", err);
    }
    assert_eq!(h.coordinator.get("alice").unwrap(), before);

    // The lock is released, so later writes still go through
    let record = h.coordinator.extend_at("alice", 1, now).unwrap();
    assert_eq!(record.expires_at, now + Duration::days(31));
}

#[test]
fn test_mark_expired_is_idempotent() {
    let h = harness();
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    h.coordinator.create_at("alice", NewUser::default(), now).unwrap();
    h.coordinator
        .create_at("bob", NewUser::default(), now + Duration::days(20))
        .unwrap();

    let at = now + Duration::days(31);
    assert_eq!(h.coordinator.mark_expired(at).unwrap(), vec!["alice".to_string()]);
    assert!(h.coordinator.mark_expired(at).unwrap().is_empty());
    assert_eq!(h.coordinator.get("bob").unwrap().status, UserStatus::Active);
}

#[test]
fn test_refresh_stats() {
    let h = harness();
    h.coordinator.create("alice", NewUser::default()).unwrap();
    h.coordinator.create("bob", NewUser::default()).unwrap();

    *h.runtime.peers.lock() = vec![
        PeerSnapshot {
            public_key: "pub-1".to_string(),
            received: 500,
            sent: 200,
            last_handshake: Some(Utc::now()),
            endpoint: Some("198.51.100.4:41000".to_string()),
        },
        PeerSnapshot {
            public_key: "unknown".to_string(),
            received: 1,
            sent: 1,
            last_handshake: None,
            endpoint: None,
        },
    ];
    let report = h.coordinator.refresh_stats().unwrap();
    assert_eq!(report.updated, vec!["alice".to_string()]);
    assert_eq!(report.missing, vec!["bob".to_string()]);
    assert_eq!(report.stale_keys, vec!["unknown".to_string()]);

    // Daemon restart: counters drop, so the reading is added
    h.runtime.peers.lock()[0].received = 10;
    h.runtime.peers.lock()[0].sent = 5;
    h.coordinator.refresh_stats().unwrap();

    let alice = h.coordinator.traffic().get("alice").unwrap().unwrap();
    assert_eq!(alice.cumulative_received, 510);
    assert_eq!(alice.cumulative_sent, 205);
    assert_eq!(alice.status, ConnectionStatus::Active);
    assert_eq!(alice.allowed_ips.as_deref(), Some("10.66.66.2/32"));
    assert_eq!(alice.endpoints, vec!["198.51.100.4:41000".to_string()]);

    let bob = h.coordinator.traffic().get("bob").unwrap().unwrap();
    assert_eq!(bob.status, ConnectionStatus::Inactive);
    assert_eq!(bob.cumulative_received, 0);
}

#[test]
fn test_refresh_stats_sets_connection_state() {
    let h = harness();
    h.coordinator.create("alice", NewUser::default()).unwrap();
    h.coordinator.create("bob", NewUser::default()).unwrap();
    h.coordinator.expire("bob").unwrap();

    *h.runtime.peers.lock() = vec![PeerSnapshot {
        public_key: "pub-1".to_string(),
        received: 0,
        sent: 0,
        last_handshake: None,
        endpoint: None,
    }];
    h.coordinator.refresh_stats().unwrap();

    assert_eq!(h.coordinator.get("alice").unwrap().status, UserStatus::Inactive);
    // Expiry wins over connection state
    assert_eq!(h.coordinator.get("bob").unwrap().status, UserStatus::Expired);
    let listed: Vec<String> = h
        .coordinator
        .list(ListFilter::default())
        .unwrap()
        .into_iter()
        .map(|r| r.username)
        .collect();
    assert_eq!(listed, vec!["bob".to_string()]);
    assert_eq!(
        h.coordinator
            .list(ListFilter {
                include_inactive: true
            })
            .unwrap()
            .len(),
        2
    );

    h.runtime.peers.lock()[0].last_handshake = Some(Utc::now());
    h.coordinator.refresh_stats().unwrap();
    assert_eq!(h.coordinator.get("alice").unwrap().status, UserStatus::Active);
}

#[test]
fn test_audit_reports_drift() {
    let h = harness();
    h.coordinator.create("alice", NewUser::default()).unwrap();
    assert!(h.coordinator.audit().unwrap().is_empty());

    let mut text = conf_text(&h);
    text.push_str("### Client orphan\n[Peer]\nPublicKey = orphanpub\nPresharedKey = orphanpsk\nAllowedIPs = 10.66.66.9/32\n");
    std::fs::write(&h.conf_path, text).unwrap();

    let found = h.coordinator.audit().unwrap();
    assert_eq!(
        found,
        vec![wgledger_common::Inconsistency::OrphanBlock {
            username: "orphan".to_string()
        }]
    );
}

#[test]
fn test_concurrent_creates_get_distinct_addresses() {
    let h = Arc::new(harness());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let h = h.clone();
            std::thread::spawn(move || {
                h.coordinator
                    .create(&format!("user{}", i), NewUser::default())
                    .unwrap()
                    .record
                    .address
            })
        })
        .collect();

    let mut addresses: Vec<Ipv4Addr> = handles.into_iter().map(|t| t.join().unwrap()).collect();
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 8);
    assert_eq!(conf_text(&h).matches("### Client ").count(), 8);
}
