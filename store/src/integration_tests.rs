use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;
use uuid::Uuid;

use crate::domain::{
    CooldownAdapter, CooldownTable, GameOutcome, GameStatsAdapter, GameStatsTable,
    IdentityAdapter, IdentityRegistry, PaymentAdapter, PaymentLedger, PaymentStatus,
    PlayStatistics, ReputationAdapter, ReputationBook, StatisticsAdapter,
};
use crate::{
    Backend, DualModeStore, ImportStatus, LegacyImporter, StorageConfig, StorageEngine,
    StoreAdapter, StoreHandle,
};

fn ts(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, day)
        .unwrap()
        .and_hms_opt(hour, 15, 0)
        .unwrap()
}

fn handle(dir: &TempDir, database: bool) -> StoreHandle {
    let config = StorageConfig::in_dir(dir.path()).with_database_enabled(database);
    let engine = Arc::new(StorageEngine::new(
        config.database_path(),
        config.engine_tuning(),
    ));
    if database {
        assert!(engine.initialize());
    }
    StoreHandle::new(engine, &config)
}

/// Save `state` and load it back on each backend in turn.
fn assert_roundtrip<A>(adapter: A, state: A::State)
where
    A: StoreAdapter + Clone,
    A::State: PartialEq + Debug,
{
    for (database, expected) in [(true, Backend::Relational), (false, Backend::FlatFile)] {
        let dir = TempDir::new().unwrap();
        let store = DualModeStore::new(adapter.clone(), handle(&dir, database));
        assert_eq!(store.active_backend(), expected);
        assert_eq!(store.save(&state).unwrap(), expected);
        assert_eq!(store.load(), state, "{} via {expected}", A::NAME);
        assert_eq!(store.file_path().exists(), !database);
    }
}

fn sample_identities() -> IdentityRegistry {
    let mut registry = IdentityRegistry::default();
    registry.link("100", "Alice", ts(1, 9)).unwrap();
    registry.set_gender("100", Some("f".to_string()));
    registry.link("200", "Bob", ts(2, 9)).unwrap();
    registry.unlink("200");
    registry.link("300", "bob", ts(3, 9)).unwrap();
    registry.set_hidden("Carol", true);
    registry.set_blacklisted("400", true);
    registry.set_whitelisted("100", true);
    registry
}

fn sample_reputation() -> ReputationBook {
    let mut book = ReputationBook::default();
    book.record("Alice", "bob", true, None, ts(1, 10));
    book.record("alice", "carol", false, Some("griefing".to_string()), ts(1, 11));
    book.record("alice", "bob", true, None, ts(2, 10));
    book.record("Dave", "alice", true, None, ts(3, 10));
    book
}

fn sample_statistics() -> PlayStatistics {
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let mut stats = PlayStatistics::default();
    stats.record_join(a, "alice", ts(1, 8));
    stats.record_join(b, "bob", ts(1, 9));
    stats.record_join(a, "alice", ts(2, 8));
    stats.add_playtime(a, ts(1, 0).date(), 90);
    stats.add_playtime(b, ts(1, 0).date(), 15);
    stats
}

fn sample_cooldowns() -> CooldownTable {
    let mut table = CooldownTable::default();
    table.touch("reputation", "alice", ts(1, 12));
    table.touch("daily", "alice", ts(1, 0));
    table.touch("daily", "bob", ts(2, 0));
    table
}

fn sample_payments() -> PaymentLedger {
    let mut ledger = PaymentLedger::default();
    ledger.record("alice", "bob", 12.5, PaymentStatus::Completed, ts(1, 14));
    ledger.record("bob", "carol", 3.0, PaymentStatus::Refunded, ts(2, 14));
    ledger
}

#[test]
fn test_identity_roundtrip_both_backends() {
    assert_roundtrip(IdentityAdapter, sample_identities());
}

#[test]
fn test_reputation_roundtrip_both_backends() {
    assert_roundtrip(ReputationAdapter, sample_reputation());
}

#[test]
fn test_statistics_roundtrip_both_backends() {
    assert_roundtrip(StatisticsAdapter, sample_statistics());
}

#[test]
fn test_game_stats_roundtrip_both_backends() {
    let mut table = GameStatsTable::default();
    table.record_game("100", GameOutcome::Win, 40, Duration::from_secs(120));
    table.record_game("200", GameOutcome::Loss, -5, Duration::from_secs(60));
    assert_roundtrip(GameStatsAdapter, table);
}

#[test]
fn test_cooldowns_roundtrip_both_backends() {
    assert_roundtrip(CooldownAdapter, sample_cooldowns());
}

#[test]
fn test_payments_roundtrip_both_backends() {
    assert_roundtrip(PaymentAdapter, sample_payments());
}

#[test]
fn test_overwrite_save_removes_dropped_entries() {
    let dir = TempDir::new().unwrap();
    let store = DualModeStore::new(ReputationAdapter, handle(&dir, true));
    let mut book = sample_reputation();
    store.save(&book).unwrap();

    book.reset("alice");
    store.save(&book).unwrap();
    let loaded = store.load();
    assert!(loaded.get("alice").is_none());
    assert_eq!(loaded, book);

    // The history rows went with their parent.
    let orphans: i64 = store
        .handle()
        .engine()
        .query_row(
            "SELECT COUNT(*) FROM reputation_history WHERE player_name = 'alice'",
            &[],
            |row| row.get(0),
        )
        .flatten()
        .unwrap();
    assert_eq!(orphans, 0);
}

#[test]
fn test_switching_backend_at_runtime() {
    let dir = TempDir::new().unwrap();
    let handle = handle(&dir, true);
    let store = DualModeStore::new(CooldownAdapter, handle.clone());

    handle.set_relational_enabled(false);
    assert_eq!(store.active_backend(), Backend::FlatFile);
    let table = sample_cooldowns();
    assert_eq!(store.save(&table).unwrap(), Backend::FlatFile);
    assert_eq!(store.load(), table);

    // The database never saw the write.
    handle.set_relational_enabled(true);
    assert_eq!(store.active_backend(), Backend::Relational);
    assert!(store.load().is_empty());
}

#[test]
fn test_missing_database_file_uses_flat_file() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig::in_dir(dir.path());
    let engine = Arc::new(StorageEngine::new(
        config.database_path(),
        config.engine_tuning(),
    ));
    // Enabled in configuration, but never initialized.
    let store = DualModeStore::new(PaymentAdapter, StoreHandle::new(engine, &config));

    assert_eq!(store.active_backend(), Backend::FlatFile);
    assert_eq!(store.save(&sample_payments()).unwrap(), Backend::FlatFile);
    assert_eq!(store.load().len(), 2);
}

#[test]
fn test_relational_failure_falls_back_within_the_call() {
    let dir = TempDir::new().unwrap();
    let store = DualModeStore::new(CooldownAdapter, handle(&dir, true));
    store
        .handle()
        .engine()
        .execute("DROP TABLE cooldowns", &[]);

    let table = sample_cooldowns();
    assert_eq!(store.active_backend(), Backend::Relational);
    assert_eq!(store.save(&table).unwrap(), Backend::FlatFile);
    assert!(store.file_path().exists());
    assert_eq!(store.load(), table);
}

#[test]
fn test_unreadable_file_loads_empty_state() {
    let dir = TempDir::new().unwrap();
    let store = DualModeStore::new(GameStatsAdapter, handle(&dir, false));
    std::fs::write(store.file_path(), "[ definitely not a map").unwrap();
    assert!(store.load().is_empty());
}

#[test]
fn test_concurrent_updates_are_not_lost() {
    for database in [true, false] {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DualModeStore::new(GameStatsAdapter, handle(&dir, database)));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let (_, saved) = store.update(|table| {
                            table.record_game("100", GameOutcome::Win, 1, Duration::from_secs(1))
                        });
                        saved.unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = *store.load().get("100").unwrap();
        assert_eq!(stats.games_played, 80);
        assert_eq!(stats.total_earned, 80);
    }
}

#[test]
fn test_imported_legacy_state_is_served_by_stores() {
    let dir = TempDir::new().unwrap();
    let flat = handle(&dir, false);

    // Files written by a host that ran without the database.
    DualModeStore::new(IdentityAdapter, flat.clone())
        .save(&sample_identities())
        .unwrap();
    DualModeStore::new(ReputationAdapter, flat.clone())
        .save(&sample_reputation())
        .unwrap();
    DualModeStore::new(CooldownAdapter, flat)
        .save(&sample_cooldowns())
        .unwrap();

    let relational = handle(&dir, true);
    let report = LegacyImporter::from_handle(&relational).run().unwrap();
    assert_eq!(report.status, ImportStatus::Imported);
    assert_eq!(report.groups.iter().filter(|g| g.present).count(), 3);

    assert_eq!(
        DualModeStore::new(IdentityAdapter, relational.clone()).load(),
        sample_identities()
    );
    assert_eq!(
        DualModeStore::new(ReputationAdapter, relational.clone()).load(),
        sample_reputation()
    );
    assert_eq!(
        DualModeStore::new(CooldownAdapter, relational).load(),
        sample_cooldowns()
    );
}

#[test]
fn test_same_second_reputation_events_roundtrip() {
    let mut book = ReputationBook::default();
    book.record("alice", "bob", true, None, ts(1, 12));
    book.record("alice", "bob", false, None, ts(1, 12));
    book.record("alice", "bob", false, None, ts(1, 12));
    assert_eq!(book.get("alice").unwrap().history.len(), 3);
    assert_roundtrip(ReputationAdapter, book);
}

#[test]
fn test_forced_reimport_keeps_names_claimed_since() {
    let dir = TempDir::new().unwrap();
    let mut legacy = IdentityRegistry::default();
    legacy.link("200", "Bob", ts(1, 9)).unwrap();
    DualModeStore::new(IdentityAdapter, handle(&dir, false))
        .save(&legacy)
        .unwrap();

    let relational = handle(&dir, true);
    let importer = LegacyImporter::from_handle(&relational);
    assert_eq!(importer.run().unwrap().status, ImportStatus::Imported);

    let store = DualModeStore::new(IdentityAdapter, relational);
    let mut registry = store.load();
    assert!(registry.unlink("200"));
    registry.link("300", "bob", ts(2, 9)).unwrap();
    store.save(&registry).unwrap();

    assert!(importer.reset_status());
    assert_eq!(importer.run().unwrap().status, ImportStatus::Imported);

    let loaded = store.load();
    assert_eq!(loaded, registry);
    assert_eq!(loaded.find_by_name("BOB").unwrap().external_id, "300");
    assert!(!loaded.get("200").unwrap().is_active());
}

#[test]
fn test_import_demotes_legacy_name_held_by_another_account() {
    let dir = TempDir::new().unwrap();
    let mut legacy = IdentityRegistry::default();
    legacy.link("200", "Bob", ts(1, 9)).unwrap();
    DualModeStore::new(IdentityAdapter, handle(&dir, false))
        .save(&legacy)
        .unwrap();

    // The database already has an active "bob" before the first import.
    let relational = handle(&dir, true);
    let store = DualModeStore::new(IdentityAdapter, relational.clone());
    let mut current = IdentityRegistry::default();
    current.link("300", "bob", ts(2, 9)).unwrap();
    store.save(&current).unwrap();

    let report = LegacyImporter::from_handle(&relational).run().unwrap();
    assert_eq!(report.status, ImportStatus::Imported);

    let loaded = store.load();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.find_by_name("bob").unwrap().external_id, "300");
    assert!(!loaded.get("200").unwrap().is_active());
}

#[test]
fn test_forced_reimport_keeps_newer_game_totals() {
    let dir = TempDir::new().unwrap();
    let mut legacy = GameStatsTable::default();
    legacy.record_game("100", GameOutcome::Win, 10, Duration::from_secs(60));
    legacy.record_game("100", GameOutcome::Loss, 0, Duration::from_secs(60));
    DualModeStore::new(GameStatsAdapter, handle(&dir, false))
        .save(&legacy)
        .unwrap();

    let relational = handle(&dir, true);
    let importer = LegacyImporter::from_handle(&relational);
    importer.run().unwrap();

    let store = DualModeStore::new(GameStatsAdapter, relational);
    assert_eq!(store.load().get("100").unwrap().games_played, 2);
    let (after, saved) =
        store.update(|table| table.record_game("100", GameOutcome::Win, 5, Duration::ZERO));
    saved.unwrap();
    assert_eq!(after.games_played, 3);

    assert!(importer.reset_status());
    importer.run().unwrap();

    let stats = *store.load().get("100").unwrap();
    assert_eq!(stats, after);
}
