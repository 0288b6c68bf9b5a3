//! # Transaction Tests
//!
//! Read/write transaction semantics over one table and across several:
//! buffered writes stay private until commit, rollback discards, mode and
//! table-code misuse fail fast, and locks come and go in the caller's
//! order.

use std::sync::Arc;

use tempfile::tempdir;
use voledb::config::Settings;
use voledb::error::StoreError;
use voledb::storage::FreeList;
use voledb::{Database, Table};

fn settings() -> Settings {
    Settings {
        page_size: 1024,
        max_page: 512,
        ..Settings::default()
    }
}

#[test]
fn buffered_writes_are_invisible_until_commit() {
    let dir = tempdir().unwrap();
    let table = Table::open(dir.path().join("tx.vole"), &settings()).unwrap();

    let mut tx = table.new_write_tx();
    tx.put(b"BMW", b"X6").unwrap();

    // The transaction sees its own write; committed storage does not.
    assert_eq!(tx.find(b"BMW").unwrap(), Some(b"X6".to_vec()));
    assert_eq!(table.find(b"BMW").unwrap(), None);

    tx.commit().unwrap();
    assert_eq!(table.find(b"BMW").unwrap(), Some(b"X6".to_vec()));
    table.close().unwrap();
}

#[test]
fn most_recent_buffered_entry_wins_within_a_transaction() {
    let dir = tempdir().unwrap();
    let table = Table::open(dir.path().join("tx.vole"), &settings()).unwrap();
    table.put(b"BMW", b"X5").unwrap();

    let mut tx = table.new_write_tx();
    tx.put(b"BMW", b"X6").unwrap();
    tx.remove(b"BMW").unwrap();
    // The trailing remove shadows both the buffered put and storage.
    assert_eq!(tx.find(b"BMW").unwrap(), None);

    tx.put(b"BMW", b"X7").unwrap();
    assert_eq!(tx.find(b"BMW").unwrap(), Some(b"X7".to_vec()));

    tx.commit().unwrap();
    assert_eq!(table.find(b"BMW").unwrap(), Some(b"X7".to_vec()));
    table.close().unwrap();
}

#[test]
fn rollback_discards_buffered_writes() {
    let dir = tempdir().unwrap();
    let table = Table::open(dir.path().join("tx.vole"), &settings()).unwrap();
    table.put(b"BMW", b"X5").unwrap();

    let mut tx = table.new_write_tx();
    tx.put(b"BMW", b"X6").unwrap();
    tx.remove(b"Mercedes").unwrap();
    tx.rollback();

    assert_eq!(table.find(b"BMW").unwrap(), Some(b"X5".to_vec()));
    table.close().unwrap();
}

#[test]
fn dropping_a_transaction_releases_its_lock() {
    let dir = tempdir().unwrap();
    let table = Table::open(dir.path().join("tx.vole"), &settings()).unwrap();

    {
        let mut tx = table.new_write_tx();
        tx.put(b"abandoned", b"write").unwrap();
        // Dropped without commit: behaves as a rollback.
    }

    // The lock is free again and the write never happened.
    let tx = table.new_write_tx();
    assert_eq!(tx.find(b"abandoned").unwrap(), None);
    tx.commit().unwrap();
    table.close().unwrap();
}

#[test]
fn read_transaction_rejects_writes() {
    let dir = tempdir().unwrap();
    let table = Table::open(dir.path().join("tx.vole"), &settings()).unwrap();
    table.put(b"BMW", b"X6").unwrap();

    let mut tx = table.new_read_tx();
    assert_eq!(tx.find(b"BMW").unwrap(), Some(b"X6".to_vec()));

    let err = tx.put(b"BMW", b"X7").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::TransactionMisuse(_))
    ));
    let err = tx.remove(b"BMW").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::TransactionMisuse(_))
    ));
    tx.rollback();
    table.close().unwrap();
}

#[test]
fn concurrent_read_transactions_share_the_lock() {
    let dir = tempdir().unwrap();
    let table = Arc::new(Table::open(dir.path().join("tx.vole"), &settings()).unwrap());
    table.put(b"BMW", b"X6").unwrap();

    let first = table.new_read_tx();
    let second = table.new_read_tx();
    assert_eq!(first.find(b"BMW").unwrap(), Some(b"X6".to_vec()));
    assert_eq!(second.find(b"BMW").unwrap(), Some(b"X6".to_vec()));
    drop(first);
    drop(second);

    // With the readers gone a writer can proceed.
    let mut tx = table.new_write_tx();
    tx.put(b"BMW", b"X7").unwrap();
    tx.commit().unwrap();
    assert_eq!(table.find(b"BMW").unwrap(), Some(b"X7".to_vec()));
    table.close().unwrap();
}

#[test]
fn write_lock_excludes_other_writers() {
    let dir = tempdir().unwrap();
    let table = Arc::new(Table::open(dir.path().join("tx.vole"), &settings()).unwrap());

    let mut tx = table.new_write_tx();
    tx.put(b"from-first", b"1").unwrap();

    let contender = Arc::clone(&table);
    let handle = std::thread::spawn(move || {
        // Blocks until the first transaction closes.
        let mut tx = contender.new_write_tx();
        tx.put(b"from-second", b"2").unwrap();
        tx.commit().unwrap();
    });

    tx.commit().unwrap();
    handle.join().unwrap();

    assert_eq!(table.find(b"from-first").unwrap(), Some(b"1".to_vec()));
    assert_eq!(table.find(b"from-second").unwrap(), Some(b"2".to_vec()));
    table.close().unwrap();
}

#[test]
fn multi_table_transaction_commits_each_table() {
    let dir = tempdir().unwrap();
    let db = Database::open(
        &[
            ("cars", dir.path().join("cars.vole")),
            ("cities", dir.path().join("cities.vole")),
        ],
        &settings(),
    )
    .unwrap();

    let mut tx = db.new_write_tx(&["cars", "cities"]).unwrap();
    tx.put_in("cars", b"BMW", b"X6").unwrap();
    tx.put_in("cities", b"Munich", b"BMW HQ").unwrap();
    assert_eq!(tx.find_in("cars", b"BMW").unwrap(), Some(b"X6".to_vec()));

    let err = tx.put_in("planes", b"A380", b"Airbus").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::UnknownTable(_))
    ));

    tx.commit().unwrap();
    assert_eq!(db.find("cars", b"BMW").unwrap(), Some(b"X6".to_vec()));
    assert_eq!(db.find("cities", b"Munich").unwrap(), Some(b"BMW HQ".to_vec()));
    db.close().unwrap();
}

#[test]
fn multi_table_read_transaction_sees_committed_state() {
    let dir = tempdir().unwrap();
    let db = Database::open(
        &[
            ("cars", dir.path().join("cars.vole")),
            ("cities", dir.path().join("cities.vole")),
        ],
        &settings(),
    )
    .unwrap();
    db.put_str("cars", "BMW", "X6").unwrap();

    let mut tx = db.new_read_tx(&["cars", "cities"]).unwrap();
    assert_eq!(
        tx.find_in("cars", &voledb::str_key("BMW")).unwrap(),
        Some(b"X6".to_vec())
    );
    assert_eq!(tx.find_in("cities", b"anything").unwrap(), None);
    tx.rollback();
    db.close().unwrap();
}

#[test]
fn free_list_reuses_the_most_recent_release_first() {
    // The allocation contract the engine's page recycling rests on:
    // allocate 1..=5, release 3, and 3 comes back before 6.
    let mut list = FreeList::new(64);
    for expected in 1..=5 {
        assert_eq!(list.next_page().unwrap(), expected);
    }
    list.release_page(3);
    assert_eq!(list.next_page().unwrap(), 3);
    assert_eq!(list.next_page().unwrap(), 6);
}
