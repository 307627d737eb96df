//! Depdb tests: record comparison, invalidation, and the interrupted-
//! write discipline.

use cairn::depdb::{DepDb, checksum};
use pretty_assertions::assert_eq;

fn db_path(td: &tempfile::TempDir) -> std::path::PathBuf {
    td.path().join("target.d")
}

#[test]
fn fresh_db_starts_in_write_mode_on_first_expect() {
    let td = tempfile::tempdir().unwrap();
    let mut db = DepDb::open(db_path(&td)).unwrap();
    assert!(!db.expect("rule 1").unwrap(), "nothing stored yet");
    assert!(db.writing());
    db.write("input-a").unwrap();
    db.close().unwrap();

    let content = std::fs::read_to_string(db_path(&td)).unwrap();
    assert_eq!(content, "rule 1\ninput-a\n\n", "record ends with an empty line");
}

#[test]
fn matching_record_stays_in_read_mode() {
    let td = tempfile::tempdir().unwrap();
    {
        let mut db = DepDb::open(db_path(&td)).unwrap();
        db.expect("rule 1").unwrap();
        db.expect("abc").unwrap();
        db.close().unwrap();
    }
    let mut db = DepDb::open(db_path(&td)).unwrap();
    assert!(db.expect("rule 1").unwrap());
    assert!(db.expect("abc").unwrap());
    assert!(!db.writing(), "a fully matching record never switches to write");
    db.close().unwrap();
}

#[test]
fn mismatch_truncates_and_rewrites_the_tail() {
    let td = tempfile::tempdir().unwrap();
    {
        let mut db = DepDb::open(db_path(&td)).unwrap();
        db.expect("rule 1").unwrap();
        db.expect("old-hash").unwrap();
        db.expect("kept-below").unwrap();
        db.close().unwrap();
    }
    {
        let mut db = DepDb::open(db_path(&td)).unwrap();
        assert!(db.expect("rule 1").unwrap());
        assert!(!db.expect("new-hash").unwrap(), "mismatch detected");
        assert!(db.writing());
        db.write("tail").unwrap();
        db.close().unwrap();
    }
    let content = std::fs::read_to_string(db_path(&td)).unwrap();
    assert_eq!(content, "rule 1\nnew-hash\ntail\n\n");
}

#[test]
fn interrupted_write_poisons_the_record() {
    let td = tempfile::tempdir().unwrap();
    // A record without the empty-line terminator.
    std::fs::write(db_path(&td), "rule 1\ninput-a\n").unwrap();

    let mut db = DepDb::open(db_path(&td)).unwrap();
    assert!(db.writing(), "missing terminator forces regeneration");
    assert!(!db.expect("rule 1").unwrap());
    db.close().unwrap();
}

#[test]
fn shorter_previous_record_invalidates() {
    let td = tempfile::tempdir().unwrap();
    {
        let mut db = DepDb::open(db_path(&td)).unwrap();
        db.expect("rule 1").unwrap();
        db.close().unwrap();
    }
    let mut db = DepDb::open(db_path(&td)).unwrap();
    assert!(db.expect("rule 1").unwrap());
    assert!(!db.expect("extra-line").unwrap(), "record ran out");
    db.close().unwrap();
}

#[test]
fn checksum_is_order_sensitive_and_stable() {
    let a = checksum(["x", "y"]);
    let b = checksum(["x", "y"]);
    let c = checksum(["y", "x"]);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 64, "lowercase hex sha-256");
    assert!(a.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
}
