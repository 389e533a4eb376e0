//! MSF container round trips and atomic replacement on disk.

mod common;

use common::*;
use pecanon::domain::pdb::PdbFile;
use pecanon::services::PdbRewriter;

#[test]
fn msf_survives_a_disk_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("round.pdb");

    let pdb = build_pdb([0x42; 16], 3);
    pdb.write(&path).unwrap();

    let reread = PdbFile::read(&path).unwrap();
    assert_eq!(reread.stream_count(), pdb.stream_count());
    for index in 0..pdb.stream_count() {
        assert_eq!(reread.stream(index), pdb.stream(index), "stream {index}");
    }
}

#[test]
fn canonical_write_is_deterministic_on_disk() {
    let dir = tempfile::TempDir::new().unwrap();
    let first = dir.path().join("a.pdb");
    let second = dir.path().join("b.pdb");

    build_pdb([0x42; 16], 3).write(&first).unwrap();
    build_pdb([0x42; 16], 3).write(&second).unwrap();

    assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
}

#[test]
fn atomic_write_replaces_the_destination() {
    let dir = tempfile::TempDir::new().unwrap();
    let destination = dir.path().join("app.pdb");
    std::fs::write(&destination, b"stale contents").unwrap();

    let mut pdb = build_pdb([0x42; 16], 3);
    PdbRewriter::new().normalize(&mut pdb, [0xAB; 16]).unwrap();
    PdbRewriter::new().write_atomic(&pdb, &destination).unwrap();

    let written = PdbFile::read(&destination).unwrap();
    assert_eq!(written.stream(0), Some(&[][..]));

    // No temporary directories left behind.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path() != destination)
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
}

#[test]
fn nil_streams_pass_through() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nil.pdb");

    let pdb = PdbFile::with_streams(
        4096,
        vec![Some(vec![1, 2, 3]), None, Some(Vec::new())],
    );
    pdb.write(&path).unwrap();

    let reread = PdbFile::read(&path).unwrap();
    assert_eq!(reread.stream(0), Some(&[1u8, 2, 3][..]));
    assert_eq!(reread.stream(1), None);
    assert_eq!(reread.stream(2), Some(&[][..]));
}
