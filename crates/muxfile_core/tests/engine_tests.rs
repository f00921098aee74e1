//! End-to-end tests for the storage engine.

use muxfile_core::{Config, EngineError, SeekOrigin, Storage, StreamId};
use tempfile::tempdir;

fn id(byte: u8) -> StreamId {
    StreamId::from_bytes([byte; 16])
}

#[test]
fn create_write_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.mux");
    let a = id(0xA1);
    let payload: Vec<u8> = (0u8..10).collect();

    {
        let storage = Storage::open(&path).unwrap();
        let mut stream = storage.create_stream(a, 7).unwrap();
        stream.write(&payload).unwrap();
        stream.close().unwrap();
        storage.close().unwrap();
    }

    let storage = Storage::open(&path).unwrap();
    let mut stream = storage.open_stream(a).unwrap();
    assert_eq!(stream.length().unwrap(), 10);
    assert_eq!(stream.tag().unwrap(), 7);

    let mut buf = [0u8; 10];
    assert_eq!(stream.read(&mut buf).unwrap(), 10);
    assert_eq!(&buf[..], &payload[..]);
    storage.verify_integrity().unwrap();
}

#[test]
fn grow_beyond_initialized_reads_zeros() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0xB2), 0).unwrap();

    stream.set_length(2048).unwrap();
    stream.seek(1000, SeekOrigin::Begin).unwrap();
    stream.write(&[0xFF; 4]).unwrap();

    stream.seek(0, SeekOrigin::Begin).unwrap();
    let mut buf = vec![0x55u8; 2048];
    assert_eq!(stream.read(&mut buf).unwrap(), 2048);

    assert!(buf[..1000].iter().all(|&b| b == 0x00));
    assert!(buf[1000..1004].iter().all(|&b| b == 0xFF));
    assert!(buf[1004..].iter().all(|&b| b == 0x00));
    storage.verify_integrity().unwrap();
}

#[test]
fn delete_reclaims_space() {
    let storage = Storage::open_in_memory().unwrap();
    let payload = vec![0xCDu8; 4096];

    let mut c = storage.create_stream(id(0xC3), 0).unwrap();
    c.write(&payload).unwrap();
    c.close().unwrap();
    let file_length = storage.stats().unwrap().file_length;

    storage.delete_stream(id(0xC3)).unwrap();

    let mut d = storage.create_stream(id(0xD4), 0).unwrap();
    d.write(&payload).unwrap();
    d.close().unwrap();

    // The second stream reused the freed space; the file did not grow.
    assert_eq!(storage.stats().unwrap().file_length, file_length);
    storage.verify_integrity().unwrap();
}

#[test]
fn small_request_takes_whole_free_segment() {
    let storage = Storage::open_in_memory().unwrap();

    // Put exactly one block into free space.
    let mut x = storage.create_stream(id(0x01), 0).unwrap();
    x.set_length(8).unwrap();
    x.close().unwrap();
    storage.delete_stream(id(0x01)).unwrap();
    let stats = storage.stats().unwrap();
    assert_eq!(stats.free_bytes, 492);
    let file_length = stats.file_length;

    // Eight bytes of growth cannot split a single block; the whole
    // segment is taken and free space runs dry.
    let mut f = storage.create_stream(id(0xF5), 0).unwrap();
    f.write(&[1u8; 8]).unwrap();
    let stats = storage.stats().unwrap();
    assert_eq!(stats.free_bytes, 0);
    assert_eq!(stats.file_length, file_length);

    // The next growth has to extend the file.
    let mut g = storage.create_stream(id(0x06), 0).unwrap();
    g.write(&[2u8; 8]).unwrap();
    assert!(storage.stats().unwrap().file_length > file_length);
    storage.verify_integrity().unwrap();
}

#[test]
fn deleting_neighbors_coalesces_free_space() {
    let storage = Storage::open_in_memory().unwrap();

    let g = id(0x07);
    let h = id(0x08);
    let mut gs = storage.create_stream(g, 0).unwrap();
    let mut hs = storage.create_stream(h, 0).unwrap();
    gs.write(&[0xAA; 1024]).unwrap();
    hs.write(&[0xBB; 1024]).unwrap();
    gs.close().unwrap();
    hs.close().unwrap();

    // Each stream took one three-block segment (1536 bytes, 1516 of data).
    storage.delete_stream(g).unwrap();
    assert_eq!(storage.stats().unwrap().free_bytes, 1516);

    // Deleting the neighbor merges the two segments; the absorbed header
    // becomes free capacity, so the total is more than twice one segment.
    storage.delete_stream(h).unwrap();
    assert_eq!(storage.stats().unwrap().free_bytes, 3052);
    storage.verify_integrity().unwrap();
}

#[test]
fn rollback_restores_pretransaction_state() {
    let storage = Storage::open_in_memory().unwrap();
    let e = id(0xE5);
    let mut stream = storage.create_stream(e, 0).unwrap();
    assert_eq!(stream.length().unwrap(), 0);

    let tx = storage.begin_transaction().unwrap();
    stream.write(&[9u8; 10]).unwrap();
    assert_eq!(stream.length().unwrap(), 10);
    let file_length = storage.stats().unwrap().file_length;
    tx.rollback().unwrap();

    // The file reverted entirely: length, free space, and the growth.
    assert_eq!(stream.length().unwrap(), 0);
    let stats = storage.stats().unwrap();
    assert_eq!(stats.free_bytes, 0);
    assert!(stats.file_length < file_length);
    storage.verify_integrity().unwrap();
}

#[test]
fn dropping_transaction_rolls_back() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x11), 0).unwrap();

    {
        let _tx = storage.begin_transaction().unwrap();
        stream.write(b"doomed").unwrap();
    }

    assert_eq!(stream.length().unwrap(), 0);
}

#[test]
fn inner_rollback_fails_outer_commit() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x12), 0).unwrap();

    let outer = storage.begin_transaction().unwrap();
    stream.write(b"abc").unwrap();

    let inner = storage.begin_transaction().unwrap();
    inner.rollback().unwrap();

    assert!(matches!(
        outer.commit(),
        Err(EngineError::TransactionConflict)
    ));
    assert_eq!(stream.length().unwrap(), 0);
    storage.verify_integrity().unwrap();
}

#[test]
fn nested_commits_flatten() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x13), 0).unwrap();

    let outer = storage.begin_transaction().unwrap();
    let inner = storage.begin_transaction().unwrap();
    stream.write(b"kept").unwrap();
    inner.commit().unwrap();
    outer.commit().unwrap();

    assert_eq!(stream.length().unwrap(), 4);
}

#[test]
fn stream_created_inside_rolled_back_transaction_vanishes() {
    let storage = Storage::open_in_memory().unwrap();
    let q = id(0x14);

    let tx = storage.begin_transaction().unwrap();
    let mut stream = storage.create_stream(q, 3).unwrap();
    tx.rollback().unwrap();

    assert!(!storage.contains_stream(q).unwrap());
    assert!(matches!(
        stream.write(b"x"),
        Err(EngineError::StreamClosed)
    ));
    storage.verify_integrity().unwrap();
}

#[test]
fn transaction_closure_commits_and_rolls_back() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x15), 0).unwrap();

    storage
        .transaction(|_| {
            stream.write(b"12345")?;
            Ok(())
        })
        .unwrap();
    assert_eq!(stream.length().unwrap(), 5);

    let result: Result<(), EngineError> = storage.transaction(|_| {
        stream.write(b"67890")?;
        Err(EngineError::out_of_bounds("forced failure"))
    });
    assert!(result.is_err());
    assert_eq!(stream.length().unwrap(), 5);
}

#[test]
fn duplicate_and_missing_streams_are_rejected() {
    let storage = Storage::open_in_memory().unwrap();
    let a = id(0x21);

    storage.create_stream(a, 0).unwrap();
    assert!(matches!(
        storage.create_stream(a, 1),
        Err(EngineError::DuplicateStream { .. })
    ));
    assert!(matches!(
        storage.open_stream(id(0x22)),
        Err(EngineError::NoSuchStream { .. })
    ));
    assert!(matches!(
        storage.delete_stream(id(0x22)),
        Err(EngineError::NoSuchStream { .. })
    ));
}

#[test]
fn reserved_ids_are_inaccessible() {
    let storage = Storage::open_in_memory().unwrap();

    assert!(matches!(
        storage.create_stream(StreamId::EMPTY_SPACE, 0),
        Err(EngineError::DuplicateStream { .. })
    ));
    assert!(matches!(
        storage.create_stream(StreamId::STREAM_TABLE, 0),
        Err(EngineError::DuplicateStream { .. })
    ));
    assert!(matches!(
        storage.open_stream(StreamId::EMPTY_SPACE),
        Err(EngineError::NoSuchStream { .. })
    ));
    assert!(matches!(
        storage.delete_stream(StreamId::STREAM_TABLE),
        Err(EngineError::NoSuchStream { .. })
    ));
}

#[test]
fn closing_a_stream_twice_fails() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x31), 0).unwrap();
    stream.write(b"data").unwrap();

    stream.close().unwrap();
    assert!(matches!(stream.close(), Err(EngineError::StreamClosed)));
    assert!(matches!(
        stream.read(&mut [0u8; 4]),
        Err(EngineError::StreamClosed)
    ));

    // The stream itself survived; only the cursor is gone.
    let mut reopened = storage.open_stream(id(0x31)).unwrap();
    let mut buf = [0u8; 4];
    reopened.read(&mut buf).unwrap();
    assert_eq!(&buf, b"data");
}

#[test]
fn deleting_a_stream_closes_its_cursors() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x32), 0).unwrap();
    stream.write(b"gone soon").unwrap();

    storage.delete_stream(id(0x32)).unwrap();
    assert!(matches!(
        stream.read(&mut [0u8; 4]),
        Err(EngineError::StreamClosed)
    ));
}

#[test]
fn closing_storage_closes_streams_and_is_not_idempotent() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x33), 0).unwrap();
    stream.write(b"x").unwrap();

    storage.close().unwrap();
    assert!(matches!(
        stream.write(b"y"),
        Err(EngineError::StreamClosed)
    ));
    assert!(matches!(storage.close(), Err(EngineError::StorageClosed)));
    assert!(matches!(
        storage.create_stream(id(0x34), 0),
        Err(EngineError::StorageClosed)
    ));
}

#[test]
fn seek_semantics() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x41), 0).unwrap();
    stream.write(&(0u8..10).collect::<Vec<_>>()).unwrap();

    assert_eq!(stream.seek(4, SeekOrigin::Begin).unwrap(), 4);
    assert_eq!(stream.seek(2, SeekOrigin::Current).unwrap(), 6);
    assert_eq!(stream.seek(-3, SeekOrigin::Current).unwrap(), 3);

    // Seeking from the end subtracts the offset.
    assert_eq!(stream.seek(2, SeekOrigin::End).unwrap(), 8);
    let mut buf = [0u8; 4];
    assert_eq!(stream.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], &[8, 9]);

    // A negative position is representable but unusable.
    assert_eq!(stream.seek(-5, SeekOrigin::Begin).unwrap(), -5);
    assert!(matches!(
        stream.read(&mut buf),
        Err(EngineError::OutOfBounds { .. })
    ));
    assert!(matches!(
        stream.write(b"no"),
        Err(EngineError::OutOfBounds { .. })
    ));
}

#[test]
fn read_past_end_returns_zero_bytes() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x42), 0).unwrap();
    stream.write(b"abc").unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);

    stream.seek(1, SeekOrigin::Begin).unwrap();
    assert_eq!(stream.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"bc");
}

#[test]
fn write_past_end_zero_fills_the_gap() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x43), 0).unwrap();

    stream.seek(100, SeekOrigin::Begin).unwrap();
    stream.write(b"tail").unwrap();
    assert_eq!(stream.length().unwrap(), 104);
    assert_eq!(stream.initialized_length().unwrap(), 104);

    stream.seek(0, SeekOrigin::Begin).unwrap();
    let mut buf = vec![0xEEu8; 104];
    assert_eq!(stream.read(&mut buf).unwrap(), 104);
    assert!(buf[..100].iter().all(|&b| b == 0));
    assert_eq!(&buf[100..], b"tail");
}

#[test]
fn shrink_clamps_initialized_length() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x44), 0).unwrap();
    stream.write(&[7u8; 3000]).unwrap();
    assert_eq!(stream.initialized_length().unwrap(), 3000);

    stream.set_length(1000).unwrap();
    assert_eq!(stream.length().unwrap(), 1000);
    assert_eq!(stream.initialized_length().unwrap(), 1000);

    // Growing back exposes zeros, not the old bytes.
    stream.set_length(3000).unwrap();
    stream.seek(1000, SeekOrigin::Begin).unwrap();
    let mut buf = vec![0x77u8; 2000];
    assert_eq!(stream.read(&mut buf).unwrap(), 2000);
    assert!(buf.iter().all(|&b| b == 0));
    storage.verify_integrity().unwrap();
}

#[test]
fn set_length_zero_releases_all_segments() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x45), 0).unwrap();
    stream.write(&[1u8; 4096]).unwrap();
    assert_eq!(storage.stats().unwrap().free_bytes, 0);

    stream.set_length(0).unwrap();
    assert_eq!(stream.length().unwrap(), 0);
    assert_eq!(stream.initialized_length().unwrap(), 0);
    assert!(storage.stats().unwrap().free_bytes > 0);
    storage.verify_integrity().unwrap();
}

#[test]
fn overwrite_round_trips() {
    let storage = Storage::open_in_memory().unwrap();
    let mut stream = storage.create_stream(id(0x46), 0).unwrap();

    let first: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
    stream.write(&first).unwrap();

    stream.seek(1234, SeekOrigin::Begin).unwrap();
    stream.write(b"patched").unwrap();

    stream.seek(0, SeekOrigin::Begin).unwrap();
    let mut buf = vec![0u8; 5000];
    assert_eq!(stream.read(&mut buf).unwrap(), 5000);
    assert_eq!(&buf[..1234], &first[..1234]);
    assert_eq!(&buf[1234..1241], b"patched");
    assert_eq!(&buf[1241..], &first[1241..]);
}

#[test]
fn many_streams_grow_the_table() {
    let storage = Storage::open_in_memory().unwrap();

    // One block of table holds eleven records; force several grows.
    let ids: Vec<StreamId> = (1u8..=40).map(id).collect();
    for (i, stream_id) in ids.iter().enumerate() {
        let mut stream = storage.create_stream(*stream_id, i as u32).unwrap();
        stream.write(format!("payload {i}").as_bytes()).unwrap();
    }

    assert_eq!(storage.stream_count().unwrap(), 40);
    let mut listed = storage.stream_ids().unwrap();
    listed.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(listed, expected);

    for (i, stream_id) in ids.iter().enumerate() {
        let mut stream = storage.open_stream(*stream_id).unwrap();
        assert_eq!(stream.tag().unwrap(), i as u32);
        let expected = format!("payload {i}");
        let mut buf = vec![0u8; expected.len()];
        assert_eq!(stream.read(&mut buf).unwrap(), expected.len());
        assert_eq!(buf, expected.as_bytes());
    }
    storage.verify_integrity().unwrap();
}

#[test]
fn table_slots_are_reused_after_delete() {
    let storage = Storage::open_in_memory().unwrap();
    let before = storage.stats().unwrap().file_length;

    for round in 0u8..30 {
        let stream_id = id(round.wrapping_add(1));
        storage.create_stream(stream_id, 0).unwrap();
        storage.delete_stream(stream_id).unwrap();
    }

    // Creating and deleting repeatedly reuses the same slot; the table
    // never grows.
    assert_eq!(storage.stats().unwrap().file_length, before);
}

#[test]
fn persistence_across_reopen_with_many_streams() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.mux");
    let ids: Vec<StreamId> = (1u8..=20).map(id).collect();

    {
        let storage = Storage::open(&path).unwrap();
        for (i, stream_id) in ids.iter().enumerate() {
            let mut stream = storage.create_stream(*stream_id, i as u32 * 3).unwrap();
            stream.write(vec![i as u8; 100 + i * 37].as_slice()).unwrap();
        }
        storage.close().unwrap();
    }

    let storage = Storage::open(&path).unwrap();
    storage.verify_integrity().unwrap();
    for (i, stream_id) in ids.iter().enumerate() {
        let mut stream = storage.open_stream(*stream_id).unwrap();
        assert_eq!(stream.tag().unwrap(), i as u32 * 3);
        let expected = vec![i as u8; 100 + i * 37];
        let mut buf = vec![0u8; expected.len() + 1];
        assert_eq!(stream.read(&mut buf).unwrap(), expected.len());
        assert_eq!(&buf[..expected.len()], expected.as_slice());
    }
}

#[test]
fn open_missing_file_without_create_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.mux");
    let config = Config::new().create_if_missing(false);

    assert!(matches!(
        Storage::open_with_config(&path, config),
        Err(EngineError::BadFormat { .. })
    ));
    assert!(!path.exists());
}

#[test]
fn open_rejects_foreign_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.bin");
    std::fs::write(&path, vec![0x42u8; 2048]).unwrap();

    assert!(matches!(
        Storage::open(&path),
        Err(EngineError::BadFormat { .. })
    ));
    // The file was not repaired or rewritten.
    assert_eq!(std::fs::read(&path).unwrap(), vec![0x42u8; 2048]);
}

#[test]
fn second_open_is_locked_out() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.mux");

    let storage = Storage::open(&path).unwrap();
    assert!(matches!(
        Storage::open(&path),
        Err(EngineError::StorageLocked)
    ));
    drop(storage);
}

#[test]
fn custom_block_size_is_persisted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.mux");

    {
        let storage =
            Storage::open_with_config(&path, Config::new().block_size(4096)).unwrap();
        let mut stream = storage.create_stream(id(0x51), 0).unwrap();
        stream.write(b"big blocks").unwrap();
        storage.close().unwrap();
    }

    // Reopening with the default configuration adopts the on-disk block size.
    let storage = Storage::open(&path).unwrap();
    assert_eq!(storage.stats().unwrap().block_size, 4096);
    let mut stream = storage.open_stream(id(0x51)).unwrap();
    let mut buf = [0u8; 10];
    stream.read(&mut buf).unwrap();
    assert_eq!(&buf, b"big blocks");
    storage.verify_integrity().unwrap();
}

#[test]
fn stats_track_the_file() {
    let storage = Storage::open_in_memory().unwrap();
    let stats = storage.stats().unwrap();
    assert_eq!(stats.block_size, 512);
    assert_eq!(stats.file_length, 1024);
    assert_eq!(stats.free_bytes, 0);
    assert_eq!(stats.stream_count, 0);

    let mut stream = storage.create_stream(id(0x61), 0).unwrap();
    stream.write(&[0u8; 100]).unwrap();
    let stats = storage.stats().unwrap();
    assert_eq!(stats.stream_count, 1);
    assert_eq!(stats.file_length, 1536);
}
