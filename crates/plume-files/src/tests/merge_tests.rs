use super::support::*;
use crate::error::FileError;
use crate::location::FileLocationSource;
use crate::store::{FileData, MetaStore};

#[tokio::test]
async fn merge_collapses_local_and_remote_discoveries() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness();
    let location = write_file(dir.path(), "a.bin", b"data!");
    let h1 = h
        .manager
        .register_local(location, owner(), 0, false, false)
        .await
        .unwrap();
    let h2 = h
        .manager
        .register_remote(
            remote(1),
            FileLocationSource::FromServer,
            owner(),
            5,
            5,
            "a.bin".into(),
        )
        .await
        .unwrap();

    let merged = h.manager.merge(h1, h2, false).await.unwrap();
    let view = h.manager.get_file_view(merged).unwrap();
    assert!(view.has_local_location());
    assert!(view.has_remote_location());
    assert_eq!(view.name(), "a.bin");

    // a download through the other handle short-circuits: bytes are local
    let rec = Recorder::new();
    h.manager.download(h2, Some(rec.clone()), 3).await.unwrap();
    assert_eq!(rec.events(), vec![CallbackEvent::DownloadOk(h2)]);
    assert!(h.load.downloads().await.is_empty());
}

#[tokio::test]
async fn conflicting_remotes_refuse_to_merge_without_no_sync() {
    let mut h = harness();
    let a = h
        .manager
        .register_remote(remote(1), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();
    let b = h
        .manager
        .register_remote(remote(2), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();

    assert_eq!(
        h.manager.merge(a, b, false).await,
        Err(FileError::CantShareOwnership)
    );
    assert_ne!(
        h.manager.get_file_view(a).unwrap().file_id(),
        h.manager.get_file_view(b).unwrap().file_id()
    );

    let merged = h.manager.merge(a, b, true).await.unwrap();
    let view = h.manager.get_file_view(merged).unwrap();
    assert_eq!(view.remote_location().unwrap().id, 1);
    let merged_file_id = view.file_id();

    // the losing remote vanished; registering it again makes a fresh node
    let c = h
        .manager
        .register_remote(remote(2), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();
    assert_ne!(
        h.manager.get_file_view(c).unwrap().file_id(),
        merged_file_id
    );
}

#[tokio::test]
async fn merge_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness();
    let location = write_file(dir.path(), "x.bin", b"xxxx");
    let a = h
        .manager
        .register_local(location, owner(), 0, false, false)
        .await
        .unwrap();
    let b = h
        .manager
        .register_remote(remote(4), FileLocationSource::FromServer, owner(), 4, 4, String::new())
        .await
        .unwrap();

    let first = h.manager.merge(a, b, false).await.unwrap();
    let second = h.manager.merge(a, b, false).await.unwrap();
    assert_eq!(first, second);
    let view = h.manager.get_file_view(first).unwrap();
    assert!(view.has_local_location());
    assert!(view.has_remote_location());
    assert_eq!(view.size(), 4);
}

#[tokio::test]
async fn merge_outcome_is_symmetric() {
    let dir = tempfile::tempdir().unwrap();

    let mut forward = harness();
    let mut reverse = harness();
    let location = write_file(dir.path(), "sym.bin", b"symmetry");

    let fa = forward
        .manager
        .register_local(location.clone(), owner(), 0, false, false)
        .await
        .unwrap();
    let fb = forward
        .manager
        .register_remote(remote(6), FileLocationSource::FromServer, owner(), 8, 8, "sym.bin".into())
        .await
        .unwrap();
    let ra = reverse
        .manager
        .register_local(location, owner(), 0, false, false)
        .await
        .unwrap();
    let rb = reverse
        .manager
        .register_remote(remote(6), FileLocationSource::FromServer, owner(), 8, 8, "sym.bin".into())
        .await
        .unwrap();

    let f = forward.manager.merge(fa, fb, false).await.unwrap();
    let r = reverse.manager.merge(rb, ra, false).await.unwrap();

    let fv = forward.manager.get_file_view(f).unwrap();
    let rv = reverse.manager.get_file_view(r).unwrap();
    assert_eq!(fv.size(), rv.size());
    assert_eq!(fv.name(), rv.name());
    assert_eq!(fv.local_location(), rv.local_location());
    assert_eq!(fv.remote_location(), rv.remote_location());
}

#[tokio::test]
async fn merge_takes_max_sizes_and_fills_missing_fields() {
    let mut h = harness();
    let a = h
        .manager
        .register_remote(remote(10), FileLocationSource::FromServer, owner(), 0, 10, String::new())
        .await
        .unwrap();
    let b = h
        .manager
        .register_file(
            FileData {
                size: 100,
                expected_size: 100,
                name: "big.bin".to_string(),
                ..FileData::default()
            },
            FileLocationSource::FromUser,
            false,
        )
        .await
        .unwrap();

    let merged = h.manager.merge(a, b, false).await.unwrap();
    let view = h.manager.get_file_view(merged).unwrap();
    assert_eq!(view.size(), 100);
    assert!(view.expected_size() >= 100);
    assert_eq!(view.name(), "big.bin");
    assert_eq!(view.remote_location().unwrap().id, 10);
}

#[tokio::test]
async fn merge_never_shrinks_the_size_estimate() {
    let mut h = harness();
    let a = h
        .manager
        .register_remote(remote(20), FileLocationSource::FromServer, owner(), 0, 500, String::new())
        .await
        .unwrap();
    let b = h
        .manager
        .register_file(
            FileData {
                expected_size: 50,
                ..FileData::default()
            },
            FileLocationSource::FromUser,
            false,
        )
        .await
        .unwrap();

    let merged = h.manager.merge(a, b, false).await.unwrap();
    assert_eq!(h.manager.get_file_view(merged).unwrap().expected_size(), 500);
}

#[tokio::test]
async fn merge_cancels_the_victims_queries_only() {
    let mut h = harness();
    let a = h
        .manager
        .register_remote(remote(11), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();
    let b = h
        .manager
        .register_remote(remote(12), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();
    h.manager.download(a, None, 4).await.unwrap();
    h.manager.download(b, None, 4).await.unwrap();
    let queries: Vec<_> = h
        .load
        .downloads()
        .await
        .iter()
        .map(|parts| parts.query_id)
        .collect();
    assert_eq!(queries.len(), 2);

    let merged = h.manager.merge(a, b, true).await.unwrap();
    let cancelled = h.load.cancelled().await;
    assert!(cancelled.contains(&queries[1]));
    assert!(!cancelled.contains(&queries[0]));
    assert!(h.manager.get_file_view(merged).unwrap().is_downloading());
    assert_eq!(h.load.downloads().await.len(), 2);
}

#[tokio::test]
async fn merge_inherits_the_record_and_erases_the_victims() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness();
    let loc_a = write_file(dir.path(), "one.bin", b"one");
    let loc_b = write_file(dir.path(), "two.bin", b"two");
    let a = h
        .manager
        .register_local(loc_a.clone(), owner(), 0, false, false)
        .await
        .unwrap();
    let b = h
        .manager
        .register_local(loc_b.clone(), owner(), 0, false, false)
        .await
        .unwrap();
    assert_eq!(h.store.put_count().await, 2);

    let merged = h.manager.merge(a, b, true).await.unwrap();
    assert_eq!(h.store.erase_count().await, 1);
    assert!(h.store.get_by_local(&loc_b).await.unwrap().is_none());
    let (_, record) = h.store.get_by_local(&loc_a).await.unwrap().unwrap();
    assert_eq!(record.size, 3);
    assert_eq!(
        h.manager.get_file_view(merged).unwrap().local_location(),
        Some(&loc_a)
    );
}

#[tokio::test]
async fn every_alias_of_a_remote_resolves_to_one_node() {
    let mut h = harness();
    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(
            h.manager
                .register_remote(
                    remote(42),
                    FileLocationSource::FromServer,
                    owner(),
                    0,
                    0,
                    String::new(),
                )
                .await
                .unwrap(),
        );
    }
    let main = h.manager.get_file_view(handles[0]).unwrap().file_id();
    for handle in handles {
        assert_eq!(h.manager.get_file_view(handle).unwrap().file_id(), main);
        assert_eq!(
            h.manager
                .get_file_view(handle)
                .unwrap()
                .remote_location()
                .unwrap()
                .id,
            42
        );
    }
    // the persistent-id export goes through the same index
    assert!(h.manager.to_persistent_id(main).is_ok());
}
