use super::support::*;
use crate::error::FileError;
use crate::location::{
    FileEncryptionKey, FileLocationSource, FileType, FullLocalFileLocation,
};

fn cache_local(path: &str) -> FullLocalFileLocation {
    FullLocalFileLocation {
        file_type: FileType::Document,
        path: path.to_string(),
        mtime_nsec: 0,
    }
}

#[tokio::test]
async fn download_issues_a_query_and_completes() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_remote(
            remote(5),
            FileLocationSource::FromServer,
            owner(),
            2048,
            2048,
            "v.mp4".into(),
        )
        .await
        .unwrap();
    let rec = Recorder::new();
    h.manager.download(file_id, Some(rec.clone()), 3).await.unwrap();

    let parts = h.load.downloads().await;
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].remote.id, 5);
    assert_eq!(parts[0].priority, 3);
    assert_eq!(parts[0].name, "v.mp4");
    let query_id = parts[0].query_id;
    assert!(h.manager.get_file_view(file_id).unwrap().is_downloading());

    h.manager.on_start_download(query_id).await;
    h.manager
        .on_partial_download(query_id, partial_local("/cache/v.part", 2), 2048)
        .await;
    h.manager
        .on_download_ok(query_id, cache_local("/cache/v.mp4"), 2048)
        .await;

    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(view.has_local_location());
    assert!(!view.is_downloading());
    assert_eq!(view.local_size(), 2048);
    assert_eq!(
        rec.events(),
        vec![
            CallbackEvent::Progress(file_id),
            CallbackEvent::Progress(file_id),
            CallbackEvent::DownloadOk(file_id),
        ]
    );
}

#[tokio::test]
async fn partial_download_progress_never_regresses() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_remote(remote(6), FileLocationSource::FromServer, owner(), 0, 8192, String::new())
        .await
        .unwrap();
    h.manager.download(file_id, None, 2).await.unwrap();
    let query_id = h.load.last_download_query().await.unwrap();

    h.manager
        .on_partial_download(query_id, partial_local("/cache/p", 3), 3072)
        .await;
    assert_eq!(h.manager.get_file_view(file_id).unwrap().local_size(), 3072);

    // a late, smaller report must not roll progress back
    h.manager
        .on_partial_download(query_id, partial_local("/cache/p", 1), 1024)
        .await;
    assert_eq!(h.manager.get_file_view(file_id).unwrap().local_size(), 3072);
}

#[tokio::test]
async fn dropping_priority_cancels_and_stale_callbacks_are_ignored() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_remote(remote(7), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();
    h.manager.download(file_id, None, 2).await.unwrap();
    let query_id = h.load.last_download_query().await.unwrap();
    h.manager
        .on_partial_download(query_id, partial_local("/cache/q", 2), 2048)
        .await;

    h.manager.download(file_id, None, 0).await.unwrap();
    assert!(h.load.cancelled().await.contains(&query_id));
    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(!view.is_downloading());
    assert_eq!(view.local_size(), 0);

    // the engine raced the cancel; its late completion is dropped
    h.manager
        .on_download_ok(query_id, cache_local("/cache/q.done"), 2048)
        .await;
    assert!(!h.manager.get_file_view(file_id).unwrap().has_local_location());
}

#[tokio::test]
async fn transient_errors_retry_without_surfacing() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_remote(remote(8), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();
    let rec = Recorder::new();
    h.manager.download(file_id, Some(rec.clone()), 2).await.unwrap();
    let first = h.load.last_download_query().await.unwrap();

    h.manager
        .on_error(first, FileError::transfer("connection reset", true))
        .await;

    let parts = h.load.downloads().await;
    assert_eq!(parts.len(), 2);
    assert_ne!(parts[1].query_id, first);
    assert!(rec.events().is_empty());
    assert!(h.manager.get_file_view(file_id).unwrap().is_downloading());
}

#[tokio::test]
async fn terminal_errors_reach_the_callback_once() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_remote(remote(9), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();
    let rec = Recorder::new();
    h.manager.download(file_id, Some(rec.clone()), 2).await.unwrap();
    let query_id = h.load.last_download_query().await.unwrap();

    let error = FileError::transfer("file reference expired", false);
    h.manager.on_error(query_id, error.clone()).await;

    assert_eq!(
        rec.events(),
        vec![CallbackEvent::DownloadError(file_id, error)]
    );
    assert_eq!(h.load.downloads().await.len(), 1);
    assert!(!h.manager.get_file_view(file_id).unwrap().is_downloading());
}

#[tokio::test]
async fn secret_files_wait_for_their_key() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_remote(
            secret_remote(13),
            FileLocationSource::FromServer,
            owner(),
            0,
            0,
            String::new(),
        )
        .await
        .unwrap();
    assert!(h.manager.get_file_view(file_id).unwrap().is_encrypted());

    h.manager.download(file_id, None, 4).await.unwrap();
    assert!(h.load.downloads().await.is_empty());

    h.manager
        .set_encryption_key(file_id, FileEncryptionKey::new(vec![7; 32]))
        .await
        .unwrap();
    assert_eq!(h.load.downloads().await.len(), 1);
    assert!(!h
        .load
        .downloads()
        .await[0]
        .encryption_key
        .is_empty());
}

#[tokio::test]
async fn set_encryption_key_rejects_plain_files() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_remote(remote(14), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();
    assert_eq!(
        h.manager
            .set_encryption_key(file_id, FileEncryptionKey::new(vec![1]))
            .await,
        Err(FileError::WrongFileType)
    );
}

#[tokio::test]
async fn set_content_writes_bytes_at_high_priority() {
    let mut h = harness();
    let file_id = h.manager.register_empty(FileType::Photo).await;
    h.manager
        .set_content(file_id, b"jpeg bytes".to_vec())
        .await
        .unwrap();

    let parts = h.load.set_contents().await;
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].priority, 10);
    assert_eq!(parts[0].file_type, FileType::Photo);
    assert_eq!(parts[0].bytes, b"jpeg bytes".to_vec());

    let query_id = parts[0].query_id;
    let produced = FullLocalFileLocation {
        file_type: FileType::Photo,
        path: "/cache/photo1.jpg".to_string(),
        mtime_nsec: 0,
    };
    h.manager.on_download_ok(query_id, produced, 10).await;
    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(view.has_local_location());
    assert_eq!(view.size(), 10);
    assert_eq!(view.get_type(), FileType::Photo);
}

#[tokio::test]
async fn set_content_drops_a_user_supplied_remote_but_keeps_server_ones() {
    let mut h = harness();
    let from_user = h
        .manager
        .register_remote(remote(15), FileLocationSource::FromUser, owner(), 0, 0, String::new())
        .await
        .unwrap();
    h.manager.set_content(from_user, b"new".to_vec()).await.unwrap();
    assert!(!h.manager.get_file_view(from_user).unwrap().has_remote_location());

    let from_server = h
        .manager
        .register_remote(remote(16), FileLocationSource::FromServer, owner(), 0, 0, String::new())
        .await
        .unwrap();
    h.manager
        .set_content(from_server, b"new".to_vec())
        .await
        .unwrap();
    assert!(h.manager.get_file_view(from_server).unwrap().has_remote_location());
}

#[tokio::test]
async fn unlink_restarts_a_still_wanted_download() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_remote(remote(17), FileLocationSource::FromServer, owner(), 512, 512, String::new())
        .await
        .unwrap();
    h.manager.download(file_id, None, 3).await.unwrap();
    let query_id = h.load.last_download_query().await.unwrap();
    let produced = cache_local("/cache/d17.bin");
    h.manager.on_download_ok(query_id, produced.clone(), 512).await;
    assert!(h.manager.get_file_view(file_id).unwrap().has_local_location());

    h.manager.on_file_unlink(&produced).await;
    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(!view.has_local_location());
    // the handle still wants the file, so the download starts over
    assert_eq!(h.load.downloads().await.len(), 2);
}
