use super::support::*;
use crate::error::FileError;
use crate::location::{FileLocationSource, FileType};

#[tokio::test]
async fn generation_preempts_an_active_download() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness();
    let file_id = h
        .manager
        .register_remote(
            remote(11),
            FileLocationSource::FromServer,
            owner(),
            0,
            4096,
            "sticker.webp".into(),
        )
        .await
        .unwrap();
    let rec = Recorder::new();
    h.manager.download(file_id, Some(rec.clone()), 2).await.unwrap();
    let download_query = h.load.last_download_query().await.unwrap();

    // a recipe to produce the same file locally arrives later
    let generate_id = h
        .manager
        .register_generate(
            FileType::Document,
            "sticker.tgs".into(),
            "animated_to_webp".into(),
            owner(),
            4096,
        )
        .await
        .unwrap();
    let merged = h.manager.merge(file_id, generate_id, false).await.unwrap();

    assert!(h.load.cancelled().await.contains(&download_query));
    let generates = h.generate.generates().await;
    assert_eq!(generates.len(), 1);
    assert_eq!(generates[0].generate.conversion, "animated_to_webp");
    // the generation runs under the pressure of the waiting download
    assert_eq!(generates[0].download_priority, 2);
    assert_eq!(generates[0].upload_priority, 0);
    let generate_query = generates[0].query_id;

    h.manager
        .on_partial_generate(generate_query, partial_local("/cache/gen.part", 2), 4096)
        .await;
    assert!(h.manager.get_file_view(merged).unwrap().local_size() > 0);

    let produced = write_file(dir.path(), "sticker.webp", b"webp bytes");
    h.manager.on_generate_ok(generate_query, produced).await;

    let view = h.manager.get_file_view(merged).unwrap();
    assert!(view.has_local_location());
    assert!(!view.is_generating());
    assert!(!view.is_downloading());
    // the download stays cancelled: nothing left to fetch
    assert_eq!(h.load.downloads().await.len(), 1);
    assert!(rec.events().contains(&CallbackEvent::DownloadOk(file_id)));
}

#[tokio::test]
async fn external_generation_reports_progress_and_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness();
    let file_id = h
        .manager
        .register_generate(
            FileType::Document,
            "export.log".into(),
            "#url#https://example.org/big.log".into(),
            owner(),
            0,
        )
        .await
        .unwrap();
    h.manager.download(file_id, None, 3).await.unwrap();
    let generates = h.generate.generates().await;
    assert_eq!(generates[0].download_priority, 3);
    let query_id = h.generate.last_generate_query().await.unwrap();

    h.manager
        .external_generate_progress(query_id, 2000, 512)
        .await
        .unwrap();
    let view = h.manager.get_file_view(file_id).unwrap();
    assert_eq!(view.local_size(), 512);
    assert_eq!(view.expected_size(), 2000);

    let produced = write_file(dir.path(), "big.log", b"fetched remote body");
    h.manager
        .external_generate_finish(query_id, Ok(produced))
        .await
        .unwrap();
    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(view.has_local_location());
    assert_eq!(view.size(), 19);

    // the task is gone; late progress is refused
    assert_eq!(
        h.manager.external_generate_progress(query_id, 0, 600).await,
        Err(FileError::Cancelled)
    );
}

#[tokio::test]
async fn failed_generation_surfaces_to_download_callbacks() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_generate(
            FileType::Photo,
            "orig.png".into(),
            "scale:64".into(),
            owner(),
            0,
        )
        .await
        .unwrap();
    let rec = Recorder::new();
    h.manager.download(file_id, Some(rec.clone()), 3).await.unwrap();
    let query_id = h.generate.last_generate_query().await.unwrap();

    let error = FileError::GenerationFailed("conversion crashed".to_string());
    h.manager.on_error(query_id, error.clone()).await;

    assert_eq!(
        rec.events(),
        vec![CallbackEvent::DownloadError(file_id, error)]
    );
    assert_eq!(h.generate.generates().await.len(), 1);
    assert!(!h.manager.get_file_view(file_id).unwrap().is_generating());
}

#[tokio::test]
async fn cancelled_generation_discards_its_partial_output() {
    let mut h = harness();
    let file_id = h
        .manager
        .register_generate(
            FileType::Video,
            "clip.mov".into(),
            "transcode:h264".into(),
            owner(),
            1 << 20,
        )
        .await
        .unwrap();
    h.manager.download(file_id, None, 2).await.unwrap();
    let query_id = h.generate.last_generate_query().await.unwrap();
    h.manager
        .on_partial_generate(query_id, partial_local("/cache/clip.part", 5), 0)
        .await;
    assert!(h.manager.get_file_view(file_id).unwrap().can_delete());

    h.manager.download(file_id, None, 0).await.unwrap();
    assert!(h.generate.cancelled().await.contains(&query_id));
    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(!view.is_generating());
    assert!(!view.can_delete());
    assert_eq!(view.local_size(), 0);
}
