#[cfg(test)]
mod db {
    use crate::{
        db::Database,
        tracks::{DownloadStatus, Song},
    };

    async fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&dir.path().join("test.db"))
            .await
            .expect("open db");
        (dir, db)
    }

    fn song(url: &str) -> Song {
        Song {
            id: 0,
            title: "Test Track".to_owned(),
            artist: "Tester".to_owned(),
            duration_secs: 30,
            file_path: Some("/tmp/a.opus".into()),
            url: url.to_owned(),
            platform: "youtube".to_owned(),
            thumbnail_url: String::new(),
            is_stream: false,
            requested_by: "someone".to_owned(),
            added_at: 1_700_000_000,
            status: DownloadStatus::Completed,
        }
    }

    #[tokio::test]
    async fn songs_deduplicate_by_url() {
        let (_dir, db) = open().await;

        let first = db.add_song(&song("https://x/1")).await.expect("insert");
        let second = db.add_song(&song("https://x/1")).await.expect("reuse");
        let other = db.add_song(&song("https://x/2")).await.expect("insert");

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn song_round_trips_through_storage() {
        let (_dir, db) = open().await;

        let mut expected = song("https://x/rt");
        expected.id = db.add_song(&expected).await.expect("insert");

        let loaded = db
            .song_by_url("https://x/rt")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(loaded, expected);
    }

    #[tokio::test]
    async fn queue_positions_strictly_increase() {
        let (_dir, db) = open().await;

        for n in 0..3 {
            let id = db.add_song(&song(&format!("https://x/{n}"))).await.expect("insert");
            db.add_to_queue(id).await.expect("queue");
        }

        let items = db.queue().await.expect("load");
        assert_eq!(items.len(), 3);

        let positions: Vec<i64> = items.iter().map(|item| item.position).collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn cursor_defaults_to_zero_and_persists() {
        let (_dir, db) = open().await;
        assert_eq!(db.current_position().await.expect("read"), 0);

        db.set_current_position(2).await.expect("write");
        assert_eq!(db.current_position().await.expect("read"), 2);
    }

    #[tokio::test]
    async fn clear_resets_rows_and_cursor_together() {
        let (_dir, db) = open().await;

        let id = db.add_song(&song("https://x/c")).await.expect("insert");
        db.add_to_queue(id).await.expect("queue");
        db.set_current_position(1).await.expect("cursor");

        db.clear_queue().await.expect("clear");

        assert!(db.queue().await.expect("load").is_empty());
        assert_eq!(db.current_position().await.expect("read"), 0);
    }

    #[tokio::test]
    async fn remove_deletes_one_row() {
        let (_dir, db) = open().await;

        let a = db.add_song(&song("https://x/a")).await.expect("insert");
        let b = db.add_song(&song("https://x/b")).await.expect("insert");
        let first = db.add_to_queue(a).await.expect("queue");
        db.add_to_queue(b).await.expect("queue");

        db.remove_from_queue(first).await.expect("remove");

        let items = db.queue().await.expect("load");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].song.url, "https://x/b");
    }

    #[tokio::test]
    async fn config_values_round_trip() {
        let (_dir, db) = open().await;

        db.save_volume(0.07).await.expect("volume");
        db.save_stream("https://radio.example/a").await.expect("stream");

        let stored = db.load_config().await.expect("load");
        assert!((stored.volume.expect("volume") - 0.07).abs() < f32::EPSILON);
        assert_eq!(stored.stream.as_deref(), Some("https://radio.example/a"));
    }

    #[tokio::test]
    async fn sweep_drops_rows_with_missing_files() {
        let (dir, db) = open().await;

        // One song whose file exists, one whose file is gone.
        let kept_path = dir.path().join("kept.opus");
        tokio::fs::write(&kept_path, b"data").await.expect("write");

        let mut kept = song("https://x/kept");
        kept.file_path = Some(kept_path);
        db.add_song(&kept).await.expect("insert");

        let mut gone = song("https://x/gone");
        gone.file_path = Some(dir.path().join("gone.opus"));
        db.add_song(&gone).await.expect("insert");

        db.maintenance_sweep(100).await.expect("sweep");

        assert!(db.song_by_url("https://x/kept").await.expect("q").is_some());
        assert!(db.song_by_url("https://x/gone").await.expect("q").is_none());
    }

    #[tokio::test]
    async fn sweep_never_touches_queued_songs() {
        let (dir, db) = open().await;

        let mut queued = song("https://x/queued");
        queued.file_path = Some(dir.path().join("missing.opus"));
        let id = db.add_song(&queued).await.expect("insert");
        db.add_to_queue(id).await.expect("queue");

        db.maintenance_sweep(100).await.expect("sweep");

        assert!(db.song_by_url("https://x/queued").await.expect("q").is_some());
    }
}
