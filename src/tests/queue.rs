#[cfg(test)]
mod queue {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::{
        db::Database,
        queue::{Error, Queue, QueueEvent},
        tracks::{DownloadStatus, Song},
    };

    async fn fixture() -> (tempfile::TempDir, Arc<Queue>, mpsc::Receiver<QueueEvent>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&dir.path().join("queue.db"))
            .await
            .expect("open db");

        let (tx, rx) = mpsc::channel(32);
        let queue = Queue::load(db, tx).await.expect("load queue");

        (dir, queue, rx)
    }

    fn song(url: &str) -> Song {
        Song {
            id: 0,
            title: format!("track {url}"),
            artist: "Tester".to_owned(),
            duration_secs: 30,
            file_path: Some("/tmp/a.opus".into()),
            url: url.to_owned(),
            platform: String::new(),
            thumbnail_url: String::new(),
            is_stream: false,
            requested_by: String::new(),
            added_at: 0,
            status: DownloadStatus::Completed,
        }
    }

    #[tokio::test]
    async fn first_add_becomes_current() {
        let (_dir, queue, _rx) = fixture().await;
        assert!(queue.current().is_none());

        queue.add(song("https://x/1")).await.expect("add");

        let current = queue.current().expect("current");
        assert_eq!(current.url, "https://x/1");
        assert!(!queue.has_next());
    }

    #[tokio::test]
    async fn add_emits_track_added() {
        let (_dir, queue, mut rx) = fixture().await;

        queue.add(song("https://x/ev")).await.expect("add");

        let QueueEvent::TrackAdded { song, position } = rx.recv().await.expect("event");
        assert_eq!(song.url, "https://x/ev");
        assert_eq!(position, 1);
    }

    #[tokio::test]
    async fn advance_walks_the_queue_in_order() {
        let (_dir, queue, _rx) = fixture().await;

        for n in 1..=3 {
            queue.add(song(&format!("https://x/{n}"))).await.expect("add");
        }

        assert_eq!(queue.current().expect("current").url, "https://x/1");
        assert_eq!(queue.advance().await.expect("advance").url, "https://x/2");
        assert_eq!(queue.advance().await.expect("advance").url, "https://x/3");
    }

    #[tokio::test]
    async fn advance_at_end_keeps_the_cursor() {
        let (_dir, queue, _rx) = fixture().await;
        queue.add(song("https://x/only")).await.expect("add");

        let before = queue.position();
        assert!(matches!(queue.advance().await, Err(Error::NoNext)));
        assert_eq!(queue.position(), before);
        assert_eq!(queue.current().expect("current").url, "https://x/only");
    }

    #[tokio::test]
    async fn clear_then_add_points_at_the_new_song() {
        let (_dir, queue, _rx) = fixture().await;

        for n in 1..=2 {
            queue.add(song(&format!("https://x/{n}"))).await.expect("add");
        }
        queue.advance().await.expect("advance");

        queue.clear().await.expect("clear");
        assert!(queue.current().is_none());
        assert!(!queue.has_next());
        assert!(queue.is_empty());

        queue.add(song("https://x/after")).await.expect("add");
        assert_eq!(queue.position(), 0);
        assert_eq!(queue.current().expect("current").url, "https://x/after");
        assert!(!queue.has_next());
    }

    #[tokio::test]
    async fn queue_survives_a_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("persist.db");

        {
            let db = Database::open(&path).await.expect("open");
            let (tx, _rx) = mpsc::channel(32);
            let queue = Queue::load(db, tx).await.expect("load");

            for n in 1..=3 {
                queue.add(song(&format!("https://x/{n}"))).await.expect("add");
            }
            queue.advance().await.expect("advance");
        }

        let db = Database::open(&path).await.expect("reopen");
        let (tx, _rx) = mpsc::channel(32);
        let queue = Queue::load(db, tx).await.expect("reload");

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.position(), 1);
        assert_eq!(queue.current().expect("current").url, "https://x/2");
    }

    #[tokio::test]
    async fn upcoming_skips_the_current_song() {
        let (_dir, queue, _rx) = fixture().await;

        for n in 1..=4 {
            queue.add(song(&format!("https://x/{n}"))).await.expect("add");
        }

        let upcoming = queue.upcoming(2);
        assert_eq!(upcoming.len(), 2);
        assert_eq!(upcoming[0].url, "https://x/2");
        assert_eq!(upcoming[1].url, "https://x/3");
    }

    #[tokio::test]
    async fn remove_resyncs_the_view() {
        let (_dir, queue, _rx) = fixture().await;

        let first = queue.add(song("https://x/1")).await.expect("add");
        queue.add(song("https://x/2")).await.expect("add");

        queue.remove(first.queue_id).await.expect("remove");

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.current().expect("current").url, "https://x/2");
    }

    #[tokio::test]
    async fn duplicate_urls_share_one_song_row() {
        let (_dir, queue, _rx) = fixture().await;

        let a = queue.add(song("https://x/dup")).await.expect("add");
        let b = queue.add(song("https://x/dup")).await.expect("add");

        // Two queue rows, one song row behind them.
        assert_eq!(a.song.id, b.song.id);
        assert_ne!(a.queue_id, b.queue_id);
        assert_eq!(queue.len(), 2);
    }
}
