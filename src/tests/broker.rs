#[cfg(test)]
mod framing {
    use crate::broker::protocol::{self, Error, Incoming};

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        protocol::write_frame(&mut client, br#"{"hello":1}"#)
            .await
            .expect("write");

        let body = protocol::read_frame(&mut server).await.expect("read");
        assert_eq!(&body[..], br#"{"hello":1}"#);
    }

    #[tokio::test]
    async fn oversized_inbound_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Header promising more than the inbound cap; the body never needs
        // to arrive for the reader to bail.
        let oversized = (protocol::MAX_INBOUND_FRAME as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &oversized)
            .await
            .expect("header");

        let result = protocol::read_frame(&mut server).await;
        assert!(matches!(result, Err(Error::FrameTooLarge(..))));
    }

    #[test]
    fn responses_and_events_decode_by_tag() {
        let response = br#"{"type":"response","status":"success","id":"abc","data":{"x":1}}"#;
        assert!(matches!(
            protocol::decode(response).expect("decode"),
            Incoming::Response(r) if r.id == "abc" && r.is_success()
        ));

        let event = br#"{"type":"event","event":"download_complete","data":{"id":"abc"}}"#;
        assert!(matches!(
            protocol::decode(event).expect("decode"),
            Incoming::Event(e) if e.event == "download_complete"
        ));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(protocol::decode(b"{oops").is_err());
    }
}

#[cfg(test)]
mod broker {
    use std::{
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use serde_json::{json, Value};
    use tokio::{net::UnixListener, sync::mpsc, time::timeout};
    use tokio_util::sync::CancellationToken;

    use crate::broker::{protocol, Broker, ConnState, Error, WorkerEvent};

    fn socket_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("worker.sock")
    }

    fn broker_at(path: &Path) -> (Arc<Broker>, mpsc::Receiver<WorkerEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let broker = Broker::new(path.to_path_buf(), tx, cancel.clone());
        (broker, rx, cancel)
    }

    /// Accepts one connection and answers every request with `respond`,
    /// optionally following up with extra event frames. `delay` holds each
    /// response back, for tests that need a slow worker.
    fn spawn_worker<F>(listener: UnixListener, seen: Arc<AtomicUsize>, delay: Duration, respond: F)
    where
        F: Fn(&Value) -> (Value, Vec<Value>) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let (mut stream, _addr) = listener.accept().await.expect("accept");

            loop {
                let Ok(body) = protocol::read_frame(&mut stream).await else {
                    return;
                };
                let request: Value = serde_json::from_slice(&body).expect("request json");
                seen.fetch_add(1, Ordering::SeqCst);

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let (response, events) = respond(&request);
                let reply = serde_json::to_vec(&response).expect("encode");
                protocol::write_frame(&mut stream, &reply).await.expect("reply");

                for event in events {
                    let frame = serde_json::to_vec(&event).expect("encode");
                    protocol::write_frame(&mut stream, &frame).await.expect("event");
                }
            }
        });
    }

    fn success(request: &Value, data: Value) -> Value {
        json!({
            "type": "response",
            "status": "success",
            "id": request["id"],
            "data": data,
        })
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        spawn_worker(listener, Arc::new(AtomicUsize::new(0)), Duration::ZERO, |request| {
            (success(request, json!({})), vec![])
        });

        let (broker, _rx, _cancel) = broker_at(&path);
        broker.ping().await.expect("ping");
        assert_eq!(broker.conn_state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn worker_error_status_reaches_the_caller() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        spawn_worker(listener, Arc::new(AtomicUsize::new(0)), Duration::ZERO, |request| {
            (
                json!({
                    "type": "response",
                    "status": "error",
                    "id": request["id"],
                    "error": "unsupported platform",
                }),
                vec![],
            )
        });

        let (broker, _rx, _cancel) = broker_at(&path);
        let result = broker.download("https://x/1").await;
        assert!(matches!(result, Err(Error::Worker(message)) if message.contains("unsupported")));

        // The in-flight window closed; the same URL can be retried.
        let result = broker.download("https://x/1").await;
        assert!(matches!(result, Err(Error::Worker(_))));
    }

    #[tokio::test]
    async fn download_returns_the_track_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        spawn_worker(listener, Arc::new(AtomicUsize::new(0)), Duration::ZERO, |request| {
            let track = json!({
                "title": "A Song",
                "filename": "/tmp/a.opus",
                "duration": 30,
                "artist": "Somebody",
                "thumbnail_url": "",
                "is_stream": false,
            });
            let complete = json!({
                "type": "event",
                "event": "download_complete",
                "data": {"id": request["id"], "status": "success"},
            });
            (success(request, track), vec![complete])
        });

        let (broker, mut rx, _cancel) = broker_at(&path);

        let track = broker
            .download("https://x/song")
            .await
            .expect("download")
            .expect("not a duplicate");
        assert_eq!(track.title, "A Song");
        assert_eq!(track.filename, "/tmp/a.opus");

        // The completion event follows and drains the pending counter.
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert!(matches!(event, WorkerEvent::DownloadComplete { success: true, .. }));
        assert_eq!(broker.pending_downloads(), 0);
    }

    #[tokio::test]
    async fn duplicate_in_flight_url_sends_one_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).expect("bind");

        let seen = Arc::new(AtomicUsize::new(0));
        spawn_worker(
            listener,
            Arc::clone(&seen),
            // Slow worker: the response trails the duplicate request.
            Duration::from_millis(200),
            |request| {
                let track = json!({"title": "T", "filename": "/tmp/t.opus", "duration": 1});
                (success(request, track), vec![])
            },
        );

        let (broker, _rx, _cancel) = broker_at(&path);
        broker.connect().await.expect("connect");

        let first = broker.download("https://x/dup");
        let second = async {
            // Let the first dispatch win the race.
            tokio::time::sleep(Duration::from_millis(50)).await;
            broker.download("https://x/dup").await
        };

        let (first, second) = tokio::join!(first, second);
        assert!(first.expect("first").is_some());
        assert!(second.expect("second").is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn playlist_events_drive_the_pending_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        spawn_worker(listener, Arc::new(AtomicUsize::new(0)), Duration::ZERO, |request| {
            let started = json!({"playlist_id": "pl1", "total_tracks": 2});
            let events = vec![
                json!({
                    "type": "event",
                    "event": "playlist_started",
                    "data": {"playlist_id": "pl1", "total_tracks": 2},
                }),
                json!({
                    "type": "event",
                    "event": "playlist_item_downloaded",
                    "data": {
                        "track": {"title": "One", "filename": "/tmp/1.opus", "duration": 10},
                        "playlist": {"url": "https://x/pl"},
                    },
                }),
                json!({
                    "type": "event",
                    "event": "download_complete",
                    "data": {"id": "item-1", "status": "success"},
                }),
                json!({
                    "type": "event",
                    "event": "playlist_item_downloaded",
                    "data": {
                        "track": {"title": "Two", "filename": "/tmp/2.opus", "duration": 10},
                        "playlist": {"url": "https://x/pl"},
                    },
                }),
                json!({
                    "type": "event",
                    "event": "download_complete",
                    "data": {"id": "item-2", "status": "success"},
                }),
            ];
            (success(request, started), events)
        });

        let (broker, mut rx, _cancel) = broker_at(&path);

        let started = broker
            .start_playlist("https://x/pl", 100)
            .await
            .expect("start")
            .expect("not a duplicate");
        assert_eq!(started.total_tracks, 2);

        let mut items = 0;
        let mut completions = 0;
        while completions < 2 {
            let event = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event in time")
                .expect("event");
            match event {
                WorkerEvent::PlaylistItem { .. } => items += 1,
                WorkerEvent::DownloadComplete { .. } => completions += 1,
                WorkerEvent::PlaylistStarted { total_tracks, .. } => {
                    assert_eq!(total_tracks, 2);
                }
            }
        }

        assert_eq!(items, 2);
        assert_eq!(broker.pending_downloads(), 0);

        // All announced items observed: the playlist is no longer in
        // flight and may be requested again.
        assert!(!broker.downloads_active());
    }

    #[tokio::test]
    async fn missing_socket_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir);

        let (broker, _rx, _cancel) = broker_at(&path);
        assert!(broker.download("https://x/1").await.is_err());

        // The failed dispatch must not leave the URL stuck in the
        // duplicate-suppression set.
        assert!(!broker.downloads_active());
    }

    #[tokio::test]
    async fn shutdown_rejects_further_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        spawn_worker(listener, Arc::new(AtomicUsize::new(0)), Duration::ZERO, |request| {
            (success(request, json!({})), vec![])
        });

        let (broker, _rx, _cancel) = broker_at(&path);
        broker.ping().await.expect("ping");

        broker.shutdown().await;
        assert!(matches!(
            broker.ping().await,
            Err(Error::NotConnected)
        ));
        assert_eq!(broker.conn_state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn reset_accounting_zeroes_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).expect("bind");
        spawn_worker(listener, Arc::new(AtomicUsize::new(0)), Duration::ZERO, |request| {
            let events = vec![json!({
                "type": "event",
                "event": "playlist_started",
                "data": {"playlist_id": "pl", "total_tracks": 5},
            })];
            (
                success(request, json!({"playlist_id": "pl", "total_tracks": 5})),
                events,
            )
        });

        let (broker, mut rx, _cancel) = broker_at(&path);
        broker
            .start_playlist("https://x/pl", 100)
            .await
            .expect("start");

        // Wait for the playlist_started event to land.
        let _ = timeout(Duration::from_secs(2), rx.recv()).await.expect("event");
        assert_eq!(broker.pending_downloads(), 5);

        broker.reset_accounting();
        assert_eq!(broker.pending_downloads(), 0);
        assert!(!broker.downloads_active());
    }
}
