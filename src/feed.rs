use crate::config::Settings;
use crate::downloads::{StatusBatch, StatusStore};
use crate::error::{DecodeError, FeedError};
use crate::notifier::ChangeNotifier;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// How long a clean close may take once shutdown is requested.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of the upstream connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Clone, Debug)]
pub struct FeedOptions {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub status_retention: Duration,
    pub eviction_interval: Duration,
}

impl From<&Settings> for FeedOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            reconnect_initial: settings.reconnect_initial(),
            reconnect_max: settings.reconnect_max(),
            status_retention: settings.status_retention(),
            eviction_interval: settings.eviction_interval(),
        }
    }
}

/// Holds the connection to the extraction service's status stream and is
/// the only writer into the [`StatusStore`].
pub struct FeedConnector {
    url: Url,
    store: StatusStore,
    notifier: ChangeNotifier,
    options: FeedOptions,
    state_tx: watch::Sender<FeedState>,
}

impl FeedConnector {
    pub fn new(
        url: Url,
        store: StatusStore,
        notifier: ChangeNotifier,
        options: FeedOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(FeedState::Disconnected);
        Self {
            url,
            store,
            notifier,
            options,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<FeedState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: FeedState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Feed state changed");
        }
    }

    /// Runs sessions until `shutdown` fires, reconnecting with exponential
    /// backoff whenever the upstream drops.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = self.options.reconnect_initial;
        let mut eviction = tokio::time::interval(self.options.eviction_interval);
        eviction.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            info!(url = %self.url, "Connecting to download status feed");
            let mut reached_connected = false;
            let result = self
                .run_session(&shutdown, &mut eviction, &mut reached_connected)
                .await;
            self.set_state(FeedState::Disconnected);

            let err = match result {
                Ok(()) => break,
                Err(e) => e,
            };

            if reached_connected {
                backoff = self.options.reconnect_initial;
            }
            warn!(
                error = %err,
                delay_ms = backoff.as_millis() as u64,
                "Download status feed session ended, reconnecting"
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.options.reconnect_max);
        }

        info!("Download status feed stopped");
    }

    /// One connection attempt. `Ok(())` means shutdown was requested; any
    /// error ends the session and is retried by [`FeedConnector::run`].
    async fn run_session(
        &self,
        shutdown: &CancellationToken,
        eviction: &mut Interval,
        reached_connected: &mut bool,
    ) -> Result<(), FeedError> {
        self.set_state(FeedState::Connecting);

        let connected = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = connect_async(self.url.as_str()) => result,
        };
        let (ws_stream, _response) = connected?;
        let (mut ws_sink, mut ws_reader) = ws_stream.split();

        *reached_connected = true;
        self.set_state(FeedState::Connected);
        info!(url = %self.url, "Connected to download status feed");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.set_state(FeedState::Closing);
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        let _ = ws_sink.close().await;
                    })
                    .await;
                    return Ok(());
                }
                _ = eviction.tick() => self.evict_expired(),
                msg = ws_reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = self.apply_binary(data.to_vec()) {
                            error!(error = %e, "Failed to decode download status message");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Download status feed closed by remote");
                        self.set_state(FeedState::Closing);
                        return Err(FeedError::RemoteClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(FeedError::RemoteClosed),
                },
            }
        }
    }

    fn handle_frame(&self, raw: &str) {
        if let Err(e) = self.apply_message(raw) {
            error!(error = %e, message = raw, "Failed to decode download status message");
        }
    }

    /// Decodes one upstream message, merges it into the store and publishes
    /// once. Returns the publish sequence, or `None` for an empty heartbeat.
    pub fn apply_message(&self, raw: &str) -> Result<Option<u64>, DecodeError> {
        let batch: StatusBatch = serde_json::from_str(raw)?;
        if batch.is_empty() {
            return Ok(None);
        }

        let applied = self.store.apply_batch(batch);
        let seq = self.notifier.publish(self.store.snapshot());
        debug!(seq, applied, "Applied download status batch");
        Ok(Some(seq))
    }

    /// Same as [`FeedConnector::apply_message`] for binary frames.
    pub fn apply_binary(&self, data: Vec<u8>) -> Result<Option<u64>, DecodeError> {
        let text = String::from_utf8(data).map_err(|e| DecodeError::Utf8 {
            len: e.as_bytes().len(),
            lossy: String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })?;
        self.apply_message(&text)
    }

    fn evict_expired(&self) {
        let removed = self.store.evict_terminal(self.options.status_retention);
        if removed > 0 {
            info!(removed, "Evicted expired download statuses");
            self.notifier.publish(self.store.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Subscription;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    fn options() -> FeedOptions {
        FeedOptions {
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(100),
            status_retention: Duration::from_secs(3600),
            eviction_interval: Duration::from_secs(60),
        }
    }

    fn connector(url: &str) -> (FeedConnector, StatusStore, ChangeNotifier) {
        let store = StatusStore::new();
        let notifier = ChangeNotifier::new(16);
        let connector = FeedConnector::new(
            Url::parse(url).unwrap(),
            store.clone(),
            notifier.clone(),
            options(),
        );
        (connector, store, notifier)
    }

    async fn next(sub: &mut Subscription) -> crate::notifier::StatusUpdate {
        tokio::time::timeout(WAIT, sub.recv())
            .await
            .expect("timed out waiting for update")
            .expect("subscription closed")
    }

    /// Fake extraction service. Each accepted connection gets the next list
    /// of frames, then stays open until the client leaves. Incoming
    /// messages are reported on the returned channel.
    async fn fake_upstream(
        sessions: Vec<Vec<Message>>,
    ) -> (String, Arc<AtomicUsize>, mpsc::UnboundedReceiver<Message>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/download_status", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        let counter = accepted.clone();
        let handle = tokio::spawn(async move {
            let session_count = sessions.len();
            for (i, frames) in sessions.into_iter().enumerate() {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                for frame in frames {
                    ws.send(frame).await.unwrap();
                }
                if i + 1 < session_count {
                    let _ = ws.close(None).await;
                    continue;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    let _ = seen_tx.send(msg);
                }
            }
        });

        (url, accepted, seen_rx, handle)
    }

    fn text(raw: &str) -> Message {
        Message::Text(raw.to_string().into())
    }

    #[tokio::test]
    async fn test_empty_message_is_noop() {
        let (connector, store, notifier) = connector("ws://127.0.0.1:1");
        store.upsert("dl-1", crate::downloads::DownloadStatus::new("queued"));
        let before = store.snapshot();
        let mut sub = notifier.subscribe();

        assert_eq!(connector.apply_message("{}").unwrap(), None);
        assert_eq!(connector.apply_message("  { }\n").unwrap(), None);
        assert_eq!(store.snapshot(), before);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_one_publish_per_message() {
        let (connector, store, notifier) = connector("ws://127.0.0.1:1");
        let mut sub = notifier.subscribe();

        let seq = connector
            .apply_message(
                r#"{"a": {"status": "queued"}, "b": {"status": "downloading"}, "c": {"status": "error", "error": "boom"}}"#,
            )
            .unwrap();
        assert_eq!(seq, Some(1));
        assert_eq!(store.len(), 3);

        let update = next(&mut sub).await;
        assert_eq!(update.statuses.len(), 3);
        assert_eq!(update.statuses["c"].error.as_deref(), Some("boom"));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_malformed_message_leaves_store_alone() {
        let (connector, store, _notifier) = connector("ws://127.0.0.1:1");
        connector
            .apply_message(r#"{"dl-1": {"status": "downloading", "percent": 10.0}}"#)
            .unwrap();
        let before = store.snapshot();

        assert!(connector.apply_message("not json").is_err());
        assert!(connector.apply_message(r#"["dl-1"]"#).is_err());
        assert!(connector.apply_message(r#"{"dl-1": {"percent": 99.0}}"#).is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_feed_applies_frames_in_order_and_survives_garbage() {
        let (url, _accepted, _seen, _server) = fake_upstream(vec![vec![
            text(r#"{"dl-1": {"status": "downloading", "percent": 10.0}}"#),
            text("{this is not json"),
            text("{}"),
            text(r#"{"dl-1": {"status": "downloading", "percent": 55.5}}"#),
            Message::Binary(br#"{"dl-2": {"status": "finished", "filename": "a.mp4"}}"#.to_vec().into()),
        ]])
        .await;

        let (connector, store, notifier) = connector(&url);
        let mut state = connector.state();
        let mut sub = notifier.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(connector.run(shutdown.clone()));

        let first = next(&mut sub).await;
        assert_eq!(first.statuses["dl-1"].percent, Some(10.0));
        let second = next(&mut sub).await;
        assert_eq!(second.statuses["dl-1"].percent, Some(55.5));
        assert!(second.seq > first.seq);
        let third = next(&mut sub).await;
        assert_eq!(third.statuses["dl-2"].filename.as_deref(), Some("a.mp4"));
        assert_eq!(third.statuses["dl-1"].percent, Some(55.5));

        assert_eq!(*state.borrow_and_update(), FeedState::Connected);
        assert_eq!(store.len(), 2);

        shutdown.cancel();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_feed_reconnects_after_remote_close() {
        let (url, accepted, _seen, _server) = fake_upstream(vec![
            vec![text(r#"{"dl-1": {"status": "queued"}}"#)],
            vec![text(r#"{"dl-1": {"status": "downloading", "percent": 1.0}}"#)],
        ])
        .await;

        let (connector, _store, notifier) = connector(&url);
        let mut sub = notifier.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(connector.run(shutdown.clone()));

        assert_eq!(next(&mut sub).await.statuses["dl-1"].status, "queued");
        assert_eq!(next(&mut sub).await.statuses["dl-1"].status, "downloading");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let (url, _accepted, mut seen, _server) =
            fake_upstream(vec![vec![text(r#"{"dl-1": {"status": "queued"}}"#)]]).await;

        let (connector, _store, notifier) = connector(&url);
        let state = connector.state();
        let mut sub = notifier.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(connector.run(shutdown.clone()));

        next(&mut sub).await;
        shutdown.cancel();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(*state.borrow(), FeedState::Disconnected);

        let msg = tokio::time::timeout(WAIT, seen.recv()).await.unwrap();
        assert!(matches!(msg, Some(Message::Close(_))));
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_session_continues() {
        let (url, _accepted, mut seen, _server) = fake_upstream(vec![vec![
            Message::Ping(b"keepalive".to_vec().into()),
            text(r#"{"dl-1": {"status": "queued"}}"#),
        ]])
        .await;

        let (connector, store, notifier) = connector(&url);
        let mut sub = notifier.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(connector.run(shutdown.clone()));

        assert_eq!(next(&mut sub).await.statuses["dl-1"].status, "queued");
        assert_eq!(store.len(), 1);
        shutdown.cancel();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();

        let mut pongs = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(WAIT, seen.recv()).await {
            match msg {
                Message::Pong(payload) => pongs.push(payload.to_vec()),
                Message::Close(_) => break,
                _ => {}
            }
        }
        assert_eq!(pongs, vec![b"keepalive".to_vec()]);
    }

    #[tokio::test]
    async fn test_shutdown_while_upstream_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        drop(listener);

        let (connector, _store, _notifier) = connector(&url);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(connector.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        shutdown.cancel();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_binary_frame_reports_payload() {
        let (connector, store, _notifier) = connector("ws://127.0.0.1:1");
        let mut data = br#"{"dl-1": "#.to_vec();
        data.push(0xff);

        let err = connector.apply_binary(data).unwrap_err();
        assert!(matches!(err, DecodeError::Utf8 { len: 10, .. }));
        assert!(err.to_string().contains(r#"{"dl-1": "#));
        assert!(store.is_empty());

        let seq = connector
            .apply_binary(br#"{"dl-1": {"status": "queued"}}"#.to_vec())
            .unwrap();
        assert_eq!(seq, Some(1));
    }

    #[tokio::test]
    async fn test_evicted_download_stays_gone_under_full_map_resends() {
        let store = StatusStore::new();
        let notifier = ChangeNotifier::new(64);
        let connector = FeedConnector::new(
            Url::parse("ws://127.0.0.1:1").unwrap(),
            store.clone(),
            notifier.clone(),
            FeedOptions {
                status_retention: Duration::from_millis(50),
                ..options()
            },
        );

        connector
            .apply_message(r#"{"old": {"status": "finished", "filename": "a.mp4"}}"#)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        connector.evict_expired();
        assert!(store.get("old").is_none());

        let mut sub = notifier.subscribe();
        let started = Instant::now();
        let mut percent = 0.0;
        while started.elapsed() < Duration::from_millis(80) {
            percent += 1.0;
            let frame = format!(
                r#"{{"old": {{"status": "finished", "filename": "a.mp4"}}, "new": {{"status": "downloading", "percent": {percent:.1}}}}}"#
            );
            connector.apply_message(&frame).unwrap();
            connector.evict_expired();
            let update = next(&mut sub).await;
            assert!(!update.statuses.contains_key("old"));
            assert!(store.get("old").is_none());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_publishes_removal() {
        let store = StatusStore::new();
        let notifier = ChangeNotifier::new(16);
        let connector = FeedConnector::new(
            Url::parse("ws://127.0.0.1:1").unwrap(),
            store.clone(),
            notifier.clone(),
            FeedOptions {
                status_retention: Duration::ZERO,
                ..options()
            },
        );
        connector
            .apply_message(r#"{"done": {"status": "finished"}, "busy": {"status": "processing"}}"#)
            .unwrap();

        let mut sub = notifier.subscribe();
        connector.evict_expired();
        let update = next(&mut sub).await;
        assert!(!update.statuses.contains_key("done"));
        assert!(update.statuses.contains_key("busy"));

        connector.evict_expired();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }
}
