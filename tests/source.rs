//! FIFO source tests against real named pipes

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::timeout;

use pimper::config::{OnClose, SourceConfig};
use pimper::lifecycle::LifecycleState;
use pimper::source::{is_fifo, Message, Source, SourceEvent, SourceProvider};

const WAIT: Duration = Duration::from_secs(5);

fn provider(
    path: &Path,
    on_close: OnClose,
) -> (SourceProvider, mpsc::Receiver<SourceEvent>) {
    let (tx, rx) = mpsc::channel(16);
    let config = SourceConfig {
        path: path.to_path_buf(),
        on_close,
        ..Default::default()
    };
    (SourceProvider::new(0, &config, " ".to_string(), tx), rx)
}

/// Open the FIFO as a writer, write `text` and close it again
async fn write_and_close(path: &Path, text: &'static str) {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut pipe = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        pipe.write_all(text.as_bytes()).unwrap();
    })
    .await
    .unwrap();
}

async fn next_message(rx: &mut mpsc::Receiver<SourceEvent>) -> Message {
    match timeout(WAIT, rx.recv()).await.unwrap() {
        Some(SourceEvent::Message { source, message }) => {
            assert_eq!(source, 0);
            message
        }
        other => panic!("expected a message, got {:?}", other),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_creates_missing_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run").join("source");
    let (mut source, _rx) = provider(&path, OnClose::Shutdown);

    source.start().await.unwrap();
    assert!(is_fifo(&path));
    assert_eq!(source.state(), LifecycleState::Running);

    timeout(WAIT, source.stop()).await.unwrap();
    assert_eq!(source.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_frames_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source");
    let (mut source, mut rx) = provider(&path, OnClose::Ignore);
    source.start().await.unwrap();

    write_and_close(&path, "sensors/temp 21.5\n\nheartbeat\r\nlast line").await;

    assert_eq!(
        next_message(&mut rx).await,
        Message::new("sensors/temp", Some("21.5".to_string()))
    );
    assert_eq!(next_message(&mut rx).await, Message::new("heartbeat", None));
    assert_eq!(next_message(&mut rx).await, Message::new("last", Some("line".to_string())));

    source.stop().await;
}

#[tokio::test]
async fn test_shutdown_policy_reports_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source");
    let (mut source, mut rx) = provider(&path, OnClose::Shutdown);
    source.start().await.unwrap();

    write_and_close(&path, "status up\n").await;

    assert_eq!(next_message(&mut rx).await.topic, "status");
    match timeout(WAIT, rx.recv()).await.unwrap() {
        Some(SourceEvent::Closed { source }) => assert_eq!(source, 0),
        other => panic!("expected close, got {:?}", other),
    }

    timeout(WAIT, source.stop()).await.unwrap();
    assert_eq!(source.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_ignore_policy_stays_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source");
    let (mut source, mut rx) = provider(&path, OnClose::Ignore);
    source.start().await.unwrap();

    write_and_close(&path, "status up\n").await;
    assert_eq!(next_message(&mut rx).await.topic, "status");

    wait_until(|| source.state() == LifecycleState::Stopped).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_reopen_policy_restarts_on_every_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source");
    let (mut source, mut rx) = provider(&path, OnClose::Reopen);
    source.start().await.unwrap();

    for round in 1..=3u64 {
        write_and_close(&path, "tick now\n").await;
        assert_eq!(next_message(&mut rx).await.topic, "tick");
        wait_until(|| source.reopen_count() == round).await;
        assert_eq!(source.state(), LifecycleState::Running);
    }

    assert_eq!(source.reopen_count(), 3);
    assert!(rx.try_recv().is_err());

    timeout(WAIT, source.stop()).await.unwrap();
    assert_eq!(source.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_stop_unblocks_waiting_reader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source");
    let (mut source, mut rx) = provider(&path, OnClose::Shutdown);
    source.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(WAIT, source.stop()).await.unwrap();

    assert_eq!(source.state(), LifecycleState::Stopped);
    assert!(rx.try_recv().is_err());

    // Second stop is a no-op
    source.stop().await;
    assert_eq!(source.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_regular_file_is_read_anyway() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain");
    std::fs::write(&path, "config/reload true\n").unwrap();
    let (mut source, mut rx) = provider(&path, OnClose::Ignore);

    source.start().await.unwrap();

    assert_eq!(
        next_message(&mut rx).await,
        Message::new("config/reload", Some("true".to_string()))
    );
    wait_until(|| source.state() == LifecycleState::Stopped).await;
}
