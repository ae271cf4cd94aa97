//! Playback buffer integration tests
//!
//! Tests ordering and flush semantics without an output device

use std::sync::Arc;

use tokio_test::assert_ok;
use voiceturn::{AudioChunk, Error, PlaybackBuffer};

mod common;

use common::{BlockingSink, RecordingSink, TIMEOUT, eventually};

fn chunk(marker: f32) -> AudioChunk {
    AudioChunk::new(vec![marker; 240], 24_000)
}

#[tokio::test]
async fn chunks_play_in_arrival_order() {
    let sink = RecordingSink::default();
    let playback = PlaybackBuffer::new(Arc::new(sink.clone()));

    for marker in [0.1, 0.2, 0.3, 0.4] {
        assert_ok!(playback.enqueue(chunk(marker)));
    }
    tokio::time::timeout(TIMEOUT, playback.wait_idle())
        .await
        .unwrap();

    let order: Vec<f32> = sink.played().iter().map(|c| c.samples[0]).collect();
    assert_eq!(order, vec![0.1, 0.2, 0.3, 0.4]);
    assert!(playback.is_empty());
}

#[tokio::test]
async fn empty_chunks_are_ignored() {
    let sink = RecordingSink::default();
    let playback = PlaybackBuffer::new(Arc::new(sink.clone()));

    assert_ok!(playback.enqueue(AudioChunk::new(Vec::new(), 24_000)));

    assert!(playback.is_empty());
    assert!(sink.played().is_empty());
}

#[tokio::test]
async fn flush_halts_current_chunk_and_drops_queue() {
    let sink = BlockingSink::default();
    let playback = PlaybackBuffer::new(Arc::new(sink.clone()));

    for marker in [0.1, 0.2, 0.3] {
        playback.enqueue(chunk(marker)).unwrap();
    }
    assert!(eventually(|| playback.is_playing()).await);
    assert_eq!(playback.len(), 3);

    assert_eq!(playback.flush(), 3);

    assert!(playback.is_empty());
    assert!(eventually(|| sink.halted() == 1).await);
    assert_eq!(sink.started(), 1);

    // Flushing an empty buffer is harmless
    assert_eq!(playback.flush(), 0);
}

#[tokio::test]
async fn chunks_after_flush_still_play() {
    let sink = BlockingSink::default();
    let playback = PlaybackBuffer::new(Arc::new(sink.clone()));

    playback.enqueue(chunk(0.1)).unwrap();
    assert!(eventually(|| playback.is_playing()).await);
    playback.flush();

    playback.enqueue(chunk(0.2)).unwrap();

    assert!(eventually(|| sink.started() == 2).await);
    assert!(playback.is_playing());
    assert_eq!(sink.halted(), 1);
}

#[tokio::test]
async fn wait_idle_returns_after_flush() {
    let sink = BlockingSink::default();
    let playback = PlaybackBuffer::new(Arc::new(sink));

    playback.enqueue(chunk(0.1)).unwrap();
    playback.enqueue(chunk(0.2)).unwrap();

    let waiter = playback.clone();
    let idle = tokio::spawn(async move { waiter.wait_idle().await });
    tokio::task::yield_now().await;
    assert!(!idle.is_finished());

    playback.flush();

    tokio::time::timeout(TIMEOUT, idle).await.unwrap().unwrap();
}

#[tokio::test]
async fn closed_buffer_rejects_chunks() {
    let sink = BlockingSink::default();
    let playback = PlaybackBuffer::new(Arc::new(sink.clone()));
    playback.enqueue(chunk(0.1)).unwrap();
    assert!(eventually(|| playback.is_playing()).await);

    tokio::time::timeout(TIMEOUT, playback.close())
        .await
        .unwrap();

    assert_eq!(sink.halted(), 1);
    assert!(matches!(
        playback.enqueue(chunk(0.2)),
        Err(Error::SessionClosed)
    ));
}
