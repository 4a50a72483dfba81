//! Integration tests: a real TCP receiver hub on localhost, fake receivers
//! speaking the channel protocol, and full playback sessions on top.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use tilecast_core::codec::{ChannelCodec, ChannelMessage};
use tilecast_core::error::{PlaybackOutcome, TilecastError};
use tilecast_core::scheduler::SessionPhase;
use tilecast_core::session::{DeliveryMode, PlaybackRequest, SessionManager};
use tilecast_core::wire::{
    ACKNOWLEDGEMENT_CHANNEL, Acknowledgement, HANDSHAKE_CHANNEL, Handshake, NOTICE_CHANNEL, Notice,
    StatusReply, TILE_CHANNEL, TileUpdate, WireMessage,
};
use tilecast_host::config::HostConfig;
use tilecast_host::engine::HostEngine;
use tilecast_host::hub::TcpReceiverHub;

// ── Helpers ──────────────────────────────────────────────────────

/// Short timings so the handshake finishes quickly.
fn test_config() -> HostConfig {
    let mut config = HostConfig::default();
    config.network.listen_addr = "127.0.0.1:0".into();
    config.network.map_server_ip = "10.0.0.7".into();
    config.network.map_server_port = 25565;
    config.handshake.ack_grace_ms = 100;
    config.handshake.poll_tick_ms = 5;
    config.handshake.poll_ticks = 100;
    config
}

async fn host(config: &HostConfig) -> (Arc<TcpReceiverHub>, SessionManager) {
    let hub = Arc::new(
        TcpReceiverHub::bind(config.network.listen_addr.as_str())
            .await
            .unwrap(),
    );
    let manager = SessionManager::new(Arc::new(HostEngine::new()), hub.clone(), config.to_session_config());
    let coordinator = manager.handshake_coordinator();
    hub.register_handler(ACKNOWLEDGEMENT_CHANNEL, coordinator.clone());
    hub.register_handler(HANDSHAKE_CHANNEL, coordinator);
    (hub, manager)
}

/// Connect a receiver that answers both handshake phases with `status`,
/// or stays silent when `status` is `None`. Everything it receives is
/// forwarded to the returned channel.
async fn receiver(addr: SocketAddr, status: Option<u32>) -> mpsc::UnboundedReceiver<ChannelMessage> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, ChannelCodec);
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(Ok(message)) = framed.next().await {
            let is_request = message.channel == ACKNOWLEDGEMENT_CHANNEL || message.channel == HANDSHAKE_CHANNEL;
            if let (true, Some(status)) = (is_request, status) {
                let reply = StatusReply { status }.to_bytes();
                if framed.send(ChannelMessage::new(message.channel.clone(), reply)).await.is_err() {
                    break;
                }
            }
            if tx.send(message).is_err() {
                break;
            }
        }
    });
    rx
}

/// Drain whatever has arrived within `window`.
async fn collect(rx: &mut mpsc::UnboundedReceiver<ChannelMessage>, window: Duration) -> Vec<ChannelMessage> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(message)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        out.push(message);
    }
    out
}

async fn wait_until_ended(manager: &SessionManager, screen: &str) {
    for _ in 0..500 {
        if matches!(manager.status(screen).unwrap().phase, SessionPhase::Ended(_)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {screen} never ended");
}

// ── Out-of-band handshake ────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_out_of_band_handshake_round_trip() {
    let config = test_config();
    let (hub, mut manager) = host(&config).await;
    let mut receivers = Vec::new();
    for _ in 0..3 {
        receivers.push(receiver(hub.local_addr(), Some(0)).await);
    }
    assert!(hub.wait_for_receivers(3, Duration::from_secs(5)).await);

    let mode = manager
        .start_playback(PlaybackRequest::new("wall", "synthetic:256x130@20", DeliveryMode::OutOfBand))
        .await
        .unwrap();
    assert_eq!(mode, DeliveryMode::OutOfBand);

    for rx in &mut receivers {
        let messages = collect(rx, Duration::from_millis(200)).await;
        let ack = messages
            .iter()
            .find(|m| m.channel == ACKNOWLEDGEMENT_CHANNEL)
            .expect("acknowledgement request");
        assert_eq!(Acknowledgement::from_slice(&ack.payload).unwrap().protocol_version, 0);

        let handshake = messages
            .iter()
            .find(|m| m.channel == HANDSHAKE_CHANNEL)
            .map(|m| Handshake::from_slice(&m.payload).unwrap())
            .expect("handshake");
        assert_eq!(handshake.ip, "10.0.0.7");
        assert_eq!(handshake.port, 25565);
        assert_eq!((handshake.grid_columns, handshake.grid_rows), (2, 2));
        assert_eq!((handshake.tile_margin_x, handshake.tile_margin_y), (0, 63));
        assert_eq!(handshake.base_tile_id, config.render.base_tile_id);
        assert!(messages.iter().all(|m| m.channel != TILE_CHANNEL));
    }

    let status = manager.status("wall").unwrap();
    assert_eq!(status.mode, DeliveryMode::OutOfBand);
    assert_eq!(status.phase, SessionPhase::Running);
    tokio_test::assert_ok!(manager.kill("wall"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_receivers_are_not_enough() {
    let config = test_config();
    let (hub, mut manager) = host(&config).await;
    let mut rx = receiver(hub.local_addr(), None).await;
    assert!(hub.wait_for_receivers(1, Duration::from_secs(5)).await);

    let result = manager
        .start_playback(PlaybackRequest::new("wall", "synthetic:256x128@20", DeliveryMode::OutOfBand))
        .await;
    assert!(matches!(result, Err(TilecastError::NoCompatibleReceivers)));
    assert_eq!(PlaybackOutcome::from_result(&result), PlaybackOutcome::NotEnoughClients);
    assert!(manager.screens().is_empty());

    let messages = collect(&mut rx, Duration::from_millis(200)).await;
    let notice = messages
        .iter()
        .find(|m| m.channel == NOTICE_CHANNEL)
        .map(|m| Notice::from_slice(&m.payload).unwrap())
        .expect("incompatibility notice");
    assert!(notice.text.contains("You will not receive this content."));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_version_mismatch_falls_back_to_in_band() {
    let mut config = test_config();
    config.handshake.fallback = tilecast_core::session::QuorumFallback::InBand;
    let (hub, mut manager) = host(&config).await;
    let _rx = receiver(hub.local_addr(), Some(1)).await;
    assert!(hub.wait_for_receivers(1, Duration::from_secs(5)).await);

    let mode = manager
        .start_playback(PlaybackRequest::new("wall", "synthetic:128x128@50:2", DeliveryMode::OutOfBand))
        .await
        .unwrap();
    assert_eq!(mode, DeliveryMode::InBand);
    wait_until_ended(&manager, "wall").await;
    manager.kill("wall").unwrap();
}

// ── In-band playback ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_band_playback_delivers_tiles() {
    let config = test_config();
    let (hub, mut manager) = host(&config).await;
    let mut first = receiver(hub.local_addr(), Some(0)).await;
    let mut second = receiver(hub.local_addr(), Some(0)).await;
    assert!(hub.wait_for_receivers(2, Duration::from_secs(5)).await);

    manager
        .start_playback(PlaybackRequest::new("lobby", "synthetic:256x256@50:5", DeliveryMode::InBand))
        .await
        .unwrap();
    wait_until_ended(&manager, "lobby").await;
    assert_eq!(manager.status("lobby").unwrap().frames_rendered, Some(5));

    let base = config.render.base_tile_id;
    for rx in [&mut first, &mut second] {
        let tiles: Vec<TileUpdate> = collect(rx, Duration::from_millis(300))
            .await
            .iter()
            .filter(|m| m.channel == TILE_CHANNEL)
            .map(|m| TileUpdate::from_slice(&m.payload).unwrap())
            .collect();

        // Initial blackout, then five frames of four tiles.
        assert_eq!(tiles.len(), 4 + 5 * 4);
        assert!(tiles[..4].iter().all(|t| t.payload.iter().all(|&b| b == 119)));
        let ids: BTreeSet<u32> = tiles.iter().map(|t| t.tile_id).collect();
        assert_eq!(ids, (base..base + 4).collect());
    }

    // Kill joins the render thread, so keep it off the async workers.
    tokio::task::block_in_place(|| manager.kill("lobby")).unwrap();
    let tail = collect(&mut first, Duration::from_millis(300)).await;
    assert_eq!(tail.iter().filter(|m| m.channel == TILE_CHANNEL).count(), 4);
    assert!(matches!(manager.kill("lobby"), Err(TilecastError::UnknownSession(_))));
}

#[tokio::test]
async fn test_odd_dimensions_rejected() {
    let config = test_config();
    let (_hub, mut manager) = host(&config).await;
    let result = manager
        .start_playback(PlaybackRequest::new("wall", "synthetic:255x128@20", DeliveryMode::InBand))
        .await;
    assert_eq!(PlaybackOutcome::from_result(&result), PlaybackOutcome::InvalidDimensions);
    assert!(manager.screens().is_empty());
}
