//! Two-phase bootstrap of the out-of-band delivery path.
//!
//! 1. **Acknowledgement**: every connected receiver gets the protocol
//!    version. Receivers that answer `0` on the acknowledgement channel
//!    within the grace period are *acknowledged*; the rest are told they
//!    will not receive the content.
//! 2. **Handshake**: every acknowledged receiver gets the map server
//!    endpoint and the grid layout. The coordinator then polls, in fixed
//!    ticks, until every acknowledged receiver has answered `0` on the
//!    handshake channel.
//!
//! Streaming is authorized only when the count of completed handshakes
//! equals the count of acknowledged receivers. An [`Authorization`] can
//! only be obtained from [`HandshakeCoordinator::run`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::TilecastError;
use crate::grid::GridSpec;
use crate::hub::{MessageHandler, ReceiverHub, ReceiverId};
use crate::wire::{
    ACKNOWLEDGEMENT_CHANNEL, Acknowledgement, HANDSHAKE_CHANNEL, Handshake, PROTOCOL_VERSION,
    StatusReply, WireMessage, status,
};

// ── HandshakeConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    /// How long receivers get to acknowledge.
    pub ack_grace: Duration,
    pub poll_tick: Duration,
    pub poll_ticks: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            ack_grace: Duration::from_millis(500),
            poll_tick: Duration::from_millis(5),
            poll_ticks: 300,
        }
    }
}

impl HandshakeConfig {
    /// Upper bound on the handshake phase.
    pub fn handshake_timeout(&self) -> Duration {
        self.poll_tick * self.poll_ticks
    }
}

/// Where receivers connect for the out-of-band stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapServerEndpoint {
    pub ip: String,
    pub port: u16,
}

// ── Report / Authorization ───────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeReport {
    pub contacted: Vec<ReceiverId>,
    pub acknowledged: Vec<ReceiverId>,
    pub incompatible: Vec<ReceiverId>,
    pub completed: Vec<ReceiverId>,
}

impl HandshakeReport {
    pub fn required(&self) -> usize {
        self.acknowledged.len()
    }
}

/// Every acknowledged receiver completed the handshake.
#[derive(Debug)]
pub struct Authorization {
    report: HandshakeReport,
    base_tile_id: u32,
}

impl Authorization {
    pub fn report(&self) -> &HandshakeReport {
        &self.report
    }

    /// Receivers ready for the out-of-band stream.
    pub fn receivers(&self) -> &[ReceiverId] {
        &self.report.completed
    }

    pub fn base_tile_id(&self) -> u32 {
        self.base_tile_id
    }
}

// ── HandshakeSession ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Acknowledging,
    Handshaking,
}

/// State of one attempt. Discarded when [`HandshakeCoordinator::run`]
/// returns.
#[derive(Debug)]
struct HandshakeSession {
    stage: Stage,
    contacted: HashSet<ReceiverId>,
    acknowledged: HashSet<ReceiverId>,
    /// Non-zero acknowledgement statuses, by receiver.
    rejected: HashMap<ReceiverId, u32>,
    completed: HashSet<ReceiverId>,
    failed: HashMap<ReceiverId, u32>,
    /// Handshake replies after this instant are ignored.
    deadline: Option<Instant>,
}

impl HandshakeSession {
    fn new(contacted: &[ReceiverId]) -> Self {
        Self {
            stage: Stage::Acknowledging,
            contacted: contacted.iter().copied().collect(),
            acknowledged: HashSet::new(),
            rejected: HashMap::new(),
            completed: HashSet::new(),
            failed: HashMap::new(),
            deadline: None,
        }
    }
}

/// Clears the coordinator's session when the attempt ends, including
/// when the future is dropped.
struct SessionGuard<'a>(&'a Mutex<Option<HandshakeSession>>);

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn incompatibility_notice(code: Option<u32>) -> &'static str {
    match code {
        Some(status::RECEIVER_NEWER) => {
            "Your client is newer than this server's video protocol. You will not receive this content."
        }
        Some(status::RECEIVER_OLDER) => {
            "Your client is older than this server's video protocol. You will not receive this content."
        }
        _ => "Your client did not acknowledge the video protocol. You will not receive this content.",
    }
}

// ── HandshakeCoordinator ─────────────────────────────────────────

/// Runs handshake attempts against a hub.
///
/// Register the coordinator as the [`MessageHandler`] for
/// [`ACKNOWLEDGEMENT_CHANNEL`] and [`HANDSHAKE_CHANNEL`]. One attempt may
/// be in flight at a time.
pub struct HandshakeCoordinator {
    hub: Arc<dyn ReceiverHub>,
    config: HandshakeConfig,
    session: Mutex<Option<HandshakeSession>>,
    completed: AtomicUsize,
}

impl HandshakeCoordinator {
    pub fn new(hub: Arc<dyn ReceiverHub>, config: HandshakeConfig) -> Self {
        Self {
            hub,
            config,
            session: Mutex::new(None),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Option<HandshakeSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run both phases against the receivers connected right now.
    pub async fn run(
        &self,
        spec: &GridSpec,
        endpoint: &MapServerEndpoint,
        base_tile_id: u32,
    ) -> Result<Authorization, TilecastError> {
        let contacted = self.hub.receivers();
        {
            let mut session = self.lock();
            if session.is_some() {
                return Err(TilecastError::InvalidTransition("handshake already in progress"));
            }
            *session = Some(HandshakeSession::new(&contacted));
        }
        let _guard = SessionGuard(&self.session);
        self.completed.store(0, Ordering::SeqCst);

        let (acknowledged, incompatible) = self.acknowledge(&contacted).await;
        if acknowledged.is_empty() {
            warn!(contacted = contacted.len(), "no receiver acknowledged the protocol");
            return Err(TilecastError::NoCompatibleReceivers);
        }

        let completed = self
            .handshake(&acknowledged, spec, endpoint, base_tile_id)
            .await?;

        info!(
            receivers = completed.len(),
            base_tile_id, "out-of-band handshake complete"
        );
        Ok(Authorization {
            report: HandshakeReport {
                contacted,
                acknowledged,
                incompatible,
                completed,
            },
            base_tile_id,
        })
    }

    /// Phase 1. Returns `(acknowledged, incompatible)`.
    async fn acknowledge(&self, contacted: &[ReceiverId]) -> (Vec<ReceiverId>, Vec<ReceiverId>) {
        let request = Acknowledgement {
            protocol_version: self.config.protocol_version,
        }
        .to_bytes();
        for &receiver in contacted {
            if let Err(e) = self.hub.send(receiver, ACKNOWLEDGEMENT_CHANNEL, request.clone()) {
                debug!(%receiver, error = %e, "acknowledgement request not delivered");
            }
        }

        tokio::time::sleep(self.config.ack_grace).await;

        let (acknowledged, incompatible) = {
            let mut guard = self.lock();
            let Some(session) = guard.as_mut() else {
                return (Vec::new(), contacted.to_vec());
            };
            session.stage = Stage::Handshaking;
            session.deadline = Some(Instant::now() + self.config.handshake_timeout());
            let mut acknowledged = Vec::new();
            let mut incompatible = Vec::new();
            for &receiver in contacted {
                if session.acknowledged.contains(&receiver) {
                    acknowledged.push(receiver);
                } else {
                    incompatible.push((receiver, session.rejected.get(&receiver).copied()));
                }
            }
            (acknowledged, incompatible)
        };

        for &(receiver, status) in &incompatible {
            info!(%receiver, ?status, "receiver incompatible with out-of-band protocol");
            if let Err(e) = self.hub.notify(receiver, incompatibility_notice(status)) {
                debug!(%receiver, error = %e, "incompatibility notice not delivered");
            }
        }

        (acknowledged, incompatible.into_iter().map(|(r, _)| r).collect())
    }

    /// Phase 2. Returns the receivers that completed.
    async fn handshake(
        &self,
        acknowledged: &[ReceiverId],
        spec: &GridSpec,
        endpoint: &MapServerEndpoint,
        base_tile_id: u32,
    ) -> Result<Vec<ReceiverId>, TilecastError> {
        let request = Handshake::for_grid(spec, endpoint.ip.as_str(), endpoint.port, base_tile_id).to_bytes();
        for &receiver in acknowledged {
            if let Err(e) = self.hub.send(receiver, HANDSHAKE_CHANNEL, request.clone()) {
                warn!(%receiver, error = %e, "handshake request not delivered");
            }
        }

        let required = acknowledged.len();
        let mut ticks = 0;
        while self.completed.load(Ordering::SeqCst) < required && ticks < self.config.poll_ticks {
            tokio::time::sleep(self.config.poll_tick).await;
            ticks += 1;
        }

        let guard = self.lock();
        let (completed, failed) = match guard.as_ref() {
            Some(session) => (
                acknowledged
                    .iter()
                    .copied()
                    .filter(|r| session.completed.contains(r))
                    .collect::<Vec<_>>(),
                session.failed.clone(),
            ),
            None => (Vec::new(), HashMap::new()),
        };
        drop(guard);

        if completed.len() == required {
            return Ok(completed);
        }

        for &receiver in acknowledged {
            if completed.contains(&receiver) {
                continue;
            }
            match failed.get(&receiver) {
                Some(status) => warn!(%receiver, status, "receiver rejected the handshake"),
                None => warn!(%receiver, "receiver did not complete the handshake"),
            }
        }
        warn!(
            completed = completed.len(),
            required,
            timeout = ?self.config.handshake_timeout(),
            "only {} of {} receivers completed the handshake",
            completed.len(),
            required
        );
        Err(TilecastError::HandshakeQuorumTimeout {
            completed: completed.len(),
            required,
        })
    }

    fn on_acknowledgement(&self, receiver: ReceiverId, reply: StatusReply) {
        let mut guard = self.lock();
        let Some(session) = guard.as_mut() else {
            debug!(%receiver, "acknowledgement outside a handshake");
            return;
        };
        if session.stage != Stage::Acknowledging || !session.contacted.contains(&receiver) {
            debug!(%receiver, "late or unsolicited acknowledgement ignored");
            return;
        }
        if reply.is_ok() {
            session.acknowledged.insert(receiver);
        } else {
            session.rejected.insert(receiver, reply.status);
        }
    }

    fn on_handshake(&self, receiver: ReceiverId, reply: StatusReply) {
        let mut guard = self.lock();
        let Some(session) = guard.as_mut() else {
            debug!(%receiver, "handshake reply outside a handshake");
            return;
        };
        if session.stage != Stage::Handshaking || !session.acknowledged.contains(&receiver) {
            debug!(%receiver, "unsolicited handshake reply ignored");
            return;
        }
        if session.deadline.is_some_and(|d| Instant::now() > d) {
            debug!(%receiver, "handshake reply after deadline ignored");
            return;
        }
        if reply.is_ok() {
            if session.completed.insert(receiver) {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
        } else {
            warn!(%receiver, status = reply.status, "handshake failed");
            session.failed.insert(receiver, reply.status);
        }
    }
}

impl MessageHandler for HandshakeCoordinator {
    fn on_message(&self, channel: &str, receiver: ReceiverId, payload: &[u8]) {
        let reply = match StatusReply::from_slice(payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%receiver, channel, error = %e, "malformed handshake reply");
                return;
            }
        };
        match channel {
            ACKNOWLEDGEMENT_CHANNEL => self.on_acknowledgement(receiver, reply),
            HANDSHAKE_CHANNEL => self.on_handshake(receiver, reply),
            other => debug!(channel = other, "reply on unexpected channel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridConfig, compute_grid};
    use crate::hub::MemoryHub;
    use crate::wire::{NOTICE_CHANNEL, Notice};

    /// How a simulated receiver answers.
    #[derive(Clone, Copy, Default)]
    struct Behaviour {
        ack: Option<u32>,
        ack_delay: Duration,
        handshake: Option<u32>,
        repeat: usize,
    }

    const COMPLIANT: Behaviour = Behaviour {
        ack: Some(0),
        ack_delay: Duration::ZERO,
        handshake: Some(0),
        repeat: 1,
    };

    const SILENT: Behaviour = Behaviour {
        ack: None,
        ack_delay: Duration::ZERO,
        handshake: None,
        repeat: 1,
    };

    struct Setup {
        hub: Arc<MemoryHub>,
        coordinator: Arc<HandshakeCoordinator>,
    }

    fn setup(behaviours: Vec<Behaviour>) -> Setup {
        let hub = Arc::new(MemoryHub::with_receivers(behaviours.len() as u64));
        let coordinator = Arc::new(HandshakeCoordinator::new(hub.clone(), HandshakeConfig::default()));
        let mut tap = hub.tap();
        let responder = coordinator.clone();

        tokio::spawn(async move {
            while let Some(msg) = tap.recv().await {
                let b = behaviours[msg.receiver.0 as usize];
                let (status, delay) = match msg.channel.as_str() {
                    ACKNOWLEDGEMENT_CHANNEL => (b.ack, b.ack_delay),
                    HANDSHAKE_CHANNEL => (b.handshake, Duration::ZERO),
                    _ => continue,
                };
                let Some(status) = status else { continue };
                let coordinator = responder.clone();
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let reply = StatusReply { status }.to_bytes();
                    for _ in 0..b.repeat {
                        coordinator.on_message(&msg.channel, msg.receiver, &reply);
                    }
                });
            }
        });

        Setup { hub, coordinator }
    }

    fn spec() -> GridSpec {
        compute_grid(256, 130, GridConfig::default()).unwrap()
    }

    fn endpoint() -> MapServerEndpoint {
        MapServerEndpoint {
            ip: "127.0.0.1".into(),
            port: 8099,
        }
    }

    fn notices(hub: &MemoryHub) -> Vec<ReceiverId> {
        hub.sent_on(NOTICE_CHANNEL).iter().map(|m| m.receiver).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn all_receivers_complete() {
        let s = setup(vec![COMPLIANT; 3]);
        let started = Instant::now();

        let auth = s.coordinator.run(&spec(), &endpoint(), 500).await.unwrap();
        assert_eq!(auth.receivers().len(), 3);
        assert_eq!(auth.report().required(), 3);
        assert_eq!(auth.base_tile_id(), 500);
        assert!(notices(&s.hub).is_empty());

        // grace period plus a few polling ticks
        let took = started.elapsed();
        assert!(took >= Duration::from_millis(500) && took < Duration::from_millis(600), "{took:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn partial_handshake_reports_shortfall() {
        let mut behaviours = vec![COMPLIANT, COMPLIANT, SILENT, SILENT, COMPLIANT];
        behaviours[4].handshake = None;
        let s = setup(behaviours);
        let started = Instant::now();

        let err = s.coordinator.run(&spec(), &endpoint(), 0).await.unwrap_err();
        assert!(matches!(
            err,
            TilecastError::HandshakeQuorumTimeout {
                completed: 2,
                required: 3
            }
        ));
        assert!(err.to_string().contains("2/3"));
        assert_eq!(notices(&s.hub), vec![ReceiverId(2), ReceiverId(3)]);
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn no_acknowledgements() {
        let s = setup(vec![SILENT; 2]);
        let err = s.coordinator.run(&spec(), &endpoint(), 0).await.unwrap_err();
        assert!(matches!(err, TilecastError::NoCompatibleReceivers));
        assert_eq!(notices(&s.hub).len(), 2);
        assert!(s.hub.sent_on(HANDSHAKE_CHANNEL).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nonzero_ack_status_is_incompatible() {
        let mut older = COMPLIANT;
        older.ack = Some(status::RECEIVER_OLDER);
        let s = setup(vec![COMPLIANT, older]);

        let auth = s.coordinator.run(&spec(), &endpoint(), 0).await.unwrap();
        assert_eq!(auth.report().incompatible, vec![ReceiverId(1)]);
        let sent = s.hub.sent_on(NOTICE_CHANNEL);
        let text = Notice::from_slice(&sent[0].payload).unwrap().text;
        assert!(text.contains("older"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_acknowledgement_ignored() {
        let mut late = COMPLIANT;
        late.ack_delay = Duration::from_millis(700);
        let s = setup(vec![COMPLIANT, late]);

        let auth = s.coordinator.run(&spec(), &endpoint(), 0).await.unwrap();
        assert_eq!(auth.report().acknowledged, vec![ReceiverId(0)]);
        assert_eq!(auth.report().incompatible, vec![ReceiverId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_replies_count_once() {
        let mut chatty = COMPLIANT;
        chatty.repeat = 3;
        let mut stuck = COMPLIANT;
        stuck.handshake = None;
        let s = setup(vec![chatty, stuck]);

        let err = s.coordinator.run(&spec(), &endpoint(), 0).await.unwrap_err();
        assert!(matches!(
            err,
            TilecastError::HandshakeQuorumTimeout {
                completed: 1,
                required: 2
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_handshake_blocks_start() {
        let mut failing = COMPLIANT;
        failing.handshake = Some(1);
        let s = setup(vec![COMPLIANT, failing]);
        assert!(s.coordinator.run(&spec(), &endpoint(), 0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_carries_grid_layout() {
        let s = setup(vec![COMPLIANT]);
        s.coordinator.run(&spec(), &endpoint(), 77).await.unwrap();

        let sent = s.hub.sent_on(HANDSHAKE_CHANNEL);
        let hs = Handshake::from_slice(&sent[0].payload).unwrap();
        assert_eq!(hs.ip, "127.0.0.1");
        assert_eq!(hs.port, 8099);
        assert_eq!((hs.grid_columns, hs.grid_rows), (2, 2));
        assert_eq!(hs.tile_margin_y, 63);
        assert_eq!(hs.total_byte_length, 256 * 130);
        assert_eq!(hs.base_tile_id, 77);

        let ack = s.hub.sent_on(ACKNOWLEDGEMENT_CHANNEL);
        assert_eq!(Acknowledgement::from_slice(&ack[0].payload).unwrap().protocol_version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_state_is_discarded() {
        let s = setup(vec![COMPLIANT]);
        s.coordinator.run(&spec(), &endpoint(), 0).await.unwrap();
        // replies after the attempt are ignored and a new attempt starts clean
        s.coordinator
            .on_message(HANDSHAKE_CHANNEL, ReceiverId(0), &StatusReply::OK.to_bytes());
        let auth = s.coordinator.run(&spec(), &endpoint(), 0).await.unwrap();
        assert_eq!(auth.receivers(), &[ReceiverId(0)]);
    }
}
