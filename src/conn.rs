use std::net::SocketAddr;
use std::sync::Arc;
use std::time;

use crate::config::Config;
use crate::keys;
use crate::packet::ConnectionId;
use crate::vc::{Credential, VerifiedInfo};

use log::debug;

/// Consecutive decryption failures that close an established connection.
pub const DECRYPT_FAILURE_LIMIT: u32 = 3;

/// Connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Client: INITIAL sent, waiting for VC_RESPONSE. Server: VC_INIT seen,
    /// not yet verified.
    Initial,

    /// Credentials exchanged in one direction, waiting for completion.
    Handshake,

    /// Both sides hold verified credentials and a session key.
    Established,

    /// Terminal. The engine removes closed connections from the table
    /// before surfacing the event.
    Closed,
}

/// Per-connection record. Owned exclusively by the engine's table while
/// alive; mutated only by the handshake engine, timers, and dispatcher.
pub struct Conn {
    /// Device identity, empty until the credential exchange names it.
    pub device_id: String,

    /// Destination CID: what we put on the wire towards the peer.
    pub dcid: ConnectionId<'static>,

    /// Source CID: what the peer echoes back to us. Table key.
    pub scid: ConnectionId<'static>,

    pub peer: SocketAddr,

    state: State,

    pub is_server: bool,

    /// Next outgoing packet number. Strictly monotonic per connection.
    next_tx: u64,

    /// Highest packet number seen from the peer, for the duplicate guard.
    highest_rx: Option<u64>,

    /// Received packet numbers awaiting an outbound ACK piggyback.
    ack_queue: Vec<u64>,

    /// Caller-owned credential presented on this connection.
    pub local_vc: Arc<Credential>,

    /// The peer's verified credential, set during the handshake.
    pub remote_vc: Option<VerifiedInfo>,

    /// Our handshake challenge.
    pub challenge: [u8; 32],

    pub session_key: Option<keys::Key>,

    /// Derived but unused until the AEAD expansion.
    pub initial_key: Option<keys::Key>,
    pub handshake_key: Option<keys::Key>,
    pub application_key: Option<keys::Key>,

    pub handshake_deadline: Option<time::Instant>,
    pub heartbeat_at: Option<time::Instant>,
    pub idle_deadline: Option<time::Instant>,

    pub created_at: time::Instant,
    pub last_activity: time::Instant,

    decrypt_failures: u32,
}

fn random_challenge() -> [u8; 32] {
    use rand::RngCore;

    let mut challenge = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

impl Conn {
    /// Creates a client-role connection with fresh random CIDs. The table
    /// keys it by our SCID, which the peer echoes as DCID in replies.
    pub fn new_client(
        now: time::Instant,
        device_id: &str,
        peer: SocketAddr,
        local_vc: Arc<Credential>,
        config: &Config,
    ) -> Self {
        Conn {
            device_id: device_id.to_string(),
            dcid: ConnectionId::from_random(config.connection_id_length),
            scid: ConnectionId::from_random(config.connection_id_length),
            peer,
            state: State::Initial,
            is_server: false,
            next_tx: 0,
            highest_rx: None,
            ack_queue: Vec::new(),
            local_vc,
            remote_vc: None,
            challenge: random_challenge(),
            session_key: None,
            initial_key: None,
            handshake_key: None,
            application_key: None,
            handshake_deadline: Some(now + config.handshake_timeout),
            heartbeat_at: None,
            idle_deadline: None,
            created_at: now,
            last_activity: now,
            decrypt_failures: 0,
        }
    }

    /// Creates a server-role connection from a client's INITIAL header.
    /// SCID and DCID swap at acceptance: we reply towards their SCID and
    /// adopt their DCID as ours, so the table keys by our SCID.
    pub fn new_server(
        now: time::Instant,
        peer: SocketAddr,
        client_dcid: &ConnectionId,
        client_scid: &ConnectionId,
        local_vc: Arc<Credential>,
        config: &Config,
    ) -> Self {
        Conn {
            device_id: String::new(),
            dcid: client_scid.clone().into_owned(),
            scid: client_dcid.clone().into_owned(),
            peer,
            state: State::Initial,
            is_server: true,
            next_tx: 0,
            highest_rx: None,
            ack_queue: Vec::new(),
            local_vc,
            remote_vc: None,
            challenge: random_challenge(),
            session_key: None,
            initial_key: None,
            handshake_key: None,
            application_key: None,
            handshake_deadline: Some(now + config.handshake_timeout),
            heartbeat_at: None,
            idle_deadline: None,
            created_at: now,
            last_activity: now,
            decrypt_failures: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn set_handshake(&mut self) {
        debug!("conn {:?}: {:?} -> Handshake", self.scid, self.state);
        self.state = State::Handshake;
    }

    /// Enters ESTABLISHED and arms the heartbeat and idle timers. Callers
    /// must have set `remote_vc` and `session_key` first.
    pub fn establish(&mut self, now: time::Instant, config: &Config) {
        debug_assert!(self.remote_vc.is_some());
        debug_assert!(self.session_key.is_some());

        debug!("conn {:?}: {:?} -> Established", self.scid, self.state);
        self.state = State::Established;
        self.handshake_deadline = None;
        self.heartbeat_at = Some(now + config.heartbeat_interval);
        self.idle_deadline = Some(now + config.idle_timeout);
    }

    /// Drops back to INITIAL after the peer re-broadcast as unclaimed; the
    /// old session key is void and a fresh claim must run.
    pub fn reset_to_initial(&mut self, now: time::Instant, config: &Config) {
        debug!("conn {:?}: {:?} -> Initial (reclaim)", self.scid, self.state);
        self.state = State::Initial;
        self.session_key = None;
        self.remote_vc = None;
        self.heartbeat_at = None;
        self.idle_deadline = None;
        self.handshake_deadline = Some(now + config.handshake_timeout);
    }

    /// Terminal transition. Timers are cleared so lazily popped deadlines
    /// no longer match.
    pub fn close(&mut self) {
        debug!("conn {:?}: {:?} -> Closed", self.scid, self.state);
        self.state = State::Closed;
        self.handshake_deadline = None;
        self.heartbeat_at = None;
        self.idle_deadline = None;
    }

    /// Records peer activity: refreshes the idle deadline on established
    /// connections.
    pub fn touch(&mut self, now: time::Instant, config: &Config) {
        self.last_activity = now;
        if self.state == State::Established {
            self.idle_deadline = Some(now + config.idle_timeout);
        }
    }

    /// Allocates the next outgoing packet number.
    pub fn next_pkt_num(&mut self) -> u64 {
        let pn = self.next_tx;
        self.next_tx += 1;
        pn
    }

    pub fn next_tx(&self) -> u64 {
        self.next_tx
    }

    /// Records a received packet number. Returns false for duplicates and
    /// regressions, which the caller drops.
    pub fn record_rx(&mut self, pkt_num: u64) -> bool {
        if let Some(highest) = self.highest_rx {
            if pkt_num <= highest {
                debug!(
                    "conn {:?}: dup/regressed pkt num {pkt_num} (highest {highest})",
                    self.scid
                );
                return false;
            }
        }
        self.highest_rx = Some(pkt_num);
        self.ack_queue.push(pkt_num);
        true
    }

    pub fn highest_rx(&self) -> Option<u64> {
        self.highest_rx
    }

    /// Takes the pending ack queue for piggybacking; empty when nothing is
    /// owed.
    pub fn drain_acks(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.ack_queue)
    }

    /// Counts a PROTECTED payload that failed to parse after decryption.
    /// Returns true when the failure budget is exhausted.
    pub fn on_decrypt_failure(&mut self) -> bool {
        self.decrypt_failures += 1;
        self.decrypt_failures >= DECRYPT_FAILURE_LIMIT
    }

    pub fn note_decrypt_ok(&mut self) {
        self.decrypt_failures = 0;
    }

    pub fn matches_peer(&self, addr: SocketAddr) -> bool {
        self.peer == addr
    }

    /// Device id, synthesized from the peer-facing CID when the credential
    /// exchange has not named one yet.
    pub fn effective_device_id(&self) -> String {
        if !self.device_id.is_empty() {
            return self.device_id.clone();
        }
        let mac = &self.dcid.as_ref()[..self.dcid.len().min(6)];
        format!("esp32-{}", hex::encode(mac))
    }
}
