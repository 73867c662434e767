pub mod common;
pub mod config;
pub mod conn;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod keys;
pub mod packet;
pub mod payload;
pub mod stream;
pub mod vc;

use common::Error;
use config::Config;
use conn::Conn;
use events::{Event, EventCallback, EventKind, Subscribers};
use packet::Header;
use payload::{Close, DevicePresence, HandshakeAck, Heartbeat, Ownership, VcInit};
use vc::{Credential, CredentialVerifier};

use log::{debug, info, trace, warn};

use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time;

/// Per-connection timers, kept as deadlines on one priority queue so that
/// cancellation on drop is trivial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    Handshake,
    Heartbeat,
    Idle,
}

/// A scheduled deadline for the connection keyed by these CID bytes.
/// Min-heap: the earliest deadline sits at the top.
#[derive(Debug, Eq, PartialEq)]
struct Deadline(time::Instant, Vec<u8>, TimerKind);

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.cmp(&self.0) // reverse the cmp order, so the earliest time is at the top
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// An outbound UDP payload waiting for the I/O loop.
#[derive(Debug)]
pub struct Datagram {
    pub buf: Vec<u8>,
    pub dst: SocketAddr,
}

/// Statistics of the engine.
struct Stats {
    /// Processed UDP packets.
    pkts: u64,

    /// Packets dropped by parsing or demux.
    dropped: u64,

    /// Discovery broadcasts ingested.
    discoveries: u64,

    /// Datagrams queued for sending.
    sent: u64,
}

impl Stats {
    fn new() -> Self {
        Stats {
            pkts: 0,
            dropped: 0,
            discoveries: 0,
            sent: 0,
        }
    }

    // Increment the number of processed packets.
    fn new_pkt(&mut self) {
        self.pkts += 1;
    }

    fn new_drop(&mut self) {
        self.dropped += 1;
    }

    fn new_discovery(&mut self) {
        self.discoveries += 1;
    }

    fn new_sent(&mut self) {
        self.sent += 1;
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "pkts: {}, dropped: {}, discoveries: {}, sent: {}",
            self.pkts, self.dropped, self.discoveries, self.sent
        )
    }
}

/// The QUICVC controller engine.
///
/// A synchronous state machine: the I/O loop feeds it datagrams through
/// `process_packet`, asks `timeout` how long it may sleep, fires
/// `process_timeout` when the deadline passes, and drains queued datagrams
/// and events after every step. All state lives here; nothing suspends.
pub struct Engine {
    config: Config,

    /// Our person identity; the correct-issuer rule compares against it.
    person_id: String,

    /// The credential this engine presents when connecting out.
    local_vc: Arc<Credential>,

    /// External credential verifier capability.
    verifier: Box<dyn CredentialVerifier>,

    /// Connections, keyed by our SCID bytes (the peer echoes them as DCID).
    conns: HashMap<Vec<u8>, Conn>,

    /// Deadlines for every per-connection timer. Entries are invalidated
    /// lazily: a popped deadline fires only if it still matches the
    /// connection's current one.
    deadlines: BinaryHeap<Deadline>,

    /// Service handlers by stream id, shared by all connections.
    handlers: HashMap<u64, stream::ServiceHandler>,

    subscribers: Subscribers,

    /// Events waiting for the caller.
    events: VecDeque<Event>,

    /// Datagrams waiting for the I/O loop.
    outbound: VecDeque<Datagram>,

    /// Statistics.
    stats: Stats,
}

impl Engine {
    pub fn new(
        config: Config,
        person_id: &str,
        local_vc: Credential,
        verifier: Box<dyn CredentialVerifier>,
    ) -> Self {
        Engine {
            config,
            person_id: person_id.to_string(),
            local_vc: Arc::new(local_vc),
            verifier,
            conns: HashMap::new(),
            deadlines: BinaryHeap::new(),
            handlers: HashMap::new(),
            subscribers: Subscribers::new(),
            events: VecDeque::new(),
            outbound: VecDeque::new(),
            stats: Stats::new(),
        }
    }

    /// Opens a client connection to a device and queues its INITIAL packet.
    ///
    /// A connection to the same device or address is closed first: a
    /// mid-claim credential change invalidates the old session.
    pub fn connect(
        &mut self,
        device_id: &str,
        addr: IpAddr,
        port: u16,
        credential: Arc<Credential>,
        now: time::Instant,
    ) -> Result<(), Error> {
        let peer = SocketAddr::new(addr, port);

        let stale: Vec<Vec<u8>> = self
            .conns
            .iter()
            .filter(|(_, c)| c.device_id == device_id || c.matches_peer(peer))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            info!("conn restarted for new claim: {}", hex::encode(&key));
            self.conns.remove(&key);
        }

        let mut conn = Conn::new_client(now, device_id, peer, credential, &self.config);

        let body = handshake::build_vc_init(&conn);
        let frames = frame::build_legacy(frame::FRAME_VC_INIT, &body)?;
        let datagram = long_datagram(&mut conn, packet::Type::Initial, &frames)?;

        let key: Vec<u8> = conn.scid.as_ref().to_vec();
        if let Some(at) = conn.handshake_deadline {
            self.arm(&key, at, TimerKind::Handshake);
        }
        self.conns.insert(key, conn);
        self.queue(datagram);

        info!("conn new added (client): {device_id} @ {peer}");
        Ok(())
    }

    /// Closes every connection for the device id. Silent if none match.
    pub fn disconnect_device(&mut self, device_id: &str) {
        let keys: Vec<Vec<u8>> = self
            .conns
            .iter()
            .filter(|(_, c)| c.effective_device_id() == device_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.local_close(&key, "Disconnected");
        }
    }

    /// Closes every connection to the address. Silent if none match.
    pub fn disconnect_addr(&mut self, peer: SocketAddr) {
        let keys: Vec<Vec<u8>> = self
            .conns
            .iter()
            .filter(|(_, c)| c.matches_peer(peer))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.local_close(&key, "Disconnected");
        }
    }

    /// Wraps `data` in a STREAM frame inside a PROTECTED packet on the
    /// device's established connection.
    pub fn send_service_data(
        &mut self,
        device_id: &str,
        stream_id: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        let key = self
            .conns
            .iter()
            .find(|(_, c)| c.is_established() && c.effective_device_id() == device_id)
            .map(|(k, _)| k.clone())
            .ok_or(Error::NotEstablished)?;

        let mut conn = self.conns.remove(&key).expect("the connection must exist");

        let mut frames = ack_piggyback(&mut conn)?;
        frames.extend(frame::build_stream(stream_id, 0, false, data)?);

        let result = protect(&mut conn, &self.config, &frames);
        self.conns.insert(key, conn);

        self.queue(result?);
        Ok(())
    }

    /// Installs a handler for a stream id, on all current and future
    /// connections.
    pub fn register_service_handler(&mut self, stream_id: u64, handler: stream::ServiceHandler) {
        self.handlers.insert(stream_id, handler);
    }

    /// True iff some connection with that device id is ESTABLISHED.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.conns
            .values()
            .any(|c| c.is_established() && c.effective_device_id() == device_id)
    }

    /// Subscribes a callback to one event kind.
    pub fn subscribe(&mut self, kind: EventKind, callback: EventCallback) {
        self.subscribers.add(kind, callback);
    }

    /// Next queued event, if any.
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Next queued outbound datagram, if any.
    pub fn pop_datagram(&mut self) -> Option<Datagram> {
        self.outbound.pop_front()
    }

    /// Surfaces a UDP send failure from the I/O loop. Transient: the
    /// connection stays up.
    pub fn report_send_failure(&mut self, dst: SocketAddr) {
        warn!("send failure towards {dst}");
        let device_id = self
            .conns
            .values()
            .find(|c| c.matches_peer(dst))
            .map(|c| c.effective_device_id())
            .unwrap_or_default();
        self.emit(Event::Error {
            device_id,
            error: Error::SendFailure,
        });
    }

    /// Process a UDP packet.
    ///
    /// Parser and demux failures drop the packet with a debug log; they are
    /// never surfaced per packet.
    pub fn process_packet(&mut self, buf: &[u8], src: SocketAddr, now: time::Instant) {
        self.stats.new_pkt();
        trace!("-----\nstats: {}", self.stats);

        let mut b = octets::Octets::with_slice(buf);
        let hdr = match Header::from_bytes(&mut b, self.config.connection_id_length) {
            Ok(hdr) => hdr,
            Err(e) => {
                debug!("dropping unparseable packet from {src}: {e}");
                self.stats.new_drop();
                return;
            }
        };
        trace!("pkt header: {hdr:?} from {src}");

        let payload = &buf[b.off()..b.off() + hdr.payload_len];

        // Discovery broadcasts are demuxed before the table: they must not
        // commandeer an established session.
        if hdr.ty == packet::Type::Initial {
            if let Some(presence) = discovery_payload(payload) {
                self.handle_discovery(presence, src, now);
                return;
            }
        }

        // 1. route by DCID; 2. fall back to the peer address
        let key = if self.conns.contains_key(hdr.dcid.as_ref()) {
            Some(hdr.dcid.as_ref().to_vec())
        } else {
            self.conns
                .iter()
                .find(|(_, c)| c.matches_peer(src))
                .map(|(k, _)| k.clone())
        };

        let key = match key {
            Some(key) => key,
            None => {
                if hdr.ty == packet::Type::Initial {
                    self.accept_server(&hdr, payload, src, now);
                } else {
                    debug!("unknown connection for {:?} from {src}, dropped", hdr.dcid);
                    self.stats.new_drop();
                }
                return;
            }
        };

        match hdr.ty {
            packet::Type::Initial | packet::Type::Handshake => {
                self.handle_long(&key, &hdr, payload, now)
            }
            packet::Type::Protected => self.handle_protected(&key, &hdr, payload, now),
        }
    }

    /// Ingests a DISCOVERY broadcast: emits the event and, when an
    /// established peer re-announces as unclaimed, resets that connection
    /// so a fresh claim can proceed.
    fn handle_discovery(&mut self, presence: DevicePresence, src: SocketAddr, now: time::Instant) {
        self.stats.new_discovery();
        debug!("discovery from {src}: {presence:?}");

        if presence.ownership == Some(Ownership::Unclaimed) {
            let key = self
                .conns
                .iter()
                .find(|(_, c)| {
                    c.is_established()
                        && (c.device_id == presence.device_id || c.matches_peer(src))
                })
                .map(|(k, _)| k.clone());

            if let Some(key) = key {
                let conn = self.conns.get_mut(&key).expect("the connection must exist");
                info!(
                    "established peer {} re-broadcast unclaimed, resetting",
                    conn.effective_device_id()
                );
                conn.reset_to_initial(now, &self.config);
                if let Some(at) = conn.handshake_deadline {
                    self.arm(&key, at, TimerKind::Handshake);
                }
            }
        }

        self.emit(Event::DeviceDiscovered { info: presence });
    }

    /// Accepts a server-side connection from an unmatched INITIAL carrying
    /// VC_INIT. SCID/DCID swap at acceptance; the table keys by our SCID.
    fn accept_server(&mut self, hdr: &Header, payload: &[u8], src: SocketAddr, now: time::Instant) {
        let frames = match frame::parse_frames(payload, packet::Type::Initial) {
            Ok(frames) => frames,
            Err(e) => {
                debug!("unparseable INITIAL from {src}: {e}");
                self.stats.new_drop();
                return;
            }
        };

        let body = frames.iter().find_map(|f| match f {
            frame::Frame::VcInit { payload } => Some(payload.clone()),
            _ => None,
        });

        let body = match body {
            Some(body) => body,
            None => {
                debug!("INITIAL without VC_INIT or DISCOVERY from {src}, dropped");
                self.stats.new_drop();
                return;
            }
        };

        let init = match VcInit::from_bytes(&body) {
            Ok(init) => init,
            Err(e) => {
                debug!("malformed VC_INIT from {src}: {e}");
                self.stats.new_drop();
                return;
            }
        };

        let mut conn = Conn::new_server(
            now,
            src,
            &hdr.dcid,
            &hdr.scid,
            self.local_vc.clone(),
            &self.config,
        );
        conn.record_rx(hdr.pkt_num);

        let subject = init.subject.clone().unwrap_or_default();
        let accepted = self
            .verifier
            .verify(&init.credential, &subject)
            .and_then(|verified| handshake::server_accept(&mut conn, &init, verified, &self.person_id));

        match accepted {
            Ok(()) => {
                let client_challenge = init.challenge.clone().unwrap_or_default();
                let body = handshake::build_vc_response(&conn, &self.person_id, &client_challenge);
                let frames = match frame::build_legacy(frame::FRAME_VC_RESPONSE, &body) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!("could not build VC_RESPONSE: {e}");
                        return;
                    }
                };
                let datagram = match long_datagram(&mut conn, packet::Type::Handshake, &frames) {
                    Ok(datagram) => datagram,
                    Err(e) => {
                        warn!("could not build HANDSHAKE packet: {e}");
                        return;
                    }
                };

                let key: Vec<u8> = conn.scid.as_ref().to_vec();
                info!("conn new added (server): {} @ {src}", conn.device_id);
                if let Some(at) = conn.handshake_deadline {
                    self.arm(&key, at, TimerKind::Handshake);
                }
                self.conns.insert(key, conn);
                self.queue(datagram);
            }
            Err(e) => {
                warn!("rejecting credential from {src}: {e}");
                let device_id = if subject.is_empty() {
                    conn.effective_device_id()
                } else {
                    subject
                };
                self.emit(Event::Error {
                    device_id: device_id.clone(),
                    error: Error::InvalidCredential,
                });
                self.emit(Event::ConnectionClosed {
                    device_id,
                    reason: String::from(e),
                });
            }
        }
    }

    /// Handles an INITIAL or HANDSHAKE packet for a known connection:
    /// the credential exchange state machine.
    fn handle_long(&mut self, key: &[u8], hdr: &Header, payload: &[u8], now: time::Instant) {
        let frames = match frame::parse_frames(payload, hdr.ty) {
            Ok(frames) => frames,
            Err(e) => {
                debug!("unparseable long packet payload: {e}");
                self.stats.new_drop();
                return;
            }
        };

        let mut conn = self.conns.remove(key).expect("the connection must exist");
        conn.record_rx(hdr.pkt_num);
        conn.touch(now, &self.config);

        for f in frames {
            match f {
                frame::Frame::VcInit { .. } => {
                    // retransmitted claim; the acceptance path already
                    // answered it
                    debug!("VC_INIT on existing conn {:?}, ignored", conn.scid);
                }

                frame::Frame::VcResponse { payload } => {
                    if conn.is_server || conn.is_established() {
                        debug!("unexpected VC_RESPONSE on {:?}", conn.scid);
                        continue;
                    }
                    match HandshakeAck::from_bytes(&payload) {
                        Ok(ack) => self.client_response(&mut conn, &ack, now),
                        Err(e) => debug!("malformed VC_RESPONSE: {e}"),
                    }
                    if conn.is_closed() {
                        break;
                    }
                }

                frame::Frame::VcAck { .. } => {
                    if conn.is_server && conn.state() == conn::State::Handshake {
                        conn.establish(now, &self.config);
                        let device_id = conn.effective_device_id();
                        let verified = conn.remote_vc.clone().expect("established implies verified");
                        info!("conn established (server): {device_id}");
                        if let Some(at) = conn.heartbeat_at {
                            self.arm(key, at, TimerKind::Heartbeat);
                        }
                        if let Some(at) = conn.idle_deadline {
                            self.arm(key, at, TimerKind::Idle);
                        }
                        self.emit(Event::HandshakeComplete {
                            device_id: device_id.clone(),
                        });
                        self.emit(Event::ConnectionEstablished { device_id, verified });
                    } else {
                        debug!("unexpected VC_ACK on {:?}", conn.scid);
                    }
                }

                frame::Frame::Discovery { payload } => {
                    // presence info piggybacked inside a HANDSHAKE packet
                    if let Ok(info) = DevicePresence::from_bytes(&payload) {
                        self.stats.new_discovery();
                        self.emit(Event::DeviceDiscovered { info });
                    }
                }

                frame::Frame::ConnectionClose { payload } => {
                    let close = Close::from_bytes(&payload);
                    info!("peer closed {:?}: {}", conn.scid, close.reason);
                    conn.close();
                    self.emit(Event::ConnectionClosed {
                        device_id: conn.effective_device_id(),
                        reason: close.reason,
                    });
                    break;
                }

                frame::Frame::Heartbeat { .. } | frame::Frame::Ack { .. } | frame::Frame::Ping => {
                    trace!("keep-alive frame in long packet");
                }

                frame::Frame::Stream { .. } => {
                    debug!("STREAM frame in long packet, dropped");
                }
            }
        }

        if !conn.is_closed() {
            self.conns.insert(key.to_vec(), conn);
        }
    }

    /// Client side of the VC exchange: applies a VC_RESPONSE to a pending
    /// claim.
    fn client_response(&mut self, conn: &mut Conn, ack: &HandshakeAck, now: time::Instant) {
        match handshake::client_accept(conn, ack, &self.person_id, now, &self.config) {
            Ok(()) => {
                let device_id = conn.effective_device_id();
                let verified = conn.remote_vc.clone().expect("established implies verified");
                info!("conn established (client): {device_id}");

                let key: Vec<u8> = conn.scid.as_ref().to_vec();
                if let Some(at) = conn.heartbeat_at {
                    self.arm(&key, at, TimerKind::Heartbeat);
                }
                if let Some(at) = conn.idle_deadline {
                    self.arm(&key, at, TimerKind::Idle);
                }

                // complete the exchange
                let body = handshake::build_vc_ack(conn);
                match frame::build_legacy(frame::FRAME_VC_ACK, &body)
                    .and_then(|frames| long_datagram(conn, packet::Type::Handshake, &frames))
                {
                    Ok(datagram) => self.queue(datagram),
                    Err(e) => warn!("could not build VC_ACK: {e}"),
                }

                self.emit(Event::HandshakeComplete {
                    device_id: device_id.clone(),
                });
                self.emit(Event::ConnectionEstablished { device_id, verified });
            }
            Err(e) => {
                let device_id = conn.effective_device_id();
                warn!("claim of {device_id} failed: {e}");
                conn.close();
                if e == Error::InvalidCredential {
                    self.emit(Event::Error {
                        device_id: device_id.clone(),
                        error: e.clone(),
                    });
                }
                self.emit(Event::ConnectionClosed {
                    device_id,
                    reason: String::from(e),
                });
            }
        }
    }

    /// Handles a PROTECTED packet: decrypt, dedupe, dispatch frames.
    fn handle_protected(&mut self, key: &[u8], hdr: &Header, payload: &[u8], now: time::Instant) {
        let mut conn = self.conns.remove(key).expect("the connection must exist");

        if !conn.is_established() {
            debug!("PROTECTED before establishment on {:?}, dropped", conn.scid);
            self.stats.new_drop();
            self.conns.insert(key.to_vec(), conn);
            return;
        }

        let mut data = payload.to_vec();
        if self.config.enable_encryption {
            if let Some(session_key) = &conn.session_key {
                keys::apply_keystream(session_key, &mut data);
            }
        }

        let frames = match frame::parse_frames(&data, packet::Type::Protected) {
            Ok(frames) => frames,
            Err(e) => {
                debug!("undecryptable PROTECTED payload on {:?}: {e}", conn.scid);
                self.stats.new_drop();
                if conn.on_decrypt_failure() {
                    let device_id = conn.effective_device_id();
                    warn!("closing {device_id}: repeated decryption failures");
                    conn.close();
                    self.emit(Event::ConnectionClosed {
                        device_id,
                        reason: "Decryption failure".to_string(),
                    });
                } else {
                    self.conns.insert(key.to_vec(), conn);
                }
                return;
            }
        };

        conn.note_decrypt_ok();

        if !conn.record_rx(hdr.pkt_num) {
            self.stats.new_drop();
            self.conns.insert(key.to_vec(), conn);
            return;
        }

        conn.touch(now, &self.config);

        let device_id = conn.effective_device_id();
        self.emit(Event::PacketReceived {
            device_id: device_id.clone(),
            bytes: payload.len(),
        });

        for f in frames {
            match f {
                frame::Frame::Stream {
                    stream_id, data, ..
                } => self.dispatch_stream(&device_id, stream_id, &data),

                frame::Frame::Heartbeat { payload } => {
                    if let Ok(hb) = Heartbeat::from_bytes(&payload) {
                        trace!("heartbeat from {device_id}: seq {}", hb.sequence);
                    }
                }

                frame::Frame::Ack { largest, .. } => {
                    trace!("ack from {device_id}: largest {largest}");
                }

                frame::Frame::Ping => trace!("ping from {device_id}"),

                frame::Frame::ConnectionClose { payload } => {
                    let close = Close::from_bytes(&payload);
                    info!("peer closed {device_id}: {}", close.reason);
                    conn.close();
                    self.emit(Event::ConnectionClosed {
                        device_id: device_id.clone(),
                        reason: close.reason,
                    });
                    break;
                }

                frame::Frame::Discovery { payload } => {
                    if let Ok(info) = DevicePresence::from_bytes(&payload) {
                        self.stats.new_discovery();
                        self.emit(Event::DeviceDiscovered { info });
                    }
                }

                _ => debug!("handshake frame in PROTECTED packet, dropped"),
            }
        }

        if !conn.is_closed() {
            self.conns.insert(key.to_vec(), conn);
        }
    }

    /// Routes decoded STREAM data by service id.
    fn dispatch_stream(&mut self, device_id: &str, stream_id: u64, data: &[u8]) {
        match stream::classify(stream_id, data) {
            Ok(stream::StreamEvent::OwnershipRemovalAck(payload)) => {
                self.emit(Event::OwnershipRemovalAck {
                    device_id: device_id.to_string(),
                    payload,
                });
            }
            Ok(stream::StreamEvent::LedResponse(payload)) => {
                self.emit(Event::LedResponse {
                    device_id: device_id.to_string(),
                    payload,
                });
            }
            Ok(stream::StreamEvent::Ignored) => {}
            Ok(stream::StreamEvent::Unregistered) => match self.handlers.get_mut(&stream_id) {
                Some(handler) => handler(device_id, data),
                None => debug!("no handler for stream {stream_id}, dropped"),
            },
            Err(e) => debug!("malformed stream {stream_id} payload: {e}"),
        }
    }

    /// The earliest live deadline, as a sleep duration for the I/O loop.
    /// Stale heap heads are dropped or rescheduled on the way.
    pub fn timeout(&mut self, now: time::Instant) -> Option<time::Duration> {
        loop {
            let (at, cid, kind) = match self.deadlines.peek() {
                None => return None, // no timer armed, wait for the next packet
                Some(Deadline(at, cid, kind)) => (*at, cid.clone(), *kind),
            };

            match self.current_deadline(&cid, kind) {
                Some(current) if current > at => {
                    // rescheduled; track the new deadline
                    self.deadlines.pop();
                    self.deadlines.push(Deadline(current, cid, kind));
                }
                Some(current) => return Some(current.saturating_duration_since(now)),
                None => {
                    self.deadlines.pop();
                }
            }
        }
    }

    /// Fires every due timer.
    pub fn process_timeout(&mut self, now: time::Instant) {
        loop {
            let due = match self.deadlines.peek() {
                Some(Deadline(at, _, _)) if *at <= now => true,
                _ => false,
            };
            if !due {
                break;
            }

            let Deadline(at, cid, kind) = self.deadlines.pop().expect("peeked entry exists");

            match self.current_deadline(&cid, kind) {
                None => continue, // connection gone or timer cancelled
                Some(current) if current > now => {
                    // moved into the future; re-track and keep draining
                    self.deadlines.push(Deadline(current, cid, kind));
                    continue;
                }
                Some(_) => {}
            }

            trace!("timer {kind:?} fired for {} ({at:?})", hex::encode(&cid));
            match kind {
                TimerKind::Handshake => self.fire_handshake_timeout(&cid, now),
                TimerKind::Heartbeat => self.fire_heartbeat(&cid, now),
                TimerKind::Idle => self.fire_idle(&cid),
            }
        }
    }

    fn current_deadline(&self, cid: &[u8], kind: TimerKind) -> Option<time::Instant> {
        let conn = self.conns.get(cid)?;
        match kind {
            TimerKind::Handshake => conn.handshake_deadline,
            TimerKind::Heartbeat => conn.heartbeat_at,
            TimerKind::Idle => conn.idle_deadline,
        }
    }

    /// Handshake deadline passed. If a newer established connection to the
    /// same peer exists the stale record is dropped silently; otherwise the
    /// connection closes with a timeout error.
    fn fire_handshake_timeout(&mut self, cid: &[u8], _now: time::Instant) {
        let (device_id, peer, created_at) = {
            let conn = self.conns.get(cid).expect("the connection must exist");
            (conn.device_id.clone(), conn.peer, conn.created_at)
        };

        let superseded = self.conns.iter().any(|(k, c)| {
            k.as_slice() != cid
                && c.is_established()
                && c.created_at > created_at
                && ((!device_id.is_empty() && c.device_id == device_id) || c.matches_peer(peer))
        });

        let mut conn = self.conns.remove(cid).expect("the connection must exist");
        conn.close();

        if superseded {
            info!(
                "handshake timer on superseded conn {:?}, dropped silently",
                conn.scid
            );
            return;
        }

        let device_id = conn.effective_device_id();
        warn!("handshake timeout for {device_id}");
        self.emit(Event::Error {
            device_id: device_id.clone(),
            error: Error::HandshakeTimeout,
        });
        self.emit(Event::ConnectionClosed {
            device_id,
            reason: String::from(Error::HandshakeTimeout),
        });
    }

    /// Sends a keep-alive on an established connection and re-arms the
    /// timer.
    fn fire_heartbeat(&mut self, cid: &[u8], now: time::Instant) {
        let mut conn = self.conns.remove(cid).expect("the connection must exist");

        if conn.is_established() {
            let body = Heartbeat {
                timestamp: common::unix_millis(),
                sequence: conn.next_tx(),
            }
            .to_bytes();

            let datagram = ack_piggyback(&mut conn)
                .and_then(|mut frames| {
                    frames.extend(frame::build_legacy(frame::FRAME_HEARTBEAT, &body)?);
                    protect(&mut conn, &self.config, &frames)
                });

            conn.heartbeat_at = Some(now + self.config.heartbeat_interval);
            if let Some(at) = conn.heartbeat_at {
                self.arm(cid, at, TimerKind::Heartbeat);
            }

            match datagram {
                Ok(datagram) => self.queue(datagram),
                Err(e) => warn!("could not build heartbeat: {e}"),
            }
        }

        self.conns.insert(cid.to_vec(), conn);
    }

    /// Idle deadline passed with no inbound traffic: close the connection.
    fn fire_idle(&mut self, cid: &[u8]) {
        let mut conn = self.conns.remove(cid).expect("the connection must exist");
        conn.close();

        let device_id = conn.effective_device_id();
        info!(
            "conn removed (idle): {device_id}, {} conns left",
            self.conns.len()
        );
        self.emit(Event::ConnectionClosed {
            device_id,
            reason: String::from(Error::IdleTimeout),
        });
    }

    /// Locally initiated close: notify an established peer, then drop the
    /// record before surfacing the event.
    fn local_close(&mut self, key: &[u8], reason: &str) {
        let mut conn = match self.conns.remove(key) {
            Some(conn) => conn,
            None => return,
        };

        if conn.is_established() {
            let body = Close {
                code: 0,
                reason: reason.to_string(),
            }
            .to_bytes();
            let datagram = frame::build_legacy(frame::FRAME_CONNECTION_CLOSE, &body)
                .and_then(|frames| protect(&mut conn, &self.config, &frames));
            match datagram {
                Ok(datagram) => self.queue(datagram),
                Err(e) => debug!("could not build CONNECTION_CLOSE: {e}"),
            }
        }

        conn.close();
        let device_id = conn.effective_device_id();
        info!("conn removed (local): {device_id}, {} conns left", self.conns.len());
        self.emit(Event::ConnectionClosed {
            device_id,
            reason: reason.to_string(),
        });
    }

    fn arm(&mut self, cid: &[u8], at: time::Instant, kind: TimerKind) {
        self.deadlines.push(Deadline(at, cid.to_vec(), kind));
    }

    fn queue(&mut self, datagram: Datagram) {
        self.stats.new_sent();
        self.outbound.push_back(datagram);
    }

    fn emit(&mut self, event: Event) {
        self.subscribers.dispatch(&event);
        self.events.push_back(event);
    }

    /// Get processed packets.
    pub fn pkts(&self) -> u64 {
        self.stats.pkts
    }

    /// Print the statistics.
    pub fn print_stats(&self) {
        debug!("-----stats: {}", self.stats);
    }

    #[cfg(test)]
    fn conn_count(&self) -> usize {
        self.conns.len()
    }
}

/// Builds a long-header packet towards the connection's peer.
fn long_datagram(
    conn: &mut Conn,
    ty: packet::Type,
    frames: &[u8],
) -> Result<Datagram, Error> {
    let pkt_num = conn.next_pkt_num();
    let buf = packet::build_long(ty, &conn.dcid, &conn.scid, &[], pkt_num, frames)?;
    Ok(Datagram {
        buf,
        dst: conn.peer,
    })
}

/// Builds a PROTECTED packet, XOR-protecting the payload with the session
/// key. Header bytes stay clear.
fn protect(conn: &mut Conn, config: &Config, frames: &[u8]) -> Result<Datagram, Error> {
    let pkt_num = conn.next_pkt_num();
    let mut buf = packet::build_short(&conn.dcid, pkt_num, frames)?;

    if config.enable_encryption {
        let session_key = conn.session_key.as_ref().ok_or(Error::InvalidState)?;
        let offset = buf.len() - frames.len();
        keys::apply_keystream(session_key, &mut buf[offset..]);
    }

    Ok(Datagram {
        buf,
        dst: conn.peer,
    })
}

/// ACK piggyback for the next outbound PROTECTED packet; empty when the
/// peer is owed nothing.
fn ack_piggyback(conn: &mut Conn) -> Result<Vec<u8>, Error> {
    let pending = conn.drain_acks();
    match pending.iter().max() {
        Some(largest) => frame::build_ack(*largest, 0),
        None => Ok(Vec::new()),
    }
}

/// A lone DISCOVERY frame at the head of an INITIAL payload, decoded.
fn discovery_payload(payload: &[u8]) -> Option<DevicePresence> {
    let frames = frame::parse_frames(payload, packet::Type::Initial).ok()?;
    match frames.first() {
        Some(frame::Frame::Discovery { payload }) => DevicePresence::from_bytes(payload).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::AckStatus;
    use std::net::Ipv4Addr;

    const PEER: &str = "192.168.1.50:49497";

    struct StubVerifier {
        issuer: &'static str,
    }

    impl CredentialVerifier for StubVerifier {
        fn verify(
            &self,
            credential: &[u8],
            expected_subject: &str,
        ) -> Result<vc::VerifiedInfo, Error> {
            let raw: serde_json::Value =
                serde_json::from_slice(credential).map_err(|_| Error::InvalidCredential)?;
            Ok(vc::VerifiedInfo {
                issuer_person_id: self.issuer.to_string(),
                subject_device_id: expected_subject.to_string(),
                subject_public_key: vec![],
                raw,
            })
        }
    }

    fn peer_addr() -> SocketAddr {
        PEER.parse().unwrap()
    }

    fn controller_vc() -> Credential {
        Credential::from_value(serde_json::json!({
            "id": "vc-ctrl",
            "issuer": "p-owner",
            "subject": "controller-1",
            "proof": "ctrl-sig",
        }))
    }

    fn engine() -> Engine {
        Engine::new(
            Config::default(),
            "p-owner",
            controller_vc(),
            Box::new(StubVerifier { issuer: "p-owner" }),
        )
    }

    fn drain_events(engine: &mut Engine) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(e) = engine.pop_event() {
            events.push(e);
        }
        events
    }

    /// Starts a claim and returns the INITIAL header the engine emitted.
    fn start_claim(engine: &mut Engine, now: time::Instant) -> Header<'static> {
        engine
            .connect(
                "esp32-aabbcc",
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)),
                49497,
                Arc::new(controller_vc()),
                now,
            )
            .unwrap();

        let datagram = engine.pop_datagram().unwrap();
        assert_eq!(datagram.dst, peer_addr());
        // 0xC0: long header, fixed bit, INITIAL, 1-byte packet number
        assert_eq!(datagram.buf[0], 0xc0);
        assert_eq!(&datagram.buf[1..5], &[0x00, 0x00, 0x00, 0x01]);

        let hdr = Header::from_slice(&datagram.buf, 0).unwrap();
        assert_eq!(hdr.dcid.len(), 8);
        assert_eq!(hdr.scid.len(), 8);
        hdr
    }

    /// Builds the peer's VC_RESPONSE handshake packet for a claim.
    fn vc_response_packet(client_hdr: &Header, status: &str, owner: &str) -> Vec<u8> {
        let body = serde_json::to_vec(&serde_json::json!({
            "status": status,
            "owner": owner,
            "device_id": "esp32-aabbcc",
        }))
        .unwrap();
        let frames = frame::build_legacy(frame::FRAME_VC_RESPONSE, &body).unwrap();
        packet::build_long(
            packet::Type::Handshake,
            &client_hdr.scid, // peer echoes our SCID as DCID
            &client_hdr.dcid,
            &[],
            0,
            &frames,
        )
        .unwrap()
    }

    fn established_engine(now: time::Instant) -> (Engine, Header<'static>) {
        let mut engine = engine();
        let hdr = start_claim(&mut engine, now);
        let reply = vc_response_packet(&hdr, "provisioned", "p-owner");
        engine.process_packet(&reply, peer_addr(), now);
        drain_events(&mut engine);
        while engine.pop_datagram().is_some() {}
        (engine, hdr)
    }

    #[test]
    fn unclaimed_claim_establishes() {
        let now = time::Instant::now();
        let mut engine = engine();
        let hdr = start_claim(&mut engine, now);

        let reply = vc_response_packet(&hdr, "provisioned", "p-owner");
        engine.process_packet(&reply, peer_addr(), now);

        let events = drain_events(&mut engine);
        assert_eq!(
            events[0],
            Event::HandshakeComplete {
                device_id: "esp32-aabbcc".into()
            }
        );
        match &events[1] {
            Event::ConnectionEstablished {
                device_id,
                verified,
            } => {
                assert_eq!(device_id, "esp32-aabbcc");
                assert_eq!(verified.issuer_person_id, "p-owner");
            }
            other => panic!("expected ConnectionEstablished, got {other:?}"),
        }

        assert!(engine.is_connected("esp32-aabbcc"));

        // the exchange completes with VC_ACK
        let ack = engine.pop_datagram().unwrap();
        let ack_hdr = Header::from_slice(&ack.buf, 0).unwrap();
        assert_eq!(ack_hdr.ty, packet::Type::Handshake);
    }

    #[test]
    fn already_owned_by_us_establishes() {
        let now = time::Instant::now();
        let mut engine = engine();
        let hdr = start_claim(&mut engine, now);

        let reply = vc_response_packet(&hdr, "already_owned", "p-owner");
        engine.process_packet(&reply, peer_addr(), now);

        assert!(engine.is_connected("esp32-aabbcc"));
        let events = drain_events(&mut engine);
        assert!(matches!(events[1], Event::ConnectionEstablished { .. }));
    }

    #[test]
    fn already_owned_by_other_closes() {
        let now = time::Instant::now();
        let mut engine = engine();
        let hdr = start_claim(&mut engine, now);

        let reply = vc_response_packet(&hdr, "already_owned", "p-intruder");
        engine.process_packet(&reply, peer_addr(), now);

        let events = drain_events(&mut engine);
        assert_eq!(
            events,
            vec![Event::ConnectionClosed {
                device_id: "esp32-aabbcc".into(),
                reason: "Owned by different user: p-intruder".into(),
            }]
        );
        assert!(!engine.is_connected("esp32-aabbcc"));
        assert_eq!(engine.conn_count(), 0); // no zombie entry
    }

    #[test]
    fn discovery_only_emits_without_connection() {
        let now = time::Instant::now();
        let mut engine = engine();

        let body = br#"{"t":"DevicePresence","i":"esp32-112233","s":"online","o":"unclaimed"}"#;
        let frames = frame::build_legacy(frame::FRAME_DISCOVERY, body).unwrap();
        let scid = packet::ConnectionId::from_random(8);
        let pkt = packet::build_long(
            packet::Type::Initial,
            &packet::ConnectionId::from_vec(vec![0u8; 8]),
            &scid,
            &[],
            0,
            &frames,
        )
        .unwrap();

        engine.process_packet(&pkt, "192.168.1.77:49497".parse().unwrap(), now);

        let events = drain_events(&mut engine);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::DeviceDiscovered { info } => {
                assert_eq!(info.device_id, "esp32-112233");
                assert_eq!(info.ownership, Some(Ownership::Unclaimed));
            }
            other => panic!("expected DeviceDiscovered, got {other:?}"),
        }
        assert_eq!(engine.conn_count(), 0);
    }

    #[test]
    fn led_response_is_surfaced() {
        let now = time::Instant::now();
        let (mut engine, hdr) = established_engine(now);

        let html = br#"<div itemtype="https://example.com/led">
            <span itemprop="$type$">LEDStatusResponse</span>
            <span itemprop="requestId">r1</span></div>"#;
        let frames = frame::build_stream(3, 0, false, html).unwrap();
        let mut pkt = packet::build_short(&hdr.scid, 7, &frames).unwrap();
        let key = keys::derive_session_key("p-owner");
        let offset = pkt.len() - frames.len();
        keys::apply_keystream(&key, &mut pkt[offset..]);

        engine.process_packet(&pkt, peer_addr(), now);

        let events = drain_events(&mut engine);
        let led = events
            .iter()
            .find_map(|e| match e {
                Event::LedResponse { device_id, payload } => Some((device_id, payload)),
                _ => None,
            })
            .expect("led response event");
        assert_eq!(led.0, "esp32-aabbcc");
        assert_eq!(led.1.get("requestId").unwrap(), "r1");
    }

    #[test]
    fn ownership_removal_ack_is_surfaced() {
        let now = time::Instant::now();
        let (mut engine, hdr) = established_engine(now);

        let body = br#"{"type":"ownership_remove_ack"}"#;
        let frames = frame::build_stream(2, 0, false, body).unwrap();
        let mut pkt = packet::build_short(&hdr.scid, 7, &frames).unwrap();
        let key = keys::derive_session_key("p-owner");
        let offset = pkt.len() - frames.len();
        keys::apply_keystream(&key, &mut pkt[offset..]);

        engine.process_packet(&pkt, peer_addr(), now);

        let events = drain_events(&mut engine);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::OwnershipRemovalAck { .. })));
    }

    #[test]
    fn idle_timeout_closes_and_removes() {
        let now = time::Instant::now();
        let (mut engine, _) = established_engine(now);
        assert_eq!(engine.conn_count(), 1);

        let later = now + time::Duration::from_secs(121);
        engine.process_timeout(later);

        let events = drain_events(&mut engine);
        assert!(events.contains(&Event::ConnectionClosed {
            device_id: "esp32-aabbcc".into(),
            reason: "Idle timeout".into(),
        }));
        assert_eq!(engine.conn_count(), 0);
    }

    #[test]
    fn activity_defers_idle_close() {
        let now = time::Instant::now();
        let (mut engine, hdr) = established_engine(now);

        // heartbeat from the peer at +100s resets the idle window
        let body = Heartbeat {
            timestamp: 1,
            sequence: 1,
        }
        .to_bytes();
        let frames = frame::build_legacy(frame::FRAME_HEARTBEAT, &body).unwrap();
        let mut pkt = packet::build_short(&hdr.scid, 9, &frames).unwrap();
        let key = keys::derive_session_key("p-owner");
        let offset = pkt.len() - frames.len();
        keys::apply_keystream(&key, &mut pkt[offset..]);
        engine.process_packet(&pkt, peer_addr(), now + time::Duration::from_secs(100));

        engine.process_timeout(now + time::Duration::from_secs(121));
        let events = drain_events(&mut engine);
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::ConnectionClosed { .. })));
        assert!(engine.is_connected("esp32-aabbcc"));
    }

    #[test]
    fn heartbeat_timer_sends_keepalive() {
        let now = time::Instant::now();
        let (mut engine, hdr) = established_engine(now);

        engine.process_timeout(now + time::Duration::from_secs(31));

        let datagram = engine.pop_datagram().expect("heartbeat datagram");
        let parsed = Header::from_slice(&datagram.buf, 8).unwrap();
        assert_eq!(parsed.ty, packet::Type::Protected);
        assert_eq!(parsed.dcid, hdr.dcid); // towards the peer's CID

        // still alive, timer re-armed
        assert!(engine.is_connected("esp32-aabbcc"));
        assert!(engine.timeout(now + time::Duration::from_secs(31)).is_some());
    }

    #[test]
    fn handshake_timeout_without_response() {
        let now = time::Instant::now();
        let mut engine = engine();
        start_claim(&mut engine, now);

        engine.process_timeout(now + time::Duration::from_secs(6));

        let events = drain_events(&mut engine);
        assert!(events.contains(&Event::Error {
            device_id: "esp32-aabbcc".into(),
            error: Error::HandshakeTimeout,
        }));
        assert!(events.contains(&Event::ConnectionClosed {
            device_id: "esp32-aabbcc".into(),
            reason: "Handshake timeout".into(),
        }));
        assert_eq!(engine.conn_count(), 0);
    }

    #[test]
    fn handshake_timeout_superseded_is_silent() {
        let now = time::Instant::now();
        let mut engine = engine();

        // first claim hangs
        let hdr1 = start_claim(&mut engine, now);

        // second claim to the same peer succeeds
        let later = now + time::Duration::from_secs(2);
        let hdr2 = start_claim(&mut engine, later);
        assert_ne!(hdr1.scid, hdr2.scid);
        let reply = vc_response_packet(&hdr2, "provisioned", "p-owner");
        engine.process_packet(&reply, peer_addr(), later);
        drain_events(&mut engine);

        // connect() already restarted the claim, so only the new conn is
        // left; its handshake deadline is gone and nothing fires
        engine.process_timeout(now + time::Duration::from_secs(6));
        let events = drain_events(&mut engine);
        assert!(events.is_empty());
        assert!(engine.is_connected("esp32-aabbcc"));
    }

    #[test]
    fn unknown_protected_packet_is_dropped() {
        let now = time::Instant::now();
        let mut engine = engine();

        let dcid = packet::ConnectionId::from_random(8);
        let pkt = packet::build_short(&dcid, 0, b"\x01\x00\x00").unwrap();
        engine.process_packet(&pkt, peer_addr(), now);

        assert!(drain_events(&mut engine).is_empty());
        assert_eq!(engine.conn_count(), 0);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let now = time::Instant::now();
        let (mut engine, _) = established_engine(now);

        engine.disconnect_device("esp32-aabbcc");
        let first = drain_events(&mut engine);
        assert_eq!(
            first
                .iter()
                .filter(|e| matches!(e, Event::ConnectionClosed { .. }))
                .count(),
            1
        );
        // peer is notified
        let datagram = engine.pop_datagram().expect("close datagram");
        let hdr = Header::from_slice(&datagram.buf, 8).unwrap();
        assert_eq!(hdr.ty, packet::Type::Protected);

        engine.disconnect_device("esp32-aabbcc");
        assert!(drain_events(&mut engine).is_empty());
        assert_eq!(engine.conn_count(), 0);
    }

    #[test]
    fn discovery_does_not_hijack_established() {
        let now = time::Instant::now();
        let (mut engine, _) = established_engine(now);

        let body = br#"{"t":"DevicePresence","i":"esp32-aabbcc","s":"online","o":"owned"}"#;
        let frames = frame::build_legacy(frame::FRAME_DISCOVERY, body).unwrap();
        let pkt = packet::build_long(
            packet::Type::Initial,
            &packet::ConnectionId::from_vec(vec![0u8; 8]),
            &packet::ConnectionId::from_random(8),
            &[],
            0,
            &frames,
        )
        .unwrap();
        engine.process_packet(&pkt, peer_addr(), now);

        // still established, and the presence was surfaced
        assert!(engine.is_connected("esp32-aabbcc"));
        let events = drain_events(&mut engine);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::DeviceDiscovered { .. })));
    }

    #[test]
    fn unclaimed_broadcast_resets_established() {
        let now = time::Instant::now();
        let (mut engine, _) = established_engine(now);

        let body = br#"{"t":"DevicePresence","i":"esp32-aabbcc","s":"online","o":"unclaimed"}"#;
        let frames = frame::build_legacy(frame::FRAME_DISCOVERY, body).unwrap();
        let pkt = packet::build_long(
            packet::Type::Initial,
            &packet::ConnectionId::from_vec(vec![0u8; 8]),
            &packet::ConnectionId::from_random(8),
            &[],
            0,
            &frames,
        )
        .unwrap();
        engine.process_packet(&pkt, peer_addr(), now);

        // connection survives but drops out of ESTABLISHED for a fresh claim
        assert!(!engine.is_connected("esp32-aabbcc"));
        assert_eq!(engine.conn_count(), 1);
    }

    #[test]
    fn send_service_data_requires_established() {
        let now = time::Instant::now();
        let mut engine = engine();
        start_claim(&mut engine, now);

        let res = engine.send_service_data("esp32-aabbcc", 3, b"{}");
        assert_eq!(res, Err(Error::NotEstablished));
    }

    #[test]
    fn send_service_data_round_trips_through_cipher() {
        let now = time::Instant::now();
        let (mut engine, hdr) = established_engine(now);

        engine
            .send_service_data("esp32-aabbcc", 3, br#"{"cmd":"toggle"}"#)
            .unwrap();

        let datagram = engine.pop_datagram().unwrap();
        let parsed = Header::from_slice(&datagram.buf, 8).unwrap();
        assert_eq!(parsed.ty, packet::Type::Protected);
        assert_eq!(parsed.dcid, hdr.dcid);

        // decrypt as the peer would and find the STREAM frame
        let key = keys::derive_session_key("p-owner");
        let offset = datagram.buf.len() - parsed.payload_len;
        let mut data = datagram.buf[offset..].to_vec();
        keys::apply_keystream(&key, &mut data);
        let frames = frame::parse_frames(&data, packet::Type::Protected).unwrap();
        assert!(frames.iter().any(|f| matches!(
            f,
            frame::Frame::Stream { stream_id: 3, .. }
        )));
    }

    #[test]
    fn registered_handler_receives_unknown_stream() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let now = time::Instant::now();
        let (mut engine, hdr) = established_engine(now);

        let seen: Rc<RefCell<Vec<(String, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        engine.register_service_handler(
            9,
            Box::new(move |device_id, data| {
                sink.borrow_mut().push((device_id.to_string(), data.to_vec()));
            }),
        );

        let frames = frame::build_stream(9, 0, false, b"custom").unwrap();
        let mut pkt = packet::build_short(&hdr.scid, 7, &frames).unwrap();
        let key = keys::derive_session_key("p-owner");
        let offset = pkt.len() - frames.len();
        keys::apply_keystream(&key, &mut pkt[offset..]);
        engine.process_packet(&pkt, peer_addr(), now);

        assert_eq!(
            *seen.borrow(),
            vec![("esp32-aabbcc".to_string(), b"custom".to_vec())]
        );
    }

    #[test]
    fn server_accepts_claim_from_our_device() {
        let now = time::Instant::now();
        let mut engine = engine();

        // a device we own presents its credential
        let device_vc = serde_json::json!({
            "id": "vc-dev",
            "issuer": "p-owner",
            "subject": "esp32-ddeeff",
            "proof": "dev-sig",
        });
        let body = VcInit::to_bytes(&device_vc, &[3u8; 32], 1);
        let frames = frame::build_legacy(frame::FRAME_VC_INIT, &body).unwrap();
        let client_dcid = packet::ConnectionId::from_random(8);
        let client_scid = packet::ConnectionId::from_random(8);
        let pkt = packet::build_long(
            packet::Type::Initial,
            &client_dcid,
            &client_scid,
            &[],
            0,
            &frames,
        )
        .unwrap();

        let device_addr: SocketAddr = "192.168.1.60:49497".parse().unwrap();
        engine.process_packet(&pkt, device_addr, now);

        // VC_RESPONSE goes back in a HANDSHAKE packet with swapped CIDs
        let datagram = engine.pop_datagram().expect("vc_response datagram");
        let hdr = Header::from_slice(&datagram.buf, 0).unwrap();
        assert_eq!(hdr.ty, packet::Type::Handshake);
        assert_eq!(hdr.dcid, client_scid);
        assert_eq!(hdr.scid, client_dcid);
        assert_eq!(engine.conn_count(), 1);

        // the client's VC_ACK completes the exchange
        let ack_body = serde_json::to_vec(&serde_json::json!({"status": "established"})).unwrap();
        let ack_frames = frame::build_legacy(frame::FRAME_VC_ACK, &ack_body).unwrap();
        let ack_pkt = packet::build_long(
            packet::Type::Handshake,
            &client_dcid, // our SCID
            &client_scid,
            &[],
            1,
            &ack_frames,
        )
        .unwrap();
        engine.process_packet(&ack_pkt, device_addr, now);

        assert!(engine.is_connected("esp32-ddeeff"));
        let events = drain_events(&mut engine);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ConnectionEstablished { .. })));
    }

    #[test]
    fn server_rejects_foreign_issuer() {
        let now = time::Instant::now();
        let mut engine = Engine::new(
            Config::default(),
            "p-owner",
            controller_vc(),
            Box::new(StubVerifier {
                issuer: "p-stranger",
            }),
        );

        let device_vc = serde_json::json!({
            "id": "vc-dev",
            "issuer": "p-stranger",
            "subject": "esp32-ddeeff",
        });
        let body = VcInit::to_bytes(&device_vc, &[3u8; 32], 1);
        let frames = frame::build_legacy(frame::FRAME_VC_INIT, &body).unwrap();
        let pkt = packet::build_long(
            packet::Type::Initial,
            &packet::ConnectionId::from_random(8),
            &packet::ConnectionId::from_random(8),
            &[],
            0,
            &frames,
        )
        .unwrap();

        engine.process_packet(&pkt, "192.168.1.60:49497".parse().unwrap(), now);

        let events = drain_events(&mut engine);
        assert!(events.contains(&Event::Error {
            device_id: "esp32-ddeeff".into(),
            error: Error::InvalidCredential,
        }));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ConnectionClosed { .. })));
        assert_eq!(engine.conn_count(), 0);
    }

    #[test]
    fn duplicate_protected_packet_is_dropped() {
        let now = time::Instant::now();
        let (mut engine, hdr) = established_engine(now);

        let frames = frame::build_stream(3, 0, false, br#"{"$type$":"LEDStatusResponse"}"#)
            .unwrap();
        let mut pkt = packet::build_short(&hdr.scid, 7, &frames).unwrap();
        let key = keys::derive_session_key("p-owner");
        let offset = pkt.len() - frames.len();
        keys::apply_keystream(&key, &mut pkt[offset..]);

        engine.process_packet(&pkt, peer_addr(), now);
        let first = drain_events(&mut engine).len();
        assert!(first > 0);

        engine.process_packet(&pkt, peer_addr(), now);
        assert!(drain_events(&mut engine).is_empty());
    }

    #[test]
    fn decrypt_failures_eventually_close() {
        let now = time::Instant::now();
        let (mut engine, hdr) = established_engine(now);

        // ciphertext chosen so the decrypted frame claims 64KB it does not
        // carry, three times
        let key = keys::derive_session_key("p-owner");
        let mut garbage = vec![0x7f, 0xff, 0xff];
        keys::apply_keystream(&key, &mut garbage);
        for pn in [7u64, 8, 9] {
            let pkt = packet::build_short(&hdr.scid, pn, &garbage).unwrap();
            engine.process_packet(&pkt, peer_addr(), now);
        }

        let events = drain_events(&mut engine);
        assert!(events.contains(&Event::ConnectionClosed {
            device_id: "esp32-aabbcc".into(),
            reason: "Decryption failure".into(),
        }));
        assert_eq!(engine.conn_count(), 0);
    }

    #[test]
    fn subscriber_callbacks_fire() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let now = time::Instant::now();
        let mut engine = engine();

        let seen = Rc::new(RefCell::new(0u32));
        let sink = seen.clone();
        engine.subscribe(
            EventKind::DeviceDiscovered,
            Box::new(move |_| *sink.borrow_mut() += 1),
        );

        let body = br#"{"t":"DevicePresence","i":"esp32-1","o":"unclaimed"}"#;
        let frames = frame::build_legacy(frame::FRAME_DISCOVERY, body).unwrap();
        let pkt = packet::build_long(
            packet::Type::Initial,
            &packet::ConnectionId::from_vec(vec![0u8; 8]),
            &packet::ConnectionId::from_random(8),
            &[],
            0,
            &frames,
        )
        .unwrap();
        engine.process_packet(&pkt, peer_addr(), now);

        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn timeout_tracks_earliest_deadline() {
        let now = time::Instant::now();
        let mut engine = engine();
        assert_eq!(engine.timeout(now), None);

        start_claim(&mut engine, now);
        let timeout = engine.timeout(now).unwrap();
        assert!(timeout <= Config::default().handshake_timeout);
        assert!(timeout > time::Duration::from_secs(4));
    }

    #[test]
    fn ack_status_table() {
        // the ack grammar the engine relies on
        for (s, expected) in [
            ("provisioned", Some(AckStatus::Provisioned)),
            ("already_owned", Some(AckStatus::AlreadyOwned)),
            ("revoked", Some(AckStatus::Revoked)),
            ("ownership_revoked", Some(AckStatus::OwnershipRevoked)),
        ] {
            let bytes = serde_json::to_vec(&serde_json::json!({ "status": s })).unwrap();
            let ack = HandshakeAck::from_bytes(&bytes).unwrap();
            assert_eq!(Some(ack.status), expected);
        }
    }
}
