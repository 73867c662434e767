use std::time;

/// The well-known QUICVC port. Discovery broadcasts also target this port on
/// 255.255.255.255.
pub const QUICVC_PORT: u16 = 49497;

/// Engine options. Defaults match the embedded peer.
#[derive(Clone, Debug)]
pub struct Config {
    /// UDP bind port.
    pub port: u16,

    /// How long a connection may sit in INITIAL/HANDSHAKE before it is torn
    /// down.
    pub handshake_timeout: time::Duration,

    /// Keep-alive interval on established connections.
    pub heartbeat_interval: time::Duration,

    /// Idle shutdown deadline. Any received packet resets it.
    pub idle_timeout: time::Duration,

    /// Length of locally generated connection IDs. 8 matches the embedded
    /// peer; 16 is accepted for controller-to-controller use.
    pub connection_id_length: usize,

    /// Debug switch. When false the XOR step on PROTECTED payloads is
    /// skipped on both send and receive.
    pub enable_encryption: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: QUICVC_PORT,
            handshake_timeout: time::Duration::from_millis(5_000),
            heartbeat_interval: time::Duration::from_millis(30_000),
            idle_timeout: time::Duration::from_millis(120_000),
            connection_id_length: 8,
            enable_encryption: true,
        }
    }
}
