use quicvc::common::unix_millis;
use quicvc::config::Config;
use quicvc::events::Event;
use quicvc::vc::{Credential, JsonCredentialVerifier};
use quicvc::Engine;

use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time;

use log::{debug, warn};

use clap::Parser;

const MAX_RECV_BUF: usize = 1500;

#[derive(Parser)]
struct Args {
    /// UDP bind port; 49497 is the well-known QUICVC port
    #[clap(short, long, default_value = "49497")]
    port: u16,

    /// Our person id; the correct-issuer rule compares against it
    #[clap(long, default_value = "p-local")]
    person_id: String,

    /// Path to a JSON credential file to present; a minimal self-signed
    /// one is generated when omitted
    #[clap(long)]
    credential: Option<String>,

    /// Claim a device on startup, as device-id@ip:port
    #[clap(short, long)]
    connect: Option<String>,

    /// Only ingest discovery broadcasts; never connect
    #[clap(short, long)]
    listen_only: bool,

    /// Handshake timeout in milliseconds
    #[clap(long, default_value = "5000")]
    handshake_timeout: u64,

    /// Heartbeat interval in milliseconds
    #[clap(long, default_value = "30000")]
    heartbeat_interval: u64,

    /// Idle timeout in milliseconds
    #[clap(long, default_value = "120000")]
    idle_timeout: u64,

    /// Connection ID length: 8 (embedded-compatible) or 16
    #[clap(long, default_value = "8")]
    cid_len: usize,

    /// Disable the XOR step on PROTECTED payloads (debug only)
    #[clap(long)]
    no_encrypt: bool,

    /// Frequency to print the stats.(every N packets)
    #[clap(long, default_value = "1000")]
    print_interval: u64,
}

fn load_credential(args: &Args) -> Result<Credential, String> {
    match &args.credential {
        Some(path) => {
            let bytes = std::fs::read(path)
                .map_err(|e| format!("error reading credential {path}: {e}"))?;
            Ok(Credential::from_bytes(bytes))
        }
        None => Ok(Credential::from_value(serde_json::json!({
            "id": format!("vc-{}", args.person_id),
            "issuer": args.person_id,
            "subject": format!("controller-{}", args.person_id),
            "issued_at": unix_millis(),
            "proof": "self-signed",
        }))),
    }
}

fn parse_target(target: &str) -> Result<(String, IpAddr, u16), String> {
    let (device_id, addr) = target
        .split_once('@')
        .ok_or("connect target must be device-id@ip:port")?;
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| format!("bad connect address: {e}"))?;
    Ok((device_id.to_string(), addr.ip(), addr.port()))
}

#[tokio::main]
async fn main() -> Result<(), String> {
    env_logger::builder()
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .init();
    let args: Args = Args::parse();

    let config = Config {
        port: args.port,
        handshake_timeout: time::Duration::from_millis(args.handshake_timeout),
        heartbeat_interval: time::Duration::from_millis(args.heartbeat_interval),
        idle_timeout: time::Duration::from_millis(args.idle_timeout),
        connection_id_length: args.cid_len,
        enable_encryption: !args.no_encrypt,
    };

    // bring the socket up with SO_REUSEADDR and SO_BROADCAST so discovery
    // broadcasts towards 255.255.255.255 arrive on the same socket
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(|e| format!("error creating listening socket: {e}"))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| format!("error setting SO_REUSEADDR: {e}"))?;
    socket
        .set_broadcast(true)
        .map_err(|e| format!("error setting SO_BROADCAST: {e}"))?;
    let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .expect("bind address parses");
    socket
        .bind(&bind_addr.into())
        .map_err(|e| format!("error binding to {bind_addr}: {e}"))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| format!("error setting non-blocking mode: {e}"))?;

    let socket = tokio::net::UdpSocket::from_std(socket.into())
        .map_err(|e| format!("error converting to tokio socket: {e}"))?;

    println!("listening on port {}", config.port);

    let credential = load_credential(&args)?;
    let mut engine = Engine::new(
        config,
        &args.person_id,
        credential.clone(),
        Box::new(JsonCredentialVerifier),
    );

    if let Some(target) = &args.connect {
        if args.listen_only {
            return Err("--connect and --listen-only are mutually exclusive".into());
        }
        let (device_id, ip, port) = parse_target(target)?;
        engine
            .connect(&device_id, ip, port, Arc::new(credential), time::Instant::now())
            .map_err(String::from)?;
        println!("claiming {device_id} at {ip}:{port}");
    }

    let mut buf = [0u8; MAX_RECV_BUF];
    let mut last_print_stats = 0;
    loop {
        // flush engine output before sleeping
        while let Some(datagram) = engine.pop_datagram() {
            if let Err(e) = socket.send_to(&datagram.buf, datagram.dst).await {
                warn!("error sending to {}: {e}", datagram.dst);
                engine.report_send_failure(datagram.dst);
            }
        }
        while let Some(event) = engine.pop_event() {
            print_event(&event);
        }

        let now = time::Instant::now();
        let timeout = engine.timeout(now);

        if timeout == Some(time::Duration::ZERO) {
            // already timeout
            engine.process_timeout(now);
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(timeout.unwrap_or(time::Duration::MAX)) => {
                engine.process_timeout(time::Instant::now());
            }
            r = socket.recv_from(&mut buf) => {
                match r {
                    Ok((len, src)) => {
                        debug!("recv {len} bytes from {src}");
                        engine.process_packet(&buf[..len], src, time::Instant::now());
                    }
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::WouldBlock {
                            continue;
                        }
                        return Err(format!("error receiving datagram: {e}"));
                    }
                }
            }
        }

        if engine.pkts() - last_print_stats >= args.print_interval {
            last_print_stats = engine.pkts();
            engine.print_stats();
        }
    }
}

fn print_event(event: &Event) {
    match event {
        Event::DeviceDiscovered { info } => {
            println!(
                "discovered {} status={} ownership={:?}",
                info.device_id,
                info.status.as_deref().unwrap_or("?"),
                info.ownership,
            );
        }
        Event::HandshakeComplete { device_id } => {
            println!("handshake complete with {device_id}");
        }
        Event::ConnectionEstablished { device_id, verified } => {
            println!(
                "connected to {device_id} (owner {})",
                verified.issuer_person_id
            );
        }
        Event::ConnectionClosed { device_id, reason } => {
            println!("connection to {device_id} closed: {reason}");
        }
        Event::LedResponse { device_id, payload } => {
            println!("led response from {device_id}: {payload}");
        }
        Event::OwnershipRemovalAck { device_id, .. } => {
            println!("ownership removal acknowledged by {device_id}");
        }
        Event::PacketReceived { device_id, bytes } => {
            debug!("packet from {device_id}: {bytes}B");
        }
        Event::Error { device_id, error } => {
            println!("error on {device_id}: {error}");
        }
    }
}
