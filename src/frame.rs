//! Frame encode/decode.
//!
//! Two wire profiles coexist. Handshake-era frames use the embedded peer's
//! legacy profile: `[type u8][length u16 BE][payload]`. STREAM frames
//! (0x08..=0x0f) use the RFC-aligned profile with varint stream id, optional
//! varint offset/length, and FIN/LEN/OFF bits in the type byte.

use crate::common::Error;
use crate::packet;

use log::{debug, trace};

pub const FRAME_PING: u8 = 0x01;
pub const FRAME_ACK: u8 = 0x02;
pub const FRAME_STREAM: u8 = 0x08;
pub const FRAME_VC_INIT: u8 = 0x10;
pub const FRAME_VC_RESPONSE: u8 = 0x11;
pub const FRAME_VC_ACK: u8 = 0x12;
pub const FRAME_CONNECTION_CLOSE: u8 = 0x1c;
pub const FRAME_HEARTBEAT: u8 = 0x20;
pub const FRAME_DISCOVERY: u8 = 0x30;

const STREAM_TYPE_MASK: u8 = 0xf8;
const STREAM_FLAG_FIN: u8 = 0x01;
const STREAM_FLAG_LEN: u8 = 0x02;
const STREAM_FLAG_OFF: u8 = 0x04;

/// A decoded QUICVC frame. Inner payloads stay raw here; `payload` decodes
/// them into typed shapes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Ping,

    Ack {
        largest: u64,
        delay: u64,
    },

    VcInit {
        payload: Vec<u8>,
    },

    VcResponse {
        payload: Vec<u8>,
    },

    VcAck {
        payload: Vec<u8>,
    },

    Stream {
        stream_id: u64,
        offset: u64,
        fin: bool,
        data: Vec<u8>,
    },

    Heartbeat {
        payload: Vec<u8>,
    },

    Discovery {
        payload: Vec<u8>,
    },

    ConnectionClose {
        payload: Vec<u8>,
    },
}

/// Parses every frame in a packet payload.
///
/// A DISCOVERY frame inside an INITIAL packet ends parsing: the peer places
/// broadcast HTML/JSON as that frame's payload, not as further frames. In
/// HANDSHAKE and PROTECTED packets parsing continues past DISCOVERY.
pub fn parse_frames(payload: &[u8], packet_type: packet::Type) -> Result<Vec<Frame>, Error> {
    let mut b = octets::Octets::with_slice(payload);
    let mut frames = Vec::new();

    while b.cap() > 0 {
        let ty = b.peek_u8()?;

        if ty == 0 {
            // zero padding runs to the end of the packet
            trace!("padding, {} bytes left", b.cap());
            break;
        }

        if ty & STREAM_TYPE_MASK == FRAME_STREAM {
            frames.push(parse_stream(&mut b)?);
            continue;
        }

        let frame = parse_legacy(&mut b)?;

        let stop = packet_type == packet::Type::Initial
            && matches!(frame, Some(Frame::Discovery { .. }));

        if let Some(frame) = frame {
            frames.push(frame);
        }

        if stop {
            break;
        }
    }

    Ok(frames)
}

/// Parses one legacy-profile frame. Unknown types are skipped (their length
/// prefix makes that safe) and reported as `None`.
fn parse_legacy(b: &mut octets::Octets) -> Result<Option<Frame>, Error> {
    let ty = b.get_u8()?;
    let len = b.get_u16()? as usize;
    let payload = b.get_bytes(len)?.to_vec();

    let frame = match ty {
        FRAME_PING => Frame::Ping,
        FRAME_ACK => parse_ack(&payload)?,
        FRAME_VC_INIT => Frame::VcInit { payload },
        FRAME_VC_RESPONSE => Frame::VcResponse { payload },
        FRAME_VC_ACK => Frame::VcAck { payload },
        FRAME_HEARTBEAT => Frame::Heartbeat { payload },
        FRAME_DISCOVERY => Frame::Discovery { payload },
        FRAME_CONNECTION_CLOSE => Frame::ConnectionClose { payload },
        unknown => {
            debug!("skipping unknown frame type {unknown:#04x} ({len}B)");
            return Ok(None);
        }
    };

    Ok(Some(frame))
}

fn parse_ack(payload: &[u8]) -> Result<Frame, Error> {
    if payload.is_empty() {
        // peer acked nothing specific; keep-alive style ack
        return Ok(Frame::Ack {
            largest: 0,
            delay: 0,
        });
    }

    let mut b = octets::Octets::with_slice(payload);
    let largest = b.get_varint()?;
    let delay = b.get_varint()?;
    // range count and first range are consumed but unused; this engine has
    // no retransmission machinery
    let _ = b.get_varint()?;
    let _ = b.get_varint()?;

    Ok(Frame::Ack { largest, delay })
}

fn parse_stream(b: &mut octets::Octets) -> Result<Frame, Error> {
    let ty = b.get_u8()?;

    let fin = ty & STREAM_FLAG_FIN != 0;
    let has_len = ty & STREAM_FLAG_LEN != 0;
    let has_off = ty & STREAM_FLAG_OFF != 0;

    let stream_id = b.get_varint()?;
    let offset = if has_off { b.get_varint()? } else { 0 };

    let data = if has_len {
        b.get_bytes_with_varint_length()?.to_vec()
    } else {
        // without LEN the data extends to the end of the packet
        b.get_bytes(b.cap())?.to_vec()
    };

    Ok(Frame::Stream {
        stream_id,
        offset,
        fin,
        data,
    })
}

/// Encodes a legacy-profile frame: `[type][len u16 BE][payload]`.
pub fn build_legacy(ty: u8, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::Other("legacy frame payload too large"));
    }

    let mut out = vec![0u8; 3 + payload.len()];
    let mut b = octets::OctetsMut::with_slice(&mut out);
    b.put_u8(ty)?;
    b.put_u16(payload.len() as u16)?;
    b.put_bytes(payload)?;

    Ok(out)
}

/// Encodes an ACK frame (legacy framing around a varint body).
pub fn build_ack(largest: u64, delay: u64) -> Result<Vec<u8>, Error> {
    let mut body = vec![0u8; octets::varint_len(largest) + octets::varint_len(delay) + 2];
    {
        let mut b = octets::OctetsMut::with_slice(&mut body);
        b.put_varint(largest)?;
        b.put_varint(delay)?;
        b.put_varint(0)?; // range count
        b.put_varint(0)?; // first range
    }

    build_legacy(FRAME_ACK, &body)
}

/// Encodes an RFC-profile STREAM frame. The LEN bit is always set so frames
/// compose inside a packet; OFF is set only for a non-zero offset.
pub fn build_stream(
    stream_id: u64,
    offset: u64,
    fin: bool,
    data: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut ty = FRAME_STREAM | STREAM_FLAG_LEN;
    if fin {
        ty |= STREAM_FLAG_FIN;
    }

    let mut cap = 1 + octets::varint_len(stream_id);
    if offset > 0 {
        ty |= STREAM_FLAG_OFF;
        cap += octets::varint_len(offset);
    }
    cap += octets::varint_len(data.len() as u64) + data.len();

    let mut out = vec![0u8; cap];
    let mut b = octets::OctetsMut::with_slice(&mut out);
    b.put_u8(ty)?;
    b.put_varint(stream_id)?;
    if offset > 0 {
        b.put_varint(offset)?;
    }
    b.put_varint(data.len() as u64)?;
    b.put_bytes(data)?;

    Ok(out)
}
