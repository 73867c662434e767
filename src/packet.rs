/* QUICVC packet serialization and parsing. */
use crate::common::Error;

use log::trace;

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

const TYPE_MASK: u8 = 0x30;
const PKT_NUM_MASK: u8 = 0x03;

pub const MAX_CID_LEN: usize = 16;

/// The only wire version the embedded peer speaks.
pub const PROTOCOL_VERSION_V1: u32 = 0x0000_0001;

#[inline]
pub fn version_is_supported(version: u32) -> bool {
    matches!(version, PROTOCOL_VERSION_V1)
}

/// QUICVC packet type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    /// Initial packet. Carries VC_INIT or a DISCOVERY broadcast.
    Initial,

    /// Handshake packet. Carries VC_RESPONSE / VC_ACK.
    Handshake,

    /// Short header data-plane packet. Payload is XOR-protected by the
    /// session key.
    Protected,
}

/// A QUICVC connection ID.
pub struct ConnectionId<'a>(ConnectionIdInner<'a>);

enum ConnectionIdInner<'a> {
    Vec(Vec<u8>),
    Ref(&'a [u8]),
}

impl<'a> ConnectionId<'a> {
    /// Creates a new connection ID from the given vector.
    #[inline]
    pub const fn from_vec(cid: Vec<u8>) -> Self {
        Self(ConnectionIdInner::Vec(cid))
    }

    /// Creates a new connection ID from the given slice.
    #[inline]
    pub const fn from_ref(cid: &'a [u8]) -> Self {
        Self(ConnectionIdInner::Ref(cid))
    }

    /// Generates a fresh random connection ID of the given length.
    pub fn from_random(len: usize) -> ConnectionId<'static> {
        use rand::RngCore;

        let mut cid = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut cid);
        ConnectionId::from_vec(cid)
    }

    /// Returns a new owning connection ID from the given existing one.
    #[inline]
    pub fn into_owned(self) -> ConnectionId<'static> {
        ConnectionId::from_vec(self.into())
    }
}

impl<'a> Default for ConnectionId<'a> {
    #[inline]
    fn default() -> Self {
        Self::from_vec(Vec::new())
    }
}

impl<'a> From<Vec<u8>> for ConnectionId<'a> {
    #[inline]
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl<'a> From<ConnectionId<'a>> for Vec<u8> {
    #[inline]
    fn from(id: ConnectionId<'a>) -> Self {
        match id.0 {
            ConnectionIdInner::Vec(cid) => cid,
            ConnectionIdInner::Ref(cid) => cid.to_vec(),
        }
    }
}

impl<'a> PartialEq for ConnectionId<'a> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl<'a> Eq for ConnectionId<'a> {}

impl<'a> AsRef<[u8]> for ConnectionId<'a> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        match &self.0 {
            ConnectionIdInner::Vec(v) => v.as_ref(),
            ConnectionIdInner::Ref(v) => v,
        }
    }
}

impl<'a> std::hash::Hash for ConnectionId<'a> {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_ref().hash(state);
    }
}

impl<'a> std::ops::Deref for ConnectionId<'a> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match &self.0 {
            ConnectionIdInner::Vec(v) => v.as_ref(),
            ConnectionIdInner::Ref(v) => v,
        }
    }
}

impl<'a> Clone for ConnectionId<'a> {
    #[inline]
    fn clone(&self) -> Self {
        Self::from_vec(self.as_ref().to_vec())
    }
}

impl<'a> std::fmt::Debug for ConnectionId<'a> {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for c in self.as_ref() {
            write!(f, "{c:02x}")?;
        }

        Ok(())
    }
}

/// A parsed QUICVC packet header.
///
/// `payload_len` bounds the frame bytes that follow the header; for short
/// headers it runs to the end of the datagram.
#[derive(PartialEq, Eq)]
pub struct Header<'a> {
    /// The type of the packet.
    pub ty: Type,

    /// The version of the packet. Zero for short headers.
    pub version: u32,

    /// The destination connection ID of the packet.
    pub dcid: ConnectionId<'a>,

    /// The source connection ID of the packet. Empty for short headers.
    pub scid: ConnectionId<'a>,

    /// The address-validation token. INITIAL only, usually empty.
    pub token: Option<Vec<u8>>,

    /// The packet number.
    pub pkt_num: u64,

    /// The encoded length of the packet number, 1 to 4 bytes.
    pub pkt_num_len: usize,

    /// The length of the frame payload following the header.
    pub payload_len: usize,
}

impl<'a> Header<'a> {
    /// Parses a QUICVC packet header from the given buffer.
    ///
    /// The `dcid_len` parameter is the length of our connection IDs,
    /// required to parse short header packets (they carry no length prefix).
    #[inline]
    pub fn from_slice(buf: &[u8], dcid_len: usize) -> Result<Header<'a>, Error> {
        let mut b = octets::Octets::with_slice(buf);
        Header::from_bytes(&mut b, dcid_len)
    }

    /// Parses a header, leaving `b` positioned at the first payload byte.
    pub fn from_bytes(b: &mut octets::Octets, dcid_len: usize) -> Result<Header<'a>, Error> {
        let first = b.get_u8()?;

        if first & FIXED_BIT == 0 {
            trace!("fixed bit not set, not a QUICVC packet");
            return Err(Error::MalformedHeader);
        }

        if first & FORM_BIT == 0 {
            // Decode short header.
            if dcid_len == 0 {
                // short header without a configured CID length cannot be
                // bounded
                return Err(Error::InvalidState);
            }

            let dcid = b.get_bytes(dcid_len)?;
            let pkt_num_len = (first & PKT_NUM_MASK) as usize + 1;
            let pkt_num = read_pkt_num(b, pkt_num_len)?;

            return Ok(Header {
                ty: Type::Protected,
                version: 0,
                dcid: dcid.to_vec().into(),
                scid: ConnectionId::default(),
                token: None,
                pkt_num,
                pkt_num_len,
                // A short header carries no length field, so it must be the
                // last packet in the UDP datagram.
                payload_len: b.cap(),
            });
        }

        // Decode long header.
        let version = b.get_u32()?;
        if !version_is_supported(version) {
            trace!("unsupported version {version:#x}");
            return Err(Error::MalformedHeader);
        }

        let ty = match (first & TYPE_MASK) >> 4 {
            0x00 => Type::Initial,
            0x02 => Type::Handshake,
            _ => return Err(Error::MalformedHeader),
        };

        let dcid_len = b.get_u8()? as usize;
        if dcid_len > MAX_CID_LEN {
            return Err(Error::MalformedHeader);
        }
        let dcid = b.get_bytes(dcid_len)?.to_vec();

        let scid_len = b.get_u8()? as usize;
        if scid_len > MAX_CID_LEN {
            return Err(Error::MalformedHeader);
        }
        let scid = b.get_bytes(scid_len)?.to_vec();

        let token = match ty {
            Type::Initial => Some(b.get_bytes_with_varint_length()?.to_vec()),
            _ => None,
        };

        // The Length field covers the packet number and the frame payload.
        let length = b.get_varint()? as usize;

        let pkt_num_len = (first & PKT_NUM_MASK) as usize + 1;
        if length < pkt_num_len {
            return Err(Error::MalformedHeader);
        }
        let pkt_num = read_pkt_num(b, pkt_num_len)?;

        let payload_len = length - pkt_num_len;
        if payload_len > b.cap() {
            return Err(Error::MalformedHeader);
        }

        Ok(Header {
            ty,
            version,
            dcid: dcid.into(),
            scid: scid.into(),
            token,
            pkt_num,
            pkt_num_len,
            payload_len,
        })
    }
}

impl<'a> std::fmt::Debug for Header<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.ty)?;

        if self.ty != Type::Protected {
            write!(f, " version={:x}", self.version)?;
        }

        write!(f, " dcid={:?}", self.dcid)?;

        if self.ty != Type::Protected {
            write!(f, " scid={:?}", self.scid)?;
        }

        write!(f, " pn={}", self.pkt_num)?;

        Ok(())
    }
}

fn read_pkt_num(b: &mut octets::Octets, len: usize) -> Result<u64, Error> {
    let bytes = b.get_bytes(len)?;
    Ok(bytes
        .as_ref()
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
}

/// Smallest 1..=4 byte encoding that holds `pkt_num`.
fn pkt_num_len(pkt_num: u64) -> usize {
    match pkt_num {
        n if n < (1 << 8) => 1,
        n if n < (1 << 16) => 2,
        n if n < (1 << 24) => 3,
        _ => 4,
    }
}

fn write_pkt_num(b: &mut octets::OctetsMut, pkt_num: u64, len: usize) -> Result<(), Error> {
    for i in (0..len).rev() {
        b.put_u8((pkt_num >> (i * 8)) as u8)?;
    }
    Ok(())
}

/// Builds a long-header (INITIAL or HANDSHAKE) packet around `payload`.
///
/// The Length varint is written after the payload size is known, so callers
/// pass the complete frame payload.
pub fn build_long(
    ty: Type,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    pkt_num: u64,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    let type_bits = match ty {
        Type::Initial => 0x00,
        Type::Handshake => 0x02,
        Type::Protected => return Err(Error::InvalidState),
    };

    let pn_len = pkt_num_len(pkt_num);
    let length = (pn_len + payload.len()) as u64;

    let mut cap = 1 + 4 + 1 + dcid.len() + 1 + scid.len();
    if ty == Type::Initial {
        cap += octets::varint_len(token.len() as u64) + token.len();
    }
    cap += octets::varint_len(length) + pn_len + payload.len();

    let mut out = vec![0u8; cap];
    let mut b = octets::OctetsMut::with_slice(&mut out);

    let first = FORM_BIT | FIXED_BIT | (type_bits << 4) | (pn_len as u8 - 1);
    b.put_u8(first)?;
    b.put_u32(PROTOCOL_VERSION_V1)?;
    b.put_u8(dcid.len() as u8)?;
    b.put_bytes(dcid.as_ref())?;
    b.put_u8(scid.len() as u8)?;
    b.put_bytes(scid.as_ref())?;
    if ty == Type::Initial {
        b.put_varint(token.len() as u64)?;
        b.put_bytes(token)?;
    }
    b.put_varint(length)?;
    write_pkt_num(&mut b, pkt_num, pn_len)?;
    b.put_bytes(payload)?;

    Ok(out)
}

/// Builds a short-header PROTECTED packet. The DCID is written without a
/// length prefix; the receiver knows its own CID length.
pub fn build_short(
    dcid: &ConnectionId,
    pkt_num: u64,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    let pn_len = pkt_num_len(pkt_num);

    let mut out = vec![0u8; 1 + dcid.len() + pn_len + payload.len()];
    let mut b = octets::OctetsMut::with_slice(&mut out);

    b.put_u8(FIXED_BIT | (pn_len as u8 - 1))?;
    b.put_bytes(dcid.as_ref())?;
    write_pkt_num(&mut b, pkt_num, pn_len)?;
    b.put_bytes(payload)?;

    Ok(out)
}

/// Offset of the first protected payload byte in a short-header packet.
/// Everything before it (flags, DCID, packet number) stays clear.
#[inline]
pub fn short_payload_offset(dcid_len: usize, pkt_num_len: usize) -> usize {
    1 + dcid_len + pkt_num_len
}
