use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::error::{StunError, StunResult};

/// STUN magic cookie as defined in RFC 8489
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Maximum STUN message size
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// Value XORed into the CRC-32 of FINGERPRINT
pub const FINGERPRINT_XOR: u32 = 0x5354554E;

/// Length of the MESSAGE-INTEGRITY value (HMAC-SHA1)
pub const INTEGRITY_SIZE: usize = 20;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// STUN/TURN methods (RFC 8489 Section 18.2, RFC 8656 Section 17)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    /// Any method this core does not serve; the number is preserved
    Unknown(u16),
}

impl Method {
    /// 12-bit method number
    pub fn code(&self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::Allocate => 0x003,
            Self::Refresh => 0x004,
            Self::Send => 0x006,
            Self::Data => 0x007,
            Self::CreatePermission => 0x008,
            Self::ChannelBind => 0x009,
            Self::Unknown(code) => *code,
        }
    }

    /// Map a method number to a method
    pub fn from_code(code: u16) -> Self {
        match code {
            0x001 => Self::Binding,
            0x003 => Self::Allocate,
            0x004 => Self::Refresh,
            0x006 => Self::Send,
            0x007 => Self::Data,
            0x008 => Self::CreatePermission,
            0x009 => Self::ChannelBind,
            other => Self::Unknown(other),
        }
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(&self) -> u16 {
        match self {
            Self::Request => 0x0000,
            Self::Indication => 0x0010,
            Self::SuccessResponse => 0x0100,
            Self::ErrorResponse => 0x0110,
        }
    }
}

/// STUN message type: a method combined with a class (RFC 8489 Section 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

impl MessageType {
    pub const BINDING_REQUEST: Self = Self::new(Method::Binding, MessageClass::Request);
    pub const ALLOCATE_REQUEST: Self = Self::new(Method::Allocate, MessageClass::Request);
    pub const REFRESH_REQUEST: Self = Self::new(Method::Refresh, MessageClass::Request);
    pub const CREATE_PERMISSION_REQUEST: Self =
        Self::new(Method::CreatePermission, MessageClass::Request);
    pub const CHANNEL_BIND_REQUEST: Self = Self::new(Method::ChannelBind, MessageClass::Request);
    pub const SEND_INDICATION: Self = Self::new(Method::Send, MessageClass::Indication);
    pub const DATA_INDICATION: Self = Self::new(Method::Data, MessageClass::Indication);

    pub const fn new(method: Method, class: MessageClass) -> Self {
        Self { method, class }
    }

    /// Create from method and class, `None` when the method exceeds 12 bits
    pub fn from_method_class(method: u16, class: MessageClass) -> Option<Self> {
        if method > 0x0FFF {
            return None;
        }

        Some(Self::new(Method::from_code(method), class))
    }

    /// Decode the 14-bit wire representation
    pub fn from_u16(value: u16) -> Self {
        let class = match value & 0x0110 {
            0x0000 => MessageClass::Request,
            0x0010 => MessageClass::Indication,
            0x0100 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        };

        let method = (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2);
        Self::new(Method::from_code(method), class)
    }

    /// Encode according to RFC 8489 Section 5
    pub fn to_u16(&self) -> u16 {
        let method = self.method.code();
        let m0 = method & 0x000F;
        let m1 = (method & 0x0070) << 1;
        let m2 = (method & 0x0F80) << 2;
        m0 | m1 | m2 | self.class.bits()
    }

    /// Same method, success-response class
    pub fn success(&self) -> Self {
        Self::new(self.method, MessageClass::SuccessResponse)
    }

    /// Same method, error-response class
    pub fn error(&self) -> Self {
        Self::new(self.method, MessageClass::ErrorResponse)
    }
}

/// STUN attribute types used by STUN and TURN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    MappedAddress,
    Username,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    ChannelNumber,
    Lifetime,
    XorPeerAddress,
    Data,
    Realm,
    Nonce,
    XorRelayedAddress,
    RequestedAddressFamily,
    EvenPort,
    RequestedTransport,
    DontFragment,
    XorMappedAddress,
    ReservationToken,
    Software,
    Fingerprint,
    ResponseOrigin,
    /// Attribute this codec does not interpret; kept for re-encoding
    Other(u16),
}

impl AttributeType {
    /// Wire type number
    pub fn code(&self) -> u16 {
        match self {
            Self::MappedAddress => 0x0001,
            Self::Username => 0x0006,
            Self::MessageIntegrity => 0x0008,
            Self::ErrorCode => 0x0009,
            Self::UnknownAttributes => 0x000A,
            Self::ChannelNumber => 0x000C,
            Self::Lifetime => 0x000D,
            Self::XorPeerAddress => 0x0012,
            Self::Data => 0x0013,
            Self::Realm => 0x0014,
            Self::Nonce => 0x0015,
            Self::XorRelayedAddress => 0x0016,
            Self::RequestedAddressFamily => 0x0017,
            Self::EvenPort => 0x0018,
            Self::RequestedTransport => 0x0019,
            Self::DontFragment => 0x001A,
            Self::XorMappedAddress => 0x0020,
            Self::ReservationToken => 0x0022,
            Self::Software => 0x8022,
            Self::Fingerprint => 0x8028,
            Self::ResponseOrigin => 0x802B,
            Self::Other(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x000C => Self::ChannelNumber,
            0x000D => Self::Lifetime,
            0x0012 => Self::XorPeerAddress,
            0x0013 => Self::Data,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0016 => Self::XorRelayedAddress,
            0x0017 => Self::RequestedAddressFamily,
            0x0018 => Self::EvenPort,
            0x0019 => Self::RequestedTransport,
            0x001A => Self::DontFragment,
            0x0020 => Self::XorMappedAddress,
            0x0022 => Self::ReservationToken,
            0x8022 => Self::Software,
            0x8028 => Self::Fingerprint,
            0x802B => Self::ResponseOrigin,
            other => Self::Other(other),
        }
    }

    /// Check if attribute is comprehension-required
    pub fn is_comprehension_required(&self) -> bool {
        self.code() < 0x8000
    }
}

/// STUN transaction ID (96 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate new random transaction ID
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: AttributeType,
    pub value: AttributeValue,
}

/// STUN attribute values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    ResponseOrigin(SocketAddr),
    Username(String),
    Realm(String),
    Nonce(String),
    Software(String),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    ChannelNumber(u16),
    Lifetime(u32),
    /// IANA protocol number, 17 is UDP
    RequestedTransport(u8),
    /// Address family byte, 0x01 IPv4 and 0x02 IPv6
    RequestedAddressFamily(u8),
    Raw(Vec<u8>),
}

impl Attribute {
    pub fn new(attr_type: AttributeType, value: AttributeValue) -> Self {
        Self { attr_type, value }
    }

    /// Encode attribute with trailing padding
    pub fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) {
        let start_pos = buf.len();

        buf.put_u16(self.attr_type.code());
        buf.put_u16(0);

        match &self.value {
            AttributeValue::MappedAddress(addr) => encode_address(buf, addr, false, tid),
            AttributeValue::XorMappedAddress(addr)
            | AttributeValue::XorPeerAddress(addr)
            | AttributeValue::XorRelayedAddress(addr) => encode_address(buf, addr, true, tid),
            AttributeValue::ResponseOrigin(addr) => encode_address(buf, addr, false, tid),
            AttributeValue::Username(text)
            | AttributeValue::Realm(text)
            | AttributeValue::Nonce(text)
            | AttributeValue::Software(text) => buf.put_slice(text.as_bytes()),
            AttributeValue::ErrorCode { code, reason } => {
                buf.put_u16(0);
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            AttributeValue::UnknownAttributes(attrs) => {
                for attr in attrs {
                    buf.put_u16(*attr);
                }
            }
            AttributeValue::ChannelNumber(number) => {
                buf.put_u16(*number);
                buf.put_u16(0);
            }
            AttributeValue::Lifetime(seconds) => buf.put_u32(*seconds),
            AttributeValue::RequestedTransport(protocol) => {
                buf.put_u8(*protocol);
                buf.put_slice(&[0, 0, 0]);
            }
            AttributeValue::RequestedAddressFamily(family) => {
                buf.put_u8(*family);
                buf.put_slice(&[0, 0, 0]);
            }
            AttributeValue::Raw(data) => buf.put_slice(data),
        }

        let value_len = buf.len() - start_pos - 4;
        buf[start_pos + 2..start_pos + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        let padding = (4 - (value_len % 4)) % 4;
        buf.put_bytes(0, padding);
    }

    /// Decode one attribute value of `attr_type` from exactly `data`
    pub fn decode(attr_type: AttributeType, data: &[u8], tid: &TransactionId) -> StunResult<Self> {
        let value = match attr_type {
            AttributeType::MappedAddress => {
                AttributeValue::MappedAddress(decode_address(data, false, tid)?)
            }
            AttributeType::ResponseOrigin => {
                AttributeValue::ResponseOrigin(decode_address(data, false, tid)?)
            }
            AttributeType::XorMappedAddress => {
                AttributeValue::XorMappedAddress(decode_address(data, true, tid)?)
            }
            AttributeType::XorPeerAddress => {
                AttributeValue::XorPeerAddress(decode_address(data, true, tid)?)
            }
            AttributeType::XorRelayedAddress => {
                AttributeValue::XorRelayedAddress(decode_address(data, true, tid)?)
            }
            AttributeType::Username => AttributeValue::Username(decode_text(data)?),
            AttributeType::Realm => AttributeValue::Realm(decode_text(data)?),
            AttributeType::Nonce => AttributeValue::Nonce(decode_text(data)?),
            AttributeType::Software => AttributeValue::Software(decode_text(data)?),
            AttributeType::ErrorCode => {
                if data.len() < 4 {
                    return Err(StunError::InvalidInput);
                }

                let code = (data[2] & 0x07) as u16 * 100 + data[3] as u16;
                AttributeValue::ErrorCode {
                    code,
                    reason: decode_text(&data[4..])?,
                }
            }
            AttributeType::UnknownAttributes => {
                if data.len() % 2 != 0 {
                    return Err(StunError::InvalidInput);
                }

                AttributeValue::UnknownAttributes(
                    data.chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            AttributeType::ChannelNumber => {
                if data.len() != 4 {
                    return Err(StunError::InvalidInput);
                }

                AttributeValue::ChannelNumber(u16::from_be_bytes([data[0], data[1]]))
            }
            AttributeType::Lifetime => {
                if data.len() != 4 {
                    return Err(StunError::InvalidInput);
                }

                AttributeValue::Lifetime(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            AttributeType::RequestedTransport => {
                if data.len() != 4 {
                    return Err(StunError::InvalidInput);
                }

                AttributeValue::RequestedTransport(data[0])
            }
            AttributeType::RequestedAddressFamily => {
                if data.len() != 4 {
                    return Err(StunError::InvalidInput);
                }

                AttributeValue::RequestedAddressFamily(data[0])
            }
            AttributeType::MessageIntegrity => {
                if data.len() != INTEGRITY_SIZE {
                    return Err(StunError::InvalidInput);
                }

                AttributeValue::Raw(data.to_vec())
            }
            AttributeType::Fingerprint => {
                if data.len() != 4 {
                    return Err(StunError::InvalidInput);
                }

                AttributeValue::Raw(data.to_vec())
            }
            _ => AttributeValue::Raw(data.to_vec()),
        };

        Ok(Self { attr_type, value })
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Builder-style variant of [`Message::add_attribute`]
    pub fn with(mut self, attr_type: AttributeType, value: AttributeValue) -> Self {
        self.attributes.push(Attribute::new(attr_type, value));
        self
    }

    /// First attribute of a type
    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// All attributes of a type, in wire order
    pub fn get_attributes(&self, attr_type: AttributeType) -> Vec<&Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.attr_type == attr_type)
            .collect()
    }

    pub fn username(&self) -> Option<&str> {
        match self.get_attribute(AttributeType::Username).map(|a| &a.value) {
            Some(AttributeValue::Username(name)) => Some(name),
            _ => None,
        }
    }

    pub fn realm(&self) -> Option<&str> {
        match self.get_attribute(AttributeType::Realm).map(|a| &a.value) {
            Some(AttributeValue::Realm(realm)) => Some(realm),
            _ => None,
        }
    }

    pub fn lifetime(&self) -> Option<u32> {
        match self.get_attribute(AttributeType::Lifetime).map(|a| &a.value) {
            Some(AttributeValue::Lifetime(seconds)) => Some(*seconds),
            _ => None,
        }
    }

    pub fn channel_number(&self) -> Option<u16> {
        match self.get_attribute(AttributeType::ChannelNumber).map(|a| &a.value) {
            Some(AttributeValue::ChannelNumber(number)) => Some(*number),
            _ => None,
        }
    }

    pub fn requested_transport(&self) -> Option<u8> {
        match self.get_attribute(AttributeType::RequestedTransport).map(|a| &a.value) {
            Some(AttributeValue::RequestedTransport(protocol)) => Some(*protocol),
            _ => None,
        }
    }

    pub fn requested_address_family(&self) -> Option<u8> {
        match self.get_attribute(AttributeType::RequestedAddressFamily).map(|a| &a.value) {
            Some(AttributeValue::RequestedAddressFamily(family)) => Some(*family),
            _ => None,
        }
    }

    /// Every XOR-PEER-ADDRESS, in wire order
    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.attributes
            .iter()
            .filter_map(|a| match a.value {
                AttributeValue::XorPeerAddress(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self.get_attribute(AttributeType::Data).map(|a| &a.value) {
            Some(AttributeValue::Raw(data)) => Some(data),
            _ => None,
        }
    }

    pub fn has_integrity(&self) -> bool {
        self.get_attribute(AttributeType::MessageIntegrity).is_some()
    }

    /// Encode message to bytes.
    ///
    /// Stored MESSAGE-INTEGRITY and FINGERPRINT attributes are skipped; they
    /// are recomputed and appended last when `integrity_key` is given or
    /// `fingerprint` is set.
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> StunResult<Bytes> {
        let mut buf = BytesMut::with_capacity(512);

        buf.put_u16(self.message_type.to_u16());
        buf.put_u16(0);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            if matches!(
                attr.attr_type,
                AttributeType::MessageIntegrity | AttributeType::Fingerprint
            ) {
                continue;
            }

            attr.encode(&mut buf, &self.transaction_id);
        }

        if let Some(key) = integrity_key {
            // Length covers the integrity attribute itself
            let len = buf.len() - HEADER_SIZE + 4 + INTEGRITY_SIZE;
            set_length(&mut buf, len);

            let hash = compute_integrity(key, &buf)?;
            buf.put_u16(AttributeType::MessageIntegrity.code());
            buf.put_u16(INTEGRITY_SIZE as u16);
            buf.put_slice(&hash);
        }

        if fingerprint {
            let len = buf.len() - HEADER_SIZE + 8;
            set_length(&mut buf, len);

            let checksum = CRC32.checksum(&buf) ^ FINGERPRINT_XOR;
            buf.put_u16(AttributeType::Fingerprint.code());
            buf.put_u16(4);
            buf.put_u32(checksum);
        }

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(StunError::InvalidInput);
        }

        let len = buf.len() - HEADER_SIZE;
        set_length(&mut buf, len);
        Ok(buf.freeze())
    }

    /// Decode a STUN message, verifying FINGERPRINT when present.
    pub fn decode(raw: &[u8]) -> StunResult<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(StunError::InvalidInput);
        }

        let mut buf = raw;
        let msg_type_raw = buf.get_u16();
        if msg_type_raw & 0xC000 != 0 {
            return Err(StunError::InvalidInput);
        }

        let msg_len = buf.get_u16() as usize;
        let magic = buf.get_u32();
        if magic != MAGIC_COOKIE {
            return Err(StunError::NotCookie);
        }

        let mut tid_bytes = [0u8; 12];
        buf.copy_to_slice(&mut tid_bytes);
        let transaction_id = TransactionId::from_bytes(tid_bytes);

        if msg_len % 4 != 0 || buf.remaining() != msg_len {
            return Err(StunError::InvalidInput);
        }

        let mut attributes = Vec::new();
        let mut integrity_seen = false;

        while buf.has_remaining() {
            let offset = raw.len() - buf.remaining();
            if buf.remaining() < 4 {
                return Err(StunError::InvalidInput);
            }

            let attr_type = AttributeType::from_code(buf.get_u16());
            let attr_len = buf.get_u16() as usize;
            let padded = attr_len + (4 - (attr_len % 4)) % 4;
            if buf.remaining() < padded {
                return Err(StunError::InvalidInput);
            }

            let attr = Attribute::decode(attr_type, &buf[..attr_len], &transaction_id)?;
            buf.advance(padded);

            if attr_type == AttributeType::Fingerprint {
                // FINGERPRINT must close the message
                if buf.has_remaining() {
                    return Err(StunError::InvalidInput);
                }

                verify_fingerprint(raw, offset, &attr)?;
                attributes.push(attr);
                break;
            }

            // Anything between MESSAGE-INTEGRITY and FINGERPRINT is ignored
            if integrity_seen {
                continue;
            }

            integrity_seen = attr_type == AttributeType::MessageIntegrity;
            attributes.push(attr);
        }

        Ok(Self {
            message_type: MessageType::from_u16(msg_type_raw),
            transaction_id,
            attributes,
        })
    }
}

/// Byte offset of the first attribute of `attr_type` inside an encoded message
pub fn find_attribute_position(raw: &[u8], attr_type: AttributeType) -> Option<usize> {
    let mut pos = HEADER_SIZE;
    while pos + 4 <= raw.len() {
        let code = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
        let len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;
        if code == attr_type.code() {
            return Some(pos);
        }

        pos += 4 + len + (4 - (len % 4)) % 4;
    }

    None
}

/// HMAC-SHA1 over `data`
pub(crate) fn compute_integrity(key: &[u8], data: &[u8]) -> StunResult<[u8; INTEGRITY_SIZE]> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| StunError::ShaFailed)?;
    mac.update(data);

    let mut out = [0u8; INTEGRITY_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn verify_fingerprint(raw: &[u8], offset: usize, attr: &Attribute) -> StunResult<()> {
    let expected = match &attr.value {
        AttributeValue::Raw(data) if data.len() == 4 => {
            u32::from_be_bytes([data[0], data[1], data[2], data[3]])
        }
        _ => return Err(StunError::InvalidInput),
    };

    if CRC32.checksum(&raw[..offset]) ^ FINGERPRINT_XOR != expected {
        return Err(StunError::IntegrityFailed);
    }

    Ok(())
}

fn set_length(buf: &mut BytesMut, len: usize) {
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
}

fn decode_text(data: &[u8]) -> StunResult<String> {
    String::from_utf8(data.to_vec()).map_err(|_| StunError::Utf8Error)
}

fn encode_address(buf: &mut BytesMut, addr: &SocketAddr, xor: bool, tid: &TransactionId) {
    buf.put_u8(0);

    let port = if xor {
        addr.port() ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        addr.port()
    };

    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(port);

            let mut octets = ip.octets();
            if xor {
                for (b, m) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                    *b ^= m;
                }
            }

            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(port);

            let mut octets = ip.octets();
            if xor {
                xor_v6(&mut octets, tid);
            }

            buf.put_slice(&octets);
        }
    }
}

fn decode_address(data: &[u8], xor: bool, tid: &TransactionId) -> StunResult<SocketAddr> {
    if data.len() < 4 {
        return Err(StunError::InvalidInput);
    }

    let family = data[1];
    let port_raw = u16::from_be_bytes([data[2], data[3]]);
    let port = if xor {
        port_raw ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        port_raw
    };

    match family {
        0x01 => {
            if data.len() != 8 {
                return Err(StunError::InvalidInput);
            }

            let mut octets = [0u8; 4];
            octets.copy_from_slice(&data[4..8]);
            if xor {
                for (b, m) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                    *b ^= m;
                }
            }

            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if data.len() != 20 {
                return Err(StunError::InvalidInput);
            }

            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            if xor {
                xor_v6(&mut octets, tid);
            }

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(StunError::UnsupportedIpFamily),
    }
}

fn xor_v6(octets: &mut [u8; 16], tid: &TransactionId) {
    let magic = MAGIC_COOKIE.to_be_bytes();
    let tid = tid.as_bytes();
    for i in 0..4 {
        octets[i] ^= magic[i];
    }

    for i in 0..12 {
        octets[i + 4] ^= tid[i];
    }
}
