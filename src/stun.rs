//! Minimal STUN message codec
//!
//! Implements just enough of RFC 5389 to classify inbound connections: a
//! connection's first frame must decode as a Binding Request carrying a
//! USERNAME attribute, and the username's prefix (before the first `:`)
//! is the routing key. Encoding exists so callers and tests can build the
//! handshake request themselves.
//!
//! # Wire format
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────┐
//! │ Type (2B)    │ Length (2B)  │ Magic Cookie (4B)   │
//! ├──────────────┴──────────────┴─────────────────────┤
//! │ Transaction ID (12B)                              │
//! ├───────────────────────────────────────────────────┤
//! │ Attributes (TLV, values padded to 4 bytes)        │
//! └───────────────────────────────────────────────────┘
//! ```

use std::fmt;

// ============================================================================
// Constants (RFC 5389)
// ============================================================================

/// Fixed header length
pub const HEADER_LEN: usize = 20;

/// Magic cookie, bytes 4..8 of every message
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Message type of a Binding Request
pub const BINDING_REQUEST: u16 = 0x0001;

/// USERNAME attribute type
pub const ATTR_USERNAME: u16 = 0x0006;

// ============================================================================
// Message
// ============================================================================

/// A decoded STUN message: type, transaction id and raw attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message type (class and method bits combined)
    pub message_type: u16,
    /// 96-bit transaction id
    pub transaction_id: [u8; 12],
    /// Attributes in wire order
    attributes: Vec<StunAttribute>,
}

/// A single attribute, type plus unpadded value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    pub attr_type: u16,
    pub value: Vec<u8>,
}

impl StunMessage {
    /// Create a Binding Request with the given transaction id.
    pub fn binding_request(transaction_id: [u8; 12]) -> Self {
        Self {
            message_type: BINDING_REQUEST,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Append a USERNAME attribute, builder-style.
    pub fn with_username(mut self, username: &str) -> Self {
        self.attributes.push(StunAttribute {
            attr_type: ATTR_USERNAME,
            value: username.as_bytes().to_vec(),
        });
        self
    }

    /// Whether this message is a Binding Request.
    pub fn is_binding_request(&self) -> bool {
        self.message_type == BINDING_REQUEST
    }

    /// Value of the first attribute with the given type, if present.
    pub fn attribute(&self, attr_type: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.attr_type == attr_type)
            .map(|a| a.value.as_slice())
    }

    /// UTF-8 value of the USERNAME attribute, if present and valid.
    pub fn username(&self) -> Option<&str> {
        self.attribute(ATTR_USERNAME)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Decode a message from a complete frame payload.
    pub fn decode(buf: &[u8]) -> Result<Self, StunDecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(StunDecodeError::Truncated);
        }

        let message_type = u16::from_be_bytes([buf[0], buf[1]]);
        // The two most significant bits of a STUN message are zero
        if message_type & 0xC000 != 0 {
            return Err(StunDecodeError::NotStun);
        }

        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if length % 4 != 0 || buf.len() != HEADER_LEN + length {
            return Err(StunDecodeError::LengthMismatch {
                declared: length,
                actual: buf.len().saturating_sub(HEADER_LEN),
            });
        }

        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunDecodeError::BadMagicCookie(cookie));
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..HEADER_LEN]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < buf.len() {
            if buf.len() - offset < 4 {
                return Err(StunDecodeError::AttributeOverrun);
            }
            let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4;

            if buf.len() - offset < attr_len {
                return Err(StunDecodeError::AttributeOverrun);
            }
            attributes.push(StunAttribute {
                attr_type,
                value: buf[offset..offset + attr_len].to_vec(),
            });

            // Values are padded to the next 4-byte boundary
            let padded = (attr_len + 3) & !3;
            if buf.len() - offset < padded {
                return Err(StunDecodeError::AttributeOverrun);
            }
            offset += padded;
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// Encode the message, padding attribute values to 4 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let body_len: usize = self
            .attributes
            .iter()
            .map(|a| 4 + ((a.value.len() + 3) & !3))
            .sum();

        let mut buf = Vec::with_capacity(HEADER_LEN + body_len);
        buf.extend_from_slice(&self.message_type.to_be_bytes());
        buf.extend_from_slice(&(body_len as u16).to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            buf.extend_from_slice(&attr.attr_type.to_be_bytes());
            buf.extend_from_slice(&(attr.value.len() as u16).to_be_bytes());
            buf.extend_from_slice(&attr.value);
            let padding = ((attr.value.len() + 3) & !3) - attr.value.len();
            buf.extend_from_slice(&[0u8; 3][..padding]);
        }

        buf
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons a byte buffer fails to decode as a STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunDecodeError {
    /// Shorter than the fixed header
    Truncated,
    /// Top two bits of the type field set
    NotStun,
    /// Declared body length disagrees with the buffer
    LengthMismatch { declared: usize, actual: usize },
    /// Wrong magic cookie
    BadMagicCookie(u32),
    /// An attribute runs past the end of the body
    AttributeOverrun,
}

impl fmt::Display for StunDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StunDecodeError::Truncated => write!(f, "shorter than a STUN header"),
            StunDecodeError::NotStun => write!(f, "not a STUN message"),
            StunDecodeError::LengthMismatch { declared, actual } => {
                write!(f, "length mismatch: declared {}, got {}", declared, actual)
            }
            StunDecodeError::BadMagicCookie(cookie) => {
                write!(f, "bad magic cookie: 0x{:08x}", cookie)
            }
            StunDecodeError::AttributeOverrun => write!(f, "attribute overruns message body"),
        }
    }
}

impl std::error::Error for StunDecodeError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TXN_ID: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    #[test]
    fn test_binding_request_roundtrip() {
        let msg = StunMessage::binding_request(TXN_ID).with_username("abc:remote");

        let encoded = msg.encode();
        assert_eq!(&encoded[..2], &BINDING_REQUEST.to_be_bytes());
        assert_eq!(&encoded[4..8], &MAGIC_COOKIE.to_be_bytes());

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert!(decoded.is_binding_request());
        assert_eq!(decoded.transaction_id, TXN_ID);
        assert_eq!(decoded.username(), Some("abc:remote"));
    }

    #[test]
    fn test_username_padding() {
        // 5-byte value pads to 8; the decoded value must be unpadded
        let msg = StunMessage::binding_request(TXN_ID).with_username("ab:cd");
        let encoded = msg.encode();
        assert_eq!(encoded.len() % 4, 0);

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.username(), Some("ab:cd"));
    }

    #[test]
    fn test_no_username() {
        let msg = StunMessage::binding_request(TXN_ID);
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.username(), None);
        assert_eq!(decoded.attribute(ATTR_USERNAME), None);
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(
            StunMessage::decode(&[0u8; 12]),
            Err(StunDecodeError::Truncated)
        );
    }

    #[test]
    fn test_bad_magic_cookie() {
        let mut encoded = StunMessage::binding_request(TXN_ID).encode();
        encoded[4] = 0xff;
        assert!(matches!(
            StunMessage::decode(&encoded),
            Err(StunDecodeError::BadMagicCookie(_))
        ));
    }

    #[test]
    fn test_not_stun() {
        // Channel-data style first byte (top bits set)
        let mut encoded = StunMessage::binding_request(TXN_ID).encode();
        encoded[0] = 0x40;
        assert_eq!(StunMessage::decode(&encoded), Err(StunDecodeError::NotStun));
    }

    #[test]
    fn test_length_mismatch() {
        let mut encoded = StunMessage::binding_request(TXN_ID).with_username("abcd").encode();
        // Shrink the declared length without shrinking the buffer
        encoded[3] = 0;
        assert!(matches!(
            StunMessage::decode(&encoded),
            Err(StunDecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_attribute_overrun() {
        let mut buf = StunMessage::binding_request(TXN_ID).encode();
        // Add a 4-byte attribute header that claims 8 bytes of value
        buf.extend_from_slice(&ATTR_USERNAME.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        let body_len = (buf.len() - HEADER_LEN) as u16;
        buf[2..4].copy_from_slice(&body_len.to_be_bytes());
        assert_eq!(
            StunMessage::decode(&buf),
            Err(StunDecodeError::AttributeOverrun)
        );
    }

    #[test]
    fn test_non_utf8_username() {
        let msg = StunMessage {
            message_type: BINDING_REQUEST,
            transaction_id: TXN_ID,
            attributes: vec![StunAttribute {
                attr_type: ATTR_USERNAME,
                value: vec![0xff, 0xfe],
            }],
        };
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert!(decoded.attribute(ATTR_USERNAME).is_some());
        assert_eq!(decoded.username(), None);
    }
}
