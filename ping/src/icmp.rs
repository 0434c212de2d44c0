use std::fmt;

use common::Family;
use etherparse::{
    IcmpEchoHeader, Icmpv4Header, Icmpv4Type, Icmpv6Header, Icmpv6Type,
};

use crate::error::ProbeError;

/// A decoded ICMP/ICMPv6 message, reduced to what the prober cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoMessage {
    pub family: Family,
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// Identifier and sequence, only present for echo request/reply
    pub echo: Option<IcmpEchoHeader>,
    pub payload: Vec<u8>,
}

impl EchoMessage {
    pub fn is_echo_reply(&self) -> bool {
        self.icmp_type == self.family.echo_reply_type()
    }

    /// True if this is the reply to the request carrying `identifier` and
    /// `sequence`.
    pub fn answers(&self, identifier: u16, sequence: u16) -> bool {
        match &self.echo {
            Some(echo) => {
                self.is_echo_reply()
                    && echo.id == identifier
                    && echo.seq == sequence
            }
            None => false,
        }
    }
}

impl fmt::Display for EchoMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{type: {}, code: {}, checksum: {:#06x}",
            self.icmp_type, self.code, self.checksum
        )?;
        if let Some(echo) = &self.echo {
            write!(f, ", id: {}, seq: {}", echo.id, echo.seq)?;
        }
        write!(f, ", len: {}}}", self.payload.len())
    }
}

/// Serialize an echo request with an empty payload.
///
/// For IPv4 the checksum covers the whole message. For IPv6 the checksum
/// depends on the pseudo header, which only the kernel knows for sure, so the
/// field is left zero and raw ICMPv6 sockets fill it in on send.
pub fn encode_echo_request(
    family: Family,
    identifier: u16,
    sequence: u16,
) -> Result<Vec<u8>, ProbeError> {
    let echo = IcmpEchoHeader {
        id: identifier,
        seq: sequence,
    };
    let payload: &[u8] = &[];
    let mut buf = Vec::with_capacity(8 + payload.len());

    match family {
        Family::V4 => Icmpv4Header::with_checksum(
            Icmpv4Type::EchoRequest(echo),
            payload,
        )
        .write(&mut buf),
        Family::V6 => {
            Icmpv6Header::new(Icmpv6Type::EchoRequest(echo)).write(&mut buf)
        }
    }
    .map_err(|e| ProbeError::Encode(e.to_string()))?;
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Parse a bare ICMP (IPv4) or ICMPv6 message. Type and code are taken from
/// the wire as is, so unknown messages still report them.
pub fn decode_message(
    bytes: &[u8],
    family: Family,
) -> Result<EchoMessage, ProbeError> {
    let decode_err = |e: etherparse::ReadError| {
        ProbeError::Decode(format!("{} ({} bytes)", e, bytes.len()))
    };
    let msg = match family {
        Family::V4 => {
            let (header, payload) =
                Icmpv4Header::from_slice(bytes).map_err(decode_err)?;
            let echo = match header.icmp_type {
                Icmpv4Type::EchoRequest(echo) | Icmpv4Type::EchoReply(echo) => {
                    Some(echo)
                }
                _ => None,
            };
            EchoMessage {
                family,
                icmp_type: bytes[0],
                code: bytes[1],
                checksum: header.checksum,
                echo,
                payload: payload.to_vec(),
            }
        }
        Family::V6 => {
            let (header, payload) =
                Icmpv6Header::from_slice(bytes).map_err(decode_err)?;
            let echo = match header.icmp_type {
                Icmpv6Type::EchoRequest(echo) | Icmpv6Type::EchoReply(echo) => {
                    Some(echo)
                }
                _ => None,
            };
            EchoMessage {
                family,
                icmp_type: bytes[0],
                code: bytes[1],
                checksum: header.checksum,
                echo,
                payload: payload.to_vec(),
            }
        }
    };
    tracing::trace!(%msg, %family, "decoded message");
    Ok(msg)
}

/// Turn an echo request into the reply a compliant host would send back.
#[cfg(test)]
pub(crate) fn reply_to(request: &[u8], family: Family) -> Vec<u8> {
    let mut reply = request.to_vec();
    reply[0] = family.echo_reply_type();
    if family == Family::V4 {
        reply[2] = 0;
        reply[3] = 0;
        let sum = internet_checksum(&reply);
        reply[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    reply
}

/// RFC 1071 one's complement checksum
#[cfg(test)]
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_v4_request() {
        let bytes = encode_echo_request(Family::V4, 0x1234, 1).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], 8);
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[4..8], &[0x12, 0x34, 0x00, 0x01]);
        // A valid checksum sums to zero over the whole message
        assert_eq!(internet_checksum(&bytes), 0);
    }

    #[test]
    fn encode_v6_request() {
        let bytes = encode_echo_request(Family::V6, 0xbeef, 1).unwrap();
        assert_eq!(bytes, [128, 0, 0, 0, 0xbe, 0xef, 0x00, 0x01]);
    }

    #[test]
    fn decode_reply_from_responder() {
        for family in [Family::V4, Family::V6] {
            let request = encode_echo_request(family, 4242, 1).unwrap();
            let reply = reply_to(&request, family);
            let msg = decode_message(&reply, family).unwrap();

            assert_eq!(msg.icmp_type, family.echo_reply_type());
            assert!(msg.is_echo_reply());
            assert_eq!(msg.echo.map(|e| e.id), Some(4242));
            assert!(msg.answers(4242, 1));
            assert!(!msg.answers(4243, 1));
            assert!(msg.payload.is_empty());
        }
    }

    #[test]
    fn decode_request_is_not_a_reply() {
        let request = encode_echo_request(Family::V4, 7, 1).unwrap();
        let msg = decode_message(&request, Family::V4).unwrap();
        assert_eq!(msg.icmp_type, 8);
        assert!(!msg.is_echo_reply());
        assert!(!msg.answers(7, 1));
    }

    #[test]
    fn decode_destination_unreachable() {
        // type 3 code 1 (host unreachable), unused, then the offending header
        let mut bytes = vec![3, 1, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0x45; 28]);
        let msg = decode_message(&bytes, Family::V4).unwrap();
        assert_eq!(msg.icmp_type, 3);
        assert_eq!(msg.code, 1);
        assert!(msg.echo.is_none());
        assert!(!msg.is_echo_reply());
        assert!(msg.to_string().starts_with("{type: 3, code: 1"));
    }

    #[test]
    fn decode_truncated() {
        for family in [Family::V4, Family::V6] {
            let request = encode_echo_request(family, 1, 1).unwrap();
            let err = decode_message(&request[..4], family).unwrap_err();
            assert!(matches!(err, ProbeError::Decode(_)), "{err}");
            assert!(decode_message(&[], family).is_err());
        }
    }

    #[test]
    fn display_echo_message() {
        let reply = reply_to(
            &encode_echo_request(Family::V6, 10, 1).unwrap(),
            Family::V6,
        );
        let msg = decode_message(&reply, Family::V6).unwrap();
        assert_eq!(
            msg.to_string(),
            "{type: 129, code: 0, checksum: 0x0000, id: 10, seq: 1, len: 0}"
        );
    }
}
