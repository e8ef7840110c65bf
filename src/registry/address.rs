//! Address Codec
//!
//! Server addresses and the event message grammar used on a cluster's
//! channel: `<ip:port>-REGISTER` or `<ip:port>-UNREGISTER`.

use crate::error::{Error, Result};
use serde::{Serialize, Serializer};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Separator between the address and the event kind on the wire
pub const EVENT_SEPARATOR: char = '-';

// =============================================================================
// Address
// =============================================================================

/// Network address of a registered server.
///
/// The canonical string form (`ip:port`, IPv6 hosts bracketed) is used both
/// as the hash field name and inside event messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(SocketAddr);

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Reject addresses that cannot be dialled by other processes
    pub fn validate(&self) -> Result<()> {
        if self.0.port() == 0 {
            return Err(Error::InvalidAddress(format!("{}: port must be non-zero", self)));
        }
        if self.0.ip().is_unspecified() {
            return Err(Error::InvalidAddress(format!(
                "{}: unspecified host is not routable",
                self
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Strict `ip:port`; surrounding whitespace is rejected
    fn from_str(s: &str) -> Result<Self> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", s, e)))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// =============================================================================
// Event Kind
// =============================================================================

/// Kind of membership change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Register,
    Unregister,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Register => "REGISTER",
            EventKind::Unregister => "UNREGISTER",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REGISTER" => Ok(EventKind::Register),
            "UNREGISTER" => Ok(EventKind::Unregister),
            other => Err(Error::protocol(format!("unknown event kind '{}'", other))),
        }
    }
}

// =============================================================================
// Registry Event
// =============================================================================

/// A membership change for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RegistryEvent {
    pub address: Address,
    pub kind: EventKind,
}

impl RegistryEvent {
    pub fn register(address: Address) -> Self {
        Self {
            address,
            kind: EventKind::Register,
        }
    }

    pub fn unregister(address: Address) -> Self {
        Self {
            address,
            kind: EventKind::Unregister,
        }
    }

    /// Encode into the wire form `<address>-<KIND>`
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.address, EVENT_SEPARATOR, self.kind)
    }

    /// Decode a wire message.
    ///
    /// Any message outside the two-kind grammar is a protocol fault: it means
    /// the publisher speaks a different protocol, so it is never skipped.
    pub fn decode(message: &str) -> Result<Self> {
        let (address, kind) = message
            .rsplit_once(EVENT_SEPARATOR)
            .ok_or_else(|| Error::protocol(format!("missing separator in '{}'", message)))?;

        let kind = kind
            .parse::<EventKind>()
            .map_err(|_| Error::protocol(format!("unknown event kind in '{}'", message)))?;
        let address = address
            .parse::<Address>()
            .map_err(|_| Error::protocol(format!("malformed address in '{}'", message)))?;

        Ok(Self { address, kind })
    }
}

impl std::fmt::Display for RegistryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_address_canonical_form() {
        assert_eq!(addr("10.0.0.1:8091").to_string(), "10.0.0.1:8091");
        assert_eq!(addr("[::1]:8091").to_string(), "[::1]:8091");
    }

    #[test]
    fn test_address_rejects_hostnames() {
        assert_matches!("server.local:8091".parse::<Address>(), Err(Error::InvalidAddress(_)));
        assert_matches!("10.0.0.1".parse::<Address>(), Err(Error::InvalidAddress(_)));
    }

    #[test]
    fn test_address_rejects_surrounding_whitespace() {
        assert_matches!(" 10.0.0.1:8091".parse::<Address>(), Err(Error::InvalidAddress(_)));
        assert_matches!("10.0.0.1:8091 ".parse::<Address>(), Err(Error::InvalidAddress(_)));
    }

    #[test]
    fn test_address_validation() {
        assert!(addr("10.0.0.1:8091").validate().is_ok());
        assert_matches!(addr("10.0.0.1:0").validate(), Err(Error::InvalidAddress(_)));
        assert_matches!(addr("0.0.0.0:8091").validate(), Err(Error::InvalidAddress(_)));
        assert_matches!(addr("[::]:8091").validate(), Err(Error::InvalidAddress(_)));
    }

    #[test]
    fn test_event_wire_form() {
        let event = RegistryEvent::register(addr("10.0.0.1:8091"));
        assert_eq!(event.encode(), "10.0.0.1:8091-REGISTER");

        let event = RegistryEvent::unregister(addr("10.0.0.1:8091"));
        assert_eq!(event.encode(), "10.0.0.1:8091-UNREGISTER");
    }

    #[test]
    fn test_event_decode_inverts_encode() {
        for address in ["10.0.0.1:8091", "192.168.1.20:1", "[fe80::1]:65535"] {
            for kind in [EventKind::Register, EventKind::Unregister] {
                let event = RegistryEvent {
                    address: addr(address),
                    kind,
                };
                assert_eq!(RegistryEvent::decode(&event.encode()).unwrap(), event);
            }
        }
    }

    #[test]
    fn test_unknown_kind_is_protocol_fault() {
        let err = RegistryEvent::decode("10.0.0.1:8091-DELETE").unwrap_err();
        assert_matches!(err, Error::Protocol { .. });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_malformed_messages_are_protocol_faults() {
        for message in ["", "10.0.0.1:8091", "10.0.0.1:8091-", "garbage-REGISTER", "-REGISTER"] {
            assert_matches!(
                RegistryEvent::decode(message),
                Err(Error::Protocol { .. }),
                "message {:?} should not decode",
                message
            );
        }
    }

    #[test]
    fn test_padded_address_is_protocol_fault() {
        let padded = [
            " 10.0.0.1:8091-REGISTER",
            "10.0.0.1:8091 -REGISTER",
            "10.0.0.1:8091\t-UNREGISTER",
        ];
        for message in padded {
            assert_matches!(
                RegistryEvent::decode(message),
                Err(Error::Protocol { .. }),
                "message {:?} should not decode",
                message
            );
        }
    }

    #[test]
    fn test_kind_is_case_sensitive() {
        assert_matches!(
            RegistryEvent::decode("10.0.0.1:8091-register"),
            Err(Error::Protocol { .. })
        );
    }
}
