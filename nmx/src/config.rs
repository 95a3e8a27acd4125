//! Connection string parsing
//!
//! - bus: the whole string is the regular expression matched against
//!   advertised device names
//! - link: comma separated `key=value` pairs with keys `peer_name`,
//!   `peer_id` and `own_addr_type`

use nmx_core::{NmxError, NmxResult};
use nmx_session::BusTransportConfig;
use nmx_transport::PeerSpec;
use regex::Regex;

/// Parse a discovery bus connection string
///
/// # Errors
/// `NmxError::InvalidConfig` if the string is empty or not a valid
/// regular expression
pub fn parse_bus_conn_string(s: &str) -> NmxResult<BusTransportConfig> {
    if s.is_empty() {
        return Err(NmxError::InvalidConfig(
            "bus connection string cannot be empty".to_string(),
        ));
    }
    Regex::new(s).map_err(|e| {
        NmxError::InvalidConfig(format!("Invalid bus target pattern \"{}\": {}", s, e))
    })?;

    Ok(BusTransportConfig::new(s))
}

/// Parse a link connection string into the peer to connect to
///
/// ```rust
/// use nmx::config::parse_link_conn_string;
/// use nmx::AddrType;
///
/// let peer = parse_link_conn_string("peer_name=sensor-7, own_addr_type=random").unwrap();
/// assert_eq!(peer.name.as_deref(), Some("sensor-7"));
/// assert_eq!(peer.own_addr_type, AddrType::Random);
/// ```
///
/// # Errors
/// `NmxError::InvalidConfig` on an empty string, a malformed pair, an
/// unknown key, an invalid value, or when neither `peer_name` nor `peer_id`
/// is given
pub fn parse_link_conn_string(s: &str) -> NmxResult<PeerSpec> {
    if s.trim().is_empty() {
        return Err(NmxError::InvalidConfig(
            "link connection string cannot be empty".to_string(),
        ));
    }

    let mut peer = PeerSpec::default();
    for pair in s.split(',') {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            NmxError::InvalidConfig(format!("Invalid connection string pair: \"{}\"", pair))
        })?;
        let (key, value) = (key.trim(), value.trim());

        match key {
            "peer_name" => peer.name = Some(value.to_string()),
            "peer_id" => peer.addr = Some(value.parse()?),
            "own_addr_type" => peer.own_addr_type = value.parse()?,
            _ => {
                return Err(NmxError::InvalidConfig(format!(
                    "Unrecognized key in connection string: {}",
                    key
                )));
            }
        }
    }

    if peer.name.is_none() && peer.addr.is_none() {
        return Err(NmxError::InvalidConfig(
            "link connection string needs peer_name or peer_id".to_string(),
        ));
    }
    log::debug!("Parsed link peer {}", peer);
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmx_transport::{AddrType, PeerAddr};

    #[test]
    fn test_bus_conn_string() {
        let cfg = parse_bus_conn_string("node-[AB]").unwrap();
        assert_eq!(cfg.target_match, "node-[AB]");
        assert_eq!(cfg.mtu, 512);

        assert!(matches!(parse_bus_conn_string(""), Err(NmxError::InvalidConfig(_))));
        assert!(matches!(parse_bus_conn_string("node-["), Err(NmxError::InvalidConfig(_))));
    }

    #[test]
    fn test_link_conn_string() {
        let peer = parse_link_conn_string("peer_id=0a:0b:0c:0d:0e:0f,own_addr_type=random").unwrap();
        assert_eq!(peer.addr, Some(PeerAddr([0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f])));
        assert_eq!(peer.own_addr_type, AddrType::Random);
        assert!(peer.name.is_none());
    }

    #[test]
    fn test_link_conn_string_errors() {
        for bad in [
            "",
            "peer_name",
            "own_addr_type=random",
            "peer_name=x,colour=blue",
            "peer_id=0a:0b",
            "peer_name=x,own_addr_type=static",
        ] {
            assert!(
                matches!(parse_link_conn_string(bad), Err(NmxError::InvalidConfig(_))),
                "accepted {:?}",
                bad
            );
        }
    }
}
