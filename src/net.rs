//! Local port scouting for node port assignment.
//!
//! The node needs three ports (control API, gateway, swarm) that are fixed for
//! the lifetime of the process. Availability is checked by binding.

use std::net::TcpListener;
use std::ops::RangeInclusive;
use tracing::debug;

/// Check whether a local port can be bound right now.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Scan a range and return the first bindable port, or `None` if the whole
/// range is taken.
pub fn scout_port(range: RangeInclusive<u16>) -> Option<u16> {
    for port in range {
        if is_port_available(port) {
            debug!(port, "found available port");
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_ports_are_usually_free() {
        assert!(is_port_available(59999));
    }

    #[test]
    fn scout_finds_a_port_in_range() {
        let port = scout_port(59990..=59999);
        assert!(port.is_some());
    }

    #[test]
    fn scout_skips_taken_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        // A range containing only the taken port yields nothing.
        assert_eq!(scout_port(taken..=taken), None);
    }
}
