//! Scripted peers for [`MockTnc`](crate::MockTnc).
//!
//! Each responder plays a remote node reachable through the mock: it reads
//! the raw packet the harness injected (`DEST:PARAMS MESSAGE`, the node
//! fills in the source) and returns the `pkt:` line the node would print
//! when the peer's reply arrives.

use std::collections::HashMap;

use loraham_link::protocol::encode_packet_line;

/// RSSI reported on every scripted reply.
pub const REPLY_RSSI: f32 = -50.0;

/// Build a `pkt:` line as the node prints a received packet.
pub fn pkt_line(rssi: f32, payload: &[u8]) -> Vec<u8> {
    encode_packet_line(rssi, payload)
}

/// Split an injected packet into destination, parameters and message.
pub fn split_injected(packet: &[u8]) -> Option<(&str, &str, &[u8])> {
    let colon = packet.iter().position(|&b| b == b':')?;
    let dest = std::str::from_utf8(&packet[..colon]).ok()?;
    let rest = &packet[colon + 1..];
    let (params, message) = match rest.iter().position(|&b| b == b' ') {
        Some(sp) => (&rest[..sp], &rest[sp + 1..]),
        None => (rest, &rest[rest.len()..]),
    };
    Some((dest, std::str::from_utf8(params).ok()?, message))
}

/// A peer answering every `PING` with a `PONG` carrying the same message.
/// `local` is the harness node's own callsign.
pub fn ping_echo(local: &str) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
    let local = local.to_string();
    move |packet| {
        let Some((dest, params, message)) = split_injected(packet) else {
            return Vec::new();
        };
        if !params.split(',').any(|p| p == "PING") {
            return Vec::new();
        }
        let mut reply = format!("{local}<{dest}:PONG ").into_bytes();
        reply.extend_from_slice(message);
        pkt_line(REPLY_RSSI, &reply)
    }
}

/// A peer implementing the remote side of the switch protocol.
///
/// Answers `A` with `B` carrying `response`, and `C` with `D`. A set stores
/// the value; a query reports the stored value (0 if never set).
pub fn switch_node(local: &str, response: &str) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
    let local = local.to_string();
    let response = response.to_string();
    let mut values: HashMap<String, String> = HashMap::new();

    move |packet| {
        let Some((dest, params, message)) = split_injected(packet) else {
            return Vec::new();
        };
        if !params.split(',').any(|p| p == "SW") {
            return Vec::new();
        }
        let Ok(message) = std::str::from_utf8(message) else {
            return Vec::new();
        };
        let fields: Vec<&str> = message.split(',').collect();

        let body = match fields.as_slice() {
            ["A", challenge] => format!("B,{challenge},{response}"),
            ["C", challenge, resp, target, value] if *resp == response => {
                let value = if *value == "?" {
                    values.get(*target).cloned().unwrap_or_else(|| "0".into())
                } else {
                    values.insert(target.to_string(), value.to_string());
                    value.to_string()
                };
                format!("D,{challenge},{response},{target},{value}")
            }
            _ => return Vec::new(),
        };
        pkt_line(REPLY_RSSI, format!("{local}<{dest}:SW {body}").as_bytes())
    }
}

/// Wrap `inner` so the first `skip` packets go unanswered, as if lost on
/// the air.
pub fn lossy(
    skip: usize,
    mut inner: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static,
) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
    let mut seen = 0;
    move |packet| {
        seen += 1;
        if seen <= skip {
            Vec::new()
        } else {
            inner(packet)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_injected_packet() {
        let (dest, params, msg) = split_injected(b"PU5EPX-11:PING a b").unwrap();
        assert_eq!(dest, "PU5EPX-11");
        assert_eq!(params, "PING");
        assert_eq!(msg, b"a b");

        let (_, params, msg) = split_injected(b"X:SW").unwrap();
        assert_eq!(params, "SW");
        assert!(msg.is_empty());

        assert!(split_injected(b"no colon").is_none());
    }

    #[test]
    fn ping_echo_replies_with_pong() {
        let mut peer = ping_echo("H");
        assert_eq!(peer(b"P:PING hi"), b"pkt: -50 11 H<P:PONG hi\r\n");
        assert!(peer(b"P:SW A,x").is_empty());
    }

    #[test]
    fn switch_node_set_then_query() {
        let mut peer = switch_node("H", "resp0001");
        assert_eq!(
            peer(b"P:SW A,ch"),
            pkt_line(REPLY_RSSI, b"H<P:SW B,ch,resp0001")
        );
        assert_eq!(
            peer(b"P:SW C,ch,resp0001,3,9"),
            pkt_line(REPLY_RSSI, b"H<P:SW D,ch,resp0001,3,9")
        );
        assert_eq!(
            peer(b"P:SW C,ch,resp0001,3,?"),
            pkt_line(REPLY_RSSI, b"H<P:SW D,ch,resp0001,3,9")
        );
        assert_eq!(
            peer(b"P:SW C,ch,resp0001,4,?"),
            pkt_line(REPLY_RSSI, b"H<P:SW D,ch,resp0001,4,0")
        );
        assert!(peer(b"P:SW C,ch,wrong,3,1").is_empty());
    }

    #[test]
    fn lossy_skips_first_packets() {
        let mut peer = lossy(2, ping_echo("H"));
        assert!(peer(b"P:PING a").is_empty());
        assert!(peer(b"P:PING a").is_empty());
        assert!(!peer(b"P:PING a").is_empty());
    }
}
