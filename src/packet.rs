//! IPv4/TCP packet codec
//!
//! Parses raw IP packets captured from the tunnel interface and synthesizes
//! minimal reply packets to inject back. Only IPv4 + TCP is handled; anything
//! else is reported as `Unsupported` so the capture loop can skip it without
//! treating it as a failure.
//!
//! Synthesized replies carry valid IP and TCP checksums. The TCP header is a
//! fixed 20 bytes (no options); flags are SYN for an empty payload and
//! PSH+ACK otherwise, with the window advertised wide open.

use std::net::Ipv4Addr;

/// Minimum IPv4 header size (no options)
pub const MIN_IP_HEADER_LEN: usize = 20;

/// Fixed TCP header size used for both parsing and synthesis (no options)
pub const TCP_HEADER_LEN: usize = 20;

/// IP protocol number for TCP
pub const PROTO_TCP: u8 = 6;

/// Largest reply payload that still fits the 16-bit IP total length
pub const MAX_REPLY_PAYLOAD: usize = u16::MAX as usize - MIN_IP_HEADER_LEN - TCP_HEADER_LEN;

/// TCP flag bits used in synthesized replies
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_PSH_ACK: u8 = 0x18;

/// Packet decode failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Packet too short, or the declared header length exceeds the data
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Valid IP packet but not TCP; carries the protocol byte
    #[error("unsupported protocol: {0}")]
    Unsupported(u8),
}

/// Fields extracted from a captured outbound TCP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTcp {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Parse a raw outbound IPv4 packet into its TCP addressing and payload.
///
/// Returns `Unsupported` for non-TCP traffic (UDP, ICMP, ...) so callers can
/// drop it silently, and `Malformed` for anything the header fields rule out.
pub fn decode_outbound(raw: &[u8]) -> Result<ParsedTcp, DecodeError> {
    if raw.len() < MIN_IP_HEADER_LEN {
        return Err(DecodeError::Malformed("shorter than IP header"));
    }

    let version = raw[0] >> 4;
    if version != 4 {
        return Err(DecodeError::Unsupported(raw[9]));
    }

    let ihl = ((raw[0] & 0x0f) as usize) * 4;
    if ihl < MIN_IP_HEADER_LEN {
        return Err(DecodeError::Malformed("IP header length below minimum"));
    }
    if ihl > raw.len() {
        return Err(DecodeError::Malformed("declared header exceeds packet"));
    }

    let protocol = raw[9];
    if protocol != PROTO_TCP {
        return Err(DecodeError::Unsupported(protocol));
    }

    if raw.len() < ihl + TCP_HEADER_LEN {
        return Err(DecodeError::Malformed("truncated TCP header"));
    }

    let src_ip = Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]);
    let dst_ip = Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19]);
    let src_port = u16::from_be_bytes([raw[ihl], raw[ihl + 1]]);
    let dst_port = u16::from_be_bytes([raw[ihl + 2], raw[ihl + 3]]);
    let payload = raw[ihl + TCP_HEADER_LEN..].to_vec();

    Ok(ParsedTcp {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        payload,
    })
}

/// Build a synthetic IPv4+TCP reply packet for injection into the tunnel.
///
/// `src_*` is the remote destination the reply appears to come from; `dst_*`
/// is the original client flow the tunnel routes it back to. An empty payload
/// produces a SYN, anything else PSH+ACK. Payloads beyond what the 16-bit IP
/// total length can carry are truncated.
pub fn encode_reply(
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let payload = if payload.len() > MAX_REPLY_PAYLOAD {
        log::warn!(
            "reply payload of {} bytes exceeds the IP length field, truncating to {}",
            payload.len(),
            MAX_REPLY_PAYLOAD
        );
        &payload[..MAX_REPLY_PAYLOAD]
    } else {
        payload
    };
    let total_len = MIN_IP_HEADER_LEN + TCP_HEADER_LEN + payload.len();
    let mut pkt = vec![0u8; total_len];

    // IPv4 header
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[8] = 64; // TTL
    pkt[9] = PROTO_TCP;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());
    let ip_csum = ipv4_checksum(&pkt[..MIN_IP_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&ip_csum.to_be_bytes());

    // TCP header
    let tcp = MIN_IP_HEADER_LEN;
    pkt[tcp..tcp + 2].copy_from_slice(&src_port.to_be_bytes());
    pkt[tcp + 2..tcp + 4].copy_from_slice(&dst_port.to_be_bytes());
    pkt[tcp + 12] = (TCP_HEADER_LEN as u8 / 4) << 4; // data offset
    pkt[tcp + 13] = if payload.is_empty() {
        TCP_FLAG_SYN
    } else {
        TCP_FLAG_PSH_ACK
    };
    pkt[tcp + 14..tcp + 16].copy_from_slice(&0xffffu16.to_be_bytes()); // window

    pkt[tcp + TCP_HEADER_LEN..].copy_from_slice(payload);

    let tcp_csum = tcp_checksum(src_ip, dst_ip, &pkt[tcp..]);
    pkt[tcp + 16..tcp + 18].copy_from_slice(&tcp_csum.to_be_bytes());

    pkt
}

/// Standard internet checksum over the IPv4 header
fn ipv4_checksum(header: &[u8]) -> u16 {
    finish_checksum(sum_words(header, 0))
}

/// TCP checksum including the IPv4 pseudo-header
fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum_words(&src.octets(), sum);
    sum = sum_words(&dst.octets(), sum);
    sum += u32::from(PROTO_TCP);
    sum += segment.len() as u32;
    sum = sum_words(segment, sum);
    finish_checksum(sum)
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

fn finish_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-build a 40-byte TCP packet: 20-byte IP header + 20-byte TCP header
    fn build_tcp_packet(
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut pkt = vec![0u8; 40 + payload.len()];
        pkt[0] = 0x45;
        pkt[9] = 6;
        pkt[12..16].copy_from_slice(&src_ip);
        pkt[16..20].copy_from_slice(&dst_ip);
        pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
        pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
        pkt[40..].copy_from_slice(payload);
        pkt
    }

    #[test]
    fn decode_extracts_addressing_and_payload() {
        let pkt = build_tcp_packet([10, 0, 0, 2], [93, 184, 216, 34], 5000, 80, b"hello");
        let parsed = decode_outbound(&pkt).unwrap();
        assert_eq!(parsed.src_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(parsed.dst_ip, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(parsed.src_port, 5000);
        assert_eq!(parsed.dst_port, 80);
        assert_eq!(parsed.payload, b"hello");
    }

    #[test]
    fn decode_syn_has_empty_payload() {
        // 40-byte SYN: headers only
        let pkt = build_tcp_packet([10, 0, 0, 2], [93, 184, 216, 34], 5000, 80, b"");
        let parsed = decode_outbound(&pkt).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn decode_rejects_undersized() {
        assert_eq!(
            decode_outbound(&[0x45; 19]),
            Err(DecodeError::Malformed("shorter than IP header"))
        );
        assert!(decode_outbound(&[]).is_err());
    }

    #[test]
    fn decode_rejects_non_tcp() {
        let mut pkt = build_tcp_packet([10, 0, 0, 2], [8, 8, 8, 8], 5000, 53, b"");
        pkt[9] = 17; // UDP
        assert_eq!(decode_outbound(&pkt), Err(DecodeError::Unsupported(17)));
        pkt[9] = 1; // ICMP
        assert_eq!(decode_outbound(&pkt), Err(DecodeError::Unsupported(1)));
    }

    #[test]
    fn decode_rejects_overlong_declared_header() {
        let mut pkt = vec![0u8; 24];
        pkt[0] = 0x4f; // IHL = 15 -> 60 bytes declared, only 24 present
        pkt[9] = 6;
        assert!(matches!(
            decode_outbound(&pkt),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_tcp_header() {
        let mut pkt = vec![0u8; 30]; // 20-byte IP header + 10 bytes
        pkt[0] = 0x45;
        pkt[9] = 6;
        assert!(matches!(
            decode_outbound(&pkt),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn encode_sets_length_and_protocol() {
        let pkt = encode_reply(
            Ipv4Addr::new(93, 184, 216, 34),
            80,
            Ipv4Addr::new(10, 0, 0, 2),
            5000,
            b"response data",
        );
        let total = u16::from_be_bytes([pkt[2], pkt[3]]) as usize;
        assert_eq!(total, 40 + b"response data".len());
        assert_eq!(total, pkt.len());
        assert_eq!(pkt[9], PROTO_TCP);
    }

    #[test]
    fn encode_flags_syn_when_empty_psh_ack_otherwise() {
        let syn = encode_reply(
            Ipv4Addr::new(1, 2, 3, 4),
            443,
            Ipv4Addr::new(10, 0, 0, 2),
            6000,
            b"",
        );
        assert_eq!(syn[33], 0x02);

        let data = encode_reply(
            Ipv4Addr::new(1, 2, 3, 4),
            443,
            Ipv4Addr::new(10, 0, 0, 2),
            6000,
            b"x",
        );
        assert_eq!(data[33], 0x18);
    }

    #[test]
    fn encode_decode_round_trip() {
        let remote = Ipv4Addr::new(93, 184, 216, 34);
        let client = Ipv4Addr::new(10, 0, 0, 2);
        let reply = encode_reply(remote, 80, client, 5000, b"payload bytes");

        // Treat the reply as if it were captured from the interface
        let parsed = decode_outbound(&reply).unwrap();
        assert_eq!(parsed.src_ip, remote);
        assert_eq!(parsed.dst_ip, client);
        assert_eq!(parsed.src_port, 80);
        assert_eq!(parsed.dst_port, 5000);
        assert_eq!(parsed.payload, b"payload bytes");
    }

    #[test]
    fn encode_produces_valid_checksums() {
        let pkt = encode_reply(
            Ipv4Addr::new(8, 8, 8, 8),
            443,
            Ipv4Addr::new(10, 0, 0, 2),
            7000,
            b"abc",
        );

        // Re-summing a header over its own checksum field must yield zero
        let mut sum = sum_words(&pkt[..20], 0);
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xffff);

        let mut tsum = sum_words(&Ipv4Addr::new(8, 8, 8, 8).octets(), 0);
        tsum = sum_words(&Ipv4Addr::new(10, 0, 0, 2).octets(), tsum);
        tsum += u32::from(PROTO_TCP);
        tsum += (pkt.len() - 20) as u32;
        tsum = sum_words(&pkt[20..], tsum);
        while tsum >> 16 != 0 {
            tsum = (tsum & 0xffff) + (tsum >> 16);
        }
        assert_eq!(tsum as u16, 0xffff);
    }

    #[test]
    fn encode_caps_payload_at_ip_length_limit() {
        let big = vec![0xab; MAX_REPLY_PAYLOAD + 1000];
        let pkt = encode_reply(
            Ipv4Addr::new(93, 184, 216, 34),
            80,
            Ipv4Addr::new(10, 0, 0, 2),
            5000,
            &big,
        );
        assert_eq!(pkt.len(), u16::MAX as usize);
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), u16::MAX);
        assert_eq!(&pkt[40..], &big[..MAX_REPLY_PAYLOAD]);
    }

    #[test]
    fn window_is_maximal() {
        let pkt = encode_reply(
            Ipv4Addr::new(1, 1, 1, 1),
            53,
            Ipv4Addr::new(10, 0, 0, 2),
            9000,
            b"d",
        );
        assert_eq!(u16::from_be_bytes([pkt[34], pkt[35]]), 0xffff);
    }
}
