//! Inbound datagram classification.
//!
//! SIP ports also carry NAT keepalive probes and STUN binding requests.
//! Both must be rejected cheaply, before any SIP parsing: keepalives are
//! dropped outright, STUN candidates are handed to the STUN responder, and
//! only the rest reaches the processing pipeline.

/// Longest payload that cannot be a SIP message. Anything at or below this
/// length is a keepalive probe, a STUN candidate, or noise.
pub const MAX_PROBE_LEN: usize = 30;

/// CRLF keepalive, sent by clients to refresh NAT bindings.
const CRLF_KEEPALIVE: &[u8] = b"\r\n";

/// What a single inbound datagram turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// NAT-binding refresh with no protocol payload; dropped before parsing.
    Keepalive,
    /// Leading octet matches a STUN message type; handed to the STUN
    /// responder when demultiplexing is enabled.
    StunCandidate,
    /// Too short for SIP and not recognized as anything else.
    TooShort,
    /// A SIP datagram for the processing pipeline.
    Sip,
}

/// True for the empty payload and for any payload consisting solely of
/// 0x00 bytes.
pub fn is_only_nulls(payload: &[u8]) -> bool {
    payload.iter().all(|b| *b == 0)
}

// STUN's binary header starts with 0x00 or 0x01 under the magic-cookie
// scheme, while a SIP start line is printable ASCII.
fn has_stun_leading_octet(payload: &[u8]) -> bool {
    matches!(payload.first(), Some(&0x00) | Some(&0x01))
}

/// Classify one raw datagram.
pub fn classify(payload: &[u8]) -> Classification {
    if payload == CRLF_KEEPALIVE {
        return Classification::Keepalive;
    }
    if payload.len() <= MAX_PROBE_LEN {
        if is_only_nulls(payload) {
            return Classification::Keepalive;
        }
        if has_stun_leading_octet(payload) {
            return Classification::StunCandidate;
        }
        return Classification::TooShort;
    }
    if has_stun_leading_octet(payload) {
        return Classification::StunCandidate;
    }
    Classification::Sip
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crlf_is_keepalive() {
        assert_eq!(classify(b"\r\n"), Classification::Keepalive);
    }

    #[test]
    fn test_null_probes_are_keepalives() {
        assert_eq!(classify(b""), Classification::Keepalive);
        assert_eq!(classify(&[0u8; 1]), Classification::Keepalive);
        assert_eq!(classify(&[0u8; 30]), Classification::Keepalive);
        // Above the probe threshold the null rule no longer applies; the
        // leading octet makes this a STUN candidate instead.
        assert_eq!(classify(&[0u8; 31]), Classification::StunCandidate);
    }

    #[test]
    fn test_is_only_nulls() {
        assert!(is_only_nulls(b""));
        assert!(is_only_nulls(&[0u8; 12]));
        assert!(!is_only_nulls(&[1u8]));
        assert!(!is_only_nulls(&[0, 0, 0, 7, 0]));
        let mut tail = [0u8; 16];
        tail[15] = 0xff;
        assert!(!is_only_nulls(&tail));
    }

    #[test]
    fn test_short_stun_candidates() {
        assert_eq!(classify(&[0x00, 0x01, 0xab]), Classification::StunCandidate);
        assert_eq!(classify(&[0x01, 0x01, 0x00, 0x00]), Classification::StunCandidate);
    }

    #[test]
    fn test_long_stun_candidates() {
        let mut request = vec![0x00, 0x01];
        request.extend_from_slice(&[0x21; 40]);
        assert_eq!(classify(&request), Classification::StunCandidate);
    }

    #[test]
    fn test_short_garbage_is_too_short() {
        assert_eq!(classify(b"hello"), Classification::TooShort);
        assert_eq!(classify(b"\r\n\r\n"), Classification::TooShort);
        assert_eq!(classify(&[0x7f; 30]), Classification::TooShort);
    }

    #[test]
    fn test_sip_sized_ascii_is_sip() {
        let msg = b"OPTIONS sip:proxy.example.com SIP/2.0\r\n\r\n";
        assert!(msg.len() > MAX_PROBE_LEN);
        assert_eq!(classify(msg), Classification::Sip);
    }
}
