//! ECDSA signature codec
//!
//! Converts between the fixed-width `r || s` form PKCS#11 `CKM_ECDSA` returns
//! and the DER `SEQUENCE { r INTEGER, s INTEGER }` form most verifiers expect.

use crate::error::CustodyError;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;

/// Width of each P-256 signature component in bytes.
pub const P256_COMPONENT_SIZE: usize = 32;

/// Signature components, each exactly the requested width, big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSignature {
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl RawSignature {
    /// `r || s`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.r.len() + self.s.len());
        out.extend_from_slice(&self.r);
        out.extend_from_slice(&self.s);
        out
    }
}

fn format_error(msg: impl Into<String>) -> CustodyError {
    CustodyError::SignatureFormat(msg.into())
}

/// Reads one tag-length-value field starting at `offset`.
///
/// Returns `(value_start, value_len)`. Long-form lengths of up to four octets
/// are accepted; every length is checked against the remaining input.
fn read_tlv(
    der: &[u8],
    offset: usize,
    tag: u8,
    what: &str,
) -> Result<(usize, usize), CustodyError> {
    match der.get(offset) {
        Some(&t) if t == tag => {}
        Some(&t) => {
            return Err(format_error(format!(
                "expected tag 0x{:02x} for {}, found 0x{:02x}",
                tag, what, t
            )));
        }
        None => return Err(format_error(format!("truncated before {}", what))),
    }

    let first = *der
        .get(offset + 1)
        .ok_or_else(|| format_error(format!("missing length for {}", what)))?;

    let (len, header) = if first & 0x80 == 0 {
        (first as usize, 2)
    } else {
        let octets = (first & 0x7f) as usize;
        if octets == 0 || octets > 4 {
            return Err(format_error(format!(
                "unsupported length encoding for {}",
                what
            )));
        }
        let bytes = der
            .get(offset + 2..offset + 2 + octets)
            .ok_or_else(|| format_error(format!("truncated length for {}", what)))?;
        let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, 2 + octets)
    };

    let start = offset + header;
    if der.len() < start + len {
        return Err(format_error(format!(
            "{} claims {} bytes, {} available",
            what,
            len,
            der.len().saturating_sub(start)
        )));
    }
    Ok((start, len))
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first_nonzero = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len().saturating_sub(1));
    &bytes[first_nonzero..]
}

/// Left-pad with zeros, or keep the low-order `size` bytes.
fn fit_to(bytes: &[u8], size: usize) -> Vec<u8> {
    let trimmed = trim_leading_zeros(bytes);
    if trimmed.len() >= size {
        return trimmed[trimmed.len() - size..].to_vec();
    }
    let mut out = vec![0u8; size - trimmed.len()];
    out.extend_from_slice(trimmed);
    out
}

/// Decode a DER ECDSA signature into components of exactly `size` bytes.
///
/// The sequence must span the whole input and hold exactly two integers.
pub fn der_to_raw(der: &[u8], size: usize) -> Result<RawSignature, CustodyError> {
    let (body, body_len) = read_tlv(der, 0, TAG_SEQUENCE, "sequence")?;
    if body + body_len != der.len() {
        return Err(format_error(format!(
            "sequence covers {} of {} bytes",
            body + body_len,
            der.len()
        )));
    }

    let (r_start, r_len) = read_tlv(der, body, TAG_INTEGER, "r")?;
    let (s_start, s_len) = read_tlv(der, r_start + r_len, TAG_INTEGER, "s")?;
    if s_start + s_len != der.len() {
        return Err(format_error("trailing data after s"));
    }

    Ok(RawSignature {
        r: fit_to(&der[r_start..r_start + r_len], size),
        s: fit_to(&der[s_start..s_start + s_len], size),
    })
}

fn push_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let significant = trim_leading_zeros(&bytes);
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
}

fn encode_integer(value: &[u8]) -> Vec<u8> {
    let trimmed = if value.is_empty() {
        &[0u8][..]
    } else {
        trim_leading_zeros(value)
    };
    // DER integers are signed; a set high bit needs a zero pad.
    let pad = trimmed[0] & 0x80 != 0;

    let mut out = Vec::with_capacity(trimmed.len() + 3);
    out.push(TAG_INTEGER);
    push_length(&mut out, trimmed.len() + usize::from(pad));
    if pad {
        out.push(0x00);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Encode big-endian components as a DER ECDSA signature.
pub fn raw_to_der(r: &[u8], s: &[u8]) -> Vec<u8> {
    let r = encode_integer(r);
    let s = encode_integer(s);

    let mut out = Vec::with_capacity(r.len() + s.len() + 4);
    out.push(TAG_SEQUENCE);
    push_length(&mut out, r.len() + s.len());
    out.extend_from_slice(&r);
    out.extend_from_slice(&s);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn component(fill: u8) -> Vec<u8> {
        (0..32u8).map(|i| fill.wrapping_add(i)).collect()
    }

    // ==================== raw_to_der Tests ====================

    #[test]
    fn test_raw_to_der_pads_high_bit() {
        let r = vec![0x80; 32];
        let s = vec![0x01; 32];
        let der = raw_to_der(&r, &s);

        assert_eq!(der[0], TAG_SEQUENCE);
        assert_eq!(der[1] as usize, der.len() - 2);
        // r: tag, len 33, zero pad
        assert_eq!(&der[2..5], &[TAG_INTEGER, 33, 0x00]);
        // s: no pad
        assert_eq!(&der[37..39], &[TAG_INTEGER, 32]);
        assert_eq!(der.len(), 2 + 35 + 34);
    }

    #[test]
    fn test_raw_to_der_trims_leading_zeros() {
        let mut r = vec![0u8; 32];
        r[31] = 0x05;
        let s = vec![0x7f; 32];
        let der = raw_to_der(&r, &s);
        assert_eq!(&der[2..5], &[TAG_INTEGER, 1, 0x05]);
    }

    #[test]
    fn test_raw_to_der_zero_component() {
        let der = raw_to_der(&[0u8; 32], &[0u8; 32]);
        assert_eq!(der, vec![0x30, 0x06, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_raw_to_der_long_form_length() {
        let r = vec![0xff; 70];
        let s = vec![0xff; 70];
        let der = raw_to_der(&r, &s);
        // Each integer is 2 + 71 bytes; payload 146 needs one length octet.
        assert_eq!(&der[..3], &[0x30, 0x81, 146]);
        assert_eq!(der.len(), 3 + 146);
    }

    // ==================== der_to_raw Tests ====================

    #[test]
    fn test_round_trip_high_bits() {
        let cases = [
            (component(0x80), component(0x01)),
            (component(0x01), component(0xf0)),
            (vec![0xff; 32], vec![0xff; 32]),
            (vec![0x00; 32], vec![0x00; 32]),
        ];
        for (r, s) in cases {
            let raw = der_to_raw(&raw_to_der(&r, &s), 32).unwrap();
            assert_eq!(raw.r, r);
            assert_eq!(raw.s, s);
        }
    }

    #[test]
    fn test_round_trip_short_components() {
        let mut r = vec![0u8; 32];
        r[30] = 0x12;
        r[31] = 0x34;
        let s = component(0x40);
        let raw = der_to_raw(&raw_to_der(&r, &s), 32).unwrap();
        assert_eq!(raw.r, r);
        assert_eq!(raw.to_bytes()[32..], s[..]);
    }

    #[test]
    fn test_der_to_raw_long_form_outer_length() {
        let der = raw_to_der(&[0xaa; 70], &[0xbb; 70]);
        let raw = der_to_raw(&der, 70).unwrap();
        assert_eq!(raw.r, vec![0xaa; 70]);
        assert_eq!(raw.s, vec![0xbb; 70]);
    }

    #[test]
    fn test_der_to_raw_truncates_to_size() {
        let der = raw_to_der(&[0x11; 40], &[0x22; 32]);
        let raw = der_to_raw(&der, 32).unwrap();
        assert_eq!(raw.r, vec![0x11; 32]);
        assert_eq!(raw.s, vec![0x22; 32]);
    }

    #[test]
    fn test_der_to_raw_rejects_non_sequence() {
        let mut der = raw_to_der(&component(1), &component(2));
        der[0] = 0x31;
        assert!(matches!(
            der_to_raw(&der, 32),
            Err(CustodyError::SignatureFormat(_))
        ));
    }

    #[test]
    fn test_der_to_raw_rejects_non_integer_r() {
        let mut der = raw_to_der(&component(1), &component(2));
        der[2] = 0x04;
        assert!(matches!(
            der_to_raw(&der, 32),
            Err(CustodyError::SignatureFormat(_))
        ));
    }

    #[test]
    fn test_der_to_raw_rejects_non_integer_s() {
        let r = component(1);
        let mut der = raw_to_der(&r, &component(2));
        // sequence header (2) + r integer (2 + 32)
        der[36] = 0x04;
        assert!(matches!(
            der_to_raw(&der, 32),
            Err(CustodyError::SignatureFormat(_))
        ));
    }

    #[test]
    fn test_der_to_raw_rejects_truncated() {
        let der = raw_to_der(&component(1), &component(2));
        for cut in [0, 1, 3, 20, der.len() - 1] {
            assert!(
                der_to_raw(&der[..cut], 32).is_err(),
                "accepted input cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_der_to_raw_rejects_trailing_data() {
        let mut der = raw_to_der(&component(1), &component(2));
        der.push(0x00);
        assert!(matches!(
            der_to_raw(&der, 32),
            Err(CustodyError::SignatureFormat(_))
        ));

        // third integer outside the sequence
        let mut der = raw_to_der(&component(1), &component(2));
        der.extend_from_slice(&[0x02, 0x01, 0x01]);
        assert!(der_to_raw(&der, 32).is_err());
    }

    #[test]
    fn test_der_to_raw_rejects_indefinite_length() {
        let der = [0x30, 0x80, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0x00, 0x00];
        assert!(der_to_raw(&der, 32).is_err());
    }

    #[test]
    fn test_raw_and_der_agree() {
        let raw: Vec<u8> = component(0x9c).into_iter().chain(component(0x03)).collect();
        let der = raw_to_der(&raw[..32], &raw[32..]);
        assert_eq!(der_to_raw(&der, 32).unwrap().to_bytes(), raw);
    }

    #[test]
    fn test_matches_p256_der_encoding() {
        let r: [u8; 32] = component(0x81).try_into().unwrap();
        let s: [u8; 32] = component(0x10).try_into().unwrap();
        let sig = p256::ecdsa::Signature::from_scalars(r, s).unwrap();
        assert_eq!(raw_to_der(&r, &s), sig.to_der().as_bytes());
    }

    // ==================== Property Tests ====================

    proptest! {
        #[test]
        fn test_round_trip_any_pair(r in any::<[u8; 32]>(), s in any::<[u8; 32]>()) {
            let raw = der_to_raw(&raw_to_der(&r, &s), P256_COMPONENT_SIZE).unwrap();
            prop_assert_eq!(raw.r, r.to_vec());
            prop_assert_eq!(raw.s, s.to_vec());
        }

        #[test]
        fn test_der_is_minimal(r in any::<[u8; 32]>(), s in any::<[u8; 32]>()) {
            let der = raw_to_der(&r, &s);
            prop_assert_eq!(der[0], TAG_SEQUENCE);
            prop_assert_eq!(der[1] as usize, der.len() - 2);
            prop_assert!(der.len() <= 72);
        }
    }
}
