//! SubjectPublicKeyInfo reconstruction from a PKCS#11 EC point

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::CustodyError;

/// `SEQUENCE { OID id-ecPublicKey, OID prime256v1 }`
const P256_ALGORITHM_ID: [u8; 21] = [
    0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a, 0x86,
    0x48, 0xce, 0x3d, 0x03, 0x01, 0x07,
];

/// Uncompressed SEC1 point: 0x04 || X || Y
const UNCOMPRESSED_POINT_LEN: usize = 65;

/// Extract the uncompressed point from a `CKA_EC_POINT` value.
///
/// Tokens report the point either raw or wrapped in a DER OCTET STRING
/// (`04 41 04 ...`); both are accepted.
pub fn uncompressed_point(ec_point: &[u8]) -> Result<&[u8], CustodyError> {
    let point = if ec_point.len() == UNCOMPRESSED_POINT_LEN + 2
        && ec_point[0] == 0x04
        && ec_point[1] == UNCOMPRESSED_POINT_LEN as u8
    {
        &ec_point[2..]
    } else {
        ec_point
    };

    if point.len() != UNCOMPRESSED_POINT_LEN || point[0] != 0x04 {
        return Err(CustodyError::Internal(format!(
            "Unexpected EC point format: {} bytes, first byte 0x{:02x}",
            ec_point.len(),
            ec_point.first().copied().unwrap_or(0)
        )));
    }
    Ok(point)
}

/// DER SubjectPublicKeyInfo for a P-256 point.
pub fn spki_der(ec_point: &[u8]) -> Result<Vec<u8>, CustodyError> {
    let point = uncompressed_point(ec_point)?;

    // BIT STRING: no unused bits, then the point
    let mut bit_string = vec![0x03, (point.len() + 1) as u8, 0x00];
    bit_string.extend_from_slice(point);

    let mut der = vec![0x30, (P256_ALGORITHM_ID.len() + bit_string.len()) as u8];
    der.extend_from_slice(&P256_ALGORITHM_ID);
    der.extend_from_slice(&bit_string);
    Ok(der)
}

/// PEM `PUBLIC KEY` block, 64 characters per line.
pub fn spki_pem(ec_point: &[u8]) -> Result<String, CustodyError> {
    let encoded = STANDARD.encode(spki_der(ec_point)?);

    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----");
    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use p256::pkcs8::DecodePublicKey;

    fn sample_point() -> Vec<u8> {
        let key = SigningKey::from_slice(&[0x42; 32]).unwrap();
        key.verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    #[test]
    fn test_uncompressed_point_raw() {
        let point = sample_point();
        assert_eq!(uncompressed_point(&point).unwrap(), &point[..]);
    }

    #[test]
    fn test_uncompressed_point_octet_string() {
        let point = sample_point();
        let mut wrapped = vec![0x04, 0x41];
        wrapped.extend_from_slice(&point);
        assert_eq!(uncompressed_point(&wrapped).unwrap(), &point[..]);
    }

    #[test]
    fn test_uncompressed_point_rejects_compressed() {
        let key = SigningKey::from_slice(&[0x42; 32]).unwrap();
        let compressed = key.verifying_key().to_encoded_point(true);
        assert!(uncompressed_point(compressed.as_bytes()).is_err());
        assert!(uncompressed_point(&[]).is_err());
    }

    #[test]
    fn test_spki_der_layout() {
        let der = spki_der(&sample_point()).unwrap();
        assert_eq!(der.len(), 91);
        assert_eq!(&der[..2], &[0x30, 89]);
        assert_eq!(&der[23..26], &[0x03, 0x42, 0x00]);
    }

    #[test]
    fn test_spki_pem_parses_as_p256_key() {
        let point = sample_point();
        let pem = spki_pem(&point).unwrap();

        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(pem.ends_with("-----END PUBLIC KEY-----"));
        assert!(pem.lines().all(|line| line.len() <= 64));

        let parsed = p256::PublicKey::from_public_key_pem(&pem).unwrap();
        assert_eq!(parsed.to_encoded_point(false).as_bytes(), &point[..]);
    }
}
