//! Channel bindings for extended protection.
//!
//! Binds an integrated-auth exchange to the TLS session underneath it so a
//! relayed token is useless on a different connection.

use md5::{Digest, Md5};
use sha2::{Sha256, Sha384, Sha512};

use crate::error::AuthError;

/// Prefix for TLS exporter bindings.
pub const TLS_EXPORTER_PREFIX: &str = "tls-exporter:";
/// Label passed to the TLS keying material exporter.
pub const TLS_EXPORTER_LABEL: &str = "EXPORTER-Channel-Binding";
/// Length of exported keying material.
pub const TLS_EXPORTER_LENGTH: usize = 32;
/// Prefix for `tls-unique` bindings.
pub const TLS_UNIQUE_PREFIX: &str = "tls-unique:";
/// Prefix for server end-point bindings.
pub const TLS_SERVER_END_POINT_PREFIX: &str = "tls-server-end-point:";

const SEC_CHANNEL_BINDINGS_HEADER: u32 = 32;

/// Source of the binding data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelBindingType {
    /// Exported keying material (RFC 9266).
    TlsExporter = 0,
    /// TLS Finished message (RFC 5929).
    TlsUnique = 1,
    /// Hash of the server certificate (RFC 5929).
    TlsServerEndPoint = 2,
    /// No binding.
    Empty = 3,
}

/// A `gss_channel_bindings_struct`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    /// Binding source.
    pub kind: ChannelBindingType,
    /// Initiator address type.
    pub initiator_addr_type: u32,
    /// Initiator address.
    pub initiator_address: Vec<u8>,
    /// Acceptor address type.
    pub acceptor_addr_type: u32,
    /// Acceptor address.
    pub acceptor_address: Vec<u8>,
    /// Prefixed binding data.
    pub application_data: Vec<u8>,
}

impl ChannelBinding {
    /// The empty binding.
    #[must_use]
    pub fn empty() -> Self {
        Self::with_data(ChannelBindingType::Empty, Vec::new())
    }

    fn with_data(kind: ChannelBindingType, application_data: Vec<u8>) -> Self {
        Self {
            kind,
            initiator_addr_type: 0,
            initiator_address: Vec::new(),
            acceptor_addr_type: 0,
            acceptor_address: Vec::new(),
            application_data,
        }
    }

    fn prefixed(kind: ChannelBindingType, prefix: &str, data: &[u8]) -> Self {
        let mut application_data = Vec::with_capacity(prefix.len() + data.len());
        application_data.extend_from_slice(prefix.as_bytes());
        application_data.extend_from_slice(data);
        Self::with_data(kind, application_data)
    }

    /// Binding from the TLS `tls-unique` value.
    pub fn tls_unique(tls_unique: &[u8]) -> Result<Self, AuthError> {
        if tls_unique.is_empty() {
            return Err(AuthError::ChannelBinding("tls-unique value is empty".into()));
        }
        Ok(Self::prefixed(
            ChannelBindingType::TlsUnique,
            TLS_UNIQUE_PREFIX,
            tls_unique,
        ))
    }

    /// Binding from exported keying material.
    pub fn tls_exporter(keying_material: &[u8]) -> Result<Self, AuthError> {
        if keying_material.is_empty() {
            return Err(AuthError::ChannelBinding("exporter key is empty".into()));
        }
        Ok(Self::prefixed(
            ChannelBindingType::TlsExporter,
            TLS_EXPORTER_PREFIX,
            keying_material,
        ))
    }

    /// Binding from the DER-encoded server certificate.
    ///
    /// The hash follows the certificate signature algorithm: SHA-384 and
    /// SHA-512 signatures hash with the same function, anything else with
    /// SHA-256.
    #[must_use]
    pub fn tls_server_end_point(certificate_der: &[u8]) -> Self {
        let hash = match signature_hash(certificate_der) {
            CertHash::Sha384 => Sha384::digest(certificate_der).to_vec(),
            CertHash::Sha512 => Sha512::digest(certificate_der).to_vec(),
            CertHash::Sha256 => Sha256::digest(certificate_der).to_vec(),
        };
        Self::prefixed(
            ChannelBindingType::TlsServerEndPoint,
            TLS_SERVER_END_POINT_PREFIX,
            &hash,
        )
    }

    /// GSS wire form: every length and address type is a little-endian u32.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            20 + self.initiator_address.len()
                + self.acceptor_address.len()
                + self.application_data.len(),
        );
        out.extend_from_slice(&self.initiator_addr_type.to_le_bytes());
        put_len_prefixed(&mut out, &self.initiator_address);
        out.extend_from_slice(&self.acceptor_addr_type.to_le_bytes());
        put_len_prefixed(&mut out, &self.acceptor_address);
        put_len_prefixed(&mut out, &self.application_data);
        out
    }

    /// MD5 of [`Self::to_bytes`]; sixteen zero bytes for the empty binding.
    #[must_use]
    pub fn md5_hash(&self) -> [u8; 16] {
        if self.kind == ChannelBindingType::Empty {
            return [0; 16];
        }
        Md5::digest(self.to_bytes()).into()
    }

    /// `SEC_CHANNEL_BINDINGS` layout for SSPI: a 32-byte header of
    /// type/length/offset triples followed by the data.
    #[must_use]
    pub fn as_sspi_channel_bindings(&self) -> Vec<u8> {
        let initiator_len = self.initiator_address.len() as u32;
        let acceptor_len = self.acceptor_address.len() as u32;
        let app_len = self.application_data.len() as u32;
        let initiator_offset = SEC_CHANNEL_BINDINGS_HEADER;
        let acceptor_offset = initiator_offset + initiator_len;
        let app_offset = acceptor_offset + acceptor_len;

        let mut out = Vec::with_capacity((app_offset + app_len) as usize);
        for word in [
            self.initiator_addr_type,
            initiator_len,
            initiator_offset,
            self.acceptor_addr_type,
            acceptor_len,
            acceptor_offset,
            app_len,
            app_offset,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&self.initiator_address);
        out.extend_from_slice(&self.acceptor_address);
        out.extend_from_slice(&self.application_data);
        out
    }
}

fn put_len_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

#[derive(Debug, PartialEq, Eq)]
enum CertHash {
    Sha256,
    Sha384,
    Sha512,
}

// sha{384,512}WithRSAEncryption and ecdsa-with-SHA{384,512}
const OID_SHA384_RSA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0c];
const OID_SHA512_RSA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0d];
const OID_SHA384_ECDSA: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x03];
const OID_SHA512_ECDSA: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x04];

fn signature_hash(der: &[u8]) -> CertHash {
    match signature_algorithm_oid(der) {
        Some(oid) if oid == OID_SHA384_RSA || oid == OID_SHA384_ECDSA => CertHash::Sha384,
        Some(oid) if oid == OID_SHA512_RSA || oid == OID_SHA512_ECDSA => CertHash::Sha512,
        _ => CertHash::Sha256,
    }
}

/// `Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signature }`
fn signature_algorithm_oid(der: &[u8]) -> Option<&[u8]> {
    let (tag, cert, _) = read_tlv(der)?;
    if tag != 0x30 {
        return None;
    }
    let (_, _, rest) = read_tlv(cert)?;
    let (tag, alg, _) = read_tlv(rest)?;
    if tag != 0x30 {
        return None;
    }
    let (tag, oid, _) = read_tlv(alg)?;
    (tag == 0x06).then_some(oid)
}

/// Split one DER TLV into (tag, value, remainder).
fn read_tlv(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = data.split_first()?;
    let (&first, mut rest) = rest.split_first()?;
    let len = if first & 0x80 == 0 {
        usize::from(first)
    } else {
        let n = usize::from(first & 0x7f);
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let len = rest[..n]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        rest = &rest[n..];
        len
    };
    if rest.len() < len {
        return None;
    }
    let (value, remainder) = rest.split_at(len);
    Some((tag, value, remainder))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_tls_unique_md5() {
        let cb = ChannelBinding::tls_unique(b"0123456789abcdef").unwrap();
        assert_eq!(hex(&cb.md5_hash()), "1eb7620a5e38cb1f50478b1690621a03");
    }

    #[test]
    fn test_sspi_layout() {
        let cb = ChannelBinding::tls_unique(b"0123456789abcdef").unwrap();
        assert_eq!(
            hex(&cb.as_sspi_channel_bindings()),
            "0000000000000000200000000000000000000000200000001b00000020000000\
             746c732d756e697175653a30313233343536373839616263646566"
        );
    }

    #[test]
    fn test_gss_layout() {
        let cb = ChannelBinding::tls_exporter(&[0xAA; 2]).unwrap();
        let bytes = cb.to_bytes();
        assert_eq!(bytes.len(), 20 + TLS_EXPORTER_PREFIX.len() + 2);
        assert_eq!(&bytes[16..20], &15u32.to_le_bytes());
        assert!(bytes.ends_with(b"tls-exporter:\xAA\xAA"));
    }

    #[test]
    fn test_empty_binding() {
        assert_eq!(ChannelBinding::empty().md5_hash(), [0; 16]);
        assert!(ChannelBinding::tls_unique(&[]).is_err());
        assert!(ChannelBinding::tls_exporter(&[]).is_err());
    }

    fn fake_cert(oid: &[u8]) -> Vec<u8> {
        let tbs = [0x30, 0x03, 0x02, 0x01, 0x01];
        let mut alg = vec![0x30, (oid.len() + 4) as u8, 0x06, oid.len() as u8];
        alg.extend_from_slice(oid);
        alg.extend_from_slice(&[0x05, 0x00]);
        let sig = [0x03, 0x02, 0x00, 0xff];
        let body: Vec<u8> = tbs.iter().chain(&alg).chain(&sig).copied().collect();
        let mut cert = vec![0x30, 0x81, body.len() as u8];
        cert.extend_from_slice(&body);
        cert
    }

    #[test]
    fn test_server_end_point_hash_choice() {
        assert_eq!(signature_hash(&fake_cert(OID_SHA384_RSA)), CertHash::Sha384);
        assert_eq!(signature_hash(&fake_cert(OID_SHA512_ECDSA)), CertHash::Sha512);
        assert_eq!(signature_hash(&[0x01, 0x02]), CertHash::Sha256);

        let cert = fake_cert(OID_SHA512_RSA);
        let cb = ChannelBinding::tls_server_end_point(&cert);
        assert_eq!(cb.kind, ChannelBindingType::TlsServerEndPoint);
        assert_eq!(
            cb.application_data.len(),
            TLS_SERVER_END_POINT_PREFIX.len() + 64
        );
    }
}
