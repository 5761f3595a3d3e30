//! Enclave platform — identity, targeted reports, and a simulated quoting service
//!
//! The `Platform` trait is the narrow interface the trusted node needs from the
//! hardware: its own measured identity and the ability to produce a report
//! MACed for a target enclave. `SimulatedPlatform` implements it in software
//! (HMAC under a per-platform secret) and also plays the quoting enclave, so
//! the whole protocol can run without SGX hardware.

use crate::crypto::{self, DIGEST_LEN};
use crate::error::PlatformError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use zeroize::Zeroizing;

pub const REPORT_DATA_LEN: usize = 64;
pub const REPORT_BODY_LEN: usize = 32 + 32 + 8 + 2 + 2 + REPORT_DATA_LEN;
pub const REPORT_LEN: usize = REPORT_BODY_LEN + 32 + 32;

pub type ReportData = [u8; REPORT_DATA_LEN];

/// Measured identity of an enclave (MRENCLAVE / MRSIGNER and friends)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveIdentity {
    /// Hash of enclave code + data at build time
    pub mr_enclave: [u8; 32],
    /// Hash of the signing key
    pub mr_signer: [u8; 32],
    /// Enclave attributes (flags)
    pub attributes: u64,
    pub isv_prod_id: u16,
    /// Security version number
    pub isv_svn: u16,
}

impl EnclaveIdentity {
    /// Compute a software measurement from a code hash and signer key
    pub fn compute(code_hash: &str, signer_key: &str, isv_prod_id: u16, isv_svn: u16) -> Self {
        let mr_enclave = crypto::sha256(format!("{}mrenclave-v1", code_hash).as_bytes());
        let mr_signer = crypto::sha256(format!("{}mrsigner-v1", signer_key).as_bytes());
        Self {
            mr_enclave,
            mr_signer,
            attributes: 0x0000_0000_0000_0007, // DEBUG | INIT | MODE64
            isv_prod_id,
            isv_svn,
        }
    }

    pub fn target_info(&self) -> TargetInfo {
        TargetInfo {
            mr_enclave: self.mr_enclave,
            attributes: self.attributes,
        }
    }
}

/// Target information of the enclave a report is destined for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub mr_enclave: [u8; 32],
    pub attributes: u64,
}

/// Body of a report: the reporting enclave's identity plus caller data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBody {
    pub mr_enclave: [u8; 32],
    pub mr_signer: [u8; 32],
    pub attributes: u64,
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub report_data: ReportData,
}

impl ReportBody {
    pub fn new(identity: &EnclaveIdentity, report_data: ReportData) -> Self {
        Self {
            mr_enclave: identity.mr_enclave,
            mr_signer: identity.mr_signer,
            attributes: identity.attributes,
            isv_prod_id: identity.isv_prod_id,
            isv_svn: identity.isv_svn,
            report_data,
        }
    }

    pub fn matches_identity(&self, identity: &EnclaveIdentity) -> bool {
        self.mr_enclave == identity.mr_enclave
            && self.mr_signer == identity.mr_signer
            && self.isv_prod_id == identity.isv_prod_id
            && self.isv_svn == identity.isv_svn
    }

    pub fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(&self.mr_enclave)?;
        out.write_all(&self.mr_signer)?;
        out.write_u64::<LittleEndian>(self.attributes)?;
        out.write_u16::<LittleEndian>(self.isv_prod_id)?;
        out.write_u16::<LittleEndian>(self.isv_svn)?;
        out.write_all(&self.report_data)
    }

    pub fn read_from(input: &mut impl Read) -> std::io::Result<Self> {
        let mut mr_enclave = [0u8; 32];
        input.read_exact(&mut mr_enclave)?;
        let mut mr_signer = [0u8; 32];
        input.read_exact(&mut mr_signer)?;
        let attributes = input.read_u64::<LittleEndian>()?;
        let isv_prod_id = input.read_u16::<LittleEndian>()?;
        let isv_svn = input.read_u16::<LittleEndian>()?;
        let mut report_data = [0u8; REPORT_DATA_LEN];
        input.read_exact(&mut report_data)?;
        Ok(Self {
            mr_enclave,
            mr_signer,
            attributes,
            isv_prod_id,
            isv_svn,
            report_data,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPORT_BODY_LEN);
        // Writing into a Vec cannot fail
        let _ = self.write_to(&mut out);
        out
    }
}

/// A report MACed for one target enclave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub body: ReportBody,
    pub key_id: [u8; 32],
    pub mac: [u8; DIGEST_LEN],
}

impl Report {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.body.to_bytes();
        out.extend_from_slice(&self.key_id);
        out.extend_from_slice(&self.mac);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PlatformError> {
        if bytes.len() != REPORT_LEN {
            return Err(PlatformError::Marshalling(format!(
                "report must be {} bytes, got {}",
                REPORT_LEN,
                bytes.len()
            )));
        }
        let mut input = bytes;
        let body = ReportBody::read_from(&mut input)
            .map_err(|e| PlatformError::Marshalling(e.to_string()))?;
        let mut key_id = [0u8; 32];
        key_id.copy_from_slice(&input[..32]);
        let mut mac = [0u8; DIGEST_LEN];
        mac.copy_from_slice(&input[32..64]);
        Ok(Self { body, key_id, mac })
    }
}

/// What the trusted node needs from the enclave hardware
pub trait Platform: Send + Sync + 'static {
    /// Identity of the enclave this node runs in
    fn identity(&self) -> &EnclaveIdentity;

    /// Produce a report over `report_data`, verifiable by `target`
    fn create_report(
        &self,
        target: &TargetInfo,
        report_data: &ReportData,
    ) -> Result<Report, PlatformError>;
}

/// Quote signature type
pub const SIGN_TYPE_UNLINKABLE: u16 = 0;
pub const SIGN_TYPE_LINKABLE: u16 = 1;

/// Software platform: reports are HMACs under a per-platform secret
#[derive(Clone)]
pub struct SimulatedPlatform {
    inner: Arc<SimulatedInner>,
}

struct SimulatedInner {
    identity: EnclaveIdentity,
    quoting_identity: EnclaveIdentity,
    secret: Zeroizing<[u8; 32]>,
    key_id: [u8; 32],
}

impl SimulatedPlatform {
    pub fn new(identity: EnclaveIdentity) -> Self {
        let secret = Zeroizing::new(rand::random::<[u8; 32]>());
        let key_id = crypto::sha256(&secret[..]);
        Self {
            inner: Arc::new(SimulatedInner {
                identity,
                quoting_identity: EnclaveIdentity::compute(
                    "simulated-quoting-enclave",
                    "simulated-platform-signer",
                    1,
                    1,
                ),
                secret,
                key_id,
            }),
        }
    }

    /// Simulated platform running a fixed development enclave identity
    pub fn development() -> Self {
        Self::new(EnclaveIdentity::compute(
            "enclave-rpc-dev",
            "enclave-rpc-signer-v1",
            1,
            1,
        ))
    }

    /// Target info of the simulated quoting enclave
    pub fn quoting_target(&self) -> TargetInfo {
        self.inner.quoting_identity.target_info()
    }

    /// Check a report's MAC for `target`
    pub fn verify_report(&self, target: &TargetInfo, report: &Report) -> bool {
        let key = match self.report_key(target) {
            Ok(key) => key,
            Err(_) => return false,
        };
        crypto::hmac_verify(
            &key[..],
            &[&report.body.to_bytes()[..], &report.key_id[..]],
            &report.mac,
        )
    }

    /// Quoting-enclave role: upgrade a report targeted at the quoting enclave
    /// into a quote
    pub fn quote(&self, report: &Report, sign_type: u16) -> Result<Vec<u8>, PlatformError> {
        if !self.verify_report(&self.quoting_target(), report) {
            return Err(PlatformError::Report(
                "report is not targeted at the quoting enclave".into(),
            ));
        }
        let mut quote = Vec::new();
        self.write_quote_prefix(&mut quote, sign_type, &report.body)
            .map_err(|e| PlatformError::Marshalling(e.to_string()))?;

        let signature = crypto::hmac_sha256(
            &self.inner.secret[..],
            &[&b"quote-signature"[..], &quote[..]],
        )?;
        quote.extend_from_slice(&(signature.len() as u32).to_le_bytes());
        quote.extend_from_slice(&signature);
        Ok(quote)
    }

    fn write_quote_prefix(
        &self,
        out: &mut Vec<u8>,
        sign_type: u16,
        body: &ReportBody,
    ) -> std::io::Result<()> {
        out.write_u16::<LittleEndian>(2)?;
        out.write_u16::<LittleEndian>(sign_type)?;
        out.write_all(&[0u8; 4])?; // EPID group id
        out.write_u16::<LittleEndian>(self.inner.quoting_identity.isv_svn)?;
        out.write_u16::<LittleEndian>(1)?; // PCE svn
        out.write_all(&self.inner.key_id)?;
        body.write_to(out)
    }

    fn report_key(&self, target: &TargetInfo) -> Result<Zeroizing<[u8; 32]>, PlatformError> {
        let key = crypto::hmac_sha256(
            &self.inner.secret[..],
            &[
                &b"report-key"[..],
                &target.mr_enclave[..],
                &target.attributes.to_le_bytes()[..],
            ],
        )?;
        Ok(Zeroizing::new(key))
    }
}

impl Platform for SimulatedPlatform {
    fn identity(&self) -> &EnclaveIdentity {
        &self.inner.identity
    }

    fn create_report(
        &self,
        target: &TargetInfo,
        report_data: &ReportData,
    ) -> Result<Report, PlatformError> {
        let body = ReportBody::new(&self.inner.identity, *report_data);
        let key = self.report_key(target)?;
        let mac = crypto::hmac_sha256(
            &key[..],
            &[&body.to_bytes()[..], &self.inner.key_id[..]],
        )?;
        Ok(Report {
            body,
            key_id: self.inner.key_id,
            mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_measurement() {
        let a = EnclaveIdentity::compute("code-v1", "signer-a", 1, 1);
        let b = EnclaveIdentity::compute("code-v1", "signer-a", 1, 1);
        let c = EnclaveIdentity::compute("code-v2", "signer-a", 1, 1);
        assert_eq!(a, b);
        assert_ne!(a.mr_enclave, c.mr_enclave);
        assert_eq!(a.mr_signer, c.mr_signer);
    }

    #[test]
    fn test_report_bound_to_target() {
        let platform = SimulatedPlatform::development();
        let target = platform.quoting_target();
        let report = platform.create_report(&target, &[9u8; REPORT_DATA_LEN]).unwrap();

        assert!(platform.verify_report(&target, &report));
        let other = EnclaveIdentity::compute("someone-else", "x", 1, 1).target_info();
        assert!(!platform.verify_report(&other, &report));
    }

    #[test]
    fn test_report_bytes() {
        let platform = SimulatedPlatform::development();
        let report = platform
            .create_report(&platform.quoting_target(), &[1u8; REPORT_DATA_LEN])
            .unwrap();
        let bytes = report.to_bytes();
        assert_eq!(bytes.len(), REPORT_LEN);
        assert_eq!(Report::from_bytes(&bytes).unwrap(), report);
        assert!(Report::from_bytes(&bytes[1..]).is_err());
    }

    #[test]
    fn test_tampered_report_rejected() {
        let platform = SimulatedPlatform::development();
        let target = platform.quoting_target();
        let mut report = platform.create_report(&target, &[0u8; REPORT_DATA_LEN]).unwrap();
        report.body.report_data[0] ^= 0xFF;
        assert!(!platform.verify_report(&target, &report));
        assert!(platform.quote(&report, SIGN_TYPE_LINKABLE).is_err());
    }

    #[test]
    fn test_quote_requires_quoting_target() {
        let platform = SimulatedPlatform::development();
        let wrong_target = platform.identity().target_info();
        let report = platform
            .create_report(&wrong_target, &[0u8; REPORT_DATA_LEN])
            .unwrap();
        assert!(matches!(
            platform.quote(&report, SIGN_TYPE_UNLINKABLE),
            Err(PlatformError::Report(_))
        ));
    }

    #[test]
    fn test_platforms_have_distinct_secrets() {
        let a = SimulatedPlatform::development();
        let b = SimulatedPlatform::development();
        let report = a
            .create_report(&a.quoting_target(), &[0u8; REPORT_DATA_LEN])
            .unwrap();
        assert!(!b.verify_report(&b.quoting_target(), &report));
    }
}
