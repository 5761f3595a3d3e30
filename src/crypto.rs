//! Boundary crypto primitives
//!
//! AES-256-GCM with detached tags for envelopes, HKDF-SHA256 for session key
//! schedules, HMAC-SHA256 for handshake and report authenticators.

use crate::error::CryptoError;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const MAC_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;

pub type SymmetricKey = Zeroizing<[u8; KEY_LEN]>;

type HmacSha256 = Hmac<Sha256>;

/// Encrypt `plaintext`, returning the ciphertext and its detached tag
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; MAC_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, buffer.as_mut_slice())
        .map_err(|_| CryptoError::Seal)?;
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(tag.as_slice());
    Ok((buffer, mac))
}

/// Verify and decrypt; the plaintext buffer is wiped on drop
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    mac: &[u8; MAC_LEN],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(mac),
        )
        .map_err(|_| CryptoError::Open)?;
    Ok(buffer)
}

/// HKDF-SHA256 extract-and-expand into `N` bytes
pub fn hkdf_expand<const N: usize>(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; N]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; N]);
    hk.expand(info, &mut okm[..])
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

/// HMAC-SHA256 over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; DIGEST_LEN], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::MacKey)?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(mac.finalize().into_bytes().as_slice());
    Ok(out)
}

/// Constant-time HMAC-SHA256 check
pub fn hmac_verify(key: &[u8], parts: &[&[u8]], expected: &[u8]) -> bool {
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(expected).is_ok()
}

pub fn sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(Sha256::digest(data).as_slice());
    out
}

pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

pub fn random_nonce() -> [u8; NONCE_LEN] {
    rand::random()
}

/// Split a derived key block into fixed-size keys
pub fn split_key(block: &[u8], index: usize) -> SymmetricKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&block[index * KEY_LEN..(index + 1) * KEY_LEN]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [7u8; KEY_LEN];
        let nonce = random_nonce();
        let (ct, mac) = seal(&key, &nonce, b"aad", b"lookup these numbers").unwrap();
        assert_ne!(ct.as_slice(), b"lookup these numbers");

        let pt = open(&key, &nonce, b"aad", &ct, &mac).unwrap();
        assert_eq!(pt.as_slice(), b"lookup these numbers");
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let key = [7u8; KEY_LEN];
        let nonce = random_nonce();
        let (ct, mac) = seal(&key, &nonce, b"aad-1", b"payload").unwrap();
        assert_eq!(
            open(&key, &nonce, b"aad-2", &ct, &mac).unwrap_err(),
            CryptoError::Open
        );
    }

    #[test]
    fn test_open_rejects_flipped_tag() {
        let key = [7u8; KEY_LEN];
        let nonce = random_nonce();
        let (ct, mut mac) = seal(&key, &nonce, b"", b"payload").unwrap();
        mac[0] ^= 0x01;
        assert!(open(&key, &nonce, b"", &ct, &mac).is_err());
    }

    #[test]
    fn test_hkdf_is_deterministic() {
        let a = hkdf_expand::<64>(b"salt", b"ikm", b"info").unwrap();
        let b = hkdf_expand::<64>(b"salt", b"ikm", b"info").unwrap();
        let c = hkdf_expand::<64>(b"salt", b"ikm", b"other").unwrap();
        assert_eq!(a[..], b[..]);
        assert_ne!(a[..], c[..]);
        assert_ne!(split_key(&a[..], 0)[..], split_key(&a[..], 1)[..]);
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"key", &[b"a", b"b"]).unwrap();
        assert!(hmac_verify(b"key", &[b"ab"], &tag));
        assert!(!hmac_verify(b"other", &[b"ab"], &tag));
        assert!(!hmac_verify(b"key", &[b"ab"], &tag[..16]));
    }

    #[test]
    fn test_hmac_known_answer() {
        // RFC 4231 test case 1
        let tag = hmac_sha256(&[0x0b; 20], &[b"Hi ", b"There"]).unwrap();
        assert_eq!(
            hex::encode(tag),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
        assert!(hmac_verify(&[0x0b; 20], &[b"Hi There"], &tag));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
