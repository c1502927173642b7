//! Signing, sealing, and key derivation for SMB2/SMB3 sessions

use aes::Aes128;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, KeyInit};
use ccm::consts::{U11, U16};
use ccm::Ccm;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};
use crate::protocol::messages::common::TransformHeader;
use crate::protocol::smb2_constants::{cipher, transform_flags, SMB2_HEADER_SIZE};

type HmacSha256 = Hmac<Sha256>;
type AesCmac = Cmac<Aes128>;
type Aes128Ccm = Ccm<Aes128, U16, U11>;

/// Byte range of the signature field within the SMB2 header
const SIG_START: usize = 48;
const SIG_END: usize = 64;
const FLAGS_START: usize = 16;

const ZERO_SIGNATURE: [u8; 16] = [0; 16];
const SIGNED_FLAG: u32 = 0x00000008;

/// Fill `buf` from the operating system CSPRNG
pub fn random_bytes(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| Error::Internal(format!("rng failure: {}", e)))
}

/// SP800-108 counter-mode KDF with HMAC-SHA256, fixed to one 128-bit block.
///
/// Labels carry their trailing NUL as on the wire; the 0x00 separator
/// between label and context is written separately.
pub fn derive_key(key: &[u8; 16], label: &[u8], context: &[u8]) -> Result<[u8; 16]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Internal(format!("kdf init failure: {}", e)))?;
    mac.update(&1u32.to_be_bytes());
    mac.update(label);
    mac.update(&[0u8]);
    mac.update(context);
    mac.update(&128u32.to_be_bytes());
    let out = mac.finalize().into_bytes();
    let mut derived = [0u8; 16];
    derived.copy_from_slice(&out[..16]);
    Ok(derived)
}

/// One step of the SMB 3.1.1 preauth-integrity chain: `SHA512(current ‖ message)`
pub fn preauth_hash_step(current: &[u8; 64], message: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(current);
    hasher.update(message);
    let out = hasher.finalize();
    let mut next = [0u8; 64];
    next.copy_from_slice(&out);
    next
}

/// Per-session message signer.
///
/// SMB 2.x signs with HMAC-SHA256 over the session key; SMB 3.x signs with
/// AES-128-CMAC over the derived signing key. The signature is the first 16
/// bytes of the MAC computed over the packet with a zeroed signature field.
#[derive(Clone)]
pub enum Signer {
    HmacSha256 { key: [u8; 16] },
    AesCmac { key: [u8; 16] },
}

impl Signer {
    /// Set the SIGNED flag and write the signature in place
    pub fn sign(&self, pkt: &mut [u8]) -> Result<()> {
        if pkt.len() < SMB2_HEADER_SIZE {
            return Err(Error::Internal("packet too short to sign".into()));
        }
        let mut flags = u32::from_le_bytes([
            pkt[FLAGS_START],
            pkt[FLAGS_START + 1],
            pkt[FLAGS_START + 2],
            pkt[FLAGS_START + 3],
        ]);
        flags |= SIGNED_FLAG;
        pkt[FLAGS_START..FLAGS_START + 4].copy_from_slice(&flags.to_le_bytes());

        let signature = match self {
            Signer::HmacSha256 { key } => {
                let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
                    .map_err(|e| Error::Internal(format!("signing failure: {}", e)))?;
                update_zeroed_signature(&mut mac, pkt);
                let out = mac.finalize().into_bytes();
                let mut sig = [0u8; 16];
                sig.copy_from_slice(&out[..16]);
                sig
            }
            Signer::AesCmac { key } => {
                let mut mac = <AesCmac as Mac>::new_from_slice(key)
                    .map_err(|e| Error::Internal(format!("signing failure: {}", e)))?;
                update_zeroed_signature(&mut mac, pkt);
                let out = mac.finalize().into_bytes();
                let mut sig = [0u8; 16];
                sig.copy_from_slice(&out[..16]);
                sig
            }
        };
        pkt[SIG_START..SIG_END].copy_from_slice(&signature);
        Ok(())
    }

    /// Recompute and compare the signature in constant time
    pub fn verify(&self, pkt: &[u8]) -> bool {
        if pkt.len() < SMB2_HEADER_SIZE {
            return false;
        }
        match self {
            Signer::HmacSha256 { key } => {
                let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
                    return false;
                };
                update_zeroed_signature(&mut mac, pkt);
                mac.verify_truncated_left(&pkt[SIG_START..SIG_END]).is_ok()
            }
            Signer::AesCmac { key } => {
                let Ok(mut mac) = <AesCmac as Mac>::new_from_slice(key) else {
                    return false;
                };
                update_zeroed_signature(&mut mac, pkt);
                mac.verify_truncated_left(&pkt[SIG_START..SIG_END]).is_ok()
            }
        }
    }
}

fn update_zeroed_signature<M: Mac>(mac: &mut M, pkt: &[u8]) {
    mac.update(&pkt[..SIG_START]);
    mac.update(&ZERO_SIGNATURE);
    mac.update(&pkt[SIG_END..]);
}

/// Per-direction transform-header sealer (AES-128-CCM or AES-128-GCM).
///
/// The transform signature field carries the AEAD tag; associated data is
/// the transform header from the nonce field onward.
#[derive(Clone)]
pub struct Sealer {
    cipher_id: u16,
    key: [u8; 16],
}

impl Sealer {
    pub fn new(cipher_id: u16, key: [u8; 16]) -> Result<Self> {
        match cipher_id {
            cipher::AES128_CCM | cipher::AES128_GCM => Ok(Self { cipher_id, key }),
            _ => Err(Error::Internal(format!(
                "unsupported cipher id: 0x{:04x}",
                cipher_id
            ))),
        }
    }

    fn nonce_len(&self) -> usize {
        match self.cipher_id {
            cipher::AES128_CCM => 11,
            _ => 12,
        }
    }

    /// Wrap cleartext SMB2 bytes in an encrypted transform envelope
    pub fn seal(&self, session_id: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; 16];
        random_bytes(&mut nonce[..self.nonce_len()])?;

        let mut header = TransformHeader {
            signature: [0; 16],
            nonce,
            original_message_size: plaintext.len() as u32,
            flags: transform_flags::ENCRYPTED,
            session_id,
        };
        let header_bytes = header.serialize()?;
        let aad = &header_bytes[TransformHeader::AAD_OFFSET..];

        let mut sealed = self.encrypt(&nonce, plaintext, aad)?;
        if sealed.len() < plaintext.len() + 16 {
            return Err(Error::Internal("sealed output too short".into()));
        }
        let tag_start = sealed.len() - 16;
        header.signature.copy_from_slice(&sealed[tag_start..]);
        sealed.truncate(tag_start);

        let mut pkt = header.serialize()?;
        pkt.extend_from_slice(&sealed);
        Ok(pkt)
    }

    /// Verify and decrypt a transform-framed packet back to cleartext
    pub fn open(&self, pkt: &[u8]) -> Result<Vec<u8>> {
        let header = TransformHeader::parse(pkt)?;
        if header.flags != transform_flags::ENCRYPTED {
            return Err(Error::InvalidResponse("encrypted flag is not on".into()));
        }

        let aad = &pkt[TransformHeader::AAD_OFFSET..TransformHeader::SIZE];
        let mut sealed = pkt[TransformHeader::SIZE..].to_vec();
        sealed.extend_from_slice(&header.signature);

        let plaintext = self.decrypt(&header.nonce, &sealed, aad)?;
        if plaintext.len() != header.original_message_size as usize {
            return Err(Error::InvalidResponse(
                "decrypted size does not match transform header".into(),
            ));
        }
        Ok(plaintext)
    }

    fn encrypt(&self, nonce: &[u8; 16], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self.cipher_id {
            cipher::AES128_CCM => Aes128Ccm::new(&self.key.into())
                .encrypt(GenericArray::from_slice(&nonce[..11]), payload)
                .map_err(|_| Error::Internal("encryption failure".into())),
            _ => Aes128Gcm::new(&self.key.into())
                .encrypt(GenericArray::from_slice(&nonce[..12]), payload)
                .map_err(|_| Error::Internal("encryption failure".into())),
        }
    }

    fn decrypt(&self, nonce: &[u8; 16], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self.cipher_id {
            cipher::AES128_CCM => Aes128Ccm::new(&self.key.into())
                .decrypt(GenericArray::from_slice(&nonce[..11]), payload)
                .map_err(|_| Error::InvalidResponse("decryption failure".into())),
            _ => Aes128Gcm::new(&self.key.into())
                .decrypt(GenericArray::from_slice(&nonce[..12]), payload)
                .map_err(|_| Error::InvalidResponse("decryption failure".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::common::Smb2Header;
    use crate::protocol::smb2_constants::{Smb2Command, Smb2HeaderFlags};

    fn sample_packet() -> Vec<u8> {
        let mut hdr = Smb2Header::new(Smb2Command::Write);
        hdr.message_id = 5;
        hdr.session_id = 0x1234;
        let mut pkt = hdr.serialize().unwrap();
        pkt.extend_from_slice(b"payload bytes");
        pkt
    }

    #[test]
    fn test_derive_key_deterministic() {
        let key = [0x11; 16];
        let a = derive_key(&key, b"SMB2AESCMAC\0", b"SmbSign\0").unwrap();
        let b = derive_key(&key, b"SMB2AESCMAC\0", b"SmbSign\0").unwrap();
        let c = derive_key(&key, b"SMB2APP\0", b"SmbRpc\0").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, key);
    }

    #[test]
    fn test_sign_verify_hmac() {
        let signer = Signer::HmacSha256 { key: [0x22; 16] };
        let mut pkt = sample_packet();
        signer.sign(&mut pkt).unwrap();

        let hdr = Smb2Header::parse(&pkt).unwrap();
        assert!(hdr.flags.contains(Smb2HeaderFlags::SIGNED));
        assert_ne!(hdr.signature, [0; 16]);
        assert!(signer.verify(&pkt));
    }

    #[test]
    fn test_sign_verify_cmac() {
        let signer = Signer::AesCmac { key: [0x33; 16] };
        let mut pkt = sample_packet();
        signer.sign(&mut pkt).unwrap();
        assert!(signer.verify(&pkt));

        let other = Signer::AesCmac { key: [0x34; 16] };
        assert!(!other.verify(&pkt));
    }

    #[test]
    fn test_verify_detects_tamper() {
        let signer = Signer::HmacSha256 { key: [0x22; 16] };
        let mut pkt = sample_packet();
        signer.sign(&mut pkt).unwrap();
        let last = pkt.len() - 1;
        pkt[last] ^= 0xFF;
        assert!(!signer.verify(&pkt));
    }

    #[test]
    fn test_seal_open_roundtrip_ccm() {
        let sealer = Sealer::new(cipher::AES128_CCM, [0x44; 16]).unwrap();
        let plaintext = sample_packet();
        let sealed = sealer.seal(0xBEEF, &plaintext).unwrap();

        let header = TransformHeader::parse(&sealed).unwrap();
        assert_eq!(header.session_id, 0xBEEF);
        assert_eq!(header.original_message_size as usize, plaintext.len());
        assert_eq!(sealer.open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_seal_open_roundtrip_gcm() {
        let sealer = Sealer::new(cipher::AES128_GCM, [0x55; 16]).unwrap();
        let plaintext = sample_packet();
        let sealed = sealer.seal(7, &plaintext).unwrap();
        assert_eq!(sealer.open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_open_detects_tamper() {
        let sealer = Sealer::new(cipher::AES128_GCM, [0x55; 16]).unwrap();
        let mut sealed = sealer.seal(7, &sample_packet()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(sealer.open(&sealed).is_err());
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let sealer = Sealer::new(cipher::AES128_CCM, [0x44; 16]).unwrap();
        let sealed = sealer.seal(7, &sample_packet()).unwrap();
        let other = Sealer::new(cipher::AES128_CCM, [0x45; 16]).unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_sealer_rejects_unknown_cipher() {
        assert!(Sealer::new(0x0099, [0; 16]).is_err());
    }

    #[test]
    fn test_preauth_chain_matches_manual_composition() {
        let zero = [0u8; 64];
        let req = b"negotiate request bytes";
        let resp = b"negotiate response bytes";

        let step1 = preauth_hash_step(&zero, req);
        let step2 = preauth_hash_step(&step1, resp);

        let mut hasher = Sha512::new();
        hasher.update(zero);
        hasher.update(req);
        let inner: [u8; 64] = hasher.finalize().into();
        let mut hasher = Sha512::new();
        hasher.update(inner);
        hasher.update(resp);
        let expected: [u8; 64] = hasher.finalize().into();

        assert_eq!(step2, expected);
        assert_ne!(step1, step2);
    }
}
