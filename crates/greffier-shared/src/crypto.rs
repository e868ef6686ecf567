//! At-rest encryption primitives.
//!
//! Two of the three cryptographic layers live here: the per-meeting
//! AES-256-CBC file cipher (streaming and buffered forms) and the
//! AES-256-GCM wrap that protects data keys under the process master key.
//! The transport envelope is in [`crate::envelope`].

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const DATA_KEY_SIZE: usize = 32;
pub const FILE_IV_SIZE: usize = 16;
pub const WRAP_NONCE_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;

const BLOCK: usize = 16;

pub type DataKey = [u8; DATA_KEY_SIZE];
pub type FileIv = [u8; FILE_IV_SIZE];

/// Fresh 32-byte AES-256 key, one per meeting.
pub fn generate_data_key() -> DataKey {
    let mut key = [0u8; DATA_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Fresh 16-byte CBC IV, paired with the data key for the meeting lifetime.
pub fn generate_file_iv() -> FileIv {
    let mut iv = [0u8; FILE_IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// One-shot AES-256-CBC/PKCS#7 encryption for small buffered artifacts.
pub fn encrypt_buffer(plaintext: &[u8], key: &DataKey, iv: &FileIv) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// One-shot AES-256-CBC/PKCS#7 decryption.
pub fn decrypt_buffer(ciphertext: &[u8], key: &DataKey, iv: &FileIv) -> Result<Vec<u8>, CryptoError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Incremental AES-256-CBC encryptor.
///
/// CBC chaining state survives across [`update`](Self::update) calls, so a
/// reader can be consumed chunk by chunk without buffering the whole
/// plaintext. [`finalize`](Self::finalize) emits the PKCS#7-padded tail and
/// must be called exactly once.
pub struct StreamEncryptor {
    cipher: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl StreamEncryptor {
    pub fn new(key: &DataKey, iv: &FileIv) -> Self {
        Self {
            cipher: Aes256CbcEnc::new(key.into(), iv.into()),
            pending: Vec::new(),
        }
    }

    /// Feed a chunk; returns ciphertext for every complete block so far.
    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);
        let full = self.pending.len() - self.pending.len() % BLOCK;
        let mut out: Vec<u8> = self.pending.drain(..full).collect();
        for block in out.chunks_exact_mut(BLOCK) {
            self.cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    /// Pad the remainder and emit the final block.
    pub fn finalize(mut self) -> Vec<u8> {
        let pad = BLOCK - self.pending.len();
        let mut block = self.pending;
        block.resize(BLOCK, pad as u8);
        self.cipher
            .encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        block
    }
}

/// Incremental AES-256-CBC decryptor.
///
/// Always withholds the trailing block until [`finalize`](Self::finalize),
/// because only then is it known to carry the padding.
pub struct StreamDecryptor {
    cipher: Aes256CbcDec,
    pending: Vec<u8>,
}

impl StreamDecryptor {
    pub fn new(key: &DataKey, iv: &FileIv) -> Self {
        Self {
            cipher: Aes256CbcDec::new(key.into(), iv.into()),
            pending: Vec::new(),
        }
    }

    /// Feed ciphertext; returns all plaintext that is safe to release.
    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);
        if self.pending.len() <= BLOCK {
            return Vec::new();
        }
        let mut keep = self.pending.len() % BLOCK;
        if keep == 0 {
            keep = BLOCK;
        }
        let take = self.pending.len() - keep;
        let mut out: Vec<u8> = self.pending.drain(..take).collect();
        for block in out.chunks_exact_mut(BLOCK) {
            self.cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    /// Decrypt the withheld final block and strip its padding.
    pub fn finalize(mut self) -> Result<Vec<u8>, CryptoError> {
        if self.pending.len() != BLOCK {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut block = self.pending;
        self.cipher
            .decrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        let pad = block[BLOCK - 1] as usize;
        if pad == 0 || pad > BLOCK {
            return Err(CryptoError::DecryptionFailed);
        }
        if !block[BLOCK - pad..].iter().all(|&b| b == pad as u8) {
            return Err(CryptoError::DecryptionFailed);
        }
        block.truncate(BLOCK - pad);
        Ok(block)
    }
}

/// A data key wrapped under the master key, ready for persistence.
///
/// `payload` is `<wrapper_iv_hex>:<ciphertext_hex>`; `tag` is the 16-byte
/// GCM authentication tag, hex-encoded and stored alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub payload: String,
    pub tag: String,
}

/// Wrap a data key under the process master key (AES-256-GCM, random
/// 12-byte nonce per wrap).
pub fn wrap_data_key(master_key: &[u8; 32], data_key: &DataKey) -> Result<WrappedKey, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(master_key).map_err(|_| CryptoError::EncryptionFailed)?;
    let mut nonce_bytes = [0u8; WRAP_NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the tag to the ciphertext; split it off so the tag
    // can be stored in its own column.
    let sealed = cipher
        .encrypt(nonce, data_key.as_slice())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - GCM_TAG_SIZE);

    Ok(WrappedKey {
        payload: format!("{}:{}", hex::encode(nonce_bytes), hex::encode(ciphertext)),
        tag: hex::encode(tag),
    })
}

/// Unwrap a data key. Any tamper of payload, nonce, or tag fails with
/// [`CryptoError::KeyUnwrap`].
pub fn unwrap_data_key(
    master_key: &[u8; 32],
    payload: &str,
    tag_hex: &str,
) -> Result<DataKey, CryptoError> {
    let (nonce_hex, ciphertext_hex) = payload
        .split_once(':')
        .ok_or(CryptoError::MalformedWrappedKey)?;
    let nonce_bytes = hex::decode(nonce_hex).map_err(|_| CryptoError::MalformedWrappedKey)?;
    if nonce_bytes.len() != WRAP_NONCE_SIZE {
        return Err(CryptoError::MalformedWrappedKey);
    }
    let ciphertext = hex::decode(ciphertext_hex).map_err(|_| CryptoError::MalformedWrappedKey)?;
    let tag = hex::decode(tag_hex).map_err(|_| CryptoError::MalformedWrappedKey)?;
    if tag.len() != GCM_TAG_SIZE {
        return Err(CryptoError::MalformedWrappedKey);
    }

    let cipher = Aes256Gcm::new_from_slice(master_key).map_err(|_| CryptoError::KeyUnwrap)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| CryptoError::KeyUnwrap)?;

    plaintext
        .try_into()
        .map_err(|_| CryptoError::KeyUnwrap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> DataKey {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(13).wrapping_add(7);
        }
        key
    }

    fn test_iv() -> FileIv {
        [0x42u8; 16]
    }

    #[test]
    fn buffer_roundtrip() {
        let key = test_key();
        let iv = test_iv();
        let plaintext = b"audience du greffe, proces-verbal no. 7";

        let ciphertext = encrypt_buffer(plaintext, &key, &iv);
        assert_ne!(&ciphertext[..plaintext.len().min(ciphertext.len())], plaintext);

        let decrypted = decrypt_buffer(&ciphertext, &key, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn buffer_wrong_key_fails() {
        let key = test_key();
        let mut other = test_key();
        other[0] ^= 0xFF;
        let iv = test_iv();

        let ciphertext = encrypt_buffer(b"secret", &key, &iv);
        assert!(decrypt_buffer(&ciphertext, &other, &iv).is_err());
    }

    #[test]
    fn stream_matches_buffer_encryption() {
        let key = test_key();
        let iv = test_iv();
        let plaintext: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut enc = StreamEncryptor::new(&key, &iv);
        let mut streamed = Vec::new();
        // Deliberately awkward chunk sizes to exercise the carry-over path.
        for chunk in plaintext.chunks(977) {
            streamed.extend_from_slice(&enc.update(chunk));
        }
        streamed.extend_from_slice(&enc.finalize());

        assert_eq!(streamed, encrypt_buffer(&plaintext, &key, &iv));
    }

    #[test]
    fn stream_decrypt_roundtrip() {
        let key = test_key();
        let iv = test_iv();
        let plaintext: Vec<u8> = (0..50_000u32).map(|i| (i % 157) as u8).collect();
        let ciphertext = encrypt_buffer(&plaintext, &key, &iv);

        let mut dec = StreamDecryptor::new(&key, &iv);
        let mut recovered = Vec::new();
        for chunk in ciphertext.chunks(333) {
            recovered.extend_from_slice(&dec.update(chunk));
        }
        recovered.extend_from_slice(&dec.finalize().unwrap());

        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn stream_empty_input() {
        let key = test_key();
        let iv = test_iv();

        let enc = StreamEncryptor::new(&key, &iv);
        let ciphertext = enc.finalize();
        // One full padding block.
        assert_eq!(ciphertext.len(), 16);

        let mut dec = StreamDecryptor::new(&key, &iv);
        assert!(dec.update(&ciphertext).is_empty());
        assert_eq!(dec.finalize().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let master = test_key();
        let data_key = generate_data_key();

        let wrapped = wrap_data_key(&master, &data_key).unwrap();
        let unwrapped = unwrap_data_key(&master, &wrapped.payload, &wrapped.tag).unwrap();
        assert_eq!(unwrapped, data_key);
    }

    #[test]
    fn wrap_is_randomized() {
        let master = test_key();
        let data_key = generate_data_key();

        let a = wrap_data_key(&master, &data_key).unwrap();
        let b = wrap_data_key(&master, &data_key).unwrap();
        assert_ne!(a.payload, b.payload);
    }

    #[test]
    fn tampered_tag_fails_unwrap() {
        let master = test_key();
        let data_key = generate_data_key();
        let wrapped = wrap_data_key(&master, &data_key).unwrap();

        let mut tag = hex::decode(&wrapped.tag).unwrap();
        tag[0] ^= 0x01;
        let result = unwrap_data_key(&master, &wrapped.payload, &hex::encode(tag));
        assert!(matches!(result, Err(CryptoError::KeyUnwrap)));
    }

    #[test]
    fn tampered_ciphertext_fails_unwrap() {
        let master = test_key();
        let data_key = generate_data_key();
        let wrapped = wrap_data_key(&master, &data_key).unwrap();

        let (nonce_hex, ct_hex) = wrapped.payload.split_once(':').unwrap();
        let mut ct = hex::decode(ct_hex).unwrap();
        ct[3] ^= 0x80;
        let payload = format!("{}:{}", nonce_hex, hex::encode(ct));
        let result = unwrap_data_key(&master, &payload, &wrapped.tag);
        assert!(matches!(result, Err(CryptoError::KeyUnwrap)));
    }

    #[test]
    fn tampered_nonce_fails_unwrap() {
        let master = test_key();
        let data_key = generate_data_key();
        let wrapped = wrap_data_key(&master, &data_key).unwrap();

        let (nonce_hex, ct_hex) = wrapped.payload.split_once(':').unwrap();
        let mut nonce = hex::decode(nonce_hex).unwrap();
        nonce[0] ^= 0x01;
        let payload = format!("{}:{}", hex::encode(nonce), ct_hex);
        let result = unwrap_data_key(&master, &payload, &wrapped.tag);
        assert!(matches!(result, Err(CryptoError::KeyUnwrap)));
    }

    #[test]
    fn wrong_master_key_fails_unwrap() {
        let master = test_key();
        let mut other = test_key();
        other[31] ^= 0xFF;
        let data_key = generate_data_key();
        let wrapped = wrap_data_key(&master, &data_key).unwrap();

        assert!(matches!(
            unwrap_data_key(&other, &wrapped.payload, &wrapped.tag),
            Err(CryptoError::KeyUnwrap)
        ));
    }

    #[test]
    fn malformed_payload_rejected() {
        let master = test_key();
        assert!(matches!(
            unwrap_data_key(&master, "no-separator-here", "00"),
            Err(CryptoError::MalformedWrappedKey)
        ));
        assert!(matches!(
            unwrap_data_key(&master, "zz:aabb", "00"),
            Err(CryptoError::MalformedWrappedKey)
        ));
    }
}
