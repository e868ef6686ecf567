//! Per-request transport envelope.
//!
//! Each artifact response gets a fresh 32-byte AES key and 16-byte IV. The
//! 48-byte pair is RSA-OAEP(SHA-256) encrypted under the client's public key
//! and travels base64-encoded in a response header, while the artifact body
//! streams through AES-256-CBC under the session key. The server never puts
//! cleartext on the wire.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;

use crate::crypto::StreamEncryptor;
use crate::error::CryptoError;

const SESSION_BLOB_SIZE: usize = 48;

/// A minted session envelope: the header value plus the body cipher.
pub struct SessionEnvelope {
    pub encrypted_key_b64: String,
    pub cipher: StreamEncryptor,
}

/// Build the envelope for one response from the client's public key PEM.
///
/// The PEM may arrive mangled by header transport: literal `\n` escapes,
/// surrounding quotes, or a headerless single-line base64 body are all
/// accepted and normalized before key import.
pub fn build_session_envelope(client_public_key_pem: &str) -> Result<SessionEnvelope, CryptoError> {
    let pem = normalize_public_key_pem(client_public_key_pem)?;

    let public_key = if pem.contains("RSA PUBLIC KEY") {
        RsaPublicKey::from_pkcs1_pem(&pem)
            .map_err(|e| CryptoError::PubKeyFormat(e.to_string()))?
    } else {
        RsaPublicKey::from_public_key_pem(&pem)
            .map_err(|e| CryptoError::PubKeyFormat(e.to_string()))?
    };

    let mut session_key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut session_key);
    let mut session_iv = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut session_iv);

    let mut blob = [0u8; SESSION_BLOB_SIZE];
    blob[..32].copy_from_slice(&session_key);
    blob[32..].copy_from_slice(&session_iv);

    let ciphertext = public_key
        .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), &blob)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(SessionEnvelope {
        encrypted_key_b64: BASE64.encode(ciphertext),
        cipher: StreamEncryptor::new(&session_key, &session_iv),
    })
}

/// Rebuild a well-formed 64-column PEM from whatever a client managed to
/// squeeze through an HTTP header.
pub fn normalize_public_key_pem(raw: &str) -> Result<String, CryptoError> {
    let mut s = raw.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s = s[1..s.len() - 1].trim();
    }
    let unescaped = s
        .replace("\\r\\n", "\n")
        .replace("\\n", "\n")
        .replace('\r', "\n");

    let (label, body) = match unescaped.find("-----BEGIN ") {
        Some(begin) => {
            let after = &unescaped[begin + "-----BEGIN ".len()..];
            let label_end = after
                .find("-----")
                .ok_or_else(|| CryptoError::PubKeyFormat("unterminated PEM header".into()))?;
            let label = after[..label_end].trim().to_string();
            let rest = &after[label_end + 5..];
            let body_end = rest
                .find("-----END")
                .ok_or_else(|| CryptoError::PubKeyFormat("missing PEM footer".into()))?;
            (label, rest[..body_end].to_string())
        }
        None => ("PUBLIC KEY".to_string(), unescaped),
    };

    let body: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    if body.is_empty() {
        return Err(CryptoError::PubKeyFormat("empty key body".into()));
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
    {
        return Err(CryptoError::PubKeyFormat("key body is not base64".into()));
    }

    let mut pem = format!("-----BEGIN {}-----\n", label);
    let mut i = 0;
    while i < body.len() {
        let end = (i + 64).min(body.len());
        pem.push_str(&body[i..end]);
        pem.push('\n');
        i = end;
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StreamDecryptor;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    fn test_keypair() -> (RsaPrivateKey, String) {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (private, pem)
    }

    fn open_envelope(private: &RsaPrivateKey, envelope: &str) -> ([u8; 32], [u8; 16]) {
        let ciphertext = BASE64.decode(envelope).unwrap();
        let blob = private
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .unwrap();
        assert_eq!(blob.len(), 48);
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&blob[..32]);
        iv.copy_from_slice(&blob[32..]);
        (key, iv)
    }

    #[test]
    fn envelope_roundtrip() {
        let (private, pem) = test_keypair();
        let envelope = build_session_envelope(&pem).unwrap();

        let plaintext = b"the clerk reads the minutes aloud";
        let mut cipher = envelope.cipher;
        let mut body = cipher.update(plaintext);
        body.extend_from_slice(&cipher.finalize());

        let (key, iv) = open_envelope(&private, &envelope.encrypted_key_b64);
        let mut dec = StreamDecryptor::new(&key, &iv);
        let mut recovered = dec.update(&body);
        recovered.extend_from_slice(&dec.finalize().unwrap());
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn fresh_session_keys_per_request() {
        let (private, pem) = test_keypair();
        let a = build_session_envelope(&pem).unwrap();
        let b = build_session_envelope(&pem).unwrap();
        let (key_a, _) = open_envelope(&private, &a.encrypted_key_b64);
        let (key_b, _) = open_envelope(&private, &b.encrypted_key_b64);
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn accepts_standard_multiline_pem() {
        let (_, pem) = test_keypair();
        assert!(build_session_envelope(&pem).is_ok());
    }

    #[test]
    fn accepts_escaped_newlines() {
        let (_, pem) = test_keypair();
        let escaped = pem.replace('\n', "\\n");
        assert!(build_session_envelope(&escaped).is_ok());
    }

    #[test]
    fn accepts_headerless_single_line() {
        let (_, pem) = test_keypair();
        let body: String = pem
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        assert!(build_session_envelope(&body).is_ok());
    }

    #[test]
    fn accepts_quoted_pem() {
        let (_, pem) = test_keypair();
        let quoted = format!("\"{}\"", pem.replace('\n', "\\n"));
        assert!(build_session_envelope(&quoted).is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            build_session_envelope("not a key at all!!!"),
            Err(CryptoError::PubKeyFormat(_))
        ));
        assert!(matches!(
            build_session_envelope(""),
            Err(CryptoError::PubKeyFormat(_))
        ));
    }

    #[test]
    fn rejects_valid_base64_invalid_key() {
        let result = build_session_envelope("aGVsbG8gd29ybGQ=");
        assert!(matches!(result, Err(CryptoError::PubKeyFormat(_))));
    }

    #[test]
    fn normalize_wraps_at_64_columns() {
        let (_, pem) = test_keypair();
        let body: String = pem
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        let rebuilt = normalize_public_key_pem(&body).unwrap();
        for line in rebuilt.lines().filter(|l| !l.starts_with("-----")) {
            assert!(line.len() <= 64);
        }
        assert!(rebuilt.starts_with("-----BEGIN PUBLIC KEY-----\n"));
    }
}
