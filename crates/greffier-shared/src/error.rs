use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Failed to unwrap key: authentication tag mismatch")]
    KeyUnwrap,

    #[error("Malformed wrapped key record")]
    MalformedWrappedKey,

    #[error("Invalid public key: {0}")]
    PubKeyFormat(String),
}
