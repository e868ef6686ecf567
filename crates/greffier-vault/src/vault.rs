//! Encrypted blob vault.
//!
//! Every artifact a meeting produces lives under the vault root as an
//! AES-256-CBC ciphertext: `audio/<id>.enc` for the transcoded recording,
//! `data/<id>_{transcript,summary}.enc` for head artifacts and
//! `data/<id>_{kind}_v<N>.enc` for immutable revision snapshots. The vault
//! never sees key material beyond the (key, IV) arguments of a single call
//! and never writes plaintext to disk.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use greffier_shared::crypto::{self, DataKey, FileIv, StreamDecryptor, StreamEncryptor};

use crate::error::VaultError;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    /// Open the vault rooted at `root`, creating the `audio/` and `data/`
    /// subtrees if absent.
    pub async fn open(root: PathBuf) -> Result<Self, VaultError> {
        for sub in ["audio", "data"] {
            fs::create_dir_all(root.join(sub)).await?;
        }
        info!(path = %root.display(), "vault initialized");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a stored vault path to a filesystem path, rejecting anything
    /// that would escape the vault root.
    fn resolve(&self, rel: &str) -> Result<PathBuf, VaultError> {
        let p = Path::new(rel);
        let escapes = p.is_absolute()
            || p.components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
        if escapes {
            return Err(VaultError::InvalidPath(rel.to_string()));
        }
        Ok(self.root.join(p))
    }

    /// Consume `reader`, pipe it through AES-256-CBC, and write the
    /// ciphertext to `rel`. Returns the number of plaintext bytes consumed;
    /// the call completes only after the final cipher block and the
    /// writer's flush both succeed.
    pub async fn encrypt_stream_to_file<R>(
        &self,
        mut reader: R,
        rel: &str,
        key: &DataKey,
        iv: &FileIv,
    ) -> Result<u64, VaultError>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.resolve(rel)?;
        let mut writer = BufWriter::new(fs::File::create(&path).await?);
        let mut cipher = StreamEncryptor::new(key, iv);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            let ciphertext = cipher.update(&buf[..n]);
            if !ciphertext.is_empty() {
                writer.write_all(&ciphertext).await?;
            }
        }

        writer.write_all(&cipher.finalize()).await?;
        writer.flush().await?;

        debug!(path = %path.display(), plaintext_bytes = total, "encrypted stream into vault");
        Ok(total)
    }

    /// Lazy decrypting read: returns a stream of plaintext chunks.
    ///
    /// The file is read and decrypted by a background task; dropping the
    /// returned stream closes the channel and the task stops reading on the
    /// next send. Fails with [`VaultError::NotFound`] when `rel` is absent.
    pub async fn decrypt_stream(
        &self,
        rel: &str,
        key: &DataKey,
        iv: &FileIv,
    ) -> Result<ReceiverStream<Result<Bytes, VaultError>>, VaultError> {
        let path = self.resolve(rel)?;
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound(rel.to_string()));
            }
            Err(e) => return Err(VaultError::Io(e)),
        };

        let (tx, rx) = mpsc::channel::<Result<Bytes, VaultError>>(8);
        let key = *key;
        let iv = *iv;
        let rel = rel.to_string();

        tokio::spawn(async move {
            let mut cipher = StreamDecryptor::new(&key, &iv);
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let plaintext = cipher.update(&buf[..n]);
                        if !plaintext.is_empty()
                            && tx.send(Ok(Bytes::from(plaintext))).await.is_err()
                        {
                            debug!(path = %rel, "decrypt stream consumer went away");
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(VaultError::Io(e))).await;
                        return;
                    }
                }
            }
            match cipher.finalize() {
                Ok(tail) => {
                    if !tail.is_empty() {
                        let _ = tx.send(Ok(Bytes::from(tail))).await;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(VaultError::Crypto(e))).await;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Decrypt a blob into a plaintext file (the transcriber staging path).
    pub async fn decrypt_to_file(
        &self,
        rel: &str,
        key: &DataKey,
        iv: &FileIv,
        dest: &Path,
    ) -> Result<(), VaultError> {
        let mut stream = self.decrypt_stream(rel, key, iv).await?;
        let mut out = BufWriter::new(fs::File::create(dest).await?);
        while let Some(chunk) = stream.next().await {
            out.write_all(&chunk?).await?;
        }
        out.flush().await?;
        Ok(())
    }

    /// Convenience for small JSON artifacts: encrypt in one shot and write.
    pub async fn encrypt_buffer_to_file(
        &self,
        bytes: &[u8],
        rel: &str,
        key: &DataKey,
        iv: &FileIv,
    ) -> Result<(), VaultError> {
        let path = self.resolve(rel)?;
        fs::write(&path, crypto::encrypt_buffer(bytes, key, iv)).await?;
        debug!(path = %path.display(), plaintext_bytes = bytes.len(), "encrypted buffer into vault");
        Ok(())
    }

    /// Read a whole blob and decrypt it in memory.
    pub async fn decrypt_buffer_from_file(
        &self,
        rel: &str,
        key: &DataKey,
        iv: &FileIv,
    ) -> Result<Vec<u8>, VaultError> {
        let path = self.resolve(rel)?;
        let ciphertext = match fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound(rel.to_string()));
            }
            Err(e) => return Err(VaultError::Io(e)),
        };
        Ok(crypto::decrypt_buffer(&ciphertext, key, iv)?)
    }

    /// Unlink a blob. Callers on the delete path treat failures as
    /// best-effort; the blob is already unreadable once its key is gone.
    pub async fn remove(&self, rel: &str) -> Result<(), VaultError> {
        let path = self.resolve(rel)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(rel.to_string()))
            }
            Err(e) => Err(VaultError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greffier_shared::crypto::{generate_data_key, generate_file_iv};
    use tempfile::TempDir;

    async fn test_vault() -> (Vault, TempDir) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path().join("vault")).await.unwrap();
        (vault, dir)
    }

    #[tokio::test]
    async fn open_creates_subdirectories() {
        let (vault, _dir) = test_vault().await;
        assert!(vault.root().join("audio").is_dir());
        assert!(vault.root().join("data").is_dir());
    }

    #[tokio::test]
    async fn buffer_roundtrip() {
        let (vault, _dir) = test_vault().await;
        let key = generate_data_key();
        let iv = generate_file_iv();
        let payload = br#"{"text":"bonjour","segments":[]}"#;

        vault
            .encrypt_buffer_to_file(payload, "data/m1_transcript.enc", &key, &iv)
            .await
            .unwrap();

        // Raw file must not contain the plaintext.
        let raw = std::fs::read(vault.root().join("data/m1_transcript.enc")).unwrap();
        assert!(!raw.windows(payload.len()).any(|w| w == payload.as_slice()));

        let decrypted = vault
            .decrypt_buffer_from_file("data/m1_transcript.enc", &key, &iv)
            .await
            .unwrap();
        assert_eq!(decrypted, payload);
    }

    #[tokio::test]
    async fn stream_roundtrip() {
        let (vault, _dir) = test_vault().await;
        let key = generate_data_key();
        let iv = generate_file_iv();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 239) as u8).collect();

        let written = vault
            .encrypt_stream_to_file(payload.as_slice(), "audio/m1.enc", &key, &iv)
            .await
            .unwrap();
        assert_eq!(written, payload.len() as u64);

        let mut stream = vault.decrypt_stream("audio/m1.enc", &key, &iv).await.unwrap();
        let mut recovered = Vec::new();
        while let Some(chunk) = stream.next().await {
            recovered.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(recovered, payload);
    }

    #[tokio::test]
    async fn decrypt_to_file_stages_plaintext() {
        let (vault, dir) = test_vault().await;
        let key = generate_data_key();
        let iv = generate_file_iv();
        let payload = b"mp3 frames pretend to live here";

        vault
            .encrypt_stream_to_file(payload.as_slice(), "audio/m1.enc", &key, &iv)
            .await
            .unwrap();

        let staged = dir.path().join("staged.mp3");
        vault
            .decrypt_to_file("audio/m1.enc", &key, &iv, &staged)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&staged).unwrap(), payload);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (vault, _dir) = test_vault().await;
        let key = generate_data_key();
        let iv = generate_file_iv();

        assert!(matches!(
            vault.decrypt_stream("audio/nope.enc", &key, &iv).await,
            Err(VaultError::NotFound(_))
        ));
        assert!(matches!(
            vault
                .decrypt_buffer_from_file("data/nope.enc", &key, &iv)
                .await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn wrong_key_fails_stream_decrypt() {
        let (vault, _dir) = test_vault().await;
        let key = generate_data_key();
        let iv = generate_file_iv();
        vault
            .encrypt_buffer_to_file(b"sealed", "data/m1_summary.enc", &key, &iv)
            .await
            .unwrap();

        let other = generate_data_key();
        let result = vault
            .decrypt_buffer_from_file("data/m1_summary.enc", &other, &iv)
            .await;
        assert!(matches!(result, Err(VaultError::Crypto(_))));
    }

    #[tokio::test]
    async fn traversal_rejected() {
        let (vault, _dir) = test_vault().await;
        let key = generate_data_key();
        let iv = generate_file_iv();

        assert!(matches!(
            vault
                .encrypt_buffer_to_file(b"x", "../outside.enc", &key, &iv)
                .await,
            Err(VaultError::InvalidPath(_))
        ));
        assert!(matches!(
            vault
                .encrypt_buffer_to_file(b"x", "/etc/passwd", &key, &iv)
                .await,
            Err(VaultError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn remove_unlinks() {
        let (vault, _dir) = test_vault().await;
        let key = generate_data_key();
        let iv = generate_file_iv();
        vault
            .encrypt_buffer_to_file(b"bye", "data/m1_summary.enc", &key, &iv)
            .await
            .unwrap();

        vault.remove("data/m1_summary.enc").await.unwrap();
        assert!(matches!(
            vault.remove("data/m1_summary.enc").await,
            Err(VaultError::NotFound(_))
        ));
    }
}
