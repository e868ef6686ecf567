//! Secure artifact delivery.
//!
//! Decrypted vault bytes are re-encrypted for the requesting client on the
//! fly: vault decrypt stream -> session AES-CBC -> response body, with the
//! RSA-wrapped session key in the `X-Encrypted-Key` header. Plaintext is
//! never buffered when a streaming path exists, and all headers are set
//! before the first body byte. A client that disconnects drops the body
//! stream, which tears down the whole decrypt pipeline on the next send.

use axum::body::Body;
use axum::http::{header, HeaderMap, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use greffier_shared::crypto::StreamEncryptor;
use greffier_shared::envelope::build_session_envelope;
use greffier_store::Meeting;
use greffier_vault::VaultError;

use crate::api::AppState;
use crate::error::ApiError;

pub const PUBLIC_KEY_HEADER: &str = "x-public-key";
pub const ENCRYPTED_KEY_HEADER: &str = "x-encrypted-key";

pub fn public_key_header(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(PUBLIC_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing X-Public-Key header".to_string()))
}

/// Stream one vault artifact to the client under a fresh session envelope.
pub async fn envelope_stream_response(
    state: &AppState,
    headers: &HeaderMap,
    meeting: &Meeting,
    kind_key: &str,
    content_type: &'static str,
) -> Result<Response<Body>, ApiError> {
    let pem = public_key_header(headers)?;
    let rel = meeting
        .file_paths
        .get(kind_key)
        .ok_or_else(|| ApiError::NotFound(format!("no {kind_key} artifact for this meeting")))?
        .clone();

    let (key, iv) = { state.db.lock().await.get_meeting_key(&meeting.id)? };
    let envelope = build_session_envelope(pem)?;

    let plaintext = state.vault.decrypt_stream(&rel, &key, &iv).await?;
    let body = Body::from_stream(encrypt_body(plaintext, envelope.cipher));

    Response::builder()
        .header(ENCRYPTED_KEY_HEADER, envelope.encrypted_key_b64)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Envelope a small, already-assembled payload (the combined-artifact
/// response, which has no single backing file to stream from).
pub fn envelope_buffer_response(
    headers: &HeaderMap,
    payload: &[u8],
    content_type: &'static str,
) -> Result<Response<Body>, ApiError> {
    let pem = public_key_header(headers)?;
    let envelope = build_session_envelope(pem)?;

    let mut cipher = envelope.cipher;
    let mut body = cipher.update(payload);
    body.extend_from_slice(&cipher.finalize());

    Response::builder()
        .header(ENCRYPTED_KEY_HEADER, envelope.encrypted_key_b64)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

fn encrypt_body(
    mut plaintext: ReceiverStream<Result<Bytes, VaultError>>,
    mut cipher: StreamEncryptor,
) -> ReceiverStream<Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);

    tokio::spawn(async move {
        while let Some(chunk) = plaintext.next().await {
            match chunk {
                Ok(bytes) => {
                    let ciphertext = cipher.update(&bytes);
                    if !ciphertext.is_empty()
                        && tx.send(Ok(Bytes::from(ciphertext))).await.is_err()
                    {
                        // Consumer disconnected; dropping `plaintext` stops
                        // the vault reader as well.
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    return;
                }
            }
        }
        let _ = tx.send(Ok(Bytes::from(cipher.finalize()))).await;
    });

    ReceiverStream::new(rx)
}
