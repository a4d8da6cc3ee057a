//! Segment encryption of object payloads.
//!
//! An encrypted object is a sequence of frames:
//! `u32 BE ciphertext length || 12-byte nonce || AES-256-GCM ciphertext`.
//! Each frame holds at most [`SEGMENT_SIZE`] plaintext bytes and is
//! authenticated together with its segment index and a final flag. The
//! stream always ends with an empty frame carrying the final flag, so
//! frames cannot be reordered, dropped from the middle or cut off the end.

use super::ByteStream;
use crate::access::encryption::Key;
use crate::utils::errors::StorageError;
use aes_gcm::aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key as CipherKey, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const SEGMENT_SIZE: usize = 64 * 1024;
const NONCE_LEN: usize = 12;
const LEN_PREFIX: usize = 4;

/// Encrypt a plaintext stream with `key`.
pub fn encrypt_stream(inner: ByteStream, key: &Key) -> ByteStream {
    let cipher = Aes256Gcm::new(CipherKey::<Aes256Gcm>::from_slice(key));
    let segments = Arc::new(AtomicU64::new(0));

    let body_cipher = cipher.clone();
    let counter = Arc::clone(&segments);
    let body = inner.map(move |chunk: io::Result<Bytes>| -> io::Result<Bytes> {
        let chunk = chunk?;
        let mut out = BytesMut::new();
        for piece in chunk.chunks(SEGMENT_SIZE) {
            let index = counter.fetch_add(1, Ordering::Relaxed);
            seal_segment(&body_cipher, index, false, piece, &mut out)?;
        }
        Ok(out.freeze())
    });

    // Sealed only once the inner stream is exhausted.
    let terminator = futures_util::stream::once(async move {
        let mut out = BytesMut::new();
        seal_segment(&cipher, segments.load(Ordering::Relaxed), true, &[], &mut out)?;
        Ok::<_, io::Error>(out.freeze())
    });

    Box::pin(body.chain(terminator))
}

fn segment_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = last as u8;
    aad
}

fn seal_segment(
    cipher: &Aes256Gcm,
    index: u64,
    last: bool,
    plaintext: &[u8],
    out: &mut BytesMut,
) -> io::Result<()> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let aad = segment_aad(index, last);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| io::Error::other("segment encryption failed"))?;

    out.reserve(LEN_PREFIX + NONCE_LEN + ciphertext.len());
    out.put_u32(ciphertext.len() as u32);
    out.put_slice(&nonce);
    out.put_slice(&ciphertext);
    Ok(())
}

/// Decrypt a complete object produced by [`encrypt_stream`].
///
/// The last frame read must carry the final flag; an object that stops
/// short of it is rejected.
pub fn decrypt_object(key: &Key, data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let cipher = Aes256Gcm::new(CipherKey::<Aes256Gcm>::from_slice(key));
    let mut plaintext = Vec::with_capacity(data.len());
    let mut rest = data;
    let mut index: u64 = 0;

    loop {
        if rest.len() < LEN_PREFIX + NONCE_LEN {
            return Err(StorageError::Backend(if rest.is_empty() {
                "object ends without a final segment".into()
            } else {
                "truncated segment header".into()
            }));
        }
        let (len_bytes, tail) = rest.split_at(LEN_PREFIX);
        let mut len = [0u8; LEN_PREFIX];
        len.copy_from_slice(len_bytes);
        let len = u32::from_be_bytes(len) as usize;

        let (nonce, tail) = tail.split_at(NONCE_LEN);
        if tail.len() < len {
            return Err(StorageError::Backend("truncated segment".into()));
        }
        let (ciphertext, tail) = tail.split_at(len);

        let last = tail.is_empty();
        let aad = segment_aad(index, last);
        let segment = cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
            .map_err(|_| StorageError::Backend(format!("segment {} failed authentication", index)))?;
        plaintext.extend_from_slice(&segment);

        if last {
            return Ok(plaintext);
        }
        rest = tail;
        index += 1;
    }
}

/// Collect an in-memory payload into a single stream item.
pub fn single_chunk(bytes: impl Into<Bytes>) -> ByteStream {
    let bytes: Bytes = bytes.into();
    Box::pin(futures_util::stream::once(futures_util::future::ready(
        Ok::<_, io::Error>(bytes),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    async fn collect(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_large_payload_spans_segments() {
        let key = [9u8; 32];
        let payload: Vec<u8> = (0..(SEGMENT_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();

        let sealed = collect(encrypt_stream(single_chunk(payload.clone()), &key)).await;
        // three data frames plus the empty final frame, each with its own header and tag
        assert_eq!(sealed.len(), payload.len() + 4 * (LEN_PREFIX + NONCE_LEN + 16));
        assert_eq!(decrypt_object(&key, &sealed).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_wrong_key_fails_authentication() {
        let sealed = collect(encrypt_stream(single_chunk(&b"test"[..]), &[1u8; 32])).await;
        assert!(matches!(
            decrypt_object(&[2u8; 32], &sealed),
            Err(StorageError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_object_is_rejected() {
        let sealed = collect(encrypt_stream(single_chunk(&b"test"[..]), &[1u8; 32])).await;
        assert!(decrypt_object(&[1u8; 32], &sealed[..sealed.len() - 1]).is_err());
    }

    #[tokio::test]
    async fn test_dropped_trailing_segments_are_rejected() {
        let key = [4u8; 32];
        let payload = vec![7u8; SEGMENT_SIZE * 2 + 17];
        let sealed = collect(encrypt_stream(single_chunk(payload), &key)).await;

        let frame = LEN_PREFIX + NONCE_LEN + SEGMENT_SIZE + 16;
        for kept in [frame, 2 * frame, sealed.len() - (LEN_PREFIX + NONCE_LEN + 16)] {
            assert!(matches!(
                decrypt_object(&key, &sealed[..kept]),
                Err(StorageError::Backend(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_data_after_final_segment_is_rejected() {
        let key = [4u8; 32];
        let mut sealed = collect(encrypt_stream(single_chunk(&b"first"[..]), &key)).await;
        let second = collect(encrypt_stream(single_chunk(&b"second"[..]), &key)).await;
        sealed.extend_from_slice(&second);
        assert!(decrypt_object(&key, &sealed).is_err());
    }

    #[tokio::test]
    async fn test_empty_payload_round_trips() {
        let key = [1u8; 32];
        let sealed = collect(encrypt_stream(single_chunk(Bytes::new()), &key)).await;
        assert_eq!(sealed.len(), LEN_PREFIX + NONCE_LEN + 16);
        assert!(decrypt_object(&key, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_zero_bytes_are_not_an_object() {
        assert!(matches!(
            decrypt_object(&[1u8; 32], &[]),
            Err(StorageError::Backend(_))
        ));
    }
}
