use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{ErrorKind, Result, VaultError};
use crate::{COPY_BUFFER_SIZE, IV_SIZE, KEY_SIZE};

/// AES-256 in CTR mode; the full 16-byte IV is the initial counter block.
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Generate a fresh random 32-byte encryption key.
pub fn new_encryption_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Parse a hex-encoded 32-byte key, as supplied via the `encryption_key`
/// config option. Every node in a cluster must share the same key for
/// replicated blobs to be readable across nodes.
pub fn parse_encryption_key(hex_key: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| VaultError::wrap(e, ErrorKind::Config, "encryption key is not valid hex"))?;
    if bytes.len() != KEY_SIZE {
        return Err(VaultError::config(format!(
            "encryption key must be {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Derive a node id: the SHA-1 hex digest of a random 32-byte seed.
pub fn generate_node_id() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    hex::encode(Sha1::digest(seed))
}

/// The wire-visible form of a key: lowercase SHA-1 hex of the raw key string.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha1::digest(key.as_bytes()))
}

/// Encrypt `src` into `dst`: a random 16-byte IV followed by the CTR-mode
/// ciphertext of the plaintext. Returns the total bytes written to `dst`,
/// i.e. `IV_SIZE + plaintext_len`.
///
/// Streams through a bounded buffer; the payload is never held in memory
/// whole.
pub async fn copy_encrypt<R, W>(key: &[u8; KEY_SIZE], src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    dst.write_all(&iv)
        .await
        .map_err(|e| VaultError::wrap(e, ErrorKind::Encryption, "failed to write IV"))?;

    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written: u64 = IV_SIZE as u64;

    loop {
        let n = src
            .read(&mut buf)
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Encryption, "failed to read plaintext"))?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Encryption, "failed to write ciphertext"))?;
        written += n as u64;
    }

    dst.flush()
        .await
        .map_err(|e| VaultError::wrap(e, ErrorKind::Encryption, "failed to flush ciphertext"))?;
    Ok(written)
}

/// Decrypt `src` into `dst`: read the 16-byte IV off the head of the stream,
/// then CTR-decrypt the remainder. Returns the total bytes read from `src`,
/// including the IV.
pub async fn copy_decrypt<R, W>(key: &[u8; KEY_SIZE], src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            VaultError::corruption("encrypted stream shorter than IV")
        } else {
            VaultError::wrap(e, ErrorKind::Encryption, "failed to read IV")
        }
    })?;

    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut read: u64 = IV_SIZE as u64;

    loop {
        let n = src
            .read(&mut buf)
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Encryption, "failed to read ciphertext"))?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Encryption, "failed to write plaintext"))?;
        read += n as u64;
    }

    dst.flush()
        .await
        .map_err(|e| VaultError::wrap(e, ErrorKind::Encryption, "failed to flush plaintext"))?;
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let key = new_encryption_key();
        let plaintext = b"Hello, distributed file system!";

        let mut ciphertext = Vec::new();
        let n = copy_encrypt(&key, &mut &plaintext[..], &mut ciphertext)
            .await
            .unwrap();
        assert_eq!(n, (plaintext.len() + IV_SIZE) as u64);
        assert_eq!(ciphertext.len(), plaintext.len() + IV_SIZE);
        assert_ne!(&ciphertext[IV_SIZE..], &plaintext[..]);

        let mut decrypted = Vec::new();
        let n = copy_decrypt(&key, &mut &ciphertext[..], &mut decrypted)
            .await
            .unwrap();
        assert_eq!(n, ciphertext.len() as u64);
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn empty_payload_roundtrip() {
        let key = new_encryption_key();

        let mut ciphertext = Vec::new();
        let n = copy_encrypt(&key, &mut &b""[..], &mut ciphertext).await.unwrap();
        assert_eq!(n, IV_SIZE as u64);

        let mut decrypted = Vec::new();
        copy_decrypt(&key, &mut &ciphertext[..], &mut decrypted)
            .await
            .unwrap();
        assert!(decrypted.is_empty());
    }

    #[tokio::test]
    async fn payload_larger_than_copy_buffer() {
        let key = new_encryption_key();
        let plaintext = vec![0x5au8; COPY_BUFFER_SIZE * 3 + 17];

        let mut ciphertext = Vec::new();
        copy_encrypt(&key, &mut &plaintext[..], &mut ciphertext)
            .await
            .unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + IV_SIZE);

        let mut decrypted = Vec::new();
        copy_decrypt(&key, &mut &ciphertext[..], &mut decrypted)
            .await
            .unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn same_plaintext_yields_distinct_ciphertexts() {
        let key = new_encryption_key();
        let plaintext = b"same bytes every time";

        let mut first = Vec::new();
        let mut second = Vec::new();
        copy_encrypt(&key, &mut &plaintext[..], &mut first).await.unwrap();
        copy_encrypt(&key, &mut &plaintext[..], &mut second).await.unwrap();

        // Random IVs: identical input must not produce identical output.
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn truncated_iv_is_corruption() {
        let key = new_encryption_key();
        let mut out = Vec::new();
        let err = copy_decrypt(&key, &mut &[0u8; 7][..], &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn hash_key_known_vector() {
        assert_eq!(hash_key("hello"), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }

    #[test]
    fn node_id_is_40_hex_chars() {
        let id = generate_node_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_node_id());
    }

    #[test]
    fn parse_encryption_key_roundtrip() {
        let key = new_encryption_key();
        let parsed = parse_encryption_key(&hex::encode(key)).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_encryption_key_rejects_bad_input() {
        assert_eq!(
            parse_encryption_key("not hex").unwrap_err().kind(),
            ErrorKind::Config
        );
        assert_eq!(
            parse_encryption_key("abcd").unwrap_err().kind(),
            ErrorKind::Config
        );
    }
}
