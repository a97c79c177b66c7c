//! Credential file cipher.
//!
//! AES-128 in ECB mode with PKCS7 padding. The key is the UTF-8 passphrase
//! right-padded with zero bytes (or truncated) to 16 bytes.
//!
//! The cipher never guesses whether a file is encrypted. Callers attempt a
//! decrypt and treat `CipherError::InvalidCiphertext` as "not ciphertext for
//! this key".

use aes::Aes128;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use std::fs;
use std::path::Path;

use crate::error::CipherError;
use crate::fs_utils::write_atomic;

type EcbEncryptor = ecb::Encryptor<Aes128>;
type EcbDecryptor = ecb::Decryptor<Aes128>;

pub const KEY_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// Whether a file operation writes its result back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persist {
    /// Replace the file contents with the result
    Write,
    /// Leave the file untouched and only return the result
    DryRun,
}

#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn new(passphrase: &str) -> Self {
        Self::from_key_bytes(passphrase.as_bytes())
    }

    /// Build from raw key material, zero-padded or truncated to 16 bytes
    pub fn from_key_bytes(bytes: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        let len = bytes.len().min(KEY_LEN);
        key[..len].copy_from_slice(&bytes[..len]);
        Self { key }
    }

    pub fn encrypt_bytes(&self, data: &[u8]) -> Vec<u8> {
        EcbEncryptor::new(&self.key.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    pub fn decrypt_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.is_empty() || data.len() % BLOCK_LEN != 0 {
            return Err(CipherError::InvalidCiphertext);
        }
        EcbDecryptor::new(&self.key.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| CipherError::InvalidCiphertext)
    }

    /// Encrypt a file, returning the ciphertext
    pub fn encrypt(&self, path: &Path, persist: Persist) -> Result<Vec<u8>, CipherError> {
        let data = read_file(path)?;
        let out = self.encrypt_bytes(&data);
        write_back(path, &out, persist)?;
        Ok(out)
    }

    /// Decrypt a file, returning the plaintext
    ///
    /// The file is left untouched when decryption fails.
    pub fn decrypt(&self, path: &Path, persist: Persist) -> Result<Vec<u8>, CipherError> {
        let data = read_file(path)?;
        let out = self.decrypt_bytes(&data)?;
        write_back(path, &out, persist)?;
        Ok(out)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, CipherError> {
    if !path.is_file() {
        return Err(CipherError::NotAFile(path.to_path_buf()));
    }
    fs::read(path).map_err(|source| CipherError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_back(path: &Path, data: &[u8], persist: Persist) -> Result<(), CipherError> {
    if persist == Persist::DryRun {
        return Ok(());
    }
    let temp_path = path.with_extension("enc.tmp");
    write_atomic(path, &temp_path, data).map_err(|source| CipherError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_is_padded_and_truncated() {
        assert_eq!(Cipher::new("abc").key, *b"abc\0\0\0\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(
            Cipher::new("0123456789abcdefXYZ").key,
            *b"0123456789abcdef"
        );
    }

    #[test]
    fn test_round_trip_various_lengths() {
        let cipher = Cipher::new("passphrase");
        for len in [0usize, 1, 15, 16, 17, 255, 4096] {
            let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            let encrypted = cipher.encrypt_bytes(&data);
            assert_eq!(encrypted.len() % BLOCK_LEN, 0);
            assert!(encrypted.len() > data.len());
            assert_eq!(cipher.decrypt_bytes(&encrypted).unwrap(), data);
        }
    }

    #[test]
    fn test_rejects_unaligned_data() {
        let cipher = Cipher::new("passphrase");
        let plaintext = br#"{"account": "work", "session": 42}"#;
        assert_ne!(plaintext.len() % BLOCK_LEN, 0);
        assert!(matches!(
            cipher.decrypt_bytes(plaintext),
            Err(CipherError::InvalidCiphertext)
        ));
        assert!(matches!(
            cipher.decrypt_bytes(&[]),
            Err(CipherError::InvalidCiphertext)
        ));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let plaintext = b"credential blob for the work account".to_vec();
        let encrypted = Cipher::new("right").encrypt_bytes(&plaintext);
        // The last block under "wrong" ends in 0x57, which is not a valid pad
        assert!(matches!(
            Cipher::new("wrong").decrypt_bytes(&encrypted),
            Err(CipherError::InvalidCiphertext)
        ));
    }

    #[test]
    fn test_file_round_trip_in_place() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("key_datas");
        let original = vec![0u8, 1, 2, 3, 250, 251, 252, 253, 254, 255];
        fs::write(&path, &original).unwrap();

        let cipher = Cipher::new("pw");
        cipher.encrypt(&path, Persist::Write).unwrap();
        assert_ne!(fs::read(&path).unwrap(), original);

        cipher.decrypt(&path, Persist::Write).unwrap();
        assert_eq!(fs::read(&path).unwrap(), original);
        assert!(!path.with_extension("enc.tmp").exists());
    }

    #[test]
    fn test_dry_run_leaves_file_alone() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("key_datas");
        fs::write(&path, b"plain").unwrap();

        let encrypted = Cipher::new("pw").encrypt(&path, Persist::DryRun).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"plain");
        assert_eq!(encrypted.len(), BLOCK_LEN);
    }

    #[test]
    fn test_failed_decrypt_leaves_file_alone() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("key_datas");
        fs::write(&path, b"definitely not ciphertext").unwrap();

        let result = Cipher::new("pw").decrypt(&path, Persist::Write);
        assert!(matches!(result, Err(CipherError::InvalidCiphertext)));
        assert_eq!(fs::read(&path).unwrap(), b"definitely not ciphertext");
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = Cipher::new("pw").decrypt(&temp_dir.path().join("nope"), Persist::Write);
        assert!(matches!(result, Err(CipherError::NotAFile(_))));
    }
}
