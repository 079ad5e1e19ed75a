//! Encrypted key file.
//!
//! The signing key rests on disk as AES-256-GCM ciphertext under a key
//! derived from an operator passphrase with scrypt. Decryption happens only
//! inside the signer process, and the plaintext lives in a zeroizing buffer
//! for its whole lifetime.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroizing;

use crate::error::{WardexError, WardexResult};

/// Size of the signing key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the AES-GCM nonce in bytes.
const IV_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
const TAG_SIZE: usize = 16;
/// Size of the KDF salt in bytes.
const SALT_SIZE: usize = 16;

/// scrypt cost parameters (N = 2^15, r = 8, p = 1).
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// On-disk encrypted key format, version 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyFile {
    pub version: u8,
    pub algorithm: String,
    /// Hex-encoded 12-byte nonce.
    pub iv: String,
    /// Hex-encoded 16-byte GCM tag.
    pub auth_tag: String,
    /// Hex-encoded ciphertext (tag stripped).
    pub encrypted_key: String,
    /// Hex-encoded 16-byte scrypt salt.
    pub salt: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> WardexResult<Zeroizing<[u8; KEY_SIZE]>> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_SIZE)
        .map_err(|e| WardexError::Crypto(format!("invalid scrypt parameters: {e}")))?;
    let mut derived = Zeroizing::new([0u8; KEY_SIZE]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut *derived)
        .map_err(|e| WardexError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(derived)
}

/// Encrypt a signing key under a passphrase.
pub fn encrypt_key(private_key: &[u8; KEY_SIZE], passphrase: &str) -> WardexResult<EncryptedKeyFile> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let derived = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new((&*derived).into());
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), private_key.as_slice())
        .map_err(|e| WardexError::Crypto(format!("encryption failed: {e}")))?;

    // AES-GCM appends the tag; the file format stores it separately.
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

    Ok(EncryptedKeyFile {
        version: 1,
        algorithm: "aes-256-gcm".to_string(),
        iv: hex::encode(iv),
        auth_tag: hex::encode(tag),
        encrypted_key: hex::encode(ciphertext),
        salt: hex::encode(salt),
    })
}

/// Decrypt a key file. The result zeroizes itself on drop.
pub fn decrypt_key(
    file: &EncryptedKeyFile,
    passphrase: &str,
) -> WardexResult<Zeroizing<[u8; KEY_SIZE]>> {
    if file.version != 1 {
        return Err(WardexError::Crypto(format!(
            "unsupported key file version {}",
            file.version
        )));
    }
    if file.algorithm != "aes-256-gcm" {
        return Err(WardexError::Crypto(format!(
            "unsupported algorithm {:?}",
            file.algorithm
        )));
    }

    let iv = decode_fixed::<IV_SIZE>(&file.iv, "iv")?;
    let tag = decode_fixed::<TAG_SIZE>(&file.auth_tag, "authTag")?;
    let salt = decode_fixed::<SALT_SIZE>(&file.salt, "salt")?;
    let ciphertext = hex::decode(&file.encrypted_key)
        .map_err(|e| WardexError::Crypto(format!("bad encryptedKey hex: {e}")))?;

    let derived = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new((&*derived).into());

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| WardexError::Crypto("decryption failed; wrong passphrase?".to_string()))?,
    );

    if plaintext.len() != KEY_SIZE {
        return Err(WardexError::Crypto(format!(
            "decrypted key has wrong length {}",
            plaintext.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}

fn decode_fixed<const N: usize>(hex_str: &str, field: &str) -> WardexResult<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(hex_str, &mut out)
        .map_err(|e| WardexError::Crypto(format!("bad {field} hex: {e}")))?;
    Ok(out)
}

/// Load and validate a key file from disk.
pub fn load(path: &Path) -> WardexResult<EncryptedKeyFile> {
    let raw = std::fs::read_to_string(path)?;
    let file: EncryptedKeyFile = serde_json::from_str(&raw)?;
    if file.version != 1 {
        return Err(WardexError::Crypto(format!(
            "unsupported key file version {}",
            file.version
        )));
    }
    Ok(file)
}

/// Write a key file to disk.
pub fn save(path: &Path, file: &EncryptedKeyFile) -> WardexResult<()> {
    let json = serde_json::to_string_pretty(file)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = sample_key();
        let file = encrypt_key(&key, "correct horse battery").unwrap();
        assert_eq!(file.version, 1);
        assert_eq!(file.algorithm, "aes-256-gcm");

        let recovered = decrypt_key(&file, "correct horse battery").unwrap();
        assert_eq!(&*recovered, &key);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let file = encrypt_key(&sample_key(), "right").unwrap();
        assert!(decrypt_key(&file, "wrong").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut file = encrypt_key(&sample_key(), "pass").unwrap();
        let mut bytes = hex::decode(&file.encrypted_key).unwrap();
        bytes[0] ^= 0xff;
        file.encrypted_key = hex::encode(bytes);
        assert!(decrypt_key(&file, "pass").is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut file = encrypt_key(&sample_key(), "pass").unwrap();
        file.version = 2;
        assert!(decrypt_key(&file, "pass").is_err());
    }

    #[test]
    fn test_wire_field_names() {
        let file = encrypt_key(&sample_key(), "pass").unwrap();
        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains("\"authTag\""));
        assert!(json.contains("\"encryptedKey\""));
        assert!(json.contains("\"iv\""));
        assert!(json.contains("\"salt\""));
        assert!(json.contains("\"algorithm\":\"aes-256-gcm\""));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        let file = encrypt_key(&sample_key(), "pass").unwrap();
        save(&path, &file).unwrap();

        let loaded = load(&path).unwrap();
        let recovered = decrypt_key(&loaded, "pass").unwrap();
        assert_eq!(&*recovered, &sample_key());
    }

    #[test]
    fn test_salts_and_nonces_are_fresh() {
        let a = encrypt_key(&sample_key(), "pass").unwrap();
        let b = encrypt_key(&sample_key(), "pass").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted_key, b.encrypted_key);
    }
}
