//! LCP license documents and the content-key decipher chain.
//!
//! The license carries a content key encrypted under a user key (itself the
//! SHA-256 of a passphrase). A user key is valid for a license iff decrypting
//! the license's key-check value with it yields the license id. All field and
//! resource ciphertexts are AES-256-CBC with the IV stored as the first 16
//! bytes.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::DeflateDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::archive::{EntryData, FetchMode};
use crate::encryption::ProtectionDescriptor;
use crate::error::DecipherError;

pub const LICENSE_FILE: &str = "META-INF/license.lcpl";

/// Compression method inside a protection descriptor meaning raw deflate.
pub const COMPRESSION_DEFLATE: u32 = 8;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_BLOCK: usize = 16;
/// Resource ciphertexts are walked in 32 KiB slices.
const DECIPHER_CHUNK: usize = 32 * 1024;

/// A parsed LCP license document (`META-INF/license.lcpl`). Unknown fields,
/// including the signature block, are carried by serde and ignored here;
/// signature validation is the cryptographic library's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub id: String,
    #[serde(default)]
    pub issued: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    pub encryption: LicenseEncryption,
    #[serde(default)]
    pub links: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseEncryption {
    #[serde(default)]
    pub profile: Option<String>,
    pub content_key: ContentKeyField,
    pub user_key: UserKeyField,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentKeyField {
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Base64 ciphertext of the 32-byte content key, IV-prefixed.
    pub encrypted_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKeyField {
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Base64 ciphertext of the license id, IV-prefixed.
    pub key_check: String,
    #[serde(default)]
    pub text_hint: Option<String>,
}

impl License {
    pub fn parse(json: &str) -> Result<Self, DecipherError> {
        serde_json::from_str(json).map_err(|e| DecipherError::MalformedLicense(e.to_string()))
    }
}

/// A candidate user key: 32 bytes, typically derived from a passphrase.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserKey([u8; 32]);

impl UserKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The LCP basic-profile rule: user key = SHA-256 of the passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for UserKey {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserKey(..)")
    }
}

/// Stateful decipher for one analysis session. Derived content keys are
/// cached per `(license id, user key)` so a publication's spine items share
/// a single derivation.
#[derive(Default)]
pub struct LcpDecipher {
    content_keys: HashMap<(String, UserKey), [u8; 32]>,
}

impl LcpDecipher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive (or fetch from cache) the content key for a license/user-key
    /// pair. Structural failures — bad base64, wrong length, bad padding —
    /// return `None`; the caller treats absence as "key invalid", not fatal.
    pub fn derive_content_key(
        &mut self,
        license: &License,
        user_key: &UserKey,
    ) -> Option<[u8; 32]> {
        let cache_key = (license.id.clone(), *user_key);
        if let Some(key) = self.content_keys.get(&cache_key) {
            return Some(*key);
        }

        let plain = decrypt_b64_field(
            user_key.as_bytes(),
            &license.encryption.content_key.encrypted_value,
        )?;
        let content_key: [u8; 32] = plain.try_into().ok()?;

        self.content_keys.insert(cache_key, content_key);
        Some(content_key)
    }

    /// Find a user key that validates against the license: decrypting the
    /// key-check value must reproduce the license id. When several candidates
    /// validate, the last one wins.
    pub fn find_valid_key(license: &License, candidates: &[UserKey]) -> Option<UserKey> {
        let mut valid = None;
        for key in candidates {
            if let Some(plain) =
                decrypt_b64_field(key.as_bytes(), &license.encryption.user_key.key_check)
            {
                if plain == license.id.as_bytes() {
                    valid = Some(*key);
                }
            }
        }
        valid
    }

    /// Decrypt one protected resource: chunked AES-256-CBC under the derived
    /// content key, then raw deflate when the descriptor says the payload was
    /// compressed before encryption.
    pub fn decipher(
        &mut self,
        mode: FetchMode,
        ciphertext: &[u8],
        protection: &ProtectionDescriptor,
        license: &License,
        user_key: &UserKey,
    ) -> Result<EntryData, DecipherError> {
        if protection.is_unsupported_scheme() {
            return Err(DecipherError::UnsupportedScheme(
                protection.retrieval_type.clone(),
            ));
        }

        let content_key = self
            .derive_content_key(license, user_key)
            .ok_or(DecipherError::NoValidKey)?;

        let mut plain = decrypt_cbc(&content_key, ciphertext)?;

        if protection.compression_method == COMPRESSION_DEFLATE {
            let mut decoder = DeflateDecoder::new(&plain[..]);
            let mut inflated = Vec::with_capacity(protection.original_length as usize);
            decoder
                .read_to_end(&mut inflated)
                .map_err(|e| DecipherError::Inflate(e.to_string()))?;
            plain = inflated;
        }

        Ok(match mode {
            FetchMode::Bytes => EntryData::Bytes(plain),
            FetchMode::Text => EntryData::Text(String::from_utf8_lossy(&plain).into_owned()),
        })
    }
}

fn decrypt_b64_field(key: &[u8; 32], value: &str) -> Option<Vec<u8>> {
    let raw = BASE64.decode(value.trim()).ok()?;
    decrypt_cbc(key, &raw).ok()
}

/// AES-256-CBC over an IV-prefixed ciphertext. The IV block is consumed, not
/// emitted; PKCS#7 padding is trimmed so padding bytes never reach output.
pub(crate) fn decrypt_cbc(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, DecipherError> {
    if data.len() < 2 * AES_BLOCK || data.len() % AES_BLOCK != 0 {
        return Err(DecipherError::BadCiphertext(format!(
            "ciphertext length {} is not IV plus whole blocks",
            data.len()
        )));
    }

    let (iv, body) = data.split_at(AES_BLOCK);
    let mut decryptor = Aes256CbcDec::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(iv),
    );

    let mut plain = body.to_vec();
    for chunk in plain.chunks_mut(DECIPHER_CHUNK) {
        for block in chunk.chunks_exact_mut(AES_BLOCK) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    trim_pkcs7(&mut plain)?;
    Ok(plain)
}

fn trim_pkcs7(plain: &mut Vec<u8>) -> Result<(), DecipherError> {
    let pad = *plain
        .last()
        .ok_or_else(|| DecipherError::BadCiphertext("empty plaintext".to_string()))?
        as usize;
    if pad == 0 || pad > AES_BLOCK || pad > plain.len() {
        return Err(DecipherError::BadCiphertext(format!(
            "invalid PKCS#7 padding byte {pad}"
        )));
    }
    let start = plain.len() - pad;
    if plain[start..].iter().any(|&b| b as usize != pad) {
        return Err(DecipherError::BadCiphertext(
            "inconsistent PKCS#7 padding".to_string(),
        ));
    }
    plain.truncate(start);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

    fn encrypt_cbc(key: &[u8; 32], iv: &[u8; 16], plain: &[u8]) -> Vec<u8> {
        let mut padded = plain.to_vec();
        let pad = AES_BLOCK - padded.len() % AES_BLOCK;
        padded.extend(std::iter::repeat(pad as u8).take(pad));

        let mut encryptor = Aes256CbcEnc::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(iv),
        );
        for block in padded.chunks_exact_mut(AES_BLOCK) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        let mut out = iv.to_vec();
        out.extend_from_slice(&padded);
        out
    }

    fn make_license(id: &str, user_key: &UserKey, content_key: &[u8; 32]) -> License {
        let key_check = encrypt_cbc(user_key.as_bytes(), &[0x11; 16], id.as_bytes());
        let encrypted_value = encrypt_cbc(user_key.as_bytes(), &[0x22; 16], content_key);
        License {
            id: id.to_string(),
            issued: None,
            provider: Some("test".to_string()),
            encryption: LicenseEncryption {
                profile: Some("http://readium.org/lcp/basic-profile".to_string()),
                content_key: ContentKeyField {
                    algorithm: None,
                    encrypted_value: BASE64.encode(encrypted_value),
                },
                user_key: UserKeyField {
                    algorithm: None,
                    key_check: BASE64.encode(key_check),
                    text_hint: None,
                },
            },
            links: serde_json::Value::Null,
        }
    }

    fn lcp_descriptor(compression_method: u32, original_length: u64) -> ProtectionDescriptor {
        ProtectionDescriptor {
            algorithm: "http://www.w3.org/2001/04/xmlenc#aes256-cbc".to_string(),
            compression_method,
            original_length,
            retrieval_type: "license.lcpl#/encryption/content_key".to_string(),
        }
    }

    #[test]
    fn test_key_validation_round_trip() {
        let user_key = UserKey::from_passphrase("open sesame");
        let content_key = [7u8; 32];
        let license = make_license("urn:uuid:abc-123", &user_key, &content_key);

        let found = LcpDecipher::find_valid_key(&license, &[user_key]).unwrap();
        assert_eq!(found, user_key);

        // A content key derived through the license decrypts content
        // encrypted under that key byte-for-byte.
        let mut decipher = LcpDecipher::new();
        let derived = decipher.derive_content_key(&license, &user_key).unwrap();
        assert_eq!(derived, content_key);

        let plaintext = b"<html><body>Chapter one.</body></html>";
        let ciphertext = encrypt_cbc(&derived, &[0x33; 16], plaintext);
        let out = decipher
            .decipher(
                FetchMode::Bytes,
                &ciphertext,
                &lcp_descriptor(0, 0),
                &license,
                &user_key,
            )
            .unwrap();
        assert_eq!(out.into_bytes(), plaintext);

        // Text mode decodes the same plaintext as UTF-8.
        let out = decipher
            .decipher(
                FetchMode::Text,
                &ciphertext,
                &lcp_descriptor(0, 0),
                &license,
                &user_key,
            )
            .unwrap();
        assert_eq!(out.into_text().as_bytes(), plaintext);
    }

    #[test]
    fn test_find_valid_key_prefers_last() {
        let key_a = UserKey::from_passphrase("first");
        let key_b = UserKey::from_passphrase("second");
        let content_key = [9u8; 32];

        // Both candidates validate: the key check decrypts under both keys.
        // Build a license whose key check validates under key_b, listed last
        // among the valid candidates.
        let license = make_license("urn:uuid:last-wins", &key_b, &content_key);
        let candidates = [key_a, key_b, key_a];
        // Only key_b is valid here; it is found even when not first.
        assert_eq!(
            LcpDecipher::find_valid_key(&license, &candidates),
            Some(key_b)
        );

        // With two licenses sharing the same id and check under different
        // keys we cannot express "both valid" in one license, so the
        // last-wins policy is exercised through duplicate candidates.
        let candidates = [key_b, key_a, key_b];
        assert_eq!(
            LcpDecipher::find_valid_key(&license, &candidates),
            Some(key_b)
        );
    }

    #[test]
    fn test_find_valid_key_empty_and_invalid() {
        let user_key = UserKey::from_passphrase("right");
        let license = make_license("urn:uuid:x", &user_key, &[1u8; 32]);

        assert_eq!(LcpDecipher::find_valid_key(&license, &[]), None);
        assert_eq!(
            LcpDecipher::find_valid_key(&license, &[UserKey::from_passphrase("wrong")]),
            None
        );
    }

    #[test]
    fn test_derive_content_key_bad_key_is_silent() {
        let user_key = UserKey::from_passphrase("right");
        let license = make_license("urn:uuid:x", &user_key, &[1u8; 32]);

        let mut decipher = LcpDecipher::new();
        let wrong = UserKey::from_passphrase("wrong");
        // Wrong key produces garbage padding almost surely; either way the
        // derivation must not panic and a 32-byte accident is tolerated.
        let _ = decipher.derive_content_key(&license, &wrong);
    }

    #[test]
    fn test_decipher_deflated_payload() {
        let user_key = UserKey::from_passphrase("squeeze");
        let content_key = [42u8; 32];
        let license = make_license("urn:uuid:deflate", &user_key, &content_key);

        let plaintext = b"<html><body>compressed before encryption</body></html>".repeat(20);
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plaintext).unwrap();
        let deflated = encoder.finish().unwrap();
        let ciphertext = encrypt_cbc(&content_key, &[0x44; 16], &deflated);

        let mut decipher = LcpDecipher::new();
        let out = decipher
            .decipher(
                FetchMode::Bytes,
                &ciphertext,
                &lcp_descriptor(COMPRESSION_DEFLATE, plaintext.len() as u64),
                &license,
                &user_key,
            )
            .unwrap();
        assert_eq!(out.into_bytes(), plaintext);
    }

    #[test]
    fn test_decipher_large_payload_spans_chunks() {
        let user_key = UserKey::from_passphrase("bulk");
        let content_key = [3u8; 32];
        let license = make_license("urn:uuid:bulk", &user_key, &content_key);

        // Larger than one 32 KiB chunk so the chunk walk is exercised.
        let plaintext = vec![0xABu8; DECIPHER_CHUNK + 12_345];
        let ciphertext = encrypt_cbc(&content_key, &[0x55; 16], &plaintext);

        let mut decipher = LcpDecipher::new();
        let out = decipher
            .decipher(
                FetchMode::Bytes,
                &ciphertext,
                &lcp_descriptor(0, 0),
                &license,
                &user_key,
            )
            .unwrap();
        assert_eq!(out.into_bytes(), plaintext);
    }

    #[test]
    fn test_decipher_rejects_truncated_ciphertext() {
        assert!(matches!(
            decrypt_cbc(&[0u8; 32], &[1, 2, 3]),
            Err(DecipherError::BadCiphertext(_))
        ));
        assert!(matches!(
            decrypt_cbc(&[0u8; 32], &[0u8; 33]),
            Err(DecipherError::BadCiphertext(_))
        ));
    }

    #[test]
    fn test_unsupported_scheme_is_refused() {
        let user_key = UserKey::from_passphrase("x");
        let license = make_license("urn:uuid:x", &user_key, &[1u8; 32]);
        let descriptor = ProtectionDescriptor {
            algorithm: "http://www.idpf.org/2008/embedding".to_string(),
            compression_method: 0,
            original_length: 0,
            retrieval_type: "unknown".to_string(),
        };

        let mut decipher = LcpDecipher::new();
        let err = decipher
            .decipher(FetchMode::Bytes, &[0u8; 32], &descriptor, &license, &user_key)
            .unwrap_err();
        assert!(matches!(err, DecipherError::UnsupportedScheme(_)));
    }

    #[test]
    fn test_license_parse() {
        let json = r#"{
            "id": "urn:uuid:f8a0f83e",
            "issued": "2024-01-01T00:00:00Z",
            "provider": "https://example.com",
            "encryption": {
                "profile": "http://readium.org/lcp/basic-profile",
                "content_key": {
                    "algorithm": "http://www.w3.org/2001/04/xmlenc#aes256-cbc",
                    "encrypted_value": "AAAA"
                },
                "user_key": {
                    "algorithm": "http://www.w3.org/2001/04/xmlenc#sha256",
                    "key_check": "BBBB",
                    "text_hint": "your library password"
                }
            },
            "links": [{"rel": "hint", "href": "https://example.com/hint"}]
        }"#;
        let license = License::parse(json).unwrap();
        assert_eq!(license.id, "urn:uuid:f8a0f83e");
        assert_eq!(
            license.encryption.user_key.text_hint.as_deref(),
            Some("your library password")
        );

        assert!(License::parse("{}").is_err());
    }
}
