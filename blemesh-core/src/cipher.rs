//! Payload cipher: AES-128-ECB with PKCS#7 padding over the UTF-8 message body.
//!
//! ECB leaks repeated plaintext blocks and the key is a shared constant. It is kept for
//! wire compatibility with existing peers; it is not a security boundary.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyInit};

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

pub const KEY_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;

/// Process-wide shared key.
pub const DEFAULT_KEY: [u8; KEY_LEN] = *b"1234567890123456";

/// Encrypt a text payload. Output length is the next multiple of 16 above the UTF-8 length.
pub fn encrypt_payload(plaintext: &str, key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes128EcbEnc::new_from_slice(key).map_err(|_| CipherError::Key)?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes()))
}

/// Decrypt a payload back to text.
pub fn decrypt_payload(ciphertext: &[u8], key: &[u8; KEY_LEN]) -> Result<String, CipherError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CipherError::BlockLength(ciphertext.len()));
    }
    let cipher = Aes128EcbDec::new_from_slice(key).map_err(|_| CipherError::Key)?;
    let plain = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::Padding)?;
    String::from_utf8(plain).map_err(|_| CipherError::Utf8)
}

/// Decode failures. On the network receive path any of these means "not our traffic".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key")]
    Key,
    #[error("ciphertext length {0} is not a positive multiple of {BLOCK_LEN}")]
    BlockLength(usize),
    #[error("invalid padding")]
    Padding,
    #[error("decrypted payload is not valid UTF-8")]
    Utf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_various_lengths() {
        for text in ["", "a", "AAAA|hello", "exactly sixteen!", "héllo wörld ✓ 日本語"] {
            let ct = encrypt_payload(text, &DEFAULT_KEY).unwrap();
            assert_eq!(ct.len() % BLOCK_LEN, 0);
            assert!(ct.len() > text.len());
            assert_eq!(decrypt_payload(&ct, &DEFAULT_KEY).unwrap(), text);
        }
        let long = "x".repeat(10_000);
        let ct = encrypt_payload(&long, &DEFAULT_KEY).unwrap();
        assert_eq!(decrypt_payload(&ct, &DEFAULT_KEY).unwrap(), long);
    }

    #[test]
    fn full_block_gets_padding_block() {
        let ct = encrypt_payload("exactly sixteen!", &DEFAULT_KEY).unwrap();
        assert_eq!(ct.len(), 32);
    }

    #[test]
    fn deterministic_ecb() {
        let a = encrypt_payload("same", &DEFAULT_KEY).unwrap();
        let b = encrypt_payload("same", &DEFAULT_KEY).unwrap();
        assert_eq!(a, b);
        // Identical plaintext blocks produce identical ciphertext blocks.
        let twice = encrypt_payload(&"0123456789abcdef".repeat(2), &DEFAULT_KEY).unwrap();
        assert_eq!(twice[0..16], twice[16..32]);
    }

    #[test]
    fn rejects_non_block_length() {
        assert_eq!(
            decrypt_payload(&[0u8; 15], &DEFAULT_KEY),
            Err(CipherError::BlockLength(15))
        );
        assert_eq!(
            decrypt_payload(&[], &DEFAULT_KEY),
            Err(CipherError::BlockLength(0))
        );
    }

    #[test]
    fn wrong_key_fails_or_garbles() {
        let ct = encrypt_payload("secret text", &DEFAULT_KEY).unwrap();
        let other = *b"6543210987654321";
        if let Ok(text) = decrypt_payload(&ct, &other) {
            assert_ne!(text, "secret text");
        }
    }

    #[test]
    fn invalid_padding_rejected() {
        let ct = encrypt_payload("abc", &DEFAULT_KEY).unwrap();
        // A single block whose plaintext ends in 0x00 is never valid PKCS#7.
        use aes::cipher::BlockEncrypt;
        let aes = aes::Aes128::new_from_slice(&DEFAULT_KEY).unwrap();
        let mut block = aes::Block::default();
        aes.encrypt_block(&mut block);
        let raw = block.to_vec();
        assert_eq!(decrypt_payload(&raw, &DEFAULT_KEY), Err(CipherError::Padding));
        assert!(decrypt_payload(&ct, &DEFAULT_KEY).is_ok());
    }
}
