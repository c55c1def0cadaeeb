// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Encryption at rest for stored blocks.
//!
//! Blocks are encrypted with AES-256-GCM-SIV under a key and nonce both
//! derived from the block's data key via HKDF. With a fixed derived nonce
//! the construction is deterministic: the same plaintext always yields the
//! same ciphertext (convergent encryption), so deduplication by `data_id`
//! stays sound and a ciphertext holder without the data key learns nothing
//! usable about the plaintext.

use crate::error::{Error, Result};
use aes_gcm_siv::{
    aead::{Aead, KeyInit},
    Aes256GcmSiv, Nonce,
};
use bytes::Bytes;
use hkdf::Hkdf;
use sha2::Sha256;
use weft_protocol::DataKey;

/// Ciphertext grows by exactly the AEAD tag.
pub const CIPHER_OVERHEAD: usize = 16;

const HKDF_INFO: &[u8] = b"weft block cipher v1";

fn derive_cipher(data_key: &DataKey) -> Result<(Aes256GcmSiv, Nonce)> {
    let hk = Hkdf::<Sha256>::new(None, data_key.as_bytes());
    let mut okm = [0u8; 44];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| Error::DataVerificationFailed)?;
    let cipher =
        Aes256GcmSiv::new_from_slice(&okm[..32]).map_err(|_| Error::DataVerificationFailed)?;
    let nonce = *Nonce::from_slice(&okm[32..44]);
    Ok((cipher, nonce))
}

/// Encrypt a block for storage. Deterministic in `(plaintext, data_key)`.
pub fn encrypt_data_block(plaintext: &[u8], data_key: &DataKey) -> Result<Bytes> {
    let (cipher, nonce) = derive_cipher(data_key)?;
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::DataVerificationFailed)?;
    Ok(Bytes::from(ciphertext))
}

/// Invert [`encrypt_data_block`]. Fails when the ciphertext was not
/// produced under `data_key`.
pub fn decrypt_data_block(ciphertext: &[u8], data_key: &DataKey) -> Result<Vec<u8>> {
    let (cipher, nonce) = derive_cipher(data_key)?;
    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|_| Error::DataVerificationFailed)
}

/// The full retrieval check: decrypt, truncate to the announced plaintext
/// size, and require the plaintext to hash back to the data key. Returns
/// `None` for anything that fails along the way; a corrupt or dishonest
/// response is indistinguishable from a missing block to the caller.
pub fn decrypt_and_verify(
    ciphertext: &[u8],
    original_size: usize,
    data_key: &DataKey,
) -> Option<Vec<u8>> {
    let mut plaintext = decrypt_data_block(ciphertext, data_key).ok()?;
    plaintext.truncate(original_size);
    if DataKey::from_plaintext(&plaintext) == *data_key {
        Some(plaintext)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_inverts_encrypt() -> eyre::Result<()> {
        // Law: decrypt(encrypt(x, k), k)[..len(x)] == x.
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let key = DataKey::from_plaintext(&plaintext);
            let ciphertext = encrypt_data_block(&plaintext, &key)?;
            assert_eq!(ciphertext.len(), plaintext.len() + CIPHER_OVERHEAD);
            let mut decrypted = decrypt_data_block(&ciphertext, &key)?;
            decrypted.truncate(plaintext.len());
            assert_eq!(decrypted, plaintext);
        }
        Ok(())
    }

    #[test]
    fn encryption_is_deterministic() -> eyre::Result<()> {
        let key = DataKey::from_plaintext(b"same block");
        let first = encrypt_data_block(b"same block", &key)?;
        let second = encrypt_data_block(b"same block", &key)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn corrupted_ciphertext_is_rejected() -> eyre::Result<()> {
        let key = DataKey::from_plaintext(b"precious");
        let ciphertext = encrypt_data_block(b"precious", &key)?;
        let mut corrupted = ciphertext.to_vec();
        corrupted[0] ^= 0x01;
        assert!(decrypt_and_verify(&corrupted, 8, &key).is_none());
        Ok(())
    }

    #[test]
    fn wrong_key_is_rejected() -> eyre::Result<()> {
        let key = DataKey::from_plaintext(b"precious");
        let other = DataKey::from_plaintext(b"impostor");
        let ciphertext = encrypt_data_block(b"precious", &key)?;
        assert!(decrypt_and_verify(&ciphertext, 8, &other).is_none());
        Ok(())
    }

    #[test]
    fn verified_plaintext_hashes_back_to_the_key() -> eyre::Result<()> {
        let plaintext = b"hello".to_vec();
        let key = DataKey::from_plaintext(&plaintext);
        let ciphertext = encrypt_data_block(&plaintext, &key)?;
        let recovered = decrypt_and_verify(&ciphertext, plaintext.len(), &key)
            .ok_or_else(|| eyre::eyre!("verification should pass"))?;
        assert_eq!(recovered, plaintext);
        Ok(())
    }
}
