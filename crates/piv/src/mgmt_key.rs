//! Management key material and the block cipher used to answer challenges

use std::fmt;

use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde3;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::DEFAULT_MANAGEMENT_KEY;
use crate::types::{Credential, ManagementKeyAlgorithm};
use crate::{Error, Result};

/// Management key value tagged with its algorithm
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ManagementKey {
    #[zeroize(skip)]
    algorithm: ManagementKeyAlgorithm,
    key: Vec<u8>,
}

impl ManagementKey {
    /// Wrap `key`, checking its length against `algorithm`
    pub fn new(algorithm: ManagementKeyAlgorithm, key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.len() != algorithm.key_len() {
            return Err(Error::InvalidArgument(format!(
                "{algorithm} key must be {} bytes, got {}",
                algorithm.key_len(),
                key.len()
            )));
        }
        Ok(Self { algorithm, key })
    }

    /// Factory default value for `algorithm`
    pub fn default_for(algorithm: ManagementKeyAlgorithm) -> Self {
        let key = DEFAULT_MANAGEMENT_KEY
            .iter()
            .copied()
            .cycle()
            .take(algorithm.key_len())
            .collect();
        Self { algorithm, key }
    }

    /// Fresh random key
    pub fn generate(algorithm: ManagementKeyAlgorithm) -> Self {
        let mut key = vec![0u8; algorithm.key_len()];
        rand::rng().fill_bytes(&mut key);
        Self { algorithm, key }
    }

    /// Derive a TripleDES key from the PIN with PBKDF2-HMAC-SHA1
    pub fn derive_from_pin(pin: &Credential, salt: &[u8], iterations: u32) -> Self {
        let algorithm = ManagementKeyAlgorithm::TripleDes;
        let mut key = vec![0u8; algorithm.key_len()];
        pbkdf2_hmac::<Sha1>(pin.as_bytes(), salt, iterations, &mut key);
        Self { algorithm, key }
    }

    /// Cipher the key is used with
    pub const fn algorithm(&self) -> ManagementKeyAlgorithm {
        self.algorithm
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Whether this is the factory default value
    pub fn is_default(&self) -> bool {
        *self == Self::default_for(self.algorithm)
    }

    /// Encrypt one challenge with the key's block cipher (ECB, no padding)
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        match self.algorithm {
            ManagementKeyAlgorithm::TripleDes => encrypt_with::<TdesEde3>(&self.key, &mut out)?,
            ManagementKeyAlgorithm::Aes128 => encrypt_with::<Aes128>(&self.key, &mut out)?,
            ManagementKeyAlgorithm::Aes192 => encrypt_with::<Aes192>(&self.key, &mut out)?,
            ManagementKeyAlgorithm::Aes256 => encrypt_with::<Aes256>(&self.key, &mut out)?,
        }
        Ok(out)
    }

    /// Decrypt one witness with the key's block cipher (ECB, no padding)
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        match self.algorithm {
            ManagementKeyAlgorithm::TripleDes => decrypt_with::<TdesEde3>(&self.key, &mut out)?,
            ManagementKeyAlgorithm::Aes128 => decrypt_with::<Aes128>(&self.key, &mut out)?,
            ManagementKeyAlgorithm::Aes192 => decrypt_with::<Aes192>(&self.key, &mut out)?,
            ManagementKeyAlgorithm::Aes256 => decrypt_with::<Aes256>(&self.key, &mut out)?,
        }
        Ok(out)
    }
}

impl PartialEq for ManagementKey {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && bool::from(self.key.ct_eq(&other.key))
    }
}

impl Eq for ManagementKey {}

fn check_blocks(len: usize, block_size: usize) -> Result<()> {
    if len == 0 || len % block_size != 0 {
        return Err(Error::ProtocolViolation("challenge is not a whole number of blocks"));
    }
    Ok(())
}

fn encrypt_with<C: BlockEncrypt + KeyInit>(key: &[u8], data: &mut [u8]) -> Result<()> {
    check_blocks(data.len(), C::block_size())?;
    let cipher = C::new_from_slice(key)
        .map_err(|_| Error::InvalidArgument("management key has the wrong length".into()))?;
    for block in data.chunks_exact_mut(C::block_size()) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

fn decrypt_with<C: BlockDecrypt + KeyInit>(key: &[u8], data: &mut [u8]) -> Result<()> {
    check_blocks(data.len(), C::block_size())?;
    let cipher = C::new_from_slice(key)
        .map_err(|_| Error::InvalidArgument("management key has the wrong length".into()))?;
    for block in data.chunks_exact_mut(C::block_size()) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

impl fmt::Debug for ManagementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
