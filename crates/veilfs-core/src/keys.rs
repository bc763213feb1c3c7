//! Master key handling.
//!
//! A vault's master key is 96 bytes, partitioned into three independent
//! 32-byte subkeys: one for filename encryption, one for file contents, one
//! for extended attributes. The key is created once during vault
//! initialization and is immutable for the vault's lifetime.
//!
//! Subkeys are held in [`Zeroizing`] containers so they are erased from
//! memory on drop, and the `Debug` implementation redacts them to prevent
//! accidental logging.

use std::fmt;

use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::KeyError;

/// Size of each subkey in bytes.
pub const KEY_SIZE: usize = 32;

/// Total master key size: name key, content key, xattr key.
pub const MASTER_KEY_SIZE: usize = 3 * KEY_SIZE;

/// The vault master key, partitioned into its three subkeys.
pub struct MasterKey {
    name: Zeroizing<[u8; KEY_SIZE]>,
    content: Zeroizing<[u8; KEY_SIZE]>,
    xattr: Zeroizing<[u8; KEY_SIZE]>,
}

impl MasterKey {
    /// Partition a raw 96-byte master key into its subkeys.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, KeyError> {
        if raw.len() != MASTER_KEY_SIZE {
            return Err(KeyError::WrongLength {
                actual: raw.len(),
                expected: MASTER_KEY_SIZE,
            });
        }

        let mut name = Zeroizing::new([0u8; KEY_SIZE]);
        let mut content = Zeroizing::new([0u8; KEY_SIZE]);
        let mut xattr = Zeroizing::new([0u8; KEY_SIZE]);
        name.copy_from_slice(&raw[..KEY_SIZE]);
        content.copy_from_slice(&raw[KEY_SIZE..2 * KEY_SIZE]);
        xattr.copy_from_slice(&raw[2 * KEY_SIZE..]);

        Ok(MasterKey { name, content, xattr })
    }

    /// Generate a fresh random master key using the OS CSPRNG.
    pub fn random() -> Self {
        let mut name = Zeroizing::new([0u8; KEY_SIZE]);
        let mut content = Zeroizing::new([0u8; KEY_SIZE]);
        let mut xattr = Zeroizing::new([0u8; KEY_SIZE]);
        let mut rng = rand::rng();
        rng.fill_bytes(name.as_mut());
        rng.fill_bytes(content.as_mut());
        rng.fill_bytes(xattr.as_mut());
        MasterKey { name, content, xattr }
    }

    pub fn name_key(&self) -> &[u8; KEY_SIZE] {
        &self.name
    }

    pub fn content_key(&self) -> &[u8; KEY_SIZE] {
        &self.content
    }

    pub fn xattr_key(&self) -> &[u8; KEY_SIZE] {
        &self.xattr
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("name", &"[REDACTED]")
            .field("content", &"[REDACTED]")
            .field("xattr", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_subkeys_in_order() {
        let mut raw = [0u8; MASTER_KEY_SIZE];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        let key = MasterKey::from_bytes(&raw).unwrap();
        assert_eq!(key.name_key()[0], 0);
        assert_eq!(key.content_key()[0], 32);
        assert_eq!(key.xattr_key()[0], 64);
        assert_eq!(key.xattr_key()[31], 95);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = MasterKey::from_bytes(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, KeyError::WrongLength { actual: 64, .. }));
    }

    #[test]
    fn random_keys_differ() {
        let a = MasterKey::random();
        let b = MasterKey::random();
        assert_ne!(a.content_key(), b.content_key());
    }

    #[test]
    fn debug_redacts_key_material() {
        let key = MasterKey::random();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("0x"));
    }
}
