//! Deterministic filename encryption.
//!
//! Path components are encrypted with AES-SIV under the name key, so equal
//! plaintext names always produce equal ciphertext names and a requested
//! path can be looked up on the backing store without scanning the
//! directory. The 16-byte synthetic IV doubles as an authenticator: a
//! backing entry that fails to decode is simply not part of the encrypted
//! view.
//!
//! Ciphertext names are base32-encoded with a lowercase `a-z2-7` alphabet,
//! padded with `=` to a multiple of eight characters, which keeps them safe
//! for any backing filesystem.

use std::sync::LazyLock;

use aes_siv::siv::Aes128Siv;
use aes_siv::KeyInit;
use data_encoding::{Encoding, Specification};
use zeroize::Zeroizing;

use crate::error::NameError;
use crate::keys::KEY_SIZE;

/// RFC 4648 base32, lowercase, with padding.
static LOWER_BASE32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.padding = Some('=');
    spec.encoding().expect("static base32 specification is well-formed")
});

/// SIV tag length prepended to every ciphertext name.
const SIV_SIZE: usize = 16;

/// Encrypts and decrypts single path components under the name key.
pub struct NameCodec {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl NameCodec {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        NameCodec { key: Zeroizing::new(*key) }
    }

    /// Encrypt one path component. Deterministic: equal names map to equal
    /// backing names.
    pub fn encrypt_component(&self, name: &str) -> Result<String, NameError> {
        let mut cipher = Aes128Siv::new((&*self.key).into());
        let no_ad: &[&[u8]] = &[];
        let sealed = cipher
            .encrypt(no_ad, name.as_bytes())
            .map_err(|_| NameError::Encryption)?;
        Ok(LOWER_BASE32.encode(&sealed))
    }

    /// Decrypt one backing component. Fails if the entry is not base32, the
    /// SIV does not verify, or the plaintext is not UTF-8.
    pub fn decrypt_component(&self, encoded: &str) -> Result<String, NameError> {
        let raw = LOWER_BASE32
            .decode(encoded.as_bytes())
            .map_err(|_| NameError::Encoding { name: encoded.to_string() })?;
        if raw.len() < SIV_SIZE {
            return Err(NameError::Encoding { name: encoded.to_string() });
        }
        let mut cipher = Aes128Siv::new((&*self.key).into());
        let no_ad: &[&[u8]] = &[];
        let plain = cipher
            .decrypt(no_ad, &raw)
            .map_err(|_| NameError::Verification { name: encoded.to_string() })?;
        String::from_utf8(plain).map_err(|_| NameError::NotUtf8)
    }

    /// Encrypt every component of a `/`-separated path, preserving leading,
    /// trailing, and duplicate separators. Used for symlink targets, which
    /// are stored as encrypted path strings.
    pub fn encrypt_path(&self, path: &str) -> Result<String, NameError> {
        self.map_components(path, |c| self.encrypt_component(c))
    }

    /// Inverse of [`Self::encrypt_path`].
    pub fn decrypt_path(&self, path: &str) -> Result<String, NameError> {
        self.map_components(path, |c| self.decrypt_component(c))
    }

    fn map_components(
        &self,
        path: &str,
        f: impl Fn(&str) -> Result<String, NameError>,
    ) -> Result<String, NameError> {
        let mut out = Vec::new();
        for component in path.split('/') {
            if component.is_empty() {
                out.push(String::new());
            } else {
                out.push(f(component)?);
            }
        }
        Ok(out.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> NameCodec {
        let mut key = [0u8; KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        NameCodec::new(&key)
    }

    #[test]
    fn encryption_is_deterministic() {
        let c = codec();
        let a = c.encrypt_component("report.pdf").unwrap();
        let b = c.encrypt_component("report.pdf").unwrap();
        assert_eq!(a, b);
        assert_eq!(c.decrypt_component(&a).unwrap(), "report.pdf");
    }

    #[test]
    fn round_trips_assorted_names() {
        let c = codec();
        for name in [
            "a",
            "file with spaces.doc",
            "unicode-caf\u{e9}.txt",
            ".hidden",
            "trailing.dots...",
            "日本語ファイル",
        ] {
            let enc = c.encrypt_component(name).unwrap();
            assert_eq!(c.decrypt_component(&enc).unwrap(), name, "failed for {name:?}");
        }
    }

    #[test]
    fn output_is_filesystem_safe_base32() {
        let c = codec();
        let enc = c.encrypt_component("anything at all, even / is fine? no: / never appears").unwrap();
        assert!(enc.len() % 8 == 0, "padded to a multiple of 8");
        for ch in enc.chars() {
            assert!(
                ch.is_ascii_lowercase() || ('2'..='7').contains(&ch) || ch == '=',
                "unexpected character {ch:?} in {enc}"
            );
        }
    }

    #[test]
    fn distinct_names_produce_distinct_ciphertexts() {
        let c = codec();
        assert_ne!(
            c.encrypt_component("a").unwrap(),
            c.encrypt_component("b").unwrap()
        );
    }

    #[test]
    fn wrong_key_fails_verification() {
        let c = codec();
        let enc = c.encrypt_component("secret").unwrap();
        let other = NameCodec::new(&[0xffu8; KEY_SIZE]);
        assert!(matches!(
            other.decrypt_component(&enc).unwrap_err(),
            NameError::Verification { .. }
        ));
    }

    #[test]
    fn tampered_name_fails_verification() {
        let c = codec();
        let enc = c.encrypt_component("secret").unwrap();
        let mut chars: Vec<char> = enc.chars().collect();
        chars[0] = if chars[0] == 'a' { 'b' } else { 'a' };
        let tampered: String = chars.into_iter().collect();
        assert!(c.decrypt_component(&tampered).is_err());
    }

    #[test]
    fn foreign_entries_fail_to_decode() {
        let c = codec();
        // Config files and anything else a tool drops into the backing tree
        // are not valid encodings and fall out of the view.
        assert!(matches!(
            c.decrypt_component(".veilfs.json").unwrap_err(),
            NameError::Encoding { .. }
        ));
        assert!(c.decrypt_component("UPPERCASE").is_err());
        // Well-formed base32 that is too short to carry a SIV tag.
        assert!(c.decrypt_component("me======").is_err());
    }

    #[test]
    fn path_translation_preserves_separators() {
        let c = codec();
        let enc = c.encrypt_path("/foo/bar").unwrap();
        assert!(enc.starts_with('/'));
        assert_eq!(enc.matches('/').count(), 2);
        assert_eq!(c.decrypt_path(&enc).unwrap(), "/foo/bar");

        let rel = c.encrypt_path("foo/bar/").unwrap();
        assert!(!rel.starts_with('/'));
        assert!(rel.ends_with('/'));
        assert_eq!(c.decrypt_path(&rel).unwrap(), "foo/bar/");
    }

    #[test]
    fn empty_name_round_trips() {
        let c = codec();
        let enc = c.encrypt_component("").unwrap();
        assert_eq!(enc.len(), 32); // 16-byte SIV alone
        assert_eq!(c.decrypt_component(&enc).unwrap(), "");
    }
}
