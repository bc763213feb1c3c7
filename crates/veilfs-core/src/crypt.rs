//! Authenticated encryption layer over a backing [`Stream`].
//!
//! Every backing file starts with a 16-byte random header, written exactly
//! once at creation. Encrypting the header with AES-256-ECB under the
//! master content key yields the file's session key, which keys
//! AES-128-GCM for the content blocks.
//!
//! Each logical block is stored as `IV ‖ ciphertext ‖ MAC` at
//! `HEADER_SIZE + block × (iv_size + block_size + MAC_SIZE)`, with the
//! little-endian 32-bit block index bound as associated data, so blocks
//! cannot be transplanted within a file. A logical block that is entirely
//! zero is stored as all-zero physical bytes with no IV or MAC, which keeps
//! sparse plaintext files sparse on the backing store; encryption rerolls
//! any all-zero IV so a real block can never collide with a sparse one.

use aead::Payload;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use aes_gcm::{Aes128Gcm, Nonce};
use aes_gcm::aead::Aead;
use rand::RngCore;
use tracing::warn;

use crate::block::BlockStream;
use crate::error::StreamError;
use crate::keys::KEY_SIZE;
use crate::os::Stream;

/// Size of the per-file header, equal to the AES block size.
pub const HEADER_SIZE: usize = 16;

/// Size of the GCM authentication tag.
pub const MAC_SIZE: usize = 16;

/// Default logical block size.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default IV size; the GCM fast path.
pub const DEFAULT_IV_SIZE: usize = 12;

/// Highest addressable block index.
pub const MAX_BLOCKS: u64 = (1 << 31) - 1;

/// Smallest accepted logical block size.
pub const MIN_BLOCK_SIZE: usize = 32;

/// Accepted stored IV size range.
pub const MIN_IV_SIZE: usize = 12;
pub const MAX_IV_SIZE: usize = 32;

const GCM_NONCE_SIZE: usize = 12;

pub(crate) fn is_all_zeros(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Logical stream size as a pure function of the underlying file size.
///
/// No separate size record is stored; a trailing residue shorter than a
/// full physical block is a legitimate short final block.
pub fn logical_size(underlying: u64, block_size: usize, iv_size: usize) -> u64 {
    let overhead = (iv_size + MAC_SIZE) as u64;
    let underlying_block = block_size as u64 + overhead;
    if underlying <= HEADER_SIZE as u64 {
        return 0;
    }
    let body = underlying - HEADER_SIZE as u64;
    let full_blocks = body / underlying_block;
    let residue = body % underlying_block;
    full_blocks * block_size as u64 + residue.saturating_sub(overhead)
}

/// An AES-GCM encrypted stream with per-block authentication.
pub struct AesGcmCryptStream<S: Stream> {
    stream: S,
    cipher: Aes128Gcm,
    /// Session-keyed raw block cipher for forensic reads; present only when
    /// `check` is off.
    forensic: Option<Aes128>,
    block_size: usize,
    iv_size: usize,
    check: bool,
    buffer: Vec<u8>,
}

impl<S: Stream> std::fmt::Debug for AesGcmCryptStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCryptStream")
            .field("block_size", &self.block_size)
            .field("iv_size", &self.iv_size)
            .field("check", &self.check)
            .finish()
    }
}

impl<S: Stream> AesGcmCryptStream<S> {
    /// Open or initialize an encrypted stream.
    ///
    /// Reads the file header, writing a fresh random one if the file is
    /// empty, and derives the session key. With `check` off, MAC failures
    /// on read are tolerated and the raw decryption is returned; that mode
    /// exists for forensic and repair tooling only.
    pub fn new(
        stream: S,
        content_key: &[u8; KEY_SIZE],
        block_size: usize,
        iv_size: usize,
        check: bool,
    ) -> Result<Self, StreamError> {
        if !(MIN_IV_SIZE..=MAX_IV_SIZE).contains(&iv_size) {
            return Err(StreamError::InvalidArgument {
                reason: format!("IV size {iv_size} out of range [{MIN_IV_SIZE}, {MAX_IV_SIZE}]"),
            });
        }
        if block_size < MIN_BLOCK_SIZE {
            return Err(StreamError::InvalidArgument {
                reason: format!("block size {block_size} below minimum {MIN_BLOCK_SIZE}"),
            });
        }

        let mut header = [0u8; HEADER_SIZE];
        let n = stream.read(&mut header, 0)?;
        if n == 0 {
            // Fresh file: the header is random and written exactly once.
            rand::rng().fill_bytes(&mut header);
            stream.write(&header, 0)?;
        } else if n != HEADER_SIZE {
            return Err(StreamError::CorruptHeader { actual: n, expected: HEADER_SIZE });
        }

        let mut session_key = aes::Block::from(header);
        Aes256::new(content_key.into()).encrypt_block(&mut session_key);
        if is_all_zeros(&session_key) {
            warn!("derived session key is all zeros; content key is suspect");
        }

        let cipher = Aes128Gcm::new(&session_key);
        let forensic = (!check).then(|| Aes128::new(&session_key));
        let underlying_block = iv_size + block_size + MAC_SIZE;

        Ok(AesGcmCryptStream {
            stream,
            cipher,
            forensic,
            block_size,
            iv_size,
            check,
            buffer: vec![0u8; underlying_block],
        })
    }

    pub fn underlying_block_size(&self) -> usize {
        self.iv_size + self.block_size + MAC_SIZE
    }

    /// The backing stream.
    pub fn inner(&self) -> &S {
        &self.stream
    }

    fn underlying_offset(&self, block: u64) -> u64 {
        HEADER_SIZE as u64 + block * self.underlying_block_size() as u64
    }

    /// Associated data for a block: the little-endian 32-bit block index,
    /// followed by any IV bytes beyond the 96-bit GCM nonce so the whole
    /// stored IV stays authenticated.
    fn fill_aad<'a>(&self, aad: &'a mut [u8; 4 + MAX_IV_SIZE - GCM_NONCE_SIZE], block: u64) -> &'a [u8] {
        let tail = self.iv_size - GCM_NONCE_SIZE;
        aad[..4].copy_from_slice(&(block as u32).to_le_bytes());
        aad[4..4 + tail].copy_from_slice(&self.buffer[GCM_NONCE_SIZE..self.iv_size]);
        &aad[..4 + tail]
    }

    /// GCM keystream decryption without tag verification, for `check=false`
    /// reads of damaged blocks. The payload counter starts at 2.
    fn forensic_decrypt(cipher: &Aes128, nonce: &[u8], ciphertext: &[u8], out: &mut [u8]) {
        for (i, chunk) in ciphertext.chunks(16).enumerate() {
            let mut counter = [0u8; 16];
            counter[..GCM_NONCE_SIZE].copy_from_slice(nonce);
            counter[GCM_NONCE_SIZE..].copy_from_slice(&(i as u32 + 2).to_be_bytes());
            let mut keystream = aes::Block::from(counter);
            cipher.encrypt_block(&mut keystream);
            for (j, &c) in chunk.iter().enumerate() {
                out[i * 16 + j] = c ^ keystream[j];
            }
        }
    }
}

impl<S: Stream> BlockStream for AesGcmCryptStream<S> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, block: u64, out: &mut [u8]) -> Result<usize, StreamError> {
        if block > MAX_BLOCKS {
            return Err(StreamError::TooLong { block });
        }
        let underlying_block = self.underlying_block_size();
        let offset = self.underlying_offset(block);
        let rc = self.stream.read(&mut self.buffer[..underlying_block], offset)?;

        if rc <= self.iv_size + MAC_SIZE {
            // Absent block, or too short to carry any payload: end of stream.
            return Ok(0);
        }
        let out_size = rc - self.iv_size - MAC_SIZE;

        if is_all_zeros(&self.buffer[..rc]) {
            out[..self.block_size].fill(0);
            return Ok(out_size);
        }

        let mut aad_buf = [0u8; 4 + MAX_IV_SIZE - GCM_NONCE_SIZE];
        let aad = self.fill_aad(&mut aad_buf, block);
        let payload = Payload {
            msg: &self.buffer[self.iv_size..rc],
            aad,
        };
        let nonce = Nonce::from_slice(&self.buffer[..GCM_NONCE_SIZE]);

        match self.cipher.decrypt(nonce, payload) {
            Ok(plain) => {
                out[..out_size].copy_from_slice(&plain);
                Ok(out_size)
            }
            Err(_) if !self.check => {
                warn!(block, offset, "ignoring MAC mismatch (verification disabled)");
                if let Some(forensic) = &self.forensic {
                    Self::forensic_decrypt(
                        forensic,
                        &self.buffer[..GCM_NONCE_SIZE],
                        &self.buffer[self.iv_size..self.iv_size + out_size],
                        &mut out[..out_size],
                    );
                }
                Ok(out_size)
            }
            Err(_) => Err(StreamError::Verification { block, offset, len: out_size }),
        }
    }

    fn write_block(&mut self, block: u64, data: &[u8]) -> Result<(), StreamError> {
        if block > MAX_BLOCKS {
            return Err(StreamError::TooLong { block });
        }
        debug_assert!(!data.is_empty() && data.len() <= self.block_size);

        let offset = self.underlying_offset(block);
        let total = data.len() + self.iv_size + MAC_SIZE;

        if is_all_zeros(data) {
            self.buffer[..total].fill(0);
            self.stream.write(&self.buffer[..total], offset)?;
            return Ok(());
        }

        loop {
            rand::rng().fill_bytes(&mut self.buffer[..self.iv_size]);
            if !is_all_zeros(&self.buffer[..self.iv_size]) {
                break;
            }
        }

        let mut aad_buf = [0u8; 4 + MAX_IV_SIZE - GCM_NONCE_SIZE];
        let aad = self.fill_aad(&mut aad_buf, block);
        let payload = Payload { msg: data, aad };
        let nonce = Nonce::from_slice(&self.buffer[..GCM_NONCE_SIZE]);
        let sealed = self
            .cipher
            .encrypt(nonce, payload)
            .map_err(|_| StreamError::InvalidArgument {
                reason: format!("block {block} failed to encrypt"),
            })?;

        self.buffer[self.iv_size..total].copy_from_slice(&sealed);
        self.stream.write(&self.buffer[..total], offset)?;
        Ok(())
    }

    fn adjust_logical_size(&mut self, new_size: u64) -> Result<(), StreamError> {
        let bs = self.block_size as u64;
        let full_blocks = new_size / bs;
        let residue = new_size % bs;
        let overhead = (self.iv_size + MAC_SIZE) as u64;
        let underlying = HEADER_SIZE as u64
            + full_blocks * self.underlying_block_size() as u64
            + if residue > 0 { residue + overhead } else { 0 };
        self.stream.resize(underlying)?;
        Ok(())
    }

    fn size(&self) -> Result<u64, StreamError> {
        Ok(logical_size(self.stream.size()?, self.block_size, self.iv_size))
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.stream.flush()?;
        Ok(())
    }

    fn is_sparse(&self) -> bool {
        self.stream.is_sparse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::MemoryStream;

    const TEST_BLOCK_SIZE: usize = 32;
    const TEST_IV_SIZE: usize = 12;
    const TEST_KEY: [u8; KEY_SIZE] = [0u8; KEY_SIZE];

    fn open_stream(backing: &MemoryStream) -> AesGcmCryptStream<&MemoryStream> {
        AesGcmCryptStream::new(backing, &TEST_KEY, TEST_BLOCK_SIZE, TEST_IV_SIZE, true).unwrap()
    }

    #[test]
    fn write_hello_and_read_back() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        s.write(b"hello", 0).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        // header + iv + payload + mac
        assert_eq!(backing.size().unwrap(), 16 + 12 + 5 + 16);
        assert_eq!(s.size().unwrap(), 5);
    }

    #[test]
    fn two_block_write_with_residue() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        s.write(&[0x41u8; 40], 0).unwrap();

        assert_eq!(s.size().unwrap(), 40);
        // One full physical block plus an 8-byte residue block.
        assert_eq!(backing.size().unwrap(), 16 + (12 + 32 + 16) + (12 + 8 + 16));

        let mut buf = [0u8; 1];
        assert_eq!(s.read(&mut buf, 39).unwrap(), 1);
        assert_eq!(buf[0], 0x41);
    }

    #[test]
    fn zero_block_is_stored_sparse() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        s.write(&[0u8; 32], 0).unwrap();

        let raw = backing.contents();
        assert_eq!(raw.len(), 16 + 60);
        assert!(raw[16..76].iter().all(|&b| b == 0));

        let mut buf = [0xffu8; 32];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 32);
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn nonzero_block_is_not_stored_as_zeros() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        s.write(&[1u8; 32], 0).unwrap();
        let raw = backing.contents();
        assert!(!raw[16..76].iter().all(|&b| b == 0));
    }

    #[test]
    fn corrupt_mac_fails_verification() {
        let backing = MemoryStream::new();
        {
            let mut s = open_stream(&backing);
            s.write(b"sensitive", 0).unwrap();
        }

        let mut raw = backing.contents();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        backing.set_contents(raw);

        let mut s = open_stream(&backing);
        let mut buf = [0u8; 9];
        let err = s.read(&mut buf, 0).unwrap_err();
        assert!(matches!(err, StreamError::Verification { block: 0, .. }));
    }

    #[test]
    fn corrupt_mac_tolerated_without_check() {
        let backing = MemoryStream::new();
        {
            let mut s = open_stream(&backing);
            s.write(b"sensitive", 0).unwrap();
        }

        let mut raw = backing.contents();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        backing.set_contents(raw);

        let mut s =
            AesGcmCryptStream::new(&backing, &TEST_KEY, TEST_BLOCK_SIZE, TEST_IV_SIZE, false)
                .unwrap();
        let mut buf = [0u8; 9];
        // Only the tag was damaged, so the forensic path recovers the
        // original plaintext.
        assert_eq!(s.read(&mut buf, 0).unwrap(), 9);
        assert_eq!(&buf, b"sensitive");
    }

    #[test]
    fn swapped_blocks_fail_verification() {
        let backing = MemoryStream::new();
        {
            let mut s = open_stream(&backing);
            s.write(&[1u8; 32], 0).unwrap();
            s.write(&[2u8; 32], 32).unwrap();
        }

        let mut raw = backing.contents();
        let (b0, b1) = (16..76, 76..136);
        let block0: Vec<u8> = raw[b0.clone()].to_vec();
        let block1: Vec<u8> = raw[b1.clone()].to_vec();
        raw[b0].copy_from_slice(&block1);
        raw[b1].copy_from_slice(&block0);
        backing.set_contents(raw);

        let mut s = open_stream(&backing);
        let mut buf = [0u8; 32];
        assert!(matches!(
            s.read(&mut buf, 0).unwrap_err(),
            StreamError::Verification { block: 0, .. }
        ));
        assert!(matches!(
            s.read(&mut buf, 32).unwrap_err(),
            StreamError::Verification { block: 1, .. }
        ));
    }

    #[test]
    fn emitted_ivs_are_never_all_zero() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        let data = [0x5au8; 8];
        for _ in 0..10_000 {
            s.write_block(0, &data).unwrap();
            let raw = backing.contents();
            assert!(!raw[16..16 + TEST_IV_SIZE].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn header_survives_reopen() {
        let backing = MemoryStream::new();
        {
            let mut s = open_stream(&backing);
            s.write(b"persistent", 0).unwrap();
        }
        let header: Vec<u8> = backing.contents()[..HEADER_SIZE].to_vec();
        assert!(!header.iter().all(|&b| b == 0));

        let mut s = open_stream(&backing);
        let mut buf = [0u8; 10];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"persistent");
        assert_eq!(&backing.contents()[..HEADER_SIZE], &header[..]);
    }

    #[test]
    fn partial_header_is_rejected() {
        let backing = MemoryStream::new();
        backing.set_contents(vec![1u8; 7]);
        let err =
            AesGcmCryptStream::new(&backing, &TEST_KEY, TEST_BLOCK_SIZE, TEST_IV_SIZE, true)
                .unwrap_err();
        assert!(matches!(err, StreamError::CorruptHeader { actual: 7, expected: 16 }));
    }

    #[test]
    fn geometry_is_validated() {
        let backing = MemoryStream::new();
        assert!(matches!(
            AesGcmCryptStream::new(&backing, &TEST_KEY, 16, 12, true).unwrap_err(),
            StreamError::InvalidArgument { .. }
        ));
        assert!(matches!(
            AesGcmCryptStream::new(&backing, &TEST_KEY, 4096, 8, true).unwrap_err(),
            StreamError::InvalidArgument { .. }
        ));
        assert!(matches!(
            AesGcmCryptStream::new(&backing, &TEST_KEY, 4096, 33, true).unwrap_err(),
            StreamError::InvalidArgument { .. }
        ));
    }

    #[test]
    fn block_index_limit_is_enforced() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        let mut buf = [0u8; TEST_BLOCK_SIZE];
        assert!(matches!(
            s.read_block(MAX_BLOCKS + 1, &mut buf).unwrap_err(),
            StreamError::TooLong { .. }
        ));
        assert!(matches!(
            s.write_block(MAX_BLOCKS + 1, &[1u8; 4]).unwrap_err(),
            StreamError::TooLong { .. }
        ));
    }

    #[test]
    fn truncate_to_zero_leaves_only_header() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        s.write(&[9u8; 100], 0).unwrap();
        s.resize(0).unwrap();
        assert_eq!(backing.size().unwrap(), HEADER_SIZE as u64);
        assert_eq!(s.size().unwrap(), 0);
    }

    #[test]
    fn shrink_reencrypts_trailing_block() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        s.write(&[3u8; 70], 0).unwrap();
        s.resize(40).unwrap();
        assert_eq!(s.size().unwrap(), 40);
        assert_eq!(backing.size().unwrap(), 16 + 60 + (12 + 8 + 16));

        let mut buf = [0u8; 64];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 40);
        assert_eq!(&buf[..40], &[3u8; 40]);
    }

    #[test]
    fn grow_across_blocks_zero_fills() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        s.write(b"abc", 0).unwrap();
        s.resize(80).unwrap();
        assert_eq!(s.size().unwrap(), 80);

        let mut buf = [0u8; 80];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 80);
        assert_eq!(&buf[..3], b"abc");
        assert!(buf[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn size_formula_matches_underlying_at_all_times() {
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);

        let steps: &[(u64, usize)] = &[(0, 5), (30, 10), (64, 32), (7, 1), (100, 20)];
        for &(offset, len) in steps {
            s.write(&vec![0xabu8; len], offset).unwrap();
            assert_eq!(
                s.size().unwrap(),
                logical_size(backing.size().unwrap(), TEST_BLOCK_SIZE, TEST_IV_SIZE)
            );
        }
        for &target in &[77u64, 33, 32, 1, 0] {
            s.resize(target).unwrap();
            assert_eq!(s.size().unwrap(), target);
            assert_eq!(
                s.size().unwrap(),
                logical_size(backing.size().unwrap(), TEST_BLOCK_SIZE, TEST_IV_SIZE)
            );
        }
    }

    #[test]
    fn logical_size_spot_values() {
        // header only
        assert_eq!(logical_size(16, 32, 12), 0);
        assert_eq!(logical_size(0, 32, 12), 0);
        // one 5-byte residue block
        assert_eq!(logical_size(49, 32, 12), 5);
        // one full block + 8-byte residue
        assert_eq!(logical_size(92, 32, 12), 40);
        // residue too short to carry payload counts as zero
        assert_eq!(logical_size(16 + 60 + 20, 32, 12), 32);
    }

    #[test]
    fn short_trailing_block_is_accepted() {
        // A trailing physical block shorter than a full one, but longer than
        // iv + mac, is a legitimate short final block.
        let backing = MemoryStream::new();
        let mut s = open_stream(&backing);
        s.write(b"final", 32).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 37);
        assert_eq!(&buf[..32], &[0u8; 32]);
        assert_eq!(&buf[32..37], b"final");
    }

    #[test]
    fn wrong_content_key_fails_verification() {
        let backing = MemoryStream::new();
        {
            let mut s = open_stream(&backing);
            s.write(&[4u8; 16], 0).unwrap();
        }
        let other_key = [1u8; KEY_SIZE];
        let mut s =
            AesGcmCryptStream::new(&backing, &other_key, TEST_BLOCK_SIZE, TEST_IV_SIZE, true)
                .unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            s.read(&mut buf, 0).unwrap_err(),
            StreamError::Verification { .. }
        ));
    }

    #[test]
    fn non_default_iv_size_round_trips() {
        let backing = MemoryStream::new();
        let mut s =
            AesGcmCryptStream::new(&backing, &TEST_KEY, TEST_BLOCK_SIZE, 16, true).unwrap();
        s.write(b"wide iv block", 0).unwrap();
        assert_eq!(backing.size().unwrap(), 16 + 16 + 13 + 16);

        let mut buf = [0u8; 13];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 13);
        assert_eq!(&buf, b"wide iv block");

        // Flipping an IV byte past the GCM nonce must still break the MAC.
        let mut raw = backing.contents();
        raw[16 + 14] ^= 0x80;
        backing.set_contents(raw);
        let mut s =
            AesGcmCryptStream::new(&backing, &TEST_KEY, TEST_BLOCK_SIZE, 16, true).unwrap();
        assert!(matches!(
            s.read(&mut buf, 0).unwrap_err(),
            StreamError::Verification { .. }
        ));
    }
}
