//! Writer that hashes what passes through it.

use std::io::{self, Write};

use imagemod_shared::constants::digest::SHA256_PREFIX;
use sha2::{Digest, Sha256};

/// Pass-through writer computing a sha256 digest and byte count.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Return the inner writer, the `sha256:<hex>` digest and the byte count.
    pub fn finish(self) -> (W, String, u64) {
        let digest = format!("{}{}", SHA256_PREFIX, hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{}{}", SHA256_PREFIX, hex::encode(Sha256::digest(data)))
}
