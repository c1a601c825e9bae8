//! SHA-256 tee over the archive output.

use std::io::{self, Write};

use sha2::{Digest, Sha256};

/// Forwards writes to the inner writer while folding every accepted byte
/// into a running SHA-256, so the bundle hash comes out of the single
/// write pass with no re-read. Finalizing hands the inner writer back to
/// its owner; the wrapper never closes what it does not own.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Consumes the wrapper, returning the inner writer and the hex digest
    /// of everything it accepted.
    pub fn finalize(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let accepted = self.inner.write(buf)?;
        self.hasher.update(&buf[..accepted]);
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_covers_exactly_the_accepted_bytes() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"file1 ").unwrap();
        writer.write_all(b"bytes").unwrap();
        let (inner, digest) = writer.finalize();
        assert_eq!(inner, b"file1 bytes");
        assert_eq!(digest, hex::encode(Sha256::digest(b"file1 bytes")));
    }

    #[test]
    fn empty_input_yields_the_empty_digest() {
        let (_, digest) = HashingWriter::new(Vec::new()).finalize();
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
