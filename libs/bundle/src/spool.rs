//! Spill-capable output buffer for the compressed archive.

use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Write-side buffer that holds up to `threshold` bytes in memory and
/// spills everything to an unnamed temporary file beyond that.
pub struct SpoolBuffer {
    state: SpoolState,
    threshold: u64,
    written: Arc<AtomicU64>,
}

enum SpoolState {
    Memory(Vec<u8>),
    Disk(std::fs::File),
}

impl SpoolBuffer {
    pub fn new(threshold: u64) -> Self {
        Self {
            state: SpoolState::Memory(Vec::new()),
            threshold,
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of accepted bytes; the budget governor reads this for
    /// on-disk accounting.
    pub fn byte_counter(&self) -> Arc<AtomicU64> {
        self.written.clone()
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.state, SpoolState::Disk(_))
    }

    fn spill(&mut self) -> io::Result<()> {
        if let SpoolState::Memory(buffered) = &mut self.state {
            let mut file = tempfile::tempfile()?;
            file.write_all(buffered)?;
            self.state = SpoolState::Disk(file);
        }
        Ok(())
    }

    /// Rewinds and converts into an async reader over the full contents.
    pub fn into_reader(mut self) -> io::Result<SpoolReader> {
        self.flush()?;
        match self.state {
            SpoolState::Memory(buffered) => Ok(SpoolReader::Memory(Cursor::new(buffered))),
            SpoolState::Disk(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                Ok(SpoolReader::Disk(tokio::fs::File::from_std(file)))
            }
        }
    }
}

impl Write for SpoolBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let SpoolState::Memory(buffered) = &self.state {
            if buffered.len() as u64 + buf.len() as u64 > self.threshold {
                self.spill()?;
            }
        }
        let accepted = match &mut self.state {
            SpoolState::Memory(buffered) => {
                buffered.extend_from_slice(buf);
                buf.len()
            }
            SpoolState::Disk(file) => file.write(buf)?,
        };
        self.written.fetch_add(accepted as u64, Ordering::AcqRel);
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            SpoolState::Memory(_) => Ok(()),
            SpoolState::Disk(file) => file.flush(),
        }
    }
}

/// Rewound read side of a finalized spool.
#[derive(Debug)]
pub enum SpoolReader {
    Memory(Cursor<Vec<u8>>),
    Disk(tokio::fs::File),
}

impl AsyncRead for SpoolReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SpoolReader::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            SpoolReader::Disk(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn stays_in_memory_below_the_threshold() {
        let mut spool = SpoolBuffer::new(1024);
        spool.write_all(b"hello world").unwrap();
        assert!(!spool.is_spilled());
        assert_eq!(spool.bytes_written(), 11);

        let mut reader = spool.into_reader().unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[tokio::test]
    async fn spills_to_disk_past_the_threshold() {
        let mut spool = SpoolBuffer::new(16);
        let payload: Vec<u8> = (0..64u8).collect();
        spool.write_all(&payload[..8]).unwrap();
        assert!(!spool.is_spilled());
        spool.write_all(&payload[8..]).unwrap();
        assert!(spool.is_spilled());
        assert_eq!(spool.bytes_written(), 64);

        let mut reader = spool.into_reader().unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, payload);
    }

    #[tokio::test]
    async fn byte_counter_is_shared() {
        let mut spool = SpoolBuffer::new(1024);
        let counter = spool.byte_counter();
        spool.write_all(&[0u8; 100]).unwrap();
        assert_eq!(counter.load(Ordering::Acquire), 100);
    }
}
