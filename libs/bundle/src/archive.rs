//! Single-writer construction of the compressed, hashed tar bundle.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{EntryType, Header};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use baler_core::errors::BundleError;

use crate::hashing::HashingWriter;
use crate::spool::{SpoolBuffer, SpoolReader};

const BLOCK_SIZE: u64 = 512;
const STREAM_CHUNK: usize = 64 * 1024;
const ZERO_BLOCK: [u8; BLOCK_SIZE as usize] = [0u8; BLOCK_SIZE as usize];

/// Finalized bundle ready for upload. The hash covers the compressed bytes
/// exactly as they will be read back out of `reader`.
#[derive(Debug)]
pub struct BundleArtifact {
    pub reader: SpoolReader,
    pub sha256_hex: String,
    pub size_bytes: u64,
    pub entries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Idle,
    Writing,
    Finalizing,
    Closed,
}

/// Builds a gzip-compressed tar stream into a spool buffer, hashing the
/// compressed output as it is written. Not thread-safe; exactly one writer
/// task owns it.
pub struct ArchiveWriter {
    builder: tar::Builder<GzEncoder<HashingWriter<SpoolBuffer>>>,
    written: Arc<AtomicU64>,
    seen_paths: HashMap<String, u32>,
    entries: u64,
    state: WriterState,
}

impl ArchiveWriter {
    pub fn new(spool: SpoolBuffer) -> Self {
        let written = spool.byte_counter();
        let encoder = GzEncoder::new(HashingWriter::new(spool), Compression::default());
        Self {
            builder: tar::Builder::new(encoder),
            written,
            seen_paths: HashMap::new(),
            entries: 0,
            state: WriterState::Idle,
        }
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Compressed bytes accepted by the spool so far.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Appends a fully-buffered entry whose length has already been
    /// verified against the record's declared size.
    pub fn append_buffered(&mut self, safe_path: &str, data: &[u8]) -> Result<String, BundleError> {
        self.state = WriterState::Writing;
        let name = self.reserve_path(safe_path);
        let mut header = entry_header(data.len() as u64)?;
        self.builder.append_data(&mut header, &name, data)?;
        self.entries += 1;
        debug!(path = %name, size = data.len(), "archive entry written");
        Ok(name)
    }

    /// Streams a large entry through the tar writer, trusting `declared`
    /// for the header size. The body must yield exactly `declared` bytes;
    /// anything else corrupts the stream mid-entry, so it closes the writer.
    pub async fn append_streamed<R>(
        &mut self,
        safe_path: &str,
        declared: u64,
        body: &mut R,
    ) -> Result<String, BundleError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.state = WriterState::Writing;
        let name = self.reserve_path(safe_path);
        let mut header = entry_header(declared)?;
        self.write_entry_header(&mut header, &name)?;

        let mut chunk = vec![0u8; STREAM_CHUNK];
        let mut remaining = declared;
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            let got = body.read(&mut chunk[..want]).await?;
            if got == 0 {
                break;
            }
            self.builder.get_mut().write_all(&chunk[..got])?;
            remaining -= got as u64;
        }
        if remaining > 0 {
            self.state = WriterState::Closed;
            return Err(BundleError::EntryLengthMismatch {
                key: name,
                declared,
                actual: declared - remaining,
            });
        }
        if body.read(&mut chunk[..1]).await? != 0 {
            self.state = WriterState::Closed;
            return Err(BundleError::EntryLengthMismatch {
                key: name,
                declared,
                actual: declared + 1,
            });
        }

        pad_to_block(self.builder.get_mut(), declared)?;
        self.entries += 1;
        debug!(path = %name, size = declared, "archive entry streamed");
        Ok(name)
    }

    /// Flushes the tar terminator and the gzip trailer, then hands back the
    /// rewound spool and the digest of the compressed bytes.
    pub fn finalize(self) -> Result<BundleArtifact, BundleError> {
        if self.state == WriterState::Closed {
            return Err(BundleError::Aborted);
        }
        let ArchiveWriter {
            builder, entries, ..
        } = self;
        let encoder = builder.into_inner()?;
        let hashing = encoder.finish()?;
        let (spool, sha256_hex) = hashing.finalize();
        let size_bytes = spool.bytes_written();
        let reader = spool.into_reader()?;
        Ok(BundleArtifact {
            reader,
            sha256_hex,
            size_bytes,
            entries,
        })
    }

    /// Resolves name collisions within this bundle: the Nth duplicate of a
    /// path gets an `(N)` suffix before the extension, in arrival order,
    /// starting at 1. Generated names are reserved too, so a later natural
    /// arrival of `name(1).ext` still comes out unique.
    fn reserve_path(&mut self, safe_path: &str) -> String {
        let occurrence = {
            let count = self.seen_paths.entry(safe_path.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if occurrence == 1 {
            return safe_path.to_string();
        }
        let mut n = occurrence - 1;
        loop {
            let candidate = suffix_path(safe_path, n);
            if !self.seen_paths.contains_key(&candidate) {
                self.seen_paths.insert(candidate.clone(), 1);
                return candidate;
            }
            n += 1;
        }
    }

    fn write_entry_header(&mut self, header: &mut Header, name: &str) -> Result<(), BundleError> {
        if header.set_path(name).is_err() {
            // GNU long-name record: a type-'L' entry whose body is the path,
            // followed by the real header carrying a truncated name.
            let data = name.as_bytes();
            let mut long = Header::new_gnu();
            long.set_path("././@LongLink")?;
            long.set_size(data.len() as u64);
            long.set_entry_type(EntryType::GNULongName);
            long.set_mode(0o644);
            long.set_cksum();
            let out = self.builder.get_mut();
            out.write_all(long.as_bytes())?;
            out.write_all(data)?;
            pad_to_block(out, data.len() as u64)?;

            let old = header.as_old_mut();
            let take = data.len().min(old.name.len());
            old.name[..take].copy_from_slice(&data[..take]);
        }
        header.set_cksum();
        self.builder.get_mut().write_all(header.as_bytes())?;
        Ok(())
    }
}

/// Reproducible entry metadata: zero timestamps and root ownership so the
/// same inputs always produce the same archive bytes.
fn entry_header(size: u64) -> Result<Header, BundleError> {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_entry_type(EntryType::Regular);
    header.set_username("root")?;
    header.set_groupname("root")?;
    Ok(header)
}

fn pad_to_block(out: &mut impl Write, size: u64) -> std::io::Result<()> {
    let partial = (size % BLOCK_SIZE) as usize;
    if partial != 0 {
        out.write_all(&ZERO_BLOCK[..BLOCK_SIZE as usize - partial])?;
    }
    Ok(())
}

fn suffix_path(path: &str, n: u32) -> String {
    let (dir, file) = match path.rfind('/') {
        Some(slash) => (&path[..=slash], &path[slash + 1..]),
        None => ("", path),
    };
    match file.rfind('.').filter(|&dot| dot > 0) {
        Some(dot) => format!("{dir}{}({n}){}", &file[..dot], &file[dot..]),
        None => format!("{dir}{file}({n})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baler_testutil::unpack_bundle;
    use sha2::{Digest, Sha256};
    use tokio::io::AsyncReadExt;

    async fn artifact_bytes(artifact: &mut BundleArtifact) -> Vec<u8> {
        let mut bytes = Vec::new();
        artifact.reader.read_to_end(&mut bytes).await.unwrap();
        bytes
    }

    #[tokio::test]
    async fn buffered_entries_roundtrip_with_reproducible_metadata() {
        let mut writer = ArchiveWriter::new(SpoolBuffer::new(1024 * 1024));
        writer.append_buffered("a.bin", b"file1 bytes").unwrap();
        writer.append_buffered("d/b.log", b"file2 bytes!").unwrap();
        let mut artifact = writer.finalize().unwrap();
        assert_eq!(artifact.entries, 2);

        let bytes = artifact_bytes(&mut artifact).await;
        assert_eq!(artifact.size_bytes, bytes.len() as u64);
        assert_eq!(artifact.sha256_hex, hex::encode(Sha256::digest(&bytes)));

        let entries = unpack_bundle(&bytes);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("a.bin".to_string(), b"file1 bytes".to_vec()));
        assert_eq!(entries[1], ("d/b.log".to_string(), b"file2 bytes!".to_vec()));

        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(&bytes[..]));
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            assert_eq!(header.username().unwrap(), Some("root"));
            assert_eq!(header.groupname().unwrap(), Some("root"));
        }
    }

    #[tokio::test]
    async fn collisions_get_numbered_suffixes_in_arrival_order() {
        let mut writer = ArchiveWriter::new(SpoolBuffer::new(1024 * 1024));
        assert_eq!(writer.append_buffered("d/b.log", b"one").unwrap(), "d/b.log");
        assert_eq!(
            writer.append_buffered("d/b.log", b"two").unwrap(),
            "d/b(1).log"
        );
        assert_eq!(
            writer.append_buffered("d/b.log", b"three").unwrap(),
            "d/b(2).log"
        );
        assert_eq!(writer.append_buffered("noext", b"x").unwrap(), "noext");
        assert_eq!(writer.append_buffered("noext", b"y").unwrap(), "noext(1)");
        // A natural arrival of an already-generated name stays unique.
        assert_eq!(
            writer.append_buffered("d/b(1).log", b"z").unwrap(),
            "d/b(1)(1).log"
        );

        let mut artifact = writer.finalize().unwrap();
        let bytes = artifact_bytes(&mut artifact).await;
        let names: Vec<String> = unpack_bundle(&bytes).into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["d/b.log", "d/b(1).log", "d/b(2).log", "noext", "noext(1)", "d/b(1)(1).log"]
        );
    }

    #[tokio::test]
    async fn streamed_entries_match_buffered_output() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut streamed = ArchiveWriter::new(SpoolBuffer::new(1024 * 1024));
        let mut body = std::io::Cursor::new(payload.clone());
        streamed
            .append_streamed("big/data.bin", payload.len() as u64, &mut body)
            .await
            .unwrap();
        let mut artifact = streamed.finalize().unwrap();
        let bytes = artifact_bytes(&mut artifact).await;

        let entries = unpack_bundle(&bytes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "big/data.bin");
        assert_eq!(entries[0].1, payload);
    }

    #[tokio::test]
    async fn streamed_entries_support_long_names() {
        let long_name = format!("{}/{}.bin", "nested".repeat(20), "n".repeat(80));
        let payload = vec![7u8; 600];

        let mut writer = ArchiveWriter::new(SpoolBuffer::new(1024 * 1024));
        let mut body = std::io::Cursor::new(payload.clone());
        writer
            .append_streamed(&long_name, payload.len() as u64, &mut body)
            .await
            .unwrap();
        let mut artifact = writer.finalize().unwrap();
        let bytes = artifact_bytes(&mut artifact).await;

        let entries = unpack_bundle(&bytes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, long_name);
        assert_eq!(entries[0].1, payload);
    }

    #[tokio::test]
    async fn short_streams_close_the_writer() {
        let mut writer = ArchiveWriter::new(SpoolBuffer::new(1024 * 1024));
        let mut body = std::io::Cursor::new(vec![1u8; 10]);
        let err = writer
            .append_streamed("short.bin", 20, &mut body)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BundleError::EntryLengthMismatch {
                declared: 20,
                actual: 10,
                ..
            }
        ));
        assert!(matches!(writer.finalize(), Err(BundleError::Aborted)));
    }

    #[tokio::test]
    async fn overlong_streams_close_the_writer() {
        let mut writer = ArchiveWriter::new(SpoolBuffer::new(1024 * 1024));
        let mut body = std::io::Cursor::new(vec![1u8; 30]);
        let err = writer
            .append_streamed("long.bin", 20, &mut body)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BundleError::EntryLengthMismatch { declared: 20, .. }
        ));
    }

    #[tokio::test]
    async fn empty_archive_is_still_a_valid_stream() {
        let writer = ArchiveWriter::new(SpoolBuffer::new(1024));
        let mut artifact = writer.finalize().unwrap();
        assert_eq!(artifact.entries, 0);
        let bytes = artifact_bytes(&mut artifact).await;
        assert!(unpack_bundle(&bytes).is_empty());
    }
}
