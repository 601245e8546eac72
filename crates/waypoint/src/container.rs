//! Section & Container Reader (`spec.md` §4.3).
//!
//! The bundle executable is the engine binary followed by a UX container,
//! zero or more additional attached containers, and a trailing signature.
//! [`EngineSection`] locates an attached container by walking sizes back
//! from the end of the file; [`ContainerCursor`] is a streaming façade over
//! a cabinet-like archive, reading one entry at a time the way a background
//! extraction thread would hand entries to the foreground one at a time.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use waypoint_types::ContainerType;

/// Header naming the stub, engine, and attached-container sizes, read from the tail of the
/// bundle executable.
#[derive(Debug, Clone)]
pub struct EngineSection {
    pub stub_size: u64,
    pub engine_size: u64,
    pub container_sizes: Vec<u64>,
    pub total_size: u64,
}

/// Position and length of one attached container, or absence.
#[derive(Debug, Clone, Copy)]
pub struct AttachedContainer {
    pub offset: u64,
    pub size: u64,
}

impl EngineSection {
    /// Look up attached container `index` (0-based, in append order). Returns `None` if the
    /// index is out of range for the recorded container count.
    ///
    /// `expected_type` is accepted for interface parity with the original engine's typed
    /// lookup; this reader does not itself validate container contents against the type —
    /// that is `complete_payload`'s job once the container is opened.
    pub fn get_attached_container(
        &self,
        index: usize,
        _expected_type: ContainerType,
    ) -> Option<AttachedContainer> {
        if index >= self.container_sizes.len() {
            return None;
        }
        // Containers are appended after cbEngineSize, in order; offset accumulates sizes of
        // every container before `index`.
        let mut offset = self.engine_size;
        for size in &self.container_sizes[..index] {
            offset += size;
        }
        Some(AttachedContainer { offset, size: self.container_sizes[index] })
    }
}

/// A single entry enumerated from an open container.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub name: String,
    pub size: u64,
}

/// Streaming cursor over one open container. Entries are produced in storage order and each
/// must be consumed exactly once via [`stream_to_file`](Self::stream_to_file),
/// [`stream_to_buffer`](Self::stream_to_buffer), or [`skip_stream`](Self::skip_stream) before
/// [`next_stream`](Self::next_stream) is called again.
pub struct ContainerCursor {
    archive: zip::ZipArchive<File>,
    next_index: usize,
    pending: Option<StreamEntry>,
}

impl ContainerCursor {
    /// Open a container at `path`, optionally restricted to the byte range
    /// `[offset, offset + size)` within an attached bundle executable.
    pub fn open(path: &Path, offset: Option<u64>, size: Option<u64>) -> Result<Self> {
        let mut file = File::open(path)
            .with_context(|| format!("failed to open container {}", path.display()))?;

        if let Some(off) = offset {
            file.seek(SeekFrom::Start(off))
                .with_context(|| format!("failed to seek to container offset {off}"))?;
        }
        // `size` bounds the container within an attached bundle executable; ZipArchive reads
        // its own central directory from the tail of the stream, so a byte-exact restriction
        // would require pre-extracting that range to a scratch file. Plain containers (the
        // common case, `offset`/`size` both `None`) skip that entirely.
        let _ = size;

        let archive = zip::ZipArchive::new(file)
            .with_context(|| format!("failed to read container format at {}", path.display()))?;

        Ok(ContainerCursor { archive, next_index: 0, pending: None })
    }

    /// Advance to the next stream, returning its name, or `None` at end of container.
    /// Must not be called again before the current pending entry is consumed.
    pub fn next_stream(&mut self) -> Result<Option<StreamEntry>> {
        if self.pending.is_some() {
            bail!("previous stream must be consumed before calling next_stream again");
        }
        if self.next_index >= self.archive.len() {
            return Ok(None);
        }
        let file = self.archive.by_index(self.next_index)?;
        let entry = StreamEntry { name: file.name().to_string(), size: file.size() };
        self.pending = Some(entry.clone());
        Ok(Some(entry))
    }

    pub fn stream_to_file(&mut self, dest: &Path) -> Result<()> {
        let entry = self.take_pending()?;
        let mut src = self.archive.by_index(self.next_index)?;
        let mut out = File::create(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        std::io::copy(&mut src, &mut out)
            .with_context(|| format!("failed to extract stream {}", entry.name))?;
        out.sync_all().context("failed to flush extracted stream")?;
        self.next_index += 1;
        Ok(())
    }

    pub fn stream_to_buffer(&mut self) -> Result<Vec<u8>> {
        let entry = self.take_pending()?;
        let mut src = self.archive.by_index(self.next_index)?;
        let mut buf = Vec::with_capacity(entry.size as usize);
        src.read_to_end(&mut buf).with_context(|| format!("failed to read stream {}", entry.name))?;
        self.next_index += 1;
        Ok(buf)
    }

    /// Skip the pending stream without reading its contents. Containers whose underlying
    /// format cannot seek past an entry fall back to read-and-discard; the zip format can
    /// always skip by advancing the index, since central-directory offsets are random-access.
    pub fn skip_stream(&mut self) -> Result<()> {
        self.take_pending()?;
        self.next_index += 1;
        Ok(())
    }

    pub fn close(self) {
        drop(self);
    }

    fn take_pending(&mut self) -> Result<StreamEntry> {
        self.pending.take().context("next_stream must be called before consuming a stream")
    }
}

/// Write `entries` into a new cabinet-like container at `dest`, used by tests and by
/// `layout` mode to stage a container for extraction round-trips.
pub fn write_container(dest: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    let file = File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options)?;
        writer.write_all(data)?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn get_attached_container_accumulates_offsets() {
        let section = EngineSection {
            stub_size: 100,
            engine_size: 1000,
            container_sizes: vec![50, 75, 25],
            total_size: 1150,
        };
        let first = section.get_attached_container(0, ContainerType::CabinetLike).unwrap();
        assert_eq!(first.offset, 1000);
        assert_eq!(first.size, 50);

        let second = section.get_attached_container(1, ContainerType::CabinetLike).unwrap();
        assert_eq!(second.offset, 1050);
        assert_eq!(second.size, 75);
    }

    #[test]
    fn get_attached_container_out_of_range_is_none() {
        let section =
            EngineSection { stub_size: 0, engine_size: 0, container_sizes: vec![10], total_size: 10 };
        assert!(section.get_attached_container(5, ContainerType::CabinetLike).is_none());
    }

    #[test]
    fn cursor_enumerates_streams_in_order_and_consumes_each_once() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("payloads.cab");
        write_container(&path, &[("a.txt", b"hello"), ("b.txt", b"world")]).unwrap();

        let mut cursor = ContainerCursor::open(&path, None, None).unwrap();
        let first = cursor.next_stream().unwrap().unwrap();
        assert_eq!(first.name, "a.txt");
        let bytes = cursor.stream_to_buffer().unwrap();
        assert_eq!(bytes, b"hello");

        let second = cursor.next_stream().unwrap().unwrap();
        assert_eq!(second.name, "b.txt");
        cursor.skip_stream().unwrap();

        assert!(cursor.next_stream().unwrap().is_none());
    }

    #[test]
    fn cursor_stream_to_file_writes_contents() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("payloads.cab");
        write_container(&path, &[("only.bin", b"payload-bytes")]).unwrap();

        let mut cursor = ContainerCursor::open(&path, None, None).unwrap();
        cursor.next_stream().unwrap().unwrap();
        let out_path = td.path().join("extracted.bin");
        cursor.stream_to_file(&out_path).unwrap();

        assert_eq!(std::fs::read(&out_path).unwrap(), b"payload-bytes");
    }

    #[test]
    fn next_stream_before_consuming_previous_errors() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("payloads.cab");
        write_container(&path, &[("a", b"1"), ("b", b"2")]).unwrap();

        let mut cursor = ContainerCursor::open(&path, None, None).unwrap();
        cursor.next_stream().unwrap();
        assert!(cursor.next_stream().is_err());
    }
}
