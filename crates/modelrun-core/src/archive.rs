//! Tar bundle validation, extraction and creation.
//!
//! Input bundles may be plain or gzip-compressed tar files; the codec sniffs
//! the gzip magic rather than trusting the `.tar` suffix. Output bundles are
//! always gzip-compressed and published atomically (temp file, then rename).

use crate::error::{Result, WorkerError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};
use tempfile::NamedTempFile;
use tracing::debug;

/// Suffix shared by input and output bundles.
pub const ARCHIVE_SUFFIX: &str = ".tar";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Facts about an archive the codec just wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex SHA-256 of the archive bytes as written.
    pub sha256: String,
}

/// Stateless tar codec.
pub struct ArchiveCodec;

impl ArchiveCodec {
    /// Whether `path` exists and parses as a tar container (plain or gzip).
    ///
    /// Every header is read, so truncated or garbage files are rejected. An
    /// empty file is not a valid archive.
    pub fn validate(path: &Path) -> bool {
        match Self::list_entries(path) {
            Ok(_) => true,
            Err(e) => {
                debug!(archive = %path.display(), err = %e, "archive failed validation");
                false
            }
        }
    }

    /// List entry paths in archive order.
    pub fn list_entries(path: &Path) -> Result<Vec<String>> {
        let mut archive = Archive::new(open_reader(path)?);
        let mut names = Vec::new();
        let entries = archive
            .entries()
            .map_err(|_| WorkerError::MalformedArchive(path.to_path_buf()))?;
        for entry in entries {
            let entry = entry.map_err(|_| WorkerError::MalformedArchive(path.to_path_buf()))?;
            let name = entry
                .path()
                .map_err(|_| WorkerError::MalformedArchive(path.to_path_buf()))?
                .to_string_lossy()
                .to_string();
            names.push(name);
        }
        Ok(names)
    }

    /// Extract `path` into `dest`, creating `dest` only if the archive has entries.
    ///
    /// Absolute paths and `..` components are rejected before anything is
    /// written for that entry.
    pub fn extract(path: &Path, dest: &Path) -> Result<()> {
        let mut archive = Archive::new(open_reader(path)?);
        archive.set_preserve_permissions(false);
        let entries = archive
            .entries()
            .map_err(|_| WorkerError::MalformedArchive(path.to_path_buf()))?;

        let mut count = 0usize;
        for entry in entries {
            let mut entry = entry.map_err(|_| WorkerError::MalformedArchive(path.to_path_buf()))?;
            let entry_path = entry
                .path()
                .map_err(|_| WorkerError::MalformedArchive(path.to_path_buf()))?
                .to_path_buf();
            if !is_safe_entry_path(&entry_path) {
                return Err(WorkerError::UnsafeArchiveEntry {
                    archive: path.to_path_buf(),
                    entry: entry_path.to_string_lossy().to_string(),
                });
            }
            let entry_type = entry.header().entry_type();
            if entry_type.is_symlink() || entry_type.is_hard_link() {
                return Err(WorkerError::UnsafeArchiveEntry {
                    archive: path.to_path_buf(),
                    entry: entry_path.to_string_lossy().to_string(),
                });
            }
            if count == 0 {
                std::fs::create_dir_all(dest)
                    .map_err(|e| WorkerError::io(format!("creating {}", dest.display()), e))?;
            }
            entry.unpack_in(dest).map_err(|e| {
                WorkerError::io(
                    format!("extracting {} from {}", entry_path.display(), path.display()),
                    e,
                )
            })?;
            count += 1;
        }

        debug!(archive = %path.display(), dest = %dest.display(), entries = count, "archive extracted");
        Ok(())
    }

    /// Create a gzip-compressed tar of `source_dir` at `dest`.
    ///
    /// The directory is stored under `internal_name` whatever its own name
    /// is. The archive is staged next to `dest` and renamed into place;
    /// an existing file at `dest` is never overwritten.
    pub fn create(source_dir: &Path, dest: &Path, internal_name: &str) -> Result<ArchiveSummary> {
        if !source_dir.is_dir() {
            return Err(WorkerError::io(
                format!("archiving {}", source_dir.display()),
                io::Error::new(io::ErrorKind::NotFound, "source directory not found"),
            ));
        }
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let staged = NamedTempFile::new_in(parent)
            .map_err(|e| WorkerError::io(format!("staging archive in {}", parent.display()), e))?;

        let writer = HashingWriter::new(staged);
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(internal_name, source_dir)
            .map_err(|e| WorkerError::io(format!("archiving {}", source_dir.display()), e))?;
        let encoder = builder
            .into_inner()
            .map_err(|e| WorkerError::io("finishing tar stream", e))?;
        let mut writer = encoder
            .finish()
            .map_err(|e| WorkerError::io("finishing gzip stream", e))?;
        writer
            .flush()
            .map_err(|e| WorkerError::io("flushing archive", e))?;
        let (staged, size_bytes, sha256) = writer.finish();

        staged
            .persist_noclobber(dest)
            .map_err(|e| WorkerError::io(format!("publishing archive {}", dest.display()), e.error))?;

        debug!(archive = %dest.display(), size_bytes, "archive created");
        Ok(ArchiveSummary {
            path: dest.to_path_buf(),
            size_bytes,
            sha256,
        })
    }
}

/// Open an archive for reading, transparently decompressing gzip.
fn open_reader(path: &Path) -> Result<Box<dyn Read>> {
    let mut file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            WorkerError::InputNotFound(path.to_path_buf())
        } else {
            WorkerError::io(format!("opening {}", path.display()), e)
        }
    })?;

    let mut magic = [0u8; 2];
    let read = read_up_to(&mut file, &mut magic)
        .map_err(|e| WorkerError::io(format!("reading {}", path.display()), e))?;
    if read == 0 {
        return Err(WorkerError::MalformedArchive(path.to_path_buf()));
    }
    file.seek(SeekFrom::Start(0))
        .map_err(|e| WorkerError::io(format!("rewinding {}", path.display()), e))?;

    let reader = BufReader::new(file);
    if read == 2 && magic == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn is_safe_entry_path(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Writer adapter that counts and hashes everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, u64, String) {
        (self.inner, self.written, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
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
