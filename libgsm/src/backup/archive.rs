use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, write::GzEncoder};
use tar::{Builder, EntryType, Header};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{LifecycleError, Result};

/// Result of [`write_archive`].
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Archive renamed into place, with its final size.
    Written(u64),
    /// The token fired mid-write; nothing was left behind.
    Cancelled,
}

/// Hidden sibling a new archive is written to before it is renamed to `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.partial"))
}

/// Snapshot `source` into a tar (gzip'd when `compress`) at `dest`.
///
/// Entries are stored under the source directory's own name so the archive extracts to a
/// `worlds_local/...` style tree. `dest` only ever appears complete: the data is written to
/// [`partial_path`], synced, then linked into place. Neither the partial file nor `dest` is
/// ever overwritten; an existing one is an error. On cancellation or error the partial file
/// is removed. Blocking; run it on a blocking thread.
pub fn write_archive(
    source: &Path,
    dest: &Path,
    compress: bool,
    cancel: &CancellationToken,
) -> Result<WriteOutcome> {
    let partial = partial_path(dest);
    let file = match OpenOptions::new().write(true).create_new(true).open(&partial) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(LifecycleError::Archive(format!(
                "partial archive already exists: {}",
                partial.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let written = write_partial(file, source, compress, cancel);
    match written {
        Ok(true) => {}
        Ok(false) => {
            discard(&partial);
            return Ok(WriteOutcome::Cancelled);
        }
        Err(e) => {
            discard(&partial);
            return Err(e);
        }
    }

    // A hard link fails instead of replacing an archive that is already there.
    let linked = fs::hard_link(&partial, dest);
    discard(&partial);
    match linked {
        Ok(()) => Ok(WriteOutcome::Written(fs::metadata(dest)?.len())),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LifecycleError::Archive(
            format!("archive already exists: {}", dest.display()),
        )),
        Err(e) => Err(e.into()),
    }
}

fn discard(partial: &Path) {
    if let Err(e) = fs::remove_file(partial) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %partial.display(), error = %e, "failed to remove partial archive");
        }
    }
}

/// `Ok(false)` when cancelled.
fn write_partial(
    file: File,
    source: &Path,
    compress: bool,
    cancel: &CancellationToken,
) -> Result<bool> {
    let writer = BufWriter::new(file);

    if compress {
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut builder = Builder::new(encoder);
        if !append_tree(&mut builder, source, cancel)? {
            return Ok(false);
        }
        let encoder = builder.into_inner()?;
        let writer = encoder.finish()?;
        sync(writer)?;
    } else {
        let mut builder = Builder::new(writer);
        if !append_tree(&mut builder, source, cancel)? {
            return Ok(false);
        }
        sync(builder.into_inner()?)?;
    }
    Ok(true)
}

fn sync(writer: BufWriter<File>) -> Result<()> {
    let file = writer
        .into_inner()
        .map_err(|e| LifecycleError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    source: &Path,
    cancel: &CancellationToken,
) -> Result<bool> {
    if !source.is_dir() {
        return Err(LifecycleError::Archive(format!(
            "source is not a directory: {}",
            source.display()
        )));
    }
    let prefix = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "world".to_string());

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let entry = entry.map_err(|e| LifecycleError::Archive(format!("walk failed: {e}")))?;
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(source) else {
            continue;
        };
        let name = if relative.as_os_str().is_empty() {
            prefix.clone()
        } else {
            format!("{prefix}/{}", relative.to_string_lossy())
        };

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                // The game may rotate files while we walk; skip what vanished.
                warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let file_type = metadata.file_type();
        if file_type.is_file() {
            if let Err(e) = append_file(builder, path, &name, &metadata, cancel) {
                if cancel.is_cancelled() {
                    return Ok(false);
                }
                return Err(e);
            }
        } else if file_type.is_dir() {
            append_dir(builder, path, &name, &metadata)?;
        } else if file_type.is_symlink() {
            append_symlink(builder, path, &name, &metadata)?;
        } else {
            warn!(path = %path.display(), "skipping special file");
        }
    }
    Ok(true)
}

fn append_file<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    name: &str,
    metadata: &Metadata,
    cancel: &CancellationToken,
) -> Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "file disappeared during backup");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    header.set_size(metadata.len());
    builder
        .append_data(&mut header, name, CancelRead::new(BufReader::new(file), cancel))
        .map_err(|e| {
            LifecycleError::Archive(format!("failed to append {}: {e}", path.display()))
        })
}

/// Fails the next read once the token fires, so one large world file cannot hold a
/// cancelled backup open.
struct CancelRead<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<'a, R: Read> CancelRead<'a, R> {
    fn new(inner: R, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancelRead<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("backup cancelled"));
        }
        self.inner.read(buf)
    }
}

fn append_dir<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    name: &str,
    metadata: &Metadata,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    header.set_size(0);
    header.set_entry_type(EntryType::Directory);
    builder
        .append_data(&mut header, format!("{name}/"), io::empty())
        .map_err(|e| {
            LifecycleError::Archive(format!("failed to append {}: {e}", path.display()))
        })
}

fn append_symlink<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    name: &str,
    metadata: &Metadata,
) -> Result<()> {
    let target = fs::read_link(path)?;
    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    header.set_size(0);
    header.set_entry_type(EntryType::Symlink);
    builder
        .append_link(&mut header, name, &target)
        .map_err(|e| {
            LifecycleError::Archive(format!("failed to append {}: {e}", path.display()))
        })
}
