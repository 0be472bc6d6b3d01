use std::{
  fs::OpenOptions,
  io::{self, BufWriter, Seek, SeekFrom, Write},
  path::{Path, PathBuf},
  process,
};

use memmap2::MmapMut;

/// Abstract byte destination for the record stream.
///
/// The writer holds exactly one sink and mutates it only under its own
/// mutex; sinks never need internal locking.
pub trait Sink: Send {
  /// Append `data` in full or fail; partial writes are never reported.
  fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

  /// Push buffered bytes toward the OS.
  fn flush(&mut self) -> io::Result<()>;

  /// Reposition the write cursor. Non-seekable sinks return an error, which
  /// callers treat as a refusal rather than a stream failure.
  fn seek(&mut self, position: SeekFrom) -> io::Result<u64>;

  /// Produce a replacement sink for a freshly forked child, or `None` when
  /// this sink cannot be safely continued there.
  fn clone_in_child(&self) -> Option<Box<dyn Sink>>;
}

/// Buffered file sink. Seekable; a forked child gets its own sibling file
/// suffixed with the child pid.
pub struct FileSink {
  writer: BufWriter<std::fs::File>,
  path: PathBuf,
}

impl FileSink {
  /// # Errors
  ///
  /// Returns an error if the file cannot be created.
  pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
    let path = path.as_ref().to_path_buf();
    let file = std::fs::File::create(&path)?;

    Ok(Self {
      writer: BufWriter::new(file),
      path,
    })
  }

  #[must_use]
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Sink for FileSink {
  fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
    self.writer.write_all(data)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.writer.flush()
  }

  fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
    self.writer.seek(position)
  }

  fn clone_in_child(&self) -> Option<Box<dyn Sink>> {
    let mut filename = self.path.as_os_str().to_owned();
    filename.push(format!(".{}", process::id()));

    FileSink::create(PathBuf::from(filename))
      .ok()
      .map(|sink| Box::new(sink) as Box<dyn Sink>)
  }
}

/// Sink backed by a fixed-size memory-mapped file.
///
/// Writes past the reserved capacity fail, which deactivates tracking; that
/// is the intended back-pressure behavior.
pub struct MmapSink {
  mmap: MmapMut,
  position: usize,
}

impl MmapSink {
  /// # Errors
  ///
  /// Returns an error if the backing file cannot be created, resized, or
  /// mapped into memory.
  pub fn create(path: impl AsRef<Path>, capacity: usize) -> io::Result<Self> {
    let capacity = capacity.max(1);

    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .read(true)
      .truncate(true)
      .open(path)?;

    let capacity_u64 = u64::try_from(capacity)
      .map_err(|_| io::Error::other("capacity exceeds u64"))?;

    file.set_len(capacity_u64)?;

    // SAFETY: the file handle remains open for the lifetime of the mapping.
    let mmap = unsafe { MmapMut::map_mut(&file)? };

    Ok(Self { mmap, position: 0 })
  }
}

impl Sink for MmapSink {
  fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
    let Some(end) = self.position.checked_add(data.len()) else {
      return Err(io::Error::other("mmap position overflow"));
    };

    if end > self.mmap.len() {
      return Err(io::Error::new(
        io::ErrorKind::WriteZero,
        "mmap capacity exceeded",
      ));
    }

    self.mmap[self.position..end].copy_from_slice(data);
    self.position = end;

    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.mmap.flush_async()
  }

  fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
    let target = match position {
      SeekFrom::Start(offset) => i128::from(offset),
      SeekFrom::Current(delta) => self.position as i128 + i128::from(delta),
      SeekFrom::End(delta) => self.mmap.len() as i128 + i128::from(delta),
    };

    if target < 0 || target > self.mmap.len() as i128 {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "seek outside the mapped region",
      ));
    }

    self.position = target as usize;
    Ok(self.position as u64)
  }

  fn clone_in_child(&self) -> Option<Box<dyn Sink>> {
    // The mapping is shared with the parent after fork; interleaving two
    // writers through it would corrupt the stream.
    None
  }
}
