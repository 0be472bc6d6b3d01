use std::{fs, io};

use crate::records::{ImageSegments, Segment};

/// Read the process's current image mappings for the memory-map records.
///
/// # Errors
///
/// Returns an error if `/proc/self/maps` cannot be read.
pub(crate) fn collect_image_segments() -> io::Result<Vec<ImageSegments>> {
  let content = fs::read_to_string("/proc/self/maps")?;
  Ok(parse_maps(&content))
}

/// Group file-backed mappings by image, computing each image's load base
/// from its first mapping and describing every mapping as a segment
/// relative to that base.
fn parse_maps(content: &str) -> Vec<ImageSegments> {
  let mut images: Vec<ImageSegments> = Vec::new();

  for line in content.lines() {
    let Some(mapping) = parse_line(line) else {
      continue;
    };

    let Some(pathname) = mapping.pathname else {
      continue;
    };

    // Pseudo-files ([heap], [stack], ...) and the vdso cannot be resolved
    // to anything on disk.
    if pathname.starts_with('[') || pathname.starts_with("linux-vdso") {
      continue;
    }

    let base = mapping.start.wrapping_sub(mapping.offset);

    let segment = Segment {
      vaddr: mapping.start.wrapping_sub(base),
      memsz: mapping.end.saturating_sub(mapping.start),
    };

    match images.last_mut() {
      Some(image) if image.filename == pathname && image.addr == base => {
        image.segments.push(segment);
      }
      _ => {
        images.push(ImageSegments {
          filename: pathname,
          addr: base,
          segments: vec![segment],
        });
      }
    }
  }

  images
}

struct Mapping {
  start: u64,
  end: u64,
  offset: u64,
  pathname: Option<String>,
}

fn parse_line(line: &str) -> Option<Mapping> {
  let mut parts = line.split_whitespace();

  let range = parts.next()?;
  let _perms = parts.next()?;
  let offset = u64::from_str_radix(parts.next()?, 16).ok()?;
  let _dev = parts.next()?;
  let _inode = parts.next()?;
  let pathname = parts.next().map(str::to_string);

  let (start, end) = range.split_once('-')?;

  Some(Mapping {
    start: u64::from_str_radix(start, 16).ok()?,
    end: u64::from_str_radix(end, 16).ok()?,
    offset,
    pathname,
  })
}
