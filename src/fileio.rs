//! Positional file I/O.
//!
//! Every data and free-list access addresses an absolute offset, so reads
//! never share a cursor with concurrent writers on the same `File`.

use std::fs::File;
use std::io;

#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Number of 512-byte blocks the file occupies on disk.
#[cfg(unix)]
pub fn disk_blocks(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks()
}

#[cfg(not(unix))]
pub fn disk_blocks(meta: &std::fs::Metadata) -> u64 {
    meta.len().div_ceil(512)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_roundtrip() -> io::Result<()> {
        let file = tempfile::tempfile()?;
        write_all_at(&file, b"world", 6)?;
        write_all_at(&file, b"hello ", 0)?;

        let mut buf = [0u8; 11];
        read_exact_at(&file, &mut buf, 0)?;
        assert_eq!(&buf, b"hello world");
        Ok(())
    }

    #[test]
    fn test_short_read_is_eof() -> io::Result<()> {
        let file = tempfile::tempfile()?;
        write_all_at(&file, b"abc", 0)?;

        let mut buf = [0u8; 8];
        let err = read_exact_at(&file, &mut buf, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        Ok(())
    }
}
