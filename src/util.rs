//! Small filesystem helpers shared by the store and container modules.

use std::{
    convert::TryInto,
    fmt::Display,
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::error::{Error, Result};

/// Open `path` for read+write, creating the file (and its parent
/// directories) when `create` is true. Fails with `AlreadyExists` when
/// `create` is true and the file is already present.
pub(crate) fn open_file_rw(path: &Path, create: bool) -> Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.read(true).write(true);
    if create {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        opts.create_new(true);
    }
    opts.open(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::AlreadyExists => {
            Error::AlreadyExists(path.display().to_string())
        }
        std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Io(err),
    })
}

/// Open an existing file for read+write without creating it.
pub(crate) fn open_file_existing(path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(err),
        })
}

pub(crate) fn try_convert<T, U>(from: T, msg: &str) -> Result<U>
where
    T: Copy + Display + TryInto<U>,
{
    from.try_into()
        .map_err(|_| Error::InvalidArgument(format!("{} for {}", msg, from)))
}

/// Read exactly `n` bytes starting at `fpos`. Fails if the file is
/// shorter than `fpos + n`.
pub(crate) fn read_at(fd: &mut fs::File, fpos: u64, n: usize) -> Result<Vec<u8>> {
    fd.seek(SeekFrom::Start(fpos))?;
    let mut buf = vec![0u8; n];
    fd.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write `buf` at `fpos`, extending the file if necessary.
pub(crate) fn write_at(fd: &mut fs::File, fpos: u64, buf: &[u8]) -> Result<()> {
    fd.seek(SeekFrom::Start(fpos))?;
    fd.write_all(buf)?;
    Ok(())
}

/// `+x` bits derived from the read/write bits of `mode`, the way
/// directory permissions are derived from a file creation mode.
#[cfg(unix)]
pub(crate) fn dir_mode_from_file_mode(mode: u32) -> u32 {
    let mut dmode = mode;
    if mode & 0o400 != 0 {
        dmode |= 0o100;
    }
    if mode & 0o040 != 0 {
        dmode |= 0o010;
    }
    if mode & 0o004 != 0 {
        dmode |= 0o001;
    }
    dmode
}
