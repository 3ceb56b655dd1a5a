//! Named pipe (FIFO) helpers.
//!
//! Opening a FIFO blocks until the other end is opened too, so the server and the client
//! must open their three session pipes in the same order.
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd;
use tracing::{debug, info};

use crate::{KvsError, Result};

/// permissions of every pipe created by the server and its clients
pub const PIPE_PERMISSIONS: u32 = 0o640;

/// creates a FIFO at `path`, replacing whatever file was there
pub fn create_pipe(path: &Path) -> Result<()> {
    unlink_pipe(path)?;
    unistd::mkfifo(path, Mode::from_bits_truncate(PIPE_PERMISSIONS))?;
    info!("pipe {:?} created", path);
    Ok(())
}

/// removes the FIFO at `path`. A missing file is not an error.
pub fn unlink_pipe(path: &Path) -> Result<()> {
    match unistd::unlink(path) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// opens the reading end of the pipe at `path`, blocking until a writer shows up
pub fn open_reader(path: &Path) -> Result<File> {
    let file = File::open(path).map_err(|e| KvsError::channel(path.display().to_string(), e))?;
    debug!("opened {:?} for reading", path);
    Ok(file)
}

/// opens the writing end of the pipe at `path`, blocking until a reader shows up
pub fn open_writer(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| KvsError::channel(path.display().to_string(), e))?;
    debug!("opened {:?} for writing", path);
    Ok(file)
}

/// Opens and immediately closes the writing end of the pipe at `path` without blocking.
///
/// A reader blocked in `open` wakes up and then sees an end of file. Returns `false` if
/// nobody has the pipe open for reading.
pub fn poke(path: &Path) -> io::Result<bool> {
    match OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
    {
        Ok(_file) => Ok(true),
        Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Writes a single zero byte to the pipe at `path` without blocking.
///
/// A reader blocked in `read` wakes up with that byte, which is not a valid opcode. Returns
/// `false` if nobody has the pipe open for reading.
pub fn nudge(path: &Path) -> io::Result<bool> {
    let mut pipe = match OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
    {
        Ok(pipe) => pipe,
        Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => return Ok(false),
        Err(e) => return Err(e),
    };
    match pipe.write(&[0]) {
        Ok(_) => Ok(true),
        // a full pipe already has bytes for the reader
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::fs::FileTypeExt;
    use std::thread;

    #[test]
    fn created_pipes_are_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        std::fs::write(&path, b"stale").unwrap();

        create_pipe(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        unlink_pipe(&path).unwrap();
        assert!(!path.exists());
        unlink_pipe(&path).unwrap();
    }

    #[test]
    fn poke_without_reader_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        create_pipe(&path).unwrap();
        assert!(!poke(&path).unwrap());
    }

    #[test]
    fn bytes_flow_from_writer_to_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        create_pipe(&path).unwrap();

        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            let mut pipe = open_writer(&writer_path).unwrap();
            pipe.write_all(b"hello").unwrap();
        });
        let mut pipe = open_reader(&path).unwrap();
        let mut received = String::new();
        pipe.read_to_string(&mut received).unwrap();
        writer.join().unwrap();
        assert_eq!(received, "hello");
    }

    #[test]
    fn nudge_wakes_a_blocked_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        create_pipe(&path).unwrap();
        assert!(!nudge(&path).unwrap());

        let reader_path = path.clone();
        let reader = thread::spawn(move || {
            let mut pipe = open_reader(&reader_path).unwrap();
            let mut byte = [0xffu8; 1];
            pipe.read_exact(&mut byte).unwrap();
            byte[0]
        });
        // held open for the whole test, so the reader never sees an end of file
        let _writer = open_writer(&path).unwrap();
        assert!(nudge(&path).unwrap());
        assert_eq!(reader.join().unwrap(), 0);
    }
}
