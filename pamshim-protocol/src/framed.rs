use std::{
    fs::File,
    io::{Read, Write},
    os::unix::io::{FromRawFd, OwnedFd, RawFd},
};

use byteorder::{ByteOrder, NativeEndian};

use crate::error::{ProtocolError, Result};

/// Size of the scratch buffer a [`FramedStream`] uses for read-ahead or
/// write-back. The buffer is never used for both at once.
pub const BUF_SIZE: usize = 4096;

/// Which direction the scratch buffer currently holds data for. A freshly
/// constructed stream, or one that just flushed, is `Empty` and may switch
/// to either direction on the next call.
enum BufState {
    Empty,
    Reading { pos: usize, len: usize },
    Writing { len: usize },
}

/// An owned file descriptor plus a single fixed-size buffer used either for
/// read-ahead or write-back, never both at once.
///
/// Closes the descriptor on drop. Every request and response sent over the
/// IPC pipes passes through a `FramedStream` on each side.
pub struct FramedStream {
    file: File,
    buf: Box<[u8; BUF_SIZE]>,
    state: BufState,
}

impl FramedStream {
    /// Takes ownership of `fd`, which will be closed when the returned
    /// stream is dropped.
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        FramedStream { file: File::from(fd), buf: Box::new([0u8; BUF_SIZE]), state: BufState::Empty }
    }

    /// # Safety
    /// `fd` must be a valid, open file descriptor that nothing else closes.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::from_owned_fd(OwnedFd::from_raw_fd(fd))
    }

    /// Reads exactly `out.len()` bytes, refilling from the kernel as
    /// needed. Fails with [`ProtocolError::Io`] on short read (EOF) or
    /// error; no partial read is ever visible to the caller.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        debug_assert!(
            !matches!(self.state, BufState::Writing { .. }),
            "read issued while a buffered write is pending"
        );

        let mut filled = 0;
        while filled < out.len() {
            let (pos, len) = match self.state {
                BufState::Reading { pos, len } if pos < len => (pos, len),
                _ => {
                    let n = self.file.read(&mut self.buf[..])?;
                    if n == 0 {
                        return Err(ProtocolError::unexpected_eof());
                    }
                    self.state = BufState::Reading { pos: 0, len: n };
                    (0, n)
                }
            };

            let available = len - pos;
            let want = out.len() - filled;
            let take = available.min(want);
            out[filled..filled + take].copy_from_slice(&self.buf[pos..pos + take]);
            filled += take;
            self.state = BufState::Reading { pos: pos + take, len };
        }

        Ok(())
    }

    /// Appends `data` to the internal buffer, flushing to the kernel
    /// whenever the buffer fills. Does not guarantee a syscall per call.
    pub fn write_exact(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(
            !matches!(self.state, BufState::Reading { .. }),
            "write issued while buffered read-ahead is pending"
        );

        let mut written = 0;
        while written < data.len() {
            let used = match self.state {
                BufState::Writing { len } => len,
                _ => 0,
            };
            let space = BUF_SIZE - used;
            if space == 0 {
                self.flush()?;
                continue;
            }
            let take = space.min(data.len() - written);
            self.buf[used..used + take].copy_from_slice(&data[written..written + take]);
            written += take;
            self.state = BufState::Writing { len: used + take };
        }
        Ok(())
    }

    /// Drains any buffered bytes to the kernel. Mandatory at message
    /// boundaries on the writing side. A no-op on an already-empty buffer.
    pub fn flush(&mut self) -> Result<()> {
        let len = match self.state {
            BufState::Writing { len } => len,
            _ => {
                self.state = BufState::Empty;
                return Ok(());
            }
        };

        let mut off = 0;
        while off < len {
            let n = self.file.write(&self.buf[off..len])?;
            if n == 0 {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write flushing framed stream",
                )));
            }
            off += n;
        }
        self.state = BufState::Empty;
        Ok(())
    }

    pub(crate) fn write_u32(&mut self, v: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        NativeEndian::write_u32(&mut buf, v);
        self.write_exact(&buf)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(NativeEndian::read_u32(&buf))
    }

    pub(crate) fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_u32(v as u32)
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub(crate) fn write_u64(&mut self, v: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        NativeEndian::write_u64(&mut buf, v);
        self.write_exact(&buf)
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(NativeEndian::read_u64(&buf))
    }

    pub(crate) fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_u64(v as u64)
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::AsRawFd;

    use super::*;

    fn pipe_pair() -> (FramedStream, FramedStream) {
        let mut fds = [0 as RawFd; 2];
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(res, 0, "pipe(2) failed");
        let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        (FramedStream::from_owned_fd(r), FramedStream::from_owned_fd(w))
    }

    #[test]
    fn write_then_read_exact_round_trips() {
        let (mut r, mut w) = pipe_pair();
        w.write_exact(b"hello world").unwrap();
        w.flush().unwrap();

        let mut out = [0u8; 11];
        r.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn flush_is_noop_on_empty_buffer() {
        let (_r, mut w) = pipe_pair();
        w.flush().unwrap();
        w.flush().unwrap();
    }

    #[test]
    fn write_spanning_multiple_buffer_fills() {
        let (mut r, mut w) = pipe_pair();
        let data = vec![0x5au8; BUF_SIZE * 3 + 17];
        let w_fd = w.file.as_raw_fd();
        let writer = std::thread::spawn(move || {
            w.write_exact(&data).unwrap();
            w.flush().unwrap();
            let _ = w_fd;
        });

        let mut out = vec![0u8; BUF_SIZE * 3 + 17];
        r.read_exact(&mut out).unwrap();
        writer.join().unwrap();
        assert!(out.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn read_exact_fails_on_eof() {
        let (mut r, w) = pipe_pair();
        drop(w);
        let mut out = [0u8; 4];
        let err = r.read_exact(&mut out).unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
