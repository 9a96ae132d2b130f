use std::fs::File;
use std::io;

/// Positional, non-owning read access to an RBF byte source.
///
/// Implementations must not move any shared cursor: two reads at the same
/// offset return the same bytes as long as nothing was appended in between.
/// A short count means end of file, never an error.
pub trait RandomRead {
    /// Read up to `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Fill as much of `buf` as the source allows, looping over short reads.
    ///
    /// Returns fewer than `buf.len()` bytes only at end of file.
    fn read_full_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0usize;
        while total < buf.len() {
            match self.read_at(offset + total as u64, &mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

impl RandomRead for &File {
    #[cfg(unix)]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::read_at(*self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_read(*self, buf, offset)
    }
}

impl RandomRead for File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        RandomRead::read_at(&mut &*self, offset, buf)
    }
}

impl RandomRead for &[u8] {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl RandomRead for Vec<u8> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        RandomRead::read_at(&mut self.as_slice(), offset, buf)
    }
}

impl<R: RandomRead + ?Sized> RandomRead for &mut R {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}
