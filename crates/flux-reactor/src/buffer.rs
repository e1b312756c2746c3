use std::io::{self, IoSlice, IoSliceMut, Read};
use std::os::fd::AsRawFd;

const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// Growable byte buffer used for both the input and output side of a
/// connection.
///
/// Three indices cut the backing `Vec<u8>` into three regions:
///
/// ```text
/// | prependable (>= CHEAP_PREPEND) | readable (reader..writer) | writable (writer..) |
/// ```
///
/// `reader_index <= writer_index` always holds; bytes before `reader_index`
/// have already been consumed and their space is reclaimable by
/// [`Buffer::make_space`].
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    #[must_use]
    pub fn with_capacity(initial_size: usize) -> Self {
        Self {
            data: vec![0u8; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer_index
    }

    #[must_use]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    #[must_use]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader_index..self.writer_index]
    }

    /// Consume `len` bytes from the front of the readable region.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consume and return all readable bytes as an owned `String`.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let v = self.data[self.reader_index..self.reader_index + len].to_vec();
        self.retrieve(len);
        v
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Append raw bytes, growing (or compacting) the buffer as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable_bytes(bytes.len());
        let start = self.writer_index;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.writer_index += bytes.len();
    }

    pub fn append_u8(&mut self, x: u8) {
        self.append(&[x]);
    }

    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.prependable_bytes());
        self.reader_index -= bytes.len();
        let start = self.reader_index;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn prepend_u8(&mut self, x: u8) {
        self.prepend(&[x]);
    }

    #[must_use]
    pub fn peek_u8(&self) -> u8 {
        self.peek()[0]
    }

    pub fn read_u8(&mut self) -> u8 {
        let v = self.peek_u8();
        self.retrieve(1);
        v
    }

    pub fn append_u16(&mut self, x: u16) {
        self.append(&x.to_be_bytes());
    }

    pub fn prepend_u16(&mut self, x: u16) {
        self.prepend(&x.to_be_bytes());
    }

    #[must_use]
    pub fn peek_u16(&self) -> u16 {
        let b = self.peek();
        u16::from_be_bytes([b[0], b[1]])
    }

    pub fn read_u16(&mut self) -> u16 {
        let v = self.peek_u16();
        self.retrieve(2);
        v
    }

    pub fn append_u32(&mut self, x: u32) {
        self.append(&x.to_be_bytes());
    }

    pub fn prepend_u32(&mut self, x: u32) {
        self.prepend(&x.to_be_bytes());
    }

    #[must_use]
    pub fn peek_u32(&self) -> u32 {
        let b = self.peek();
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn read_u32(&mut self) -> u32 {
        let v = self.peek_u32();
        self.retrieve(4);
        v
    }

    pub fn append_u64(&mut self, x: u64) {
        self.append(&x.to_be_bytes());
    }

    pub fn prepend_u64(&mut self, x: u64) {
        self.prepend(&x.to_be_bytes());
    }

    #[must_use]
    pub fn peek_u64(&self) -> u64 {
        let b = self.peek();
        u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn read_u64(&mut self) -> u64 {
        let v = self.peek_u64();
        self.retrieve(8);
        v
    }

    /// Byte offset of the first `\r\n` in the readable region, or `None` if
    /// there isn't one yet.
    #[must_use]
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Byte offset of the first `\n` in the readable region, or `None`.
    #[must_use]
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Consume and return `len` bytes from the front of the readable region
    /// as an owned `String`, distinct from [`Buffer::retrieve_all_as_string`]
    /// which always consumes everything readable.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        s
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.data.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Read as much as is available from `fd` in one syscall using a
    /// scatter read: the buffer's own writable tail plus a 64KiB stack
    /// extension buffer, so a single large datagram doesn't force a resize
    /// before we know how much there is to read.
    pub fn read_from<R: Read + AsRawFd>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let n = {
            let mut slices = [
                IoSliceMut::new(&mut self.data[self.writer_index..]),
                IoSliceMut::new(&mut extrabuf),
            ];
            read_vectored_raw(reader, &mut slices)?
        };

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.data.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    #[must_use]
    pub fn as_io_slice(&self) -> IoSlice<'_> {
        IoSlice::new(self.peek())
    }
}

/// `readv`-based scatter read. `std::io::Read::read_vectored` would work
/// for sockets too, but going through `libc::readv` directly mirrors the
/// original single syscall and lets us treat EINTR uniformly with the rest
/// of the reactor's raw-fd handling.
fn read_vectored_raw<R: Read + AsRawFd>(reader: &mut R, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    loop {
        let iov: Vec<libc::iovec> = bufs
            .iter_mut()
            .map(|b| libc::iovec { iov_base: b.as_mut_ptr().cast(), iov_len: b.len() })
            .collect();
        let n = unsafe { libc::readv(reader.as_raw_fd(), iov.as_ptr(), iov.len() as i32) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_with_cheap_prepend_reserved() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_retrieve_roundtrip() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"llo");
        let rest = buf.retrieve_all_as_string();
        assert_eq!(rest, "llo");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_all_resets_to_cheap_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(3);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 3);
        buf.ensure_writable_bytes(1);
        // growing via make_space should have shifted data back, reclaiming prepend space
        assert!(buf.prependable_bytes() <= CHEAP_PREPEND + 3);
    }

    #[test]
    fn grows_past_initial_size_without_panicking() {
        let mut buf = Buffer::new();
        let big = vec![7u8; INITIAL_SIZE * 4];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), big.len());
        assert_eq!(buf.peek(), &big[..]);
    }

    #[test]
    fn prepend_u32_is_network_endian() {
        let mut buf = Buffer::new();
        buf.append(b"body");
        buf.prepend_u32(4);
        assert_eq!(buf.read_u32(), 4);
        assert_eq!(buf.peek(), b"body");
    }

    #[test]
    fn make_space_shifts_instead_of_growing_when_room_freed() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[1u8; 16]);
        buf.retrieve(16);
        let cap_before = buf.data.len();
        buf.append(&[2u8; 16]);
        assert_eq!(buf.data.len(), cap_before, "shift should reuse existing capacity");
        assert_eq!(buf.peek(), &[2u8; 16]);
    }

    #[test]
    fn u8_u16_u64_roundtrip_network_endian() {
        let mut buf = Buffer::new();
        buf.append_u8(0x12);
        buf.append_u16(0x3456);
        buf.append_u64(0x0102_0304_0506_0708);
        assert_eq!(buf.read_u8(), 0x12);
        assert_eq!(buf.read_u16(), 0x3456);
        assert_eq!(buf.read_u64(), 0x0102_0304_0506_0708);
        assert_eq!(buf.readable_bytes(), 0);

        buf.append(b"body");
        buf.prepend_u16(0x0004);
        buf.prepend_u8(0xff);
        assert_eq!(buf.read_u8(), 0xff);
        assert_eq!(buf.read_u16(), 4);
        assert_eq!(buf.peek(), b"body");
    }

    #[test]
    fn find_crlf_locates_terminator_and_is_none_without_one() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        let crlf = buf.find_crlf().expect("first crlf should be found");
        assert_eq!(&buf.peek()[..crlf], b"GET / HTTP/1.1");

        let mut partial = Buffer::new();
        partial.append(b"no terminator here");
        assert_eq!(partial.find_crlf(), None);
    }

    #[test]
    fn find_eol_locates_bare_newline() {
        let mut buf = Buffer::new();
        buf.append(b"line one\nline two");
        let eol = buf.find_eol().expect("newline should be found");
        assert_eq!(&buf.peek()[..eol], b"line one");

        let mut none = Buffer::new();
        none.append(b"no newline");
        assert_eq!(none.find_eol(), None);
    }

    #[test]
    fn retrieve_as_string_consumes_only_requested_length() {
        let mut buf = Buffer::new();
        buf.append(b"helloworld");
        let first = buf.retrieve_as_string(5);
        assert_eq!(first, "hello");
        assert_eq!(buf.peek(), b"world");
    }
}
