use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use crate::perf_event_sys::{PerfEventHeader, PerfEventMmapPage};

/// Reader over the mmapped ring buffer of one perf_event_open file
/// descriptor.
///
/// The kernel appends records at `data_head`; we consume at `data_tail`.
/// `data_head` is read with an acquire fence and `data_tail` is published
/// with a release fence, matching the kernel's memory ordering contract for
/// the mmap control page.
pub struct PerfEventRingBuffer {
    fd: RawFd,
    mmap_base: *mut u8,
    mmap_len: usize,
    /// Size of the data portion, always a power of two.
    ring_size: u64,
    name: String,
}

// The raw pointers reference an mmap owned by this struct alone.
unsafe impl Send for PerfEventRingBuffer {}

impl PerfEventRingBuffer {
    /// Maps `2^ring_size_exponent` data pages (plus the metadata page) over
    /// `fd`. The kernel requires a power-of-two page count.
    pub fn new(fd: RawFd, ring_size_exponent: u32, name: String) -> io::Result<Self> {
        let page_size = 4096usize;
        let ring_size = page_size << ring_size_exponent;
        let mmap_len = page_size + ring_size;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(PerfEventRingBuffer {
            fd,
            mmap_base: base as *mut u8,
            mmap_len,
            ring_size: ring_size as u64,
            name,
        })
    }

    pub fn file_descriptor(&self) -> RawFd {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn metadata_page(&self) -> *mut PerfEventMmapPage {
        self.mmap_base as *mut PerfEventMmapPage
    }

    fn data(&self) -> *const u8 {
        // The data portion starts one page after the metadata page.
        unsafe { self.mmap_base.add(4096) }
    }

    fn read_head(&self) -> u64 {
        let head = unsafe { ptr::read_volatile(&(*self.metadata_page()).data_head) };
        fence(Ordering::Acquire);
        head
    }

    fn read_tail(&self) -> u64 {
        // No fence: the tail is only ever written by us.
        unsafe { ptr::read_volatile(&(*self.metadata_page()).data_tail) }
    }

    fn write_tail(&mut self, tail: u64) {
        fence(Ordering::AcqRel);
        unsafe { ptr::write_volatile(&mut (*self.metadata_page()).data_tail, tail) };
    }

    /// True iff a complete record is available. A header whose declared size
    /// exceeds the published bytes means the kernel has not finished writing
    /// the record; it is left alone and re-peeked on the next round.
    pub fn has_new_data(&self) -> bool {
        let head = self.read_head();
        let tail = self.read_tail();
        let available = head.wrapping_sub(tail);
        if available < PerfEventHeader::SIZE as u64 {
            return false;
        }
        let header = self.peek_header();
        available >= header.size as u64
    }

    /// The header of the next unconsumed record. Does not advance the tail.
    pub fn peek_header(&self) -> PerfEventHeader {
        let mut bytes = [0u8; PerfEventHeader::SIZE];
        self.read_raw_at_offset(&mut bytes, 0);
        // Safety: PerfEventHeader is a plain #[repr(C)] triple of integers.
        unsafe { ptr::read_unaligned(bytes.as_ptr() as *const PerfEventHeader) }
    }

    /// Copies `dest.len()` bytes starting `offset` bytes past the current
    /// tail, handling the wrap-around at the end of the ring.
    pub fn read_raw_at_offset(&self, dest: &mut [u8], offset: u64) {
        let position = self.read_tail().wrapping_add(offset);
        let index = (position & (self.ring_size - 1)) as usize;
        let len = dest.len();

        if index + len <= self.ring_size as usize {
            unsafe {
                ptr::copy_nonoverlapping(self.data().add(index), dest.as_mut_ptr(), len);
            }
        } else {
            let first = self.ring_size as usize - index;
            unsafe {
                ptr::copy_nonoverlapping(self.data().add(index), dest.as_mut_ptr(), first);
                ptr::copy_nonoverlapping(
                    self.data(),
                    dest.as_mut_ptr().add(first),
                    len - first,
                );
            }
        }
    }

    /// Copies the payload (everything after the header) of the next record
    /// into `dest` and consumes the record.
    pub fn consume_record(&mut self, header: &PerfEventHeader, dest: &mut Vec<u8>) {
        let payload_size = header.size as usize - PerfEventHeader::SIZE;
        dest.resize(payload_size, 0);
        self.read_raw_at_offset(dest, PerfEventHeader::SIZE as u64);
        self.skip_record(header);
    }

    /// Advances the tail past the record without reading it.
    pub fn skip_record(&mut self, header: &PerfEventHeader) {
        let tail = self.read_tail().wrapping_add(header.size as u64);
        self.write_tail(tail);
    }
}

impl Drop for PerfEventRingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap_base as *mut libc::c_void, self.mmap_len);
            libc::close(self.fd);
        }
    }
}
