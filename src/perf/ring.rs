//! One memory-mapped perf ring buffer
//!
//! The mapping is one metadata page followed by a power-of-two number of data
//! pages. The kernel advances `data_head` as it writes records; user space
//! copies records out and advances `data_tail`. Head and tail are free
//! running counters and are reduced modulo the data size on access, so a
//! record may straddle the wrap point; such records are reassembled into a
//! contiguous local buffer before parsing.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::CaptureError;
use crate::perf::sys::{self, PerfEventMmapPage};

/// Header-stripped record as delivered by the kernel.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub kind: u32,
    pub misc: u16,
    pub data: Vec<u8>,
}

pub struct PerfRing {
    fd: OwnedFd,
    base: *mut u8,
    mapped_len: usize,
    data_size: u64,
    /// Local mirror of `data_tail`. This side is the only writer.
    tail: u64,
}

// The mapping is owned by this struct and the raw pointers never alias
// another ring.
unsafe impl Send for PerfRing {}

impl PerfRing {
    /// Map a ring of `data_pages` (power of two) data pages over the fd.
    ///
    /// # Errors
    /// `ResourceExhausted` when the mapping fails, which is how the kernel
    /// reports per-user mlock budget exhaustion for perf mappings.
    pub fn new(fd: OwnedFd, data_pages: usize) -> Result<Self, CaptureError> {
        assert!(data_pages.is_power_of_two());
        let page = sys::page_size();
        let mapped_len = (data_pages + 1) * page;

        // SAFETY: mapping a perf fd with a valid length; result is checked
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(CaptureError::ResourceExhausted(format!(
                "mmap of {mapped_len} ring bytes failed: {err}"
            )));
        }

        Ok(Self {
            fd,
            base: base.cast::<u8>(),
            mapped_len,
            data_size: (data_pages * page) as u64,
            tail: 0,
        })
    }

    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    #[must_use]
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    /// # Errors
    /// Propagates the ioctl failure.
    pub fn enable(&self) -> io::Result<()> {
        sys::ioctl_enable(self.raw_fd())
    }

    /// # Errors
    /// Propagates the ioctl failure.
    pub fn disable(&self) -> io::Result<()> {
        sys::ioctl_disable(self.raw_fd())
    }

    fn metadata(&self) -> &PerfEventMmapPage {
        // SAFETY: base points at the live metadata page for self's lifetime
        unsafe { &*self.base.cast::<PerfEventMmapPage>() }
    }

    fn head(&self) -> u64 {
        let head_ptr = std::ptr::addr_of!(self.metadata().data_head);
        // SAFETY: data_head is u64-aligned shared memory, accessed atomically
        let head = unsafe { &*head_ptr.cast::<AtomicU64>() };
        head.load(Ordering::Acquire)
    }

    fn publish_tail(&self, tail: u64) {
        let tail_ptr = std::ptr::addr_of!(self.metadata().data_tail);
        // SAFETY: data_tail is u64-aligned shared memory, accessed atomically
        let tail_word = unsafe { &*tail_ptr.cast::<AtomicU64>() };
        tail_word.store(tail, Ordering::Release);
    }

    /// Copy out the next pending record, or None when the ring is empty.
    /// Consuming the record frees its space for the kernel producer.
    pub fn pop_record(&mut self) -> Option<RawRecord> {
        let head = self.head();
        if head == self.tail {
            return None;
        }

        // SAFETY: the data area follows the metadata page and stays mapped
        // for self's lifetime. The kernel writes it concurrently; reads are
        // ordered by the acquire load of data_head above.
        let data: &[u8] = unsafe {
            slice::from_raw_parts(self.base.add(sys::page_size()), self.data_size as usize)
        };
        let mut header = [0u8; 8];
        copy_wrapped(data, (self.tail % self.data_size) as usize, &mut header);

        let kind = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let misc = u16::from_le_bytes(header[4..6].try_into().unwrap());
        let size = u16::from_le_bytes(header[6..8].try_into().unwrap()) as u64;
        if size < 8 || self.tail + size > head {
            // Malformed framing; drop everything pending rather than spin.
            self.tail = head;
            self.publish_tail(head);
            return None;
        }

        let mut payload = vec![0u8; (size - 8) as usize];
        copy_wrapped(data, ((self.tail + 8) % self.data_size) as usize, &mut payload);

        self.tail += size;
        self.publish_tail(self.tail);
        Some(RawRecord { kind, misc, data: payload })
    }
}

impl Drop for PerfRing {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact region mapped in new()
        unsafe {
            libc::munmap(self.base.cast::<libc::c_void>(), self.mapped_len);
        }
    }
}

/// Copy `out.len()` bytes starting at `start`, wrapping around the end of
/// `data` if necessary.
pub(crate) fn copy_wrapped(data: &[u8], start: usize, out: &mut [u8]) {
    let tail_len = (data.len() - start).min(out.len());
    out[..tail_len].copy_from_slice(&data[start..start + tail_len]);
    if tail_len < out.len() {
        let wrapped = out.len() - tail_len;
        out[tail_len..].copy_from_slice(&data[..wrapped]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_contiguous() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut out = [0u8; 4];
        copy_wrapped(&data, 2, &mut out);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn test_copy_straddling_wrap() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut out = [0u8; 5];
        copy_wrapped(&data, 6, &mut out);
        assert_eq!(out, [7, 8, 1, 2, 3]);
    }

    #[test]
    fn test_copy_exact_boundary() {
        let data = [1u8, 2, 3, 4];
        let mut out = [0u8; 2];
        copy_wrapped(&data, 2, &mut out);
        assert_eq!(out, [3, 4]);
    }
}
