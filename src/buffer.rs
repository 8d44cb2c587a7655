//! Shareable buffers backing client surfaces
//!
//! Each buffer is a set of planes, every plane an OS handle plus stride and
//! offset. Handles are duplicated when exported so the receiving process owns
//! its own reference to the memory.

use crate::format::{Fourcc, MODIFIER_LINEAR, PixelFormat};
use std::ffi::CString;
use std::fs::File;
use std::io;
use nix::sys::memfd::{MFdFlags, memfd_create};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use tracing::debug;

#[derive(Debug)]
pub struct Plane {
    fd: OwnedFd,
    pub stride: u32,
    pub offset: u32,
}

impl Plane {
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[derive(Debug)]
pub struct SharedBuffer {
    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifier: u64,
    planes: Vec<Plane>,
}

impl SharedBuffer {
    /// Allocate a single-plane, memory-backed buffer in `format`
    pub fn allocate(name: &str, width: u32, height: u32, format: &PixelFormat) -> io::Result<Self> {
        let fourcc = format.fourcc();
        let stride = stride(width, height, fourcc)?;
        let size = u64::from(stride)
            .checked_mul(u64::from(height))
            .ok_or_else(|| invalid(format!("{}x{} buffer is too large", width, height)))?;

        let file = File::from(memfd(name)?);
        file.set_len(size)?;

        debug!(
            "Allocated {}x{} {} buffer for {} (stride {})",
            width, height, fourcc, name, stride
        );

        Ok(Self {
            width,
            height,
            fourcc,
            modifier: format.modifiers().first().copied().unwrap_or(MODIFIER_LINEAR),
            planes: vec![Plane {
                fd: OwnedFd::from(file),
                stride,
                offset: 0,
            }],
        })
    }

    /// Wrap planes received from a remote process
    pub fn import(
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifier: u64,
        fds: Vec<OwnedFd>,
    ) -> io::Result<Self> {
        let stride = stride(width, height, fourcc)?;
        Ok(Self {
            width,
            height,
            fourcc,
            modifier,
            planes: fds
                .into_iter()
                .map(|fd| Plane {
                    fd,
                    stride,
                    offset: 0,
                })
                .collect(),
        })
    }

    /// Duplicated handles of at most `max` planes
    pub fn descriptors(&self, max: usize) -> io::Result<Vec<OwnedFd>> {
        self.planes
            .iter()
            .take(max)
            .map(|plane| plane.fd.try_clone())
            .collect()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fourcc(&self) -> Fourcc {
        self.fourcc
    }

    pub fn modifier(&self) -> u64 {
        self.modifier
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, reason)
}

/// Bytes per row of a tightly packed `width` x `height` plane
fn stride(width: u32, height: u32, fourcc: Fourcc) -> io::Result<u32> {
    if width == 0 || height == 0 {
        return Err(invalid(format!("empty {}x{} buffer", width, height)));
    }
    width
        .checked_mul(fourcc.bytes_per_pixel())
        .ok_or_else(|| invalid(format!("{} pixels per row overflow the stride", width)))
}

/// Anonymous shared-memory file
pub(crate) fn memfd(name: &str) -> io::Result<OwnedFd> {
    let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    Ok(memfd_create(name.as_c_str(), MFdFlags::MFD_CLOEXEC)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_allocate_sizes_plane() {
        let format = PixelFormat::new(Fourcc::ARGB8888, [MODIFIER_LINEAR]);
        let buffer = SharedBuffer::allocate("test", 64, 32, &format).unwrap();

        assert_eq!(buffer.planes().len(), 1);
        assert_eq!(buffer.planes()[0].stride, 256);

        let file = File::from(buffer.descriptors(4).unwrap().remove(0));
        assert_eq!(file.metadata().unwrap().len(), 256 * 32);
    }

    #[test]
    fn test_descriptors_are_duplicates() {
        let format = PixelFormat::new(Fourcc::RGB565, [MODIFIER_LINEAR]);
        let buffer = SharedBuffer::allocate("dup", 8, 8, &format).unwrap();

        let fds = buffer.descriptors(4).unwrap();
        assert_eq!(fds.len(), 1);
        assert_ne!(fds[0].as_raw_fd(), buffer.planes()[0].fd().as_raw_fd());
    }

    #[test]
    fn test_descriptors_bounded() {
        let fds = (0..3)
            .map(|_| OwnedFd::from(File::open("/dev/null").unwrap()))
            .collect();
        let buffer = SharedBuffer::import(4, 4, Fourcc::XRGB8888, MODIFIER_LINEAR, fds).unwrap();

        assert_eq!(buffer.descriptors(2).unwrap().len(), 2);
        assert_eq!(buffer.planes()[0].stride, 16);
    }

    #[test]
    fn test_oversized_dimensions_are_rejected() {
        let format = PixelFormat::new(Fourcc::ARGB8888, [MODIFIER_LINEAR]);

        let error = SharedBuffer::allocate("wide", 0x4000_0000, 1, &format).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        let error = SharedBuffer::allocate("empty", 0, 16, &format).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);

        let fds = vec![OwnedFd::from(File::open("/dev/null").unwrap())];
        assert!(SharedBuffer::import(u32::MAX, 1, Fourcc::ARGB8888, MODIFIER_LINEAR, fds).is_err());
    }
}
