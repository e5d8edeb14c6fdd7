//! Low-level POSIX shared memory operations

use crate::error::{Result, SwitchyardError};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

const SEGMENT_PREFIX: &str = "/switchyard_";

/// Longest channel name that still yields a valid segment name
pub const MAX_NAME_LEN: usize = 255 - SEGMENT_PREFIX.len();

/// Largest segment this crate will create (1 GiB)
pub const MAX_SEGMENT_SIZE: usize = 1 << 30;

/// Check that `name` is usable both as a registry key and a segment name
pub fn validate_channel_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() > MAX_NAME_LEN {
        "too long"
    } else if name.contains('/') {
        "contains '/'"
    } else if name.contains('\0') {
        "contains NUL"
    } else {
        return Ok(());
    };

    Err(SwitchyardError::InvalidChannelName {
        name: name.to_string(),
        reason,
    })
}

/// Deterministic segment name for a channel
///
/// Any process that knows the channel name can open the segment.
pub fn segment_name(channel: &str) -> Result<String> {
    validate_channel_name(channel)?;
    Ok(format!("{}{}", SEGMENT_PREFIX, channel))
}

fn c_segment_name(channel: &str) -> Result<CString> {
    let full_name = segment_name(channel)?;
    // validate_channel_name rejects interior NULs
    CString::new(full_name).map_err(|_| SwitchyardError::InvalidChannelName {
        name: channel.to_string(),
        reason: "contains NUL",
    })
}

/// Handle to a mapped shared memory segment
pub struct Segment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    channel: String,
    is_owner: bool,
}

// SAFETY: the mapping is plain memory; every structure placed in it
// synchronizes through atomics or process-shared primitives
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new, zero-filled segment for `channel`
    ///
    /// Fails with an `AlreadyExists` source if the name is taken; existing
    /// segments are never truncated or overwritten here.
    pub fn create(channel: &str, size: usize) -> Result<Self> {
        if size == 0 || size > MAX_SEGMENT_SIZE {
            return Err(SwitchyardError::CapacityOutOfBounds {
                size,
                min: 1,
                max: MAX_SEGMENT_SIZE,
            });
        }

        let c_name = c_segment_name(channel)?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| SwitchyardError::ShmCreate {
            name: channel.to_string(),
            source: e.into(),
        })?;

        // A fresh object is extended with zero bytes
        if let Err(e) = ftruncate(&fd, size as u64) {
            let _ = shm_unlink(c_name.as_c_str());
            return Err(SwitchyardError::Truncate(e.into()));
        }

        let addr = match map(&fd, size) {
            Ok(addr) => addr,
            Err(e) => {
                let _ = shm_unlink(c_name.as_c_str());
                return Err(e);
            }
        };

        Ok(Self {
            fd,
            addr,
            size,
            channel: channel.to_string(),
            is_owner: true,
        })
    }

    /// Remove the name of a segment left behind by a dead producer
    ///
    /// Processes that still map it keep their mapping.
    pub fn unlink(channel: &str) -> Result<()> {
        let c_name = c_segment_name(channel)?;
        shm_unlink(c_name.as_c_str()).map_err(|e| SwitchyardError::ShmOpen {
            name: channel.to_string(),
            source: e.into(),
        })
    }

    /// Open the existing segment for `channel`
    pub fn open(channel: &str) -> Result<Self> {
        let c_name = c_segment_name(channel)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            SwitchyardError::ShmOpen {
                name: channel.to_string(),
                source: e.into(),
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| SwitchyardError::ShmOpen {
            name: channel.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(SwitchyardError::CapacityOutOfBounds {
                size,
                min: 1,
                max: MAX_SEGMENT_SIZE,
            });
        }

        let addr = map(&fd, size)?;

        Ok(Self {
            fd,
            addr,
            size,
            channel: channel.to_string(),
            is_owner: false,
        })
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Channel this segment belongs to
    #[inline(always)]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether dropping this handle unlinks the segment
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| SwitchyardError::Mmap(e.into()))?
    };

    NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
        SwitchyardError::Mmap(std::io::Error::new(
            std::io::ErrorKind::Other,
            "mmap returned null",
        ))
    })
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        // Consumers keep their mapping; only the name goes away
        if self.is_owner {
            if let Ok(c_name) = c_segment_name(&self.channel) {
                let _ = shm_unlink(c_name.as_c_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let channel = "test_segment_create";
        let size = 4096;

        let owner = Segment::create(channel, size).unwrap();
        assert!(owner.is_owner());
        assert_eq!(owner.size(), size);

        unsafe {
            std::ptr::write(owner.as_ptr(), 42u8);
        }

        let view = Segment::open(channel).unwrap();
        assert!(!view.is_owner());
        assert_eq!(view.size(), size);

        let val = unsafe { std::ptr::read(view.as_ptr()) };
        assert_eq!(val, 42u8);

        drop(owner);

        // Mapping stays valid after the owner unlinks
        let val = unsafe { std::ptr::read(view.as_ptr()) };
        assert_eq!(val, 42u8);
        assert!(Segment::open(channel).is_err());
    }

    #[test]
    fn test_create_refuses_existing_name() {
        let channel = "test_segment_exclusive";
        let owner = Segment::create(channel, 4096).unwrap();
        unsafe {
            std::ptr::write(owner.as_ptr(), 7u8);
        }

        let err = Segment::create(channel, 8192).err().unwrap();
        assert!(matches!(
            err,
            SwitchyardError::ShmCreate { ref source, .. }
                if source.kind() == std::io::ErrorKind::AlreadyExists
        ));

        // The existing segment is untouched and still linked
        let view = Segment::open(channel).unwrap();
        assert_eq!(view.size(), 4096);
        assert_eq!(unsafe { std::ptr::read(view.as_ptr()) }, 7u8);
    }

    #[test]
    fn test_size_bounds() {
        assert!(matches!(
            Segment::create("test_segment_zero", 0),
            Err(SwitchyardError::CapacityOutOfBounds { .. })
        ));
        assert!(matches!(
            Segment::create("test_segment_huge", MAX_SEGMENT_SIZE + 1),
            Err(SwitchyardError::CapacityOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_channel_name_rules() {
        assert_eq!(segment_name("camera").unwrap(), "/switchyard_camera");
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("a/b").is_err());
        assert!(validate_channel_name("nul\0byte").is_err());
        assert!(validate_channel_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_channel_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
    }
}
