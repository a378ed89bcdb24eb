//! The capability interface the codec uses to move bytes between memory spaces.

mod buffer;
mod host;
mod sim;

use std::{error::Error, fmt};

pub use buffer::DeviceBuffer;
pub use host::HostContext;
pub use sim::SimDevice;

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Place {
    Host,
    Device(u32),
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Host => f.write_str("host"),
            Place::Device(ordinal) => write!(f, "device:{ordinal}"),
        }
    }
}

/// Failures of device memory operations.
#[derive(Debug, PartialEq, Eq)]
pub enum DeviceErr {
    SizeMismatch { dst: usize, src: usize },
    /// The context can't address memory at `place`.
    Unreachable { place: Place, context: Place },
    /// Tried to read device memory directly from the host.
    NotHostAccessible(Place),
}

impl fmt::Display for DeviceErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { dst, src } => {
                write!(f, "copy size mismatch: destination {dst} bytes, source {src} bytes")
            }
            Self::Unreachable { place, context } => {
                write!(f, "a {context} context can't reach memory on {place}")
            }
            Self::NotHostAccessible(place) => {
                write!(f, "memory on {place} is not host accessible, copy it out first")
            }
        }
    }
}

impl Error for DeviceErr {}

/// An execution context bound to one place, issuing copies on its own stream.
///
/// Copies may complete asynchronously: results are only guaranteed to be visible
/// after `synchronize` returns.
pub trait DeviceContext: Send + Sync {
    /// The place this context allocates on.
    fn place(&self) -> Place;

    /// Allocates a zeroed buffer of `len` bytes on this context's place.
    fn alloc(&self, len: usize) -> DeviceBuffer {
        DeviceBuffer::zeroed(self.place(), len)
    }

    /// Schedules a copy of every byte of `src` into `dst`.
    ///
    /// # Returns
    /// A `DeviceErr` if the lengths differ or either buffer is out of reach.
    fn copy(&self, dst: &DeviceBuffer, src: &DeviceBuffer) -> Result<(), DeviceErr>;

    /// Blocks until every copy scheduled on this context has completed.
    fn synchronize(&self) -> Result<(), DeviceErr>;

    /// Uploads host bytes into a new buffer on this context's place.
    ///
    /// The source is staged before returning, so `src` may be reused right away.
    fn copy_in(&self, src: &[u8]) -> Result<DeviceBuffer, DeviceErr> {
        let staging = DeviceBuffer::from_host(src);

        if self.place() == Place::Host {
            return Ok(staging);
        }

        let dst = self.alloc(src.len());
        self.copy(&dst, &staging)?;
        Ok(dst)
    }

    /// Downloads `src` into a new host buffer.
    fn copy_out(&self, src: &DeviceBuffer) -> Result<DeviceBuffer, DeviceErr> {
        let dst = DeviceBuffer::zeroed(Place::Host, src.len());
        self.copy(&dst, src)?;
        Ok(dst)
    }
}

/// Checks the preconditions every `DeviceContext::copy` implementation shares.
pub(crate) fn check_copy(
    context: Place,
    dst: &DeviceBuffer,
    src: &DeviceBuffer,
) -> Result<(), DeviceErr> {
    if dst.len() != src.len() {
        return Err(DeviceErr::SizeMismatch {
            dst: dst.len(),
            src: src.len(),
        });
    }

    for place in [dst.place(), src.place()] {
        if place != Place::Host && place != context {
            return Err(DeviceErr::Unreachable { place, context });
        }
    }

    Ok(())
}
