use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use super::{DeviceErr, Place};

/// A fixed length byte buffer living on some place.
///
/// Clones share the same memory, which lets a context keep a buffer alive
/// while a copy into it is still pending on its stream.
#[derive(Clone)]
pub struct DeviceBuffer {
    place: Place,
    len: usize,
    mem: Arc<Mutex<Box<[u8]>>>,
}

impl DeviceBuffer {
    /// Creates a zeroed buffer.
    ///
    /// # Arguments
    /// * `place` - Where the buffer lives.
    /// * `len` - The length in bytes.
    pub fn zeroed(place: Place, len: usize) -> Self {
        Self {
            place,
            len,
            mem: Arc::new(Mutex::new(vec![0; len].into_boxed_slice())),
        }
    }

    /// Creates a host buffer holding a copy of `bytes`.
    pub fn from_host(bytes: &[u8]) -> Self {
        Self {
            place: Place::Host,
            len: bytes.len(),
            mem: Arc::new(Mutex::new(Box::from(bytes))),
        }
    }

    pub fn place(&self) -> Place {
        self.place
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether both handles point to the same memory.
    pub fn same_memory(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.mem, &other.mem)
    }

    /// Copies the contents of a host buffer out.
    ///
    /// # Returns
    /// The bytes or `DeviceErr::NotHostAccessible` if the buffer is not on the host.
    pub fn to_host_vec(&self) -> Result<Vec<u8>, DeviceErr> {
        if self.place != Place::Host {
            return Err(DeviceErr::NotHostAccessible(self.place));
        }

        Ok(self.read_raw())
    }

    /// Reads the raw memory regardless of place, only contexts may do this.
    pub(super) fn read_raw(&self) -> Vec<u8> {
        self.mem.lock().to_vec()
    }

    /// Overwrites the raw memory regardless of place, only contexts may do this.
    pub(super) fn write_raw(&self, bytes: &[u8]) {
        self.mem.lock().copy_from_slice(bytes);
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("place", &self.place)
            .field("len", &self.len)
            .finish()
    }
}
