use parking_lot::Mutex;

use super::{DeviceBuffer, DeviceContext, DeviceErr, Place, check_copy};

struct PendingCopy {
    dst: DeviceBuffer,
    src: DeviceBuffer,
}

/// A device context backed by host memory with an asynchronous stream.
///
/// Copies are queued in issue order and only land when `synchronize` is called,
/// which makes missing synchronization points observable in tests.
pub struct SimDevice {
    ordinal: u32,
    stream: Mutex<Vec<PendingCopy>>,
}

impl SimDevice {
    /// Creates a new `SimDevice`.
    ///
    /// # Arguments
    /// * `ordinal` - The device number, buffers it allocates live on `Place::Device(ordinal)`.
    pub fn new(ordinal: u32) -> Self {
        Self {
            ordinal,
            stream: Mutex::new(Vec::new()),
        }
    }

    /// The amount of copies waiting on the stream.
    pub fn pending(&self) -> usize {
        self.stream.lock().len()
    }
}

impl DeviceContext for SimDevice {
    fn place(&self) -> Place {
        Place::Device(self.ordinal)
    }

    fn copy(&self, dst: &DeviceBuffer, src: &DeviceBuffer) -> Result<(), DeviceErr> {
        check_copy(self.place(), dst, src)?;

        self.stream.lock().push(PendingCopy {
            dst: dst.clone(),
            src: src.clone(),
        });

        Ok(())
    }

    fn synchronize(&self) -> Result<(), DeviceErr> {
        let pending = std::mem::take(&mut *self.stream.lock());

        for PendingCopy { dst, src } in pending {
            if !dst.same_memory(&src) {
                dst.write_raw(&src.read_raw());
            }
        }

        Ok(())
    }
}
