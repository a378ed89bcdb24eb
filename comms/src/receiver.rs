use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Deserialize, FrameTooLarge, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// The receiving end handle of the communication.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits to receive a new message from the inner receiver.
    ///
    /// A frame whose body fails to deserialize yields an `io::ErrorKind::InvalidData`
    /// error, the stream stays aligned on the next frame. A frame over the size limit
    /// yields a `FrameTooLarge` error and leaves the stream unusable.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned
    ///           `T`'s lifetimes will be tied to this buffer.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure.
    pub async fn recv_into<'buf, T>(&mut self, buf: &'buf mut Vec<u8>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(io::Error::other(FrameTooLarge(len)));
        }

        buf.resize(len, 0);
        self.rx.read_exact(buf).await?;

        T::deserialize(buf)
    }
}
