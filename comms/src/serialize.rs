use std::io;

/// Types that can be written as the body of a frame.
pub trait Serialize<'a> {
    /// Writes the owned part of the message into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to append the serialized header into.
    ///
    /// # Returns
    /// An optional trailing slice that is written right after `buf` without being copied.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
