use std::io;

/// Serialization half of the wire format.
pub trait Serialize<'a> {
    /// Writes the owned part of `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to append the serialized header and owned data to.
    ///
    /// # Returns
    /// A borrowed slice that must be written right after `buf` (zero-copy data), if any.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
