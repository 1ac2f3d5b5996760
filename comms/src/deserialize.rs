use std::io;

/// Deserialization half of the wire format.
pub trait Deserialize<'a>: Sized {
    /// Builds `Self` borrowing from `buf` whenever possible.
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self>;
}
