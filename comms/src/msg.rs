use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u64;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: u8 = 0;
const CONTROL_KIND: u8 = 1;
const F32_KIND: u8 = 2;
const U64_KIND: u8 = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
///
/// Payloads are numeric buffers contributed to, or produced by, a collective reduction.
#[derive(Debug)]
pub enum Payload<'a> {
    F32(&'a mut [f32]),
    U64(&'a mut [u64]),
}

impl Payload<'_> {
    /// Returns the amount of elements in the payload.
    pub fn len(&self) -> usize {
        match self {
            Payload::F32(nums) => nums.len(),
            Payload::U64(nums) => nums.len(),
        }
    }

    /// Returns `true` if the payload holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message of a peer to the coordinator during rendezvous.
    Join { rank: usize, world_size: usize },
    /// The coordinator's acceptance of a `Join`.
    Welcome { world_size: usize },
    /// A peer reached its `seq`-th barrier.
    Barrier { seq: u64 },
    /// Every peer reached the `seq`-th barrier.
    Release { seq: u64 },
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Returns a short human readable name for the kind of message.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::F32(_)) => "data/f32",
            Msg::Data(Payload::U64(_)) => "data/u64",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(byte: u8) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind byte {byte}"),
        ))
    }

    fn misaligned_payload<T>(err: bytemuck::PodCastError) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received a payload that can't be viewed as numbers: {err:?}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&(ERR_KIND as Header).to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&(CONTROL_KIND as Header).to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(payload) => {
                let (kind, bytes): (u8, &[u8]) = match payload {
                    Payload::F32(nums) => (F32_KIND, bytemuck::cast_slice(nums)),
                    Payload::U64(nums) => (U64_KIND, bytemuck::cast_slice(nums)),
                };

                buf.extend_from_slice(&(kind as Header).to_be_bytes());
                Ok(Some(bytes))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(kind_buf);
        let kind = Header::from_be_bytes(header);

        match u8::try_from(kind).unwrap_or(u8::MAX) {
            ERR_KIND => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            F32_KIND => match bytemuck::try_cast_slice_mut(rest) {
                Ok(nums) => Ok(Self::Data(Payload::F32(nums))),
                Err(e) => Self::misaligned_payload(e),
            },
            U64_KIND => match bytemuck::try_cast_slice_mut(rest) {
                Ok(nums) => Ok(Self::Data(Payload::U64(nums))),
                Err(e) => Self::misaligned_payload(e),
            },
            byte => Self::invalid_kind_byte(byte),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_wire(msg: &Msg<'_>) -> Vec<u64> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf).unwrap();
        if let Some(tail) = tail {
            buf.extend_from_slice(tail);
        }

        // Copy into an 8 byte aligned buffer, the same way the receiver does.
        let mut words = vec![0u64; buf.len().div_ceil(8)];
        bytemuck::cast_slice_mut::<u64, u8>(&mut words)[..buf.len()].copy_from_slice(&buf);
        words
    }

    #[test]
    fn control_commands_survive_the_wire() {
        let msg = Msg::Control(Command::Join {
            rank: 3,
            world_size: 4,
        });

        let mut buf = Vec::new();
        assert!(msg.serialize(&mut buf).unwrap().is_none());

        match Msg::deserialize(&mut buf).unwrap() {
            Msg::Control(cmd) => assert_eq!(
                cmd,
                Command::Join {
                    rank: 3,
                    world_size: 4
                }
            ),
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[test]
    fn u64_payload_is_viewed_in_place() {
        let mut counts = [1u64, 2, u64::MAX];
        let msg = Msg::Data(Payload::U64(&mut counts));
        let mut words = to_wire(&msg);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);

        match Msg::deserialize(bytes).unwrap() {
            Msg::Data(Payload::U64(nums)) => assert_eq!(nums, &[1, 2, u64::MAX]),
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = 9u64.to_be_bytes().to_vec();
        assert!(Msg::deserialize(&mut buf).is_err());
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut buf = vec![0u8; 3];
        assert!(Msg::deserialize(&mut buf).is_err());
    }
}
