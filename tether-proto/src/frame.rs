//! Frame header: `[u8 type][u24 big-endian payload size]`.

use std::fmt;

use crate::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload a header can describe.
pub const MAX_PAYLOAD: usize = 0x00FF_FFFF;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Envelope from client to server.
    ClientToServerUser = 1,
    /// Envelope from server to client.
    ServerToClientUser = 2,
    /// Keep-alive probe, no payload.
    Ping = 3,
    /// Keep-alive answer, no payload.
    Pong = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ClientToServerUser),
            2 => Ok(Self::ServerToClientUser),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Pong),
            other => Err(Error::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientToServerUser => "client-to-server",
            Self::ServerToClientUser => "server-to-client",
            Self::Ping => "ping",
            Self::Pong => "pong",
        })
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame type.
    pub kind: MessageType,
    /// Payload length in bytes.
    pub size: usize,
}

impl Header {
    /// Creates a header, rejecting payloads the 24-bit size cannot carry.
    pub fn new(kind: MessageType, size: usize) -> Result<Self, Error> {
        if size > MAX_PAYLOAD {
            return Err(Error::TooLarge(size));
        }
        Ok(Self { kind, size })
    }

    /// Parses the 4 header bytes.
    pub fn parse(bytes: [u8; HEADER_SIZE]) -> Result<Self, Error> {
        let kind = MessageType::try_from(bytes[0])?;
        let size = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]) as usize;
        Ok(Self { kind, size })
    }

    /// Serializes the header.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let size = self.size as u32;
        [
            self.kind as u8,
            (size >> 16) as u8,
            (size >> 8) as u8,
            size as u8,
        ]
    }
}

/// Builds a complete frame from a type and payload.
pub fn encode_frame(kind: MessageType, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let header = Header::new(kind, payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// The 4-byte frame answering a ping.
pub const fn pong() -> [u8; HEADER_SIZE] {
    [MessageType::Pong as u8, 0, 0, 0]
}

/// The 4-byte keep-alive probe.
pub const fn ping() -> [u8; HEADER_SIZE] {
    [MessageType::Ping as u8, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian_u24() {
        let header = Header::new(MessageType::ClientToServerUser, 0x01_02_03).unwrap();
        assert_eq!(header.to_bytes(), [1, 0x01, 0x02, 0x03]);
        assert_eq!(Header::parse([1, 0x01, 0x02, 0x03]).unwrap(), header);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(matches!(
            Header::parse([9, 0, 0, 0]),
            Err(Error::UnknownType(9))
        ));
    }

    #[test]
    fn rejects_payload_beyond_u24() {
        assert!(matches!(
            Header::new(MessageType::ServerToClientUser, MAX_PAYLOAD + 1),
            Err(Error::TooLarge(_))
        ));
    }

    #[test]
    fn control_frames_are_header_only() {
        assert_eq!(
            Header::parse(ping()).unwrap(),
            Header {
                kind: MessageType::Ping,
                size: 0
            }
        );
        assert_eq!(Header::parse(pong()).unwrap().kind, MessageType::Pong);
    }
}
