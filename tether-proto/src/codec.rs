//! Envelope codec and blocking frame I/O.
//!
//! Envelopes are serialized with [`postcard`]. A payload must be consumed
//! exactly: trailing bytes mean the peer and this build disagree on the
//! message layout, which is reported as [`Error::Trailing`].

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::frame::{self, HEADER_SIZE, Header, MessageType};
use crate::message::{ClientToServer, ServerToClient};
use crate::{Error, Result};

/// Serializes an envelope into a frame payload.
pub fn encode(msg: &impl Serialize) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(msg)?)
}

/// Deserializes a payload that must contain exactly one envelope.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let (msg, rest) = postcard::take_from_bytes(payload)?;
    if !rest.is_empty() {
        return Err(Error::Trailing(rest.len()));
    }
    Ok(msg)
}

/// Returns the variant tag at the start of an envelope payload.
pub fn peek_variant(payload: &[u8]) -> Result<u32> {
    let (tag, _) = postcard::take_from_bytes::<u32>(payload)?;
    Ok(tag)
}

/// Decodes a request, returning `None` for a variant this build does not know.
pub fn decode_request(payload: &[u8]) -> Result<Option<ClientToServer>> {
    if peek_variant(payload)? >= ClientToServer::VARIANTS {
        return Ok(None);
    }
    decode(payload).map(Some)
}

/// Decodes a response, returning `None` for a variant this build does not know.
pub fn decode_response(payload: &[u8]) -> Result<Option<ServerToClient>> {
    if peek_variant(payload)? >= ServerToClient::VARIANTS {
        return Ok(None);
    }
    decode(payload).map(Some)
}

/// Encodes an envelope into a complete frame of the given type.
pub fn encode_user(kind: MessageType, msg: &impl Serialize) -> Result<Vec<u8>> {
    frame::encode_frame(kind, &encode(msg)?)
}

/// Writes an envelope frame to `w`.
pub fn send<W: Write>(w: &mut W, kind: MessageType, msg: &impl Serialize) -> Result<()> {
    w.write_all(&encode_user(kind, msg)?)?;
    w.flush()?;
    Ok(())
}

/// Writes a header-only control frame (ping or pong) to `w`.
pub fn send_control<W: Write>(w: &mut W, kind: MessageType) -> Result<()> {
    w.write_all(&Header::new(kind, 0)?.to_bytes())?;
    w.flush()?;
    Ok(())
}

/// Reads one frame from `r`, rejecting payloads larger than `max_payload`.
pub fn recv<R: Read>(r: &mut R, max_payload: usize) -> Result<(MessageType, Vec<u8>)> {
    let mut buf = [0u8; HEADER_SIZE];
    r.read_exact(&mut buf)?;
    let header = Header::parse(buf)?;
    if header.size > max_payload {
        return Err(Error::TooLarge(header.size));
    }
    let mut payload = vec![0u8; header.size];
    r.read_exact(&mut payload)?;
    Ok((header.kind, payload))
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            other => Self::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ExecuteCommandReq, GetFileReq, PutFileRsp};

    #[test]
    fn request_frame_over_stream() {
        let req = ClientToServer::ExecuteCommandReq(ExecuteCommandReq {
            command: "cat /proc/uptime".into(),
        });
        let mut buf = Vec::new();
        send(&mut buf, MessageType::ClientToServerUser, &req).unwrap();
        send_control(&mut buf, MessageType::Ping).unwrap();

        let mut cursor = io::Cursor::new(&buf);
        let (kind, payload) = recv(&mut cursor, 512).unwrap();
        assert_eq!(kind, MessageType::ClientToServerUser);
        assert_eq!(decode_request(&payload).unwrap(), Some(req));

        let (kind, payload) = recv(&mut cursor, 512).unwrap();
        assert_eq!(kind, MessageType::Ping);
        assert!(payload.is_empty());
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let mut payload = encode(&ClientToServer::GetFileReq(GetFileReq::default())).unwrap();
        payload.push(0);
        assert!(matches!(
            decode::<ClientToServer>(&payload),
            Err(Error::Trailing(1))
        ));
    }

    #[test]
    fn unknown_variant_is_skipped() {
        // Variant tag 7 followed by garbage the decoder never looks at.
        assert_eq!(decode_request(&[7, 0xff, 0xff]).unwrap(), None);
        assert_eq!(decode_response(&[5]).unwrap(), None);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let payload = encode(&ServerToClient::PutFileRsp(PutFileRsp {
            window_size: 100,
            error: "Open failed.".into(),
            acknowledge_count: 1,
        }))
        .unwrap();
        assert!(decode::<ServerToClient>(&payload[..payload.len() - 3]).is_err());
    }

    #[test]
    fn rejects_oversized_frame() {
        let header = [2u8, 0x00, 0x10, 0x00];
        let mut cursor = io::Cursor::new(&header[..]);
        assert!(matches!(recv(&mut cursor, 512), Err(Error::TooLarge(4096))));
    }
}
