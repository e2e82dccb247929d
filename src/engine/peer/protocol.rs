use crate::engine::data::Block;
use crate::engine::peer::{Error, Result};
use crate::engine::PieceIndex;
use bit_vec::BitVec;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::trace;
use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Read, Write};
use tokio_util::bytes::Buf;

/// These message types are used in the BitTorrent protocol and defined in BEP03.
/// This is always the first byte of the wire message payload.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MessageType {
    /// The keep alive message has no type id and is identified by a zero-length payload
    KeepAlive = 99,

    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,

    // BEP5: DHT discovery side-channel
    Port = 9,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Choke),
            1 => Ok(MessageType::Unchoke),
            2 => Ok(MessageType::Interested),
            3 => Ok(MessageType::NotInterested),
            4 => Ok(MessageType::Have),
            5 => Ok(MessageType::Bitfield),
            6 => Ok(MessageType::Request),
            7 => Ok(MessageType::Piece),
            8 => Ok(MessageType::Cancel),
            9 => Ok(MessageType::Port),
            _ => Err(Error::UnsupportedMessage(value)),
        }
    }
}

#[derive(Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(BitVec),
    Request(Request),
    Piece(Piece),
    Cancel(Request),
    Port(u16),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match &self {
            Message::KeepAlive => MessageType::KeepAlive,
            Message::Choke => MessageType::Choke,
            Message::Unchoke => MessageType::Unchoke,
            Message::Interested => MessageType::Interested,
            Message::NotInterested => MessageType::NotInterested,
            Message::Have(_) => MessageType::Have,
            Message::Bitfield(_) => MessageType::Bitfield,
            Message::Request(_) => MessageType::Request,
            Message::Piece(_) => MessageType::Piece,
            Message::Cancel(_) => MessageType::Cancel,
            Message::Port(_) => MessageType::Port,
        }
    }

    /// Convert the message into its wire protocol payload byte array.
    /// The payload excludes the 4-byte length prefix, see [Message::to_frame].
    pub fn to_bytes(self) -> Result<Vec<u8>> {
        self.try_into()
    }

    /// Convert the message into a complete wire frame.
    /// The frame is the payload prefixed with its length as 4 bytes big-endian.
    pub fn to_frame(self) -> Result<Vec<u8>> {
        let payload = self.to_bytes()?;
        let mut buffer = Vec::with_capacity(payload.len() + 4);

        buffer.write_u32::<BigEndian>(payload.len() as u32)?;
        buffer.write_all(&payload)?;

        Ok(buffer)
    }

    /// Parse a complete wire frame into a message.
    ///
    /// # Returns
    ///
    /// Returns the parsed message, or an error when the length prefix doesn't match the
    /// frame size or the payload is invalid.
    pub fn from_frame(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if cursor.remaining() as u32 != payload_len {
            return Err(Error::InvalidLength(payload_len, cursor.remaining() as u32));
        }

        Message::try_from(&bytes[4..])
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        // a zero-length payload is a keep alive message from the peer
        if bytes.is_empty() {
            trace!("Parsing keep alive message, as the received payload is empty");
            return Ok(Message::KeepAlive);
        }

        let mut cursor = Cursor::new(bytes);

        // the message type is the first single byte of the payload
        let msg_type_id = cursor.read_u8()?;
        let msg_type = MessageType::try_from(msg_type_id)?;

        trace!(
            "Trying to deserialize payload (size {}) for message type {:?}",
            bytes.len() - 1,
            msg_type
        );
        match msg_type {
            MessageType::Choke => Ok(Message::Choke),
            MessageType::Unchoke => Ok(Message::Unchoke),
            MessageType::Interested => Ok(Message::Interested),
            MessageType::NotInterested => Ok(Message::NotInterested),
            MessageType::Have => Ok(Message::Have(cursor.read_u32::<BigEndian>()?)),
            MessageType::Bitfield => {
                let buffer_len = cursor.remaining();
                let mut buffer = vec![0u8; buffer_len];

                cursor.read_exact(&mut buffer).map_err(|e| {
                    Error::Parsing(format!("failed to read bitfield payload, {}", e))
                })?;

                Ok(Message::Bitfield(BitVec::from_bytes(&buffer)))
            }
            MessageType::Request => {
                let request = Request::try_from(cursor)?;
                Ok(Message::Request(request))
            }
            MessageType::Piece => {
                let piece = Piece::try_from(cursor)?;
                Ok(Message::Piece(piece))
            }
            MessageType::Cancel => {
                let request = Request::try_from(cursor)?;
                Ok(Message::Cancel(request))
            }
            MessageType::Port => Ok(Message::Port(cursor.read_u16::<BigEndian>()?)),
            MessageType::KeepAlive => Ok(Message::KeepAlive),
        }
    }
}

impl TryInto<Vec<u8>> for Message {
    type Error = Error;

    fn try_into(self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();

        // write the message type as first byte in the buffer
        // for the keep alive message, no type id is written which results in a
        // zero-length payload
        if self != Message::KeepAlive {
            buffer.write_u8(self.message_type() as u8)?;
        }

        match self {
            Message::Have(e) => {
                buffer.write_u32::<BigEndian>(e)?;
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.to_bytes();
                buffer.extend_from_slice(bytes.as_slice());
            }
            Message::Request(e) | Message::Cancel(e) => {
                buffer.write_u32::<BigEndian>(e.index as u32)?;
                buffer.write_u32::<BigEndian>(e.begin as u32)?;
                buffer.write_u32::<BigEndian>(e.length as u32)?;
            }
            Message::Piece(e) => {
                buffer.write_u32::<BigEndian>(e.index as u32)?;
                buffer.write_u32::<BigEndian>(e.begin as u32)?;
                buffer.write_all(&e.data)?;
            }
            Message::Port(e) => {
                buffer.write_u16::<BigEndian>(e)?;
            }
            _ => {}
        }

        Ok(buffer)
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => f.write_str("KeepAlive"),
            Message::Choke => f.write_str("Choke"),
            Message::Unchoke => f.write_str("Unchoke"),
            Message::Interested => f.write_str("Interested"),
            Message::NotInterested => f.write_str("NotInterested"),
            Message::Have(e) => f.debug_tuple("Have").field(e).finish(),
            Message::Bitfield(e) => {
                f.write_fmt(format_args!("Bitfield({}/{})", e.count_ones(), e.len()))
            }
            Message::Request(e) => f.write_fmt(format_args!("Request({:?})", e)),
            Message::Piece(e) => f.write_fmt(format_args!("Piece({:?})", e)),
            Message::Cancel(e) => f.write_fmt(format_args!("Cancel({:?})", e)),
            Message::Port(e) => f.debug_tuple("Port").field(e).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// The index of the piece that is being requested
    pub index: PieceIndex,
    /// The offset within the piece
    pub begin: usize,
    /// The length in bytes of the block that is requested
    pub length: usize,
}

impl TryFrom<Cursor<&[u8]>> for Request {
    type Error = Error;

    fn try_from(mut value: Cursor<&[u8]>) -> Result<Self> {
        let index = value.read_u32::<BigEndian>()?;
        let begin = value.read_u32::<BigEndian>()?;
        let length = value.read_u32::<BigEndian>()?;

        Ok(Self {
            index: index as PieceIndex,
            begin: begin as usize,
            length: length as usize,
        })
    }
}

impl From<&Block> for Request {
    fn from(value: &Block) -> Self {
        Self {
            index: value.piece,
            begin: value.begin,
            length: value.length,
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct Piece {
    /// The index of the piece to which this block belongs
    pub index: PieceIndex,
    /// The offset within the piece
    pub begin: usize,
    /// The data of the block
    pub data: Vec<u8>,
}

impl Piece {
    /// Get the related request for this block data.
    pub fn request(&self) -> Request {
        Request {
            index: self.index,
            begin: self.begin,
            length: self.data.len(),
        }
    }
}

impl TryFrom<Cursor<&[u8]>> for Piece {
    type Error = Error;

    fn try_from(mut value: Cursor<&[u8]>) -> Result<Self> {
        let index = value.read_u32::<BigEndian>()?;
        let begin = value.read_u32::<BigEndian>()?;
        let length = value.remaining();
        let mut buffer = vec![0u8; length];

        // read the remaining bytes into the buffer
        value.read_exact(&mut buffer)?;

        Ok(Self {
            index: index as PieceIndex,
            begin: begin as usize,
            data: buffer,
        })
    }
}

impl Debug for Piece {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("begin", &self.begin)
            .field("length", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_try_from() {
        let byte = 0;
        let result = MessageType::try_from(byte);
        assert_eq!(Ok(MessageType::Choke), result);

        let byte = 1;
        let result = MessageType::try_from(byte);
        assert_eq!(Ok(MessageType::Unchoke), result);

        let byte = 4;
        let result = MessageType::try_from(byte);
        assert_eq!(Ok(MessageType::Have), result);

        let byte = 7;
        let result = MessageType::try_from(byte);
        assert_eq!(Ok(MessageType::Piece), result);

        let byte = 9;
        let result = MessageType::try_from(byte);
        assert_eq!(Ok(MessageType::Port), result);
    }

    #[test]
    fn test_message_type_invalid_byte() {
        let byte = 97;
        let result = MessageType::try_from(byte);
        assert_eq!(Err(Error::UnsupportedMessage(byte)), result);
    }

    #[test]
    fn test_message_keep_alive_to_bytes() {
        let message = Message::KeepAlive;
        let expected_result = vec![0u8; 0];

        let result = message.to_bytes().unwrap();

        assert_eq!(expected_result, result);
    }

    #[test]
    fn test_message_keep_alive_frame() {
        let message = Message::KeepAlive;

        let result = message.to_frame().unwrap();

        assert_eq!(vec![0u8, 0, 0, 0], result);
    }

    #[test]
    fn test_message_have_roundtrip() {
        let message = Message::Have(1362);

        let bytes = message.clone().to_bytes().unwrap();
        let result = Message::try_from(bytes.as_slice()).unwrap();

        assert_eq!(vec![4u8, 0, 0, 0x05, 0x52], bytes);
        assert_eq!(message, result);
    }

    #[test]
    fn test_message_bitfield_to_bytes() {
        let mut bitfield = BitVec::from_elem(32, true);
        bitfield.set(13, false);
        bitfield.set(27, false);
        let mut expected_result = vec![MessageType::Bitfield as u8];
        expected_result.extend_from_slice(&bitfield.to_bytes());
        let message = Message::Bitfield(bitfield);

        let result = message.to_bytes().unwrap();

        assert_eq!(expected_result, result);
    }

    #[test]
    fn test_message_request_roundtrip() {
        let request = Request {
            index: 3,
            begin: 16384,
            length: 16384,
        };
        let message = Message::Request(request.clone());

        let bytes = message.clone().to_bytes().unwrap();
        assert_eq!(13, bytes.len(), "expected the request payload to be 13 bytes");

        let result = Message::try_from(bytes.as_slice()).unwrap();
        assert_eq!(message, result);
    }

    #[test]
    fn test_message_piece_roundtrip() {
        let piece = Piece {
            index: 7,
            begin: 32768,
            data: vec![1, 2, 3, 4, 5],
        };
        let message = Message::Piece(piece);

        let bytes = message.clone().to_frame().unwrap();
        let result = Message::from_frame(bytes.as_slice()).unwrap();

        assert_eq!(message, result);
    }

    #[test]
    fn test_message_from_frame_invalid_length() {
        let mut bytes = Message::Have(0).to_frame().unwrap();
        bytes.pop();

        let result = Message::from_frame(bytes.as_slice());

        assert_eq!(Err(Error::InvalidLength(5, 4)), result);
    }

    #[test]
    fn test_message_port_roundtrip() {
        let message = Message::Port(6881);

        let bytes = message.clone().to_bytes().unwrap();
        let result = Message::try_from(bytes.as_slice()).unwrap();

        assert_eq!(message, result);
    }

    #[test]
    fn test_piece_request() {
        let piece = Piece {
            index: 2,
            begin: 16384,
            data: vec![0u8; 512],
        };

        let result = piece.request();

        assert_eq!(
            Request {
                index: 2,
                begin: 16384,
                length: 512,
            },
            result
        );
    }
}
