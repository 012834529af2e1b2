use crate::errors::VsocError;

/// Size of one packet including its header.
pub const MAX_PACKET_SIZE: usize = 8192;
pub const PACKET_HEADER_SIZE: usize = 12;
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE;

const PAYLOAD_LENGTH_OFFSET: usize = 0;
const GENERATION_OFFSET: usize = 4;
const MESSAGE_TYPE_OFFSET: usize = 8;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Data = 0,
    Begin = 1,
    End = 2,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MessageType::Data),
            1 => Some(MessageType::Begin),
            2 => Some(MessageType::End),
            _ => None,
        }
    }
}

/// Fixed capacity unit exchanged over a socket forward connection.
///
/// The header lives in the same buffer as the payload, little endian:
/// `payload_length` at 0, `generation` at 4, `message_type` at 8. Only the
/// header and `payload_length` payload bytes travel over the channel.
///
/// An empty packet (data, length 0) and an end-of-stream packet are
/// distinct. Senders never put an empty packet on the wire.
pub struct Packet {
    raw: Box<[u8]>,
}

impl Packet {
    fn with_type(message_type: MessageType) -> Self {
        let mut packet = Self {
            raw: vec![0u8; MAX_PACKET_SIZE].into_boxed_slice(),
        };
        packet.set_message_type(message_type);
        packet
    }

    /// Zero length data packet, ready to be filled from a socket read.
    pub fn make_data() -> Self {
        Self::with_type(MessageType::Data)
    }

    pub fn make_begin() -> Self {
        Self::with_type(MessageType::Begin)
    }

    pub fn make_end() -> Self {
        Self::with_type(MessageType::End)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.read_u32(MESSAGE_TYPE_OFFSET))
    }

    fn set_message_type(&mut self, message_type: MessageType) {
        self.write_u32(MESSAGE_TYPE_OFFSET, message_type as u32);
    }

    pub fn is_data(&self) -> bool {
        self.message_type() == Some(MessageType::Data)
    }

    pub fn is_begin(&self) -> bool {
        self.message_type() == Some(MessageType::Begin)
    }

    pub fn is_end(&self) -> bool {
        self.message_type() == Some(MessageType::End)
    }

    /// The writer closed its half of the stream; nothing follows.
    pub fn is_end_of_stream(&self) -> bool {
        self.is_end()
    }

    /// A data packet carrying no bytes.
    pub fn is_empty(&self) -> bool {
        self.is_data() && self.payload_length() == 0
    }

    pub fn payload_length(&self) -> usize {
        self.read_u32(PAYLOAD_LENGTH_OFFSET) as usize
    }

    /// Set the number of valid payload bytes and mark the packet as data.
    ///
    /// Panics if `length` exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn set_payload_length(&mut self, length: usize) {
        assert!(
            length <= MAX_PAYLOAD_SIZE,
            "payload length {} exceeds capacity {}",
            length,
            MAX_PAYLOAD_SIZE
        );
        self.set_message_type(MessageType::Data);
        self.write_u32(PAYLOAD_LENGTH_OFFSET, length as u32);
    }

    /// Copy `data` into the payload. Panics if it does not fit.
    pub fn set_payload(&mut self, data: &[u8]) {
        self.set_payload_length(data.len());
        self.raw[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + data.len()].copy_from_slice(data);
    }

    pub fn payload(&self) -> &[u8] {
        let length = self.payload_length().min(MAX_PAYLOAD_SIZE);
        &self.raw[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + length]
    }

    /// The whole payload capacity, for reading straight from a socket.
    /// Follow with `set_payload_length`.
    pub fn payload_buffer_mut(&mut self) -> &mut [u8] {
        &mut self.raw[PACKET_HEADER_SIZE..]
    }

    pub fn generation(&self) -> u32 {
        self.read_u32(GENERATION_OFFSET)
    }

    pub fn set_generation(&mut self, generation: u32) {
        self.write_u32(GENERATION_OFFSET, generation);
    }

    /// Header plus the valid payload bytes, as sent over the channel.
    pub fn raw_data(&self) -> &[u8] {
        let length = self.payload_length().min(MAX_PAYLOAD_SIZE);
        &self.raw[..PACKET_HEADER_SIZE + length]
    }

    pub(crate) fn raw_buffer_mut(&mut self) -> &mut [u8] {
        &mut self.raw
    }

    /// Reset to an end-of-stream packet in place.
    pub(crate) fn reset_to_end(&mut self, generation: u32) {
        self.write_u32(PAYLOAD_LENGTH_OFFSET, 0);
        self.set_generation(generation);
        self.set_message_type(MessageType::End);
    }

    pub fn validate(&self) -> Result<(), VsocError> {
        let message_type = self.message_type().ok_or_else(|| {
            VsocError::InvalidPacket(format!(
                "unknown message type {}",
                self.read_u32(MESSAGE_TYPE_OFFSET)
            ))
        })?;
        let length = self.payload_length();
        if length > MAX_PAYLOAD_SIZE {
            return Err(VsocError::InvalidPacket(format!(
                "payload length {} exceeds capacity {}",
                length, MAX_PAYLOAD_SIZE
            )));
        }
        if message_type != MessageType::Data && length != 0 {
            return Err(VsocError::InvalidPacket(format!(
                "{:?} packet carries {} payload bytes",
                message_type, length
            )));
        }
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.raw[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.raw[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::make_data()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("message_type", &self.message_type())
            .field("generation", &self.generation())
            .field("payload_length", &self.payload_length())
            .finish()
    }
}
