use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::Crc;

pub const PACKET_MAGIC: u32 = 0x4433_2211;

/// magic + sequence + length + checksum.
pub const PACKET_HEADER_SIZE: usize = 4 + 8 + 4 + 2;

/// length + type.
pub const COMMAND_HEADER_SIZE: usize = 4 + 1;

const CRC16: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);

// Command types reserved for the log's own checkpoint protocol. User command
// types must stay below these.
pub const CMD_CHECKPOINT_START: u8 = 0xF0;
pub const CMD_CHECKPOINT_DROP: u8 = 0xF1;

/// A single logged command: one type byte and its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: u8,
    pub bytes: Vec<u8>,
}

impl Command {
    pub fn new(kind: u8, bytes: Vec<u8>) -> Self {
        Command { kind, bytes }
    }

    pub fn encoded_size(&self) -> usize {
        COMMAND_HEADER_SIZE + self.bytes.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<LittleEndian>(self.bytes.len() as u32)
            .expect("vec write cannot fail");
        buf.push(self.kind);
        buf.extend_from_slice(&self.bytes);
    }
}

/// Parsed packet header. The end-of-log marker is a reserved
/// zero-length/zero-checksum packet written after the last real packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: i64,
    pub length: u32,
    pub checksum: u16,
}

impl PacketHeader {
    pub fn is_end_marker(&self) -> bool {
        self.length == 0 && self.checksum == 0
    }

    /// Decodes a header. `Ok(None)` means the bytes are all zero, i.e. a
    /// never-written (empty) region; a wrong non-zero magic is corruption.
    pub fn decode(bytes: &[u8]) -> Result<Option<PacketHeader>> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(Error::Corruption("truncated packet header".into()));
        }
        let mut reader = bytes;
        let magic = reader.read_u32::<LittleEndian>().expect("length checked");
        if magic == 0 {
            return Ok(None);
        }
        if magic != PACKET_MAGIC {
            return Err(Error::Corruption(format!(
                "bad packet magic {:#010x}",
                magic
            )));
        }
        let sequence = reader.read_i64::<LittleEndian>().expect("length checked");
        let length = reader.read_u32::<LittleEndian>().expect("length checked");
        let checksum = reader.read_u16::<LittleEndian>().expect("length checked");
        Ok(Some(PacketHeader {
            sequence,
            length,
            checksum,
        }))
    }
}

/// Encodes one sealed packet: header plus concatenated commands.
pub fn encode_packet(sequence: i64, commands: &[Command]) -> Vec<u8> {
    let payload_len: usize = commands.iter().map(Command::encoded_size).sum();
    let mut payload = Vec::with_capacity(payload_len);
    for command in commands {
        command.encode_into(&mut payload);
    }

    let mut buf = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
    buf.write_u32::<LittleEndian>(PACKET_MAGIC).expect("vec write cannot fail");
    buf.write_i64::<LittleEndian>(sequence).expect("vec write cannot fail");
    buf.write_u32::<LittleEndian>(payload.len() as u32)
        .expect("vec write cannot fail");
    buf.write_u16::<LittleEndian>(CRC16.checksum(&payload))
        .expect("vec write cannot fail");
    buf.extend_from_slice(&payload);
    buf
}

/// The reserved end-of-log marker: valid magic, zero length, zero checksum.
pub fn encode_end_marker() -> Vec<u8> {
    let mut buf = Vec::with_capacity(PACKET_HEADER_SIZE);
    buf.write_u32::<LittleEndian>(PACKET_MAGIC).expect("vec write cannot fail");
    buf.write_i64::<LittleEndian>(0).expect("vec write cannot fail");
    buf.write_u32::<LittleEndian>(0).expect("vec write cannot fail");
    buf.write_u16::<LittleEndian>(0).expect("vec write cannot fail");
    buf
}

/// Validates the payload checksum and splits it back into commands.
pub fn decode_payload(header: &PacketHeader, payload: &[u8]) -> Result<Vec<Command>> {
    let computed = CRC16.checksum(payload);
    if computed != header.checksum {
        return Err(Error::Corruption(format!(
            "packet {} checksum mismatch: stored {:#06x}, computed {:#06x}",
            header.sequence, header.checksum, computed
        )));
    }

    let mut commands = Vec::new();
    let mut reader = payload;
    while !reader.is_empty() {
        let length = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Corruption(format!("truncated command length: {}", e)))?
            as usize;
        let kind = reader
            .read_u8()
            .map_err(|e| Error::Corruption(format!("truncated command type: {}", e)))?;
        if reader.len() < length {
            return Err(Error::Corruption(format!(
                "command claims {} bytes, {} remain in packet",
                length,
                reader.len()
            )));
        }
        let (bytes, rest) = reader.split_at(length);
        commands.push(Command::new(kind, bytes.to_vec()));
        reader = rest;
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let commands = vec![
            Command::new(1, vec![0x81, 0x82, 0x83]),
            Command::new(7, vec![]),
            Command::new(2, b"payload".to_vec()),
        ];
        let encoded = encode_packet(42, &commands);

        let header = PacketHeader::decode(&encoded)
            .expect("decode failed")
            .expect("not empty");
        assert_eq!(header.sequence, 42);
        assert!(!header.is_end_marker());

        let decoded = decode_payload(&header, &encoded[PACKET_HEADER_SIZE..])
            .expect("payload decode failed");
        assert_eq!(decoded, commands);
    }

    #[test]
    fn test_magic_is_bit_exact() {
        let encoded = encode_packet(1, &[]);
        assert_eq!(&encoded[..4], &0x4433_2211u32.to_le_bytes());
    }

    #[test]
    fn test_end_marker_detected() {
        let encoded = encode_end_marker();
        let header = PacketHeader::decode(&encoded)
            .expect("decode failed")
            .expect("not empty");
        assert!(header.is_end_marker());
    }

    #[test]
    fn test_all_zero_header_means_empty() {
        let zeros = vec![0u8; PACKET_HEADER_SIZE];
        assert_eq!(PacketHeader::decode(&zeros).expect("decode failed"), None);
    }

    #[test]
    fn test_checksum_flip_is_corruption() {
        let mut encoded = encode_packet(3, &[Command::new(1, vec![9, 9, 9])]);
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        let header = PacketHeader::decode(&encoded)
            .expect("decode failed")
            .expect("not empty");
        match decode_payload(&header, &encoded[PACKET_HEADER_SIZE..]) {
            Err(Error::Corruption(_)) => {}
            other => panic!("expected Corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_command_is_corruption() {
        let encoded = encode_packet(3, &[Command::new(1, vec![1, 2, 3, 4])]);
        let header = PacketHeader::decode(&encoded)
            .expect("decode failed")
            .expect("not empty");
        // Recompute nothing: hand the validator a short payload slice with a
        // checksum computed over it so only the framing check can fail.
        let mut bad = PacketHeader {
            sequence: header.sequence,
            length: header.length - 2,
            checksum: 0,
        };
        let short = &encoded[PACKET_HEADER_SIZE..encoded.len() - 2];
        bad.checksum = crc::Crc::<u16>::new(&crc::CRC_16_IBM_SDLC).checksum(short);
        match decode_payload(&bad, short) {
            Err(Error::Corruption(_)) => {}
            other => panic!("expected Corruption, got {:?}", other),
        }
    }
}
