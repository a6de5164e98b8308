//! Device-originated framed command packets.
//!
//! Panel devices send commands upstream as framed packets:
//! `[0xBB][0x88][type<<5 | address][size][data…][checksum]` where the
//! checksum is the wrapping byte sum of the packed type/address byte, the
//! size byte, and every data byte. A packet is only surfaced when the
//! trailing checksum matches; anything malformed is silently discarded and
//! the parser returns to its start state. This is the wire format's noise
//! tolerance, not an error path.

use super::{PACKET_LEADIN, PACKET_START};

/// Maximum command payload carried by one packet.
pub const MAX_PACKET_DATA: usize = 64;

/// A decoded command packet from a panel device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    /// 3-bit packet type.
    pub packet_type: u8,
    /// 5-bit address of the originating device on the bus.
    pub source_address: u8,
    /// Command payload.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketState {
    Start,
    LeadIn,
    Address,
    Size,
    Data,
    Checksum,
}

/// State machine decoding device command packets byte by byte.
pub struct PacketParser {
    state: PacketState,
    packet_type: u8,
    address: u8,
    size: u8,
    index: usize,
    buffer: [u8; MAX_PACKET_DATA],
    checksum: u8,
    discarded: u64,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser {
    /// Create a parser waiting for a start marker.
    pub fn new() -> Self {
        Self {
            state: PacketState::Start,
            packet_type: 0,
            address: 0,
            size: 0,
            index: 0,
            buffer: [0; MAX_PACKET_DATA],
            checksum: 0,
            discarded: 0,
        }
    }

    /// Packets rejected for a checksum mismatch since construction.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Consume one byte; returns a packet when one completes with a valid
    /// checksum.
    pub fn process_byte(&mut self, byte: u8) -> Option<CommandPacket> {
        match self.state {
            PacketState::Start => {
                if byte == PACKET_START {
                    self.state = PacketState::LeadIn;
                }
                None
            }

            PacketState::LeadIn => {
                if byte == PACKET_LEADIN {
                    self.state = PacketState::Address;
                } else {
                    self.reset();
                }
                None
            }

            PacketState::Address => {
                self.packet_type = byte >> 5;
                self.address = byte & 0x1f;
                self.checksum = byte;
                self.state = PacketState::Size;
                None
            }

            PacketState::Size => {
                if usize::from(byte) > MAX_PACKET_DATA {
                    // Malformed; no device sends more than the buffer holds.
                    self.reset();
                    return None;
                }
                self.size = byte;
                self.checksum = self.checksum.wrapping_add(byte);
                self.state = if byte > 0 {
                    PacketState::Data
                } else {
                    PacketState::Checksum
                };
                None
            }

            PacketState::Data => {
                self.checksum = self.checksum.wrapping_add(byte);
                self.buffer[self.index] = byte;
                self.index += 1;
                if self.index == usize::from(self.size) {
                    self.state = PacketState::Checksum;
                }
                None
            }

            PacketState::Checksum => {
                let packet = if byte == self.checksum {
                    Some(CommandPacket {
                        packet_type: self.packet_type,
                        source_address: self.address,
                        data: self.buffer[..usize::from(self.size)].to_vec(),
                    })
                } else {
                    self.discarded += 1;
                    None
                };
                self.reset();
                packet
            }
        }
    }

    fn reset(&mut self) {
        self.state = PacketState::Start;
        self.index = 0;
        self.size = 0;
        self.checksum = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet_type: u8, address: u8, data: &[u8]) -> Vec<u8> {
        let header = (packet_type << 5) | (address & 0x1f);
        let mut bytes = vec![PACKET_START, PACKET_LEADIN, header, data.len() as u8];
        bytes.extend_from_slice(data);
        let checksum = data
            .iter()
            .fold(header.wrapping_add(data.len() as u8), |sum, &b| {
                sum.wrapping_add(b)
            });
        bytes.push(checksum);
        bytes
    }

    fn feed(parser: &mut PacketParser, bytes: &[u8]) -> Vec<CommandPacket> {
        bytes
            .iter()
            .filter_map(|&b| parser.process_byte(b))
            .collect()
    }

    #[test]
    fn decodes_valid_packet() {
        let mut parser = PacketParser::new();
        let packets = feed(&mut parser, &encode(2, 0x11, b"TEST 1\n"));
        assert_eq!(
            packets,
            vec![CommandPacket {
                packet_type: 2,
                source_address: 0x11,
                data: b"TEST 1\n".to_vec(),
            }]
        );
        assert_eq!(parser.discarded(), 0);
    }

    #[test]
    fn zero_length_packet_goes_straight_to_checksum() {
        let mut parser = PacketParser::new();
        let packets = feed(&mut parser, &encode(0, 3, &[]));
        assert_eq!(packets.len(), 1);
        assert!(packets[0].data.is_empty());
    }

    #[test]
    fn bad_lead_in_resets_to_start() {
        let mut parser = PacketParser::new();
        assert!(feed(&mut parser, &[PACKET_START, 0x00]).is_empty());
        // A complete packet right after still decodes.
        assert_eq!(feed(&mut parser, &encode(1, 1, &[0xAA])).len(), 1);
    }

    #[test]
    fn checksum_mismatch_discards_silently() {
        let mut parser = PacketParser::new();
        let mut bytes = encode(1, 4, &[1, 2, 3]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(feed(&mut parser, &bytes).is_empty());
        assert_eq!(parser.discarded(), 1);
        // Parser has reset and accepts the next packet.
        assert_eq!(feed(&mut parser, &encode(1, 4, &[1, 2, 3])).len(), 1);
    }

    #[test]
    fn any_single_bit_flip_in_payload_rejects() {
        let good = encode(3, 7, &[0x10, 0x20, 0x30]);
        for byte_index in 4..good.len() {
            for bit in 0..8 {
                let mut corrupted = good.clone();
                corrupted[byte_index] ^= 1 << bit;
                let mut parser = PacketParser::new();
                assert!(
                    feed(&mut parser, &corrupted).is_empty(),
                    "bit {bit} of byte {byte_index} accepted"
                );
            }
        }
    }

    #[test]
    fn oversized_length_is_rejected_as_malformed() {
        let mut parser = PacketParser::new();
        let header = (1u8 << 5) | 2;
        assert!(feed(&mut parser, &[PACKET_START, PACKET_LEADIN, header, 0xFF]).is_empty());
        // Parser is back at start.
        assert_eq!(feed(&mut parser, &encode(1, 2, &[9])).len(), 1);
    }

    #[test]
    fn type_and_address_unpack_from_header_byte() {
        let mut parser = PacketParser::new();
        let packets = feed(&mut parser, &encode(0b111, 0b11111, &[0x01]));
        assert_eq!(packets[0].packet_type, 0b111);
        assert_eq!(packets[0].source_address, 0b11111);
    }
}
