// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! BF16 chip chain wire format
//!
//! Every chip command travels as one frame `[0x01, chip << 4, opcode, data_length, payload...,
//! checksum]` followed by room for the chip reply. Each concentrator in the path delays the
//! reply by 3 bits, so replies have to be shifted back into byte alignment before parsing.

use crate::error::{self, ErrorKind};

use byteorder::{BigEndian, ByteOrder};
use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

use std::fmt;

/// First byte of every command frame
pub const FRAME_PREFIX: u8 = 0x01;
/// Frame bytes surrounding the payload: prefix, address, opcode, data length, checksum
pub const FRAME_OVERHEAD: usize = 5;
/// Chip id addressing all chips behind a concentrator
pub const BROADCAST_CHIP_ID: u8 = 0x0f;
/// Highest chip id of a single chip
pub const MAX_CHIP_ID: u8 = 10;
/// Number of chips a concentrator can address
pub const CHIPS_PER_CONCENTRATOR: usize = MAX_CHIP_ID as usize + 1;
/// Maximum payload length (data length field is `payload_len - 1`)
pub const MAX_PAYLOAD_LEN: usize = 80;
/// Length of the status reply: status byte and checksum echo
pub const STATUS_REPLY_LEN: usize = 2;
/// Number of nonce slots returned by one nonce read
pub const NONCES_PER_READ: usize = 12;
/// Size of the nonce block returned by one nonce read
pub const NONCE_BLOCK_LEN: usize = NONCES_PER_READ * 4;
/// Nonce block together with its checksum
pub const NONCE_REPLY_LEN: usize = NONCE_BLOCK_LEN + 1;
/// Whitening constant applied by the chip to nonces and task words
pub const SCRAMBLE_XOR: u32 = 0xaaaa_aaaa;
/// Empty nonce slot marker (low 28 bits)
pub const NONCE_SENTINEL: u32 = 0x0fff_ffff;
/// Reply delay of a single concentrator hop in bits
pub const HOP_DELAY_BITS: usize = 3;
/// Fixed payload of the toggle command
pub const TOGGLE_PATTERN: [u8; 4] = [0xa5, 0x5a, 0xa5, 0x5a];
/// Magic value of the clock register
pub const CLOCK_REG_MAGIC: u8 = 0x38;
/// Maximum value of the clock field
pub const MAX_CLOCK: u8 = 0x3f;

/// Physical address of a chip in the whole device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChipAddress {
    pub board: usize,
    pub concentrator: usize,
    pub chip: u8,
}

impl ChipAddress {
    pub fn new(board: usize, concentrator: usize, chip: u8) -> Self {
        Self {
            board,
            concentrator,
            chip,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.chip == BROADCAST_CHIP_ID
    }

    /// Check that the chip id can be put on the wire
    pub fn check(&self) -> error::Result<()> {
        if self.chip > MAX_CHIP_ID && !self.is_broadcast() {
            Err(ErrorKind::Framing(format!(
                "chip id {:#x} out of range, maximum is {} or broadcast {:#x}",
                self.chip, MAX_CHIP_ID, BROADCAST_CHIP_ID
            )))?
        }
        Ok(())
    }
}

impl fmt::Display for ChipAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.board, self.concentrator, self.chip)
    }
}

/// Chip command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Toggle = 0x01,
    SetClock = 0x02,
    SetMask = 0x03,
    TaskWrite = 0x04,
    Reset = 0x07,
    /// Status poll (`0x05`) that also drains the chip nonce block
    ReadNonce = 0x85,
}

impl Opcode {
    /// Flag turning a status poll into a nonce read
    pub const READ_NONCE_FLAG: u8 = 0x80;

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let opcode = match code {
            0x01 => Opcode::Toggle,
            0x02 => Opcode::SetClock,
            0x03 => Opcode::SetMask,
            0x04 => Opcode::TaskWrite,
            0x07 => Opcode::Reset,
            0x85 => Opcode::ReadNonce,
            _ => return None,
        };
        Some(opcode)
    }

    pub fn reads_nonces(self) -> bool {
        self.code() & Self::READ_NONCE_FLAG != 0
    }
}

/// Number of extra reply bytes needed to absorb the hop delay
pub fn extra_echo_bytes(depth: usize) -> usize {
    (depth * HOP_DELAY_BITS) / 8 + 1
}

/// Length of the reply area following a command frame
pub fn reply_len(depth: usize, opcode: Opcode) -> usize {
    let len = STATUS_REPLY_LEN + extra_echo_bytes(depth);
    if opcode.reads_nonces() {
        len + NONCE_REPLY_LEN
    } else {
        len
    }
}

/// Shift the whole buffer left by `bits`, bits shifted out of the front are lost and zeros are
/// shifted in from the back
pub fn shift_bits(buf: &mut [u8], bits: usize) {
    let byte_shift = bits / 8;
    let bit_shift = bits % 8;
    let len = buf.len();

    for i in 0..len {
        let src = i + byte_shift;
        let hi = if src < len { buf[src] } else { 0 };
        let lo = if src + 1 < len { buf[src + 1] } else { 0 };
        buf[i] = if bit_shift == 0 {
            hi
        } else {
            (hi << bit_shift) | (lo >> (8 - bit_shift))
        };
    }
}

/// 8-bit additive checksum
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Empty nonce slots are marked with all ones in the low 28 bits
pub fn is_sentinel(nonce: u32) -> bool {
    nonce & NONCE_SENTINEL == NONCE_SENTINEL
}

/// Undo the chip whitening of a nonce; empty slots are kept as they are
pub fn descramble_nonce(raw: u32) -> u32 {
    if is_sentinel(raw) {
        raw
    } else {
        raw ^ SCRAMBLE_XOR
    }
}

/// Serialized chip command
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub checksum: u8,
    /// Bytes occupied by the reply behind the frame
    pub reply_len: usize,
}

impl Frame {
    /// Total bytes the command takes in a batch
    pub fn footprint(&self) -> usize {
        self.bytes.len() + self.reply_len
    }
}

/// Build a command frame for `chip`. Commands without arguments carry a single zero byte.
pub fn encode_command(
    chip: ChipAddress,
    depth: usize,
    opcode: Opcode,
    payload: &[u8],
) -> error::Result<Frame> {
    chip.check()?;
    let payload: &[u8] = if payload.is_empty() { &[0] } else { payload };
    if payload.len() > MAX_PAYLOAD_LEN {
        Err(ErrorKind::Framing(format!(
            "payload of {} bytes exceeds maximum of {} bytes",
            payload.len(),
            MAX_PAYLOAD_LEN
        )))?
    }

    let mut bytes = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    bytes.push(FRAME_PREFIX);
    bytes.push(chip.chip << 4);
    bytes.push(opcode.code());
    bytes.push((payload.len() - 1) as u8);
    bytes.extend_from_slice(payload);
    let sum = checksum(&bytes[2..]);
    bytes.push(sum);

    Ok(Frame {
        bytes,
        checksum: sum,
        reply_len: reply_len(depth, opcode),
    })
}

/// Chip status byte
#[derive(PackedStruct, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct ChipStatus {
    /// Parity of the task buffer the chip is working on
    #[packed_field(bits = "0")]
    pub task_parity: bool,
    /// Written task waits for the current one to finish
    #[packed_field(bits = "2")]
    pub task_pending: bool,
}

impl ChipStatus {
    pub fn from_byte(byte: u8) -> Self {
        // unpacking a single byte cannot fail
        Self::unpack(&[byte]).unwrap_or_default()
    }

    pub fn to_byte(&self) -> u8 {
        self.pack()[0]
    }
}

/// Chip reply after hop delay correction
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: ChipStatus,
    pub checksum: u8,
    pub checksum_ok: bool,
    pub nonce_checksum_ok: bool,
    /// Descrambled nonce slots, present for nonce reads only
    pub nonces: Option<[u32; NONCES_PER_READ]>,
}

/// Nonce block checksum. The chip reports either the plain sum or the sum plus one.
pub fn nonce_checksum_matches(block: &[u8], received: u8) -> bool {
    let sum = checksum(block);
    received == sum || received == sum.wrapping_add(1)
}

/// Parse the raw reply area of a command frame sent through `depth` hops
pub fn decode_reply(
    raw: &[u8],
    depth: usize,
    opcode: Opcode,
    frame_checksum: u8,
) -> error::Result<Reply> {
    let expected = reply_len(depth, opcode);
    if raw.len() < expected {
        Err(ErrorKind::Framing(format!(
            "reply of {} bytes is shorter than expected {} bytes",
            raw.len(),
            expected
        )))?
    }

    let mut buf = raw[..expected].to_vec();
    shift_bits(&mut buf, depth * HOP_DELAY_BITS);

    let status = ChipStatus::from_byte(buf[0]);
    let checksum = buf[1];
    let mut reply = Reply {
        status,
        checksum,
        checksum_ok: checksum == frame_checksum,
        nonce_checksum_ok: true,
        nonces: None,
    };

    if opcode.reads_nonces() {
        let block = &buf[STATUS_REPLY_LEN..STATUS_REPLY_LEN + NONCE_BLOCK_LEN];
        let mut nonces = [0u32; NONCES_PER_READ];
        for (i, nonce) in nonces.iter_mut().enumerate() {
            *nonce = descramble_nonce(BigEndian::read_u32(&block[i * 4..i * 4 + 4]));
        }
        reply.nonce_checksum_ok =
            nonce_checksum_matches(block, buf[STATUS_REPLY_LEN + NONCE_BLOCK_LEN]);
        reply.nonces = Some(nonces);
    }
    Ok(reply)
}

/// Clock register. The clock and prescaler fields are duplicated in both halves.
#[derive(PackedStruct, Clone, Debug, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct ClockReg {
    #[packed_field(bits = "27:20")]
    magic: Integer<u8, packed_bits::Bits8>,
    #[packed_field(bits = "19")]
    prescaler_hi: bool,
    #[packed_field(bits = "18:13")]
    clock_hi: Integer<u8, packed_bits::Bits6>,
    #[packed_field(bits = "6")]
    prescaler_lo: bool,
    #[packed_field(bits = "5:0")]
    clock_lo: Integer<u8, packed_bits::Bits6>,
}

impl ClockReg {
    pub fn new(clock: u8, prescaler: u8) -> error::Result<Self> {
        if clock > MAX_CLOCK {
            Err(ErrorKind::Clock(format!(
                "clock value {:#x} is out of range, maximum allowed is {:#x}",
                clock, MAX_CLOCK
            )))?
        }
        if prescaler > 1 {
            Err(ErrorKind::Clock(format!(
                "prescaler {} is out of range, only 0 or 1 allowed",
                prescaler
            )))?
        }
        Ok(Self {
            magic: CLOCK_REG_MAGIC.into(),
            prescaler_hi: prescaler == 1,
            clock_hi: clock.into(),
            prescaler_lo: prescaler == 1,
            clock_lo: clock.into(),
        })
    }

    pub fn to_reg(&self) -> u32 {
        u32::from_be_bytes(self.pack())
    }
}

/// Payload of the set clock command, the register goes out least significant byte first
pub fn generate_clock_word(clock: u8, prescaler: u8) -> error::Result<[u8; 4]> {
    Ok(ClockReg::new(clock, prescaler)?.to_reg().to_le_bytes())
}

/// Single step of the concentrator routing path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    None = 0b000,
    Local = 0b001,
    Chain1 = 0b010,
    Chain2 = 0b011,
}

impl Hop {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b000 => Some(Hop::None),
            0b001 => Some(Hop::Local),
            0b010 => Some(Hop::Chain1),
            0b011 => Some(Hop::Chain2),
            _ => None,
        }
    }
}

/// Hop sequence opening (or closing) an SPI channel to one concentrator
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPath {
    pub hops: Vec<Hop>,
}

impl ChannelPath {
    /// Path to `concentrator` on a board with `per_chain` concentrators on each of its two
    /// chains. Each concentrator passes commands to its own chips (local hop) or to the next one
    /// down the chain (chain 1 hop). The first concentrator of the first chain also feeds the
    /// second chain (chain 2 hop).
    pub fn resolve(concentrator: usize, per_chain: usize) -> error::Result<Self> {
        if per_chain == 0 || concentrator >= 2 * per_chain {
            Err(ErrorKind::Framing(format!(
                "concentrator {} does not exist on a board with {} concentrators per chain",
                concentrator, per_chain
            )))?
        }
        let mut hops = Vec::new();
        if concentrator / per_chain != 0 {
            hops.push(Hop::Chain2);
        }
        hops.extend(std::iter::repeat(Hop::Chain1).take(concentrator % per_chain));
        hops.push(Hop::Local);
        Ok(Self { hops })
    }

    /// Inverse of [`ChannelPath::resolve`]
    pub fn concentrator(&self, per_chain: usize) -> Option<usize> {
        let (last, route) = self.hops.split_last()?;
        if *last != Hop::Local {
            return None;
        }
        let (chain, route) = match route.split_first() {
            Some((Hop::Chain2, rest)) => (1, rest),
            _ => (0, route),
        };
        if route.iter().any(|hop| *hop != Hop::Chain1) || route.len() >= per_chain {
            return None;
        }
        Some(chain * per_chain + route.len())
    }

    /// Path of the same length closing every hop
    pub fn destroy(&self) -> Self {
        Self {
            hops: vec![Hop::None; self.hops.len()],
        }
    }

    /// Number of concentrators the commands pass through
    pub fn depth(&self) -> usize {
        self.hops.len()
    }

    /// Pack 3-bit hop codes, most significant bit first
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; (self.hops.len() * HOP_DELAY_BITS) / 8 + 1];
        for (i, hop) in self.hops.iter().enumerate() {
            let code = *hop as u8;
            for bit in 0..HOP_DELAY_BITS {
                if code & (1 << (HOP_DELAY_BITS - 1 - bit)) != 0 {
                    let pos = i * HOP_DELAY_BITS + bit;
                    bytes[pos / 8] |= 0x80 >> (pos % 8);
                }
            }
        }
        bytes
    }

    /// Unpack a path up to the first local hop. Paths without one are not valid channel paths.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut hops = Vec::new();
        for i in 0..(bytes.len() * 8) / HOP_DELAY_BITS {
            let mut code = 0u8;
            for bit in 0..HOP_DELAY_BITS {
                let pos = i * HOP_DELAY_BITS + bit;
                code <<= 1;
                if bytes[pos / 8] & (0x80 >> (pos % 8)) != 0 {
                    code |= 1;
                }
            }
            let hop = Hop::from_bits(code)?;
            hops.push(hop);
            match hop {
                Hop::Local => return Some(Self { hops }),
                Hop::None => return None,
                _ => (),
            }
        }
        None
    }
}
