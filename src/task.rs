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

//! Chip task generator
//!
//! A task is the 80 byte blob a chip mines against. It carries the midstate, the state after
//! the first three SHA-256 rounds of the second header block, the header tail and the nonce
//! mask. All words are whitened and sent most significant byte first.

use crate::bf16::SCRAMBLE_XOR;
use crate::error::{self, ErrorKind};
use crate::sha256;

use byteorder::{BigEndian, ByteOrder};

/// Size of the task blob
pub const TASK_LEN: usize = 80;
/// Maximum number of fixed nonce bits the mask can carry
pub const MAX_MASK_BITS: u8 = 27;
/// Position of the fixed bit count inside the mask
const MASK_BITS_SHIFT: u32 = 27;

/// Order in which the ms3 working variables are stored in the task
const MS3_ORDER: [usize; 8] = [4, 5, 6, 7, 0, 1, 2, 3];

pub type Task = [u8; TASK_LEN];

/// Header tail as SHA-256 message words
pub fn tail_words(merkle_tail: u32, ntime: u32, nbits: u32) -> [u32; 3] {
    [
        merkle_tail.swap_bytes(),
        ntime.swap_bytes(),
        nbits.swap_bytes(),
    ]
}

/// Build the task blob for given work
pub fn generate_task(
    midstate: &[u32; 8],
    merkle_tail: u32,
    ntime: u32,
    nbits: u32,
    mask: u32,
) -> Task {
    let mut task = [0u8; TASK_LEN];
    let words = tail_words(merkle_tail, ntime, nbits);
    let ms3 = sha256::ms3_steps(midstate, &words);

    for (i, word) in midstate.iter().enumerate() {
        BigEndian::write_u32(&mut task[i * 4..], word ^ SCRAMBLE_XOR);
    }
    for (i, index) in MS3_ORDER.iter().enumerate() {
        BigEndian::write_u32(&mut task[32 + i * 4..], ms3[*index] ^ SCRAMBLE_XOR);
    }
    for (i, word) in words.iter().enumerate() {
        BigEndian::write_u32(&mut task[64 + i * 4..], word ^ SCRAMBLE_XOR);
    }
    BigEndian::write_u32(&mut task[76..], mask);
    task
}

/// Fields of a task blob as the chip sees them
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFields {
    pub midstate: [u32; 8],
    pub merkle_tail: u32,
    pub ntime: u32,
    pub nbits: u32,
    pub mask: u32,
}

/// Recover the work fields from a task blob
pub fn parse_task(task: &Task) -> TaskFields {
    let mut midstate = [0u32; 8];
    for (i, word) in midstate.iter_mut().enumerate() {
        *word = BigEndian::read_u32(&task[i * 4..]) ^ SCRAMBLE_XOR;
    }
    let word = |offset: usize| (BigEndian::read_u32(&task[offset..]) ^ SCRAMBLE_XOR).swap_bytes();
    TaskFields {
        midstate,
        merkle_tail: word(64),
        ntime: word(68),
        nbits: word(72),
        mask: BigEndian::read_u32(&task[76..]),
    }
}

/// Mask that fixes the low `bits` bits of the (whitened) nonce to those of `nonce`
pub fn generate_nonce_mask(nonce: u32, bits: u8) -> error::Result<u32> {
    if bits > MAX_MASK_BITS {
        Err(ErrorKind::Mask(format!(
            "{} fixed bits requested, maximum is {}",
            bits, MAX_MASK_BITS
        )))?
    }
    Ok(((bits as u32) << MASK_BITS_SHIFT) | ((nonce ^ SCRAMBLE_XOR) & low_bits(bits)))
}

fn low_bits(bits: u8) -> u32 {
    (1u32 << bits) - 1
}

/// Number of fixed bits in `mask`
pub fn mask_bits(mask: u32) -> u8 {
    (mask >> MASK_BITS_SHIFT) as u8
}

/// Check whether a chip restricted by `mask` can produce `nonce`
pub fn mask_covers(mask: u32, nonce: u32) -> bool {
    let bits = mask_bits(mask).min(MAX_MASK_BITS);
    let low = low_bits(bits);
    (nonce ^ SCRAMBLE_XOR) & low == mask & low
}

#[cfg(test)]
mod test {
    use super::*;

    const MIDSTATE: [u32; 8] = [
        0x4a548fe4, 0x71fa3a9a, 0x13711445, 0x56c3f64d, 0x2500b482, 0x6008fe4b, 0xbf7698c9,
        0x4eba7946,
    ];

    #[test]
    fn test_task_layout() {
        let mask = generate_nonce_mask(0xa2870100, 16).expect("mask");
        let task = generate_task(&MIDSTATE, 0xce22a72f, 0x4f672614, 0x1a0b3287, mask);

        assert_eq!(task[..4], (MIDSTATE[0] ^ 0xaaaa_aaaa).to_be_bytes());
        assert_eq!(task[28..32], (MIDSTATE[7] ^ 0xaaaa_aaaa).to_be_bytes());

        let ms3 = sha256::ms3_steps(&MIDSTATE, &tail_words(0xce22a72f, 0x4f672614, 0x1a0b3287));
        let expected_order = [ms3[4], ms3[5], ms3[6], ms3[7], ms3[0], ms3[1], ms3[2], ms3[3]];
        for (i, value) in expected_order.iter().enumerate() {
            assert_eq!(
                task[32 + i * 4..36 + i * 4],
                (value ^ 0xaaaa_aaaa).to_be_bytes(),
                "ms3 word {} misplaced: {:#04x?}",
                i,
                &task[32..64]
            );
        }
        assert_eq!(task[64..68], (0xce22a72fu32.swap_bytes() ^ 0xaaaa_aaaa).to_be_bytes());
        assert_eq!(task[68..72], (0x4f672614u32.swap_bytes() ^ 0xaaaa_aaaa).to_be_bytes());
        assert_eq!(task[72..76], (0x1a0b3287u32.swap_bytes() ^ 0xaaaa_aaaa).to_be_bytes());
        assert_eq!(task[76..], mask.to_be_bytes());
    }

    #[test]
    fn test_parse_task() {
        let task = generate_task(&MIDSTATE, 0x11223344, 1332160020, 436941447, 0);
        let fields = parse_task(&task);
        assert_eq!(fields.midstate, MIDSTATE);
        assert_eq!(fields.merkle_tail, 0x11223344);
        assert_eq!(fields.ntime, 1332160020);
        assert_eq!(fields.nbits, 436941447);
        assert_eq!(fields.mask, 0);
    }

    #[test]
    fn test_nonce_mask_round_trip() {
        for nonce in [0u32, 0xa2870100, 0xffff_ffff, 0x1234_5678].iter() {
            for bits in 1..=20u8 {
                let mask = generate_nonce_mask(*nonce, bits).expect("mask");
                assert_eq!(mask_bits(mask), bits);
                let low = (1u32 << bits) - 1;
                assert_eq!(
                    mask & low,
                    (nonce ^ 0xaaaa_aaaa) & low,
                    "low bits of mask {:#x} for nonce {:#x}/{}",
                    mask,
                    nonce,
                    bits
                );
                assert!(mask_covers(mask, *nonce));
                assert!(!mask_covers(mask, nonce ^ 1));
            }
        }
    }

    #[test]
    fn test_nonce_mask_limits() {
        assert_eq!(generate_nonce_mask(0x1234_5678, 0).expect("mask"), 0);
        assert!(mask_covers(0, 0x1234_5678));
        assert!(generate_nonce_mask(0, 27).is_ok());
        assert!(generate_nonce_mask(0, 28).is_err());
    }
}
