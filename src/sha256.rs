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

//! SHA-256 rounds the chip does not compute itself
//!
//! A BF16 task carries the working variables after the first three rounds of the second header
//! chunk. The chip resumes the compression from there, the driver precomputes them from the
//! midstate.

/// Round constants of the precomputed rounds
const K: [u32; 3] = [0x428a2f98, 0x71374491, 0xb5c0fbcf];

/// Working variables `a..h` of the compression function
pub type State = [u32; 8];

#[inline]
fn round(state: &mut State, k: u32, w: u32) {
    let [a, b, c, d, e, f, g, h] = *state;
    let s1 = e.rotate_right(6) ^ e.rotate_right(11) ^ e.rotate_right(25);
    let ch = (e & f) ^ (!e & g);
    let t1 = h
        .wrapping_add(s1)
        .wrapping_add(ch)
        .wrapping_add(k)
        .wrapping_add(w);
    let s0 = a.rotate_right(2) ^ a.rotate_right(13) ^ a.rotate_right(22);
    let maj = (a & b) ^ (a & c) ^ (b & c);
    let t2 = s0.wrapping_add(maj);

    *state = [t1.wrapping_add(t2), a, b, c, d.wrapping_add(t1), e, f, g];
}

/// First three rounds over the tail words of the header (merkle tail, ntime, nbits) starting
/// from the midstate. The chip picks up the computation from here.
pub fn ms3_steps(midstate: &State, words: &[u32; 3]) -> State {
    let mut state = *midstate;
    for (k, word) in K.iter().zip(words.iter()) {
        round(&mut state, *k, *word);
    }
    state
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ms3_steps_rotation() {
        let midstate = [1, 2, 3, 4, 5, 6, 7, 8];
        let words = [0xdeadbeef, 0x4f672614, 0x1a0b3287];
        let state = ms3_steps(&midstate, &words);
        // after three rounds the original `a` and `e` have moved to `d` and `h`
        assert_eq!(state[3], midstate[0]);
        assert_eq!(state[7], midstate[4]);
        assert_ne!(state, ms3_steps(&midstate, &[0xdeadbeef, 0x4f672615, 0x1a0b3287]));
    }

    #[test]
    fn test_ms3_first_round() {
        // single round from the SHA-256 initial value with a zero message word
        let iv = [
            0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
            0x5be0cd19,
        ];
        let mut state = iv;
        round(&mut state, K[0], 0);
        let full = ms3_steps(&iv, &[0, 0, 0]);
        // rounds two and three only shift the first result down the state
        assert_eq!(full[2], state[0]);
        assert_eq!(full[6], state[4]);
    }
}
