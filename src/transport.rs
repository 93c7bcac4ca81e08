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

//! SPI transport used to talk to the chip chain

use crate::error::{self, ErrorKind};

use embedded_hal::blocking::spi::Transfer;
use failure::ResultExt;
use linux_embedded_hal::Spidev;

/// Full-duplex blocking transfer of a whole command batch
pub trait SpiTransport: Send {
    /// Send `tx` on `channel` and receive the same number of bytes into `rx`. A transfer either
    /// completes in full or fails.
    fn transfer(&mut self, channel: u8, tx: &[u8], rx: &mut [u8]) -> error::Result<()>;
}

/// Transport over a Linux `spidev` device serving a single channel. Bus speed and mode come from
/// the device tree.
pub struct SpidevTransport {
    channel: u8,
    device: Spidev,
}

impl SpidevTransport {
    pub fn open(path: &str, channel: u8) -> error::Result<Self> {
        let device =
            Spidev::open(path).with_context(|_| format!("cannot open SPI device {}", path))?;
        Ok(Self { channel, device })
    }
}

impl SpiTransport for SpidevTransport {
    fn transfer(&mut self, channel: u8, tx: &[u8], rx: &mut [u8]) -> error::Result<()> {
        if channel != self.channel {
            Err(ErrorKind::Transport(
                channel,
                format!("device serves channel {}", self.channel),
            ))?
        }
        if tx.len() != rx.len() {
            Err(ErrorKind::Transport(
                channel,
                format!("length mismatch: tx {} rx {}", tx.len(), rx.len()),
            ))?
        }
        rx.copy_from_slice(tx);
        self.device
            .transfer(rx)
            .map_err(|e| ErrorKind::Transport(channel, e.to_string()))?;
        Ok(())
    }
}
