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

//! Board reset lines

use crate::error;

use embedded_hal;
use embedded_hal::digital::v2::OutputPin;
use sysfs_gpio;

use std::thread;
use std::time::Duration;

/// How long the reset line is held low
pub const RESET_HOLD: Duration = Duration::from_millis(100);
/// Time the chain needs after reset release
pub const RESET_SETTLE: Duration = Duration::from_millis(200);

/// Helper struct for altering output pins which implements OutputPin trait
#[derive(Clone)]
pub struct PinOut(sysfs_gpio::Pin);

impl embedded_hal::digital::v2::OutputPin for PinOut {
    type Error = sysfs_gpio::Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(0)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(1)
    }
}

impl PinOut {
    /// Export sysfs GPIO `pin_num` and configure it as output
    pub fn open(pin_num: u64) -> error::Result<Self> {
        let pin = sysfs_gpio::Pin::new(pin_num);
        pin.export()?;
        pin.set_direction(sysfs_gpio::Direction::Out)?;
        Ok(PinOut(pin))
    }
}

/// Pulse an active low reset line
pub fn reset_pulse<P: OutputPin>(
    pin: &mut P,
    hold: Duration,
    settle: Duration,
) -> Result<(), P::Error> {
    pin.set_low()?;
    thread::sleep(hold);
    pin.set_high()?;
    thread::sleep(settle);
    Ok(())
}

/// Reset the chip chain of a board through its GPIO line
pub fn reset_board(pin_num: u64) -> error::Result<()> {
    let mut pin = PinOut::open(pin_num)?;
    reset_pulse(&mut pin, RESET_HOLD, RESET_SETTLE)?;
    Ok(())
}
