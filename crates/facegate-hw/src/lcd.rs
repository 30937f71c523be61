//! HD44780 16×2 character LCD behind a PCF8574 I²C backpack.
//!
//! The expander drives the controller in 4-bit mode: P0 = RS, P1 = RW,
//! P2 = EN, P3 = backlight, P4..P7 = D4..D7. Each nibble is latched by
//! writing it with EN high and then again with EN low.

use crate::display::{fit_line, CharDisplay, DisplayError};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Default bus and address for the common PCF8574 backpack on a Pi.
pub const DEFAULT_I2C_BUS: &str = "/dev/i2c-1";
pub const DEFAULT_I2C_ADDRESS: u16 = 0x27;

/// `I2C_SLAVE` from `<linux/i2c-dev.h>`: bind the fd to a target address.
const I2C_SLAVE: libc::c_ulong = 0x0703;

const RS_DATA: u8 = 0x01;
const ENABLE: u8 = 0x04;
const BACKLIGHT: u8 = 0x08;

const CMD_CLEAR: u8 = 0x01;
const CMD_ENTRY_INCREMENT: u8 = 0x06;
const CMD_DISPLAY_ON: u8 = 0x0C;
const CMD_FUNCTION_4BIT_2LINE: u8 = 0x28;
const CMD_SET_DDRAM: u8 = 0x80;

const LINE_ADDRESSES: [u8; 2] = [0x00, 0x40];

/// 16×2 LCD on any byte sink that reaches the expander.
pub struct Lcd1602<W: Write> {
    bus: W,
    backlight: u8,
}

impl Lcd1602<std::fs::File> {
    /// Open an i2c-dev bus, bind it to `address` and initialize the panel.
    pub fn open(bus_path: &str, address: u16) -> Result<Self, DisplayError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(bus_path)
            .map_err(|source| DisplayError::Open {
                path: bus_path.to_string(),
                source,
            })?;

        // SAFETY: fd is valid for the lifetime of `file`; I2C_SLAVE takes the
        // address by value and touches no memory of ours.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), I2C_SLAVE, libc::c_ulong::from(address)) };
        if ret < 0 {
            return Err(DisplayError::Address {
                address,
                source: std::io::Error::last_os_error(),
            });
        }

        tracing::info!(bus = bus_path, address = format_args!("{address:#04x}"), "LCD opened");
        Self::new(file, true)
    }
}

impl<W: Write> Lcd1602<W> {
    /// Run the HD44780 4-bit initialization sequence on `bus`.
    pub fn new(bus: W, backlight: bool) -> Result<Self, DisplayError> {
        let mut lcd = Self {
            bus,
            backlight: if backlight { BACKLIGHT } else { 0 },
        };

        // Power-on wait, then force 8-bit mode three times before switching to 4-bit.
        std::thread::sleep(Duration::from_millis(50));
        lcd.expander_write(0)?;
        for wait in [4_500, 4_500, 150] {
            lcd.pulse(0x30)?;
            std::thread::sleep(Duration::from_micros(wait));
        }
        lcd.pulse(0x20)?;

        lcd.command(CMD_FUNCTION_4BIT_2LINE)?;
        lcd.command(CMD_DISPLAY_ON)?;
        lcd.clear_screen()?;
        lcd.command(CMD_ENTRY_INCREMENT)?;
        Ok(lcd)
    }

    fn expander_write(&mut self, bits: u8) -> Result<(), DisplayError> {
        self.bus.write_all(&[bits | self.backlight])?;
        Ok(())
    }

    /// Latch the high nibble of `bits` (plus RS) into the controller.
    fn pulse(&mut self, bits: u8) -> Result<(), DisplayError> {
        let bits = bits | self.backlight;
        self.bus.write_all(&[bits | ENABLE, bits & !ENABLE])?;
        Ok(())
    }

    fn send(&mut self, value: u8, mode: u8) -> Result<(), DisplayError> {
        self.pulse((value & 0xF0) | mode)?;
        self.pulse(((value << 4) & 0xF0) | mode)
    }

    fn command(&mut self, value: u8) -> Result<(), DisplayError> {
        self.send(value, 0)
    }

    fn clear_screen(&mut self) -> Result<(), DisplayError> {
        self.command(CMD_CLEAR)?;
        std::thread::sleep(Duration::from_millis(2));
        Ok(())
    }

    fn write_line(&mut self, line: usize, text: &str) -> Result<(), DisplayError> {
        self.command(CMD_SET_DDRAM | LINE_ADDRESSES[line])?;
        for ch in fit_line(text).chars() {
            let byte = if ch.is_ascii() { ch as u8 } else { b'?' };
            self.send(byte, RS_DATA)?;
        }
        Ok(())
    }
}

impl<W: Write> CharDisplay for Lcd1602<W> {
    fn render(&mut self, line1: &str, line2: &str) -> Result<(), DisplayError> {
        self.write_line(0, line1)?;
        self.write_line(1, line2)?;
        self.bus.flush()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DisplayError> {
        self.clear_screen()?;
        self.bus.flush()?;
        Ok(())
    }
}
