//! NAND bus implementation that bit-bangs GPIO lines through the Linux GPIO
//! character device.
//!
//! The chip sits on an 8-bit parallel bus with the usual control lines:
//! CLE/ALE pick what a write strobe latches (command vs. address), WE#/RE#
//! strobe data in and out, CE# per chip select, WP# gates program/erase, and
//! R/B# reports busy. All the control lines are active-low; values in this
//! module are electrical levels, so "select" means driving CE# low.
//!
//! Every line transition is a `set_value` syscall, which is already far
//! slower than the chip's minimum strobe widths, so no explicit delays are
//! inserted between edges.

use std::time::{Duration, Instant};

use gpiocdev::line::{Offset, Value};
use gpiocdev::request::{Config, Request};

use super::NandBus;
use crate::error::{Error, Result};

/// GPIO line assignments for one NAND bus.
#[derive(Debug, Clone)]
pub struct GpioPins {
    /// Device path (e.g. "/dev/gpiochip0")
    pub chip: String,
    /// IO0..IO7, the data bus
    pub io: [Offset; 8],
    /// CE# per chip select
    pub ce: Vec<Offset>,
    /// Command latch enable
    pub cle: Offset,
    /// Address latch enable
    pub ale: Offset,
    /// Write strobe (WE#)
    pub web: Offset,
    /// Read strobe (RE#)
    pub reb: Offset,
    /// Write protect (WP#)
    pub wpb: Offset,
    /// Ready/busy (R/B#), input, busy-low
    pub rbb: Offset,
}

impl GpioPins {
    /// The reference wiring: data bus on lines 0-7, then CE0#, CE1#, CLE,
    /// ALE, WP#, WE#, RE#, R/B# on lines 8-15.
    pub fn reference(chip: impl Into<String>) -> Self {
        Self {
            chip: chip.into(),
            io: [0, 1, 2, 3, 4, 5, 6, 7],
            ce: vec![8, 9],
            cle: 10,
            ale: 11,
            wpb: 12,
            web: 13,
            reb: 14,
            rbb: 15,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DataDirection {
    Output,
    Input,
}

/// A NAND bus bit-banged over Linux GPIO lines.
pub struct GpioBus {
    request: Request,
    pins: GpioPins,
    data_dir: DataDirection,
}

fn level(high: bool) -> Value {
    if high {
        Value::Active
    } else {
        Value::Inactive
    }
}

impl GpioBus {
    /// Request all lines and park the bus in its idle state: everything
    /// deselected, both strobes high, write protect off.
    pub fn open(pins: GpioPins) -> Result<Self> {
        log::debug!("gpio: opening {} for NAND bit-bang", pins.chip);

        let mut config = Config::default();
        for &io in &pins.io {
            config.with_line(io).as_output(Value::Inactive);
        }
        for &ce in &pins.ce {
            // CE# high: nothing selected
            config.with_line(ce).as_output(Value::Active);
        }
        config.with_line(pins.cle).as_output(Value::Inactive);
        config.with_line(pins.ale).as_output(Value::Inactive);
        config.with_line(pins.web).as_output(Value::Active);
        config.with_line(pins.reb).as_output(Value::Active);
        // WP# high: program/erase allowed
        config.with_line(pins.wpb).as_output(Value::Active);
        config.with_line(pins.rbb).as_input();

        let request = Request::from_config(config)
            .on_chip(&pins.chip)
            .with_consumer("nand-gadget")
            .request()?;

        Ok(Self {
            request,
            pins,
            data_dir: DataDirection::Output,
        })
    }

    fn set(&self, offset: Offset, high: bool) -> Result<()> {
        self.request.set_value(offset, level(high))?;
        Ok(())
    }

    fn set_data_dir(&mut self, dir: DataDirection) -> Result<()> {
        if self.data_dir == dir {
            return Ok(());
        }

        let mut config = Config::default();
        for &io in &self.pins.io {
            match dir {
                DataDirection::Output => config.with_line(io).as_output(Value::Inactive),
                DataDirection::Input => config.with_line(io).as_input(),
            };
        }
        self.request.reconfigure(&config)?;
        self.data_dir = dir;
        Ok(())
    }

    fn put_data(&mut self, byte: u8) -> Result<()> {
        self.set_data_dir(DataDirection::Output)?;
        for (bit, &io) in self.pins.io.iter().enumerate() {
            self.set(io, byte & (1 << bit) != 0)?;
        }
        Ok(())
    }

    fn get_data(&self) -> Result<u8> {
        let mut byte = 0u8;
        for (bit, &io) in self.pins.io.iter().enumerate() {
            if self.request.value(io)? == Value::Active {
                byte |= 1 << bit;
            }
        }
        Ok(byte)
    }

    /// One WE# strobe: whatever is on the bus gets latched on the rising
    /// edge.
    fn write_strobe(&self) -> Result<()> {
        self.set(self.pins.web, false)?;
        self.set(self.pins.web, true)
    }
}

impl NandBus for GpioBus {
    fn select(&mut self, cs: usize) -> Result<()> {
        if cs >= self.pins.ce.len() {
            return Err(Error::ChipOutOfRange {
                cs,
                num_cs: self.pins.ce.len(),
            });
        }
        for (i, &ce) in self.pins.ce.iter().enumerate() {
            self.set(ce, i != cs)?;
        }
        Ok(())
    }

    fn deselect(&mut self) -> Result<()> {
        for &ce in &self.pins.ce {
            self.set(ce, true)?;
        }
        Ok(())
    }

    fn write_protect(&mut self, enable: bool) -> Result<()> {
        log::trace!("gpio: write protect {}", if enable { "on" } else { "off" });
        self.set(self.pins.wpb, !enable)
    }

    fn cmd(&mut self, opcode: u8) -> Result<()> {
        self.put_data(opcode)?;
        self.set(self.pins.cle, true)?;
        self.write_strobe()?;
        self.set(self.pins.cle, false)
    }

    fn address(&mut self, cycles: &[u8]) -> Result<()> {
        for &cycle in cycles {
            self.put_data(cycle)?;
            self.set(self.pins.ale, true)?;
            self.write_strobe()?;
            self.set(self.pins.ale, false)?;
        }
        Ok(())
    }

    fn data_out(&mut self, data: &[u8]) -> Result<()> {
        for &byte in data {
            self.put_data(byte)?;
            self.write_strobe()?;
        }
        Ok(())
    }

    fn data_in(&mut self, buf: &mut [u8]) -> Result<()> {
        self.set_data_dir(DataDirection::Input)?;
        for byte in buf.iter_mut() {
            self.set(self.pins.reb, false)?;
            *byte = self.get_data()?;
            self.set(self.pins.reb, true)?;
        }
        self.set_data_dir(DataDirection::Output)
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        // R/B# is busy-low
        while self.request.value(self.pins.rbb)? != Value::Active {
            if Instant::now() > deadline {
                return Err(Error::DeviceTimeout(timeout));
            }
            std::hint::spin_loop();
        }
        Ok(())
    }
}
