//! Busy-wait delays against the target's free-running tick counter.
//!
//! The counter is 64 bits wide but only visible as two 32-bit registers, so a
//! single read of it is two remote register reads. A carry from the low word
//! into the high word between those reads would give a value that is off by
//! 2^32 ticks, so [`Timer::ticks`] reads high, low, high and retries when the
//! two high words differ.

use crate::config::TimerConfig;
use crate::error::{Error, Result};
use crate::proxy::Proxy;

const LOG: &str = "proxyboot::timer";

/// Physical base of the timer register block.
pub const TIMER_BASE: u64 = 0x3c70_0000;

/// Counter rate in ticks per second.
pub const TIMER_FREQ: u64 = 24_000_000;

/// Offset of the high counter word.
pub const TIMER_HI: u64 = 0x80;

/// Offset of the low counter word.
pub const TIMER_LO: u64 = 0x84;

/// Offset of the control register.
pub const TIMER_CTL: u64 = 0x88;

/// Control bit that starts the counter.
pub const TIMER_ENABLE: u32 = 1 << 3;

/// Give up after this many torn reads in a row.
const MAX_TORN_READS: usize = 8;

/// 32-bit register access, the only thing the timer needs from a target.
pub trait Registers {
    fn read_reg(&mut self, addr: u64) -> Result<u32>;
    fn write_reg(&mut self, addr: u64, value: u32) -> Result<()>;
}

impl<P: Proxy + ?Sized> Registers for P {
    fn read_reg(&mut self, addr: u64) -> Result<u32> {
        Proxy::read32(self, addr)
    }

    fn write_reg(&mut self, addr: u64, value: u32) -> Result<()> {
        Proxy::write32(self, addr, value)
    }
}

/// Number of ticks covering `usec` microseconds at `frequency`.
pub fn ticks_for(usec: u64, frequency: u64) -> u64 {
    (u128::from(usec) * u128::from(frequency) / 1_000_000) as u64
}

/// The target timer, borrowed for a sequence of reads.
pub struct Timer<'a, R: ?Sized> {
    regs: &'a mut R,
    config: TimerConfig,
    enabled: bool,
}

impl<'a, R: Registers + ?Sized> Timer<'a, R> {
    pub fn new(regs: &'a mut R, config: TimerConfig) -> Self {
        Self {
            regs,
            config,
            enabled: false,
        }
    }

    /// Set the enable bit in the control register.
    pub fn enable(&mut self) -> Result<()> {
        let ctl_addr = self.config.base + TIMER_CTL;
        let ctl = self.regs.read_reg(ctl_addr)?;
        if ctl & TIMER_ENABLE == 0 {
            self.regs.write_reg(ctl_addr, ctl | TIMER_ENABLE)?;
        }
        self.enabled = true;
        log::debug!(target: LOG, "counter enabled (ctl {:#x})", ctl | TIMER_ENABLE);
        Ok(())
    }

    /// Current counter value.
    pub fn ticks(&mut self) -> Result<u64> {
        let hi_addr = self.config.base + TIMER_HI;
        let lo_addr = self.config.base + TIMER_LO;

        for _ in 0..MAX_TORN_READS {
            let hi = self.regs.read_reg(hi_addr)?;
            let lo = self.regs.read_reg(lo_addr)?;
            let hi_again = self.regs.read_reg(hi_addr)?;
            if hi == hi_again {
                return Ok((u64::from(hi) << 32) | u64::from(lo));
            }
            log::debug!(target: LOG, "torn counter read ({:#x} -> {:#x}), retrying", hi, hi_again);
        }

        Err(Error::Protocol(format!(
            "timer high word changed on {} consecutive reads",
            MAX_TORN_READS
        )))
    }

    /// Spin until at least `usec` microseconds of target time have passed.
    ///
    /// Returns the number of ticks that actually elapsed.
    pub fn delay(&mut self, usec: u32) -> Result<u64> {
        if !self.enabled {
            self.enable()?;
        }

        let start = self.ticks()?;
        let target = start.saturating_add(ticks_for(u64::from(usec), self.config.frequency));
        log::debug!(target: LOG, "delay {}us: {:#x} -> {:#x}", usec, start, target);

        let mut now = start;
        while now < target {
            now = self.ticks()?;
        }
        Ok(now - start)
    }

    pub fn frequency(&self) -> u64 {
        self.config.frequency
    }
}
