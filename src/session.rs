//! A proxy session: one link to one target, from connect to handoff.
//!
//! The session owns the proxy connection and the ledger of target memory it
//! has been given. Helpers for the individual concerns ([`Allocator`],
//! [`TransferChannel`], [`Timer`]) borrow from it, so there is no global
//! state and two sessions to two targets do not interfere.
//!
//! Once [`Session::boot`](crate::boot::handoff) hands the CPU to the new
//! kernel the session is in [`SessionState::HandedOff`] and every remote
//! operation fails with [`Error::SessionHandedOff`].

use std::fmt;

use crate::bootargs::{BootArgs, BOOT_ARGS_SIZE};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::memory::{Allocator, RegionLedger};
use crate::proxy::Proxy;
use crate::timer::Timer;
use crate::transfer::{TimeoutPolicy, TransferChannel};

const LOG: &str = "proxyboot::boot";

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The stub is serving proxy requests.
    Active,
    /// The target is running the booted image; only the console remains.
    HandedOff,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::HandedOff => write!(f, "handed off"),
        }
    }
}

/// A connection to a target plus everything derived from it.
pub struct Session<P: Proxy> {
    pub(crate) proxy: P,
    pub(crate) state: SessionState,
    config: SessionConfig,
    ledger: RegionLedger,
}

impl<P: Proxy> Session<P> {
    /// Start a session over an already connected proxy.
    pub fn new(mut proxy: P, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        proxy.set_timeout(config.response_timeout)?;
        log::debug!(
            target: LOG,
            "session started, reply timeout {:?}, throughput {} B/s",
            config.response_timeout,
            config.throughput()
        );
        Ok(Self {
            proxy,
            state: SessionState::Active,
            config,
            ledger: RegionLedger::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Regions allocated in this session and not yet freed.
    pub fn regions(&self) -> &RegionLedger {
        &self.ledger
    }

    /// Fail unless remote operations are still allowed.
    pub fn check_active(&self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::HandedOff => Err(Error::SessionHandedOff),
        }
    }

    /// The raw proxy, for operations without a dedicated helper.
    pub fn proxy(&mut self) -> Result<&mut P> {
        self.check_active()?;
        Ok(&mut self.proxy)
    }

    pub fn allocator(&mut self) -> Result<Allocator<'_, P>> {
        self.check_active()?;
        Ok(Allocator::new(&mut self.proxy, &mut self.ledger))
    }

    pub fn transfer(&mut self) -> Result<TransferChannel<'_, P>> {
        self.check_active()?;
        let policy = TimeoutPolicy::from_config(&self.config);
        Ok(TransferChannel::new(&mut self.proxy, policy))
    }

    pub fn timer(&mut self) -> Result<Timer<'_, P>> {
        self.check_active()?;
        Ok(Timer::new(&mut self.proxy, self.config.timer))
    }

    /// Load address of the proxy stub.
    pub fn base(&mut self) -> Result<u64> {
        self.proxy()?.get_base()
    }

    /// Fetch and decode the target's boot args record.
    pub fn boot_args(&mut self) -> Result<BootArgs> {
        let addr = self.proxy()?.get_bootargs()?;
        let raw = self.transfer()?.read(addr, BOOT_ARGS_SIZE)?;
        BootArgs::decode(&raw)
    }

    /// Give back the proxy.
    pub fn into_inner(self) -> P {
        self.proxy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimTarget, SIM_RAM_SIZE};

    fn session() -> Session<SimTarget> {
        Session::new(SimTarget::new(), SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_boot_args() {
        let mut s = session();
        let args = s.boot_args().unwrap();
        assert_eq!(args.revision, 1);
        assert_eq!(u64::from(args.mem_size), SIM_RAM_SIZE);
        assert!(s.base().unwrap() > 0);
    }

    #[test]
    fn test_handed_off_rejects_everything() {
        let mut s = session();
        s.state = SessionState::HandedOff;

        assert!(matches!(s.proxy(), Err(Error::SessionHandedOff)));
        assert!(matches!(s.allocator(), Err(Error::SessionHandedOff)));
        assert!(matches!(s.transfer(), Err(Error::SessionHandedOff)));
        assert!(matches!(s.timer(), Err(Error::SessionHandedOff)));
        assert!(matches!(s.boot_args(), Err(Error::SessionHandedOff)));
    }

    #[test]
    fn test_ledger_tracks_allocations() {
        let mut s = session();
        let region = s.allocator().unwrap().allocate(0x100).unwrap();
        assert_eq!(s.regions().len(), 1);
        s.allocator().unwrap().free(&region).unwrap();
        assert!(s.regions().is_empty());
    }

    #[test]
    fn test_reply_timeout_applied() {
        let config = SessionConfig::builder()
            .response_timeout(std::time::Duration::from_millis(750))
            .build()
            .unwrap();
        let s = Session::new(SimTarget::new(), config).unwrap();
        assert_eq!(
            s.into_inner().timeout(),
            std::time::Duration::from_millis(750)
        );
    }
}
