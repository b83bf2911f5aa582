//! # proxyboot
//!
//! Boot a Linux kernel on a remote machine through the serial proxy stub
//! running on it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use proxyboot::boot::{BootPlan, Orchestrator};
//! use proxyboot::transport::SerialPort;
//! use proxyboot::{Session, SessionConfig, UartProxy};
//!
//! fn main() -> proxyboot::Result<()> {
//!     let config = SessionConfig::builder().device("/dev/ttyACM0").build()?;
//!     let link = SerialPort::open(&config.device, config.baud, config.response_timeout)?;
//!     let mut session = Session::new(UartProxy::connect(link)?, config)?;
//!
//!     let plan = BootPlan::from_files("Image".as_ref(), "board.dtb".as_ref(), None)?;
//!     Orchestrator::new(&mut session).boot(&plan)?;
//!     session.attach_console()
//! }
//! ```
//!
//! ## Layout
//!
//! - [`proxy`]: the remote operation set and the UART client for it
//! - [`session`]: one connection to one target, from connect to handoff
//! - [`memory`], [`transfer`], [`timer`]: the helpers a session hands out
//! - [`boot`]: device tree patching, the boot sequence and the handoff
//! - [`sim`]: an in-memory target for tests and dry runs

pub mod boot;
pub mod bootargs;
pub mod config;
pub mod console;
pub mod debug;
mod error;
pub mod fdt;
pub mod memory;
pub mod proxy;
pub mod session;
pub mod sim;
pub mod timer;
pub mod transfer;
pub mod transport;

// Re-exports
pub use bootargs::BootArgs;
pub use config::{SessionConfig, TimerConfig};
pub use error::{Error, Result};
pub use memory::MemoryRegion;
pub use proxy::{Proxy, UartProxy};
pub use session::{Session, SessionState};
