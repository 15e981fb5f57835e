//! Data gathering for Delta Tau Power PMAC motion controllers.
//!
//! The Power PMAC records arbitrary controller variables into an on-device
//! gather buffer, once every `gather.Period` servo ticks. This crate drives that
//! buffer from a host: it writes the gather configuration, arms the buffer,
//! polls until enough samples have been captured (or a motion program has
//! finished), uploads the buffer to a text file and parses it into numeric rows.
//!
//! # Modules
//!
//! - [`comm`] - the device channel the acquisition code talks through, plus a
//!   telnet transport for real controllers and an in-memory simulated controller.
//! - [`gather`] - settings encoding/decoding, sample planning, the acquisition
//!   and program-run state machines, and the result parser.
//!
//! # Example
//!
//! ```no_run
//! use ppmac::comm::telnet::{ConnectOptions, TelnetPmac};
//! use ppmac::gather::{AcquisitionController, CancelToken, GatherConfig, GatherPlan, ServoClock};
//!
//! let mut pmac = TelnetPmac::connect(&ConnectOptions::default())?;
//! let clock = ServoClock::from_device(&mut pmac)?;
//!
//! let plan = GatherPlan::from_duration(
//!     &clock,
//!     vec!["Sys.ServoCount.a".to_string(), "Motor[3].Pos.a".to_string()],
//!     1,
//!     0.5,
//! )?;
//!
//! let mut controller = AcquisitionController::new(&mut pmac, clock, GatherConfig::default());
//! let acquisition = controller.run(plan, &CancelToken::new())?;
//! println!("{} rows", acquisition.data.len());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod comm;
pub mod gather;
