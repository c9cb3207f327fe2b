//! Native service descriptor formats
//!
//! A descriptor file is the durable record of a service created by this
//! crate: a systemd unit file or a launchd property list.

pub mod plist;
pub mod unit_file;
