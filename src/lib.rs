//! Wii Remote session core
//!
//! Opens a connection to a Wii Remote, configures its report stream,
//! decodes button and accelerometer reports and forwards edge-triggered
//! events to a [`Listener`].
//!
//! ```text
//! DeviceLink ──frames──▶ report::decode_batch ──▶ Session ──▶ Listener
//!   (hid::HidLink)                                 │
//!                                         calibration, edge detection
//! ```

pub mod calibration;
pub mod config;
pub mod hid;
pub mod link;
pub mod listener;
pub mod motion;
pub mod report;
pub mod session;

pub use calibration::Calibration;
pub use link::{BdAddr, DeviceLink, LinkError, ReportMode};
pub use listener::{ChannelListener, ConnectionState, Listener, SessionEvent};
pub use report::{Buttons, RawFrame, Report};
pub use session::{Session, SessionConfig, SessionError};
