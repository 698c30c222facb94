//! Utilities for testing code that talks to a Crazyflie without having one (or a radio dongle)
//!  at hand. They are used for testing this crate itself, but they are also exported for
//!  application testing.

pub mod communicator;
pub mod radio;
