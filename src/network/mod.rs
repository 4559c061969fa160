//! The packet network beneath the post office.
//!
//! A [`NetworkDevice`] moves one packet at a time and reports back through a
//! [`NetworkHandler`]; the [`SimulatedNetwork`] provides devices for machines
//! living in the same process.

mod traits;
pub use traits::*;

mod simulated;
pub use simulated::*;
