//! Small drivers built on [`GpioPinManager`](crate::GpioPinManager).

mod mux;
mod relay;

pub use mux::{Mux74hc4051, MUX_CHANNELS};
pub use relay::{Relay, RelayNormalState};
