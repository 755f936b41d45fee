use tracing::debug;

use crate::{Error, GpioPinManager, GroupId, Pin, Result};

/// Number of channels of the multiplexer.
pub const MUX_CHANNELS: u8 = 8;

/// 74HC4051 8-channel analog multiplexer.
///
/// The select inputs C, B and A are written as one group so the chip never
/// sees an intermediate channel.
#[derive(Debug)]
pub struct Mux74hc4051 {
    gpio: GpioPinManager,
    select: GroupId,
    inhibit: Option<Pin>,
    channel: u8,
}

impl Mux74hc4051 {
    /// Take over `gpio`, which must have a chip open, and select
    /// `initial_channel`.
    pub fn new(
        mut gpio: GpioPinManager,
        [a, b, c]: [Pin; 3],
        inhibit: Option<Pin>,
        initial_channel: u8,
    ) -> Result<Self> {
        if initial_channel >= MUX_CHANNELS {
            return Err(Error::InvalidChannel(initial_channel.into()));
        }
        let select = gpio.register_group(&[c, b, a])?;
        let mut mux = Self {
            gpio,
            select,
            inhibit,
            channel: 0,
        };
        mux.select_channel(initial_channel)?;
        Ok(mux)
    }

    pub fn select_channel(&mut self, channel: u8) -> Result<()> {
        if channel >= MUX_CHANNELS {
            return Err(Error::InvalidChannel(channel.into()));
        }
        let values = [(channel >> 2) & 1, (channel >> 1) & 1, channel & 1];
        self.gpio.set_group_values(self.select, &values)?;
        self.channel = channel;
        debug!(channel, "Mux channel selected");
        Ok(())
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Drive the inhibit pin. Does nothing without one.
    pub fn disable_output(&mut self, disable: bool) -> Result<()> {
        match self.inhibit {
            Some(pin) => self.gpio.set_pin_value(pin, disable),
            None => {
                debug!("Mux has no inhibit pin");
                Ok(())
            }
        }
    }

    pub fn gpio(&self) -> &GpioPinManager {
        &self.gpio
    }

    pub fn into_inner(self) -> GpioPinManager {
        self.gpio
    }
}
