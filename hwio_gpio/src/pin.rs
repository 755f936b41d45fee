use std::fmt;

/// One GPIO line, identified by its offset on the chip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pin(u32);

macro_rules! board_pins {
    ($($name:ident = $offset:literal),* $(,)?) => {
        impl Pin {
            $(pub const $name: Pin = Pin($offset);)*
        }
    };
}

board_pins! {
    GPIO00 = 0, GPIO01 = 1, GPIO02 = 2, GPIO03 = 3, GPIO04 = 4, GPIO05 = 5,
    GPIO06 = 6, GPIO07 = 7, GPIO08 = 8, GPIO09 = 9, GPIO10 = 10, GPIO11 = 11,
    GPIO12 = 12, GPIO13 = 13, GPIO14 = 14, GPIO15 = 15, GPIO16 = 16, GPIO17 = 17,
    GPIO18 = 18, GPIO19 = 19, GPIO20 = 20, GPIO21 = 21, GPIO22 = 22, GPIO23 = 23,
    GPIO24 = 24, GPIO25 = 25, GPIO26 = 26, GPIO27 = 27,
}

impl Pin {
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    /// Line offset on the chip.
    pub const fn offset(self) -> u32 {
        self.0
    }
}

impl From<u32> for Pin {
    fn from(offset: u32) -> Self {
        Self(offset)
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO{:02}", self.0)
    }
}

/// Direction a claimed pin is configured for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PinMode {
    #[default]
    Unknown,
    Input,
    Output,
    /// Both edges are reported through the edge monitor.
    EdgeDetection,
    /// Keep whatever direction the line currently has.
    AsIs,
}

/// Bias resistor configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PullMode {
    #[default]
    AsIs,
    Disabled,
    PullUp,
    PullDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Rising,
    Falling,
    Unknown,
}

impl From<lib_uapi::v1::EventKind> for EdgeKind {
    fn from(kind: lib_uapi::v1::EventKind) -> Self {
        match kind {
            lib_uapi::v1::EventKind::RisingEdge => Self::Rising,
            lib_uapi::v1::EventKind::FallingEdge => Self::Falling,
            lib_uapi::v1::EventKind::Unknown(_) => Self::Unknown,
        }
    }
}

/// The two GPIO chips exposed on the target board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardChip {
    /// The SoC's main bank, carrying the header pins.
    Gpiochip0,
    /// The firmware-controlled expander.
    Gpiochip1,
}

impl BoardChip {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gpiochip0 => "gpiochip0",
            Self::Gpiochip1 => "gpiochip1",
        }
    }
}
