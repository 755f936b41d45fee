mod common;

use common::Bench;
use hwio_gpio::{
    devices::{Mux74hc4051, Relay, RelayNormalState},
    Error, Pin,
};

/// Replay the write log and report, for every rising clock edge, the data
/// level at that moment, plus the number of rising latch edges and how many
/// clock pulses preceded the first one.
fn decode_shift(writes: &[(u32, u8)], data: u32, clock: u32, latch: u32) -> (Vec<u8>, usize, usize) {
    let mut levels = [0u8; 32];
    let mut bits = Vec::new();
    let mut latches = 0;
    let mut pulses_before_latch = usize::MAX;
    for &(offset, level) in writes {
        let rising = levels[offset as usize] == 0 && level == 1;
        levels[offset as usize] = level;
        if rising && offset == clock {
            assert_eq!(levels[latch as usize], 0, "latch high while clocking");
            bits.push(levels[data as usize]);
        }
        if rising && offset == latch {
            latches += 1;
            pulses_before_latch = pulses_before_latch.min(bits.len());
        }
    }
    (bits, latches, pulses_before_latch)
}

#[test]
fn shift_write_clocks_msb_first_then_latches() {
    let bench = Bench::new();
    let mut gpio = bench.open_manager();
    let (data, clock, latch) = (Pin::GPIO10, Pin::GPIO11, Pin::GPIO12);

    gpio.shift_write(0b1011_0000, data, clock, latch).unwrap();

    let (bits, latches, pulses) =
        decode_shift(&bench.sim.writes(), data.offset(), clock.offset(), latch.offset());
    assert_eq!(bits, vec![1, 0, 1, 1, 0, 0, 0, 0]);
    assert_eq!(latches, 1);
    assert_eq!(pulses, 8);
}

#[test]
fn shift_write_twice_latches_twice() {
    let bench = Bench::new();
    let mut gpio = bench.open_manager();
    let (data, clock, latch) = (Pin::GPIO10, Pin::GPIO11, Pin::GPIO12);

    gpio.shift_write(0xff, data, clock, latch).unwrap();
    gpio.shift_write(0x01, data, clock, latch).unwrap();

    let (bits, latches, _) =
        decode_shift(&bench.sim.writes(), data.offset(), clock.offset(), latch.offset());
    assert_eq!(bits.len(), 16);
    assert_eq!(&bits[8..], &[0, 0, 0, 0, 0, 0, 0, 1]);
    assert_eq!(latches, 2);
}

#[test]
fn shift_write_needs_three_distinct_pins() {
    let bench = Bench::new();
    let mut gpio = bench.open_manager();
    assert!(matches!(
        gpio.shift_write(1, Pin::GPIO10, Pin::GPIO10, Pin::GPIO12),
        Err(Error::DuplicatePin(Pin::GPIO10))
    ));
    assert!(bench.sim.writes().is_empty());
}

#[test]
fn relays_follow_their_normal_state() {
    let bench = Bench::new();
    let mut relays = Relay::new(
        bench.open_manager(),
        &[
            (Pin::GPIO20, RelayNormalState::NormallyOpen),
            (Pin::GPIO21, RelayNormalState::NormallyClosed),
        ],
        false,
    )
    .unwrap();
    assert_eq!(relays.len(), 2);
    assert_eq!((bench.sim.level(20), bench.sim.level(21)), (0, 1));

    relays.turn_on(0).unwrap();
    relays.turn_on(1).unwrap();
    assert_eq!((bench.sim.level(20), bench.sim.level(21)), (1, 0));

    relays.turn_off(1).unwrap();
    assert_eq!(bench.sim.level(21), 1);
    assert!(matches!(relays.set(2, true), Err(Error::InvalidChannel(2))));
}

#[test]
fn relay_bank_needs_at_least_one_relay() {
    let bench = Bench::new();
    let err = Relay::new(bench.open_manager(), &[], false).unwrap_err();
    assert!(matches!(err, Error::EmptyGroup));
    assert!(bench.registry.open_chips().is_empty());
}

#[test]
fn relay_needs_an_open_chip() {
    let bench = Bench::new();
    let err = Relay::new(
        bench.manager(),
        &[(Pin::GPIO20, RelayNormalState::NormallyOpen)],
        true,
    )
    .unwrap_err();
    assert!(matches!(err, Error::ChipNotOpen));
}

#[test]
fn mux_selects_channels_through_one_bulk_write() {
    let bench = Bench::new();
    let (a, b, c, inhibit) = (Pin::GPIO05, Pin::GPIO06, Pin::GPIO13, Pin::GPIO26);
    let mut mux = Mux74hc4051::new(bench.open_manager(), [a, b, c], Some(inhibit), 3).unwrap();
    assert_eq!(mux.channel(), 3);
    assert_eq!((bench.sim.level(13), bench.sim.level(6), bench.sim.level(5)), (0, 1, 1));

    let writes = bench.sim.stats().value_writes;
    mux.select_channel(6).unwrap();
    assert_eq!((bench.sim.level(13), bench.sim.level(6), bench.sim.level(5)), (1, 1, 0));
    assert_eq!(bench.sim.stats().value_writes, writes + 1);

    assert!(matches!(mux.select_channel(8), Err(Error::InvalidChannel(8))));
    assert_eq!(mux.channel(), 6);

    mux.disable_output(true).unwrap();
    assert_eq!(bench.sim.level(26), 1);
    mux.disable_output(false).unwrap();
    assert_eq!(bench.sim.level(26), 0);
}

#[test]
fn devices_share_the_chip_and_release_it() {
    let bench = Bench::new();
    let relays = Relay::new(
        bench.open_manager(),
        &[(Pin::GPIO20, RelayNormalState::NormallyOpen)],
        true,
    )
    .unwrap();
    let mux = Mux74hc4051::new(
        bench.open_manager(),
        [Pin::GPIO05, Pin::GPIO06, Pin::GPIO13],
        None,
        0,
    )
    .unwrap();
    assert_eq!(bench.sim.stats().opens, 1);
    assert_eq!(bench.registry.ref_count(common::CHIP), 2);

    drop(relays);
    assert_eq!(bench.sim.stats().closes, 0);
    drop(mux);
    assert_eq!(bench.sim.stats().closes, 1);
    assert!(bench.sim.requested().is_empty());
}
