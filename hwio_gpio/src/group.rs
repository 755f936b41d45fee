use std::{collections::BTreeMap, fmt};

use tinyvec::TinyVec;
use tracing::{debug, warn};

use crate::{
    backend::{Direction, LineHandle},
    error::inconsistent,
    pins::{busy_to_owner, Hardware, PinRegistry},
    Error, Pin, PinMode, PullMode, Result,
};

/// Most lines a single kernel handle can carry.
pub const MAX_GROUP_PINS: usize = lib_uapi::v1::GPIOHANDLES_MAX;

/// Identifies a registered pin group on its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct PinGroup {
    pins: TinyVec<[Pin; 8]>,
    /// `None` only between releasing and re-requesting the bulk handle.
    handle: Option<Box<dyn LineHandle>>,
}

impl PinGroup {
    fn check_count(&self, count: usize) -> Result<()> {
        if count != self.pins.len() {
            return Err(Error::ValueCount {
                expected: self.pins.len(),
                actual: count,
            });
        }
        Ok(())
    }

    fn offsets(&self) -> TinyVec<[u32; 8]> {
        self.pins.iter().map(|pin| pin.offset()).collect()
    }

    fn handle(&self) -> Result<&dyn LineHandle> {
        self.handle
            .as_deref()
            .ok_or_else(|| inconsistent("group without a line handle"))
    }

    /// Re-request every member in `direction` with one kernel call.
    fn switch(
        &mut self,
        pins: &mut PinRegistry,
        hw: Hardware<'_>,
        direction: Direction,
        defaults: &[u8],
    ) -> Result<()> {
        let mode = match direction {
            Direction::Input => PinMode::Input,
            Direction::Output => PinMode::Output,
            Direction::AsIs => PinMode::AsIs,
        };
        self.handle = None;
        let offsets = self.offsets();
        let handle = hw
            .chip
            .request_lines(&offsets, direction, defaults, hw.consumer)
            .map_err(|e| busy_to_owner(hw.chip, self.pins[0], e))?;
        self.handle = Some(handle);
        for &pin in self.pins.iter() {
            pins.set_member_mode(pin, mode)?;
        }
        debug!(pins = ?self.pins.as_slice(), ?mode, "Group direction switched");
        Ok(())
    }
}

/// Pin groups of one manager, each backed by a single bulk line handle.
#[derive(Debug, Default)]
pub(crate) struct GroupManager {
    groups: BTreeMap<GroupId, PinGroup>,
    next_id: u32,
}

impl GroupManager {
    /// Claim every pin of `members` and bind them into one group.
    ///
    /// Either all pins end up in the group or none of them stays claimed,
    /// including members claimed before the call.
    pub(crate) fn register(
        &mut self,
        pins: &mut PinRegistry,
        hw: Hardware<'_>,
        members: &[Pin],
    ) -> Result<GroupId> {
        if members.is_empty() {
            return Err(Error::EmptyGroup);
        }
        if members.len() > MAX_GROUP_PINS {
            return Err(Error::TooManyPins {
                count: members.len(),
                max: MAX_GROUP_PINS,
            });
        }
        for (i, &pin) in members.iter().enumerate() {
            if members[..i].contains(&pin) {
                return Err(Error::DuplicatePin(pin));
            }
            if let Some(group) = pins.group_of(pin) {
                return Err(Error::PinInGroup { pin, group });
            }
            if let Some(mode @ PinMode::EdgeDetection) = pins.mode(pin) {
                return Err(Error::InvalidMode { pin, mode });
            }
        }

        for &pin in members {
            if let Err(e) = pins.open(hw, pin, PinMode::AsIs, PullMode::AsIs, 0) {
                warn!(%pin, error = %e, "Group claim failed, releasing every member");
                for &member in members {
                    pins.discard(member);
                }
                return Err(e);
            }
        }

        let id = GroupId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let mut group = PinGroup {
            pins: members.iter().copied().collect(),
            handle: None,
        };
        for &pin in members {
            pins.join_group(pin, id, PinMode::AsIs)?;
        }
        if let Err(e) = group.switch(pins, hw, Direction::AsIs, &[]) {
            warn!(group = %id, error = %e, "Bulk request failed, members released");
            for &pin in members {
                pins.discard(pin);
            }
            return Err(e);
        }

        debug!(group = %id, pins = ?members, "Group registered");
        self.groups.insert(id, group);
        Ok(id)
    }

    pub(crate) fn unregister(&mut self, pins: &mut PinRegistry, id: GroupId) -> Result<()> {
        let group = self.groups.remove(&id).ok_or(Error::GroupNotFound(id))?;
        drop(group.handle);
        for &pin in group.pins.iter() {
            pins.discard(pin);
        }
        debug!(group = %id, "Group unregistered");
        Ok(())
    }

    pub(crate) fn clear(&mut self, pins: &mut PinRegistry) {
        let ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for id in ids {
            // Ids come from the map itself.
            let _ = self.unregister(pins, id);
        }
    }

    pub(crate) fn set_values(
        &mut self,
        pins: &mut PinRegistry,
        hw: Hardware<'_>,
        id: GroupId,
        values: &[u8],
    ) -> Result<()> {
        let group = self.groups.get_mut(&id).ok_or(Error::GroupNotFound(id))?;
        group.check_count(values.len())?;

        let result = match pins.mode(group.pins[0]) {
            Some(PinMode::Output) => group.handle().and_then(|handle| handle.set_values(values)),
            Some(_) => group.switch(pins, hw, Direction::Output, values),
            None => Err(inconsistent("group member missing from the pin registry")),
        };
        self.fail_closed(pins, id, result)
    }

    pub(crate) fn get_values(
        &mut self,
        pins: &mut PinRegistry,
        hw: Hardware<'_>,
        id: GroupId,
        values: &mut [u8],
    ) -> Result<()> {
        let group = self.groups.get_mut(&id).ok_or(Error::GroupNotFound(id))?;
        group.check_count(values.len())?;

        let result = match pins.mode(group.pins[0]) {
            Some(PinMode::Input) => Ok(()),
            Some(_) => group.switch(pins, hw, Direction::Input, &[]),
            None => Err(inconsistent("group member missing from the pin registry")),
        }
        .and_then(|()| group.handle()?.get_values(values));
        self.fail_closed(pins, id, result)
    }

    /// Drop a group whose bulk handle was lost while switching direction.
    fn fail_closed(&mut self, pins: &mut PinRegistry, id: GroupId, result: Result<()>) -> Result<()> {
        let lost = self
            .groups
            .get(&id)
            .is_some_and(|group| group.handle.is_none());
        if lost {
            warn!(group = %id, "Group lost its lines, unregistering");
            let _ = self.unregister(pins, id);
        }
        result
    }

    pub(crate) fn pins(&self, id: GroupId) -> Option<&[Pin]> {
        self.groups.get(&id).map(|group| group.pins.as_slice())
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        backend::{ChipProvider, GpioChip},
        pull::NoPullControl,
        sim::{SimChipHandle, SimProvider},
    };

    fn setup() -> (SimChipHandle, Arc<dyn GpioChip>) {
        let provider = SimProvider::new();
        let sim = provider.add_chip("gpiochip0", 16);
        (sim, provider.open("gpiochip0").unwrap())
    }

    fn hw(chip: &Arc<dyn GpioChip>) -> Hardware<'_> {
        Hardware {
            chip: chip.as_ref(),
            pulls: &NoPullControl,
            consumer: "test",
        }
    }

    #[test]
    fn register_rejects_bad_member_lists() {
        let (_sim, chip) = setup();
        let mut pins = PinRegistry::default();
        let mut groups = GroupManager::default();

        assert!(matches!(
            groups.register(&mut pins, hw(&chip), &[]),
            Err(Error::EmptyGroup)
        ));
        assert!(matches!(
            groups.register(&mut pins, hw(&chip), &[Pin::GPIO01, Pin::GPIO02, Pin::GPIO01]),
            Err(Error::DuplicatePin(Pin::GPIO01))
        ));
        assert_eq!(pins.len(), 0);
    }

    #[test]
    fn members_cannot_join_two_groups() {
        let (_sim, chip) = setup();
        let mut pins = PinRegistry::default();
        let mut groups = GroupManager::default();

        let id = groups
            .register(&mut pins, hw(&chip), &[Pin::GPIO01, Pin::GPIO02])
            .unwrap();
        let err = groups
            .register(&mut pins, hw(&chip), &[Pin::GPIO03, Pin::GPIO02])
            .unwrap_err();
        assert!(matches!(err, Error::PinInGroup { group, .. } if group == id));
        assert!(!pins.is_claimed(Pin::GPIO03));
    }

    #[test]
    fn bulk_writes_switch_direction_once() {
        let (sim, chip) = setup();
        let mut pins = PinRegistry::default();
        let mut groups = GroupManager::default();
        let id = groups
            .register(&mut pins, hw(&chip), &[Pin::GPIO04, Pin::GPIO05, Pin::GPIO06])
            .unwrap();
        let requests = sim.stats().line_requests;

        groups.set_values(&mut pins, hw(&chip), id, &[1, 0, 1]).unwrap();
        groups.set_values(&mut pins, hw(&chip), id, &[0, 1, 1]).unwrap();
        assert_eq!(sim.stats().line_requests, requests + 1);
        assert_eq!((sim.level(4), sim.level(5), sim.level(6)), (0, 1, 1));
        assert_eq!(pins.mode(Pin::GPIO06), Some(PinMode::Output));

        let mut values = [0u8; 3];
        groups.get_values(&mut pins, hw(&chip), id, &mut values).unwrap();
        assert_eq!(values, [0, 1, 1]);
        assert_eq!(sim.stats().line_requests, requests + 2);
        assert_eq!(pins.mode(Pin::GPIO04), Some(PinMode::Input));
    }

    #[test]
    fn failed_claim_releases_previously_claimed_members() {
        let (sim, chip) = setup();
        let mut pins = PinRegistry::default();
        let mut groups = GroupManager::default();
        pins.open(hw(&chip), Pin::GPIO03, PinMode::Output, PullMode::AsIs, 1)
            .unwrap();
        sim.reserve(7, "other");

        assert!(groups
            .register(&mut pins, hw(&chip), &[Pin::GPIO03, Pin::GPIO04, Pin::GPIO07])
            .is_err());
        assert_eq!(pins.len(), 0);
        assert_eq!(groups.len(), 0);
        assert!(sim.requested().is_empty());
    }

    #[test]
    fn unregister_releases_members() {
        let (sim, chip) = setup();
        let mut pins = PinRegistry::default();
        let mut groups = GroupManager::default();
        let id = groups
            .register(&mut pins, hw(&chip), &[Pin::GPIO07, Pin::GPIO08])
            .unwrap();
        assert_eq!(groups.pins(id), Some(&[Pin::GPIO07, Pin::GPIO08][..]));

        groups.unregister(&mut pins, id).unwrap();
        assert!(sim.requested().is_empty());
        assert_eq!(pins.len(), 0);
        assert!(matches!(
            groups.unregister(&mut pins, id),
            Err(Error::GroupNotFound(_))
        ));
    }

    #[test]
    fn failed_switch_drops_the_group() {
        let (sim, chip) = setup();
        let mut pins = PinRegistry::default();
        let mut groups = GroupManager::default();
        let id = groups
            .register(&mut pins, hw(&chip), &[Pin::GPIO09, Pin::GPIO10])
            .unwrap();

        sim.fail_requests(1);
        assert!(groups.set_values(&mut pins, hw(&chip), id, &[1, 1]).is_err());
        assert_eq!(groups.len(), 0);
        assert_eq!(pins.len(), 0);
        assert!(sim.requested().is_empty());
    }
}
