use crate::devices::DeviceId;
use core::fmt;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{debug, warn};

/// Maximum number of fault codes held between transfers.
pub const FAULT_BUFFER_CAPACITY: usize = 32;

// The error-transfer frame carries the count in a single byte.
const_assert!(FAULT_BUFFER_CAPACITY <= u8::MAX as usize);

/// Status byte meaning "no fault".
pub const NO_FAULT: u8 = 0x00;

const WIDE_MARKER: u16 = 0x8000;
const WIDE_MARKER_MASK: u16 = 0xF000;

const LINK_SETUP_SLOT: u8 = 0;
const LINK_TEST_SLOT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCategory {
    BusSetup,
    Verification,
    Reset,
    Measurement,
    Limit,
    LinkSetup,
    LinkTest,
    Format,
}

impl FaultCategory {
    const fn nibble(self) -> u8 {
        match self {
            Self::BusSetup => 0x1,
            Self::Verification => 0x2,
            Self::Reset => 0x3,
            Self::Measurement => 0x4,
            Self::Limit => 0x5,
            Self::LinkSetup | Self::LinkTest => 0x6,
            Self::Format => 0x7,
        }
    }

    /// Limit excursions are warnings; everything else is a failure.
    #[must_use]
    pub const fn is_warning(self) -> bool {
        matches!(self, Self::Limit)
    }

    #[must_use]
    pub const fn is_device_scoped(self) -> bool {
        matches!(
            self,
            Self::BusSetup | Self::Verification | Self::Reset | Self::Measurement | Self::Limit
        )
    }
}

/// What a fault is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultOrigin {
    Device(DeviceId),
    Link,
    Command,
}

/// A fault category bound to the instance it happened on.
///
/// Two wire forms exist. The narrow form is one byte: category in the high
/// nibble, slot in the low nibble. The wide form is a 16-bit word with the
/// top bit set, used where a fault travels in place of a 16-bit measurement
/// and on the process bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultCode {
    category: FaultCategory,
    origin: FaultOrigin,
}

impl FaultCode {
    /// Builds a device fault. Link and format categories are rebound to their
    /// own origin so that every constructed code has a valid encoding.
    #[must_use]
    pub const fn device(category: FaultCategory, device: DeviceId) -> Self {
        let origin = match category {
            FaultCategory::LinkSetup | FaultCategory::LinkTest => FaultOrigin::Link,
            FaultCategory::Format => FaultOrigin::Command,
            _ => FaultOrigin::Device(device),
        };
        Self { category, origin }
    }

    #[must_use]
    pub const fn link_setup() -> Self {
        Self {
            category: FaultCategory::LinkSetup,
            origin: FaultOrigin::Link,
        }
    }

    #[must_use]
    pub const fn link_test() -> Self {
        Self {
            category: FaultCategory::LinkTest,
            origin: FaultOrigin::Link,
        }
    }

    #[must_use]
    pub const fn format() -> Self {
        Self {
            category: FaultCategory::Format,
            origin: FaultOrigin::Command,
        }
    }

    #[must_use]
    pub const fn category(&self) -> FaultCategory {
        self.category
    }

    #[must_use]
    pub const fn origin(&self) -> FaultOrigin {
        self.origin
    }

    #[must_use]
    pub const fn device_id(&self) -> Option<DeviceId> {
        match self.origin {
            FaultOrigin::Device(id) => Some(id),
            FaultOrigin::Link | FaultOrigin::Command => None,
        }
    }

    const fn slot(&self) -> u8 {
        match (self.category, self.origin) {
            (_, FaultOrigin::Device(id)) => id.slot(),
            (FaultCategory::LinkTest, _) => LINK_TEST_SLOT,
            (FaultCategory::LinkSetup, _) => LINK_SETUP_SLOT,
            _ => 0,
        }
    }

    /// Single-byte encoding used in response and error-transfer frames.
    #[must_use]
    pub const fn narrow(&self) -> u8 {
        (self.category.nibble() << 4) | self.slot()
    }

    /// 16-bit encoding used in place of a measurement word.
    #[must_use]
    pub const fn wide(&self) -> u16 {
        WIDE_MARKER | ((self.category.nibble() as u16) << 8) | self.slot() as u16
    }

    #[must_use]
    pub fn from_narrow(code: u8) -> Option<Self> {
        let slot = code & 0x0F;
        match code >> 4 {
            0x1 => DeviceId::from_slot(slot).map(|id| Self::device(FaultCategory::BusSetup, id)),
            0x2 => DeviceId::from_slot(slot).map(|id| Self::device(FaultCategory::Verification, id)),
            0x3 => DeviceId::from_slot(slot).map(|id| Self::device(FaultCategory::Reset, id)),
            0x4 => DeviceId::from_slot(slot).map(|id| Self::device(FaultCategory::Measurement, id)),
            0x5 => DeviceId::from_slot(slot).map(|id| Self::device(FaultCategory::Limit, id)),
            0x6 if slot == LINK_SETUP_SLOT => Some(Self::link_setup()),
            0x6 if slot == LINK_TEST_SLOT => Some(Self::link_test()),
            0x7 if slot == 0 => Some(Self::format()),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_wide(word: u16) -> Option<Self> {
        if word & WIDE_MARKER_MASK != WIDE_MARKER {
            return None;
        }
        let nibble = (word >> 8) & 0x0F;
        let slot = word & 0x00FF;
        if slot > 0x0F {
            return None;
        }
        Self::from_narrow(((nibble as u8) << 4) | slot as u8)
    }
}

/// Narrows a wide fault word, or `None` if the word is not a fault encoding.
#[must_use]
pub fn narrow_wide(word: u16) -> Option<u8> {
    FaultCode::from_wide(word).map(|code| code.narrow())
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.category {
            FaultCategory::BusSetup => "bus setup failure",
            FaultCategory::Verification => "verification failure",
            FaultCategory::Reset => "reset failure",
            FaultCategory::Measurement => "measurement read failure",
            FaultCategory::Limit => "limit exceeded",
            FaultCategory::LinkSetup => "link setup failure",
            FaultCategory::LinkTest => "link test failure",
            FaultCategory::Format => "command format error",
        };
        match self.origin {
            FaultOrigin::Device(id) => write!(f, "{what} on {id} (0x{:02X})", self.narrow()),
            FaultOrigin::Link | FaultOrigin::Command => write!(f, "{what} (0x{:02X})", self.narrow()),
        }
    }
}

/// Bounded, ordered store of fault codes waiting to be transferred.
///
/// Appends beyond capacity are rejected and the buffer is left untouched;
/// the newest fault is the one lost.
#[derive(Debug, Clone, Default)]
pub struct FaultBuffer<const N: usize = FAULT_BUFFER_CAPACITY> {
    faults: Vec<FaultCode, N>,
    rejected: u32,
}

impl<const N: usize> FaultBuffer<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            faults: Vec::new(),
            rejected: 0,
        }
    }

    /// Returns `false` if the buffer is full; the fault is then discarded.
    pub fn append(&mut self, fault: FaultCode) -> bool {
        if self.faults.push(fault).is_err() {
            self.rejected = self.rejected.saturating_add(1);
            warn!("Fault buffer full ({} entries), dropping {}", N, fault);
            return false;
        }
        debug!("Recorded {}", fault);

        // NASA Rule 5: Safety assertion for buffer bounds
        debug_assert!(self.faults.len() <= N, "Fault count exceeds capacity");
        true
    }

    pub fn clear(&mut self) {
        self.faults.clear();
    }

    /// Removes the oldest `delivered` faults, keeping anything appended
    /// after they were handed off.
    pub fn acknowledge(&mut self, delivered: usize) {
        let delivered = delivered.min(self.faults.len());
        let remaining = self.faults.len() - delivered;
        self.faults.rotate_left(delivered);
        self.faults.truncate(remaining);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.faults.len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.faults.is_full()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[FaultCode] {
        &self.faults
    }

    pub fn iter(&self) -> impl Iterator<Item = &FaultCode> {
        self.faults.iter()
    }

    #[must_use]
    pub fn contains(&self, fault: FaultCode) -> bool {
        self.faults.contains(&fault)
    }

    /// Number of appends refused since construction.
    #[must_use]
    pub const fn rejected(&self) -> u32 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_and_wide_agree() {
        for id in DeviceId::ALL {
            for category in [
                FaultCategory::BusSetup,
                FaultCategory::Verification,
                FaultCategory::Reset,
                FaultCategory::Measurement,
                FaultCategory::Limit,
            ] {
                let code = FaultCode::device(category, id);
                assert_eq!(FaultCode::from_narrow(code.narrow()), Some(code));
                assert_eq!(FaultCode::from_wide(code.wide()), Some(code));
                assert_eq!(narrow_wide(code.wide()), Some(code.narrow()));
            }
        }
    }

    #[test]
    fn test_codes_never_collide_with_reserved_bytes() {
        for id in DeviceId::ALL {
            let code = FaultCode::device(FaultCategory::Measurement, id);
            assert_ne!(code.narrow(), NO_FAULT);
            assert_ne!(code.narrow(), 0xFF);
        }
        assert_ne!(FaultCode::link_setup().narrow(), FaultCode::link_test().narrow());
        assert_eq!(FaultCode::format().narrow(), 0x70);
    }

    #[test]
    fn test_link_category_rebinds_origin() {
        let code = FaultCode::device(FaultCategory::LinkTest, DeviceId::Temp2);
        assert_eq!(code, FaultCode::link_test());
        assert_eq!(code.device_id(), None);
    }

    #[test]
    fn test_plain_measurements_are_not_faults() {
        assert_eq!(FaultCode::from_wide(0x0000), None);
        assert_eq!(FaultCode::from_wide(0x1234), None);
        assert_eq!(FaultCode::from_wide(0xFF80), None);
        assert_eq!(FaultCode::from_narrow(0x18), None);
        assert_eq!(FaultCode::from_narrow(0x62), None);
    }

    #[test]
    fn test_append_rejects_at_capacity() {
        let mut buffer: FaultBuffer<2> = FaultBuffer::new();
        let first = FaultCode::device(FaultCategory::Reset, DeviceId::Temp1);
        let second = FaultCode::device(FaultCategory::Reset, DeviceId::Temp2);
        let third = FaultCode::device(FaultCategory::Reset, DeviceId::Temp3);

        assert!(buffer.append(first));
        assert!(buffer.append(second));
        assert!(!buffer.append(third));

        assert_eq!(buffer.as_slice(), &[first, second]);
        assert_eq!(buffer.rejected(), 1);
    }

    #[test]
    fn test_clear_then_append() {
        let mut buffer: FaultBuffer<1> = FaultBuffer::new();
        let code = FaultCode::link_test();
        assert!(buffer.append(code));
        buffer.clear();
        assert_eq!(buffer.count(), 0);
        assert!(buffer.append(code));
    }

    #[test]
    fn test_acknowledge_keeps_newer_faults() {
        let mut buffer: FaultBuffer<4> = FaultBuffer::new();
        let codes = [
            FaultCode::device(FaultCategory::Limit, DeviceId::Rail3V3),
            FaultCode::device(FaultCategory::Limit, DeviceId::Rail5V),
            FaultCode::device(FaultCategory::Limit, DeviceId::RailCam),
        ];
        for code in codes {
            buffer.append(code);
        }

        buffer.acknowledge(2);
        assert_eq!(buffer.as_slice(), &codes[2..]);

        buffer.acknowledge(10);
        assert!(buffer.is_empty());
    }
}
