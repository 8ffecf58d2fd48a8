//! Port direction and capability flags.

use bitflags::bitflags;

bitflags! {
    /// Flags fixed at port registration time.
    ///
    /// Exactly one of [`PortFlags::INPUT`] and [`PortFlags::OUTPUT`] must be
    /// set. The remaining flags describe capabilities of the port, not its
    /// state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u32 {
        /// The port receives data from connected output ports.
        const INPUT = 1 << 0;
        /// The port produces data for connected input ports.
        const OUTPUT = 1 << 1;
        /// The port corresponds to a hardware channel.
        const PHYSICAL = 1 << 2;
        /// Data at this port enters or leaves the graph (a driver port).
        const TERMINAL = 1 << 3;
        /// The owner honors monitor requests for this port.
        const CAN_MONITOR = 1 << 4;
    }
}

impl PortFlags {
    /// True when the flag combination is acceptable for registration:
    /// exactly one direction bit.
    pub fn direction_valid(self) -> bool {
        self.contains(PortFlags::INPUT) != self.contains(PortFlags::OUTPUT)
    }

    /// True for ports carrying the [`PortFlags::INPUT`] bit.
    pub fn is_input(self) -> bool {
        self.contains(PortFlags::INPUT)
    }

    /// True for ports carrying the [`PortFlags::OUTPUT`] bit.
    pub fn is_output(self) -> bool {
        self.contains(PortFlags::OUTPUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_must_be_exactly_one() {
        assert!(PortFlags::INPUT.direction_valid());
        assert!((PortFlags::OUTPUT | PortFlags::PHYSICAL).direction_valid());
        assert!(!(PortFlags::INPUT | PortFlags::OUTPUT).direction_valid());
        assert!(!PortFlags::PHYSICAL.direction_valid());
    }
}
