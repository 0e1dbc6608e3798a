#![forbid(unsafe_code)]

//! Lifecycle triggers a rule can be bound to.

use bitflags::bitflags;

bitflags! {
    /// Events that invoke a rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InvocationTypes: u8 {
        /// A new instance of the root type was created.
        const INIT_NEW = 1 << 0;
        /// An existing instance of the root type was loaded.
        const INIT_EXISTING = 1 << 1;
        /// A return property was read while not yet computed.
        const PROPERTY_GET = 1 << 2;
        /// A dependency path changed.
        const PROPERTY_CHANGED = 1 << 3;
        /// Either initialization event.
        const INIT = Self::INIT_NEW.bits() | Self::INIT_EXISTING.bits();
    }
}
