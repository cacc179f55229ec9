use bitflags::bitflags;

bitflags! {
    /// Flags word of a sub-message header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SnacFlags: u16 {
        /// More replies to the same request follow.
        const MORE_REPLIES = 0x0001;
        /// A u16-length-prefixed extra-info block precedes the body.
        const HAS_EXTRA_INFO = 0x8000;
    }
}

bitflags! {
    /// Chat room permission flags (attribute `0x00C9`).
    ///
    /// Unknown bits are kept and passed through untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RoomFlags: u16 {
        const EVILABLE = 0x0001;
        const NAV_ONLY = 0x0002;
        const INSTANCING_ALLOWED = 0x0004;
        const OCCUPANT_PEEK = 0x0008;
    }
}
