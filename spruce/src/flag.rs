//! # Message flags
//!
//! Flags are a bitset per message. The low 16 bits are the permanent
//! flags that survive in the backing store; [`Flags::RECENT`] and
//! [`Flags::DIRTY`] live above them and never reach disk headers
//! (the mbox flag codec masks them out, Maildir filenames have no tag
//! for them).

use crate::error::{Error, Result};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Flags: u32 {
        const ANSWERED  = 1 << 0;
        const DELETED   = 1 << 1;
        const DRAFT     = 1 << 2;
        const FLAGGED   = 1 << 3;
        const SEEN      = 1 << 4;
        const FORWARDED = 1 << 5;

        /// Delivered since the folder was last opened by any client.
        /// Inferred at load time, never stored.
        const RECENT    = 1 << 16;

        /// The in-memory flags differ from the backing store. Set on
        /// local mutation, cleared on successful sync.
        const DIRTY     = 1 << 17;
    }
}

impl Flags {
    /// The flags that are written to backing stores.
    pub fn permanent(self) -> Flags {
        Flags::from_bits_truncate(self.bits() & 0xffff)
    }

    /// Look up a system flag bit by its well-known name.
    pub fn system_flag(name: &str) -> Result<Flags> {
        match name {
            name if name.eq_ignore_ascii_case("answered") => Ok(Flags::ANSWERED),
            name if name.eq_ignore_ascii_case("deleted") => Ok(Flags::DELETED),
            name if name.eq_ignore_ascii_case("draft") => Ok(Flags::DRAFT),
            name if name.eq_ignore_ascii_case("flagged") => Ok(Flags::FLAGGED),
            name if name.eq_ignore_ascii_case("seen") => Ok(Flags::SEEN),
            name if name.eq_ignore_ascii_case("forwarded") => Ok(Flags::FORWARDED),
            name if name.eq_ignore_ascii_case("recent") => Ok(Flags::RECENT),
            unknown => Err(Error::Search(format!("unknown system flag {unknown}"))),
        }
    }
}
