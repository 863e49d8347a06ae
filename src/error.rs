use std::{
    error::Error,
    fmt::{self, Display, Formatter},
};

use crate::zone::Zone;

/// Misuse of the registry or the dispatch chain.
///
/// The `try_*` entry points return these to the caller.  On the allocation
/// path they are never recoverable and go to [`crate::fatal()`] instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShimError {
    /// A zone was captured a second time.
    ZoneAlreadyRegistered(Zone),
    /// A dispatch call arrived for a zone that was never captured.
    ZoneNotRegistered(Zone),
    /// The zone's table already points at the shim's entry points.
    ZoneAlreadyIntercepted(Zone),
    RegistryFull { capacity: usize },
    /// A mandatory entry of the zone's function table is null.
    IncompleteZone {
        zone: Zone,
        missing: &'static str,
    },
    ChainAlreadyInstalled,
    /// Walking `next` from the head ended on a node other than the terminal one.
    ChainNotTerminated,
    ChainTooLong { limit: usize },
    /// A non-terminal node has no successor to forward to.
    MissingSuccessor,
    SymbolNotFound(&'static str),
    /// `mprotect` on the pages holding a zone record failed.
    ZoneProtection { zone: Zone, errno: i32 },
}

impl Display for ShimError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            ShimError::ZoneAlreadyRegistered(zone) => {
                write!(f, "zone {:p} is already registered", zone.as_ptr())
            }
            ShimError::ZoneNotRegistered(zone) => {
                write!(f, "zone {:p} was never registered", zone.as_ptr())
            }
            ShimError::ZoneAlreadyIntercepted(zone) => write!(
                f,
                "zone {:p} is already intercepted; capturing it would recurse",
                zone.as_ptr()
            ),
            ShimError::RegistryFull { capacity } => {
                write!(f, "zone registry is full ({} zones)", capacity)
            }
            ShimError::IncompleteZone { zone, missing } => {
                write!(f, "zone {:p} has no `{}` function", zone.as_ptr(), missing)
            }
            ShimError::ChainAlreadyInstalled => f.write_str("a dispatch chain is already installed"),
            ShimError::ChainNotTerminated => {
                f.write_str("dispatch chain does not end at the terminal dispatch")
            }
            ShimError::ChainTooLong { limit } => write!(
                f,
                "dispatch chain is longer than {} nodes or contains a cycle",
                limit
            ),
            ShimError::MissingSuccessor => {
                f.write_str("non-terminal dispatch node has no successor")
            }
            ShimError::SymbolNotFound(name) => write!(f, "couldn't find original `{}`", name),
            ShimError::ZoneProtection { zone, errno } => write!(
                f,
                "couldn't change protection of zone {:p} (errno {})",
                zone.as_ptr(),
                errno
            ),
        }
    }
}

impl Error for ShimError {}
