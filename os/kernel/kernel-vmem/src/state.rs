use crate::PagingError;

/// Bring-up stage of the kernel's paging.
///
/// Stages only move forward, one at a time:
///
/// ```text
/// Uninitialized → Bootstrapped → SelfMapped → Active
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum PagingState {
    /// No directory exists yet.
    #[default]
    Uninitialized,
    /// A directory is built: kernel, low memory and heap window mapped.
    Bootstrapped,
    /// Slot 1023 points at the directory.
    SelfMapped,
    /// The directory is loaded in CR3; tables are edited through the self-map.
    Active,
}

impl PagingState {
    /// The stage following this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Uninitialized => Some(Self::Bootstrapped),
            Self::Bootstrapped => Some(Self::SelfMapped),
            Self::SelfMapped => Some(Self::Active),
            Self::Active => None,
        }
    }

    /// Move to `to`, which must be the immediate successor.
    ///
    /// # Errors
    /// [`PagingError::InvalidTransition`] for skips, repeats and going back.
    pub fn advance(self, to: Self) -> Result<Self, PagingError> {
        if self.next() == Some(to) {
            log::debug!("paging: {self:?} -> {to:?}");
            Ok(to)
        } else {
            Err(PagingError::InvalidTransition { from: self, to })
        }
    }

    /// Whether page operations go through the recursive window.
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}
