//! ConflictMode value object
//! What a binaries download does when the destination already has content

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConflictMode {
    /// Replace whatever is already at the destination
    #[default]
    OverwriteExisting,

    /// Fail with `DuplicateBinaries`
    FailIfExists,

    /// Leave the destination untouched and report success
    DoNothingIfExists,
}

impl fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictMode::OverwriteExisting => write!(f, "overwrite-existing"),
            ConflictMode::FailIfExists => write!(f, "fail-if-exists"),
            ConflictMode::DoNothingIfExists => write!(f, "do-nothing-if-exists"),
        }
    }
}
