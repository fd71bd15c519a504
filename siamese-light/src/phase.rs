//! Training phases.

use std::fmt;

/// Which partition an epoch runs over.
///
/// Only [`Phase::Train`] computes gradients and updates weights; the other two
/// run the model in evaluation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Validation,
    Test,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Train, Phase::Validation, Phase::Test];

    pub fn is_train(self) -> bool {
        self == Phase::Train
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Validation => "validation",
            Phase::Test => "test",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
