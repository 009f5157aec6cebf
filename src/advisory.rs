//! Advisory outcomes.
//!
//! Some steps, such as the pre-commit flush and boot readiness polling, may
//! fail without failing the operation they belong to. Their failures travel
//! back to the caller as [`Advisory`] values on an [`Outcome`] instead of
//! being visible only in the log.

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::api::VmId;

/// Step whose failure is downgraded to a warning.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryStep {
    /// Filesystem flush before an image is captured.
    PreCommitFlush,
    /// Waiting for a created or restored VM to report `running`.
    BootReadiness,
}

impl fmt::Display for AdvisoryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreCommitFlush => f.write_str("pre-commit flush"),
            Self::BootReadiness => f.write_str("boot readiness"),
        }
    }
}

/// A non-fatal failure attached to an otherwise successful operation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Advisory {
    /// Step that failed.
    pub step: AdvisoryStep,
    /// VM the step targeted.
    pub vm_id: VmId,
    /// Underlying cause.
    pub message: String,
}

impl Advisory {
    /// Builds an advisory and logs it at warning level.
    #[must_use]
    pub fn warn(step: AdvisoryStep, vm_id: &VmId, message: impl Into<String>) -> Self {
        let advisory = Self {
            step,
            vm_id: vm_id.clone(),
            message: message.into(),
        };
        warn!(
            step = %advisory.step,
            vm_id = %advisory.vm_id,
            cause = %advisory.message,
            "advisory step failed; continuing"
        );
        advisory
    }
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} failed: {}", self.step, self.vm_id, self.message)
    }
}

/// Successful result plus any advisories raised on the way.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Outcome<T> {
    /// Result of the mandatory path.
    pub value: T,
    /// Advisory failures, in the order they occurred.
    pub advisories: Vec<Advisory>,
}

impl<T> Outcome<T> {
    /// Wraps a value with no advisories.
    #[must_use]
    pub const fn clean(value: T) -> Self {
        Self {
            value,
            advisories: Vec::new(),
        }
    }

    /// Wraps a value with the given advisories.
    #[must_use]
    pub const fn with_advisories(value: T, advisories: Vec<Advisory>) -> Self {
        Self { value, advisories }
    }

    /// Returns `true` when no advisory was raised.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.advisories.is_empty()
    }

    /// Returns `true` when an advisory for `step` was raised.
    #[must_use]
    pub fn has_advisory(&self, step: AdvisoryStep) -> bool {
        self.advisories.iter().any(|advisory| advisory.step == step)
    }

    /// Transforms the value, keeping advisories.
    #[must_use]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            advisories: self.advisories,
        }
    }
}
