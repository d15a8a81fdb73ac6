//! Pull policies and the lookup/pull state machine for registry references.

use std::{fmt, str::FromStr};

use crate::error::Error;

/// When to contact a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PullPolicy {
    /// Pull before every lookup.
    Always,
    /// Pull only when the image or some of its platforms are missing locally.
    #[default]
    Missing,
    /// Never pull; missing content is an error.
    Never,
}

impl FromStr for PullPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "missing" => Ok(PullPolicy::Missing),
            "never" => Ok(PullPolicy::Never),
            other => Err(Error::Config(format!("unknown pull policy {other:?}"))),
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PullPolicy::Always => "always",
            PullPolicy::Missing => "missing",
            PullPolicy::Never => "never",
        })
    }
}

/// A step of the registry resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The unconditional pull of [`PullPolicy::Always`].
    PrePull,
    Lookup,
    /// Pull after the image was not found.
    PullMissing,
    /// The single lookup after [`Phase::PullMissing`].
    Relookup,
    /// Completeness check of the found image.
    Verify,
    /// Corrective pull for platforms the found image lacks.
    PullPlatforms,
    /// Lookup after [`Phase::PullPlatforms`]; the pull may have re-tagged the name.
    RelookupPlatforms,
    /// Completeness check after [`Phase::PullPlatforms`], only when enabled.
    Reverify,
}

/// What a phase produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pulled,
    Found,
    NotFound,
    Complete,
    Incomplete,
}

/// Why resolution gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    NotFound,
    StillNotFound,
    UnavailablePlatforms,
}

/// The transition out of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Enter(Phase),
    /// Return the most recently found record.
    Return,
    Fail(Failure),
}

/// The transition table for one pull policy.
///
/// Each image is pulled at most once for being missing and at most once for missing platforms,
/// and looked up at most once after each pull, so every resolution terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    policy: PullPolicy,
    reverify: bool,
}

impl Plan {
    /// `reverify` makes the corrective platform pull followed by a fresh lookup and a second
    /// completeness check.
    pub fn new(policy: PullPolicy, reverify: bool) -> Self {
        Plan { policy, reverify }
    }

    pub fn start(&self) -> Phase {
        match self.policy {
            PullPolicy::Always => Phase::PrePull,
            PullPolicy::Missing | PullPolicy::Never => Phase::Lookup,
        }
    }

    /// Returns the transition for `outcome` in `phase`.
    ///
    /// Panics on combinations the phase cannot produce.
    pub fn next(&self, phase: Phase, outcome: Outcome) -> Next {
        let never = self.policy == PullPolicy::Never;
        match (phase, outcome) {
            (Phase::PrePull, Outcome::Pulled) => Next::Enter(Phase::Lookup),
            (Phase::Lookup, Outcome::Found) => Next::Enter(Phase::Verify),
            (Phase::Lookup, Outcome::NotFound) if never => Next::Fail(Failure::NotFound),
            (Phase::Lookup, Outcome::NotFound) => Next::Enter(Phase::PullMissing),
            (Phase::PullMissing, Outcome::Pulled) => Next::Enter(Phase::Relookup),
            (Phase::Relookup, Outcome::Found) => Next::Enter(Phase::Verify),
            (Phase::Relookup, Outcome::NotFound) => Next::Fail(Failure::StillNotFound),
            (Phase::Verify, Outcome::Complete) => Next::Return,
            (Phase::Verify, Outcome::Incomplete) if never => {
                Next::Fail(Failure::UnavailablePlatforms)
            }
            (Phase::Verify, Outcome::Incomplete) => Next::Enter(Phase::PullPlatforms),
            (Phase::PullPlatforms, Outcome::Pulled) if self.reverify => {
                Next::Enter(Phase::RelookupPlatforms)
            }
            (Phase::PullPlatforms, Outcome::Pulled) => Next::Return,
            (Phase::RelookupPlatforms, Outcome::Found) => Next::Enter(Phase::Reverify),
            (Phase::RelookupPlatforms, Outcome::NotFound) => Next::Fail(Failure::StillNotFound),
            (Phase::Reverify, Outcome::Complete) => Next::Return,
            (Phase::Reverify, Outcome::Incomplete) => Next::Fail(Failure::UnavailablePlatforms),
            (phase, outcome) => unreachable!("{phase:?} cannot produce {outcome:?}"),
        }
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_policy() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("missing".parse::<PullPolicy>().unwrap(), PullPolicy::Missing);
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert_eq!(PullPolicy::default(), PullPolicy::Missing);

        let err = "sometimes".parse::<PullPolicy>().unwrap_err();
        assert_eq!(err.to_string(), r#"unknown pull policy "sometimes""#);
        assert!("Always".parse::<PullPolicy>().is_err());

        for policy in [PullPolicy::Always, PullPolicy::Missing, PullPolicy::Never] {
            assert_eq!(policy.to_string().parse::<PullPolicy>().unwrap(), policy);
        }
    }

    /// Drives a plan with scripted outcomes, returning the phases entered and the result.
    fn run(plan: Plan, outcomes: &[Outcome]) -> (Vec<Phase>, Next) {
        let mut phase = plan.start();
        let mut phases = vec![phase];
        for outcome in outcomes {
            match plan.next(phase, *outcome) {
                Next::Enter(next) => {
                    phase = next;
                    phases.push(phase);
                }
                done => return (phases, done),
            }
        }
        panic!("plan did not finish: {phases:?}");
    }

    use Outcome::*;
    use Phase::*;

    #[test]
    fn test_always() {
        let plan = Plan::new(PullPolicy::Always, false);
        assert_eq!(
            run(plan, &[Pulled, Found, Complete]),
            (vec![PrePull, Lookup, Verify], Next::Return)
        );
        assert_eq!(
            run(plan, &[Pulled, NotFound, Pulled, NotFound]),
            (
                vec![PrePull, Lookup, PullMissing, Relookup],
                Next::Fail(Failure::StillNotFound)
            )
        );
    }

    #[test]
    fn test_missing() {
        let plan = Plan::new(PullPolicy::Missing, false);
        assert_eq!(
            run(plan, &[Found, Complete]),
            (vec![Lookup, Verify], Next::Return)
        );
        assert_eq!(
            run(plan, &[NotFound, Pulled, Found, Complete]),
            (
                vec![Lookup, PullMissing, Relookup, Verify],
                Next::Return
            )
        );
        assert_eq!(
            run(plan, &[NotFound, Pulled, NotFound]),
            (
                vec![Lookup, PullMissing, Relookup],
                Next::Fail(Failure::StillNotFound)
            )
        );
        // The corrective pull is trusted.
        assert_eq!(
            run(plan, &[Found, Incomplete, Pulled]),
            (vec![Lookup, Verify, PullPlatforms], Next::Return)
        );
    }

    #[test]
    fn test_never() {
        let plan = Plan::new(PullPolicy::Never, false);
        assert_eq!(
            run(plan, &[NotFound]),
            (vec![Lookup], Next::Fail(Failure::NotFound))
        );
        assert_eq!(
            run(plan, &[Found, Incomplete]),
            (vec![Lookup, Verify], Next::Fail(Failure::UnavailablePlatforms))
        );
        assert_eq!(
            run(plan, &[Found, Complete]),
            (vec![Lookup, Verify], Next::Return)
        );
    }

    #[test]
    fn test_reverify() {
        let plan = Plan::new(PullPolicy::Missing, true);
        assert_eq!(
            run(plan, &[Found, Incomplete, Pulled, Found, Incomplete]),
            (
                vec![Lookup, Verify, PullPlatforms, RelookupPlatforms, Reverify],
                Next::Fail(Failure::UnavailablePlatforms)
            )
        );
        assert_eq!(
            run(plan, &[Found, Incomplete, Pulled, Found, Complete]),
            (
                vec![Lookup, Verify, PullPlatforms, RelookupPlatforms, Reverify],
                Next::Return
            )
        );
        assert_eq!(
            run(plan, &[Found, Incomplete, Pulled, NotFound]),
            (
                vec![Lookup, Verify, PullPlatforms, RelookupPlatforms],
                Next::Fail(Failure::StillNotFound)
            )
        );
    }

    #[test]
    #[should_panic]
    fn test_invalid_transition() {
        Plan::new(PullPolicy::Missing, false).next(Phase::Lookup, Outcome::Pulled);
    }
}
