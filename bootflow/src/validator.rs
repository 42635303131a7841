//! # Validators
//!
//! Post-hoc checks over a finished [`Log`]. Each validator is independent;
//! [`validate`] merges their findings into one sorted, deduplicated list.
//!
//! | Validator | Finds |
//! |---|---|
//! | [`ActorsAreProtected`] | actors whose code was not measured before they ran |
//! | [`FullCoverage`] | expected firmware ranges that were never measured |
//! | [`NoStepIssues`] | any issue recorded while the flow ran |

use crate::artifact::{ArtifactKind, Ranges};
use crate::process::Log;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ActorNotProtected,
    IncompleteCoverage,
    StepIssue,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Issue {
    /// Run-wide index of the step the issue belongs to
    pub step: Option<usize>,
    pub kind: IssueKind,
    pub message: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "step {}: {:?}: {}", step, self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

pub trait Validator {
    fn validate(&self, log: &Log) -> Vec<Issue>;
}

fn format_ranges(ranges: &Ranges) -> String {
    let parts: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
    parts.join(", ")
}

/// Every actor's code must lie inside firmware ranges measured earlier
#[derive(Debug, Clone, Copy, Default)]
pub struct ActorsAreProtected {
    /// Also count PCH/PSP-verified ranges as protected
    pub include_verified: bool,
}

impl Validator for ActorsAreProtected {
    fn validate(&self, log: &Log) -> Vec<Issue> {
        let mut protected = Ranges::new();
        let mut issues = Vec::new();

        for step in &log.steps {
            for action in &step.actions {
                for measured in &action.measured {
                    protected.0.extend(measured.data.native_ranges(ArtifactKind::Firmware).iter().copied());
                }
                if self.include_verified {
                    for verified in &action.verified {
                        protected.0.extend(verified.data.native_ranges(ArtifactKind::Firmware).iter().copied());
                    }
                }
                protected.sort_and_merge();

                let Some(actor) = &action.actor else {
                    continue;
                };
                if let Some(reason) = &actor.code_error {
                    issues.push(Issue {
                        step: Some(step.index),
                        kind: IssueKind::ActorNotProtected,
                        message: format!("code of actor {} could not be located: {}", actor.name, reason),
                    });
                    continue;
                }
                let Some(code) = &actor.code else {
                    continue;
                };
                let code = code.native_ranges(ArtifactKind::Firmware);
                if !code.is_subset_of(&protected) {
                    issues.push(Issue {
                        step: Some(step.index),
                        kind: IssueKind::ActorNotProtected,
                        message: format!(
                            "actor {} runs unmeasured code at {}",
                            actor.name,
                            format_ranges(&code.subtract(&protected))
                        ),
                    });
                }
            }
        }
        issues
    }
}

/// Measured firmware ranges must cover `expected`; a no-op without it
#[derive(Debug, Clone, Default)]
pub struct FullCoverage {
    pub expected: Option<Ranges>,
}

impl Validator for FullCoverage {
    fn validate(&self, log: &Log) -> Vec<Issue> {
        let Some(expected) = &self.expected else {
            return Vec::new();
        };
        let measured: Ranges = log
            .steps
            .iter()
            .flat_map(|s| s.measured())
            .flat_map(|m| m.data.native_ranges(ArtifactKind::Firmware).0)
            .collect();
        let uncovered = expected.merged().subtract(&measured.merged());
        if uncovered.is_empty() {
            return Vec::new();
        }
        vec![Issue {
            step: None,
            kind: IssueKind::IncompleteCoverage,
            message: format!(
                "{} bytes never measured: {}",
                uncovered.total_length(),
                format_ranges(&uncovered)
            ),
        }]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoStepIssues;

impl Validator for NoStepIssues {
    fn validate(&self, log: &Log) -> Vec<Issue> {
        log.steps
            .iter()
            .flat_map(|step| {
                step.issues().map(move |issue| Issue {
                    step: Some(step.index),
                    kind: IssueKind::StepIssue,
                    message: issue.to_string(),
                })
            })
            .collect()
    }
}

/// Run `validators` and merge their findings
pub fn validate_with(log: &Log, validators: &[&dyn Validator]) -> Vec<Issue> {
    let mut issues: Vec<Issue> = validators.iter().flat_map(|v| v.validate(log)).collect();
    issues.sort();
    issues.dedup();
    for issue in &issues {
        warn!("{}", issue);
    }
    issues
}

/// Run the default validator set
pub fn validate(log: &Log) -> Vec<Issue> {
    validate_with(
        log,
        &[&ActorsAreProtected::default(), &FullCoverage::default(), &NoStepIssues],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Range;
    use crate::data::{DataRecord, ReferenceRecord};
    use crate::process::{ActionRecord, StepRecord};
    use crate::state::{ActorRecord, MeasuredData, VerifiedData};
    use crate::subsystem::SubsystemKind;

    fn firmware(offset: u64, length: u64) -> DataRecord {
        let ranges = Ranges::single(Range::new(offset, length));
        DataRecord::References {
            references: vec![ReferenceRecord {
                artifact: ArtifactKind::Firmware,
                mapper: None,
                ranges: ranges.clone(),
                native: ranges,
            }],
            converter: None,
        }
    }

    fn action(name: &str) -> ActionRecord {
        ActionRecord {
            action: name.into(),
            issue: None,
            measured: vec![],
            verified: vec![],
            actor: None,
        }
    }

    fn measure(offset: u64, length: u64) -> ActionRecord {
        ActionRecord {
            measured: vec![MeasuredData {
                data: firmware(offset, length),
                trust_chain: SubsystemKind::Tpm,
                actor: None,
                source: "test".into(),
                cause: None,
            }],
            ..action("TPMExtend")
        }
    }

    fn verify(offset: u64, length: u64) -> ActionRecord {
        ActionRecord {
            verified: vec![VerifiedData {
                data: firmware(offset, length),
                trust_chain: SubsystemKind::Pch,
                actor: None,
                source: "test".into(),
                cause: None,
            }],
            ..action("SetVerified")
        }
    }

    fn set_actor(name: &str, offset: u64, length: u64) -> ActionRecord {
        ActionRecord {
            actor: Some(ActorRecord {
                name: name.into(),
                code: Some(firmware(offset, length)),
                code_error: None,
            }),
            ..action("SetActor")
        }
    }

    fn log(steps: Vec<ActionRecord>) -> Log {
        Log {
            steps: steps
                .into_iter()
                .enumerate()
                .map(|(index, action)| StepRecord {
                    index,
                    flow: "Test".into(),
                    step_index: index,
                    step: action.action.clone(),
                    actions: vec![action],
                })
                .collect(),
        }
    }

    #[test]
    fn test_measured_actor_is_protected() {
        let log = log(vec![measure(0x100, 0x80), measure(0x180, 0x80), set_actor("PEI", 0x120, 0x100)]);
        assert!(ActorsAreProtected::default().validate(&log).is_empty());
    }

    #[test]
    fn test_unmeasured_actor_flagged_once() {
        let log = log(vec![measure(0x000, 0x10), set_actor("PEI", 0x120, 0x100)]);
        let issues = ActorsAreProtected::default().validate(&log);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].step, Some(1));
        assert_eq!(issues[0].kind, IssueKind::ActorNotProtected);
        assert!(issues[0].message.contains("PEI"));
    }

    #[test]
    fn test_measurement_after_actor_change_does_not_count() {
        let log = log(vec![set_actor("DXE", 0x0, 0x10), measure(0x0, 0x10)]);
        assert_eq!(ActorsAreProtected::default().validate(&log).len(), 1);
    }

    #[test]
    fn test_verified_ranges_only_when_enabled() {
        let log = log(vec![verify(0x0, 0x40), set_actor("IBB", 0x0, 0x40)]);
        assert_eq!(ActorsAreProtected::default().validate(&log).len(), 1);
        assert!(ActorsAreProtected { include_verified: true }.validate(&log).is_empty());
    }

    #[test]
    fn test_actor_without_code_is_skipped_but_missing_code_is_not() {
        let mut hardware = action("SetActor");
        hardware.actor = Some(ActorRecord {
            name: "ACM".into(),
            code: None,
            code_error: None,
        });
        let mut lost = action("SetActor");
        lost.actor = Some(ActorRecord {
            name: "IBB".into(),
            code: None,
            code_error: Some("no FIT".into()),
        });
        let issues = ActorsAreProtected::default().validate(&log(vec![hardware, lost]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].step, Some(1));
    }

    #[test]
    fn test_full_coverage() {
        let log = log(vec![measure(0x0, 0x10), measure(0x20, 0x10)]);
        assert!(FullCoverage::default().validate(&log).is_empty());

        let check = FullCoverage {
            expected: Some(Ranges::single(Range::new(0x0, 0x30))),
        };
        let issues = check.validate(&log);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("16 bytes"));
    }

    #[test]
    fn test_validate_merges_sorted_and_deduplicated() {
        let mut failed = action("TPMExtend");
        failed.issue = Some("source not found".into());
        let log = log(vec![failed.clone(), set_actor("PEI", 0x0, 0x10), failed]);
        let issues = validate(&log);
        let kinds: Vec<(Option<usize>, IssueKind)> = issues.iter().map(|i| (i.step, i.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (Some(0), IssueKind::StepIssue),
                (Some(1), IssueKind::ActorNotProtected),
                (Some(2), IssueKind::StepIssue),
            ]
        );
        assert_eq!(validate_with(&log, &[&NoStepIssues, &NoStepIssues]).len(), 2);
    }
}
