//! # Event Log Reconciliation
//!
//! Rebuilds the extends of one PCR bank from an externally captured TPM event
//! log, keeping the locally recorded entry (with its cause and pre-image)
//! wherever both agree. Disagreements are reported as [`ReplayIssue`]s rather
//! than silently resolved in favour of either side.
//!
//! Which external events take part in the comparison is decided by a
//! pluggable [`EventLogSanitizer`].

use bootflow::tpm::{Command, CommandLogEntry, EventLogEntry, PcrIndex, EV_NO_ACTION};
use bootflow::{Digest, HashAlgorithm};
use log::warn;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayIssue {
    /// Same position, different digest; the event log value is used
    DigestMismatch {
        entry: usize,
        event: usize,
        recorded: Digest,
        logged: Digest,
    },
    /// A recorded extend absent from the event log
    MissingInEventLog { entry: usize },
    /// An event log extend that was never recorded
    UnexpectedInEventLog { event: usize },
    LocalityMismatch { recorded: u8, logged: u8 },
}

impl fmt::Display for ReplayIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayIssue::DigestMismatch {
                entry,
                event,
                recorded,
                logged,
            } => write!(
                f,
                "command {} extends {} but event {} logs {}",
                entry, recorded, event, logged
            ),
            ReplayIssue::MissingInEventLog { entry } => write!(f, "command {} is missing from the event log", entry),
            ReplayIssue::UnexpectedInEventLog { event } => write!(f, "event {} was never recorded", event),
            ReplayIssue::LocalityMismatch { recorded, logged } => {
                write!(f, "recorded locality {} but event log says {}", recorded, logged)
            }
        }
    }
}

// ============================================================================
// SANITIZERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Compare,
    /// Kept in the output, never matched against the recorded log
    KeepUncompared,
    Drop,
}

pub trait EventLogSanitizer {
    fn name(&self) -> &'static str;
    fn classify(&self, event: &EventLogEntry) -> EventDisposition;
}

/// Compares every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSanitizer;

impl EventLogSanitizer for NoSanitizer {
    fn name(&self) -> &'static str {
        "none"
    }

    fn classify(&self, _event: &EventLogEntry) -> EventDisposition {
        EventDisposition::Compare
    }
}

/// Heuristic for OCP platforms with a hardware root of trust
///
/// Only validated on those platforms: all-zero digests are dropped, and events
/// describing an HRoT measurement are kept but not compared.
#[derive(Debug, Clone, Copy, Default)]
pub struct HrotSanitizer;

pub const HROT_MEASUREMENT_MARKER: &str = "hrot measurement";

impl EventLogSanitizer for HrotSanitizer {
    fn name(&self) -> &'static str {
        "hrot"
    }

    fn classify(&self, event: &EventLogEntry) -> EventDisposition {
        if event.digest.is_zero() {
            return EventDisposition::Drop;
        }
        let description = String::from_utf8_lossy(&event.data).to_lowercase();
        if description.contains(HROT_MEASUREMENT_MARKER) {
            EventDisposition::KeepUncompared
        } else {
            EventDisposition::Compare
        }
    }
}

// ============================================================================
// RECONCILIATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// `Init` followed by the reconciled extends of the bank
    pub entries: Vec<CommandLogEntry>,
    pub issues: Vec<ReplayIssue>,
}

impl Reconciliation {
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.entries.iter().map(|e| &e.command)
    }
}

fn extend_entry(pcr: PcrIndex, algorithm: HashAlgorithm, digest: &Digest) -> CommandLogEntry {
    CommandLogEntry::new(Command::Extend {
        pcr,
        algorithm,
        digest: digest.clone(),
    })
}

fn recorded_digest(entry: &CommandLogEntry) -> Option<&Digest> {
    match &entry.command {
        Command::Extend { digest, .. } => Some(digest),
        _ => None,
    }
}

/// Reconcile the `(pcr, algorithm)` extends of `command_log` with `event_log`
pub fn reconcile(
    command_log: &[CommandLogEntry],
    event_log: &[EventLogEntry],
    pcr: PcrIndex,
    algorithm: HashAlgorithm,
    sanitizer: &dyn EventLogSanitizer,
) -> Reconciliation {
    let mut issues = Vec::new();

    let recorded_locality = command_log
        .iter()
        .find_map(|e| match e.command {
            Command::Init { locality } => Some(locality),
            _ => None,
        })
        .unwrap_or(0);
    // no StartupLocality event means locality 0
    let logged_locality = event_log.iter().find_map(|e| e.startup_locality()).unwrap_or(0);
    if recorded_locality != logged_locality {
        issues.push(ReplayIssue::LocalityMismatch {
            recorded: recorded_locality,
            logged: logged_locality,
        });
    }

    let local: Vec<usize> = command_log
        .iter()
        .enumerate()
        .filter(|(_, e)| e.command.extend_target() == Some((pcr, algorithm)))
        .map(|(i, _)| i)
        .collect();
    let events: Vec<(usize, EventDisposition)> = event_log
        .iter()
        .enumerate()
        .filter(|(_, e)| e.pcr == pcr && e.algorithm == algorithm && e.event_type != EV_NO_ACTION)
        .map(|(i, e)| (i, sanitizer.classify(e)))
        .filter(|(_, d)| *d != EventDisposition::Drop)
        .collect();
    let compared: Vec<usize> = events
        .iter()
        .filter(|(_, d)| *d == EventDisposition::Compare)
        .map(|(i, _)| *i)
        .collect();

    let mut entries = vec![CommandLogEntry::new(Command::Init {
        locality: logged_locality,
    })];
    let mut cursor = 0;
    for (event_index, disposition) in &events {
        let event = &event_log[*event_index];
        if *disposition == EventDisposition::KeepUncompared {
            entries.push(extend_entry(pcr, algorithm, &event.digest));
            continue;
        }
        let digest_at = |i: usize| local.get(i).and_then(|&e| recorded_digest(&command_log[e]));

        let Some(current) = digest_at(cursor) else {
            issues.push(ReplayIssue::UnexpectedInEventLog { event: *event_index });
            entries.push(extend_entry(pcr, algorithm, &event.digest));
            continue;
        };
        if *current == event.digest {
            entries.push(command_log[local[cursor]].clone());
            cursor += 1;
            continue;
        }
        // one-step look-ahead on either side before calling it a mismatch
        if digest_at(cursor + 1) == Some(&event.digest) {
            issues.push(ReplayIssue::MissingInEventLog { entry: local[cursor] });
            entries.push(command_log[local[cursor + 1]].clone());
            cursor += 2;
            continue;
        }
        let next_compared = compared
            .iter()
            .skip_while(|i| *i != event_index)
            .nth(1)
            .map(|i| &event_log[*i].digest);
        if next_compared == Some(current) {
            issues.push(ReplayIssue::UnexpectedInEventLog { event: *event_index });
            entries.push(extend_entry(pcr, algorithm, &event.digest));
            continue;
        }
        issues.push(ReplayIssue::DigestMismatch {
            entry: local[cursor],
            event: *event_index,
            recorded: current.clone(),
            logged: event.digest.clone(),
        });
        entries.push(extend_entry(pcr, algorithm, &event.digest));
        cursor += 1;
    }
    for &entry in local.iter().skip(cursor) {
        issues.push(ReplayIssue::MissingInEventLog { entry });
    }

    for issue in &issues {
        warn!("PCR{} {} ({} sanitizer): {}", pcr, algorithm, sanitizer.name(), issue);
    }
    Reconciliation { entries, issues }
}
