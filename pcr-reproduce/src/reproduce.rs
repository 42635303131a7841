//! # PCR0 Reproduction
//!
//! Searches for the cheapest set of corrections to a recorded TPM command log
//! whose replay yields an expected PCR0 digest.
//!
//! ## Search Order
//!
//! Structural corrections are explored by iterative deepening over their
//! total cost (disabled measurements + adjacent swaps). For every structural
//! candidate each startup locality is tried, the recorded one first, and
//! inside that the bit flips of the correction window by increasing
//! distance. The first match wins; exhausting the bounds yields `Ok(None)`.
//!
//! A TPM `Init` resets every PCR, so only the PCR0 extends after the last
//! `Init` of the log are searched, and that `Init`'s locality is the recorded
//! one. Earlier entries are kept untouched when a result is applied.
//!
//! Every hit is replayed on a fresh [`Tpm`] before it is returned.

use crate::bruteforce::{BruteForceError, BruteForceProblem, Combinations};
use crate::settings::{CorrectionTarget, ReproduceSettings};
use bootflow::tpm::{Command, CommandLogEntry, PCR_COUNT};
use bootflow::{ConfigError, Digest, HashAlgorithm, Range, Tpm, TpmError};
use log::{debug, info, trace};
use std::fmt;
use thiserror::Error;

const PCR0: u32 = 0;

#[derive(Debug, Error)]
pub enum ReproduceError {
    #[error("expected {algorithm} digest of {expected} bytes, got {actual}")]
    DigestSize {
        algorithm: HashAlgorithm,
        expected: usize,
        actual: usize,
    },
    #[error("bad correction target: {0}")]
    BadCorrectionTarget(String),
    #[error(transparent)]
    Settings(#[from] ConfigError),
    #[error(transparent)]
    BruteForce(#[from] BruteForceError),
    #[error("replay failed: {0}")]
    Replay(#[from] TpmError),
    #[error("solution replays to {actual} instead of {expected}")]
    InconsistentSolution { expected: Digest, actual: Digest },
}

/// Bits flipped inside one entry's pre-image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCorrection {
    /// Command-log index of the corrected extend
    pub entry: usize,
    /// Window inside the pre-image
    pub window: Range,
    pub original: Vec<u8>,
    pub corrected: Vec<u8>,
    /// Bit positions relative to the window start
    pub flipped_bits: Vec<usize>,
}

impl fmt::Display for WindowCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry {} window {}: {} -> {} (bits {:?})",
            self.entry,
            self.window,
            hex::encode(&self.original),
            hex::encode(&self.corrected),
            self.flipped_bits
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReproducePcr0Result {
    pub algorithm: HashAlgorithm,
    pub locality: u8,
    /// Command-log indices of extends treated as never having happened
    pub disabled: Vec<usize>,
    /// Command-log index pairs swapped, applied in order
    pub reorders: Vec<(usize, usize)>,
    /// Present only when at least one bit was flipped
    pub correction: Option<WindowCorrection>,
}

impl ReproducePcr0Result {
    /// Corrected bytes of the window, e.g. a register value
    pub fn corrected_value(&self) -> Option<&[u8]> {
        self.correction.as_ref().map(|c| c.corrected.as_slice())
    }

    pub fn correction_count(&self) -> usize {
        self.disabled.len()
            + self.reorders.len()
            + self.correction.as_ref().map_or(0, |c| c.flipped_bits.len())
    }

    /// Commands with every correction applied
    pub fn apply(&self, command_log: &[CommandLogEntry]) -> Result<Vec<Command>, ReproduceError> {
        let mut ordered: Vec<(usize, Command)> = Vec::with_capacity(command_log.len() + 1);
        let reset = last_init(command_log).map(|(index, _)| index);
        for (index, entry) in command_log.iter().enumerate() {
            let command = match &entry.command {
                Command::Init { .. } if reset == Some(index) => Command::Init { locality: self.locality },
                Command::Extend { pcr, algorithm, .. }
                    if self.correction.as_ref().is_some_and(|c| c.entry == index) =>
                {
                    let digest = corrected_digest(entry, *algorithm, self.correction.as_ref())?;
                    Command::Extend {
                        pcr: *pcr,
                        algorithm: *algorithm,
                        digest,
                    }
                }
                other => other.clone(),
            };
            ordered.push((index, command));
        }
        if reset.is_none() {
            ordered.insert(0, (usize::MAX, Command::Init { locality: self.locality }));
        }

        for (a, b) in &self.reorders {
            let pa = ordered.iter().position(|(i, _)| i == a);
            let pb = ordered.iter().position(|(i, _)| i == b);
            match (pa, pb) {
                (Some(pa), Some(pb)) => ordered.swap(pa, pb),
                _ => {
                    return Err(ReproduceError::BadCorrectionTarget(format!(
                        "reorder ({}, {}) outside the command log",
                        a, b
                    )))
                }
            }
        }
        Ok(ordered
            .into_iter()
            .filter(|(i, _)| !self.disabled.contains(i))
            .map(|(_, c)| c)
            .collect())
    }
}

fn corrected_digest(
    entry: &CommandLogEntry,
    algorithm: HashAlgorithm,
    correction: Option<&WindowCorrection>,
) -> Result<Digest, ReproduceError> {
    let (Some(correction), Some(preimage)) = (correction, entry.preimage.as_ref()) else {
        return Err(ReproduceError::BadCorrectionTarget("entry has no pre-image".into()));
    };
    let mut bytes = preimage.bytes.clone();
    let start = correction.window.offset as usize;
    let end = correction.window.end() as usize;
    if end > bytes.len() || correction.corrected.len() != end - start {
        return Err(ReproduceError::BadCorrectionTarget(format!(
            "window {} outside a {}-byte pre-image",
            correction.window,
            bytes.len()
        )));
    }
    bytes[start..end].copy_from_slice(&correction.corrected);
    Ok(algorithm.hash(&bytes))
}

// ============================================================================
// SEARCH
// ============================================================================

/// The PCR0 extends of one bank after the last `Init`, in log order
struct Measurements {
    indices: Vec<usize>,
    digests: Vec<Digest>,
}

/// Located correction window
struct Window {
    /// Position inside `Measurements`
    slot: usize,
    entry: usize,
    range: Range,
    preimage: Vec<u8>,
}

impl Window {
    fn locate(
        target: &CorrectionTarget,
        command_log: &[CommandLogEntry],
        measurements: &Measurements,
    ) -> Result<Self, ReproduceError> {
        let (entry, range) = match target {
            CorrectionTarget::Window { entry, range } => (*entry, *range),
            CorrectionTarget::Artifact { artifact, range } => measurements
                .indices
                .iter()
                .find_map(|&index| {
                    let preimage = command_log[index].preimage.as_ref()?;
                    preimage
                        .segments
                        .iter()
                        .find(|s| s.artifact == *artifact && s.range.contains_range(range))
                        .map(|s| (index, Range::new(s.offset + (range.offset - s.range.offset), range.length)))
                })
                .ok_or_else(|| {
                    ReproduceError::BadCorrectionTarget(format!("no PCR0 pre-image contains {} {}", artifact, range))
                })?,
        };
        let slot = measurements
            .indices
            .iter()
            .position(|i| *i == entry)
            .ok_or_else(|| ReproduceError::BadCorrectionTarget(format!("entry {} is not a PCR0 extend after the last init", entry)))?;
        let preimage = command_log[entry]
            .preimage
            .as_ref()
            .map(|p| p.bytes.clone())
            .ok_or_else(|| ReproduceError::BadCorrectionTarget(format!("entry {} has no pre-image", entry)))?;
        if range.is_empty() || range.end() as usize > preimage.len() {
            return Err(ReproduceError::BadCorrectionTarget(format!(
                "window {} outside the {}-byte pre-image of entry {}",
                range,
                preimage.len(),
                entry
            )));
        }
        Ok(Self {
            slot,
            entry,
            range,
            preimage,
        })
    }

    fn bytes(&self) -> &[u8] {
        &self.preimage[self.range.offset as usize..self.range.end() as usize]
    }

    fn digest_with(&self, algorithm: HashAlgorithm, window: &[u8]) -> Digest {
        let start = self.range.offset as usize;
        let end = self.range.end() as usize;
        algorithm.hash_parts([&self.preimage[..start], window, &self.preimage[end..]])
    }
}

/// One structural candidate: measurement order after disabling and swapping
struct Candidate {
    /// Positions into `Measurements`, in extend order
    order: Vec<usize>,
    disabled: Vec<usize>,
    swaps: Vec<(usize, usize)>,
}

fn candidates(count: usize, disabled: usize, reorders: usize) -> impl Iterator<Item = Candidate> {
    Combinations::new(count, disabled).flat_map(move |off| {
        let kept: Vec<usize> = (0..count).filter(|i| !off.contains(i)).collect();
        let gaps = kept.len().saturating_sub(1);
        Combinations::new(gaps, reorders).map(move |positions| {
            let mut order = kept.clone();
            let mut swaps = Vec::with_capacity(positions.len());
            for p in positions {
                swaps.push((order[p], order[p + 1]));
                order.swap(p, p + 1);
            }
            Candidate {
                order,
                disabled: off.clone(),
                swaps,
            }
        })
    })
}

fn fold(algorithm: HashAlgorithm, locality: u8, digests: impl Iterator<Item = Digest>) -> Digest {
    let init = bootflow::tpm::initial_pcr_value(PCR0, algorithm, locality);
    digests.fold(init, |acc, d| algorithm.extend(&acc, &d))
}

/// Index and locality of the last `Init`
fn last_init(command_log: &[CommandLogEntry]) -> Option<(usize, u8)> {
    command_log.iter().enumerate().rev().find_map(|(index, e)| match e.command {
        Command::Init { locality } => Some((index, locality)),
        _ => None,
    })
}

fn localities(command_log: &[CommandLogEntry], settings: &ReproduceSettings) -> Vec<u8> {
    let recorded = last_init(command_log).map_or(0, |(_, locality)| locality);
    let mut out = vec![recorded];
    for l in &settings.localities {
        if !out.contains(l) {
            out.push(*l);
        }
    }
    out
}

/// Search corrections of `command_log` reproducing `expected` in PCR0
pub fn reproduce_pcr0(
    command_log: &[CommandLogEntry],
    algorithm: HashAlgorithm,
    expected: &Digest,
    settings: &ReproduceSettings,
) -> Result<Option<ReproducePcr0Result>, ReproduceError> {
    settings.validate()?;
    if expected.len() != algorithm.digest_size() {
        return Err(ReproduceError::DigestSize {
            algorithm,
            expected: algorithm.digest_size(),
            actual: expected.len(),
        });
    }

    let mut measurements = Measurements {
        indices: Vec::new(),
        digests: Vec::new(),
    };
    let start = last_init(command_log).map_or(0, |(index, _)| index + 1);
    for (index, entry) in command_log.iter().enumerate().skip(start) {
        if let Command::Extend { pcr: PCR0, algorithm: a, digest } = &entry.command {
            if *a == algorithm {
                measurements.indices.push(index);
                measurements.digests.push(digest.clone());
            }
        }
    }
    let window = settings
        .correction
        .as_ref()
        .map(|t| Window::locate(t, command_log, &measurements))
        .transpose()?;
    let localities = localities(command_log, settings);
    let count = measurements.digests.len();
    debug!(
        "reproducing PCR0 {} over {} measurements, localities {:?}",
        algorithm, count, localities
    );

    let max_cost = settings.max_disabled_measurements + settings.max_reorders;
    for cost in 0..=max_cost {
        for disabled in 0..=cost.min(settings.max_disabled_measurements).min(count) {
            let reorders = cost - disabled;
            if reorders > settings.max_reorders {
                continue;
            }
            trace!("cost {}: {} disabled, {} swaps", cost, disabled, reorders);
            for candidate in candidates(count, disabled, reorders) {
                for &locality in &localities {
                    if let Some(result) =
                        try_candidate(&candidate, locality, algorithm, expected, &measurements, window.as_ref(), settings)?
                    {
                        verify(&result, command_log, algorithm, expected)?;
                        info!(
                            "reproduced PCR0 {} with {} corrections (locality {})",
                            algorithm,
                            result.correction_count(),
                            locality
                        );
                        if let Some(correction) = &result.correction {
                            debug!("corrected {}", correction);
                        }
                        return Ok(Some(result));
                    }
                }
            }
        }
    }
    debug!("no correction within bounds reproduces PCR0 {}", algorithm);
    Ok(None)
}

fn try_candidate(
    candidate: &Candidate,
    locality: u8,
    algorithm: HashAlgorithm,
    expected: &Digest,
    measurements: &Measurements,
    window: Option<&Window>,
    settings: &ReproduceSettings,
) -> Result<Option<ReproducePcr0Result>, ReproduceError> {
    let result = |correction: Option<WindowCorrection>| ReproducePcr0Result {
        algorithm,
        locality,
        disabled: candidate.disabled.iter().map(|s| measurements.indices[*s]).collect(),
        reorders: candidate
            .swaps
            .iter()
            .map(|(a, b)| (measurements.indices[*a], measurements.indices[*b]))
            .collect(),
        correction,
    };

    // window is only searched while its measurement still takes part
    let window = window.filter(|w| candidate.order.contains(&w.slot));
    let Some(window) = window else {
        let value = fold(algorithm, locality, candidate.order.iter().map(|s| measurements.digests[*s].clone()));
        return Ok((value == *expected).then(|| result(None)));
    };

    let check = |bytes: &[u8]| {
        let corrected = window.digest_with(algorithm, bytes);
        let digests = candidate.order.iter().map(|s| {
            if *s == window.slot {
                corrected.clone()
            } else {
                measurements.digests[*s].clone()
            }
        });
        fold(algorithm, locality, digests) == *expected
    };
    let problem = BruteForceProblem::new(window.bytes(), settings.max_bit_distance);
    let solution = if settings.parallel {
        problem.solve_parallel(check)?
    } else {
        problem.solve(check)?
    };
    Ok(solution.map(|s| {
        let correction = (s.distance() > 0).then(|| WindowCorrection {
            entry: window.entry,
            window: window.range,
            original: window.bytes().to_vec(),
            corrected: s.bytes,
            flipped_bits: s.bits,
        });
        result(correction)
    }))
}

/// Replay the corrected log on a fresh TPM and compare
fn verify(
    result: &ReproducePcr0Result,
    command_log: &[CommandLogEntry],
    algorithm: HashAlgorithm,
    expected: &Digest,
) -> Result<(), ReproduceError> {
    let commands = result.apply(command_log)?;
    let mut banks: Vec<HashAlgorithm> = vec![algorithm];
    for command in &commands {
        let bank = match command {
            Command::Extend { algorithm, .. } | Command::EventLogAdd { algorithm, .. } => *algorithm,
            Command::Init { .. } => continue,
        };
        if !banks.contains(&bank) {
            banks.push(bank);
        }
    }
    let tpm = Tpm::replay(&banks, PCR_COUNT, &commands)?;
    let actual = tpm.pcr_value(PCR0, algorithm)?;
    if actual != expected {
        return Err(ReproduceError::InconsistentSolution {
            expected: expected.clone(),
            actual: actual.clone(),
        });
    }
    Ok(())
}
