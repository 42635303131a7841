//! # Simulated TPM
//!
//! PCR banks, a TCG-style event log and an ordered command log that keeps
//! the causal coordinates of every applied command.
//!
//! ## Commands
//!
//! | Command       | Effect                                               |
//! |---------------|------------------------------------------------------|
//! | `Init`        | reset all banks; PCR0 last byte = locality           |
//! | `Extend`      | `PCR = H(PCR || digest)`                             |
//! | `EventLogAdd` | append an event; PCR state untouched                 |
//!
//! Commands are validated before any state changes, so a failed command leaves
//! both the PCR table and the logs as they were.

use crate::data::Segment;
use crate::hash::HashAlgorithm;
use crate::Digest;
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

pub type PcrIndex = u32;

/// Total number of PCRs in TPM 2.0
pub const PCR_COUNT: u32 = 24;

/// Highest locality a TPM accepts
pub const MAX_LOCALITY: u8 = 4;

/// TCG event types used by the built-in flows
pub const EV_NO_ACTION: u32 = 0x0000_0003;
pub const EV_SEPARATOR: u32 = 0x0000_0004;
pub const EV_S_CRTM_CONTENTS: u32 = 0x0000_0007;
pub const EV_S_CRTM_VERSION: u32 = 0x0000_0008;
pub const EV_EFI_PLATFORM_FIRMWARE_BLOB: u32 = 0x8000_0008;

/// Signature of the TCG StartupLocality EV_NO_ACTION event
pub const STARTUP_LOCALITY_SIGNATURE: &[u8; 16] = b"StartupLocality\0";

/// Separator event data on the success path
pub const SEPARATOR: [u8; 4] = 0u32.to_le_bytes();

/// Separator event data when firmware hit an error
pub const SEPARATOR_ERROR: [u8; 4] = 1u32.to_le_bytes();

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TpmError {
    #[error("TPM is not initialised (PCR{pcr} {algorithm})")]
    NotInitialized { pcr: PcrIndex, algorithm: HashAlgorithm },
    #[error("hash algorithm {0} has no PCR bank")]
    UnsupportedAlgorithm(HashAlgorithm),
    #[error("PCR index {pcr} out of range (TPM has {count} PCRs)")]
    BadPcrIndex { pcr: PcrIndex, count: u32 },
    #[error("{algorithm} digest must be {expected} bytes, got {actual}")]
    DigestSize {
        algorithm: HashAlgorithm,
        expected: usize,
        actual: usize,
    },
    #[error("locality {0} out of range")]
    BadLocality(u8),
}

pub type TpmResult<T> = Result<T, TpmError>;

// ============================================================================
// COMMANDS & LOGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Init {
        locality: u8,
    },
    Extend {
        pcr: PcrIndex,
        algorithm: HashAlgorithm,
        digest: Digest,
    },
    EventLogAdd {
        pcr: PcrIndex,
        algorithm: HashAlgorithm,
        digest: Digest,
        event_type: u32,
        #[serde(with = "crate::hex_bytes")]
        data: Vec<u8>,
    },
}

impl Command {
    pub fn is_extend(&self) -> bool {
        matches!(self, Command::Extend { .. })
    }

    /// `(pcr, algorithm)` for extend commands
    pub fn extend_target(&self) -> Option<(PcrIndex, HashAlgorithm)> {
        match self {
            Command::Extend { pcr, algorithm, .. } => Some((*pcr, *algorithm)),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Init { locality } => write!(f, "Init(locality={})", locality),
            Command::Extend { pcr, algorithm, digest } => {
                write!(f, "Extend(PCR{}, {}, {})", pcr, algorithm, digest)
            }
            Command::EventLogAdd {
                pcr,
                algorithm,
                event_type,
                ..
            } => write!(f, "EventLogAdd(PCR{}, {}, type={:#x})", pcr, algorithm, event_type),
        }
    }
}

/// Which flow step and action produced a command
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CauseCoordinates {
    pub flow: String,
    pub step_index: usize,
    pub action_index: usize,
}

impl fmt::Display for CauseCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}].{}", self.flow, self.step_index, self.action_index)
    }
}

/// Bytes that were hashed into an extended digest, with their origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage {
    #[serde(with = "crate::hex_bytes")]
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub command: Command,
    pub cause: Option<CauseCoordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<Preimage>,
}

impl CommandLogEntry {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            cause: None,
            preimage: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub pcr: PcrIndex,
    pub algorithm: HashAlgorithm,
    pub digest: Digest,
    pub event_type: u32,
    #[serde(with = "crate::hex_bytes")]
    pub data: Vec<u8>,
    pub cause: Option<CauseCoordinates>,
}

impl EventLogEntry {
    /// Locality carried by a StartupLocality event
    pub fn startup_locality(&self) -> Option<u8> {
        if self.event_type != EV_NO_ACTION || self.data.len() != STARTUP_LOCALITY_SIGNATURE.len() + 1 {
            return None;
        }
        if !self.data.starts_with(STARTUP_LOCALITY_SIGNATURE) {
            return None;
        }
        self.data.last().copied()
    }
}

// ============================================================================
// TPM
// ============================================================================

/// The PCR value right after `Init`
pub fn initial_pcr_value(pcr: PcrIndex, algorithm: HashAlgorithm, locality: u8) -> Digest {
    let mut value = Digest::zero(algorithm.digest_size());
    if pcr == 0 {
        if let Some(last) = value.0.last_mut() {
            *last = locality;
        }
    }
    value
}

#[derive(Debug, Clone)]
pub struct Tpm {
    supported: Vec<HashAlgorithm>,
    pcr_count: u32,
    /// `None` until the first `Init`
    pcrs: Option<BTreeMap<(PcrIndex, HashAlgorithm), Digest>>,
    command_log: Vec<CommandLogEntry>,
    event_log: Vec<EventLogEntry>,
}

impl Default for Tpm {
    fn default() -> Self {
        Self::new(vec![HashAlgorithm::Sha1, HashAlgorithm::Sha256], PCR_COUNT)
    }
}

impl Tpm {
    pub fn new(supported: Vec<HashAlgorithm>, pcr_count: u32) -> Self {
        Self {
            supported,
            pcr_count,
            pcrs: None,
            command_log: Vec::new(),
            event_log: Vec::new(),
        }
    }

    pub fn supported_algorithms(&self) -> &[HashAlgorithm] {
        &self.supported
    }

    pub fn pcr_count(&self) -> u32 {
        self.pcr_count
    }

    pub fn is_initialized(&self) -> bool {
        self.pcrs.is_some()
    }

    pub fn command_log(&self) -> &[CommandLogEntry] {
        &self.command_log
    }

    pub fn event_log(&self) -> &[EventLogEntry] {
        &self.event_log
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.command_log.iter().map(|e| &e.command)
    }

    pub fn pcr_value(&self, pcr: PcrIndex, algorithm: HashAlgorithm) -> TpmResult<&Digest> {
        self.check_target(pcr, algorithm)?;
        self.pcrs
            .as_ref()
            .and_then(|t| t.get(&(pcr, algorithm)))
            .ok_or(TpmError::NotInitialized { pcr, algorithm })
    }

    fn check_target(&self, pcr: PcrIndex, algorithm: HashAlgorithm) -> TpmResult<()> {
        if !self.supported.contains(&algorithm) {
            return Err(TpmError::UnsupportedAlgorithm(algorithm));
        }
        if pcr >= self.pcr_count {
            return Err(TpmError::BadPcrIndex {
                pcr,
                count: self.pcr_count,
            });
        }
        Ok(())
    }

    fn check_digest(algorithm: HashAlgorithm, digest: &Digest) -> TpmResult<()> {
        if digest.len() != algorithm.digest_size() {
            return Err(TpmError::DigestSize {
                algorithm,
                expected: algorithm.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(())
    }

    /// Apply one command and append it to the command log
    pub fn execute(
        &mut self,
        command: Command,
        cause: Option<CauseCoordinates>,
        preimage: Option<Preimage>,
    ) -> TpmResult<()> {
        trace!("TPM {}", command);
        match &command {
            Command::Init { locality } => self.init(*locality, cause.as_ref())?,
            Command::Extend { pcr, algorithm, digest } => {
                self.check_target(*pcr, *algorithm)?;
                Self::check_digest(*algorithm, digest)?;
                let table = self.pcrs.as_mut().ok_or(TpmError::NotInitialized {
                    pcr: *pcr,
                    algorithm: *algorithm,
                })?;
                let value = table
                    .get_mut(&(*pcr, *algorithm))
                    .ok_or(TpmError::NotInitialized {
                        pcr: *pcr,
                        algorithm: *algorithm,
                    })?;
                *value = algorithm.extend(value, digest);
            }
            Command::EventLogAdd {
                pcr,
                algorithm,
                digest,
                event_type,
                data,
            } => {
                self.check_target(*pcr, *algorithm)?;
                Self::check_digest(*algorithm, digest)?;
                self.event_log.push(EventLogEntry {
                    pcr: *pcr,
                    algorithm: *algorithm,
                    digest: digest.clone(),
                    event_type: *event_type,
                    data: data.clone(),
                    cause: cause.clone(),
                });
            }
        }
        self.command_log.push(CommandLogEntry {
            command,
            cause,
            preimage,
        });
        Ok(())
    }

    fn init(&mut self, locality: u8, cause: Option<&CauseCoordinates>) -> TpmResult<()> {
        if locality > MAX_LOCALITY {
            return Err(TpmError::BadLocality(locality));
        }
        let mut table = BTreeMap::new();
        for &algorithm in &self.supported {
            for pcr in 0..self.pcr_count {
                table.insert((pcr, algorithm), initial_pcr_value(pcr, algorithm, locality));
            }
        }
        self.pcrs = Some(table);

        if locality != 0 {
            let mut data = STARTUP_LOCALITY_SIGNATURE.to_vec();
            data.push(locality);
            for &algorithm in &self.supported {
                self.event_log.push(EventLogEntry {
                    pcr: 0,
                    algorithm,
                    digest: Digest::zero(algorithm.digest_size()),
                    event_type: EV_NO_ACTION,
                    data: data.clone(),
                    cause: cause.cloned(),
                });
            }
        }
        Ok(())
    }

    /// Build an independent TPM by executing `commands` from scratch
    pub fn replay<'a>(
        supported: &[HashAlgorithm],
        pcr_count: u32,
        commands: impl IntoIterator<Item = &'a Command>,
    ) -> TpmResult<Tpm> {
        let mut tpm = Tpm::new(supported.to_vec(), pcr_count);
        for command in commands {
            tpm.execute(command.clone(), None, None)?;
        }
        Ok(tpm)
    }
}

/// Final value of a single PCR bank after `commands`
///
/// Only `Init` and matching `Extend` commands are considered, which makes this
/// much cheaper than a full [`Tpm::replay`] inside search loops.
pub fn replay_pcr<'a>(
    commands: impl IntoIterator<Item = &'a Command>,
    pcr: PcrIndex,
    algorithm: HashAlgorithm,
) -> TpmResult<Digest> {
    let mut value: Option<Digest> = None;
    for command in commands {
        match command {
            Command::Init { locality } => {
                if *locality > MAX_LOCALITY {
                    return Err(TpmError::BadLocality(*locality));
                }
                value = Some(initial_pcr_value(pcr, algorithm, *locality));
            }
            Command::Extend {
                pcr: p,
                algorithm: a,
                digest,
            } if *p == pcr && *a == algorithm => {
                Tpm::check_digest(algorithm, digest)?;
                let current = value.as_ref().ok_or(TpmError::NotInitialized { pcr, algorithm })?;
                value = Some(algorithm.extend(current, digest));
            }
            _ => {}
        }
    }
    value.ok_or(TpmError::NotInitialized { pcr, algorithm })
}

// ============================================================================
// TESTS
// ============================================================================
