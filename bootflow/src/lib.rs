//! # Measured Boot Flow Simulation
//!
//! This library replays, step by step, how a platform's hardware roots of
//! trust (Intel ACM/PCH, AMD PSP) measure firmware regions into a TPM, and
//! keeps an auditable causal log of every measurement.
//!
//! ## Building Blocks
//!
//! - **Byte references**: [`SystemArtifact`], [`AddressMapper`], [`Reference`], [`Data`]
//! - **Data sources**: pluggable computations resolving to [`Data`] given a [`State`]
//! - **Trust chain**: the simulated [`Tpm`] with its command and event logs
//! - **Flows**: declarative [`Flow`]s of [`Step`]s yielding [`Action`]s
//! - **Driver**: [`BootProcess`] steps a [`State`] to completion, producing a [`Log`]
//! - **Validators**: post-hoc checks over a finished [`Log`]
//!
//! ## Typical Run
//!
//! ```text
//! FlowRegistry::builtin()? ->  State (firmware, registers, TPM, PCH)
//!        |                          |
//!        +------ run_flow ----------+--> Log + TPM command log + PCR values
//! ```

pub mod action;
pub mod artifact;
pub mod condition;
pub mod config;
pub mod data;
pub mod datasource;
pub mod firmware;
pub mod flow;
pub mod flows;
pub mod hash;
pub mod process;
pub mod state;
pub mod subsystem;
pub mod tpm;
pub mod validator;

// Re-exports
pub use action::{Action, ActionError, Actions};
pub use artifact::{
    AddressMapper, ArtifactError, ArtifactKind, ArtifactReadError, BytesArtifact, FileArtifact,
    IdentityMapper, MappingError, PhysMemMapper, Range, Ranges, SystemArtifact,
};
pub use condition::{Condition, SharedCondition};
pub use config::{ConfigError, SimulationConfig};
pub use data::{Data, DataConverter, DataError, DataRecord, HashConverter, Reference, ReferenceRecord, ResolvedData, Segment};
pub use datasource::{DataSource, SharedSource, SourceError};
pub use firmware::{FirmwareImage, FirmwareLayout, Register, RegisterId, RegisterSnapshot};
pub use flow::{Flow, FlowError, FlowRegistry, SharedStep, Step};
pub use hash::HashAlgorithm;
pub use process::{run_flow, ActionRecord, BootProcess, BootResult, Log, ProcessError, StepRecord};
pub use state::{Actor, ActorRecord, MeasuredData, State, StateError, VerifiedData};
pub use subsystem::{Pch, Psp, Subsystem, SubsystemKind};
pub use tpm::{
    CauseCoordinates, Command, CommandLogEntry, EventLogEntry, PcrIndex, Preimage, Tpm, TpmError,
    TpmResult,
};
pub use validator::{validate, Issue, IssueKind, Validator};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================================================
// CORE TYPES
// ============================================================================

/// A hash digest of any supported algorithm
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest(pub Vec<u8>);

impl Digest {
    /// Create a digest from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// All-zero digest of the given size (PCR reset value)
    pub fn zero(size: usize) -> Self {
        Self(vec![0u8; size])
    }

    /// Parse a digest from a hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s.trim()).map(Self)
    }

    /// Check if this is the zero digest
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Digest {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() <= 8 {
            return write!(f, "Digest({})", self.to_hex());
        }
        write!(f, "Digest(")?;
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "...")?;
        for byte in &self.0[self.0.len() - 4..] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helper storing byte vectors as hex strings
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
