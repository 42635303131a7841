//! References to artifact bytes and the `Data` union built from them

use crate::artifact::{read_range, AddressMapper, ArtifactError, ArtifactKind, Range, Ranges, SystemArtifact};
use crate::hash::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("data cannot hold both literal bytes and references")]
    MixedForms,
    #[error("a converter cannot be applied to literal bytes")]
    ConverterOnLiteral,
    #[error("data holds neither literal bytes nor references")]
    Empty,
    #[error("artifact {0} is not available")]
    MissingArtifact(ArtifactKind),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Something that hands out artifacts by kind (implemented by `State`)
pub trait ArtifactProvider {
    fn artifact(&self, kind: ArtifactKind) -> Option<&dyn SystemArtifact>;
}

/// Transforms the concatenated bytes of references (e.g. hashes them)
pub trait DataConverter: fmt::Debug + Send + Sync {
    fn name(&self) -> String;
    fn convert(&self, input: &[u8]) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashConverter(pub HashAlgorithm);

impl DataConverter for HashConverter {
    fn name(&self) -> String {
        self.0.name().to_string()
    }

    fn convert(&self, input: &[u8]) -> Vec<u8> {
        self.0.hash(input).0
    }
}

/// Where a piece of a pre-image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub artifact: ArtifactKind,
    /// Native range inside the artifact
    pub range: Range,
    /// Offset of the first byte inside the concatenated pre-image
    pub offset: u64,
}

/// A located slice of an artifact
#[derive(Debug, Clone)]
pub struct Reference {
    pub artifact: ArtifactKind,
    /// `None` means the ranges are already native offsets
    pub mapper: Option<Arc<dyn AddressMapper>>,
    pub ranges: Ranges,
}

impl Reference {
    pub fn native(artifact: ArtifactKind, ranges: impl Into<Ranges>) -> Self {
        Self {
            artifact,
            mapper: None,
            ranges: ranges.into(),
        }
    }

    pub fn mapped(artifact: ArtifactKind, mapper: Arc<dyn AddressMapper>, ranges: impl Into<Ranges>) -> Self {
        Self {
            artifact,
            mapper: Some(mapper),
            ranges: ranges.into(),
        }
    }

    /// Native ranges, sorted and merged
    pub fn resolve(&self, artifact: &dyn SystemArtifact) -> Result<Ranges, ArtifactError> {
        let mut native = match &self.mapper {
            Some(mapper) => mapper.resolve(artifact, &self.ranges)?,
            None => self.ranges.clone(),
        };
        native.sort_and_merge();
        Ok(native)
    }

    /// Read all referenced bytes into one buffer
    pub fn resolve_and_read(&self, artifact: &dyn SystemArtifact) -> Result<(Vec<u8>, Vec<Segment>), ArtifactError> {
        let native = self.resolve(artifact)?;
        let mut bytes = Vec::with_capacity(native.total_length() as usize);
        let mut segments = Vec::with_capacity(native.0.len());
        for range in native.iter() {
            segments.push(Segment {
                artifact: self.artifact,
                range: *range,
                offset: bytes.len() as u64,
            });
            bytes.extend(read_range(artifact, *range)?);
        }
        Ok((bytes, segments))
    }

    pub fn record(&self, artifact: &dyn SystemArtifact) -> Result<ReferenceRecord, ArtifactError> {
        Ok(ReferenceRecord {
            artifact: self.artifact,
            mapper: self.mapper.as_ref().map(|m| m.name().to_string()),
            ranges: self.ranges.clone(),
            native: self.resolve(artifact)?,
        })
    }
}

/// Literal bytes or references (optionally converted)
#[derive(Debug, Clone)]
pub enum Data {
    Bytes(Vec<u8>),
    References {
        references: Vec<Reference>,
        converter: Option<Arc<dyn DataConverter>>,
    },
}

impl Data {
    /// Build `Data`, rejecting mixed literal/reference forms
    pub fn try_new(
        bytes: Option<Vec<u8>>,
        references: Vec<Reference>,
        converter: Option<Arc<dyn DataConverter>>,
    ) -> Result<Self, DataError> {
        match (bytes, references.is_empty()) {
            (Some(_), false) => Err(DataError::MixedForms),
            (Some(_), true) if converter.is_some() => Err(DataError::ConverterOnLiteral),
            (Some(bytes), true) => Ok(Data::Bytes(bytes)),
            (None, true) => Err(DataError::Empty),
            (None, false) => Ok(Data::References { references, converter }),
        }
    }

    pub fn references(references: Vec<Reference>) -> Self {
        Data::References {
            references,
            converter: None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Data::Bytes(_))
    }

    pub fn converter(&self) -> Option<&Arc<dyn DataConverter>> {
        match self {
            Data::References { converter, .. } => converter.as_ref(),
            Data::Bytes(_) => None,
        }
    }

    /// Describe the data without reading it
    pub fn record(&self, provider: &dyn ArtifactProvider) -> Result<DataRecord, DataError> {
        match self {
            Data::Bytes(bytes) => Ok(DataRecord::Bytes { bytes: bytes.clone() }),
            Data::References { references, converter } => {
                let records = references
                    .iter()
                    .map(|r| -> Result<ReferenceRecord, DataError> {
                        let artifact = provider
                            .artifact(r.artifact)
                            .ok_or(DataError::MissingArtifact(r.artifact))?;
                        Ok(r.record(artifact)?)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DataRecord::References {
                    references: records,
                    converter: converter.as_ref().map(|c| c.name()),
                })
            }
        }
    }

    /// Read the referenced bytes and apply the converter
    pub fn resolve(&self, provider: &dyn ArtifactProvider) -> Result<ResolvedData, DataError> {
        let record = self.record(provider)?;
        match self {
            Data::Bytes(bytes) => Ok(ResolvedData {
                raw: bytes.clone(),
                segments: Vec::new(),
                converted: None,
                record,
            }),
            Data::References { references, converter } => {
                let mut raw = Vec::new();
                let mut segments = Vec::new();
                for reference in references {
                    let artifact = provider
                        .artifact(reference.artifact)
                        .ok_or(DataError::MissingArtifact(reference.artifact))?;
                    let (bytes, segs) = reference.resolve_and_read(artifact)?;
                    let base = raw.len() as u64;
                    segments.extend(segs.into_iter().map(|s| Segment {
                        offset: s.offset + base,
                        ..s
                    }));
                    raw.extend(bytes);
                }
                let converted = converter.as_ref().map(|c| c.convert(&raw));
                Ok(ResolvedData {
                    raw,
                    segments,
                    converted,
                    record,
                })
            }
        }
    }
}

/// Bytes read for a `Data` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedData {
    /// Concatenated referenced bytes (or the literal bytes)
    pub raw: Vec<u8>,
    pub segments: Vec<Segment>,
    /// Converter output, if a converter was set
    pub converted: Option<Vec<u8>>,
    pub record: DataRecord,
}

impl ResolvedData {
    /// Final value: converter output if present, raw bytes otherwise
    pub fn value(&self) -> &[u8] {
        self.converted.as_deref().unwrap_or(&self.raw)
    }
}

/// Serializable description of one reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub artifact: ArtifactKind,
    pub mapper: Option<String>,
    pub ranges: Ranges,
    pub native: Ranges,
}

/// Serializable description of a `Data` value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataRecord {
    Bytes {
        #[serde(with = "crate::hex_bytes")]
        bytes: Vec<u8>,
    },
    References {
        references: Vec<ReferenceRecord>,
        converter: Option<String>,
    },
}

impl DataRecord {
    /// Native ranges touched inside one artifact
    pub fn native_ranges(&self, artifact: ArtifactKind) -> Ranges {
        match self {
            DataRecord::Bytes { .. } => Ranges::new(),
            DataRecord::References { references, .. } => references
                .iter()
                .filter(|r| r.artifact == artifact)
                .flat_map(|r| r.native.iter().copied())
                .collect::<Ranges>()
                .merged(),
        }
    }
}
