//! Row pipeline: read -> validate -> transform -> write
//!
//! Reading, validation and transformation are pure and synchronous. Writing
//! goes through the async [`RecordSink`] so the worker controls the chunk and
//! transaction boundaries.

pub mod fields;
pub mod models;
pub mod reader;
pub mod states;
pub mod transformer;
pub mod validator;
pub mod writer;

use thiserror::Error;

pub use fields::{Field, FieldLayout, LayoutError};
pub use models::{AlertLevel, DomainRecord, EventType, MagnitudeType, RawRecord};
pub use reader::{ReadError, RecordReader};
pub use transformer::{RecordTransformer, TransformError};
pub use validator::{FieldViolation, RecordValidator, ValidationError};
pub use writer::{MemoryRecordSink, PartitionKey, PgRecordSink, RecordSink, SinkError};

/// Why a single row could not be turned into a [`DomainRecord`]
#[derive(Debug, Error)]
pub enum RowError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Validation followed by transformation
#[derive(Debug, Clone, Copy, Default)]
pub struct RowProcessor {
    validator: RecordValidator,
    transformer: RecordTransformer,
}

impl RowProcessor {
    pub fn process(&self, raw: RawRecord) -> Result<DomainRecord, RowError> {
        self.validator.validate(&raw)?;
        Ok(self.transformer.transform(raw)?)
    }
}
