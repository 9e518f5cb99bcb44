//! Candidate → conditional write.
//!
//! The reconciler never looks at the destination. Whether a write wins is
//! decided by the destination's version guard when the batch lands.

use crate::record::{Document, MalformedRecord, RecordSchema};
use crate::storage::traits::WriteOp;

/// A record produced by a scanner, as seen on the source side.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    /// The source currently holds this document.
    Present(Document),
    /// The change-log mentions `id` at `version` but the source no longer has it.
    Missing { id: String, version: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Write(WriteOp),
    Skip(MalformedRecord),
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    schema: RecordSchema,
}

impl Reconciler {
    #[must_use]
    pub fn new(schema: RecordSchema) -> Self {
        Self { schema }
    }

    #[must_use]
    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    #[must_use]
    pub fn reconcile(&self, candidate: Candidate) -> Action {
        match candidate {
            Candidate::Present(document) => self.reconcile_document(&document),
            Candidate::Missing { id, version } if version >= 0 => Action::Write(WriteOp::Delete { id, version }),
            Candidate::Missing { id, version } => Action::Skip(MalformedRecord {
                id: Some(id),
                reason: format!("negative version {}", version),
            }),
        }
    }

    /// Validate and project a present document into a conditional upsert.
    #[must_use]
    pub fn reconcile_document(&self, document: &Document) -> Action {
        match self.schema.extract(document) {
            Ok(record) => Action::Write(WriteOp::Upsert(record)),
            Err(malformed) => Action::Skip(malformed),
        }
    }
}
