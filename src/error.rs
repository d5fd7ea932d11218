//! Error types for the progression engine.

use thiserror::Error;
use uuid::Uuid;

use crate::models::ValidationStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A cohort, student, event, course or progress record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Students are already on the roster of another non-archived cohort.
    #[error("students already enrolled elsewhere (target cohort {cohort_id}): {students:?}")]
    ConflictingEnrollment { cohort_id: Uuid, students: Vec<Uuid> },

    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),

    /// The event is not linked to any cohort the student belongs to.
    #[error("event {event_id} is not linked to a cohort of student {student_id}")]
    InvalidCohort { event_id: Uuid, student_id: Uuid },

    /// A roster move was only partially applied and could not be compensated.
    #[error("migration of student {student_id} left inconsistent state: {detail}")]
    MigrationInconsistency { student_id: Uuid, detail: String },

    #[error("failed to apply validation for student {student_id}: {source}")]
    ValidationApplyFailure {
        student_id: Uuid,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ValidationStatus,
        to: ValidationStatus,
    },

    #[error("an active cohort already exists for semester {semester} in {academic_year}")]
    DuplicateActiveCohort { semester: u8, academic_year: String },

    #[error("cohort {0} still has enrolled students")]
    CohortNotEmpty(Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for `NotFound`, including one wrapped by a bulk apply failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::ValidationApplyFailure { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// One member of a batch that could not be processed.
#[derive(Debug)]
pub struct BatchFailure {
    pub id: Uuid,
    pub error: Error,
}

impl BatchFailure {
    pub fn new(id: Uuid, error: Error) -> Self {
        Self { id, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_visible_through_apply_failure() {
        let student_id = Uuid::new_v4();
        let err = Error::ValidationApplyFailure {
            student_id,
            source: Box::new(Error::not_found("progress record", student_id)),
        };
        assert!(err.is_not_found());
        assert!(!Error::InvalidCriteria("min grade".into()).is_not_found());
    }
}
