use thiserror::Error;
use orthanc_core::OrthancError;

#[derive(Debug, Error, Clone)]
pub enum JobError {
    #[error(transparent)]
    Core(#[from] OrthancError),

    #[error("job was canceled")]
    Canceled,

    #[error("no such job: {0}")]
    InexistentItem(String),

    #[error("job {0} cannot be resubmitted from its current state")]
    BadSequenceOfCalls(String),
}
