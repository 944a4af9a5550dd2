use thiserror::Error;

use orthanc_core::OrthancError;

#[derive(Debug, Error)]
pub enum DimseError {
    #[error(transparent)]
    Core(#[from] OrthancError),

    #[error("DICOM network error: {0}")]
    Network(String),

    #[error("malformed DICOM data set: {0}")]
    Malformed(String),

    #[error("unknown remote modality: {0}")]
    UnknownModality(String),
}

impl From<dicom_ul::association::server::Error> for DimseError {
    fn from(e: dicom_ul::association::server::Error) -> Self {
        DimseError::Network(e.to_string())
    }
}

impl From<dicom_ul::association::client::Error> for DimseError {
    fn from(e: dicom_ul::association::client::Error) -> Self {
        DimseError::Network(e.to_string())
    }
}
