use orthanc_core::OrthancError;

/// DIMSE response statuses this server ever emits. Named, not raw `u16`,
/// so callers match by meaning; `code()` gives the wire value per
/// PS3.7 Annex C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    Success,
    Pending,
    RefusedOutOfResources,
    ErrorDataSetDoesNotMatchSopClass,
    ErrorCannotUnderstand,
    CancelMatchingTerminatedDueToCancelRequest,
    WarningSubOperationsCompleteOneOrMoreFailures,
    RefusedOutOfResourcesSubOperations,
    FailedUnableToProcess,
}

impl DimseStatus {
    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Pending => 0xFF00,
            DimseStatus::RefusedOutOfResources => 0xA700,
            DimseStatus::ErrorDataSetDoesNotMatchSopClass => 0xA900,
            DimseStatus::ErrorCannotUnderstand => 0xC000,
            DimseStatus::CancelMatchingTerminatedDueToCancelRequest => 0xFE00,
            DimseStatus::WarningSubOperationsCompleteOneOrMoreFailures => 0xB000,
            DimseStatus::RefusedOutOfResourcesSubOperations => 0xA702,
            DimseStatus::FailedUnableToProcess => 0xC002,
        }
    }
}

/// The canonical translation point from the core error taxonomy to a wire
/// status (spec.md §9 "the DIMSE response-status mapping table is the
/// canonical place for that translation").
pub fn map_error(err: &OrthancError) -> DimseStatus {
    match err {
        OrthancError::FullStorage => DimseStatus::RefusedOutOfResources,
        OrthancError::BadFileFormat(_) | OrthancError::CorruptedFile(_) => {
            DimseStatus::ErrorCannotUnderstand
        }
        OrthancError::NotEnoughMemory | OrthancError::CannotWriteFile(_) => {
            DimseStatus::RefusedOutOfResources
        }
        _ => DimseStatus::FailedUnableToProcess,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_storage_maps_to_refused_out_of_resources() {
        assert_eq!(map_error(&OrthancError::FullStorage), DimseStatus::RefusedOutOfResources);
    }

    #[test]
    fn unrecognized_kind_maps_to_unable_to_process() {
        assert_eq!(
            map_error(&OrthancError::InternalError("x".into())),
            DimseStatus::FailedUnableToProcess
        );
    }

    #[test]
    fn success_has_zero_code() {
        assert_eq!(DimseStatus::Success.code(), 0x0000);
    }
}
