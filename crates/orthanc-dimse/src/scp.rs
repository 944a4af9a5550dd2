use crate::handler::{AnswerSet, GetStepStatus, Identifier, MoveRequestIterator};
use crate::status::DimseStatus;
use orthanc_core::DicomTag;

/// C-FIND state threaded through repeated callback invocations: the
/// assembled answer set plus a cursor into it (spec.md §4.I "On subsequent
/// invocations responseCount indexes into the container").
pub struct FindState {
    answers: AnswerSet,
    response_count: usize,
}

impl FindState {
    pub fn new(answers: AnswerSet) -> Self {
        FindState { answers, response_count: 0 }
    }

    /// One callback invocation's worth of work: emit the next pending
    /// answer, or the terminal status once the answer set is exhausted.
    pub fn next(&mut self) -> (DimseStatus, Option<Identifier>) {
        if self.response_count < self.answers.answers.len() {
            let identifier = self.answers.answers[self.response_count].clone();
            self.response_count += 1;
            (DimseStatus::Pending, Some(identifier))
        } else if self.answers.incomplete {
            (DimseStatus::CancelMatchingTerminatedDueToCancelRequest, None)
        } else {
            (DimseStatus::Success, None)
        }
    }
}

/// A worklist or regular find query plus the two reference sequences the
/// fixup in spec.md scenario 4 inspects before the worklist handler runs.
pub struct WorklistQuery {
    pub identifier: Identifier,
    pub referenced_study_sequence: Vec<Identifier>,
    pub referenced_patient_sequence: Vec<Identifier>,
}

const REFERENCED_SOP_CLASS_UID: DicomTag = DicomTag(0x0008, 0x1150);
const REFERENCED_SOP_INSTANCE_UID: DicomTag = DicomTag(0x0008, 0x1155);

/// True when `items` is exactly the single-empty-item shape spec.md
/// scenario 4 describes: one item whose `ReferencedSOPClassUID` and
/// `ReferencedSOPInstanceUID` are both absent or empty.
fn is_single_empty_reference_item(items: &[Identifier]) -> bool {
    let [item] = items else { return false };
    let is_empty = |tag: DicomTag| {
        item.get(&tag).map(|v| v.as_str().unwrap_or("").is_empty()).unwrap_or(true)
    };
    is_empty(REFERENCED_SOP_CLASS_UID) && is_empty(REFERENCED_SOP_INSTANCE_UID)
}

/// Remove `ReferencedStudySequence`/`ReferencedPatientSequence` entirely when
/// each holds only the single-empty-item placeholder some SCUs send (spec.md
/// §4.I "fixup worklist queries").
pub fn fixup_worklist_query(query: &mut WorklistQuery) {
    if is_single_empty_reference_item(&query.referenced_study_sequence) {
        query.referenced_study_sequence.clear();
    }
    if is_single_empty_reference_item(&query.referenced_patient_sequence) {
        query.referenced_patient_sequence.clear();
    }
}

/// Bookkeeping shared by C-MOVE/C-GET: `sub_op_count` sub-operations are
/// driven to completion one `advance()` at a time (spec.md §4.I).
pub struct MoveState {
    iterator: Box<dyn MoveRequestIterator>,
    sub_op_count: usize,
    response_count: usize,
    failed: usize,
    warning: usize,
    pub originator_message_id: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveCounters {
    pub remaining: usize,
    pub completed: usize,
    pub failed: usize,
    pub warning: usize,
}

impl MoveState {
    pub fn new(iterator: Box<dyn MoveRequestIterator>, originator_message_id: Option<u16>) -> Self {
        let sub_op_count = iterator.len();
        MoveState { iterator, sub_op_count, response_count: 0, failed: 0, warning: 0, originator_message_id }
    }

    /// Drive one sub-operation and report the response that should be sent
    /// for it — counters accumulate per spec.md §4.I; the overall status is
    /// `Pending` until every sub-operation has responded, then `Success`
    /// regardless of how many failed.
    pub fn advance(&mut self) -> (DimseStatus, MoveCounters) {
        match self.iterator.next() {
            Some(Ok(())) => {}
            Some(Err(_)) => self.failed += 1,
            None => {}
        }
        self.response_count += 1;
        let counters = MoveCounters {
            remaining: self.sub_op_count.saturating_sub(self.response_count),
            completed: self.response_count,
            failed: self.failed,
            warning: self.warning,
        };
        let status = if self.response_count >= self.sub_op_count { DimseStatus::Success } else { DimseStatus::Pending };
        (status, counters)
    }
}

/// C-GET sub-operation state, same shape as `MoveState` but sub-operations
/// run on the same association, and the overall status reflects whether any
/// failed (spec.md §4.I "Warning_SubOperationsCompleteOneOrMoreFailures" /
/// "Refused_OutOfResourcesSubOperations").
pub struct GetState {
    sub_op_count: usize,
    response_count: usize,
    failed: usize,
    warning: usize,
    failed_sop_instance_uids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetCounters {
    pub remaining: usize,
    pub completed: usize,
    pub failed: usize,
    pub warning: usize,
}

impl GetState {
    pub fn new(sub_op_count: usize) -> Self {
        GetState { sub_op_count, response_count: 0, failed: 0, warning: 0, failed_sop_instance_uids: Vec::new() }
    }

    /// Record the result of one `do_next` step and compute the response
    /// status. On the final step the status splits between all-failed and
    /// some-failed per spec.md §4.I.
    pub fn record(&mut self, step: GetStepStatus, sop_instance_uid: Option<&str>) -> (DimseStatus, GetCounters) {
        match step {
            GetStepStatus::Success => {}
            GetStepStatus::Failure => {
                self.failed += 1;
                if let Some(uid) = sop_instance_uid {
                    self.failed_sop_instance_uids.push(uid.to_string());
                }
            }
            GetStepStatus::Pending => {}
        }
        self.response_count += 1;
        let counters = GetCounters {
            remaining: self.sub_op_count.saturating_sub(self.response_count),
            completed: self.response_count,
            failed: self.failed,
            warning: self.warning,
        };

        let status = if self.response_count < self.sub_op_count {
            DimseStatus::Pending
        } else if self.failed == 0 {
            DimseStatus::Success
        } else if self.failed == self.sub_op_count {
            DimseStatus::RefusedOutOfResourcesSubOperations
        } else {
            DimseStatus::WarningSubOperationsCompleteOneOrMoreFailures
        };
        (status, counters)
    }

    pub fn failed_sop_instance_uids(&self) -> &[String] {
        &self.failed_sop_instance_uids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orthanc_core::OrthancError;
    use orthanc_core::TagValue;

    struct ScriptedIterator {
        results: std::vec::IntoIter<bool>,
        len: usize,
    }

    impl MoveRequestIterator for ScriptedIterator {
        fn len(&self) -> usize {
            self.len
        }

        fn next(&mut self) -> Option<Result<(), OrthancError>> {
            self.results.next().map(|ok| {
                if ok {
                    Ok(())
                } else {
                    Err(OrthancError::InternalError("sub-operation failed".into()))
                }
            })
        }
    }

    /// spec.md scenario 5, literally: sub_op_count=3, do_next results
    /// Success, Warning, Failure in order.
    #[test]
    fn cmove_counters_match_scenario_five() {
        let iterator = ScriptedIterator { results: vec![true, true, false].into_iter(), len: 3 };
        let mut state = MoveState::new(Box::new(iterator), None);

        let (status1, c1) = state.advance();
        assert_eq!((c1.remaining, c1.completed, c1.failed, c1.warning, status1), (2, 1, 0, 0, DimseStatus::Pending));

        state.warning = 1;
        let (status2, c2) = state.advance();
        assert_eq!((c2.remaining, c2.completed, c2.failed, c2.warning, status2), (1, 2, 0, 1, DimseStatus::Pending));

        let (status3, c3) = state.advance();
        assert_eq!((c3.remaining, c3.completed, c3.failed, c3.warning, status3), (0, 3, 1, 1, DimseStatus::Success));
    }

    #[test]
    fn cget_all_failed_maps_to_refused_out_of_resources_sub_operations() {
        let mut state = GetState::new(2);
        let (s1, _) = state.record(GetStepStatus::Failure, Some("1.2.3"));
        assert_eq!(s1, DimseStatus::Pending);
        let (s2, _) = state.record(GetStepStatus::Failure, Some("1.2.4"));
        assert_eq!(s2, DimseStatus::RefusedOutOfResourcesSubOperations);
        assert_eq!(state.failed_sop_instance_uids(), &["1.2.3", "1.2.4"]);
    }

    #[test]
    fn cget_partial_failure_maps_to_warning() {
        let mut state = GetState::new(2);
        state.record(GetStepStatus::Success, None);
        let (status, _) = state.record(GetStepStatus::Failure, Some("1.2.3"));
        assert_eq!(status, DimseStatus::WarningSubOperationsCompleteOneOrMoreFailures);
    }

    #[test]
    fn worklist_fixup_clears_single_empty_reference_item() {
        let mut empty_item = Identifier::new();
        empty_item.insert(REFERENCED_SOP_CLASS_UID, TagValue::String(String::new()));
        empty_item.insert(REFERENCED_SOP_INSTANCE_UID, TagValue::Null);

        let mut query = WorklistQuery {
            identifier: Identifier::new(),
            referenced_study_sequence: vec![empty_item.clone()],
            referenced_patient_sequence: vec![empty_item],
        };
        fixup_worklist_query(&mut query);
        assert!(query.referenced_study_sequence.is_empty());
        assert!(query.referenced_patient_sequence.is_empty());
    }

    #[test]
    fn worklist_fixup_preserves_populated_reference_item() {
        let mut item = Identifier::new();
        item.insert(REFERENCED_SOP_CLASS_UID, TagValue::String("1.2.840.10008.5.1.4.1.1.7".into()));
        item.insert(REFERENCED_SOP_INSTANCE_UID, TagValue::String("1.2.3.4".into()));

        let mut query = WorklistQuery {
            identifier: Identifier::new(),
            referenced_study_sequence: vec![item],
            referenced_patient_sequence: vec![],
        };
        fixup_worklist_query(&mut query);
        assert_eq!(query.referenced_study_sequence.len(), 1);
    }

    #[test]
    fn find_state_emits_pending_then_success() {
        let mut answers = AnswerSet::default();
        answers.push(Identifier::new());
        let mut state = FindState::new(answers);
        assert_eq!(state.next().0, DimseStatus::Pending);
        assert_eq!(state.next().0, DimseStatus::Success);
    }

    #[test]
    fn find_state_reports_cancel_when_incomplete() {
        let mut answers = AnswerSet::default();
        answers.incomplete = true;
        let state_result = FindState::new(answers).next();
        assert_eq!(state_result.0, DimseStatus::CancelMatchingTerminatedDueToCancelRequest);
    }
}
