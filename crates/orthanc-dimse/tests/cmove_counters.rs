use orthanc_core::OrthancError;
use orthanc_dimse::{DimseStatus, MoveRequestIterator, MoveState};

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

/// End-to-end C-MOVE counters as a C-MOVE-SCP would observe them across a
/// three sub-operation retrieve: two succeed, one fails, and the overall
/// status stays Pending until every sub-operation has responded.
#[test]
fn three_suboperation_move_reports_success_once_all_have_responded() {
    let iterator = ScriptedIterator { results: vec![true, true, false].into_iter(), len: 3 };
    let mut state = MoveState::new(Box::new(iterator), Some(7));

    let (status1, c1) = state.advance();
    assert_eq!(status1, DimseStatus::Pending);
    assert_eq!((c1.remaining, c1.completed, c1.failed), (2, 1, 0));

    let (status2, c2) = state.advance();
    assert_eq!(status2, DimseStatus::Pending);
    assert_eq!((c2.remaining, c2.completed, c2.failed), (1, 2, 0));

    let (status3, c3) = state.advance();
    assert_eq!(status3, DimseStatus::Success);
    assert_eq!((c3.remaining, c3.completed, c3.failed), (0, 3, 1));
}

#[test]
fn empty_move_reports_success_immediately() {
    let iterator = ScriptedIterator { results: Vec::new().into_iter(), len: 0 };
    let mut state = MoveState::new(Box::new(iterator), None);
    let (status, counters) = state.advance();
    assert_eq!(status, DimseStatus::Success);
    assert_eq!(counters.completed, 1);
}
