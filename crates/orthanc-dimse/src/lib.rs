pub mod association;
pub mod error;
pub mod handler;
pub mod scp;
pub mod server;
pub mod status;

pub use association::{AssociationLease, ReusableAssociation};
pub use error::DimseError;
pub use handler::{
    AnswerSet, FindRequestHandler, GetRequestHandler, GetStepStatus, Identifier,
    IndexBackedFindHandler, IndexBackedStoreHandler, MoveRequestHandler, MoveRequestIterator,
    StoreRequestHandler, StoreStatus, WorklistRequestHandler,
};
pub use scp::{fixup_worklist_query, FindState, GetCounters, GetState, MoveCounters, MoveState, WorklistQuery};
pub use server::{accept_loop, ScpHandlers};
pub use status::{map_error, DimseStatus};
