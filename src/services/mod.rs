//! DIMSE service handlers for the acceptor side, and the collaborator traits they call.

use std::sync::Arc;

use crate::command::CommandField;
use crate::dataset::Dataset;
use crate::dispatcher::ServiceRegistry;
use crate::uids;

mod commitment;
mod find;
mod retrieve;
mod storage;
mod verification;

pub use commitment::{
    COMMITMENT_FAILURES_EXIST, COMMITMENT_SUCCESSFUL, CommitProcessor, CommitmentListener,
    CommitmentReportService, CommitmentResult, CommitmentService, REQUEST_STORAGE_COMMITMENT,
};
pub use find::{FindService, QuerySource};
pub use retrieve::{GetService, MoveService};
pub use storage::{StorePersister, StoreRequest, StorageService};
pub use verification::VerificationService;

pub(crate) use storage::{receive_store, send_store};

/// Registry serving Verification, Storage, Query/Retrieve and Storage Commitment from a single
/// store of instances.
pub fn standard_registry<D, S>(store: Arc<S>) -> ServiceRegistry
where
    D: Dataset,
    S: StorePersister<D> + QuerySource<D> + CommitProcessor + 'static,
{
    ServiceRegistry::new()
        .with([uids::VERIFICATION], CommandField::CEchoRq, Arc::new(VerificationService))
        .with(
            uids::STORAGE_SOP_CLASSES,
            CommandField::CStoreRq,
            Arc::new(StorageService::<D>::new(store.clone())),
        )
        .with(
            uids::QR_FIND_MODELS,
            CommandField::CFindRq,
            Arc::new(FindService::<D>::new(store.clone())),
        )
        .with(
            uids::QR_MOVE_MODELS,
            CommandField::CMoveRq,
            Arc::new(MoveService::<D>::new(store.clone())),
        )
        .with(
            uids::QR_GET_MODELS,
            CommandField::CGetRq,
            Arc::new(GetService::<D>::new(store.clone())),
        )
        .with(
            [uids::STORAGE_COMMITMENT_PUSH_MODEL],
            CommandField::NActionRq,
            Arc::new(CommitmentService::<D>::new(store)),
        )
}
