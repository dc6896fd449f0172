use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::ae_context::Role;
use crate::ae_title::AeTitle;
use crate::association::Association;
use crate::dataset::Dataset;
use crate::dispatcher::{ServiceContext, ServiceHandler, error_comment};
use crate::error::{DimseError, PersistError};
use crate::message::{DimseMessage, response_to, store_rq};
use crate::status::Status;

/// An instance received through C-STORE.
#[derive(Debug, Clone)]
pub struct StoreRequest<D> {
    pub dataset: D,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Transfer syntax the dataset was received in.
    pub transfer_syntax: String,
    pub calling_ae_title: AeTitle,
    /// Set when the C-STORE is a sub-operation of a C-MOVE.
    pub move_originator: Option<(String, u16)>,
}

/// Where received instances go.
#[async_trait]
pub trait StorePersister<D: Dataset>: Send + Sync {
    /// Persist an instance, returning its SOP Instance UID.
    async fn persist(&self, request: StoreRequest<D>) -> Result<String, PersistError>;
}

/// C-STORE SCP.
pub struct StorageService<D> {
    persister: Arc<dyn StorePersister<D>>,
}

impl<D: Dataset> StorageService<D> {
    pub fn new(persister: Arc<dyn StorePersister<D>>) -> Self {
        Self { persister }
    }
}

/// Decode and persist the dataset of a C-STORE-RQ, returning the status to answer with.
pub(crate) async fn receive_store<D: Dataset>(
    persister: &dyn StorePersister<D>,
    request: &DimseMessage,
    transfer_syntax: &str,
    calling_ae_title: &AeTitle,
) -> (Status, Option<String>) {
    let command = &request.command;
    let Some(data) = &request.data else {
        return (
            Status::CANNOT_UNDERSTAND,
            Some("C-STORE-RQ without dataset".to_string()),
        );
    };
    let dataset = match D::decode(data, transfer_syntax) {
        Ok(dataset) => dataset,
        Err(e) => return (Status::CANNOT_UNDERSTAND, Some(e.to_string())),
    };
    let sop_class_uid = command.sop_class_uid().unwrap_or_default().to_string();
    let sop_instance_uid = command.sop_instance_uid().unwrap_or_default().to_string();
    if dataset.sop_instance_uid().is_ok_and(|uid| uid != sop_instance_uid) {
        tracing::warn!(
            %sop_instance_uid,
            "SOP Instance UID of the dataset differs from the C-STORE-RQ"
        );
    }
    let move_originator = command
        .move_originator_ae_title
        .clone()
        .zip(command.move_originator_message_id);
    let store = StoreRequest {
        dataset,
        sop_class_uid,
        sop_instance_uid,
        transfer_syntax: transfer_syntax.to_string(),
        calling_ae_title: calling_ae_title.clone(),
        move_originator,
    };
    match persister.persist(store).await {
        Ok(uid) => {
            tracing::info!(aec = calling_ae_title.as_str(), sop_instance_uid = %uid, "stored");
            (Status::SUCCESS, None)
        }
        Err(e) => {
            tracing::error!(
                aec = calling_ae_title.as_str(),
                error = %e,
                "could not persist instance"
            );
            (e.status.unwrap_or(Status::PROCESSING_FAILURE), Some(e.message))
        }
    }
}

#[async_trait]
impl<D: Dataset> ServiceHandler for StorageService<D> {
    async fn handle(
        &self,
        request: DimseMessage,
        cx: ServiceContext<'_>,
    ) -> Result<(), DimseError> {
        let (status, comment) = receive_store(
            self.persister.as_ref(),
            &request,
            cx.transfer_syntax(),
            cx.association.peer_ae_title(),
        )
        .await;
        let mut response = response_to(&request.command, status);
        response.error_comment = comment.as_deref().map(error_comment);
        cx.respond(response, None).await
    }
}

/// Send one instance over an established association and wait for the C-STORE-RSP.
///
/// A failure status of the peer is returned as `Ok`.
pub(crate) async fn send_store<D: Dataset>(
    association: &Association,
    dataset: &D,
    move_originator: Option<(&AeTitle, u16)>,
) -> Result<Status, DimseError> {
    let sop_class_uid = dataset.sop_class_uid()?;
    let sop_instance_uid = dataset.sop_instance_uid()?;
    let pc = association.context_for(&sop_class_uid, Role::Scu)?;
    let data = dataset.encode(&pc.transfer_syntax)?;
    let mut command = store_rq(&sop_class_uid, &sop_instance_uid);
    if let Some((ae_title, message_id)) = move_originator {
        command.move_originator_ae_title = Some(ae_title.to_string());
        command.move_originator_message_id = Some(message_id);
    }
    let response = association
        .send_request(pc, command, Some(Bytes::from(data)))
        .await?
        .final_response()
        .await?;
    let status = response.status();
    if !status.is_good() {
        tracing::warn!(
            association = %association.id(),
            %sop_instance_uid,
            status = %status,
            comment = response.command.error_comment.as_deref(),
            "C-STORE failed"
        );
    }
    Ok(status)
}
