//! Storage Commitment Push Model.
//!
//! The SCP answers N-ACTION-RQ right away, then reports the outcome later with an
//! N-EVENT-REPORT-RQ sent over a new association to the requester.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dicom::core::VR;
use dicom::dictionary_std::tags;

use crate::ae_context::{AeContext, Role};
use crate::ae_title::AeTitle;
use crate::association::Association;
use crate::dataset::{Dataset, SopReference};
use crate::dispatcher::{ServiceContext, ServiceHandler, error_comment};
use crate::error::DimseError;
use crate::message::{DimseMessage, n_event_report_rq, response_to};
use crate::negotiation::Proposal;
use crate::status::Status;
use crate::uids;

/// Action Type ID of a storage commitment request.
pub const REQUEST_STORAGE_COMMITMENT: u16 = 1;
/// Event Type ID when every instance was committed.
pub const COMMITMENT_SUCCESSFUL: u16 = 1;
/// Event Type ID when some instances could not be committed.
pub const COMMITMENT_FAILURES_EXIST: u16 = 2;

/// Decides which referenced instances are safely stored.
#[async_trait]
pub trait CommitProcessor: Send + Sync {
    /// Returns every reference, with a failure reason set on those which are not committed.
    async fn commit(&self, references: Vec<SopReference>) -> Vec<SopReference>;
}

/// Outcome of a storage commitment request, as reported by the SCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentResult {
    pub transaction_uid: String,
    pub reporter: AeTitle,
    pub committed: Vec<SopReference>,
    pub failed: Vec<SopReference>,
}

impl CommitmentResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Receives storage commitment results.
#[async_trait]
pub trait CommitmentListener: Send + Sync {
    async fn on_result(&self, result: CommitmentResult);
}

#[async_trait]
impl CommitmentListener for tokio::sync::mpsc::UnboundedSender<CommitmentResult> {
    async fn on_result(&self, result: CommitmentResult) {
        if self.send(result).is_err() {
            tracing::warn!("storage commitment result dropped, nobody is listening");
        }
    }
}

/// Storage Commitment SCP, serving N-ACTION-RQ.
pub struct CommitmentService<D> {
    processor: Arc<dyn CommitProcessor>,
    _dataset: std::marker::PhantomData<fn() -> D>,
}

impl<D: Dataset> CommitmentService<D> {
    pub fn new(processor: Arc<dyn CommitProcessor>) -> Self {
        Self {
            processor,
            _dataset: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<D: Dataset> ServiceHandler for CommitmentService<D> {
    async fn handle(
        &self,
        request: DimseMessage,
        cx: ServiceContext<'_>,
    ) -> Result<(), DimseError> {
        if request.command.action_type_id != Some(REQUEST_STORAGE_COMMITMENT) {
            let response = response_to(&request.command, Status::NO_SUCH_ACTION_TYPE);
            return cx.respond(response, None).await;
        }
        let Some(data) = &request.data else {
            let mut response = response_to(&request.command, Status::MISSING_ATTRIBUTE);
            response.error_comment = Some("N-ACTION-RQ without dataset".to_string());
            return cx.respond(response, None).await;
        };
        let action = D::decode(data, cx.transfer_syntax())?;
        let Some(transaction_uid) = action.get_str(tags::TRANSACTION_UID) else {
            let mut response = response_to(&request.command, Status::MISSING_ATTRIBUTE);
            response.error_comment = Some(error_comment("missing Transaction UID"));
            return cx.respond(response, None).await;
        };
        let references = action.references(tags::REFERENCED_SOP_SEQUENCE);
        tracing::info!(
            association = %cx.association.id(),
            aec = cx.association.peer_ae_title().as_str(),
            %transaction_uid,
            references = references.len(),
            "storage commitment requested"
        );
        cx.respond(response_to(&request.command, Status::SUCCESS), None)
            .await?;

        let report = Report {
            ae: Arc::clone(&cx.ae),
            requester: cx.association.peer_ae_title().clone(),
            transaction_uid,
            references,
        };
        let processor = Arc::clone(&self.processor);
        tokio::spawn(async move {
            let transaction_uid = report.transaction_uid.clone();
            if let Err(e) = report.send::<D>(processor.as_ref()).await {
                tracing::error!(
                    %transaction_uid,
                    error = %e,
                    "could not report storage commitment"
                );
            }
        });
        Ok(())
    }
}

struct Report {
    ae: Arc<AeContext>,
    requester: AeTitle,
    transaction_uid: String,
    references: Vec<SopReference>,
}

impl Report {
    async fn send<D: Dataset>(self, processor: &dyn CommitProcessor) -> Result<(), DimseError> {
        let results = processor.commit(self.references).await;
        let (committed, failed): (Vec<_>, Vec<_>) = results
            .into_iter()
            .partition(|r| r.failure_reason.is_none());

        let mut report = D::new_empty();
        report.put_str(tags::TRANSACTION_UID, VR::UI, &self.transaction_uid);
        if !committed.is_empty() {
            report.put_references(tags::REFERENCED_SOP_SEQUENCE, &committed);
        }
        if !failed.is_empty() {
            report.put_references(tags::FAILED_SOP_SEQUENCE, &failed);
        }
        let event_type = if failed.is_empty() {
            COMMITMENT_SUCCESSFUL
        } else {
            COMMITMENT_FAILURES_EXIST
        };

        let target = self.ae.peer(self.requester.as_str()).ok_or_else(|| {
            DimseError::Config(format!(
                "no address known for storage commitment requester {}",
                self.requester
            ))
        })?;
        let association = Association::open(
            &self.ae,
            &target,
            [Proposal::scp(uids::STORAGE_COMMITMENT_PUSH_MODEL)],
        )
        .await?;
        let pc = association.context_for(uids::STORAGE_COMMITMENT_PUSH_MODEL, Role::Scp)?;
        let data = report.encode(&pc.transfer_syntax)?;
        let command = n_event_report_rq(
            uids::STORAGE_COMMITMENT_PUSH_MODEL,
            uids::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
            event_type,
        );
        let response = association
            .send_request(pc, command, Some(Bytes::from(data)))
            .await?
            .final_response()
            .await?;
        association.release().await?;
        tracing::info!(
            aet = target.ae_title.as_str(),
            transaction_uid = %self.transaction_uid,
            committed = committed.len(),
            failed = failed.len(),
            status = %response.status(),
            "storage commitment reported"
        );
        Ok(())
    }
}

/// Storage Commitment SCU side: receives the N-EVENT-REPORT-RQ of a commitment SCP and hands
/// the result over to a [CommitmentListener].
pub struct CommitmentReportService<D> {
    listener: Arc<dyn CommitmentListener>,
    _dataset: std::marker::PhantomData<fn() -> D>,
}

impl<D: Dataset> CommitmentReportService<D> {
    pub fn new(listener: Arc<dyn CommitmentListener>) -> Self {
        Self {
            listener,
            _dataset: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<D: Dataset> ServiceHandler for CommitmentReportService<D> {
    async fn handle(
        &self,
        request: DimseMessage,
        cx: ServiceContext<'_>,
    ) -> Result<(), DimseError> {
        let event_type = request.command.event_type_id.unwrap_or_default();
        if !matches!(event_type, COMMITMENT_SUCCESSFUL | COMMITMENT_FAILURES_EXIST) {
            let response = response_to(&request.command, Status::PROCESSING_FAILURE);
            return cx.respond(response, None).await;
        }
        let Some(data) = &request.data else {
            let response = response_to(&request.command, Status::MISSING_ATTRIBUTE);
            return cx.respond(response, None).await;
        };
        let report = D::decode(data, cx.transfer_syntax())?;
        let Some(transaction_uid) = report.get_str(tags::TRANSACTION_UID) else {
            let response = response_to(&request.command, Status::MISSING_ATTRIBUTE);
            return cx.respond(response, None).await;
        };
        let result = CommitmentResult {
            transaction_uid,
            reporter: cx.association.peer_ae_title().clone(),
            committed: report.references(tags::REFERENCED_SOP_SEQUENCE),
            failed: report.references(tags::FAILED_SOP_SEQUENCE),
        };
        tracing::info!(
            association = %cx.association.id(),
            aec = result.reporter.as_str(),
            transaction_uid = %result.transaction_uid,
            committed = result.committed.len(),
            failed = result.failed.len(),
            "storage commitment result received"
        );
        cx.respond(response_to(&request.command, Status::SUCCESS), None)
            .await?;
        self.listener.on_result(result).await;
        Ok(())
    }
}
