//! C-MOVE and C-GET: a query followed by one C-STORE sub-operation per matching instance.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use futures::TryStreamExt;

use crate::ae_title::AeTitle;
use crate::association::Association;
use crate::dataset::Dataset;
use crate::dispatcher::{ServiceContext, ServiceHandler, error_comment};
use crate::error::DimseError;
use crate::message::{DimseMessage, SubOperationCounts, retrieve_response};
use crate::negotiation::Proposal;
use crate::status::Status;

use super::find::{QuerySource, query_keys};
use super::storage::send_store;

/// C-MOVE SCP. Instances are sent over a new association to the move destination, which must
/// be one of the peers of the [crate::AeContext].
pub struct MoveService<D> {
    source: Arc<dyn QuerySource<D>>,
}

impl<D: Dataset> MoveService<D> {
    pub fn new(source: Arc<dyn QuerySource<D>>) -> Self {
        Self { source }
    }
}

/// C-GET SCP. Instances are sent back on the requesting association, on presentation contexts
/// where the requester accepted the SCP role.
pub struct GetService<D> {
    source: Arc<dyn QuerySource<D>>,
}

impl<D: Dataset> GetService<D> {
    pub fn new(source: Arc<dyn QuerySource<D>>) -> Self {
        Self { source }
    }
}

async fn respond_failure(
    cx: &ServiceContext<'_>,
    request: &DimseMessage,
    status: Status,
    comment: &str,
) -> Result<(), DimseError> {
    let mut response = retrieve_response(&request.command, status, &SubOperationCounts::default());
    response.error_comment = Some(error_comment(comment));
    cx.respond(response, None).await
}

/// Run the query of a retrieve request. `None` means a failure response was already sent.
async fn resolve<D: Dataset>(
    source: &dyn QuerySource<D>,
    request: &DimseMessage,
    cx: &ServiceContext<'_>,
) -> Result<Option<Vec<D>>, DimseError> {
    let (keys, level) = match query_keys::<D>(request, cx.transfer_syntax()) {
        Ok(query) => query,
        Err((status, comment)) => {
            respond_failure(cx, request, status, &comment).await?;
            return Ok(None);
        }
    };
    match source.instances(&keys, level).try_collect::<Vec<D>>().await {
        Ok(instances) => {
            tracing::info!(
                association = %cx.association.id(),
                command = %request.field(),
                %level,
                instances = instances.len(),
                "resolved retrieve"
            );
            Ok(Some(instances))
        }
        Err(e) => {
            let status = e.status.unwrap_or(Status::CANNOT_UNDERSTAND);
            respond_failure(cx, request, status, &e.message).await?;
            Ok(None)
        }
    }
}

/// Send every instance through `sink`, reporting progress on the request's exchange.
async fn run_sub_operations<D: Dataset>(
    request: &DimseMessage,
    cx: &ServiceContext<'_>,
    instances: &[D],
    sink: Option<&Association>,
    move_originator: Option<(&AeTitle, u16)>,
) -> Result<(), DimseError> {
    let on_requesting_association = sink.is_none();
    let sink = sink.unwrap_or(cx.association);
    let mut counts = SubOperationCounts::new(instances.len());
    let mut failed_uids = Vec::new();
    for instance in instances {
        if cx.cancellation.is_cancelled() {
            tracing::info!(association = %cx.association.id(), %counts, "retrieve cancelled");
            let mut response = retrieve_response(&request.command, Status::CANCEL, &counts);
            response.remaining_sub_operations = Some(counts.remaining);
            return cx.respond(response, None).await;
        }
        let status = match send_store(sink, instance, move_originator).await {
            Ok(status) => status,
            Err(e) if e.is_protocol_error() && on_requesting_association => return Err(e),
            Err(e) => {
                tracing::warn!(
                    association = %sink.id(),
                    error = %e,
                    "C-STORE sub-operation failed"
                );
                Status::PROCESSING_FAILURE
            }
        };
        counts.record(status);
        if !status.is_good() {
            failed_uids.push(instance.sop_instance_uid().unwrap_or_default());
        }
        cx.respond(
            retrieve_response(&request.command, Status::PENDING, &counts),
            None,
        )
        .await?;
    }
    let status = counts.final_status();
    tracing::info!(association = %cx.association.id(), %counts, %status, "retrieve done");
    let mut response = retrieve_response(&request.command, status, &counts);
    let data = if failed_uids.is_empty() {
        None
    } else {
        let mut identifier = D::new_empty();
        identifier.put_str(
            tags::FAILED_SOP_INSTANCE_UID_LIST,
            VR::UI,
            &failed_uids.join("\\"),
        );
        response.has_dataset = true;
        Some(Bytes::from(identifier.encode(cx.transfer_syntax())?))
    };
    cx.respond(response, data).await
}

#[async_trait]
impl<D: Dataset> ServiceHandler for MoveService<D> {
    async fn handle(
        &self,
        request: DimseMessage,
        cx: ServiceContext<'_>,
    ) -> Result<(), DimseError> {
        let destination = request
            .command
            .move_destination
            .as_deref()
            .unwrap_or_default()
            .trim();
        let Some(target) = cx.ae.peer(destination) else {
            tracing::warn!(
                association = %cx.association.id(),
                destination,
                "unknown move destination"
            );
            let comment = format!("unknown move destination {destination:?}");
            return respond_failure(&cx, &request, Status::MOVE_DESTINATION_UNKNOWN, &comment).await;
        };
        let Some(instances) = resolve(self.source.as_ref(), &request, &cx).await? else {
            return Ok(());
        };
        if instances.is_empty() {
            let counts = SubOperationCounts::default();
            let response = retrieve_response(&request.command, Status::SUCCESS, &counts);
            return cx.respond(response, None).await;
        }

        let sop_classes: BTreeSet<String> = instances
            .iter()
            .filter_map(|instance| instance.sop_class_uid().ok())
            .collect();
        let proposals = sop_classes.into_iter().map(Proposal::scu);
        let originator = (
            cx.association.peer_ae_title(),
            request.command.message_id.unwrap_or_default(),
        );
        match Association::open(&cx.ae, &target, proposals).await {
            Ok(store_scp) => {
                let sink = Some(&store_scp);
                let outcome =
                    run_sub_operations(&request, &cx, &instances, sink, Some(originator)).await;
                if let Err(e) = store_scp.release().await {
                    tracing::warn!(
                        aet = target.ae_title.as_str(),
                        error = %e,
                        "could not release move destination"
                    );
                }
                outcome
            }
            Err(e) => {
                tracing::error!(
                    aet = target.ae_title.as_str(),
                    error = %e,
                    "could not reach move destination"
                );
                let mut counts = SubOperationCounts::new(instances.len());
                for _ in &instances {
                    counts.record(Status::PROCESSING_FAILURE);
                }
                let status = counts.final_status();
                let mut response = retrieve_response(&request.command, status, &counts);
                response.error_comment = Some(error_comment(&e.to_string()));
                cx.respond(response, None).await
            }
        }
    }
}

#[async_trait]
impl<D: Dataset> ServiceHandler for GetService<D> {
    async fn handle(
        &self,
        request: DimseMessage,
        cx: ServiceContext<'_>,
    ) -> Result<(), DimseError> {
        let Some(instances) = resolve(self.source.as_ref(), &request, &cx).await? else {
            return Ok(());
        };
        run_sub_operations(&request, &cx, &instances, None, None).await
    }
}
