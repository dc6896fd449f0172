//! Requester side of the DIMSE services.
//!
//! Every operation opens its own association to the target, runs one exchange and releases it.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::ae_context::{AeContext, Role, Target};
use crate::ae_title::AeTitle;
use crate::association::{Association, AssociationState, ResponseStream};
use crate::command::{CommandField, CommandSet};
use crate::dataset::{Dataset, QueryLevel, SopReference};
use crate::error::DimseError;
use crate::message::{
    DimseMessage, RetrieveOutcome, echo_rq, find_rq, get_rq, move_rq, n_action_rq, response_to,
};
use crate::negotiation::Proposal;
use crate::services::{StorePersister, receive_store, send_store};
use crate::status::Status;
use crate::uids;

/// Options of a C-FIND.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    /// Stop after this many matches, cancelling the rest of the query.
    pub limit: Option<usize>,
}

/// Options of a C-MOVE or C-GET.
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    /// Once cancelled, C-CANCEL-RQ is sent and the SCP's final response is still awaited.
    pub cancel: CancellationToken,
}

/// A storage commitment request accepted or refused by the SCP. The outcome itself arrives
/// later, through a [crate::services::CommitmentReportService].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentRequest {
    pub transaction_uid: String,
    pub status: Status,
}

impl CommitmentRequest {
    pub fn is_accepted(&self) -> bool {
        self.status.is_good()
    }
}

impl RetrieveOutcome {
    /// Turn partial or total failure into an error.
    pub fn into_result(self) -> Result<Self, DimseError> {
        if self.status.is_success() {
            Ok(self)
        } else if self.counts.failed > 0 || self.counts.warning > 0 {
            Err(DimseError::SubOperationFailure {
                counts: self.counts,
            })
        } else {
            Err(DimseError::ServiceStatus { code: self.status })
        }
    }
}

/// A new UID for a storage commitment transaction, under the UUID-derived `2.25` root.
pub fn new_transaction_uid() -> String {
    format!("2.25.{}", u128::from(Ulid::new()))
}

/// Service class user: runs DIMSE operations against remote application entities.
#[derive(Clone)]
pub struct Scu {
    ae: Arc<AeContext>,
}

impl Scu {
    pub fn new(ae: Arc<AeContext>) -> Self {
        Self { ae }
    }

    pub fn ae(&self) -> &AeContext {
        &self.ae
    }

    async fn exchange(
        &self,
        association: Association,
        pc_id: u8,
        command: CommandSet,
        data: Option<Bytes>,
    ) -> Result<DimseMessage, DimseError> {
        let outcome = match association.context(pc_id).cloned() {
            Some(pc) => match association.send_request(&pc, command, data).await {
                Ok(responses) => responses.final_response().await,
                Err(e) => Err(e),
            },
            None => Err(DimseError::UnsupportedPresentationContext {
                abstract_syntax: command.sop_class_uid().unwrap_or_default().to_string(),
            }),
        };
        finish(association, outcome).await
    }

    /// C-ECHO.
    pub async fn echo(&self, target: &Target) -> Result<Status, DimseError> {
        let association = Association::open(&self.ae, target, [uids::VERIFICATION]).await?;
        let pc = association.context_for(uids::VERIFICATION, Role::Scu)?.id;
        let response = self.exchange(association, pc, echo_rq(), None).await?;
        Ok(response.status())
    }

    /// C-STORE of one instance.
    pub async fn store<D: Dataset>(
        &self,
        target: &Target,
        dataset: &D,
    ) -> Result<Status, DimseError> {
        let statuses = self.store_all(target, std::slice::from_ref(dataset)).await?;
        Ok(statuses.first().copied().unwrap_or(Status::PROCESSING_FAILURE))
    }

    /// C-STORE of many instances over a single association, one status per instance.
    pub async fn store_all<D: Dataset>(
        &self,
        target: &Target,
        datasets: &[D],
    ) -> Result<Vec<Status>, DimseError> {
        let sop_classes = datasets
            .iter()
            .map(|d| d.sop_class_uid())
            .collect::<Result<BTreeSet<String>, _>>()?;
        let proposals = sop_classes.into_iter().map(Proposal::scu);
        let association = Association::open(&self.ae, target, proposals).await?;
        let mut statuses = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            match send_store(&association, dataset, None).await {
                Ok(status) => statuses.push(status),
                Err(e) if e.is_protocol_error() => return finish(association, Err(e)).await,
                Err(e) => {
                    tracing::warn!(error = %e, "could not send instance");
                    statuses.push(Status::PROCESSING_FAILURE)
                }
            }
        }
        finish(association, Ok(statuses)).await
    }

    /// C-FIND using the information model `model`. Matches are read from the returned
    /// [FindResults] as the SCP sends them.
    pub async fn find<D: Dataset>(
        &self,
        target: &Target,
        model: &str,
        level: QueryLevel,
        mut keys: D,
        options: FindOptions,
    ) -> Result<FindResults<D>, DimseError> {
        keys.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.as_str());
        let association = Association::open(&self.ae, target, [model]).await?;
        let pc = association.context_for(model, Role::Scu)?.clone();
        let sent = match keys.encode(&pc.transfer_syntax) {
            Ok(data) => {
                let data = Some(Bytes::from(data));
                association.send_request(&pc, find_rq(model), data).await
            }
            Err(e) => Err(e.into()),
        };
        let responses = match sent {
            Ok(responses) => responses,
            Err(e) => return finish(association, Err(e)).await,
        };
        Ok(FindResults {
            association: Some(association),
            responses,
            presentation_context_id: pc.id,
            transfer_syntax: pc.transfer_syntax,
            limit: options.limit,
            received: 0,
            cancelled: false,
            status: None,
            _dataset: PhantomData,
        })
    }

    /// C-MOVE of the instances matching `keys` to `destination`.
    pub async fn move_instances<D: Dataset>(
        &self,
        target: &Target,
        model: &str,
        destination: &AeTitle,
        level: QueryLevel,
        mut keys: D,
        options: RetrieveOptions,
    ) -> Result<RetrieveOutcome, DimseError> {
        keys.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.as_str());
        let association = Association::open(&self.ae, target, [model]).await?;
        let pc = association.context_for(model, Role::Scu)?.clone();
        let outcome = async {
            let data = keys.encode(&pc.transfer_syntax)?;
            let command = move_rq(model, destination.as_str());
            let mut responses = association
                .send_request(&pc, command, Some(Bytes::from(data)))
                .await?;
            let message_id = responses.message_id();
            let mut cancel_sent = false;
            loop {
                let response = tokio::select! {
                    response = responses.next() => response,
                    _ = options.cancel.cancelled(), if !cancel_sent => {
                        cancel_sent = true;
                        association.send_cancel(pc.id, message_id).await?;
                        continue;
                    }
                };
                match response {
                    Some(Ok(response)) if response.status().is_pending() => {
                        tracing::debug!(counts = %response.sub_operations(), "C-MOVE progress");
                    }
                    Some(Ok(response)) => return Ok(retrieve_outcome(&response)),
                    Some(Err(e)) => return Err(e),
                    None => {
                        let reason = "C-MOVE ended without final response".to_string();
                        return Err(DimseError::Aborted(reason));
                    }
                }
            }
        }
        .await;
        finish(association, outcome).await
    }

    /// C-GET of the instances matching `keys`. The SCP sends them back on the same
    /// association and each one is handed to `persister`.
    ///
    /// Storage SOP classes proposed for the return trip are the ones this AE has an SCP
    /// capability for.
    pub async fn get_instances<D: Dataset>(
        &self,
        target: &Target,
        model: &str,
        level: QueryLevel,
        mut keys: D,
        persister: &dyn StorePersister<D>,
        options: RetrieveOptions,
    ) -> Result<RetrieveOutcome, DimseError> {
        keys.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.as_str());
        let mut proposals = vec![Proposal::scu(model)];
        let mut storage_classes: Vec<&str> = Vec::new();
        for capability in self.ae.capabilities() {
            let uid = capability.abstract_syntax.as_str();
            if capability.role == Role::Scp && uid != model && !storage_classes.contains(&uid) {
                storage_classes.push(uid);
            }
        }
        proposals.extend(storage_classes.into_iter().take(127).map(Proposal::scu_scp));

        let mut association = Association::open(&self.ae, target, proposals).await?;
        let pc = association.context_for(model, Role::Scu)?.clone();
        let mut responses = match keys.encode(&pc.transfer_syntax) {
            Ok(data) => {
                match association
                    .send_request(&pc, get_rq(model), Some(Bytes::from(data)))
                    .await
                {
                    Ok(responses) => responses,
                    Err(e) => return finish(association, Err(e)).await,
                }
            }
            Err(e) => return finish(association, Err(e.into())).await,
        };
        let message_id = responses.message_id();
        let mut cancel_sent = false;
        let outcome = loop {
            tokio::select! {
                response = responses.next() => match response {
                    Some(Ok(response)) if response.status().is_pending() => {
                        tracing::debug!(counts = %response.sub_operations(), "C-GET progress");
                    }
                    Some(Ok(response)) => break Ok(retrieve_outcome(&response)),
                    Some(Err(e)) => break Err(e),
                    None => {
                        let reason = "C-GET ended without final response".to_string();
                        break Err(DimseError::Aborted(reason));
                    }
                },
                request = association.next_request() => {
                    let Some(request) = request else {
                        let reason = "association closed during C-GET".to_string();
                        break Err(DimseError::Aborted(reason));
                    };
                    let (pc_id, response) =
                        match get_sub_operation_response(&association, &request, persister).await {
                            Ok(response) => response,
                            Err(e) => break Err(e),
                        };
                    // the SCP sees the cancellation before it may start the next sub-operation
                    if options.cancel.is_cancelled() && !cancel_sent {
                        cancel_sent = true;
                        if let Err(e) = association.send_cancel(pc.id, message_id).await {
                            break Err(e);
                        }
                    }
                    if let Err(e) = association.send_response(pc_id, response, None).await {
                        break Err(e);
                    }
                },
                _ = options.cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    if let Err(e) = association.send_cancel(pc.id, message_id).await {
                        break Err(e);
                    }
                },
            }
        };
        drop(responses);
        finish(association, outcome).await
    }

    /// Ask the storage commitment SCP at `target` to commit `references`.
    pub async fn request_commitment(
        &self,
        target: &Target,
        references: &[SopReference],
    ) -> Result<CommitmentRequest, DimseError> {
        let transaction_uid = new_transaction_uid();
        let mut action = InMemDicomObject::new_empty();
        Dataset::put_str(&mut action, tags::TRANSACTION_UID, VR::UI, &transaction_uid);
        action.put_references(tags::REFERENCED_SOP_SEQUENCE, references);

        let association =
            Association::open(&self.ae, target, [uids::STORAGE_COMMITMENT_PUSH_MODEL]).await?;
        let pc = association
            .context_for(uids::STORAGE_COMMITMENT_PUSH_MODEL, Role::Scu)?
            .clone();
        let data = match action.encode(&pc.transfer_syntax) {
            Ok(data) => Bytes::from(data),
            Err(e) => return finish(association, Err(e.into())).await,
        };
        let command = n_action_rq(
            uids::STORAGE_COMMITMENT_PUSH_MODEL,
            uids::STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE,
            crate::services::REQUEST_STORAGE_COMMITMENT,
        );
        let response = self.exchange(association, pc.id, command, Some(data)).await?;
        tracing::info!(
            aet = target.ae_title.as_str(),
            %transaction_uid,
            references = references.len(),
            status = %response.status(),
            "storage commitment requested"
        );
        Ok(CommitmentRequest {
            transaction_uid,
            status: response.status(),
        })
    }
}

fn retrieve_outcome(response: &DimseMessage) -> RetrieveOutcome {
    RetrieveOutcome {
        status: response.status(),
        counts: response.sub_operations(),
    }
}

/// Release the association after a successful exchange, abort it otherwise.
async fn finish<T>(
    association: Association,
    outcome: Result<T, DimseError>,
) -> Result<T, DimseError> {
    match outcome {
        Ok(value) => {
            association.release().await?;
            Ok(value)
        }
        Err(e) => {
            if association.state() == AssociationState::Established {
                association.abort().await;
            }
            Err(e)
        }
    }
}

/// Response to a request the SCP sent on a C-GET association: C-STORE sub-operations are
/// persisted, anything else is refused.
async fn get_sub_operation_response<D: Dataset>(
    association: &Association,
    request: &DimseMessage,
    persister: &dyn StorePersister<D>,
) -> Result<(u8, CommandSet), DimseError> {
    let Some(pc) = association.context(request.presentation_context_id) else {
        return Err(DimseError::MalformedPdu(format!(
            "request on unaccepted presentation context {}",
            request.presentation_context_id
        )));
    };
    let (status, comment) = match request.field() {
        CommandField::CStoreRq if pc.permits(Role::Scp) => {
            let calling = association.peer_ae_title();
            receive_store(persister, request, &pc.transfer_syntax, calling).await
        }
        CommandField::CStoreRq => (Status::SOP_CLASS_NOT_SUPPORTED, None),
        _ => (Status::UNRECOGNIZED_OPERATION, None),
    };
    let mut response = response_to(&request.command, status);
    response.error_comment = comment.as_deref().map(crate::dispatcher::error_comment);
    Ok((pc.id, response))
}

/// Matches of a C-FIND, in the order the SCP sent them.
pub struct FindResults<D> {
    association: Option<Association>,
    responses: ResponseStream,
    presentation_context_id: u8,
    transfer_syntax: String,
    limit: Option<usize>,
    received: usize,
    cancelled: bool,
    status: Option<Status>,
    _dataset: PhantomData<fn() -> D>,
}

impl<D: Dataset> FindResults<D> {
    /// Next match. `None` once the SCP sent its final response.
    ///
    /// A final failure status is yielded as [DimseError::ServiceStatus].
    pub async fn next(&mut self) -> Option<Result<D, DimseError>> {
        loop {
            let response = match self.responses.next().await? {
                Ok(response) => response,
                Err(e) => return Some(self.close(Err(e)).await),
            };
            let status = response.status();
            if status.is_pending() {
                if self.limit.is_some_and(|limit| self.received >= limit) {
                    continue;
                }
                let Some(data) = response.data else {
                    tracing::warn!("pending C-FIND response without identifier");
                    continue;
                };
                self.received += 1;
                if let Err(e) = self.cancel_on_limit().await {
                    return Some(self.close(Err(e)).await);
                }
                return Some(D::decode(&data, &self.transfer_syntax).map_err(DimseError::from));
            }
            self.status = Some(status);
            let outcome = if status.is_failure() {
                Err(DimseError::ServiceStatus { code: status })
            } else {
                Ok(())
            };
            return match self.close(outcome).await {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            };
        }
    }

    async fn cancel_on_limit(&mut self) -> Result<(), DimseError> {
        if self.cancelled || !self.limit.is_some_and(|limit| self.received >= limit) {
            return Ok(());
        }
        self.cancelled = true;
        if let Some(association) = &self.association {
            association
                .send_cancel(self.presentation_context_id, self.responses.message_id())
                .await?;
        }
        Ok(())
    }

    async fn close<T>(&mut self, outcome: Result<T, DimseError>) -> Result<T, DimseError> {
        match self.association.take() {
            Some(association) => finish(association, outcome).await,
            None => outcome,
        }
    }

    /// Final status of the query, once every match was read.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Read every remaining match.
    pub async fn collect(mut self) -> Result<Vec<D>, DimseError> {
        let mut matches = Vec::new();
        while let Some(next) = self.next().await {
            matches.push(next?);
        }
        Ok(matches)
    }
}
