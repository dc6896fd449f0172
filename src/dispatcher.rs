//! Routing of incoming DIMSE requests to service handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::ae_context::{AeContext, Role};
use crate::association::Association;
use crate::command::{CommandField, CommandSet};
use crate::error::DimseError;
use crate::message::{DimseMessage, response_to};
use crate::negotiation::PresentationContext;
use crate::status::Status;

/// Everything a handler may use while serving one request.
pub struct ServiceContext<'a> {
    pub association: &'a Association,
    pub presentation_context: &'a PresentationContext,
    /// Cancelled by C-CANCEL-RQ for this request, or when the association closes.
    pub cancellation: CancellationToken,
    pub ae: Arc<AeContext>,
}

impl ServiceContext<'_> {
    pub fn transfer_syntax(&self) -> &str {
        &self.presentation_context.transfer_syntax
    }

    pub async fn respond(
        &self,
        command: CommandSet,
        data: Option<Bytes>,
    ) -> Result<(), DimseError> {
        self.association
            .send_response(self.presentation_context.id, command, data)
            .await
    }
}

/// Serves one kind of DIMSE request for one SOP class.
///
/// A handler sends its responses through [ServiceContext::respond]. It returns an error only
/// when it could not send a final response: the dispatcher then answers on its behalf with a
/// failure status, unless the association itself is broken.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, request: DimseMessage, cx: ServiceContext<'_>) -> Result<(), DimseError>;
}

/// Handlers keyed by SOP class UID and command.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    handlers: HashMap<(String, CommandField), Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        sop_class_uid: impl Into<String>,
        command: CommandField,
        handler: Arc<dyn ServiceHandler>,
    ) {
        self.handlers
            .insert((sop_class_uid.into(), command), handler);
    }

    pub fn with<S: AsRef<str>>(
        mut self,
        sop_class_uids: impl IntoIterator<Item = S>,
        command: CommandField,
        handler: Arc<dyn ServiceHandler>,
    ) -> Self {
        for uid in sop_class_uids {
            self.register(uid.as_ref(), command, Arc::clone(&handler));
        }
        self
    }

    pub fn handler(
        &self,
        sop_class_uid: &str,
        command: CommandField,
    ) -> Option<&Arc<dyn ServiceHandler>> {
        self.handlers.get(&(sop_class_uid.to_string(), command))
    }

    /// Serve requests of the peer until it releases or aborts the association.
    pub async fn serve(
        &self,
        mut association: Association,
        ae: Arc<AeContext>,
    ) -> Result<(), DimseError> {
        while let Some(request) = association.next_request().await {
            self.dispatch(&association, &ae, request).await?;
        }
        match association.state() {
            crate::association::AssociationState::Closed => Ok(()),
            state => Err(DimseError::Aborted(format!(
                "stopped receiving requests while association is {state}"
            ))),
        }
    }

    async fn dispatch(
        &self,
        association: &Association,
        ae: &Arc<AeContext>,
        request: DimseMessage,
    ) -> Result<(), DimseError> {
        let field = request.field();
        let Some(pc) = association.context(request.presentation_context_id) else {
            return Err(DimseError::MalformedPdu(format!(
                "request on unaccepted presentation context {}",
                request.presentation_context_id
            )));
        };
        let sop_class_uid = request
            .command
            .sop_class_uid()
            .unwrap_or(&pc.abstract_syntax)
            .to_string();

        let required_role = match field {
            CommandField::NEventReportRq => Role::Scu,
            _ => Role::Scp,
        };
        if !pc.permits(required_role) {
            tracing::warn!(
                association = %association.id(),
                command = %field,
                %sop_class_uid,
                "request received on a presentation context where we are not {required_role:?}"
            );
            return refuse(association, pc, &request.command, Status::SOP_CLASS_NOT_SUPPORTED).await;
        }
        let Some(handler) = self.handler(&sop_class_uid, field) else {
            tracing::info!(
                association = %association.id(),
                command = %field,
                %sop_class_uid,
                "no service registered"
            );
            return refuse(association, pc, &request.command, Status::UNRECOGNIZED_OPERATION).await;
        };

        let message_id = request.command.message_id.unwrap_or_default();
        let command = request.command.clone();
        let cx = ServiceContext {
            association,
            presentation_context: pc,
            cancellation: association.cancellation(message_id),
            ae: Arc::clone(ae),
        };
        match handler.handle(request, cx).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_protocol_error() => Err(e),
            Err(e) => {
                let status = match &e {
                    DimseError::ServiceStatus { code } => *code,
                    DimseError::Dataset(_) => Status::CANNOT_UNDERSTAND,
                    _ => Status::PROCESSING_FAILURE,
                };
                tracing::warn!(
                    association = %association.id(),
                    command = %field,
                    error = %e,
                    "service failed"
                );
                let mut response = response_to(&command, status);
                response.error_comment = Some(error_comment(&e.to_string()));
                association.send_response(pc.id, response, None).await
            }
        }
    }
}

async fn refuse(
    association: &Association,
    pc: &PresentationContext,
    request: &CommandSet,
    status: Status,
) -> Result<(), DimseError> {
    if !request.command_field.is_response() && request.command_field != CommandField::CCancelRq {
        association
            .send_response(pc.id, response_to(request, status), None)
            .await?;
    }
    Ok(())
}

/// (0000,0902) Error Comment is LO: at most 64 characters.
pub(crate) fn error_comment(message: &str) -> String {
    message.chars().take(64).collect()
}
