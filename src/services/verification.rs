use async_trait::async_trait;

use crate::dispatcher::{ServiceContext, ServiceHandler};
use crate::error::DimseError;
use crate::message::{DimseMessage, response_to};
use crate::status::Status;

/// C-ECHO SCP. Always successful.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerificationService;

#[async_trait]
impl ServiceHandler for VerificationService {
    async fn handle(
        &self,
        request: DimseMessage,
        cx: ServiceContext<'_>,
    ) -> Result<(), DimseError> {
        tracing::debug!(association = %cx.association.id(), "C-ECHO");
        cx.respond(response_to(&request.command, Status::SUCCESS), None)
            .await
    }
}
