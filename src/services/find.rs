use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::dataset::{Dataset, QueryLevel};
use crate::dispatcher::{ServiceContext, ServiceHandler, error_comment};
use crate::error::{DimseError, QueryError};
use crate::message::{DimseMessage, response_to};
use crate::status::Status;

/// Source of query matches for C-FIND, C-MOVE and C-GET.
///
/// Both methods return lazy streams: the services pull one match at a time, so a cancelled
/// query stops pulling.
pub trait QuerySource<D: Dataset>: Send + Sync {
    /// Response identifiers matching the query `keys` at `level`.
    fn find(&self, keys: &D, level: QueryLevel) -> BoxStream<'static, Result<D, QueryError>>;

    /// Complete instances matching the query `keys` at `level`.
    fn instances(&self, keys: &D, level: QueryLevel) -> BoxStream<'static, Result<D, QueryError>>;
}

/// C-FIND SCP: one pending response per match, in the order of the [QuerySource].
pub struct FindService<D> {
    source: Arc<dyn QuerySource<D>>,
}

impl<D: Dataset> FindService<D> {
    pub fn new(source: Arc<dyn QuerySource<D>>) -> Self {
        Self { source }
    }
}

/// Decode the identifier of a query request and read its level.
pub(crate) fn query_keys<D: Dataset>(
    request: &DimseMessage,
    transfer_syntax: &str,
) -> Result<(D, QueryLevel), (Status, String)> {
    let data = request.data.as_ref().ok_or((
        Status::CANNOT_UNDERSTAND,
        "query without identifier".to_string(),
    ))?;
    let keys = D::decode(data, transfer_syntax)
        .map_err(|e| (Status::CANNOT_UNDERSTAND, e.to_string()))?;
    let level = QueryLevel::of(&keys)
        .map_err(|e| (Status::IDENTIFIER_DOES_NOT_MATCH, e.to_string()))?;
    Ok((keys, level))
}

#[async_trait]
impl<D: Dataset> ServiceHandler for FindService<D> {
    async fn handle(
        &self,
        request: DimseMessage,
        cx: ServiceContext<'_>,
    ) -> Result<(), DimseError> {
        let (keys, level) = match query_keys::<D>(&request, cx.transfer_syntax()) {
            Ok(query) => query,
            Err((status, comment)) => {
                let mut response = response_to(&request.command, status);
                response.error_comment = Some(error_comment(&comment));
                return cx.respond(response, None).await;
            }
        };
        tracing::info!(association = %cx.association.id(), %level, "C-FIND");
        let mut matches = self.source.find(&keys, level);
        let mut count = 0usize;
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cx.cancellation.cancelled() => break Ok(Status::CANCEL),
                next = matches.next() => next,
            };
            match next {
                None => break Ok(Status::SUCCESS),
                Some(Err(e)) => break Err(e),
                Some(Ok(identifier)) => {
                    let data = identifier.encode(cx.transfer_syntax())?;
                    let mut response = response_to(&request.command, Status::PENDING);
                    response.has_dataset = true;
                    cx.respond(response, Some(Bytes::from(data))).await?;
                    count += 1;
                }
            }
        };
        let response = match outcome {
            Ok(status) => {
                tracing::info!(
                    association = %cx.association.id(),
                    matches = count,
                    %status,
                    "C-FIND done"
                );
                response_to(&request.command, status)
            }
            Err(e) => {
                tracing::error!(association = %cx.association.id(), error = %e, "query failed");
                let mut response =
                    response_to(&request.command, e.status.unwrap_or(Status::CANNOT_UNDERSTAND));
                response.error_comment = Some(error_comment(&e.message));
                response
            }
        };
        cx.respond(response, None).await
    }
}
