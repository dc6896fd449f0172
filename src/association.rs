//! The association state machine.
//!
//! One task per association owns the read half of the transport: it reassembles incoming
//! messages, routes responses to the exchange waiting for them, hands requests over to
//! whoever serves the association and answers release and abort. Writes from every logical
//! operation go through a single lock so that fragments of different messages never interleave.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::ae_context::{AeContext, Role, Target, Timeouts};
use crate::ae_title::AeTitle;
use crate::command::{CommandField, CommandSet};
use crate::error::DimseError;
use crate::message::{DimseMessage, cancel_rq};
use crate::negotiation::{self, PresentationContext, Proposal};
use crate::pdata::{MessageAssembler, message_pdus};
use crate::pdu::{Abort, AbortSource, AssociateRj, Pdu, PduCodec, RejectReason, abort_reason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Idle,
    Requesting,
    Established,
    Releasing,
    Aborting,
    Closed,
}

impl AssociationState {
    fn name(self) -> &'static str {
        match self {
            AssociationState::Idle => "Idle",
            AssociationState::Requesting => "Requesting",
            AssociationState::Established => "Established",
            AssociationState::Releasing => "Releasing",
            AssociationState::Aborting => "Aborting",
            AssociationState::Closed => "Closed",
        }
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type ResponseSender = mpsc::UnboundedSender<Result<DimseMessage, DimseError>>;

struct Shared {
    id: Ulid,
    local_ae_title: AeTitle,
    peer_ae_title: AeTitle,
    contexts: Vec<PresentationContext>,
    peer_max_pdu_length: u32,
    timeouts: Timeouts,
    state: Mutex<AssociationState>,
    /// Why the association closed, if not by an orderly release.
    terminal: Mutex<Option<String>>,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, PduCodec>>,
    pending: Mutex<HashMap<u16, ResponseSender>>,
    cancellations: Mutex<HashMap<u16, CancellationToken>>,
    release_rp: Mutex<Option<oneshot::Sender<()>>>,
    next_message_id: AtomicU16,
    drained: Notify,
    closed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn state(&self) -> AssociationState {
        *lock(&self.state)
    }

    fn set_state(&self, state: AssociationState) {
        *lock(&self.state) = state;
    }

    fn closed_error(&self) -> DimseError {
        let reason = lock(&self.terminal)
            .clone()
            .unwrap_or_else(|| format!("association is {}", self.state()));
        DimseError::Aborted(reason)
    }

    fn next_message_id(&self) -> u16 {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    async fn write(&self, pdus: Vec<Pdu>) -> Result<(), DimseError> {
        let mut writer = self.writer.lock().await;
        for pdu in pdus {
            writer.feed(pdu).await?;
        }
        writer.flush().await
    }

    async fn write_message(&self, message: DimseMessage) -> Result<(), DimseError> {
        tracing::debug!(
            association = %self.id,
            command = %message.field(),
            presentation_context = message.presentation_context_id,
            message_id = message
                .command
                .message_id
                .or(message.command.message_id_being_responded_to),
            "sending message"
        );
        let pdus = message_pdus(&message, self.peer_max_pdu_length);
        if let Err(e) = self.write(pdus).await {
            self.close(Some(&e));
            return Err(e);
        }
        Ok(())
    }

    /// Deliver a complete incoming message to whoever is waiting for it.
    fn route(&self, message: DimseMessage, requests: &mpsc::UnboundedSender<DimseMessage>) {
        let field = message.field();
        if field.is_response() {
            let Some(message_id) = message.command.message_id_being_responded_to else {
                tracing::warn!(
                    association = %self.id,
                    command = %field,
                    "response without Message ID Being Responded To"
                );
                return;
            };
            let is_final = !message.status().is_pending();
            let mut pending = lock(&self.pending);
            let sender = if is_final {
                pending.remove(&message_id)
            } else {
                pending.get(&message_id).cloned()
            };
            match sender {
                Some(sender) => {
                    let _ = sender.send(Ok(message));
                }
                None => tracing::warn!(
                    association = %self.id,
                    command = %field,
                    message_id,
                    "dropping response to unknown message ID"
                ),
            }
            if pending.is_empty() {
                self.drained.notify_waiters();
            }
        } else if field == CommandField::CCancelRq {
            if let Some(message_id) = message.command.message_id_being_responded_to {
                tracing::debug!(association = %self.id, message_id, "C-CANCEL-RQ received");
                if let Some(token) = lock(&self.cancellations).get(&message_id) {
                    token.cancel();
                }
            }
        } else {
            if let Some(message_id) = message.command.message_id {
                lock(&self.cancellations).insert(message_id, self.closed.child_token());
            }
            tracing::debug!(
                association = %self.id,
                command = %field,
                message_id = message.command.message_id,
                "request received"
            );
            if requests.send(message).is_err() {
                tracing::warn!(
                    association = %self.id,
                    command = %field,
                    "nobody serves incoming requests on this association"
                );
            }
        }
    }

    /// Tear down every exchange still waiting on this association.
    fn close(&self, error: Option<&DimseError>) {
        {
            let mut state = lock(&self.state);
            if *state == AssociationState::Closed {
                return;
            }
            *state = AssociationState::Closed;
        }
        if let Some(e) = error {
            *lock(&self.terminal) = Some(e.to_string());
        }
        let pending: Vec<ResponseSender> = lock(&self.pending).drain().map(|(_, s)| s).collect();
        for sender in pending {
            let terminal = match error {
                Some(e) => e.to_terminal(),
                None => self.closed_error(),
            };
            let _ = sender.send(Err(terminal));
        }
        lock(&self.cancellations).clear();
        lock(&self.release_rp).take();
        self.closed.cancel();
        self.drained.notify_waiters();
    }

    async fn send_abort(&self, source: AbortSource, reason: u8) {
        let abort = Pdu::Abort(Abort { source, reason });
        if let Err(e) = self.write(vec![abort]).await {
            tracing::debug!(association = %self.id, error = %e, "could not send A-ABORT");
        }
        let _ = self.writer.lock().await.close().await;
    }
}

/// An established association. Dropping it without [Association::release] closes the
/// transport abruptly.
pub struct Association {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedReceiver<DimseMessage>,
    reader: JoinHandle<()>,
}

fn codec(ae: &AeContext) -> PduCodec {
    PduCodec::new(ae.max_pdu_length(), ae.is_strict())
}

impl Association {
    /// Connect to `target` and negotiate an association proposing `proposals`.
    pub async fn open<P: Into<Proposal>>(
        ae: &AeContext,
        target: &Target,
        proposals: impl IntoIterator<Item = P>,
    ) -> Result<Self, DimseError> {
        let proposals: Vec<Proposal> = proposals.into_iter().map(Into::into).collect();
        let rq = negotiation::propose(ae, &target.ae_title, &proposals)?;
        let handshake = async {
            let stream = TcpStream::connect(&target.address).await?;
            let (read_half, write_half) = stream.into_split();
            let mut reader = FramedRead::new(read_half, codec(ae));
            let mut writer = FramedWrite::new(write_half, codec(ae));
            writer.send(Pdu::AssociateRq(rq.clone())).await?;
            let answer = match reader.next().await {
                Some(Ok(pdu)) => pdu,
                Some(Err(e)) => {
                    abort_handshake(&mut writer).await;
                    return Err(e);
                }
                None => {
                    return Err(DimseError::Aborted(
                        "connection closed during association negotiation".to_string(),
                    ));
                }
            };
            match answer {
                Pdu::AssociateAc(ac) => match negotiation::accepted_contexts(&rq, &ac) {
                    Ok(contexts) => Ok((reader, writer, contexts, ac.user_information.max_length)),
                    Err(e) => {
                        abort_handshake(&mut writer).await;
                        Err(e)
                    }
                },
                Pdu::AssociateRj(rj) => Err(DimseError::AssociationRejected {
                    permanent: rj.permanent,
                    reason: rj.reason,
                }),
                Pdu::Abort(abort) => Err(DimseError::PeerAbort {
                    abort_source: abort.source,
                    reason: abort.reason,
                }),
                other => {
                    abort_handshake(&mut writer).await;
                    Err(DimseError::UnexpectedPdu {
                        pdu: other.name(),
                        state: AssociationState::Requesting.name(),
                    })
                }
            }
        };
        let (reader, writer, contexts, peer_max_pdu_length) =
            tokio::time::timeout(ae.timeouts().connect, handshake)
                .await
                .map_err(|_| DimseError::ConnectTimeout)?
                .inspect_err(|e| {
                    tracing::info!(
                        aec = target.ae_title.as_str(),
                        address = target.address.as_str(),
                        error = %e,
                        "could not establish association"
                    )
                })?;
        Ok(Self::establish(
            ae,
            reader,
            writer,
            target.ae_title.clone(),
            contexts,
            peer_max_pdu_length,
        ))
    }

    /// Negotiate an association requested by the peer connected on `stream`.
    pub async fn accept(stream: TcpStream, ae: &AeContext) -> Result<Self, DimseError> {
        Self::accept_or_reject(stream, ae, None).await
    }

    /// Read the A-ASSOCIATE-RQ on `stream` and reject it with `reason`, e.g. because too
    /// many associations are already running.
    pub async fn reject(stream: TcpStream, ae: &AeContext, reason: RejectReason) -> DimseError {
        match Self::accept_or_reject(stream, ae, Some(reason)).await {
            Ok(_) => DimseError::Aborted("association accepted instead of rejected".to_string()),
            Err(e) => e,
        }
    }

    async fn accept_or_reject(
        stream: TcpStream,
        ae: &AeContext,
        refuse: Option<RejectReason>,
    ) -> Result<Self, DimseError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, codec(ae));
        let mut writer = FramedWrite::new(write_half, codec(ae));
        let rq = match tokio::time::timeout(ae.timeouts().connect, reader.next()).await {
            Err(_) => return Err(DimseError::ConnectTimeout),
            Ok(None) => {
                return Err(DimseError::Aborted(
                    "connection closed before A-ASSOCIATE-RQ".to_string(),
                ));
            }
            Ok(Some(Err(e))) => {
                abort_handshake(&mut writer).await;
                return Err(e);
            }
            Ok(Some(Ok(Pdu::AssociateRq(rq)))) => rq,
            Ok(Some(Ok(other))) => {
                abort_handshake(&mut writer).await;
                return Err(DimseError::UnexpectedPdu {
                    pdu: other.name(),
                    state: AssociationState::Idle.name(),
                });
            }
        };
        let outcome = match refuse {
            Some(reason) => Err(AssociateRj {
                permanent: false,
                reason,
            }),
            None => negotiation::negotiate(ae, &rq),
        };
        match outcome {
            Err(rj) => {
                tracing::info!(
                    aec = rq.calling_ae_title.as_str(),
                    aet = rq.called_ae_title.as_str(),
                    reason = %rj.reason,
                    "association rejected"
                );
                writer.send(Pdu::AssociateRj(rj)).await?;
                let _ = writer.close().await;
                Err(DimseError::AssociationRejected {
                    permanent: rj.permanent,
                    reason: rj.reason,
                })
            }
            Ok(negotiated) => {
                writer.send(Pdu::AssociateAc(negotiated.ac)).await?;
                Ok(Self::establish(
                    ae,
                    reader,
                    writer,
                    negotiated.calling_ae_title,
                    negotiated.contexts,
                    negotiated.peer_max_pdu_length,
                ))
            }
        }
    }

    fn establish(
        ae: &AeContext,
        reader: FramedRead<OwnedReadHalf, PduCodec>,
        writer: FramedWrite<OwnedWriteHalf, PduCodec>,
        peer_ae_title: AeTitle,
        contexts: Vec<PresentationContext>,
        peer_max_pdu_length: u32,
    ) -> Self {
        let shared = Arc::new(Shared {
            id: Ulid::new(),
            local_ae_title: ae.ae_title().clone(),
            peer_ae_title,
            contexts,
            peer_max_pdu_length,
            timeouts: *ae.timeouts(),
            state: Mutex::new(AssociationState::Established),
            terminal: Mutex::new(None),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            release_rp: Mutex::new(None),
            next_message_id: AtomicU16::new(1),
            drained: Notify::new(),
            closed: CancellationToken::new(),
        });
        tracing::info!(
            association = %shared.id,
            aec = shared.peer_ae_title.as_str(),
            aet = shared.local_ae_title.as_str(),
            presentation_contexts = shared.contexts.len(),
            peer_max_pdu_length,
            "association established"
        );
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), reader, requests_tx));
        Self {
            shared,
            requests,
            reader,
        }
    }

    pub fn id(&self) -> Ulid {
        self.shared.id
    }

    pub fn state(&self) -> AssociationState {
        self.shared.state()
    }

    pub fn local_ae_title(&self) -> &AeTitle {
        &self.shared.local_ae_title
    }

    pub fn peer_ae_title(&self) -> &AeTitle {
        &self.shared.peer_ae_title
    }

    pub fn presentation_contexts(&self) -> &[PresentationContext] {
        &self.shared.contexts
    }

    pub fn peer_max_pdu_length(&self) -> u32 {
        self.shared.peer_max_pdu_length
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.shared.timeouts
    }

    pub fn context(&self, id: u8) -> Option<&PresentationContext> {
        self.shared.contexts.iter().find(|pc| pc.id == id)
    }

    /// An accepted presentation context for `abstract_syntax` on which we may act as `role`.
    pub fn context_for(
        &self,
        abstract_syntax: &str,
        role: Role,
    ) -> Result<&PresentationContext, DimseError> {
        self.shared
            .contexts
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax && pc.permits(role))
            .ok_or_else(|| DimseError::UnsupportedPresentationContext {
                abstract_syntax: abstract_syntax.to_string(),
            })
    }

    /// Token cancelled when the peer sends C-CANCEL-RQ for `message_id` or the association
    /// closes.
    pub fn cancellation(&self, message_id: u16) -> CancellationToken {
        lock(&self.shared.cancellations)
            .entry(message_id)
            .or_insert_with(|| self.shared.closed.child_token())
            .clone()
    }

    fn ensure_established(&self) -> Result<(), DimseError> {
        match self.state() {
            AssociationState::Established => Ok(()),
            _ => Err(self.shared.closed_error()),
        }
    }

    /// Send a request on presentation context `pc`, allocating a fresh message ID. Responses
    /// are read from the returned [ResponseStream].
    pub async fn send_request(
        &self,
        pc: &PresentationContext,
        mut command: CommandSet,
        data: Option<Bytes>,
    ) -> Result<ResponseStream, DimseError> {
        self.ensure_established()?;
        let message_id = self.shared.next_message_id();
        command.message_id = Some(message_id);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.pending).insert(message_id, tx);
        let message = DimseMessage::new(pc.id, command, data);
        if let Err(e) = self.shared.write_message(message).await {
            lock(&self.shared.pending).remove(&message_id);
            return Err(e);
        }
        Ok(ResponseStream {
            shared: Arc::clone(&self.shared),
            message_id,
            responses: rx,
            timeout: self.shared.timeouts.request,
            finished: false,
        })
    }

    /// Send a response. A final response releases the cancellation token of its request.
    pub async fn send_response(
        &self,
        presentation_context_id: u8,
        command: CommandSet,
        data: Option<Bytes>,
    ) -> Result<(), DimseError> {
        self.ensure_established()?;
        let is_final = command.status.is_some_and(|s| !s.is_pending());
        let responded_to = command.message_id_being_responded_to;
        self.shared
            .write_message(DimseMessage::new(presentation_context_id, command, data))
            .await?;
        if let (true, Some(message_id)) = (is_final, responded_to) {
            lock(&self.shared.cancellations).remove(&message_id);
        }
        Ok(())
    }

    /// Ask the peer to stop working on request `message_id`.
    pub async fn send_cancel(
        &self,
        presentation_context_id: u8,
        message_id: u16,
    ) -> Result<(), DimseError> {
        self.ensure_established()?;
        self.shared
            .write_message(DimseMessage::new(
                presentation_context_id,
                cancel_rq(message_id),
                None,
            ))
            .await
    }

    /// Next request sent by the peer. `None` once the association is released or aborted.
    pub async fn next_request(&mut self) -> Option<DimseMessage> {
        self.requests.recv().await
    }

    async fn wait_for_outstanding_responses(&self) {
        let drain = async {
            loop {
                let notified = self.shared.drained.notified();
                if lock(&self.shared.pending).is_empty() {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(self.shared.timeouts.request, drain)
            .await
            .is_err()
        {
            tracing::warn!(
                association = %self.shared.id,
                "releasing with responses still outstanding"
            );
        }
    }

    /// Orderly release: wait for outstanding responses, send A-RELEASE-RQ and wait for
    /// A-RELEASE-RP. Aborts if the peer does not answer in time.
    pub async fn release(mut self) -> Result<(), DimseError> {
        self.ensure_established()?;
        self.wait_for_outstanding_responses().await;
        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.release_rp) = Some(tx);
        self.shared.set_state(AssociationState::Releasing);
        if let Err(e) = self.shared.write(vec![Pdu::ReleaseRq]).await {
            self.shared.close(Some(&e));
            return Err(e);
        }
        let outcome = tokio::time::timeout(self.shared.timeouts.release, rx).await;
        let result = match outcome {
            Ok(Ok(())) => {
                tracing::info!(
                    association = %self.shared.id,
                    aec = self.shared.peer_ae_title.as_str(),
                    "association released"
                );
                self.shared.close(None);
                Ok(())
            }
            Ok(Err(_)) => match lock(&self.shared.terminal).clone() {
                Some(reason) => Err(DimseError::Aborted(reason)),
                None => Ok(()),
            },
            Err(_) => {
                self.abort_with(DimseError::ReleaseTimeout).await;
                Err(DimseError::ReleaseTimeout)
            }
        };
        let _ = self.shared.writer.lock().await.close().await;
        self.requests.close();
        result
    }

    /// Abort the association and close the transport.
    pub async fn abort(self) {
        self.abort_with(DimseError::Aborted("aborted by local user".to_string()))
            .await;
    }

    async fn abort_with(&self, reason: DimseError) {
        if self.state() == AssociationState::Closed {
            return;
        }
        tracing::info!(
            association = %self.shared.id,
            aec = self.shared.peer_ae_title.as_str(),
            reason = %reason,
            "aborting association"
        );
        self.shared.set_state(AssociationState::Aborting);
        self.shared
            .send_abort(AbortSource::ServiceUser, abort_reason::NOT_SPECIFIED)
            .await;
        self.shared.close(Some(&reason));
        self.reader.abort();
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        if self.shared.state() != AssociationState::Closed {
            tracing::debug!(association = %self.shared.id, "association dropped while open");
            self.shared.close(Some(&DimseError::Aborted(
                "association dropped".to_string(),
            )));
        }
        self.reader.abort();
    }
}

async fn abort_handshake(writer: &mut FramedWrite<OwnedWriteHalf, PduCodec>) {
    let abort = Pdu::Abort(Abort {
        source: AbortSource::ServiceProvider,
        reason: abort_reason::UNEXPECTED_PDU,
    });
    let _ = writer.send(abort).await;
    let _ = writer.close().await;
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: FramedRead<OwnedReadHalf, PduCodec>,
    requests: mpsc::UnboundedSender<DimseMessage>,
) {
    let mut assembler = MessageAssembler::new();
    let outcome = read_pdus(&shared, &mut reader, &mut assembler, &requests).await;
    match outcome {
        Ok(()) => shared.close(None),
        Err(e) => {
            let reason = match &e {
                DimseError::PeerAbort { .. } | DimseError::Io(_) => None,
                DimseError::UnexpectedPdu { .. } => Some(abort_reason::UNEXPECTED_PDU),
                DimseError::MalformedPdu(_) => Some(abort_reason::INVALID_PDU_PARAMETER_VALUE),
                _ => Some(abort_reason::NOT_SPECIFIED),
            };
            tracing::warn!(
                association = %shared.id,
                aec = shared.peer_ae_title.as_str(),
                error = %e,
                "association aborted"
            );
            if let Some(reason) = reason {
                shared.set_state(AssociationState::Aborting);
                shared.send_abort(AbortSource::ServiceProvider, reason).await;
            }
            shared.close(Some(&e));
        }
    }
}

async fn read_pdus(
    shared: &Shared,
    reader: &mut FramedRead<OwnedReadHalf, PduCodec>,
    assembler: &mut MessageAssembler,
    requests: &mpsc::UnboundedSender<DimseMessage>,
) -> Result<(), DimseError> {
    while let Some(pdu) = reader.next().await {
        let state = shared.state();
        match pdu? {
            Pdu::PData(values) => {
                for pdv in values {
                    if !shared
                        .contexts
                        .iter()
                        .any(|pc| pc.id == pdv.presentation_context_id)
                    {
                        return Err(DimseError::MalformedPdu(format!(
                            "P-DATA-TF on unaccepted presentation context {}",
                            pdv.presentation_context_id
                        )));
                    }
                    if let Some(message) = assembler.push(pdv)? {
                        shared.route(message, requests);
                    }
                }
            }
            Pdu::ReleaseRq
                if matches!(
                    state,
                    AssociationState::Established | AssociationState::Releasing
                ) =>
            {
                tracing::info!(
                    association = %shared.id,
                    aec = shared.peer_ae_title.as_str(),
                    "association released by peer"
                );
                shared.write(vec![Pdu::ReleaseRp]).await?;
                if let Some(tx) = lock(&shared.release_rp).take() {
                    let _ = tx.send(());
                }
                return Ok(());
            }
            Pdu::ReleaseRp if state == AssociationState::Releasing => {
                if let Some(tx) = lock(&shared.release_rp).take() {
                    let _ = tx.send(());
                }
                return Ok(());
            }
            Pdu::Abort(abort) => {
                return Err(DimseError::PeerAbort {
                    abort_source: abort.source,
                    reason: abort.reason,
                });
            }
            other => {
                return Err(DimseError::UnexpectedPdu {
                    pdu: other.name(),
                    state: state.name(),
                });
            }
        }
    }
    match shared.state() {
        AssociationState::Releasing | AssociationState::Closed => Ok(()),
        _ => Err(DimseError::Aborted(
            "connection closed by peer without release".to_string(),
        )),
    }
}

/// Responses to one request, in the order the peer sent them. C-FIND, C-MOVE and C-GET yield
/// any number of pending responses before the final one; other services yield exactly one.
pub struct ResponseStream {
    shared: Arc<Shared>,
    message_id: u16,
    responses: mpsc::UnboundedReceiver<Result<DimseMessage, DimseError>>,
    timeout: Duration,
    finished: bool,
}

impl ResponseStream {
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Next response, `None` after the final one.
    ///
    /// Waiting longer than the request timeout yields [DimseError::RequestTimeout] and ends
    /// this exchange only. The association and its other exchanges are left alone.
    pub async fn next(&mut self) -> Option<Result<DimseMessage, DimseError>> {
        if self.finished {
            return None;
        }
        let received = tokio::time::timeout(self.timeout, self.responses.recv()).await;
        let item = match received {
            Err(_) => {
                self.forget();
                Err(DimseError::RequestTimeout {
                    message_id: self.message_id,
                })
            }
            Ok(None) => Err(self.shared.closed_error()),
            Ok(Some(Ok(message))) => {
                if message.status().is_pending() {
                    return Some(Ok(message));
                }
                Ok(message)
            }
            Ok(Some(Err(e))) => Err(e),
        };
        self.finished = true;
        Some(item)
    }

    /// Skip pending responses and return the final one.
    pub async fn final_response(mut self) -> Result<DimseMessage, DimseError> {
        loop {
            match self.next().await {
                Some(Ok(message)) if message.status().is_pending() => continue,
                Some(result) => return result,
                None => return Err(self.shared.closed_error()),
            }
        }
    }

    fn forget(&mut self) {
        let mut pending = lock(&self.shared.pending);
        pending.remove(&self.message_id);
        if pending.is_empty() {
            self.shared.drained.notify_waiters();
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.finished {
            self.forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::echo_rq;
    use crate::pdu::{
        AssociateAc, PresentationContextResult, PresentationContextResultItem, UserInformation,
    };
    use crate::uids;
    use tokio::net::TcpListener;

    fn ae(title: &'static str) -> AeContext {
        AeContext::new(AeTitle::from_static(title))
            .with_scp(uids::VERIFICATION)
            .with_request_timeout(Duration::from_millis(300))
            .with_release_timeout(Duration::from_millis(300))
            .with_connect_timeout(Duration::from_millis(500))
    }

    /// A peer which accepts the verification context then hands over its raw framed transport.
    async fn raw_peer(
        listener: TcpListener,
    ) -> (
        FramedRead<OwnedReadHalf, PduCodec>,
        FramedWrite<OwnedWriteHalf, PduCodec>,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let (r, w) = stream.into_split();
        let mut reader = FramedRead::new(r, PduCodec::default());
        let mut writer = FramedWrite::new(w, PduCodec::default());
        let rq = match reader.next().await {
            Some(Ok(Pdu::AssociateRq(rq))) => rq,
            other => panic!("expected A-ASSOCIATE-RQ, got {other:?}"),
        };
        let ac = AssociateAc {
            protocol_version: 1,
            called_ae_title: rq.called_ae_title.clone(),
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context: rq.application_context.clone(),
            presentation_contexts: vec![PresentationContextResultItem {
                id: 1,
                result: PresentationContextResult::Acceptance,
                transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            }],
            user_information: UserInformation {
                max_length: 0,
                implementation_class_uid: "1.2.3".to_string(),
                ..Default::default()
            },
        };
        writer.send(Pdu::AssociateAc(ac)).await.unwrap();
        (reader, writer)
    }

    async fn listen() -> (TcpListener, Target) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new(
            AeTitle::from_static("PEER"),
            listener.local_addr().unwrap().to_string(),
        );
        (listener, target)
    }

    #[tokio::test]
    async fn test_unexpected_pdu_aborts_and_fails_pending_requests() {
        let (listener, target) = listen().await;
        let peer = tokio::spawn(async move {
            let (mut reader, mut writer) = raw_peer(listener).await;
            // wait for the C-ECHO-RQ, then answer nonsense
            let _ = reader.next().await;
            writer.send(Pdu::ReleaseRp).await.unwrap();
            reader.next().await
        });
        let scu = ae("SCU");
        let association = Association::open(&scu, &target, [uids::VERIFICATION]).await.unwrap();
        let pc = association.context_for(uids::VERIFICATION, Role::Scu).unwrap().clone();
        let mut responses = association.send_request(&pc, echo_rq(), None).await.unwrap();
        let result = responses.next().await.unwrap();
        assert!(matches!(result, Err(DimseError::UnexpectedPdu { pdu: "A-RELEASE-RP", .. })));
        assert_eq!(association.state(), AssociationState::Closed);
        match peer.await.unwrap() {
            Some(Ok(Pdu::Abort(abort))) => {
                assert_eq!(abort.source, AbortSource::ServiceProvider);
                assert_eq!(abort.reason, abort_reason::UNEXPECTED_PDU);
            }
            other => panic!("expected A-ABORT, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_keeps_association_established() {
        let (listener, target) = listen().await;
        let peer = tokio::spawn(async move {
            let (mut reader, _writer) = raw_peer(listener).await;
            // swallow everything until the transport closes
            while let Some(Ok(_)) = reader.next().await {}
        });
        let scu = ae("SCU");
        let association = Association::open(&scu, &target, [uids::VERIFICATION]).await.unwrap();
        let pc = association.context_for(uids::VERIFICATION, Role::Scu).unwrap().clone();
        let mut first = association.send_request(&pc, echo_rq(), None).await.unwrap();
        let second = association.send_request(&pc, echo_rq(), None).await.unwrap();
        assert_ne!(first.message_id(), second.message_id());
        let result = first.next().await.unwrap();
        assert!(matches!(
            result,
            Err(DimseError::RequestTimeout { message_id }) if message_id == first.message_id()
        ));
        assert!(first.next().await.is_none());
        assert_eq!(association.state(), AssociationState::Established);
        drop(second);
        association.abort().await;
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_release_timeout_aborts() {
        let (listener, target) = listen().await;
        let peer = tokio::spawn(async move {
            let (mut reader, _writer) = raw_peer(listener).await;
            let mut seen = Vec::new();
            while let Some(Ok(pdu)) = reader.next().await {
                seen.push(pdu.name());
            }
            seen
        });
        let scu = ae("SCU");
        let association = Association::open(&scu, &target, [uids::VERIFICATION]).await.unwrap();
        assert!(matches!(
            association.release().await,
            Err(DimseError::ReleaseTimeout)
        ));
        assert_eq!(peer.await.unwrap(), vec!["A-RELEASE-RQ", "A-ABORT"]);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let (listener, target) = listen().await;
        // accept the TCP connection but never answer the A-ASSOCIATE-RQ
        let peer = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });
        let scu = ae("SCU");
        let result = Association::open(&scu, &target, [uids::VERIFICATION]).await;
        assert!(matches!(result, Err(DimseError::ConnectTimeout)));
        drop(peer);
    }
}
