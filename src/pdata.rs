//! Splitting DIMSE messages into P-DATA-TF PDUs and putting them back together.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::command::CommandSet;
use crate::error::DimseError;
use crate::message::DimseMessage;
use crate::pdu::{PDV_HEADER_LENGTH, Pdu, PdvKind, PresentationDataValue};

/// Split `payload` into P-DATA-TF PDUs carrying one PDV each, so that no PDU is longer than
/// `max_pdu_length` (0 meaning unlimited). An empty payload still yields one last fragment.
pub fn fragment(
    presentation_context_id: u8,
    kind: PdvKind,
    payload: Bytes,
    max_pdu_length: u32,
) -> Vec<Pdu> {
    let chunk_size = match max_pdu_length as usize {
        0 => usize::MAX,
        max => max.saturating_sub(PDV_HEADER_LENGTH).max(1),
    };
    let mut pdus = Vec::new();
    let mut rest = payload;
    loop {
        let data = rest.split_to(chunk_size.min(rest.len()));
        let is_last = rest.is_empty();
        pdus.push(Pdu::PData(vec![PresentationDataValue {
            presentation_context_id,
            kind,
            is_last,
            data,
        }]));
        if is_last {
            return pdus;
        }
    }
}

/// PDUs of a whole message: its command fragments then its dataset fragments.
pub fn message_pdus(message: &DimseMessage, max_pdu_length: u32) -> Vec<Pdu> {
    let id = message.presentation_context_id;
    let mut pdus = fragment(id, PdvKind::Command, message.command.encode(), max_pdu_length);
    if let Some(data) = &message.data {
        pdus.extend(fragment(id, PdvKind::Data, data.clone(), max_pdu_length));
    }
    pdus
}

/// Message being reassembled on one presentation context.
#[derive(Default)]
struct Partial {
    command_bytes: BytesMut,
    /// Set once the last command fragment arrived and a dataset is expected.
    command: Option<CommandSet>,
    data: BytesMut,
}

/// Reassembles PDVs, possibly spread over many P-DATA-TF PDUs, into [DimseMessage]s.
#[derive(Default)]
pub struct MessageAssembler {
    partial: HashMap<u8, Partial>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one PDV. Returns the message it completes, if any.
    pub fn push(&mut self, pdv: PresentationDataValue) -> Result<Option<DimseMessage>, DimseError> {
        let id = pdv.presentation_context_id;
        let partial = self.partial.entry(id).or_default();
        match pdv.kind {
            PdvKind::Command => {
                if partial.command.is_some() {
                    return Err(DimseError::MalformedPdu(format!(
                        "command fragment on presentation context {id} while a dataset is expected"
                    )));
                }
                partial.command_bytes.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let bytes = std::mem::take(&mut partial.command_bytes).freeze();
                let command = CommandSet::decode(bytes)?;
                if command.has_dataset {
                    partial.command = Some(command);
                    Ok(None)
                } else {
                    self.partial.remove(&id);
                    Ok(Some(DimseMessage::new(id, command, None)))
                }
            }
            PdvKind::Data => {
                if partial.command.is_none() {
                    return Err(DimseError::MalformedPdu(format!(
                        "dataset fragment on presentation context {id} without a preceding command"
                    )));
                }
                partial.data.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                match self.partial.remove(&id) {
                    Some(Partial {
                        command: Some(command),
                        data,
                        ..
                    }) => Ok(Some(DimseMessage::new(id, command, Some(data.freeze())))),
                    _ => Ok(None),
                }
            }
        }
    }

    /// Whether no message is partially received.
    pub fn is_idle(&self) -> bool {
        self.partial.is_empty()
    }
}
