//! DICOM Upper Layer PDUs and their binary encoding.
//!
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part08/sect_9.3.html>

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DimseError;

/// The default maximum PDU length advertised to peers.
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16_384;

/// Smallest maximum PDU length a peer may advertise before we refuse to talk to it.
pub const MINIMUM_PDU_LENGTH: u32 = 4_096;

/// Upper bound for the length of any incoming PDU, whatever was negotiated.
pub const MAXIMUM_PDU_LENGTH: u32 = 16 * 1024 * 1024;

/// PDU type (1 byte), reserved (1 byte) and PDU length (4 bytes).
pub const PDU_HEADER_LENGTH: usize = 6;

/// Item length (4 bytes), presentation context ID (1 byte) and message control header (1 byte).
pub const PDV_HEADER_LENGTH: usize = 6;

const PROTOCOL_VERSION: u16 = 0x0001;

mod pdu_type {
    pub const ASSOCIATE_RQ: u8 = 0x01;
    pub const ASSOCIATE_AC: u8 = 0x02;
    pub const ASSOCIATE_RJ: u8 = 0x03;
    pub const P_DATA_TF: u8 = 0x04;
    pub const RELEASE_RQ: u8 = 0x05;
    pub const RELEASE_RP: u8 = 0x06;
    pub const ABORT: u8 = 0x07;
}

mod item_type {
    pub const APPLICATION_CONTEXT: u8 = 0x10;
    pub const PRESENTATION_CONTEXT_RQ: u8 = 0x20;
    pub const PRESENTATION_CONTEXT_AC: u8 = 0x21;
    pub const ABSTRACT_SYNTAX: u8 = 0x30;
    pub const TRANSFER_SYNTAX: u8 = 0x40;
    pub const USER_INFORMATION: u8 = 0x50;
    pub const MAXIMUM_LENGTH: u8 = 0x51;
    pub const IMPLEMENTATION_CLASS_UID: u8 = 0x52;
    pub const ASYNC_OPERATIONS_WINDOW: u8 = 0x53;
    pub const ROLE_SELECTION: u8 = 0x54;
    pub const IMPLEMENTATION_VERSION_NAME: u8 = 0x55;
}

/// An Upper Layer protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociateRq(AssociateRq),
    AssociateAc(AssociateAc),
    AssociateRj(AssociateRj),
    PData(Vec<PresentationDataValue>),
    ReleaseRq,
    ReleaseRp,
    Abort(Abort),
}

impl Pdu {
    pub fn name(&self) -> &'static str {
        match self {
            Pdu::AssociateRq(_) => "A-ASSOCIATE-RQ",
            Pdu::AssociateAc(_) => "A-ASSOCIATE-AC",
            Pdu::AssociateRj(_) => "A-ASSOCIATE-RJ",
            Pdu::PData(_) => "P-DATA-TF",
            Pdu::ReleaseRq => "A-RELEASE-RQ",
            Pdu::ReleaseRp => "A-RELEASE-RP",
            Pdu::Abort(_) => "A-ABORT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRq {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextProposal>,
    pub user_information: UserInformation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAc {
    pub protocol_version: u16,
    /// Echo of the called AE title of the request, not significant.
    pub called_ae_title: String,
    /// Echo of the calling AE title of the request, not significant.
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextResultItem>,
    pub user_information: UserInformation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposal {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResultItem {
    pub id: u8,
    pub result: PresentationContextResult,
    /// Meaningless unless the context was accepted.
    pub transfer_syntax: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResult {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationContextResult {
    fn code(self) -> u8 {
        match self {
            Self::Acceptance => 0,
            Self::UserRejection => 1,
            Self::NoReason => 2,
            Self::AbstractSyntaxNotSupported => 3,
            Self::TransferSyntaxesNotSupported => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self, DimseError> {
        match code {
            0 => Ok(Self::Acceptance),
            1 => Ok(Self::UserRejection),
            2 => Ok(Self::NoReason),
            3 => Ok(Self::AbstractSyntaxNotSupported),
            4 => Ok(Self::TransferSyntaxesNotSupported),
            _ => Err(malformed(format!("invalid presentation context result {code}"))),
        }
    }
}

/// The User Information item of A-ASSOCIATE-RQ/AC.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInformation {
    /// Maximum length of P-DATA-TF PDUs the sender can receive, 0 meaning unlimited.
    pub max_length: u32,
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
    /// Maximum number of operations invoked / performed asynchronously.
    pub async_operations_window: Option<(u16, u16)>,
    pub role_selections: Vec<RoleSelection>,
    /// Sub-items this implementation does not interpret, kept verbatim.
    pub other: Vec<(u8, Bytes)>,
}

/// SCP/SCU Role Selection sub-item. Roles always refer to the association requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: bool,
    pub scp_role: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateRj {
    pub permanent: bool,
    pub reason: RejectReason,
}

/// Source and reason of an A-ASSOCIATE-RJ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    ProtocolVersionNotSupported,
    TemporaryCongestion,
    LocalLimitExceeded,
    Other { source: u8, reason: u8 },
}

impl RejectReason {
    fn to_source_reason(self) -> (u8, u8) {
        match self {
            Self::NoReasonGiven => (1, 1),
            Self::ApplicationContextNameNotSupported => (1, 2),
            Self::CallingAeTitleNotRecognized => (1, 3),
            Self::CalledAeTitleNotRecognized => (1, 7),
            Self::ProtocolVersionNotSupported => (2, 2),
            Self::TemporaryCongestion => (3, 1),
            Self::LocalLimitExceeded => (3, 2),
            Self::Other { source, reason } => (source, reason),
        }
    }

    fn from_source_reason(source: u8, reason: u8) -> Self {
        match (source, reason) {
            (1, 1) | (2, 1) => Self::NoReasonGiven,
            (1, 2) => Self::ApplicationContextNameNotSupported,
            (1, 3) => Self::CallingAeTitleNotRecognized,
            (1, 7) => Self::CalledAeTitleNotRecognized,
            (2, 2) => Self::ProtocolVersionNotSupported,
            (3, 1) => Self::TemporaryCongestion,
            (3, 2) => Self::LocalLimitExceeded,
            (source, reason) => Self::Other { source, reason },
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoReasonGiven => f.write_str("no-reason-given"),
            Self::ApplicationContextNameNotSupported => {
                f.write_str("application-context-name-not-supported")
            }
            Self::CallingAeTitleNotRecognized => f.write_str("calling-AE-title-not-recognized"),
            Self::CalledAeTitleNotRecognized => f.write_str("called-AE-title-not-recognized"),
            Self::ProtocolVersionNotSupported => f.write_str("protocol-version-not-supported"),
            Self::TemporaryCongestion => f.write_str("temporary-congestion"),
            Self::LocalLimitExceeded => f.write_str("local-limit-exceeded"),
            Self::Other { source, reason } => write!(f, "source {source} reason {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort {
    pub source: AbortSource,
    /// Only significant when the source is the service provider.
    pub reason: u8,
}

/// Who initiated an A-ABORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortSource {
    ServiceUser,
    Reserved,
    ServiceProvider,
}

/// A-ABORT reasons used when the service provider aborts.
pub mod abort_reason {
    pub const NOT_SPECIFIED: u8 = 0;
    pub const UNRECOGNIZED_PDU: u8 = 1;
    pub const UNEXPECTED_PDU: u8 = 2;
    pub const UNRECOGNIZED_PDU_PARAMETER: u8 = 4;
    pub const UNEXPECTED_PDU_PARAMETER: u8 = 5;
    pub const INVALID_PDU_PARAMETER_VALUE: u8 = 6;
}

impl fmt::Display for AbortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortSource::ServiceUser => f.write_str("service-user"),
            AbortSource::Reserved => f.write_str("reserved"),
            AbortSource::ServiceProvider => f.write_str("service-provider"),
        }
    }
}

/// One Presentation Data Value item of a P-DATA-TF PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationDataValue {
    pub presentation_context_id: u8,
    pub kind: PdvKind,
    pub is_last: bool,
    pub data: Bytes,
}

/// Whether a PDV carries a fragment of a command set or of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PdvKind {
    Command,
    Data,
}

impl PresentationDataValue {
    fn control_header(&self) -> u8 {
        let command = match self.kind {
            PdvKind::Command => 0x01,
            PdvKind::Data => 0x00,
        };
        let last = if self.is_last { 0x02 } else { 0x00 };
        command | last
    }
}

fn malformed(msg: impl Into<String>) -> DimseError {
    DimseError::MalformedPdu(msg.into())
}

// ------------------------------------------------------------------------------------------------
// encoding
// ------------------------------------------------------------------------------------------------

/// Write the complete binary form of `pdu`, header included, to `dst`.
pub fn encode(pdu: &Pdu, dst: &mut BytesMut) {
    let mut body = BytesMut::new();
    let pdu_type = match pdu {
        Pdu::AssociateRq(rq) => {
            encode_associate_header(
                &mut body,
                rq.protocol_version,
                &rq.called_ae_title,
                &rq.calling_ae_title,
            );
            put_item(&mut body, item_type::APPLICATION_CONTEXT, rq.application_context.as_bytes());
            for pc in &rq.presentation_contexts {
                let mut item = BytesMut::new();
                item.put_slice(&[pc.id, 0, 0, 0]);
                put_item(&mut item, item_type::ABSTRACT_SYNTAX, pc.abstract_syntax.as_bytes());
                for ts in &pc.transfer_syntaxes {
                    put_item(&mut item, item_type::TRANSFER_SYNTAX, ts.as_bytes());
                }
                put_item(&mut body, item_type::PRESENTATION_CONTEXT_RQ, &item);
            }
            encode_user_information(&mut body, &rq.user_information);
            pdu_type::ASSOCIATE_RQ
        }
        Pdu::AssociateAc(ac) => {
            encode_associate_header(
                &mut body,
                ac.protocol_version,
                &ac.called_ae_title,
                &ac.calling_ae_title,
            );
            put_item(&mut body, item_type::APPLICATION_CONTEXT, ac.application_context.as_bytes());
            for pc in &ac.presentation_contexts {
                let mut item = BytesMut::new();
                item.put_slice(&[pc.id, 0, pc.result.code(), 0]);
                put_item(&mut item, item_type::TRANSFER_SYNTAX, pc.transfer_syntax.as_bytes());
                put_item(&mut body, item_type::PRESENTATION_CONTEXT_AC, &item);
            }
            encode_user_information(&mut body, &ac.user_information);
            pdu_type::ASSOCIATE_AC
        }
        Pdu::AssociateRj(rj) => {
            let (source, reason) = rj.reason.to_source_reason();
            let result = if rj.permanent { 1 } else { 2 };
            body.put_slice(&[0, result, source, reason]);
            pdu_type::ASSOCIATE_RJ
        }
        Pdu::PData(values) => {
            for pdv in values {
                body.put_u32(pdv.data.len() as u32 + 2);
                body.put_u8(pdv.presentation_context_id);
                body.put_u8(pdv.control_header());
                body.put_slice(&pdv.data);
            }
            pdu_type::P_DATA_TF
        }
        Pdu::ReleaseRq => {
            body.put_u32(0);
            pdu_type::RELEASE_RQ
        }
        Pdu::ReleaseRp => {
            body.put_u32(0);
            pdu_type::RELEASE_RP
        }
        Pdu::Abort(abort) => {
            let source = match abort.source {
                AbortSource::ServiceUser => 0,
                AbortSource::Reserved => 1,
                AbortSource::ServiceProvider => 2,
            };
            body.put_slice(&[0, 0, source, abort.reason]);
            pdu_type::ABORT
        }
    };
    dst.reserve(PDU_HEADER_LENGTH + body.len());
    dst.put_u8(pdu_type);
    dst.put_u8(0);
    dst.put_u32(body.len() as u32);
    dst.put_slice(&body);
}

fn encode_associate_header(dst: &mut BytesMut, version: u16, called: &str, calling: &str) {
    dst.put_u16(version);
    dst.put_u16(0);
    dst.put_slice(&padded_ae_title(called));
    dst.put_slice(&padded_ae_title(calling));
    dst.put_bytes(0, 32);
}

fn padded_ae_title(title: &str) -> [u8; 16] {
    let mut out = [b' '; 16];
    let bytes = title.as_bytes();
    let n = bytes.len().min(16);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn put_item(dst: &mut BytesMut, item_type: u8, body: &[u8]) {
    dst.put_u8(item_type);
    dst.put_u8(0);
    dst.put_u16(body.len() as u16);
    dst.put_slice(body);
}

fn encode_user_information(dst: &mut BytesMut, info: &UserInformation) {
    let mut item = BytesMut::new();
    put_item(&mut item, item_type::MAXIMUM_LENGTH, &info.max_length.to_be_bytes());
    put_item(
        &mut item,
        item_type::IMPLEMENTATION_CLASS_UID,
        info.implementation_class_uid.as_bytes(),
    );
    if let Some((invoked, performed)) = info.async_operations_window {
        let mut window = [0u8; 4];
        window[..2].copy_from_slice(&invoked.to_be_bytes());
        window[2..].copy_from_slice(&performed.to_be_bytes());
        put_item(&mut item, item_type::ASYNC_OPERATIONS_WINDOW, &window);
    }
    for role in &info.role_selections {
        let mut sub = BytesMut::new();
        sub.put_u16(role.sop_class_uid.len() as u16);
        sub.put_slice(role.sop_class_uid.as_bytes());
        sub.put_u8(role.scu_role as u8);
        sub.put_u8(role.scp_role as u8);
        put_item(&mut item, item_type::ROLE_SELECTION, &sub);
    }
    if let Some(name) = &info.implementation_version_name {
        put_item(&mut item, item_type::IMPLEMENTATION_VERSION_NAME, name.as_bytes());
    }
    for (sub_type, data) in &info.other {
        put_item(&mut item, *sub_type, data);
    }
    put_item(dst, item_type::USER_INFORMATION, &item);
}

// ------------------------------------------------------------------------------------------------
// decoding
// ------------------------------------------------------------------------------------------------

/// Decode the body of a PDU of the given type. The body must be exactly the PDU length long.
pub fn decode(pdu_type: u8, mut body: Bytes) -> Result<Pdu, DimseError> {
    match pdu_type {
        pdu_type::ASSOCIATE_RQ => {
            let header = decode_associate_header(&mut body)?;
            let mut application_context = None;
            let mut presentation_contexts = Vec::new();
            let mut user_information = None;
            for (item, data) in read_items(&mut body, "A-ASSOCIATE-RQ")? {
                match item {
                    item_type::APPLICATION_CONTEXT => application_context = Some(uid(&data)?),
                    item_type::PRESENTATION_CONTEXT_RQ => {
                        presentation_contexts.push(decode_proposal(data)?)
                    }
                    item_type::USER_INFORMATION => {
                        user_information = Some(decode_user_information(data)?)
                    }
                    other => {
                        let msg = format!("unexpected item {other:02X}H in A-ASSOCIATE-RQ");
                        return Err(malformed(msg));
                    }
                }
            }
            Ok(Pdu::AssociateRq(AssociateRq {
                protocol_version: header.version,
                called_ae_title: header.called,
                calling_ae_title: header.calling,
                application_context: application_context
                    .ok_or_else(|| malformed("missing application context item"))?,
                presentation_contexts,
                user_information: user_information.unwrap_or_default(),
            }))
        }
        pdu_type::ASSOCIATE_AC => {
            let header = decode_associate_header(&mut body)?;
            let mut application_context = None;
            let mut presentation_contexts = Vec::new();
            let mut user_information = None;
            for (item, data) in read_items(&mut body, "A-ASSOCIATE-AC")? {
                match item {
                    item_type::APPLICATION_CONTEXT => application_context = Some(uid(&data)?),
                    item_type::PRESENTATION_CONTEXT_AC => {
                        presentation_contexts.push(decode_result_item(data)?)
                    }
                    item_type::USER_INFORMATION => {
                        user_information = Some(decode_user_information(data)?)
                    }
                    other => {
                        let msg = format!("unexpected item {other:02X}H in A-ASSOCIATE-AC");
                        return Err(malformed(msg));
                    }
                }
            }
            Ok(Pdu::AssociateAc(AssociateAc {
                protocol_version: header.version,
                called_ae_title: header.called,
                calling_ae_title: header.calling,
                application_context: application_context
                    .ok_or_else(|| malformed("missing application context item"))?,
                presentation_contexts,
                user_information: user_information.unwrap_or_default(),
            }))
        }
        pdu_type::ASSOCIATE_RJ => {
            let [_, result, source, reason] = fixed_body::<4>(body, "A-ASSOCIATE-RJ")?;
            let permanent = match result {
                1 => true,
                2 => false,
                other => return Err(malformed(format!("invalid A-ASSOCIATE-RJ result {other}"))),
            };
            Ok(Pdu::AssociateRj(AssociateRj {
                permanent,
                reason: RejectReason::from_source_reason(source, reason),
            }))
        }
        pdu_type::P_DATA_TF => {
            let mut values = Vec::new();
            while body.has_remaining() {
                let length = take_u32(&mut body, "PDV item length")? as usize;
                if length < 2 {
                    return Err(malformed(format!("PDV item length {length} is less than 2")));
                }
                let mut item = take_bytes(&mut body, length, "PDV item")?;
                let presentation_context_id = item.get_u8();
                let header = item.get_u8();
                values.push(PresentationDataValue {
                    presentation_context_id,
                    kind: if header & 0x01 != 0 {
                        PdvKind::Command
                    } else {
                        PdvKind::Data
                    },
                    is_last: header & 0x02 != 0,
                    data: item,
                });
            }
            if values.is_empty() {
                return Err(malformed("P-DATA-TF without any PDV item"));
            }
            Ok(Pdu::PData(values))
        }
        pdu_type::RELEASE_RQ => fixed_body::<4>(body, "A-RELEASE-RQ").map(|_| Pdu::ReleaseRq),
        pdu_type::RELEASE_RP => fixed_body::<4>(body, "A-RELEASE-RP").map(|_| Pdu::ReleaseRp),
        pdu_type::ABORT => {
            let [_, _, source, reason] = fixed_body::<4>(body, "A-ABORT")?;
            let source = match source {
                0 => AbortSource::ServiceUser,
                1 => AbortSource::Reserved,
                2 => AbortSource::ServiceProvider,
                other => return Err(malformed(format!("invalid A-ABORT source {other}"))),
            };
            Ok(Pdu::Abort(Abort { source, reason }))
        }
        other => Err(malformed(format!("unknown PDU type {other:02X}H"))),
    }
}

struct AssociateHeader {
    version: u16,
    called: String,
    calling: String,
}

fn decode_associate_header(body: &mut Bytes) -> Result<AssociateHeader, DimseError> {
    let version = take_u16(body, "protocol version")?;
    take_bytes(body, 2, "reserved")?;
    let called = ae_title_field(&take_bytes(body, 16, "called AE title")?)?;
    let calling = ae_title_field(&take_bytes(body, 16, "calling AE title")?)?;
    take_bytes(body, 32, "reserved")?;
    Ok(AssociateHeader {
        version,
        called,
        calling,
    })
}

fn decode_proposal(mut data: Bytes) -> Result<PresentationContextProposal, DimseError> {
    let id = take_u8(&mut data, "presentation context ID")?;
    take_bytes(&mut data, 3, "reserved")?;
    let mut abstract_syntax = None;
    let mut transfer_syntaxes = Vec::new();
    for (item, sub) in read_items(&mut data, "presentation context item")? {
        match item {
            item_type::ABSTRACT_SYNTAX if abstract_syntax.is_none() => {
                abstract_syntax = Some(uid(&sub)?)
            }
            item_type::TRANSFER_SYNTAX => transfer_syntaxes.push(uid(&sub)?),
            other => {
                return Err(malformed(format!(
                    "unexpected sub-item {other:02X}H in presentation context {id}"
                )));
            }
        }
    }
    if transfer_syntaxes.is_empty() {
        return Err(malformed(format!("presentation context {id} has no transfer syntax")));
    }
    Ok(PresentationContextProposal {
        id,
        abstract_syntax: abstract_syntax
            .ok_or_else(|| malformed(format!("presentation context {id} has no abstract syntax")))?,
        transfer_syntaxes,
    })
}

fn decode_result_item(mut data: Bytes) -> Result<PresentationContextResultItem, DimseError> {
    let id = take_u8(&mut data, "presentation context ID")?;
    take_u8(&mut data, "reserved")?;
    let result = PresentationContextResult::from_code(take_u8(&mut data, "result/reason")?)?;
    take_u8(&mut data, "reserved")?;
    let mut transfer_syntax = None;
    for (item, sub) in read_items(&mut data, "presentation context item")? {
        match item {
            item_type::TRANSFER_SYNTAX if transfer_syntax.is_none() => {
                transfer_syntax = Some(uid(&sub)?)
            }
            other => {
                return Err(malformed(format!(
                    "unexpected sub-item {other:02X}H in presentation context {id}"
                )));
            }
        }
    }
    if result == PresentationContextResult::Acceptance && transfer_syntax.is_none() {
        return Err(malformed(format!(
            "accepted presentation context {id} has no transfer syntax"
        )));
    }
    Ok(PresentationContextResultItem {
        id,
        result,
        transfer_syntax: transfer_syntax.unwrap_or_default(),
    })
}

fn decode_user_information(mut data: Bytes) -> Result<UserInformation, DimseError> {
    let mut info = UserInformation::default();
    for (item, mut sub) in read_items(&mut data, "user information item")? {
        match item {
            item_type::MAXIMUM_LENGTH => {
                info.max_length = u32::from_be_bytes(fixed_body::<4>(sub, "maximum length")?)
            }
            item_type::IMPLEMENTATION_CLASS_UID => info.implementation_class_uid = uid(&sub)?,
            item_type::IMPLEMENTATION_VERSION_NAME => {
                info.implementation_version_name = Some(uid(&sub)?)
            }
            item_type::ASYNC_OPERATIONS_WINDOW => {
                let [a, b, c, d] = fixed_body::<4>(sub, "asynchronous operations window")?;
                info.async_operations_window =
                    Some((u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])));
            }
            item_type::ROLE_SELECTION => {
                let uid_length = take_u16(&mut sub, "role selection UID length")? as usize;
                let sop_class_uid = uid(&take_bytes(&mut sub, uid_length, "role selection UID")?)?;
                let [scu, scp] = fixed_body::<2>(sub, "role selection roles")?;
                info.role_selections.push(RoleSelection {
                    sop_class_uid,
                    scu_role: scu == 1,
                    scp_role: scp == 1,
                });
            }
            other => info.other.push((other, sub)),
        }
    }
    Ok(info)
}

/// Split a buffer into its `(item type, item body)` variable items. Every item length must fit
/// exactly within the enclosing buffer.
fn read_items(buf: &mut Bytes, within: &str) -> Result<Vec<(u8, Bytes)>, DimseError> {
    let mut items = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(malformed(format!("truncated item header in {within}")));
        }
        let item_type = buf.get_u8();
        buf.advance(1);
        let length = buf.get_u16() as usize;
        if length > buf.remaining() {
            return Err(malformed(format!(
                "item {item_type:02X}H of length {length} overruns {within} ({} bytes left)",
                buf.remaining()
            )));
        }
        items.push((item_type, buf.split_to(length)));
    }
    Ok(items)
}

fn fixed_body<const N: usize>(body: Bytes, what: &str) -> Result<[u8; N], DimseError> {
    <[u8; N]>::try_from(body.as_ref())
        .map_err(|_| malformed(format!("{what} must be {N} bytes, got {}", body.len())))
}

fn take_bytes(buf: &mut Bytes, n: usize, field: &str) -> Result<Bytes, DimseError> {
    if buf.remaining() < n {
        return Err(malformed(format!("truncated {field}")));
    }
    Ok(buf.split_to(n))
}

fn take_u8(buf: &mut Bytes, field: &str) -> Result<u8, DimseError> {
    take_bytes(buf, 1, field).map(|b| b[0])
}

fn take_u16(buf: &mut Bytes, field: &str) -> Result<u16, DimseError> {
    take_bytes(buf, 2, field).map(|mut b| b.get_u16())
}

fn take_u32(buf: &mut Bytes, field: &str) -> Result<u32, DimseError> {
    take_bytes(buf, 4, field).map(|mut b| b.get_u32())
}

fn uid(data: &[u8]) -> Result<String, DimseError> {
    std::str::from_utf8(data)
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .map_err(|_| malformed("UID is not valid ASCII"))
}

fn ae_title_field(data: &[u8]) -> Result<String, DimseError> {
    std::str::from_utf8(data)
        .map(|s| s.trim_matches(|c| c == ' ' || c == '\0').to_string())
        .map_err(|_| malformed("AE title is not valid ASCII"))
}

// ------------------------------------------------------------------------------------------------
// framing
// ------------------------------------------------------------------------------------------------

/// [Decoder] and [Encoder] of whole PDUs, for use with [tokio_util::codec::FramedRead] and
/// [tokio_util::codec::FramedWrite].
#[derive(Debug, Clone)]
pub struct PduCodec {
    /// Maximum P-DATA-TF length we advertised, 0 meaning unlimited.
    max_pdu_length: u32,
    /// Whether P-DATA-TF PDUs exceeding `max_pdu_length` are a protocol violation.
    strict: bool,
    /// Length of the frame being read, once its header has been checked.
    frame_length: Option<usize>,
}

impl PduCodec {
    pub fn new(max_pdu_length: u32, strict: bool) -> Self {
        Self {
            max_pdu_length,
            strict,
            frame_length: None,
        }
    }

    fn check_length(&self, pdu_type: u8, length: u32) -> Result<(), DimseError> {
        if length > MAXIMUM_PDU_LENGTH {
            return Err(malformed(format!(
                "PDU length {length} exceeds the hard limit of {MAXIMUM_PDU_LENGTH}"
            )));
        }
        if pdu_type == pdu_type::P_DATA_TF
            && self.max_pdu_length != 0
            && length > self.max_pdu_length
        {
            if self.strict {
                return Err(malformed(format!(
                    "incoming P-DATA-TF length {length} exceeds maximum {}",
                    self.max_pdu_length
                )));
            }
            tracing::warn!(
                pdu_length = length,
                max_pdu_length = self.max_pdu_length,
                "incoming P-DATA-TF larger than negotiated"
            );
        }
        Ok(())
    }
}

impl Default for PduCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PDU_LENGTH, false)
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = DimseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PDU_HEADER_LENGTH {
            return Ok(None);
        }
        let pdu_type = src[0];
        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
        let frame_length = match self.frame_length {
            Some(frame_length) => frame_length,
            None => {
                self.check_length(pdu_type, length)?;
                let frame_length = PDU_HEADER_LENGTH + length as usize;
                self.frame_length = Some(frame_length);
                frame_length
            }
        };
        if src.len() < frame_length {
            src.reserve(frame_length - src.len());
            return Ok(None);
        }
        self.frame_length = None;
        let mut frame = src.split_to(frame_length).freeze();
        frame.advance(PDU_HEADER_LENGTH);
        let pdu = decode(pdu_type, frame)?;
        tracing::trace!(pdu = pdu.name(), length, "received PDU");
        Ok(Some(pdu))
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = DimseError;

    fn encode(&mut self, item: Pdu, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(pdu = item.name(), "sending PDU");
        encode(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn to_bytes(pdu: &Pdu) -> BytesMut {
        let mut buf = BytesMut::new();
        encode(pdu, &mut buf);
        buf
    }

    fn decode_all(buf: &mut BytesMut) -> Result<Option<Pdu>, DimseError> {
        PduCodec::default().decode(buf)
    }

    #[fixture]
    fn associate_rq() -> AssociateRq {
        AssociateRq {
            protocol_version: 1,
            called_ae_title: "SCP-A".to_string(),
            calling_ae_title: "FIND-SCU".to_string(),
            application_context: crate::uids::APPLICATION_CONTEXT.to_string(),
            presentation_contexts: vec![
                PresentationContextProposal {
                    id: 1,
                    abstract_syntax: crate::uids::VERIFICATION.to_string(),
                    transfer_syntaxes: vec![crate::uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
                },
                PresentationContextProposal {
                    id: 3,
                    abstract_syntax: crate::uids::CT_IMAGE_STORAGE.to_string(),
                    transfer_syntaxes: vec![
                        crate::uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                        crate::uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                    ],
                },
            ],
            user_information: UserInformation {
                max_length: 16384,
                implementation_class_uid: crate::uids::IMPLEMENTATION_CLASS_UID.to_string(),
                implementation_version_name: Some("OXIDIMSE_010".to_string()),
                async_operations_window: None,
                role_selections: vec![RoleSelection {
                    sop_class_uid: crate::uids::CT_IMAGE_STORAGE.to_string(),
                    scu_role: true,
                    scp_role: true,
                }],
                other: vec![],
            },
        }
    }

    #[rstest]
    fn test_associate_rq_layout(associate_rq: AssociateRq) {
        let buf = to_bytes(&Pdu::AssociateRq(associate_rq));
        assert_eq!(buf[0], 0x01);
        assert_eq!(buf[1], 0x00);
        let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        assert_eq!(length, buf.len() - PDU_HEADER_LENGTH);
        assert_eq!(&buf[6..8], &[0x00, 0x01]);
        assert_eq!(&buf[10..26], b"SCP-A           ");
        assert_eq!(&buf[26..42], b"FIND-SCU        ");
        assert!(buf[42..74].iter().all(|b| *b == 0));
        // application context item follows the fixed fields
        assert_eq!(buf[74], 0x10);
        assert_eq!(u16::from_be_bytes([buf[76], buf[77]]), 21);
        assert_eq!(&buf[78..99], crate::uids::APPLICATION_CONTEXT.as_bytes());
    }

    #[rstest]
    fn test_associate_rq_decodes_to_same(associate_rq: AssociateRq) {
        let mut buf = to_bytes(&Pdu::AssociateRq(associate_rq.clone()));
        assert_eq!(decode_all(&mut buf).unwrap(), Some(Pdu::AssociateRq(associate_rq)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_associate_ac_with_rejected_context() {
        let ac = AssociateAc {
            protocol_version: 1,
            called_ae_title: "SCP-A".to_string(),
            calling_ae_title: "FIND-SCU".to_string(),
            application_context: crate::uids::APPLICATION_CONTEXT.to_string(),
            presentation_contexts: vec![
                PresentationContextResultItem {
                    id: 1,
                    result: PresentationContextResult::Acceptance,
                    transfer_syntax: crate::uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                },
                PresentationContextResultItem {
                    id: 3,
                    result: PresentationContextResult::AbstractSyntaxNotSupported,
                    transfer_syntax: String::new(),
                },
            ],
            user_information: UserInformation {
                max_length: 0,
                implementation_class_uid: "1.2.3".to_string(),
                ..Default::default()
            },
        };
        let mut buf = to_bytes(&Pdu::AssociateAc(ac.clone()));
        assert_eq!(decode_all(&mut buf).unwrap(), Some(Pdu::AssociateAc(ac)));
    }

    #[rstest]
    #[case(
        AssociateRj { permanent: true, reason: RejectReason::CalledAeTitleNotRecognized },
        [0x03, 0, 0, 0, 0, 4, 0, 1, 1, 7]
    )]
    #[case(
        AssociateRj { permanent: false, reason: RejectReason::LocalLimitExceeded },
        [0x03, 0, 0, 0, 0, 4, 0, 2, 3, 2]
    )]
    fn test_associate_rj_bytes(#[case] rj: AssociateRj, #[case] expected: [u8; 10]) {
        let mut buf = to_bytes(&Pdu::AssociateRj(rj));
        assert_eq!(buf.as_ref(), &expected);
        assert_eq!(decode_all(&mut buf).unwrap(), Some(Pdu::AssociateRj(rj)));
    }

    #[rstest]
    #[case(Pdu::ReleaseRq, [0x05, 0, 0, 0, 0, 4, 0, 0, 0, 0])]
    #[case(Pdu::ReleaseRp, [0x06, 0, 0, 0, 0, 4, 0, 0, 0, 0])]
    #[case(
        Pdu::Abort(Abort {
            source: AbortSource::ServiceProvider,
            reason: abort_reason::UNEXPECTED_PDU,
        }),
        [0x07, 0, 0, 0, 0, 4, 0, 0, 2, 2]
    )]
    fn test_fixed_size_pdus(#[case] pdu: Pdu, #[case] expected: [u8; 10]) {
        assert_eq!(to_bytes(&pdu).as_ref(), &expected);
    }

    #[test]
    fn test_p_data_tf_bytes() {
        let pdu = Pdu::PData(vec![
            PresentationDataValue {
                presentation_context_id: 1,
                kind: PdvKind::Command,
                is_last: true,
                data: Bytes::from_static(&[0xAA, 0xBB]),
            },
            PresentationDataValue {
                presentation_context_id: 1,
                kind: PdvKind::Data,
                is_last: false,
                data: Bytes::from_static(&[0xCC]),
            },
        ]);
        let mut buf = to_bytes(&pdu);
        #[rustfmt::skip]
        let expected = [
            0x04, 0x00, 0x00, 0x00, 0x00, 0x0F,
            0x00, 0x00, 0x00, 0x04, 0x01, 0x03, 0xAA, 0xBB,
            0x00, 0x00, 0x00, 0x03, 0x01, 0x00, 0xCC,
        ];
        assert_eq!(buf.as_ref(), &expected);
        assert_eq!(decode_all(&mut buf).unwrap(), Some(pdu));
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let full = to_bytes(&Pdu::ReleaseRq);
        let mut codec = PduCodec::default();
        let mut buf = BytesMut::from(&full[..3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[3..8]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[8..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Pdu::ReleaseRq));
    }

    #[test]
    fn test_oversized_header_checked_once_per_frame() {
        let pdu = Pdu::PData(vec![PresentationDataValue {
            presentation_context_id: 1,
            kind: PdvKind::Data,
            is_last: true,
            data: Bytes::from(vec![0u8; 5000]),
        }]);
        let full = to_bytes(&pdu);
        let mut codec = PduCodec::new(MINIMUM_PDU_LENGTH, false);
        let mut buf = BytesMut::from(&full[..100]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.frame_length, Some(full.len()));
        // a stricter limit does not re-judge the frame already being read
        codec.strict = true;
        buf.extend_from_slice(&full[100..200]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[200..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(pdu));
        assert_eq!(codec.frame_length, None);
        // the next frame gets its own check
        let mut buf = to_bytes(&Pdu::PData(vec![PresentationDataValue {
            presentation_context_id: 1,
            kind: PdvKind::Data,
            is_last: true,
            data: Bytes::from(vec![0u8; 5000]),
        }]));
        assert!(codec.decode(&mut buf).is_err());
    }

    #[rstest]
    fn test_inconsistent_item_length_is_malformed(associate_rq: AssociateRq) {
        let mut buf = to_bytes(&Pdu::AssociateRq(associate_rq));
        // inflate the application context item length beyond the PDU
        buf[76] = 0xFF;
        assert!(matches!(decode_all(&mut buf), Err(DimseError::MalformedPdu(_))));
    }

    #[test]
    fn test_pdv_overrunning_pdu_is_malformed() {
        #[rustfmt::skip]
        let bytes = [
            0x04, 0x00, 0x00, 0x00, 0x00, 0x07,
            0x00, 0x00, 0x00, 0x09, 0x01, 0x03, 0xAA,
        ];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(decode_all(&mut buf), Err(DimseError::MalformedPdu(_))));
    }

    #[test]
    fn test_unknown_pdu_type_is_malformed() {
        let mut buf = BytesMut::from(&[0x09, 0x00, 0x00, 0x00, 0x00, 0x00][..]);
        assert!(matches!(decode_all(&mut buf), Err(DimseError::MalformedPdu(_))));
    }

    #[rstest]
    #[case(true, true)]
    #[case(false, false)]
    fn test_oversized_p_data(#[case] strict: bool, #[case] should_fail: bool) {
        let pdu = Pdu::PData(vec![PresentationDataValue {
            presentation_context_id: 1,
            kind: PdvKind::Data,
            is_last: true,
            data: Bytes::from(vec![0u8; 5000]),
        }]);
        let mut buf = to_bytes(&pdu);
        let result = PduCodec::new(MINIMUM_PDU_LENGTH, strict).decode(&mut buf);
        assert_eq!(result.is_err(), should_fail);
    }
}
