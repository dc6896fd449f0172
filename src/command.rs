//! DIMSE command set encoding.
//!
//! Command sets are always Implicit VR Little Endian, whatever the transfer syntax of the
//! presentation context, and start with the (0000,0000) Command Group Length.
//!
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_E.html>

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DimseError;
use crate::status::Status;

/// (0000,0800) value meaning "no dataset follows".
const NO_DATASET: u16 = 0x0101;

/// (0000,0800) value we send when a dataset follows. Any value but [NO_DATASET] means the same.
const DATASET_PRESENT: u16 = 0x0000;

mod element {
    pub const GROUP_LENGTH: u16 = 0x0000;
    pub const AFFECTED_SOP_CLASS_UID: u16 = 0x0002;
    pub const REQUESTED_SOP_CLASS_UID: u16 = 0x0003;
    pub const COMMAND_FIELD: u16 = 0x0100;
    pub const MESSAGE_ID: u16 = 0x0110;
    pub const MESSAGE_ID_BEING_RESPONDED_TO: u16 = 0x0120;
    pub const MOVE_DESTINATION: u16 = 0x0600;
    pub const PRIORITY: u16 = 0x0700;
    pub const COMMAND_DATA_SET_TYPE: u16 = 0x0800;
    pub const STATUS: u16 = 0x0900;
    pub const ERROR_COMMENT: u16 = 0x0902;
    pub const AFFECTED_SOP_INSTANCE_UID: u16 = 0x1000;
    pub const REQUESTED_SOP_INSTANCE_UID: u16 = 0x1001;
    pub const EVENT_TYPE_ID: u16 = 0x1002;
    pub const ACTION_TYPE_ID: u16 = 0x1008;
    pub const REMAINING_SUB_OPERATIONS: u16 = 0x1020;
    pub const COMPLETED_SUB_OPERATIONS: u16 = 0x1021;
    pub const FAILED_SUB_OPERATIONS: u16 = 0x1022;
    pub const WARNING_SUB_OPERATIONS: u16 = 0x1023;
    pub const MOVE_ORIGINATOR_AE_TITLE: u16 = 0x1030;
    pub const MOVE_ORIGINATOR_MESSAGE_ID: u16 = 0x1031;
}

/// Value of the (0000,0100) Command Field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    NEventReportRq,
    NEventReportRsp,
    NActionRq,
    NActionRsp,
    CCancelRq,
}

impl CommandField {
    pub fn code(self) -> u16 {
        match self {
            Self::CStoreRq => 0x0001,
            Self::CStoreRsp => 0x8001,
            Self::CGetRq => 0x0010,
            Self::CGetRsp => 0x8010,
            Self::CFindRq => 0x0020,
            Self::CFindRsp => 0x8020,
            Self::CMoveRq => 0x0021,
            Self::CMoveRsp => 0x8021,
            Self::CEchoRq => 0x0030,
            Self::CEchoRsp => 0x8030,
            Self::NEventReportRq => 0x0100,
            Self::NEventReportRsp => 0x8100,
            Self::NActionRq => 0x0130,
            Self::NActionRsp => 0x8130,
            Self::CCancelRq => 0x0FFF,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let field = match code {
            0x0001 => Self::CStoreRq,
            0x8001 => Self::CStoreRsp,
            0x0010 => Self::CGetRq,
            0x8010 => Self::CGetRsp,
            0x0020 => Self::CFindRq,
            0x8020 => Self::CFindRsp,
            0x0021 => Self::CMoveRq,
            0x8021 => Self::CMoveRsp,
            0x0030 => Self::CEchoRq,
            0x8030 => Self::CEchoRsp,
            0x0100 => Self::NEventReportRq,
            0x8100 => Self::NEventReportRsp,
            0x0130 => Self::NActionRq,
            0x8130 => Self::NActionRsp,
            0x0FFF => Self::CCancelRq,
            _ => return None,
        };
        Some(field)
    }

    /// Responses have the high bit of the command field set.
    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }

    /// The response command field matching a request command field.
    pub fn response(self) -> Option<Self> {
        Self::from_code(self.code() | 0x8000).filter(|_| !self.is_response())
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CStoreRq => "C-STORE-RQ",
            Self::CStoreRsp => "C-STORE-RSP",
            Self::CGetRq => "C-GET-RQ",
            Self::CGetRsp => "C-GET-RSP",
            Self::CFindRq => "C-FIND-RQ",
            Self::CFindRsp => "C-FIND-RSP",
            Self::CMoveRq => "C-MOVE-RQ",
            Self::CMoveRsp => "C-MOVE-RSP",
            Self::CEchoRq => "C-ECHO-RQ",
            Self::CEchoRsp => "C-ECHO-RSP",
            Self::NEventReportRq => "N-EVENT-REPORT-RQ",
            Self::NEventReportRsp => "N-EVENT-REPORT-RSP",
            Self::NActionRq => "N-ACTION-RQ",
            Self::NActionRsp => "N-ACTION-RSP",
            Self::CCancelRq => "C-CANCEL-RQ",
        }
    }
}

impl std::fmt::Display for CommandField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded DIMSE command set. Only the elements used by the supported services are modeled,
/// other elements of group 0000 are ignored when decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    pub command_field: CommandField,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub requested_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub requested_sop_instance_uid: Option<String>,
    pub priority: Option<u16>,
    pub has_dataset: bool,
    pub status: Option<Status>,
    pub error_comment: Option<String>,
    pub move_destination: Option<String>,
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
    pub event_type_id: Option<u16>,
    pub action_type_id: Option<u16>,
    pub remaining_sub_operations: Option<u16>,
    pub completed_sub_operations: Option<u16>,
    pub failed_sub_operations: Option<u16>,
    pub warning_sub_operations: Option<u16>,
}

impl CommandSet {
    pub fn new(command_field: CommandField) -> Self {
        Self {
            command_field,
            message_id: None,
            message_id_being_responded_to: None,
            affected_sop_class_uid: None,
            requested_sop_class_uid: None,
            affected_sop_instance_uid: None,
            requested_sop_instance_uid: None,
            priority: None,
            has_dataset: false,
            status: None,
            error_comment: None,
            move_destination: None,
            move_originator_ae_title: None,
            move_originator_message_id: None,
            event_type_id: None,
            action_type_id: None,
            remaining_sub_operations: None,
            completed_sub_operations: None,
            failed_sub_operations: None,
            warning_sub_operations: None,
        }
    }

    /// The SOP class this command is about: affected for C-services and N-EVENT-REPORT,
    /// requested for N-ACTION.
    pub fn sop_class_uid(&self) -> Option<&str> {
        self.affected_sop_class_uid
            .as_deref()
            .or(self.requested_sop_class_uid.as_deref())
    }

    pub fn sop_instance_uid(&self) -> Option<&str> {
        self.affected_sop_instance_uid
            .as_deref()
            .or(self.requested_sop_instance_uid.as_deref())
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        use element::*;
        put_uid(&mut body, AFFECTED_SOP_CLASS_UID, &self.affected_sop_class_uid);
        put_uid(&mut body, REQUESTED_SOP_CLASS_UID, &self.requested_sop_class_uid);
        put_us(&mut body, COMMAND_FIELD, Some(self.command_field.code()));
        put_us(&mut body, MESSAGE_ID, self.message_id);
        put_us(&mut body, MESSAGE_ID_BEING_RESPONDED_TO, self.message_id_being_responded_to);
        put_text(&mut body, MOVE_DESTINATION, &self.move_destination);
        put_us(&mut body, PRIORITY, self.priority);
        let data_set_type = if self.has_dataset {
            DATASET_PRESENT
        } else {
            NO_DATASET
        };
        put_us(&mut body, COMMAND_DATA_SET_TYPE, Some(data_set_type));
        put_us(&mut body, STATUS, self.status.map(|s| s.0));
        put_text(&mut body, ERROR_COMMENT, &self.error_comment);
        put_uid(&mut body, AFFECTED_SOP_INSTANCE_UID, &self.affected_sop_instance_uid);
        put_uid(&mut body, REQUESTED_SOP_INSTANCE_UID, &self.requested_sop_instance_uid);
        put_us(&mut body, EVENT_TYPE_ID, self.event_type_id);
        put_us(&mut body, ACTION_TYPE_ID, self.action_type_id);
        put_us(&mut body, REMAINING_SUB_OPERATIONS, self.remaining_sub_operations);
        put_us(&mut body, COMPLETED_SUB_OPERATIONS, self.completed_sub_operations);
        put_us(&mut body, FAILED_SUB_OPERATIONS, self.failed_sub_operations);
        put_us(&mut body, WARNING_SUB_OPERATIONS, self.warning_sub_operations);
        put_text(&mut body, MOVE_ORIGINATOR_AE_TITLE, &self.move_originator_ae_title);
        put_us(&mut body, MOVE_ORIGINATOR_MESSAGE_ID, self.move_originator_message_id);

        let mut out = BytesMut::with_capacity(12 + body.len());
        put_header(&mut out, GROUP_LENGTH, 4);
        out.put_u32_le(body.len() as u32);
        out.put_slice(&body);
        out.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, DimseError> {
        let mut field = None;
        let mut cmd = CommandSet::new(CommandField::CEchoRq);
        let mut data_set_type = NO_DATASET;
        while buf.has_remaining() {
            if buf.remaining() < 8 {
                return Err(invalid("truncated element header"));
            }
            let group = buf.get_u16_le();
            let elem = buf.get_u16_le();
            let length = buf.get_u32_le() as usize;
            if length > buf.remaining() {
                return Err(invalid(format!(
                    "element ({group:04X},{elem:04X}) of length {length} overruns the command set"
                )));
            }
            let value = buf.split_to(length);
            if group != 0x0000 {
                return Err(invalid(format!(
                    "element ({group:04X},{elem:04X}) outside of the command group"
                )));
            }
            use element::*;
            match elem {
                AFFECTED_SOP_CLASS_UID => cmd.affected_sop_class_uid = Some(text(&value)?),
                REQUESTED_SOP_CLASS_UID => cmd.requested_sop_class_uid = Some(text(&value)?),
                COMMAND_FIELD => {
                    let code = us(elem, &value)?;
                    field = Some(CommandField::from_code(code).ok_or_else(|| {
                        invalid(format!("unknown command field {code:04X}H"))
                    })?);
                }
                MESSAGE_ID => cmd.message_id = Some(us(elem, &value)?),
                MESSAGE_ID_BEING_RESPONDED_TO => {
                    cmd.message_id_being_responded_to = Some(us(elem, &value)?)
                }
                MOVE_DESTINATION => cmd.move_destination = Some(text(&value)?),
                PRIORITY => cmd.priority = Some(us(elem, &value)?),
                COMMAND_DATA_SET_TYPE => data_set_type = us(elem, &value)?,
                STATUS => cmd.status = Some(Status(us(elem, &value)?)),
                ERROR_COMMENT => cmd.error_comment = Some(text(&value)?),
                AFFECTED_SOP_INSTANCE_UID => cmd.affected_sop_instance_uid = Some(text(&value)?),
                REQUESTED_SOP_INSTANCE_UID => {
                    cmd.requested_sop_instance_uid = Some(text(&value)?)
                }
                EVENT_TYPE_ID => cmd.event_type_id = Some(us(elem, &value)?),
                ACTION_TYPE_ID => cmd.action_type_id = Some(us(elem, &value)?),
                REMAINING_SUB_OPERATIONS => cmd.remaining_sub_operations = Some(us(elem, &value)?),
                COMPLETED_SUB_OPERATIONS => cmd.completed_sub_operations = Some(us(elem, &value)?),
                FAILED_SUB_OPERATIONS => cmd.failed_sub_operations = Some(us(elem, &value)?),
                WARNING_SUB_OPERATIONS => cmd.warning_sub_operations = Some(us(elem, &value)?),
                MOVE_ORIGINATOR_AE_TITLE => cmd.move_originator_ae_title = Some(text(&value)?),
                MOVE_ORIGINATOR_MESSAGE_ID => {
                    cmd.move_originator_message_id = Some(us(elem, &value)?)
                }
                _ => (),
            }
        }
        cmd.command_field = field.ok_or_else(|| invalid("missing (0000,0100) Command Field"))?;
        cmd.has_dataset = data_set_type != NO_DATASET;
        Ok(cmd)
    }
}

fn invalid(msg: impl Into<String>) -> DimseError {
    DimseError::InvalidCommand(msg.into())
}

fn put_header(dst: &mut BytesMut, elem: u16, length: u32) {
    dst.put_u16_le(0x0000);
    dst.put_u16_le(elem);
    dst.put_u32_le(length);
}

fn put_us(dst: &mut BytesMut, elem: u16, value: Option<u16>) {
    if let Some(value) = value {
        put_header(dst, elem, 2);
        dst.put_u16_le(value);
    }
}

/// UI values are padded with NUL to an even length.
fn put_uid(dst: &mut BytesMut, elem: u16, value: &Option<String>) {
    put_padded(dst, elem, value, b'\0')
}

/// AE and LO values are padded with a space to an even length.
fn put_text(dst: &mut BytesMut, elem: u16, value: &Option<String>) {
    put_padded(dst, elem, value, b' ')
}

fn put_padded(dst: &mut BytesMut, elem: u16, value: &Option<String>, pad: u8) {
    if let Some(value) = value {
        let odd = value.len() % 2 == 1;
        put_header(dst, elem, (value.len() + odd as usize) as u32);
        dst.put_slice(value.as_bytes());
        if odd {
            dst.put_u8(pad);
        }
    }
}

fn us(elem: u16, value: &[u8]) -> Result<u16, DimseError> {
    match value {
        [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(invalid(format!(
            "element (0000,{elem:04X}) must be 2 bytes long, got {}",
            value.len()
        ))),
    }
}

fn text(value: &[u8]) -> Result<String, DimseError> {
    std::str::from_utf8(value)
        .map(|s| s.trim_matches(|c| c == ' ' || c == '\0').to_string())
        .map_err(|_| invalid("string element is not valid ASCII"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[test]
    fn test_echo_request_bytes() {
        let mut cmd = CommandSet::new(CommandField::CEchoRq);
        cmd.affected_sop_class_uid = Some(crate::uids::VERIFICATION.to_string());
        cmd.message_id = Some(7);
        #[rustfmt::skip]
        let expected: &[u8] = &[
            // group length = 56
            0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x38, 0x00, 0x00, 0x00,
            // affected SOP class UID "1.2.840.10008.1.1\0"
            0x00, 0x00, 0x02, 0x00, 0x12, 0x00, 0x00, 0x00,
            b'1', b'.', b'2', b'.', b'8', b'4', b'0', b'.', b'1',
            b'0', b'0', b'0', b'8', b'.', b'1', b'.', b'1', 0x00,
            // command field
            0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x30, 0x00,
            // message ID
            0x00, 0x00, 0x10, 0x01, 0x02, 0x00, 0x00, 0x00, 0x07, 0x00,
            // command data set type
            0x00, 0x00, 0x00, 0x08, 0x02, 0x00, 0x00, 0x00, 0x01, 0x01,
        ];
        assert_eq!(cmd.encode().as_ref(), expected);
    }

    #[test]
    fn test_move_response_decodes_to_same() {
        let mut cmd = CommandSet::new(CommandField::CMoveRsp);
        cmd.affected_sop_class_uid = Some(crate::uids::STUDY_ROOT_QR_MOVE.to_string());
        cmd.message_id_being_responded_to = Some(3);
        cmd.status = Some(Status::SUB_OPERATIONS_WARNING);
        cmd.remaining_sub_operations = Some(0);
        cmd.completed_sub_operations = Some(2);
        cmd.failed_sub_operations = Some(2);
        cmd.warning_sub_operations = Some(0);
        cmd.error_comment = Some("two failed".to_string());
        assert_eq!(CommandSet::decode(cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn test_odd_length_strings_are_padded() {
        let mut cmd = CommandSet::new(CommandField::CMoveRq);
        cmd.move_destination = Some("DEST".to_string());
        cmd.affected_sop_instance_uid = Some("1.2.3".to_string());
        let bytes = cmd.encode();
        assert_eq!(bytes.len() % 2, 0);
        let decoded = CommandSet::decode(bytes).unwrap();
        assert_eq!(decoded.affected_sop_instance_uid.as_deref(), Some("1.2.3"));
        assert_eq!(decoded.move_destination.as_deref(), Some("DEST"));
    }

    #[rstest]
    #[case(CommandField::CStoreRq, Some(CommandField::CStoreRsp))]
    #[case(CommandField::NActionRq, Some(CommandField::NActionRsp))]
    #[case(CommandField::CFindRsp, None)]
    #[case(CommandField::CCancelRq, None)]
    fn test_response_field(#[case] request: CommandField, #[case] expected: Option<CommandField>) {
        assert_eq!(request.response(), expected)
    }

    #[test]
    fn test_unknown_elements_are_skipped() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 0x0005, 2);
        buf.put_u16_le(0xABCD);
        put_us(&mut buf, element::COMMAND_FIELD, Some(0x0030));
        put_us(&mut buf, element::COMMAND_DATA_SET_TYPE, Some(0x0102));
        let cmd = CommandSet::decode(buf.freeze()).unwrap();
        assert_eq!(cmd.command_field, CommandField::CEchoRq);
        assert!(cmd.has_dataset);
    }

    #[rstest]
    #[case(&[0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x99, 0x99])]
    #[case(&[0x00, 0x00, 0x10, 0x01, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00])]
    #[case(&[0x00, 0x00, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x30, 0x00])]
    #[case(&[0x00, 0x00, 0x00, 0x01])]
    fn test_invalid_command_sets(#[case] bytes: &'static [u8]) {
        assert!(matches!(
            CommandSet::decode(Bytes::from_static(bytes)),
            Err(DimseError::InvalidCommand(_))
        ))
    }
}
