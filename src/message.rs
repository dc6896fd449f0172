use std::fmt;

use bytes::Bytes;

use crate::command::{CommandField, CommandSet};
use crate::status::Status;

/// (0000,0700) Priority MEDIUM.
pub const PRIORITY_MEDIUM: u16 = 0x0000;

/// A complete DIMSE message: a command set and the dataset which followed it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    /// Dataset bytes, encoded in the transfer syntax of the presentation context.
    pub data: Option<Bytes>,
}

impl DimseMessage {
    pub fn new(presentation_context_id: u8, command: CommandSet, data: Option<Bytes>) -> Self {
        Self {
            presentation_context_id,
            command,
            data,
        }
    }

    pub fn field(&self) -> CommandField {
        self.command.command_field
    }

    /// Status of a response. Requests have none, and neither do broken responses:
    /// those are reported as processing failures.
    pub fn status(&self) -> Status {
        self.command.status.unwrap_or(Status::PROCESSING_FAILURE)
    }

    pub fn sub_operations(&self) -> SubOperationCounts {
        SubOperationCounts {
            remaining: self.command.remaining_sub_operations.unwrap_or(0),
            completed: self.command.completed_sub_operations.unwrap_or(0),
            failed: self.command.failed_sub_operations.unwrap_or(0),
            warning: self.command.warning_sub_operations.unwrap_or(0),
        }
    }
}

/// Number of C-STORE sub-operations of a C-MOVE or C-GET, per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperationCounts {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

impl SubOperationCounts {
    pub fn new(total: usize) -> Self {
        Self {
            remaining: saturate(total),
            ..Default::default()
        }
    }

    /// Account for one sub-operation which ended with the given status.
    pub fn record(&mut self, status: Status) {
        self.remaining = self.remaining.saturating_sub(1);
        if status.is_success() {
            self.completed += 1;
        } else if status.is_warning() {
            self.warning += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Overall status of a completed retrieve, per PS3.4 C.4.2.1.5 and C.4.3.1.5.
    pub fn final_status(&self) -> Status {
        if self.failed == 0 && self.warning == 0 {
            Status::SUCCESS
        } else if self.completed == 0 && self.warning == 0 {
            Status::SUB_OPERATIONS_FAILED
        } else {
            Status::SUB_OPERATIONS_WARNING
        }
    }

    fn write_to(&self, cmd: &mut CommandSet, with_remaining: bool) {
        cmd.remaining_sub_operations = with_remaining.then_some(self.remaining);
        cmd.completed_sub_operations = Some(self.completed);
        cmd.failed_sub_operations = Some(self.failed);
        cmd.warning_sub_operations = Some(self.warning);
    }
}

fn saturate(n: usize) -> u16 {
    u16::try_from(n).unwrap_or(u16::MAX)
}

impl fmt::Display for SubOperationCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} remaining, {} completed, {} failed, {} warning",
            self.remaining, self.completed, self.failed, self.warning
        )
    }
}

/// Final outcome of a C-MOVE or C-GET as seen by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveOutcome {
    pub status: Status,
    pub counts: SubOperationCounts,
}

pub fn echo_rq() -> CommandSet {
    let mut cmd = CommandSet::new(CommandField::CEchoRq);
    cmd.affected_sop_class_uid = Some(crate::uids::VERIFICATION.to_string());
    cmd
}

pub fn store_rq(sop_class_uid: &str, sop_instance_uid: &str) -> CommandSet {
    let mut cmd = CommandSet::new(CommandField::CStoreRq);
    cmd.affected_sop_class_uid = Some(sop_class_uid.to_string());
    cmd.affected_sop_instance_uid = Some(sop_instance_uid.to_string());
    cmd.priority = Some(PRIORITY_MEDIUM);
    cmd.has_dataset = true;
    cmd
}

fn query_rq(field: CommandField, sop_class_uid: &str) -> CommandSet {
    let mut cmd = CommandSet::new(field);
    cmd.affected_sop_class_uid = Some(sop_class_uid.to_string());
    cmd.priority = Some(PRIORITY_MEDIUM);
    cmd.has_dataset = true;
    cmd
}

pub fn find_rq(sop_class_uid: &str) -> CommandSet {
    query_rq(CommandField::CFindRq, sop_class_uid)
}

pub fn get_rq(sop_class_uid: &str) -> CommandSet {
    query_rq(CommandField::CGetRq, sop_class_uid)
}

pub fn move_rq(sop_class_uid: &str, destination: &str) -> CommandSet {
    let mut cmd = query_rq(CommandField::CMoveRq, sop_class_uid);
    cmd.move_destination = Some(destination.to_string());
    cmd
}

pub fn cancel_rq(message_id: u16) -> CommandSet {
    let mut cmd = CommandSet::new(CommandField::CCancelRq);
    cmd.message_id_being_responded_to = Some(message_id);
    cmd
}

pub fn n_action_rq(sop_class_uid: &str, sop_instance_uid: &str, action_type_id: u16) -> CommandSet {
    let mut cmd = CommandSet::new(CommandField::NActionRq);
    cmd.requested_sop_class_uid = Some(sop_class_uid.to_string());
    cmd.requested_sop_instance_uid = Some(sop_instance_uid.to_string());
    cmd.action_type_id = Some(action_type_id);
    cmd.has_dataset = true;
    cmd
}

pub fn n_event_report_rq(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    event_type_id: u16,
) -> CommandSet {
    let mut cmd = CommandSet::new(CommandField::NEventReportRq);
    cmd.affected_sop_class_uid = Some(sop_class_uid.to_string());
    cmd.affected_sop_instance_uid = Some(sop_instance_uid.to_string());
    cmd.event_type_id = Some(event_type_id);
    cmd.has_dataset = true;
    cmd
}

/// A response to `request` carrying `status` and no dataset.
pub fn response_to(request: &CommandSet, status: Status) -> CommandSet {
    let field = request
        .command_field
        .response()
        .unwrap_or(request.command_field);
    let mut cmd = CommandSet::new(field);
    cmd.message_id_being_responded_to = request.message_id;
    cmd.affected_sop_class_uid = request.sop_class_uid().map(str::to_string);
    cmd.status = Some(status);
    match field {
        CommandField::CStoreRsp | CommandField::NActionRsp | CommandField::NEventReportRsp => {
            cmd.affected_sop_instance_uid = request.sop_instance_uid().map(str::to_string);
        }
        _ => (),
    }
    cmd.action_type_id = request.action_type_id;
    cmd.event_type_id = request.event_type_id;
    cmd
}

/// A C-MOVE or C-GET response carrying sub-operation counts. Final responses omit the
/// number of remaining sub-operations.
pub fn retrieve_response(
    request: &CommandSet,
    status: Status,
    counts: &SubOperationCounts,
) -> CommandSet {
    let mut cmd = response_to(request, status);
    counts.write_to(&mut cmd, status.is_pending());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(4, 0, 0, Status::SUCCESS)]
    #[case(0, 0, 0, Status::SUCCESS)]
    #[case(2, 2, 0, Status::SUB_OPERATIONS_WARNING)]
    #[case(0, 3, 0, Status::SUB_OPERATIONS_FAILED)]
    #[case(0, 0, 2, Status::SUB_OPERATIONS_WARNING)]
    #[case(0, 1, 1, Status::SUB_OPERATIONS_WARNING)]
    fn test_final_status(
        #[case] completed: u16,
        #[case] failed: u16,
        #[case] warning: u16,
        #[case] expected: Status,
    ) {
        let counts = SubOperationCounts {
            remaining: 0,
            completed,
            failed,
            warning,
        };
        assert_eq!(counts.final_status(), expected)
    }

    #[test]
    fn test_record() {
        let mut counts = SubOperationCounts::new(3);
        counts.record(Status::SUCCESS);
        counts.record(Status::COERCION_OF_DATA_ELEMENTS);
        counts.record(Status::OUT_OF_RESOURCES);
        assert_eq!(
            counts,
            SubOperationCounts {
                remaining: 0,
                completed: 1,
                failed: 1,
                warning: 1
            }
        )
    }

    #[test]
    fn test_store_response_echoes_identifiers() {
        let mut rq = store_rq(crate::uids::CT_IMAGE_STORAGE, "1.2.3.4");
        rq.message_id = Some(9);
        let rsp = response_to(&rq, Status::SUCCESS);
        assert_eq!(rsp.command_field, CommandField::CStoreRsp);
        assert_eq!(rsp.message_id_being_responded_to, Some(9));
        assert_eq!(rsp.affected_sop_instance_uid.as_deref(), Some("1.2.3.4"));
        assert!(!rsp.has_dataset);
    }

    #[test]
    fn test_final_retrieve_response_omits_remaining() {
        let mut rq = move_rq(crate::uids::STUDY_ROOT_QR_MOVE, "DEST");
        rq.message_id = Some(1);
        let counts = SubOperationCounts::new(2);
        let pending = retrieve_response(&rq, Status::PENDING, &counts);
        assert_eq!(pending.remaining_sub_operations, Some(2));
        let done = retrieve_response(&rq, Status::SUCCESS, &counts);
        assert_eq!(done.remaining_sub_operations, None);
        assert_eq!(done.completed_sub_operations, Some(0));
    }
}
