use std::fmt;

/// A DIMSE status code, as carried by the (0000,0900) Status element of responses.
///
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

/// Broad category of a [Status].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const PENDING: Status = Status(0xFF00);
    /// Pending, with one or more optional keys not supported.
    pub const PENDING_WARNING: Status = Status(0xFF01);
    pub const CANCEL: Status = Status(0xFE00);

    pub const ATTRIBUTE_LIST_ERROR: Status = Status(0x0107);
    pub const COERCION_OF_DATA_ELEMENTS: Status = Status(0xB000);
    /// Sub-operations complete, one or more failures or warnings.
    pub const SUB_OPERATIONS_WARNING: Status = Status(0xB000);

    pub const PROCESSING_FAILURE: Status = Status(0x0110);
    pub const NO_SUCH_SOP_CLASS: Status = Status(0x0118);
    pub const MISSING_ATTRIBUTE: Status = Status(0x0120);
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    pub const NO_SUCH_ACTION_TYPE: Status = Status(0x0123);
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    pub const OUT_OF_RESOURCES: Status = Status(0xA700);
    /// Out of resources, unable to perform sub-operations.
    pub const SUB_OPERATIONS_FAILED: Status = Status(0xA702);
    pub const MOVE_DESTINATION_UNKNOWN: Status = Status(0xA801);
    pub const IDENTIFIER_DOES_NOT_MATCH: Status = Status(0xA900);
    pub const CANNOT_UNDERSTAND: Status = Status(0xC000);

    pub fn kind(self) -> StatusKind {
        match self.0 {
            0x0000 => StatusKind::Success,
            0xFF00 | 0xFF01 => StatusKind::Pending,
            0xFE00 => StatusKind::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusKind::Warning,
            _ => StatusKind::Failure,
        }
    }

    pub fn is_pending(self) -> bool {
        self.kind() == StatusKind::Pending
    }

    pub fn is_success(self) -> bool {
        self.kind() == StatusKind::Success
    }

    pub fn is_warning(self) -> bool {
        self.kind() == StatusKind::Warning
    }

    pub fn is_failure(self) -> bool {
        self.kind() == StatusKind::Failure
    }

    /// A final status which does not indicate failure or cancellation.
    pub fn is_good(self) -> bool {
        matches!(self.kind(), StatusKind::Success | StatusKind::Warning)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}H ({:?})", self.0, self.kind())
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        Status(value)
    }
}
