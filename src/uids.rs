//! Well-known UIDs used by the association and DIMSE layers.
//!
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part06/chapter_A.html>

/// DICOM Application Context Name
pub const APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";

/// Implementation Class UID sent in the User Information item.
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.10.1559.1";

/// Implementation Version Name sent in the User Information item.
pub const IMPLEMENTATION_VERSION_NAME: &str = "OXIDIMSE_010";

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// Transfer syntaxes every DICOM node is expected to understand.
pub const UNCOMPRESSED_TRANSFER_SYNTAXES: &[&str] =
    &[EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN];

pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// Storage Commitment Push Model SOP Class
pub const STORAGE_COMMITMENT_PUSH_MODEL: &str = "1.2.840.10008.1.20.1";

/// Well-known SOP Instance of the Storage Commitment Push Model.
pub const STORAGE_COMMITMENT_PUSH_MODEL_INSTANCE: &str = "1.2.840.10008.1.20.1.1";

pub const PATIENT_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
pub const PATIENT_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";
pub const PATIENT_ROOT_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.1.3";
pub const STUDY_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
pub const STUDY_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
pub const STUDY_ROOT_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";

pub const QR_FIND_MODELS: &[&str] = &[PATIENT_ROOT_QR_FIND, STUDY_ROOT_QR_FIND];
pub const QR_MOVE_MODELS: &[&str] = &[PATIENT_ROOT_QR_MOVE, STUDY_ROOT_QR_MOVE];
pub const QR_GET_MODELS: &[&str] = &[PATIENT_ROOT_QR_GET, STUDY_ROOT_QR_GET];

pub const COMPUTED_RADIOGRAPHY_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.1";
pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
pub const ULTRASOUND_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.6.1";
pub const SECONDARY_CAPTURE_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
pub const DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.1";
pub const ENHANCED_SR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.88.22";
pub const ENCAPSULATED_PDF_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.104.1";

/// Storage SOP classes offered by default by the storage SCP and proposed by C-GET.
pub const STORAGE_SOP_CLASSES: &[&str] = &[
    COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    CT_IMAGE_STORAGE,
    MR_IMAGE_STORAGE,
    ULTRASOUND_IMAGE_STORAGE,
    SECONDARY_CAPTURE_IMAGE_STORAGE,
    ENHANCED_SR_STORAGE,
    ENCAPSULATED_PDF_STORAGE,
];

/// Whether a transfer syntax is one of the uncompressed little endian ones.
pub fn is_uncompressed(transfer_syntax: &str) -> bool {
    UNCOMPRESSED_TRANSFER_SYNTAXES.contains(&transfer_syntax)
}
