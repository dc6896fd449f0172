use std::sync::{Arc, Once};
use std::time::Duration;

use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use oxidimse::{
    Acceptor, AeContext, AeTitle, Dataset, DimseError, ServiceRegistry, Target, Timeouts, uids,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static INIT_LOGGING: Once = Once::new();

pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        tracing::subscriber::set_global_default(
            tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .finish(),
        )
        .unwrap()
    })
}

pub fn test_timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_secs(5),
        request: Duration::from_secs(10),
        release: Duration::from_secs(5),
    }
}

/// An AE serving Verification, Storage, Query/Retrieve and Storage Commitment, which can also
/// send instances for C-MOVE and C-GET.
pub fn scp_ae(aet: &'static str) -> AeContext {
    let mut ae = AeContext::new(AeTitle::from_static(aet))
        .with_timeouts(test_timeouts())
        .with_scp(uids::VERIFICATION)
        .with_scp(uids::STORAGE_COMMITMENT_PUSH_MODEL);
    for model in uids::QR_FIND_MODELS
        .iter()
        .chain(uids::QR_MOVE_MODELS)
        .chain(uids::QR_GET_MODELS)
    {
        ae = ae.with_scp(*model);
    }
    for sop_class in uids::STORAGE_SOP_CLASSES {
        ae = ae.with_scp(*sop_class).with_scu(*sop_class);
    }
    ae
}

/// An AE requesting every service, able to receive C-GET sub-operations and storage
/// commitment reports.
pub fn scu_ae(aet: &'static str) -> AeContext {
    let mut ae = AeContext::new(AeTitle::from_static(aet))
        .with_timeouts(test_timeouts())
        .with_scu(uids::VERIFICATION)
        .with_scu(uids::STORAGE_COMMITMENT_PUSH_MODEL);
    for sop_class in uids::STORAGE_SOP_CLASSES {
        ae = ae.with_scu(*sop_class).with_scp(*sop_class);
    }
    ae
}

/// An acceptor running in the background.
pub struct Running {
    pub target: Target,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), DimseError>>,
}

pub async fn start(ae: AeContext, registry: ServiceRegistry) -> Running {
    let ae = Arc::new(ae);
    let acceptor = Acceptor::bind("127.0.0.1:0", Arc::clone(&ae), registry)
        .await
        .unwrap();
    let address = acceptor.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(acceptor.run(None, shutdown.clone()));
    Running {
        target: Target::new(ae.ae_title().clone(), address.to_string()),
        shutdown,
        handle,
    }
}

impl Running {
    /// Stop accepting and wait for every association to end.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

pub fn instance(
    patient_id: &str,
    study: &str,
    series: &str,
    sop_instance_uid: &str,
) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    Dataset::put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
    Dataset::put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
    Dataset::put_str(&mut obj, tags::PATIENT_ID, VR::LO, patient_id);
    Dataset::put_str(&mut obj, tags::PATIENT_NAME, VR::PN, "Doe^John");
    Dataset::put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, study);
    Dataset::put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, series);
    Dataset::put_str(&mut obj, tags::MODALITY, VR::CS, "CT");
    obj
}

/// Four CT instances of one patient, in two series of one study.
pub fn example_instances() -> Vec<InMemDicomObject> {
    vec![
        instance("P1", "1.2.3", "1.2.3.1", "1.2.3.1.1"),
        instance("P1", "1.2.3", "1.2.3.1", "1.2.3.1.2"),
        instance("P1", "1.2.3", "1.2.3.2", "1.2.3.2.1"),
        instance("P1", "1.2.3", "1.2.3.2", "1.2.3.2.2"),
    ]
}

/// Two CT instances of a second patient, in one series.
pub fn other_patient_instances() -> Vec<InMemDicomObject> {
    vec![
        instance("P2", "4.5.6", "4.5.6.1", "4.5.6.1.1"),
        instance("P2", "4.5.6", "4.5.6.1", "4.5.6.1.2"),
    ]
}

/// Assert that `stored` has exactly the attributes of `sent`, with the same VRs and values.
pub fn assert_same_attributes(sent: &InMemDicomObject, stored: &InMemDicomObject) {
    for element in sent {
        let tag = element.header().tag;
        let Some(other) = stored.get(tag) else {
            panic!("{tag} was not stored");
        };
        assert_eq!(other.header().vr, element.header().vr, "VR of {tag}");
        assert_eq!(
            Dataset::get_str(stored, tag),
            Dataset::get_str(sent, tag),
            "value of {tag}"
        );
    }
    assert_eq!(stored.iter().count(), sent.iter().count());
}

pub fn keys(patient_id: &str, unique_key: dicom::core::Tag) -> InMemDicomObject {
    let mut keys = InMemDicomObject::new_empty();
    Dataset::put_str(&mut keys, tags::PATIENT_ID, VR::LO, patient_id);
    Dataset::put_str(&mut keys, unique_key, VR::UI, "");
    keys
}
