//! Instances stored as DICOM files in a directory.

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use futures::future::ready;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use regex::Regex;

use crate::dataset::{Dataset, QueryLevel, SopReference, failure_reason, matches_keys, project};
use crate::error::{PersistError, QueryError};
use crate::services::{CommitProcessor, QuerySource, StorePersister, StoreRequest};
use crate::status::Status;

/// Writes every received instance to `<root>/<SOPInstanceUID>.dcm` and answers queries by
/// reading those files back.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: Utf8PathBuf,
}

static UNSAFE_CHARS: OnceLock<Option<Regex>> = OnceLock::new();

/// File name of an instance. Characters other than ASCII letters, digits, `.` and `-` are
/// replaced with `_`, NUL padding is dropped.
fn file_name(sop_instance_uid: &str) -> String {
    let uid = sop_instance_uid.replace('\0', "");
    let uid = uid.trim();
    match UNSAFE_CHARS.get_or_init(|| Regex::new(r"[^A-Za-z0-9\.\-]+").ok()) {
        Some(re) => format!("{}.dcm", re.replace_all(uid, "_")),
        None => format!("{uid}.dcm"),
    }
}

impl DirectoryStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path_of(&self, sop_instance_uid: &str) -> Utf8PathBuf {
        self.root.join(file_name(sop_instance_uid))
    }

    /// Every readable instance under the root directory, lazily.
    fn scan(&self) -> BoxStream<'static, Result<InMemDicomObject, QueryError>> {
        let root = self.root.clone();
        stream::once(list_files(root))
            .map_ok(|paths| {
                stream::iter(paths)
                    .then(read_instance)
                    .try_filter_map(|i| ready(Ok(i)))
            })
            .try_flatten()
            .boxed()
    }
}

async fn list_files(root: Utf8PathBuf) -> Result<Vec<Utf8PathBuf>, QueryError> {
    let mut entries = match fs_err::tokio::read_dir(&root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Ok(path) = Utf8PathBuf::try_from(entry.path())
            && path.extension() == Some("dcm")
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Read one instance. Files which are not DICOM are skipped.
async fn read_instance(path: Utf8PathBuf) -> Result<Option<InMemDicomObject>, QueryError> {
    let opened = tokio::task::spawn_blocking(move || {
        dicom::object::open_file(&path).map_err(|e| (path, e.to_string()))
    })
    .await
    .map_err(|e| QueryError::new(e.to_string()))?;
    match opened {
        Ok(file) => Ok(Some(file.into_inner())),
        Err((path, e)) => {
            tracing::warn!(path = path.as_str(), error = %e, "skipping unreadable file");
            Ok(None)
        }
    }
}

fn write_instance(
    path: &Utf8Path,
    request: StoreRequest<InMemDicomObject>,
) -> Result<(), PersistError> {
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(request.sop_class_uid.as_str())
        .media_storage_sop_instance_uid(request.sop_instance_uid.as_str())
        .transfer_syntax(request.transfer_syntax.as_str())
        .build()
        .map_err(|e| PersistError::new(e.to_string()).with_status(Status::CANNOT_UNDERSTAND))?;
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    request
        .dataset
        .with_exact_meta(meta)
        .write_to_file(path)
        .map_err(|e| PersistError::new(e.to_string()).with_status(Status::OUT_OF_RESOURCES))
}

#[async_trait]
impl StorePersister<InMemDicomObject> for DirectoryStore {
    async fn persist(
        &self,
        request: StoreRequest<InMemDicomObject>,
    ) -> Result<String, PersistError> {
        if request.sop_instance_uid.is_empty() {
            return Err(PersistError::new("missing Affected SOP Instance UID")
                .with_status(Status::CANNOT_UNDERSTAND));
        }
        let uid = request.sop_instance_uid.clone();
        let path = self.path_of(&uid);
        let written = path.clone();
        tokio::task::spawn_blocking(move || write_instance(&written, request))
            .await
            .map_err(|e| PersistError::new(e.to_string()))??;
        tracing::info!(event = "storage", path = path.as_str());
        Ok(uid)
    }
}

impl QuerySource<InMemDicomObject> for DirectoryStore {
    fn find(
        &self,
        keys: &InMemDicomObject,
        level: QueryLevel,
    ) -> BoxStream<'static, Result<InMemDicomObject, QueryError>> {
        let keys = keys.clone();
        let unique_key = level.unique_key();
        let mut seen = HashSet::new();
        self.scan()
            .try_filter_map(move |instance| {
                let wanted =
                    matches_keys(&instance, &keys) && seen.insert(instance.get_str(unique_key));
                ready(Ok(wanted.then(|| project(&instance, &keys))))
            })
            .boxed()
    }

    fn instances(
        &self,
        keys: &InMemDicomObject,
        _level: QueryLevel,
    ) -> BoxStream<'static, Result<InMemDicomObject, QueryError>> {
        let keys = keys.clone();
        self.scan()
            .try_filter(move |instance| ready(matches_keys(instance, &keys)))
            .boxed()
    }
}

#[async_trait]
impl CommitProcessor for DirectoryStore {
    async fn commit(&self, references: Vec<SopReference>) -> Vec<SopReference> {
        let mut results = Vec::with_capacity(references.len());
        for reference in references {
            let path = self.path_of(&reference.sop_instance_uid);
            if !path.is_file() {
                results.push(reference.failed(failure_reason::NO_SUCH_OBJECT_INSTANCE));
                continue;
            }
            let stored = match read_instance(path).await {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::error!(error = %e, "could not check instance");
                    results.push(reference.failed(failure_reason::PROCESSING_FAILURE));
                    continue;
                }
            };
            let result = match stored.map(|i| i.sop_class_uid()) {
                None => reference.failed(failure_reason::NO_SUCH_OBJECT_INSTANCE),
                Some(Ok(class)) if class == reference.sop_class_uid => reference,
                Some(_) => reference.failed(failure_reason::CLASS_INSTANCE_CONFLICT),
            };
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ae_title::AeTitle;
    use crate::uids;
    use dicom::core::VR;
    use dicom::dictionary_std::tags;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    #[case("1.2.3", "1.2.3.dcm")]
    #[case("1.2.3\0", "1.2.3.dcm")]
    #[case("../etc/passwd", ".._etc_passwd.dcm")]
    fn test_file_name(#[case] uid: &str, #[case] expected: &str) {
        assert_eq!(file_name(uid), expected);
    }

    fn request(uid: &str) -> StoreRequest<InMemDicomObject> {
        let mut dataset = InMemDicomObject::new_empty();
        let sop_class_uid = uids::SECONDARY_CAPTURE_IMAGE_STORAGE;
        Dataset::put_str(&mut dataset, tags::SOP_CLASS_UID, VR::UI, sop_class_uid);
        Dataset::put_str(&mut dataset, tags::SOP_INSTANCE_UID, VR::UI, uid);
        Dataset::put_str(&mut dataset, tags::PATIENT_ID, VR::LO, "P1");
        StoreRequest {
            dataset,
            sop_class_uid: uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string(),
            sop_instance_uid: uid.to_string(),
            transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            calling_ae_title: AeTitle::from_static("SCU"),
            move_originator: None,
        }
    }

    #[tokio::test]
    async fn test_persist_then_query_and_commit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("files")).unwrap();
        let store = DirectoryStore::new(root);
        for uid in ["1.2.3.1", "1.2.3.2"] {
            assert_eq!(store.persist(request(uid)).await.unwrap(), uid);
        }
        assert!(store.path_of("1.2.3.1").is_file());

        let mut keys = InMemDicomObject::new_empty();
        Dataset::put_str(&mut keys, tags::QUERY_RETRIEVE_LEVEL, VR::CS, "IMAGE");
        Dataset::put_str(&mut keys, tags::PATIENT_ID, VR::LO, "P*");
        Dataset::put_str(&mut keys, tags::SOP_INSTANCE_UID, VR::UI, "");
        let found: Vec<_> = store.find(&keys, QueryLevel::Image).try_collect().await.unwrap();
        let uids: Vec<_> = found
            .iter()
            .map(|i| i.get_str(tags::SOP_INSTANCE_UID).unwrap())
            .collect();
        assert_eq!(uids, vec!["1.2.3.1", "1.2.3.2"]);

        let committed = store
            .commit(vec![
                SopReference::new(uids::SECONDARY_CAPTURE_IMAGE_STORAGE, "1.2.3.2"),
                SopReference::new(uids::SECONDARY_CAPTURE_IMAGE_STORAGE, "1.2.3.9"),
            ])
            .await;
        assert_eq!(committed[0].failure_reason, None);
        assert_eq!(
            committed[1].failure_reason,
            Some(failure_reason::NO_SUCH_OBJECT_INSTANCE)
        );
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("nowhere")).unwrap();
        let store = DirectoryStore::new(root);
        let found: Vec<_> = store
            .instances(&InMemDicomObject::new_empty(), QueryLevel::Image)
            .try_collect()
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
