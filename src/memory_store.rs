use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use crate::dataset::{Dataset, QueryLevel, SopReference, failure_reason, matches_keys, project};
use crate::error::{PersistError, QueryError};
use crate::services::{CommitProcessor, QuerySource, StorePersister, StoreRequest};

/// Instances kept in memory, in the order they were first stored.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: RwLock<Vec<InMemDicomObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instances(instances: impl IntoIterator<Item = InMemDicomObject>) -> Self {
        let store = Self::new();
        for instance in instances {
            store.insert(instance);
        }
        store
    }

    /// Add an instance, replacing any previous one with the same SOP Instance UID.
    pub fn insert(&self, instance: InMemDicomObject) {
        let uid = instance.sop_instance_uid().ok();
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        match instances
            .iter_mut()
            .find(|existing| uid.is_some() && existing.sop_instance_uid().ok() == uid)
        {
            Some(existing) => *existing = instance,
            None => instances.push(instance),
        }
    }

    pub fn get(&self, sop_instance_uid: &str) -> Option<InMemDicomObject> {
        self.snapshot()
            .into_iter()
            .find(|i| i.sop_instance_uid().is_ok_and(|uid| uid == sop_instance_uid))
    }

    pub fn len(&self) -> usize {
        self.instances.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<InMemDicomObject> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn matching(&self, keys: &InMemDicomObject) -> Vec<InMemDicomObject> {
        self.snapshot()
            .into_iter()
            .filter(|instance| matches_keys(instance, keys))
            .collect()
    }
}

#[async_trait]
impl StorePersister<InMemDicomObject> for MemoryStore {
    async fn persist(
        &self,
        request: StoreRequest<InMemDicomObject>,
    ) -> Result<String, PersistError> {
        let uid = request.dataset.sop_instance_uid()?;
        self.insert(request.dataset);
        Ok(uid)
    }
}

impl QuerySource<InMemDicomObject> for MemoryStore {
    fn find(
        &self,
        keys: &InMemDicomObject,
        level: QueryLevel,
    ) -> BoxStream<'static, Result<InMemDicomObject, QueryError>> {
        let unique_key = level.unique_key();
        let mut seen = HashSet::new();
        let identifiers: Vec<_> = self
            .matching(keys)
            .into_iter()
            .filter(|instance| seen.insert(instance.get_str(unique_key)))
            .map(|instance| Ok(project(&instance, keys)))
            .collect();
        stream::iter(identifiers).boxed()
    }

    fn instances(
        &self,
        keys: &InMemDicomObject,
        _level: QueryLevel,
    ) -> BoxStream<'static, Result<InMemDicomObject, QueryError>> {
        stream::iter(self.matching(keys).into_iter().map(Ok)).boxed()
    }
}

#[async_trait]
impl CommitProcessor for MemoryStore {
    async fn commit(&self, references: Vec<SopReference>) -> Vec<SopReference> {
        references
            .into_iter()
            .map(|reference| match self.get(&reference.sop_instance_uid) {
                None => reference.failed(failure_reason::NO_SUCH_OBJECT_INSTANCE),
                Some(instance)
                    if instance.sop_class_uid().ok().as_ref() != Some(&reference.sop_class_uid) =>
                {
                    reference.failed(failure_reason::CLASS_INSTANCE_CONFLICT)
                }
                Some(_) => reference,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uids;
    use dicom::core::VR;
    use dicom::dictionary_std::tags;
    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;

    fn instance(patient: &str, study: &str, sop_instance_uid: &str) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        Dataset::put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
        Dataset::put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
        Dataset::put_str(&mut obj, tags::PATIENT_ID, VR::LO, patient);
        Dataset::put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, study);
        obj
    }

    fn store() -> MemoryStore {
        MemoryStore::with_instances([
            instance("P1", "1.1", "1.1.1"),
            instance("P1", "1.1", "1.1.2"),
            instance("P1", "1.2", "1.2.1"),
            instance("P2", "2.1", "2.1.1"),
        ])
    }

    fn keys(level: QueryLevel, patient: &str) -> InMemDicomObject {
        let mut keys = InMemDicomObject::new_empty();
        Dataset::put_str(&mut keys, tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.as_str());
        Dataset::put_str(&mut keys, tags::PATIENT_ID, VR::LO, patient);
        Dataset::put_str(&mut keys, tags::STUDY_INSTANCE_UID, VR::UI, "");
        keys
    }

    #[tokio::test]
    async fn test_find_yields_one_identifier_per_study() {
        let store = store();
        let found: Vec<_> = store
            .find(&keys(QueryLevel::Study, "P1"), QueryLevel::Study)
            .try_collect()
            .await
            .unwrap();
        let studies: Vec<_> = found
            .iter()
            .map(|i| i.get_str(tags::STUDY_INSTANCE_UID).unwrap())
            .collect();
        assert_eq!(studies, vec!["1.1", "1.2"]);
        assert!(found[0].get(tags::SOP_INSTANCE_UID).is_none());
    }

    #[tokio::test]
    async fn test_instances_yields_every_match() {
        let store = store();
        let found: Vec<_> = store
            .instances(&keys(QueryLevel::Patient, "P1"), QueryLevel::Patient)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_insert_replaces_same_instance() {
        let store = store();
        store.insert(instance("P3", "3.1", "1.1.1"));
        assert_eq!(store.len(), 4);
        assert_eq!(
            store.get("1.1.1").unwrap().get_str(tags::PATIENT_ID).as_deref(),
            Some("P3")
        );
    }

    #[tokio::test]
    async fn test_commit() {
        let store = store();
        let results = store
            .commit(vec![
                SopReference::new(uids::CT_IMAGE_STORAGE, "1.1.1"),
                SopReference::new(uids::MR_IMAGE_STORAGE, "1.1.2"),
                SopReference::new(uids::CT_IMAGE_STORAGE, "9.9.9"),
            ])
            .await;
        let reasons: Vec<_> = results.iter().map(|r| r.failure_reason).collect();
        assert_eq!(
            reasons,
            vec![
                None,
                Some(failure_reason::CLASS_INSTANCE_CONFLICT),
                Some(failure_reason::NO_SUCH_OBJECT_INSTANCE)
            ]
        );
    }
}
