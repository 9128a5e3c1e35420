use std::sync::Arc;

use serde::Deserialize;

use crate::error::CacheError;
use crate::records::{MetadataFilter, MetadataStore};

pub const PROJECT_LOAD_RECORD: &str = "projectLoad";

/// Whether a local-platform project has finished loading into its ADC repository.
pub trait ProjectLoadStatus: Send + Sync {
    fn is_fully_loaded(&self, project_uuid: &str) -> Result<bool, CacheError>;
}

impl<T: ProjectLoadStatus + ?Sized> ProjectLoadStatus for Arc<T> {
    fn is_fully_loaded(&self, project_uuid: &str) -> Result<bool, CacheError> {
        (**self).is_fully_loaded(project_uuid)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectLoad {
    #[serde(default)]
    is_loaded: bool,
    #[serde(default)]
    repertoire_metadata_loaded: bool,
    #[serde(default)]
    rearrangement_data_loaded: bool,
}

/// Reads the `projectLoad` record associated with each project.
pub struct MetadataLoadStatus<S: MetadataStore> {
    store: S,
}

impl<S: MetadataStore> MetadataLoadStatus<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: MetadataStore> ProjectLoadStatus for MetadataLoadStatus<S> {
    fn is_fully_loaded(&self, project_uuid: &str) -> Result<bool, CacheError> {
        let records = self.store.query(
            &MetadataFilter::named(PROJECT_LOAD_RECORD).associated_with(project_uuid),
        )?;
        let Some(record) = records.into_iter().next() else {
            return Ok(false);
        };
        let load: ProjectLoad =
            serde_json::from_value(record.value).map_err(|err| CacheError::RecordDecode {
                uuid: record.uuid,
                message: err.to_string(),
            })?;
        Ok(load.is_loaded && load.repertoire_metadata_loaded && load.rearrangement_data_loaded)
    }
}
