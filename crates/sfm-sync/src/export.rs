//! Source extraction into interchange files.

use chrono::{DateTime, NaiveDate, Utc};
use sfm_adapters::RecordSource;
use sfm_core::{Extract, RunMode};
use sfm_storage::{InterchangeStore, StoredFile};
use tracing::info;

use crate::error::MigrationError;

/// Fetches every extract in [`Extract::EXPORT_ORDER`] and writes its file.
///
/// `since` selects the incremental fetch; `None` pulls every row.
pub async fn export_all(
    source: &dyn RecordSource,
    store: &InterchangeStore,
    mode: RunMode,
    date: NaiveDate,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<StoredFile>, MigrationError> {
    let mut files = Vec::with_capacity(Extract::EXPORT_ORDER.len());
    for extract in Extract::EXPORT_ORDER {
        let object = extract.object_name()?;
        let records = match since {
            Some(since) => source.fetch_modified_since(extract, since).await?,
            None => source.fetch_all(extract).await?,
        };
        info!(object, rows = records.len(), "exported");
        files.push(store.write_extract(mode, date, extract, &records).await?);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sfm_adapters::SourceError;
    use sfm_core::{EntityType, RawRecord};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSource {
        calls: Mutex<Vec<(Extract, bool)>>,
    }

    #[async_trait]
    impl RecordSource for RecordingSource {
        async fn fetch_all(&self, extract: Extract) -> Result<Vec<RawRecord>, SourceError> {
            self.calls.lock().unwrap().push((extract, false));
            let mut row = RawRecord::new();
            row.insert("Id".into(), format!("{}-1", extract.object_name()?));
            Ok(vec![row])
        }

        async fn fetch_modified_since(
            &self,
            extract: Extract,
            _since: DateTime<Utc>,
        ) -> Result<Vec<RawRecord>, SourceError> {
            self.calls.lock().unwrap().push((extract, true));
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn exports_every_extract_in_order() {
        let dir = tempdir().expect("tempdir");
        let store = InterchangeStore::new(dir.path());
        let source = RecordingSource::default();
        let date = NaiveDate::from_ymd_opt(2012, 7, 7).unwrap();

        let files = export_all(&source, &store, RunMode::Full, date, None)
            .await
            .expect("export");
        assert_eq!(files.len(), 8);
        assert!(files.iter().all(|f| f.rows == 1));

        let calls = source.calls.lock().unwrap().clone();
        let order: Vec<Extract> = calls.iter().map(|(e, _)| *e).collect();
        assert_eq!(order, Extract::EXPORT_ORDER.to_vec());
        assert!(calls.iter().all(|(_, incremental)| !incremental));

        let table = store
            .read_extract(RunMode::Full, date, Extract::Entity(EntityType::Merchant))
            .await
            .unwrap();
        assert_eq!(table.rows[0][0], "Account-1");
    }

    #[tokio::test]
    async fn incremental_export_writes_dated_batch() {
        let dir = tempdir().expect("tempdir");
        let store = InterchangeStore::new(dir.path());
        let source = RecordingSource::default();
        let date = NaiveDate::from_ymd_opt(2012, 7, 8).unwrap();

        let files = export_all(&source, &store, RunMode::Incremental, date, Some(Utc::now()))
            .await
            .expect("export");
        assert!(files[0].path.starts_with(dir.path().join("update").join("2012-07-08")));
        assert!(source.calls.lock().unwrap().iter().all(|(_, incremental)| *incremental));
    }
}
