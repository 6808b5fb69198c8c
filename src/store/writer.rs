//! Catalog writer
//!
//! Renders a catalog into its documents and publishes them to a target store.
//! Every file is staged before any is committed; data files are committed
//! before the index, so the index never names a file that is not there yet.
//!
//! If a commit fails, the files already committed by the same write are put
//! back as they were (or removed if they are new) before the error is
//! returned. An unsigned write removes the signed twins a previous signed
//! write left, index first.

use chrono::Utc;
use serde::Serialize;
use streams_sign::{SignedDocument, SigningKey};
use tracing::{debug, info, warn};

use super::{StoreError, StoreResult, TargetStore};
use crate::catalog::{render, signed_path, Catalog, BASE_IMAGES_PATH, INDEX_PATH};
use crate::source::url_join;

/// Files written by one publish, relative to the store root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    /// Data files, in commit order
    pub data_files: Vec<String>,

    /// Index files, committed last
    pub index_files: Vec<String>,

    /// Stale signed twins removed by an unsigned write
    pub removed_files: Vec<String>,

    pub records_written: usize,
}

/// Publishes catalogs to a target store
pub struct CatalogWriter<'a, S: TargetStore> {
    store: &'a S,
    signing_key: Option<&'a SigningKey>,
}

impl<'a, S: TargetStore> CatalogWriter<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            signing_key: None,
        }
    }

    /// Also write a signed `.sjson` twin of every document
    pub fn with_signing_key(mut self, key: &'a SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Replace the store's catalog with `catalog`
    pub fn write(&self, catalog: &Catalog) -> StoreResult<WriteReport> {
        let rendered = render(catalog, Utc::now());

        let mut data = Vec::new();
        for (path, document) in &rendered.products {
            self.encode(&mut data, path, document)?;
        }
        let mut index = Vec::new();
        self.encode(&mut index, INDEX_PATH, &rendered.index)?;

        let staged_data = self.stage_all(&data)?;
        let staged_index = self.stage_all(&index)?;

        let targets: Vec<&str> = data.iter().chain(&index).map(|(path, _)| path.as_str()).collect();
        let previous = targets
            .iter()
            .map(|path| self.store.read(path))
            .collect::<StoreResult<Vec<_>>>()?;

        for (done, staged) in staged_data.into_iter().chain(staged_index).enumerate() {
            if let Err(e) = self.store.commit(staged) {
                self.roll_back(&targets[..done], &previous[..done]);
                return Err(e);
            }
        }

        let removed_files = match self.signing_key {
            Some(_) => Vec::new(),
            None => self.remove_signed_twins(index.iter().chain(&data).map(|(path, _)| path.as_str()))?,
        };

        let report = WriteReport {
            data_files: data.into_iter().map(|(path, _)| path).collect(),
            index_files: index.into_iter().map(|(path, _)| path).collect(),
            removed_files,
            records_written: catalog.len(),
        };
        info!(
            location = %self.store.location(),
            records = report.records_written,
            files = report.data_files.len() + report.index_files.len(),
            signed = self.signing_key.is_some(),
            "catalog written"
        );
        Ok(report)
    }

    /// Serialize `document` for `path`, plus its signed twin if signing
    fn encode<T: Serialize>(
        &self,
        files: &mut Vec<(String, Vec<u8>)>,
        path: &str,
        document: &T,
    ) -> StoreResult<()> {
        let encode_err = |source| StoreError::Encode {
            path: path.to_string(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(document).map_err(encode_err)?;

        if let Some(key) = self.signing_key {
            let signed = SignedDocument::sign(&bytes, key)
                .to_json()
                .map_err(encode_err)?;
            files.push((url_join(BASE_IMAGES_PATH, &signed_path(path)), signed.into_bytes()));
        }
        files.push((url_join(BASE_IMAGES_PATH, path), bytes));
        Ok(())
    }

    /// Put back what the first commits of a failed write replaced, newest first
    fn roll_back(&self, committed: &[&str], previous: &[Option<Vec<u8>>]) {
        for (path, old) in committed.iter().zip(previous).rev() {
            let restored = match old {
                Some(bytes) => self
                    .store
                    .stage(path, bytes)
                    .and_then(|staged| self.store.commit(staged)),
                None => self.store.remove(path).map(|_| ()),
            };
            match restored {
                Ok(()) => debug!(path = %path, "rolled back"),
                Err(e) => warn!(path = %path, error = %e, "cannot roll back"),
            }
        }
    }

    /// Remove the `.sjson` twin of each path, if present
    fn remove_signed_twins<'p>(&self, paths: impl Iterator<Item = &'p str>) -> StoreResult<Vec<String>> {
        let mut removed = Vec::new();
        for twin in paths.map(signed_path) {
            if self.store.remove(&twin)? {
                info!(path = %twin, "removed stale signed document");
                removed.push(twin);
            }
        }
        Ok(removed)
    }

    fn stage_all(&self, files: &[(String, Vec<u8>)]) -> StoreResult<Vec<S::Staged>> {
        files
            .iter()
            .map(|(path, bytes)| {
                debug!(path = %path, bytes = bytes.len(), "staging");
                self.store.stage(path, bytes)
            })
            .collect()
    }
}
