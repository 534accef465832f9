//! Typed wrapper over one MongoDB collection.
//!
//! Handles the cross-cutting store concerns so callers never touch raw
//! driver types: UTC normalization on every input path, local rendering on
//! output, and top-level `_id` string coercion where a malformed id yields
//! an empty result instead of an error.

use std::time::Duration;

use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use futures::stream::TryStreamExt;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, IndexModel};
use secrecy::ExposeSecret;

use crate::config::MongoDbConfig;
use crate::error::{Error, Result};
use crate::storage::datetime::normalize_document;

pub struct DocumentStore {
    client: Client,
    pub(crate) collection: Collection<Document>,
}

/// Outcome of a top-level `_id` coercion attempt.
enum IdCoercion {
    Ok(Document),
    /// The filter named an id that cannot exist; short-circuit to empty.
    Unmatchable,
}

impl DocumentStore {
    /// Connects to the configured server, verifies it with a ping, and
    /// ensures the given single-field indexes.
    pub async fn connect(
        config: &MongoDbConfig,
        collection_name: &str,
        indexes: &[&str],
    ) -> Result<Self> {
        let uri = config.connection_string();
        let mut options = ClientOptions::parse(uri.expose_secret())
            .await
            .map_err(|e| Error::StoreConnect(e.to_string()))?;
        options.connect_timeout = Some(Duration::from_secs(3));
        options.server_selection_timeout = Some(Duration::from_secs(5));

        let client =
            Client::with_options(options).map_err(|e| Error::StoreConnect(e.to_string()))?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| Error::StoreConnect(e.to_string()))?;

        let collection = client
            .database(&config.database)
            .collection::<Document>(collection_name);

        let store = Self { client, collection };
        store.ensure_indexes(indexes).await;
        tracing::info!(collection = collection_name, "Document store connected");
        Ok(store)
    }

    async fn ensure_indexes(&self, fields: &[&str]) {
        for field in fields.iter().copied() {
            let model = IndexModel::builder().keys(doc! { field: 1 }).build();
            if let Err(e) = self.collection.create_index(model).await {
                tracing::error!(field, error = %e, "Failed to ensure index");
            }
        }
    }

    pub fn name(&self) -> &str {
        self.collection.name()
    }

    /// Raw driver handle, for maintenance jobs and test setup.
    pub fn collection_handle(&self) -> &Collection<Document> {
        &self.collection
    }

    /// Inserts a single document, normalizing datetimes to UTC.
    /// Returns the string form of the inserted `_id`.
    pub async fn insert(&self, data: Document) -> Result<String> {
        let result = self.collection.insert_one(normalize_document(data)).await?;
        Ok(id_to_string(&result.inserted_id))
    }

    /// Inserts multiple documents (unordered), normalizing each.
    pub async fn bulk_insert(&self, data: Vec<Document>) -> Result<Vec<String>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let processed: Vec<Document> = data.into_iter().map(normalize_document).collect();
        let result = self
            .collection
            .insert_many(processed)
            .ordered(false)
            .await?;
        Ok(result.inserted_ids.values().map(id_to_string).collect())
    }

    /// Finds a single document. A malformed string `_id` in the filter
    /// yields `None`.
    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        let filter = match coerce_filter_id(filter) {
            IdCoercion::Ok(filter) => normalize_document(filter),
            IdCoercion::Unmatchable => return Ok(None),
        };
        let document = self.collection.find_one(filter).await?;
        Ok(document.map(process_output))
    }

    /// Finds a single document with an explicit sort order.
    pub async fn find_one_sorted(
        &self,
        filter: Document,
        sort: Document,
    ) -> Result<Option<Document>> {
        let filter = match coerce_filter_id(filter) {
            IdCoercion::Ok(filter) => normalize_document(filter),
            IdCoercion::Unmatchable => return Ok(None),
        };
        let document = self.collection.find_one(filter).sort(sort).await?;
        Ok(document.map(process_output))
    }

    /// Finds documents with optional sort, skip and limit.
    pub async fn find_many(
        &self,
        filter: Document,
        sort: Option<Document>,
        skip: u64,
        limit: i64,
    ) -> Result<Vec<Document>> {
        let filter = match coerce_filter_id(filter) {
            IdCoercion::Ok(filter) => normalize_document(filter),
            IdCoercion::Unmatchable => return Ok(Vec::new()),
        };

        let mut find = self.collection.find(filter);
        if let Some(sort) = sort {
            find = find.sort(sort);
        }
        if skip > 0 {
            find = find.skip(skip);
        }
        if limit > 0 {
            find = find.limit(limit);
        }

        let cursor = find.await?;
        let documents: Vec<Document> = cursor.try_collect().await?;
        Ok(documents.into_iter().map(process_output).collect())
    }

    /// Updates documents matching the filter. Patches without `$` operators
    /// are wrapped in `$set`. Returns `(matched, modified)`.
    pub async fn update(&self, filter: Document, patch: Document) -> Result<(u64, u64)> {
        let filter = match coerce_filter_id(filter) {
            IdCoercion::Ok(filter) => normalize_document(filter),
            IdCoercion::Unmatchable => return Ok((0, 0)),
        };
        let patch = normalize_document(patch);
        let update = if patch.keys().any(|key| key.starts_with('$')) {
            patch
        } else {
            doc! { "$set": patch }
        };

        let result = self.collection.update_many(filter, update).await?;
        Ok((result.matched_count, result.modified_count))
    }

    /// Counts documents matching the filter.
    pub async fn count(&self, filter: Document) -> Result<u64> {
        let filter = match coerce_filter_id(filter) {
            IdCoercion::Ok(filter) => normalize_document(filter),
            IdCoercion::Unmatchable => return Ok(0),
        };
        Ok(self.collection.count_documents(filter).await?)
    }

    /// Executes an aggregation pipeline. Datetimes inside the stages are
    /// normalized; string `_id` coercion is not applied to pipelines.
    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let pipeline: Vec<Document> = pipeline.into_iter().map(normalize_document).collect();
        let cursor = self.collection.aggregate(pipeline).await?;
        let documents: Vec<Document> = cursor.try_collect().await?;
        Ok(documents.into_iter().map(process_output).collect())
    }

    /// Closes the underlying client connection.
    pub async fn close(&self) {
        self.client.clone().shutdown().await;
        tracing::info!(collection = self.collection.name(), "Document store closed");
    }
}

fn id_to_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

/// Converts a top-level string `_id` filter value to an `ObjectId`.
fn coerce_filter_id(mut filter: Document) -> IdCoercion {
    let Some(Bson::String(raw)) = filter.get("_id").cloned() else {
        return IdCoercion::Ok(filter);
    };
    match ObjectId::parse_str(&raw) {
        Ok(oid) => {
            filter.insert("_id", oid);
            IdCoercion::Ok(filter)
        }
        Err(_) => {
            tracing::warn!(id = %raw, "Invalid _id format, query cannot match");
            IdCoercion::Unmatchable
        }
    }
}

/// Common processing for documents leaving the store: the `_id` becomes its
/// string form so it survives JSON boundaries.
fn process_output(mut doc: Document) -> Document {
    if let Some(Bson::ObjectId(oid)) = doc.get("_id") {
        let hex = oid.to_hex();
        doc.insert("_id", hex);
    }
    doc
}
