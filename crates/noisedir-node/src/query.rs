//! Query engine: read-only resolution of (field, value) pairs into matching
//! identities. Never touches the pending ledger.

use std::collections::HashMap;
use std::sync::Arc;

use phonenumber::country::Id as CountryId;
use thiserror::Error;

use crate::directory::{DirectoryStore, Field, Identity, Match, StoreError};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("query must name at least one (field, value) pair")]
    Empty,
    #[error("unknown query field: {0}")]
    UnknownField(String),
    #[error("invalid phone number: {0}")]
    InvalidPhone(String),
}

impl QueryError {
    pub fn status_code(&self) -> u16 {
        match self {
            QueryError::Store(_) => 500,
            QueryError::Empty | QueryError::UnknownField(_) | QueryError::InvalidPhone(_) => 400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryPair {
    pub field: String,
    pub value: String,
}

pub struct QueryEngine {
    pub store: Arc<dyn DirectoryStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self { store }
    }

    /// Resolves a set of raw (field-name, value) pairs. Phone values pass
    /// through the same scrubber used on ingestion (with `fallback_country`
    /// standing in for the caller's locale) so that `1234` under `de-de`
    /// matches an entry stored as `+491234`.
    pub async fn search(
        &self,
        pairs: &[QueryPair],
        fallback_country: CountryId,
    ) -> Result<Vec<(Identity, Vec<Match>)>, QueryError> {
        if pairs.is_empty() {
            return Err(QueryError::Empty);
        }

        let mut queries: HashMap<Field, Vec<String>> = HashMap::new();
        for pair in pairs {
            let field = Field::parse(&pair.field)
                .ok_or_else(|| QueryError::UnknownField(pair.field.clone()))?;
            let value = match field {
                Field::Email => pair.value.clone(),
                Field::Phone => {
                    let parsed = phonenumber::parse(Some(fallback_country), &pair.value)
                        .map_err(|e| QueryError::InvalidPhone(e.to_string()))?;
                    parsed.format().mode(phonenumber::Mode::E164).to_string()
                }
            };
            queries.entry(field).or_default().push(value);
        }

        Ok(self.store.search(&queries).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectoryStore;

    #[tokio::test]
    async fn rejects_empty_query() {
        let engine = QueryEngine::new(Arc::new(MemoryDirectoryStore::new()));
        let err = engine.search(&[], CountryId::DE).await.unwrap_err();
        assert!(matches!(err, QueryError::Empty));
    }

    #[tokio::test]
    async fn rejects_unknown_field() {
        let engine = QueryEngine::new(Arc::new(MemoryDirectoryStore::new()));
        let pairs = vec![QueryPair {
            field: "fax".to_string(),
            value: "123".to_string(),
        }];
        let err = engine.search(&pairs, CountryId::DE).await.unwrap_err();
        assert!(matches!(err, QueryError::UnknownField(_)));
    }

    #[tokio::test]
    async fn finds_identity_by_email() {
        let store = Arc::new(MemoryDirectoryStore::new());
        store
            .find_or_create_identity("abc", "alias", "http://example.com/x", 0)
            .await
            .unwrap();
        store.upsert_entry("abc", Field::Email, "x@example.com", 0).await.unwrap();

        let engine = QueryEngine::new(store);
        let pairs = vec![QueryPair {
            field: "email".to_string(),
            value: "x@example.com".to_string(),
        }];
        let results = engine.search(&pairs, CountryId::DE).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, vec![Match { field: Field::Email, value: "x@example.com".to_string() }]);
    }

    #[tokio::test]
    async fn phone_query_normalizes_by_locale() {
        let store = Arc::new(MemoryDirectoryStore::new());
        store
            .find_or_create_identity("abc", "alias", "http://example.com/x", 0)
            .await
            .unwrap();
        store.upsert_entry("abc", Field::Phone, "+491234", 0).await.unwrap();

        let engine = QueryEngine::new(store);
        let pairs = vec![QueryPair {
            field: "phone".to_string(),
            value: "1234".to_string(),
        }];
        let results = engine.search(&pairs, CountryId::DE).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
