//! Idempotency keys
//!
//! Responses are stored under a key derived from the request, so a retried
//! request can be answered without committing twice.

use super::{Store, WriterMode};
use crate::{Error, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Key for a request: SHA-256 hex over method, path and body
pub fn hash_request(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for part in [method.as_bytes(), path.as_bytes()] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.update(body);
    hex::encode(hasher.finalize())
}

impl<M: WriterMode> Store<M> {
    /// Store the response for `key`; a second write of the same key fails
    /// with [`Error::ConstraintViolation`]
    pub async fn create_ik(&self, key: &str, response: &Value) -> Result<()> {
        self.instrumented("create_ik", async {
            let insert = format!(
                "INSERT INTO {} (key, response) VALUES ($1, $2)",
                self.schema.table("idempotency_keys")
            );
            sqlx::query(&insert)
                .bind(key)
                .bind(response)
                .execute(self.schema.pool())
                .await?;
            Ok(())
        })
        .await
    }

    /// Stored response for `key`
    pub async fn read_ik(&self, key: &str) -> Result<Value> {
        self.instrumented("read_ik", async {
            let select = format!(
                "SELECT response FROM {} WHERE key = $1",
                self.schema.table("idempotency_keys")
            );
            let response: Option<Value> = sqlx::query_scalar(&select)
                .bind(key)
                .fetch_optional(self.schema.pool())
                .await?;
            response.ok_or_else(|| Error::NotFound(format!("idempotency key {}", key)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_request_is_stable_and_field_separated() {
        let key = hash_request("POST", "/ledger/transactions", b"{}");
        assert_eq!(key.len(), 64);
        assert_eq!(key, hash_request("POST", "/ledger/transactions", b"{}"));

        assert_ne!(key, hash_request("POST", "/ledger/transactions", b"{ }"));
        assert_ne!(
            hash_request("PO", "ST/path", b""),
            hash_request("POST", "/path", b"")
        );
    }
}
