//! Canonical serialization for log hashing
//!
//! Produces a deterministic byte representation: fixed field order,
//! big-endian integers, length-prefixed strings and sorted collections.
//! JSON is never hashed directly.

use crate::transaction::{Posting, Transaction};
use crate::types::{Address, Amount, Metadata};
use crate::volumes::AccountsAssetsVolumes;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Canonical byte writer
#[derive(Debug, Default)]
pub struct CanonicalWriter {
    buffer: Vec<u8>,
}

impl CanonicalWriter {
    /// Create new writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Write a tag byte
    pub fn write_u8(&mut self, n: u8) {
        self.buffer.push(n);
    }

    /// Write u32 (big-endian)
    pub fn write_u32(&mut self, n: u32) {
        self.write_bytes(&n.to_be_bytes());
    }

    /// Write u64 (big-endian)
    pub fn write_u64(&mut self, n: u64) {
        self.write_bytes(&n.to_be_bytes());
    }

    /// Write i64 (big-endian)
    pub fn write_i64(&mut self, n: i64) {
        self.write_bytes(&n.to_be_bytes());
    }

    /// Write string (length-prefixed)
    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    /// Write optional string with a presence marker
    pub fn write_option_string(&mut self, opt: Option<&str>) {
        match opt {
            Some(s) => {
                self.write_u8(1);
                self.write_string(s);
            }
            None => self.write_u8(0),
        }
    }

    /// Write amount as its decimal string
    pub fn write_amount(&mut self, amount: &Amount) {
        self.write_string(&amount.to_string());
    }

    /// Write metadata; keys are already sorted, values as compact JSON
    pub fn write_metadata(&mut self, metadata: &Metadata) {
        self.write_u32(metadata.len() as u32);
        for (key, value) in metadata.iter() {
            self.write_string(key);
            self.write_string(&value.to_string());
        }
    }

    /// Write per-account metadata in address order
    pub fn write_accounts_metadata(&mut self, accounts: &BTreeMap<Address, Metadata>) {
        self.write_u32(accounts.len() as u32);
        for (address, metadata) in accounts {
            self.write_string(address.as_str());
            self.write_metadata(metadata);
        }
    }

    /// Write a posting
    pub fn write_posting(&mut self, posting: &Posting) {
        self.write_string(posting.source.as_str());
        self.write_string(posting.destination.as_str());
        self.write_string(posting.asset.as_str());
        self.write_amount(&posting.amount);
    }

    /// Write volumes in (account, asset) order
    pub fn write_volumes(&mut self, volumes: &AccountsAssetsVolumes) {
        let entries: Vec<_> = volumes.iter().collect();
        self.write_u32(entries.len() as u32);
        for (account, asset, v) in entries {
            self.write_string(account.as_str());
            self.write_string(asset.as_str());
            self.write_amount(&v.input);
            self.write_amount(&v.output);
        }
    }

    /// Write a committed transaction; the mutable `reverted` flag is excluded
    pub fn write_transaction(&mut self, transaction: &Transaction) {
        self.write_u64(transaction.id);
        self.write_i64(transaction.data.timestamp.timestamp_micros());
        self.write_option_string(transaction.data.reference.as_deref());
        self.write_u32(transaction.data.postings.len() as u32);
        for posting in &transaction.data.postings {
            self.write_posting(posting);
        }
        self.write_metadata(&transaction.data.metadata);
        self.write_volumes(&transaction.pre_commit_volumes);
        self.write_volumes(&transaction.post_commit_volumes);
    }

    /// Finalize and return bytes
    pub fn finalize(self) -> Vec<u8> {
        self.buffer
    }

    /// Compute SHA-256 hash
    pub fn hash(self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.buffer);
        hasher.finalize().into()
    }
}
