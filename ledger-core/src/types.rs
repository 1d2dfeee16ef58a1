//! Core value types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (sorted maps, amounts as decimal strings)
//! - Exact arithmetic (arbitrary-precision integers for money)
//! - Validation at construction time

use crate::{Error, Result};
use chrono::{DateTime, SubsecRound, Utc};
use num_bigint::{BigInt, BigUint};
use num_traits::Zero;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

/// Account address made of `:`-separated segments, e.g. `users:001:wallet`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and validate an address
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        let valid = !address.is_empty()
            && address.split(':').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if !valid {
            return Err(Error::InvalidAddress(address));
        }
        Ok(Self(address))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address segments in order
    pub fn segments(&self) -> Vec<&str> {
        self.0.split(':').collect()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Asset code such as `USD/2` or `COIN`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Asset(String);

impl Asset {
    /// Parse and validate an asset code: `[A-Z][A-Z0-9]{0,16}(/\d{1,6})?`
    pub fn new(asset: impl Into<String>) -> Result<Self> {
        let asset = asset.into();
        let (code, precision) = match asset.split_once('/') {
            Some((code, precision)) => (code, Some(precision)),
            None => (asset.as_str(), None),
        };

        let code_ok = code.len() <= 17
            && code.chars().next().is_some_and(|c| c.is_ascii_uppercase())
            && code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        let precision_ok = precision.map_or(true, |p| {
            (1..=6).contains(&p.len()) && p.chars().all(|c| c.is_ascii_digit())
        });

        if !code_ok || !precision_ok {
            return Err(Error::InvalidAsset(asset));
        }
        Ok(Self(asset))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Asset {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Asset> for String {
    fn from(asset: Asset) -> Self {
        asset.0
    }
}

/// Non-negative arbitrary-precision amount
///
/// Serialized as a decimal string so JSON consumers never lose precision.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(BigUint);

impl Amount {
    /// Zero amount
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// Whether the amount is zero
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Borrow the underlying integer
    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Signed view, used for balances
    pub fn to_bigint(&self) -> BigInt {
        BigInt::from(self.0.clone())
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl From<BigUint> for Amount {
    fn from(value: BigUint) -> Self {
        Self(value)
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidAmount(s.to_string()));
        }
        s.parse::<BigUint>()
            .map(Self)
            .map_err(|e| Error::InvalidAmount(format!("{}: {}", s, e)))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AddAssign<&Amount> for Amount {
    fn add_assign(&mut self, rhs: &Amount) {
        self.0 += &rhs.0;
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AmountVisitor;

        impl<'de> de::Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or decimal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Amount, E> {
                Ok(Amount::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Amount, E> {
                u64::try_from(v)
                    .map(Amount::from)
                    .map_err(|_| E::custom(format!("negative amount: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Amount, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

/// Serde adapter storing a [`BigInt`] as a decimal string
pub mod bigint_string {
    use num_bigint::BigInt;
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// Serialize as decimal string
    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    /// Deserialize from decimal string
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Free-form JSON metadata attached to accounts and transactions
///
/// Keys are kept sorted so the canonical form is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    /// Empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Top-level lookup
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Nested lookup with a dotted path, e.g. `customer.tier`
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Merge `other` into `self`; keys in `other` win
    pub fn merge(&mut self, other: &Metadata) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Remove a key
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Number of top-level keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no keys
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, Value>> for Metadata {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Truncate a timestamp to the microsecond resolution of the storage backend
///
/// Hashes are computed over truncated dates so a log read back from storage
/// hashes identically to the one that was written.
pub fn truncate_to_micros(date: DateTime<Utc>) -> DateTime<Utc> {
    date.trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_address_validation() {
        assert!(Address::new("world").is_ok());
        assert!(Address::new("users:001:wallet").is_ok());
        assert_eq!(
            Address::new("users:001").unwrap().segments(),
            vec!["users", "001"]
        );

        assert!(Address::new("").is_err());
        assert!(Address::new("users::001").is_err());
        assert!(Address::new("users:").is_err());
        assert!(Address::new("users 001").is_err());
    }

    #[test]
    fn test_asset_validation() {
        assert!(Asset::new("USD").is_ok());
        assert!(Asset::new("USD/2").is_ok());
        assert!(Asset::new("COIN123").is_ok());

        assert!(Asset::new("usd").is_err());
        assert!(Asset::new("1USD").is_err());
        assert!(Asset::new("USD/").is_err());
        assert!(Asset::new("USD/1234567").is_err());
        assert!(Asset::new("").is_err());
    }

    #[test]
    fn test_amount_serde() {
        let huge: Amount = "340282366920938463463374607431768211456".parse().unwrap();
        let json = serde_json::to_string(&huge).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211456\"");
        assert_eq!(serde_json::from_str::<Amount>(&json).unwrap(), huge);

        assert_eq!(serde_json::from_str::<Amount>("100").unwrap(), Amount::from(100));
        assert!(serde_json::from_str::<Amount>("-1").is_err());
        assert!("12a".parse::<Amount>().is_err());
        assert!("+5".parse::<Amount>().is_err());
    }

    #[test]
    fn test_metadata_merge_and_path() {
        let mut metadata: Metadata = [("role", json!("admin")), ("tier", json!(1))]
            .into_iter()
            .collect();
        let update: Metadata = [("tier", json!(2)), ("customer", json!({"region": "eu"}))]
            .into_iter()
            .collect();

        metadata.merge(&update);

        assert_eq!(metadata.get("role"), Some(&json!("admin")));
        assert_eq!(metadata.get("tier"), Some(&json!(2)));
        assert_eq!(metadata.get_path("customer.region"), Some(&json!("eu")));
        assert_eq!(metadata.get_path("customer.missing"), None);
        assert_eq!(metadata.get_path("role.nested"), None);
    }
}
