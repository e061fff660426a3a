use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(SubscriptionId);

pub const MAX_FIELD_NAME_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldNameError {
    #[error("counter field name cannot be empty")]
    Empty,
    #[error("counter field name exceeds {MAX_FIELD_NAME_BYTES} bytes")]
    TooLong,
    #[error("counter field name must start with an ASCII letter: {0:?}")]
    InvalidStart(String),
    #[error("counter field name may only contain ASCII letters, digits and '_': {0:?}")]
    InvalidCharacter(String),
}

/// Name of an integer counter on a user's record, e.g. `count` or `promptCount`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CounterField(String);

impl CounterField {
    pub fn parse(raw: &str) -> Result<Self, FieldNameError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FieldNameError::Empty);
        }
        if raw.len() > MAX_FIELD_NAME_BYTES {
            return Err(FieldNameError::TooLong);
        }
        if !raw.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(FieldNameError::InvalidStart(raw.to_string()));
        }
        if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(FieldNameError::InvalidCharacter(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn count() -> Self {
        Self("count".to_string())
    }

    pub fn prompt_count() -> Self {
        Self("promptCount".to_string())
    }

    pub fn graded_count() -> Self {
        Self("gradedCount".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CounterField {
    type Err = FieldNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CounterField {
    type Error = FieldNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CounterField> for String {
    fn from(value: CounterField) -> Self {
        value.0
    }
}

/// One user's counters. Fields that were never incremented are absent and read as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub user_id: UserId,
    #[serde(default)]
    pub values: BTreeMap<CounterField, i64>,
    pub updated_at: DateTime<Utc>,
}

impl CounterRecord {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            values: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn value(&self, field: &CounterField) -> i64 {
        self.values.get(field).copied().unwrap_or(0)
    }
}

/// Sums `field` over a complete snapshot of records.
pub fn sum_field<'a, I>(records: I, field: &CounterField) -> i64
where
    I: IntoIterator<Item = &'a CounterRecord>,
{
    records
        .into_iter()
        .fold(0i64, |total, record| total.saturating_add(record.value(field)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl SessionUser {
    pub fn greeting_name(&self) -> String {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| format!("user-{}", self.user_id.0))
    }
}
