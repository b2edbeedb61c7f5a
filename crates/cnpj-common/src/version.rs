//! Dataset version identifiers
//!
//! The publisher groups every monthly release under a directory named
//! `YYYY-MM`. The loader uses that name as the first half of the
//! processed-file key, so it is validated once and carried as a newtype.

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetVersion(String);

impl DatasetVersion {
    /// Parse a `YYYY-MM` release name.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_end_matches('/');
        let (year, month) = trimmed
            .split_once('-')
            .ok_or_else(|| CommonError::InvalidVersion(raw.to_string()))?;

        let year_ok = year.len() == 4 && year.chars().all(|c| c.is_ascii_digit());
        let month_ok = month.len() == 2
            && month
                .parse::<u8>()
                .map(|m| (1..=12).contains(&m))
                .unwrap_or(false);

        if !year_ok || !month_ok {
            return Err(CommonError::InvalidVersion(raw.to_string()));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DatasetVersion {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DatasetVersion {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DatasetVersion> for String {
    fn from(value: DatasetVersion) -> Self {
        value.0
    }
}

impl fmt::Display for DatasetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
