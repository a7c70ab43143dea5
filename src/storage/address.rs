//! Scheme-tagged device addresses and datastore paths.

use std::{fmt, str::FromStr};

use crate::error::StoreError;

/// Opaque locator of a block device within a storage backend.
///
/// Produced by the disk locator; immutable once built. The scheme tag lets
/// every consumer reject addresses that belong to another backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    scheme: String,
    path: String,
}

impl DeviceAddress {
    pub(crate) fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check the scheme tag and decode the path into a [`DatastorePath`].
    pub fn datastore_path(&self, expected_scheme: &str) -> Result<DatastorePath, StoreError> {
        if self.scheme != expected_scheme {
            return Err(StoreError::Validation(format!(
                "disk path must be a datastore url with {:?} scheme, got {:?}",
                expected_scheme, self.scheme
            )));
        }
        DatastorePath::parse(&self.path)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path)
    }
}

impl FromStr for DeviceAddress {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, path) = s
            .split_once("://")
            .ok_or_else(|| StoreError::Validation(format!("address {s:?} has no scheme")))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StoreError::Validation(format!(
                "address {s:?} has an invalid scheme"
            )));
        }
        if path.is_empty() {
            return Err(StoreError::Validation(format!("address {s:?} has no path")));
        }
        Ok(Self::new(scheme, path))
    }
}

/// A path in datastore notation: `"[datastore] relative/path.vmdk"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatastorePath {
    pub datastore: String,
    pub path: String,
}

impl DatastorePath {
    pub fn new(datastore: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
            path: path.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::Validation(format!("invalid datastore path {s:?}"));

        let rest = s.strip_prefix('[').ok_or_else(invalid)?;
        let (datastore, path) = rest.split_once(']').ok_or_else(invalid)?;
        let path = path.trim_start_matches(' ');
        if datastore.is_empty() || path.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(datastore, path))
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.path)
    }
}
