//! Typed identifiers, peer addresses, and time buckets.
//!
//! Each string identifier is a newtype wrapper around `String`, providing type
//! safety so that a [`NodeId`] cannot be accidentally used where an
//! [`EntityId`] is expected.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MeridianError;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier using UUID v4.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Return the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(
    /// Unique identifier for a collector node in the cluster.
    NodeId
);

define_id!(
    /// Identity of an aggregate: `timeBucket + "_" + businessKey`.
    EntityId
);

/// Separator between the time bucket and the business key of an [`EntityId`].
pub const ID_SEPARATOR: &str = "_";

impl EntityId {
    /// Compose an id from a time bucket and a business key.
    pub fn compose(time_bucket: i64, key: impl fmt::Display) -> Self {
        Self(format!("{time_bucket}{ID_SEPARATOR}{key}"))
    }

    /// Return the time bucket prefix, if the id was composed with one.
    pub fn time_bucket(&self) -> Option<i64> {
        self.0
            .split_once(ID_SEPARATOR)
            .and_then(|(bucket, _)| bucket.parse().ok())
    }
}

/// Identifier of a processing graph. Graph ids are shared across the cluster,
/// so a remote message names its target graph by this number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub u32);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address of a cluster member (`host:port`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = MeridianError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| MeridianError::Config {
            message: format!("peer address '{s}' must be host:port"),
        })?;
        let port = port.parse::<u16>().map_err(|e| MeridianError::Config {
            message: format!("invalid port in peer address '{s}': {e}"),
        })?;
        if host.is_empty() {
            return Err(MeridianError::Config {
                message: format!("empty host in peer address '{s}'"),
            });
        }
        Ok(Self::new(host, port))
    }
}

/// Granularity of a time bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Downsampling {
    /// `yyyyMMddHHmm`
    Minute,
    /// `yyyyMMddHH`
    Hour,
    /// `yyyyMMdd`
    Day,
}

impl Downsampling {
    /// Lowercase name, used as a storage suffix.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Compute the bucket a timestamp falls into.
    pub fn time_bucket(&self, ts: DateTime<Utc>) -> i64 {
        let day = i64::from(ts.year()) * 10_000 + i64::from(ts.month()) * 100 + i64::from(ts.day());
        match self {
            Self::Day => day,
            Self::Hour => day * 100 + i64::from(ts.hour()),
            Self::Minute => (day * 100 + i64::from(ts.hour())) * 100 + i64::from(ts.minute()),
        }
    }

    /// Convert a minute bucket into this granularity.
    pub fn rebucket(&self, minute_bucket: i64) -> i64 {
        match self {
            Self::Minute => minute_bucket,
            Self::Hour => minute_bucket / 100,
            Self::Day => minute_bucket / 10_000,
        }
    }
}
