//! Instance identity of counters and tasks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Synthetic worker id of aggregate-over-workers instances.
pub const TOTAL_WORKER: &str = "total";

/// Placeholder for "no pool" in textual instance keys.
pub const NO_POOL: &str = "-";

/// `(locality, pool, worker)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub locality: String,
    pub pool: Option<String>,
    pub worker: String,
}

impl InstanceId {
    pub fn new(
        locality: impl Into<String>,
        pool: Option<impl Into<String>>,
        worker: impl Into<String>,
    ) -> Self {
        Self {
            locality: locality.into(),
            pool: pool.map(Into::into),
            worker: worker.into(),
        }
    }

    /// Aggregate instance of a whole locality.
    pub fn total(locality: impl Into<String>) -> Self {
        Self {
            locality: locality.into(),
            pool: None,
            worker: TOTAL_WORKER.to_string(),
        }
    }

    pub fn is_total(&self) -> bool {
        self.worker == TOTAL_WORKER
    }

    /// Parse a `locality/pool/worker` key, `-` standing for no pool.
    pub fn parse_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, '/');
        let locality = parts.next().filter(|s| !s.is_empty())?;
        let pool = parts.next()?;
        let worker = parts.next().filter(|s| !s.is_empty())?;

        let pool = (pool != NO_POOL && !pool.is_empty()).then(|| pool.to_string());
        Some(Self {
            locality: locality.to_string(),
            pool,
            worker: worker.to_string(),
        })
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.locality,
            self.pool.as_deref().unwrap_or(NO_POOL),
            self.worker
        )
    }
}

/// Instance a series is stored under.
/// Query key prefix forcing the rest of the key to be read as a raw path.
pub const RAW_KEY_PREFIX: &str = "raw:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeriesInstance {
    Addressed(InstanceId),
    /// Instance path without a locality prefix, kept verbatim.
    Raw(String),
}

impl SeriesInstance {
    pub fn as_id(&self) -> Option<&InstanceId> {
        match self {
            Self::Addressed(id) => Some(id),
            Self::Raw(_) => None,
        }
    }

    /// Resolve a query key: `raw:<path>` always names a raw path, then an
    /// `InstanceId` key if it parses as one, otherwise a raw path.
    pub fn from_key(key: &str) -> Self {
        if let Some(path) = key.strip_prefix(RAW_KEY_PREFIX) {
            return Self::Raw(path.to_string());
        }
        if key.starts_with('/') {
            return Self::Raw(key.to_string());
        }
        match InstanceId::parse_key(key) {
            Some(id) => Self::Addressed(id),
            None => Self::Raw(key.to_string()),
        }
    }
}

impl From<InstanceId> for SeriesInstance {
    fn from(id: InstanceId) -> Self {
        Self::Addressed(id)
    }
}

impl fmt::Display for SeriesInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addressed(id) => id.fmt(f),
            Self::Raw(path) => f.write_str(path),
        }
    }
}

/// Value after `#` in a `name#value` segment.
fn segment_value(segment: &str) -> Option<&str> {
    segment.split_once('#').map(|(_, v)| v).filter(|v| !v.is_empty())
}

/// Derive the instance identity from a counter's `{...}` instance block.
///
/// Recognized shapes:
/// - `locality#L/total`
/// - `locality#L/worker-thread#W`
/// - `locality#L/pool#P/total`
/// - `locality#L/pool#P/worker-thread#W`
///
/// Anything without a `locality#` prefix, such as the embedded counter
/// names of statistics counters, is kept verbatim.
pub fn parse_instance_path(path: &str) -> SeriesInstance {
    if path.starts_with('/') {
        return SeriesInstance::Raw(path.to_string());
    }

    let segments: Vec<&str> = path.split('/').collect();
    let Some(locality) = segments.first().and_then(|s| segment_value(s)) else {
        return SeriesInstance::Raw(path.to_string());
    };

    let id = match segments.as_slice() {
        [_] => Some(InstanceId::total(locality)),
        [_, second, ..] if second.contains(TOTAL_WORKER) => Some(InstanceId::total(locality)),
        [_, worker] => segment_value(worker).map(|w| InstanceId::new(locality, None::<&str>, w)),
        [_, pool, third, ..] => segment_value(pool).and_then(|p| {
            if third.contains(TOTAL_WORKER) {
                Some(InstanceId::new(locality, Some(p), TOTAL_WORKER))
            } else {
                segment_value(third).map(|w| InstanceId::new(locality, Some(p), w))
            }
        }),
        [] => None,
    };

    match id {
        Some(id) => SeriesInstance::Addressed(id),
        None => SeriesInstance::Raw(path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locality_total() {
        assert_eq!(
            parse_instance_path("locality#0/total"),
            SeriesInstance::Addressed(InstanceId::total("0"))
        );
    }

    #[test]
    fn test_parse_worker_without_pool() {
        assert_eq!(
            parse_instance_path("locality#1/worker-thread#7"),
            SeriesInstance::Addressed(InstanceId::new("1", None::<String>, "7"))
        );
    }

    #[test]
    fn test_parse_pool_total_and_worker() {
        assert_eq!(
            parse_instance_path("locality#0/pool#default/total"),
            SeriesInstance::Addressed(InstanceId::new("0", Some("default"), "total"))
        );
        assert_eq!(
            parse_instance_path("locality#0/pool#default/worker-thread#3"),
            SeriesInstance::Addressed(InstanceId::new("0", Some("default"), "3"))
        );
    }

    #[test]
    fn test_parse_raw_paths() {
        let embedded = "/threads{locality#0/total}/count/cumulative,5";
        assert_eq!(
            parse_instance_path(embedded),
            SeriesInstance::Raw(embedded.to_string())
        );
        assert_eq!(
            parse_instance_path("total"),
            SeriesInstance::Raw("total".to_string())
        );
        assert_eq!(
            parse_instance_path("locality#0/worker-thread"),
            SeriesInstance::Raw("locality#0/worker-thread".to_string())
        );
    }

    #[test]
    fn test_total_differs_from_numbered_worker() {
        let total = InstanceId::total("0");
        let worker = InstanceId::new("0", None::<String>, "0");
        assert_ne!(total, worker);
        assert!(total.is_total());
        assert!(!worker.is_total());
    }

    #[test]
    fn test_key_roundtrip() {
        let id = InstanceId::new("0", None::<String>, "total");
        assert_eq!(id.to_string(), "0/-/total");
        assert_eq!(InstanceId::parse_key("0/-/total"), Some(id));

        let pooled = InstanceId::new("2", Some("io"), "5");
        assert_eq!(InstanceId::parse_key(&pooled.to_string()), Some(pooled));

        assert_eq!(InstanceId::parse_key("0/total"), None);
        assert_eq!(
            SeriesInstance::from_key("/raw/path"),
            SeriesInstance::Raw("/raw/path".to_string())
        );
    }

    #[test]
    fn test_raw_key_prefix() {
        assert_eq!(
            SeriesInstance::from_key("raw:foo/bar/baz"),
            SeriesInstance::Raw("foo/bar/baz".to_string())
        );
        assert_eq!(
            SeriesInstance::from_key("raw:0/-/total"),
            SeriesInstance::Raw("0/-/total".to_string())
        );
        // Without the prefix a three-part key reads as an instance id.
        assert_eq!(
            SeriesInstance::from_key("foo/bar/baz"),
            SeriesInstance::Addressed(InstanceId::new("foo", Some("bar"), "baz"))
        );
    }
}
