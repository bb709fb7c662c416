use std::collections::{BTreeMap, BTreeSet};

use super::instance::{InstanceId, TOTAL_WORKER};

/// Localities, pools and workers seen in a run.
#[derive(Debug, Clone, Default)]
pub struct InstanceCatalog {
    localities: BTreeMap<String, BTreeMap<Option<String>, BTreeSet<String>>>,
}

/// Orders numeric ids numerically and everything else after them.
fn natural_key(s: &str) -> (Option<u64>, &str) {
    (s.parse::<u64>().ok(), s)
}

fn sorted_naturally<'a>(mut items: Vec<&'a str>) -> Vec<&'a str> {
    items.sort_by(|a, b| match (natural_key(a), natural_key(b)) {
        ((Some(x), _), (Some(y), _)) => x.cmp(&y),
        ((Some(_), _), (None, _)) => std::cmp::Ordering::Less,
        ((None, _), (Some(_), _)) => std::cmp::Ordering::Greater,
        ((None, x), (None, y)) => x.cmp(y),
    });
    items
}

impl InstanceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Returns true if any level was previously unseen.
    pub fn insert(&mut self, id: &InstanceId) -> bool {
        let pools = match self.localities.get_mut(&id.locality) {
            Some(pools) => pools,
            None => self.localities.entry(id.locality.clone()).or_default(),
        };
        let workers = match pools.get_mut(&id.pool) {
            Some(workers) => workers,
            None => pools.entry(id.pool.clone()).or_default(),
        };
        if workers.contains(&id.worker) {
            return false;
        }
        workers.insert(id.worker.clone())
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.localities
            .get(&id.locality)
            .and_then(|pools| pools.get(&id.pool))
            .is_some_and(|workers| workers.contains(&id.worker))
    }

    pub fn list_localities(&self) -> Vec<&str> {
        sorted_naturally(self.localities.keys().map(String::as_str).collect())
    }

    /// Pools of a locality; `None` is the unnamed default pool.
    pub fn list_pools(&self, locality: &str) -> Vec<Option<&str>> {
        self.localities
            .get(locality)
            .map(|pools| pools.keys().map(Option::as_deref).collect())
            .unwrap_or_default()
    }

    /// Worker ids of a pool, excluding the `total` aggregate.
    pub fn list_workers(&self, locality: &str, pool: Option<&str>) -> Vec<&str> {
        let Some(pools) = self.localities.get(locality) else {
            return Vec::new();
        };
        let workers = pools
            .iter()
            .find(|(p, _)| p.as_deref() == pool)
            .map(|(_, w)| w);
        match workers {
            Some(w) => sorted_naturally(
                w.iter()
                    .map(String::as_str)
                    .filter(|w| *w != TOTAL_WORKER)
                    .collect(),
            ),
            None => Vec::new(),
        }
    }

    /// Number of worker threads of a locality: per pool the highest numeric
    /// worker id plus one, summed over pools.
    pub fn worker_count(&self, locality: &str) -> usize {
        let Some(pools) = self.localities.get(locality) else {
            return 0;
        };
        pools
            .values()
            .filter_map(|workers| {
                workers
                    .iter()
                    .filter_map(|w| w.parse::<usize>().ok())
                    .max()
                    .map(|max| max + 1)
            })
            .sum()
    }

    pub fn locality_count(&self) -> usize {
        self.localities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.localities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(loc: &str, pool: Option<&str>, worker: &str) -> InstanceId {
        InstanceId::new(loc, pool, worker)
    }

    #[test]
    fn test_insert_reports_new_instances() {
        let mut cat = InstanceCatalog::new();
        assert!(cat.insert(&id("0", None, "total")));
        assert!(!cat.insert(&id("0", None, "total")));
        assert!(cat.insert(&id("0", None, "1")));
        assert!(cat.contains(&id("0", None, "1")));
        assert!(!cat.contains(&id("0", Some("default"), "1")));
    }

    #[test]
    fn test_listings() {
        let mut cat = InstanceCatalog::new();
        for w in ["10", "2", "total", "0"] {
            cat.insert(&id("0", Some("default"), w));
        }
        cat.insert(&id("1", None, "0"));
        cat.insert(&id("0", None, "total"));

        assert_eq!(cat.list_localities(), vec!["0", "1"]);
        assert_eq!(cat.list_pools("0"), vec![None, Some("default")]);
        assert_eq!(cat.list_workers("0", Some("default")), vec!["0", "2", "10"]);
        assert!(cat.list_workers("0", None).is_empty());
        assert!(cat.list_pools("7").is_empty());
    }

    #[test]
    fn test_worker_count_sums_pools() {
        let mut cat = InstanceCatalog::new();
        cat.insert(&id("0", Some("default"), "3"));
        cat.insert(&id("0", Some("default"), "total"));
        cat.insert(&id("0", Some("io"), "1"));
        cat.insert(&id("0", None, "total"));

        // 4 (default: 0..=3) + 2 (io: 0..=1); total-only pools count zero.
        assert_eq!(cat.worker_count("0"), 6);
        assert_eq!(cat.worker_count("9"), 0);
    }
}
