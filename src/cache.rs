use crate::resources::GameServer;
use kube::{
    runtime::watcher,
    ResourceExt,
};
use std::{
    collections::HashMap,
    sync::RwLock,
};

/// Read-mostly index `hostname -> resource name`, fed from the GameServer
/// watch stream and queried concurrently for hostname-availability checks
/// and reverse lookups.
///
/// A reverse index keyed by resource name keeps updates O(1) and guarantees
/// at most one hostname ever maps to a given resource.
#[derive(Default)]
pub struct HostnameCache {
    inner: RwLock<Index>,
}

#[derive(Default)]
struct Index {
    by_hostname: HashMap<String, String>,
    by_resource: HashMap<String, String>,
}

impl HostnameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch-stream callback. Applies map to upserts, deletes drop the entry.
    pub fn observe(&self, event: &watcher::Event<GameServer>) {
        match event {
            watcher::Event::Apply(gs) | watcher::Event::InitApply(gs) => self.upsert(gs),
            watcher::Event::Delete(gs) => self.remove(gs),
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    /// Index the server's current hostname, dropping a stale key first if the
    /// hostname changed. A server that no longer yields a hostname is removed.
    pub fn upsert(&self, gs: &GameServer) {
        let resource = gs.name_any();
        let hostname = gs.hostname();

        let mut index = self.inner.write().expect("hostname cache lock poisoned");
        if let Some(old) = index.by_resource.get(&resource) {
            if hostname.as_deref() != Some(old) {
                let old = old.clone();
                index.by_hostname.remove(&old);
            }
        }
        match hostname {
            Some(hostname) => {
                trace!(%resource, %hostname, "indexing hostname");
                index.by_hostname.insert(hostname.clone(), resource.clone());
                index.by_resource.insert(resource, hostname);
            }
            None => {
                index.by_resource.remove(&resource);
            }
        }
    }

    pub fn remove(&self, gs: &GameServer) {
        let resource = gs.name_any();
        let mut index = self.inner.write().expect("hostname cache lock poisoned");
        if let Some(hostname) = index.by_resource.remove(&resource) {
            trace!(%resource, %hostname, "dropping hostname");
            index.by_hostname.remove(&hostname);
        }
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.inner
            .read()
            .expect("hostname cache lock poisoned")
            .by_hostname
            .contains_key(hostname)
    }

    /// Reverse lookup: resource name currently claiming a hostname.
    pub fn resource_for(&self, hostname: &str) -> Option<String> {
        self.inner
            .read()
            .expect("hostname cache lock poisoned")
            .by_hostname
            .get(hostname)
            .cloned()
    }

    pub fn hostname_for(&self, resource: &str) -> Option<String> {
        self.inner
            .read()
            .expect("hostname cache lock poisoned")
            .by_resource
            .get(resource)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("hostname cache lock poisoned").by_hostname.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        GameServerSpec,
        DOMAIN_ANNOTATION,
        SUBDOMAIN_ANNOTATION,
    };
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn server(name: &str, subdomain: Option<&str>) -> GameServer {
        let mut annotations = BTreeMap::from([(DOMAIN_ANNOTATION.to_string(), "example.com".to_string())]);
        if let Some(subdomain) = subdomain {
            annotations.insert(SUBDOMAIN_ANNOTATION.to_string(), subdomain.to_string());
        }
        GameServer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: GameServerSpec::default(),
            status: None,
        }
    }

    #[test]
    fn add_and_lookup() {
        let cache = HostnameCache::new();
        cache.upsert(&server("mc-server", None));

        assert!(cache.contains("mc-server.example.com"));
        assert_eq!(cache.resource_for("mc-server.example.com").as_deref(), Some("mc-server"));
        assert_eq!(cache.hostname_for("mc-server").as_deref(), Some("mc-server.example.com"));
    }

    #[test]
    fn hostname_change_leaves_no_orphan_key() {
        let cache = HostnameCache::new();
        cache.upsert(&server("mc-server", None));
        cache.upsert(&server("mc-server", Some("play")));

        assert!(!cache.contains("mc-server.example.com"));
        assert!(cache.contains("play.example.com"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_removes_entry() {
        let cache = HostnameCache::new();
        let gs = server("mc-server", None);
        cache.upsert(&gs);
        cache.remove(&gs);

        assert!(cache.is_empty());
        assert_eq!(cache.hostname_for("mc-server"), None);
    }

    #[test]
    fn dropping_the_domain_drops_the_entry() {
        let cache = HostnameCache::new();
        cache.upsert(&server("mc-server", None));

        let mut without_domain = server("mc-server", None);
        without_domain.metadata.annotations = None;
        cache.upsert(&without_domain);

        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_readers_see_consistent_state() {
        use std::sync::Arc;

        let cache = Arc::new(HostnameCache::new());
        cache.upsert(&server("mc-server", None));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert_eq!(cache.resource_for("mc-server.example.com").as_deref(), Some("mc-server"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
