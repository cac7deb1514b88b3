//! In-memory network server used by the unit tests.

use async_trait::async_trait;
use fuota_core::{DevEui, NsMulticastGroup};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{ClientFactory, Endpoint, NetworkServerClient};
use crate::error::{NsError, NsResult};

#[derive(Default)]
pub(crate) struct FakeClient {
    groups: Mutex<HashMap<String, NsMulticastGroup>>,
    members: Mutex<HashMap<String, BTreeSet<DevEui>>>,
    fail_writes: AtomicBool,
    assign_ids: AtomicBool,
}

impl FakeClient {
    /// Makes creates store the group under `ns-<id>` instead of the given id.
    pub(crate) fn set_assign_ids(&self, assign: bool) {
        self.assign_ids.store(assign, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn group(&self, id: &str) -> Option<NsMulticastGroup> {
        self.groups.lock().unwrap().get(id).cloned()
    }

    pub(crate) fn members(&self, id: &str) -> Vec<DevEui> {
        self.members
            .lock()
            .unwrap()
            .get(id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn check_writable(&self) -> NsResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(NsError::rpc("fake", "unavailable"));
        }
        Ok(())
    }

    fn not_found(id: &str) -> NsError {
        NsError::RemoteNotFound {
            entity: "MulticastGroup".to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl NetworkServerClient for FakeClient {
    async fn create_multicast_group(&self, group: &NsMulticastGroup) -> NsResult<String> {
        self.check_writable()?;
        let id = if self.assign_ids.load(Ordering::SeqCst) {
            format!("ns-{}", group.id)
        } else {
            group.id.clone()
        };
        let stored = NsMulticastGroup {
            id: id.clone(),
            ..group.clone()
        };
        self.groups.lock().unwrap().insert(id.clone(), stored);
        Ok(id)
    }

    async fn get_multicast_group(&self, id: &str) -> NsResult<NsMulticastGroup> {
        self.group(id).ok_or_else(|| Self::not_found(id))
    }

    async fn update_multicast_group(&self, group: &NsMulticastGroup) -> NsResult<()> {
        self.check_writable()?;
        let mut groups = self.groups.lock().unwrap();
        match groups.get_mut(&group.id) {
            Some(existing) => {
                *existing = group.clone();
                Ok(())
            }
            None => Err(Self::not_found(&group.id)),
        }
    }

    async fn delete_multicast_group(&self, id: &str) -> NsResult<()> {
        self.check_writable()?;
        self.members.lock().unwrap().remove(id);
        self.groups
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn add_device_to_multicast_group(
        &self,
        group_id: &str,
        dev_eui: &DevEui,
    ) -> NsResult<()> {
        self.check_writable()?;
        if self.group(group_id).is_none() {
            return Err(Self::not_found(group_id));
        }
        self.members
            .lock()
            .unwrap()
            .entry(group_id.to_string())
            .or_default()
            .insert(dev_eui.clone());
        Ok(())
    }

    async fn remove_device_from_multicast_group(
        &self,
        group_id: &str,
        dev_eui: &DevEui,
    ) -> NsResult<()> {
        self.check_writable()?;
        if let Some(members) = self.members.lock().unwrap().get_mut(group_id) {
            members.remove(dev_eui);
        }
        Ok(())
    }
}

/// Hands out one shared [`FakeClient`] and counts connects.
#[derive(Default)]
pub(crate) struct FakeFactory {
    pub(crate) client: Arc<FakeClient>,
    connects: AtomicUsize,
    fail_connect: AtomicBool,
    connect_delays: Mutex<HashMap<String, Duration>>,
}

impl FakeFactory {
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Makes connects to `server` take `delay`.
    pub(crate) fn set_connect_delay(&self, server: &str, delay: Duration) {
        self.connect_delays
            .lock()
            .unwrap()
            .insert(server.to_string(), delay);
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn connect(&self, endpoint: &Endpoint) -> NsResult<Arc<dyn NetworkServerClient>> {
        let delay = self
            .connect_delays
            .lock()
            .unwrap()
            .get(&endpoint.server)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(NsError::ConnectFailed {
                server: endpoint.server.clone(),
                message: "refused".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.client.clone())
    }
}
