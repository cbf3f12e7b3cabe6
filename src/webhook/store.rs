use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use parking_lot::RwLock;

use super::{DeliveryRecord, Webhook};

/// Most recent deliveries kept per webhook.
const DELIVERY_HISTORY_LIMIT: usize = 100;

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert(&self, webhook: Webhook) -> anyhow::Result<()>;
    async fn get(&self, id: &str) -> anyhow::Result<Option<Webhook>>;
    async fn list(&self) -> anyhow::Result<Vec<Webhook>>;
    /// Returns false when the webhook does not exist.
    async fn update(&self, webhook: Webhook) -> anyhow::Result<bool>;
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;
    /// Bump the webhook's delivery counter and remember the record.
    /// Best-effort bookkeeping: never blocks delivery processing.
    async fn record_delivery(&self, webhook_id: &str, record: DeliveryRecord);
    async fn deliveries(&self, webhook_id: &str) -> Vec<DeliveryRecord>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryWebhookStore {
    webhooks: RwLock<HashMap<String, Webhook>>,
    history: RwLock<HashMap<String, VecDeque<DeliveryRecord>>>,
}

impl MemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookStore for MemoryWebhookStore {
    async fn insert(&self, webhook: Webhook) -> anyhow::Result<()> {
        self.webhooks.write().insert(webhook.id.clone(), webhook);
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Webhook>> {
        Ok(self.webhooks.read().get(id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<Webhook>> {
        Ok(self.webhooks.read().values().cloned().collect())
    }

    async fn update(&self, webhook: Webhook) -> anyhow::Result<bool> {
        let mut map = self.webhooks.write();
        if !map.contains_key(&webhook.id) {
            return Ok(false);
        }
        map.insert(webhook.id.clone(), webhook);
        Ok(true)
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        self.history.write().remove(id);
        Ok(self.webhooks.write().remove(id).is_some())
    }

    async fn record_delivery(&self, webhook_id: &str, record: DeliveryRecord) {
        {
            let mut map = self.webhooks.write();
            if let Some(wh) = map.get_mut(webhook_id) {
                wh.delivery_count += 1;
                wh.last_delivery = Some(record.clone());
            }
        }
        let mut history = self.history.write();
        let entries = history.entry(webhook_id.to_owned()).or_default();
        entries.push_front(record);
        entries.truncate(DELIVERY_HISTORY_LIMIT);
    }

    async fn deliveries(&self, webhook_id: &str) -> Vec<DeliveryRecord> {
        self.history
            .read()
            .get(webhook_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// ConfigMap-backed store
// ---------------------------------------------------------------------------

const WEBHOOK_LABEL: &str = "agent-gateway-webhook";
const DATA_KEY: &str = "webhook";

/// Webhook definitions persisted as JSON blobs in labelled ConfigMaps, so the
/// configuration survives gateway restarts alongside the sessions it
/// governs. Delivery history stays in memory (it is diagnostics, not
/// configuration).
pub struct ConfigMapWebhookStore {
    client: kube::Client,
    namespace: String,
    history: RwLock<HashMap<String, VecDeque<DeliveryRecord>>>,
}

impl ConfigMapWebhookStore {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            history: RwLock::new(HashMap::new()),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn configmap_name(id: &str) -> String {
        format!("webhook-{id}")
    }

    fn to_configmap(&self, webhook: &Webhook) -> anyhow::Result<ConfigMap> {
        let blob = serde_json::to_string(webhook)?;
        Ok(ConfigMap {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(Self::configmap_name(&webhook.id)),
                namespace: Some(self.namespace.clone()),
                labels: Some(std::collections::BTreeMap::from([(
                    WEBHOOK_LABEL.to_owned(),
                    "true".to_owned(),
                )])),
                ..Default::default()
            },
            data: Some(std::collections::BTreeMap::from([(
                DATA_KEY.to_owned(),
                blob,
            )])),
            ..Default::default()
        })
    }

    fn from_configmap(cm: &ConfigMap) -> Option<Webhook> {
        let blob = cm.data.as_ref()?.get(DATA_KEY)?;
        match serde_json::from_str(blob) {
            Ok(wh) => Some(wh),
            Err(e) => {
                tracing::warn!(
                    name = cm.metadata.name.as_deref().unwrap_or(""),
                    error = %e,
                    "skipping unparseable webhook configmap"
                );
                None
            }
        }
    }
}

#[async_trait]
impl WebhookStore for ConfigMapWebhookStore {
    async fn insert(&self, webhook: Webhook) -> anyhow::Result<()> {
        let cm = self.to_configmap(&webhook)?;
        self.api().create(&PostParams::default(), &cm).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Webhook>> {
        match self.api().get(&Self::configmap_name(id)).await {
            Ok(cm) => Ok(Self::from_configmap(&cm)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> anyhow::Result<Vec<Webhook>> {
        let lp = ListParams::default().labels(&format!("{WEBHOOK_LABEL}=true"));
        let cms = self.api().list(&lp).await?;
        Ok(cms.items.iter().filter_map(Self::from_configmap).collect())
    }

    async fn update(&self, webhook: Webhook) -> anyhow::Result<bool> {
        let cm = self.to_configmap(&webhook)?;
        match self
            .api()
            .patch(
                &Self::configmap_name(&webhook.id),
                &PatchParams::default(),
                &Patch::Merge(&cm),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        self.history.write().remove(id);
        match self
            .api()
            .delete(&Self::configmap_name(id), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_delivery(&self, webhook_id: &str, record: DeliveryRecord) {
        {
            let mut history = self.history.write();
            let entries = history.entry(webhook_id.to_owned()).or_default();
            entries.push_front(record.clone());
            entries.truncate(DELIVERY_HISTORY_LIMIT);
        }

        // Counter lives in the persisted blob; a lost update is acceptable.
        match self.get(webhook_id).await {
            Ok(Some(mut wh)) => {
                wh.delivery_count += 1;
                wh.last_delivery = Some(record);
                if let Err(e) = self.update(wh).await {
                    tracing::warn!(webhook_id, error = %e, "failed to persist delivery counter");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(webhook_id, error = %e, "failed to load webhook for delivery record");
            }
        }
    }

    async fn deliveries(&self, webhook_id: &str) -> Vec<DeliveryRecord> {
        self.history
            .read()
            .get(webhook_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }
}
