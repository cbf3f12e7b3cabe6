use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::Api;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};

use crate::config::Config;
use crate::session::Session;

use super::resources::{
    self, MANAGED_BY_LABEL, MANAGED_BY_VALUE, SECRET_KEY_INITIAL_MESSAGE, resource_name,
};
use super::{DriverError, Handoff, Liveness};

/// Kubernetes driver: each session is one Secret + one single-replica
/// StatefulSet + one Service. Service annotations are the only persistent
/// session metadata; startup discovery lists Services by the managing label.
pub struct KubernetesDriver {
    client: kube::Client,
    config: Arc<Config>,
}

impl KubernetesDriver {
    pub fn new(client: kube::Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn statefulsets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    #[tracing::instrument(skip(self, session, handoff), fields(session_id = %session.id), err)]
    pub async fn provision(
        &self,
        session: &Session,
        handoff: &Handoff,
    ) -> Result<String, DriverError> {
        let namespace = &self.config.namespace;
        let pp = PostParams::default();

        let secret = resources::build_secret(namespace, session, handoff);
        self.secrets().create(&pp, &secret).await?;

        let statefulset = resources::build_statefulset(
            namespace,
            session,
            handoff,
            &self.config.agent_image,
            self.config.agent_port,
        )?;
        self.statefulsets().create(&pp, &statefulset).await?;

        let service = resources::build_service(namespace, session, self.config.agent_port);
        self.services().create(&pp, &service).await?;

        self.wait_ready(&session.id).await?;

        Ok(resources::service_addr(
            &session.id,
            namespace,
            self.config.agent_port,
        ))
    }

    /// Poll the StatefulSet until its replica reports ready, bounded by the
    /// configured grace window. A 404 immediately after create is cache
    /// drift, not absence; keep polling.
    async fn wait_ready(&self, session_id: &str) -> Result<(), DriverError> {
        let name = resource_name(session_id);
        let deadline = tokio::time::Instant::now() + self.config.ready_grace;

        loop {
            match self.statefulsets().get(&name).await {
                Ok(sts) => {
                    let ready = sts
                        .status
                        .as_ref()
                        .and_then(|s| s.ready_replicas)
                        .unwrap_or(0);
                    if ready >= 1 {
                        tracing::info!(session_id, "agent statefulset ready");
                        return Ok(());
                    }
                }
                Err(kube::Error::Api(err)) if err.code == 404 => {}
                Err(e) => return Err(e.into()),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::NotReady(format!(
                    "statefulset {name} not ready within {}s",
                    self.config.ready_grace.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Delete all three resources. Missing resources are fine (idempotent);
    /// the first real failure is returned so the caller can retry.
    #[tracing::instrument(skip(self), err)]
    pub async fn teardown(&self, session_id: &str) -> Result<(), DriverError> {
        let name = resource_name(session_id);
        let dp = DeleteParams::default();

        let mut first_error = None;
        if let Err(e) = self.statefulsets().delete(&name, &dp).await
            && !is_not_found(&e)
        {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.services().delete(&name, &dp).await
            && !is_not_found(&e)
        {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.secrets().delete(&name, &dp).await
            && !is_not_found(&e)
        {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub async fn liveness(&self, session_id: &str) -> Result<Liveness, DriverError> {
        match self.statefulsets().get(&resource_name(session_id)).await {
            Ok(sts) => {
                let ready = sts
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                if ready >= 1 {
                    Ok(Liveness::Running)
                } else {
                    Ok(Liveness::Failed)
                }
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(Liveness::Stopped),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the initial message back from the handoff Secret.
    pub async fn initial_message(&self, session_id: &str) -> Result<Option<String>, DriverError> {
        match self.secrets().get(&resource_name(session_id)).await {
            Ok(secret) => Ok(secret
                .data
                .as_ref()
                .and_then(|d| d.get(SECRET_KEY_INITIAL_MESSAGE))
                .map(|b| String::from_utf8_lossy(&b.0).into_owned())
                .filter(|m| !m.is_empty())),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List managed Services and rebuild the session set from their
    /// annotations.
    #[tracing::instrument(skip(self), err)]
    pub async fn discover(&self) -> Result<Vec<Session>, DriverError> {
        let lp = ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"));
        let services = self.services().list(&lp).await?;

        let sessions: Vec<Session> = services
            .items
            .iter()
            .filter_map(|svc| {
                resources::session_from_service(svc, &self.config.namespace, self.config.agent_port)
            })
            .collect();

        tracing::info!(count = sessions.len(), "rediscovered sessions from services");
        Ok(sessions)
    }

    /// Write the session's current metadata back onto its Service.
    pub async fn persist_metadata(&self, session: &Session) -> Result<(), DriverError> {
        let patch = serde_json::json!({
            "metadata": { "annotations": resources::service_annotations(session) }
        });
        self.services()
            .patch(
                &resource_name(&session.id),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
