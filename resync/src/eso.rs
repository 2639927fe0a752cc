//! Adapters binding the convergence tracker to ExternalSecrets in a live
//! cluster.
//!
//! The marker is `status.refreshTime`: the external-secrets controller bumps
//! it whenever a reconciliation attempt completes, successful or not. The
//! trigger is the `force-sync` annotation, patched with the current epoch so
//! every run produces a fresh value.

use std::collections::BTreeSet;

use async_trait::async_trait;
use eso_resync_crds::{v1beta1::ExternalSecret, FORCE_SYNC_ANNOTATION};
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::debug;

use crate::{
    error::Error,
    track::{
        Readiness, ResourceRef, ResourceStatus, StatusReader, SyncTrigger, TriggerError,
        Unreachable,
    },
};

pub const FIELD_MANAGER: &str = "eso-resync";

/// Enumerates the ExternalSecrets to resync. A name filter always comes with
/// a namespace filter (the CLI enforces that); asking for a name that does
/// not exist is a discovery failure, matching kubectl's behavior.
pub async fn discover(
    client: &Client,
    namespace: Option<&str>,
    name: Option<&str>,
) -> Result<BTreeSet<ResourceRef>, Error> {
    if let (Some(namespace), Some(name)) = (namespace, name) {
        let api = Api::<ExternalSecret>::namespaced(client.clone(), namespace);
        return match api.get_opt(name).await.map_err(Error::Discovery)? {
            Some(external_secret) => {
                debug!("discovered {external_secret}");
                Ok(BTreeSet::from([ResourceRef::new(namespace, name)]))
            }
            None => Err(Error::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        };
    }

    let api = match namespace {
        Some(namespace) => Api::<ExternalSecret>::namespaced(client.clone(), namespace),
        None => Api::<ExternalSecret>::all(client.clone()),
    };

    Ok(api
        .list(&ListParams::default())
        .await
        .map_err(Error::Discovery)?
        .into_iter()
        .filter_map(|external_secret| {
            let namespace = external_secret.namespace()?;
            debug!("discovered {external_secret}");
            Some(ResourceRef::new(namespace, external_secret.name_any()))
        })
        .collect())
}

pub struct EsoStatusReader {
    client: Client,
}

impl EsoStatusReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusReader for EsoStatusReader {
    async fn read(&self, resource: &ResourceRef) -> Result<ResourceStatus, Unreachable> {
        let api = Api::<ExternalSecret>::namespaced(self.client.clone(), &resource.namespace);
        let external_secret = api
            .get_opt(&resource.name)
            .await
            .map_err(|err| Unreachable(err.to_string()))?
            .ok_or_else(|| Unreachable(format!("externalsecret {resource} no longer exists")))?;
        Ok(status_of(&external_secret))
    }
}

fn status_of(external_secret: &ExternalSecret) -> ResourceStatus {
    let marker = external_secret.refresh_time().map(str::to_string);

    let Some(condition) = external_secret.ready_condition() else {
        return ResourceStatus {
            marker,
            ready: Readiness::Unknown,
            message: "no Ready condition reported".to_string(),
        };
    };

    let ready = match condition.status.as_str() {
        "True" => Readiness::True,
        "False" => Readiness::False,
        _ => Readiness::Unknown,
    };

    let message = condition
        .message
        .as_deref()
        .or(condition.reason.as_deref())
        .unwrap_or_default()
        .to_string();

    ResourceStatus {
        marker,
        ready,
        message,
    }
}

pub struct ForceSyncTrigger {
    client: Client,
}

impl ForceSyncTrigger {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SyncTrigger for ForceSyncTrigger {
    async fn fire(&self, resource: &ResourceRef) -> Result<(), TriggerError> {
        let api = Api::<ExternalSecret>::namespaced(self.client.clone(), &resource.namespace);
        let stamp = time::OffsetDateTime::now_utc().unix_timestamp().to_string();

        debug!("annotating {resource} with {FORCE_SYNC_ANNOTATION}={stamp}");
        api.patch_metadata(
            &resource.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(json!({
                "metadata": {
                    "annotations": {
                        FORCE_SYNC_ANNOTATION: stamp,
                    },
                },
            })),
        )
        .await
        .map_err(|err| TriggerError(err.to_string()))?;

        Ok(())
    }
}
