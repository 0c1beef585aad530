//! Turns Kubernetes watches into [`Event`]s for the [`CertificateManager`](crate::manager::CertificateManager)

use std::fmt::Debug;

use futures::{future, Stream, StreamExt};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::ListParams,
        runtime::{watcher, WatchStreamExt},
        Api, Resource,
    },
    namespace::WatchNamespace,
};
use tracing::warn;

use crate::{
    crd::{Certificate, ObjectKey},
    manager::Event,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list {kind}s"))]
    List {
        source: kube::Error,
        kind: &'static str,
    },
}

/// All changes to Certificates and Secrets in `namespace`.
pub fn events(client: &Client, namespace: &WatchNamespace) -> impl Stream<Item = Event> + Send {
    futures::stream::select(
        object_events(namespace.get_api::<Certificate>(client), |key, certificate| {
            Event::Certificate { key, certificate }
        }),
        object_events(namespace.get_api::<Secret>(client), |key, secret| {
            Event::Secret { key, secret }
        }),
    )
}

/// Watches `api`, turning each watch event into an [`Event`].
fn object_events<K>(
    api: Api<K>,
    into_event: fn(ObjectKey, Option<K>) -> Event,
) -> impl Stream<Item = Event> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |result| {
            future::ready(match result {
                Ok(event) => to_event(event, into_event),
                Err(err) => {
                    warn!(
                        error = &err as &dyn std::error::Error,
                        "watch failed, retrying"
                    );
                    None
                }
            })
        })
}

/// Only explicit deletions are reported as deleted. Objects that are (re)listed while the watch
/// initializes are reported as present.
fn to_event<K: Resource>(
    event: watcher::Event<K>,
    into_event: fn(ObjectKey, Option<K>) -> Event,
) -> Option<Event> {
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
            Some(into_event(ObjectKey::of(&obj), Some(obj)))
        }
        watcher::Event::Delete(obj) => Some(into_event(ObjectKey::of(&obj), None)),
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Lists all Certificates and Secrets in `namespace`, for [`recover`](crate::manager::CertificateManager::recover).
pub async fn list_all(
    client: &Client,
    namespace: &WatchNamespace,
) -> Result<(Vec<Certificate>, Vec<Secret>), Error> {
    let certificates = list(namespace.get_api::<Certificate>(client), "Certificate").await?;
    let secrets = list(namespace.get_api::<Secret>(client), "Secret").await?;
    Ok((certificates, secrets))
}

async fn list<K>(api: Api<K>, kind: &'static str) -> Result<Vec<K>, Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api
        .list(&ListParams::default())
        .await
        .context(ListSnafu { kind })?
        .items)
}
