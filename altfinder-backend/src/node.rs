use crate::api::AltApi;
use crate::reconcile;
use crate::sync::{Subscription, SyncError, SyncListener};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First delay before subscribing again after the transport dropped us
const RESUBSCRIBE_MIN: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// A running engine: the sync listener plus the reconciler.
pub struct Node {
    api: AltApi,
    token: CancellationToken,
    listener: JoinHandle<()>,
    reconciler: JoinHandle<()>,
}

impl Node {
    /// Subscribe to peers, warm the cache, then start reconciling every
    /// `reconcile_every`. Subscribing first means no broadcast sent while
    /// warming is missed.
    ///
    /// If the warm-up fails, reads go to the store and the reconciler keeps
    /// retrying the warm-up before its first sweep.
    pub async fn start(api: AltApi, reconcile_every: Duration) -> Result<Self, SyncError> {
        let token = CancellationToken::new();

        let subscription = api.messenger().subscribe().await?;
        let listener = tokio::spawn(listen(api.clone(), subscription, token.child_token()));

        if let Err(e) = api.warm().await {
            warn!(error = %e, "cache warm-up failed, serving reads from the store");
        }

        let reconciler = reconcile::spawn(api.clone(), reconcile_every, token.child_token());

        info!(node_id = %api.node_id(), ?reconcile_every, "node started");
        Ok(Self {
            api,
            token,
            listener,
            reconciler,
        })
    }

    pub fn api(&self) -> &AltApi {
        &self.api
    }

    /// Stop both background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, task) in [("listener", self.listener), ("reconciler", self.reconciler)] {
            if let Err(e) = task.await {
                error!(error = %e, task = name, "background task failed");
            }
        }
        info!(node_id = %self.api.node_id(), "node stopped");
    }
}

/// Feed peer messages into the cache for as long as the node runs.
///
/// When the transport ends the subscription, reads fall back to the store,
/// the node subscribes again with backoff and then rebuilds its cache,
/// since deletes sent in the meantime were lost.
async fn listen(api: AltApi, mut subscription: Subscription, token: CancellationToken) {
    let listener = SyncListener::new(api.cache().clone(), api.node_id());
    loop {
        listener.clone().run(subscription, token.clone()).await;
        if token.is_cancelled() || api.messenger().is_standalone() {
            break;
        }

        warn!("sync subscription lost, resubscribing");
        api.mark_stale();
        subscription = match resubscribe(&api, &token).await {
            Some(subscription) => subscription,
            None => break,
        };
        // Messages arriving meanwhile wait in the new subscription
        if !rebuild(&api, &token).await {
            break;
        }
    }
    debug!("sync listener stopped");
}

/// Sleep for `delay` unless `token` is cancelled first. Returns whether to go on.
async fn backoff(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Subscribe again, doubling the delay after every failure. `None` once
/// `token` is cancelled.
async fn resubscribe(api: &AltApi, token: &CancellationToken) -> Option<Subscription> {
    let mut delay = RESUBSCRIBE_MIN;
    loop {
        if !backoff(delay, token).await {
            return None;
        }
        match api.messenger().subscribe().await {
            Ok(subscription) => return Some(subscription),
            Err(e) => {
                delay = (delay * 2).min(RESUBSCRIBE_MAX);
                warn!(error = %e, retry_in = ?delay, "resubscribe failed");
            }
        }
    }
}

/// Resync the cache until it succeeds. `false` once `token` is cancelled.
async fn rebuild(api: &AltApi, token: &CancellationToken) -> bool {
    let mut delay = RESUBSCRIBE_MIN;
    loop {
        match api.resync().await {
            Ok(cached) => {
                info!(cached, "sync restored, cache rebuilt");
                return true;
            }
            Err(e) => {
                warn!(error = %e, retry_in = ?delay, "cache rebuild failed");
                if !backoff(delay, token).await {
                    return false;
                }
                delay = (delay * 2).min(RESUBSCRIBE_MAX);
            }
        }
    }
}
