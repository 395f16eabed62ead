use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, PostParams},
};
use owo_colors::OwoColorize;

use arl_common::wait::TokenBucket;
use arl_types::{Pool, PoolStatus};

use super::census::PoolCensus;
use crate::sinks::Sinks;
use crate::util::{self, Error, patch::patch_status};

/// Cap on in-flight pod create/delete API calls per reconciliation. A failing
/// call is logged and never aborts its peers; the deficit is re-detected on
/// the next pass.
pub(crate) const POD_OP_CONCURRENCY: usize = 20;

/// Create `count` pods from the prepared template. Returns how many creates
/// succeeded.
pub async fn create_pods(
    client: Client,
    namespace: &str,
    pool_name: &str,
    pod: &Pod,
    count: usize,
    bucket: &TokenBucket,
    sinks: &Sinks,
) -> usize {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    stream::iter(0..count)
        .map(|_| {
            let api = api.clone();
            let pod = pod.clone();
            async move {
                pace(bucket).await;
                match api.create(&PostParams::default(), &pod).await {
                    Ok(created) => {
                        sinks.metrics.pod_created(pool_name, "scale-up");
                        println!(
                            "{} {}",
                            "📦 Created pool pod".green(),
                            format!("{namespace}/{}", created.name_any()).green().dimmed(),
                        );
                        true
                    }
                    Err(e) => {
                        eprintln!(
                            "{}",
                            format!("failed to create pod for pool {namespace}/{pool_name}: {e}")
                                .red()
                        );
                        false
                    }
                }
            }
        })
        .buffer_unordered(POD_OP_CONCURRENCY)
        .filter(|ok| futures::future::ready(*ok))
        .count()
        .await
}

/// Delete the named pods, same concurrency and isolation rules as creation.
/// Only ever invoked with idle victims; allocated pods are untouchable here.
pub async fn delete_pods(
    client: Client,
    namespace: &str,
    pool_name: &str,
    victims: &[String],
    reason: &str,
    bucket: &TokenBucket,
    sinks: &Sinks,
) -> usize {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    stream::iter(victims.iter().cloned())
        .map(|name| {
            let api = api.clone();
            let reason = reason.to_string();
            async move {
                pace(bucket).await;
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {
                        sinks.metrics.pod_deleted(pool_name, &reason);
                        println!(
                            "{} {} {}",
                            "🗑️ Deleted pool pod".yellow(),
                            format!("{namespace}/{name}").yellow().dimmed(),
                            format!("({reason})").yellow().dimmed(),
                        );
                        true
                    }
                    Err(kube::Error::Api(ae)) if ae.code == 404 => true,
                    Err(e) => {
                        eprintln!(
                            "{}",
                            format!("failed to delete pod {namespace}/{name}: {e}").red()
                        );
                        false
                    }
                }
            }
        })
        .buffer_unordered(POD_OP_CONCURRENCY)
        .filter(|ok| futures::future::ready(*ok))
        .count()
        .await
}

async fn pace(bucket: &TokenBucket) {
    while let Err(wait) = bucket.try_acquire() {
        tokio::time::sleep(wait).await;
    }
}

/// The status fields this reconciliation wants persisted.
pub fn desired_status(census: &PoolCensus, desired: i32, allocated: i32) -> PoolStatus {
    let ready = census.idle_ready as i32;
    let target_idle = (desired - allocated).max(0);
    let mut conditions = Vec::new();
    conditions.push(util::condition(
        "Ready",
        ready >= target_idle,
        if ready >= target_idle {
            "PoolSaturated"
        } else {
            "Scaling"
        },
        &format!("{ready}/{target_idle} idle pods ready"),
    ));
    let failing = census.failing.last();
    conditions.push(util::condition(
        "PodsFailing",
        failing.is_some(),
        failing.map(|f| f.reason.as_str()).unwrap_or("AllHealthy"),
        failing.map(|f| f.message.as_str()).unwrap_or(""),
    ));
    PoolStatus {
        ready_replicas: ready,
        allocated_replicas: allocated,
        conditions,
        last_updated: None,
    }
}

/// Compare everything except timestamps, so a no-change reconciliation stays
/// write-free.
pub fn status_changed(current: Option<&PoolStatus>, desired: &PoolStatus) -> bool {
    let Some(current) = current else {
        return true;
    };
    if current.ready_replicas != desired.ready_replicas
        || current.allocated_replicas != desired.allocated_replicas
        || current.conditions.len() != desired.conditions.len()
    {
        return true;
    }
    current.conditions.iter().zip(&desired.conditions).any(|(a, b)| {
        a.type_ != b.type_ || a.status != b.status || a.reason != b.reason || a.message != b.message
    })
}

pub async fn update_status(
    client: Client,
    pool: &Pool,
    desired: PoolStatus,
) -> Result<(), Error> {
    patch_status(client, "update status of Pool", pool, |status: &mut PoolStatus| {
        status.ready_replicas = desired.ready_replicas;
        status.allocated_replicas = desired.allocated_replicas;
        status.conditions = desired.conditions;
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn census(ready: usize, failing: bool) -> PoolCensus {
        let mut census = PoolCensus {
            idle_ready: ready,
            ..Default::default()
        };
        if failing {
            census.failing.push(super::super::census::PodFailure {
                pod: "p".into(),
                uid: "u".into(),
                container: "main".into(),
                reason: "CrashLoopBackOff".into(),
                message: "boom".into(),
            });
        }
        census
    }

    #[test]
    fn ready_accounts_for_allocated_pods() {
        let status = desired_status(&census(1, false), 3, 2);
        let ready = &status.conditions[0];
        assert_eq!(ready.type_, "Ready");
        assert_eq!(ready.status, "True", "1 idle-ready suffices when 2 of 3 are allocated");
    }

    #[test]
    fn failing_condition_carries_latest_message() {
        let status = desired_status(&census(0, true), 1, 0);
        let failing = &status.conditions[1];
        assert_eq!(failing.status, "True");
        assert_eq!(failing.reason, "CrashLoopBackOff");
        assert_eq!(failing.message, "boom");
    }

    #[test]
    fn unchanged_status_produces_no_write() {
        let desired = desired_status(&census(2, false), 2, 0);
        let mut stored = desired.clone();
        stored.last_updated = Some(util::now());
        assert!(!status_changed(Some(&stored), &desired));
        assert!(status_changed(None, &desired));
        let bumped = desired_status(&census(1, false), 2, 0);
        assert!(status_changed(Some(&stored), &bumped));
    }
}
