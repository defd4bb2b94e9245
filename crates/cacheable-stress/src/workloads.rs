use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use cacheable::caching::{CachePolicy, Memoizer, NormalizedArgs, Producer};
use cacheable::config::Config;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Names the call site. A policy configured under this name is used unless `policy` is set.
    pub name: String,
    pub concurrency: usize,
    /// Calls draw their argument uniformly from this many distinct values.
    pub distinct_args: usize,
    /// How long a producer invocation takes.
    #[serde(with = "humantime_serde", default)]
    pub latency: Duration,
    /// The share of producer invocations that fail.
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default, skip_serializing)]
    pub policy: Option<CachePolicy>,
}

/// A producer simulating a backend request.
#[derive(Clone, Debug)]
pub struct SimulatedBackend {
    latency: Duration,
    failure_rate: f64,
    invocations: Arc<AtomicUsize>,
}

impl SimulatedBackend {
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }
}

impl Producer for SimulatedBackend {
    type Output = Value;
    type Error = String;
    type Future = BoxFuture<'static, Result<Value, String>>;

    fn produce(&self, args: NormalizedArgs) -> Self::Future {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let fails = rand::rng().random_bool(self.failure_rate.clamp(0.0, 1.0));
        let latency = self.latency;

        async move {
            tokio::time::sleep(latency).await;
            if fails {
                return Err("simulated backend failure".to_owned());
            }
            Ok(json!({ "payload": args.into_inner() }))
        }
        .boxed()
    }
}

pub struct PreparedWorkload {
    pub name: String,
    pub concurrency: usize,
    pub distinct_args: usize,
    pub backend: SimulatedBackend,
    pub memoizer: Memoizer<SimulatedBackend>,
}

pub fn prepare_workload(config: &mut Config, workload: Workload) -> Result<PreparedWorkload> {
    if let Some(policy) = workload.policy {
        config.caches.insert(workload.name.clone(), policy);
    }
    let cache_config = config
        .cache_config(&workload.name)
        .with_context(|| format!("failed to configure workload {}", workload.name))?;

    let backend = SimulatedBackend {
        latency: workload.latency,
        failure_rate: workload.failure_rate,
        invocations: Default::default(),
    };

    Ok(PreparedWorkload {
        name: workload.name,
        concurrency: workload.concurrency.max(1),
        distinct_args: workload.distinct_args.max(1),
        memoizer: Memoizer::new(cache_config, backend.clone()),
        backend,
    })
}

/// Calls the workload's call site with a random argument.
pub async fn process_call(workload: &PreparedWorkload) -> bool {
    let arg = rand::rng().random_range(0..workload.distinct_args);
    let result = workload.memoizer.call(format!("arg{arg}").as_str()).await;
    result.is_ok()
}
