use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use cacheable::config::Config;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_call};

pub async fn perform_stresstest(
    mut config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .map(|workload| prepare_workload(&mut config, workload).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once so that every call site has seen a producer invocation
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_call(&workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);
        let concurrency = workload.concurrency;

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            if !process_call(&workload).await {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            transaction.finish();

                            if let Ok(mut task_durations) = task_durations.lock() {
                                task_durations.add(task_start.elapsed().as_secs_f64());
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = match task_durations.lock() {
                Ok(mut task_durations) => std::mem::take(&mut *task_durations),
                Err(_) => DDSketch::default(),
            };

            (task_durations, failures.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (workload, task) in workloads.iter().zip(finished_tasks) {
        let (task_durations, failures) = task?;
        let name = &workload.name;
        let concurrency = workload.concurrency;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {name} (concurrency: {concurrency}): {ops} calls, {ops_ps:.2} calls/s");

        let invocations = workload.backend.invocations();
        let share = invocations as f64 * 100.0 / ops.max(1) as f64;
        println!("  producer invocations: {invocations} ({share:.2}%); failed calls: {failures}");

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}
