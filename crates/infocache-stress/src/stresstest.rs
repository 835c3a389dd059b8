use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use infocache::{Config, LockManager, metric};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{RecordCache, WorkloadsConfig, process_unit};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // all workloads share one manager, like independent caches in a single service would
    let manager = LockManager::from_config(&config);

    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let cache = RecordCache::from_config(&manager, &format!("workload{i}"), &config);
            (Arc::new(workload), cache)
        })
        .collect();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (workload, cache) in workloads.iter().cloned() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
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
                        let cache = cache.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);

                        tokio::task::spawn_blocking(move || {
                            let task_start = Instant::now();
                            if let Err(error) = process_unit(&cache, &workload) {
                                tracing::trace!(%error, "Unit of work failed");
                                failures.fetch_add(1, Ordering::Relaxed);
                            }
                            let elapsed = task_start.elapsed();
                            metric!(timer("stress.unit.duration") = elapsed, "cache" => cache.name());
                            task_durations.lock().unwrap().add(elapsed.as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            (concurrency, task_durations, failures.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, failures) = task?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed"
        );

        if ops > 0 {
            let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
            let quantile = |q| {
                let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(secs)
            };
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        let (_, cache) = &workloads[i];
        println!(
            "  cache {}: {} entries, {} unused (max {})",
            cache.name(),
            cache.len(),
            cache.gc_queue_len(),
            cache.max_size()
        );
    }

    let (created, free) = manager.mutex_stats();
    println!();
    println!("Load mutexes: {created} created, {free} pooled");

    Ok(())
}
