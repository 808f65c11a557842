use std::path::PathBuf;
use std::sync::Arc;

use hs_runner::{
    init_logging, DataLoader, JobRunner, MessageNotifier, ObjectiveOutput, RunOptions, StepResult,
    TracingSink, TrialContext,
};
use hs_types::{GroupSpec, JobOverrides, JobSpec, Metric};
use rand::Rng;
use tracing::info;

/// Sweeps a noisy quadratic; the dataset is the set of target points.
fn objective(ctx: &TrialContext) -> anyhow::Result<ObjectiveOutput> {
    let targets = ctx.load_data::<Vec<f64>>()?;
    let x = ctx.param("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let steps = ctx.param("steps").and_then(|v| v.as_i64()).unwrap_or(5).max(1) as usize;
    let mut rng = ctx.seeded_rng("rand", 42)?;

    let results: Vec<anyhow::Result<StepResult>> = (1..=steps)
        .map(|step| {
            let error: f64 = targets.iter().map(|t| (x - t).powi(2)).sum::<f64>() / targets.len() as f64;
            let noise: f64 = rng.random_range(0.0..0.1);
            Ok(StepResult::new().metric("loss", error * (1.0 + noise) / step as f64))
        })
        .collect();
    Ok(ObjectiveOutput::sequence(results))
}

fn demo_group() -> anyhow::Result<JobSpec> {
    let group = GroupSpec::new("quadratic", 20)
        .with_metric(Metric::minimize("loss"))
        .with_param("steps", 5i64)
        .with_distribution("x", "uniform(-4.0, 4.0)")?
        .with_pruner("median");
    Ok(JobSpec::Group(group))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = std::env::var("HYPERSWEEP_LOG_DIR").ok().map(PathBuf::from);
    init_logging("hs-sweep-demo", log_dir.as_deref())?;

    // usage: hs-sweep-demo [job.json] [num_trials]
    let mut args = std::env::args().skip(1);
    let job = match args.next() {
        Some(path) => serde_json::from_str::<JobSpec>(&std::fs::read_to_string(&path)?)?,
        None => demo_group()?,
    };
    let num_trials = args.next().map(|n| n.parse::<usize>()).transpose()?;
    let job = job.with_overrides(JobOverrides {
        num_trials,
        ..Default::default()
    });

    let mut settings = hs_types::Settings::from_env();
    if settings.study_storage_uri.is_none() {
        settings = settings.with_study_storage("memory://");
    }

    let runner = JobRunner::new(settings)
        .with_options(RunOptions {
            log_system_info: true,
            log_seeds: true,
            isolate_observer_errors: true,
            ..Default::default()
        })
        .with_callback(Arc::new(MessageNotifier::new(TracingSink)))
        .with_data_loader(DataLoader::new(|| Ok(vec![1.5f64, 2.0, 2.5])));

    let report = runner.run(job, objective).await?;
    info!(job = %report.job, elapsed = ?report.elapsed, "Demo finished");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
