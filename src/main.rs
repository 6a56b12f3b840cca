use serde::Serialize;
use skipseg_lib::commands::{diagnostics, segments, stats};
use skipseg_lib::error::AppError;
use skipseg_lib::worker::{AnalysisStatus, AnalysisWorker};
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "usage: skipseg <command>

commands:
  status
  diagnostics
  retrain
  segments <source> <series> <episode> [episode_id]
  analyze <source> <series> <episode> <episode_id>
  scan <source> <series> [count]
  series <source> <series>
  correct <source> <series> <episode> <opening|ending> <start> <end>
  reset <source> <series> <episode>";

const POLL_INTERVAL: Duration = Duration::from_secs(2);

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn episode_number(arg: &str) -> Result<i64, AppError> {
    arg.parse()
        .map_err(|_| AppError::Validation(format!("episode must be a number, got '{}'", arg)))
}

fn seconds(arg: &str) -> Result<f64, AppError> {
    arg.parse()
        .map_err(|_| AppError::Validation(format!("expected seconds, got '{}'", arg)))
}

/// Wait for background work, stopping it early on Ctrl-C.
async fn wait_or_interrupt(worker: &Arc<AnalysisWorker>) {
    tokio::select! {
        _ = worker.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, cancelling background analyses");
        }
    }
}

async fn run(worker: &Arc<AnalysisWorker>, args: &[String]) -> Result<(), AppError> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["status"] => {
            print_json(&stats::ml_status(worker).await?)?;
            print_json(&stats::get_segment_stats(worker).await?)
        }
        ["diagnostics"] => print_json(&diagnostics::get_diagnostics(worker).await?),
        ["retrain"] => {
            let status = stats::retrain_model(worker).await?;
            print_json(&status)?;
            wait_or_interrupt(worker).await;
            print_json(&stats::ml_status(worker).await?)
        }
        ["segments", source, series, episode, rest @ ..] if rest.len() <= 1 => {
            let episode = episode_number(episode)?;
            let episode_id = rest.first().map(|s| s.to_string());
            loop {
                let response = segments::get_skip_segments(
                    worker,
                    series.to_string(),
                    source.to_string(),
                    episode,
                    episode_id.clone(),
                )
                .await?;
                if response.status != AnalysisStatus::Analyzing {
                    return print_json(&response);
                }
                log::info!("Analysis in progress, checking again in {:?}", POLL_INTERVAL);
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = tokio::signal::ctrl_c() => return print_json(&response),
                }
            }
        }
        ["analyze", source, series, episode, episode_id] => {
            let result = segments::analyze_episode(
                worker,
                series.to_string(),
                source.to_string(),
                episode_number(episode)?,
                episode_id.to_string(),
            )
            .await?;
            print_json(&result)
        }
        ["scan", source, series, rest @ ..] if rest.len() <= 1 => {
            let count = rest
                .first()
                .map(|c| {
                    c.parse::<usize>()
                        .map_err(|_| AppError::Validation(format!("count must be a number, got '{}'", c)))
                })
                .transpose()?;
            let batch =
                segments::scan_series(worker, series.to_string(), source.to_string(), count).await?;
            print_json(&batch)?;
            wait_or_interrupt(worker).await;
            Ok(())
        }
        ["series", source, series] => {
            let batch =
                segments::analyze_series(worker, series.to_string(), source.to_string()).await?;
            print_json(&batch)?;
            wait_or_interrupt(worker).await;
            Ok(())
        }
        ["correct", source, series, episode, segment_type, start, end] => {
            let segment = segments::correct_skip_segment(
                worker,
                series.to_string(),
                source.to_string(),
                episode_number(episode)?,
                segment_type.to_string(),
                seconds(start)?,
                seconds(end)?,
            )
            .await?;
            print_json(&segment)
        }
        ["reset", source, series, episode] => {
            let removed = segments::delete_skip_segments(
                worker,
                series.to_string(),
                source.to_string(),
                episode_number(episode)?,
            )
            .await?;
            println!("removed {} segment(s)", removed);
            Ok(())
        }
        _ => Err(AppError::Validation(USAGE.to_string())),
    }
}

#[tokio::main]
async fn main() {
    skipseg_lib::init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || matches!(args[0].as_str(), "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return;
    }

    let project_dir = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    let worker = match skipseg_lib::build_worker(&project_dir) {
        Ok(worker) => worker,
        Err(e) => {
            log::error!("Failed to initialize: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = run(&worker, &args).await;
    worker.shutdown().await;

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
