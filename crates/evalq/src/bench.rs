use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use evalq_engine::{BridgeError, BridgeHandle, CalcEvaluator, JobOutput, JobTicket};

const BENCH_SETUP: &str = "x = 0";
const BENCH_INPUT: &str = "x = x + 1; x * 2";

pub async fn run_benchmark(
    handle: BridgeHandle<CalcEvaluator>,
    jobs: u32,
    contexts: u16,
) -> anyhow::Result<i32> {
    let bridge = handle.bridge();
    let contexts = usize::from(contexts.max(1));
    let sessions = (0..contexts)
        .map(|_| bridge.session())
        .collect::<Result<Vec<_>, _>>()
        .context("open benchmark contexts")?;
    for session in &sessions {
        check_output(&session.run(BENCH_SETUP).await?)?;
    }

    println!("Jobs: {}", format_number(u64::from(jobs)));
    println!("Contexts: {}", format_number(contexts as u64));
    println!(
        "Queue capacity: {}",
        format_number(bridge.config().queue_capacity as u64)
    );

    let pb = ProgressBar::new(u64::from(jobs));
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {per_sec} {msg}")?
            .progress_chars("#--"),
    );

    let started_at = Instant::now();
    let mut in_flight: VecDeque<JobTicket> = VecDeque::new();
    for i in 0..jobs as usize {
        let target = sessions[i % contexts].handle();
        loop {
            match bridge.submit(Some(target), BENCH_INPUT) {
                Ok(ticket) => {
                    in_flight.push_back(ticket);
                    break;
                }
                Err(BridgeError::QueueFull { .. }) => {
                    let Some(oldest) = in_flight.pop_front() else {
                        anyhow::bail!("queue full with no benchmark job in flight");
                    };
                    check_output(&oldest.output().await?)?;
                    pb.inc(1);
                }
                Err(err) => return Err(err).context("submit benchmark job"),
            }
        }
    }
    while let Some(ticket) = in_flight.pop_front() {
        check_output(&ticket.output().await?)?;
        pb.inc(1);
    }
    let duration = started_at.elapsed();
    pb.finish_and_clear();

    for (idx, session) in sessions.iter().enumerate() {
        let out = session.run("x").await?;
        check_output(&out)?;
        validate_count(&out.stdout, jobs_for_context(jobs, contexts, idx))
            .with_context(|| format!("context {}", session.handle()))?;
    }

    let jobs_per_sec = f64::from(jobs) / duration.as_secs_f64().max(f64::EPSILON);
    println!("Duration: {}", format_duration(duration));
    println!("Throughput: {:.2} jobs/s", jobs_per_sec);

    drop(sessions);
    handle.request_stop();
    handle.wait().await?;
    Ok(0)
}

fn check_output(out: &JobOutput) -> anyhow::Result<()> {
    if !out.success() {
        anyhow::bail!("benchmark job {} failed: {}", out.job_id, out.stderr.trim_end());
    }
    Ok(())
}

fn jobs_for_context(jobs: u32, contexts: usize, idx: usize) -> u64 {
    let jobs = jobs as usize;
    let extra = usize::from(idx < jobs % contexts);
    (jobs / contexts + extra) as u64
}

fn validate_count(stdout: &str, expected: u64) -> anyhow::Result<()> {
    let got: u64 = stdout
        .trim()
        .parse()
        .with_context(|| format!("unexpected output {stdout:?}"))?;
    if got != expected {
        anyhow::bail!("counter mismatch (got {got}, expected {expected})");
    }
    Ok(())
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 1.0 {
        format!("{:.1}ms", secs * 1_000.0)
    } else if secs < 60.0 {
        format!("{secs:.2}s")
    } else {
        let whole = duration.as_secs();
        format!("{}m{:02}s", whole / 60, whole % 60)
    }
}
