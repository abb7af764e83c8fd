use crate::output::print_json;
use anyhow::Context;
use harness_core::registry::Registry;
use harness_core::runner::{VerificationReport, VerificationRunner};
use harness_core::HarnessError;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub fn run(root: &Path, id: Option<&str>, all_implemented: bool, json: bool) -> anyhow::Result<()> {
    let registry = super::open_registry(root)?;
    let runner = VerificationRunner::new(&registry).with_cancel(cancel_on_ctrl_c());

    match id {
        Some(id) if !all_implemented => verify_one(&registry, &runner, id, json),
        _ => verify_all(&runner, json),
    }
}

fn verify_one(
    registry: &Registry,
    runner: &VerificationRunner<'_>,
    id: &str,
    json: bool,
) -> anyhow::Result<()> {
    match runner.verify(id) {
        Ok(report) => {
            if json {
                print_json(&report)?;
            } else {
                print_passed(&report);
            }
            Ok(())
        }
        Err(e @ HarnessError::VerificationFailed { .. }) => {
            print_failed(registry, id, json)?;
            Err(e).with_context(|| format!("'{id}' did not pass verification"))
        }
        Err(e) => Err(e).with_context(|| format!("failed to verify '{id}'")),
    }
}

fn verify_all(runner: &VerificationRunner<'_>, json: bool) -> anyhow::Result<()> {
    let outcomes = runner
        .verify_all_implemented()
        .context("failed to list implemented features")?;

    let mut rows = Vec::with_capacity(outcomes.len());
    let mut last_err = None;
    for o in outcomes {
        match o.outcome {
            Ok(report) => {
                if !json {
                    println!("{:<24} verified ({} attempt(s))", o.id, report.attempts.len());
                }
                rows.push(serde_json::json!({ "id": o.id, "passed": true, "report": report }));
            }
            Err(e) => {
                if !json {
                    println!("{:<24} {e}", o.id);
                }
                rows.push(serde_json::json!({ "id": o.id, "passed": false, "error": e.to_string() }));
                last_err = Some(e);
            }
        }
    }

    if json {
        print_json(&rows)?;
    } else if rows.is_empty() {
        println!("No implemented features awaiting verification.");
    }

    match last_err {
        Some(e) => Err(e).context("one or more features did not pass verification"),
        None => Ok(()),
    }
}

fn print_passed(report: &VerificationReport) {
    println!(
        "'{}' verified ({} attempt(s))",
        report.feature,
        report.attempts.len()
    );
    if let (Some(class), Some(hint)) = (report.classification, &report.root_cause) {
        println!(
            "Passed after {} failed attempt(s); earlier failures looked like {class}: {hint}",
            report.failed_attempts()
        );
    }
}

fn print_failed(registry: &Registry, id: &str, json: bool) -> anyhow::Result<()> {
    let feature = registry
        .get(id)
        .with_context(|| format!("failed to reload feature '{id}'"))?;
    if json {
        return print_json(&serde_json::json!({
            "feature": feature.id,
            "status": feature.status,
            "retry_count": feature.retry_count,
            "classification": feature.last_failure_class,
            "root_cause": feature.last_failure_class.map(|c| c.root_cause_hint()),
            "output": feature.last_verification_output,
        }));
    }

    if let Some(output) = &feature.last_verification_output {
        println!("{output}");
    }
    if let Some(class) = feature.last_failure_class {
        println!("\nRoot cause ({class}): {}", class.root_cause_hint());
    }
    println!("Next: fix the feature, then 'harness update {id} resume'");
    Ok(())
}

/// Cancel the returned token on Ctrl-C. Verification children run in their
/// own process group, so the interrupt reaches them only through the token.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::debug!("no signal runtime, Ctrl-C will not cancel: {e}");
                return;
            }
        };
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling verification");
                trigger.cancel();
            }
        });
    });
    token
}
