use crate::output::print_json;
use anyhow::Context;
use harness_core::types::FeatureStatus;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let registry = super::open_registry(root)?;
    let features = registry.list(None).context("failed to load state")?;
    let summary = registry.summary().context("failed to load state")?;
    let session = registry.current_session().context("failed to load state")?;
    let next = registry.next_feature().context("failed to load state")?;
    let overrides: Vec<&str> = features
        .iter()
        .filter(|f| f.is_verified_by_override())
        .map(|f| f.id.as_str())
        .collect();

    if json {
        print_json(&serde_json::json!({
            "summary": summary,
            "session": session,
            "next": next.as_ref().map(|f| f.id.as_str()),
            "overrides": overrides,
        }))?;
        return Ok(());
    }

    println!("Features: {} total", summary.total);
    for status in FeatureStatus::all() {
        println!("  {:<12} {}", status.as_str(), summary.count(*status));
    }

    match &session {
        Some(s) => println!(
            "Session: #{} (started {})",
            s.session_number,
            s.started_at.format("%Y-%m-%d %H:%M")
        ),
        None => println!("Session: none open"),
    }

    if summary.implemented > 0 {
        println!(
            "\n{} feature(s) await verification: harness verify --all-implemented",
            summary.implemented
        );
    }
    if !overrides.is_empty() {
        println!("Verified by override: {}", overrides.join(", "));
    }
    if let Some(f) = next {
        println!("Next: {} [{}] {}", f.id, f.status, f.description);
    }
    Ok(())
}
