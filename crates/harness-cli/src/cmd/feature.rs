use crate::output::{feature_row, print_json, print_table, FEATURE_HEADERS};
use anyhow::Context;
use harness_core::feature::Feature;
use harness_core::types::FeatureStatus;
use std::path::Path;

/// Entries of `history` shown by `show`.
const SHOWN_HISTORY: usize = 10;

pub fn add(
    root: &Path,
    id: &str,
    description: &str,
    verify: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let registry = super::open_registry(root)?;
    let feature = registry
        .create(id, description, verify.unwrap_or_default())
        .with_context(|| format!("failed to create feature '{id}'"))?;

    if json {
        print_json(&feature)?;
    } else {
        println!("Created feature: {id}");
        if let Some(task) = &feature.external_task_ref {
            println!("Tracker task: {task}");
        }
        if feature.verification_command.is_empty() {
            println!("No verification command set; 'harness verify {id}' will be unavailable");
        }
    }
    Ok(())
}

pub fn list(root: &Path, status: Option<&str>, json: bool) -> anyhow::Result<()> {
    let filter = status
        .map(|s| s.parse::<FeatureStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    let registry = super::open_registry(root)?;
    let features = registry.list(filter).context("failed to list features")?;

    if json {
        print_json(&features)?;
        return Ok(());
    }

    if features.is_empty() {
        println!("No features.");
        return Ok(());
    }
    print_table(&FEATURE_HEADERS, features.iter().map(feature_row).collect());
    Ok(())
}

pub fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let registry = super::open_registry(root)?;
    let feature = registry
        .get(id)
        .with_context(|| format!("failed to load feature '{id}'"))?;

    if json {
        print_json(&feature)?;
        return Ok(());
    }
    print_feature(&feature);
    Ok(())
}

pub fn next(root: &Path, json: bool) -> anyhow::Result<()> {
    let registry = super::open_registry(root)?;
    let next = registry.next_feature().context("failed to load state")?;

    if json {
        print_json(&next)?;
        return Ok(());
    }
    match next {
        Some(f) => {
            println!("{} [{}] {}", f.id, f.status, f.description);
            let hint = match f.status {
                FeatureStatus::InProgress => format!("harness update {} complete", f.id),
                FeatureStatus::Pending => format!("harness update {} start", f.id),
                _ => format!("harness verify {}", f.id),
            };
            println!("Next: {hint}");
        }
        None => println!("Nothing to do: every feature is verified or failed."),
    }
    Ok(())
}

fn print_feature(f: &Feature) {
    println!("Feature:  {}", f.id);
    println!("Desc:     {}", f.description);
    println!("Status:   {}", f.status);
    if !f.verification_command.is_empty() {
        println!("Verify:   {}", f.verification_command);
    }
    if let Some(task) = &f.external_task_ref {
        println!("Task:     {task}");
    }
    println!("Retries:  {}", f.retry_count);
    if let Some(via) = f.verified_via {
        match &f.override_reason {
            Some(reason) => println!("Via:      {via} ({reason})"),
            None => println!("Via:      {via}"),
        }
    }
    if let Some(at) = f.last_verified_at {
        println!("Verified: {}", at.format("%Y-%m-%d %H:%M"));
    }
    if let Some(class) = f.last_failure_class {
        println!("Failure:  {class}: {}", class.root_cause_hint());
    }
    println!("Created:  {}", f.created_at.format("%Y-%m-%d %H:%M"));

    if !f.history.is_empty() {
        println!("\nHistory:");
        let skip = f.history.len().saturating_sub(SHOWN_HISTORY);
        for h in &f.history[skip..] {
            let session = h.session.map(|n| format!(" (session {n})")).unwrap_or_default();
            println!(
                "  {}  {:<8} {} -> {}{session}",
                h.at.format("%Y-%m-%d %H:%M"),
                h.event.as_str(),
                h.from,
                h.to
            );
        }
    }

    if let Some(output) = &f.last_verification_output {
        println!("\nLast verification output:\n{output}");
    }
}
