use crate::exit::GateBlocked;
use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use harness_core::gate::{GateDecision, SessionGate};
use std::path::Path;

#[derive(Subcommand)]
pub enum SessionSubcommand {
    /// Open a new session, closing any stale one
    Start,
    /// Check the session gate and close the session if allowed
    End,
}

pub fn run(root: &Path, subcmd: SessionSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        SessionSubcommand::Start => start(root, json),
        SessionSubcommand::End => end(root, json),
    }
}

fn start(root: &Path, json: bool) -> anyhow::Result<()> {
    let registry = super::open_registry(root)?;
    let started = registry.start_session().context("failed to start session")?;
    let summary = registry.summary().context("failed to load state")?;
    let next = registry.next_feature().context("failed to load state")?;

    if json {
        print_json(&serde_json::json!({
            "session": started,
            "summary": summary,
            "next": next.as_ref().map(|f| f.id.as_str()),
        }))?;
        return Ok(());
    }

    if let Some(stale) = started.recovered {
        println!("Closed stale session #{stale} left open by a previous run");
    }
    println!("Session #{} started", started.session_number);
    println!(
        "Progress: {}/{} verified, {} implemented, {} failed",
        summary.verified, summary.total, summary.implemented, summary.failed
    );
    if let Some(f) = next {
        println!("Next: {} [{}] {}", f.id, f.status, f.description);
    }
    Ok(())
}

fn end(root: &Path, json: bool) -> anyhow::Result<()> {
    let registry = super::open_registry(root)?;
    let decision = SessionGate::new(&registry)
        .check_session_end()
        .context("failed to check session gate")?;

    if json {
        print_json(&decision)?;
    }

    match decision {
        GateDecision::Blocked { features } => {
            if !json {
                println!("Cannot end session: these features are implemented but not verified:");
                for id in &features {
                    println!("  - {id}  (harness verify {id})");
                }
            }
            Err(GateBlocked(features).into())
        }
        GateDecision::Allowed {
            closed_session,
            failed,
        } => {
            if !json {
                match closed_session {
                    Some(n) => println!("Session #{n} closed"),
                    None => println!("No open session"),
                }
                if !failed.is_empty() {
                    println!("Warning: failed features remain: {}", failed.join(", "));
                }
            }
            Ok(())
        }
    }
}
