use crate::output::print_json;
use anyhow::Context;
use harness_core::feature::TransitionOpts;
use harness_core::types::Event;
use std::path::Path;

pub fn run(
    root: &Path,
    id: &str,
    event: &str,
    skip_verification: bool,
    reason: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let event: Event = event.parse().map_err(anyhow::Error::msg)?;
    if !event.is_manual() {
        anyhow::bail!("'{event}' is recorded by 'harness verify {id}', not set by hand");
    }

    let opts = TransitionOpts {
        skip_verification,
        reason,
        ..Default::default()
    };
    let registry = super::open_registry(root)?;
    let feature = registry
        .transition(id, event, &opts)
        .with_context(|| format!("cannot apply '{event}' to '{id}'"))?;

    if json {
        print_json(&feature)?;
    } else if feature.is_verified_by_override() {
        println!("'{id}' marked verified by override (verification skipped)");
    } else {
        println!("'{id}' is now {}", feature.status);
    }
    Ok(())
}
