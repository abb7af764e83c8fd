use crate::output::print_json;
use anyhow::Context;
use harness_core::config::Config;
use harness_core::feature::FeatureSpec;
use serde::Deserialize;
use std::path::Path;

/// Feature list file: a bare list, or a document with a `features` key.
#[derive(Deserialize)]
#[serde(untagged)]
enum FeatureList {
    Bare(Vec<FeatureSpec>),
    Wrapped { features: Vec<FeatureSpec> },
}

impl FeatureList {
    fn into_specs(self) -> Vec<FeatureSpec> {
        match self {
            FeatureList::Bare(specs) | FeatureList::Wrapped { features: specs } => specs,
        }
    }
}

pub fn run(root: &Path, features: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let specs = match features {
        Some(path) => load_feature_list(path)?,
        None => Vec::new(),
    };

    let config_created =
        Config::write_default_if_missing(root).context("failed to write config.yaml")?;
    let registry = super::open_registry(root)?;
    let report = registry
        .initialize(&specs)
        .context("failed to initialize harness")?;

    if json {
        print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "config_created": config_created,
            "created": report.created,
            "skipped": report.skipped,
            "session": report.session,
        }))?;
        return Ok(());
    }

    println!("Initialized harness in: {}", root.display());
    if config_created {
        println!("  created: .harness/config.yaml");
    } else {
        println!("  exists:  .harness/config.yaml");
    }
    for id in &report.created {
        println!("  added:   {id}");
    }
    for id in &report.skipped {
        println!("  exists:  {id}");
    }
    if let Some(stale) = report.session.recovered {
        println!("Closed stale session #{stale} left open by a previous run");
    }
    println!("Session #{} started", report.session.session_number);
    Ok(())
}

fn load_feature_list(path: &Path) -> anyhow::Result<Vec<FeatureSpec>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read feature list {}", path.display()))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let list: FeatureList = if is_json {
        serde_json::from_str(&data)
            .with_context(|| format!("invalid feature list {}", path.display()))?
    } else {
        serde_yaml::from_str(&data)
            .with_context(|| format!("invalid feature list {}", path.display()))?
    };
    Ok(list.into_specs())
}
