use anyhow::{bail, Context, Result};
use guestlink::applicator::Applicator;
use guestlink::cache::Cache;
use guestlink::config::Settings;
use guestlink::dispatch::allow_list;
use guestlink::record::{parse_functions, CapabilitySet};
use tracing::{info, warn};

/// Which capabilities an `apply` run commits.
pub(crate) fn selected_capabilities(
    settings: &Settings,
    actions: &[String],
    force: bool,
) -> CapabilitySet {
    if actions.is_empty() {
        return settings.functions.clone();
    }
    let requested = parse_functions(&actions.join(","));
    if force {
        return requested;
    }

    let allowed = allow_list(&settings.functions, Some(&requested));
    for skipped in requested.difference(&allowed) {
        warn!(
            capability = %skipped,
            "Not in --functions, skipping (use --force to apply anyway)"
        );
    }
    allowed
}

pub async fn cmd_apply(settings: &Settings, force: bool, noop: bool, actions: Vec<String>) -> Result<()> {
    let capabilities = selected_capabilities(settings, &actions, force);
    let cache = Cache::new(&settings.cache);

    let report = Applicator::new(&cache)
        .backup(settings.backup)
        .noop(noop)
        .apply(&capabilities)
        .with_context(|| format!("Failed to apply cache at {}", settings.cache.display()))?;

    if noop {
        for planned in &report.written {
            println!("{} -> {}", planned.key, planned.destination.display());
        }
    } else {
        info!(written = report.written.len(), "Apply finished");
    }

    if !report.is_clean() {
        for (key, reason) in &report.failed {
            eprintln!("failed: {}: {}", key, reason);
        }
        bail!("{} cache entries could not be applied", report.failed.len());
    }
    Ok(())
}
