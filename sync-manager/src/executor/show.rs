//! Listing of available restore points.

use std::time::Instant;

use tracing::{info, warn};

use super::report::{RunMode, RunReport};
use super::SyncContext;
use crate::resolver::{authoritative, resolve, show_entries, BackupStatus, RestoreSelector};
use crate::storage::Region;
use crate::utils::Result;

/// List every backup of both regions and mark what `selector` resolves to.
/// Disagreement between regions degrades the report; only both regions
/// being unreachable is an error.
pub async fn run_show(ctx: &SyncContext, selector: &RestoreSelector) -> Result<RunReport> {
    let started = Instant::now();
    let mut report = RunReport::new(RunMode::Show, ctx.env);

    let listings = ctx.regions.listings().await;
    let (authority, _, fallback) = authoritative(&listings)?;
    report.degraded = fallback;

    for region in Region::ALL {
        match listings.get(region) {
            Ok(listing) => {
                for prefix in &listing.malformed {
                    report.warn(format!("unrecognised prefix '{}' in {} region", prefix, region));
                }
            }
            Err(e) => {
                report.degraded = true;
                report.warn(format!("{} region unavailable: {}", region, e));
            }
        }
    }

    report.backups = show_entries(&listings);
    if report
        .backups
        .iter()
        .any(|entry| entry.status != BackupStatus::Complete)
    {
        report.degraded = true;
    }

    match resolve(selector, &listings, false) {
        Ok(resolved) => report.selected = Some(resolved.timestamp),
        Err(e) => {
            warn!(%selector, error = %e, "Selector does not resolve");
            report.warn(format!("'{}' does not resolve: {}", selector, e));
        }
    }

    info!(
        authority = %authority,
        backups = report.backups.len(),
        degraded = report.degraded,
        "Listing complete"
    );
    report.duration = started.elapsed();
    Ok(report)
}
