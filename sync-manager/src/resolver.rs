//! Restore point resolution.
//!
//! Turns a `latest` or explicit selector into one backup that is sealed in
//! the authoritative region (primary, or secondary when primary cannot be
//! listed) and, unless forced, in the other region too.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::executor::manifest::BackupManifest;
use crate::storage::{Region, RegionListing, RegionListings, MANIFEST_FILE_NAME};
use crate::timestamp::BackupTimestamp;
use crate::utils::ResolveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSelector {
    Latest,
    At(BackupTimestamp),
}

impl FromStr for RestoreSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(RestoreSelector::Latest);
        }
        s.parse().map(RestoreSelector::At)
    }
}

impl fmt::Display for RestoreSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreSelector::Latest => f.write_str("latest"),
            RestoreSelector::At(ts) => write!(f, "{}", ts),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBackup {
    pub timestamp: BackupTimestamp,

    /// Region the backup is read from
    pub authority: Region,

    /// Set when a region could not be listed or a single-region backup was
    /// accepted with `--force`
    pub degraded: bool,

    /// The other region was listed and holds the sealed backup too
    pub other_region_verified: bool,
}

/// Pick the authoritative listing: primary, else secondary.
pub fn authoritative(
    listings: &RegionListings,
) -> Result<(Region, &RegionListing, bool), ResolveError> {
    match (&listings.primary, &listings.secondary) {
        (Ok(primary), _) => Ok((Region::Primary, primary, false)),
        (Err(e), Ok(secondary)) => {
            warn!(error = %e, "Primary region unavailable, falling back to secondary");
            Ok((Region::Secondary, secondary, true))
        }
        (Err(primary), Err(secondary)) => Err(ResolveError::Unavailable {
            primary: primary.clone(),
            secondary: secondary.clone(),
        }),
    }
}

/// Resolve `selector` against the listings of both regions.
pub fn resolve(
    selector: &RestoreSelector,
    listings: &RegionListings,
    force: bool,
) -> Result<ResolvedBackup, ResolveError> {
    let (authority, listing, mut degraded) = authoritative(listings)?;

    let timestamp = match selector {
        RestoreSelector::Latest => listing
            .sealed
            .iter()
            .next_back()
            .copied()
            .ok_or(ResolveError::NoBackupsFound { region: authority })?,
        RestoreSelector::At(ts) if listing.sealed.contains(ts) => *ts,
        RestoreSelector::At(ts) if listing.partial.contains(ts) => {
            return Err(ResolveError::Incomplete {
                timestamp: *ts,
                missing: vec![format!("{}/{} ({})", ts, MANIFEST_FILE_NAME, authority)],
            });
        }
        RestoreSelector::At(ts) => {
            return Err(ResolveError::BackupNotFound {
                timestamp: ts.to_string(),
            });
        }
    };

    let other = authority.other();
    let mut other_region_verified = false;
    match listings.get(other) {
        Ok(other_listing) if other_listing.sealed.contains(&timestamp) => {
            other_region_verified = true;
        }
        Ok(_) if force => {
            warn!(%timestamp, missing_in = %other, "Backup missing from one region, continuing (forced)");
            degraded = true;
        }
        Ok(_) => {
            return Err(ResolveError::RegionMismatch {
                timestamp,
                missing_in: other,
            });
        }
        Err(e) => {
            warn!(%timestamp, region = %other, error = %e, "Cannot cross-check region");
            degraded = true;
        }
    }

    Ok(ResolvedBackup {
        timestamp,
        authority,
        degraded,
        other_region_verified,
    })
}

/// Every archive named by `manifest` must be stored in the authoritative
/// region, and in the other region when it was verified.
pub fn check_complete(
    resolved: &ResolvedBackup,
    manifest: &BackupManifest,
    listings: &RegionListings,
) -> Result<(), ResolveError> {
    if manifest.timestamp != resolved.timestamp {
        return Err(ResolveError::ManifestUnreadable {
            timestamp: resolved.timestamp,
            reason: format!("manifest describes backup {}", manifest.timestamp),
        });
    }

    let mut regions = vec![resolved.authority];
    if resolved.other_region_verified {
        regions.push(resolved.authority.other());
    }

    let mut missing = Vec::new();
    for region in regions {
        let Ok(listing) = listings.get(region) else {
            continue;
        };
        for key in manifest.object_keys() {
            if !listing.has_key(&key) {
                missing.push(format!("{} ({})", key, region));
            }
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ResolveError::Incomplete {
            timestamp: resolved.timestamp,
            missing,
        })
    }
}

/// How a timestamp is held across the two regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Complete,
    PrimaryOnly,
    SecondaryOnly,
    Incomplete,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Complete => "complete",
            BackupStatus::PrimaryOnly => "primary-only",
            BackupStatus::SecondaryOnly => "secondary-only",
            BackupStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowEntry {
    pub timestamp: BackupTimestamp,
    pub status: BackupStatus,
}

/// Every timestamp known to either region, newest first. A region that
/// could not be listed contributes nothing.
pub fn show_entries(listings: &RegionListings) -> Vec<ShowEntry> {
    let empty = RegionListing::default();
    let primary = listings.primary.as_ref().unwrap_or(&empty);
    let secondary = listings.secondary.as_ref().unwrap_or(&empty);

    let all: BTreeSet<BackupTimestamp> = primary
        .timestamps()
        .union(&secondary.timestamps())
        .copied()
        .collect();

    all.into_iter()
        .rev()
        .map(|timestamp| {
            let status = match (
                primary.sealed.contains(&timestamp),
                secondary.sealed.contains(&timestamp),
            ) {
                (true, true) => BackupStatus::Complete,
                (true, false) => BackupStatus::PrimaryOnly,
                (false, true) => BackupStatus::SecondaryOnly,
                (false, false) => BackupStatus::Incomplete,
            };
            ShowEntry { timestamp, status }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::executor::manifest::{DbArchive, PathArchive};
    use crate::storage::object_key;
    use crate::utils::{StorageError, StorageErrorKind};
    use std::path::PathBuf;

    fn ts(raw: &str) -> BackupTimestamp {
        BackupTimestamp::parse(raw).unwrap()
    }

    fn sealed(stamps: &[&str]) -> RegionListing {
        RegionListing::from_keys(
            stamps
                .iter()
                .flat_map(|s| [format!("{}/manifest.json", s), format!("{}/svc-www-{}.tar.zst", s, s)]),
        )
    }

    fn listings(primary: RegionListing, secondary: RegionListing) -> RegionListings {
        RegionListings {
            primary: Ok(primary),
            secondary: Ok(secondary),
        }
    }

    fn unreachable(region: Region) -> StorageError {
        StorageError::new(StorageErrorKind::ListFailed, region, "", "connection refused")
    }

    const STAMPS: [&str; 3] = ["20240101-000000", "20240301-120000", "20240215-093000"];

    #[test]
    fn test_latest_is_newest_sealed() {
        let l = listings(sealed(&STAMPS), sealed(&STAMPS));
        let resolved = resolve(&RestoreSelector::Latest, &l, false).unwrap();

        assert_eq!(resolved.timestamp.to_string(), "20240301-120000");
        assert_eq!(resolved.authority, Region::Primary);
        assert!(!resolved.degraded);
        assert!(resolved.other_region_verified);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let l = listings(sealed(&STAMPS), sealed(&STAMPS));
        let first = resolve(&RestoreSelector::Latest, &l, false).unwrap();
        let second = resolve(&RestoreSelector::Latest, &l, false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_latest_ignores_unsealed_backups() {
        let mut primary = sealed(&["20240101-000000"]);
        primary = RegionListing::from_keys(
            primary
                .keys
                .into_iter()
                .chain(["20240501-000000/svc-www-20240501-000000.tar.zst".to_string()]),
        );
        let l = listings(primary, sealed(&["20240101-000000"]));

        let resolved = resolve(&RestoreSelector::Latest, &l, false).unwrap();
        assert_eq!(resolved.timestamp, ts("20240101-000000"));
    }

    #[test]
    fn test_explicit_missing_is_not_found() {
        let l = listings(sealed(&STAMPS), sealed(&STAMPS));
        let err = resolve(&RestoreSelector::At(ts("20240202-020202")), &l, false).unwrap_err();
        assert!(matches!(err, ResolveError::BackupNotFound { timestamp } if timestamp == "20240202-020202"));
    }

    #[test]
    fn test_explicit_partial_is_incomplete() {
        let primary = RegionListing::from_keys(["20240202-020202/svc-www-20240202-020202.tar.zst"]);
        let l = listings(primary, RegionListing::default());
        let err = resolve(&RestoreSelector::At(ts("20240202-020202")), &l, false).unwrap_err();
        assert!(matches!(err, ResolveError::Incomplete { .. }));
    }

    #[test]
    fn test_no_backups() {
        let l = listings(RegionListing::default(), sealed(&STAMPS));
        let err = resolve(&RestoreSelector::Latest, &l, false).unwrap_err();
        assert!(matches!(err, ResolveError::NoBackupsFound { region: Region::Primary }));
    }

    #[test]
    fn test_region_mismatch_and_force() {
        let l = listings(sealed(&STAMPS), sealed(&["20240101-000000"]));

        let err = resolve(&RestoreSelector::Latest, &l, false).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::RegionMismatch { missing_in: Region::Secondary, .. }
        ));

        let forced = resolve(&RestoreSelector::Latest, &l, true).unwrap();
        assert_eq!(forced.timestamp, ts("20240301-120000"));
        assert!(forced.degraded);
        assert!(!forced.other_region_verified);
    }

    #[test]
    fn test_primary_down_falls_back_to_secondary() {
        let l = RegionListings {
            primary: Err(unreachable(Region::Primary)),
            secondary: Ok(sealed(&STAMPS)),
        };
        let resolved = resolve(&RestoreSelector::Latest, &l, false).unwrap();
        assert_eq!(resolved.authority, Region::Secondary);
        assert!(resolved.degraded);
    }

    #[test]
    fn test_both_down_is_unavailable() {
        let l = RegionListings {
            primary: Err(unreachable(Region::Primary)),
            secondary: Err(unreachable(Region::Secondary)),
        };
        assert!(matches!(
            resolve(&RestoreSelector::Latest, &l, false),
            Err(ResolveError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_check_complete_reports_missing_archives() {
        let stamp = ts("20240301-120000");
        let mut manifest = BackupManifest::new("svc", Environment::Prod, stamp);
        manifest.path_archives.push(PathArchive {
            source_path: PathBuf::from("/srv/www"),
            archive_file_name: format!("svc-www-{}.tar.zst", stamp),
            size_bytes: 1,
            file_count: 1,
        });
        manifest.db_archives.push(DbArchive {
            db_name: "db".to_string(),
            archive_file_name: format!("svc-db-{}.sql.zst", stamp),
            size_bytes: 1,
        });

        let l = listings(sealed(&["20240301-120000"]), sealed(&["20240301-120000"]));
        let resolved = resolve(&RestoreSelector::Latest, &l, false).unwrap();
        let err = check_complete(&resolved, &manifest, &l).unwrap_err();

        match err {
            ResolveError::Incomplete { missing, .. } => {
                let key = object_key(&stamp, "svc-db-20240301-120000.sql.zst");
                assert_eq!(
                    missing,
                    vec![format!("{} (primary)", key), format!("{} (secondary)", key)]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_show_statuses_newest_first() {
        let primary = RegionListing::from_keys([
            "20240101-000000/manifest.json",
            "20240102-000000/manifest.json",
            "20240104-000000/a.tar.zst",
        ]);
        let secondary = RegionListing::from_keys([
            "20240101-000000/manifest.json",
            "20240103-000000/manifest.json",
        ]);

        let entries = show_entries(&listings(primary, secondary));
        let rendered: Vec<_> = entries
            .iter()
            .map(|e| format!("{} {}", e.timestamp, e.status))
            .collect();

        assert_eq!(
            rendered,
            vec![
                "20240104-000000 incomplete",
                "20240103-000000 secondary-only",
                "20240102-000000 primary-only",
                "20240101-000000 complete",
            ]
        );
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("latest".parse::<RestoreSelector>(), Ok(RestoreSelector::Latest));
        assert_eq!(
            "20240301-120000".parse::<RestoreSelector>(),
            Ok(RestoreSelector::At(ts("20240301-120000")))
        );
        assert!("yesterday".parse::<RestoreSelector>().is_err());
    }
}
