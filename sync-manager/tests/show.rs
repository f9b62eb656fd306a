mod common;

use common::Harness;
use sync_manager::executor::{self, Mode, Verdict};
use sync_manager::resolver::{BackupStatus, RestoreSelector};
use sync_manager::storage::Region;
use sync_manager::utils::{ResolveError, SyncError};
use sync_manager::BackupTimestamp;

fn ts(raw: &str) -> BackupTimestamp {
    BackupTimestamp::parse(raw).unwrap()
}

async fn seeded() -> Harness {
    let h = Harness::new(&["www"], &[]);
    h.seed_backup("20240101-000000", &[Region::Primary, Region::Secondary])
        .await;
    h.seed_backup("20240201-000000", &[Region::Primary]).await;
    h.seed_backup("20240115-000000", &[Region::Secondary]).await;
    h.primary
        .insert("20240301-000000/wordpress-www-20240301-000000.tar.zst", vec![1])
        .await;
    h
}

#[tokio::test]
async fn show_lists_every_backup_with_its_status() {
    let h = seeded().await;

    let report = executor::run(
        &h.ctx,
        Mode::Show {
            selector: RestoreSelector::Latest,
        },
    )
    .await
    .unwrap();

    let listed: Vec<_> = report
        .backups
        .iter()
        .map(|entry| (entry.timestamp.to_string(), entry.status))
        .collect();
    assert_eq!(
        listed,
        vec![
            ("20240301-000000".to_string(), BackupStatus::Incomplete),
            ("20240201-000000".to_string(), BackupStatus::PrimaryOnly),
            ("20240115-000000".to_string(), BackupStatus::SecondaryOnly),
            ("20240101-000000".to_string(), BackupStatus::Complete),
        ]
    );
    assert!(report.degraded);

    // Latest sealed primary backup is missing from the secondary region.
    assert_eq!(report.selected, None);
    assert!(report.warnings.iter().any(|w| w.contains("latest")));
    assert_eq!(report.verdict(), Verdict::Success);
}

#[tokio::test]
async fn show_marks_an_explicit_complete_backup() {
    let h = seeded().await;

    let report = executor::run(
        &h.ctx,
        Mode::Show {
            selector: RestoreSelector::At(ts("20240101-000000")),
        },
    )
    .await
    .unwrap();

    assert_eq!(report.selected, Some(ts("20240101-000000")));
    assert!(report.to_string().contains("20240101-000000"));
}

#[tokio::test]
async fn show_falls_back_to_secondary_when_primary_is_down() {
    let h = seeded().await;
    h.primary.fail_listing(true);

    let report = executor::run(
        &h.ctx,
        Mode::Show {
            selector: RestoreSelector::At(ts("20240101-000000")),
        },
    )
    .await
    .unwrap();

    assert!(report.degraded);
    assert!(report.warnings.iter().any(|w| w.contains("primary")));
    assert_eq!(report.backups.len(), 2);
}

#[tokio::test]
async fn show_fails_when_both_regions_are_down() {
    let h = seeded().await;
    h.primary.fail_listing(true);
    h.secondary.fail_listing(true);

    let err = executor::run(
        &h.ctx,
        Mode::Show {
            selector: RestoreSelector::Latest,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SyncError::Resolve(ResolveError::Unavailable { .. })));
}

#[tokio::test]
async fn show_does_not_need_the_run_lock() {
    let h = seeded().await;
    let _held = h.ctx.lock().unwrap();

    let report = executor::run(
        &h.ctx,
        Mode::Show {
            selector: RestoreSelector::Latest,
        },
    )
    .await
    .unwrap();

    assert_eq!(report.backups.len(), 4);
}
