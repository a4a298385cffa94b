//! Catalog recovery and file restore across a simulated cluster.

mod common;

use chrono::Duration;
use common::{content, Cluster};
use peerkeep::config::CloudConfig;
use peerkeep::model::BlockKind;
use peerkeep::{Clock, RecoveryState};

/// Drive restore sweeps until recovery finishes.
async fn run_recovery(cluster: &mut Cluster, node: usize) {
    for _ in 0..20 {
        let sweep = cluster.node(node).restore_sweep().await.unwrap();
        cluster.settle().await;
        if sweep.state.is_none() {
            return;
        }
        cluster.clock.advance(Duration::minutes(10));
    }
    panic!("recovery did not finish");
}

#[tokio::test]
async fn test_lost_node_recovers_catalog_and_files() {
    let mut cluster = Cluster::new(4).await;
    let big = content(1_200_000);
    cluster.nodes[0].write_file("big.bin", &big);
    cluster.nodes[0].write_file("notes/todo.txt", b"buy milk");
    cluster.node(0).backup_all().await.unwrap();
    cluster.replicate(0).await;
    let original_blocks = cluster.block_ids(0).len();

    cluster.rebuild(0, |_| {}).await;
    assert_eq!(cluster.block_ids(0).len(), 0);

    assert_eq!(cluster.node(0).start_recovery().await.unwrap(), 3);
    cluster.settle().await;
    let catalogs = cluster.node(0).recovered_catalogs().unwrap();
    assert_eq!(catalogs.len(), 1);
    // Every block any peer holds is known again, unverified.
    assert_eq!(cluster.block_ids(0).len(), original_blocks);

    let target = cluster.nodes[0].data.path().join("restored");
    cluster.node(0).bind_directory("docs", &target).unwrap();
    cluster.node(0).select_catalog(&catalogs[0]).await.unwrap();
    assert_eq!(
        cluster.node(0).recovery_state().unwrap(),
        Some(RecoveryState::RecoverData)
    );
    // No backups while recovering.
    assert_eq!(cluster.node(0).backup_all().await.unwrap().files, 0);

    run_recovery(&mut cluster, 0).await;
    assert_eq!(std::fs::read(target.join("big.bin")).unwrap(), big);
    assert_eq!(std::fs::read(target.join("notes/todo.txt")).unwrap(), b"buy milk");

    let ctx = cluster.node(0).context().clone();
    ctx.store
        .read(|c| {
            assert!(c.blocks().all(|b| b.kind != BlockKind::Unclassified));
            assert_eq!(c.task_count(), 0);
            assert_eq!(c.restore_paths().count(), 0);
        })
        .unwrap();
    // Every block came back from a peer that has now proven it holds it.
    let now = ctx.now();
    let window = ctx.valid_window();
    for id in cluster.block_ids(0).iter().filter(|id| !id.is_catalog()) {
        assert!(ctx.store.read(|c| c.verified_count(id, now, window)).unwrap() >= 1);
    }
}

#[tokio::test]
async fn test_repeated_catalog_answers_are_idempotent() {
    let mut cluster = Cluster::new(4).await;
    cluster.nodes[0].write_file("a.txt", b"alpha");
    cluster.node(0).backup_all().await.unwrap();
    cluster.replicate(0).await;
    cluster.rebuild(0, |_| {}).await;

    cluster.node(0).start_recovery().await.unwrap();
    cluster.settle().await;
    let (blocks, locations) = counts(&cluster);

    cluster.node(0).start_recovery().await.unwrap();
    cluster.settle().await;
    assert_eq!(counts(&cluster), (blocks, locations));
    assert_eq!(cluster.node(0).recovered_catalogs().unwrap().len(), 1);
}

fn counts(cluster: &Cluster) -> (usize, usize) {
    cluster
        .node(0)
        .context()
        .store
        .read(|c| (c.block_count(), c.all_locations().count()))
        .unwrap()
}

#[tokio::test]
async fn test_deleted_file_is_not_restored() {
    let mut cluster = Cluster::new(4).await;
    cluster.nodes[0].write_file("keep.txt", b"keep");
    let gone = cluster.nodes[0].write_file("gone.txt", b"gone");
    cluster.node(0).backup_all().await.unwrap();
    std::fs::remove_file(gone).unwrap();
    cluster.clock.advance(Duration::minutes(5));
    cluster.node(0).backup_all().await.unwrap();
    cluster.replicate(0).await;

    cluster.rebuild(0, |_| {}).await;
    cluster.node(0).start_recovery().await.unwrap();
    cluster.settle().await;
    let catalogs = cluster.node(0).recovered_catalogs().unwrap();
    let target = cluster.nodes[0].data.path().join("restored");
    cluster.node(0).bind_directory("docs", &target).unwrap();
    cluster.node(0).select_catalog(&catalogs[0]).await.unwrap();
    run_recovery(&mut cluster, 0).await;

    assert_eq!(std::fs::read(target.join("keep.txt")).unwrap(), b"keep");
    assert!(!target.join("gone.txt").exists());
}

#[tokio::test]
async fn test_point_in_time_restore() {
    let mut cluster = Cluster::new(4).await;
    let path = cluster.nodes[0].write_file("doc.txt", b"first draft");
    cluster.node(0).backup_all().await.unwrap();
    let first = cluster.clock.now();

    cluster.clock.advance(Duration::hours(1));
    std::fs::write(&path, b"second draft, much longer").unwrap();
    cluster.node(0).backup_all().await.unwrap();
    cluster.replicate(0).await;

    let out = cluster.nodes[0].data.path().join("out");
    let pending = cluster
        .node(0)
        .request_restore("docs", "doc.txt", first, out.join("v1.txt"))
        .await
        .unwrap();
    assert_eq!(pending, 1);
    for _ in 0..3 {
        cluster.node(0).restore_sweep().await.unwrap();
        cluster.settle().await;
    }
    assert_eq!(std::fs::read(out.join("v1.txt")).unwrap(), b"first draft");
}

#[tokio::test]
async fn test_recovery_from_object_store_alone() {
    let bucket = tempfile::tempdir().unwrap();
    let cloud = CloudConfig {
        name: "bucket".into(),
        directory: bucket.path().to_path_buf(),
    };
    let with_cloud = cloud.clone();
    let mut cluster = Cluster::with_config(1, move |_, c| c.cloud.push(with_cloud.clone())).await;
    let big = content(700_000);
    cluster.nodes[0].write_file("photo.raw", &big);
    cluster.node(0).backup_all().await.unwrap();

    // Two data blocks, one version, one catalog snapshot.
    let uploaded = cluster.node(0).upload().await.unwrap();
    assert_eq!((uploaded.uploaded, uploaded.failed), (4, 0));
    assert_eq!(std::fs::read_dir(bucket.path()).unwrap().count(), 4);

    cluster.rebuild(0, move |c| c.cloud.push(cloud)).await;
    let summary = cluster.node(0).recover_from_cloud().await.unwrap();
    assert_eq!((summary.objects, summary.accepted, summary.rejected), (4, 4, 0));
    assert_eq!(
        cluster.node(0).recovery_state().unwrap(),
        Some(RecoveryState::Initialized)
    );

    let catalogs = cluster.node(0).recovered_catalogs().unwrap();
    assert_eq!(catalogs.len(), 1);
    let target = cluster.nodes[0].data.path().join("restored");
    cluster.node(0).bind_directory("docs", &target).unwrap();
    cluster.node(0).select_catalog(&catalogs[0]).await.unwrap();
    run_recovery(&mut cluster, 0).await;
    assert_eq!(std::fs::read(target.join("photo.raw")).unwrap(), big);
}
