//! End-to-end workflow against the in-memory store: backfill metrics from
//! local results, analyze the experiment, then publish the best run.

use std::path::Path;

use mltrack_core::analysis::{REPORT_FILE, analyze_experiment};
use mltrack_core::publish::{find_best_run, publish_best};
use mltrack_core::relog::relog_experiment;
use mltrack_core::{InMemoryStore, MetricRecoverer, Run, RunStatus};

fn write_run_dir(runs_dir: &Path, name: &str, map50: &str) {
    let dir = runs_dir.join(name);
    std::fs::create_dir_all(dir.join("weights")).unwrap();
    std::fs::write(
        dir.join("results.csv"),
        format!(
            "epoch,metrics/precision(B),metrics/recall(B),metrics/mAP50(B),metrics/mAP50-95(B)\n\
             1,0.1,0.1,0.1,0.05\n\
             2,0.8,0.7,{map50},0.4\n"
        ),
    )
    .unwrap();
    std::fs::write(dir.join("weights").join("best.pt"), b"weights").unwrap();
    std::fs::write(dir.join("args.yaml"), "imgsz: 320\n").unwrap();
}

#[tokio::test]
async fn test_backfill_analyze_publish() {
    let store = InMemoryStore::new();
    let exp = store.add_experiment("cv_yolo_tiny");
    for (id, name, imgsz) in [("aaa", "exp_320", "320"), ("bbb", "exp_416", "416")] {
        store.insert_run(
            Run::new(id)
                .with_experiment(&exp.id)
                .with_name(name)
                .with_param("imgsz", imgsz)
                .with_artifact_uri(format!("mlflow-artifacts:/{}/{id}/artifacts", exp.id)),
        );
    }
    store.insert_run(
        Run::new("ccc")
            .with_experiment(&exp.id)
            .with_name("exp_crashed")
            .with_status(RunStatus::Failed),
    );

    let workspace = tempfile::tempdir().unwrap();
    let runs_dir = workspace.path().join("runs");
    write_run_dir(&runs_dir, "exp_320", "0.62");
    write_run_dir(&runs_dir, "exp_416", "0.71");

    // Nothing is ranked before the backfill.
    let before = analyze_experiment(&store, "cv_yolo_tiny", "mAP50").await.unwrap();
    assert_eq!(before.run_count(), 3);
    assert!(before.best.is_none());

    let recoverer = MetricRecoverer::new(&store);
    let summary = relog_experiment(&store, &recoverer, "cv_yolo_tiny", &runs_dir)
        .await
        .unwrap();
    assert_eq!(summary.total(), 2);
    assert_eq!(summary.updated(), 2);

    let analysis = analyze_experiment(&store, "cv_yolo_tiny", "mAP50").await.unwrap();
    assert_eq!(analysis.best.as_ref().map(|r| r.id().as_str()), Some("bbb"));
    let report = analysis.write_report(&workspace.path().join("reports")).unwrap();
    assert!(report.ends_with(REPORT_FILE));
    let text = std::fs::read_to_string(&report).unwrap();
    assert_eq!(text.lines().count(), 4);
    assert!(text.lines().next().unwrap().contains("mAP@50"));

    let best = find_best_run(&store, "cv_yolo_tiny", "mAP50").await.unwrap();
    assert_eq!(best.run.id().as_str(), "bbb");

    let published = publish_best(&store, "cv_yolo_tiny", "mAP50", "yolo_person_detector", &runs_dir)
        .await
        .unwrap();
    assert_eq!(published.model_uri, "runs:/bbb/model/best.pt");
    assert_eq!(
        published.uploaded,
        vec!["model/best.pt", "config/args.yaml", "results/results.csv"]
    );
    assert_eq!(store.model_versions("yolo_person_detector").len(), 1);

    let again = publish_best(&store, "cv_yolo_tiny", "mAP50", "yolo_person_detector", &runs_dir)
        .await
        .unwrap();
    assert_eq!(again.version.version, 2);
}
