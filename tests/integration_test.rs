//! End-to-end tests over on-disk ensembles

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::Array;
use trueno_ensemble::config::{ArtifactSpec, EnsembleConfig, FileFormat};
use trueno_ensemble::ensemble::{Ensemble, LoadOptions, Requirement, SkipReason};
use trueno_ensemble::loader::{DefaultLoader, FileLoader};
use trueno_ensemble::record::{IndexKey, Record, ScalarSet, Value};
use trueno_ensemble::stats::Statistic;
use trueno_ensemble::{Error, LoadError};

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn config() -> EnsembleConfig {
    EnsembleConfig::default()
        .with_artifact(
            ArtifactSpec::new("summary", FileFormat::Csv)
                .with_path("share/results/unsmry.csv")
                .with_index_column("DATE"),
        )
        .with_artifact(ArtifactSpec::new("parameters", FileFormat::KeyValue).with_path("parameters.txt"))
        .with_artifact(ArtifactSpec::new("steps", FileFormat::Csv).with_index_column("STEP"))
}

fn discover(root: &Path) -> Ensemble {
    Ensemble::discover("iter-0", root, config(), Arc::new(DefaultLoader::new())).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> IndexKey {
    IndexKey::Date(chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

#[tokio::test]
async fn test_missing_artifact_realization_is_absent_from_result() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        &root.join("realization-0/share/results/unsmry.csv"),
        "DATE,FOPT\n2020-02-01,2.5\n2020-01-01,1.5\n",
    );
    write(&root.join("realization-1/parameters.txt"), "FWL 1700\n");
    write(
        &root.join("realization-2/share/results/unsmry.csv"),
        "DATE,FOPT\n2020-01-01,1.25\n2020-02-01,2.75\n",
    );

    let ens = discover(root);
    assert_eq!(ens.indices(), vec![0, 1, 2]);

    let collection = ens.collect("summary", &LoadOptions::default()).await.unwrap();
    let table = &collection.table;

    assert_eq!(table.realizations(), vec![0, 2]);
    let keys: Vec<(u32, Option<IndexKey>)> =
        table.rows().iter().map(|r| (r.realization, r.index)).collect();
    assert_eq!(
        keys,
        vec![
            (0, Some(date(2020, 1, 1))),
            (0, Some(date(2020, 2, 1))),
            (2, Some(date(2020, 1, 1))),
            (2, Some(date(2020, 2, 1))),
        ]
    );
    assert_eq!(table.value(0, "FOPT"), Some(&Value::Float(1.5)));

    assert_eq!(collection.skipped.len(), 1);
    assert_eq!(collection.skipped[0].realization, 1);
    assert!(matches!(
        collection.skipped[0].reason,
        SkipReason::MissingArtifact(LoadError::NotFound { .. })
    ));

    // Realization 1 stays in the ensemble for other artifacts
    assert_eq!(ens.len(), 3);
    let params = ens.get_dataframe("parameters").await.unwrap();
    assert_eq!(params.realizations(), vec![1]);
}

#[tokio::test]
async fn test_missing_column_is_absent_not_zero() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("realization-0/steps.csv"), "STEP,x,y\n1,0.5,7\n2,1.5,8\n");
    write(&root.join("realization-1/steps.csv"), "STEP,y\n1,9\n");

    let table = discover(root).get_dataframe("steps").await.unwrap();
    assert_eq!(table.column_names(), vec!["x", "y"]);

    let row = table.rows_for(1).next().unwrap();
    assert_eq!(row.values[0], None);
    assert_eq!(row.values[1], Some(Value::Integer(9)));

    let batch = table.to_record_batch().unwrap();
    let x = batch.column_by_name("x").unwrap();
    assert_eq!(x.null_count(), 1);
}

#[tokio::test]
async fn test_schema_conflict_leaves_caches_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("realization-0/parameters.txt"), "MODE 1\nFWL 1700\n");
    write(&root.join("realization-1/parameters.txt"), "MODE high\nFWL 1720\n");

    let ens = discover(root);
    let err = ens.get_dataframe("parameters").await.unwrap_err();
    match &err {
        Error::SchemaConflict {
            artifact,
            column,
            first_realization,
            realization,
            ..
        } => {
            assert_eq!(artifact, "parameters");
            assert_eq!(column, "MODE");
            assert_eq!((*first_realization, *realization), (0, 1));
        }
        other => panic!("unexpected {other:?}"),
    }

    for index in [0, 1] {
        let real = ens.get(index).unwrap();
        let cached = real.cached("parameters").unwrap().unwrap();
        let again = real.get_artifact("parameters").await.unwrap();
        assert!(Arc::ptr_eq(&cached, &again));
        assert_eq!(real.status(), trueno_ensemble::Status::Ok);
    }
    let fwl = ens.get(1).unwrap().get_artifact("parameters").await.unwrap();
    assert_eq!(fwl.as_scalar_set().unwrap().get("FWL"), Some(&Value::Integer(1720)));
}

#[tokio::test]
async fn test_mean_uses_only_contributing_realizations() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("realization-0/steps.csv"), "STEP,X\n5,10\n6,1\n");
    write(&root.join("realization-3/steps.csv"), "STEP,X\n5,20\n6,1\n");
    for i in [1, 2, 4] {
        write(&root.join(format!("realization-{i}/steps.csv")), "STEP,X\n6,1\n");
    }

    let ens = discover(root);
    assert_eq!(ens.len(), 5);
    let summary = ens
        .get_statistics("steps", &[Statistic::Mean, Statistic::P90, Statistic::Std])
        .await
        .unwrap();

    let t5 = Some(IndexKey::Step(5));
    assert_eq!(summary.value(t5, "X", Statistic::Mean), Some(15.0));
    assert_eq!(summary.count(t5, "X"), Some(2));
    assert_eq!(summary.value(t5, "X", Statistic::P90), Some(19.0));

    let t6 = Some(IndexKey::Step(6));
    assert_eq!(summary.count(t6, "X"), Some(5));
    assert_eq!(summary.value(t6, "X", Statistic::Std), Some(0.0));
    assert_eq!(summary.index_label(), Some("STEP"));
}

#[tokio::test]
async fn test_csv_round_trip_reproduces_table() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        &root.join("realization-0/share/results/unsmry.csv"),
        "DATE,FOPT,WELLS\n2020-01-01,1.5,3\n2020-02-01,2.25,4\n",
    );
    write(
        &root.join("realization-1/share/results/unsmry.csv"),
        "DATE,FOPT,NOTE\n2020-01-01,0.75,restart\n",
    );

    let original = discover(root).get_dataframe("summary").await.unwrap();
    assert_eq!(original.column_names(), vec!["FOPT", "WELLS", "NOTE"]);

    let copy = tempfile::tempdir().unwrap();
    for realization in original.realizations() {
        let path = copy
            .path()
            .join(format!("realization-{realization}/share/results/unsmry.csv"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = std::fs::File::create(&path).unwrap();
        original.write_realization_csv(realization, file).unwrap();
    }

    let reloaded = discover(copy.path()).get_dataframe("summary").await.unwrap();
    assert_eq!(reloaded, original);
}

#[tokio::test]
async fn test_csv_round_trip_after_widening() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("realization-0/steps.csv"), "STEP,x,n\n1,3,10\n2,4,11\n");
    write(&root.join("realization-1/steps.csv"), "STEP,x,n\n1,0.5,12\n");

    let original = discover(root).get_dataframe("steps").await.unwrap();
    assert_eq!(original.columns()[0].kind, Some(trueno_ensemble::ValueKind::Float));
    assert_eq!(original.value(0, "x"), Some(&Value::Float(3.0)));
    assert_eq!(original.value(0, "n"), Some(&Value::Integer(10)));

    let copy = tempfile::tempdir().unwrap();
    for realization in original.realizations() {
        let path = copy.path().join(format!("realization-{realization}/steps.csv"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = std::fs::File::create(&path).unwrap();
        original.write_realization_csv(realization, file).unwrap();
    }

    let reloaded = discover(copy.path()).get_dataframe("steps").await.unwrap();
    assert_eq!(reloaded, original);
}

#[tokio::test]
async fn test_job_status_aggregates_across_ensemble() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        &root.join("realization-0/STATUS"),
        "Current host : h\nCOPY_FILE : 10:00:00 .... 10:00:10\nECLIPSE100 : 10:00:10 .... 10:05:10\n",
    );
    write(
        &root.join("realization-1/STATUS"),
        "Current host : h\nCOPY_FILE : 11:00:00 .... 11:00:20\nECLIPSE100 : 11:00:20 ....\n",
    );
    std::fs::create_dir_all(root.join("realization-2")).unwrap();

    let ens = discover(root);
    let collection = ens.collect("STATUS", &LoadOptions::default()).await.unwrap();
    let table = &collection.table;
    assert_eq!(table.index_label(), Some("JOBINDEX"));
    assert_eq!(
        table.column_names(),
        vec!["FORWARD_MODEL", "STARTTIME", "ENDTIME", "DURATION", "errorstring"]
    );
    assert_eq!(table.realizations(), vec![0, 1]);
    assert_eq!(collection.skipped.len(), 1);
    assert_eq!(collection.skipped[0].realization, 2);

    let durations = ens.get_statistics("STATUS", &[Statistic::Mean]).await.unwrap();
    assert_eq!(durations.value(Some(IndexKey::Step(0)), "DURATION", Statistic::Mean), Some(15.0));
    // The unfinished job counts only where it finished
    assert_eq!(durations.value(Some(IndexKey::Step(1)), "DURATION", Statistic::Mean), Some(300.0));
    assert_eq!(durations.count(Some(IndexKey::Step(1)), "DURATION"), Some(1));
}

#[tokio::test]
async fn test_failed_realization_is_skipped_without_loading() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("realization-0/steps.csv"), "STEP,x\n1,1.5\n");
    write(&root.join("realization-1/steps.csv"), "STEP,x\n1,2.5\n");
    write(&root.join("realization-1/ERROR"), "segfault\n");

    let ens = discover(root);
    let collection = ens.collect("steps", &LoadOptions::default()).await.unwrap();

    assert_eq!(collection.table.realizations(), vec![0]);
    assert_eq!(collection.skipped.len(), 1);
    assert_eq!(collection.skipped[0].reason, SkipReason::Failed);
    assert!(ens.get(1).unwrap().cached("steps").is_none());
    assert_eq!(ens.loaded_artifacts(), vec!["steps".to_string()]);
}

#[tokio::test]
async fn test_no_data_yields_empty_table() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("realization-0")).unwrap();
    let table = discover(dir.path()).get_dataframe("steps").await.unwrap();
    assert!(table.is_empty());
    assert!(table.columns().is_empty());
}

#[tokio::test]
async fn test_unknown_artifact_format_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("realization-0")).unwrap();
    let err = discover(dir.path()).get_dataframe("UNSMRY").await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_)));
}

#[tokio::test]
async fn test_filter_has_column() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("realization-0/steps.csv"), "STEP,x,y\n1,1.5,2\n");
    write(&root.join("realization-1/steps.csv"), "STEP,y\n1,3\n");

    let mut ens = discover(root);
    let removed = ens
        .filter(&Requirement::HasColumn {
            artifact: "steps".into(),
            column: "x".into(),
        })
        .await
        .unwrap();
    assert_eq!(removed, vec![1]);
    assert_eq!(ens.get_dataframe("steps").await.unwrap().realizations(), vec![0]);
}

/// Sleeps, then returns a one-key set. Never touches the filesystem.
struct SlowLoader {
    delay: Duration,
    loads: AtomicUsize,
}

impl FileLoader for SlowLoader {
    fn load(&self, _path: &Path, spec: &ArtifactSpec) -> Result<Record, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let mut set = ScalarSet::new();
        set.insert(spec.name.clone(), Value::Integer(1));
        Ok(Record::ScalarSet(set))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_stops_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let loader = Arc::new(SlowLoader {
        delay: Duration::from_millis(150),
        loads: AtomicUsize::new(0),
    });
    let mut ens = Ensemble::new("slow", EnsembleConfig::default(), loader.clone()).unwrap();
    for i in 0..8 {
        ens.add_realization(dir.path().join(format!("realization-{i}")), i)
            .unwrap();
    }

    let options = LoadOptions::default()
        .with_max_concurrency(1)
        .with_timeout(Duration::from_millis(250));
    let started = std::time::Instant::now();
    let collection = ens.collect("x.txt", &options).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(8 * 150));
    assert!(loader.loads.load(Ordering::SeqCst) < 8);
    let last = collection.skipped.last().unwrap();
    assert_eq!(last.realization, 7);
    assert_eq!(last.reason, SkipReason::DeadlineExceeded);

    // Unissued realizations were not poisoned: a later call loads them
    let all = ens.collect("x.txt", &LoadOptions::default()).await.unwrap();
    let unissued = collection
        .skipped
        .iter()
        .filter(|s| s.reason == SkipReason::DeadlineExceeded)
        .count();
    assert!(all.table.num_rows() >= unissued);
}

#[tokio::test]
async fn test_parquet_export() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("realization-0/steps.csv"), "STEP,x\n1,1.5\n2,2.5\n");
    write(&root.join("realization-1/steps.csv"), "STEP,x\n1,3.5\n");

    let ens = discover(root);
    let table = ens.get_dataframe("steps").await.unwrap();
    let out = dir.path().join("steps.parquet");
    table.write_parquet(&out).unwrap();

    let file = std::fs::File::open(&out).unwrap();
    let reader = parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap();
    let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
    assert_eq!(rows, 3);

    let summary = ens.get_statistics("steps", &Statistic::DEFAULT).await.unwrap();
    let batch = summary.to_record_batch().unwrap();
    assert_eq!(batch.num_rows(), 2);
    assert!(batch.schema().field_with_name("x_p90").is_ok());
    assert_eq!(serde_json::to_value(&summary).unwrap()["index_label"], "STEP");
}
