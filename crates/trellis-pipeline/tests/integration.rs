//! End-to-end tests for the Trellis controller.
//!
//! Each test builds a controller over a temporary experiment directory,
//! resolves and commits artifacts the way an analysis would, then changes
//! the configuration and checks what the cache makes of it.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use trellis_pipeline::{
    Answer, ArtifactStatus, AutoApproveInterviewer, CachePolicy, ChainGraph, Controller,
    ControllerConfig, CovDef, Decision, EpochDef, GroupDef, RawPipe, RecordingInterviewer,
    Registry, StaleReason, SubjectsConfig, TestDef, ENV_CACHE_VERBOSE,
};
use trellis_types::{Category, DefKey, TrellisError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().expect("artifact has a parent")).unwrap();
    std::fs::write(path, b"data").unwrap();
}

/// One subject, two sessions, a filtered pipe, an epoch and a covariance.
fn experiment(root: &Path, h_freq: f64) -> ControllerConfig {
    let mut config = ControllerConfig::new(root);
    config.sessions = vec!["words".into(), "pictures".into()];
    config.subjects = SubjectsConfig {
        list: Some(vec!["R0001".into()]),
        ..Default::default()
    };
    config
        .raw
        .insert("filtered".into(), RawPipe::filter("raw", Some(1.0), Some(h_freq)));
    config.raw.insert(
        "avg".into(),
        RawPipe::ReReference {
            source: "filtered".into(),
            reference: "average".into(),
        },
    );
    config
        .epochs
        .insert("word".into(), EpochDef::primary("words", Some("stimulus == 'word'")));
    config
        .epochs
        .insert("picture".into(), EpochDef::primary("pictures", None));
    config.covs.insert(
        "noise".into(),
        CovDef::Epoch {
            epoch: "word".into(),
            reg: None,
            method: None,
        },
    );
    config
}

fn raw_file(root: &Path, session: &str) -> PathBuf {
    root.join("meg")
        .join("R0001")
        .join(format!("R0001_{session}-raw.fif"))
}

/// Resolve, "compute" and commit an artifact; returns its path.
fn produce(c: &mut Controller, category: Category, name: &str) -> PathBuf {
    let resolution = c.resolve(category, name).unwrap();
    assert!(resolution.is_stale(), "{name} should need computing: {:?}", resolution.status);
    touch(&resolution.path);
    c.commit(&resolution).unwrap();
    resolution.path
}

// ---------------------------------------------------------------------------
// Templates and state
// ---------------------------------------------------------------------------

#[test]
fn missing_slot_names_the_slot() {
    let vars: HashMap<String, String> = [("subject".to_string(), "R0001".to_string())]
        .into_iter()
        .collect();
    let err = trellis_template::expand("{subject}_{session}", &vars).unwrap_err();
    assert!(matches!(err, TrellisError::MissingSlot { slot, .. } if slot == "session"));
}

#[test]
fn template_expansion_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let c = Controller::new(experiment(dir.path(), 40.0)).unwrap();
    let first = c.expand("{cache-dir}/{subject} {raw} {epoch}").unwrap();
    let second = c.expand("{cache-dir}/{subject} {raw} {epoch}").unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first,
        format!("{}/cache/R0001 raw word", dir.path().display())
    );
}

#[test]
fn epoch_cascades_to_its_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = Controller::new(experiment(dir.path(), 40.0)).unwrap();
    c.set("session", "pictures").unwrap();
    let changes = c.set("epoch", "word").unwrap();
    assert_eq!(c.get("session").unwrap(), "words");
    assert!(changes.iter().any(|ch| ch.name == "session"));
}

#[test]
fn scoped_state_is_restored_even_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = experiment(dir.path(), 40.0);
    config.raw.insert(
        "ica".into(),
        RawPipe::Ica {
            source: "filtered".into(),
            sessions: vec!["words".into()],
            options: BTreeMap::new(),
            cache: true,
        },
    );
    let mut c = Controller::new(config).unwrap();
    c.set("raw", "filtered").unwrap();

    let result: trellis_types::Result<()> = c.with_state([("raw", "ica")], |c| {
        assert_eq!(c.get("raw").unwrap(), "ica");
        c.set("raw", "nonexistent")?;
        Ok(())
    });
    assert!(matches!(result, Err(TrellisError::InvalidValue { .. })));
    assert_eq!(c.get("raw").unwrap(), "filtered");

    {
        let scoped = c.scoped([("raw", "ica")]).unwrap();
        assert_eq!(scoped.get("raw").unwrap(), "ica");
    }
    assert_eq!(c.get("raw").unwrap(), "filtered");
}

// ---------------------------------------------------------------------------
// Chains and fingerprints
// ---------------------------------------------------------------------------

#[test]
fn linear_chain_and_cycle() {
    let mut graph = ChainGraph::new(Category::Raw);
    graph.add("A", vec![]);
    graph.add("B", vec!["A".into()]);
    graph.add("C", vec!["B".into()]);
    assert_eq!(graph.resolve_chain("C").unwrap(), vec!["A", "B", "C"]);

    let mut r = Registry::new();
    r.register("a", RawPipe::filter("b", None, Some(40.0))).unwrap();
    r.register("b", RawPipe::filter("a", Some(1.0), None)).unwrap();
    assert!(matches!(r.link(), Err(TrellisError::Cycle { .. })));
}

#[test]
fn fingerprints_are_stable_and_sensitive() {
    let dir = tempfile::tempdir().unwrap();
    let first = Controller::new(experiment(dir.path(), 40.0)).unwrap();
    let second = Controller::new(experiment(dir.path(), 40.0)).unwrap();
    let changed = Controller::new(experiment(dir.path(), 30.0)).unwrap();

    let fp = |c: &Controller, category, name: &str| {
        c.catalog().fingerprint_of(category, name).unwrap().clone()
    };
    assert_eq!(fp(&first, Category::Raw, "filtered"), fp(&second, Category::Raw, "filtered"));
    assert_eq!(fp(&first, Category::Raw, "avg"), fp(&second, Category::Raw, "avg"));

    // the pipe and its dependent change, the source and the epoch do not
    assert_ne!(fp(&first, Category::Raw, "filtered"), fp(&changed, Category::Raw, "filtered"));
    assert_ne!(fp(&first, Category::Raw, "avg"), fp(&changed, Category::Raw, "avg"));
    assert_eq!(fp(&first, Category::Raw, "raw"), fp(&changed, Category::Raw, "raw"));
    assert_eq!(fp(&first, Category::Epoch, "word"), fp(&changed, Category::Epoch, "word"));
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[test]
fn resolve_source_and_transient_pipes() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = Controller::new(experiment(dir.path(), 40.0)).unwrap();

    let err = c.resolve(Category::Raw, "raw").unwrap_err();
    assert!(matches!(err, TrellisError::MissingInput { .. }));

    touch(&raw_file(dir.path(), "words"));
    let source = c.resolve(Category::Raw, "raw").unwrap();
    assert_eq!(source.status, ArtifactStatus::Source);
    assert!(!source.is_stale());

    let filtered = c.resolve(Category::Raw, "filtered").unwrap();
    assert_eq!(filtered.status, ArtifactStatus::Missing);
    assert_eq!(filtered.inputs, vec![raw_file(dir.path(), "words")]);
    assert_eq!(
        filtered.path,
        dir.path().join("cache/raw/R0001/R0001 words filtered-raw.fif")
    );

    let avg = c.resolve(Category::Raw, "avg").unwrap();
    assert_eq!(avg.status, ArtifactStatus::Transient);
    assert!(c.commit(&avg).is_err());

    // epochs on a transient pipe read what the pipe reads
    c.set("raw", "avg").unwrap();
    let epochs = c.resolve(Category::Epoch, "word").unwrap();
    assert_eq!(epochs.inputs, vec![filtered.path.clone()]);
    assert!(epochs.stale_input.is_none());
    assert_eq!(epochs.state["raw"], "avg");
    assert!(epochs.fingerprints.contains_key(&DefKey::new(Category::Raw, "filtered")));
}

#[test]
fn committed_artifact_is_fresh_until_input_changes() {
    let dir = tempfile::tempdir().unwrap();
    touch(&raw_file(dir.path(), "words"));
    let mut c = Controller::new(experiment(dir.path(), 40.0)).unwrap();

    let path = produce(&mut c, Category::Raw, "filtered");
    let again = c.resolve(Category::Raw, "filtered").unwrap();
    assert_eq!(again.status, ArtifactStatus::Fresh);
    assert_eq!(again.path, path);

    let later = SystemTime::now() + Duration::from_secs(3600);
    std::fs::File::options()
        .write(true)
        .open(raw_file(dir.path(), "words"))
        .unwrap()
        .set_modified(later)
        .unwrap();
    let stale = c.resolve(Category::Raw, "filtered").unwrap();
    assert!(matches!(stale.status, ArtifactStatus::Stale(StaleReason::InputModified { .. })));
}

#[test]
fn untracked_files_are_reported_and_kept() {
    let dir = tempfile::tempdir().unwrap();
    touch(&raw_file(dir.path(), "words"));
    let c = Controller::new(experiment(dir.path(), 40.0)).unwrap();
    let resolution = c.resolve(Category::Raw, "filtered").unwrap();
    touch(&resolution.path);

    let again = c.resolve(Category::Raw, "filtered").unwrap();
    assert_eq!(again.status, ArtifactStatus::Untracked);
    assert!(again.is_stale());

    let c = Controller::new(experiment(dir.path(), 30.0)).unwrap();
    assert!(c.plan_invalidation().is_empty());
    assert!(resolution.path.exists());
}

#[test]
fn ica_decomposition_feeds_the_ica_pipe() {
    let dir = tempfile::tempdir().unwrap();
    touch(&raw_file(dir.path(), "words"));
    touch(&raw_file(dir.path(), "pictures"));
    let mut config = experiment(dir.path(), 40.0);
    config.raw.insert(
        "ica".into(),
        RawPipe::Ica {
            source: "filtered".into(),
            sessions: vec!["words".into()],
            options: BTreeMap::new(),
            cache: true,
        },
    );
    let mut c = Controller::new(config).unwrap();
    c.set("session", "pictures").unwrap();

    let ica = c.resolve_ica("ica").unwrap();
    assert_eq!(ica.path, dir.path().join("meg/R0001/R0001 ica-ica.fif"));
    assert_eq!(
        ica.inputs,
        vec![dir.path().join("cache/raw/R0001/R0001 words filtered-raw.fif")]
    );

    let pipe = c.resolve(Category::Raw, "ica").unwrap();
    assert!(pipe.inputs.contains(&ica.path));
    assert!(pipe
        .inputs
        .contains(&dir.path().join("cache/raw/R0001/R0001 pictures filtered-raw.fif")));
}

// ---------------------------------------------------------------------------
// Invalidation
// ---------------------------------------------------------------------------

/// Filtered raw and its epochs under `raw=filtered`, plus a covariance under
/// `raw=raw` that never touches `filtered`.
fn populate(root: &Path) -> (PathBuf, PathBuf, PathBuf) {
    touch(&raw_file(root, "words"));
    let mut c = Controller::new(experiment(root, 40.0)).unwrap();
    c.set("raw", "filtered").unwrap();
    let filtered = produce(&mut c, Category::Raw, "filtered");
    let epochs = produce(&mut c, Category::Epoch, "word");
    assert_eq!(
        c.resolve(Category::Epoch, "word").unwrap().status,
        ArtifactStatus::Fresh
    );
    c.set("raw", "raw").unwrap();
    let cov = produce(&mut c, Category::Cov, "noise");
    (filtered, epochs, cov)
}

#[test]
fn changed_pipe_invalidates_its_descendants_only() {
    let dir = tempfile::tempdir().unwrap();
    let (filtered, epochs, cov) = populate(dir.path());

    let mut config = experiment(dir.path(), 30.0);
    config.cache.policy = CachePolicy::Off;
    let c = Controller::builder(config).skip_refresh(true).build().unwrap();
    let plan = c.plan_invalidation();
    let stale: Vec<&Path> = plan.stale.iter().map(|e| e.path.as_path()).collect();
    assert_eq!(stale, vec![filtered.as_path(), epochs.as_path()]);
    assert!(!plan.contains(&cov));
    assert!(plan
        .changed_definitions()
        .any(|(k, _)| *k == DefKey::new(Category::Raw, "filtered")));

    let cov_now = c.resolve(Category::Cov, "noise").unwrap();
    assert_eq!(cov_now.status, ArtifactStatus::Fresh);
}

#[test]
fn policy_off_raises_on_stale_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (filtered, epochs, _) = populate(dir.path());

    let mut config = experiment(dir.path(), 30.0);
    config.cache.policy = CachePolicy::Off;
    let mut c = Controller::new(config).unwrap();
    assert!(filtered.exists() && epochs.exists());

    c.set("raw", "filtered").unwrap();
    let err = c.resolve(Category::Raw, "filtered").unwrap_err();
    assert!(matches!(err, TrellisError::StaleCacheConflict { ref path, .. } if *path == filtered));
    let err = c.resolve(Category::Epoch, "word").unwrap_err();
    assert!(matches!(err, TrellisError::StaleCacheConflict { ref path, .. } if *path == epochs));
}

#[test]
fn reverting_a_change_makes_flagged_artifacts_fresh_again() {
    let dir = tempfile::tempdir().unwrap();
    let (filtered, epochs, _) = populate(dir.path());

    let mut changed = experiment(dir.path(), 30.0);
    changed.cache.policy = CachePolicy::Off;
    let c = Controller::new(changed).unwrap();
    assert!(c.cache_index().record(&filtered).unwrap().stale.is_some());

    let mut reverted = experiment(dir.path(), 40.0);
    reverted.cache.policy = CachePolicy::Off;
    let mut c = Controller::new(reverted).unwrap();
    assert!(c.cache_index().record(&filtered).unwrap().stale.is_none());
    c.set("raw", "filtered").unwrap();
    assert_eq!(
        c.resolve(Category::Raw, "filtered").unwrap().status,
        ArtifactStatus::Fresh
    );
    assert!(!c.resolve(Category::Epoch, "word").unwrap().is_stale());

    let c = Controller::new(experiment(dir.path(), 40.0)).unwrap();
    assert!(filtered.exists() && epochs.exists());
    assert_eq!(c.cache_index().len(), 3);
}

#[test]
fn policy_auto_deletes_stale_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (filtered, epochs, cov) = populate(dir.path());

    let c = Controller::new(experiment(dir.path(), 30.0)).unwrap();
    assert!(!filtered.exists());
    assert!(!epochs.exists());
    assert!(cov.exists());
    assert_eq!(c.cache_index().len(), 1);

    let mut c = c;
    c.set("raw", "filtered").unwrap();
    assert_eq!(
        c.resolve(Category::Raw, "filtered").unwrap().status,
        ArtifactStatus::Missing
    );
}

#[test]
fn policy_ask_needs_an_answer() {
    let dir = tempfile::tempdir().unwrap();
    let (filtered, epochs, _) = populate(dir.path());

    let mut config = experiment(dir.path(), 30.0);
    config.cache.policy = CachePolicy::Ask;
    let err = Controller::new(config.clone()).err().unwrap();
    assert!(matches!(err, TrellisError::ConfirmationRequired { count: 2 }));

    let err = Controller::builder(config.clone())
        .interviewer(Box::new(RecordingInterviewer::new(vec![Answer::choice("abort")])))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, TrellisError::InvalidationAborted));
    assert!(filtered.exists() && epochs.exists());

    // "ignore" accepts the files as they are
    let mut c = Controller::builder(config)
        .interviewer(Box::new(RecordingInterviewer::new(vec![Answer::choice("ignore")])))
        .build()
        .unwrap();
    assert!(filtered.exists());
    c.set("raw", "filtered").unwrap();
    assert_eq!(
        c.resolve(Category::Epoch, "word").unwrap().status,
        ArtifactStatus::Fresh
    );
}

#[test]
fn removed_definition_makes_records_stale() {
    let dir = tempfile::tempdir().unwrap();
    let (filtered, epochs, cov) = populate(dir.path());

    let mut config = experiment(dir.path(), 40.0);
    config.raw.shift_remove("filtered");
    config.raw.shift_remove("avg");
    let mut c = Controller::builder(config).skip_refresh(true).build().unwrap();
    let plan = c.plan_invalidation();
    assert!(matches!(
        &plan.stale[0].reason,
        StaleReason::DefinitionRemoved { definition } if *definition == DefKey::new(Category::Raw, "filtered")
    ));

    let outcome = c.apply_invalidation(&plan, Decision::Delete).unwrap();
    assert_eq!(outcome.deleted, vec![filtered.clone(), epochs.clone()]);
    assert!(cov.exists());
    assert!(c.refresh().unwrap().deleted.is_empty());
}

#[test]
fn config_round_trips_through_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = experiment(dir.path(), 40.0);
    let path = dir.path().join("trellis.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    let loaded = ControllerConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn auto_approve_takes_the_default_answer() {
    let dir = tempfile::tempdir().unwrap();
    let (filtered, epochs, cov) = populate(dir.path());

    let mut config = experiment(dir.path(), 30.0);
    config.cache.policy = CachePolicy::Ask;
    let c = Controller::builder(config)
        .interviewer(Box::new(AutoApproveInterviewer))
        .build()
        .unwrap();
    assert!(!filtered.exists() && !epochs.exists());
    assert!(cov.exists());
    assert_eq!(c.cache_index().len(), 1);
}

// ---------------------------------------------------------------------------
// Group tests
// ---------------------------------------------------------------------------

#[test]
fn test_inputs_reject_members_that_are_not_subjects() {
    let dir = tempfile::tempdir().unwrap();
    touch(&raw_file(dir.path(), "words"));
    let mut config = experiment(dir.path(), 40.0);
    config.groups.insert(
        "pilot".into(),
        GroupDef::Subjects {
            subjects: vec!["R0001".into(), "R0099".into()],
        },
    );
    config.tests.insert(
        "main".into(),
        TestDef::OneSample {
            model: None,
            tail: 0,
        },
    );
    let mut c = Controller::new(config).unwrap();

    let resolution = c.resolve(Category::Test, "main").unwrap();
    assert_eq!(resolution.inputs.len(), 1);

    c.set("group", "pilot").unwrap();
    let err = c.resolve(Category::Test, "main").unwrap_err();
    assert!(matches!(
        err,
        TrellisError::InvalidValue { ref parameter, ref value, .. }
            if parameter == "subject" && value == "R0099"
    ));
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Log output of a controller refresh after `filtered` changed from 40 to 30 Hz.
fn refresh_log(verbose: Option<&str>) -> String {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());
    let mut config = experiment(dir.path(), 30.0);
    config.cache.policy = CachePolicy::Off;
    config
        .apply_env_from(|name| match name {
            ENV_CACHE_VERBOSE => verbose.map(str::to_string),
            _ => None,
        })
        .unwrap();

    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        Controller::new(config).unwrap();
    });
    captured.text()
}

#[test]
fn verbose_refresh_reports_parameter_changes() {
    let log = refresh_log(Some("1"));
    assert!(log.contains("Definition parameter changed"), "{log}");
    assert!(log.contains("parameter=h_freq"), "{log}");
    assert!(log.contains("old=40.0") && log.contains("new=30.0"), "{log}");
    assert!(log.contains("Outdated cache"), "{log}");

    let quiet = refresh_log(None);
    assert!(!quiet.contains("h_freq"), "{quiet}");
    assert!(!quiet.contains("Definition parameter changed"), "{quiet}");
}
