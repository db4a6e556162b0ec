use anyhow::Result;
use chrono::Utc;
use hp_runner::config::SetupRequest;
use hp_runner::error::HyperpowerError;
use hp_runner::model::{
    Evaluation, LayerSpec, ModelBackend, ModelDefinition, OptimizerSpec, TrainableModel,
    TrainingHistory,
};
use hp_runner::profile::{PowerSampler, SamplerGuard};
use hp_runner::{
    parse_trial_params, run_trial_with, setup_experiment, trial_exit_code, Experiment,
    ExperimentLayout, Metric, SetupOptions, SEARCH_ABORT_EXIT_CODE,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

const NETWORK: &str = r#"dataset:
  name: cifar10
  num_classes: 10
batch_size: 32
layers:
  - type: conv2d
    filters: HYPERPARAM{"type": "INT", "token": "conv1_num_output", "transform": "X2", "min": 10, "max": 18}
    kernel_size: HYPERPARAM{"type": "INT", "token": "conv1_kernel_size", "min": 3, "max": 5}
    padding: same
  - type: activation
    function: relu
  - type: flatten
  - type: dense
    units: 10
  - type: activation
    function: softmax
compile:
  loss: categorical_crossentropy
  optimizer:
    type: sgd
    lr: 0.01
    momentum: HYPERPARAM{"type": "FLOAT", "token": "momentum", "min": 0.95, "max": 0.999}
"#;

#[derive(Default)]
struct Calls {
    built: Vec<ModelDefinition>,
    fits: Vec<usize>,
    evaluations: Vec<Option<usize>>,
}

struct StubBackend {
    accuracy: f64,
    calls: Rc<RefCell<Calls>>,
}

struct StubModel {
    accuracy: f64,
    calls: Rc<RefCell<Calls>>,
}

impl ModelBackend for StubBackend {
    type Model = StubModel;

    fn build(&self, definition: &ModelDefinition) -> Result<StubModel> {
        self.calls.borrow_mut().built.push(definition.clone());
        Ok(StubModel {
            accuracy: self.accuracy,
            calls: Rc::clone(&self.calls),
        })
    }
}

impl TrainableModel for StubModel {
    fn fit(&mut self, epochs: usize) -> Result<TrainingHistory> {
        self.calls.borrow_mut().fits.push(epochs);
        Ok(TrainingHistory {
            val_accuracy: vec![self.accuracy; epochs],
            ..TrainingHistory::default()
        })
    }

    fn evaluate(&mut self, limit: Option<usize>) -> Result<Evaluation> {
        self.calls.borrow_mut().evaluations.push(limit);
        Ok(Evaluation {
            loss: 0.3,
            accuracy: self.accuracy,
        })
    }
}

struct LogSampler {
    contents: String,
}

impl PowerSampler for LogSampler {
    fn start(&self, log_path: &Path) -> Result<SamplerGuard> {
        fs::write(log_path, &self.contents)?;
        Ok(SamplerGuard::detached())
    }
}

fn experiment_dir(name: &str, settings: Option<&str>) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "hyperpower_it_{}_{}_{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let layout = ExperimentLayout::new(&root);
    fs::create_dir_all(&layout.model_dir).expect("model dir");
    fs::write(layout.network_def(), NETWORK).expect("network");
    if let Some(settings) = settings {
        fs::write(root.join("hyperpower.yaml"), settings).expect("settings");
    }
    root
}

fn request(root: &Path, constraint: Option<(Metric, f64)>, optimize: Metric) -> SetupRequest {
    SetupRequest {
        experiment: root.to_path_buf(),
        optimize,
        constraint: constraint.map(|c| c.0),
        constraint_value: constraint.map(|c| c.1),
        epochs: 1,
    }
}

fn suggestion() -> hp_runner::template::TrialParams {
    parse_trial_params(r#"{"conv1_num_output": [12], "conv1_kernel_size": [3], "momentum": [0.97]}"#)
        .expect("params")
}

const FAST_PROFILING: &str = "profiling:\n  sampler_program: \"true\"\n  passes: 2\n  batch: 8\n  pass_interval_ms: 0\n";

#[test]
fn unconstrained_trial_returns_error_percentage() {
    let root = experiment_dir("unconstrained", None);
    let setup = setup_experiment(
        request(&root, None, Metric::Error),
        &SetupOptions {
            launch: false,
            trial_binary: Some(PathBuf::from("/usr/local/bin/hyperpower")),
        },
    )
    .expect("setup");
    assert_eq!(
        setup.tokens,
        vec!["conv1_num_output", "conv1_kernel_size", "momentum"]
    );

    let search_space: Value =
        serde_json::from_str(&fs::read_to_string(&setup.search_space_path).expect("config.json"))
            .expect("json");
    assert_eq!(search_space["likelihood"], json!("GAUSSIAN"));
    assert_eq!(
        search_space["variables"]["conv1_num_output"],
        json!({"type": "INT", "size": 1, "min": 10, "max": 18})
    );
    assert_eq!(
        search_space["variables"]["momentum"],
        json!({"type": "FLOAT", "size": 1, "min": 0.95, "max": 0.999})
    );
    let layout = ExperimentLayout::new(&root.canonicalize().expect("canonical"));
    assert!(layout.optimizer_dir.join("mainrun.py").exists());

    let experiment = Experiment::load(&layout.root).expect("load");
    assert_eq!(experiment.config.epochs, 1);
    assert!(!experiment.template.as_str().contains("HYPERPARAM{"));

    let calls = Rc::new(RefCell::new(Calls::default()));
    let backend = StubBackend {
        accuracy: 0.9,
        calls: Rc::clone(&calls),
    };
    let sampler = LogSampler {
        contents: String::new(),
    };
    let outcome =
        run_trial_with(&experiment, 7, &suggestion(), &backend, &sampler).expect("trial");
    assert_eq!(outcome.value.objective(), 10.0);
    assert_eq!(outcome.value.to_string(), "10.0");

    let calls = calls.borrow();
    assert_eq!(calls.built.len(), 1);
    assert_eq!(calls.fits, vec![1]);
    assert_eq!(calls.evaluations, vec![None]);
    let def = &calls.built[0];
    assert_eq!(
        def.layers[0],
        LayerSpec::Conv2d {
            filters: 24,
            kernel_size: 3,
            padding: hp_runner::model::Padding::Same
        }
    );
    assert_eq!(
        def.compile.optimizer,
        OptimizerSpec::Sgd {
            lr: 0.01,
            momentum: 0.97,
            decay: 0.0
        }
    );

    let concrete = fs::read_to_string(&outcome.concrete_path).expect("concrete");
    assert!(concrete.contains("filters: 24"));
    assert!(!concrete.contains("HYPERPARAM"));
    let record: Value = serde_json::from_str(
        &fs::read_to_string(layout.trial_record(&outcome.prefix)).expect("record"),
    )
    .expect("record json");
    assert_eq!(record["job_id"], json!(7));
    assert_eq!(record["returned"], json!("10.0"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn violated_power_constraint_never_trains() {
    let root = experiment_dir("violated", Some(FAST_PROFILING));
    setup_experiment(
        request(&root, Some((Metric::Power, 50.0)), Metric::Error),
        &SetupOptions::default(),
    )
    .expect("setup");
    let experiment = Experiment::load(&root.canonicalize().expect("canonical")).expect("load");

    let calls = Rc::new(RefCell::new(Calls::default()));
    let backend = StubBackend {
        accuracy: 0.9,
        calls: Rc::clone(&calls),
    };
    let sampler = LogSampler {
        contents: "    Avg                         : 60.00 W\n".to_string(),
    };
    let outcome =
        run_trial_with(&experiment, 1, &suggestion(), &backend, &sampler).expect("trial");
    assert!(outcome.value.objective().is_nan());
    assert_eq!(outcome.value.constraint_margin(), Some(-10.0));
    assert_eq!(outcome.value.to_string(), r#"{"error": NaN, "power": -10.0}"#);

    // Only the profiling model was built: one warm-up epoch, then the
    // fixed-size evaluation passes.
    let calls = calls.borrow();
    assert_eq!(calls.built.len(), 1);
    assert_eq!(calls.fits, vec![1]);
    assert_eq!(calls.evaluations, vec![Some(8), Some(8)]);
    assert_eq!(outcome.result.accuracy, None);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn hardware_objective_reports_error_margin() {
    let root = experiment_dir("hwobjective", Some(FAST_PROFILING));
    let setup = setup_experiment(
        request(&root, Some((Metric::Error, 15.0)), Metric::Power),
        &SetupOptions::default(),
    )
    .expect("setup");
    let search_space: Value =
        serde_json::from_str(&fs::read_to_string(&setup.search_space_path).expect("config.json"))
            .expect("json");
    assert_eq!(
        search_space["tasks"],
        json!({
            "power": {"type": "OBJECTIVE", "likelihood": "GAUSSIAN"},
            "error": {"type": "CONSTRAINT", "likelihood": "GAUSSIAN"}
        })
    );

    let experiment = Experiment::load(&root.canonicalize().expect("canonical")).expect("load");
    let calls = Rc::new(RefCell::new(Calls::default()));
    let backend = StubBackend {
        accuracy: 0.88,
        calls: Rc::clone(&calls),
    };
    let sampler = LogSampler {
        contents: "Avg : 40.00 W\nAvg : 40.00 W\n".to_string(),
    };
    let outcome =
        run_trial_with(&experiment, 2, &suggestion(), &backend, &sampler).expect("trial");
    assert_eq!(outcome.value.objective(), 40.0);
    assert_eq!(outcome.value.constraint_margin(), Some(15.0 - 12.0));
    assert_eq!(calls.borrow().built.len(), 2);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn duplicate_token_fails_before_writing() {
    let root = experiment_dir("duplicate", None);
    let layout = ExperimentLayout::new(&root);
    let doubled = format!(
        "{}extra: HYPERPARAM{{\"type\": \"INT\", \"token\": \"momentum\", \"min\": 1, \"max\": 2}}\n",
        NETWORK
    );
    fs::write(layout.network_def(), doubled).expect("network");
    let err = setup_experiment(request(&root, None, Metric::Error), &SetupOptions::default())
        .expect_err("duplicate");
    assert!(matches!(
        err.downcast_ref::<HyperpowerError>(),
        Some(HyperpowerError::DuplicateToken(t)) if t == "momentum"
    ));
    assert!(!layout.tmp_dir.exists());
    assert!(!layout.optimizer_dir.exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn constrained_setup_requires_value() {
    let root = experiment_dir("novalue", None);
    let mut req = request(&root, None, Metric::Error);
    req.constraint = Some(Metric::Power);
    let err = setup_experiment(req, &SetupOptions::default()).expect_err("no value");
    assert!(matches!(
        err.downcast_ref::<HyperpowerError>(),
        Some(HyperpowerError::MissingConstraintValue(_))
    ));
    let _ = fs::remove_dir_all(root);
}

fn stub_backend() -> (StubBackend, Rc<RefCell<Calls>>) {
    let calls = Rc::new(RefCell::new(Calls::default()));
    let backend = StubBackend {
        accuracy: 0.9,
        calls: Rc::clone(&calls),
    };
    (backend, calls)
}

#[test]
fn missing_power_samples_abort_the_search() {
    let root = experiment_dir("nosamples", Some(FAST_PROFILING));
    setup_experiment(
        request(&root, Some((Metric::Power, 50.0)), Metric::Error),
        &SetupOptions::default(),
    )
    .expect("setup");
    let experiment = Experiment::load(&root.canonicalize().expect("canonical")).expect("load");
    let (backend, calls) = stub_backend();
    let sampler = LogSampler {
        contents: "sampler printed nothing useful\n".to_string(),
    };
    let err = run_trial_with(&experiment, 3, &suggestion(), &backend, &sampler)
        .expect_err("no samples");
    assert!(matches!(
        err.downcast_ref::<HyperpowerError>(),
        Some(HyperpowerError::NoMeasurements(_))
    ));
    assert_eq!(trial_exit_code(&err), SEARCH_ABORT_EXIT_CODE);
    assert!(calls.borrow().fits.iter().all(|&e| e == 1));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn incomplete_suggestion_is_rejected_before_writing_network() {
    let root = experiment_dir("incomplete", None);
    setup_experiment(request(&root, None, Metric::Error), &SetupOptions::default())
        .expect("setup");
    let layout = ExperimentLayout::new(&root.canonicalize().expect("canonical"));
    let experiment = Experiment::load(&layout.root).expect("load");
    let (backend, calls) = stub_backend();
    let sampler = LogSampler {
        contents: String::new(),
    };
    let partial = parse_trial_params(r#"{"conv1_num_output": [12], "conv1_kernel_size": [3]}"#)
        .expect("params");
    let err = run_trial_with(&experiment, 4, &partial, &backend, &sampler)
        .expect_err("momentum missing");
    assert!(matches!(
        err.downcast_ref::<HyperpowerError>(),
        Some(HyperpowerError::MissingSuggestion(t)) if t == "momentum"
    ));
    assert!(calls.borrow().built.is_empty());
    let concrete = fs::read_dir(&layout.tmp_dir)
        .expect("tmp")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with("_network_def.yaml"))
        .count();
    assert_eq!(concrete, 0);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn hardware_metric_requires_sampling_tool() {
    let settings = "profiling:\n  sampler_program: /nonexistent/nvidia-smi\n";
    let root = experiment_dir("nosampler", Some(settings));
    let err = setup_experiment(
        request(&root, Some((Metric::Energy, 2.0)), Metric::Error),
        &SetupOptions::default(),
    )
    .expect_err("no sampler");
    assert!(matches!(
        err.downcast_ref::<HyperpowerError>(),
        Some(HyperpowerError::MissingTool { tool, .. }) if tool == "/nonexistent/nvidia-smi"
    ));
    assert!(!ExperimentLayout::new(&root).tmp_dir.exists());

    // Unconstrained runs never touch the sampler.
    setup_experiment(request(&root, None, Metric::Error), &SetupOptions::default())
        .expect("unconstrained setup");
    let _ = fs::remove_dir_all(root);
}

#[test]
fn launch_requires_optimizer_installation() {
    let root = experiment_dir("nooptimizer", None);
    let launch = SetupOptions {
        launch: true,
        trial_binary: None,
    };
    let err = setup_experiment(request(&root, None, Metric::Error), &launch)
        .expect_err("no optimizer root");
    assert!(matches!(
        err.downcast_ref::<HyperpowerError>(),
        Some(HyperpowerError::MissingTool { tool, .. }) if tool == "optimizer"
    ));

    let optimizer_root = root.join("spearmint_install");
    fs::create_dir_all(optimizer_root.join("spearmint")).expect("optimizer root");
    fs::write(
        root.join("hyperpower.yaml"),
        format!("optimizer:\n  root: {}\n", optimizer_root.display()),
    )
    .expect("settings");
    let err = setup_experiment(request(&root, None, Metric::Error), &launch)
        .expect_err("no main script");
    assert!(matches!(
        err.downcast_ref::<HyperpowerError>(),
        Some(HyperpowerError::MissingFile { path, .. }) if path.ends_with("spearmint/main.py")
    ));

    fs::write(optimizer_root.join("spearmint").join("main.py"), "").expect("main");
    let err = setup_experiment(request(&root, None, Metric::Error), &launch)
        .expect_err("no cleanup script");
    assert!(matches!(
        err.downcast_ref::<HyperpowerError>(),
        Some(HyperpowerError::MissingFile { path, .. }) if path.ends_with("spearmint/cleanup.sh")
    ));

    fs::write(optimizer_root.join("spearmint").join("cleanup.sh"), "").expect("cleanup");
    fs::write(
        root.join("hyperpower.yaml"),
        format!(
            "optimizer:\n  root: {}\n  database_bin: {}\n",
            optimizer_root.display(),
            root.join("no_mongod").display()
        ),
    )
    .expect("settings");
    let err = setup_experiment(request(&root, None, Metric::Error), &launch)
        .expect_err("no database");
    assert!(matches!(
        err.downcast_ref::<HyperpowerError>(),
        Some(HyperpowerError::MissingFile { path, .. }) if path.ends_with("no_mongod")
    ));
    assert!(!ExperimentLayout::new(&root).optimizer_dir.exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn rerun_setup_clears_previous_state() {
    let root = experiment_dir("rerun", None);
    let optimizer_root = root.join("spearmint_install");
    fs::create_dir_all(optimizer_root.join("spearmint")).expect("optimizer root");
    fs::write(
        optimizer_root.join("spearmint").join("cleanup.sh"),
        "touch \"$1/../cleanup_ran\"\n",
    )
    .expect("cleanup script");
    fs::write(
        root.join("hyperpower.yaml"),
        format!("optimizer:\n  root: {}\n", optimizer_root.display()),
    )
    .expect("settings");

    let first = setup_experiment(request(&root, None, Metric::Error), &SetupOptions::default())
        .expect("first setup");
    let layout = ExperimentLayout::new(&root.canonicalize().expect("canonical"));
    assert!(!layout.root.join("cleanup_ran").exists());
    fs::write(layout.tmp_dir.join("old_job1_network_def.yaml"), "stale").expect("stale tmp");
    fs::write(layout.optimizer_dir.join("output.log"), "stale").expect("stale optimizer");

    let second = setup_experiment(request(&root, None, Metric::Error), &SetupOptions::default())
        .expect("second setup");
    assert_eq!(first.search_space_path, second.search_space_path);
    assert!(layout.root.join("cleanup_ran").exists());
    assert!(!layout.tmp_dir.join("old_job1_network_def.yaml").exists());
    assert!(!layout.optimizer_dir.join("output.log").exists());
    assert!(layout.search_space().exists());
    assert!(layout.template().exists());
    assert!(layout.network_def().exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn demo_network_instantiates_to_valid_model() {
    let source = include_str!("../../../demos/cifar10/model/network_def.yaml");
    let extraction = hp_runner::extract::extract(source).expect("extract");
    assert_eq!(extraction.specs.len(), 11);
    let specs = extraction
        .specs
        .iter()
        .map(|s| (s.token.clone(), s.clone()))
        .collect();
    let raw = extraction
        .specs
        .iter()
        .map(|s| (s.token.clone(), json!([s.min])))
        .collect();
    let transformed = hp_runner::template::transform_params(&specs, &raw).expect("transform");
    let concrete = extraction.template.instantiate(&transformed).expect("instantiate");
    let def = ModelDefinition::parse(&concrete).expect("model");
    assert_eq!(
        def.layers[0],
        LayerSpec::Conv2d {
            filters: 20,
            kernel_size: 3,
            padding: hp_runner::model::Padding::Same
        }
    );
    match def.compile.optimizer {
        OptimizerSpec::Sgd { lr, momentum, .. } => {
            assert!((lr - 0.1).abs() < 1e-12);
            assert!((momentum - 0.95).abs() < 1e-12);
        }
        other => panic!("unexpected optimizer {:?}", other),
    }
}

#[test]
fn demo_settings_name_a_shipped_trainer() {
    let demo = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/cifar10");
    let settings = hp_runner::config::ExperimentSettings::load(&demo).expect("demo settings");
    let script = settings
        .trainer
        .command
        .iter()
        .find(|arg| arg.starts_with("./"))
        .expect("trainer script argument");
    let trainer = fs::read_to_string(demo.join(script)).expect("trainer script shipped");
    for op in ["\"build\"", "\"fit\"", "\"evaluate\""] {
        assert!(trainer.contains(op), "trainer does not handle {}", op);
    }
}
