use crate::{
    checkpoint::{ParameterStore, WeightsFile},
    config::TrainConfig,
    data::DataSource,
    network::NetworkGraph,
    Error,
};
use anyhow::{bail, Context, Result};
use num_format::{Locale, ToFormattedString};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{LineWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// The state of a [`Trainer`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrainState {
    /// Waiting for [`Trainer::initialize()`].
    Initializing,
    /// Running iterations.
    Iterating,
    /// Finished or failed.
    Terminal,
}

/// The result of one iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationRecord {
    pub iteration: u32,
    pub width: usize,
    pub height: usize,
    pub learning_rate: f32,
    /// Loss per sample.
    pub loss: f32,
    /// Moving average of `loss`.
    pub avg_loss: f32,
}

impl fmt::Display for IterationRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}, {}",
            self.iteration, self.width, self.height, self.learning_rate, self.loss, self.avg_loss
        )
    }
}

/// Exponential moving average of the loss.
///
/// The first value is taken as is, later values are blended in as `0.9 * avg + 0.1 * loss`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LossAverage {
    value: Option<f32>,
}

impl LossAverage {
    /// Adds `loss`, returning the new average.
    pub fn push(&mut self, loss: f32) -> f32 {
        let value = match self.value {
            Some(avg) => 0.9 * avg + 0.1 * loss,
            None => loss,
        };
        self.value.replace(value);
        value
    }
    pub fn value(&self) -> Option<f32> {
        self.value
    }
}

/// Appends one [`IterationRecord`] per line to `loss_<unix seconds>.log`.
#[derive(Debug)]
pub struct TrainingLog {
    path: PathBuf,
    writer: LineWriter<File>,
}

impl TrainingLog {
    /// Opens a new log in `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {dir:?}!"))?;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|x| x.as_secs())
            .unwrap_or_default();
        let path = dir.join(format!("loss_{secs}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open training log {path:?}!"))?;
        Ok(Self {
            path,
            writer: LineWriter::new(file),
        })
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn append(&mut self, record: &IterationRecord) -> Result<()> {
        writeln!(self.writer, "{record}")?;
        Ok(())
    }
}

/// Returned by [`Trainer::run()`].
#[derive(Clone, Debug)]
pub struct TrainSummary {
    /// The iteration training started (or resumed) from.
    pub start_iteration: u32,
    /// Iterations run by this call.
    pub iterations: u32,
    pub last_loss: Option<f32>,
    pub avg_loss: Option<f32>,
    /// Samples processed by this call.
    pub images: u64,
    pub elapsed: Duration,
    pub log: Option<PathBuf>,
    pub final_weights: Option<PathBuf>,
}

/// Drives a [`NetworkGraph`] through training.
///
/// Each iteration loads, runs forward and backward for every subdivision, then updates the
/// parameters once with the summed gradients. Checkpoints are written as the
/// [`SavePolicy`](crate::schedule::SavePolicy) demands, and the input is resized as the
/// [`ResizePolicy`](crate::schedule::ResizePolicy) demands.
///
/// Any error ends training, moving the trainer to [`TrainState::Terminal`].
///
/// ```no_run
/// # use convgraph::{config::TrainConfig, network::{NetworkDefinition, NetworkGraph}};
/// # use convgraph::{train::Trainer, Device};
/// # use convgraph::{data::ObjectInfo, tensor::Tensor4D};
/// let config = TrainConfig::from_path("train.json")?;
/// let definition = NetworkDefinition::from_path("network.json")?;
/// let mut graph = NetworkGraph::load(&definition, &config, Device::host())?;
/// let mut source = |input: &mut Tensor4D, truths: &mut [ObjectInfo]| -> anyhow::Result<()> {
///     input.fill(0.5)
/// };
/// let summary = Trainer::new(config).run(&mut graph, &mut source)?;
/// println!("{summary:?}");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Trainer<S: ParameterStore = WeightsFile> {
    config: TrainConfig,
    store: S,
    state: TrainState,
    start_iteration: u32,
    iteration: u32,
    average: LossAverage,
    last_loss: Option<f32>,
    images: u64,
    rng: StdRng,
    log: Option<TrainingLog>,
}

impl Trainer {
    /// A trainer writing [`WeightsFile`] checkpoints.
    pub fn new(config: TrainConfig) -> Self {
        Self::with_store(config, WeightsFile)
    }
}

impl<S: ParameterStore> Trainer<S> {
    pub fn with_store(config: TrainConfig, store: S) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            store,
            state: TrainState::Initializing,
            start_iteration: 0,
            iteration: 0,
            average: LossAverage::default(),
            last_loss: None,
            images: 0,
            rng,
            log: None,
        }
    }
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }
    pub fn state(&self) -> TrainState {
        self.state
    }
    /// The number of completed iterations.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }
    pub fn average_loss(&self) -> Option<f32> {
        self.average.value()
    }
    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(TrainingLog::path)
    }
    /// Prepares training of `graph`.
    ///
    /// Restores parameters from `resume_from` when set. The stored iteration is continued
    /// from unless `restart` is set.
    ///
    /// **Errors**
    ///
    /// - [`Error::Config`] if `graph` was not loaded with this configuration.
    /// - If the checkpoint cannot be restored or the log cannot be created.
    pub fn initialize(&mut self, graph: &mut NetworkGraph) -> Result<()> {
        if self.state != TrainState::Initializing {
            bail!("Trainer is already initialized!");
        }
        let result = self.try_initialize(graph);
        if result.is_err() {
            self.state = TrainState::Terminal;
        }
        result
    }
    fn try_initialize(&mut self, graph: &mut NetworkGraph) -> Result<()> {
        let config = &self.config;
        config.validate()?;
        if graph.mini_batch() != config.mini_batch
            || graph.batch() != config.batch()
            || graph.max_truths() != config.max_truths
        {
            return Err(Error::config(format!(
                "graph has mini_batch {}, batch {} and max_truths {}, config {}, {} and {}",
                graph.mini_batch(),
                graph.batch(),
                graph.max_truths(),
                config.mini_batch,
                config.batch(),
                config.max_truths
            ))
            .into());
        }
        if let Some(path) = config.resume_from.as_ref() {
            let iteration = self.store.load(path, graph)?;
            self.iteration = if config.restart { 0 } else { iteration };
            tracing::info!(?path, iteration = self.iteration, "resuming");
        }
        self.start_iteration = self.iteration;
        if let Some(dir) = config.log_dir.as_ref() {
            self.log.replace(TrainingLog::create(dir)?);
        }
        self.state = if self.iteration < config.max_batches {
            TrainState::Iterating
        } else {
            TrainState::Terminal
        };
        Ok(())
    }
    /// Runs one iteration.
    ///
    /// **Errors**
    ///
    /// If the trainer is not [`TrainState::Iterating`], or the iteration fails.
    pub fn step(
        &mut self,
        graph: &mut NetworkGraph,
        source: &mut dyn DataSource,
    ) -> Result<IterationRecord> {
        if self.state != TrainState::Iterating {
            bail!("Trainer is {:?}, not iterating!", self.state);
        }
        let result = self.iterate(graph, source);
        if let Err(e) = result.as_ref() {
            tracing::error!(iteration = self.iteration, "training failed: {e:#}");
            self.state = TrainState::Terminal;
        }
        result
    }
    fn iterate(
        &mut self,
        graph: &mut NetworkGraph,
        source: &mut dyn DataSource,
    ) -> Result<IterationRecord> {
        let iteration = self.iteration;
        let batch = self.config.batch();
        let mut loss_sum = 0.;
        for _ in 0..self.config.subdivisions {
            graph.load_batch(source)?;
            graph.forward(true)?;
            graph.backward()?;
            loss_sum += graph.loss();
        }
        let loss = loss_sum / batch as f32;
        let avg_loss = self.average.push(loss);
        self.last_loss.replace(loss);
        let learning_rate = self
            .config
            .learning_rate
            .rate(iteration, self.config.max_batches);
        graph.update(learning_rate / batch as f32)?;
        self.images += batch as u64;
        let record = IterationRecord {
            iteration,
            width: graph.input().width(),
            height: graph.input().height(),
            learning_rate,
            loss,
            avg_loss,
        };
        if let Some(log) = self.log.as_mut() {
            log.append(&record)?;
        }
        tracing::info!(
            iteration,
            loss,
            avg_loss,
            learning_rate,
            images = %self.images.to_formatted_string(&Locale::en),
        );
        let completed = iteration + 1;
        let save = &self.config.save;
        if save.due(completed) {
            self.store.save(&save.path(completed), completed, graph)?;
        }
        if let Some(resize) = self.config.resize.as_ref() {
            if let Some(size) = resize.next(completed, &mut self.rng) {
                if size != record.width || size != record.height {
                    graph.resize_input(size, size)?;
                }
            }
        }
        self.iteration = completed;
        if completed >= self.config.max_batches {
            self.state = TrainState::Terminal;
        }
        Ok(record)
    }
    /// Initializes if needed and trains until `max_batches`.
    ///
    /// Writes `<prefix>_final.weights` when training completes and `save_final` is set.
    pub fn run(
        &mut self,
        graph: &mut NetworkGraph,
        source: &mut dyn DataSource,
    ) -> Result<TrainSummary> {
        let start = Instant::now();
        if self.state == TrainState::Initializing {
            self.initialize(graph)?;
        }
        let images = self.images;
        let first = self.iteration;
        while self.state == TrainState::Iterating {
            self.step(graph, source)?;
        }
        let save = &self.config.save;
        let final_weights = if save.save_final {
            let path = save.final_path();
            self.store.save(&path, self.iteration, graph)?;
            Some(path)
        } else {
            None
        };
        let summary = TrainSummary {
            start_iteration: self.start_iteration,
            iterations: self.iteration - first,
            last_loss: self.last_loss,
            avg_loss: self.average.value(),
            images: self.images - images,
            elapsed: start.elapsed(),
            log: self.log_path().map(Path::to_path_buf),
            final_weights,
        };
        tracing::info!(
            iterations = summary.iterations,
            images = %summary.images.to_formatted_string(&Locale::en),
            elapsed = ?summary.elapsed,
            avg_loss = ?summary.avg_loss,
            "training finished"
        );
        Ok(summary)
    }
}

impl<S: ParameterStore> fmt::Debug for Trainer<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("state", &self.state)
            .field("iteration", &self.iteration)
            .field("average", &self.average)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::ObjectInfo,
        network::NetworkDefinition,
        schedule::{ResizePolicy, SavePolicy},
        tensor::Tensor4D,
    };
    use approx::assert_relative_eq;
    use krnl::device::Device;

    const NET: &str = r#"{
        "input": { "channels": 1, "width": 8, "height": 8 },
        "anchors": [{ "width": 100, "height": 100 }],
        "layers": [
            { "kind": "convolutional", "filters": 7, "size": 3, "pad": 1 },
            { "kind": "detection", "classes": 2 }
        ]
    }"#;

    fn config(dir: &Path) -> TrainConfig {
        TrainConfig {
            mini_batch: 2,
            subdivisions: 2,
            max_truths: 2,
            max_batches: 4,
            save: SavePolicy {
                dir: dir.join("backup"),
                interval: 2,
                ..SavePolicy::default()
            },
            log_dir: Some(dir.join("logs")),
            ..TrainConfig::default()
        }
    }

    fn build_graph(config: &TrainConfig) -> NetworkGraph {
        let definition = NetworkDefinition::from_json(NET).unwrap();
        NetworkGraph::load(&definition, config, Device::host()).unwrap()
    }

    fn source(input: &mut Tensor4D, truths: &mut [ObjectInfo]) -> Result<()> {
        let len = input.len();
        for (i, x) in input.host_mut()?.iter_mut().enumerate() {
            *x = i as f32 / len as f32;
        }
        truths[0] = ObjectInfo::new(1, [0.5, 0.5, 0.3, 0.2]);
        Ok(())
    }

    #[test]
    fn loss_average() {
        let mut average = LossAverage::default();
        assert_eq!(average.value(), None);
        assert_eq!(average.push(10.), 10.);
        assert_relative_eq!(average.push(20.), 11.);
        assert_relative_eq!(average.push(1.), 10.);
    }

    #[test]
    fn record_line() {
        let record = IterationRecord {
            iteration: 3,
            width: 416,
            height: 416,
            learning_rate: 0.001,
            loss: 1.5,
            avg_loss: 2.,
        };
        assert_eq!(record.to_string(), "3, 416, 416, 0.001, 1.5, 2");
    }

    #[test]
    fn run_saves_and_logs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let mut graph = build_graph(&config);
        let mut trainer = Trainer::new(config);
        let summary = trainer.run(&mut graph, &mut source)?;
        assert_eq!(trainer.state(), TrainState::Terminal);
        assert_eq!(trainer.iteration(), 4);
        assert_eq!(summary.iterations, 4);
        assert_eq!(summary.images, 16);
        let backup = dir.path().join("backup");
        assert!(backup.join("weights_2.weights").exists());
        assert!(backup.join("weights_4.weights").exists());
        assert!(!backup.join("weights_1.weights").exists());
        assert_eq!(summary.final_weights, Some(backup.join("weights_final.weights")));
        let log = fs::read_to_string(summary.log.unwrap())?;
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("0, 8, 8, "));
        assert!(lines[3].starts_with("3, 8, 8, "));
        Ok(())
    }

    #[test]
    fn resume_continues_counter() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let mut graph = build_graph(&config);
        Trainer::new(config.clone()).run(&mut graph, &mut source)?;
        let resumed = TrainConfig {
            max_batches: 6,
            resume_from: Some(dir.path().join("backup").join("weights_4.weights")),
            ..config.clone()
        };
        let mut graph = build_graph(&resumed);
        let mut trainer = Trainer::new(resumed.clone());
        trainer.initialize(&mut graph)?;
        assert_eq!(trainer.iteration(), 4);
        let record = trainer.step(&mut graph, &mut source)?;
        assert_eq!(record.iteration, 4);
        let restarted = TrainConfig {
            restart: true,
            ..resumed
        };
        let mut trainer = Trainer::new(restarted);
        trainer.initialize(&mut graph)?;
        assert_eq!(trainer.iteration(), 0);
        Ok(())
    }

    #[test]
    fn resize_changes_input() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainConfig {
            resize: Some(ResizePolicy {
                interval: 1,
                min: 16,
                max: 16,
                step: 8,
            }),
            ..config(dir.path())
        };
        let mut graph = build_graph(&config);
        let mut trainer = Trainer::new(config);
        trainer.initialize(&mut graph)?;
        let record = trainer.step(&mut graph, &mut source)?;
        assert_eq!((record.width, record.height), (8, 8));
        assert_eq!((graph.input().width(), graph.input().height()), (16, 16));
        let record = trainer.step(&mut graph, &mut source)?;
        assert_eq!((record.width, record.height), (16, 16));
        Ok(())
    }

    #[test]
    fn mismatched_graph() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let mut graph = build_graph(&config);
        let mut trainer = Trainer::new(TrainConfig {
            mini_batch: 4,
            ..config
        });
        let error = trainer.initialize(&mut graph).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Config(_))));
        assert_eq!(trainer.state(), TrainState::Terminal);
        Ok(())
    }

    #[test]
    fn source_error_ends_training() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let mut graph = build_graph(&config);
        let mut trainer = Trainer::new(config);
        trainer.initialize(&mut graph)?;
        let mut calls = 0;
        let mut failing = |input: &mut Tensor4D, truths: &mut [ObjectInfo]| -> Result<()> {
            calls += 1;
            if calls > 2 {
                bail!("out of images");
            }
            source(input, truths)
        };
        trainer.step(&mut graph, &mut failing)?;
        assert!(trainer.step(&mut graph, &mut failing).is_err());
        assert_eq!(trainer.state(), TrainState::Terminal);
        assert_eq!(trainer.iteration(), 1);
        assert!(trainer.step(&mut graph, &mut source).is_err());
        Ok(())
    }
}
