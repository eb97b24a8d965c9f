use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Context;
use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::checkpoint::{
    Checkpoint, CheckpointKind, CheckpointStore, CheckpointSummary, FileCheckpointStore,
};
use crate::cli::TrainArgs;
use crate::config::{BatchStrategy, CheckpointMetric, LossConfig, PinnConfig, TrainingConfig};
use crate::data::TemperatureTable;
use crate::error::{PinnError, PinnResult};
use crate::evaluation::{DEFAULT_CHUNK_SIZE, ErrorStats, Evaluator, predict};
use crate::geometry::{ClassifiedMesh, GeometryClassifier};
use crate::loss::{LossComposer, LossHistory, LossRecord, ResidualScales, TrainingBatches};
use crate::model::{FieldScaling, InputBounds, Model};
use crate::pinn::ResidualEngine;
use crate::points::{InitialTemperature, PointSet, PointSetBuilder, PointSets};
use crate::report::{plot_loss_history, write_loss_history_csv};

type MyBackend = Autodiff<NdArray<f32>>;

/// 学習ループの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Initialized,
    Training,
    Validating,
    Checkpointing,
    Completed,
    Failed,
}

/// 学習が終了した理由。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxEpochs,
    EarlyStopped,
    StopRequested,
    Failed,
}

/// 学習の停止要求。エポックの区切りでのみ確認します。
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 学習の結果。
#[derive(Debug)]
pub struct TrainingReport<B: Backend> {
    pub state: TrainingState,
    pub stop_reason: StopReason,
    pub history: LossHistory,
    pub best: Option<CheckpointSummary>,
    pub last: Option<CheckpointSummary>,
    pub failure: Option<PinnError>,
    /// 学習を止めなかった警告（チェックポイントの保存失敗など）
    pub warnings: Vec<String>,
    /// 損失が有限と確認できた最後のパラメータ（`last` と同じ）。1エポックも有効でなければ初期値
    pub model: Model<B>,
    pub best_model: Option<Model<B>>,
}

/// 入力テーブルから学習に必要なものを一通り組み立てます。
#[derive(Debug, Clone)]
pub struct TrainingSetup {
    pub classifier: GeometryClassifier,
    pub mesh: ClassifiedMesh,
    pub sets: PointSets,
    pub scaling: FieldScaling,
    pub scales: ResidualScales,
}

impl TrainingSetup {
    /// センサ観測は教師データ、全場テーブルはコロケーション点・初期条件・検証に使います。
    pub fn prepare(
        config: &PinnConfig,
        sensors: &TemperatureTable,
        field: &TemperatureTable,
    ) -> PinnResult<Self> {
        config.validate()?;
        let classifier = GeometryClassifier::new(&config.geometry)?;
        let mesh = classifier.classify_all(field.nodes())?;
        for node in sensors.nodes() {
            classifier.classify(node)?;
        }

        let initial = InitialTemperature::PerNode {
            values: field.first_frame_temperatures(),
            fallback: config.initial_temperature,
        };
        let sets = PointSetBuilder::new(&config.sampling, config.seed).build(
            &mesh,
            field.times(),
            &sensors.labeled_samples(),
            &initial,
            &field.labeled_samples(),
        )?;

        let (field_start, field_end) = field.time_range();
        let (t_start, t_end) = if sensors.times().is_empty() {
            (field_start, field_end)
        } else {
            let (s_start, s_end) = sensors.time_range();
            (field_start.min(s_start), field_end.max(s_end))
        };
        let inputs = InputBounds::for_shaft(
            classifier.max_radius(),
            classifier.total_length(),
            t_start,
            t_end,
        );
        Ok(Self {
            classifier,
            mesh,
            sets,
            scaling: FieldScaling::new(inputs, &config.model),
            scales: ResidualScales::resolve(config, t_end - t_start),
        })
    }

    pub fn model<B: Backend>(&self, config: &PinnConfig, device: &B::Device) -> Model<B> {
        Model::new(&config.model, self.scaling, device)
    }

    pub fn composer(&self, config: &PinnConfig) -> LossComposer {
        let engine = ResidualEngine::new(&config.material, &config.boundaries, &config.geometry);
        LossComposer::new(engine, &config.loss, self.scales)
    }
}

/// 検証用の座標とラベル。
struct ValidationSet {
    coords: Vec<[f64; 4]>,
    labels: Vec<f64>,
}

impl ValidationSet {
    fn new(set: &PointSet) -> Self {
        let (coords, labels) = set
            .points()
            .iter()
            .filter_map(|p| p.label.map(|label| (p.coords, label)))
            .unzip();
        Self { coords, labels }
    }

    fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    fn errors<B: Backend>(&self, model: &Model<B>, device: &B::Device) -> PinnResult<ErrorStats> {
        let predicted = predict(model, &self.coords, DEFAULT_CHUNK_SIZE, device)?;
        Ok(ErrorStats::from_errors(
            predicted.iter().zip(&self.labels).map(|(p, t)| p - t),
        ))
    }
}

/// 学習ループ。パラメータを所有し、エポックごとに1回だけ更新します。
pub struct Trainer<B: AutodiffBackend> {
    training: TrainingConfig,
    loss: LossConfig,
    composer: LossComposer,
    sets: PointSets,
    seed: u64,
    device: B::Device,
    state: TrainingState,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        config: &PinnConfig,
        composer: LossComposer,
        sets: PointSets,
        device: &B::Device,
    ) -> Self {
        Self {
            training: config.training.clone(),
            loss: config.loss.clone(),
            composer,
            sets,
            seed: config.seed,
            device: device.clone(),
            state: TrainingState::Initialized,
        }
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    fn transition(&mut self, next: TrainingState) {
        tracing::debug!("状態遷移: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn full_batches(&self) -> TrainingBatches<B> {
        let device = &self.device;
        TrainingBatches {
            sensors: self.sets.sensors.to_batch(device),
            initial_condition: self.sets.initial_condition.to_batch(device),
            domain: self.sets.domain.to_batch(device),
            end: self.sets.end.to_batch(device),
            step: self.sets.step.to_batch(device),
            side: self.sets.side.to_batch(device),
        }
    }

    fn minibatches(&self, size: usize, rng: &mut StdRng) -> TrainingBatches<B> {
        let device = &self.device;
        TrainingBatches {
            sensors: self.sets.sensors.minibatch(size, rng, device),
            initial_condition: self.sets.initial_condition.minibatch(size, rng, device),
            domain: self.sets.domain.minibatch(size, rng, device),
            end: self.sets.end.minibatch(size, rng, device),
            step: self.sets.step.minibatch(size, rng, device),
            side: self.sets.side.minibatch(size, rng, device),
        }
    }

    /// `model` の損失を全点で計算します。
    fn measure(&self, model: &Model<B>, full: Option<&TrainingBatches<B>>, epoch: usize) -> LossRecord {
        let batches = full.cloned().unwrap_or_else(|| self.full_batches());
        let losses = self.composer.component_losses(model, &batches);
        let total = self.composer.total(&losses);
        self.composer.record(epoch, &losses, &total)
    }

    /// 学習を実行します。
    ///
    /// 損失が非有限になったエポックではパラメータを更新せず、チェックポイントも保存しません。
    /// その場合 `last` とレポートのモデルは、損失が有限と確認できた最後のパラメータになります。
    /// チェックポイントの保存失敗は警告として記録し、学習は続けます。
    pub fn fit<S: CheckpointStore<B>>(
        mut self,
        mut model: Model<B>,
        store: &mut S,
        stop: &StopHandle,
    ) -> TrainingReport<B> {
        let config = self.training.clone();
        let mut optim = AdamConfig::new()
            .with_grad_clipping(config.grad_clip_norm.map(GradientClippingConfig::Norm))
            .init::<B, Model<B>>();

        let full = match config.batch {
            BatchStrategy::Full => Some(self.full_batches()),
            BatchStrategy::Minibatch { .. } => None,
        };
        let mut batch_rng = StdRng::seed_from_u64(self.seed ^ 0xB47C_0000_0000_0001);

        let validation = ValidationSet::new(&self.sets.validation);
        let metric = match config.checkpoint_metric {
            CheckpointMetric::ValidationRmse | CheckpointMetric::ValidationMae
                if validation.is_empty() =>
            {
                tracing::warn!("検証用の点がないため、{} の代わりに total_loss でベストを判定します。", config.checkpoint_metric.name());
                CheckpointMetric::TotalLoss
            }
            metric => metric,
        };
        let goal = config.checkpoint_goal;

        let mut history = LossHistory::default();
        let mut best: Option<Checkpoint<B>> = None;
        let mut warnings = Vec::new();
        let mut failure = None;
        let mut stop_reason = StopReason::MaxEpochs;
        // 損失が有限と確認できた最後のパラメータ
        let mut last_valid: Option<Snapshot<B>> = None;
        let mut completed = 0;
        let mut stale_passes = 0;

        self.transition(TrainingState::Training);
        tracing::info!(
            "学習を開始します - エポック数: {}, 学習率: {}, ベスト判定: {} ({:?})",
            config.num_epochs,
            config.learning_rate,
            metric.name(),
            goal
        );
        let training_start = Instant::now();

        for epoch in 1..=config.num_epochs {
            if stop.is_stop_requested() {
                tracing::info!("停止要求を受け付けました (epoch {})", epoch - 1);
                stop_reason = StopReason::StopRequested;
                break;
            }

            let batches = match (&full, config.batch) {
                (Some(batches), _) => batches.clone(),
                (None, BatchStrategy::Minibatch { size }) => self.minibatches(size, &mut batch_rng),
                (None, BatchStrategy::Full) => self.full_batches(),
            };
            let losses = self.composer.component_losses(&model, &batches);
            let total_loss = self.composer.total(&losses);
            let record = self.composer.record(epoch, &losses, &total_loss);
            history.push(record);

            if let Some(term) = record.first_non_finite() {
                tracing::error!("epoch {epoch} で損失 `{term}` が非有限になりました。学習を中止します。");
                failure = Some(PinnError::NumericalDivergence {
                    epoch,
                    term: term.to_string(),
                });
                stop_reason = StopReason::Failed;
                break;
            }

            if epoch % config.log_interval == 0 || epoch == 1 {
                tracing::info!(
                    "[Epoch {}] Total: {:.6}, Data: {:.6}, IC: {:.6}, PDE: {:.6}, End: {:.6}, Step: {:.6}, Side: {:.6}",
                    epoch,
                    record.total,
                    record.data,
                    record.initial_condition,
                    record.pde,
                    record.end,
                    record.step,
                    record.side
                );
            }

            // `record` はこの更新前のパラメータの損失
            let snapshot = model.clone();
            last_valid = Some(Snapshot {
                epoch,
                model: snapshot.clone(),
                total: record.total,
            });

            let grads = total_loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(config.learning_rate, model, grads);
            completed = epoch;

            if self.loss.adaptive && epoch % self.loss.adaptive_interval == 0 {
                self.composer.rebalance(&record);
            }

            let validating = epoch % config.validation_interval == 0 || epoch == config.num_epochs;
            if !validating {
                continue;
            }

            self.transition(TrainingState::Validating);
            // total_loss は更新前、検証指標は更新後のパラメータに対応する
            let (value, candidate) = match metric {
                CheckpointMetric::TotalLoss => (Ok(record.total), &snapshot),
                CheckpointMetric::ValidationRmse => (
                    validation.errors(&model.valid(), &self.device).map(|stats| stats.rmse),
                    &model,
                ),
                CheckpointMetric::ValidationMae => (
                    validation.errors(&model.valid(), &self.device).map(|stats| stats.mae),
                    &model,
                ),
            };
            let value = match value {
                Ok(value) if value.is_finite() => value,
                Ok(_) => {
                    tracing::error!("epoch {epoch} で検証指標 `{}` が非有限になりました。", metric.name());
                    failure = Some(PinnError::NumericalDivergence {
                        epoch,
                        term: metric.name().to_string(),
                    });
                    stop_reason = StopReason::Failed;
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    stop_reason = StopReason::Failed;
                    break;
                }
            };
            tracing::info!("[Epoch {}] 検証 {}: {:.6}", epoch, metric.name(), value);

            if best.as_ref().is_none_or(|b| goal.improves(value, b.metric_value)) {
                self.transition(TrainingState::Checkpointing);
                let checkpoint = Checkpoint {
                    kind: CheckpointKind::Best,
                    epoch,
                    metric: metric.name().to_string(),
                    metric_value: value,
                    model: candidate.clone(),
                };
                if let Err(e) = store.save(&checkpoint) {
                    tracing::warn!("ベストのチェックポイントを保存できませんでした: {e}");
                    warnings.push(e.to_string());
                }
                best = Some(checkpoint);
                stale_passes = 0;
            } else {
                stale_passes += 1;
            }
            self.transition(TrainingState::Training);

            if config.patience.is_some_and(|patience| stale_passes >= patience) {
                tracing::info!("{stale_passes} 回連続で改善しなかったため早期終了します (epoch {epoch})");
                stop_reason = StopReason::EarlyStopped;
                break;
            }
        }

        // 最後の更新後のパラメータは損失が未確認なので、全点で測り直す
        if failure.is_none() && completed > 0 {
            let record = self.measure(&model, full.as_ref(), completed);
            match record.first_non_finite() {
                None => {
                    last_valid = Some(Snapshot {
                        epoch: completed,
                        model: model.clone(),
                        total: record.total,
                    });
                }
                Some(term) => {
                    tracing::error!("最終パラメータの損失 `{term}` が非有限です。");
                    failure = Some(PinnError::NumericalDivergence {
                        epoch: completed,
                        term: term.to_string(),
                    });
                    stop_reason = StopReason::Failed;
                }
            }
        }

        let last = last_valid.map(|snapshot| {
            self.transition(TrainingState::Checkpointing);
            let checkpoint = Checkpoint {
                kind: CheckpointKind::Last,
                epoch: snapshot.epoch,
                metric: CheckpointMetric::TotalLoss.name().to_string(),
                metric_value: snapshot.total,
                model: snapshot.model,
            };
            if let Err(e) = store.save(&checkpoint) {
                tracing::warn!("最終のチェックポイントを保存できませんでした: {e}");
                warnings.push(e.to_string());
            }
            checkpoint
        });
        if let Some(checkpoint) = &last {
            model = checkpoint.model.clone();
        }

        let state = if failure.is_some() {
            TrainingState::Failed
        } else {
            TrainingState::Completed
        };
        self.transition(state);
        tracing::info!(
            "学習が終了しました ({:?})。=> 学習時間: {:.2?}",
            stop_reason,
            training_start.elapsed()
        );

        TrainingReport {
            state,
            stop_reason,
            history,
            best: best.as_ref().map(Checkpoint::summary),
            last: last.as_ref().map(Checkpoint::summary),
            failure,
            warnings,
            model,
            best_model: best.map(|b| b.model),
        }
    }
}

/// 損失が有限と確認できたパラメータとそのエポック。
struct Snapshot<B: AutodiffBackend> {
    epoch: usize,
    model: Model<B>,
    total: f64,
}

/// `train`サブコマンドを実行します。
pub fn run(args: &TrainArgs) -> anyhow::Result<()> {
    let device = Default::default();

    let mut config = match &args.config {
        Some(path) => PinnConfig::load(path)
            .with_context(|| format!("設定 '{}' を読み込めません", path.display()))?,
        None => PinnConfig::new(),
    };
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("出力ディレクトリ '{}' を作成できません", args.out.display()))?;
    config
        .save(args.out.join("config.json"))
        .context("設定を保存できません")?;

    // --- データセットの準備 ---
    let sensors = TemperatureTable::read_csv(&args.sensors)?;
    let field = TemperatureTable::read_csv(&args.field)?;
    let setup = TrainingSetup::prepare(&config, &sensors, &field)?;

    // --- モデルとオプティマイザの初期化 ---
    MyBackend::seed(config.seed);
    let model = setup.model::<MyBackend>(&config, &device);
    let trainer = Trainer::<MyBackend>::new(&config, setup.composer(&config), setup.sets.clone(), &device);
    let mut store = FileCheckpointStore::new(args.out.join("checkpoints"), &config.model)?;

    tracing::info!("学習を開始します (段付き軸の非定常熱伝導) - バックエンド: NdArray (CPU)");
    let report = trainer.fit(model, &mut store, &StopHandle::new());

    // --- 結果の保存と描画 ---
    write_loss_history_csv(&report.history, args.out.join("loss_history.csv"))?;
    let graph = args.out.join("loss_graph.png");
    match plot_loss_history(&report.history, &graph) {
        Ok(()) => tracing::info!("=> 損失グラフを '{}' に保存しました。", graph.display()),
        Err(e) => tracing::warn!("グラフの描画に失敗しました: {e}"),
    }
    for warning in &report.warnings {
        tracing::warn!("{warning}");
    }

    let evaluated = report.best_model.as_ref().unwrap_or(&report.model).valid();
    let evaluation = Evaluator::new(&setup.classifier).evaluate(&evaluated, &field, &device)?;
    evaluation.write_summary_csv(args.out.join("evaluation_summary.csv"))?;
    evaluation.write_samples_csv(args.out.join("evaluation_samples.csv"), args.samples, config.seed)?;

    if let Some(failure) = report.failure {
        return Err(anyhow::Error::new(failure).context("学習が失敗しました"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::{FieldModelConfig, GeometryConfig, MetricGoal, SamplingConfig};
    use crate::data::{LabeledSample, Node};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn config() -> PinnConfig {
        PinnConfig::new()
            .with_model(FieldModelConfig::new().with_hidden_size(8).with_num_layers(3))
            .with_sampling(
                SamplingConfig::new()
                    .with_max_domain(Some(40))
                    .with_max_side(Some(20))
                    .with_max_end(Some(10))
                    .with_max_step(Some(10)),
            )
            .with_training(
                TrainingConfig::new()
                    .with_num_epochs(6)
                    .with_validation_interval(2)
                    .with_log_interval(2)
                    .with_patience(None),
            )
    }

    fn mesh_nodes() -> Vec<Node> {
        let mut nodes = Vec::new();
        let mut id = 0;
        for iz in 0..=10 {
            let z = iz as f64 * 100.0;
            let radius = if (150.0..=850.0).contains(&z) { 35.0 } else { 25.0 };
            for r in [0.0, radius] {
                id += 1;
                nodes.push(Node { node_id: id, instance: "PART-1-1".into(), x: r, y: 0.0, z });
            }
        }
        for r in [25.0, 30.0] {
            for z in [150.0, 850.0] {
                id += 1;
                nodes.push(Node { node_id: id, instance: "PART-1-1".into(), x: 0.0, y: r, z });
            }
        }
        nodes
    }

    fn sensors(label: f64) -> Vec<LabeledSample> {
        (0..6)
            .map(|i| LabeledSample {
                coords: [0.0, 0.0, 100.0 + 150.0 * i as f64, 10.0 * i as f64],
                temperature: label + i as f64,
            })
            .collect()
    }

    fn trainer(config: &PinnConfig, sensor_label: f64) -> (Trainer<TestBackend>, Model<TestBackend>) {
        let device = Default::default();
        let classifier = GeometryClassifier::new(&GeometryConfig::new()).unwrap();
        let mesh = classifier.classify_all(&mesh_nodes()).unwrap();
        let times: Vec<f64> = (0..6).map(|i| i as f64 * 10.0).collect();
        let samples = sensors(sensor_label);
        let sets = PointSetBuilder::new(&config.sampling, config.seed)
            .build(&mesh, &times, &samples, &InitialTemperature::Uniform(20.0), &samples[..3])
            .unwrap();
        let scaling = FieldScaling::new(
            InputBounds::for_shaft(35.0, 1000.0, 0.0, 50.0),
            &config.model,
        );
        let engine = ResidualEngine::new(&config.material, &config.boundaries, &config.geometry);
        let composer = LossComposer::new(engine, &config.loss, ResidualScales::resolve(config, 50.0));
        TestBackend::seed(7);
        let model = Model::new(&config.model, scaling, &device);
        (Trainer::new(config, composer, sets, &device), model)
    }

    /// 常に失敗するストア。
    struct FailingStore;

    impl CheckpointStore<TestBackend> for FailingStore {
        fn save(&mut self, _checkpoint: &Checkpoint<TestBackend>) -> PinnResult<()> {
            Err(PinnError::checkpoint_io("/nonexistent/best.mpk", "disk full"))
        }
    }

    #[test]
    fn history_grows_by_one_record_per_epoch() {
        let config = config();
        let (trainer, model) = trainer(&config, 30.0);
        assert_eq!(trainer.state(), TrainingState::Initialized);
        let mut store = MemoryCheckpointStore::default();
        let report = trainer.fit(model, &mut store, &StopHandle::new());

        assert_eq!(report.state, TrainingState::Completed);
        assert_eq!(report.stop_reason, StopReason::MaxEpochs);
        assert_eq!(report.history.len(), 6);
        let epochs: Vec<usize> = report.history.records().iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3, 4, 5, 6]);
        assert!(report.failure.is_none());
        assert_eq!(report.last.as_ref().map(|c| c.epoch), Some(6));
        assert!(report.best.is_some());
        assert!(store.saved().iter().all(|c| c.epoch % 2 == 0));
        assert_eq!(store.latest(CheckpointKind::Last).map(|c| c.epoch), Some(6));
    }

    #[test]
    fn non_finite_loss_fails_without_checkpoint() {
        let config = config();
        let (trainer, model) = trainer(&config, f64::NAN);
        let mut store = MemoryCheckpointStore::default();
        let report = trainer.fit(model, &mut store, &StopHandle::new());

        assert_eq!(report.state, TrainingState::Failed);
        assert_eq!(report.stop_reason, StopReason::Failed);
        assert_eq!(report.history.len(), 1);
        match &report.failure {
            Some(PinnError::NumericalDivergence { epoch, term }) => {
                assert_eq!(*epoch, 1);
                assert_eq!(term, "data");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert!(store.saved().is_empty());
        assert!(report.last.is_none());
    }

    fn assert_close(actual: f64, expected: f64) {
        let tolerance = 1e-5 * expected.abs().max(1.0);
        assert!((actual - expected).abs() <= tolerance, "{actual} != {expected}");
    }

    #[test]
    fn divergence_after_first_epoch_keeps_last_finite_parameters() {
        let mut config = config();
        config.training = config.training.clone().with_learning_rate(1.0e30);
        let (checker, _) = trainer(&config, 30.0);
        let (trainer, model) = trainer(&config, 30.0);
        let mut store = MemoryCheckpointStore::default();
        let report = trainer.fit(model, &mut store, &StopHandle::new());

        assert_eq!(report.state, TrainingState::Failed);
        let failed_epoch = match &report.failure {
            Some(PinnError::NumericalDivergence { epoch, .. }) => *epoch,
            other => panic!("unexpected failure: {other:?}"),
        };
        assert!(failed_epoch >= 2, "diverged at epoch {failed_epoch}");
        assert!(store.saved().iter().all(|c| c.epoch < failed_epoch));

        let last = store.latest(CheckpointKind::Last).unwrap();
        assert_eq!(last.epoch, failed_epoch - 1);
        assert_eq!(report.last.as_ref().map(|c| c.epoch), Some(failed_epoch - 1));
        let saved = checker.measure(&last.model, None, last.epoch);
        assert_eq!(saved.first_non_finite(), None);
        assert_close(saved.total, last.metric_value);

        let returned = checker.measure(&report.model, None, last.epoch);
        assert_eq!(returned.first_non_finite(), None);
        assert_close(returned.total, last.metric_value);
    }

    #[test]
    fn total_loss_checkpoints_describe_their_parameters() {
        let mut config = config();
        config.training = config
            .training
            .clone()
            .with_learning_rate(5.0e-2)
            .with_num_epochs(3)
            .with_validation_interval(1)
            .with_checkpoint_metric(CheckpointMetric::TotalLoss)
            .with_checkpoint_goal(MetricGoal::Minimize);
        let (checker, _) = trainer(&config, 30.0);
        let (trainer, model) = trainer(&config, 30.0);
        let mut store = MemoryCheckpointStore::default();
        let report = trainer.fit(model, &mut store, &StopHandle::new());

        assert_eq!(report.state, TrainingState::Completed);
        assert!(store.latest(CheckpointKind::Best).is_some());
        assert_eq!(store.latest(CheckpointKind::Last).map(|c| c.epoch), Some(3));
        for checkpoint in store.saved() {
            let recomputed = checker.measure(&checkpoint.model, None, checkpoint.epoch);
            assert_close(recomputed.total, checkpoint.metric_value);
        }
    }

    #[test]
    fn checkpoint_io_failure_does_not_abort_training() {
        let config = config();
        let (trainer, model) = trainer(&config, 30.0);
        let report = trainer.fit(model, &mut FailingStore, &StopHandle::new());

        assert_eq!(report.state, TrainingState::Completed);
        assert_eq!(report.history.len(), 6);
        // ベスト (epoch 2) と最終の少なくとも2回
        assert!(report.warnings.len() >= 2);
        assert!(report.warnings.iter().all(|w| w.contains("disk full")));
        assert!(report.best.is_some());
    }

    #[test]
    fn early_stopping_after_patience_passes() {
        // 学習率0ではパラメータが変わらず、検証指標も改善しない
        let mut config = config();
        config.training = config
            .training
            .clone()
            .with_learning_rate(0.0)
            .with_num_epochs(50)
            .with_validation_interval(1)
            .with_patience(Some(2));
        let (trainer, model) = trainer(&config, 30.0);
        let mut store = MemoryCheckpointStore::default();
        let report = trainer.fit(model, &mut store, &StopHandle::new());

        assert_eq!(report.state, TrainingState::Completed);
        assert_eq!(report.stop_reason, StopReason::EarlyStopped);
        assert_eq!(report.history.len(), 3);
        assert_eq!(report.best.as_ref().map(|c| c.epoch), Some(1));
        assert_eq!(report.last.as_ref().map(|c| c.epoch), Some(3));
    }

    #[test]
    fn stop_request_is_honoured_at_epoch_boundary() {
        let config = config();
        let (trainer, model) = trainer(&config, 30.0);
        let stop = StopHandle::new();
        stop.clone().request_stop();
        let mut store = MemoryCheckpointStore::default();
        let report = trainer.fit(model, &mut store, &stop);

        assert_eq!(report.state, TrainingState::Completed);
        assert_eq!(report.stop_reason, StopReason::StopRequested);
        assert!(report.history.is_empty());
        assert!(store.saved().is_empty());
    }

    #[test]
    fn minibatch_training_with_total_loss_metric() {
        let mut config = config();
        config.training = config
            .training
            .clone()
            .with_batch(BatchStrategy::Minibatch { size: 4 })
            .with_checkpoint_metric(CheckpointMetric::TotalLoss)
            .with_checkpoint_goal(MetricGoal::Minimize)
            .with_grad_clip_norm(Some(1.0));
        let (trainer, model) = trainer(&config, 30.0);
        let mut store = MemoryCheckpointStore::default();
        let report = trainer.fit(model, &mut store, &StopHandle::new());

        assert_eq!(report.state, TrainingState::Completed);
        assert_eq!(report.history.len(), 6);
        assert_eq!(report.best.as_ref().map(|c| c.metric.as_str()), Some("total_loss"));
    }

    #[test]
    fn adam_reduces_total_loss() {
        let mut config = config();
        config.training = config
            .training
            .clone()
            .with_learning_rate(5.0e-3)
            .with_num_epochs(40)
            .with_validation_interval(10);
        let (trainer, model) = trainer(&config, 30.0);
        let mut store = MemoryCheckpointStore::default();
        let report = trainer.fit(model, &mut store, &StopHandle::new());

        let records = report.history.records();
        let first = records.first().unwrap().total;
        let last = records.last().unwrap().total;
        assert!(last < first, "{first} -> {last}");
    }
}
