//! 実験設定。
//!
//! 物理定数・損失の重み・ハイパーパラメータはすべて [`PinnConfig`] にまとめ、
//! 各コンポーネントの生成時に明示的に渡します。JSONファイルとして保存・読み込みできます。

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{PinnError, PinnResult};

/// 段付き軸の1セグメント（z軸方向に並ぶ円柱）。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShaftSegment {
    /// 軸方向の長さ（座標単位）
    pub length: f64,
    /// 外半径（座標単位）
    pub radius: f64,
}

/// 既定の3段軸: φ50 × 150, φ70 × 700, φ50 × 150（単位 mm）。
pub fn default_segments() -> Vec<ShaftSegment> {
    vec![
        ShaftSegment { length: 150.0, radius: 25.0 },
        ShaftSegment { length: 700.0, radius: 35.0 },
        ShaftSegment { length: 150.0, radius: 25.0 },
    ]
}

#[derive(Config, Debug)]
pub struct GeometryConfig {
    /// z = 0 から +z 方向へ順に並ぶセグメント
    #[config(default = "default_segments()")]
    pub segments: Vec<ShaftSegment>,
    /// 領域判定の許容幅（座標単位）
    #[config(default = 0.5)]
    pub epsilon: f64,
    /// 1座標単位あたりのメートル数（mm座標なら 1e-3）
    #[config(default = 1.0e-3)]
    pub length_unit: f64,
}

/// 材料定数（SI単位）。既定値は炭素鋼。
#[derive(Config, Debug)]
pub struct MaterialConfig {
    /// 密度 ρ (kg/m^3)
    #[config(default = 7850.0)]
    pub density: f64,
    /// 比熱 c_p (J/(kg·K))
    #[config(default = 434.0)]
    pub specific_heat: f64,
    /// 熱伝導率 k (W/(m·K))
    #[config(default = 60.5)]
    pub conductivity: f64,
}

impl MaterialConfig {
    /// 体積熱容量 ρc_p (J/(m^3·K))
    pub fn heat_capacity(&self) -> f64 {
        self.density * self.specific_heat
    }
}

/// 端面の境界条件: 熱流束 q_n と対流 h(T - T∞)。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FluxBoundary {
    /// 熱流束 q_n (W/m^2)
    pub heat_flux: f64,
    /// 熱伝達係数 h (W/(m^2·K))
    pub heat_transfer: f64,
    /// 雰囲気温度 T∞
    pub ambient: f64,
}

/// 段差面・側面の対流境界条件 h(T - T∞)。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvectiveBoundary {
    pub heat_transfer: f64,
    pub ambient: f64,
}

#[derive(Config, Debug)]
pub struct BoundaryConfig {
    #[config(default = "FluxBoundary { heat_flux: 5000.0, heat_transfer: 15.0, ambient: 20.0 }")]
    pub end: FluxBoundary,
    #[config(default = "ConvectiveBoundary { heat_transfer: 15.0, ambient: 20.0 }")]
    pub step: ConvectiveBoundary,
    #[config(default = "ConvectiveBoundary { heat_transfer: 15.0, ambient: 20.0 }")]
    pub side: ConvectiveBoundary,
}

#[derive(Config, Debug)]
pub struct FieldModelConfig {
    #[config(default = 32)]
    pub hidden_size: usize,
    /// 線形層の総数（入力層と出力層を含む）
    #[config(default = 4)]
    pub num_layers: usize,
    /// 出力変換の下限温度
    #[config(default = 0.0)]
    pub temperature_min: f64,
    /// 出力変換の上限温度
    #[config(default = 300.0)]
    pub temperature_max: f64,
}

/// 各損失項の重み。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub data: f64,
    pub initial_condition: f64,
    pub pde: f64,
    pub end: f64,
    pub step: f64,
    pub side: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            data: 1.0,
            initial_condition: 1.0,
            pde: 1.0,
            end: 1.0,
            step: 5.0,
            side: 1.0,
        }
    }
}

#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = "LossWeights::default()")]
    pub weights: LossWeights,
    /// PDE残差の代表スケール。`None` なら ρc_p·ΔT/継続時間 から決める。
    #[config(default = "None")]
    pub pde_scale: Option<f64>,
    /// 境界残差の代表スケール。`None` なら max(h·ΔT, |q_n|) から決める。
    #[config(default = "None")]
    pub boundary_scale: Option<f64>,
    /// 損失比に基づく重みの自動調整
    #[config(default = false)]
    pub adaptive: bool,
    #[config(default = 0.1)]
    pub adaptive_alpha: f64,
    #[config(default = 100)]
    pub adaptive_interval: usize,
}

/// 点集合の間引き方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMode {
    /// シード付きの非復元一様抽出
    Random,
    /// 等間隔抽出
    Stride,
}

#[derive(Config, Debug)]
pub struct SamplingConfig {
    #[config(default = "SamplingMode::Random")]
    pub mode: SamplingMode,
    #[config(default = "None")]
    pub max_sensors: Option<usize>,
    #[config(default = "Some(2000)")]
    pub max_initial_condition: Option<usize>,
    #[config(default = "Some(5000)")]
    pub max_domain: Option<usize>,
    #[config(default = "Some(1000)")]
    pub max_end: Option<usize>,
    #[config(default = "Some(1000)")]
    pub max_step: Option<usize>,
    #[config(default = "Some(2000)")]
    pub max_side: Option<usize>,
    #[config(default = "Some(2000)")]
    pub max_validation: Option<usize>,
    /// 全場テーブルがないとき検証用に取り分けるセンサ観測の割合
    #[config(default = 0.2)]
    pub validation_fraction: f64,
}

/// 各エポックで点集合から取り出すバッチの構成。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStrategy {
    Full,
    Minibatch { size: usize },
}

/// ベストチェックポイントの判定に使う指標。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointMetric {
    ValidationRmse,
    ValidationMae,
    TotalLoss,
}

impl CheckpointMetric {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointMetric::ValidationRmse => "validation_rmse",
            CheckpointMetric::ValidationMae => "validation_mae",
            CheckpointMetric::TotalLoss => "total_loss",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricGoal {
    Minimize,
    Maximize,
}

impl MetricGoal {
    /// `candidate` が `best` より良いかどうか。
    pub fn improves(&self, candidate: f64, best: f64) -> bool {
        match self {
            MetricGoal::Minimize => candidate < best,
            MetricGoal::Maximize => candidate > best,
        }
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 8000)]
    pub num_epochs: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// 勾配ノルムのクリッピング閾値
    #[config(default = "None")]
    pub grad_clip_norm: Option<f32>,
    #[config(default = "BatchStrategy::Full")]
    pub batch: BatchStrategy,
    #[config(default = 200)]
    pub log_interval: usize,
    #[config(default = 200)]
    pub validation_interval: usize,
    /// 改善のない検証パスがこの回数続いたら早期終了
    #[config(default = "Some(10)")]
    pub patience: Option<usize>,
    #[config(default = "CheckpointMetric::ValidationRmse")]
    pub checkpoint_metric: CheckpointMetric,
    #[config(default = "MetricGoal::Minimize")]
    pub checkpoint_goal: MetricGoal,
}

/// 1回の学習実行に必要な設定一式。
#[derive(Config, Debug)]
pub struct PinnConfig {
    #[config(default = "GeometryConfig::new()")]
    pub geometry: GeometryConfig,
    #[config(default = "MaterialConfig::new()")]
    pub material: MaterialConfig,
    #[config(default = "BoundaryConfig::new()")]
    pub boundaries: BoundaryConfig,
    /// 全場テーブルに初期フレームがないノードへ与える初期温度
    #[config(default = 20.0)]
    pub initial_temperature: f64,
    #[config(default = "FieldModelConfig::new()")]
    pub model: FieldModelConfig,
    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
    #[config(default = "SamplingConfig::new()")]
    pub sampling: SamplingConfig,
    #[config(default = "TrainingConfig::new()")]
    pub training: TrainingConfig,
    #[config(default = 42)]
    pub seed: u64,
}

impl PinnConfig {
    /// 物理的・数値的に成立しない設定を学習前に弾きます。
    pub fn validate(&self) -> PinnResult<()> {
        let geometry = &self.geometry;
        if geometry.segments.is_empty() {
            return Err(PinnError::Config("shaft needs at least one segment".into()));
        }
        for (i, segment) in geometry.segments.iter().enumerate() {
            if !(segment.length.is_finite() && segment.length > 0.0)
                || !(segment.radius.is_finite() && segment.radius > 0.0)
            {
                return Err(PinnError::Config(format!(
                    "segment {i} must have positive length and radius, got {:?}",
                    segment
                )));
            }
        }
        if !(geometry.epsilon.is_finite() && geometry.epsilon > 0.0) {
            return Err(PinnError::Config("geometry.epsilon must be positive".into()));
        }
        if !(geometry.length_unit.is_finite() && geometry.length_unit > 0.0) {
            return Err(PinnError::Config("geometry.length_unit must be positive".into()));
        }
        let material = &self.material;
        if [material.density, material.specific_heat, material.conductivity]
            .iter()
            .any(|v| !(v.is_finite() && *v > 0.0))
        {
            return Err(PinnError::Config("material constants must be positive".into()));
        }
        if !(self.model.temperature_max > self.model.temperature_min) {
            return Err(PinnError::Config(
                "model.temperature_max must exceed model.temperature_min".into(),
            ));
        }
        if self.model.num_layers < 2 || self.model.hidden_size == 0 {
            return Err(PinnError::Config(
                "model needs at least two layers and a non-zero hidden size".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.sampling.validation_fraction) {
            return Err(PinnError::Config(
                "sampling.validation_fraction must be in [0, 1)".into(),
            ));
        }
        if let BatchStrategy::Minibatch { size: 0 } = self.training.batch {
            return Err(PinnError::Config("minibatch size must be non-zero".into()));
        }
        if self.training.validation_interval == 0 || self.training.log_interval == 0 {
            return Err(PinnError::Config("intervals must be non-zero".into()));
        }
        if self.loss.adaptive && self.loss.adaptive_interval == 0 {
            return Err(PinnError::Config("loss.adaptive_interval must be non-zero".into()));
        }
        Ok(())
    }
}
