//! 多項損失の合成と損失履歴。

use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::Backend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{LossConfig, LossWeights, PinnConfig};
use crate::geometry::BoundaryRegion;
use crate::model::DifferentiableField;
use crate::pinn::ResidualEngine;
use crate::points::PointBatch;

/// 損失項の名前。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossTerm {
    Data,
    InitialCondition,
    Pde,
    End,
    Step,
    Side,
}

impl LossTerm {
    pub const ALL: [LossTerm; 6] = [
        LossTerm::Data,
        LossTerm::InitialCondition,
        LossTerm::Pde,
        LossTerm::End,
        LossTerm::Step,
        LossTerm::Side,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LossTerm::Data => "data",
            LossTerm::InitialCondition => "initial_condition",
            LossTerm::Pde => "pde",
            LossTerm::End => "end",
            LossTerm::Step => "step",
            LossTerm::Side => "side",
        }
    }
}

impl LossWeights {
    pub fn get(&self, term: LossTerm) -> f64 {
        match term {
            LossTerm::Data => self.data,
            LossTerm::InitialCondition => self.initial_condition,
            LossTerm::Pde => self.pde,
            LossTerm::End => self.end,
            LossTerm::Step => self.step,
            LossTerm::Side => self.side,
        }
    }

    fn get_mut(&mut self, term: LossTerm) -> &mut f64 {
        match term {
            LossTerm::Data => &mut self.data,
            LossTerm::InitialCondition => &mut self.initial_condition,
            LossTerm::Pde => &mut self.pde,
            LossTerm::End => &mut self.end,
            LossTerm::Step => &mut self.step,
            LossTerm::Side => &mut self.side,
        }
    }
}

/// 残差を無次元化する代表スケール。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualScales {
    pub pde: f64,
    pub boundary: f64,
}

impl ResidualScales {
    /// 設定値があればそれを、なければ物理定数と温度範囲・継続時間から決めます。
    pub fn resolve(config: &PinnConfig, duration: f64) -> Self {
        let span = config.model.temperature_max - config.model.temperature_min;
        let b = &config.boundaries;
        let auto_pde = if duration > 0.0 {
            config.material.heat_capacity() * span / duration
        } else {
            config.material.heat_capacity() * span
        };
        let auto_boundary = [
            b.end.heat_transfer * span,
            b.end.heat_flux.abs(),
            b.step.heat_transfer * span,
            b.side.heat_transfer * span,
        ]
        .into_iter()
        .fold(0.0, f64::max);
        let positive = |value: f64| if value.is_finite() && value > 0.0 { value } else { 1.0 };
        Self {
            pde: positive(config.loss.pde_scale.unwrap_or(auto_pde)),
            boundary: positive(config.loss.boundary_scale.unwrap_or(auto_boundary)),
        }
    }
}

/// 1ステップ分の学習バッチ。
#[derive(Debug, Clone)]
pub struct TrainingBatches<B: Backend> {
    pub sensors: PointBatch<B>,
    pub initial_condition: PointBatch<B>,
    pub domain: PointBatch<B>,
    pub end: PointBatch<B>,
    pub step: PointBatch<B>,
    pub side: PointBatch<B>,
}

impl<B: Backend> TrainingBatches<B> {
    pub fn boundary(&self, region: BoundaryRegion) -> &PointBatch<B> {
        match region {
            BoundaryRegion::End => &self.end,
            BoundaryRegion::Step => &self.step,
            BoundaryRegion::Side => &self.side,
        }
    }
}

/// 各損失項（スカラーテンソル）。
#[derive(Debug, Clone)]
pub struct ComponentLosses<B: Backend> {
    pub data: Tensor<B, 1>,
    pub initial_condition: Tensor<B, 1>,
    pub pde: Tensor<B, 1>,
    pub end: Tensor<B, 1>,
    pub step: Tensor<B, 1>,
    pub side: Tensor<B, 1>,
}

impl<B: Backend> ComponentLosses<B> {
    pub fn get(&self, term: LossTerm) -> &Tensor<B, 1> {
        match term {
            LossTerm::Data => &self.data,
            LossTerm::InitialCondition => &self.initial_condition,
            LossTerm::Pde => &self.pde,
            LossTerm::End => &self.end,
            LossTerm::Step => &self.step,
            LossTerm::Side => &self.side,
        }
    }
}

/// 1エポック分の損失値。
///
/// `data` と `initial_condition` は温度の MSE [K²] です。
/// `pde` は `ResidualScales::pde`、`end`・`step`・`side` は `ResidualScales::boundary` で
/// 割った無次元残差の MSE です。`total` は重み付き和です。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub epoch: usize,
    pub data: f64,
    pub initial_condition: f64,
    pub pde: f64,
    pub end: f64,
    pub step: f64,
    pub side: f64,
    pub total: f64,
}

impl LossRecord {
    pub fn get(&self, term: LossTerm) -> f64 {
        match term {
            LossTerm::Data => self.data,
            LossTerm::InitialCondition => self.initial_condition,
            LossTerm::Pde => self.pde,
            LossTerm::End => self.end,
            LossTerm::Step => self.step,
            LossTerm::Side => self.side,
        }
    }

    /// 最初に見つかった非有限の項の名前。
    pub fn first_non_finite(&self) -> Option<&'static str> {
        LossTerm::ALL
            .iter()
            .find(|term| !self.get(**term).is_finite())
            .map(|term| term.name())
            .or((!self.total.is_finite()).then_some("total"))
    }
}

/// 追記のみの損失履歴。
#[derive(Debug, Clone, Default)]
pub struct LossHistory {
    records: Vec<LossRecord>,
}

impl LossHistory {
    pub fn push(&mut self, record: LossRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[LossRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&LossRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// データ損失・初期条件損失・物理損失を重み付きで合成します。
#[derive(Debug, Clone)]
pub struct LossComposer {
    engine: ResidualEngine,
    base_weights: LossWeights,
    weights: LossWeights,
    scales: ResidualScales,
    adaptive_alpha: f64,
}

impl LossComposer {
    pub fn new(engine: ResidualEngine, config: &LossConfig, scales: ResidualScales) -> Self {
        Self {
            engine,
            base_weights: config.weights,
            weights: config.weights,
            scales,
            adaptive_alpha: config.adaptive_alpha,
        }
    }

    pub fn weights(&self) -> LossWeights {
        self.weights
    }

    pub fn component_losses<B: Backend, F: DifferentiableField<B>>(
        &self,
        field: &F,
        batches: &TrainingBatches<B>,
    ) -> ComponentLosses<B> {
        let data = supervised_loss(field, &batches.sensors);
        let initial_condition = supervised_loss(field, &batches.initial_condition);

        let pde = if batches.domain.is_empty() {
            zero_loss(&batches.domain)
        } else {
            let residual = self
                .engine
                .pde_residual(field, batches.domain.coords.clone())
                .div_scalar(self.scales.pde as f32);
            mean_square(residual)
        };

        let boundary = |region: BoundaryRegion| {
            let batch = batches.boundary(region);
            match &batch.normals {
                Some(normals) if !batch.is_empty() => {
                    let residual = self
                        .engine
                        .boundary_residual(field, region, batch.coords.clone(), normals.clone())
                        .div_scalar(self.scales.boundary as f32);
                    mean_square(residual)
                }
                _ => zero_loss(batch),
            }
        };

        ComponentLosses {
            data,
            initial_condition,
            pde,
            end: boundary(BoundaryRegion::End),
            step: boundary(BoundaryRegion::Step),
            side: boundary(BoundaryRegion::Side),
        }
    }

    /// 重み付き和 Σ w_i L_i。
    pub fn total<B: Backend>(&self, losses: &ComponentLosses<B>) -> Tensor<B, 1> {
        LossTerm::ALL
            .iter()
            .map(|term| losses.get(*term).clone().mul_scalar(self.weights.get(*term) as f32))
            .reduce(|acc, loss| acc + loss)
            .unwrap_or_else(|| losses.data.zeros_like())
    }

    pub fn record<B: Backend>(
        &self,
        epoch: usize,
        losses: &ComponentLosses<B>,
        total: &Tensor<B, 1>,
    ) -> LossRecord {
        let value = |tensor: &Tensor<B, 1>| tensor.clone().into_scalar().elem::<f64>();
        LossRecord {
            epoch,
            data: value(&losses.data),
            initial_condition: value(&losses.initial_condition),
            pde: value(&losses.pde),
            end: value(&losses.end),
            step: value(&losses.step),
            side: value(&losses.side),
            total: value(total),
        }
    }

    /// 物理項の重みを w_i ← (1-α) w_i + α·base_i·L_data/L_i に近づけます。
    ///
    /// 目標値は base_i の 1e-3 倍から 1e3 倍に制限します。
    pub fn rebalance(&mut self, record: &LossRecord) {
        let reference = record.data.max(f64::EPSILON);
        for term in LossTerm::ALL.into_iter().filter(|t| *t != LossTerm::Data) {
            let value = record.get(term);
            if !value.is_finite() || value <= 0.0 {
                continue;
            }
            let base = self.base_weights.get(term);
            let target = (base * reference / value).clamp(base * 1e-3, base * 1e3);
            let weight = self.weights.get_mut(term);
            *weight = (1.0 - self.adaptive_alpha) * *weight + self.adaptive_alpha * target;
        }
        tracing::debug!("損失の重みを更新しました: {:?}", self.weights);
    }
}

fn supervised_loss<B: Backend, F: DifferentiableField<B>>(
    field: &F,
    batch: &PointBatch<B>,
) -> Tensor<B, 1> {
    match &batch.labels {
        Some(labels) if !batch.is_empty() => {
            let predicted = field.temperature(batch.coords.clone());
            MseLoss::new().forward(predicted, labels.clone(), Reduction::Mean)
        }
        _ => zero_loss(batch),
    }
}

fn mean_square<B: Backend>(residual: Tensor<B, 2>) -> Tensor<B, 1> {
    MseLoss::new().forward(residual.clone(), residual.zeros_like(), Reduction::Mean)
}

fn zero_loss<B: Backend>(batch: &PointBatch<B>) -> Tensor<B, 1> {
    Tensor::zeros([1], &batch.coords.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoundaryConfig, ConvectiveBoundary, FluxBoundary, GeometryConfig, MaterialConfig};
    use crate::pinn::tests::QuadraticField;
    use crate::points::CollocationPoint;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn point(coords: [f64; 4], normal: Option<[f64; 3]>, label: Option<f64>) -> CollocationPoint {
        CollocationPoint {
            coords,
            normal,
            label,
        }
    }

    fn batch(points: &[CollocationPoint]) -> PointBatch<TestBackend> {
        PointBatch::from_points(points.iter(), &Default::default())
    }

    fn batches() -> TrainingBatches<TestBackend> {
        TrainingBatches {
            sensors: batch(&[
                point([0.0, 0.0, 500.0, 10.0], None, Some(40.0)),
                point([10.0, 0.0, 300.0, 20.0], None, Some(35.0)),
            ]),
            initial_condition: batch(&[point([0.0, 0.0, 100.0, 0.0], None, Some(20.0))]),
            domain: batch(&[
                point([0.0, 0.0, 400.0, 5.0], None, None),
                point([5.0, 5.0, 600.0, 50.0], None, None),
            ]),
            end: batch(&[
                point([0.0, 0.0, 0.0, 5.0], Some([0.0, 0.0, -1.0]), None),
                point([0.0, 0.0, 1000.0, 5.0], Some([0.0, 0.0, 1.0]), None),
            ]),
            step: batch(&[point([30.0, 0.0, 150.0, 5.0], Some([0.0, 0.0, -1.0]), None)]),
            side: batch(&[point([0.0, 35.0, 500.0, 5.0], Some([0.0, 1.0, 0.0]), None)]),
        }
    }

    fn composer(boundaries: BoundaryConfig, weights: LossWeights) -> LossComposer {
        let engine = ResidualEngine::new(&MaterialConfig::new(), &boundaries, &GeometryConfig::new());
        let config = LossConfig::new().with_weights(weights);
        LossComposer::new(engine, &config, ResidualScales { pde: 1.0e4, boundary: 1.0e3 })
    }

    fn scalar(tensor: &Tensor<TestBackend, 1>) -> f64 {
        tensor.clone().into_scalar().elem::<f64>()
    }

    #[test]
    fn total_is_weighted_sum_of_components() {
        let weights = LossWeights {
            data: 2.0,
            initial_condition: 0.5,
            pde: 3.0,
            end: 1.5,
            step: 7.0,
            side: 0.25,
        };
        let composer = composer(BoundaryConfig::new(), weights);
        let field = QuadraticField {
            offset: 30.0,
            slope: [0.1, 0.0, 0.02, 0.01],
            curvature: 1.0e-5,
        };
        let losses = composer.component_losses(&field, &batches());
        let total = scalar(&composer.total(&losses));
        let expected: f64 = LossTerm::ALL
            .iter()
            .map(|t| weights.get(*t) * scalar(losses.get(*t)))
            .sum();
        assert!((total - expected).abs() <= 1e-4 * expected.abs().max(1.0));
    }

    #[test]
    fn changing_one_weight_changes_total_proportionally() {
        let field = QuadraticField {
            offset: 30.0,
            slope: [0.1, 0.0, 0.02, 0.01],
            curvature: 1.0e-5,
        };
        let base = LossWeights::default();
        let heavier = LossWeights { step: base.step + 4.0, ..base };
        let a = composer(BoundaryConfig::new(), base);
        let b = composer(BoundaryConfig::new(), heavier);
        let losses = a.component_losses(&field, &batches());
        let delta = scalar(&b.total(&losses)) - scalar(&a.total(&losses));
        let step = scalar(&losses.step);
        assert!(step > 0.0);
        assert!((delta - 4.0 * step).abs() <= 1e-3 * (4.0 * step).max(1e-6));
    }

    #[test]
    fn constant_field_has_zero_pde_loss_and_nonzero_boundary_losses() {
        let composer = composer(BoundaryConfig::new(), LossWeights::default());
        let losses = composer.component_losses(&QuadraticField::constant(80.0), &batches());
        assert_eq!(scalar(&losses.pde), 0.0);
        assert!(scalar(&losses.end) > 0.0);
        assert!(scalar(&losses.step) > 0.0);
        assert!(scalar(&losses.side) > 0.0);
    }

    #[test]
    fn constant_ambient_field_without_flux_satisfies_boundaries() {
        let boundaries = BoundaryConfig::new()
            .with_end(FluxBoundary { heat_flux: 0.0, heat_transfer: 15.0, ambient: 20.0 })
            .with_step(ConvectiveBoundary { heat_transfer: 15.0, ambient: 20.0 })
            .with_side(ConvectiveBoundary { heat_transfer: 15.0, ambient: 20.0 });
        let composer = composer(boundaries, LossWeights::default());
        let losses = composer.component_losses(&QuadraticField::constant(20.0), &batches());
        for term in [LossTerm::Pde, LossTerm::End, LossTerm::Step, LossTerm::Side] {
            assert!(scalar(losses.get(term)).abs() < 1e-10, "{}", term.name());
        }
    }

    #[test]
    fn empty_step_batch_contributes_nothing() {
        let composer = composer(BoundaryConfig::new(), LossWeights::default());
        let mut batches = batches();
        batches.step = batch(&[]);
        let losses = composer.component_losses(&QuadraticField::constant(80.0), &batches);
        assert_eq!(scalar(&losses.step), 0.0);
    }

    #[test]
    fn data_loss_is_mse_against_labels() {
        let composer = composer(BoundaryConfig::new(), LossWeights::default());
        let losses = composer.component_losses(&QuadraticField::constant(30.0), &batches());
        // (30-40)² と (30-35)² の平均
        assert!((scalar(&losses.data) - 62.5).abs() < 1e-4);
        assert!((scalar(&losses.initial_condition) - 100.0).abs() < 1e-4);
    }

    #[test]
    fn rebalance_moves_physics_weights_toward_loss_ratio() {
        let mut composer = composer(BoundaryConfig::new(), LossWeights::default());
        let record = LossRecord {
            epoch: 1,
            data: 1.0,
            initial_condition: 1.0,
            pde: 100.0,
            end: 0.01,
            step: 1.0,
            side: f64::NAN,
            total: 0.0,
        };
        composer.rebalance(&record);
        let w = composer.weights();
        assert_eq!(w.data, 1.0);
        assert!(w.pde < 1.0);
        assert!(w.end > 1.0);
        assert!((w.step - 5.0).abs() < 1e-12);
        assert_eq!(w.side, 1.0);
    }

    #[test]
    fn non_finite_term_is_reported() {
        let record = LossRecord {
            epoch: 3,
            data: 1.0,
            initial_condition: 1.0,
            pde: f64::INFINITY,
            end: 1.0,
            step: f64::NAN,
            side: 1.0,
            total: f64::NAN,
        };
        assert_eq!(record.first_non_finite(), Some("pde"));
        let fine = LossRecord { pde: 1.0, step: 1.0, total: 6.0, ..record };
        assert_eq!(fine.first_non_finite(), None);
    }
}
