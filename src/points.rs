//! 損失項ごとの時空間点集合（コロケーション点）の構築。

use std::fmt;

use burn::prelude::Backend;
use burn::tensor::Tensor;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::{SamplingConfig, SamplingMode};
use crate::data::LabeledSample;
use crate::error::{PinnError, PinnResult};
use crate::geometry::{BoundaryRegion, ClassifiedMesh, ClassifiedNode, Region};

/// 点集合の名前。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointSetKind {
    Sensors,
    InitialCondition,
    Domain,
    End,
    Step,
    Side,
    Validation,
}

impl PointSetKind {
    pub fn name(&self) -> &'static str {
        match self {
            PointSetKind::Sensors => "sensors",
            PointSetKind::InitialCondition => "initial_condition",
            PointSetKind::Domain => "domain",
            PointSetKind::End => "end",
            PointSetKind::Step => "step",
            PointSetKind::Side => "side",
            PointSetKind::Validation => "validation",
        }
    }

    /// 集合ごとに独立した乱数系列を使うため、シードから系列を派生させます。
    fn rng(&self, seed: u64) -> StdRng {
        let salt = *self as u64 + 1;
        StdRng::seed_from_u64(seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

impl fmt::Display for PointSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<BoundaryRegion> for PointSetKind {
    fn from(region: BoundaryRegion) -> Self {
        match region {
            BoundaryRegion::End => PointSetKind::End,
            BoundaryRegion::Step => PointSetKind::Step,
            BoundaryRegion::Side => PointSetKind::Side,
        }
    }
}

/// 時空間の1点。境界点は外向き法線、教師付きの点は温度ラベルを持ちます。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollocationPoint {
    /// (x, y, z, t)
    pub coords: [f64; 4],
    pub normal: Option<[f64; 3]>,
    pub label: Option<f64>,
}

/// 1つの損失項が使う、順序付きの点集合。
#[derive(Debug, Clone, PartialEq)]
pub struct PointSet {
    kind: PointSetKind,
    points: Vec<CollocationPoint>,
}

impl PointSet {
    pub fn new(kind: PointSetKind, points: Vec<CollocationPoint>) -> Self {
        Self { kind, points }
    }

    pub fn kind(&self) -> PointSetKind {
        self.kind
    }

    pub fn points(&self) -> &[CollocationPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 全点をテンソルにまとめます。
    pub fn to_batch<B: Backend>(&self, device: &B::Device) -> PointBatch<B> {
        PointBatch::from_points(self.points.iter(), device)
    }

    /// 非復元抽出で `size` 点のミニバッチを作ります。
    pub fn minibatch<B: Backend>(
        &self,
        size: usize,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> PointBatch<B> {
        let picked = subsample_indices(self.len(), Some(size), SamplingMode::Random, rng);
        PointBatch::from_points(picked.iter().map(|&i| &self.points[i]), device)
    }
}

/// 点集合をテンソル化したもの。
#[derive(Debug, Clone)]
pub struct PointBatch<B: Backend> {
    /// [N, 4]: (x, y, z, t)
    pub coords: Tensor<B, 2>,
    /// [N, 3]: 外向き単位法線（境界点のみ）
    pub normals: Option<Tensor<B, 2>>,
    /// [N, 1]: 温度ラベル（教師付きの点のみ）
    pub labels: Option<Tensor<B, 2>>,
}

impl<B: Backend> PointBatch<B> {
    pub fn from_points<'a>(
        points: impl Iterator<Item = &'a CollocationPoint>,
        device: &B::Device,
    ) -> Self {
        let points: Vec<&CollocationPoint> = points.collect();
        let n = points.len();

        let coords_vec: Vec<f32> = points
            .iter()
            .flat_map(|p| p.coords.map(|c| c as f32))
            .collect();
        let coords = Tensor::<B, 1>::from_floats(coords_vec.as_slice(), device).reshape([n, 4]);

        let normals = points
            .iter()
            .map(|p| p.normal)
            .collect::<Option<Vec<_>>>()
            .filter(|_| n > 0)
            .map(|normals| {
                let flat: Vec<f32> = normals.iter().flat_map(|v| v.map(|c| c as f32)).collect();
                Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([n, 3])
            });

        let labels = points
            .iter()
            .map(|p| p.label)
            .collect::<Option<Vec<_>>>()
            .filter(|_| n > 0)
            .map(|labels| {
                let flat: Vec<f32> = labels.iter().map(|&v| v as f32).collect();
                Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([n, 1])
            });

        Self {
            coords,
            normals,
            labels,
        }
    }

    pub fn len(&self) -> usize {
        self.coords.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 学習と検証に使う点集合一式。
#[derive(Debug, Clone)]
pub struct PointSets {
    pub sensors: PointSet,
    pub initial_condition: PointSet,
    pub domain: PointSet,
    pub end: PointSet,
    pub step: PointSet,
    pub side: PointSet,
    pub validation: PointSet,
}

impl PointSets {
    pub fn boundary(&self, region: BoundaryRegion) -> &PointSet {
        match region {
            BoundaryRegion::End => &self.end,
            BoundaryRegion::Step => &self.step,
            BoundaryRegion::Side => &self.side,
        }
    }
}

/// 初期条件のラベルの与え方。
#[derive(Debug, Clone, PartialEq)]
pub enum InitialTemperature {
    /// 全節点で一様
    Uniform(f64),
    /// メッシュの節点順に並んだ値。値のない節点は `fallback` を使います。
    PerNode { values: Vec<Option<f64>>, fallback: f64 },
}

impl InitialTemperature {
    fn at(&self, node: usize) -> f64 {
        match self {
            InitialTemperature::Uniform(value) => *value,
            InitialTemperature::PerNode { values, fallback } => {
                values.get(node).copied().flatten().unwrap_or(*fallback)
            }
        }
    }
}

/// 分類済みメッシュ・時刻・観測から点集合を作ります。
pub struct PointSetBuilder<'a> {
    sampling: &'a SamplingConfig,
    seed: u64,
}

impl<'a> PointSetBuilder<'a> {
    pub fn new(sampling: &'a SamplingConfig, seed: u64) -> Self {
        Self { sampling, seed }
    }

    /// `validation` が空の場合は、センサ観測の一部を検証用に取り分けます。
    pub fn build(
        &self,
        mesh: &ClassifiedMesh,
        times: &[f64],
        sensors: &[LabeledSample],
        initial: &InitialTemperature,
        validation: &[LabeledSample],
    ) -> PinnResult<PointSets> {
        if sensors.is_empty() {
            return Err(PinnError::EmptyPointSet(PointSetKind::Sensors));
        }
        let Some(&t0) = times.first() else {
            return Err(PinnError::EmptyPointSet(PointSetKind::InitialCondition));
        };

        let (sensor_pool, validation_pool) = if validation.is_empty() {
            self.hold_out(sensors)
        } else {
            (sensors.to_vec(), validation.to_vec())
        };

        let sensors = self.labeled(PointSetKind::Sensors, &sensor_pool, self.sampling.max_sensors);
        let validation = self.labeled(
            PointSetKind::Validation,
            &validation_pool,
            self.sampling.max_validation,
        );

        let all_nodes: Vec<(usize, &ClassifiedNode)> = mesh.nodes().iter().enumerate().collect();
        let initial_condition = self.space_time(
            PointSetKind::InitialCondition,
            &all_nodes,
            &[t0],
            self.sampling.max_initial_condition,
            |node_index| Some(initial.at(node_index)),
        );

        let region_nodes = |region: Region| -> Vec<(usize, &ClassifiedNode)> {
            all_nodes
                .iter()
                .copied()
                .filter(|(_, n)| n.region == region)
                .collect()
        };
        let domain = self.space_time(
            PointSetKind::Domain,
            &region_nodes(Region::Domain),
            times,
            self.sampling.max_domain,
            |_| None,
        );
        let end = self.space_time(
            PointSetKind::End,
            &region_nodes(Region::End),
            times,
            self.sampling.max_end,
            |_| None,
        );
        let step = self.space_time(
            PointSetKind::Step,
            &region_nodes(Region::Step),
            times,
            self.sampling.max_step,
            |_| None,
        );
        let side = self.space_time(
            PointSetKind::Side,
            &region_nodes(Region::Side),
            times,
            self.sampling.max_side,
            |_| None,
        );

        let sets = PointSets {
            sensors,
            initial_condition,
            domain,
            end,
            step,
            side,
            validation,
        };

        let mut required = vec![
            &sets.sensors,
            &sets.initial_condition,
            &sets.domain,
            &sets.end,
            &sets.side,
        ];
        if mesh.has_steps() {
            required.push(&sets.step);
        }
        if let Some(empty) = required.iter().find(|set| set.is_empty()) {
            return Err(PinnError::EmptyPointSet(empty.kind()));
        }
        if sets.validation.is_empty() {
            tracing::warn!("検証用の点がありません。ベスト判定には学習損失を使います。");
        }

        tracing::info!(
            "点集合を構築しました: sensors={} ic={} domain={} end={} step={} side={} validation={}",
            sets.sensors.len(),
            sets.initial_condition.len(),
            sets.domain.len(),
            sets.end.len(),
            sets.step.len(),
            sets.side.len(),
            sets.validation.len()
        );
        Ok(sets)
    }

    /// センサ観測の `validation_fraction` を検証用に分けます。学習用に最低1点は残します。
    fn hold_out(&self, sensors: &[LabeledSample]) -> (Vec<LabeledSample>, Vec<LabeledSample>) {
        let n = sensors.len();
        let count = ((n as f64 * self.sampling.validation_fraction).floor() as usize).min(n - 1);
        let mut rng = PointSetKind::Validation.rng(self.seed);
        let held = subsample_indices(n, Some(count), SamplingMode::Random, &mut rng);
        let mut is_held = vec![false; n];
        for i in held {
            is_held[i] = true;
        }
        let (validation, training): (Vec<_>, Vec<_>) =
            sensors.iter().zip(is_held).partition(|(_, held)| *held);
        (
            training.into_iter().map(|(s, _)| *s).collect(),
            validation.into_iter().map(|(s, _)| *s).collect(),
        )
    }

    fn labeled(&self, kind: PointSetKind, pool: &[LabeledSample], cap: Option<usize>) -> PointSet {
        let mut rng = kind.rng(self.seed);
        let picked = subsample_indices(pool.len(), cap, self.sampling.mode, &mut rng);
        let points = picked
            .into_iter()
            .map(|i| CollocationPoint {
                coords: pool[i].coords,
                normal: None,
                label: Some(pool[i].temperature),
            })
            .collect();
        PointSet::new(kind, points)
    }

    /// 節点 × 時刻の直積から抽出します。直積そのものは展開しません。
    fn space_time(
        &self,
        kind: PointSetKind,
        nodes: &[(usize, &ClassifiedNode)],
        times: &[f64],
        cap: Option<usize>,
        label: impl Fn(usize) -> Option<f64>,
    ) -> PointSet {
        let mut rng = kind.rng(self.seed);
        let pool = nodes.len() * times.len();
        let picked = subsample_indices(pool, cap, self.sampling.mode, &mut rng);
        let points = picked
            .into_iter()
            .map(|i| {
                let (node_index, node) = nodes[i / times.len()];
                let t = times[i % times.len()];
                CollocationPoint {
                    coords: [node.node.x, node.node.y, node.node.z, t],
                    normal: node.normal,
                    label: label(node_index),
                }
            })
            .collect();
        PointSet::new(kind, points)
    }
}

/// `0..len` から最大 `cap` 個のインデックスを選び、昇順で返します。
pub(crate) fn subsample_indices(
    len: usize,
    cap: Option<usize>,
    mode: SamplingMode,
    rng: &mut StdRng,
) -> Vec<usize> {
    match cap {
        Some(cap) if cap < len => {
            let mut picked = match mode {
                SamplingMode::Random => rand::seq::index::sample(rng, len, cap).into_vec(),
                SamplingMode::Stride => (0..cap).map(|i| i * len / cap).collect(),
            };
            picked.sort_unstable();
            picked
        }
        _ => (0..len).collect(),
    }
}
