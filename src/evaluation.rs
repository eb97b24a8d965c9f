//! 全場テーブルに対する推定精度の評価と、可視化用CSVの書き出し。

use std::path::Path;

use anyhow::Context;
use burn::backend::NdArray;
use burn::config::Config;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::checkpoint::load_checkpoint;
use crate::cli::EvaluateArgs;
use crate::config::{PinnConfig, SamplingMode};
use crate::data::TemperatureTable;
use crate::error::{PinnError, PinnResult};
use crate::geometry::{GeometryClassifier, Region};
use crate::model::TemperatureField;
use crate::points::subsample_indices;

/// 予測を何点ずつまとめて行うか。
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// 誤差の統計量。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ErrorStats {
    pub count: usize,
    pub mae: f64,
    pub rmse: f64,
    pub max_abs: f64,
}

impl ErrorStats {
    /// 誤差（予測 - 真値）の列から集計します。空なら全て0です。
    pub fn from_errors(errors: impl IntoIterator<Item = f64>) -> Self {
        let (mut count, mut abs_sum, mut sq_sum, mut max_abs) = (0usize, 0.0, 0.0, 0.0f64);
        for e in errors {
            count += 1;
            abs_sum += e.abs();
            sq_sum += e * e;
            max_abs = max_abs.max(e.abs());
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            count,
            mae: abs_sum / count as f64,
            rmse: (sq_sum / count as f64).sqrt(),
            max_abs,
        }
    }
}

/// 1節点・1時刻の比較結果。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub time: f64,
    pub instance: String,
    pub node_id: u32,
    pub region: Region,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub true_temperature: f64,
    pub predicted_temperature: f64,
    pub error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct SummaryRow {
    scope: String,
    count: usize,
    mae: f64,
    rmse: f64,
    max_abs: f64,
}

/// 評価結果一式。
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    rows: Vec<ComparisonRow>,
    per_region: Vec<(Region, ErrorStats)>,
    global: ErrorStats,
}

impl EvaluationReport {
    fn from_rows(rows: Vec<ComparisonRow>) -> Self {
        let per_region = Region::ALL
            .iter()
            .map(|&region| {
                let stats = ErrorStats::from_errors(
                    rows.iter().filter(|r| r.region == region).map(|r| r.error),
                );
                (region, stats)
            })
            .collect();
        let global = ErrorStats::from_errors(rows.iter().map(|r| r.error));
        Self {
            rows,
            per_region,
            global,
        }
    }

    pub fn rows(&self) -> &[ComparisonRow] {
        &self.rows
    }

    pub fn global(&self) -> ErrorStats {
        self.global
    }

    pub fn region(&self, region: Region) -> ErrorStats {
        self.per_region
            .iter()
            .find(|(r, _)| *r == region)
            .map(|(_, stats)| *stats)
            .unwrap_or_default()
    }

    /// 時刻 `time` の断面。
    pub fn at_time(&self, time: f64) -> impl Iterator<Item = &ComparisonRow> + '_ {
        let tolerance = 1e-9 * (1.0 + time.abs());
        self.rows.iter().filter(move |r| (r.time - time).abs() <= tolerance)
    }

    pub fn in_region(&self, region: Region) -> impl Iterator<Item = &ComparisonRow> + '_ {
        self.rows.iter().filter(move |r| r.region == region)
    }

    /// シード付きで最大 `count` 行を抽出します（元の順序を保ちます）。
    pub fn sample(&self, count: usize, seed: u64) -> Vec<&ComparisonRow> {
        let mut rng = StdRng::seed_from_u64(seed);
        subsample_indices(self.rows.len(), Some(count), SamplingMode::Random, &mut rng)
            .into_iter()
            .map(|i| &self.rows[i])
            .collect()
    }

    /// 領域ごとと全体の統計を `evaluation_summary.csv` 形式で書き出します。
    pub fn write_summary_csv(&self, path: impl AsRef<Path>) -> PinnResult<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path).map_err(|e| PinnError::output_io(path, e))?;
        let rows = self
            .per_region
            .iter()
            .map(|(region, stats)| (region.name().to_string(), *stats))
            .chain(std::iter::once(("global".to_string(), self.global)));
        for (scope, stats) in rows {
            writer.serialize(SummaryRow {
                scope,
                count: stats.count,
                mae: stats.mae,
                rmse: stats.rmse,
                max_abs: stats.max_abs,
            })
            .map_err(|e| PinnError::output_io(path, e))?;
        }
        writer.flush().map_err(|e| PinnError::output_io(path, e))?;
        tracing::info!("=> 評価サマリを '{}' に保存しました。", path.display());
        Ok(())
    }

    pub fn write_samples_csv(&self, path: impl AsRef<Path>, count: usize, seed: u64) -> PinnResult<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path).map_err(|e| PinnError::output_io(path, e))?;
        for row in self.sample(count, seed) {
            writer.serialize(row).map_err(|e| PinnError::output_io(path, e))?;
        }
        writer.flush().map_err(|e| PinnError::output_io(path, e))?;
        tracing::info!("=> 比較サンプルを '{}' に保存しました。", path.display());
        Ok(())
    }
}

/// 学習済みの場を全場テーブルと比較します。
pub struct Evaluator<'a> {
    classifier: &'a GeometryClassifier,
    chunk_size: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(classifier: &'a GeometryClassifier) -> Self {
        Self {
            classifier,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn evaluate<B: Backend, F: TemperatureField<B>>(
        &self,
        field: &F,
        table: &TemperatureTable,
        device: &B::Device,
    ) -> PinnResult<EvaluationReport> {
        let regions = table
            .nodes()
            .iter()
            .map(|node| self.classifier.classify(node).map(|(region, _)| region))
            .collect::<PinnResult<Vec<_>>>()?;

        let coords: Vec<[f64; 4]> = table
            .samples()
            .map(|(node, time, _)| [node.x, node.y, node.z, time])
            .collect();
        let predicted = predict(field, &coords, self.chunk_size, device)?;

        let rows = table
            .observations()
            .iter()
            .zip(predicted)
            .map(|(observation, predicted)| {
                let node = &table.nodes()[observation.node];
                ComparisonRow {
                    time: table.times()[observation.frame],
                    instance: node.instance.clone(),
                    node_id: node.node_id,
                    region: regions[observation.node],
                    x: node.x,
                    y: node.y,
                    z: node.z,
                    true_temperature: observation.temperature,
                    predicted_temperature: predicted,
                    error: predicted - observation.temperature,
                }
            })
            .collect();

        let report = EvaluationReport::from_rows(rows);
        let global = report.global();
        tracing::info!(
            "評価: {} 点, MAE {:.4}, RMSE {:.4}, 最大誤差 {:.4}",
            global.count,
            global.mae,
            global.rmse,
            global.max_abs
        );
        for region in Region::ALL {
            let stats = report.region(region);
            if stats.count > 0 {
                tracing::info!(
                    "  {:<6} {:>8} 点, MAE {:.4}, RMSE {:.4}, 最大誤差 {:.4}",
                    region.name(),
                    stats.count,
                    stats.mae,
                    stats.rmse,
                    stats.max_abs
                );
            }
        }
        Ok(report)
    }
}

/// `coords` を `chunk_size` 点ずつ予測します。
pub fn predict<B: Backend, F: TemperatureField<B>>(
    field: &F,
    coords: &[[f64; 4]],
    chunk_size: usize,
    device: &B::Device,
) -> PinnResult<Vec<f64>> {
    let mut out = Vec::with_capacity(coords.len());
    for chunk in coords.chunks(chunk_size.max(1)) {
        let flat: Vec<f32> = chunk.iter().flat_map(|c| c.map(|v| v as f32)).collect();
        let input = Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([chunk.len(), 4]);
        let values = field
            .temperature(input)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| PinnError::Data(format!("cannot read predictions: {e:?}")))?;
        out.extend(values.into_iter().map(f64::from));
    }
    Ok(out)
}

/// `evaluate`サブコマンドを実行します。
pub fn run(args: &EvaluateArgs) -> anyhow::Result<()> {
    type MyBackend = NdArray<f32>;
    let device = Default::default();

    let config = match &args.config {
        Some(path) => PinnConfig::load(path)
            .with_context(|| format!("設定 '{}' を読み込めません", path.display()))?,
        None => PinnConfig::new(),
    };
    let classifier = GeometryClassifier::new(&config.geometry)?;
    let (model, metadata) = load_checkpoint::<MyBackend>(&args.checkpoint_dir, args.kind, &device)
        .context("最初に 'train' コマンドでモデルを学習・保存してください。")?;
    tracing::info!("epoch {} のモデルを評価します", metadata.epoch);

    let field = TemperatureTable::read_csv(&args.field)?;
    let report = Evaluator::new(&classifier).evaluate(&model, &field, &device)?;
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("出力ディレクトリ '{}' を作成できません", args.out.display()))?;
    report.write_summary_csv(args.out.join("evaluation_summary.csv"))?;
    report.write_samples_csv(args.out.join("evaluation_samples.csv"), args.samples, config.seed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeometryConfig;
    use crate::data::TemperatureRow;
    use crate::pinn::tests::QuadraticField;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn row(frame: usize, time: f64, node_id: u32, xyz: [f64; 3], temperature: f64) -> TemperatureRow {
        TemperatureRow {
            time_step_index: frame,
            time,
            node_set_name: "ALL-N".into(),
            instance_name: "PART-1-1".into(),
            node_id,
            x: xyz[0],
            y: xyz[1],
            z: xyz[2],
            temperature,
        }
    }

    fn table() -> TemperatureTable {
        let nodes = [
            (1, [0.0, 0.0, 0.0]),
            (2, [0.0, 0.0, 500.0]),
            (3, [0.0, 35.0, 500.0]),
            (4, [30.0, 0.0, 150.0]),
        ];
        let mut rows = Vec::new();
        for (frame, time) in [(0, 0.0), (1, 60.0)] {
            for (id, xyz) in nodes {
                rows.push(row(frame, time, id, xyz, 20.0 + id as f64));
            }
        }
        TemperatureTable::from_rows(&rows).unwrap()
    }

    #[test]
    fn error_stats_of_known_errors() {
        let stats = ErrorStats::from_errors([1.0, -3.0]);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mae, 2.0);
        assert!((stats.rmse - 5.0f64.sqrt()).abs() < 1e-12);
        assert_eq!(stats.max_abs, 3.0);
        assert_eq!(ErrorStats::from_errors([]), ErrorStats::default());
    }

    #[test]
    fn evaluates_per_region_and_globally() {
        let classifier = GeometryClassifier::new(&GeometryConfig::new()).unwrap();
        let report = Evaluator::new(&classifier)
            .with_chunk_size(3)
            .evaluate::<TestBackend, _>(&QuadraticField::constant(20.0), &table(), &Default::default())
            .unwrap();

        assert_eq!(report.rows().len(), 8);
        assert_eq!(report.global().count, 8);
        // 誤差は -(節点番号)
        assert!((report.global().max_abs - 4.0).abs() < 1e-5);
        assert!((report.global().mae - 2.5).abs() < 1e-5);
        for region in Region::ALL {
            assert_eq!(report.region(region).count, 2, "{region}");
        }
        assert!((report.region(Region::End).mae - 1.0).abs() < 1e-5);
        assert!((report.region(Region::Step).mae - 4.0).abs() < 1e-5);
        assert_eq!(report.at_time(60.0).count(), 4);
        assert_eq!(report.in_region(Region::Side).count(), 2);
    }

    #[test]
    fn sampling_is_seeded_and_bounded() {
        let classifier = GeometryClassifier::new(&GeometryConfig::new()).unwrap();
        let report = Evaluator::new(&classifier)
            .evaluate::<TestBackend, _>(&QuadraticField::constant(20.0), &table(), &Default::default())
            .unwrap();
        let a = report.sample(3, 5);
        let b = report.sample(3, 5);
        assert_eq!(a.len(), 3);
        assert_eq!(a, b);
        assert_eq!(report.sample(100, 5).len(), 8);
    }

    #[test]
    fn writes_summary_and_sample_csv() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = GeometryClassifier::new(&GeometryConfig::new()).unwrap();
        let report = Evaluator::new(&classifier)
            .evaluate::<TestBackend, _>(&QuadraticField::constant(25.0), &table(), &Default::default())
            .unwrap();
        let summary = dir.path().join("evaluation_summary.csv");
        let samples = dir.path().join("evaluation_samples.csv");
        report.write_summary_csv(&summary).unwrap();
        report.write_samples_csv(&samples, 5, 1).unwrap();

        let text = std::fs::read_to_string(&summary).unwrap();
        assert!(text.starts_with("scope,count,mae,rmse,max_abs"));
        assert_eq!(text.lines().count(), 1 + Region::ALL.len() + 1);
        let sample_lines = std::fs::read_to_string(&samples).unwrap().lines().count();
        assert_eq!(sample_lines, 1 + 5);
    }

    #[test]
    fn unclassifiable_node_fails_evaluation() {
        let classifier = GeometryClassifier::new(&GeometryConfig::new()).unwrap();
        let rows = vec![row(0, 0.0, 9, [80.0, 0.0, 500.0], 20.0)];
        let table = TemperatureTable::from_rows(&rows).unwrap();
        let result = Evaluator::new(&classifier).evaluate::<TestBackend, _>(
            &QuadraticField::constant(20.0),
            &table,
            &Default::default(),
        );
        assert!(matches!(result, Err(PinnError::Classification { .. })));
    }
}
