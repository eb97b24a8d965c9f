use std::time::Instant;

use anyhow::Context;
use burn::backend::NdArray;

use crate::checkpoint::load_checkpoint;
use crate::cli::InferArgs;
use crate::evaluation::{DEFAULT_CHUNK_SIZE, predict};
use crate::model::{InputBounds, TemperatureField};

type MyBackend = NdArray<f32>;

/// 半径 `radius` の母線上に、軸方向 `points` 点 × 各時刻の座標を並べます。
pub fn axial_profile_coords(bounds: &InputBounds, radius: f64, times: &[f64], points: usize) -> Vec<[f64; 4]> {
    let (z_start, z_end) = (bounds.lower[2], bounds.upper[2]);
    let n = points.max(2);
    times
        .iter()
        .flat_map(|&t| {
            (0..n).map(move |i| {
                let z = z_start + (z_end - z_start) * i as f64 / (n - 1) as f64;
                [radius, 0.0, z, t]
            })
        })
        .collect()
}

/// 場を `coords` で評価し、(座標, 温度) の組を返します。
pub fn query<F: TemperatureField<MyBackend>>(
    field: &F,
    coords: &[[f64; 4]],
) -> crate::error::PinnResult<Vec<([f64; 4], f64)>> {
    let device = Default::default();
    let temps = predict(field, coords, DEFAULT_CHUNK_SIZE, &device)?;
    Ok(coords.iter().copied().zip(temps).collect())
}

/// `infer`サブコマンドを実行します。
///
/// ファイルから学習済みモデルを読み込み、母線上の温度分布を推論します。
pub fn run(args: &InferArgs) -> anyhow::Result<()> {
    let device = Default::default();

    tracing::info!("推論を実行します - バックエンド: NdArray (CPU)");
    let inference_start = Instant::now();

    tracing::info!(
        "保存済みモデルを '{}' ({:?}) からロード中...",
        args.checkpoint_dir.display(),
        args.kind
    );
    let (model, metadata) = load_checkpoint::<MyBackend>(&args.checkpoint_dir, args.kind, &device)
        .context("最初に 'train' コマンドでモデルを学習・保存してください。")?;
    tracing::info!(
        "=> epoch {} のモデルを読み込みました ({} = {:.6}, 保存日時 {})",
        metadata.epoch,
        metadata.metric,
        metadata.metric_value,
        metadata.saved_at
    );

    let bounds = metadata.scaling.inputs;
    let times = if args.times.is_empty() {
        vec![bounds.lower[3], bounds.upper[3]]
    } else {
        args.times.clone()
    };
    let coords = axial_profile_coords(&bounds, args.radius, &times, args.points);
    let predictions = query(&model, &coords)?;
    let inference_duration = inference_start.elapsed();

    println!("{:>10} {:>10} {:>12}", "t", "z", "T");
    for ([_, _, z, t], temperature) in &predictions {
        println!("{t:>10.3} {z:>10.3} {temperature:>12.4}");
    }
    tracing::info!(
        "推論が完了しました。点数: {} ({} 時刻 × {} 点)",
        predictions.len(),
        times.len(),
        args.points.max(2)
    );
    tracing::info!("=> 推論時間: {:.2?}", inference_duration);

    Ok(())
}
