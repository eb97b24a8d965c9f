//! 損失履歴のCSVとグラフの出力。

use std::path::Path;

use plotters::prelude::*;

use crate::error::{PinnError, PinnResult};
use crate::loss::{LossHistory, LossTerm};

/// 損失履歴を1エポック1行のCSVとして書き出します。
///
/// `pde`・`end`・`step`・`side` 列は特性スケールで割った残差の MSE で、物理単位の二乗誤差ではありません。
pub fn write_loss_history_csv(history: &LossHistory, path: impl AsRef<Path>) -> PinnResult<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path).map_err(|e| PinnError::output_io(path, e))?;
    for record in history.records() {
        writer.serialize(record).map_err(|e| PinnError::output_io(path, e))?;
    }
    writer.flush().map_err(|e| PinnError::output_io(path, e))?;
    Ok(())
}

/// 学習過程の損失をグラフとしてPNGファイルに出力します。
///
/// 各項を log10 スケールで描きます。0 以下や非有限の値は描画しません。
pub fn plot_loss_history(
    history: &LossHistory,
    path: impl AsRef<Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let series: Vec<(&str, RGBColor, Vec<(usize, f64)>)> = [
        ("Total Loss", RED, None),
        ("Data", GREEN, Some(LossTerm::Data)),
        ("Initial Condition", MAGENTA, Some(LossTerm::InitialCondition)),
        ("PDE", BLUE, Some(LossTerm::Pde)),
        ("End", CYAN, Some(LossTerm::End)),
        ("Step", RGBColor(255, 140, 0), Some(LossTerm::Step)),
        ("Side", RGBColor(128, 128, 128), Some(LossTerm::Side)),
    ]
    .into_iter()
    .map(|(label, color, term)| {
        let points = history
            .records()
            .iter()
            .map(|r| (r.epoch, term.map_or(r.total, |t| r.get(t))))
            .filter(|(_, v)| v.is_finite() && *v > 0.0)
            .map(|(epoch, v)| (epoch, v.log10()))
            .collect();
        (label, color, points)
    })
    .collect();

    let logs = series.iter().flat_map(|(_, _, points)| points.iter().map(|p| p.1));
    let (min_log_loss, max_log_loss) = logs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !min_log_loss.is_finite() {
        return Err("loss history has no positive finite values".into());
    }
    let max_epoch = history.records().last().map_or(1, |r| r.epoch) + 1;

    let root = BitMapBackend::new(path.as_ref(), (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Loss History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..max_epoch, (min_log_loss - 0.5)..(max_log_loss + 0.5))?;
    chart
        .configure_mesh()
        .y_desc("Loss (log10 scale)")
        .x_desc("Epoch")
        .draw()?;
    for (label, color, points) in series {
        if points.is_empty() {
            continue;
        }
        chart
            .draw_series(LineSeries::new(points, &color))?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}
