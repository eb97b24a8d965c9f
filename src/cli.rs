use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::checkpoint::CheckpointKind;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "Transient temperature surrogate of a stepped shaft (PINN with Burn)", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// PINNモデルを学習し、チェックポイントと評価結果を保存します
    Train(TrainArgs),
    /// 保存されたモデルを全場テーブルと比較します
    Evaluate(EvaluateArgs),
    /// 保存されたモデルで中心軸上の温度分布を推論します
    Infer(InferArgs),
    /// 既定の設定をJSONファイルに書き出します
    DefaultConfig {
        #[arg(short, long, default_value = "pinn_config.json")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// センサ節点の温度CSV
    #[arg(long)]
    pub sensors: PathBuf,
    /// 全節点の温度CSV（コロケーション点と検証に使用）
    #[arg(long)]
    pub field: PathBuf,
    /// 設定JSON。省略時は既定値
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// 出力ディレクトリ
    #[arg(short, long, default_value = "runs/shaft")]
    pub out: PathBuf,
    /// 設定のエポック数を上書きします
    #[arg(long)]
    pub epochs: Option<usize>,
    /// evaluation_samples.csv に書き出す行数
    #[arg(long, default_value_t = 2000)]
    pub samples: usize,
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// 全節点の温度CSV
    #[arg(long)]
    pub field: PathBuf,
    /// 幾何の設定を含む設定JSON。省略時は既定値
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value = "runs/shaft/checkpoints")]
    pub checkpoint_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = CheckpointKind::Best)]
    pub kind: CheckpointKind,
    #[arg(short, long, default_value = "runs/shaft")]
    pub out: PathBuf,
    #[arg(long, default_value_t = 2000)]
    pub samples: usize,
}

#[derive(Args, Debug)]
pub struct InferArgs {
    #[arg(long, default_value = "runs/shaft/checkpoints")]
    pub checkpoint_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = CheckpointKind::Best)]
    pub kind: CheckpointKind,
    /// 推論する時刻（カンマ区切り）。省略時は学習した時間区間の両端
    #[arg(long, value_delimiter = ',')]
    pub times: Vec<f64>,
    /// 軸方向の分割点数
    #[arg(long, default_value_t = 11)]
    pub points: usize,
    /// 評価する半径位置（座標単位）
    #[arg(long, default_value_t = 0.0)]
    pub radius: f64,
}
