//! # 段付き軸の温度場 PINN
//!
//! `clap` クレートを利用して、コマンドラインから`train`（学習）、`evaluate`（評価）、
//! `infer`（推論）、`default-config`（既定設定の出力）を個別に実行できます。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --sensors sensors.csv --field field.csv --out runs/shaft
//! ```
//!
//! ### 推論
//! ```bash
//! cargo run --release -- infer --times 0,300,600
//! ```
//!
//! ログの詳細度は `RUST_LOG` で変更できます（既定は `shaft_pinn=info`）。

use anyhow::Context;
use burn::config::Config;
use clap::Parser;
use shaft_pinn::cli::{Cli, Commands};
use shaft_pinn::config::PinnConfig;
use shaft_pinn::{evaluation, inference, training};
use tracing_subscriber::EnvFilter;

/// プログラムのエントリーポイント。
///
/// コマンドライン引数を解析し、各サブコマンドの処理に振り分けます。
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shaft_pinn=info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => training::run(args),
        Commands::Evaluate(args) => evaluation::run(args),
        Commands::Infer(args) => inference::run(args),
        Commands::DefaultConfig { output } => {
            PinnConfig::new()
                .save(output)
                .with_context(|| format!("'{}' に書き込めません", output.display()))?;
            tracing::info!("=> 既定の設定を '{}' に保存しました。", output.display());
            Ok(())
        }
    }
}
