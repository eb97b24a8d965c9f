use std::path::PathBuf;

use thiserror::Error;

use crate::points::PointSetKind;

pub type PinnResult<T> = std::result::Result<T, PinnError>;

/// 学習パイプライン全体で使用するエラー型。
#[derive(Debug, Error)]
pub enum PinnError {
    /// 入力テーブルの行が不正、または欠落している。
    #[error("data error: {0}")]
    Data(String),

    /// ノードの座標が既知の領域のいずれにも一致しない。
    #[error("node {instance}.{node_id} at (x={x}, y={y}, z={z}) matches no region: {reason}")]
    Classification {
        instance: String,
        node_id: u32,
        x: f64,
        y: f64,
        z: f64,
        reason: String,
    },

    #[error("point set `{0}` is empty")]
    EmptyPointSet(PointSetKind),

    /// 学習中に損失が非有限値（NaN/Inf）になった。
    #[error("loss term `{term}` became non-finite at epoch {epoch}")]
    NumericalDivergence { epoch: usize, term: String },

    #[error("checkpoint I/O failed for '{}': {message}", path.display())]
    CheckpointIo { path: PathBuf, message: String },

    /// 評価結果や損失履歴などの出力ファイルを書き出せなかった。
    #[error("cannot write output '{}': {message}", path.display())]
    OutputIo { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PinnError {
    pub(crate) fn checkpoint_io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::CheckpointIo {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn output_io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::OutputIo {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<csv::Error> for PinnError {
    fn from(err: csv::Error) -> Self {
        Self::Data(err.to_string())
    }
}
