//! 学習済みパラメータのスナップショットと保存先。

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FieldModelConfig;
use crate::error::{PinnError, PinnResult};
use crate::model::{FieldScaling, Model};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Best,
    Last,
}

impl CheckpointKind {
    pub fn file_stem(&self) -> &'static str {
        match self {
            CheckpointKind::Best => "best",
            CheckpointKind::Last => "last",
        }
    }
}

/// あるエポック終了時点のモデル。作成後は変更しません。
#[derive(Debug, Clone)]
pub struct Checkpoint<B: Backend> {
    pub kind: CheckpointKind,
    pub epoch: usize,
    pub metric: String,
    pub metric_value: f64,
    pub model: Model<B>,
}

impl<B: Backend> Checkpoint<B> {
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            kind: self.kind,
            epoch: self.epoch,
            metric: self.metric.clone(),
            metric_value: self.metric_value,
        }
    }
}

/// モデルを除いたチェックポイントの要約。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub kind: CheckpointKind,
    pub epoch: usize,
    pub metric: String,
    pub metric_value: f64,
}

/// `<kind>.json` に書き出すメタデータ。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub kind: CheckpointKind,
    pub epoch: usize,
    pub metric: String,
    pub metric_value: f64,
    pub saved_at: DateTime<Utc>,
    pub scaling: FieldScaling,
    pub model: FieldModelConfig,
}

/// チェックポイントの保存先。
pub trait CheckpointStore<B: Backend> {
    fn save(&mut self, checkpoint: &Checkpoint<B>) -> PinnResult<()>;
}

/// ディレクトリに `best.mpk` / `last.mpk` とそのメタデータを保存します。
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    model_config: FieldModelConfig,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, model_config: &FieldModelConfig) -> PinnResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| PinnError::checkpoint_io(&dir, e))?;
        Ok(Self {
            dir,
            model_config: model_config.clone(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl<B: Backend> CheckpointStore<B> for FileCheckpointStore {
    fn save(&mut self, checkpoint: &Checkpoint<B>) -> PinnResult<()> {
        let stem = checkpoint.kind.file_stem();
        let model_path = self.dir.join(format!("{stem}.mpk"));
        checkpoint
            .model
            .clone()
            .save_file(
                model_path.clone(),
                &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            )
            .map_err(|e| PinnError::checkpoint_io(&model_path, e))?;

        let metadata = CheckpointMetadata {
            kind: checkpoint.kind,
            epoch: checkpoint.epoch,
            metric: checkpoint.metric.clone(),
            metric_value: checkpoint.metric_value,
            saved_at: Utc::now(),
            scaling: checkpoint.model.scaling(),
            model: self.model_config.clone(),
        };
        let meta_path = self.dir.join(format!("{stem}.json"));
        let file = File::create(&meta_path).map_err(|e| PinnError::checkpoint_io(&meta_path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &metadata)
            .map_err(|e| PinnError::checkpoint_io(&meta_path, e))?;

        tracing::info!(
            "チェックポイント '{}' を保存しました (epoch {}, {} = {:.6})",
            model_path.display(),
            checkpoint.epoch,
            checkpoint.metric,
            checkpoint.metric_value
        );
        Ok(())
    }
}

/// 保存済みのチェックポイントを読み込みます。
pub fn load_checkpoint<B: Backend>(
    dir: impl AsRef<Path>,
    kind: CheckpointKind,
    device: &B::Device,
) -> PinnResult<(Model<B>, CheckpointMetadata)> {
    let dir = dir.as_ref();
    let stem = kind.file_stem();
    let meta_path = dir.join(format!("{stem}.json"));
    let file = File::open(&meta_path).map_err(|e| PinnError::checkpoint_io(&meta_path, e))?;
    let metadata: CheckpointMetadata =
        serde_json::from_reader(file).map_err(|e| PinnError::checkpoint_io(&meta_path, e))?;

    let model_path = dir.join(format!("{stem}.mpk"));
    let model = Model::<B>::new(&metadata.model, metadata.scaling, device)
        .load_file(
            model_path.clone(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| PinnError::checkpoint_io(&model_path, e))?;
    Ok((model, metadata))
}

/// メモリ上に保存するだけのストア。
#[derive(Debug, Clone)]
pub struct MemoryCheckpointStore<B: Backend> {
    saved: Vec<Checkpoint<B>>,
}

impl<B: Backend> Default for MemoryCheckpointStore<B> {
    fn default() -> Self {
        Self { saved: Vec::new() }
    }
}

impl<B: Backend> MemoryCheckpointStore<B> {
    pub fn saved(&self) -> &[Checkpoint<B>] {
        &self.saved
    }

    pub fn latest(&self, kind: CheckpointKind) -> Option<&Checkpoint<B>> {
        self.saved.iter().rev().find(|c| c.kind == kind)
    }
}

impl<B: Backend> CheckpointStore<B> for MemoryCheckpointStore<B> {
    fn save(&mut self, checkpoint: &Checkpoint<B>) -> PinnResult<()> {
        self.saved.push(checkpoint.clone());
        Ok(())
    }
}
