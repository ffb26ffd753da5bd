//! 推論コアのエラー定義

use std::path::{Path, PathBuf};

use thiserror::Error;

/// 推論パイプラインのエラー
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// 重みファイルの読み込み失敗（欠落・破損・形状不一致）
    ///
    /// モデルがキャッシュされていないため、推論は一切行えません。
    #[error("failed to load model weights from {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// アップロードされたバイト列が画像としてデコードできない
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    /// 入力テンソルの形状が契約と異なる（前処理側の不具合）
    #[error("invalid input shape: expected {expected:?}, got {actual:?}")]
    InvalidInput {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// 平坦化されたデータの要素数が形状と合わない
    #[error("invalid input length: shape {shape:?} needs {expected} values, got {actual}")]
    InvalidLength {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    /// バックエンドからテンソルデータを取り出せない
    #[error("tensor error: {0}")]
    Tensor(String),
}

impl ClassifierError {
    pub fn load(path: &Path, reason: impl Into<String>) -> Self {
        ClassifierError::Load {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// 現在のリクエストのみを中断するエラーかどうか
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ClassifierError::Load { .. })
    }
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
