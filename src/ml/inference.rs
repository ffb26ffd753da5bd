//! モデル推論機能

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::{backend::Backend, Tensor, TensorData},
};

use crate::error::{ClassifierError, Result};
use crate::ml::ml_model::{compare_shapes, record_parameter_shapes, ChromiumCnnRecord};
use crate::ml::{
    decoder, expected_parameter_shapes, preprocess, ChromiumCnn, ModelConfig, ARCHITECTURE,
    CLASS_NAMES, IMAGE_SIZE,
};
use crate::model::{load_model_with_metadata, save_model_with_metadata, ModelMetadata};
use crate::types::{ImageTensor, Prediction, ScoreVector};

/// model.bin の形式（パラメータ名付き、f32精度）
pub type WeightsRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// 推論エンジン
///
/// 重みは読み込み後に変更されません。`Mutex` はモジュールを複数スレッドから
/// 参照するためだけに使い、推論ごとにテンソルを共有したクローンを取り出します。
pub struct InferenceEngine<B: Backend> {
    model: Mutex<ChromiumCnn<B>>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// 重みファイルを読み込んで推論エンジンを初期化
    ///
    /// ファイルの欠落・破損、アーキテクチャとの不一致はすべて `ClassifierError::Load` になります。
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let path = model_path.as_ref();
        log::info!("モデルを読み込み中: {}", path.display());

        let (metadata, model_binary) = load_model_with_metadata(path)
            .map_err(|e| ClassifierError::load(path, format!("{e:#}")))?;
        validate_metadata(&metadata).map_err(|reason| ClassifierError::load(path, reason))?;

        // モデルの重みを復元
        let recorder = WeightsRecorder::default();
        let record: ChromiumCnnRecord<B> = Recorder::<B>::load(&recorder, model_binary, &device)
            .map_err(|e| ClassifierError::load(path, format!("model record error: {e:?}")))?;

        compare_shapes(&expected_parameter_shapes(), &record_parameter_shapes::<B>(&record))
            .map_err(|reason| ClassifierError::load(path, reason))?;

        let model = ModelConfig::chromium()
            .init::<B>(&device)
            .load_record(record);

        log::info!(
            "モデルを読み込みました: {} ({} params, exported {})",
            path.display(),
            model.num_params(),
            metadata.exported_at
        );

        Ok(Self::from_parts(model, metadata, device))
    }

    /// 読み込み済みモデルから作成（推論モードに切り替える）
    pub fn from_parts(model: ChromiumCnn<B>, metadata: ModelMetadata, device: B::Device) -> Self {
        Self {
            model: Mutex::new(model.eval()),
            metadata,
            device,
        }
    }

    /// 前処理済みテンソルのロジットを計算
    pub fn score(&self, input: &ImageTensor) -> Result<ScoreVector> {
        if input.shape() != ImageTensor::SHAPE {
            return Err(ClassifierError::InvalidInput {
                expected: ImageTensor::SHAPE.to_vec(),
                actual: input.shape().to_vec(),
            });
        }

        // Tensorに変換 [1, 3, 128, 128]
        let [c, h, w] = input.shape();
        let data = TensorData::new(input.as_slice().to_vec(), [1, c, h, w]);
        let tensor = Tensor::<B, 4>::from_data(data, &self.device);

        let output = self.model().forward(tensor);
        let values = output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Tensor(format!("{e:?}")))?;

        ScoreVector::try_from(values)
    }

    /// 前処理済みテンソルを分類
    pub fn classify(&self, input: &ImageTensor) -> Result<Prediction> {
        let scores = self.score(input)?;
        Ok(decoder::decode(scores))
    }

    /// 画像のバイト列を分類（前処理 -> 推論 -> デコード）
    pub fn classify_bytes(&self, image_bytes: &[u8]) -> Result<Prediction> {
        let input = preprocess::preprocess_bytes(image_bytes)?;
        let prediction = self.classify(&input)?;
        log::debug!(
            "分類結果: {} (index {}, logit {:.4})",
            prediction.label,
            prediction.class_index,
            prediction.scores.0[prediction.class_index]
        );
        Ok(prediction)
    }

    /// メタデータへの参照を取得
    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    // テンソルは参照カウントされているのでクローンは軽量
    fn model(&self) -> ChromiumCnn<B> {
        self.model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// モデルをメタデータと共に重みファイルとして書き出す
///
/// 実際に書き込んだパスを返します。
pub fn export_model<B: Backend>(
    model: &ChromiumCnn<B>,
    output_path: &Path,
    source_checkpoint: Option<String>,
) -> anyhow::Result<PathBuf> {
    let metadata = ModelMetadata::new(model.parameter_shapes(), source_checkpoint);

    let recorder = WeightsRecorder::default();
    let model_binary = Recorder::<B>::record(&recorder, model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))?;

    save_model_with_metadata(output_path, &metadata, &model_binary)
}

// メタデータが宣言されたアーキテクチャと一致するか
fn validate_metadata(metadata: &ModelMetadata) -> std::result::Result<(), String> {
    if metadata.architecture != ARCHITECTURE {
        return Err(format!(
            "unsupported architecture {:?} (expected {:?})",
            metadata.architecture, ARCHITECTURE
        ));
    }
    if metadata.class_labels.iter().map(String::as_str).ne(CLASS_NAMES) {
        return Err(format!(
            "class labels {:?} do not match {:?}",
            metadata.class_labels, CLASS_NAMES
        ));
    }
    if metadata.model_input_size as usize != IMAGE_SIZE {
        return Err(format!(
            "model input size {} (expected {})",
            metadata.model_input_size, IMAGE_SIZE
        ));
    }
    compare_shapes(&expected_parameter_shapes(), &metadata.parameters)
}
