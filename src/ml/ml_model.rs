//! 機械学習モデルの共通定義
//!
//! クロム分類用のCNNモデルと関連する定数・設定を提供します。

use std::collections::BTreeMap;

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor, TensorData},
};

/// クラス数
pub const NUM_CLASSES: usize = 9;

/// 画像サイズ（正方形）
pub const IMAGE_SIZE: usize = 128;

/// 入力チャネル数 (RGB)
pub const CHANNELS: usize = 3;

/// クラス名の定義（インデックス + 1）
pub const CLASS_NAMES: [&str; NUM_CLASSES] = ["1", "2", "3", "4", "5", "6", "7", "8", "9"];

/// アーキテクチャ名（メタデータとの照合用）
pub const ARCHITECTURE: &str = "chromium_cnn";

/// 特徴抽出部のチャネル推移 3 -> 32 -> 64 -> 128
pub const FEATURE_CHANNELS: [usize; 4] = [CHANNELS, 32, 64, 128];

/// 3回のプーリング後の特徴マップサイズ: 128 / 2 / 2 / 2
pub const FEATURE_MAP_SIZE: usize = IMAGE_SIZE / 8;

/// Flatten後の特徴次元: 128 * 16 * 16
pub const FLATTENED_FEATURES: usize = FEATURE_CHANNELS[3] * FEATURE_MAP_SIZE * FEATURE_MAP_SIZE;

/// 全結合層の隠れユニット数
pub const HIDDEN_UNITS: usize = 256;

/// パラメータ名 -> 形状
pub type ParameterShapes = BTreeMap<String, Vec<usize>>;

/// 平坦化されたパラメータ値（行優先）
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// パラメータ名 -> 値（Burnのレイアウト）
pub type ParameterTensors = BTreeMap<String, ParameterTensor>;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率（学習モード時のみ有効）
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ModelConfig {
    /// 9クラス分類の標準構成
    pub fn chromium() -> Self {
        Self::new(NUM_CLASSES)
    }

    /// モデルを初期化
    ///
    /// 初期状態は学習モードです。推論前に [`ChromiumCnn::eval`] を呼んでください。
    pub fn init<B: Backend>(&self, device: &B::Device) -> ChromiumCnn<B> {
        log::debug!("[Model] 入力サイズ: {}x{}", IMAGE_SIZE, IMAGE_SIZE);
        log::debug!(
            "[Model] 特徴マップ: {} x {}x{}",
            FEATURE_CHANNELS[3],
            FEATURE_MAP_SIZE,
            FEATURE_MAP_SIZE
        );
        log::debug!("[Model] FC1: {} -> {}", FLATTENED_FEATURES, HIDDEN_UNITS);
        log::debug!("[Model] FC2: {} -> {}", HIDDEN_UNITS, self.num_classes);

        ChromiumCnn {
            conv1: conv3x3([FEATURE_CHANNELS[0], FEATURE_CHANNELS[1]], device),
            conv2: conv3x3([FEATURE_CHANNELS[1], FEATURE_CHANNELS[2]], device),
            conv3: conv3x3([FEATURE_CHANNELS[2], FEATURE_CHANNELS[3]], device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            fc1: LinearConfig::new(FLATTENED_FEATURES, HIDDEN_UNITS).init(device),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),

            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
            training: true,
        }
    }
}

// 3x3 Conv (padding 1, stride 1): 空間サイズを保つ
fn conv3x3<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([1, 1])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// クロム分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (padding 1) + ReLU + MaxPool 2x2} x 3層 (3 -> 32 -> 64 -> 128)
/// - Flatten (128 * 16 * 16 = 32768)
/// - FC: 32768 -> 256 + ReLU + Dropout(0.5, 学習時のみ)
/// - FC: 256 -> num_classes（ロジット、活性化なし）
#[derive(Module, Debug)]
pub struct ChromiumCnn<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    conv2: Conv2d<B>, // 32 -> 64
    conv3: Conv2d<B>, // 64 -> 128
    pool: MaxPool2d,  // 2x2, stride 2

    fc1: Linear<B>, // 32768 -> 256
    fc2: Linear<B>, // 256 -> num_classes

    dropout: Dropout,
    activation: Relu,
    training: bool,
}

impl<B: Backend> ChromiumCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, 128, 128]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        // Block1: Conv + ReLU + Pool (128 -> 64)
        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);

        // Block2: Conv + ReLU + Pool (64 -> 32)
        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);

        // Block3: Conv + ReLU + Pool (32 -> 16)
        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        // FC1 + ReLU + Dropout
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = if self.training {
            self.dropout.forward(x)
        } else {
            x
        };

        // FC2
        self.fc2.forward(x)
    }

    /// 学習モード（ドロップアウト有効）
    pub fn train(mut self) -> Self {
        self.training = true;
        self
    }

    /// 推論モード（ドロップアウト無効、同一入力に対して決定的）
    pub fn eval(mut self) -> Self {
        self.training = false;
        self
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// 全パラメータの値を取り出す
    pub fn parameter_tensors(&self) -> Result<ParameterTensors, String> {
        let mut tensors = ParameterTensors::new();

        for (layer, weight, bias) in [
            ("conv1", &self.conv1.weight, &self.conv1.bias),
            ("conv2", &self.conv2.weight, &self.conv2.bias),
            ("conv3", &self.conv3.weight, &self.conv3.bias),
        ] {
            tensors.insert(format!("{layer}.weight"), tensor_values(weight)?);
            if let Some(bias) = bias {
                tensors.insert(format!("{layer}.bias"), tensor_values(bias)?);
            }
        }
        for (layer, weight, bias) in [
            ("fc1", &self.fc1.weight, &self.fc1.bias),
            ("fc2", &self.fc2.weight, &self.fc2.bias),
        ] {
            tensors.insert(format!("{layer}.weight"), tensor_values(weight)?);
            if let Some(bias) = bias {
                tensors.insert(format!("{layer}.bias"), tensor_values(bias)?);
            }
        }

        Ok(tensors)
    }

    /// パラメータを差し替える
    ///
    /// 名前と形状が現在のモデルと完全に一致しない場合はエラーになります。
    pub fn with_parameters(
        mut self,
        tensors: &ParameterTensors,
        device: &B::Device,
    ) -> Result<Self, String> {
        let shapes: ParameterShapes = tensors
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.shape.clone()))
            .collect();
        compare_shapes(&self.parameter_shapes(), &shapes)?;

        self.conv1.weight = param_from(tensors, "conv1.weight", device)?;
        self.conv1.bias = Some(param_from(tensors, "conv1.bias", device)?);
        self.conv2.weight = param_from(tensors, "conv2.weight", device)?;
        self.conv2.bias = Some(param_from(tensors, "conv2.bias", device)?);
        self.conv3.weight = param_from(tensors, "conv3.weight", device)?;
        self.conv3.bias = Some(param_from(tensors, "conv3.bias", device)?);
        self.fc1.weight = param_from(tensors, "fc1.weight", device)?;
        self.fc1.bias = Some(param_from(tensors, "fc1.bias", device)?);
        self.fc2.weight = param_from(tensors, "fc2.weight", device)?;
        self.fc2.bias = Some(param_from(tensors, "fc2.bias", device)?);

        Ok(self)
    }

    /// 現在のパラメータ形状
    pub fn parameter_shapes(&self) -> ParameterShapes {
        collect_shapes::<B>(
            [
                ("conv1", &self.conv1.weight, &self.conv1.bias),
                ("conv2", &self.conv2.weight, &self.conv2.bias),
                ("conv3", &self.conv3.weight, &self.conv3.bias),
            ],
            [
                ("fc1", &self.fc1.weight, &self.fc1.bias),
                ("fc2", &self.fc2.weight, &self.fc2.bias),
            ],
        )
    }
}

/// 読み込んだレコードのパラメータ形状
///
/// `load_record` の前に検証するために使用します。
pub fn record_parameter_shapes<B: Backend>(record: &ChromiumCnnRecord<B>) -> ParameterShapes {
    collect_shapes::<B>(
        [
            ("conv1", &record.conv1.weight, &record.conv1.bias),
            ("conv2", &record.conv2.weight, &record.conv2.bias),
            ("conv3", &record.conv3.weight, &record.conv3.bias),
        ],
        [
            ("fc1", &record.fc1.weight, &record.fc1.bias),
            ("fc2", &record.fc2.weight, &record.fc2.bias),
        ],
    )
}

type ConvParams<'a, B> = (&'a str, &'a Param<Tensor<B, 4>>, &'a Option<Param<Tensor<B, 1>>>);
type LinearParams<'a, B> = (&'a str, &'a Param<Tensor<B, 2>>, &'a Option<Param<Tensor<B, 1>>>);

fn collect_shapes<B: Backend>(
    convs: [ConvParams<'_, B>; 3],
    linears: [LinearParams<'_, B>; 2],
) -> ParameterShapes {
    let mut shapes = ParameterShapes::new();

    for (layer, weight, bias) in convs {
        shapes.insert(format!("{layer}.weight"), weight.val().dims().to_vec());
        if let Some(bias) = bias {
            shapes.insert(format!("{layer}.bias"), bias.val().dims().to_vec());
        }
    }
    for (layer, weight, bias) in linears {
        shapes.insert(format!("{layer}.weight"), weight.val().dims().to_vec());
        if let Some(bias) = bias {
            shapes.insert(format!("{layer}.bias"), bias.val().dims().to_vec());
        }
    }

    shapes
}

fn tensor_values<B: Backend, const D: usize>(
    param: &Param<Tensor<B, D>>,
) -> Result<ParameterTensor, String> {
    let tensor = param.val();
    let shape = tensor.dims().to_vec();
    let values = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| format!("{e:?}"))?;
    Ok(ParameterTensor { shape, values })
}

fn param_from<B: Backend, const D: usize>(
    tensors: &ParameterTensors,
    name: &str,
    device: &B::Device,
) -> Result<Param<Tensor<B, D>>, String> {
    let tensor = tensors
        .get(name)
        .ok_or_else(|| format!("missing parameter {name}"))?;
    let expected_len: usize = tensor.shape.iter().product();
    if tensor.shape.len() != D || tensor.values.len() != expected_len {
        return Err(format!(
            "{name}: {} values do not fit shape {:?}",
            tensor.values.len(),
            tensor.shape
        ));
    }

    let data = TensorData::new(tensor.values.clone(), tensor.shape.clone());
    Ok(Param::from_tensor(Tensor::from_data(data, device)))
}

/// パラメータ名と形状を比較し、欠落・余分・不一致をまとめて報告する
pub fn compare_shapes(
    expected: &ParameterShapes,
    actual: &ParameterShapes,
) -> Result<(), String> {
    let missing: Vec<&str> = expected
        .keys()
        .filter(|name| !actual.contains_key(*name))
        .map(String::as_str)
        .collect();
    let unexpected: Vec<&str> = actual
        .keys()
        .filter(|name| !expected.contains_key(*name))
        .map(String::as_str)
        .collect();
    let mismatched: Vec<String> = expected
        .iter()
        .filter_map(|(name, shape)| match actual.get(name) {
            Some(found) if found != shape => {
                Some(format!("{name}: expected {shape:?}, found {found:?}"))
            }
            _ => None,
        })
        .collect();

    if missing.is_empty() && unexpected.is_empty() && mismatched.is_empty() {
        return Ok(());
    }

    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing parameters {missing:?}"));
    }
    if !unexpected.is_empty() {
        problems.push(format!("unexpected parameters {unexpected:?}"));
    }
    if !mismatched.is_empty() {
        problems.push(format!("shape mismatch [{}]", mismatched.join(", ")));
    }
    Err(problems.join("; "))
}

/// 9クラス構成で期待されるパラメータ形状
///
/// Burnのレイアウト: Conv `[out, in, 3, 3]`、Linear `[in, out]`、bias `[out]`
pub fn expected_parameter_shapes() -> ParameterShapes {
    let mut shapes = ParameterShapes::new();

    for (i, pair) in FEATURE_CHANNELS.windows(2).enumerate() {
        let (c_in, c_out) = (pair[0], pair[1]);
        shapes.insert(format!("conv{}.weight", i + 1), vec![c_out, c_in, 3, 3]);
        shapes.insert(format!("conv{}.bias", i + 1), vec![c_out]);
    }
    shapes.insert("fc1.weight".to_string(), vec![FLATTENED_FEATURES, HIDDEN_UNITS]);
    shapes.insert("fc1.bias".to_string(), vec![HIDDEN_UNITS]);
    shapes.insert("fc2.weight".to_string(), vec![HIDDEN_UNITS, NUM_CLASSES]);
    shapes.insert("fc2.bias".to_string(), vec![NUM_CLASSES]);

    shapes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::CpuBackend;

    #[test]
    fn test_feature_dimensions() {
        assert_eq!(FEATURE_MAP_SIZE, 16);
        assert_eq!(FLATTENED_FEATURES, 32768);
    }

    #[test]
    fn test_class_names_are_one_based() {
        for (i, name) in CLASS_NAMES.iter().enumerate() {
            assert_eq!(*name, (i + 1).to_string());
        }
    }

    #[test]
    fn test_parameter_shapes_match_declared_architecture() {
        let device = Default::default();
        let model = ModelConfig::chromium().init::<CpuBackend>(&device);
        assert_eq!(model.parameter_shapes(), expected_parameter_shapes());
    }

    #[test]
    fn test_forward_output_shape() {
        let device = Default::default();
        let model = ModelConfig::chromium().init::<CpuBackend>(&device).eval();
        let images = Tensor::<CpuBackend, 4>::zeros([2, CHANNELS, IMAGE_SIZE, IMAGE_SIZE], &device);

        let output = model.forward(images);
        assert_eq!(output.dims(), [2, NUM_CLASSES]);
    }

    #[test]
    fn test_conv3x3_keeps_spatial_size() {
        let device = Default::default();
        let conv = conv3x3::<CpuBackend>([CHANNELS, 4], &device);
        let output = conv.forward(Tensor::zeros([1, CHANNELS, 7, 5], &device));
        assert_eq!(output.dims(), [1, 4, 7, 5]);
    }

    #[test]
    fn test_mode_switch() {
        let device = Default::default();
        let model = ModelConfig::chromium().init::<CpuBackend>(&device);
        assert!(model.is_training());

        let model = model.eval();
        assert!(!model.is_training());
        assert!(model.train().is_training());
    }

    #[test]
    fn test_record_shapes_follow_num_classes() {
        let device = Default::default();
        let record = ModelConfig::new(5).init::<CpuBackend>(&device).into_record();
        let shapes = record_parameter_shapes::<CpuBackend>(&record);

        assert_eq!(shapes["fc2.weight"], vec![HIDDEN_UNITS, 5]);
        assert_ne!(shapes, expected_parameter_shapes());
    }

    #[test]
    fn test_compare_shapes_reports_every_problem() {
        let expected = expected_parameter_shapes();
        let mut actual = expected.clone();
        actual.remove("conv1.bias");
        actual.insert("conv2.weight".to_string(), vec![1, 2, 3, 3]);
        actual.insert("extra".to_string(), vec![1]);

        let reason = compare_shapes(&expected, &actual).unwrap_err();
        assert!(reason.contains("conv1.bias"));
        assert!(reason.contains("conv2.weight"));
        assert!(reason.contains("extra"));
        assert!(compare_shapes(&expected, &expected).is_ok());
    }

    #[test]
    fn test_parameters_transfer_between_models() {
        let device = Default::default();
        let source = ModelConfig::chromium().init::<CpuBackend>(&device).eval();
        let tensors = source.parameter_tensors().unwrap();
        assert_eq!(tensors.len(), expected_parameter_shapes().len());

        let target = ModelConfig::chromium()
            .init::<CpuBackend>(&device)
            .with_parameters(&tensors, &device)
            .unwrap()
            .eval();
        assert_eq!(target.parameter_tensors().unwrap(), tensors);

        let images = Tensor::<CpuBackend, 4>::ones([1, CHANNELS, IMAGE_SIZE, IMAGE_SIZE], &device);
        let expected = source.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = target.forward(images).into_data().to_vec::<f32>().unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_with_parameters_rejects_bad_tensors() {
        let device = Default::default();
        let model = ModelConfig::chromium().init::<CpuBackend>(&device);
        let mut tensors = model.parameter_tensors().unwrap();

        let bias = tensors.get_mut("fc2.bias").unwrap();
        bias.values.pop();
        let reason = model
            .clone()
            .with_parameters(&tensors, &device)
            .unwrap_err();
        assert!(reason.contains("fc2.bias"));

        tensors.remove("fc2.bias");
        let reason = model.with_parameters(&tensors, &device).unwrap_err();
        assert!(reason.contains("missing parameters"));
    }
}
