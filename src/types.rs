use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::ml::{CHANNELS, IMAGE_SIZE, NUM_CLASSES};

/// 前処理済み画像 (C, H, W)
///
/// リクエストごとに生成され、順伝播の後に破棄されます。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    shape: [usize; 3],
}

impl ImageTensor {
    /// モデルが受け付ける形状
    pub const SHAPE: [usize; 3] = [CHANNELS, IMAGE_SIZE, IMAGE_SIZE];

    /// チャネル優先で平坦化されたデータから作成
    pub fn new(data: Vec<f32>, shape: [usize; 3]) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(ClassifierError::InvalidLength {
                shape: shape.to_vec(),
                expected: expected_len,
                actual: data.len(),
            });
        }
        Ok(Self { data, shape })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// クラスごとのロジット（softmax前）
///
/// インデックス i はクラス "i+1" に対応します。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreVector(pub [f32; NUM_CLASSES]);

impl ScoreVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl TryFrom<Vec<f32>> for ScoreVector {
    type Error = ClassifierError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        let actual = values.len();
        let scores: [f32; NUM_CLASSES] =
            values
                .try_into()
                .map_err(|_| ClassifierError::InvalidLength {
                    shape: vec![NUM_CLASSES],
                    expected: NUM_CLASSES,
                    actual,
                })?;
        Ok(Self(scores))
    }
}

/// 1回の分類結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub scores: ScoreVector,
}

impl std::fmt::Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tensor_rejects_wrong_length() {
        match ImageTensor::new(vec![0.0; 10], [3, 2, 2]) {
            Err(ClassifierError::InvalidLength {
                shape,
                expected,
                actual,
            }) => {
                assert_eq!(shape, vec![3, 2, 2]);
                assert_eq!(expected, 12);
                assert_eq!(actual, 10);
            }
            other => panic!("expected InvalidLength, got {other:?}"),
        }
    }

    #[test]
    fn test_score_vector_from_vec() {
        let scores = ScoreVector::try_from(vec![0.5; NUM_CLASSES]).unwrap();
        assert_eq!(scores.as_slice().len(), NUM_CLASSES);

        let short = ScoreVector::try_from(vec![0.5; NUM_CLASSES - 1]);
        assert!(matches!(
            short,
            Err(ClassifierError::InvalidLength { actual: 8, .. })
        ));
    }
}
