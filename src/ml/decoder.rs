//! 推論結果（ロジット）からクラスラベルへの変換

use crate::ml::CLASS_NAMES;
use crate::types::{Prediction, ScoreVector};

/// 最大値のインデックス
///
/// - 同値の場合は最も小さいインデックスを返す
/// - NaN は選ばれない。全要素が NaN（または空）の場合は 0 を返す
pub fn argmax(scores: &[f32]) -> usize {
    let mut best: Option<(usize, f32)> = None;

    for (index, &value) in scores.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((index, value)),
        }
    }

    best.map(|(index, _)| index).unwrap_or(0)
}

/// クラスインデックスからラベルを取得
pub fn class_index_to_label(index: usize) -> Option<&'static str> {
    CLASS_NAMES.get(index).copied()
}

/// ロジットを分類結果に変換
pub fn decode(scores: ScoreVector) -> Prediction {
    let class_index = argmax(scores.as_slice());
    // ScoreVector は常に NUM_CLASSES 要素なので範囲内
    let label = CLASS_NAMES[class_index].to_string();

    Prediction {
        class_index,
        label,
        scores,
    }
}
