//! 映射变换 (map transform).
//!
//! 每个变换持有一组键 [`KeySet`], 只作用于 [`Sample`] 中这些键对应的体数据.
//! 需要随机性的变换从调用方显式传入的 [`RandomState`] 取随机数.

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::{Idx3d, Sample};

pub mod crop;
mod intensity;
pub mod pipeline;
mod resize;
mod restore;
mod spacing;

pub use crop::{
    extract_patch, CenterSource, CropSpec, PositiveBiasedRandomCrop, RandSpatialCrop,
    TruncatedGaussianRandomCrop,
};
pub use intensity::ScaleIntensity;
pub use pipeline::{get_transform, TransformType};
pub use resize::{InterpMode, PadMode, Resize, ResizeWithPadOrCrop};
pub use restore::restore_original;
pub use spacing::Spacing;

/// 所有随机变换共用的随机状态.
pub type RandomState = StdRng;

/// 由种子创建随机状态.
#[inline]
pub fn random_state(seed: u64) -> RandomState {
    StdRng::seed_from_u64(seed)
}

/// 变换运行时错误.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// 样本中缺少必要的键.
    #[error("keys {0:?} not found in sample")]
    MissingKeys(Vec<String>),

    /// 裁剪大小超出了体数据空间形状.
    #[error("roi size {roi:?} exceeds spatial shape {shape:?}")]
    RoiTooLarge {
        /// 裁剪大小.
        roi: Idx3d,
        /// 体数据空间形状.
        shape: Idx3d,
    },

    /// 同一次变换中, 各个键的空间形状不一致.
    #[error("spatial shape {found:?} of `{key}` differs from {expected:?}")]
    ShapeMismatch {
        /// 出问题的键.
        key: String,
        /// 期望形状.
        expected: Idx3d,
        /// 实际形状.
        found: Idx3d,
    },

    /// 参数不合法.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// 变换结果.
pub type TransformResult<T> = Result<T, TransformError>;

/// 变换作用的键集合.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    keys: Vec<String>,
    allow_missing_keys: bool,
}

impl KeySet {
    /// 由键列表创建. 缺失任一键都视为错误.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            allow_missing_keys: false,
        }
    }

    /// 设置是否允许样本中缺失部分键.
    #[inline]
    pub fn allow_missing_keys(mut self, allow: bool) -> Self {
        self.allow_missing_keys = allow;
        self
    }

    /// 获取全部键.
    #[inline]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// 检查 `sample` 是否包含所有键. 若允许缺失, 则总是成功.
    pub fn check(&self, sample: &Sample) -> TransformResult<()> {
        if self.allow_missing_keys {
            return Ok(());
        }
        let missing: Vec<String> = self
            .keys
            .iter()
            .filter(|k| !sample.contains(k))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TransformError::MissingKeys(missing))
        }
    }

    /// 检查后, 按声明顺序返回 `sample` 中实际存在的键.
    pub fn present(&self, sample: &Sample) -> TransformResult<Vec<String>> {
        self.check(sample)?;
        Ok(self
            .keys
            .iter()
            .filter(|k| sample.contains(k))
            .cloned()
            .collect())
    }

    /// 检查实际存在的键的空间形状是否一致, 返回该形状.
    /// 若没有任何键存在, 返回 `None`.
    pub fn common_shape(&self, sample: &Sample) -> TransformResult<Option<Idx3d>> {
        let mut expected = None;
        for key in self.present(sample)? {
            // `present` 保证该键存在.
            let Some(found) = sample.get(&key).map(|v| v.shape()) else {
                continue;
            };
            match expected {
                None => expected = Some(found),
                Some(e) if e != found => {
                    return Err(TransformError::ShapeMismatch {
                        key,
                        expected: e,
                        found,
                    })
                }
                _ => {}
            }
        }
        Ok(expected)
    }
}

/// 作用于 [`Sample`] 的映射变换.
pub trait MapTransform: Send + Sync {
    /// 作用的键集合.
    fn keys(&self) -> &KeySet;

    /// 就地变换 `sample`. 确定性变换会忽略 `rng`.
    fn apply(&self, sample: &mut Sample, rng: &mut RandomState) -> TransformResult<()>;
}

/// 变换的顺序组合.
#[derive(Default)]
pub struct Compose {
    stages: Vec<Box<dyn MapTransform>>,
}

impl Compose {
    /// 由变换列表创建.
    #[inline]
    pub fn new(stages: Vec<Box<dyn MapTransform>>) -> Self {
        Self { stages }
    }

    /// 不做任何事的组合.
    #[inline]
    pub fn identity() -> Self {
        Self::default()
    }

    /// 在末尾追加一个变换.
    #[inline]
    pub fn push<T: MapTransform + 'static>(&mut self, t: T) {
        self.stages.push(Box::new(t));
    }

    /// 变换个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// 是否不含任何变换.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 依次执行所有变换. 任一变换失败则立即返回.
    pub fn apply(&self, sample: &mut Sample, rng: &mut RandomState) -> TransformResult<()> {
        for t in self.stages.iter() {
            t.apply(sample, rng)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Compose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compose")
            .field("stages", &self.stages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{KeySet, TransformError};
    use crate::consts::{KEY_IMAGE, KEY_MASK};
    use crate::{Sample, Volume};
    use ndarray::Array4;

    fn sample(mask_shape: (usize, usize, usize)) -> Sample {
        let (z, y, x) = mask_shape;
        Sample::from_pair(
            Volume::from_array(Array4::zeros((1, 4, 4, 4))),
            Volume::from_array(Array4::zeros((1, z, y, x))),
        )
    }

    #[test]
    fn test_missing_keys() {
        let mut s = sample((4, 4, 4));
        s.remove(KEY_MASK);

        let keys = KeySet::new([KEY_IMAGE, KEY_MASK]);
        assert_eq!(
            keys.check(&s),
            Err(TransformError::MissingKeys(vec![KEY_MASK.to_string()]))
        );

        let keys = keys.allow_missing_keys(true);
        assert_eq!(keys.present(&s).unwrap(), vec![KEY_IMAGE.to_string()]);
    }

    #[test]
    fn test_common_shape() {
        let keys = KeySet::new([KEY_IMAGE, KEY_MASK]);
        assert_eq!(keys.common_shape(&sample((4, 4, 4))), Ok(Some((4, 4, 4))));
        assert!(matches!(
            keys.common_shape(&sample((4, 4, 3))),
            Err(TransformError::ShapeMismatch { .. })
        ));

        let keys = KeySet::new(["nothing"]).allow_missing_keys(true);
        assert_eq!(keys.common_shape(&sample((4, 4, 4))), Ok(None));
    }
}
