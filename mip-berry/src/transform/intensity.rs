//! 强度缩放.

use super::{KeySet, MapTransform, RandomState, TransformError, TransformResult};
use crate::Sample;

/// 将体素值线性缩放到 `[minv, maxv]`.
///
/// 如果输入是常数 (最大值等于最小值), 则所有体素被置为 `minv`.
/// 非有限值 (NaN, inf) 不参与最值统计.
#[derive(Debug, Clone)]
pub struct ScaleIntensity {
    keys: KeySet,
    minv: f32,
    maxv: f32,
}

impl ScaleIntensity {
    /// 创建变换. 要求 `minv <= maxv`.
    pub fn new(keys: KeySet, minv: f32, maxv: f32) -> TransformResult<Self> {
        if !(minv <= maxv) {
            return Err(TransformError::InvalidArgument("minv must not exceed maxv"));
        }
        Ok(Self { keys, minv, maxv })
    }
}

impl MapTransform for ScaleIntensity {
    fn keys(&self) -> &KeySet {
        &self.keys
    }

    fn apply(&self, sample: &mut Sample, _: &mut RandomState) -> TransformResult<()> {
        for key in self.keys.present(sample)? {
            let Some(v) = sample.get_mut(&key) else {
                continue;
            };
            let (lo, hi) = v
                .data()
                .iter()
                .filter(|p| p.is_finite())
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &p| {
                    (lo.min(p), hi.max(p))
                });
            if lo > hi {
                // 空数据或全部非有限值.
                continue;
            }

            let (minv, maxv) = (self.minv, self.maxv);
            let mut data = v.data_mut();
            if hi == lo {
                data.fill(minv);
            } else {
                let scale = (maxv - minv) / (hi - lo);
                data.mapv_inplace(|p| (p - lo) * scale + minv);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ScaleIntensity;
    use crate::consts::KEY_IMAGE;
    use crate::transform::{random_state, KeySet, MapTransform};
    use crate::{Sample, Volume};
    use ndarray::Array4;

    fn run(values: Vec<f32>) -> Vec<f32> {
        let n = values.len();
        let mut s = Sample::new();
        s.insert(
            KEY_IMAGE,
            Volume::from_array(Array4::from_shape_vec((1, 1, 1, n), values).unwrap()),
        );
        ScaleIntensity::new(KeySet::new([KEY_IMAGE]), 0.0, 1.0)
            .unwrap()
            .apply(&mut s, &mut random_state(0))
            .unwrap();
        s.get(KEY_IMAGE).unwrap().data().iter().copied().collect()
    }

    #[test]
    fn test_scale_intensity() {
        assert_eq!(run(vec![-100.0, 0.0, 100.0]), vec![0.0, 0.5, 1.0]);
        assert_eq!(run(vec![7.0, 7.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_scale_intensity_invalid_range() {
        assert!(ScaleIntensity::new(KeySet::new([KEY_IMAGE]), 1.0, 0.0).is_err());
        assert!(ScaleIntensity::new(KeySet::new([KEY_IMAGE]), f32::NAN, 0.0).is_err());
    }
}
