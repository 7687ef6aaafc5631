//! 按名字组装变换流水线.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::crop::{CropSpec, PositiveBiasedRandomCrop, RandSpatialCrop, TruncatedGaussianRandomCrop};
use super::{
    Compose, InterpMode, KeySet, PadMode, Resize, ResizeWithPadOrCrop, ScaleIntensity, Spacing,
    TransformError, TransformResult,
};
use crate::consts::{KEY_IMAGE, KEY_MASK};
use crate::Idx3d;

/// 流水线种类.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TransformType {
    /// 默认流程后插值缩放到 `size`.
    Resize,

    /// 默认流程后截断高斯随机裁剪.
    PatchCenterGaussian,

    /// 默认流程后正样本偏置随机裁剪.
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "patch_pos"))]
    PatchPosCenter,

    /// 默认流程后均匀随机裁剪.
    PatchUniform,

    /// 只有默认流程.
    Std,

    /// 不做任何变换.
    #[cfg_attr(feature = "serde", serde(rename = "totensor"))]
    ToTensor,
}

fn both_keys() -> KeySet {
    KeySet::new([KEY_IMAGE, KEY_MASK])
}

/// 默认流程: 重采样 → 强度缩放到 `[0, 1]` → 边缘 pad / 居中 crop 到统一画布.
fn default_stages(target_pixel_dim: [f64; 3], target_spatial_size: Idx3d) -> TransformResult<Compose> {
    let mut t = Compose::identity();
    t.push(Spacing::new(
        both_keys(),
        target_pixel_dim,
        &[InterpMode::Trilinear, InterpMode::Nearest],
    )?);
    t.push(ScaleIntensity::new(KeySet::new([KEY_IMAGE]), 0.0, 1.0)?);
    t.push(ResizeWithPadOrCrop::new(
        both_keys(),
        target_spatial_size,
        PadMode::Edge,
    )?);
    Ok(t)
}

/// 构造 `transform_type` 对应的变换流水线.
///
/// `size` 对缩放是目标大小, 对裁剪是 patch 大小; 其余种类忽略它.
pub fn get_transform(
    transform_type: TransformType,
    size: Idx3d,
    target_pixel_dim: [f64; 3],
    target_spatial_size: Idx3d,
    sigma_ratio: f64,
    pos_center_prob: f64,
) -> TransformResult<Compose> {
    if transform_type == TransformType::ToTensor {
        return Ok(Compose::identity());
    }
    let crop = || CropSpec::new(size).ok_or(TransformError::InvalidArgument("patch size must be positive"));

    let mut t = default_stages(target_pixel_dim, target_spatial_size)?;
    match transform_type {
        TransformType::Resize => t.push(Resize::new(
            both_keys(),
            size,
            &[InterpMode::Trilinear, InterpMode::Nearest],
        )?),
        TransformType::PatchCenterGaussian => t.push(TruncatedGaussianRandomCrop::new(
            both_keys(),
            crop()?,
            sigma_ratio,
        )?),
        TransformType::PatchPosCenter => t.push(PositiveBiasedRandomCrop::new(
            both_keys(),
            KEY_MASK,
            crop()?,
            pos_center_prob,
        )?),
        TransformType::PatchUniform => t.push(RandSpatialCrop::new(both_keys(), crop()?)),
        TransformType::Std | TransformType::ToTensor => {}
    }
    log::debug!("{transform_type:?} pipeline with {} stage(s)", t.len());
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::{get_transform, TransformType};
    use crate::consts::{GOOD_SIGMA_RATIO, KEY_IMAGE, KEY_MASK, POS_CENTER_PROB};
    use crate::transform::random_state;
    use crate::{Sample, Volume, VolumeMeta};
    use ndarray::Array4;

    fn sample() -> Sample {
        let image = Array4::from_shape_fn((1, 10, 12, 12), |(_, z, y, x)| (z * y + x) as f32 - 20.0);
        let mut mask = Array4::zeros((1, 10, 12, 12));
        mask[(0, 5, 6, 6)] = 1.0;
        let meta = VolumeMeta::new([1.0; 3], (10, 12, 12));
        Sample::from_pair(Volume::new(image, meta), Volume::new(mask, meta))
    }

    fn build(t: TransformType) -> crate::transform::Compose {
        get_transform(t, (4, 4, 4), [1.0; 3], (8, 8, 8), GOOD_SIGMA_RATIO, POS_CENTER_PROB).unwrap()
    }

    #[test]
    fn test_stage_counts() {
        assert!(build(TransformType::ToTensor).is_empty());
        assert_eq!(build(TransformType::Std).len(), 3);
        assert_eq!(build(TransformType::Resize).len(), 4);
        assert_eq!(build(TransformType::PatchUniform).len(), 4);
    }

    #[test]
    fn test_pipelines_output_shapes() {
        let mut rng = random_state(1);
        for (t, shape) in [
            (TransformType::Std, (8, 8, 8)),
            (TransformType::Resize, (4, 4, 4)),
            (TransformType::PatchCenterGaussian, (4, 4, 4)),
            (TransformType::PatchPosCenter, (4, 4, 4)),
            (TransformType::PatchUniform, (4, 4, 4)),
            (TransformType::ToTensor, (10, 12, 12)),
        ] {
            let mut s = sample();
            build(t).apply(&mut s, &mut rng).unwrap();
            assert_eq!(s.get(KEY_IMAGE).unwrap().shape(), shape, "{t:?}");
            assert_eq!(s.get(KEY_MASK).unwrap().shape(), shape, "{t:?}");
        }
    }

    #[test]
    fn test_std_scales_image_only() {
        let mut s = sample();
        build(TransformType::Std).apply(&mut s, &mut random_state(0)).unwrap();
        let image = s.get(KEY_IMAGE).unwrap();
        assert!(image.data().iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(s.get(KEY_MASK).unwrap().count_positive(), 1);
    }

    #[test]
    fn test_bad_patch_size() {
        assert!(get_transform(TransformType::PatchUniform, (0, 4, 4), [1.0; 3], (8, 8, 8), 0.1, 0.5).is_err());
    }
}
