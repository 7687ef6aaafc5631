//! 把预测结果还原到原始几何.

use super::resize::{pad_or_crop, InterpMode, PadMode};
use super::spacing::resample;
use super::{TransformError, TransformResult};
use crate::{Volume, VolumeMeta};

/// 将 `volume` 重采样回加载时的体素分辨率, 再以 0 填充 pad / 居中 crop 到加载时的空间形状.
///
/// 典型用法是把在 [`TARGET_PIXEL_DIM`](crate::consts::TARGET_PIXEL_DIM) 上得到的预测
/// 还原成与原始 nifti 逐体素对应的结果.
pub fn restore_original(volume: &Volume) -> TransformResult<Volume> {
    let meta = volume.meta();
    let valid = |d: &[f64; 3]| d.iter().all(|v| v.is_finite() && *v > 0.0);
    if !valid(&meta.pix_dim) || !valid(&meta.original_pix_dim) {
        return Err(TransformError::InvalidArgument(
            "volume metadata holds a non-positive pix_dim",
        ));
    }
    let (z, y, x) = meta.original_shape;
    if z == 0 || y == 0 || x == 0 {
        return Err(TransformError::InvalidArgument(
            "volume metadata holds an empty original shape",
        ));
    }

    let data = resample(
        volume.data(),
        meta.pix_dim,
        meta.original_pix_dim,
        InterpMode::Trilinear,
    );
    let data = pad_or_crop(data.view(), meta.original_shape, PadMode::Constant);
    log::trace!("restored volume to {:?}", meta.original_shape);
    Ok(Volume::new(
        data,
        VolumeMeta::new(meta.original_pix_dim, meta.original_shape),
    ))
}
