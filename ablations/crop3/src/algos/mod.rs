mod profile;

use mip_berry::prelude::*;
use mip_berry::transform::crop::{PositiveBiasedCenter, TruncatedGaussianCenter, UniformCenter};
use mip_berry::transform::TransformResult;

pub use profile::{Profile, BINS};

/// 一次实验的公共参数.
#[derive(Clone, Copy, Debug)]
pub struct Setting {
    /// patch 大小.
    pub crop: CropSpec,

    /// 每个标注上的采样次数.
    pub draws: usize,

    /// 随机种子.
    pub seed: u64,
}

/// 标注在 `pos` 处是否有任一通道为正.
fn is_positive(mask: &Volume, (z, y, x): Idx3d) -> bool {
    (0..mask.channels()).any(|c| mask[(c, z, y, x)] > 0.0)
}

/// 在每个标注上调用 `sample` 共 `setting.draws` 次, 并统计结果.
fn run_with<F>(masks: &[Volume], setting: &Setting, mut sample: F) -> TransformResult<Profile>
where
    F: FnMut(&Volume, &mut RandomState) -> TransformResult<(Idx3d, Option<CenterSource>)>,
{
    let mut profile = Profile::new();
    let mut rng = random_state(setting.seed);
    for mask in masks {
        let bounds = setting.crop.center_bounds(mask.shape())?;
        for _ in 0..setting.draws {
            profile.sample_start();
            let (center, source) = sample(mask, &mut rng)?;
            profile.sample_elapsed();
            profile.record(center, bounds, is_positive(mask, center), source);
        }
    }
    Ok(profile.finish())
}

pub fn gaussian(masks: &[Volume], setting: &Setting) -> TransformResult<Profile> {
    let sampler = TruncatedGaussianCenter::new(setting.crop, GOOD_SIGMA_RATIO)?;
    run_with(masks, setting, |m, rng| {
        Ok((sampler.sample_center(m.shape(), rng)?, None))
    })
}

pub fn positive(masks: &[Volume], setting: &Setting) -> TransformResult<Profile> {
    let sampler = PositiveBiasedCenter::new(setting.crop, POS_CENTER_PROB)?;
    run_with(masks, setting, |m, rng| {
        let (center, source) = sampler.sample_center(m.data(), rng)?;
        Ok((center, Some(source)))
    })
}

pub fn uniform(masks: &[Volume], setting: &Setting) -> TransformResult<Profile> {
    let sampler = UniformCenter::new(setting.crop);
    run_with(masks, setting, |m, rng| {
        Ok((sampler.sample_center(m.shape(), rng)?, None))
    })
}
