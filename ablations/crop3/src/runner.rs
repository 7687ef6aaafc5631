//! 程序运行函数.

use crate::algos::{self, Profile, Setting};
use crate::result::AblationResult;
use mip_berry::prelude::*;
use mip_berry::transform::TransformResult;
use std::thread;
use synthetic::synthetic_masks;
use utils::loader;

/// 最多使用的标注个数.
const MAX_MASKS: usize = 16;

/// 每个标注上的采样次数.
const DRAWS: usize = 2000;

/// patch 边长.
const PATCH_LEN: usize = 32;

type Sampler = fn(&[Volume], &Setting) -> TransformResult<Profile>;

/// 参与比较的采样器, 结果按此顺序输出.
const SAMPLERS: [(&str, Sampler); 3] = [
    ("gaussian", algos::gaussian),
    ("positive", algos::positive),
    ("uniform", algos::uniform),
];

/// 工作线程数: 不超过核心数, 也不超过采样器个数.
fn worker_count(cpus: usize) -> usize {
    cpus.clamp(1, SAMPLERS.len())
}

/// 用 `workers` 个线程轮流运行所有采样器.
fn run_samplers(
    masks: &[Volume],
    setting: &Setting,
    workers: usize,
) -> Vec<(&'static str, TransformResult<Profile>)> {
    let mut results = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                s.spawn(move || {
                    SAMPLERS
                        .iter()
                        .enumerate()
                        .skip(w)
                        .step_by(workers)
                        .map(|(i, (name, t))| (i, *name, t(masks, setting)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|th| th.join().expect("Thread joining error"))
            .collect::<Vec<_>>()
    });
    results.sort_by_key(|(i, ..)| *i);
    results.into_iter().map(|(_, name, p)| (name, p)).collect()
}

/// 合成标注, 用于找不到数据集时.
mod synthetic {
    use mip_berry::{Volume, VolumeMeta};

    const SHAPE: (usize, usize, usize) = (48, 80, 80);

    fn from_fn<F: Fn(usize, usize, usize) -> bool>(f: F) -> Volume {
        let (d, h, w) = SHAPE;
        let mut v = Volume::new(
            ndarray::Array4::zeros((1, d, h, w)),
            VolumeMeta::unit(SHAPE),
        );
        for z in 0..d {
            for y in 0..h {
                for x in 0..w {
                    if f(z, y, x) {
                        v[(0, z, y, x)] = 1.0;
                    }
                }
            }
        }
        v
    }

    /// 一条偏离中心的 "血管", 一个位于角落 (不在合法中心范围内) 的小块, 以及一个空标注.
    pub fn synthetic_masks() -> Vec<Volume> {
        let tube = from_fn(|z, y, _| {
            let (dz, dy) = (z as f64 - 20.0, y as f64 - 28.0);
            dz * dz + dy * dy <= 9.0
        });
        let corner = from_fn(|z, y, x| z < 3 && y < 3 && x < 3);
        let empty = from_fn(|_, _, _| false);
        vec![tube, corner, empty]
    }
}

/// 找到可用的标注. 优先从 `$MIP_MASK_DIR` 或 `$HOME/dataset/training_data` 加载.
fn load_masks(crop: &CropSpec) -> Vec<Volume> {
    let Some(dir) = loader::mask_dir_from_env_or_home().filter(|d| d.is_dir()) else {
        log::info!("no mask directory found, using synthetic masks");
        return synthetic_masks();
    };
    let loaded = match loader::mask_loader(&dir) {
        Ok(it) => it
            .take(MAX_MASKS)
            .filter_map(|(i, r)| match r {
                Ok(v) => Some(v),
                Err(e) => {
                    log::warn!("skipping mask #{i}: {e}");
                    None
                }
            })
            .filter(|v| crop.check(v.shape()).is_ok())
            .collect::<Vec<_>>(),
        Err(e) => {
            log::warn!("cannot list {dir:?}: {e}");
            Vec::new()
        }
    };
    if loaded.is_empty() {
        log::info!("no usable mask in {dir:?}, using synthetic masks");
        return synthetic_masks();
    }
    log::info!("loaded {} mask(s) from {dir:?}", loaded.len());
    loaded
}

/// 实际运行.
pub fn run() -> AblationResult {
    let setting = Setting {
        crop: CropSpec::cube(PATCH_LEN).expect("patch length must be positive"),
        draws: DRAWS,
        seed: 0,
    };
    let masks = load_masks(&setting.crop);
    let masks = masks.as_slice();
    let workers = worker_count(utils::cpus());
    println!(
        "Running crop ablation on {} mask(s) with {workers} worker(s)...",
        masks.len()
    );
    AblationResult::from_iter(run_samplers(masks, &setting, workers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(0), 1);
        assert_eq!(worker_count(2), 2);
        assert_eq!(worker_count(64), 3);
    }

    #[test]
    fn test_results_keep_sampler_order() {
        let setting = Setting {
            crop: CropSpec::cube(8).unwrap(),
            draws: 20,
            seed: 1,
        };
        let masks = synthetic_masks();
        let draws = |workers| {
            run_samplers(&masks, &setting, workers)
                .into_iter()
                .map(|(name, p)| (name, p.unwrap().get_draws()))
                .collect::<Vec<_>>()
        };
        let one = draws(1);
        assert_eq!(
            one.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            ["gaussian", "positive", "uniform"]
        );
        assert_eq!(one, draws(2));
        assert_eq!(one, draws(3));
    }
}
