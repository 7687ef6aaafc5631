//! 缓存构建.
//!
//! 缓存时, 样本索引被切成连续的若干段, 每段由一个 worker 依次加载, 最后按段的顺序拼接.
//! 每个样本的随机状态只由 `(seed, 索引)` 决定, 因此缓存内容与 worker 个数无关.

use std::ops::Range;

use super::DatasetResult;
use crate::transform::{random_state, RandomState};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use super::DatasetError;
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
        use rayon::ThreadPoolBuilder;
    }
}

/// 把 `0..n` 切成 `k` 段连续区间 (`k == 0` 视为 1).
///
/// 与 `numpy.array_split` 一致: 前 `n % k` 段比其余各段多一个元素, 段可以为空.
pub fn split_shards(n: usize, k: usize) -> Vec<Range<usize>> {
    let k = k.max(1);
    let (q, r) = (n / k, n % k);
    let mut start = 0;
    (0..k)
        .map(|i| {
            let len = q + usize::from(i < r);
            let shard = start..start + len;
            start += len;
            shard
        })
        .collect()
}

/// 第 `idx` 个样本在缓存时使用的随机状态.
#[inline]
pub(crate) fn sample_rng(seed: u64, idx: usize) -> RandomState {
    random_state(seed ^ (idx as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

type Shards<T> = Vec<Vec<T>>;

#[cfg(feature = "rayon")]
fn run_shards<T, F>(shards: Vec<Range<usize>>, pooling: usize, load: &F) -> DatasetResult<Shards<T>>
where
    T: Send,
    F: Fn(usize) -> DatasetResult<T> + Sync,
{
    let run = |r: Range<usize>| r.map(load).collect::<DatasetResult<Vec<T>>>();
    if pooling == 0 {
        return shards.into_iter().map(run).collect();
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(pooling)
        .thread_name(|i| format!("cache-worker-{i}"))
        .build()
        .map_err(|e| DatasetError::WorkerPool(e.to_string()))?;
    pool.install(|| shards.into_par_iter().map(run).collect())
}

#[cfg(not(feature = "rayon"))]
fn run_shards<T, F>(shards: Vec<Range<usize>>, _pooling: usize, load: &F) -> DatasetResult<Shards<T>>
where
    T: Send,
    F: Fn(usize) -> DatasetResult<T> + Sync,
{
    shards
        .into_iter()
        .map(|r| r.map(load).collect::<DatasetResult<Vec<T>>>())
        .collect()
}

/// 依次对 `0..n` 调用 `load`, 结果按索引顺序返回.
///
/// `pooling > 0` 时在专用的 `pooling` 个线程上并行执行 (需要 `rayon` feature,
/// 否则退化为顺序执行). 任意一个样本失败都会使整个构建失败.
pub(crate) fn build_cache<T, F>(n: usize, pooling: usize, load: F) -> DatasetResult<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> DatasetResult<T> + Sync,
{
    let shards = split_shards(n, pooling);
    log::debug!("caching {n} samples in {} shard(s)", shards.len());
    let parts = run_shards(shards, pooling, &load)?;
    Ok(parts.into_iter().flatten().collect())
}
