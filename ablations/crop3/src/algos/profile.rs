//! 采样统计.

use mip_berry::prelude::*;
use std::time::{Duration, Instant};

/// 每个轴上直方图的桶数.
pub const BINS: usize = 10;

/// ablation/benchmark 计时器.
///
/// 该计时器支持 "中途中断" 与 "结束中断, 继续开始计时".
#[derive(Clone, Debug)]
struct AccTimer {
    consumed: Duration,
    since: Instant,
}

impl AccTimer {
    /// 初始化计时器. 初始化时会视为已经开始计时.
    #[inline]
    fn new() -> Self {
        Self {
            consumed: Duration::ZERO,
            since: Instant::now(),
        }
    }

    #[inline]
    fn start(&mut self) {
        self.since = Instant::now();
    }

    /// 结束计时, 并将这一区间的时间累加.
    ///
    /// # 注意
    ///
    /// 上一次调用必须是 `self.start()`, 否则计算时间值无意义.
    #[inline]
    fn elapsed(&mut self) {
        self.consumed += self.since.elapsed();
    }

    #[inline]
    fn get_total_us(&self) -> u64 {
        self.consumed.as_micros() as u64
    }
}

/// 单个采样器在所有标注上的统计.
#[derive(Clone, Debug)]
pub struct Profile {
    /// 采样次数.
    draws: u64,

    /// 中心落在正体素上的次数.
    hits: u64,

    /// 各来源的次数: `[Positive, Uniform, Fallback]`.
    sources: [u64; 3],

    /// 每个轴上, 中心在合法范围内的相对位置之和与平方和.
    sum: [f64; 3],
    sum_sq: [f64; 3],

    /// 每个轴上相对位置的直方图.
    hist: [[u64; BINS]; 3],

    /// 采样花费的时间.
    sample_time: AccTimer,

    /// 整个任务花费的时间.
    real_time: AccTimer,
}

impl Profile {
    /// 初始化.
    pub fn new() -> Self {
        Self {
            draws: 0,
            hits: 0,
            sources: [0; 3],
            sum: [0.0; 3],
            sum_sq: [0.0; 3],
            hist: [[0; BINS]; 3],
            sample_time: AccTimer::new(),
            real_time: AccTimer::new(),
        }
    }

    /// 开始一次采样计时.
    #[inline]
    pub fn sample_start(&mut self) {
        self.sample_time.start();
    }

    /// 结束一次采样计时.
    #[inline]
    pub fn sample_elapsed(&mut self) {
        self.sample_time.elapsed();
    }

    /// 记录一次采样结果.
    ///
    /// `bounds` 为各轴合法中心范围, `hit` 表示中心是否落在正体素上.
    pub fn record(&mut self, center: Idx3d, bounds: [(usize, usize); 3], hit: bool, source: Option<CenterSource>) {
        self.draws += 1;
        self.hits += u64::from(hit);
        if let Some(s) = source {
            let k = match s {
                CenterSource::Positive => 0,
                CenterSource::Uniform => 1,
                CenterSource::Fallback => 2,
            };
            self.sources[k] += 1;
        }

        let c = [center.0, center.1, center.2];
        for a in 0..3 {
            let (lo, hi) = bounds[a];
            let r = if hi > lo {
                (c[a] - lo) as f64 / (hi - lo) as f64
            } else {
                0.5
            };
            self.sum[a] += r;
            self.sum_sq[a] += r * r;
            let bin = ((r * BINS as f64) as usize).min(BINS - 1);
            self.hist[a][bin] += 1;
        }
    }

    /// 结束全部计时.
    #[inline]
    pub fn finish(mut self) -> Self {
        self.real_time.elapsed();
        self
    }

    /// 采样次数.
    #[inline]
    pub fn get_draws(&self) -> u64 {
        self.draws
    }

    /// 中心落在正体素上的比例.
    pub fn get_hit_rate(&self) -> Option<f64> {
        match self.draws {
            0 => None,
            n => Some(self.hits as f64 / n as f64),
        }
    }

    /// 各来源的次数: `[Positive, Uniform, Fallback]`. 只有正样本偏置采样器会记录.
    #[inline]
    pub fn get_sources(&self) -> [u64; 3] {
        self.sources
    }

    /// 轴 `a` 上相对位置的均值与标准差.
    pub fn get_moments(&self, a: usize) -> Option<(f64, f64)> {
        if self.draws == 0 {
            return None;
        }
        let n = self.draws as f64;
        let mean = self.sum[a] / n;
        let var = (self.sum_sq[a] / n - mean * mean).max(0.0);
        Some((mean, var.sqrt()))
    }

    /// 轴 `a` 上的直方图.
    #[inline]
    pub fn get_hist(&self, a: usize) -> &[u64; BINS] {
        &self.hist[a]
    }

    /// 以微秒为单位获得采样的总花费时间.
    #[inline]
    pub fn get_sample_time_us(&self) -> u64 {
        self.sample_time.get_total_us()
    }

    /// 以微秒为单位获得任务的总时间.
    #[inline]
    pub fn get_real_time_us(&self) -> u64 {
        self.real_time.get_total_us()
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::new()
    }
}
