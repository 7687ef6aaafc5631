//! 消融实验依赖的通用组件.

pub mod loader;

const SEP: &str = "--------------------------------------------------------";

/// 简单分隔线.
#[inline]
pub fn sep() {
    println!("{SEP}");
}

/// 简单分隔线.
#[inline]
pub fn sep_to<W: std::io::Write>(mut w: W) -> std::io::Result<()> {
    writeln!(&mut w, "{SEP}")
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 用 `#` 画出长度与 `v / max` 成比例的横条, 最长 `width`.
pub fn bar(v: u64, max: u64, width: usize) -> String {
    if max == 0 {
        return String::new();
    }
    let n = (v as f64 / max as f64 * width as f64).round() as usize;
    "#".repeat(n.min(width))
}
