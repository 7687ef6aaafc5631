//! 实验结果.

use crate::algos::{Profile, BINS};
use mip_berry::transform::TransformResult;
use std::io::{self, Write};

const AXES: [&str; 3] = ["z", "y", "x"];

/// 将 `profile` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &Profile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn f64_to_display(f: Option<f64>) -> String {
        match f {
            Some(f) => format!("{f:.4}"),
            None => "/".to_string(),
        }
    }

    writeln!(w, "Profile `{name}`:")?;
    writeln!(w, "{S4}Draws: {}", p.get_draws())?;
    writeln!(w, "{S4}Centered on positive voxel: {}", f64_to_display(p.get_hit_rate()))?;
    let [pos, uni, fallback] = p.get_sources();
    if pos + uni + fallback > 0 {
        writeln!(w, "{S4}Sources: positive {pos}, uniform {uni}, fallback {fallback}")?;
    }
    writeln!(w, "{S4}Sampling time: {} us", p.get_sample_time_us())?;
    writeln!(w, "{S4}Total machine time: {} us", p.get_real_time_us())?;

    for (a, axis) in AXES.iter().enumerate() {
        let (mean, std) = match p.get_moments(a) {
            Some((m, s)) => (Some(m), Some(s)),
            None => (None, None),
        };
        writeln!(
            w,
            "{S4}Axis {axis}: relative mean {}, std {}",
            f64_to_display(mean),
            f64_to_display(std)
        )?;
        let hist = p.get_hist(a);
        let max = hist.iter().copied().max().unwrap_or(0);
        for (b, cnt) in hist.iter().enumerate() {
            let lo = b as f64 / BINS as f64;
            writeln!(w, "{S4}{S4}[{lo:.1}, {:.1}) {:>8} {}", lo + 0.1, cnt, utils::bar(*cnt, max, 40))?;
        }
    }
    Ok(())
}

/// 消融实验最终结果.
pub struct AblationResult {
    data: Vec<(&'static str, TransformResult<Profile>)>,
}

impl AblationResult {
    pub fn from_iter<I: IntoIterator<Item = (&'static str, TransformResult<Profile>)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 分析运行结果.
    pub fn analyze(&self) -> io::Result<()> {
        let mut out = io::stdout().lock();
        utils::sep_to(&mut out)?;
        for (key, profile) in self.data.iter() {
            match profile {
                Ok(p) => describe_into(key, p, &mut out)?,
                Err(e) => writeln!(out, "Profile `{key}` failed: {e}")?,
            }
            utils::sep_to(&mut out)?;
        }
        Ok(())
    }
}
