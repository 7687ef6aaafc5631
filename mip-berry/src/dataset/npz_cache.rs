//! 以 npz 归档保存的缓存.
//!
//! 第 `i` 个样本保存为 `image-{i}` 与 `mask-{i}` 两个数组, 形状均为 `(c, z, y, x)`.
//! 元信息不保存.

use ndarray::{Array4, Ix4, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::Volume;

/// 最大工作通道数.
const MAX_WORKERS: usize = 64;

/// 打开或读写 `NpzArchive` 错误.
#[derive(Debug, Error)]
pub enum OpenArchiveError {
    /// workers 太大. 最多支持 64.
    #[error("too many workers, at most {0} are supported")]
    TooManyWorkers(usize),

    /// 归档中没有该样本.
    #[error("no entry named `{0}` in archive")]
    MissingEntry(String),

    /// 读取 npz 文件错误.
    #[error("read npz error: {0}")]
    ReadNpz(#[from] ReadNpzError),

    /// 写入 npz 文件错误.
    #[error("write npz error: {0}")]
    WriteNpz(#[from] WriteNpzError),

    /// 其他底层 I/O 错误.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn image_key(i: usize) -> String {
    format!("image-{i}")
}

fn mask_key(i: usize) -> String {
    format!("mask-{i}")
}

/// 把 `(扫描, 标注)` 对写入 `p` 处的 npz 归档.
pub fn write_npz_cache<P: AsRef<Path>>(p: P, pairs: &[(Volume, Volume)]) -> Result<(), OpenArchiveError> {
    let file = File::create(p.as_ref())?;
    let mut npz = NpzWriter::new(file);
    for (i, (image, mask)) in pairs.iter().enumerate() {
        npz.add_array(image_key(i), &image.data())?;
        npz.add_array(mask_key(i), &mask.data())?;
    }
    npz.finish()?;
    log::debug!("wrote {} pair(s) to {:?}", pairs.len(), p.as_ref());
    Ok(())
}

/// Npz 缓存归档.
///
/// 该结构可用于建模硬盘上由 [`write_npz_cache`] 保存的多个样本.
pub struct NpzArchive {
    entries: Vec<Mutex<NpzReader<File>>>,
    names: Vec<String>,
    turn: AtomicUsize,
}

impl NpzArchive {
    /// 初始化.
    ///
    /// `workers` 指定了底层工作通道的个数, 最大为 64. 系统会从路径 `p` 打开文件
    /// `workers` 次, 并为每个打开通道指定一个排他入口点 (以期获得更高的并行度).
    pub fn new<P: AsRef<Path>>(workers: NonZeroUsize, p: P) -> Result<Self, OpenArchiveError> {
        let workers = workers.get();
        if workers > MAX_WORKERS {
            return Err(OpenArchiveError::TooManyWorkers(MAX_WORKERS));
        }
        let mut v = Vec::with_capacity(workers);
        for _ in 0..workers {
            let file = OpenOptions::new().read(true).open(p.as_ref())?;
            v.push(Mutex::new(NpzReader::new(file)?));
        }
        let names = v[0].get_mut().unwrap_or_else(PoisonError::into_inner).names()?;
        Ok(Self {
            entries: v,
            names,
            turn: AtomicUsize::new(0),
        })
    }

    /// 按名字读取. 兼容保存时是否追加了 `.npy` 后缀.
    fn array_by_key(&self, key: &str) -> Result<Array4<f32>, OpenArchiveError> {
        let with_ext = format!("{key}.npy");
        let name = self
            .names
            .iter()
            .find(|n| *n == key || **n == with_ext)
            .ok_or_else(|| OpenArchiveError::MissingEntry(key.to_string()))?;
        let slot = self.next_slot();
        let mut file = self.entries[slot]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(file.by_name::<OwnedRepr<f32>, Ix4>(name)?)
    }

    /// 读取第 `i` 个样本的 `(扫描, 标注)` 数组.
    pub fn pair(&self, i: usize) -> Result<(Array4<f32>, Array4<f32>), OpenArchiveError> {
        Ok((self.array_by_key(&image_key(i))?, self.array_by_key(&mask_key(i))?))
    }

    /// 工作通道个数.
    #[inline]
    pub fn worker_len(&self) -> usize {
        self.entries.len()
    }

    /// 归档中的样本个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len() / 2
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn next_slot(&self) -> usize {
        self.turn.fetch_add(1, Ordering::Relaxed) % self.worker_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn pair(v: f32) -> (Volume, Volume) {
        let image = Array4::from_shape_fn((1, 2, 3, 4), |(_, z, y, x)| v + (z * 12 + y * 4 + x) as f32);
        let mask = Array4::from_shape_fn((1, 2, 3, 4), |(_, z, _, _)| z as f32);
        (Volume::from_array(image), Volume::from_array(mask))
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.npz");
        let pairs = vec![pair(0.0), pair(100.0), pair(-5.0)];
        write_npz_cache(&path, &pairs).unwrap();

        let archive = NpzArchive::new(NonZeroUsize::new(2).unwrap(), &path).unwrap();
        assert_eq!(archive.worker_len(), 2);
        assert_eq!(archive.len(), 3);
        for (i, (image, mask)) in pairs.iter().enumerate() {
            let (a, b) = archive.pair(i).unwrap();
            assert_eq!(a, image.data());
            assert_eq!(b, mask.data());
        }
        assert!(matches!(archive.pair(3), Err(OpenArchiveError::MissingEntry(_))));
    }

    #[test]
    fn test_too_many_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.npz");
        write_npz_cache(&path, &[]).unwrap();
        assert!(matches!(
            NpzArchive::new(NonZeroUsize::new(65).unwrap(), &path),
            Err(OpenArchiveError::TooManyWorkers(64))
        ));
        assert!(NpzArchive::new(NonZeroUsize::new(1).unwrap(), &path).unwrap().is_empty());
    }
}
