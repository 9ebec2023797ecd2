#![allow(dead_code)]

use image::{ImageBuffer, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::time::Duration;

use headshot_processor::queue::{JobRunner, QueueStatus, Scheduler};

/// Light backdrop with a textured skin-toned head in the upper third
pub fn portrait_photo(width: u32, height: u32) -> RgbImage {
    let cx = width as i64 / 2;
    let cy = height as i64 / 3;
    let radius = (width.min(height) / 8) as i64;
    ImageBuffer::from_fn(width, height, |x, y| {
        let dx = x as i64 - cx;
        let dy = y as i64 - cy;
        if dx * dx + dy * dy <= radius * radius {
            if (x / 3 + y / 3) % 2 == 0 {
                Rgb([224, 172, 140])
            } else {
                Rgb([200, 150, 120])
            }
        } else {
            Rgb([236, 234, 240])
        }
    })
}

pub fn write_photo(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    portrait_photo(width, height).save(&path).unwrap();
    path
}

/// Any existing file works as a source for runners that never decode it
pub fn touch(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"jpeg").unwrap();
    path
}

pub async fn wait_for_status<R, F>(scheduler: &Scheduler<R>, mut predicate: F) -> QueueStatus
where
    R: JobRunner,
    F: FnMut(&QueueStatus) -> bool,
{
    let mut rx = scheduler.watch_status();
    let status = tokio::time::timeout(Duration::from_secs(20), rx.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for queue status")
        .expect("status channel closed");
    status.clone()
}
