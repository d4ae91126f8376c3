//! Rotates and prunes append-only files on disk by size and/or age, keeping
//! a bounded number (or total size) of rotated generations (spec §4.11,
//! testable property §8 "rotation by size").
//!
//! Runs its periodic size/age check on a [`Threadlet`], the same background
//! task abstraction used by [`crate::token_bucket::TokenBucket`]'s servicing
//! loop, and implements [`Component`] so it can be started/stopped alongside
//! the [`crate::wrangler::Wrangler`] it belongs to via
//! [`crate::component::start_children`]/[`crate::component::stop_children`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::fs;

use crate::component::Component;
use crate::config::FilePreserverConfig;
use crate::error::{BoxError, TransientFilesystemError};
use crate::threadlet::Threadlet;
use crate::time::TimeSource;

struct Inner {
    config: FilePreserverConfig,
    opened_at: AtomicU64,
    worker: Threadlet,
    time: Arc<dyn TimeSource>,
}

/// Manages one rotated file family under `directory/prefix-*`. Cheaply
/// cloneable (an `Arc` handle over its state), so [`Component::start`] can
/// hand a copy to its background task without needing `self: Arc<Self>`.
#[derive(Clone)]
pub struct FilePreserver {
    inner: Arc<Inner>,
}

impl FilePreserver {
    pub fn new(config: FilePreserverConfig, time: Arc<dyn TimeSource>) -> Result<Self, crate::error::ValidationError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                opened_at: AtomicU64::new(0),
                worker: Threadlet::new("file-preserver"),
                time,
            }),
        })
    }

    fn active_path(&self) -> PathBuf {
        self.inner
            .config
            .directory
            .join(format!("{}{}", self.inner.config.prefix, self.inner.config.suffix))
    }

    /// Runs one size/age check and rotates immediately if over threshold.
    /// Exposed directly so `onReload` can invoke it synchronously without
    /// waiting for the periodic check.
    pub async fn check_now(&self) -> Result<(), TransientFilesystemError> {
        let active = self.active_path();
        let metadata = match fs::metadata(&active).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(TransientFilesystemError {
                    path: active,
                    source: e,
                })
            }
        };

        let mut should_rotate = false;
        if let Some(max_size) = self.inner.config.rotate_at_size {
            should_rotate |= metadata.len() >= max_size;
        }
        if let Some(max_age) = self.inner.config.max_age {
            let opened = self.inner.opened_at.load(Ordering::Acquire) as f64 / 1000.0;
            should_rotate |= self.inner.time.now() - opened >= max_age.as_secs_f64();
        }

        if should_rotate {
            self.rotate().await?;
        }
        Ok(())
    }

    /// Renames the active file to a timestamped generation — named
    /// `<prefix>-<yyyymmdd>[-<count>]<suffix>`, with the date taken from the
    /// active file's own birthtime (not wall-clock "now") and `count` the
    /// smallest non-negative integer that doesn't collide with an existing
    /// generation from the same day — then prunes old generations per
    /// `max_old_count`/`max_old_bytes`.
    pub async fn rotate(&self) -> Result<(), TransientFilesystemError> {
        let active = self.active_path();
        let metadata = match fs::metadata(&active).await {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };

        let birth = metadata
            .created()
            .unwrap_or_else(|_| std::time::SystemTime::now());
        let date = OffsetDateTime::from(birth);
        let date_str = format!("{:04}{:02}{:02}", date.year(), u8::from(date.month()), date.day());

        let mut count: Option<u32> = None;
        let rotated = loop {
            let candidate = match count {
                None => self.generation_path(&date_str, None),
                Some(n) => self.generation_path(&date_str, Some(n)),
            };
            if fs::metadata(&candidate).await.is_err() {
                break candidate;
            }
            count = Some(count.map_or(1, |n| n + 1));
        };

        fs::rename(&active, &rotated)
            .await
            .map_err(|source| TransientFilesystemError {
                path: active.clone(),
                source,
            })?;

        self.inner
            .opened_at
            .store((self.inner.time.now() * 1000.0) as u64, Ordering::Release);

        self.prune().await
    }

    fn generation_path(&self, date_str: &str, count: Option<u32>) -> PathBuf {
        let prefix = &self.inner.config.prefix;
        let suffix = &self.inner.config.suffix;
        let name = match count {
            None => format!("{prefix}-{date_str}{suffix}"),
            Some(n) => format!("{prefix}-{date_str}-{n}{suffix}"),
        };
        self.inner.config.directory.join(name)
    }

    async fn prune(&self) -> Result<(), TransientFilesystemError> {
        let mut entries = self.list_generations().await?;
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        if let Some(max_old_count) = self.inner.config.max_old_count {
            for (_, path) in entries.iter().skip(max_old_count) {
                remove_best_effort(path).await;
            }
            entries.truncate(max_old_count);
        }

        if let Some(max_old_bytes) = self.inner.config.max_old_bytes {
            let mut total = 0u64;
            for (_, path) in &entries {
                total += fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
                if total > max_old_bytes {
                    remove_best_effort(path).await;
                }
            }
        }

        Ok(())
    }

    async fn list_generations(&self) -> Result<Vec<(String, PathBuf)>, TransientFilesystemError> {
        let mut out = Vec::new();
        let mut dir = fs::read_dir(&self.inner.config.directory)
            .await
            .map_err(|source| TransientFilesystemError {
                path: self.inner.config.directory.clone(),
                source,
            })?;

        let needle = format!("{}-", self.inner.config.prefix);
        let active_name = format!("{}{}", self.inner.config.prefix, self.inner.config.suffix);
        let suffix = &self.inner.config.suffix;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|source| TransientFilesystemError {
                path: self.inner.config.directory.clone(),
                source,
            })?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&needle) && name.ends_with(suffix.as_str()) && *name != active_name {
                out.push((name.to_string(), entry.path()));
            }
        }
        Ok(out)
    }

    /// Invoked on configuration reload; rotates, checks, or does nothing per
    /// `rotate_on_reload`/`save_on_reload` (mutually exclusive — enforced by
    /// [`FilePreserverConfig::validate`]).
    pub async fn on_reload(&self) -> Result<(), TransientFilesystemError> {
        if self.inner.config.save_on_reload {
            return self.rotate().await;
        }
        if self.inner.config.rotate_on_reload {
            return self.check_now().await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Component for FilePreserver {
    fn component_name(&self) -> &str {
        &self.inner.config.prefix
    }

    async fn start(&self, _is_reload: bool) -> Result<(), BoxError> {
        if self.inner.config.save_on_start {
            self.rotate().await.map_err(|e| Box::new(e) as BoxError)?;
        }

        let this = self.clone();
        self.inner
            .worker
            .start(async { Ok(()) }, move |stop| {
                Box::pin(async move {
                    loop {
                        tokio::select! {
                            _ = this.inner.time.sleep(this.inner.config.check_period) => {}
                            _ = stop.wait() => return Ok(()),
                        }
                        if let Err(e) = this.check_now().await {
                            tracing::warn!(error = %e, "periodic rotation check failed");
                        }
                    }
                })
            })
            .await
            .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as BoxError)
    }

    async fn stop(&self, will_reload: bool) -> Result<(), BoxError> {
        self.inner
            .worker
            .stop()
            .await
            .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as BoxError)?;

        if self.inner.config.save_on_stop && !will_reload {
            self.rotate().await.map_err(|e| Box::new(e) as BoxError)?;
        }
        Ok(())
    }
}

async fn remove_best_effort(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to prune rotated file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TestTimeSource;

    async fn write_file(path: &Path, bytes: usize) {
        fs::write(path, vec![b'x'; bytes]).await.unwrap();
    }

    #[tokio::test]
    async fn rotates_when_over_size_threshold() {
        let dir = tempdir();
        write_file(&dir.join("svc.log"), 100).await;

        let config = FilePreserverConfig::new(dir.clone(), "svc").rotate_at_size(10);
        let preserver = FilePreserver::new(config, Arc::new(TestTimeSource::new())).unwrap();
        preserver.check_now().await.unwrap();

        assert!(fs::metadata(dir.join("svc.log")).await.is_err());
        let mut found_rotated = false;
        let mut entries = fs::read_dir(&dir).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            if e.file_name().to_string_lossy().starts_with("svc-") {
                found_rotated = true;
            }
        }
        assert!(found_rotated);
        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn rotated_filename_matches_prefix_date_suffix_shape() {
        let dir = tempdir();
        write_file(&dir.join("svc.log"), 100).await;

        let config = FilePreserverConfig::new(dir.clone(), "svc").rotate_at_size(10);
        let preserver = FilePreserver::new(config, Arc::new(TestTimeSource::new())).unwrap();
        preserver.rotate().await.unwrap();

        let mut entries = fs::read_dir(&dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 1);
        let name = &names[0];
        assert!(name.starts_with("svc-"));
        assert!(name.ends_with(".log"));
        let middle = &name[4..name.len() - 4];
        assert_eq!(middle.len(), 8, "expected an 8-digit yyyymmdd: {middle}");
        assert!(middle.chars().all(|c| c.is_ascii_digit()));
        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn prunes_to_max_old_count() {
        let dir = tempdir();
        for i in 0..5 {
            write_file(&dir.join(format!("svc-2026010{i}.log")), 10).await;
        }

        let config = FilePreserverConfig::new(dir.clone(), "svc").max_old_count(2);
        let preserver = FilePreserver::new(config, Arc::new(TestTimeSource::new())).unwrap();
        preserver.prune().await.unwrap();

        let mut remaining = 0;
        let mut entries = fs::read_dir(&dir).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            if e.file_name().to_string_lossy().starts_with("svc-") {
                remaining += 1;
            }
        }
        assert_eq!(remaining, 2);
        let _ = fs::remove_dir_all(&dir).await;
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wrangler-rt-test-{}-{}",
            std::process::id(),
            crate::ids::Identifier::generate()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
