//! Per-device allocation and work counters.
//!
//! Owned by a device object and dropped with it. Counters are atomics so
//! that `&self` device methods can update them without a lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one device.
#[derive(Debug, Default)]
pub struct DeviceMetrics {
    live_buffers: AtomicU64,
    allocated_bytes: AtomicU64,
    live_images: AtomicU64,
    live_accels: AtomicU64,
    pipelines_created: AtomicU64,
    submissions: AtomicU64,
    blas_builds: AtomicU64,
    tlas_builds: AtomicU64,
    tlas_refits: AtomicU64,
}

/// Plain copy of [`DeviceMetrics`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub live_buffers: u64,
    pub allocated_bytes: u64,
    pub live_images: u64,
    pub live_accels: u64,
    pub pipelines_created: u64,
    pub submissions: u64,
    pub blas_builds: u64,
    pub tlas_builds: u64,
    pub tlas_refits: u64,
}

impl DeviceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn buffer_created(&self, size: u64) {
        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
    }

    #[inline]
    pub fn buffer_destroyed(&self, size: u64) {
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    #[inline]
    pub fn image_created(&self) {
        self.live_images.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn image_destroyed(&self) {
        self.live_images.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn accel_created(&self) {
        self.live_accels.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn accel_destroyed(&self) {
        self.live_accels.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn pipeline_created(&self) {
        self.pipelines_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn submitted(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn blas_built(&self) {
        self.blas_builds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn tlas_built(&self, refit: bool) {
        if refit {
            self.tlas_refits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tlas_builds.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Bytes currently allocated through this device.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            live_buffers: self.live_buffers.load(Ordering::Relaxed),
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            live_images: self.live_images.load(Ordering::Relaxed),
            live_accels: self.live_accels.load(Ordering::Relaxed),
            pipelines_created: self.pipelines_created.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
            blas_builds: self.blas_builds.load(Ordering::Relaxed),
            tlas_builds: self.tlas_builds.load(Ordering::Relaxed),
            tlas_refits: self.tlas_refits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_per_instance() {
        let a = DeviceMetrics::new();
        let b = DeviceMetrics::new();
        a.buffer_created(256);
        a.buffer_created(64);
        a.buffer_destroyed(64);
        a.tlas_built(true);

        let snap = a.snapshot();
        assert_eq!(snap.live_buffers, 1);
        assert_eq!(snap.allocated_bytes, 256);
        assert_eq!(snap.tlas_refits, 1);
        assert_eq!(snap.tlas_builds, 0);
        assert_eq!(b.snapshot(), MetricsSnapshot::default());
    }
}
