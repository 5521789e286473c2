//! Prometheus metrics for Offload Server.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + collectors).

use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// All Prometheus metrics for Offload Server.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,

    // -- Upload pipeline --
    pub archives_uploaded_total: IntCounter,
    pub upload_failures_total: IntCounter,
    pub parts_uploaded_total: IntCounter,
    pub part_upload_bytes_total: IntCounter,
    pub queued_archives: IntGauge,

    // -- Restore --
    pub restores_total: IntCounter,
    pub restore_failures_total: IntCounter,

    // -- Deletion --
    pub parts_deleted_total: IntCounter,
    pub archives_reaped_total: IntCounter,

    // -- Mirror --
    pub mirror_synced_total: IntCounter,
    pub mirror_failures_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).unwrap();
    registry.register(Box::new(c.clone())).unwrap();
    c
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("offload_build_info", "Build information"),
            &["version"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        // Register standard process metrics (RSS, CPU, open FDs on Linux)
        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        let archives_uploaded_total = counter(
            &registry,
            "offload_archives_uploaded_total",
            "Archives that reached ready state",
        );
        let upload_failures_total = counter(
            &registry,
            "offload_upload_failures_total",
            "Upload pipeline failures (requeues and terminal errors)",
        );
        let parts_uploaded_total = counter(
            &registry,
            "offload_parts_uploaded_total",
            "Parts committed to remote providers",
        );
        let part_upload_bytes_total = counter(
            &registry,
            "offload_part_upload_bytes_total",
            "Ciphertext bytes committed to remote providers",
        );

        let queued_archives = IntGauge::new(
            "offload_queued_archives",
            "Archives currently waiting for an upload worker",
        )
        .unwrap();
        registry.register(Box::new(queued_archives.clone())).unwrap();

        let restores_total = counter(
            &registry,
            "offload_restores_total",
            "Restore streams started (whole, entry, and range)",
        );
        let restore_failures_total = counter(
            &registry,
            "offload_restore_failures_total",
            "Restore streams that failed mid-flight",
        );

        let parts_deleted_total = counter(
            &registry,
            "offload_parts_deleted_total",
            "Remote parts retired by the deletion reaper",
        );
        let archives_reaped_total = counter(
            &registry,
            "offload_archives_reaped_total",
            "Archives tombstoned by the deletion reaper",
        );

        let mirror_synced_total = counter(
            &registry,
            "offload_mirror_synced_total",
            "Parts successfully copied to their mirror family",
        );
        let mirror_failures_total = counter(
            &registry,
            "offload_mirror_failures_total",
            "Mirror copies that failed and were re-flagged pending",
        );

        Self {
            registry,
            process_start_time_seconds,
            build_info,
            archives_uploaded_total,
            upload_failures_total,
            parts_uploaded_total,
            part_upload_bytes_total,
            queued_archives,
            restores_total,
            restore_failures_total,
            parts_deleted_total,
            archives_reaped_total,
            mirror_synced_total,
            mirror_failures_total,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
