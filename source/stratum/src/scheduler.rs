use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::gc::{self, GcType};
use crate::namespace::registry::Registry;

/// Periods of the six GC passes plus interner maintenance.
#[derive(Debug, Clone)]
pub struct GcPeriods {
    pub mc_gen_0: Duration,
    pub mc_gen_1: Duration,
    pub mc_gen_2: Duration,
    pub dead_pointers: Duration,
    pub namespaces: Duration,
    pub versions: Duration,
    pub pool_maintenance: Duration,
}

impl Default for GcPeriods {
    fn default() -> Self {
        GcPeriods {
            mc_gen_0: Duration::from_secs(20),
            mc_gen_1: Duration::from_secs(100),
            mc_gen_2: Duration::from_secs(340),
            dead_pointers: Duration::from_secs(140),
            namespaces: Duration::from_secs(220),
            versions: Duration::from_secs(60),
            pool_maintenance: Duration::from_secs(120),
        }
    }
}

/// Live windows handed to each scheduled pass.
#[derive(Debug, Clone)]
pub struct GcWindows {
    pub merged_configs: u64,
    pub namespaces: u64,
    pub versions: u64,
}

impl Default for GcWindows {
    fn default() -> Self {
        GcWindows {
            merged_configs: 60,
            namespaces: 900,
            versions: 300,
        }
    }
}

/// Time wheel injecting the periodic GC passes into the worker pool.
pub fn spawn(registry: Arc<Registry>, periods: GcPeriods, windows: GcWindows) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut gen0 = interval(periods.mc_gen_0);
        let mut gen1 = interval(periods.mc_gen_1);
        let mut gen2 = interval(periods.mc_gen_2);
        let mut dead = interval(periods.dead_pointers);
        let mut namespaces = interval(periods.namespaces);
        let mut versions = interval(periods.versions);
        let mut maintenance = interval(periods.pool_maintenance);
        for ticker in [
            &mut gen0,
            &mut gen1,
            &mut gen2,
            &mut dead,
            &mut namespaces,
            &mut versions,
            &mut maintenance,
        ] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; skip it
            // so every pass waits a full period before its first run.
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = gen0.tick() => gc::run(&registry, GcType::McGen0, windows.merged_configs),
                _ = gen1.tick() => gc::run(&registry, GcType::McGen1, windows.merged_configs),
                _ = gen2.tick() => gc::run(&registry, GcType::McGen2, windows.merged_configs),
                _ = dead.tick() => gc::run(&registry, GcType::DeadPointers, 0),
                _ = namespaces.tick() => gc::run(&registry, GcType::Namespaces, windows.namespaces),
                _ = versions.tick() => gc::run(&registry, GcType::Versions, windows.versions),
                _ = maintenance.tick() => {
                    for ns in registry.all() {
                        ns.pool.compact();
                        let stats = ns.pool.stats();
                        tracing::debug!(
                            root_path = %ns.root_path.display(),
                            strings = stats.strings,
                            chunks = stats.chunks,
                            used_bytes = stats.used_bytes,
                            "interner stats"
                        );
                    }
                }
            }
        }
    })
}
