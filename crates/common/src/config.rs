use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, Result};
use crate::ids::NumaNodeId;

/// Scheduler/runtime configuration shared by the foreman and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Number of worker threads in the pool.
    pub num_workers: usize,
    /// Number of NUMA nodes workers are spread across.
    ///
    /// Workers are assigned to nodes in contiguous ranges
    /// (`worker_id / workers_per_node`); on machines without a NUMA topology
    /// a single node is the right value.
    pub num_numa_nodes: usize,
    /// Max work orders in flight per operator before the foreman stops
    /// dispatching for it (backpressure).
    pub max_inflight_work_orders_per_operator: usize,
    /// Target rows per storage block produced by insert destinations.
    pub batch_size_rows: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            num_numa_nodes: 1,
            max_inflight_work_orders_per_operator: 64,
            batch_size_rows: 8192,
        }
    }
}

impl ExecutionConfig {
    /// Validates internal consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(QuarryError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.num_numa_nodes == 0 || self.num_numa_nodes > self.num_workers {
            return Err(QuarryError::InvalidConfig(format!(
                "num_numa_nodes must be in [1, num_workers]; got {} with {} workers",
                self.num_numa_nodes, self.num_workers
            )));
        }
        if self.max_inflight_work_orders_per_operator == 0 {
            return Err(QuarryError::InvalidConfig(
                "max_inflight_work_orders_per_operator must be at least 1".to_string(),
            ));
        }
        if self.batch_size_rows == 0 {
            return Err(QuarryError::InvalidConfig(
                "batch_size_rows must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Workers assigned to each NUMA node (last node may hold fewer).
    pub fn workers_per_numa_node(&self) -> usize {
        self.num_workers.div_ceil(self.num_numa_nodes)
    }

    /// NUMA node a worker is bound to.
    pub fn numa_node_of_worker(&self, worker_index: usize) -> NumaNodeId {
        (worker_index / self.workers_per_numa_node()).min(self.num_numa_nodes - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ExecutionConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = ExecutionConfig {
            num_workers: 0,
            ..ExecutionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn numa_assignment_is_contiguous() {
        let cfg = ExecutionConfig {
            num_workers: 4,
            num_numa_nodes: 2,
            ..ExecutionConfig::default()
        };
        assert_eq!(cfg.numa_node_of_worker(0), 0);
        assert_eq!(cfg.numa_node_of_worker(1), 0);
        assert_eq!(cfg.numa_node_of_worker(2), 1);
        assert_eq!(cfg.numa_node_of_worker(3), 1);
    }

    #[test]
    fn uneven_numa_assignment_clamps_to_last_node() {
        let cfg = ExecutionConfig {
            num_workers: 5,
            num_numa_nodes: 2,
            ..ExecutionConfig::default()
        };
        assert_eq!(cfg.numa_node_of_worker(4), 1);
    }
}
