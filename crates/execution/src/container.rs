//! Per-operator, per-partition queues of ready work orders.
//!
//! Ordering: FIFO within each `(operator, partition)` queue. A NUMA hint
//! selects the oldest queued order whose preferred node matches; if none
//! match, retrieval falls back to strict FIFO (the hint is advisory).

use std::collections::VecDeque;

use quarry_common::{NumaNodeId, OpIndex, PartitionId};

use crate::work_order::BoxedWorkOrder;

#[derive(Default)]
struct PartitionedQueues {
    per_partition: Vec<VecDeque<BoxedWorkOrder>>,
}

impl PartitionedQueues {
    fn new(num_partitions: usize) -> Self {
        Self {
            per_partition: (0..num_partitions).map(|_| VecDeque::new()).collect(),
        }
    }

    fn add(&mut self, partition_id: PartitionId, work_order: BoxedWorkOrder) {
        self.per_partition[partition_id].push_back(work_order);
    }

    fn get(
        &mut self,
        partition_id: PartitionId,
        numa_hint: Option<NumaNodeId>,
    ) -> Option<BoxedWorkOrder> {
        let queue = &mut self.per_partition[partition_id];
        if let Some(node) = numa_hint {
            if let Some(pos) = queue
                .iter()
                .position(|wo| wo.preferred_numa_node() == Some(node))
            {
                return queue.remove(pos);
            }
        }
        queue.pop_front()
    }

    fn get_any(&mut self, numa_hint: Option<NumaNodeId>) -> Option<BoxedWorkOrder> {
        if let Some(node) = numa_hint {
            for queue in &mut self.per_partition {
                if let Some(pos) = queue
                    .iter()
                    .position(|wo| wo.preferred_numa_node() == Some(node))
                {
                    return queue.remove(pos);
                }
            }
        }
        self.per_partition
            .iter_mut()
            .find(|queue| !queue.is_empty())
            .and_then(|queue| queue.pop_front())
    }

    fn has(&self, partition_id: PartitionId) -> bool {
        !self.per_partition[partition_id].is_empty()
    }

    fn len(&self) -> usize {
        self.per_partition.iter().map(|q| q.len()).sum()
    }
}

/// Ready-work-order container split into normal and rebuild classes.
pub struct WorkOrdersContainer {
    normal: Vec<PartitionedQueues>,
    rebuild: Vec<PartitionedQueues>,
}

impl WorkOrdersContainer {
    /// Constructs queues sized per operator: `normal_partitions[op]` work
    /// partitions and `rebuild_partitions[op]` output partitions.
    pub fn new(normal_partitions: &[usize], rebuild_partitions: &[usize]) -> Self {
        Self {
            normal: normal_partitions
                .iter()
                .map(|n| PartitionedQueues::new(*n))
                .collect(),
            rebuild: rebuild_partitions
                .iter()
                .map(|n| PartitionedQueues::new(*n))
                .collect(),
        }
    }

    /// Enqueues a normal work order.
    pub fn add_normal_work_order(
        &mut self,
        op: OpIndex,
        partition_id: PartitionId,
        work_order: BoxedWorkOrder,
    ) {
        self.normal[op].add(partition_id, work_order);
    }

    /// Enqueues a rebuild work order.
    pub fn add_rebuild_work_order(
        &mut self,
        op: OpIndex,
        partition_id: PartitionId,
        work_order: BoxedWorkOrder,
    ) {
        self.rebuild[op].add(partition_id, work_order);
    }

    /// Dequeues one normal work order for `(op, partition)`.
    pub fn get_normal_work_order(
        &mut self,
        op: OpIndex,
        partition_id: PartitionId,
        numa_hint: Option<NumaNodeId>,
    ) -> Option<BoxedWorkOrder> {
        self.normal[op].get(partition_id, numa_hint)
    }

    /// Dequeues one normal work order for `op` from any partition.
    pub fn get_any_normal_work_order(
        &mut self,
        op: OpIndex,
        numa_hint: Option<NumaNodeId>,
    ) -> Option<BoxedWorkOrder> {
        self.normal[op].get_any(numa_hint)
    }

    /// Dequeues one rebuild work order for `(op, partition)`.
    pub fn get_rebuild_work_order(
        &mut self,
        op: OpIndex,
        partition_id: PartitionId,
        numa_hint: Option<NumaNodeId>,
    ) -> Option<BoxedWorkOrder> {
        self.rebuild[op].get(partition_id, numa_hint)
    }

    /// Dequeues one rebuild work order for `op` from any partition.
    pub fn get_any_rebuild_work_order(
        &mut self,
        op: OpIndex,
        numa_hint: Option<NumaNodeId>,
    ) -> Option<BoxedWorkOrder> {
        self.rebuild[op].get_any(numa_hint)
    }

    /// Whether `(op, partition)` has a queued normal work order.
    pub fn has_normal_work_order(&self, op: OpIndex, partition_id: PartitionId) -> bool {
        self.normal[op].has(partition_id)
    }

    /// Whether `op` has any queued normal work order.
    pub fn has_any_normal_work_order(&self, op: OpIndex) -> bool {
        self.normal[op].len() > 0
    }

    /// Whether `(op, partition)` has a queued rebuild work order.
    pub fn has_rebuild_work_order(&self, op: OpIndex, partition_id: PartitionId) -> bool {
        self.rebuild[op].has(partition_id)
    }

    /// Whether `op` has any queued rebuild work order.
    pub fn has_any_rebuild_work_order(&self, op: OpIndex) -> bool {
        self.rebuild[op].len() > 0
    }

    /// Queued normal work orders across all partitions of `op`.
    pub fn num_normal_work_orders(&self, op: OpIndex) -> usize {
        self.normal[op].len()
    }

    /// Queued rebuild work orders across all partitions of `op`.
    pub fn num_rebuild_work_orders(&self, op: OpIndex) -> usize {
        self.rebuild[op].len()
    }

    /// Whether the container holds no work orders at all.
    pub fn is_empty(&self) -> bool {
        self.normal.iter().all(|q| q.len() == 0) && self.rebuild.iter().all(|q| q.len() == 0)
    }

    /// Discards all queued work orders (cancellation path).
    pub fn clear(&mut self) {
        for queues in self.normal.iter_mut().chain(self.rebuild.iter_mut()) {
            for queue in &mut queues.per_partition {
                queue.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::{NumaNodeId, QueryId, Result};

    struct StubOrder {
        numa: Option<NumaNodeId>,
    }

    impl crate::work_order::WorkOrder for StubOrder {
        fn query_id(&self) -> QueryId {
            QueryId(0)
        }
        fn op_index(&self) -> usize {
            0
        }
        fn partition_id(&self) -> usize {
            0
        }
        fn preferred_numa_node(&self) -> Option<NumaNodeId> {
            self.numa
        }
        fn execute(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn stub(numa: Option<NumaNodeId>) -> BoxedWorkOrder {
        Box::new(StubOrder { numa })
    }

    #[test]
    fn fifo_within_partition() {
        let mut container = WorkOrdersContainer::new(&[1], &[1]);
        container.add_normal_work_order(0, 0, stub(Some(3)));
        container.add_normal_work_order(0, 0, stub(Some(5)));
        assert!(container.has_normal_work_order(0, 0));
        let first = container.get_normal_work_order(0, 0, None).unwrap();
        assert_eq!(first.preferred_numa_node(), Some(3));
        assert_eq!(container.num_normal_work_orders(0), 1);
    }

    #[test]
    fn numa_hint_prefers_matching_order() {
        let mut container = WorkOrdersContainer::new(&[1], &[1]);
        container.add_normal_work_order(0, 0, stub(Some(0)));
        container.add_normal_work_order(0, 0, stub(Some(1)));
        let picked = container.get_normal_work_order(0, 0, Some(1)).unwrap();
        assert_eq!(picked.preferred_numa_node(), Some(1));
        // Miss falls back to FIFO.
        let picked = container.get_normal_work_order(0, 0, Some(7)).unwrap();
        assert_eq!(picked.preferred_numa_node(), Some(0));
        assert!(!container.has_any_normal_work_order(0));
    }

    #[test]
    fn rebuild_queues_are_separate() {
        let mut container = WorkOrdersContainer::new(&[2], &[3]);
        container.add_rebuild_work_order(0, 2, stub(None));
        assert!(!container.has_any_normal_work_order(0));
        assert!(container.has_rebuild_work_order(0, 2));
        assert!(container.get_any_rebuild_work_order(0, None).is_some());
        assert!(container.is_empty());
    }

    #[test]
    fn clear_discards_everything() {
        let mut container = WorkOrdersContainer::new(&[1], &[1]);
        container.add_normal_work_order(0, 0, stub(None));
        container.add_rebuild_work_order(0, 0, stub(None));
        container.clear();
        assert!(container.is_empty());
    }
}
