//! Generator-function leaf operator.

use std::sync::Arc;

use arrow::array::Int64Array;
use arrow::record_batch::RecordBatch;
use quarry_common::{BlockId, OpIndex, PartitionId, QuarryError, QueryId, RelationId, Result};
use quarry_plan::GeneratorFunctionSpec;
use quarry_storage::InsertDestination;

use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;
use crate::operators::{OperatorEnv, RelationalOperator};
use crate::work_order::WorkOrder;

/// Emits the rows of a generator function handle, one work order per output
/// partition; each order produces a contiguous slice of the series.
pub struct TableGeneratorOperator {
    query_id: QueryId,
    op_index: OpIndex,
    generator_index: usize,
    output_destination_index: usize,
    started: Vec<bool>,
}

impl TableGeneratorOperator {
    pub(crate) fn new(
        query_id: QueryId,
        op_index: OpIndex,
        generator_index: usize,
        output_destination_index: usize,
        num_partitions: usize,
    ) -> Self {
        Self {
            query_id,
            op_index,
            generator_index,
            output_destination_index,
            started: vec![false; num_partitions],
        }
    }
}

impl RelationalOperator for TableGeneratorOperator {
    fn name(&self) -> &'static str {
        "TableGenerator"
    }

    fn num_partitions(&self) -> usize {
        self.started.len()
    }

    fn num_output_partitions(&self) -> usize {
        self.started.len()
    }

    fn get_all_work_orders(
        &mut self,
        partition_id: PartitionId,
        container: &mut WorkOrdersContainer,
        context: &QueryContext,
        _env: &OperatorEnv,
    ) -> Result<bool> {
        if !self.started[partition_id] {
            self.started[partition_id] = true;
            container.add_normal_work_order(
                self.op_index,
                partition_id,
                Box::new(TableGeneratorWorkOrder {
                    query_id: self.query_id,
                    op_index: self.op_index,
                    partition_id,
                    num_partitions: self.started.len(),
                    generator: context.generator_function(self.generator_index)?.clone(),
                    destination: Arc::clone(
                        context.insert_destination(self.output_destination_index)?,
                    ),
                }),
            );
        }
        Ok(true)
    }

    fn done_feeding_input(&mut self, _partition_id: PartitionId) {}

    fn feed_input_block(
        &mut self,
        _block_id: BlockId,
        _relation_id: RelationId,
        _partition_id: PartitionId,
    ) {
    }
}

struct TableGeneratorWorkOrder {
    query_id: QueryId,
    op_index: OpIndex,
    partition_id: PartitionId,
    num_partitions: usize,
    generator: GeneratorFunctionSpec,
    destination: Arc<InsertDestination>,
}

impl WorkOrder for TableGeneratorWorkOrder {
    fn query_id(&self) -> QueryId {
        self.query_id
    }

    fn op_index(&self) -> OpIndex {
        self.op_index
    }

    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn execute(&mut self) -> Result<()> {
        let GeneratorFunctionSpec::Series { start, stop, step } = self.generator;
        if step == 0 {
            return Err(QuarryError::Execution("series step is zero".to_string()));
        }
        let mut values = Vec::new();
        let mut v = start;
        while (step > 0 && v < stop) || (step < 0 && v > stop) {
            values.push(v);
            v += step;
        }
        // Contiguous slice of the series assigned to this partition.
        let total = values.len();
        let begin = self.partition_id * total / self.num_partitions;
        let end = (self.partition_id + 1) * total / self.num_partitions;
        if begin == end {
            return Ok(());
        }
        let batch = RecordBatch::try_new(
            self.destination.relation().schema_ref(),
            vec![Arc::new(Int64Array::from(values[begin..end].to_vec()))],
        )
        .map_err(|e| QuarryError::Execution(format!("generator batch build failed: {e}")))?;
        self.destination.append(self.partition_id, batch)
    }
}
