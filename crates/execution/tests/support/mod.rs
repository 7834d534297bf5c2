#![allow(dead_code)]

//! Shared fixtures for scheduler integration tests.

use std::sync::Arc;

use arrow::array::{Array, Int64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use crossbeam_channel::{unbounded, Receiver};
use quarry_common::{ExecutionConfig, QuarryError, RelationId};
use quarry_execution::bus::DataPipelineMessage;
use quarry_execution::{QueryManager, QueryResultStatus, WorkOrderPhase};
use quarry_plan::QueryPlan;
use quarry_storage::{BlockAnnouncer, BlockManager, Catalog, FlushedBlock};

/// Installs a test log subscriber (idempotent across tests in one binary).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Two Int64 columns `(k, x)`.
pub fn kx_schema() -> Schema {
    Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("x", DataType::Int64, false),
    ])
}

/// Builds a `(k, x)` batch from row tuples.
pub fn kx_batch(rows: &[(i64, i64)]) -> RecordBatch {
    RecordBatch::try_new(
        Arc::new(kx_schema()),
        vec![
            Arc::new(Int64Array::from(
                rows.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter().map(|(_, x)| *x).collect::<Vec<_>>(),
            )),
        ],
    )
    .unwrap()
}

/// Catalog + storage + config shared by one test.
pub struct Fixture {
    pub catalog: Arc<Catalog>,
    pub storage: Arc<BlockManager>,
    pub config: ExecutionConfig,
}

impl Fixture {
    pub fn new(batch_size_rows: usize) -> Self {
        Self {
            catalog: Arc::new(Catalog::new()),
            storage: Arc::new(BlockManager::new(2)),
            config: ExecutionConfig {
                batch_size_rows,
                ..ExecutionConfig::default()
            },
        }
    }

    /// Registers a stored table and loads one block per inner vec entry.
    pub fn load_table(
        &self,
        name: &str,
        schema: Schema,
        partitions: Vec<Vec<RecordBatch>>,
    ) -> RelationId {
        let id = self
            .catalog
            .add_relation(name, schema, partitions.len())
            .unwrap();
        let relation = self.catalog.get_relation(id).unwrap();
        for (partition_id, blocks) in partitions.into_iter().enumerate() {
            for batch in blocks {
                self.storage
                    .create_block(&relation, partition_id, None, batch)
                    .unwrap();
            }
        }
        id
    }

    /// Reads one Int64 column of a relation across all partitions.
    pub fn read_column(&self, relation_id: RelationId, column: usize) -> Vec<i64> {
        let relation = self.catalog.get_relation(relation_id).unwrap();
        let mut out = Vec::new();
        for partition_id in 0..relation.num_partitions {
            for block_id in self.storage.blocks_for_partition(relation_id, partition_id) {
                let block = self.storage.load_block(block_id, None).unwrap();
                let values = block
                    .batch()
                    .column(column)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap();
                out.extend(values.values().iter().copied());
            }
        }
        out
    }

    /// Reads `(col0, col1)` pairs of a relation across all partitions.
    pub fn read_pairs(&self, relation_id: RelationId) -> Vec<(i64, i64)> {
        let keys = self.read_column(relation_id, 0);
        let values = self.read_column(relation_id, 1);
        keys.into_iter().zip(values).collect()
    }

    /// Blocks currently stored for a relation, across all partitions.
    pub fn num_blocks(&self, relation_id: RelationId) -> usize {
        let relation = self.catalog.get_relation(relation_id).unwrap();
        (0..relation.num_partitions)
            .map(|p| self.storage.blocks_for_partition(relation_id, p).len())
            .sum()
    }
}

/// Single-threaded driver around one `QueryManager`.
///
/// Executes work orders inline in dispatch order, routing data-pipelining
/// announcements exactly like the foreman would, and records the dispatch
/// sequence for scheduling-discipline assertions.
pub struct Harness {
    pub manager: QueryManager,
    pipeline_rx: Receiver<DataPipelineMessage>,
    /// `(op_index, partition_id, phase)` per dispatched work order.
    pub dispatch_log: Vec<(usize, usize, WorkOrderPhase)>,
}

impl Harness {
    pub fn new(fixture: &Fixture, plan: QueryPlan) -> Result<Self, QuarryError> {
        let (tx, pipeline_rx) = unbounded();
        let announcer: BlockAnnouncer = Arc::new(move |flushed: FlushedBlock| {
            let _ = tx.send(DataPipelineMessage {
                query_id: flushed.query_id,
                producer_op: flushed.producer_op,
                block_id: flushed.block_id,
                relation_id: flushed.relation_id,
                partition_id: flushed.partition_id,
            });
        });
        let manager = QueryManager::new(
            plan,
            Arc::clone(&fixture.catalog),
            Arc::clone(&fixture.storage),
            &fixture.config,
            Some(announcer),
            0,
        )?;
        Ok(Self {
            manager,
            pipeline_rx,
            dispatch_log: Vec::new(),
        })
    }

    fn drain_pipeline(&mut self) {
        while let Ok(message) = self.pipeline_rx.try_recv() {
            self.manager
                .process_data_pipeline_message(&message)
                .unwrap();
        }
    }

    /// Dispatches and executes one work order; false when none is ready.
    pub fn step(&mut self) -> bool {
        self.drain_pipeline();
        let Some((mut order, phase)) = self.manager.get_next_work_order(0, None, 64) else {
            return false;
        };
        self.dispatch_log
            .push((order.op_index(), order.partition_id(), phase));
        let result = order.execute();
        self.drain_pipeline();
        self.manager
            .process_work_order_completion(
                phase,
                order.op_index(),
                order.partition_id(),
                result.err().map(|e| e.to_string()),
            )
            .unwrap();
        true
    }

    /// Runs the query to its terminal status.
    pub fn run(&mut self) -> QueryResultStatus {
        loop {
            if let Some(status) = self.manager.is_done() {
                self.drain_pipeline();
                return status;
            }
            if !self.step() {
                self.drain_pipeline();
                if let Some(status) = self.manager.is_done() {
                    return status;
                }
                if !self.step() {
                    panic!("scheduler stalled: no ready work and query not done");
                }
            }
        }
    }
}
