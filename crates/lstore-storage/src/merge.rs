//! Merge engine: folds tail versions into fresh base generations.

use crate::range::{MergeTicket, PageRange, VersionMeta};
use crate::record::column_mask;
use crate::table::Table;
use lstore_common::{LStoreError, Result, Value};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new base generation was installed.
    Merged {
        /// Records folded into the generation.
        records: usize,
        /// Superseded pages dropped from the buffer pool.
        reclaimed: usize,
    },
    /// Another merge of the range was running, or no tail version was
    /// written since the last merge.
    Skipped,
    /// A transaction marker is open; folding would destroy undo history.
    Deferred,
}

enum Attempt {
    Installed { records: usize, ticket: MergeTicket },
    Conflicted { conflicts: usize },
    Deferred,
}

impl Table {
    /// Merges one page range, retrying on conflicts with concurrent writers.
    pub fn merge_range(&self, range_id: u32) -> Result<MergeOutcome> {
        let range = self.range(range_id)?;
        let Some(_merging) = range.try_merge_lock() else {
            return Ok(MergeOutcome::Skipped);
        };
        let _fence = self.env.merge_fence.read();
        self.check_live()?;

        let state = range.state();
        if state.next_tail == state.watermark {
            range.reclaim()?;
            return Ok(MergeOutcome::Skipped);
        }

        let limit = self.env.merge_retry_limit;
        for attempt in 1..=limit {
            match self.merge_attempt(&range)? {
                Attempt::Installed { records, ticket } => {
                    let reclaimed = range.finish_merge(ticket)?;
                    info!(
                        table = %self.name(),
                        range = range_id,
                        generation = ticket.generation,
                        records,
                        reclaimed,
                        "merged page range"
                    );
                    return Ok(MergeOutcome::Merged { records, reclaimed });
                }
                Attempt::Deferred => {
                    debug!(table = %self.name(), range = range_id, "merge deferred");
                    return Ok(MergeOutcome::Deferred);
                }
                Attempt::Conflicted { conflicts } => {
                    warn!(
                        table = %self.name(),
                        range = range_id,
                        attempt,
                        conflicts,
                        "merge conflicted with concurrent writers"
                    );
                }
            }
        }

        Err(LStoreError::MergeConflict {
            range_id,
            attempts: limit,
        })
    }

    /// Merges every page range. Returns the number of ranges merged.
    pub fn merge_all(&self) -> Result<usize> {
        let mut merged = 0;
        for range_id in self.range_ids() {
            if let MergeOutcome::Merged { .. } = self.merge_range(range_id)? {
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Writes one base generation off to the side, then installs it key by
    /// key with compare-and-repoint.
    fn merge_attempt(&self, range: &PageRange) -> Result<Attempt> {
        // Markers open under the fence's write side, so none can open
        // before this attempt installs.
        if self.env.clock.has_active() {
            return Ok(Attempt::Deferred);
        }

        let ticket = range.begin_merge_attempt()?;
        let entries = self.index.primary().entries_in_range(range.range_id());
        let capacity = self.layout().base_capacity() as usize;
        if entries.len() > capacity {
            return Err(LStoreError::Internal(format!(
                "range {} holds {} keys, more than its {} base slots",
                range.range_id(),
                entries.len(),
                capacity
            )));
        }

        let full_mask = column_mask(0..self.num_columns());
        let mut staged = Vec::with_capacity(entries.len());
        for (index, (key, rid)) in entries.into_iter().enumerate() {
            let (timestamp, row) = self.resolve_row(range, rid)?;
            let merged = range.merged_rid(ticket.generation, index as u32);
            let meta = VersionMeta {
                indirection: None,
                timestamp,
                schema: full_mask,
            };
            let columns: Vec<(usize, &Value)> = row.iter().enumerate().collect();
            range.write_version(merged, meta, &columns)?;
            staged.push((key, rid, merged, row));
        }

        let records = staged.len();
        let mut conflicts = 0;
        for (key, old, merged, row) in staged {
            let _stripe = self.lock_key(&key);
            if !self.index.primary().compare_and_repoint(&key, old, merged) {
                conflicts += 1;
                continue;
            }
            for (column, index) in self.index.secondaries() {
                if index.remove(&row[column], old) {
                    index.insert(row[column].clone(), merged)?;
                }
            }
        }

        if conflicts > 0 {
            return Ok(Attempt::Conflicted { conflicts });
        }
        Ok(Attempt::Installed { records, ticket })
    }
}

struct MergeJob {
    table: Weak<Table>,
    table_id: u32,
    range_id: u32,
}

#[derive(Default)]
struct MergeQueue {
    jobs: VecDeque<MergeJob>,
    queued: HashSet<(u32, u32)>,
    shutdown: bool,
}

#[derive(Default)]
struct SchedulerShared {
    queue: Mutex<MergeQueue>,
    ready: Condvar,
}

/// Background worker running triggered merges one range at a time.
pub struct MergeScheduler {
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MergeScheduler {
    /// Starts the worker thread.
    pub fn start() -> Result<Arc<Self>> {
        let shared = Arc::new(SchedulerShared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("lstore-merge".to_string())
            .spawn(move || Self::run(&worker_shared))?;

        Ok(Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Queues a range. Returns false if it is already queued or the worker
    /// has stopped.
    pub fn schedule(&self, table: Weak<Table>, table_id: u32, range_id: u32) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown || !queue.queued.insert((table_id, range_id)) {
            return false;
        }
        queue.jobs.push_back(MergeJob {
            table,
            table_id,
            range_id,
        });
        self.shared.ready.notify_one();
        true
    }

    /// Number of queued ranges.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Stops the worker after its current merge. Queued ranges are dropped.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.jobs.clear();
            queue.queued.clear();
        }
        self.shared.ready.notify_all();

        if let Some(worker) = self.worker.lock().take() {
            // The worker can drop the last handle to a table, and with it
            // the scheduler.
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!("merge worker panicked");
            }
        }
    }

    fn run(shared: &SchedulerShared) {
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                while queue.jobs.is_empty() && !queue.shutdown {
                    shared.ready.wait(&mut queue);
                }
                if queue.shutdown {
                    return;
                }
                let Some(job) = queue.jobs.pop_front() else {
                    continue;
                };
                queue.queued.remove(&(job.table_id, job.range_id));
                job
            };

            let Some(table) = job.table.upgrade() else {
                continue;
            };
            match table.merge_range(job.range_id) {
                Ok(outcome) => {
                    debug!(table = %table.name(), range = job.range_id, ?outcome, "background merge finished")
                }
                Err(e) => {
                    warn!(table = %table.name(), range = job.range_id, error = %e, "background merge failed")
                }
            }
        }
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MergeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeScheduler")
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Rid, VersionSpec};
    use crate::table::TableEnv;
    use crate::txn::VersionClock;
    use lstore_buffer::{BufferPool, BufferPoolConfig, MemoryPageStore};
    use lstore_common::page::PageKind;
    use lstore_common::ColumnType;
    use parking_lot::RwLock;
    use std::time::{Duration, Instant};

    fn create_test_env(scheduler: Option<Arc<MergeScheduler>>, threshold: u32) -> TableEnv {
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: 256,
                ..Default::default()
            },
            Arc::new(MemoryPageStore::new()),
        ));
        TableEnv {
            pool,
            clock: Arc::new(VersionClock::default()),
            merge_tail_threshold: threshold,
            merge_retry_limit: 3,
            scheduler,
            merge_fence: Arc::new(RwLock::new(())),
        }
    }

    fn create_test_table(env: TableEnv) -> Arc<Table> {
        Table::create(
            3,
            "accounts".to_string(),
            vec![ColumnType::Int, ColumnType::Int, ColumnType::Int],
            0,
            1,
            env,
        )
        .unwrap()
    }

    fn set(table: &Table, key: i64, column: usize, value: i64) {
        let mut values = vec![None; 3];
        values[column] = Some(Value::Int(value));
        table.update(&Value::Int(key), values).unwrap();
    }

    fn latest(table: &Table, key: i64) -> Vec<Value> {
        table
            .select(&Value::Int(key), &[0, 1, 2], VersionSpec::Latest)
            .unwrap()
            .values
    }

    #[test]
    fn test_merge_preserves_rows() {
        let table = create_test_table(create_test_env(None, u32::MAX));
        for key in 0..50 {
            table
                .insert(vec![Value::Int(key), Value::Int(0), Value::Int(0)])
                .unwrap();
        }
        for key in 0..50 {
            set(&table, key, 1, key * 2);
            if key % 3 == 0 {
                set(&table, key, 2, -key);
            }
        }
        table.delete(&Value::Int(7)).unwrap();

        let before: Vec<Vec<Value>> = (0..50)
            .filter(|&k| k != 7)
            .map(|k| latest(&table, k))
            .collect();

        let outcome = table.merge_range(0).unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged { records: 49, .. }));

        let after: Vec<Vec<Value>> = (0..50)
            .filter(|&k| k != 7)
            .map(|k| latest(&table, k))
            .collect();
        assert_eq!(before, after);

        for key in (0..50).filter(|&k| k != 7) {
            let rid = table.locate(&Value::Int(key)).unwrap();
            assert_eq!(rid.kind, PageKind::Base);
            let range = table.range(0).unwrap();
            assert_eq!(range.read_meta(rid).unwrap().indirection, None);
        }

        let state = table.range_state(0).unwrap();
        assert_eq!(state.generation, 1);
        assert_eq!(state.watermark, state.next_tail);
    }

    #[test]
    fn test_merge_then_update_again() {
        let table = create_test_table(create_test_env(None, u32::MAX));
        table
            .insert(vec![Value::Int(1), Value::Int(10), Value::Int(100)])
            .unwrap();
        set(&table, 1, 1, 11);
        table.merge_range(0).unwrap();

        set(&table, 1, 2, 101);
        assert_eq!(
            latest(&table, 1),
            vec![Value::Int(1), Value::Int(11), Value::Int(101)]
        );

        // A second merge writes generation 2 and reclaims generation 1.
        let outcome = table.merge_range(0).unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged { records: 1, .. }));
        assert_eq!(table.range_state(0).unwrap().generation, 2);
        assert_eq!(
            latest(&table, 1),
            vec![Value::Int(1), Value::Int(11), Value::Int(101)]
        );
        let capacity = table.layout().base_capacity();
        assert_eq!(table.locate(&Value::Int(1)), Some(Rid::base(0, 2 * capacity)));
    }

    #[test]
    fn test_merge_without_new_tails_is_skipped() {
        let table = create_test_table(create_test_env(None, u32::MAX));
        table
            .insert(vec![Value::Int(1), Value::Int(10), Value::Int(100)])
            .unwrap();
        set(&table, 1, 1, 11);

        assert!(matches!(
            table.merge_range(0).unwrap(),
            MergeOutcome::Merged { .. }
        ));
        assert_eq!(table.merge_range(0).unwrap(), MergeOutcome::Skipped);
    }

    #[test]
    fn test_merge_moves_secondary_entries() {
        let table = create_test_table(create_test_env(None, u32::MAX));
        for key in 0..5 {
            table
                .insert(vec![Value::Int(key), Value::Int(key % 2), Value::Int(0)])
                .unwrap();
        }
        table.create_index(1).unwrap();
        set(&table, 4, 1, 1);

        table.merge_range(0).unwrap();

        let odd: Vec<Value> = table
            .select_by(1, &Value::Int(1), &[0], VersionSpec::Latest)
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(odd, vec![Value::Int(1), Value::Int(3), Value::Int(4)]);

        let index = table.index.secondary(1).unwrap();
        for (_, rid) in index.entries() {
            assert!(rid.slot >= table.layout().base_capacity());
        }
    }

    #[test]
    fn test_merge_deferred_while_marker_open() {
        let env = create_test_env(None, u32::MAX);
        let clock = Arc::clone(&env.clock);
        let table = create_test_table(env);
        table
            .insert(vec![Value::Int(1), Value::Int(1), Value::Int(1)])
            .unwrap();
        set(&table, 1, 1, 2);

        let marker = clock.begin();
        assert_eq!(table.merge_range(0).unwrap(), MergeOutcome::Deferred);
        clock.end(marker);
        assert!(matches!(
            table.merge_range(0).unwrap(),
            MergeOutcome::Merged { .. }
        ));
    }

    #[test]
    fn test_as_of_clamps_to_merged_base() {
        let env = create_test_env(None, u32::MAX);
        let clock = Arc::clone(&env.clock);
        let table = create_test_table(env);
        table
            .insert(vec![Value::Int(1), Value::Int(10), Value::Int(0)])
            .unwrap();
        let marker = clock.begin();
        clock.end(marker);
        set(&table, 1, 1, 20);
        table.merge_range(0).unwrap();

        let record = table
            .select(&Value::Int(1), &[1], VersionSpec::AsOf(marker))
            .unwrap();
        assert_eq!(record.values, vec![Value::Int(20)]);
    }

    #[test]
    fn test_inline_merge_on_threshold() {
        let table = create_test_table(create_test_env(None, 1));
        table
            .insert(vec![Value::Int(1), Value::Int(0), Value::Int(0)])
            .unwrap();
        set(&table, 1, 1, 5);

        let state = table.range_state(0).unwrap();
        assert_eq!(state.generation, 1);
        assert_eq!(latest(&table, 1)[1], Value::Int(5));
    }

    #[test]
    fn test_background_merge_on_threshold() {
        let scheduler = MergeScheduler::start().unwrap();
        let table = create_test_table(create_test_env(Some(Arc::clone(&scheduler)), 1));
        table
            .insert(vec![Value::Int(1), Value::Int(0), Value::Int(0)])
            .unwrap();
        set(&table, 1, 1, 5);

        let deadline = Instant::now() + Duration::from_secs(10);
        while table.range_state(0).unwrap().generation == 0 {
            assert!(Instant::now() < deadline, "background merge never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(latest(&table, 1)[1], Value::Int(5));

        scheduler.shutdown();
        assert!(!scheduler.schedule(Arc::downgrade(&table), 3, 0));
    }

    #[test]
    fn test_schedule_dedups_queued_ranges() {
        // No worker, so jobs stay queued.
        let scheduler = MergeScheduler {
            shared: Arc::new(SchedulerShared::default()),
            worker: Mutex::new(None),
        };

        assert!(scheduler.schedule(Weak::new(), 1, 0));
        assert!(!scheduler.schedule(Weak::new(), 1, 0));
        assert!(scheduler.schedule(Weak::new(), 1, 1));
        assert_eq!(scheduler.queued(), 2);

        scheduler.shutdown();
        assert_eq!(scheduler.queued(), 0);
    }
}
