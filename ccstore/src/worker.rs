use crate::{
    concurrency_control::TransactionExecutor, AccessSet, BackwardOcc, CommitId,
    ConcurrencyControl, Error, ForwardOcc, Key, LockFreeMvto, Mvto, Operation, OperationKind,
    Result, Silo, StoreOptions, Transaction, TwoPhaseLocking, Value,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{collections::HashMap, marker::PhantomData, time::Duration};

/// A handle to perform transactions on a [`Store`](crate::Store).
pub struct Worker<'a, C: ConcurrencyControl + 'a> {
    pub(crate) txn_executor: C::Executor<'a>,
    pub(crate) stats: WorkerStats,
    rng: SmallRng,
    abort_backoff: Duration,
    max_retries: Option<u64>,
    _marker: PhantomData<*const ()>,
}

static_assertions::assert_not_impl_any!(Worker<'_, Mvto>: Send, Sync);
static_assertions::assert_not_impl_any!(Worker<'_, LockFreeMvto>: Send, Sync);
static_assertions::assert_not_impl_any!(Worker<'_, BackwardOcc>: Send, Sync);
static_assertions::assert_not_impl_any!(Worker<'_, ForwardOcc>: Send, Sync);
static_assertions::assert_not_impl_any!(Worker<'_, Silo>: Send, Sync);
static_assertions::assert_not_impl_any!(Worker<'_, TwoPhaseLocking>: Send, Sync);

/// Counters of the transactions performed by a [`Worker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub commits: u64,
    pub aborts: u64,
}

/// The outcome of [`Worker::execute`].
#[derive(Debug, Clone)]
pub struct Execution {
    pub commit_id: CommitId,

    /// The number of attempts that aborted before the successful one.
    pub aborts: u64,

    /// Keys and values read by the successful attempt, in order.
    pub reads: Vec<(Key, Value)>,
}

impl<'db, C: ConcurrencyControl> Worker<'db, C> {
    pub(crate) fn new(txn_executor: C::Executor<'db>, options: &StoreOptions) -> Self {
        Self {
            txn_executor,
            stats: Default::default(),
            rng: SmallRng::from_entropy(),
            abort_backoff: options.abort_backoff,
            max_retries: options.max_retries,
            _marker: PhantomData,
        }
    }

    /// Begins a new transaction.
    ///
    /// `access` declares the keys the transaction is going to access.
    /// Only [`TwoPhaseLocking`] requires the declaration, as it acquires all
    /// the locks here.
    ///
    /// A [`Worker`] can only have one active transaction at a time.
    pub fn begin_transaction<'worker>(
        &'worker mut self,
        access: &AccessSet,
    ) -> Result<Transaction<'db, 'worker, C>> {
        // Rather than instantiating a TransactionExecutor every time
        // a transaction begins, the single instance is reused so that buffers
        // allocated by TransactionExecutor can be reused.
        if let Err(err) = self.txn_executor.begin_transaction(access) {
            self.txn_executor.abort();
            self.txn_executor.end_transaction();
            return Err(err);
        }
        Ok(Transaction::new(self))
    }

    /// Runs `operations` as a transaction until it commits.
    ///
    /// A read of a key makes the transaction later write the read value
    /// plus one to the key. A write of a key that was not read writes zero.
    ///
    /// On a conflict, the transaction is aborted and retried from scratch
    /// after a randomized backoff.
    pub fn execute(&mut self, operations: &[Operation]) -> Result<Execution> {
        let access = AccessSet::from_operations(operations);
        let mut aborts = 0;
        loop {
            match self.try_execute(operations, &access) {
                Ok((commit_id, reads)) => {
                    return Ok(Execution {
                        commit_id,
                        aborts,
                        reads,
                    })
                }
                Err(Error::Conflict) => aborts += 1,
                Err(err) => return Err(err),
            }

            if self.max_retries.is_some_and(|max_retries| aborts > max_retries) {
                tracing::warn!(attempts = aborts, "retry limit exceeded");
                return Err(Error::RetryLimitExceeded { attempts: aborts });
            }
            tracing::trace!(aborts, "retrying transaction");
            self.backoff();
        }
    }

    fn try_execute(
        &mut self,
        operations: &[Operation],
        access: &AccessSet,
    ) -> Result<(CommitId, Vec<(Key, Value)>)> {
        let mut txn = self.begin_transaction(access)?;
        let mut local_values = HashMap::new();
        let mut reads = Vec::new();
        for op in operations {
            match op.kind {
                OperationKind::Read => {
                    let value = txn.read(op.key)?;
                    reads.push((op.key, value));
                    local_values.insert(op.key, value.wrapping_add(1));
                }
                OperationKind::Write => {
                    let value = local_values.get(&op.key).copied().unwrap_or(0);
                    txn.write(op.key, value)?;
                }
            }
        }
        Ok((txn.commit()?, reads))
    }

    fn backoff(&mut self) {
        if self.abort_backoff.is_zero() {
            std::thread::yield_now();
            return;
        }
        let max_nanos = u64::try_from(self.abort_backoff.as_nanos()).unwrap_or(u64::MAX);
        let nanos = self.rng.gen_range(0..=max_nanos);
        std::thread::sleep(Duration::from_nanos(nanos));
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use crate::{Error, Mvto, Operation, Silo, Store, TwoPhaseLocking};

    #[test]
    fn value_rule() {
        let store = Store::<Silo>::new(3);
        let mut worker = store.worker();

        let execution = worker
            .execute(&[
                Operation::read(0),
                Operation::write(0),
                Operation::write(1),
                Operation::read(0),
                Operation::write(2),
            ])
            .unwrap();
        assert_eq!(execution.aborts, 0);
        assert_eq!(execution.reads, vec![(0, 0), (0, 1)]);
        assert_eq!(store.committed_value(0).unwrap(), 1);
        assert_eq!(store.committed_value(1).unwrap(), 0);
        assert_eq!(store.committed_value(2).unwrap(), 0);

        let execution = worker
            .execute(&[Operation::read(0), Operation::read(1), Operation::write(1)])
            .unwrap();
        assert_eq!(execution.reads, vec![(0, 1), (1, 0)]);
        assert_eq!(store.committed_value(1).unwrap(), 1);
        assert_eq!(
            worker.stats(),
            crate::WorkerStats {
                commits: 2,
                aborts: 0
            }
        );
    }

    #[test]
    fn errors_other_than_conflicts_are_not_retried() {
        let store = Store::<TwoPhaseLocking>::new(2);
        let mut worker = store.worker();
        assert!(matches!(
            worker.execute(&[Operation::read(0), Operation::write(2)]),
            Err(Error::KeyOutOfRange(2))
        ));

        let store = Store::<Mvto>::new(2);
        let mut worker = store.worker();
        assert!(matches!(
            worker.execute(&[Operation::read(7)]),
            Err(Error::KeyOutOfRange(7))
        ));
        assert_eq!(worker.stats().aborts, 1);
    }
}
