use crate::{
    concurrency_control::TransactionExecutor, CommitId, ConcurrencyControl, Error, Key, Result,
    Value, Worker,
};

pub struct Transaction<'db, 'worker, C: ConcurrencyControl> {
    worker: &'worker mut Worker<'db, C>,
    is_active: bool,
}

impl<'db, 'worker, C: ConcurrencyControl> Transaction<'db, 'worker, C> {
    pub(crate) fn new(worker: &'worker mut Worker<'db, C>) -> Self {
        Self {
            worker,
            is_active: true,
        }
    }

    /// Returns the value of the record.
    ///
    /// Reads of the keys the transaction wrote return the written values.
    pub fn read(&mut self, key: Key) -> Result<Value> {
        self.try_mutate(|executor| executor.read(key))
    }

    /// Writes a value to the record.
    ///
    /// The value becomes visible to other transactions only after
    /// the transaction commits.
    pub fn write(&mut self, key: Key, value: Value) -> Result<()> {
        self.try_mutate(|executor| executor.write(key, value))
    }

    /// Commits the transaction.
    ///
    /// Even if the transaction consists only of [`read`]s, the transaction
    /// must be committed and must succeed.
    /// If the commit fails, [`read`] may have returned inconsistent values,
    /// so the values returned by [`read`] must be discarded.
    ///
    /// # Returns
    /// The identifier of the transaction, which orders it among the other
    /// committed transactions of the store.
    ///
    /// [`read`]: #method.read
    pub fn commit(mut self) -> Result<CommitId> {
        if !self.is_active {
            return Err(Error::AlreadyAborted);
        }
        let commit_id = self.worker.txn_executor.commit()?; // `do_abort` is called in `drop` on `Err`
        self.worker.txn_executor.end_transaction();
        self.worker.stats.commits += 1;
        self.is_active = false;
        Ok(commit_id)
    }

    /// Aborts the transaction.
    ///
    /// All the changes made in the transaction are rolled back.
    pub fn abort(mut self) {
        self.do_abort();
    }

    fn try_mutate<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut C::Executor<'db>) -> Result<T>,
    {
        if !self.is_active {
            return Err(Error::AlreadyAborted);
        }
        let result = f(&mut self.worker.txn_executor);
        if result.is_err() {
            self.do_abort();
        }
        result
    }

    fn do_abort(&mut self) {
        if !self.is_active {
            return;
        }
        self.worker.txn_executor.abort();
        self.worker.txn_executor.end_transaction();
        self.worker.stats.aborts += 1;
        self.is_active = false;
    }
}

impl<C: ConcurrencyControl> Drop for Transaction<'_, '_, C> {
    /// [`abort`] the transaction if not committed or aborted.
    ///
    /// [`abort`]: #method.abort
    fn drop(&mut self) {
        self.do_abort();
    }
}
