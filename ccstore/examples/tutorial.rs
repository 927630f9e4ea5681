use anyhow::Result;
use ccstore::{Access, AccessSet, Error, Mvto, Operation, Store, StoreOptions, TwoPhaseLocking};

fn main() -> Result<()> {
    // A store holds a fixed number of records, each of which holds
    // an integer initialized to zero. The concurrency control protocol is
    // chosen with the type parameter.
    let store = Store::<Mvto>::new(4);

    // You need to spawn workers to execute transactions.
    // Spawn one worker per thread.
    let mut worker = store.worker();

    // All the operations (read, write, and commit) can fail due to
    // conflicts with other concurrent transactions.
    // On failure, the transaction is aborted and the error is returned.
    // In this example, the operations can't fail because there are no other
    // concurrent transactions.

    let mut txn = worker.begin_transaction(&AccessSet::new())?;
    assert_eq!(txn.read(0)?, 0);
    txn.write(0, 42)?;
    let commit_id1 = txn.commit()?;

    // You can also abort a transaction.
    // When a transaction is aborted, all the changes made in the transaction
    // are rolled back.
    let mut txn = worker.begin_transaction(&AccessSet::new())?;
    txn.write(0, 1)?;
    txn.write(1, 2)?;
    txn.abort();

    let mut txn = worker.begin_transaction(&AccessSet::new())?;
    assert_eq!(txn.read(0)?, 42);
    assert_eq!(txn.read(1)?, 0);
    let commit_id2 = txn.commit()?;

    // Commit identifiers order the committed transactions.
    assert!(commit_id1 < commit_id2);

    // `execute` runs a sequence of operations as a transaction, and retries
    // it until it commits. A read of a key makes a later write of the key
    // write the read value plus one.
    let execution = worker.execute(&[Operation::read(2), Operation::write(2)])?;
    assert_eq!(execution.reads, vec![(2, 0)]);
    assert_eq!(store.committed_value(2)?, 1);

    // Two-phase locking acquires all the locks when a transaction begins,
    // so the keys have to be declared up front.
    let store = StoreOptions::new().keys(2).open::<TwoPhaseLocking>();
    let mut worker = store.worker();

    let mut access = AccessSet::new();
    access.insert(0, Access::READ);
    access.insert(1, Access::READ_WRITE);
    let mut txn = worker.begin_transaction(&access)?;
    let value = txn.read(0)?;
    txn.write(1, value + 1)?;
    txn.commit()?;

    let mut txn = worker.begin_transaction(&access)?;
    assert!(matches!(txn.write(0, 1), Err(Error::UndeclaredAccess(0))));

    print!("{}", store.dump());
    Ok(())
}
