use ccstore::{
    AccessSet, BackwardOcc, ConcurrencyControl, Error, ForwardOcc, Key, LockFreeMvto, Mvto,
    OperationKind, Silo, Store, TwoPhaseLocking, Value,
};
use itertools::Itertools;
use proptest::prelude::*;
use std::{collections::BTreeMap, sync::Barrier, thread};
use Operation::*;

#[test]
fn regression_lost_update() {
    test(vec![vec![Get(0), Put(0, 1)], vec![Get(0), Put(0, 2)]]);
}

#[test]
fn regression_write_skew() {
    test(vec![vec![Get(0), Put(1, 1)], vec![Get(1), Put(0, 2)]]);
}

#[test]
fn regression_blind_writes() {
    test(vec![
        vec![Put(0, 1), Put(1, 1)],
        vec![Put(1, 2), Put(0, 2)],
        vec![Get(0), Get(1)],
    ]);
}

const MAX_TXNS: usize = 3;
const MAX_OPS_PER_TXN: usize = 3;
const NUM_KEYS: Key = 3;

proptest! {
#![proptest_config(ProptestConfig::with_cases(64))]
#[test]
fn concurrent_transactions(scenario in arbitrary_scenario(MAX_TXNS, MAX_OPS_PER_TXN, NUM_KEYS)) {
    test(scenario);
}
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Get(Key),
    Put(Key, Value),
}

impl Operation {
    fn key(self) -> Key {
        match self {
            Get(key) | Put(key, _) => key,
        }
    }

    fn kind(self) -> OperationKind {
        match self {
            Get(_) => OperationKind::Read,
            Put(..) => OperationKind::Write,
        }
    }
}

fn arbitrary_op(num_keys: Key) -> impl Strategy<Value = Operation> {
    let key_range = 0..num_keys;
    prop_oneof![
        key_range.clone().prop_map(Get),
        (key_range, 1..100u64).prop_map(|(key, value)| Put(key, value)),
    ]
}

fn arbitrary_ops(max_ops: usize, num_keys: Key) -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec(arbitrary_op(num_keys), 1..=max_ops)
}

type Scenario = Vec<Vec<Operation>>;

fn arbitrary_scenario(
    max_txns: usize,
    max_ops_per_txn: usize,
    num_keys: Key,
) -> impl Strategy<Value = Scenario> {
    prop::collection::vec(arbitrary_ops(max_ops_per_txn, num_keys), 2..=max_txns)
}

type TransactionIndex = usize;
type ReadHistory = Vec<(Key, Value)>;

#[derive(Debug, PartialEq)]
struct ScenarioOutcome {
    records: BTreeMap<Key, Value>,
    read_histories: BTreeMap<TransactionIndex, ReadHistory>,
}

fn test(scenario: Scenario) {
    fn inner<C: ConcurrencyControl>(scenario: &Scenario) {
        let outcome = run_store::<C>(scenario);

        // Committed transactions must be equivalent to some serial order of
        // them. The order does not have to match the commit identifiers,
        // e.g. forward OCC can append a transaction to the commit log before
        // one it is serialized after.
        let committed: Vec<_> = outcome.read_histories.keys().copied().collect();
        for perm in committed.iter().permutations(committed.len()) {
            let reduced_scenario = perm.iter().map(|&&i| (i, scenario[i].as_slice()));
            if run_reference_model(reduced_scenario) == outcome {
                return;
            }
        }
        panic!(
            "Serializability violation:
Scenario: {scenario:?}
Outcome:  {outcome:?}"
        );
    }

    inner::<Mvto>(&scenario);
    inner::<LockFreeMvto>(&scenario);
    inner::<BackwardOcc>(&scenario);
    inner::<ForwardOcc>(&scenario);
    inner::<Silo>(&scenario);
    inner::<TwoPhaseLocking>(&scenario);
}

fn run_store<C: ConcurrencyControl>(scenario: &Scenario) -> ScenarioOutcome {
    let store = Store::<C>::new(NUM_KEYS);
    let barrier = Barrier::new(scenario.len());

    let results: Vec<_> = thread::scope(|s| {
        let threads: Vec<_> = scenario
            .iter()
            .map(|ops| {
                let store = &store;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    run_txn_on_store(store, ops)
                })
            })
            .collect();
        threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .collect()
    });

    let mut read_histories = BTreeMap::new();
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(read_history) => {
                read_histories.insert(i, read_history);
            }
            Err(Error::Conflict) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    let records = (0..NUM_KEYS)
        .map(|key| (key, store.committed_value(key).unwrap()))
        .collect();
    ScenarioOutcome {
        records,
        read_histories,
    }
}

fn run_txn_on_store<C: ConcurrencyControl>(
    store: &Store<C>,
    ops: &[Operation],
) -> ccstore::Result<ReadHistory> {
    let access: AccessSet = ops
        .iter()
        .map(|op| ccstore::Operation {
            key: op.key(),
            kind: op.kind(),
        })
        .collect();

    let mut worker = store.worker();
    let mut txn = worker.begin_transaction(&access)?;
    let mut read_history = Vec::new();
    for &op in ops {
        match op {
            Get(key) => read_history.push((key, txn.read(key)?)),
            Put(key, value) => txn.write(key, value)?,
        }
    }
    txn.commit()?;
    Ok(read_history)
}

fn run_reference_model<'a>(
    scenario: impl Iterator<Item = (TransactionIndex, &'a [Operation])>,
) -> ScenarioOutcome {
    let mut records: BTreeMap<_, _> = (0..NUM_KEYS).map(|key| (key, 0)).collect();
    let mut read_histories = BTreeMap::new();
    for (i, ops) in scenario {
        // Reads observe the transaction's own writes.
        let mut writes = BTreeMap::new();
        let mut read_history = Vec::new();
        for op in ops {
            match *op {
                Get(key) => {
                    let value = writes.get(&key).or_else(|| records.get(&key));
                    read_history.push((key, *value.unwrap()));
                }
                Put(key, value) => {
                    writes.insert(key, value);
                }
            }
        }
        records.extend(writes);
        read_histories.insert(i, read_history);
    }
    ScenarioOutcome {
        records,
        read_histories,
    }
}
