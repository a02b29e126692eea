//! Version-chain resolution checked against an in-memory model.

use lstore_storage::{ColumnType, Database, MergeOutcome, StorageConfig, VersionSpec, Value};
use proptest::prelude::*;

const KEYS: i64 = 4;
const COLUMNS: usize = 3;

#[derive(Clone, Debug)]
enum Op {
    Set { key: i64, column: usize, value: i64 },
    Merge,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        8 => (0..KEYS, 1..COLUMNS, any::<i64>())
            .prop_map(|(key, column, value)| Op::Set { key, column, value }),
        1 => Just(Op::Merge),
    ]
}

/// Rows a key went through since its last merge, oldest first.
type History = Vec<Vec<i64>>;

fn run_sequence(ops: &[Op]) -> Result<(), TestCaseError> {
    let config = StorageConfig {
        buffer_pool_pages: 64,
        background_merge: false,
        merge_tail_threshold: u32::MAX,
        ..Default::default()
    };
    let db = Database::in_memory(config).map_err(|e| TestCaseError::fail(e.to_string()))?;
    let table = db
        .create_table("model", vec![ColumnType::Int; COLUMNS], 0)
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    let mut model: Vec<History> = Vec::new();
    for key in 0..KEYS {
        table
            .insert(vec![Value::Int(key), Value::Int(0), Value::Int(0)])
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        model.push(vec![vec![key, 0, 0]]);
    }

    for op in ops {
        match *op {
            Op::Set { key, column, value } => {
                let mut values = vec![None; COLUMNS];
                values[column] = Some(Value::Int(value));
                table
                    .update(&Value::Int(key), values)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;

                let history = &mut model[key as usize];
                let mut next = history[history.len() - 1].clone();
                next[column] = value;
                history.push(next);
            }
            Op::Merge => {
                let outcome = table
                    .merge_range(0)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                if let MergeOutcome::Merged { .. } = outcome {
                    for history in &mut model {
                        let latest = history[history.len() - 1].clone();
                        *history = vec![latest];
                    }
                }
            }
        }
    }

    for (key, history) in model.iter().enumerate() {
        for steps in 0..history.len() + 2 {
            let record = table
                .select(
                    &Value::Int(key as i64),
                    &[0, 1, 2],
                    VersionSpec::Relative(steps as u32),
                )
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let index = history.len() - 1 - steps.min(history.len() - 1);
            let expected: Vec<Value> = history[index].iter().map(|&v| Value::Int(v)).collect();
            prop_assert_eq!(record.values, expected);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_relative_versions_match_model(ops in prop::collection::vec(op_strategy(), 0..80)) {
        run_sequence(&ops)?;
    }
}

#[test]
fn test_as_of_walks_back_to_marker() {
    let config = StorageConfig {
        background_merge: false,
        ..Default::default()
    };
    let db = Database::in_memory(config).unwrap();
    let table = db
        .create_table("clock", vec![ColumnType::Int, ColumnType::Int], 0)
        .unwrap();
    table.insert(vec![Value::Int(1), Value::Int(0)]).unwrap();

    let mut markers = Vec::new();
    for n in 1..=10 {
        let marker = db.begin();
        db.commit(marker).unwrap();
        markers.push(marker);
        table
            .update(&Value::Int(1), vec![None, Some(Value::Int(n))])
            .unwrap();
    }

    for (n, marker) in markers.into_iter().enumerate() {
        let record = table
            .select(&Value::Int(1), &[1], VersionSpec::AsOf(marker))
            .unwrap();
        assert_eq!(record.values, vec![Value::Int(n as i64)]);
    }
}
