//! Group/join key extraction shared by aggregation and hash-join runtime.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, Int64Builder, StringArray, StringBuilder};
use arrow_schema::DataType;
use quarry_common::{QuarryError, Result};

/// Owned key value extracted from one row of a key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// Int64 key.
    Int(i64),
    /// Utf8 key.
    Str(String),
}

/// Extracts the key of one row from a key column.
pub fn key_at(array: &ArrayRef, row: usize) -> Result<GroupKey> {
    if array.is_null(row) {
        return Err(QuarryError::Execution(
            "null keys are not supported".to_string(),
        ));
    }
    match array.data_type() {
        DataType::Int64 => {
            let typed = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Int64 key column".to_string()))?;
            Ok(GroupKey::Int(typed.value(row)))
        }
        DataType::Utf8 => {
            let typed = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| QuarryError::Execution("expected Utf8 key column".to_string()))?;
            Ok(GroupKey::Str(typed.value(row).to_string()))
        }
        other => Err(QuarryError::Execution(format!(
            "unsupported key type {other:?}"
        ))),
    }
}

/// Stable hash of a key, used for state-partition and lock-shard selection.
pub fn key_hash(key: &GroupKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Builds a key column from owned keys of a known type.
pub fn keys_to_array(keys: &[GroupKey], data_type: &DataType) -> Result<ArrayRef> {
    match data_type {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(keys.len());
            for key in keys {
                match key {
                    GroupKey::Int(v) => b.append_value(*v),
                    GroupKey::Str(_) => {
                        return Err(QuarryError::Execution(
                            "mixed key types in key column".to_string(),
                        ))
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::new();
            for key in keys {
                match key {
                    GroupKey::Str(v) => b.append_value(v),
                    GroupKey::Int(_) => {
                        return Err(QuarryError::Execution(
                            "mixed key types in key column".to_string(),
                        ))
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        other => Err(QuarryError::Execution(format!(
            "unsupported key type {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_rebuilds_int_keys() {
        let array: ArrayRef = Arc::new(Int64Array::from(vec![7, 9]));
        let keys = vec![key_at(&array, 0).unwrap(), key_at(&array, 1).unwrap()];
        assert_eq!(keys[0], GroupKey::Int(7));
        let rebuilt = keys_to_array(&keys, &DataType::Int64).unwrap();
        let rebuilt = rebuilt.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(rebuilt.values().as_ref(), &[7, 9]);
    }

    #[test]
    fn hash_is_stable_per_key() {
        let a = GroupKey::Str("grape".to_string());
        let b = GroupKey::Str("grape".to_string());
        assert_eq!(key_hash(&a), key_hash(&b));
    }
}
