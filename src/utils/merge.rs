use serde_json::Value;

/// Deep-merges `source` into `target`.
///
/// Objects are merged key by key, arrays are concatenated (`target` items first) and any other
/// combination is resolved by taking `source`.
pub fn merge(target: &mut Value, source: Value) {
	match (target, source) {
		(Value::Object(target), Value::Object(source)) => {
			for (key, value) in source {
				match target.get_mut(&key) {
					Some(existing) => merge(existing, value),
					None => {
						target.insert(key, value);
					}
				}
			}
		}
		(Value::Array(target), Value::Array(source)) => target.extend(source),
		(target, source) => *target = source,
	}
}

/// Folds partial results into a single value using [`merge`].
/// Returns [`Value::Null`] for an empty input.
pub fn merge_all(values: impl IntoIterator<Item = Value>) -> Value {
	let mut values = values.into_iter();
	let Some(mut merged) = values.next() else {
		return Value::Null;
	};
	for value in values {
		merge(&mut merged, value);
	}
	merged
}
