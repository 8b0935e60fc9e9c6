//! Bounded document query language.
//!
//! An expression is a JSON object. Plain keys are dot-path filters; keys
//! starting with `$` are either logical combinators or meta keys:
//!
//! | Key | Meaning |
//! |---|---|
//! | `field: value` | equality (an array field matches when it contains `value`) |
//! | `field: {"$gt": 1, ...}` | `$eq $ne $gt $gte $lt $lte $in $nin $exists` |
//! | `$and` / `$or` / `$nor` | arrays of sub-filters |
//! | `$orderby` | `[["field", -1], ...]`, or `{"field": 1 \| -1}` for one key |
//! | `$skip`, `$limit` | pagination |
//! | `$count` | result is the number of matches |
//! | `$distinct` | result is the unique values of one field |
//! | `$aggregate` | `{"name": {"$sum" \| "$avg" \| "$min" \| "$max" \| "$count": "field"}}` |
//!
//! JSON objects do not keep key order, so an object `$orderby` with several
//! keys sorts by them in key-name order. Use the array form to set priority.
//!
//! A string value of the form `$collection.docId.field` is a join reference:
//! it is replaced by the current value of that field before evaluation.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::doc::ID_FIELD;
use crate::value::get_path;

const META_KEYS: [&str; 6] = ["$orderby", "$skip", "$limit", "$count", "$distinct", "$aggregate"];

/// What a query produces and what it depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Ordered list of documents
    Docs,
    /// Single value: count, distinct list or aggregate
    Aggregate,
    /// Depends on fields of other documents (see [`JoinRef`])
    Join,
}

impl QueryKind {
    pub fn of(expression: &Value) -> Self {
        if !join_refs(expression).is_empty() {
            QueryKind::Join
        } else if returns_docs(expression) {
            QueryKind::Docs
        } else {
            QueryKind::Aggregate
        }
    }
}

/// `true` unless the expression asks for a count, distinct list or aggregate.
pub fn returns_docs(expression: &Value) -> bool {
    match expression {
        Value::Object(map) => {
            !(map.contains_key("$count") || map.contains_key("$distinct") || map.contains_key("$aggregate"))
        }
        _ => true,
    }
}

/// Reference to a field of another document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JoinRef {
    pub collection_name: String,
    pub doc_id: String,
    pub field: String,
}

impl JoinRef {
    /// Parse `$collection.docId.field[.more]`.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix('$')?;
        let mut parts = rest.splitn(3, '.');
        let collection_name = parts.next().filter(|p| !p.is_empty())?;
        let doc_id = parts.next().filter(|p| !p.is_empty())?;
        let field = parts.next().filter(|p| !p.is_empty())?;
        Some(Self {
            collection_name: collection_name.to_string(),
            doc_id: doc_id.to_string(),
            field: field.to_string(),
        })
    }
}

/// All join references inside an expression.
pub fn join_refs(expression: &Value) -> BTreeSet<JoinRef> {
    let mut refs = BTreeSet::new();
    collect_refs(expression, &mut refs);
    refs
}

fn collect_refs(value: &Value, refs: &mut BTreeSet<JoinRef>) {
    match value {
        Value::String(s) => {
            if let Some(r) = JoinRef::parse(s) {
                refs.insert(r);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, refs)),
        _ => {}
    }
}

/// Replace join references with concrete values; unresolved ones become `null`.
pub fn resolve_joins(expression: &Value, lookup: &impl Fn(&JoinRef) -> Option<Value>) -> Value {
    match expression {
        Value::String(s) => match JoinRef::parse(s) {
            Some(r) => lookup(&r).unwrap_or(Value::Null),
            None => expression.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_joins(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_joins(v, lookup)))
                .collect(),
        ),
        _ => expression.clone(),
    }
}

/// Stable identifier of a live query.
pub fn query_hash(collection_name: &str, expression: &Value) -> String {
    format!("{collection_name}:{}", canonical(expression))
}

/// JSON with object keys sorted at every level.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), canonical(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        _ => value.clone(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Docs(Vec<Value>),
    Value(Value),
}

impl QueryOutput {
    /// Document ids, in result order. Empty for aggregate output.
    pub fn ids(&self) -> Vec<String> {
        match self {
            QueryOutput::Docs(docs) => docs.iter().filter_map(doc_id).collect(),
            QueryOutput::Value(_) => Vec::new(),
        }
    }
}

/// The `_id` of a document snapshot.
pub fn doc_id(doc: &Value) -> Option<String> {
    doc.get(ID_FIELD).and_then(Value::as_str).map(str::to_string)
}

/// Evaluate an expression over live document snapshots (each carrying `_id`).
pub fn evaluate(expression: &Value, docs: impl IntoIterator<Item = Value>) -> QueryOutput {
    let empty = Map::new();
    let meta = expression.as_object().unwrap_or(&empty);

    let mut matched: Vec<Value> = docs.into_iter().filter(|d| matches(expression, d)).collect();
    matched.sort_by(|a, b| order(meta.get("$orderby"), a, b));

    let skip = meta.get("$skip").and_then(Value::as_u64).unwrap_or(0) as usize;
    let mut page: Vec<Value> = matched.into_iter().skip(skip).collect();
    if let Some(limit) = meta.get("$limit").and_then(Value::as_u64) {
        page.truncate(limit as usize);
    }

    if meta.get("$count").is_some_and(|c| c != &Value::Bool(false)) {
        return QueryOutput::Value(Value::from(page.len()));
    }
    if let Some(field) = meta.get("$distinct").and_then(Value::as_str) {
        let mut values: Vec<Value> = Vec::new();
        for doc in &page {
            if let Some(v) = get_path(doc, field) {
                if !values.contains(v) {
                    values.push(v.clone());
                }
            }
        }
        return QueryOutput::Value(Value::Array(values));
    }
    if let Some(Value::Object(specs)) = meta.get("$aggregate") {
        let result = specs
            .iter()
            .map(|(name, spec)| (name.clone(), aggregate(spec, &page)))
            .collect();
        return QueryOutput::Value(Value::Object(result));
    }
    QueryOutput::Docs(page)
}

/// Does `doc` pass the filter part of `expression`?
pub fn matches(expression: &Value, doc: &Value) -> bool {
    let Value::Object(filter) = expression else {
        return true;
    };
    filter.iter().all(|(key, cond)| match key.as_str() {
        "$and" => each_filter(cond).all(|f| matches(f, doc)),
        "$or" => each_filter(cond).any(|f| matches(f, doc)),
        "$nor" => !each_filter(cond).any(|f| matches(f, doc)),
        k if META_KEYS.contains(&k) => true,
        path => field_matches(get_path(doc, path), cond),
    })
}

fn each_filter(cond: &Value) -> impl Iterator<Item = &Value> {
    cond.as_array().into_iter().flatten()
}

fn is_operator_object(cond: &Value) -> bool {
    match cond {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(actual: Option<&Value>, cond: &Value) -> bool {
    if !is_operator_object(cond) {
        return equals(actual, cond);
    }
    let Value::Object(ops) = cond else {
        return false;
    };
    ops.iter().all(|(op, arg)| match op.as_str() {
        "$eq" => equals(actual, arg),
        "$ne" => !equals(actual, arg),
        "$gt" => compare(actual, arg).is_some_and(|o| o == Ordering::Greater),
        "$gte" => compare(actual, arg).is_some_and(|o| o != Ordering::Less),
        "$lt" => compare(actual, arg).is_some_and(|o| o == Ordering::Less),
        "$lte" => compare(actual, arg).is_some_and(|o| o != Ordering::Greater),
        "$in" => each_filter(arg).any(|v| equals(actual, v)),
        "$nin" => !each_filter(arg).any(|v| equals(actual, v)),
        "$exists" => actual.is_some() == arg.as_bool().unwrap_or(true),
        _ => false,
    })
}

/// Equality; a missing field equals `null`, an array contains-matches.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(v) if v == expected => true,
        Some(Value::Array(items)) => items.contains(expected),
        Some(Value::Number(a)) => expected.as_f64().is_some_and(|b| a.as_f64() == Some(b)),
        Some(_) => false,
    }
}

/// Ordering between two values of the same scalar type.
fn compare(actual: Option<&Value>, arg: &Value) -> Option<Ordering> {
    match (actual?, arg) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order for sorting: by type rank, then by value.
fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| match (a, b) {
            (Some(x), Some(y)) => compare(Some(x), y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        })
}

/// `(field, ascending)` in priority order. Object keys come out sorted by
/// name; only the array form carries caller priority.
fn sort_keys(orderby: Option<&Value>) -> Vec<(String, bool)> {
    let direction = |d: &Value| match d {
        Value::Number(n) => n.as_i64().unwrap_or(1) >= 0,
        Value::String(s) => !s.eq_ignore_ascii_case("desc"),
        _ => true,
    };
    match orderby {
        Some(Value::Object(map)) => map.iter().map(|(k, d)| (k.clone(), direction(d))).collect(),
        Some(Value::Array(pairs)) => pairs
            .iter()
            .filter_map(|p| match p {
                Value::String(field) => Some((field.clone(), true)),
                Value::Array(pair) => {
                    let field = pair.first()?.as_str()?;
                    Some((field.to_string(), pair.get(1).map_or(true, direction)))
                }
                _ => None,
            })
            .collect(),
        Some(Value::String(field)) => vec![(field.clone(), true)],
        _ => Vec::new(),
    }
}

/// Sort by `$orderby`, then by `_id` so results are deterministic.
fn order(orderby: Option<&Value>, a: &Value, b: &Value) -> Ordering {
    for (field, ascending) in sort_keys(orderby) {
        let o = sort_cmp(get_path(a, &field), get_path(b, &field));
        let o = if ascending { o } else { o.reverse() };
        if o != Ordering::Equal {
            return o;
        }
    }
    sort_cmp(a.get(ID_FIELD), b.get(ID_FIELD))
}

fn aggregate(spec: &Value, docs: &[Value]) -> Value {
    let Some((func, field)) = spec.as_object().and_then(|m| m.iter().next()) else {
        return Value::Null;
    };
    let field = field.as_str().unwrap_or(ID_FIELD);
    let values: Vec<&Value> = docs.iter().filter_map(|d| get_path(d, field)).collect();
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
    match func.as_str() {
        "$count" => Value::from(values.len()),
        "$sum" => number(numbers.iter().sum()),
        "$avg" if numbers.is_empty() => Value::Null,
        "$avg" => number(numbers.iter().sum::<f64>() / numbers.len() as f64),
        "$min" => values
            .iter()
            .copied()
            .min_by(|a, b| sort_cmp(Some(a), Some(b)))
            .cloned()
            .unwrap_or(Value::Null),
        "$max" => values
            .iter()
            .copied()
            .max_by(|a, b| sort_cmp(Some(a), Some(b)))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Whole floats come back as integers so `$sum` of integers stays integral.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> Vec<Value> {
        vec![
            json!({"_id": "1", "name": "Ann", "age": 31, "tags": ["a", "b"], "city": "Oslo"}),
            json!({"_id": "2", "name": "Bob", "age": 25, "tags": ["b"], "city": "Rome"}),
            json!({"_id": "3", "name": "Cid", "age": 40, "city": "Oslo"}),
            json!({"_id": "4", "name": "Dan", "age": 25, "profile": {"vip": true}}),
        ]
    }

    fn ids(expr: Value) -> Vec<String> {
        evaluate(&expr, people()).ids()
    }

    #[test]
    fn test_equality_and_array_contains() {
        assert_eq!(ids(json!({"city": "Oslo"})), vec!["1", "3"]);
        assert_eq!(ids(json!({"tags": "b"})), vec!["1", "2"]);
        assert_eq!(ids(json!({"profile.vip": true})), vec!["4"]);
        assert_eq!(ids(json!({"city": null})), vec!["4"]);
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(ids(json!({"age": {"$gt": 25, "$lte": 40}})), vec!["1", "3"]);
        assert_eq!(ids(json!({"age": {"$in": [25]}})), vec!["2", "4"]);
        assert_eq!(ids(json!({"city": {"$ne": "Oslo"}})), vec!["2", "4"]);
        assert_eq!(ids(json!({"city": {"$exists": false}})), vec!["4"]);
        assert_eq!(ids(json!({"$or": [{"name": "Ann"}, {"age": 40}]})), vec!["1", "3"]);
        assert_eq!(ids(json!({"$nor": [{"city": "Oslo"}]})), vec!["2", "4"]);
    }

    #[test]
    fn test_orderby_skip_limit() {
        assert_eq!(
            ids(json!({"$orderby": [["age", -1], ["name", 1]]})),
            vec!["3", "1", "2", "4"]
        );
        assert_eq!(ids(json!({"$orderby": {"age": 1}, "$skip": 1, "$limit": 2})), vec!["4", "1"]);
    }

    #[test]
    fn test_orderby_priority_needs_array_form() {
        assert_eq!(
            ids(json!({"$orderby": [["name", -1], ["age", 1]]})),
            vec!["4", "3", "2", "1"]
        );
        // Object keys sort by name: `age` outranks `name` whatever the
        // written order.
        assert_eq!(ids(json!({"$orderby": {"name": -1, "age": 1}})), vec!["4", "2", "1", "3"]);
    }

    #[test]
    fn test_count_distinct_aggregate() {
        assert_eq!(evaluate(&json!({"age": 25, "$count": true}), people()), QueryOutput::Value(json!(2)));
        assert_eq!(
            evaluate(&json!({"$distinct": "city"}), people()),
            QueryOutput::Value(json!(["Oslo", "Rome"]))
        );
        let out = evaluate(
            &json!({"$aggregate": {
                "total": {"$sum": "age"},
                "avg": {"$avg": "age"},
                "oldest": {"$max": "age"},
                "n": {"$count": "city"}
            }}),
            people(),
        );
        assert_eq!(
            out,
            QueryOutput::Value(json!({"total": 121, "avg": 30.25, "oldest": 40, "n": 3}))
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(QueryKind::of(&json!({"a": 1})), QueryKind::Docs);
        assert_eq!(QueryKind::of(&json!({"$count": true})), QueryKind::Aggregate);
        assert_eq!(QueryKind::of(&json!({"owner": "$users.1.name"})), QueryKind::Join);
        assert_eq!(QueryKind::of(&json!({"owner": "$users"})), QueryKind::Docs);
    }

    #[test]
    fn test_resolve_joins() {
        let expr = json!({"city": "$settings.me.city", "age": {"$gt": "$settings.me.minAge"}});
        let refs = join_refs(&expr);
        assert_eq!(refs.len(), 2);
        let resolved = resolve_joins(&expr, &|r: &JoinRef| match r.field.as_str() {
            "city" => Some(json!("Oslo")),
            _ => None,
        });
        assert_eq!(resolved, json!({"city": "Oslo", "age": {"$gt": null}}));
        assert_eq!(evaluate(&resolved, people()).ids(), Vec::<String>::new());
    }

    #[test]
    fn test_query_hash_is_stable() {
        let a = query_hash("users", &json!({"b": 1, "a": 2}));
        let b = query_hash("users", &json!({"a": 2, "b": 1}));
        assert_eq!(a, b);
        assert!(a.starts_with("users:"));
    }
}
