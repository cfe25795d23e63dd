//! Qdrant filter translation and filtered search.

use std::collections::HashMap;

use qdrant_client::qdrant::condition::ConditionOneOf;
use qdrant_client::qdrant::r#match::MatchValue;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, FieldCondition, Filter, IsNullCondition, Match, PointId, Range, RepeatedIntegers,
    RepeatedStrings, SearchPointsBuilder, Value,
};
use qdrant_client::Qdrant;
use tracing::debug;

use lineage_core::sql::{CompareOp, Expr};
use lineage_core::{
    ErrorCode, FilterTranslator, LineageError, LineageResult, QdrantConfig, SqlValue,
};

fn unsupported(what: impl std::fmt::Display) -> LineageError {
    LineageError::query_build(
        format!("{} is unsupported in vector filter", what),
        ErrorCode::QryUnsupported,
    )
}

/// Compiles the expression AST into a Qdrant payload [`Filter`].
///
/// Column references become payload keys; the table qualifier is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct QdrantFilterTranslator;

impl QdrantFilterTranslator {
    pub fn new() -> Self {
        Self
    }

    /// One condition for `expr`. Negated and compound nodes nest a filter.
    fn condition(&self, expr: &Expr) -> LineageResult<Condition> {
        match expr {
            Expr::And(_)
            | Expr::Or(_)
            | Expr::Not(_)
            | Expr::Compare { op: CompareOp::Neq, .. }
            | Expr::In { negated: true, .. }
            | Expr::IsNull { negated: true, .. } => Ok(Condition {
                condition_one_of: Some(ConditionOneOf::Filter(self.translate(expr)?)),
            }),
            leaf => self.leaf(leaf),
        }
    }

    /// The non-negated form of a comparison leaf.
    fn leaf(&self, expr: &Expr) -> LineageResult<Condition> {
        match expr {
            Expr::Compare { op, left, right } => {
                let (key, op, value) = operands(*op, left, right)?;
                match op {
                    CompareOp::Eq | CompareOp::Neq => match_condition(key, value),
                    CompareOp::Gt => range_condition(key, Range { gt: Some(number(value)?), ..Default::default() }),
                    CompareOp::Gte => range_condition(key, Range { gte: Some(number(value)?), ..Default::default() }),
                    CompareOp::Lt => range_condition(key, Range { lt: Some(number(value)?), ..Default::default() }),
                    CompareOp::Lte => range_condition(key, Range { lte: Some(number(value)?), ..Default::default() }),
                }
            }
            Expr::In { expr, values, .. } => {
                let key = payload_key(expr)?;
                let match_value = if values.iter().all(|v| matches!(v, SqlValue::Int(_))) {
                    MatchValue::Integers(RepeatedIntegers {
                        integers: values
                            .iter()
                            .filter_map(|v| match v {
                                SqlValue::Int(i) => Some(*i),
                                _ => None,
                            })
                            .collect(),
                    })
                } else {
                    let strings = values
                        .iter()
                        .map(|v| keyword(v).ok_or_else(|| unsupported(format!("IN value {:?}", v))))
                        .collect::<LineageResult<Vec<_>>>()?;
                    MatchValue::Keywords(RepeatedStrings { strings })
                };
                Ok(field(FieldCondition {
                    key,
                    r#match: Some(Match {
                        match_value: Some(match_value),
                    }),
                    ..Default::default()
                }))
            }
            Expr::Between { expr, low, high } => range_condition(
                payload_key(expr)?,
                Range {
                    gte: Some(number(literal(low)?)?),
                    lte: Some(number(literal(high)?)?),
                    ..Default::default()
                },
            ),
            Expr::IsNull { expr, .. } => Ok(Condition {
                condition_one_of: Some(ConditionOneOf::IsNull(IsNullCondition {
                    key: payload_key(expr)?,
                })),
            }),
            other => Err(unsupported(node_name(other))),
        }
    }
}

impl FilterTranslator for QdrantFilterTranslator {
    type Output = Filter;

    fn translate(&self, expr: &Expr) -> LineageResult<Filter> {
        let filter = match expr {
            Expr::And(items) => Filter {
                must: items.iter().map(|e| self.condition(e)).collect::<LineageResult<_>>()?,
                ..Default::default()
            },
            Expr::Or(items) => Filter {
                should: items.iter().map(|e| self.condition(e)).collect::<LineageResult<_>>()?,
                ..Default::default()
            },
            Expr::Not(inner) => Filter {
                must_not: vec![self.condition(inner)?],
                ..Default::default()
            },
            Expr::Compare { op: CompareOp::Neq, .. }
            | Expr::In { negated: true, .. }
            | Expr::IsNull { negated: true, .. } => Filter {
                must_not: vec![self.leaf(expr)?],
                ..Default::default()
            },
            leaf => Filter {
                must: vec![self.leaf(leaf)?],
                ..Default::default()
            },
        };
        Ok(filter)
    }
}

fn field(condition: FieldCondition) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(condition)),
    }
}

fn range_condition(key: String, range: Range) -> LineageResult<Condition> {
    Ok(field(FieldCondition {
        key,
        range: Some(range),
        ..Default::default()
    }))
}

fn match_condition(key: String, value: &SqlValue) -> LineageResult<Condition> {
    let match_value = match value {
        SqlValue::Int(i) => MatchValue::Integer(*i),
        SqlValue::Bool(b) => MatchValue::Boolean(*b),
        // Qdrant has no float match; an exact value is a closed range.
        SqlValue::Float(f) => {
            return range_condition(
                key,
                Range {
                    gte: Some(*f),
                    lte: Some(*f),
                    ..Default::default()
                },
            )
        }
        other => MatchValue::Keyword(
            keyword(other).ok_or_else(|| unsupported(format!("match on {:?}", other)))?,
        ),
    };
    Ok(field(FieldCondition {
        key,
        r#match: Some(Match {
            match_value: Some(match_value),
        }),
        ..Default::default()
    }))
}

fn keyword(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Text(s) => Some(s.clone()),
        SqlValue::Uuid(u) => Some(u.to_string()),
        _ => None,
    }
}

fn number(value: &SqlValue) -> LineageResult<f64> {
    match value {
        SqlValue::Int(i) => Ok(*i as f64),
        SqlValue::Float(f) => Ok(*f),
        other => Err(unsupported(format!("range over {:?}", other))),
    }
}

fn payload_key(expr: &Expr) -> LineageResult<String> {
    match expr {
        Expr::Column(c) => Ok(c.name.clone()),
        other => Err(unsupported(node_name(other))),
    }
}

fn literal(expr: &Expr) -> LineageResult<&SqlValue> {
    match expr {
        Expr::Param(v) | Expr::Inline(v) => Ok(v),
        other => Err(unsupported(node_name(other))),
    }
}

/// Key, operator and value of a column/literal comparison. A literal on the
/// left flips the operator.
fn operands<'a>(
    op: CompareOp,
    left: &'a Expr,
    right: &'a Expr,
) -> LineageResult<(String, CompareOp, &'a SqlValue)> {
    if let Expr::Column(_) = left {
        return Ok((payload_key(left)?, op, literal(right)?));
    }
    let flipped = match op {
        CompareOp::Gt => CompareOp::Lt,
        CompareOp::Gte => CompareOp::Lte,
        CompareOp::Lt => CompareOp::Gt,
        CompareOp::Lte => CompareOp::Gte,
        same => same,
    };
    Ok((payload_key(right)?, flipped, literal(left)?))
}

fn node_name(expr: &Expr) -> &'static str {
    match expr {
        Expr::Column(_) => "column",
        Expr::Star(_) => "star",
        Expr::Param(_) | Expr::Inline(_) => "bare literal",
        Expr::Compare { .. } => "comparison",
        Expr::In { .. } => "IN",
        Expr::Between { .. } => "BETWEEN",
        Expr::IsNull { .. } => "IS NULL",
        Expr::Like { .. } => "LIKE",
        Expr::And(_) | Expr::Or(_) | Expr::Not(_) => "boolean",
        Expr::Function(_) => "function call",
        Expr::Coalesce(_) => "COALESCE",
        Expr::Distance { .. } => "vector distance",
        Expr::Subquery(_) => "subquery",
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: serde_json::Value,
}

/// Similarity search over one collection with AST filters.
pub struct QdrantSearch {
    client: Qdrant,
    collection: String,
    translator: QdrantFilterTranslator,
}

impl QdrantSearch {
    pub fn connect(config: &QdrantConfig) -> LineageResult<Self> {
        let mut builder = Qdrant::from_url(&config.url);
        if let Some(key) = &config.api_key {
            builder = builder.api_key(key.clone());
        }
        let client = builder.build().map_err(|e| {
            LineageError::backend_with_source(
                format!("Failed to create Qdrant client: {}", e),
                ErrorCode::DbConnectionFailed,
                e,
            )
        })?;
        Ok(Self {
            client,
            collection: config.collection.clone(),
            translator: QdrantFilterTranslator::new(),
        })
    }

    pub async fn search(
        &self,
        vector: &[f32],
        filter: Option<&Expr>,
        limit: u64,
    ) -> LineageResult<Vec<ScoredPoint>> {
        let mut request =
            SearchPointsBuilder::new(&self.collection, vector.to_vec(), limit).with_payload(true);
        if let Some(expr) = filter {
            request = request.filter(self.translator.translate(expr)?);
        }
        debug!(collection = %self.collection, limit, filtered = filter.is_some(), "qdrant search");

        let response = self.client.search_points(request).await.map_err(|e| {
            LineageError::backend_with_source(
                format!("Failed to search vectors: {}", e),
                ErrorCode::DbOperationFailed,
                e,
            )
        })?;

        Ok(response
            .result
            .into_iter()
            .map(|point| ScoredPoint {
                id: point_id(point.id),
                score: point.score,
                payload: payload_to_json(point.payload),
            })
            .collect())
    }
}

fn point_id(id: Option<PointId>) -> String {
    use qdrant_client::qdrant::point_id::PointIdOptions;

    match id.and_then(|p| p.point_id_options) {
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        Some(PointIdOptions::Num(num)) => num.to_string(),
        None => String::new(),
    }
}

fn payload_to_json(payload: HashMap<String, Value>) -> serde_json::Value {
    serde_json::Value::Object(
        payload
            .into_iter()
            .map(|(k, v)| (k, value_to_json(v)))
            .collect(),
    )
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value.kind {
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(f)) => serde_json::Value::from(f),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => payload_to_json(s.fields),
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_core::sql::{col, not_, param, qcol};

    fn translate(expr: &Expr) -> Filter {
        QdrantFilterTranslator::new().translate(expr).unwrap()
    }

    fn field_of(condition: &Condition) -> &FieldCondition {
        match &condition.condition_one_of {
            Some(ConditionOneOf::Field(f)) => f,
            other => panic!("expected field condition, got {:?}", other),
        }
    }

    fn nested(condition: &Condition) -> &Filter {
        match &condition.condition_one_of {
            Some(ConditionOneOf::Filter(f)) => f,
            other => panic!("expected nested filter, got {:?}", other),
        }
    }

    #[test]
    fn test_or_becomes_should() {
        let expr = col("topic")
            .eq(param("animals"))
            .or(qcol("p", "topic").eq(param("physics")));
        let filter = translate(&expr);
        assert!(filter.must.is_empty());
        assert_eq!(filter.should.len(), 2);

        let second = field_of(&filter.should[1]);
        assert_eq!(second.key, "topic");
        assert_eq!(
            second.r#match.as_ref().unwrap().match_value,
            Some(MatchValue::Keyword("physics".into()))
        );
    }

    #[test]
    fn test_and_with_ranges() {
        let expr = col("year")
            .gte(param(2020))
            .and(col("score").between(param(0.5), param(1.0)));
        let filter = translate(&expr);
        assert_eq!(filter.must.len(), 2);

        let year = field_of(&filter.must[0]).range.clone().unwrap();
        assert_eq!(year.gte, Some(2020.0));
        let score = field_of(&filter.must[1]).range.clone().unwrap();
        assert_eq!((score.gte, score.lte), (Some(0.5), Some(1.0)));
    }

    #[test]
    fn test_negations_become_must_not() {
        let filter = translate(&col("status").neq(param("archived")));
        assert!(filter.must.is_empty());
        assert_eq!(filter.must_not.len(), 1);

        let filter = translate(&not_(col("pinned").eq(param(true))));
        assert_eq!(
            field_of(&filter.must_not[0]).r#match.as_ref().unwrap().match_value,
            Some(MatchValue::Boolean(true))
        );

        // A negated leaf inside AND nests its own filter.
        let filter = translate(&col("a").eq(param(1)).and(col("b").is_not_null()));
        let inner = nested(&filter.must[1]);
        assert!(matches!(
            inner.must_not[0].condition_one_of,
            Some(ConditionOneOf::IsNull(_))
        ));
    }

    #[test]
    fn test_in_list_matches_any() {
        let filter = translate(&col("tag").in_list(vec!["a".into(), "b".into()]));
        assert_eq!(
            field_of(&filter.must[0]).r#match.as_ref().unwrap().match_value,
            Some(MatchValue::Keywords(RepeatedStrings {
                strings: vec!["a".into(), "b".into()]
            }))
        );

        let filter = translate(&col("id").in_list(vec![1i64.into(), 2i64.into()]));
        assert_eq!(
            field_of(&filter.must[0]).r#match.as_ref().unwrap().match_value,
            Some(MatchValue::Integers(RepeatedIntegers { integers: vec![1, 2] }))
        );
    }

    #[test]
    fn test_literal_on_left_flips_operator() {
        let filter = translate(&param(10).lt(col("count")));
        let range = field_of(&filter.must[0]).range.clone().unwrap();
        assert_eq!(range.gt, Some(10.0));
    }

    #[test]
    fn test_unsupported_nodes_rejected() {
        let err = QdrantFilterTranslator::new()
            .translate(&col("title").like(param("%cat%")))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::QryUnsupported);
        assert!(err.to_string().contains("unsupported in vector filter"));

        let err = QdrantFilterTranslator::new()
            .translate(&col("created").gt(param("yesterday")))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::QryUnsupported);
    }

    #[test]
    fn test_payload_decoding() {
        let mut payload = HashMap::new();
        payload.insert(
            "n".to_string(),
            Value {
                kind: Some(Kind::IntegerValue(3)),
            },
        );
        payload.insert(
            "s".to_string(),
            Value {
                kind: Some(Kind::StringValue("x".into())),
            },
        );
        assert_eq!(payload_to_json(payload), serde_json::json!({"n": 3, "s": "x"}));
    }
}
