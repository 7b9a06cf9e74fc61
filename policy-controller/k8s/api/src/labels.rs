use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A normalized label selector: exact-match labels ANDed with set-based expressions.
///
/// Two selectors that select the same objects by the same requirements compare equal and render
/// the same canonical string, regardless of how the requirements were ordered or spelled in the
/// source object.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Selector {
    match_labels: Map,
    match_expressions: BTreeSet<Expression>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("unsupported operator {operator:?} for label {key:?}")]
    UnknownOperator { key: String, operator: String },

    #[error("operator {operator} for label {key:?} requires at least one value")]
    MissingValues { key: String, operator: Operator },

    #[error("operator {operator} for label {key:?} must not specify values")]
    UnexpectedValues { key: String, operator: Operator },

    #[error("label selector requirement has an empty key")]
    EmptyKey,
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: impl IntoIterator<Item = Expression>) -> Self {
        let mut selector = Self::default();
        for expr in exprs {
            selector.push(expr);
        }
        selector
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: map,
            match_expressions: BTreeSet::new(),
        }
    }

    /// Returns true if the selector has no requirements and so selects everything.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        for (k, v) in self.match_labels.iter() {
            if labels.0.get(k) != Some(v) {
                return false;
            }
        }

        true
    }

    /// Adds a requirement, folding single-valued `In` expressions into exact matches.
    fn push(&mut self, expr: Expression) {
        if let (Operator::In, 1, Some(value)) =
            (expr.operator, expr.values.len(), expr.values.first())
        {
            match self.match_labels.get(&expr.key) {
                None => {
                    let value = value.clone();
                    self.match_labels.insert(expr.key, value);
                    return;
                }
                Some(v) if v == value => return,
                // Conflicts with an exact match, so nothing can be selected. Keep the
                // expression so that the selector still renders faithfully.
                Some(_) => {}
            }
        }
        self.match_expressions.insert(expr);
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = SelectorError;

    fn try_from(ls: &LabelSelector) -> Result<Self, Self::Error> {
        let mut selector = Self::from_map(ls.match_labels.clone().unwrap_or_default());
        for req in ls.match_expressions.iter().flatten() {
            selector.push(Expression::try_from(req)?);
        }
        Ok(selector)
    }
}

impl TryFrom<LabelSelector> for Selector {
    type Error = SelectorError;

    fn try_from(ls: LabelSelector) -> Result<Self, Self::Error> {
        Self::try_from(&ls)
    }
}

/// Renders the canonical form, e.g. `app=web,env in (prod,staging),!legacy`.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.match_labels.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{k}={v}")?;
        }
        for expr in self.match_expressions.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            expr.fmt(f)?;
        }
        Ok(())
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter)
    }
}

// === Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, SelectorError> {
        let key = key.into();
        if key.is_empty() {
            return Err(SelectorError::EmptyKey);
        }
        let values = values.into_iter().map(Into::into).collect::<BTreeSet<_>>();
        match operator {
            Operator::In | Operator::NotIn if values.is_empty() => {
                Err(SelectorError::MissingValues { key, operator })
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                Err(SelectorError::UnexpectedValues { key, operator })
            }
            _ => Ok(Self {
                key,
                operator,
                values,
            }),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map(|v| self.values.contains(v))
                .unwrap_or(false),
            Operator::NotIn => labels
                .get(&self.key)
                .map(|v| !self.values.contains(v))
                .unwrap_or(true),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl TryFrom<&LabelSelectorRequirement> for Expression {
    type Error = SelectorError;

    fn try_from(req: &LabelSelectorRequirement) -> Result<Self, Self::Error> {
        let operator = match req.operator.as_str() {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            op => {
                return Err(SelectorError::UnknownOperator {
                    key: req.key.clone(),
                    operator: op.to_string(),
                })
            }
        };
        Self::new(
            req.key.clone(),
            operator,
            req.values.iter().flatten().cloned(),
        )
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In => write!(f, "{} in ({})", self.key, values()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, values()),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

// === Operator ===

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => "In".fmt(f),
            Self::NotIn => "NotIn".fmt(f),
            Self::Exists => "Exists".fmt(f),
            Self::DoesNotExist => "DoesNotExist".fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use std::iter::FromIterator;

    fn req(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "baz"))),
                false,
                "label mismatch",
            ),
            (
                Selector::from_iter(Some(
                    Expression::new("foo", Operator::In, ["bar", "qux"]).unwrap(),
                )),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "expression match",
            ),
            (
                Selector::from_iter(Some(
                    Expression::new("foo", Operator::NotIn, ["bar"]).unwrap(),
                )),
                Labels::from_iter(Some(("foo", "bar"))),
                false,
                "notin excludes value",
            ),
            (
                Selector::from_iter(Some(
                    Expression::new("foo", Operator::NotIn, ["bar"]).unwrap(),
                )),
                Labels::default(),
                true,
                "notin admits missing label",
            ),
            (
                Selector::from_iter(Some(
                    Expression::new("foo", Operator::Exists, None::<String>).unwrap(),
                )),
                Labels::from_iter(Some(("foo", ""))),
                true,
                "exists",
            ),
            (
                Selector::from_iter(Some(
                    Expression::new("foo", Operator::DoesNotExist, None::<String>).unwrap(),
                )),
                Labels::from_iter(Some(("foo", "bar"))),
                false,
                "does not exist",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn canonical_form_ignores_spelling() {
        let a = Selector::try_from(&LabelSelector {
            match_labels: Some(btreemap! {
                "tier".to_string() => "db".to_string(),
                "app".to_string() => "web".to_string(),
            }),
            match_expressions: Some(vec![
                req("env", "In", &["staging", "prod"]),
                req("legacy", "DoesNotExist", &[]),
            ]),
        })
        .unwrap();
        let b = Selector::try_from(&LabelSelector {
            match_labels: Some(btreemap! { "app".to_string() => "web".to_string() }),
            match_expressions: Some(vec![
                req("legacy", "DoesNotExist", &[]),
                req("tier", "In", &["db"]),
                req("env", "In", &["prod", "staging"]),
            ]),
        })
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "app=web,tier=db,env in (prod,staging),!legacy");
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn empty_selector_renders_empty() {
        let s = Selector::try_from(&LabelSelector::default()).unwrap();
        assert!(s.is_empty());
        assert_eq!(s.to_string(), "");
    }

    #[test]
    fn rejects_malformed_requirements() {
        let invalid = [
            req("env", "Matches", &["prod"]),
            req("env", "In", &[]),
            req("env", "Exists", &["prod"]),
            req("", "Exists", &[]),
        ];
        for r in invalid.iter() {
            let ls = LabelSelector {
                match_expressions: Some(vec![r.clone()]),
                ..Default::default()
            };
            assert!(Selector::try_from(&ls).is_err(), "{r:?} must be rejected");
        }
    }
}
