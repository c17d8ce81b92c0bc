//! Resolution of Kubernetes label selectors into canonical label terms.
//!
//! A selector resolves to a [`Selection`]: single-valued terms that each map
//! to one membership set, and multi-valued terms that map to a list of sets.
//! Resolution is deterministic, so equivalent selectors always produce the
//! same terms in the same order.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use sha2::{Digest, Sha256};

/// Prefixed to a label to indicate that matching it excludes a pod.
pub const NEGATION: char = '!';

/// A requirement on a single label key.
///
/// A term with no value requires only that the key is present (or, when
/// negated, absent).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term {
    pub key: String,
    pub value: Option<String>,
    pub negated: bool,
}

/// A requirement that a key takes one of several values (or, when negated,
/// none of them).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MultiValueTerm {
    pub key: String,
    /// Sorted and deduplicated.
    pub values: Vec<String>,
    pub negated: bool,
}

/// The resolved form of a label selector.
///
/// All terms must hold for an object to be selected. A selection with no
/// terms selects everything.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Selection {
    pub terms: Vec<Term>,
    pub multi: Vec<MultiValueTerm>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("unsupported operator {operator:?} for label {key}")]
    UnsupportedOperator { key: String, operator: String },

    #[error("operator {operator} for label {key} requires at least one value")]
    MissingValues { key: String, operator: String },
}

/// Resolves a selector into canonical terms.
///
/// Unknown operators fail resolution rather than being skipped, since dropping
/// a requirement would select more objects than intended.
pub fn resolve(selector: &LabelSelector) -> Result<Selection, SelectorError> {
    let mut terms = Vec::new();
    let mut multi = Vec::new();

    for (key, value) in selector.match_labels.iter().flatten() {
        terms.push(Term {
            key: key.clone(),
            value: Some(value.clone()),
            negated: false,
        });
    }

    for expr in selector.match_expressions.iter().flatten() {
        resolve_expression(expr, &mut terms, &mut multi)?;
    }

    terms.sort();
    terms.dedup();
    multi.sort();
    multi.dedup();
    Ok(Selection { terms, multi })
}

/// Resolves an optional selector, treating an absent selector as selecting
/// everything.
pub fn resolve_optional(selector: Option<&LabelSelector>) -> Result<Selection, SelectorError> {
    match selector {
        Some(sel) => resolve(sel),
        None => Ok(Selection::default()),
    }
}

fn resolve_expression(
    expr: &LabelSelectorRequirement,
    terms: &mut Vec<Term>,
    multi: &mut Vec<MultiValueTerm>,
) -> Result<(), SelectorError> {
    let negated = match expr.operator.as_str() {
        "In" => false,
        "NotIn" => true,
        "Exists" | "DoesNotExist" => {
            terms.push(Term {
                key: expr.key.clone(),
                value: None,
                negated: expr.operator == "DoesNotExist",
            });
            return Ok(());
        }
        _ => {
            return Err(SelectorError::UnsupportedOperator {
                key: expr.key.clone(),
                operator: expr.operator.clone(),
            })
        }
    };

    let mut values = expr.values.clone().unwrap_or_default();
    values.sort();
    values.dedup();
    match values.len() {
        0 => Err(SelectorError::MissingValues {
            key: expr.key.clone(),
            operator: expr.operator.clone(),
        }),
        1 => {
            terms.push(Term {
                key: expr.key.clone(),
                value: values.pop(),
                negated,
            });
            Ok(())
        }
        _ => {
            multi.push(MultiValueTerm {
                key: expr.key.clone(),
                values,
                negated,
            });
            Ok(())
        }
    }
}

/// Splits one leading negation marker from a label.
///
/// Only a single marker is removed: `!!test` is a negated `!test`.
pub fn split_negation(label: &str) -> (bool, &str) {
    match label.strip_prefix(NEGATION) {
        Some(rest) => (true, rest),
        None => (false, label),
    }
}

// === impl Term ===

impl Term {
    /// The canonical `key` or `key:value` form.
    pub fn label(&self) -> String {
        match &self.value {
            Some(v) => format!("{}:{v}", self.key),
            None => self.key.clone(),
        }
    }

    /// The canonical label with a negation marker for negated terms.
    pub fn label_with_operator(&self) -> String {
        if self.negated {
            format!("{NEGATION}{}", self.label())
        } else {
            self.label()
        }
    }

    /// Parses a label produced by [`Term::label_with_operator`].
    ///
    /// Keys may not contain `:`, so the first one separates key from value.
    pub fn from_label_with_operator(label: &str) -> Self {
        let (negated, label) = split_negation(label);
        match label.split_once(':') {
            Some((key, value)) => Self {
                key: key.to_string(),
                value: Some(value.to_string()),
                negated,
            },
            None => Self {
                key: label.to_string(),
                value: None,
                negated,
            },
        }
    }
}

// === impl Selection ===

impl Selection {
    pub fn selects_all(&self) -> bool {
        self.terms.is_empty() && self.multi.is_empty()
    }

    /// Flattened labels, with negation markers, one per value.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = self
            .terms
            .iter()
            .map(Term::label_with_operator)
            .collect::<Vec<_>>();
        for m in &self.multi {
            for v in &m.values {
                let term = Term {
                    key: m.key.clone(),
                    value: Some(v.clone()),
                    negated: m.negated,
                };
                labels.push(term.label_with_operator());
            }
        }
        labels
    }

    /// Keys, with negation markers, one per value.
    pub fn keys(&self) -> Vec<String> {
        self.flatten()
            .map(|(key, _, negated)| {
                if negated {
                    format!("{NEGATION}{key}")
                } else {
                    key.to_string()
                }
            })
            .collect()
    }

    /// Values in the same order as [`Selection::keys`]; existence terms
    /// contribute an empty value.
    pub fn values(&self) -> Vec<String> {
        self.flatten()
            .map(|(_, value, _)| value.unwrap_or_default().to_string())
            .collect()
    }

    fn flatten(&self) -> impl Iterator<Item = (&str, Option<&str>, bool)> + '_ {
        let single = self
            .terms
            .iter()
            .map(|t| (t.key.as_str(), t.value.as_deref(), t.negated));
        let multi = self.multi.iter().flat_map(|m| {
            m.values
                .iter()
                .map(move |v| (m.key.as_str(), Some(v.as_str()), m.negated))
        });
        single.chain(multi)
    }

    /// A stable digest identifying the selected objects.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for t in &self.terms {
            hasher.update(t.label_with_operator().as_bytes());
            hasher.update(b"\n");
        }
        for m in &self.multi {
            if m.negated {
                hasher.update([NEGATION as u8]);
            }
            hasher.update(m.key.as_bytes());
            for v in &m.values {
                hasher.update(b":");
                hasher.update(v.as_bytes());
            }
            hasher.update(b"\n");
        }
        hasher
            .finalize()
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}
