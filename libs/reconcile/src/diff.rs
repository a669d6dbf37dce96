//! Differencer: structured deltas between desired and observed state.
//!
//! `diff` is a pure function. Objects are walked field by field; arrays and
//! scalars are compared as whole values. Fields present only in the observed
//! document are removed only when the resource's [`Ownership`] claims them.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use steward_id::ResourceKind;

use crate::document::FieldPath;
use crate::kind::{is_ignored, KindCapabilities};

/// Which observed fields the controller is allowed to remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Every field belongs to the controller; anything not in desired is removed.
    Full,

    /// Only the listed fields (and everything below them) belong to the
    /// controller. An empty set never removes anything.
    Fields(BTreeSet<FieldPath>),
}

impl Ownership {
    /// Partial ownership that claims no fields.
    pub fn none() -> Self {
        Ownership::Fields(BTreeSet::new())
    }

    /// Partial ownership of the given dotted paths.
    pub fn fields<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ownership::Fields(
            paths
                .into_iter()
                .map(|p| FieldPath::parse(p.as_ref()))
                .collect(),
        )
    }

    /// Returns true if the controller owns `path`.
    pub fn owns(&self, path: &FieldPath) -> bool {
        match self {
            Ownership::Full => true,
            Ownership::Fields(owned) => owned.iter().any(|p| path.starts_with(p)),
        }
    }
}

impl Default for Ownership {
    fn default() -> Self {
        Self::none()
    }
}

/// A single field-level change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    /// Field is missing from observed state.
    Add { value: Value },

    /// Field differs between observed and desired.
    Modify { from: Value, to: Value },

    /// Field exists in observed state but the controller wants it gone.
    Remove { value: Value },
}

/// A change at a specific path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldOp {
    pub path: FieldPath,
    #[serde(flatten)]
    pub change: Change,
}

/// Ordered list of field operations. Empty means in sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diff {
    ops: Vec<FieldOp>,
}

impl Diff {
    /// An empty diff.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A diff that deletes the whole resource.
    pub fn deletion(observed: &Value) -> Self {
        Self {
            ops: vec![FieldOp {
                path: FieldPath::root(),
                change: Change::Remove {
                    value: observed.clone(),
                },
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[FieldOp] {
        &self.ops
    }

    /// Returns the full document to create, if this diff creates the resource.
    pub fn creation(&self) -> Option<&Value> {
        match self.ops.as_slice() {
            [FieldOp {
                path,
                change: Change::Add { value },
            }] if path.is_root() => Some(value),
            _ => None,
        }
    }

    /// Returns true if this diff deletes the whole resource.
    pub fn is_deletion(&self) -> bool {
        matches!(
            self.ops.as_slice(),
            [FieldOp { path, change: Change::Remove { .. } }] if path.is_root()
        )
    }

    /// Summarizes the diff for status reporting.
    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary::default();
        for op in &self.ops {
            let marker = match op.change {
                Change::Add { .. } => {
                    summary.adds += 1;
                    '+'
                }
                Change::Modify { .. } => {
                    summary.modifies += 1;
                    '~'
                }
                Change::Remove { .. } => {
                    summary.removes += 1;
                    '-'
                }
            };
            if summary.fields.len() < DiffSummary::MAX_FIELDS {
                summary.fields.push(format!("{marker}{}", op.path));
            }
        }
        summary
    }
}

/// Compact description of a diff, visible to operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub modifies: usize,
    pub removes: usize,

    /// First few changed fields, prefixed with `+`, `~` or `-`.
    pub fields: Vec<String>,
}

impl DiffSummary {
    const MAX_FIELDS: usize = 8;

    pub fn total(&self) -> usize {
        self.adds + self.modifies + self.removes
    }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total() == 0 {
            return f.write_str("in sync");
        }
        write!(f, "{}", self.fields.join(", "))?;
        let hidden = self.total().saturating_sub(self.fields.len());
        if hidden > 0 {
            write!(f, " (+{hidden} more)")?;
        }
        Ok(())
    }
}

/// Computes the diff that moves `observed` to `desired`.
///
/// A missing observed document yields a single root `Add` carrying the whole
/// desired specification.
pub fn diff(
    kind: &ResourceKind,
    desired: &Value,
    observed: Option<&Value>,
    ownership: &Ownership,
) -> Diff {
    let Some(observed) = observed else {
        return Diff {
            ops: vec![FieldOp {
                path: FieldPath::root(),
                change: Change::Add {
                    value: desired.clone(),
                },
            }],
        };
    };

    let walker = Walker {
        ignored: kind.ignored_fields(),
        ownership,
    };
    let mut ops = Vec::new();
    walker.walk(&FieldPath::root(), desired, observed, &mut ops);
    ops.sort_by(|a, b| a.path.cmp(&b.path));
    Diff { ops }
}

struct Walker<'a> {
    ignored: Vec<FieldPath>,
    ownership: &'a Ownership,
}

impl Walker<'_> {
    fn walk(&self, path: &FieldPath, desired: &Value, observed: &Value, ops: &mut Vec<FieldOp>) {
        if is_ignored(&self.ignored, path) {
            return;
        }

        let (Value::Object(want), Value::Object(have)) = (desired, observed) else {
            if desired != observed {
                ops.push(FieldOp {
                    path: path.clone(),
                    change: Change::Modify {
                        from: observed.clone(),
                        to: desired.clone(),
                    },
                });
            }
            return;
        };

        for (field, want_value) in want {
            let child = path.child(field);
            match have.get(field) {
                Some(have_value) => self.walk(&child, want_value, have_value, ops),
                None if !is_ignored(&self.ignored, &child) => ops.push(FieldOp {
                    path: child,
                    change: Change::Add {
                        value: want_value.clone(),
                    },
                }),
                None => {}
            }
        }

        for (field, have_value) in have {
            if want.contains_key(field) {
                continue;
            }
            let child = path.child(field);
            if self.ownership.owns(&child) && !is_ignored(&self.ignored, &child) {
                ops.push(FieldOp {
                    path: child,
                    change: Change::Remove {
                        value: have_value.clone(),
                    },
                });
            }
        }
    }
}
