//! Logical plan tree.
//!
//! Plans are owned trees: `Clone` is a full structural copy and no node is
//! ever shared between two trees. Every pipeline stage works on its own copy.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr::{AggregateExpr, Expr};
use crate::hash::{hash_serde, Hash256};
use crate::schema::{Field, Schema};
use crate::tree::{render_tree, truncated_list, TreeChild, TreeNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "Inner",
            JoinType::Left => "LeftOuter",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    /// Table reference by name; resolved against the catalog.
    UnresolvedRelation { name: String },
    Relation {
        table: String,
        schema: Schema,
        partition_column: Option<String>,
        streaming: bool,
    },
    /// Subtree replaced by cached data stored under `cache_key`.
    InMemoryRelation { cache_key: String, schema: Schema },
    Filter {
        input: Box<LogicalPlan>,
        predicate: Expr,
    },
    Project {
        input: Box<LogicalPlan>,
        exprs: Vec<Expr>,
    },
    /// Equi-join on `(left column, right column)` pairs.
    Join {
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        on: Vec<(String, String)>,
        join_type: JoinType,
    },
    Aggregate {
        input: Box<LogicalPlan>,
        group_by: Vec<String>,
        aggs: Vec<AggregateExpr>,
    },
    /// Ascending sort by the named columns.
    Sort {
        input: Box<LogicalPlan>,
        order_by: Vec<String>,
    },
    Limit {
        input: Box<LogicalPlan>,
        n: usize,
    },
    /// Terminal marker added before physical planning.
    ReturnAnswer { input: Box<LogicalPlan> },
}

impl LogicalPlan {
    pub fn table(name: impl Into<String>) -> Self {
        LogicalPlan::UnresolvedRelation { name: name.into() }
    }

    pub fn filter(self, predicate: Expr) -> Self {
        LogicalPlan::Filter {
            input: Box::new(self),
            predicate,
        }
    }

    pub fn project(self, exprs: Vec<Expr>) -> Self {
        LogicalPlan::Project {
            input: Box::new(self),
            exprs,
        }
    }

    pub fn join(self, right: LogicalPlan, on: Vec<(String, String)>, join_type: JoinType) -> Self {
        LogicalPlan::Join {
            left: Box::new(self),
            right: Box::new(right),
            on,
            join_type,
        }
    }

    pub fn aggregate(self, group_by: Vec<String>, aggs: Vec<AggregateExpr>) -> Self {
        LogicalPlan::Aggregate {
            input: Box::new(self),
            group_by,
            aggs,
        }
    }

    pub fn sort(self, order_by: Vec<String>) -> Self {
        LogicalPlan::Sort {
            input: Box::new(self),
            order_by,
        }
    }

    pub fn limit(self, n: usize) -> Self {
        LogicalPlan::Limit {
            input: Box::new(self),
            n,
        }
    }

    pub fn children(&self) -> Vec<&LogicalPlan> {
        match self {
            LogicalPlan::UnresolvedRelation { .. }
            | LogicalPlan::Relation { .. }
            | LogicalPlan::InMemoryRelation { .. } => vec![],
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Project { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. }
            | LogicalPlan::ReturnAnswer { input } => vec![input],
            LogicalPlan::Join { left, right, .. } => vec![left, right],
        }
    }

    /// Rebuild this node with every child passed through `f`.
    pub fn map_children<E, F>(self, mut f: F) -> std::result::Result<LogicalPlan, E>
    where
        F: FnMut(LogicalPlan) -> std::result::Result<LogicalPlan, E>,
    {
        Ok(match self {
            leaf @ (LogicalPlan::UnresolvedRelation { .. }
            | LogicalPlan::Relation { .. }
            | LogicalPlan::InMemoryRelation { .. }) => leaf,
            LogicalPlan::Filter { input, predicate } => LogicalPlan::Filter {
                input: Box::new(f(*input)?),
                predicate,
            },
            LogicalPlan::Project { input, exprs } => LogicalPlan::Project {
                input: Box::new(f(*input)?),
                exprs,
            },
            LogicalPlan::Join {
                left,
                right,
                on,
                join_type,
            } => LogicalPlan::Join {
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
                on,
                join_type,
            },
            LogicalPlan::Aggregate {
                input,
                group_by,
                aggs,
            } => LogicalPlan::Aggregate {
                input: Box::new(f(*input)?),
                group_by,
                aggs,
            },
            LogicalPlan::Sort { input, order_by } => LogicalPlan::Sort {
                input: Box::new(f(*input)?),
                order_by,
            },
            LogicalPlan::Limit { input, n } => LogicalPlan::Limit {
                input: Box::new(f(*input)?),
                n,
            },
            LogicalPlan::ReturnAnswer { input } => LogicalPlan::ReturnAnswer {
                input: Box::new(f(*input)?),
            },
        })
    }

    /// Bottom-up rewrite.
    pub fn transform_up<F>(self, f: &mut F) -> Result<LogicalPlan>
    where
        F: FnMut(LogicalPlan) -> Result<LogicalPlan>,
    {
        let rebuilt = self.map_children(|c| c.transform_up(f))?;
        f(rebuilt)
    }

    /// Top-down rewrite; `f` sees a node before its (rewritten) children.
    pub fn transform_down<F>(self, f: &mut F) -> Result<LogicalPlan>
    where
        F: FnMut(LogicalPlan) -> Result<LogicalPlan>,
    {
        f(self)?.map_children(|c| c.transform_down(f))
    }

    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            LogicalPlan::Filter { predicate, .. } => vec![predicate],
            LogicalPlan::Project { exprs, .. } => exprs.iter().collect(),
            _ => vec![],
        }
    }

    pub fn is_resolved(&self) -> bool {
        if matches!(self, LogicalPlan::UnresolvedRelation { .. }) {
            return false;
        }
        self.expressions().iter().all(|e| e.is_resolved())
            && self.children().iter().all(|c| c.is_resolved())
    }

    /// Output schema; only defined for resolved plans.
    pub fn schema(&self) -> Result<Schema> {
        match self {
            LogicalPlan::UnresolvedRelation { name } => Err(Error::Analysis(format!(
                "invalid call to schema on unresolved relation '{name}'"
            ))),
            LogicalPlan::Relation { schema, .. } | LogicalPlan::InMemoryRelation { schema, .. } => {
                Ok(schema.clone())
            }
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. }
            | LogicalPlan::ReturnAnswer { input } => input.schema(),
            LogicalPlan::Project { exprs, .. } => {
                let mut fields = Vec::with_capacity(exprs.len());
                for e in exprs {
                    let dt = e.data_type().ok_or_else(|| {
                        Error::Analysis(format!("invalid call to dataType on unresolved expression {e}"))
                    })?;
                    fields.push(Field::new(e.output_name(), dt, e.nullable()));
                }
                Ok(Schema::new(fields))
            }
            LogicalPlan::Join {
                left,
                right,
                join_type,
                ..
            } => Ok(Schema::merge(
                &left.schema()?,
                &right.schema()?,
                *join_type == JoinType::Left,
            )),
            LogicalPlan::Aggregate {
                input,
                group_by,
                aggs,
            } => {
                let in_schema = input.schema()?;
                let mut fields = Vec::with_capacity(group_by.len() + aggs.len());
                for g in group_by {
                    let f = in_schema.field_by_name(g).ok_or_else(|| {
                        Error::Analysis(format!(
                            "cannot resolve '{g}' given input columns: [{}]",
                            in_schema.names().join(", ")
                        ))
                    })?;
                    fields.push(f.clone());
                }
                for a in aggs {
                    let dt = a.func.result_type(&in_schema).map_err(Error::Analysis)?;
                    let nullable = !matches!(a.func, crate::expr::Aggregation::Count);
                    fields.push(Field::new(a.alias.clone(), dt, nullable));
                }
                Ok(Schema::new(fields))
            }
        }
    }

    pub fn contains_streaming(&self) -> bool {
        match self {
            LogicalPlan::Relation { streaming, .. } => *streaming,
            other => {
                other.children().iter().any(|c| c.contains_streaming())
                    || other
                        .expressions()
                        .iter()
                        .flat_map(|e| e.subquery_plans())
                        .any(|p| p.contains_streaming())
            }
        }
    }

    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Structural identity of this subtree.
    pub fn fingerprint(&self) -> Result<Hash256> {
        hash_serde(self)
    }

    pub fn node_name(&self) -> &'static str {
        match self {
            LogicalPlan::UnresolvedRelation { .. } => "UnresolvedRelation",
            LogicalPlan::Relation { .. } => "Relation",
            LogicalPlan::InMemoryRelation { .. } => "InMemoryRelation",
            LogicalPlan::Filter { .. } => "Filter",
            LogicalPlan::Project { .. } => "Project",
            LogicalPlan::Join { .. } => "Join",
            LogicalPlan::Aggregate { .. } => "Aggregate",
            LogicalPlan::Sort { .. } => "Sort",
            LogicalPlan::Limit { .. } => "Limit",
            LogicalPlan::ReturnAnswer { .. } => "ReturnAnswer",
        }
    }

    pub fn simple_string(&self, max_fields: usize) -> String {
        match self {
            LogicalPlan::UnresolvedRelation { name } => format!("'UnresolvedRelation [{name}]"),
            LogicalPlan::Relation {
                table,
                schema,
                partition_column,
                streaming,
            } => {
                let mut s = format!("Relation {table}{}", truncated_list(schema.names(), max_fields));
                if let Some(p) = partition_column {
                    s.push_str(&format!(" partitionedBy={p}"));
                }
                if *streaming {
                    s.push_str(" streaming");
                }
                s
            }
            LogicalPlan::InMemoryRelation { cache_key, schema } => format!(
                "InMemoryRelation {}, {cache_key}",
                truncated_list(schema.names(), max_fields)
            ),
            LogicalPlan::Filter { predicate, .. } => format!("Filter {predicate}"),
            LogicalPlan::Project { exprs, .. } => format!(
                "Project {}",
                truncated_list(exprs.iter().map(|e| e.to_string()), max_fields)
            ),
            LogicalPlan::Join { on, join_type, .. } => {
                let cond: Vec<String> = on.iter().map(|(l, r)| format!("({l} = {r})")).collect();
                format!("Join {}, {}", join_type.as_str(), cond.join(" AND "))
            }
            LogicalPlan::Aggregate { group_by, aggs, .. } => {
                let outputs = group_by
                    .iter()
                    .cloned()
                    .chain(aggs.iter().map(|a| a.to_string()));
                format!(
                    "Aggregate {}, {}",
                    truncated_list(group_by.iter().cloned(), max_fields),
                    truncated_list(outputs, max_fields)
                )
            }
            LogicalPlan::Sort { order_by, .. } => format!(
                "Sort {}",
                truncated_list(order_by.iter().map(|c| format!("{c} ASC")), max_fields)
            ),
            LogicalPlan::Limit { n, .. } => format!("Limit {n}"),
            LogicalPlan::ReturnAnswer { .. } => "ReturnAnswer".to_string(),
        }
    }

    pub fn tree_string(&self, max_fields: usize) -> String {
        render_tree(self, max_fields)
    }

    /// Tree rendering with a per-node suffix (used for stats annotation).
    pub fn tree_string_with<F>(&self, max_fields: usize, annotate: &F) -> String
    where
        F: Fn(&LogicalPlan) -> String,
    {
        render_tree(&Annotated { plan: self, annotate }, max_fields)
    }
}

impl TreeNode for LogicalPlan {
    fn node_string(&self, max_fields: usize) -> String {
        self.simple_string(max_fields)
    }

    fn tree_children(&self) -> Vec<TreeChild<'_>> {
        self.children()
            .into_iter()
            .map(|c| Box::new(c) as TreeChild<'_>)
            .collect()
    }

    fn inner_children(&self) -> Vec<TreeChild<'_>> {
        self.expressions()
            .into_iter()
            .flat_map(|e| e.subquery_plans())
            .map(|p| Box::new(p) as TreeChild<'_>)
            .collect()
    }
}

struct Annotated<'a, F> {
    plan: &'a LogicalPlan,
    annotate: &'a F,
}

impl<'a, F> TreeNode for Annotated<'a, F>
where
    F: Fn(&LogicalPlan) -> String,
{
    fn node_string(&self, max_fields: usize) -> String {
        format!(
            "{}, {}",
            self.plan.simple_string(max_fields),
            (self.annotate)(self.plan)
        )
    }

    fn tree_children(&self) -> Vec<TreeChild<'_>> {
        self.plan
            .children()
            .into_iter()
            .map(|plan| {
                Box::new(Annotated {
                    plan,
                    annotate: self.annotate,
                }) as TreeChild<'_>
            })
            .collect()
    }

    fn inner_children(&self) -> Vec<TreeChild<'_>> {
        self.plan.inner_children()
    }
}
