//! Scoped name resolution against the schema catalog
//!
//! Walks the query the way PostgreSQL scopes it. Each SELECT opens a frame
//! holding its FROM bindings; subqueries see enclosing frames (correlation);
//! CTEs are visible to the query that defines them and everything nested in
//! it. Projection aliases are output names: they satisfy ORDER BY, GROUP BY
//! and DISTINCT ON of their own SELECT, and the columns of a CTE or derived
//! table built from it, never the expressions of that SELECT.

use crate::catalog::{SchemaCatalog, TableDescriptor};
use sqlparser::ast::{
    Distinct, Expr, GroupByExpr, Ident, JoinConstraint, JoinOperator, ObjectName, OrderByExpr,
    Query, Select, SelectItem, SetExpr, TableAlias, TableFactor, TableWithJoins, Visit, Visitor,
};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

const DEFAULT_SCHEMA: &str = "public";

/// Outcome of walking one statement.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Catalog tables read, in order of first reference
    pub tables: Vec<String>,
    /// Data-modifying constructs found inside the query
    pub writes: Vec<String>,
    /// Names that did not resolve, as written
    pub unknown: Vec<String>,
}

/// What a FROM item exposes.
#[derive(Debug, Clone)]
enum Source<'c> {
    Table(&'c TableDescriptor),
    /// Derived table, CTE or function result with known output columns
    Derived(Vec<String>),
    /// Already reported as unknown, or a recursive CTE whose columns are
    /// not known yet
    Unresolved,
}

impl Source<'_> {
    fn has_column(&self, column: &str) -> bool {
        match self {
            Source::Table(table) => table.column(column).is_some(),
            Source::Derived(columns) => columns.iter().any(|c| c == column),
            Source::Unresolved => true,
        }
    }

    fn columns(&self) -> Vec<String> {
        match self {
            Source::Table(table) => table.columns.iter().map(|c| c.name.to_lowercase()).collect(),
            Source::Derived(columns) => columns.clone(),
            Source::Unresolved => Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Binding<'c> {
    /// Lower-cased qualifier: the alias, else the relation name
    name: String,
    source: Source<'c>,
}

#[derive(Debug, Default)]
struct Frame<'c> {
    bindings: Vec<Binding<'c>>,
}

pub fn resolve(query: &Query, catalog: &SchemaCatalog) -> Resolution {
    let mut resolver = Resolver {
        catalog,
        ctes: Vec::new(),
        frames: Vec::new(),
        output_aliases: None,
        depth: 0,
        resolution: Resolution::default(),
    };
    resolver.query(query);
    resolver.resolution
}

struct Resolver<'c> {
    catalog: &'c SchemaCatalog,
    /// CTE output columns per query level; `None` while a recursive CTE's
    /// own body is being resolved
    ctes: Vec<HashMap<String, Option<Vec<String>>>>,
    frames: Vec<Frame<'c>>,
    /// Output names usable by the expression being resolved, if any
    output_aliases: Option<HashSet<String>>,
    /// Subquery nesting inside the expression being visited
    depth: usize,
    resolution: Resolution,
}

impl<'c> Resolver<'c> {
    /// Resolve a query and return its output column names.
    fn query(&mut self, query: &Query) -> Vec<String> {
        self.ctes.push(HashMap::new());
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = cte.alias.name.value.to_lowercase();
                let declared = alias_columns(&cte.alias);
                if with.recursive {
                    let known = (!declared.is_empty()).then(|| declared.clone());
                    self.define_cte(&name, known);
                }
                let produced = self.query(&cte.query);
                let columns = if declared.is_empty() { produced } else { declared };
                self.define_cte(&name, Some(columns));
            }
        }

        let outputs = self.set_expr(&query.body, &query.order_by);

        let tail: Vec<&Expr> = query
            .limit
            .iter()
            .chain(query.offset.iter().map(|o| &o.value))
            .chain(query.fetch.iter().filter_map(|f| f.quantity.as_ref()))
            .collect();
        for expr in tail {
            self.expr(expr, None);
        }

        self.ctes.pop();
        outputs
    }

    fn define_cte(&mut self, name: &str, columns: Option<Vec<String>>) {
        if let Some(scope) = self.ctes.last_mut() {
            scope.insert(name.to_string(), columns);
        }
    }

    fn lookup_cte(&self, name: &ObjectName) -> Option<Option<Vec<String>>> {
        let [single] = name.0.as_slice() else {
            return None;
        };
        let key = single.value.to_lowercase();
        self.ctes.iter().rev().find_map(|scope| scope.get(&key).cloned())
    }

    fn set_expr(&mut self, body: &SetExpr, order_by: &[OrderByExpr]) -> Vec<String> {
        match body {
            SetExpr::Select(select) => self.select(select, order_by),
            SetExpr::Query(query) => {
                let outputs = self.query(query);
                self.order_by_outputs(order_by, &outputs);
                outputs
            }
            SetExpr::SetOperation { left, right, .. } => {
                let outputs = self.set_expr(left, &[]);
                self.set_expr(right, &[]);
                self.order_by_outputs(order_by, &outputs);
                outputs
            }
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for expr in row {
                        self.expr(expr, None);
                    }
                }
                Vec::new()
            }
            SetExpr::Insert(statement) | SetExpr::Update(statement) => {
                self.resolution.writes.push(leading_keyword(&statement.to_string()));
                Vec::new()
            }
            SetExpr::Table(table) => {
                let name = table.table_name.clone().unwrap_or_default();
                match self.catalog_table(&name) {
                    Some(found) if table.schema_name.is_none() => Source::Table(found).columns(),
                    _ => {
                        self.resolution.unknown.push(body.to_string());
                        Vec::new()
                    }
                }
            }
        }
    }

    fn select(&mut self, select: &Select, order_by: &[OrderByExpr]) -> Vec<String> {
        self.frames.push(Frame::default());

        if select.into.is_some() {
            self.resolution.writes.push("SELECT INTO".to_string());
        }

        for item in &select.from {
            self.table_with_joins(item);
        }

        let mut aliases = HashSet::new();
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => self.expr(expr, None),
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.expr(expr, None);
                    aliases.insert(alias.value.to_lowercase());
                }
                SelectItem::QualifiedWildcard(qualifier, _) => {
                    if self.qualified_source(&qualifier.0).is_none() {
                        self.resolution.unknown.push(format!("{}.*", qualifier));
                    }
                }
                SelectItem::Wildcard(_) => {}
            }
        }

        if let Some(selection) = &select.selection {
            self.expr(selection, None);
        }
        if let GroupByExpr::Expressions(exprs) = &select.group_by {
            for expr in exprs {
                self.expr(expr, Some(&aliases));
            }
        }
        if let Some(having) = &select.having {
            self.expr(having, None);
        }
        if let Some(Distinct::On(exprs)) = &select.distinct {
            for expr in exprs {
                self.expr(expr, Some(&aliases));
            }
        }
        for window in &select.named_window {
            let _ = window.visit(self);
        }
        for item in order_by {
            self.expr(&item.expr, Some(&aliases));
        }

        let outputs = self.outputs(&select.projection);
        self.frames.pop();
        outputs
    }

    /// ORDER BY over a set operation only sees the output column names.
    fn order_by_outputs(&mut self, order_by: &[OrderByExpr], outputs: &[String]) {
        for item in order_by {
            let mut refs = ColumnRefs::default();
            let _ = item.expr.visit(&mut refs);
            for parts in refs.refs {
                let known = match parts.as_slice() {
                    [column] => outputs.contains(&column.value.to_lowercase()),
                    _ => false,
                };
                if !known {
                    self.resolution.unknown.push(as_written(&parts));
                }
            }
        }
    }

    /// Output names of a projection, as PostgreSQL would name them.
    fn outputs(&self, projection: &[SelectItem]) -> Vec<String> {
        let mut names = Vec::new();
        for item in projection {
            match item {
                SelectItem::ExprWithAlias { alias, .. } => names.push(alias.value.to_lowercase()),
                SelectItem::UnnamedExpr(expr) => {
                    if let Some(name) = implicit_name(expr) {
                        names.push(name);
                    }
                }
                SelectItem::QualifiedWildcard(qualifier, _) => {
                    if let Some(source) = self.qualified_source(&qualifier.0) {
                        names.extend(source.columns());
                    }
                }
                SelectItem::Wildcard(_) => {
                    if let Some(frame) = self.frames.last() {
                        for binding in &frame.bindings {
                            names.extend(binding.source.columns());
                        }
                    }
                }
            }
        }
        names
    }

    fn table_with_joins(&mut self, item: &TableWithJoins) {
        self.table_factor(&item.relation);
        for join in &item.joins {
            self.table_factor(&join.relation);
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::On(expr)) => self.expr(expr, None),
                Some(JoinConstraint::Using(columns)) => {
                    for column in columns {
                        if !self.in_current_frame(&column.value.to_lowercase()) {
                            self.resolution.unknown.push(column.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn table_factor(&mut self, factor: &TableFactor) {
        let (name, source, alias) = match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if let Some(args) = args {
                    let _ = args.visit(self);
                }
                let source = self.relation(name);
                (last_part(name), source, alias.as_ref())
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let columns = self.query(subquery);
                (String::new(), Source::Derived(columns), alias.as_ref())
            }
            TableFactor::Function {
                name, args, alias, ..
            } => {
                let _ = args.visit(self);
                let function = last_part(name);
                (function.clone(), Source::Derived(vec![function]), alias.as_ref())
            }
            TableFactor::TableFunction { expr, alias } => {
                self.expr(expr, None);
                (String::new(), Source::Derived(Vec::new()), alias.as_ref())
            }
            TableFactor::UNNEST {
                array_exprs, alias, ..
            } => {
                for expr in array_exprs {
                    self.expr(expr, None);
                }
                let column = "unnest".to_string();
                (column.clone(), Source::Derived(vec![column]), alias.as_ref())
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
            } => {
                let before = self.current_bindings();
                self.table_with_joins(table_with_joins);
                let Some(alias) = alias else {
                    return;
                };
                // An aliased join hides the names inside it
                let inner = self
                    .frames
                    .last_mut()
                    .map(|frame| frame.bindings.split_off(before))
                    .unwrap_or_default();
                let columns = inner.iter().flat_map(|b| b.source.columns()).collect();
                (String::new(), Source::Derived(columns), Some(alias))
            }
            other => {
                self.resolution.unknown.push(other.to_string());
                (String::new(), Source::Unresolved, None)
            }
        };
        self.bind(name, source, alias);
    }

    fn bind(&mut self, name: String, source: Source<'c>, alias: Option<&TableAlias>) {
        let (name, source) = match alias {
            Some(alias) => {
                let renamed = alias_columns(alias);
                let source = if renamed.is_empty() {
                    source
                } else {
                    Source::Derived(renamed)
                };
                (alias.name.value.to_lowercase(), source)
            }
            None => (name, source),
        };
        if let Some(frame) = self.frames.last_mut() {
            frame.bindings.push(Binding { name, source });
        }
    }

    fn current_bindings(&self) -> usize {
        self.frames.last().map(|f| f.bindings.len()).unwrap_or_default()
    }

    fn relation(&mut self, name: &ObjectName) -> Source<'c> {
        if let Some(columns) = self.lookup_cte(name) {
            return columns.map_or(Source::Unresolved, Source::Derived);
        }
        let table = match name.0.as_slice() {
            [table] => Some(table),
            [schema, table] if schema.value.eq_ignore_ascii_case(DEFAULT_SCHEMA) => Some(table),
            _ => None,
        }
        .and_then(|table| self.catalog_table(&table.value));

        match table {
            Some(table) => {
                if !self.resolution.tables.contains(&table.name) {
                    self.resolution.tables.push(table.name.clone());
                }
                Source::Table(table)
            }
            None => {
                self.resolution.unknown.push(name.to_string());
                Source::Unresolved
            }
        }
    }

    fn catalog_table(&self, name: &str) -> Option<&'c TableDescriptor> {
        self.catalog.table(name)
    }

    fn in_current_frame(&self, column: &str) -> bool {
        self.frames
            .last()
            .map(|frame| frame.bindings.iter().any(|b| b.source.has_column(column)))
            .unwrap_or(false)
    }

    /// The source a qualifier names, innermost frame first.
    fn qualified_source(&self, qualifier: &[Ident]) -> Option<&Source<'c>> {
        let name = match qualifier {
            [name] => name,
            [schema, name] if schema.value.eq_ignore_ascii_case(DEFAULT_SCHEMA) => name,
            _ => return None,
        };
        let key = name.value.to_lowercase();
        self.frames.iter().rev().find_map(|frame| {
            frame
                .bindings
                .iter()
                .rev()
                .find(|b| b.name == key)
                .map(|b| &b.source)
        })
    }

    fn column_resolves(&self, parts: &[Ident]) -> bool {
        let Some((column, qualifier)) = parts.split_last() else {
            return true;
        };
        let column = column.value.to_lowercase();
        if qualifier.is_empty() {
            if self
                .output_aliases
                .as_ref()
                .map_or(false, |aliases| aliases.contains(&column))
            {
                return true;
            }
            return self
                .frames
                .iter()
                .rev()
                .any(|frame| frame.bindings.iter().any(|b| b.source.has_column(&column)));
        }
        self.qualified_source(qualifier)
            .map_or(false, |source| source.has_column(&column))
    }

    /// Resolve the column references of one expression in the current frames.
    fn expr(&mut self, expr: &Expr, aliases: Option<&HashSet<String>>) {
        let saved_aliases = std::mem::replace(&mut self.output_aliases, aliases.cloned());
        let saved_depth = std::mem::replace(&mut self.depth, 0);
        let _ = expr.visit(self);
        self.depth = saved_depth;
        self.output_aliases = saved_aliases;
    }

    fn subquery(&mut self, query: &Query) {
        let saved_aliases = self.output_aliases.take();
        self.query(query);
        self.output_aliases = saved_aliases;
    }
}

impl Visitor for Resolver<'_> {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            if is_subquery(expr) {
                self.depth += 1;
            }
            return ControlFlow::Continue(());
        }
        match expr {
            Expr::Identifier(ident) => self.note_column(std::slice::from_ref(ident)),
            Expr::CompoundIdentifier(parts) => self.note_column(parts),
            Expr::Subquery(query) | Expr::ArraySubquery(query) => {
                self.subquery(query);
                self.depth += 1;
            }
            Expr::Exists { subquery, .. } => {
                self.subquery(subquery);
                self.depth += 1;
            }
            Expr::InSubquery { expr, subquery, .. } => {
                let _ = expr.visit(self);
                self.subquery(subquery);
                self.depth += 1;
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if is_subquery(expr) {
            self.depth = self.depth.saturating_sub(1);
        }
        ControlFlow::Continue(())
    }
}

impl<'c> Resolver<'c> {
    fn note_column(&mut self, parts: &[Ident]) {
        if !self.column_resolves(parts) {
            self.resolution.unknown.push(as_written(parts));
        }
    }
}

/// Column references of an expression, subqueries excluded.
#[derive(Default)]
struct ColumnRefs {
    refs: Vec<Vec<Ident>>,
    depth: usize,
}

impl Visitor for ColumnRefs {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if is_subquery(expr) {
            self.depth += 1;
        } else if self.depth == 0 {
            match expr {
                Expr::Identifier(ident) => self.refs.push(vec![ident.clone()]),
                Expr::CompoundIdentifier(parts) => self.refs.push(parts.clone()),
                _ => {}
            }
        }
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if is_subquery(expr) {
            self.depth = self.depth.saturating_sub(1);
        }
        ControlFlow::Continue(())
    }
}

fn is_subquery(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Subquery(_) | Expr::ArraySubquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. }
    )
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c) => Some(c),
        JoinOperator::CrossJoin | JoinOperator::CrossApply | JoinOperator::OuterApply => None,
    }
}

fn last_part(name: &ObjectName) -> String {
    name.0.last().map(|i| i.value.to_lowercase()).unwrap_or_default()
}

fn alias_columns(alias: &TableAlias) -> Vec<String> {
    alias.columns.iter().map(|c| c.value.to_lowercase()).collect()
}

/// Name PostgreSQL gives an unaliased output column, when it is a usable one.
fn implicit_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.to_lowercase()),
        Expr::Function(function) => function.name.0.last().map(|p| p.value.to_lowercase()),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => implicit_name(expr),
        _ => None,
    }
}

fn leading_keyword(statement: &str) -> String {
    statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

fn as_written(parts: &[Ident]) -> String {
    parts
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(".")
}
