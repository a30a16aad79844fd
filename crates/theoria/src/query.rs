use std::cmp;
use std::str::FromStr;

use sea_orm::DatabaseBackend;
use sea_orm::sea_query::{
    Alias, Asterisk, BinOper, Condition, Expr, ExprTrait, JoinType, Order, Query as SeaQuery,
    SelectStatement, Value as SeaValue,
};

use crate::{TheoriaError, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    NotLike,
}

impl Op {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "<>",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Gt => ">",
            Op::Gte => ">=",
            Op::Like => "LIKE",
            Op::NotLike => "NOT LIKE",
        }
    }

    fn bin_oper(&self) -> BinOper {
        match self {
            Op::Eq => BinOper::Equal,
            Op::Ne => BinOper::NotEqual,
            Op::Lt => BinOper::SmallerThan,
            Op::Lte => BinOper::SmallerThanOrEqual,
            Op::Gt => BinOper::GreaterThan,
            Op::Gte => BinOper::GreaterThanOrEqual,
            Op::Like => BinOper::Like,
            Op::NotLike => BinOper::NotLike,
        }
    }
}

impl FromStr for Op {
    type Err = TheoriaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Op::Eq,
            "!=" | "<>" => Op::Ne,
            "<" => Op::Lt,
            "<=" => Op::Lte,
            ">" => Op::Gt,
            ">=" => Op::Gte,
            "like" => Op::Like,
            "not like" => Op::NotLike,
            other => return Err(TheoriaError::invalid(format!("unsupported operator '{other}'"))),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boolean {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub(crate) fn reversed(self) -> Self {
        match self {
            Direction::Asc => Direction::Desc,
            Direction::Desc => Direction::Asc,
        }
    }

    fn order(self) -> Order {
        match self {
            Direction::Asc => Order::Asc,
            Direction::Desc => Order::Desc,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatePart {
    Date,
    Year,
    Month,
    Day,
    Time,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    fn sql(self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Clause {
    Basic {
        column: String,
        op: Op,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
    Null {
        column: String,
        negated: bool,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
        negated: bool,
    },
    Column {
        first: String,
        op: Op,
        second: String,
    },
    Date {
        column: String,
        part: DatePart,
        op: Op,
        value: Value,
    },
    Raw {
        sql: String,
        bindings: Vec<Value>,
    },
    Nested(Vec<Where>),
}

#[derive(Clone, Debug)]
pub(crate) struct Where {
    pub(crate) boolean: Boolean,
    pub(crate) clause: Clause,
}

#[derive(Clone, Debug)]
pub(crate) enum Select {
    Column(String),
    As { column: String, alias: String },
    Raw(String),
    RawAs { sql: String, alias: String },
}

#[derive(Clone, Debug)]
pub(crate) enum OrderBy {
    Column { column: String, direction: Direction },
    Raw { sql: String, direction: Direction },
    Random,
}

#[derive(Clone, Debug)]
pub(crate) struct Join {
    kind: JoinKind,
    table: String,
    first: String,
    op: Op,
    second: String,
}

#[derive(Clone, Debug)]
pub(crate) enum Having {
    Basic { column: String, op: Op, value: Value },
    Raw { sql: String, bindings: Vec<Value> },
}

/// Host query description. Read verbs record into it; it compiles to sea-query unchanged.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub(crate) table: String,
    pub(crate) selects: Vec<Select>,
    pub(crate) distinct: bool,
    pub(crate) joins: Vec<Join>,
    pub(crate) wheres: Vec<Where>,
    pub(crate) groups: Vec<String>,
    pub(crate) havings: Vec<Having>,
    pub(crate) orders: Vec<OrderBy>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn has_orders(&self) -> bool {
        !self.orders.is_empty()
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset_value(&self) -> Option<u64> {
        self.offset
    }

    pub(crate) fn push_where(&mut self, boolean: Boolean, clause: Clause) {
        self.wheres.push(Where { boolean, clause });
    }

    fn push_basic(&mut self, boolean: Boolean, column: String, op: Op, value: Value) {
        let clause = match (op, value.is_null()) {
            (Op::Eq, true) => Clause::Null {
                column,
                negated: false,
            },
            (Op::Ne, true) => Clause::Null {
                column,
                negated: true,
            },
            _ => Clause::Basic { column, op, value },
        };
        self.push_where(boolean, clause);
    }

    /// Wraps the current predicates in one group so appended scope predicates
    /// cannot bind to an `OR` branch.
    pub(crate) fn isolate_wheres(&mut self) {
        if self.wheres.iter().any(|w| w.boolean == Boolean::Or) {
            let wheres = std::mem::take(&mut self.wheres);
            self.push_where(Boolean::And, Clause::Nested(wheres));
        }
    }

    /// Column orders in effect, used by cursor pagination.
    pub(crate) fn column_orders(&self) -> Vec<(String, Direction)> {
        self.orders
            .iter()
            .filter_map(|order| match order {
                OrderBy::Column { column, direction } => Some((column.clone(), *direction)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn to_statement(&self, backend: DatabaseBackend) -> SelectStatement {
        let mut select = SeaQuery::select();
        select.from(alias(&self.table));
        if self.distinct {
            select.distinct();
        }
        if self.selects.is_empty() {
            select.column((alias(&self.table), Asterisk));
        }
        for item in &self.selects {
            match item {
                Select::Column(column) => {
                    select.expr(column_expr(column));
                }
                Select::As { column, alias: name } => {
                    select.expr_as(column_expr(column), alias(name));
                }
                Select::Raw(sql) => {
                    select.expr(Expr::cust(sql.clone()));
                }
                Select::RawAs { sql, alias: name } => {
                    select.expr_as(Expr::cust(sql.clone()), alias(name));
                }
            }
        }
        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Inner => JoinType::InnerJoin,
                JoinKind::Left => JoinType::LeftJoin,
                JoinKind::Right => JoinType::RightJoin,
            };
            let on = column_expr(&join.first)
                .binary(join.op.bin_oper(), column_expr(&join.second));
            select.join(kind, alias(&join.table), on);
        }
        if !self.wheres.is_empty() {
            select.cond_where(condition(&self.wheres, backend));
        }
        for group in &self.groups {
            select.add_group_by([column_expr(group)]);
        }
        if !self.havings.is_empty() {
            let mut having = Condition::all();
            for clause in &self.havings {
                having = match clause {
                    Having::Basic { column, op, value } => having
                        .add(column_expr(column).binary(op.bin_oper(), Expr::val(value.to_sea()))),
                    Having::Raw { sql, bindings } => having.add(raw_expr(sql, bindings)),
                };
            }
            select.cond_having(having);
        }
        for order in &self.orders {
            match order {
                OrderBy::Column { column, direction } => {
                    select.order_by_expr(column_expr(column), direction.order());
                }
                OrderBy::Raw { sql, direction } => {
                    select.order_by_expr(Expr::cust(sql.clone()), direction.order());
                }
                OrderBy::Random => {
                    select.order_by_expr(Expr::cust(random_function(backend)), Order::Asc);
                }
            }
        }
        if let Some(limit) = self.limit {
            select.limit(limit);
        }
        if let Some(offset) = self.offset {
            select.offset(offset);
        }
        select
    }

    /// `SELECT fn(column) AS aggregate`. Orders and pagination are dropped; grouped or
    /// distinct queries are wrapped in a subquery.
    pub(crate) fn aggregate_statement(
        &self,
        function: Aggregate,
        column: Option<&str>,
        backend: DatabaseBackend,
    ) -> SelectStatement {
        let mut base = self.clone();
        base.orders.clear();
        base.limit = None;
        base.offset = None;
        if !base.groups.is_empty() || base.distinct {
            let inner = base.to_statement(backend);
            let outer_column = match column {
                Some(column) if function != Aggregate::Count => {
                    quote_column(backend, column.rsplit('.').next().unwrap_or(column))
                }
                _ => "*".to_string(),
            };
            let mut outer = SeaQuery::select();
            outer
                .expr_as(
                    Expr::cust(format!("{}({outer_column})", function.sql())),
                    alias("aggregate"),
                )
                .from_subquery(inner, alias("aggregate_table"));
            return outer;
        }
        let column_sql = match column {
            Some(column) => quote_column(backend, column),
            None => "*".to_string(),
        };
        base.selects = vec![Select::RawAs {
            sql: format!("{}({column_sql})", function.sql()),
            alias: "aggregate".to_string(),
        }];
        base.to_statement(backend)
    }

    pub(crate) fn exists_statement(&self, backend: DatabaseBackend) -> SelectStatement {
        let mut base = self.clone();
        base.orders.clear();
        base.selects = vec![Select::Raw("1".to_string())];
        base.limit = Some(1);
        base.offset = None;
        base.to_statement(backend)
    }

    /// Predicates only, for native `UPDATE`/`DELETE` statements.
    pub(crate) fn condition(&self, backend: DatabaseBackend) -> Option<Condition> {
        if self.wheres.is_empty() {
            None
        } else {
            Some(condition(&self.wheres, backend))
        }
    }
}

/// LIMIT and OFFSET are bound as signed 64-bit integers by every backend.
pub(crate) const MAX_WINDOW: u64 = i64::MAX as u64;

/// Row offset of a one-based page, or `None` when it does not fit a SQL offset.
pub(crate) fn page_offset(page: u64, per_page: u64) -> Option<u64> {
    cmp::max(page, 1)
        .checked_sub(1)?
        .checked_mul(per_page)
        .filter(|offset| *offset <= MAX_WINDOW)
}

/// Read verbs shared by `Query`, the typed builders and relation queries.
pub trait QueryFilters: Sized {
    fn query_mut(&mut self) -> &mut Query;

    fn where_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_op(column, Op::Eq, value)
    }

    fn where_op(mut self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.query_mut()
            .push_basic(Boolean::And, column.into(), op, value.into());
        self
    }

    fn or_where_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.or_where_op(column, Op::Eq, value)
    }

    fn or_where_op(mut self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.query_mut()
            .push_basic(Boolean::Or, column.into(), op, value.into());
        self
    }

    fn where_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_in(Boolean::And, column.into(), values, false)
    }

    fn where_not_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_in(Boolean::And, column.into(), values, true)
    }

    fn or_where_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_in(Boolean::Or, column.into(), values, false)
    }

    #[doc(hidden)]
    fn push_in<I, V>(mut self, boolean: Boolean, column: String, values: I, negated: bool) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.query_mut().push_where(
            boolean,
            Clause::In {
                column,
                values,
                negated,
            },
        );
        self
    }

    fn where_null(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.query_mut().push_where(
            Boolean::And,
            Clause::Null {
                column,
                negated: false,
            },
        );
        self
    }

    fn where_not_null(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.query_mut().push_where(
            Boolean::And,
            Clause::Null {
                column,
                negated: true,
            },
        );
        self
    }

    fn or_where_null(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.query_mut().push_where(
            Boolean::Or,
            Clause::Null {
                column,
                negated: false,
            },
        );
        self
    }

    fn or_where_not_null(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.query_mut().push_where(
            Boolean::Or,
            Clause::Null {
                column,
                negated: true,
            },
        );
        self
    }

    fn where_between(
        mut self,
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        let clause = Clause::Between {
            column: column.into(),
            low: low.into(),
            high: high.into(),
            negated: false,
        };
        self.query_mut().push_where(Boolean::And, clause);
        self
    }

    fn where_not_between(
        mut self,
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        let clause = Clause::Between {
            column: column.into(),
            low: low.into(),
            high: high.into(),
            negated: true,
        };
        self.query_mut().push_where(Boolean::And, clause);
        self
    }

    fn where_column(mut self, first: impl Into<String>, op: Op, second: impl Into<String>) -> Self {
        let clause = Clause::Column {
            first: first.into(),
            op,
            second: second.into(),
        };
        self.query_mut().push_where(Boolean::And, clause);
        self
    }

    fn where_date_part(
        mut self,
        column: impl Into<String>,
        part: DatePart,
        op: Op,
        value: impl Into<Value>,
    ) -> Self {
        let clause = Clause::Date {
            column: column.into(),
            part,
            op,
            value: value.into(),
        };
        self.query_mut().push_where(Boolean::And, clause);
        self
    }

    fn where_date(self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.where_date_part(column, DatePart::Date, op, value)
    }

    fn where_year(self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.where_date_part(column, DatePart::Year, op, value)
    }

    fn where_month(self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.where_date_part(column, DatePart::Month, op, value)
    }

    fn where_day(self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.where_date_part(column, DatePart::Day, op, value)
    }

    fn where_time(self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.where_date_part(column, DatePart::Time, op, value)
    }

    fn where_raw(mut self, sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        let clause = Clause::Raw {
            sql: sql.into(),
            bindings,
        };
        self.query_mut().push_where(Boolean::And, clause);
        self
    }

    fn or_where_raw(mut self, sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        let clause = Clause::Raw {
            sql: sql.into(),
            bindings,
        };
        self.query_mut().push_where(Boolean::Or, clause);
        self
    }

    /// Parenthesised group of predicates built against a fresh query on the same table.
    fn where_nested<N>(mut self, build: N) -> Self
    where
        N: FnOnce(Query) -> Query,
    {
        let nested = build(Query::new(self.query_mut().table.clone()));
        if !nested.wheres.is_empty() {
            self.query_mut()
                .push_where(Boolean::And, Clause::Nested(nested.wheres));
        }
        self
    }

    fn or_where_nested<N>(mut self, build: N) -> Self
    where
        N: FnOnce(Query) -> Query,
    {
        let nested = build(Query::new(self.query_mut().table.clone()));
        if !nested.wheres.is_empty() {
            self.query_mut()
                .push_where(Boolean::Or, Clause::Nested(nested.wheres));
        }
        self
    }

    fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query_mut().selects = columns
            .into_iter()
            .map(|column| Select::Column(column.into()))
            .collect();
        self
    }

    fn add_select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let query = self.query_mut();
        if query.selects.is_empty() {
            let all = format!("{}.*", query.table);
            query.selects.push(Select::Column(all));
        }
        query
            .selects
            .extend(columns.into_iter().map(|column| Select::Column(column.into())));
        self
    }

    fn select_as(mut self, column: impl Into<String>, alias: impl Into<String>) -> Self {
        self.query_mut().selects.push(Select::As {
            column: column.into(),
            alias: alias.into(),
        });
        self
    }

    fn select_raw(mut self, sql: impl Into<String>) -> Self {
        self.query_mut().selects.push(Select::Raw(sql.into()));
        self
    }

    fn distinct(mut self) -> Self {
        self.query_mut().distinct = true;
        self
    }

    fn join_kind(
        mut self,
        kind: JoinKind,
        table: impl Into<String>,
        first: impl Into<String>,
        op: Op,
        second: impl Into<String>,
    ) -> Self {
        self.query_mut().joins.push(Join {
            kind,
            table: table.into(),
            first: first.into(),
            op,
            second: second.into(),
        });
        self
    }

    fn join(
        self,
        table: impl Into<String>,
        first: impl Into<String>,
        op: Op,
        second: impl Into<String>,
    ) -> Self {
        self.join_kind(JoinKind::Inner, table, first, op, second)
    }

    fn left_join(
        self,
        table: impl Into<String>,
        first: impl Into<String>,
        op: Op,
        second: impl Into<String>,
    ) -> Self {
        self.join_kind(JoinKind::Left, table, first, op, second)
    }

    fn right_join(
        self,
        table: impl Into<String>,
        first: impl Into<String>,
        op: Op,
        second: impl Into<String>,
    ) -> Self {
        self.join_kind(JoinKind::Right, table, first, op, second)
    }

    fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query_mut()
            .groups
            .extend(columns.into_iter().map(Into::into));
        self
    }

    fn having(mut self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.query_mut().havings.push(Having::Basic {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    fn having_raw(mut self, sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        self.query_mut().havings.push(Having::Raw {
            sql: sql.into(),
            bindings,
        });
        self
    }

    fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.query_mut().orders.push(OrderBy::Column {
            column: column.into(),
            direction,
        });
        self
    }

    fn order_by_desc(self, column: impl Into<String>) -> Self {
        self.order_by(column, Direction::Desc)
    }

    /// Raw ordering fragment; a trailing `asc`/`desc` sets the direction.
    fn order_by_raw(mut self, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let lowered = sql.trim_end().to_ascii_lowercase();
        let (sql, direction) = if let Some(head) = lowered.strip_suffix(" desc") {
            (sql[..head.len()].to_string(), Direction::Desc)
        } else if let Some(head) = lowered.strip_suffix(" asc") {
            (sql[..head.len()].to_string(), Direction::Asc)
        } else {
            (sql, Direction::Asc)
        };
        self.query_mut().orders.push(OrderBy::Raw { sql, direction });
        self
    }

    fn latest(self) -> Self {
        self.latest_by("created_at")
    }

    fn latest_by(self, column: impl Into<String>) -> Self {
        self.order_by(column, Direction::Desc)
    }

    fn oldest(self) -> Self {
        self.oldest_by("created_at")
    }

    fn oldest_by(self, column: impl Into<String>) -> Self {
        self.order_by(column, Direction::Asc)
    }

    fn in_random_order(mut self) -> Self {
        self.query_mut().orders.push(OrderBy::Random);
        self
    }

    fn reorder(mut self) -> Self {
        self.query_mut().orders.clear();
        self
    }

    fn limit(mut self, limit: u64) -> Self {
        self.query_mut().limit = Some(cmp::min(limit, MAX_WINDOW));
        self
    }

    fn take(self, limit: u64) -> Self {
        self.limit(limit)
    }

    fn offset(mut self, offset: u64) -> Self {
        self.query_mut().offset = Some(cmp::min(offset, MAX_WINDOW));
        self
    }

    fn skip(self, offset: u64) -> Self {
        self.offset(offset)
    }

    /// One-based page window. Offsets past the largest SQL offset are clamped.
    fn for_page(self, page: u64, per_page: u64) -> Self {
        let offset = page_offset(page, per_page).unwrap_or(MAX_WINDOW);
        self.offset(offset).limit(per_page)
    }

    fn when<B>(self, condition: bool, branch: B) -> Self
    where
        B: FnOnce(Self) -> Self,
    {
        if condition { branch(self) } else { self }
    }

    fn unless<B>(self, condition: bool, branch: B) -> Self
    where
        B: FnOnce(Self) -> Self,
    {
        self.when(!condition, branch)
    }
}

impl QueryFilters for Query {
    fn query_mut(&mut self) -> &mut Query {
        self
    }
}

pub(crate) fn alias(name: &str) -> Alias {
    Alias::new(name.to_string())
}

pub(crate) fn column_expr(column: &str) -> Expr {
    match column.split_once('.') {
        Some((table, "*")) => Expr::col((alias(table), Asterisk)),
        Some((table, name)) => Expr::col((alias(table), alias(name))),
        None if column == "*" => Expr::col(Asterisk),
        None => Expr::col(alias(column)),
    }
}

pub(crate) fn quote_column(backend: DatabaseBackend, column: &str) -> String {
    let quote = match backend {
        DatabaseBackend::MySql => '`',
        _ => '"',
    };
    column
        .split('.')
        .map(|part| {
            if part == "*" {
                part.to_string()
            } else {
                let escaped = part.replace(quote, &format!("{quote}{quote}"));
                format!("{quote}{escaped}{quote}")
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn random_function(backend: DatabaseBackend) -> String {
    match backend {
        DatabaseBackend::MySql => "RAND()".to_string(),
        _ => "RANDOM()".to_string(),
    }
}

fn raw_expr(sql: &str, bindings: &[Value]) -> Expr {
    if bindings.is_empty() {
        Expr::cust(sql.to_string())
    } else {
        let values: Vec<SeaValue> = bindings.iter().map(Value::to_sea).collect();
        Expr::cust_with_values(sql.to_string(), values)
    }
}

/// Left-to-right predicates where `AND` binds tighter than `OR`.
fn condition(wheres: &[Where], backend: DatabaseBackend) -> Condition {
    let mut any = Condition::any();
    let mut group = Condition::all();
    for (index, item) in wheres.iter().enumerate() {
        if index > 0 && item.boolean == Boolean::Or {
            any = any.add(group);
            group = Condition::all();
        }
        group = group.add(clause_condition(&item.clause, backend));
    }
    any.add(group)
}

fn clause_condition(clause: &Clause, backend: DatabaseBackend) -> Condition {
    let expr = match clause {
        Clause::Basic { column, op, value } => {
            column_expr(column).binary(op.bin_oper(), Expr::val(value.to_sea()))
        }
        Clause::In {
            column,
            values,
            negated,
        } => {
            let values: Vec<SeaValue> = values.iter().map(Value::to_sea).collect();
            if *negated {
                column_expr(column).is_not_in(values)
            } else {
                column_expr(column).is_in(values)
            }
        }
        Clause::Null { column, negated } => {
            if *negated {
                column_expr(column).is_not_null()
            } else {
                column_expr(column).is_null()
            }
        }
        Clause::Between {
            column,
            low,
            high,
            negated,
        } => {
            if *negated {
                column_expr(column).not_between(Expr::val(low.to_sea()), Expr::val(high.to_sea()))
            } else {
                column_expr(column).between(Expr::val(low.to_sea()), Expr::val(high.to_sea()))
            }
        }
        Clause::Column { first, op, second } => {
            column_expr(first).binary(op.bin_oper(), column_expr(second))
        }
        Clause::Date {
            column,
            part,
            op,
            value,
        } => date_expr(backend, column, *part, *op, value),
        Clause::Raw { sql, bindings } => raw_expr(sql, bindings),
        Clause::Nested(wheres) => return condition(wheres, backend),
    };
    Condition::all().add(expr)
}

fn date_expr(
    backend: DatabaseBackend,
    column: &str,
    part: DatePart,
    op: Op,
    value: &Value,
) -> Expr {
    let quoted = quote_column(backend, column);
    let binding = match (part, value) {
        (DatePart::Date, Value::DateTime(at)) => Value::Text(at.date().to_string()),
        (DatePart::Time, Value::DateTime(at)) => Value::Text(format!(
            "{:02}:{:02}:{:02}",
            at.hour(),
            at.minute(),
            at.second()
        )),
        (DatePart::Year, Value::DateTime(at)) => Value::Int(i64::from(at.year())),
        (DatePart::Month, Value::DateTime(at)) => Value::Int(i64::from(u8::from(at.month()))),
        (DatePart::Day, Value::DateTime(at)) => Value::Int(i64::from(at.day())),
        (_, other) => other.clone(),
    };
    let lhs = match (backend, part) {
        (DatabaseBackend::Postgres, DatePart::Date) => format!("{quoted}::date"),
        (DatabaseBackend::Postgres, DatePart::Time) => format!("{quoted}::time"),
        (DatabaseBackend::Postgres, DatePart::Year) => format!("extract(year from {quoted})"),
        (DatabaseBackend::Postgres, DatePart::Month) => format!("extract(month from {quoted})"),
        (DatabaseBackend::Postgres, DatePart::Day) => format!("extract(day from {quoted})"),
        (DatabaseBackend::MySql, DatePart::Date) => format!("date({quoted})"),
        (DatabaseBackend::MySql, DatePart::Time) => format!("time({quoted})"),
        (DatabaseBackend::MySql, DatePart::Year) => format!("year({quoted})"),
        (DatabaseBackend::MySql, DatePart::Month) => format!("month({quoted})"),
        (DatabaseBackend::MySql, DatePart::Day) => format!("day({quoted})"),
        (_, DatePart::Date) => format!("date({quoted})"),
        (_, DatePart::Time) => format!("strftime('%H:%M:%S', {quoted})"),
        (_, DatePart::Year) => format!("CAST(strftime('%Y', {quoted}) AS INTEGER)"),
        (_, DatePart::Month) => format!("CAST(strftime('%m', {quoted}) AS INTEGER)"),
        (_, DatePart::Day) => format!("CAST(strftime('%d', {quoted}) AS INTEGER)"),
    };
    let placeholder = match (backend, part) {
        (DatabaseBackend::Postgres, DatePart::Date) => "CAST(? AS date)",
        (DatabaseBackend::Postgres, DatePart::Time) => "CAST(? AS time)",
        (DatabaseBackend::Sqlite, DatePart::Year | DatePart::Month | DatePart::Day) => {
            "CAST(? AS INTEGER)"
        }
        _ => "?",
    };
    Expr::cust_with_values(
        format!("{lhs} {} {placeholder}", op.as_sql()),
        [binding.to_sea()],
    )
}
