// Query planner: composes filter + sort + options into one deterministic
// SQL statement across up to four tables plus a synthetic directory-
// aggregate subquery (spec.md §4.1 "Query planner").
//
// Driver-table precedence, grounded in
// original_source/src/list_mgr/listmgr_iterators.c's `append_dir_req`:
//   1. filter touches exactly one table and sort is in that table (or is a
//      dir aggregate) -> use that table alone.
//   2. otherwise, INNER JOIN every table hit by filter or sort on id = id.
//   3. a dir-aggregate filter becomes a LEFT JOIN on a GROUP BY subquery.
//   4. a dir-aggregate sort introduces a second synthetic `dirattr_sort`
//      column, reusing the filter's aggregate subquery when they agree.

use rusqlite::types::Value as SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Main,
    Annex,
    StripeInfo,
    StripeItems,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Main => "main",
            Table::Annex => "annex",
            Table::StripeInfo => "stripe_info",
            Table::StripeItems => "stripe_items",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CmpOp {
    fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub table: Table,
    pub column: &'static str,
    pub op: CmpOp,
    pub value: SqlValue,
}

/// The two directory aggregates the catalog can compute over `MAIN`'s
/// children, per spec.md "GetDirAttrs" (`dircount`, `avgsize`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirAggregate {
    Count,
    AvgSize,
}

impl DirAggregate {
    fn expr(&self) -> &'static str {
        match self {
            DirAggregate::Count => "COUNT(*)",
            DirAggregate::AvgSize => "AVG(size)",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirFilter {
    pub aggregate: DirAggregate,
    pub op: CmpOp,
    pub value: SqlValue,
}

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub predicates: Vec<Predicate>,
    pub dir_filter: Option<DirFilter>,
}

impl Filter {
    pub fn tables(&self) -> Vec<Table> {
        let mut tables: Vec<Table> = self.predicates.iter().map(|p| p.table).collect();
        tables.sort_by_key(table_order);
        tables.dedup();
        tables
    }
}

#[derive(Debug, Clone)]
pub enum SortKey {
    Column(Table, &'static str),
    DirAggregate(DirAggregate),
}

#[derive(Debug, Clone)]
pub struct Sort {
    pub key: SortKey,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    pub limit: Option<u64>,
}

fn table_order(t: &Table) -> u8 {
    match t {
        Table::Main => 0,
        Table::Annex => 1,
        Table::StripeInfo => 2,
        Table::StripeItems => 3,
    }
}

/// A rendered, ready-to-prepare query.
#[derive(Debug, Clone)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Renders `filter`/`sort`/`options` into a single query selecting `main.id`.
/// Assembly is purely a function of its inputs -- identical inputs always
/// produce identical SQL, so the database can cache the prepared statement.
pub fn build_iterator_query(filter: &Filter, sort: Option<&Sort>, options: &IterOptions) -> BuiltQuery {
    let filter_tables = filter.tables();
    let sort_table = match sort {
        Some(Sort { key: SortKey::Column(t, _), .. }) => Some(*t),
        _ => None,
    };
    let sort_is_dir_aggregate = matches!(sort, Some(Sort { key: SortKey::DirAggregate(_), .. }));

    let driver = filter_tables.first().copied().unwrap_or(Table::Main);

    let single_table_path = filter.dir_filter.is_none()
        && filter_tables.len() <= 1
        && (sort_table.is_none() || sort_table == Some(driver) || sort_is_dir_aggregate);

    let mut sql = String::new();
    let mut params = Vec::new();

    if single_table_path {
        // Rule 1: filter touches at most one table and sort agrees (or is absent).
        sql.push_str(&format!("SELECT {}.id FROM {}", driver.name(), driver.name()));

        if sort_is_dir_aggregate {
            append_dir_sort_join(&mut sql, driver, None);
        }

        append_where(&mut sql, &mut params, &filter.predicates, driver, &[]);
    } else {
        // Rule 2: join every table the filter or sort touches.
        let mut tables = filter_tables.clone();
        if let Some(t) = sort_table {
            if !tables.contains(&t) {
                tables.push(t);
            }
        }
        if tables.is_empty() {
            tables.push(Table::Main);
        }
        tables.sort_by_key(table_order);
        tables.dedup();

        sql.push_str(&format!("SELECT {}.id FROM {}", Table::Main.name(), Table::Main.name()));
        for t in tables.iter().filter(|t| **t != Table::Main) {
            sql.push_str(&format!(" INNER JOIN {} ON {}.id = main.id", t.name(), t.name()));
        }

        // Rule 3: directory-aggregate filter joins a GROUP BY subquery.
        let mut dir_sort_same_as_filter = false;
        if let Some(dir_filter) = &filter.dir_filter {
            if let Some(Sort { key: SortKey::DirAggregate(sort_agg), .. }) = sort {
                if *sort_agg == dir_filter.aggregate {
                    dir_sort_same_as_filter = true;
                }
            }
            append_dir_filter_join(&mut sql, dir_filter, dir_sort_same_as_filter);
        } else if sort_is_dir_aggregate {
            append_dir_sort_join(&mut sql, Table::Main, None);
        }

        append_where(&mut sql, &mut params, &filter.predicates, Table::Main, &tables);

        if let Some(dir_filter) = &filter.dir_filter {
            let clause = format!("da.dirattr {} ?", dir_filter.op.sql());
            push_and(&mut sql, &filter.predicates, &clause);
            params.push(dir_filter.value.clone());
        }
    }

    if let Some(sort) = sort {
        let order_col = match &sort.key {
            SortKey::Column(t, c) => format!("{}.{}", t.name(), c),
            // Rule 4: sort-on-aggregate always reads back the synthetic column,
            // reusing it whether it came from rule 1's bare join or rule 3's
            // shared subquery.
            SortKey::DirAggregate(_) => "da.dirattr_sort".to_string(),
        };
        sql.push_str(&format!(" ORDER BY {} {}", order_col, if sort.ascending { "ASC" } else { "DESC" }));
    }

    if let Some(limit) = options.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    BuiltQuery { sql, params }
}

fn append_dir_sort_join(sql: &mut String, _driver: Table, _unused: Option<()>) {
    sql.push_str(
        " LEFT JOIN (SELECT parent_id, COUNT(*) as dirattr_sort FROM main GROUP BY parent_id) \
         as da ON main.id = da.parent_id",
    );
}

fn append_dir_filter_join(sql: &mut String, dir_filter: &DirFilter, also_sort: bool) {
    if also_sort {
        sql.push_str(&format!(
            " LEFT JOIN (SELECT parent_id, {agg} as dirattr, {agg} as dirattr_sort FROM main GROUP BY parent_id) \
             as da ON main.id = da.parent_id",
            agg = dir_filter.aggregate.expr()
        ));
    } else {
        sql.push_str(&format!(
            " LEFT JOIN (SELECT parent_id, {agg} as dirattr FROM main GROUP BY parent_id) \
             as da ON main.id = da.parent_id",
            agg = dir_filter.aggregate.expr()
        ));
    }
}

fn append_where(
    sql: &mut String,
    params: &mut Vec<SqlValue>,
    predicates: &[Predicate],
    _driver: Table,
    _joined: &[Table],
) {
    if predicates.is_empty() {
        return;
    }
    sql.push_str(" WHERE ");
    let clauses: Vec<String> = predicates
        .iter()
        .map(|p| format!("{}.{} {} ?", p.table.name(), p.column, p.op.sql()))
        .collect();
    sql.push_str(&clauses.join(" AND "));
    params.extend(predicates.iter().map(|p| p.value.clone()));
}

fn push_and(sql: &mut String, predicates: &[Predicate], clause: &str) {
    if predicates.is_empty() {
        sql.push_str(" WHERE ");
    } else {
        sql.push_str(" AND ");
    }
    sql.push_str(clause);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq_pred(table: Table, column: &'static str, value: SqlValue) -> Predicate {
        Predicate { table, column, op: CmpOp::Eq, value }
    }

    #[test]
    fn single_table_filter_and_matching_sort_uses_one_table() {
        let filter = Filter {
            predicates: vec![eq_pred(Table::Main, "status", SqlValue::Text("new".into()))],
            dir_filter: None,
        };
        let sort = Sort { key: SortKey::Column(Table::Main, "last_mod"), ascending: true };
        let built = build_iterator_query(&filter, Some(&sort), &IterOptions::default());
        assert!(!built.sql.contains("JOIN"));
        assert!(built.sql.contains("ORDER BY main.last_mod ASC"));
    }

    #[test]
    fn cross_table_filter_joins_every_touched_table() {
        let filter = Filter {
            predicates: vec![
                eq_pred(Table::Main, "type", SqlValue::Text("file".into())),
                eq_pred(Table::StripeInfo, "pool_name", SqlValue::Text("pool0".into())),
            ],
            dir_filter: None,
        };
        let built = build_iterator_query(&filter, None, &IterOptions::default());
        assert!(built.sql.contains("INNER JOIN stripe_info ON stripe_info.id = main.id"));
    }

    /// spec.md §8 scenario 6: filter on type=file, sort on directory
    /// dircount -- exactly one LEFT JOIN, and the sort column is the
    /// synthetic `dirattr_sort`.
    #[test]
    fn type_filter_with_dircount_sort_uses_single_left_join_and_synthetic_sort_column() {
        let filter = Filter {
            predicates: vec![eq_pred(Table::Main, "type", SqlValue::Text("file".into()))],
            dir_filter: None,
        };
        let sort = Sort { key: SortKey::DirAggregate(DirAggregate::Count), ascending: false };
        let built = build_iterator_query(&filter, Some(&sort), &IterOptions::default());

        let left_join_count = built.sql.matches("LEFT JOIN").count();
        assert_eq!(left_join_count, 1);
        assert!(built.sql.contains("ORDER BY da.dirattr_sort DESC"));
    }

    #[test]
    fn dir_aggregate_filter_and_same_aggregate_sort_reuse_one_subquery() {
        let filter = Filter {
            predicates: vec![],
            dir_filter: Some(DirFilter { aggregate: DirAggregate::Count, op: CmpOp::Eq, value: SqlValue::Integer(0) }),
        };
        let sort = Sort { key: SortKey::DirAggregate(DirAggregate::Count), ascending: true };
        let built = build_iterator_query(&filter, Some(&sort), &IterOptions::default());
        assert_eq!(built.sql.matches("LEFT JOIN").count(), 1);
        assert!(built.sql.contains("dirattr_sort"));
        assert!(built.sql.contains("dirattr "));
    }

    #[test]
    fn limit_is_appended_last() {
        let filter = Filter::default();
        let built = build_iterator_query(&filter, None, &IterOptions { limit: Some(10) });
        assert!(built.sql.trim_end().ends_with("LIMIT 10"));
    }

    #[test]
    fn identical_inputs_produce_identical_sql() {
        let filter = Filter {
            predicates: vec![eq_pred(Table::Main, "status", SqlValue::Text("new".into()))],
            dir_filter: None,
        };
        let a = build_iterator_query(&filter, None, &IterOptions::default());
        let b = build_iterator_query(&filter, None, &IterOptions::default());
        assert_eq!(a.sql, b.sql);
    }
}
