//! Per-connection prepared-statement cache.
//!
//! Entries are indexed by SQL text alone, while result-set type and
//! concurrency still participate in entry equality: a lookup that finds an
//! entry with different result-set characteristics is served as a one-shot,
//! uncached statement instead of reusing or replacing the entry. Eviction is
//! restricted to entries that are no longer open — a statement currently in
//! use is never closed out from under its caller.

use std::time::Duration;

use hashlink::LinkedHashMap;

use crate::driver::{
    DriverError, FetchDirection, PhysicalConnection, PhysicalStatement, ResultSetConcurrency,
    ResultSetType,
};

pub(crate) struct StatementCache {
    max: usize,
    entries: LinkedHashMap<String, CachedStatement>,
}

/// A driver statement retained across logical connection uses.
pub(crate) struct CachedStatement {
    stmt: Box<dyn PhysicalStatement>,
    rs_type: ResultSetType,
    rs_concurrency: ResultSetConcurrency,
    opened: bool,
    dirty: bool,
}

/// Outcome of [`StatementCache::prepare`].
pub(crate) enum Prepared {
    /// Served from (and tracked by) the cache under its SQL key.
    Cached { reused: bool },
    /// A fresh driver statement the cache does not track; the caller owns it.
    OneShot(Box<dyn PhysicalStatement>),
}

impl CachedStatement {
    /// Reset the entry for a new logical use. Parameters and warnings are
    /// always cleared; mutated statement properties are restored to driver
    /// defaults only when a previous use actually touched them.
    fn reuse(&mut self) -> Result<(), DriverError> {
        self.stmt.clear_parameters();
        self.stmt.clear_warnings();

        if self.dirty {
            self.stmt.clear_batch();
            self.stmt.set_fetch_direction(FetchDirection::Forward)?;
            self.stmt.set_fetch_size(0)?;
            self.stmt.set_max_field_size(0)?;
            self.stmt.set_max_rows(0)?;
            self.stmt.set_query_timeout(Duration::ZERO)?;
            self.dirty = false;
        }

        Ok(())
    }

    pub(crate) fn stmt_mut(&mut self) -> &mut dyn PhysicalStatement {
        self.stmt.as_mut()
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[cfg(test)]
    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl StatementCache {
    /// `max == 0` disables caching entirely.
    pub(crate) fn new(max: usize) -> Self {
        StatementCache {
            max,
            entries: LinkedHashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn contains(&self, sql: &str) -> bool {
        self.entries.contains_key(sql)
    }

    /// Look up or create a statement for `sql`.
    pub(crate) fn prepare(
        &mut self,
        physical: &mut dyn PhysicalConnection,
        sql: &str,
        rs_type: ResultSetType,
        rs_concurrency: ResultSetConcurrency,
    ) -> Result<Prepared, DriverError> {
        if self.max == 0 {
            return Ok(Prepared::OneShot(physical.prepare(
                sql,
                rs_type,
                rs_concurrency,
            )?));
        }

        if let Some(entry) = self.entries.get_mut(sql) {
            if entry.rs_type != rs_type || entry.rs_concurrency != rs_concurrency {
                // SQL-keyed index; a collision on result-set characteristics
                // bypasses the cache.
                return Ok(Prepared::OneShot(physical.prepare(
                    sql,
                    rs_type,
                    rs_concurrency,
                )?));
            }

            if entry.opened {
                log::warn!(
                    target: "aquifer::cache",
                    "prepared statement {sql:?} is already in use"
                );
            }

            entry.reuse()?;
            entry.opened = true;

            return Ok(Prepared::Cached { reused: true });
        }

        let stmt = physical.prepare(sql, rs_type, rs_concurrency)?;
        self.entries.insert(
            sql.to_owned(),
            CachedStatement {
                stmt,
                rs_type,
                rs_concurrency,
                opened: true,
                dirty: false,
            },
        );

        Ok(Prepared::Cached { reused: false })
    }

    /// Run `f` against the cached statement for `sql`, if it is still cached.
    pub(crate) fn with_statement<R>(
        &mut self,
        sql: &str,
        f: impl FnOnce(&mut CachedStatement) -> R,
    ) -> Option<R> {
        self.entries.get_mut(sql).map(f)
    }

    /// The caller is done with the statement for `sql`. The entry stays
    /// cached for reuse; once the cache is at capacity, the first closed
    /// entry in insertion order is physically evicted.
    pub(crate) fn statement_closed(&mut self, sql: &str) {
        if let Some(entry) = self.entries.get_mut(sql) {
            entry.opened = false;
        }

        if self.entries.len() >= self.max {
            self.evict_closed();
        }
    }

    fn evict_closed(&mut self) {
        let key = self
            .entries
            .iter()
            .find(|(_, entry)| !entry.opened)
            .map(|(sql, _)| sql.clone());

        if let Some(key) = key {
            if let Some(mut entry) = self.entries.remove(&key) {
                debug_assert!(!entry.opened);
                if let Err(err) = entry.stmt.close() {
                    log::debug!(
                        target: "aquifer::cache",
                        "error closing evicted statement {key:?}: {err}"
                    );
                }
            }
        }
    }

    /// Logically close every entry still marked open, warning per statement.
    /// Returns how many were found open.
    pub(crate) fn close_open(&mut self) -> usize {
        let mut open = 0;

        for (sql, entry) in self.entries.iter_mut() {
            if entry.opened {
                log::warn!(
                    target: "aquifer::cache",
                    "statement {sql:?} was still open when its connection was released"
                );
                entry.opened = false;
                open += 1;
            }
        }

        open
    }

    /// Physically close and drop every entry, swallowing driver errors.
    pub(crate) fn clear(&mut self) {
        while let Some((sql, mut entry)) = self.entries.pop_front() {
            if let Err(err) = entry.stmt.close() {
                log::debug!(
                    target: "aquifer::cache",
                    "error closing cached statement {sql:?}: {err}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Prepared, StatementCache};
    use crate::driver::{ResultSetConcurrency, ResultSetType};
    use crate::mock;

    fn prepare(cache: &mut StatementCache, physical: &mut dyn crate::driver::PhysicalConnection, sql: &str) -> Prepared {
        cache
            .prepare(
                physical,
                sql,
                ResultSetType::default(),
                ResultSetConcurrency::default(),
            )
            .unwrap()
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let (mut physical, _ctl) = mock::connection();
        let mut cache = StatementCache::new(0);

        assert!(matches!(
            prepare(&mut cache, physical.as_mut(), "SELECT 1"),
            Prepared::OneShot(_)
        ));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn hit_reuses_the_driver_statement() {
        let (mut physical, ctl) = mock::connection();
        let mut cache = StatementCache::new(4);

        assert!(matches!(
            prepare(&mut cache, physical.as_mut(), "SELECT 1"),
            Prepared::Cached { reused: false }
        ));
        cache.statement_closed("SELECT 1");

        assert!(matches!(
            prepare(&mut cache, physical.as_mut(), "SELECT 1"),
            Prepared::Cached { reused: true }
        ));

        // One driver-level prepare; the second use cleared parameters.
        assert_eq!(ctl.statements().len(), 1);
        assert_eq!(ctl.statements()[0].params_cleared(), 1);
    }

    #[test]
    fn mismatched_result_set_shape_bypasses_the_cache() {
        let (mut physical, ctl) = mock::connection();
        let mut cache = StatementCache::new(4);

        prepare(&mut cache, physical.as_mut(), "SELECT 1");

        let prepared = cache
            .prepare(
                physical.as_mut(),
                "SELECT 1",
                ResultSetType::ScrollInsensitive,
                ResultSetConcurrency::default(),
            )
            .unwrap();

        assert!(matches!(prepared, Prepared::OneShot(_)));
        assert_eq!(cache.len(), 1);
        assert_eq!(ctl.statements().len(), 2);
    }

    #[test]
    fn eviction_only_ever_removes_closed_entries() {
        let (mut physical, ctl) = mock::connection();
        let mut cache = StatementCache::new(2);

        prepare(&mut cache, physical.as_mut(), "A");
        cache.statement_closed("A");
        prepare(&mut cache, physical.as_mut(), "B");

        // Closing B at capacity triggers eviction of A, the first closed
        // entry in insertion order; B itself stays cached.
        cache.statement_closed("B");

        assert!(!cache.contains("A"));
        assert!(cache.contains("B"));
        assert!(ctl.statements()[0].is_closed());
        assert!(!ctl.statements()[1].is_closed());

        // A third statement while B is open again: only B is evictable.
        prepare(&mut cache, physical.as_mut(), "B");
        prepare(&mut cache, physical.as_mut(), "C");
        cache.statement_closed("C");

        assert!(cache.contains("B"));
        assert!(!cache.contains("C"));
    }

    #[test]
    fn dirty_statements_are_reset_on_reuse() {
        let (mut physical, ctl) = mock::connection();
        let mut cache = StatementCache::new(4);

        prepare(&mut cache, physical.as_mut(), "SELECT 1");
        cache
            .with_statement("SELECT 1", |entry| {
                entry.mark_dirty();
                entry.stmt_mut().set_max_rows(50).unwrap();
                entry.stmt_mut().set_fetch_size(16).unwrap();
            })
            .unwrap();
        cache.statement_closed("SELECT 1");

        prepare(&mut cache, physical.as_mut(), "SELECT 1");

        let stmt = &ctl.statements()[0];
        assert_eq!(stmt.max_rows(), 0);
        assert_eq!(stmt.fetch_size(), 0);
        assert!(!cache.with_statement("SELECT 1", |e| e.is_dirty()).unwrap());
    }

    #[test]
    fn clean_statements_keep_their_properties() {
        let (mut physical, ctl) = mock::connection();
        let mut cache = StatementCache::new(4);

        prepare(&mut cache, physical.as_mut(), "SELECT 1");
        cache.statement_closed("SELECT 1");
        prepare(&mut cache, physical.as_mut(), "SELECT 1");

        // Never dirtied, so reuse did not touch the mutators.
        assert_eq!(ctl.statements()[0].batch_cleared(), 0);
    }
}
