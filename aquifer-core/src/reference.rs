//! Name-addressed export of pool configuration.
//!
//! A [`PoolReference`] is the string-pair form of a pool's configuration,
//! suitable for binding into a directory service. The lookup side goes
//! through a [`PoolRegistry`]: an explicit handle (no process-wide state)
//! that is consulted for an existing pool by name before a new one is ever
//! constructed from the reference.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::Driver;
use crate::error::Error;
use crate::pool::{Pool, PoolOptions};

/// Keys carried by a pool reference.
pub mod keys {
    pub const NAME: &str = "datasource.name";
    pub const URL: &str = "datasource.url";
    pub const CLASSNAME: &str = "datasource.classname";
    pub const USERNAME: &str = "datasource.username";
    pub const PASSWORD: &str = "datasource.password";
    pub const ISOLATION: &str = "datasource.isolationlevel";
    pub const CHECK_LEVEL: &str = "connchecklevel";
    /// Minutes.
    pub const MAX_AGE_MINUTES: &str = "connmaxage";
    /// Minutes.
    pub const MAX_OPEN_TIME_MINUTES: &str = "maxopentime";
    pub const TEST_STATEMENT: &str = "connteststmt";
    pub const PSTMT_MAX: &str = "pstmtmax";
    pub const POOL_MIN: &str = "minconpool";
    pub const POOL_MAX: &str = "maxconpool";
    /// Seconds.
    pub const WAITER_TIMEOUT_SECONDS: &str = "maxwaittime";
    pub const MAX_WAITERS: &str = "maxwaiters";
    /// Seconds.
    pub const SAMPLING_PERIOD_SECONDS: &str = "samplingperiod";
}

/// A string-addressed description of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReference {
    pairs: Vec<(String, String)>,
}

impl PoolReference {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        PoolReference { pairs }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.get(keys::NAME)
    }

    pub fn url(&self) -> Option<&str> {
        self.get(keys::URL)
    }

    /// Serialize `pool`'s configuration. Fails when the pool has no name to
    /// bind under.
    pub fn export(pool: &Pool) -> crate::Result<Self> {
        let name = pool
            .name()
            .ok_or_else(|| Error::Configuration("pool has no name to export under".into()))?;
        let options = pool.options();

        let mut pairs = vec![
            (keys::NAME.to_owned(), name.to_owned()),
            (keys::URL.to_owned(), pool.url().to_owned()),
            (
                keys::CLASSNAME.to_owned(),
                pool.inner().driver().name().to_owned(),
            ),
            (
                keys::USERNAME.to_owned(),
                options.username.clone().unwrap_or_default(),
            ),
            (
                keys::PASSWORD.to_owned(),
                options.password.clone().unwrap_or_default(),
            ),
            (
                keys::ISOLATION.to_owned(),
                options.isolation.as_str().to_owned(),
            ),
            (
                keys::CHECK_LEVEL.to_owned(),
                options.check_level.level().to_string(),
            ),
            (
                keys::MAX_AGE_MINUTES.to_owned(),
                (options.max_age.as_secs() / 60).to_string(),
            ),
            (
                keys::MAX_OPEN_TIME_MINUTES.to_owned(),
                (options.max_open_time.as_secs() / 60).to_string(),
            ),
            (
                keys::PSTMT_MAX.to_owned(),
                options.pstmt_max.to_string(),
            ),
            // Floor and cap reflect any runtime reconfiguration.
            (
                keys::POOL_MIN.to_owned(),
                pool.inner().pool_min().to_string(),
            ),
            (
                keys::POOL_MAX.to_owned(),
                pool.inner().pool_max().to_string(),
            ),
            (
                keys::WAITER_TIMEOUT_SECONDS.to_owned(),
                options.waiter_timeout.as_secs().to_string(),
            ),
            (
                keys::MAX_WAITERS.to_owned(),
                options.max_waiters.to_string(),
            ),
            (
                keys::SAMPLING_PERIOD_SECONDS.to_owned(),
                options.sampling_period.as_secs().to_string(),
            ),
        ];

        if let Some(sql) = &options.test_statement {
            pairs.push((keys::TEST_STATEMENT.to_owned(), sql.clone()));
        }

        Ok(PoolReference { pairs })
    }

    /// Rebuild pool options from this reference. The `datasource.*` identity
    /// keys are folded in; `datasource.classname` is informational and left
    /// to the caller, who supplies the driver.
    pub fn options(&self) -> crate::Result<PoolOptions> {
        let mut options = PoolOptions::new();

        for (key, value) in &self.pairs {
            match key.as_str() {
                keys::URL | keys::CLASSNAME => {}
                keys::USERNAME | keys::PASSWORD if value.is_empty() => {}
                _ => options = options.apply(key, value)?,
            }
        }

        Ok(options)
    }
}

/// Directory collaborator: publishes references under string names.
pub trait NameDirectory: Send + Sync {
    fn bind(&self, name: &str, reference: &PoolReference) -> crate::Result<()>;

    fn unbind(&self, name: &str) -> crate::Result<()>;
}

/// In-process registry of live pools.
///
/// Pass a registry handle wherever references are resolved; the factory
/// consults it for an existing pool by name and only constructs a new pool
/// when the name is absent.
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, Pool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<Pool> {
        self.pools.lock().get(name).cloned()
    }

    pub fn bind(&self, name: impl Into<String>, pool: Pool) {
        self.pools.lock().insert(name.into(), pool);
    }

    pub fn unbind(&self, name: &str) -> Option<Pool> {
        self.pools.lock().remove(name)
    }

    /// Registry-first factory: an existing pool under the reference's name
    /// wins; otherwise a pool is constructed from the reference, registered,
    /// and returned.
    pub fn resolve(
        &self,
        driver: Arc<dyn Driver>,
        reference: &PoolReference,
    ) -> crate::Result<Pool> {
        let name = reference.name().ok_or_else(|| {
            Error::Configuration("reference is missing datasource.name".into())
        })?;

        if let Some(pool) = self.lookup(name) {
            return Ok(pool);
        }

        let url = reference.url().ok_or_else(|| {
            Error::Configuration("reference is missing datasource.url".into())
        })?;

        let pool = reference.options()?.open(driver, url)?;
        self.bind(name, pool.clone());

        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::{keys, PoolRegistry};
    use crate::mock::MockDriver;
    use crate::pool::{CheckLevel, PoolOptions};
    use std::sync::Arc;
    use std::time::Duration;

    fn sample_pool(driver: Arc<MockDriver>) -> crate::Pool {
        PoolOptions::new()
            .name("orders")
            .pool_min(1)
            .pool_max(4)
            .max_age(Duration::from_secs(30 * 60))
            .max_open_time(Duration::from_secs(10 * 60))
            .waiter_timeout(Duration::from_secs(3))
            .max_waiters(16)
            .check_level(CheckLevel::TestStatement)
            .test_statement("SELECT 1")
            .pstmt_max(6)
            .sampling_period(Duration::from_secs(15))
            .credentials("svc", "secret")
            .open(driver, "aquifer://db.internal/orders")
            .unwrap()
    }

    #[test]
    fn export_then_rebuild_preserves_configuration() {
        let pool = sample_pool(Arc::new(MockDriver::new()));
        let reference = pool.reference().unwrap();

        assert_eq!(reference.get(keys::NAME), Some("orders"));
        assert_eq!(reference.get(keys::CLASSNAME), Some("mock"));
        assert_eq!(reference.get(keys::MAX_AGE_MINUTES), Some("30"));
        assert_eq!(reference.get(keys::MAX_OPEN_TIME_MINUTES), Some("10"));
        assert_eq!(reference.get(keys::WAITER_TIMEOUT_SECONDS), Some("3"));

        let options = reference.options().unwrap();
        assert_eq!(options.get_name(), Some("orders"));
        assert_eq!(options.get_pool_min(), 1);
        assert_eq!(options.get_pool_max(), 4);
        assert_eq!(options.get_max_age(), Duration::from_secs(30 * 60));
        assert_eq!(options.get_max_open_time(), Duration::from_secs(10 * 60));
        assert_eq!(options.get_waiter_timeout(), Duration::from_secs(3));
        assert_eq!(options.get_max_waiters(), 16);
        assert_eq!(options.get_check_level(), CheckLevel::TestStatement);
        assert_eq!(options.get_test_statement(), Some("SELECT 1"));
        assert_eq!(options.get_pstmt_max(), 6);
        assert_eq!(options.get_sampling_period(), Duration::from_secs(15));
    }

    #[test]
    fn unnamed_pools_cannot_be_exported() {
        let pool = PoolOptions::new()
            .open(Arc::new(MockDriver::new()), "aquifer://db.internal/orders")
            .unwrap();

        assert!(pool.reference().is_err());
    }

    #[test]
    fn resolve_prefers_the_registered_pool() {
        let driver = Arc::new(MockDriver::new());
        let registry = PoolRegistry::new();

        let pool = sample_pool(Arc::clone(&driver));
        let reference = pool.reference().unwrap();
        registry.bind("orders", pool.clone());

        let opened_before = driver.opened();
        let resolved = registry.resolve(driver.clone(), &reference).unwrap();

        // Same pool, no new physical connections.
        assert_eq!(resolved.size(), pool.size());
        assert_eq!(driver.opened(), opened_before);
    }

    #[test]
    fn resolve_constructs_and_registers_when_absent() {
        let driver = Arc::new(MockDriver::new());
        let registry = PoolRegistry::new();

        let reference = sample_pool(Arc::new(MockDriver::new())).reference().unwrap();

        let pool = registry.resolve(driver, &reference).unwrap();
        assert_eq!(pool.name(), Some("orders"));
        assert!(registry.lookup("orders").is_some());

        // Resolving again returns the same pool.
        let driver2 = Arc::new(MockDriver::new());
        let again = registry.resolve(driver2.clone(), &reference).unwrap();
        assert_eq!(again.name(), Some("orders"));
        assert_eq!(driver2.opened(), 0);
    }
}
