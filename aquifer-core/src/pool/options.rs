use std::fmt::{self, Debug, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::driver::Driver;
use crate::error::Error;
use crate::isolation::TransactionIsolation;
use crate::pool::Pool;
use crate::tx::TransactionManager;

/// Sentinel capacity meaning "unbounded". Negative values passed through
/// configuration mean the same thing.
pub const POOL_MAX_UNBOUNDED: u32 = 99_999;

/// Depth of validation applied to a free connection before it is handed out.
///
/// A connection that fails validation is destroyed and the acquire loop
/// starts over — with a *fresh* waiting budget, so validation I/O is never
/// charged to the caller. Operators should note the flip side: a pool that
/// keeps producing dead connections extends the effective wait beyond
/// `waiter_timeout`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckLevel {
    /// No validation.
    #[default]
    Off,
    /// Verify the driver does not report the connection closed.
    ClosedCheck,
    /// Additionally execute the configured test statement.
    TestStatement,
}

impl CheckLevel {
    pub fn level(self) -> u8 {
        match self {
            CheckLevel::Off => 0,
            CheckLevel::ClosedCheck => 1,
            CheckLevel::TestStatement => 2,
        }
    }

    pub fn from_level(level: u8) -> crate::Result<Self> {
        match level {
            0 => Ok(CheckLevel::Off),
            1 => Ok(CheckLevel::ClosedCheck),
            2 => Ok(CheckLevel::TestStatement),
            _ => Err(Error::Configuration(format!(
                "connection check level must be 0, 1, or 2, got {level}"
            ))),
        }
    }
}

/// Configuration options for [`Pool`].
///
/// Built in the consuming style and finished with [`open`][Self::open]:
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use aquifer_core::mock::MockDriver;
/// use aquifer_core::pool::PoolOptions;
///
/// # fn main() -> aquifer_core::Result<()> {
/// let pool = PoolOptions::new()
///     .pool_max(8)
///     .waiter_timeout(std::time::Duration::from_secs(5))
///     .open(Arc::new(MockDriver::new()), "aquifer://db.internal/orders")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PoolOptions {
    pub(crate) name: Option<String>,
    pub(crate) pool_min: u32,
    pub(crate) pool_max: u32,
    pub(crate) max_age: Duration,
    pub(crate) max_open_time: Duration,
    pub(crate) waiter_timeout: Duration,
    pub(crate) max_waiters: u32,
    pub(crate) check_level: CheckLevel,
    pub(crate) test_statement: Option<String>,
    pub(crate) pstmt_max: usize,
    pub(crate) sampling_period: Duration,
    pub(crate) isolation: TransactionIsolation,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) transaction_manager: Option<Arc<dyn TransactionManager>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for PoolOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("name", &self.name)
            .field("pool_min", &self.pool_min)
            .field("pool_max", &self.pool_max)
            .field("max_age", &self.max_age)
            .field("max_open_time", &self.max_open_time)
            .field("waiter_timeout", &self.waiter_timeout)
            .field("max_waiters", &self.max_waiters)
            .field("check_level", &self.check_level)
            .field("test_statement", &self.test_statement)
            .field("pstmt_max", &self.pstmt_max)
            .field("sampling_period", &self.sampling_period)
            .field("isolation", &self.isolation)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl PoolOptions {
    /// Returns the default configuration. See the source of this method for
    /// the current default values.
    pub fn new() -> Self {
        PoolOptions {
            name: None,
            pool_min: 0,
            // Effectively unbounded; production deployments will want a cap.
            pool_max: POOL_MAX_UNBOUNDED,
            max_age: Duration::from_secs(24 * 60 * 60),
            max_open_time: Duration::from_secs(24 * 60 * 60),
            waiter_timeout: Duration::from_secs(10),
            max_waiters: 1000,
            check_level: CheckLevel::Off,
            test_statement: None,
            pstmt_max: 12,
            sampling_period: Duration::from_secs(60),
            isolation: TransactionIsolation::Default,
            username: None,
            password: None,
            transaction_manager: None,
        }
    }

    /// Name under which the pool is exported and registered.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Minimum number of connections kept warm, even when idle and aged.
    pub fn pool_min(mut self, min: u32) -> Self {
        self.pool_min = min;
        self
    }

    /// Hard cap on connections, busy or idle. Negative means unbounded.
    pub fn pool_max(mut self, max: i64) -> Self {
        self.pool_max = if max < 0 {
            POOL_MAX_UNBOUNDED
        } else {
            max.min(i64::from(POOL_MAX_UNBOUNDED)) as u32
        };
        self
    }

    /// Age after which an idle connection becomes eligible for eviction.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// How long a connection may be held outside a transaction before it is
    /// declared leaked and reclaimed.
    pub fn max_open_time(mut self, max_open_time: Duration) -> Self {
        self.max_open_time = max_open_time;
        self
    }

    /// Wall-clock budget an acquire may spend parked waiting for a
    /// connection.
    pub fn waiter_timeout(mut self, waiter_timeout: Duration) -> Self {
        self.waiter_timeout = waiter_timeout;
        self
    }

    /// Cap on concurrently parked callers; beyond it acquires fail fast.
    pub fn max_waiters(mut self, max_waiters: u32) -> Self {
        self.max_waiters = max_waiters;
        self
    }

    /// Validation depth for connections taken from the free set.
    pub fn check_level(mut self, check_level: CheckLevel) -> Self {
        self.check_level = check_level;
        self
    }

    /// Probe SQL for [`CheckLevel::TestStatement`] and
    /// [`Pool::check_connection`].
    pub fn test_statement(mut self, sql: impl Into<String>) -> Self {
        self.test_statement = Some(sql.into());
        self
    }

    /// Per-connection prepared-statement cache capacity; 0 disables caching.
    pub fn pstmt_max(mut self, pstmt_max: usize) -> Self {
        self.pstmt_max = pstmt_max;
        self
    }

    /// Cadence at which counters are rolled into their "recent" snapshots.
    pub fn sampling_period(mut self, sampling_period: Duration) -> Self {
        self.sampling_period = sampling_period;
        self
    }

    /// Isolation level applied to newly opened physical connections.
    pub fn transaction_isolation(mut self, isolation: TransactionIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Credentials passed to the driver when opening physical connections.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Transaction manager consulted for the ambient transaction on
    /// [`Pool::get_connection`].
    pub fn transaction_manager(mut self, tm: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(tm);
        self
    }

    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn get_pool_min(&self) -> u32 {
        self.pool_min
    }

    pub fn get_pool_max(&self) -> u32 {
        self.pool_max
    }

    pub fn get_max_age(&self) -> Duration {
        self.max_age
    }

    pub fn get_max_open_time(&self) -> Duration {
        self.max_open_time
    }

    pub fn get_waiter_timeout(&self) -> Duration {
        self.waiter_timeout
    }

    pub fn get_max_waiters(&self) -> u32 {
        self.max_waiters
    }

    pub fn get_check_level(&self) -> CheckLevel {
        self.check_level
    }

    pub fn get_test_statement(&self) -> Option<&str> {
        self.test_statement.as_deref()
    }

    pub fn get_pstmt_max(&self) -> usize {
        self.pstmt_max
    }

    pub fn get_sampling_period(&self) -> Duration {
        self.sampling_period
    }

    pub fn get_transaction_isolation(&self) -> TransactionIsolation {
        self.isolation
    }

    /// Apply one configuration key/value pair, using the same key names and
    /// units as exported references (`maxconpool`, `connmaxage` in minutes,
    /// `maxwaittime` in seconds, ...).
    pub fn apply(self, key: &str, value: &str) -> crate::Result<Self> {
        use crate::reference::keys;

        fn parse<T: FromStr>(key: &str, value: &str) -> crate::Result<T> {
            value.parse().map_err(|_| {
                Error::Configuration(format!("invalid value {value:?} for option {key:?}"))
            })
        }

        Ok(match key {
            keys::NAME => self.name(value),
            keys::USERNAME => {
                let password = self.password.clone().unwrap_or_default();
                self.credentials(value, password)
            }
            keys::PASSWORD => {
                let mut options = self;
                options.password = Some(value.to_owned());
                options
            }
            keys::ISOLATION => self.transaction_isolation(value.parse()?),
            keys::CHECK_LEVEL => self.check_level(CheckLevel::from_level(parse(key, value)?)?),
            keys::MAX_AGE_MINUTES => {
                self.max_age(Duration::from_secs(parse::<u64>(key, value)? * 60))
            }
            keys::MAX_OPEN_TIME_MINUTES => {
                self.max_open_time(Duration::from_secs(parse::<u64>(key, value)? * 60))
            }
            keys::TEST_STATEMENT => self.test_statement(value),
            keys::PSTMT_MAX => self.pstmt_max(parse(key, value)?),
            keys::POOL_MIN => self.pool_min(parse(key, value)?),
            keys::POOL_MAX => self.pool_max(parse(key, value)?),
            keys::WAITER_TIMEOUT_SECONDS => {
                self.waiter_timeout(Duration::from_secs(parse(key, value)?))
            }
            keys::MAX_WAITERS => self.max_waiters(parse(key, value)?),
            keys::SAMPLING_PERIOD_SECONDS => {
                self.sampling_period(Duration::from_secs(parse(key, value)?))
            }
            _ => {
                return Err(Error::Configuration(format!(
                    "unknown pool option {key:?}"
                )))
            }
        })
    }

    /// Parse options out of the query string of a connection URL. Unknown
    /// keys are rejected; the URL itself (scheme, host, path) is left to the
    /// driver.
    pub fn parse_params(mut self, url: &str) -> crate::Result<Self> {
        let url = Url::parse(url)?;

        for (key, value) in url.query_pairs() {
            self = self.apply(&key, &value)?;
        }

        Ok(self)
    }

    /// Validate the configuration and open a pool against `driver`.
    pub fn open(self, driver: Arc<dyn Driver>, url: &str) -> crate::Result<Pool> {
        Url::parse(url)?;

        if self.pool_min > self.pool_max {
            return Err(Error::Configuration(format!(
                "pool_min ({}) exceeds pool_max ({})",
                self.pool_min, self.pool_max
            )));
        }

        if self.check_level == CheckLevel::TestStatement && self.test_statement.is_none() {
            return Err(Error::Configuration(
                "check level 2 requires a test statement".into(),
            ));
        }

        Pool::new_with(driver, url, self)
    }
}
