// batch_ingestor/src/config.rs
// Configuration knobs for the batch engine, the poller and the HTTP transport.

use std::time::Duration;

use url::Url;

use crate::error::{BatchError, Result};

/// Replica acknowledgement level requested for batch writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum ConsistencyLevel {
    One,
    Quorum,
    All,
}

impl ConsistencyLevel {
    pub fn as_str(&self,) -> &'static str {
        match self {
            ConsistencyLevel::One => "ONE",
            ConsistencyLevel::Quorum => "QUORUM",
            ConsistencyLevel::All => "ALL",
        }
    }
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = BatchError;

    fn from_str(s: &str,) -> Result<Self,> {
        match s.to_ascii_uppercase().as_str() {
            "ONE" => Ok(ConsistencyLevel::One,),
            "QUORUM" => Ok(ConsistencyLevel::Quorum,),
            "ALL" => Ok(ConsistencyLevel::All,),
            other => Err(BatchError::Configuration(format!(
                "unknown consistency level '{}'",
                other
            ),),),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq,)]
pub struct RetryPolicy {
    /// Total sends allowed per item, the first one included.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff:  Duration,
    /// Fraction in `[0, 1]` by which a delay may be shortened at random. Zero disables jitter.
    pub jitter:       f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500,),
            max_backoff:  Duration::from_secs(30,),
            jitter:       0.25,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self,) -> Result<(),> {
        if self.max_attempts == 0 {
            return Err(BatchError::Configuration("max_attempts must be at least 1".to_string(),),);
        }
        if self.base_backoff > self.max_backoff {
            return Err(BatchError::Configuration(
                "base_backoff must not exceed max_backoff".to_string(),
            ),);
        }
        if !(0.0..=1.0).contains(&self.jitter,) {
            return Err(BatchError::Configuration("jitter must be within [0, 1]".to_string(),),);
        }
        Ok((),)
    }
}

/// Configuration for a [`crate::queue::BatchQueue`].
#[derive(Debug, Clone,)]
pub struct BatchConfig {
    pub max_batch_size:    usize,
    /// Flush pending items once nothing has been added for this long. `None` disables it.
    pub idle_timeout:      Option<Duration,>,
    /// Number of batch sends allowed in flight at once.
    pub concurrency:       usize,
    pub consistency_level: Option<ConsistencyLevel,>,
    pub retry:             RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size:    crate::DEFAULT_BATCH_SIZE,
            idle_timeout:      None,
            concurrency:       crate::DEFAULT_CONCURRENCY,
            consistency_level: None,
            retry:             RetryPolicy::default(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self,) -> Result<(),> {
        if self.max_batch_size == 0 {
            return Err(BatchError::Configuration("max_batch_size must be at least 1".to_string(),),);
        }
        if self.concurrency == 0 {
            return Err(BatchError::Configuration("concurrency must be at least 1".to_string(),),);
        }
        if self.idle_timeout == Some(Duration::ZERO,) {
            return Err(BatchError::Configuration(
                "idle_timeout must be positive when set".to_string(),
            ),);
        }
        self.retry.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq,)]
pub struct PollConfig {
    pub timeout:       Duration,
    pub poll_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout:       Duration::from_secs(300,),
            poll_interval: Duration::from_millis(250,),
        }
    }
}

impl PollConfig {
    pub fn validate(&self,) -> Result<(),> {
        if self.poll_interval.is_zero() {
            return Err(BatchError::Configuration("poll_interval must be positive".to_string(),),);
        }
        Ok((),)
    }
}

/// Connection settings for [`crate::transport::HttpTransport`].
#[derive(Debug, Clone,)]
pub struct TransportConfig {
    pub base_url:        String,
    pub request_timeout: Duration,
    pub api_key:         Option<String,>,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String,>,) -> Self {
        Self {
            base_url:        base_url.into(),
            request_timeout: Duration::from_secs(60,),
            api_key:         None,
        }
    }

    pub fn parsed_url(&self,) -> Result<Url,> {
        let url = Url::parse(&self.base_url,).map_err(|e| {
            BatchError::Configuration(format!("Invalid base URL '{}': {}", self.base_url, e),)
        },)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BatchError::Configuration(format!(
                "Unsupported URL scheme '{}'",
                url.scheme()
            ),),);
        }
        Ok(url,)
    }
}
