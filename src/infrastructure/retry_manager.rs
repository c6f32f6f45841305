//! 재시도 관리자
//!
//! 에러 분류와 지수 백오프 스케줄을 제공합니다. 지연 시간은 시도마다
//! 같거나 늘어나기만 하며 절대 줄어들지 않습니다.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::domain::errors::{ItemError, ItemErrorKind};
use crate::infrastructure::config::BatchConfig;

/// 실패 분류기 트레이트
pub trait FailureClassifier: Send + Sync {
    fn classify_error(&self, error: &str) -> ErrorClassification;
}

/// 에러 분류
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClassification {
    Recoverable {
        category: RecoverableErrorCategory,
    },
    NonRecoverable {
        reason: String,
        category: NonRecoverableErrorCategory,
    },
    RateLimited {
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverableErrorCategory {
    TemporaryServerError, // 5xx 응답
    Timeout,
    ConnectionLost,
    ResourceBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonRecoverableErrorCategory {
    AuthenticationError, // 401, 403
    NotFound,            // 404
    ValidationError,     // 400, 422, schema
    Unknown,
}

impl ErrorClassification {
    pub fn kind(&self) -> ItemErrorKind {
        match self {
            Self::Recoverable { .. } => ItemErrorKind::Transient,
            Self::NonRecoverable { .. } => ItemErrorKind::Permanent,
            Self::RateLimited { .. } => ItemErrorKind::RateLimited,
        }
    }

    pub fn into_item_error(self, message: impl Into<String>) -> ItemError {
        match self {
            Self::RateLimited { retry_after } => ItemError::rate_limited(
                message,
                retry_after.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            ),
            other => ItemError::new(other.kind(), message),
        }
    }
}

static STATUS_CODE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b([45]\d\d)\b").ok());
static RETRY_AFTER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"retry[- _]after[:= ]+(\d+)\s*(ms|s)?").ok());

/// 표준 실패 분류기 구현
///
/// Works on free-form error text, for transforms that only carry a message.
/// Unknown errors are treated as permanent so they are never retried blindly.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardFailureClassifier;

impl StandardFailureClassifier {
    pub fn new() -> Self {
        Self
    }

    fn retry_after(error: &str) -> Option<Duration> {
        let captures = RETRY_AFTER.as_ref()?.captures(error)?;
        let amount: u64 = captures.get(1)?.as_str().parse().ok()?;
        Some(match captures.get(2).map(|m| m.as_str()) {
            Some("ms") => Duration::from_millis(amount),
            _ => Duration::from_secs(amount),
        })
    }

    fn status_code(error: &str) -> Option<u16> {
        STATUS_CODE
            .as_ref()?
            .captures(error)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
    }
}

impl FailureClassifier for StandardFailureClassifier {
    fn classify_error(&self, error: &str) -> ErrorClassification {
        let error_lower = error.to_lowercase();
        let status = Self::status_code(&error_lower);

        // HTTP 상태 코드 기반 분류
        if status == Some(429) || error_lower.contains("rate limit") || error_lower.contains("throttl") {
            return ErrorClassification::RateLimited {
                retry_after: Self::retry_after(&error_lower),
            };
        }

        match status {
            Some(401 | 403) => {
                return ErrorClassification::NonRecoverable {
                    reason: "Authentication or authorization error".to_string(),
                    category: NonRecoverableErrorCategory::AuthenticationError,
                };
            }
            Some(404) => {
                return ErrorClassification::NonRecoverable {
                    reason: "Resource not found".to_string(),
                    category: NonRecoverableErrorCategory::NotFound,
                };
            }
            Some(400 | 422) => {
                return ErrorClassification::NonRecoverable {
                    reason: "Payload rejected".to_string(),
                    category: NonRecoverableErrorCategory::ValidationError,
                };
            }
            Some(500..=599) => {
                return ErrorClassification::Recoverable {
                    category: RecoverableErrorCategory::TemporaryServerError,
                };
            }
            _ => {}
        }

        // 네트워크 에러 분류
        if error_lower.contains("timeout") || error_lower.contains("timed out") {
            return ErrorClassification::Recoverable {
                category: RecoverableErrorCategory::Timeout,
            };
        }
        if error_lower.contains("connection refused")
            || error_lower.contains("connection reset")
            || error_lower.contains("unavailable")
        {
            return ErrorClassification::Recoverable {
                category: RecoverableErrorCategory::ConnectionLost,
            };
        }
        if error_lower.contains("busy") || error_lower.contains("locked") {
            return ErrorClassification::Recoverable {
                category: RecoverableErrorCategory::ResourceBusy,
            };
        }

        // 검증 에러
        if error_lower.contains("invalid")
            || error_lower.contains("missing")
            || error_lower.contains("validation")
            || error_lower.contains("schema")
        {
            return ErrorClassification::NonRecoverable {
                reason: "Validation failure".to_string(),
                category: NonRecoverableErrorCategory::ValidationError,
            };
        }

        ErrorClassification::NonRecoverable {
            reason: "Unclassified error".to_string(),
            category: NonRecoverableErrorCategory::Unknown,
        }
    }
}

/// Retry budget and backoff shape shared by every item of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Never below 1.0
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            max_retries: config.retry_attempts,
            base_delay: config.retry_delay(),
            multiplier: config.retry_backoff_multiplier.max(1.0),
            max_delay: config.max_retry_delay().max(config.retry_delay()),
            jitter: config.retry_jitter,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// `attempts_made` counts the attempt that just failed
    pub fn should_retry(&self, error: &ItemError, attempts_made: u32) -> bool {
        error.kind.is_retryable() && attempts_made <= self.max_retries
    }

    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule {
            policy: self.clone(),
            retries: 0,
            last_delay: Duration::ZERO,
        }
    }
}

/// Stateful, non-decreasing sequence of retry delays
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    policy: RetryPolicy,
    retries: u32,
    last_delay: Duration,
}

impl BackoffSchedule {
    /// Delay before the next retry; a remote `retry_after` hint is honoured
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        let policy = &self.policy;
        let exponent = i32::try_from(self.retries).unwrap_or(i32::MAX);
        let scaled = policy.base_delay.as_secs_f64() * policy.multiplier.powi(exponent);
        let capped = scaled.min(policy.max_delay.as_secs_f64());

        let jittered = if policy.jitter && capped > 0.0 {
            (capped + capped * 0.1 * fastrand::f64()).min(policy.max_delay.as_secs_f64())
        } else {
            capped
        };

        let mut delay = Duration::from_secs_f64(jittered.max(0.0));
        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }
        delay = delay.max(self.last_delay);

        self.retries = self.retries.saturating_add(1);
        self.last_delay = delay;
        debug!("Backoff #{} -> {:?}", self.retries, delay);
        delay
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}
