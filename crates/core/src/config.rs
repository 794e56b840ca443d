use std::{env, str::FromStr, time::Duration};

use crate::{
    error::{PipelineError, Result},
    types::Difficulty,
};

/// Requests a provider accepts per window before it starts refusing us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderQuota {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub max_concurrent_downloads: usize,
    pub max_concurrent_metadata: usize,
    pub min_request_interval: Duration,
    pub respect_rate_limits: bool,
    pub provider_quota: Option<ProviderQuota>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 2,
            max_concurrent_metadata: 2,
            min_request_interval: Duration::from_secs(1),
            respect_rate_limits: true,
            provider_quota: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub min_module_duration: Duration,
    pub max_modules: usize,
    /// Upper bound on transcript characters sent to the provider in one boundary request.
    pub window_chars: usize,
    /// Window length used when the provider's boundary proposal is unusable.
    pub fallback_chunk: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_module_duration: Duration::from_secs(60),
            max_modules: 10,
            window_chars: 12_000,
            fallback_chunk: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuizConfig {
    pub questions_per_module: usize,
    pub default_difficulty: Difficulty,
    /// Modules of one job whose quizzes may be generated concurrently.
    pub fan_out: usize,
}

impl Default for QuizConfig {
    fn default() -> Self {
        Self {
            questions_per_module: 5,
            default_difficulty: Difficulty::Medium,
            fan_out: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2,
        }
    }

    /// No delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based): base * multiplier^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .saturating_pow(attempt.saturating_sub(1))
            .max(1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub source: RetryPolicy,
    pub transcription: RetryPolicy,
    pub provider: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            source: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(10)),
            transcription: RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(10)),
            provider: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub fetch: Duration,
    pub transcribe: Duration,
    pub generate: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(120),
            transcribe: Duration::from_secs(1800),
            generate: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub base_interval: chrono::Duration,
    pub growth_factor: f64,
    pub max_interval: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: chrono::Duration::days(1),
            growth_factor: 2.0,
            max_interval: chrono::Duration::days(180),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub gate: GateConfig,
    pub segmenter: SegmenterConfig,
    pub quiz: QuizConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub scheduler: SchedulerConfig,
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            segmenter: SegmenterConfig::default(),
            quiz: QuizConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            scheduler: SchedulerConfig::default(),
            workers: 2,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `LESSONFORGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        let var = |name: &str| lookup(&format!("LESSONFORGE_{name}"));

        if let Some(v) = var("MAX_CONCURRENT_DOWNLOADS") {
            cfg.gate.max_concurrent_downloads = parse("MAX_CONCURRENT_DOWNLOADS", &v)?;
        }
        if let Some(v) = var("MAX_CONCURRENT_METADATA") {
            cfg.gate.max_concurrent_metadata = parse("MAX_CONCURRENT_METADATA", &v)?;
        }
        if let Some(v) = var("MIN_REQUEST_INTERVAL_MS") {
            cfg.gate.min_request_interval = millis("MIN_REQUEST_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("RESPECT_RATE_LIMITS") {
            cfg.gate.respect_rate_limits = parse("RESPECT_RATE_LIMITS", &v)?;
        }
        if let Some(v) = var("PROVIDER_QUOTA") {
            cfg.gate.provider_quota = Some(parse_quota(&v)?);
        }
        if let Some(v) = var("MIN_MODULE_DURATION_MS") {
            cfg.segmenter.min_module_duration = millis("MIN_MODULE_DURATION_MS", &v)?;
        }
        if let Some(v) = var("MAX_MODULES") {
            cfg.segmenter.max_modules = parse("MAX_MODULES", &v)?;
        }
        if let Some(v) = var("WINDOW_CHARS") {
            cfg.segmenter.window_chars = parse("WINDOW_CHARS", &v)?;
        }
        if let Some(v) = var("QUESTIONS_PER_MODULE") {
            cfg.quiz.questions_per_module = parse("QUESTIONS_PER_MODULE", &v)?;
        }
        if let Some(v) = var("DIFFICULTY") {
            cfg.quiz.default_difficulty = v.parse()?;
        }
        if let Some(v) = var("QUIZ_FAN_OUT") {
            cfg.quiz.fan_out = parse("QUIZ_FAN_OUT", &v)?;
        }
        if let Some(v) = var("SOURCE_MAX_ATTEMPTS") {
            cfg.retry.source.max_attempts = parse("SOURCE_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("PROVIDER_MAX_ATTEMPTS") {
            cfg.retry.provider.max_attempts = parse("PROVIDER_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("RETRY_BASE_DELAY_MS") {
            let base = millis("RETRY_BASE_DELAY_MS", &v)?;
            cfg.retry.source.base_delay = base;
            cfg.retry.provider.base_delay = base;
            cfg.retry.transcription.base_delay = base;
        }
        if let Some(v) = var("GENERATE_TIMEOUT_SECS") {
            cfg.timeouts.generate = Duration::from_secs(parse("GENERATE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("TRANSCRIBE_TIMEOUT_SECS") {
            cfg.timeouts.transcribe = Duration::from_secs(parse("TRANSCRIBE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("BASE_INTERVAL_HOURS") {
            cfg.scheduler.base_interval = chrono::Duration::hours(parse("BASE_INTERVAL_HOURS", &v)?);
        }
        if let Some(v) = var("GROWTH_FACTOR") {
            cfg.scheduler.growth_factor = parse("GROWTH_FACTOR", &v)?;
        }
        if let Some(v) = var("WORKERS") {
            cfg.workers = parse("WORKERS", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 8] = [
            (self.gate.max_concurrent_downloads > 0, "max_concurrent_downloads must be > 0"),
            (self.gate.max_concurrent_metadata > 0, "max_concurrent_metadata must be > 0"),
            (self.segmenter.max_modules > 0, "max_modules must be > 0"),
            (self.segmenter.window_chars > 0, "window_chars must be > 0"),
            (self.quiz.questions_per_module > 0, "questions_per_module must be > 0"),
            (self.quiz.fan_out > 0, "quiz fan_out must be > 0"),
            (self.scheduler.growth_factor >= 1.0, "growth_factor must be >= 1"),
            (self.workers > 0, "workers must be > 0"),
        ];
        for (ok, message) in checks {
            if !ok {
                return Err(PipelineError::Config(message.to_string()));
            }
        }
        if self.segmenter.fallback_chunk.is_zero() {
            return Err(PipelineError::Config("fallback_chunk must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PipelineError::Config(format!("LESSONFORGE_{name}: invalid value '{value}'")))
}

fn millis(name: &str, value: &str) -> Result<Duration> {
    parse::<u64>(name, value).map(Duration::from_millis)
}

/// `"<requests>/<seconds>"`, e.g. `"100/60"`.
fn parse_quota(value: &str) -> Result<ProviderQuota> {
    let (requests, secs) = value.split_once('/').ok_or_else(|| {
        PipelineError::Config(format!(
            "LESSONFORGE_PROVIDER_QUOTA: expected <requests>/<seconds>, got '{value}'"
        ))
    })?;
    Ok(ProviderQuota {
        max_requests: parse("PROVIDER_QUOTA", requests)?,
        window: Duration::from_secs(parse("PROVIDER_QUOTA", secs)?),
    })
}
