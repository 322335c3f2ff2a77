use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use guardian_common::retry::RetryPolicy;

use crate::pipeline::PipelineSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(from = "CHANNEL_ID")]
    pub channel_id: NonEmptyString,

    #[envconfig(from = "API_BASE_URL", default = "https://www.googleapis.com/youtube/v3")]
    pub api_base_url: String,

    /// A static bearer token. When set, the token cache is not consulted.
    #[envconfig(from = "ACCESS_TOKEN")]
    pub access_token: Option<NonEmptyString>,

    #[envconfig(from = "CLIENT_SECRETS_FILE", default = "configs/credentials.json")]
    pub client_secrets_file: String,

    #[envconfig(from = "TOKEN_FILE", default = "configs/token.json")]
    pub token_file: String,

    #[envconfig(from = "BANNED_PHRASES_FILE", default = "configs/banned_words.txt")]
    pub banned_phrases_file: String,

    #[envconfig(from = "CHECKPOINT_PATH", default = "configs/state.json")]
    pub checkpoint_path: String,

    #[envconfig(from = "POLL_INTERVAL", default = "300000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "RECENT_LIMIT", default = "50")]
    pub recent_limit: usize,

    #[envconfig(from = "PAGE_SIZE", default = "100")]
    pub page_size: u32,

    #[envconfig(from = "QUEUE_CAPACITY", default = "150")]
    pub queue_capacity: usize,

    #[envconfig(from = "FLUSH_THRESHOLD", default = "50")]
    pub flush_threshold: usize,

    #[envconfig(from = "MAX_MODERATION_CHUNK", default = "50")]
    pub max_moderation_chunk: usize,

    #[envconfig(from = "MODERATION_STATUS", default = "heldForReview")]
    pub moderation_status: NonEmptyString,

    #[envconfig(from = "REQUEST_TIMEOUT", default = "10000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "DRAIN_TIMEOUT", default = "5000")]
    pub drain_timeout: EnvMsDuration,

    #[envconfig(from = "CHECKPOINT_SAVE_ATTEMPTS", default = "3")]
    pub checkpoint_save_attempts: u32,

    #[envconfig(from = "LIVENESS_DEADLINE", default = "600000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(from = "LOG_JSON", default = "false")]
    pub log_json: bool,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            queue_capacity: self.queue_capacity,
            page_size: self.page_size,
            recent_limit: self.recent_limit,
            poll_interval: self.poll_interval.0,
            drain_timeout: self.drain_timeout.0,
            flush_threshold: self.flush_threshold,
            max_moderation_chunk: self.max_moderation_chunk,
            moderation_status: self.moderation_status.as_str().to_owned(),
            checkpoint_save_attempts: self.checkpoint_save_attempts,
            liveness_deadline: self.liveness_deadline.0,
            retry_policy: self.retry_policy.provide(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,

    #[envconfig(from = "BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "INITIAL_INTERVAL", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "MAXIMUM_INTERVAL", default = "60000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
