use std::time::Duration;

/// Connection settings for [`NovelAiClient`](crate::NovelAiClient).
///
/// Use [`ClientConfig::builder()`] for ergonomic construction, or
/// [`ClientConfig::default()`] for the public NovelAI endpoints.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Account API base (subscription, upscale).
    pub api_endpoint: String,

    /// Image API base (generation, vibe encoding).
    pub image_endpoint: String,

    /// Timeout for ordinary request/response calls.
    pub request_timeout: Duration,

    /// Timeout for a whole streaming generation, including the body.
    pub stream_timeout: Duration,

    /// Sent as the `User-Agent` header.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "https://api.novelai.net".to_string(),
            image_endpoint: "https://image.novelai.net".to_string(),
            request_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(300),
            user_agent: concat!("novelai-rs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn with_api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.api_endpoint = endpoint.into();
        self
    }

    pub fn with_image_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.image_endpoint = endpoint.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    /// Build the final [`ClientConfig`].
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Run policy for the [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Consecutive failed attempts before the run is aborted (minimum 1).
    pub failure_tolerance: u32,

    /// Pause between attempts (0 = none). The endpoint is rate limited.
    pub cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_tolerance: 1,
            cooldown: Duration::from_secs(0),
        }
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Values below 1 are treated as 1.
    pub fn with_failure_tolerance(mut self, tolerance: u32) -> Self {
        self.config.failure_tolerance = tolerance.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}
