//! Startup reporting.

use crate::config::{mask_token, ProxyConfig};

/// Log the effective configuration once, tokens masked.
pub fn log_summary(config: &ProxyConfig) {
    let cb = &config.failover.circuit_breaker;
    tracing::info!(
        bind_address = %config.bind_address(),
        backends = config.backends.len(),
        enabled_backends = config.enabled_backends(),
        max_attempts = ?config.retry.max_attempts,
        timeout_secs = config.retry.timeout_seconds,
        connect_timeout_secs = config.retry.connect_timeout_seconds,
        failure_threshold = cb.failure_threshold,
        open_timeout_secs = cb.open_timeout_seconds,
        half_open_requests = cb.half_open_requests,
        cooldown_secs = config.failover.rate_limit.cooldown_seconds,
        admin_auth = config.admin.api_key.is_some(),
        "Configuration loaded"
    );

    for (priority, backend) in config.backends.iter().enumerate() {
        tracing::info!(
            priority = priority + 1,
            backend = %backend.name,
            base_url = %backend.base_url,
            platform = %backend.platform,
            model = backend.model.as_deref().unwrap_or("-"),
            enabled = backend.enabled,
            token = %mask_token(&backend.token),
            "Backend configured"
        );
    }
}
