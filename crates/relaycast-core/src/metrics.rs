//! Prometheus metrics for delivery

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use relaycast_common::types::{ChannelType, FallbackReason, MessageStatus};
use relaycast_common::{Error, Result};

/// Delivery counters and latency histograms behind their own registry
#[derive(Clone)]
pub struct DeliveryMetrics {
    registry: Registry,
    attempts: IntCounterVec,
    fallbacks: IntCounterVec,
    send_duration: HistogramVec,
    processed: IntCounterVec,
}

impl DeliveryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let attempts = IntCounterVec::new(
            Opts::new(
                "relaycast_delivery_attempts_total",
                "Provider send attempts by outcome",
            ),
            &["provider", "channel", "result"],
        )
        .map_err(metrics_error)?;

        let fallbacks = IntCounterVec::new(
            Opts::new(
                "relaycast_fallbacks_total",
                "Candidates abandoned in favour of the next provider",
            ),
            &["reason"],
        )
        .map_err(metrics_error)?;

        let send_duration = HistogramVec::new(
            HistogramOpts::new(
                "relaycast_send_duration_seconds",
                "Time spent in provider send calls",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["provider"],
        )
        .map_err(metrics_error)?;

        let processed = IntCounterVec::new(
            Opts::new(
                "relaycast_messages_processed_total",
                "Messages leaving the delivery worker, by resulting status",
            ),
            &["status"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(attempts.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(fallbacks.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(send_duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(processed.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            attempts,
            fallbacks,
            send_duration,
            processed,
        })
    }

    pub fn record_attempt(&self, provider: &str, channel: ChannelType, success: bool, seconds: f64) {
        let result = if success { "success" } else { "failure" };
        self.attempts
            .with_label_values(&[provider, channel.as_str(), result])
            .inc();
        self.send_duration
            .with_label_values(&[provider])
            .observe(seconds);
    }

    pub fn record_fallback(&self, reason: FallbackReason) {
        self.fallbacks.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn record_processed(&self, status: MessageStatus) {
        self.processed.with_label_values(&[status.as_str()]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_series() {
        let metrics = DeliveryMetrics::new().unwrap();
        metrics.record_attempt("twilio", ChannelType::Sms, true, 0.2);
        metrics.record_attempt("twilio", ChannelType::Sms, false, 1.2);
        metrics.record_fallback(FallbackReason::RateLimitExceeded);
        metrics.record_processed(MessageStatus::Sent);

        let text = metrics.render().unwrap();
        assert!(text.contains(
            r#"relaycast_delivery_attempts_total{channel="sms",provider="twilio",result="success"} 1"#
        ));
        assert!(text.contains(r#"relaycast_fallbacks_total{reason="rate_limit_exceeded"} 1"#));
        assert!(text.contains(r#"relaycast_messages_processed_total{status="sent"} 1"#));
        assert!(text.contains("relaycast_send_duration_seconds_count{provider=\"twilio\"} 2"));
    }

    #[test]
    fn instances_are_independent() {
        let a = DeliveryMetrics::new().unwrap();
        let b = DeliveryMetrics::new().unwrap();
        a.record_processed(MessageStatus::Failed);
        assert!(!b.render().unwrap().contains("status=\"failed\""));
    }
}
