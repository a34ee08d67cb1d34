use relaycast_common::types::FallbackReason;

use crate::providers::ProviderError;

/// Why the router moved on from a provider after `error`
pub fn classify_failure(error: &ProviderError) -> FallbackReason {
    match error {
        ProviderError::RateLimited(_) => FallbackReason::RateLimitExceeded,
        ProviderError::Unavailable(_) | ProviderError::Timeout(_) => {
            FallbackReason::ProviderUnavailable
        }
        other => classify_text(&other.to_string()),
    }
}

/// Keyword heuristics over provider error text
pub fn classify_text(text: &str) -> FallbackReason {
    let lower = text.to_lowercase();
    if lower.contains("rate limit") || lower.contains("throttle") {
        FallbackReason::RateLimitExceeded
    } else if lower.contains("unavailable") || lower.contains("timeout") {
        FallbackReason::ProviderUnavailable
    } else if lower.contains("cost") || lower.contains("quota") {
        FallbackReason::CostThreshold
    } else {
        FallbackReason::PrimaryFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn typed_errors() {
        assert_eq!(
            classify_failure(&ProviderError::RateLimited("429".into())),
            FallbackReason::RateLimitExceeded
        );
        assert_eq!(
            classify_failure(&ProviderError::Timeout("30s".into())),
            FallbackReason::ProviderUnavailable
        );
        assert_eq!(
            classify_failure(&ProviderError::Rejected {
                code: "q".into(),
                message: "monthly quota exhausted".into()
            }),
            FallbackReason::CostThreshold
        );
        assert_eq!(
            classify_failure(&ProviderError::Transport("reset by peer".into())),
            FallbackReason::PrimaryFailed
        );
    }

    #[test]
    fn text_heuristics() {
        assert_eq!(classify_text("Request THROTTLED"), FallbackReason::RateLimitExceeded);
        assert_eq!(classify_text("upstream timeout"), FallbackReason::ProviderUnavailable);
        assert_eq!(classify_text("cost too high"), FallbackReason::CostThreshold);
        assert_eq!(classify_text("invalid number"), FallbackReason::PrimaryFailed);
    }
}
